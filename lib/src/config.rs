use std::{env::var, path::PathBuf, str::FromStr, time::Duration};

use ballotbox_shared::Error;

use crate::{receipt::PollPolicy, session::DEFAULT_RESEND_WINDOW, vote::DEFAULT_BATCH_WINDOW};

#[derive(Clone, Debug)]
pub struct Config {
    pub api_url: String,
    pub voter_api_key: String,
    pub request_timeout: Duration,
    pub poll: PollPolicy,
    pub resend_window: Duration,
    pub batch_window: Duration,
    /// Persist the session here instead of in memory.
    pub session_file: Option<PathBuf>,
    /// Base58 DER RSA key; when set, ballots are RSA-blinded.
    pub authority_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api_url: "http://localhost:8080".to_owned(),
            voter_api_key: String::new(),
            request_timeout: Duration::from_secs(30),
            poll: PollPolicy::default(),
            resend_window: DEFAULT_RESEND_WINDOW,
            batch_window: DEFAULT_BATCH_WINDOW,
            session_file: None,
            authority_key: None,
        }
    }
}

impl Config {
    /// Reads `BALLOTBOX_*` variables over the defaults.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty());
        let mut config = Config::default();

        if let Some(url) = get("BALLOTBOX_API_URL") {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(Error::Config(format!(
                    "BALLOTBOX_API_URL must be an http(s) URL, got {}",
                    url
                )));
            }
            config.api_url = url.trim_end_matches('/').to_owned();
        }
        if let Some(key) = get("BALLOTBOX_VOTER_API_KEY") {
            config.voter_api_key = key;
        }
        if let Some(secs) = get("BALLOTBOX_TIMEOUT_SECS") {
            config.request_timeout = Duration::from_secs(number("BALLOTBOX_TIMEOUT_SECS", &secs)?);
        }
        if let Some(ms) = get("BALLOTBOX_POLL_INTERVAL_MS") {
            config.poll.interval = Duration::from_millis(number("BALLOTBOX_POLL_INTERVAL_MS", &ms)?);
        }
        if let Some(n) = get("BALLOTBOX_POLL_ATTEMPTS") {
            config.poll.max_attempts = number("BALLOTBOX_POLL_ATTEMPTS", &n)?;
        }
        if let Some(secs) = get("BALLOTBOX_RESEND_WINDOW_SECS") {
            config.resend_window =
                Duration::from_secs(number("BALLOTBOX_RESEND_WINDOW_SECS", &secs)?);
        }
        if let Some(secs) = get("BALLOTBOX_BATCH_WINDOW_SECS") {
            config.batch_window = Duration::from_secs(number("BALLOTBOX_BATCH_WINDOW_SECS", &secs)?);
        }
        config.session_file = get("BALLOTBOX_SESSION_FILE").map(PathBuf::from);
        config.authority_key = get("BALLOTBOX_AUTHORITY_KEY");

        if config.poll.max_attempts == 0 {
            return Err(Error::Config("BALLOTBOX_POLL_ATTEMPTS must be at least 1".into()));
        }
        if config.batch_window.is_zero() {
            return Err(Error::Config("BALLOTBOX_BATCH_WINDOW_SECS must be positive".into()));
        }
        Ok(config)
    }
}

fn number<N: FromStr>(key: &str, value: &str) -> Result<N, Error> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("{} must be a whole number, got {:?}", key, value)))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.api_url, "http://localhost:8080");
        assert_eq!(config.poll, PollPolicy::default());
        assert_eq!(config.resend_window, Duration::from_secs(60));
        assert_eq!(config.batch_window, Duration::from_secs(3600));
        assert!(config.session_file.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let config = Config::from_lookup(lookup(&[
            ("BALLOTBOX_API_URL", "https://vote.example.in/"),
            ("BALLOTBOX_VOTER_API_KEY", " k-123 "),
            ("BALLOTBOX_POLL_INTERVAL_MS", "500"),
            ("BALLOTBOX_POLL_ATTEMPTS", "4"),
            ("BALLOTBOX_SESSION_FILE", "/tmp/ballotbox.json"),
        ]))
        .unwrap();
        assert_eq!(config.api_url, "https://vote.example.in");
        assert_eq!(config.voter_api_key, "k-123");
        assert_eq!(config.poll.interval, Duration::from_millis(500));
        assert_eq!(config.poll.max_attempts, 4);
        assert_eq!(config.session_file, Some(PathBuf::from("/tmp/ballotbox.json")));
    }

    #[test]
    fn bad_values_are_config_errors() {
        for pairs in [
            [("BALLOTBOX_API_URL", "ftp://x")],
            [("BALLOTBOX_TIMEOUT_SECS", "soon")],
            [("BALLOTBOX_POLL_ATTEMPTS", "0")],
            [("BALLOTBOX_BATCH_WINDOW_SECS", "-5")],
        ] {
            assert!(matches!(
                Config::from_lookup(lookup(&pairs)),
                Err(Error::Config(_))
            ));
        }
    }
}
