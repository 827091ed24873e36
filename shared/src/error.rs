use std::io;

use thiserror::Error;
use tokio::task::JoinError;

/// Every failure the voter protocol can surface.
///
/// Variants are grouped by how the caller is expected to react: fix the input
/// and retry, retry as-is, restart the whole flow, or report contract drift.
#[derive(Debug, Error)]
pub enum Error {
    /// Local input problem, fixable without touching the network.
    #[error("{0}")]
    Validation(String),
    /// The authority rejected the request. The message is the server's, verbatim.
    #[error("{0}")]
    Auth(String),
    #[error("a vote has already been cast with this identity")]
    AlreadyVoted,
    #[error("verification token has already been used")]
    TokenReuse,
    #[error("verification token has expired or does not exist")]
    TokenExpiredOrNotFound,
    /// A trusted success response was missing a field we cannot proceed without.
    #[error("unexpected response shape from {endpoint}: {detail}")]
    ResponseShape { endpoint: &'static str, detail: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("{phase} timed out")]
    Timeout { phase: &'static str },
    #[error("session expired")]
    SessionExpired,
    #[error("not authenticated")]
    Unauthenticated,
    #[error("not found")]
    NotFound,
    #[error("another request is already in flight")]
    Busy,
    #[error("flow was abandoned before the response arrived")]
    Cancelled,
    #[error("cannot {action} while {phase}")]
    InvalidState {
        action: &'static str,
        phase: &'static str,
    },
    #[error("blinding error: {0}")]
    Blinding(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("serialization error")]
    Serialization,
    #[error("task error")]
    Task,
    #[error("{0}")]
    Other(String),
}

/// Where a failure belongs when shown to a voter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    /// Next to the step that triggered it.
    Inline,
    /// Blocking banner; the current flow cannot continue.
    Banner,
    /// Not for voters. Logged for operators.
    Internal,
}

impl Error {
    /// Retrying the same step, unchanged or with corrected input, may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::Auth(_)
                | Error::Network(_)
                | Error::NotFound
                | Error::Busy
        )
    }

    /// The flow has to be restarted from the beginning, if at all.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::AlreadyVoted
                | Error::SessionExpired
                | Error::Unauthenticated
                | Error::Timeout { .. }
                | Error::TokenReuse
                | Error::TokenExpiredOrNotFound
        )
    }

    pub fn surface(&self) -> Surface {
        match self {
            Error::Validation(_) | Error::Auth(_) | Error::Network(_) | Error::Busy => {
                Surface::Inline
            }
            Error::AlreadyVoted
            | Error::Timeout { .. }
            | Error::SessionExpired
            | Error::Unauthenticated
            | Error::TokenReuse
            | Error::TokenExpiredOrNotFound
            | Error::NotFound
            | Error::Cancelled => Surface::Banner,
            Error::ResponseShape { .. }
            | Error::InvalidState { .. }
            | Error::Blinding(_)
            | Error::Storage(_)
            | Error::Config(_)
            | Error::Serialization
            | Error::Task
            | Error::Other(_) => Surface::Internal,
        }
    }

    pub fn shape(endpoint: &'static str, detail: impl Into<String>) -> Self {
        Error::ResponseShape {
            endpoint,
            detail: detail.into(),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<blind_rsa_signatures::Error> for Error {
    fn from(e: blind_rsa_signatures::Error) -> Self {
        Error::Blinding(e.to_string())
    }
}

impl From<JoinError> for Error {
    fn from(_e: JoinError) -> Self {
        Error::Task
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Network(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(_e: serde_json::Error) -> Self {
        Error::Serialization
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_voted_is_a_blocking_non_retryable_banner() {
        let e = Error::AlreadyVoted;
        assert!(e.is_terminal());
        assert!(!e.is_retryable());
        assert_eq!(e.surface(), Surface::Banner);
    }

    #[test]
    fn shape_errors_stay_out_of_voter_facing_surfaces() {
        let e = Error::shape("create-session", "missing sessionID");
        assert_eq!(e.surface(), Surface::Internal);
        assert!(!e.is_retryable());
        assert_eq!(
            e.to_string(),
            "unexpected response shape from create-session: missing sessionID"
        );
    }

    #[test]
    fn auth_message_is_passed_through_verbatim() {
        let e = Error::Auth("Aadhaar and Voter ID do not match".into());
        assert_eq!(e.to_string(), "Aadhaar and Voter ID do not match");
        assert!(e.is_retryable());
        assert_eq!(e.surface(), Surface::Inline);
    }

    #[test]
    fn token_reuse_is_distinct_from_expiry() {
        assert_ne!(
            Error::TokenReuse.to_string(),
            Error::TokenExpiredOrNotFound.to_string()
        );
    }
}
