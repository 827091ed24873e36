//! After the vote: the permanent receipt and the one-time choice check.

use std::{
    collections::HashSet,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use ballotbox_shared::{Error, Receipt, VerificationToken, VoteId};
use chrono::Utc;
use futures_util::{pin_mut, Stream, StreamExt};
use tokio::{sync::watch, task::JoinHandle, time};
use tracing::{debug, info, trace, warn};

use crate::{
    api::VoterApi,
    session::note,
    timer::{TimerKind, TimerService},
    transport::Transport,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 15,
            interval: Duration::from_secs(2),
        }
    }
}

impl PollPolicy {
    /// The longest a whole poll may take, slow responses included.
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts
    }

    /// Attempt numbers starting at 1, spaced `interval` apart. Nothing is
    /// waited for until the stream is polled, and every call starts afresh.
    pub fn attempts(&self) -> impl Stream<Item = u32> {
        let PollPolicy {
            max_attempts,
            interval,
        } = *self;
        futures_util::stream::unfold(0u32, move |done| async move {
            if done >= max_attempts {
                return None;
            }
            if done > 0 {
                time::sleep(interval).await;
            }
            Some((done + 1, done + 1))
        })
    }
}

async fn poll<T: Transport>(
    api: &VoterApi<T>,
    policy: PollPolicy,
    election_id: &str,
    vote_id: VoteId,
) -> Result<Receipt, Error> {
    let polling = async {
        let attempts = policy.attempts();
        pin_mut!(attempts);
        while let Some(attempt) = attempts.next().await {
            match time::timeout(policy.interval, api.receipt(election_id, &vote_id)).await {
                Ok(Ok(receipt)) => {
                    info!("receipt for {} found on attempt {}", vote_id, attempt);
                    return Some(receipt);
                }
                Ok(Err(Error::NotFound)) => {
                    trace!("receipt for {} not ready ({})", vote_id, attempt)
                }
                Ok(Err(e)) => warn!("receipt poll {} for {} failed: {}", attempt, vote_id, e),
                Err(_) => warn!("receipt poll {} for {} got no answer", attempt, vote_id),
            }
        }
        None
    };
    match time::timeout(policy.budget(), polling).await {
        Ok(Some(receipt)) => Ok(receipt),
        Ok(None) | Err(_) => {
            warn!(
                "no receipt for {} within {} attempts",
                vote_id, policy.max_attempts
            );
            Err(Error::Timeout {
                phase: "receipt polling",
            })
        }
    }
}

/// A receipt poll running on its own task. Dropping the handle stops it.
pub struct PollHandle {
    task: JoinHandle<Result<Receipt, Error>>,
}

impl PollHandle {
    pub async fn wait(mut self) -> Result<Receipt, Error> {
        (&mut self.task).await?
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct ReceiptTracker<T: Transport> {
    api: VoterApi<T>,
    policy: PollPolicy,
    // Digests only; redeemed tokens are not kept around in the clear.
    redeemed: Mutex<HashSet<[u8; 32]>>,
    timers: Mutex<TimerService>,
}

impl<T: Transport> ReceiptTracker<T> {
    pub fn new(api: VoterApi<T>) -> Self {
        Self {
            api,
            policy: PollPolicy::default(),
            redeemed: Mutex::new(HashSet::new()),
            timers: Mutex::new(TimerService::new()),
        }
    }

    pub fn with_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    pub fn attempts(&self) -> impl Stream<Item = u32> {
        self.policy.attempts()
    }

    /// Polls until the receipt appears or the attempt budget runs out.
    pub async fn poll_receipt(&self, election_id: &str, vote_id: VoteId) -> Result<Receipt, Error> {
        poll(&self.api, self.policy, election_id, vote_id).await
    }

    /// Same as [`poll_receipt`](Self::poll_receipt) on a separate task.
    pub fn spawn_poll(&self, election_id: &str, vote_id: VoteId) -> PollHandle {
        let api = self.api.clone();
        let policy = self.policy;
        let election_id = election_id.to_string();
        PollHandle {
            task: tokio::spawn(async move { poll(&api, policy, &election_id, vote_id).await }),
        }
    }

    /// Starts the advisory countdown for a freshly issued token.
    pub fn track_token(&self, token: &VerificationToken) -> Option<watch::Receiver<Duration>> {
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        timers.start(TimerKind::VerificationToken, token.expires_at, || {
            debug!("verification token window closed")
        });
        timers.watch(TimerKind::VerificationToken)
    }

    pub fn token_remaining(&self) -> Option<Duration> {
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remaining(TimerKind::VerificationToken)
    }

    /// Reveals the recorded candidate. Works at most once per token.
    ///
    /// The local expiry is only a hint; the authority decides.
    pub async fn redeem_verification_token(
        &self,
        token: &VerificationToken,
    ) -> Result<String, Error> {
        let key = *blake3::hash(token.token.as_bytes()).as_bytes();
        if self.is_redeemed(&key) {
            debug!("verification token already redeemed here");
            return Err(Error::TokenReuse);
        }
        if token.looks_expired(Utc::now()) {
            debug!("verification token looks expired, asking the authority anyway");
        }
        let candidate = match self.api.verify_choice(&token.token).await {
            Ok(candidate) => candidate,
            Err(e) => {
                // The authority will never accept this token again.
                if matches!(e, Error::TokenReuse | Error::TokenExpiredOrNotFound) {
                    self.stop_token_timer();
                }
                return Err(note("choice verification", e));
            }
        };
        self.redeemed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key);
        self.stop_token_timer();
        info!("verification token redeemed");
        Ok(candidate)
    }

    fn stop_token_timer(&self) {
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel(TimerKind::VerificationToken);
    }

    fn is_redeemed(&self, key: &[u8; 32]) -> bool {
        self.redeemed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }
}
