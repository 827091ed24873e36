//! Builds a blinded ballot, gets it signed and casts it.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use ballotbox_shared::{BlindBallot, Error, Nonce, VerificationToken, Vote, VoteId};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::{
    blind::{Blinder, CommitmentBlinder},
    session::{note, IdentitySession},
    transport::Transport,
};

/// Votes cast within the same window share a batch id.
pub const DEFAULT_BATCH_WINDOW: Duration = Duration::from_secs(3600);

/// What the voter keeps after a successful cast.
#[derive(Clone, Debug)]
pub struct CastOutcome {
    pub vote: Vote,
    pub audit_id: Option<String>,
    pub verification: Option<VerificationToken>,
}

impl CastOutcome {
    pub fn vote_id(&self) -> VoteId {
        self.vote.vote_id
    }
}

pub struct BlindVoteBuilder<B: Blinder = CommitmentBlinder> {
    blinder: B,
    batch_window: Duration,
    in_flight: AtomicBool,
}

impl Default for BlindVoteBuilder<CommitmentBlinder> {
    fn default() -> Self {
        Self::new(CommitmentBlinder)
    }
}

struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, Error> {
        if flag.swap(true, Ordering::SeqCst) {
            return Err(Error::Busy);
        }
        Ok(InFlight(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<B: Blinder> BlindVoteBuilder<B> {
    pub fn new(blinder: B) -> Self {
        Self {
            blinder,
            batch_window: DEFAULT_BATCH_WINDOW,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn with_batch_window(mut self, window: Duration) -> Self {
        self.batch_window = window.max(Duration::from_secs(1));
        self
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// `batch_<n>`, where n counts whole windows since the unix epoch.
    pub fn batch_id(&self, at: DateTime<Utc>) -> String {
        let window = self.batch_window.as_secs().max(1) as i64;
        format!("batch_{}", at.timestamp().div_euclid(window))
    }

    /// Casts a vote for `candidate_id` in `election_id`.
    ///
    /// The authority only ever sees the blinded envelope while signing and
    /// the unlinkable vote while casting. If signing fails nothing is cast
    /// and the session stays usable. A successful cast ends the session.
    pub async fn build_and_submit<T: Transport>(
        &self,
        session: &mut IdentitySession<T>,
        election_id: &str,
        candidate_id: &str,
    ) -> Result<CastOutcome, Error> {
        let _guard = InFlight::acquire(&self.in_flight)?;

        session.require_active(election_id)?;
        let candidate_id = candidate_id.trim();
        if candidate_id.is_empty() {
            return Err(Error::Validation("no candidate selected".into()));
        }

        // Last look before the authority signs anything.
        session.check_not_voted().await?;
        let client = session.authenticated()?;
        let generation = client.generation();

        let vote_id = VoteId::random();
        let nonce = Nonce::random();
        let ballot = BlindBallot::new(election_id, candidate_id);
        let blinded = self.blinder.blind(&ballot)?;
        debug!("ballot blinded for election {}", election_id);

        let signed = match client
            .request_blind_signature(&blinded.envelope, &nonce)
            .await
        {
            Ok(signed) => signed,
            Err(e) => return Err(refused(session, generation, "blind signature request", e)),
        };
        if !client.is_live() {
            debug!("session ended while the ballot was being signed");
            return Err(Error::Cancelled);
        }
        if let Some(audit) = &signed.audit_id {
            debug!("signature issued under audit id {}", audit);
        }

        let signature = self.blinder.finalize(&ballot, &blinded.secret, &signed)?;
        let vote = Vote::assemble(vote_id, &ballot, signature, self.batch_id(Utc::now()));

        let ack = match client.cast_vote(&vote).await {
            Ok(ack) => ack,
            Err(e) => return Err(refused(session, generation, "casting vote", e)),
        };
        session.record_vote_cast(generation);
        if ack.vote_id != vote.vote_id {
            warn!("authority acknowledged {} for submitted {}", ack.vote_id, vote.vote_id);
        }
        info!("vote {} cast in batch {}", vote.vote_id, vote.batch_id);

        Ok(CastOutcome {
            vote,
            audit_id: signed.audit_id,
            verification: ack.verification,
        })
    }
}

/// Logs a failed authenticated call. An already-voted answer is terminal
/// for the session.
fn refused<T: Transport>(
    session: &mut IdentitySession<T>,
    generation: u64,
    step: &str,
    e: Error,
) -> Error {
    let e = note(step, e);
    if matches!(e, Error::AlreadyVoted) {
        session.record_already_voted(generation);
    }
    e
}
