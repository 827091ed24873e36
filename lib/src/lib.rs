//! Client side of an anonymous voting protocol.
//!
//! A voter proves who they are, gets a short voting session, has a blinded
//! ballot signed and casts it so the authority cannot link the vote back to
//! the identity. Receipts and the one-time choice check come afterwards.

pub mod api;
pub mod blind;
pub mod config;
pub mod otp;
pub mod proof;
pub mod receipt;
pub mod session;
pub mod store;
pub mod timer;
pub mod transport;
pub mod vote;

use std::sync::Arc;

pub use api::{AuthenticatedClient, CastAck, IdentityDetails, OtpDispatch, VoterApi};
pub use ballotbox_shared::{Election, Error, Receipt, VerificationToken, Vote, VoteId};
pub use blind::{Blinder, CommitmentBlinder, RsaBlinder};
pub use config::Config;
pub use proof::{derive_proofs, Credential, ProofSet};
pub use receipt::{PollHandle, PollPolicy, ReceiptTracker};
pub use session::{IdentitySession, Phase, Session, Terminal};
pub use store::{FileStore, MemoryStore, SessionStore};
pub use timer::{TimerKind, TimerService};
pub use transport::{HttpTransport, Role, Transport};
pub use vote::{BlindVoteBuilder, CastOutcome};

use tracing::debug;

/// Everything a voter-role frontend needs, wired from one [`Config`].
pub struct Client<T: Transport = HttpTransport> {
    api: VoterApi<T>,
    config: Config,
}

impl Client<HttpTransport> {
    pub fn new(config: Config) -> Result<Self, Error> {
        let transport = HttpTransport::new(
            &config.api_url,
            Role::Voter,
            &config.voter_api_key,
            config.request_timeout,
        )?;
        debug!("voter client for {}", config.api_url);
        Ok(Self::with_transport(transport, config))
    }
}

impl<T: Transport> Client<T> {
    pub fn with_transport(transport: T, config: Config) -> Self {
        Self {
            api: VoterApi::new(transport),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn api(&self) -> &VoterApi<T> {
        &self.api
    }

    pub async fn active_elections(&self) -> Result<Vec<Election>, Error> {
        self.api.active_elections().await
    }

    /// The file store if a session file is configured, memory otherwise.
    pub fn session_store(&self) -> Arc<dyn SessionStore> {
        match &self.config.session_file {
            Some(path) => Arc::new(FileStore::new(path)),
            None => Arc::new(MemoryStore::new()),
        }
    }

    pub fn identity_session(&self, store: Arc<dyn SessionStore>) -> IdentitySession<T> {
        IdentitySession::new(self.api.clone(), store).with_resend_window(self.config.resend_window)
    }

    /// Must be called from within a tokio runtime.
    pub fn resume_session(&self, store: Arc<dyn SessionStore>) -> Result<IdentitySession<T>, Error> {
        Ok(IdentitySession::resume(self.api.clone(), store)?
            .with_resend_window(self.config.resend_window))
    }

    pub fn vote_builder(&self) -> BlindVoteBuilder {
        BlindVoteBuilder::new(CommitmentBlinder).with_batch_window(self.config.batch_window)
    }

    /// Needs `authority_key` in the config.
    pub fn rsa_vote_builder(&self) -> Result<BlindVoteBuilder<RsaBlinder>, Error> {
        let key = self
            .config
            .authority_key
            .as_deref()
            .ok_or_else(|| Error::Config("no authority key configured".into()))?;
        Ok(BlindVoteBuilder::new(RsaBlinder::from_base58(key)?)
            .with_batch_window(self.config.batch_window))
    }

    pub fn receipts(&self) -> ReceiptTracker<T> {
        ReceiptTracker::new(self.api.clone()).with_policy(self.config.poll)
    }
}
