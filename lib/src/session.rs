//! The voter identity state machine.
//!
//! ```text
//! Unauthenticated -> IdentityVerified -> OtpSent -> SessionActive -> VoteCast
//!                          |                |             |
//!                          +----------------+-------------+--> TerminalFailed
//! ```
//!
//! Every mutating step takes `&mut self`, so a session can only have one
//! request in flight. Timer callbacks run on their own tasks and reach the
//! session through shared state; each records the generation it was started
//! in and becomes a no-op once the flow has been abandoned or restarted.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use ballotbox_shared::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    api::{AuthenticatedClient, IdentityDetails, OtpDispatch, VoterApi},
    otp::OtpCode,
    proof::{derive_proofs, Credential, ProofSet, VoterProof},
    store::SessionStore,
    timer::{TimerKind, TimerService},
    transport::Transport,
};

/// Resend becomes available once this much of the OTP window is left.
pub const DEFAULT_RESEND_WINDOW: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Terminal {
    AlreadyVoted,
    SessionExpired,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Unauthenticated,
    IdentityVerified,
    OtpSent,
    SessionActive,
    VoteCast,
    TerminalFailed(Terminal),
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Unauthenticated => "unauthenticated",
            Phase::IdentityVerified => "identity verified",
            Phase::OtpSent => "awaiting one-time code",
            Phase::SessionActive => "session active",
            Phase::VoteCast => "vote cast",
            Phase::TerminalFailed(Terminal::AlreadyVoted) => "failed: already voted",
            Phase::TerminalFailed(Terminal::SessionExpired) => "failed: session expired",
        }
    }
}

/// An authenticated voting session as granted by the authority.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub bearer_token: String,
    pub expires_at: DateTime<Utc>,
    pub election_id: String,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("bearer_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("election_id", &self.election_id)
            .finish()
    }
}

/// State reachable from timer tasks and authenticated clients.
pub(crate) struct Shared {
    phase: Mutex<Phase>,
    generation: AtomicU64,
    otp_expired: AtomicBool,
    store: Arc<dyn SessionStore>,
}

impl Shared {
    fn new(store: Arc<dyn SessionStore>) -> Self {
        Shared {
            phase: Mutex::new(Phase::Unauthenticated),
            generation: AtomicU64::new(0),
            otp_expired: AtomicBool::new(false),
            store,
        }
    }

    fn phase(&self) -> Phase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn bump(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn clear_store(&self) {
        if let Err(e) = self.store.clear() {
            warn!("could not clear stored session: {}", e);
        }
    }

    fn on_otp_expired(&self, generation: u64) {
        if self.generation() != generation {
            return;
        }
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        if *phase == Phase::OtpSent {
            info!("one-time code expired");
            *phase = Phase::IdentityVerified;
            self.otp_expired.store(true, Ordering::SeqCst);
        }
    }

    fn on_session_expired(&self, generation: u64) {
        if self.generation() != generation {
            return;
        }
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        if *phase == Phase::SessionActive {
            info!("voting session expired");
            *phase = Phase::TerminalFailed(Terminal::SessionExpired);
            self.generation.fetch_add(1, Ordering::SeqCst);
            drop(phase);
            self.clear_store();
        }
    }
}

/// Proof that a session was live when a client was handed out.
#[derive(Clone)]
pub(crate) struct Liveness {
    shared: Arc<Shared>,
    generation: u64,
}

impl Liveness {
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn check(&self) -> Result<(), Error> {
        if self.shared.generation() == self.generation
            && self.shared.phase() == Phase::SessionActive
        {
            Ok(())
        } else {
            Err(Error::Unauthenticated)
        }
    }

    /// The authority no longer accepts our token.
    pub(crate) fn revoke(&self) {
        if self.shared.generation() != self.generation {
            return;
        }
        self.shared.bump();
        self.shared.set_phase(Phase::Unauthenticated);
        self.shared.clear_store();
    }
}

pub struct IdentitySession<T: Transport> {
    api: VoterApi<T>,
    shared: Arc<Shared>,
    timers: TimerService,
    resend_window: Duration,
    election_id: Option<String>,
    credential: Option<Credential>,
    proofs: Option<ProofSet>,
    // Kept past session creation for the last has-voted check.
    voter_proof: Option<VoterProof>,
    identity: Option<IdentityDetails>,
    pre_otp_checked: bool,
    entered_code: Option<OtpCode>,
    otp_verified: bool,
    session: Option<Session>,
}

impl<T: Transport> IdentitySession<T> {
    pub fn new(api: VoterApi<T>, store: Arc<dyn SessionStore>) -> Self {
        Self {
            api,
            shared: Arc::new(Shared::new(store)),
            timers: TimerService::new(),
            resend_window: DEFAULT_RESEND_WINDOW,
            election_id: None,
            credential: None,
            proofs: None,
            voter_proof: None,
            identity: None,
            pre_otp_checked: false,
            entered_code: None,
            otp_verified: false,
            session: None,
        }
    }

    pub fn with_resend_window(mut self, window: Duration) -> Self {
        self.resend_window = window;
        self
    }

    /// Picks up a session persisted before a reload, if it is still valid.
    ///
    /// A resumed session has no voter proof, so the final has-voted check
    /// before signing is left to the authority.
    pub fn resume(api: VoterApi<T>, store: Arc<dyn SessionStore>) -> Result<Self, Error> {
        let stored = store.get()?;
        let mut this = Self::new(api, store);
        match stored {
            Some(session) if !session.is_expired(Utc::now()) => {
                info!("resuming session for election {}", session.election_id);
                this.activate(session);
            }
            Some(_) => {
                debug!("stored session already expired");
                this.shared.clear_store();
            }
            None => {}
        }
        Ok(this)
    }

    pub fn phase(&self) -> Phase {
        self.shared.phase()
    }

    pub fn election_id(&self) -> Option<&str> {
        self.election_id.as_deref()
    }

    pub fn identity(&self) -> Option<&IdentityDetails> {
        self.identity.as_ref()
    }

    /// The active session, if there still is one.
    pub fn session(&self) -> Option<&Session> {
        match self.phase() {
            Phase::SessionActive => self.session.as_ref(),
            _ => None,
        }
    }

    pub fn otp_remaining(&self) -> Option<Duration> {
        match self.phase() {
            Phase::OtpSent => self.timers.remaining(TimerKind::Otp),
            _ => None,
        }
    }

    pub fn session_remaining(&self) -> Option<Duration> {
        match self.phase() {
            Phase::SessionActive => self.timers.remaining(TimerKind::Session),
            _ => None,
        }
    }

    pub fn watch(&self, kind: TimerKind) -> Option<watch::Receiver<Duration>> {
        self.timers.watch(kind)
    }

    pub fn can_resend_otp(&self) -> bool {
        self.otp_remaining()
            .map(|left| left <= self.resend_window)
            .unwrap_or(false)
    }

    /// The code most recently submitted for verification, until a resend clears it.
    pub fn entered_code(&self) -> Option<&OtpCode> {
        self.entered_code.as_ref()
    }

    pub async fn verify_identity(
        &mut self,
        credential: Credential,
        election_id: &str,
    ) -> Result<IdentityDetails, Error> {
        self.sync();
        self.expect("verify identity", &[Phase::Unauthenticated])?;
        let election_id = election_id.trim();
        if election_id.is_empty() {
            return Err(Error::Validation("no election selected".into()));
        }
        let proofs = derive_proofs(&credential);
        let generation = self.shared.generation();
        let details = self
            .api
            .verify_identity(&credential)
            .await
            .map_err(|e| note("identity verification", e))?;
        self.still_current(generation)?;

        self.credential = Some(credential);
        self.proofs = Some(proofs);
        self.election_id = Some(election_id.to_string());
        self.identity = Some(details.clone());
        self.pre_otp_checked = false;
        self.shared.set_phase(Phase::IdentityVerified);
        info!("identity verified for election {}", election_id);
        Ok(details)
    }

    /// Asks the authority whether this identity has already voted.
    ///
    /// Runs once before an OTP is spent and again right before a blind
    /// signature is requested. A positive answer ends the flow for good.
    pub async fn check_not_voted(&mut self) -> Result<(), Error> {
        self.sync();
        self.expect(
            "check voting status",
            &[Phase::IdentityVerified, Phase::OtpSent, Phase::SessionActive],
        )?;
        let held = self
            .proofs
            .as_ref()
            .map(|p| &p.voter_proof)
            .or(self.voter_proof.as_ref());
        let proof = match held {
            Some(proof) => proof.clone(),
            None => {
                debug!("no voter proof held, skipping has-voted check");
                return Ok(());
            }
        };
        let election_id = self.current_election()?;
        let generation = self.shared.generation();
        let voted = self
            .api
            .has_voted(&election_id, &proof)
            .await
            .map_err(|e| note("has-voted check", e))?;
        self.still_current(generation)?;
        if voted {
            warn!("identity has already voted in election {}", election_id);
            self.fail(Terminal::AlreadyVoted);
            return Err(Error::AlreadyVoted);
        }
        if self.phase() == Phase::IdentityVerified {
            self.pre_otp_checked = true;
        }
        Ok(())
    }

    /// Sends a one-time code, or resends it once the resend window opens.
    pub async fn send_otp(&mut self) -> Result<OtpDispatch, Error> {
        self.sync();
        match self.phase() {
            Phase::IdentityVerified => {
                if !self.pre_otp_checked {
                    self.check_not_voted().await?;
                }
            }
            Phase::OtpSent => {
                let left = self.timers.remaining(TimerKind::Otp).unwrap_or(Duration::ZERO);
                if left > self.resend_window {
                    return Err(Error::Validation(format!(
                        "a new code can be requested in {}s",
                        (left - self.resend_window).as_secs()
                    )));
                }
            }
            _ => self.expect("send a one-time code", &[Phase::IdentityVerified])?,
        }
        let credential = self.credential.as_ref().ok_or(Error::InvalidState {
            action: "send a one-time code",
            phase: "no credential held",
        })?;
        let generation = self.shared.generation();
        let dispatch = self
            .api
            .send_otp(credential)
            .await
            .map_err(|e| note("sending one-time code", e))?;
        self.still_current(generation)?;

        self.entered_code = None;
        self.otp_verified = false;
        self.shared.otp_expired.store(false, Ordering::SeqCst);
        let shared = self.shared.clone();
        self.timers.start(TimerKind::Otp, dispatch.expires_at, move || {
            shared.on_otp_expired(generation)
        });
        self.shared.set_phase(Phase::OtpSent);
        info!("one-time code sent, valid until {}", dispatch.expires_at);
        Ok(dispatch)
    }

    pub async fn verify_otp(&mut self, code: &str) -> Result<(), Error> {
        self.sync();
        self.otp_still_valid()?;
        self.expect("verify a one-time code", &[Phase::OtpSent])?;
        let code: OtpCode = code.parse()?;
        self.entered_code = Some(code);
        let credential = self.credential.as_ref().ok_or(Error::InvalidState {
            action: "verify a one-time code",
            phase: "no credential held",
        })?;
        let generation = self.shared.generation();
        self.api
            .verify_otp(credential, &code)
            .await
            .map_err(|e| note("one-time code verification", e))?;
        self.still_current(generation)?;
        self.otp_still_valid()?;
        self.otp_verified = true;
        debug!("one-time code accepted");
        Ok(())
    }

    /// Exchanges a verified code for a voting session bound to the election.
    pub async fn create_session(&mut self, fingerprint_verified: bool) -> Result<Session, Error> {
        self.sync();
        self.otp_still_valid()?;
        self.expect("create a session", &[Phase::OtpSent])?;
        if !self.otp_verified {
            return Err(Error::InvalidState {
                action: "create a session",
                phase: "one-time code not yet verified",
            });
        }
        if !fingerprint_verified {
            return Err(Error::Validation("fingerprint verification is required".into()));
        }
        let election_id = self.current_election()?;
        let credential = self.credential.as_ref().ok_or(Error::InvalidState {
            action: "create a session",
            phase: "no credential held",
        })?;
        let generation = self.shared.generation();
        let session = self
            .api
            .create_session(credential, &election_id, fingerprint_verified)
            .await
            .map_err(|e| note("session creation", e))?;
        self.still_current(generation)?;

        if let Err(e) = self.shared.store.set(&session) {
            warn!("session will not survive a reload: {}", e);
        }
        self.timers.cancel(TimerKind::Otp);
        self.voter_proof = self.proofs.take().map(|p| p.voter_proof);
        self.credential = None;
        self.entered_code = None;
        self.otp_verified = false;
        self.activate(session.clone());
        info!("voting session created, expires {}", session.expires_at);
        Ok(session)
    }

    /// A client for the protected endpoints, valid only while this session is.
    pub fn authenticated(&self) -> Result<AuthenticatedClient<T>, Error> {
        match (self.phase(), self.session.as_ref()) {
            (Phase::SessionActive, Some(session)) => Ok(AuthenticatedClient::new(
                self.api.transport(),
                session,
                Liveness {
                    shared: self.shared.clone(),
                    generation: self.shared.generation(),
                },
            )),
            _ => Err(Error::Unauthenticated),
        }
    }

    /// Drops everything and returns to the start. Late responses to requests
    /// issued before this call are discarded.
    pub fn abandon(&mut self) {
        self.timers.cancel_all();
        self.shared.bump();
        self.shared.clear_store();
        self.clear_local();
        self.election_id = None;
        self.identity = None;
        self.shared.otp_expired.store(false, Ordering::SeqCst);
        self.shared.set_phase(Phase::Unauthenticated);
        debug!("identity session reset");
    }

    pub fn logout(&mut self) {
        info!("logging out");
        self.abandon();
    }

    pub(crate) fn require_active(&mut self, election_id: &str) -> Result<(), Error> {
        self.sync();
        match self.phase() {
            Phase::SessionActive => {}
            Phase::TerminalFailed(Terminal::AlreadyVoted) => return Err(Error::AlreadyVoted),
            Phase::VoteCast => {
                return Err(Error::InvalidState {
                    action: "cast a vote",
                    phase: Phase::VoteCast.name(),
                })
            }
            _ => return Err(Error::Unauthenticated),
        }
        match &self.session {
            Some(session) if session.election_id == election_id => Ok(()),
            Some(_) => Err(Error::Validation(
                "session was created for a different election".into(),
            )),
            None => Err(Error::Unauthenticated),
        }
    }

    /// One vote per session: once cast, the session is spent.
    pub(crate) fn record_vote_cast(&mut self, generation: u64) {
        if self.shared.generation() != generation || self.phase() != Phase::SessionActive {
            debug!("vote recorded after the session was torn down");
            return;
        }
        self.timers.cancel(TimerKind::Session);
        self.shared.bump();
        self.shared.clear_store();
        self.session = None;
        self.voter_proof = None;
        self.shared.set_phase(Phase::VoteCast);
        info!("vote cast, session closed");
    }

    /// The authority refused a vote for this identity. Ends the session for
    /// good unless it was already torn down for another reason.
    pub(crate) fn record_already_voted(&mut self, generation: u64) {
        if self.shared.generation() != generation || self.phase() != Phase::SessionActive {
            return;
        }
        warn!("authority reports this identity has already voted");
        self.fail(Terminal::AlreadyVoted);
    }

    fn activate(&mut self, session: Session) {
        let shared = self.shared.clone();
        let generation = shared.generation();
        self.election_id = Some(session.election_id.clone());
        self.timers.start(TimerKind::Session, session.expires_at, move || {
            shared.on_session_expired(generation)
        });
        self.session = Some(session);
        self.shared.set_phase(Phase::SessionActive);
    }

    fn fail(&mut self, reason: Terminal) {
        self.timers.cancel_all();
        self.shared.bump();
        self.shared.clear_store();
        self.clear_local();
        self.shared.set_phase(Phase::TerminalFailed(reason));
    }

    fn clear_local(&mut self) {
        self.credential = None;
        self.proofs = None;
        self.voter_proof = None;
        self.entered_code = None;
        self.otp_verified = false;
        self.pre_otp_checked = false;
        self.session = None;
    }

    /// Applies whatever timer tasks or revoked clients did in the meantime.
    fn sync(&mut self) {
        if matches!(
            self.phase(),
            Phase::Unauthenticated | Phase::TerminalFailed(_)
        ) && (self.session.is_some() || self.credential.is_some())
        {
            self.timers.cancel_all();
            self.clear_local();
        }
    }

    fn expect(&self, action: &'static str, allowed: &[Phase]) -> Result<(), Error> {
        let phase = self.phase();
        if allowed.contains(&phase) {
            return Ok(());
        }
        Err(match phase {
            Phase::TerminalFailed(Terminal::AlreadyVoted) => Error::AlreadyVoted,
            Phase::TerminalFailed(Terminal::SessionExpired) => Error::SessionExpired,
            _ => Error::InvalidState {
                action,
                phase: phase.name(),
            },
        })
    }

    fn otp_still_valid(&self) -> Result<(), Error> {
        if self.shared.otp_expired.load(Ordering::SeqCst) {
            return Err(Error::Timeout { phase: "otp" });
        }
        Ok(())
    }

    fn still_current(&self, generation: u64) -> Result<(), Error> {
        if self.shared.generation() == generation {
            Ok(())
        } else {
            debug!("discarding response for an abandoned flow");
            Err(Error::Cancelled)
        }
    }

    fn current_election(&self) -> Result<String, Error> {
        self.election_id.clone().ok_or(Error::InvalidState {
            action: "continue",
            phase: "no election selected",
        })
    }
}

/// Logs a failed step with a level that tells user errors from contract drift.
pub(crate) fn note(step: &str, e: Error) -> Error {
    match &e {
        Error::ResponseShape { endpoint, detail } => error!(
            target: "ballotbox::contract",
            "{} failed on a malformed {} response: {}", step, endpoint, detail
        ),
        Error::Network(_) => warn!("{} failed, may be retried: {}", step, e),
        _ => info!("{} rejected: {}", step, e),
    }
    e
}
