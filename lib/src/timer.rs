//! Countdowns for the three time-boxed phases of the voter flow.
//!
//! Every countdown is anchored to an absolute expiry issued by the authority.
//! The remaining time is recomputed from that deadline on each tick, so a
//! stalled task never stretches the window.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, trace};

const TICK: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Otp,
    Session,
    VerificationToken,
}

impl TimerKind {
    pub fn name(&self) -> &'static str {
        match self {
            TimerKind::Otp => "otp",
            TimerKind::Session => "session",
            TimerKind::VerificationToken => "verification token",
        }
    }
}

type OnExpire = Box<dyn FnOnce() + Send + 'static>;

/// A 1Hz countdown that runs its callback once when it reaches zero.
///
/// Dropping or cancelling the countdown stops it; a cancelled countdown
/// never fires.
pub struct Countdown {
    kind: TimerKind,
    deadline: Instant,
    fired: Arc<AtomicBool>,
    remaining: watch::Receiver<Duration>,
    task: JoinHandle<()>,
}

impl Countdown {
    /// Must be called from within a tokio runtime.
    pub fn start<F>(kind: TimerKind, expires_at: DateTime<Utc>, on_expire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let left = (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let deadline = Instant::now() + left;
        let fired = Arc::new(AtomicBool::new(false));
        let (tx, rx) = watch::channel(left);
        let mut on_expire: Option<OnExpire> = Some(Box::new(on_expire));

        trace!("{} countdown started, {}s left", kind.name(), left.as_secs());
        let task = {
            let fired = fired.clone();
            tokio::spawn(async move {
                let mut ticker = time::interval(TICK);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = time::sleep_until(deadline) => {}
                    }
                    let left = deadline.saturating_duration_since(Instant::now());
                    let _ = tx.send(left);
                    if left.is_zero() {
                        if !fired.swap(true, Ordering::SeqCst) {
                            debug!("{} countdown expired", kind.name());
                            if let Some(callback) = on_expire.take() {
                                callback();
                            }
                        }
                        break;
                    }
                }
            })
        };

        Countdown {
            kind,
            deadline,
            fired,
            remaining: rx,
            task,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Receives the remaining time once per second.
    pub fn watch(&self) -> watch::Receiver<Duration> {
        self.remaining.clone()
    }

    pub fn cancel(self) {
        drop(self)
    }
}

impl Drop for Countdown {
    fn drop(&mut self) {
        if !self.task.is_finished() {
            trace!("{} countdown cancelled", self.kind.name());
        }
        self.task.abort();
    }
}

/// Owns at most one countdown per [`TimerKind`].
#[derive(Default)]
pub struct TimerService {
    otp: Option<Countdown>,
    session: Option<Countdown>,
    token: Option<Countdown>,
}

impl TimerService {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&mut self, kind: TimerKind) -> &mut Option<Countdown> {
        match kind {
            TimerKind::Otp => &mut self.otp,
            TimerKind::Session => &mut self.session,
            TimerKind::VerificationToken => &mut self.token,
        }
    }

    fn get(&self, kind: TimerKind) -> Option<&Countdown> {
        match kind {
            TimerKind::Otp => self.otp.as_ref(),
            TimerKind::Session => self.session.as_ref(),
            TimerKind::VerificationToken => self.token.as_ref(),
        }
    }

    /// Starts a countdown, replacing (and cancelling) any running one of the same kind.
    pub fn start<F>(&mut self, kind: TimerKind, expires_at: DateTime<Utc>, on_expire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.slot(kind) = Some(Countdown::start(kind, expires_at, on_expire));
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        self.slot(kind).take();
    }

    pub fn cancel_all(&mut self) {
        self.otp.take();
        self.session.take();
        self.token.take();
    }

    pub fn remaining(&self, kind: TimerKind) -> Option<Duration> {
        self.get(kind).map(Countdown::remaining)
    }

    pub fn has_fired(&self, kind: TimerKind) -> bool {
        self.get(kind).map(Countdown::has_fired).unwrap_or(false)
    }

    pub fn is_running(&self, kind: TimerKind) -> bool {
        self.get(kind).map(|c| !c.has_fired()).unwrap_or(false)
    }

    pub fn watch(&self, kind: TimerKind) -> Option<watch::Receiver<Duration>> {
        self.get(kind).map(Countdown::watch)
    }
}
