//! Scoped deadlines for cooperative work
//!
//! A [`Deadline`] bounds one logical unit of work running on a tokio runtime.
//! While armed it owns a timer; when the timer fires it cancels the work's
//! [`CancellationToken`]. On exit the caller reports whether it observed a
//! cancellation, and the deadline tells the two causes apart: its own firing
//! becomes [`Error::Elapsed`], anything else is left to the caller.
//!
//! ```text
//! INIT --enter--> ARMED --exit--> CLOSED
//!                   |
//!                 fires
//!                   v
//!                 FIRED --exit(observed)--> Err(Elapsed)
//! ```
//!
//! Work that finishes while the timer is firing is not reported as timed out:
//! `exit(false)` after a firing still closes cleanly.
//!
//! The runtime is passed in explicitly as a [`Clock`]; nothing here looks up
//! an ambient scheduler except [`Clock::current`].

use std::{
    fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{runtime::Handle, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// The scheduler a deadline is bound to, and its notion of "now"
#[derive(Debug, Clone)]
pub struct Clock {
    handle: Handle,
}

impl Clock {
    pub const fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// The runtime the caller is running on.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| Error::invalid_state(format!("no cooperative scheduler: {e}")))
    }

    /// Current time as the runtime sees it (honors paused test time).
    pub fn now(&self) -> Instant {
        let _entered = self.handle.enter();
        Instant::now()
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    fn call_at(&self, at: Instant, callback: impl FnOnce() + Send + 'static) -> JoinHandle<()> {
        self.handle.spawn(async move {
            tokio::time::sleep_until(at).await;
            callback();
        })
    }
}

/// Lifecycle of a [`Deadline`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Init,
    Armed,
    Fired,
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "INIT"),
            Self::Armed => write!(f, "ARMED"),
            Self::Fired => write!(f, "FIRED"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

#[derive(Debug)]
struct Inner {
    phase: Phase,
    deadline: Option<Instant>,
    /// The work to cancel; set only while armed or fired
    target: Option<CancellationToken>,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every (re)schedule so a superseded timer cannot fire
    generation: u64,
}

impl Inner {
    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn reject(&mut self) {
        self.target = None;
        self.disarm();
    }

    fn fire(&mut self) {
        if self.phase != Phase::Armed {
            return;
        }
        self.phase = Phase::Fired;
        if let Some(target) = &self.target {
            target.cancel();
        }
        // Detach without aborting: this may be running inside the timer task.
        self.timer = None;
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A single-use deadline for one unit of cooperative work
#[derive(Debug)]
pub struct Deadline {
    clock: Clock,
    token: CancellationToken,
    inner: Arc<Mutex<Inner>>,
}

impl Deadline {
    /// Deadline at an absolute instant on `clock`; `None` never fires.
    pub fn at(clock: &Clock, deadline: Option<Instant>) -> Self {
        Self {
            clock: clock.clone(),
            token: CancellationToken::new(),
            inner: Arc::new(Mutex::new(Inner {
                phase: Phase::Init,
                deadline,
                target: None,
                timer: None,
                generation: 0,
            })),
        }
    }

    /// Deadline `delay` from now; `None` never fires.
    pub fn after(clock: &Clock, delay: Option<Duration>) -> Self {
        let deadline = delay.and_then(|d| clock.now().checked_add(d));
        Self::at(clock, deadline)
    }

    /// Make the work's token a child of `parent`, so cancelling `parent`
    /// also cancels the work (and is reported as an external cancellation).
    #[must_use]
    pub fn with_parent(mut self, parent: &CancellationToken) -> Self {
        self.token = parent.child_token();
        self
    }

    /// The token the scoped work must watch
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn phase(&self) -> Phase {
        lock(&self.inner).phase
    }

    /// Whether this deadline fired
    pub fn expired(&self) -> bool {
        self.phase() == Phase::Fired
    }

    pub fn deadline(&self) -> Option<Instant> {
        lock(&self.inner).deadline
    }

    /// `INIT -> ARMED`. A deadline already in the past fires right here.
    pub fn enter(&self) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.phase != Phase::Init {
            return Err(Error::invalid_state(format!("invalid state {}", inner.phase)));
        }
        inner.phase = Phase::Armed;
        inner.target = Some(self.token.clone());
        self.reschedule(&mut inner);
        Ok(())
    }

    /// Move the deadline to an absolute instant.
    pub fn update(&self, deadline: Instant) -> Result<()> {
        let mut inner = lock(&self.inner);
        Self::check_reschedulable(&inner)?;
        inner.disarm();
        inner.deadline = Some(deadline);
        if inner.phase == Phase::Armed {
            self.reschedule(&mut inner);
        }
        Ok(())
    }

    /// Push the deadline later by `delta`.
    pub fn shift(&self, delta: Duration) -> Result<()> {
        let current = self
            .deadline()
            .ok_or_else(|| Error::invalid_state("cannot shift timeout if deadline is not scheduled"))?;
        // Past the end of representable time means never.
        match current.checked_add(delta) {
            Some(deadline) => self.update(deadline),
            None => {
                let mut inner = lock(&self.inner);
                Self::check_reschedulable(&inner)?;
                inner.disarm();
                inner.deadline = None;
                Ok(())
            }
        }
    }

    /// Pull the deadline earlier by `delta`.
    pub fn rewind(&self, delta: Duration) -> Result<()> {
        let current = self
            .deadline()
            .ok_or_else(|| Error::invalid_state("cannot shift timeout if deadline is not scheduled"))?;
        let deadline = current
            .checked_sub(delta)
            .unwrap_or_else(|| self.clock.now());
        self.update(deadline)
    }

    /// Leave the scope.
    ///
    /// With `observed_cancellation` set and the deadline fired, returns
    /// [`Error::Elapsed`] and detaches from the work. Otherwise closes and
    /// disarms; calling it on an already closed deadline is harmless.
    pub fn exit(&self, observed_cancellation: bool) -> Result<()> {
        let mut inner = lock(&self.inner);
        if observed_cancellation && inner.phase == Phase::Fired {
            inner.timer = None;
            inner.target = None;
            return Err(Error::Elapsed);
        }
        inner.phase = Phase::Closed;
        inner.reject();
        Ok(())
    }

    /// Drop the scheduled firing without closing. Only from `INIT` or `ARMED`.
    pub fn reject(&self) -> Result<()> {
        let mut inner = lock(&self.inner);
        match inner.phase {
            Phase::Init | Phase::Armed => {
                inner.reject();
                Ok(())
            }
            phase => Err(Error::invalid_state(format!("invalid state {phase}"))),
        }
    }

    /// Run `work` inside this deadline: enter, race it against the token, exit.
    ///
    /// Returns [`Error::Elapsed`] if the deadline cut it short and
    /// [`Error::Cancelled`] if a parent token did.
    pub async fn run<F>(self, work: F) -> Result<F::Output>
    where
        F: Future,
    {
        self.enter()?;
        let token = self.token();
        let outcome = tokio::select! {
            biased;
            () = token.cancelled() => None,
            output = work => Some(output),
        };
        self.exit(outcome.is_none())?;
        outcome.ok_or(Error::Cancelled)
    }

    fn check_reschedulable(inner: &Inner) -> Result<()> {
        match inner.phase {
            Phase::Closed => Err(Error::invalid_state(
                "cannot reschedule after exit from context manager",
            )),
            Phase::Fired => Err(Error::invalid_state("cannot reschedule expired timeout")),
            Phase::Init | Phase::Armed => Ok(()),
        }
    }

    fn reschedule(&self, inner: &mut Inner) {
        let Some(deadline) = inner.deadline else {
            return;
        };
        inner.disarm();
        inner.generation += 1;

        if deadline <= self.clock.now() {
            inner.fire();
            return;
        }

        let generation = inner.generation;
        let shared = Arc::clone(&self.inner);
        inner.timer = Some(self.clock.call_at(deadline, move || {
            let mut inner = lock(&shared);
            if inner.generation == generation {
                inner.fire();
            }
        }));
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        lock(&self.inner).disarm();
    }
}
