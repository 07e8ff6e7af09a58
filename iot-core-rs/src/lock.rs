//! Timeout-guarded task lock
//!
//! A binary token protecting the firmware write path from a concurrent
//! restart. The lock keeps explicit `held_by` / `acquired_at` state; the
//! coordinator's housekeeping tick calls [`TaskLock::reap_expired`] and a
//! holder that overstays the guard is evicted, exactly once, with a warning.
//!
//! The update pipeline never takes the lock itself. It files a request and
//! the coordinator grants it while dispatching `LockRequested`, so a grant
//! can never race the restart sequence.

use parking_lot::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::types::LockHolder;

/// Task lock errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("Task lock is held by {0}")]
    Busy(LockHolder),

    #[error("Timed out waiting for task lock")]
    Timeout,

    #[error("Task lock is not held by {0}")]
    NotHeld(LockHolder),

    #[error("No pending task lock request")]
    NotRequested,
}

#[derive(Debug, Default)]
struct LockState {
    held_by: Option<LockHolder>,
    acquired_at: Option<Instant>,
    requested_by: Option<LockHolder>,
    forced_releases: u64,
}

/// Exclusive token with a guard timeout
#[derive(Debug)]
pub struct TaskLock {
    state: Mutex<LockState>,
    changed: Notify,
    guard_timeout: Duration,
}

impl TaskLock {
    pub fn new(guard_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            changed: Notify::new(),
            guard_timeout,
        }
    }

    pub fn guard_timeout(&self) -> Duration {
        self.guard_timeout
    }

    /// Current holder
    pub fn holder(&self) -> Option<LockHolder> {
        self.state.lock().held_by
    }

    pub fn is_held_by(&self, holder: LockHolder) -> bool {
        self.holder() == Some(holder)
    }

    /// How long the current holder has kept the lock
    pub fn held_for(&self, now: Instant) -> Option<Duration> {
        self.state
            .lock()
            .acquired_at
            .map(|at| now.saturating_duration_since(at))
    }

    /// Number of guard evictions so far
    pub fn forced_releases(&self) -> u64 {
        self.state.lock().forced_releases
    }

    /// Take the lock if it is free
    pub fn try_acquire(&self, holder: LockHolder) -> Result<(), LockError> {
        let mut state = self.state.lock();
        if let Some(current) = state.held_by {
            return Err(LockError::Busy(current));
        }
        state.held_by = Some(holder);
        state.acquired_at = Some(Instant::now());
        if state.requested_by == Some(holder) {
            state.requested_by = None;
        }
        drop(state);

        debug!("Lock: Acquired by {}", holder);
        self.changed.notify_waiters();
        Ok(())
    }

    /// Release the lock; a holder evicted by the guard gets `NotHeld`
    pub fn release(&self, holder: LockHolder) -> Result<(), LockError> {
        let mut state = self.state.lock();
        if state.held_by != Some(holder) {
            return Err(LockError::NotHeld(holder));
        }
        let held = state.acquired_at.map(|at| at.elapsed());
        state.held_by = None;
        state.acquired_at = None;
        drop(state);

        debug!("Lock: Released by {} after {:?}", holder, held);
        self.changed.notify_waiters();
        Ok(())
    }

    /// File a request to be granted by the coordinator
    pub fn request(&self, holder: LockHolder) {
        self.state.lock().requested_by = Some(holder);
    }

    /// Requester waiting for a grant
    pub fn pending(&self) -> Option<LockHolder> {
        self.state.lock().requested_by
    }

    /// Drop a request that was never granted
    pub fn withdraw(&self, holder: LockHolder) {
        let mut state = self.state.lock();
        if state.requested_by == Some(holder) {
            state.requested_by = None;
        }
    }

    /// Grant the pending request, if any
    pub fn grant_pending(&self) -> Result<LockHolder, LockError> {
        let requested = self.state.lock().requested_by;
        match requested {
            Some(holder) => {
                self.try_acquire(holder)?;
                info!("Lock: Granted to {}", holder);
                Ok(holder)
            }
            None => Err(LockError::NotRequested),
        }
    }

    /// Block until `holder` owns the lock or `wait` elapses
    pub async fn wait_granted(&self, holder: LockHolder, wait: Duration) -> Result<(), LockError> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_held_by(holder) {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(LockError::Timeout);
            }
        }
    }

    /// Take the lock, blocking until it is free or `wait` elapses
    pub async fn acquire(&self, holder: LockHolder, wait: Duration) -> Result<(), LockError> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_acquire(holder) {
                Ok(()) => return Ok(()),
                Err(LockError::Busy(_)) => {}
                Err(e) => return Err(e),
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(LockError::Timeout);
            }
        }
    }

    /// Wait for any lock state change, at most `max`
    pub async fn wait_changed(&self, max: Duration) {
        let _ = tokio::time::timeout(max, self.changed.notified()).await;
    }

    /// Evict a holder that has kept the lock past the guard timeout.
    ///
    /// Returns the evicted holder. Each hold is evicted at most once.
    pub fn reap_expired(&self, now: Instant) -> Option<LockHolder> {
        let mut state = self.state.lock();
        let holder = state.held_by?;
        let held = now.saturating_duration_since(state.acquired_at?);
        if held < self.guard_timeout {
            return None;
        }

        state.held_by = None;
        state.acquired_at = None;
        state.forced_releases += 1;
        drop(state);

        warn!(
            "Lock: {} held the task lock for {:?} (guard {:?}), forcing release",
            holder, held, self.guard_timeout
        );
        self.changed.notify_waiters();
        Some(holder)
    }
}
