//! Shared lifecycle context
//!
//! One explicitly constructed object, shared as `Arc<LifecycleContext>`,
//! replaces process-wide statics. Producers use it to enqueue events, any
//! component may request a restart through it, and the update pipeline uses
//! it for the task lock. Only the coordinator writes the device state; the
//! context hands out a read-only view.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::lock::TaskLock;
use crate::queue::{EventSender, QueueError};
use crate::types::{DeviceState, Event, LockHolder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RestartSlot {
    Idle,
    Pending(Duration),
    Executing,
}

/// Handle shared by every subsystem
#[derive(Debug)]
pub struct LifecycleContext {
    events: EventSender,
    lock: Arc<TaskLock>,
    restart: Mutex<RestartSlot>,
    state: watch::Receiver<DeviceState>,
}

impl LifecycleContext {
    pub(crate) fn new(
        events: EventSender,
        lock: Arc<TaskLock>,
        state: watch::Receiver<DeviceState>,
    ) -> Self {
        Self {
            events,
            lock,
            restart: Mutex::new(RestartSlot::Idle),
            state,
        }
    }

    /// Current device state, as last published by the coordinator
    pub fn state(&self) -> DeviceState {
        *self.state.borrow()
    }

    /// Subscribe to state changes
    pub fn watch_state(&self) -> watch::Receiver<DeviceState> {
        self.state.clone()
    }

    /// Enqueue an event, waiting at most the configured enqueue wait
    pub async fn submit(&self, event: Event) -> Result<(), QueueError> {
        debug!("Context: Submitting {}", event.kind());
        self.events.submit(event).await
    }

    /// Enqueue without waiting
    pub fn try_submit(&self, event: Event) -> Result<(), QueueError> {
        self.events.try_submit(event)
    }

    /// Report a message bus session change.
    ///
    /// Bus clients call this from their own callbacks, so it never waits.
    pub fn report_bus(&self, connected: bool) {
        let event = if connected {
            Event::BusConnected
        } else {
            Event::BusDisconnected
        };
        if let Err(e) = self.try_submit(event) {
            warn!("Context: Bus status not delivered: {}", e);
        }
    }

    /// Events waiting in the queue
    pub fn queue_depth(&self) -> usize {
        self.events.depth()
    }

    /// Ask for a graceful restart after `delay`.
    ///
    /// The first request wins; later ones are logged and ignored. Returns
    /// whether this call scheduled the restart.
    pub fn request_restart(&self, delay: Duration) -> bool {
        let mut slot = self.restart.lock();
        match *slot {
            RestartSlot::Idle => {
                info!("Context: Restart requested in {:?}", delay);
                *slot = RestartSlot::Pending(delay);
                true
            }
            RestartSlot::Pending(pending) => {
                warn!(
                    "Context: Restart already pending ({:?}), ignoring request for {:?}",
                    pending, delay
                );
                false
            }
            RestartSlot::Executing => {
                warn!("Context: Restart in progress, ignoring request for {:?}", delay);
                false
            }
        }
    }

    /// A restart was requested and has not started yet
    pub fn restart_pending(&self) -> Option<Duration> {
        match *self.restart.lock() {
            RestartSlot::Pending(delay) => Some(delay),
            _ => None,
        }
    }

    /// Move a pending restart to executing; only the consumer loop calls this
    pub(crate) fn claim_restart(&self) -> Option<Duration> {
        let mut slot = self.restart.lock();
        match *slot {
            RestartSlot::Pending(delay) => {
                *slot = RestartSlot::Executing;
                Some(delay)
            }
            _ => None,
        }
    }

    pub fn task_lock(&self) -> &Arc<TaskLock> {
        &self.lock
    }

    /// Ask the coordinator for the task lock and wait for the grant.
    ///
    /// Waits at most the guard timeout. A request that is not granted in
    /// time is withdrawn.
    pub async fn acquire_task_lock(&self) -> Result<(), CoreError> {
        let holder = LockHolder::UpdatePipeline;
        self.lock.request(holder);
        if let Err(e) = self.submit(Event::LockRequested).await {
            self.lock.withdraw(holder);
            return Err(e.into());
        }

        match self
            .lock
            .wait_granted(holder, self.lock.guard_timeout())
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                self.lock.withdraw(holder);
                warn!("Context: Task lock not granted: {}", e);
                Err(e.into())
            }
        }
    }

    /// Release the task lock and tell the coordinator.
    ///
    /// Returns `false` if the guard already reclaimed it.
    pub async fn release_task_lock(&self) -> bool {
        match self.lock.release(LockHolder::UpdatePipeline) {
            Ok(()) => {
                if let Err(e) = self.submit(Event::LockReleased).await {
                    warn!("Context: Lock released but not reported: {}", e);
                }
                true
            }
            Err(e) => {
                warn!("Context: {}", e);
                false
            }
        }
    }
}
