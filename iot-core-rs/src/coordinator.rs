//! Lifecycle coordinator
//!
//! Sole consumer of the event queue and sole writer of [`DeviceState`].
//!
//! ```text
//!  Connectivity ─┐                       ┌──────────────┐
//!  Provisioning ─┼──► bounded FIFO ──►   │ consumer loop│──► Machine::step
//!  Update ───────┘                       │  housekeeping│      │
//!                                        │  restart     │      ▼
//!                                        └──────────────┘   effects
//!                                                  (indicator, restart, lock, bus)
//! ```
//!
//! Transitions are computed by [`Machine::step`], a pure function of the
//! current machine and one event. The coordinator applies the returned
//! effects. A restart is entered through [`LifecycleContext::request_restart`]
//! and executed by the loop: settle, stop subsystems, final delay, reset.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{CoreConfig, RestartConfig};
use crate::context::LifecycleContext;
use crate::error::CoreError;
use crate::hal::{Indicator, MessageBus, Platform, Startable};
use crate::lock::LockError;
use crate::queue::{event_queue, EventReceiver};
use crate::storage::{load_json, KeyValueStore, StorageError, CREDENTIALS_KEY, IDENTITY_KEY};
use crate::types::{DeviceIdentity, DeviceState, Event, IndicatorMode, LockHolder, NetworkCredentials};

// ============================================================================
// Transition table
// ============================================================================

/// Side effect requested by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    SetIndicator(IndicatorMode),
    ScheduleRestart(Duration),
    /// Hand the task lock to the pending requester
    GrantTaskLock,
    SyncClock,
    ConnectBus,
    ReconnectBus,
}

/// Coordinator-owned state that transitions depend on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Machine {
    pub state: DeviceState,
    /// State to return to when an update ends without a restart
    pub resume: Option<DeviceState>,
    /// Set after the first successful connection of this boot
    pub has_connected: bool,
}

impl Default for Machine {
    fn default() -> Self {
        Self {
            state: DeviceState::Initial,
            resume: None,
            has_connected: false,
        }
    }
}

/// Result of one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: Machine,
    pub effects: Vec<Effect>,
}

impl Machine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute the next machine and its effects for one event
    pub fn step(&self, event: &Event, restart: &RestartConfig) -> Transition {
        use DeviceState::*;

        let mut next = *self;
        let mut effects = Vec::new();

        if self.state.is_terminal() {
            return Transition { next, effects };
        }

        match event {
            Event::ProvisioningStarted => {
                next.state = Configuring;
                effects.push(Effect::SetIndicator(IndicatorMode::FastBlink));
            }
            Event::ProvisioningSucceeded => {
                next.state = Configured;
                effects.push(Effect::SetIndicator(IndicatorMode::Static));
                effects.push(Effect::ScheduleRestart(restart.safe_delay));
            }
            Event::ProvisioningFinished => {}
            Event::ProvisioningFailed => {
                effects.push(Effect::ScheduleRestart(Duration::ZERO));
            }

            Event::NetworkStarted => {
                if self.state == Initial {
                    next.state = Connecting;
                    effects.push(Effect::SetIndicator(IndicatorMode::SlowBlink));
                }
            }
            Event::NetworkConnected => match self.state {
                // Provisioning-mode association, the session decides
                Configuring => {}
                s if s.is_updating() => next.resume = Some(Connected),
                _ => {
                    next.state = Connected;
                    effects.push(Effect::SetIndicator(IndicatorMode::Static));
                    if self.has_connected {
                        effects.push(Effect::ReconnectBus);
                    } else {
                        next.has_connected = true;
                        effects.push(Effect::SyncClock);
                        effects.push(Effect::ConnectBus);
                    }
                }
            },
            Event::NetworkDisconnected | Event::NetworkReconnecting { .. } => match self.state {
                Configuring | Connecting => {}
                s if s.is_updating() => next.resume = Some(Connecting),
                _ => {
                    next.state = Connecting;
                    effects.push(Effect::SetIndicator(IndicatorMode::SlowBlink));
                }
            },
            Event::NetworkConnectionFailed { .. } => match self.state {
                Configuring => effects.push(Effect::ScheduleRestart(Duration::ZERO)),
                Initial => {
                    next.state = Connecting;
                    effects.push(Effect::SetIndicator(IndicatorMode::SlowBlink));
                }
                _ => {}
            },
            Event::NetworkReconnectExhausted => {
                if self.state.is_updating() {
                    next.resume = Some(Error);
                } else {
                    next.state = Error;
                    effects.push(Effect::SetIndicator(IndicatorMode::SlowBlink));
                }
                if restart.restart_on_exhaustion {
                    effects.push(Effect::ScheduleRestart(Duration::ZERO));
                }
            }

            Event::UpdateRequested => {
                if !self.state.is_updating() {
                    next.resume = Some(self.state);
                    next.state = Updating;
                }
            }
            Event::LockRequested => {
                if self.state != Locked {
                    if next.resume.is_none() {
                        next.resume = Some(self.state);
                    }
                    next.state = Locked;
                }
                // Already Locked can still mean a free lock and a waiting request
                effects.push(Effect::GrantTaskLock);
            }
            Event::LockReleased => {
                if self.state == Locked {
                    next.state = Updating;
                }
            }
            Event::UpdateCompleted { .. } => {
                next.resume = None;
                effects.push(Effect::ScheduleRestart(restart.default_delay));
            }
            Event::UpdateFailed { .. } => {
                if self.state.is_updating() {
                    next.state = next.resume.take().unwrap_or(self.state);
                }
            }

            Event::RestartRequested { delay } => {
                effects.push(Effect::ScheduleRestart(delay.unwrap_or(restart.safe_delay)));
            }

            Event::BusConnected => {}
            Event::BusDisconnected => {
                if self.state == Connected {
                    effects.push(Effect::ReconnectBus);
                }
            }
        }

        Transition { next, effects }
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// What one dispatch did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub event: Event,
    pub before: DeviceState,
    pub after: DeviceState,
    pub effects: Vec<Effect>,
}

impl DispatchOutcome {
    pub fn changed(&self) -> bool {
        self.before != self.after
    }
}

/// How the device came up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootMode {
    /// No stored credentials; start the provisioning session
    Provisioning,
    /// Credentials present; start the connectivity manager
    Station { credentials: NetworkCredentials },
}

/// Summary of the restart sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub delay: Duration,
    pub stopped: Vec<String>,
    pub failed: Vec<String>,
}

/// Owner of the device state and the event loop
pub struct Coordinator {
    config: CoreConfig,
    machine: Machine,
    ctx: Arc<LifecycleContext>,
    events: EventReceiver,
    state_tx: watch::Sender<DeviceState>,
    indicator: Arc<dyn Indicator>,
    platform: Arc<dyn Platform>,
    bus: Option<Box<dyn MessageBus>>,
    subsystems: Vec<Box<dyn Startable>>,
    identity: Option<DeviceIdentity>,
    last_diagnostics: Instant,
}

impl Coordinator {
    pub fn new(config: CoreConfig, indicator: Arc<dyn Indicator>, platform: Arc<dyn Platform>) -> Self {
        let (tx, events) = event_queue(config.queue_capacity, config.enqueue_wait);
        let (state_tx, state_rx) = watch::channel(DeviceState::Initial);
        let lock = Arc::new(crate::lock::TaskLock::new(config.lock.guard_timeout));
        let ctx = Arc::new(LifecycleContext::new(tx, lock, state_rx));

        Self {
            config,
            machine: Machine::new(),
            ctx,
            events,
            state_tx,
            indicator,
            platform,
            bus: None,
            subsystems: Vec::new(),
            identity: None,
            last_diagnostics: Instant::now(),
        }
    }

    /// Attach the optional message bus client
    pub fn with_bus(mut self, mut bus: Box<dyn MessageBus>) -> Self {
        bus.attach(self.ctx.clone());
        self.bus = Some(bus);
        self
    }

    /// Add a subsystem to the shutdown sweep; stopped in registration order
    pub fn register(&mut self, subsystem: Box<dyn Startable>) {
        debug!("Coordinator: Registered subsystem {}", subsystem.name());
        self.subsystems.push(subsystem);
    }

    pub fn context(&self) -> Arc<LifecycleContext> {
        self.ctx.clone()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn state(&self) -> DeviceState {
        self.machine.state
    }

    pub fn machine(&self) -> Machine {
        self.machine
    }

    pub fn identity(&self) -> Option<&DeviceIdentity> {
        self.identity.as_ref()
    }

    #[cfg(test)]
    pub(crate) fn events_mut(&mut self) -> &mut EventReceiver {
        &mut self.events
    }

    /// Decide the boot path from the stored records.
    ///
    /// Missing or corrupt credentials select provisioning. An unreadable
    /// identity falls back to a MAC derived one.
    pub fn boot(&mut self, store: &dyn KeyValueStore) -> Result<BootMode, CoreError> {
        self.indicator.set_mode(IndicatorMode::SlowBlink);

        let credentials = match load_json::<NetworkCredentials>(store, CREDENTIALS_KEY) {
            Ok(credentials) => credentials,
            Err(e @ StorageError::Corrupt { .. }) => {
                warn!("Coordinator: Discarding stored credentials: {}", e);
                None
            }
            Err(e) => return Err(e.into()),
        };

        let Some(credentials) = credentials else {
            info!("Coordinator: No stored credentials, starting provisioning");
            return Ok(BootMode::Provisioning);
        };

        let mac = self.platform.mac();
        let identity = match load_json::<DeviceIdentity>(store, IDENTITY_KEY) {
            Ok(Some(identity)) => identity,
            Ok(None) => {
                warn!("Coordinator: No identity record, using defaults");
                DeviceIdentity::fallback(mac)
            }
            Err(e) => {
                warn!("Coordinator: Failed to load identity ({}), using defaults", e);
                DeviceIdentity::fallback(mac)
            }
        };

        info!(
            "Coordinator: Booting as \"{}\" (uuid={}, ssid={})",
            identity.friendly_name, identity.unique_id, credentials.ssid
        );
        self.identity = Some(identity);
        Ok(BootMode::Station { credentials })
    }

    /// Apply one event: transition, publish, run effects
    pub fn dispatch(&mut self, event: Event) -> DispatchOutcome {
        let before = self.machine.state;
        let kind = event.kind();

        if before.is_terminal() {
            debug!("Coordinator: Ignoring {} while restarting", kind);
            return DispatchOutcome {
                event,
                before,
                after: before,
                effects: Vec::new(),
            };
        }

        match &event {
            Event::UpdateCompleted { version } => info!("Coordinator: Update to {} completed", version),
            Event::UpdateFailed { reason } => warn!("Coordinator: Update failed: {}", reason),
            Event::NetworkReconnecting { attempt, interval } => {
                debug!("Coordinator: Reconnect attempt {} every {:?}", attempt, interval)
            }
            Event::NetworkReconnectExhausted => error!("Coordinator: Network reconnects exhausted"),
            Event::NetworkConnectionFailed { auth: true } => {
                warn!("Coordinator: Association rejected credentials")
            }
            Event::BusDisconnected => info!("Coordinator: Message bus session lost"),
            _ => {}
        }

        // Releases are submitted after the fact; one that arrives once the
        // lock was handed to the next upload belongs to the previous hold
        if matches!(event, Event::LockReleased) && self.ctx.task_lock().is_held_by(LockHolder::UpdatePipeline) {
            debug!("Coordinator: Stale {} ignored, task lock already granted again", kind);
            return DispatchOutcome {
                event,
                before,
                after: before,
                effects: Vec::new(),
            };
        }

        let Transition { next, effects } = self.machine.step(&event, &self.config.restart);
        self.machine = next;
        if next.state != before {
            info!("Coordinator: {} -> {} ({})", before, next.state, kind);
            self.publish();
        } else {
            debug!("Coordinator: {} handled in {}", kind, before);
        }

        for effect in &effects {
            self.apply(effect);
        }
        if matches!(event, Event::LockReleased) {
            self.grant_waiting();
        }

        DispatchOutcome {
            event,
            before,
            after: self.machine.state,
            effects,
        }
    }

    fn apply(&mut self, effect: &Effect) {
        match effect {
            Effect::SetIndicator(mode) => self.indicator.set_mode(*mode),
            Effect::ScheduleRestart(delay) => {
                self.request_restart(*delay);
            }
            Effect::GrantTaskLock => {
                let lock = self.ctx.task_lock().clone();
                match lock.grant_pending() {
                    Ok(holder) => debug!("Coordinator: Task lock handed to {}", holder),
                    Err(LockError::Busy(holder)) => {
                        debug!("Coordinator: Request kept until {} releases the task lock", holder)
                    }
                    Err(e) if lock.holder().is_none() => {
                        warn!("Coordinator: Could not grant task lock: {}", e);
                        self.dispatch(Event::LockReleased);
                    }
                    Err(e) => debug!("Coordinator: {}", e),
                }
            }
            Effect::SyncClock => {
                let timezone = self
                    .identity
                    .as_ref()
                    .map(|i| i.timezone.clone())
                    .unwrap_or_else(|| self.config.timezone.clone());
                info!("Coordinator: Synchronizing clock [timezone: {}]", timezone);
                self.platform.sync_clock(&timezone);
            }
            Effect::ConnectBus => {
                let mac = self.platform.mac();
                let client_id = self
                    .identity
                    .as_ref()
                    .map(|i| i.client_id(mac))
                    .unwrap_or_else(|| DeviceIdentity::fallback(mac).client_id(mac));
                if let Some(bus) = self.bus.as_mut() {
                    info!("Coordinator: Connecting message bus as {}", client_id);
                    if let Err(e) = bus.connect(&client_id) {
                        warn!("Coordinator: Message bus connect failed: {}", e);
                    }
                }
            }
            Effect::ReconnectBus => {
                if let Some(bus) = self.bus.as_mut() {
                    if !bus.connected() {
                        info!("Coordinator: Reconnecting message bus");
                        if let Err(e) = bus.reconnect() {
                            warn!("Coordinator: Message bus reconnect failed: {}", e);
                        }
                    }
                }
            }
        }
    }

    /// Hand a free lock to a request filed while it was still held
    fn grant_waiting(&mut self) {
        let lock = self.ctx.task_lock();
        if self.machine.state.is_terminal() || lock.holder().is_some() || lock.pending().is_none() {
            return;
        }
        debug!("Coordinator: Granting task lock to waiting request");
        self.dispatch(Event::LockRequested);
    }

    /// Schedule a restart and enter `Restarting`.
    ///
    /// Returns whether this call scheduled it; repeats are logged and ignored.
    pub fn request_restart(&mut self, delay: Duration) -> bool {
        if self.machine.state.is_terminal() {
            warn!(
                "Coordinator: Already restarting, ignoring restart in {:?}",
                delay
            );
            return false;
        }
        let scheduled = self.ctx.request_restart(delay);
        self.enter_restarting();
        scheduled
    }

    fn enter_restarting(&mut self) {
        if self.machine.state != DeviceState::Restarting {
            info!("Coordinator: {} -> {}", self.machine.state, DeviceState::Restarting);
            self.machine.state = DeviceState::Restarting;
            self.publish();
        }
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.machine.state);
    }

    /// Periodic work: lock guard and diagnostics
    pub fn housekeeping(&mut self, now: Instant) {
        if let Some(holder) = self.ctx.task_lock().reap_expired(now) {
            if holder == LockHolder::UpdatePipeline {
                self.dispatch(Event::LockReleased);
            }
        }

        if now.saturating_duration_since(self.last_diagnostics) >= self.config.diagnostics_interval {
            self.last_diagnostics = now;
            let diagnostics = self.platform.diagnostics();
            info!(
                "Coordinator: state={} queue={}/{} lock={:?} heap={:?} min_heap={:?} stack_hwm={:?}",
                self.machine.state,
                self.ctx.queue_depth(),
                self.config.queue_capacity,
                self.ctx.task_lock().holder(),
                diagnostics.free_heap,
                diagnostics.min_free_heap,
                diagnostics.stack_high_water,
            );
        }
    }

    /// One consumer iteration: housekeeping, then at most one event
    pub async fn poll_once(&mut self) -> Option<DispatchOutcome> {
        let poll = self.config.poll_interval;
        self.housekeeping(Instant::now());

        // An update owns the device until the lock comes back
        if self.ctx.task_lock().is_held_by(LockHolder::UpdatePipeline) {
            self.ctx.task_lock().wait_changed(poll).await;
            return None;
        }

        let event = self.events.recv_timeout(poll).await?;
        Some(self.dispatch(event))
    }

    /// Consumer loop; returns after the hardware reset call
    pub async fn run(mut self) -> ShutdownReport {
        info!("Coordinator: Consumer loop started in {}", self.machine.state);

        loop {
            if let Some(delay) = self.ctx.claim_restart() {
                self.enter_restarting();
                return self.restart_sequence(delay).await;
            }
            self.poll_once().await;
        }
    }

    async fn take_lock_for_restart(&mut self) {
        let lock = self.ctx.task_lock().clone();
        loop {
            match lock.try_acquire(LockHolder::Coordinator) {
                Ok(()) => return,
                Err(LockError::Busy(holder)) => {
                    info!("Coordinator: Waiting for {} before restart", holder);
                    lock.wait_changed(self.config.poll_interval).await;
                    lock.reap_expired(Instant::now());
                }
                Err(e) => {
                    warn!("Coordinator: {}", e);
                    return;
                }
            }
        }
    }

    async fn restart_sequence(&mut self, delay: Duration) -> ShutdownReport {
        info!("Coordinator: Restart sequence started (delay {:?})", delay);
        self.take_lock_for_restart().await;

        let started = Instant::now();
        let restart = self.config.restart.clone();
        let mut report = ShutdownReport {
            delay,
            stopped: Vec::new(),
            failed: Vec::new(),
        };

        tokio::time::sleep(restart.settle).await;

        for subsystem in self.subsystems.iter_mut() {
            let name = subsystem.name().to_string();
            match subsystem.stop() {
                Ok(()) => {
                    info!("Coordinator: Stopped {}", name);
                    report.stopped.push(name);
                }
                Err(e) => {
                    warn!("Coordinator: Failed to stop {}: {}", name, e);
                    report.failed.push(name);
                }
            }
            tokio::time::sleep(restart.stop_gap).await;
        }

        let remaining = delay.saturating_sub(started.elapsed());
        if !remaining.is_zero() {
            debug!("Coordinator: Final delay {:?}", remaining);
            tokio::time::sleep(remaining).await;
        }

        info!("Coordinator: Resetting device");
        self.indicator.set_mode(IndicatorMode::Off);
        self.platform.reset();
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{MemoryBus, NoopPlatform, RecordingIndicator};
    use crate::storage::{save_json, MemoryStore};
    use crate::types::MacAddress;
    use parking_lot::Mutex;

    struct StopRecorder {
        name: &'static str,
        fail: bool,
        log: Arc<Mutex<Vec<(&'static str, Instant)>>>,
    }

    impl Startable for StopRecorder {
        fn name(&self) -> &str {
            self.name
        }
        fn start(&mut self) -> Result<(), CoreError> {
            Ok(())
        }
        fn stop(&mut self) -> Result<(), CoreError> {
            self.log.lock().push((self.name, Instant::now()));
            if self.fail {
                Err(CoreError::subsystem(self.name, "stuck"))
            } else {
                Ok(())
            }
        }
        fn started(&self) -> bool {
            true
        }
    }

    fn coordinator() -> (Coordinator, Arc<RecordingIndicator>, Arc<NoopPlatform>) {
        let indicator = Arc::new(RecordingIndicator::new());
        let platform = Arc::new(NoopPlatform::new(MacAddress([0, 1, 2, 3, 4, 5])));
        let coordinator = Coordinator::new(CoreConfig::default(), indicator.clone(), platform.clone());
        (coordinator, indicator, platform)
    }

    fn step(machine: Machine, event: Event) -> Transition {
        machine.step(&event, &RestartConfig::default())
    }

    #[test]
    fn test_provisioning_success_schedules_safe_restart() {
        let machine = Machine {
            state: DeviceState::Configuring,
            ..Machine::new()
        };
        let t = step(machine, Event::ProvisioningSucceeded);
        assert_eq!(t.next.state, DeviceState::Configured);
        assert!(t
            .effects
            .contains(&Effect::ScheduleRestart(RestartConfig::default().safe_delay)));
    }

    #[test]
    fn test_connection_failure_while_configuring_restarts_now() {
        let machine = Machine {
            state: DeviceState::Configuring,
            ..Machine::new()
        };
        let t = step(machine, Event::NetworkConnectionFailed { auth: true });
        assert_eq!(t.effects, vec![Effect::ScheduleRestart(Duration::ZERO)]);

        let t = step(machine, Event::NetworkConnected);
        assert_eq!(t.next.state, DeviceState::Configuring);
        assert!(t.effects.is_empty());
    }

    #[test]
    fn test_first_connection_syncs_clock_and_bus() {
        let t = step(Machine::new(), Event::NetworkConnected);
        assert_eq!(t.next.state, DeviceState::Connected);
        assert!(t.next.has_connected);
        assert_eq!(
            t.effects,
            vec![
                Effect::SetIndicator(IndicatorMode::Static),
                Effect::SyncClock,
                Effect::ConnectBus
            ]
        );

        let t = step(t.next, Event::NetworkDisconnected);
        assert_eq!(t.next.state, DeviceState::Connecting);
        let t = step(t.next, Event::NetworkConnected);
        assert!(t.effects.contains(&Effect::ReconnectBus));
        assert!(!t.effects.contains(&Effect::ConnectBus));
    }

    #[test]
    fn test_update_failure_restores_prior_state() {
        let connected = Machine {
            state: DeviceState::Connected,
            has_connected: true,
            resume: None,
        };
        let t = step(connected, Event::UpdateRequested);
        assert_eq!(t.next.state, DeviceState::Updating);
        let t = step(t.next, Event::LockRequested);
        assert_eq!(t.next.state, DeviceState::Locked);
        assert_eq!(t.effects, vec![Effect::GrantTaskLock]);
        let t = step(t.next, Event::LockReleased);
        assert_eq!(t.next.state, DeviceState::Updating);
        let t = step(
            t.next,
            Event::UpdateFailed {
                reason: "cut".into(),
            },
        );
        assert_eq!(t.next.state, DeviceState::Connected);
        assert!(t.effects.is_empty());
    }

    #[test]
    fn test_disconnect_during_update_is_remembered() {
        let updating = Machine {
            state: DeviceState::Updating,
            resume: Some(DeviceState::Connected),
            has_connected: true,
        };
        let t = step(updating, Event::NetworkDisconnected);
        assert_eq!(t.next.state, DeviceState::Updating);
        let t = step(
            t.next,
            Event::UpdateFailed {
                reason: "peer gone".into(),
            },
        );
        assert_eq!(t.next.state, DeviceState::Connecting);
    }

    #[test]
    fn test_exhaustion_parks_in_error() {
        let machine = Machine {
            state: DeviceState::Connecting,
            ..Machine::new()
        };
        let t = step(machine, Event::NetworkReconnectExhausted);
        assert_eq!(t.next.state, DeviceState::Error);
        assert_eq!(t.effects, vec![Effect::SetIndicator(IndicatorMode::SlowBlink)]);

        let restart = RestartConfig {
            restart_on_exhaustion: true,
            ..RestartConfig::default()
        };
        let t = machine.step(&Event::NetworkReconnectExhausted, &restart);
        assert!(t.effects.contains(&Effect::ScheduleRestart(Duration::ZERO)));
    }

    #[test]
    fn test_restarting_is_terminal() {
        let machine = Machine {
            state: DeviceState::Restarting,
            ..Machine::new()
        };
        for event in [
            Event::NetworkConnected,
            Event::ProvisioningStarted,
            Event::LockRequested,
            Event::RestartRequested { delay: None },
        ] {
            let t = step(machine, event);
            assert_eq!(t.next, machine);
            assert!(t.effects.is_empty());
        }
    }

    #[test]
    fn test_boot_without_credentials() {
        let (mut coordinator, indicator, _) = coordinator();
        let store = MemoryStore::new();
        assert_eq!(coordinator.boot(&store).unwrap(), BootMode::Provisioning);
        assert_eq!(indicator.last(), Some(IndicatorMode::SlowBlink));
        assert!(coordinator.identity().is_none());
    }

    #[test]
    fn test_boot_with_credentials_falls_back_identity() {
        let (mut coordinator, _, _) = coordinator();
        let store = MemoryStore::new();
        save_json(&store, CREDENTIALS_KEY, &NetworkCredentials::new("home", "pw")).unwrap();
        store.write(IDENTITY_KEY, b"garbage").unwrap();

        let mode = coordinator.boot(&store).unwrap();
        assert!(matches!(mode, BootMode::Station { .. }));
        let identity = coordinator.identity().unwrap();
        assert_eq!(identity.friendly_name, "hover.000102030405");
        assert_eq!(identity.unique_id, "000102030405");
    }

    #[tokio::test]
    async fn test_restart_request_is_idempotent() {
        let (mut coordinator, _, _) = coordinator();
        assert!(coordinator.request_restart(Duration::from_secs(2)));
        assert_eq!(coordinator.state(), DeviceState::Restarting);
        assert!(!coordinator.request_restart(Duration::ZERO));
        assert_eq!(
            coordinator.context().restart_pending(),
            Some(Duration::from_secs(2))
        );

        let outcome = coordinator.dispatch(Event::RestartRequested { delay: None });
        assert!(!outcome.changed());
        assert!(outcome.effects.is_empty());
    }

    #[tokio::test]
    async fn test_bus_connects_on_first_connection() {
        let (coordinator, _, platform) = coordinator();
        let bus = Arc::new(MemoryBus::new());
        let mut coordinator = coordinator.with_bus(Box::new(bus.clone()));

        coordinator.dispatch(Event::NetworkStarted);
        coordinator.dispatch(Event::NetworkConnected);
        assert_eq!(platform.clock_syncs(), 1);
        assert_eq!(bus.client_id().as_deref(), Some("hover.000102030405_000102030405"));

        bus.drop_session();
        coordinator.dispatch(Event::BusDisconnected);
        assert_eq!(bus.reconnects(), 1);
    }

    #[tokio::test]
    async fn test_bus_session_loss_reconnects() {
        let (coordinator, _, _) = coordinator();
        let bus = Arc::new(MemoryBus::new());
        let mut coordinator = coordinator.with_bus(Box::new(bus.clone()));
        coordinator.dispatch(Event::NetworkStarted);
        coordinator.dispatch(Event::NetworkConnected);

        // The client reports its own session through the queue
        let outcome = coordinator.poll_once().await.unwrap();
        assert_eq!(outcome.event, Event::BusConnected);

        bus.drop_session();
        let outcome = coordinator.poll_once().await.unwrap();
        assert_eq!(outcome.event, Event::BusDisconnected);
        assert_eq!(outcome.effects, vec![Effect::ReconnectBus]);
        assert_eq!(bus.reconnects(), 1);

        let outcome = coordinator.poll_once().await.unwrap();
        assert_eq!(outcome.event, Event::BusConnected);
        assert_eq!(coordinator.state(), DeviceState::Connected);
    }

    #[tokio::test]
    async fn test_grant_without_request_restores_state() {
        let (mut coordinator, _, _) = coordinator();
        coordinator.dispatch(Event::NetworkConnected);
        coordinator.dispatch(Event::UpdateRequested);
        // Nobody filed a request, so the grant fails and the lock stays free
        coordinator.dispatch(Event::LockRequested);
        assert_eq!(coordinator.state(), DeviceState::Updating);
        assert_eq!(coordinator.context().task_lock().holder(), None);
    }

    #[tokio::test]
    async fn test_request_after_release_is_granted() {
        let (mut coordinator, _, _) = coordinator();
        let lock = coordinator.context().task_lock().clone();
        coordinator.dispatch(Event::NetworkConnected);
        coordinator.dispatch(Event::UpdateRequested);
        lock.request(LockHolder::UpdatePipeline);
        coordinator.dispatch(Event::LockRequested);
        assert_eq!(lock.holder(), Some(LockHolder::UpdatePipeline));

        // First upload gives the lock back, a second one files its request
        // before the coordinator has seen the release
        lock.release(LockHolder::UpdatePipeline).unwrap();
        lock.request(LockHolder::UpdatePipeline);
        coordinator.dispatch(Event::UpdateRequested);
        let outcome = coordinator.dispatch(Event::LockRequested);
        assert_eq!(outcome.effects, vec![Effect::GrantTaskLock]);
        assert_eq!(lock.holder(), Some(LockHolder::UpdatePipeline));
        assert_eq!(lock.pending(), None);

        // The first upload's release must not unlock the second
        let outcome = coordinator.dispatch(Event::LockReleased);
        assert!(!outcome.changed());
        assert_eq!(coordinator.state(), DeviceState::Locked);

        lock.release(LockHolder::UpdatePipeline).unwrap();
        coordinator.dispatch(Event::LockReleased);
        assert_eq!(coordinator.state(), DeviceState::Updating);
        coordinator.dispatch(Event::UpdateFailed {
            reason: "cut".into(),
        });
        assert_eq!(coordinator.state(), DeviceState::Connected);
    }

    #[tokio::test]
    async fn test_busy_request_granted_on_release() {
        let (mut coordinator, _, _) = coordinator();
        let lock = coordinator.context().task_lock().clone();
        coordinator.dispatch(Event::NetworkConnected);
        coordinator.dispatch(Event::UpdateRequested);
        lock.request(LockHolder::UpdatePipeline);
        coordinator.dispatch(Event::LockRequested);

        // A request that meets a held lock stays on file
        lock.request(LockHolder::UpdatePipeline);
        coordinator.dispatch(Event::LockRequested);
        assert_eq!(lock.pending(), Some(LockHolder::UpdatePipeline));
        assert_eq!(coordinator.state(), DeviceState::Locked);

        lock.release(LockHolder::UpdatePipeline).unwrap();
        coordinator.dispatch(Event::LockReleased);
        assert_eq!(coordinator.state(), DeviceState::Locked);
        assert_eq!(lock.holder(), Some(LockHolder::UpdatePipeline));
        assert_eq!(lock.pending(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_housekeeping_reclaims_stuck_lock() {
        let (mut coordinator, _, _) = coordinator();
        let ctx = coordinator.context();
        coordinator.dispatch(Event::NetworkConnected);
        coordinator.dispatch(Event::UpdateRequested);
        ctx.task_lock().request(LockHolder::UpdatePipeline);
        coordinator.dispatch(Event::LockRequested);
        assert_eq!(coordinator.state(), DeviceState::Locked);

        let now = Instant::now();
        coordinator.housekeeping(now + Duration::from_secs(30));
        assert_eq!(coordinator.state(), DeviceState::Locked);

        coordinator.housekeeping(now + Duration::from_secs(91));
        assert_eq!(coordinator.state(), DeviceState::Updating);
        assert_eq!(ctx.task_lock().holder(), None);
        assert_eq!(ctx.task_lock().forced_releases(), 1);

        coordinator.housekeeping(now + Duration::from_secs(200));
        assert_eq!(ctx.task_lock().forced_releases(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_sequence_order() {
        let (mut coordinator, indicator, platform) = coordinator();
        let log = Arc::new(Mutex::new(Vec::new()));
        for (name, fail) in [("wifi", false), ("server", true), ("ota", false)] {
            coordinator.register(Box::new(StopRecorder {
                name,
                fail,
                log: log.clone(),
            }));
        }

        let ctx = coordinator.context();
        let start = Instant::now();
        ctx.request_restart(Duration::from_secs(2));
        let report = coordinator.run().await;

        assert_eq!(report.stopped, vec!["wifi", "ota"]);
        assert_eq!(report.failed, vec!["server"]);
        assert_eq!(platform.resets(), 1);
        assert_eq!(indicator.last(), Some(IndicatorMode::Off));
        assert_eq!(ctx.state(), DeviceState::Restarting);

        let log = log.lock();
        let names: Vec<_> = log.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["wifi", "server", "ota"]);
        assert!(log[0].1 - start >= Duration::from_millis(150));
        assert!(log[1].1 - log[0].1 >= Duration::from_millis(150));
        // Requested delay covers the whole sequence
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_millis(2100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_processes_events_in_order() {
        let (coordinator, indicator, platform) = coordinator();
        let ctx = coordinator.context();
        let mut states = ctx.watch_state();
        let loop_handle = tokio::spawn(coordinator.run());

        ctx.submit(Event::NetworkStarted).await.unwrap();
        ctx.submit(Event::NetworkConnected).await.unwrap();
        states
            .wait_for(|s| *s == DeviceState::Connected)
            .await
            .unwrap();

        ctx.submit(Event::RestartRequested {
            delay: Some(Duration::ZERO),
        })
        .await
        .unwrap();
        let report = loop_handle.await.unwrap();
        assert_eq!(report.delay, Duration::ZERO);
        assert_eq!(platform.resets(), 1);
        assert_eq!(
            &indicator.modes()[..2],
            &[IndicatorMode::SlowBlink, IndicatorMode::Static]
        );
    }
}
