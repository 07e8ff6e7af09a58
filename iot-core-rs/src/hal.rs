//! Platform collaborators consumed by the coordinator
//!
//! - [`Indicator`]: status LED pattern
//! - [`Platform`]: reset, diagnostics, clock sync, MAC address
//! - [`MessageBus`]: optional pub/sub client
//! - [`Startable`]: subsystems stopped by the shutdown sweep
//!
//! [`NoopPlatform`] and [`RecordingIndicator`] are in-memory doubles for
//! host tests.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::context::LifecycleContext;
use crate::error::CoreError;
use crate::types::{IndicatorMode, MacAddress};

/// Status indicator control
pub trait Indicator: Send + Sync {
    fn set_mode(&self, mode: IndicatorMode);
}

/// Heap and stack figures, when the platform can report them
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Diagnostics {
    pub free_heap: Option<usize>,
    pub min_free_heap: Option<usize>,
    pub stack_high_water: Option<usize>,
}

/// Hardware services used by the runtime core
pub trait Platform: Send + Sync {
    /// Hardware reset. On the device this does not return.
    fn reset(&self);

    /// MAC address of the network interface
    fn mac(&self) -> MacAddress;

    fn diagnostics(&self) -> Diagnostics {
        Diagnostics::default()
    }

    /// Start time synchronization in the given timezone
    fn sync_clock(&self, timezone: &str) {
        let _ = timezone;
    }
}

/// Optional publish/subscribe client.
///
/// Session changes seen by the client are reported through
/// [`LifecycleContext::report_bus`] on the context handed to `attach`.
pub trait MessageBus: Send {
    /// Called once when the coordinator takes the client
    fn attach(&mut self, ctx: Arc<LifecycleContext>) {
        let _ = ctx;
    }
    fn connect(&mut self, client_id: &str) -> Result<(), CoreError>;
    fn reconnect(&mut self) -> Result<(), CoreError>;
    fn connected(&self) -> bool;
}

/// Subsystem that can be started and stopped
pub trait Startable: Send {
    fn name(&self) -> &str;
    fn start(&mut self) -> Result<(), CoreError>;
    fn stop(&mut self) -> Result<(), CoreError>;
    fn started(&self) -> bool;
}

/// Indicator that only logs mode changes
#[derive(Debug)]
pub struct LogIndicator {
    current: Mutex<IndicatorMode>,
}

impl LogIndicator {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(IndicatorMode::Off),
        }
    }
}

impl Default for LogIndicator {
    fn default() -> Self {
        Self::new()
    }
}

impl Indicator for LogIndicator {
    fn set_mode(&self, mode: IndicatorMode) {
        let mut current = self.current.lock();
        if *current != mode {
            info!("Indicator: {} -> {}", *current, mode);
            *current = mode;
        }
    }
}

/// Indicator recording every mode it was given
#[derive(Debug, Default)]
pub struct RecordingIndicator {
    modes: Mutex<Vec<IndicatorMode>>,
}

impl RecordingIndicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn modes(&self) -> Vec<IndicatorMode> {
        self.modes.lock().clone()
    }

    pub fn last(&self) -> Option<IndicatorMode> {
        self.modes.lock().last().copied()
    }
}

impl Indicator for RecordingIndicator {
    fn set_mode(&self, mode: IndicatorMode) {
        self.modes.lock().push(mode);
    }
}

/// Platform double that counts resets and clock syncs
#[derive(Debug)]
pub struct NoopPlatform {
    mac: MacAddress,
    resets: AtomicU32,
    clock_syncs: AtomicU32,
}

impl NoopPlatform {
    pub fn new(mac: MacAddress) -> Self {
        Self {
            mac,
            resets: AtomicU32::new(0),
            clock_syncs: AtomicU32::new(0),
        }
    }

    pub fn resets(&self) -> u32 {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn clock_syncs(&self) -> u32 {
        self.clock_syncs.load(Ordering::SeqCst)
    }
}

impl Default for NoopPlatform {
    fn default() -> Self {
        Self::new(MacAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]))
    }
}

impl Platform for NoopPlatform {
    fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }

    fn mac(&self) -> MacAddress {
        self.mac
    }

    fn sync_clock(&self, _timezone: &str) {
        self.clock_syncs.fetch_add(1, Ordering::SeqCst);
    }
}

/// Message bus double that remembers how it was driven
#[derive(Debug, Default)]
pub struct MemoryBus {
    connected: AtomicBool,
    client_id: Mutex<Option<String>>,
    reconnects: AtomicU32,
    ctx: Mutex<Option<Arc<LifecycleContext>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_id(&self) -> Option<String> {
        self.client_id.lock().clone()
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects.load(Ordering::SeqCst)
    }

    /// Simulate the broker dropping the session
    pub fn drop_session(&self) {
        self.set_connected(false);
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        if let Some(ctx) = self.ctx.lock().as_ref() {
            ctx.report_bus(connected);
        }
    }
}

impl MessageBus for Arc<MemoryBus> {
    fn attach(&mut self, ctx: Arc<LifecycleContext>) {
        *self.ctx.lock() = Some(ctx);
    }

    fn connect(&mut self, client_id: &str) -> Result<(), CoreError> {
        *self.client_id.lock() = Some(client_id.to_string());
        self.set_connected(true);
        Ok(())
    }

    fn reconnect(&mut self) -> Result<(), CoreError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        self.set_connected(true);
        Ok(())
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
