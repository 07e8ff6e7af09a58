//! Connectivity manager
//!
//! Owns the single network interface. Brings it up, watches for link loss
//! and drives reconnection through the [`Backoff`] ladder. Every transition
//! is reported to the coordinator as an event; the manager never touches
//! device state.
//!
//! During provisioning-mode association a failure is reported upward and not
//! retried: the coordinator restarts into a fresh provisioning window.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::{Backoff, BackoffStep};
use crate::config::BackoffPolicy;
use crate::context::LifecycleContext;
use crate::error::CoreError;
use crate::hal::Startable;
use crate::types::{Event, MacAddress};

/// Association and link errors reported by the driver
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Authentication failed")]
    AuthFailed,

    #[error("Access point not found: {0}")]
    NotFound(String),

    #[error("Association timed out")]
    Timeout,

    #[error("Link lost: {0}")]
    Lost(String),

    #[error("Driver error: {0}")]
    Driver(String),
}

impl LinkError {
    pub fn is_auth(&self) -> bool {
        matches!(self, LinkError::AuthFailed)
    }
}

/// Radio driver for one network interface
pub trait NetworkDriver: Send + 'static {
    /// Associate with the configured network
    fn associate(&mut self) -> impl Future<Output = Result<(), LinkError>> + Send;

    /// Resolve when an established link goes down
    fn wait_link_lost(&mut self) -> impl Future<Output = LinkError> + Send;

    fn mac(&self) -> MacAddress;
}

/// Association mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    /// Normal operation with stored credentials
    Station,
    /// Access point plus station while a provisioning session runs
    Provisioning,
}

/// Why the manager stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    /// Ladder ran to its ceiling without a connection
    Exhausted,
    /// Provisioning-mode association failed and was reported
    ProvisioningFailed(LinkError),
}

/// Snapshot of the connection attempt counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptCounter {
    pub retries: u32,
    pub interval: Duration,
}

/// Drives one interface through association and reconnection
pub struct ConnectivityManager<D: NetworkDriver> {
    driver: D,
    backoff: Backoff,
    mode: LinkMode,
    ctx: Arc<LifecycleContext>,
    connected: bool,
}

impl<D: NetworkDriver> ConnectivityManager<D> {
    pub fn new(driver: D, policy: BackoffPolicy, mode: LinkMode, ctx: Arc<LifecycleContext>) -> Self {
        Self {
            driver,
            backoff: Backoff::new(policy),
            mode,
            ctx,
            connected: false,
        }
    }

    pub fn counter(&self) -> AttemptCounter {
        AttemptCounter {
            retries: self.backoff.retries(),
            interval: self.backoff.interval(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn mode(&self) -> LinkMode {
        self.mode
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Submit on a context clone; the manager is never borrowed across the wait
    fn emit(&self, event: Event) -> impl Future<Output = ()> + Send + 'static {
        let ctx = self.ctx.clone();
        async move {
            if let Err(e) = ctx.submit(event).await {
                warn!("Wifi: Event not delivered: {}", e);
            }
        }
    }

    async fn on_connected(&mut self) {
        self.backoff.reset();
        self.connected = true;
        info!("Wifi: Connected ({})", self.driver.mac());
        self.emit(Event::NetworkConnected).await;
    }

    /// First association after boot
    pub async fn connect(&mut self) -> Result<(), LinkOutcome> {
        info!("Wifi: Starting in {:?} mode", self.mode);
        self.emit(Event::NetworkStarted).await;

        match self.driver.associate().await {
            Ok(()) => {
                self.on_connected().await;
                Ok(())
            }
            Err(e) => {
                warn!("Wifi: Initial association failed: {}", e);
                self.emit(Event::NetworkConnectionFailed { auth: e.is_auth() })
                    .await;
                if self.mode == LinkMode::Provisioning {
                    return Err(LinkOutcome::ProvisioningFailed(e));
                }
                if self.recover().await {
                    Ok(())
                } else {
                    Err(LinkOutcome::Exhausted)
                }
            }
        }
    }

    /// Reconnect after a loss: one immediate attempt, then the ladder.
    ///
    /// Returns `false` once the ladder is exhausted.
    pub async fn recover(&mut self) -> bool {
        if self.try_associate().await {
            return true;
        }

        loop {
            match self.backoff.next_step() {
                BackoffStep::Retry { attempt, delay } => {
                    debug!("Wifi: Retry {} in {:?}", attempt, delay);
                    self.emit(Event::NetworkReconnecting {
                        attempt,
                        interval: delay,
                    })
                    .await;
                    tokio::time::sleep(delay).await;
                    if self.try_associate().await {
                        return true;
                    }
                }
                BackoffStep::Escalated { interval } => {
                    info!("Wifi: Reconnect interval raised to {:?}", interval);
                }
                BackoffStep::Exhausted => {
                    error!(
                        "Wifi: Giving up after ladder reached {:?}",
                        self.backoff.interval()
                    );
                    self.emit(Event::NetworkReconnectExhausted).await;
                    return false;
                }
            }
        }
    }

    async fn try_associate(&mut self) -> bool {
        match self.driver.associate().await {
            Ok(()) => {
                self.on_connected().await;
                true
            }
            Err(e) => {
                debug!("Wifi: Association failed: {}", e);
                false
            }
        }
    }

    /// Handle a lost link; returns `false` when the manager must stop
    pub async fn on_link_lost(&mut self, reason: LinkError) -> bool {
        self.connected = false;
        if self.mode == LinkMode::Provisioning && reason.is_auth() {
            // Bad credentials typed into the provisioning peer
            debug!("Wifi: Ignoring auth failure while provisioning");
            return true;
        }

        info!("Wifi: Link lost ({})", reason);
        self.emit(Event::NetworkDisconnected).await;
        self.recover().await
    }

    /// Connect, then keep the link up until the ladder is exhausted
    pub async fn run(&mut self) -> LinkOutcome {
        if let Err(outcome) = self.connect().await {
            return outcome;
        }

        loop {
            let reason = self.driver.wait_link_lost().await;
            if !self.on_link_lost(reason).await {
                return LinkOutcome::Exhausted;
            }
        }
    }
}

/// Manager running on its own task, stoppable by the shutdown sweep
pub struct ConnectivityService<D: NetworkDriver> {
    manager: Option<ConnectivityManager<D>>,
    task: Option<JoinHandle<LinkOutcome>>,
}

impl<D: NetworkDriver> ConnectivityService<D> {
    pub fn new(manager: ConnectivityManager<D>) -> Self {
        Self {
            manager: Some(manager),
            task: None,
        }
    }
}

impl<D: NetworkDriver> Startable for ConnectivityService<D> {
    fn name(&self) -> &str {
        "wifi"
    }

    fn start(&mut self) -> Result<(), CoreError> {
        let mut manager = self
            .manager
            .take()
            .ok_or_else(|| CoreError::subsystem("wifi", "already started"))?;
        self.task = Some(tokio::spawn(async move { manager.run().await }));
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CoreError> {
        match self.task.take() {
            Some(task) => {
                task.abort();
                info!("Wifi: Stopped");
                Ok(())
            }
            None => Err(CoreError::subsystem("wifi", "not running")),
        }
    }

    fn started(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}
