//! Core types for the device runtime

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Timezone applied when the identity record does not carry one
pub const DEFAULT_TIMEZONE: &str = "GMT-2";

/// Lifecycle state of the device.
///
/// Exactly one value is active at any instant. Only the coordinator writes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Initial,
    Configuring,
    Configured,
    Connecting,
    Connected,
    Updating,
    Locked,
    Error,
    Restarting,
}

impl DeviceState {
    pub const ALL: [DeviceState; 9] = [
        DeviceState::Initial,
        DeviceState::Configuring,
        DeviceState::Configured,
        DeviceState::Connecting,
        DeviceState::Connected,
        DeviceState::Updating,
        DeviceState::Locked,
        DeviceState::Error,
        DeviceState::Restarting,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceState::Initial => "initial",
            DeviceState::Configuring => "configuring",
            DeviceState::Configured => "configured",
            DeviceState::Connecting => "connecting",
            DeviceState::Connected => "connected",
            DeviceState::Updating => "updating",
            DeviceState::Locked => "locked",
            DeviceState::Error => "error",
            DeviceState::Restarting => "restarting",
        }
    }

    /// No transition leaves this state for the rest of the process lifetime
    pub fn is_terminal(self) -> bool {
        matches!(self, DeviceState::Restarting)
    }

    /// A firmware update owns the device
    pub fn is_updating(self) -> bool {
        matches!(self, DeviceState::Updating | DeviceState::Locked)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status indicator pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorMode {
    Off,
    Static,
    SlowBlink,
    FastBlink,
}

impl IndicatorMode {
    /// Toggle period for blinking modes
    pub fn blink_period(self) -> Option<Duration> {
        match self {
            IndicatorMode::SlowBlink => Some(Duration::from_millis(1000)),
            IndicatorMode::FastBlink => Some(Duration::from_millis(300)),
            IndicatorMode::Off | IndicatorMode::Static => None,
        }
    }
}

impl fmt::Display for IndicatorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndicatorMode::Off => write!(f, "off"),
            IndicatorMode::Static => write!(f, "static"),
            IndicatorMode::SlowBlink => write!(f, "slow-blink"),
            IndicatorMode::FastBlink => write!(f, "fast-blink"),
        }
    }
}

/// Component holding the task lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockHolder {
    /// The consumer loop, while it runs the restart sequence
    Coordinator,
    /// A firmware write in progress
    UpdatePipeline,
}

impl fmt::Display for LockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockHolder::Coordinator => write!(f, "coordinator"),
            LockHolder::UpdatePipeline => write!(f, "update-pipeline"),
        }
    }
}

/// Message placed on the lifecycle queue.
///
/// Payloads are owned values; the queue owns them until the coordinator
/// consumes the event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ProvisioningStarted,
    ProvisioningSucceeded,
    ProvisioningFinished,
    ProvisioningFailed,

    /// Interface is up and association has begun
    NetworkStarted,
    NetworkConnected,
    NetworkDisconnected,
    NetworkReconnecting { attempt: u32, interval: Duration },
    /// Initial association failed
    NetworkConnectionFailed { auth: bool },
    NetworkReconnectExhausted,

    UpdateRequested,
    UpdateCompleted { version: String },
    UpdateFailed { reason: String },

    LockRequested,
    LockReleased,

    /// `None` asks for the safe restart delay
    RestartRequested { delay: Option<Duration> },

    BusConnected,
    BusDisconnected,
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::ProvisioningStarted => "provisioning-started",
            Event::ProvisioningSucceeded => "provisioning-succeeded",
            Event::ProvisioningFinished => "provisioning-finished",
            Event::ProvisioningFailed => "provisioning-failed",
            Event::NetworkStarted => "network-started",
            Event::NetworkConnected => "network-connected",
            Event::NetworkDisconnected => "network-disconnected",
            Event::NetworkReconnecting { .. } => "network-reconnecting",
            Event::NetworkConnectionFailed { .. } => "network-connection-failed",
            Event::NetworkReconnectExhausted => "network-reconnect-exhausted",
            Event::UpdateRequested => "update-requested",
            Event::UpdateCompleted { .. } => "update-completed",
            Event::UpdateFailed { .. } => "update-failed",
            Event::LockRequested => "lock-requested",
            Event::LockReleased => "lock-released",
            Event::RestartRequested { .. } => "restart-requested",
            Event::BusConnected => "bus-connected",
            Event::BusDisconnected => "bus-disconnected",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// Hardware address of the network interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Last three octets, used to build per-device service names
    pub fn suffix(&self) -> String {
        hex::encode_upper(&self.0[3..])
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid MAC address: {0}")]
pub struct MacParseError(String);

/// Twelve hex digits, with or without `:` / `-` separators
impl FromStr for MacAddress {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s.chars().filter(|c| !matches!(c, ':' | '-')).collect();
        let mut mac = [0u8; 6];
        hex::decode_to_slice(&digits, &mut mac).map_err(|_| MacParseError(s.to_string()))?;
        Ok(MacAddress(mac))
    }
}

/// Persisted identity of the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub server_url: String,
    #[serde(rename = "name")]
    pub friendly_name: String,
    #[serde(rename = "uuid")]
    pub unique_id: String,
    pub timezone: String,
}

impl DeviceIdentity {
    /// Identity used when no record could be loaded
    pub fn fallback(mac: MacAddress) -> Self {
        Self {
            server_url: String::new(),
            friendly_name: format!("hover.{}", mac),
            unique_id: mac.to_string(),
            timezone: DEFAULT_TIMEZONE.to_string(),
        }
    }

    /// mDNS host label derived from the friendly name
    pub fn hostname(&self) -> String {
        self.friendly_name.to_lowercase().replace(' ', "-")
    }

    /// Client id presented to the message bus
    pub fn client_id(&self, mac: MacAddress) -> String {
        format!("{}_{}", self.friendly_name, mac)
    }
}

/// Network credentials negotiated during provisioning
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCredentials {
    pub ssid: String,
    pub password: String,
}

impl NetworkCredentials {
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            password: password.into(),
        }
    }
}

// Passwords never reach the logs
impl fmt::Debug for NetworkCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkCredentials")
            .field("ssid", &self.ssid)
            .field("password", &"****")
            .finish()
    }
}
