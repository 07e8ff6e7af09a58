//! Configuration for the lifecycle core
//!
//! Every timing constant lives here. Durations in configuration files are
//! written as human strings, e.g. `"1m 30s"`, `"2s"` or `"150ms"`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::types::DEFAULT_TIMEZONE;

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid duration: {0:?}")]
    InvalidDuration(String),

    #[error("Unknown duration unit in {0:?}")]
    UnknownUnit(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Parse a duration string made of space separated `<number><unit>` terms.
///
/// Units are `h`, `m`, `s` and `ms`. `"1h 2m 3s"` is 3723 seconds.
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::InvalidDuration(input.to_string()));
    }

    let mut total = Duration::ZERO;
    for term in trimmed.split_whitespace() {
        let split = term
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| ConfigError::UnknownUnit(term.to_string()))?;
        let (digits, unit) = term.split_at(split);
        let value: u64 = digits
            .parse()
            .map_err(|_| ConfigError::InvalidDuration(term.to_string()))?;

        let part = match unit {
            "h" => value.checked_mul(3600).map(Duration::from_secs),
            "m" => value.checked_mul(60).map(Duration::from_secs),
            "s" => Some(Duration::from_secs(value)),
            "ms" => Some(Duration::from_millis(value)),
            _ => return Err(ConfigError::UnknownUnit(term.to_string())),
        };
        total = part
            .and_then(|part| total.checked_add(part))
            .ok_or_else(|| ConfigError::InvalidDuration(input.to_string()))?;
    }

    Ok(total)
}

/// Inverse of [`parse_duration`]
pub fn format_duration(duration: Duration) -> String {
    let mut parts = Vec::new();
    let mut secs = duration.as_secs();
    let millis = duration.subsec_millis();

    let hours = secs / 3600;
    secs %= 3600;
    let minutes = secs / 60;
    secs %= 60;

    if hours > 0 {
        parts.push(format!("{}h", hours));
    }
    if minutes > 0 {
        parts.push(format!("{}m", minutes));
    }
    if secs > 0 {
        parts.push(format!("{}s", secs));
    }
    if millis > 0 || parts.is_empty() {
        parts.push(format!("{}ms", millis));
    }
    parts.join(" ")
}

/// Serde adapter storing a `Duration` as a human string
pub mod duration_str {
    use super::{format_duration, parse_duration};
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_duration(&raw).map_err(de::Error::custom)
    }
}

/// Linear reconnect ladder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Initial retry interval
    #[serde(with = "duration_str")]
    pub floor: Duration,

    /// Added to the interval each time a level is exhausted
    #[serde(with = "duration_str")]
    pub step: Duration,

    /// Interval at which the manager gives up
    #[serde(with = "duration_str")]
    pub ceiling: Duration,

    /// Attempts made at each interval before escalating
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            floor: Duration::from_secs(1),
            step: Duration::from_secs(1),
            ceiling: Duration::from_secs(50),
            max_retries: 10,
        }
    }
}

impl BackoffPolicy {
    /// Clamp values so the ladder always terminates
    pub fn sanitized(mut self) -> Self {
        if self.step.is_zero() {
            self.step = Duration::from_millis(1);
        }
        if self.ceiling < self.floor {
            self.ceiling = self.floor;
        }
        self.max_retries = self.max_retries.max(1);
        self
    }

    /// Longest total wait before the ladder is exhausted
    pub fn max_total_wait(&self) -> Duration {
        let policy = self.clone().sanitized();
        let mut total = Duration::ZERO;
        let mut interval = policy.floor;
        loop {
            total += interval * policy.max_retries;
            if interval >= policy.ceiling {
                return total;
            }
            interval = (interval + policy.step).min(policy.ceiling);
        }
    }
}

/// Task lock guard settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Longest time a holder may keep the lock before it is reclaimed
    #[serde(with = "duration_str")]
    pub guard_timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            guard_timeout: Duration::from_secs(90),
        }
    }
}

/// Restart sequencing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    /// Pause before the shutdown sweep starts
    #[serde(with = "duration_str")]
    pub settle: Duration,

    /// Pause after each subsystem stop
    #[serde(with = "duration_str")]
    pub stop_gap: Duration,

    /// Delay used for operator requested restarts
    #[serde(with = "duration_str")]
    pub default_delay: Duration,

    /// Delay after provisioning or an explicit restart event without a delay
    #[serde(with = "duration_str")]
    pub safe_delay: Duration,

    /// Restart instead of parking in `Error` once reconnects are exhausted
    pub restart_on_exhaustion: bool,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(150),
            stop_gap: Duration::from_millis(150),
            default_delay: Duration::from_secs(2),
            safe_delay: Duration::from_secs(5),
            restart_on_exhaustion: false,
        }
    }
}

/// What to do once a peer exhausts its credential attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedCredentials {
    /// Reset the handshake security state and keep waiting
    ResetAndWait,
    /// Report provisioning failure, which restarts the device
    Escalate,
}

/// Provisioning session settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningPolicy {
    pub max_credential_failures: u32,
    pub on_exhausted: ExhaustedCredentials,
}

impl Default for ProvisioningPolicy {
    fn default() -> Self {
        Self {
            max_credential_failures: 10,
            on_exhausted: ExhaustedCredentials::ResetAndWait,
        }
    }
}

/// Version pre-check enforcement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    /// Reject images matching the running or last known bad version
    Strict,
    /// Log the mismatch and continue
    Advisory,
}

/// Firmware update settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdatePolicy {
    pub validation: ValidationMode,
    /// Size of each slice written to the inactive slot
    pub chunk_size: usize,
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        Self {
            validation: ValidationMode::Strict,
            chunk_size: 1024,
        }
    }
}

/// Complete core configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Bounded event queue depth
    pub queue_capacity: usize,

    /// Longest a producer waits for queue space
    #[serde(with = "duration_str")]
    pub enqueue_wait: Duration,

    /// Consumer loop receive timeout
    #[serde(with = "duration_str")]
    pub poll_interval: Duration,

    /// Period of the diagnostics log line
    #[serde(with = "duration_str")]
    pub diagnostics_interval: Duration,

    /// Timezone used until an identity record provides one
    pub timezone: String,

    pub backoff: BackoffPolicy,
    pub lock: LockConfig,
    pub restart: RestartConfig,
    pub provisioning: ProvisioningPolicy,
    pub update: UpdatePolicy,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10,
            enqueue_wait: Duration::from_millis(100),
            poll_interval: Duration::from_secs(1),
            diagnostics_interval: Duration::from_secs(10),
            timezone: DEFAULT_TIMEZONE.to_string(),
            backoff: BackoffPolicy::default(),
            lock: LockConfig::default(),
            restart: RestartConfig::default(),
            provisioning: ProvisioningPolicy::default(),
            update: UpdatePolicy::default(),
        }
    }
}

impl CoreConfig {
    /// Load from a JSON file; missing fields keep their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &str) -> Result<Self, ConfigError> {
        let mut config: CoreConfig = serde_json::from_str(data)?;
        config.backoff = config.backoff.sanitized();
        config.queue_capacity = config.queue_capacity.max(1);
        config.update.chunk_size = config.update.chunk_size.max(1);
        Ok(config)
    }

    /// Set queue depth
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Set consumer poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set reconnect ladder
    pub fn with_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.backoff = policy.sanitized();
        self
    }

    /// Set task lock guard timeout
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock.guard_timeout = timeout;
        self
    }

    /// Set restart sequencing
    pub fn with_restart(mut self, restart: RestartConfig) -> Self {
        self.restart = restart;
        self
    }

    /// Set provisioning policy
    pub fn with_provisioning(mut self, policy: ProvisioningPolicy) -> Self {
        self.provisioning = policy;
        self
    }

    /// Set update validation mode
    pub fn with_validation(mut self, mode: ValidationMode) -> Self {
        self.update.validation = mode;
        self
    }
}
