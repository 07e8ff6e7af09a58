//! Linear reconnect ladder
//!
//! ```text
//!  interval
//!   ceiling ┤                          ┌──────── exhausted
//!           │                ┌─────────┘
//!           │      ┌─────────┘
//!     floor ┼──────┘
//!           └──────────────────────────────────── attempts
//!            max_retries per level, then +step
//! ```
//!
//! The total wait is bounded and known up front, see
//! [`BackoffPolicy::max_total_wait`].

use std::time::Duration;

use crate::config::BackoffPolicy;

/// Outcome of advancing the ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStep {
    /// Wait `delay`, then make attempt number `attempt` at this level
    Retry { attempt: u32, delay: Duration },
    /// Level exhausted; interval grew and the retry counter was reset
    Escalated { interval: Duration },
    /// Ceiling reached with no success
    Exhausted,
}

/// Connection attempt counter
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    retries: u32,
    interval: Duration,
    exhausted: bool,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        let policy = policy.sanitized();
        Self {
            interval: policy.floor,
            policy,
            retries: 0,
            exhausted: false,
        }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Counters sit at their initial values
    pub fn is_at_floor(&self) -> bool {
        self.retries == 0 && self.interval == self.policy.floor && !self.exhausted
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Advance after a failed attempt
    pub fn next_step(&mut self) -> BackoffStep {
        if self.exhausted {
            return BackoffStep::Exhausted;
        }

        if self.retries < self.policy.max_retries {
            self.retries += 1;
            return BackoffStep::Retry {
                attempt: self.retries,
                delay: self.interval,
            };
        }

        if self.interval >= self.policy.ceiling {
            self.exhausted = true;
            return BackoffStep::Exhausted;
        }

        self.interval = (self.interval + self.policy.step).min(self.policy.ceiling);
        self.retries = 0;
        BackoffStep::Escalated {
            interval: self.interval,
        }
    }

    /// Back to floor values after a successful connection
    pub fn reset(&mut self) {
        self.retries = 0;
        self.interval = self.policy.floor;
        self.exhausted = false;
    }
}
