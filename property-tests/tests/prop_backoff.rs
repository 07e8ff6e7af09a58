//! Property tests for the reconnect ladder
//!
//! Tests invariants for:
//! - Intervals never decrease and never pass the ceiling
//! - The retry counter resets exactly when the interval grows
//! - Exhaustion is final, and the total wait matches the policy bound
//! - Reset returns the ladder to its floor

use std::time::Duration;

use iot_core::backoff::{Backoff, BackoffStep};
use iot_property_tests::*;
use proptest::prelude::*;

// ============================================================================
// Helpers
// ============================================================================

/// Walk the ladder until exhaustion, collecting every step
fn walk(backoff: &mut Backoff) -> Vec<BackoffStep> {
    let mut steps = Vec::new();
    loop {
        let step = backoff.next_step();
        steps.push(step);
        if step == BackoffStep::Exhausted {
            return steps;
        }
    }
}

// ============================================================================
// Ladder Property Tests
// ============================================================================

proptest! {
    /// CORE INVARIANT: floor <= interval <= ceiling, never decreasing
    #[test]
    fn intervals_monotonic_and_bounded(policy in backoff_policy()) {
        let sane = policy.clone().sanitized();
        let mut backoff = Backoff::new(policy);
        let mut last = backoff.interval();

        // Checked as each step is taken, against the rung that produced it
        loop {
            let step = backoff.next_step();
            let interval = backoff.interval();
            prop_assert!(interval >= last);
            prop_assert!(interval >= sane.floor);
            prop_assert!(interval <= sane.ceiling);
            match step {
                BackoffStep::Retry { delay, .. } => prop_assert_eq!(delay, interval),
                BackoffStep::Escalated { interval: raised } => prop_assert_eq!(raised, interval),
                BackoffStep::Exhausted => break,
            }
            last = interval;
        }
    }

    /// The retry counter resets exactly when the interval is raised
    #[test]
    fn retries_reset_on_escalation(policy in backoff_policy()) {
        let sane = policy.clone().sanitized();
        let mut backoff = Backoff::new(policy);

        loop {
            let retries_before = backoff.retries();
            let interval_before = backoff.interval();
            let step = backoff.next_step();

            match step {
                BackoffStep::Retry { attempt, .. } => {
                    prop_assert_eq!(attempt, retries_before + 1);
                    prop_assert!(attempt <= sane.max_retries);
                    prop_assert_eq!(backoff.interval(), interval_before);
                }
                BackoffStep::Escalated { interval } => {
                    prop_assert_eq!(retries_before, sane.max_retries);
                    prop_assert_eq!(backoff.retries(), 0);
                    prop_assert!(interval > interval_before);
                }
                BackoffStep::Exhausted => {
                    prop_assert_eq!(backoff.interval(), sane.ceiling);
                    break;
                }
            }
        }
    }

    /// Exhaustion is sticky and the waits add up to the advertised bound
    #[test]
    fn exhaustion_bounded(policy in backoff_policy()) {
        let bound = policy.max_total_wait();
        let mut backoff = Backoff::new(policy);

        let total: Duration = walk(&mut backoff)
            .into_iter()
            .filter_map(|step| match step {
                BackoffStep::Retry { delay, .. } => Some(delay),
                _ => None,
            })
            .sum();
        prop_assert_eq!(total, bound);

        prop_assert!(backoff.is_exhausted());
        prop_assert_eq!(backoff.next_step(), BackoffStep::Exhausted);
    }

    /// A success at any point restores the floor
    #[test]
    fn reset_returns_to_floor(policy in backoff_policy(), failures in 0usize..80) {
        let mut backoff = Backoff::new(policy);
        for _ in 0..failures {
            backoff.next_step();
        }
        backoff.reset();
        prop_assert!(backoff.is_at_floor());
        prop_assert_eq!(backoff.interval(), backoff.policy().floor);
    }
}
