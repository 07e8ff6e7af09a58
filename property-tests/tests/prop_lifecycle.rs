//! Property tests for the lifecycle coordinator
//!
//! Tests state machine invariants for:
//! - Exactly one state after every event, mirrored on the watch channel
//! - Restarting is terminal and always has a pending restart
//! - Restart requests after the first are ignored

use std::time::Duration;

use iot_core::coordinator::Machine;
use iot_core::config::RestartConfig;
use iot_property_tests::*;
use proptest::prelude::*;

// ============================================================================
// Strategies
// ============================================================================

fn event_sequence() -> impl Strategy<Value = Vec<Event>> {
    prop::collection::vec(any_event(), 1..40)
}

fn delays() -> impl Strategy<Value = Vec<Duration>> {
    prop::collection::vec((0u64..10_000).prop_map(Duration::from_millis), 1..6)
}

// ============================================================================
// State Property Tests
// ============================================================================

proptest! {
    /// CORE INVARIANT: one valid state at a time; Restarting never left
    #[test]
    fn single_state_and_terminal_restart(events in event_sequence()) {
        let (mut coordinator, _platform) = test_coordinator(CoreConfig::default());
        let ctx = coordinator.context();
        let mut restarting = false;

        for event in events {
            let outcome = coordinator.dispatch(event);
            let state = coordinator.state();

            prop_assert!(DeviceState::ALL.contains(&state));
            prop_assert_eq!(outcome.after, state);
            prop_assert_eq!(ctx.state(), state);

            if restarting {
                prop_assert_eq!(state, DeviceState::Restarting);
                prop_assert!(outcome.effects.is_empty());
            }
            restarting = state == DeviceState::Restarting;
            prop_assert_eq!(restarting, ctx.restart_pending().is_some());
        }
    }

    /// Events that never schedule a restart never reach Restarting
    #[test]
    fn quiet_events_never_restart(events in prop::collection::vec(quiet_event(), 1..40)) {
        let (mut coordinator, _platform) = test_coordinator(CoreConfig::default());
        for event in events {
            coordinator.dispatch(event);
            prop_assert_ne!(coordinator.state(), DeviceState::Restarting);
        }
        prop_assert_eq!(coordinator.context().restart_pending(), None);
    }

    /// The transition table is pure: the same input gives the same output
    #[test]
    fn step_is_deterministic(events in event_sequence()) {
        let restart = RestartConfig::default();
        let mut machine = Machine::new();
        for event in events {
            let first = machine.step(&event, &restart);
            let second = machine.step(&event, &restart);
            prop_assert_eq!(&first, &second);
            machine = first.next;
        }
    }

    /// An update that fails hands the device back where it was
    #[test]
    fn failed_update_resumes(prefix in prop::collection::vec(quiet_event(), 0..10)) {
        let (mut coordinator, _platform) = test_coordinator(CoreConfig::default());
        for event in prefix {
            coordinator.dispatch(event);
        }
        // Settle any update the prefix left open
        coordinator.dispatch(Event::UpdateFailed { reason: "prefix".into() });
        let before = coordinator.state();

        coordinator.dispatch(Event::UpdateRequested);
        prop_assert!(coordinator.state().is_updating());
        coordinator.dispatch(Event::UpdateFailed { reason: "peer gone".into() });
        prop_assert_eq!(coordinator.state(), before);
    }
}

// ============================================================================
// Restart Property Tests
// ============================================================================

proptest! {
    /// CORE INVARIANT: only the first restart request is honored
    #[test]
    fn restart_is_idempotent(delays in delays()) {
        let (mut coordinator, platform) = test_coordinator(CoreConfig::default());
        let first = delays[0];

        let scheduled: Vec<bool> = delays
            .iter()
            .map(|delay| coordinator.request_restart(*delay))
            .collect();
        prop_assert!(scheduled[0]);
        prop_assert!(scheduled[1..].iter().all(|s| !s));
        prop_assert_eq!(coordinator.context().restart_pending(), Some(first));

        let report = paused_runtime().block_on(coordinator.run());
        prop_assert_eq!(report.delay, first);
        prop_assert_eq!(platform.resets(), 1);
    }

    /// Restart requests from any thread collapse into one
    #[test]
    fn context_restart_is_idempotent(delays in delays()) {
        let (coordinator, _platform) = test_coordinator(CoreConfig::default());
        let ctx = coordinator.context();
        let accepted = delays
            .iter()
            .filter(|delay| ctx.request_restart(**delay))
            .count();
        prop_assert_eq!(accepted, 1);
        prop_assert_eq!(ctx.restart_pending(), Some(delays[0]));
    }
}
