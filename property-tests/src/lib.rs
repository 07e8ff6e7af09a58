//! IoT Core Property-Based Tests
//!
//! Proptest suite for the lifecycle invariants of `iot-core`.
//!
//! # Usage
//!
//! ```bash
//! cd property-tests
//! cargo test                      # Run all property tests
//! cargo test backoff              # Run only the reconnect ladder tests
//! PROPTEST_CASES=1000 cargo test  # More test cases
//! ```
//!
//! # Test Modules
//!
//! - `lifecycle`: single valid state, terminal restart, idempotent restart
//! - `backoff`: ladder monotonicity and bounded total wait
//! - `lock`: single holder, guard eviction exactly once
//! - `update`: failed writes never move the boot slot

use std::time::Duration;

use proptest::prelude::*;

pub use iot_core::*;

/// Any lifecycle event with small payloads
pub fn any_event() -> impl Strategy<Value = Event> {
    prop_oneof![
        Just(Event::ProvisioningStarted),
        Just(Event::ProvisioningSucceeded),
        Just(Event::ProvisioningFinished),
        Just(Event::ProvisioningFailed),
        Just(Event::NetworkStarted),
        Just(Event::NetworkConnected),
        Just(Event::NetworkDisconnected),
        (1u32..10, 1u64..50).prop_map(|(attempt, secs)| Event::NetworkReconnecting {
            attempt,
            interval: Duration::from_secs(secs),
        }),
        any::<bool>().prop_map(|auth| Event::NetworkConnectionFailed { auth }),
        Just(Event::NetworkReconnectExhausted),
        Just(Event::UpdateRequested),
        "[0-9]\\.[0-9]\\.[0-9]".prop_map(|version| Event::UpdateCompleted { version }),
        "[a-z ]{1,12}".prop_map(|reason| Event::UpdateFailed { reason }),
        Just(Event::LockRequested),
        Just(Event::LockReleased),
        prop::option::of(0u64..10_000).prop_map(|ms| Event::RestartRequested {
            delay: ms.map(Duration::from_millis),
        }),
        Just(Event::BusConnected),
        Just(Event::BusDisconnected),
    ]
}

/// Events that never schedule a restart
pub fn quiet_event() -> impl Strategy<Value = Event> {
    any_event().prop_filter("schedules a restart", |event| {
        !matches!(
            event,
            Event::ProvisioningSucceeded
                | Event::ProvisioningFailed
                | Event::UpdateCompleted { .. }
                | Event::RestartRequested { .. }
                | Event::NetworkConnectionFailed { .. }
                | Event::NetworkReconnectExhausted
        )
    })
}

/// Reconnect ladder with small bounds
pub fn backoff_policy() -> impl Strategy<Value = config::BackoffPolicy> {
    (1u64..5, 1u64..5, 1u64..60, 0u32..12).prop_map(|(floor, step, ceiling, max_retries)| {
        config::BackoffPolicy {
            floor: Duration::from_secs(floor),
            step: Duration::from_secs(step),
            ceiling: Duration::from_secs(ceiling),
            max_retries,
        }
    })
}

/// Runtime with a paused clock for one proptest case
pub fn paused_runtime() -> tokio::runtime::Runtime {
    match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
    {
        Ok(rt) => rt,
        Err(e) => panic!("runtime: {}", e),
    }
}

/// Coordinator wired to recording doubles
pub fn test_coordinator(config: CoreConfig) -> (Coordinator, std::sync::Arc<hal::NoopPlatform>) {
    let platform = std::sync::Arc::new(hal::NoopPlatform::new(MacAddress([2, 0, 0, 0, 0, 1])));
    let indicator = std::sync::Arc::new(hal::RecordingIndicator::new());
    (Coordinator::new(config, indicator, platform.clone()), platform)
}
