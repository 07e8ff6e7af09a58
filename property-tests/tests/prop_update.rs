//! Property tests for the update pipeline
//!
//! Tests invariants for:
//! - A failed write (flash error or short body) never moves the boot slot
//! - A complete write moves the boot slot exactly once
//! - The task lock is free and the session closed after every outcome

use iot_core::firmware::{build_image, FirmwareSlots, MemorySlots, Slot, HEADER_LEN};
use iot_core::router::{Method, Request};
use iot_core::update::UpdateState;
use iot_property_tests::*;
use proptest::prelude::*;

// ============================================================================
// Strategies
// ============================================================================

#[derive(Debug, Clone)]
enum Fault {
    None,
    /// Flash write fails once the slot would pass this many bytes
    FlashAt(usize),
    /// Body ends after this many bytes
    CutAt(usize),
}

fn payload() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..6000)
}

fn fault(image_len: usize) -> impl Strategy<Value = Fault> {
    prop_oneof![
        Just(Fault::None),
        (0..image_len).prop_map(Fault::FlashAt),
        (0..image_len).prop_map(Fault::CutAt),
    ]
}

fn upload_case() -> impl Strategy<Value = (Vec<u8>, Fault, usize)> {
    payload().prop_flat_map(|payload| {
        let image_len = payload.len() + HEADER_LEN;
        (Just(payload), fault(image_len), 1usize..2048)
    })
}

// ============================================================================
// Helpers
// ============================================================================

struct Run {
    result: Result<String, update::UpdateError>,
    coordinator: Coordinator,
    pipeline: UpdatePipeline,
}

/// Stream one upload while the coordinator consumes events
async fn run_upload(slots: &MemorySlots, image: Vec<u8>, fault: &Fault, chunk: usize) -> Run {
    let (mut coordinator, _platform) = test_coordinator(CoreConfig::default());
    coordinator.dispatch(Event::NetworkStarted);
    coordinator.dispatch(Event::NetworkConnected);

    let pipeline = UpdatePipeline::new(
        coordinator.context(),
        coordinator.config().update.clone(),
        Box::new(slots.clone()),
    );

    let content_length = image.len();
    let sent = match fault {
        Fault::CutAt(cut) => image[..*cut].to_vec(),
        _ => image,
    };
    if let Fault::FlashAt(limit) = fault {
        slots.fail_after(*limit);
    }
    let request = Request::new(Method::Post, "/api/v1/update").with_body(sent, chunk);

    let result = {
        let upload = pipeline.receive(Some(content_length), request.body);
        tokio::pin!(upload);
        loop {
            tokio::select! {
                result = &mut upload => break result,
                _ = coordinator.poll_once() => {}
            }
        }
    };

    // Terminal events still queued
    while coordinator.poll_once().await.is_some() {}

    Run {
        result,
        coordinator,
        pipeline,
    }
}

// ============================================================================
// Boot Slot Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// CORE INVARIANT: boot slot moves once on success, never on failure
    #[test]
    fn boot_slot_moves_only_on_success((payload, fault, chunk) in upload_case()) {
        let slots = MemorySlots::new("1.0.0");
        let image = build_image("1.1.0", &payload);

        let run = paused_runtime().block_on(run_upload(&slots, image, &fault, chunk));

        let ctx = run.coordinator.context();
        prop_assert_eq!(ctx.task_lock().holder(), None);
        prop_assert!(run.pipeline.session().is_none());
        prop_assert!(!slots.is_staging());

        match fault {
            Fault::None => {
                prop_assert_eq!(run.result.as_deref().ok(), Some("1.1.0"));
                prop_assert_eq!(slots.boot_slot(), Slot::B);
                prop_assert_eq!(slots.boot_switches(), 1);
                prop_assert_eq!(slots.version_in(Slot::B), Some("1.1.0".to_string()));
                prop_assert_eq!(run.pipeline.state(), UpdateState::Success);
                prop_assert_eq!(run.coordinator.state(), DeviceState::Restarting);
                prop_assert_eq!(
                    ctx.restart_pending(),
                    Some(run.coordinator.config().restart.default_delay)
                );
            }
            Fault::FlashAt(_) | Fault::CutAt(_) => {
                prop_assert!(run.result.is_err());
                prop_assert_eq!(slots.boot_slot(), Slot::A);
                prop_assert_eq!(slots.boot_switches(), 0);
                prop_assert_eq!(run.coordinator.state(), DeviceState::Connected);
                prop_assert_eq!(ctx.restart_pending(), None);
            }
        }
    }

    /// A rejected header writes nothing and leaves no session behind
    #[test]
    fn rejected_image_writes_nothing(payload in payload(), chunk in 1usize..2048) {
        let slots = MemorySlots::new("1.0.0");
        let image = build_image("1.0.0", &payload);

        let run = paused_runtime().block_on(run_upload(&slots, image, &Fault::None, chunk));

        let rejected = matches!(run.result, Err(update::UpdateError::Rejected(_)));
        prop_assert!(rejected);
        prop_assert_eq!(slots.boot_switches(), 0);
        prop_assert_eq!(slots.version_in(Slot::B), None);
        prop_assert_eq!(run.pipeline.state(), UpdateState::Rejected);
        prop_assert_eq!(run.coordinator.context().task_lock().holder(), None);
    }
}
