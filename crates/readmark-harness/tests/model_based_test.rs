//! Model-based property tests.
//!
//! These tests generate random operation sequences and verify that the real
//! engine shows the same unread state as the reference model after every
//! step.
//!
//! # Architecture
//!
//! ```text
//! proptest generates: Vec<Operation>
//!                          │
//!                     ModelWorld::apply
//!                          │ Step
//!           ┌──────────────┴──────────────┐
//!           ▼                             ▼
//!      ModelWorld                     Scenario
//!      (reference)                (engine + homeserver)
//!           └──────── compare observable ─┘
//! ```

use std::collections::HashMap;

use proptest::prelude::*;
use readmark_harness::{
    ModelWorld, ObservableState, Operation, Resolved, RoomObservation, Scenario,
    init_test_tracing,
};

fn operation_strategy() -> impl Strategy<Value = Operation> {
    let room = 0..3u8;
    prop_oneof![
        5 => room.clone().prop_map(|room| Operation::BotMessage { room }),
        3 => (room.clone(), any::<u8>()).prop_map(|(room, root)| Operation::BotThreadReply { room, root }),
        2 => (room.clone(), any::<u8>()).prop_map(|(room, target)| Operation::BotReaction { room, target }),
        1 => (room.clone(), any::<u8>()).prop_map(|(room, target)| Operation::BotEdit { room, target }),
        1 => room.clone().prop_map(|room| Operation::OwnMessage { room }),
        2 => room.clone().prop_map(|room| Operation::GoTo { room }),
        2 => any::<u8>().prop_map(|root| Operation::OpenThread { root }),
        1 => Just(Operation::CloseThread),
        1 => Just(Operation::GoHome),
        1 => room.clone().prop_map(|room| Operation::MarkAsRead { room }),
        1 => (room.clone(), any::<u8>())
            .prop_map(|(room, target)| Operation::OtherSessionReads { room, target }),
        1 => (room.clone(), any::<u8>())
            .prop_map(|(room, target)| Operation::OtherUserReads { room, target }),
        1 => (room, any::<u8>(), any::<bool>()).prop_map(|(room, target, include_threads)| {
            Operation::JumpTo { room, target, include_threads }
        }),
        1 => Just(Operation::SaveAndReload),
        1 => any::<u16>().prop_map(|millis| Operation::AdvanceTime { millis }),
    ]
}

/// Observable state of the real system, shaped like the model's.
fn observe(scenario: &Scenario, model: &ModelWorld) -> ObservableState {
    let mut rooms = Vec::new();

    for name in model.room_names() {
        let bodies: HashMap<_, _> = model
            .bodies(&name)
            .into_iter()
            .map(|body| (scenario.event_id(&name, &body), body))
            .collect();

        let state = scenario.read_state(&name);
        let mut threads: Vec<(String, u64)> = state
            .threads
            .iter()
            .map(|t| {
                let body = bodies.get(&t.thread_root_id).cloned().unwrap_or_default();
                (body, t.unread_count)
            })
            .collect();
        threads.sort();

        rooms.push(RoomObservation {
            room: name,
            main_unread: state.main_unread_count,
            unread: state.unread_count,
            is_unread: state.is_room_unread,
            threads,
        });
    }

    rooms.sort_by(|a, b| a.room.cmp(&b.room));
    ObservableState { rooms }
}

fn real_world(model: &ModelWorld) -> Scenario {
    let mut scenario = Scenario::new();
    for name in model.room_names() {
        scenario.create_room(&name);
    }
    scenario
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(96))]

    /// Verify that the engine matches the reference model after every step.
    #[test]
    fn prop_model_matches_real(ops in prop::collection::vec(operation_strategy(), 0..60)) {
        init_test_tracing();

        let mut model = ModelWorld::new();
        let mut real = real_world(&model);
        prop_assert_eq!(observe(&real, &model), model.observable());

        for (i, op) in ops.iter().enumerate() {
            match model.apply(op) {
                Resolved::Skipped => continue,
                Resolved::Apply(step) => {
                    let result = step.apply_to(&mut real);
                    prop_assert!(result.is_ok(), "step {} {:?} failed: {:?}", i, step, result);
                },
                Resolved::Rejected(step) => {
                    let result = step.apply_to(&mut real);
                    prop_assert!(result.is_err(), "step {} {:?} should be rejected", i, step);
                },
            }

            prop_assert_eq!(
                observe(&real, &model),
                model.observable(),
                "Divergence at operation {}: {:?}",
                i,
                op
            );
        }
    }

    /// Marking every room read always leaves nothing unread.
    #[test]
    fn prop_mark_all_read_clears_everything(ops in prop::collection::vec(operation_strategy(), 0..40)) {
        let mut model = ModelWorld::new();
        let mut real = real_world(&model);

        for op in &ops {
            if let Resolved::Apply(step) = model.apply(op) {
                let _ = step.apply_to(&mut real);
            }
        }

        for name in model.room_names() {
            real.mark_as_read(&name);
            real.assert_read(&name);
        }
    }

    /// A restart reproduces every room's state exactly.
    #[test]
    fn prop_reload_preserves_state(ops in prop::collection::vec(operation_strategy(), 0..40)) {
        let mut model = ModelWorld::new();
        let mut real = real_world(&model);

        for op in &ops {
            if let Resolved::Apply(step) = model.apply(op) {
                let _ = step.apply_to(&mut real);
            }
        }

        let before: Vec<_> = model.room_names().iter().map(|n| real.read_state(n)).collect();
        real.save_and_reload();
        let after: Vec<_> = model.room_names().iter().map(|n| real.read_state(n)).collect();

        prop_assert_eq!(before, after);
    }
}

#[test]
fn replaying_fuzz_bytes_matches_model() {
    use arbitrary::{Arbitrary, Unstructured};

    let bytes: Vec<u8> =
        (0..2048u32).map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8).collect();
    let mut u = Unstructured::new(&bytes);

    let mut model = ModelWorld::new();
    let mut real = real_world(&model);

    // An exhausted Unstructured keeps yielding defaults, so stop on empty
    while !u.is_empty() {
        let Ok(op) = Operation::arbitrary(&mut u) else {
            break;
        };
        match model.apply(&op) {
            Resolved::Skipped => {},
            Resolved::Apply(step) => step.apply_to(&mut real).unwrap(),
            Resolved::Rejected(step) => assert!(step.apply_to(&mut real).is_err()),
        }
        assert_eq!(observe(&real, &model), model.observable(), "after {op:?}");
    }
}
