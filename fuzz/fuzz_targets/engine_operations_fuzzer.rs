//! Fuzz target for the read-state engine against its reference model
//!
//! Drives the scenario harness with arbitrary user and server operations and
//! compares every room with the model after each step.
//!
//! # Strategy
//!
//! - Bot messages, thread replies, edits and reactions in three rooms
//! - Navigation between rooms and threads, permalinks, mark-as-read
//! - Receipts from other sessions and other members
//! - Restarts and clock advances interleaved with everything above
//!
//! # Invariants
//!
//! - Engine NEVER panics on any operation sequence
//! - Jumps fail exactly when the model rejects them
//! - Room badge counts and unread flags match the model after every step
//! - Standard harness invariants hold after every step (checked by the
//!   scenario itself)

#![no_main]

use libfuzzer_sys::fuzz_target;
use readmark_harness::{ModelWorld, Operation, Resolved, Scenario};

/// Operations per input; longer runs only repeat states.
const MAX_OPERATIONS: usize = 128;

fuzz_target!(|ops: Vec<Operation>| {
    let mut model = ModelWorld::new();
    let mut real = Scenario::new();
    for name in model.room_names() {
        real.create_room(&name);
    }

    for op in ops.iter().take(MAX_OPERATIONS) {
        match model.apply(op) {
            Resolved::Skipped => continue,
            Resolved::Apply(step) => {
                if let Err(e) = step.apply_to(&mut real) {
                    panic!("{step:?} failed: {e}");
                }
            },
            Resolved::Rejected(step) => {
                assert!(step.apply_to(&mut real).is_err(), "{step:?} should be rejected");
            },
        }

        let expected = model.observable();
        for room in &expected.rooms {
            let state = real.read_state(&room.room);
            assert_eq!(state.main_unread_count, room.main_unread, "{} after {op:?}", room.room);
            assert_eq!(state.unread_count, room.unread, "{} after {op:?}", room.room);
            assert_eq!(state.is_room_unread, room.is_unread, "{} after {op:?}", room.room);
            assert_eq!(state.threads.len(), room.threads.len(), "{} after {op:?}", room.room);
        }
    }
});
