//! Fuzz target for the read-state engine under storage failures
//!
//! Runs the same operations on an engine over `MemoryStorage` and an engine
//! over `ChaoticStorage`, which fails reads and writes at a fuzzed rate.
//!
//! # Strategy
//!
//! - Variable failure rates (0% to 90%)
//! - Message and thread traffic, navigation and mark-as-read
//! - Clock ticks that retry unflushed markers
//! - Restarts once every marker has been flushed
//!
//! # Invariants
//!
//! - Engine NEVER panics on storage errors
//! - Storage errors surface as `MarkerNotPersisted` actions, not errors
//! - Visible read state is identical with and without failures
//! - Flushed markers survive a restart

#![no_main]

use std::time::Duration;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use readmark_core::{
    EngineAction, EngineConfig, Environment, Event, EventContent, EventId, ReadStateEngine, RoomId,
    UserId, env::test_utils::MockEnv,
};
use readmark_storage::{ChaoticStorage, MarkerStorage, MemoryStorage};

const ME: &str = "@me:fuzz";
const BOT: &str = "@bot:fuzz";
const ROOM: &str = "!room:fuzz";

/// Flush attempts before a restart is skipped.
const FLUSH_ATTEMPTS: usize = 32;

#[derive(Debug, Clone, Arbitrary)]
struct ChaosScenario {
    /// Seed for ChaoticStorage RNG (deterministic failures)
    chaos_seed: u64,
    /// Failure rate 0-9 maps to 0%-90%
    failure_rate_tenth: u8,
    /// Sequence of operations to perform
    operations: Vec<ChaosOperation>,
}

#[derive(Debug, Clone, Arbitrary)]
enum ChaosOperation {
    /// Bot sends a main-timeline message
    Message,
    /// Bot replies in the thread of an earlier message
    ThreadReply { root: u8 },
    /// Open the room
    ViewRoom,
    /// Open a thread
    ViewThread { root: u8 },
    /// Leave the room
    ClearFocus,
    /// Mark the room as read
    MarkAsRead,
    /// Advance the clock and retry unflushed markers
    Tick,
    /// Restart both engines
    Restart,
}

struct Node<S: MarkerStorage> {
    env: MockEnv,
    storage: S,
    engine: ReadStateEngine<MockEnv, S>,
    not_persisted: usize,
}

impl<S: MarkerStorage> Node<S> {
    fn open(storage: S) -> Option<Self> {
        let env = MockEnv::new();
        let engine = open_engine(&env, &storage)?;
        Some(Self { env, storage, engine, not_persisted: 0 })
    }

    fn record(&mut self, actions: Vec<EngineAction>) {
        for action in actions {
            if let EngineAction::MarkerNotPersisted { .. } = action {
                self.not_persisted += 1;
            }
        }
    }

    fn flush(&mut self) -> bool {
        for _ in 0..FLUSH_ATTEMPTS {
            if self.engine.receipts().unflushed_count() == 0 {
                return true;
            }
            self.env.advance(Duration::from_millis(50));
            let actions = self.engine.tick(self.env.now());
            self.record(actions);
        }
        self.engine.receipts().unflushed_count() == 0
    }
}

fn open_engine<S: MarkerStorage>(
    env: &MockEnv,
    storage: &S,
) -> Option<ReadStateEngine<MockEnv, S>> {
    // Startup reads may fail under chaos; a client retries them
    (0..FLUSH_ATTEMPTS).find_map(|_| {
        let own = UserId::from(ME);
        ReadStateEngine::open(env.clone(), EngineConfig::default(), own, storage.clone()).ok()
    })
}

fn next_event(events: &[Event], content: EventContent) -> Event {
    let sequence = events.len() as u64 + 1;
    Event::new(format!("${sequence}"), ROOM, BOT, sequence, content)
}

fn room() -> RoomId {
    RoomId::from(ROOM)
}

fuzz_target!(|scenario: ChaosScenario| {
    let failure_rate = f64::from(scenario.failure_rate_tenth % 10) / 10.0;
    let chaotic =
        ChaoticStorage::with_seed(MemoryStorage::new(), failure_rate, scenario.chaos_seed);

    let Some(mut reference) = Node::open(MemoryStorage::new()) else {
        return;
    };
    let Some(mut chaos) = Node::open(chaotic) else {
        return;
    };

    let mut events: Vec<Event> = Vec::new();
    let mut messages: Vec<EventId> = Vec::new();

    for op in scenario.operations {
        match op {
            ChaosOperation::Message => {
                let event = next_event(&events, EventContent::Message);
                messages.push(event.event_id.clone());
                events.push(event.clone());

                let actions = reference.engine.receive_events(&room(), vec![event.clone()], false);
                reference.record(actions);
                let actions = chaos.engine.receive_events(&room(), vec![event], false);
                chaos.record(actions);
            },
            ChaosOperation::ThreadReply { root } => {
                if messages.is_empty() {
                    continue;
                }
                let root = messages[usize::from(root) % messages.len()].clone();
                let event = next_event(&events, EventContent::ThreadReply { root });
                events.push(event.clone());

                let actions = reference.engine.receive_events(&room(), vec![event.clone()], false);
                reference.record(actions);
                let actions = chaos.engine.receive_events(&room(), vec![event], false);
                chaos.record(actions);
            },
            ChaosOperation::ViewRoom => {
                let actions = reference.engine.view_room(&room());
                reference.record(actions);
                let actions = chaos.engine.view_room(&room());
                chaos.record(actions);
            },
            ChaosOperation::ViewThread { root } => {
                if messages.is_empty() {
                    continue;
                }
                let root = &messages[usize::from(root) % messages.len()];
                let expected = reference.engine.view_thread(&room(), root);
                let actual = chaos.engine.view_thread(&room(), root);
                assert_eq!(expected.is_ok(), actual.is_ok(), "view_thread diverged under chaos");
                if let (Ok(a), Ok(b)) = (expected, actual) {
                    reference.record(a);
                    chaos.record(b);
                }
            },
            ChaosOperation::ClearFocus => {
                let actions = reference.engine.clear_focus();
                reference.record(actions);
                let actions = chaos.engine.clear_focus();
                chaos.record(actions);
            },
            ChaosOperation::MarkAsRead => {
                let actions = reference.engine.mark_room_as_read(&room());
                reference.record(actions);
                let actions = chaos.engine.mark_room_as_read(&room());
                chaos.record(actions);
            },
            ChaosOperation::Tick => {
                for node_env in [&reference.env, &chaos.env] {
                    node_env.advance(Duration::from_millis(50));
                }
                let actions = reference.engine.tick(reference.env.now());
                reference.record(actions);
                let actions = chaos.engine.tick(chaos.env.now());
                chaos.record(actions);
            },
            ChaosOperation::Restart => {
                // Unflushed markers are lost on restart, so only restart clean
                if !chaos.flush() {
                    continue;
                }
                let Some(engine) = open_engine(&chaos.env, &chaos.storage) else {
                    continue;
                };
                chaos.engine = engine;
                let Some(engine) = open_engine(&reference.env, &reference.storage) else {
                    return;
                };
                reference.engine = engine;

                // Focus does not survive a restart
                let actions = reference.engine.receive_events(&room(), events.clone(), false);
                reference.record(actions);
                let actions = chaos.engine.receive_events(&room(), events.clone(), false);
                chaos.record(actions);
            },
        }

        // INVARIANT: failures never change what the user sees
        assert_eq!(
            reference.engine.room_read_state(&room()),
            chaos.engine.room_read_state(&room()),
            "read state diverged under chaos"
        );
    }

    // INVARIANT: reliable storage never reports lost writes
    assert_eq!(reference.not_persisted, 0);
});
