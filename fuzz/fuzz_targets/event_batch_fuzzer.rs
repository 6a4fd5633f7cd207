//! Fuzz target for timeline ingestion
//!
//! Feeds arbitrary event batches straight into the engine: duplicate ids,
//! out-of-order arrival, relations to unknown or foreign events, limited
//! batches and backfills that fill or miss gaps.
//!
//! # Invariants
//!
//! - Engine NEVER panics on malformed input
//! - Room unread flag agrees with its counts
//! - Badge count is the main count plus every thread count
//! - Threads with unknown roots report nothing unread
//! - Storage never holds a marker ahead of memory
//! - Mark-as-read always leaves the room read unless a gap remains

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use readmark_core::{
    EngineConfig, Event, EventContent, EventId, ReadStateEngine, ReceiptKind, RoomId, UserId,
    env::test_utils::MockEnv,
};
use readmark_harness::{InvariantRegistry, SystemSnapshot};
use readmark_storage::MemoryStorage;

const ME: &str = "@me:fuzz";
const ROOMS: [&str; 2] = ["!a:fuzz", "!b:fuzz"];

#[derive(Debug, Clone, Arbitrary)]
struct FuzzEvent {
    id: u8,
    room: bool,
    own: bool,
    content: FuzzContent,
    highlight: bool,
}

#[derive(Debug, Clone, Arbitrary)]
enum FuzzContent {
    Message,
    Reply(u8),
    ThreadReply(u8),
    Edit(u8),
    Reaction(u8),
    State(bool),
    Other,
}

#[derive(Debug, Clone, Arbitrary)]
enum Input {
    Sync { events: Vec<FuzzEvent>, limited: bool },
    Backfill { events: Vec<FuzzEvent>, gap: Option<u8> },
    Receipt { room: bool, target: u8, own: bool, private: bool, threaded: bool },
    ViewRoom { room: bool },
    ViewThread { room: bool, root: u8 },
    MarkAsRead { room: bool },
    Jump { room: bool, target: u8, include_threads: bool },
    ClearFocus,
}

fn room(second: bool) -> RoomId {
    RoomId::from(ROOMS[usize::from(second)])
}

fn event_id(id: u8) -> EventId {
    EventId::new(format!("${id}"))
}

fn to_event(e: &FuzzEvent) -> Event {
    let content = match e.content {
        FuzzContent::Message => EventContent::Message,
        FuzzContent::Reply(t) => EventContent::Reply { target: event_id(t) },
        FuzzContent::ThreadReply(t) => EventContent::ThreadReply { root: event_id(t) },
        FuzzContent::Edit(t) => EventContent::Edit { target: event_id(t) },
        FuzzContent::Reaction(t) => EventContent::Reaction { target: event_id(t), key: "+".into() },
        FuzzContent::State(notify) => EventContent::State { notify },
        FuzzContent::Other => EventContent::Other,
    };
    let sender = if e.own { ME } else { "@bot:fuzz" };

    // Ids double as sequences so arrival order is arbitrary but server order is not
    Event::new(event_id(e.id), room(e.room), sender, u64::from(e.id), content)
        .with_highlight(e.highlight)
}

fuzz_target!(|inputs: Vec<Input>| {
    let storage = MemoryStorage::new();
    let Ok(mut engine) =
        ReadStateEngine::open(MockEnv::new(), EngineConfig::default(), UserId::from(ME), storage)
    else {
        return;
    };
    let invariants = InvariantRegistry::standard();

    for input in inputs {
        match input {
            Input::Sync { events, limited } => {
                for second in [false, true] {
                    let batch: Vec<Event> =
                        events.iter().filter(|e| e.room == second).map(to_event).collect();
                    let _ = engine.receive_events(&room(second), batch, limited);
                }
            },
            Input::Backfill { events, gap } => {
                for second in [false, true] {
                    let batch: Vec<Event> =
                        events.iter().filter(|e| e.room == second).map(to_event).collect();
                    let _ = engine.receive_backfill(&room(second), batch, gap.map(u64::from));
                }
            },
            Input::Receipt { room: r, target, own, private, threaded } => {
                let user = if own { UserId::from(ME) } else { UserId::from("@alice:fuzz") };
                let kind = if private { ReceiptKind::Private } else { ReceiptKind::Public };
                let _ = if threaded {
                    engine.receive_remote_receipt(&room(r), &user, &event_id(target), kind)
                } else {
                    engine.receive_unthreaded_receipt(&room(r), &user, &event_id(target), kind)
                };
            },
            Input::ViewRoom { room: r } => {
                let _ = engine.view_room(&room(r));
            },
            Input::ViewThread { room: r, root } => {
                let _ = engine.view_thread(&room(r), &event_id(root));
            },
            Input::MarkAsRead { room: r } => {
                let _ = engine.mark_room_as_read(&room(r));
                let state = engine.room_read_state(&room(r));
                assert!(
                    !state.is_room_unread || state.incomplete,
                    "mark as read left {state:#?}"
                );
            },
            Input::Jump { room: r, target, include_threads } => {
                let _ = engine.jump_to_event(&room(r), &event_id(target), include_threads);
            },
            Input::ClearFocus => {
                let _ = engine.clear_focus();
            },
        }

        let Ok(snapshot) = SystemSnapshot::capture(&engine, ROOMS.map(RoomId::from)) else {
            return;
        };
        invariants.assert_all(&snapshot, "after fuzz input");
    }
});
