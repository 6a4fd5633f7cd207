//! Operations for model-based testing.
//!
//! Operations represent all possible user and server actions. They are
//! generated randomly by proptest or a fuzzer and resolved by the model into
//! concrete [`Step`]s, which are applied to the real implementation.

use arbitrary::Arbitrary;
use readmark_core::EngineError;
use readmark_storage::MarkerStorage;

use crate::{scenario::Scenario, sim_homeserver::MessageSpec};

/// Room identifier (uses u8 to keep test space manageable).
pub type ModelRoomId = u8;

/// Number of rooms in the model.
pub const MODEL_ROOMS: u8 = 3;

/// Name of model room `room` in the scenario.
pub fn room_name(room: ModelRoomId) -> String {
    format!("room{}", room % MODEL_ROOMS)
}

/// Operations that can be applied to the system.
///
/// Indices (`root`, `target`) pick among the events that qualify at the time
/// the operation runs. Operations without a qualifying event are skipped.
#[derive(Debug, Clone, Arbitrary)]
pub enum Operation {
    /// The bot sends a message.
    BotMessage {
        /// Target room.
        room: ModelRoomId,
    },

    /// The bot replies in a thread.
    BotThreadReply {
        /// Target room.
        room: ModelRoomId,
        /// Picks the root among main-timeline messages.
        root: u8,
    },

    /// The bot reacts to a message or thread reply.
    BotReaction {
        /// Target room.
        room: ModelRoomId,
        /// Picks the annotated event.
        target: u8,
    },

    /// The bot edits a message or thread reply.
    BotEdit {
        /// Target room.
        room: ModelRoomId,
        /// Picks the edited event.
        target: u8,
    },

    /// The user sends a message from this client.
    OwnMessage {
        /// Target room.
        room: ModelRoomId,
    },

    /// The user opens a room.
    GoTo {
        /// Room to open.
        room: ModelRoomId,
    },

    /// The user opens a thread of the focused room.
    OpenThread {
        /// Picks the thread among the room's threads.
        root: u8,
    },

    /// The user closes the thread panel.
    CloseThread,

    /// The user leaves the room view.
    GoHome,

    /// The user marks a room as read.
    MarkAsRead {
        /// Room to mark.
        room: ModelRoomId,
    },

    /// Another session of the user reads up to an event.
    OtherSessionReads {
        /// Room of the event.
        room: ModelRoomId,
        /// Picks the read event.
        target: u8,
    },

    /// Another member reads up to an event.
    OtherUserReads {
        /// Room of the event.
        room: ModelRoomId,
        /// Picks the read event.
        target: u8,
    },

    /// The user follows a permalink.
    JumpTo {
        /// Room of the event.
        room: ModelRoomId,
        /// Picks the target event.
        target: u8,
        /// Whether the target may live in a thread.
        include_threads: bool,
    },

    /// The client restarts.
    SaveAndReload,

    /// Advance simulation time.
    AdvanceTime {
        /// Milliseconds to advance.
        millis: u16,
    },
}

/// An operation resolved against the model's events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// The bot sends `spec`.
    Receive {
        /// Room name.
        room: String,
        /// Event to send.
        spec: MessageSpec,
    },
    /// The user sends a message with `body`.
    SendOwn {
        /// Room name.
        room: String,
        /// Message body.
        body: String,
    },
    /// Open a room.
    GoTo {
        /// Room name.
        room: String,
    },
    /// Open the thread rooted at `root` in the focused room.
    OpenThread {
        /// Body of the thread root.
        root: String,
    },
    /// Close the thread panel.
    CloseThread,
    /// Leave the room view.
    GoHome,
    /// Mark a room as read.
    MarkAsRead {
        /// Room name.
        room: String,
    },
    /// Another session reads up to `body`.
    OtherSessionReads {
        /// Room name.
        room: String,
        /// Body of the read event.
        body: String,
    },
    /// Another member reads up to `body`.
    OtherUserReads {
        /// Room name.
        room: String,
        /// Body of the read event.
        body: String,
    },
    /// Jump to `body`.
    JumpTo {
        /// Room name.
        room: String,
        /// Body of the target.
        body: String,
        /// Whether the target may live in a thread.
        include_threads: bool,
    },
    /// Restart the client.
    SaveAndReload,
    /// Advance the clock.
    Tick {
        /// Milliseconds to advance.
        millis: u64,
    },
}

impl Step {
    /// Apply this step to the real system.
    ///
    /// Only jumps can fail.
    pub fn apply_to<S: MarkerStorage>(&self, scenario: &mut Scenario<S>) -> Result<(), EngineError> {
        match self {
            Self::Receive { room, spec } => scenario.receive_messages(room, [spec.clone()]),
            Self::SendOwn { room, body } => scenario.send_own(room, [body.as_str()]),
            Self::GoTo { room } => scenario.go_to(room),
            Self::OpenThread { root } => scenario.open_thread(root),
            Self::CloseThread => scenario.close_thread(),
            Self::GoHome => scenario.go_home(),
            Self::MarkAsRead { room } => scenario.mark_as_read(room),
            Self::OtherSessionReads { room, body } => scenario.other_session_reads(room, body),
            Self::OtherUserReads { room, body } => scenario.other_user_reads(room, body),
            Self::JumpTo { room, body, include_threads } => {
                return scenario.jump_to(room, body, *include_threads);
            },
            Self::SaveAndReload => scenario.save_and_reload(),
            Self::Tick { millis } => scenario.tick(std::time::Duration::from_millis(*millis)),
        }
        Ok(())
    }
}
