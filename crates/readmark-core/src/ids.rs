//! Identifiers.
//!
//! Rooms, events and users are addressed by opaque server-issued strings.
//! Each gets its own newtype so a room id can never be passed where an event
//! id is expected.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Raw identifier.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Room identifier, e.g. `!abc:example.org`.
    RoomId
);

string_id!(
    /// Event identifier, globally unique, e.g. `$xyz`.
    EventId
);

string_id!(
    /// User identifier, e.g. `@alice:example.org`.
    UserId
);

/// A read-tracking scope: a room's main timeline or one of its threads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeKey {
    /// Room the scope belongs to.
    pub room_id: RoomId,
    /// Thread root, `None` for the main timeline.
    pub thread_id: Option<EventId>,
}

impl ScopeKey {
    /// Main timeline of `room_id`.
    pub fn main(room_id: RoomId) -> Self {
        Self { room_id, thread_id: None }
    }

    /// Thread rooted at `root` in `room_id`.
    pub fn thread(room_id: RoomId, root: EventId) -> Self {
        Self { room_id, thread_id: Some(root) }
    }

    /// Whether this scope is a thread.
    pub fn is_thread(&self) -> bool {
        self.thread_id.is_some()
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.thread_id {
            Some(root) => write!(f, "{}/{}", self.room_id, root),
            None => write!(f, "{}", self.room_id),
        }
    }
}
