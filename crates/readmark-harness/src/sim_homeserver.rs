//! In-memory homeserver for scenario tests.
//!
//! Assigns event ids and sequences, keeps each room's full timeline, resolves
//! message bodies to event ids and stores the receipts clients send. Tests
//! address events by body text ("Msg1") the way a user reading the screen
//! would.

use std::collections::HashMap;

use readmark_core::{Event, EventContent, EventId, ReceiptKind, RoomId, ScopeKey, UserId};

/// Description of an event a test wants sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageSpec {
    /// Plain message in the main timeline.
    Plain {
        /// Body used to address the event later.
        body: String,
    },
    /// Reply inside the thread rooted at the message with body `root`.
    ThreadReply {
        /// Body of the thread root.
        root: String,
        /// Body of the reply.
        body: String,
    },
    /// Main-timeline reply to the message with body `target`.
    Reply {
        /// Body of the replied-to message.
        target: String,
        /// Body of the reply.
        body: String,
    },
    /// Edit of the message with body `target`.
    Edit {
        /// Body of the edited message.
        target: String,
        /// Replacement body.
        body: String,
    },
    /// Reaction to the message with body `target`.
    Reaction {
        /// Body of the annotated message.
        target: String,
        /// Reaction key.
        key: String,
    },
    /// State event.
    State {
        /// Whether the state change notifies.
        notify: bool,
    },
}

impl From<&str> for MessageSpec {
    fn from(body: &str) -> Self {
        Self::Plain { body: body.to_string() }
    }
}

/// Reply to `root` inside its thread.
pub fn threaded_off(root: &str, body: &str) -> MessageSpec {
    MessageSpec::ThreadReply { root: root.to_string(), body: body.to_string() }
}

/// Main-timeline reply to `target`.
pub fn reply_to(target: &str, body: &str) -> MessageSpec {
    MessageSpec::Reply { target: target.to_string(), body: body.to_string() }
}

/// Edit of `target` replacing its body with `body`.
pub fn edit_of(target: &str, body: &str) -> MessageSpec {
    MessageSpec::Edit { target: target.to_string(), body: body.to_string() }
}

/// Reaction to `target`.
pub fn reaction_to(target: &str, key: &str) -> MessageSpec {
    MessageSpec::Reaction { target: target.to_string(), key: key.to_string() }
}

/// `count` plain messages with bodies `{prefix}1` .. `{prefix}{count}`.
pub fn many(prefix: &str, count: usize) -> Vec<MessageSpec> {
    (1..=count).map(|i| MessageSpec::Plain { body: format!("{prefix}{i}") }).collect()
}

/// Error raised by the simulated homeserver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimError {
    /// No room with this id.
    UnknownRoom(RoomId),
    /// No event with this body in the room.
    UnknownBody {
        /// Room that was searched.
        room_id: RoomId,
        /// Body that was not found.
        body: String,
    },
    /// Receipt delivery is switched off.
    ReceiptRejected,
}

impl std::fmt::Display for SimError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownRoom(room_id) => write!(f, "unknown room {room_id}"),
            Self::UnknownBody { room_id, body } => {
                write!(f, "no event with body {body:?} in {room_id}")
            },
            Self::ReceiptRejected => write!(f, "receipt rejected"),
        }
    }
}

impl std::error::Error for SimError {}

/// Receipt as stored on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerReceipt {
    /// Acknowledged event.
    pub event_id: EventId,
    /// Sequence of the acknowledged event.
    pub sequence: u64,
}

/// Simulated homeserver.
#[derive(Debug, Default)]
pub struct SimHomeserver {
    timelines: HashMap<RoomId, Vec<Event>>,
    bodies: HashMap<(RoomId, String), EventId>,
    receipts: HashMap<(UserId, ScopeKey, ReceiptKind), ServerReceipt>,
    next_sequence: u64,
    rejecting_receipts: bool,
    receipts_accepted: u64,
}

impl SimHomeserver {
    /// Create a server without rooms.
    pub fn new() -> Self {
        Self { next_sequence: 1, ..Self::default() }
    }

    /// Create a room named `name` and return its id.
    pub fn create_room(&mut self, name: &str) -> RoomId {
        let room_id = RoomId::new(format!("!{name}:sim"));
        self.timelines.entry(room_id.clone()).or_default();
        room_id
    }

    /// Rooms on this server.
    pub fn rooms(&self) -> impl Iterator<Item = &RoomId> {
        self.timelines.keys()
    }

    /// Persist events built from `specs` sent by `sender`.
    ///
    /// Returns the events in server order, ready to be synced to clients.
    pub fn send(
        &mut self,
        room_id: &RoomId,
        sender: &UserId,
        specs: impl IntoIterator<Item = MessageSpec>,
    ) -> Result<Vec<Event>, SimError> {
        if !self.timelines.contains_key(room_id) {
            return Err(SimError::UnknownRoom(room_id.clone()));
        }

        let mut sent = Vec::new();
        for spec in specs {
            let sequence = self.next_sequence;
            self.next_sequence += 1;
            let event_id = EventId::new(format!("${sequence}"));

            let (content, body) = match spec {
                MessageSpec::Plain { body } => (EventContent::Message, Some(body)),
                MessageSpec::ThreadReply { root, body } => {
                    let root = self.resolve(room_id, &root)?;
                    (EventContent::ThreadReply { root }, Some(body))
                },
                MessageSpec::Reply { target, body } => {
                    let target = self.resolve(room_id, &target)?;
                    (EventContent::Reply { target }, Some(body))
                },
                MessageSpec::Edit { target, body } => {
                    let target = self.resolve(room_id, &target)?;
                    (EventContent::Edit { target }, Some(body))
                },
                MessageSpec::Reaction { target, key } => {
                    let target = self.resolve(room_id, &target)?;
                    (EventContent::Reaction { target, key }, None)
                },
                MessageSpec::State { notify } => (EventContent::State { notify }, None),
            };

            if let Some(body) = body {
                self.bodies.insert((room_id.clone(), body), event_id.clone());
            }

            let event = Event::new(event_id, room_id.clone(), sender.clone(), sequence, content);
            if let Some(timeline) = self.timelines.get_mut(room_id) {
                timeline.push(event.clone());
            }
            sent.push(event);
        }

        tracing::trace!(room_id = %room_id, sender = %sender, count = sent.len(), "Server stored events");
        Ok(sent)
    }

    /// Event id of the latest event with `body` in `room_id`.
    pub fn resolve(&self, room_id: &RoomId, body: &str) -> Result<EventId, SimError> {
        self.bodies.get(&(room_id.clone(), body.to_string())).cloned().ok_or_else(|| {
            SimError::UnknownBody { room_id: room_id.clone(), body: body.to_string() }
        })
    }

    /// Full timeline of `room_id` in server order.
    pub fn timeline(&self, room_id: &RoomId) -> &[Event] {
        self.timelines.get(room_id).map_or(&[], Vec::as_slice)
    }

    /// Scope `event_id` is displayed in.
    ///
    /// Edits and reactions follow their target; everything else not in a
    /// thread is in the main timeline.
    pub fn scope_of(&self, room_id: &RoomId, event_id: &EventId) -> ScopeKey {
        let timeline = self.timeline(room_id);
        let mut current = event_id.clone();

        // Relation chains are acyclic: targets always precede their relations
        for _ in 0..timeline.len() {
            let Some(event) = timeline.iter().find(|e| e.event_id == current) else {
                break;
            };
            match &event.content {
                EventContent::ThreadReply { root } => {
                    return ScopeKey::thread(room_id.clone(), root.clone());
                },
                EventContent::Edit { target } | EventContent::Reaction { target, .. } => {
                    current = target.clone();
                },
                _ => break,
            }
        }

        ScopeKey::main(room_id.clone())
    }

    /// Events of `room_id` within `radius` positions of `event_id`.
    pub fn context(&self, room_id: &RoomId, event_id: &EventId, radius: usize) -> Vec<Event> {
        let timeline = self.timeline(room_id);
        let Some(index) = timeline.iter().position(|e| &e.event_id == event_id) else {
            return Vec::new();
        };

        let start = index.saturating_sub(radius);
        let end = (index + radius + 1).min(timeline.len());
        timeline[start..end].to_vec()
    }

    /// Accept a receipt from `user_id`.
    ///
    /// The server keeps the receipt with the highest sequence per user, scope
    /// and kind.
    pub fn receive_receipt(
        &mut self,
        user_id: &UserId,
        scope: &ScopeKey,
        event_id: &EventId,
        kind: ReceiptKind,
    ) -> Result<(), SimError> {
        if self.rejecting_receipts {
            return Err(SimError::ReceiptRejected);
        }

        let sequence = self
            .timeline(&scope.room_id)
            .iter()
            .find(|e| &e.event_id == event_id)
            .map(|e| e.sequence)
            .ok_or_else(|| SimError::UnknownBody {
                room_id: scope.room_id.clone(),
                body: event_id.to_string(),
            })?;

        self.receipts_accepted += 1;
        let key = (user_id.clone(), scope.clone(), kind);
        match self.receipts.get(&key) {
            Some(stored) if stored.sequence >= sequence => {},
            _ => {
                self.receipts.insert(key, ServerReceipt { event_id: event_id.clone(), sequence });
            },
        }
        Ok(())
    }

    /// Stored receipt of `user_id` for `scope`.
    pub fn receipt(
        &self,
        user_id: &UserId,
        scope: &ScopeKey,
        kind: ReceiptKind,
    ) -> Option<&ServerReceipt> {
        self.receipts.get(&(user_id.clone(), scope.clone(), kind))
    }

    /// Every stored receipt of `user_id`, as delivered on initial sync.
    pub fn receipts_for(&self, user_id: &UserId) -> Vec<(RoomId, EventId, ReceiptKind)> {
        let mut receipts: Vec<_> = self
            .receipts
            .iter()
            .filter(|((user, _, _), _)| user == user_id)
            .map(|((_, scope, kind), stored)| {
                (scope.room_id.clone(), stored.event_id.clone(), *kind, stored.sequence)
            })
            .collect();
        receipts.sort_by_key(|(_, _, _, sequence)| *sequence);
        receipts.into_iter().map(|(room, event, kind, _)| (room, event, kind)).collect()
    }

    /// Reject every receipt until switched back.
    pub fn set_rejecting_receipts(&mut self, rejecting: bool) {
        self.rejecting_receipts = rejecting;
    }

    /// Number of receipts accepted so far.
    pub fn receipts_accepted(&self) -> u64 {
        self.receipts_accepted
    }
}
