//! Model world - the reference implementation.
//!
//! A deliberately naive read-state tracker: it keeps every event in a list,
//! one marker per scope, and counts by scanning. It is the oracle against
//! which the engine is verified.

use std::collections::HashMap;

use super::operation::{MODEL_ROOMS, ModelRoomId, Operation, Step, room_name};
use crate::sim_homeserver::{edit_of, reaction_to, threaded_off};

/// Observable read state of one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomObservation {
    /// Room name.
    pub room: String,
    /// Unread main-timeline events.
    pub main_unread: u64,
    /// Badge count.
    pub unread: u64,
    /// Whether the room shows as unread.
    pub is_unread: bool,
    /// Unread count per thread, keyed by root body, sorted.
    pub threads: Vec<(String, u64)>,
}

/// Observable state for oracle comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservableState {
    /// Every room, sorted by name.
    pub rooms: Vec<RoomObservation>,
}

#[derive(Debug, Clone)]
struct ModelEvent {
    body: Option<String>,
    sequence: u64,
    /// Index of the thread root, `None` for the main timeline.
    thread: Option<usize>,
    countable: bool,
    /// Plain message or thread reply: can be targeted by relations.
    targetable: bool,
    /// Main-timeline message: can root a thread.
    can_root: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    BotMessage,
    OwnMessage,
    ThreadReply,
    Relation,
}

#[derive(Debug, Clone)]
struct ModelRoom {
    name: String,
    events: Vec<ModelEvent>,
    main_marker: Option<u64>,
    thread_markers: HashMap<usize, u64>,
}

impl ModelRoom {
    fn head(&self, thread: Option<usize>) -> Option<u64> {
        self.events.iter().filter(|e| e.thread == thread).map(|e| e.sequence).max()
    }

    fn advance(&mut self, thread: Option<usize>, sequence: u64) {
        match thread {
            None => {
                self.main_marker = Some(self.main_marker.map_or(sequence, |m| m.max(sequence)));
            },
            Some(root) => {
                let marker = self.thread_markers.entry(root).or_insert(sequence);
                *marker = (*marker).max(sequence);
            },
        }
    }

    fn advance_to_head(&mut self, thread: Option<usize>) {
        if let Some(head) = self.head(thread) {
            self.advance(thread, head);
        }
    }

    fn count(&self, thread: Option<usize>) -> u64 {
        let marker = match thread {
            None => self.main_marker,
            Some(root) => self.thread_markers.get(&root).copied(),
        };
        self.events
            .iter()
            .filter(|e| e.thread == thread && e.countable)
            .filter(|e| marker.is_none_or(|m| e.sequence > m))
            .count() as u64
    }

    fn thread_roots(&self) -> Vec<usize> {
        let mut roots: Vec<usize> = self.events.iter().filter_map(|e| e.thread).collect();
        roots.sort_unstable();
        roots.dedup();
        roots
    }

    fn observe(&self) -> RoomObservation {
        let main_unread = self.count(None);
        let mut threads: Vec<(String, u64)> = self
            .thread_roots()
            .into_iter()
            .map(|root| (self.events[root].body.clone().unwrap_or_default(), self.count(Some(root))))
            .collect();
        threads.sort();

        let thread_unread: u64 = threads.iter().map(|(_, count)| count).sum();
        RoomObservation {
            room: self.name.clone(),
            main_unread,
            unread: main_unread + thread_unread,
            is_unread: main_unread > 0 || thread_unread > 0,
            threads,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ModelFocus {
    room: usize,
    thread: Option<usize>,
    at_live_edge: bool,
}

/// Outcome of resolving an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    /// No qualifying event; nothing to apply.
    Skipped,
    /// Apply the step; the engine must accept it.
    Apply(Step),
    /// Apply the step; the engine must reject it and change nothing.
    Rejected(Step),
}

/// Model world with [`MODEL_ROOMS`] rooms and one user.
#[derive(Debug, Clone)]
pub struct ModelWorld {
    rooms: Vec<ModelRoom>,
    focus: Option<ModelFocus>,
    next_sequence: u64,
    next_label: u64,
}

impl Default for ModelWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelWorld {
    /// Create the rooms. Each starts read thanks to the user's own join.
    pub fn new() -> Self {
        let mut world = Self { rooms: Vec::new(), focus: None, next_sequence: 1, next_label: 0 };
        for room in 0..MODEL_ROOMS {
            let sequence = world.sequence();
            world.rooms.push(ModelRoom {
                name: room_name(room),
                events: vec![ModelEvent {
                    body: None,
                    sequence,
                    thread: None,
                    countable: false,
                    targetable: false,
                    can_root: false,
                }],
                main_marker: Some(sequence),
                thread_markers: HashMap::new(),
            });
        }
        world
    }

    /// Room names, in creation order.
    pub fn room_names(&self) -> Vec<String> {
        self.rooms.iter().map(|r| r.name.clone()).collect()
    }

    /// Bodies of every labelled event in room `name`.
    pub fn bodies(&self, name: &str) -> Vec<String> {
        self.rooms
            .iter()
            .filter(|r| r.name == name)
            .flat_map(|r| r.events.iter().filter_map(|e| e.body.clone()))
            .collect()
    }

    /// Expected observable state.
    pub fn observable(&self) -> ObservableState {
        let mut rooms: Vec<RoomObservation> = self.rooms.iter().map(ModelRoom::observe).collect();
        rooms.sort_by(|a, b| a.room.cmp(&b.room));
        ObservableState { rooms }
    }

    /// Resolve `op` against the current events and apply it to the model.
    pub fn apply(&mut self, op: &Operation) -> Resolved {
        match op {
            Operation::BotMessage { room } => {
                let body = self.label("m");
                let room = Self::index(*room);
                self.append(room, Some(body.clone()), None, Kind::BotMessage);
                Resolved::Apply(Step::Receive { room: self.name(room), spec: body.as_str().into() })
            },
            Operation::BotThreadReply { room, root } => {
                let room = Self::index(*room);
                let Some(root) = self.pick(room, *root, |e| e.can_root) else {
                    return Resolved::Skipped;
                };
                let root_body = self.body(room, root);
                let body = self.label("t");
                self.append(room, Some(body.clone()), Some(root), Kind::ThreadReply);
                Resolved::Apply(Step::Receive {
                    room: self.name(room),
                    spec: threaded_off(&root_body, &body),
                })
            },
            Operation::BotReaction { room, target } => {
                let room = Self::index(*room);
                let Some(target) = self.pick(room, *target, |e| e.targetable) else {
                    return Resolved::Skipped;
                };
                let target_body = self.body(room, target);
                let thread = self.rooms[room].events[target].thread;
                self.append(room, None, thread, Kind::Relation);
                Resolved::Apply(Step::Receive {
                    room: self.name(room),
                    spec: reaction_to(&target_body, "👍"),
                })
            },
            Operation::BotEdit { room, target } => {
                let room = Self::index(*room);
                let Some(target) = self.pick(room, *target, |e| e.targetable) else {
                    return Resolved::Skipped;
                };
                let target_body = self.body(room, target);
                let thread = self.rooms[room].events[target].thread;
                let body = self.label("e");
                self.append(room, Some(body.clone()), thread, Kind::Relation);
                Resolved::Apply(Step::Receive {
                    room: self.name(room),
                    spec: edit_of(&target_body, &body),
                })
            },
            Operation::OwnMessage { room } => {
                let room = Self::index(*room);
                let body = self.label("o");
                let sequence = self.append(room, Some(body.clone()), None, Kind::OwnMessage);
                self.rooms[room].advance(None, sequence);
                Resolved::Apply(Step::SendOwn { room: self.name(room), body })
            },
            Operation::GoTo { room } => {
                let room = Self::index(*room);
                self.focus = Some(ModelFocus { room, thread: None, at_live_edge: true });
                self.rooms[room].advance_to_head(None);
                Resolved::Apply(Step::GoTo { room: self.name(room) })
            },
            Operation::OpenThread { root } => {
                let Some(room) = self.focus.as_ref().map(|f| f.room) else {
                    return Resolved::Skipped;
                };
                let roots = self.rooms[room].thread_roots();
                if roots.is_empty() {
                    return Resolved::Skipped;
                }
                let root = roots[*root as usize % roots.len()];

                self.focus = Some(ModelFocus { room, thread: Some(root), at_live_edge: true });
                let root_sequence = self.rooms[room].events[root].sequence;
                self.rooms[room].advance_to_head(Some(root));
                self.rooms[room].advance(None, root_sequence);
                Resolved::Apply(Step::OpenThread { root: self.body(room, root) })
            },
            Operation::CloseThread => {
                if let Some(focus) = self.focus.as_mut() {
                    focus.thread = None;
                }
                Resolved::Apply(Step::CloseThread)
            },
            Operation::GoHome => {
                self.focus = None;
                Resolved::Apply(Step::GoHome)
            },
            Operation::MarkAsRead { room } => {
                let room = Self::index(*room);
                self.rooms[room].advance_to_head(None);
                for root in self.rooms[room].thread_roots() {
                    self.rooms[room].advance_to_head(Some(root));
                }
                Resolved::Apply(Step::MarkAsRead { room: self.name(room) })
            },
            Operation::OtherSessionReads { room, target } => {
                let room = Self::index(*room);
                let Some(target) = self.pick(room, *target, |e| e.targetable) else {
                    return Resolved::Skipped;
                };
                let event = self.rooms[room].events[target].clone();
                self.rooms[room].advance(event.thread, event.sequence);
                Resolved::Apply(Step::OtherSessionReads {
                    room: self.name(room),
                    body: self.body(room, target),
                })
            },
            Operation::OtherUserReads { room, target } => {
                let room = Self::index(*room);
                let Some(target) = self.pick(room, *target, |e| e.targetable) else {
                    return Resolved::Skipped;
                };
                Resolved::Apply(Step::OtherUserReads {
                    room: self.name(room),
                    body: self.body(room, target),
                })
            },
            Operation::JumpTo { room, target, include_threads } => {
                let room = Self::index(*room);
                let Some(target) = self.pick(room, *target, |e| e.targetable) else {
                    return Resolved::Skipped;
                };
                let event = self.rooms[room].events[target].clone();
                let step = Step::JumpTo {
                    room: self.name(room),
                    body: self.body(room, target),
                    include_threads: *include_threads,
                };

                if event.thread.is_some() && !include_threads {
                    return Resolved::Rejected(step);
                }

                let at_live_edge = self.rooms[room].head(event.thread) == Some(event.sequence);
                self.focus = Some(ModelFocus { room, thread: event.thread, at_live_edge });
                self.rooms[room].advance(event.thread, event.sequence);
                Resolved::Apply(step)
            },
            Operation::SaveAndReload => {
                self.focus = None;
                Resolved::Apply(Step::SaveAndReload)
            },
            Operation::AdvanceTime { millis } => {
                Resolved::Apply(Step::Tick { millis: u64::from(*millis) })
            },
        }
    }

    fn index(room: ModelRoomId) -> usize {
        (room % MODEL_ROOMS) as usize
    }

    fn name(&self, room: usize) -> String {
        self.rooms[room].name.clone()
    }

    fn body(&self, room: usize, event: usize) -> String {
        self.rooms[room].events[event].body.clone().unwrap_or_default()
    }

    fn sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    fn label(&mut self, prefix: &str) -> String {
        self.next_label += 1;
        format!("{prefix}{}", self.next_label)
    }

    fn pick(&self, room: usize, n: u8, filter: impl Fn(&ModelEvent) -> bool) -> Option<usize> {
        let candidates: Vec<usize> = self.rooms[room]
            .events
            .iter()
            .enumerate()
            .filter(|(_, e)| filter(e))
            .map(|(i, _)| i)
            .collect();
        if candidates.is_empty() { None } else { Some(candidates[n as usize % candidates.len()]) }
    }

    /// Append an event and follow the live edge. Returns its sequence.
    fn append(
        &mut self,
        room: usize,
        body: Option<String>,
        thread: Option<usize>,
        kind: Kind,
    ) -> u64 {
        let sequence = self.sequence();
        self.rooms[room].events.push(ModelEvent {
            body,
            sequence,
            thread,
            countable: matches!(kind, Kind::BotMessage | Kind::ThreadReply),
            targetable: kind != Kind::Relation,
            can_root: matches!(kind, Kind::BotMessage | Kind::OwnMessage),
        });

        if let Some(focus) = self.focus.clone() {
            if focus.room == room && focus.at_live_edge {
                if thread.is_none() {
                    self.rooms[room].advance(None, sequence);
                } else if focus.thread == thread {
                    self.rooms[room].advance(thread, sequence);
                }
            }
        }

        sequence
    }
}
