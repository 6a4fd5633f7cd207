//! Scenario driver: one user, one bot, one homeserver.
//!
//! Steps read like the user's actions ("go to room1", "open the thread of
//! Msg1") and the assertions read like what the user sees in the room list.
//! Every step executes the engine's actions against the simulated homeserver
//! and then checks the standard invariants.
//!
//! # Usage
//!
//! ```ignore
//! let mut s = Scenario::new();
//! s.create_room("room1");
//! s.receive_messages("room1", ["Msg1"]);
//! s.assert_unread("room1", 1);
//! s.go_to("room1");
//! s.assert_read("room1");
//! ```

#![allow(clippy::panic, clippy::expect_used, reason = "Scenario steps fail the test on misuse")]

use std::{
    collections::{HashMap, HashSet, VecDeque},
    time::Duration,
};

use readmark_core::{
    EngineAction, EngineConfig, EngineError, Environment, Event, EventId, ReadStateEngine,
    ReceiptKind, RoomId, RoomReadState, ScopeKey, UserId,
};
use readmark_storage::{MarkerStorage, MemoryStorage};

use crate::{
    invariants::{InvariantRegistry, SystemSnapshot},
    sim_env::SimEnv,
    sim_homeserver::{MessageSpec, SimHomeserver},
};

/// Local user driven by the scenario.
pub const OWN_USER: &str = "@me:sim";

/// User sending messages into the rooms.
pub const BOT_USER: &str = "@bot:sim";

/// Another room member whose receipts the engine must ignore.
pub const OTHER_USER: &str = "@alice:sim";

/// Events loaded on each side of a jump target.
const CONTEXT_RADIUS: usize = 10;

#[derive(Debug, Clone)]
struct HeldContext {
    request_id: u64,
    room_id: RoomId,
    event_id: EventId,
}

/// Deterministic scenario driver around one [`ReadStateEngine`].
pub struct Scenario<S: MarkerStorage = MemoryStorage> {
    env: SimEnv,
    config: EngineConfig,
    me: UserId,
    bot: UserId,
    server: SimHomeserver,
    storage: S,
    engine: ReadStateEngine<SimEnv, S>,
    rooms: HashMap<String, RoomId>,
    current_room: Option<RoomId>,
    delivered: HashSet<EventId>,
    gaps: HashMap<RoomId, Vec<u64>>,
    hold_context: bool,
    held_context: Option<HeldContext>,
    marker_history: HashMap<ScopeKey, Vec<u64>>,
    invariants: InvariantRegistry,
    failed_sends: usize,
    not_persisted: usize,
    step: usize,
}

impl Scenario<MemoryStorage> {
    /// Scenario with default configuration and in-memory storage.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Scenario with `config` and in-memory storage.
    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_storage(config, MemoryStorage::new())
    }
}

impl Default for Scenario<MemoryStorage> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: MarkerStorage> Scenario<S> {
    /// Scenario over `storage`.
    ///
    /// # Panics
    ///
    /// Panics if the engine cannot load markers from `storage`.
    pub fn with_storage(config: EngineConfig, storage: S) -> Self {
        Self::try_with_storage(SimEnv::new(), config, storage).expect("engine should open")
    }

    /// Scenario over `storage` with an explicit environment.
    pub fn try_with_storage(
        env: SimEnv,
        config: EngineConfig,
        storage: S,
    ) -> Result<Self, EngineError> {
        let me = UserId::from(OWN_USER);
        let engine = ReadStateEngine::open(env.clone(), config.clone(), me.clone(), storage.clone())?;

        Ok(Self {
            env,
            config,
            me,
            bot: UserId::from(BOT_USER),
            server: SimHomeserver::new(),
            storage,
            engine,
            rooms: HashMap::new(),
            current_room: None,
            delivered: HashSet::new(),
            gaps: HashMap::new(),
            hold_context: false,
            held_context: None,
            marker_history: HashMap::new(),
            invariants: InvariantRegistry::standard(),
            failed_sends: 0,
            not_persisted: 0,
            step: 0,
        })
    }

    // Rooms

    /// Create a room the user has joined. It starts read.
    pub fn create_room(&mut self, name: &str) -> RoomId {
        let room_id = self.server.create_room(name);
        self.rooms.insert(name.to_string(), room_id.clone());

        let join = self
            .server
            .send(&room_id, &self.me, [MessageSpec::State { notify: false }])
            .expect("room was just created");
        self.deliver(&room_id, join, false);
        self.observe("create_room");

        room_id
    }

    /// Id of the room created as `name`.
    pub fn room_id(&self, name: &str) -> RoomId {
        self.rooms.get(name).cloned().unwrap_or_else(|| panic!("no room named {name}"))
    }

    /// Event id of the message with `body` in room `name`.
    pub fn event_id(&self, name: &str, body: &str) -> EventId {
        let room_id = self.room_id(name);
        self.server.resolve(&room_id, body).unwrap_or_else(|e| panic!("{e}"))
    }

    // Navigation

    /// Open room `name` at its latest messages.
    pub fn go_to(&mut self, name: &str) {
        let room_id = self.room_id(name);
        self.current_room = Some(room_id.clone());
        let actions = self.engine.view_room(&room_id);
        self.settle(actions, "go_to");
    }

    /// Leave the room view, e.g. by opening the home page.
    pub fn go_home(&mut self) {
        self.current_room = None;
        let actions = self.engine.clear_focus();
        self.settle(actions, "go_home");
    }

    /// Open the thread rooted at the message with `root_body` in the current
    /// room.
    pub fn open_thread(&mut self, root_body: &str) {
        let room_id = self.current_room.clone().expect("open a room before a thread");
        let root = self.server.resolve(&room_id, root_body).unwrap_or_else(|e| panic!("{e}"));

        let actions = self
            .engine
            .view_thread(&room_id, &root)
            .unwrap_or_else(|e| panic!("cannot open thread {root_body}: {e}"));
        self.settle(actions, "open_thread");
    }

    /// Close the thread panel, staying in the room.
    pub fn close_thread(&mut self) {
        let actions = self.engine.close_thread();
        self.settle(actions, "close_thread");
    }

    /// Use "mark as read" on room `name`.
    pub fn mark_as_read(&mut self, name: &str) {
        let room_id = self.room_id(name);
        let actions = self.engine.mark_room_as_read(&room_id);
        self.settle(actions, "mark_as_read");
    }

    /// Jump to the message with `body`, e.g. by following a permalink.
    ///
    /// Context requests are answered from the homeserver right away unless
    /// [`Scenario::hold_context_requests`] is set.
    pub fn jump_to(
        &mut self,
        name: &str,
        body: &str,
        include_threads: bool,
    ) -> Result<(), EngineError> {
        let room_id = self.room_id(name);
        let event_id = self.event_id(name, body);

        let actions = self.engine.jump_to_event(&room_id, &event_id, include_threads)?;
        self.current_room = Some(room_id);
        let result = self.execute(actions);
        self.observe("jump_to");
        result
    }

    /// Keep context requests pending until
    /// [`Scenario::answer_held_context`] is called.
    pub fn hold_context_requests(&mut self, hold: bool) {
        self.hold_context = hold;
    }

    /// Request id of the context request currently held.
    pub fn held_request(&self) -> Option<u64> {
        self.held_context.as_ref().map(|held| held.request_id)
    }

    /// Answer the held context request, even if the engine moved on.
    pub fn answer_held_context(&mut self) -> Result<(), EngineError> {
        let Some(held) = self.held_context.take() else {
            return Ok(());
        };

        let result = self.answer_context(&held);
        self.observe("answer_held_context");
        result
    }

    // Messages

    /// The bot sends `specs` to room `name`; the client syncs them.
    pub fn receive_messages<M: Into<MessageSpec>>(
        &mut self,
        name: &str,
        specs: impl IntoIterator<Item = M>,
    ) {
        let events = self.bot_sends(name, specs);
        let room_id = self.room_id(name);
        self.deliver(&room_id, events, false);
        self.observe("receive_messages");
    }

    /// The bot sends `specs` that mention the user.
    pub fn receive_mentions<M: Into<MessageSpec>>(
        &mut self,
        name: &str,
        specs: impl IntoIterator<Item = M>,
    ) {
        let events: Vec<Event> =
            self.bot_sends(name, specs).into_iter().map(|e| e.with_highlight(true)).collect();
        let room_id = self.room_id(name);
        self.deliver(&room_id, events, false);
        self.observe("receive_mentions");
    }

    /// The bot sends `specs` while the client is offline. Nothing is synced.
    pub fn server_receives<M: Into<MessageSpec>>(
        &mut self,
        name: &str,
        specs: impl IntoIterator<Item = M>,
    ) {
        self.bot_sends(name, specs);
    }

    /// The bot sends `specs` and the client syncs only them, in a limited
    /// batch skipping everything it missed.
    pub fn receive_messages_after_gap<M: Into<MessageSpec>>(
        &mut self,
        name: &str,
        specs: impl IntoIterator<Item = M>,
    ) {
        let events = self.bot_sends(name, specs);
        let room_id = self.room_id(name);
        self.deliver(&room_id, events, true);
        self.observe("receive_messages_after_gap");
    }

    /// Paginate room `name`: load every missed event and close its gaps.
    pub fn backfill(&mut self, name: &str) {
        let room_id = self.room_id(name);
        let missing: Vec<Event> = self
            .server
            .timeline(&room_id)
            .iter()
            .filter(|e| !self.delivered.contains(&e.event_id))
            .cloned()
            .collect();
        self.delivered.extend(missing.iter().map(|e| e.event_id.clone()));

        let mut gaps = self.gaps.remove(&room_id).unwrap_or_default().into_iter();
        let actions = self.engine.receive_backfill(&room_id, missing, gaps.next());
        let mut queue = actions;
        for gap in gaps {
            queue.extend(self.engine.receive_backfill(&room_id, Vec::new(), Some(gap)));
        }
        self.settle(queue, "backfill");
    }

    /// The user sends `specs` from this client.
    pub fn send_own<M: Into<MessageSpec>>(
        &mut self,
        name: &str,
        specs: impl IntoIterator<Item = M>,
    ) {
        let room_id = self.room_id(name);
        let events = self
            .server
            .send(&room_id, &self.me, specs.into_iter().map(Into::into))
            .unwrap_or_else(|e| panic!("{e}"));
        self.deliver(&room_id, events, false);
        self.observe("send_own");
    }

    // Receipts

    /// Another session of the user reads up to `body`.
    pub fn other_session_reads(&mut self, name: &str, body: &str) {
        let room_id = self.room_id(name);
        let event_id = self.event_id(name, body);
        let scope = self.server.scope_of(&room_id, &event_id);

        self.server
            .receive_receipt(&self.me, &scope, &event_id, ReceiptKind::Public)
            .unwrap_or_else(|e| panic!("{e}"));

        let actions =
            self.engine.receive_remote_receipt(&room_id, &self.me, &event_id, ReceiptKind::Public);
        self.settle(actions, "other_session_reads");
    }

    /// Another session of the user sends an unthreaded receipt for `body`,
    /// reading the main timeline and every thread up to it.
    pub fn other_session_reads_unthreaded(&mut self, name: &str, body: &str) {
        let room_id = self.room_id(name);
        let event_id = self.event_id(name, body);
        let scope = self.server.scope_of(&room_id, &event_id);

        self.server
            .receive_receipt(&self.me, &scope, &event_id, ReceiptKind::Public)
            .unwrap_or_else(|e| panic!("{e}"));

        let actions = self.engine.receive_unthreaded_receipt(
            &room_id,
            &self.me,
            &event_id,
            ReceiptKind::Public,
        );
        self.settle(actions, "other_session_reads_unthreaded");
    }

    /// Another member reads up to `body`.
    pub fn other_user_reads(&mut self, name: &str, body: &str) {
        let room_id = self.room_id(name);
        let event_id = self.event_id(name, body);
        let other = UserId::from(OTHER_USER);

        let actions =
            self.engine.receive_remote_receipt(&room_id, &other, &event_id, ReceiptKind::Public);
        self.settle(actions, "other_user_reads");
    }

    /// Make the homeserver reject (or accept again) every receipt.
    pub fn reject_receipts(&mut self, rejecting: bool) {
        self.server.set_rejecting_receipts(rejecting);
    }

    // Lifecycle

    /// Restart the client: a fresh engine over the same storage, a full
    /// initial sync of every room, then the receipts the server stored.
    ///
    /// # Panics
    ///
    /// Panics if the engine cannot load markers from storage.
    pub fn save_and_reload(&mut self) {
        self.try_save_and_reload().expect("engine should reopen");
    }

    /// Fallible form of [`Scenario::save_and_reload`].
    pub fn try_save_and_reload(&mut self) -> Result<(), EngineError> {
        self.engine = ReadStateEngine::open(
            self.env.clone(),
            self.config.clone(),
            self.me.clone(),
            self.storage.clone(),
        )?;
        self.current_room = None;
        self.delivered.clear();
        self.gaps.clear();
        self.held_context = None;

        tracing::debug!(step = self.step, "Reloading client");

        let mut rooms: Vec<RoomId> = self.rooms.values().cloned().collect();
        rooms.sort();
        for room_id in rooms {
            let events = self.server.timeline(&room_id).to_vec();
            self.deliver(&room_id, events, false);
        }

        for (room_id, event_id, kind) in self.server.receipts_for(&self.me) {
            let actions = self.engine.receive_remote_receipt(&room_id, &self.me, &event_id, kind);
            self.execute(actions)?;
        }

        self.observe("save_and_reload");
        Ok(())
    }

    /// Leave room `name` and forget it locally.
    pub fn forget_room(&mut self, name: &str) {
        let room_id = self.room_id(name);
        let actions = self.engine.forget_room(&room_id).unwrap_or_else(|e| panic!("{e}"));
        self.marker_history.retain(|scope, _| scope.room_id != room_id);
        self.rooms.remove(name);
        if self.current_room.as_ref() == Some(&room_id) {
            self.current_room = None;
        }
        self.settle(actions, "forget_room");
    }

    /// Advance the virtual clock and tick the engine.
    pub fn tick(&mut self, elapsed: Duration) {
        self.env.advance(elapsed);
        let actions = self.engine.tick(self.env.now());
        self.settle(actions, "tick");
    }

    // Assertions

    /// Room `name` shows no unread indicator.
    pub fn assert_read(&self, name: &str) {
        let state = self.read_state(name);
        assert!(!state.is_room_unread, "expected {name} to be read, got {state:#?}");
    }

    /// Room `name` is still read after an event that must not change it.
    pub fn assert_still_read(&self, name: &str) {
        self.assert_read(name);
    }

    /// Room `name` shows exactly `count` unread.
    pub fn assert_unread(&self, name: &str, count: u64) {
        let state = self.read_state(name);
        assert!(state.is_room_unread, "expected {name} to be unread, got {state:#?}");
        assert_eq!(state.unread_count, count, "unread count of {name}: {state:#?}");
    }

    /// Room `name` is unread with fewer than `count` unread.
    pub fn assert_unread_less_than(&self, name: &str, count: u64) {
        let state = self.read_state(name);
        assert!(state.is_room_unread, "expected {name} to be unread, got {state:#?}");
        assert!(
            state.unread_count < count,
            "expected fewer than {count} unread in {name}, got {state:#?}"
        );
    }

    /// Room `name` is unread with more than `count` unread.
    pub fn assert_unread_greater_than(&self, name: &str, count: u64) {
        let state = self.read_state(name);
        assert!(state.is_room_unread, "expected {name} to be unread, got {state:#?}");
        assert!(
            state.unread_count > count,
            "expected more than {count} unread in {name}, got {state:#?}"
        );
    }

    /// The thread rooted at `root_body` in room `name` is read.
    pub fn assert_read_thread(&self, name: &str, root_body: &str) {
        let root = self.event_id(name, root_body);
        let state = self.read_state(name);
        let thread = state
            .thread(&root)
            .unwrap_or_else(|| panic!("no thread {root_body} in {name}: {state:#?}"));
        assert!(!thread.has_unread, "expected thread {root_body} to be read, got {thread:#?}");
    }

    /// The thread rooted at `root_body` in room `name` has unread replies.
    pub fn assert_unread_thread(&self, name: &str, root_body: &str) {
        let root = self.event_id(name, root_body);
        let state = self.read_state(name);
        let thread = state
            .thread(&root)
            .unwrap_or_else(|| panic!("no thread {root_body} in {name}: {state:#?}"));
        assert!(thread.has_unread, "expected thread {root_body} to be unread, got {thread:#?}");
    }

    // Accessors

    /// Current read state of room `name`.
    pub fn read_state(&self, name: &str) -> RoomReadState {
        self.engine.room_read_state(&self.room_id(name))
    }

    /// Engine under test.
    pub fn engine(&self) -> &ReadStateEngine<SimEnv, S> {
        &self.engine
    }

    /// Simulated homeserver.
    pub fn server(&self) -> &SimHomeserver {
        &self.server
    }

    /// Simulated environment.
    pub fn env(&self) -> &SimEnv {
        &self.env
    }

    /// Local user.
    pub fn me(&self) -> &UserId {
        &self.me
    }

    /// Receipt sends the homeserver rejected.
    pub fn failed_sends(&self) -> usize {
        self.failed_sends
    }

    /// `MarkerNotPersisted` actions seen.
    pub fn not_persisted(&self) -> usize {
        self.not_persisted
    }

    /// Invariants checked after every step.
    pub fn invariants_mut(&mut self) -> &mut InvariantRegistry {
        &mut self.invariants
    }

    /// Snapshot of the engine and storage, with the recorded marker history.
    pub fn snapshot(&self) -> Option<SystemSnapshot> {
        let mut rooms: Vec<RoomId> = self.rooms.values().cloned().collect();
        rooms.sort();

        match SystemSnapshot::capture(&self.engine, rooms) {
            Ok(snapshot) => Some(snapshot.with_history(self.marker_history.clone())),
            Err(e) => {
                tracing::debug!(error = %e, "Snapshot skipped, storage unreadable");
                None
            },
        }
    }

    // Internals

    fn bot_sends<M: Into<MessageSpec>>(
        &mut self,
        name: &str,
        specs: impl IntoIterator<Item = M>,
    ) -> Vec<Event> {
        let room_id = self.room_id(name);
        self.server
            .send(&room_id, &self.bot, specs.into_iter().map(Into::into))
            .unwrap_or_else(|e| panic!("{e}"))
    }

    fn deliver(&mut self, room_id: &RoomId, events: Vec<Event>, limited: bool) {
        self.delivered.extend(events.iter().map(|e| e.event_id.clone()));
        if limited {
            if let Some(first) = events.iter().map(|e| e.sequence).min() {
                self.gaps.entry(room_id.clone()).or_default().push(first);
            }
        }

        let actions = self.engine.receive_events(room_id, events, limited);
        if let Err(e) = self.execute(actions) {
            panic!("sync produced an engine error: {e}");
        }
    }

    fn settle(&mut self, actions: Vec<EngineAction>, context: &str) {
        if let Err(e) = self.execute(actions) {
            panic!("{context} produced an engine error: {e}");
        }
        self.observe(context);
    }

    /// Run `actions` against the homeserver until none are left.
    fn execute(&mut self, actions: Vec<EngineAction>) -> Result<(), EngineError> {
        let mut queue: VecDeque<EngineAction> = actions.into();
        let mut result = Ok(());

        while let Some(action) = queue.pop_front() {
            match action {
                EngineAction::SendReceipt { scope, event_id, kind } => {
                    if let Err(e) = self.server.receive_receipt(&self.me, &scope, &event_id, kind) {
                        self.failed_sends += 1;
                        let more = self.engine.receipt_send_failed(&scope, &event_id, &e.to_string());
                        queue.extend(more);
                    }
                },
                EngineAction::RequestContext { request_id, room_id, event_id } => {
                    let held = HeldContext { request_id, room_id, event_id };
                    if self.hold_context {
                        self.held_context = Some(held);
                    } else if let Err(e) = self.answer_context(&held) {
                        result = Err(e);
                    }
                },
                EngineAction::MarkerNotPersisted { scope, kind, reason } => {
                    tracing::debug!(scope = %scope, ?kind, reason, "Marker not persisted");
                    self.not_persisted += 1;
                },
            }
        }

        result
    }

    fn answer_context(&mut self, held: &HeldContext) -> Result<(), EngineError> {
        let events = self.server.context(&held.room_id, &held.event_id, CONTEXT_RADIUS);
        self.delivered.extend(events.iter().map(|e| e.event_id.clone()));

        let actions = self.engine.context_loaded(held.request_id, events)?;
        self.execute(actions)
    }

    /// Record marker history and check invariants.
    fn observe(&mut self, context: &str) {
        self.step += 1;

        let mut effective: HashMap<ScopeKey, u64> = HashMap::new();
        for (scope, marker) in self.engine.receipts().iter() {
            let entry = effective.entry(scope.clone()).or_insert(marker.sequence);
            *entry = (*entry).max(marker.sequence);
        }
        for (scope, sequence) in effective {
            self.marker_history.entry(scope).or_default().push(sequence);
        }

        if let Some(snapshot) = self.snapshot() {
            self.invariants.assert_all(&snapshot, &format!("after step {} ({context})", self.step));
        }
    }
}

