//! Read-state controller.
//!
//! [`ReadStateEngine`] owns the timeline index, the receipt store and the
//! receipt outbox, and is the only thing that mutates them. It follows the
//! action pattern: every operation takes `&mut self`, applies its effect
//! locally and synchronously, and returns [`EngineAction`]s for the caller to
//! execute (send a receipt, fetch context around an event).
//!
//! # Marker rules
//!
//! - Viewing the main timeline advances only the main marker.
//! - Viewing a thread advances the thread marker to the thread head and the
//!   main marker up to the thread root, never past it.
//! - Marking a room as read advances the main marker and every thread marker
//!   to their heads.
//! - Jumping to an event advances only that event's scope, up to the event.
//! - Reading a scope to its head also reads across its gaps: the marker
//!   keeps the head event but takes the sequence of the newest gap when that
//!   is higher.
//! - Local advances write the private marker and queue a receipt send.
//!   Remote receipts update the marker of their own kind. An unthreaded
//!   remote receipt reads every scope of the room up to its sequence.
//!
//! # Focus
//!
//! The engine tracks which room (and thread) the user is looking at. While
//! the focus sits at the live edge, new events in the focused scopes are read
//! as they arrive. Jumping into history leaves the live edge.

use std::collections::HashMap;

use readmark_storage::MarkerStorage;

use crate::{
    aggregate::{RoomReadState, ThreadSummary, compute_room_read_state, compute_thread_summary},
    classify::Classifier,
    config::EngineConfig,
    env::Environment,
    error::EngineError,
    event::Event,
    ids::{EventId, RoomId, ScopeKey, UserId},
    observer::{ObserverList, ReadStateObserver, SubscriptionId},
    outbox::ReceiptOutbox,
    receipts::{Advance, ReceiptKind, ReceiptStore, ReceiptThreading},
    timeline::{Appended, TimelineIndex},
};

/// Remote receipts for unknown events are held at most this many at a time.
const MAX_DEFERRED_RECEIPTS: usize = 4096;

/// Events the caller feeds into the engine.
///
/// Generic over `I` (Instant type) to support both production
/// (`std::time::Instant`) and simulation environments.
#[derive(Debug, Clone)]
pub enum EngineEvent<I = std::time::Instant> {
    /// User marked the whole room as read.
    MarkRoomAsRead {
        /// Room to mark.
        room_id: RoomId,
    },

    /// User opened the room's main timeline at its latest events.
    ViewRoom {
        /// Room being viewed.
        room_id: RoomId,
    },

    /// User opened a thread.
    ViewThread {
        /// Room containing the thread.
        room_id: RoomId,
        /// Thread root.
        thread_id: EventId,
    },

    /// User closed the thread panel.
    CloseThread,

    /// User left the room view.
    ClearFocus,

    /// User jumped to a specific event.
    JumpToEvent {
        /// Room containing the event.
        room_id: RoomId,
        /// Jump target.
        event_id: EventId,
        /// Whether the target may live in a thread.
        include_threads: bool,
    },

    /// Result of a [`EngineAction::RequestContext`] fetch.
    ContextLoaded {
        /// Request being answered.
        request_id: u64,
        /// Events around the requested event.
        events: Vec<Event>,
    },

    /// Sync delivered new events.
    ReceiveEvents {
        /// Room the batch belongs to.
        room_id: RoomId,
        /// New events in server order.
        events: Vec<Event>,
        /// Whether the server skipped events before this batch.
        limited: bool,
    },

    /// Pagination delivered older events.
    ReceiveBackfill {
        /// Room the batch belongs to.
        room_id: RoomId,
        /// Older events.
        events: Vec<Event>,
        /// Gap this batch closes, identified by its sequence.
        filled_gap: Option<u64>,
    },

    /// Receipt transport reported a receipt.
    RemoteReceipt {
        /// Room the receipt was sent in.
        room_id: RoomId,
        /// User the receipt belongs to.
        user_id: UserId,
        /// Acknowledged event.
        event_id: EventId,
        /// Receipt kind.
        kind: ReceiptKind,
        /// Whether the receipt reads one scope or the whole room.
        threading: ReceiptThreading,
    },

    /// Receipt transport failed to deliver a send.
    ReceiptSendFailed {
        /// Scope of the failed receipt.
        scope: ScopeKey,
        /// Event of the failed receipt.
        event_id: EventId,
        /// Transport error.
        reason: String,
    },

    /// User left the room; drop everything about it.
    ForgetRoom {
        /// Room to forget.
        room_id: RoomId,
    },

    /// Time tick for debounced sends and storage retries.
    Tick {
        /// Current time from the environment.
        now: I,
    },
}

/// Actions the engine produces for the caller to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineAction {
    /// Send a receipt through the receipt transport. Fire and forget.
    SendReceipt {
        /// Scope of the receipt (main timeline or thread).
        scope: ScopeKey,
        /// Acknowledged event.
        event_id: EventId,
        /// Receipt kind to send.
        kind: ReceiptKind,
    },

    /// Fetch events around `event_id` and answer with
    /// [`EngineEvent::ContextLoaded`].
    RequestContext {
        /// Correlates the answer. Only the latest request is honored.
        request_id: u64,
        /// Room containing the event.
        room_id: RoomId,
        /// Event to fetch context for.
        event_id: EventId,
    },

    /// A marker advanced in memory but could not be written to storage.
    ///
    /// The engine retries on the next tick.
    MarkerNotPersisted {
        /// Scope of the marker.
        scope: ScopeKey,
        /// Kind of the marker.
        kind: ReceiptKind,
        /// Storage error.
        reason: String,
    },
}

/// What the user is looking at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Focus {
    /// Focused room.
    pub room_id: RoomId,
    /// Open thread, if any.
    pub thread_id: Option<EventId>,
    /// Whether new events are read as they arrive.
    pub at_live_edge: bool,
}

#[derive(Debug, Clone)]
struct PendingJump {
    request_id: u64,
    room_id: RoomId,
    event_id: EventId,
    include_threads: bool,
}

#[derive(Debug, Clone)]
struct DeferredReceipt {
    room_id: RoomId,
    receipts: Vec<(ReceiptKind, ReceiptThreading)>,
}

/// Read-state controller for one local user.
pub struct ReadStateEngine<E: Environment, S: MarkerStorage> {
    env: E,
    config: EngineConfig,
    own_user: UserId,
    timeline: TimelineIndex,
    receipts: ReceiptStore<S>,
    outbox: ReceiptOutbox<E::Instant>,
    observers: ObserverList,
    /// Last state reported to observers, per room.
    reported: HashMap<RoomId, RoomReadState>,
    focus: Option<Focus>,
    pending_jump: Option<PendingJump>,
    deferred: HashMap<EventId, DeferredReceipt>,
}

impl<E: Environment, S: MarkerStorage> ReadStateEngine<E, S> {
    /// Create an engine from already built components.
    ///
    /// `timeline` should classify for `own_user` with the same `config`.
    pub fn new(
        env: E,
        config: EngineConfig,
        own_user: UserId,
        timeline: TimelineIndex,
        receipts: ReceiptStore<S>,
    ) -> Self {
        let outbox = ReceiptOutbox::new(config.receipt_debounce);
        Self {
            env,
            config,
            own_user,
            timeline,
            receipts,
            outbox,
            observers: ObserverList::new(),
            reported: HashMap::new(),
            focus: None,
            pending_jump: None,
            deferred: HashMap::new(),
        }
    }

    /// Create an engine with an empty timeline and markers restored from
    /// `storage`.
    pub fn open(
        env: E,
        config: EngineConfig,
        own_user: UserId,
        storage: S,
    ) -> Result<Self, EngineError> {
        let timeline = TimelineIndex::new(Classifier::new(own_user.clone(), &config));
        let receipts = ReceiptStore::open(storage)?;

        tracing::info!(user_id = %own_user, "Read-state engine opened");

        Ok(Self::new(env, config, own_user, timeline, receipts))
    }

    /// Process an event and return resulting actions.
    pub fn handle(
        &mut self,
        event: EngineEvent<E::Instant>,
    ) -> Result<Vec<EngineAction>, EngineError> {
        match event {
            EngineEvent::MarkRoomAsRead { room_id } => Ok(self.mark_room_as_read(&room_id)),
            EngineEvent::ViewRoom { room_id } => Ok(self.view_room(&room_id)),
            EngineEvent::ViewThread { room_id, thread_id } => {
                self.view_thread(&room_id, &thread_id)
            },
            EngineEvent::CloseThread => Ok(self.close_thread()),
            EngineEvent::ClearFocus => Ok(self.clear_focus()),
            EngineEvent::JumpToEvent { room_id, event_id, include_threads } => {
                self.jump_to_event(&room_id, &event_id, include_threads)
            },
            EngineEvent::ContextLoaded { request_id, events } => {
                self.context_loaded(request_id, events)
            },
            EngineEvent::ReceiveEvents { room_id, events, limited } => {
                Ok(self.receive_events(&room_id, events, limited))
            },
            EngineEvent::ReceiveBackfill { room_id, events, filled_gap } => {
                Ok(self.receive_backfill(&room_id, events, filled_gap))
            },
            EngineEvent::RemoteReceipt { room_id, user_id, event_id, kind, threading } => {
                Ok(self.remote_receipt(&room_id, &user_id, &event_id, kind, threading))
            },
            EngineEvent::ReceiptSendFailed { scope, event_id, reason } => {
                Ok(self.receipt_send_failed(&scope, &event_id, &reason))
            },
            EngineEvent::ForgetRoom { room_id } => self.forget_room(&room_id),
            EngineEvent::Tick { now } => Ok(self.tick(now)),
        }
    }

    /// Mark the main timeline and every thread of `room_id` as read.
    ///
    /// Every marker that moves is persisted in one atomic write.
    pub fn mark_room_as_read(&mut self, room_id: &RoomId) -> Vec<EngineAction> {
        let mut actions = Vec::new();

        let mut updates = Vec::new();
        for scope in self.room_scopes(room_id) {
            if let Some((event_id, sequence)) = self.read_horizon(&scope) {
                if !self.receipts.get_marker(&scope).is_some_and(|m| sequence <= m.sequence) {
                    updates.push((scope, event_id, sequence));
                }
            }
        }
        self.advance_local_batch(updates, &mut actions);

        tracing::debug!(room_id = %room_id, "Marked room as read");

        self.refresh(room_id);
        self.release_due(&mut actions);
        actions
    }

    /// Open the main timeline of `room_id` at its latest events.
    ///
    /// Thread markers are left alone.
    pub fn view_room(&mut self, room_id: &RoomId) -> Vec<EngineAction> {
        let mut actions = Vec::new();

        self.supersede_jump();
        self.focus = Some(Focus { room_id: room_id.clone(), thread_id: None, at_live_edge: true });

        let main = ScopeKey::main(room_id.clone());
        self.advance_to_head(&main, &mut actions);

        self.refresh(room_id);
        self.release_due(&mut actions);
        actions
    }

    /// Open the thread rooted at `thread_id`.
    ///
    /// # Errors
    ///
    /// - `EngineError::UnknownThread` if the thread has no replies and its
    ///   root is not indexed
    pub fn view_thread(
        &mut self,
        room_id: &RoomId,
        thread_id: &EventId,
    ) -> Result<Vec<EngineAction>, EngineError> {
        let root_known = self.timeline.root_known(room_id, thread_id);
        if !root_known && !self.timeline.has_thread(room_id, thread_id) {
            return Err(EngineError::UnknownThread {
                room_id: room_id.clone(),
                thread_id: thread_id.clone(),
            });
        }

        let mut actions = Vec::new();

        self.supersede_jump();
        self.focus = Some(Focus {
            room_id: room_id.clone(),
            thread_id: Some(thread_id.clone()),
            at_live_edge: true,
        });

        let thread = ScopeKey::thread(room_id.clone(), thread_id.clone());
        self.advance_to_head(&thread, &mut actions);

        if root_known {
            if let Some(sequence) = self.timeline.position_of(thread_id).map(|p| p.sequence) {
                let main = ScopeKey::main(room_id.clone());
                self.advance_local(main, thread_id.clone(), sequence, &mut actions);
            }
        }

        tracing::debug!(room_id = %room_id, thread_id = %thread_id, "Viewing thread");

        self.refresh(room_id);
        self.release_due(&mut actions);
        Ok(actions)
    }

    /// Close the open thread, keeping the room focused.
    pub fn close_thread(&mut self) -> Vec<EngineAction> {
        if let Some(focus) = self.focus.as_mut() {
            focus.thread_id = None;
        }

        let mut actions = Vec::new();
        self.release_due(&mut actions);
        actions
    }

    /// Leave the room view entirely.
    pub fn clear_focus(&mut self) -> Vec<EngineAction> {
        self.supersede_jump();
        self.focus = None;

        let mut actions = Vec::new();
        self.release_due(&mut actions);
        actions
    }

    /// Jump to `event_id`, reading its scope up to the event and no further.
    ///
    /// If the event is not indexed yet, a [`EngineAction::RequestContext`] is
    /// returned and the jump completes when the matching
    /// [`EngineEvent::ContextLoaded`] arrives. Any later navigation
    /// supersedes the request.
    ///
    /// # Errors
    ///
    /// - `EngineError::EventInThread` if the event lives in a thread and
    ///   `include_threads` is false
    pub fn jump_to_event(
        &mut self,
        room_id: &RoomId,
        event_id: &EventId,
        include_threads: bool,
    ) -> Result<Vec<EngineAction>, EngineError> {
        self.check_jump_target(event_id, include_threads)?;
        self.supersede_jump();

        let mut actions = Vec::new();

        if self.timeline.get(event_id).is_some() {
            self.apply_jump(room_id, event_id, &mut actions);
            self.refresh(room_id);
        } else {
            let request_id = self.env.random_u64();
            self.pending_jump = Some(PendingJump {
                request_id,
                room_id: room_id.clone(),
                event_id: event_id.clone(),
                include_threads,
            });
            self.focus =
                Some(Focus { room_id: room_id.clone(), thread_id: None, at_live_edge: false });

            tracing::debug!(
                room_id = %room_id,
                event_id = %event_id,
                request_id,
                "Requesting context for jump"
            );

            actions.push(EngineAction::RequestContext {
                request_id,
                room_id: room_id.clone(),
                event_id: event_id.clone(),
            });
        }

        self.release_due(&mut actions);
        Ok(actions)
    }

    /// Apply the answer to a context request.
    ///
    /// Answers to superseded requests are discarded without touching the
    /// index or any marker.
    ///
    /// # Errors
    ///
    /// - `EngineError::EventInThread` if the loaded target lives in a thread
    ///   and the jump excluded threads
    pub fn context_loaded(
        &mut self,
        request_id: u64,
        events: Vec<Event>,
    ) -> Result<Vec<EngineAction>, EngineError> {
        let Some(jump) = self.pending_jump.take_if(|jump| jump.request_id == request_id) else {
            tracing::debug!(request_id, "Discarding superseded context");
            return Ok(Vec::new());
        };

        let mut actions = Vec::new();

        let appended = self.timeline.append_batch(&jump.room_id, events, false);
        self.after_append(&appended, &mut actions);

        let result = match self.check_jump_target(&jump.event_id, jump.include_threads) {
            Ok(()) if self.timeline.get(&jump.event_id).is_some() => {
                self.apply_jump(&jump.room_id, &jump.event_id, &mut actions);
                Ok(())
            },
            Ok(()) => {
                tracing::warn!(
                    room_id = %jump.room_id,
                    event_id = %jump.event_id,
                    "Context did not contain the jump target"
                );
                Ok(())
            },
            Err(e) => Err(e),
        };

        self.refresh(&jump.room_id);
        self.release_due(&mut actions);
        result.map(|()| actions)
    }

    /// Apply a sync batch.
    ///
    /// Own events implicitly advance the public marker. Deferred remote
    /// receipts for these events are applied. If the user is focused on the
    /// room at the live edge, the focused scopes are read immediately.
    pub fn receive_events(
        &mut self,
        room_id: &RoomId,
        events: Vec<Event>,
        limited: bool,
    ) -> Vec<EngineAction> {
        let mut actions = Vec::new();

        let appended = self.timeline.append_batch(room_id, events, limited);
        self.after_append(&appended, &mut actions);
        self.follow_live_edge(room_id, &appended, limited, &mut actions);

        self.refresh(room_id);
        self.release_due(&mut actions);
        actions
    }

    /// Apply a backfill batch, optionally closing a gap.
    pub fn receive_backfill(
        &mut self,
        room_id: &RoomId,
        events: Vec<Event>,
        filled_gap: Option<u64>,
    ) -> Vec<EngineAction> {
        let mut actions = Vec::new();

        let appended = self.timeline.append_batch(room_id, events, false);
        if let Some(sequence) = filled_gap {
            self.timeline.fill_gap(room_id, sequence);
        }
        self.after_append(&appended, &mut actions);

        self.refresh(room_id);
        self.release_due(&mut actions);
        actions
    }

    /// Apply a threaded receipt reported by the receipt transport.
    ///
    /// The receipt reads the scope of `event_id` up to that event. Receipts
    /// of other users are ignored. Receipts for events that are not indexed
    /// yet are held until the event arrives.
    pub fn receive_remote_receipt(
        &mut self,
        room_id: &RoomId,
        user_id: &UserId,
        event_id: &EventId,
        kind: ReceiptKind,
    ) -> Vec<EngineAction> {
        self.remote_receipt(room_id, user_id, event_id, kind, ReceiptThreading::Threaded)
    }

    /// Apply an unthreaded receipt reported by the receipt transport.
    ///
    /// The receipt reads the main timeline and every thread of the room up
    /// to the sequence of `event_id`, whichever scope that event lives in.
    pub fn receive_unthreaded_receipt(
        &mut self,
        room_id: &RoomId,
        user_id: &UserId,
        event_id: &EventId,
        kind: ReceiptKind,
    ) -> Vec<EngineAction> {
        self.remote_receipt(room_id, user_id, event_id, kind, ReceiptThreading::Unthreaded)
    }

    fn remote_receipt(
        &mut self,
        room_id: &RoomId,
        user_id: &UserId,
        event_id: &EventId,
        kind: ReceiptKind,
        threading: ReceiptThreading,
    ) -> Vec<EngineAction> {
        let mut actions = Vec::new();

        if user_id != &self.own_user {
            tracing::trace!(room_id = %room_id, user_id = %user_id, "Ignoring receipt of other user");
            return actions;
        }

        match self.timeline.get(event_id).map(|e| (e.scope.clone(), e.position.sequence)) {
            Some((scope, sequence)) => {
                let room = scope.room_id.clone();
                self.apply_remote_receipt(scope, event_id, sequence, kind, threading, &mut actions);
                self.refresh(&room);
            },
            None => self.defer_receipt(room_id, event_id, kind, threading),
        }

        self.release_due(&mut actions);
        actions
    }

    /// Record that the transport failed to send a receipt.
    ///
    /// Local state is authoritative and is never rolled back.
    pub fn receipt_send_failed(
        &mut self,
        scope: &ScopeKey,
        event_id: &EventId,
        reason: &str,
    ) -> Vec<EngineAction> {
        tracing::warn!(scope = %scope, event_id = %event_id, reason, "Receipt send failed");
        Vec::new()
    }

    /// Drop the index, markers and pending sends of `room_id`.
    pub fn forget_room(&mut self, room_id: &RoomId) -> Result<Vec<EngineAction>, EngineError> {
        let events = self.timeline.forget_room(room_id);
        let markers = self.receipts.forget_room(room_id)?;
        self.outbox.forget_room(room_id);
        self.reported.remove(room_id);
        self.deferred.retain(|_, deferred| &deferred.room_id != room_id);

        if self.focus.as_ref().is_some_and(|f| &f.room_id == room_id) {
            self.focus = None;
        }
        if self.pending_jump.as_ref().is_some_and(|j| &j.room_id == room_id) {
            self.pending_jump = None;
        }

        tracing::info!(room_id = %room_id, events, markers, "Forgot room");

        Ok(Vec::new())
    }

    /// Release debounced receipt sends and retry unflushed markers.
    pub fn tick(&mut self, now: E::Instant) -> Vec<EngineAction> {
        let actions: Vec<EngineAction> = self
            .outbox
            .release_due(now)
            .into_iter()
            .map(|(scope, kind, event_id)| EngineAction::SendReceipt { scope, event_id, kind })
            .collect();

        if self.receipts.unflushed_count() > 0 {
            match self.receipts.flush() {
                Ok(flushed) => tracing::debug!(flushed, "Flushed read markers"),
                Err(e) => {
                    // Retried on the next tick
                    tracing::debug!(error = %e, "Marker flush deferred");
                },
            }
        }

        actions
    }

    /// Current read state of `room_id`.
    pub fn room_read_state(&self, room_id: &RoomId) -> RoomReadState {
        compute_room_read_state(&self.timeline, &self.receipts, room_id)
    }

    /// Current summary of the thread rooted at `thread_id`.
    pub fn thread_summary(&self, room_id: &RoomId, thread_id: &EventId) -> Option<ThreadSummary> {
        compute_thread_summary(&self.timeline, &self.receipts, room_id, thread_id)
    }

    /// Whether the main timeline or any thread of `room_id` is unread.
    pub fn is_room_unread(&self, room_id: &RoomId) -> bool {
        self.room_read_state(room_id).is_room_unread
    }

    /// Badge count of `room_id`: main timeline plus threads.
    pub fn unread_count(&self, room_id: &RoomId) -> u64 {
        self.room_read_state(room_id).unread_count
    }

    /// Subscribe to read-state changes.
    pub fn subscribe(&mut self, observer: impl ReadStateObserver + 'static) -> SubscriptionId {
        self.observers.subscribe(observer)
    }

    /// Cancel a subscription. Returns false if `id` was not registered.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    /// Current focus.
    pub fn focus(&self) -> Option<&Focus> {
        self.focus.as_ref()
    }

    /// Request id of the outstanding jump, if any.
    pub fn pending_request_id(&self) -> Option<u64> {
        self.pending_jump.as_ref().map(|jump| jump.request_id)
    }

    /// Number of remote receipts waiting for their event.
    pub fn deferred_receipt_count(&self) -> usize {
        self.deferred.len()
    }

    /// Timeline index.
    pub fn timeline(&self) -> &TimelineIndex {
        &self.timeline
    }

    /// Receipt store.
    pub fn receipts(&self) -> &ReceiptStore<S> {
        &self.receipts
    }

    /// Receipt outbox.
    pub fn outbox(&self) -> &ReceiptOutbox<E::Instant> {
        &self.outbox
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Local user.
    pub fn own_user(&self) -> &UserId {
        &self.own_user
    }

    /// Head event of `scope` and the sequence reading it covers.
    ///
    /// The sequence includes a gap recorded past the head.
    fn read_horizon(&self, scope: &ScopeKey) -> Option<(EventId, u64)> {
        let head = self.timeline.latest(scope)?;
        let sequence = self
            .timeline
            .last_gap(scope)
            .map_or(head.position.sequence, |gap| gap.max(head.position.sequence));
        Some((head.event.event_id.clone(), sequence))
    }

    /// Advance `scope` to its latest event.
    fn advance_to_head(&mut self, scope: &ScopeKey, actions: &mut Vec<EngineAction>) {
        if let Some((event_id, sequence)) = self.read_horizon(scope) {
            self.advance_local(scope.clone(), event_id, sequence, actions);
        }
    }

    /// Advance the private marker because of a local action.
    ///
    /// Only moves when the effective marker moves. Returns whether it did.
    fn advance_local(
        &mut self,
        scope: ScopeKey,
        event_id: EventId,
        sequence: u64,
        actions: &mut Vec<EngineAction>,
    ) -> bool {
        if self.receipts.get_marker(&scope).is_some_and(|m| sequence <= m.sequence) {
            return false;
        }

        let now_ms = self.env.wall_clock_ms();
        match self.receipts.set_marker(&scope, &event_id, sequence, ReceiptKind::Private, now_ms) {
            Advance::Ignored => return false,
            Advance::Applied => {},
            Advance::NotPersisted(e) => actions.push(EngineAction::MarkerNotPersisted {
                scope: scope.clone(),
                kind: ReceiptKind::Private,
                reason: e.to_string(),
            }),
        }

        let kind = self.send_kind();
        self.outbox.queue(scope, kind, event_id, sequence, self.env.now());
        true
    }

    /// Main timeline followed by every thread of `room_id`.
    fn room_scopes(&self, room_id: &RoomId) -> Vec<ScopeKey> {
        std::iter::once(ScopeKey::main(room_id.clone()))
            .chain(
                self.timeline
                    .threads(room_id)
                    .into_iter()
                    .map(|root| ScopeKey::thread(room_id.clone(), root)),
            )
            .collect()
    }

    /// Advance the private markers of several scopes in one write.
    fn advance_local_batch(
        &mut self,
        updates: Vec<(ScopeKey, EventId, u64)>,
        actions: &mut Vec<EngineAction>,
    ) {
        let now_ms = self.env.wall_clock_ms();
        let batch = self.receipts.advance_markers(updates, ReceiptKind::Private, now_ms);

        let kind = self.send_kind();
        let now = self.env.now();
        for (scope, event_id, sequence) in batch.advanced {
            if let Advance::NotPersisted(e) = &batch.outcome {
                actions.push(EngineAction::MarkerNotPersisted {
                    scope: scope.clone(),
                    kind: ReceiptKind::Private,
                    reason: e.to_string(),
                });
            }
            self.outbox.queue(scope, kind, event_id, sequence, now);
        }
    }

    fn apply_remote_receipt(
        &mut self,
        scope: ScopeKey,
        event_id: &EventId,
        sequence: u64,
        kind: ReceiptKind,
        threading: ReceiptThreading,
        actions: &mut Vec<EngineAction>,
    ) {
        match threading {
            ReceiptThreading::Threaded => self.apply_remote(scope, event_id, sequence, kind, actions),
            ReceiptThreading::Unthreaded => {
                self.apply_unthreaded(&scope.room_id, sequence, kind, actions);
            },
        }
    }

    /// Read every scope of `room_id` up to `sequence`.
    fn apply_unthreaded(
        &mut self,
        room_id: &RoomId,
        sequence: u64,
        kind: ReceiptKind,
        actions: &mut Vec<EngineAction>,
    ) {
        let updates: Vec<(ScopeKey, EventId, u64)> = self
            .room_scopes(room_id)
            .into_iter()
            .filter_map(|scope| {
                let floor = self.timeline.latest_at_or_before(&scope, sequence)?;
                let (event_id, floor_sequence) =
                    (floor.event.event_id.clone(), floor.position.sequence);
                Some((scope, event_id, floor_sequence))
            })
            .collect();

        tracing::debug!(room_id = %room_id, sequence, scopes = updates.len(), "Unthreaded receipt");

        let now_ms = self.env.wall_clock_ms();
        let batch = self.receipts.advance_markers(updates, kind, now_ms);
        if let Advance::NotPersisted(e) = &batch.outcome {
            for (scope, ..) in batch.advanced {
                actions.push(EngineAction::MarkerNotPersisted { scope, kind, reason: e.to_string() });
            }
        }
    }

    fn apply_remote(
        &mut self,
        scope: ScopeKey,
        event_id: &EventId,
        sequence: u64,
        kind: ReceiptKind,
        actions: &mut Vec<EngineAction>,
    ) {
        let now_ms = self.env.wall_clock_ms();
        if let Advance::NotPersisted(e) =
            self.receipts.on_remote_marker_advance(&scope, event_id, sequence, kind, now_ms)
        {
            actions.push(EngineAction::MarkerNotPersisted { scope, kind, reason: e.to_string() });
        }
    }

    fn defer_receipt(
        &mut self,
        room_id: &RoomId,
        event_id: &EventId,
        kind: ReceiptKind,
        threading: ReceiptThreading,
    ) {
        if !self.deferred.contains_key(event_id) && self.deferred.len() >= MAX_DEFERRED_RECEIPTS {
            tracing::warn!(
                room_id = %room_id,
                event_id = %event_id,
                "Too many deferred receipts, dropping"
            );
            return;
        }

        let deferred = self
            .deferred
            .entry(event_id.clone())
            .or_insert_with(|| DeferredReceipt { room_id: room_id.clone(), receipts: Vec::new() });
        if !deferred.receipts.contains(&(kind, threading)) {
            deferred.receipts.push((kind, threading));
        }

        tracing::debug!(
            room_id = %room_id,
            event_id = %event_id,
            ?kind,
            ?threading,
            "Deferred remote receipt"
        );
    }

    /// Bookkeeping for freshly indexed events.
    fn after_append(&mut self, appended: &[Appended], actions: &mut Vec<EngineAction>) {
        for entry in appended {
            let own = self
                .timeline
                .get(&entry.event_id)
                .is_some_and(|e| e.event.sender == self.own_user);

            if own && self.config.own_events_mark_read {
                self.apply_remote(
                    entry.scope.clone(),
                    &entry.event_id,
                    entry.position.sequence,
                    ReceiptKind::Public,
                    actions,
                );
            }

            if let Some(deferred) = self.deferred.remove(&entry.event_id) {
                for (kind, threading) in deferred.receipts {
                    self.apply_remote_receipt(
                        entry.scope.clone(),
                        &entry.event_id,
                        entry.position.sequence,
                        kind,
                        threading,
                        actions,
                    );
                }
            }
        }
    }

    /// Read new events in the focused scopes while at the live edge.
    ///
    /// A limited batch reads the focused scopes even without new events in
    /// them.
    fn follow_live_edge(
        &mut self,
        room_id: &RoomId,
        appended: &[Appended],
        limited: bool,
        actions: &mut Vec<EngineAction>,
    ) {
        let Some(focus) = self.focus.clone() else {
            return;
        };
        if &focus.room_id != room_id || !focus.at_live_edge {
            return;
        }

        let main = ScopeKey::main(room_id.clone());
        if limited || appended.iter().any(|a| a.scope == main) {
            self.advance_to_head(&main, actions);
        }

        if let Some(root) = focus.thread_id {
            let thread = ScopeKey::thread(room_id.clone(), root);
            if limited || appended.iter().any(|a| a.scope == thread) {
                self.advance_to_head(&thread, actions);
            }
        }
    }

    fn check_jump_target(
        &self,
        event_id: &EventId,
        include_threads: bool,
    ) -> Result<(), EngineError> {
        if include_threads {
            return Ok(());
        }

        match self.timeline.scope_of(event_id).and_then(|scope| scope.thread_id.as_ref()) {
            Some(thread_id) => Err(EngineError::EventInThread {
                event_id: event_id.clone(),
                thread_id: thread_id.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Advance the target's scope up to the target and focus it.
    fn apply_jump(&mut self, room_id: &RoomId, event_id: &EventId, actions: &mut Vec<EngineAction>) {
        let Some((scope, sequence)) =
            self.timeline.get(event_id).map(|e| (e.scope.clone(), e.position.sequence))
        else {
            return;
        };

        let at_live_edge =
            self.timeline.latest(&scope).is_some_and(|head| &head.event.event_id == event_id);

        self.focus = Some(Focus {
            room_id: room_id.clone(),
            thread_id: scope.thread_id.clone(),
            at_live_edge,
        });

        tracing::debug!(scope = %scope, event_id = %event_id, at_live_edge, "Jumped to event");

        self.advance_local(scope, event_id.clone(), sequence, actions);
    }

    fn supersede_jump(&mut self) {
        if let Some(jump) = self.pending_jump.take() {
            tracing::debug!(request_id = jump.request_id, "Superseded pending jump");
        }
    }

    fn send_kind(&self) -> ReceiptKind {
        if self.config.send_public_receipts { ReceiptKind::Public } else { ReceiptKind::Private }
    }

    fn release_due(&mut self, actions: &mut Vec<EngineAction>) {
        let now = self.env.now();
        for (scope, kind, event_id) in self.outbox.release_due(now) {
            actions.push(EngineAction::SendReceipt { scope, event_id, kind });
        }
    }

    /// Recompute `room_id` and notify observers if it changed.
    fn refresh(&mut self, room_id: &RoomId) {
        let state = self.room_read_state(room_id);
        if self.reported.get(room_id) == Some(&state) {
            return;
        }

        tracing::debug!(
            room_id = %room_id,
            unread = state.unread_count,
            is_room_unread = state.is_room_unread,
            "Read state changed"
        );

        self.observers.notify(&state);
        self.reported.insert(room_id.clone(), state);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_types, reason = "Shared capture in tests")]

    use std::{
        sync::{
            Arc, Mutex,
            atomic::{AtomicBool, Ordering},
        },
        time::Duration,
    };

    use readmark_storage::{ChaoticStorage, MarkerKey, MemoryStorage, StorageError, StoredMarker};

    use super::*;
    use crate::{env::test_utils::MockEnv, event::EventContent};

    const ME: &str = "@me:hs";
    const BOT: &str = "@bot:hs";
    const ROOM: &str = "!room:hs";

    type TestEngine = ReadStateEngine<MockEnv, MemoryStorage>;

    fn room() -> RoomId {
        RoomId::from(ROOM)
    }

    fn engine() -> TestEngine {
        engine_with(EngineConfig::default(), MemoryStorage::new())
    }

    fn engine_with(config: EngineConfig, storage: MemoryStorage) -> TestEngine {
        ReadStateEngine::open(MockEnv::new(), config, UserId::from(ME), storage).unwrap()
    }

    fn msg(id: &str, sequence: u64) -> Event {
        Event::new(id, ROOM, BOT, sequence, EventContent::Message)
    }

    fn reply(id: &str, root: &str, sequence: u64) -> Event {
        Event::new(id, ROOM, BOT, sequence, EventContent::ThreadReply { root: root.into() })
    }

    fn sends(actions: &[EngineAction]) -> Vec<(ScopeKey, &str)> {
        actions
            .iter()
            .filter_map(|a| match a {
                EngineAction::SendReceipt { scope, event_id, .. } => {
                    Some((scope.clone(), event_id.as_str()))
                },
                _ => None,
            })
            .collect()
    }

    #[test]
    fn view_room_reads_main_timeline_only() {
        let mut engine = engine();
        engine.receive_events(
            &room(),
            vec![msg("$root", 1), reply("$r1", "$root", 2), msg("$m", 3)],
            false,
        );
        assert_eq!(engine.unread_count(&room()), 3);

        let actions = engine.view_room(&room());

        assert_eq!(sends(&actions), vec![(ScopeKey::main(room()), "$m")]);
        let state = engine.room_read_state(&room());
        assert_eq!(state.main_unread_count, 0);
        assert_eq!(state.unread_count, 1);
        assert!(state.is_room_unread);
    }

    #[test]
    fn view_thread_reads_thread_and_root_only() {
        let mut engine = engine();
        engine.receive_events(
            &room(),
            vec![msg("$root", 1), reply("$r1", "$root", 2), msg("$later", 3)],
            false,
        );

        let actions = engine.view_thread(&room(), &EventId::from("$root")).unwrap();

        let thread = ScopeKey::thread(room(), EventId::from("$root"));
        let mut sent = sends(&actions);
        sent.sort();
        assert_eq!(sent, vec![(ScopeKey::main(room()), "$root"), (thread, "$r1")]);

        let state = engine.room_read_state(&room());
        assert_eq!(state.main_unread_count, 1, "events after the root stay unread");
        assert!(!state.thread(&EventId::from("$root")).unwrap().has_unread);
    }

    #[test]
    fn unknown_thread_is_an_error() {
        let mut engine = engine();
        let err = engine.view_thread(&room(), &EventId::from("$nope")).unwrap_err();
        assert!(matches!(err, EngineError::UnknownThread { .. }));
    }

    #[test]
    fn mark_as_read_covers_all_threads_and_is_idempotent() {
        let mut engine = engine();
        engine.receive_events(
            &room(),
            vec![msg("$a", 1), reply("$a1", "$a", 2), msg("$b", 3), reply("$b1", "$b", 4)],
            false,
        );

        let first = engine.mark_room_as_read(&room());
        assert_eq!(sends(&first).len(), 3);
        let after_once = engine.room_read_state(&room());
        assert!(!after_once.is_room_unread);

        let second = engine.mark_room_as_read(&room());
        assert!(second.is_empty());
        assert_eq!(engine.room_read_state(&room()), after_once);
    }

    #[test]
    fn reading_a_thread_covers_the_gap_past_its_head() {
        let storage = MemoryStorage::new();
        let mut engine = engine_with(EngineConfig::default(), storage.clone());
        let root = EventId::from("$root");

        engine.receive_events(&room(), vec![msg("$root", 1), reply("$r1", "$root", 2)], false);
        engine.mark_room_as_read(&room());
        engine.receive_events(&room(), vec![msg("$n", 50)], true);

        let state = engine.room_read_state(&room());
        assert_eq!(state.unread_count, 2);
        assert!(state.thread(&root).unwrap().incomplete);

        engine.view_thread(&room(), &root).unwrap();
        let summary = engine.thread_summary(&room(), &root).unwrap();
        assert!(!summary.has_unread);
        assert!(!summary.incomplete);

        engine.mark_room_as_read(&room());
        let state = engine.room_read_state(&room());
        assert_eq!(state.unread_count, 0);
        assert!(!state.is_room_unread);
        assert!(!state.incomplete);

        // The same limited history after a restart still reads as read
        let mut reopened = engine_with(EngineConfig::default(), storage);
        reopened.receive_events(&room(), vec![msg("$root", 1), reply("$r1", "$root", 2)], false);
        reopened.receive_events(&room(), vec![msg("$n", 50)], true);
        assert_eq!(reopened.room_read_state(&room()), state);
    }

    #[test]
    fn mark_as_read_clears_thread_gaps_in_one_write() {
        let storage = ChaoticStorage::new(MemoryStorage::new(), 0.0);
        let mut engine = ReadStateEngine::open(
            MockEnv::new(),
            EngineConfig::default(),
            UserId::from(ME),
            storage.clone(),
        )
        .unwrap();

        engine.receive_events(
            &room(),
            vec![msg("$a", 1), reply("$a1", "$a", 2), msg("$b", 3), reply("$b1", "$b", 4)],
            false,
        );
        engine.receive_events(&room(), vec![msg("$n", 40)], true);
        assert!(engine.room_read_state(&room()).incomplete);

        let before = storage.operation_count();
        let actions = engine.mark_room_as_read(&room());

        assert_eq!(storage.operation_count(), before + 1);
        assert_eq!(sends(&actions).len(), 3);
        assert_eq!(storage.inner().marker_count(), 3);
        assert!(!engine.is_room_unread(&room()));
        assert!(!engine.room_read_state(&room()).incomplete);
    }

    #[test]
    fn failed_mark_as_read_reports_every_scope() {
        let inner = MemoryStorage::new();
        let failing = Arc::new(AtomicBool::new(false));
        let storage = FlakyStorage { inner: inner.clone(), failing: Arc::clone(&failing) };
        let mut engine =
            ReadStateEngine::open(MockEnv::new(), EngineConfig::default(), UserId::from(ME), storage)
                .unwrap();
        engine.receive_events(&room(), vec![msg("$root", 1), reply("$r1", "$root", 2)], false);

        failing.store(true, Ordering::SeqCst);
        let actions = engine.mark_room_as_read(&room());

        let lost = actions
            .iter()
            .filter(|a| matches!(a, EngineAction::MarkerNotPersisted { .. }))
            .count();
        assert_eq!(lost, 2);
        assert_eq!(sends(&actions).len(), 2);
        assert!(!engine.is_room_unread(&room()));
        assert_eq!(engine.receipts().unflushed_count(), 2);

        failing.store(false, Ordering::SeqCst);
        engine.tick(engine.env.now());
        assert_eq!(engine.receipts().unflushed_count(), 0);
        assert_eq!(inner.marker_count(), 2);
    }

    #[test]
    fn live_edge_reads_arrivals_in_focused_scopes() {
        let mut engine = engine();
        engine.receive_events(&room(), vec![msg("$root", 1), reply("$r1", "$root", 2)], false);
        engine.view_thread(&room(), &EventId::from("$root")).unwrap();

        let actions = engine.receive_events(
            &room(),
            vec![msg("$m", 3), reply("$r2", "$root", 4)],
            false,
        );

        assert_eq!(sends(&actions).len(), 2);
        assert!(!engine.is_room_unread(&room()));

        engine.close_thread();
        engine.receive_events(&room(), vec![reply("$r3", "$root", 5)], false);
        assert!(engine.is_room_unread(&room()));

        engine.clear_focus();
        engine.receive_events(&room(), vec![msg("$n", 6)], false);
        assert_eq!(engine.room_read_state(&room()).main_unread_count, 1);
    }

    #[test]
    fn own_events_mark_their_scope_read() {
        let mut engine = engine();
        engine.receive_events(&room(), vec![msg("$a", 1), msg("$b", 2)], false);

        let own = Event::new("$mine", ROOM, ME, 3, EventContent::Message);
        let actions = engine.receive_events(&room(), vec![own], false);

        assert!(sends(&actions).is_empty(), "implicit receipts are not sent");
        assert!(!engine.is_room_unread(&room()));
        let marker = engine.receipts().marker(&ScopeKey::main(room()), ReceiptKind::Public);
        assert_eq!(marker.unwrap().event_id, EventId::from("$mine"));
    }

    #[test]
    fn own_events_can_be_configured_to_not_read() {
        let config = EngineConfig { own_events_mark_read: false, ..EngineConfig::default() };
        let mut engine = engine_with(config, MemoryStorage::new());

        engine.receive_events(&room(), vec![msg("$a", 1)], false);
        engine.receive_events(
            &room(),
            vec![Event::new("$mine", ROOM, ME, 2, EventContent::Message)],
            false,
        );

        assert_eq!(engine.unread_count(&room()), 1);
    }

    #[test]
    fn jump_reads_up_to_the_event_only() {
        let mut engine = engine();
        engine.receive_events(&room(), vec![msg("$a", 1), msg("$b", 2), msg("$c", 3)], false);

        engine.jump_to_event(&room(), &EventId::from("$b"), false).unwrap();

        assert_eq!(engine.room_read_state(&room()).main_unread_count, 1);
        assert!(!engine.focus().unwrap().at_live_edge);

        // Away from the live edge new events stay unread
        engine.receive_events(&room(), vec![msg("$d", 4)], false);
        assert_eq!(engine.room_read_state(&room()).main_unread_count, 2);
    }

    #[test]
    fn jump_into_thread_requires_include_threads() {
        let mut engine = engine();
        engine.receive_events(&room(), vec![msg("$root", 1), reply("$r1", "$root", 2)], false);

        let err = engine.jump_to_event(&room(), &EventId::from("$r1"), false).unwrap_err();
        assert!(matches!(err, EngineError::EventInThread { .. }));

        engine.jump_to_event(&room(), &EventId::from("$r1"), true).unwrap();
        let summary = engine.thread_summary(&room(), &EventId::from("$root")).unwrap();
        assert!(!summary.has_unread);
        assert_eq!(engine.room_read_state(&room()).main_unread_count, 1);
    }

    #[test]
    fn jump_to_unloaded_event_requests_context() {
        let mut engine = engine();
        engine.receive_events(&room(), vec![msg("$new", 10)], false);

        let actions = engine.jump_to_event(&room(), &EventId::from("$old"), false).unwrap();
        let [EngineAction::RequestContext { request_id, event_id, .. }] = actions.as_slice() else {
            panic!("expected a single RequestContext, got {actions:?}");
        };
        assert_eq!(event_id, &EventId::from("$old"));

        engine.context_loaded(*request_id, vec![msg("$old", 5), msg("$mid", 6)]).unwrap();

        let state = engine.room_read_state(&room());
        assert_eq!(state.main_unread_count, 2, "$mid and $new remain unread");
        assert!(engine.pending_request_id().is_none());
    }

    #[test]
    fn superseded_context_is_discarded() {
        let mut engine = engine();
        engine.receive_events(&room(), vec![msg("$new", 10)], false);

        let actions = engine.jump_to_event(&room(), &EventId::from("$old"), false).unwrap();
        let Some(EngineAction::RequestContext { request_id, .. }) = actions.first().cloned() else {
            panic!("expected RequestContext");
        };

        engine.view_room(&room());

        let late = engine.context_loaded(request_id, vec![msg("$old", 5)]).unwrap();
        assert!(late.is_empty());
        assert!(engine.timeline().get(&EventId::from("$old")).is_none());
        assert_eq!(
            engine.receipts().get_marker(&ScopeKey::main(room())).unwrap().event_id,
            EventId::from("$new")
        );
    }

    #[test]
    fn remote_receipts_apply_and_ignore_others() {
        let mut engine = engine();
        engine.receive_events(&room(), vec![msg("$a", 1), msg("$b", 2)], false);

        engine.receive_remote_receipt(
            &room(),
            &UserId::from("@someone:hs"),
            &EventId::from("$b"),
            ReceiptKind::Public,
        );
        assert_eq!(engine.unread_count(&room()), 2);

        engine.receive_remote_receipt(
            &room(),
            &UserId::from(ME),
            &EventId::from("$b"),
            ReceiptKind::Public,
        );
        assert_eq!(engine.unread_count(&room()), 0);

        // Stale receipt does nothing
        engine.receive_remote_receipt(
            &room(),
            &UserId::from(ME),
            &EventId::from("$a"),
            ReceiptKind::Public,
        );
        let marker = engine.receipts().get_marker(&ScopeKey::main(room())).unwrap();
        assert_eq!(marker.event_id, EventId::from("$b"));
    }

    #[test]
    fn remote_receipt_for_unknown_event_waits_for_it() {
        let mut engine = engine();
        engine.receive_events(&room(), vec![msg("$a", 1)], false);

        engine.receive_remote_receipt(
            &room(),
            &UserId::from(ME),
            &EventId::from("$b"),
            ReceiptKind::Private,
        );
        assert_eq!(engine.deferred_receipt_count(), 1);
        assert_eq!(engine.unread_count(&room()), 1);

        engine.receive_events(&room(), vec![msg("$b", 2)], false);
        assert_eq!(engine.deferred_receipt_count(), 0);
        assert_eq!(engine.unread_count(&room()), 0);
    }

    #[test]
    fn unthreaded_receipt_reads_every_scope_up_to_its_event() {
        let mut engine = engine();
        engine.receive_events(
            &room(),
            vec![msg("$main1", 1), reply("$t1a", "$main1", 2), reply("$t1b", "$main1", 3)],
            false,
        );
        assert_eq!(engine.unread_count(&room()), 3);

        let actions = engine.receive_unthreaded_receipt(
            &room(),
            &UserId::from(ME),
            &EventId::from("$t1a"),
            ReceiptKind::Public,
        );

        assert!(sends(&actions).is_empty());
        let state = engine.room_read_state(&room());
        assert_eq!(state.main_unread_count, 0);
        assert_eq!(state.unread_count, 1);
        let main = engine.receipts().marker(&ScopeKey::main(room()), ReceiptKind::Public);
        assert_eq!(main.unwrap().event_id, EventId::from("$main1"));
    }

    #[test]
    fn unthreaded_receipt_stops_at_its_sequence() {
        let mut engine = engine();
        engine.receive_events(
            &room(),
            vec![
                msg("$main1", 1),
                reply("$t1a", "$main1", 2),
                reply("$t1b", "$main1", 3),
                msg("$main2", 4),
            ],
            false,
        );
        assert_eq!(engine.unread_count(&room()), 4);

        engine.receive_unthreaded_receipt(
            &room(),
            &UserId::from(ME),
            &EventId::from("$t1b"),
            ReceiptKind::Private,
        );

        let state = engine.room_read_state(&room());
        assert_eq!(state.main_unread_count, 1);
        assert_eq!(state.unread_count, 1);

        // A threaded receipt on the same event only reads its thread
        let mut threaded = self::engine();
        threaded.receive_events(
            &room(),
            vec![
                msg("$main1", 1),
                reply("$t1a", "$main1", 2),
                reply("$t1b", "$main1", 3),
                msg("$main2", 4),
            ],
            false,
        );
        threaded.receive_remote_receipt(
            &room(),
            &UserId::from(ME),
            &EventId::from("$t1b"),
            ReceiptKind::Private,
        );
        assert_eq!(threaded.room_read_state(&room()).main_unread_count, 2);
    }

    #[test]
    fn unthreaded_receipt_for_unknown_event_waits_for_it() {
        let mut engine = engine();
        engine.receive_events(&room(), vec![msg("$root", 1), reply("$r1", "$root", 2)], false);

        engine
            .handle(EngineEvent::RemoteReceipt {
                room_id: room(),
                user_id: UserId::from(ME),
                event_id: EventId::from("$m"),
                kind: ReceiptKind::Public,
                threading: ReceiptThreading::Unthreaded,
            })
            .unwrap();
        assert_eq!(engine.deferred_receipt_count(), 1);
        assert_eq!(engine.unread_count(&room()), 2);

        engine.receive_events(&room(), vec![msg("$m", 3), reply("$r2", "$root", 4)], false);

        assert_eq!(engine.deferred_receipt_count(), 0);
        let state = engine.room_read_state(&room());
        assert_eq!(state.main_unread_count, 0);
        assert_eq!(state.unread_count, 1, "only $r2 lies past the receipt");
    }

    #[test]
    fn events_sharing_a_sequence_are_read_together() {
        let mut engine = engine();
        engine.receive_events(&room(), vec![msg("$a", 5)], false);
        engine.receive_remote_receipt(
            &room(),
            &UserId::from(ME),
            &EventId::from("$a"),
            ReceiptKind::Public,
        );

        engine.receive_events(&room(), vec![msg("$b", 5)], false);
        assert_eq!(engine.unread_count(&room()), 0);

        // $b cannot move a marker that already sits at its sequence
        let actions = engine.view_room(&room());
        assert!(sends(&actions).is_empty());
        let marker = engine.receipts().get_marker(&ScopeKey::main(room())).unwrap();
        assert_eq!(marker.event_id, EventId::from("$a"));
    }

    #[test]
    fn private_mode_sends_private_receipts() {
        let config = EngineConfig { send_public_receipts: false, ..EngineConfig::default() };
        let mut engine = engine_with(config, MemoryStorage::new());
        engine.receive_events(&room(), vec![msg("$a", 1)], false);

        let actions = engine.view_room(&room());
        assert!(matches!(
            actions.as_slice(),
            [EngineAction::SendReceipt { kind: ReceiptKind::Private, .. }]
        ));
    }

    #[test]
    fn debounced_sends_release_on_tick() {
        let config = EngineConfig {
            receipt_debounce: Duration::from_millis(300),
            ..EngineConfig::default()
        };
        let env = MockEnv::new();
        let mut engine: TestEngine =
            ReadStateEngine::open(env.clone(), config, UserId::from(ME), MemoryStorage::new())
                .unwrap();
        engine.view_room(&room());

        engine.receive_events(&room(), vec![msg("$a", 1)], false);
        let actions = engine.receive_events(&room(), vec![msg("$b", 2)], false);
        assert!(actions.is_empty());
        assert!(!engine.is_room_unread(&room()), "local state is immediate");

        env.advance(Duration::from_millis(100));
        assert!(engine.tick(env.now()).is_empty());

        env.advance(Duration::from_millis(200));
        let actions = engine.tick(env.now());
        assert_eq!(sends(&actions), vec![(ScopeKey::main(room()), "$b")]);
        assert!(engine.outbox().is_empty());
    }

    #[test]
    fn observers_fire_once_per_change() {
        let mut engine = engine();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine.subscribe(move |s: &RoomReadState| sink.lock().unwrap().push(s.unread_count));

        engine.receive_events(&room(), vec![msg("$a", 1)], false);
        engine.receive_events(
            &room(),
            vec![Event::new(
                "$react",
                ROOM,
                BOT,
                2,
                EventContent::Reaction { target: "$a".into(), key: "👍".into() },
            )],
            false,
        );
        engine.view_room(&room());
        engine.view_room(&room());

        assert_eq!(*seen.lock().unwrap(), vec![1, 0]);
    }

    #[test]
    fn handle_dispatches_like_the_methods() {
        let mut engine = engine();

        engine
            .handle(EngineEvent::ReceiveEvents {
                room_id: room(),
                events: vec![msg("$root", 1), reply("$r1", "$root", 2)],
                limited: false,
            })
            .unwrap();
        assert_eq!(engine.unread_count(&room()), 2);

        let err = engine
            .handle(EngineEvent::ViewThread { room_id: room(), thread_id: "$nope".into() })
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownThread { .. }));

        let actions = engine
            .handle(EngineEvent::ViewThread { room_id: room(), thread_id: "$root".into() })
            .unwrap();
        assert!(!sends(&actions).is_empty());
        assert!(!engine.is_room_unread(&room()));
    }

    #[test]
    fn forget_room_drops_everything() {
        let storage = MemoryStorage::new();
        let mut engine = engine_with(EngineConfig::default(), storage.clone());
        engine.receive_events(&room(), vec![msg("$a", 1)], false);
        engine.view_room(&room());

        engine.forget_room(&room()).unwrap();

        assert!(engine.timeline().is_empty());
        assert!(engine.focus().is_none());
        assert_eq!(storage.marker_count(), 0);
    }

    #[test]
    fn markers_survive_reopen() {
        let storage = MemoryStorage::new();
        let events = vec![msg("$root", 1), reply("$r1", "$root", 2), msg("$b", 3)];

        let mut first = engine_with(EngineConfig::default(), storage.clone());
        first.receive_events(&room(), events.clone(), false);
        first.view_thread(&room(), &EventId::from("$root")).unwrap();
        let before = first.room_read_state(&room());
        drop(first);

        let mut second = engine_with(EngineConfig::default(), storage);
        second.receive_events(&room(), events, false);
        assert_eq!(second.room_read_state(&room()), before);
    }

    #[test]
    fn open_fails_when_storage_is_unreadable() {
        let broken = ChaoticStorage::new(MemoryStorage::new(), 1.0);
        let result =
            ReadStateEngine::open(MockEnv::new(), EngineConfig::default(), UserId::from(ME), broken);

        assert!(matches!(result.err(), Some(EngineError::Storage(_))));
    }

    /// Memory storage whose writes can be switched off.
    #[derive(Clone)]
    struct FlakyStorage {
        inner: MemoryStorage,
        failing: Arc<AtomicBool>,
    }

    impl MarkerStorage for FlakyStorage {
        fn store_marker(&self, marker: &StoredMarker) -> Result<(), StorageError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StorageError::Io("disk unavailable".to_string()));
            }
            self.inner.store_marker(marker)
        }

        fn load_marker(&self, key: &MarkerKey) -> Result<Option<StoredMarker>, StorageError> {
            self.inner.load_marker(key)
        }

        fn load_room_markers(&self, room_id: &str) -> Result<Vec<StoredMarker>, StorageError> {
            self.inner.load_room_markers(room_id)
        }

        fn list_markers(&self) -> Result<Vec<StoredMarker>, StorageError> {
            self.inner.list_markers()
        }

        fn forget_room(&self, room_id: &str) -> Result<usize, StorageError> {
            self.inner.forget_room(room_id)
        }
    }

    #[test]
    fn storage_failure_keeps_local_state_and_retries() {
        let inner = MemoryStorage::new();
        let failing = Arc::new(AtomicBool::new(false));
        let storage = FlakyStorage { inner: inner.clone(), failing: Arc::clone(&failing) };
        let mut engine =
            ReadStateEngine::open(MockEnv::new(), EngineConfig::default(), UserId::from(ME), storage)
                .unwrap();

        engine.receive_events(&room(), vec![msg("$a", 1)], false);

        failing.store(true, Ordering::SeqCst);
        let actions = engine.view_room(&room());

        assert!(actions.iter().any(|a| matches!(a, EngineAction::MarkerNotPersisted { .. })));
        assert_eq!(sends(&actions).len(), 1, "the receipt is still sent");
        assert!(!engine.is_room_unread(&room()));
        assert_eq!(inner.marker_count(), 0);

        // Still failing: the retry keeps the marker queued
        engine.tick(engine.env.now());
        assert_eq!(engine.receipts().unflushed_count(), 1);

        failing.store(false, Ordering::SeqCst);
        engine.tick(engine.env.now());
        assert_eq!(engine.receipts().unflushed_count(), 0);
        assert_eq!(inner.marker_count(), 1);
    }
}
