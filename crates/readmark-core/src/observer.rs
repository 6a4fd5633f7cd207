//! Read-state change subscriptions.
//!
//! UI and notification code subscribe here instead of listening to ambient
//! events. The engine only notifies when a room's computed state differs from
//! the last state it reported for that room.

use crate::aggregate::RoomReadState;

/// Receives read-state changes.
pub trait ReadStateObserver: Send {
    /// Called after `state.room_id` changed.
    fn on_read_state_changed(&mut self, state: &RoomReadState);
}

impl<F> ReadStateObserver for F
where
    F: FnMut(&RoomReadState) + Send,
{
    fn on_read_state_changed(&mut self, state: &RoomReadState) {
        self(state);
    }
}

/// Handle returned by [`ObserverList::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Registered observers, notified in subscription order.
#[derive(Default)]
pub struct ObserverList {
    next_id: u64,
    observers: Vec<(SubscriptionId, Box<dyn ReadStateObserver>)>,
}

impl ObserverList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer.
    pub fn subscribe(&mut self, observer: impl ReadStateObserver + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.observers.push((id, Box::new(observer)));
        id
    }

    /// Remove an observer. Returns false if `id` was not registered.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(existing, _)| *existing != id);
        self.observers.len() != before
    }

    /// Deliver `state` to every observer.
    pub fn notify(&mut self, state: &RoomReadState) {
        for (_, observer) in &mut self.observers {
            observer.on_read_state_changed(state);
        }
    }

    /// Number of registered observers.
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    /// Whether nobody is subscribed.
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl std::fmt::Debug for ObserverList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverList").field("observers", &self.observers.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_types, reason = "Shared capture in tests")]

    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::ids::RoomId;

    fn state(count: u64) -> RoomReadState {
        RoomReadState {
            room_id: RoomId::from("!r"),
            main_unread_count: count,
            main_highlight_count: 0,
            threads: Vec::new(),
            unread_count: count,
            highlight_count: 0,
            is_room_unread: count > 0,
            incomplete: false,
        }
    }

    #[test]
    fn closures_receive_notifications() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut observers = ObserverList::new();

        let sink = Arc::clone(&seen);
        observers.subscribe(move |s: &RoomReadState| sink.lock().unwrap().push(s.unread_count));

        observers.notify(&state(2));
        observers.notify(&state(0));

        assert_eq!(*seen.lock().unwrap(), vec![2, 0]);
    }

    #[test]
    fn unsubscribed_observers_stop_receiving() {
        let seen = Arc::new(Mutex::new(0u32));
        let mut observers = ObserverList::new();

        let sink = Arc::clone(&seen);
        let id = observers.subscribe(move |_: &RoomReadState| *sink.lock().unwrap() += 1);

        observers.notify(&state(1));
        assert!(observers.unsubscribe(id));
        assert!(!observers.unsubscribe(id));
        observers.notify(&state(2));

        assert_eq!(*seen.lock().unwrap(), 1);
        assert!(observers.is_empty());
    }
}
