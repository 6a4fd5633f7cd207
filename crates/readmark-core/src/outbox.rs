//! Receipt outbox.
//!
//! Marker advances queue a receipt send here instead of emitting it right
//! away. Sends for the same `(scope, kind)` coalesce to the newest position,
//! and each entry is released once the debounce has elapsed since it was
//! first queued. With a zero debounce every send is released on the next
//! release call.

use std::{collections::BTreeMap, ops::Sub, time::Duration};

use crate::{
    ids::{EventId, RoomId, ScopeKey},
    receipts::ReceiptKind,
};

/// A receipt waiting to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedReceipt<I> {
    /// Event to acknowledge.
    pub event_id: EventId,
    /// Sequence of `event_id`, used to keep the newest position.
    pub sequence: u64,
    /// When the entry was first queued.
    pub queued_at: I,
}

/// Coalescing, debounced queue of receipt sends.
#[derive(Debug)]
pub struct ReceiptOutbox<I> {
    debounce: Duration,
    pending: BTreeMap<(ScopeKey, ReceiptKind), QueuedReceipt<I>>,
}

impl<I> ReceiptOutbox<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Create an empty outbox.
    pub fn new(debounce: Duration) -> Self {
        Self { debounce, pending: BTreeMap::new() }
    }

    /// Queue a send, replacing an older pending position for the same slot.
    ///
    /// The release deadline is set by the first entry of the slot and is not
    /// pushed back by later updates.
    pub fn queue(
        &mut self,
        scope: ScopeKey,
        kind: ReceiptKind,
        event_id: EventId,
        sequence: u64,
        now: I,
    ) {
        match self.pending.get_mut(&(scope.clone(), kind)) {
            Some(queued) => {
                if sequence > queued.sequence {
                    queued.event_id = event_id;
                    queued.sequence = sequence;
                }
            },
            None => {
                self.pending.insert((scope, kind), QueuedReceipt { event_id, sequence, queued_at: now });
            },
        }
    }

    /// Remove and return every entry whose debounce has elapsed.
    pub fn release_due(&mut self, now: I) -> Vec<(ScopeKey, ReceiptKind, EventId)> {
        let due: Vec<(ScopeKey, ReceiptKind)> = self
            .pending
            .iter()
            .filter(|(_, queued)| now >= queued.queued_at && now - queued.queued_at >= self.debounce)
            .map(|(slot, _)| slot.clone())
            .collect();

        due.into_iter()
            .filter_map(|slot| {
                self.pending.remove(&slot).map(|queued| (slot.0, slot.1, queued.event_id))
            })
            .collect()
    }

    /// Pending entry for a slot.
    pub fn pending(&self, scope: &ScopeKey, kind: ReceiptKind) -> Option<&QueuedReceipt<I>> {
        self.pending.get(&(scope.clone(), kind))
    }

    /// Drop every pending send of `room_id`.
    pub fn forget_room(&mut self, room_id: &RoomId) {
        self.pending.retain(|(scope, _), _| &scope.room_id != room_id);
    }

    /// Number of pending sends.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
