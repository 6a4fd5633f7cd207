//! Read-state engine
//!
//! Decides, for every room and every thread inside it, whether it is read or
//! unread and how many unread items it has. The engine consumes timeline
//! events and the local user's receipts, persists read markers through
//! [`readmark_storage::MarkerStorage`], and tells the caller which receipts
//! to send.
//!
//! # Architecture
//!
//! Sans-IO and action-based. The caller feeds [`EngineEvent`]s (or calls the
//! matching methods) into a [`ReadStateEngine`], which updates its state and
//! returns [`EngineAction`]s for the caller to execute. No networking, no
//! timers, no threads.
//!
//! # Components
//!
//! - [`classify`]: event category and countability
//! - [`TimelineIndex`]: per-scope ordered events with gap bookkeeping
//! - [`ReceiptStore`]: public and private markers, monotonic per kind
//! - [`aggregate`]: [`RoomReadState`] and [`ThreadSummary`] computation
//! - [`ReadStateEngine`]: the controller tying them together
//! - [`ReceiptOutbox`]: coalesced, debounced receipt sends
//! - [`ObserverList`]: read-state change subscriptions

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregate;
pub mod classify;
pub mod config;
pub mod engine;
pub mod env;
pub mod error;
pub mod event;
pub mod ids;
pub mod observer;
pub mod outbox;
pub mod receipts;
pub mod timeline;

pub use aggregate::{RoomReadState, ThreadSummary, compute_room_read_state, compute_thread_summary};
pub use classify::{Classification, Classifier, Countability, EventCategory};
pub use config::EngineConfig;
pub use engine::{EngineAction, EngineEvent, Focus, ReadStateEngine};
pub use env::{Environment, SystemEnv};
pub use error::EngineError;
pub use event::{Event, EventContent, Position};
pub use ids::{EventId, RoomId, ScopeKey, UserId};
pub use observer::{ObserverList, ReadStateObserver, SubscriptionId};
pub use outbox::{QueuedReceipt, ReceiptOutbox};
pub use receipts::{
    Advance, BatchAdvance, ReadMarker, ReceiptKind, ReceiptStore, ReceiptThreading,
};
pub use timeline::{Appended, IndexedEvent, TimelineIndex};
