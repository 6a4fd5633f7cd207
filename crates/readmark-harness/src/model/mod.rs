//! Model-based testing support.
//!
//! [`ModelWorld`] is a naive reference implementation of read tracking.
//! Random [`Operation`]s are resolved by the model into concrete [`Step`]s,
//! applied to a [`crate::Scenario`], and the observable states of both sides
//! are compared.

mod operation;
mod world;

pub use operation::{MODEL_ROOMS, ModelRoomId, Operation, Step, room_name};
pub use world::{ModelWorld, ObservableState, Resolved, RoomObservation};
