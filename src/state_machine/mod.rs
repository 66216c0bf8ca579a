//! # Dispatch State Machine
//!
//! `Pending → Queued → Sending → {Sent | Retry | Failed}`, with `Retry → Queued`
//! happening on the broker (dead-letter redelivery) and `Expired` reachable
//! from the pre-send states of time-sensitive channels.
//!
//! Transitions are pure functions of the current state and the event; the
//! persisted status is only ever written by the record store.

pub mod events;
pub mod guards;
pub mod states;

pub use events::DispatchEvent;
pub use guards::{resolve_failure, TransitionGuard};
pub use states::DispatchStatus;
