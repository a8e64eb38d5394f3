//! Shroud delivery core.
//!
//! Sans-IO implementation of the relay's hard guarantees: per-recipient FIFO
//! queues with strictly increasing sequence numbers, at-least-once delivery
//! with explicit idempotent acknowledgement, TTL-bounded retention, and a
//! consistency-over-availability group-key rotation protocol that gates
//! message delivery while a key update is outstanding.
//!
//! No networking or clocks live here. Callers (the server driver) pass wall
//! time in and execute the actions this crate returns, which keeps every
//! state machine deterministic and directly testable.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod ack;
pub mod env;
pub mod queue;
pub mod reaper;
pub mod rotation;
pub mod store;

pub use ack::{AckOutcome, AckProcessor};
pub use env::{Environment, VirtualEnv};
pub use queue::{GateUpdate, QueueManager};
pub use reaper::Reaper;
pub use rotation::{
    RotationAction, RotationConfig, RotationCoordinator, RotationError, RotationState,
};
pub use store::{EventStore, MemoryStore, RedbStore, StoreError, StoredGroup};
