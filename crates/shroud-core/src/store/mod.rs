//! Event Store abstraction.
//!
//! Trait-based abstraction over durable keyed storage of pending events per
//! recipient, plus the committed group registry the rotation coordinator
//! persists through. The trait is synchronous (no async) to keep the core
//! Sans-IO.
//!
//! The store exclusively owns Event lifetime: events enter via [`put`] and
//! leave only via the idempotent [`delete`] (ACK) or [`expire_older_than`]
//! (TTL sweep). Sequence numbers are assigned at `put` and never reused,
//! even after every event in a partition has been deleted.
//!
//! [`put`]: EventStore::put
//! [`delete`]: EventStore::delete
//! [`expire_older_than`]: EventStore::expire_older_than

mod error;
mod memory;
mod redb;

pub use error::StoreError;
pub use memory::MemoryStore;
use serde::{Deserialize, Serialize};
use shroud_proto::{Event, EventDraft, GroupId, UserId};
use uuid::Uuid;

pub use self::redb::RedbStore;

/// Committed group state persisted by the rotation coordinator.
///
/// Only the committed view is durable; in-flight rotation records are
/// in-memory and reconstructed as fresh rotations after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredGroup {
    /// Group identifier.
    pub group_id: GroupId,
    /// Committed membership. Members dropped at a rotation deadline are
    /// absent here and can no longer decrypt future messages.
    pub members: Vec<UserId>,
    /// Committed key version.
    pub key_version: u64,
}

/// Durable keyed storage of pending events per recipient.
///
/// Must be Clone (shared across driver and background tasks), Send + Sync,
/// and synchronous. Implementations typically share internal state via Arc,
/// so clones access the same underlying storage.
pub trait EventStore: Clone + Send + Sync + 'static {
    /// Validate and persist a draft, assigning the next sequence number for
    /// its recipient atomically. A zero `timestamp` is replaced with
    /// `now_millis`.
    ///
    /// Idempotent per event id: when the draft's `event_id` is already
    /// stored for the same recipient, the stored event is returned unchanged
    /// (no new sequence), so a producer that lost the reply can resubmit
    /// safely. The same id stored for a different recipient is rejected with
    /// [`StoreError::DuplicateEventId`].
    ///
    /// # Invariants
    ///
    /// - Post: returned event's `sequence` = previous latest + 1 (1 for a
    ///   fresh partition), linearizable per recipient under concurrent puts.
    fn put(&self, draft: EventDraft, now_millis: u64) -> Result<Event, StoreError>;

    /// Look up a single pending event. `None` if absent.
    fn get(&self, event_id: Uuid, recipient_id: &str) -> Result<Option<Event>, StoreError>;

    /// All pending events for a recipient, ascending by sequence, at most
    /// `limit`. Presents a consistent snapshot per call: no event missing
    /// that existed at call start, no torn reads.
    fn list_pending(&self, recipient_id: &str, limit: usize) -> Result<Vec<Event>, StoreError>;

    /// Remove an event if present. No-op (and no error) when absent, which
    /// is what makes ACK and expiry convergent.
    fn delete(&self, event_id: Uuid, recipient_id: &str) -> Result<(), StoreError>;

    /// Bulk-delete events with `timestamp` older than the cutoff across all
    /// recipients. Returns the number deleted.
    fn expire_older_than(&self, cutoff_millis: u64) -> Result<u64, StoreError>;

    /// Latest sequence ever assigned for a recipient, including sequences of
    /// since-deleted events. `None` for a never-written partition.
    fn latest_sequence(&self, recipient_id: &str) -> Result<Option<u64>, StoreError>;

    /// Persist committed group state, overwriting any previous version.
    fn store_group(&self, group: &StoredGroup) -> Result<(), StoreError>;

    /// Load committed group state. `None` if the group is unknown.
    fn load_group(&self, group_id: &str) -> Result<Option<StoredGroup>, StoreError>;

    /// All known group ids, for coordinator recovery at startup. Order is
    /// not guaranteed.
    fn list_groups(&self) -> Result<Vec<GroupId>, StoreError>;
}
