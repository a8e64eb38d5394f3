//! Per-recipient queue management and rotation gating.
//!
//! The queue manager is a thin layer over the event store that owns the gate
//! table. During a group key rotation, MESSAGE events for that group are
//! withheld from members whose GROUP_KEY_UPDATE is still un-ACKed; everything
//! else (the key update itself, unrelated events) flows normally.
//!
//! Gating is evaluated lazily at delivery time against the current gate
//! table, never recorded on stored events. The rotation coordinator mutates
//! the table exclusively through [`GateUpdate`] values the caller applies
//! here, so the coordinator and the queue manager never lock each other.

use std::collections::{HashMap, HashSet};

use shroud_proto::{Event, EventDraft, EventType, GroupId, UserId};
use tracing::debug;

use crate::store::{EventStore, StoreError};

/// Upper bound on events scanned or replayed per recipient in one call.
///
/// A recipient with more pending events than this drains the rest through
/// ACK-driven progress: each ACK frees a slot for the next scan.
pub const REPLAY_LIMIT: usize = 1024;

/// A change to the gate table, produced by the rotation coordinator and
/// applied by the queue manager's owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateUpdate {
    /// A rotation started (or was superseded): withhold MESSAGEs of this
    /// group from every member in `pending` until each one ACKs its key
    /// update. Replaces any existing gate for the group.
    Engaged {
        /// Group being rotated.
        group_id: GroupId,
        /// Key version the rotation is distributing.
        key_version: u64,
        /// Members whose key update is outstanding.
        pending: HashSet<UserId>,
    },
    /// One member ACKed its key update; stop withholding from them. The gate
    /// itself stays engaged until [`GateUpdate::Lifted`].
    MemberCleared {
        /// Group being rotated.
        group_id: GroupId,
        /// Member that ACKed.
        member: UserId,
    },
    /// The rotation committed (all ACKs in, or deadline passed); deliver
    /// freely again.
    Lifted {
        /// Group whose rotation finished.
        group_id: GroupId,
    },
}

/// Engaged gate state for one group.
#[derive(Debug, Clone)]
struct Gate {
    key_version: u64,
    pending: HashSet<UserId>,
}

/// Queue manager: enqueue, ordered delivery, and rotation gating over an
/// [`EventStore`].
#[derive(Debug, Clone)]
pub struct QueueManager<S> {
    store: S,
    gates: HashMap<GroupId, Gate>,
}

impl<S: EventStore> QueueManager<S> {
    /// Create a queue manager over the given store with no gates engaged.
    pub fn new(store: S) -> Self {
        Self { store, gates: HashMap::new() }
    }

    /// Access the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Validate and persist a draft, assigning its sequence number.
    pub fn enqueue(&self, draft: EventDraft, now_millis: u64) -> Result<Event, StoreError> {
        self.store.put(draft, now_millis)
    }

    /// Apply a gate table change from the rotation coordinator.
    pub fn apply_gate_update(&mut self, update: GateUpdate) {
        match update {
            GateUpdate::Engaged { group_id, key_version, pending } => {
                debug!(group = %group_id, key_version, pending = pending.len(), "gate engaged");
                self.gates.insert(group_id, Gate { key_version, pending });
            },
            GateUpdate::MemberCleared { group_id, member } => {
                if let Some(gate) = self.gates.get_mut(&group_id) {
                    gate.pending.remove(&member);
                }
            },
            GateUpdate::Lifted { group_id } => {
                debug!(group = %group_id, "gate lifted");
                self.gates.remove(&group_id);
            },
        }
    }

    /// Whether a gate is currently engaged for the group.
    pub fn is_gate_engaged(&self, group_id: &str) -> bool {
        self.gates.contains_key(group_id)
    }

    /// Key version the engaged gate is distributing, if any.
    pub fn engaged_key_version(&self, group_id: &str) -> Option<u64> {
        self.gates.get(group_id).map(|gate| gate.key_version)
    }

    /// Whether this event is withheld from its recipient right now.
    ///
    /// Only MESSAGE events are ever gated; key updates, session control, and
    /// unknown types always flow. Events without a `group_id` metadata key
    /// cannot match a gate.
    pub fn is_gated(&self, event: &Event) -> bool {
        if event.event_type != EventType::Message {
            return false;
        }
        let Some(group_id) = event.group_id() else {
            return false;
        };
        self.gates.get(group_id).is_some_and(|gate| gate.pending.contains(&event.recipient_id))
    }

    /// Lowest-sequence pending event for the recipient that is not currently
    /// gated. Gated events are skipped, not consumed; they resurface in order
    /// once their gate clears.
    pub fn next_deliverable(&self, recipient_id: &str) -> Result<Option<Event>, StoreError> {
        let pending = self.store.list_pending(recipient_id, REPLAY_LIMIT)?;
        Ok(pending.into_iter().find(|event| !self.is_gated(event)))
    }

    /// All currently deliverable events for the recipient, ascending by
    /// sequence, at most `limit`. Used for replay on (re)connection.
    pub fn deliverable(&self, recipient_id: &str, limit: usize) -> Result<Vec<Event>, StoreError> {
        let scan = limit.min(REPLAY_LIMIT);
        let pending = self.store.list_pending(recipient_id, scan)?;
        Ok(pending.into_iter().filter(|event| !self.is_gated(event)).collect())
    }
}
