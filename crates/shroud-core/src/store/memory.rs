use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use shroud_proto::{Event, EventDraft, GroupId, UserId};
use uuid::Uuid;

use super::{EventStore, StoreError, StoredGroup};

/// In-memory store implementation for testing and simulation.
///
/// Each recipient partition is an independent entry: a `BTreeMap` ordered by
/// sequence plus a persistent `next_sequence` counter that survives deletion
/// of every event, so sequences are never reused. A global `event_id` index
/// supports delete-by-id. All state is wrapped in `Arc<Mutex<>>` to allow
/// Clone and concurrent access; uses `lock().expect()` which panics if the
/// mutex is poisoned - acceptable for test code.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

/// One recipient's partition. Never destroyed once created; an empty
/// partition keeps its sequence counter.
#[derive(Default)]
struct Partition {
    next_sequence: u64,
    events: BTreeMap<u64, Event>,
}

struct MemoryStoreInner {
    partitions: HashMap<UserId, Partition>,
    /// `event_id` -> (recipient, sequence) reverse index.
    index: HashMap<Uuid, (UserId, u64)>,
    groups: HashMap<GroupId, StoredGroup>,
}

impl MemoryStore {
    /// Create a new empty `MemoryStore`.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryStoreInner {
                partitions: HashMap::new(),
                index: HashMap::new(),
                groups: HashMap::new(),
            })),
        }
    }

    /// Total number of pending events across all recipients.
    ///
    /// Useful for debugging and testing.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. Acceptable for test code.
    #[allow(clippy::expect_used)]
    pub fn total_pending(&self) -> usize {
        let inner = self.inner.lock().expect("Mutex poisoned");
        inner.partitions.values().map(|p| p.events.len()).sum()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore for MemoryStore {
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. Acceptable for test code.
    #[allow(clippy::expect_used)]
    fn put(&self, draft: EventDraft, now_millis: u64) -> Result<Event, StoreError> {
        draft.validate()?;

        let mut inner = self.inner.lock().expect("Mutex poisoned");

        // A retry of an already-stored submission returns the original event
        // instead of assigning a fresh sequence.
        if let Some((owner, sequence)) = inner.index.get(&draft.event_id) {
            if *owner != draft.recipient_id {
                return Err(StoreError::DuplicateEventId(draft.event_id));
            }
            if let Some(event) = inner.partitions.get(owner).and_then(|p| p.events.get(sequence)) {
                return Ok(event.clone());
            }
        }

        let partition = inner.partitions.entry(draft.recipient_id.clone()).or_default();
        partition.next_sequence += 1;
        let sequence = partition.next_sequence;

        let event = Event {
            event_id: draft.event_id,
            recipient_id: draft.recipient_id,
            sender_id: draft.sender_id,
            event_type: draft.event_type,
            sequence,
            timestamp: if draft.timestamp == 0 { now_millis } else { draft.timestamp },
            metadata: draft.metadata,
            encrypted_payload: draft.encrypted_payload,
        };

        partition.events.insert(sequence, event.clone());
        inner.index.insert(event.event_id, (event.recipient_id.clone(), sequence));

        Ok(event)
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. Acceptable for test code.
    #[allow(clippy::expect_used)]
    fn get(&self, event_id: Uuid, recipient_id: &str) -> Result<Option<Event>, StoreError> {
        let inner = self.inner.lock().expect("Mutex poisoned");

        let Some((owner, sequence)) = inner.index.get(&event_id) else {
            return Ok(None);
        };
        if owner != recipient_id {
            // An id belonging to another recipient is indistinguishable from
            // an unknown id.
            return Ok(None);
        }

        Ok(inner.partitions.get(owner).and_then(|p| p.events.get(sequence)).cloned())
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. Acceptable for test code.
    #[allow(clippy::expect_used)]
    fn list_pending(&self, recipient_id: &str, limit: usize) -> Result<Vec<Event>, StoreError> {
        let inner = self.inner.lock().expect("Mutex poisoned");

        Ok(inner
            .partitions
            .get(recipient_id)
            .map(|p| p.events.values().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. Acceptable for test code.
    #[allow(clippy::expect_used)]
    fn delete(&self, event_id: Uuid, recipient_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");

        let Some((owner, sequence)) = inner.index.get(&event_id).cloned() else {
            return Ok(());
        };
        if owner != recipient_id {
            return Ok(());
        }

        if let Some(partition) = inner.partitions.get_mut(&owner) {
            partition.events.remove(&sequence);
        }
        inner.index.remove(&event_id);

        Ok(())
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. Acceptable for test code.
    #[allow(clippy::expect_used)]
    fn expire_older_than(&self, cutoff_millis: u64) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");

        let mut expired: Vec<Uuid> = Vec::new();
        for partition in inner.partitions.values_mut() {
            let stale: Vec<u64> = partition
                .events
                .iter()
                .filter(|(_, e)| e.timestamp < cutoff_millis)
                .map(|(seq, _)| *seq)
                .collect();
            for seq in stale {
                if let Some(event) = partition.events.remove(&seq) {
                    expired.push(event.event_id);
                }
            }
        }

        for event_id in &expired {
            inner.index.remove(event_id);
        }

        Ok(expired.len() as u64)
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. Acceptable for test code.
    #[allow(clippy::expect_used)]
    fn latest_sequence(&self, recipient_id: &str) -> Result<Option<u64>, StoreError> {
        let inner = self.inner.lock().expect("Mutex poisoned");

        Ok(inner
            .partitions
            .get(recipient_id)
            .and_then(|p| if p.next_sequence == 0 { None } else { Some(p.next_sequence) }))
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. Acceptable for test code.
    #[allow(clippy::expect_used)]
    fn store_group(&self, group: &StoredGroup) -> Result<(), StoreError> {
        self.inner
            .lock()
            .expect("Mutex poisoned")
            .groups
            .insert(group.group_id.clone(), group.clone());
        Ok(())
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. Acceptable for test code.
    #[allow(clippy::expect_used)]
    fn load_group(&self, group_id: &str) -> Result<Option<StoredGroup>, StoreError> {
        Ok(self.inner.lock().expect("Mutex poisoned").groups.get(group_id).cloned())
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. Acceptable for test code.
    #[allow(clippy::expect_used)]
    fn list_groups(&self) -> Result<Vec<GroupId>, StoreError> {
        Ok(self.inner.lock().expect("Mutex poisoned").groups.keys().cloned().collect())
    }
}
