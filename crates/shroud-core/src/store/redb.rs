//! Redb-backed durable store implementation.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety. Pending
//! events, sequence counters, and committed group state all survive server
//! restarts, so a recipient reconnecting after a crash replays exactly the
//! events that were un-ACKed when the server went down.

use std::{path::Path, sync::Arc};

use redb::{Database, ReadableTable, TableDefinition};
use shroud_proto::{Event, EventDraft, GroupId};
use uuid::Uuid;

use super::{EventStore, StoreError, StoredGroup};

/// Table: events
/// Key: (recipient_id, sequence) encoded by [`encode_event_key`]
/// Value: CBOR-encoded Event
const EVENTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("events");

/// Table: event_index
/// Key: event_id as 16 UUID bytes
/// Value: CBOR-encoded (recipient_id, sequence) pair
const EVENT_INDEX: TableDefinition<&[u8], &[u8]> = TableDefinition::new("event_index");

/// Table: sequences
/// Key: recipient_id
/// Value: latest sequence ever assigned (u64)
///
/// Kept separate from EVENTS so counters survive deletion of every pending
/// event; sequences are never reused within a partition.
const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

/// Table: groups
/// Key: group_id
/// Value: CBOR-encoded StoredGroup
const GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("groups");

/// Durable store backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open or create a Redb database at the given path.
    ///
    /// Creates tables if they don't exist (EVENTS, EVENT_INDEX, SEQUENCES,
    /// GROUPS).
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path.as_ref()).map_err(|e| StoreError::Io(e.to_string()))?;

        let txn = db.begin_write().map_err(|e| StoreError::Io(e.to_string()))?;
        {
            let _ = txn.open_table(EVENTS).map_err(|e| StoreError::Io(e.to_string()))?;
            let _ = txn.open_table(EVENT_INDEX).map_err(|e| StoreError::Io(e.to_string()))?;
            let _ = txn.open_table(SEQUENCES).map_err(|e| StoreError::Io(e.to_string()))?;
            let _ = txn.open_table(GROUPS).map_err(|e| StoreError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StoreError::Io(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl EventStore for RedbStore {
    fn put(&self, draft: EventDraft, now_millis: u64) -> Result<Event, StoreError> {
        draft.validate()?;

        let txn = self.db.begin_write().map_err(|e| StoreError::Io(e.to_string()))?;

        // A retry of an already-stored submission returns the original event
        // instead of assigning a fresh sequence. Dropping the transaction
        // aborts it.
        let existing = {
            let index = txn.open_table(EVENT_INDEX).map_err(|e| StoreError::Io(e.to_string()))?;
            let location = index
                .get(draft.event_id.as_bytes().as_slice())
                .map_err(|e| StoreError::Io(e.to_string()))?
                .map(|entry| {
                    ciborium::from_reader::<(String, u64), _>(entry.value())
                        .map_err(|e| StoreError::Serialization(e.to_string()))
                })
                .transpose()?;

            match location {
                Some((owner, _)) if owner != draft.recipient_id => {
                    return Err(StoreError::DuplicateEventId(draft.event_id));
                },
                Some((owner, sequence)) => {
                    let events =
                        txn.open_table(EVENTS).map_err(|e| StoreError::Io(e.to_string()))?;
                    let key = encode_event_key(&owner, sequence);
                    events
                        .get(key.as_slice())
                        .map_err(|e| StoreError::Io(e.to_string()))?
                        .map(|value| {
                            ciborium::from_reader::<Event, _>(value.value())
                                .map_err(|e| StoreError::Serialization(e.to_string()))
                        })
                        .transpose()?
                },
                None => None,
            }
        };
        if let Some(event) = existing {
            return Ok(event);
        }

        let event = {
            let mut sequences =
                txn.open_table(SEQUENCES).map_err(|e| StoreError::Io(e.to_string()))?;

            let latest = sequences
                .get(draft.recipient_id.as_str())
                .map_err(|e| StoreError::Io(e.to_string()))?
                .map(|v| v.value())
                .unwrap_or(0);
            let sequence = latest + 1;

            sequences
                .insert(draft.recipient_id.as_str(), sequence)
                .map_err(|e| StoreError::Io(e.to_string()))?;
            drop(sequences);

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

            let mut event_bytes = Vec::new();
            ciborium::into_writer(&event, &mut event_bytes)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;

            let key = encode_event_key(&event.recipient_id, sequence);
            let mut events = txn.open_table(EVENTS).map_err(|e| StoreError::Io(e.to_string()))?;
            events
                .insert(key.as_slice(), event_bytes.as_slice())
                .map_err(|e| StoreError::Io(e.to_string()))?;
            drop(events);

            let mut index_bytes = Vec::new();
            ciborium::into_writer(&(&event.recipient_id, sequence), &mut index_bytes)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;

            let mut index =
                txn.open_table(EVENT_INDEX).map_err(|e| StoreError::Io(e.to_string()))?;
            index
                .insert(event.event_id.as_bytes().as_slice(), index_bytes.as_slice())
                .map_err(|e| StoreError::Io(e.to_string()))?;
            drop(index);

            event
        };

        txn.commit().map_err(|e| StoreError::Io(e.to_string()))?;

        Ok(event)
    }

    fn get(&self, event_id: Uuid, recipient_id: &str) -> Result<Option<Event>, StoreError> {
        let txn = self.db.begin_read().map_err(|e| StoreError::Io(e.to_string()))?;

        let index = txn.open_table(EVENT_INDEX).map_err(|e| StoreError::Io(e.to_string()))?;

        let Some(entry) = index
            .get(event_id.as_bytes().as_slice())
            .map_err(|e| StoreError::Io(e.to_string()))?
        else {
            return Ok(None);
        };

        let (owner, sequence): (String, u64) = ciborium::from_reader(entry.value())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        if owner != recipient_id {
            // An id owned by another recipient looks like an unknown id.
            return Ok(None);
        }

        let events = txn.open_table(EVENTS).map_err(|e| StoreError::Io(e.to_string()))?;
        let key = encode_event_key(&owner, sequence);

        match events.get(key.as_slice()).map_err(|e| StoreError::Io(e.to_string()))? {
            Some(value) => {
                let event: Event = ciborium::from_reader(value.value())
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(Some(event))
            },
            None => Ok(None),
        }
    }

    fn list_pending(&self, recipient_id: &str, limit: usize) -> Result<Vec<Event>, StoreError> {
        let txn = self.db.begin_read().map_err(|e| StoreError::Io(e.to_string()))?;

        let events = txn.open_table(EVENTS).map_err(|e| StoreError::Io(e.to_string()))?;

        let start_key = encode_event_key(recipient_id, 0);
        let end_key = encode_event_key(recipient_id, u64::MAX);

        let results = events
            .range(start_key.as_slice()..=end_key.as_slice())
            .map_err(|e| StoreError::Io(e.to_string()))?;

        let mut pending = Vec::new();
        for result in results {
            if pending.len() >= limit {
                break;
            }

            let (_, value) = result.map_err(|e| StoreError::Io(e.to_string()))?;
            let event: Event = ciborium::from_reader(value.value())
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            pending.push(event);
        }

        Ok(pending)
    }

    fn delete(&self, event_id: Uuid, recipient_id: &str) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(|e| StoreError::Io(e.to_string()))?;

        {
            let mut index =
                txn.open_table(EVENT_INDEX).map_err(|e| StoreError::Io(e.to_string()))?;

            let location = match index
                .get(event_id.as_bytes().as_slice())
                .map_err(|e| StoreError::Io(e.to_string()))?
            {
                Some(entry) => {
                    let (owner, sequence): (String, u64) = ciborium::from_reader(entry.value())
                        .map_err(|e| StoreError::Serialization(e.to_string()))?;
                    if owner == recipient_id { Some((owner, sequence)) } else { None }
                },
                // Unknown or foreign id: no-op, delete stays idempotent.
                None => None,
            };

            if let Some((owner, sequence)) = location {
                index
                    .remove(event_id.as_bytes().as_slice())
                    .map_err(|e| StoreError::Io(e.to_string()))?;

                let key = encode_event_key(&owner, sequence);
                let mut events =
                    txn.open_table(EVENTS).map_err(|e| StoreError::Io(e.to_string()))?;
                events.remove(key.as_slice()).map_err(|e| StoreError::Io(e.to_string()))?;
            }
        }

        txn.commit().map_err(|e| StoreError::Io(e.to_string()))?;

        Ok(())
    }

    fn expire_older_than(&self, cutoff_millis: u64) -> Result<u64, StoreError> {
        let txn = self.db.begin_write().map_err(|e| StoreError::Io(e.to_string()))?;

        let expired = {
            let mut events = txn.open_table(EVENTS).map_err(|e| StoreError::Io(e.to_string()))?;

            // Collect first: removal invalidates the range iterator.
            let mut stale: Vec<(Vec<u8>, Uuid)> = Vec::new();
            for result in events.iter().map_err(|e| StoreError::Io(e.to_string()))? {
                let (key, value) = result.map_err(|e| StoreError::Io(e.to_string()))?;
                let event: Event = ciborium::from_reader(value.value())
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;

                if event.timestamp < cutoff_millis {
                    stale.push((key.value().to_vec(), event.event_id));
                }
            }

            let mut index =
                txn.open_table(EVENT_INDEX).map_err(|e| StoreError::Io(e.to_string()))?;
            for (key, event_id) in &stale {
                events.remove(key.as_slice()).map_err(|e| StoreError::Io(e.to_string()))?;
                index
                    .remove(event_id.as_bytes().as_slice())
                    .map_err(|e| StoreError::Io(e.to_string()))?;
            }

            stale.len() as u64
        };

        txn.commit().map_err(|e| StoreError::Io(e.to_string()))?;

        Ok(expired)
    }

    fn latest_sequence(&self, recipient_id: &str) -> Result<Option<u64>, StoreError> {
        let txn = self.db.begin_read().map_err(|e| StoreError::Io(e.to_string()))?;

        let sequences = txn.open_table(SEQUENCES).map_err(|e| StoreError::Io(e.to_string()))?;

        Ok(sequences
            .get(recipient_id)
            .map_err(|e| StoreError::Io(e.to_string()))?
            .map(|v| v.value()))
    }

    fn store_group(&self, group: &StoredGroup) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(|e| StoreError::Io(e.to_string()))?;

        {
            let mut table = txn.open_table(GROUPS).map_err(|e| StoreError::Io(e.to_string()))?;

            let mut bytes = Vec::new();
            ciborium::into_writer(group, &mut bytes)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;

            table
                .insert(group.group_id.as_str(), bytes.as_slice())
                .map_err(|e| StoreError::Io(e.to_string()))?;
        }

        txn.commit().map_err(|e| StoreError::Io(e.to_string()))?;

        Ok(())
    }

    fn load_group(&self, group_id: &str) -> Result<Option<StoredGroup>, StoreError> {
        let txn = self.db.begin_read().map_err(|e| StoreError::Io(e.to_string()))?;

        let table = txn.open_table(GROUPS).map_err(|e| StoreError::Io(e.to_string()))?;

        match table.get(group_id).map_err(|e| StoreError::Io(e.to_string()))? {
            Some(value) => {
                let group: StoredGroup = ciborium::from_reader(value.value())
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(Some(group))
            },
            None => Ok(None),
        }
    }

    fn list_groups(&self) -> Result<Vec<GroupId>, StoreError> {
        let txn = self.db.begin_read().map_err(|e| StoreError::Io(e.to_string()))?;

        let table = txn.open_table(GROUPS).map_err(|e| StoreError::Io(e.to_string()))?;

        let mut groups = Vec::new();
        for result in table.iter().map_err(|e| StoreError::Io(e.to_string()))? {
            let (key, _) = result.map_err(|e| StoreError::Io(e.to_string()))?;
            groups.push(key.value().to_string());
        }

        Ok(groups)
    }
}

/// Encode (recipient_id, sequence) as a length-prefixed key.
///
/// Layout: [recipient len: 2 bytes BE][recipient bytes][sequence: 8 bytes BE]
/// Keys for one recipient share a prefix, so a range scan over
/// `(recipient, 0)..=(recipient, u64::MAX)` yields that recipient's events in
/// ascending sequence order and nothing else. The 2-byte length field cannot
/// wrap: `put` validates recipient ids against `MAX_USER_ID_BYTES` (255)
/// before any key is built.
fn encode_event_key(recipient_id: &str, sequence: u64) -> Vec<u8> {
    let recipient = recipient_id.as_bytes();
    let mut key = Vec::with_capacity(2 + recipient.len() + 8);
    key.extend_from_slice(&(recipient.len() as u16).to_be_bytes());
    key.extend_from_slice(recipient);
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

#[cfg(test)]
mod tests {
    use shroud_proto::{EventType, Metadata};
    use tempfile::tempdir;

    use super::*;

    fn draft(recipient: &str) -> EventDraft {
        EventDraft {
            event_id: Uuid::new_v4(),
            recipient_id: recipient.to_string(),
            sender_id: Some("sender".to_string()),
            event_type: EventType::Message,
            timestamp: 0,
            metadata: Metadata::new(),
            encrypted_payload: vec![0xAB; 32],
        }
    }

    #[test]
    fn test_event_key_ordering() {
        // Lexicographic key order must match numeric sequence order.
        let k1 = encode_event_key("alice", 1);
        let k2 = encode_event_key("alice", 2);
        let k300 = encode_event_key("alice", 300);
        assert!(k1 < k2);
        assert!(k2 < k300);

        // A recipient whose name extends another's must not fall inside the
        // shorter recipient's range.
        let alice_max = encode_event_key("alice", u64::MAX);
        let alicia = encode_event_key("alicia", 0);
        assert!(alicia > alice_max || alicia < encode_event_key("alice", 0));
    }

    #[test]
    fn test_put_rejects_recipient_id_that_would_alias_key_prefix() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("test.redb")).unwrap();

        let stored = store.put(draft("alice"), 100).unwrap();

        // 65541 bytes: the length wraps a u16 back to 5, so an unchecked key
        // would share alice's prefix and land inside her range scan.
        let long_id = format!("alice{}", "x".repeat(65536));
        let result = store.put(draft(&long_id), 100);
        assert!(matches!(result, Err(StoreError::Validation(_))));

        let pending = store.list_pending("alice", 10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event_id, stored.event_id);
    }

    #[test]
    fn test_put_assigns_sequential_sequences() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("test.redb")).unwrap();

        let e1 = store.put(draft("alice"), 100).unwrap();
        let e2 = store.put(draft("alice"), 101).unwrap();
        let e3 = store.put(draft("alice"), 102).unwrap();

        assert_eq!((e1.sequence, e2.sequence, e3.sequence), (1, 2, 3));
        assert_eq!(store.latest_sequence("alice").unwrap(), Some(3));
    }

    #[test]
    fn test_resubmitted_draft_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("test.redb")).unwrap();

        let retried = draft("alice");
        let first = store.put(retried.clone(), 100).unwrap();

        // The retry after a lost reply gets the stored event back; the index
        // still points at the only copy, so an ACK clears the queue.
        let replayed = store.put(retried, 200).unwrap();
        assert_eq!(replayed, first);
        assert_eq!(store.list_pending("alice", 10).unwrap().len(), 1);
        assert_eq!(store.latest_sequence("alice").unwrap(), Some(1));

        store.delete(first.event_id, "alice").unwrap();
        assert!(store.list_pending("alice", 10).unwrap().is_empty());
    }

    #[test]
    fn test_event_id_reuse_across_recipients_rejected() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("test.redb")).unwrap();

        let alice = draft("alice");
        let mut bob = alice.clone();
        bob.recipient_id = "bob".to_string();

        store.put(alice, 100).unwrap();
        assert!(matches!(store.put(bob, 100), Err(StoreError::DuplicateEventId(_))));
        assert!(store.list_pending("bob", 10).unwrap().is_empty());
        assert_eq!(store.latest_sequence("bob").unwrap(), None);
    }

    #[test]
    fn test_sequences_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.redb");

        {
            let store = RedbStore::open(&path).unwrap();
            let event = store.put(draft("alice"), 100).unwrap();
            store.delete(event.event_id, "alice").unwrap();
        }

        let store = RedbStore::open(&path).unwrap();
        assert_eq!(store.latest_sequence("alice").unwrap(), Some(1));

        // The counter persisted even though the queue is empty.
        let event = store.put(draft("alice"), 100).unwrap();
        assert_eq!(event.sequence, 2);
    }

    #[test]
    fn test_pending_events_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.redb");

        let stored = {
            let store = RedbStore::open(&path).unwrap();
            store.put(draft("alice"), 5_000).unwrap()
        };

        let store = RedbStore::open(&path).unwrap();
        let pending = store.list_pending("alice", 10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0], stored);
    }

    #[test]
    fn test_list_pending_ordered_and_limited() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("test.redb")).unwrap();

        for _ in 0..10 {
            store.put(draft("alice"), 100).unwrap();
        }
        store.put(draft("bob"), 100).unwrap();

        let all = store.list_pending("alice", 100).unwrap();
        let sequences: Vec<u64> = all.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, (1..=10).collect::<Vec<u64>>());

        let limited = store.list_pending("alice", 4).unwrap();
        assert_eq!(limited.len(), 4);
        assert_eq!(limited[3].sequence, 4);
    }

    #[test]
    fn test_get_checks_ownership() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("test.redb")).unwrap();

        let event = store.put(draft("alice"), 100).unwrap();

        assert_eq!(store.get(event.event_id, "alice").unwrap(), Some(event.clone()));
        assert_eq!(store.get(event.event_id, "mallory").unwrap(), None);
        assert_eq!(store.get(Uuid::new_v4(), "alice").unwrap(), None);
    }

    #[test]
    fn test_delete_idempotent() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("test.redb")).unwrap();

        let event = store.put(draft("alice"), 100).unwrap();

        store.delete(event.event_id, "alice").unwrap();
        store.delete(event.event_id, "alice").unwrap();
        store.delete(Uuid::new_v4(), "alice").unwrap();

        assert!(store.list_pending("alice", 10).unwrap().is_empty());
    }

    #[test]
    fn test_expire_older_than() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("test.redb")).unwrap();

        let mut old = draft("alice");
        old.timestamp = 1_000;
        store.put(old, 1_000).unwrap();

        let mut old_bob = draft("bob");
        old_bob.timestamp = 1_500;
        store.put(old_bob, 1_500).unwrap();

        let fresh = store.put(draft("alice"), 9_000).unwrap();

        assert_eq!(store.expire_older_than(5_000).unwrap(), 2);
        assert_eq!(store.expire_older_than(5_000).unwrap(), 0);

        let pending = store.list_pending("alice", 10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event_id, fresh.event_id);
        assert!(store.get(fresh.event_id, "alice").unwrap().is_some());
    }

    #[test]
    fn test_group_roundtrip_and_overwrite() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("test.redb")).unwrap();

        assert!(store.load_group("g1").unwrap().is_none());
        assert!(store.list_groups().unwrap().is_empty());

        let group = StoredGroup {
            group_id: "g1".to_string(),
            members: vec!["alice".to_string(), "bob".to_string()],
            key_version: 1,
        };
        store.store_group(&group).unwrap();

        let updated = StoredGroup { key_version: 2, ..group };
        store.store_group(&updated).unwrap();

        let loaded = store.load_group("g1").unwrap().unwrap();
        assert_eq!(loaded.key_version, 2);
        assert_eq!(store.list_groups().unwrap(), vec!["g1".to_string()]);
    }

    #[test]
    fn test_groups_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.redb");

        {
            let store = RedbStore::open(&path).unwrap();
            let group = StoredGroup {
                group_id: "g1".to_string(),
                members: vec!["alice".to_string()],
                key_version: 7,
            };
            store.store_group(&group).unwrap();
        }

        let store = RedbStore::open(&path).unwrap();
        assert_eq!(store.load_group("g1").unwrap().unwrap().key_version, 7);
    }
}
