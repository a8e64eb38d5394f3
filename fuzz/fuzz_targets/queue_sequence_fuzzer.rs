//! Fuzz target for queue sequence assignment
//!
//! Drives arbitrary put/delete/expire interleavings against the store and
//! checks the ordering contract:
//!
//! - Sequences per recipient are strictly increasing and gap-free
//! - Resubmitting a pending id returns the stored event, not a new sequence
//! - Reusing an id for a different recipient is rejected
//! - Deletes and expiry never cause a sequence number to be reused
//! - No operation panics, whatever the interleaving

#![no_main]

use std::collections::HashMap;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use shroud_core::{EventStore, MemoryStore};
use shroud_proto::{EventDraft, EventType, Metadata};

#[derive(Debug, Arbitrary)]
enum Op {
    Put { recipient: u8, id: [u8; 16], payload_len: u8 },
    Delete { recipient: u8, id: [u8; 16] },
    Expire { cutoff: u64 },
}

fuzz_target!(|ops: Vec<Op>| {
    let store = MemoryStore::new();
    let mut latest: HashMap<String, u64> = HashMap::new();
    // Mirror of the store's pending id index: id -> (recipient, sequence).
    let mut pending: HashMap<uuid::Uuid, (String, u64)> = HashMap::new();

    for op in ops {
        match op {
            Op::Put { recipient, id, payload_len } => {
                let recipient = format!("user-{}", recipient % 8);
                let event_id = uuid::Uuid::from_bytes(id);
                let draft = EventDraft {
                    event_id,
                    recipient_id: recipient.clone(),
                    sender_id: None,
                    event_type: EventType::Message,
                    timestamp: 0,
                    metadata: Metadata::new(),
                    encrypted_payload: vec![0; payload_len as usize],
                };
                match store.put(draft, 1) {
                    Ok(event) => match pending.get(&event_id) {
                        Some((owner, sequence)) => {
                            assert_eq!(owner, &recipient);
                            assert_eq!(event.sequence, *sequence);
                        },
                        None => {
                            let prev = latest.insert(recipient.clone(), event.sequence);
                            assert_eq!(event.sequence, prev.map_or(1, |p| p + 1));
                            pending.insert(event_id, (recipient, event.sequence));
                        },
                    },
                    Err(_) => {
                        assert!(
                            pending.get(&event_id).is_some_and(|(owner, _)| owner != &recipient)
                        );
                    },
                }
            },
            Op::Delete { recipient, id } => {
                let recipient = format!("user-{}", recipient % 8);
                let event_id = uuid::Uuid::from_bytes(id);
                let _ = store.delete(event_id, &recipient);
                if pending.get(&event_id).is_some_and(|(owner, _)| owner == &recipient) {
                    pending.remove(&event_id);
                }
            },
            Op::Expire { cutoff } => {
                let _ = store.expire_older_than(cutoff);
                // Every stored event carries timestamp 1.
                if cutoff > 1 {
                    pending.clear();
                }
            },
        }
    }
});
