//! Property-based tests for the delivery queue.
//!
//! These verify the ordering invariants that must hold for all inputs:
//! per-recipient sequences are strictly increasing and gap-free, ACKs and
//! expiry never disturb the order of surviving events, and gated messages
//! are never handed to a pending member.

use std::collections::{HashMap, HashSet};

use proptest::prelude::*;
use shroud_core::{AckProcessor, EventStore, GateUpdate, MemoryStore, QueueManager};
use shroud_proto::{Ack, EventDraft, EventType, Metadata, MetadataValue, keys};
use uuid::Uuid;

fn draft_for(recipient: &str, event_type: EventType, group: Option<&str>) -> EventDraft {
    let mut metadata = Metadata::new();
    if let Some(g) = group {
        metadata.insert(keys::GROUP_ID.to_string(), MetadataValue::Str(g.to_string()));
    }
    EventDraft {
        event_id: Uuid::new_v4(),
        recipient_id: recipient.to_string(),
        sender_id: Some("sender".to_string()),
        event_type,
        timestamp: 0,
        metadata,
        encrypted_payload: vec![0xCC; 8],
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: interleaved puts across recipients assign each recipient
    /// the sequences 1..=n with no gaps and no duplicates.
    #[test]
    fn prop_sequences_gap_free_under_interleaving(
        recipients in prop::collection::vec(0u8..4, 1..60)
    ) {
        let store = MemoryStore::new();
        let mut counts: HashMap<String, u64> = HashMap::new();

        for r in &recipients {
            let name = format!("user-{r}");
            let event = store.put(draft_for(&name, EventType::Message, None), 1_000)?;
            let count = counts.entry(name).or_insert(0);
            *count += 1;
            prop_assert_eq!(event.sequence, *count);
        }

        for (name, count) in &counts {
            let pending = store.list_pending(name, 1_000)?;
            let sequences: Vec<u64> = pending.iter().map(|e| e.sequence).collect();
            prop_assert_eq!(sequences, (1..=*count).collect::<Vec<u64>>());
        }
    }

    /// Property: ACKing any subset leaves the remainder in ascending order,
    /// and later puts continue past the highest sequence ever assigned.
    #[test]
    fn prop_acks_preserve_order_and_monotonicity(
        total in 1usize..30,
        ack_mask in prop::collection::vec(any::<bool>(), 30)
    ) {
        let store = MemoryStore::new();

        let mut ids = Vec::new();
        for _ in 0..total {
            ids.push(store.put(draft_for("alice", EventType::Message, None), 1_000)?.event_id);
        }

        for (event_id, ack) in ids.iter().zip(&ack_mask) {
            if *ack {
                let ack = Ack { event_id: *event_id, recipient_id: "alice".to_string() };
                AckProcessor::process(&store, &ack)?;
                // Duplicate ACK is always a silent no-op.
                AckProcessor::process(&store, &ack)?;
            }
        }

        let pending = store.list_pending("alice", 1_000)?;
        for pair in pending.windows(2) {
            prop_assert!(pair[0].sequence < pair[1].sequence);
        }

        let next = store.put(draft_for("alice", EventType::Message, None), 1_000)?;
        prop_assert_eq!(next.sequence, total as u64 + 1);
    }

    /// Property: after a sweep no surviving event is older than the cutoff,
    /// and the count reported matches what disappeared.
    #[test]
    fn prop_expiry_removes_exactly_the_stale(
        timestamps in prop::collection::vec(1u64..10_000, 1..40),
        cutoff in 1u64..10_000
    ) {
        let store = MemoryStore::new();

        for ts in &timestamps {
            let mut draft = draft_for("alice", EventType::Message, None);
            draft.timestamp = *ts;
            store.put(draft, *ts)?;
        }

        let stale = timestamps.iter().filter(|ts| **ts < cutoff).count() as u64;
        prop_assert_eq!(store.expire_older_than(cutoff)?, stale);

        for event in store.list_pending("alice", 1_000)? {
            prop_assert!(event.timestamp >= cutoff);
        }
    }

    /// Property: with a gate engaged, no deliverable event is ever a group
    /// MESSAGE addressed to a pending member, and lifting the gate restores
    /// the full ascending queue.
    #[test]
    fn prop_gating_withholds_exactly_pending_group_messages(
        plan in prop::collection::vec((0u8..3, any::<bool>(), any::<bool>()), 1..40),
        pending_members in prop::collection::vec(0u8..3, 0..3)
    ) {
        let store = MemoryStore::new();
        let mut qm = QueueManager::new(store);

        // plan entry: (recipient, in_group, is_message)
        for (r, in_group, is_message) in &plan {
            let name = format!("user-{r}");
            let ty = if *is_message { EventType::Message } else { EventType::AiSummary };
            let group = if *in_group { Some("g1") } else { None };
            qm.enqueue(draft_for(&name, ty, group), 1_000)?;
        }

        let pending: HashSet<String> =
            pending_members.iter().map(|r| format!("user-{r}")).collect();
        qm.apply_gate_update(GateUpdate::Engaged {
            group_id: "g1".to_string(),
            key_version: 2,
            pending: pending.clone(),
        });

        for r in 0u8..3 {
            let name = format!("user-{r}");
            for event in qm.deliverable(&name, 1_000)? {
                let withheld = event.event_type == EventType::Message
                    && event.group_id() == Some("g1")
                    && pending.contains(&name);
                prop_assert!(!withheld);
            }
        }

        qm.apply_gate_update(GateUpdate::Lifted { group_id: "g1".to_string() });

        for r in 0u8..3 {
            let name = format!("user-{r}");
            let expected =
                plan.iter().filter(|(pr, _, _)| format!("user-{pr}") == name).count();
            let events = qm.deliverable(&name, 1_000)?;
            prop_assert_eq!(events.len(), expected);
            for pair in events.windows(2) {
                prop_assert!(pair[0].sequence < pair[1].sequence);
            }
        }
    }
}
