//! End-to-end rotation flow over the Sans-IO core.
//!
//! Drives the queue manager, ACK processor, rotation coordinator, and reaper
//! together the way the server runtime does: coordinator actions are executed
//! against the store and the gate table, key-update ACKs feed back into the
//! coordinator, and delivery is checked at each step.

use std::collections::BTreeMap;

use shroud_core::{
    AckOutcome, AckProcessor, EventStore, MemoryStore, QueueManager, Reaper, RotationAction,
    RotationConfig, RotationCoordinator, RotationState,
};
use shroud_proto::{Ack, Event, EventDraft, EventType, Metadata, MetadataValue, keys};
use uuid::Uuid;

const ACK_TIMEOUT: u64 = 30_000;

struct Harness {
    qm: QueueManager<MemoryStore>,
    coordinator: RotationCoordinator,
    degraded: Vec<(String, u64)>,
}

impl Harness {
    fn new() -> Self {
        Self {
            qm: QueueManager::new(MemoryStore::new()),
            coordinator: RotationCoordinator::new(RotationConfig {
                ack_timeout_millis: ACK_TIMEOUT,
            }),
            degraded: Vec::new(),
        }
    }

    /// Execute coordinator actions the way the server runtime does.
    fn run(&mut self, actions: Vec<RotationAction>, now: u64) {
        for action in actions {
            match action {
                RotationAction::EnqueueKeyUpdate {
                    recipient,
                    group_id,
                    key_version,
                    wrapped_key,
                } => {
                    let mut metadata = Metadata::new();
                    metadata
                        .insert(keys::GROUP_ID.to_string(), MetadataValue::Str(group_id));
                    metadata.insert(
                        keys::KEY_VERSION.to_string(),
                        MetadataValue::Int(key_version as i64),
                    );
                    let draft = EventDraft {
                        event_id: Uuid::new_v4(),
                        recipient_id: recipient,
                        sender_id: None,
                        event_type: EventType::GroupKeyUpdate,
                        timestamp: 0,
                        metadata,
                        encrypted_payload: wrapped_key,
                    };
                    self.qm.enqueue(draft, now).unwrap();
                },
                RotationAction::Gate(update) => self.qm.apply_gate_update(update),
                RotationAction::PersistGroup(group) => {
                    self.qm.store().store_group(&group).unwrap();
                },
                RotationAction::NotifyDegraded { group_id, key_version } => {
                    self.degraded.push((group_id, key_version));
                },
            }
        }
    }

    fn rotate(&mut self, group: &str, members: &[&str], now: u64) {
        let member_list: Vec<String> = members.iter().map(|m| m.to_string()).collect();
        let wrapped: BTreeMap<String, Vec<u8>> = members
            .iter()
            .map(|m| (m.to_string(), format!("key-for-{m}").into_bytes()))
            .collect();
        let actions =
            self.coordinator.membership_changed(group, member_list, wrapped, now).unwrap();
        self.run(actions, now);
    }

    fn send_message(&mut self, recipient: &str, group: &str, now: u64) -> Event {
        let mut metadata = Metadata::new();
        metadata.insert(keys::GROUP_ID.to_string(), MetadataValue::Str(group.to_string()));
        let draft = EventDraft {
            event_id: Uuid::new_v4(),
            recipient_id: recipient.to_string(),
            sender_id: Some("sender".to_string()),
            event_type: EventType::Message,
            timestamp: 0,
            metadata,
            encrypted_payload: vec![0xAA; 16],
        };
        self.qm.enqueue(draft, now).unwrap()
    }

    /// ACK an event as the client would, feeding key-update confirmations
    /// back into the coordinator.
    fn ack(&mut self, recipient: &str, event_id: Uuid, now: u64) {
        let ack = Ack { event_id, recipient_id: recipient.to_string() };
        let outcome = AckProcessor::process(self.qm.store(), &ack).unwrap();
        if let AckOutcome::KeyUpdateAcked { group_id, key_version } = outcome {
            let actions = self.coordinator.member_acked(&group_id, recipient, key_version);
            self.run(actions, now);
        }
    }

    /// The pending key update for a recipient, if one is deliverable.
    fn key_update_for(&self, recipient: &str) -> Option<Event> {
        self.qm
            .deliverable(recipient, 100)
            .unwrap()
            .into_iter()
            .find(|e| e.event_type == EventType::GroupKeyUpdate)
    }
}

#[test]
fn rotation_gates_messages_until_each_member_confirms() {
    let mut h = Harness::new();
    let now = 1_000;

    h.rotate("g1", &["alice", "bob"], now);
    assert_eq!(h.coordinator.state("g1"), RotationState::Rotating);

    // A message sent mid-rotation is queued but withheld from both members.
    let msg_alice = h.send_message("alice", "g1", now);
    let msg_bob = h.send_message("bob", "g1", now);

    // The key update itself is deliverable; the message is not.
    let alice_view = h.qm.deliverable("alice", 100).unwrap();
    assert_eq!(alice_view.len(), 1);
    assert_eq!(alice_view[0].event_type, EventType::GroupKeyUpdate);
    assert_eq!(alice_view[0].encrypted_payload, b"key-for-alice");

    // Alice confirms her key; her gate clears, bob's does not.
    let alice_update = h.key_update_for("alice").unwrap();
    h.ack("alice", alice_update.event_id, now);

    let alice_view = h.qm.deliverable("alice", 100).unwrap();
    assert_eq!(alice_view.len(), 1);
    assert_eq!(alice_view[0].event_id, msg_alice.event_id);

    let bob_view = h.qm.deliverable("bob", 100).unwrap();
    assert!(bob_view.iter().all(|e| e.event_type != EventType::Message));

    // Bob confirms; the rotation commits and everything flows.
    let bob_update = h.key_update_for("bob").unwrap();
    h.ack("bob", bob_update.event_id, now);

    assert_eq!(h.coordinator.state("g1"), RotationState::Stable);
    assert_eq!(h.coordinator.committed_key_version("g1"), Some(1));
    assert!(h.degraded.is_empty());

    let bob_view = h.qm.deliverable("bob", 100).unwrap();
    assert_eq!(bob_view.len(), 1);
    assert_eq!(bob_view[0].event_id, msg_bob.event_id);

    // The committed group survived to the store.
    let stored = h.qm.store().load_group("g1").unwrap().unwrap();
    assert_eq!(stored.key_version, 1);
    assert_eq!(stored.members.len(), 2);
}

#[test]
fn deadline_commits_and_unblocks_responsive_members() {
    let mut h = Harness::new();
    let now = 1_000;

    h.rotate("g1", &["alice", "bob", "carol"], now);
    h.send_message("carol", "g1", now);

    let alice_update = h.key_update_for("alice").unwrap();
    h.ack("alice", alice_update.event_id, now);
    let bob_update = h.key_update_for("bob").unwrap();
    h.ack("bob", bob_update.event_id, now);

    // Carol never confirms; the deadline commits without her.
    let actions = h.coordinator.tick(now + ACK_TIMEOUT);
    h.run(actions, now + ACK_TIMEOUT);

    assert_eq!(h.coordinator.state("g1"), RotationState::Stable);
    let stored = h.qm.store().load_group("g1").unwrap().unwrap();
    assert_eq!(stored.members, vec!["alice".to_string(), "bob".to_string()]);

    // The gate lifted for everyone, including carol's queued message; her
    // un-ACKed key update is still pending and will expire.
    let carol_view = h.qm.deliverable("carol", 100).unwrap();
    assert!(carol_view.iter().any(|e| e.event_type == EventType::Message));
    assert!(carol_view.iter().any(|e| e.event_type == EventType::GroupKeyUpdate));
}

#[test]
fn fully_unresponsive_group_degrades() {
    let mut h = Harness::new();

    h.rotate("g1", &["alice", "bob"], 1_000);
    let actions = h.coordinator.tick(1_000 + ACK_TIMEOUT);
    h.run(actions, 1_000 + ACK_TIMEOUT);

    assert_eq!(h.degraded, vec![("g1".to_string(), 1)]);
    assert!(h.qm.store().load_group("g1").unwrap().unwrap().members.is_empty());
}

#[test]
fn superseded_rotation_leaves_old_key_updates_to_expire() {
    let mut h = Harness::new();
    const DAY: u64 = 24 * 60 * 60 * 1000;
    let now = 100 * DAY;

    h.rotate("g1", &["alice", "bob"], now);
    // Membership changes again before anyone ACKed.
    h.rotate("g1", &["alice"], now + 1_000);

    // Alice now has two key updates queued (v1 orphaned, v2 live).
    let updates: Vec<Event> = h
        .qm
        .deliverable("alice", 100)
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == EventType::GroupKeyUpdate)
        .collect();
    assert_eq!(updates.len(), 2);

    // ACKing the stale v1 update deletes it but does not commit anything.
    let stale = updates.iter().find(|e| e.key_version() == Some(1)).unwrap().clone();
    h.ack("alice", stale.event_id, now + 2_000);
    assert_eq!(h.coordinator.state("g1"), RotationState::Rotating);

    // ACKing the live v2 update commits.
    let live = h.key_update_for("alice").unwrap();
    assert_eq!(live.key_version(), Some(2));
    h.ack("alice", live.event_id, now + 3_000);
    assert_eq!(h.coordinator.committed_key_version("g1"), Some(2));

    // Bob's orphaned v1 update ages out with the rest of the queue.
    let mut reaper = Reaper::default();
    assert_eq!(reaper.sweep(h.qm.store(), now + 15 * DAY).unwrap(), 1);
    assert!(h.qm.deliverable("bob", 100).unwrap().is_empty());
}

#[test]
fn reconnect_replays_unacked_events_in_order() {
    let mut h = Harness::new();
    let now = 1_000;

    let e1 = h.send_message("alice", "g1", now);
    let e2 = h.send_message("alice", "g1", now);
    let e3 = h.send_message("alice", "g1", now);

    // First connection delivered everything but only e1 was ACKed before the
    // client dropped.
    h.ack("alice", e1.event_id, now);

    // Reconnect: replay yields exactly the un-ACKed tail, in order.
    let replay = h.qm.deliverable("alice", 100).unwrap();
    let ids: Vec<Uuid> = replay.iter().map(|e| e.event_id).collect();
    assert_eq!(ids, vec![e2.event_id, e3.event_id]);
}
