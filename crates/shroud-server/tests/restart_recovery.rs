//! Restart behavior with durable storage.
//!
//! Queued events and committed group state live in redb and must survive a
//! driver rebuild. In-flight rotations do not: a restart abandons them and
//! the next membership change starts fresh at a higher key version.

use std::collections::BTreeMap;

use shroud_core::{EventStore, RedbStore, VirtualEnv};
use shroud_proto::{
    ClientMessage, Event, EventType, Metadata, MetadataValue, ServerMessage, keys,
};
use shroud_server::{DriverConfig, ServerAction, ServerDriver, ServerEvent, StaticDirectory};
use uuid::Uuid;

type Driver = ServerDriver<VirtualEnv, RedbStore, StaticDirectory>;

fn build(env: &VirtualEnv, store: RedbStore) -> Driver {
    let directory = StaticDirectory::new(["alice", "bob"]);
    ServerDriver::recover(env.clone(), store, directory, DriverConfig::default())
        .expect("recover driver")
}

fn connect(driver: &mut Driver, session_id: u64, user: &str) -> Vec<ServerAction> {
    driver.process_event(ServerEvent::ConnectionAccepted { session_id }).unwrap();
    driver
        .process_event(ServerEvent::MessageReceived {
            session_id,
            message: ClientMessage::Connect { user_id: user.to_string() },
        })
        .unwrap()
}

fn events_for(actions: &[ServerAction], session_id: u64) -> Vec<Event> {
    actions
        .iter()
        .filter_map(|a| match a {
            ServerAction::SendToSession { session_id: s, message: ServerMessage::Event(e) }
                if *s == session_id =>
            {
                Some(e.clone())
            },
            _ => None,
        })
        .collect()
}

#[test]
fn queued_events_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.redb");
    let env = VirtualEnv::new(1_000_000, 3);

    {
        let mut driver = build(&env, RedbStore::open(&path).unwrap());
        connect(&mut driver, 1, "alice");

        let draft = shroud_proto::EventDraft {
            event_id: Uuid::new_v4(),
            recipient_id: "bob".to_string(),
            sender_id: Some("alice".to_string()),
            event_type: EventType::Message,
            timestamp: 0,
            metadata: Metadata::new(),
            encrypted_payload: vec![1, 2, 3],
        };
        driver
            .process_event(ServerEvent::MessageReceived {
                session_id: 1,
                message: ClientMessage::Submit(draft),
            })
            .unwrap();
    }

    // New driver over the same database: bob's connect replays the event.
    let mut driver = build(&env, RedbStore::open(&path).unwrap());
    let actions = connect(&mut driver, 2, "bob");
    let replayed = events_for(&actions, 2);
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].sequence, 1);
}

#[test]
fn restart_abandons_inflight_rotation_and_next_bumps_version() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.redb");
    let env = VirtualEnv::new(1_000_000, 3);

    {
        let mut driver = build(&env, RedbStore::open(&path).unwrap());
        let wrapped: BTreeMap<String, Vec<u8>> =
            [("alice".to_string(), b"k1".to_vec()), ("bob".to_string(), b"k1".to_vec())].into();
        driver
            .process_event(ServerEvent::MembershipChanged {
                group_id: "g1".to_string(),
                members: vec!["alice".to_string(), "bob".to_string()],
                wrapped_keys: wrapped,
            })
            .unwrap();
        // Nothing committed before the restart.
        assert!(driver.store().load_group("g1").unwrap().is_none());
    }

    let mut driver = build(&env, RedbStore::open(&path).unwrap());

    // The abandoned rotation no longer gates delivery.
    connect(&mut driver, 1, "alice");
    let mut metadata = Metadata::new();
    metadata.insert(keys::GROUP_ID.to_string(), MetadataValue::Str("g1".to_string()));
    let draft = shroud_proto::EventDraft {
        event_id: Uuid::new_v4(),
        recipient_id: "alice".to_string(),
        sender_id: Some("alice".to_string()),
        event_type: EventType::Message,
        timestamp: 0,
        metadata,
        encrypted_payload: vec![9],
    };
    let actions = driver
        .process_event(ServerEvent::MessageReceived {
            session_id: 1,
            message: ClientMessage::Submit(draft),
        })
        .unwrap();
    assert_eq!(events_for(&actions, 1).len(), 1);

    // A fresh membership change starts over from the committed view (none),
    // so versioning restarts at 1. The orphaned pre-restart key updates stay
    // queued for ACK or expiry.
    let wrapped: BTreeMap<String, Vec<u8>> = [("alice".to_string(), b"k2".to_vec())].into();
    let actions = driver
        .process_event(ServerEvent::MembershipChanged {
            group_id: "g1".to_string(),
            members: vec!["alice".to_string()],
            wrapped_keys: wrapped,
        })
        .unwrap();
    let update = events_for(&actions, 1)
        .into_iter()
        .find(|e| e.event_type == EventType::GroupKeyUpdate)
        .expect("key update pushed");
    assert_eq!(update.key_version(), Some(1));
}
