//! Group key rotation coordination.
//!
//! Per-group state machine: STABLE, then ROTATING while re-wrapped keys are
//! distributed, then STABLE again at commit. The relay never sees key
//! material in the clear; it distributes opaque wrapped keys produced
//! upstream and tracks which members have confirmed them.
//!
//! The coordinator is pure state: it returns [`RotationAction`] values and
//! never touches the store or the queue manager directly. The caller enqueues
//! key updates, applies gate updates, and persists committed group state in
//! response. Chosen consistency over availability: while a rotation is in
//! flight, group messages are withheld from members that have not yet
//! confirmed the new key, so no member ever receives a message they cannot
//! decrypt.

use std::collections::{BTreeMap, HashMap, HashSet};

use shroud_proto::{GroupId, UserId};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    queue::GateUpdate,
    store::{EventStore, StoreError, StoredGroup},
};

/// Rotation tuning parameters.
#[derive(Debug, Clone)]
pub struct RotationConfig {
    /// How long members get to ACK their key update before the rotation
    /// commits without them.
    pub ack_timeout_millis: u64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self { ack_timeout_millis: 30_000 }
    }
}

/// Errors from the rotation coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RotationError {
    /// A membership change arrived without a wrapped key for some member.
    /// The rotation is not started; no partial key distribution happens.
    #[error("no wrapped key for member {member} of group {group_id}")]
    MissingWrappedKey {
        /// Group being rotated.
        group_id: GroupId,
        /// Member the wrapped key set is missing.
        member: UserId,
    },

    /// Store failure during recovery.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Side effect requested by the coordinator, executed by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationAction {
    /// Enqueue a GROUP_KEY_UPDATE event carrying this member's wrapped key.
    EnqueueKeyUpdate {
        /// Member receiving the re-wrapped key.
        recipient: UserId,
        /// Group being rotated.
        group_id: GroupId,
        /// Key version being distributed.
        key_version: u64,
        /// Opaque wrapped key, produced upstream.
        wrapped_key: Vec<u8>,
    },
    /// Apply this change to the queue manager's gate table.
    Gate(GateUpdate),
    /// Persist this committed group state.
    PersistGroup(StoredGroup),
    /// A rotation committed with no confirmed members; escalate out of band.
    NotifyDegraded {
        /// Group left without any member holding the committed key.
        group_id: GroupId,
        /// Key version that nobody confirmed.
        key_version: u64,
    },
}

/// Observable rotation state of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationState {
    /// No rotation in flight.
    Stable,
    /// Key updates outstanding; group messages gated for pending members.
    Rotating,
}

/// An in-flight rotation. In-memory only; a restart abandons it and the next
/// membership change starts fresh from the persisted committed state.
#[derive(Debug, Clone)]
struct RotationRecord {
    key_version: u64,
    /// Membership snapshot taken when the rotation started.
    members: Vec<UserId>,
    /// Members whose key update is still un-ACKed.
    pending: HashSet<UserId>,
    deadline_millis: u64,
}

/// Coordinates key rotations across all groups.
#[derive(Debug, Clone)]
pub struct RotationCoordinator {
    config: RotationConfig,
    /// Last committed state per group, mirroring what the store persists.
    committed: HashMap<GroupId, StoredGroup>,
    rotating: HashMap<GroupId, RotationRecord>,
}

impl RotationCoordinator {
    /// Create a coordinator with no known groups.
    pub fn new(config: RotationConfig) -> Self {
        Self { config, committed: HashMap::new(), rotating: HashMap::new() }
    }

    /// Rebuild the committed view from the store at startup. Rotations that
    /// were in flight at shutdown are not resumed; their key-update events
    /// are still queued and will be ACKed or expire.
    pub fn recover<S: EventStore>(config: RotationConfig, store: &S) -> Result<Self, StoreError> {
        let mut committed = HashMap::new();
        for group_id in store.list_groups()? {
            if let Some(group) = store.load_group(&group_id)? {
                committed.insert(group_id, group);
            }
        }
        info!(groups = committed.len(), "rotation coordinator recovered");
        Ok(Self { config, committed, rotating: HashMap::new() })
    }

    /// Current state of a group.
    pub fn state(&self, group_id: &str) -> RotationState {
        if self.rotating.contains_key(group_id) {
            RotationState::Rotating
        } else {
            RotationState::Stable
        }
    }

    /// Committed key version, if the group is known.
    pub fn committed_key_version(&self, group_id: &str) -> Option<u64> {
        self.committed.get(group_id).map(|g| g.key_version)
    }

    /// Committed membership, if the group is known.
    pub fn committed_members(&self, group_id: &str) -> Option<&[UserId]> {
        self.committed.get(group_id).map(|g| g.members.as_slice())
    }

    /// Start (or supersede) a rotation for a membership change.
    ///
    /// Snapshots the new membership, bumps the key version past both the
    /// committed and any in-flight version, and asks the caller to enqueue
    /// one key update per member and engage the gate. A change arriving while
    /// a rotation is already in flight replaces it wholesale; the superseded
    /// rotation's queued key updates are left to be ACKed or expire.
    ///
    /// An empty membership commits immediately as a degraded group.
    pub fn membership_changed(
        &mut self,
        group_id: &str,
        members: Vec<UserId>,
        wrapped_keys: BTreeMap<UserId, Vec<u8>>,
        now_millis: u64,
    ) -> Result<Vec<RotationAction>, RotationError> {
        let committed_version = self.committed_key_version(group_id).unwrap_or(0);
        let in_flight_version =
            self.rotating.get(group_id).map(|r| r.key_version).unwrap_or(0);
        let key_version = committed_version.max(in_flight_version) + 1;

        if members.is_empty() {
            return Ok(self.commit(group_id, key_version, Vec::new()));
        }

        if self.rotating.contains_key(group_id) {
            debug!(group = %group_id, key_version, "rotation superseded by new membership change");
        }

        let pending: HashSet<UserId> = members.iter().cloned().collect();

        // Every member needs a key; a partial set aborts before anything is
        // enqueued.
        let mut actions = Vec::with_capacity(members.len() + 1);
        for member in &members {
            let Some(wrapped_key) = wrapped_keys.get(member) else {
                return Err(RotationError::MissingWrappedKey {
                    group_id: group_id.to_string(),
                    member: member.clone(),
                });
            };
            actions.push(RotationAction::EnqueueKeyUpdate {
                recipient: member.clone(),
                group_id: group_id.to_string(),
                key_version,
                wrapped_key: wrapped_key.clone(),
            });
        }
        actions.push(RotationAction::Gate(GateUpdate::Engaged {
            group_id: group_id.to_string(),
            key_version,
            pending: pending.clone(),
        }));

        self.rotating.insert(group_id.to_string(), RotationRecord {
            key_version,
            members,
            pending,
            deadline_millis: now_millis + self.config.ack_timeout_millis,
        });

        info!(group = %group_id, key_version, "rotation started");

        Ok(actions)
    }

    /// A member ACKed a key update for the given version.
    ///
    /// ACKs for superseded versions (or groups with no rotation in flight)
    /// are ignored; the event they confirm is already deleted and the live
    /// rotation's pending set is unaffected. When the last pending member
    /// ACKs, the rotation commits.
    pub fn member_acked(
        &mut self,
        group_id: &str,
        member: &str,
        key_version: u64,
    ) -> Vec<RotationAction> {
        let Some(record) = self.rotating.get_mut(group_id) else {
            return Vec::new();
        };
        if record.key_version != key_version {
            debug!(group = %group_id, key_version, live = record.key_version, "stale key update ack ignored");
            return Vec::new();
        }
        if !record.pending.remove(member) {
            return Vec::new();
        }

        let mut actions = vec![RotationAction::Gate(GateUpdate::MemberCleared {
            group_id: group_id.to_string(),
            member: member.to_string(),
        })];

        if record.pending.is_empty() {
            let members = record.members.clone();
            let version = record.key_version;
            actions.extend(self.commit(group_id, version, members));
        }

        actions
    }

    /// Advance time: commit every rotation whose ACK deadline has passed,
    /// excluding members that never confirmed. Excluded members lose group
    /// membership (they cannot decrypt anything encrypted under the new key)
    /// and re-join through a later membership change.
    pub fn tick(&mut self, now_millis: u64) -> Vec<RotationAction> {
        let due: Vec<GroupId> = self
            .rotating
            .iter()
            .filter(|(_, r)| now_millis >= r.deadline_millis)
            .map(|(g, _)| g.clone())
            .collect();

        let mut actions = Vec::new();
        for group_id in due {
            // Presence checked above; remove to take ownership.
            let Some(record) = self.rotating.remove(&group_id) else {
                continue;
            };

            let confirmed: Vec<UserId> = record
                .members
                .iter()
                .filter(|m| !record.pending.contains(*m))
                .cloned()
                .collect();

            warn!(
                group = %group_id,
                key_version = record.key_version,
                excluded = record.pending.len(),
                "rotation deadline reached, committing without unresponsive members"
            );

            actions.extend(self.commit(&group_id, record.key_version, confirmed));
        }

        actions
    }

    /// Earliest in-flight deadline, for timer scheduling.
    pub fn next_deadline(&self) -> Option<u64> {
        self.rotating.values().map(|r| r.deadline_millis).min()
    }

    /// Commit a rotation: record and persist the new committed state, lift
    /// the gate, and flag a degraded group when nobody holds the new key.
    fn commit(
        &mut self,
        group_id: &str,
        key_version: u64,
        members: Vec<UserId>,
    ) -> Vec<RotationAction> {
        self.rotating.remove(group_id);

        let degraded = members.is_empty();
        let group = StoredGroup { group_id: group_id.to_string(), members, key_version };
        self.committed.insert(group_id.to_string(), group.clone());

        info!(group = %group_id, key_version, members = group.members.len(), "rotation committed");

        let mut actions = vec![
            RotationAction::PersistGroup(group),
            RotationAction::Gate(GateUpdate::Lifted { group_id: group_id.to_string() }),
        ];
        if degraded {
            actions.push(RotationAction::NotifyDegraded {
                group_id: group_id.to_string(),
                key_version,
            });
        }
        actions
    }
}
