//! Acknowledgement processing.
//!
//! An ACK is the client's explicit confirmation that an event was decrypted
//! and safely persisted; only then does the relay delete it. Wire-level send
//! success never counts. Processing is idempotent: duplicate ACKs and ACKs
//! for unknown or already-expired events succeed silently, so a client can
//! always retry without learning anything about server state.

use shroud_proto::{Ack, EventType, GroupId};
use tracing::trace;

use crate::store::{EventStore, StoreError};

/// What an ACK turned out to confirm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// Event deleted (or was already gone). Nothing further to do.
    Applied,
    /// The ACKed event was a GROUP_KEY_UPDATE carrying rotation metadata.
    /// The caller must forward this to the rotation coordinator so the
    /// member's gate clears.
    KeyUpdateAcked {
        /// Group whose key update was confirmed.
        group_id: GroupId,
        /// Key version the member now holds.
        key_version: u64,
    },
}

/// Stateless ACK processor over an [`EventStore`].
pub struct AckProcessor;

impl AckProcessor {
    /// Apply an acknowledgement: look the event up (to learn its type), then
    /// delete it.
    ///
    /// The lookup-then-delete is not atomic; the worst case is a concurrent
    /// expiry deleting first, which only makes the delete a no-op. A key
    /// update whose rotation metadata is malformed is deleted and reported as
    /// plain [`AckOutcome::Applied`].
    pub fn process<S: EventStore>(store: &S, ack: &Ack) -> Result<AckOutcome, StoreError> {
        let event = store.get(ack.event_id, &ack.recipient_id)?;
        store.delete(ack.event_id, &ack.recipient_id)?;

        let Some(event) = event else {
            trace!(event_id = %ack.event_id, "ack for unknown event, no-op");
            return Ok(AckOutcome::Applied);
        };

        if event.event_type == EventType::GroupKeyUpdate
            && let (Some(group_id), Some(key_version)) = (event.group_id(), event.key_version())
        {
            return Ok(AckOutcome::KeyUpdateAcked {
                group_id: group_id.to_string(),
                key_version,
            });
        }

        Ok(AckOutcome::Applied)
    }
}
