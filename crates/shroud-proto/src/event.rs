//! Event envelope and acknowledgement types.
//!
//! The envelope is the normative boundary contract: every unit of relayed
//! information (message, key update, session control, summary) travels as an
//! `Event` with a per-recipient `sequence` assigned by the store at enqueue
//! time. Clients confirm processing with an `Ack`, after which the server
//! deletes the event.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::UserId;

/// Maximum number of entries allowed in event metadata.
pub const MAX_METADATA_ENTRIES: usize = 32;

/// Maximum accounted size of event metadata in bytes.
///
/// Bounds the plaintext surface of an event so ciphertext cannot be smuggled
/// through routing fields. Accounting is deterministic: key length plus value
/// length (8 bytes per integer, 1 per boolean).
pub const MAX_METADATA_BYTES: usize = 1024;

/// Maximum encrypted payload size in bytes (256 KiB).
pub const MAX_PAYLOAD_SIZE: usize = 256 * 1024;

/// Maximum user id length in bytes, for both `recipient_id` and `sender_id`.
///
/// User ids are opaque strings issued by the identity collaborator; real ids
/// are far shorter than this. The bound keeps them safe to embed in
/// length-prefixed storage keys.
pub const MAX_USER_ID_BYTES: usize = 255;

/// Well-known metadata keys, per event type.
///
/// Enumerated by the protocol document; unknown keys are passed through
/// untouched so newer producers keep working against older relays.
pub mod keys {
    /// Chat the message belongs to (MESSAGE).
    pub const CHAT_ID: &str = "chat_id";
    /// Group the event belongs to (MESSAGE, GROUP_KEY_UPDATE, AI_SUMMARY).
    pub const GROUP_ID: &str = "group_id";
    /// Message mode: `NORMAL` or `TEMPORARY` (MESSAGE).
    pub const MESSAGE_MODE: &str = "message_mode";
    /// Key version being distributed (GROUP_KEY_UPDATE).
    pub const KEY_VERSION: &str = "key_version";
    /// Temporary session identifier (TEMP_SESSION_START/END).
    pub const SESSION_ID: &str = "session_id";
    /// Peer in a temporary session (TEMP_SESSION_START/END).
    pub const PEER_ID: &str = "peer_id";
    /// User who requested the summary (AI_SUMMARY).
    pub const TRIGGERED_BY: &str = "triggered_by";
    /// Model that produced the summary (AI_SUMMARY).
    pub const MODEL: &str = "model";
    /// What the summary covers (AI_SUMMARY).
    pub const SCOPE: &str = "scope";
}

/// Event type discriminator.
///
/// Encoded as the protocol's wire string (`"MESSAGE"`, `"GROUP_KEY_UPDATE"`,
/// ...). Types this relay does not know about decode as [`EventType::Other`]
/// and are queued and delivered like any other event, so old servers tolerate
/// new clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    /// Encrypted chat message.
    Message,
    /// Group key re-encrypted for one member during rotation.
    GroupKeyUpdate,
    /// Temporary session opened.
    TempSessionStart,
    /// Temporary session closed.
    TempSessionEnd,
    /// AI-generated summary (already encrypted by the external collaborator).
    AiSummary,
    /// Forward-compatible passthrough for unrecognized types.
    Other(String),
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "MESSAGE" => Self::Message,
            "GROUP_KEY_UPDATE" => Self::GroupKeyUpdate,
            "TEMP_SESSION_START" => Self::TempSessionStart,
            "TEMP_SESSION_END" => Self::TempSessionEnd,
            "AI_SUMMARY" => Self::AiSummary,
            _ => Self::Other(s),
        }
    }
}

impl From<EventType> for String {
    fn from(t: EventType) -> Self {
        match t {
            EventType::Message => "MESSAGE".to_string(),
            EventType::GroupKeyUpdate => "GROUP_KEY_UPDATE".to_string(),
            EventType::TempSessionStart => "TEMP_SESSION_START".to_string(),
            EventType::TempSessionEnd => "TEMP_SESSION_END".to_string(),
            EventType::AiSummary => "AI_SUMMARY".to_string(),
            EventType::Other(s) => s,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from(self.clone()))
    }
}

/// A scalar metadata value.
///
/// Metadata carries plaintext routing fields only; nested structures are
/// deliberately unrepresentable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// UTF-8 string.
    Str(String),
}

impl MetadataValue {
    /// String content, if this value is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Integer content, if this value is an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Accounted wire size for the metadata bound check.
    fn accounted_size(&self) -> usize {
        match self {
            Self::Bool(_) => 1,
            Self::Int(_) => 8,
            Self::Str(s) => s.len(),
        }
    }
}

/// Ordered metadata mapping (string key to scalar value).
pub type Metadata = BTreeMap<String, MetadataValue>;

/// Validation failures for submitted events.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Recipient field is empty.
    #[error("recipient_id must not be empty")]
    MissingRecipient,

    /// A user id field exceeds the length bound.
    #[error("user id is {bytes} bytes, maximum is {max}")]
    UserIdTooLong {
        /// Length of the submitted id.
        bytes: usize,
        /// Allowed maximum.
        max: usize,
    },

    /// Metadata has more entries than allowed.
    #[error("metadata has {count} entries, maximum is {max}")]
    TooManyMetadataEntries {
        /// Number of entries submitted.
        count: usize,
        /// Allowed maximum.
        max: usize,
    },

    /// Metadata exceeds the accounted size bound.
    #[error("metadata is {bytes} bytes, maximum is {max}")]
    MetadataTooLarge {
        /// Accounted size of the submitted metadata.
        bytes: usize,
        /// Allowed maximum.
        max: usize,
    },

    /// Encrypted payload exceeds the size bound.
    #[error("payload is {bytes} bytes, maximum is {max}")]
    PayloadTooLarge {
        /// Submitted payload size.
        bytes: usize,
        /// Allowed maximum.
        max: usize,
    },
}

/// Check a user id against the length bound.
fn validate_user_id(id: &str) -> Result<(), ValidationError> {
    if id.len() > MAX_USER_ID_BYTES {
        return Err(ValidationError::UserIdTooLong { bytes: id.len(), max: MAX_USER_ID_BYTES });
    }
    Ok(())
}

/// Check metadata against the entry-count and size bounds.
fn validate_metadata(metadata: &Metadata) -> Result<(), ValidationError> {
    if metadata.len() > MAX_METADATA_ENTRIES {
        return Err(ValidationError::TooManyMetadataEntries {
            count: metadata.len(),
            max: MAX_METADATA_ENTRIES,
        });
    }

    let bytes: usize = metadata.iter().map(|(k, v)| k.len() + v.accounted_size()).sum();
    if bytes > MAX_METADATA_BYTES {
        return Err(ValidationError::MetadataTooLarge { bytes, max: MAX_METADATA_BYTES });
    }

    Ok(())
}

/// An event as submitted by a producer, before the store assigns `sequence`
/// and (when absent) `timestamp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDraft {
    /// Producer-assigned unique identifier. Clients deduplicate replays by
    /// this id.
    pub event_id: Uuid,
    /// Recipient user id.
    pub recipient_id: UserId,
    /// Sending user id. Absent for server-originated events (key updates).
    pub sender_id: Option<UserId>,
    /// Event type discriminator.
    pub event_type: EventType,
    /// Unix timestamp in milliseconds. Zero means "assign at enqueue".
    pub timestamp: u64,
    /// Plaintext routing metadata. Never confidential content.
    pub metadata: Metadata,
    /// Opaque ciphertext.
    pub encrypted_payload: Vec<u8>,
}

impl EventDraft {
    /// Validate the draft against the envelope bounds.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.recipient_id.is_empty() {
            return Err(ValidationError::MissingRecipient);
        }
        validate_user_id(&self.recipient_id)?;
        if let Some(sender) = &self.sender_id {
            validate_user_id(sender)?;
        }
        validate_metadata(&self.metadata)?;
        if self.encrypted_payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ValidationError::PayloadTooLarge {
                bytes: self.encrypted_payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(())
    }
}

/// An immutable, sequenced event as stored and delivered.
///
/// # Invariants
///
/// - `sequence` is unique and strictly increasing within a recipient
///   partition; assigned once at enqueue, never reused even after deletion.
/// - `timestamp` is set (non-zero) by enqueue time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Producer-assigned unique identifier.
    pub event_id: Uuid,
    /// Recipient user id (partition key).
    pub recipient_id: UserId,
    /// Sending user id. Absent for server-originated events.
    pub sender_id: Option<UserId>,
    /// Event type discriminator.
    pub event_type: EventType,
    /// Per-recipient monotonic sequence number, starting at 1.
    pub sequence: u64,
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
    /// Plaintext routing metadata.
    pub metadata: Metadata,
    /// Opaque ciphertext.
    pub encrypted_payload: Vec<u8>,
}

impl Event {
    /// Group this event belongs to, read from the `group_id` metadata key.
    pub fn group_id(&self) -> Option<&str> {
        self.metadata.get(keys::GROUP_ID).and_then(MetadataValue::as_str)
    }

    /// Key version carried by a GROUP_KEY_UPDATE event.
    pub fn key_version(&self) -> Option<u64> {
        self.metadata.get(keys::KEY_VERSION).and_then(MetadataValue::as_int).and_then(|v| {
            if v >= 0 { Some(v as u64) } else { None }
        })
    }
}

/// Acknowledgement: explicit client confirmation that an event was safely
/// processed. Processing is idempotent; acknowledging an already-deleted or
/// unknown event is a silent no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Event being acknowledged.
    pub event_id: Uuid,
    /// Recipient confirming receipt.
    pub recipient_id: UserId,
}
