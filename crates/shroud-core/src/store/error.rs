//! Store error types.

use shroud_proto::ValidationError;
use thiserror::Error;
use uuid::Uuid;

/// Errors from store operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Envelope failed validation at `put`; the event was never enqueued.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The event id is already stored for a different recipient.
    ///
    /// Resubmitting an id to the same recipient is an idempotent retry and
    /// succeeds; reusing it across recipients is a producer bug.
    #[error("event id {0} is already stored for a different recipient")]
    DuplicateEventId(Uuid),

    /// Serialization or deserialization of a stored value failed.
    ///
    /// Indicates a corrupt value or a version mismatch. Not retryable.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Underlying storage I/O failed.
    ///
    /// May be transient (disk pressure) or permanent; check the message.
    #[error("storage I/O error: {0}")]
    Io(String),
}
