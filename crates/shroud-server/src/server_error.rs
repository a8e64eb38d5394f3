//! Driver error types.
//!
//! Strongly-typed errors for driver operations: session management, event
//! submission, and rotation administration. Client-visible failures
//! (validation, unknown recipient, sender mismatch) are NOT errors here; the
//! driver answers those with a wire `Error` message and keeps the session
//! alive. This type covers faults of the server itself.

use std::fmt;

use shroud_core::{RotationError, StoreError};

/// Errors that can occur during driver processing.
#[derive(Debug)]
pub enum DriverError {
    /// Session not found in the registry.
    ///
    /// An event referenced a session that was never accepted or is already
    /// closed. Usually a benign race with disconnect.
    SessionNotFound(u64),

    /// Store operation failed.
    ///
    /// Wraps failures from the event store (persistence, lookup, expiry).
    /// See `StoreError` for cause and retryability.
    Store(StoreError),

    /// Rotation administration failed.
    ///
    /// A membership change could not start a rotation, e.g. a wrapped key
    /// was missing for a member. The group's previous state is untouched.
    Rotation(RotationError),

    /// Wire message encoding failed.
    ///
    /// A response could not be serialized. Indicates a bug; fatal for the
    /// message, not the server.
    Protocol(String),
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionNotFound(id) => write!(f, "session not found: {id}"),
            Self::Store(err) => write!(f, "store error: {err}"),
            Self::Rotation(err) => write!(f, "rotation error: {err}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
        }
    }
}

impl std::error::Error for DriverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            Self::Rotation(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for DriverError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<RotationError> for DriverError {
    fn from(err: RotationError) -> Self {
        Self::Rotation(err)
    }
}

impl From<shroud_proto::ProtocolError> for DriverError {
    fn from(err: shroud_proto::ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_error_display() {
        let err = DriverError::SessionNotFound(42);
        assert_eq!(err.to_string(), "session not found: 42");

        let err = DriverError::Protocol("bad frame".to_string());
        assert_eq!(err.to_string(), "protocol error: bad frame");
    }
}
