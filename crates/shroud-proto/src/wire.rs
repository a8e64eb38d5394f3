//! Framed CBOR codec for the delivery transport.
//!
//! Each wire message is a 4-byte big-endian length prefix followed by a CBOR
//! body. CBOR is self-describing (field names embedded), compact, and handles
//! byte strings without an extra encoding layer, so the opaque
//! `encrypted_payload` travels as-is.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{Ack, Event, EventDraft, UserId};

/// Maximum encoded wire message size in bytes.
///
/// Covers the largest legal event (payload bound + metadata bound + envelope
/// overhead) with headroom. Anything larger is a protocol violation.
pub const MAX_WIRE_MESSAGE_SIZE: usize = 512 * 1024;

/// Errors from wire encoding and decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Message body failed to encode.
    #[error("encode error: {0}")]
    Encode(String),

    /// Message body failed to decode.
    #[error("decode error: {0}")]
    Decode(String),

    /// Declared length exceeds [`MAX_WIRE_MESSAGE_SIZE`].
    #[error("message of {got} bytes exceeds maximum {max}")]
    TooLarge {
        /// Declared body length.
        got: usize,
        /// Allowed maximum.
        max: usize,
    },

    /// Frame shorter than its declared length.
    #[error("truncated frame: declared {declared} bytes, got {got}")]
    Truncated {
        /// Declared body length.
        declared: usize,
        /// Bytes actually present.
        got: usize,
    },
}

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Subscribe this connection as a recipient. The user id has already
    /// been authenticated by the transport/auth collaborator.
    Connect {
        /// Authenticated user id.
        user_id: UserId,
    },
    /// Submit an event for relay to its recipient.
    Submit(EventDraft),
    /// Acknowledge a processed event.
    Ack(Ack),
    /// Keepalive probe.
    Ping,
}

/// Error codes returned to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Envelope or metadata failed validation.
    Validation,
    /// Recipient has no known identity.
    UnknownRecipient,
    /// Submitted sender_id does not match the authenticated user.
    SenderMismatch,
    /// Operation requires a connected (subscribed) session.
    NotConnected,
    /// Internal server failure.
    Internal,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// A delivered event. Receipt on the wire is not processing; the client
    /// must still send an [`Ack`] once the event is safely handled.
    Event(Event),
    /// Synchronous result of a [`ClientMessage::Submit`].
    SubmitResult {
        /// Id of the accepted event.
        event_id: Uuid,
        /// Whether the recipient was connected and the push was attempted.
        delivered: bool,
        /// Whether the event remains queued awaiting ACK.
        queued: bool,
    },
    /// Keepalive reply.
    Pong,
    /// Request-level failure.
    Error {
        /// Machine-readable code.
        code: ErrorCode,
        /// Human-readable detail.
        message: String,
    },
}

/// Encode a message with its 4-byte big-endian length prefix.
pub fn encode_message<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut body = Vec::new();
    ciborium::into_writer(message, &mut body).map_err(|e| ProtocolError::Encode(e.to_string()))?;

    if body.len() > MAX_WIRE_MESSAGE_SIZE {
        return Err(ProtocolError::TooLarge { got: body.len(), max: MAX_WIRE_MESSAGE_SIZE });
    }

    let mut framed = Vec::with_capacity(4 + body.len());
    framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
    framed.extend_from_slice(&body);
    Ok(framed)
}

/// Decode a message body (without the length prefix).
pub fn decode_message<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, ProtocolError> {
    if body.len() > MAX_WIRE_MESSAGE_SIZE {
        return Err(ProtocolError::TooLarge { got: body.len(), max: MAX_WIRE_MESSAGE_SIZE });
    }
    ciborium::from_reader(body).map_err(|e| ProtocolError::Decode(e.to_string()))
}

/// Parse the length prefix of a frame, returning the declared body length.
///
/// Rejects declared lengths beyond [`MAX_WIRE_MESSAGE_SIZE`] before any body
/// bytes are read, so a malicious peer cannot force a large allocation.
pub fn frame_body_len(prefix: [u8; 4]) -> Result<usize, ProtocolError> {
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_WIRE_MESSAGE_SIZE {
        return Err(ProtocolError::TooLarge { got: len, max: MAX_WIRE_MESSAGE_SIZE });
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::{EventType, MetadataValue};

    fn sample_event() -> Event {
        let mut metadata = BTreeMap::new();
        metadata.insert("chat_id".to_string(), MetadataValue::Str("chat1".to_string()));

        Event {
            event_id: Uuid::new_v4(),
            recipient_id: "alice".to_string(),
            sender_id: Some("bob".to_string()),
            event_type: EventType::Message,
            sequence: 7,
            timestamp: 1_707_401_640_000,
            metadata,
            encrypted_payload: vec![0xde, 0xad, 0xbe, 0xef],
        }
    }

    #[test]
    fn server_message_round_trip() {
        let msg = ServerMessage::Event(sample_event());
        let framed = encode_message(&msg).unwrap();

        let body_len = frame_body_len(framed[..4].try_into().unwrap()).unwrap();
        assert_eq!(body_len, framed.len() - 4);

        let decoded: ServerMessage = decode_message(&framed[4..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn client_message_round_trip() {
        let msg = ClientMessage::Ack(Ack {
            event_id: Uuid::new_v4(),
            recipient_id: "alice".to_string(),
        });
        let framed = encode_message(&msg).unwrap();
        let decoded: ClientMessage = decode_message(&framed[4..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn oversized_prefix_rejected() {
        let prefix = ((MAX_WIRE_MESSAGE_SIZE + 1) as u32).to_be_bytes();
        assert!(matches!(frame_body_len(prefix), Err(ProtocolError::TooLarge { .. })));
    }

    #[test]
    fn garbage_body_rejected() {
        let result: Result<ServerMessage, _> = decode_message(&[0xff, 0x00, 0x13]);
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }
}
