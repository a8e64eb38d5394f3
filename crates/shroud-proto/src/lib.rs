//! Wire contract for the Shroud event relay.
//!
//! Defines the event envelope, acknowledgement shape, and the client/server
//! message sets exchanged over the delivery transport, plus the framed CBOR
//! codec used on the wire.
//!
//! The relay is zero-knowledge: `encrypted_payload` is opaque ciphertext and
//! `metadata` carries only plaintext routing fields. The server never
//! inspects payload content, and producers must never place confidential
//! data in `metadata` (documented contract, not re-validated here beyond
//! size bounds).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod event;
mod wire;

pub use event::{
    Ack, Event, EventDraft, EventType, MAX_METADATA_BYTES, MAX_METADATA_ENTRIES, MAX_PAYLOAD_SIZE,
    MAX_USER_ID_BYTES, Metadata, MetadataValue, ValidationError, keys,
};
pub use wire::{
    ClientMessage, ErrorCode, MAX_WIRE_MESSAGE_SIZE, ProtocolError, ServerMessage, decode_message,
    encode_message, frame_body_len,
};

/// ALPN protocol identifier for QUIC transport negotiation.
pub const ALPN_PROTOCOL: &[u8] = b"shroud";

/// User identifier. Opaque, issued by the external identity collaborator.
pub type UserId = String;

/// Group identifier. Opaque, assigned by the group-management surface.
pub type GroupId = String;
