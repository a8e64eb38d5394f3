//! Fuzz target for wire message decoding
//!
//! Feeds arbitrary byte sequences through the framed CBOR codec to find:
//! - Parser crashes or panics
//! - Huge declared lengths that allocate before validation
//! - Malformed CBOR that bypasses the message size cap
//!
//! The fuzzer should NEVER panic. All invalid inputs must return an error.

#![no_main]

use libfuzzer_sys::fuzz_target;
use shroud_proto::{ClientMessage, ServerMessage, decode_message, frame_body_len};

fuzz_target!(|data: &[u8]| {
    if data.len() >= 4 {
        let _ = frame_body_len([data[0], data[1], data[2], data[3]]);
    }

    // Both message sets share the codec; neither may panic on garbage.
    let _ = decode_message::<ClientMessage>(data);
    let _ = decode_message::<ServerMessage>(data);
});
