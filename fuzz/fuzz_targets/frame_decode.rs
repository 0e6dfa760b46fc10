//! Fuzz target for multiplexer frame decoding
//!
//! Decoding arbitrary bytes must never panic, and any frame that decodes
//! must encode back to the same bytes.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tether_mux::Frame;

fuzz_target!(|data: &[u8]| {
    if let Ok(frame) = Frame::decode(data) {
        let encoded = frame.encode().expect("decoded frame re-encodes");
        assert_eq!(encoded, data);
    }
});
