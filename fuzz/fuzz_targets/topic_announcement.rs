//! Fuzz target for topic announcement decoding

#![no_main]

use libfuzzer_sys::fuzz_target;
use tether_core::metadata::TopicAnnouncement;

fuzz_target!(|data: &[u8]| {
    // Remote metadata is untrusted: Ok or Err, never a panic
    let _ = TopicAnnouncement::decode(data, 64);
});
