#![no_main]

use libfuzzer_sys::fuzz_target;
use bst_overlay::Packet;

fuzz_target!(|data: &[u8]| {
    // Frame decoding must never panic on arbitrary input
    let _ = Packet::from_bytes(data);
});
