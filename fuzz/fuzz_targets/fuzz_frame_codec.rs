#![no_main]

use bst_overlay::core::codec::FrameCodec;
use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::{Decoder, Encoder};

fuzz_target!(|data: &[u8]| {
    let mut codec = FrameCodec::new(64 * 1024);

    // Feed the input in two chunks to exercise partial-frame buffering
    let split = data.first().map(|b| *b as usize % (data.len() + 1)).unwrap_or(0);
    let mut buf = BytesMut::from(&data[..split]);

    let mut decoded = Vec::new();
    loop {
        match codec.decode(&mut buf) {
            Ok(Some(packet)) => decoded.push(packet),
            Ok(None) => break,
            Err(_) => return,
        }
    }
    buf.extend_from_slice(&data[split..]);
    while let Ok(Some(packet)) = codec.decode(&mut buf) {
        decoded.push(packet);
    }

    // Anything that decoded must re-encode to a frame that decodes the same
    for packet in decoded {
        let mut out = BytesMut::new();
        if codec.encode(packet.clone(), &mut out).is_ok() {
            let again = FrameCodec::new(64 * 1024).decode(&mut out);
            assert!(matches!(again, Ok(Some(ref p)) if *p == packet));
        }
    }
});
