#![no_main]

use graywire_protocol::Frame;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Decoding arbitrary bytes must never panic; a successful decode must
    // re-encode to the identical frame bytes.
    if let Ok(frame) = Frame::decode(data) {
        let encoded = frame.encode().expect("decoded frame must re-encode");
        assert_eq!(&encoded[..], data);
    }
});
