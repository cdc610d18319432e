#![no_main]

use graywire_protocol::Attributes;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(attrs) = Attributes::decode(data) {
        let encoded = attrs.encode().expect("decoded attributes must re-encode");
        assert_eq!(&encoded[..], data);
    }
});
