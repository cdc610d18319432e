//! Framing encode/decode property tests

use bytes::Bytes;
use graywire_protocol::types::UNKNOWN_CONTEXT;
use graywire_protocol::{Attributes, Frame, HEADER_LEN};
use proptest::prelude::*;

// ASCII keys, unique by construction (BTreeMap collapses duplicates before
// the bundle is built), values of modest size to keep runs fast.
fn attrs_strategy() -> impl Strategy<Value = Attributes> {
    prop::collection::btree_map("[ -~]{0,24}", prop::collection::vec(any::<u8>(), 0..256), 0..8)
        .prop_map(|map| {
            let mut attrs = Attributes::new();
            for (key, value) in map {
                attrs.insert(key, Bytes::from(value)).expect("ascii key");
            }
            attrs
        })
}

proptest! {
    #[test]
    fn prop_attrs_encode_decode(attrs in attrs_strategy()) {
        let blob = attrs.encode().expect("encode");
        let decoded = Attributes::decode(&blob).expect("decode");
        prop_assert_eq!(decoded, attrs);
    }

    #[test]
    fn prop_frame_encode_decode(
        attrs in attrs_strategy(),
        context in 1u64..u64::MAX,
        response in prop_oneof![Just(UNKNOWN_CONTEXT).boxed(), (1u64..1_000_000).boxed()],
        type_code in any::<u64>(),
    ) {
        let frame = Frame { context, response_context: response, type_code, attrs };
        let encoded = frame.encode().expect("encode");
        prop_assert!(encoded.len() >= HEADER_LEN);

        // Total-length invariant: 29 + Σ(8 + key + value)
        let expected: usize = HEADER_LEN
            + frame.attrs.iter().map(|(k, v)| 8 + k.len() + v.len()).sum::<usize>();
        prop_assert_eq!(encoded.len(), expected);

        let decoded = Frame::decode(&encoded).expect("decode");
        prop_assert_eq!(decoded, frame);
    }

    #[test]
    fn prop_decode_arbitrary_bytes_never_panics(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = Frame::decode(&data);
        let _ = Attributes::decode(&data);
    }
}
