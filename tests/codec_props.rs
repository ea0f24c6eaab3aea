//! Property-based tests for the frame, mask, and close payload codecs.

use bytes::BytesMut;
use proptest::prelude::*;
use wscore::protocol::{
    apply_mask, encode_close_payload, parse_close_payload, FrameHeader, OpCode,
};
use wscore::{CloseCode, CloseFrame};

fn opcode_strategy() -> impl Strategy<Value = OpCode> {
    prop_oneof![
        Just(OpCode::Continuation),
        Just(OpCode::Text),
        Just(OpCode::Binary),
        Just(OpCode::Close),
        Just(OpCode::Ping),
        Just(OpCode::Pong),
    ]
}

fn header_strategy() -> impl Strategy<Value = FrameHeader> {
    (
        any::<bool>(),
        opcode_strategy(),
        any::<bool>(),
        any::<[u8; 4]>(),
        prop_oneof![0u64..=125, 126u64..=65535, 65536u64..=(1 << 40)],
    )
        .prop_map(|(fin, opcode, masked, mask_key, payload_len)| {
            let mut header = FrameHeader::new(fin, opcode);
            header.masked = masked;
            // The key only exists on the wire when the mask bit is set.
            header.mask_key = if masked { mask_key } else { [0; 4] };
            header.payload_len = payload_len;
            header
        })
}

fn wire_close_code_strategy() -> impl Strategy<Value = CloseCode> {
    prop_oneof![
        (1000u16..=1003).prop_map(CloseCode::from_u16),
        (1007u16..=1014).prop_map(CloseCode::from_u16),
        (3000u16..=4999).prop_map(CloseCode::from_u16),
    ]
}

proptest! {
    #[test]
    fn prop_header_roundtrip(header in header_strategy()) {
        let mut buf = BytesMut::new();
        header.marshal(&mut buf);
        prop_assert_eq!(buf.len(), header.wire_size());

        let mut bytes: &[u8] = &buf;
        let parsed = futures::executor::block_on(FrameHeader::read(&mut bytes));
        prop_assert_eq!(parsed.unwrap(), header);
        prop_assert!(bytes.is_empty(), "trailing header bytes left unread");
    }

    #[test]
    fn prop_mask_involutive(
        key in any::<[u8; 4]>(),
        pos in 0usize..4,
        data in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        let mut masked = data.clone();
        apply_mask(key, pos, &mut masked);
        apply_mask(key, pos, &mut masked);
        prop_assert_eq!(masked, data);
    }

    #[test]
    fn prop_mask_chunked_matches_whole(
        key in any::<[u8; 4]>(),
        data in prop::collection::vec(any::<u8>(), 1..512),
        splits in prop::collection::vec(1usize..64, 0..8),
    ) {
        let mut whole = data.clone();
        apply_mask(key, 0, &mut whole);

        let mut chunked = data.clone();
        let mut pos = 0;
        let mut offset = 0;
        for split in splits {
            if offset >= chunked.len() {
                break;
            }
            let end = (offset + split).min(chunked.len());
            pos = apply_mask(key, pos, &mut chunked[offset..end]);
            offset = end;
        }
        pos = apply_mask(key, pos, &mut chunked[offset..]);

        prop_assert_eq!(&chunked, &whole);
        prop_assert_eq!(pos, data.len() % 4);
    }

    #[test]
    fn prop_close_payload_roundtrip(
        code in wire_close_code_strategy(),
        reason in "[ -~]{0,123}",
    ) {
        let original = CloseFrame::new(code, reason);
        let payload = encode_close_payload(&original).unwrap();
        prop_assert!(payload.len() <= 125);
        prop_assert_eq!(parse_close_payload(&payload).unwrap(), original);
    }

    #[test]
    fn prop_forbidden_close_codes_rejected(code in prop_oneof![
        Just(1004u16), Just(1005), Just(1006), Just(1015),
        0u16..1000, 1016u16..3000,
    ]) {
        let frame = CloseFrame::new(CloseCode::from_u16(code), "");
        prop_assert!(encode_close_payload(&frame).is_err());
    }
}
