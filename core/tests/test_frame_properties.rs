//! Property tests for the frame builder and the image codecs.

use epdlink_core::image::{encode, Bitmap, PanelType, Rgb};
use epdlink_core::protocol::crc::crc16_ccitt;
use epdlink_core::protocol::frame::{BLOCK_LEN, HEADER_LEN};
use epdlink_core::Frame;
use proptest::prelude::*;

fn arb_rgb() -> impl Strategy<Value = Rgb> {
    (any::<u8>(), any::<u8>(), any::<u8>()).prop_map(|(r, g, b)| Rgb::new(r, g, b))
}

proptest! {
    /// Frames are block aligned, and the header announces payload + 32
    #[test]
    fn frame_is_block_aligned(
        payload in proptest::collection::vec(any::<u8>(), 1..2_000),
        page in 1u16..=256,
        refresh in any::<bool>(),
    ) {
        let frame = Frame::image(&payload, page, refresh).expect("frame");
        let bytes = frame.as_bytes();

        prop_assert_eq!((bytes.len() - HEADER_LEN) % BLOCK_LEN, 0);
        prop_assert_eq!(frame.total_blocks(), payload.len().div_ceil(BLOCK_LEN));
        let announced = u32::from_le_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]) as usize;
        prop_assert_eq!(announced, payload.len() + HEADER_LEN);
        prop_assert_eq!(&bytes[HEADER_LEN..HEADER_LEN + payload.len()], payload.as_slice());
        prop_assert_eq!(bytes[14] as u16, page - 1);
    }

    /// The stored CRC covers everything between the CRC field and the padding
    #[test]
    fn frame_crc_matches_contents(payload in proptest::collection::vec(any::<u8>(), 1..1_000)) {
        let frame = Frame::firmware(&payload).expect("frame");
        let bytes = frame.as_bytes();
        let stored = u16::from_le_bytes([bytes[0], bytes[1]]);
        prop_assert_eq!(stored, frame.crc());
        prop_assert_eq!(stored, crc16_ccitt(&bytes[2..HEADER_LEN + payload.len()]));
    }

    /// Padding is one length byte followed by zeros
    #[test]
    fn frame_padding_layout(payload in proptest::collection::vec(any::<u8>(), 1..1_000)) {
        let frame = Frame::firmware(&payload).expect("frame");
        let bytes = frame.as_bytes();
        let remainder = payload.len() % BLOCK_LEN;
        if remainder == 0 {
            prop_assert_eq!(bytes.len(), HEADER_LEN + payload.len());
        } else {
            let pad = &bytes[HEADER_LEN + payload.len()..];
            prop_assert_eq!(pad.len(), BLOCK_LEN - remainder);
            prop_assert_eq!(pad[0] as usize, BLOCK_LEN - remainder);
            prop_assert!(pad[1..].iter().all(|b| *b == 0));
        }
    }

    /// Block packets concatenate back to the frame body
    #[test]
    fn block_packets_cover_the_body(payload in proptest::collection::vec(any::<u8>(), 1..1_500)) {
        let frame = Frame::image(&payload, 1, true).expect("frame");
        let mut body = Vec::new();
        for i in 0..frame.total_blocks() {
            let packet = frame.block_packet(i).expect("packet");
            prop_assert_eq!(u16::from_le_bytes([packet[0], packet[1]]) as usize, i);
            body.extend_from_slice(&packet[2..]);
        }
        prop_assert_eq!(body.as_slice(), &frame.as_bytes()[HEADER_LEN..]);
        prop_assert!(frame.block_packet(frame.total_blocks()).is_none());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Every codec output has the panel's encoded length, whatever the colors
    #[test]
    fn codec_length_is_fixed(color in arb_rgb(), panel_index in 0usize..3) {
        let panel = PanelType::ALL[panel_index];
        let bitmap = Bitmap::filled(panel.width(), panel.height(), color);
        let encoded = encode(panel, &bitmap).expect("encode");
        prop_assert_eq!(encoded.len(), panel.encoded_len());
    }
}

#[test]
fn test_crc_reference_vector() {
    assert_eq!(crc16_ccitt(b"123456789"), 0x31C3);
}
