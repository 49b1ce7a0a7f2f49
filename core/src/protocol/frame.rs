//! Wire frame: a checksummed, block-aligned container for an image or firmware
//!
//! Layout (all multi-byte fields little-endian):
//! [2 bytes]  CRC16 over everything that follows (before padding)
//! [1 byte]   0x00
//! [4 bytes]  total length = payload + 32
//! [1 byte]   image type (0x02 image, 0x01 firmware)
//! [1 byte]   compress type (0)
//! [4 bytes]  compressed length (0)
//! [1 byte]   EPD type (0x20 image, 0x00 firmware)
//! [1 byte]   page number, 0-based
//! [1 byte]   refresh flag
//! [16 bytes] reserved, zero
//! [N bytes]  payload
//! [pad]      one byte holding the pad length, then zeros up to the block boundary
//!
//! The first 32 bytes go to Image-Identify; the rest is sent in 240-byte blocks.

use super::crc::crc16_ccitt;
use super::FrameError;

/// Bytes written to Image-Identify before any block
pub const HEADER_LEN: usize = 32;
/// Payload bytes carried by one Image-Block write
pub const BLOCK_LEN: usize = 240;
/// Block writes are prefixed by their LE u16 index
pub const MAX_BLOCKS: usize = u16::MAX as usize + 1;

const CRC_LEN: usize = 2;
const FIELDS_LEN: usize = 14;
const RESERVED_LEN: usize = 16;

const IMAGE_TYPE_IMAGE: u8 = 0x02;
const IMAGE_TYPE_FIRMWARE: u8 = 0x01;
const EPD_TYPE_IMAGE: u8 = 0x20;

/// What a frame carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Encoded panel image for a 1-based page
    Image { page: u16, refresh: bool },
    /// Firmware upgrade package
    Firmware,
}

/// A built frame ready for transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    kind: FrameKind,
    bytes: Vec<u8>,
    payload_len: usize,
    crc: u16,
}

impl Frame {
    /// Frame an encoded image for `page` (1-based)
    pub fn image(payload: &[u8], page: u16, refresh: bool) -> Result<Self, FrameError> {
        Self::build(FrameKind::Image { page, refresh }, payload)
    }

    /// Frame a firmware package
    pub fn firmware(package: &[u8]) -> Result<Self, FrameError> {
        Self::build(FrameKind::Firmware, package)
    }

    pub fn build(kind: FrameKind, payload: &[u8]) -> Result<Self, FrameError> {
        if payload.is_empty() {
            return Err(FrameError::EmptyPayload);
        }
        let total_len = u32::try_from(payload.len() + HEADER_LEN)
            .map_err(|_| FrameError::TooLarge(payload.len()))?;
        let blocks = payload.len().div_ceil(BLOCK_LEN);
        if blocks > MAX_BLOCKS {
            return Err(FrameError::TooManyBlocks(blocks));
        }

        let (image_type, epd_type, page_num, refresh) = match kind {
            FrameKind::Image { page, refresh } => {
                if page == 0 || page > 256 {
                    return Err(FrameError::InvalidPage(page));
                }
                (IMAGE_TYPE_IMAGE, EPD_TYPE_IMAGE, (page - 1) as u8, refresh as u8)
            }
            FrameKind::Firmware => (IMAGE_TYPE_FIRMWARE, 0, 0, 0),
        };

        let mut bytes = Vec::with_capacity(HEADER_LEN + blocks * BLOCK_LEN);
        bytes.extend_from_slice(&[0, 0]); // CRC, filled below
        bytes.push(0x00);
        bytes.extend_from_slice(&total_len.to_le_bytes());
        bytes.push(image_type);
        bytes.push(0); // compress type
        bytes.extend_from_slice(&0u32.to_le_bytes()); // compressed length
        bytes.push(epd_type);
        bytes.push(page_num);
        bytes.push(refresh);
        bytes.extend_from_slice(&[0u8; RESERVED_LEN]);
        debug_assert_eq!(bytes.len(), CRC_LEN + FIELDS_LEN + RESERVED_LEN);
        bytes.extend_from_slice(payload);

        let crc = crc16_ccitt(&bytes[CRC_LEN..]);
        bytes[..CRC_LEN].copy_from_slice(&crc.to_le_bytes());

        let remainder = payload.len() % BLOCK_LEN;
        if remainder != 0 {
            bytes.push((BLOCK_LEN - remainder) as u8);
            bytes.resize(HEADER_LEN + blocks * BLOCK_LEN, 0);
        }

        Ok(Self {
            kind,
            bytes,
            payload_len: payload.len(),
            crc,
        })
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    pub fn crc(&self) -> u16 {
        self.crc
    }

    /// Number of Image-Block writes needed
    pub fn total_blocks(&self) -> usize {
        (self.bytes.len() - HEADER_LEN) / BLOCK_LEN
    }

    /// The 32 bytes written to Image-Identify
    pub fn header(&self) -> &[u8] {
        &self.bytes[..HEADER_LEN]
    }

    /// Raw bytes of block `index`
    pub fn block(&self, index: usize) -> Option<&[u8]> {
        let start = HEADER_LEN + index * BLOCK_LEN;
        self.bytes.get(start..start + BLOCK_LEN)
    }

    /// Image-Block write value: LE u16 index followed by the block bytes
    pub fn block_packet(&self, index: usize) -> Option<Vec<u8>> {
        let block = self.block(index)?;
        let mut packet = Vec::with_capacity(2 + BLOCK_LEN);
        packet.extend_from_slice(&(index as u16).to_le_bytes());
        packet.extend_from_slice(block);
        Some(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let frame = Frame::image(&[0xAB; 10], 3, true).expect("build");
        let b = frame.as_bytes();
        assert_eq!(b[2], 0x00);
        assert_eq!(u32::from_le_bytes([b[3], b[4], b[5], b[6]]), 42);
        assert_eq!(b[7], 0x02);
        assert_eq!(b[8], 0);
        assert_eq!(&b[9..13], &[0, 0, 0, 0]);
        assert_eq!(b[13], 0x20);
        assert_eq!(b[14], 2);
        assert_eq!(b[15], 1);
        assert!(b[16..32].iter().all(|x| *x == 0));
        assert_eq!(&b[32..42], &[0xAB; 10]);
    }

    #[test]
    fn test_firmware_header() {
        let frame = Frame::firmware(&[1, 2, 3]).expect("build");
        let b = frame.as_bytes();
        assert_eq!(b[7], 0x01);
        assert_eq!(&b[13..16], &[0, 0, 0]);
        assert_eq!(frame.kind(), FrameKind::Firmware);
    }

    #[test]
    fn test_crc_prefix_covers_header_and_payload() {
        let payload = [7u8; 50];
        let frame = Frame::image(&payload, 1, false).expect("build");
        let b = frame.as_bytes();
        let expected = crc16_ccitt(&b[2..HEADER_LEN + payload.len()]);
        assert_eq!(frame.crc(), expected);
        assert_eq!(u16::from_le_bytes([b[0], b[1]]), expected);
    }

    #[test]
    fn test_padding_237_bytes() {
        let frame = Frame::image(&[0x11; 237], 1, false).expect("build");
        assert_eq!(frame.len(), HEADER_LEN + BLOCK_LEN);
        assert_eq!(frame.total_blocks(), 1);
        let b = frame.as_bytes();
        assert_eq!(b[HEADER_LEN + 237], 3);
        assert_eq!(&b[HEADER_LEN + 238..], &[0, 0]);
    }

    #[test]
    fn test_aligned_payload_not_padded() {
        let frame = Frame::image(&[0x11; 480], 1, false).expect("build");
        assert_eq!(frame.len(), HEADER_LEN + 480);
        assert_eq!(frame.total_blocks(), 2);
    }

    #[test]
    fn test_epd250_block_count() {
        let frame = Frame::image(&vec![0xFF; 296 * 128 / 8], 1, true).expect("build");
        assert_eq!(frame.total_blocks(), 20);
    }

    #[test]
    fn test_block_packet() {
        let payload: Vec<u8> = (0..=255).collect();
        let frame = Frame::firmware(&payload).expect("build");
        let packet = frame.block_packet(1).expect("second block");
        assert_eq!(&packet[..2], &[1, 0]);
        assert_eq!(packet.len(), 2 + BLOCK_LEN);
        assert_eq!(packet[2], 240);
        assert!(frame.block_packet(2).is_none());
    }

    #[test]
    fn test_invalid_inputs() {
        assert_eq!(Frame::image(&[], 1, false), Err(FrameError::EmptyPayload));
        assert_eq!(Frame::image(&[1], 0, false), Err(FrameError::InvalidPage(0)));
        assert_eq!(Frame::image(&[1], 257, false), Err(FrameError::InvalidPage(257)));
    }
}
