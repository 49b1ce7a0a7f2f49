//! Wire protocol: frame layout, checksums and the notification formats.

pub mod advert;
pub mod crc;
pub mod event;
pub mod frame;
pub mod led;
pub mod status;

pub use crc::{crc16_ccitt, crc16_ccitt_with_init};
pub use event::DeviceEvent;
pub use frame::{Frame, FrameKind, BLOCK_LEN, HEADER_LEN};
pub use led::LedState;
pub use status::TransferStatus;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("Payload is empty")]
    EmptyPayload,
    #[error("Invalid page number {0} (expected 1..=256)")]
    InvalidPage(u16),
    #[error("Payload of {0} bytes does not fit the length field")]
    TooLarge(usize),
    #[error("Frame needs {0} blocks, the block index is 16 bits")]
    TooManyBlocks(usize),
}
