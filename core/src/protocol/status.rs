//! Image-Status codes and the transfer messages shown to callers.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const START_MESSAGE: &str = "Start sending command";
pub const IN_PROGRESS_MESSAGE: &str = "Sending image ...";
pub const IDENTIFY_REJECTED_MESSAGE: &str = "Characteristic Error";
pub const TASK_TIMEOUT_MESSAGE: &str = "Task Timeout";
pub const CONNECT_TIMEOUT_MESSAGE: &str = "Connect Timeout";

/// Terminal result byte reported on Image-Status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferStatus {
    Success,
    CrcError,
    FlashError,
    BlockOverflow,
    IdentifyError,
    Unknown(u8),
}

impl TransferStatus {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => TransferStatus::Success,
            0x01 => TransferStatus::CrcError,
            0x02 => TransferStatus::FlashError,
            0x03 => TransferStatus::BlockOverflow,
            0x04 => TransferStatus::IdentifyError,
            other => TransferStatus::Unknown(other),
        }
    }

    /// Decode a notification value; an empty value counts as unknown
    pub fn from_notification(value: &[u8]) -> Self {
        value
            .first()
            .map(|b| Self::from_byte(*b))
            .unwrap_or(TransferStatus::Unknown(0xFF))
    }

    pub fn as_byte(&self) -> u8 {
        match self {
            TransferStatus::Success => 0x00,
            TransferStatus::CrcError => 0x01,
            TransferStatus::FlashError => 0x02,
            TransferStatus::BlockOverflow => 0x03,
            TransferStatus::IdentifyError => 0x04,
            TransferStatus::Unknown(b) => *b,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TransferStatus::Success)
    }

    /// Message for a failed transfer; `None` on success
    pub fn error_message(&self) -> Option<&'static str> {
        match self {
            TransferStatus::Success => None,
            TransferStatus::CrcError => Some("CRC Error"),
            TransferStatus::FlashError => Some("Flash Error"),
            TransferStatus::BlockOverflow => Some("Block Overflow"),
            TransferStatus::IdentifyError => Some("Identify Error"),
            TransferStatus::Unknown(_) => Some("Unknown Error"),
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.error_message() {
            Some(message) => write!(f, "{} (0x{:02x})", message, self.as_byte()),
            None => write!(f, "Success"),
        }
    }
}

/// `"Success! Take 1.23 s"`, seconds rounded to two decimals
pub fn success_message(elapsed: Duration) -> String {
    let seconds = (elapsed.as_secs_f64() * 100.0).round() / 100.0;
    format!("Success! Take {} s", seconds)
}

/// Progress after block `index` was acknowledged, in percent
pub fn progress_percent(index: usize, total_blocks: usize) -> u8 {
    if total_blocks == 0 {
        return 0;
    }
    let percent = ((index + 1) as f64 / total_blocks as f64 * 100.0).round();
    percent.min(100.0) as u8
}
