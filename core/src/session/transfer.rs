//! Notify-paced chunked transfer of one frame.
//!
//! The header goes to Image-Identify. The device answers with block index 0 on
//! Image-Block, after which blocks are written back to back, each one issued on
//! the write completion of the previous. Every index the device notifies
//! updates the progress. A single byte on Image-Status ends the transfer.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::GattRequest;
use crate::listener::{ConnectEvent, ImageWritePhase, TaskErrorKind};
use crate::protocol::status::{
    progress_percent, success_message, IDENTIFY_REJECTED_MESSAGE, IN_PROGRESS_MESSAGE,
    START_MESSAGE, TASK_TIMEOUT_MESSAGE,
};
use crate::protocol::{Frame, TransferStatus};
use crate::transport::ble::{CharacteristicHandle, GattStatus};

/// How a transfer ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Success { elapsed: Duration },
    /// Non-success status byte from the device
    Device(TransferStatus),
    /// Notification on Image-Identify: header refused
    Rejected,
    /// A header or block write failed
    WriteFailed(GattStatus),
    TimedOut,
}

impl TransferOutcome {
    /// Failure tag reported to task callbacks; `None` on success
    pub fn error_kind(&self) -> Option<TaskErrorKind> {
        match self {
            TransferOutcome::Success { .. } => None,
            TransferOutcome::Device(status) => Some(TaskErrorKind::Protocol(*status)),
            TransferOutcome::Rejected => Some(TaskErrorKind::Rejected),
            TransferOutcome::WriteFailed(status) => Some(TaskErrorKind::Platform(status.0)),
            TransferOutcome::TimedOut => Some(TaskErrorKind::TaskTimeout),
        }
    }
}

/// Result of feeding one input to a transfer
#[derive(Debug, Default)]
pub struct TransferStep {
    pub request: Option<GattRequest>,
    pub events: Vec<ConnectEvent>,
    pub outcome: Option<TransferOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Header written, waiting for index 0
    AwaitingAck,
    /// A block write is outstanding
    Writing,
    /// All blocks written
    AwaitingStatus,
}

/// In-flight transfer state
#[derive(Debug)]
pub struct Transfer {
    frame: Frame,
    identify: CharacteristicHandle,
    block: CharacteristicHandle,
    phase: Phase,
    running_block: usize,
    progress: u8,
    started: Instant,
}

impl Transfer {
    pub fn new(
        frame: Frame,
        identify: CharacteristicHandle,
        block: CharacteristicHandle,
        now: Instant,
    ) -> Self {
        Self {
            frame,
            identify,
            block,
            phase: Phase::AwaitingAck,
            running_block: 0,
            progress: 0,
            started: now,
        }
    }

    pub fn total_blocks(&self) -> usize {
        self.frame.total_blocks()
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn running_block(&self) -> usize {
        self.running_block
    }

    /// Header write and the Start event
    pub fn start(&mut self) -> TransferStep {
        info!(
            "Transfer start: {} bytes, {} blocks, crc {:04x}",
            self.frame.len(),
            self.total_blocks(),
            self.frame.crc()
        );
        TransferStep {
            request: Some(GattRequest::Write(self.identify, self.frame.header().to_vec())),
            events: vec![ConnectEvent::image_write(ImageWritePhase::Start, 0, START_MESSAGE)],
            outcome: None,
        }
    }

    /// Image-Block notification carrying the acknowledged index
    pub fn on_block_ack(&mut self, value: &[u8]) -> TransferStep {
        let mut step = TransferStep::default();
        let [lo, hi, ..] = value else {
            warn!("Short Image-Block notification: {:02x?}", value);
            return step;
        };
        let index = u16::from_le_bytes([*lo, *hi]) as usize;
        self.progress = progress_percent(index, self.total_blocks());
        debug!(
            "Block ack {} / {} ({}%)",
            index + 1,
            self.total_blocks(),
            self.progress
        );
        step.events.push(ConnectEvent::image_write(
            ImageWritePhase::InProgress,
            self.progress,
            IN_PROGRESS_MESSAGE,
        ));
        if index == 0 && self.phase == Phase::AwaitingAck {
            self.running_block = 0;
            self.phase = Phase::Writing;
            step.request = self.block_request(0);
        }
        step
    }

    /// Write completion on Image-Identify or Image-Block
    pub fn on_write_complete(
        &mut self,
        characteristic: CharacteristicHandle,
        status: GattStatus,
    ) -> TransferStep {
        if characteristic != self.identify && characteristic != self.block {
            return TransferStep::default();
        }
        if !status.is_success() {
            return self.fail_write(status);
        }
        if characteristic == self.block && self.phase == Phase::Writing {
            let next = self.running_block + 1;
            if next < self.total_blocks() {
                self.running_block = next;
                return TransferStep {
                    request: self.block_request(next),
                    ..Default::default()
                };
            }
            self.phase = Phase::AwaitingStatus;
        }
        TransferStep::default()
    }

    /// Unexpected notification on Image-Identify
    pub fn on_identify_notify(&mut self) -> TransferStep {
        warn!("Image-Identify notification, device rejected the header");
        self.finish(
            ImageWritePhase::Error,
            IDENTIFY_REJECTED_MESSAGE.to_string(),
            TransferOutcome::Rejected,
        )
    }

    /// Terminal status on Image-Status
    pub fn on_status(&mut self, value: &[u8], now: Instant) -> TransferStep {
        let status = TransferStatus::from_notification(value);
        let elapsed = now.saturating_duration_since(self.started);
        info!("Transfer done: {} after {} ms", status, elapsed.as_millis());
        match status.error_message() {
            None => self.finish(
                ImageWritePhase::Finish,
                success_message(elapsed),
                TransferOutcome::Success { elapsed },
            ),
            Some(message) => self.finish(
                ImageWritePhase::Error,
                message.to_string(),
                TransferOutcome::Device(status),
            ),
        }
    }

    /// The task timer fired
    pub fn on_timeout(&mut self) -> TransferStep {
        warn!("Transfer timed out at block {}", self.running_block);
        self.finish(
            ImageWritePhase::Timeout,
            TASK_TIMEOUT_MESSAGE.to_string(),
            TransferOutcome::TimedOut,
        )
    }

    /// The platform refused a header or block write
    pub fn on_request_failed(&mut self, status: GattStatus) -> TransferStep {
        self.fail_write(status)
    }

    fn fail_write(&mut self, status: GattStatus) -> TransferStep {
        warn!("Transfer write failed with status {}", status);
        self.finish(
            ImageWritePhase::Error,
            format!("Write Error (status {})", status),
            TransferOutcome::WriteFailed(status),
        )
    }

    fn finish(&mut self, phase: ImageWritePhase, message: String, outcome: TransferOutcome) -> TransferStep {
        let event = match outcome.error_kind() {
            Some(kind) => ConnectEvent::image_failure(phase, self.progress, message, kind),
            None => ConnectEvent::image_write(phase, self.progress, message),
        };
        TransferStep {
            request: None,
            events: vec![event],
            outcome: Some(outcome),
        }
    }

    fn block_request(&self, index: usize) -> Option<GattRequest> {
        let packet = self.frame.block_packet(index)?;
        Some(GattRequest::Write(self.block, packet))
    }
}
