//! Caller-facing callback interfaces.
//!
//! Every method has a no-op default so implementors only override what they
//! need. Callbacks run on the session manager task and must not block; spawn
//! any follow-up work.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::protocol::{LedState, TransferStatus};
use crate::transport::ble::{DeviceAddress, GattStatus, ScanReport};

/// Stage of an image or firmware transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageWritePhase {
    Start,
    InProgress,
    Finish,
    Error,
    Timeout,
}

impl ImageWritePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ImageWritePhase::Finish | ImageWritePhase::Error | ImageWritePhase::Timeout
        )
    }
}

/// Connection lifecycle as seen by listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Connecting,
    /// Link up, handshake running
    Connected,
    /// Handshake complete, characteristics known
    Ready,
    Disconnecting,
    Disconnected,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// A caller asked for it
    Requested,
    /// The link dropped
    LinkLost,
    /// Ready was not reached in time
    ConnectTimeout,
    /// A handshake step failed
    HandshakeFailed,
}

impl DisconnectReason {
    /// Whether a task should reconnect after this
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DisconnectReason::Requested)
    }
}

/// Event for the connect listener of one address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectEvent {
    ConnectionState {
        state: ConnectionState,
        reason: Option<DisconnectReason>,
    },
    ServicesDiscovered(GattStatus),
    FirmwareRead {
        status: GattStatus,
        value: Vec<u8>,
    },
    LedRead {
        status: GattStatus,
        value: Vec<u8>,
    },
    LedWrite {
        status: GattStatus,
        value: Vec<u8>,
    },
    ImageWrite {
        phase: ImageWritePhase,
        progress: u8,
        message: String,
        /// Set on Error and Timeout
        failure: Option<TaskErrorKind>,
    },
    ImageRefresh {
        success: bool,
        page: u16,
    },
    AlarmDetected(bool),
    ConnectionTimeout(String),
}

impl ConnectEvent {
    pub fn state(state: ConnectionState) -> Self {
        ConnectEvent::ConnectionState {
            state,
            reason: None,
        }
    }

    pub fn image_write(phase: ImageWritePhase, progress: u8, message: impl Into<String>) -> Self {
        ConnectEvent::ImageWrite {
            phase,
            progress,
            message: message.into(),
            failure: None,
        }
    }

    pub fn image_failure(
        phase: ImageWritePhase,
        progress: u8,
        message: impl Into<String>,
        kind: TaskErrorKind,
    ) -> Self {
        ConnectEvent::ImageWrite {
            phase,
            progress,
            message: message.into(),
            failure: Some(kind),
        }
    }

    pub fn dispatch(&self, address: &DeviceAddress, listener: &dyn ConnectListener) {
        listener.on_event(address, self)
    }
}

#[allow(unused_variables)]
pub trait ScanListener: Send + Sync {
    fn on_device_seen(&self, report: &ScanReport) {}

    fn on_scan_state_changed(&self, scanning: bool) {}
}

#[allow(unused_variables)]
pub trait ConnectListener: Send + Sync {
    /// Entry point for every event; the default routes to the methods below
    fn on_event(&self, address: &DeviceAddress, event: &ConnectEvent) {
        match event {
            ConnectEvent::ConnectionState { state, reason } => {
                self.on_connection_state_change(address, *state, *reason)
            }
            ConnectEvent::ServicesDiscovered(status) => self.on_services_discovered(address, *status),
            ConnectEvent::FirmwareRead { status, value } => {
                self.on_firmware_read(address, *status, value)
            }
            ConnectEvent::LedRead { status, value } => self.on_led_read(address, *status, value),
            ConnectEvent::LedWrite { status, value } => self.on_led_write(address, *status, value),
            ConnectEvent::ImageWrite {
                phase,
                progress,
                message,
                ..
            } => self.on_image_write_status(address, *phase, *progress, message),
            ConnectEvent::ImageRefresh { success, page } => {
                self.on_image_refresh(address, *success, *page)
            }
            ConnectEvent::AlarmDetected(alarm) => self.on_alarm_detected(address, *alarm),
            ConnectEvent::ConnectionTimeout(message) => self.on_connection_timeout(address, message),
        }
    }

    /// `reason` is set for `Disconnected`
    fn on_connection_state_change(
        &self,
        address: &DeviceAddress,
        state: ConnectionState,
        reason: Option<DisconnectReason>,
    ) {
    }

    fn on_services_discovered(&self, address: &DeviceAddress, status: GattStatus) {}

    fn on_firmware_read(&self, address: &DeviceAddress, status: GattStatus, value: &[u8]) {}

    fn on_led_read(&self, address: &DeviceAddress, status: GattStatus, value: &[u8]) {}

    fn on_led_write(&self, address: &DeviceAddress, status: GattStatus, value: &[u8]) {}

    fn on_image_write_status(
        &self,
        address: &DeviceAddress,
        phase: ImageWritePhase,
        progress: u8,
        message: &str,
    ) {
    }

    fn on_image_refresh(&self, address: &DeviceAddress, success: bool, page: u16) {}

    fn on_alarm_detected(&self, address: &DeviceAddress, alarm: bool) {}

    fn on_connection_timeout(&self, address: &DeviceAddress, message: &str) {}
}

// ============================================================================
// TASK CALLBACKS
// ============================================================================

/// Machine-checkable tag of a task failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskErrorKind {
    InvalidInput,
    /// Device reported a non-success status byte
    Protocol(TransferStatus),
    /// Device rejected the frame header
    Rejected,
    TaskTimeout,
    ConnectTimeout,
    ConnectionLost,
    /// The session still had another operation in flight
    Busy,
    /// A GATT request failed with this platform status
    Platform(i32),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.message, self.kind)
    }
}

#[allow(unused_variables)]
pub trait TaskHandlerCallback: Send + Sync {
    fn on_ready(&self, message: &str) {}

    fn on_progress(&self, progress: u8, message: &str) {}

    fn on_success(&self, message: &str) {}

    fn on_error(&self, error: &TaskError) {}

    fn on_firmware_read(&self, version: &str) {}

    fn on_led_read(&self, led: LedState) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl ConnectListener for Recorder {
        fn on_image_write_status(
            &self,
            address: &DeviceAddress,
            phase: ImageWritePhase,
            progress: u8,
            message: &str,
        ) {
            self.calls
                .lock()
                .push(format!("{} {:?} {} {}", address, phase, progress, message));
        }
    }

    #[test]
    fn test_dispatch_routes_to_method() {
        let recorder = Recorder::default();
        let address = DeviceAddress::from("dev");
        ConnectEvent::image_write(ImageWritePhase::InProgress, 50, "Sending image ...")
            .dispatch(&address, &recorder);
        // not overridden: default no-op
        ConnectEvent::AlarmDetected(true).dispatch(&address, &recorder);
        assert_eq!(
            recorder.calls.lock().as_slice(),
            ["dev InProgress 50 Sending image ..."]
        );
    }

    #[test]
    fn test_retryable_reasons() {
        assert!(!DisconnectReason::Requested.is_retryable());
        assert!(DisconnectReason::LinkLost.is_retryable());
        assert!(DisconnectReason::ConnectTimeout.is_retryable());
        assert!(DisconnectReason::HandshakeFailed.is_retryable());
    }

    #[test]
    fn test_terminal_phases() {
        assert!(!ImageWritePhase::Start.is_terminal());
        assert!(!ImageWritePhase::InProgress.is_terminal());
        assert!(ImageWritePhase::Finish.is_terminal());
        assert!(ImageWritePhase::Timeout.is_terminal());
    }
}
