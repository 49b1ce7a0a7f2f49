//! Per-device session state machines.
//!
//! Sessions never touch the platform. Every input returns a list of
//! `SessionAction`s that the session manager executes in order.

pub mod device;
pub mod handshake;
pub mod timer;
pub mod transfer;

pub use device::{DeviceSession, SessionTiming};
pub use handshake::{Handshake, HandshakeError, HandshakeProgress, HandshakeState};
pub use timer::{TimerKind, Timers};
pub use transfer::{Transfer, TransferOutcome, TransferStep};

use std::time::Duration;
use thiserror::Error;

use crate::listener::{ConnectEvent, DisconnectReason};
use crate::transport::ble::{CharacteristicHandle, GattError};

/// One platform request on the session's connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattRequest {
    Connect,
    Disconnect,
    Close,
    DiscoverServices,
    RequestMtu(u16),
    Read(CharacteristicHandle),
    Write(CharacteristicHandle, Vec<u8>),
    EnableNotify(CharacteristicHandle),
}

impl GattRequest {
    /// Requests whose failure does not concern the state machine
    pub fn is_teardown(&self) -> bool {
        matches!(self, GattRequest::Disconnect | GattRequest::Close)
    }
}

/// Side effect requested by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    Request(GattRequest),
    ArmTimer(TimerKind, Duration),
    CancelTimer(TimerKind),
    Notify(ConnectEvent),
    /// The session is finished; free its admission slot
    Release(DisconnectReason),
}

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("No connected session for this device")]
    NotConnected,
    #[error("Session is not ready")]
    NotReady,
    #[error("Another operation is in flight")]
    Busy,
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Gatt(#[from] GattError),
}
