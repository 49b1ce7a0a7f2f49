// Platform BLE bridge
//
// The core never talks to a Bluetooth stack directly. An application injects an
// implementation of `BlePlatform` (btleplug on desktop, the simulated peripheral
// in tests) and owns its lifecycle.
//
// Every request is asynchronous in two steps: the returned future resolves once
// the stack has accepted the request, and the outcome arrives later as a
// `PlatformEvent` through the registered handler.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::gatt::{CharacteristicHandle, DiscoveredCharacteristic, GattStatus};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    #[error("Bluetooth adapter unavailable")]
    Unavailable,
    #[error("Unknown device: {0}")]
    UnknownDevice(DeviceAddress),
    #[error("Request refused with status {0}")]
    Refused(GattStatus),
    #[error("Platform error: {0}")]
    Other(String),
}

impl PlatformError {
    /// Status reported to the session when a request could not be issued
    pub fn status(&self) -> GattStatus {
        match self {
            PlatformError::Refused(status) => *status,
            _ => GattStatus::FAILURE,
        }
    }
}

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// Stable device identifier: a MAC address or a platform peripheral id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceAddress {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for DeviceAddress {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of one connection attempt, allocated by the session manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

/// A connection to one device.
///
/// Owned by its session and handed back to the platform with `close`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    pub address: DeviceAddress,
    pub id: ConnectionId,
}

impl ConnectionHandle {
    pub fn new(address: DeviceAddress, id: ConnectionId) -> Self {
        Self { address, id }
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.address, self.id.0)
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// Completion or unsolicited event for one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    ConnectionStateChanged {
        status: GattStatus,
        connected: bool,
    },
    ServicesDiscovered {
        status: GattStatus,
        characteristics: Vec<DiscoveredCharacteristic>,
    },
    MtuChanged {
        status: GattStatus,
        mtu: u16,
    },
    NotifyEnabled {
        status: GattStatus,
        characteristic: CharacteristicHandle,
    },
    CharacteristicRead {
        status: GattStatus,
        characteristic: CharacteristicHandle,
        value: Vec<u8>,
    },
    CharacteristicWritten {
        status: GattStatus,
        characteristic: CharacteristicHandle,
    },
    Notification {
        characteristic: CharacteristicHandle,
        value: Vec<u8>,
    },
}

/// Everything the platform reports back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    ScanResult {
        address: DeviceAddress,
        name: Option<String>,
        rssi: i16,
        /// Raw advertisement: concatenated `[len][type][data]` structures
        advertisement: Vec<u8>,
    },
    Gatt {
        connection: ConnectionHandle,
        event: GattEvent,
    },
}

pub type PlatformEventHandler = Box<dyn Fn(PlatformEvent) + Send + Sync>;

// ============================================================================
// PLATFORM BRIDGE TRAIT
// ============================================================================

/// Platform-specific BLE central abstraction
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlePlatform: Send + Sync {
    /// Start reporting `ScanResult` events
    async fn start_scan(&self) -> Result<(), PlatformError>;

    async fn stop_scan(&self) -> Result<(), PlatformError>;

    /// Open a connection; completes with `ConnectionStateChanged`
    async fn connect(&self, connection: &ConnectionHandle) -> Result<(), PlatformError>;

    /// Close the link; completes with `ConnectionStateChanged { connected: false }`
    async fn disconnect(&self, connection: &ConnectionHandle) -> Result<(), PlatformError>;

    /// Release every platform resource held for the connection. No event follows.
    async fn close(&self, connection: &ConnectionHandle) -> Result<(), PlatformError>;

    async fn discover_services(&self, connection: &ConnectionHandle) -> Result<(), PlatformError>;

    async fn request_mtu(&self, connection: &ConnectionHandle, mtu: u16)
        -> Result<(), PlatformError>;

    async fn read_characteristic(
        &self,
        connection: &ConnectionHandle,
        characteristic: CharacteristicHandle,
    ) -> Result<(), PlatformError>;

    async fn write_characteristic(
        &self,
        connection: &ConnectionHandle,
        characteristic: CharacteristicHandle,
        value: Vec<u8>,
    ) -> Result<(), PlatformError>;

    /// Enable notifications through the CCCD
    async fn enable_notify(
        &self,
        connection: &ConnectionHandle,
        characteristic: CharacteristicHandle,
    ) -> Result<(), PlatformError>;

    /// Register the single event sink; replaces any previous one
    fn set_event_handler(&self, handler: PlatformEventHandler);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display_and_serde() {
        let address = DeviceAddress::from("AA:BB:CC:DD:EE:FF");
        assert_eq!(address.to_string(), "AA:BB:CC:DD:EE:FF");
        let json = serde_json::to_string(&address).expect("serialize");
        assert_eq!(json, "\"AA:BB:CC:DD:EE:FF\"");
    }

    #[test]
    fn test_error_status() {
        assert_eq!(PlatformError::Refused(GattStatus(133)).status(), GattStatus(133));
        assert_eq!(PlatformError::Unavailable.status(), GattStatus::FAILURE);
    }

    #[test]
    fn test_connection_handle_display() {
        let handle = ConnectionHandle::new(DeviceAddress::from("dev"), ConnectionId(7));
        assert_eq!(handle.to_string(), "dev#7");
    }
}
