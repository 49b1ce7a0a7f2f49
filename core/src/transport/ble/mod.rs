/// BLE (Bluetooth Low Energy) Transport Module
///
/// Protocol-level view of the EPD devices over BLE:
///
/// - **gatt**: characteristic roles, UUIDs and the per-connection handle table
/// - **platform**: the `BlePlatform` bridge trait and the events it reports
/// - **scanner**: scan state and advertisement filtering
/// - **sim**: an in-process simulated device implementing `BlePlatform`
///
/// Real Bluetooth stacks live outside the core and are injected as
/// `Arc<dyn BlePlatform>`.

pub mod gatt;
pub mod platform;
pub mod scanner;
pub mod sim;

// Re-export commonly used types
pub use gatt::{
    CharacteristicHandle, CharacteristicTable, DiscoveredCharacteristic, GattError, GattRole,
    GattStatus, CCCD_UUID, REQUESTED_MTU,
};

pub use platform::{
    BlePlatform, ConnectionHandle, ConnectionId, DeviceAddress, GattEvent, PlatformError,
    PlatformEvent, PlatformEventHandler,
};

pub use scanner::{BleScanner, ScanConfig, ScanReport, ScannerError, ScannerState};

pub use sim::{PlatformCall, SimDevice, SimulatedPeripheral};
