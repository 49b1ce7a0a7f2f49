// Transport module: BLE central access to the EPD devices

pub mod ble;

pub use ble::{
    BlePlatform, ConnectionHandle, DeviceAddress, GattEvent, GattRole, GattStatus, PlatformError,
    PlatformEvent, ScanReport, SimDevice, SimulatedPeripheral,
};
