/// GATT characteristic roles for the EPD device family
///
/// The devices expose a fixed set of characteristics. Sessions refer to them by
/// logical role; only this module knows their UUIDs, and the platform only ever
/// sees the opaque handles it reported during service discovery.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Client Characteristic Configuration Descriptor, written by the platform to enable notify
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x0000_2902_0000_1000_8000_0080_5F9B_34FB);

/// MTU requested during the handshake
pub const REQUESTED_MTU: u16 = 251;

/// Logical characteristic roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GattRole {
    /// Write-only, one byte of LED state
    LedControl,
    /// Read, firmware version string
    FirmwareVersion,
    /// Write the 32-byte frame header; notify on rejection
    ImageIdentify,
    /// Write blocks; notify with the acknowledged block index
    ImageBlock,
    /// Notify with the terminal transfer status
    ImageStatus,
    /// Notify with alarm and refresh events
    DeviceEvent,
}

impl GattRole {
    pub const ALL: [GattRole; 6] = [
        GattRole::LedControl,
        GattRole::FirmwareVersion,
        GattRole::ImageIdentify,
        GattRole::ImageBlock,
        GattRole::ImageStatus,
        GattRole::DeviceEvent,
    ];

    /// Roles whose notifications are enabled during the handshake, in order
    pub const NOTIFY_ORDER: [GattRole; 4] = [
        GattRole::ImageIdentify,
        GattRole::ImageBlock,
        GattRole::ImageStatus,
        GattRole::DeviceEvent,
    ];

    /// Characteristic UUID
    pub fn uuid(&self) -> Uuid {
        Uuid::from_u128(match self {
            GattRole::LedControl => 0x0000_FFF3_0000_1000_8000_0080_5F9B_34FB,
            GattRole::FirmwareVersion => 0x0000_2A26_0000_1000_8000_0080_5F9B_34FB,
            GattRole::ImageIdentify => 0xF000_FFC1_0451_4000_B000_0000_0000_0000,
            GattRole::ImageBlock => 0xF000_FFC2_0451_4000_B000_0000_0000_0000,
            GattRole::ImageStatus => 0xF000_FFC4_0451_4000_B000_0000_0000_0000,
            GattRole::DeviceEvent => 0x0000_FFF4_0000_1000_8000_0080_5F9B_34FB,
        })
    }

    pub fn from_uuid(uuid: &Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|role| role.uuid() == *uuid)
    }
}

impl fmt::Display for GattRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GattRole::LedControl => "LED-control",
            GattRole::FirmwareVersion => "Firmware-version",
            GattRole::ImageIdentify => "Image-Identify",
            GattRole::ImageBlock => "Image-Block",
            GattRole::ImageStatus => "Image-Status",
            GattRole::DeviceEvent => "Device-Event",
        };
        f.write_str(name)
    }
}

/// Opaque platform handle of a discovered characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharacteristicHandle(pub u64);

/// A characteristic reported by service discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub uuid: Uuid,
    pub handle: CharacteristicHandle,
}

/// Platform completion status, 0 on success (Android GATT numbering)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GattStatus(pub i32);

impl GattStatus {
    pub const SUCCESS: GattStatus = GattStatus(0);
    pub const FAILURE: GattStatus = GattStatus(257);

    pub fn is_success(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors for GATT operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("Missing characteristics: {0:?}")]
    MissingCharacteristics(Vec<GattRole>),
    #[error("Characteristic {0} not discovered")]
    NotDiscovered(GattRole),
}

/// Role to handle mapping for one connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CharacteristicTable {
    handles: HashMap<GattRole, CharacteristicHandle>,
}

impl CharacteristicTable {
    /// Build the table from discovery results; every role must be present.
    ///
    /// Unknown characteristics are ignored; the first handle wins on duplicates.
    pub fn from_discovered(discovered: &[DiscoveredCharacteristic]) -> Result<Self, GattError> {
        let mut handles = HashMap::new();
        for characteristic in discovered {
            if let Some(role) = GattRole::from_uuid(&characteristic.uuid) {
                handles.entry(role).or_insert(characteristic.handle);
            }
        }
        let missing: Vec<GattRole> = GattRole::ALL
            .into_iter()
            .filter(|role| !handles.contains_key(role))
            .collect();
        if !missing.is_empty() {
            return Err(GattError::MissingCharacteristics(missing));
        }
        Ok(Self { handles })
    }

    pub fn get(&self, role: GattRole) -> Result<CharacteristicHandle, GattError> {
        self.handles
            .get(&role)
            .copied()
            .ok_or(GattError::NotDiscovered(role))
    }

    /// Reverse lookup, used to route notifications and completions
    pub fn role_of(&self, handle: CharacteristicHandle) -> Option<GattRole> {
        self.handles
            .iter()
            .find(|(_, h)| **h == handle)
            .map(|(role, _)| *role)
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_set() -> Vec<DiscoveredCharacteristic> {
        GattRole::ALL
            .iter()
            .enumerate()
            .map(|(i, role)| DiscoveredCharacteristic {
                uuid: role.uuid(),
                handle: CharacteristicHandle(0x20 + i as u64),
            })
            .collect()
    }

    #[test]
    fn test_role_uuids() {
        assert_eq!(
            GattRole::ImageBlock.uuid().to_string(),
            "f000ffc2-0451-4000-b000-000000000000"
        );
        assert_eq!(
            GattRole::FirmwareVersion.uuid().to_string(),
            "00002a26-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(CCCD_UUID.to_string(), "00002902-0000-1000-8000-00805f9b34fb");
    }

    #[test]
    fn test_from_uuid() {
        for role in GattRole::ALL {
            assert_eq!(GattRole::from_uuid(&role.uuid()), Some(role));
        }
        assert_eq!(GattRole::from_uuid(&CCCD_UUID), None);
    }

    #[test]
    fn test_table_complete() {
        let table = CharacteristicTable::from_discovered(&full_set()).expect("complete");
        assert_eq!(
            table.get(GattRole::ImageIdentify).expect("present"),
            CharacteristicHandle(0x22)
        );
        assert_eq!(
            table.role_of(CharacteristicHandle(0x25)),
            Some(GattRole::DeviceEvent)
        );
        assert_eq!(table.role_of(CharacteristicHandle(0x99)), None);
    }

    #[test]
    fn test_table_missing_roles() {
        let mut discovered = full_set();
        discovered.retain(|c| c.uuid != GattRole::ImageStatus.uuid());
        discovered.push(DiscoveredCharacteristic {
            uuid: CCCD_UUID,
            handle: CharacteristicHandle(1),
        });
        let err = CharacteristicTable::from_discovered(&discovered).expect_err("incomplete");
        assert_eq!(err, GattError::MissingCharacteristics(vec![GattRole::ImageStatus]));
    }

    #[test]
    fn test_status() {
        assert!(GattStatus::SUCCESS.is_success());
        assert!(!GattStatus(133).is_success());
    }
}
