/// BLE scanner state and advertisement filtering
///
/// The scanner itself holds no timers. The session manager starts and stops the
/// platform scan and arms the auto-stop timer; this module decides which results
/// are reported and what they carry.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::platform::DeviceAddress;
use crate::image::PanelType;
use crate::image::DEVICE_NAME_PREFIX;
use crate::protocol::advert;

/// Scanning configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Only report devices whose name starts with this prefix; `None` reports everything
    pub name_prefix: Option<String>,
    /// Scan duration used when the caller does not give one
    pub default_duration_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            name_prefix: Some(DEVICE_NAME_PREFIX.to_string()),
            default_duration_ms: 10_000,
        }
    }
}

impl ScanConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ScannerError> {
        if self.default_duration_ms == 0 {
            return Err(ScannerError::InvalidScanConfig(
                "Default scan duration must be > 0".to_string(),
            ));
        }
        if matches!(&self.name_prefix, Some(prefix) if prefix.is_empty()) {
            return Err(ScannerError::InvalidScanConfig(
                "Name prefix must not be empty; use null to disable filtering".to_string(),
            ));
        }
        Ok(())
    }
}

/// Errors for scanner operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScannerError {
    #[error("Invalid scan configuration: {0}")]
    InvalidScanConfig(String),
}

/// Scanner state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScannerState {
    /// Idle, not scanning
    Idle,
    /// Actively scanning
    Scanning,
}

/// A device seen while scanning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub address: DeviceAddress,
    pub name: Option<String>,
    /// RSSI in dBm
    pub rssi: i16,
    /// Alarm flag from the manufacturer data
    pub alarm: bool,
    /// Panel resolved from the advertised name
    pub panel: Option<PanelType>,
}

impl ScanReport {
    /// Get approximate distance in meters based on RSSI (simple estimate)
    pub fn estimate_distance(&self) -> f64 {
        // Path loss model: distance ≈ 10^((txPower - rssi) / 20), txPower = -5 dBm
        let tx_power = -5i16;
        if self.rssi == tx_power {
            return 1.0;
        }
        10f64.powf((tx_power - self.rssi) as f64 / 20.0)
    }
}

/// BLE scanner
#[derive(Debug, Clone)]
pub struct BleScanner {
    state: ScannerState,
    config: ScanConfig,
}

impl BleScanner {
    pub fn new(config: ScanConfig) -> Result<Self, ScannerError> {
        config.validate()?;
        Ok(Self {
            state: ScannerState::Idle,
            config,
        })
    }

    /// Get current scanner state
    pub fn state(&self) -> ScannerState {
        self.state
    }

    /// Get scanner configuration
    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn is_scanning(&self) -> bool {
        self.state == ScannerState::Scanning
    }

    /// Enter `Scanning`; returns false if already scanning
    pub fn start_scanning(&mut self) -> bool {
        let was_idle = self.state == ScannerState::Idle;
        self.state = ScannerState::Scanning;
        was_idle
    }

    /// Return to `Idle`; returns false if the scanner was already idle
    pub fn stop_scanning(&mut self) -> bool {
        let was_scanning = self.state == ScannerState::Scanning;
        self.state = ScannerState::Idle;
        was_scanning
    }

    /// Turn a raw scan result into a report, or `None` if it is filtered out
    pub fn filter(
        &self,
        address: &DeviceAddress,
        name: Option<&str>,
        rssi: i16,
        advertisement: &[u8],
    ) -> Option<ScanReport> {
        if !self.is_scanning() {
            return None;
        }
        if let Some(prefix) = &self.config.name_prefix {
            if !name.is_some_and(|n| n.starts_with(prefix.as_str())) {
                return None;
            }
        }
        Some(ScanReport {
            address: address.clone(),
            name: name.map(str::to_string),
            rssi,
            alarm: advert::alarm_flag(advertisement),
            panel: name.and_then(PanelType::from_device_name),
        })
    }
}
