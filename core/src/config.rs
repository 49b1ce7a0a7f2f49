// Library configuration: session limits, timeouts and scanning

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::ble::{ScanConfig, ScannerError, REQUESTED_MTU};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must be > 0")]
    Zero { field: &'static str },
    #[error("MTU {0} is outside 23..=517")]
    InvalidMtu(u16),
    #[error(transparent)]
    Scan(#[from] ScannerError),
}

/// Settings for the session manager and task orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EpdConfig {
    /// Concurrent sessions before connects are queued
    pub max_sessions: usize,
    /// MTU requested during the handshake
    pub mtu: u16,
    pub connect_timeout_ms: u64,
    pub task_timeout_ms: u64,
    /// Pause between a disconnect request and releasing or redialing
    pub settle_delay_ms: u64,
    /// Connection attempts a task makes before giving up
    pub max_retries: u32,
    pub scan: ScanConfig,
}

impl Default for EpdConfig {
    fn default() -> Self {
        Self {
            max_sessions: 4,
            mtu: REQUESTED_MTU,
            connect_timeout_ms: 30_000,
            task_timeout_ms: 60_000,
            settle_delay_ms: 1_000,
            max_retries: 5,
            scan: ScanConfig::default(),
        }
    }
}

impl EpdConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("max_sessions", self.max_sessions as u64),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("task_timeout_ms", self.task_timeout_ms),
            ("max_retries", self.max_retries as u64),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        if !(23..=517).contains(&self.mtu) {
            return Err(ConfigError::InvalidMtu(self.mtu));
        }
        self.scan.validate()?;
        Ok(())
    }
}
