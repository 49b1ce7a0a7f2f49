// EPD Link Core: BLE session management for electronic paper displays
//
// Admission control over a fixed number of concurrent device sessions, the
// GATT handshake, the chunked frame transfer, and per-device task
// orchestration. Image encoding for the supported panels lives alongside.
//
// The Bluetooth stack is injected through `transport::ble::BlePlatform`.

pub mod admission;
pub mod config;
pub mod image;
pub mod listener;
pub mod manager;
pub mod protocol;
pub mod session;
pub mod task;
pub mod transport;

use thiserror::Error;

pub use admission::{Admission, AdmissionController, AdmissionSnapshot, RejectReason};
pub use config::{ConfigError, EpdConfig};
pub use image::{Adjustment, Bitmap, ImageError, PanelType, Rgb};
pub use listener::{
    ConnectEvent, ConnectListener, ConnectionState, DisconnectReason, ImageWritePhase,
    ScanListener, TaskError, TaskErrorKind, TaskHandlerCallback,
};
pub use manager::{ManagerError, ManagerHandle, ManagerSnapshot, SessionInfo};
pub use protocol::{Frame, FrameError, LedState, TransferStatus};
pub use session::SessionError;
pub use task::handler::TaskOptions;
pub use task::{ImageTask, Task, TaskHandler, TaskType};
pub use transport::ble::{BlePlatform, DeviceAddress, PlatformError, SimDevice, SimulatedPeripheral};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EpdError {
    #[error("Image error: {0}")]
    Image(#[from] ImageError),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Manager error: {0}")]
    Manager(#[from] ManagerError),
}

/// Encode `bitmap` for `panel` and wrap it in an image frame
pub fn build_image_frame(
    panel: PanelType,
    bitmap: &Bitmap,
    page: u16,
    refresh: bool,
) -> Result<Frame, EpdError> {
    let payload = image::encode(panel, bitmap)?;
    Ok(Frame::image(&payload, page, refresh)?)
}
