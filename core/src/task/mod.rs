//! Task orchestration: one job per device, run over a fresh connection with
//! bounded reconnect retries.

pub mod handler;

pub use handler::TaskHandler;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::image::{adjust, dither_for_panel, encode, Adjustment, Bitmap, PanelType};
use crate::protocol::Frame;
use crate::EpdError;

/// Image push parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTask {
    pub panel: PanelType,
    pub bitmap: Bitmap,
    /// 1-based page
    pub page: u16,
    pub refresh: bool,
    /// Floyd–Steinberg dither to the panel palette before encoding
    pub dither: bool,
    pub adjustment: Adjustment,
}

impl ImageTask {
    pub fn new(panel: PanelType, bitmap: Bitmap) -> Self {
        Self {
            panel,
            bitmap,
            page: 1,
            refresh: true,
            dither: false,
            adjustment: Adjustment::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    PushImage(ImageTask),
    FirmwareUpgrade { package: Vec<u8>, version: String },
    CheckStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    PushImage,
    FirmwareUpgrade,
    CheckStatus,
}

impl Task {
    pub fn task_type(&self) -> TaskType {
        match self {
            Task::PushImage(_) => TaskType::PushImage,
            Task::FirmwareUpgrade { .. } => TaskType::FirmwareUpgrade,
            Task::CheckStatus => TaskType::CheckStatus,
        }
    }
}

/// A task with its wire frame built, ready to run once the session is Ready
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PreparedTask {
    Send(Frame),
    Firmware { frame: Frame, version: String },
    CheckStatus,
}

/// Build the frame for `task`; fails on invalid input before any I/O
pub(crate) fn prepare(task: &Task) -> Result<PreparedTask, EpdError> {
    match task {
        Task::PushImage(image) => {
            crate::image::codec::validate(image.panel, &image.bitmap)?;
            let mut bitmap = image.bitmap.clone();
            if !image.adjustment.is_identity() {
                adjust(&mut bitmap, image.adjustment);
            }
            if image.dither {
                dither_for_panel(&mut bitmap, image.panel);
            }
            let payload = encode(image.panel, &bitmap)?;
            let frame = Frame::image(&payload, image.page, image.refresh)?;
            debug!(
                "Prepared {} image: {} bytes, {} blocks",
                image.panel,
                frame.len(),
                frame.total_blocks()
            );
            Ok(PreparedTask::Send(frame))
        }
        Task::FirmwareUpgrade { package, version } => Ok(PreparedTask::Firmware {
            frame: Frame::firmware(package)?,
            version: version.clone(),
        }),
        Task::CheckStatus => Ok(PreparedTask::CheckStatus),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{ImageError, Rgb};
    use crate::protocol::FrameError;

    #[test]
    fn test_prepare_image() {
        let panel = PanelType::Epd250;
        let task = Task::PushImage(ImageTask::new(
            panel,
            Bitmap::filled(panel.width(), panel.height(), Rgb::WHITE),
        ));
        match prepare(&task).expect("prepare") {
            PreparedTask::Send(frame) => assert_eq!(frame.total_blocks(), 20),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_prepare_rejects_wrong_size() {
        let task = Task::PushImage(ImageTask::new(
            PanelType::Epd250,
            Bitmap::filled(10, 8, Rgb::WHITE),
        ));
        assert!(matches!(
            prepare(&task),
            Err(EpdError::Image(ImageError::DimensionMismatch { .. }))
        ));
    }

    #[test]
    fn test_prepare_rejects_empty_firmware() {
        let task = Task::FirmwareUpgrade {
            package: Vec::new(),
            version: "2.0".to_string(),
        };
        assert_eq!(
            prepare(&task),
            Err(EpdError::Frame(FrameError::EmptyPayload))
        );
    }
}
