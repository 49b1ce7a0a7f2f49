//! Image pipeline: bitmap model, preprocessing, and the per-panel codecs.

pub mod adjust;
pub mod bitmap;
pub mod codec;
pub mod dither;
pub mod palette;
pub mod panel;

pub use adjust::{adjust, Adjustment};
pub use bitmap::Bitmap;
pub use codec::{encode, encode_bw, encode_bwr, encode_seven_color, seven_color_code};
pub use dither::{dither, dither_for_panel};
pub use palette::{nearest_color, nearest_index, Rgb};
pub use panel::{ColorModel, PanelType, DEVICE_NAME_PREFIX};

use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageError {
    #[error(
        "Bitmap is {width}x{height}, panel expects {expected_width}x{expected_height}"
    )]
    DimensionMismatch {
        expected_width: u32,
        expected_height: u32,
        width: u32,
        height: u32,
    },
    #[error("Pixel buffer has {actual} bytes, expected {expected}")]
    BufferSize { expected: usize, actual: usize },
    #[error("Height {0} is not a multiple of 8")]
    UnalignedHeight(u32),
    #[error("Invalid PPM: {0}")]
    InvalidPpm(String),
}
