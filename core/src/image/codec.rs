//! Bitmap to panel wire format.
//!
//! BW and BWR panels are column-packed: columns left to right, and inside a
//! column rows from the bottom upward in groups of 8, the first row of a group
//! in the most significant bit. Seven-color panels are row-major with two
//! 4-bit slots per byte, the left pixel in the high nibble.

use super::bitmap::Bitmap;
use super::palette::{nearest_color, nearest_index, Rgb, BW, BWR, SEVEN_COLOR};
use super::panel::{ColorModel, PanelType};
use super::ImageError;

/// Seven-color codes understood by the panel controller
const SEVEN_COLOR_CODES: [(Rgb, u8); 7] = [
    (Rgb::BLACK, 0b000),
    (Rgb::WHITE, 0b001),
    (Rgb::GREEN, 0b010),
    (Rgb::BLUE, 0b011),
    (Rgb::RED, 0b100),
    (Rgb::YELLOW, 0b101),
    (Rgb::ORANGE, 0b110),
];

const BWR_WHITE: usize = 0;
const BWR_RED: usize = 2;

/// Check that `bitmap` covers the panel exactly
pub fn validate(panel: PanelType, bitmap: &Bitmap) -> Result<(), ImageError> {
    if bitmap.width() != panel.width() || bitmap.height() != panel.height() {
        return Err(ImageError::DimensionMismatch {
            expected_width: panel.width(),
            expected_height: panel.height(),
            width: bitmap.width(),
            height: bitmap.height(),
        });
    }
    Ok(())
}

/// Encode a full-screen bitmap for `panel`
pub fn encode(panel: PanelType, bitmap: &Bitmap) -> Result<Vec<u8>, ImageError> {
    validate(panel, bitmap)?;
    match panel.color_model() {
        ColorModel::Bw => encode_bw(bitmap),
        ColorModel::Bwr => encode_bwr(bitmap),
        ColorModel::SevenColor => Ok(encode_seven_color(bitmap)),
    }
}

/// 1bpp, bit set for pixels whose nearest BW color is white
pub fn encode_bw(bitmap: &Bitmap) -> Result<Vec<u8>, ImageError> {
    let planes = pack_columns(bitmap, |px| (nearest_index(px, &BW) == 0, false))?;
    Ok(planes.white)
}

/// White plane followed by red plane, each 1bpp
pub fn encode_bwr(bitmap: &Bitmap) -> Result<Vec<u8>, ImageError> {
    let planes = pack_columns(bitmap, |px| match nearest_index(px, &BWR) {
        BWR_WHITE => (true, false),
        BWR_RED => (false, true),
        _ => (false, false),
    })?;
    let mut out = planes.white;
    out.extend_from_slice(&planes.red);
    Ok(out)
}

/// Two 3-bit color codes per byte, row-major.
///
/// An odd trailing pixel in a row occupies the high nibble of its own byte,
/// low nibble zero. Every catalog panel has an even width, so panel-sized
/// bitmaps never hit this case; it only applies to ad-hoc bitmaps.
pub fn encode_seven_color(bitmap: &Bitmap) -> Vec<u8> {
    let mut out = Vec::with_capacity(bitmap.pixels().len().div_ceil(2));
    for row in bitmap.rows() {
        for pair in row.chunks(2) {
            let mut byte = 0u8;
            for (k, px) in pair.iter().enumerate() {
                byte |= seven_color_code(*px) << ((1 - k) * 4);
            }
            out.push(byte);
        }
    }
    out
}

/// Panel code for a color: exact primaries map directly, anything else is
/// snapped to the nearest seven-color entry first.
pub fn seven_color_code(color: Rgb) -> u8 {
    exact_code(color)
        .or_else(|| exact_code(nearest_color(color, &SEVEN_COLOR)))
        .unwrap_or(0b001)
}

fn exact_code(color: Rgb) -> Option<u8> {
    SEVEN_COLOR_CODES
        .iter()
        .find(|(c, _)| *c == color)
        .map(|(_, code)| *code)
}

struct Planes {
    white: Vec<u8>,
    red: Vec<u8>,
}

fn pack_columns(
    bitmap: &Bitmap,
    mut classify: impl FnMut(Rgb) -> (bool, bool),
) -> Result<Planes, ImageError> {
    let width = bitmap.width() as usize;
    let height = bitmap.height() as usize;
    if height % 8 != 0 {
        return Err(ImageError::UnalignedHeight(bitmap.height()));
    }
    let pixels = bitmap.pixels();
    let plane_len = width * height / 8;
    let mut planes = Planes {
        white: Vec::with_capacity(plane_len),
        red: Vec::with_capacity(plane_len),
    };

    for x in 0..width {
        for group in (0..height / 8).rev() {
            let bottom = group * 8 + 7;
            let mut white = 0u8;
            let mut red = 0u8;
            for k in 0..8 {
                let (is_white, is_red) = classify(pixels[(bottom - k) * width + x]);
                if is_white {
                    white |= 1 << (7 - k);
                } else if is_red {
                    red |= 1 << (7 - k);
                }
            }
            planes.white.push(white);
            planes.red.push(red);
        }
    }
    Ok(planes)
}
