//! Floyd-Steinberg error diffusion onto a fixed palette.

use super::bitmap::Bitmap;
use super::palette::{nearest_color, Rgb, BW, BWR, SEVEN_COLOR};
use super::panel::{ColorModel, PanelType};

/// Neighbour offsets and weights (in sixteenths)
const DIFFUSION: [(i64, i64, i32); 4] = [(1, 0, 7), (1, 1, 1), (0, 1, 5), (-1, 1, 3)];

/// Palette matching a panel's color model
pub fn palette_for(panel: PanelType) -> &'static [Rgb] {
    match panel.color_model() {
        ColorModel::Bw => &BW,
        ColorModel::Bwr => &BWR,
        ColorModel::SevenColor => &SEVEN_COLOR,
    }
}

/// Dither in place onto the palette of `panel`
pub fn dither_for_panel(bitmap: &mut Bitmap, panel: PanelType) {
    dither(bitmap, palette_for(panel));
}

/// Quantize every pixel to `palette`, pushing the error to unvisited neighbours.
///
/// Pixels are visited row by row, left to right. The error share uses an
/// arithmetic shift, so negative errors round toward negative infinity.
pub fn dither(bitmap: &mut Bitmap, palette: &[Rgb]) {
    if palette.is_empty() {
        return;
    }
    let width = bitmap.width() as i64;
    let height = bitmap.height() as i64;

    for y in 0..height {
        for x in 0..width {
            let index = (y * width + x) as usize;
            let old = bitmap.pixels()[index];
            let new = nearest_color(old, palette);
            bitmap.pixels_mut()[index] = new;

            let err = [
                old.r as i32 - new.r as i32,
                old.g as i32 - new.g as i32,
                old.b as i32 - new.b as i32,
            ];
            for (dx, dy, weight) in DIFFUSION {
                let (nx, ny) = (x + dx, y + dy);
                if nx < 0 || nx >= width || ny >= height {
                    continue;
                }
                let target = (ny * width + nx) as usize;
                let px = &mut bitmap.pixels_mut()[target];
                *px = spread(*px, err, weight);
            }
        }
    }
}

fn spread(px: Rgb, err: [i32; 3], weight: i32) -> Rgb {
    let channel = |value: u8, e: i32| (value as i32 + ((e * weight) >> 4)).clamp(0, 255) as u8;
    Rgb::new(
        channel(px.r, err[0]),
        channel(px.g, err[1]),
        channel(px.b, err[2]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_only_uses_palette_colors() {
        let mut bitmap = Bitmap::from_fn(16, 16, |x, y| Rgb::new((x * 16) as u8, (y * 16) as u8, 90));
        dither(&mut bitmap, &BWR);
        assert!(bitmap.pixels().iter().all(|px| BWR.contains(px)));
    }

    #[test]
    fn test_mid_gray_mixes_black_and_white() {
        let mut bitmap = Bitmap::filled(8, 8, Rgb::new(128, 128, 128));
        dither(&mut bitmap, &BW);
        let whites = bitmap.pixels().iter().filter(|px| **px == Rgb::WHITE).count();
        assert!(whites > 16 && whites < 48, "whites = {}", whites);
    }

    #[test]
    fn test_palette_colors_are_stable() {
        let original = Bitmap::from_fn(6, 4, |x, _| SEVEN_COLOR[x as usize % 7]);
        let mut bitmap = original.clone();
        dither_for_panel(&mut bitmap, PanelType::Epd353);
        assert_eq!(bitmap, original);
    }

    #[test]
    fn test_negative_error_uses_arithmetic_shift() {
        // -1 * 7 >> 4 == -1, so the neighbour loses one level
        assert_eq!(spread(Rgb::new(10, 10, 10), [-1, 0, 0], 7), Rgb::new(9, 10, 10));
        assert_eq!(spread(Rgb::new(10, 10, 10), [1, 0, 0], 7), Rgb::new(10, 10, 10));
    }

    #[test]
    fn test_empty_palette_is_noop() {
        let original = Bitmap::filled(2, 2, Rgb::new(1, 2, 3));
        let mut bitmap = original.clone();
        dither(&mut bitmap, &[]);
        assert_eq!(bitmap, original);
    }
}
