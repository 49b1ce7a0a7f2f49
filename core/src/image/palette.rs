//! RGB colors, fixed panel palettes and nearest-color lookup.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 24-bit RGB color
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const WHITE: Rgb = Rgb::new(255, 255, 255);
    pub const BLACK: Rgb = Rgb::new(0, 0, 0);
    pub const RED: Rgb = Rgb::new(255, 0, 0);
    pub const GREEN: Rgb = Rgb::new(0, 255, 0);
    pub const BLUE: Rgb = Rgb::new(0, 0, 255);
    pub const YELLOW: Rgb = Rgb::new(255, 255, 0);
    pub const ORANGE: Rgb = Rgb::new(255, 128, 0);

    /// Create a color from its channels
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Squared Euclidean distance in RGB space
    pub fn distance_squared(&self, other: &Rgb) -> u32 {
        let dr = self.r as i32 - other.r as i32;
        let dg = self.g as i32 - other.g as i32;
        let db = self.b as i32 - other.b as i32;
        (dr * dr + dg * dg + db * db) as u32
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

/// Black/white panels
pub const BW: [Rgb; 2] = [Rgb::WHITE, Rgb::BLACK];

/// Black/white/red panels
pub const BWR: [Rgb; 3] = [Rgb::WHITE, Rgb::BLACK, Rgb::RED];

/// Seven-color (ACeP) panels, in the order used for nearest-color ties
pub const SEVEN_COLOR: [Rgb; 7] = [
    Rgb::BLACK,
    Rgb::BLUE,
    Rgb::GREEN,
    Rgb::RED,
    Rgb::ORANGE,
    Rgb::YELLOW,
    Rgb::WHITE,
];

/// 16-level grayscale ramp (0x00, 0x11, ..., 0xFF)
#[cfg(test)]
const GRAYSCALE: [Rgb; 16] = {
    let mut levels = [Rgb::BLACK; 16];
    let mut i = 0;
    while i < 16 {
        let v = (i * 17) as u8;
        levels[i] = Rgb::new(v, v, v);
        i += 1;
    }
    levels
};

/// Index of the palette entry closest to `color`.
///
/// Ties resolve to the first-listed entry. Returns 0 for an empty palette.
pub fn nearest_index(color: Rgb, palette: &[Rgb]) -> usize {
    let mut best_index = 0;
    let mut best_distance = u32::MAX;
    for (index, candidate) in palette.iter().enumerate() {
        let distance = color.distance_squared(candidate);
        if distance < best_distance {
            best_distance = distance;
            best_index = index;
        }
    }
    best_index
}

/// Palette entry closest to `color`; `color` itself when the palette is empty
pub fn nearest_color(color: Rgb, palette: &[Rgb]) -> Rgb {
    palette
        .get(nearest_index(color, palette))
        .copied()
        .unwrap_or(color)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match_is_nearest() {
        for (i, color) in SEVEN_COLOR.iter().enumerate() {
            assert_eq!(nearest_index(*color, &SEVEN_COLOR), i);
        }
    }

    #[test]
    fn test_nearest_bw() {
        assert_eq!(nearest_color(Rgb::new(200, 210, 190), &BW), Rgb::WHITE);
        assert_eq!(nearest_color(Rgb::new(40, 20, 60), &BW), Rgb::BLACK);
    }

    #[test]
    fn test_tie_resolves_to_first_entry() {
        let palette = [Rgb::new(0, 0, 10), Rgb::new(0, 0, 30)];
        assert_eq!(nearest_index(Rgb::new(0, 0, 20), &palette), 0);
    }

    #[test]
    fn test_bwr_red_detection() {
        assert_eq!(nearest_color(Rgb::new(230, 30, 20), &BWR), Rgb::RED);
    }

    #[test]
    fn test_grayscale_ramp() {
        assert_eq!(GRAYSCALE[0], Rgb::BLACK);
        assert_eq!(GRAYSCALE[1], Rgb::new(17, 17, 17));
        assert_eq!(GRAYSCALE[15], Rgb::WHITE);
    }

    #[test]
    fn test_empty_palette_returns_input() {
        let c = Rgb::new(1, 2, 3);
        assert_eq!(nearest_color(c, &[]), c);
    }
}
