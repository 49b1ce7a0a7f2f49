//! Saturation / brightness / contrast preprocessing.
//!
//! Colors go through HSV with saturation and value expressed in percent
//! (0..=100) and hue in whole degrees, the same integer rounding the panel
//! vendor tooling applies, so previews match what the device shows.

use serde::{Deserialize, Serialize};

use super::bitmap::Bitmap;
use super::palette::Rgb;

/// Relative adjustments in percent; `0.0` leaves a channel unchanged
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Adjustment {
    pub saturation: f64,
    pub brightness: f64,
    pub contrast: f64,
}

impl Adjustment {
    pub fn is_identity(&self) -> bool {
        self.saturation == 0.0 && self.brightness == 0.0 && self.contrast == 0.0
    }
}

/// Apply `adjustment` to every pixel of `bitmap`
pub fn adjust(bitmap: &mut Bitmap, adjustment: Adjustment) {
    if adjustment.is_identity() {
        return;
    }
    for px in bitmap.pixels_mut() {
        *px = adjust_pixel(*px, adjustment);
    }
}

fn adjust_pixel(px: Rgb, adjustment: Adjustment) -> Rgb {
    let saturation = 1.0 + adjustment.saturation / 100.0;
    let brightness = 1.0 + adjustment.brightness / 100.0;
    let contrast = 1.0 + adjustment.contrast / 100.0;

    let (h, s, v) = rgb_to_hsv(px);
    let s = (s * saturation).clamp(0.0, 100.0);
    let v = (v * brightness).clamp(0.0, 100.0);
    let shifted = hsv_to_rgb(h, s, v);

    let stretch = |c: u8| {
        let centered = (c as f64 / 255.0 - 0.5) * contrast;
        ((centered + 0.5) * 255.0).clamp(0.0, 255.0) as u8
    };
    Rgb::new(stretch(shifted.r), stretch(shifted.g), stretch(shifted.b))
}

/// Hue in degrees, saturation and value in percent, all rounded
pub fn rgb_to_hsv(px: Rgb) -> (f64, f64, f64) {
    let (r, g, b) = (px.r as f64, px.g as f64, px.b as f64);
    let max = r.max(g).max(b);
    let delta = max - r.min(g).min(b);
    let v = (max * 100.0 / 255.0).round();
    if max == 0.0 {
        return (0.0, 0.0, v);
    }
    let s = (delta * 100.0 / max).round();
    if delta == 0.0 {
        return (0.0, s, v);
    }
    let sector = if max == r {
        (g - b) / delta
    } else if max == g {
        (b - r) / delta + 2.0
    } else {
        (r - g) / delta + 4.0
    };
    let mut h = (sector * 60.0).round().min(360.0);
    if h < 0.0 {
        h += 360.0;
    }
    (h, s, v)
}

/// Inverse of [`rgb_to_hsv`]
pub fn hsv_to_rgb(h: f64, s: f64, v: f64) -> Rgb {
    let s = s / 100.0;
    let v = v / 100.0;
    let level = (v * 255.0).round();
    if s <= 0.0 {
        let l = level as u8;
        return Rgb::new(l, l, l);
    }

    let mut h = h / 360.0;
    if h >= 1.0 {
        h = 0.0;
    }
    let h = h * 6.0;
    let f = h - h.floor();
    let p = (v * 255.0 * (1.0 - s)).round();
    let q = (v * 255.0 * (1.0 - s * f)).round();
    let t = (v * 255.0 * (1.0 - s * (1.0 - f))).round();

    let (r, g, b) = match h.floor() as u8 {
        0 => (level, t, p),
        1 => (q, level, p),
        2 => (p, level, t),
        3 => (p, q, level),
        4 => (t, p, level),
        _ => (level, p, q),
    };
    Rgb::new(r as u8, g as u8, b as u8)
}
