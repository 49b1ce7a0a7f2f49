//! Static catalog of supported EPD panels.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix the devices use in their advertised name, followed by the panel name
pub const DEVICE_NAME_PREFIX: &str = "Advantech_";

/// Pixel encoding a panel expects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColorModel {
    /// 1 bit per pixel, black/white
    Bw,
    /// Two 1bpp planes, black/white plus red
    Bwr,
    /// 3-bit codes, two pixels per byte
    SevenColor,
}

/// Known panel models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PanelType {
    #[serde(rename = "EPD-250")]
    Epd250,
    #[serde(rename = "EPD-252")]
    Epd252,
    #[serde(rename = "EPD-353")]
    Epd353,
}

impl PanelType {
    /// Every catalog entry, ordered by id
    pub const ALL: [PanelType; 3] = [PanelType::Epd250, PanelType::Epd252, PanelType::Epd353];

    pub fn id(&self) -> u8 {
        match self {
            PanelType::Epd250 => 0,
            PanelType::Epd252 => 1,
            PanelType::Epd353 => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PanelType::Epd250 => "EPD-250",
            PanelType::Epd252 => "EPD-252",
            PanelType::Epd353 => "EPD-353",
        }
    }

    pub fn width(&self) -> u32 {
        match self {
            PanelType::Epd250 | PanelType::Epd252 => 296,
            PanelType::Epd353 => 600,
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            PanelType::Epd250 | PanelType::Epd252 => 128,
            PanelType::Epd353 => 448,
        }
    }

    pub fn color_model(&self) -> ColorModel {
        match self {
            PanelType::Epd250 => ColorModel::Bw,
            PanelType::Epd252 => ColorModel::Bwr,
            PanelType::Epd353 => ColorModel::SevenColor,
        }
    }

    /// Size in bytes of an encoded full-screen image
    pub fn encoded_len(&self) -> usize {
        let pixels = self.width() as usize * self.height() as usize;
        match self.color_model() {
            ColorModel::Bw => pixels / 8,
            ColorModel::Bwr => pixels / 4,
            ColorModel::SevenColor => pixels.div_ceil(2),
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.id() == id)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(name))
    }

    /// Resolve the panel from an advertised name such as `Advantech_EPD-250`
    pub fn from_device_name(device_name: &str) -> Option<Self> {
        let (_, panel) = device_name.split_once(DEVICE_NAME_PREFIX)?;
        Self::from_name(panel)
    }
}

impl fmt::Display for PanelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}x{})", self.name(), self.width(), self.height())
    }
}

impl FromStr for PanelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| format!("Unknown panel type: {}", s))
    }
}
