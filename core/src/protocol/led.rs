//! LED-control byte.

use serde::{Deserialize, Serialize};
use std::fmt;

const LED_ON: u8 = 0b11;
const LED_OFF: u8 = 0b10;

/// State of the three indicator LEDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LedState {
    pub led1: bool,
    pub led2: bool,
    pub led3: bool,
}

impl LedState {
    pub fn new(led1: bool, led2: bool, led3: bool) -> Self {
        Self { led1, led2, led3 }
    }

    /// `led3 << 4 | led2 << 2 | led1`, each field 0b11 on / 0b10 off
    pub fn to_byte(&self) -> u8 {
        let field = |on: bool| if on { LED_ON } else { LED_OFF };
        field(self.led3) << 4 | field(self.led2) << 2 | field(self.led1)
    }

    /// Decode a value read from LED-control; a field reads as on only when it is 0b11
    pub fn from_byte(byte: u8) -> Self {
        let field = |shift: u8| (byte >> shift) & 0b11 == LED_ON;
        Self {
            led1: field(0),
            led2: field(2),
            led3: field(4),
        }
    }
}

impl fmt::Display for LedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = |on: bool| if on { "on" } else { "off" };
        write!(f, "{} {} {}", s(self.led1), s(self.led2), s(self.led3))
    }
}
