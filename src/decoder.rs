//! BitFrame decoding: raw byte to ordered bit vector to step value.
//!
//! Bits are read least-significant first, matching the PLC register layout: element
//! `0` of a [`BitVector`] is bit 0 of the byte. The step value reads the vector back
//! as an unsigned binary number in the same order, so for any width the value equals
//! `byte & mask(width)`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Widest frame a single byte can carry.
pub const MAX_WIDTH: u8 = 8;

/// Decoding precondition failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The declared bit width is outside `1..=8`.
    #[error("bit width {0} is out of range (expected 1..=8)")]
    WidthOutOfRange(u8),
}

/// Validated bit width of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BitWidth(u8);

impl BitWidth {
    /// Validate a declared width.
    pub fn new(width: u8) -> Result<Self, DecodeError> {
        if (1..=MAX_WIDTH).contains(&width) {
            Ok(Self(width))
        } else {
            Err(DecodeError::WidthOutOfRange(width))
        }
    }

    /// Number of bits in a frame.
    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<usize> for BitWidth {
    type Error = DecodeError;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        let width = u8::try_from(value).map_err(|_| DecodeError::WidthOutOfRange(u8::MAX))?;
        Self::new(width)
    }
}

/// Ordered, fixed-width sequence of flags decoded from one byte.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BitVector {
    bits: Vec<bool>,
}

impl BitVector {
    /// Flags in LSB-first order.
    pub fn bits(&self) -> &[bool] {
        &self.bits
    }

    /// Frame width.
    pub fn width(&self) -> usize {
        self.bits.len()
    }

    /// Interpret the flags as an unsigned binary number, LSB first.
    pub fn step_value(&self) -> u32 {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, bit)| **bit)
            .fold(0u32, |acc, (index, _)| acc | (1 << index))
    }

    /// Textual form stored with each step (`[false,true,...]`).
    pub fn pattern(&self) -> String {
        let flags: Vec<&str> = self
            .bits
            .iter()
            .map(|bit| if *bit { "true" } else { "false" })
            .collect();
        format!("[{}]", flags.join(","))
    }
}

impl std::fmt::Display for BitVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for bit in &self.bits {
            f.write_str(if *bit { "1" } else { "0" })?;
        }
        Ok(())
    }
}

/// Extract `width` flags from `byte`, LSB first.
pub fn decode(byte: u8, width: BitWidth) -> BitVector {
    let bits = (0..width.get()).map(|index| byte & (1 << index) != 0).collect();
    BitVector { bits }
}

/// Decode a byte straight to its step value.
pub fn step_value(byte: u8, width: BitWidth) -> u32 {
    decode(byte, width).step_value()
}
