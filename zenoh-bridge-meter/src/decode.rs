//! Multi-word register decoding.
//!
//! Registers wider than 16 bits are transferred as consecutive words, most
//! significant word first. Byte order inside a word is handled by the
//! transport; only word order matters here.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Word counts the decoder accepts (16, 32 and 64 bit values).
pub const SUPPORTED_WORD_COUNTS: [usize; 3] = [1, 2, 4];

/// Decoding errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unsupported register width: {0} words (expected 1, 2 or 4)")]
    UnsupportedWidth(usize),
}

/// A decoded register value, keeping the descriptor's signedness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Signed(i64),
    Unsigned(u64),
}

impl RawValue {
    /// Lossy conversion used by the scaling stage.
    pub fn as_f64(&self) -> f64 {
        match *self {
            RawValue::Signed(v) => v as f64,
            RawValue::Unsigned(v) => v as f64,
        }
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawValue::Signed(v) => write!(f, "{}", v),
            RawValue::Unsigned(v) => write!(f, "{}", v),
        }
    }
}

/// Whether a register of `words` 16-bit words can be decoded.
pub fn is_supported_width(words: usize) -> bool {
    SUPPORTED_WORD_COUNTS.contains(&words)
}

/// Combine big-endian words into one integer.
///
/// With `signed` set, the top bit of the full `16 * words.len()` width is the
/// sign bit (two's complement).
pub fn combine_words(words: &[u16], signed: bool) -> Result<RawValue, DecodeError> {
    let count = words.len();
    if !is_supported_width(count) {
        return Err(DecodeError::UnsupportedWidth(count));
    }

    let value = words
        .iter()
        .fold(0u64, |acc, &word| (acc << 16) | u64::from(word));

    if !signed {
        return Ok(RawValue::Unsigned(value));
    }

    let bits = 16 * count as u32;
    let sign_bit = 1u64 << (bits - 1);

    // At 64 bits the `as` cast already reinterprets the sign bit.
    let signed_value = if value & sign_bit != 0 && bits < 64 {
        value as i64 - (1i64 << bits)
    } else {
        value as i64
    };

    Ok(RawValue::Signed(signed_value))
}
