//! Core numeric types for share and block validation
//!
//! Hashes and targets are 256-bit values in little-endian byte order, the
//! order in which double SHA-256 leaves a block header hash.

use crate::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::io::Cursor;

/// Difficulty-1 target mantissa (`0x00000000ffff0000...`) expressed as `0xffff * 2^208`
const DIFF1_MANTISSA: f64 = 65535.0;
const DIFF1_SHIFT: i32 = 208;

/// Sentinel difficulty used before the pool sends `mining.set_difficulty`
///
/// Large enough that no candidate is ever reported against it.
pub const DIFFICULTY_UNSET: f64 = u32::MAX as f64;

/// Threshold a hash must fall below, as a 256-bit little-endian integer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Target {
    /// Four 64-bit words, least significant first
    words: [u64; 4],
}

impl Target {
    /// Create a target from four little-endian words
    pub fn new(words: [u64; 4]) -> Self {
        Self { words }
    }

    /// Create a target from 32 little-endian bytes
    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 32 {
            return Err(Error::internal(
                "target",
                format!("expected 32 bytes, got {}", bytes.len()),
            ));
        }

        let mut cursor = Cursor::new(bytes);
        let words = [
            cursor.read_u64::<LittleEndian>()?,
            cursor.read_u64::<LittleEndian>()?,
            cursor.read_u64::<LittleEndian>()?,
            cursor.read_u64::<LittleEndian>()?,
        ];
        Ok(Self::new(words))
    }

    /// Serialize to 32 little-endian bytes
    pub fn to_le_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        for (chunk, word) in bytes.chunks_exact_mut(8).zip(self.words.iter()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    /// Decode the compact `nBits` representation used in block headers
    pub fn from_compact(bits: u32) -> Self {
        let exponent = (bits >> 24) as usize;
        let mantissa = bits & 0x007f_ffff;

        // Sign bit set means a negative target, which nothing can meet
        if bits & 0x0080_0000 != 0 || mantissa == 0 {
            return Self::min();
        }

        let mut bytes = [0u8; 32];
        if exponent <= 3 {
            let value = mantissa >> (8 * (3 - exponent));
            bytes[..4].copy_from_slice(&value.to_le_bytes());
        } else {
            for (i, byte) in mantissa.to_le_bytes()[..3].iter().enumerate() {
                let pos = exponent - 3 + i;
                if pos < 32 {
                    bytes[pos] = *byte;
                }
            }
        }

        let mut words = [0u64; 4];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut array = [0u8; 8];
            array.copy_from_slice(chunk);
            *word = u64::from_le_bytes(array);
        }
        Self::new(words)
    }

    /// True when `hash`, read as a little-endian integer, is strictly below this target
    pub fn is_met_by(&self, hash: &[u8; 32]) -> bool {
        compare_le(hash, &self.to_le_bytes()) == Ordering::Less
    }

    /// Zero target (nothing meets it)
    pub fn min() -> Self {
        Self::new([0; 4])
    }

    /// Big-endian hex for display
    pub fn to_hex_be(&self) -> String {
        format!(
            "{:016x}{:016x}{:016x}{:016x}",
            self.words[3], self.words[2], self.words[1], self.words[0]
        )
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex_be())
    }
}

/// Compare two 256-bit little-endian integers
pub fn compare_le(a: &[u8; 32], b: &[u8; 32]) -> Ordering {
    for i in (0..32).rev() {
        match a[i].cmp(&b[i]) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Share difficulty of a little-endian hash (`diff1 / hash`)
///
/// A zero hash has unbounded difficulty and reports `f64::MAX`.
pub fn difficulty_of(hash: &[u8; 32]) -> f64 {
    let value = hash
        .iter()
        .rev()
        .fold(0.0f64, |acc, byte| acc * 256.0 + f64::from(*byte));

    if value == 0.0 {
        return f64::MAX;
    }
    DIFF1_MANTISSA * 2f64.powi(DIFF1_SHIFT) / value
}

/// Hash rate in hashes per second
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct HashRate(pub f64);

impl HashRate {
    /// Create from hashes per second
    pub fn new(rate: f64) -> Self {
        Self(rate)
    }

    /// Create from thousands of hashes per second
    pub fn from_khs(khs: f64) -> Self {
        Self(khs * 1_000.0)
    }

    /// Hashes per second
    pub fn value(&self) -> f64 {
        self.0
    }

    /// Thousands of hashes per second
    pub fn khs(&self) -> f64 {
        self.0 / 1_000.0
    }
}

impl fmt::Display for HashRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1_000_000_000_000.0 {
            write!(f, "{:.2} TH/s", self.0 / 1_000_000_000_000.0)
        } else if self.0 >= 1_000_000_000.0 {
            write!(f, "{:.2} GH/s", self.0 / 1_000_000_000.0)
        } else if self.0 >= 1_000_000.0 {
            write!(f, "{:.2} MH/s", self.0 / 1_000_000.0)
        } else if self.0 >= 1_000.0 {
            write!(f, "{:.2} kH/s", self.0 / 1_000.0)
        } else {
            write!(f, "{:.2} H/s", self.0)
        }
    }
}
