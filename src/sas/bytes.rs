// SPDX-License-Identifier: MIT OR Apache-2.0

//! Packing of the 6 derived bytes into the human-comparable short codes.
//!
//! The bit layouts are copied from the reference algorithm of the Matrix specification and must
//! be preserved exactly; any deviation breaks interoperability with other implementations.
use crate::crypto::SAS_BYTES_LEN;
use crate::sas::emoji::{SasEmoji, sas_emoji};

/// Both presentation forms of one derived short authentication string.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SasCodes {
    /// Three decimal values in `1000..=9191`.
    pub decimal: [u16; 3],
    /// Seven emoji from the fixed 64-entry table.
    pub emoji: [SasEmoji; 7],
}

impl SasCodes {
    pub fn from_bytes(bytes: &[u8; SAS_BYTES_LEN]) -> Self {
        Self {
            decimal: decimals(bytes),
            emoji: emoji_indices(bytes).map(sas_emoji),
        }
    }
}

/// Three 13-bit windows at bit offsets 0, 13 and 26 (most-significant-bit first), each `+1000`.
fn decimals(b: &[u8; SAS_BYTES_LEN]) -> [u16; 3] {
    [
        ((u16::from(b[0]) << 5) | (u16::from(b[1]) >> 3)) + 1000,
        (((u16::from(b[1]) & 0x07) << 10) | (u16::from(b[2]) << 2) | (u16::from(b[3]) >> 6))
            + 1000,
        (((u16::from(b[3]) & 0x3f) << 7) | (u16::from(b[4]) >> 1)) + 1000,
    ]
}

/// Seven 6-bit windows over the 42-bit prefix of the derived bytes.
fn emoji_indices(b: &[u8; SAS_BYTES_LEN]) -> [u8; 7] {
    [
        b[0] >> 2,
        ((b[0] & 0x03) << 4) | (b[1] >> 4),
        ((b[1] & 0x0f) << 2) | (b[2] >> 6),
        b[2] & 0x3f,
        b[3] >> 2,
        ((b[3] & 0x03) << 4) | (b[4] >> 4),
        ((b[4] & 0x0f) << 2) | (b[5] >> 6),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_zero_bytes() {
        let codes = SasCodes::from_bytes(&[0; 6]);
        assert_eq!(codes.decimal, [1000, 1000, 1000]);
        for emoji in codes.emoji {
            assert_eq!(emoji.description, "Dog");
        }
    }

    #[test]
    fn all_one_bytes_hit_the_upper_bounds() {
        let codes = SasCodes::from_bytes(&[0xff; 6]);
        // 13 bits of ones is 8191.
        assert_eq!(codes.decimal, [9191, 9191, 9191]);
        for emoji in codes.emoji {
            assert_eq!(emoji.description, "Pin");
        }
    }

    #[test]
    fn reference_vector() {
        let bytes = [0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc];
        assert_eq!(decimals(&bytes), [1582, 5441, 8245]);
        assert_eq!(emoji_indices(&bytes), [4, 35, 17, 22, 30, 9, 42]);
    }

    #[test]
    fn derivation_is_deterministic() {
        let bytes = [7, 21, 99, 140, 203, 250];
        assert_eq!(SasCodes::from_bytes(&bytes), SasCodes::from_bytes(&bytes));
    }
}
