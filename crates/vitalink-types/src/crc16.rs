//! CRC-16/CCITT packet checksums.
//!
//! Polynomial `0x1021`, MSB first, no reflection, no final XOR. The initial
//! register value and the bytes excluded at either end of the frame are
//! configurable because vendors differ on both.

use crc::{Algorithm, Crc};

/// CRC-16/CCITT-FALSE with the register preset to `0xFFFF`.
const CCITT: Crc<u16> = Crc::<u16>::new(&Algorithm {
    width: 16,
    poly: 0x1021,
    init: 0xFFFF,
    refin: false,
    refout: false,
    xorout: 0x0000,
    check: 0x29B1,
    residue: 0x0000,
});

/// Width of the checksum trailer in bytes.
pub const CHECKSUM_LEN: usize = 2;

/// How a checksum is computed over a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Crc16Options {
    /// Initial register value.
    pub initial: u16,
    /// Number of leading bytes excluded from the computation (e.g. a header byte).
    pub skip_leading: usize,
    /// Number of trailing bytes excluded from the computation.
    pub skip_trailing: usize,
}

impl Default for Crc16Options {
    fn default() -> Self {
        Self {
            initial: 0xFFFF,
            skip_leading: 0,
            skip_trailing: 0,
        }
    }
}

impl Crc16Options {
    /// Create options with the default `0xFFFF` preset and no skipped bytes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial register value.
    #[must_use]
    pub fn initial(mut self, initial: u16) -> Self {
        self.initial = initial;
        self
    }

    /// Exclude `count` leading bytes.
    #[must_use]
    pub fn skip_leading(mut self, count: usize) -> Self {
        self.skip_leading = count;
        self
    }

    /// Exclude `count` trailing bytes.
    #[must_use]
    pub fn skip_trailing(mut self, count: usize) -> Self {
        self.skip_trailing = count;
        self
    }

    /// The slice of `bytes` the checksum covers. Empty when the skips overlap.
    fn covered<'a>(&self, bytes: &'a [u8]) -> &'a [u8] {
        let end = bytes.len().saturating_sub(self.skip_trailing);
        if self.skip_leading >= end {
            &[]
        } else {
            &bytes[self.skip_leading..end]
        }
    }
}

/// Compute the checksum of `bytes`.
///
/// # Examples
///
/// ```
/// use vitalink_types::crc16::{self, Crc16Options};
///
/// let crc = crc16::compute(&[0x05, 0x02, 0x03], &Crc16Options::default());
/// assert_eq!(crc, 0x716D);
/// assert_eq!(crc.to_le_bytes(), [0x6D, 0x71]);
/// ```
#[must_use]
pub fn compute(bytes: &[u8], options: &Crc16Options) -> u16 {
    let mut digest = CCITT.digest_with_initial(options.initial);
    digest.update(options.covered(bytes));
    digest.finalize()
}

/// Verify a frame whose final two bytes carry the checksum, little-endian.
///
/// The checksum bytes themselves are always excluded, so the effective
/// trailing skip is at least [`CHECKSUM_LEN`]. Frames too short to hold a
/// checksum fail verification.
#[must_use]
pub fn verify(framed: &[u8], options: &Crc16Options) -> bool {
    if framed.len() < CHECKSUM_LEN + options.skip_leading {
        return false;
    }
    let split = framed.len() - CHECKSUM_LEN;
    let expected = u16::from_le_bytes([framed[split], framed[split + 1]]);
    let options = Crc16Options {
        skip_trailing: options.skip_trailing.max(CHECKSUM_LEN),
        ..*options
    };
    compute(framed, &options) == expected
}

/// Append the little-endian checksum of `payload` (computed with `options`).
///
/// Skips apply to `payload` as given, before the trailer is added.
#[must_use]
pub fn seal(payload: &[u8], options: &Crc16Options) -> Vec<u8> {
    let mut framed = Vec::with_capacity(payload.len() + CHECKSUM_LEN);
    framed.extend_from_slice(payload);
    framed.extend_from_slice(&compute(payload, options).to_le_bytes());
    framed
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn sealed_frames_verify(payload: Vec<u8>, initial: u16) {
            let options = Crc16Options::new().initial(initial);
            prop_assert!(verify(&seal(&payload, &options), &options));
        }

        #[test]
        fn single_bit_flip_is_detected(
            payload in proptest::collection::vec(any::<u8>(), 1..64),
            bit in 0usize..512,
        ) {
            let options = Crc16Options::default();
            let mut framed = seal(&payload, &options);
            let bit = bit % (payload.len() * 8);
            framed[bit / 8] ^= 1 << (bit % 8);
            prop_assert!(!verify(&framed, &options));
        }
    }
}
