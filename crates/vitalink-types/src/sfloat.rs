//! IEEE 11073-20601 16-bit short float (SFLOAT).
//!
//! An SFLOAT packs a 4-bit two's-complement base-10 exponent in the high
//! nibble and a 12-bit two's-complement mantissa in the remaining bits:
//!
//! ```text
//!  15      12 11                      0
//! +----------+-------------------------+
//! | exponent |        mantissa         |
//! +----------+-------------------------+
//! ```
//!
//! Five mantissa values are reserved for special values, which decode to
//! IEEE 754 sentinels rather than numbers.

use core::fmt;

/// Mantissa code for positive infinity.
pub const POSITIVE_INFINITY: u16 = 0x07FE;
/// Mantissa code for NaN ("not a number").
pub const NAN: u16 = 0x07FF;
/// Mantissa code for NRes ("not at this resolution"), decoded as NaN.
pub const NRES: u16 = 0x0800;
/// Reserved mantissa code, decoded as NaN.
pub const RESERVED: u16 = 0x0801;
/// Mantissa code for negative infinity.
pub const NEGATIVE_INFINITY: u16 = 0x0802;

/// Largest mantissa magnitude that is not a reserved code.
pub const MAX_MANTISSA: i32 = 2045;
/// Smallest exponent.
pub const MIN_EXPONENT: i32 = -8;
/// Largest exponent.
pub const MAX_EXPONENT: i32 = 7;

/// Largest finite magnitude an SFLOAT can hold.
pub const MAX_VALUE: f64 = 2045e7;

/// Decode a raw SFLOAT into an `f64`.
///
/// Reserved mantissas map to `+∞`, `-∞` or NaN regardless of the exponent.
///
/// # Examples
///
/// ```
/// use vitalink_types::sfloat;
///
/// assert_eq!(sfloat::decode(0x0078), 120.0);
/// assert_eq!(sfloat::decode(0xF4D3), 123.5);
/// assert_eq!(sfloat::decode(0x07FE), f64::INFINITY);
/// assert!(sfloat::decode(0x07FF).is_nan());
/// ```
#[must_use]
pub fn decode(raw: u16) -> f64 {
    let mantissa_bits = raw & 0x0FFF;
    match mantissa_bits {
        POSITIVE_INFINITY => return f64::INFINITY,
        NAN | NRES | RESERVED => return f64::NAN,
        NEGATIVE_INFINITY => return f64::NEG_INFINITY,
        _ => {}
    }

    let mantissa = sign_extend(mantissa_bits, 12);
    let exponent = sign_extend(raw >> 12, 4);

    // Dividing by a positive power keeps values like 0.1 exact after rounding.
    if exponent < 0 {
        f64::from(mantissa) / 10f64.powi(-exponent)
    } else {
        f64::from(mantissa) * 10f64.powi(exponent)
    }
}

/// Encode an `f64` into the closest representable SFLOAT.
///
/// Finite values saturate at ±[`MAX_VALUE`]. Among the exponents that keep the
/// mantissa within ±[`MAX_MANTISSA`], the one with the smallest absolute
/// error wins, preferring the finer exponent on ties. NaN and the infinities
/// map to their reserved codes.
///
/// # Examples
///
/// ```
/// use vitalink_types::sfloat;
///
/// assert_eq!(sfloat::decode(sfloat::encode(98.6)), 98.6);
/// assert_eq!(sfloat::encode(f64::NEG_INFINITY), 0x0802);
/// ```
#[must_use]
pub fn encode(value: f64) -> u16 {
    if value.is_nan() {
        return NAN;
    }
    if value == f64::INFINITY {
        return POSITIVE_INFINITY;
    }
    if value == f64::NEG_INFINITY {
        return NEGATIVE_INFINITY;
    }
    if value == 0.0 {
        return 0;
    }

    let value = value.clamp(-MAX_VALUE, MAX_VALUE);
    let mut best: Option<(i32, i32, f64)> = None;

    for exponent in MIN_EXPONENT..=MAX_EXPONENT {
        let scale = 10f64.powi(exponent);
        let mantissa = (value / scale).round();
        if mantissa.abs() > f64::from(MAX_MANTISSA) {
            continue;
        }
        let error = (mantissa * scale - value).abs();
        if best.is_none_or(|(_, _, best_error)| error < best_error) {
            best = Some((mantissa as i32, exponent, error));
        }
    }

    // Clamping guarantees the top exponent always fits.
    let (mantissa, exponent) = best.map_or((0, 0), |(m, e, _)| (m, e));
    pack(mantissa, exponent)
}

/// Pack a mantissa and exponent pair into raw SFLOAT bits.
fn pack(mantissa: i32, exponent: i32) -> u16 {
    (((exponent as u16) & 0x000F) << 12) | ((mantissa as u16) & 0x0FFF)
}

/// Interpret the low `bits` bits of `value` as a two's-complement integer.
fn sign_extend(value: u16, bits: u32) -> i32 {
    let value = i32::from(value) & ((1 << bits) - 1);
    if value & (1 << (bits - 1)) != 0 {
        value - (1 << bits)
    } else {
        value
    }
}

/// A raw SFLOAT as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SFloat(pub u16);

impl SFloat {
    /// Read an SFLOAT from two little-endian bytes.
    #[must_use]
    pub fn from_le_bytes(bytes: [u8; 2]) -> Self {
        Self(u16::from_le_bytes(bytes))
    }

    /// Encode an `f64`.
    #[must_use]
    pub fn from_f64(value: f64) -> Self {
        Self(encode(value))
    }

    /// Decode into an `f64`.
    #[must_use]
    pub fn to_f64(self) -> f64 {
        decode(self.0)
    }

    /// Whether the mantissa is one of the five reserved codes.
    #[must_use]
    pub fn is_special(self) -> bool {
        matches!(
            self.0 & 0x0FFF,
            POSITIVE_INFINITY | NAN | NRES | RESERVED | NEGATIVE_INFINITY
        )
    }

    /// Whether this is the NaN code the 11073 profiles use for "value not available".
    #[must_use]
    pub fn is_not_available(self) -> bool {
        self.0 & 0x0FFF == NAN
    }
}

impl From<SFloat> for f64 {
    fn from(value: SFloat) -> Self {
        value.to_f64()
    }
}

impl fmt::Display for SFloat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_f64())
    }
}
