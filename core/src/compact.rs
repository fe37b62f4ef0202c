use serde::{Deserialize, Serialize};

const MANTISSA_BITS: u32 = 10;
const MANTISSA_MAX: u64 = 1 << MANTISSA_BITS; // 1024, exclusive upper bound
const NORMALIZED_MIN: u64 = MANTISSA_MAX / 2; // 512

/// Lossy fee compression: a 16-bit (6-bit exponent, 10-bit mantissa) float
/// rounded down to the represented value. Packed as `exponent << 10 |
/// mantissa` so that ordinary integer comparison of the packed `u16`
/// matches comparison of the decompressed fee — block construction sorts
/// mempool entries by this code directly instead of decompressing first.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug)]
pub struct CompactUInt(u16);

impl CompactUInt {
    pub fn compress(value: u64) -> Self {
        if value < MANTISSA_MAX {
            return CompactUInt(value as u16);
        }
        // Largest exponent e such that (value >> e) fits in [NORMALIZED_MIN, MANTISSA_MAX).
        let bits = 64 - value.leading_zeros();
        let exponent = bits - MANTISSA_BITS;
        let mantissa = value >> exponent;
        debug_assert!((NORMALIZED_MIN..MANTISSA_MAX).contains(&mantissa));
        CompactUInt(((exponent as u16) << MANTISSA_BITS) | mantissa as u16)
    }

    pub fn value(&self) -> u64 {
        let exponent = (self.0 as u32) >> MANTISSA_BITS;
        let mantissa = (self.0 as u64) & (MANTISSA_MAX - 1);
        mantissa << exponent
    }

    pub fn raw(&self) -> u16 {
        self.0
    }

    pub fn from_raw(raw: u16) -> Self {
        CompactUInt(raw)
    }
}
