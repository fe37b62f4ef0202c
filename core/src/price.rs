//! Compressed mantissa/exponent price representation (`Price`) and its
//! companion `PriceRelative`, the floor of an exact rational plus an
//! "is this exact?" bit. Arithmetic against `Funds` goes through
//! `num_bigint::BigUint` so that the wide intermediate products never
//! silently truncate; only the final, range-checked result is narrowed
//! back to a plain integer.

use crate::bigint;
use crate::error::CoreError;
use crate::funds::Funds;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

const MANTISSA_MIN: u16 = 1 << 15;
/// Bias such that `value = mantissa * 2^(exponent - EXPONENT_BIAS)`.
const EXPONENT_BIAS: i32 = 63 + 16;

/// Field order matters: deriving `Ord` on `(exponent, mantissa)` gives a
/// correct total order directly, with no custom `Ord` impl.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug)]
pub struct Price {
    exponent: u8,
    mantissa: u16,
}

impl Price {
    pub fn new(mantissa: u16, exponent: u8) -> Result<Self, CoreError> {
        if mantissa < MANTISSA_MIN {
            return Err(CoreError::BadPrice);
        }
        Ok(Price { exponent, mantissa })
    }

    pub fn mantissa(&self) -> u16 {
        self.mantissa
    }

    pub fn exponent(&self) -> u8 {
        self.exponent
    }

    /// Next representable price below this one (larger negative step in
    /// the mantissa, or a carry into the previous exponent).
    pub fn prev_step(&self) -> Option<Price> {
        if self.mantissa > MANTISSA_MIN {
            Some(Price { exponent: self.exponent, mantissa: self.mantissa - 1 })
        } else if self.exponent > 0 {
            Some(Price { exponent: self.exponent - 1, mantissa: u16::MAX })
        } else {
            None
        }
    }

    pub fn next_step(&self) -> Option<Price> {
        if self.mantissa < u16::MAX {
            Some(Price { exponent: self.exponent, mantissa: self.mantissa + 1 })
        } else if self.exponent < u8::MAX {
            Some(Price { exponent: self.exponent + 1, mantissa: MANTISSA_MIN })
        } else {
            None
        }
    }

    /// `mantissa * 2^shift` where `shift` may be negative (i.e. this is
    /// `value = mantissa * 2^(exponent - EXPONENT_BIAS)`), exact in
    /// arbitrary precision.
    fn exact_value(&self) -> (BigUint, i64) {
        (BigUint::from(self.mantissa), self.exponent as i64 - EXPONENT_BIAS as i64)
    }

    fn scale(numerator: &BigUint, shift: i64) -> BigUint {
        if shift >= 0 {
            numerator << (shift as u32)
        } else {
            numerator >> ((-shift) as u32)
        }
    }

    fn scale_ceil(numerator: &BigUint, shift: i64) -> BigUint {
        if shift >= 0 {
            numerator << (shift as u32)
        } else {
            let k = (-shift) as u32;
            let mask = (BigUint::from(1u32) << k) - BigUint::from(1u32);
            if numerator & &mask == BigUint::from(0u32) {
                numerator >> k
            } else {
                (numerator >> k) + BigUint::from(1u32)
            }
        }
    }

    fn to_funds(value: BigUint) -> Result<Funds, CoreError> {
        let bytes = value.to_bytes_le();
        if bytes.len() > 8 {
            return Err(CoreError::Balance);
        }
        let mut buf = [0u8; 8];
        buf[..bytes.len()].copy_from_slice(&bytes);
        Funds::from_value(u64::from_le_bytes(buf))
    }

    pub fn multiply_floor(&self, funds: Funds) -> Result<Funds, CoreError> {
        let (mantissa, shift) = self.exact_value();
        let product = BigUint::from(funds.value()) * mantissa;
        Self::to_funds(Self::scale(&product, shift))
    }

    pub fn multiply_ceil(&self, funds: Funds) -> Result<Funds, CoreError> {
        let (mantissa, shift) = self.exact_value();
        let product = BigUint::from(funds.value()) * mantissa;
        Self::to_funds(Self::scale_ceil(&product, shift))
    }

    pub fn divide_floor(&self, funds: Funds) -> Result<Funds, CoreError> {
        let (mantissa, shift) = self.exact_value();
        if mantissa == BigUint::from(0u32) {
            return Err(CoreError::BadPrice);
        }
        let scaled = Self::scale(&BigUint::from(funds.value()), -shift);
        Self::to_funds(bigint::div_wide_floor(&scaled, &mantissa))
    }

    pub fn divide_ceil(&self, funds: Funds) -> Result<Funds, CoreError> {
        let (mantissa, shift) = self.exact_value();
        if mantissa == BigUint::from(0u32) {
            return Err(CoreError::BadPrice);
        }
        let scaled = Self::scale_ceil(&BigUint::from(funds.value()), -shift);
        Self::to_funds(bigint::div_wide_ceil(&scaled, &mantissa))
    }

    /// Convenience constructor for tests and RPC display formatting only;
    /// never called from the consensus matching/validation path.
    pub fn from_double(value: f64) -> Option<Price> {
        if !value.is_finite() || value <= 0.0 {
            return None;
        }
        let mut exponent = 0i32;
        let mut mantissa = value;
        while mantissa >= u16::MAX as f64 {
            mantissa /= 2.0;
            exponent += 1;
        }
        while mantissa < MANTISSA_MIN as f64 {
            mantissa *= 2.0;
            exponent -= 1;
        }
        let biased = exponent + EXPONENT_BIAS;
        if !(0..=u8::MAX as i32).contains(&biased) {
            return None;
        }
        Price::new(mantissa.round() as u16, biased as u8).ok()
    }

    pub fn to_double(&self) -> f64 {
        self.mantissa as f64 * 2f64.powi(self.exponent as i32 - EXPONENT_BIAS)
    }

    /// Compares `self` against the exact rational `num/den` via
    /// cross-multiplication, with no division and no intermediate
    /// truncation. Used by the matching engine to test a pool's implied
    /// price ratio against an order's limit without ever forming the
    /// ratio as a standalone fraction.
    pub fn cmp_fraction(&self, num: &BigUint, den: &BigUint) -> Ordering {
        let (mantissa, shift) = self.exact_value();
        let lhs = mantissa * den;
        if shift >= 0 {
            (lhs << (shift as u32)).cmp(num)
        } else {
            lhs.cmp(&(num << ((-shift) as u32)))
        }
    }
}

/// Floor of an exact rational `num/den` in the `Price` lattice, plus
/// whether that rational was exactly representable.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PriceRelative {
    pub price: Price,
    pub exact: bool,
}

impl PriceRelative {
    pub fn from_fraction(num: u64, den: u64) -> PriceRelative {
        assert!(den > 0, "from_fraction denominator must be positive");
        let num = BigUint::from(num);
        let den = BigUint::from(den);
        let mut shift: i64 = 0;
        let min = BigUint::from(MANTISSA_MIN);
        let max = BigUint::from(u16::MAX) + BigUint::from(1u32);

        let mantissa_at = |shift: i64| -> BigUint {
            if shift >= 0 {
                (&num << (shift as u32)) / &den
            } else {
                &num / (&den << ((-shift) as u32))
            }
        };

        let mut mantissa = mantissa_at(shift);
        while mantissa < min {
            shift += 1;
            mantissa = mantissa_at(shift);
        }
        while mantissa >= max {
            shift -= 1;
            mantissa = mantissa_at(shift);
        }

        let exponent = shift + EXPONENT_BIAS as i64;
        let exponent = exponent.clamp(0, u8::MAX as i64) as u8;
        let price = Price::new(mantissa_to_u16(&mantissa), exponent).expect("normalized mantissa in range");

        // Exactness check: does `mantissa * den * 2^(-shift)` (rearranged
        // to avoid negative shifts) reconstruct `num` exactly?
        let exact = if shift >= 0 {
            (&mantissa * &den) == (&num << (shift as u32))
        } else {
            (&mantissa * (&den << ((-shift) as u32))) == num
        };

        PriceRelative { price, exact }
    }

    /// Smallest representable `Price` that is `>=` the exact rational.
    pub fn ceil(&self) -> Price {
        if self.exact {
            self.price
        } else {
            self.price.next_step().expect("price lattice has headroom below u8::MAX exponent")
        }
    }
}

fn mantissa_to_u16(value: &BigUint) -> u16 {
    let bytes = value.to_bytes_le();
    let mut buf = [0u8; 2];
    buf[..bytes.len().min(2)].copy_from_slice(&bytes[..bytes.len().min(2)]);
    u16::from_le_bytes(buf)
}

impl PartialEq<Price> for PriceRelative {
    fn eq(&self, other: &Price) -> bool {
        self.exact && self.price == *other
    }
}

impl PartialOrd<Price> for PriceRelative {
    fn partial_cmp(&self, other: &Price) -> Option<Ordering> {
        Some(match self.price.cmp(other) {
            Ordering::Equal if !self.exact => Ordering::Greater,
            ordering => ordering,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_step_is_strictly_greater_and_adjacent() {
        let p = Price::new(MANTISSA_MIN, 100).unwrap();
        let n = p.next_step().unwrap();
        assert!(p < n);
        assert_eq!(n.prev_step().unwrap(), p);
    }

    #[test]
    fn from_fraction_two_thirds_scenario() {
        let pr = PriceRelative::from_fraction(2, 3);
        assert!(!(pr < Price::from_double(0.6).unwrap()));
        assert!(pr < Price::from_double(0.7).unwrap());
    }

    #[test]
    fn from_fraction_three_halves_scenario() {
        let pr = PriceRelative::from_fraction(3, 2);
        assert!(!(pr < Price::from_double(1.4).unwrap()));
        assert!(!(pr < Price::from_double(1.5).unwrap()) || pr == Price::from_double(1.5).unwrap());
        assert!(pr < Price::from_double(1.6).unwrap());
    }

    #[test]
    fn multiply_floor_matches_double_precision_reference() {
        let p = Price::from_double(0.0991).unwrap();
        let result = p.multiply_floor(Funds::from_value(100).unwrap()).unwrap();
        let expected = (100.0 * p.to_double()).floor() as u64;
        assert!((result.value() as i64 - expected as i64).abs() <= 1);
    }

    #[test]
    fn exact_fraction_round_trips_without_rounding_loss() {
        // 1/2 is exactly representable at mantissa=2^15, exponent shifted by one.
        let pr = PriceRelative::from_fraction(1, 2);
        assert!(pr.exact);
        assert_eq!(pr.ceil(), pr.price);
    }

    #[test]
    fn cmp_fraction_agrees_with_from_fraction_ordering() {
        let p = Price::from_double(1.5).unwrap();
        assert_eq!(p.cmp_fraction(&BigUint::from(3u32), &BigUint::from(2u32)), Ordering::Equal);
        assert_eq!(p.cmp_fraction(&BigUint::from(3u32), &BigUint::from(1u32)), Ordering::Less);
        assert_eq!(p.cmp_fraction(&BigUint::from(1u32), &BigUint::from(1u32)), Ordering::Greater);
    }

    #[test]
    fn multiply_and_divide_floor_ceil_bracket_the_exact_value() {
        let p = Price::from_double(3.0).unwrap();
        let funds = Funds::from_value(7).unwrap();
        let floor = p.multiply_floor(funds).unwrap();
        let ceil = p.multiply_ceil(funds).unwrap();
        assert!(floor.value() <= ceil.value());
        assert_eq!(floor.value(), 21);
        assert_eq!(ceil.value(), 21);
    }
}
