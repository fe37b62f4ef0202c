//! Exact wide-integer arithmetic for the matching engine and AMM swap
//! formula. The consensus path must never touch floating point; every
//! comparison here is an exact integer comparison, never an approximation.

use num_bigint::BigUint;
use num_traits::{One, Zero};

pub fn mul_128(a: u64, b: u64) -> u128 {
    (a as u128) * (b as u128)
}

/// Exact `a * b` for two values that may individually exceed 64 bits
/// (e.g. a mantissa-scaled 128-bit intermediate times a `Funds` value).
/// Falls back to `BigUint` rather than a hand-rolled 192-bit type: exact
/// widths beyond `u128` are rare enough on the hot path that the
/// allocation cost is immaterial, and `BigUint` is already linked for the
/// LP-share square root below.
pub fn mul_wide(a: u128, b: u128) -> BigUint {
    BigUint::from(a) * BigUint::from(b)
}

pub fn div_floor(num: u128, den: u128) -> u128 {
    num / den
}

pub fn div_ceil(num: u128, den: u128) -> u128 {
    (num + den - 1) / den
}

pub fn div_wide_floor(num: &BigUint, den: &BigUint) -> BigUint {
    num / den
}

pub fn div_wide_ceil(num: &BigUint, den: &BigUint) -> BigUint {
    if num.is_zero() {
        return BigUint::zero();
    }
    (num + den - BigUint::one()) / den
}

/// Exact integer square root (floor), used by LP-share issuance.
pub fn sqrt_floor(value: &BigUint) -> BigUint {
    value.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mul_128_does_not_overflow_u64_inputs() {
        assert_eq!(mul_128(u64::MAX, 2), (u64::MAX as u128) * 2);
    }

    #[test]
    fn div_ceil_rounds_up_on_remainder() {
        assert_eq!(div_ceil(10, 3), 4);
        assert_eq!(div_ceil(9, 3), 3);
    }

    #[test]
    fn sqrt_floor_matches_known_squares() {
        assert_eq!(sqrt_floor(&BigUint::from(100u32)), BigUint::from(10u32));
        assert_eq!(sqrt_floor(&BigUint::from(99u32)), BigUint::from(9u32));
    }
}
