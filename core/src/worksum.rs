use crate::hash::Hash;
use num_bigint::BigUint;
use num_traits::{One, Zero};
use std::ops::{AddAssign, Mul};

/// 256-bit additive accumulator of expected proof-of-work, one unit per
/// header equal to `2^256 / (target + 1)` — the conventional work-from-
/// target conversion, so doubling the difficulty doubles the per-header
/// contribution.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Worksum(BigUint);

impl Worksum {
    pub fn zero() -> Self {
        Worksum(BigUint::zero())
    }

    pub fn from_target(target: &Hash) -> Self {
        let t = BigUint::from_bytes_be(target.as_bytes());
        let modulus = BigUint::one() << 256u32;
        Worksum(modulus / (t + BigUint::one()))
    }

    pub fn as_biguint(&self) -> &BigUint {
        &self.0
    }

    /// Reconstructs a `Worksum` from a previously-persisted cumulative
    /// total, as stored by a chain's fork-choice index.
    pub fn from_biguint(value: BigUint) -> Self {
        Worksum(value)
    }
}

impl AddAssign for Worksum {
    fn add_assign(&mut self, rhs: Worksum) {
        self.0 += rhs.0;
    }
}

impl std::ops::Add for Worksum {
    type Output = Worksum;
    fn add(mut self, rhs: Worksum) -> Worksum {
        self += rhs;
        self
    }
}

impl Mul<u32> for Worksum {
    type Output = Worksum;
    fn mul(self, factor: u32) -> Worksum {
        Worksum(self.0 * BigUint::from(factor))
    }
}

impl MulAssign<u32> for Worksum {
    fn mul_assign(&mut self, factor: u32) {
        self.0 *= BigUint::from(factor);
    }
}

use std::ops::MulAssign;
