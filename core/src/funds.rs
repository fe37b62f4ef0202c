use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Nonnegative integer amount, bounded to `2^63 - 1` so that sums of a
/// handful of `Funds` never overflow `i64` or silently wrap a `u64`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Funds(u64);

impl Funds {
    pub const MAX: u64 = i64::MAX as u64;
    pub const ZERO: Funds = Funds(0);

    pub fn from_value(value: u64) -> Result<Self, CoreError> {
        if value > Self::MAX {
            return Err(CoreError::Balance);
        }
        Ok(Funds(value))
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn checked_add(&self, other: Funds) -> Result<Funds, CoreError> {
        let sum = self.0.checked_add(other.0).ok_or(CoreError::Balance)?;
        Funds::from_value(sum)
    }

    pub fn add_assert(&self, other: Funds) -> Funds {
        self.checked_add(other).expect("funds overflow")
    }

    pub fn checked_sub(&self, other: Funds) -> Result<Funds, CoreError> {
        self.0.checked_sub(other.0).map(Funds).ok_or(CoreError::Balance)
    }
}

impl fmt::Debug for Funds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Funds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range() {
        assert!(Funds::from_value(Funds::MAX + 1).is_err());
        assert!(Funds::from_value(Funds::MAX).is_ok());
    }

    #[test]
    fn checked_add_detects_overflow() {
        let a = Funds::from_value(Funds::MAX).unwrap();
        let one = Funds::from_value(1).unwrap();
        assert!(a.checked_add(one).is_err());
    }

    #[test]
    fn checked_sub_detects_underflow() {
        let a = Funds::from_value(5).unwrap();
        let b = Funds::from_value(6).unwrap();
        assert!(a.checked_sub(b).is_err());
    }
}
