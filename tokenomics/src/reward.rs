//! Block reward schedule. The block body carries a single `Reward`
//! tuple (account, funds) rather than the distribution the original
//! source's document block spends most of its words on; this crate
//! exists only to turn a height into that one `Funds` value.

use coinject_core::{Funds, Height};

/// Standard halving subsidy schedule: `initial >> (height / interval)`,
/// floored to zero once the shift would exceed the initial subsidy's bit
/// width (so a 64-bit shift never panics).
#[derive(Clone, Copy, Debug)]
pub struct RewardSchedule {
    pub initial_subsidy: Funds,
    pub halving_interval: u32,
}

impl RewardSchedule {
    pub fn new(initial_subsidy: Funds, halving_interval: u32) -> Self {
        assert!(halving_interval > 0, "halving_interval must be positive");
        RewardSchedule { initial_subsidy, halving_interval }
    }

    pub fn reward_at(&self, height: Height) -> Funds {
        let halvings = height.value() / self.halving_interval;
        if halvings >= 64 {
            return Funds::ZERO;
        }
        Funds::from_value(self.initial_subsidy.value() >> halvings).unwrap_or(Funds::ZERO)
    }
}

impl Default for RewardSchedule {
    /// 50 coin (in base units of `Funds`) initial subsidy, halving every
    /// retarget epoch squared in blocks — an arbitrary but documented
    /// choice; see the design notes for why no schedule is specified
    /// upstream.
    fn default() -> Self {
        RewardSchedule {
            initial_subsidy: Funds::from_value(50_00_000_000).unwrap(),
            halving_interval: coinject_core::RETARGET_INTERVAL * 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reward_halves_at_each_interval() {
        let schedule = RewardSchedule::new(Funds::from_value(1000).unwrap(), 100);
        assert_eq!(schedule.reward_at(Height::new(0)).value(), 1000);
        assert_eq!(schedule.reward_at(Height::new(99)).value(), 1000);
        assert_eq!(schedule.reward_at(Height::new(100)).value(), 500);
        assert_eq!(schedule.reward_at(Height::new(250)).value(), 250);
    }

    #[test]
    fn reward_eventually_reaches_zero() {
        let schedule = RewardSchedule::new(Funds::from_value(1).unwrap(), 1);
        assert_eq!(schedule.reward_at(Height::new(64)).value(), 0);
    }
}
