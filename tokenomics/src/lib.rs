//! Block reward subsidy schedule.

pub mod reward;

pub use reward::RewardSchedule;
