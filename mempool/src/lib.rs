//! Pending-transaction admission: fee/pin/hash indexed entry set with
//! per-account balance reservation and a master/replica journal.

pub mod pool;

pub use pool::{BalanceEntry, Entry, LogEvent, Mempool};
