//! Mining loop that turns mempool transactions and a difficulty target
//! into a structurally valid block.

pub mod miner;

pub use miner::{Miner, MiningConfig};
