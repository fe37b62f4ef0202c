//! On-chain exchange: limit orderbook plus constant-product AMM (spec
//! §3 "Orderbook" / "AMM pool", §4.5).

pub mod book;
pub mod matching;
pub mod order;
pub mod pool;

pub use book::{Fill, Market, ResolvedOrder, SWAP_FEE_E4};
pub use matching::{match_orders, BaseQuote, MatchResult};
pub use order::{BuySide, Order, SellSide};
pub use pool::{Delta, Pool, PoolLiquidity};
