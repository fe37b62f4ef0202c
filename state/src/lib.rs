//! Persistent chain state: account balances and the address/account-id
//! mapping a block's new-address table produces.

pub mod accounts;
pub mod subscription;

pub use accounts::{AccountState, StateError};
pub use subscription::{AddressActivity, AddressSubscriptionState, ChainSubscriptionState};
