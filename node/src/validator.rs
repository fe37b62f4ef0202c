// Block Validator
// Structural, timestamp, and balance-application checks for incoming blocks.

use coinject_core::{Block, Funds, Hash, Height, TokenId, TransactionVariant};
use coinject_exchange::{Market, ResolvedOrder};
use coinject_state::AccountState;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("invalid previous hash")]
    InvalidPrevHash,
    #[error("block failed structural verification")]
    InvalidStructure,
    #[error("invalid timestamp")]
    InvalidTimestamp,
    #[error("transaction debit overflowed or underflowed: {0}")]
    InvalidTransaction(String),
    #[error("state error: {0}")]
    StateError(String),
}

/// Block validator: median-timestamp admission plus balance/exchange
/// application. `timestamps` and `markets` accumulate across calls, so a
/// single validator instance is meant to track one running chain tip.
pub struct BlockValidator {
    timestamps: Mutex<coinject_core::TimestampValidator>,
    markets: Arc<RwLock<HashMap<TokenId, Market>>>,
}

impl BlockValidator {
    pub fn new() -> Self {
        BlockValidator { timestamps: Mutex::new(coinject_core::TimestampValidator::new()), markets: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// The shared pool/market map, so a node can hand the same `Arc` to
    /// its RPC server and see every block this validator applies.
    pub fn markets(&self) -> Arc<RwLock<HashMap<TokenId, Market>>> {
        Arc::clone(&self.markets)
    }

    /// Validates everything that doesn't require replaying state: chain
    /// linkage, structural PoW/merkle checks, and timestamp admission
    /// against the rolling median-of-11 rule. Balance/exchange admission
    /// happens separately in `apply_block`.
    pub fn validate_block(&self, block: &Block, prev_hash: &Hash) -> Result<(), ValidationError> {
        if block.header.prev_hash != *prev_hash {
            return Err(ValidationError::InvalidPrevHash);
        }

        block.verify_structure().map_err(|_| ValidationError::InvalidStructure)?;

        // The genesis block's timestamp is fixed at zero by construction
        // (see `Block::genesis`), which the median rule would otherwise
        // reject outright; it carries no chain history to validate
        // against anyway.
        if block.header.prev_hash != Hash::ZERO {
            let ts = block.header.timestamp as u64;
            let mut validator = self.timestamps.lock().expect("timestamp validator mutex poisoned");
            if !validator.valid(ts) {
                return Err(ValidationError::InvalidTimestamp);
            }
            validator.append(ts);
        }

        Ok(())
    }

    /// Debits every transaction's origin, credits the reward and plain
    /// transfers, and settles `CreateOrder`/`AddLiquidity`/
    /// `RemoveLiquidity`/`Cancelation` through this validator's
    /// per-token `Market` so no locked funds are ever left stranded.
    pub fn apply_block(&self, block: &Block, state: &AccountState, height: Height) -> Result<(), ValidationError> {
        let body = &block.body.0;
        let pin_floor = coinject_core::height::pin_floor(height);

        let reward = &body.reward;
        if reward.funds != Funds::ZERO {
            state.credit(reward.account_id, reward.funds).map_err(|e| ValidationError::StateError(e.to_string()))?;
        }

        for tx in body.transfers.iter().chain(body.cancelations.iter()).chain(body.token_sections.iter().flat_map(|s| {
            s.transfers.iter().chain(s.orders.iter()).chain(s.liquidity_add.iter()).chain(s.liquidity_remove.iter())
        })) {
            let debit = tx.debit().map_err(|e| ValidationError::InvalidTransaction(e.to_string()))?;
            if debit != Funds::ZERO {
                state.debit(tx.origin, debit).map_err(|e| ValidationError::StateError(e.to_string()))?;
            }

            if let TransactionVariant::Transfer { to, amount } = &tx.variant {
                state.credit(*to, *amount).map_err(|e| ValidationError::StateError(e.to_string()))?;
            }
        }

        // A cancelation only ever reaches back into this same block's
        // own orders — there is no resting order book carried across
        // blocks, so nothing outside this batch could be the target.
        let mut canceled: HashMap<TokenId, Vec<(coinject_core::AccountId, coinject_core::TransactionId)>> = HashMap::new();
        for tx in &body.cancelations {
            if let TransactionVariant::Cancelation { token_id, cancel_txid } = &tx.variant {
                canceled.entry(*token_id).or_default().push((tx.origin, *cancel_txid));
            }
        }

        let mut markets = self.markets.write().expect("markets rwlock poisoned");

        for section in &body.token_sections {
            let market = markets.entry(section.token_id).or_insert_with(Market::new);
            let section_canceled = canceled.get(&section.token_id);

            let mut resolved = Vec::new();
            let mut surviving_origins = Vec::new();
            for tx in &section.orders {
                let TransactionVariant::CreateOrder { amount, limit, buy, .. } = &tx.variant else { continue };
                let txid = tx.txid(pin_floor);
                let is_canceled = section_canceled.is_some_and(|rows| rows.iter().any(|(origin, cancel_txid)| *origin == tx.origin && *cancel_txid == txid));
                if is_canceled {
                    state.credit(tx.origin, *amount).map_err(|e| ValidationError::StateError(e.to_string()))?;
                    continue;
                }
                resolved.push(ResolvedOrder { origin: tx.origin, buy: *buy, amount: *amount, limit: *limit });
                surviving_origins.push(tx.origin);
            }

            if !resolved.is_empty() {
                let fills = market.settle(&resolved).map_err(|e| ValidationError::InvalidTransaction(e.to_string()))?;
                for (origin, fill) in surviving_origins.into_iter().zip(fills) {
                    let total = fill.refund.checked_add(fill.proceeds).map_err(|e| ValidationError::InvalidTransaction(e.to_string()))?;
                    if total != Funds::ZERO {
                        state.credit(origin, total).map_err(|e| ValidationError::StateError(e.to_string()))?;
                    }
                }
            }

            for tx in &section.liquidity_add {
                if let TransactionVariant::AddLiquidity { base_amount, quote_amount, .. } = &tx.variant {
                    market.deposit(tx.origin, *base_amount, *quote_amount).map_err(|e| ValidationError::InvalidTransaction(e.to_string()))?;
                }
            }

            for tx in &section.liquidity_remove {
                if let TransactionVariant::RemoveLiquidity { shares, .. } = &tx.variant {
                    let refund = market.withdraw(tx.origin, shares.value()).map_err(|e| ValidationError::InvalidTransaction(e.to_string()))?;
                    state.credit(tx.origin, refund).map_err(|e| ValidationError::StateError(e.to_string()))?;
                }
            }
        }

        Ok(())
    }
}

impl Default for BlockValidator {
    fn default() -> Self {
        BlockValidator::new()
    }
}
