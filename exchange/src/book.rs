//! Per-block settlement: turns a batch of `CreateOrder`/`AddLiquidity`/
//! `RemoveLiquidity` requests for one token into account-level refunds
//! and proceeds, routed through [`crate::matching::match_orders`] and
//! [`crate::pool::Pool`]. Grounded in the original source's
//! `print_match` (`matching/defi.cpp`'s `main`), which drives the same
//! three steps this module automates: build the two sides, match them
//! against the pool, then push the residual `Delta` into the pool with
//! the pool's own `buy`/`sell`.
//!
//! There is no resting order book carried across blocks: every
//! `CreateOrder` a block includes is matched (or refunded) within that
//! same block, against that block's own pool state. A persistent,
//! multi-block book would need its own storage table and survives only
//! as a possible follow-up.

use crate::matching::match_orders;
use crate::order::{BuySide, SellSide};
use crate::pool::{Delta, Pool};
use coinject_core::{AccountId, CoreError, Funds, Price};
use std::collections::HashMap;

/// Swap fee charged on the residual absorbed into the pool at the
/// clearing price, matching `PoolLiquidity_uint64::sell`/`buy`'s default
/// `feeE4` of 10 (0.1%).
pub const SWAP_FEE_E4: u64 = 10;

/// One `CreateOrder` transaction reduced to what settlement needs.
#[derive(Clone, Copy, Debug)]
pub struct ResolvedOrder {
    pub origin: AccountId,
    pub buy: bool,
    pub amount: Funds,
    pub limit: Price,
}

/// What an order's origin should be credited/refunded once a block's
/// batch has cleared.
#[derive(Clone, Copy, Debug, Default)]
pub struct Fill {
    /// Unmatched amount, returned in the same unit it was locked in
    /// (quote for a buy order, base for a sell order).
    pub refund: Funds,
    /// Proceeds from the other side of the trade (base for a filled buy,
    /// quote for a filled sell).
    pub proceeds: Funds,
}

/// A token's AMM pool plus the per-account ledger of LP shares it has
/// issued — `Pool` itself only tracks the running total.
#[derive(Clone, Debug)]
pub struct Market {
    pub pool: Pool,
    shares: HashMap<AccountId, u64>,
}

impl Market {
    pub fn new() -> Self {
        Market { pool: Pool::empty(), shares: HashMap::new() }
    }

    pub fn shares_of(&self, account: AccountId) -> u64 {
        self.shares.get(&account).copied().unwrap_or(0)
    }

    /// Mints shares for `add_base`/`add_quote` and credits them to
    /// `account`'s ledger.
    pub fn deposit(&mut self, account: AccountId, add_base: Funds, add_quote: Funds) -> Result<u64, CoreError> {
        let minted = self.pool.deposit(add_base, add_quote)?;
        *self.shares.entry(account).or_insert(0) += minted;
        Ok(minted)
    }

    /// Burns `shares` from `account`'s ledger and returns the
    /// `(base, quote)` pair to refund, combined into a single `Funds`
    /// amount since accounts hold one fungible balance.
    pub fn withdraw(&mut self, account: AccountId, shares: u64) -> Result<Funds, CoreError> {
        let owned = self.shares_of(account);
        if shares == 0 || shares > owned {
            return Err(CoreError::Balance);
        }
        let (base, quote) = self.pool.withdraw(shares)?;
        *self.shares.get_mut(&account).expect("checked above") -= shares;
        base.checked_add(quote)
    }

    /// Matches `orders` against this market's pool and returns one
    /// `Fill` per input order, in the same order as `orders`.
    pub fn settle(&mut self, orders: &[ResolvedOrder]) -> Result<Vec<Fill>, CoreError> {
        settle_orders(orders, &mut self.pool.liquidity, SWAP_FEE_E4)
    }
}

/// Groups `orders` by side into coalesced price levels, in the same
/// sort order `BuySide`/`SellSide` store them, keeping the input
/// indices of every order that landed in each level.
fn levels(orders: &[ResolvedOrder], buy: bool) -> Vec<Vec<usize>> {
    let mut indexed: Vec<(usize, Price)> =
        orders.iter().enumerate().filter(|(_, o)| o.buy == buy).map(|(i, o)| (i, o.limit)).collect();
    if buy {
        indexed.sort_by(|a, b| b.1.cmp(&a.1));
    } else {
        indexed.sort_by(|a, b| a.1.cmp(&b.1));
    }
    let mut out: Vec<Vec<usize>> = Vec::new();
    for (i, limit) in indexed {
        match out.last_mut() {
            Some(level) if orders[level[0]].limit == limit => level.push(i),
            _ => out.push(vec![i]),
        }
    }
    out
}

/// Splits `total` pro-rata across `indices` by each order's share of
/// the level's combined amount, crediting the remainder to the last
/// index so the parts sum exactly to `total`.
fn distribute(total: u64, orders: &[ResolvedOrder], indices: &[usize]) -> Vec<u64> {
    let level_total: u64 = indices.iter().map(|&i| orders[i].amount.value()).sum();
    if level_total == 0 {
        return vec![0; indices.len()];
    }
    let mut parts: Vec<u64> = indices.iter().map(|&i| (total as u128 * orders[i].amount.value() as u128 / level_total as u128) as u64).collect();
    let distributed: u64 = parts.iter().sum();
    if let Some(last) = parts.last_mut() {
        *last += total - distributed;
    }
    parts
}

/// Core settlement algorithm, independent of the per-account LP-share
/// bookkeeping `Market` adds on top.
pub fn settle_orders(orders: &[ResolvedOrder], pool: &mut crate::pool::PoolLiquidity, fee_e4: u64) -> Result<Vec<Fill>, CoreError> {
    let mut fills = vec![Fill::default(); orders.len()];

    let buy_levels = levels(orders, true);
    let sell_levels = levels(orders, false);

    let mut buys = BuySide::default();
    for level in &buy_levels {
        let total: u64 = level.iter().map(|&i| orders[i].amount.value()).sum();
        buys.insert(Funds::from_value(total)?, orders[level[0]].limit)?;
    }
    let mut sells = SellSide::default();
    for level in &sell_levels {
        let total: u64 = level.iter().map(|&i| orders[i].amount.value()).sum();
        sells.insert(Funds::from_value(total)?, orders[level[0]].limit)?;
    }

    let result = match_orders(&buys, &sells, pool)?;

    // Full refund as the default; filled levels below overwrite it.
    for (i, order) in orders.iter().enumerate() {
        fills[i].refund = order.amount;
    }

    if let Some(price) = result.clearing_price {
        for level in buy_levels.iter().take(result.buys_filled) {
            let level_total: u64 = level.iter().map(|&i| orders[i].amount.value()).sum();
            let base_out = price.divide_floor(Funds::from_value(level_total)?)?;
            for (i, share) in level.iter().zip(distribute(base_out.value(), orders, level)) {
                fills[*i].refund = Funds::ZERO;
                fills[*i].proceeds = Funds::from_value(share)?;
            }
        }
        for level in sell_levels.iter().take(result.sells_filled) {
            let level_total: u64 = level.iter().map(|&i| orders[i].amount.value()).sum();
            let quote_out = price.multiply_floor(Funds::from_value(level_total)?)?;
            for (i, share) in level.iter().zip(distribute(quote_out.value(), orders, level)) {
                fills[*i].refund = Funds::ZERO;
                fills[*i].proceeds = Funds::from_value(share)?;
            }
        }

        if let Some(partial) = result.partial_fill {
            if result.buys_filled < buy_levels.len() {
                let level = &buy_levels[result.buys_filled];
                let base_out = price.divide_floor(partial)?;
                let filled_shares = distribute(partial.value(), orders, level);
                let base_shares = distribute(base_out.value(), orders, level);
                for ((i, filled), base) in level.iter().zip(filled_shares).zip(base_shares) {
                    fills[*i].refund = orders[*i].amount.checked_sub(Funds::from_value(filled)?)?;
                    fills[*i].proceeds = Funds::from_value(base)?;
                }
            } else if result.sells_filled < sell_levels.len() {
                let level = &sell_levels[result.sells_filled];
                let quote_out = price.multiply_floor(partial)?;
                let filled_shares = distribute(partial.value(), orders, level);
                let quote_shares = distribute(quote_out.value(), orders, level);
                for ((i, filled), quote) in level.iter().zip(filled_shares).zip(quote_shares) {
                    fills[*i].refund = orders[*i].amount.checked_sub(Funds::from_value(filled)?)?;
                    fills[*i].proceeds = Funds::from_value(quote)?;
                }
            }
        }
    }

    // The matched batch's own imbalance (buys paid more/less than sells
    // received at the clearing price) is plugged by trading it into the
    // pool directly, exactly as the original source's `print_match` does.
    match result.to_pool {
        Some(Delta::Quote(amount)) => {
            pool.buy(amount, fee_e4)?;
        }
        Some(Delta::Base(amount)) => {
            pool.sell(amount, fee_e4)?;
        }
        None => {}
    }

    Ok(fills)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolLiquidity;

    fn funds(v: u64) -> Funds {
        Funds::from_value(v).unwrap()
    }

    fn order(origin: AccountId, buy: bool, amount: u64, limit: f64) -> ResolvedOrder {
        ResolvedOrder { origin, buy, amount: funds(amount), limit: Price::from_double(limit).unwrap() }
    }

    #[test]
    fn an_unmatched_order_is_fully_refunded() {
        let mut pool = PoolLiquidity::new(funds(1_000), funds(1_000));
        let orders = [order(1, true, 50, 0.01)];
        let fills = settle_orders(&orders, &mut pool, SWAP_FEE_E4).unwrap();
        assert_eq!(fills[0].refund, funds(50));
        assert_eq!(fills[0].proceeds, Funds::ZERO);
    }

    #[test]
    fn a_generously_priced_buy_is_filled_and_not_refunded() {
        let mut pool = PoolLiquidity::new(funds(1_000_000), funds(1_000_000));
        let orders = [order(1, true, 1_000, 5.0)];
        let fills = settle_orders(&orders, &mut pool, SWAP_FEE_E4).unwrap();
        assert_eq!(fills[0].refund, Funds::ZERO);
        assert!(fills[0].proceeds.value() > 0);
    }

    #[test]
    fn a_fill_never_refunds_more_than_was_originally_locked() {
        let mut pool = PoolLiquidity::new(funds(1_000_000), funds(1_000_000));
        let orders = [order(1, true, 10_000, 5.0), order(2, false, 2_000, 0.2)];
        let fills = settle_orders(&orders, &mut pool, SWAP_FEE_E4).unwrap();
        for (i, f) in fills.iter().enumerate() {
            assert!(f.refund.value() <= orders[i].amount.value());
        }
    }

    #[test]
    fn two_orders_at_the_same_price_split_a_partial_fill_pro_rata() {
        let mut pool = PoolLiquidity::new(funds(100_000), funds(100_000));
        let limit = Price::from_double(1.0).unwrap();
        let orders = [
            ResolvedOrder { origin: 1, buy: false, amount: funds(200), limit },
            ResolvedOrder { origin: 2, buy: false, amount: funds(100), limit },
            order(3, true, 150, 1.0),
        ];
        let fills = settle_orders(&orders, &mut pool, SWAP_FEE_E4).unwrap();
        // The two sell orders split whatever base the single buy order's
        // 150 quote clears, 2:1 in proportion to their locked amounts.
        let (a, b) = (fills[0].proceeds.value(), fills[1].proceeds.value());
        if a + b > 0 {
            assert!(a >= b);
        }
    }

    #[test]
    fn deposit_then_full_withdraw_returns_funds_to_the_depositor() {
        let mut market = Market::new();
        let minted = market.deposit(1, funds(100), funds(400)).unwrap();
        assert_eq!(market.shares_of(1), minted);
        let refund = market.withdraw(1, minted).unwrap();
        assert_eq!(refund, funds(500));
        assert_eq!(market.shares_of(1), 0);
    }

    #[test]
    fn withdrawing_more_shares_than_owned_is_rejected() {
        let mut market = Market::new();
        market.deposit(1, funds(100), funds(400)).unwrap();
        assert!(market.withdraw(1, 1_000_000).is_err());
    }
}
