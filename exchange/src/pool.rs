//! Constant-product AMM pool (spec §3 "AMM pool", §4.5 "Pool swap
//! formula" / "LP shares"), grounded in `defi::Pool_uint64` /
//! `PoolLiquidity_uint64` from the original source's `defi/uint64/pool.hpp`.

use coinject_core::{CoreError, Funds, Price, PriceRelative};
use num_bigint::BigUint;
use std::cmp::Ordering;

/// A signed delta to push into the pool: either more quote (a buy trade's
/// proceeds) or more base (a sell trade's proceeds), mirroring the
/// original source's `Delta_uint64`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Delta {
    Quote(Funds),
    Base(Funds),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PoolLiquidity {
    pub base: Funds,
    pub quote: Funds,
}

impl PoolLiquidity {
    pub fn new(base: Funds, quote: Funds) -> Self {
        PoolLiquidity { base, quote }
    }

    /// Current pool price `quote/base`, as the floor-plus-exactness pair
    /// the rest of the system compares against a `Price` target with.
    pub fn price(&self) -> Option<PriceRelative> {
        if self.base.value() == 0 {
            return None;
        }
        Some(PriceRelative::from_fraction(self.quote.value(), self.base.value()))
    }

    fn ratio_added_quote(&self, quote_to_pool: u64) -> (BigUint, BigUint) {
        let q = BigUint::from(self.quote.value() + quote_to_pool);
        (&q * &q, BigUint::from(self.quote.value()) * BigUint::from(self.base.value()))
    }

    fn ratio_added_base(&self, base_to_pool: u64) -> (BigUint, BigUint) {
        let b = BigUint::from(self.base.value() + base_to_pool);
        (BigUint::from(self.base.value()) * BigUint::from(self.quote.value()), &b * &b)
    }

    /// True iff pushing `delta` into the pool would move its implied
    /// price strictly above `p` (quote added) or at-or-above `p` (base
    /// added) — the asymmetric boundary the original source's
    /// `modified_pool_price_exceeds` uses to keep the matching bisection
    /// converging on a single clearing price instead of oscillating.
    pub fn pool_price_exceeds(&self, delta: Delta, p: Price) -> bool {
        match delta {
            Delta::Quote(amount) => {
                let (num, den) = self.ratio_added_quote(amount.value());
                p.cmp_fraction(&num, &den) == Ordering::Less
            }
            Delta::Base(amount) => {
                let (num, den) = self.ratio_added_base(amount.value());
                p.cmp_fraction(&num, &den) != Ordering::Greater
            }
        }
    }

    fn discount(value: u64, fee_e4: u64) -> u64 {
        if value == 0 {
            return 0;
        }
        ((value as u128) * (10_000 - fee_e4) as u128 / 10_000) as u64
    }

    fn swapped_amount(a0: u64, a_add: u64, b0: u64, fee_e4: u64) -> Result<u64, CoreError> {
        let num = (a0 as u128) * (b0 as u128);
        let den = (a0 as u128) + (a_add as u128);
        let b1 = num.div_ceil(den);
        let b1: u64 = b1.try_into().map_err(|_| CoreError::Balance)?;
        if b1 > b0 {
            return Err(CoreError::Balance);
        }
        Ok(Self::discount(b0 - b1, fee_e4))
    }

    /// Sell `base_add` into the pool, returning the quote proceeds.
    pub fn sell(&mut self, base_add: Funds, fee_e4: u64) -> Result<Funds, CoreError> {
        if base_add.value() == 0 {
            return Ok(Funds::ZERO);
        }
        let quote_delta = Self::swapped_amount(self.base.value(), base_add.value(), self.quote.value(), fee_e4)?;
        let quote_delta = Funds::from_value(quote_delta)?;
        self.quote = self.quote.checked_sub(quote_delta)?;
        self.base = self.base.checked_add(base_add)?;
        Ok(quote_delta)
    }

    /// Buy with `quote_add` into the pool, returning the base proceeds.
    pub fn buy(&mut self, quote_add: Funds, fee_e4: u64) -> Result<Funds, CoreError> {
        if quote_add.value() == 0 {
            return Ok(Funds::ZERO);
        }
        let base_delta = Self::swapped_amount(self.quote.value(), quote_add.value(), self.base.value(), fee_e4)?;
        let base_delta = Funds::from_value(base_delta)?;
        self.base = self.base.checked_sub(base_delta)?;
        self.quote = self.quote.checked_add(quote_add)?;
        Ok(base_delta)
    }
}

fn sqrt_product(base: Funds, quote: Funds) -> BigUint {
    coinject_core::bigint::sqrt_floor(&(BigUint::from(base.value()) * BigUint::from(quote.value())))
}

/// `PoolLiquidity` augmented with LP-share accounting.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Pool {
    pub liquidity: PoolLiquidity,
    pub shares_total: u64,
}

impl Pool {
    pub fn empty() -> Self {
        Pool { liquidity: PoolLiquidity::new(Funds::ZERO, Funds::ZERO), shares_total: 0 }
    }

    pub fn nonzero(&self) -> bool {
        self.liquidity.base.value() != 0 || self.liquidity.quote.value() != 0
    }

    /// Adds `(add_base, add_quote)` liquidity, minting and returning the
    /// newly issued LP shares.
    pub fn deposit(&mut self, add_base: Funds, add_quote: Funds) -> Result<u64, CoreError> {
        let s0 = sqrt_product(self.liquidity.base, self.liquidity.quote);
        self.liquidity.base = self.liquidity.base.checked_add(add_base)?;
        self.liquidity.quote = self.liquidity.quote.checked_add(add_quote)?;
        let s1 = sqrt_product(self.liquidity.base, self.liquidity.quote);

        if self.shares_total == 0 {
            let minted: u64 = s1.try_into().map_err(|_| CoreError::Balance)?;
            self.shares_total = minted;
            Ok(minted)
        } else {
            let new_total = (BigUint::from(self.shares_total) * &s1) / s0;
            let new_total: u64 = new_total.try_into().map_err(|_| CoreError::Balance)?;
            let minted = new_total.checked_sub(self.shares_total).ok_or(CoreError::Balance)?;
            self.shares_total = new_total;
            Ok(minted)
        }
    }

    /// Pro-rata `(base, quote)` a given share count is currently worth.
    pub fn liquidity_equivalent(&self, shares: u64) -> Result<(Funds, Funds), CoreError> {
        if shares == 0 || shares > self.shares_total {
            return Err(CoreError::Balance);
        }
        let total = BigUint::from(self.shares_total);
        let base = (BigUint::from(shares) * BigUint::from(self.liquidity.base.value())) / &total;
        let quote = (BigUint::from(shares) * BigUint::from(self.liquidity.quote.value())) / &total;
        let base: u64 = base.try_into().map_err(|_| CoreError::Balance)?;
        let quote: u64 = quote.try_into().map_err(|_| CoreError::Balance)?;
        Ok((Funds::from_value(base)?, Funds::from_value(quote)?))
    }

    pub fn withdraw(&mut self, shares: u64) -> Result<(Funds, Funds), CoreError> {
        let (base, quote) = self.liquidity_equivalent(shares)?;
        self.shares_total -= shares;
        self.liquidity.base = self.liquidity.base.checked_sub(base)?;
        self.liquidity.quote = self.liquidity.quote.checked_sub(quote)?;
        Ok((base, quote))
    }
}
