//! Orderbook sides (spec §3 "Orderbook"), grounded in the original
//! source's `SortedOrderVector` (`defi/uint64/sorted_order_vector.hpp`):
//! two price-sorted vectors of coalesced limit orders.

use coinject_core::{CoreError, Funds, Price};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Order {
    pub amount: Funds,
    pub limit: Price,
}

/// Sells of base, sorted by `limit` ascending — best (cheapest) ask first.
#[derive(Clone, Debug, Default)]
pub struct SellSide {
    orders: Vec<Order>,
}

/// Buys of base (paying quote), sorted by `limit` descending — best
/// (highest) bid first.
#[derive(Clone, Debug, Default)]
pub struct BuySide {
    orders: Vec<Order>,
}

impl SellSide {
    pub fn as_slice(&self) -> &[Order] {
        &self.orders
    }

    /// Inserts a sell order, coalescing with an existing order at the
    /// same limit.
    pub fn insert(&mut self, amount: Funds, limit: Price) -> Result<(), CoreError> {
        let pos = self.orders.partition_point(|o| o.limit < limit);
        if pos < self.orders.len() && self.orders[pos].limit == limit {
            self.orders[pos].amount = self.orders[pos].amount.checked_add(amount)?;
        } else {
            self.orders.insert(pos, Order { amount, limit });
        }
        Ok(())
    }

    /// Removes or shrinks the order at `limit` by `amount`; errors if no
    /// such order (or insufficient remaining amount) exists.
    pub fn cancel(&mut self, limit: Price, amount: Funds) -> Result<(), CoreError> {
        let pos = self.orders.partition_point(|o| o.limit < limit);
        if pos >= self.orders.len() || self.orders[pos].limit != limit {
            return Err(CoreError::Nonce);
        }
        let remaining = self.orders[pos].amount.checked_sub(amount)?;
        if remaining.value() == 0 {
            self.orders.remove(pos);
        } else {
            self.orders[pos].amount = remaining;
        }
        Ok(())
    }

    /// Count of orders with `limit <= p`, the eligible-to-cross prefix
    /// against a buy order quoted at `p`.
    pub fn eligible_count(&self, p: Price) -> usize {
        self.orders.partition_point(|o| o.limit <= p)
    }

    pub fn cumulative_base(&self) -> Vec<u64> {
        let mut sums = Vec::with_capacity(self.orders.len() + 1);
        let mut acc = 0u64;
        sums.push(0);
        for o in &self.orders {
            acc += o.amount.value();
            sums.push(acc);
        }
        sums
    }
}

impl BuySide {
    pub fn as_slice(&self) -> &[Order] {
        &self.orders
    }

    pub fn insert(&mut self, amount: Funds, limit: Price) -> Result<(), CoreError> {
        let pos = self.orders.partition_point(|o| o.limit > limit);
        if pos < self.orders.len() && self.orders[pos].limit == limit {
            self.orders[pos].amount = self.orders[pos].amount.checked_add(amount)?;
        } else {
            self.orders.insert(pos, Order { amount, limit });
        }
        Ok(())
    }

    pub fn cancel(&mut self, limit: Price, amount: Funds) -> Result<(), CoreError> {
        let pos = self.orders.partition_point(|o| o.limit > limit);
        if pos >= self.orders.len() || self.orders[pos].limit != limit {
            return Err(CoreError::Nonce);
        }
        let remaining = self.orders[pos].amount.checked_sub(amount)?;
        if remaining.value() == 0 {
            self.orders.remove(pos);
        } else {
            self.orders[pos].amount = remaining;
        }
        Ok(())
    }

    pub fn cumulative_quote(&self) -> Vec<u64> {
        let mut sums = Vec::with_capacity(self.orders.len() + 1);
        let mut acc = 0u64;
        sums.push(0);
        for o in &self.orders {
            acc += o.amount.value();
            sums.push(acc);
        }
        sums
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn funds(v: u64) -> Funds {
        Funds::from_value(v).unwrap()
    }

    #[test]
    fn sell_orders_coalesce_at_equal_limit() {
        let mut side = SellSide::default();
        let p = Price::from_double(2.0).unwrap();
        side.insert(funds(10), p).unwrap();
        side.insert(funds(5), p).unwrap();
        assert_eq!(side.as_slice().len(), 1);
        assert_eq!(side.as_slice()[0].amount, funds(15));
    }

    #[test]
    fn sell_side_stays_sorted_ascending() {
        let mut side = SellSide::default();
        side.insert(funds(1), Price::from_double(3.0).unwrap()).unwrap();
        side.insert(funds(1), Price::from_double(1.0).unwrap()).unwrap();
        side.insert(funds(1), Price::from_double(2.0).unwrap()).unwrap();
        let limits: Vec<_> = side.as_slice().iter().map(|o| o.limit).collect();
        let mut sorted = limits.clone();
        sorted.sort();
        assert_eq!(limits, sorted);
    }

    #[test]
    fn buy_side_stays_sorted_descending() {
        let mut side = BuySide::default();
        side.insert(funds(1), Price::from_double(1.0).unwrap()).unwrap();
        side.insert(funds(1), Price::from_double(3.0).unwrap()).unwrap();
        side.insert(funds(1), Price::from_double(2.0).unwrap()).unwrap();
        let limits: Vec<_> = side.as_slice().iter().map(|o| o.limit).collect();
        let mut sorted = limits.clone();
        sorted.sort();
        sorted.reverse();
        assert_eq!(limits, sorted);
    }

    #[test]
    fn cancel_of_unknown_limit_errors() {
        let mut side = SellSide::default();
        assert!(side.cancel(Price::from_double(5.0).unwrap(), funds(1)).is_err());
    }
}
