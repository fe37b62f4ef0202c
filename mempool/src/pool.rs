//! Transaction mempool: triple-indexed entry set plus per-account
//! balance reservation, journaled so a replica can replay a master's
//! admission log (spec's mempool, C5).

use coinject_core::{AccountId, CoreError, Funds, Hash, Height, Transaction, TransactionId};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
    pub txid: TransactionId,
    pub tx: Transaction,
    pub tx_hash: Hash,
    pub tx_height: Height,
}

/// `used` is the sum of `fee + amount` reserved by this account's
/// entries; the invariant `used <= avail` is checked on every admission,
/// not just maintained as an assertion, since `avail` is a live balance
/// snapshot that can shrink between lookups.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BalanceEntry {
    pub avail: Funds,
    pub used: Funds,
}

/// A journal entry a master mempool appends on every mutation, so a
/// replica can catch up by replaying `apply_log` instead of re-running
/// admission from scratch.
#[derive(Clone, Debug, PartialEq)]
pub enum LogEvent {
    Put(Entry),
    Erase(TransactionId),
}

#[derive(Default)]
pub struct Mempool {
    entries: HashMap<TransactionId, Entry>,
    by_pin: BTreeSet<(Height, TransactionId)>,
    by_fee: BTreeSet<(Reverse<u64>, TransactionId)>,
    by_hash: BTreeMap<Hash, TransactionId>,
    balances: HashMap<AccountId, BalanceEntry>,
    /// Non-empty only on a master; a replica never appends to its own.
    log: Vec<LogEvent>,
}

impl Mempool {
    pub fn new() -> Self {
        Mempool::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn fee_key(tx: &Transaction) -> u64 {
        tx.fee.value()
    }

    /// Admits a transaction already known to belong to `origin_address`.
    /// `address_funds` is the account's current on-chain available
    /// balance, looked up by the caller at a fixed snapshot before this
    /// call — the EFAKEACCID check runs first so a rejected signature
    /// never mutates the balance cache, unlike the source this is
    /// grounded on.
    pub fn insert_tx(
        &mut self,
        tx: Transaction,
        tx_height: Height,
        pin_floor: Height,
        origin_address: coinject_core::Address,
        address_funds: Funds,
    ) -> Result<Hash, CoreError> {
        tx.verify_origin(origin_address)?;

        let txid = tx.txid(pin_floor);
        let tx_hash = tx.tx_hash();
        let debit = tx.debit()?;

        if let Some(existing) = self.entries.get(&txid) {
            if Self::fee_key(&tx) <= Self::fee_key(&existing.tx) {
                return Err(CoreError::Nonce);
            }
            self.erase(&txid);
        }

        let balance = self.balances.entry(tx.origin).or_insert(BalanceEntry { avail: address_funds, used: Funds::ZERO });
        balance.avail = address_funds;
        let new_used = balance.used.checked_add(debit)?;
        if new_used.value() > balance.avail.value() {
            return Err(CoreError::Balance);
        }
        balance.used = new_used;

        let entry = Entry { txid, tx, tx_hash, tx_height };
        self.by_pin.insert((txid.pin_height, txid));
        self.by_fee.insert((Reverse(Self::fee_key(&entry.tx)), txid));
        self.by_hash.insert(tx_hash, txid);
        self.entries.insert(txid, entry.clone());
        self.log.push(LogEvent::Put(entry));

        Ok(tx_hash)
    }

    pub fn erase(&mut self, txid: &TransactionId) -> Option<Entry> {
        let entry = self.entries.remove(txid)?;
        self.by_pin.remove(&(txid.pin_height, *txid));
        self.by_fee.remove(&(Reverse(Self::fee_key(&entry.tx)), *txid));
        self.by_hash.remove(&entry.tx_hash);

        if let Some(balance) = self.balances.get_mut(&entry.txid.origin) {
            let debit = entry.tx.debit().unwrap_or(Funds::ZERO);
            balance.used = balance.used.checked_sub(debit).unwrap_or(Funds::ZERO);
            if balance.used == Funds::ZERO {
                self.balances.remove(&entry.txid.origin);
            }
        }
        self.log.push(LogEvent::Erase(*txid));
        Some(entry)
    }

    pub fn erase_from_height(&mut self, h: Height) {
        let ids: Vec<TransactionId> = self.by_pin.range((h, TransactionId { origin: i64::MIN, pin_height: h, nonce_id: 0 })..).map(|(_, id)| *id).collect();
        for id in ids {
            self.erase(&id);
        }
    }

    pub fn erase_before_height(&mut self, h: Height) {
        let ids: Vec<TransactionId> = self.by_pin.range(..(h, TransactionId { origin: i64::MIN, pin_height: h, nonce_id: 0 })).map(|(_, id)| *id).collect();
        for id in ids {
            self.erase(&id);
        }
    }

    pub fn get(&self, txid: &TransactionId) -> Option<&Entry> {
        self.entries.get(txid)
    }

    pub fn get_by_hash(&self, hash: &Hash) -> Option<&Entry> {
        self.by_hash.get(hash).and_then(|id| self.entries.get(id))
    }

    pub fn contains_hash(&self, hash: &Hash) -> bool {
        self.by_hash.contains_key(hash)
    }

    /// Up to `n` entries in descending-fee order, for block construction.
    pub fn get_payments(&self, n: usize) -> Vec<Transaction> {
        self.by_fee.iter().take(n).filter_map(|(_, id)| self.entries.get(id)).map(|e| e.tx.clone()).collect()
    }

    /// Txids present in `peer_samples` but either missing locally or
    /// held locally at a strictly lower fee.
    pub fn filter_new(&self, peer_samples: &[(TransactionId, u64)]) -> Vec<TransactionId> {
        peer_samples
            .iter()
            .filter(|(txid, peer_fee)| match self.entries.get(txid) {
                None => true,
                Some(local) => Self::fee_key(&local.tx) < *peer_fee,
            })
            .map(|(txid, _)| *txid)
            .collect()
    }

    /// Drains this mempool's journal; only meaningful on a master.
    pub fn pop_log(&mut self) -> Vec<LogEvent> {
        std::mem::take(&mut self.log)
    }

    /// Replays a master's journal on a replica. `Put` overwrites any
    /// existing entry at that txid; `Erase` is a no-op if already absent
    /// — both make this idempotent under at-least-once delivery.
    pub fn apply_log(&mut self, events: Vec<LogEvent>) {
        for event in events {
            match event {
                LogEvent::Put(entry) => {
                    self.erase(&entry.txid);
                    self.by_pin.insert((entry.txid.pin_height, entry.txid));
                    self.by_fee.insert((Reverse(Self::fee_key(&entry.tx)), entry.txid));
                    self.by_hash.insert(entry.tx_hash, entry.txid);
                    let debit = entry.tx.debit().unwrap_or(Funds::ZERO);
                    let balance = self.balances.entry(entry.txid.origin).or_default();
                    balance.used = balance.used.checked_add(debit).unwrap_or(balance.used);
                    self.entries.insert(entry.txid, entry);
                }
                LogEvent::Erase(txid) => {
                    self.erase(&txid);
                }
            }
        }
        self.log.clear();
    }

    pub fn balance_of(&self, account: AccountId) -> Option<BalanceEntry> {
        self.balances.get(&account).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coinject_core::compact::CompactUInt;
    use coinject_core::crypto::KeyPair;
    use coinject_core::transaction::{PinNonce, TransactionVariant};

    fn signed_transfer(keys: &KeyPair, origin: AccountId, fee: u64) -> Transaction {
        let pin_nonce = PinNonce::new(1, 0);
        let variant = TransactionVariant::Transfer { to: 99, amount: Funds::from_value(10).unwrap() };
        let unsigned = Transaction {
            origin,
            pin_nonce,
            fee: CompactUInt::compress(fee),
            variant,
            signature: coinject_core::crypto::RecoverableSignature::from_parts(keys.public_key(), [0u8; 64]),
        };
        let msg = unsigned.signing_message();
        Transaction { signature: keys.sign(msg.as_bytes()), ..unsigned }
    }

    #[test]
    fn admits_a_validly_signed_transaction() {
        let keys = KeyPair::generate();
        let mut pool = Mempool::new();
        let tx = signed_transfer(&keys, 1, 100);
        let result = pool.insert_tx(tx, Height::new(10), Height::new(0), keys.address(), Funds::from_value(1000).unwrap());
        assert!(result.is_ok());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn rejects_wrong_claimed_address() {
        let keys = KeyPair::generate();
        let other = KeyPair::generate();
        let mut pool = Mempool::new();
        let tx = signed_transfer(&keys, 1, 100);
        let result = pool.insert_tx(tx, Height::new(10), Height::new(0), other.address(), Funds::from_value(1000).unwrap());
        assert_eq!(result, Err(CoreError::FakeAccountId));
        assert!(pool.is_empty());
    }

    #[test]
    fn rejects_insufficient_balance() {
        let keys = KeyPair::generate();
        let mut pool = Mempool::new();
        let tx = signed_transfer(&keys, 1, 100);
        let result = pool.insert_tx(tx, Height::new(10), Height::new(0), keys.address(), Funds::from_value(5).unwrap());
        assert_eq!(result, Err(CoreError::Balance));
    }

    #[test]
    fn same_txid_lower_fee_is_rejected_with_nonce_error() {
        let keys = KeyPair::generate();
        let mut pool = Mempool::new();
        let tx1 = signed_transfer(&keys, 1, 200);
        pool.insert_tx(tx1, Height::new(10), Height::new(0), keys.address(), Funds::from_value(1000).unwrap()).unwrap();
        let tx2 = signed_transfer(&keys, 1, 100);
        let result = pool.insert_tx(tx2, Height::new(10), Height::new(0), keys.address(), Funds::from_value(1000).unwrap());
        assert_eq!(result, Err(CoreError::Nonce));
    }

    #[test]
    fn same_txid_higher_fee_replaces_the_entry() {
        let keys = KeyPair::generate();
        let mut pool = Mempool::new();
        let tx1 = signed_transfer(&keys, 1, 100);
        pool.insert_tx(tx1, Height::new(10), Height::new(0), keys.address(), Funds::from_value(1000).unwrap()).unwrap();
        let tx2 = signed_transfer(&keys, 1, 200);
        let result = pool.insert_tx(tx2, Height::new(10), Height::new(0), keys.address(), Funds::from_value(1000).unwrap());
        assert!(result.is_ok());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn get_payments_orders_descending_by_fee() {
        let mut pool = Mempool::new();
        let k1 = KeyPair::generate();
        let k2 = KeyPair::generate();
        pool.insert_tx(signed_transfer(&k1, 1, 50), Height::new(1), Height::new(0), k1.address(), Funds::from_value(1000).unwrap()).unwrap();
        pool.insert_tx(signed_transfer(&k2, 2, 500), Height::new(1), Height::new(0), k2.address(), Funds::from_value(1000).unwrap()).unwrap();
        let payments = pool.get_payments(10);
        assert_eq!(payments.len(), 2);
        assert_eq!(payments[0].fee.value(), 500);
    }

    #[test]
    fn apply_log_on_a_replica_mirrors_the_master() {
        let keys = KeyPair::generate();
        let mut master = Mempool::new();
        master.insert_tx(signed_transfer(&keys, 1, 100), Height::new(1), Height::new(0), keys.address(), Funds::from_value(1000).unwrap()).unwrap();
        let log = master.pop_log();

        let mut replica = Mempool::new();
        replica.apply_log(log);
        assert_eq!(replica.len(), master.len());
    }

    #[test]
    fn erase_before_height_drops_only_older_entries() {
        let keys = KeyPair::generate();
        let mut pool = Mempool::new();
        let tx = signed_transfer(&keys, 1, 100);
        let txid = tx.txid(Height::new(0));
        pool.insert_tx(tx, Height::new(1), Height::new(0), keys.address(), Funds::from_value(1000).unwrap()).unwrap();
        pool.erase_before_height(Height::new(0));
        assert!(pool.get(&txid).is_some());
        pool.erase_before_height(Height::new(1));
        assert!(pool.get(&txid).is_none());
    }
}
