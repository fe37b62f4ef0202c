//! Persistent account state: balances keyed by the compact `AccountId`
//! assigned at first appearance in a block's address table, plus the
//! address<->id mapping that assignment creates.

use coinject_core::{AccountId, Address, Funds};
use redb::{ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;

const BALANCES_TABLE: TableDefinition<i64, u64> = TableDefinition::new("balances");
const ADDRESS_TO_ID: TableDefinition<&[u8; 20], i64> = TableDefinition::new("address_to_id");
const ID_TO_ADDRESS: TableDefinition<i64, &[u8; 20]> = TableDefinition::new("id_to_address");
/// Single-row counter table; always read/written at key `0`.
const NEXT_ID_TABLE: TableDefinition<u8, i64> = TableDefinition::new("next_id");

pub struct AccountState {
    db: Arc<redb::Database>,
}

impl AccountState {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StateError> {
        let db = redb::Database::create(path)?;
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(BALANCES_TABLE)?;
            let _ = write_txn.open_table(ADDRESS_TO_ID)?;
            let _ = write_txn.open_table(ID_TO_ADDRESS)?;
            let mut next_id = write_txn.open_table(NEXT_ID_TABLE)?;
            if next_id.get(0u8)?.is_none() {
                next_id.insert(0u8, 0i64)?;
            }
        }
        write_txn.commit()?;
        Ok(AccountState { db: Arc::new(db) })
    }

    pub fn from_db(db: Arc<redb::Database>) -> Self {
        AccountState { db }
    }

    pub fn get_balance(&self, account_id: AccountId) -> Result<Funds, StateError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(BALANCES_TABLE)?;
        Ok(table.get(account_id)?.map(|v| v.value()).map(Funds::from_value).transpose()?.unwrap_or(Funds::ZERO))
    }

    pub fn credit(&self, account_id: AccountId, amount: Funds) -> Result<Funds, StateError> {
        let current = self.get_balance(account_id)?;
        let new_balance = current.checked_add(amount)?;
        self.set_balance(account_id, new_balance)?;
        Ok(new_balance)
    }

    pub fn debit(&self, account_id: AccountId, amount: Funds) -> Result<Funds, StateError> {
        let current = self.get_balance(account_id)?;
        let new_balance = current.checked_sub(amount)?;
        self.set_balance(account_id, new_balance)?;
        Ok(new_balance)
    }

    fn set_balance(&self, account_id: AccountId, balance: Funds) -> Result<(), StateError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(BALANCES_TABLE)?;
            table.insert(account_id, balance.value())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Returns the existing id for `address`, assigning a fresh one (the
    /// body's "new address table" effect) if this is its first
    /// appearance.
    pub fn get_or_assign_id(&self, address: &Address) -> Result<AccountId, StateError> {
        {
            let txn = self.db.begin_read()?;
            let table = txn.open_table(ADDRESS_TO_ID)?;
            if let Some(id) = table.get(address.as_bytes())? {
                return Ok(id.value());
            }
        }
        let write_txn = self.db.begin_write()?;
        let assigned = {
            let mut next_id = write_txn.open_table(NEXT_ID_TABLE)?;
            let id = next_id.get(0u8)?.map(|v| v.value()).unwrap_or(0);
            next_id.insert(0u8, id + 1)?;
            let mut addr_to_id = write_txn.open_table(ADDRESS_TO_ID)?;
            addr_to_id.insert(address.as_bytes(), id)?;
            let mut id_to_addr = write_txn.open_table(ID_TO_ADDRESS)?;
            id_to_addr.insert(id, address.as_bytes())?;
            id
        };
        write_txn.commit()?;
        Ok(assigned)
    }

    pub fn address_of(&self, account_id: AccountId) -> Result<Option<Address>, StateError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(ID_TO_ADDRESS)?;
        Ok(table.get(account_id)?.map(|v| Address::from_bytes(*v.value())))
    }
}

#[derive(Debug)]
pub enum StateError {
    Core(coinject_core::CoreError),
    Database(redb::DatabaseError),
    Storage(redb::StorageError),
    Table(redb::TableError),
    Commit(redb::CommitError),
    Transaction(redb::TransactionError),
}

impl From<coinject_core::CoreError> for StateError {
    fn from(e: coinject_core::CoreError) -> Self {
        StateError::Core(e)
    }
}
impl From<redb::DatabaseError> for StateError {
    fn from(e: redb::DatabaseError) -> Self {
        StateError::Database(e)
    }
}
impl From<redb::StorageError> for StateError {
    fn from(e: redb::StorageError) -> Self {
        StateError::Storage(e)
    }
}
impl From<redb::TableError> for StateError {
    fn from(e: redb::TableError) -> Self {
        StateError::Table(e)
    }
}
impl From<redb::CommitError> for StateError {
    fn from(e: redb::CommitError) -> Self {
        StateError::Commit(e)
    }
}
impl From<redb::TransactionError> for StateError {
    fn from(e: redb::TransactionError) -> Self {
        StateError::Transaction(e)
    }
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateError::Core(e) => write!(f, "{}", e),
            StateError::Database(e) => write!(f, "database error: {}", e),
            StateError::Storage(e) => write!(f, "storage error: {}", e),
            StateError::Table(e) => write!(f, "table error: {}", e),
            StateError::Commit(e) => write!(f, "commit error: {}", e),
            StateError::Transaction(e) => write!(f, "transaction error: {}", e),
        }
    }
}

impl std::error::Error for StateError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db(name: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("coinject-state-test-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_file(&path);
        path
    }

    #[test]
    fn fresh_account_has_zero_balance() {
        let path = temp_db("zero");
        let state = AccountState::new(&path).unwrap();
        assert_eq!(state.get_balance(1).unwrap().value(), 0);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn credit_then_debit_round_trips() {
        let path = temp_db("creditdebit");
        let state = AccountState::new(&path).unwrap();
        state.credit(1, Funds::from_value(1000).unwrap()).unwrap();
        state.debit(1, Funds::from_value(300).unwrap()).unwrap();
        assert_eq!(state.get_balance(1).unwrap().value(), 700);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn debit_past_zero_is_rejected() {
        let path = temp_db("underflow");
        let state = AccountState::new(&path).unwrap();
        assert!(state.debit(1, Funds::from_value(1).unwrap()).is_err());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn address_gets_a_stable_id_on_first_appearance() {
        let path = temp_db("assign");
        let state = AccountState::new(&path).unwrap();
        let addr = Address::from_bytes([7u8; 20]);
        let id1 = state.get_or_assign_id(&addr).unwrap();
        let id2 = state.get_or_assign_id(&addr).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(state.address_of(id1).unwrap(), Some(addr));
        std::fs::remove_file(&path).ok();
    }
}
