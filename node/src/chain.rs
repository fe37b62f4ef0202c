// Chain State Manager
// Block storage, best chain tracking, and chain reorganization

use coinject_core::{Block, BlockHeader, Hash, Worksum};
use redb::{Database, TableDefinition};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

const BLOCKS_TABLE: TableDefinition<&[u8; 32], &[u8]> = TableDefinition::new("blocks");
const METADATA_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("metadata");
const HEIGHT_INDEX_TABLE: TableDefinition<u64, &[u8; 32]> = TableDefinition::new("height_index");
/// Cumulative worksum up to and including the keyed block, big-endian
/// encoded, so fork choice compares total chain work rather than just
/// height.
const WORKSUM_TABLE: TableDefinition<&[u8; 32], &[u8]> = TableDefinition::new("worksum");

fn worksum_to_bytes(w: &Worksum) -> Vec<u8> {
    w.as_biguint().to_bytes_be()
}

fn worksum_from_bytes(bytes: &[u8]) -> Worksum {
    Worksum::from_biguint(num_bigint::BigUint::from_bytes_be(bytes))
}

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] redb::Error),
    #[error("Database creation error: {0}")]
    DatabaseCreationError(#[from] redb::DatabaseError),
    #[error("Storage error: {0}")]
    StorageError(#[from] redb::StorageError),
    #[error("Table error: {0}")]
    TableError(#[from] redb::TableError),
    #[error("Commit error: {0}")]
    CommitError(#[from] redb::CommitError),
    #[error("Transaction error: {0}")]
    TransactionError(#[from] redb::TransactionError),
    #[error("block not found")]
    BlockNotFound,
    #[error("invalid block height")]
    InvalidHeight,
    #[error("serialization error: {0}")]
    SerializationError(#[from] bincode::Error),
    #[error("genesis block mismatch")]
    GenesisMismatch,
}

/// Chain state manager handling block storage and retrieval.
///
/// A block's height isn't carried in its `Header` (only `prev_hash`
/// links it to its parent), so every write threads the height through
/// explicitly rather than reading it back out of the block.
pub struct ChainState {
    db: Arc<Database>,
    best_height: Arc<RwLock<u64>>,
    best_hash: Arc<RwLock<Hash>>,
    best_worksum: Arc<RwLock<Worksum>>,
    genesis_hash: Hash,
}

impl ChainState {
    pub fn new<P: AsRef<Path>>(path: P, genesis_block: &Block) -> Result<Self, ChainError> {
        let db = Database::create(path)?;
        let db = Arc::new(db);

        let genesis_hash = genesis_block.header.hash();
        let genesis_work = Worksum::from_target(&genesis_block.header.target());

        let init_txn = db.begin_write()?;
        {
            let _ = init_txn.open_table(BLOCKS_TABLE)?;
            let _ = init_txn.open_table(METADATA_TABLE)?;
            let _ = init_txn.open_table(HEIGHT_INDEX_TABLE)?;
            let _ = init_txn.open_table(WORKSUM_TABLE)?;
        }
        init_txn.commit()?;

        let read_txn = db.begin_read()?;
        let stored_genesis = {
            let table = read_txn.open_table(METADATA_TABLE)?;
            table.get("genesis_hash")?.map(|v| v.value().to_vec())
        };
        drop(read_txn);

        if let Some(stored) = stored_genesis {
            let stored_hash = Hash::from_bytes(stored.as_slice().try_into().map_err(|_| ChainError::GenesisMismatch)?);
            if stored_hash != genesis_hash {
                return Err(ChainError::GenesisMismatch);
            }
        } else {
            let write_txn = db.begin_write()?;
            {
                let mut metadata_table = write_txn.open_table(METADATA_TABLE)?;
                metadata_table.insert("genesis_hash", genesis_hash.as_bytes() as &[u8])?;
                metadata_table.insert("best_height", 0u64.to_le_bytes().as_ref())?;
                metadata_table.insert("best_hash", genesis_hash.as_bytes() as &[u8])?;
                metadata_table.insert("best_worksum", worksum_to_bytes(&genesis_work).as_slice())?;

                let mut worksum_table = write_txn.open_table(WORKSUM_TABLE)?;
                worksum_table.insert(genesis_hash.as_bytes(), worksum_to_bytes(&genesis_work).as_slice())?;
            }
            write_txn.commit()?;

            Self::store_block_raw(&db, genesis_block, 0)?;
        }

        let read_txn = db.begin_read()?;
        let (best_height, best_hash, best_worksum) = {
            let table = read_txn.open_table(METADATA_TABLE)?;

            let height_bytes = table.get("best_height")?.map(|v| v.value().to_vec());
            let hash_bytes = table.get("best_hash")?.map(|v| v.value().to_vec());
            let worksum_bytes = table.get("best_worksum")?.map(|v| v.value().to_vec());

            let height = height_bytes.as_ref().and_then(|b| <[u8; 8]>::try_from(b.as_slice()).ok()).map(u64::from_le_bytes).unwrap_or(0);

            let hash = hash_bytes.as_ref().and_then(|b| <[u8; 32]>::try_from(b.as_slice()).ok()).map(Hash::from_bytes).unwrap_or(genesis_hash);

            let worksum = worksum_bytes.map(|b| worksum_from_bytes(&b)).unwrap_or_else(|| genesis_work.clone());

            (height, hash, worksum)
        };
        drop(read_txn);

        Ok(ChainState {
            db,
            best_height: Arc::new(RwLock::new(best_height)),
            best_hash: Arc::new(RwLock::new(best_hash)),
            best_worksum: Arc::new(RwLock::new(best_worksum)),
            genesis_hash,
        })
    }

    fn store_block_raw(db: &Arc<Database>, block: &Block, height: u64) -> Result<(), ChainError> {
        let block_bytes = bincode::serialize(block)?;
        let hash = block.header.hash();

        let write_txn = db.begin_write()?;
        {
            let mut blocks_table = write_txn.open_table(BLOCKS_TABLE)?;
            blocks_table.insert(hash.as_bytes(), block_bytes.as_slice())?;

            let mut height_table = write_txn.open_table(HEIGHT_INDEX_TABLE)?;
            height_table.insert(height, hash.as_bytes())?;
        }
        write_txn.commit()?;

        Ok(())
    }

    /// Cumulative worksum of `hash`, as recorded when it (or its chain of
    /// ancestors) was stored. Falls back to zero for an unknown hash —
    /// an orphan referencing a parent we haven't seen yet contributes no
    /// work until that parent arrives.
    fn worksum_of(&self, hash: &Hash) -> Result<Worksum, ChainError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(WORKSUM_TABLE)?;
        Ok(table.get(hash.as_bytes())?.map(|v| worksum_from_bytes(v.value())).unwrap_or_else(Worksum::zero))
    }

    /// Stores `block` at `height` and, if its cumulative worksum exceeds
    /// the current best chain's, updates the tip pointer. Worksum, not
    /// height, is the fork-choice rule: a longer chain of easy blocks
    /// must not outrank a shorter chain that did more total work. The
    /// caller is responsible for having already validated
    /// `block.header.prev_hash` against the current tip.
    pub async fn store_block(&self, block: &Block, height: u64) -> Result<bool, ChainError> {
        let block_hash = block.header.hash();

        Self::store_block_raw(&self.db, block, height)?;

        let parent_worksum = self.worksum_of(&block.header.prev_hash)?;
        let cumulative = parent_worksum + Worksum::from_target(&block.header.target());

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(WORKSUM_TABLE)?;
            table.insert(block_hash.as_bytes(), worksum_to_bytes(&cumulative).as_slice())?;
        }
        write_txn.commit()?;

        let current_best_worksum = self.best_worksum.read().await.clone();

        if cumulative > current_best_worksum {
            *self.best_height.write().await = height;
            *self.best_hash.write().await = block_hash;
            *self.best_worksum.write().await = cumulative.clone();

            let write_txn = self.db.begin_write()?;
            {
                let mut table = write_txn.open_table(METADATA_TABLE)?;
                table.insert("best_height", height.to_le_bytes().as_ref())?;
                table.insert("best_hash", block_hash.as_bytes() as &[u8])?;
                table.insert("best_worksum", worksum_to_bytes(&cumulative).as_slice())?;
            }
            write_txn.commit()?;

            tracing::info!(height, hash = ?block_hash, "new best block");
            return Ok(true);
        }

        Ok(false)
    }

    pub fn get_block_by_hash(&self, hash: &Hash) -> Result<Option<Block>, ChainError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(BLOCKS_TABLE)?;

        match table.get(hash.as_bytes())? {
            Some(bytes_ref) => Ok(Some(bincode::deserialize(bytes_ref.value())?)),
            None => Ok(None),
        }
    }

    pub fn get_block_by_height(&self, height: u64) -> Result<Option<Block>, ChainError> {
        let read_txn = self.db.begin_read()?;
        let height_table = read_txn.open_table(HEIGHT_INDEX_TABLE)?;

        match height_table.get(height)? {
            Some(hash_bytes_ref) => {
                let hash = Hash::from_bytes(*hash_bytes_ref.value());
                drop(read_txn);
                self.get_block_by_hash(&hash)
            }
            None => Ok(None),
        }
    }

    pub fn get_header_by_height(&self, height: u64) -> Result<Option<BlockHeader>, ChainError> {
        Ok(self.get_block_by_height(height)?.map(|b| b.header))
    }

    pub async fn best_block_height(&self) -> u64 {
        *self.best_height.read().await
    }

    pub async fn best_block_hash(&self) -> Hash {
        *self.best_hash.read().await
    }

    pub async fn best_block(&self) -> Result<Option<Block>, ChainError> {
        let height = self.best_block_height().await;
        self.get_block_by_height(height)
    }

    pub fn genesis_hash(&self) -> Hash {
        self.genesis_hash
    }

    pub fn best_height_ref(&self) -> Arc<RwLock<u64>> {
        Arc::clone(&self.best_height)
    }

    pub fn best_hash_ref(&self) -> Arc<RwLock<Hash>> {
        Arc::clone(&self.best_hash)
    }

    pub fn has_block(&self, hash: &Hash) -> Result<bool, ChainError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(BLOCKS_TABLE)?;
        Ok(table.get(hash.as_bytes())?.is_some())
    }

    pub async fn get_stats(&self) -> ChainStats {
        ChainStats { best_height: self.best_block_height().await, best_hash: self.best_block_hash().await, genesis_hash: self.genesis_hash }
    }
}

#[derive(Debug, Clone)]
pub struct ChainStats {
    pub best_height: u64,
    pub best_hash: Hash,
    pub genesis_hash: Hash,
}

impl coinject_rpc::BlockchainReader for ChainState {
    fn get_block_by_height(&self, height: u64) -> Result<Option<Block>, String> {
        ChainState::get_block_by_height(self, height).map_err(|e| e.to_string())
    }

    fn get_block_by_hash(&self, hash: &Hash) -> Result<Option<Block>, String> {
        ChainState::get_block_by_hash(self, hash).map_err(|e| e.to_string())
    }

    fn get_header_by_height(&self, height: u64) -> Result<Option<BlockHeader>, String> {
        ChainState::get_header_by_height(self, height).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genesis::{create_genesis_block, GenesisConfig};

    #[tokio::test]
    async fn test_chain_initialization() {
        let temp_dir = std::env::temp_dir().join(format!("coinject-chain-test-init-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&temp_dir);

        let genesis = create_genesis_block(&GenesisConfig::default());
        let chain = ChainState::new(&temp_dir, &genesis).unwrap();

        assert_eq!(chain.best_block_height().await, 0);
        assert_eq!(chain.genesis_hash(), genesis.header.hash());

        let _ = std::fs::remove_dir_all(&temp_dir);
    }

    #[tokio::test]
    async fn test_block_storage() {
        let temp_dir = std::env::temp_dir().join(format!("coinject-chain-test-storage-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&temp_dir);

        let genesis = create_genesis_block(&GenesisConfig::default());
        let chain = ChainState::new(&temp_dir, &genesis).unwrap();

        let retrieved = chain.get_block_by_height(0).unwrap().unwrap();
        assert_eq!(retrieved.header.hash(), genesis.header.hash());

        let _ = std::fs::remove_dir_all(&temp_dir);
    }

    fn child_block(parent: &Block, target_compact: u32) -> Block {
        let body = parent.body.0.clone();
        let header = coinject_core::header::Header {
            prev_hash: parent.header.hash(),
            target_compact,
            merkle_root: body.transactions_root(),
            version: coinject_core::body::BODY_VERSION_CUTOVER,
            timestamp: parent.header.timestamp + 1,
            nonce_tail: 0,
        };
        Block::new(header, body)
    }

    #[tokio::test]
    async fn a_higher_worksum_block_wins_even_at_a_lower_or_equal_height() {
        let temp_dir = std::env::temp_dir().join(format!("coinject-chain-test-worksum-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&temp_dir);

        let genesis = create_genesis_block(&GenesisConfig::default());
        let chain = ChainState::new(&temp_dir, &genesis).unwrap();

        // An easy-target block at height 1 is stored first...
        let easy = child_block(&genesis, 0x1f00_ffff);
        assert!(chain.store_block(&easy, 1).await.unwrap());
        assert_eq!(chain.best_block_hash().await, easy.header.hash());

        // ...then a harder-target block at the *same* height arrives,
        // representing more total work, and must displace it.
        let hard = child_block(&genesis, 0x1c00_ffff);
        assert!(chain.store_block(&hard, 1).await.unwrap());
        assert_eq!(chain.best_block_hash().await, hard.header.hash());

        let _ = std::fs::remove_dir_all(&temp_dir);
    }

    #[tokio::test]
    async fn a_lower_worksum_block_does_not_displace_the_tip() {
        let temp_dir = std::env::temp_dir().join(format!("coinject-chain-test-worksum-low-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&temp_dir);

        let genesis = create_genesis_block(&GenesisConfig::default());
        let chain = ChainState::new(&temp_dir, &genesis).unwrap();

        let hard = child_block(&genesis, 0x1c00_ffff);
        assert!(chain.store_block(&hard, 1).await.unwrap());

        let easy = child_block(&genesis, 0x1f00_ffff);
        assert!(!chain.store_block(&easy, 1).await.unwrap());
        assert_eq!(chain.best_block_hash().await, hard.header.hash());

        let _ = std::fs::remove_dir_all(&temp_dir);
    }
}
