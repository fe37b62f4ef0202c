//! JSON-RPC surface: account queries, transaction submission, chain
//! reads, and exchange (orderbook/pool) reads.

use coinject_core::{AccountId, Address, Block, BlockHeader, Hash, Transaction, TokenId};
use coinject_exchange::Market;
use coinject_mempool::Mempool;
use coinject_state::{AccountState, AddressSubscriptionState, ChainSubscriptionState};
use jsonrpsee::{
    core::{async_trait, RpcResult},
    proc_macros::rpc,
    server::{Server, ServerHandle},
    types::ErrorObjectOwned,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

/// Lets the node supply chain reads without the rpc crate depending on
/// the node's event loop.
pub trait BlockchainReader: Send + Sync {
    fn get_block_by_height(&self, height: u64) -> Result<Option<Block>, String>;
    fn get_block_by_hash(&self, hash: &Hash) -> Result<Option<Block>, String>;
    fn get_header_by_height(&self, height: u64) -> Result<Option<BlockHeader>, String>;
}

const INVALID_PARAMS: i32 = -32602;
const INTERNAL_ERROR: i32 = -32603;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainInfo {
    pub chain_id: String,
    pub best_height: u64,
    pub best_hash: String,
    pub genesis_hash: String,
    pub peer_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub address: String,
    pub account_id: AccountId,
    pub balance: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionStatus {
    pub tx_hash: String,
    pub status: String,
    pub block_height: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolInfo {
    pub token_id: u64,
    pub base: u64,
    pub quote: u64,
    pub shares_total: u64,
}

#[rpc(server, client)]
pub trait CoinjectRpc {
    #[method(name = "account_getBalance")]
    async fn get_balance(&self, address: String) -> RpcResult<AccountInfo>;

    #[method(name = "transaction_submit")]
    async fn submit_transaction(&self, tx_hex: String) -> RpcResult<String>;

    #[method(name = "transaction_getStatus")]
    async fn get_transaction_status(&self, tx_hash: String) -> RpcResult<TransactionStatus>;

    #[method(name = "chain_getBlock")]
    async fn get_block(&self, height: u64) -> RpcResult<Option<Block>>;

    #[method(name = "chain_getLatestBlock")]
    async fn get_latest_block(&self) -> RpcResult<Option<Block>>;

    #[method(name = "chain_getBlockHeader")]
    async fn get_block_header(&self, height: u64) -> RpcResult<Option<BlockHeader>>;

    #[method(name = "chain_getInfo")]
    async fn get_chain_info(&self) -> RpcResult<ChainInfo>;

    #[method(name = "exchange_getPool")]
    async fn get_pool(&self, token_id: u64) -> RpcResult<Option<PoolInfo>>;

    #[method(name = "chain_subscribe")]
    async fn chain_subscribe(&self) -> RpcResult<u64>;

    #[method(name = "chain_unsubscribe")]
    async fn chain_unsubscribe(&self, subscriber_id: u64) -> RpcResult<bool>;

    #[method(name = "address_subscribe")]
    async fn address_subscribe(&self, address: String) -> RpcResult<u64>;

    #[method(name = "address_unsubscribe")]
    async fn address_unsubscribe(&self, subscriber_id: u64, address: String) -> RpcResult<bool>;
}

pub struct RpcServerState {
    pub account_state: Arc<AccountState>,
    pub blockchain: Arc<dyn BlockchainReader>,
    pub mempool: Arc<RwLock<Mempool>>,
    /// Shared with the validator that actually settles blocks, so a
    /// pool read always reflects the chain's current applied state.
    pub markets: Arc<std::sync::RwLock<HashMap<TokenId, Market>>>,
    pub chain_id: String,
    pub best_height: Arc<RwLock<u64>>,
    pub best_hash: Arc<RwLock<Hash>>,
    pub genesis_hash: Hash,
    pub peer_count: Arc<RwLock<usize>>,
    /// Subscriber registries the node's block-application path feeds
    /// on every accepted block, shared so a subscribe/unsubscribe call
    /// here sees the same state the node drives.
    pub chain_subscriptions: Arc<Mutex<ChainSubscriptionState<u64>>>,
    pub address_subscriptions: Arc<Mutex<AddressSubscriptionState<u64>>>,
    pub next_subscriber_id: Arc<AtomicU64>,
}

pub struct RpcServerImpl {
    state: Arc<RpcServerState>,
}

impl RpcServerImpl {
    pub fn new(state: Arc<RpcServerState>) -> Self {
        RpcServerImpl { state }
    }

    fn parse_address(&self, address: &str) -> RpcResult<Address> {
        let bytes = hex::decode(address.trim_start_matches("0x")).map_err(|e| ErrorObjectOwned::owned(INVALID_PARAMS, e.to_string(), None::<()>))?;
        if bytes.len() != 20 {
            return Err(ErrorObjectOwned::owned(INVALID_PARAMS, "address must be 20 bytes", None::<()>));
        }
        let mut addr_bytes = [0u8; 20];
        addr_bytes.copy_from_slice(&bytes);
        Ok(Address::from_bytes(addr_bytes))
    }

    fn parse_hash(&self, hash: &str) -> RpcResult<Hash> {
        let bytes = hex::decode(hash.trim_start_matches("0x")).map_err(|e| ErrorObjectOwned::owned(INVALID_PARAMS, e.to_string(), None::<()>))?;
        if bytes.len() != 32 {
            return Err(ErrorObjectOwned::owned(INVALID_PARAMS, "hash must be 32 bytes", None::<()>));
        }
        let mut hash_bytes = [0u8; 32];
        hash_bytes.copy_from_slice(&bytes);
        Ok(Hash::from_bytes(hash_bytes))
    }
}

#[async_trait]
impl CoinjectRpcServer for RpcServerImpl {
    async fn get_balance(&self, address: String) -> RpcResult<AccountInfo> {
        let addr = self.parse_address(&address)?;
        let account_id = self.state.account_state.get_or_assign_id(&addr).map_err(|e| ErrorObjectOwned::owned(INTERNAL_ERROR, e.to_string(), None::<()>))?;
        let balance = self.state.account_state.get_balance(account_id).map_err(|e| ErrorObjectOwned::owned(INTERNAL_ERROR, e.to_string(), None::<()>))?;
        Ok(AccountInfo { address, account_id, balance: balance.value() })
    }

    async fn submit_transaction(&self, tx_hex: String) -> RpcResult<String> {
        let tx_bytes = hex::decode(tx_hex.trim_start_matches("0x")).map_err(|e| ErrorObjectOwned::owned(INVALID_PARAMS, e.to_string(), None::<()>))?;
        let tx: Transaction = bincode::deserialize(&tx_bytes).map_err(|e| ErrorObjectOwned::owned(INVALID_PARAMS, e.to_string(), None::<()>))?;

        let origin_address = self
            .state
            .account_state
            .address_of(tx.origin)
            .map_err(|e| ErrorObjectOwned::owned(INTERNAL_ERROR, e.to_string(), None::<()>))?
            .ok_or_else(|| ErrorObjectOwned::owned(INVALID_PARAMS, "unknown origin account", None::<()>))?;
        let avail = self.state.account_state.get_balance(tx.origin).map_err(|e| ErrorObjectOwned::owned(INTERNAL_ERROR, e.to_string(), None::<()>))?;
        let best_height = *self.state.best_height.read().await;
        let pin_floor = coinject_core::height::pin_floor(coinject_core::Height::new(best_height as u32));
        let tx_height = coinject_core::Height::new(best_height as u32);

        let mut pool = self.state.mempool.write().await;
        pool.insert_tx(tx, tx_height, pin_floor, origin_address, avail)
            .map(|hash| hex::encode(hash.as_bytes()))
            .map_err(|e| ErrorObjectOwned::owned(INVALID_PARAMS, e.to_string(), None::<()>))
    }

    async fn get_transaction_status(&self, tx_hash: String) -> RpcResult<TransactionStatus> {
        let hash = self.parse_hash(&tx_hash)?;
        let pool = self.state.mempool.read().await;
        if pool.contains_hash(&hash) {
            return Ok(TransactionStatus { tx_hash, status: "pending".to_string(), block_height: None });
        }
        Ok(TransactionStatus { tx_hash, status: "unknown".to_string(), block_height: None })
    }

    async fn get_block(&self, height: u64) -> RpcResult<Option<Block>> {
        self.state.blockchain.get_block_by_height(height).map_err(|e| ErrorObjectOwned::owned(INTERNAL_ERROR, e, None::<()>))
    }

    async fn get_latest_block(&self) -> RpcResult<Option<Block>> {
        let best_height = *self.state.best_height.read().await;
        self.state.blockchain.get_block_by_height(best_height).map_err(|e| ErrorObjectOwned::owned(INTERNAL_ERROR, e, None::<()>))
    }

    async fn get_block_header(&self, height: u64) -> RpcResult<Option<BlockHeader>> {
        self.state.blockchain.get_header_by_height(height).map_err(|e| ErrorObjectOwned::owned(INTERNAL_ERROR, e, None::<()>))
    }

    async fn get_chain_info(&self) -> RpcResult<ChainInfo> {
        let best_height = *self.state.best_height.read().await;
        let best_hash = *self.state.best_hash.read().await;
        let peer_count = *self.state.peer_count.read().await;
        Ok(ChainInfo {
            chain_id: self.state.chain_id.clone(),
            best_height,
            best_hash: hex::encode(best_hash.as_bytes()),
            genesis_hash: hex::encode(self.state.genesis_hash.as_bytes()),
            peer_count,
        })
    }

    async fn get_pool(&self, token_id: u64) -> RpcResult<Option<PoolInfo>> {
        let markets = self.state.markets.read().expect("markets rwlock poisoned");
        Ok(markets.get(&token_id).map(|m| PoolInfo {
            token_id,
            base: m.pool.liquidity.base.value(),
            quote: m.pool.liquidity.quote.value(),
            shares_total: m.pool.shares_total,
        }))
    }

    async fn chain_subscribe(&self) -> RpcResult<u64> {
        let id = self.state.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.state.chain_subscriptions.lock().expect("chain subscriptions mutex poisoned").insert(id);
        Ok(id)
    }

    async fn chain_unsubscribe(&self, subscriber_id: u64) -> RpcResult<bool> {
        let mut subs = self.state.chain_subscriptions.lock().expect("chain subscriptions mutex poisoned");
        let was_subscribed = subs.subscriptions().contains(&subscriber_id);
        subs.erase(&subscriber_id);
        Ok(was_subscribed)
    }

    async fn address_subscribe(&self, address: String) -> RpcResult<u64> {
        let addr = self.parse_address(&address)?;
        let id = self.state.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.state.address_subscriptions.lock().expect("address subscriptions mutex poisoned").insert(id, addr);
        Ok(id)
    }

    async fn address_unsubscribe(&self, subscriber_id: u64, address: String) -> RpcResult<bool> {
        let addr = self.parse_address(&address)?;
        let removed = self.state.address_subscriptions.lock().expect("address subscriptions mutex poisoned").erase(&subscriber_id, &addr);
        Ok(removed > 0)
    }
}

pub struct RpcServer {
    handle: ServerHandle,
    addr: SocketAddr,
}

impl RpcServer {
    pub async fn new(listen_addr: SocketAddr, state: Arc<RpcServerState>) -> Result<Self, Box<dyn std::error::Error>> {
        let server = Server::builder().build(listen_addr).await?;
        let addr = server.local_addr()?;
        let rpc_impl = RpcServerImpl::new(state);
        let handle = server.start(rpc_impl.into_rpc());
        tracing::info!(%addr, "rpc server listening");
        Ok(RpcServer { handle, addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stop(self) -> Result<(), Box<dyn std::error::Error>> {
        self.handle.stop()?;
        Ok(())
    }

    pub async fn stopped(self) {
        self.handle.stopped().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockBlockchainReader;

    impl BlockchainReader for MockBlockchainReader {
        fn get_block_by_height(&self, _height: u64) -> Result<Option<Block>, String> {
            Ok(None)
        }
        fn get_block_by_hash(&self, _hash: &Hash) -> Result<Option<Block>, String> {
            Ok(None)
        }
        fn get_header_by_height(&self, _height: u64) -> Result<Option<BlockHeader>, String> {
            Ok(None)
        }
    }

    fn test_state() -> Arc<RpcServerState> {
        let path = std::env::temp_dir().join(format!("coinject-rpc-test-{}", std::process::id()));
        let _ = std::fs::remove_file(&path);
        Arc::new(RpcServerState {
            account_state: Arc::new(AccountState::new(&path).unwrap()),
            blockchain: Arc::new(MockBlockchainReader) as Arc<dyn BlockchainReader>,
            mempool: Arc::new(RwLock::new(Mempool::new())),
            markets: Arc::new(std::sync::RwLock::new(HashMap::new())),
            chain_id: "test".to_string(),
            best_height: Arc::new(RwLock::new(0)),
            best_hash: Arc::new(RwLock::new(Hash::ZERO)),
            genesis_hash: Hash::ZERO,
            peer_count: Arc::new(RwLock::new(0)),
            chain_subscriptions: Arc::new(Mutex::new(ChainSubscriptionState::new())),
            address_subscriptions: Arc::new(Mutex::new(AddressSubscriptionState::new())),
            next_subscriber_id: Arc::new(AtomicU64::new(1)),
        })
    }

    #[tokio::test]
    async fn balance_lookup_assigns_an_account_id_on_first_query() {
        let impl_ = RpcServerImpl::new(test_state());
        let addr = hex::encode([1u8; 20]);
        let info = impl_.get_balance(addr).await.unwrap();
        assert_eq!(info.balance, 0);
    }

    #[tokio::test]
    async fn malformed_address_is_rejected() {
        let impl_ = RpcServerImpl::new(test_state());
        assert!(impl_.get_balance("not-hex".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn chain_info_reports_configured_genesis() {
        let impl_ = RpcServerImpl::new(test_state());
        let info = impl_.get_chain_info().await.unwrap();
        assert_eq!(info.chain_id, "test");
        assert_eq!(info.best_height, 0);
    }

    #[tokio::test]
    async fn unknown_pool_is_none() {
        let impl_ = RpcServerImpl::new(test_state());
        assert!(impl_.get_pool(7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_pool_reflects_a_market_the_validator_has_applied() {
        let state = test_state();
        {
            let mut markets = state.markets.write().unwrap();
            let mut market = Market::new();
            market.deposit(1, coinject_core::Funds::from_value(100).unwrap(), coinject_core::Funds::from_value(400).unwrap()).unwrap();
            markets.insert(7, market);
        }
        let impl_ = RpcServerImpl::new(state);
        let info = impl_.get_pool(7).await.unwrap().unwrap();
        assert_eq!(info.base, 100);
        assert_eq!(info.quote, 400);
        assert!(info.shares_total > 0);
    }

    #[tokio::test]
    async fn chain_subscribe_then_unsubscribe_round_trips() {
        let impl_ = RpcServerImpl::new(test_state());
        let id = impl_.chain_subscribe().await.unwrap();
        assert!(impl_.chain_unsubscribe(id).await.unwrap());
        assert!(!impl_.chain_unsubscribe(id).await.unwrap());
    }

    #[tokio::test]
    async fn address_subscribe_tracks_the_subscription_until_removed() {
        let impl_ = RpcServerImpl::new(test_state());
        let address = hex::encode([3u8; 20]);
        let id = impl_.address_subscribe(address.clone()).await.unwrap();
        assert_eq!(impl_.state.address_subscriptions.lock().unwrap().tracked_address_count(), 1);
        assert!(impl_.address_unsubscribe(id, address).await.unwrap());
        assert_eq!(impl_.state.address_subscriptions.lock().unwrap().tracked_address_count(), 0);
    }
}
