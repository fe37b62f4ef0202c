// Node Service
// Main orchestrator tying chain storage, mempool, miner, network, and RPC together.

use crate::chain::ChainState;
use crate::config::NodeConfig;
use crate::genesis::{create_genesis_block, GenesisConfig};
use crate::validator::BlockValidator;
use coinject_consensus::{Miner, MiningConfig};
use coinject_core::{Address, Block, Hash, Height, Transaction};
use coinject_mempool::Mempool;
use coinject_network::{NetworkConfig, NetworkEvent, NetworkService};
use coinject_rpc::{RpcServer, RpcServerState};
use coinject_state::{AccountState, AddressSubscriptionState, ChainSubscriptionState};
use coinject_tokenomics::RewardSchedule;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time;

/// A placeholder proof-of-work target until real difficulty retargeting
/// is wired in: generous enough that a single-node devnet mines blocks
/// promptly.
const DEV_TARGET_COMPACT: u32 = 0x1f00_ffff;

enum NetworkCommand {
    BroadcastBlock(Block),
    BroadcastTransaction(Transaction),
    BroadcastStatus { best_height: u64, best_hash: Hash, genesis_hash: Hash },
}

pub struct CoinjectNode {
    config: NodeConfig,
    chain: Arc<ChainState>,
    state: Arc<AccountState>,
    validator: Arc<BlockValidator>,
    mempool: Arc<RwLock<Mempool>>,
    miner: Option<Arc<Miner>>,
    rpc: Option<RpcServer>,
    chain_subscriptions: Arc<Mutex<ChainSubscriptionState<u64>>>,
    address_subscriptions: Arc<Mutex<AddressSubscriptionState<u64>>>,
    next_subscriber_id: Arc<AtomicU64>,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl CoinjectNode {
    pub async fn new(config: NodeConfig) -> Result<Self, Box<dyn std::error::Error>> {
        tracing::info!("initializing coinject node");

        config.validate()?;

        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(config.state_db_path())?;
        std::fs::create_dir_all(config.chain_db_path())?;

        let genesis = create_genesis_block(&GenesisConfig::default());
        let genesis_hash = genesis.header.hash();
        tracing::info!(?genesis_hash, "loaded genesis block");

        let chain = Arc::new(ChainState::new(config.chain_db_path(), &genesis)?);
        let best_height = chain.best_block_height().await;
        tracing::info!(best_height, "chain state initialized");

        let state = Arc::new(AccountState::new(config.state_db_path())?);
        let validator = Arc::new(BlockValidator::new());
        let mempool = Arc::new(RwLock::new(Mempool::new()));

        let miner = if config.mine {
            let miner_address = match config.miner_address {
                Some(ref addr_hex) => {
                    let addr_bytes = hex::decode(addr_hex)?;
                    if addr_bytes.len() != 20 {
                        return Err("invalid miner address length".into());
                    }
                    let mut bytes = [0u8; 20];
                    bytes.copy_from_slice(&addr_bytes);
                    Address::from_bytes(bytes)
                }
                None => genesis.body.0.addresses[0],
            };
            let miner_account = state.get_or_assign_id(&miner_address)?;
            let mining_config = MiningConfig { miner_account, reward_schedule: RewardSchedule::default() };
            tracing::info!(%miner_account, "miner configured");
            Some(Arc::new(Miner::new(mining_config)))
        } else {
            None
        };

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let mut address_subscriptions = AddressSubscriptionState::new();
        address_subscriptions.session_start();

        Ok(CoinjectNode {
            config,
            chain,
            state,
            validator,
            mempool,
            miner,
            rpc: None,
            chain_subscriptions: Arc::new(Mutex::new(ChainSubscriptionState::new())),
            address_subscriptions: Arc::new(Mutex::new(address_subscriptions)),
            next_subscriber_id: Arc::new(AtomicU64::new(1)),
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub async fn start(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let network_config = NetworkConfig {
            listen_addr: self.config.p2p_addr.clone(),
            chain_id: self.config.chain_id.clone(),
            max_peers: self.config.max_peers,
            enable_mdns: true,
            rxtx_db_path: Some(self.config.rxtx_db_path()),
        };

        let (mut network_service, mut event_rx) = NetworkService::new(network_config)?;
        network_service.start_listening(&self.config.p2p_addr)?;
        network_service.subscribe_topics()?;
        tracing::info!(addr = %self.config.p2p_addr, "p2p network listening");

        let (network_cmd_tx, mut network_cmd_rx) = mpsc::unbounded_channel::<NetworkCommand>();

        let rpc_addr = self.config.rpc_socket_addr()?;
        let rpc_state = Arc::new(RpcServerState {
            account_state: Arc::clone(&self.state),
            blockchain: Arc::clone(&self.chain) as Arc<dyn coinject_rpc::BlockchainReader>,
            mempool: Arc::clone(&self.mempool),
            markets: self.validator.markets(),
            chain_id: self.config.chain_id.clone(),
            best_height: self.chain.best_height_ref(),
            best_hash: self.chain.best_hash_ref(),
            genesis_hash: self.chain.genesis_hash(),
            peer_count: Arc::new(RwLock::new(0)),
            chain_subscriptions: Arc::clone(&self.chain_subscriptions),
            address_subscriptions: Arc::clone(&self.address_subscriptions),
            next_subscriber_id: Arc::clone(&self.next_subscriber_id),
        });

        let rpc_server = RpcServer::new(rpc_addr, rpc_state).await?;
        tracing::info!(%rpc_addr, "rpc server listening");
        self.rpc = Some(rpc_server);

        tokio::spawn(async move {
            let mut reconnect_interval = time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = network_service.process_events() => {},
                    _ = reconnect_interval.tick() => {
                        let dialed = network_service.dial_expired();
                        if dialed > 0 {
                            tracing::debug!(dialed, tracked = network_service.tracked_endpoint_count(), "reconnect scheduler dialed expired endpoints");
                        }
                        network_service.finalize_rxtx();
                    }
                    Some(cmd) = network_cmd_rx.recv() => {
                        let result = match cmd {
                            NetworkCommand::BroadcastBlock(block) => network_service.broadcast_block(block),
                            NetworkCommand::BroadcastTransaction(tx) => network_service.broadcast_transaction(tx),
                            NetworkCommand::BroadcastStatus { best_height, best_hash, genesis_hash } => {
                                network_service.broadcast_status(best_height, best_hash, genesis_hash)
                            }
                        };
                        if let Err(e) = result {
                            tracing::warn!(error = %e, "network broadcast failed");
                        }
                    }
                }
            }
        });

        let chain = Arc::clone(&self.chain);
        let state = Arc::clone(&self.state);
        let validator = Arc::clone(&self.validator);
        let mempool = Arc::clone(&self.mempool);
        let chain_subscriptions = Arc::clone(&self.chain_subscriptions);
        let address_subscriptions = Arc::clone(&self.address_subscriptions);

        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                Self::handle_network_event(event, &chain, &state, &validator, &mempool, &chain_subscriptions, &address_subscriptions).await;
            }
        });

        let state_for_mining = Arc::clone(&self.state);
        let validator_for_mining = Arc::clone(&self.validator);
        let chain_subscriptions_for_mining = Arc::clone(&self.chain_subscriptions);
        let address_subscriptions_for_mining = Arc::clone(&self.address_subscriptions);

        let chain_for_status = Arc::clone(&self.chain);
        let genesis_hash = self.chain.genesis_hash();
        let network_tx_for_status = network_cmd_tx.clone();

        tokio::spawn(async move {
            let mut interval = time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                let best_height = chain_for_status.best_block_height().await;
                let best_hash = chain_for_status.best_block_hash().await;
                let _ = network_tx_for_status.send(NetworkCommand::BroadcastStatus { best_height, best_hash, genesis_hash });
            }
        });

        if let Some(ref miner) = self.miner {
            let miner = Arc::clone(miner);
            let chain = Arc::clone(&self.chain);
            let mempool = Arc::clone(&self.mempool);
            let network_tx = network_cmd_tx.clone();
            let block_time = Duration::from_secs(self.config.block_time);

            tokio::spawn(async move {
                Self::mining_loop(
                    miner,
                    chain,
                    state_for_mining,
                    validator_for_mining,
                    mempool,
                    network_tx,
                    block_time,
                    chain_subscriptions_for_mining,
                    address_subscriptions_for_mining,
                )
                .await;
            });
        }

        Ok(())
    }

    async fn handle_network_event(
        event: NetworkEvent,
        chain: &Arc<ChainState>,
        state: &Arc<AccountState>,
        validator: &Arc<BlockValidator>,
        mempool: &Arc<RwLock<Mempool>>,
        chain_subscriptions: &Arc<Mutex<ChainSubscriptionState<u64>>>,
        address_subscriptions: &Arc<Mutex<AddressSubscriptionState<u64>>>,
    ) {
        match event {
            NetworkEvent::BlockReceived { block, peer } => {
                let best_height = chain.best_block_height().await;
                let best_hash = chain.best_block_hash().await;
                let next_height = best_height + 1;

                match validator.validate_block(&block, &best_hash) {
                    Ok(()) => match validator.apply_block(&block, state, Height::new(next_height as u32)) {
                        Ok(()) => match chain.store_block(&block, next_height).await {
                            Ok(_) => {
                                let mut pool = mempool.write().await;
                                pool.erase_from_height(Height::new(next_height as u32));
                                tracing::info!(height = next_height, ?peer, "block accepted");
                                Self::notify_subscribers(&block, Height::new(next_height as u32), state, chain_subscriptions, address_subscriptions);
                            }
                            Err(e) => tracing::warn!(error = %e, "failed to store block"),
                        },
                        Err(e) => tracing::warn!(error = %e, "failed to apply block to state"),
                    },
                    Err(e) => tracing::warn!(error = %e, ?peer, "block validation failed"),
                }
            }
            NetworkEvent::TransactionReceived { tx, peer } => {
                let Ok(origin_address) = state.address_of(tx.origin) else { return };
                let Some(origin_address) = origin_address else {
                    tracing::debug!(?peer, "dropping transaction from unknown origin account");
                    return;
                };
                let Ok(avail) = state.get_balance(tx.origin) else { return };
                let best_height = chain.best_block_height().await;
                let tx_height = Height::new(best_height as u32);
                let pin_floor = coinject_core::height::pin_floor(tx_height);

                let mut pool = mempool.write().await;
                match pool.insert_tx(tx, tx_height, pin_floor, origin_address, avail) {
                    Ok(hash) => tracing::debug!(?hash, "transaction accepted into mempool"),
                    Err(e) => tracing::debug!(error = %e, "transaction rejected"),
                }
            }
            NetworkEvent::PeerConnected(peer) => tracing::info!(?peer, "peer connected"),
            NetworkEvent::PeerDisconnected(peer) => tracing::info!(?peer, "peer disconnected"),
            NetworkEvent::StatusUpdate { peer, best_height, .. } => {
                let our_height = chain.best_block_height().await;
                tracing::debug!(?peer, best_height, our_height, "status update");
            }
        }
    }

    async fn mining_loop(
        miner: Arc<Miner>,
        chain: Arc<ChainState>,
        state: Arc<AccountState>,
        validator: Arc<BlockValidator>,
        mempool: Arc<RwLock<Mempool>>,
        network_tx: mpsc::UnboundedSender<NetworkCommand>,
        block_time: Duration,
        chain_subscriptions: Arc<Mutex<ChainSubscriptionState<u64>>>,
        address_subscriptions: Arc<Mutex<AddressSubscriptionState<u64>>>,
    ) {
        let mut interval = time::interval(block_time);

        loop {
            interval.tick().await;

            let best_height = chain.best_block_height().await;
            let best_hash = chain.best_block_hash().await;
            let next_height = Height::new((best_height + 1) as u32);

            let transactions = mempool.read().await.get_payments(100);

            match miner.mine_block(best_hash, next_height, DEV_TARGET_COMPACT, transactions) {
                Some(block) => {
                    if let Err(e) = validator.apply_block(&block, &state, next_height) {
                        tracing::warn!(error = %e, "failed to apply locally mined block to state");
                        continue;
                    }
                    if let Err(e) = chain.store_block(&block, next_height.value() as u64).await {
                        tracing::warn!(error = %e, "failed to store mined block");
                        continue;
                    }
                    mempool.write().await.erase_from_height(next_height);
                    Self::notify_subscribers(&block, next_height, &state, &chain_subscriptions, &address_subscriptions);
                    if network_tx.send(NetworkCommand::BroadcastBlock(block)).is_ok() {
                        tracing::info!(height = next_height.value(), "mined and broadcast block");
                    }
                }
                None => tracing::debug!("mining attempt exhausted nonce space"),
            }
        }
    }

    /// Feeds a newly-accepted block's reward recipient and transfer
    /// parties into the address-subscription session buffer, and logs
    /// how many chain-tip subscribers would be notified. There is no
    /// push transport wired up yet (subscribers currently poll via
    /// RPC), so this records activity rather than delivering it.
    fn notify_subscribers(
        block: &Block,
        height: Height,
        state: &Arc<AccountState>,
        chain_subscriptions: &Arc<Mutex<ChainSubscriptionState<u64>>>,
        address_subscriptions: &Arc<Mutex<AddressSubscriptionState<u64>>>,
    ) {
        let body = &block.body.0;
        let reward_to = if body.reward.funds != coinject_core::Funds::ZERO { state.address_of(body.reward.account_id).ok().flatten() } else { None };

        let mut transfer_parties: Vec<(Address, Address)> = Vec::new();
        let all_transfers = body.transfers.iter().chain(body.token_sections.iter().flat_map(|s| s.transfers.iter()));
        for tx in all_transfers {
            if let coinject_core::TransactionVariant::Transfer { to, .. } = &tx.variant {
                let Ok(Some(from_addr)) = state.address_of(tx.origin) else { continue };
                let Ok(Some(to_addr)) = state.address_of(*to) else { continue };
                transfer_parties.push((from_addr, to_addr));
            }
        }

        address_subscriptions.lock().expect("address subscriptions mutex poisoned").session_block(height, reward_to, &transfer_parties);

        let subscriber_count = chain_subscriptions.lock().expect("chain subscriptions mutex poisoned").size();
        if subscriber_count > 0 {
            tracing::debug!(height = height.value(), subscriber_count, "chain tip subscribers due a notification");
        }
    }

    pub async fn wait_for_shutdown(&mut self) {
        self.shutdown_rx.recv().await;
        tracing::info!("shutting down node");
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.try_send(());
    }
}
