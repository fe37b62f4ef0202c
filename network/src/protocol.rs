// P2P transport: gossipsub message fan-out over an mDNS/Kademlia/identify
// swarm, with outbound reconnects driven by `ConnectionSchedule`.
use crate::connection_schedule::ConnectionSchedule;
use crate::rxtx::{Granularity, RxTxAggregator, RxTxStore, DEFAULT_RETENTION_SECS};
use coinject_core::{Block, Hash, Transaction};
use futures::StreamExt;
use libp2p::{
    gossipsub::{self, IdentTopic, MessageAuthenticity, ValidationMode},
    identify, identity,
    kad::{self, store::MemoryStore},
    mdns,
    multiaddr::Protocol,
    noise,
    swarm::{NetworkBehaviour, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, Swarm, Transport,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;

/// Wire payloads carried inside a gossipsub message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NetworkMessage {
    NewBlock(Block),
    NewTransaction(Transaction),
    BlockHeader { height: u64, hash: Hash, prev_hash: Hash, timestamp: u64 },
    GetBlock(Hash),
    GetBlocks { from: u64, to: u64 },
    Status { best_height: u64, best_hash: Hash, genesis_hash: Hash },
}

/// One gossipsub topic per message category, namespaced under the
/// configured chain id so mainnet and devnet swarms never cross-talk.
pub struct NetworkTopics {
    pub blocks: IdentTopic,
    pub transactions: IdentTopic,
    pub status: IdentTopic,
}

impl NetworkTopics {
    pub fn new(chain_id: &str) -> Self {
        NetworkTopics {
            blocks: IdentTopic::new(format!("{}/blocks", chain_id)),
            transactions: IdentTopic::new(format!("{}/transactions", chain_id)),
            status: IdentTopic::new(format!("{}/status", chain_id)),
        }
    }
}

#[derive(NetworkBehaviour)]
pub struct CoinjectBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub mdns: mdns::tokio::Behaviour,
    pub kademlia: kad::Behaviour<MemoryStore>,
    pub identify: identify::Behaviour,
}

pub struct NetworkConfig {
    pub listen_addr: String,
    pub chain_id: String,
    pub max_peers: usize,
    pub enable_mdns: bool,
    /// Where to persist rx/tx bandwidth history. `None` keeps the
    /// accounting purely in-memory (used by tests and short-lived nodes).
    pub rxtx_db_path: Option<std::path::PathBuf>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig { listen_addr: "/ip4/0.0.0.0/tcp/30333".to_string(), chain_id: "coinject-mainnet".to_string(), max_peers: 50, enable_mdns: true, rxtx_db_path: None }
    }
}

/// Events the swarm hands up to the node's event loop. Anything that
/// needs a `SocketAddr` (reconnect scheduling) is handled inside
/// `NetworkService` itself via `connection_schedule`, since `PeerId`
/// alone can't address a dial attempt.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    BlockReceived { block: Block, peer: PeerId },
    TransactionReceived { tx: Transaction, peer: PeerId },
    StatusUpdate { peer: PeerId, best_height: u64, best_hash: Hash },
}

/// Pulls a dialable `SocketAddr` out of a `Multiaddr`, when one is
/// present (`/ip4|ip6/.../tcp/...`). Relay, onion, and other
/// non-IP/TCP multiaddrs return `None` rather than erroring, since a
/// peer can legitimately advertise addresses `ConnectionSchedule`
/// simply has no use for.
fn multiaddr_to_socket_addr(addr: &Multiaddr) -> Option<SocketAddr> {
    let mut ip = None;
    let mut port = None;
    for proto in addr.iter() {
        match proto {
            Protocol::Ip4(v4) => ip = Some(std::net::IpAddr::V4(v4)),
            Protocol::Ip6(v6) => ip = Some(std::net::IpAddr::V6(v6)),
            Protocol::Tcp(p) => port = Some(p),
            _ => {}
        }
    }
    Some(SocketAddr::new(ip?, port?))
}

pub struct NetworkService {
    swarm: Swarm<CoinjectBehaviour>,
    topics: NetworkTopics,
    peers: HashSet<PeerId>,
    peer_scores: HashMap<PeerId, f64>,
    event_tx: mpsc::UnboundedSender<NetworkEvent>,
    /// Reconnect scheduler for every endpoint this node has ever heard
    /// about via mDNS, identify, or a successful/failed dial.
    connection_schedule: ConnectionSchedule,
    /// Per-peer bandwidth accounting at both persisted granularities,
    /// optionally flushed to `rxtx_store` on `finalize_rxtx`.
    rxtx_minute: RxTxAggregator,
    rxtx_hour: RxTxAggregator,
    rxtx_store: Option<RxTxStore>,
}

impl NetworkService {
    pub fn new(config: NetworkConfig) -> Result<(Self, mpsc::UnboundedReceiver<NetworkEvent>), Box<dyn std::error::Error>> {
        let local_key = identity::Keypair::generate_ed25519();
        let local_peer_id = PeerId::from(local_key.public());

        tracing::info!(peer_id = %local_peer_id, "network node starting");

        let gossipsub_config = gossipsub::ConfigBuilder::default()
            .heartbeat_interval(Duration::from_secs(1))
            .validation_mode(ValidationMode::Strict)
            .message_id_fn(|message| {
                let hash = blake3::hash(&message.data);
                gossipsub::MessageId::from(hash.as_bytes().to_vec())
            })
            .build()
            .map_err(|e| format!("gossipsub config error: {}", e))?;

        let gossipsub = gossipsub::Behaviour::new(MessageAuthenticity::Signed(local_key.clone()), gossipsub_config).map_err(|e| format!("gossipsub init error: {}", e))?;

        let mdns = mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id)?;

        let store = MemoryStore::new(local_peer_id);
        let kademlia = kad::Behaviour::new(local_peer_id, store);

        let identify = identify::Behaviour::new(identify::Config::new("/coinject/1.0.0".to_string(), local_key.public()));

        let behaviour = CoinjectBehaviour { gossipsub, mdns, kademlia, identify };

        let transport = tcp::tokio::Transport::default().upgrade(libp2p::core::upgrade::Version::V1).authenticate(noise::Config::new(&local_key)?).multiplex(yamux::Config::default()).boxed();

        let swarm = Swarm::new(transport, behaviour, local_peer_id, libp2p::swarm::Config::with_tokio_executor());

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let topics = NetworkTopics::new(&config.chain_id);

        let rxtx_store = match config.rxtx_db_path {
            Some(ref path) => match RxTxStore::new(path) {
                Ok(store) => Some(store),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to open rx/tx history store, bandwidth accounting will stay in-memory only");
                    None
                }
            },
            None => None,
        };

        Ok((
            NetworkService {
                swarm,
                topics,
                peers: HashSet::new(),
                peer_scores: HashMap::new(),
                event_tx,
                connection_schedule: ConnectionSchedule::new(Vec::new()),
                rxtx_minute: RxTxAggregator::minute(),
                rxtx_hour: RxTxAggregator::hour(),
                rxtx_store,
            },
            event_rx,
        ))
    }

    pub fn start_listening(&mut self, addr: &str) -> Result<(), Box<dyn std::error::Error>> {
        let listen_addr: Multiaddr = addr.parse()?;
        self.swarm.listen_on(listen_addr)?;
        Ok(())
    }

    pub fn subscribe_topics(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.swarm.behaviour_mut().gossipsub.subscribe(&self.topics.blocks)?;
        self.swarm.behaviour_mut().gossipsub.subscribe(&self.topics.transactions)?;
        self.swarm.behaviour_mut().gossipsub.subscribe(&self.topics.status)?;
        Ok(())
    }

    pub fn broadcast_block(&mut self, block: Block) -> Result<(), Box<dyn std::error::Error>> {
        let data = bincode::serialize(&NetworkMessage::NewBlock(block))?;
        let n_bytes = data.len() as u64;
        self.swarm.behaviour_mut().gossipsub.publish(self.topics.blocks.clone(), data)?;
        self.record_tx_all_peers(n_bytes);
        Ok(())
    }

    pub fn broadcast_transaction(&mut self, tx: Transaction) -> Result<(), Box<dyn std::error::Error>> {
        let data = bincode::serialize(&NetworkMessage::NewTransaction(tx))?;
        let n_bytes = data.len() as u64;
        self.swarm.behaviour_mut().gossipsub.publish(self.topics.transactions.clone(), data)?;
        self.record_tx_all_peers(n_bytes);
        Ok(())
    }

    pub fn broadcast_status(&mut self, best_height: u64, best_hash: Hash, genesis_hash: Hash) -> Result<(), Box<dyn std::error::Error>> {
        let data = bincode::serialize(&NetworkMessage::Status { best_height, best_hash, genesis_hash })?;
        let n_bytes = data.len() as u64;
        self.swarm.behaviour_mut().gossipsub.publish(self.topics.status.clone(), data)?;
        self.record_tx_all_peers(n_bytes);
        Ok(())
    }

    /// A gossipsub publish fans out to every connected peer at once, so a
    /// broadcast's bytes are charged against each peer we're connected to
    /// rather than a single destination.
    fn record_tx_all_peers(&mut self, n_bytes: u64) {
        if self.peers.is_empty() {
            return;
        }
        let now = std::time::SystemTime::now();
        let peers: Vec<PeerId> = self.peers.iter().copied().collect();
        for peer in peers {
            self.rxtx_minute.record(&peer.to_string(), n_bytes, false, now);
            self.rxtx_hour.record(&peer.to_string(), n_bytes, false, now);
        }
    }

    /// Rolls every fully-elapsed minute and hour bandwidth window into
    /// history, persisting through to the on-disk store when one is
    /// configured. Intended to be called on a steady tick from the
    /// node's event loop.
    pub fn finalize_rxtx(&mut self) {
        let now = std::time::SystemTime::now();
        match &self.rxtx_store {
            Some(store) => {
                if let Err(e) = self.rxtx_minute.finalize_and_persist(now, false, store, Granularity::Minute) {
                    tracing::warn!(error = %e, "failed to persist rx/tx minute history");
                }
                if let Err(e) = self.rxtx_hour.finalize_and_persist(now, false, store, Granularity::Hour) {
                    tracing::warn!(error = %e, "failed to persist rx/tx hour history");
                }
            }
            None => {
                self.rxtx_minute.finalize_all(now, false);
                self.rxtx_hour.finalize_all(now, false);
            }
        }
        self.rxtx_minute.prune_older_than(now, DEFAULT_RETENTION_SECS);
        self.rxtx_hour.prune_older_than(now, DEFAULT_RETENTION_SECS);
    }

    /// Minute-bucketed bandwidth history for one peer, merging in-memory
    /// and (if configured) persisted rows. Mirrors the original
    /// aggregator's `get_aggregated_minutes` read path.
    pub fn rxtx_minutes_for_peer(&self, peer: &PeerId) -> Vec<crate::rxtx::RxTxSnapshot> {
        let host = peer.to_string();
        match &self.rxtx_store {
            Some(store) => self.rxtx_minute.get_aggregated_with_store(&host, store, Granularity::Minute).unwrap_or_default(),
            None => self.rxtx_minute.get_aggregated(&host),
        }
    }

    /// Hour-bucketed counterpart of `rxtx_minutes_for_peer`
    /// (`get_aggregated_hours` in the original).
    pub fn rxtx_hours_for_peer(&self, peer: &PeerId) -> Vec<crate::rxtx::RxTxSnapshot> {
        let host = peer.to_string();
        match &self.rxtx_store {
            Some(store) => self.rxtx_hour.get_aggregated_with_store(&host, store, Granularity::Hour).unwrap_or_default(),
            None => self.rxtx_hour.get_aggregated(&host),
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// How many distinct endpoints the reconnect scheduler is tracking
    /// across all three buckets, for diagnostics.
    pub fn tracked_endpoint_count(&self) -> usize {
        self.connection_schedule.total_tracked()
    }

    /// Dials every endpoint whose backoff timer has expired. Intended
    /// to be called on a steady tick from the node's event loop
    /// alongside `process_events`.
    pub fn dial_expired(&mut self) -> usize {
        let expired = self.connection_schedule.pop_expired();
        for addr in &expired {
            let ip_proto = match addr.ip() {
                std::net::IpAddr::V4(v4) => Protocol::Ip4(v4),
                std::net::IpAddr::V6(v6) => Protocol::Ip6(v6),
            };
            let multiaddr = Multiaddr::empty().with(ip_proto).with(Protocol::Tcp(addr.port()));
            if let Err(e) = self.swarm.dial(multiaddr) {
                tracing::debug!(%addr, error = %e, "scheduled dial failed to start");
            }
        }
        expired.len()
    }

    fn handle_gossipsub_message(&mut self, peer: PeerId, message: Vec<u8>) {
        let now = std::time::SystemTime::now();
        let host = peer.to_string();
        self.rxtx_minute.record(&host, message.len() as u64, true, now);
        self.rxtx_hour.record(&host, message.len() as u64, true, now);
        match bincode::deserialize::<NetworkMessage>(&message) {
            Ok(NetworkMessage::NewBlock(block)) => {
                let _ = self.event_tx.send(NetworkEvent::BlockReceived { block, peer });
            }
            Ok(NetworkMessage::NewTransaction(tx)) => {
                let _ = self.event_tx.send(NetworkEvent::TransactionReceived { tx, peer });
            }
            Ok(NetworkMessage::Status { best_height, best_hash, genesis_hash: _ }) => {
                let _ = self.event_tx.send(NetworkEvent::StatusUpdate { peer, best_height, best_hash });
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(peer = %peer, error = %e, "failed to deserialize network message"),
        }
    }

    /// Feeds a peer's advertised listen address into both the DHT and
    /// the reconnect scheduler, skipping addresses with no dialable
    /// `SocketAddr` (e.g. relay circuits).
    fn learn_address(&mut self, peer: PeerId, addr: Multiaddr) {
        self.swarm.behaviour_mut().kademlia.add_address(&peer, addr.clone());
        if let Some(socket_addr) = multiaddr_to_socket_addr(&addr) {
            let source = match socket_addr.ip() {
                std::net::IpAddr::V4(v4) => Some(v4),
                std::net::IpAddr::V6(_) => None,
            };
            self.connection_schedule.insert(socket_addr, source);
        }
    }

    pub async fn process_events(&mut self) {
        match self.swarm.select_next_some().await {
            SwarmEvent::Behaviour(event) => match event {
                CoinjectBehaviourEvent::Gossipsub(gossipsub::Event::Message { propagation_source, message, .. }) => {
                    self.handle_gossipsub_message(propagation_source, message.data);
                }
                CoinjectBehaviourEvent::Mdns(mdns::Event::Discovered(peers)) => {
                    for (peer, addr) in peers {
                        tracing::debug!(%peer, %addr, "mdns discovered peer");
                        self.swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer);
                        self.learn_address(peer, addr);
                    }
                }
                CoinjectBehaviourEvent::Mdns(mdns::Event::Expired(peers)) => {
                    for (peer, _) in peers {
                        tracing::debug!(%peer, "mdns peer expired");
                        self.swarm.behaviour_mut().gossipsub.remove_explicit_peer(&peer);
                    }
                }
                CoinjectBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                    tracing::debug!(peer = %peer_id, protocol = %info.protocol_version, "identified peer");
                    for addr in info.listen_addrs {
                        self.learn_address(peer_id, addr);
                    }
                }
                CoinjectBehaviourEvent::Kademlia(kad::Event::RoutingUpdated { peer, .. }) => {
                    tracing::trace!(%peer, "kademlia routing updated");
                }
                _ => {}
            },
            SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                tracing::info!(peer = %peer_id, "connection established");
                self.peers.insert(peer_id);
                if let Some(socket_addr) = multiaddr_to_socket_addr(endpoint.get_remote_address()) {
                    self.connection_schedule.connection_established(socket_addr);
                }
                let _ = self.event_tx.send(NetworkEvent::PeerConnected(peer_id));
            }
            SwarmEvent::ConnectionClosed { peer_id, endpoint, .. } => {
                tracing::info!(peer = %peer_id, "connection closed");
                self.peers.remove(&peer_id);
                if let Some(socket_addr) = multiaddr_to_socket_addr(endpoint.get_remote_address()) {
                    self.connection_schedule.outbound_failed(socket_addr);
                }
                let _ = self.event_tx.send(NetworkEvent::PeerDisconnected(peer_id));
            }
            SwarmEvent::OutgoingConnectionError { peer_id: Some(peer_id), .. } => {
                tracing::debug!(peer = %peer_id, "outgoing connection failed");
            }
            SwarmEvent::NewListenAddr { address, .. } => {
                tracing::info!(%address, "listening");
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_network_creation() {
        let config = NetworkConfig::default();
        let result = NetworkService::new(config);
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_topics_creation() {
        let topics = NetworkTopics::new("coinject-devnet");
        assert_eq!(topics.blocks.hash(), IdentTopic::new("coinject-devnet/blocks").hash());
    }

    #[test]
    fn multiaddr_with_ip4_and_tcp_resolves_to_socket_addr() {
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/30333".parse().unwrap();
        assert_eq!(multiaddr_to_socket_addr(&addr), Some("127.0.0.1:30333".parse().unwrap()));
    }

    #[test]
    fn multiaddr_without_tcp_has_no_socket_addr() {
        let addr: Multiaddr = "/ip4/127.0.0.1/udp/30333".parse().unwrap();
        assert_eq!(multiaddr_to_socket_addr(&addr), None);
    }
}
