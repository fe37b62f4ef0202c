//! P2P networking: gossipsub/mDNS/Kademlia message plumbing, outbound
//! connection scheduling, and rx/tx bandwidth accounting.

pub mod connection_schedule;
pub mod protocol;
pub mod rxtx;

pub use connection_schedule::{ConnectionLog, ConnectionSchedule, SockaddrState, VectorEntry};
pub use protocol::{
    CoinjectBehaviour, NetworkConfig, NetworkEvent, NetworkMessage, NetworkService, NetworkTopics,
};
pub use rxtx::{Granularity, RxTxAggregator, RxTxError, RxTxSnapshot, RxTxStore};
