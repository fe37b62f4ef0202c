//! JSON-RPC front door onto chain state, the mempool, and the exchange.

pub mod server;

pub use server::{BlockchainReader, CoinjectRpcClient, CoinjectRpcServer, RpcServer, RpcServerState};
