//! Consensus-critical primitives shared by every other crate in the
//! workspace: hashing and addressing, the fixed-point `Funds`/`Price`
//! arithmetic, the header/batch/grid chain structures, the transaction
//! and block body wire formats, and signing.

pub mod bigint;
pub mod block;
pub mod body;
pub mod batch;
pub mod compact;
pub mod crypto;
pub mod error;
pub mod funds;
pub mod hash;
pub mod header;
pub mod height;
pub mod price;
pub mod timestamp;
pub mod transaction;
pub mod worksum;

pub use batch::{Batch, Grid, GridCheckpoint, BATCHSIZE};
pub use block::{Block, BlockBody};
pub use body::{Body, Reward, TokenSection};
pub use compact::CompactUInt;
pub use crypto::{KeyPair, MerkleTree, PublicKey, RecoverableSignature};
pub use error::{CoreError, CoreResult};
pub use funds::Funds;
pub use hash::{AccountId, Address, Hash};
pub use header::Header as BlockHeader;
pub use header::{decode_compact_target, Header, HEADER_SIZE};
pub use height::{Height, NonzeroHeight, RETARGET_INTERVAL};
pub use price::{Price, PriceRelative};
pub use timestamp::TimestampValidator;
pub use transaction::{PinNonce, Transaction, TransactionId, TransactionVariant, TokenId};
pub use worksum::Worksum;
