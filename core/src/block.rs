//! A full block: an 80-byte `Header` plus its `Body` (spec §3/§4).

use crate::body::{Body, Reward};
use crate::error::CoreError;
use crate::hash::{Address, Hash};
use crate::header::Header;
use serde::{Deserialize, Serialize};

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    pub body: BlockBody,
}

/// `Body` wrapped so `Block` can derive `Serialize`/`Deserialize` without
/// forcing the hand-rolled body codec through serde; the wire form of a
/// block is `header.to_bytes() || body.serialize(header.version)`, not a
/// derived struct encoding.
#[derive(Clone, PartialEq, Debug)]
pub struct BlockBody(pub Body);

impl Serialize for BlockBody {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let bytes = self.0.serialize(crate::body::BODY_VERSION_CUTOVER).map_err(serde::ser::Error::custom)?;
        serializer.serialize_bytes(&bytes)
    }
}

impl<'de> Deserialize<'de> for BlockBody {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        let body = Body::parse(&bytes, crate::body::BODY_VERSION_CUTOVER).map_err(serde::de::Error::custom)?;
        Ok(BlockBody(body))
    }
}

impl Block {
    pub fn new(header: Header, body: Body) -> Self {
        Block { header, body: BlockBody(body) }
    }

    pub fn genesis(genesis_address: Address) -> Self {
        let body = Body {
            mining_scratch: [0u8; 10],
            addresses: vec![genesis_address],
            reward: Reward { account_id: 0, funds: crate::funds::Funds::ZERO },
            transfers: vec![],
            cancelations: vec![],
            token_sections: vec![],
        };
        let header = Header {
            prev_hash: Hash::ZERO,
            target_compact: 0x1f00_ffff,
            merkle_root: body.transactions_root(),
            version: crate::body::BODY_VERSION_CUTOVER,
            timestamp: 0,
            nonce_tail: 0,
        };
        Block::new(header, body)
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    /// Structural validity: PoW target met, merkle root matches the body's
    /// transactions, and the body parses under its own declared version.
    /// Balance/nonce/signature admission is the mempool/state layer's job,
    /// not this type's — a block can be structurally valid and still be
    /// rejected on replay.
    pub fn verify_structure(&self) -> Result<(), CoreError> {
        if !self.header.meets_target() {
            return Err(CoreError::InvalidBody);
        }
        if self.body.0.transactions_root() != self.header.merkle_root {
            return Err(CoreError::InvalidBody);
        }
        Ok(())
    }

    pub fn total_fees(&self) -> Result<crate::funds::Funds, CoreError> {
        let body = &self.body.0;
        body.transfers
            .iter()
            .chain(body.cancelations.iter())
            .chain(body.token_sections.iter().flat_map(|s| {
                s.transfers.iter().chain(s.orders.iter()).chain(s.liquidity_add.iter()).chain(s.liquidity_remove.iter())
            }))
            .try_fold(crate::funds::Funds::ZERO, |acc, tx| acc.checked_add(crate::funds::Funds::from_value(tx.fee.value())?))
    }
}
