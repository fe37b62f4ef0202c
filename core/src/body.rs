//! Block body codec (C4, spec §4.3 / §6.1). The outer section framing
//! (counts, the address table, the 10-bit-packed per-token length block)
//! is a manual byte-for-byte codec because the wire format is an explicit
//! external interface; the individual signed transaction records inside
//! each section are encoded with `bincode`, which is itself
//! length-implicit for these fixed-shape types and so needs no extra
//! framing of its own.

use crate::crypto::MerkleTree;
use crate::error::CoreError;
use crate::funds::Funds;
use crate::hash::{AccountId, Address, Hash};
use crate::transaction::{Transaction, TransactionVariant};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

pub const MAXBLOCKSIZE: usize = 4 * 1024 * 1024;
/// Body layout cuts over to the wider post-cutover format at this header
/// version.
pub const BODY_VERSION_CUTOVER: u32 = 4;

#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct Reward {
    pub account_id: AccountId,
    pub funds: Funds,
}

#[derive(Clone, PartialEq, Debug, Default)]
pub struct TokenSection {
    pub token_id: u64,
    pub transfers: Vec<Transaction>,
    pub orders: Vec<Transaction>,
    pub liquidity_add: Vec<Transaction>,
    pub liquidity_remove: Vec<Transaction>,
}

#[derive(Clone, PartialEq, Debug)]
pub struct Body {
    pub mining_scratch: [u8; 10],
    pub addresses: Vec<Address>,
    pub reward: Reward,
    pub transfers: Vec<Transaction>,
    pub cancelations: Vec<Transaction>,
    pub token_sections: Vec<TokenSection>,
}

fn write_tx(out: &mut Vec<u8>, tx: &Transaction) -> Result<(), CoreError> {
    bincode::serialize_into(out, tx).map_err(|_| CoreError::InvalidBody)
}

fn read_tx(cursor: &mut Cursor<&[u8]>) -> Result<Transaction, CoreError> {
    bincode::deserialize_from(cursor).map_err(|_| CoreError::InvalidBody)
}

/// Packs four sub-10-bit counts into 5 bytes (40 bits), as the original
/// source's token-section header does.
fn pack_four_lengths(lengths: [u16; 4]) -> Result<[u8; 5], CoreError> {
    if lengths.iter().any(|&l| l >= 1 << 10) {
        return Err(CoreError::InvalidBody);
    }
    let packed: u64 = lengths.iter().enumerate().fold(0u64, |acc, (i, &l)| acc | ((l as u64) << (10 * i)));
    Ok(packed.to_le_bytes()[..5].try_into().unwrap())
}

fn unpack_four_lengths(bytes: [u8; 5]) -> [u16; 4] {
    let mut buf = [0u8; 8];
    buf[..5].copy_from_slice(&bytes);
    let packed = u64::from_le_bytes(buf);
    let mut out = [0u16; 4];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = ((packed >> (10 * i)) & 0x3ff) as u16;
    }
    out
}

impl Body {
    /// Merkle root over every signed record the body carries (transfers,
    /// cancelations, and each token section's records), in that order.
    pub fn transactions_root(&self) -> Hash {
        let leaves: Vec<Vec<u8>> = self
            .transfers
            .iter()
            .chain(self.cancelations.iter())
            .chain(self.token_sections.iter().flat_map(|s| {
                s.transfers.iter().chain(s.orders.iter()).chain(s.liquidity_add.iter()).chain(s.liquidity_remove.iter())
            }))
            .map(|tx| tx.tx_hash().to_vec())
            .collect();
        MerkleTree::new(leaves).root()
    }

    pub fn serialize(&self, version: u32) -> Result<Vec<u8>, CoreError> {
        let mut out = Vec::new();
        if version >= BODY_VERSION_CUTOVER {
            out.extend_from_slice(&self.mining_scratch);
        } else {
            out.extend_from_slice(&self.mining_scratch[..4]);
        }

        if version < BODY_VERSION_CUTOVER {
            let addr_count: u32 = self.addresses.len().try_into().map_err(|_| CoreError::InvalidBody)?;
            out.extend_from_slice(&addr_count.to_le_bytes());
        } else {
            let addr_count: u16 = self.addresses.len().try_into().map_err(|_| CoreError::InvalidBody)?;
            out.extend_from_slice(&addr_count.to_le_bytes());
        }
        for addr in &self.addresses {
            out.extend_from_slice(addr.as_bytes());
        }

        if version < BODY_VERSION_CUTOVER {
            out.extend_from_slice(&[0u8; 2]);
        }

        out.extend_from_slice(&self.reward.account_id.to_le_bytes());
        out.extend_from_slice(&self.reward.funds.value().to_le_bytes());

        let transfer_count: u32 = self.transfers.len().try_into().map_err(|_| CoreError::InvalidBody)?;
        out.extend_from_slice(&transfer_count.to_le_bytes());
        for tx in &self.transfers {
            write_tx(&mut out, tx)?;
        }

        if version >= BODY_VERSION_CUTOVER {
            let cancel_count: u16 = self.cancelations.len().try_into().map_err(|_| CoreError::InvalidBody)?;
            out.extend_from_slice(&cancel_count.to_le_bytes());
            for tx in &self.cancelations {
                write_tx(&mut out, tx)?;
            }

            let section_count: u16 = self.token_sections.len().try_into().map_err(|_| CoreError::InvalidBody)?;
            out.extend_from_slice(&section_count.to_le_bytes());
            for section in &self.token_sections {
                out.extend_from_slice(&section.token_id.to_le_bytes());
                let lengths = [
                    section.transfers.len() as u16,
                    section.orders.len() as u16,
                    section.liquidity_add.len() as u16,
                    section.liquidity_remove.len() as u16,
                ];
                out.extend_from_slice(&pack_four_lengths(lengths)?);
                for tx in &section.transfers {
                    write_tx(&mut out, tx)?;
                }
                for tx in &section.orders {
                    write_tx(&mut out, tx)?;
                }
                for tx in &section.liquidity_add {
                    write_tx(&mut out, tx)?;
                }
                for tx in &section.liquidity_remove {
                    write_tx(&mut out, tx)?;
                }
            }
        }

        if out.len() > MAXBLOCKSIZE {
            return Err(CoreError::InvalidBody);
        }
        Ok(out)
    }

    pub fn parse(bytes: &[u8], version: u32) -> Result<Self, CoreError> {
        if bytes.len() > MAXBLOCKSIZE {
            return Err(CoreError::InvalidBody);
        }
        let mut cursor = Cursor::new(bytes);
        let scratch_len = if version >= BODY_VERSION_CUTOVER { 10 } else { 4 };
        let mut mining_scratch = [0u8; 10];
        read_exact(&mut cursor, &mut mining_scratch[..scratch_len])?;

        let addr_count: u32 = if version < BODY_VERSION_CUTOVER { read_u32(&mut cursor)? } else { read_u16(&mut cursor)? as u32 };
        let mut addresses = Vec::with_capacity(addr_count as usize);
        for _ in 0..addr_count {
            let mut buf = [0u8; 20];
            read_exact(&mut cursor, &mut buf)?;
            addresses.push(Address::from_bytes(buf));
        }

        if version < BODY_VERSION_CUTOVER {
            let mut skip = [0u8; 2];
            read_exact(&mut cursor, &mut skip)?;
        }

        let mut account_buf = [0u8; 8];
        read_exact(&mut cursor, &mut account_buf)?;
        let mut funds_buf = [0u8; 8];
        read_exact(&mut cursor, &mut funds_buf)?;
        let reward = Reward {
            account_id: AccountId::from_le_bytes(account_buf),
            funds: Funds::from_value(u64::from_le_bytes(funds_buf))?,
        };

        let transfer_count = read_u32(&mut cursor)?;
        let mut transfers = Vec::with_capacity(transfer_count as usize);
        for _ in 0..transfer_count {
            let tx = read_tx(&mut cursor)?;
            require_variant(&tx, |v| matches!(v, TransactionVariant::Transfer { .. }))?;
            transfers.push(tx);
        }

        let (cancelations, token_sections) = if version >= BODY_VERSION_CUTOVER {
            let cancel_count = read_u16(&mut cursor)?;
            let mut cancelations = Vec::with_capacity(cancel_count as usize);
            for _ in 0..cancel_count {
                let tx = read_tx(&mut cursor)?;
                require_variant(&tx, |v| matches!(v, TransactionVariant::Cancelation { .. }))?;
                cancelations.push(tx);
            }

            let section_count = read_u16(&mut cursor)?;
            let mut token_sections = Vec::with_capacity(section_count as usize);
            for _ in 0..section_count {
                let mut id_buf = [0u8; 8];
                read_exact(&mut cursor, &mut id_buf)?;
                let token_id = u64::from_le_bytes(id_buf);
                let mut packed = [0u8; 5];
                read_exact(&mut cursor, &mut packed)?;
                let [n_transfers, n_orders, n_ladd, n_lrem] = unpack_four_lengths(packed);

                let mut read_n = |n: u16, check: fn(&TransactionVariant) -> bool| -> Result<Vec<Transaction>, CoreError> {
                    let mut out = Vec::with_capacity(n as usize);
                    for _ in 0..n {
                        let tx = read_tx(&mut cursor)?;
                        require_variant(&tx, check)?;
                        out.push(tx);
                    }
                    Ok(out)
                };

                token_sections.push(TokenSection {
                    token_id,
                    transfers: read_n(n_transfers, |v| matches!(v, TransactionVariant::Transfer { .. }))?,
                    orders: read_n(n_orders, |v| matches!(v, TransactionVariant::CreateOrder { .. }))?,
                    liquidity_add: read_n(n_ladd, |v| matches!(v, TransactionVariant::AddLiquidity { .. }))?,
                    liquidity_remove: read_n(n_lrem, |v| matches!(v, TransactionVariant::RemoveLiquidity { .. }))?,
                });
            }
            (cancelations, token_sections)
        } else {
            (Vec::new(), Vec::new())
        };

        Ok(Body { mining_scratch, addresses, reward, transfers, cancelations, token_sections })
    }
}

fn require_variant(tx: &Transaction, check: fn(&TransactionVariant) -> bool) -> Result<(), CoreError> {
    if check(&tx.variant) {
        Ok(())
    } else {
        Err(CoreError::InvalidBody)
    }
}

fn read_exact(cursor: &mut Cursor<&[u8]>, buf: &mut [u8]) -> Result<(), CoreError> {
    std::io::Read::read_exact(cursor, buf).map_err(|_| CoreError::Malformed)
}

fn read_u16(cursor: &mut Cursor<&[u8]>) -> Result<u16, CoreError> {
    let mut buf = [0u8; 2];
    read_exact(cursor, &mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32, CoreError> {
    let mut buf = [0u8; 4];
    read_exact(cursor, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compact::CompactUInt;
    use crate::crypto::{KeyPair, RecoverableSignature};
    use crate::transaction::PinNonce;

    fn signed_transfer(keys: &KeyPair, to: AccountId, amount: u64) -> Transaction {
        let unsigned = Transaction {
            origin: 1,
            pin_nonce: PinNonce::new(0, 0),
            fee: CompactUInt::compress(5),
            variant: TransactionVariant::Transfer { to, amount: Funds::from_value(amount).unwrap() },
            signature: RecoverableSignature::from_parts(keys.public_key(), [0u8; 64]),
        };
        let msg = unsigned.signing_message();
        Transaction { signature: keys.sign(msg.as_bytes()), ..unsigned }
    }

    fn sample_body(keys: &KeyPair) -> Body {
        Body {
            mining_scratch: [7u8; 10],
            addresses: vec![Address::from_bytes([1u8; 20]), Address::from_bytes([2u8; 20])],
            reward: Reward { account_id: 1, funds: Funds::from_value(5_000).unwrap() },
            transfers: vec![signed_transfer(keys, 2, 100)],
            cancelations: vec![],
            token_sections: vec![],
        }
    }

    #[test]
    fn body_round_trips_post_cutover() {
        let keys = KeyPair::generate();
        let body = sample_body(&keys);
        let bytes = body.serialize(BODY_VERSION_CUTOVER).unwrap();
        let parsed = Body::parse(&bytes, BODY_VERSION_CUTOVER).unwrap();
        assert_eq!(parsed, body);
    }

    #[test]
    fn body_round_trips_pre_cutover_without_token_sections() {
        let keys = KeyPair::generate();
        let body = sample_body(&keys);
        let bytes = body.serialize(1).unwrap();
        let parsed = Body::parse(&bytes, 1).unwrap();
        assert_eq!(parsed.transfers, body.transfers);
        assert!(parsed.token_sections.is_empty());
    }

    #[test]
    fn pre_cutover_address_count_is_32_bit_on_the_wire() {
        let keys = KeyPair::generate();
        let body = sample_body(&keys);
        let bytes = body.serialize(1).unwrap();
        // mining_scratch[..4] then a little-endian u32 addr_count, per spec's
        // pre-cutover 32-bit address count (not the post-cutover u16).
        let addr_count = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        assert_eq!(addr_count, body.addresses.len() as u32);
        let parsed = Body::parse(&bytes, 1).unwrap();
        assert_eq!(parsed.addresses, body.addresses);
    }

    #[test]
    fn pack_unpack_four_lengths_round_trips() {
        let lengths = [1000u16, 3, 512, 999];
        let packed = pack_four_lengths(lengths).unwrap();
        assert_eq!(unpack_four_lengths(packed), lengths);
    }

    #[test]
    fn oversize_section_length_is_rejected() {
        assert!(pack_four_lengths([1024, 0, 0, 0]).is_err());
    }

    #[test]
    fn truncated_body_is_malformed_not_a_panic() {
        let keys = KeyPair::generate();
        let body = sample_body(&keys);
        let bytes = body.serialize(BODY_VERSION_CUTOVER).unwrap();
        let truncated = &bytes[..bytes.len() - 3];
        assert!(Body::parse(truncated, BODY_VERSION_CUTOVER).is_err());
    }
}
