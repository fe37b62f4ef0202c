//! Transaction record types (spec §3 "Block body", §4.3 transaction-id
//! derivation). Every signed record shares a prefix of
//! `(origin accountId, PinNonce, CompactUInt fee)` followed by a
//! variant-specific payload and a recoverable signature.

use crate::compact::CompactUInt;
use crate::crypto::RecoverableSignature;
use crate::error::CoreError;
use crate::funds::Funds;
use crate::hash::{AccountId, Address, Hash};
use crate::height::{pinheight_from_floored, Height};
use crate::price::Price;
use serde::{Deserialize, Serialize};

pub type TokenId = u64;

/// `nonceId` (24 bits used) plus a 7-bit offset from the containing
/// block's pin floor; packed this way so the mempool and the wire codec
/// never need a full 32-bit pin height per transaction.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug)]
pub struct PinNonce {
    pub nonce_id: u32,
    pub offset: u8,
}

impl PinNonce {
    pub fn new(nonce_id: u32, offset: u8) -> Self {
        assert!(nonce_id < (1 << 24), "nonce_id must fit 24 bits");
        assert!(offset < (1 << 7), "offset must fit 7 bits");
        PinNonce { nonce_id, offset }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug)]
pub struct TransactionId {
    pub origin: AccountId,
    pub pin_height: Height,
    pub nonce_id: u32,
}

impl TransactionId {
    pub fn derive(origin: AccountId, pin_floor: Height, pin_nonce: PinNonce) -> Self {
        TransactionId {
            origin,
            pin_height: pinheight_from_floored(pin_floor, pin_nonce.offset),
            nonce_id: pin_nonce.nonce_id,
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub enum TransactionVariant {
    Transfer { to: AccountId, amount: Funds },
    Cancelation { token_id: TokenId, cancel_txid: TransactionId },
    CreateOrder { token_id: TokenId, amount: Funds, limit: Price, buy: bool },
    AddLiquidity { token_id: TokenId, base_amount: Funds, quote_amount: Funds },
    RemoveLiquidity { token_id: TokenId, shares: Funds },
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Transaction {
    pub origin: AccountId,
    pub pin_nonce: PinNonce,
    pub fee: CompactUInt,
    pub variant: TransactionVariant,
    pub signature: RecoverableSignature,
}

impl Transaction {
    /// Bytes the signature is computed over: everything but the
    /// signature itself.
    pub fn signing_message(&self) -> Hash {
        let payload = (self.origin, self.pin_nonce, self.fee, &self.variant);
        Hash::new(&bincode::serialize(&payload).expect("transaction payload is serializable"))
    }

    pub fn tx_hash(&self) -> Hash {
        Hash::new(&bincode::serialize(self).expect("transaction is serializable"))
    }

    pub fn txid(&self, pin_floor: Height) -> TransactionId {
        TransactionId::derive(self.origin, pin_floor, self.pin_nonce)
    }

    /// Verifies the embedded signature recovers to `claimed_address`,
    /// returning `EFAKEACCID` otherwise. Callers must run this *before*
    /// touching any balance-reservation bookkeeping for `self.origin` —
    /// see the design notes on the source's EFAKEACCID/balance-cache
    /// ordering bug.
    pub fn verify_origin(&self, claimed_address: Address) -> Result<(), CoreError> {
        let message = self.signing_message();
        match self.signature.recover_pubkey(&message) {
            Some(pk) if pk.to_address() == claimed_address => Ok(()),
            _ => Err(CoreError::FakeAccountId),
        }
    }

    /// Total funds this transaction removes from the origin account's
    /// available balance: fee plus any amount it locks or sends.
    pub fn debit(&self) -> Result<Funds, CoreError> {
        let amount = match &self.variant {
            TransactionVariant::Transfer { amount, .. } => *amount,
            TransactionVariant::CreateOrder { amount, .. } => *amount,
            TransactionVariant::AddLiquidity { base_amount, quote_amount, .. } => base_amount.checked_add(*quote_amount)?,
            TransactionVariant::Cancelation { .. } | TransactionVariant::RemoveLiquidity { .. } => Funds::ZERO,
        };
        amount.checked_add(Funds::from_value(self.fee.value())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn sample_transfer(origin: AccountId, keys: &KeyPair) -> Transaction {
        let pin_nonce = PinNonce::new(1, 0);
        let fee = CompactUInt::compress(10);
        let variant = TransactionVariant::Transfer { to: 2, amount: Funds::from_value(100).unwrap() };
        let unsigned = Transaction {
            origin,
            pin_nonce,
            fee,
            variant,
            signature: RecoverableSignature::from_parts(keys.public_key(), [0u8; 64]),
        };
        let message = unsigned.signing_message();
        Transaction { signature: keys.sign(message.as_bytes()), ..unsigned }
    }

    #[test]
    fn signing_message_excludes_the_signature_itself() {
        let keys = KeyPair::generate();
        let tx = sample_transfer(1, &keys);
        assert!(tx.verify_origin(keys.address()).is_ok());
    }

    #[test]
    fn wrong_claimed_address_is_rejected() {
        let keys = KeyPair::generate();
        let tx = sample_transfer(1, &keys);
        let other = KeyPair::generate();
        assert_eq!(tx.verify_origin(other.address()), Err(CoreError::FakeAccountId));
    }

    #[test]
    fn txid_derivation_reconstructs_absolute_pin_height() {
        let keys = KeyPair::generate();
        let tx = sample_transfer(7, &keys);
        let floor = Height::new(640);
        let txid = tx.txid(floor);
        assert_eq!(txid.origin, 7);
        assert_eq!(txid.pin_height, Height::new(640));
        assert_eq!(txid.nonce_id, 1);
    }
}
