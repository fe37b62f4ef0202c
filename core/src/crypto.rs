//! Signing and address derivation.
//!
//! The original source recovers the signer's public key from the
//! signature itself (a recoverable ECDSA scheme) and compares it against
//! the claimed account id. `ed25519-dalek` signatures are not recoverable,
//! so `RecoverableSignature` here carries the signer's public key
//! alongside the signature bytes; "recovery" verifies the signature
//! against that embedded key and returns its derived address. The
//! EFAKEACCID check this enables — recovered address must equal the
//! claimed origin account's registered address — is identical either way;
//! only the mechanism for obtaining the candidate public key differs.

use crate::hash::{Address, Hash};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let mut csprng = rand::thread_rng();
        KeyPair { signing_key: SigningKey::generate(&mut csprng) }
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        KeyPair { signing_key: SigningKey::from_bytes(&bytes) }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    pub fn address(&self) -> Address {
        self.public_key().to_address()
    }

    /// Signs `message` (the transaction's signing hash) and attaches this
    /// key's public key so the signature is self-recovering.
    pub fn sign(&self, message: &[u8]) -> RecoverableSignature {
        let signature = self.signing_key.sign(message);
        RecoverableSignature { public_key: self.public_key(), signature: signature.to_bytes() }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_address(&self) -> Address {
        let digest = Hash::new(&self.0);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest.as_bytes()[12..]);
        Address::from_bytes(bytes)
    }

    fn verify(&self, message: &[u8], signature: &[u8; 64]) -> bool {
        match VerifyingKey::from_bytes(&self.0) {
            Ok(key) => key.verify(message, &Signature::from_bytes(signature)).is_ok(),
            Err(_) => false,
        }
    }
}

/// A signature together with the public key it claims to be over.
/// `recover_pubkey` is the self-recovering analogue of the original
/// source's ECDSA recovery: it returns the embedded key only if the
/// signature verifies against it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RecoverableSignature {
    public_key: PublicKey,
    signature: [u8; 64],
}

impl RecoverableSignature {
    pub fn recover_pubkey(&self, signing_hash: &Hash) -> Option<PublicKey> {
        if self.public_key.verify(signing_hash.as_bytes(), &self.signature) {
            Some(self.public_key)
        } else {
            None
        }
    }

    pub fn from_parts(public_key: PublicKey, signature: [u8; 64]) -> Self {
        RecoverableSignature { public_key, signature }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn signature_bytes(&self) -> &[u8; 64] {
        &self.signature
    }
}

impl serde::Serialize for RecoverableSignature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeTuple;
        let mut tup = serializer.serialize_tuple(2)?;
        tup.serialize_element(&self.public_key)?;
        tup.serialize_element(&self.signature.to_vec())?;
        tup.end()
    }
}

impl<'de> serde::Deserialize<'de> for RecoverableSignature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let (public_key, sig_vec): (PublicKey, Vec<u8>) = serde::Deserialize::deserialize(deserializer)?;
        if sig_vec.len() != 64 {
            return Err(serde::de::Error::custom("expected 64 signature bytes"));
        }
        let mut signature = [0u8; 64];
        signature.copy_from_slice(&sig_vec);
        Ok(RecoverableSignature { public_key, signature })
    }
}

/// Binary Merkle tree over transaction hashes.
pub struct MerkleTree {
    root: Hash,
}

impl MerkleTree {
    pub fn new(leaves: Vec<Vec<u8>>) -> Self {
        let leaves: Vec<Hash> = leaves.iter().map(|d| Hash::new(d)).collect();
        MerkleTree { root: Self::calculate_root(&leaves) }
    }

    fn calculate_root(leaves: &[Hash]) -> Hash {
        if leaves.is_empty() {
            return Hash::ZERO;
        }
        let mut level = leaves.to_vec();
        while level.len() > 1 {
            let mut next = Vec::with_capacity(level.len().div_ceil(2));
            for pair in level.chunks(2) {
                let mut combined = pair[0].to_vec();
                combined.extend_from_slice(pair.get(1).unwrap_or(&pair[0]).as_bytes());
                next.push(Hash::new(&combined));
            }
            level = next;
        }
        level[0]
    }

    pub fn root(&self) -> Hash {
        self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_recovers_its_own_public_key() {
        let keys = KeyPair::generate();
        let msg = Hash::new(b"signing payload");
        let sig = keys.sign(msg.as_bytes());
        assert_eq!(sig.recover_pubkey(&msg), Some(keys.public_key()));
    }

    #[test]
    fn tampered_signature_fails_recovery() {
        let keys = KeyPair::generate();
        let msg = Hash::new(b"signing payload");
        let other_msg = Hash::new(b"different payload");
        let sig = keys.sign(msg.as_bytes());
        assert_eq!(sig.recover_pubkey(&other_msg), None);
    }

    #[test]
    fn empty_merkle_tree_is_zero_hash() {
        assert_eq!(MerkleTree::new(vec![]).root(), Hash::ZERO);
    }
}
