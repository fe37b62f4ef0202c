//! 80-byte block header codec (C3, spec §6.2).

use crate::error::CoreError;
use crate::hash::Hash;
use crate::height::Height;
use serde::{Deserialize, Serialize};

pub const HEADER_SIZE: usize = 80;

/// `prevHash[32] || targetCompact[4] || merkleRoot[32] || version[4] ||
/// timestamp[4] || nonceTail[4]`.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct Header {
    pub prev_hash: Hash,
    pub target_compact: u32,
    pub merkle_root: Hash,
    pub version: u32,
    pub timestamp: u32,
    pub nonce_tail: u32,
}

impl Header {
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..32].copy_from_slice(self.prev_hash.as_bytes());
        out[32..36].copy_from_slice(&self.target_compact.to_be_bytes());
        out[36..68].copy_from_slice(self.merkle_root.as_bytes());
        out[68..72].copy_from_slice(&self.version.to_be_bytes());
        out[72..76].copy_from_slice(&self.timestamp.to_be_bytes());
        out[76..80].copy_from_slice(&self.nonce_tail.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        if bytes.len() != HEADER_SIZE {
            return Err(CoreError::Malformed);
        }
        let mut prev = [0u8; 32];
        prev.copy_from_slice(&bytes[0..32]);
        let mut merkle = [0u8; 32];
        merkle.copy_from_slice(&bytes[36..68]);
        Ok(Header {
            prev_hash: Hash::from_bytes(prev),
            target_compact: u32::from_be_bytes(bytes[32..36].try_into().unwrap()),
            merkle_root: Hash::from_bytes(merkle),
            version: u32::from_be_bytes(bytes[68..72].try_into().unwrap()),
            timestamp: u32::from_be_bytes(bytes[72..76].try_into().unwrap()),
            nonce_tail: u32::from_be_bytes(bytes[76..80].try_into().unwrap()),
        })
    }

    pub fn hash(&self) -> Hash {
        Hash::new(&self.to_bytes())
    }

    /// Decodes the compact (mantissa, exponent) difficulty encoding into a
    /// full 32-byte target for the unsigned big-endian comparison.
    pub fn target(&self) -> Hash {
        decode_compact_target(self.target_compact)
    }

    pub fn meets_target(&self) -> bool {
        self.hash().leq_target(&self.target())
    }

    /// Body-parser version selector: the body layout cuts over at version 4.
    pub fn body_version(&self, _height: Height) -> u32 {
        self.version
    }
}

/// Bitcoin-style compact target: top byte is the byte-length of the
/// target, the remaining three bytes are its most significant mantissa
/// bytes, left-padded with zero bytes to the indicated length.
pub fn decode_compact_target(compact: u32) -> Hash {
    let exponent = (compact >> 24) as usize;
    let mantissa = compact & 0x00ff_ffff;
    let mut bytes = [0u8; 32];
    if exponent <= 3 {
        let shifted = mantissa >> (8 * (3 - exponent));
        bytes[29..32].copy_from_slice(&shifted.to_be_bytes()[1..]);
    } else if exponent <= 32 {
        let start = 32 - exponent;
        bytes[start..start + 3].copy_from_slice(&mantissa.to_be_bytes()[1..]);
    }
    Hash::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Header {
        Header {
            prev_hash: Hash::new(b"prev"),
            target_compact: 0x1f00_ffff,
            merkle_root: Hash::new(b"merkle"),
            version: 4,
            timestamp: 1_700_000_000,
            nonce_tail: 42,
        }
    }

    #[test]
    fn header_round_trips_through_bytes() {
        let h = sample_header();
        let bytes = h.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(Header::from_bytes(&bytes).unwrap(), h);
    }

    #[test]
    fn malformed_length_is_rejected() {
        assert!(Header::from_bytes(&[0u8; 79]).is_err());
    }

    #[test]
    fn easier_compact_target_decodes_larger() {
        let easy = decode_compact_target(0x1f00_ffff);
        let hard = decode_compact_target(0x1c00_ffff);
        assert!(hard.as_bytes() < easy.as_bytes());
    }
}
