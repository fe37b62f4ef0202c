// Genesis block configuration for a running node.

use coinject_core::{Address, Block, Hash};

/// Genesis block configuration.
pub struct GenesisConfig {
    pub genesis_address: Address,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        let mut addr_bytes = [0u8; 20];
        addr_bytes[19] = 1;
        GenesisConfig { genesis_address: Address::from_bytes(addr_bytes) }
    }
}

pub fn create_genesis_block(config: &GenesisConfig) -> Block {
    Block::genesis(config.genesis_address)
}

pub fn genesis_hash() -> Hash {
    create_genesis_block(&GenesisConfig::default()).header.hash()
}

pub fn is_valid_genesis(block: &Block) -> bool {
    block.header.prev_hash == Hash::ZERO && block.body.0.transfers.is_empty() && block.body.0.cancelations.is_empty() && block.verify_structure().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_block_is_internally_consistent() {
        let genesis = create_genesis_block(&GenesisConfig::default());
        assert_eq!(genesis.header.prev_hash, Hash::ZERO);
        assert!(is_valid_genesis(&genesis));
    }

    #[test]
    fn genesis_hash_is_deterministic() {
        assert_eq!(genesis_hash(), genesis_hash());
    }

    #[test]
    fn tampered_prev_hash_is_not_a_valid_genesis() {
        let mut genesis = create_genesis_block(&GenesisConfig::default());
        genesis.header.prev_hash = Hash::new(b"not genesis");
        assert!(!is_valid_genesis(&genesis));
    }
}
