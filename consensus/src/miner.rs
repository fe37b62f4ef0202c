//! Proof-of-work mining loop: sweep the header's 32-bit nonce tail
//! against the block's difficulty target, built on
//! `Header::meets_target`/`Header::hash` from `coinject-core`.

use coinject_core::body::{Body, Reward, TokenSection};
use coinject_core::{AccountId, Block, Funds, Header, Height, Transaction, TransactionVariant};
use coinject_tokenomics::RewardSchedule;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

pub struct MiningConfig {
    pub miner_account: AccountId,
    pub reward_schedule: RewardSchedule,
}

impl Default for MiningConfig {
    fn default() -> Self {
        MiningConfig { miner_account: 0, reward_schedule: RewardSchedule::default() }
    }
}

pub struct Miner {
    config: MiningConfig,
}

impl Miner {
    pub fn new(config: MiningConfig) -> Self {
        Miner { config }
    }

    /// Assembles a candidate block body: the coinbase reward plus
    /// whatever mempool transactions the caller selected, sorted back
    /// into the body's per-variant sections (mempool selection itself
    /// doesn't distinguish them).
    fn build_body(&self, height: Height, selected: Vec<Transaction>) -> Body {
        let mut transfers = Vec::new();
        let mut cancelations = Vec::new();
        let mut sections: HashMap<u64, TokenSection> = HashMap::new();

        for tx in selected {
            match &tx.variant {
                TransactionVariant::Transfer { .. } => transfers.push(tx),
                TransactionVariant::Cancelation { .. } => cancelations.push(tx),
                TransactionVariant::CreateOrder { token_id, .. } => {
                    sections.entry(*token_id).or_insert_with(|| TokenSection { token_id: *token_id, ..Default::default() }).orders.push(tx)
                }
                TransactionVariant::AddLiquidity { token_id, .. } => sections
                    .entry(*token_id)
                    .or_insert_with(|| TokenSection { token_id: *token_id, ..Default::default() })
                    .liquidity_add
                    .push(tx),
                TransactionVariant::RemoveLiquidity { token_id, .. } => sections
                    .entry(*token_id)
                    .or_insert_with(|| TokenSection { token_id: *token_id, ..Default::default() })
                    .liquidity_remove
                    .push(tx),
            }
        }

        let mut token_sections: Vec<TokenSection> = sections.into_values().collect();
        token_sections.sort_by_key(|s| s.token_id);

        Body {
            mining_scratch: [0u8; 10],
            addresses: Vec::new(),
            reward: Reward { account_id: self.config.miner_account, funds: self.config.reward_schedule.reward_at(height) },
            transfers,
            cancelations,
            token_sections,
        }
    }

    /// Sweeps the 32-bit nonce tail looking for a header hash that meets
    /// `target_compact`. Returns `None` if the whole nonce space is
    /// exhausted without success — the caller should then rebuild the
    /// body (new coinbase, new timestamp) and retry, as a real miner
    /// loop does once a nonce space is drained.
    pub fn mine_block(&self, prev_hash: coinject_core::Hash, height: Height, target_compact: u32, transfers: Vec<Transaction>) -> Option<Block> {
        let body = self.build_body(height, transfers);
        let merkle_root = body.transactions_root();
        let timestamp = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as u32).unwrap_or(0);

        let mut header = Header {
            prev_hash,
            target_compact,
            merkle_root,
            version: coinject_core::body::BODY_VERSION_CUTOVER,
            timestamp,
            nonce_tail: 0,
        };

        for nonce in 0..=u32::MAX {
            header.nonce_tail = nonce;
            if header.meets_target() {
                tracing::info!(height = height.value(), nonce, "block mined");
                return Some(Block::new(header, body));
            }
        }
        tracing::debug!(height = height.value(), "nonce space exhausted without a solution");
        None
    }

    pub fn block_reward(&self, height: Height) -> Funds {
        self.config.reward_schedule.reward_at(height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coinject_core::compact::CompactUInt;
    use coinject_core::crypto::{KeyPair, RecoverableSignature};
    use coinject_core::header::decode_compact_target;
    use coinject_core::transaction::PinNonce;
    use coinject_core::{Hash, Price};

    fn easiest_target() -> u32 {
        // Largest mantissa at a generous exponent: every hash meets it.
        0x20ff_ffff
    }

    fn signed(origin: AccountId, keys: &KeyPair, variant: TransactionVariant) -> Transaction {
        let unsigned = Transaction {
            origin,
            pin_nonce: PinNonce::new(1, 0),
            fee: CompactUInt::compress(0),
            variant,
            signature: RecoverableSignature::from_parts(keys.public_key(), [0u8; 64]),
        };
        let msg = unsigned.signing_message();
        Transaction { signature: keys.sign(msg.as_bytes()), ..unsigned }
    }

    #[test]
    fn mining_against_a_trivial_target_succeeds_immediately() {
        let miner = Miner::new(MiningConfig::default());
        let block = miner.mine_block(Hash::ZERO, Height::new(1), easiest_target(), vec![]);
        assert!(block.is_some());
        let block = block.unwrap();
        assert!(block.header.meets_target());
    }

    #[test]
    fn mined_block_carries_the_configured_reward() {
        let config = MiningConfig { miner_account: 7, reward_schedule: RewardSchedule::new(Funds::from_value(100).unwrap(), 1_000_000) };
        let miner = Miner::new(config);
        let reward = miner.block_reward(Height::new(0));
        assert_eq!(reward.value(), 100);
    }

    #[test]
    fn decoded_target_from_easiest_compact_is_very_large() {
        let target = decode_compact_target(easiest_target());
        assert!(target.as_bytes()[0] > 0);
    }

    #[test]
    fn build_body_sorts_selected_transactions_into_their_own_sections() {
        let keys = KeyPair::generate();
        let transfer = signed(1, &keys, TransactionVariant::Transfer { to: 2, amount: Funds::from_value(10).unwrap() });
        let order = signed(
            1,
            &keys,
            TransactionVariant::CreateOrder { token_id: 42, amount: Funds::from_value(10).unwrap(), limit: Price::from_double(1.0).unwrap(), buy: true },
        );
        let add = signed(1, &keys, TransactionVariant::AddLiquidity { token_id: 42, base_amount: Funds::from_value(5).unwrap(), quote_amount: Funds::from_value(5).unwrap() });

        let miner = Miner::new(MiningConfig::default());
        let body = miner.build_body(Height::new(1), vec![transfer.clone(), order.clone(), add.clone()]);

        assert_eq!(body.transfers, vec![transfer]);
        assert!(body.cancelations.is_empty());
        assert_eq!(body.token_sections.len(), 1);
        assert_eq!(body.token_sections[0].token_id, 42);
        assert_eq!(body.token_sections[0].orders, vec![order]);
        assert_eq!(body.token_sections[0].liquidity_add, vec![add]);
    }
}
