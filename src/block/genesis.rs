//! Genesis block for each network.
//!
//! The genesis block is fixed per network and never validated against its
//! target: it seeds the header index, the block tip and the recent hash ring.

use crate::block::types::{merkle_root, Block, BlockHeader, RawTransaction};
use crate::network_type::NetworkType;
use crate::types::{Hash256, ZERO_HASH};

pub struct GenesisBlock;

impl GenesisBlock {
    /// The genesis block for `network`. Its single transaction carries the
    /// network's genesis message.
    pub fn for_network(network: NetworkType) -> Block {
        let transactions = vec![RawTransaction(network.genesis_message().as_bytes().to_vec())];
        let root = merkle_root(&transactions.iter().map(|tx| tx.txid()).collect::<Vec<_>>());

        Block {
            header: BlockHeader {
                version: 1,
                prev_hash: ZERO_HASH,
                merkle_root: root,
                timestamp: network.genesis_timestamp(),
                bits: network.genesis_bits(),
                nonce: 0,
                stake: None,
            },
            transactions,
        }
    }

    pub fn hash(network: NetworkType) -> Hash256 {
        Self::for_network(network).hash()
    }

    pub fn header(network: NetworkType) -> BlockHeader {
        Self::for_network(network).header
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genesis_is_deterministic() {
        assert_eq!(
            GenesisBlock::hash(NetworkType::Mainnet),
            GenesisBlock::hash(NetworkType::Mainnet)
        );
        assert_ne!(
            GenesisBlock::hash(NetworkType::Mainnet),
            GenesisBlock::hash(NetworkType::Regtest)
        );
    }

    #[test]
    fn test_genesis_merkle_root_matches_transactions() {
        let genesis = GenesisBlock::for_network(NetworkType::Testnet);
        assert_eq!(genesis.header.prev_hash, ZERO_HASH);
        assert_eq!(genesis.compute_merkle_root(), genesis.header.merkle_root);
    }
}
