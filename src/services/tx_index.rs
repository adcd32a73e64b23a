//! Transaction index: txid -> location of the block that confirmed it.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::block::StoredBlock;
use crate::error::StorageError;
use crate::service::{DependentService, Mutation, ServiceError};
use crate::storage::ChainStore;
use crate::types::Hash256;

const TX_PREFIX: &[u8] = b"tx/";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxLocation {
    pub block_hash: Hash256,
    pub block_height: u64,
    pub tx_index: usize,
}

pub struct TxIndexService {
    store: ChainStore,
}

impl TxIndexService {
    pub const NAME: &'static str = "txindex";

    pub fn new(store: ChainStore) -> Self {
        Self { store }
    }

    fn key(txid: &Hash256) -> Vec<u8> {
        [TX_PREFIX, txid.as_slice()].concat()
    }

    /// Get transaction location from index
    pub fn get_location(&self, txid: &Hash256) -> Result<Option<TxLocation>, StorageError> {
        match self.store.kv().get(&Self::key(txid))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Get total number of indexed transactions
    pub fn len(&self) -> Result<usize, StorageError> {
        Ok(self.store.kv().scan_prefix(TX_PREFIX)?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl DependentService for TxIndexService {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn on_block(&self, block: &StoredBlock) -> Result<Option<Vec<Mutation>>, ServiceError> {
        let mut mutations = Vec::with_capacity(block.txids.len());
        let mut seen = HashSet::with_capacity(block.txids.len());
        for (tx_index, txid) in block.txids.iter().enumerate() {
            // The earliest confirmation keeps the entry
            if !seen.insert(*txid) || self.get_location(txid)?.is_some() {
                continue;
            }
            let location = TxLocation {
                block_hash: block.hash,
                block_height: block.height,
                tx_index,
            };
            mutations.push(Mutation::put_encoded(Self::key(txid), &location)?);
        }
        Ok(Some(mutations))
    }

    async fn on_reorg(
        &self,
        _common_ancestor: &Hash256,
        block: &StoredBlock,
    ) -> Result<Option<Vec<Mutation>>, ServiceError> {
        let mut mutations = Vec::new();
        for txid in &block.txids {
            // A repeated txid stays with the block that first confirmed it
            if let Some(location) = self.get_location(txid)? {
                if location.block_hash == block.hash {
                    mutations.push(Mutation::delete(Self::key(txid)));
                }
            }
        }
        Ok(Some(mutations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Block, BlockHeader, RawTransaction};

    fn block_with(prev: Hash256, height: u64, txs: &[u8]) -> StoredBlock {
        Block {
            header: BlockHeader {
                version: 1,
                prev_hash: prev,
                merkle_root: [0u8; 32],
                timestamp: height as u32,
                bits: 0x207fffff,
                nonce: 0,
                stake: None,
            },
            transactions: txs.iter().map(|b| RawTransaction(vec![*b])).collect(),
        }
        .into_stored(height)
    }

    fn block() -> StoredBlock {
        block_with([3u8; 32], 7, &[1, 2])
    }

    async fn apply(index: &TxIndexService, store: &ChainStore, block: &StoredBlock) {
        store
            .commit(index.on_block(block).await.unwrap().unwrap())
            .unwrap();
    }

    async fn undo(index: &TxIndexService, store: &ChainStore, block: &StoredBlock) {
        store
            .commit(index.on_reorg(&block.prev_hash(), block).await.unwrap().unwrap())
            .unwrap();
    }

    #[tokio::test]
    async fn test_index_and_unindex() {
        let store = ChainStore::in_memory();
        let index = TxIndexService::new(store.clone());
        let block = block();

        let mutations = index.on_block(&block).await.unwrap().unwrap();
        store.commit(mutations).unwrap();
        assert_eq!(index.len().unwrap(), 2);
        assert_eq!(
            index.get_location(&block.txids[1]).unwrap(),
            Some(TxLocation {
                block_hash: block.hash,
                block_height: 7,
                tx_index: 1,
            })
        );

        let undo = index.on_reorg(&[3u8; 32], &block).await.unwrap().unwrap();
        store.commit(undo).unwrap();
        assert!(index.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_repeated_txid_keeps_first_location() {
        let store = ChainStore::in_memory();
        let index = TxIndexService::new(store.clone());
        let first = block();
        let second = block_with(first.hash, 8, &[1, 3, 3]);
        let repeated = first.txids[0];
        assert_eq!(second.txids[0], repeated);

        apply(&index, &store, &first).await;
        apply(&index, &store, &second).await;
        assert_eq!(index.len().unwrap(), 3);
        assert_eq!(index.get_location(&repeated).unwrap().unwrap().block_hash, first.hash);
        assert_eq!(index.get_location(&second.txids[1]).unwrap().unwrap().tx_index, 1);

        undo(&index, &store, &second).await;
        assert_eq!(
            index.get_location(&repeated).unwrap(),
            Some(TxLocation {
                block_hash: first.hash,
                block_height: 7,
                tx_index: 0,
            })
        );
        assert!(index.get_location(&second.txids[1]).unwrap().is_none());

        undo(&index, &store, &first).await;
        assert!(index.is_empty().unwrap());
    }
}
