//! Dependent-service contract.
//!
//! Indexes downstream of the sync engine implement `DependentService`. The
//! `ServiceRegistry` drives them: `on_block` in registration order for every
//! applied block, `on_reorg` in reverse registration order for every removed
//! block. Each service's mutation list is committed together with that
//! service's own tip in one batch, and the tip decides whether a call is a
//! replay that must be skipped.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::block::StoredBlock;
use crate::chain_error::{ChainError, ChainResult};
use crate::error::StorageError;
use crate::storage::ChainStore;
pub use crate::storage::Mutation;
use crate::types::{short_hash, Hash256, Tip};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Failed(String),
}

#[async_trait]
pub trait DependentService: Send + Sync {
    /// Stable name; also the name of the service's tip stream.
    fn name(&self) -> &str;

    /// Index an applied block. Must depend only on the block and the
    /// service's own prior state.
    async fn on_block(&self, block: &StoredBlock) -> Result<Option<Vec<Mutation>>, ServiceError>;

    /// Undo what `on_block` did for `block`.
    async fn on_reorg(
        &self,
        common_ancestor: &Hash256,
        block: &StoredBlock,
    ) -> Result<Option<Vec<Mutation>>, ServiceError>;

    async fn on_headers_synced(&self) -> Result<(), ServiceError> {
        Ok(())
    }
}

pub struct ServiceRegistry {
    services: Vec<Arc<dyn DependentService>>,
    store: ChainStore,
    genesis_hash: Hash256,
}

impl ServiceRegistry {
    pub fn new(store: ChainStore, genesis_hash: Hash256) -> Self {
        Self {
            services: Vec::new(),
            store,
            genesis_hash,
        }
    }

    pub fn register(&mut self, service: Arc<dyn DependentService>) {
        info!("🔌 Registered dependent service {}", service.name());
        self.services.push(service);
    }

    pub fn names(&self) -> Vec<String> {
        self.services.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn stream_name(service: &str) -> String {
        format!("service/{}", service)
    }

    /// A service's persisted tip, `{0, genesis}` when it has none yet.
    pub fn service_tip(&self, service: &str) -> Result<Tip, StorageError> {
        Ok(self
            .store
            .tip(&Self::stream_name(service))?
            .unwrap_or_else(|| Tip::new(0, self.genesis_hash)))
    }

    /// Run `on_block` on every service, in registration order.
    pub async fn apply_block(&self, block: &StoredBlock) -> ChainResult<()> {
        for service in &self.services {
            let name = service.name();
            let tip = self.service_tip(name)?;
            if tip == block.tip() {
                debug!(
                    "⏭️  {} already at block {} ({}), skipping",
                    name,
                    block.height,
                    short_hash(&block.hash)
                );
                continue;
            }

            let mutations = service
                .on_block(block)
                .await
                .map_err(|source| ChainError::Service {
                    service: name.to_string(),
                    source,
                })?;
            self.commit(name, mutations, &block.tip())?;
        }
        Ok(())
    }

    /// Run `on_reorg` for each removed block (newest first), services in
    /// reverse registration order.
    pub async fn rollback(
        &self,
        common_ancestor: &Hash256,
        blocks_newest_first: &[StoredBlock],
    ) -> ChainResult<()> {
        for service in self.services.iter().rev() {
            let name = service.name();
            for block in blocks_newest_first {
                // Only the block the service currently sits on can be undone
                if self.service_tip(name)? != block.tip() {
                    debug!(
                        "⏭️  {} not at block {} ({}), nothing to undo",
                        name,
                        block.height,
                        short_hash(&block.hash)
                    );
                    continue;
                }

                let mutations = service
                    .on_reorg(common_ancestor, block)
                    .await
                    .map_err(|source| ChainError::Service {
                        service: name.to_string(),
                        source,
                    })?;
                let parent = Tip::new(block.height.saturating_sub(1), block.prev_hash());
                self.commit(name, mutations, &parent)?;
            }
        }
        Ok(())
    }

    pub async fn headers_synced(&self) -> ChainResult<()> {
        for service in &self.services {
            service
                .on_headers_synced()
                .await
                .map_err(|source| ChainError::Service {
                    service: service.name().to_string(),
                    source,
                })?;
        }
        Ok(())
    }

    fn commit(
        &self,
        service: &str,
        mutations: Option<Vec<Mutation>>,
        tip: &Tip,
    ) -> Result<(), StorageError> {
        let mut batch = mutations.unwrap_or_default();
        batch.push(ChainStore::tip_mutation(&Self::stream_name(service), tip)?);
        self.store.commit(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Block, BlockHeader, RawTransaction};
    use parking_lot::Mutex;

    /// Records every call and writes one key per block.
    struct Recorder {
        name: String,
        calls: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl DependentService for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn on_block(
            &self,
            block: &StoredBlock,
        ) -> Result<Option<Vec<Mutation>>, ServiceError> {
            if self.fail {
                return Err(ServiceError::Failed("disk full".to_string()));
            }
            self.calls
                .lock()
                .push(format!("{}:block:{}", self.name, block.height));
            Ok(Some(vec![Mutation::put(
                format!("rec/{}/{}", self.name, block.height).into_bytes(),
                block.hash.to_vec(),
            )]))
        }

        async fn on_reorg(
            &self,
            _common_ancestor: &Hash256,
            block: &StoredBlock,
        ) -> Result<Option<Vec<Mutation>>, ServiceError> {
            self.calls
                .lock()
                .push(format!("{}:reorg:{}", self.name, block.height));
            Ok(Some(vec![Mutation::delete(
                format!("rec/{}/{}", self.name, block.height).into_bytes(),
            )]))
        }
    }

    fn block(height: u64, prev: Hash256) -> StoredBlock {
        Block {
            header: BlockHeader {
                version: 1,
                prev_hash: prev,
                merkle_root: [0u8; 32],
                timestamp: height as u32,
                bits: 0x207fffff,
                nonce: height as u32,
                stake: None,
            },
            transactions: vec![RawTransaction(vec![height as u8])],
        }
        .into_stored(height)
    }

    fn registry(calls: &Arc<Mutex<Vec<String>>>) -> (ServiceRegistry, ChainStore) {
        let store = ChainStore::in_memory();
        let mut registry = ServiceRegistry::new(store.clone(), [0u8; 32]);
        for name in ["a", "b"] {
            registry.register(Arc::new(Recorder {
                name: name.to_string(),
                calls: calls.clone(),
                fail: false,
            }));
        }
        (registry, store)
    }

    #[tokio::test]
    async fn test_apply_in_order_and_skip_replay() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (registry, store) = registry(&calls);
        let b1 = block(1, [0u8; 32]);

        registry.apply_block(&b1).await.unwrap();
        registry.apply_block(&b1).await.unwrap();

        assert_eq!(*calls.lock(), vec!["a:block:1", "b:block:1"]);
        assert_eq!(registry.service_tip("a").unwrap(), b1.tip());
        assert!(store.kv().get(b"rec/b/1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rollback_reverse_order_and_idempotent() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (registry, store) = registry(&calls);
        let b1 = block(1, [0u8; 32]);
        let b2 = block(2, b1.hash);
        registry.apply_block(&b1).await.unwrap();
        registry.apply_block(&b2).await.unwrap();
        calls.lock().clear();

        let removed = vec![b2.clone(), b1.clone()];
        registry.rollback(&[0u8; 32], &removed).await.unwrap();
        // Second run finds every service already rolled back
        registry.rollback(&[0u8; 32], &removed).await.unwrap();

        assert_eq!(
            *calls.lock(),
            vec!["b:reorg:2", "b:reorg:1", "a:reorg:2", "a:reorg:1"]
        );
        assert_eq!(registry.service_tip("a").unwrap(), Tip::new(0, [0u8; 32]));
        assert!(store.kv().get(b"rec/a/1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_service_failure_leaves_tip() {
        let store = ChainStore::in_memory();
        let mut registry = ServiceRegistry::new(store, [0u8; 32]);
        registry.register(Arc::new(Recorder {
            name: "broken".to_string(),
            calls: Arc::new(Mutex::new(Vec::new())),
            fail: true,
        }));

        let err = registry.apply_block(&block(1, [0u8; 32])).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(
            registry.service_tip("broken").unwrap(),
            Tip::new(0, [0u8; 32])
        );
    }
}
