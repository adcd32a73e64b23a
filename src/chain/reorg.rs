//! Block-level reorganization.
//!
//! Finds the common ancestor of the applied chain and the header chain inside
//! the recent hash ring, moves the block tip back to it, then has every
//! dependent service undo the removed blocks. The tip moves first so a crash
//! mid-rollback restarts from the ancestor; `recover_interrupted` undoes any
//! service still ahead of the block tip on the next start.

use std::sync::Arc;

use tracing::{info, warn};

use crate::block::{StoredBlock, StoredHeader};
use crate::chain::hash_ring::RecentHashRing;
use crate::chain::header_chain::HeaderChain;
use crate::chain::sync_state::SyncState;
use crate::chain_error::{ChainError, ChainResult};
use crate::constants::chain::BLOCK_STREAM;
use crate::network::InventoryCache;
use crate::notifier::ChainNotifier;
use crate::service::ServiceRegistry;
use crate::storage::ChainStore;
use crate::types::{short_hash, Hash256, Tip};

/// A rollback decided but not yet executed.
#[derive(Debug, Clone)]
pub struct PendingReorg {
    pub common_ancestor: StoredHeader,
    /// Applied blocks strictly above the ancestor, newest first
    pub blocks_to_remove: Vec<StoredBlock>,
}

impl PendingReorg {
    pub fn depth(&self) -> usize {
        self.blocks_to_remove.len()
    }
}

pub struct ReorgCoordinator {
    store: ChainStore,
    registry: Arc<ServiceRegistry>,
    notifier: Arc<ChainNotifier>,
    inventory: Arc<InventoryCache>,
    state: Arc<SyncState>,
}

impl ReorgCoordinator {
    pub fn new(
        store: ChainStore,
        registry: Arc<ServiceRegistry>,
        notifier: Arc<ChainNotifier>,
        inventory: Arc<InventoryCache>,
        state: Arc<SyncState>,
    ) -> Self {
        Self {
            store,
            registry,
            notifier,
            inventory,
            state,
        }
    }

    /// Roll the applied chain back onto the header chain. Returns the new
    /// block tip, or `None` when the tip already sits on the header chain.
    pub async fn reorganize(
        &self,
        ring: &mut RecentHashRing,
        headers: &HeaderChain,
        block_tip: &Tip,
    ) -> ChainResult<Option<Tip>> {
        self.inventory.clear();

        match self.find_common_ancestor(ring, headers, block_tip)? {
            Some(pending) => self.execute(pending, ring).await.map(Some),
            None => Ok(None),
        }
    }

    /// Walk the ring newest-first looking for the first entry the header
    /// chain still agrees with.
    pub fn find_common_ancestor(
        &self,
        ring: &RecentHashRing,
        headers: &HeaderChain,
        block_tip: &Tip,
    ) -> ChainResult<Option<PendingReorg>> {
        let mut abandoned: Vec<Hash256> = Vec::new();
        let mut ancestor: Option<Hash256> = None;

        for entry in ring.iter_newest_first() {
            if headers.hash_at(entry.height)? == Some(entry.hash) {
                ancestor = Some(entry.hash);
                break;
            }
            abandoned.push(entry.hash);

            // The ancestor may sit just below the oldest entry
            if entry.height > 0 && headers.hash_at(entry.height - 1)? == Some(entry.prev_hash) {
                ancestor = Some(entry.prev_hash);
                break;
            }
        }

        let ancestor = match ancestor {
            Some(hash) => hash,
            None => {
                return Err(ChainError::ReorgTooDeep {
                    window: ring.capacity(),
                    tip_height: block_tip.height,
                });
            }
        };

        if abandoned.is_empty() {
            return Ok(None);
        }

        let common_ancestor = headers
            .get_header(&ancestor)?
            .ok_or_else(|| ChainError::missing("header", &ancestor))?;

        let mut blocks_to_remove = Vec::with_capacity(abandoned.len());
        for hash in &abandoned {
            let block = self
                .store
                .get_block(hash)?
                .ok_or_else(|| ChainError::missing("block", hash))?;
            blocks_to_remove.push(block);
        }

        Ok(Some(PendingReorg {
            common_ancestor,
            blocks_to_remove,
        }))
    }

    pub async fn execute(&self, pending: PendingReorg, ring: &mut RecentHashRing) -> ChainResult<Tip> {
        self.state.set_reorg_in_progress(true);
        let result = self.roll_back(pending, ring).await;
        self.state.set_reorg_in_progress(false);
        result
    }

    async fn roll_back(&self, pending: PendingReorg, ring: &mut RecentHashRing) -> ChainResult<Tip> {
        let ancestor = pending.common_ancestor.tip();
        warn!(
            "🔀 Reorg: removing {} block(s) back to common ancestor {}",
            pending.depth(),
            ancestor
        );

        self.store.set_tip(BLOCK_STREAM, &ancestor)?;
        self.state.set_block_height(ancestor.height);

        self.registry
            .rollback(&ancestor.hash, &pending.blocks_to_remove)
            .await?;

        let batch = pending
            .blocks_to_remove
            .iter()
            .map(|block| ChainStore::delete_block_mutation(&block.hash))
            .collect();
        self.store.commit(batch)?;

        for block in &pending.blocks_to_remove {
            ring.pop_newest();
            self.notifier.block_removed(block);
        }

        info!("🔀 Reorg complete, block tip is now {}", ancestor);
        Ok(ancestor)
    }

    /// Finish a rollback cut short by a crash: services still sitting on a
    /// stored block above the block tip are rolled back down to it.
    pub async fn recover_interrupted(&self, block_tip: &Tip) -> ChainResult<usize> {
        let mut highest: Option<Tip> = None;
        for name in self.registry.names() {
            let tip = self.registry.service_tip(&name)?;
            if tip == *block_tip || tip.height <= block_tip.height {
                continue;
            }
            // Blocks are stored before any service sees them
            if !self.store.has_block(&tip.hash)? {
                return Err(ChainError::missing("block", &tip.hash));
            }
            if highest.map_or(true, |h| tip.height > h.height) {
                highest = Some(tip);
            }
        }

        let top = match highest {
            Some(top) => top,
            None => return Ok(0),
        };

        let mut blocks = Vec::new();
        let mut cursor = top.hash;
        while cursor != block_tip.hash {
            let block = self
                .store
                .get_block(&cursor)?
                .ok_or_else(|| ChainError::missing("block", &cursor))?;
            if block.height <= block_tip.height {
                return Err(ChainError::missing("ancestor block", &block_tip.hash));
            }
            cursor = block.prev_hash();
            blocks.push(block);
        }

        warn!(
            "♻️  Resuming interrupted rollback of {} block(s) from {} to {}",
            blocks.len(),
            short_hash(&top.hash),
            block_tip
        );
        self.registry.rollback(&block_tip.hash, &blocks).await?;

        let batch = blocks
            .iter()
            .map(|block| ChainStore::delete_block_mutation(&block.hash))
            .collect();
        self.store.commit(batch)?;
        Ok(blocks.len())
    }
}
