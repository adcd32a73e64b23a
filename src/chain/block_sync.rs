//! Block sync engine
//!
//! Owns the applied-block tip and applies blocks strictly in chain order:
//! the block record, then dependent services, then the block tip, the recent
//! hash ring and the notification. Blocks that arrive ahead
//! of their parent wait in a height-ordered buffer.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::block::{Block, GenesisBlock};
use crate::chain::hash_ring::{RecentHashRing, RingEntry};
use crate::chain::header_chain::HeaderChain;
use crate::chain::reorg::ReorgCoordinator;
use crate::chain::sync_state::SyncState;
use crate::chain_error::{ChainError, ChainResult};
use crate::constants::chain::{BLOCK_STREAM, DEFAULT_REORG_WINDOW};
use crate::constants::sync::{DEFAULT_BLOCK_READ_AHEAD, DEFAULT_BLOCK_REQUEST_TIMEOUT_SECS};
use crate::network::InventoryCache;
use crate::network_type::NetworkType;
use crate::notifier::ChainNotifier;
use crate::service::ServiceRegistry;
use crate::storage::ChainStore;
use crate::types::{short_hash, Hash256, Tip};

#[derive(Debug, Clone)]
pub struct BlockSyncConfig {
    pub read_ahead: u64,
    pub request_timeout: Duration,
    pub ring_capacity: usize,
}

impl Default for BlockSyncConfig {
    fn default() -> Self {
        Self {
            read_ahead: DEFAULT_BLOCK_READ_AHEAD,
            request_timeout: Duration::from_secs(DEFAULT_BLOCK_REQUEST_TIMEOUT_SECS),
            ring_capacity: DEFAULT_REORG_WINDOW,
        }
    }
}

/// Where the block tip stands relative to the header chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    /// Block tip is on the header chain
    Aligned,
    /// Block tip is above the header tip, which is one of our blocks;
    /// wait for header sync to catch up
    Ahead,
    /// Block tip left the header chain
    Diverged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// `applied` counts buffered successors drained after this block
    Applied { tip: Tip, applied: usize },
    Buffered { height: u64 },
    Duplicate,
    /// On the header chain but below our tip, or superseded by a reorg
    Stale,
    /// Header not indexed yet; ask the peer for headers
    UnknownHeader,
    /// Shutdown requested before the block was applied
    Stopped,
}

struct InFlight {
    missing: HashSet<Hash256>,
    requested_at: Instant,
}

pub struct BlockSyncEngine {
    store: ChainStore,
    registry: Arc<ServiceRegistry>,
    notifier: Arc<ChainNotifier>,
    state: Arc<SyncState>,
    reorg: ReorgCoordinator,
    ring: RecentHashRing,
    tip: Tip,
    pending: BTreeMap<u64, Block>,
    in_flight: Option<InFlight>,
    config: BlockSyncConfig,
}

impl BlockSyncEngine {
    /// Load the block tip (seeding genesis), rebuild the ring and finish any
    /// rollback interrupted by a crash.
    pub async fn open(
        store: ChainStore,
        network: NetworkType,
        registry: Arc<ServiceRegistry>,
        notifier: Arc<ChainNotifier>,
        inventory: Arc<InventoryCache>,
        state: Arc<SyncState>,
        config: BlockSyncConfig,
    ) -> ChainResult<Self> {
        let tip = match store.tip(BLOCK_STREAM)? {
            Some(tip) => tip,
            None => {
                let genesis = GenesisBlock::for_network(network).into_stored(0);
                let tip = genesis.tip();
                store.commit(vec![
                    ChainStore::put_block_mutation(&genesis)?,
                    ChainStore::tip_mutation(BLOCK_STREAM, &tip)?,
                ])?;
                tip
            }
        };
        if !store.has_block(&tip.hash)? {
            return Err(ChainError::missing("block", &tip.hash));
        }

        let mut ring = RecentHashRing::new(config.ring_capacity);
        let recent = store.recent_blocks(&tip.hash, ring.capacity())?;
        for block in recent.iter().rev() {
            ring.push(RingEntry {
                hash: block.hash,
                prev_hash: block.prev_hash(),
                height: block.height,
            });
        }

        let reorg = ReorgCoordinator::new(
            store.clone(),
            registry.clone(),
            notifier.clone(),
            inventory,
            state.clone(),
        );
        reorg.recover_interrupted(&tip).await?;

        state.set_block_height(tip.height);
        info!(
            "🧱 Block tip {} ({} recent block(s) in reorg window)",
            tip,
            ring.len()
        );

        Ok(Self {
            store,
            registry,
            notifier,
            state,
            reorg,
            ring,
            tip,
            pending: BTreeMap::new(),
            in_flight: None,
            config,
        })
    }

    pub fn tip(&self) -> Tip {
        self.tip
    }

    pub fn ring(&self) -> &RecentHashRing {
        &self.ring
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Forget the outstanding window; the next request starts afresh.
    pub fn clear_in_flight(&mut self) {
        self.in_flight = None;
    }

    pub fn alignment(&self, headers: &HeaderChain) -> ChainResult<Alignment> {
        if self.tip.height > headers.height() {
            let header_tip = headers.tip();
            return Ok(if self.block_hash_at(header_tip.height)? == Some(header_tip.hash) {
                Alignment::Ahead
            } else {
                Alignment::Diverged
            });
        }

        Ok(if headers.hash_at(self.tip.height)? == Some(self.tip.hash) {
            Alignment::Aligned
        } else {
            Alignment::Diverged
        })
    }

    /// Check the tip against the header chain, rolling back if it left it.
    pub async fn reconcile(&mut self, headers: &HeaderChain) -> ChainResult<Alignment> {
        let alignment = self.alignment(headers)?;
        if alignment == Alignment::Diverged {
            self.reorganize(headers).await?;
        }
        Ok(alignment)
    }

    /// Hashes of the next window to fetch, or a re-request of the current
    /// window's missing blocks after a timeout. `None` while a window is in
    /// flight or when caught up.
    pub fn next_request(
        &mut self,
        headers: &HeaderChain,
        now: Instant,
    ) -> ChainResult<Option<Vec<Hash256>>> {
        if let Some(in_flight) = self.in_flight.as_mut() {
            if !in_flight.missing.is_empty() {
                if now.duration_since(in_flight.requested_at) < self.config.request_timeout {
                    return Ok(None);
                }
                warn!(
                    "⏱️  Block window timed out with {} block(s) missing, re-requesting",
                    in_flight.missing.len()
                );
                in_flight.requested_at = now;
                return Ok(Some(in_flight.missing.iter().copied().collect()));
            }
            self.in_flight = None;
        }

        // Never ask for an end hash while ahead of the header tip
        if self.tip.height >= headers.height() {
            return Ok(None);
        }

        let end = match headers.get_end_hash(&self.tip, self.config.read_ahead)? {
            Some((_, end)) => end,
            None => return Ok(None),
        };
        let end_height = headers
            .get_header(&end)?
            .ok_or_else(|| ChainError::missing("header", &end))?
            .height;

        let hashes: Vec<Hash256> = headers
            .hashes_in_range(self.tip.height + 1, end_height)?
            .into_iter()
            .zip(self.tip.height + 1..)
            .filter(|(_, height)| !self.pending.contains_key(height))
            .map(|(hash, _)| hash)
            .collect();
        if hashes.is_empty() {
            return Ok(None);
        }

        debug!(
            "📦 Requesting blocks {}..={} ({} block(s))",
            self.tip.height + 1,
            end_height,
            hashes.len()
        );
        self.in_flight = Some(InFlight {
            missing: hashes.iter().copied().collect(),
            requested_at: now,
        });
        Ok(Some(hashes))
    }

    /// The block's hash was reported unavailable; stop waiting for it.
    pub fn forget_requested(&mut self, hash: &Hash256) {
        if let Some(in_flight) = self.in_flight.as_mut() {
            in_flight.missing.remove(hash);
        }
    }

    pub async fn process_block(&mut self, block: Block, headers: &HeaderChain) -> ChainResult<BlockOutcome> {
        let hash = block.hash();
        self.forget_requested(&hash);

        if self.is_applied(&hash)? {
            return Ok(BlockOutcome::Duplicate);
        }

        let header = match headers.get_header(&hash)? {
            Some(header) => header,
            None => {
                debug!("Block {} has no indexed header", short_hash(&hash));
                return Ok(BlockOutcome::UnknownHeader);
            }
        };

        if block.compute_merkle_root() != block.header.merkle_root {
            return Err(ChainError::InvalidBlock {
                hash: short_hash(&hash),
                reason: "merkle root does not match transactions".to_string(),
            });
        }

        if block.header.prev_hash != self.tip.hash
            && headers.hash_at(self.tip.height)? != Some(self.tip.hash)
        {
            self.reorganize(headers).await?;
        }

        if block.header.prev_hash != self.tip.hash {
            if header.height > self.tip.height + 1 {
                self.pending.insert(header.height, block);
                return Ok(BlockOutcome::Buffered {
                    height: header.height,
                });
            }
            return Ok(BlockOutcome::Stale);
        }

        if !self.apply(block, header.height).await? {
            return Ok(BlockOutcome::Stopped);
        }
        let drained = self.drain_pending().await?;

        Ok(BlockOutcome::Applied {
            tip: self.tip,
            applied: 1 + drained,
        })
    }

    async fn drain_pending(&mut self) -> ChainResult<usize> {
        let mut applied = 0;
        while let Some((&height, _)) = self.pending.first_key_value() {
            if height > self.tip.height + 1 {
                break;
            }
            let block = match self.pending.remove(&height) {
                Some(block) => block,
                None => break,
            };
            if height <= self.tip.height || block.header.prev_hash != self.tip.hash {
                debug!("Dropping superseded buffered block at height {}", height);
                continue;
            }
            if !self.apply(block, height).await? {
                break;
            }
            applied += 1;
        }
        Ok(applied)
    }

    /// Returns false when shutdown stopped the application.
    async fn apply(&mut self, block: Block, height: u64) -> ChainResult<bool> {
        if self.state.is_stopping() {
            debug!("Stopping, block at height {} not applied", height);
            return Ok(false);
        }

        // Record first: a service tip must never point at an unstored block
        let stored = block.into_stored(height);
        self.store.commit(vec![ChainStore::put_block_mutation(&stored)?])?;
        self.registry.apply_block(&stored).await?;
        self.store.set_tip(BLOCK_STREAM, &stored.tip())?;

        self.ring.push(RingEntry {
            hash: stored.hash,
            prev_hash: stored.prev_hash(),
            height,
        });
        self.tip = stored.tip();
        self.state.set_block_height(height);
        self.notifier.block_applied(&stored);

        if height % 1000 == 0 {
            info!("✅ Block {} applied ({})", height, short_hash(&stored.hash));
        } else {
            debug!(
                "✅ Block {} applied ({}, {} tx)",
                height,
                short_hash(&stored.hash),
                stored.txids.len()
            );
        }
        Ok(true)
    }

    async fn reorganize(&mut self, headers: &HeaderChain) -> ChainResult<()> {
        if let Some(tip) = self.reorg.reorganize(&mut self.ring, headers, &self.tip).await? {
            self.tip = tip;
            self.in_flight = None;
            self.pending.retain(|height, _| *height > tip.height);
        }
        Ok(())
    }

    /// Crash leftovers of an abandoned fork can still be stored above the
    /// ancestor, so a stored record alone does not count as applied.
    fn is_applied(&self, hash: &Hash256) -> ChainResult<bool> {
        if *hash == self.tip.hash || self.ring.contains(hash) {
            return Ok(true);
        }
        Ok(match self.store.get_block(hash)? {
            Some(block) => block.height + self.ring.capacity() as u64 <= self.tip.height,
            None => false,
        })
    }

    /// Our applied block at `height` (ring first, then the stored chain).
    fn block_hash_at(&self, height: u64) -> ChainResult<Option<Hash256>> {
        if height > self.tip.height {
            return Ok(None);
        }
        if let Some(entry) = self.ring.iter_newest_first().find(|e| e.height == height) {
            return Ok(Some(entry.hash));
        }

        let mut cursor = match self.ring.iter_newest_first().last() {
            Some(oldest) => oldest.prev_hash,
            None => self.tip.hash,
        };
        loop {
            let block = match self.store.get_block(&cursor)? {
                Some(block) => block,
                None => return Ok(None),
            };
            if block.height == height {
                return Ok(Some(block.hash));
            }
            if block.height < height {
                return Ok(None);
            }
            cursor = block.prev_hash();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockHeader, RawTransaction};
    use crate::services::TxIndexService;

    fn mine_block(prev: &Hash256, salt: u8, bits: u32) -> Block {
        let transactions = vec![RawTransaction(vec![salt, 1, 2, 3])];
        let mut block = Block {
            header: BlockHeader {
                version: 1,
                prev_hash: *prev,
                merkle_root: [0u8; 32],
                timestamp: 1_704_067_200 + salt as u32,
                bits,
                nonce: 0,
                stake: None,
            },
            transactions,
        };
        block.header.merkle_root = block.compute_merkle_root();
        assert!(block.header.solve(1_000_000));
        block
    }

    fn blocks_on(prev: Hash256, count: usize, salt: u8, bits: u32) -> Vec<Block> {
        let mut out: Vec<Block> = Vec::new();
        let mut prev = prev;
        for i in 0..count {
            let block = mine_block(&prev, salt.wrapping_add(i as u8), bits);
            prev = block.hash();
            out.push(block);
        }
        out
    }

    async fn setup(
        ring_capacity: usize,
    ) -> (ChainStore, HeaderChain, BlockSyncEngine, Arc<TxIndexService>) {
        let store = ChainStore::in_memory();
        let headers = HeaderChain::open(store.clone(), NetworkType::Regtest, 2000).unwrap();
        let tx_index = Arc::new(TxIndexService::new(store.clone()));
        let mut registry = ServiceRegistry::new(store.clone(), headers.genesis_hash());
        registry.register(tx_index.clone());
        let engine = BlockSyncEngine::open(
            store.clone(),
            NetworkType::Regtest,
            Arc::new(registry),
            Arc::new(ChainNotifier::new()),
            Arc::new(InventoryCache::new(64)),
            Arc::new(SyncState::new()),
            BlockSyncConfig {
                read_ahead: 4,
                request_timeout: Duration::from_secs(5),
                ring_capacity,
            },
        )
        .await
        .unwrap();
        (store, headers, engine, tx_index)
    }

    async fn reopen(store: &ChainStore, registry: Arc<ServiceRegistry>) -> BlockSyncEngine {
        BlockSyncEngine::open(
            store.clone(),
            NetworkType::Regtest,
            registry,
            Arc::new(ChainNotifier::new()),
            Arc::new(InventoryCache::new(64)),
            Arc::new(SyncState::new()),
            BlockSyncConfig::default(),
        )
        .await
        .unwrap()
    }

    fn index(headers: &mut HeaderChain, blocks: &[Block]) {
        let batch: Vec<BlockHeader> = blocks.iter().map(|b| b.header.clone()).collect();
        headers.process_headers(&batch).unwrap();
    }

    #[tokio::test]
    async fn test_windows_and_in_order_application() {
        let (store, mut headers, mut engine, tx_index) = setup(144).await;
        let blocks = blocks_on(headers.genesis_hash(), 6, 1, 0x207fffff);
        index(&mut headers, &blocks);

        let now = Instant::now();
        let window = engine.next_request(&headers, now).unwrap().unwrap();
        assert_eq!(window.len(), 4);
        assert_eq!(window[0], blocks[0].hash());
        // Window still in flight
        assert!(engine.next_request(&headers, now).unwrap().is_none());

        // Out of order: 2 waits for 1
        assert_eq!(
            engine.process_block(blocks[1].clone(), &headers).await.unwrap(),
            BlockOutcome::Buffered { height: 2 }
        );
        assert_eq!(
            engine.process_block(blocks[0].clone(), &headers).await.unwrap(),
            BlockOutcome::Applied {
                tip: Tip::new(2, blocks[1].hash()),
                applied: 2
            }
        );
        assert_eq!(
            engine.process_block(blocks[0].clone(), &headers).await.unwrap(),
            BlockOutcome::Duplicate
        );
        assert_eq!(store.tip(BLOCK_STREAM).unwrap(), Some(engine.tip()));
        assert!(tx_index
            .get_location(&blocks[1].transactions[0].txid())
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_window_timeout_rerequests_missing() {
        let (_store, mut headers, mut engine, _) = setup(144).await;
        let blocks = blocks_on(headers.genesis_hash(), 3, 1, 0x207fffff);
        index(&mut headers, &blocks);

        let start = Instant::now();
        engine.next_request(&headers, start).unwrap().unwrap();
        engine.process_block(blocks[0].clone(), &headers).await.unwrap();

        let later = start + Duration::from_secs(6);
        let retry = engine.next_request(&headers, later).unwrap().unwrap();
        assert_eq!(retry.len(), 2);
        assert!(!retry.contains(&blocks[0].hash()));
    }

    #[tokio::test]
    async fn test_merkle_mismatch_is_recoverable() {
        let (_store, mut headers, mut engine, _) = setup(144).await;
        let blocks = blocks_on(headers.genesis_hash(), 1, 1, 0x207fffff);
        index(&mut headers, &blocks);

        let mut tampered = blocks[0].clone();
        tampered.transactions.push(RawTransaction(vec![9, 9]));
        let err = engine.process_block(tampered, &headers).await.unwrap_err();
        assert!(err.is_peer_fault());
        assert_eq!(engine.tip().height, 0);
    }

    #[tokio::test]
    async fn test_unknown_header_and_stopping() {
        let (_store, mut headers, mut engine, _) = setup(144).await;
        let blocks = blocks_on(headers.genesis_hash(), 2, 1, 0x207fffff);
        assert_eq!(
            engine.process_block(blocks[0].clone(), &headers).await.unwrap(),
            BlockOutcome::UnknownHeader
        );

        index(&mut headers, &blocks);
        engine.state.request_stop();
        assert_eq!(
            engine.process_block(blocks[0].clone(), &headers).await.unwrap(),
            BlockOutcome::Stopped
        );
        assert_eq!(engine.tip().height, 0);
    }

    #[tokio::test]
    async fn test_reorg_too_deep_leaves_state() {
        let (store, mut headers, mut engine, _) = setup(4).await;
        let genesis = headers.genesis_hash();
        let old = blocks_on(genesis, 8, 1, 0x207fffff);
        index(&mut headers, &old);
        for block in &old {
            engine.process_block(block.clone(), &headers).await.unwrap();
        }
        assert_eq!(engine.tip().height, 8);

        // Heavier fork from genesis: rewinds the header chain, then replaces it
        let fork = blocks_on(genesis, 8, 100, 0x200fffff);
        let batch: Vec<BlockHeader> = fork.iter().map(|b| b.header.clone()).collect();
        assert!(matches!(
            headers.process_headers(&batch).unwrap(),
            crate::chain::HeaderBatchOutcome::Rewound { .. }
        ));
        index(&mut headers, &fork);

        assert_eq!(engine.alignment(&headers).unwrap(), Alignment::Diverged);
        let err = engine.reconcile(&headers).await.unwrap_err();
        assert!(matches!(err, ChainError::ReorgTooDeep { window: 4, .. }));
        assert_eq!(store.tip(BLOCK_STREAM).unwrap(), Some(engine.tip()));
        assert_eq!(engine.tip().height, 8);
    }

    #[tokio::test]
    async fn test_interrupted_apply_is_undone_on_open() {
        let (store, mut headers, engine, tx_index) = setup(144).await;
        let genesis = headers.genesis_hash();
        let old = blocks_on(genesis, 1, 1, 0x207fffff);
        index(&mut headers, &old);

        // Stopped after the services indexed A1 but before the tip moved
        let stored = old[0].clone().into_stored(1);
        store
            .commit(vec![ChainStore::put_block_mutation(&stored).unwrap()])
            .unwrap();
        engine.registry.apply_block(&stored).await.unwrap();
        let registry = engine.registry.clone();
        drop(engine);

        let mut engine = reopen(&store, registry).await;
        assert_eq!(engine.tip(), Tip::new(0, genesis));
        assert!(tx_index.is_empty().unwrap());
        assert!(store.get_block(&old[0].hash()).unwrap().is_none());

        // The network moved to a different block 1
        let fork = blocks_on(genesis, 1, 100, 0x200fffff);
        let batch: Vec<BlockHeader> = fork.iter().map(|b| b.header.clone()).collect();
        headers.process_headers(&batch).unwrap();
        index(&mut headers, &fork);

        assert!(matches!(
            engine.process_block(fork[0].clone(), &headers).await.unwrap(),
            BlockOutcome::Applied { .. }
        ));
        let old_txid = old[0].transactions[0].txid();
        let new_txid = fork[0].transactions[0].txid();
        assert!(tx_index.get_location(&old_txid).unwrap().is_none());
        assert!(tx_index.get_location(&new_txid).unwrap().is_some());
        assert_eq!(tx_index.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_interrupted_rollback_resumes_on_open() {
        let (store, mut headers, mut engine, tx_index) = setup(144).await;
        let genesis = headers.genesis_hash();
        let blocks = blocks_on(genesis, 2, 1, 0x207fffff);
        index(&mut headers, &blocks);
        for block in &blocks {
            engine.process_block(block.clone(), &headers).await.unwrap();
        }
        assert_eq!(tx_index.len().unwrap(), 2);
        let registry = engine.registry.clone();
        drop(engine);

        // A reorg moves the block tip first; stop before any service undid anything
        store
            .set_tip(BLOCK_STREAM, &Tip::new(0, genesis))
            .unwrap();

        let engine = reopen(&store, registry.clone()).await;
        assert_eq!(engine.tip(), Tip::new(0, genesis));
        assert_eq!(
            registry.service_tip(TxIndexService::NAME).unwrap(),
            Tip::new(0, genesis)
        );
        assert!(tx_index.is_empty().unwrap());
        for block in &blocks {
            assert!(store.get_block(&block.hash()).unwrap().is_none());
        }
    }
}
