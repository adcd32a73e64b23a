//! Unconfirmed transaction pool
//!
//! Accepts relayed transactions only once the mempool switch is on (the chain
//! has caught up). Confirmed transactions leave the pool when their block is
//! applied and come back if that block is rolled back.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::block::{RawTransaction, StoredBlock};
use crate::service::{DependentService, Mutation, ServiceError};
use crate::types::{short_hash, Hash256};

const MAX_POOL_SIZE: usize = 10_000;
const MAX_POOL_BYTES: usize = 100 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    AlreadyKnown,
    /// Chain is still syncing
    Disabled,
    PoolFull,
}

/// Transactions a block confirmed, kept for a possible rollback
struct ConfirmedEntry {
    block_hash: Hash256,
    removed: Vec<(Hash256, RawTransaction)>,
}

pub struct MempoolService {
    enabled: Arc<AtomicBool>,
    pending: DashMap<Hash256, RawTransaction>,
    pending_bytes: AtomicUsize,
    confirmed: Mutex<VecDeque<ConfirmedEntry>>,
    /// Matches the reorg window; older blocks can never be rolled back
    confirmed_depth: usize,
}

impl MempoolService {
    pub const NAME: &'static str = "mempool";

    pub fn new(enabled: Arc<AtomicBool>, confirmed_depth: usize) -> Self {
        Self {
            enabled,
            pending: DashMap::new(),
            pending_bytes: AtomicUsize::new(0),
            confirmed: Mutex::new(VecDeque::new()),
            confirmed_depth,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn accept(&self, tx: RawTransaction) -> Admission {
        if !self.is_enabled() {
            return Admission::Disabled;
        }
        let txid = tx.txid();
        if self.pending.contains_key(&txid) {
            return Admission::AlreadyKnown;
        }
        if self.pending.len() >= MAX_POOL_SIZE
            || self.pending_bytes.load(Ordering::Relaxed) + tx.0.len() > MAX_POOL_BYTES
        {
            return Admission::PoolFull;
        }

        self.pending_bytes.fetch_add(tx.0.len(), Ordering::Relaxed);
        self.pending.insert(txid, tx);
        Admission::Accepted
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.pending.contains_key(txid)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn txids(&self) -> Vec<Hash256> {
        self.pending.iter().map(|entry| *entry.key()).collect()
    }
}

#[async_trait]
impl DependentService for MempoolService {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn on_block(&self, block: &StoredBlock) -> Result<Option<Vec<Mutation>>, ServiceError> {
        let mut removed = Vec::new();
        for txid in &block.txids {
            if let Some((txid, tx)) = self.pending.remove(txid) {
                self.pending_bytes.fetch_sub(tx.0.len(), Ordering::Relaxed);
                removed.push((txid, tx));
            }
        }

        if !removed.is_empty() {
            debug!(
                "🧹 {} mempool transactions confirmed in block {}",
                removed.len(),
                short_hash(&block.hash)
            );
        }

        let mut confirmed = self.confirmed.lock();
        confirmed.push_back(ConfirmedEntry {
            block_hash: block.hash,
            removed,
        });
        while confirmed.len() > self.confirmed_depth {
            confirmed.pop_front();
        }
        Ok(None)
    }

    async fn on_reorg(
        &self,
        _common_ancestor: &Hash256,
        block: &StoredBlock,
    ) -> Result<Option<Vec<Mutation>>, ServiceError> {
        let entry = {
            let mut confirmed = self.confirmed.lock();
            let position = confirmed.iter().rposition(|e| e.block_hash == block.hash);
            position.and_then(|i| confirmed.remove(i))
        };

        if let Some(entry) = entry {
            for (txid, tx) in entry.removed {
                self.pending_bytes.fetch_add(tx.0.len(), Ordering::Relaxed);
                self.pending.insert(txid, tx);
            }
        }
        Ok(None)
    }
}
