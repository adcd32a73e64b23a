//! Shared flags and heights, read by the progress reporter and services
//! while the control loop owns the sync engine.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct SyncState {
    stopping: AtomicBool,
    reorg_in_progress: AtomicBool,
    mempool_enabled: Arc<AtomicBool>,
    header_height: AtomicU64,
    block_height: Arc<AtomicU64>,
    best_peer_height: AtomicU64,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Block application checks this before every block.
    pub fn request_stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    pub fn is_reorg_in_progress(&self) -> bool {
        self.reorg_in_progress.load(Ordering::SeqCst)
    }

    pub fn set_reorg_in_progress(&self, value: bool) {
        self.reorg_in_progress.store(value, Ordering::SeqCst);
    }

    /// Switch shared with the mempool service
    pub fn mempool_switch(&self) -> Arc<AtomicBool> {
        self.mempool_enabled.clone()
    }

    pub fn is_mempool_enabled(&self) -> bool {
        self.mempool_enabled.load(Ordering::SeqCst)
    }

    pub fn set_mempool_enabled(&self, value: bool) {
        self.mempool_enabled.store(value, Ordering::SeqCst);
    }

    pub fn header_height(&self) -> u64 {
        self.header_height.load(Ordering::Relaxed)
    }

    pub fn set_header_height(&self, height: u64) {
        self.header_height.store(height, Ordering::Relaxed);
    }

    pub fn block_height(&self) -> u64 {
        self.block_height.load(Ordering::Relaxed)
    }

    pub fn set_block_height(&self, height: u64) {
        self.block_height.store(height, Ordering::Relaxed);
    }

    /// Shared with the connection pool, which advertises it in `version`
    pub fn block_height_handle(&self) -> Arc<AtomicU64> {
        self.block_height.clone()
    }

    pub fn best_peer_height(&self) -> u64 {
        self.best_peer_height.load(Ordering::Relaxed)
    }

    pub fn set_best_peer_height(&self, height: u64) {
        self.best_peer_height.store(height, Ordering::Relaxed);
    }
}
