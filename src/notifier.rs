use tokio::sync::broadcast;

use crate::block::StoredBlock;
use crate::constants::sync::NOTIFICATION_CHANNEL_SIZE;
use crate::types::{Hash256, Tip};

/// Chain event published after the block tip moves
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainEvent {
    BlockApplied {
        hash: Hash256,
        height: u64,
        tx_count: usize,
    },
    BlockRemoved {
        hash: Hash256,
        height: u64,
        /// Block tip after the removal
        new_tip: Tip,
    },
}

/// Pub/Sub for applied and removed blocks
pub struct ChainNotifier {
    tx: broadcast::Sender<ChainEvent>,
}

impl ChainNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTIFICATION_CHANNEL_SIZE);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.tx.subscribe()
    }

    pub fn block_applied(&self, block: &StoredBlock) {
        // No subscribers is fine
        let _ = self.tx.send(ChainEvent::BlockApplied {
            hash: block.hash,
            height: block.height,
            tx_count: block.txids.len(),
        });
    }

    pub fn block_removed(&self, block: &StoredBlock) {
        let _ = self.tx.send(ChainEvent::BlockRemoved {
            hash: block.hash,
            height: block.height,
            new_tip: Tip::new(block.height.saturating_sub(1), block.prev_hash()),
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ChainNotifier {
    fn default() -> Self {
        Self::new()
    }
}
