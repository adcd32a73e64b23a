pub mod block_sync;
pub mod engine;
pub mod hash_ring;
pub mod header_chain;
pub mod reorg;
pub mod sync_state;

pub use block_sync::{Alignment, BlockOutcome, BlockSyncConfig, BlockSyncEngine};
pub use engine::{Outbound, SyncEngine, SyncPhase};
pub use hash_ring::{RecentHashRing, RingEntry};
pub use header_chain::{HeaderBatchOutcome, HeaderChain};
pub use reorg::{PendingReorg, ReorgCoordinator};
pub use sync_state::SyncState;
