//! Sync-pipeline error types
//!
//! Every error raised by the header chain, block sync and reorg coordinator is
//! one of these. `is_fatal` decides whether the control loop stops the node or
//! drops the offending unit of work and carries on.

use thiserror::Error;

use crate::error::StorageError;
use crate::service::ServiceError;
use crate::types::{short_hash, Hash256};

/// Errors that can occur while following the chain
#[derive(Error, Debug)]
pub enum ChainError {
    /// A header in a batch does not extend the header before it
    #[error("Header batch broken at height {height}: prev hash {actual} does not match {expected}")]
    BrokenLinkage {
        height: u64,
        expected: String,
        actual: String,
    },

    /// Store was created for a different network
    #[error("Genesis mismatch: store has {found}, network expects {expected}")]
    GenesisMismatch { expected: String, found: String },

    /// Persisted header index has a hole
    #[error("Header index has a gap at height {0}")]
    HeightGap(u64),

    /// Caller's applied-block tip is ahead of the header tip
    #[error("Block tip {block_height} is ahead of header tip {header_height}")]
    Misaligned {
        block_height: u64,
        header_height: u64,
    },

    /// No common ancestor inside the recent hash window
    #[error("Unresolvable reorg: no common ancestor within the last {window} blocks (tip {tip_height})")]
    ReorgTooDeep { window: usize, tip_height: u64 },

    /// A second heavier fork arrived before the rewound range was re-synced
    #[error("Fork point is below the checkpoint at height {0}")]
    ForkBeyondCheckpoint(u64),

    /// `headers` reply longer than the protocol allows
    #[error("Header batch of {0} exceeds the per-reply limit")]
    OversizedBatch(usize),

    /// A dependent service failed during onBlock/onReorg
    #[error("Service {service} failed: {source}")]
    Service {
        service: String,
        #[source]
        source: ServiceError,
    },

    /// Block or header missing from local storage when it must exist
    #[error("Missing {what} {hash} in local store")]
    MissingData { what: &'static str, hash: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Proof-of-work does not satisfy the header's target
    #[error("Header {0} fails its proof-of-work target")]
    InvalidProofOfWork(String),

    /// Stake header claims a harder target than its parent
    #[error("Stake header {0} is harder than its parent")]
    StakeTargetTooHard(String),

    /// Compact target cannot be decoded
    #[error("Invalid difficulty bits {0:#010x}")]
    InvalidBits(u32),

    /// Block content does not match its header
    #[error("Block {hash} rejected: {reason}")]
    InvalidBlock { hash: String, reason: String },
}

/// Result type for sync operations
pub type ChainResult<T> = Result<T, ChainError>;

impl ChainError {
    pub fn broken_linkage(height: u64, expected: &Hash256, actual: &Hash256) -> Self {
        ChainError::BrokenLinkage {
            height,
            expected: hex::encode(expected),
            actual: hex::encode(actual),
        }
    }

    pub fn missing(what: &'static str, hash: &Hash256) -> Self {
        ChainError::MissingData {
            what,
            hash: short_hash(hash),
        }
    }

    /// Fatal errors stop forward progress; everything else is retried or
    /// dropped by the control loop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ChainError::BrokenLinkage { .. }
                | ChainError::GenesisMismatch { .. }
                | ChainError::HeightGap(_)
                | ChainError::Misaligned { .. }
                | ChainError::ReorgTooDeep { .. }
                | ChainError::Service { .. }
                | ChainError::MissingData { .. }
                | ChainError::Storage(_)
        )
    }

    /// Errors caused by what a peer sent us
    pub fn is_peer_fault(&self) -> bool {
        matches!(
            self,
            ChainError::InvalidProofOfWork(_)
                | ChainError::StakeTargetTooHard(_)
                | ChainError::ForkBeyondCheckpoint(_)
                | ChainError::OversizedBatch(_)
                | ChainError::InvalidBits(_)
                | ChainError::InvalidBlock { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(ChainError::ReorgTooDeep {
            window: 144,
            tip_height: 500
        }
        .is_fatal());
        assert!(ChainError::broken_linkage(5, &[1u8; 32], &[2u8; 32]).is_fatal());
        assert!(ChainError::HeightGap(7).is_fatal());

        // A peer can always produce these; they never stop the node
        for err in [
            ChainError::ForkBeyondCheckpoint(6),
            ChainError::OversizedBatch(2001),
            ChainError::StakeTargetTooHard("00ff".to_string()),
        ] {
            assert!(!err.is_fatal());
            assert!(err.is_peer_fault());
        }

        let pow = ChainError::InvalidProofOfWork("00ff".to_string());
        assert!(!pow.is_fatal());
        assert!(pow.is_peer_fault());
    }

    #[test]
    fn test_broken_linkage_message() {
        let err = ChainError::broken_linkage(12, &[0xaa; 32], &[0xbb; 32]);
        let msg = err.to_string();
        assert!(msg.contains("height 12"));
        assert!(msg.contains(&"aa".repeat(32)));
    }
}
