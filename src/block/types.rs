//! Block and header types.
//!
//! `BlockHeader`/`Block` are what peers send. `StoredHeader`/`StoredBlock` are
//! what the header chain and block sync persist: the wire value plus the
//! position (height, chainwork) computed locally when linkage validated.

use primitive_types::U256;
use serde::{Deserialize, Serialize};

use crate::block::work;
use crate::types::{double_sha256, Hash256, Tip, ZERO_HASH};

/// Proof-of-stake kernel reference carried by stake blocks.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StakeProof {
    pub prevout_hash: Hash256,
    pub prevout_index: u32,
    pub block_signature: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
    /// Present only on proof-of-stake blocks
    #[serde(default)]
    pub stake: Option<StakeProof>,
}

impl BlockHeader {
    /// The 80-byte little-endian encoding that is hashed.
    pub fn consensus_bytes(&self) -> [u8; 80] {
        let mut out = [0u8; 80];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(&self.prev_hash);
        out[36..68].copy_from_slice(&self.merkle_root);
        out[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        out[72..76].copy_from_slice(&self.bits.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    pub fn hash(&self) -> Hash256 {
        double_sha256(&self.consensus_bytes())
    }

    /// Bump the nonce until the hash meets the header's own target.
    /// Only practical for regtest-style easy targets.
    pub fn solve(&mut self, max_attempts: u32) -> bool {
        for _ in 0..max_attempts {
            if work::check_proof_of_work(&self.hash(), self.bits).unwrap_or(false) {
                return true;
            }
            self.nonce = self.nonce.wrapping_add(1);
        }
        false
    }
}

/// Whether a header belongs to a stake block rather than a work block.
pub fn is_proof_of_stake(header: &BlockHeader) -> bool {
    header.stake.is_some()
}

/// Opaque transaction bytes; their encoding belongs to the serialization layer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawTransaction(pub Vec<u8>);

impl RawTransaction {
    pub fn txid(&self) -> Hash256 {
        double_sha256(&self.0)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<RawTransaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn txids(&self) -> Vec<Hash256> {
        self.transactions.iter().map(|tx| tx.txid()).collect()
    }

    pub fn compute_merkle_root(&self) -> Hash256 {
        merkle_root(&self.txids())
    }

    pub fn into_stored(self, height: u64) -> StoredBlock {
        StoredBlock {
            hash: self.header.hash(),
            height,
            txids: self.txids(),
            header: self.header,
        }
    }
}

/// Merkle root over txids in block order; an odd level duplicates its last hash.
pub fn merkle_root(txids: &[Hash256]) -> Hash256 {
    if txids.is_empty() {
        return ZERO_HASH;
    }

    let mut hashes: Vec<Hash256> = txids.to_vec();
    while hashes.len() > 1 {
        let mut next_level = Vec::with_capacity(hashes.len().div_ceil(2));
        for chunk in hashes.chunks(2) {
            let mut pair = [0u8; 64];
            pair[..32].copy_from_slice(&chunk[0]);
            pair[32..].copy_from_slice(chunk.get(1).unwrap_or(&chunk[0]));
            next_level.push(double_sha256(&pair));
        }
        hashes = next_level;
    }

    hashes[0]
}

/// An indexed header: the header chain's unit of storage.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredHeader {
    pub hash: Hash256,
    pub height: u64,
    pub header: BlockHeader,
    /// Cumulative work from genesis, 256-bit big-endian
    pub chainwork: [u8; 32],
    /// Set once a successor is indexed
    pub next_hash: Option<Hash256>,
}

impl StoredHeader {
    pub fn genesis(header: BlockHeader) -> Self {
        let work = work::header_work(header.bits).unwrap_or_else(|_| U256::one());
        Self {
            hash: header.hash(),
            height: 0,
            header,
            chainwork: work::u256_to_be_bytes(work),
            next_hash: None,
        }
    }

    /// Index `header` on top of `self`. Linkage is the caller's responsibility.
    pub fn child(&self, header: BlockHeader, work: U256) -> Self {
        let chainwork = self.chainwork() + work;
        Self {
            hash: header.hash(),
            height: self.height + 1,
            header,
            chainwork: work::u256_to_be_bytes(chainwork),
            next_hash: None,
        }
    }

    pub fn prev_hash(&self) -> Hash256 {
        self.header.prev_hash
    }

    pub fn chainwork(&self) -> U256 {
        U256::from_big_endian(&self.chainwork)
    }

    pub fn tip(&self) -> Tip {
        Tip::new(self.height, self.hash)
    }
}

/// An applied block: header plus the ordered txids dependent services index.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredBlock {
    pub hash: Hash256,
    pub height: u64,
    pub header: BlockHeader,
    pub txids: Vec<Hash256>,
}

impl StoredBlock {
    pub fn prev_hash(&self) -> Hash256 {
        self.header.prev_hash
    }

    pub fn tip(&self) -> Tip {
        Tip::new(self.height, self.hash)
    }
}
