use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub type Hash256 = [u8; 32];

pub const ZERO_HASH: Hash256 = [0u8; 32];

/// SHA-256 applied twice, used for block hashes, txids and wire checksums.
pub fn double_sha256(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

/// First 8 bytes of a hash as hex, for log lines.
pub fn short_hash(hash: &Hash256) -> String {
    hex::encode(&hash[..8])
}

/// Position of a stream (header chain, block chain, or a dependent service).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tip {
    pub height: u64,
    pub hash: Hash256,
}

impl Tip {
    pub fn new(height: u64, hash: Hash256) -> Self {
        Self { height, hash }
    }
}

impl std::fmt::Display for Tip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.height, short_hash(&self.hash))
    }
}
