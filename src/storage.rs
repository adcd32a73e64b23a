//! Persistent key-value storage.
//!
//! `KvStore` is the raw byte store (sled on disk, a BTreeMap in tests).
//! `ChainStore` layers the typed records of the sync pipeline on top of it:
//! header index, applied blocks and stream tips. Every multi-record update is
//! a single `write_batch` so a crash never leaves half a block applied.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::error;

use crate::block::{StoredBlock, StoredHeader};
use crate::error::StorageError;
use crate::types::{Hash256, Tip};

const HEADER_PREFIX: &[u8] = b"hx/";
const HEIGHT_PREFIX: &[u8] = b"hh/";
const BLOCK_PREFIX: &[u8] = b"bk/";
const TIP_PREFIX: &[u8] = b"tp/";

/// One write inside an atomic batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mutation {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl Mutation {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Mutation::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Mutation::Delete { key: key.into() }
    }

    /// Put with a bincode-encoded value
    pub fn put_encoded<T: Serialize>(
        key: impl Into<Vec<u8>>,
        value: &T,
    ) -> Result<Self, StorageError> {
        Ok(Mutation::put(key, bincode::serialize(value)?))
    }

    pub fn key(&self) -> &[u8] {
        match self {
            Mutation::Put { key, .. } | Mutation::Delete { key } => key,
        }
    }
}

pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Apply all mutations atomically, in order.
    fn write_batch(&self, batch: Vec<Mutation>) -> Result<(), StorageError>;

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;

    fn flush(&self) -> Result<(), StorageError>;
}

pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open(path: &str, cache_capacity: u64) -> Result<Self, StorageError> {
        let db = sled::Config::new()
            .path(path)
            .cache_capacity(cache_capacity)
            .mode(sled::Mode::HighThroughput)
            .open()
            .map_err(|e| {
                error!(path = path, "Failed to open database");
                StorageError::DatabaseOpen {
                    path: path.to_string(),
                    source: e,
                }
            })?;
        Ok(Self { db })
    }

    /// A throwaway database that is removed on drop.
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }
}

impl KvStore for SledStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    fn write_batch(&self, batch: Vec<Mutation>) -> Result<(), StorageError> {
        let mut sled_batch = sled::Batch::default();
        for mutation in batch {
            match mutation {
                Mutation::Put { key, value } => sled_batch.insert(key, value),
                Mutation::Delete { key } => sled_batch.remove(key),
            }
        }
        self.db.apply_batch(sled_batch)?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let mut out = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (k, v) = item?;
            out.push((k.to_vec(), v.to_vec()));
        }
        Ok(out)
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.map.read().get(key).cloned())
    }

    fn write_batch(&self, batch: Vec<Mutation>) -> Result<(), StorageError> {
        let mut map = self.map.write();
        for mutation in batch {
            match mutation {
                Mutation::Put { key, value } => {
                    map.insert(key, value);
                }
                Mutation::Delete { key } => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        Ok(self
            .map
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Typed records of the sync pipeline.
#[derive(Clone)]
pub struct ChainStore {
    kv: Arc<dyn KvStore>,
}

impl ChainStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    pub fn header_key(hash: &Hash256) -> Vec<u8> {
        [HEADER_PREFIX, hash.as_slice()].concat()
    }

    pub fn height_key(height: u64) -> Vec<u8> {
        // Big-endian so prefix scans come back in height order
        [HEIGHT_PREFIX, &height.to_be_bytes()[..]].concat()
    }

    pub fn block_key(hash: &Hash256) -> Vec<u8> {
        [BLOCK_PREFIX, hash.as_slice()].concat()
    }

    pub fn tip_key(stream: &str) -> Vec<u8> {
        [TIP_PREFIX, stream.as_bytes()].concat()
    }

    fn get_decoded<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>, StorageError> {
        match self.kv.get(key)? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map(Some)
                .map_err(|e| StorageError::Corrupt {
                    key: hex::encode(key),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    pub fn get_header(&self, hash: &Hash256) -> Result<Option<StoredHeader>, StorageError> {
        self.get_decoded(&Self::header_key(hash))
    }

    /// Hash of the active header chain at `height`.
    pub fn header_hash_at(&self, height: u64) -> Result<Option<Hash256>, StorageError> {
        match self.kv.get(&Self::height_key(height))? {
            Some(bytes) => {
                let hash: Hash256 =
                    bytes
                        .as_slice()
                        .try_into()
                        .map_err(|_| StorageError::Corrupt {
                            key: format!("hh/{}", height),
                            reason: format!("expected 32 bytes, got {}", bytes.len()),
                        })?;
                Ok(Some(hash))
            }
            None => Ok(None),
        }
    }

    pub fn header_at(&self, height: u64) -> Result<Option<StoredHeader>, StorageError> {
        match self.header_hash_at(height)? {
            Some(hash) => self.get_header(&hash),
            None => Ok(None),
        }
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Option<StoredBlock>, StorageError> {
        self.get_decoded(&Self::block_key(hash))
    }

    pub fn has_block(&self, hash: &Hash256) -> Result<bool, StorageError> {
        Ok(self.kv.get(&Self::block_key(hash))?.is_some())
    }

    pub fn tip(&self, stream: &str) -> Result<Option<Tip>, StorageError> {
        self.get_decoded(&Self::tip_key(stream))
    }

    /// Index a header and make it the active entry at its height.
    pub fn put_header_mutations(header: &StoredHeader) -> Result<Vec<Mutation>, StorageError> {
        Ok(vec![
            Mutation::put_encoded(Self::header_key(&header.hash), header)?,
            Mutation::put(Self::height_key(header.height), header.hash.to_vec()),
        ])
    }

    pub fn put_block_mutation(block: &StoredBlock) -> Result<Mutation, StorageError> {
        Mutation::put_encoded(Self::block_key(&block.hash), block)
    }

    pub fn delete_block_mutation(hash: &Hash256) -> Mutation {
        Mutation::delete(Self::block_key(hash))
    }

    pub fn tip_mutation(stream: &str, tip: &Tip) -> Result<Mutation, StorageError> {
        Mutation::put_encoded(Self::tip_key(stream), tip)
    }

    pub fn commit(&self, batch: Vec<Mutation>) -> Result<(), StorageError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.kv.write_batch(batch)
    }

    pub fn set_tip(&self, stream: &str, tip: &Tip) -> Result<(), StorageError> {
        self.commit(vec![Self::tip_mutation(stream, tip)?])
    }

    /// Applied blocks from `tip` backwards, newest first, at most `limit`.
    /// Stops early at a block that is not stored (genesis parent).
    pub fn recent_blocks(&self, tip: &Hash256, limit: usize) -> Result<Vec<StoredBlock>, StorageError> {
        let mut out = Vec::with_capacity(limit);
        let mut cursor = *tip;
        while out.len() < limit {
            match self.get_block(&cursor)? {
                Some(block) => {
                    cursor = block.prev_hash();
                    out.push(block);
                }
                None => break,
            }
        }
        Ok(out)
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.kv.flush()
    }
}

impl std::fmt::Debug for ChainStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainStore").finish_non_exhaustive()
    }
}
