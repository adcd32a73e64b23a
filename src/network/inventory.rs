//! Recently seen / in-flight object hashes.
//!
//! Requests for a hash already in the cache are suppressed. The cache is
//! cleared on reorg so requests tied to the abandoned fork are forgotten.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use crate::types::Hash256;

pub struct InventoryCache {
    seen: Mutex<LruCache<Hash256, ()>>,
}

impl InventoryCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Record `hash`; false when it was already present.
    pub fn insert(&self, hash: Hash256) -> bool {
        self.seen.lock().put(hash, ()).is_none()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.seen.lock().contains(hash)
    }

    pub fn remove(&self, hash: &Hash256) {
        self.seen.lock().pop(hash);
    }

    pub fn clear(&self) {
        self.seen.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_dedups() {
        let cache = InventoryCache::new(4);
        assert!(cache.insert([1u8; 32]));
        assert!(!cache.insert([1u8; 32]));
        cache.remove(&[1u8; 32]);
        assert!(cache.insert([1u8; 32]));
    }

    #[test]
    fn test_bounded_and_clearable() {
        let cache = InventoryCache::new(2);
        cache.insert([1u8; 32]);
        cache.insert([2u8; 32]);
        cache.insert([3u8; 32]);
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&[1u8; 32]));

        cache.clear();
        assert!(cache.is_empty());
    }
}
