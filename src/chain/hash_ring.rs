//! Fixed-capacity circular buffer of recently applied blocks.
//!
//! Positional, not recency-based: entries leave strictly oldest-first as new
//! blocks are pushed. The reorg coordinator walks it newest-first to find the
//! common ancestor without reading the chain back from storage.

use crate::types::Hash256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingEntry {
    pub hash: Hash256,
    pub prev_hash: Hash256,
    pub height: u64,
}

#[derive(Debug)]
pub struct RecentHashRing {
    slots: Vec<Option<RingEntry>>,
    /// Next slot to write
    head: usize,
    len: usize,
}

impl RecentHashRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity.max(1)],
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append the newest entry, returning the evicted oldest one when full.
    pub fn push(&mut self, entry: RingEntry) -> Option<RingEntry> {
        let evicted = self.slots[self.head].replace(entry);
        self.head = (self.head + 1) % self.capacity();
        if self.len < self.capacity() {
            self.len += 1;
            None
        } else {
            evicted
        }
    }

    pub fn newest(&self) -> Option<&RingEntry> {
        if self.len == 0 {
            return None;
        }
        self.slots[self.slot_back(0)].as_ref()
    }

    pub fn pop_newest(&mut self) -> Option<RingEntry> {
        if self.len == 0 {
            return None;
        }
        let slot = self.slot_back(0);
        self.head = slot;
        self.len -= 1;
        self.slots[slot].take()
    }

    /// Entries from newest to oldest.
    pub fn iter_newest_first(&self) -> impl Iterator<Item = &RingEntry> + '_ {
        (0..self.len).filter_map(move |i| self.slots[self.slot_back(i)].as_ref())
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.iter_newest_first().any(|e| e.hash == *hash)
    }

    /// Slot index `back` positions behind the newest entry.
    fn slot_back(&self, back: usize) -> usize {
        let cap = self.capacity();
        (self.head + cap - 1 - back % cap) % cap
    }
}
