//! Known peer addresses with per-address retry backoff.
//!
//! Addresses come from DNS seeds, configured bootstrap peers and `addr`
//! gossip. Entries are keyed by a hash of `ip:port` so the same endpoint is
//! never queued twice. Dial candidates are taken from the front of the retry
//! queue; a failed or dropped address moves to the back with a cooldown.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::types::double_sha256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressSource {
    Seed,
    Bootstrap,
    Gossip,
    Inbound,
}

#[derive(Debug, Clone)]
struct AddressEntry {
    addr: SocketAddr,
    source: AddressSource,
    retry_not_before: Option<Instant>,
    failures: u32,
}

#[derive(Default)]
struct Book {
    entries: HashMap<u64, AddressEntry>,
    queue: VecDeque<u64>,
}

pub struct AddressBook {
    inner: Mutex<Book>,
    cooldown: Duration,
    max_cooldown: Duration,
    capacity: usize,
}

/// De-duplication key of an endpoint.
pub fn address_key(addr: &SocketAddr) -> u64 {
    let digest = double_sha256(format!("{}:{}", addr.ip(), addr.port()).as_bytes());
    u64::from_le_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ])
}

impl AddressBook {
    pub fn new(cooldown: Duration, max_cooldown: Duration, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Book::default()),
            cooldown,
            max_cooldown,
            capacity,
        }
    }

    /// Returns false for a duplicate or when the book is full.
    pub fn add(&self, addr: SocketAddr, source: AddressSource) -> bool {
        let key = address_key(&addr);
        let mut book = self.inner.lock();
        if book.entries.contains_key(&key) || book.entries.len() >= self.capacity {
            return false;
        }
        book.entries.insert(
            key,
            AddressEntry {
                addr,
                source,
                retry_not_before: None,
                failures: 0,
            },
        );
        book.queue.push_back(key);
        true
    }

    pub fn add_many(&self, addrs: impl IntoIterator<Item = SocketAddr>, source: AddressSource) -> usize {
        addrs
            .into_iter()
            .filter(|addr| self.add(*addr, source))
            .count()
    }

    /// Up to `limit` addresses out of backoff and not in `exclude`, in queue order.
    pub fn candidates(&self, now: Instant, exclude: &HashSet<SocketAddr>, limit: usize) -> Vec<SocketAddr> {
        let book = self.inner.lock();
        book.queue
            .iter()
            .filter_map(|key| book.entries.get(key))
            .filter(|entry| entry.retry_not_before.map_or(true, |t| t <= now))
            .filter(|entry| !exclude.contains(&entry.addr))
            .take(limit)
            .map(|entry| entry.addr)
            .collect()
    }

    /// Handshake succeeded; clear backoff.
    pub fn mark_good(&self, addr: &SocketAddr) {
        let mut book = self.inner.lock();
        if let Some(entry) = book.entries.get_mut(&address_key(addr)) {
            entry.failures = 0;
            entry.retry_not_before = None;
        }
    }

    /// Move to the back of the retry queue with an exponential cooldown.
    pub fn demote(&self, addr: &SocketAddr, now: Instant) -> Option<Duration> {
        let key = address_key(addr);
        let mut book = self.inner.lock();
        let entry = book.entries.get_mut(&key)?;
        entry.failures = entry.failures.saturating_add(1);
        let factor = 1u32 << entry.failures.saturating_sub(1).min(16);
        let delay = self.cooldown.saturating_mul(factor).min(self.max_cooldown);
        entry.retry_not_before = Some(now + delay);

        book.queue.retain(|k| *k != key);
        book.queue.push_back(key);
        Some(delay)
    }

    /// Make every address immediately dialable again.
    pub fn reset_backoff(&self) {
        let mut book = self.inner.lock();
        for entry in book.entries.values_mut() {
            entry.retry_not_before = None;
        }
    }

    /// Addresses to hand out in an `addr` reply.
    pub fn sample(&self, limit: usize) -> Vec<SocketAddr> {
        let book = self.inner.lock();
        book.entries
            .values()
            .filter(|entry| entry.source != AddressSource::Inbound && entry.failures == 0)
            .take(limit)
            .map(|entry| entry.addr)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> AddressBook {
        AddressBook::new(Duration::from_secs(30), Duration::from_secs(600), 100)
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_duplicates_rejected() {
        let book = book();
        assert!(book.add(addr("10.0.0.1:27333"), AddressSource::Seed));
        assert!(!book.add(addr("10.0.0.1:27333"), AddressSource::Gossip));
        assert!(book.add(addr("10.0.0.1:27334"), AddressSource::Gossip));
        assert_eq!(book.len(), 2);
    }

    #[test]
    fn test_demote_backs_off_and_requeues() {
        let book = book();
        let a = addr("10.0.0.1:27333");
        let b = addr("10.0.0.2:27333");
        book.add(a, AddressSource::Seed);
        book.add(b, AddressSource::Seed);

        let now = Instant::now();
        assert_eq!(book.demote(&a, now), Some(Duration::from_secs(30)));
        assert_eq!(book.demote(&a, now), Some(Duration::from_secs(60)));

        let none = HashSet::new();
        assert_eq!(book.candidates(now, &none, 10), vec![b]);
        assert_eq!(
            book.candidates(now + Duration::from_secs(61), &none, 10),
            vec![b, a]
        );

        book.reset_backoff();
        assert_eq!(book.candidates(now, &none, 10).len(), 2);
    }

    #[test]
    fn test_cooldown_is_capped() {
        let book = book();
        let a = addr("10.0.0.1:27333");
        book.add(a, AddressSource::Seed);
        let now = Instant::now();
        let mut last = Duration::ZERO;
        for _ in 0..20 {
            last = book.demote(&a, now).unwrap();
        }
        assert_eq!(last, Duration::from_secs(600));
    }

    #[test]
    fn test_candidates_exclude_connected() {
        let book = book();
        let a = addr("10.0.0.1:27333");
        book.add(a, AddressSource::Bootstrap);
        let exclude: HashSet<_> = [a].into_iter().collect();
        assert!(book.candidates(Instant::now(), &exclude, 10).is_empty());
    }
}
