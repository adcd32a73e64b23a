//! Header chain
//!
//! The authoritative index of block headers and the header tip. Only the
//! active chain is indexed: a header-level fork never gets spliced in place,
//! the tip is rewound by the checkpoint distance and the range re-downloaded.
//! Fine-grained rollback happens at the block level (see `reorg`).

use primitive_types::U256;
use tracing::{debug, info, warn};

use crate::block::{is_proof_of_stake, work, BlockHeader, GenesisBlock, StoredHeader};
use crate::chain_error::{ChainError, ChainResult};
use crate::constants::chain::{HEADER_STREAM, LOCATOR_DEPTH, MAX_HEADERS_PER_BATCH};
use crate::network_type::NetworkType;
use crate::storage::{ChainStore, Mutation};
use crate::types::{short_hash, Hash256, Tip};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderBatchOutcome {
    /// Headers appended to the tip (possibly none when all were known).
    /// `caught_up` is set for a short batch: the peer has nothing more.
    Appended {
        added: usize,
        tip: Tip,
        caught_up: bool,
    },
    /// Competing branch with no more chainwork than our tip; ignored
    StaleFork { fork_height: u64 },
    /// First header's parent is unknown; ask again with a locator
    Orphan,
    /// Heavier fork below the tip: tip rewound, bulk sync restarts from `to`
    Rewound { from: Tip, to: Tip },
}

pub struct HeaderChain {
    store: ChainStore,
    network: NetworkType,
    genesis_hash: Hash256,
    tip: StoredHeader,
    checkpoint_distance: u64,
    pow_limit: U256,
    /// Set after a fork rewind until the next batch links to the tip
    rewound_at: Option<u64>,
}

impl HeaderChain {
    /// Open the header index, seeding genesis on an empty store, then rewind
    /// the tip by `checkpoint_distance`.
    pub fn open(
        store: ChainStore,
        network: NetworkType,
        checkpoint_distance: u64,
    ) -> ChainResult<Self> {
        let genesis = StoredHeader::genesis(GenesisBlock::header(network));

        match store.header_hash_at(0)? {
            None => {
                info!(
                    "🌱 Seeding {} genesis header {}",
                    network,
                    short_hash(&genesis.hash)
                );
                let mut batch = ChainStore::put_header_mutations(&genesis)?;
                batch.push(ChainStore::tip_mutation(HEADER_STREAM, &genesis.tip())?);
                store.commit(batch)?;
            }
            Some(found) if found != genesis.hash => {
                return Err(ChainError::GenesisMismatch {
                    expected: hex::encode(genesis.hash),
                    found: hex::encode(found),
                });
            }
            Some(_) => {}
        }

        let tip = store.tip(HEADER_STREAM)?.unwrap_or_else(|| genesis.tip());
        let tip_header = store
            .get_header(&tip.hash)?
            .ok_or_else(|| ChainError::missing("header", &tip.hash))?;
        if store.header_hash_at(tip.height)? != Some(tip.hash) {
            return Err(ChainError::HeightGap(tip.height));
        }

        let mut chain = Self {
            store,
            network,
            genesis_hash: genesis.hash,
            tip: tip_header,
            checkpoint_distance,
            pow_limit: work::compact_to_target(network.genesis_bits())?,
            rewound_at: None,
        };

        if chain.tip.height > 0 {
            let from = chain.tip();
            let to = chain.rewind_to_checkpoint()?;
            info!(
                "⏪ Header tip rewound from {} to checkpoint {} on startup",
                from, to
            );
        }

        Ok(chain)
    }

    pub fn network(&self) -> NetworkType {
        self.network
    }

    pub fn tip(&self) -> Tip {
        self.tip.tip()
    }

    pub fn tip_header(&self) -> &StoredHeader {
        &self.tip
    }

    pub fn height(&self) -> u64 {
        self.tip.height
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.genesis_hash
    }

    pub fn checkpoint_distance(&self) -> u64 {
        self.checkpoint_distance
    }

    pub fn hash_at(&self, height: u64) -> ChainResult<Option<Hash256>> {
        if height > self.tip.height {
            return Ok(None);
        }
        Ok(self.store.header_hash_at(height)?)
    }

    pub fn header_at(&self, height: u64) -> ChainResult<Option<StoredHeader>> {
        if height > self.tip.height {
            return Ok(None);
        }
        Ok(self.store.header_at(height)?)
    }

    /// A header on the active chain by hash.
    pub fn get_header(&self, hash: &Hash256) -> ChainResult<Option<StoredHeader>> {
        match self.store.get_header(hash)? {
            Some(header) if self.hash_at(header.height)? == Some(header.hash) => Ok(Some(header)),
            _ => Ok(None),
        }
    }

    pub fn contains(&self, hash: &Hash256) -> ChainResult<bool> {
        Ok(self.get_header(hash)?.is_some())
    }

    /// Exponentially spaced hashes from the tip back to genesis.
    pub fn block_locator(&self) -> ChainResult<Vec<Hash256>> {
        let mut locator = Vec::with_capacity(LOCATOR_DEPTH + 1);
        let mut height = self.tip.height;
        let mut step = 1u64;

        loop {
            let hash = self
                .hash_at(height)?
                .ok_or(ChainError::HeightGap(height))?;
            locator.push(hash);

            if height == 0 || locator.len() >= LOCATOR_DEPTH {
                break;
            }
            if locator.len() >= 10 {
                step *= 2;
            }
            height = height.saturating_sub(step);
        }

        if locator.last() != Some(&self.genesis_hash) {
            locator.push(self.genesis_hash);
        }
        Ok(locator)
    }

    /// Headers following the first locator hash found on our chain, for
    /// answering a peer's `getheaders`.
    pub fn headers_after_locator(
        &self,
        locator: &[Hash256],
        stop_hash: &Hash256,
    ) -> ChainResult<Vec<BlockHeader>> {
        let mut start = 0;
        for hash in locator {
            if let Some(header) = self.get_header(hash)? {
                start = header.height;
                break;
            }
        }

        let mut out = Vec::new();
        let mut height = start + 1;
        while height <= self.tip.height && out.len() < MAX_HEADERS_PER_BATCH {
            let header = self
                .header_at(height)?
                .ok_or(ChainError::HeightGap(height))?;
            let done = header.hash == *stop_hash;
            out.push(header.header);
            if done {
                break;
            }
            height += 1;
        }
        Ok(out)
    }

    /// Target and proof checks against the parent's `bits`; returns the
    /// header's work.
    pub fn validate_header(&self, header: &BlockHeader, parent_bits: u32) -> ChainResult<U256> {
        let hash = header.hash();
        let target = work::compact_to_target(header.bits)?;
        if target > self.pow_limit {
            return Err(ChainError::InvalidProofOfWork(short_hash(&hash)));
        }
        if is_proof_of_stake(header) {
            // No hash proof backs a stake target, so it may only ease
            if target < work::compact_to_target(parent_bits)? {
                return Err(ChainError::StakeTargetTooHard(short_hash(&hash)));
            }
        } else if !work::check_proof_of_work(&hash, header.bits)? {
            return Err(ChainError::InvalidProofOfWork(short_hash(&hash)));
        }
        work::header_work(header.bits)
    }

    /// Validate and index one `headers` reply.
    pub fn process_headers(&mut self, headers: &[BlockHeader]) -> ChainResult<HeaderBatchOutcome> {
        if headers.len() > MAX_HEADERS_PER_BATCH {
            return Err(ChainError::OversizedBatch(headers.len()));
        }
        let caught_up = headers.len() < MAX_HEADERS_PER_BATCH;
        if headers.is_empty() {
            return Ok(HeaderBatchOutcome::Appended {
                added: 0,
                tip: self.tip(),
                caught_up,
            });
        }

        let parent = match self.get_header(&headers[0].prev_hash)? {
            Some(parent) => parent,
            None => {
                debug!(
                    "Header batch starts at unknown parent {}",
                    short_hash(&headers[0].prev_hash)
                );
                return Ok(HeaderBatchOutcome::Orphan);
            }
        };

        let hashes: Vec<Hash256> = headers.iter().map(|h| h.hash()).collect();
        for i in 1..headers.len() {
            if headers[i].prev_hash != hashes[i - 1] {
                return Err(ChainError::broken_linkage(
                    parent.height + 1 + i as u64,
                    &hashes[i - 1],
                    &headers[i].prev_hash,
                ));
            }
        }

        // Drop the prefix we already have (replies overlap after a locator)
        let mut skip = 0;
        while skip < headers.len() && self.hash_at(parent.height + 1 + skip as u64)? == Some(hashes[skip]) {
            skip += 1;
        }
        if skip == headers.len() {
            return Ok(HeaderBatchOutcome::Appended {
                added: 0,
                tip: self.tip(),
                caught_up,
            });
        }

        let fork_parent_height = parent.height + skip as u64;
        let new_headers = &headers[skip..];

        if fork_parent_height != self.tip.height {
            return self.weigh_fork(fork_parent_height, new_headers);
        }

        self.append(new_headers, caught_up)
    }

    fn weigh_fork(
        &mut self,
        fork_parent_height: u64,
        branch: &[BlockHeader],
    ) -> ChainResult<HeaderBatchOutcome> {
        let fork_parent = self
            .header_at(fork_parent_height)?
            .ok_or(ChainError::HeightGap(fork_parent_height))?;

        let mut branch_work = fork_parent.chainwork();
        let mut parent_bits = fork_parent.header.bits;
        for header in branch {
            branch_work += self.validate_header(header, parent_bits)?;
            parent_bits = header.bits;
        }

        if branch_work <= self.tip.chainwork() {
            debug!(
                "Ignoring lighter fork at height {} ({} headers)",
                fork_parent_height + 1,
                branch.len()
            );
            return Ok(HeaderBatchOutcome::StaleFork {
                fork_height: fork_parent_height + 1,
            });
        }

        if let Some(rewound) = self.rewound_at {
            return Err(ChainError::ForkBeyondCheckpoint(rewound));
        }

        warn!(
            "🔀 Heavier header fork at height {} (tip {}), rewinding to checkpoint",
            fork_parent_height + 1,
            self.tip()
        );
        let from = self.tip();
        let to = self.rewind_to_checkpoint()?;
        self.rewound_at = Some(to.height);
        Ok(HeaderBatchOutcome::Rewound { from, to })
    }

    fn append(&mut self, headers: &[BlockHeader], caught_up: bool) -> ChainResult<HeaderBatchOutcome> {
        let mut works = Vec::with_capacity(headers.len());
        let mut parent_bits = self.tip.header.bits;
        for header in headers {
            works.push(self.validate_header(header, parent_bits)?);
            parent_bits = header.bits;
        }

        let mut batch: Vec<Mutation> = Vec::with_capacity(headers.len() * 2 + 3);
        let mut prev = self.tip.clone();
        prev.next_hash = Some(headers[0].hash());
        batch.extend(ChainStore::put_header_mutations(&prev)?);

        let last = headers.len() - 1;
        for (i, (header, work)) in headers.iter().zip(works).enumerate() {
            let mut stored = prev.child(header.clone(), work);
            if i < last {
                stored.next_hash = Some(headers[i + 1].hash());
            }
            batch.extend(ChainStore::put_header_mutations(&stored)?);
            prev = stored;
        }
        batch.push(ChainStore::tip_mutation(HEADER_STREAM, &prev.tip())?);
        self.store.commit(batch)?;

        self.tip = prev;
        self.rewound_at = None;
        debug!(
            "📥 {} header(s) indexed, header tip {}",
            headers.len(),
            self.tip()
        );

        Ok(HeaderBatchOutcome::Appended {
            added: headers.len(),
            tip: self.tip(),
            caught_up,
        })
    }

    /// Move the tip back by the checkpoint distance, deleting every header above it.
    pub fn rewind_to_checkpoint(&mut self) -> ChainResult<Tip> {
        let target = self.tip.height.saturating_sub(self.checkpoint_distance);
        if target == self.tip.height {
            return Ok(self.tip());
        }

        let mut batch = Vec::with_capacity(((self.tip.height - target) * 2 + 3) as usize);
        for height in (target + 1..=self.tip.height).rev() {
            let hash = self
                .store
                .header_hash_at(height)?
                .ok_or(ChainError::HeightGap(height))?;
            batch.push(Mutation::delete(ChainStore::header_key(&hash)));
            batch.push(Mutation::delete(ChainStore::height_key(height)));
        }

        let mut new_tip = self
            .store
            .header_at(target)?
            .ok_or(ChainError::HeightGap(target))?;
        new_tip.next_hash = None;
        batch.extend(ChainStore::put_header_mutations(&new_tip)?);
        batch.push(ChainStore::tip_mutation(HEADER_STREAM, &new_tip.tip())?);
        self.store.commit(batch)?;

        self.tip = new_tip;
        Ok(self.tip())
    }

    /// Next block to fetch after `tip` and the hash `read_ahead` headers further
    /// (capped at the header tip). `None` when `tip` is the header tip.
    pub fn get_end_hash(&self, tip: &Tip, read_ahead: u64) -> ChainResult<Option<(Hash256, Hash256)>> {
        if tip.height > self.tip.height {
            return Err(ChainError::Misaligned {
                block_height: tip.height,
                header_height: self.tip.height,
            });
        }
        if tip.height == self.tip.height {
            return Ok(None);
        }

        let next_height = tip.height + 1;
        let end_height = tip
            .height
            .saturating_add(read_ahead.max(1))
            .min(self.tip.height);
        let next = self
            .hash_at(next_height)?
            .ok_or(ChainError::HeightGap(next_height))?;
        let end = self
            .hash_at(end_height)?
            .ok_or(ChainError::HeightGap(end_height))?;
        Ok(Some((next, end)))
    }

    /// Active-chain hashes for heights `from..=to`.
    pub fn hashes_in_range(&self, from: u64, to: u64) -> ChainResult<Vec<Hash256>> {
        let mut out = Vec::with_capacity(to.saturating_sub(from) as usize + 1);
        for height in from..=to.min(self.tip.height) {
            out.push(self.hash_at(height)?.ok_or(ChainError::HeightGap(height))?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mine_on(prev: &Hash256, salt: u32, bits: u32) -> BlockHeader {
        let mut header = BlockHeader {
            version: 1,
            prev_hash: *prev,
            merkle_root: [salt as u8; 32],
            timestamp: 1_704_067_200 + salt,
            bits,
            nonce: 0,
            stake: None,
        };
        assert!(header.solve(1_000_000));
        header
    }

    fn chain_of(prev: Hash256, count: usize, salt: u32, bits: u32) -> Vec<BlockHeader> {
        let mut out: Vec<BlockHeader> = Vec::new();
        let mut prev = prev;
        for i in 0..count {
            let header = mine_on(&prev, salt + i as u32, bits);
            prev = header.hash();
            out.push(header);
        }
        out
    }

    fn open(store: &ChainStore, checkpoint: u64) -> HeaderChain {
        HeaderChain::open(store.clone(), NetworkType::Regtest, checkpoint).unwrap()
    }

    #[test]
    fn test_genesis_bootstrap_and_append() {
        let store = ChainStore::in_memory();
        let mut chain = open(&store, 2000);
        assert_eq!(chain.height(), 0);

        let headers = chain_of(chain.genesis_hash(), 3, 1, 0x207fffff);
        let outcome = chain.process_headers(&headers).unwrap();
        assert_eq!(
            outcome,
            HeaderBatchOutcome::Appended {
                added: 3,
                tip: Tip::new(3, headers[2].hash()),
                caught_up: true,
            }
        );
        assert_eq!(store.tip(HEADER_STREAM).unwrap(), Some(Tip::new(3, headers[2].hash())));

        // Height and chainwork monotonicity, plus next-hash links
        for height in 1..=3u64 {
            let h = chain.header_at(height).unwrap().unwrap();
            let p = chain.header_at(height - 1).unwrap().unwrap();
            assert_eq!(h.prev_hash(), p.hash);
            assert!(h.chainwork() > p.chainwork());
            assert_eq!(p.next_hash, Some(h.hash));
        }
    }

    #[test]
    fn test_broken_batch_is_fatal() {
        let store = ChainStore::in_memory();
        let mut chain = open(&store, 2000);
        let mut headers = chain_of(chain.genesis_hash(), 3, 1, 0x207fffff);
        headers.swap(1, 2);

        let err = chain.process_headers(&headers).unwrap_err();
        assert!(matches!(err, ChainError::BrokenLinkage { .. }));
        assert!(err.is_fatal());
        assert_eq!(chain.height(), 0);
    }

    #[test]
    fn test_bad_proof_of_work_is_recoverable() {
        let store = ChainStore::in_memory();
        let mut chain = open(&store, 2000);
        let mut header = mine_on(&chain.genesis_hash(), 1, 0x207fffff);
        // Claim a much harder target than the hash meets
        header.bits = 0x1d00ffff;
        let err = chain.process_headers(&[header]).unwrap_err();
        assert!(matches!(err, ChainError::InvalidProofOfWork(_)));
        assert!(!err.is_fatal());
    }

    fn stake_on(prev: &Hash256, salt: u8, bits: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_hash: *prev,
            merkle_root: [salt; 32],
            timestamp: 1,
            bits,
            nonce: 0,
            stake: Some(crate::block::StakeProof {
                prevout_hash: [salt; 32],
                prevout_index: 0,
                block_signature: vec![],
            }),
        }
    }

    #[test]
    fn test_proof_of_stake_skips_hash_check() {
        let store = ChainStore::in_memory();
        let mut chain = open(&store, 2000);
        let parent = mine_on(&chain.genesis_hash(), 1, 0x200fffff);
        chain.process_headers(&[parent.clone()]).unwrap();

        // Same target as the parent, with a hash that misses it
        let mut header = stake_on(&parent.hash(), 2, 0x200fffff);
        while work::check_proof_of_work(&header.hash(), header.bits).unwrap() {
            header.nonce += 1;
        }
        assert!(chain.process_headers(&[header]).is_ok());
        assert_eq!(chain.height(), 2);
    }

    #[test]
    fn test_stake_header_cannot_claim_harder_target() {
        let store = ChainStore::in_memory();
        let mut chain = open(&store, 4);
        let main = chain_of(chain.genesis_hash(), 10, 1, 0x207fffff);
        chain.process_headers(&main).unwrap();

        let forged = stake_on(&chain.genesis_hash(), 7, 0x03000001);
        let err = chain.process_headers(&[forged]).unwrap_err();
        assert!(matches!(err, ChainError::StakeTargetTooHard(_)));
        assert!(!err.is_fatal());
        assert!(err.is_peer_fault());
        assert_eq!(chain.tip(), Tip::new(10, main[9].hash()));
    }

    #[test]
    fn test_second_fork_after_rewind_is_peer_fault() {
        let store = ChainStore::in_memory();
        let mut chain = open(&store, 4);
        let main = chain_of(chain.genesis_hash(), 10, 1, 0x207fffff);
        chain.process_headers(&main).unwrap();

        let first = chain_of(chain.genesis_hash(), 2, 100, 0x200fffff);
        assert_eq!(
            chain.process_headers(&first).unwrap(),
            HeaderBatchOutcome::Rewound {
                from: Tip::new(10, main[9].hash()),
                to: Tip::new(6, main[5].hash()),
            }
        );

        let second = chain_of(chain.genesis_hash(), 2, 200, 0x200fffff);
        let err = chain.process_headers(&second).unwrap_err();
        assert!(matches!(err, ChainError::ForkBeyondCheckpoint(6)));
        assert!(!err.is_fatal());
        assert!(err.is_peer_fault());
        assert_eq!(chain.height(), 6);

        // Extending the rewound tip clears the guard
        chain.process_headers(&main[6..]).unwrap();
        assert_eq!(chain.height(), 10);
    }

    #[test]
    fn test_oversized_batch_rejected() {
        let store = ChainStore::in_memory();
        let mut chain = open(&store, 2000);
        let header = mine_on(&chain.genesis_hash(), 1, 0x207fffff);
        let batch = vec![header; MAX_HEADERS_PER_BATCH + 1];

        let err = chain.process_headers(&batch).unwrap_err();
        assert!(matches!(err, ChainError::OversizedBatch(2001)));
        assert!(err.is_peer_fault());
        assert_eq!(chain.height(), 0);
    }

    #[test]
    fn test_overlapping_reply_skips_known_prefix() {
        let store = ChainStore::in_memory();
        let mut chain = open(&store, 2000);
        let headers = chain_of(chain.genesis_hash(), 5, 1, 0x207fffff);
        chain.process_headers(&headers[..3]).unwrap();

        let outcome = chain.process_headers(&headers).unwrap();
        assert!(matches!(
            outcome,
            HeaderBatchOutcome::Appended { added: 2, .. }
        ));
        assert_eq!(chain.height(), 5);
    }

    #[test]
    fn test_lighter_fork_is_stale_and_heavier_rewinds() {
        let store = ChainStore::in_memory();
        let mut chain = open(&store, 2000);
        let main = chain_of(chain.genesis_hash(), 5, 1, 0x207fffff);
        chain.process_headers(&main).unwrap();

        // Same-work branch of equal length from height 3: not heavier
        let lighter = chain_of(main[2].hash(), 2, 100, 0x207fffff);
        assert_eq!(
            chain.process_headers(&lighter).unwrap(),
            HeaderBatchOutcome::StaleFork { fork_height: 4 }
        );
        assert_eq!(chain.height(), 5);

        let heavier = chain_of(main[2].hash(), 2, 200, 0x200fffff);
        let outcome = chain.process_headers(&heavier).unwrap();
        assert_eq!(
            outcome,
            HeaderBatchOutcome::Rewound {
                from: Tip::new(5, main[4].hash()),
                to: Tip::new(0, chain.genesis_hash()),
            }
        );
        assert!(store.header_hash_at(1).unwrap().is_none());
    }

    #[test]
    fn test_unknown_parent_is_orphan() {
        let store = ChainStore::in_memory();
        let mut chain = open(&store, 2000);
        let stray = chain_of([9u8; 32], 1, 1, 0x207fffff);
        assert_eq!(
            chain.process_headers(&stray).unwrap(),
            HeaderBatchOutcome::Orphan
        );
    }

    #[test]
    fn test_restart_rewinds_by_checkpoint() {
        let store = ChainStore::in_memory();
        let headers = {
            let mut chain = open(&store, 4);
            let headers = chain_of(chain.genesis_hash(), 10, 1, 0x207fffff);
            chain.process_headers(&headers).unwrap();
            headers
        };

        let chain = open(&store, 4);
        assert_eq!(chain.tip(), Tip::new(6, headers[5].hash()));
        assert!(store.header_hash_at(7).unwrap().is_none());
        assert!(store.get_header(&headers[9].hash()).unwrap().is_none());
        assert_eq!(chain.tip_header().next_hash, None);
    }

    #[test]
    fn test_get_end_hash_windows() {
        let store = ChainStore::in_memory();
        let mut chain = open(&store, 2000);
        let headers = chain_of(chain.genesis_hash(), 5, 1, 0x207fffff);
        chain.process_headers(&headers).unwrap();

        let genesis_tip = Tip::new(0, chain.genesis_hash());
        assert_eq!(
            chain.get_end_hash(&genesis_tip, 3).unwrap(),
            Some((headers[0].hash(), headers[2].hash()))
        );
        assert_eq!(
            chain.get_end_hash(&Tip::new(3, headers[2].hash()), 16).unwrap(),
            Some((headers[3].hash(), headers[4].hash()))
        );
        assert_eq!(chain.get_end_hash(&chain.tip(), 16).unwrap(), None);
        assert!(matches!(
            chain.get_end_hash(&Tip::new(9, [0u8; 32]), 16),
            Err(ChainError::Misaligned { .. })
        ));
    }

    #[test]
    fn test_locator_ends_at_genesis() {
        let store = ChainStore::in_memory();
        let mut chain = open(&store, 2000);
        let headers = chain_of(chain.genesis_hash(), 40, 1, 0x207fffff);
        chain.process_headers(&headers).unwrap();

        let locator = chain.block_locator().unwrap();
        assert_eq!(locator[0], headers[39].hash());
        assert_eq!(locator[1], headers[38].hash());
        assert_eq!(*locator.last().unwrap(), chain.genesis_hash());

        let served = chain
            .headers_after_locator(&[headers[29].hash()], &[0u8; 32])
            .unwrap();
        assert_eq!(served.len(), 10);
        assert_eq!(served[0], headers[30]);
    }
}
