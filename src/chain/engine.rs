//! Sync control loop state
//!
//! `SyncEngine` turns pool events and timer ticks into header/block pipeline
//! work and outbound requests. It is driven from a single task, so the
//! header chain, block tip and recent hash ring have exactly one writer.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::chain::block_sync::{Alignment, BlockOutcome, BlockSyncEngine};
use crate::chain::header_chain::{HeaderBatchOutcome, HeaderChain};
use crate::chain::sync_state::SyncState;
use crate::chain_error::{ChainError, ChainResult};
use crate::block::{Block, BlockHeader, RawTransaction};
use crate::network::{
    GetHeadersMessage, InvItem, InvType, InventoryCache, NetworkMessage, PeerId, PoolEvent,
};
use crate::service::ServiceRegistry;
use crate::services::{Admission, MempoolService};
use crate::types::{short_hash, Tip, ZERO_HASH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// No best peer yet
    Idle,
    /// Bulk header download
    Headers,
    /// Block catch-up behind the header tip
    Blocks,
    /// Caught up; following announcements
    Live,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Headers => "headers",
            SyncPhase::Blocks => "blocks",
            SyncPhase::Live => "live",
        };
        write!(f, "{}", name)
    }
}

/// Work for the connection pool produced by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    ToPeer { peer: PeerId, message: NetworkMessage },
    ToBest(NetworkMessage),
    Broadcast(NetworkMessage),
    Disconnect(PeerId),
    /// The peer showed us a chain at least this high
    PeerHeight { peer: PeerId, height: u64 },
}

struct HeaderRequest {
    peer: PeerId,
    sent_at: Instant,
}

pub struct SyncEngine {
    headers: HeaderChain,
    blocks: BlockSyncEngine,
    registry: Arc<ServiceRegistry>,
    inventory: Arc<InventoryCache>,
    state: Arc<SyncState>,
    mempool: Option<Arc<MempoolService>>,
    phase: SyncPhase,
    best: Option<(PeerId, u64)>,
    header_request: Option<HeaderRequest>,
    header_timeout: Duration,
    headers_synced_sent: bool,
}

impl SyncEngine {
    pub fn new(
        headers: HeaderChain,
        blocks: BlockSyncEngine,
        registry: Arc<ServiceRegistry>,
        inventory: Arc<InventoryCache>,
        state: Arc<SyncState>,
        header_timeout: Duration,
    ) -> Self {
        state.set_header_height(headers.height());
        state.set_block_height(blocks.tip().height);
        Self {
            headers,
            blocks,
            registry,
            inventory,
            state,
            mempool: None,
            phase: SyncPhase::Idle,
            best: None,
            header_request: None,
            header_timeout,
            headers_synced_sent: false,
        }
    }

    /// Route relayed transactions into `mempool` once live.
    pub fn with_mempool(mut self, mempool: Arc<MempoolService>) -> Self {
        self.mempool = Some(mempool);
        self
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn headers(&self) -> &HeaderChain {
        &self.headers
    }

    pub fn blocks(&self) -> &BlockSyncEngine {
        &self.blocks
    }

    pub fn header_tip(&self) -> Tip {
        self.headers.tip()
    }

    pub fn block_tip(&self) -> Tip {
        self.blocks.tip()
    }

    pub async fn handle_event(&mut self, event: PoolEvent, now: Instant) -> ChainResult<Vec<Outbound>> {
        match event {
            PoolEvent::BestHeightChanged { peer, height } => self.on_best_height(peer, height, now),
            PoolEvent::PeerDisconnected { peer } => {
                if self.best.map(|(p, _)| p) == Some(peer) {
                    self.best = None;
                }
                if self.header_request.as_ref().map(|r| r.peer) == Some(peer) {
                    self.header_request = None;
                }
                Ok(Vec::new())
            }
            PoolEvent::Message { peer, message } => self.on_message(peer, message, now).await,
        }
    }

    /// Timer-driven retries: stalled header requests and block windows.
    pub async fn on_tick(&mut self, now: Instant) -> ChainResult<Vec<Outbound>> {
        let mut out = Vec::new();

        let stalled = self
            .header_request
            .as_ref()
            .map_or(false, |r| now.duration_since(r.sent_at) >= self.header_timeout);
        if stalled {
            warn!("⏱️  Header request timed out, asking again");
            self.header_request = None;
        }

        if self.header_request.is_none() && self.phase == SyncPhase::Headers {
            if let Some((peer, _)) = self.best {
                out.push(self.request_headers(peer, now)?);
            }
        }

        out.extend(self.advance_blocks(now).await?);
        Ok(out)
    }

    fn on_best_height(&mut self, peer: PeerId, height: u64, now: Instant) -> ChainResult<Vec<Outbound>> {
        self.best = Some((peer, height));
        self.state.set_best_peer_height(height);

        if self.phase == SyncPhase::Idle {
            info!(
                "🔄 Starting header sync from {} with peer {} at height {}",
                self.headers.tip(),
                peer,
                height
            );
            self.phase = SyncPhase::Headers;
            return Ok(vec![self.request_headers(peer, now)?]);
        }

        if height > self.headers.height() && self.header_request.is_none() {
            return Ok(vec![self.request_headers(peer, now)?]);
        }
        Ok(Vec::new())
    }

    async fn on_message(
        &mut self,
        peer: PeerId,
        message: NetworkMessage,
        now: Instant,
    ) -> ChainResult<Vec<Outbound>> {
        match message {
            NetworkMessage::Headers(batch) => self.on_headers(peer, batch, now).await,
            NetworkMessage::Block(block) => self.on_block(peer, block, now).await,
            NetworkMessage::Inv(items) => self.on_inv(peer, items, now),
            NetworkMessage::Tx(tx) => Ok(self.on_tx(peer, tx)),
            NetworkMessage::NotFound(items) => {
                for item in items.iter().filter(|i| i.kind == InvType::Block) {
                    self.inventory.remove(&item.hash);
                    self.blocks.forget_requested(&item.hash);
                }
                Ok(Vec::new())
            }
            NetworkMessage::GetHeaders(request) => {
                let headers = self
                    .headers
                    .headers_after_locator(&request.locator, &request.stop_hash)?;
                Ok(vec![Outbound::ToPeer {
                    peer,
                    message: NetworkMessage::Headers(headers),
                }])
            }
            // Bodies are not kept after indexing
            NetworkMessage::GetData(items) => Ok(vec![Outbound::ToPeer {
                peer,
                message: NetworkMessage::NotFound(items),
            }]),
            other => {
                debug!("Ignoring {} from peer {}", other.command(), peer);
                Ok(Vec::new())
            }
        }
    }

    async fn on_headers(
        &mut self,
        peer: PeerId,
        batch: Vec<BlockHeader>,
        now: Instant,
    ) -> ChainResult<Vec<Outbound>> {
        let solicited = self.header_request.as_ref().map(|r| r.peer) == Some(peer);
        if solicited {
            self.header_request = None;
        }

        let outcome = match self.headers.process_headers(&batch) {
            Ok(outcome) => outcome,
            Err(e) if !e.is_fatal() => {
                warn!("⚠️ Rejected header batch from peer {}: {}", peer, e);
                return Ok(self.drop_peer_if_at_fault(peer, &e));
            }
            Err(e) => return Err(e),
        };

        match outcome {
            HeaderBatchOutcome::Appended {
                added,
                tip,
                caught_up,
            } => {
                self.state.set_header_height(tip.height);
                let mut out = Vec::new();
                if added > 0 {
                    debug!("📥 +{} header(s) from peer {}, header tip {}", added, peer, tip);
                    out.push(Outbound::PeerHeight {
                        peer,
                        height: tip.height,
                    });
                }
                if !caught_up {
                    if solicited || self.header_request.is_none() {
                        out.push(self.request_headers(peer, now)?);
                    }
                    return Ok(out);
                }
                // Only a short reply to our own request ends header sync
                if solicited {
                    out.extend(self.on_headers_caught_up(now).await?);
                } else {
                    out.extend(self.advance_blocks(now).await?);
                }
                Ok(out)
            }
            HeaderBatchOutcome::StaleFork { fork_height } => {
                debug!(
                    "Peer {} announced a lighter fork at height {}",
                    peer, fork_height
                );
                Ok(Vec::new())
            }
            HeaderBatchOutcome::Orphan if solicited => {
                warn!("⚠️ Peer {} answered our locator with unconnected headers", peer);
                Ok(vec![Outbound::Disconnect(peer)])
            }
            HeaderBatchOutcome::Orphan if self.header_request.is_none() => {
                Ok(vec![self.request_headers(peer, now)?])
            }
            HeaderBatchOutcome::Orphan => Ok(Vec::new()),
            HeaderBatchOutcome::Rewound { from, to } => {
                warn!(
                    "⏪ Header chain rewound from {} to {}, resyncing headers",
                    from, to
                );
                self.state.set_header_height(to.height);
                self.state.set_mempool_enabled(false);
                self.blocks.clear_in_flight();
                self.phase = SyncPhase::Headers;
                Ok(vec![self.request_headers(peer, now)?])
            }
        }
    }

    async fn on_headers_caught_up(&mut self, now: Instant) -> ChainResult<Vec<Outbound>> {
        if !self.headers_synced_sent {
            self.headers_synced_sent = true;
            info!("📚 Header sync complete at {}", self.headers.tip());
            self.registry.headers_synced().await?;
        }
        if matches!(self.phase, SyncPhase::Idle | SyncPhase::Headers) {
            info!(
                "📦 Starting block sync from {} toward {}",
                self.blocks.tip(),
                self.headers.tip()
            );
            self.phase = SyncPhase::Blocks;
        }
        self.advance_blocks(now).await
    }

    async fn on_block(&mut self, peer: PeerId, block: Block, now: Instant) -> ChainResult<Vec<Outbound>> {
        let hash = block.hash();
        self.inventory.remove(&hash);

        let mut out = Vec::new();
        match self.blocks.process_block(block, &self.headers).await {
            Ok(BlockOutcome::UnknownHeader) => {
                out.push(self.request_headers(peer, now)?);
                return Ok(out);
            }
            Ok(BlockOutcome::Stale) => {
                debug!("Stale block {} from peer {}", short_hash(&hash), peer);
            }
            Ok(_) => {}
            Err(e) if !e.is_fatal() => {
                warn!("⚠️ Rejected block {} from peer {}: {}", short_hash(&hash), peer, e);
                out.extend(self.drop_peer_if_at_fault(peer, &e));
            }
            Err(e) => return Err(e),
        }

        out.extend(self.advance_blocks(now).await?);
        Ok(out)
    }

    fn on_inv(&mut self, peer: PeerId, items: Vec<InvItem>, now: Instant) -> ChainResult<Vec<Outbound>> {
        let mut out = Vec::new();
        let mut wanted_txs = Vec::new();
        let mut unknown_block = false;

        for item in items {
            match item.kind {
                InvType::Block | InvType::FilteredBlock => {
                    if !self.inventory.contains(&item.hash) && !self.headers.contains(&item.hash)? {
                        unknown_block = true;
                    }
                }
                InvType::Tx => {
                    let Some(mempool) = self.mempool.as_ref() else {
                        continue;
                    };
                    if self.state.is_mempool_enabled()
                        && !mempool.contains(&item.hash)
                        && self.inventory.insert(item.hash)
                    {
                        wanted_txs.push(item);
                    }
                }
            }
        }

        if unknown_block && self.header_request.is_none() {
            out.push(self.request_headers(peer, now)?);
        }
        if !wanted_txs.is_empty() {
            out.push(Outbound::ToPeer {
                peer,
                message: NetworkMessage::GetData(wanted_txs),
            });
        }
        Ok(out)
    }

    fn on_tx(&mut self, peer: PeerId, tx: RawTransaction) -> Vec<Outbound> {
        let Some(mempool) = self.mempool.as_ref() else {
            return Vec::new();
        };
        let txid = tx.txid();
        self.inventory.remove(&txid);
        match mempool.accept(tx) {
            Admission::Accepted => {
                debug!("💸 Accepted tx {} from peer {}", short_hash(&txid), peer);
                vec![Outbound::Broadcast(NetworkMessage::Inv(vec![InvItem::tx(txid)]))]
            }
            other => {
                debug!("Tx {} from peer {} not admitted: {:?}", short_hash(&txid), peer, other);
                Vec::new()
            }
        }
    }

    /// Keep the block pipeline moving: realign, request the next window,
    /// and enter live mode once the block tip reaches the header tip.
    async fn advance_blocks(&mut self, now: Instant) -> ChainResult<Vec<Outbound>> {
        if !matches!(self.phase, SyncPhase::Blocks | SyncPhase::Live) {
            return Ok(Vec::new());
        }

        if self.blocks.reconcile(&self.headers).await? == Alignment::Ahead {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        if let Some(hashes) = self.blocks.next_request(&self.headers, now)? {
            for hash in &hashes {
                self.inventory.insert(*hash);
            }
            let items = hashes.into_iter().map(InvItem::block).collect();
            out.push(Outbound::ToBest(NetworkMessage::GetData(items)));
        }

        if self.phase == SyncPhase::Blocks
            && self.blocks.tip() == self.headers.tip()
            && !self.blocks.has_in_flight()
        {
            self.state.set_mempool_enabled(true);
            self.phase = SyncPhase::Live;
            info!("🟢 Caught up at {}, following the network", self.blocks.tip());
        } else if self.phase == SyncPhase::Live && self.blocks.tip().height < self.headers.height() {
            debug!("Live: {} block(s) behind", self.headers.height() - self.blocks.tip().height);
        }

        Ok(out)
    }

    fn request_headers(&mut self, peer: PeerId, now: Instant) -> ChainResult<Outbound> {
        let locator = self.headers.block_locator()?;
        self.header_request = Some(HeaderRequest { peer, sent_at: now });
        Ok(Outbound::ToPeer {
            peer,
            message: NetworkMessage::GetHeaders(GetHeadersMessage {
                locator,
                stop_hash: ZERO_HASH,
            }),
        })
    }

    fn drop_peer_if_at_fault(&self, peer: PeerId, error: &ChainError) -> Vec<Outbound> {
        if error.is_peer_fault() {
            vec![Outbound::Disconnect(peer)]
        } else {
            Vec::new()
        }
    }
}
