//! Connection pool
//!
//! Owns every peer session. Keeps the outbound slots filled from the address
//! book, accepts inbound peers when a listen address is configured, tracks
//! the best peer by reported height, and turns per-connection events into
//! `PoolEvent`s for the sync control loop.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::constants::network::{
    FILL_INTERVAL_MILLIS, HANDSHAKE_TIMEOUT_SECS, INVENTORY_CACHE_SIZE, PEER_OUTBOUND_QUEUE,
};
use crate::constants::protocol::{MAX_ADDR_ENTRIES, PROTOCOL_VERSION, SERVICES};
use crate::network::address_book::{AddressBook, AddressSource};
use crate::network::inventory::InventoryCache;
use crate::network::message::{NetworkMessage, VersionMessage};
use crate::network::peer_connection::{
    run_peer, ConnectionDirection, PeerConnection, PeerEvent, PeerId, PeerStatus,
};
use crate::network::wire::WireCodec;
use crate::network_type::NetworkType;

const MAX_KNOWN_ADDRESSES: usize = 10_000;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("No ready peers")]
    NoPeers,

    #[error("Unknown peer {0}")]
    UnknownPeer(PeerId),

    #[error("Outbound queue to peer {0} is full or closed")]
    QueueFull(PeerId),

    #[error("Failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub network: NetworkType,
    pub max_peers: usize,
    pub listen_address: Option<SocketAddr>,
    pub dns_seeds: Vec<String>,
    pub bootstrap_peers: Vec<String>,
    pub keep_alive: bool,
    pub retry_cooldown: Duration,
    pub max_retry_cooldown: Duration,
    pub reconnect_interval: Duration,
    pub user_agent: String,
}

/// Events for the sync control loop, in arrival order.
#[derive(Debug)]
pub enum PoolEvent {
    BestHeightChanged { peer: PeerId, height: u64 },
    Message { peer: PeerId, message: NetworkMessage },
    PeerDisconnected { peer: PeerId },
}

#[derive(Debug)]
struct PeerHandle {
    addr: SocketAddr,
    direction: ConnectionDirection,
    status: PeerStatus,
    reported_version: Option<u32>,
    best_height: u64,
    sender: mpsc::Sender<NetworkMessage>,
    cancel: CancellationToken,
}

/// Snapshot of one peer for status output
#[derive(Debug, Clone)]
pub struct PeerSummary {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub direction: ConnectionDirection,
    pub status: PeerStatus,
    pub reported_version: Option<u32>,
    pub best_height: u64,
}

pub struct ConnectionPool {
    config: PoolConfig,
    codec: WireCodec,
    peers: DashMap<PeerId, PeerHandle>,
    address_book: AddressBook,
    inventory: Arc<InventoryCache>,
    best_peer: RwLock<Option<(PeerId, u64)>>,
    next_peer_id: AtomicU64,
    local_nonce: u64,
    local_height: Arc<AtomicU64>,
    keep_alive: AtomicBool,
    reconnect_scheduled: AtomicBool,
    events: mpsc::Sender<PoolEvent>,
    peer_events: mpsc::Sender<PeerEvent>,
    cancel: CancellationToken,
}

impl ConnectionPool {
    pub fn new(
        config: PoolConfig,
        codec: WireCodec,
        local_height: Arc<AtomicU64>,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<PoolEvent>, mpsc::Receiver<PeerEvent>) {
        let (events, events_rx) = mpsc::channel(PEER_OUTBOUND_QUEUE);
        let (peer_events, peer_events_rx) = mpsc::channel(PEER_OUTBOUND_QUEUE);

        let pool = Arc::new(Self {
            address_book: AddressBook::new(
                config.retry_cooldown,
                config.max_retry_cooldown,
                MAX_KNOWN_ADDRESSES,
            ),
            keep_alive: AtomicBool::new(config.keep_alive),
            config,
            codec,
            peers: DashMap::new(),
            inventory: Arc::new(InventoryCache::new(INVENTORY_CACHE_SIZE)),
            best_peer: RwLock::new(None),
            next_peer_id: AtomicU64::new(1),
            local_nonce: rand::random(),
            local_height,
            reconnect_scheduled: AtomicBool::new(false),
            events,
            peer_events,
            cancel,
        });
        (pool, events_rx, peer_events_rx)
    }

    /// Seed the address book and spawn the listener, event router and fill loop.
    pub async fn start(
        self: &Arc<Self>,
        peer_events: mpsc::Receiver<PeerEvent>,
    ) -> Result<Vec<JoinHandle<()>>, PoolError> {
        let mut handles = Vec::new();

        self.add_bootstrap_peers().await;
        self.discover_seeds().await;
        info!(
            "📒 Address book seeded with {} address(es)",
            self.address_book.len()
        );

        if let Some(addr) = self.config.listen_address {
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|source| PoolError::Bind { addr, source })?;
            info!("👂 Listening for inbound peers on {}", addr);
            let pool = self.clone();
            handles.push(tokio::spawn(async move { pool.accept_loop(listener).await }));
        }

        let pool = self.clone();
        handles.push(tokio::spawn(async move {
            pool.route_peer_events(peer_events).await
        }));

        let pool = self.clone();
        handles.push(tokio::spawn(async move { pool.fill_loop().await }));

        Ok(handles)
    }

    pub fn network(&self) -> NetworkType {
        self.config.network
    }

    /// Shared with the sync engine, which clears it on reorg
    pub fn inventory(&self) -> Arc<InventoryCache> {
        self.inventory.clone()
    }

    pub fn address_book(&self) -> &AddressBook {
        &self.address_book
    }

    pub fn ready_count(&self) -> usize {
        self.peers
            .iter()
            .filter(|p| p.status == PeerStatus::Ready)
            .count()
    }

    pub fn best_peer(&self) -> Option<(PeerId, u64)> {
        *self.best_peer.read()
    }

    pub fn peers(&self) -> Vec<PeerSummary> {
        self.peers
            .iter()
            .map(|p| PeerSummary {
                id: *p.key(),
                addr: p.addr,
                direction: p.direction,
                status: p.status,
                reported_version: p.reported_version,
                best_height: p.best_height,
            })
            .collect()
    }

    fn local_version(&self) -> VersionMessage {
        VersionMessage {
            protocol_version: PROTOCOL_VERSION,
            services: SERVICES,
            best_height: self.local_height.load(Ordering::Acquire),
            relay: true,
            timestamp: chrono::Utc::now().timestamp(),
            nonce: self.local_nonce,
            user_agent: self.config.user_agent.clone(),
        }
    }

    async fn add_bootstrap_peers(&self) {
        let port = self.config.network.default_p2p_port();
        for peer in &self.config.bootstrap_peers {
            let target = if peer.contains(':') {
                peer.clone()
            } else {
                format!("{}:{}", peer, port)
            };
            let resolved = lookup_host(target.as_str()).await;
            match resolved {
                Ok(addrs) => {
                    self.address_book.add_many(addrs, AddressSource::Bootstrap);
                }
                Err(e) => warn!("⚠️ Could not resolve bootstrap peer {}: {}", target, e),
            }
        }
    }

    async fn discover_seeds(&self) {
        let port = self.config.network.default_p2p_port();
        for seed in &self.config.dns_seeds {
            match lookup_host((seed.as_str(), port)).await {
                Ok(addrs) => {
                    let added = self.address_book.add_many(addrs, AddressSource::Seed);
                    debug!("🌱 DNS seed {} gave {} new address(es)", seed, added);
                }
                Err(e) => warn!("⚠️ DNS seed {} failed: {}", seed, e),
            }
        }
    }

    async fn fill_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(FILL_INTERVAL_MILLIS));
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if self.keep_alive.load(Ordering::Acquire) {
                        self.fill_connections();
                    }
                }
            }
        }
        debug!("Fill loop stopped");
    }

    /// Dial addresses out of backoff until `max_peers` sessions exist.
    pub fn fill_connections(self: &Arc<Self>) {
        let open = self.peers.len();
        if open >= self.config.max_peers {
            return;
        }

        let connected: HashSet<SocketAddr> = self.peers.iter().map(|p| p.addr).collect();
        let candidates = self.address_book.candidates(
            Instant::now(),
            &connected,
            self.config.max_peers - open,
        );
        for addr in candidates {
            self.dial(addr);
        }
    }

    /// Register a session and spawn its dial + transport task.
    pub fn dial(self: &Arc<Self>, addr: SocketAddr) {
        if self.cancel.is_cancelled() {
            return;
        }

        let (peer, mut connection, outbound_rx, cancel) =
            self.register(addr, ConnectionDirection::Outbound);
        if let Err(e) = connection.begin_connect() {
            warn!("⚠️ Cannot dial {}: {}", addr, e);
            return;
        }
        self.set_status(peer, PeerStatus::Connecting);

        let pool = self.clone();
        tokio::spawn(async move {
            debug!("🔗 [OUTBOUND] Connecting to {}", addr);
            let connect = timeout(
                Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
                TcpStream::connect(addr),
            );
            let stream = tokio::select! {
                _ = cancel.cancelled() => None,
                result = connect => match result {
                    Ok(Ok(stream)) => Some(stream),
                    Ok(Err(e)) => {
                        debug!("Dial {} failed: {}", addr, e);
                        None
                    }
                    Err(_) => {
                        debug!("Dial {} timed out", addr);
                        None
                    }
                },
            };

            match stream {
                Some(stream) => {
                    pool.set_status(peer, PeerStatus::Connected);
                    run_peer(
                        peer,
                        connection,
                        stream,
                        pool.codec.clone(),
                        outbound_rx,
                        pool.peer_events.clone(),
                        cancel,
                    )
                    .await;
                }
                None => {
                    let _ = pool
                        .peer_events
                        .send(PeerEvent::Disconnected {
                            peer,
                            reason: "dial failed".to_string(),
                        })
                        .await;
                }
            }
        });
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    if self.peers.len() >= self.config.max_peers {
                        debug!("Rejecting inbound {}: pool full", addr);
                        continue;
                    }
                    info!("🔗 [Inbound] Accepted connection from {}", addr);
                    self.address_book.add(addr, AddressSource::Inbound);
                    let (peer, connection, outbound_rx, cancel) =
                        self.register(addr, ConnectionDirection::Inbound);
                    self.set_status(peer, PeerStatus::Connected);
                    let pool = self.clone();
                    tokio::spawn(async move {
                        run_peer(
                            peer,
                            connection,
                            stream,
                            pool.codec.clone(),
                            outbound_rx,
                            pool.peer_events.clone(),
                            cancel,
                        )
                        .await;
                    });
                }
                Err(e) => warn!("⚠️ Accept failed: {}", e),
            }
        }
        debug!("Inbound listener stopped");
    }

    fn register(
        &self,
        addr: SocketAddr,
        direction: ConnectionDirection,
    ) -> (
        PeerId,
        PeerConnection,
        mpsc::Receiver<NetworkMessage>,
        CancellationToken,
    ) {
        let peer = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
        let (sender, outbound_rx) = mpsc::channel(PEER_OUTBOUND_QUEUE);
        let cancel = self.cancel.child_token();
        self.peers.insert(
            peer,
            PeerHandle {
                addr,
                direction,
                status: PeerStatus::Disconnected,
                reported_version: None,
                best_height: 0,
                sender,
                cancel: cancel.clone(),
            },
        );
        let connection = PeerConnection::new(addr, direction, self.local_version());
        (peer, connection, outbound_rx, cancel)
    }

    fn set_status(&self, peer: PeerId, status: PeerStatus) {
        if let Some(mut handle) = self.peers.get_mut(&peer) {
            handle.status = status;
        }
    }

    async fn route_peer_events(self: Arc<Self>, mut peer_events: mpsc::Receiver<PeerEvent>) {
        while let Some(event) = peer_events.recv().await {
            for pool_event in self.handle_peer_event(event) {
                if self.events.send(pool_event).await.is_err() {
                    return;
                }
            }
        }
    }

    /// Update peer bookkeeping for one transport event.
    pub fn handle_peer_event(self: &Arc<Self>, event: PeerEvent) -> Vec<PoolEvent> {
        let mut out = Vec::new();
        match event {
            PeerEvent::Ready {
                peer,
                version,
                best_height,
            } => {
                let addr = match self.peers.get_mut(&peer) {
                    Some(mut handle) => {
                        handle.status = PeerStatus::Ready;
                        handle.reported_version = Some(version);
                        handle.best_height = best_height;
                        handle.addr
                    }
                    None => return out,
                };
                info!(
                    "✅ Peer {} ({}) ready at height {}",
                    peer, addr, best_height
                );
                self.address_book.mark_good(&addr);
                let _ = self.send_to(peer, NetworkMessage::GetAddr);
                out.extend(self.recompute_best());
            }
            PeerEvent::Message { peer, message } => match message {
                NetworkMessage::Addr(addrs) => {
                    let added = self.address_book.add_many(
                        addrs.into_iter().take(MAX_ADDR_ENTRIES),
                        AddressSource::Gossip,
                    );
                    debug!("📬 {} new address(es) from peer {}", added, peer);
                }
                NetworkMessage::GetAddr => {
                    let sample = self.address_book.sample(MAX_ADDR_ENTRIES);
                    let _ = self.send_to(peer, NetworkMessage::Addr(sample));
                }
                message => out.push(PoolEvent::Message { peer, message }),
            },
            PeerEvent::Disconnected { peer, reason } => {
                if let Some((_, handle)) = self.peers.remove(&peer) {
                    handle.cancel.cancel();
                    if let Some(delay) = self.address_book.demote(&handle.addr, Instant::now()) {
                        debug!(
                            "Peer {} ({}) gone: {}; retry in {:?}",
                            peer, handle.addr, reason, delay
                        );
                    }
                    out.push(PoolEvent::PeerDisconnected { peer });
                }
                out.extend(self.recompute_best());
                if self.peers.is_empty() {
                    self.schedule_reconnect();
                }
            }
        }
        out
    }

    /// Zero peers: after the reconnect interval, clear backoffs and re-seed.
    fn schedule_reconnect(self: &Arc<Self>) {
        if self.cancel.is_cancelled() || self.reconnect_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(
            "⚠️ No connected peers, reconnecting in {:?}",
            self.config.reconnect_interval
        );
        let pool = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = pool.cancel.cancelled() => {}
                _ = tokio::time::sleep(pool.config.reconnect_interval) => {
                    pool.address_book.reset_backoff();
                    if pool.address_book.is_empty() {
                        pool.discover_seeds().await;
                    }
                    pool.fill_connections();
                }
            }
            pool.reconnect_scheduled.store(false, Ordering::Release);
        });
    }

    /// Highest reported height among ready peers; emits on change.
    fn recompute_best(&self) -> Option<PoolEvent> {
        let best = self
            .peers
            .iter()
            .filter(|p| p.status == PeerStatus::Ready)
            .map(|p| (*p.key(), p.best_height))
            .max_by_key(|(id, height)| (*height, std::cmp::Reverse(*id)));

        let mut current = self.best_peer.write();
        if *current == best {
            return None;
        }
        *current = best;
        best.map(|(peer, height)| {
            info!("🏆 Best peer is now {} at height {}", peer, height);
            PoolEvent::BestHeightChanged { peer, height }
        })
    }

    /// Raise a peer's known height (it announced something higher).
    pub fn update_peer_height(&self, peer: PeerId, height: u64) -> Option<PoolEvent> {
        {
            let mut handle = self.peers.get_mut(&peer)?;
            if height <= handle.best_height {
                return None;
            }
            handle.best_height = height;
        }
        self.recompute_best()
    }

    pub fn send_to(&self, peer: PeerId, message: NetworkMessage) -> Result<(), PoolError> {
        let handle = self.peers.get(&peer).ok_or(PoolError::UnknownPeer(peer))?;
        handle
            .sender
            .try_send(message)
            .map_err(|_| PoolError::QueueFull(peer))
    }

    pub fn send_to_best(&self, message: NetworkMessage) -> Result<PeerId, PoolError> {
        let (peer, _) = self.best_peer().ok_or(PoolError::NoPeers)?;
        self.send_to(peer, message)?;
        Ok(peer)
    }

    /// Send to every ready peer; returns how many accepted it.
    pub fn broadcast(&self, message: NetworkMessage) -> usize {
        self.peers
            .iter()
            .filter(|p| p.status == PeerStatus::Ready)
            .filter(|p| p.sender.try_send(message.clone()).is_ok())
            .count()
    }

    /// Drop a misbehaving peer; its task reports the disconnect.
    pub fn disconnect(&self, peer: PeerId) {
        if let Some(handle) = self.peers.get(&peer) {
            warn!("🚫 Disconnecting peer {} ({})", peer, handle.addr);
            handle.cancel.cancel();
        }
    }

    pub fn stop(&self) {
        self.keep_alive.store(false, Ordering::Release);
        for peer in self.peers.iter() {
            peer.cancel.cancel();
        }
    }
}
