//! Node context
//!
//! Builds every component in dependency order (wire codec, peer connections
//! through the pool, header chain, block sync) and owns the single sync
//! control loop. Nothing here is global: tests build as many nodes as they
//! like against in-memory stores.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::chain::{BlockSyncEngine, HeaderChain, Outbound, SyncEngine, SyncState};
use crate::chain_error::ChainResult;
use crate::config::Config;
use crate::constants::sync::TICK_INTERVAL_MILLIS;
use crate::error::AppError;
use crate::network::peer_connection::PeerEvent;
use crate::network::{ConnectionPool, PoolEvent, WireCodec};
use crate::network_type::NetworkType;
use crate::notifier::ChainNotifier;
use crate::service::ServiceRegistry;
use crate::services::{MempoolService, TxIndexService};
use crate::storage::{ChainStore, KvStore, MemoryStore, SledStore};

pub struct Node {
    network: NetworkType,
    store: ChainStore,
    pool: Arc<ConnectionPool>,
    engine: SyncEngine,
    state: Arc<SyncState>,
    notifier: Arc<ChainNotifier>,
    tx_index: Arc<TxIndexService>,
    mempool: Arc<MempoolService>,
    events: mpsc::Receiver<PoolEvent>,
    peer_events: Option<mpsc::Receiver<PeerEvent>>,
    progress_interval: Duration,
    cancel: CancellationToken,
}

impl Node {
    pub async fn build(config: &Config, cancel: CancellationToken) -> Result<Self, AppError> {
        config.validate()?;
        let network = config.node.network_type()?;
        let state = Arc::new(SyncState::new());

        let codec = WireCodec::new(network.magic_bytes());
        let (pool, events, peer_events) = ConnectionPool::new(
            config.pool_config()?,
            codec,
            state.block_height_handle(),
            cancel.clone(),
        );

        let store = open_store(config)?;
        let headers = HeaderChain::open(store.clone(), network, config.sync.checkpoint_distance)?;
        info!(
            "📚 Header chain ready at {} (checkpoint distance {})",
            headers.tip(),
            config.sync.checkpoint_distance
        );

        let tx_index = Arc::new(TxIndexService::new(store.clone()));
        let mempool = Arc::new(MempoolService::new(
            state.mempool_switch(),
            config.sync.reorg_window,
        ));
        let mut registry = ServiceRegistry::new(store.clone(), headers.genesis_hash());
        registry.register(tx_index.clone());
        registry.register(mempool.clone());
        let registry = Arc::new(registry);
        info!("🧩 Dependent services: {}", registry.names().join(", "));

        let notifier = Arc::new(ChainNotifier::new());
        let blocks = BlockSyncEngine::open(
            store.clone(),
            network,
            registry.clone(),
            notifier.clone(),
            pool.inventory(),
            state.clone(),
            config.sync.block_sync(),
        )
        .await?;

        let engine = SyncEngine::new(
            headers,
            blocks,
            registry,
            pool.inventory(),
            state.clone(),
            Duration::from_secs(config.sync.header_request_timeout_secs),
        )
        .with_mempool(mempool.clone());

        Ok(Self {
            network,
            store,
            pool,
            engine,
            state,
            notifier,
            tx_index,
            mempool,
            events,
            peer_events: Some(peer_events),
            progress_interval: Duration::from_secs(config.sync.progress_interval_secs),
            cancel,
        })
    }

    pub fn network(&self) -> NetworkType {
        self.network
    }

    pub fn state(&self) -> Arc<SyncState> {
        self.state.clone()
    }

    pub fn notifier(&self) -> Arc<ChainNotifier> {
        self.notifier.clone()
    }

    pub fn tx_index(&self) -> Arc<TxIndexService> {
        self.tx_index.clone()
    }

    pub fn mempool(&self) -> Arc<MempoolService> {
        self.mempool.clone()
    }

    /// Start networking and the progress reporter.
    pub async fn start(&mut self) -> Result<Vec<JoinHandle<()>>, AppError> {
        let peer_events = self
            .peer_events
            .take()
            .ok_or_else(|| AppError::Network("node already started".to_string()))?;
        let mut handles = self
            .pool
            .start(peer_events)
            .await
            .map_err(|e| AppError::Network(e.to_string()))?;

        handles.push(spawn_progress_reporter(
            self.state.clone(),
            self.pool.clone(),
            self.progress_interval,
            self.cancel.clone(),
        ));
        Ok(handles)
    }

    /// The sync control loop. Returns an error only for fatal conditions,
    /// after cancelling every other task.
    pub async fn run(mut self) -> Result<(), AppError> {
        let mut tick = tokio::time::interval(Duration::from_millis(TICK_INTERVAL_MILLIS));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(event) => self.engine.handle_event(event, Instant::now()).await,
                    None => break,
                },
                _ = tick.tick() => self.engine.on_tick(Instant::now()).await,
            };

            if let Err(e) = self.settle(result).await {
                error!("💥 Fatal sync error, stopping: {}", e);
                self.stop();
                self.cancel.cancel();
                return Err(AppError::Sync(e));
            }
        }

        self.stop();
        Ok(())
    }

    /// Dispatch the engine's output, feeding any pool events it causes
    /// straight back into the engine.
    async fn settle(&mut self, result: ChainResult<Vec<Outbound>>) -> ChainResult<()> {
        let mut pending: VecDeque<PoolEvent> = self.dispatch(result?).into();
        while let Some(event) = pending.pop_front() {
            let outbound = self.engine.handle_event(event, Instant::now()).await?;
            pending.extend(self.dispatch(outbound));
        }
        Ok(())
    }

    fn dispatch(&self, outbound: Vec<Outbound>) -> Vec<PoolEvent> {
        let mut events = Vec::new();
        for item in outbound {
            let result = match item {
                Outbound::ToPeer { peer, message } => self.pool.send_to(peer, message),
                Outbound::ToBest(message) => self.pool.send_to_best(message).map(|_| ()),
                Outbound::Broadcast(message) => {
                    self.pool.broadcast(message);
                    Ok(())
                }
                Outbound::Disconnect(peer) => {
                    self.pool.disconnect(peer);
                    Ok(())
                }
                Outbound::PeerHeight { peer, height } => {
                    events.extend(self.pool.update_peer_height(peer, height));
                    Ok(())
                }
            };
            if let Err(e) = result {
                // Timeouts re-issue whatever was lost here
                debug!("Outbound message not sent: {}", e);
            }
        }
        events
    }

    fn stop(&self) {
        self.state.request_stop();
        self.pool.stop();
        if let Err(e) = self.store.flush() {
            error!("Failed to flush store: {}", e);
        }
        info!(
            "🛑 Sync stopped at header {} / block {}",
            self.engine.header_tip(),
            self.engine.block_tip()
        );
    }
}

fn open_store(config: &Config) -> Result<ChainStore, AppError> {
    let kv: Arc<dyn KvStore> = match config.storage.backend.as_str() {
        "memory" => {
            info!("💾 Using in-memory storage (nothing persists)");
            Arc::new(MemoryStore::new())
        }
        _ => {
            let path = format!("{}/chain", config.storage.data_dir);
            std::fs::create_dir_all(&config.storage.data_dir)?;
            let store = SledStore::open(&path, config.storage.cache_size_mb * 1024 * 1024)?;
            info!("💾 Opened sled store at {}", path);
            Arc::new(store)
        }
    };
    Ok(ChainStore::new(kv))
}

/// Periodic, purely observational sync progress log.
pub fn spawn_progress_reporter(
    state: Arc<SyncState>,
    pool: Arc<ConnectionPool>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut last_blocks = state.block_height();
        let mut last_at = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let headers = state.header_height();
            let blocks = state.block_height();
            let target = headers.max(state.best_peer_height());
            let elapsed = last_at.elapsed().as_secs_f64().max(0.001);
            let rate = blocks.saturating_sub(last_blocks) as f64 / elapsed;
            let percent = if target == 0 {
                100.0
            } else {
                (blocks as f64 / target as f64 * 100.0).min(100.0)
            };

            info!(
                "📊 Sync: headers {} | blocks {}/{} ({:.1}%) | {:.1} blk/s | {} peer(s){}",
                headers,
                blocks,
                target,
                percent,
                rate,
                pool.ready_count(),
                if state.is_reorg_in_progress() {
                    " | reorg in progress"
                } else {
                    ""
                }
            );

            for peer in pool.peers() {
                debug!(
                    "   peer {} {} {:?}/{:?} version {:?} height {}",
                    peer.id,
                    peer.addr,
                    peer.direction,
                    peer.status,
                    peer.reported_version,
                    peer.best_height
                );
            }

            last_blocks = blocks;
            last_at = Instant::now();
        }
    })
}
