//! Peer Connection Management
//! One session with a remote node: handshake state machine, keep-alive, and
//! the transport task that moves frames between the socket and the pool.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::constants::network::{
    HANDSHAKE_TIMEOUT_SECS, MAX_MISSED_PONGS, PING_INTERVAL_SECS, PONG_TIMEOUT_SECS,
};
use crate::network::message::{NetworkMessage, VersionMessage};
use crate::network::wire::{Decoded, WireCodec, WireError};

pub type PeerId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionDirection {
    Inbound,
    Outbound,
}

/// Forward-only except `Ready -> Disconnected` (and any state on error).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PeerStatus {
    Disconnected,
    Connecting,
    Connected,
    Ready,
}

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Connected to ourselves")]
    SelfConnection,

    #[error("Handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Peer unresponsive after {0} missed pongs")]
    Unresponsive(u32),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Invalid status transition {from:?} -> {to:?}")]
    InvalidTransition { from: PeerStatus, to: PeerStatus },
}

/// What the transport must do after feeding the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAction {
    Send(NetworkMessage),
    /// Handshake complete
    Ready { version: u32, best_height: u64 },
    /// Post-handshake message for the pool
    Deliver(NetworkMessage),
}

/// State for tracking ping/pong health
#[derive(Debug)]
struct PingState {
    last_ping_sent: Option<Instant>,
    last_pong_received: Option<Instant>,
    pending_pings: Vec<(u64, Instant)>, // (nonce, sent_time)
    missed_pongs: u32,
}

impl PingState {
    fn new() -> Self {
        Self {
            last_ping_sent: None,
            last_pong_received: None,
            pending_pings: Vec::new(),
            missed_pongs: 0,
        }
    }

    fn record_ping_sent(&mut self, nonce: u64) {
        let now = Instant::now();
        self.last_ping_sent = Some(now);
        self.pending_pings.push((nonce, now));

        // Keep only last 5 pings
        if self.pending_pings.len() > 5 {
            self.pending_pings.remove(0);
        }
    }

    fn record_pong_received(&mut self, nonce: u64) -> bool {
        self.last_pong_received = Some(Instant::now());

        if let Some(pos) = self.pending_pings.iter().position(|(n, _)| *n == nonce) {
            self.pending_pings.remove(pos);
            self.missed_pongs = 0;
            true
        } else {
            false
        }
    }

    fn check_timeout(&mut self, max_missed: u32, timeout_duration: Duration) -> bool {
        let now = Instant::now();

        let mut expired_count = 0;
        self.pending_pings.retain(|(_, sent_time)| {
            if now.duration_since(*sent_time) > timeout_duration {
                expired_count += 1;
                false
            } else {
                true
            }
        });

        if expired_count > 0 {
            self.missed_pongs += expired_count;
            debug!(
                "⏰ {} ping(s) expired, total missed: {}/{}",
                expired_count, self.missed_pongs, max_missed
            );
        }

        self.missed_pongs >= max_missed
    }
}

/// Handshake and keep-alive state of one peer, independent of the socket.
#[derive(Debug)]
pub struct PeerConnection {
    addr: SocketAddr,
    direction: ConnectionDirection,
    status: PeerStatus,
    local_version: VersionMessage,
    version_sent: bool,
    reported_version: Option<u32>,
    reported_best_height: u64,
    ping_state: PingState,
}

impl PeerConnection {
    const PING_INTERVAL: Duration = Duration::from_secs(PING_INTERVAL_SECS);
    const TIMEOUT_CHECK_INTERVAL: Duration = Duration::from_secs(10);
    const PONG_TIMEOUT: Duration = Duration::from_secs(PONG_TIMEOUT_SECS);
    const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(HANDSHAKE_TIMEOUT_SECS);

    pub fn new(addr: SocketAddr, direction: ConnectionDirection, local_version: VersionMessage) -> Self {
        Self {
            addr,
            direction,
            status: PeerStatus::Disconnected,
            local_version,
            version_sent: false,
            reported_version: None,
            reported_best_height: 0,
            ping_state: PingState::new(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn direction(&self) -> ConnectionDirection {
        self.direction
    }

    pub fn status(&self) -> PeerStatus {
        self.status
    }

    pub fn reported_version(&self) -> Option<u32> {
        self.reported_version
    }

    pub fn reported_best_height(&self) -> u64 {
        self.reported_best_height
    }

    fn transition(&mut self, to: PeerStatus) -> Result<(), PeerError> {
        let allowed = to == PeerStatus::Disconnected || to > self.status;
        if !allowed {
            return Err(PeerError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Dial started
    pub fn begin_connect(&mut self) -> Result<(), PeerError> {
        self.transition(PeerStatus::Connecting)
    }

    /// Transport is up; announce our version.
    pub fn on_transport_connected(&mut self) -> Result<Vec<PeerAction>, PeerError> {
        self.transition(PeerStatus::Connected)?;
        Ok(self.version_action().into_iter().collect())
    }

    fn version_action(&mut self) -> Option<PeerAction> {
        if self.version_sent {
            return None;
        }
        self.version_sent = true;
        Some(PeerAction::Send(NetworkMessage::Version(
            self.local_version.clone(),
        )))
    }

    pub fn handle_message(&mut self, message: NetworkMessage) -> Result<Vec<PeerAction>, PeerError> {
        match message {
            NetworkMessage::Version(version) => {
                if version.nonce == self.local_version.nonce {
                    return Err(PeerError::SelfConnection);
                }
                debug!(
                    "🤝 {} reports version {} at height {} ({})",
                    self.addr, version.protocol_version, version.best_height, version.user_agent
                );
                self.reported_version = Some(version.protocol_version);
                self.reported_best_height = version.best_height;

                let mut actions = vec![PeerAction::Send(NetworkMessage::Verack)];
                actions.extend(self.version_action());
                Ok(actions)
            }
            NetworkMessage::Verack => {
                if self.status == PeerStatus::Ready {
                    return Ok(Vec::new());
                }
                self.transition(PeerStatus::Ready)?;
                Ok(vec![PeerAction::Ready {
                    version: self.reported_version.unwrap_or_default(),
                    best_height: self.reported_best_height,
                }])
            }
            NetworkMessage::Ping { nonce } => {
                Ok(vec![PeerAction::Send(NetworkMessage::Pong { nonce })])
            }
            NetworkMessage::Pong { nonce } => {
                if !self.ping_state.record_pong_received(nonce) {
                    warn!("⚠️ Received pong for unknown nonce {} from {}", nonce, self.addr);
                }
                Ok(Vec::new())
            }
            other if self.status == PeerStatus::Ready => Ok(vec![PeerAction::Deliver(other)]),
            other => {
                debug!(
                    "Ignoring {} from {} before handshake completed",
                    other.command(),
                    self.addr
                );
                Ok(Vec::new())
            }
        }
    }

    /// Keep-alive ping, only once the handshake is done.
    pub fn next_ping(&mut self) -> Option<NetworkMessage> {
        if self.status != PeerStatus::Ready {
            return None;
        }
        let nonce = rand::random::<u64>();
        self.ping_state.record_ping_sent(nonce);
        Some(NetworkMessage::Ping { nonce })
    }

    pub fn should_disconnect(&mut self) -> bool {
        self.ping_state
            .check_timeout(MAX_MISSED_PONGS, Self::PONG_TIMEOUT)
    }

    pub fn on_disconnect(&mut self) {
        self.status = PeerStatus::Disconnected;
    }
}

/// Raised by a transport task towards the pool.
#[derive(Debug)]
pub enum PeerEvent {
    Ready {
        peer: PeerId,
        version: u32,
        best_height: u64,
    },
    Message {
        peer: PeerId,
        message: NetworkMessage,
    },
    Disconnected {
        peer: PeerId,
        reason: String,
    },
}

/// Drive one connected socket until it closes, errors, or `cancel` fires.
/// Always ends with a `Disconnected` event.
pub async fn run_peer(
    peer: PeerId,
    mut connection: PeerConnection,
    stream: TcpStream,
    codec: WireCodec,
    mut outbound: mpsc::Receiver<NetworkMessage>,
    events: mpsc::Sender<PeerEvent>,
    cancel: CancellationToken,
) {
    let addr = connection.addr();
    let direction = connection.direction();
    let result = drive(
        peer,
        &mut connection,
        Framed::new(stream, codec),
        &mut outbound,
        &events,
        &cancel,
    )
    .await;

    connection.on_disconnect();
    let reason = match result {
        Ok(()) => "shutdown".to_string(),
        Err(e) => {
            info!("🔌 [{:?}] {} disconnected: {}", direction, addr, e);
            e.to_string()
        }
    };
    let _ = events.send(PeerEvent::Disconnected { peer, reason }).await;
}

async fn drive(
    peer: PeerId,
    connection: &mut PeerConnection,
    mut framed: Framed<TcpStream, WireCodec>,
    outbound: &mut mpsc::Receiver<NetworkMessage>,
    events: &mpsc::Sender<PeerEvent>,
    cancel: &CancellationToken,
) -> Result<(), PeerError> {
    let mut ping_interval = interval(PeerConnection::PING_INTERVAL);
    let mut timeout_check = interval(PeerConnection::TIMEOUT_CHECK_INTERVAL);
    let handshake_deadline = tokio::time::sleep(PeerConnection::HANDSHAKE_TIMEOUT);
    tokio::pin!(handshake_deadline);

    for action in connection.on_transport_connected()? {
        apply(peer, action, &mut framed, events).await?;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),

            frame = framed.next() => {
                match frame {
                    Some(Ok(Decoded::Message(message))) => {
                        for action in connection.handle_message(message)? {
                            apply(peer, action, &mut framed, events).await?;
                        }
                    }
                    Some(Ok(Decoded::Dropped { command, reason })) => {
                        debug!("🗑️ Dropped '{}' frame from {}: {:?}", command, connection.addr(), reason);
                    }
                    Some(Ok(Decoded::Unsupported { command })) => {
                        debug!("Unsupported command '{}' from {}", command, connection.addr());
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(PeerError::Closed),
                }
            }

            message = outbound.recv() => {
                match message {
                    Some(message) => framed.send(message).await?,
                    // Pool dropped our handle
                    None => return Ok(()),
                }
            }

            _ = ping_interval.tick() => {
                if let Some(ping) = connection.next_ping() {
                    framed.send(ping).await?;
                }
            }

            _ = timeout_check.tick() => {
                if connection.should_disconnect() {
                    return Err(PeerError::Unresponsive(MAX_MISSED_PONGS));
                }
            }

            _ = &mut handshake_deadline, if connection.status() != PeerStatus::Ready => {
                return Err(PeerError::HandshakeTimeout(PeerConnection::HANDSHAKE_TIMEOUT));
            }
        }
    }
}

async fn apply(
    peer: PeerId,
    action: PeerAction,
    framed: &mut Framed<TcpStream, WireCodec>,
    events: &mpsc::Sender<PeerEvent>,
) -> Result<(), PeerError> {
    match action {
        PeerAction::Send(message) => framed.send(message).await?,
        PeerAction::Ready {
            version,
            best_height,
        } => {
            let _ = events
                .send(PeerEvent::Ready {
                    peer,
                    version,
                    best_height,
                })
                .await;
        }
        PeerAction::Deliver(message) => {
            let _ = events.send(PeerEvent::Message { peer, message }).await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(nonce: u64, height: u64) -> VersionMessage {
        VersionMessage {
            protocol_version: 70015,
            services: 1,
            best_height: height,
            relay: true,
            timestamp: 0,
            nonce,
            user_agent: "/test/".to_string(),
        }
    }

    fn connected() -> PeerConnection {
        let mut conn = PeerConnection::new(
            "127.0.0.1:27533".parse().unwrap(),
            ConnectionDirection::Outbound,
            version(1, 10),
        );
        conn.begin_connect().unwrap();
        conn
    }

    #[test]
    fn test_connect_sends_version_once() {
        let mut conn = connected();
        let actions = conn.on_transport_connected().unwrap();
        assert_eq!(
            actions,
            vec![PeerAction::Send(NetworkMessage::Version(version(1, 10)))]
        );

        // Peer's version: verack only, ours already went out
        let actions = conn
            .handle_message(NetworkMessage::Version(version(2, 500)))
            .unwrap();
        assert_eq!(actions, vec![PeerAction::Send(NetworkMessage::Verack)]);
        assert_eq!(conn.reported_best_height(), 500);
        assert_eq!(conn.reported_version(), Some(70015));
    }

    #[test]
    fn test_inbound_version_before_ours() {
        let mut conn = PeerConnection::new(
            "127.0.0.1:1".parse().unwrap(),
            ConnectionDirection::Inbound,
            version(1, 10),
        );
        conn.status = PeerStatus::Connected;

        let actions = conn
            .handle_message(NetworkMessage::Version(version(2, 7)))
            .unwrap();
        assert_eq!(
            actions,
            vec![
                PeerAction::Send(NetworkMessage::Verack),
                PeerAction::Send(NetworkMessage::Version(version(1, 10))),
            ]
        );
    }

    #[test]
    fn test_verack_makes_ready_and_ping_is_answered() {
        let mut conn = connected();
        conn.on_transport_connected().unwrap();
        conn.handle_message(NetworkMessage::Version(version(2, 5)))
            .unwrap();

        let actions = conn.handle_message(NetworkMessage::Verack).unwrap();
        assert_eq!(
            actions,
            vec![PeerAction::Ready {
                version: 70015,
                best_height: 5
            }]
        );
        assert_eq!(conn.status(), PeerStatus::Ready);

        assert_eq!(
            conn.handle_message(NetworkMessage::Ping { nonce: 77 }).unwrap(),
            vec![PeerAction::Send(NetworkMessage::Pong { nonce: 77 })]
        );
        assert_eq!(
            conn.handle_message(NetworkMessage::GetAddr).unwrap(),
            vec![PeerAction::Deliver(NetworkMessage::GetAddr)]
        );
    }

    #[test]
    fn test_messages_before_ready_are_ignored() {
        let mut conn = connected();
        conn.on_transport_connected().unwrap();
        assert!(conn
            .handle_message(NetworkMessage::Inv(vec![]))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_self_connection_detected() {
        let mut conn = connected();
        conn.on_transport_connected().unwrap();
        assert!(matches!(
            conn.handle_message(NetworkMessage::Version(version(1, 0))),
            Err(PeerError::SelfConnection)
        ));
    }

    #[test]
    fn test_status_only_moves_forward() {
        let mut conn = connected();
        conn.on_transport_connected().unwrap();
        assert!(conn.begin_connect().is_err());
        conn.on_disconnect();
        assert_eq!(conn.status(), PeerStatus::Disconnected);
    }

    #[test]
    fn test_ping_state_tracks_pongs() {
        let mut conn = connected();
        assert!(conn.next_ping().is_none());

        conn.status = PeerStatus::Ready;
        let Some(NetworkMessage::Ping { nonce }) = conn.next_ping() else {
            panic!("expected ping");
        };
        assert_eq!(conn.ping_state.pending_pings.len(), 1);
        conn.handle_message(NetworkMessage::Pong { nonce }).unwrap();
        assert!(conn.ping_state.pending_pings.is_empty());
        assert!(!conn.should_disconnect());
    }
}
