//! Global constants for the sync daemon
//!
//! Centralizes protocol limits and sync tuning defaults. The sync values are
//! only defaults; `[sync]` in the config file overrides them.

/// Chain protocol constants
pub mod chain {
    /// Maximum headers a peer returns per `headers` reply.
    /// A shorter reply means the peer has nothing more for us.
    pub const MAX_HEADERS_PER_BATCH: usize = 2000;

    /// How far the header tip is rewound on startup and on a header-level fork.
    /// Equal to one full header batch, so a single `getheaders` round trip
    /// re-validates the whole rewound range.
    pub const DEFAULT_CHECKPOINT_DISTANCE: u64 = 2000;

    /// Capacity of the recent hash ring (one day of 10 minute blocks).
    /// Forks deeper than this are not resolved automatically.
    /// Must not exceed the checkpoint distance.
    pub const DEFAULT_REORG_WINDOW: usize = 144;

    /// Number of locator hashes sent with `getheaders`.
    pub const LOCATOR_DEPTH: usize = 32;

    /// Stream names for persisted tips
    pub const HEADER_STREAM: &str = "header";
    pub const BLOCK_STREAM: &str = "block";
}

/// Wire protocol constants
pub mod protocol {
    pub const PROTOCOL_VERSION: u32 = 70015;

    /// NODE_NETWORK service bit
    pub const SERVICES: u64 = 1;

    /// Frame header: magic(4) | command(12) | length(4) | checksum(4)
    pub const FRAME_HEADER_SIZE: usize = 24;
    pub const COMMAND_SIZE: usize = 12;

    /// Largest payload accepted in a single frame (32 MB)
    pub const MAX_PAYLOAD_SIZE: usize = 32 * 1024 * 1024;

    /// Buffered-but-unparsed bytes above this close the connection
    pub const MAX_BUFFERED_BYTES: usize = 2 * MAX_PAYLOAD_SIZE;

    /// Maximum entries in one inv/getdata/notfound/addr message
    pub const MAX_INVENTORY_ENTRIES: usize = 50_000;
    pub const MAX_ADDR_ENTRIES: usize = 1000;
}

/// Network constants
pub mod network {
    /// Interval between ping messages (30 seconds)
    pub const PING_INTERVAL_SECS: u64 = 30;

    /// Timeout for waiting for pong response (90 seconds)
    pub const PONG_TIMEOUT_SECS: u64 = 90;

    /// Maximum number of missed pongs before disconnection
    pub const MAX_MISSED_PONGS: u32 = 3;

    /// Time allowed for the TCP connect plus version/verack exchange
    pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

    pub const DEFAULT_MAX_PEERS: usize = 8;

    /// Cooldown before a failed or dropped address is dialed again
    pub const DEFAULT_RETRY_COOLDOWN_SECS: u64 = 30;

    /// Upper bound for the per-address backoff
    pub const MAX_RETRY_COOLDOWN_SECS: u64 = 600;

    /// Global reconnect timer once no peer is connected
    pub const DEFAULT_RECONNECT_INTERVAL_SECS: u64 = 10;

    /// How often the pool tries to fill empty connection slots
    pub const FILL_INTERVAL_MILLIS: u64 = 1000;

    /// Recently seen object hashes kept for inventory de-duplication
    pub const INVENTORY_CACHE_SIZE: usize = 5000;

    /// Per-peer outbound queue depth
    pub const PEER_OUTBOUND_QUEUE: usize = 1024;
}

/// Block sync constants
pub mod sync {
    /// Blocks requested per getdata window
    pub const DEFAULT_BLOCK_READ_AHEAD: u64 = 16;

    pub const DEFAULT_BLOCK_REQUEST_TIMEOUT_SECS: u64 = 5;

    pub const DEFAULT_HEADER_REQUEST_TIMEOUT_SECS: u64 = 30;

    pub const DEFAULT_PROGRESS_INTERVAL_SECS: u64 = 10;

    /// Control loop tick used for request timeouts
    pub const TICK_INTERVAL_MILLIS: u64 = 500;

    /// Notification channel capacity
    pub const NOTIFICATION_CHANNEL_SIZE: usize = 1024;
}
