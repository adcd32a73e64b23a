pub mod address_book;
pub mod connection_pool;
pub mod inventory;
pub mod message;
pub mod peer_connection;
pub mod wire;

pub use connection_pool::{ConnectionPool, PoolConfig, PoolError, PoolEvent};
pub use inventory::InventoryCache;
pub use message::{GetHeadersMessage, InvItem, InvType, NetworkMessage, VersionMessage};
pub use peer_connection::{ConnectionDirection, PeerConnection, PeerId, PeerStatus};
pub use wire::{Decoded, WireCodec, WireError};
