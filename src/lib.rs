//! chainsyncd: a chain-following node.
//!
//! Connects to peers over the framed wire protocol, downloads and validates
//! the header chain, fetches blocks in order and hands each applied or
//! rolled-back block to the registered dependent services.

pub mod block;
pub mod chain;
pub mod chain_error;
pub mod config;
pub mod constants;
pub mod error;
pub mod network;
pub mod network_type;
pub mod node;
pub mod notifier;
pub mod service;
pub mod services;
pub mod shutdown;
pub mod storage;
pub mod types;

pub use chain_error::{ChainError, ChainResult};
pub use error::{AppError, StorageError};
pub use network_type::NetworkType;
pub use node::Node;
