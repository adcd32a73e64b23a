use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::block::{Block, BlockHeader, RawTransaction};
use crate::types::Hash256;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvType {
    Tx,
    Block,
    FilteredBlock,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvItem {
    pub kind: InvType,
    pub hash: Hash256,
}

impl InvItem {
    pub fn block(hash: Hash256) -> Self {
        Self {
            kind: InvType::Block,
            hash,
        }
    }

    pub fn tx(hash: Hash256) -> Self {
        Self {
            kind: InvType::Tx,
            hash,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub protocol_version: u32,
    pub services: u64,
    pub best_height: u64,
    pub relay: bool,
    pub timestamp: i64,
    /// Random per-connection value; detects connecting to ourselves
    pub nonce: u64,
    pub user_agent: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GetHeadersMessage {
    pub locator: Vec<Hash256>,
    /// All-zero means "as many as allowed"
    pub stop_hash: Hash256,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum NetworkMessage {
    Version(VersionMessage),
    Verack,
    Ping { nonce: u64 },
    Pong { nonce: u64 },
    GetHeaders(GetHeadersMessage),
    Headers(Vec<BlockHeader>),
    GetData(Vec<InvItem>),
    Inv(Vec<InvItem>),
    NotFound(Vec<InvItem>),
    Block(Block),
    Tx(RawTransaction),
    GetAddr,
    Addr(Vec<SocketAddr>),
}

type Builder = fn(&[u8]) -> Result<NetworkMessage, bincode::Error>;

/// Command name -> payload builder. A command missing here is "unsupported".
const BUILDERS: &[(&str, Builder)] = &[
    ("version", |p| bincode::deserialize(p).map(NetworkMessage::Version)),
    ("verack", |_| Ok(NetworkMessage::Verack)),
    ("ping", |p| {
        bincode::deserialize(p).map(|nonce| NetworkMessage::Ping { nonce })
    }),
    ("pong", |p| {
        bincode::deserialize(p).map(|nonce| NetworkMessage::Pong { nonce })
    }),
    ("getheaders", |p| {
        bincode::deserialize(p).map(NetworkMessage::GetHeaders)
    }),
    ("headers", |p| bincode::deserialize(p).map(NetworkMessage::Headers)),
    ("getdata", |p| bincode::deserialize(p).map(NetworkMessage::GetData)),
    ("inv", |p| bincode::deserialize(p).map(NetworkMessage::Inv)),
    ("notfound", |p| bincode::deserialize(p).map(NetworkMessage::NotFound)),
    ("block", |p| bincode::deserialize(p).map(NetworkMessage::Block)),
    ("tx", |p| bincode::deserialize(p).map(NetworkMessage::Tx)),
    ("getaddr", |_| Ok(NetworkMessage::GetAddr)),
    ("addr", |p| bincode::deserialize(p).map(NetworkMessage::Addr)),
];

impl NetworkMessage {
    /// Wire command name (at most 12 ASCII bytes)
    pub fn command(&self) -> &'static str {
        match self {
            NetworkMessage::Version(_) => "version",
            NetworkMessage::Verack => "verack",
            NetworkMessage::Ping { .. } => "ping",
            NetworkMessage::Pong { .. } => "pong",
            NetworkMessage::GetHeaders(_) => "getheaders",
            NetworkMessage::Headers(_) => "headers",
            NetworkMessage::GetData(_) => "getdata",
            NetworkMessage::Inv(_) => "inv",
            NetworkMessage::NotFound(_) => "notfound",
            NetworkMessage::Block(_) => "block",
            NetworkMessage::Tx(_) => "tx",
            NetworkMessage::GetAddr => "getaddr",
            NetworkMessage::Addr(_) => "addr",
        }
    }

    /// Payload bytes; the command travels in the frame header.
    pub fn encode_payload(&self) -> Result<Vec<u8>, bincode::Error> {
        match self {
            NetworkMessage::Version(v) => bincode::serialize(v),
            NetworkMessage::Verack | NetworkMessage::GetAddr => Ok(Vec::new()),
            NetworkMessage::Ping { nonce } | NetworkMessage::Pong { nonce } => {
                bincode::serialize(nonce)
            }
            NetworkMessage::GetHeaders(g) => bincode::serialize(g),
            NetworkMessage::Headers(h) => bincode::serialize(h),
            NetworkMessage::GetData(items)
            | NetworkMessage::Inv(items)
            | NetworkMessage::NotFound(items) => bincode::serialize(items),
            NetworkMessage::Block(b) => bincode::serialize(b),
            NetworkMessage::Tx(tx) => bincode::serialize(tx),
            NetworkMessage::Addr(addrs) => bincode::serialize(addrs),
        }
    }

    /// Build a typed message from a command and its payload.
    /// `Ok(None)` when no builder is registered for the command.
    pub fn from_payload(command: &str, payload: &[u8]) -> Result<Option<Self>, bincode::Error> {
        match BUILDERS.iter().find(|(name, _)| *name == command) {
            Some((_, build)) => build(payload).map(Some),
            None => Ok(None),
        }
    }

    pub fn is_supported(command: &str) -> bool {
        BUILDERS.iter().any(|(name, _)| *name == command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_command_has_builder() {
        let samples = vec![
            NetworkMessage::Verack,
            NetworkMessage::Ping { nonce: 1 },
            NetworkMessage::Pong { nonce: 1 },
            NetworkMessage::GetAddr,
            NetworkMessage::Inv(vec![]),
            NetworkMessage::Headers(vec![]),
        ];
        for msg in samples {
            assert!(NetworkMessage::is_supported(msg.command()));
            assert!(msg.command().len() <= 12);
        }
    }

    #[test]
    fn test_unknown_command_is_unsupported() {
        assert!(NetworkMessage::from_payload("sendcmpct", &[]).unwrap().is_none());
    }

    #[test]
    fn test_malformed_payload_errors() {
        assert!(NetworkMessage::from_payload("ping", &[1, 2]).is_err());
    }
}
