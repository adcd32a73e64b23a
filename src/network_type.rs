use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Mainnet,
    Testnet,
    Regtest,
}

impl NetworkType {
    pub fn magic_bytes(&self) -> [u8; 4] {
        match self {
            NetworkType::Mainnet => [0xc5, 0x1d, 0x0a, 0xe1],
            NetworkType::Testnet => [0xc5, 0x1d, 0x7e, 0x57],
            NetworkType::Regtest => [0xc5, 0x1d, 0x9e, 0x60],
        }
    }

    pub fn default_p2p_port(&self) -> u16 {
        match self {
            NetworkType::Mainnet => 27333,
            NetworkType::Testnet => 27433,
            NetworkType::Regtest => 27533,
        }
    }

    /// DNS seeds queried when the address book runs dry.
    pub fn dns_seeds(&self) -> &'static [&'static str] {
        match self {
            NetworkType::Mainnet => &["seed1.chainsync.network", "seed2.chainsync.network"],
            NetworkType::Testnet => &["testnet-seed.chainsync.network"],
            NetworkType::Regtest => &[],
        }
    }

    /// Compact difficulty of the genesis header and the easiest allowed target.
    pub fn genesis_bits(&self) -> u32 {
        match self {
            NetworkType::Mainnet | NetworkType::Testnet => 0x1d00ffff,
            NetworkType::Regtest => 0x207fffff,
        }
    }

    pub fn genesis_timestamp(&self) -> u32 {
        match self {
            NetworkType::Mainnet => 1735689600, // 2025-01-01 00:00:00 UTC
            NetworkType::Testnet | NetworkType::Regtest => 1704067200, // 2024-01-01 00:00:00 UTC
        }
    }

    pub fn genesis_message(&self) -> &'static str {
        match self {
            NetworkType::Mainnet => "chainsync mainnet genesis",
            NetworkType::Testnet => "chainsync testnet genesis",
            NetworkType::Regtest => "chainsync regtest genesis",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkType::Mainnet => "mainnet",
            NetworkType::Testnet => "testnet",
            NetworkType::Regtest => "regtest",
        }
    }
}

impl std::str::FromStr for NetworkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "main" => Ok(NetworkType::Mainnet),
            "testnet" | "test" => Ok(NetworkType::Testnet),
            "regtest" => Ok(NetworkType::Regtest),
            other => Err(format!("unknown network '{}'", other)),
        }
    }
}

impl std::fmt::Display for NetworkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkType::Mainnet => write!(f, "Mainnet"),
            NetworkType::Testnet => write!(f, "Testnet"),
            NetworkType::Regtest => write!(f, "Regtest"),
        }
    }
}
