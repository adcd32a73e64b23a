pub mod genesis;
pub mod types;
pub mod work;

pub use genesis::GenesisBlock;
pub use types::{
    is_proof_of_stake, merkle_root, Block, BlockHeader, RawTransaction, StakeProof, StoredBlock,
    StoredHeader,
};
