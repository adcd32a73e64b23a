pub mod mempool;
pub mod tx_index;

pub use mempool::{Admission, MempoolService};
pub use tx_index::{TxIndexService, TxLocation};
