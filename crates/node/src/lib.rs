//! Node-side chain-state plumbing: mempool admission, block ingress, and
//! the wire protocol surface the core consumes.

pub mod config;
pub mod mempool;
pub mod process;
pub mod protocol;

pub use config::NodeOptions;
pub use mempool::{Mempool, MempoolError, MempoolErrorKind};
pub use process::{load_external_block_file, NodeState, Peer, ProcessError, ShutdownFlag};
pub use protocol::{Inv, InvKind, MessageHeader};
