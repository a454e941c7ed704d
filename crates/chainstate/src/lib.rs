//! Chain-state core: block tree, transaction index, and the
//! connect/disconnect/reorganize machinery.

pub mod blocktree;
pub mod flatfiles;
pub mod hooks;
pub mod state;
pub mod txindex;
pub mod validation;

pub use blocktree::{BlockIndexNode, BlockTree};
pub use flatfiles::{BlockFileStore, BlockLocation, FlatFileError};
pub use hooks::{ChainListener, MasternodePayments, TxSource};
pub use state::{
    ChainContext, ChainEvents, ChainState, ChainStateError, FetchInputsError, FetchedInput,
    PostponedBlocks,
};
pub use txindex::{DiskTxPos, TxIndexEntry};
pub use validation::{
    check_block, check_transaction, min_fee, CheckBlockFlags, FeeMode, ValidationError,
};
