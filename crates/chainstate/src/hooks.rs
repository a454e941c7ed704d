//! Seams to the collaborators living outside the chain-state core.

use neutrond_consensus::money::Amount;
use neutrond_consensus::Hash256;
use neutrond_primitives::block::Block;
use neutrond_primitives::transaction::Transaction;

/// Wallet-facing notifications. The wallet itself is external; the core
/// only reports what happened to the chain.
pub trait ChainListener: Send + Sync {
    /// A transaction entered (`connected == true`) or left the main chain.
    fn sync_transaction(&self, tx: &Transaction, block: Option<&Block>, connected: bool);

    /// The best chain advanced to `hash` at `height`.
    fn best_chain_changed(&self, hash: &Hash256, height: i32);
}

/// View of the masternode payments manager maintained outside the core.
pub trait MasternodePayments: Send + Sync {
    fn is_synced(&self) -> bool;

    /// Expected payee script for the block at `height`, when known.
    fn block_payee(&self, height: i32) -> Option<Vec<u8>>;

    /// Ask the manager to (re)compute the winner for `height`.
    fn process_block(&self, height: i32, reorganizing: bool);

    /// Record the winner observed in a block accepted during initial
    /// download.
    fn add_past_winner(&self, coinstake: &Transaction, required: Amount, height: i32);
}

/// Lookup for unconfirmed parents when fetching inputs outside a block.
pub trait TxSource {
    fn lookup(&self, txid: &Hash256) -> Option<Transaction>;
}
