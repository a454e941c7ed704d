//! Consensus-wide constants shared across validation.

use crate::money::{Amount, CENT};

/// The maximum allowed size for a serialized block, in bytes (network rule).
pub const MAX_BLOCK_SIZE: u32 = 1_000_000;
/// Soft cap used when estimating block fill for fee scaling.
pub const MAX_BLOCK_SIZE_GEN: u32 = MAX_BLOCK_SIZE / 2;
/// The maximum allowed number of signature check operations in a block (network rule).
pub const MAX_BLOCK_SIGOPS: u32 = MAX_BLOCK_SIZE / 50;

/// Fee floor for transactions entering a block.
pub const MIN_TX_FEE: Amount = 10_000;
/// Fee floor for relayed transactions.
pub const MIN_RELAY_TX_FEE: Amount = 10_000;

/// How far into the future a block or coinbase timestamp may run, in seconds.
pub const FUTURE_DRIFT: i64 = 10 * 60;

pub fn future_drift(time: i64) -> i64 {
    time + FUTURE_DRIFT
}

/// Proof-of-work blocks above this height are rejected outright.
pub const LAST_POW_BLOCK: i32 = 10_000;

/// Historical checkpoint height; reward-exceeded DoS checks apply above it.
pub const HISTORIC_REWARD_CHECK_HEIGHT: i32 = 17_901;

/// Height from which a missing masternode payment rejects the block.
pub const ENFORCE_MN_PAYMENT_HEIGHT: i32 = 1_100_000;
/// Height from which a missing developer payment rejects the block.
pub const ENFORCE_DEV_PAYMENT_HEIGHT: i32 = 1_200_000;
/// Only blocks younger than this (seconds) get the payee cross-check.
pub const MNPAYEE_MAX_BLOCK_AGE: i64 = 30 * 60;

/// Every-block retarget window, in seconds.
pub const TARGET_TIMESPAN: i64 = 20 * 60;
/// Target block spacing, in seconds.
pub const TARGET_SPACING: i64 = 79;

/// Minimum age before an output gains stake weight, in seconds.
pub const STAKE_MIN_AGE: i64 = 5 * 60 * 60;
/// Age at which stake weight stops accruing, in seconds.
pub const STAKE_MAX_AGE: i64 = 5 * 60 * 60;
/// Time to elapse before a new stake modifier is computed, in seconds.
pub const MODIFIER_INTERVAL: i64 = 10 * 60;
pub const MODIFIER_INTERVAL_RATIO: i64 = 3;
/// Coinstake timestamps must have these low bits clear under protocol v2.
pub const STAKE_TIMESTAMP_MASK: u32 = 15;

/// Orphan transaction pool bound.
pub const MAX_ORPHAN_TRANSACTIONS: usize = (MAX_BLOCK_SIZE / 100) as usize;
/// A single orphan transaction may not exceed this many serialized bytes.
pub const MAX_ORPHAN_TX_SIZE: usize = 5_000;

/// Cap on inv/getdata vector length per message.
pub const MAX_INV_SZ: usize = 50_000;
/// Cap on addr vector length per message.
pub const MAX_ADDR_SZ: usize = 1_000;

/// Current network protocol version for P2P messages.
pub const PROTOCOL_VERSION: i32 = 60_028;
/// Minimum peer version accepted before spork #13 activates.
pub const MIN_PEER_PROTO_VERSION: i32 = 60_022;
/// Minimum peer version once spork #13 (protocol v4) is active.
pub const MIN_PEER_PROTO_VERSION_AFTER_V4: i32 = 60_028;
/// Peers below this version have no pong support.
pub const BIP31_VERSION: i32 = 60_001;

/// Default thousand-bytes-per-minute budget for free transaction relay.
pub const DEFAULT_LIMIT_FREE_RELAY: u64 = 15;

/// Outputs below one cent pull the dust fee floor.
pub const DUST_SOFT_LIMIT: Amount = CENT;

/// Block timestamps roughly two hours behind the tip mark initial download.
pub const DEFAULT_MAX_TIP_AGE: i64 = 60 * 60 * 2;
