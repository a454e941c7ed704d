//! Consensus constants, chain parameters, reward schedules, and sporks.

pub mod constants;
pub mod money;
pub mod params;
pub mod rewards;
pub mod sporks;

pub use params::{chain_params, hash256_from_hex, ChainParams, Checkpoint, Network};
pub use rewards::{
    developer_payment, masternode_payment, proof_of_stake_reward, proof_of_work_reward,
};
pub use sporks::{SporkId, SporkSet};

/// 256-bit hash, little-endian byte order on the wire, big-endian hex display.
pub type Hash256 = [u8; 32];

pub fn hash256_to_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
