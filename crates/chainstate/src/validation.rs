//! Stateless block and transaction checks.

use std::collections::HashSet;

use neutrond_consensus::constants::{
    future_drift, MAX_BLOCK_SIGOPS, MAX_BLOCK_SIZE, MAX_BLOCK_SIZE_GEN, MIN_RELAY_TX_FEE,
    MIN_TX_FEE,
};
use neutrond_consensus::money::{money_range, Amount, CENT, MAX_MONEY};
use neutrond_primitives::block::{merkle_root, Block};
use neutrond_primitives::transaction::Transaction;
use neutrond_script::standard::{sig_op_count, solve, ScriptKind};
use neutrond_script::verify_hash_signature;

/// A failed consensus check, carrying the misbehavior score the peer
/// layer should apply to the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub reason: &'static str,
    pub dos: u32,
}

impl ValidationError {
    pub fn new(reason: &'static str, dos: u32) -> Self {
        Self { reason, dos }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl std::error::Error for ValidationError {}

fn dos(reason: &'static str, score: u32) -> ValidationError {
    ValidationError::new(reason, score)
}

/// Context-free transaction invariants.
pub fn check_transaction(tx: &Transaction, testnet: bool) -> Result<(), ValidationError> {
    if tx.vin.is_empty() {
        return Err(dos("vin empty", 10));
    }
    if tx.vout.is_empty() {
        return Err(dos("vout empty", 10));
    }
    if tx.serialized_size() > MAX_BLOCK_SIZE as usize {
        return Err(dos("transaction over size limit", 100));
    }

    let mut value_out: Amount = 0;
    for output in &tx.vout {
        if output.is_empty() && !tx.is_coinbase() && !tx.is_coinstake() {
            return Err(dos("empty txout in user transaction", 100));
        }
        if output.value < 0 {
            return Err(dos("txout value negative", 100));
        }
        if output.value > MAX_MONEY {
            return Err(dos("txout value too high", 100));
        }
        value_out += output.value;
        if !money_range(value_out) {
            return Err(dos("txout total out of range", 100));
        }
    }

    let mut seen = HashSet::with_capacity(tx.vin.len());
    for input in &tx.vin {
        if !seen.insert(input.prevout.clone()) {
            return Err(dos("duplicate input", 0));
        }
    }

    if tx.is_coinbase() {
        let script_len = tx.vin[0].script_sig.len();
        if !testnet && !(2..=100).contains(&script_len) {
            return Err(dos("coinbase scriptSig size out of range", 100));
        }
    } else if tx.vin.iter().any(|input| input.prevout.is_null()) {
        return Err(dos("null prevout in non-coinbase", 10));
    }

    Ok(())
}

#[derive(Clone, Copy, Debug)]
pub struct CheckBlockFlags {
    pub check_merkle: bool,
    pub check_sig: bool,
}

impl Default for CheckBlockFlags {
    fn default() -> Self {
        Self {
            check_merkle: true,
            check_sig: true,
        }
    }
}

/// Context-free block checks. Proof validity (work or stake kernel) is
/// checked contextually at acceptance, where the expected target is
/// known.
pub fn check_block(
    block: &Block,
    adjusted_now: i64,
    testnet: bool,
    flags: CheckBlockFlags,
) -> Result<(), ValidationError> {
    if block.vtx.is_empty()
        || block.vtx.len() > MAX_BLOCK_SIZE as usize
        || block.serialized_size() > MAX_BLOCK_SIZE as usize
    {
        return Err(dos("block size limits failed", 100));
    }

    if (block.header.time as i64) > future_drift(adjusted_now) {
        return Err(dos("block timestamp too far in the future", 0));
    }

    if !block.vtx[0].is_coinbase() {
        return Err(dos("first tx is not coinbase", 100));
    }
    for tx in &block.vtx[1..] {
        if tx.is_coinbase() {
            return Err(dos("more than one coinbase", 100));
        }
    }

    if (block.header.time as i64) > future_drift(block.vtx[0].time as i64) {
        return Err(dos("coinbase timestamp too early", 50));
    }

    if block.is_proof_of_stake() {
        if block.vtx[0].vout.len() != 1 || !block.vtx[0].vout[0].is_empty() {
            return Err(dos("coinbase output not empty in proof-of-stake block", 100));
        }
        for tx in &block.vtx[2..] {
            if tx.is_coinstake() {
                return Err(dos("more than one coinstake", 100));
            }
        }
        if flags.check_sig && !check_block_signature(block) {
            return Err(dos("bad proof-of-stake block signature", 100));
        }
    } else if block.vtx.iter().any(|tx| tx.is_coinstake()) {
        // A coinstake anywhere but index 1 makes the block neither a
        // valid PoW nor a valid PoS block.
        return Err(dos("coinstake in unexpected position", 100));
    }

    let mut txids = Vec::with_capacity(block.vtx.len());
    for tx in &block.vtx {
        check_transaction(tx, testnet)?;
        if (tx.time as i64) > block.header.time as i64 {
            return Err(dos("block timestamp earlier than transaction", 50));
        }
        txids.push(tx.txid());
    }

    let unique: HashSet<&[u8; 32]> = txids.iter().collect();
    if unique.len() != txids.len() {
        return Err(dos("duplicate transaction", 100));
    }

    let sigops: u32 = block
        .vtx
        .iter()
        .map(|tx| {
            let inputs: u32 = tx
                .vin
                .iter()
                .map(|input| sig_op_count(&input.script_sig, false))
                .sum();
            let outputs: u32 = tx
                .vout
                .iter()
                .map(|output| sig_op_count(&output.script_pubkey, false))
                .sum();
            inputs + outputs
        })
        .sum();
    if sigops > MAX_BLOCK_SIGOPS {
        return Err(dos("out-of-bounds sigop count", 100));
    }

    if flags.check_merkle {
        let (root, mutated) = merkle_root(&txids);
        if mutated {
            return Err(dos("duplicate transaction", 100));
        }
        if root != block.header.merkle_root {
            return Err(dos("merkle root mismatch", 100));
        }
    }

    Ok(())
}

/// Proof-of-stake blocks are signed by the staker: the signature over the
/// block hash must verify against the pubkey paid by the coinstake's
/// first real output. Proof-of-work blocks carry no signature.
pub fn check_block_signature(block: &Block) -> bool {
    if block.is_proof_of_work() {
        return block.block_sig.is_empty();
    }
    if block.block_sig.is_empty() {
        return false;
    }

    let (kind, solutions) = solve(&block.vtx[1].vout[1].script_pubkey);
    if kind != ScriptKind::PubKey {
        return false;
    }
    let Some(pubkey) = solutions.first() else {
        return false;
    };
    verify_hash_signature(pubkey, &block.block_sig, &block.hash())
}

/// Whether a transaction is final at the given height and time.
pub fn is_final_tx(tx: &Transaction, height: i32, block_time: i64) -> bool {
    const LOCKTIME_THRESHOLD: i64 = 500_000_000;
    if tx.lock_time == 0 {
        return true;
    }
    let lock_time = tx.lock_time as i64;
    let compare = if lock_time < LOCKTIME_THRESHOLD {
        height as i64
    } else {
        block_time
    };
    if lock_time < compare {
        return true;
    }
    tx.vin.iter().all(|input| input.is_final())
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FeeMode {
    Block,
    Relay,
}

/// Minimum fee for a transaction of `bytes` serialized bytes entering a
/// block currently `block_size` bytes full.
pub fn min_fee(tx: &Transaction, block_size: u32, mode: FeeMode, bytes: usize) -> Amount {
    let base_fee = match mode {
        FeeMode::Relay => MIN_RELAY_TX_FEE,
        FeeMode::Block => MIN_TX_FEE,
    };
    let new_block_size = block_size as u64 + bytes as u64;
    let mut fee = (1 + bytes as Amount / 1_000) * base_fee;

    // Outputs below one cent pull the dust floor.
    if fee < base_fee && tx.vout.iter().any(|output| output.value < CENT) {
        fee = base_fee;
    }

    // Raise the price as the block approaches full.
    if block_size != 1 && new_block_size >= (MAX_BLOCK_SIZE_GEN / 2) as u64 {
        if new_block_size >= MAX_BLOCK_SIZE_GEN as u64 {
            return MAX_MONEY;
        }
        fee *= MAX_BLOCK_SIZE_GEN as Amount / (MAX_BLOCK_SIZE_GEN as u64 - new_block_size) as Amount;
    }

    if !money_range(fee) {
        fee = MAX_MONEY;
    }
    fee
}

/// The coinbase scriptSig must begin with the block height as a minimal
/// script number push.
pub fn coinbase_height_prefix(height: i32) -> Vec<u8> {
    script_push_int(height as i64)
}

pub fn coinbase_commits_to_height(tx: &Transaction, height: i32) -> bool {
    if tx.vin.is_empty() {
        return false;
    }
    let expected = coinbase_height_prefix(height);
    tx.vin[0].script_sig.starts_with(&expected)
}

fn script_push_int(value: i64) -> Vec<u8> {
    const OP_0: u8 = 0x00;
    const OP_1NEGATE: u8 = 0x4f;
    const OP_1: u8 = 0x51;
    if value == 0 {
        return vec![OP_0];
    }
    if value == -1 {
        return vec![OP_1NEGATE];
    }
    if (1..=16).contains(&value) {
        return vec![OP_1 + (value as u8 - 1)];
    }

    let mut abs = value.unsigned_abs();
    let mut data = Vec::new();
    while abs > 0 {
        data.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    if let Some(last) = data.last_mut() {
        if (*last & 0x80) != 0 {
            data.push(if value < 0 { 0x80 } else { 0 });
        } else if value < 0 {
            *last |= 0x80;
        }
    }
    let mut script = Vec::with_capacity(data.len() + 1);
    script.push(data.len() as u8);
    script.extend_from_slice(&data);
    script
}

#[cfg(test)]
mod tests {
    use super::*;
    use neutrond_primitives::block::BlockHeader;
    use neutrond_primitives::outpoint::OutPoint;
    use neutrond_primitives::transaction::{TxIn, TxOut};

    fn coinbase(height: i32, time: u32) -> Transaction {
        let mut script_sig = coinbase_height_prefix(height);
        script_sig.push(0x00);
        Transaction {
            version: 1,
            time,
            vin: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig,
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value: 0,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    fn spend(time: u32) -> Transaction {
        Transaction {
            version: 1,
            time,
            vin: vec![TxIn {
                prevout: OutPoint::new([4u8; 32], 0),
                script_sig: vec![0x01, 0x02],
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value: 5 * CENT,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    fn block_with(vtx: Vec<Transaction>, time: u32) -> Block {
        let txids: Vec<_> = vtx.iter().map(|tx| tx.txid()).collect();
        let (root, _) = merkle_root(&txids);
        Block {
            header: BlockHeader {
                version: 7,
                prev_block: [1u8; 32],
                merkle_root: root,
                time,
                bits: 0x1e0f_ffff,
                nonce: 0,
            },
            vtx,
            block_sig: Vec::new(),
        }
    }

    #[test]
    fn transaction_shape_rules() {
        let tx = spend(100);
        check_transaction(&tx, false).expect("valid");

        let mut empty_vin = tx.clone();
        empty_vin.vin.clear();
        assert_eq!(check_transaction(&empty_vin, false).unwrap_err().dos, 10);

        let mut negative = tx.clone();
        negative.vout[0].value = -1;
        assert_eq!(check_transaction(&negative, false).unwrap_err().dos, 100);

        let mut too_much = tx.clone();
        too_much.vout[0].value = MAX_MONEY + 1;
        assert_eq!(check_transaction(&too_much, false).unwrap_err().dos, 100);

        let mut duplicate = tx.clone();
        duplicate.vin.push(duplicate.vin[0].clone());
        assert_eq!(check_transaction(&duplicate, false).unwrap_err().dos, 0);

        let mut null_prev = tx.clone();
        null_prev.vin[0].prevout = OutPoint::null();
        null_prev.vin.push(spend(100).vin[0].clone());
        assert!(check_transaction(&null_prev, false).is_err());
    }

    #[test]
    fn coinbase_script_size_is_mainnet_only() {
        let mut tx = coinbase(200_000, 100);
        tx.vin[0].script_sig = vec![0x01];
        assert!(check_transaction(&tx, false).is_err());
        assert!(check_transaction(&tx, true).is_ok());
    }

    #[test]
    fn block_requires_leading_coinbase() {
        let block = block_with(vec![spend(100)], 100);
        let err = check_block(&block, 1_000, false, CheckBlockFlags::default()).unwrap_err();
        assert_eq!(err.reason, "first tx is not coinbase");
    }

    #[test]
    fn block_rejects_future_timestamp() {
        let block = block_with(vec![coinbase(1, 5_000)], 5_000);
        let err = check_block(&block, 1_000, false, CheckBlockFlags::default()).unwrap_err();
        assert_eq!(err.reason, "block timestamp too far in the future");
        assert_eq!(err.dos, 0);
    }

    #[test]
    fn block_rejects_tx_newer_than_block() {
        let block = block_with(vec![coinbase(1, 100), spend(9_000)], 200);
        let err = check_block(&block, 100_000, false, CheckBlockFlags::default()).unwrap_err();
        assert_eq!(err.reason, "block timestamp earlier than transaction");
    }

    #[test]
    fn block_rejects_merkle_mismatch() {
        let mut block = block_with(vec![coinbase(1, 100), spend(100)], 200);
        block.header.merkle_root = [0xeeu8; 32];
        let err = check_block(&block, 100_000, false, CheckBlockFlags::default()).unwrap_err();
        assert_eq!(err.reason, "merkle root mismatch");
    }

    #[test]
    fn block_rejects_duplicate_txids() {
        let block = block_with(vec![coinbase(1, 100), spend(100), spend(100)], 200);
        let err = check_block(&block, 100_000, false, CheckBlockFlags::default()).unwrap_err();
        assert_eq!(err.reason, "duplicate transaction");
    }

    #[test]
    fn pos_block_requires_empty_coinbase_output() {
        let mut cb = coinbase(5, 100);
        cb.vout[0] = TxOut {
            value: 1,
            script_pubkey: vec![0x51],
        };
        let coinstake = Transaction {
            version: 1,
            time: 100,
            vin: vec![TxIn {
                prevout: OutPoint::new([6u8; 32], 0),
                script_sig: Vec::new(),
                sequence: u32::MAX,
            }],
            vout: vec![
                TxOut {
                    value: 0,
                    script_pubkey: Vec::new(),
                },
                TxOut {
                    value: 100,
                    script_pubkey: vec![0xac],
                },
            ],
            lock_time: 0,
        };
        let block = block_with(vec![cb, coinstake], 200);
        let err = check_block(&block, 100_000, false, CheckBlockFlags::default()).unwrap_err();
        assert_eq!(err.reason, "coinbase output not empty in proof-of-stake block");
    }

    #[test]
    fn finality_rules() {
        let mut tx = spend(100);
        assert!(is_final_tx(&tx, 10, 1_000));
        tx.lock_time = 20;
        tx.vin[0].sequence = 0;
        assert!(!is_final_tx(&tx, 10, 1_000));
        assert!(is_final_tx(&tx, 21, 1_000));
        tx.vin[0].sequence = u32::MAX;
        assert!(is_final_tx(&tx, 10, 1_000));
    }

    #[test]
    fn min_fee_scales_with_size() {
        let tx = spend(100);
        let small = min_fee(&tx, 1_000, FeeMode::Relay, 300);
        let large = min_fee(&tx, 1_000, FeeMode::Relay, 2_500);
        assert_eq!(small, MIN_RELAY_TX_FEE);
        assert_eq!(large, 3 * MIN_RELAY_TX_FEE);
    }

    #[test]
    fn min_fee_dust_floor() {
        let mut tx = spend(100);
        tx.vout[0].value = CENT - 1;
        assert_eq!(min_fee(&tx, 1_000, FeeMode::Relay, 300), MIN_RELAY_TX_FEE);
    }

    #[test]
    fn min_fee_rejects_full_block() {
        let tx = spend(100);
        assert_eq!(
            min_fee(&tx, MAX_BLOCK_SIZE_GEN - 100, FeeMode::Block, 300),
            MAX_MONEY
        );
    }

    #[test]
    fn coinbase_height_prefix_matches() {
        let tx = coinbase(120, 100);
        assert!(coinbase_commits_to_height(&tx, 120));
        assert!(!coinbase_commits_to_height(&tx, 121));
        let small = coinbase(3, 100);
        assert!(coinbase_commits_to_height(&small, 3));
    }
}
