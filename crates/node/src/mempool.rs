//! Mempool admission and orphan transaction management.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use neutrond_chainstate::state::{ChainState, FetchInputsError, FetchedInput};
use neutrond_chainstate::txindex::DiskTxPos;
use neutrond_chainstate::validation::{check_transaction, min_fee, FeeMode};
use neutrond_chainstate::TxSource;
use neutrond_consensus::constants::{
    DEFAULT_LIMIT_FREE_RELAY, DUST_SOFT_LIMIT, MAX_ORPHAN_TRANSACTIONS, MAX_ORPHAN_TX_SIZE,
    MIN_RELAY_TX_FEE, MIN_TX_FEE,
};
use neutrond_consensus::money::{money_range, Amount};
use neutrond_consensus::Hash256;
use neutrond_primitives::encoding::encode;
use neutrond_primitives::outpoint::OutPoint;
use neutrond_primitives::transaction::{Transaction, CURRENT_TX_VERSION};
use neutrond_script::interpreter::{
    eval_script, verify_signature, STANDARD_SCRIPT_VERIFY_FLAGS,
};
use neutrond_script::standard::{
    has_canonical_pushes, is_push_only, script_sig_args_expected, solve, ScriptKind,
};
use neutrond_storage::{KeyValueStore, WriteBatch};

const MAX_STANDARD_SCRIPTSIG_SIZE: usize = 500;
/// Transactions below this serialized size qualify for free relay.
const FREE_TX_SIZE_LIMIT: usize = 1_000;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MempoolErrorKind {
    InvalidTransaction,
    AlreadyHave,
    Conflict,
    NonStandard,
    InsufficientFee,
    RateLimited,
    MissingInputs,
    ImmatureSpend,
    Internal,
}

#[derive(Clone, Debug)]
pub struct MempoolError {
    pub kind: MempoolErrorKind,
    pub message: String,
    /// Misbehavior score for the relaying peer.
    pub dos: u32,
    /// Parents we could not find, when `kind` is `MissingInputs`.
    pub missing_parents: Vec<Hash256>,
}

impl MempoolError {
    pub fn new(kind: MempoolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            dos: 0,
            missing_parents: Vec::new(),
        }
    }

    pub fn with_dos(kind: MempoolErrorKind, message: impl Into<String>, dos: u32) -> Self {
        Self {
            kind,
            message: message.into(),
            dos,
            missing_parents: Vec::new(),
        }
    }

    fn missing(parents: Vec<Hash256>) -> Self {
        Self {
            kind: MempoolErrorKind::MissingInputs,
            message: "inputs not found".to_string(),
            dos: 0,
            missing_parents: parents,
        }
    }
}

impl std::fmt::Display for MempoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for MempoolError {}

/// Exponentially decaying byte counter for free transaction relay, with
/// a ten-minute time constant.
#[derive(Debug, Default)]
struct FreeRelayLimiter {
    count: f64,
    last_time: u64,
}

impl FreeRelayLimiter {
    fn admit(&mut self, limit_kb_per_minute: u64, size: usize, now: u64) -> bool {
        let threshold = (limit_kb_per_minute as f64) * 10_000.0;
        let delta = now.saturating_sub(self.last_time);
        self.count *= (1.0_f64 - 1.0_f64 / 600.0_f64).powf(delta as f64);
        self.last_time = now;

        if self.count > threshold {
            return false;
        }
        neutrond_log::log_debug!(
            "free relay rate limit {:.0} => {:.0}",
            self.count,
            self.count + size as f64,
        );
        self.count += size as f64;
        true
    }
}

pub struct Mempool {
    entries: HashMap<Hash256, Transaction>,
    /// Spent outpoint -> spending txid, for conflict detection.
    spent: HashMap<OutPoint, Hash256>,
    orphans: BTreeMap<Hash256, Transaction>,
    orphans_by_prev: HashMap<Hash256, BTreeSet<Hash256>>,
    limiter: FreeRelayLimiter,
    limit_free_relay: u64,
    require_standard: bool,
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new(DEFAULT_LIMIT_FREE_RELAY, true)
    }
}

impl TxSource for Mempool {
    fn lookup(&self, txid: &Hash256) -> Option<Transaction> {
        self.entries.get(txid).cloned()
    }
}

impl Mempool {
    pub fn new(limit_free_relay: u64, require_standard: bool) -> Self {
        Self {
            entries: HashMap::new(),
            spent: HashMap::new(),
            orphans: BTreeMap::new(),
            orphans_by_prev: HashMap::new(),
            limiter: FreeRelayLimiter::default(),
            limit_free_relay,
            require_standard,
        }
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn exists(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<&Transaction> {
        self.entries.get(txid)
    }

    pub fn spender(&self, outpoint: &OutPoint) -> Option<Hash256> {
        self.spent.get(outpoint).copied()
    }

    /// All mempool txids, sorted for deterministic inv responses.
    pub fn query_hashes(&self) -> Vec<Hash256> {
        let mut hashes: Vec<Hash256> = self.entries.keys().copied().collect();
        hashes.sort();
        hashes
    }

    /// Admission per the relay policy: cheap structural checks, policy
    /// checks, fee floors, then signatures last.
    pub fn accept<S: KeyValueStore>(
        &mut self,
        chain: &ChainState<S>,
        tx: Transaction,
        check_inputs: bool,
        limit_free: bool,
        now: u64,
    ) -> Result<Hash256, MempoolError> {
        check_transaction(&tx, chain.params().is_testnet()).map_err(|err| {
            MempoolError::with_dos(MempoolErrorKind::InvalidTransaction, err.reason, err.dos)
        })?;

        // Coinbase and coinstake are only valid inside a block.
        if tx.is_coinbase() {
            return Err(MempoolError::with_dos(
                MempoolErrorKind::InvalidTransaction,
                "coinbase as individual tx",
                100,
            ));
        }
        if tx.is_coinstake() {
            return Err(MempoolError::with_dos(
                MempoolErrorKind::InvalidTransaction,
                "coinstake as individual tx",
                100,
            ));
        }

        if self.require_standard && !chain.params().is_testnet() && !is_standard_tx(&tx) {
            return Err(MempoolError::new(
                MempoolErrorKind::NonStandard,
                "nonstandard transaction",
            ));
        }

        let txid = tx.txid();
        if self.entries.contains_key(&txid) {
            return Err(MempoolError::new(
                MempoolErrorKind::AlreadyHave,
                "already in mempool",
            ));
        }
        if chain
            .contains_tx(&txid)
            .map_err(|err| MempoolError::new(MempoolErrorKind::Internal, err.to_string()))?
        {
            return Err(MempoolError::new(
                MempoolErrorKind::AlreadyHave,
                "already indexed",
            ));
        }

        for input in &tx.vin {
            if self.spent.contains_key(&input.prevout) {
                // Replacement is disabled; the first spend wins.
                return Err(MempoolError::new(
                    MempoolErrorKind::Conflict,
                    "conflicts with in-memory transaction",
                ));
            }
        }

        if check_inputs {
            let scratch = WriteBatch::new();
            let inputs = match chain.fetch_inputs(&tx, &scratch, false, Some(&*self)) {
                Ok(inputs) => inputs,
                Err(FetchInputsError::Missing(parent)) => {
                    return Err(MempoolError::missing(vec![parent]));
                }
                Err(FetchInputsError::Invalid(err)) => {
                    return Err(MempoolError::with_dos(
                        MempoolErrorKind::InvalidTransaction,
                        err.reason,
                        err.dos,
                    ));
                }
                Err(FetchInputsError::Chain(err)) => {
                    return Err(MempoolError::new(
                        MempoolErrorKind::Internal,
                        err.to_string(),
                    ));
                }
            };

            if self.require_standard
                && !chain.params().is_testnet()
                && !are_inputs_standard(&tx, &inputs)
            {
                return Err(MempoolError::new(
                    MempoolErrorKind::NonStandard,
                    "nonstandard transaction input",
                ));
            }

            let size = tx.serialized_size();
            let value_in = ChainState::<S>::value_in(&tx, &inputs);
            let value_out = tx.value_out();
            if value_in < value_out {
                return Err(MempoolError::with_dos(
                    MempoolErrorKind::InvalidTransaction,
                    "value in below value out",
                    100,
                ));
            }
            let fees = value_in - value_out;
            if !money_range(fees) {
                return Err(MempoolError::with_dos(
                    MempoolErrorKind::InvalidTransaction,
                    "fees out of range",
                    100,
                ));
            }

            let mut tx_min_fee = min_fee(&tx, 1_000, FeeMode::Relay, size);
            // Small transactions with no dust outputs may ride for free,
            // subject to the rate limiter below.
            if limit_free
                && size < FREE_TX_SIZE_LIMIT
                && !tx.vout.iter().any(|output| output.value < DUST_SOFT_LIMIT)
            {
                tx_min_fee = 0;
            }
            if (limit_free && fees < tx_min_fee) || (!limit_free && fees < MIN_TX_FEE) {
                return Err(MempoolError::new(
                    MempoolErrorKind::InsufficientFee,
                    format!("not enough fees: {fees} < {tx_min_fee}"),
                ));
            }

            // Continuously rate-limit free transactions to blunt
            // penny-flooding.
            if limit_free && fees < MIN_RELAY_TX_FEE {
                if !self.limiter.admit(self.limit_free_relay, size, now) {
                    return Err(MempoolError::new(
                        MempoolErrorKind::RateLimited,
                        "free transaction rejected by rate limiter",
                    ));
                }
            }

            self.check_inputs_against_chain(chain, &tx, &inputs)?;
        }

        for input in &tx.vin {
            self.spent.insert(input.prevout.clone(), txid);
        }
        self.entries.insert(txid, tx);
        neutrond_log::log_debug!(
            "accepted {} ({} transactions in pool)",
            neutrond_consensus::hash256_to_hex(&txid),
            self.entries.len(),
        );
        Ok(txid)
    }

    /// The per-input half of admission: maturity, timestamps, double
    /// spends, and finally ECDSA.
    fn check_inputs_against_chain<S: KeyValueStore>(
        &self,
        chain: &ChainState<S>,
        tx: &Transaction,
        inputs: &HashMap<Hash256, FetchedInput>,
    ) -> Result<(), MempoolError> {
        let mut value_in: Amount = 0;
        for input in &tx.vin {
            let fetched = &inputs[&input.prevout.hash];
            let prev_tx = &fetched.tx;

            if (prev_tx.is_coinbase() || prev_tx.is_coinstake())
                && !fetched.entry.pos.is_memory()
                && chain.output_is_immature(&fetched.entry.pos)
            {
                return Err(MempoolError::new(
                    MempoolErrorKind::ImmatureSpend,
                    "tried to spend immature coinbase or coinstake",
                ));
            }

            if prev_tx.time > tx.time {
                return Err(MempoolError::new(
                    MempoolErrorKind::InvalidTransaction,
                    "transaction timestamp earlier than input",
                ));
            }

            let prev_value = prev_tx.vout[input.prevout.index as usize].value;
            value_in += prev_value;
            if !money_range(prev_value) || !money_range(value_in) {
                return Err(MempoolError::new(
                    MempoolErrorKind::InvalidTransaction,
                    "txin values out of range",
                ));
            }

            let spent_slot = &fetched.entry.spent[input.prevout.index as usize];
            if !spent_slot.is_null() && *spent_slot != DiskTxPos::memory() {
                // Double spends do not score the peer; doing so would
                // make network splits easy to provoke.
                return Err(MempoolError::new(
                    MempoolErrorKind::Conflict,
                    "input already spent",
                ));
            }
        }

        // Cheap checks all passed; now the expensive signature pass.
        for (input_index, input) in tx.vin.iter().enumerate() {
            let fetched = &inputs[&input.prevout.hash];
            verify_signature(&fetched.tx, tx, input_index, STANDARD_SCRIPT_VERIFY_FLAGS).map_err(
                |err| {
                    MempoolError::with_dos(
                        MempoolErrorKind::InvalidTransaction,
                        err.to_string(),
                        100,
                    )
                },
            )?;
        }
        Ok(())
    }

    pub fn remove(&mut self, tx: &Transaction) {
        let txid = tx.txid();
        if self.entries.remove(&txid).is_some() {
            for input in &tx.vin {
                if self.spent.get(&input.prevout) == Some(&txid) {
                    self.spent.remove(&input.prevout);
                }
            }
        }
    }

    /// Drops any pool transaction that spends an output `tx` now spends.
    pub fn remove_conflicts(&mut self, tx: &Transaction) {
        let txid = tx.txid();
        for input in &tx.vin {
            let Some(spender) = self.spent.get(&input.prevout).copied() else {
                continue;
            };
            if spender == txid {
                continue;
            }
            if let Some(conflict) = self.entries.get(&spender).cloned() {
                self.remove(&conflict);
            }
        }
    }

    // Orphan transactions: parked until their parents arrive.

    pub fn has_orphan(&self, txid: &Hash256) -> bool {
        self.orphans.contains_key(txid)
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    /// Stores an orphan, refusing oversized ones to cap the memory an
    /// attacker can tie up.
    pub fn add_orphan(&mut self, tx: Transaction) -> bool {
        let txid = tx.txid();
        if self.orphans.contains_key(&txid) {
            return false;
        }
        let size = encode(&tx).len();
        if size > MAX_ORPHAN_TX_SIZE {
            neutrond_log::log_debug!(
                "ignoring large orphan tx (size {size}, hash {})",
                neutrond_consensus::hash256_to_hex(&txid),
            );
            return false;
        }
        for input in &tx.vin {
            self.orphans_by_prev
                .entry(input.prevout.hash)
                .or_default()
                .insert(txid);
        }
        self.orphans.insert(txid, tx);
        neutrond_log::log_debug!(
            "stored orphan tx {} (pool {})",
            neutrond_consensus::hash256_to_hex(&txid),
            self.orphans.len(),
        );
        true
    }

    pub fn erase_orphan(&mut self, txid: &Hash256) {
        let Some(tx) = self.orphans.remove(txid) else {
            return;
        };
        for input in &tx.vin {
            if let Some(dependents) = self.orphans_by_prev.get_mut(&input.prevout.hash) {
                dependents.remove(txid);
                if dependents.is_empty() {
                    self.orphans_by_prev.remove(&input.prevout.hash);
                }
            }
        }
    }

    /// Random eviction down to `max_orphans`; randomized so an attacker
    /// cannot aim the eviction at someone else's transactions.
    pub fn limit_orphans(&mut self, max_orphans: usize) -> usize {
        let mut evicted = 0;
        while self.orphans.len() > max_orphans {
            let random: Hash256 = rand::random();
            let victim = self
                .orphans
                .range(random..)
                .next()
                .or_else(|| self.orphans.iter().next())
                .map(|(txid, _)| *txid);
            match victim {
                Some(txid) => {
                    self.erase_orphan(&txid);
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }

    pub fn limit_orphans_default(&mut self) -> usize {
        self.limit_orphans(MAX_ORPHAN_TRANSACTIONS)
    }

    /// Orphans waiting on `parent`, for promotion once it is accepted.
    pub fn orphans_waiting_on(&self, parent: &Hash256) -> Vec<Hash256> {
        self.orphans_by_prev
            .get(parent)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn orphan(&self, txid: &Hash256) -> Option<Transaction> {
        self.orphans.get(txid).cloned()
    }
}

/// Relay standardness: known version, push-only canonical scriptSigs of
/// bounded size, standard output shapes, at most one data carrier, and
/// no zero-value outputs.
pub fn is_standard_tx(tx: &Transaction) -> bool {
    if tx.version > CURRENT_TX_VERSION {
        return false;
    }

    for input in &tx.vin {
        if input.script_sig.len() > MAX_STANDARD_SCRIPTSIG_SIZE {
            return false;
        }
        if !is_push_only(&input.script_sig) {
            return false;
        }
        if !has_canonical_pushes(&input.script_sig) {
            return false;
        }
    }

    let mut data_outputs = 0usize;
    for output in &tx.vout {
        let (kind, _) = solve(&output.script_pubkey);
        if kind == ScriptKind::NonStandard {
            return false;
        }
        if kind == ScriptKind::NullData {
            data_outputs += 1;
        }
        if output.value == 0 {
            return false;
        }
        if !has_canonical_pushes(&output.script_pubkey) {
            return false;
        }
    }

    data_outputs <= 1
}

/// Inputs must satisfy standard scripts with exactly the expected number
/// of stack arguments; P2SH redemptions are classified one level deep
/// and nested P2SH is refused.
pub fn are_inputs_standard(tx: &Transaction, inputs: &HashMap<Hash256, FetchedInput>) -> bool {
    if tx.is_coinbase() {
        return true;
    }

    for (input_index, input) in tx.vin.iter().enumerate() {
        let Some(fetched) = inputs.get(&input.prevout.hash) else {
            return false;
        };
        let Some(prev_output) = fetched.tx.vout.get(input.prevout.index as usize) else {
            return false;
        };

        let (kind, solutions) = solve(&prev_output.script_pubkey);
        let Some(mut args_expected) = script_sig_args_expected(kind, &solutions) else {
            return false;
        };

        let mut stack: Vec<Vec<u8>> = Vec::new();
        if eval_script(&mut stack, &input.script_sig, tx, input_index, 0).is_err() {
            return false;
        }

        if kind == ScriptKind::ScriptHash {
            let Some(subscript) = stack.last() else {
                return false;
            };
            let (sub_kind, sub_solutions) = solve(subscript);
            if sub_kind == ScriptKind::ScriptHash {
                return false;
            }
            let Some(sub_args) = script_sig_args_expected(sub_kind, &sub_solutions) else {
                return false;
            };
            args_expected += sub_args;
        }

        if stack.len() != args_expected {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use neutrond_primitives::transaction::{TxIn, TxOut};

    fn tx_spending(prevout: OutPoint, tag: u8) -> Transaction {
        Transaction {
            version: 1,
            time: 1_600_000_000,
            vin: vec![TxIn {
                prevout,
                script_sig: vec![0x01, tag],
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value: 1_000,
                script_pubkey: p2pkh_script(tag),
            }],
            lock_time: 0,
        }
    }

    fn p2pkh_script(tag: u8) -> Vec<u8> {
        let mut script = vec![0x76, 0xa9, 0x14];
        script.extend_from_slice(&[tag; 20]);
        script.extend_from_slice(&[0x88, 0xac]);
        script
    }

    #[test]
    fn conflict_map_tracks_spenders() {
        let mut pool = Mempool::default();
        let prevout = OutPoint::new([1u8; 32], 0);
        let tx = tx_spending(prevout.clone(), 7);
        let txid = tx.txid();

        // Insert directly; admission is exercised in integration tests.
        for input in &tx.vin {
            pool.spent.insert(input.prevout.clone(), txid);
        }
        pool.entries.insert(txid, tx.clone());

        assert!(pool.exists(&txid));
        assert_eq!(pool.spender(&prevout), Some(txid));

        pool.remove(&tx);
        assert!(!pool.exists(&txid));
        assert_eq!(pool.spender(&prevout), None);
    }

    #[test]
    fn remove_conflicts_drops_rival_spender() {
        let mut pool = Mempool::default();
        let prevout = OutPoint::new([1u8; 32], 0);
        let rival = tx_spending(prevout.clone(), 1);
        let rival_id = rival.txid();
        pool.spent.insert(prevout.clone(), rival_id);
        pool.entries.insert(rival_id, rival);

        let confirmed = tx_spending(prevout, 2);
        pool.remove_conflicts(&confirmed);
        assert!(!pool.exists(&rival_id));
    }

    #[test]
    fn orphan_pool_indexes_parents() {
        let mut pool = Mempool::default();
        let parent = [9u8; 32];
        let orphan = tx_spending(OutPoint::new(parent, 0), 3);
        let orphan_id = orphan.txid();

        assert!(pool.add_orphan(orphan.clone()));
        assert!(!pool.add_orphan(orphan));
        assert!(pool.has_orphan(&orphan_id));
        assert_eq!(pool.orphans_waiting_on(&parent), vec![orphan_id]);

        pool.erase_orphan(&orphan_id);
        assert!(!pool.has_orphan(&orphan_id));
        assert!(pool.orphans_waiting_on(&parent).is_empty());
    }

    #[test]
    fn oversized_orphans_are_refused() {
        let mut pool = Mempool::default();
        let mut tx = tx_spending(OutPoint::new([2u8; 32], 0), 1);
        tx.vin[0].script_sig = vec![0u8; MAX_ORPHAN_TX_SIZE + 1];
        assert!(!pool.add_orphan(tx));
        assert_eq!(pool.orphan_count(), 0);
    }

    #[test]
    fn orphan_eviction_is_bounded() {
        let mut pool = Mempool::default();
        for tag in 0..50u8 {
            let tx = tx_spending(OutPoint::new([tag; 32], 0), tag);
            assert!(pool.add_orphan(tx));
        }
        let evicted = pool.limit_orphans(10);
        assert_eq!(evicted, 40);
        assert_eq!(pool.orphan_count(), 10);
    }

    #[test]
    fn rate_limiter_saturates_and_decays() {
        let mut limiter = FreeRelayLimiter::default();
        let mut now = 1_000u64;
        // 15 kB/min budget: 150,000 byte threshold.
        let mut admitted = 0;
        for _ in 0..600 {
            if limiter.admit(DEFAULT_LIMIT_FREE_RELAY, 300, now) {
                admitted += 1;
            }
        }
        assert!(admitted >= 500);
        assert!(admitted < 600);
        assert!(!limiter.admit(DEFAULT_LIMIT_FREE_RELAY, 300, now));

        // Ten minutes of idleness decays the counter below threshold.
        now += 600;
        assert!(limiter.admit(DEFAULT_LIMIT_FREE_RELAY, 300, now));
    }

    #[test]
    fn standardness_rules() {
        let tx = tx_spending(OutPoint::new([1u8; 32], 0), 5);
        assert!(is_standard_tx(&tx));

        let mut zero_value = tx.clone();
        zero_value.vout[0].value = 0;
        assert!(!is_standard_tx(&zero_value));

        let mut non_push = tx.clone();
        non_push.vin[0].script_sig = vec![0xac];
        assert!(!is_standard_tx(&non_push));

        let mut oversized = tx.clone();
        oversized.vin[0].script_sig = vec![0x4c, 0xff];
        oversized.vin[0]
            .script_sig
            .extend_from_slice(&[0u8; 0xff]);
        oversized.vin[0].script_sig.extend_from_slice(&[0x00; 300]);
        assert!(!is_standard_tx(&oversized));

        let mut nonstandard_out = tx.clone();
        nonstandard_out.vout[0].script_pubkey = vec![0xff, 0xfe];
        assert!(!is_standard_tx(&nonstandard_out));

        let mut future_version = tx;
        future_version.version = CURRENT_TX_VERSION + 1;
        assert!(!is_standard_tx(&future_version));
    }
}
