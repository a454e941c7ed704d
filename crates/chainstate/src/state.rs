//! The chain state: accepting blocks, connecting and disconnecting them,
//! and switching best chains transactionally.

use std::collections::HashMap;
use std::sync::Arc;

use neutrond_consensus::constants::{
    future_drift, ENFORCE_DEV_PAYMENT_HEIGHT, ENFORCE_MN_PAYMENT_HEIGHT,
    HISTORIC_REWARD_CHECK_HEIGHT, LAST_POW_BLOCK, MAX_BLOCK_SIGOPS, MNPAYEE_MAX_BLOCK_AGE,
    STAKE_MIN_AGE,
};
use neutrond_consensus::money::{money_range, Amount, CENT, COIN};
use neutrond_consensus::params::{ChainParams, CheckpointMode};
use neutrond_consensus::rewards::{
    developer_payment, masternode_payment, proof_of_stake_reward, proof_of_work_reward,
};
use neutrond_consensus::sporks::{SporkId, SporkSet};
use neutrond_consensus::{hash256_to_hex, Hash256};
use neutrond_kernel::{
    check_stake_kernel_hash, compute_next_stake_modifier, selection_interval,
    stake_modifier_checksum, KernelError, ModifierCandidate, PrevModifier, StakeKernelInput,
};
use neutrond_pow::difficulty::{block_trust, next_target_required, TargetBlock};
use neutrond_pow::{check_proof_of_work, PowError};
use neutrond_primitives::block::{Block, BlockHeader};
use neutrond_primitives::encoding::{decode, encode, Decodable, DecodeError, Decoder};
use neutrond_primitives::outpoint::OutPoint;
use neutrond_primitives::transaction::Transaction;
use neutrond_script::interpreter::{verify_signature, MANDATORY_SCRIPT_VERIFY_FLAGS};
use neutrond_script::standard::{p2sh_sig_op_count, sig_op_count, solve, ScriptKind};
use neutrond_storage::{Column, KeyValueStore, StoreError, WriteBatch};
use primitive_types::U256;

use crate::blocktree::{load_block_tree, write_block_index, BlockIndexNode, BlockTree};
use crate::flatfiles::{BlockFileStore, BlockLocation, FlatFileError};
use crate::hooks::{ChainListener, MasternodePayments, TxSource};
use crate::txindex::{
    erase_tx_index, read_tx_index, read_tx_index_staged, write_tx_index, DiskTxPos, TxIndexEntry,
};
use crate::validation::{
    check_block, coinbase_commits_to_height, is_final_tx, min_fee, CheckBlockFlags, FeeMode,
    ValidationError,
};

const META_HASH_BEST_CHAIN: &[u8] = b"hash_best_chain";
const META_BEST_INVALID_TRUST: &[u8] = b"best_invalid_trust";
const META_CHECKPOINT_PUBKEY: &[u8] = b"checkpoint_pubkey";
const META_SYNC_CHECKPOINT: &[u8] = b"sync_checkpoint";

#[derive(Debug)]
pub enum ChainStateError {
    Validation(ValidationError),
    Store(StoreError),
    FlatFile(FlatFileError),
    Decode(DecodeError),
    Kernel(KernelError),
    Pow(PowError),
    DuplicateBlock,
    MissingParent,
    MissingInputs,
    CorruptIndex(&'static str),
    Rejected(&'static str),
}

impl ChainStateError {
    /// Misbehavior score attached to the failure, if any.
    pub fn dos(&self) -> u32 {
        match self {
            ChainStateError::Validation(err) => err.dos,
            ChainStateError::MissingParent => 10,
            _ => 0,
        }
    }

    fn invalid(reason: &'static str, dos: u32) -> Self {
        ChainStateError::Validation(ValidationError::new(reason, dos))
    }
}

impl std::fmt::Display for ChainStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainStateError::Validation(err) => write!(f, "{err}"),
            ChainStateError::Store(err) => write!(f, "{err}"),
            ChainStateError::FlatFile(err) => write!(f, "{err}"),
            ChainStateError::Decode(err) => write!(f, "{err}"),
            ChainStateError::Kernel(err) => write!(f, "{err}"),
            ChainStateError::Pow(err) => write!(f, "{err}"),
            ChainStateError::DuplicateBlock => write!(f, "block already known"),
            ChainStateError::MissingParent => write!(f, "previous block not found"),
            ChainStateError::MissingInputs => write!(f, "inputs not found"),
            ChainStateError::CorruptIndex(message) => write!(f, "{message}"),
            ChainStateError::Rejected(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ChainStateError {}

impl From<ValidationError> for ChainStateError {
    fn from(err: ValidationError) -> Self {
        ChainStateError::Validation(err)
    }
}

impl From<StoreError> for ChainStateError {
    fn from(err: StoreError) -> Self {
        ChainStateError::Store(err)
    }
}

impl From<FlatFileError> for ChainStateError {
    fn from(err: FlatFileError) -> Self {
        ChainStateError::FlatFile(err)
    }
}

impl From<DecodeError> for ChainStateError {
    fn from(err: DecodeError) -> Self {
        ChainStateError::Decode(err)
    }
}

impl From<KernelError> for ChainStateError {
    fn from(err: KernelError) -> Self {
        ChainStateError::Kernel(err)
    }
}

impl From<PowError> for ChainStateError {
    fn from(err: PowError) -> Self {
        ChainStateError::Pow(err)
    }
}

/// How many best-chain reconnects were postponed past the block being
/// connected. With none postponed, payout enforcement always applies.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PostponedBlocks {
    NotApplicable,
    Count(usize),
}

impl PostponedBlocks {
    /// Payout enforcement applies unless more blocks are postponed than
    /// the spork #12 threshold allows.
    pub fn within_enforcement(&self, threshold: i64) -> bool {
        match self {
            PostponedBlocks::NotApplicable => true,
            PostponedBlocks::Count(count) => (*count as i64) < threshold,
        }
    }
}

/// Failure modes of input fetching: missing prerequisites are reported
/// apart from actual invalidity so callers can orphan instead of ban.
#[derive(Debug)]
pub enum FetchInputsError {
    /// A referenced transaction is unknown to disk and mempool.
    Missing(Hash256),
    Invalid(ValidationError),
    Chain(Box<ChainStateError>),
}

impl From<StoreError> for FetchInputsError {
    fn from(err: StoreError) -> Self {
        FetchInputsError::Chain(Box::new(ChainStateError::Store(err)))
    }
}

/// A fetched input: the prev transaction and its current index entry.
#[derive(Clone, Debug)]
pub struct FetchedInput {
    pub entry: TxIndexEntry,
    pub tx: Transaction,
}

/// Ambient facts and collaborators for one validation call.
pub struct ChainContext<'a> {
    pub adjusted_now: i64,
    pub initial_download: bool,
    pub sporks: &'a SporkSet,
    pub masternode: Option<&'a dyn MasternodePayments>,
    pub listeners: &'a [&'a dyn ChainListener],
    /// Verify the work or stake proof of accepted blocks.
    pub check_proofs: bool,
    /// Verify ECDSA signatures when connecting inputs.
    pub check_signatures: bool,
    pub print_coinage: bool,
    pub print_coinstake: bool,
}

impl<'a> ChainContext<'a> {
    pub fn new(sporks: &'a SporkSet, adjusted_now: i64) -> Self {
        Self {
            adjusted_now,
            initial_download: false,
            sporks,
            masternode: None,
            listeners: &[],
            check_proofs: true,
            check_signatures: true,
            print_coinage: false,
            print_coinstake: false,
        }
    }
}

/// What a best-chain change did, for the caller to reconcile the mempool
/// and relay layers.
#[derive(Default, Debug)]
pub struct ChainEvents {
    /// Blocks that joined the main chain, oldest first.
    pub connected: Vec<Block>,
    /// Blocks that left the main chain, tip first.
    pub disconnected: Vec<Block>,
    pub new_best: Option<(Hash256, i32)>,
}

impl ChainEvents {
    /// Transactions to offer back to the mempool after a reorganization.
    pub fn resurrectable(&self) -> impl Iterator<Item = &Transaction> {
        self.disconnected
            .iter()
            .flat_map(|block| block.vtx.iter())
            .filter(|tx| !tx.is_coinbase() && !tx.is_coinstake())
    }

    pub fn merge(&mut self, other: ChainEvents) {
        self.disconnected.extend(other.disconnected);
        self.connected.extend(other.connected);
        if other.new_best.is_some() {
            self.new_best = other.new_best;
        }
    }
}

struct ConnectOpts {
    just_check: bool,
    reorganizing: bool,
    postponed: PostponedBlocks,
}

pub struct ChainState<S> {
    store: Arc<S>,
    blocks: BlockFileStore,
    params: ChainParams,
    tree: BlockTree,
    best_invalid_trust: U256,
    sync_checkpoint: Option<Hash256>,
}

impl<S: KeyValueStore> ChainState<S> {
    pub fn new(store: Arc<S>, blocks: BlockFileStore, params: ChainParams) -> Self {
        Self {
            store,
            blocks,
            params,
            tree: BlockTree::new(),
            best_invalid_trust: U256::zero(),
            sync_checkpoint: None,
        }
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn tree(&self) -> &BlockTree {
        &self.tree
    }

    pub fn best_height(&self) -> i32 {
        self.tree.best_height()
    }

    pub fn best_hash(&self) -> Option<Hash256> {
        self.tree.best_hash()
    }

    /// Rebuilds the in-memory index from disk at startup.
    pub fn load_block_index(&mut self) -> Result<(), ChainStateError> {
        let best = self.read_meta_hash(META_HASH_BEST_CHAIN)?;
        self.tree = load_block_tree(self.store.as_ref(), best)?;
        if let Some(bytes) = self.store.get(Column::Meta, META_BEST_INVALID_TRUST)? {
            if bytes.len() == 32 {
                self.best_invalid_trust = U256::from_little_endian(&bytes);
            }
        }
        self.sync_checkpoint = self.read_meta_hash(META_SYNC_CHECKPOINT)?;
        neutrond_log::log_info!(
            "loaded block index: {} blocks, best height {}",
            self.tree.len(),
            self.tree.best_height(),
        );
        Ok(())
    }

    fn read_meta_hash(&self, key: &[u8]) -> Result<Option<Hash256>, ChainStateError> {
        let Some(bytes) = self.store.get(Column::Meta, key)? else {
            return Ok(None);
        };
        if bytes.len() != 32 {
            return Err(ChainStateError::CorruptIndex("invalid meta hash length"));
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes);
        Ok(Some(hash))
    }

    pub fn read_checkpoint_pubkey(&self) -> Result<Option<Vec<u8>>, ChainStateError> {
        Ok(self.store.get(Column::Meta, META_CHECKPOINT_PUBKEY)?)
    }

    pub fn write_checkpoint_pubkey(&self, pubkey: &[u8]) -> Result<(), ChainStateError> {
        self.store.put(Column::Meta, META_CHECKPOINT_PUBKEY, pubkey)?;
        Ok(())
    }

    pub fn sync_checkpoint(&self) -> Option<Hash256> {
        self.sync_checkpoint
    }

    /// Advances the signed sync checkpoint; signature validation happens
    /// in the checkpoint subsystem before this is called.
    pub fn set_sync_checkpoint(&mut self, hash: Hash256) -> Result<(), ChainStateError> {
        self.store.put(Column::Meta, META_SYNC_CHECKPOINT, &hash)?;
        self.sync_checkpoint = Some(hash);
        Ok(())
    }

    pub fn contains_tx(&self, txid: &Hash256) -> Result<bool, ChainStateError> {
        Ok(read_tx_index(self.store.as_ref(), txid)?.is_some())
    }

    pub fn read_tx_index(&self, txid: &Hash256) -> Result<Option<TxIndexEntry>, ChainStateError> {
        Ok(read_tx_index(self.store.as_ref(), txid)?)
    }

    pub fn read_block(&self, node: &BlockIndexNode) -> Result<Block, ChainStateError> {
        let payload = self.blocks.read(BlockLocation {
            file: node.file,
            pos: node.block_pos,
        })?;
        Ok(decode::<Block>(&payload)?)
    }

    pub fn read_block_by_hash(&self, hash: &Hash256) -> Result<Option<Block>, ChainStateError> {
        let Some(node) = self.tree.get(hash) else {
            return Ok(None);
        };
        self.read_block(node).map(Some)
    }

    /// Reads a transaction straight out of its block record.
    pub fn read_transaction(&self, pos: &DiskTxPos) -> Result<Transaction, ChainStateError> {
        if pos.is_null() || pos.is_memory() {
            return Err(ChainStateError::Rejected("transaction is not on disk"));
        }
        let payload = self.blocks.read(BlockLocation {
            file: pos.file,
            pos: pos.block_pos,
        })?;
        let slice = payload
            .get(pos.tx_pos as usize..)
            .ok_or(ChainStateError::CorruptIndex("tx offset out of range"))?;
        let mut decoder = Decoder::new(slice);
        Ok(Transaction::consensus_decode(&mut decoder)?)
    }

    /// Timestamp of the block holding the record at `pos`.
    fn read_block_time(&self, pos: &DiskTxPos) -> Result<u32, ChainStateError> {
        let payload = self.blocks.read(BlockLocation {
            file: pos.file,
            pos: pos.block_pos,
        })?;
        let mut decoder = Decoder::new(&payload);
        let header = BlockHeader::consensus_decode(&mut decoder)?;
        Ok(header.time)
    }

    /// Gathers each input's prev transaction and index entry. Entries
    /// staged in `batch` shadow the committed store so intra-block and
    /// intra-reorganization dependencies resolve.
    pub fn fetch_inputs(
        &self,
        tx: &Transaction,
        batch: &WriteBatch,
        from_block: bool,
        mempool: Option<&dyn TxSource>,
    ) -> Result<HashMap<Hash256, FetchedInput>, FetchInputsError> {
        let mut inputs: HashMap<Hash256, FetchedInput> = HashMap::new();
        if tx.is_coinbase() {
            return Ok(inputs);
        }

        for input in &tx.vin {
            let prev_txid = input.prevout.hash;
            if inputs.contains_key(&prev_txid) {
                continue;
            }

            let entry = if from_block {
                read_tx_index_staged(self.store.as_ref(), batch, &prev_txid)?
            } else {
                read_tx_index(self.store.as_ref(), &prev_txid)?
            };

            let (entry, prev_tx) = match entry {
                Some(entry) if !entry.pos.is_memory() => {
                    let prev_tx = self
                        .read_transaction(&entry.pos)
                        .map_err(|err| FetchInputsError::Chain(Box::new(err)))?;
                    (entry, prev_tx)
                }
                maybe_entry => {
                    // Not on disk; the parent may still be floating in
                    // the mempool.
                    let Some(prev_tx) =
                        mempool.and_then(|source| source.lookup(&prev_txid))
                    else {
                        return Err(FetchInputsError::Missing(prev_txid));
                    };
                    let entry = maybe_entry.unwrap_or_else(|| {
                        TxIndexEntry::new(DiskTxPos::memory(), prev_tx.vout.len())
                    });
                    (entry, prev_tx)
                }
            };

            inputs.insert(prev_txid, FetchedInput { entry, tx: prev_tx });
        }

        // Range-check every prevout against what we fetched.
        for input in &tx.vin {
            let fetched = inputs
                .get(&input.prevout.hash)
                .expect("fetched in the loop above");
            let index = input.prevout.index as usize;
            if index >= fetched.tx.vout.len() || index >= fetched.entry.spent.len() {
                return Err(FetchInputsError::Invalid(ValidationError::new(
                    "prevout index out of range",
                    100,
                )));
            }
        }

        Ok(inputs)
    }

    pub fn value_in(
        tx: &Transaction,
        inputs: &HashMap<Hash256, FetchedInput>,
    ) -> Amount {
        if tx.is_coinbase() {
            return 0;
        }
        tx.vin
            .iter()
            .map(|input| {
                inputs
                    .get(&input.prevout.hash)
                    .and_then(|fetched| fetched.tx.vout.get(input.prevout.index as usize))
                    .map(|output| output.value)
                    .unwrap_or(0)
            })
            .sum()
    }

    /// Coin age consumed by a transaction, in coin-days. Inputs younger
    /// than the minimum stake age contribute nothing; inputs not on the
    /// main chain are skipped.
    pub fn transaction_coin_age(
        &self,
        tx: &Transaction,
        print: bool,
    ) -> Result<u64, ChainStateError> {
        if tx.is_coinbase() {
            return Ok(0);
        }

        let mut cent_seconds = U256::zero();
        for input in &tx.vin {
            let Some(entry) = read_tx_index(self.store.as_ref(), &input.prevout.hash)? else {
                continue; // previous transaction not in main chain
            };
            if entry.pos.is_memory() {
                continue;
            }
            let prev_tx = self.read_transaction(&entry.pos)?;
            if tx.time < prev_tx.time {
                return Err(ChainStateError::Rejected(
                    "transaction timestamp earlier than input",
                ));
            }
            let block_time = self.read_block_time(&entry.pos)?;
            if block_time as i64 + STAKE_MIN_AGE > tx.time as i64 {
                continue; // only count coins meeting the minimum age
            }
            let Some(output) = prev_tx.vout.get(input.prevout.index as usize) else {
                continue;
            };
            let value = output.value.max(0) as u64;
            let age = (tx.time - prev_tx.time) as u64;
            cent_seconds = cent_seconds
                + U256::from(value) * U256::from(age) / U256::from(CENT as u64);

            if print {
                neutrond_log::log_debug!(
                    "coin age value={} ageSeconds={} centSeconds={}",
                    value,
                    age,
                    cent_seconds,
                );
            }
        }

        let coin_days =
            cent_seconds * U256::from(CENT as u64) / U256::from(COIN as u64) / U256::from(86_400u64);
        if print {
            neutrond_log::log_debug!("coin age coinDays={coin_days}");
        }
        Ok(coin_days.low_u64())
    }

    /// Coin age consumed by a whole block, forced to at least one.
    pub fn block_coin_age(&self, block: &Block, print: bool) -> Result<u64, ChainStateError> {
        let mut total = 0u64;
        for tx in &block.vtx {
            total = total.saturating_add(self.transaction_coin_age(tx, print)?);
        }
        Ok(total.max(1))
    }

    /// Expected compact target for the block following `parent_hash`.
    pub fn next_target_required(&self, parent_hash: &Hash256, proof_of_stake: bool) -> u32 {
        let limit = if proof_of_stake {
            let height = self
                .tree
                .get(parent_hash)
                .map(|node| node.height)
                .unwrap_or(0);
            self.params.pos_limit(height)
        } else {
            self.params.pow_limit
        };

        let prev = self.tree.last_block_index(parent_hash, proof_of_stake);
        let prev_block = prev.map(|node| TargetBlock {
            time: node.time as i64,
            bits: node.bits,
        });
        let prev_prev_block = prev
            .and_then(|node| node.prev.as_ref())
            .and_then(|hash| self.tree.last_block_index(hash, proof_of_stake))
            .map(|node| TargetBlock {
                time: node.time as i64,
                bits: node.bits,
            });

        next_target_required(prev_block, prev_prev_block, &limit)
    }

    /// Verifies the stake kernel of a coinstake building on `parent`.
    pub fn check_proof_of_stake(
        &self,
        parent_hash: &Hash256,
        coinstake: &Transaction,
        bits: u32,
        print_proof: bool,
    ) -> Result<(Hash256, Hash256), ChainStateError> {
        let parent = self
            .tree
            .get(parent_hash)
            .ok_or(ChainStateError::MissingParent)?;
        let prevout = &coinstake.vin[0].prevout;
        let Some(entry) = read_tx_index(self.store.as_ref(), &prevout.hash)? else {
            return Err(ChainStateError::Rejected("stake prevout not indexed"));
        };
        let prev_tx = self.read_transaction(&entry.pos)?;
        let Some(output) = prev_tx.vout.get(prevout.index as usize) else {
            return Err(ChainStateError::Rejected("stake prevout out of range"));
        };
        let block_from_time = self.read_block_time(&entry.pos)?;

        let input = StakeKernelInput {
            stake_modifier: parent.stake_modifier,
            block_from_time: block_from_time as i64,
            tx_prev_offset: entry.pos.tx_pos,
            tx_prev_time: prev_tx.time,
            prevout: prevout.clone(),
            prev_value: output.value,
            tx_time: coinstake.time,
            bits,
        };
        Ok(check_stake_kernel_hash(&input, print_proof)?)
    }

    /// Installs the genesis block at startup when the index is empty.
    /// Its coinbase is not indexed and stays unspendable, like every
    /// chain in this lineage.
    pub fn initialize_genesis(&mut self, block: &Block) -> Result<(), ChainStateError> {
        if !self.tree.is_empty() {
            return Ok(());
        }
        let hash = block.hash();
        let location = self.blocks.append(&encode(block))?;

        let mut node = BlockIndexNode {
            hash,
            prev: None,
            next_in_main: None,
            height: 0,
            file: location.file,
            block_pos: location.pos,
            version: block.header.version,
            time: block.header.time,
            bits: block.header.bits,
            nonce: block.header.nonce,
            proof_of_stake: false,
            stake_entropy_bit: block.stake_entropy_bit(),
            generated_stake_modifier: true,
            prevout_stake: OutPoint::null(),
            stake_time: 0,
            stake_modifier: 0,
            stake_modifier_checksum: 0,
            hash_proof: block.pow_hash(),
            chain_trust: [0u8; 32],
            mint: 0,
            money_supply: 0,
        };
        node.set_chain_trust(block_trust(block.header.bits));
        node.stake_modifier_checksum = stake_modifier_checksum(0, 4, &node.hash_proof, 0);

        let mut batch = WriteBatch::new();
        write_block_index(&mut batch, &node);
        batch.put(Column::Meta, META_HASH_BEST_CHAIN, hash);
        self.store.write_batch(&batch)?;
        self.tree.insert(node);
        self.tree.set_best(Some(hash));
        neutrond_log::log_info!("initialized genesis block {}", hash256_to_hex(&hash));
        Ok(())
    }

    /// Full contextual acceptance of a block whose parent is known.
    /// Writes the block to disk, indexes it, and promotes the best chain
    /// when the new cumulative trust wins.
    pub fn accept_block(
        &mut self,
        block: &Block,
        ctx: &ChainContext<'_>,
    ) -> Result<ChainEvents, ChainStateError> {
        let hash = block.hash();
        if self.tree.contains(&hash) {
            return Err(ChainStateError::DuplicateBlock);
        }

        let parent = self
            .tree
            .get(&block.header.prev_block)
            .ok_or(ChainStateError::MissingParent)?
            .clone();
        let height = parent.height + 1;
        let proof_of_stake = block.is_proof_of_stake();

        if !proof_of_stake && height > LAST_POW_BLOCK {
            return Err(ChainStateError::invalid(
                "proof-of-work period has ended",
                100,
            ));
        }

        if block.header.bits != self.next_target_required(&parent.hash, proof_of_stake) {
            return Err(ChainStateError::invalid(
                if proof_of_stake {
                    "incorrect proof-of-stake target"
                } else {
                    "incorrect proof-of-work target"
                },
                100,
            ));
        }

        let block_time = block.header.time as i64;
        if block_time <= self.tree.median_time_past(&parent.hash)
            || future_drift(block_time) < parent.time as i64
        {
            return Err(ChainStateError::invalid("block timestamp is too early", 0));
        }

        if proof_of_stake
            && !neutrond_kernel::check_coinstake_timestamp(
                height,
                self.params.pos_protocol_v2_height,
                block_time,
                block.vtx[1].time as i64,
            )
        {
            return Err(ChainStateError::invalid(
                "coinstake timestamp violation",
                50,
            ));
        }

        for tx in &block.vtx {
            if !is_final_tx(tx, height, block_time) {
                return Err(ChainStateError::invalid(
                    "contains a non-final transaction",
                    10,
                ));
            }
        }

        if let Some(expected) = self.params.hardened_checkpoint(height) {
            if *expected != hash {
                return Err(ChainStateError::invalid(
                    "rejected by hardened checkpoint lock-in",
                    100,
                ));
            }
        }

        if !self.satisfies_sync_checkpoint(&parent.hash, height) {
            match self.params.checkpoint_mode {
                CheckpointMode::Strict => {
                    return Err(ChainStateError::Rejected(
                        "rejected by synchronized checkpoint",
                    ));
                }
                CheckpointMode::Advisory => {
                    neutrond_log::log_warn!(
                        "sync checkpoint violation detected, but skipped"
                    );
                }
                CheckpointMode::Permissive => {}
            }
        }

        if !coinbase_commits_to_height(&block.vtx[0], height) {
            return Err(ChainStateError::invalid(
                "block height mismatch in coinbase",
                100,
            ));
        }

        let hash_proof = if proof_of_stake {
            if ctx.check_proofs {
                match self.check_proof_of_stake(
                    &parent.hash,
                    &block.vtx[1],
                    block.header.bits,
                    ctx.print_coinstake,
                ) {
                    Ok((proof, _target)) => proof,
                    Err(err) => {
                        neutrond_log::log_warn!(
                            "check proof-of-stake failed for block {}: {err}",
                            hash256_to_hex(&hash),
                        );
                        if !ctx.initial_download {
                            return Err(err);
                        }
                        [0u8; 32]
                    }
                }
            } else {
                [0u8; 32]
            }
        } else {
            if ctx.check_proofs {
                check_proof_of_work(&block.pow_hash(), block.header.bits, &self.params.pow_limit)?;
            }
            block.pow_hash()
        };

        let location = self.blocks.append(&encode(block))?;
        self.add_to_block_index(block, hash, &parent, location, hash_proof, ctx)
    }

    /// True when the chain through `parent_hash` contains the current
    /// sync checkpoint.
    fn satisfies_sync_checkpoint(&self, parent_hash: &Hash256, height: i32) -> bool {
        let Some(checkpoint) = self.sync_checkpoint else {
            return true;
        };
        let Some(checkpoint_node) = self.tree.get(&checkpoint) else {
            return true;
        };
        if height <= checkpoint_node.height {
            // Forking before the checkpoint is never acceptable.
            return false;
        }
        let mut current = self.tree.get(parent_hash);
        while let Some(node) = current {
            if node.height == checkpoint_node.height {
                return node.hash == checkpoint;
            }
            if node.height < checkpoint_node.height {
                break;
            }
            current = node.prev.as_ref().and_then(|prev| self.tree.get(prev));
        }
        false
    }

    fn add_to_block_index(
        &mut self,
        block: &Block,
        hash: Hash256,
        parent: &BlockIndexNode,
        location: BlockLocation,
        hash_proof: Hash256,
        ctx: &ChainContext<'_>,
    ) -> Result<ChainEvents, ChainStateError> {
        let height = parent.height + 1;
        let proof_of_stake = block.is_proof_of_stake();
        let (prevout_stake, stake_time) = block.proof_of_stake();

        let chain_trust = parent.chain_trust_value() + block_trust(block.header.bits);

        let (stake_modifier, generated) = self.compute_stake_modifier(parent)?;
        let mut flags = 0u32;
        if proof_of_stake {
            flags |= 1;
        }
        if block.stake_entropy_bit() {
            flags |= 2;
        }
        if generated {
            flags |= 4;
        }
        let checksum =
            stake_modifier_checksum(parent.stake_modifier_checksum, flags, &hash_proof, stake_modifier);

        let mut node = BlockIndexNode {
            hash,
            prev: Some(parent.hash),
            next_in_main: None,
            height,
            file: location.file,
            block_pos: location.pos,
            version: block.header.version,
            time: block.header.time,
            bits: block.header.bits,
            nonce: block.header.nonce,
            proof_of_stake,
            stake_entropy_bit: block.stake_entropy_bit(),
            generated_stake_modifier: generated,
            prevout_stake,
            stake_time,
            stake_modifier,
            stake_modifier_checksum: checksum,
            hash_proof,
            chain_trust: [0u8; 32],
            mint: 0,
            money_supply: 0,
        };
        node.set_chain_trust(chain_trust);

        let mut batch = WriteBatch::new();
        write_block_index(&mut batch, &node);
        self.store.write_batch(&batch)?;
        self.tree.insert(node);

        let mut events = ChainEvents::default();
        if chain_trust > self.tree.best_trust() || self.tree.best_hash().is_none() {
            events = self.set_best_chain(hash, ctx)?;
        }
        Ok(events)
    }

    fn compute_stake_modifier(
        &self,
        parent: &BlockIndexNode,
    ) -> Result<(u64, bool), ChainStateError> {
        // Find the block where the current modifier series started.
        let mut cursor = Some(parent);
        let mut modifier_time = parent.time as i64;
        while let Some(node) = cursor {
            modifier_time = node.time as i64;
            if node.generated_stake_modifier {
                break;
            }
            cursor = node.prev.as_ref().and_then(|prev| self.tree.get(prev));
        }

        let prev = PrevModifier {
            modifier: parent.stake_modifier,
            modifier_time,
            block_time: parent.time as i64,
        };

        let selection_start = (prev.block_time / neutrond_consensus::constants::MODIFIER_INTERVAL)
            * neutrond_consensus::constants::MODIFIER_INTERVAL
            - selection_interval();
        let mut candidates = Vec::new();
        let mut cursor = Some(parent);
        while let Some(node) = cursor {
            if (node.time as i64) < selection_start {
                break;
            }
            candidates.push(ModifierCandidate {
                hash: node.hash,
                time: node.time as i64,
                is_proof_of_stake: node.proof_of_stake,
                hash_proof: node.hash_proof,
                entropy_bit: node.stake_entropy_bit,
            });
            cursor = node.prev.as_ref().and_then(|prev| self.tree.get(prev));
        }

        Ok(compute_next_stake_modifier(Some(&prev), &candidates)?)
    }

    /// Promotes `hash` to the best chain, reorganizing when it does not
    /// extend the current tip.
    pub fn set_best_chain(
        &mut self,
        hash: Hash256,
        ctx: &ChainContext<'_>,
    ) -> Result<ChainEvents, ChainStateError> {
        let node = self
            .tree
            .get(&hash)
            .ok_or(ChainStateError::MissingParent)?
            .clone();

        let mut events = ChainEvents::default();
        let current_best = self.tree.best_hash();

        if current_best.is_none() && hash == self.params.hash_genesis_block {
            let mut batch = WriteBatch::new();
            batch.put(Column::Meta, META_HASH_BEST_CHAIN, hash);
            self.store.write_batch(&batch)?;
            self.tree.set_best(Some(hash));
        } else if node.prev == current_best {
            if let Err(err) =
                self.set_best_chain_inner(&hash, ctx, PostponedBlocks::NotApplicable, &mut events)
            {
                self.invalid_chain_found(&hash)?;
                return Err(err);
            }
        } else {
            // Walk back until the remaining prefix alone beats the
            // current best, postponing the rest to per-block commits.
            let mut intermediate = node.clone();
            let mut secondary: Vec<Hash256> = Vec::new();
            loop {
                let Some(prev) = intermediate.prev.and_then(|prev| self.tree.get(&prev)) else {
                    break;
                };
                if prev.prev.is_none() || prev.chain_trust_value() <= self.tree.best_trust() {
                    break;
                }
                secondary.push(intermediate.hash);
                intermediate = prev.clone();
            }

            if !secondary.is_empty() {
                neutrond_log::log_info!("postponing {} reconnects", secondary.len());
            }
            let postponed = if secondary.is_empty() {
                PostponedBlocks::NotApplicable
            } else {
                PostponedBlocks::Count(secondary.len())
            };

            match self.reorganize(intermediate.hash, postponed, ctx) {
                Ok(reorg_events) => events.merge(reorg_events),
                Err(err) => {
                    self.invalid_chain_found(&hash)?;
                    return Err(err);
                }
            }

            // Reconnect the postponed blocks; failures here are not
            // fatal, the chain already moved to a valid prefix.
            for pending in secondary.into_iter().rev() {
                if let Err(err) = self.set_best_chain_inner(&pending, ctx, postponed, &mut events)
                {
                    neutrond_log::log_warn!(
                        "postponed reconnect of {} failed: {err}",
                        hash256_to_hex(&pending),
                    );
                    break;
                }
            }
        }

        let best = self.tree.best_node().ok_or(ChainStateError::CorruptIndex(
            "best chain vanished during update",
        ))?;
        events.new_best = Some((best.hash, best.height));
        neutrond_log::log_info!(
            "new best={} height={} trust={}",
            hash256_to_hex(&best.hash),
            best.height,
            best.chain_trust_value(),
        );
        for listener in ctx.listeners {
            listener.best_chain_changed(&best.hash, best.height);
        }
        Ok(events)
    }

    /// Trivial extension: connect one block on top of the current tip
    /// under its own commit.
    fn set_best_chain_inner(
        &mut self,
        hash: &Hash256,
        ctx: &ChainContext<'_>,
        postponed: PostponedBlocks,
        events: &mut ChainEvents,
    ) -> Result<(), ChainStateError> {
        let node = self
            .tree
            .get(hash)
            .ok_or(ChainStateError::CorruptIndex("missing node for connect"))?
            .clone();
        let block = self.read_block(&node)?;

        let mut batch = WriteBatch::new();
        self.connect_block(
            &block,
            &node,
            &mut batch,
            ctx,
            &ConnectOpts {
                just_check: false,
                reorganizing: postponed != PostponedBlocks::NotApplicable,
                postponed,
            },
        )?;
        batch.put(Column::Meta, META_HASH_BEST_CHAIN, *hash);
        self.store.write_batch(&batch)?;

        if let Some(parent_hash) = node.prev {
            if let Some(parent) = self.tree.get_mut(&parent_hash) {
                parent.next_in_main = Some(*hash);
            }
        }
        self.tree.set_best(Some(*hash));
        events.connected.push(block);
        Ok(())
    }

    /// Switches the main chain to `new_hash` across the fork point, in a
    /// single atomic commit.
    pub fn reorganize(
        &mut self,
        new_hash: Hash256,
        postponed: PostponedBlocks,
        ctx: &ChainContext<'_>,
    ) -> Result<ChainEvents, ChainStateError> {
        let best_hash = self
            .tree
            .best_hash()
            .ok_or(ChainStateError::CorruptIndex("reorganize with no best"))?;
        let fork = self
            .tree
            .find_fork(&best_hash, &new_hash)
            .ok_or(ChainStateError::CorruptIndex("no common ancestor"))?;

        let to_disconnect = self.tree.path_down(&best_hash, &fork);
        let mut to_connect = self.tree.path_down(&new_hash, &fork);
        to_connect.reverse();

        neutrond_log::log_info!(
            "reorganize: disconnect {} blocks, connect {} blocks, fork={}",
            to_disconnect.len(),
            to_connect.len(),
            hash256_to_hex(&fork),
        );

        let mut events = ChainEvents::default();
        let mut batch = WriteBatch::new();

        for hash in &to_disconnect {
            let node = self
                .tree
                .get(hash)
                .ok_or(ChainStateError::CorruptIndex("missing node to disconnect"))?
                .clone();
            let block = self.read_block(&node)?;
            self.disconnect_block(&block, &node, &mut batch, ctx)?;
            events.disconnected.push(block);
        }

        for hash in &to_connect {
            let node = self
                .tree
                .get(hash)
                .ok_or(ChainStateError::CorruptIndex("missing node to connect"))?
                .clone();
            let block = self.read_block(&node)?;
            self.connect_block(
                &block,
                &node,
                &mut batch,
                ctx,
                &ConnectOpts {
                    just_check: false,
                    reorganizing: true,
                    postponed,
                },
            )?;
            events.connected.push(block);
        }

        batch.put(Column::Meta, META_HASH_BEST_CHAIN, new_hash);
        // Commit before touching the in-memory pointers.
        self.store.write_batch(&batch)?;

        for hash in &to_disconnect {
            let prev = self.tree.get(hash).and_then(|node| node.prev);
            if let Some(prev) = prev {
                if let Some(parent) = self.tree.get_mut(&prev) {
                    parent.next_in_main = None;
                }
            }
            if let Some(node) = self.tree.get_mut(hash) {
                node.next_in_main = None;
            }
        }
        for hash in &to_connect {
            let prev = self.tree.get(hash).and_then(|node| node.prev);
            if let Some(prev) = prev {
                if let Some(parent) = self.tree.get_mut(&prev) {
                    parent.next_in_main = Some(*hash);
                }
            }
        }
        self.tree.set_best(Some(new_hash));

        neutrond_log::log_info!("reorganize done");
        Ok(events)
    }

    /// Stages one block's worth of index updates into `batch`, verifying
    /// every contextual rule on the way.
    fn connect_block(
        &mut self,
        block: &Block,
        node: &BlockIndexNode,
        batch: &mut WriteBatch,
        ctx: &ChainContext<'_>,
        opts: &ConnectOpts,
    ) -> Result<(), ChainStateError> {
        check_block(
            block,
            ctx.adjusted_now,
            self.params.is_testnet(),
            CheckBlockFlags {
                check_merkle: !opts.just_check,
                check_sig: false,
            },
        )?;

        let parent = node.prev.and_then(|prev| self.tree.get(&prev)).cloned();
        let height = node.height;

        let mut sigops = 0u32;
        let mut fees: Amount = 0;
        let mut value_in: Amount = 0;
        let mut value_out: Amount = 0;
        let mut stake_reward: Amount = 0;

        for (index, tx) in block.vtx.iter().enumerate() {
            let txid = tx.txid();

            // Never overwrite an older transaction that still has unspent
            // outputs (BIP30).
            if !opts.reorganizing {
                if let Some(existing) =
                    read_tx_index_staged(self.store.as_ref(), batch, &txid)?
                {
                    if existing.spent.iter().any(|pos| pos.is_null()) {
                        return Err(ChainStateError::invalid(
                            "tried to overwrite transaction",
                            50,
                        ));
                    }
                }
            }

            sigops += tx
                .vin
                .iter()
                .map(|input| sig_op_count(&input.script_sig, false))
                .sum::<u32>()
                + tx.vout
                    .iter()
                    .map(|output| sig_op_count(&output.script_pubkey, false))
                    .sum::<u32>();
            if sigops > MAX_BLOCK_SIGOPS {
                return Err(ChainStateError::invalid("too many sigops", 100));
            }

            let pos_this_tx = if opts.just_check {
                DiskTxPos::memory()
            } else {
                DiskTxPos::new(node.file, node.block_pos, block.tx_offset(index) as u32)
            };

            if tx.is_coinbase() {
                value_out += tx.value_out();
            } else {
                let mut inputs = match self.fetch_inputs(tx, batch, true, None) {
                    Ok(inputs) => inputs,
                    Err(FetchInputsError::Missing(_)) => {
                        return Err(ChainStateError::MissingInputs)
                    }
                    Err(FetchInputsError::Invalid(err)) => {
                        return Err(ChainStateError::Validation(err))
                    }
                    Err(FetchInputsError::Chain(err)) => return Err(*err),
                };

                for input in &tx.vin {
                    let fetched = &inputs[&input.prevout.hash];
                    let prev_output = &fetched.tx.vout[input.prevout.index as usize];
                    if solve(&prev_output.script_pubkey).0 == ScriptKind::ScriptHash {
                        sigops += p2sh_sig_op_count(&prev_output.script_pubkey, &input.script_sig);
                    }
                }
                if sigops > MAX_BLOCK_SIGOPS {
                    return Err(ChainStateError::invalid("too many sigops", 100));
                }

                let tx_value_in = Self::value_in(tx, &inputs);
                let tx_value_out = tx.value_out();
                value_in += tx_value_in;
                value_out += tx_value_out;
                if tx.is_coinstake() {
                    stake_reward = tx_value_out - tx_value_in;
                } else {
                    fees += tx_value_in - tx_value_out;
                }

                self.connect_inputs(
                    tx, &txid, &mut inputs, pos_this_tx, node, batch, ctx, opts,
                )?;

                if !tx.is_coinstake() {
                    if tx_value_in < tx_value_out {
                        return Err(ChainStateError::invalid("value in below value out", 100));
                    }
                    let tx_fee = tx_value_in - tx_value_out;
                    if tx_fee < min_fee(tx, 1, FeeMode::Block, tx.serialized_size()) {
                        return Err(ChainStateError::invalid("not paying required fee", 100));
                    }
                    if !money_range(fees) {
                        return Err(ChainStateError::invalid("fees out of range", 100));
                    }
                }
            }

            write_tx_index(
                batch,
                &txid,
                &TxIndexEntry::new(pos_this_tx, tx.vout.len()),
            );
        }

        let prev_supply = parent.as_ref().map(|p| p.money_supply).unwrap_or(0);
        let mint = value_out - value_in + fees;
        let money_supply = prev_supply + value_out - value_in;

        if block.is_proof_of_work() {
            let reward = proof_of_work_reward(fees, height, self.params.is_testnet());
            if height > HISTORIC_REWARD_CHECK_HEIGHT && block.vtx[0].value_out() > reward {
                return Err(ChainStateError::invalid("coinbase reward exceeded", 50));
            }
        } else {
            let coin_age = self.block_coin_age(block, ctx.print_coinage)?;
            let calculated = proof_of_stake_reward(coin_age, fees, height);
            if height > HISTORIC_REWARD_CHECK_HEIGHT && stake_reward > calculated {
                return Err(ChainStateError::invalid("coinstake pays too much", 100));
            }
            self.check_consensus_payouts(block, height, calculated, ctx, opts)?;
        }

        if opts.just_check {
            return Ok(());
        }

        // Stage the node record with its minting totals, and the parent's
        // forward pointer. Memory is updated only after the commit.
        {
            let mut updated = node.clone();
            updated.mint = mint;
            updated.money_supply = money_supply;
            write_block_index(batch, &updated);
        }
        if let Some(tree_node) = self.tree.get_mut(&node.hash) {
            tree_node.mint = mint;
            tree_node.money_supply = money_supply;
        }
        if let Some(parent) = parent {
            let mut updated = parent.clone();
            updated.next_in_main = Some(node.hash);
            write_block_index(batch, &updated);
        }

        for tx in &block.vtx {
            for listener in ctx.listeners {
                listener.sync_transaction(tx, Some(block), true);
            }
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn connect_inputs(
        &self,
        tx: &Transaction,
        txid: &Hash256,
        inputs: &mut HashMap<Hash256, FetchedInput>,
        pos_this_tx: DiskTxPos,
        node: &BlockIndexNode,
        batch: &mut WriteBatch,
        ctx: &ChainContext<'_>,
        opts: &ConnectOpts,
    ) -> Result<(), ChainStateError> {
        // Cheap checks over every input first.
        let mut value_in: Amount = 0;
        for input in &tx.vin {
            let fetched = &inputs[&input.prevout.hash];
            let prev_tx = &fetched.tx;

            if (prev_tx.is_coinbase() || prev_tx.is_coinstake())
                && self.spends_immature(&fetched.entry.pos, node)
            {
                return Err(ChainStateError::Rejected(
                    "tried to spend immature coinbase or coinstake",
                ));
            }

            if prev_tx.time > tx.time {
                return Err(ChainStateError::invalid(
                    "transaction timestamp earlier than input",
                    100,
                ));
            }

            let prev_value = prev_tx.vout[input.prevout.index as usize].value;
            value_in += prev_value;
            if !money_range(prev_value) || !money_range(value_in) {
                return Err(ChainStateError::invalid("txin values out of range", 100));
            }
        }

        // Expensive signature checks only after everything cheap passed.
        let skip_signatures = !ctx.check_signatures
            || self.tree.best_height() < self.params.total_blocks_estimate();

        for (input_index, input) in tx.vin.iter().enumerate() {
            let fetched = inputs
                .get_mut(&input.prevout.hash)
                .expect("fetched earlier");
            let spent_slot = &mut fetched.entry.spent[input.prevout.index as usize];

            if !spent_slot.is_null() {
                if opts.reorganizing {
                    // A postponed reconnect can race a block that already
                    // spent this output; tolerate and move on.
                    neutrond_log::log_debug!(
                        "skipping already connected input {} of {}",
                        input_index,
                        hash256_to_hex(txid),
                    );
                    continue;
                }
                return Err(ChainStateError::Rejected("input already spent"));
            }

            if !skip_signatures {
                verify_signature(&fetched.tx, tx, input_index, MANDATORY_SCRIPT_VERIFY_FLAGS)
                    .map_err(|_| ChainStateError::invalid("signature verification failed", 100))?;
            }

            *spent_slot = pos_this_tx;
        }

        // Write back the updated entries so the next transactions in the
        // block observe the spends.
        for input in &tx.vin {
            if let Some(fetched) = inputs.get(&input.prevout.hash) {
                if !fetched.entry.pos.is_memory() {
                    write_tx_index(batch, &input.prevout.hash, &fetched.entry);
                }
            }
        }

        Ok(())
    }

    /// Maturity check against the current tip, used by mempool admission.
    pub fn output_is_immature(&self, prev_pos: &DiskTxPos) -> bool {
        match self.tree.best_node() {
            Some(best) => {
                let best = best.clone();
                self.spends_immature(prev_pos, &best)
            }
            None => false,
        }
    }

    /// Whether the output at `prev_pos` was created within the maturity
    /// window below the block being connected.
    fn spends_immature(&self, prev_pos: &DiskTxPos, node: &BlockIndexNode) -> bool {
        let maturity = self.params.coinbase_maturity;
        let mut cursor = Some(node.clone());
        while let Some(current) = cursor {
            if node.height - current.height >= maturity {
                break;
            }
            if current.block_pos == prev_pos.block_pos && current.file == prev_pos.file {
                return true;
            }
            cursor = current
                .prev
                .as_ref()
                .and_then(|prev| self.tree.get(prev))
                .cloned();
        }
        false
    }

    /// Masternode and developer payment checks for a proof-of-stake block.
    fn check_consensus_payouts(
        &self,
        block: &Block,
        height: i32,
        calculated_reward: Amount,
        ctx: &ChainContext<'_>,
        opts: &ConnectOpts,
    ) -> Result<(), ChainStateError> {
        let required_mn = masternode_payment(height, calculated_reward);
        let required_dev = developer_payment(calculated_reward);

        if ctx.initial_download {
            if let Some(masternode) = ctx.masternode {
                masternode.add_past_winner(&block.vtx[1], required_mn, height);
            }
            neutrond_log::log_debug!(
                "initial download: skipping payment checks at height {height}"
            );
            return Ok(());
        }

        let synced = ctx.masternode.map(|mn| mn.is_synced()).unwrap_or(false);
        if synced {
            if let Some(masternode) = ctx.masternode {
                masternode.process_block(height + 1, opts.reorganizing);
                masternode.process_block(height + 2, opts.reorganizing);
                masternode.process_block(height + 3, opts.reorganizing);
            }
        }

        let dos_payments = ctx.sporks.value(SporkId::PaymentEnforcementDosValue) as u32;
        let enforce_winner = ctx
            .sporks
            .active(SporkId::MasternodeWinnerEnforcement, ctx.adjusted_now);
        let threshold = ctx.sporks.value(SporkId::PaymentEnforcementThreshold);

        let mut mn_payment_made = false;
        let mut block_payee: Vec<u8> = Vec::new();
        for output in &block.vtx[1].vout {
            if output.value == required_mn {
                mn_payment_made = true;
                block_payee = output.script_pubkey.clone();
            }
        }

        if !mn_payment_made {
            if height >= ENFORCE_MN_PAYMENT_HEIGHT {
                return Err(ChainStateError::invalid(
                    "stake does not pay masternode amount",
                    dos_payments,
                ));
            }
            neutrond_log::log_warn!("stake does not pay masternode amount at height {height}");
        }

        let block_age = ctx.adjusted_now - block.header.time as i64;
        if synced && block_age < MNPAYEE_MAX_BLOCK_AGE {
            let masternode = ctx.masternode.expect("synced implies manager");
            let mut paid_correct_mn = false;
            match masternode.block_payee(height) {
                Some(mut expected) => {
                    if block_payee == expected {
                        paid_correct_mn = true;
                    } else {
                        // The payment list may simply be out of sync;
                        // recompute once and retry.
                        neutrond_log::log_info!(
                            "masternode payee discrepancy at {height}, recalculating"
                        );
                        masternode.process_block(height, opts.reorganizing);
                        if let Some(recomputed) = masternode.block_payee(height) {
                            expected = recomputed;
                        }
                        paid_correct_mn = block_payee == expected;
                    }

                    if !paid_correct_mn
                        && enforce_winner
                        && opts.postponed.within_enforcement(threshold)
                    {
                        return Err(ChainStateError::invalid(
                            "stake does not pay correct masternode",
                            dos_payments,
                        ));
                    }
                }
                None => {
                    neutrond_log::log_warn!("no expected masternode payee for block {height}");
                }
            }

            let valid_mn_payment = mn_payment_made && paid_correct_mn;
            if !valid_mn_payment && opts.postponed.within_enforcement(threshold) {
                if enforce_winner {
                    return Err(ChainStateError::invalid(
                        "masternode payment missing or invalid",
                        dos_payments,
                    ));
                }
                neutrond_log::log_warn!("masternode payment missing or invalid at {height}");
            }
        } else if !synced {
            neutrond_log::log_debug!("masternode list not synced; payee check skipped");
        }

        let dev_script = &self.params.developer_script;
        let valid_dev_payment = block.vtx[1]
            .vout
            .iter()
            .any(|output| output.value == required_dev && &output.script_pubkey == dev_script);
        if !valid_dev_payment {
            if height >= ENFORCE_DEV_PAYMENT_HEIGHT {
                return Err(ChainStateError::invalid(
                    "block fails to pay developer payment",
                    dos_payments,
                ));
            }
            neutrond_log::log_warn!("developer payment missing at height {height} (not enforced)");
        }

        Ok(())
    }

    /// Reverses one block's index effects into `batch`.
    fn disconnect_block(
        &mut self,
        block: &Block,
        node: &BlockIndexNode,
        batch: &mut WriteBatch,
        ctx: &ChainContext<'_>,
    ) -> Result<(), ChainStateError> {
        for tx in block.vtx.iter().rev() {
            let txid = tx.txid();
            if !tx.is_coinbase() {
                for input in &tx.vin {
                    let Some(mut entry) =
                        read_tx_index_staged(self.store.as_ref(), batch, &input.prevout.hash)?
                    else {
                        return Err(ChainStateError::CorruptIndex(
                            "missing tx index while disconnecting",
                        ));
                    };
                    let index = input.prevout.index as usize;
                    if index >= entry.spent.len() {
                        return Err(ChainStateError::CorruptIndex(
                            "prevout out of range while disconnecting",
                        ));
                    }
                    entry.spent[index] = DiskTxPos::null();
                    write_tx_index(batch, &input.prevout.hash, &entry);
                }
            }
            // Erasing can no-op when a duplicate of this transaction was
            // reorganized away earlier; that is fine.
            erase_tx_index(batch, &txid);
        }

        if let Some(parent_hash) = node.prev {
            if let Some(parent) = self.tree.get(&parent_hash) {
                let mut updated = parent.clone();
                updated.next_in_main = None;
                write_block_index(batch, &updated);
            }
        }

        for tx in &block.vtx {
            for listener in ctx.listeners {
                listener.sync_transaction(tx, Some(block), false);
            }
        }

        Ok(())
    }

    /// Records the trust of a chain that failed validation so operators
    /// can spot a better-looking invalid fork.
    fn invalid_chain_found(&mut self, hash: &Hash256) -> Result<(), ChainStateError> {
        let Some(node) = self.tree.get(hash) else {
            return Ok(());
        };
        let trust = node.chain_trust_value();
        if trust > self.best_invalid_trust {
            self.best_invalid_trust = trust;
            let mut bytes = [0u8; 32];
            trust.to_little_endian(&mut bytes);
            self.store
                .put(Column::Meta, META_BEST_INVALID_TRUST, &bytes)?;
        }
        neutrond_log::log_warn!(
            "invalid chain found: block={} height={} trust={}",
            hash256_to_hex(hash),
            node.height,
            trust,
        );
        Ok(())
    }
}
