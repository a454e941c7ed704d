//! Block and message ingress: duplicate suppression, orphan buffering,
//! and routing of peer messages into the chain state and mempool.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use neutrond_chainstate::state::{ChainContext, ChainEvents, ChainState, ChainStateError};
use neutrond_chainstate::{BlockTree, ChainListener, MasternodePayments};
use neutrond_consensus::constants::{
    BIP31_VERSION, DEFAULT_MAX_TIP_AGE, MAX_ADDR_SZ, MAX_INV_SZ, MIN_PEER_PROTO_VERSION,
    MIN_PEER_PROTO_VERSION_AFTER_V4,
};
use neutrond_consensus::sporks::{SporkId, SporkSet};
use neutrond_consensus::{hash256_to_hex, Hash256};
use neutrond_pow::difficulty::{compact_to_u256, compute_min_stake, compute_min_work};
use neutrond_primitives::block::{Block, BlockHeader};
use neutrond_primitives::encoding::{
    decode, encode, Decodable, DecodeError, Decoder, Encodable, Encoder,
};
use neutrond_primitives::outpoint::OutPoint;
use neutrond_primitives::transaction::Transaction;

use crate::config::NodeOptions;
use crate::mempool::{Mempool, MempoolError, MempoolErrorKind};
use crate::protocol::{
    self, commands, decode_inv_vector, decode_locator, encode_inv_vector, encode_locator,
    encode_reject, Inv, InvKind, VersionMessage,
};

/// Ban threshold: a peer reaching this cumulative score is disconnected.
const BAN_SCORE: u32 = 100;
/// Cap on blocks announced per getblocks response.
const GETBLOCKS_LIMIT: usize = 500;
/// Cap on headers per getheaders response.
const GETHEADERS_LIMIT: usize = 2_000;

#[derive(Debug)]
pub enum ProcessError {
    AlreadyHave,
    DuplicateStake,
    Chain(ChainStateError),
    Mempool(MempoolError),
    Decode(DecodeError),
    Io(std::io::Error),
    Rejected(&'static str),
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::AlreadyHave => write!(f, "already have"),
            ProcessError::DuplicateStake => write!(f, "duplicate proof-of-stake"),
            ProcessError::Chain(err) => write!(f, "{err}"),
            ProcessError::Mempool(err) => write!(f, "{err}"),
            ProcessError::Decode(err) => write!(f, "{err}"),
            ProcessError::Io(err) => write!(f, "{err}"),
            ProcessError::Rejected(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ProcessError {}

impl From<ChainStateError> for ProcessError {
    fn from(err: ChainStateError) -> Self {
        ProcessError::Chain(err)
    }
}

impl From<MempoolError> for ProcessError {
    fn from(err: MempoolError) -> Self {
        ProcessError::Mempool(err)
    }
}

impl From<DecodeError> for ProcessError {
    fn from(err: DecodeError) -> Self {
        ProcessError::Decode(err)
    }
}

impl From<std::io::Error> for ProcessError {
    fn from(err: std::io::Error) -> Self {
        ProcessError::Io(err)
    }
}

/// Cooperative shutdown signal polled at loop heads.
#[derive(Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One connected peer, as the message processor sees it. The transport
/// drains `outbox` and applies `disconnect`.
pub struct Peer {
    pub id: u64,
    pub version: i32,
    pub services: u64,
    pub start_height: i32,
    pub misbehavior: u32,
    pub disconnect: bool,
    outbox: Vec<(&'static str, Vec<u8>)>,
    hash_continue: Option<Hash256>,
}

impl Peer {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            version: 0,
            services: 0,
            start_height: -1,
            misbehavior: 0,
            disconnect: false,
            outbox: Vec::new(),
            hash_continue: None,
        }
    }

    pub fn send(&mut self, command: &'static str, payload: Vec<u8>) {
        self.outbox.push((command, payload));
    }

    pub fn take_outbox(&mut self) -> Vec<(&'static str, Vec<u8>)> {
        std::mem::take(&mut self.outbox)
    }

    pub fn misbehaving(&mut self, reason: &str, score: u32) {
        self.misbehavior += score;
        neutrond_log::log_warn!(
            "peer {} misbehaving (+{score} => {}): {reason}",
            self.id,
            self.misbehavior,
        );
        if self.misbehavior >= BAN_SCORE {
            self.disconnect = true;
        }
    }

    fn push_get_blocks(&mut self, locator: Vec<Hash256>, hash_stop: Hash256) {
        self.send(commands::GETBLOCKS, encode_locator(&locator, &hash_stop));
    }

    fn ask_for(&mut self, invs: &[Inv]) {
        if !invs.is_empty() {
            self.send(commands::GETDATA, encode_inv_vector(invs));
        }
    }
}

/// Blocks whose parent is unknown, keyed both ways for transitive
/// promotion once the parent arrives.
#[derive(Default)]
struct OrphanBlockPool {
    by_hash: HashMap<Hash256, Block>,
    by_prev: HashMap<Hash256, Vec<Hash256>>,
    stakes_seen: HashSet<(OutPoint, u32)>,
}

impl OrphanBlockPool {
    fn contains(&self, hash: &Hash256) -> bool {
        self.by_hash.contains_key(hash)
    }

    fn has_dependents(&self, hash: &Hash256) -> bool {
        self.by_prev.contains_key(hash)
    }

    fn insert(&mut self, hash: Hash256, block: Block) {
        self.by_prev
            .entry(block.header.prev_block)
            .or_default()
            .push(hash);
        if block.is_proof_of_stake() {
            self.stakes_seen.insert(block.proof_of_stake());
        }
        self.by_hash.insert(hash, block);
    }

    fn remove(&mut self, hash: &Hash256) -> Option<Block> {
        let block = self.by_hash.remove(hash)?;
        if let Some(siblings) = self.by_prev.get_mut(&block.header.prev_block) {
            siblings.retain(|sibling| sibling != hash);
            if siblings.is_empty() {
                self.by_prev.remove(&block.header.prev_block);
            }
        }
        self.stakes_seen.remove(&block.proof_of_stake());
        Some(block)
    }

    fn children(&self, parent: &Hash256) -> Vec<Hash256> {
        self.by_prev.get(parent).cloned().unwrap_or_default()
    }

    /// Hash of the missing ancestor this orphan chain hangs from.
    fn root(&self, hash: &Hash256) -> Hash256 {
        let mut current = *hash;
        while let Some(block) = self.by_hash.get(&current) {
            current = block.header.prev_block;
        }
        current
    }
}

pub struct NodeState<S> {
    pub chain: Mutex<ChainState<S>>,
    pub mempool: Mutex<Mempool>,
    pub sporks: Mutex<SporkSet>,
    pub shutdown: ShutdownFlag,
    pub options: NodeOptions,
    orphan_blocks: Mutex<OrphanBlockPool>,
    pending_sync_checkpoint: Mutex<Option<Hash256>>,
    masternode: Option<Box<dyn MasternodePayments>>,
    listeners: Vec<Box<dyn ChainListener>>,
}

impl<S: neutrond_storage::KeyValueStore> NodeState<S> {
    pub fn new(chain: ChainState<S>, options: NodeOptions) -> Self {
        Self {
            chain: Mutex::new(chain),
            mempool: Mutex::new(Mempool::new(options.limit_free_relay, true)),
            sporks: Mutex::new(SporkSet::new()),
            shutdown: ShutdownFlag::new(),
            options,
            orphan_blocks: Mutex::new(OrphanBlockPool::default()),
            pending_sync_checkpoint: Mutex::new(None),
            masternode: None,
            listeners: Vec::new(),
        }
    }

    pub fn with_masternode(mut self, masternode: Box<dyn MasternodePayments>) -> Self {
        self.masternode = Some(masternode);
        self
    }

    pub fn add_listener(&mut self, listener: Box<dyn ChainListener>) {
        self.listeners.push(listener);
    }

    /// Install a sync checkpoint whose signature the checkpoint subsystem
    /// already verified.
    pub fn advance_sync_checkpoint(&self, hash: Hash256) -> Result<(), ProcessError> {
        let mut chain = self.chain.lock().expect("chain lock");
        chain.set_sync_checkpoint(hash)?;
        *self.pending_sync_checkpoint.lock().expect("pending lock") = None;
        Ok(())
    }

    pub fn orphan_block_count(&self) -> usize {
        self.orphan_blocks
            .lock()
            .expect("orphan lock")
            .by_hash
            .len()
    }

    fn pending_sync_checkpoint_wanted(&self, hash: &Hash256) -> bool {
        self.pending_sync_checkpoint
            .lock()
            .expect("pending lock")
            .map(|pending| pending == *hash)
            .unwrap_or(false)
    }
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

/// Initial block download: tip far behind wall-clock time or the best
/// hardened checkpoint.
pub fn is_initial_block_download<S: neutrond_storage::KeyValueStore>(
    chain: &ChainState<S>,
    now: i64,
) -> bool {
    let Some(best) = chain.tree().best_node() else {
        return true;
    };
    if best.height < chain.params().total_blocks_estimate() {
        return true;
    }
    (best.time as i64) < now - DEFAULT_MAX_TIP_AGE
}

/// Exponentially thinning block locator from the best chain tip.
pub fn block_locator(tree: &BlockTree) -> Vec<Hash256> {
    let mut locator = Vec::new();
    let mut step = 1i32;
    let mut height = tree.best_height();
    while height > 0 {
        if let Some(node) = tree.find_block_by_height(height) {
            locator.push(node.hash);
        }
        if locator.len() >= 10 {
            step *= 2;
        }
        height -= step;
    }
    if let Some(genesis) = tree.genesis_hash() {
        locator.push(genesis);
    }
    locator
}

fn chain_context<'a>(
    sporks: &'a SporkSet,
    masternode: Option<&'a dyn MasternodePayments>,
    listeners: &'a [&'a dyn ChainListener],
    now: i64,
    initial_download: bool,
    options: &NodeOptions,
) -> ChainContext<'a> {
    let mut ctx = ChainContext::new(sporks, now);
    ctx.initial_download = initial_download;
    ctx.masternode = masternode;
    ctx.listeners = listeners;
    ctx.print_coinage = options.print_coinage;
    ctx.print_coinstake = options.print_coinstake;
    ctx
}

/// Reconciles the mempool with a best-chain change: resurrect what fell
/// out, evict what got confirmed along with its conflicts.
fn reconcile_mempool<S: neutrond_storage::KeyValueStore>(
    chain: &ChainState<S>,
    mempool: &mut Mempool,
    events: &ChainEvents,
    now: i64,
) {
    for tx in events.resurrectable() {
        // Best effort: a resurrected transaction that now double-spends
        // a confirmed one simply fails admission.
        let _ = mempool.accept(chain, tx.clone(), false, false, now as u64);
    }
    for block in &events.connected {
        for tx in &block.vtx {
            mempool.remove(tx);
            mempool.remove_conflicts(tx);
        }
    }
}

fn spawn_blocknotify(options: &NodeOptions, best_hash: &Hash256) {
    let Some(command_template) = options.blocknotify.clone() else {
        return;
    };
    let command = command_template.replace("%s", &hash256_to_hex(best_hash));
    std::thread::spawn(move || {
        let status = std::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .status();
        if let Err(err) = status {
            neutrond_log::log_warn!("blocknotify command failed: {err}");
        }
    });
}

/// Orchestrates one candidate block: duplicate suppression, the
/// duplicate-stake rule, preliminary checks, orphan buffering, and the
/// orphan work-queue drain after acceptance.
pub fn process_new_block<S: neutrond_storage::KeyValueStore>(
    state: &NodeState<S>,
    mut peer: Option<&mut Peer>,
    block: Block,
) -> Result<bool, ProcessError> {
    let hash = block.hash();
    let now = now_secs();

    let mut chain = state.chain.lock().expect("chain lock");
    let initial_download = is_initial_block_download(&chain, now);

    if chain.tree().contains(&hash) {
        return Err(ProcessError::AlreadyHave);
    }
    {
        let orphans = state.orphan_blocks.lock().expect("orphan lock");
        if orphans.contains(&hash) {
            return Err(ProcessError::AlreadyHave);
        }
    }

    // Limited duplicity on stake: one blockchain entry per (outpoint,
    // time) pair unless an orphan child or pending checkpoint needs it.
    if !initial_download
        && block.is_proof_of_stake()
        && chain.tree().stake_seen(&block.proof_of_stake())
        && !state
            .orphan_blocks
            .lock()
            .expect("orphan lock")
            .has_dependents(&hash)
        && !state.pending_sync_checkpoint_wanted(&hash)
    {
        return Err(ProcessError::DuplicateStake);
    }

    neutrond_chainstate::check_block(
        &block,
        now,
        chain.params().is_testnet(),
        neutrond_chainstate::CheckBlockFlags::default(),
    )
    .map_err(|err| {
        if let Some(peer) = peer.as_deref_mut() {
            if err.dos > 0 {
                peer.misbehaving("invalid block", err.dos);
            }
        }
        ProcessError::Chain(ChainStateError::Validation(err))
    })?;

    // With a sync checkpoint on record, off-best-chain blocks must carry
    // a minimum plausible difficulty; this blunts fill-the-disk spam.
    if let Some(checkpoint_hash) = chain.sync_checkpoint() {
        let not_extending_best = Some(block.header.prev_block) != chain.best_hash();
        if not_extending_best && !state.pending_sync_checkpoint_wanted(&hash) {
            if let Some(checkpoint) = chain.tree().get(&checkpoint_hash) {
                let delta_time = block.header.time as i64 - checkpoint.time as i64;
                let required_bits = if block.is_proof_of_stake() {
                    let height = chain
                        .tree()
                        .get(&block.header.prev_block)
                        .map(|parent| parent.height + 1)
                        .unwrap_or(0);
                    let base = chain
                        .tree()
                        .last_block_index(&checkpoint_hash, true)
                        .map(|node| node.bits)
                        .unwrap_or(checkpoint.bits);
                    compute_min_stake(&chain.params().pos_limit(height), base, delta_time)
                } else {
                    let base = chain
                        .tree()
                        .last_block_index(&checkpoint_hash, false)
                        .map(|node| node.bits)
                        .unwrap_or(checkpoint.bits);
                    compute_min_work(&chain.params().pow_limit, base, delta_time)
                };

                let block_target = compact_to_u256(block.header.bits).unwrap_or_default();
                let required_target = compact_to_u256(required_bits).unwrap_or_default();
                if block_target > required_target {
                    if let Some(peer) = peer.as_deref_mut() {
                        peer.misbehaving("block with too little proof", 100);
                    }
                    return Err(ProcessError::Rejected("block with too little proof"));
                }
            }
        }
    }

    // Unknown parent: park the block and ask the sender to fill the gap.
    if !chain.tree().contains(&block.header.prev_block) {
        let mut orphans = state.orphan_blocks.lock().expect("orphan lock");
        neutrond_log::log_debug!(
            "orphan block {}, missing parent {}",
            hash256_to_hex(&hash),
            hash256_to_hex(&block.header.prev_block),
        );

        if block.is_proof_of_stake()
            && orphans.stakes_seen.contains(&block.proof_of_stake())
            && !orphans.has_dependents(&hash)
            && !state.pending_sync_checkpoint_wanted(&hash)
        {
            return Err(ProcessError::DuplicateStake);
        }

        let root = {
            orphans.insert(hash, block);
            orphans.root(&hash)
        };
        if let Some(peer) = peer.as_deref_mut() {
            peer.push_get_blocks(block_locator(chain.tree()), root);
            if !initial_download {
                peer.ask_for(&[Inv::block(root)]);
            }
        }
        return Ok(false);
    }

    // Parent known: accept, then drain any orphans this unblocks.
    let sporks = state.sporks.lock().expect("sporks lock").clone();
    let listener_refs: Vec<&dyn ChainListener> = state
        .listeners
        .iter()
        .map(|listener| listener.as_ref())
        .collect();
    let ctx = chain_context(
        &sporks,
        state.masternode.as_deref(),
        &listener_refs,
        now,
        initial_download,
        &state.options,
    );

    let mut events = chain.accept_block(&block, &ctx).map_err(|err| {
        // Persistence failures are fatal: abort rather than run with a
        // torn index.
        if matches!(
            err,
            ChainStateError::Store(_) | ChainStateError::FlatFile(_)
        ) {
            neutrond_log::log_error!("persistence failure, requesting shutdown: {err}");
            state.shutdown.request();
        } else if let Some(peer) = peer.as_deref_mut() {
            let score = if err.dos() > 0 { err.dos() } else { 5 };
            peer.misbehaving("accept block failed", score);
        }
        ProcessError::Chain(err)
    })?;

    // Work queue over newly connectable orphans; recursion is avoided so
    // adversarial chains cannot blow the stack.
    let mut work_queue = VecDeque::from([hash]);
    while let Some(parent) = work_queue.pop_front() {
        if state.shutdown.requested() {
            break;
        }
        let children = {
            let orphans = state.orphan_blocks.lock().expect("orphan lock");
            orphans.children(&parent)
        };
        for child_hash in children {
            let Some(orphan_block) = state
                .orphan_blocks
                .lock()
                .expect("orphan lock")
                .remove(&child_hash)
            else {
                continue;
            };
            match chain.accept_block(&orphan_block, &ctx) {
                Ok(orphan_events) => {
                    events.merge(orphan_events);
                    work_queue.push_back(child_hash);
                }
                Err(err) => {
                    neutrond_log::log_debug!(
                        "orphan {} rejected: {err}",
                        hash256_to_hex(&child_hash),
                    );
                }
            }
        }
    }

    if let Some((best_hash, _)) = events.new_best {
        let mut mempool = state.mempool.lock().expect("mempool lock");
        reconcile_mempool(&chain, &mut mempool, &events, now);
        drop(mempool);
        if !initial_download {
            spawn_blocknotify(&state.options, &best_hash);
        }
    }

    neutrond_log::log_debug!("block {} accepted", hash256_to_hex(&hash));
    Ok(true)
}

/// Do we already have this inventory item, anywhere?
fn already_have<S: neutrond_storage::KeyValueStore>(
    state: &NodeState<S>,
    chain: &ChainState<S>,
    inv: &Inv,
) -> bool {
    match inv.kind {
        InvKind::Tx => {
            let mempool = state.mempool.lock().expect("mempool lock");
            mempool.exists(&inv.hash)
                || mempool.has_orphan(&inv.hash)
                || chain.contains_tx(&inv.hash).unwrap_or(false)
        }
        InvKind::Block => {
            chain.tree().contains(&inv.hash)
                || state
                    .orphan_blocks
                    .lock()
                    .expect("orphan lock")
                    .contains(&inv.hash)
        }
    }
}

/// Routes one decoded peer message into the core.
pub fn process_message<S: neutrond_storage::KeyValueStore>(
    state: &NodeState<S>,
    peer: &mut Peer,
    command: &str,
    payload: &[u8],
) -> Result<(), ProcessError> {
    if state.options.drop_messages_test > 0
        && rand::random::<u64>() % state.options.drop_messages_test == 0
        && command != commands::VERSION
    {
        neutrond_log::log_debug!("dropmessagestest: dropping {command}");
        return Ok(());
    }

    match command {
        commands::VERSION => handle_version(state, peer, payload),
        commands::VERACK => Ok(()),
        commands::ADDR => handle_addr(peer, payload),
        commands::INV => handle_inv(state, peer, payload),
        commands::GETDATA => handle_getdata(state, peer, payload),
        commands::GETBLOCKS => handle_getblocks(state, peer, payload),
        commands::GETHEADERS => handle_getheaders(state, peer, payload),
        // Masternode-relayed transactions carry an extra signature block
        // the masternode subsystem checks; the embedded transaction goes
        // through normal admission.
        commands::TX | commands::DSTX => handle_tx(state, peer, payload),
        commands::BLOCK => {
            let block: Block = decode(payload)?;
            match process_new_block(state, Some(peer), block) {
                Ok(_) => Ok(()),
                Err(ProcessError::AlreadyHave) => Ok(()),
                Err(err) => {
                    neutrond_log::log_debug!("block message rejected: {err}");
                    Ok(())
                }
            }
        }
        commands::MEMPOOL => handle_mempool(state, peer),
        commands::PING => {
            if peer.version >= BIP31_VERSION {
                peer.send(commands::PONG, payload.to_vec());
            }
            Ok(())
        }
        commands::PONG => Ok(()),
        commands::ALERT => {
            // Alert signature checking and relay live outside the core.
            neutrond_log::log_debug!("alert received ({} bytes)", payload.len());
            Ok(())
        }
        commands::REJECT => {
            handle_reject(payload);
            Ok(())
        }
        commands::CHECKPOINT => handle_checkpoint(state, payload),
        _ => {
            neutrond_log::log_trace!("ignoring unknown message {command}");
            Ok(())
        }
    }
}

/// Minimum peer version currently admitted, per spork #13.
pub fn min_peer_version(sporks: &SporkSet, now: i64) -> i32 {
    if sporks.active(SporkId::ProtocolV4Enforcement, now) {
        MIN_PEER_PROTO_VERSION_AFTER_V4
    } else {
        MIN_PEER_PROTO_VERSION
    }
}

fn handle_version<S: neutrond_storage::KeyValueStore>(
    state: &NodeState<S>,
    peer: &mut Peer,
    payload: &[u8],
) -> Result<(), ProcessError> {
    if peer.version != 0 {
        peer.misbehaving("duplicate version message", 1);
        return Ok(());
    }
    let message = VersionMessage::decode(payload)?;

    let now = now_secs();
    let minimum = {
        let sporks = state.sporks.lock().expect("sporks lock");
        min_peer_version(&sporks, now)
    };
    if message.version < minimum {
        neutrond_log::log_info!(
            "peer {} uses obsolete version {}; disconnecting",
            peer.id,
            message.version,
        );
        peer.send(
            commands::REJECT,
            encode_reject(commands::VERSION, protocol::reject::OBSOLETE, "obsolete", None),
        );
        peer.disconnect = true;
        return Ok(());
    }

    peer.version = message.version;
    peer.services = message.services;
    peer.start_height = message.start_height;
    peer.send(commands::VERACK, Vec::new());

    // Start pulling the chain from the first peer that claims more of it.
    let chain = state.chain.lock().expect("chain lock");
    if message.start_height > chain.best_height() {
        peer.push_get_blocks(block_locator(chain.tree()), [0u8; 32]);
    }
    neutrond_log::log_info!(
        "peer {} version {} height {} ({})",
        peer.id,
        message.version,
        message.start_height,
        message.subversion,
    );
    Ok(())
}

fn handle_addr(peer: &mut Peer, payload: &[u8]) -> Result<(), ProcessError> {
    let mut decoder = Decoder::new(payload);
    let count = decoder.read_varint()? as usize;
    if count > MAX_ADDR_SZ {
        peer.misbehaving("oversized addr message", 20);
    }
    // Address management itself lives outside the chain-state core.
    Ok(())
}

fn handle_inv<S: neutrond_storage::KeyValueStore>(
    state: &NodeState<S>,
    peer: &mut Peer,
    payload: &[u8],
) -> Result<(), ProcessError> {
    let invs = decode_inv_vector(payload)?;
    if invs.len() > MAX_INV_SZ {
        peer.misbehaving("oversized inv message", 20);
        return Ok(());
    }

    let chain = state.chain.lock().expect("chain lock");
    let mut to_request = Vec::new();
    let last_index = invs.len().saturating_sub(1);

    for (index, inv) in invs.iter().enumerate() {
        let have = already_have(state, &chain, inv);
        if !have {
            to_request.push(*inv);
        } else if inv.kind == InvKind::Block {
            let orphans = state.orphan_blocks.lock().expect("orphan lock");
            if orphans.contains(&inv.hash) {
                let root = orphans.root(&inv.hash);
                drop(orphans);
                peer.push_get_blocks(block_locator(chain.tree()), root);
            } else if index == last_index && chain.tree().contains(&inv.hash) {
                // The peer's announcement ended on a block we know;
                // request the continuation of its chain.
                peer.push_get_blocks(block_locator(chain.tree()), [0u8; 32]);
            }
        }
    }

    peer.ask_for(&to_request);
    Ok(())
}

fn handle_getdata<S: neutrond_storage::KeyValueStore>(
    state: &NodeState<S>,
    peer: &mut Peer,
    payload: &[u8],
) -> Result<(), ProcessError> {
    let invs = decode_inv_vector(payload)?;
    if invs.len() > MAX_INV_SZ {
        peer.misbehaving("oversized getdata message", 20);
        return Ok(());
    }

    let chain = state.chain.lock().expect("chain lock");
    for inv in &invs {
        match inv.kind {
            InvKind::Block => {
                if let Some(block) = chain.read_block_by_hash(&inv.hash)? {
                    peer.send(commands::BLOCK, encode(&block));

                    // Trigger the continuation the peer parked earlier.
                    if peer.hash_continue == Some(inv.hash) {
                        if let Some(best) = chain.best_hash() {
                            peer.send(
                                commands::INV,
                                encode_inv_vector(&[Inv::block(best)]),
                            );
                        }
                        peer.hash_continue = None;
                    }
                }
            }
            InvKind::Tx => {
                let mempool = state.mempool.lock().expect("mempool lock");
                if let Some(tx) = mempool.get(&inv.hash) {
                    peer.send(commands::TX, encode(tx));
                }
            }
        }
    }
    Ok(())
}

fn handle_getblocks<S: neutrond_storage::KeyValueStore>(
    state: &NodeState<S>,
    peer: &mut Peer,
    payload: &[u8],
) -> Result<(), ProcessError> {
    let (locator, hash_stop) = decode_locator(payload)?;
    let chain = state.chain.lock().expect("chain lock");
    let tree = chain.tree();

    // First locator entry on our main chain marks the fork point.
    let mut start = tree.genesis_hash();
    for hash in &locator {
        if tree.is_in_main_chain(hash) {
            start = Some(*hash);
            break;
        }
    }

    let mut invs = Vec::new();
    let mut current = start
        .and_then(|hash| tree.get(&hash))
        .and_then(|node| node.next_in_main);
    while let Some(hash) = current {
        if hash == hash_stop {
            break;
        }
        invs.push(Inv::block(hash));
        if invs.len() >= GETBLOCKS_LIMIT {
            // Let the peer come back for more after fetching this batch.
            peer.hash_continue = Some(hash);
            break;
        }
        current = tree.get(&hash).and_then(|node| node.next_in_main);
    }

    if !invs.is_empty() {
        peer.send(commands::INV, encode_inv_vector(&invs));
    }
    Ok(())
}

fn handle_getheaders<S: neutrond_storage::KeyValueStore>(
    state: &NodeState<S>,
    peer: &mut Peer,
    payload: &[u8],
) -> Result<(), ProcessError> {
    let (locator, hash_stop) = decode_locator(payload)?;
    let chain = state.chain.lock().expect("chain lock");
    let tree = chain.tree();

    let mut current = if locator.is_empty() {
        // A bare hash request.
        if tree.is_in_main_chain(&hash_stop) {
            Some(hash_stop)
        } else {
            None
        }
    } else {
        let mut start = tree.genesis_hash();
        for hash in &locator {
            if tree.is_in_main_chain(hash) {
                start = Some(*hash);
                break;
            }
        }
        start
            .and_then(|hash| tree.get(&hash))
            .and_then(|node| node.next_in_main)
    };

    let mut headers: Vec<BlockHeader> = Vec::new();
    while let Some(hash) = current {
        let Some(node) = tree.get(&hash) else {
            break;
        };
        headers.push(BlockHeader {
            version: node.version,
            prev_block: node.prev.unwrap_or([0u8; 32]),
            merkle_root: chain
                .read_block(node)
                .map(|block| block.header.merkle_root)
                .unwrap_or([0u8; 32]),
            time: node.time,
            bits: node.bits,
            nonce: node.nonce,
        });
        if headers.len() >= GETHEADERS_LIMIT || hash == hash_stop {
            break;
        }
        current = node.next_in_main;
    }

    let mut encoder = Encoder::new();
    encoder.write_varint(headers.len() as u64);
    for header in &headers {
        header.consensus_encode(&mut encoder);
        encoder.write_varint(0);
    }
    peer.send(commands::HEADERS, encoder.into_inner());
    Ok(())
}

fn handle_tx<S: neutrond_storage::KeyValueStore>(
    state: &NodeState<S>,
    peer: &mut Peer,
    payload: &[u8],
) -> Result<(), ProcessError> {
    // Decode leniently: dstx carries masternode attestation bytes after
    // the transaction itself.
    let mut decoder = Decoder::new(payload);
    let tx = Transaction::consensus_decode(&mut decoder)?;
    let txid = tx.txid();
    let now = now_secs();

    let chain = state.chain.lock().expect("chain lock");
    let mut mempool = state.mempool.lock().expect("mempool lock");

    match mempool.accept(&chain, tx.clone(), true, true, now as u64) {
        Ok(_) => {
            mempool.erase_orphan(&txid);

            // Promote any orphans this transaction unblocks, breadth
            // first.
            let mut work_queue = VecDeque::from([txid]);
            while let Some(parent) = work_queue.pop_front() {
                for orphan_id in mempool.orphans_waiting_on(&parent) {
                    let Some(orphan_tx) = mempool.orphan(&orphan_id) else {
                        continue;
                    };
                    match mempool.accept(&chain, orphan_tx, true, true, now as u64) {
                        Ok(accepted) => {
                            neutrond_log::log_debug!(
                                "accepted orphan tx {}",
                                hash256_to_hex(&accepted),
                            );
                            mempool.erase_orphan(&orphan_id);
                            work_queue.push_back(orphan_id);
                        }
                        Err(err) if err.kind == MempoolErrorKind::MissingInputs => {}
                        Err(_) => {
                            // Invalid for good; drop it from the pool.
                            mempool.erase_orphan(&orphan_id);
                        }
                    }
                }
            }
            Ok(())
        }
        Err(err) if err.kind == MempoolErrorKind::MissingInputs => {
            mempool.add_orphan(tx);
            let evicted = mempool.limit_orphans_default();
            if evicted > 0 {
                neutrond_log::log_debug!("orphan pool overflow, evicted {evicted}");
            }
            Ok(())
        }
        Err(err) => {
            if err.dos > 0 {
                peer.misbehaving("invalid transaction", err.dos);
            }
            neutrond_log::log_debug!("tx {} rejected: {err}", hash256_to_hex(&txid));
            Ok(())
        }
    }
}

fn handle_mempool<S: neutrond_storage::KeyValueStore>(
    state: &NodeState<S>,
    peer: &mut Peer,
) -> Result<(), ProcessError> {
    let mempool = state.mempool.lock().expect("mempool lock");
    let invs: Vec<Inv> = mempool
        .query_hashes()
        .into_iter()
        .take(MAX_INV_SZ)
        .map(Inv::tx)
        .collect();
    if !invs.is_empty() {
        peer.send(commands::INV, encode_inv_vector(&invs));
    }
    Ok(())
}

fn handle_reject(payload: &[u8]) {
    let mut decoder = Decoder::new(payload);
    let message = decoder.read_var_str().unwrap_or_default();
    let code = decoder.read_u8().unwrap_or(0);
    let reason = decoder.read_var_str().unwrap_or_default();
    neutrond_log::log_debug!("peer rejected {message} (0x{code:02x}): {reason}");
}

fn handle_checkpoint<S: neutrond_storage::KeyValueStore>(
    state: &NodeState<S>,
    payload: &[u8],
) -> Result<(), ProcessError> {
    // The checkpoint subsystem verifies the master signature before the
    // chain moves; here the claim is only recorded as pending.
    let mut decoder = Decoder::new(payload);
    let hash = decoder.read_hash_le()?;
    *state
        .pending_sync_checkpoint
        .lock()
        .expect("pending lock") = Some(hash);
    neutrond_log::log_info!("pending sync checkpoint {}", hash256_to_hex(&hash));
    Ok(())
}

/// Replays magic-framed block records from a bootstrap file.
pub fn load_external_block_file<S: neutrond_storage::KeyValueStore>(
    state: &NodeState<S>,
    path: &Path,
) -> Result<usize, ProcessError> {
    let magic = {
        let chain = state.chain.lock().expect("chain lock");
        chain.params().message_start
    };

    let mut bytes = Vec::new();
    std::fs::File::open(path)?.read_to_end(&mut bytes)?;

    let mut loaded = 0usize;
    let mut pos = 0usize;
    while pos + 8 <= bytes.len() {
        if state.shutdown.requested() {
            break;
        }
        if bytes[pos..pos + 4] != magic {
            pos += 1;
            continue;
        }
        let size = u32::from_le_bytes(
            bytes[pos + 4..pos + 8]
                .try_into()
                .expect("slice length"),
        ) as usize;
        let start = pos + 8;
        let Some(record) = bytes.get(start..start + size) else {
            break;
        };
        pos = start + size;

        match decode::<Block>(record) {
            Ok(block) => match process_new_block(state, None, block) {
                Ok(true) => loaded += 1,
                Ok(false) | Err(ProcessError::AlreadyHave) => {}
                Err(err) => {
                    neutrond_log::log_debug!("import: block rejected: {err}");
                }
            },
            Err(err) => {
                neutrond_log::log_debug!("import: undecodable record: {err}");
            }
        }
    }

    neutrond_log::log_info!("imported {loaded} blocks from {}", path.display());
    Ok(loaded)
}
