//! In-memory block index tree and its on-disk records.

use std::collections::{HashMap, HashSet};

use neutrond_consensus::Hash256;
use neutrond_primitives::encoding::{DecodeError, Decoder, Encodable, Encoder};
use neutrond_primitives::outpoint::OutPoint;
use neutrond_storage::{Column, KeyValueStore, StoreError, WriteBatch};
use primitive_types::U256;

const FLAG_PROOF_OF_STAKE: u32 = 1 << 0;
const FLAG_STAKE_ENTROPY: u32 = 1 << 1;
const FLAG_GENERATED_MODIFIER: u32 = 1 << 2;

const MEDIAN_TIME_SPAN: usize = 11;

/// One node of the block index. Nodes are created when a block is
/// accepted and never freed during a run; `next_in_main` is only mutated
/// by set-best-chain and reorganize under the chain lock.
#[derive(Clone, Debug)]
pub struct BlockIndexNode {
    pub hash: Hash256,
    pub prev: Option<Hash256>,
    pub next_in_main: Option<Hash256>,
    pub height: i32,
    pub file: u32,
    pub block_pos: u32,
    pub version: i32,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub proof_of_stake: bool,
    pub stake_entropy_bit: bool,
    pub generated_stake_modifier: bool,
    pub prevout_stake: OutPoint,
    pub stake_time: u32,
    pub stake_modifier: u64,
    pub stake_modifier_checksum: u32,
    pub hash_proof: Hash256,
    pub chain_trust: [u8; 32],
    pub mint: i64,
    pub money_supply: i64,
}

impl BlockIndexNode {
    pub fn chain_trust_value(&self) -> U256 {
        U256::from_big_endian(&self.chain_trust)
    }

    pub fn set_chain_trust(&mut self, trust: U256) {
        trust.to_big_endian(&mut self.chain_trust);
    }

    pub fn is_proof_of_work(&self) -> bool {
        !self.proof_of_stake
    }

    fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.proof_of_stake {
            flags |= FLAG_PROOF_OF_STAKE;
        }
        if self.stake_entropy_bit {
            flags |= FLAG_STAKE_ENTROPY;
        }
        if self.generated_stake_modifier {
            flags |= FLAG_GENERATED_MODIFIER;
        }
        flags
    }

    /// Serialized record stored under `Column::BlockIndex`. The next-hash
    /// pointer is persisted explicitly so the main chain can be rebuilt
    /// without replaying trust comparisons.
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_hash_le(&self.hash);
        encoder.write_hash_le(&self.prev.unwrap_or([0u8; 32]));
        encoder.write_hash_le(&self.next_in_main.unwrap_or([0u8; 32]));
        encoder.write_i32_le(self.height);
        encoder.write_u32_le(self.file);
        encoder.write_u32_le(self.block_pos);
        encoder.write_i32_le(self.version);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
        encoder.write_u32_le(self.flags());
        self.prevout_stake.consensus_encode(&mut encoder);
        encoder.write_u32_le(self.stake_time);
        encoder.write_u64_le(self.stake_modifier);
        encoder.write_u32_le(self.stake_modifier_checksum);
        encoder.write_hash_le(&self.hash_proof);
        encoder.write_bytes(&self.chain_trust);
        encoder.write_i64_le(self.mint);
        encoder.write_i64_le(self.money_supply);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let hash = decoder.read_hash_le()?;
        let prev = decoder.read_hash_le()?;
        let next = decoder.read_hash_le()?;
        let height = decoder.read_i32_le()?;
        let file = decoder.read_u32_le()?;
        let block_pos = decoder.read_u32_le()?;
        let version = decoder.read_i32_le()?;
        let time = decoder.read_u32_le()?;
        let bits = decoder.read_u32_le()?;
        let nonce = decoder.read_u32_le()?;
        let flags = decoder.read_u32_le()?;
        let prevout_stake = {
            let hash = decoder.read_hash_le()?;
            let index = decoder.read_u32_le()?;
            OutPoint { hash, index }
        };
        let stake_time = decoder.read_u32_le()?;
        let stake_modifier = decoder.read_u64_le()?;
        let stake_modifier_checksum = decoder.read_u32_le()?;
        let hash_proof = decoder.read_hash_le()?;
        let chain_trust = decoder.read_fixed::<32>()?;
        let mint = decoder.read_i64_le()?;
        let money_supply = decoder.read_i64_le()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            hash,
            prev: if prev == [0u8; 32] { None } else { Some(prev) },
            next_in_main: if next == [0u8; 32] { None } else { Some(next) },
            height,
            file,
            block_pos,
            version,
            time,
            bits,
            nonce,
            proof_of_stake: (flags & FLAG_PROOF_OF_STAKE) != 0,
            stake_entropy_bit: (flags & FLAG_STAKE_ENTROPY) != 0,
            generated_stake_modifier: (flags & FLAG_GENERATED_MODIFIER) != 0,
            prevout_stake,
            stake_time,
            stake_modifier,
            stake_modifier_checksum,
            hash_proof,
            chain_trust,
            mint,
            money_supply,
        })
    }
}

pub fn write_block_index(batch: &mut WriteBatch, node: &BlockIndexNode) {
    batch.put(Column::BlockIndex, node.hash, node.encode());
}

/// The block index: every accepted block, keyed by hash, with hash-keyed
/// parent and next-in-main edges.
#[derive(Default)]
pub struct BlockTree {
    nodes: HashMap<Hash256, BlockIndexNode>,
    genesis: Option<Hash256>,
    best: Option<Hash256>,
    /// (stake outpoint, stake time) pairs of accepted PoS blocks; used to
    /// reject duplicate stakes.
    stakes_seen: HashSet<(OutPoint, u32)>,
}

impl BlockTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.nodes.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash256) -> Option<&BlockIndexNode> {
        self.nodes.get(hash)
    }

    pub fn get_mut(&mut self, hash: &Hash256) -> Option<&mut BlockIndexNode> {
        self.nodes.get_mut(hash)
    }

    pub fn genesis_hash(&self) -> Option<Hash256> {
        self.genesis
    }

    pub fn best_hash(&self) -> Option<Hash256> {
        self.best
    }

    pub fn best_node(&self) -> Option<&BlockIndexNode> {
        self.best.and_then(|hash| self.nodes.get(&hash))
    }

    pub fn best_height(&self) -> i32 {
        self.best_node().map(|node| node.height).unwrap_or(-1)
    }

    pub fn best_trust(&self) -> U256 {
        self.best_node()
            .map(|node| node.chain_trust_value())
            .unwrap_or_default()
    }

    pub fn set_best(&mut self, hash: Option<Hash256>) {
        self.best = hash;
    }

    /// Inserts a node; the first node without a known parent becomes the
    /// genesis anchor.
    pub fn insert(&mut self, node: BlockIndexNode) {
        if node.prev.is_none() {
            self.genesis = Some(node.hash);
        }
        if node.proof_of_stake {
            self.stakes_seen
                .insert((node.prevout_stake.clone(), node.stake_time));
        }
        self.nodes.insert(node.hash, node);
    }

    pub fn stake_seen(&self, stake: &(OutPoint, u32)) -> bool {
        self.stakes_seen.contains(stake)
    }

    pub fn note_stake(&mut self, stake: (OutPoint, u32)) {
        self.stakes_seen.insert(stake);
    }

    pub fn prev_of(&self, hash: &Hash256) -> Option<&BlockIndexNode> {
        self.nodes
            .get(hash)
            .and_then(|node| node.prev.as_ref())
            .and_then(|prev| self.nodes.get(prev))
    }

    /// Is `hash` on the path of `next_in_main` pointers from genesis?
    pub fn is_in_main_chain(&self, hash: &Hash256) -> bool {
        let Some(node) = self.nodes.get(hash) else {
            return false;
        };
        node.next_in_main.is_some() || self.best == Some(node.hash)
    }

    /// Main-chain node at `height`, walking back from the tip.
    pub fn find_block_by_height(&self, height: i32) -> Option<&BlockIndexNode> {
        if height < 0 {
            return None;
        }
        let mut node = self.best_node()?;
        if height > node.height {
            return None;
        }
        while node.height > height {
            node = self.nodes.get(node.prev.as_ref()?)?;
        }
        Some(node)
    }

    /// Walks backward from `hash` to the nearest block of the requested
    /// consensus kind, the block itself included.
    pub fn last_block_index(&self, hash: &Hash256, proof_of_stake: bool) -> Option<&BlockIndexNode> {
        let mut node = self.nodes.get(hash)?;
        while node.proof_of_stake != proof_of_stake {
            node = self.nodes.get(node.prev.as_ref()?)?;
        }
        Some(node)
    }

    /// Median timestamp of the last eleven blocks ending at `hash`.
    pub fn median_time_past(&self, hash: &Hash256) -> i64 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut current = self.nodes.get(hash);
        while let Some(node) = current {
            times.push(node.time as i64);
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            current = node.prev.as_ref().and_then(|prev| self.nodes.get(prev));
        }
        if times.is_empty() {
            return 0;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// Last common ancestor of two nodes, walking the higher side down.
    pub fn find_fork(&self, a: &Hash256, b: &Hash256) -> Option<Hash256> {
        let mut fork = self.nodes.get(a)?;
        let mut longer = self.nodes.get(b)?;
        while fork.hash != longer.hash {
            while longer.height > fork.height {
                longer = self.nodes.get(longer.prev.as_ref()?)?;
            }
            if fork.hash == longer.hash {
                break;
            }
            fork = self.nodes.get(fork.prev.as_ref()?)?;
        }
        Some(fork.hash)
    }

    /// Path from (excluded) `ancestor` up to (included) `tip`, ordered
    /// tip-first as disconnect order requires.
    pub fn path_down(&self, tip: &Hash256, ancestor: &Hash256) -> Vec<Hash256> {
        let mut path = Vec::new();
        let mut current = *tip;
        while &current != ancestor {
            path.push(current);
            match self.nodes.get(&current).and_then(|node| node.prev) {
                Some(prev) => current = prev,
                None => break,
            }
        }
        path
    }
}

/// Loads every block index record from the store into a tree, restoring
/// the best pointer from the given hash.
pub fn load_block_tree<S: KeyValueStore>(
    store: &S,
    best_hash: Option<Hash256>,
) -> Result<BlockTree, StoreError> {
    let mut tree = BlockTree::new();
    let records = store.scan_prefix(Column::BlockIndex, &[])?;
    for (_, value) in records {
        let node = BlockIndexNode::decode(&value)
            .map_err(|err| StoreError::Backend(format!("invalid block index record: {err}")))?;
        tree.insert(node);
    }
    if let Some(best) = best_hash {
        if tree.contains(&best) {
            tree.set_best(Some(best));
        }
    }
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(tag: u8, prev: Option<Hash256>, height: i32, pos: bool) -> BlockIndexNode {
        let mut node = BlockIndexNode {
            hash: [tag; 32],
            prev,
            next_in_main: None,
            height,
            file: 1,
            block_pos: 8,
            version: 7,
            time: 1_000 + height as u32 * 80,
            bits: 0x1e0f_ffff,
            nonce: 0,
            proof_of_stake: pos,
            stake_entropy_bit: tag % 2 == 0,
            generated_stake_modifier: false,
            prevout_stake: OutPoint::null(),
            stake_time: 0,
            stake_modifier: 0,
            stake_modifier_checksum: 0,
            hash_proof: [0u8; 32],
            chain_trust: [0u8; 32],
            mint: 0,
            money_supply: 0,
        };
        node.set_chain_trust(U256::from((height + 1) as u64));
        node
    }

    fn linear_tree(kinds: &[bool]) -> BlockTree {
        let mut tree = BlockTree::new();
        let mut prev = None;
        for (height, pos) in kinds.iter().enumerate() {
            let n = node(height as u8 + 1, prev, height as i32, *pos);
            prev = Some(n.hash);
            tree.insert(n);
        }
        tree.set_best(prev);
        // Thread the main-chain next pointers.
        let hashes: Vec<Hash256> = (0..kinds.len()).map(|i| [i as u8 + 1; 32]).collect();
        for pair in hashes.windows(2) {
            tree.get_mut(&pair[0]).expect("node").next_in_main = Some(pair[1]);
        }
        tree
    }

    #[test]
    fn record_roundtrip() {
        let mut original = node(9, Some([8u8; 32]), 42, true);
        original.prevout_stake = OutPoint::new([3u8; 32], 1);
        original.stake_time = 777;
        original.stake_modifier = 0xfeed;
        original.next_in_main = Some([10u8; 32]);
        let decoded = BlockIndexNode::decode(&original.encode()).expect("decode");
        assert_eq!(decoded.hash, original.hash);
        assert_eq!(decoded.prev, original.prev);
        assert_eq!(decoded.next_in_main, original.next_in_main);
        assert_eq!(decoded.height, original.height);
        assert!(decoded.proof_of_stake);
        assert_eq!(decoded.prevout_stake, original.prevout_stake);
        assert_eq!(decoded.chain_trust, original.chain_trust);
    }

    #[test]
    fn height_lookup_walks_from_tip() {
        let tree = linear_tree(&[false, false, false, true, true]);
        assert_eq!(tree.best_height(), 4);
        assert_eq!(tree.find_block_by_height(2).expect("node").height, 2);
        assert!(tree.find_block_by_height(9).is_none());
    }

    #[test]
    fn last_block_index_skips_other_kind() {
        let tree = linear_tree(&[false, false, true, false, true]);
        let tip = tree.best_hash().expect("tip");
        let last_pow = tree.last_block_index(&tip, false).expect("pow");
        assert_eq!(last_pow.height, 3);
        let last_pos = tree.last_block_index(&tip, true).expect("pos");
        assert_eq!(last_pos.height, 4);
    }

    #[test]
    fn median_time_past_is_middle_value() {
        let tree = linear_tree(&[false; 5]);
        let tip = tree.best_hash().expect("tip");
        // Times are 1000, 1080, .. 1320; the median of five is 1160.
        assert_eq!(tree.median_time_past(&tip), 1_160);
    }

    #[test]
    fn fork_point_of_branches() {
        let mut tree = linear_tree(&[false, false, false]);
        // Branch off height 1 with two extra nodes.
        tree.insert(node(0x21, Some([2u8; 32]), 2, false));
        tree.insert(node(0x22, Some([0x21; 32]), 3, false));

        let fork = tree
            .find_fork(&[3u8; 32], &[0x22u8; 32])
            .expect("fork point");
        assert_eq!(fork, [2u8; 32]);

        let path = tree.path_down(&[0x22u8; 32], &fork);
        assert_eq!(path, vec![[0x22u8; 32], [0x21u8; 32]]);
    }

    #[test]
    fn load_restores_nodes_and_best() {
        use neutrond_storage::memory::MemoryStore;

        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        let genesis = node(1, None, 0, false);
        let child = node(2, Some(genesis.hash), 1, false);
        write_block_index(&mut batch, &genesis);
        write_block_index(&mut batch, &child);
        store.write_batch(&batch).expect("commit");

        let tree = load_block_tree(&store, Some(child.hash)).expect("load");
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.best_height(), 1);
        assert_eq!(tree.genesis_hash(), Some(genesis.hash));
    }
}
