//! End-to-end block ingress: proof-of-stake acceptance, the duplicate
//! stake rule, and orphan block promotion through the work queue.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use neutrond_chainstate::flatfiles::BlockFileStore;
use neutrond_chainstate::state::{ChainContext, ChainState};
use neutrond_chainstate::validation::coinbase_height_prefix;
use neutrond_consensus::money::COIN;
use neutrond_consensus::params::{chain_params, Network};
use neutrond_consensus::sporks::SporkSet;
use neutrond_consensus::Hash256;
use neutrond_node::config::NodeOptions;
use neutrond_node::process::{process_new_block, NodeState, Peer, ProcessError};
use neutrond_primitives::block::{Block, BlockHeader};
use neutrond_primitives::outpoint::OutPoint;
use neutrond_primitives::transaction::{Transaction, TxIn, TxOut};
use neutrond_script::sighash::{signature_hash, SighashType, SIGHASH_ALL};
use neutrond_storage::memory::MemoryStore;
use secp256k1::{PublicKey, Secp256k1, SecretKey};

const SPACING: u32 = 80;
/// Stake ages are measured against the wall clock the ingress path uses,
/// so the scaffold chain is anchored a few hours in the past.
const SCAFFOLD_AGE: i64 = 20_000;

struct Wallet {
    secp: Secp256k1<secp256k1::All>,
    secret: SecretKey,
    pubkey: PublicKey,
}

impl Wallet {
    fn new() -> Self {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[0x2au8; 32]).expect("secret key");
        let pubkey = PublicKey::from_secret_key(&secp, &secret);
        Self {
            secp,
            secret,
            pubkey,
        }
    }

    fn p2pk_script(&self) -> Vec<u8> {
        let serialized = self.pubkey.serialize();
        let mut script = Vec::with_capacity(serialized.len() + 2);
        script.push(serialized.len() as u8);
        script.extend_from_slice(&serialized);
        script.push(0xac);
        script
    }

    fn sign_input(&self, tx: &Transaction, input_index: usize, prev_script: &[u8]) -> Vec<u8> {
        let sighash = signature_hash(tx, input_index, prev_script, SighashType(SIGHASH_ALL))
            .expect("sighash");
        let message = secp256k1::Message::from_digest_slice(&sighash).expect("message");
        let signature = self.secp.sign_ecdsa(&message, &self.secret);
        let mut der = signature.serialize_der().to_vec();
        der.push(SIGHASH_ALL as u8);

        let mut script_sig = Vec::with_capacity(der.len() + 1);
        script_sig.push(der.len() as u8);
        script_sig.extend_from_slice(&der);
        script_sig
    }

    fn sign_block(&self, block: &mut Block) {
        let message =
            secp256k1::Message::from_digest_slice(&block.hash()).expect("message");
        let signature = self.secp.sign_ecdsa(&message, &self.secret);
        block.block_sig = signature.serialize_der().to_vec();
    }
}

fn coinbase(height: i32, time: u32, value: i64, script_pubkey: Vec<u8>) -> Transaction {
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
            value,
            script_pubkey,
        }],
        lock_time: 0,
    }
}

fn empty_coinbase(height: i32, time: u32) -> Transaction {
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
            script_pubkey: Vec::new(),
        }],
        lock_time: 0,
    }
}

fn seal_block(mut block: Block) -> Block {
    block.header.merkle_root = block.merkle_root();
    block
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_secs() as i64
}

/// Aligns a timestamp down to the coinstake timestamp mask boundary.
fn mask_align(time: i64) -> u32 {
    (time & !15) as u32
}

struct Harness {
    state: NodeState<MemoryStore>,
    wallet: Wallet,
    /// Coinbase txids of the scaffold blocks, oldest first.
    coinbases: Vec<Hash256>,
    scaffold_tip: Hash256,
    pos_bits: u32,
}

/// Proof-of-work scaffold built directly against the chain state (the
/// kernel needs aged, indexed outputs to stake), then handed to the
/// ingress path for the proof-of-stake blocks under test.
fn harness() -> Harness {
    let wallet = Wallet::new();
    let dir = tempfile::tempdir().expect("tempdir");
    let params = chain_params(Network::Testnet);
    let pos_bits =
        neutrond_pow::difficulty::target_to_compact(&params.pos_limit(0));
    let blocks = BlockFileStore::new(dir.path(), params.message_start).expect("flat files");
    std::mem::forget(dir);
    let mut chain = ChainState::new(Arc::new(MemoryStore::new()), blocks, params);
    chain.load_block_index().expect("load index");

    let start_time = (now_secs() - SCAFFOLD_AGE) as u32;
    let genesis = seal_block(Block {
        header: BlockHeader {
            version: 7,
            prev_block: [0u8; 32],
            merkle_root: [0u8; 32],
            time: start_time,
            bits: neutrond_pow::difficulty::target_to_compact(
                &chain_params(Network::Testnet).pow_limit,
            ),
            nonce: 0,
        },
        vtx: vec![coinbase(0, start_time, 0, vec![0x51])],
        block_sig: Vec::new(),
    });
    chain.initialize_genesis(&genesis).expect("genesis");

    let sporks = SporkSet::new();
    let mut ctx = ChainContext::new(&sporks, now_secs());
    ctx.check_proofs = false;
    ctx.check_signatures = false;
    ctx.initial_download = true;

    let mut coinbases = Vec::new();
    for nonce in 1..=12u32 {
        let parent = chain.tree().best_node().expect("tip").clone();
        let height = parent.height + 1;
        let time = parent.time + SPACING;
        let bits = chain.next_target_required(&parent.hash, false);
        let cb = coinbase(height, time, 50_000 * COIN, wallet.p2pk_script());
        coinbases.push(cb.txid());
        let block = seal_block(Block {
            header: BlockHeader {
                version: 7,
                prev_block: parent.hash,
                merkle_root: [0u8; 32],
                time,
                bits,
                nonce,
            },
            vtx: vec![cb],
            block_sig: Vec::new(),
        });
        chain.accept_block(&block, &ctx).expect("accept scaffold");
    }
    let scaffold_tip = chain.best_hash().expect("tip");

    let state = NodeState::new(chain, NodeOptions::default());
    Harness {
        state,
        wallet,
        coinbases,
        scaffold_tip,
        pos_bits,
    }
}

impl Harness {
    /// A signed proof-of-stake block staking `stake_txid`'s output.
    fn pos_block(
        &self,
        parent_hash: Hash256,
        height: i32,
        stake_txid: Hash256,
        time: u32,
        payout_extra: i64,
    ) -> Block {
        let script = self.wallet.p2pk_script();
        let mut coinstake = Transaction {
            version: 1,
            time,
            vin: vec![TxIn {
                prevout: OutPoint::new(stake_txid, 0),
                script_sig: Vec::new(),
                sequence: u32::MAX,
            }],
            vout: vec![
                TxOut {
                    value: 0,
                    script_pubkey: Vec::new(),
                },
                TxOut {
                    value: 50_000 * COIN + payout_extra,
                    script_pubkey: script.clone(),
                },
            ],
            lock_time: 0,
        };
        coinstake.vin[0].script_sig = self.wallet.sign_input(&coinstake, 0, &script);

        let mut block = seal_block(Block {
            header: BlockHeader {
                version: 7,
                prev_block: parent_hash,
                merkle_root: [0u8; 32],
                time,
                bits: self.pos_bits,
                nonce: 0,
            },
            vtx: vec![empty_coinbase(height, time), coinstake],
            block_sig: Vec::new(),
        });
        self.wallet.sign_block(&mut block);
        block
    }
}

#[test]
fn proof_of_stake_block_is_accepted() {
    let harness = harness();
    let time = mask_align(now_secs() - 1_800);
    let block = harness.pos_block(harness.scaffold_tip, 13, harness.coinbases[0], time, 0);

    let accepted =
        process_new_block(&harness.state, None, block.clone()).expect("process");
    assert!(accepted);

    let chain = harness.state.chain.lock().expect("chain lock");
    assert_eq!(chain.best_hash(), Some(block.hash()));
    assert_eq!(chain.best_height(), 13);
    let tip = chain.tree().best_node().expect("tip");
    assert!(tip.proof_of_stake);
    assert_eq!(tip.prevout_stake, OutPoint::new(harness.coinbases[0], 0));
}

#[test]
fn duplicate_stake_is_rejected() {
    let harness = harness();
    let time = mask_align(now_secs() - 1_800);
    let first = harness.pos_block(harness.scaffold_tip, 13, harness.coinbases[0], time, 0);
    process_new_block(&harness.state, None, first).expect("first stake");

    // Same stake outpoint and stake time, different payout, no orphan
    // depends on it: rejected outright.
    let rival = harness.pos_block(harness.scaffold_tip, 13, harness.coinbases[0], time, 7);
    let err = process_new_block(&harness.state, None, rival).unwrap_err();
    assert!(matches!(err, ProcessError::DuplicateStake));
}

#[test]
fn orphan_block_is_promoted_when_parent_arrives() {
    let harness = harness();
    let t1 = mask_align(now_secs() - 1_800);
    let t2 = t1 + 32;

    let first = harness.pos_block(harness.scaffold_tip, 13, harness.coinbases[0], t1, 0);
    let second = harness.pos_block(first.hash(), 14, harness.coinbases[1], t2, 0);

    // Child first: parked as an orphan, and the peer is asked to close
    // the gap.
    let mut peer = Peer::new(1);
    let accepted =
        process_new_block(&harness.state, Some(&mut peer), second.clone()).expect("orphan");
    assert!(!accepted);
    assert_eq!(harness.state.orphan_block_count(), 1);
    let outbox = peer.take_outbox();
    assert!(outbox.iter().any(|(command, _)| *command == "getblocks"));

    // Parent arrives: both connect in order and the orphan pool drains.
    let accepted = process_new_block(&harness.state, None, first).expect("parent");
    assert!(accepted);
    assert_eq!(harness.state.orphan_block_count(), 0);

    let chain = harness.state.chain.lock().expect("chain lock");
    assert_eq!(chain.best_height(), 14);
    assert_eq!(chain.best_hash(), Some(second.hash()));
}

#[test]
fn known_block_is_reported_as_duplicate() {
    let harness = harness();
    let time = mask_align(now_secs() - 1_800);
    let block = harness.pos_block(harness.scaffold_tip, 13, harness.coinbases[0], time, 0);

    process_new_block(&harness.state, None, block.clone()).expect("first");
    let err = process_new_block(&harness.state, None, block).unwrap_err();
    assert!(matches!(err, ProcessError::AlreadyHave));
}
