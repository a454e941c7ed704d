//! Block header and block types.

use neutrond_consensus::Hash256;

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;
use crate::transaction::Transaction;

pub const CURRENT_BLOCK_VERSION: i32 = 7;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn hash(&self) -> Hash256 {
        let mut encoder = Encoder::new();
        self.consensus_encode(&mut encoder);
        sha256d(&encoder.into_inner())
    }
}

impl Encodable for BlockHeader {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash_le(&self.prev_block);
        encoder.write_hash_le(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            prev_block: decoder.read_hash_le()?,
            merkle_root: decoder.read_hash_le()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub vtx: Vec<Transaction>,
    /// Signature over the block hash by the staker's key; empty for
    /// proof-of-work blocks.
    pub block_sig: Vec<u8>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// Hash checked against the compact target for proof-of-work blocks.
    pub fn pow_hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn is_proof_of_stake(&self) -> bool {
        self.vtx.len() > 1 && self.vtx[1].is_coinstake()
    }

    pub fn is_proof_of_work(&self) -> bool {
        !self.is_proof_of_stake()
    }

    /// The (stake outpoint, stake time) pair identifying this block's
    /// proof of stake; null for proof-of-work blocks.
    pub fn proof_of_stake(&self) -> (OutPoint, u32) {
        if self.is_proof_of_stake() {
            (self.vtx[1].vin[0].prevout.clone(), self.vtx[1].time)
        } else {
            (OutPoint::null(), 0)
        }
    }

    pub fn merkle_root(&self) -> Hash256 {
        let txids: Vec<Hash256> = self.vtx.iter().map(|tx| tx.txid()).collect();
        merkle_root(&txids).0
    }

    /// Stake entropy bit, harvested from the low bit of the block hash.
    pub fn stake_entropy_bit(&self) -> bool {
        (self.hash()[0] & 1) != 0
    }

    pub fn serialized_size(&self) -> usize {
        let mut encoder = Encoder::new();
        self.consensus_encode(&mut encoder);
        encoder.len()
    }

    /// Byte offset of `vtx[index]` inside the serialized block. Used to
    /// record per-transaction disk positions.
    pub fn tx_offset(&self, index: usize) -> usize {
        let mut encoder = Encoder::new();
        self.header.consensus_encode(&mut encoder);
        encoder.write_varint(self.vtx.len() as u64);
        let mut offset = encoder.len();
        for tx in self.vtx.iter().take(index) {
            offset += tx.serialized_size();
        }
        offset
    }
}

impl Encodable for Block {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.header.consensus_encode(encoder);
        encoder.write_varint(self.vtx.len() as u64);
        for tx in &self.vtx {
            tx.consensus_encode(encoder);
        }
        encoder.write_var_bytes(&self.block_sig);
    }
}

impl Decodable for Block {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let header = BlockHeader::consensus_decode(decoder)?;
        let count = decoder.read_varint()?;
        let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
        let mut vtx = Vec::with_capacity(count);
        for _ in 0..count {
            vtx.push(Transaction::consensus_decode(decoder)?);
        }
        let block_sig = decoder.read_var_bytes()?;
        Ok(Self {
            header,
            vtx,
            block_sig,
        })
    }
}

/// Computes the merkle root over txids, reporting whether the tree shape
/// is mutated by a duplicated terminal pair (CVE-2012-2459).
pub fn merkle_root(txids: &[Hash256]) -> (Hash256, bool) {
    if txids.is_empty() {
        return ([0u8; 32], false);
    }
    let mut layer = txids.to_vec();
    let mut mutated = false;
    while layer.len() > 1 {
        let size = layer.len();
        let mut next = Vec::with_capacity(size.div_ceil(2));
        let mut i = 0usize;
        while i < size {
            let i2 = if i + 1 < size { i + 1 } else { i };
            if i2 == i + 1 && i2 + 1 == size && layer[i] == layer[i2] {
                mutated = true;
            }
            let mut data = Vec::with_capacity(64);
            data.extend_from_slice(&layer[i]);
            data.extend_from_slice(&layer[i2]);
            next.push(sha256d(&data));
            i += 2;
        }
        layer = next;
    }
    (layer[0], mutated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{decode, encode};
    use crate::transaction::{TxIn, TxOut};

    fn coinbase() -> Transaction {
        Transaction {
            version: 1,
            time: 100,
            vin: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig: vec![0x01, 0x02],
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value: 0,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    fn coinstake() -> Transaction {
        Transaction {
            version: 1,
            time: 100,
            vin: vec![TxIn {
                prevout: OutPoint::new([3u8; 32], 0),
                script_sig: Vec::new(),
                sequence: u32::MAX,
            }],
            vout: vec![
                TxOut {
                    value: 0,
                    script_pubkey: Vec::new(),
                },
                TxOut {
                    value: 500,
                    script_pubkey: vec![0xac],
                },
            ],
            lock_time: 0,
        }
    }

    fn sample_block(vtx: Vec<Transaction>) -> Block {
        Block {
            header: BlockHeader {
                version: CURRENT_BLOCK_VERSION,
                prev_block: [1u8; 32],
                merkle_root: [2u8; 32],
                time: 100,
                bits: 0x1e0f_ffff,
                nonce: 7,
            },
            vtx,
            block_sig: Vec::new(),
        }
    }

    #[test]
    fn roundtrip() {
        let block = sample_block(vec![coinbase(), coinstake()]);
        let bytes = encode(&block);
        let decoded: Block = decode(&bytes).expect("decode");
        assert_eq!(decoded, block);
    }

    #[test]
    fn stake_detection() {
        assert!(sample_block(vec![coinbase(), coinstake()]).is_proof_of_stake());
        assert!(sample_block(vec![coinbase()]).is_proof_of_work());
    }

    #[test]
    fn tx_offsets_match_serialization() {
        let block = sample_block(vec![coinbase(), coinstake()]);
        let bytes = encode(&block);
        for (index, tx) in block.vtx.iter().enumerate() {
            let offset = block.tx_offset(index);
            let tx_bytes = encode(tx);
            assert_eq!(&bytes[offset..offset + tx_bytes.len()], &tx_bytes[..]);
        }
    }

    #[test]
    fn merkle_mutation_detects_terminal_pair() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let c = [3u8; 32];
        assert!(!merkle_root(&[a, a, b, c]).1);
        assert!(merkle_root(&[a, b, c, c]).1);
        assert!(!merkle_root(&[a, b, c]).1);
    }
}
