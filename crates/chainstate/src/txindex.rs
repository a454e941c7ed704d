//! Per-transaction disk index with spent-output tracking.

use neutrond_consensus::Hash256;
use neutrond_primitives::encoding::{DecodeError, Decoder, Encoder};
use neutrond_storage::{Column, KeyValueStore, StoreError, WriteBatch};

/// Position of a serialized transaction: block file number, offset of the
/// block record inside it, and the transaction's offset inside the block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DiskTxPos {
    pub file: u32,
    pub block_pos: u32,
    pub tx_pos: u32,
}

impl DiskTxPos {
    pub fn new(file: u32, block_pos: u32, tx_pos: u32) -> Self {
        Self {
            file,
            block_pos,
            tx_pos,
        }
    }

    pub fn null() -> Self {
        Self {
            file: u32::MAX,
            block_pos: 0,
            tx_pos: 0,
        }
    }

    /// Sentinel for transactions that live in the mempool, not on disk.
    pub fn memory() -> Self {
        Self {
            file: 1,
            block_pos: 1,
            tx_pos: 1,
        }
    }

    pub fn is_null(&self) -> bool {
        self.file == u32::MAX
    }

    pub fn is_memory(&self) -> bool {
        *self == Self::memory()
    }

    pub fn encode_to(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.file);
        encoder.write_u32_le(self.block_pos);
        encoder.write_u32_le(self.tx_pos);
    }

    pub fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            file: decoder.read_u32_le()?,
            block_pos: decoder.read_u32_le()?,
            tx_pos: decoder.read_u32_le()?,
        })
    }
}

/// A transaction's index record: where it lives on disk and, per output,
/// the position of the transaction spending it (null while unspent).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxIndexEntry {
    pub pos: DiskTxPos,
    pub spent: Vec<DiskTxPos>,
}

impl TxIndexEntry {
    pub fn new(pos: DiskTxPos, outputs: usize) -> Self {
        Self {
            pos,
            spent: vec![DiskTxPos::null(); outputs],
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.pos.encode_to(&mut encoder);
        encoder.write_varint(self.spent.len() as u64);
        for pos in &self.spent {
            pos.encode_to(&mut encoder);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let pos = DiskTxPos::decode_from(&mut decoder)?;
        let count = decoder.read_varint()?;
        let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
        let mut spent = Vec::with_capacity(count);
        for _ in 0..count {
            spent.push(DiskTxPos::decode_from(&mut decoder)?);
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self { pos, spent })
    }
}

pub fn read_tx_index<S: KeyValueStore>(
    store: &S,
    txid: &Hash256,
) -> Result<Option<TxIndexEntry>, StoreError> {
    let bytes = match store.get(Column::TxIndex, txid)? {
        Some(bytes) => bytes,
        None => return Ok(None),
    };
    TxIndexEntry::decode(&bytes)
        .map(Some)
        .map_err(|err| StoreError::Backend(format!("invalid tx index entry: {err}")))
}

/// Reads through a pending batch first so staged updates are visible to
/// later transactions in the same block or reorganization.
pub fn read_tx_index_staged<S: KeyValueStore>(
    store: &S,
    batch: &WriteBatch,
    txid: &Hash256,
) -> Result<Option<TxIndexEntry>, StoreError> {
    if let Some(staged) = batch.staged(Column::TxIndex, txid) {
        return match staged {
            Some(bytes) => TxIndexEntry::decode(bytes)
                .map(Some)
                .map_err(|err| StoreError::Backend(format!("invalid tx index entry: {err}"))),
            None => Ok(None),
        };
    }
    read_tx_index(store, txid)
}

pub fn write_tx_index(batch: &mut WriteBatch, txid: &Hash256, entry: &TxIndexEntry) {
    batch.put(Column::TxIndex, txid, entry.encode());
}

pub fn erase_tx_index(batch: &mut WriteBatch, txid: &Hash256) {
    batch.delete(Column::TxIndex, txid);
}

#[cfg(test)]
mod tests {
    use super::*;
    use neutrond_storage::memory::MemoryStore;

    #[test]
    fn entry_roundtrip() {
        let mut entry = TxIndexEntry::new(DiskTxPos::new(1, 500, 90), 3);
        entry.spent[1] = DiskTxPos::new(2, 10, 81);
        let decoded = TxIndexEntry::decode(&entry.encode()).expect("decode");
        assert_eq!(decoded, entry);
        assert!(decoded.spent[0].is_null());
        assert!(!decoded.spent[1].is_null());
    }

    #[test]
    fn memory_sentinel() {
        assert!(DiskTxPos::memory().is_memory());
        assert!(!DiskTxPos::memory().is_null());
        assert!(DiskTxPos::null().is_null());
    }

    #[test]
    fn staged_reads_see_batch() {
        let store = MemoryStore::new();
        let txid = [7u8; 32];
        let entry = TxIndexEntry::new(DiskTxPos::new(1, 0, 81), 1);
        store
            .put(Column::TxIndex, &txid, &entry.encode())
            .expect("put");

        let mut batch = WriteBatch::new();
        let mut updated = entry.clone();
        updated.spent[0] = DiskTxPos::new(1, 900, 81);
        write_tx_index(&mut batch, &txid, &updated);

        let read = read_tx_index_staged(&store, &batch, &txid)
            .expect("read")
            .expect("entry");
        assert_eq!(read, updated);

        erase_tx_index(&mut batch, &txid);
        assert!(read_tx_index_staged(&store, &batch, &txid)
            .expect("read")
            .is_none());

        // The store itself is untouched until commit.
        assert_eq!(
            read_tx_index(&store, &txid).expect("read").expect("entry"),
            entry
        );
    }
}
