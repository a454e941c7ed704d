//! Signature hashing for transaction inputs.

use neutrond_consensus::Hash256;
use neutrond_primitives::encoding::{Encodable, Encoder};
use neutrond_primitives::hash::sha256d;
use neutrond_primitives::transaction::Transaction;

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_NONE: u32 = 0x02;
pub const SIGHASH_SINGLE: u32 = 0x03;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SighashType(pub u32);

impl SighashType {
    pub fn base_type(self) -> u32 {
        self.0 & 0x1f
    }

    pub fn has_anyone_can_pay(self) -> bool {
        (self.0 & SIGHASH_ANYONECANPAY) != 0
    }
}

#[derive(Debug)]
pub enum SighashError {
    InputIndexOutOfRange,
    MissingOutput,
}

impl std::fmt::Display for SighashError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SighashError::InputIndexOutOfRange => write!(f, "input index out of range"),
            SighashError::MissingOutput => write!(f, "no matching output for SIGHASH_SINGLE"),
        }
    }
}

impl std::error::Error for SighashError {}

/// Hash committed to by a signature on `tx.vin[input_index]`, with
/// `script_code` standing in for the scriptSig being satisfied.
pub fn signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    sighash_type: SighashType,
) -> Result<Hash256, SighashError> {
    if input_index >= tx.vin.len() {
        return Err(SighashError::InputIndexOutOfRange);
    }

    let anyone_can_pay = sighash_type.has_anyone_can_pay();
    let hash_single = sighash_type.base_type() == SIGHASH_SINGLE;
    let hash_none = sighash_type.base_type() == SIGHASH_NONE;

    if hash_single && input_index >= tx.vout.len() {
        return Err(SighashError::MissingOutput);
    }

    let mut encoder = Encoder::new();
    encoder.write_i32_le(tx.version);
    encoder.write_u32_le(tx.time);

    let input_count = if anyone_can_pay { 1 } else { tx.vin.len() };
    encoder.write_varint(input_count as u64);
    for idx in 0..input_count {
        let actual_index = if anyone_can_pay { input_index } else { idx };
        let input = &tx.vin[actual_index];
        input.prevout.consensus_encode(&mut encoder);
        let is_signing = actual_index == input_index;
        if is_signing {
            encoder.write_var_bytes(script_code);
        } else {
            encoder.write_varint(0);
        }
        if !is_signing && (hash_single || hash_none) {
            encoder.write_u32_le(0);
        } else {
            encoder.write_u32_le(input.sequence);
        }
    }

    let output_count = if hash_none {
        0
    } else if hash_single {
        input_index + 1
    } else {
        tx.vout.len()
    };
    encoder.write_varint(output_count as u64);
    for idx in 0..output_count {
        if hash_single && idx != input_index {
            // Blanked output: value -1, empty script.
            encoder.write_i64_le(-1);
            encoder.write_varint(0);
        } else {
            tx.vout[idx].consensus_encode(&mut encoder);
        }
    }

    encoder.write_u32_le(tx.lock_time);
    encoder.write_u32_le(sighash_type.0);

    Ok(sha256d(&encoder.into_inner()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use neutrond_primitives::outpoint::OutPoint;
    use neutrond_primitives::transaction::{TxIn, TxOut};

    fn sample_tx() -> Transaction {
        Transaction {
            version: 1,
            time: 1_600_000_000,
            vin: vec![
                TxIn {
                    prevout: OutPoint::new([1u8; 32], 0),
                    script_sig: vec![0xde, 0xad],
                    sequence: u32::MAX,
                },
                TxIn {
                    prevout: OutPoint::new([2u8; 32], 1),
                    script_sig: vec![0xbe, 0xef],
                    sequence: 5,
                },
            ],
            vout: vec![
                TxOut {
                    value: 10,
                    script_pubkey: vec![0x51],
                },
                TxOut {
                    value: 20,
                    script_pubkey: vec![0x52],
                },
            ],
            lock_time: 0,
        }
    }

    #[test]
    fn script_sig_is_replaced_by_script_code() {
        let tx = sample_tx();
        let a = signature_hash(&tx, 0, &[0xac], SighashType(SIGHASH_ALL)).expect("hash");
        let mut modified = tx.clone();
        modified.vin[0].script_sig = vec![0x99];
        let b = signature_hash(&modified, 0, &[0xac], SighashType(SIGHASH_ALL)).expect("hash");
        assert_eq!(a, b);
    }

    #[test]
    fn all_commits_to_outputs() {
        let tx = sample_tx();
        let a = signature_hash(&tx, 0, &[0xac], SighashType(SIGHASH_ALL)).expect("hash");
        let mut modified = tx.clone();
        modified.vout[1].value = 21;
        let b = signature_hash(&modified, 0, &[0xac], SighashType(SIGHASH_ALL)).expect("hash");
        assert_ne!(a, b);
    }

    #[test]
    fn none_ignores_outputs() {
        let tx = sample_tx();
        let a = signature_hash(&tx, 0, &[0xac], SighashType(SIGHASH_NONE)).expect("hash");
        let mut modified = tx.clone();
        modified.vout.clear();
        let b = signature_hash(&modified, 0, &[0xac], SighashType(SIGHASH_NONE)).expect("hash");
        assert_eq!(a, b);
    }

    #[test]
    fn single_ignores_later_outputs() {
        let tx = sample_tx();
        let a = signature_hash(&tx, 0, &[0xac], SighashType(SIGHASH_SINGLE)).expect("hash");
        let mut modified = tx.clone();
        modified.vout[1].value = 999;
        let b = signature_hash(&modified, 0, &[0xac], SighashType(SIGHASH_SINGLE)).expect("hash");
        assert_eq!(a, b);
    }

    #[test]
    fn single_without_matching_output_fails() {
        let mut tx = sample_tx();
        tx.vout.truncate(1);
        assert!(matches!(
            signature_hash(&tx, 1, &[0xac], SighashType(SIGHASH_SINGLE)),
            Err(SighashError::MissingOutput)
        ));
    }

    #[test]
    fn anyone_can_pay_ignores_other_inputs() {
        let tx = sample_tx();
        let flags = SighashType(SIGHASH_ALL | SIGHASH_ANYONECANPAY);
        let a = signature_hash(&tx, 0, &[0xac], flags).expect("hash");
        let mut modified = tx.clone();
        modified.vin[1].sequence = 77;
        modified.vin[1].prevout = OutPoint::new([9u8; 32], 9);
        let b = signature_hash(&modified, 0, &[0xac], flags).expect("hash");
        assert_eq!(a, b);
    }

    #[test]
    fn commits_to_tx_time() {
        let tx = sample_tx();
        let a = signature_hash(&tx, 0, &[0xac], SighashType(SIGHASH_ALL)).expect("hash");
        let mut modified = tx.clone();
        modified.time += 1;
        let b = signature_hash(&modified, 0, &[0xac], SighashType(SIGHASH_ALL)).expect("hash");
        assert_ne!(a, b);
    }
}
