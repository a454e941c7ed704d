//! Script interpreter and signature verification.

use neutrond_primitives::hash::{hash160, sha256, sha256d};
use neutrond_primitives::transaction::Transaction;
use ripemd::{Digest as RipemdDigest, Ripemd160};
use secp256k1::{ecdsa::Signature, Message, PublicKey};
use sha1::Sha1;

use crate::secp::secp256k1_verify;
use crate::sighash::{signature_hash, SighashType, SIGHASH_NONE, SIGHASH_SINGLE};
use crate::standard::{is_push_only, solve, ScriptKind};

pub type ScriptFlags = u32;

pub const SCRIPT_VERIFY_NONE: ScriptFlags = 0;
pub const SCRIPT_VERIFY_P2SH: ScriptFlags = 1 << 0;
pub const SCRIPT_VERIFY_STRICTENC: ScriptFlags = 1 << 1;
pub const SCRIPT_VERIFY_LOW_S: ScriptFlags = 1 << 2;
pub const SCRIPT_VERIFY_NULLDUMMY: ScriptFlags = 1 << 3;
pub const SCRIPT_VERIFY_SIGPUSHONLY: ScriptFlags = 1 << 4;
pub const SCRIPT_VERIFY_MINIMALDATA: ScriptFlags = 1 << 5;
pub const SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS: ScriptFlags = 1 << 6;
pub const SCRIPT_VERIFY_CLEANSTACK: ScriptFlags = 1 << 7;

pub const MANDATORY_SCRIPT_VERIFY_FLAGS: ScriptFlags = SCRIPT_VERIFY_P2SH;
pub const STANDARD_SCRIPT_VERIFY_FLAGS: ScriptFlags = MANDATORY_SCRIPT_VERIFY_FLAGS
    | SCRIPT_VERIFY_STRICTENC
    | SCRIPT_VERIFY_LOW_S
    | SCRIPT_VERIFY_NULLDUMMY
    | SCRIPT_VERIFY_MINIMALDATA
    | SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS
    | SCRIPT_VERIFY_CLEANSTACK;

const OP_0: u8 = 0x00;
const OP_PUSHDATA1: u8 = 0x4c;
const OP_PUSHDATA2: u8 = 0x4d;
const OP_PUSHDATA4: u8 = 0x4e;
const OP_1NEGATE: u8 = 0x4f;
const OP_1: u8 = 0x51;
const OP_16: u8 = 0x60;
const OP_NOP: u8 = 0x61;
const OP_IF: u8 = 0x63;
const OP_NOTIF: u8 = 0x64;
const OP_ELSE: u8 = 0x67;
const OP_ENDIF: u8 = 0x68;
const OP_VERIFY: u8 = 0x69;
const OP_RETURN: u8 = 0x6a;
const OP_2DROP: u8 = 0x6d;
const OP_2DUP: u8 = 0x6e;
const OP_DROP: u8 = 0x75;
const OP_DUP: u8 = 0x76;
const OP_SWAP: u8 = 0x7c;
const OP_SIZE: u8 = 0x82;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_RIPEMD160: u8 = 0xa6;
const OP_SHA1: u8 = 0xa7;
const OP_SHA256: u8 = 0xa8;
const OP_HASH160: u8 = 0xa9;
const OP_HASH256: u8 = 0xaa;
const OP_CODESEPARATOR: u8 = 0xab;
const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKSIGVERIFY: u8 = 0xad;
const OP_CHECKMULTISIG: u8 = 0xae;
const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;
const OP_NOP1: u8 = 0xb0;
const OP_NOP10: u8 = 0xb9;

const MAX_SCRIPT_SIZE: usize = 10_000;
const MAX_STACK_SIZE: usize = 1_000;
const MAX_OPS_PER_SCRIPT: usize = 201;

#[derive(Debug)]
pub enum ScriptError {
    StackUnderflow,
    StackOverflow,
    EvalFalse,
    InvalidOpcode,
    OpCount,
    ScriptSize,
    SigEncoding,
    PubkeyEncoding,
    SigHashType,
    SigCheck,
    SigPushOnly,
    NullDummy,
    MinimalData,
    NestedScriptHash,
    UnbalancedConditional,
    InputIndexOutOfRange,
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptError::StackUnderflow => write!(f, "script stack underflow"),
            ScriptError::StackOverflow => write!(f, "script stack overflow"),
            ScriptError::EvalFalse => write!(f, "script evaluated to false"),
            ScriptError::InvalidOpcode => write!(f, "invalid opcode"),
            ScriptError::OpCount => write!(f, "operation count exceeded"),
            ScriptError::ScriptSize => write!(f, "script too large"),
            ScriptError::SigEncoding => write!(f, "invalid signature encoding"),
            ScriptError::PubkeyEncoding => write!(f, "invalid public key encoding"),
            ScriptError::SigHashType => write!(f, "invalid sighash type"),
            ScriptError::SigCheck => write!(f, "signature check failed"),
            ScriptError::SigPushOnly => write!(f, "scriptSig is not push-only"),
            ScriptError::NullDummy => write!(f, "null dummy element required"),
            ScriptError::MinimalData => write!(f, "non-minimal push"),
            ScriptError::NestedScriptHash => write!(f, "nested pay-to-script-hash"),
            ScriptError::UnbalancedConditional => write!(f, "unbalanced conditional"),
            ScriptError::InputIndexOutOfRange => write!(f, "input index out of range"),
        }
    }
}

impl std::error::Error for ScriptError {}

/// Verifies that `script_sig` satisfies `script_pubkey` for the given
/// input of `tx`, including pay-to-script-hash redemption.
pub fn verify_script(
    script_sig: &[u8],
    script_pubkey: &[u8],
    tx: &Transaction,
    input_index: usize,
    flags: ScriptFlags,
) -> Result<(), ScriptError> {
    if input_index >= tx.vin.len() {
        return Err(ScriptError::InputIndexOutOfRange);
    }
    if (flags & SCRIPT_VERIFY_SIGPUSHONLY) != 0 && !is_push_only(script_sig) {
        return Err(ScriptError::SigPushOnly);
    }

    let checker = SignatureChecker {
        tx,
        input_index,
        flags,
    };

    let mut stack = Vec::new();
    eval_script_with(script_sig, &mut stack, &checker)?;

    let stack_copy = stack.clone();
    eval_script_with(script_pubkey, &mut stack, &checker)?;

    if stack.is_empty() || !cast_to_bool(stack.last().expect("checked non-empty")) {
        return Err(ScriptError::EvalFalse);
    }

    if (flags & SCRIPT_VERIFY_P2SH) != 0 && solve(script_pubkey).0 == ScriptKind::ScriptHash {
        if !is_push_only(script_sig) {
            return Err(ScriptError::SigPushOnly);
        }
        let mut redeem_stack = stack_copy;
        let redeem_script = redeem_stack.pop().ok_or(ScriptError::StackUnderflow)?;
        if solve(&redeem_script).0 == ScriptKind::ScriptHash {
            return Err(ScriptError::NestedScriptHash);
        }
        stack = redeem_stack;
        eval_script_with(&redeem_script, &mut stack, &checker)?;
        if stack.is_empty() || !cast_to_bool(stack.last().expect("checked non-empty")) {
            return Err(ScriptError::EvalFalse);
        }
    }

    if (flags & SCRIPT_VERIFY_CLEANSTACK) != 0 && (stack.len() != 1 || !cast_to_bool(&stack[0])) {
        return Err(ScriptError::EvalFalse);
    }

    Ok(())
}

/// Verifies the signature(s) spending `prev_tx`'s output via
/// `spending_tx.vin[input_index]`.
pub fn verify_signature(
    prev_tx: &Transaction,
    spending_tx: &Transaction,
    input_index: usize,
    flags: ScriptFlags,
) -> Result<(), ScriptError> {
    let input = spending_tx
        .vin
        .get(input_index)
        .ok_or(ScriptError::InputIndexOutOfRange)?;
    if input.prevout.hash != prev_tx.txid() {
        return Err(ScriptError::SigCheck);
    }
    let prev_output = prev_tx
        .vout
        .get(input.prevout.index as usize)
        .ok_or(ScriptError::InputIndexOutOfRange)?;
    verify_script(
        &input.script_sig,
        &prev_output.script_pubkey,
        spending_tx,
        input_index,
        flags,
    )
}

/// Evaluates a script against an explicit stack in the context of the
/// given transaction input.
pub fn eval_script(
    stack: &mut Vec<Vec<u8>>,
    script: &[u8],
    tx: &Transaction,
    input_index: usize,
    flags: ScriptFlags,
) -> Result<(), ScriptError> {
    let checker = SignatureChecker {
        tx,
        input_index,
        flags,
    };
    eval_script_with(script, stack, &checker)
}

struct SignatureChecker<'a> {
    tx: &'a Transaction,
    input_index: usize,
    flags: ScriptFlags,
}

impl<'a> SignatureChecker<'a> {
    fn check_sig(
        &self,
        sig_bytes: &[u8],
        pubkey_bytes: &[u8],
        script_code: &[u8],
    ) -> Result<bool, ScriptError> {
        if sig_bytes.is_empty() {
            return Ok(false);
        }
        if self.input_index >= self.tx.vin.len() {
            return Err(ScriptError::InputIndexOutOfRange);
        }
        let sighash_type = *sig_bytes.last().ok_or(ScriptError::SigEncoding)? as u32;
        if (self.flags & SCRIPT_VERIFY_STRICTENC) != 0 {
            let base_type = sighash_type & 0x1f;
            if base_type != 0x01 && base_type != SIGHASH_NONE && base_type != SIGHASH_SINGLE {
                return Err(ScriptError::SigHashType);
            }
            if !is_valid_pubkey(pubkey_bytes) {
                return Err(ScriptError::PubkeyEncoding);
            }
        }

        let der = &sig_bytes[..sig_bytes.len() - 1];
        let sig = Signature::from_der(der).map_err(|_| {
            neutrond_log::log_debug!("invalid DER signature ({} bytes)", sig_bytes.len());
            ScriptError::SigEncoding
        })?;

        let mut normalized = sig;
        normalized.normalize_s();
        if (self.flags & SCRIPT_VERIFY_LOW_S) != 0 && normalized != sig {
            return Err(ScriptError::SigEncoding);
        }

        let pubkey =
            PublicKey::from_slice(pubkey_bytes).map_err(|_| ScriptError::PubkeyEncoding)?;
        let sighash = match signature_hash(
            self.tx,
            self.input_index,
            script_code,
            SighashType(sighash_type),
        ) {
            Ok(hash) => hash,
            Err(_) => return Ok(false),
        };

        let msg = Message::from_digest_slice(&sighash).map_err(|_| ScriptError::SigCheck)?;
        Ok(secp256k1_verify()
            .verify_ecdsa(&msg, &normalized, &pubkey)
            .is_ok())
    }
}

fn eval_script_with(
    script: &[u8],
    stack: &mut Vec<Vec<u8>>,
    checker: &SignatureChecker<'_>,
) -> Result<(), ScriptError> {
    if script.len() > MAX_SCRIPT_SIZE {
        return Err(ScriptError::ScriptSize);
    }

    let mut cursor = 0usize;
    let mut script_code_start = 0usize;
    let mut op_count = 0usize;
    let mut exec_stack: Vec<bool> = Vec::new();

    while cursor < script.len() {
        let opcode = script[cursor];
        cursor += 1;
        let exec = exec_stack.iter().all(|branch| *branch);

        if opcode > OP_16 {
            op_count += 1;
            if op_count > MAX_OPS_PER_SCRIPT {
                return Err(ScriptError::OpCount);
            }
        }

        match opcode {
            OP_0 => {
                if exec {
                    push(stack, Vec::new())?;
                }
            }
            OP_1NEGATE => {
                if exec {
                    push(stack, script_num_to_vec(-1))?;
                }
            }
            0x01..=0x4b => {
                let data = read_bytes(script, &mut cursor, opcode as usize)?;
                if exec {
                    check_minimal(checker.flags, &data, opcode)?;
                    push(stack, data)?;
                }
            }
            OP_PUSHDATA1 => {
                let len = read_u8(script, &mut cursor)? as usize;
                let data = read_bytes(script, &mut cursor, len)?;
                if exec {
                    check_minimal(checker.flags, &data, opcode)?;
                    push(stack, data)?;
                }
            }
            OP_PUSHDATA2 => {
                let len = read_u16(script, &mut cursor)? as usize;
                let data = read_bytes(script, &mut cursor, len)?;
                if exec {
                    check_minimal(checker.flags, &data, opcode)?;
                    push(stack, data)?;
                }
            }
            OP_PUSHDATA4 => {
                let len = read_u32(script, &mut cursor)? as usize;
                let data = read_bytes(script, &mut cursor, len)?;
                if exec {
                    check_minimal(checker.flags, &data, opcode)?;
                    push(stack, data)?;
                }
            }
            OP_1..=OP_16 => {
                if exec {
                    let value = (opcode - OP_1 + 1) as i64;
                    push(stack, script_num_to_vec(value))?;
                }
            }
            OP_NOP => {}
            OP_IF | OP_NOTIF => {
                if exec {
                    let value = cast_to_bool(&pop(stack)?);
                    let branch = if opcode == OP_NOTIF { !value } else { value };
                    exec_stack.push(branch);
                } else {
                    exec_stack.push(false);
                }
            }
            OP_ELSE => {
                let current = exec_stack
                    .pop()
                    .ok_or(ScriptError::UnbalancedConditional)?;
                exec_stack.push(!current);
            }
            OP_ENDIF => {
                if exec_stack.pop().is_none() {
                    return Err(ScriptError::UnbalancedConditional);
                }
            }
            OP_VERIFY => {
                if !exec {
                    continue;
                }
                if !cast_to_bool(&pop(stack)?) {
                    return Err(ScriptError::EvalFalse);
                }
            }
            OP_RETURN => {
                if exec {
                    return Err(ScriptError::EvalFalse);
                }
            }
            OP_DUP => {
                if !exec {
                    continue;
                }
                let top = stack.last().ok_or(ScriptError::StackUnderflow)?.clone();
                push(stack, top)?;
            }
            OP_2DUP => {
                if !exec {
                    continue;
                }
                if stack.len() < 2 {
                    return Err(ScriptError::StackUnderflow);
                }
                let a = stack[stack.len() - 2].clone();
                let b = stack[stack.len() - 1].clone();
                push(stack, a)?;
                push(stack, b)?;
            }
            OP_DROP => {
                if !exec {
                    continue;
                }
                let _ = pop(stack)?;
            }
            OP_2DROP => {
                if !exec {
                    continue;
                }
                let _ = pop(stack)?;
                let _ = pop(stack)?;
            }
            OP_SWAP => {
                if !exec {
                    continue;
                }
                let len = stack.len();
                if len < 2 {
                    return Err(ScriptError::StackUnderflow);
                }
                stack.swap(len - 2, len - 1);
            }
            OP_SIZE => {
                if !exec {
                    continue;
                }
                let len = stack.last().ok_or(ScriptError::StackUnderflow)?.len();
                push(stack, script_num_to_vec(len as i64))?;
            }
            OP_EQUAL => {
                if !exec {
                    continue;
                }
                let a = pop(stack)?;
                let b = pop(stack)?;
                push(stack, bool_to_vec(a == b))?;
            }
            OP_EQUALVERIFY => {
                if !exec {
                    continue;
                }
                let a = pop(stack)?;
                let b = pop(stack)?;
                if a != b {
                    return Err(ScriptError::EvalFalse);
                }
            }
            OP_RIPEMD160 => {
                if !exec {
                    continue;
                }
                let data = pop(stack)?;
                let mut hasher = Ripemd160::new();
                hasher.update(data);
                push(stack, hasher.finalize().to_vec())?;
            }
            OP_SHA1 => {
                if !exec {
                    continue;
                }
                let data = pop(stack)?;
                let mut hasher = Sha1::new();
                hasher.update(data);
                push(stack, hasher.finalize().to_vec())?;
            }
            OP_SHA256 => {
                if !exec {
                    continue;
                }
                let data = pop(stack)?;
                push(stack, sha256(&data).to_vec())?;
            }
            OP_HASH160 => {
                if !exec {
                    continue;
                }
                let data = pop(stack)?;
                push(stack, hash160(&data).to_vec())?;
            }
            OP_HASH256 => {
                if !exec {
                    continue;
                }
                let data = pop(stack)?;
                push(stack, sha256d(&data).to_vec())?;
            }
            OP_CODESEPARATOR => {
                if exec {
                    script_code_start = cursor;
                }
            }
            OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                if !exec {
                    continue;
                }
                let pubkey = pop(stack)?;
                let sig = pop(stack)?;
                let script_code = &script[script_code_start..];
                let ok = checker.check_sig(&sig, &pubkey, script_code)?;
                if opcode == OP_CHECKSIGVERIFY {
                    if !ok {
                        return Err(ScriptError::SigCheck);
                    }
                } else {
                    push(stack, bool_to_vec(ok))?;
                }
            }
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                if !exec {
                    continue;
                }
                let n = decode_script_num(&pop(stack)?)?;
                if !(0..=20).contains(&n) {
                    return Err(ScriptError::InvalidOpcode);
                }
                op_count += n as usize;
                if op_count > MAX_OPS_PER_SCRIPT {
                    return Err(ScriptError::OpCount);
                }
                let mut pubkeys = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    pubkeys.push(pop(stack)?);
                }
                pubkeys.reverse();
                let m = decode_script_num(&pop(stack)?)?;
                if m < 0 || m > n {
                    return Err(ScriptError::InvalidOpcode);
                }
                let mut sigs = Vec::with_capacity(m as usize);
                for _ in 0..m {
                    sigs.push(pop(stack)?);
                }
                sigs.reverse();

                let dummy = pop(stack)?;
                if (checker.flags & SCRIPT_VERIFY_NULLDUMMY) != 0 && !dummy.is_empty() {
                    return Err(ScriptError::NullDummy);
                }

                let mut sig_index = 0usize;
                let mut key_index = 0usize;
                while sig_index < sigs.len() && key_index < pubkeys.len() {
                    let script_code = &script[script_code_start..];
                    if checker.check_sig(&sigs[sig_index], &pubkeys[key_index], script_code)? {
                        sig_index += 1;
                    }
                    key_index += 1;
                    if pubkeys.len() - key_index < sigs.len() - sig_index {
                        break;
                    }
                }

                let success = sig_index == sigs.len();
                if opcode == OP_CHECKMULTISIGVERIFY {
                    if !success {
                        return Err(ScriptError::SigCheck);
                    }
                } else {
                    push(stack, bool_to_vec(success))?;
                }
            }
            OP_NOP1..=OP_NOP10 => {
                if !exec {
                    continue;
                }
                if (checker.flags & SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS) != 0 {
                    return Err(ScriptError::InvalidOpcode);
                }
            }
            _ => {
                if exec {
                    return Err(ScriptError::InvalidOpcode);
                }
            }
        }
    }

    if !exec_stack.is_empty() {
        return Err(ScriptError::UnbalancedConditional);
    }

    Ok(())
}

fn push(stack: &mut Vec<Vec<u8>>, value: Vec<u8>) -> Result<(), ScriptError> {
    if stack.len() >= MAX_STACK_SIZE {
        return Err(ScriptError::StackOverflow);
    }
    stack.push(value);
    Ok(())
}

fn pop(stack: &mut Vec<Vec<u8>>) -> Result<Vec<u8>, ScriptError> {
    stack.pop().ok_or(ScriptError::StackUnderflow)
}

fn check_minimal(flags: ScriptFlags, data: &[u8], opcode: u8) -> Result<(), ScriptError> {
    if (flags & SCRIPT_VERIFY_MINIMALDATA) == 0 {
        return Ok(());
    }
    let len = data.len();
    let minimal = match opcode {
        0x01..=0x4b => !(len == 1 && (data[0] == 0x81 || (1..=16).contains(&data[0]))),
        OP_PUSHDATA1 => len >= OP_PUSHDATA1 as usize,
        OP_PUSHDATA2 => len > u8::MAX as usize,
        OP_PUSHDATA4 => len > u16::MAX as usize,
        _ => true,
    };
    if minimal {
        Ok(())
    } else {
        Err(ScriptError::MinimalData)
    }
}

fn bool_to_vec(value: bool) -> Vec<u8> {
    if value {
        vec![1]
    } else {
        Vec::new()
    }
}

fn cast_to_bool(data: &[u8]) -> bool {
    for (index, byte) in data.iter().enumerate() {
        if *byte != 0 {
            // Negative zero counts as false.
            return !(index == data.len() - 1 && *byte == 0x80);
        }
    }
    false
}

fn script_num_to_vec(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let negative = value < 0;
    let mut abs = value.unsigned_abs();
    let mut result = Vec::new();
    while abs > 0 {
        result.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    if let Some(last) = result.last_mut() {
        if (*last & 0x80) != 0 {
            result.push(if negative { 0x80 } else { 0 });
        } else if negative {
            *last |= 0x80;
        }
    }
    result
}

fn decode_script_num(data: &[u8]) -> Result<i64, ScriptError> {
    if data.len() > 4 {
        return Err(ScriptError::InvalidOpcode);
    }
    if data.is_empty() {
        return Ok(0);
    }
    let mut value = 0i64;
    for (index, byte) in data.iter().enumerate() {
        value |= (*byte as i64) << (8 * index);
    }
    if (data[data.len() - 1] & 0x80) != 0 {
        let mask = !(0x80i64 << (8 * (data.len() - 1)));
        value = -(value & mask);
    }
    Ok(value)
}

fn is_valid_pubkey(data: &[u8]) -> bool {
    match data.first() {
        Some(0x02) | Some(0x03) => data.len() == 33,
        Some(0x04) => data.len() == 65,
        _ => false,
    }
}

fn read_u8(script: &[u8], cursor: &mut usize) -> Result<u8, ScriptError> {
    let byte = *script.get(*cursor).ok_or(ScriptError::InvalidOpcode)?;
    *cursor += 1;
    Ok(byte)
}

fn read_u16(script: &[u8], cursor: &mut usize) -> Result<u16, ScriptError> {
    let bytes = script
        .get(*cursor..*cursor + 2)
        .ok_or(ScriptError::InvalidOpcode)?;
    *cursor += 2;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(script: &[u8], cursor: &mut usize) -> Result<u32, ScriptError> {
    let bytes = script
        .get(*cursor..*cursor + 4)
        .ok_or(ScriptError::InvalidOpcode)?;
    *cursor += 4;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_bytes(script: &[u8], cursor: &mut usize, len: usize) -> Result<Vec<u8>, ScriptError> {
    let bytes = script
        .get(*cursor..*cursor + len)
        .ok_or(ScriptError::InvalidOpcode)?;
    *cursor += len;
    Ok(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use neutrond_primitives::outpoint::OutPoint;
    use neutrond_primitives::transaction::{TxIn, TxOut};

    fn spending_tx() -> Transaction {
        Transaction {
            version: 1,
            time: 1_600_000_000,
            vin: vec![TxIn {
                prevout: OutPoint::new([1u8; 32], 0),
                script_sig: Vec::new(),
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value: 1,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn trivial_true_script() {
        let tx = spending_tx();
        verify_script(&[], &[OP_1], &tx, 0, SCRIPT_VERIFY_NONE).expect("verify");
    }

    #[test]
    fn equal_hash_script() {
        let tx = spending_tx();
        let preimage = b"stake".to_vec();
        let digest = sha256(&preimage);

        let mut script_pubkey = vec![OP_SHA256, 32];
        script_pubkey.extend_from_slice(&digest);
        script_pubkey.push(OP_EQUAL);

        let mut script_sig = vec![preimage.len() as u8];
        script_sig.extend_from_slice(&preimage);

        verify_script(&script_sig, &script_pubkey, &tx, 0, SCRIPT_VERIFY_NONE).expect("verify");
    }

    #[test]
    fn false_result_is_rejected() {
        let tx = spending_tx();
        assert!(matches!(
            verify_script(&[], &[OP_0], &tx, 0, SCRIPT_VERIFY_NONE),
            Err(ScriptError::EvalFalse)
        ));
    }

    #[test]
    fn p2sh_redeems_subscript() {
        let tx = spending_tx();
        let redeem_script = vec![OP_1];
        let redeem_hash = hash160(&redeem_script);

        let mut script_pubkey = vec![OP_HASH160, 0x14];
        script_pubkey.extend_from_slice(&redeem_hash);
        script_pubkey.push(OP_EQUAL);

        let mut script_sig = vec![redeem_script.len() as u8];
        script_sig.extend_from_slice(&redeem_script);

        verify_script(&script_sig, &script_pubkey, &tx, 0, SCRIPT_VERIFY_P2SH).expect("verify");
    }

    #[test]
    fn nested_p2sh_is_rejected() {
        let tx = spending_tx();
        // The redeem script is itself a pay-to-script-hash script.
        let mut redeem_script = vec![OP_HASH160, 0x14];
        redeem_script.extend_from_slice(&[5u8; 20]);
        redeem_script.push(OP_EQUAL);
        let redeem_hash = hash160(&redeem_script);

        let mut script_pubkey = vec![OP_HASH160, 0x14];
        script_pubkey.extend_from_slice(&redeem_hash);
        script_pubkey.push(OP_EQUAL);

        let mut script_sig = vec![redeem_script.len() as u8];
        script_sig.extend_from_slice(&redeem_script);

        assert!(matches!(
            verify_script(&script_sig, &script_pubkey, &tx, 0, SCRIPT_VERIFY_P2SH),
            Err(ScriptError::NestedScriptHash)
        ));
    }

    #[test]
    fn conditional_branches() {
        let tx = spending_tx();
        let script_pubkey = vec![OP_IF, OP_1, OP_ELSE, OP_0, OP_ENDIF];
        verify_script(&[OP_1], &script_pubkey, &tx, 0, SCRIPT_VERIFY_NONE).expect("true branch");
        assert!(matches!(
            verify_script(&[OP_0], &script_pubkey, &tx, 0, SCRIPT_VERIFY_NONE),
            Err(ScriptError::EvalFalse)
        ));
    }

    #[test]
    fn unbalanced_conditional_fails() {
        let tx = spending_tx();
        assert!(matches!(
            verify_script(&[OP_1], &[OP_IF, OP_1], &tx, 0, SCRIPT_VERIFY_NONE),
            Err(ScriptError::UnbalancedConditional)
        ));
    }

    #[test]
    fn script_num_roundtrip() {
        for value in [0i64, 1, -1, 127, 128, -128, 255, 256, 0x7fff_ffff] {
            let encoded = script_num_to_vec(value);
            assert_eq!(decode_script_num(&encoded).expect("decode"), value);
        }
    }
}
