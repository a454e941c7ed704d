//! Standard script classification.

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1NEGATE: u8 = 0x4f;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKSIGVERIFY: u8 = 0xad;
pub const OP_CHECKMULTISIG: u8 = 0xae;
pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;

/// The closed set of output shapes the node relays and serves.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScriptKind {
    NonStandard,
    /// Unspendable data carrier.
    NullData,
    PubKey,
    PubKeyHash,
    ScriptHash,
    Multisig,
}

/// One parsed script element: opcode plus attached push data, if any.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScriptOp {
    pub opcode: u8,
    pub data: Option<Vec<u8>>,
}

/// Tokenizes a script. Returns `None` on a truncated push.
pub fn parse_script(script: &[u8]) -> Option<Vec<ScriptOp>> {
    let mut ops = Vec::new();
    let mut cursor = 0usize;
    while cursor < script.len() {
        let opcode = script[cursor];
        cursor += 1;
        let data_len = match opcode {
            0x01..=0x4b => Some(opcode as usize),
            OP_PUSHDATA1 => {
                let len = *script.get(cursor)? as usize;
                cursor += 1;
                Some(len)
            }
            OP_PUSHDATA2 => {
                let bytes = script.get(cursor..cursor + 2)?;
                cursor += 2;
                Some(u16::from_le_bytes([bytes[0], bytes[1]]) as usize)
            }
            OP_PUSHDATA4 => {
                let bytes = script.get(cursor..cursor + 4)?;
                cursor += 4;
                Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize)
            }
            _ => None,
        };
        let data = match data_len {
            Some(len) => {
                let bytes = script.get(cursor..cursor + len)?;
                cursor += len;
                Some(bytes.to_vec())
            }
            None => None,
        };
        ops.push(ScriptOp { opcode, data });
    }
    Some(ops)
}

fn small_int(opcode: u8) -> Option<u8> {
    if opcode == OP_0 {
        Some(0)
    } else if (OP_1..=OP_16).contains(&opcode) {
        Some(opcode - OP_1 + 1)
    } else {
        None
    }
}

fn is_pubkey_push(data: &[u8]) -> bool {
    matches!(data.len(), 33 | 65)
}

/// Classifies an output script and extracts its solution data. Multisig
/// solutions are `[m, pk1, .., pkN, n]` with m and n as single bytes.
pub fn solve(script: &[u8]) -> (ScriptKind, Vec<Vec<u8>>) {
    let Some(ops) = parse_script(script) else {
        return (ScriptKind::NonStandard, Vec::new());
    };

    // OP_RETURN data carrier: nothing but pushes may follow.
    if let Some(first) = ops.first() {
        if first.opcode == OP_RETURN {
            let push_only = ops[1..]
                .iter()
                .all(|op| op.data.is_some() || op.opcode <= OP_16);
            if push_only {
                return (ScriptKind::NullData, Vec::new());
            }
            return (ScriptKind::NonStandard, Vec::new());
        }
    }

    // <pubkey> OP_CHECKSIG
    if ops.len() == 2 && ops[1].opcode == OP_CHECKSIG {
        if let Some(data) = &ops[0].data {
            if is_pubkey_push(data) {
                return (ScriptKind::PubKey, vec![data.clone()]);
            }
        }
    }

    // OP_DUP OP_HASH160 <hash20> OP_EQUALVERIFY OP_CHECKSIG
    if ops.len() == 5
        && ops[0].opcode == OP_DUP
        && ops[1].opcode == OP_HASH160
        && ops[3].opcode == OP_EQUALVERIFY
        && ops[4].opcode == OP_CHECKSIG
    {
        if let Some(hash) = &ops[2].data {
            if hash.len() == 20 {
                return (ScriptKind::PubKeyHash, vec![hash.clone()]);
            }
        }
    }

    // OP_HASH160 <hash20> OP_EQUAL
    if ops.len() == 3 && ops[0].opcode == OP_HASH160 && ops[2].opcode == OP_EQUAL {
        if let Some(hash) = &ops[1].data {
            if hash.len() == 20 {
                return (ScriptKind::ScriptHash, vec![hash.clone()]);
            }
        }
    }

    // OP_m <pubkeys> OP_n OP_CHECKMULTISIG
    if ops.len() >= 4 && ops.last().map(|op| op.opcode) == Some(OP_CHECKMULTISIG) {
        let m = small_int(ops[0].opcode);
        let n = small_int(ops[ops.len() - 2].opcode);
        if let (Some(m), Some(n)) = (m, n) {
            let keys = &ops[1..ops.len() - 2];
            let keys_ok = keys
                .iter()
                .all(|op| op.data.as_deref().is_some_and(is_pubkey_push));
            if keys_ok && m >= 1 && n as usize == keys.len() && m <= n && n <= 3 {
                let mut solutions = Vec::with_capacity(keys.len() + 2);
                solutions.push(vec![m]);
                for key in keys {
                    solutions.push(key.data.clone().expect("checked push"));
                }
                solutions.push(vec![n]);
                return (ScriptKind::Multisig, solutions);
            }
        }
    }

    (ScriptKind::NonStandard, Vec::new())
}

/// Number of stack elements a standard scriptSig must push to satisfy an
/// output of the given kind; `None` when the kind cannot be spent.
pub fn script_sig_args_expected(kind: ScriptKind, solutions: &[Vec<u8>]) -> Option<usize> {
    match kind {
        ScriptKind::NonStandard | ScriptKind::NullData => None,
        ScriptKind::PubKey => Some(1),
        ScriptKind::PubKeyHash => Some(2),
        // The serialized subscript plus whatever it needs; the caller
        // adds the subscript's own expectation.
        ScriptKind::ScriptHash => Some(1),
        ScriptKind::Multisig => {
            let m = solutions.first()?.first().copied()? as usize;
            // One extra element for the CHECKMULTISIG dummy.
            Some(m + 1)
        }
    }
}

pub fn is_push_only(script: &[u8]) -> bool {
    match parse_script(script) {
        Some(ops) => ops
            .iter()
            .all(|op| op.data.is_some() || op.opcode <= OP_16 || op.opcode == OP_1NEGATE),
        None => false,
    }
}

/// Each push must use the smallest possible encoding.
pub fn has_canonical_pushes(script: &[u8]) -> bool {
    let Some(ops) = parse_script(script) else {
        return false;
    };
    for op in &ops {
        let Some(data) = &op.data else {
            continue;
        };
        let len = data.len();
        let canonical = match op.opcode {
            0x01..=0x4b => !(len == 1 && (data[0] == 0x81 || data[0] <= 16)),
            OP_PUSHDATA1 => len >= OP_PUSHDATA1 as usize,
            OP_PUSHDATA2 => len > u8::MAX as usize,
            OP_PUSHDATA4 => len > u16::MAX as usize,
            _ => true,
        };
        if !canonical {
            return false;
        }
    }
    true
}

/// Legacy signature-operation count. With `accurate` set, CHECKMULTISIG
/// preceded by a small integer counts that many keys instead of 20.
pub fn sig_op_count(script: &[u8], accurate: bool) -> u32 {
    let mut count = 0u32;
    let mut last_opcode = 0xffu8;
    let Some(ops) = parse_script(script) else {
        // Count what parses; a truncated tail adds nothing.
        return sig_op_count_prefix(script, accurate);
    };
    for op in &ops {
        match op.opcode {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                if accurate {
                    match small_int(last_opcode) {
                        Some(n) if n >= 1 => count += n as u32,
                        _ => count += 20,
                    }
                } else {
                    count += 20;
                }
            }
            _ => {}
        }
        last_opcode = op.opcode;
    }
    count
}

fn sig_op_count_prefix(script: &[u8], accurate: bool) -> u32 {
    let mut end = script.len();
    while end > 0 {
        if let Some(prefix) = script.get(..end) {
            if parse_script(prefix).is_some() {
                return sig_op_count(prefix, accurate);
            }
        }
        end -= 1;
    }
    0
}

/// Sigops contributed by a pay-to-script-hash input: the accurate count
/// over the redeem script carried as the scriptSig's final push.
pub fn p2sh_sig_op_count(prev_script: &[u8], script_sig: &[u8]) -> u32 {
    let (kind, _) = solve(prev_script);
    if kind != ScriptKind::ScriptHash {
        return 0;
    }
    if !is_push_only(script_sig) {
        return 0;
    }
    let Some(ops) = parse_script(script_sig) else {
        return 0;
    };
    match ops.last().and_then(|op| op.data.as_deref()) {
        Some(redeem_script) => sig_op_count(redeem_script, true),
        None => 0,
    }
}

/// Where a standard output pays to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Destination {
    /// Not a standard single-destination script.
    NoDestination,
    /// Pay-to-pubkey or pay-to-pubkey-hash, by key hash.
    KeyId([u8; 20]),
    /// Pay-to-script-hash, by script hash.
    ScriptId([u8; 20]),
}

/// Keys and redeem scripts the node controls; the wallet implements this.
pub trait KeyStore {
    fn have_key(&self, key_id: &[u8; 20]) -> bool;
    fn have_script(&self, script_id: &[u8; 20]) -> bool;
}

pub fn extract_destination(script: &[u8]) -> Destination {
    let (kind, solutions) = solve(script);
    match kind {
        ScriptKind::PubKey => match solutions.first() {
            Some(pubkey) => Destination::KeyId(neutrond_primitives::hash::hash160(pubkey)),
            None => Destination::NoDestination,
        },
        ScriptKind::PubKeyHash => match solutions.first().and_then(|hash| hash.as_slice().try_into().ok()) {
            Some(hash) => Destination::KeyId(hash),
            None => Destination::NoDestination,
        },
        ScriptKind::ScriptHash => match solutions.first().and_then(|hash| hash.as_slice().try_into().ok()) {
            Some(hash) => Destination::ScriptId(hash),
            None => Destination::NoDestination,
        },
        _ => Destination::NoDestination,
    }
}

/// Whether the keystore can satisfy `script` outright. Multisig outputs
/// count as ours only when every member key is held.
pub fn is_mine(keystore: &dyn KeyStore, script: &[u8]) -> bool {
    let (kind, solutions) = solve(script);
    match kind {
        ScriptKind::NonStandard | ScriptKind::NullData => false,
        ScriptKind::PubKey => solutions
            .first()
            .map(|pubkey| keystore.have_key(&neutrond_primitives::hash::hash160(pubkey)))
            .unwrap_or(false),
        ScriptKind::PubKeyHash => solutions
            .first()
            .and_then(|hash| hash.as_slice().try_into().ok())
            .map(|hash: [u8; 20]| keystore.have_key(&hash))
            .unwrap_or(false),
        ScriptKind::ScriptHash => solutions
            .first()
            .and_then(|hash| hash.as_slice().try_into().ok())
            .map(|hash: [u8; 20]| keystore.have_script(&hash))
            .unwrap_or(false),
        ScriptKind::Multisig => {
            // Solutions are [m, keys.., n].
            let keys = &solutions[1..solutions.len().saturating_sub(1)];
            !keys.is_empty()
                && keys
                    .iter()
                    .all(|pubkey| keystore.have_key(&neutrond_primitives::hash::hash160(pubkey)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p2pkh(hash: [u8; 20]) -> Vec<u8> {
        let mut script = vec![OP_DUP, OP_HASH160, 0x14];
        script.extend_from_slice(&hash);
        script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
        script
    }

    #[test]
    fn classify_pubkey_hash() {
        let (kind, solutions) = solve(&p2pkh([7u8; 20]));
        assert_eq!(kind, ScriptKind::PubKeyHash);
        assert_eq!(solutions, vec![vec![7u8; 20]]);
    }

    #[test]
    fn classify_pubkey() {
        let mut script = vec![33u8];
        script.extend_from_slice(&[2u8; 33]);
        script.push(OP_CHECKSIG);
        let (kind, solutions) = solve(&script);
        assert_eq!(kind, ScriptKind::PubKey);
        assert_eq!(solutions[0].len(), 33);
    }

    #[test]
    fn classify_script_hash() {
        let mut script = vec![OP_HASH160, 0x14];
        script.extend_from_slice(&[9u8; 20]);
        script.push(OP_EQUAL);
        let (kind, solutions) = solve(&script);
        assert_eq!(kind, ScriptKind::ScriptHash);
        assert_eq!(solutions, vec![vec![9u8; 20]]);
    }

    #[test]
    fn classify_multisig() {
        let mut script = vec![OP_1];
        for _ in 0..2 {
            script.push(33);
            script.extend_from_slice(&[3u8; 33]);
        }
        script.push(OP_1 + 1);
        script.push(OP_CHECKMULTISIG);
        let (kind, solutions) = solve(&script);
        assert_eq!(kind, ScriptKind::Multisig);
        assert_eq!(solutions.first(), Some(&vec![1u8]));
        assert_eq!(solutions.last(), Some(&vec![2u8]));
        assert_eq!(solutions.len(), 4);
        assert_eq!(script_sig_args_expected(kind, &solutions), Some(2));
    }

    #[test]
    fn classify_null_data() {
        let script = vec![OP_RETURN, 0x02, 0xaa, 0xbb];
        assert_eq!(solve(&script).0, ScriptKind::NullData);
    }

    #[test]
    fn oversized_multisig_is_nonstandard() {
        let mut script = vec![OP_1];
        for _ in 0..4 {
            script.push(33);
            script.extend_from_slice(&[3u8; 33]);
        }
        script.push(OP_1 + 3);
        script.push(OP_CHECKMULTISIG);
        assert_eq!(solve(&script).0, ScriptKind::NonStandard);
    }

    #[test]
    fn truncated_push_is_nonstandard() {
        assert_eq!(solve(&[0x4b, 0x01]).0, ScriptKind::NonStandard);
        assert!(!is_push_only(&[0x4b, 0x01]));
    }

    #[test]
    fn push_only_and_canonical() {
        assert!(is_push_only(&[0x02, 0xaa, 0xbb, OP_1]));
        assert!(!is_push_only(&p2pkh([0u8; 20])));
        assert!(has_canonical_pushes(&[0x02, 0xaa, 0xbb]));
        // OP_PUSHDATA1 used for a payload that fits a direct push.
        assert!(!has_canonical_pushes(&[OP_PUSHDATA1, 0x02, 0xaa, 0xbb]));
    }

    #[test]
    fn sigop_counting() {
        let script = vec![OP_CHECKSIG, OP_CHECKSIG, OP_CHECKMULTISIG];
        assert_eq!(sig_op_count(&script, false), 22);
        let mut accurate = vec![OP_1 + 1];
        accurate.push(OP_CHECKMULTISIG);
        assert_eq!(sig_op_count(&accurate, true), 2);
        assert_eq!(sig_op_count(&accurate, false), 20);
    }

    struct TestKeys {
        keys: Vec<[u8; 20]>,
        scripts: Vec<[u8; 20]>,
    }

    impl KeyStore for TestKeys {
        fn have_key(&self, key_id: &[u8; 20]) -> bool {
            self.keys.contains(key_id)
        }

        fn have_script(&self, script_id: &[u8; 20]) -> bool {
            self.scripts.contains(script_id)
        }
    }

    #[test]
    fn destination_extraction() {
        assert_eq!(
            extract_destination(&p2pkh([7u8; 20])),
            Destination::KeyId([7u8; 20])
        );

        let mut p2sh = vec![OP_HASH160, 0x14];
        p2sh.extend_from_slice(&[9u8; 20]);
        p2sh.push(OP_EQUAL);
        assert_eq!(
            extract_destination(&p2sh),
            Destination::ScriptId([9u8; 20])
        );

        assert_eq!(
            extract_destination(&[OP_RETURN]),
            Destination::NoDestination
        );
    }

    #[test]
    fn is_mine_requires_all_multisig_keys() {
        let key_a = [2u8; 33];
        let key_b = [3u8; 33];
        let mut script = vec![OP_1 + 1];
        for key in [&key_a, &key_b] {
            script.push(33);
            script.extend_from_slice(key.as_slice());
        }
        script.push(OP_1 + 1);
        script.push(OP_CHECKMULTISIG);

        let hash_a = neutrond_primitives::hash::hash160(&key_a);
        let hash_b = neutrond_primitives::hash::hash160(&key_b);

        let partial = TestKeys {
            keys: vec![hash_a],
            scripts: Vec::new(),
        };
        assert!(!is_mine(&partial, &script));

        let full = TestKeys {
            keys: vec![hash_a, hash_b],
            scripts: Vec::new(),
        };
        assert!(is_mine(&full, &script));
    }

    #[test]
    fn p2sh_sigops_use_redeem_script() {
        let mut prev = vec![OP_HASH160, 0x14];
        prev.extend_from_slice(&[9u8; 20]);
        prev.push(OP_EQUAL);

        let redeem = vec![OP_1, OP_CHECKMULTISIG];
        let mut script_sig = vec![0x00];
        script_sig.push(redeem.len() as u8);
        script_sig.extend_from_slice(&redeem);

        assert_eq!(p2sh_sig_op_count(&prev, &script_sig), 1);
        assert_eq!(p2sh_sig_op_count(&[OP_CHECKSIG], &script_sig), 0);
    }
}
