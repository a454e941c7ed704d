use std::sync::OnceLock;

use neutrond_consensus::Hash256;
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, VerifyOnly};

static SECP256K1_VERIFY: OnceLock<Secp256k1<VerifyOnly>> = OnceLock::new();

pub(crate) fn secp256k1_verify() -> &'static Secp256k1<VerifyOnly> {
    SECP256K1_VERIFY.get_or_init(Secp256k1::verification_only)
}

/// Verifies a raw DER signature made directly over a 32-byte digest, as
/// used by block signatures.
pub fn verify_hash_signature(pubkey_bytes: &[u8], der_sig: &[u8], digest: &Hash256) -> bool {
    let Ok(pubkey) = PublicKey::from_slice(pubkey_bytes) else {
        return false;
    };
    let Ok(mut sig) = Signature::from_der(der_sig) else {
        return false;
    };
    sig.normalize_s();
    let Ok(msg) = Message::from_digest_slice(digest) else {
        return false;
    };
    secp256k1_verify().verify_ecdsa(&msg, &sig, &pubkey).is_ok()
}
