//! Script classification, interpretation, and signature verification.

pub mod interpreter;
pub mod secp;
pub mod sighash;
pub mod standard;

pub use secp::verify_hash_signature;

pub use interpreter::{
    eval_script, verify_script, verify_signature, ScriptError, ScriptFlags,
    MANDATORY_SCRIPT_VERIFY_FLAGS, SCRIPT_VERIFY_NONE, SCRIPT_VERIFY_P2SH,
    STANDARD_SCRIPT_VERIFY_FLAGS,
};
pub use sighash::{signature_hash, SighashError, SIGHASH_ALL};
pub use standard::{
    extract_destination, has_canonical_pushes, is_mine, is_push_only, p2sh_sig_op_count,
    script_sig_args_expected, sig_op_count, solve, Destination, KeyStore, ScriptKind,
};
