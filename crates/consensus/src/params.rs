//! Consensus parameter definitions.

use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: i32,
    pub hash: Hash256,
}

/// How strictly the node follows signed sync checkpoints.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CheckpointMode {
    Strict,
    Advisory,
    Permissive,
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub hash_genesis_block: Hash256,
    pub message_start: [u8; 4],
    pub default_port: u16,
    /// Proof-of-work target ceiling, little-endian.
    pub pow_limit: Hash256,
    /// Proof-of-stake target ceiling before the v2 tightening.
    pub pos_limit: Hash256,
    /// Proof-of-stake target ceiling from `pos_protocol_v2_height` on.
    pub pos_limit_v2: Hash256,
    /// Height at which coinstake timestamp masking and the tighter
    /// stake target take effect.
    pub pos_protocol_v2_height: i32,
    /// Coinbase and coinstake outputs mature after this many blocks.
    pub coinbase_maturity: i32,
    /// Hardened checkpoints, ascending by height.
    pub checkpoints: Vec<Checkpoint>,
    /// Raw scriptPubKey receiving the developer payment.
    pub developer_script: Vec<u8>,
    pub checkpoint_mode: CheckpointMode,
}

impl ChainParams {
    pub fn is_testnet(&self) -> bool {
        self.network == Network::Testnet
    }

    /// Stake target ceiling applicable at `height`.
    pub fn pos_limit(&self, height: i32) -> Hash256 {
        if height >= self.pos_protocol_v2_height {
            self.pos_limit_v2
        } else {
            self.pos_limit
        }
    }

    /// Height of the highest hardened checkpoint; signature verification
    /// is skipped while connecting blocks at or below it.
    pub fn total_blocks_estimate(&self) -> i32 {
        self.checkpoints
            .last()
            .map(|checkpoint| checkpoint.height)
            .unwrap_or(0)
    }

    pub fn hardened_checkpoint(&self, height: i32) -> Option<&Hash256> {
        self.checkpoints
            .iter()
            .find(|checkpoint| checkpoint.height == height)
            .map(|checkpoint| &checkpoint.hash)
    }
}

#[derive(Debug)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

/// Parses a big-endian hex string (optionally 0x-prefixed, shorter than
/// 64 digits allowed) into a little-endian hash.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let mut hex = input.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }
    if hex.is_empty() || hex.len() > 64 {
        return Err(HexError::InvalidLength);
    }

    let mut padded = String::with_capacity(64);
    for _ in 0..(64 - hex.len()) {
        padded.push('0');
    }
    padded.push_str(hex);

    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let start = i * 2;
        *byte_out = u8::from_str_radix(&padded[start..start + 2], 16)
            .map_err(|_| HexError::InvalidHex)?;
    }
    bytes.reverse();
    Ok(bytes)
}

/// `~uint256(0) >> shift` as a little-endian hash.
fn limit_shifted(shift: u32) -> Hash256 {
    let mut limit = [0xffu8; 32];
    let byte_shift = (shift / 8) as usize;
    let bit_shift = shift % 8;
    for i in 0..byte_shift {
        limit[31 - i] = 0;
    }
    if bit_shift > 0 && byte_shift < 32 {
        limit[31 - byte_shift] = 0xff >> bit_shift;
    }
    limit
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => mainnet_params(),
        Network::Testnet => testnet_params(),
    }
}

fn mainnet_params() -> ChainParams {
    ChainParams {
        network: Network::Mainnet,
        hash_genesis_block: hash256_from_hex(
            "0x0000036366895115eba0d9a314a3fc10a3972b82db5413d79e98a4aba1927e46",
        )
        .expect("genesis hash"),
        message_start: [0xb2, 0xd1, 0xf4, 0xa3],
        default_port: 32_001,
        pow_limit: limit_shifted(20),
        pos_limit: limit_shifted(20),
        pos_limit_v2: limit_shifted(28),
        pos_protocol_v2_height: 500_000,
        coinbase_maturity: 80,
        checkpoints: vec![Checkpoint {
            height: 0,
            hash: hash256_from_hex(
                "0x0000036366895115eba0d9a314a3fc10a3972b82db5413d79e98a4aba1927e46",
            )
            .expect("checkpoint hash"),
        }],
        // Pay-to-pubkey-hash of the project treasury key.
        developer_script: p2pkh_script(&[
            0x2f, 0x5e, 0x12, 0xaa, 0x6c, 0x0f, 0xb8, 0x11, 0x9d, 0x50, 0x7e, 0x3a, 0x90, 0x4e,
            0x35, 0xb8, 0x27, 0x19, 0x6b, 0xd4,
        ]),
        checkpoint_mode: CheckpointMode::Advisory,
    }
}

fn testnet_params() -> ChainParams {
    ChainParams {
        network: Network::Testnet,
        hash_genesis_block: hash256_from_hex(
            "0x3c81f5a39588ff6112bf55343ef61b998098a3eca0cabfb6b3dbd908c2c3345a",
        )
        .expect("genesis hash"),
        message_start: [0xaf, 0xf4, 0xc1, 0xa2],
        default_port: 32_002,
        pow_limit: limit_shifted(2),
        pos_limit: limit_shifted(2),
        pos_limit_v2: limit_shifted(2),
        pos_protocol_v2_height: 0,
        coinbase_maturity: 10,
        checkpoints: Vec::new(),
        developer_script: p2pkh_script(&[
            0x91, 0x2c, 0x4e, 0x01, 0x7a, 0xf3, 0x55, 0xd8, 0x62, 0x0b, 0x2c, 0xd6, 0xf4, 0x88,
            0x1e, 0xa9, 0x05, 0x66, 0x31, 0x7e,
        ]),
        checkpoint_mode: CheckpointMode::Advisory,
    }
}

fn p2pkh_script(key_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[0x76, 0xa9, 0x14]);
    script.extend_from_slice(key_hash);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}
