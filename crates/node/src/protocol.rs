//! Wire message framing and inventory types.

use neutrond_consensus::Hash256;
use neutrond_primitives::encoding::{
    Decodable, DecodeError, Decoder, Encodable, Encoder,
};
use neutrond_primitives::hash::sha256d;

pub const MESSAGE_HEADER_SIZE: usize = 24;
pub const COMMAND_SIZE: usize = 12;

/// Maximum payload a single message may carry.
pub const MAX_MESSAGE_SIZE: u32 = 2 * 1024 * 1024;

pub mod commands {
    pub const VERSION: &str = "version";
    pub const VERACK: &str = "verack";
    pub const ADDR: &str = "addr";
    pub const INV: &str = "inv";
    pub const GETDATA: &str = "getdata";
    pub const GETBLOCKS: &str = "getblocks";
    pub const GETHEADERS: &str = "getheaders";
    pub const HEADERS: &str = "headers";
    pub const TX: &str = "tx";
    pub const DSTX: &str = "dstx";
    pub const BLOCK: &str = "block";
    pub const ALERT: &str = "alert";
    pub const MEMPOOL: &str = "mempool";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const REJECT: &str = "reject";
    pub const CHECKPOINT: &str = "checkpoint";
}

pub mod reject {
    pub const MALFORMED: u8 = 0x01;
    pub const INVALID: u8 = 0x10;
    pub const OBSOLETE: u8 = 0x11;
    pub const DUPLICATE: u8 = 0x12;
    pub const NONSTANDARD: u8 = 0x40;
    pub const INSUFFICIENT_FEE: u8 = 0x42;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MessageHeader {
    pub magic: [u8; 4],
    pub command: [u8; COMMAND_SIZE],
    pub length: u32,
    pub checksum: [u8; 4],
}

impl MessageHeader {
    pub fn new(magic: [u8; 4], command: &str, payload: &[u8]) -> Self {
        let mut command_bytes = [0u8; COMMAND_SIZE];
        let bytes = command.as_bytes();
        command_bytes[..bytes.len().min(COMMAND_SIZE)]
            .copy_from_slice(&bytes[..bytes.len().min(COMMAND_SIZE)]);
        Self {
            magic,
            command: command_bytes,
            length: payload.len() as u32,
            checksum: payload_checksum(payload),
        }
    }

    pub fn command_str(&self) -> &str {
        let end = self
            .command
            .iter()
            .position(|byte| *byte == 0)
            .unwrap_or(COMMAND_SIZE);
        std::str::from_utf8(&self.command[..end]).unwrap_or("")
    }

    pub fn encode(&self) -> [u8; MESSAGE_HEADER_SIZE] {
        let mut out = [0u8; MESSAGE_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.magic);
        out[4..16].copy_from_slice(&self.command);
        out[16..20].copy_from_slice(&self.length.to_le_bytes());
        out[20..24].copy_from_slice(&self.checksum);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < MESSAGE_HEADER_SIZE {
            return Err(DecodeError::UnexpectedEof);
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        let mut command = [0u8; COMMAND_SIZE];
        command.copy_from_slice(&bytes[4..16]);
        let length = u32::from_le_bytes(bytes[16..20].try_into().expect("slice length"));
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&bytes[20..24]);
        if length > MAX_MESSAGE_SIZE {
            return Err(DecodeError::SizeTooLarge);
        }
        Ok(Self {
            magic,
            command,
            length,
            checksum,
        })
    }

    pub fn checksum_matches(&self, payload: &[u8]) -> bool {
        self.length as usize == payload.len() && self.checksum == payload_checksum(payload)
    }
}

pub fn payload_checksum(payload: &[u8]) -> [u8; 4] {
    let digest = sha256d(payload);
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Frames a complete wire message.
pub fn build_message(magic: [u8; 4], command: &str, payload: &[u8]) -> Vec<u8> {
    let header = MessageHeader::new(magic, command, payload);
    let mut out = Vec::with_capacity(MESSAGE_HEADER_SIZE + payload.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(payload);
    out
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum InvKind {
    Tx,
    Block,
}

impl InvKind {
    pub fn wire_value(self) -> u32 {
        match self {
            InvKind::Tx => 1,
            InvKind::Block => 2,
        }
    }

    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            1 => Some(InvKind::Tx),
            2 => Some(InvKind::Block),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Inv {
    pub kind: InvKind,
    pub hash: Hash256,
}

impl Inv {
    pub fn tx(hash: Hash256) -> Self {
        Self {
            kind: InvKind::Tx,
            hash,
        }
    }

    pub fn block(hash: Hash256) -> Self {
        Self {
            kind: InvKind::Block,
            hash,
        }
    }
}

impl Encodable for Inv {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.kind.wire_value());
        encoder.write_hash_le(&self.hash);
    }
}

impl Decodable for Inv {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let kind = InvKind::from_wire(decoder.read_u32_le()?)
            .ok_or(DecodeError::InvalidData("unknown inventory type"))?;
        let hash = decoder.read_hash_le()?;
        Ok(Self { kind, hash })
    }
}

pub fn encode_inv_vector(invs: &[Inv]) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_varint(invs.len() as u64);
    for inv in invs {
        inv.consensus_encode(&mut encoder);
    }
    encoder.into_inner()
}

pub fn decode_inv_vector(payload: &[u8]) -> Result<Vec<Inv>, DecodeError> {
    let mut decoder = Decoder::new(payload);
    let count = decoder.read_varint()?;
    let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
    let mut invs = Vec::with_capacity(count.min(1_024));
    for _ in 0..count {
        invs.push(Inv::consensus_decode(&mut decoder)?);
    }
    Ok(invs)
}

/// Block locator: exponentially thinning sample of the chain back from a
/// tip, used by getblocks/getheaders to find the fork point.
pub fn encode_locator(hashes: &[Hash256], hash_stop: &Hash256) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_varint(hashes.len() as u64);
    for hash in hashes {
        encoder.write_hash_le(hash);
    }
    encoder.write_hash_le(hash_stop);
    encoder.into_inner()
}

pub fn decode_locator(payload: &[u8]) -> Result<(Vec<Hash256>, Hash256), DecodeError> {
    let mut decoder = Decoder::new(payload);
    let count = decoder.read_varint()?;
    let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
    let mut hashes = Vec::with_capacity(count.min(1_024));
    for _ in 0..count {
        hashes.push(decoder.read_hash_le()?);
    }
    let hash_stop = decoder.read_hash_le()?;
    Ok((hashes, hash_stop))
}

/// The handshake fields the core cares about; trailing fields newer peers
/// append are tolerated and ignored.
#[derive(Clone, Debug)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub time: i64,
    pub nonce: u64,
    pub subversion: String,
    pub start_height: i32,
}

impl VersionMessage {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(payload);
        let version = decoder.read_i32_le()?;
        let services = decoder.read_u64_le()?;
        let time = decoder.read_i64_le()?;
        // Sender and receiver address blocks, unused by the core.
        let _ = decoder.read_bytes(26)?;
        let _ = decoder.read_bytes(26)?;
        let nonce = decoder.read_u64_le()?;
        let subversion = decoder.read_var_str()?;
        let start_height = decoder.read_i32_le()?;
        Ok(Self {
            version,
            services,
            time,
            nonce,
            subversion,
            start_height,
        })
    }
}

/// Reject message payload sent back on protocol violations.
pub fn encode_reject(message: &str, code: u8, reason: &str, hash: Option<&Hash256>) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_var_str(message);
    encoder.write_u8(code);
    encoder.write_var_str(reason);
    if let Some(hash) = hash {
        encoder.write_hash_le(hash);
    }
    encoder.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: [u8; 4] = [0xb2, 0xd1, 0xf4, 0xa3];

    #[test]
    fn header_roundtrip() {
        let payload = b"hello";
        let header = MessageHeader::new(MAGIC, commands::PING, payload);
        let decoded = MessageHeader::decode(&header.encode()).expect("decode");
        assert_eq!(decoded, header);
        assert_eq!(decoded.command_str(), "ping");
        assert!(decoded.checksum_matches(payload));
        assert!(!decoded.checksum_matches(b"other"));
    }

    #[test]
    fn empty_payload_checksum() {
        // Checksum of the empty payload is the canonical 5df6e0e2.
        let checksum = payload_checksum(b"");
        assert_eq!(checksum, [0x5d, 0xf6, 0xe0, 0xe2]);
    }

    #[test]
    fn inv_vector_roundtrip() {
        let invs = vec![Inv::tx([1u8; 32]), Inv::block([2u8; 32])];
        let payload = encode_inv_vector(&invs);
        let decoded = decode_inv_vector(&payload).expect("decode");
        assert_eq!(decoded, invs);
    }

    #[test]
    fn locator_roundtrip() {
        let hashes = vec![[1u8; 32], [2u8; 32]];
        let payload = encode_locator(&hashes, &[9u8; 32]);
        let (decoded, stop) = decode_locator(&payload).expect("decode");
        assert_eq!(decoded, hashes);
        assert_eq!(stop, [9u8; 32]);
    }

    #[test]
    fn oversized_header_length_rejected() {
        let mut bytes = MessageHeader::new(MAGIC, commands::TX, b"x").encode();
        bytes[16..20].copy_from_slice(&(MAX_MESSAGE_SIZE + 1).to_le_bytes());
        assert!(MessageHeader::decode(&bytes).is_err());
    }
}
