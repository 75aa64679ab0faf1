//! Network protocol message definitions for peer communication.
//!
//! Every message is framed as `len:u32be | tag:u8 | body`, the body in the
//! canonical big-endian encoding of its record. Recognized tags:
//!
//! | tag | message |
//! |---|---|
//! | 0x01 | hello |
//! | 0x02 | block |
//! | 0x03 | transaction |
//! | 0x04 | heartbeat |
//! | 0x05 | checkpoint |
//! | 0x06 | request-by-hash |
//! | 0x07 | response |
//! | 0x0F | disconnect |
//!
//! # Transport security
//!
//! Frames travel over the encrypted authenticated channel established in
//! [`crate::p2p`]: a Noise-XX-shaped handshake over Kyber1024 KEM with
//! SPHINCS+ transcript signatures, then a SHAKE256 keystream with per-frame
//! MACs.

use crate::block::Block;
use crate::consensus::checkpoint::{Checkpoint, Heartbeat, HeartbeatProof};
use crate::crypto::keys::{KemPublicKey, Signature, SigningPublicKey};
use crate::reputation::Tier;
use crate::temporal::clock::UtcInstant;
use crate::temporal::vdf::VdfProof;
use crate::transaction::Transaction;
use crate::wire::{Reader, Writer};
use crate::{constants, Hash};

/// A peer identifier (fingerprint of their signing key).
pub type PeerId = Hash;

/// Protocol version carried in hello.
pub const PROTOCOL_VERSION: u32 = 1;

/// Message type tags on the wire.
mod tag {
    pub const HELLO: u8 = 0x01;
    pub const BLOCK: u8 = 0x02;
    pub const TRANSACTION: u8 = 0x03;
    pub const HEARTBEAT: u8 = 0x04;
    pub const CHECKPOINT: u8 = 0x05;
    pub const REQUEST: u8 = 0x06;
    pub const RESPONSE: u8 = 0x07;
    pub const DISCONNECT: u8 = 0x0F;
}

/// What a request-by-hash is asking for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    Block,
    Transaction,
    Checkpoint,
    /// The peer's checkpoint tip; the hash field is ignored.
    CheckpointTip,
    /// The accepted blocks of the window summarized by a checkpoint.
    WindowBlocks,
}

impl RequestKind {
    fn as_u8(self) -> u8 {
        match self {
            RequestKind::Block => 1,
            RequestKind::Transaction => 2,
            RequestKind::Checkpoint => 3,
            RequestKind::CheckpointTip => 4,
            RequestKind::WindowBlocks => 5,
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(RequestKind::Block),
            2 => Some(RequestKind::Transaction),
            3 => Some(RequestKind::Checkpoint),
            4 => Some(RequestKind::CheckpointTip),
            5 => Some(RequestKind::WindowBlocks),
            _ => None,
        }
    }
}

/// Network protocol messages.
#[derive(Clone, Debug)]
pub enum Message {
    /// Announce ourselves: version, listen port, tier, identity keys.
    Hello {
        version: u32,
        listen_port: u16,
        tier: Tier,
        public_key: SigningPublicKey,
        kem_public_key: KemPublicKey,
    },
    /// Announce a new block.
    Block(Box<Block>),
    /// Broadcast a transaction toward the mempool.
    Transaction(Transaction),
    /// A per-window presence attestation.
    Heartbeat(Heartbeat),
    /// A finality checkpoint.
    Checkpoint(Checkpoint),
    /// Request a record by hash.
    Request { kind: RequestKind, hash: Hash },
    /// Response to a request: the original kind and, when found, the
    /// record's canonical encoding.
    Response {
        kind: RequestKind,
        payload: Option<Vec<u8>>,
    },
    /// Orderly disconnect with a reason code.
    Disconnect { reason: u8 },
}

/// Network errors.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    #[error("peer did not answer within the deadline")]
    Timeout,
    #[error("peer exceeded its rate budget")]
    RateLimited,
    #[error("peer connection lost")]
    Disconnected,
    #[error("transport handshake failed")]
    HandshakeFailed,
    #[error("message exceeds the {} byte limit", constants::MAX_NETWORK_MESSAGE_BYTES)]
    MessageTooLarge,
    #[error("malformed message")]
    Malformed,
}

/// Serialize a message to its framed wire form.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, NetworkError> {
    let (tag, body) = encode_body(msg);
    let framed_len = 1 + body.len();
    if framed_len > constants::MAX_NETWORK_MESSAGE_BYTES {
        return Err(NetworkError::MessageTooLarge);
    }
    let mut buf = Vec::with_capacity(4 + framed_len);
    buf.extend_from_slice(&(framed_len as u32).to_be_bytes());
    buf.push(tag);
    buf.extend_from_slice(&body);
    Ok(buf)
}

fn encode_body(msg: &Message) -> (u8, Vec<u8>) {
    match msg {
        Message::Hello {
            version,
            listen_port,
            tier,
            public_key,
            kem_public_key,
        } => {
            let mut w = Writer::with_capacity(2048);
            w.put_u32(*version);
            w.put_u16(*listen_port);
            w.put_u8(tier.as_u8());
            w.put_bytes(public_key.as_bytes());
            w.put_bytes(kem_public_key.as_bytes());
            (tag::HELLO, w.into_bytes())
        }
        Message::Block(block) => (tag::BLOCK, block.encode()),
        Message::Transaction(tx) => (tag::TRANSACTION, tx.encode()),
        Message::Heartbeat(hb) => (tag::HEARTBEAT, encode_heartbeat(hb)),
        Message::Checkpoint(cp) => (tag::CHECKPOINT, cp.encode()),
        Message::Request { kind, hash } => {
            let mut w = Writer::with_capacity(33);
            w.put_u8(kind.as_u8());
            w.put_hash(hash);
            (tag::REQUEST, w.into_bytes())
        }
        Message::Response { kind, payload } => {
            let mut w = Writer::with_capacity(64);
            w.put_u8(kind.as_u8());
            w.put_opt_bytes(payload.as_deref());
            (tag::RESPONSE, w.into_bytes())
        }
        Message::Disconnect { reason } => (tag::DISCONNECT, vec![*reason]),
    }
}

/// Deserialize one framed message. Rejects frames whose declared length
/// exceeds the protocol limit before any allocation happens.
pub fn decode_message(data: &[u8]) -> Option<Message> {
    if data.len() < 5 {
        return None;
    }
    let len = u32::from_be_bytes(data[..4].try_into().ok()?) as usize;
    if len == 0 || len > constants::MAX_NETWORK_MESSAGE_BYTES {
        return None;
    }
    if data.len() < 4 + len {
        return None;
    }
    let tag_byte = data[4];
    let body = &data[5..4 + len];
    decode_body(tag_byte, body)
}

/// Total frame length (prefix included) declared by a partial header, for
/// stream reassembly.
pub fn frame_length(header: &[u8; 4]) -> Option<usize> {
    let len = u32::from_be_bytes(*header) as usize;
    if len == 0 || len > constants::MAX_NETWORK_MESSAGE_BYTES {
        return None;
    }
    Some(4 + len)
}

fn decode_body(tag_byte: u8, body: &[u8]) -> Option<Message> {
    match tag_byte {
        tag::HELLO => {
            let mut r = Reader::new(body);
            let version = r.u32()?;
            let listen_port = r.u16()?;
            let tier = Tier::from_u8(r.u8()?)?;
            let public_key = SigningPublicKey::from_bytes(r.bytes()?)?;
            let kem_public_key = KemPublicKey::from_bytes(r.bytes()?)?;
            if !r.is_exhausted() {
                return None;
            }
            Some(Message::Hello {
                version,
                listen_port,
                tier,
                public_key,
                kem_public_key,
            })
        }
        tag::BLOCK => Block::decode_exact(body).ok().map(|b| Message::Block(Box::new(b))),
        tag::TRANSACTION => Transaction::decode_exact(body).ok().map(Message::Transaction),
        tag::HEARTBEAT => decode_heartbeat(body).map(Message::Heartbeat),
        tag::CHECKPOINT => Checkpoint::decode_exact(body).map(Message::Checkpoint),
        tag::REQUEST => {
            let mut r = Reader::new(body);
            let kind = RequestKind::from_u8(r.u8()?)?;
            let hash = r.hash()?;
            if !r.is_exhausted() {
                return None;
            }
            Some(Message::Request { kind, hash })
        }
        tag::RESPONSE => {
            let mut r = Reader::new(body);
            let kind = RequestKind::from_u8(r.u8()?)?;
            let payload = r.opt_bytes()?;
            if !r.is_exhausted() {
                return None;
            }
            Some(Message::Response { kind, payload })
        }
        tag::DISCONNECT => {
            if body.len() != 1 {
                return None;
            }
            Some(Message::Disconnect { reason: body[0] })
        }
        _ => None,
    }
}

fn encode_heartbeat(hb: &Heartbeat) -> Vec<u8> {
    let mut w = Writer::with_capacity(256);
    w.put_hash(&hb.participant);
    w.put_u64(hb.window);
    w.put_u8(hb.source.as_u8());
    match &hb.proof {
        HeartbeatProof::DelayProof(proof) => {
            w.put_u8(1);
            w.put_u64(proof.iterations);
            w.put_u64(proof.checkpoint_interval);
            w.put_u32(proof.checkpoints.len() as u32);
            for cp in &proof.checkpoints {
                w.put_hash(cp);
            }
        }
        HeartbeatProof::VerifiedTimestamp { at } => {
            w.put_u8(2);
            w.put_i64(at.secs);
            w.put_u32(at.nanos);
        }
        HeartbeatProof::Aggregated { at, aggregator } => {
            w.put_u8(3);
            w.put_i64(at.secs);
            w.put_u32(at.nanos);
            w.put_hash(aggregator);
        }
    }
    w.put_bytes(hb.signature.as_bytes());
    w.into_bytes()
}

fn decode_heartbeat(body: &[u8]) -> Option<Heartbeat> {
    let mut r = Reader::new(body);
    let participant = r.hash()?;
    let window = r.u64()?;
    let source = Tier::from_u8(r.u8()?)?;
    let proof = match r.u8()? {
        1 => {
            let iterations = r.u64()?;
            let checkpoint_interval = r.u64()?;
            let count = r.u32()? as usize;
            if count == 0 || count > r.remaining() / 32 + 1 {
                return None;
            }
            let mut checkpoints = Vec::with_capacity(count);
            for _ in 0..count {
                checkpoints.push(r.hash()?);
            }
            let input = checkpoints[0];
            let output = *checkpoints.last()?;
            HeartbeatProof::DelayProof(VdfProof {
                input,
                output,
                iterations,
                checkpoint_interval,
                checkpoints,
            })
        }
        2 => HeartbeatProof::VerifiedTimestamp {
            at: UtcInstant::new(r.i64()?, r.u32()?),
        },
        3 => HeartbeatProof::Aggregated {
            at: UtcInstant::new(r.i64()?, r.u32()?),
            aggregator: r.hash()?,
        },
        _ => return None,
    };
    let signature = Signature::from_bytes(r.bytes()?)?;
    if !r.is_exhausted() {
        return None;
    }
    Some(Heartbeat {
        participant,
        window,
        proof,
        source,
        signature,
    })
}
