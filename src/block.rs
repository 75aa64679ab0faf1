//! Block model: header fields, canonical wire encoding, structural
//! validation.
//!
//! A block references one to eight recent DAG tips, carries the producer's
//! VRF lottery proof for its slot and an embedded delay-function proof
//! anchored to a finality window, and is signed over its identifier. The
//! identifier is the hash of the canonical encoding minus the signature, so
//! serialize → deserialize is bit-identical and the id commits to every
//! other field.

use serde::{Deserialize, Serialize};

use crate::crypto::keys::{Signature, SigningKeypair, SigningPublicKey};
use crate::crypto::merkle;
use crate::crypto::vrf::VrfOutput;
use crate::temporal::clock::UtcInstant;
use crate::temporal::vdf::VdfProof;
use crate::transaction::{Transaction, ValidationError};
use crate::wire::{Reader, Writer};
use crate::{constants, Hash};

/// Unique identifier for a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub Hash);

impl BlockId {
    /// Short hex prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

/// A delay-function proof bound to the finality window it was computed for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowProof {
    pub window: u64,
    pub proof: VdfProof,
}

/// A block in the DAG.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub version: u32,
    /// Parent block IDs (1..=MAX_PARENTS; empty only for genesis).
    pub parents: Vec<BlockId>,
    /// Producer's verification key. The participant id is its fingerprint.
    pub producer: SigningPublicKey,
    /// VRF lottery proof over (previous checkpoint seed, slot).
    pub vrf: VrfOutput,
    /// Merkle root over the transaction identifiers.
    pub tx_root: Hash,
    /// Delay-function proof for the declared finality window.
    pub vdf: WindowProof,
    /// Producer's wall-clock timestamp.
    pub timestamp: UtcInstant,
    pub transactions: Vec<Transaction>,
    /// Producer signature over the block identifier.
    pub signature: Signature,
}

impl Block {
    /// The leader-selection slot this block claims: its timestamp truncated
    /// to whole slots.
    pub fn slot(&self) -> u64 {
        if self.timestamp.secs <= 0 {
            return 0;
        }
        self.timestamp.secs as u64 / constants::SLOT_SECS
    }

    /// Producer participant identifier.
    pub fn producer_id(&self) -> Hash {
        self.producer.fingerprint()
    }

    /// Compute the Merkle root over a transaction list.
    pub fn compute_tx_root(transactions: &[Transaction]) -> Hash {
        if transactions.is_empty() {
            return [0u8; 32];
        }
        let leaves: Vec<Hash> = transactions
            .iter()
            .map(|tx| merkle::leaf_hash(&tx.tx_id().0))
            .collect();
        merkle::merkle_root(&leaves)
    }

    fn encode_into(&self, w: &mut Writer, with_signature: bool) {
        w.put_u32(self.version);
        w.put_u8(self.parents.len() as u8);
        for parent in &self.parents {
            w.put_hash(&parent.0);
        }
        w.put_bytes(self.producer.as_bytes());
        w.put_hash(&self.vrf.value);
        w.put_bytes(self.vrf.proof.as_bytes());
        w.put_hash(&self.tx_root);
        w.put_hash(&self.vdf.proof.output);
        w.put_bytes(&encode_window_proof(&self.vdf));
        w.put_i64(self.timestamp.secs);
        w.put_u32(self.timestamp.nanos);
        w.put_u32(self.transactions.len() as u32);
        for tx in &self.transactions {
            tx.encode_into_writer(w);
        }
        if with_signature {
            w.put_bytes(self.signature.as_bytes());
        }
    }

    /// Canonical wire encoding.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(4096);
        self.encode_into(&mut w, true);
        w.into_bytes()
    }

    /// Decode a block from its canonical encoding, requiring the input to
    /// be fully consumed.
    pub fn decode_exact(bytes: &[u8]) -> Result<Self, ValidationError> {
        if bytes.len() > constants::BLOCK_BYTES_MAX {
            return Err(ValidationError::BadEncoding);
        }
        let mut r = Reader::new(bytes);
        let block = Self::decode(&mut r)?;
        if !r.is_exhausted() {
            return Err(ValidationError::BadEncoding);
        }
        Ok(block)
    }

    fn decode(r: &mut Reader) -> Result<Self, ValidationError> {
        let version = r.u32().ok_or(ValidationError::BadEncoding)?;
        let parent_count = r.u8().ok_or(ValidationError::BadEncoding)? as usize;
        if parent_count > constants::MAX_PARENTS {
            return Err(ValidationError::BadEncoding);
        }
        let mut parents = Vec::with_capacity(parent_count);
        for _ in 0..parent_count {
            parents.push(BlockId(r.hash().ok_or(ValidationError::BadEncoding)?));
        }
        let producer = SigningPublicKey::from_bytes(r.bytes().ok_or(ValidationError::BadEncoding)?)
            .ok_or(ValidationError::BadEncoding)?;
        let vrf_value = r.hash().ok_or(ValidationError::BadEncoding)?;
        let vrf_proof = Signature::from_bytes(r.bytes().ok_or(ValidationError::BadEncoding)?)
            .ok_or(ValidationError::BadEncoding)?;
        let tx_root = r.hash().ok_or(ValidationError::BadEncoding)?;
        let vdf_output = r.hash().ok_or(ValidationError::BadEncoding)?;
        let vdf_bytes = r.bytes().ok_or(ValidationError::BadEncoding)?;
        let vdf = decode_window_proof(&vdf_bytes, &vdf_output)?;
        let secs = r.i64().ok_or(ValidationError::BadEncoding)?;
        let nanos = r.u32().ok_or(ValidationError::BadEncoding)?;
        let tx_count = r.u32().ok_or(ValidationError::BadEncoding)? as usize;
        if tx_count > constants::MAX_TXS_PER_BLOCK {
            return Err(ValidationError::BadEncoding);
        }
        let mut transactions = Vec::with_capacity(tx_count);
        for _ in 0..tx_count {
            transactions.push(Transaction::decode(r)?);
        }
        let signature = Signature::from_bytes(r.bytes().ok_or(ValidationError::BadEncoding)?)
            .ok_or(ValidationError::BadEncoding)?;
        Ok(Block {
            version,
            parents,
            producer,
            vrf: VrfOutput {
                value: vrf_value,
                proof: vrf_proof,
            },
            tx_root,
            vdf,
            timestamp: UtcInstant::new(secs, nanos),
            transactions,
            signature,
        })
    }

    /// The block identifier: hash of the canonical encoding minus the
    /// signature.
    pub fn id(&self) -> BlockId {
        let mut w = Writer::with_capacity(4096);
        self.encode_into(&mut w, false);
        BlockId(crate::hash_domain(b"tempora.block.id", w.as_bytes()))
    }

    /// Sign the block with the producer's key.
    pub fn sign(&mut self, keypair: &SigningKeypair) {
        self.signature = keypair.sign(&self.id().0);
    }

    /// Structural validation: parent bounds and uniqueness, transaction
    /// root, structural transaction checks, and the producer signature.
    ///
    /// `is_genesis` relaxes the parent minimum and the signature check for
    /// the synthetic genesis block only.
    pub fn validate_structure(&self, is_genesis: bool) -> Result<(), ValidationError> {
        if !is_genesis && self.parents.is_empty() {
            return Err(ValidationError::UnknownParent);
        }
        if self.parents.len() > constants::MAX_PARENTS {
            return Err(ValidationError::BadEncoding);
        }
        let mut seen = std::collections::HashSet::new();
        for parent in &self.parents {
            if !seen.insert(parent) {
                return Err(ValidationError::BadEncoding);
            }
        }
        if self.transactions.len() > constants::MAX_TXS_PER_BLOCK {
            return Err(ValidationError::BadEncoding);
        }
        if self.tx_root != Self::compute_tx_root(&self.transactions) {
            return Err(ValidationError::BadEncoding);
        }
        for tx in &self.transactions {
            tx.validate_structure()?;
        }
        if !is_genesis && !self.producer.verify(&self.id().0, &self.signature) {
            return Err(ValidationError::BadSignature);
        }
        Ok(())
    }
}

fn encode_window_proof(wp: &WindowProof) -> Vec<u8> {
    let mut w = Writer::with_capacity(64 + wp.proof.checkpoints.len() * 32);
    w.put_u64(wp.window);
    w.put_u64(wp.proof.iterations);
    w.put_u64(wp.proof.checkpoint_interval);
    w.put_u32(wp.proof.checkpoints.len() as u32);
    for cp in &wp.proof.checkpoints {
        w.put_hash(cp);
    }
    w.into_bytes()
}

fn decode_window_proof(bytes: &[u8], output: &Hash) -> Result<WindowProof, ValidationError> {
    let mut r = Reader::new(bytes);
    let window = r.u64().ok_or(ValidationError::BadEncoding)?;
    let iterations = r.u64().ok_or(ValidationError::BadEncoding)?;
    let checkpoint_interval = r.u64().ok_or(ValidationError::BadEncoding)?;
    let count = r.u32().ok_or(ValidationError::BadEncoding)? as usize;
    // Each checkpoint is 32 bytes; bound the allocation by the input size.
    if count > bytes.len() / 32 + 1 {
        return Err(ValidationError::BadEncoding);
    }
    let mut checkpoints = Vec::with_capacity(count);
    for _ in 0..count {
        checkpoints.push(r.hash().ok_or(ValidationError::BadEncoding)?);
    }
    if !r.is_exhausted() || checkpoints.is_empty() {
        return Err(ValidationError::BadEncoding);
    }
    let input = checkpoints[0];
    // The standalone vdf_output field must agree with the proof chain.
    if checkpoints.last() != Some(output) {
        return Err(ValidationError::BadEncoding);
    }
    Ok(WindowProof {
        window,
        proof: VdfProof {
            input,
            output: *output,
            iterations,
            checkpoint_interval,
            checkpoints,
        },
    })
}

impl Transaction {
    /// Encode into an existing writer (used by the block codec).
    pub(crate) fn encode_into_writer(&self, w: &mut Writer) {
        w.put_raw(&self.encode());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::vrf;
    use crate::temporal::vdf;

    fn test_vdf() -> WindowProof {
        static CACHED: std::sync::OnceLock<crate::temporal::vdf::VdfProof> =
            std::sync::OnceLock::new();
        let proof = CACHED
            .get_or_init(|| {
                let input = vdf::window_input(&[0u8; 32], 1);
                vdf::prove(&input, constants::VDF_MIN_ITERATIONS, 4096).unwrap()
            })
            .clone();
        WindowProof { window: 1, proof }
    }

    fn test_block(keypair: &SigningKeypair, parents: Vec<BlockId>, slot_secs: i64) -> Block {
        let input = vrf::lottery_input(&[0u8; 32], slot_secs as u64);
        let mut block = Block {
            version: 1,
            parents,
            producer: keypair.public.clone(),
            vrf: VrfOutput::evaluate(keypair, &input),
            tx_root: Block::compute_tx_root(&[]),
            vdf: test_vdf(),
            timestamp: UtcInstant::new(slot_secs, 0),
            transactions: vec![],
            signature: Signature::empty(),
        };
        block.sign(keypair);
        block
    }

    #[test]
    fn encode_decode_bit_identical() {
        let kp = SigningKeypair::generate();
        let block = test_block(&kp, vec![BlockId([1u8; 32])], 100);
        let bytes = block.encode();
        let decoded = Block::decode_exact(&bytes).unwrap();
        assert_eq!(decoded.encode(), bytes);
        assert_eq!(decoded.id(), block.id());
    }

    #[test]
    fn id_commits_to_parents() {
        let kp = SigningKeypair::generate();
        let a = test_block(&kp, vec![BlockId([1u8; 32])], 100);
        let b = test_block(&kp, vec![BlockId([2u8; 32])], 100);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn valid_block_passes_structure() {
        let kp = SigningKeypair::generate();
        let block = test_block(&kp, vec![BlockId([1u8; 32])], 100);
        block.validate_structure(false).unwrap();
    }

    #[test]
    fn zero_parents_invalid() {
        let kp = SigningKeypair::generate();
        let block = test_block(&kp, vec![], 100);
        assert_eq!(
            block.validate_structure(false),
            Err(ValidationError::UnknownParent)
        );
    }

    #[test]
    fn nine_parents_invalid() {
        let kp = SigningKeypair::generate();
        let parents: Vec<BlockId> = (0..9u8).map(|i| BlockId([i; 32])).collect();
        let block = test_block(&kp, parents, 100);
        assert_eq!(
            block.validate_structure(false),
            Err(ValidationError::BadEncoding)
        );
    }

    #[test]
    fn one_parent_valid_eight_valid() {
        let kp = SigningKeypair::generate();
        let one = test_block(&kp, vec![BlockId([1u8; 32])], 100);
        one.validate_structure(false).unwrap();
        let parents: Vec<BlockId> = (0..8u8).map(|i| BlockId([i; 32])).collect();
        let eight = test_block(&kp, parents, 100);
        eight.validate_structure(false).unwrap();
    }

    #[test]
    fn duplicate_parent_invalid() {
        let kp = SigningKeypair::generate();
        let p = BlockId([1u8; 32]);
        let block = test_block(&kp, vec![p, p], 100);
        assert_eq!(
            block.validate_structure(false),
            Err(ValidationError::BadEncoding)
        );
    }

    #[test]
    fn tampered_signature_rejected() {
        let kp = SigningKeypair::generate();
        let other = SigningKeypair::generate();
        let mut block = test_block(&kp, vec![BlockId([1u8; 32])], 100);
        block.signature = other.sign(b"unrelated");
        assert_eq!(
            block.validate_structure(false),
            Err(ValidationError::BadSignature)
        );
    }

    #[test]
    fn wrong_tx_root_rejected() {
        let kp = SigningKeypair::generate();
        let mut block = test_block(&kp, vec![BlockId([1u8; 32])], 100);
        block.tx_root = [9u8; 32];
        block.sign(&kp);
        assert_eq!(
            block.validate_structure(false),
            Err(ValidationError::BadEncoding)
        );
    }

    #[test]
    fn vdf_output_mismatch_rejected_on_decode() {
        let kp = SigningKeypair::generate();
        let mut tampered = test_block(&kp, vec![BlockId([1u8; 32])], 100);
        // The standalone vdf_output field no longer matches the proof's
        // final checkpoint.
        tampered.vdf.proof.output[0] ^= 1;
        assert_eq!(
            Block::decode_exact(&tampered.encode()),
            Err(ValidationError::BadEncoding)
        );
    }

    #[test]
    fn slot_derived_from_timestamp() {
        let kp = SigningKeypair::generate();
        let block = test_block(&kp, vec![BlockId([1u8; 32])], 1234);
        assert_eq!(block.slot(), 1234);
    }
}
