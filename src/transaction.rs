//! Transaction model: typed records, canonical encoding, validation.
//!
//! A transaction spends previously created outputs and creates new ones.
//! Each input carries a signature over the spend, verifiable under the
//! registered key of the output's owner. Outputs carry a privacy-tier tag;
//! higher tiers reserve an auxiliary payload slot but the core engine
//! treats that payload as opaque bytes.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::crypto::keys::{Signature, SigningKeypair, SigningPublicKey};
use crate::temporal::clock::UtcInstant;
use crate::wire::{Reader, Writer};
use crate::{constants, Hash};

/// Errors from validating blocks and transactions.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("malformed canonical encoding")]
    BadEncoding,
    #[error("referenced parent block is unknown")]
    UnknownParent,
    #[error("signature verification failed")]
    BadSignature,
    #[error("transaction conflicts with an already-spent output")]
    TransactionConflict,
    #[error("outputs plus fee are not covered by inputs")]
    OutputOverflow,
    #[error("output privacy tier below the tier of a consumed input")]
    MonotonicPrivacyViolation,
    #[error("producer signed two blocks for the same slot")]
    Equivocation,
}

/// Privacy tier of an output. The engine enforces only the tag's
/// monotonicity; tiers above T0 are carried, not interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PrivacyTier {
    T0,
    T1,
    T2,
    T3,
}

impl PrivacyTier {
    pub fn as_u8(self) -> u8 {
        match self {
            PrivacyTier::T0 => 0,
            PrivacyTier::T1 => 1,
            PrivacyTier::T2 => 2,
            PrivacyTier::T3 => 3,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(PrivacyTier::T0),
            1 => Some(PrivacyTier::T1),
            2 => Some(PrivacyTier::T2),
            3 => Some(PrivacyTier::T3),
            _ => None,
        }
    }
}

/// Identifier of a spendable output: `H(tx_id ‖ output_index)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputId(pub Hash);

/// Transaction identifier: hash of the canonical encoding minus signatures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxId(pub Hash);

/// A reference to a previous output together with the spend authorization.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub output_id: OutputId,
    /// Signature over `(output_id, sighash)` by the output's owner.
    pub signature: Signature,
}

/// A newly created output.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxOutput {
    /// Recipient participant identifier (hash of their verification key).
    pub recipient: Hash,
    /// Amount in base units.
    pub amount: u64,
    pub tier: PrivacyTier,
}

/// A transfer of value between participants.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub fee: u64,
    /// Opaque payload slot for privacy tiers above T0.
    pub aux_payload: Option<Vec<u8>>,
}

/// An entry in the unspent-output set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UtxoEntry {
    /// Participant identifier of the exclusive owner.
    pub owner: Hash,
    pub amount: u64,
    pub tier: PrivacyTier,
    /// UTC time of the block that created this output.
    pub birth: UtcInstant,
}

/// Read access to the state a transaction validates against: the
/// unspent-output set and the participant key registry. Implemented by the
/// DAG store's best view and by the mempool's overlay.
pub trait SpendContext {
    fn output(&self, id: &OutputId) -> Option<UtxoEntry>;
    fn participant_key(&self, id: &Hash) -> Option<SigningPublicKey>;
}

impl Transaction {
    /// Canonical encoding with signatures included (the wire form).
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(256);
        self.encode_into(&mut w, true);
        w.into_bytes()
    }

    fn encode_into(&self, w: &mut Writer, with_signatures: bool) {
        w.put_u32(self.version);
        w.put_u32(self.inputs.len() as u32);
        for input in &self.inputs {
            w.put_hash(&input.output_id.0);
            if with_signatures {
                w.put_bytes(input.signature.as_bytes());
            }
        }
        w.put_u32(self.outputs.len() as u32);
        for output in &self.outputs {
            w.put_hash(&output.recipient);
            w.put_u64(output.amount);
            w.put_u8(output.tier.as_u8());
        }
        w.put_u64(self.fee);
        w.put_opt_bytes(self.aux_payload.as_deref());
    }

    /// Decode a transaction from its canonical encoding. The reverse of
    /// [`encode`](Self::encode); re-encoding yields bit-identical bytes.
    pub fn decode(r: &mut Reader) -> Result<Self, ValidationError> {
        let version = r.u32().ok_or(ValidationError::BadEncoding)?;
        let input_count = r.u32().ok_or(ValidationError::BadEncoding)? as usize;
        if input_count > constants::MAX_TX_IO {
            return Err(ValidationError::BadEncoding);
        }
        let mut inputs = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            let output_id = OutputId(r.hash().ok_or(ValidationError::BadEncoding)?);
            let sig_bytes = r.bytes().ok_or(ValidationError::BadEncoding)?;
            let signature =
                Signature::from_bytes(sig_bytes).ok_or(ValidationError::BadEncoding)?;
            inputs.push(TxInput {
                output_id,
                signature,
            });
        }
        let output_count = r.u32().ok_or(ValidationError::BadEncoding)? as usize;
        if output_count > constants::MAX_TX_IO {
            return Err(ValidationError::BadEncoding);
        }
        let mut outputs = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            let recipient = r.hash().ok_or(ValidationError::BadEncoding)?;
            let amount = r.u64().ok_or(ValidationError::BadEncoding)?;
            let tier = PrivacyTier::from_u8(r.u8().ok_or(ValidationError::BadEncoding)?)
                .ok_or(ValidationError::BadEncoding)?;
            outputs.push(TxOutput {
                recipient,
                amount,
                tier,
            });
        }
        let fee = r.u64().ok_or(ValidationError::BadEncoding)?;
        let aux_payload = r.opt_bytes().ok_or(ValidationError::BadEncoding)?;
        if let Some(aux) = &aux_payload {
            if aux.len() > constants::MAX_AUX_PAYLOAD {
                return Err(ValidationError::BadEncoding);
            }
        }
        Ok(Transaction {
            version,
            inputs,
            outputs,
            fee,
            aux_payload,
        })
    }

    /// Decode from a standalone byte slice, requiring full consumption.
    pub fn decode_exact(bytes: &[u8]) -> Result<Self, ValidationError> {
        let mut r = Reader::new(bytes);
        let tx = Self::decode(&mut r)?;
        if !r.is_exhausted() {
            return Err(ValidationError::BadEncoding);
        }
        Ok(tx)
    }

    /// The signing hash: canonical encoding without input signatures, so
    /// every input signs the same transaction skeleton.
    pub fn sighash(&self) -> Hash {
        let mut w = Writer::with_capacity(128);
        self.encode_into(&mut w, false);
        crate::hash_domain(b"tempora.tx.sighash", w.as_bytes())
    }

    /// Transaction identifier.
    pub fn tx_id(&self) -> TxId {
        TxId(crate::hash_domain(b"tempora.tx.id", &self.sighash()))
    }

    /// The message each input's owner signs.
    pub fn spend_message(sighash: &Hash, output_id: &OutputId) -> Hash {
        crate::hash_concat(&[b"tempora.tx.spend", &output_id.0, sighash])
    }

    /// Identifier of this transaction's `index`-th output.
    pub fn output_id(&self, index: u32) -> OutputId {
        OutputId(crate::hash_concat(&[
            b"tempora.output",
            &self.tx_id().0,
            &index.to_be_bytes(),
        ]))
    }

    /// Estimated wire size, used for fee-per-byte priority.
    pub fn estimated_size(&self) -> usize {
        self.encode().len()
    }

    /// Fee per byte in milli-units, the mempool's priority measure.
    pub fn fee_per_byte_milli(&self) -> u64 {
        let size = self.estimated_size().max(1) as u64;
        self.fee.saturating_mul(1000) / size
    }

    /// Context-free structural checks: I/O bounds, duplicate outputs,
    /// duplicate input references, and amount overflow.
    pub fn validate_structure(&self) -> Result<(), ValidationError> {
        if self.inputs.is_empty() || self.outputs.is_empty() {
            return Err(ValidationError::BadEncoding);
        }
        if self.inputs.len() > constants::MAX_TX_IO || self.outputs.len() > constants::MAX_TX_IO {
            return Err(ValidationError::BadEncoding);
        }
        if let Some(aux) = &self.aux_payload {
            if aux.len() > constants::MAX_AUX_PAYLOAD {
                return Err(ValidationError::BadEncoding);
            }
        }

        // No double reference to the same output inside one transaction.
        let unique_inputs: HashSet<_> = self.inputs.iter().map(|i| i.output_id).collect();
        if unique_inputs.len() != self.inputs.len() {
            return Err(ValidationError::TransactionConflict);
        }

        // All outputs unique.
        let unique_outputs: HashSet<_> = self.outputs.iter().collect();
        if unique_outputs.len() != self.outputs.len() {
            return Err(ValidationError::BadEncoding);
        }

        // Output totals must not overflow before the cover check.
        let mut total: u64 = self.fee;
        for output in &self.outputs {
            total = total
                .checked_add(output.amount)
                .ok_or(ValidationError::OutputOverflow)?;
        }
        Ok(())
    }

    /// Full validation against a spend context: inputs exist, signatures
    /// verify under the owners' registered keys, inputs cover outputs plus
    /// fee exactly, and privacy tiers never decrease from input to output.
    pub fn validate_spend(&self, ctx: &dyn SpendContext) -> Result<(), ValidationError> {
        self.validate_structure()?;

        let sighash = self.sighash();
        let mut input_total: u64 = 0;
        let mut max_input_tier = PrivacyTier::T0;

        for input in &self.inputs {
            let entry = ctx
                .output(&input.output_id)
                .ok_or(ValidationError::TransactionConflict)?;
            let owner_key = ctx
                .participant_key(&entry.owner)
                .ok_or(ValidationError::BadSignature)?;
            let msg = Self::spend_message(&sighash, &input.output_id);
            if !owner_key.verify(&msg, &input.signature) {
                return Err(ValidationError::BadSignature);
            }
            input_total = input_total
                .checked_add(entry.amount)
                .ok_or(ValidationError::OutputOverflow)?;
            max_input_tier = max_input_tier.max(entry.tier);
        }

        let output_total: u64 = self.outputs.iter().map(|o| o.amount).sum();
        let required = output_total
            .checked_add(self.fee)
            .ok_or(ValidationError::OutputOverflow)?;
        if input_total != required {
            return Err(ValidationError::OutputOverflow);
        }

        // Monotonic non-decrease: no output may sit below the highest
        // consumed tier.
        for output in &self.outputs {
            if output.tier < max_input_tier {
                return Err(ValidationError::MonotonicPrivacyViolation);
            }
        }

        Ok(())
    }

    /// Sign every input with the given keypair (single-owner transactions).
    pub fn sign_inputs(&mut self, keypair: &SigningKeypair) {
        let sighash = self.sighash();
        for input in &mut self.inputs {
            let msg = Self::spend_message(&sighash, &input.output_id);
            input.signature = keypair.sign(&msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct TestContext {
        outputs: HashMap<OutputId, UtxoEntry>,
        keys: HashMap<Hash, SigningPublicKey>,
    }

    impl SpendContext for TestContext {
        fn output(&self, id: &OutputId) -> Option<UtxoEntry> {
            self.outputs.get(id).cloned()
        }
        fn participant_key(&self, id: &Hash) -> Option<SigningPublicKey> {
            self.keys.get(id).cloned()
        }
    }

    fn funded_context(
        keypair: &SigningKeypair,
        amounts: &[(OutputId, u64, PrivacyTier)],
    ) -> TestContext {
        let owner = keypair.public.fingerprint();
        let mut outputs = HashMap::new();
        for (id, amount, tier) in amounts {
            outputs.insert(
                *id,
                UtxoEntry {
                    owner,
                    amount: *amount,
                    tier: *tier,
                    birth: UtcInstant::new(0, 0),
                },
            );
        }
        let mut keys = HashMap::new();
        keys.insert(owner, keypair.public.clone());
        TestContext { outputs, keys }
    }

    fn transfer(
        keypair: &SigningKeypair,
        spend: OutputId,
        amount: u64,
        fee: u64,
        tier: PrivacyTier,
    ) -> Transaction {
        let mut tx = Transaction {
            version: 1,
            inputs: vec![TxInput {
                output_id: spend,
                signature: Signature::empty(),
            }],
            outputs: vec![TxOutput {
                recipient: crate::sha3(b"recipient"),
                amount,
                tier,
            }],
            fee,
            aux_payload: None,
        };
        tx.sign_inputs(keypair);
        tx
    }

    #[test]
    fn encode_decode_bit_identical() {
        let kp = SigningKeypair::generate();
        let tx = transfer(&kp, OutputId([1u8; 32]), 90, 10, PrivacyTier::T0);
        let bytes = tx.encode();
        let decoded = Transaction::decode_exact(&bytes).unwrap();
        assert_eq!(decoded.encode(), bytes);
        assert_eq!(decoded.tx_id(), tx.tx_id());
    }

    #[test]
    fn decode_rejects_trailing_garbage() {
        let kp = SigningKeypair::generate();
        let tx = transfer(&kp, OutputId([1u8; 32]), 90, 10, PrivacyTier::T0);
        let mut bytes = tx.encode();
        bytes.push(0);
        assert_eq!(
            Transaction::decode_exact(&bytes),
            Err(ValidationError::BadEncoding)
        );
    }

    #[test]
    fn exact_cover_accepted() {
        let kp = SigningKeypair::generate();
        let spend = OutputId([1u8; 32]);
        let ctx = funded_context(&kp, &[(spend, 100, PrivacyTier::T0)]);
        let tx = transfer(&kp, spend, 90, 10, PrivacyTier::T0);
        tx.validate_spend(&ctx).unwrap();
    }

    #[test]
    fn underpay_by_one_rejected() {
        let kp = SigningKeypair::generate();
        let spend = OutputId([1u8; 32]);
        let ctx = funded_context(&kp, &[(spend, 100, PrivacyTier::T0)]);
        // Inputs 100, outputs 91 + fee 10 = 101.
        let tx = transfer(&kp, spend, 91, 10, PrivacyTier::T0);
        assert_eq!(
            tx.validate_spend(&ctx),
            Err(ValidationError::OutputOverflow)
        );
    }

    #[test]
    fn overpay_rejected() {
        let kp = SigningKeypair::generate();
        let spend = OutputId([1u8; 32]);
        let ctx = funded_context(&kp, &[(spend, 100, PrivacyTier::T0)]);
        // Inputs 100, outputs 80 + fee 10 = 90: value would vanish.
        let tx = transfer(&kp, spend, 80, 10, PrivacyTier::T0);
        assert_eq!(
            tx.validate_spend(&ctx),
            Err(ValidationError::OutputOverflow)
        );
    }

    #[test]
    fn missing_input_rejected() {
        let kp = SigningKeypair::generate();
        let ctx = funded_context(&kp, &[]);
        let tx = transfer(&kp, OutputId([9u8; 32]), 90, 10, PrivacyTier::T0);
        assert_eq!(
            tx.validate_spend(&ctx),
            Err(ValidationError::TransactionConflict)
        );
    }

    #[test]
    fn wrong_signer_rejected() {
        let owner = SigningKeypair::generate();
        let thief = SigningKeypair::generate();
        let spend = OutputId([1u8; 32]);
        let ctx = funded_context(&owner, &[(spend, 100, PrivacyTier::T0)]);
        let tx = transfer(&thief, spend, 90, 10, PrivacyTier::T0);
        assert_eq!(tx.validate_spend(&ctx), Err(ValidationError::BadSignature));
    }

    #[test]
    fn tier_downgrade_rejected() {
        let kp = SigningKeypair::generate();
        let spend = OutputId([1u8; 32]);
        let ctx = funded_context(&kp, &[(spend, 100, PrivacyTier::T2)]);
        let tx = transfer(&kp, spend, 90, 10, PrivacyTier::T1);
        assert_eq!(
            tx.validate_spend(&ctx),
            Err(ValidationError::MonotonicPrivacyViolation)
        );
    }

    #[test]
    fn tier_equal_or_higher_accepted() {
        let kp = SigningKeypair::generate();
        let spend = OutputId([1u8; 32]);
        let ctx = funded_context(&kp, &[(spend, 100, PrivacyTier::T1)]);
        let same = transfer(&kp, spend, 90, 10, PrivacyTier::T1);
        same.validate_spend(&ctx).unwrap();
        let higher = transfer(&kp, spend, 90, 10, PrivacyTier::T3);
        higher.validate_spend(&ctx).unwrap();
    }

    #[test]
    fn duplicate_input_rejected() {
        let kp = SigningKeypair::generate();
        let spend = OutputId([1u8; 32]);
        let mut tx = transfer(&kp, spend, 90, 10, PrivacyTier::T0);
        tx.inputs.push(tx.inputs[0].clone());
        assert_eq!(
            tx.validate_structure(),
            Err(ValidationError::TransactionConflict)
        );
    }

    #[test]
    fn duplicate_output_rejected() {
        let kp = SigningKeypair::generate();
        let mut tx = transfer(&kp, OutputId([1u8; 32]), 90, 10, PrivacyTier::T0);
        tx.outputs.push(tx.outputs[0].clone());
        assert_eq!(tx.validate_structure(), Err(ValidationError::BadEncoding));
    }

    #[test]
    fn amount_overflow_rejected() {
        let kp = SigningKeypair::generate();
        let mut tx = transfer(&kp, OutputId([1u8; 32]), u64::MAX, 10, PrivacyTier::T0);
        tx.outputs.push(TxOutput {
            recipient: crate::sha3(b"other"),
            amount: u64::MAX,
            tier: PrivacyTier::T0,
        });
        assert_eq!(
            tx.validate_structure(),
            Err(ValidationError::OutputOverflow)
        );
    }

    #[test]
    fn tx_id_ignores_signatures() {
        let kp1 = SigningKeypair::generate();
        let kp2 = SigningKeypair::generate();
        let mut tx1 = transfer(&kp1, OutputId([1u8; 32]), 90, 10, PrivacyTier::T0);
        let tx2_id;
        {
            let mut tx2 = tx1.clone();
            tx2.sign_inputs(&kp2);
            tx2_id = tx2.tx_id();
        }
        tx1.sign_inputs(&kp1);
        assert_eq!(tx1.tx_id(), tx2_id);
    }

    #[test]
    fn output_ids_distinct_per_index() {
        let kp = SigningKeypair::generate();
        let tx = transfer(&kp, OutputId([1u8; 32]), 90, 10, PrivacyTier::T0);
        assert_ne!(tx.output_id(0), tx.output_id(1));
    }

    #[test]
    fn aux_payload_roundtrip() {
        let kp = SigningKeypair::generate();
        let mut tx = transfer(&kp, OutputId([1u8; 32]), 90, 10, PrivacyTier::T2);
        tx.aux_payload = Some(vec![0xAA; 64]);
        tx.sign_inputs(&kp);
        let decoded = Transaction::decode_exact(&tx.encode()).unwrap();
        assert_eq!(decoded.aux_payload.as_deref(), Some(&[0xAA; 64][..]));
    }
}
