//! Verifiable Random Function (VRF) for the leader lottery.
//!
//! A VRF produces a pseudorandom output that can be publicly verified but not
//! predicted without the secret key. Used to select a block producer per slot
//! without any coordinator.
//!
//! Construction: `output = SHAKE256(prf_key ‖ input)` where `prf_key` is
//! derived from the signing secret key; the proof is a SPHINCS+ signature
//! over `input ‖ output`, verifiable under the participant's registered
//! public key. The PRF binds the output to the secret key; the signature
//! binds it to the identity.

use serde::{Deserialize, Serialize};

use super::keys::{Signature, SigningKeypair, SigningPublicKey};
use crate::Hash;

/// A VRF output and its proof.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VrfOutput {
    /// The pseudorandom value β (32 bytes)
    pub value: Hash,
    /// The proof: a SPHINCS+ signature over `input ‖ value`
    pub proof: Signature,
}

impl VrfOutput {
    /// Evaluate the VRF for a given input.
    ///
    /// The PRF key is derived from the secret key with SHAKE256 and never
    /// leaves this function; identical `(sk, input)` pairs always produce
    /// identical outputs.
    pub fn evaluate(keypair: &SigningKeypair, input: &[u8]) -> Self {
        let mut prf_material = Vec::with_capacity(keypair.secret_bytes().len() + 16);
        prf_material.extend_from_slice(b"tempora.vrf.prf\x00");
        prf_material.extend_from_slice(keypair.secret_bytes());
        let prf_key = crate::shake256(&prf_material, 32);

        let mut prf_input = Vec::with_capacity(32 + input.len());
        prf_input.extend_from_slice(&prf_key);
        prf_input.extend_from_slice(input);
        let value = crate::shake256_32(&prf_input);

        let proof = keypair.sign(&Self::sign_data(input, &value));
        VrfOutput { value, proof }
    }

    /// Verify the VRF proof against the producer's registered public key.
    pub fn verify(&self, public_key: &SigningPublicKey, input: &[u8]) -> bool {
        public_key.verify(&Self::sign_data(input, &self.value), &self.proof)
    }

    /// The message covered by the proof signature: `input ‖ output` with
    /// domain separation and length prefixes.
    fn sign_data(input: &[u8], value: &Hash) -> Hash {
        crate::hash_concat(&[b"tempora.vrf", input, value])
    }

    /// Check whether β wins a lottery with probability `weight / total`.
    ///
    /// Interprets the first 8 bytes of β as a big-endian integer v and tests
    /// `v / 2^64 < weight / total` entirely in u128 fixed point, so every
    /// node reaches the same verdict bit-for-bit.
    pub fn wins_lottery(&self, weight: u64, total: u64) -> bool {
        if total == 0 || weight == 0 {
            return false;
        }
        if weight >= total {
            return true;
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.value[..8]);
        let v = u64::from_be_bytes(bytes) as u128;
        v * (total as u128) < (weight as u128) << 64
    }

    /// Deterministic tiebreak key derived from β.
    pub fn sort_key(&self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.value[..8]);
        u64::from_be_bytes(bytes)
    }
}

/// Build the lottery input for a slot: previous checkpoint seed ‖ slot index.
pub fn lottery_input(checkpoint_seed: &Hash, slot: u64) -> Vec<u8> {
    crate::hash_concat(&[b"tempora.lottery", checkpoint_seed, &slot.to_be_bytes()]).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vrf_evaluate_verify() {
        let kp = SigningKeypair::generate();
        let input = lottery_input(&[7u8; 32], 42);
        let output = VrfOutput::evaluate(&kp, &input);
        assert!(output.verify(&kp.public, &input));
    }

    #[test]
    fn vrf_wrong_key_fails() {
        let kp1 = SigningKeypair::generate();
        let kp2 = SigningKeypair::generate();
        let output = VrfOutput::evaluate(&kp1, b"test");
        assert!(!output.verify(&kp2.public, b"test"));
    }

    #[test]
    fn vrf_wrong_input_fails() {
        let kp = SigningKeypair::generate();
        let output = VrfOutput::evaluate(&kp, b"input1");
        assert!(!output.verify(&kp.public, b"input2"));
    }

    #[test]
    fn vrf_tampered_value_fails() {
        let kp = SigningKeypair::generate();
        let mut output = VrfOutput::evaluate(&kp, b"input");
        output.value[0] ^= 1;
        assert!(!output.verify(&kp.public, b"input"));
    }

    #[test]
    fn vrf_deterministic() {
        let kp = SigningKeypair::generate();
        let o1 = VrfOutput::evaluate(&kp, b"same-input");
        let o2 = VrfOutput::evaluate(&kp, b"same-input");
        assert_eq!(o1.value, o2.value);
    }

    #[test]
    fn vrf_differs_per_key() {
        let kp1 = SigningKeypair::generate();
        let kp2 = SigningKeypair::generate();
        let o1 = VrfOutput::evaluate(&kp1, b"input");
        let o2 = VrfOutput::evaluate(&kp2, b"input");
        assert_ne!(o1.value, o2.value);
    }

    #[test]
    fn lottery_edge_weights() {
        let kp = SigningKeypair::generate();
        let output = VrfOutput::evaluate(&kp, b"slot");
        assert!(!output.wins_lottery(0, 100));
        assert!(!output.wins_lottery(50, 0));
        assert!(output.wins_lottery(100, 100));
        assert!(output.wins_lottery(200, 100));
    }

    #[test]
    fn lottery_rate_roughly_matches_weight() {
        // With weight/total = 1/2, about half of the evaluations win.
        let kp = SigningKeypair::generate();
        let total = 64;
        let mut wins = 0;
        for slot in 0..total {
            let input = lottery_input(&[1u8; 32], slot);
            let output = VrfOutput::evaluate(&kp, &input);
            if output.wins_lottery(1, 2) {
                wins += 1;
            }
        }
        // Expected ~32; allow a wide margin.
        assert!((10..54).contains(&wins), "expected ~32 wins, got {}", wins);
    }

    #[test]
    fn lottery_input_distinct_per_slot() {
        let seed = [9u8; 32];
        assert_ne!(lottery_input(&seed, 1), lottery_input(&seed, 2));
    }
}
