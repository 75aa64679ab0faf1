//! Hash-based commitments.
//!
//! `Commit(msg, randomness) = SHA3-256("tempora.commit" ‖ randomness ‖ msg)`.
//!
//! Properties:
//! - **Hiding**: given C, the message cannot be determined without the
//!   randomness
//! - **Binding**: finding `(msg', r') != (msg, r)` with the same commitment
//!   requires a SHA3-256 collision
//! - **No trusted setup**: pure hash construction

use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::Hash;

/// The 32-byte randomness that opens a commitment. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CommitRandomness(pub(crate) [u8; 32]);

impl CommitRandomness {
    /// Sample fresh randomness from the OS CSPRNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        CommitRandomness(bytes)
    }

    /// Construct from fixed bytes (tests and deterministic derivations).
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        CommitRandomness(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// A binding, hiding commitment to a byte string.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commitment(pub Hash);

impl Commitment {
    /// Commit to a message under the given randomness.
    pub fn commit(msg: &[u8], randomness: &CommitRandomness) -> Self {
        Commitment(crate::hash_concat(&[b"tempora.commit", &randomness.0, msg]))
    }

    /// Verify an opening in constant time over the digest comparison.
    pub fn verify(&self, msg: &[u8], randomness: &CommitRandomness) -> bool {
        let expected = Self::commit(msg, randomness);
        crate::constant_time_eq(&self.0, &expected.0)
    }
}
