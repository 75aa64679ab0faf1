//! Finality checkpoints and heartbeat aggregation.
//!
//! At each UTC boundary the consensus core assembles a checkpoint for the
//! closed window: a Merkle root over the window's accepted blocks, the
//! aggregated heartbeat attestations, the cumulative delay-function work,
//! and the previous checkpoint hash. A block reaches soft finality when
//! its window's checkpoint lands, medium at the next boundary, hard at the
//! third; reorganizations never cross the latest hard checkpoint.
//!
//! Competing checkpoints for one boundary (partition re-merge) are
//! resolved by valid-heartbeat count, ties by lexicographically smaller
//! checkpoint hash.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::ConsensusError;
use crate::crypto::keys::{Signature, SigningKeypair, SigningPublicKey};
use crate::crypto::merkle;
use crate::reputation::Tier;
use crate::temporal::clock::UtcInstant;
use crate::temporal::vdf::VdfProof;
use crate::wire::{Reader, Writer};
use crate::Hash;

/// Presence evidence carried by a heartbeat, by participation tier.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum HeartbeatProof {
    /// Tier-1: a delay-function proof computed inside the window.
    DelayProof(VdfProof),
    /// Tier-2: a verified wall-clock timestamp.
    VerifiedTimestamp { at: UtcInstant },
    /// Tier-3: an end-user attestation relayed by a Tier-2 aggregator.
    Aggregated { at: UtcInstant, aggregator: Hash },
}

/// A per-window attestation of presence. Ephemeral: pools retain
/// heartbeats for two windows only.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Heartbeat {
    pub participant: Hash,
    pub window: u64,
    pub proof: HeartbeatProof,
    pub source: Tier,
    pub signature: Signature,
}

impl Heartbeat {
    fn sign_data(participant: &Hash, window: u64, source: Tier) -> Hash {
        crate::hash_concat(&[
            b"tempora.heartbeat",
            participant,
            &window.to_be_bytes(),
            &[source.as_u8()],
        ])
    }

    /// Build and sign a heartbeat for a window.
    pub fn create(keypair: &SigningKeypair, window: u64, proof: HeartbeatProof, source: Tier) -> Self {
        let participant = keypair.public.fingerprint();
        let signature = keypair.sign(&Self::sign_data(&participant, window, source));
        Heartbeat {
            participant,
            window,
            proof,
            source,
            signature,
        }
    }

    /// Verify the signature against the participant's registered key. The
    /// tier-specific proof is validated separately by the caller.
    pub fn verify(&self, public_key: &SigningPublicKey) -> bool {
        public_key.fingerprint() == self.participant
            && public_key.verify(
                &Self::sign_data(&self.participant, self.window, self.source),
                &self.signature,
            )
    }
}

/// A finality checkpoint. Immutable once created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The closed finality window this checkpoint summarizes.
    pub window: u64,
    /// The window's closing boundary instant.
    pub boundary: UtcInstant,
    /// Merkle root over the window's accepted blocks, in linearized order.
    pub block_root: Hash,
    pub block_count: u32,
    /// Count of valid heartbeats aggregated for the window.
    pub heartbeat_count: u32,
    /// Merkle root over the attesting participants, sorted.
    pub heartbeat_root: Hash,
    /// Cumulative delay-function iterations across the window's blocks.
    pub vdf_work: u128,
    /// Hash of the previous checkpoint (or the genesis seed).
    pub prev: Hash,
}

impl Checkpoint {
    /// Canonical encoding (wire and hashing form).
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(128);
        w.put_u64(self.window);
        w.put_i64(self.boundary.secs);
        w.put_u32(self.boundary.nanos);
        w.put_hash(&self.block_root);
        w.put_u32(self.block_count);
        w.put_u32(self.heartbeat_count);
        w.put_hash(&self.heartbeat_root);
        w.put_u128(self.vdf_work);
        w.put_hash(&self.prev);
        w.into_bytes()
    }

    pub fn decode_exact(bytes: &[u8]) -> Option<Self> {
        let mut r = Reader::new(bytes);
        let cp = Checkpoint {
            window: r.u64()?,
            boundary: UtcInstant::new(r.i64()?, r.u32()?),
            block_root: r.hash()?,
            block_count: r.u32()?,
            heartbeat_count: r.u32()?,
            heartbeat_root: r.hash()?,
            vdf_work: r.u128()?,
            prev: r.hash()?,
        };
        if !r.is_exhausted() {
            return None;
        }
        Some(cp)
    }

    /// The checkpoint identifier, also the next window's lottery seed.
    pub fn id(&self) -> Hash {
        crate::hash_domain(b"tempora.checkpoint", &self.encode())
    }

    /// The seed that precedes any checkpoint: the chain's anchor.
    pub fn genesis_seed() -> Hash {
        crate::hash_domain(b"tempora.checkpoint.genesis", &crate::constants::chain_id())
    }

    /// Fork choice between two checkpoints for the same boundary: more
    /// valid heartbeats wins, ties go to the smaller hash.
    pub fn wins_against(&self, other: &Checkpoint) -> bool {
        if self.heartbeat_count != other.heartbeat_count {
            return self.heartbeat_count > other.heartbeat_count;
        }
        self.id() < other.id()
    }
}

/// Finality level of a window, measured in checkpoints passed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Finality {
    Pending,
    /// One checkpoint passed (~1 minute).
    Soft,
    /// Two checkpoints passed.
    Medium,
    /// Three checkpoints passed; reorgs can no longer reach the window.
    Hard,
}

/// The local chain of finality checkpoints.
#[derive(Default)]
pub struct CheckpointChain {
    by_id: HashMap<Hash, Checkpoint>,
    /// Canonical chain, oldest first.
    chain: Vec<Hash>,
}

impl CheckpointChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// The seed for the next window's lottery and delay-function input.
    pub fn seed(&self) -> Hash {
        self.chain
            .last()
            .copied()
            .unwrap_or_else(Checkpoint::genesis_seed)
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn latest(&self) -> Option<&Checkpoint> {
        self.chain.last().map(|id| &self.by_id[id])
    }

    pub fn get(&self, id: &Hash) -> Option<&Checkpoint> {
        self.by_id.get(id)
    }

    pub fn get_by_window(&self, window: u64) -> Option<&Checkpoint> {
        self.chain
            .iter()
            .map(|id| &self.by_id[id])
            .find(|cp| cp.window == window)
    }

    /// Append a checkpoint extending the current tip. The previous-pointer
    /// must reference the tip exactly; anything else is `CheckpointAbsent`.
    pub fn append(&mut self, checkpoint: Checkpoint) -> Result<(), ConsensusError> {
        if checkpoint.prev != self.seed() {
            return Err(ConsensusError::CheckpointAbsent);
        }
        let id = checkpoint.id();
        self.by_id.insert(id, checkpoint);
        self.chain.push(id);
        Ok(())
    }

    /// Consider a competing checkpoint for a boundary already in the
    /// chain (partition re-merge). Returns true when the competitor won
    /// and the chain was rewound onto it.
    ///
    /// A competitor below the latest hard-finalized boundary is refused
    /// with `ReorgLimitExceeded`.
    pub fn resolve_fork(&mut self, competitor: Checkpoint) -> Result<bool, ConsensusError> {
        let position = self
            .chain
            .iter()
            .position(|id| self.by_id[id].window == competitor.window)
            .ok_or(ConsensusError::CheckpointAbsent)?;

        // The competitor must chain from the same parent.
        let expected_prev = if position == 0 {
            Checkpoint::genesis_seed()
        } else {
            self.chain[position - 1]
        };
        if competitor.prev != expected_prev {
            return Err(ConsensusError::CheckpointAbsent);
        }

        let incumbent = &self.by_id[&self.chain[position]];
        if self.finality_at_position(position) >= Finality::Hard {
            return Err(ConsensusError::ReorgLimitExceeded);
        }
        if !competitor.wins_against(incumbent) {
            return Ok(false);
        }

        // Rewind: drop the incumbent and everything above it.
        for id in self.chain.drain(position..) {
            self.by_id.remove(&id);
        }
        let id = competitor.id();
        tracing::info!(
            window = competitor.window,
            checkpoint = %hex::encode(&id[..6]),
            "checkpoint fork resolved in favor of competitor"
        );
        self.by_id.insert(id, competitor);
        self.chain.push(id);
        Ok(true)
    }

    fn finality_at_position(&self, position: usize) -> Finality {
        match self.chain.len() - position {
            0 => Finality::Pending,
            1 => Finality::Soft,
            2 => Finality::Medium,
            _ => Finality::Hard,
        }
    }

    /// Finality of a window under the current chain.
    pub fn finality_of_window(&self, window: u64) -> Finality {
        match self
            .chain
            .iter()
            .position(|id| self.by_id[id].window == window)
        {
            Some(position) => self.finality_at_position(position),
            None => Finality::Pending,
        }
    }

    /// The latest hard-finalized checkpoint, if any.
    pub fn latest_hard(&self) -> Option<&Checkpoint> {
        if self.chain.len() < 3 {
            return None;
        }
        let id = &self.chain[self.chain.len() - 3];
        Some(&self.by_id[id])
    }
}

/// Collects heartbeats per window, deduplicated by participant, and prunes
/// anything older than two windows.
#[derive(Default)]
pub struct HeartbeatPool {
    by_window: HashMap<u64, HashMap<Hash, Heartbeat>>,
}

impl HeartbeatPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a signature-verified heartbeat. One per participant per
    /// window; later duplicates are dropped.
    pub fn insert(&mut self, heartbeat: Heartbeat) -> bool {
        let entry = self.by_window.entry(heartbeat.window).or_default();
        if entry.contains_key(&heartbeat.participant) {
            return false;
        }
        entry.insert(heartbeat.participant, heartbeat);
        true
    }

    pub fn count(&self, window: u64) -> u32 {
        self.by_window.get(&window).map_or(0, |m| m.len() as u32)
    }

    pub fn participants(&self, window: u64) -> Vec<Hash> {
        let mut ids: Vec<Hash> = self
            .by_window
            .get(&window)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Merkle root over the window's attesting participants.
    pub fn aggregate_root(&self, window: u64) -> Hash {
        let leaves: Vec<Hash> = self
            .participants(window)
            .iter()
            .map(|id| merkle::leaf_hash(id))
            .collect();
        merkle::merkle_root(&leaves)
    }

    /// Drop windows older than `current_window - 1`.
    pub fn prune(&mut self, current_window: u64) {
        self.by_window
            .retain(|w, _| *w + 2 > current_window);
    }

    pub fn window_count(&self) -> usize {
        self.by_window.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(window: u64, prev: Hash, heartbeats: u32) -> Checkpoint {
        Checkpoint {
            window,
            boundary: UtcInstant::new((window as i64 + 1) * 60, 0),
            block_root: crate::sha3(&window.to_be_bytes()),
            block_count: 1,
            heartbeat_count: heartbeats,
            heartbeat_root: [0u8; 32],
            vdf_work: 1 << 20,
            prev,
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let cp = checkpoint(5, Checkpoint::genesis_seed(), 3);
        let decoded = Checkpoint::decode_exact(&cp.encode()).unwrap();
        assert_eq!(decoded, cp);
        assert_eq!(decoded.id(), cp.id());
    }

    #[test]
    fn chain_appends_and_seeds() {
        let mut chain = CheckpointChain::new();
        assert_eq!(chain.seed(), Checkpoint::genesis_seed());

        let cp1 = checkpoint(0, chain.seed(), 1);
        let cp1_id = cp1.id();
        chain.append(cp1).unwrap();
        assert_eq!(chain.seed(), cp1_id);

        let cp2 = checkpoint(1, chain.seed(), 1);
        chain.append(cp2).unwrap();
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn append_requires_exact_prev() {
        let mut chain = CheckpointChain::new();
        let bad = checkpoint(0, crate::sha3(b"not-the-seed"), 1);
        assert_eq!(chain.append(bad), Err(ConsensusError::CheckpointAbsent));
    }

    #[test]
    fn checkpoint_uniqueness_per_boundary() {
        // Two checkpoints for one boundary resolve to exactly one winner
        // under the fork rule, regardless of comparison order.
        let seed = Checkpoint::genesis_seed();
        let a = checkpoint(0, seed, 5);
        let b = checkpoint(1, seed, 5); // different window content
        let b = Checkpoint { window: 0, ..b };
        assert_ne!(a.id(), b.id());
        assert_ne!(a.wins_against(&b), b.wins_against(&a));
    }

    #[test]
    fn finality_progression() {
        let mut chain = CheckpointChain::new();
        chain.append(checkpoint(0, chain.seed(), 1)).unwrap();
        assert_eq!(chain.finality_of_window(0), Finality::Soft);

        chain.append(checkpoint(1, chain.seed(), 1)).unwrap();
        assert_eq!(chain.finality_of_window(0), Finality::Medium);
        assert_eq!(chain.finality_of_window(1), Finality::Soft);

        chain.append(checkpoint(2, chain.seed(), 1)).unwrap();
        assert_eq!(chain.finality_of_window(0), Finality::Hard);
        assert_eq!(chain.finality_of_window(2), Finality::Soft);
        assert_eq!(chain.finality_of_window(9), Finality::Pending);
        assert_eq!(chain.latest_hard().unwrap().window, 0);
    }

    #[test]
    fn fork_resolved_by_heartbeat_weight() {
        let mut chain = CheckpointChain::new();
        chain.append(checkpoint(0, chain.seed(), 2)).unwrap();

        // A competitor for the same boundary with more heartbeats wins.
        let competitor = checkpoint(0, Checkpoint::genesis_seed(), 5);
        assert!(chain.resolve_fork(competitor.clone()).unwrap());
        assert_eq!(chain.latest().unwrap().heartbeat_count, 5);

        // A weaker competitor loses.
        let weaker = checkpoint(0, Checkpoint::genesis_seed(), 3);
        assert!(!chain.resolve_fork(weaker).unwrap());
    }

    #[test]
    fn fork_tie_breaks_by_smaller_hash() {
        let mut chain = CheckpointChain::new();
        let incumbent = checkpoint(0, chain.seed(), 5);
        let mut competitor = checkpoint(0, chain.seed(), 5);
        competitor.block_root = crate::sha3(b"other-content");
        chain.append(incumbent.clone()).unwrap();

        let expected = competitor.id() < incumbent.id();
        assert_eq!(chain.resolve_fork(competitor).unwrap(), expected);
    }

    #[test]
    fn reorg_below_hard_finality_refused() {
        let mut chain = CheckpointChain::new();
        for w in 0..4 {
            chain.append(checkpoint(w, chain.seed(), 1)).unwrap();
        }
        // Window 0 is hard-final (4 checkpoints passed).
        let competitor = checkpoint(0, Checkpoint::genesis_seed(), 100);
        assert_eq!(
            chain.resolve_fork(competitor),
            Err(ConsensusError::ReorgLimitExceeded)
        );
    }

    #[test]
    fn fork_rewind_drops_descendants() {
        let mut chain = CheckpointChain::new();
        chain.append(checkpoint(0, chain.seed(), 1)).unwrap();
        chain.append(checkpoint(1, chain.seed(), 1)).unwrap();
        // Window 1 is soft-final only; a stronger fork at window 1 rewinds it.
        let prev = chain.chain[0];
        let competitor = checkpoint(1, prev, 9);
        assert!(chain.resolve_fork(competitor).unwrap());
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.latest().unwrap().heartbeat_count, 9);
    }

    #[test]
    fn heartbeat_sign_verify() {
        let kp = SigningKeypair::generate();
        let hb = Heartbeat::create(
            &kp,
            7,
            HeartbeatProof::VerifiedTimestamp {
                at: UtcInstant::new(420, 0),
            },
            Tier::Tier2,
        );
        assert!(hb.verify(&kp.public));
        let other = SigningKeypair::generate();
        assert!(!hb.verify(&other.public));
    }

    #[test]
    fn heartbeat_pool_dedups_and_prunes() {
        let kp = SigningKeypair::generate();
        let mut pool = HeartbeatPool::new();
        let hb = Heartbeat::create(
            &kp,
            3,
            HeartbeatProof::VerifiedTimestamp {
                at: UtcInstant::new(200, 0),
            },
            Tier::Tier2,
        );
        assert!(pool.insert(hb.clone()));
        assert!(!pool.insert(hb));
        assert_eq!(pool.count(3), 1);

        // Ephemeral beyond two windows.
        pool.prune(4);
        assert_eq!(pool.count(3), 1);
        pool.prune(5);
        assert_eq!(pool.count(3), 0);
        assert_eq!(pool.window_count(), 0);
    }

    #[test]
    fn aggregate_root_deterministic() {
        let mut pool = HeartbeatPool::new();
        let kps: Vec<SigningKeypair> = (0..3).map(|_| SigningKeypair::generate()).collect();
        for kp in &kps {
            pool.insert(Heartbeat::create(
                kp,
                1,
                HeartbeatProof::VerifiedTimestamp {
                    at: UtcInstant::new(100, 0),
                },
                Tier::Tier2,
            ));
        }
        let root = pool.aggregate_root(1);
        assert_ne!(root, [0u8; 32]);
        assert_eq!(root, pool.aggregate_root(1));
    }
}
