//! # Tempora
//!
//! A decentralized temporal-consensus engine:
//! - **Proof of elapsed time** — security rests on a sequential delay function
//!   and majority-consistent UTC clocks, not hash power or stake
//! - **Block-DAG ledger** — 1..8 parents per block, blue/red linearization,
//!   parallel block production
//! - **Wall-clock finality** — checkpoints at UTC boundaries; soft, medium and
//!   hard finality after 1, 2 and 3 boundaries
//! - **Reputation-weighted leadership** — a VRF lottery weighted by a bounded
//!   five-dimensional participation score
//! - **Post-quantum security** — SPHINCS+ signatures + Kyber KEM transport

pub mod block;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod dag;
pub mod mempool;
pub mod network;
pub mod node;
pub mod p2p;
pub mod reputation;
pub mod storage;
pub mod temporal;
pub mod transaction;
pub mod wire;

/// Protocol constants
pub mod constants {
    /// Finality interval in seconds; UTC boundaries fall on multiples of this.
    pub const FINALITY_INTERVAL_SECS: u64 = 60;
    /// Admissible clock skew for inbound blocks and heartbeats, in seconds.
    pub const CLOCK_TOLERANCE_SECS: u64 = 5;
    /// Default delay-function length, calibrated to stay under one finality
    /// interval on reference hardware.
    pub const VDF_ITERATIONS: u64 = 1 << 24;
    /// Lower bound on accepted delay-function lengths.
    pub const VDF_MIN_ITERATIONS: u64 = 1 << 16;
    /// Upper bound on accepted delay-function lengths.
    pub const VDF_MAX_ITERATIONS: u64 = 1 << 32;
    /// Delay-function checkpoint divisor: the prover emits T / this states.
    pub const VDF_CHECKPOINT_DIVISOR: u64 = 1000;
    /// Number of segments the verifier recomputes.
    pub const VDF_VERIFY_SAMPLES: usize = 20;

    /// Maximum parent references per block.
    pub const MAX_PARENTS: usize = 8;
    /// Anticone parameter for the blue-set partition.
    pub const PHANTOM_K: usize = 8;
    /// Leader-selection slot length in seconds.
    pub const SLOT_SECS: u64 = 1;
    /// Maximum transactions per block.
    pub const MAX_TXS_PER_BLOCK: usize = 10_000;
    /// Maximum encoded block size (4 MiB).
    pub const BLOCK_BYTES_MAX: usize = 4 * 1024 * 1024;
    /// Maximum inputs or outputs per transaction.
    pub const MAX_TX_IO: usize = 128;
    /// Maximum auxiliary payload bytes per transaction.
    pub const MAX_AUX_PAYLOAD: usize = 65_536;

    /// Maximum number of transactions in the mempool.
    pub const MEMPOOL_MAX_TXS: usize = 10_000;
    /// Maximum total byte size of the mempool (50 MiB).
    pub const MEMPOOL_MAX_BYTES: usize = 50 * 1024 * 1024;
    /// Mempool entry lifetime in seconds (24 hours).
    pub const MEMPOOL_EXPIRY_SECS: u64 = 24 * 3600;

    /// Maximum number of orphan blocks held while parents are fetched.
    pub const ORPHAN_CACHE_MAX: usize = 512;

    /// Total issuance cap in base units.
    pub const ISSUANCE_CAP: u64 = 1_260_000_000;
    /// Initial block reward in base units.
    pub const INITIAL_REWARD: u64 = 3_000;
    /// Accepted blocks between reward halvings.
    pub const HALVING_INTERVAL: u64 = 210_000;

    /// Uptime saturation: 180 days in seconds.
    pub const UPTIME_SATURATION_SECS: u64 = 15_552_000;
    /// Probation period for new participants, in seconds (180 days).
    pub const PROBATION_SECS: u64 = 15_552_000;
    /// Quarantine duration after equivocation, in seconds (180 days).
    pub const QUARANTINE_SECS: u64 = 15_552_000;
    /// Mutual-trust bonds needed to saturate the handshake dimension.
    pub const HANDSHAKE_SATURATION: u64 = 10;
    /// Countries needed to saturate the geographic diversity term.
    pub const COUNTRY_DIVERSITY_TARGET: u64 = 50;
    /// Cities needed to saturate the geographic diversity term.
    pub const CITY_DIVERSITY_TARGET: u64 = 100;

    /// Fixed-point scale for lottery weights (micro-units).
    pub const SCORE_FIXED_POINT: u64 = 1_000_000;

    /// Lottery weight of Tier-1 (full) participants, in micro-units.
    pub const TIER1_WEIGHT: u64 = 700_000;
    /// Lottery weight of Tier-2 (light) participants, in micro-units.
    pub const TIER2_WEIGHT: u64 = 200_000;
    /// Lottery weight of Tier-3 (attestation) participants, in micro-units.
    pub const TIER3_WEIGHT: u64 = 100_000;

    /// Maximum network message size (16 MiB).
    pub const MAX_NETWORK_MESSAGE_BYTES: usize = 16 * 1024 * 1024;
    /// Per-peer receive budget in bytes per second (5 MB/s).
    pub const PER_PEER_RECV_BPS: u64 = 5_000_000;
    /// Per-peer send budget in bytes per second (1 MB/s).
    pub const PER_PEER_SEND_BPS: u64 = 1_000_000;
    /// Minimum outbound connections a healthy node maintains.
    pub const MIN_OUTBOUND_PEERS: usize = 8;
    /// Maximum fraction of connections that may be inbound.
    pub const INBOUND_RATIO_MAX: f64 = 0.7;
    /// Maximum connections accepted from a single IP address.
    pub const MAX_CONNS_PER_IP: usize = 1;
    /// Maximum connections accepted from a single /24 subnet.
    pub const MAX_CONNS_PER_SUBNET: usize = 3;
    /// Connection slots reserved for long-standing, diverse peers.
    pub const PROTECTED_PEER_SLOTS: usize = 4;
    /// Peer RPC deadline in milliseconds.
    pub const PEER_RPC_TIMEOUT_MS: u64 = 10_000;
    /// Shutdown grace period for I/O tasks, in seconds.
    pub const SHUTDOWN_GRACE_SECS: u64 = 5;

    /// Default P2P listen port.
    pub const DEFAULT_P2P_PORT: u16 = 9650;
    /// Default local control port for `status` / `stop` / `peer add`.
    pub const DEFAULT_CONTROL_PORT: u16 = 9651;

    /// Compute the chain ID for mainnet.
    pub fn chain_id() -> crate::Hash {
        crate::hash_domain(b"tempora.chain_id", b"tempora-mainnet-v1")
    }
}

/// 32-byte hash used throughout the protocol
pub type Hash = [u8; 32];

/// Compute a SHA3-256 digest of raw bytes.
pub fn sha3(data: &[u8]) -> Hash {
    use sha3::{Digest, Sha3_256};
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute a domain-separated SHA3-256 hash.
///
/// The domain is length-prefixed before the payload so that distinct domains
/// can never produce colliding preimages.
pub fn hash_domain(domain: &[u8], data: &[u8]) -> Hash {
    use sha3::{Digest, Sha3_256};
    let mut hasher = Sha3_256::new();
    hasher.update((domain.len() as u64).to_be_bytes());
    hasher.update(domain);
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute a SHA3-256 hash of length-prefixed concatenated slices.
///
/// Each part is prefixed with its length as a big-endian u64, preventing
/// ambiguous concatenation (e.g., `["AB","C"]` vs `["A","BC"]`).
pub fn hash_concat(parts: &[&[u8]]) -> Hash {
    use sha3::{Digest, Sha3_256};
    let mut hasher = Sha3_256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Compute a SHAKE256 digest with variable output length.
pub fn shake256(data: &[u8], out_len: usize) -> Vec<u8> {
    use sha3::digest::{ExtendableOutput, Update, XofReader};
    use sha3::Shake256;
    let mut hasher = Shake256::default();
    hasher.update(data);
    let mut reader = hasher.finalize_xof();
    let mut out = vec![0u8; out_len];
    reader.read(&mut out);
    out
}

/// Compute a 32-byte SHAKE256 digest. This is the delay-function core hash.
pub fn shake256_32(data: &[u8]) -> Hash {
    use sha3::digest::{ExtendableOutput, Update, XofReader};
    use sha3::Shake256;
    let mut hasher = Shake256::default();
    hasher.update(data);
    let mut reader = hasher.finalize_xof();
    let mut out = [0u8; 32];
    reader.read(&mut out);
    out
}

/// Constant-time comparison of two byte slices.
///
/// Returns true only if the slices have equal length and identical contents.
/// Uses the `subtle` crate's audited constant-time operations.
///
/// Note: The length comparison is NOT constant-time (leaks whether lengths
/// match). This is acceptable because all Tempora uses compare fixed-size
/// 32-byte digests.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
