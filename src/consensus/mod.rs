//! # Temporal consensus: proof of elapsed wall-clock time
//!
//! Neither Proof of Work nor Proof of Stake. A participant's influence is
//! its verified temporal presence, and finality is anchored to UTC instants.
//!
//! ## Design principles
//!
//! 1. **Time as the scarce resource**: a sequential delay function proves a
//!    span of wall-clock time passed; parallel hardware cannot compress it.
//!    One unit of account corresponds asymptotically to one second of
//!    verified presence.
//!
//! 2. **Reputation-weighted lottery**: every slot (a one-second UTC tick),
//!    each eligible participant evaluates a VRF over the previous checkpoint
//!    seed and the slot index. A participant leads when its output falls
//!    under its reputation-proportional threshold. Multiple self-elected
//!    leaders are resolved at acceptance by the DAG ordering rule.
//!
//! 3. **Boundary finality**: at each UTC boundary the core emits a
//!    checkpoint summarizing the closed window: the Merkle root of its
//!    accepted blocks, the aggregated heartbeats, and the cumulative
//!    delay-function work. Soft, medium and hard finality correspond to
//!    one, two and three boundaries passed. Reorgs never cross the latest
//!    hard checkpoint.
//!
//! ## How a window closes
//!
//! ```text
//! Window w (60 s):
//!   1. Slots tick every second; lottery winners produce blocks
//!      referencing 1..8 recent tips, each embedding a delay-function
//!      proof anchored to w
//!   2. Participants emit one heartbeat for w (Tier-1 with a delay proof,
//!      Tier-2/3 with verified timestamps)
//!   3. At the boundary, the checkpoint for w is assembled and gossiped
//!   4. Competing checkpoints for one boundary are resolved by heartbeat
//!      count, then by smaller hash
//! ```

pub mod checkpoint;
pub mod issuance;
pub mod lottery;

/// Errors originating in the consensus core.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConsensusError {
    #[error("participant did not win the slot lottery")]
    NotLeader,
    #[error("block references parents outside the accepted DAG")]
    OrphanBlock,
    #[error("reorganization would cross a hard-finalized checkpoint")]
    ReorgLimitExceeded,
    #[error("referenced checkpoint is not known")]
    CheckpointAbsent,
}
