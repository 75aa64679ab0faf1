//! Temporal proof engine: the sequential delay function and the UTC
//! boundary clock that anchors finality to wall-clock instants.

pub mod clock;
pub mod vdf;

/// Errors originating in the temporal proof engine.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TemporalError {
    #[error("delay-function proof is invalid")]
    ProofInvalid,
    #[error("proof declares window {declared} but current window is {current}")]
    WindowMismatch { declared: u64, current: u64 },
    #[error("timestamp outside the admissible clock tolerance")]
    ClockSkew,
    #[error("iteration count {0} outside the accepted range")]
    IterationCountOutOfRange(u64),
}
