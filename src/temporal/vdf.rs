//! Sequential delay function over a SHAKE256 hash chain.
//!
//! `state_0 = input; state_i = SHAKE256(state_{i-1}); output = state_T`.
//! Each iteration depends on the previous output, so the chain cannot be
//! shortened by parallelism; an adversary's wall clock is bounded below by
//! `T * (time per hash on the best hardware)`. The sequentiality claim is
//! empirical in the hash primitive, not algebraic.
//!
//! The prover emits intermediate states every `k` iterations. The verifier
//! samples `q` random segments and recomputes them, for cost O(T·q/k)
//! instead of O(T).

use std::sync::atomic::{AtomicBool, Ordering};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use super::TemporalError;
use crate::constants;
use crate::Hash;

/// One step of the delay chain.
fn step(state: &Hash) -> Hash {
    crate::shake256_32(state)
}

/// A delay-function evaluation with its checkpoint proof.
///
/// `checkpoints[j]` is the chain state after `j * interval` iterations;
/// the final entry is the state after all `iterations` steps (the output).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VdfProof {
    pub input: Hash,
    pub output: Hash,
    pub iterations: u64,
    pub checkpoint_interval: u64,
    pub checkpoints: Vec<Hash>,
}

impl VdfProof {
    /// Number of recomputable segments between adjacent checkpoints.
    pub fn segment_count(&self) -> u64 {
        self.iterations.div_ceil(self.checkpoint_interval)
    }
}

fn check_iteration_bounds(iterations: u64) -> Result<(), TemporalError> {
    if !(constants::VDF_MIN_ITERATIONS..=constants::VDF_MAX_ITERATIONS).contains(&iterations) {
        return Err(TemporalError::IterationCountOutOfRange(iterations));
    }
    Ok(())
}

/// Evaluate the delay function sequentially, emitting checkpoints.
///
/// This call runs for close to a full finality interval at production
/// parameters; it must be driven from the dedicated evaluator thread,
/// never from an async task.
pub fn prove(input: &Hash, iterations: u64, checkpoint_interval: u64) -> Result<VdfProof, TemporalError> {
    let never = AtomicBool::new(false);
    // The cancel flag is never set, so Ok(None) is unreachable.
    prove_cancellable(input, iterations, checkpoint_interval, &never)
        .map(|opt| opt.expect("uncancellable prove returned None"))
}

/// Evaluate the delay function with cooperative cancellation.
///
/// The cancel flag is polled only at checkpoint boundaries; the sequential
/// loop between checkpoints is never interrupted. Returns `Ok(None)` when
/// cancelled.
pub fn prove_cancellable(
    input: &Hash,
    iterations: u64,
    checkpoint_interval: u64,
    cancel: &AtomicBool,
) -> Result<Option<VdfProof>, TemporalError> {
    check_iteration_bounds(iterations)?;
    if checkpoint_interval == 0 {
        return Err(TemporalError::ProofInvalid);
    }

    let segments = iterations.div_ceil(checkpoint_interval);
    let mut checkpoints = Vec::with_capacity(segments as usize + 1);
    checkpoints.push(*input);

    let mut state = *input;
    let mut done: u64 = 0;
    while done < iterations {
        if cancel.load(Ordering::Relaxed) {
            return Ok(None);
        }
        let segment_len = checkpoint_interval.min(iterations - done);
        for _ in 0..segment_len {
            state = step(&state);
        }
        done += segment_len;
        checkpoints.push(state);
    }

    Ok(Some(VdfProof {
        input: *input,
        output: state,
        iterations,
        checkpoint_interval,
        checkpoints,
    }))
}

/// Verify a delay-function proof by recomputing `samples` random segments.
///
/// Always checks the endpoints: the first checkpoint must equal the input
/// and the last must equal the output. Any single-bit perturbation of a
/// checkpoint lands in some segment and fails its recomputation.
pub fn verify(proof: &VdfProof, samples: usize) -> Result<(), TemporalError> {
    check_iteration_bounds(proof.iterations)?;
    if proof.checkpoint_interval == 0 {
        return Err(TemporalError::ProofInvalid);
    }

    let segments = proof.segment_count();
    if proof.checkpoints.len() as u64 != segments + 1 {
        return Err(TemporalError::ProofInvalid);
    }
    if proof.checkpoints[0] != proof.input {
        return Err(TemporalError::ProofInvalid);
    }
    if *proof.checkpoints.last().expect("non-empty") != proof.output {
        return Err(TemporalError::ProofInvalid);
    }

    // Sample distinct segments; when the proof is short, verify all of them.
    let mut indices: Vec<u64> = (0..segments).collect();
    let to_check = if (samples as u64) >= segments {
        indices
    } else {
        indices.shuffle(&mut rand::thread_rng());
        indices.truncate(samples);
        indices
    };

    for seg in to_check {
        let start = proof.checkpoints[seg as usize];
        let expected = proof.checkpoints[seg as usize + 1];
        let segment_len = proof
            .checkpoint_interval
            .min(proof.iterations - seg * proof.checkpoint_interval);
        let mut state = start;
        for _ in 0..segment_len {
            state = step(&state);
        }
        if !crate::constant_time_eq(&state, &expected) {
            return Err(TemporalError::ProofInvalid);
        }
    }

    Ok(())
}

/// Measure this host's hash rate and recommend an iteration count whose
/// evaluation takes close to, but not more than, `target_seconds`.
pub fn calibrate(target_seconds: f64) -> u64 {
    const SAMPLE_ITERATIONS: u64 = 50_000;
    let mut state = crate::hash_domain(b"tempora.vdf.calibration", b"sample");
    let start = std::time::Instant::now();
    for _ in 0..SAMPLE_ITERATIONS {
        state = step(&state);
    }
    let elapsed = start.elapsed().as_secs_f64();
    let per_sec = SAMPLE_ITERATIONS as f64 / elapsed.max(f64::EPSILON);
    let recommended = (per_sec * target_seconds) as u64;
    tracing::info!(
        iterations_per_sec = per_sec as u64,
        recommended,
        "delay-function calibration"
    );
    recommended.clamp(constants::VDF_MIN_ITERATIONS, constants::VDF_MAX_ITERATIONS)
}

/// Derive the delay-function input for a finality window.
pub fn window_input(checkpoint_seed: &Hash, window: u64) -> Hash {
    crate::hash_concat(&[b"tempora.vdf.input", checkpoint_seed, &window.to_be_bytes()])
}
