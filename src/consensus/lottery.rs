//! Slot leader lottery.
//!
//! Slots are one-second UTC ticks. The lottery input is the previous
//! finality checkpoint seed concatenated with the slot index; every
//! eligible participant evaluates its VRF and self-elects when
//! `β / 2^64 < weight / total_weight`, computed entirely in u128 fixed
//! point so every node reaches the same verdict. Competing self-elected
//! leaders are resolved at block acceptance by the DAG ordering rule.
//!
//! A participant's weight is `tier_share · score · probation`, in
//! micro-units. New identities rise linearly from a 0.10 multiplier at
//! registration to 1.0 after 180 days; when registrations surge past twice
//! the trailing 30-window median, probation tightens for 180 days and
//! identities younger than 30 days are pinned at the 0.10 floor.

use std::collections::VecDeque;

use crate::crypto::keys::SigningKeypair;
use crate::crypto::vrf::{self, VrfOutput};
use crate::reputation::ReputationEngine;
use crate::{constants, Hash};

use super::ConsensusError;

const DAY_SECS: i64 = 86_400;

/// Probation multiplier in micro-units for a participant first seen at
/// `first_seen`, evaluated at `now`.
pub fn probation_factor_micro(first_seen: i64, now: i64, tightened: bool) -> u64 {
    let age = (now - first_seen).max(0) as u64;
    if tightened && age < 30 * DAY_SECS as u64 {
        return constants::SCORE_FIXED_POINT / 10;
    }
    if age >= constants::PROBATION_SECS {
        return constants::SCORE_FIXED_POINT;
    }
    // 0.10 at registration, rising linearly to 1.0 at 180 days.
    let floor = constants::SCORE_FIXED_POINT / 10;
    let span = constants::SCORE_FIXED_POINT - floor;
    floor + (span as u128 * age as u128 / constants::PROBATION_SECS as u128) as u64
}

/// Tracks first-seen registrations per finality window and decides when
/// the influx safeguard engages.
#[derive(Debug, Default)]
pub struct RegistrationMonitor {
    /// Registrations per closed window, most recent last (30 kept).
    history: VecDeque<u64>,
    current_window_count: u64,
    tightened_until: Option<i64>,
}

impl RegistrationMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one first-seen registration in the open window.
    pub fn record_registration(&mut self) {
        self.current_window_count += 1;
    }

    /// Close a window: compare its registration count against twice the
    /// trailing median and tighten probation when exceeded.
    pub fn close_window(&mut self, now: i64) {
        let count = std::mem::take(&mut self.current_window_count);
        if self.history.len() >= 5 {
            let mut sorted: Vec<u64> = self.history.iter().copied().collect();
            sorted.sort_unstable();
            let median = sorted[sorted.len() / 2];
            if median > 0 && count > 2 * median {
                self.tightened_until = Some(now + constants::PROBATION_SECS as i64);
                tracing::warn!(
                    registrations = count,
                    trailing_median = median,
                    "registration influx: probation tightened for 180 days"
                );
            }
        }
        self.history.push_back(count);
        while self.history.len() > 30 {
            self.history.pop_front();
        }
    }

    pub fn is_tightened(&self, now: i64) -> bool {
        matches!(self.tightened_until, Some(until) if now < until)
    }
}

/// A self-election claim for one slot.
#[derive(Clone, Debug)]
pub struct LeaderProof {
    pub participant: Hash,
    pub slot: u64,
    pub vrf: VrfOutput,
}

/// The lottery evaluator. Reads reputation state; owns nothing.
pub struct Lottery<'a> {
    reputation: &'a ReputationEngine,
    tightened: bool,
    now: i64,
}

impl<'a> Lottery<'a> {
    pub fn new(reputation: &'a ReputationEngine, monitor: &RegistrationMonitor, now: i64) -> Self {
        Lottery {
            reputation,
            tightened: monitor.is_tightened(now),
            now,
        }
    }

    /// A participant's lottery weight in micro-units:
    /// `tier_share · score · probation`.
    pub fn weight_micro(&self, id: &Hash) -> u64 {
        let record = match self.reputation.get(id) {
            Some(r) => r,
            None => return 0,
        };
        if record.is_quarantined(self.now) {
            return 0;
        }
        let score = self.reputation.score_micro(id, self.now) as u128;
        let tier = record.tier.lottery_weight() as u128;
        let probation =
            probation_factor_micro(record.first_seen, self.now, self.tightened) as u128;
        let fp = constants::SCORE_FIXED_POINT as u128;
        ((tier * score / fp) * probation / fp) as u64
    }

    /// Total weight over all eligible participants.
    pub fn total_weight_micro(&self) -> u64 {
        self.reputation
            .participants()
            .map(|r| self.weight_micro(&r.id))
            .sum()
    }

    /// Evaluate our own lottery ticket for a slot. Returns the proof when
    /// self-elected, `ConsensusError::NotLeader` otherwise.
    pub fn try_elect(
        &self,
        keypair: &SigningKeypair,
        checkpoint_seed: &Hash,
        slot: u64,
    ) -> Result<LeaderProof, ConsensusError> {
        let participant = keypair.public.fingerprint();
        let weight = self.weight_micro(&participant);
        let total = self.total_weight_micro();
        let input = vrf::lottery_input(checkpoint_seed, slot);
        let output = VrfOutput::evaluate(keypair, &input);
        if !output.wins_lottery(weight, total) {
            return Err(ConsensusError::NotLeader);
        }
        Ok(LeaderProof {
            participant,
            slot,
            vrf: output,
        })
    }

    /// Verify a peer's self-election claim against its registered key and
    /// the weights derived from our reputation view.
    pub fn verify_claim(
        &self,
        claim: &LeaderProof,
        public_key: &crate::crypto::keys::SigningPublicKey,
        checkpoint_seed: &Hash,
    ) -> bool {
        if public_key.fingerprint() != claim.participant {
            return false;
        }
        let input = vrf::lottery_input(checkpoint_seed, claim.slot);
        if !claim.vrf.verify(public_key, &input) {
            return false;
        }
        let weight = self.weight_micro(&claim.participant);
        let total = self.total_weight_micro();
        claim.vrf.wins_lottery(weight, total)
    }
}

/// Convenience for tests and status output: a participant's weight as a
/// fraction of the total.
pub fn weight_fraction(weight: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    weight as f64 / total as f64
}
