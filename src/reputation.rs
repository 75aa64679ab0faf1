//! Reputation engine: a bounded, saturating, five-dimensional score per
//! participant, driven by an idempotent event ledger.
//!
//! | Dimension | Weight | Saturation |
//! |---|---|---|
//! | Uptime    | 0.50 | 180 days of verified presence |
//! | Integrity | 0.20 | signed event sum clamped to [0, 1] |
//! | Storage   | 0.15 | full copy of the accepted DAG |
//! | Geography | 0.10 | region rarity + network diversity |
//! | Handshake | 0.05 | 10 mutual-trust bonds |
//!
//! Scores are reproducible: dimensions are evaluated in a fixed order,
//! integrity events fold strictly in ledger order, and every intermediate
//! value is clamped, so replaying the same ledger yields the same bits on
//! any IEEE-754 platform. No capital or one-time burst can push any
//! dimension past its saturation cap; the uptime cap dominates.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::{constants, Hash};

/// Participation tier, determining the lottery weight share.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Full node with delay-function capability; produces blocks.
    Tier1,
    /// Light node or authorized community bot; submits light heartbeats.
    Tier2,
    /// End-user attestations, accepted only via Tier-2 aggregators.
    Tier3,
}

impl Tier {
    /// Lottery weight in micro-units (0.70 / 0.20 / 0.10).
    pub fn lottery_weight(self) -> u64 {
        match self {
            Tier::Tier1 => constants::TIER1_WEIGHT,
            Tier::Tier2 => constants::TIER2_WEIGHT,
            Tier::Tier3 => constants::TIER3_WEIGHT,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Tier::Tier1 => 1,
            Tier::Tier2 => 2,
            Tier::Tier3 => 3,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Tier::Tier1),
            2 => Some(Tier::Tier2),
            3 => Some(Tier::Tier3),
            _ => None,
        }
    }
}

/// Recognized reputation events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ReputationEventKind {
    /// Produced a block accepted by the DAG (+0.05 integrity).
    BlockProduced,
    /// Validated a peer's block (+0.02 integrity).
    BlockValidated,
    /// Produced an invalid block (−0.15 integrity).
    InvalidBlock,
    /// Signed two blocks for one slot (−1.0 integrity, 180-day quarantine).
    Equivocation,
    /// Verified presence for a span of seconds (heartbeat aggregation).
    UptimeTick { seconds: u64 },
    /// Fraction of the accepted DAG this participant stores.
    StorageReport { stored_blocks: u64, total_blocks: u64 },
    /// Geographic registration. The city is stored as "COUNTRY:city".
    LocationRegistered { country: String, city: String },
    /// A mutual-trust bond formed with another participant.
    BondFormed { partner: Hash },
    /// A bond partner was penalized or left the network.
    BondBroken { partner: Hash },
}

/// A ledger entry. Application is idempotent on `(id, participant)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReputationEvent {
    pub id: Hash,
    pub participant: Hash,
    pub kind: ReputationEventKind,
    /// Event time, seconds since the UNIX epoch.
    pub at: i64,
}

impl ReputationEvent {
    /// Derive a content-addressed event id, so replays dedup naturally.
    pub fn new(participant: Hash, kind: ReputationEventKind, at: i64) -> Self {
        let body = bincode::serialize(&(&participant, &kind, at)).expect("serializable");
        ReputationEvent {
            id: crate::hash_domain(b"tempora.reputation.event", &body),
            participant,
            kind,
            at,
        }
    }
}

/// Lifecycle state of a participant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantState {
    Registered,
    Probationary,
    Active,
    Offline,
    Quarantined,
}

/// Per-participant reputation record. Created at first sighting; never
/// destroyed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub id: Hash,
    pub tier: Tier,
    pub first_seen: i64,
    pub last_seen: i64,
    pub uptime_secs: u64,
    /// Integrity dimension, clamped to [0, 1]. Starts at 1.0.
    pub integrity: f64,
    pub stored_blocks: u64,
    pub total_blocks: u64,
    pub country: Option<String>,
    pub city: Option<String>,
    /// One-time first-in-country / first-in-city bonuses.
    pub geography_bonus: f64,
    pub bonds: BTreeSet<Hash>,
    pub quarantine_until: Option<i64>,
    pub state: ParticipantState,
}

impl ParticipantRecord {
    fn new(id: Hash, tier: Tier, at: i64) -> Self {
        ParticipantRecord {
            id,
            tier,
            first_seen: at,
            last_seen: at,
            uptime_secs: 0,
            integrity: 1.0,
            stored_blocks: 0,
            total_blocks: 0,
            country: None,
            city: None,
            geography_bonus: 0.0,
            bonds: BTreeSet::new(),
            quarantine_until: None,
            state: ParticipantState::Registered,
        }
    }

    /// Uptime dimension in [0, 1]: monotone, saturating at 180 days.
    pub fn uptime_dimension(&self) -> f64 {
        (self.uptime_secs as f64 / constants::UPTIME_SATURATION_SECS as f64).min(1.0)
    }

    /// Storage dimension in [0, 1].
    pub fn storage_dimension(&self) -> f64 {
        if self.total_blocks == 0 {
            return 0.0;
        }
        (self.stored_blocks as f64 / self.total_blocks as f64).min(1.0)
    }

    /// Handshake dimension in [0, 1].
    pub fn handshake_dimension(&self) -> f64 {
        (self.bonds.len() as f64 / constants::HANDSHAKE_SATURATION as f64).min(1.0)
    }

    pub fn is_quarantined(&self, now: i64) -> bool {
        matches!(self.quarantine_until, Some(until) if now < until)
    }
}

/// Errors from bond formation.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BondError {
    #[error("participant is unknown")]
    UnknownParticipant,
    #[error("participant does not meet the bond requirements")]
    RequirementsNotMet,
    #[error("both parties are registered in the same country")]
    SameCountry,
    #[error("bond already exists")]
    AlreadyBonded,
}

/// The reputation engine: owns all records, the region indices and the
/// idempotence set. No other component mutates reputation state.
#[derive(Default)]
pub struct ReputationEngine {
    records: HashMap<Hash, ParticipantRecord>,
    country_nodes: HashMap<String, HashSet<Hash>>,
    city_nodes: HashMap<String, HashSet<Hash>>,
    applied: HashSet<(Hash, Hash)>,
}

impl ReputationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a participant at first sighting. Idempotent.
    pub fn register(&mut self, id: Hash, tier: Tier, at: i64) {
        self.records
            .entry(id)
            .or_insert_with(|| ParticipantRecord::new(id, tier, at));
    }

    pub fn get(&self, id: &Hash) -> Option<&ParticipantRecord> {
        self.records.get(id)
    }

    pub fn participant_count(&self) -> usize {
        self.records.len()
    }

    pub fn participants(&self) -> impl Iterator<Item = &ParticipantRecord> {
        self.records.values()
    }

    /// Apply a ledger event. Re-applying the same event is a no-op, so the
    /// resulting score equals the once-applied score.
    pub fn apply_event(&mut self, event: &ReputationEvent) {
        if !self.applied.insert((event.id, event.participant)) {
            return;
        }
        let record = match self.records.get_mut(&event.participant) {
            Some(r) => r,
            None => {
                tracing::debug!(
                    participant = %hex::encode(&event.participant[..6]),
                    "reputation event for unknown participant dropped"
                );
                return;
            }
        };
        record.last_seen = record.last_seen.max(event.at);

        match &event.kind {
            ReputationEventKind::BlockProduced => {
                fold_integrity(record, 0.05);
            }
            ReputationEventKind::BlockValidated => {
                fold_integrity(record, 0.02);
            }
            ReputationEventKind::InvalidBlock => {
                fold_integrity(record, -0.15);
            }
            ReputationEventKind::Equivocation => {
                fold_integrity(record, -1.0);
                record.quarantine_until = Some(event.at + constants::QUARANTINE_SECS as i64);
                record.state = ParticipantState::Quarantined;
                tracing::warn!(
                    participant = %hex::encode(&event.participant[..6]),
                    until = record.quarantine_until.unwrap_or(0),
                    "equivocation: participant quarantined"
                );
            }
            ReputationEventKind::UptimeTick { seconds } => {
                record.uptime_secs = record.uptime_secs.saturating_add(*seconds);
                if record.state == ParticipantState::Registered
                    || record.state == ParticipantState::Offline
                {
                    record.state = ParticipantState::Probationary;
                }
                if record.state == ParticipantState::Probationary
                    && event.at - record.first_seen >= constants::PROBATION_SECS as i64
                {
                    record.state = ParticipantState::Active;
                }
            }
            ReputationEventKind::StorageReport {
                stored_blocks,
                total_blocks,
            } => {
                record.stored_blocks = *stored_blocks;
                record.total_blocks = *total_blocks;
            }
            ReputationEventKind::LocationRegistered { country, city } => {
                self.register_location(event.participant, country.clone(), city.clone());
            }
            ReputationEventKind::BondFormed { partner } => {
                let partner = *partner;
                if let Some(r) = self.records.get_mut(&event.participant) {
                    r.bonds.insert(partner);
                }
            }
            ReputationEventKind::BondBroken { partner } => {
                let partner = *partner;
                if let Some(r) = self.records.get_mut(&event.participant) {
                    r.bonds.remove(&partner);
                }
            }
        }
    }

    fn register_location(&mut self, id: Hash, country: String, city: String) {
        let country = country.to_uppercase();
        let city_key = format!("{}:{}", country, city.to_lowercase());

        let first_in_country = self.country_nodes.get(&country).is_none_or(HashSet::is_empty);
        let first_in_city = self.city_nodes.get(&city_key).is_none_or(HashSet::is_empty);

        let record = match self.records.get_mut(&id) {
            Some(r) => r,
            None => return,
        };

        // Leaving a previous region removes the participant from its index.
        if let Some(old_country) = record.country.take() {
            if let Some(set) = self.country_nodes.get_mut(&old_country) {
                set.remove(&id);
            }
        }
        if let Some(old_city) = record.city.take() {
            if let Some(set) = self.city_nodes.get_mut(&old_city) {
                set.remove(&id);
            }
        }

        if first_in_country {
            record.geography_bonus += 0.25;
        }
        if first_in_city {
            record.geography_bonus += 0.15;
        }
        record.country = Some(country.clone());
        record.city = Some(city_key.clone());

        self.country_nodes.entry(country).or_default().insert(id);
        self.city_nodes.entry(city_key).or_default().insert(id);
    }

    /// Geography dimension in [0, 1]:
    /// `0.6 · country + 0.4 · city`, each region scored as
    /// `0.7 · 1/(1 + log10(peers_in_region)) + 0.3 · regions_seen/target`,
    /// plus the one-time first-in-region bonuses.
    pub fn geography_dimension(&self, record: &ParticipantRecord) -> f64 {
        let (country, city) = match (&record.country, &record.city) {
            (Some(c), Some(ci)) => (c, ci),
            _ => return 0.0,
        };
        let peers_in_country = self
            .country_nodes
            .get(country)
            .map_or(1, |s| s.len().max(1)) as f64;
        let peers_in_city = self.city_nodes.get(city).map_or(1, |s| s.len().max(1)) as f64;
        let countries_seen = self.country_nodes.values().filter(|s| !s.is_empty()).count() as f64;
        let cities_seen = self.city_nodes.values().filter(|s| !s.is_empty()).count() as f64;

        let country_score = 0.7 * (1.0 / (1.0 + peers_in_country.log10()))
            + 0.3 * (countries_seen / constants::COUNTRY_DIVERSITY_TARGET as f64).min(1.0);
        let city_score = 0.7 * (1.0 / (1.0 + peers_in_city.log10()))
            + 0.3 * (cities_seen / constants::CITY_DIVERSITY_TARGET as f64).min(1.0);

        (0.6 * country_score + 0.4 * city_score + record.geography_bonus).clamp(0.0, 1.0)
    }

    /// The aggregate score in [0, 1]. Zero while quarantined.
    ///
    /// Dimensions are combined in a fixed order with fixed weights; the
    /// result is clamped, so no event sequence can push it past 1.
    pub fn score(&self, id: &Hash, now: i64) -> f64 {
        let record = match self.records.get(id) {
            Some(r) => r,
            None => return 0.0,
        };
        if record.is_quarantined(now) {
            return 0.0;
        }
        let sum = 0.50 * record.uptime_dimension()
            + 0.20 * record.integrity
            + 0.15 * record.storage_dimension()
            + 0.10 * self.geography_dimension(record)
            + 0.05 * record.handshake_dimension();
        sum.clamp(0.0, 1.0)
    }

    /// The score scaled to micro-units for fixed-point lottery arithmetic.
    pub fn score_micro(&self, id: &Hash, now: i64) -> u64 {
        (self.score(id, now) * constants::SCORE_FIXED_POINT as f64) as u64
    }

    /// Expire quarantines and mark long-silent participants offline.
    /// Integrity restarts at a low positive baseline after quarantine.
    pub fn tick(&mut self, now: i64) {
        for record in self.records.values_mut() {
            if record.state == ParticipantState::Quarantined {
                if let Some(until) = record.quarantine_until {
                    if now >= until {
                        record.quarantine_until = None;
                        record.integrity = 0.1;
                        record.state = ParticipantState::Active;
                        tracing::info!(
                            participant = %hex::encode(&record.id[..6]),
                            "quarantine expired, participant reinstated"
                        );
                    }
                }
            } else if record.state == ParticipantState::Active
                && now - record.last_seen > 2 * constants::FINALITY_INTERVAL_SECS as i64
            {
                record.state = ParticipantState::Offline;
            }
        }
    }

    /// Form a mutual-trust bond. Both parties must satisfy the pairing
    /// requirements and be registered in different countries; on success a
    /// `BondFormed` event is applied to each side.
    pub fn form_bond(&mut self, a: Hash, b: Hash, at: i64) -> Result<(), BondError> {
        if a == b {
            return Err(BondError::RequirementsNotMet);
        }
        {
            let ra = self.records.get(&a).ok_or(BondError::UnknownParticipant)?;
            let rb = self.records.get(&b).ok_or(BondError::UnknownParticipant)?;
            if ra.bonds.contains(&b) || rb.bonds.contains(&a) {
                return Err(BondError::AlreadyBonded);
            }
            match (&ra.country, &rb.country) {
                (Some(ca), Some(cb)) if ca == cb => return Err(BondError::SameCountry),
                (None, _) | (_, None) => return Err(BondError::RequirementsNotMet),
                _ => {}
            }
            for r in [ra, rb] {
                if r.uptime_dimension() < 0.9
                    || r.integrity < 0.8
                    || r.storage_dimension() < 0.9
                    || self.geography_dimension(r) <= 0.1
                {
                    return Err(BondError::RequirementsNotMet);
                }
            }
        }
        self.apply_event(&ReputationEvent::new(
            a,
            ReputationEventKind::BondFormed { partner: b },
            at,
        ));
        self.apply_event(&ReputationEvent::new(
            b,
            ReputationEventKind::BondFormed { partner: a },
            at,
        ));
        Ok(())
    }
}

/// Fold one signed integrity delta, clamping after each step so that the
/// final value depends only on the ledger order.
fn fold_integrity(record: &mut ParticipantRecord, delta: f64) {
    record.integrity = (record.integrity + delta).clamp(0.0, 1.0);
}
