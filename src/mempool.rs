//! Transaction mempool with fee-per-byte priority and spend-conflict
//! eviction.
//!
//! The pool holds unconfirmed transactions waiting for inclusion in a
//! block. Priority is fee per byte with arrival order as the tie-break.
//! A transaction that double-spends an output already referenced by the
//! pool evicts the lower-fee entry. Entries expire after 24 hours.
//! Admission is validated against the best-view unspent-output set the
//! consensus worker last published.

use std::collections::{BTreeMap, HashMap};

use crate::constants;
use crate::transaction::{OutputId, SpendContext, Transaction, TxId, ValidationError};

/// Errors from mempool operations.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MempoolError {
    #[error("transaction already in mempool")]
    Duplicate,
    #[error("transaction validation failed: {0}")]
    ValidationFailed(#[from] ValidationError),
    #[error("conflicting pool transaction has a higher fee")]
    OutbidByConflict,
    #[error("pool is full and the fee rate is below the floor")]
    FeeTooLow,
}

/// Why an entry left the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemovalReason {
    Included,
    Expired,
    Conflict,
    Evicted,
}

/// Add/remove notifications drained by the consensus core.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MempoolEvent {
    Added(TxId),
    Removed(TxId, RemovalReason),
}

/// A transaction entry with admission metadata.
#[derive(Clone, Debug)]
struct MempoolEntry {
    tx: Transaction,
    fee_rate: u64,
    size: usize,
    arrival: i64,
    insertion_order: u64,
}

/// Configuration for the mempool.
#[derive(Clone, Debug)]
pub struct MempoolConfig {
    pub max_transactions: usize,
    pub max_bytes: usize,
    pub expiry_secs: u64,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        MempoolConfig {
            max_transactions: constants::MEMPOOL_MAX_TXS,
            max_bytes: constants::MEMPOOL_MAX_BYTES,
            expiry_secs: constants::MEMPOOL_EXPIRY_SECS,
        }
    }
}

/// Priority key for the BTreeMap index.
///
/// Uses negated fee rate so ascending iteration starts at the highest
/// priority; the last entry is the eviction candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct PriorityKey {
    /// u64::MAX - fee_rate, so higher fee rate = lower key = earlier.
    neg_fee_rate: u64,
    /// Tie-break: earlier arrival = higher priority.
    insertion_order: u64,
}

impl PriorityKey {
    fn new(fee_rate: u64, insertion_order: u64) -> Self {
        PriorityKey {
            neg_fee_rate: u64::MAX - fee_rate,
            insertion_order,
        }
    }

    fn fee_rate(&self) -> u64 {
        u64::MAX - self.neg_fee_rate
    }
}

/// Summary statistics for status reporting.
#[derive(Clone, Debug, serde::Serialize)]
pub struct MempoolStats {
    pub transaction_count: usize,
    pub total_bytes: usize,
    pub max_transactions: usize,
    pub max_bytes: usize,
    pub min_fee_rate: Option<u64>,
}

/// The pending-transaction pool.
pub struct Mempool {
    config: MempoolConfig,
    txs: HashMap<TxId, MempoolEntry>,
    /// Priority index: lowest key = highest fee rate.
    priority: BTreeMap<PriorityKey, TxId>,
    /// Referenced output -> holding transaction, for conflict detection.
    spends: HashMap<OutputId, TxId>,
    total_bytes: usize,
    insertion_counter: u64,
    events: Vec<MempoolEvent>,
}

impl Mempool {
    pub fn new(config: MempoolConfig) -> Self {
        Mempool {
            config,
            txs: HashMap::new(),
            priority: BTreeMap::new(),
            spends: HashMap::new(),
            total_bytes: 0,
            insertion_counter: 0,
            events: Vec::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(MempoolConfig::default())
    }

    /// Admit a transaction at wall-clock time `now`.
    ///
    /// Checks: duplicate, full spend validation against the best view,
    /// conflicts against the pool (lower-fee side loses), and capacity
    /// (lowest-priority entry evicted when the newcomer outbids it).
    pub fn insert(
        &mut self,
        tx: Transaction,
        view: &dyn SpendContext,
        now: i64,
    ) -> Result<TxId, MempoolError> {
        let tx_id = tx.tx_id();

        if self.txs.contains_key(&tx_id) {
            return Err(MempoolError::Duplicate);
        }

        tx.validate_spend(view)?;

        let fee_rate = tx.fee_per_byte_milli();

        // Conflicts against the pool: the higher-fee transaction stays.
        let mut to_evict: Vec<TxId> = Vec::new();
        for input in &tx.inputs {
            if let Some(&holder) = self.spends.get(&input.output_id) {
                let holder_rate = self.txs[&holder].fee_rate;
                if fee_rate <= holder_rate {
                    return Err(MempoolError::OutbidByConflict);
                }
                if !to_evict.contains(&holder) {
                    to_evict.push(holder);
                }
            }
        }
        for loser in to_evict {
            self.remove_entry(&loser, RemovalReason::Conflict);
        }

        let size = tx.estimated_size();

        // Capacity: evict the lowest-priority entry if the newcomer outbids it.
        while self.txs.len() >= self.config.max_transactions
            || self.total_bytes + size > self.config.max_bytes
        {
            let (&lowest_key, &lowest_id) = match self.priority.last_key_value() {
                Some(kv) => kv,
                None => break,
            };
            if fee_rate <= lowest_key.fee_rate() {
                return Err(MempoolError::FeeTooLow);
            }
            self.remove_entry(&lowest_id, RemovalReason::Evicted);
        }

        let insertion_order = self.insertion_counter;
        self.insertion_counter += 1;
        for input in &tx.inputs {
            self.spends.insert(input.output_id, tx_id);
        }
        self.priority
            .insert(PriorityKey::new(fee_rate, insertion_order), tx_id);
        self.total_bytes += size;
        self.txs.insert(
            tx_id,
            MempoolEntry {
                tx,
                fee_rate,
                size,
                arrival: now,
                insertion_order,
            },
        );
        self.events.push(MempoolEvent::Added(tx_id));
        Ok(tx_id)
    }

    /// Remove entries whose inputs were consumed by an accepted block.
    pub fn remove_included(&mut self, tx_ids: &[TxId]) {
        for tx_id in tx_ids {
            self.remove_entry(tx_id, RemovalReason::Included);
        }
    }

    /// Remove entries that conflict with outputs spent by accepted blocks.
    pub fn remove_conflicting(&mut self, spent: &[OutputId]) -> Vec<TxId> {
        let holders: Vec<TxId> = spent
            .iter()
            .filter_map(|o| self.spends.get(o).copied())
            .collect();
        let mut removed = Vec::new();
        for holder in holders {
            if self.remove_entry(&holder, RemovalReason::Conflict).is_some() {
                removed.push(holder);
            }
        }
        removed
    }

    /// Drop entries older than the configured expiry. Returns the count.
    pub fn evict_expired(&mut self, now: i64) -> usize {
        let cutoff = now - self.config.expiry_secs as i64;
        let expired: Vec<TxId> = self
            .txs
            .iter()
            .filter(|(_, e)| e.arrival < cutoff)
            .map(|(id, _)| *id)
            .collect();
        let count = expired.len();
        for id in expired {
            self.remove_entry(&id, RemovalReason::Expired);
        }
        count
    }

    /// Select up to `max_count` / `max_bytes` highest-priority transactions
    /// for block production, skipping mutually conflicting entries. Entries
    /// stay pooled until the block is accepted.
    pub fn select_for_block(&self, max_count: usize, max_bytes: usize) -> Vec<Transaction> {
        let mut selected = Vec::new();
        let mut used: std::collections::HashSet<OutputId> = std::collections::HashSet::new();
        let mut bytes = 0usize;
        for tx_id in self.priority.values() {
            if selected.len() >= max_count {
                break;
            }
            let entry = &self.txs[tx_id];
            if bytes + entry.size > max_bytes {
                continue;
            }
            if entry.tx.inputs.iter().any(|i| used.contains(&i.output_id)) {
                continue;
            }
            for input in &entry.tx.inputs {
                used.insert(input.output_id);
            }
            bytes += entry.size;
            selected.push(entry.tx.clone());
        }
        selected
    }

    /// Drain pending add/remove notifications for the consensus core.
    pub fn take_events(&mut self) -> Vec<MempoolEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn contains(&self, tx_id: &TxId) -> bool {
        self.txs.contains_key(tx_id)
    }

    pub fn get(&self, tx_id: &TxId) -> Option<&Transaction> {
        self.txs.get(tx_id).map(|e| &e.tx)
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn stats(&self) -> MempoolStats {
        MempoolStats {
            transaction_count: self.txs.len(),
            total_bytes: self.total_bytes,
            max_transactions: self.config.max_transactions,
            max_bytes: self.config.max_bytes,
            min_fee_rate: self.priority.last_key_value().map(|(k, _)| k.fee_rate()),
        }
    }

    fn remove_entry(&mut self, tx_id: &TxId, reason: RemovalReason) -> Option<MempoolEntry> {
        let entry = self.txs.remove(tx_id)?;
        self.priority
            .remove(&PriorityKey::new(entry.fee_rate, entry.insertion_order));
        for input in &entry.tx.inputs {
            if self.spends.get(&input.output_id) == Some(tx_id) {
                self.spends.remove(&input.output_id);
            }
        }
        self.total_bytes -= entry.size;
        self.events.push(MempoolEvent::Removed(*tx_id, reason));
        Some(entry)
    }
}

impl Default for Mempool {
    fn default() -> Self {
        Self::with_defaults()
    }
}
