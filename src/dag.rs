//! Block-DAG store: acceptance, ancestry queries, the blue/red ordering
//! rule, and the unspent-output set.
//!
//! Unlike a blockchain, every block references one to eight parents, so
//! honest blocks produced in parallel all enter the ledger. Ordering is
//! recovered deterministically: blocks are partitioned into a well-connected
//! "blue" set (a block is blue when at most `k` blue blocks sit in its
//! anticone, chosen greedily from the heaviest tip) and the remaining "red"
//! blocks are woven in after their latest blue ancestor, ties broken by
//! smaller hash.
//!
//! The store owns the unspent-output set. Blocks are applied in acceptance
//! order; a transaction whose input is already spent on the accepted view
//! is dropped, never applied, so a double spend is unreachable in the
//! output set.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::block::{Block, BlockId};
use crate::consensus::issuance;
use crate::crypto::keys::SigningPublicKey;
use crate::transaction::{OutputId, SpendContext, TxId, UtxoEntry, ValidationError};
use crate::{constants, Hash};

/// Evidence that a producer signed two distinct blocks for one slot.
#[derive(Clone, Debug)]
pub struct EquivocationEvidence {
    pub producer: Hash,
    pub slot: u64,
    pub first: BlockId,
    pub second: BlockId,
}

/// Result of inserting a block.
#[derive(Clone, Debug)]
pub enum InsertOutcome {
    /// Accepted into the DAG. Carries the issuance credited to the producer
    /// and any transactions dropped as conflicting.
    Accepted {
        reward: u64,
        dropped_txs: Vec<TxId>,
    },
    /// The block was already present; the insert was a no-op.
    AlreadyKnown,
    /// Parents missing; parked in the orphan cache pending their arrival.
    Orphaned,
}

struct AcceptedBlock {
    block: Block,
    /// Max over parents plus this block's own delay-function length.
    cumulative_work: u128,
}

/// A detached snapshot of the unspent-output set and the key registry,
/// valid until the next explicit refresh. Handed to components outside the
/// consensus worker.
#[derive(Clone, Default)]
pub struct UtxoView {
    outputs: HashMap<OutputId, UtxoEntry>,
    keys: HashMap<Hash, SigningPublicKey>,
}

impl SpendContext for UtxoView {
    fn output(&self, id: &OutputId) -> Option<UtxoEntry> {
        self.outputs.get(id).cloned()
    }
    fn participant_key(&self, id: &Hash) -> Option<SigningPublicKey> {
        self.keys.get(id).cloned()
    }
}

/// The DAG store. Exclusive to the consensus worker; every externally
/// visible mutation funnels through [`insert`](DagStore::insert).
pub struct DagStore {
    k: usize,
    genesis: BlockId,
    blocks: HashMap<BlockId, AcceptedBlock>,
    children: HashMap<BlockId, Vec<BlockId>>,
    tips: HashSet<BlockId>,
    /// Acceptance order, the base of the linearization.
    accepted_order: Vec<BlockId>,
    /// Orphans awaiting parents, bounded by `ORPHAN_CACHE_MAX`.
    orphans: HashMap<BlockId, Block>,
    orphan_by_parent: HashMap<BlockId, HashSet<BlockId>>,
    orphan_queue: VecDeque<BlockId>,
    /// (producer, slot) -> first accepted block, for equivocation detection.
    by_producer_slot: HashMap<(Hash, u64), BlockId>,
    equivocations: Vec<EquivocationEvidence>,
    utxo: HashMap<OutputId, UtxoEntry>,
    registry: HashMap<Hash, SigningPublicKey>,
    minted: u64,
    blue_cache: Option<HashSet<BlockId>>,
    order_cache: Option<Vec<BlockId>>,
}

impl DagStore {
    /// Create a store seeded with the given genesis block.
    pub fn new(genesis: Block, k: usize) -> Self {
        let id = genesis.id();
        let mut blocks = HashMap::new();
        blocks.insert(
            id,
            AcceptedBlock {
                block: genesis,
                cumulative_work: 0,
            },
        );
        let mut tips = HashSet::new();
        tips.insert(id);
        DagStore {
            k,
            genesis: id,
            blocks,
            children: HashMap::new(),
            tips,
            accepted_order: vec![id],
            orphans: HashMap::new(),
            orphan_by_parent: HashMap::new(),
            orphan_queue: VecDeque::new(),
            by_producer_slot: HashMap::new(),
            equivocations: Vec::new(),
            utxo: HashMap::new(),
            registry: HashMap::new(),
            minted: 0,
            blue_cache: None,
            order_cache: None,
        }
    }

    /// The synthetic genesis block: no parents, no producer, zero proofs.
    pub fn genesis_block() -> Block {
        use crate::crypto::keys::Signature;
        use crate::crypto::vrf::VrfOutput;
        use crate::temporal::clock::UtcInstant;
        use crate::temporal::vdf::VdfProof;

        let seed = crate::hash_domain(b"tempora.genesis", b"tempora-mainnet");
        Block {
            version: 1,
            parents: vec![],
            producer: SigningPublicKey(vec![0u8; 32]),
            vrf: VrfOutput {
                value: seed,
                proof: Signature::empty(),
            },
            tx_root: [0u8; 32],
            vdf: crate::block::WindowProof {
                window: 0,
                proof: VdfProof {
                    input: seed,
                    output: seed,
                    iterations: constants::VDF_MIN_ITERATIONS,
                    checkpoint_interval: constants::VDF_MIN_ITERATIONS,
                    checkpoints: vec![seed, seed],
                },
            },
            timestamp: UtcInstant::new(0, 0),
            transactions: vec![],
            signature: Signature::empty(),
        }
    }

    pub fn genesis_id(&self) -> BlockId {
        self.genesis
    }

    /// Register a participant's verification key. The registry backs spend
    /// signature checks; keys are immutable once registered.
    pub fn register_participant(&mut self, key: SigningPublicKey) {
        self.registry.entry(key.fingerprint()).or_insert(key);
    }

    pub fn participant_key(&self, id: &Hash) -> Option<&SigningPublicKey> {
        self.registry.get(id)
    }

    /// Insert a block.
    ///
    /// Re-inserting a known block returns [`InsertOutcome::AlreadyKnown`].
    /// A block with missing parents is parked as an orphan. A second block
    /// by the same producer for the same slot is rejected with
    /// [`ValidationError::Equivocation`] and the evidence is recorded.
    pub fn insert(&mut self, block: Block) -> Result<InsertOutcome, ValidationError> {
        let id = block.id();
        if self.blocks.contains_key(&id) {
            return Ok(InsertOutcome::AlreadyKnown);
        }
        if self.orphans.contains_key(&id) {
            return Ok(InsertOutcome::Orphaned);
        }

        block.validate_structure(false)?;

        if block.parents.iter().any(|p| !self.blocks.contains_key(p)) {
            self.park_orphan(id, block);
            return Ok(InsertOutcome::Orphaned);
        }

        let outcome = self.accept(id, block)?;
        self.wake_orphans(id);
        Ok(outcome)
    }

    fn accept(&mut self, id: BlockId, block: Block) -> Result<InsertOutcome, ValidationError> {
        let producer = block.producer_id();
        let slot = block.slot();
        if let Some(&first) = self.by_producer_slot.get(&(producer, slot)) {
            if first != id {
                self.equivocations.push(EquivocationEvidence {
                    producer,
                    slot,
                    first,
                    second: id,
                });
                tracing::warn!(
                    producer = %hex::encode(&producer[..6]),
                    slot,
                    "equivocation: second block for an occupied slot rejected"
                );
                return Err(ValidationError::Equivocation);
            }
        }

        // Producers register implicitly with their first accepted block.
        self.registry
            .entry(producer)
            .or_insert_with(|| block.producer.clone());

        // Apply transactions against the accepted view. Conflicting
        // transactions are dropped; the block itself stays acceptable.
        let mut dropped = Vec::new();
        let mut fees: u64 = 0;
        for tx in &block.transactions {
            match tx.validate_spend(self) {
                Ok(()) => {
                    for input in &tx.inputs {
                        self.utxo.remove(&input.output_id);
                    }
                    for (index, output) in tx.outputs.iter().enumerate() {
                        self.utxo.insert(
                            tx.output_id(index as u32),
                            UtxoEntry {
                                owner: output.recipient,
                                amount: output.amount,
                                tier: output.tier,
                                birth: block.timestamp,
                            },
                        );
                    }
                    fees = fees.saturating_add(tx.fee);
                }
                Err(e) => {
                    tracing::debug!(tx = %hex::encode(&tx.tx_id().0[..6]), error = %e, "transaction dropped at block acceptance");
                    dropped.push(tx.tx_id());
                }
            }
        }

        // Issuance: credit the producer with the scheduled reward (within
        // the cap) plus the fees of the applied transactions.
        let accepted_before = self.accepted_order.len() as u64 - 1; // exclude genesis
        let reward = issuance::block_reward(accepted_before)
            .min(constants::ISSUANCE_CAP - self.minted);
        self.minted += reward;
        let credit = reward.saturating_add(fees);
        if credit > 0 {
            let coinbase_id = OutputId(crate::hash_concat(&[b"tempora.coinbase", &id.0]));
            self.utxo.insert(
                coinbase_id,
                UtxoEntry {
                    owner: producer,
                    amount: credit,
                    tier: crate::transaction::PrivacyTier::T0,
                    birth: block.timestamp,
                },
            );
        }

        let parent_work = block
            .parents
            .iter()
            .map(|p| self.blocks[p].cumulative_work)
            .max()
            .unwrap_or(0);
        let cumulative_work = parent_work + block.vdf.proof.iterations as u128;

        for parent in &block.parents {
            self.children.entry(*parent).or_default().push(id);
            self.tips.remove(parent);
        }
        self.tips.insert(id);
        self.by_producer_slot.insert((producer, slot), id);
        self.accepted_order.push(id);
        self.blocks.insert(
            id,
            AcceptedBlock {
                block,
                cumulative_work,
            },
        );
        self.blue_cache = None;
        self.order_cache = None;

        Ok(InsertOutcome::Accepted {
            reward,
            dropped_txs: dropped,
        })
    }

    fn park_orphan(&mut self, id: BlockId, block: Block) {
        while self.orphans.len() >= constants::ORPHAN_CACHE_MAX {
            let Some(oldest) = self.orphan_queue.pop_front() else {
                break;
            };
            if let Some(dropped) = self.orphans.remove(&oldest) {
                for parent in &dropped.parents {
                    if let Some(set) = self.orphan_by_parent.get_mut(parent) {
                        set.remove(&oldest);
                    }
                }
            }
        }
        for parent in &block.parents {
            if !self.blocks.contains_key(parent) {
                self.orphan_by_parent.entry(*parent).or_default().insert(id);
            }
        }
        self.orphan_queue.push_back(id);
        self.orphans.insert(id, block);
    }

    /// Re-run orphans unblocked by a newly accepted block.
    fn wake_orphans(&mut self, accepted: BlockId) {
        let mut ready = vec![accepted];
        while let Some(parent) = ready.pop() {
            let waiting: Vec<BlockId> = self
                .orphan_by_parent
                .remove(&parent)
                .map(|s| s.into_iter().collect())
                .unwrap_or_default();
            for orphan_id in waiting {
                let Some(orphan) = self.orphans.get(&orphan_id) else {
                    continue;
                };
                if orphan.parents.iter().any(|p| !self.blocks.contains_key(p)) {
                    continue;
                }
                let orphan = self.orphans.remove(&orphan_id).expect("present");
                self.orphan_queue.retain(|o| *o != orphan_id);
                match self.accept(orphan_id, orphan) {
                    Ok(_) => {
                        tracing::debug!(block = %orphan_id.short(), "orphan resolved");
                        ready.push(orphan_id);
                    }
                    Err(e) => {
                        tracing::debug!(block = %orphan_id.short(), error = %e, "orphan rejected");
                    }
                }
            }
        }
    }

    // ── Queries ──

    pub fn contains(&self, id: &BlockId) -> bool {
        self.blocks.contains_key(id)
    }

    pub fn get(&self, id: &BlockId) -> Option<&Block> {
        self.blocks.get(id).map(|a| &a.block)
    }

    pub fn cumulative_work(&self, id: &BlockId) -> Option<u128> {
        self.blocks.get(id).map(|a| a.cumulative_work)
    }

    /// Number of accepted blocks, genesis included.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    pub fn minted(&self) -> u64 {
        self.minted
    }

    /// Current tips: accepted blocks with no accepted descendants.
    pub fn tips(&self) -> &HashSet<BlockId> {
        &self.tips
    }

    /// Select up to `max_parents` tips for a new block, heaviest first.
    pub fn select_parents(&self, max_parents: usize) -> Vec<BlockId> {
        let mut tips: Vec<BlockId> = self.tips.iter().copied().collect();
        tips.sort_by(|a, b| {
            let wa = self.blocks[a].cumulative_work;
            let wb = self.blocks[b].cumulative_work;
            wb.cmp(&wa).then_with(|| a.0.cmp(&b.0))
        });
        tips.truncate(max_parents);
        tips
    }

    /// All transitive ancestors of a block (excluding itself).
    pub fn ancestors(&self, id: &BlockId) -> HashSet<BlockId> {
        let mut result = HashSet::new();
        let mut stack = vec![*id];
        while let Some(current) = stack.pop() {
            if let Some(a) = self.blocks.get(&current) {
                for parent in &a.block.parents {
                    if result.insert(*parent) {
                        stack.push(*parent);
                    }
                }
            }
        }
        result
    }

    /// All transitive descendants of a block (excluding itself).
    pub fn descendants(&self, id: &BlockId) -> HashSet<BlockId> {
        let mut result = HashSet::new();
        let mut stack: Vec<BlockId> = self.children.get(id).cloned().unwrap_or_default();
        while let Some(current) = stack.pop() {
            if result.insert(current) {
                if let Some(kids) = self.children.get(&current) {
                    stack.extend(kids.iter().copied());
                }
            }
        }
        result
    }

    /// Ancestors shared by two blocks.
    pub fn common_ancestors(&self, a: &BlockId, b: &BlockId) -> HashSet<BlockId> {
        let ancestors_a = self.ancestors(a);
        let ancestors_b = self.ancestors(b);
        ancestors_a.intersection(&ancestors_b).copied().collect()
    }

    /// The anticone of a block: accepted blocks neither ancestor nor
    /// descendant of it (the block itself excluded).
    pub fn anticone(&self, id: &BlockId) -> HashSet<BlockId> {
        let ancestors = self.ancestors(id);
        let descendants = self.descendants(id);
        self.blocks
            .keys()
            .filter(|b| **b != *id && !ancestors.contains(b) && !descendants.contains(b))
            .copied()
            .collect()
    }

    /// The blue set: traversing blocks from the heaviest side in
    /// topological order, a block joins while at most `k` blue blocks sit
    /// in its anticone.
    pub fn blue_set(&mut self) -> HashSet<BlockId> {
        if let Some(cached) = &self.blue_cache {
            return cached.clone();
        }
        let order = self.topological_order_by_weight();
        let mut blue: HashSet<BlockId> = HashSet::new();
        for id in order {
            let anticone = self.anticone(&id);
            let blue_in_anticone = anticone.iter().filter(|b| blue.contains(b)).count();
            if blue_in_anticone <= self.k {
                blue.insert(id);
            }
        }
        self.blue_cache = Some(blue.clone());
        blue
    }

    pub fn is_blue(&mut self, id: &BlockId) -> bool {
        self.blue_set().contains(id)
    }

    /// Topological order preferring heavier subtrees, used for the greedy
    /// blue-set construction.
    fn topological_order_by_weight(&self) -> Vec<BlockId> {
        let mut remaining_parents: HashMap<BlockId, usize> = self
            .blocks
            .iter()
            .map(|(id, a)| (*id, a.block.parents.len()))
            .collect();
        // BTreeSet keyed by (negated weight via complement, hash) gives a
        // deterministic heaviest-first frontier.
        let mut frontier: BTreeSet<(u128, Hash)> = BTreeSet::new();
        let weight_key = |w: u128| u128::MAX - w;
        for (id, count) in &remaining_parents {
            if *count == 0 {
                frontier.insert((weight_key(self.blocks[id].cumulative_work), id.0));
            }
        }
        let mut order = Vec::with_capacity(self.blocks.len());
        while let Some(&(key, hash)) = frontier.iter().next() {
            frontier.remove(&(key, hash));
            let id = BlockId(hash);
            order.push(id);
            if let Some(kids) = self.children.get(&id) {
                for kid in kids {
                    let count = remaining_parents.get_mut(kid).expect("known block");
                    *count -= 1;
                    if *count == 0 {
                        frontier.insert((weight_key(self.blocks[kid].cumulative_work), kid.0));
                    }
                }
            }
        }
        order
    }

    /// Deterministic linearization of the whole accepted set.
    ///
    /// Blue blocks in topological order with ties broken by smaller hash;
    /// each red block is inserted right after its latest blue ancestor,
    /// reds at the same point ordered by smaller hash.
    pub fn linearize(&mut self) -> Vec<BlockId> {
        if let Some(cached) = &self.order_cache {
            return cached.clone();
        }
        let blue = self.blue_set();

        // Topological order over blue blocks only, smaller hash first.
        let mut remaining: HashMap<BlockId, usize> = HashMap::new();
        for id in &blue {
            let blue_parents = self.blocks[id]
                .block
                .parents
                .iter()
                .filter(|p| blue.contains(p))
                .count();
            remaining.insert(*id, blue_parents);
        }
        let mut frontier: BTreeSet<Hash> = remaining
            .iter()
            .filter(|(_, c)| **c == 0)
            .map(|(id, _)| id.0)
            .collect();
        let mut blue_order: Vec<BlockId> = Vec::with_capacity(blue.len());
        let mut blue_index: HashMap<BlockId, usize> = HashMap::new();
        while let Some(&hash) = frontier.iter().next() {
            frontier.remove(&hash);
            let id = BlockId(hash);
            blue_index.insert(id, blue_order.len());
            blue_order.push(id);
            if let Some(kids) = self.children.get(&id) {
                for kid in kids {
                    if let Some(count) = remaining.get_mut(kid) {
                        *count -= 1;
                        if *count == 0 {
                            frontier.insert(kid.0);
                        }
                    }
                }
            }
        }

        // Attach each red block after its latest blue ancestor.
        let mut attachments: HashMap<usize, Vec<BlockId>> = HashMap::new();
        for id in self.blocks.keys() {
            if blue.contains(id) {
                continue;
            }
            let latest_blue = self
                .ancestors(id)
                .iter()
                .filter_map(|a| blue_index.get(a))
                .max()
                .copied()
                .unwrap_or(0);
            attachments.entry(latest_blue).or_default().push(*id);
        }
        for reds in attachments.values_mut() {
            reds.sort_by(|a, b| a.0.cmp(&b.0));
        }

        let mut order = Vec::with_capacity(self.blocks.len());
        for (index, id) in blue_order.iter().enumerate() {
            order.push(*id);
            if let Some(reds) = attachments.remove(&index) {
                order.extend(reds);
            }
        }
        self.order_cache = Some(order.clone());
        order
    }

    /// Accepted blocks whose timestamps fall inside a finality window,
    /// in linearized order. The material of the window's checkpoint.
    pub fn blocks_in_window(&mut self, interval_secs: u64, window: u64) -> Vec<BlockId> {
        let start = (window * interval_secs) as i64;
        let end = ((window + 1) * interval_secs) as i64;
        self.linearize()
            .into_iter()
            .filter(|id| {
                let ts = self.blocks[id].block.timestamp.secs;
                *id != self.genesis && ts >= start && ts < end
            })
            .collect()
    }

    /// Sum of delay-function iterations over a window's blocks.
    pub fn work_in_window(&mut self, interval_secs: u64, window: u64) -> u128 {
        self.blocks_in_window(interval_secs, window)
            .iter()
            .map(|id| self.blocks[id].block.vdf.proof.iterations as u128)
            .sum()
    }

    /// Drain recorded equivocation evidence.
    pub fn take_equivocations(&mut self) -> Vec<EquivocationEvidence> {
        std::mem::take(&mut self.equivocations)
    }

    /// A detached snapshot of the unspent-output set and registry.
    pub fn snapshot(&self) -> UtxoView {
        UtxoView {
            outputs: self.utxo.clone(),
            keys: self.registry.clone(),
        }
    }

    /// Outputs owned by a participant (status reporting).
    pub fn balance(&self, owner: &Hash) -> u64 {
        self.utxo
            .values()
            .filter(|e| e.owner == *owner)
            .map(|e| e.amount)
            .sum()
    }

    pub fn utxo_len(&self) -> usize {
        self.utxo.len()
    }
}

impl SpendContext for DagStore {
    fn output(&self, id: &OutputId) -> Option<UtxoEntry> {
        self.utxo.get(id).cloned()
    }
    fn participant_key(&self, id: &Hash) -> Option<SigningPublicKey> {
        self.registry.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::{Signature, SigningKeypair};
    use crate::crypto::vrf::{self, VrfOutput};
    use crate::temporal::clock::UtcInstant;
    use crate::temporal::vdf;

    fn make_block(keypair: &SigningKeypair, parents: Vec<BlockId>, slot: i64) -> Block {
        // Every test block shares one (input, T) pair, so the sequential
        // evaluation runs once per process.
        static CACHED: std::sync::OnceLock<vdf::VdfProof> = std::sync::OnceLock::new();
        let proof = CACHED
            .get_or_init(|| {
                let input = vdf::window_input(&[0u8; 32], 0);
                vdf::prove(&input, constants::VDF_MIN_ITERATIONS, 8192).unwrap()
            })
            .clone();
        let mut block = Block {
            version: 1,
            parents,
            producer: keypair.public.clone(),
            vrf: VrfOutput::evaluate(keypair, &vrf::lottery_input(&[0u8; 32], slot as u64)),
            tx_root: Block::compute_tx_root(&[]),
            vdf: crate::block::WindowProof { window: 0, proof },
            timestamp: UtcInstant::new(slot, 0),
            transactions: vec![],
            signature: Signature::empty(),
        };
        block.sign(keypair);
        block
    }

    fn store() -> DagStore {
        DagStore::new(DagStore::genesis_block(), constants::PHANTOM_K)
    }

    #[test]
    fn genesis_is_sole_tip() {
        let dag = store();
        assert_eq!(dag.len(), 1);
        assert!(dag.tips().contains(&dag.genesis_id()));
    }

    #[test]
    fn insert_and_reinsert() {
        let kp = SigningKeypair::generate();
        let mut dag = store();
        let block = make_block(&kp, vec![dag.genesis_id()], 10);
        assert!(matches!(
            dag.insert(block.clone()).unwrap(),
            InsertOutcome::Accepted { .. }
        ));
        // Idempotent re-insert.
        assert!(matches!(
            dag.insert(block).unwrap(),
            InsertOutcome::AlreadyKnown
        ));
        assert_eq!(dag.len(), 2);
    }

    #[test]
    fn missing_parent_parks_orphan_then_resolves() {
        let kp = SigningKeypair::generate();
        let mut dag = store();
        let parent = make_block(&kp, vec![dag.genesis_id()], 10);
        let child = make_block(&kp, vec![parent.id()], 11);

        assert!(matches!(
            dag.insert(child.clone()).unwrap(),
            InsertOutcome::Orphaned
        ));
        assert_eq!(dag.orphan_count(), 1);
        assert!(!dag.contains(&child.id()));

        dag.insert(parent).unwrap();
        assert_eq!(dag.orphan_count(), 0);
        assert!(dag.contains(&child.id()));
    }

    #[test]
    fn parent_always_accepted_before_child() {
        let kp = SigningKeypair::generate();
        let mut dag = store();
        let a = make_block(&kp, vec![dag.genesis_id()], 10);
        let b = make_block(&kp, vec![a.id()], 11);
        let c = make_block(&kp, vec![b.id()], 12);
        dag.insert(c.clone()).unwrap();
        dag.insert(b.clone()).unwrap();
        dag.insert(a.clone()).unwrap();

        let order = dag.linearize();
        let pos = |id: &BlockId| order.iter().position(|x| x == id).unwrap();
        assert!(pos(&a.id()) < pos(&b.id()));
        assert!(pos(&b.id()) < pos(&c.id()));
    }

    #[test]
    fn equivocation_rejected_and_recorded() {
        let kp = SigningKeypair::generate();
        let mut dag = store();
        let first = make_block(&kp, vec![dag.genesis_id()], 10);
        dag.insert(first.clone()).unwrap();

        // Same producer, same slot, different parents set -> different id.
        let second = {
            let mut b = make_block(&kp, vec![dag.genesis_id(), first.id()], 10);
            b.sign(&kp);
            b
        };
        assert!(matches!(
            dag.insert(second),
            Err(ValidationError::Equivocation)
        ));
        let evidence = dag.take_equivocations();
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].producer, kp.public.fingerprint());
        assert_eq!(evidence[0].slot, 10);
    }

    #[test]
    fn diamond_anticone_and_ancestry() {
        let kp1 = SigningKeypair::generate();
        let kp2 = SigningKeypair::generate();
        let mut dag = store();
        let g = dag.genesis_id();
        let a = make_block(&kp1, vec![g], 10);
        let b = make_block(&kp2, vec![g], 10);
        let c = make_block(&kp1, vec![a.id(), b.id()], 12);
        dag.insert(a.clone()).unwrap();
        dag.insert(b.clone()).unwrap();
        dag.insert(c.clone()).unwrap();

        assert!(dag.anticone(&a.id()).contains(&b.id()));
        assert!(dag.anticone(&b.id()).contains(&a.id()));
        assert!(dag.anticone(&c.id()).is_empty());
        assert!(dag.ancestors(&c.id()).contains(&g));
        assert_eq!(dag.common_ancestors(&a.id(), &b.id()), HashSet::from([g]));
        assert_eq!(dag.tips().len(), 1);
        assert!(dag.tips().contains(&c.id()));
    }

    #[test]
    fn small_dag_is_all_blue() {
        let kp1 = SigningKeypair::generate();
        let kp2 = SigningKeypair::generate();
        let mut dag = store();
        let g = dag.genesis_id();
        let a = make_block(&kp1, vec![g], 10);
        let b = make_block(&kp2, vec![g], 10);
        dag.insert(a.clone()).unwrap();
        dag.insert(b.clone()).unwrap();
        // With k=8, two parallel blocks are both well connected.
        let blue = dag.blue_set();
        assert!(blue.contains(&a.id()));
        assert!(blue.contains(&b.id()));
        assert!(blue.contains(&g));
    }

    #[test]
    fn parallel_blocks_ordered_by_hash() {
        let kp1 = SigningKeypair::generate();
        let kp2 = SigningKeypair::generate();
        let mut dag = store();
        let g = dag.genesis_id();
        let a = make_block(&kp1, vec![g], 10);
        let b = make_block(&kp2, vec![g], 10);
        dag.insert(a.clone()).unwrap();
        dag.insert(b.clone()).unwrap();

        let order = dag.linearize();
        let (first, second) = if a.id().0 < b.id().0 {
            (a.id(), b.id())
        } else {
            (b.id(), a.id())
        };
        let pos = |id: &BlockId| order.iter().position(|x| x == id).unwrap();
        assert!(pos(&first) < pos(&second));
    }

    #[test]
    fn linearization_deterministic_across_insert_orders() {
        let kps: Vec<SigningKeypair> = (0..3).map(|_| SigningKeypair::generate()).collect();
        let build = |dag: &mut DagStore, order: &[usize], blocks: &[Block]| {
            for i in order {
                dag.insert(blocks[*i].clone()).unwrap();
            }
        };
        let mut dag1 = store();
        let g = dag1.genesis_id();
        let a = make_block(&kps[0], vec![g], 10);
        let b = make_block(&kps[1], vec![g], 10);
        let c = make_block(&kps[2], vec![a.id(), b.id()], 12);
        let blocks = vec![a, b, c];

        build(&mut dag1, &[0, 1, 2], &blocks);
        let mut dag2 = store();
        // c arrives first, parks as orphan, resolves later.
        let _ = dag2.insert(blocks[2].clone());
        build(&mut dag2, &[1, 0], &blocks);

        assert_eq!(dag1.linearize(), dag2.linearize());
    }

    #[test]
    fn issuance_credits_producer() {
        let kp = SigningKeypair::generate();
        let mut dag = store();
        let block = make_block(&kp, vec![dag.genesis_id()], 10);
        let outcome = dag.insert(block).unwrap();
        match outcome {
            InsertOutcome::Accepted { reward, .. } => {
                assert_eq!(reward, constants::INITIAL_REWARD)
            }
            other => panic!("expected Accepted, got {:?}", other),
        }
        assert_eq!(
            dag.balance(&kp.public.fingerprint()),
            constants::INITIAL_REWARD
        );
        assert_eq!(dag.minted(), constants::INITIAL_REWARD);
    }

    #[test]
    fn double_spend_across_blocks_dropped() {
        use crate::transaction::{Transaction, TxInput, TxOutput};

        let producer = SigningKeypair::generate();
        let spender = SigningKeypair::generate();
        let mut dag = store();
        dag.register_participant(spender.public.clone());

        // Fund the spender via a produced block's coinbase... simpler: fund
        // through a first block produced by the spender.
        let fund = make_block(&spender, vec![dag.genesis_id()], 10);
        let fund_id = fund.id();
        dag.insert(fund).unwrap();
        let coinbase = OutputId(crate::hash_concat(&[b"tempora.coinbase", &fund_id.0]));

        let spend = |fee: u64, recipient: Hash| {
            let mut tx = Transaction {
                version: 1,
                inputs: vec![TxInput {
                    output_id: coinbase,
                    signature: Signature::empty(),
                }],
                outputs: vec![TxOutput {
                    recipient,
                    amount: constants::INITIAL_REWARD - fee,
                    tier: crate::transaction::PrivacyTier::T0,
                }],
                fee,
                aux_payload: None,
            };
            tx.sign_inputs(&spender);
            tx
        };

        let tx1 = spend(10, crate::sha3(b"alice"));
        let tx2 = spend(10, crate::sha3(b"bob"));

        let block1 = {
            let mut b = make_block(&producer, vec![fund_id], 20);
            b.transactions = vec![tx1.clone()];
            b.tx_root = Block::compute_tx_root(&b.transactions);
            b.sign(&producer);
            b
        };
        let producer2 = SigningKeypair::generate();
        let block2 = {
            let mut b = make_block(&producer2, vec![block1.id()], 21);
            b.transactions = vec![tx2.clone()];
            b.tx_root = Block::compute_tx_root(&b.transactions);
            b.sign(&producer2);
            b
        };

        match dag.insert(block1).unwrap() {
            InsertOutcome::Accepted { dropped_txs, .. } => assert!(dropped_txs.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
        // The conflicting spend arrives in a later block and is dropped.
        match dag.insert(block2).unwrap() {
            InsertOutcome::Accepted { dropped_txs, .. } => {
                assert_eq!(dropped_txs, vec![tx2.tx_id()])
            }
            other => panic!("unexpected {:?}", other),
        }
        // The double-spent output exists exactly once in the UTXO history:
        // alice got it, bob did not.
        assert_eq!(
            dag.balance(&crate::sha3(b"alice")),
            constants::INITIAL_REWARD - 10
        );
        assert_eq!(dag.balance(&crate::sha3(b"bob")), 0);
    }

    #[test]
    fn blocks_in_window_filters_by_timestamp() {
        let kp = SigningKeypair::generate();
        let kp2 = SigningKeypair::generate();
        let mut dag = store();
        let a = make_block(&kp, vec![dag.genesis_id()], 70);
        let b = make_block(&kp2, vec![a.id()], 130);
        dag.insert(a.clone()).unwrap();
        dag.insert(b.clone()).unwrap();

        assert_eq!(dag.blocks_in_window(60, 1), vec![a.id()]);
        assert_eq!(dag.blocks_in_window(60, 2), vec![b.id()]);
        assert!(dag.blocks_in_window(60, 3).is_empty());
        assert_eq!(
            dag.work_in_window(60, 1),
            constants::VDF_MIN_ITERATIONS as u128
        );
    }

    #[test]
    fn select_parents_bounded_and_heaviest_first() {
        let mut dag = store();
        let mut tips = Vec::new();
        for _ in 0..10 {
            let kp = SigningKeypair::generate();
            let b = make_block(&kp, vec![dag.genesis_id()], 10);
            dag.insert(b.clone()).unwrap();
            tips.push(b.id());
        }
        let parents = dag.select_parents(constants::MAX_PARENTS);
        assert_eq!(parents.len(), constants::MAX_PARENTS);
    }
}
