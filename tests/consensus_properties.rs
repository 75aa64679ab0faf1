//! Property-style invariants over the public API: DAG ancestry, ordering
//! determinism, reputation bounds, delay-function behavior, and the
//! protocol's boundary conditions.

use tempora::block::{Block, BlockId};
use tempora::consensus::checkpoint::{Checkpoint, CheckpointChain};
use tempora::constants;
use tempora::crypto::keys::{Signature, SigningKeypair};
use tempora::crypto::vrf::{self, VrfOutput};
use tempora::dag::{DagStore, InsertOutcome};
use tempora::reputation::{ReputationEngine, ReputationEvent, ReputationEventKind, Tier};
use tempora::temporal::clock::{BoundaryClock, UtcInstant};
use tempora::temporal::vdf;
use tempora::transaction::ValidationError;

// ── Helpers ─────────────────────────────────────────────────────────────

const TEST_T: u64 = constants::VDF_MIN_ITERATIONS;

/// All test blocks share one (seed, window) pair, so the sequential proof
/// is computed once per process.
fn test_vdf_proof(seed: &tempora::Hash, window: u64) -> vdf::VdfProof {
    static CACHED: std::sync::OnceLock<vdf::VdfProof> = std::sync::OnceLock::new();
    let input = vdf::window_input(seed, window);
    let cached = CACHED.get_or_init(|| vdf::prove(&input, TEST_T, TEST_T / 8).unwrap());
    if cached.input == input {
        return cached.clone();
    }
    vdf::prove(&input, TEST_T, TEST_T / 8).unwrap()
}

fn make_block(keypair: &SigningKeypair, parents: Vec<BlockId>, slot: i64) -> Block {
    let seed = [0u8; 32];
    let mut block = Block {
        version: 1,
        parents,
        producer: keypair.public.clone(),
        vrf: VrfOutput::evaluate(keypair, &vrf::lottery_input(&seed, slot as u64)),
        tx_root: Block::compute_tx_root(&[]),
        vdf: tempora::block::WindowProof {
            window: 0,
            proof: test_vdf_proof(&seed, 0),
        },
        timestamp: UtcInstant::new(slot, 0),
        transactions: vec![],
        signature: Signature::empty(),
    };
    block.sign(keypair);
    block
}

fn new_dag() -> DagStore {
    DagStore::new(DagStore::genesis_block(), constants::PHANTOM_K)
}

// ── DAG invariants ──────────────────────────────────────────────────────

#[test]
fn ancestors_always_precede_descendants() {
    // Build a 3-level DAG and deliver it in several adversarial orders;
    // the accepted set must always contain every ancestor of an accepted
    // block, and the linearization must respect ancestry.
    let kps: Vec<SigningKeypair> = (0..4).map(|_| SigningKeypair::generate()).collect();
    let mut reference = new_dag();
    let g = reference.genesis_id();
    let a = make_block(&kps[0], vec![g], 10);
    let b = make_block(&kps[1], vec![g], 10);
    let c = make_block(&kps[2], vec![a.id(), b.id()], 12);
    let d = make_block(&kps[3], vec![c.id()], 13);
    let blocks = [a, b, c, d];

    let orders: [[usize; 4]; 3] = [[0, 1, 2, 3], [3, 2, 1, 0], [2, 0, 3, 1]];
    for order in orders {
        let mut dag = new_dag();
        for i in order {
            let _ = dag.insert(blocks[i].clone());
        }
        assert_eq!(dag.len(), 5, "all blocks accepted via orphan resolution");
        let linear = dag.linearize();
        let pos = |id: &BlockId| linear.iter().position(|x| x == id).unwrap();
        for block in &blocks {
            for parent in &block.parents {
                assert!(
                    pos(parent) < pos(&block.id()),
                    "parent must precede child in every delivery order"
                );
            }
        }
    }
}

#[test]
fn reinsert_is_noop() {
    let kp = SigningKeypair::generate();
    let mut dag = new_dag();
    let block = make_block(&kp, vec![dag.genesis_id()], 10);
    assert!(matches!(
        dag.insert(block.clone()).unwrap(),
        InsertOutcome::Accepted { .. }
    ));
    let before = dag.linearize();
    assert!(matches!(
        dag.insert(block).unwrap(),
        InsertOutcome::AlreadyKnown
    ));
    assert_eq!(dag.linearize(), before);
}

#[test]
fn parent_count_boundaries() {
    let kp = SigningKeypair::generate();
    let zero = make_block(&kp, vec![], 10);
    assert!(zero.validate_structure(false).is_err());

    let one = make_block(&kp, vec![BlockId([1u8; 32])], 10);
    assert!(one.validate_structure(false).is_ok());

    let nine: Vec<BlockId> = (0..9u8).map(|i| BlockId([i; 32])).collect();
    let nine_block = make_block(&kp, nine, 10);
    assert!(nine_block.validate_structure(false).is_err());
}

// ── Reputation invariants ───────────────────────────────────────────────

#[test]
fn score_bounded_under_arbitrary_event_mix() {
    let mut engine = ReputationEngine::new();
    let pid = tempora::sha3(b"subject");
    engine.register(pid, Tier::Tier1, 0);

    let kinds: Vec<ReputationEventKind> = vec![
        ReputationEventKind::BlockProduced,
        ReputationEventKind::BlockValidated,
        ReputationEventKind::InvalidBlock,
        ReputationEventKind::UptimeTick { seconds: 1_000_000 },
        ReputationEventKind::StorageReport {
            stored_blocks: 999,
            total_blocks: 1000,
        },
    ];
    let mut last_uptime = 0.0f64;
    for round in 0..200i64 {
        let kind = kinds[(round % kinds.len() as i64) as usize].clone();
        engine.apply_event(&ReputationEvent::new(pid, kind, round));
        let score = engine.score(&pid, round);
        assert!((0.0..=1.0).contains(&score), "score out of bounds: {}", score);
        let uptime = engine.get(&pid).unwrap().uptime_dimension();
        assert!(uptime >= last_uptime, "uptime dimension must be monotone");
        last_uptime = uptime;
    }
    assert_eq!(last_uptime, 1.0);
}

#[test]
fn reputation_event_idempotence() {
    let mut engine = ReputationEngine::new();
    let pid = tempora::sha3(b"subject");
    engine.register(pid, Tier::Tier1, 0);

    let event = ReputationEvent::new(pid, ReputationEventKind::InvalidBlock, 7);
    engine.apply_event(&event);
    let once = engine.score(&pid, 10).to_bits();
    engine.apply_event(&event);
    engine.apply_event(&event);
    assert_eq!(engine.score(&pid, 10).to_bits(), once);
}

#[test]
fn equivocation_quarantine_spans_180_days() {
    let mut engine = ReputationEngine::new();
    let pid = tempora::sha3(b"equivocator");
    engine.register(pid, Tier::Tier1, 0);
    engine.apply_event(&ReputationEvent::new(
        pid,
        ReputationEventKind::UptimeTick {
            seconds: constants::UPTIME_SATURATION_SECS,
        },
        0,
    ));
    assert!(engine.score(&pid, 1) > 0.0);

    engine.apply_event(&ReputationEvent::new(
        pid,
        ReputationEventKind::Equivocation,
        1000,
    ));
    let quarantine_end = 1000 + constants::QUARANTINE_SECS as i64;
    assert_eq!(engine.score(&pid, 1001), 0.0);
    assert_eq!(engine.score(&pid, quarantine_end - 1), 0.0);

    engine.tick(quarantine_end + 1);
    assert!(engine.score(&pid, quarantine_end + 1) > 0.0);
}

// ── Checkpoint invariants ───────────────────────────────────────────────

#[test]
fn checkpoint_chain_links_exactly() {
    let mut chain = CheckpointChain::new();
    for window in 0..5u64 {
        let cp = Checkpoint {
            window,
            boundary: UtcInstant::new((window as i64 + 1) * 60, 0),
            block_root: tempora::sha3(&window.to_be_bytes()),
            block_count: 0,
            heartbeat_count: 1,
            heartbeat_root: [0u8; 32],
            vdf_work: 0,
            prev: chain.seed(),
        };
        chain.append(cp).unwrap();
    }
    // Each checkpoint references exactly its predecessor.
    let mut prev = Checkpoint::genesis_seed();
    for window in 0..5u64 {
        let cp = chain.get_by_window(window).unwrap();
        assert_eq!(cp.prev, prev);
        prev = cp.id();
    }
}

// ── Temporal invariants ─────────────────────────────────────────────────

#[test]
fn delay_function_deterministic_and_tamper_evident() {
    let input = tempora::sha3(b"determinism");
    let p1 = vdf::prove(&input, TEST_T, TEST_T / 16).unwrap();
    let p2 = vdf::prove(&input, TEST_T, TEST_T / 16).unwrap();
    assert_eq!(p1.output, p2.output);
    vdf::verify(&p1, 4).unwrap();

    // Any single-bit perturbation of any checkpoint fails verification
    // when every segment is checked.
    let segments = p1.segment_count() as usize;
    for victim in [1usize, p1.checkpoints.len() / 2, p1.checkpoints.len() - 1] {
        let mut tampered = p1.clone();
        tampered.checkpoints[victim][0] ^= 1;
        if victim == tampered.checkpoints.len() - 1 {
            tampered.output = tampered.checkpoints[victim];
        }
        assert!(
            vdf::verify(&tampered, segments).is_err(),
            "perturbation at checkpoint {} must fail",
            victim
        );
    }
}

#[test]
fn clock_tolerance_exact_boundary() {
    let clock = BoundaryClock::new(60, constants::CLOCK_TOLERANCE_SECS);
    let now = UtcInstant::new(1_000_000, 0);
    // Exactly at tolerance: admissible.
    assert!(clock
        .check_timestamp_at(now, UtcInstant::new(1_000_005, 0))
        .is_ok());
    // One nanosecond past: rejected.
    assert!(clock
        .check_timestamp_at(now, UtcInstant::new(1_000_005, 1))
        .is_err());
}

// ── Serialization invariants ────────────────────────────────────────────

#[test]
fn block_wire_roundtrip_bit_identical() {
    let kp = SigningKeypair::generate();
    let block = make_block(&kp, vec![BlockId([7u8; 32])], 42);
    let bytes = block.encode();
    let decoded = Block::decode_exact(&bytes).unwrap();
    assert_eq!(decoded.encode(), bytes);

    // A corrupted byte must never round-trip silently.
    let mut corrupted = bytes.clone();
    let flip = corrupted.len() / 2;
    corrupted[flip] ^= 0xFF;
    match Block::decode_exact(&corrupted) {
        Err(_) => {}
        Ok(reparsed) => assert_ne!(reparsed.encode(), bytes),
    }
}

#[test]
fn equivocation_produces_validation_error() {
    let kp = SigningKeypair::generate();
    let mut dag = new_dag();
    let first = make_block(&kp, vec![dag.genesis_id()], 30);
    dag.insert(first.clone()).unwrap();
    let second = make_block(&kp, vec![dag.genesis_id(), first.id()], 30);
    assert!(matches!(
        dag.insert(second),
        Err(ValidationError::Equivocation)
    ));
    assert_eq!(dag.take_equivocations().len(), 1);
}
