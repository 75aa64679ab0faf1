//! Node orchestrator tying together the DAG store, mempool, reputation
//! engine, checkpoint chain, storage, and the peer link.
//!
//! The `Node` struct owns all subsystems and runs the consensus worker: a
//! single event loop through which every state-mutating operation funnels,
//! so block acceptance is linearized and any external observation of the
//! DAG reflects a total order of accept events. The sequential delay
//! function runs on its own blocking thread — one prove job at a time —
//! and reports back through a channel; the loop never blocks on it.
//!
//! The orchestrator holds no business logic of its own: it validates with
//! the block/transaction model, orders with the DAG store, scores with the
//! reputation engine, and closes windows with the checkpoint assembler.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::block::{Block, BlockId, WindowProof};
use crate::config::TemporaConfig;
use crate::consensus::checkpoint::{
    Checkpoint, CheckpointChain, Finality, Heartbeat, HeartbeatPool, HeartbeatProof,
};
use crate::consensus::lottery::{Lottery, RegistrationMonitor};
use crate::consensus::ConsensusError;
use crate::crypto::keys::{KemKeypair, SigningKeypair};
use crate::dag::{DagStore, InsertOutcome};
use crate::mempool::Mempool;
use crate::network::{Message, NetworkError, PeerId, RequestKind};
use crate::p2p::{self, P2pConfig, P2pEvent, P2pHandle};
use crate::reputation::{ReputationEngine, ReputationEvent, ReputationEventKind, Tier};
use crate::storage::{SledStorage, Storage, StorageError};
use crate::temporal::clock::{BoundaryClock, UtcInstant};
use crate::temporal::vdf::{self, VdfProof};
use crate::transaction::{Transaction, ValidationError};
use crate::wire::{Reader, Writer};
use crate::{constants, Hash};

/// Exit code for configuration errors.
pub const EXIT_CONFIG: i32 = 1;
/// Exit code when the network is unreachable at startup.
pub const EXIT_NETWORK: i32 = 2;
/// Exit code for unrecoverable state corruption.
pub const EXIT_CORRUPTION: i32 = 3;

/// Runtime configuration assembled by the CLI.
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub listen_addr: SocketAddr,
    pub control_addr: SocketAddr,
    pub bootstrap_peers: Vec<SocketAddr>,
    pub keypair: SigningKeypair,
    pub kem_keypair: KemKeypair,
    pub settings: TemporaConfig,
}

/// What the node reports over the control socket. The node never presents
/// non-final state as final: `last_final` is the boundary of the latest
/// hard checkpoint only.
#[derive(Clone, Debug)]
pub enum NodeStatus {
    Syncing,
    Active,
    Stalled { last_final_secs: Option<i64> },
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Syncing => write!(f, "Status: syncing"),
            NodeStatus::Active => write!(f, "Status: active"),
            NodeStatus::Stalled { last_final_secs } => match last_final_secs {
                Some(secs) => write!(f, "Status: stalled (last final UTC {})", secs),
                None => write!(f, "Status: stalled (no finalized state)"),
            },
        }
    }
}

/// Load the node identity from the data directory, generating and
/// persisting a fresh one on first start.
pub fn load_or_generate_keypair(
    data_dir: &Path,
) -> Result<(SigningKeypair, KemKeypair), StorageError> {
    let key_path = data_dir.join("identity.key");
    if let Ok(bytes) = std::fs::read(&key_path) {
        let mut r = Reader::new(&bytes);
        let parsed = (|| {
            let sign_pk = r.bytes()?;
            let sign_sk = r.bytes()?;
            let kem_pk = r.bytes()?;
            let kem_sk = r.bytes()?;
            let signing = SigningKeypair::from_bytes(sign_pk, sign_sk)?;
            let kem = KemKeypair::from_bytes(kem_pk, kem_sk)?;
            Some((signing, kem))
        })();
        return parsed.ok_or_else(|| StorageError::Corruption("identity key file".into()));
    }

    let signing = SigningKeypair::generate();
    let kem = KemKeypair::generate();
    let mut w = Writer::new();
    w.put_bytes(signing.public.as_bytes());
    w.put_bytes(signing.secret_bytes());
    w.put_bytes(kem.public.as_bytes());
    w.put_bytes(kem.secret_bytes());
    std::fs::create_dir_all(data_dir).map_err(|e| StorageError::WriteFailed(e.to_string()))?;
    std::fs::write(&key_path, w.as_bytes()).map_err(|e| StorageError::WriteFailed(e.to_string()))?;
    tracing::info!(
        participant = %hex::encode(&signing.public.fingerprint()[..6]),
        "generated new identity"
    );
    Ok((signing, kem))
}

enum VdfJobResult {
    Ready { window: u64, proof: VdfProof },
    Cancelled,
}

enum SyncFetch {
    CheckpointTip(Option<Vec<u8>>),
    Checkpoint(Option<Vec<u8>>),
    WindowBlocks(Option<Vec<u8>>),
}

#[derive(PartialEq)]
enum SyncState {
    /// Waiting for a peer to serve the checkpoint chain.
    NeedSync,
    /// Walking checkpoints backward / filling the DAG forward.
    Syncing,
    Synced,
}

/// The node orchestrator.
pub struct Node {
    settings: TemporaConfig,
    clock: BoundaryClock,
    keypair: SigningKeypair,
    our_id: Hash,
    tier: Tier,

    dag: DagStore,
    mempool: Mempool,
    reputation: ReputationEngine,
    checkpoints: CheckpointChain,
    heartbeats: HeartbeatPool,
    monitor: RegistrationMonitor,
    storage: SledStorage,

    p2p: P2pHandle,
    events: mpsc::Receiver<P2pEvent>,
    peers: HashMap<PeerId, Tier>,

    /// Ready delay proof for the open window, consumed by block production.
    current_vdf: Option<WindowProof>,
    vdf_cancel: Arc<AtomicBool>,
    vdf_rx: Option<tokio::sync::oneshot::Receiver<VdfJobResult>>,
    vdf_handle: Option<tokio::task::JoinHandle<()>>,

    sync_state: SyncState,
    sync_rx: mpsc::Receiver<SyncFetch>,
    sync_tx: mpsc::Sender<SyncFetch>,
    /// Checkpoints fetched during sync, keyed by id, awaiting their parent.
    sync_pending: HashMap<Hash, Checkpoint>,

    bootstrap: Vec<SocketAddr>,
    event_seq: u64,
    last_window: u64,
    standalone: bool,
}

impl Node {
    /// Open storage, replay persisted state, and start the peer link.
    pub async fn new(config: NodeConfig) -> Result<Self, StorageError> {
        let settings = config.settings;
        let clock = BoundaryClock::new(
            settings.protocol.finality_interval_seconds,
            settings.protocol.clock_tolerance_seconds,
        );
        let storage = SledStorage::open(&config.data_dir.join("db"))?;
        let tier = Tier::from_u8(settings.node.tier).unwrap_or(Tier::Tier1);
        let our_id = config.keypair.public.fingerprint();

        let mut dag = DagStore::new(DagStore::genesis_block(), settings.protocol.phantom_k);
        let mut checkpoints = CheckpointChain::new();
        let mut reputation = ReputationEngine::new();

        // Replay: reputation ledger first (idempotent), then blocks (the
        // orphan cache tolerates arbitrary order), then the checkpoint
        // chain from its tip.
        let events = storage.reputation_events()?;
        let event_seq = events.len() as u64;
        for event in &events {
            reputation.register(event.participant, Tier::Tier1, event.at);
            reputation.apply_event(event);
        }
        let mut replayed = 0usize;
        let mut deferred: Vec<Block> = storage.all_blocks()?;
        // A few passes are enough: each pass accepts all blocks whose
        // parents landed in an earlier pass.
        for _ in 0..8 {
            if deferred.is_empty() {
                break;
            }
            let batch = std::mem::take(&mut deferred);
            for block in batch {
                match dag.insert(block.clone()) {
                    Ok(InsertOutcome::Accepted { .. }) => replayed += 1,
                    Ok(InsertOutcome::Orphaned) => deferred.push(block),
                    _ => {}
                }
            }
        }
        if let Some(tip) = storage.get_checkpoint_tip()? {
            let mut chain_back = Vec::new();
            let mut cursor = tip;
            while let Some(cp) = storage.get_checkpoint(&cursor)? {
                let prev = cp.prev;
                chain_back.push(cp);
                if prev == Checkpoint::genesis_seed() {
                    break;
                }
                cursor = prev;
            }
            for cp in chain_back.into_iter().rev() {
                if checkpoints.append(cp).is_err() {
                    return Err(StorageError::Corruption("checkpoint chain".into()));
                }
            }
        }
        tracing::info!(
            blocks = replayed,
            checkpoints = checkpoints.len(),
            reputation_events = event_seq,
            "state replayed from disk"
        );

        let p2p_started = p2p::start(P2pConfig {
            listen_addr: config.listen_addr,
            keypair: config.keypair.clone(),
            kem_keypair: config.kem_keypair.clone(),
            tier,
            max_peers: settings.network.max_peers,
            recv_bps: settings.network.per_peer_recv_bps,
            send_bps: settings.network.per_peer_send_bps,
        })
        .await
        .map_err(|e| StorageError::WriteFailed(e.to_string()))?;

        // Our own identity is a participant from the start.
        let now = UtcInstant::now().secs;
        reputation.register(our_id, tier, now);
        dag.register_participant(config.keypair.public.clone());
        storage.put_participant(&config.keypair.public)?;

        let (sync_tx, sync_rx) = mpsc::channel(16);
        let standalone = settings.node.standalone;
        Ok(Node {
            settings,
            clock,
            keypair: config.keypair,
            our_id,
            tier,
            dag,
            mempool: Mempool::with_defaults(),
            reputation,
            checkpoints,
            heartbeats: HeartbeatPool::new(),
            monitor: RegistrationMonitor::new(),
            storage,
            p2p: p2p_started.handle,
            events: p2p_started.events,
            peers: HashMap::new(),
            current_vdf: None,
            vdf_cancel: Arc::new(AtomicBool::new(false)),
            vdf_rx: None,
            vdf_handle: None,
            sync_state: if standalone {
                SyncState::Synced
            } else {
                SyncState::NeedSync
            },
            sync_rx,
            sync_tx,
            sync_pending: HashMap::new(),
            bootstrap: config.bootstrap_peers,
            event_seq,
            last_window: 0,
            standalone,
        })
    }

    pub fn p2p_handle(&self) -> P2pHandle {
        self.p2p.clone()
    }

    pub fn status(&self) -> NodeStatus {
        match self.sync_state {
            SyncState::Synced => NodeStatus::Active,
            _ if self.peers.is_empty() && !self.standalone => NodeStatus::Stalled {
                last_final_secs: self.checkpoints.latest_hard().map(|cp| cp.boundary.secs),
            },
            _ => NodeStatus::Syncing,
        }
    }

    /// Connect to the bootstrap set. Returns how many links came up.
    pub async fn connect_bootstrap(&self, peers: &[SocketAddr]) -> usize {
        let mut connected = 0;
        for addr in peers {
            match self.p2p.connect(*addr).await {
                Ok(()) => connected += 1,
                Err(e) => tracing::warn!(%addr, error = %e, "bootstrap connect failed"),
            }
        }
        connected
    }

    /// Run the consensus worker until shutdown.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        let control = TcpListener::bind(self.control_addr())
            .await
            .expect("control socket bind");
        let mut slot_interval =
            tokio::time::interval(Duration::from_secs(constants::SLOT_SECS));
        self.last_window = self.clock.current_window();
        self.start_vdf_job();

        loop {
            let to_boundary = Duration::from_secs_f64(self.clock.seconds_to_next_boundary());
            tokio::select! {
                _ = shutdown.cancelled() => break,

                _ = slot_interval.tick() => {
                    self.on_slot().await;
                }

                _ = tokio::time::sleep(to_boundary) => {
                    self.on_boundary().await;
                }

                Some(event) = self.events.recv() => {
                    self.on_p2p_event(event).await;
                }

                Some(fetch) = self.sync_rx.recv() => {
                    self.on_sync_fetch(fetch).await;
                }

                Ok((stream, _)) = control.accept() => {
                    if self.handle_control(stream, &shutdown).await {
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
    }

    fn control_addr(&self) -> SocketAddr {
        format!(
            "{}:{}",
            self.settings.node.control_host, self.settings.node.control_port
        )
        .parse()
        .expect("control address")
    }

    // ── Slot handling ──

    async fn on_slot(&mut self) {
        self.poll_vdf();
        let now = UtcInstant::now();
        self.reputation.tick(now.secs);
        self.mempool.evict_expired(now.secs);
        // Mempool events are informational at this level.
        let _ = self.mempool.take_events();

        if self.sync_state != SyncState::Synced || self.tier != Tier::Tier1 {
            return;
        }
        let Some(window_proof) = self.current_vdf.clone() else {
            // The evaluator has not finished for this window; a producer
            // without a fresh proof skips its slots.
            return;
        };

        let slot = now.secs.max(0) as u64 / constants::SLOT_SECS;
        let seed = self.checkpoints.seed();
        let lottery = Lottery::new(&self.reputation, &self.monitor, now.secs);
        let claim = match lottery.try_elect(&self.keypair, &seed, slot) {
            Ok(claim) => claim,
            Err(ConsensusError::NotLeader) => return,
            Err(e) => {
                tracing::debug!(error = %e, "lottery evaluation failed");
                return;
            }
        };

        let transactions = self.mempool.select_for_block(
            constants::MAX_TXS_PER_BLOCK,
            self.settings.protocol.block_bytes_max / 2,
        );
        let parents = self.dag.select_parents(self.settings.protocol.max_parents);
        let mut block = Block {
            version: 1,
            parents,
            producer: self.keypair.public.clone(),
            vrf: claim.vrf,
            tx_root: Block::compute_tx_root(&transactions),
            vdf: window_proof,
            timestamp: now,
            transactions,
            signature: crate::crypto::keys::Signature::empty(),
        };
        block.sign(&self.keypair);

        match self.dag.insert(block.clone()) {
            Ok(InsertOutcome::Accepted { .. }) => {
                let included: Vec<_> = block.transactions.iter().map(|tx| tx.tx_id()).collect();
                self.mempool.remove_included(&included);
                if self.storage.put_block(&block).is_err() {
                    tracing::error!("failed to persist own block");
                }
                self.record_event(self.our_id, ReputationEventKind::BlockProduced, now.secs);
                tracing::info!(block = %block.id().short(), slot, txs = block.transactions.len(), "produced block");
                self.p2p.broadcast(Message::Block(Box::new(block)), None).await;
            }
            other => {
                tracing::warn!(?other, "own block rejected locally, skipping slot");
            }
        }
    }

    // ── Boundary handling ──

    async fn on_boundary(&mut self) {
        let now = UtcInstant::now();
        let current = self.clock.window_of(now);
        if current == self.last_window {
            // Spurious wake-up just before the boundary.
            return;
        }
        let closed = self.last_window;
        self.last_window = current;

        self.emit_heartbeat(closed).await;
        if self.sync_state == SyncState::Synced {
            self.emit_checkpoint(closed).await;
        }
        self.credit_uptime(closed, now.secs);
        self.monitor.close_window(now.secs);
        self.heartbeats.prune(current);
        self.maintain_outbound();
        self.start_vdf_job();
    }

    /// Keep at least the configured outbound floor by re-dialing bootstrap
    /// peers whenever the connection count sags.
    fn maintain_outbound(&self) {
        if self.peers.len() >= self.settings.network.min_outbound_peers {
            return;
        }
        for addr in self.bootstrap.clone() {
            let p2p = self.p2p.clone();
            tokio::spawn(async move {
                let _ = p2p.connect(addr).await;
            });
        }
    }

    async fn emit_heartbeat(&mut self, window: u64) {
        let proof = match (self.tier, &self.current_vdf) {
            (Tier::Tier1, Some(wp)) => HeartbeatProof::DelayProof(wp.proof.clone()),
            (Tier::Tier1, None) => {
                tracing::debug!(window, "no delay proof ready, heartbeat skipped");
                return;
            }
            _ => HeartbeatProof::VerifiedTimestamp {
                at: UtcInstant::now(),
            },
        };
        let heartbeat = Heartbeat::create(&self.keypair, window, proof, self.tier);
        self.heartbeats.insert(heartbeat.clone());
        self.p2p.broadcast(Message::Heartbeat(heartbeat), None).await;
    }

    async fn emit_checkpoint(&mut self, window: u64) {
        let interval = self.clock.interval_secs();
        let block_ids = self.dag.blocks_in_window(interval, window);
        let leaves: Vec<Hash> = block_ids
            .iter()
            .map(|id| crate::crypto::merkle::leaf_hash(&id.0))
            .collect();
        let checkpoint = Checkpoint {
            window,
            boundary: self.clock.boundary_of(window + 1),
            block_root: crate::crypto::merkle::merkle_root(&leaves),
            block_count: block_ids.len() as u32,
            heartbeat_count: self.heartbeats.count(window),
            heartbeat_root: self.heartbeats.aggregate_root(window),
            vdf_work: self.dag.work_in_window(interval, window),
            prev: self.checkpoints.seed(),
        };
        let id = checkpoint.id();
        if self.checkpoints.append(checkpoint.clone()).is_ok() {
            if self.storage.put_checkpoint(&checkpoint).is_err()
                || self.storage.put_checkpoint_tip(&id).is_err()
            {
                tracing::error!("failed to persist checkpoint");
            }
            tracing::info!(
                window,
                blocks = checkpoint.block_count,
                heartbeats = checkpoint.heartbeat_count,
                checkpoint = %hex::encode(&id[..6]),
                "finality checkpoint emitted"
            );
            self.p2p.broadcast(Message::Checkpoint(checkpoint), None).await;
        }
    }

    /// Verified presence in the closed window earns uptime for every
    /// attester; first sightings register and count toward the influx
    /// safeguard.
    fn credit_uptime(&mut self, window: u64, now: i64) {
        let interval = self.clock.interval_secs();
        for participant in self.heartbeats.participants(window) {
            if self.reputation.get(&participant).is_none() {
                self.reputation.register(participant, Tier::Tier1, now);
                self.monitor.record_registration();
            }
            self.record_event(
                participant,
                ReputationEventKind::UptimeTick { seconds: interval },
                now,
            );
        }
        // Standalone nodes count their own presence even with no peers to
        // echo their heartbeats.
        if self.standalone {
            self.record_event(
                self.our_id,
                ReputationEventKind::UptimeTick { seconds: interval },
                now,
            );
        }
        // Storage dimension refresh for ourselves: we hold the full DAG.
        let total = self.dag.len() as u64;
        self.record_event(
            self.our_id,
            ReputationEventKind::StorageReport {
                stored_blocks: total,
                total_blocks: total,
            },
            now,
        );
    }

    fn record_event(&mut self, participant: Hash, kind: ReputationEventKind, at: i64) {
        let event = ReputationEvent::new(participant, kind, at);
        self.reputation.apply_event(&event);
        if self
            .storage
            .append_reputation_event(self.event_seq, &event)
            .is_err()
        {
            tracing::error!("failed to persist reputation event");
        }
        self.event_seq += 1;
    }

    // ── Delay-function evaluator ──

    /// Launch the prove job for the open window on the dedicated blocking
    /// thread. At most one job runs per node; the previous job is
    /// cancelled at its next checkpoint emission.
    fn start_vdf_job(&mut self) {
        if self.tier != Tier::Tier1 {
            return;
        }
        self.vdf_cancel.store(true, Ordering::Relaxed);
        self.current_vdf = None;

        let cancel = Arc::new(AtomicBool::new(false));
        self.vdf_cancel = cancel.clone();
        let window = self.clock.current_window();
        let input = vdf::window_input(&self.checkpoints.seed(), window);
        let iterations = self.settings.protocol.vdf_iterations;
        let checkpoint_interval = (iterations / constants::VDF_CHECKPOINT_DIVISOR).max(1);
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.vdf_rx = Some(rx);

        let handle = tokio::task::spawn_blocking(move || {
            let result =
                match vdf::prove_cancellable(&input, iterations, checkpoint_interval, &cancel) {
                    Ok(Some(proof)) => VdfJobResult::Ready { window, proof },
                    Ok(None) => VdfJobResult::Cancelled,
                    Err(e) => {
                        tracing::error!(error = %e, "delay-function evaluation failed");
                        VdfJobResult::Cancelled
                    }
                };
            let _ = tx.send(result);
        });
        self.vdf_handle = Some(handle);
        // Poll the result from the slot tick: cheap and avoids a select arm
        // on a consumable future.
        self.poll_vdf();
    }

    fn poll_vdf(&mut self) {
        let Some(rx) = &mut self.vdf_rx else { return };
        match rx.try_recv() {
            Ok(VdfJobResult::Ready { window, proof }) => {
                if window == self.clock.current_window() {
                    tracing::debug!(window, "delay proof ready");
                    self.current_vdf = Some(WindowProof { window, proof });
                }
                self.vdf_rx = None;
            }
            Ok(VdfJobResult::Cancelled) => {
                self.vdf_rx = None;
            }
            Err(_) => {}
        }
    }

    // ── P2P message handling ──

    async fn on_p2p_event(&mut self, event: P2pEvent) {
        self.poll_vdf();
        match event {
            P2pEvent::PeerConnected { peer, tier } => {
                tracing::info!(peer = %hex::encode(&peer[..6]), ?tier, "peer connected");
                self.peers.insert(peer, tier);
                if self.sync_state == SyncState::NeedSync {
                    self.sync_state = SyncState::Syncing;
                    self.spawn_sync_fetch(peer, RequestKind::CheckpointTip, [0u8; 32]);
                }
            }
            P2pEvent::PeerDisconnected { peer } => {
                self.peers.remove(&peer);
            }
            P2pEvent::MessageReceived { peer, message } => {
                self.on_message(peer, message).await;
            }
        }
    }

    async fn on_message(&mut self, peer: PeerId, message: Message) {
        match message {
            Message::Block(block) => self.on_block(peer, *block, true).await,
            Message::Transaction(tx) => self.on_transaction(peer, tx).await,
            Message::Heartbeat(heartbeat) => self.on_heartbeat(peer, heartbeat).await,
            Message::Checkpoint(checkpoint) => self.on_checkpoint(peer, checkpoint).await,
            Message::Request { kind, hash } => self.serve_request(peer, kind, hash).await,
            Message::Response { .. } => {
                // RPC responses are settled inside the peer link; a stray
                // response here is harmless.
            }
            Message::Hello { .. } => {
                // Session-level hellos are consumed by the handshake.
            }
            Message::Disconnect { .. } => {}
        }
    }

    async fn on_block(&mut self, peer: PeerId, block: Block, gossip: bool) {
        let now = UtcInstant::now();

        // Inbound temporal and crypto failures drop the block quietly at
        // debug severity; the peer's scorecard absorbs repeat offenses.
        if self.clock.check_timestamp_at(now, block.timestamp).is_err() {
            tracing::debug!(block = %block.id().short(), "block timestamp outside clock tolerance");
            self.p2p.penalize(peer, 10).await;
            return;
        }
        let current = self.clock.window_of(now);
        if self.clock.check_window(block.vdf.window, current).is_err() {
            tracing::debug!(block = %block.id().short(), "block delay proof for a stale window");
            self.p2p.penalize(peer, 5).await;
            return;
        }
        if block.vdf.proof.iterations != self.settings.protocol.vdf_iterations {
            tracing::debug!(block = %block.id().short(), "unexpected delay-function length");
            self.p2p.penalize(peer, 10).await;
            return;
        }
        if vdf::verify(&block.vdf.proof, constants::VDF_VERIFY_SAMPLES).is_err() {
            tracing::debug!(block = %block.id().short(), "delay proof failed verification");
            self.p2p.penalize(peer, 20).await;
            return;
        }
        // The proof must be anchored to its window: its input is derived
        // from the checkpoint preceding the declared window. During sync
        // that checkpoint may not be known yet; then the chain-integrity
        // check above has to carry the block until the window closes.
        let anchor = if block.vdf.window == 0 {
            Some(Checkpoint::genesis_seed())
        } else {
            self.checkpoints
                .get_by_window(block.vdf.window - 1)
                .map(|cp| cp.id())
        };
        if let Some(seed) = anchor {
            if block.vdf.proof.input != vdf::window_input(&seed, block.vdf.window) {
                tracing::debug!(block = %block.id().short(), "delay proof not anchored to its window");
                self.p2p.penalize(peer, 20).await;
                return;
            }
        }
        // The producer's lottery claim must verify under its announced key.
        if !block.vrf.verify(
            &block.producer,
            &crate::crypto::vrf::lottery_input(&self.checkpoints.seed(), block.slot()),
        ) {
            // During sync our seed may lag; only blocks for the live
            // window are held to the lottery.
            if self.sync_state == SyncState::Synced && block.vdf.window == current {
                tracing::debug!(block = %block.id().short(), "lottery proof rejected");
                self.p2p.penalize(peer, 10).await;
                return;
            }
        }

        match self.dag.insert(block.clone()) {
            Ok(InsertOutcome::Accepted { dropped_txs, .. }) => {
                if self.storage.put_block(&block).is_err() {
                    tracing::error!("failed to persist block");
                }
                let producer = block.producer_id();
                if self.reputation.get(&producer).is_none() {
                    self.reputation.register(producer, Tier::Tier1, now.secs);
                    self.monitor.record_registration();
                }
                self.record_event(producer, ReputationEventKind::BlockProduced, now.secs);
                self.record_event(self.our_id, ReputationEventKind::BlockValidated, now.secs);

                let included: Vec<_> = block
                    .transactions
                    .iter()
                    .map(|tx| tx.tx_id())
                    .filter(|id| !dropped_txs.contains(id))
                    .collect();
                self.mempool.remove_included(&included);
                let spent: Vec<_> = block
                    .transactions
                    .iter()
                    .flat_map(|tx| tx.inputs.iter().map(|i| i.output_id))
                    .collect();
                self.mempool.remove_conflicting(&spent);

                if gossip {
                    self.p2p
                        .broadcast(Message::Block(Box::new(block)), Some(peer))
                        .await;
                }
            }
            Ok(InsertOutcome::Orphaned) => {
                // Ask the sender for the missing ancestry.
                for parent in &block.parents {
                    if !self.dag.contains(parent) {
                        let _ = self
                            .p2p
                            .send_to(
                                peer,
                                Message::Request {
                                    kind: RequestKind::Block,
                                    hash: parent.0,
                                },
                            )
                            .await;
                    }
                }
            }
            Ok(InsertOutcome::AlreadyKnown) => {}
            Err(ValidationError::Equivocation) => {
                for evidence in self.dag.take_equivocations() {
                    tracing::warn!(
                        producer = %hex::encode(&evidence.producer[..6]),
                        slot = evidence.slot,
                        "equivocation observed, quarantining producer"
                    );
                    self.record_event(
                        evidence.producer,
                        ReputationEventKind::Equivocation,
                        now.secs,
                    );
                }
            }
            Err(e) => {
                tracing::debug!(block = %block.id().short(), error = %e, "invalid block dropped");
                self.p2p.penalize(peer, 20).await;
                let producer = block.producer_id();
                if self.reputation.get(&producer).is_some() {
                    self.record_event(producer, ReputationEventKind::InvalidBlock, now.secs);
                }
            }
        }
    }

    async fn on_transaction(&mut self, peer: PeerId, tx: Transaction) {
        let now = UtcInstant::now().secs;
        match self.mempool.insert(tx.clone(), &self.dag, now) {
            Ok(_) => {
                self.p2p
                    .broadcast(Message::Transaction(tx), Some(peer))
                    .await;
            }
            Err(crate::mempool::MempoolError::Duplicate) => {}
            Err(e) => {
                tracing::debug!(error = %e, "transaction rejected");
                self.p2p.penalize(peer, 2).await;
            }
        }
    }

    async fn on_heartbeat(&mut self, peer: PeerId, heartbeat: Heartbeat) {
        let Some(key) = self.dag.participant_key(&heartbeat.participant).cloned() else {
            tracing::debug!("heartbeat from unregistered participant dropped");
            return;
        };
        if !heartbeat.verify(&key) {
            self.p2p.penalize(peer, 10).await;
            return;
        }
        // The proof shape must match the declared tier: full nodes attest
        // with delay proofs, light nodes with verified timestamps, and
        // end-user attestations arrive only through an aggregator.
        let now = UtcInstant::now();
        match (&heartbeat.source, &heartbeat.proof) {
            (Tier::Tier1, HeartbeatProof::DelayProof(proof)) => {
                if vdf::verify(proof, constants::VDF_VERIFY_SAMPLES).is_err() {
                    self.p2p.penalize(peer, 10).await;
                    return;
                }
            }
            (Tier::Tier2, HeartbeatProof::VerifiedTimestamp { at })
            | (Tier::Tier3, HeartbeatProof::Aggregated { at, .. }) => {
                if self.clock.check_timestamp_at(now, *at).is_err() {
                    tracing::debug!("heartbeat timestamp outside clock tolerance");
                    self.p2p.penalize(peer, 5).await;
                    return;
                }
            }
            _ => {
                tracing::debug!("heartbeat proof does not match its tier");
                self.p2p.penalize(peer, 10).await;
                return;
            }
        }
        if self.heartbeats.insert(heartbeat.clone()) {
            self.p2p
                .broadcast(Message::Heartbeat(heartbeat), Some(peer))
                .await;
        }
    }

    async fn on_checkpoint(&mut self, peer: PeerId, checkpoint: Checkpoint) {
        match self.checkpoints.append(checkpoint.clone()) {
            Ok(()) => {
                let id = checkpoint.id();
                let _ = self.storage.put_checkpoint(&checkpoint);
                let _ = self.storage.put_checkpoint_tip(&id);
                self.p2p
                    .broadcast(Message::Checkpoint(checkpoint), Some(peer))
                    .await;
            }
            Err(ConsensusError::CheckpointAbsent) => {
                // Possibly a fork of a known boundary, or a gap.
                match self.checkpoints.resolve_fork(checkpoint.clone()) {
                    Ok(true) => {
                        let id = checkpoint.id();
                        let _ = self.storage.put_checkpoint(&checkpoint);
                        let _ = self.storage.put_checkpoint_tip(&id);
                        self.p2p
                            .broadcast(Message::Checkpoint(checkpoint), Some(peer))
                            .await;
                    }
                    Ok(false) => {}
                    Err(ConsensusError::CheckpointAbsent) => {
                        // A gap: walk backward from this checkpoint.
                        self.sync_pending.insert(checkpoint.id(), checkpoint.clone());
                        self.spawn_sync_fetch(peer, RequestKind::Checkpoint, checkpoint.prev);
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "competing checkpoint refused");
                    }
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "checkpoint rejected");
            }
        }
    }

    async fn serve_request(&mut self, peer: PeerId, kind: RequestKind, hash: Hash) {
        let payload: Option<Vec<u8>> = match kind {
            RequestKind::Block => self.dag.get(&BlockId(hash)).map(|b| b.encode()),
            RequestKind::Transaction => self
                .mempool
                .get(&crate::transaction::TxId(hash))
                .map(|tx| tx.encode()),
            RequestKind::Checkpoint => self
                .storage
                .get_checkpoint(&hash)
                .ok()
                .flatten()
                .map(|cp| cp.encode()),
            RequestKind::CheckpointTip => self.checkpoints.latest().map(|cp| cp.encode()),
            RequestKind::WindowBlocks => {
                self.checkpoints.get(&hash).map(|cp| cp.window).map(|w| {
                    let interval = self.clock.interval_secs();
                    let ids = self.dag.blocks_in_window(interval, w);
                    let mut w_out = Writer::new();
                    w_out.put_u32(ids.len() as u32);
                    for id in ids {
                        let block = self.dag.get(&id).expect("window block present");
                        w_out.put_bytes(&block.encode());
                    }
                    w_out.into_bytes()
                })
            }
        };
        let _ = self
            .p2p
            .send_to(peer, Message::Response { kind, payload })
            .await;
    }

    // ── Startup synchronization ──

    /// Fetch a record with the RPC deadline and exponential backoff, then
    /// hand the result back to the consensus worker.
    fn spawn_sync_fetch(&self, peer: PeerId, kind: RequestKind, hash: Hash) {
        let p2p = self.p2p.clone();
        let tx = self.sync_tx.clone();
        tokio::spawn(async move {
            let mut backoff = Duration::from_millis(500);
            let mut payload = None;
            for _ in 0..4 {
                match p2p.request(peer, kind, hash).await {
                    Ok(p) => {
                        payload = p;
                        break;
                    }
                    Err(NetworkError::Timeout) => {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(Duration::from_secs(8));
                    }
                    Err(_) => break,
                }
            }
            let fetch = match kind {
                RequestKind::CheckpointTip => SyncFetch::CheckpointTip(payload),
                RequestKind::Checkpoint => SyncFetch::Checkpoint(payload),
                RequestKind::WindowBlocks => SyncFetch::WindowBlocks(payload),
                _ => return,
            };
            let _ = tx.send(fetch).await;
        });
    }

    async fn on_sync_fetch(&mut self, fetch: SyncFetch) {
        let peer = match self.peers.keys().next() {
            Some(p) => *p,
            None => {
                self.sync_state = SyncState::NeedSync;
                return;
            }
        };
        match fetch {
            SyncFetch::CheckpointTip(None) => {
                // The peer has no checkpoints either: a fresh network.
                self.sync_state = SyncState::Synced;
                tracing::info!("peer has no finalized state; starting fresh");
            }
            SyncFetch::CheckpointTip(Some(bytes)) | SyncFetch::Checkpoint(Some(bytes)) => {
                let Some(checkpoint) = Checkpoint::decode_exact(&bytes) else {
                    tracing::debug!("malformed checkpoint during sync");
                    return;
                };
                let prev = checkpoint.prev;
                self.sync_pending.insert(checkpoint.id(), checkpoint);
                if prev == Checkpoint::genesis_seed() || self.checkpoints.seed() == prev {
                    self.apply_pending_checkpoints(peer).await;
                } else if !self.sync_pending.contains_key(&prev) {
                    self.spawn_sync_fetch(peer, RequestKind::Checkpoint, prev);
                }
            }
            SyncFetch::Checkpoint(None) => {
                tracing::warn!("peer could not serve a checkpoint; sync stalled");
                self.sync_state = SyncState::NeedSync;
            }
            SyncFetch::WindowBlocks(Some(bytes)) => {
                let mut r = Reader::new(&bytes);
                let Some(count) = r.u32() else { return };
                for _ in 0..count {
                    let Some(block_bytes) = r.bytes() else { break };
                    if let Ok(block) = Block::decode_exact(&block_bytes) {
                        self.on_block(peer, block, false).await;
                    }
                }
                self.finish_sync_if_done();
            }
            SyncFetch::WindowBlocks(None) => {
                self.finish_sync_if_done();
            }
        }
    }

    /// Append every pending checkpoint that now chains from our tip, and
    /// fetch the blocks of each appended window.
    async fn apply_pending_checkpoints(&mut self, peer: PeerId) {
        loop {
            let seed = self.checkpoints.seed();
            let next = self
                .sync_pending
                .values()
                .find(|cp| cp.prev == seed)
                .map(|cp| cp.id());
            let Some(id) = next else { break };
            let checkpoint = self.sync_pending.remove(&id).expect("present");
            if self.checkpoints.append(checkpoint.clone()).is_ok() {
                let _ = self.storage.put_checkpoint(&checkpoint);
                let _ = self.storage.put_checkpoint_tip(&id);
                self.spawn_sync_fetch(peer, RequestKind::WindowBlocks, id);
            }
        }
        self.finish_sync_if_done();
    }

    fn finish_sync_if_done(&mut self) {
        if self.sync_state == SyncState::Syncing && self.sync_pending.is_empty() {
            self.sync_state = SyncState::Synced;
            tracing::info!(
                checkpoints = self.checkpoints.len(),
                blocks = self.dag.len(),
                "synchronization complete"
            );
        }
    }

    // ── Control socket ──

    /// Serve one line-oriented control connection. Returns true when the
    /// node should stop.
    async fn handle_control(
        &mut self,
        stream: tokio::net::TcpStream,
        shutdown: &CancellationToken,
    ) -> bool {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let Ok(Some(line)) = lines.next_line().await else {
            return false;
        };
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("status") => {
                let finality = self
                    .checkpoints
                    .latest()
                    .map(|cp| cp.window)
                    .map(|w| format!(", window {}", w))
                    .unwrap_or_default();
                let reply = format!(
                    "{}{} | blocks {} | peers {} | mempool {} | balance {}\n",
                    self.status(),
                    finality,
                    self.dag.len(),
                    self.peers.len(),
                    self.mempool.len(),
                    self.dag.balance(&self.our_id),
                );
                let _ = write_half.write_all(reply.as_bytes()).await;
                false
            }
            Some("stop") => {
                let _ = write_half.write_all(b"stopping\n").await;
                shutdown.cancel();
                true
            }
            Some("peer") if parts.next() == Some("add") => {
                let reply = match parts.next().and_then(|a| a.parse::<SocketAddr>().ok()) {
                    Some(addr) => match self.p2p.connect(addr).await {
                        Ok(()) => "ok\n".to_string(),
                        Err(e) => format!("error: {}\n", e),
                    },
                    None => "error: usage: peer add <addr>\n".to_string(),
                };
                let _ = write_half.write_all(reply.as_bytes()).await;
                false
            }
            _ => {
                let _ = write_half.write_all(b"error: unknown command\n").await;
                false
            }
        }
    }

    // ── Shutdown ──

    async fn shutdown(&mut self) {
        tracing::info!("shutting down");
        self.p2p.shutdown().await;
        // The evaluator must be drained before exit; cancellation lands at
        // its next checkpoint emission.
        self.vdf_cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.vdf_handle.take() {
            let grace = Duration::from_secs(constants::SHUTDOWN_GRACE_SECS);
            if tokio::time::timeout(grace, handle).await.is_err() {
                tracing::warn!("delay-function evaluator did not drain within grace period");
            }
        }
        if self.storage.flush().is_err() {
            tracing::error!("final storage flush failed");
        }
    }

    // ── Read-only views for tests and external interfaces ──

    pub fn finality_of_window(&self, window: u64) -> Finality {
        self.checkpoints.finality_of_window(window)
    }

    pub fn block_count(&self) -> usize {
        self.dag.len()
    }

    pub fn checkpoint_count(&self) -> usize {
        self.checkpoints.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_formatting() {
        assert_eq!(NodeStatus::Syncing.to_string(), "Status: syncing");
        assert_eq!(NodeStatus::Active.to_string(), "Status: active");
        assert_eq!(
            NodeStatus::Stalled {
                last_final_secs: Some(1200)
            }
            .to_string(),
            "Status: stalled (last final UTC 1200)"
        );
        assert_eq!(
            NodeStatus::Stalled {
                last_final_secs: None
            }
            .to_string(),
            "Status: stalled (no finalized state)"
        );
    }

    #[test]
    fn keypair_persists_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let (first, _) = load_or_generate_keypair(dir.path()).unwrap();
        let (second, _) = load_or_generate_keypair(dir.path()).unwrap();
        assert_eq!(
            first.public.fingerprint(),
            second.public.fingerprint()
        );
    }

    #[test]
    fn corrupted_key_file_detected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("identity.key"), b"garbage").unwrap();
        assert!(matches!(
            load_or_generate_keypair(dir.path()),
            Err(StorageError::Corruption(_))
        ));
    }
}
