// SPDX-License-Identifier: Apache-2.0
//! The Raft replication plane.
//!
//! One task per node owns all Raft state and is driven entirely by messages:
//! inbound peer RPCs, client proposals, membership changes, and its own
//! election/heartbeat timers. Outbound RPCs are spawned as short tasks whose
//! results come back through the same inbox, so the node never awaits a peer
//! while holding its state — no cycles, no deadlocks.
//!
//! Membership changes are single-step configuration entries carrying the
//! full post-change node list; a change takes effect when appended and is
//! folded into the replicated store (`nodes.json`) when committed, so it
//! survives snapshots.

mod storage;
mod transport;

pub use storage::{Entry, EntryPayload, HardState, LogIndex, SnapshotMeta, StorageError, Term};
pub use transport::{PeerEnvelope, PeerRequest, PeerResponse, TransportError};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use tally_proto::ClusterNode;

use crate::command::Command;
use crate::fsm::{ApplyOutcome, Fsm, FsmError};
use storage::RaftStorage;
use transport::InboundRpc;

/// Manager construction/runtime failures.
#[derive(Debug, Error)]
pub enum RaftError {
    /// Storage failure while opening.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Listener bind failure.
    #[error("raft transport bind failed: {0}")]
    Bind(std::io::Error),
    /// The manager task is gone.
    #[error("raft manager is shut down")]
    Shutdown,
}

/// Outcome of a proposal (or membership change) submitted to this node.
#[derive(Debug)]
pub enum ProposeOutcome {
    /// Committed and applied.
    Applied {
        /// Log index the command landed at.
        index: LogIndex,
        /// What the FSM made of it.
        outcome: ApplyOutcome,
    },
    /// This node is not the leader; redirect.
    NotLeader {
        /// Leader id, when known.
        leader_id: Option<String>,
        /// Leader HTTP address, when known.
        leader_addr: Option<String>,
    },
    /// Leadership was lost while the proposal was in flight.
    LeadershipLost,
}

/// Point-in-time view of the node for the status endpoint.
#[derive(Debug, Clone)]
pub struct RaftStatus {
    /// This node's id.
    pub node_id: String,
    /// `"leader"`, `"candidate"`, or `"follower"`.
    pub role: String,
    /// Current term.
    pub term: Term,
    /// Leader id, when known.
    pub leader_id: Option<String>,
    /// Leader HTTP address, when known.
    pub leader_addr: Option<String>,
    /// Known membership.
    pub nodes: Vec<ClusterNode>,
    /// Highest applied index.
    pub last_applied: LogIndex,
    /// Highest log index.
    pub last_log_index: LogIndex,
}

/// Raft manager configuration.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// This node's identity and advertised addresses.
    pub node: ClusterNode,
    /// Data directory; Raft state lives under `<data_dir>/raft/`.
    pub data_dir: PathBuf,
    /// Shared cluster secret for peer transport.
    pub shared_secret: String,
    /// Bootstrap as a single-node cluster when no prior state exists.
    pub bootstrap: bool,
    /// Log entries between snapshots.
    pub snapshot_threshold: u64,
    /// Entries retained behind a snapshot for slow followers.
    pub trailing_logs: u64,
    /// Slow production timeouts vs fast test timeouts.
    pub use_production_timeouts: bool,
}

impl RaftConfig {
    /// Config with production defaults.
    pub fn new(node: ClusterNode, data_dir: impl Into<PathBuf>, shared_secret: impl Into<String>) -> Self {
        Self {
            node,
            data_dir: data_dir.into(),
            shared_secret: shared_secret.into(),
            bootstrap: false,
            snapshot_threshold: 8192,
            trailing_logs: 512,
            use_production_timeouts: true,
        }
    }

    fn election_timeout(&self, rng: &mut SmallRng) -> Duration {
        let ms = if self.use_production_timeouts {
            rng.random_range(1500..3000)
        } else {
            rng.random_range(150..400)
        };
        Duration::from_millis(ms)
    }

    fn heartbeat_interval(&self) -> Duration {
        if self.use_production_timeouts {
            Duration::from_millis(500)
        } else {
            Duration::from_millis(50)
        }
    }
}

/// Handle to a running Raft manager.
#[derive(Clone)]
pub struct RaftHandle {
    tx: mpsc::Sender<RaftMsg>,
    /// The actual bound transport address (config may have asked for port 0).
    pub raft_addr: SocketAddr,
}

impl RaftHandle {
    /// Submit a command. Only the leader admits proposals.
    ///
    /// # Errors
    ///
    /// [`RaftError::Shutdown`] when the manager is gone.
    pub async fn propose(&self, cmd: Command) -> Result<ProposeOutcome, RaftError> {
        self.roundtrip(|reply| RaftMsg::Propose { cmd, reply }).await
    }

    /// Add (or update) a member. Leader-only.
    ///
    /// # Errors
    ///
    /// [`RaftError::Shutdown`] when the manager is gone.
    pub async fn join(&self, node: ClusterNode) -> Result<ProposeOutcome, RaftError> {
        self.roundtrip(|reply| RaftMsg::Join { node, reply }).await
    }

    /// Remove a member. Leader-only.
    ///
    /// # Errors
    ///
    /// [`RaftError::Shutdown`] when the manager is gone.
    pub async fn remove(&self, node_id: String) -> Result<ProposeOutcome, RaftError> {
        self.roundtrip(|reply| RaftMsg::Remove { node_id, reply })
            .await
    }

    /// Current status snapshot.
    ///
    /// # Errors
    ///
    /// [`RaftError::Shutdown`] when the manager is gone.
    pub async fn status(&self) -> Result<RaftStatus, RaftError> {
        self.roundtrip(|reply| RaftMsg::Status { reply }).await
    }

    /// Flush state and stop the manager.
    ///
    /// # Errors
    ///
    /// [`RaftError::Shutdown`] when it was already gone.
    pub async fn shutdown(&self) -> Result<(), RaftError> {
        self.roundtrip(|reply| RaftMsg::Shutdown { reply }).await
    }

    async fn roundtrip<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RaftMsg,
    ) -> Result<T, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| RaftError::Shutdown)?;
        rx.await.map_err(|_| RaftError::Shutdown)
    }
}

enum RaftMsg {
    Rpc(InboundRpc),
    Propose {
        cmd: Command,
        reply: oneshot::Sender<ProposeOutcome>,
    },
    Join {
        node: ClusterNode,
        reply: oneshot::Sender<ProposeOutcome>,
    },
    Remove {
        node_id: String,
        reply: oneshot::Sender<ProposeOutcome>,
    },
    Status {
        reply: oneshot::Sender<RaftStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    VoteReply {
        from: String,
        term_at: Term,
        response: Option<PeerResponse>,
    },
    AppendReply {
        from: String,
        sent_prev: LogIndex,
        sent_count: u64,
        response: Option<PeerResponse>,
    },
    SnapshotReply {
        from: String,
        snapshot_last: LogIndex,
        response: Option<PeerResponse>,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Start the manager: bind the transport, load persisted state, bootstrap if
/// asked, and spawn the node task.
///
/// # Errors
///
/// Storage and bind failures.
pub async fn start(config: RaftConfig, fsm: Fsm) -> Result<RaftHandle, RaftError> {
    let mut storage = RaftStorage::open(config.data_dir.join("raft"))?;

    // Derive membership: snapshot first, then any later config entries.
    let mut nodes: Vec<ClusterNode> = storage
        .snapshot()?
        .map(|(meta, _)| meta.nodes)
        .unwrap_or_default();
    for index in storage.first_index()..=storage.last_index() {
        if let Some(Entry {
            payload: EntryPayload::Config { nodes: n },
            ..
        }) = storage.entry(index)
        {
            nodes = n.clone();
        }
    }

    if config.bootstrap && nodes.is_empty() && storage.last_index() == 0 {
        // Seed a single-voter configuration as the first log entry.
        let entry = Entry {
            index: 1,
            term: 0,
            payload: EntryPayload::Config {
                nodes: vec![config.node.clone()],
            },
        };
        storage.append(&[entry])?;
        nodes = vec![config.node.clone()];
        info!(node = %config.node.id, "bootstrapped single-node cluster");
    }

    let (inbox_tx, inbox_rx) = mpsc::channel::<RaftMsg>(256);
    let (rpc_tx, mut rpc_rx) = mpsc::channel::<InboundRpc>(256);
    let (raft_addr, listener_task) =
        transport::spawn_listener(&config.node.raft_addr, config.shared_secret.clone(), rpc_tx)
            .await
            .map_err(RaftError::Bind)?;

    // Bridge inbound RPCs into the node inbox.
    let bridge_tx = inbox_tx.clone();
    let bridge_task = tokio::spawn(async move {
        while let Some(rpc) = rpc_rx.recv().await {
            if bridge_tx.send(RaftMsg::Rpc(rpc)).await.is_err() {
                break;
            }
        }
    });

    let seed = blake3_seed(&config.node.id);
    let last_applied = fsm.last_applied().max(storage.snapshot_last_index());
    let mut node = RaftNode {
        config,
        storage,
        fsm,
        nodes,
        role: Role::Follower,
        leader_hint: None,
        commit_index: 0,
        last_applied,
        next_index: HashMap::new(),
        match_index: HashMap::new(),
        inflight: HashSet::new(),
        votes: HashSet::new(),
        pending: BTreeMap::new(),
        inbox_tx: inbox_tx.clone(),
        rng: SmallRng::from_seed(seed),
    };

    tokio::spawn(async move {
        node.run(inbox_rx).await;
        listener_task.abort();
        bridge_task.abort();
    });

    Ok(RaftHandle {
        tx: inbox_tx,
        raft_addr,
    })
}

/// Deterministic per-node RNG seed; election jitter must differ per node but
/// stay reproducible for a given id.
fn blake3_seed(id: &str) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"tally:raft-seed:v1");
    hasher.update(id.as_bytes());
    *hasher.finalize().as_bytes()
}

struct RaftNode {
    config: RaftConfig,
    storage: RaftStorage,
    fsm: Fsm,
    nodes: Vec<ClusterNode>,
    role: Role,
    leader_hint: Option<String>,
    commit_index: LogIndex,
    last_applied: LogIndex,
    next_index: HashMap<String, LogIndex>,
    match_index: HashMap<String, LogIndex>,
    inflight: HashSet<String>,
    votes: HashSet<String>,
    pending: BTreeMap<LogIndex, oneshot::Sender<ProposeOutcome>>,
    inbox_tx: mpsc::Sender<RaftMsg>,
    rng: SmallRng,
}

impl RaftNode {
    async fn run(&mut self, mut inbox: mpsc::Receiver<RaftMsg>) {
        let mut election_deadline = Instant::now() + self.config.election_timeout(&mut self.rng);
        let mut heartbeat_at = Instant::now() + self.config.heartbeat_interval();
        loop {
            tokio::select! {
                msg = inbox.recv() => {
                    let Some(msg) = msg else { break };
                    match msg {
                        RaftMsg::Shutdown { reply } => {
                            if let Err(err) = self.fsm.persist_fsm_state() {
                                warn!(?err, "failed to flush fsm state at shutdown");
                            }
                            let _ = reply.send(());
                            break;
                        }
                        other => {
                            let touched_timer = self.handle(other);
                            match touched_timer {
                                Ok(reset) => {
                                    if reset {
                                        election_deadline = Instant::now()
                                            + self.config.election_timeout(&mut self.rng);
                                    }
                                }
                                Err(err) => {
                                    error!(?err, "fatal state machine failure; halting node");
                                    break;
                                }
                            }
                        }
                    }
                }
                _ = tokio::time::sleep_until(election_deadline), if self.role != Role::Leader => {
                    if self.is_voter(&self.config.node.id) {
                        self.start_election();
                    }
                    election_deadline = Instant::now() + self.config.election_timeout(&mut self.rng);
                }
                _ = tokio::time::sleep_until(heartbeat_at), if self.role == Role::Leader => {
                    self.replicate_all();
                    heartbeat_at = Instant::now() + self.config.heartbeat_interval();
                }
            }
        }
    }

    fn is_voter(&self, id: &str) -> bool {
        self.nodes.iter().any(|n| n.id == id && !n.non_voter)
    }

    fn voter_count(&self) -> usize {
        self.nodes.iter().filter(|n| !n.non_voter).count()
    }

    fn majority(&self) -> usize {
        self.voter_count() / 2 + 1
    }

    fn peers(&self) -> impl Iterator<Item = &ClusterNode> {
        let me = &self.config.node.id;
        self.nodes.iter().filter(move |n| n.id != *me)
    }

    fn leader_http_addr(&self) -> Option<String> {
        let hint = self.leader_hint.as_ref()?;
        self.nodes
            .iter()
            .find(|n| n.id == *hint)
            .map(|n| n.http_addr.clone())
    }

    fn not_leader(&self) -> ProposeOutcome {
        ProposeOutcome::NotLeader {
            leader_id: self.leader_hint.clone(),
            leader_addr: self.leader_http_addr(),
        }
    }

    /// Handle one message. Returns whether the election timer should reset.
    fn handle(&mut self, msg: RaftMsg) -> Result<bool, FsmError> {
        match msg {
            RaftMsg::Rpc(rpc) => self.handle_rpc(rpc),
            RaftMsg::Propose { cmd, reply } => {
                self.handle_propose(EntryPayload::Command { cmd }, reply)?;
                Ok(false)
            }
            RaftMsg::Join { node, reply } => {
                if self.role != Role::Leader {
                    let _ = reply.send(self.not_leader());
                    return Ok(false);
                }
                let mut nodes: Vec<ClusterNode> =
                    self.nodes.iter().filter(|n| n.id != node.id).cloned().collect();
                info!(node = %node.id, raft = %node.raft_addr, "admitting member");
                nodes.push(node);
                self.handle_propose(EntryPayload::Config { nodes }, reply)?;
                Ok(false)
            }
            RaftMsg::Remove { node_id, reply } => {
                if self.role != Role::Leader {
                    let _ = reply.send(self.not_leader());
                    return Ok(false);
                }
                info!(node = %node_id, "removing member");
                let nodes: Vec<ClusterNode> =
                    self.nodes.iter().filter(|n| n.id != node_id).cloned().collect();
                self.handle_propose(EntryPayload::Config { nodes }, reply)?;
                Ok(false)
            }
            RaftMsg::Status { reply } => {
                let _ = reply.send(RaftStatus {
                    node_id: self.config.node.id.clone(),
                    role: match self.role {
                        Role::Leader => "leader",
                        Role::Candidate => "candidate",
                        Role::Follower => "follower",
                    }
                    .into(),
                    term: self.storage.hard_state().term,
                    leader_id: if self.role == Role::Leader {
                        Some(self.config.node.id.clone())
                    } else {
                        self.leader_hint.clone()
                    },
                    leader_addr: if self.role == Role::Leader {
                        Some(self.config.node.http_addr.clone())
                    } else {
                        self.leader_http_addr()
                    },
                    nodes: self.nodes.clone(),
                    last_applied: self.last_applied,
                    last_log_index: self.storage.last_index(),
                });
                Ok(false)
            }
            RaftMsg::Shutdown { .. } => Ok(false), // handled in run()
            RaftMsg::VoteReply {
                from,
                term_at,
                response,
            } => {
                self.handle_vote_reply(&from, term_at, response);
                Ok(false)
            }
            RaftMsg::AppendReply {
                from,
                sent_prev,
                sent_count,
                response,
            } => self.handle_append_reply(&from, sent_prev, sent_count, response),
            RaftMsg::SnapshotReply {
                from,
                snapshot_last,
                response,
            } => {
                self.inflight.remove(&from);
                if let Some(PeerResponse::Snapshot { term }) = response {
                    if self.observe_term(term) {
                        return Ok(false);
                    }
                    self.next_index.insert(from.clone(), snapshot_last + 1);
                    self.match_index.insert(from, snapshot_last);
                }
                Ok(false)
            }
        }
    }

    // ─── Roles and terms ────────────────────────────────────────────────

    /// Adopt a higher term seen anywhere. Returns true if we stepped down.
    fn observe_term(&mut self, term: Term) -> bool {
        if term <= self.storage.hard_state().term {
            return false;
        }
        if let Err(err) = self.storage.save_hard_state(HardState {
            term,
            voted_for: None,
        }) {
            error!(?err, "failed to persist term bump");
        }
        self.step_down();
        true
    }

    fn step_down(&mut self) {
        if self.role == Role::Leader {
            info!(term = self.storage.hard_state().term, "stepping down");
        }
        self.role = Role::Follower;
        self.votes.clear();
        self.inflight.clear();
        for (_, reply) in std::mem::take(&mut self.pending) {
            let _ = reply.send(ProposeOutcome::LeadershipLost);
        }
    }

    fn start_election(&mut self) {
        let term = self.storage.hard_state().term + 1;
        if let Err(err) = self.storage.save_hard_state(HardState {
            term,
            voted_for: Some(self.config.node.id.clone()),
        }) {
            error!(?err, "failed to persist vote for self");
            return;
        }
        self.role = Role::Candidate;
        self.votes.clear();
        self.votes.insert(self.config.node.id.clone());
        debug!(term, "starting election");
        if self.votes.len() >= self.majority() {
            self.become_leader();
            return;
        }
        let request = PeerRequest::Vote {
            term,
            candidate_id: self.config.node.id.clone(),
            last_log_index: self.storage.last_index(),
            last_log_term: self.storage.last_term(),
        };
        for peer in self.peers().filter(|p| !p.non_voter) {
            self.spawn_vote(peer, term, request.clone());
        }
    }

    fn spawn_vote(&self, peer: &ClusterNode, term_at: Term, request: PeerRequest) {
        let envelope = self.envelope(request);
        let addr = peer.raft_addr.clone();
        let from = peer.id.clone();
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            let response = transport::call(&addr, &envelope).await.ok();
            let _ = inbox
                .send(RaftMsg::VoteReply {
                    from,
                    term_at,
                    response,
                })
                .await;
        });
    }

    fn handle_vote_reply(&mut self, from: &str, term_at: Term, response: Option<PeerResponse>) {
        let Some(PeerResponse::Vote { term, granted }) = response else {
            return;
        };
        if self.observe_term(term) {
            return;
        }
        if self.role != Role::Candidate || term_at != self.storage.hard_state().term {
            return;
        }
        if granted {
            self.votes.insert(from.to_string());
            if self.votes.len() >= self.majority() {
                self.become_leader();
            }
        }
    }

    fn become_leader(&mut self) {
        let term = self.storage.hard_state().term;
        info!(term, "won election");
        self.role = Role::Leader;
        self.leader_hint = Some(self.config.node.id.clone());
        let last = self.storage.last_index();
        self.next_index.clear();
        self.match_index.clear();
        let peer_ids: Vec<String> = self.peers().map(|p| p.id.clone()).collect();
        for id in peer_ids {
            self.next_index.insert(id.clone(), last + 1);
            self.match_index.insert(id, 0);
        }
        // Commit a no-op so prior-term entries become committable.
        let entry = Entry {
            index: last + 1,
            term,
            payload: EntryPayload::Noop,
        };
        if let Err(err) = self.storage.append(&[entry]) {
            error!(?err, "failed to append leader noop");
            return;
        }
        if let Err(err) = self.try_advance_commit() {
            error!(?err, "apply failure after noop");
        }
        self.replicate_all();
    }

    // ─── Proposals ──────────────────────────────────────────────────────

    fn handle_propose(
        &mut self,
        payload: EntryPayload,
        reply: oneshot::Sender<ProposeOutcome>,
    ) -> Result<(), FsmError> {
        if self.role != Role::Leader {
            let _ = reply.send(self.not_leader());
            return Ok(());
        }
        let index = self.storage.last_index() + 1;
        let entry = Entry {
            index,
            term: self.storage.hard_state().term,
            payload: payload.clone(),
        };
        if let Err(err) = self.storage.append(&[entry]) {
            error!(?err, "failed to append proposal");
            let _ = reply.send(ProposeOutcome::LeadershipLost);
            return Ok(());
        }
        // Config changes take effect as soon as they are appended.
        if let EntryPayload::Config { nodes } = &payload {
            self.adopt_membership(nodes.clone());
        }
        self.pending.insert(index, reply);
        self.try_advance_commit()?;
        self.replicate_all();
        Ok(())
    }

    fn adopt_membership(&mut self, nodes: Vec<ClusterNode>) {
        let last = self.storage.last_index();
        for node in &nodes {
            if node.id != self.config.node.id {
                self.next_index.entry(node.id.clone()).or_insert(last + 1);
                self.match_index.entry(node.id.clone()).or_insert(0);
            }
        }
        let ids: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
        self.next_index.retain(|id, _| ids.contains(id.as_str()));
        self.match_index.retain(|id, _| ids.contains(id.as_str()));
        self.nodes = nodes;
    }

    // ─── Replication (leader) ───────────────────────────────────────────

    fn replicate_all(&mut self) {
        if self.role != Role::Leader {
            return;
        }
        let peers: Vec<ClusterNode> = self.peers().cloned().collect();
        for peer in peers {
            if !self.inflight.contains(&peer.id) {
                self.replicate_to(&peer);
            }
        }
    }

    fn replicate_to(&mut self, peer: &ClusterNode) {
        let next = *self
            .next_index
            .get(&peer.id)
            .unwrap_or(&(self.storage.last_index() + 1));

        if next < self.storage.first_index() {
            self.send_snapshot(peer);
            return;
        }

        let prev = next - 1;
        let Some(prev_term) = self.storage.term_of(prev) else {
            self.send_snapshot(peer);
            return;
        };
        let entries = self.storage.range(next, self.storage.last_index());
        let sent_count = entries.len() as u64;
        let request = PeerRequest::Append {
            term: self.storage.hard_state().term,
            leader_id: self.config.node.id.clone(),
            prev_log_index: prev,
            prev_log_term: prev_term,
            entries,
            leader_commit: self.commit_index,
        };
        let envelope = self.envelope(request);
        let addr = peer.raft_addr.clone();
        let from = peer.id.clone();
        let inbox = self.inbox_tx.clone();
        self.inflight.insert(peer.id.clone());
        tokio::spawn(async move {
            let response = transport::call(&addr, &envelope).await.ok();
            let _ = inbox
                .send(RaftMsg::AppendReply {
                    from,
                    sent_prev: prev,
                    sent_count,
                    response,
                })
                .await;
        });
    }

    fn send_snapshot(&mut self, peer: &ClusterNode) {
        let snapshot = match self.storage.snapshot() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                // No stored snapshot yet; cut one now so the laggard can
                // catch up.
                match self.take_snapshot() {
                    Ok(Some(snapshot)) => snapshot,
                    Ok(None) => return,
                    Err(err) => {
                        error!(?err, "failed to cut snapshot for follower");
                        return;
                    }
                }
            }
            Err(err) => {
                error!(?err, "failed to load snapshot for follower");
                return;
            }
        };
        let (meta, data) = snapshot;
        let snapshot_last = meta.last_index;
        let request = PeerRequest::InstallSnapshot {
            term: self.storage.hard_state().term,
            leader_id: self.config.node.id.clone(),
            meta,
            data: hex::encode(data),
        };
        let envelope = self.envelope(request);
        let addr = peer.raft_addr.clone();
        let from = peer.id.clone();
        let inbox = self.inbox_tx.clone();
        self.inflight.insert(peer.id.clone());
        info!(peer = %from, snapshot_last, "shipping snapshot to laggard");
        tokio::spawn(async move {
            let response = transport::call(&addr, &envelope).await.ok();
            let _ = inbox
                .send(RaftMsg::SnapshotReply {
                    from,
                    snapshot_last,
                    response,
                })
                .await;
        });
    }

    fn handle_append_reply(
        &mut self,
        from: &str,
        sent_prev: LogIndex,
        sent_count: u64,
        response: Option<PeerResponse>,
    ) -> Result<bool, FsmError> {
        self.inflight.remove(from);
        let Some(PeerResponse::Append {
            term,
            success,
            match_index,
        }) = response
        else {
            return Ok(false);
        };
        if self.observe_term(term) {
            return Ok(false);
        }
        if self.role != Role::Leader {
            return Ok(false);
        }
        if success {
            let new_match = sent_prev + sent_count;
            self.match_index.insert(from.to_string(), new_match);
            self.next_index.insert(from.to_string(), new_match + 1);
            self.try_advance_commit()?;
        } else {
            // Follower hinted how far its log reaches; fall back there.
            let hint = match_index.min(sent_prev.saturating_sub(1));
            self.next_index.insert(from.to_string(), hint + 1);
        }
        Ok(false)
    }

    fn try_advance_commit(&mut self) -> Result<(), FsmError> {
        if self.role != Role::Leader {
            return Ok(());
        }
        let term = self.storage.hard_state().term;
        let mut matches: Vec<LogIndex> = vec![self.storage.last_index()];
        for node in self.nodes.iter().filter(|n| !n.non_voter) {
            if node.id == self.config.node.id {
                continue;
            }
            matches.push(*self.match_index.get(&node.id).unwrap_or(&0));
        }
        matches.sort_unstable_by(|a, b| b.cmp(a));
        let majority = self.majority();
        if matches.len() < majority {
            return Ok(());
        }
        let candidate = matches[majority - 1];
        if candidate > self.commit_index && self.storage.term_of(candidate) == Some(term) {
            self.commit_index = candidate;
            self.apply_committed()?;
        }
        Ok(())
    }

    // ─── Apply ──────────────────────────────────────────────────────────

    fn apply_committed(&mut self) -> Result<(), FsmError> {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let Some(entry) = self.storage.entry(index).cloned() else {
                // Covered by a snapshot we restored; skip forward.
                self.last_applied = self.storage.snapshot_last_index().max(index);
                continue;
            };
            let outcome = match &entry.payload {
                EntryPayload::Noop => ApplyOutcome::Applied { revision: None },
                EntryPayload::Command { cmd } => {
                    let outcome = self.fsm.apply(index, cmd)?;
                    if let ApplyOutcome::Rejected { reason } = &outcome {
                        debug!(index, reason, "command rejected by fsm");
                    }
                    outcome
                }
                EntryPayload::Config { nodes } => {
                    self.fsm.apply_membership(index, nodes)?;
                    ApplyOutcome::Applied { revision: None }
                }
            };
            self.last_applied = index;
            if let Some(reply) = self.pending.remove(&index) {
                let _ = reply.send(ProposeOutcome::Applied { index, outcome });
            }
        }
        self.maybe_snapshot()
    }

    fn maybe_snapshot(&mut self) -> Result<(), FsmError> {
        let since = self
            .last_applied
            .saturating_sub(self.storage.snapshot_last_index());
        if since < self.config.snapshot_threshold {
            return Ok(());
        }
        self.take_snapshot().map(|_| ())
    }

    fn take_snapshot(&mut self) -> Result<Option<(SnapshotMeta, Vec<u8>)>, FsmError> {
        if self.last_applied == 0 {
            return Ok(None);
        }
        let Some(last_term) = self.storage.term_of(self.last_applied) else {
            return Ok(None);
        };
        let data = self.fsm.snapshot()?;
        let meta = SnapshotMeta {
            last_index: self.last_applied,
            last_term,
            nodes: self.nodes.clone(),
        };
        if let Err(err) = self
            .storage
            .save_snapshot(meta.clone(), &data, self.config.trailing_logs)
        {
            error!(?err, "failed to persist snapshot");
            return Ok(None);
        }
        info!(last_index = meta.last_index, "snapshot taken and log compacted");
        Ok(Some((meta, data)))
    }

    // ─── Inbound RPCs ───────────────────────────────────────────────────

    fn envelope(&self, request: PeerRequest) -> PeerEnvelope {
        PeerEnvelope {
            secret: self.config.shared_secret.clone(),
            from: self.config.node.id.clone(),
            pub_key: self.config.node.pub_key.clone(),
            request,
        }
    }

    /// Returns whether the election timer should reset.
    fn handle_rpc(&mut self, rpc: InboundRpc) -> Result<bool, FsmError> {
        let InboundRpc { envelope, reply } = rpc;
        // Pin the sender's public key against membership when we know them.
        if let Some(known) = self.nodes.iter().find(|n| n.id == envelope.from) {
            if known.pub_key != envelope.pub_key {
                warn!(from = %envelope.from, "peer public key mismatch");
                let _ = reply.send(PeerResponse::Rejected {
                    reason: "public key mismatch".into(),
                });
                return Ok(false);
            }
        }
        match envelope.request {
            PeerRequest::Vote {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => {
                let granted = self.handle_vote(term, &candidate_id, last_log_index, last_log_term);
                let _ = reply.send(PeerResponse::Vote {
                    term: self.storage.hard_state().term,
                    granted,
                });
                Ok(granted)
            }
            PeerRequest::Append {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => {
                let (success, match_index, reset) = self.handle_append(
                    term,
                    &leader_id,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit,
                )?;
                let _ = reply.send(PeerResponse::Append {
                    term: self.storage.hard_state().term,
                    success,
                    match_index,
                });
                Ok(reset)
            }
            PeerRequest::InstallSnapshot {
                term,
                leader_id,
                meta,
                data,
            } => {
                let reset = self.handle_install_snapshot(term, &leader_id, meta, &data)?;
                let _ = reply.send(PeerResponse::Snapshot {
                    term: self.storage.hard_state().term,
                });
                Ok(reset)
            }
        }
    }

    fn handle_vote(
        &mut self,
        term: Term,
        candidate_id: &str,
        last_log_index: LogIndex,
        last_log_term: Term,
    ) -> bool {
        if term < self.storage.hard_state().term {
            return false;
        }
        self.observe_term(term);
        if !self.nodes.is_empty() && !self.is_voter(candidate_id) {
            return false;
        }
        let hs = self.storage.hard_state().clone();
        let can_vote = hs.voted_for.is_none() || hs.voted_for.as_deref() == Some(candidate_id);
        let log_fresh = last_log_term > self.storage.last_term()
            || (last_log_term == self.storage.last_term()
                && last_log_index >= self.storage.last_index());
        if can_vote && log_fresh {
            if let Err(err) = self.storage.save_hard_state(HardState {
                term: hs.term,
                voted_for: Some(candidate_id.to_string()),
            }) {
                error!(?err, "failed to persist vote");
                return false;
            }
            debug!(term, candidate = candidate_id, "vote granted");
            return true;
        }
        false
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_append(
        &mut self,
        term: Term,
        leader_id: &str,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<Entry>,
        leader_commit: LogIndex,
    ) -> Result<(bool, LogIndex, bool), FsmError> {
        if term < self.storage.hard_state().term {
            return Ok((false, self.storage.last_index(), false));
        }
        self.observe_term(term);
        if self.role != Role::Follower {
            self.step_down();
        }
        self.leader_hint = Some(leader_id.to_string());

        // Consistency check on the entry preceding the batch.
        let prev_ok = prev_log_index == 0
            || prev_log_index <= self.storage.snapshot_last_index()
            || self.storage.term_of(prev_log_index) == Some(prev_log_term);
        if !prev_ok {
            return Ok((false, self.storage.last_index().min(prev_log_index), true));
        }

        if !entries.is_empty() {
            if let Err(err) = self.storage.append(&entries) {
                error!(?err, "failed to append replicated entries");
                return Err(FsmError::Storage(tally_store::StoreError::Io(
                    std::io::Error::other(err.to_string()),
                )));
            }
            // Adopt any membership change as soon as it is appended.
            for entry in &entries {
                if let EntryPayload::Config { nodes } = &entry.payload {
                    self.nodes = nodes.clone();
                }
            }
        }
        let match_index = prev_log_index + entries.len() as u64;
        if leader_commit > self.commit_index {
            self.commit_index = leader_commit.min(self.storage.last_index());
            self.apply_committed()?;
        }
        Ok((true, match_index, true))
    }

    fn handle_install_snapshot(
        &mut self,
        term: Term,
        leader_id: &str,
        meta: SnapshotMeta,
        data_hex: &str,
    ) -> Result<bool, FsmError> {
        if term < self.storage.hard_state().term {
            return Ok(false);
        }
        self.observe_term(term);
        if self.role != Role::Follower {
            self.step_down();
        }
        self.leader_hint = Some(leader_id.to_string());
        if meta.last_index <= self.last_applied {
            // Already past this snapshot.
            return Ok(true);
        }
        let Ok(data) = hex::decode(data_hex) else {
            warn!("discarding snapshot with undecodable payload");
            return Ok(true);
        };
        self.fsm.restore(&data)?;
        self.nodes = meta.nodes.clone();
        self.commit_index = meta.last_index;
        self.last_applied = meta.last_index;
        if let Err(err) = self
            .storage
            .save_snapshot(meta, &data, self.config.trailing_logs)
        {
            error!(?err, "failed to persist installed snapshot");
        }
        info!(last_applied = self.last_applied, "restored from leader snapshot");
        Ok(true)
    }
}
