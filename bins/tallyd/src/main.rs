// SPDX-License-Identifier: Apache-2.0
//! Tally node daemon.
//!
//! Wires one node together: the filesystem store, the replicated state
//! machine and its Raft manager, the per-game session hubs, the streaming
//! session listener, and the HTTP API. The FSM publishes committed actions
//! onto a channel; a pump task fans them into the hubs — no component holds
//! a reference into another's internals.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tally_cluster::{Fsm, FsmEvent, GameDoc, RaftConfig, RaftHandle, SharedStore};
use tally_proto::{ClusterNode, JoinRequest};
use tally_store::{ensure_master_key, get_json, keys, FsStore, KVStore};

mod api;
mod hub;
mod ingest;
mod limit;
mod ports;
mod session;

use hub::Hub;
use limit::RateLimiter;
use ports::{AccessPolicy, AllowAll, IdentityProvider, OpenIdentity};

/// Everything the request paths share.
pub struct AppState {
    /// This node's identity and advertised addresses.
    pub node: ClusterNode,
    /// Shared cluster secret (admin endpoints, peer transport).
    pub secret: String,
    /// The Raft manager.
    pub raft: RaftHandle,
    /// The node's blob store.
    pub store: SharedStore,
    /// Per-game session hubs.
    pub hub: Hub,
    /// Ingest rate limiter.
    pub limiter: RateLimiter,
    /// Identity port.
    pub identity: Box<dyn IdentityProvider>,
    /// Access policy port.
    pub access: Box<dyn AccessPolicy>,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Tally node daemon")]
struct Args {
    /// Stable node id within the cluster.
    #[arg(long)]
    node_id: String,
    /// Data directory (store, raft state, optional master.key).
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,
    /// Raft peer transport listener.
    #[arg(long, default_value = "127.0.0.1:7401")]
    raft_addr: String,
    /// Streaming session listener.
    #[arg(long, default_value = "127.0.0.1:7402")]
    session_addr: String,
    /// HTTP API listener.
    #[arg(long, default_value = "127.0.0.1:7400")]
    http_addr: String,
    /// HTTP address advertised to peers (defaults to the bound address).
    #[arg(long)]
    advertise_http: Option<String>,
    /// Shared cluster secret.
    #[arg(long, env = "TALLY_CLUSTER_SECRET", default_value = "")]
    secret: String,
    /// This node's public key (hex); derived from the node id when omitted.
    #[arg(long)]
    pub_key: Option<String>,
    /// Bootstrap a fresh single-node cluster.
    #[arg(long)]
    bootstrap: bool,
    /// HTTP address of the leader to join on startup.
    #[arg(long)]
    join: Option<String>,
    /// Join as a non-voting learner.
    #[arg(long)]
    non_voter: bool,
    /// Raft log entries between snapshots.
    #[arg(long, default_value_t = 8192)]
    snapshot_threshold: u64,
    /// Entries retained behind a snapshot for slow followers.
    #[arg(long, default_value_t = 512)]
    trailing_logs: u64,
    /// Fast election/heartbeat timeouts (testing only).
    #[arg(long)]
    fast_timeouts: bool,
    /// Ingest tokens refilled per second, per subject.
    #[arg(long, default_value_t = 50.0)]
    ingest_rate: f64,
    /// Ingest burst capacity, per subject.
    #[arg(long, default_value_t = 200.0)]
    ingest_burst: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    // Fail-stop before touching anything: encrypted state must never be
    // opened without its key.
    ensure_master_key(&args.data_dir).context("master key check")?;

    let http_listener = TcpListener::bind(&args.http_addr)
        .await
        .with_context(|| format!("bind http {}", args.http_addr))?;
    let http_addr = http_listener.local_addr()?;
    let session_listener = TcpListener::bind(&args.session_addr)
        .await
        .with_context(|| format!("bind session {}", args.session_addr))?;
    let session_addr = session_listener.local_addr()?;

    let node = ClusterNode {
        id: args.node_id.clone(),
        raft_addr: args.raft_addr.clone(),
        session_addr: session_addr.to_string(),
        http_addr: args
            .advertise_http
            .clone()
            .unwrap_or_else(|| http_addr.to_string()),
        pub_key: args
            .pub_key
            .clone()
            .unwrap_or_else(|| derive_pub_key(&args.node_id)),
        non_voter: args.non_voter,
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    let store: SharedStore = Arc::new(RwLock::new(
        Box::new(FsStore::open(&args.data_dir).context("open store")?) as Box<dyn KVStore>,
    ));

    // Persist the effective node record once so operators can inspect what
    // this node advertises.
    {
        let mut guard = store.write().unwrap_or_else(|e| e.into_inner());
        if get_json::<ClusterNode>(guard.as_ref(), "node_config.json")
            .context("read node config")?
            .is_none()
        {
            tally_store::put_json(guard.as_mut(), "node_config.json", &node)
                .context("persist node config")?;
        }
    }

    let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel::<FsmEvent>();
    let fsm = Fsm::new(Arc::clone(&store), Some(events_tx)).context("build fsm")?;

    let mut raft_config = RaftConfig::new(node.clone(), &args.data_dir, args.secret.clone());
    raft_config.bootstrap = args.bootstrap;
    raft_config.snapshot_threshold = args.snapshot_threshold;
    raft_config.trailing_logs = args.trailing_logs;
    raft_config.use_production_timeouts = !args.fast_timeouts;
    let raft = tally_cluster::raft::start(raft_config, fsm)
        .await
        .context("start raft")?;
    info!(raft = %raft.raft_addr, http = %http_addr, session = %session_addr, "node up");

    let state = Arc::new(AppState {
        node: node.clone(),
        secret: args.secret.clone(),
        raft: raft.clone(),
        store: Arc::clone(&store),
        hub: Hub::new(),
        limiter: RateLimiter::new(args.ingest_rate, args.ingest_burst),
        identity: Box::new(OpenIdentity),
        access: Box::new(AllowAll),
    });

    let pump = tokio::spawn(pump_events(Arc::clone(&state), events_rx));
    let session_task = session::spawn(session_listener, Arc::clone(&state));
    let router = api::router(Arc::clone(&state));
    let http_task = tokio::spawn(async move {
        if let Err(err) = axum::serve(
            http_listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        {
            error!(?err, "http server failed");
        }
    });

    if let Some(leader) = &args.join {
        join_cluster(leader, &args.secret, &node, &raft).await?;
    }

    tokio::signal::ctrl_c().await.context("ctrl-c handler")?;
    info!("shutting down");
    if let Err(err) = raft.shutdown().await {
        warn!(?err, "raft shutdown");
    }
    http_task.abort();
    session_task.abort();
    pump.abort();
    Ok(())
}

/// Deterministic placeholder key for nodes that did not supply one.
fn derive_pub_key(node_id: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"tally:node-key:v1");
    hasher.update(node_id.as_bytes());
    hex::encode(hasher.finalize().as_bytes())
}

/// Fan committed FSM events into the per-game hubs.
async fn pump_events(
    state: Arc<AppState>,
    mut events: tokio::sync::mpsc::UnboundedReceiver<FsmEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            FsmEvent::ActionCommitted {
                game_id,
                action,
                revision,
            } => {
                state.hub.publish(&game_id, &action, revision);
            }
            FsmEvent::GameReplaced { game_id, revision } => {
                // Read outside the hub lock, then broadcast the whole log as
                // one catch-up batch; clients collapse duplicates by id.
                let actions = {
                    let guard = state.store.read().unwrap_or_else(|e| e.into_inner());
                    get_json::<GameDoc>(guard.as_ref(), &keys::game(&game_id))
                        .ok()
                        .flatten()
                        .map(|doc| doc.log.actions().to_vec())
                };
                if let Some(actions) = actions {
                    state.hub.publish_replaced(&game_id, actions, revision);
                }
            }
            FsmEvent::GameDeleted { game_id } => {
                state.hub.publish_deleted(&game_id);
            }
        }
    }
}

/// Ask the leader to admit this node, retrying while the cluster settles.
async fn join_cluster(
    leader_http: &str,
    secret: &str,
    node: &ClusterNode,
    raft: &RaftHandle,
) -> Result<()> {
    let request = JoinRequest {
        node_id: node.id.clone(),
        raft_addr: raft.raft_addr.to_string(),
        session_addr: node.session_addr.clone(),
        http_addr: node.http_addr.clone(),
        pub_key: node.pub_key.clone(),
        non_voter: node.non_voter,
        version: node.version.clone(),
    };
    let client = reqwest::Client::new();
    let url = format!("http://{leader_http}/api/cluster/join");
    for attempt in 1..=10u32 {
        let result = client
            .post(&url)
            .header(api::CLUSTER_SECRET_HEADER, secret)
            .json(&request)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                info!(leader = leader_http, "joined cluster");
                return Ok(());
            }
            Ok(response) => {
                warn!(status = %response.status(), attempt, "join refused; retrying");
            }
            Err(err) => {
                warn!(?err, attempt, "join attempt failed; retrying");
            }
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
    anyhow::bail!("could not join cluster via {leader_http}");
}
