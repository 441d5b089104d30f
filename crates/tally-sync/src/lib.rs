// SPDX-License-Identifier: Apache-2.0
//! tally-sync: the client side of the per-game sync protocol.
//!
//! One logical [`SyncSession`] per game, running as a single task. It owns
//! the optimistic send pipeline (pending-echo set, FIFO queue, batched HTTP
//! drain with backoff and `Retry-After`), the streaming channel lifecycle
//! (HELLO → history sync → live feed, heartbeat watchdog, reconnect), and
//! conflict pausing. The application observes it purely through the
//! [`SyncEvents`] callbacks and drives it through the [`SyncHandle`] — the
//! session holds no reference into application state.
//!
//! ```text
//! DISCONNECTED ──connect()──▶ CONNECTING ──open──▶ SYNCING_HISTORY ──ACK──▶ READY
//!                                  ▲                                         │
//!                                  └─────────── conflict / close ────────────┘
//! ```

mod backoff;
mod http;
mod transport;

pub use backoff::Backoff;
pub use http::{ApiClient, ApiError, HttpApiClient, PushOutcome};
pub use transport::{ChannelError, Connect, TcpConnector, TcpTransport, Transport};

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use tally_core::{Action, ActionId, ActionLog, ConflictKind};
use tally_proto::{ClientFrame, ConflictNotice, PushRequest, ServerFrame, PUSH_BATCH_LIMIT};

/// Session lifecycle states.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SessionStatus {
    /// No channel; nothing in flight.
    Disconnected,
    /// Channel being opened.
    Connecting,
    /// HELLO sent; the server is streaming missed history.
    SyncingHistory,
    /// Live; the queue may drain.
    Ready,
    /// A conflict was surfaced; sends pause until a resolution is submitted.
    ConflictPaused,
}

/// Application callbacks. All default to no-ops so callers implement only
/// what they consume.
pub trait SyncEvents: Send + Sync + 'static {
    /// A committed action from another writer (or catch-up history).
    fn on_remote_action(&self, _action: Action) {}
    /// A conflict needs a user decision; the session is paused.
    fn on_conflict(&self, _conflict: ConflictNotice) {}
    /// A non-fatal error worth surfacing.
    fn on_error(&self, _error: String) {}
    /// The lifecycle state changed.
    fn on_status_change(&self, _status: SessionStatus) {}
}

/// The user's answer to a surfaced conflict.
#[derive(Debug, Clone)]
pub enum ConflictChoice {
    /// Replace the server history with the local log.
    OverwriteServer {
        /// The full local log.
        log: ActionLog,
    },
    /// Keep the server history; drop local work.
    DiscardLocal,
    /// Keep both: push the local history under a fresh game id.
    CloneAsNew {
        /// The new game id.
        game_id: String,
        /// The full local log.
        log: ActionLog,
    },
}

/// Snapshot of session internals, for tests and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    /// Lifecycle state.
    pub status: SessionStatus,
    /// Optimistic tip (includes unacknowledged local sends).
    pub last_revision: Option<ActionId>,
    /// Last server-confirmed revision.
    pub confirmed_revision: Option<ActionId>,
    /// Actions waiting in the HTTP queue.
    pub queued: usize,
    /// Local sends not yet echoed back.
    pub pending: usize,
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// The game this session follows.
    pub game_id: String,
    /// HTTP address (`host:port`) of any cluster node.
    pub http_addr: String,
    /// Newest revision already held locally, if any.
    pub last_revision: Option<ActionId>,
    /// Batch ceiling per POST.
    pub batch_limit: usize,
    /// Silence window after which the channel is declared dead (two missed
    /// keepalives).
    pub heartbeat_timeout: Duration,
    /// Retry backoff policy (connects and HTTP pushes).
    pub backoff: Backoff,
}

impl SessionConfig {
    /// Defaults for a game at `game_id` against `http_addr`.
    pub fn new(game_id: impl Into<String>, http_addr: impl Into<String>) -> Self {
        Self {
            game_id: game_id.into(),
            http_addr: http_addr.into(),
            last_revision: None,
            batch_limit: PUSH_BATCH_LIMIT,
            heartbeat_timeout: Duration::from_secs(60),
            backoff: Backoff::default(),
        }
    }
}

enum SyncMsg {
    Send(Action),
    Resolve(ConflictChoice),
    Inspect(oneshot::Sender<SessionView>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running session.
#[derive(Clone)]
pub struct SyncHandle {
    tx: mpsc::Sender<SyncMsg>,
}

/// The session task is gone.
#[derive(Debug, thiserror::Error)]
#[error("sync session is shut down")]
pub struct SessionGone;

impl SyncHandle {
    /// Queue one locally produced action (optimistic).
    ///
    /// # Errors
    ///
    /// [`SessionGone`] when the session task has exited.
    pub async fn send_action(&self, action: Action) -> Result<(), SessionGone> {
        self.tx
            .send(SyncMsg::Send(action))
            .await
            .map_err(|_| SessionGone)
    }

    /// Submit the user's conflict resolution and resume sending.
    ///
    /// # Errors
    ///
    /// [`SessionGone`] when the session task has exited.
    pub async fn resolve(&self, choice: ConflictChoice) -> Result<(), SessionGone> {
        self.tx
            .send(SyncMsg::Resolve(choice))
            .await
            .map_err(|_| SessionGone)
    }

    /// Inspect internals (tests, status displays).
    ///
    /// # Errors
    ///
    /// [`SessionGone`] when the session task has exited.
    pub async fn inspect(&self) -> Result<SessionView, SessionGone> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(SyncMsg::Inspect(tx))
            .await
            .map_err(|_| SessionGone)?;
        rx.await.map_err(|_| SessionGone)
    }

    /// Stop the session.
    ///
    /// # Errors
    ///
    /// [`SessionGone`] when it already stopped.
    pub async fn shutdown(&self) -> Result<(), SessionGone> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(SyncMsg::Shutdown(tx))
            .await
            .map_err(|_| SessionGone)?;
        rx.await.map_err(|_| SessionGone)
    }
}

/// Spawn a session over the given transports.
pub fn spawn_session<C, A, E>(
    config: SessionConfig,
    connector: C,
    api: A,
    events: Arc<E>,
) -> SyncHandle
where
    C: Connect,
    A: ApiClient,
    E: SyncEvents,
{
    let (tx, rx) = mpsc::channel(128);
    let session = SyncSession {
        last_revision: config.last_revision,
        config,
        connector,
        api,
        events,
        status: SessionStatus::Disconnected,
        confirmed_revision: None,
        pending: HashSet::new(),
        queue: VecDeque::new(),
        http_retry: 0,
        connect_retry: 0,
        next_drain: None,
        leader_override: None,
        rng: SmallRng::from_os_rng(),
    };
    tokio::spawn(session.run(rx));
    SyncHandle { tx }
}

struct SyncSession<C: Connect, A: ApiClient, E: SyncEvents> {
    config: SessionConfig,
    connector: C,
    api: A,
    events: Arc<E>,
    status: SessionStatus,
    /// Optimistic tip: advances on local sends, never retreats on echoes.
    last_revision: Option<ActionId>,
    /// Last revision the server has confirmed to us.
    confirmed_revision: Option<ActionId>,
    pending: HashSet<ActionId>,
    queue: VecDeque<Action>,
    http_retry: u32,
    connect_retry: u32,
    next_drain: Option<Instant>,
    leader_override: Option<String>,
    rng: SmallRng,
}

impl<C: Connect, A: ApiClient, E: SyncEvents> SyncSession<C, A, E> {
    async fn run(mut self, mut inbox: mpsc::Receiver<SyncMsg>) {
        'reconnect: loop {
            self.set_status(SessionStatus::Connecting);
            let mut channel = loop {
                match self.connector.connect().await {
                    Ok(channel) => break channel,
                    Err(err) => {
                        debug!(?err, "channel connect failed");
                        self.set_status(SessionStatus::Disconnected);
                        let delay = self.config.backoff.delay(self.connect_retry, &mut self.rng);
                        self.connect_retry = self.connect_retry.saturating_add(1);
                        tokio::select! {
                            () = tokio::time::sleep(delay) => {}
                            msg = inbox.recv() => {
                                let Some(msg) = msg else { return };
                                if !self.handle_msg(msg).await {
                                    return;
                                }
                            }
                        }
                        self.set_status(SessionStatus::Connecting);
                        continue;
                    }
                }
            };
            self.connect_retry = 0;

            let hello = ClientFrame::Hello {
                game_id: self.config.game_id.clone(),
                last_revision: self.last_revision,
            };
            if channel.send(hello).await.is_err() {
                self.set_status(SessionStatus::Disconnected);
                continue 'reconnect;
            }
            self.set_status(SessionStatus::SyncingHistory);
            let mut last_activity = Instant::now();

            loop {
                let drain_at = self
                    .next_drain
                    .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
                let watchdog_at = last_activity + self.config.heartbeat_timeout;
                tokio::select! {
                    msg = inbox.recv() => {
                        let Some(msg) = msg else { return };
                        if !self.handle_msg(msg).await {
                            return;
                        }
                    }
                    frame = channel.recv() => {
                        match frame {
                            Ok(frame) => {
                                last_activity = Instant::now();
                                if self.handle_frame(&mut channel, frame).await.is_err() {
                                    self.set_status(SessionStatus::Disconnected);
                                    continue 'reconnect;
                                }
                            }
                            Err(err) => {
                                debug!(?err, "channel lost");
                                self.set_status(SessionStatus::Disconnected);
                                continue 'reconnect;
                            }
                        }
                    }
                    () = tokio::time::sleep_until(drain_at) => {
                        self.next_drain = None;
                        self.drain_queue().await;
                    }
                    () = tokio::time::sleep_until(watchdog_at) => {
                        self.events.on_error("keepalive lost; reconnecting".into());
                        self.set_status(SessionStatus::Disconnected);
                        continue 'reconnect;
                    }
                }
            }
        }
    }

    fn set_status(&mut self, status: SessionStatus) {
        if self.status != status {
            self.status = status;
            self.events.on_status_change(status);
        }
    }

    /// Returns false when the session should stop.
    async fn handle_msg(&mut self, msg: SyncMsg) -> bool {
        match msg {
            SyncMsg::Send(action) => {
                self.pending.insert(action.id);
                // Optimistic tip advance; echoes never move it back.
                self.last_revision = Some(action.id);
                self.queue.push_back(action);
                if self.status == SessionStatus::Ready {
                    self.next_drain = Some(Instant::now());
                }
                true
            }
            SyncMsg::Resolve(choice) => {
                self.handle_resolution(choice).await;
                true
            }
            SyncMsg::Inspect(reply) => {
                let _ = reply.send(SessionView {
                    status: self.status,
                    last_revision: self.last_revision,
                    confirmed_revision: self.confirmed_revision,
                    queued: self.queue.len(),
                    pending: self.pending.len(),
                });
                true
            }
            SyncMsg::Shutdown(reply) => {
                let _ = reply.send(());
                false
            }
        }
    }

    async fn handle_frame(
        &mut self,
        channel: &mut C::Transport,
        frame: ServerFrame,
    ) -> Result<(), ()> {
        match frame {
            ServerFrame::Ack => {
                if self.status == SessionStatus::SyncingHistory {
                    self.set_status(SessionStatus::Ready);
                    self.http_retry = 0;
                    self.next_drain = Some(Instant::now());
                }
            }
            ServerFrame::Action { action } => self.absorb_remote(action),
            ServerFrame::SyncUpdate { actions } => {
                for action in actions {
                    self.absorb_remote(action);
                }
            }
            ServerFrame::Conflict(notice) => self.handle_conflict(notice),
            ServerFrame::Error { error } => self.events.on_error(error),
            ServerFrame::Ping => {
                if channel.send(ClientFrame::Pong).await.is_err() {
                    return Err(());
                }
            }
        }
        Ok(())
    }

    fn absorb_remote(&mut self, action: Action) {
        self.confirmed_revision = Some(action.id);
        if self.pending.remove(&action.id) {
            // Echo of our own optimistic send: the pending set has kept the
            // tip ahead; nothing to deliver, nothing to move.
            return;
        }
        if self.pending.is_empty() {
            self.last_revision = Some(action.id);
        }
        self.events.on_remote_action(action);
    }

    /// Drain the queue in batches. At most one drain runs at a time by
    /// construction (single task, invoked from the timer arm only).
    async fn drain_queue(&mut self) {
        loop {
            if self.status != SessionStatus::Ready || self.queue.is_empty() {
                return;
            }
            let batch: Vec<Action> = self
                .queue
                .iter()
                .take(self.config.batch_limit)
                .cloned()
                .collect();
            let request = PushRequest {
                game_id: self.config.game_id.clone(),
                actions: batch.clone(),
                base_revision: self.confirmed_revision,
                overwrite: false,
            };
            match self.push_with_redirect(&request).await {
                Ok(PushOutcome::Ack(response)) => {
                    for _ in 0..batch.len() {
                        self.queue.pop_front();
                    }
                    self.http_retry = 0;
                    self.confirmed_revision = Some(response.revision);
                    // Keep going while the queue is non-empty.
                }
                Ok(PushOutcome::RateLimited { retry_after }) => {
                    debug!(?retry_after, "push rate limited");
                    self.next_drain = Some(Instant::now() + retry_after);
                    return;
                }
                Ok(PushOutcome::Conflict(notice)) => {
                    self.handle_conflict(notice);
                    return;
                }
                Ok(PushOutcome::NotLeader(_)) => {
                    // Redirect already attempted; no leader known right now.
                    self.schedule_http_retry();
                    return;
                }
                Err(err) => {
                    warn!(%err, "push failed");
                    self.events.on_error(err.to_string());
                    self.schedule_http_retry();
                    return;
                }
            }
        }
    }

    fn schedule_http_retry(&mut self) {
        let delay = self.config.backoff.delay(self.http_retry, &mut self.rng);
        self.http_retry = self.http_retry.saturating_add(1);
        self.next_drain = Some(Instant::now() + delay);
    }

    async fn push_with_redirect(
        &mut self,
        request: &PushRequest,
    ) -> Result<PushOutcome, ApiError> {
        let base = self
            .leader_override
            .clone()
            .unwrap_or_else(|| self.config.http_addr.clone());
        match self.api.push(&base, request).await? {
            PushOutcome::NotLeader(hint) => match hint.leader_addr.clone() {
                Some(addr) => {
                    debug!(leader = %addr, "redirecting push to leader");
                    self.leader_override = Some(addr.clone());
                    self.api.push(&addr, request).await
                }
                None => {
                    self.leader_override = None;
                    Ok(PushOutcome::NotLeader(hint))
                }
            },
            other => Ok(other),
        }
    }

    /// FORK pauses for a user decision; DIVERGED auto-reconciles — the
    /// server's ordering wins, and the local queue is re-derived on top of
    /// the server tip (fresh ids, re-chained parents) and resubmitted.
    fn handle_conflict(&mut self, notice: ConflictNotice) {
        if notice.conflict_type == ConflictKind::Diverged {
            for action in notice.server_branch {
                self.absorb_remote(action);
            }
            let mut tip = self.confirmed_revision;
            let stale: Vec<Action> = self.queue.drain(..).collect();
            self.pending.clear();
            for action in stale {
                let fresh = action.reissue(tip);
                tip = Some(fresh.id);
                self.pending.insert(fresh.id);
                self.queue.push_back(fresh);
            }
            if let Some(tip) = tip {
                self.last_revision = Some(tip);
            }
            if self.status == SessionStatus::ConflictPaused {
                self.set_status(SessionStatus::Ready);
            }
            self.next_drain = Some(Instant::now());
        } else {
            self.set_status(SessionStatus::ConflictPaused);
            self.events.on_conflict(notice);
        }
    }

    async fn handle_resolution(&mut self, choice: ConflictChoice) {
        match choice {
            ConflictChoice::DiscardLocal => {
                self.queue.clear();
                self.pending.clear();
                self.last_revision = self.confirmed_revision;
                self.set_status(SessionStatus::Ready);
            }
            ConflictChoice::OverwriteServer { log } => {
                self.queue.clear();
                self.pending.clear();
                let request = PushRequest {
                    game_id: self.config.game_id.clone(),
                    actions: log.actions().to_vec(),
                    base_revision: None,
                    overwrite: true,
                };
                match self.push_with_redirect(&request).await {
                    Ok(PushOutcome::Ack(response)) => {
                        self.confirmed_revision = Some(response.revision);
                        self.last_revision = Some(response.revision);
                        self.set_status(SessionStatus::Ready);
                    }
                    Ok(PushOutcome::Conflict(notice)) => {
                        self.events.on_conflict(notice);
                    }
                    Ok(PushOutcome::RateLimited { retry_after }) => {
                        self.events
                            .on_error("overwrite rate limited; retry shortly".into());
                        self.next_drain = Some(Instant::now() + retry_after);
                    }
                    Ok(PushOutcome::NotLeader(_)) => {
                        self.events.on_error("no leader for overwrite".into());
                    }
                    Err(err) => self.events.on_error(err.to_string()),
                }
            }
            ConflictChoice::CloneAsNew { game_id, log } => {
                self.queue.clear();
                self.pending.clear();
                let request = PushRequest {
                    game_id,
                    actions: log.actions().to_vec(),
                    base_revision: None,
                    overwrite: true,
                };
                match self.push_with_redirect(&request).await {
                    Ok(PushOutcome::Ack(_)) => {
                        self.last_revision = self.confirmed_revision;
                        self.set_status(SessionStatus::Ready);
                    }
                    Ok(_) => self
                        .events
                        .on_error("clone rejected; still paused".into()),
                    Err(err) => self.events.on_error(err.to_string()),
                }
            }
        }
    }
}
