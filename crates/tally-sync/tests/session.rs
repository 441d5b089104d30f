// SPDX-License-Identifier: Apache-2.0
//! Sync-session behavior tests, driven with in-memory transports, a scripted
//! HTTP fake, and paused tokio time so every timing assertion is
//! deterministic.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use tally_core::{
    Action, ActionBody, ActionId, CellRef, GameMeta, GameStartPayload, PitchKind, PitchPayload,
};
use tally_proto::{
    ClientFrame, ConflictNotice, PushRequest, PushResponse, ServerFrame,
};
use tally_sync::{
    spawn_session, ApiClient, ApiError, Backoff, ChannelError, Connect, ConflictChoice,
    PushOutcome, SessionConfig, SessionStatus, SyncEvents, SyncHandle, Transport,
};

// ─── Fakes ──────────────────────────────────────────────────────────────────

struct FakeTransport {
    incoming: mpsc::Receiver<ServerFrame>,
    outgoing: mpsc::UnboundedSender<ClientFrame>,
}

impl Transport for FakeTransport {
    async fn send(&mut self, frame: ClientFrame) -> Result<(), ChannelError> {
        self.outgoing.send(frame).map_err(|_| ChannelError::Closed)
    }

    async fn recv(&mut self) -> Result<ServerFrame, ChannelError> {
        self.incoming.recv().await.ok_or(ChannelError::Closed)
    }
}

struct FakeConnect {
    transports: Mutex<VecDeque<FakeTransport>>,
}

impl Connect for FakeConnect {
    type Transport = FakeTransport;

    async fn connect(&self) -> Result<FakeTransport, ChannelError> {
        self.transports
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(ChannelError::Closed)
    }
}

/// One scripted streaming channel; returns the handles the test drives.
fn one_channel() -> (
    FakeConnect,
    mpsc::Sender<ServerFrame>,
    mpsc::UnboundedReceiver<ClientFrame>,
) {
    let (frame_tx, frame_rx) = mpsc::channel(64);
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let connector = FakeConnect {
        transports: Mutex::new(VecDeque::from([FakeTransport {
            incoming: frame_rx,
            outgoing: out_tx,
        }])),
    };
    (connector, frame_tx, out_rx)
}

#[derive(Clone, Default)]
struct FakeApi {
    calls: Arc<Mutex<Vec<(String, PushRequest)>>>,
    script: Arc<Mutex<VecDeque<PushOutcome>>>,
}

impl FakeApi {
    fn scripted(outcomes: Vec<PushOutcome>) -> Self {
        Self {
            calls: Arc::default(),
            script: Arc::new(Mutex::new(outcomes.into())),
        }
    }

    fn batch_sizes(&self) -> Vec<usize> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, req)| req.actions.len())
            .collect()
    }
}

impl ApiClient for FakeApi {
    async fn push(&self, base: &str, request: &PushRequest) -> Result<PushOutcome, ApiError> {
        self.calls
            .lock()
            .unwrap()
            .push((base.to_string(), request.clone()));
        if let Some(outcome) = self.script.lock().unwrap().pop_front() {
            return Ok(outcome);
        }
        // Default: acknowledge at the batch tip.
        let revision = request
            .actions
            .last()
            .map(|a| a.id)
            .unwrap_or(ActionId([0u8; 32]));
        Ok(PushOutcome::Ack(PushResponse {
            revision,
            accepted: request.actions.len(),
        }))
    }

    async fn pull(
        &self,
        _base: &str,
        _game_id: &str,
        _since: Option<&str>,
    ) -> Result<tally_proto::PullResponse, ApiError> {
        Err(ApiError::Protocol("pull not scripted".into()))
    }
}

#[derive(Default)]
struct Recorder {
    statuses: Mutex<Vec<SessionStatus>>,
    remote: Mutex<Vec<Action>>,
    conflicts: Mutex<Vec<ConflictNotice>>,
}

impl SyncEvents for Recorder {
    fn on_remote_action(&self, action: Action) {
        self.remote.lock().unwrap().push(action);
    }

    fn on_conflict(&self, conflict: ConflictNotice) {
        self.conflicts.lock().unwrap().push(conflict);
    }

    fn on_status_change(&self, status: SessionStatus) {
        self.statuses.lock().unwrap().push(status);
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn config() -> SessionConfig {
    let mut config = SessionConfig::new("g1", "127.0.0.1:9");
    config.backoff = Backoff {
        base: Duration::from_millis(100),
        cap: Duration::from_secs(5),
    };
    config
}

fn pitch(ts: i64) -> Action {
    Action::new(
        ActionBody::Pitch(PitchPayload {
            cell: CellRef {
                team: 0,
                slot: (ts % 9) as u8,
                column: 1,
            },
            pitch: PitchKind::Ball,
        }),
        ts,
        None,
    )
}

fn foreign_action() -> Action {
    Action::new(
        ActionBody::GameStart(GameStartPayload {
            meta: GameMeta {
                title: "other".into(),
                date: "2026-04-01".into(),
                away: "A".into(),
                home: "H".into(),
                innings: 7,
            },
            lineups: vec![],
            pitchers: vec![],
        }),
        500,
        None,
    )
}

async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn queue_len(handle: &SyncHandle) -> usize {
    handle.inspect().await.unwrap().queued
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn hello_carries_the_last_known_revision() {
    let (connector, frames, mut sent) = one_channel();
    let api = FakeApi::default();
    let mut cfg = config();
    let known = ActionId([7u8; 32]);
    cfg.last_revision = Some(known);
    let handle = spawn_session(cfg, connector, api, Arc::new(Recorder::default()));

    let hello = sent.recv().await.unwrap();
    match hello {
        ClientFrame::Hello {
            game_id,
            last_revision,
        } => {
            assert_eq!(game_id, "g1");
            assert_eq!(last_revision, Some(known));
        }
        other => panic!("expected HELLO first, got {other:?}"),
    }
    drop(frames);
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn queue_is_not_drained_until_history_ack() {
    let (connector, frames, _sent) = one_channel();
    let api = FakeApi::default();
    let handle = spawn_session(
        config(),
        connector,
        api.clone(),
        Arc::new(Recorder::default()),
    );

    handle.send_action(pitch(1)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(
        api.calls.lock().unwrap().is_empty(),
        "no POST may fire while syncing history"
    );
    assert_eq!(queue_len(&handle).await, 1);

    frames.send(ServerFrame::Ack).await.unwrap();
    wait_for("queue to drain after ACK", || {
        api.calls.lock().unwrap().len() == 1
    })
    .await;
    assert_eq!(queue_len(&handle).await, 0);
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn batches_cap_at_one_hundred_actions() {
    let (connector, frames, _sent) = one_channel();
    let api = FakeApi::default();
    let handle = spawn_session(
        config(),
        connector,
        api.clone(),
        Arc::new(Recorder::default()),
    );

    for ts in 0..150 {
        handle.send_action(pitch(ts)).await.unwrap();
    }
    frames.send(ServerFrame::Ack).await.unwrap();

    wait_for("both batches to post", || {
        api.calls.lock().unwrap().len() == 2
    })
    .await;
    assert_eq!(api.batch_sizes(), vec![100, 50]);
    assert_eq!(queue_len(&handle).await, 0);
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn rate_limit_honors_retry_after() {
    let (connector, frames, _sent) = one_channel();
    let api = FakeApi::scripted(vec![PushOutcome::RateLimited {
        retry_after: Duration::from_secs(2),
    }]);
    let handle = spawn_session(
        config(),
        connector,
        api.clone(),
        Arc::new(Recorder::default()),
    );

    frames.send(ServerFrame::Ack).await.unwrap();
    let started = tokio::time::Instant::now();
    handle.send_action(pitch(1)).await.unwrap();

    wait_for("first (limited) POST", || {
        api.calls.lock().unwrap().len() == 1
    })
    .await;
    // The queue is preserved while waiting out the penalty.
    assert_eq!(queue_len(&handle).await, 1);

    wait_for("retry POST after the penalty", || {
        api.calls.lock().unwrap().len() == 2
    })
    .await;
    assert!(
        started.elapsed() >= Duration::from_secs(2),
        "retry fired before Retry-After elapsed"
    );
    assert_eq!(queue_len(&handle).await, 0);
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn echo_of_an_older_send_never_retreats_the_tip() {
    let (connector, frames, _sent) = one_channel();
    let api = FakeApi::default();
    let recorder = Arc::new(Recorder::default());
    let handle = spawn_session(config(), connector, api.clone(), Arc::clone(&recorder));
    frames.send(ServerFrame::Ack).await.unwrap();

    let a1 = pitch(1);
    let a2 = pitch(2);
    handle.send_action(a1.clone()).await.unwrap();
    handle.send_action(a2.clone()).await.unwrap();
    wait_for("sends to drain", || !api.calls.lock().unwrap().is_empty()).await;

    // Server echoes the older action.
    frames
        .send(ServerFrame::Action { action: a1.clone() })
        .await
        .unwrap();
    // Pending drops from 2 to 1 once the echo lands.
    for _ in 0..500 {
        if handle.inspect().await.unwrap().pending == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let view = handle.inspect().await.unwrap();
    assert_eq!(view.pending, 1);
    assert_eq!(view.last_revision, Some(a2.id), "tip must stay at a2");
    assert!(
        recorder.remote.lock().unwrap().is_empty(),
        "echoes are not remote actions"
    );

    // Echo the second one, then a genuinely foreign action.
    frames
        .send(ServerFrame::Action { action: a2.clone() })
        .await
        .unwrap();
    let foreign = foreign_action();
    frames
        .send(ServerFrame::Action {
            action: foreign.clone(),
        })
        .await
        .unwrap();
    wait_for("foreign action to arrive", || {
        !recorder.remote.lock().unwrap().is_empty()
    })
    .await;
    let view = handle.inspect().await.unwrap();
    assert_eq!(view.last_revision, Some(foreign.id));
    assert_eq!(view.pending, 0);
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn conflict_pauses_sends_until_resolved() {
    let (connector, frames, _sent) = one_channel();
    let notice = ConflictNotice {
        conflict_type: tally_core::ConflictKind::Fork,
        common_ancestor_id: ActionId([9u8; 32]),
        server_branch: vec![foreign_action()],
    };
    let api = FakeApi::scripted(vec![PushOutcome::Conflict(notice)]);
    let recorder = Arc::new(Recorder::default());
    let handle = spawn_session(config(), connector, api.clone(), Arc::clone(&recorder));
    frames.send(ServerFrame::Ack).await.unwrap();

    handle.send_action(pitch(1)).await.unwrap();
    wait_for("conflict to surface", || {
        !recorder.conflicts.lock().unwrap().is_empty()
    })
    .await;
    let view = handle.inspect().await.unwrap();
    assert_eq!(view.status, SessionStatus::ConflictPaused);
    assert_eq!(view.queued, 1, "conflicted batch stays queued");

    // Further sends must not POST while paused.
    handle.send_action(pitch(2)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(api.calls.lock().unwrap().len(), 1);

    handle.resolve(ConflictChoice::DiscardLocal).await.unwrap();
    let view = handle.inspect().await.unwrap();
    assert_eq!(view.status, SessionStatus::Ready);
    assert_eq!(view.queued, 0);
    assert_eq!(view.pending, 0);
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn diverged_conflict_reconciles_without_user_input() {
    let (connector, frames, _sent) = one_channel();
    let server_side = foreign_action();
    let notice = ConflictNotice {
        conflict_type: tally_core::ConflictKind::Diverged,
        common_ancestor_id: ActionId([9u8; 32]),
        server_branch: vec![server_side.clone()],
    };
    let api = FakeApi::scripted(vec![PushOutcome::Conflict(notice)]);
    let recorder = Arc::new(Recorder::default());
    let handle = spawn_session(config(), connector, api.clone(), Arc::clone(&recorder));
    frames.send(ServerFrame::Ack).await.unwrap();

    let local = pitch(1);
    handle.send_action(local.clone()).await.unwrap();
    wait_for("reissued batch to land", || {
        api.calls.lock().unwrap().len() == 2
    })
    .await;

    // No user decision was requested; the server branch was absorbed.
    assert!(recorder.conflicts.lock().unwrap().is_empty());
    assert_eq!(recorder.remote.lock().unwrap().len(), 1);

    // The resubmission carries a re-derived action chained on the server tip.
    let calls = api.calls.lock().unwrap();
    let reissued = &calls[1].1.actions[0];
    assert_ne!(reissued.id, local.id);
    assert_eq!(reissued.parent, Some(server_side.id));
    assert_eq!(reissued.body, local.body);
    drop(calls);

    let view = handle.inspect().await.unwrap();
    assert_eq!(view.status, SessionStatus::Ready);
    assert_eq!(view.queued, 0);
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn not_leader_redirects_once_to_the_hinted_leader() {
    let (connector, frames, _sent) = one_channel();
    let api = FakeApi::scripted(vec![PushOutcome::NotLeader(tally_proto::NotLeaderBody {
        leader_id: Some("n2".into()),
        leader_addr: Some("10.0.0.2:8080".into()),
    })]);
    let handle = spawn_session(
        config(),
        connector,
        api.clone(),
        Arc::new(Recorder::default()),
    );
    frames.send(ServerFrame::Ack).await.unwrap();
    handle.send_action(pitch(1)).await.unwrap();

    wait_for("redirected POST to land", || {
        api.calls.lock().unwrap().len() == 2
    })
    .await;
    let bases: Vec<String> = api
        .calls
        .lock()
        .unwrap()
        .iter()
        .map(|(base, _)| base.clone())
        .collect();
    assert_eq!(bases[0], "127.0.0.1:9");
    assert_eq!(bases[1], "10.0.0.2:8080");
    assert_eq!(queue_len(&handle).await, 0);
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn ping_is_answered_with_pong() {
    let (connector, frames, mut sent) = one_channel();
    let handle = spawn_session(
        config(),
        connector,
        FakeApi::default(),
        Arc::new(Recorder::default()),
    );
    // Discard the HELLO.
    let _ = sent.recv().await.unwrap();
    frames.send(ServerFrame::Ping).await.unwrap();
    let frame = sent.recv().await.unwrap();
    assert_eq!(frame, ClientFrame::Pong);
    handle.shutdown().await.unwrap();
}
