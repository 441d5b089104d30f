// SPDX-License-Identifier: Apache-2.0
//! The streaming session listener.
//!
//! Clients connect over TCP and speak length-prefixed JSON frames: a HELLO
//! naming the game and their last revision, then optimistic ACTIONs; the
//! server streams missed history, an ACK, then live broadcasts, and probes
//! liveness with PINGs. Two missed PONGs cut the connection — the client
//! reconnects and catches up from its revision.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use tally_cluster::{Command, GameDoc};
use tally_proto::wire::{encode_frame, try_decode_frame};
use tally_proto::{ClientFrame, ServerFrame};
use tally_store::{get_json, keys};

use crate::hub::SubscriberId;
use crate::ingest::{ingest, Ingest};
use crate::limit::Decision;
use crate::AppState;

/// How often the server probes an idle session.
const PING_INTERVAL: Duration = Duration::from_secs(20);

/// Spawn the accept loop on an already-bound listener.
pub fn spawn(listener: TcpListener, state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    if let Ok(local) = listener.local_addr() {
        info!(%local, "session listener up");
    }
    tokio::spawn(async move {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    warn!(?err, "session accept failed");
                    continue;
                }
            };
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                if let Err(err) = serve_session(state, stream, peer).await {
                    debug!(?err, %peer, "session ended");
                }
            });
        }
    })
}

struct Subscription {
    game_id: String,
    id: SubscriberId,
}

async fn serve_session(
    state: Arc<AppState>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<ServerFrame>(256);

    // Writer task: everything outbound funnels through one channel so the
    // hub can fan out without holding the socket.
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let Ok(bytes) = encode_frame(&frame) else {
                break;
            };
            if writer.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let mut subscription: Option<Subscription> = None;
    let mut buf = vec![0u8; 16 * 1024];
    let mut acc: Vec<u8> = Vec::with_capacity(32 * 1024);
    let mut last_pong = Instant::now();
    let mut ping_at = Instant::now() + PING_INTERVAL;

    let result: Result<()> = 'conn: loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) => break 'conn Ok(()),
                    Ok(n) => n,
                    Err(err) => break 'conn Err(err.into()),
                };
                acc.extend_from_slice(&buf[..n]);
                loop {
                    let frame = match try_decode_frame::<ClientFrame>(&mut acc) {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break,
                        Err(err) => {
                            // A peer that cannot frame correctly gets cut;
                            // nothing downstream of a bad frame is trustworthy.
                            warn!(?err, %peer, "undecodable client frame; closing");
                            let _ = tx.send(ServerFrame::Error {
                                error: "undecodable frame".into(),
                            }).await;
                            break 'conn Ok(());
                        }
                    };
                    match frame {
                        ClientFrame::Hello { game_id, last_revision } => {
                            handle_hello(
                                &state,
                                &tx,
                                &mut subscription,
                                peer,
                                game_id,
                                last_revision,
                            )
                            .await;
                        }
                        ClientFrame::Action { action, base_revision } => {
                            let Some(sub) = &subscription else {
                                let _ = tx.send(ServerFrame::Error {
                                    error: "HELLO required before ACTION".into(),
                                }).await;
                                continue;
                            };
                            let subject = peer.ip().to_string();
                            if let Decision::Limited { retry_after_secs } =
                                state.limiter.check(&subject, "action", 1)
                            {
                                let _ = tx.send(ServerFrame::Error {
                                    error: format!(
                                        "rate limited; retry in {retry_after_secs}s"
                                    ),
                                }).await;
                                continue;
                            }
                            let outcome = ingest(
                                &state,
                                &sub.game_id,
                                std::slice::from_ref(&action),
                                base_revision,
                                false,
                            )
                            .await;
                            match outcome {
                                // The commit echoes back through the hub.
                                Ingest::Ack { revision, .. } => {
                                    state.hub.note_ack(&sub.game_id, sub.id, revision);
                                }
                                Ingest::Conflict(notice) => {
                                    let _ = tx.send(ServerFrame::Conflict(notice)).await;
                                }
                                Ingest::NotLeader(hint) => {
                                    let _ = tx.send(ServerFrame::Error {
                                        error: match hint.leader_addr {
                                            Some(addr) => {
                                                format!("not the leader; push to {addr}")
                                            }
                                            None => "no leader elected".into(),
                                        },
                                    }).await;
                                }
                                Ingest::Rejected(reason) => {
                                    let _ = tx.send(ServerFrame::Error { error: reason }).await;
                                }
                            }
                        }
                        ClientFrame::Pong => {
                            last_pong = Instant::now();
                        }
                    }
                }
            }
            () = tokio::time::sleep_until(ping_at) => {
                if last_pong.elapsed() >= PING_INTERVAL * 2 {
                    debug!(%peer, "two keepalives missed; closing session");
                    break Ok(());
                }
                if tx.send(ServerFrame::Ping).await.is_err() {
                    break Ok(());
                }
                ping_at = Instant::now() + PING_INTERVAL;
            }
        }
    };

    if let Some(sub) = subscription {
        state.hub.unsubscribe(&sub.game_id, sub.id);
    }
    writer_task.abort();
    result
}

async fn handle_hello(
    state: &Arc<AppState>,
    tx: &mpsc::Sender<ServerFrame>,
    subscription: &mut Option<Subscription>,
    peer: SocketAddr,
    game_id: String,
    last_revision: Option<tally_core::ActionId>,
) {
    // A second HELLO moves the session to another game.
    if let Some(previous) = subscription.take() {
        state.hub.unsubscribe(&previous.game_id, previous.id);
    }

    // Register first, then stream catch-up read outside the hub lock; a
    // commit landing in between is delivered twice and collapses by id on
    // the client.
    let id = state.hub.subscribe(&game_id, last_revision, tx.clone());
    *subscription = Some(Subscription {
        game_id: game_id.clone(),
        id,
    });

    let doc: Option<GameDoc> = {
        let guard = state.store.read().unwrap_or_else(|e| e.into_inner());
        get_json(guard.as_ref(), &keys::game(&game_id)).ok().flatten()
    };
    if let Some(doc) = doc {
        let missed = doc.log.since(last_revision.as_ref());
        if !missed.is_empty() {
            let _ = tx
                .send(ServerFrame::SyncUpdate {
                    actions: missed.to_vec(),
                })
                .await;
        }
        // Record what this subscriber has acknowledged holding; replicated
        // so the registry survives failover.
        if let Some(revision) = last_revision {
            let raft = state.raft.clone();
            let session_id = peer.to_string();
            tokio::spawn(async move {
                let _ = raft
                    .propose(Command::SubscribeAck {
                        game_id,
                        session_id,
                        revision,
                    })
                    .await;
            });
        }
    }
    let _ = tx.send(ServerFrame::Ack).await;
}
