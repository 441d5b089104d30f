// SPDX-License-Identifier: Apache-2.0
//! Peer transport: framed JSON RPC over TCP.
//!
//! Every request travels in one length-prefixed frame carrying the shared
//! cluster secret and the sender's identity; the receiver answers with one
//! response frame on the same connection. Outbound calls are short-lived
//! (connect, call, close) — at scoring traffic rates connection reuse buys
//! nothing and reconnect logic costs a lot.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};

use tally_proto::wire::{encode_frame, try_decode_frame};

use super::storage::{Entry, LogIndex, SnapshotMeta, Term};

/// How long one outbound RPC may take end to end.
const RPC_TIMEOUT: Duration = Duration::from_secs(2);

/// A peer RPC request.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerRequest {
    /// RequestVote.
    Vote {
        /// Candidate's term.
        term: Term,
        /// Candidate id.
        candidate_id: String,
        /// Index of the candidate's last log entry.
        last_log_index: LogIndex,
        /// Term of the candidate's last log entry.
        last_log_term: Term,
    },
    /// AppendEntries (empty `entries` is a heartbeat).
    Append {
        /// Leader's term.
        term: Term,
        /// Leader id.
        leader_id: String,
        /// Index immediately preceding the new entries.
        prev_log_index: LogIndex,
        /// Term of `prev_log_index`.
        prev_log_term: Term,
        /// Entries to append.
        entries: Vec<Entry>,
        /// Leader's commit index.
        leader_commit: LogIndex,
    },
    /// InstallSnapshot (whole snapshot in one frame).
    InstallSnapshot {
        /// Leader's term.
        term: Term,
        /// Leader id.
        leader_id: String,
        /// Snapshot metadata.
        meta: SnapshotMeta,
        /// FSM snapshot payload, hex-encoded.
        data: String,
    },
}

/// A peer RPC response.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerResponse {
    /// Answer to `Vote`.
    Vote {
        /// Responder's term.
        term: Term,
        /// Whether the vote was granted.
        granted: bool,
    },
    /// Answer to `Append`.
    Append {
        /// Responder's term.
        term: Term,
        /// Whether the prev check held and entries were appended.
        success: bool,
        /// Highest index known replicated on the responder.
        match_index: LogIndex,
    },
    /// Answer to `InstallSnapshot`.
    Snapshot {
        /// Responder's term.
        term: Term,
    },
    /// The request was refused before Raft saw it (bad secret, key
    /// mismatch).
    Rejected {
        /// Why.
        reason: String,
    },
}

/// The authenticated envelope around every request.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct PeerEnvelope {
    /// Shared cluster secret.
    pub secret: String,
    /// Sender's node id.
    pub from: String,
    /// Sender's public key (hex); pinned against membership when known.
    pub pub_key: String,
    /// The request.
    pub request: PeerRequest,
}

/// Transport failures for outbound calls.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not connect / read / write in time.
    #[error("peer rpc timed out")]
    Timeout,
    /// Socket failure.
    #[error("peer rpc io: {0}")]
    Io(#[from] std::io::Error),
    /// Framing/codec failure.
    #[error("peer rpc codec: {0}")]
    Frame(#[from] tally_proto::wire::FrameError),
    /// Connection closed before a response arrived.
    #[error("peer closed the connection mid-call")]
    Closed,
}

/// An inbound, authenticated request awaiting a Raft-layer answer.
pub struct InboundRpc {
    /// The validated envelope.
    pub envelope: PeerEnvelope,
    /// Where the Raft task sends the response.
    pub reply: oneshot::Sender<PeerResponse>,
}

/// Bind the peer listener and spawn the accept loop. Returns the actual
/// bound address (the config may say port 0).
///
/// # Errors
///
/// Bind failure.
pub async fn spawn_listener(
    addr: &str,
    secret: String,
    rpc_tx: mpsc::Sender<InboundRpc>,
) -> std::io::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    warn!(?err, "raft accept failed");
                    continue;
                }
            };
            let secret = secret.clone();
            let rpc_tx = rpc_tx.clone();
            tokio::spawn(async move {
                if let Err(err) = serve_conn(stream, &secret, &rpc_tx).await {
                    debug!(?err, %peer, "raft peer connection ended");
                }
            });
        }
    });
    Ok((local, handle))
}

/// Serve one inbound connection: a sequence of request/response frames.
async fn serve_conn(
    mut stream: TcpStream,
    secret: &str,
    rpc_tx: &mpsc::Sender<InboundRpc>,
) -> Result<(), TransportError> {
    let mut buf = vec![0u8; 16 * 1024];
    let mut acc: Vec<u8> = Vec::with_capacity(32 * 1024);
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        acc.extend_from_slice(&buf[..n]);
        while let Some(envelope) = try_decode_frame::<PeerEnvelope>(&mut acc)? {
            let response = if envelope.secret != secret {
                warn!(from = %envelope.from, "rejecting peer rpc with bad secret");
                PeerResponse::Rejected {
                    reason: "bad cluster secret".into(),
                }
            } else {
                let (reply_tx, reply_rx) = oneshot::channel();
                let inbound = InboundRpc {
                    envelope,
                    reply: reply_tx,
                };
                if rpc_tx.send(inbound).await.is_err() {
                    return Ok(()); // raft task gone; shutting down
                }
                match reply_rx.await {
                    Ok(response) => response,
                    Err(_) => PeerResponse::Rejected {
                        reason: "raft task dropped the request".into(),
                    },
                }
            };
            stream.write_all(&encode_frame(&response)?).await?;
        }
    }
}

/// One outbound call: connect, send the envelope, await one response frame.
///
/// # Errors
///
/// Timeouts, socket and codec failures.
pub async fn call(addr: &str, envelope: &PeerEnvelope) -> Result<PeerResponse, TransportError> {
    let fut = async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(&encode_frame(envelope)?).await?;
        let mut buf = vec![0u8; 16 * 1024];
        let mut acc: Vec<u8> = Vec::new();
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Err(TransportError::Closed);
            }
            acc.extend_from_slice(&buf[..n]);
            if let Some(response) = try_decode_frame::<PeerResponse>(&mut acc)? {
                return Ok(response);
            }
        }
    };
    match timeout(RPC_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout),
    }
}
