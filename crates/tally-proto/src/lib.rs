// SPDX-License-Identifier: Apache-2.0
//! Wire schema for the tally sync protocol.
//!
//! Everything on the wire is a JSON envelope with an UPPERCASE `type` tag.
//! The streaming channel carries [`ClientFrame`] / [`ServerFrame`] values in
//! length-prefixed frames (see [`wire`]); the HTTP fallback carries the
//! request/response bodies defined here as plain JSON.

use serde::{Deserialize, Serialize};

use tally_core::{Action, ActionId, Conflict, ConflictKind};

pub mod wire;

/// Frames a client sends on the streaming channel.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    /// Opening frame: which game, and the newest revision the client holds.
    #[serde(rename = "HELLO")]
    Hello {
        /// Target game id.
        #[serde(rename = "gameId")]
        game_id: String,
        /// Newest revision known locally; absent on a cold start.
        #[serde(
            rename = "lastRevision",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        last_revision: Option<ActionId>,
    },
    /// One optimistic action submission.
    #[serde(rename = "ACTION")]
    Action {
        /// The action being submitted.
        action: Action,
        /// The revision the client believed was tip when it produced the
        /// action; causality is validated against it.
        #[serde(
            rename = "baseRevision",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        base_revision: Option<ActionId>,
    },
    /// Reply to a server `PING`.
    #[serde(rename = "PONG")]
    Pong,
}

impl ClientFrame {
    /// Canonical tag string for this frame.
    pub fn tag(&self) -> &'static str {
        match self {
            ClientFrame::Hello { .. } => "HELLO",
            ClientFrame::Action { .. } => "ACTION",
            ClientFrame::Pong => "PONG",
        }
    }
}

/// Frames a server sends on the streaming channel.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// History sync is complete; the client may drain its queue.
    #[serde(rename = "ACK")]
    Ack,
    /// Live broadcast of one committed action.
    #[serde(rename = "ACTION")]
    Action {
        /// The committed action.
        action: Action,
    },
    /// Catch-up batch, oldest first.
    #[serde(rename = "SYNC_UPDATE")]
    SyncUpdate {
        /// The missing actions.
        actions: Vec<Action>,
    },
    /// The submission conflicts with the server history.
    #[serde(rename = "CONFLICT")]
    Conflict(ConflictNotice),
    /// Non-fatal processing error; the channel stays open.
    #[serde(rename = "ERROR")]
    Error {
        /// Human-readable description.
        error: String,
    },
    /// Keepalive probe; clients answer `PONG`.
    #[serde(rename = "PING")]
    Ping,
}

impl ServerFrame {
    /// Canonical tag string for this frame.
    pub fn tag(&self) -> &'static str {
        match self {
            ServerFrame::Ack => "ACK",
            ServerFrame::Action { .. } => "ACTION",
            ServerFrame::SyncUpdate { .. } => "SYNC_UPDATE",
            ServerFrame::Conflict(_) => "CONFLICT",
            ServerFrame::Error { .. } => "ERROR",
            ServerFrame::Ping => "PING",
        }
    }
}

/// The conflict payload surfaced to clients. Only the server branch travels;
/// the client already holds its own.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct ConflictNotice {
    /// FORK or DIVERGED.
    #[serde(rename = "conflictType")]
    pub conflict_type: ConflictKind,
    /// Newest action both histories share.
    #[serde(rename = "commonAncestorId")]
    pub common_ancestor_id: ActionId,
    /// Server-side actions ahead of the ancestor, oldest first.
    #[serde(rename = "serverBranch")]
    pub server_branch: Vec<Action>,
}

impl From<Conflict> for ConflictNotice {
    fn from(conflict: Conflict) -> Self {
        ConflictNotice {
            conflict_type: conflict.kind,
            common_ancestor_id: conflict.common_ancestor,
            server_branch: conflict.remote_branch,
        }
    }
}

/// Body of `POST /api/sync/push`: a batch of up to 100 actions.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct PushRequest {
    /// Target game id.
    #[serde(rename = "gameId")]
    pub game_id: String,
    /// Actions, oldest first.
    pub actions: Vec<Action>,
    /// The client's base revision for the first action in the batch.
    #[serde(
        rename = "baseRevision",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub base_revision: Option<ActionId>,
    /// Conflict resolution: replace the server log with the client's
    /// history instead of appending. Requires the full log in `actions`.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub overwrite: bool,
}

/// Maximum actions per push batch; larger queues drain across batches.
pub const PUSH_BATCH_LIMIT: usize = 100;

/// `200` body for a successful push.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct PushResponse {
    /// Server tip after the batch.
    pub revision: ActionId,
    /// How many of the submitted actions were new (duplicates collapse).
    pub accepted: usize,
}

/// Response body for `GET /api/sync/pull?gameId=…&since=…`.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct PullResponse {
    /// The game id echoed back.
    #[serde(rename = "gameId")]
    pub game_id: String,
    /// Actions after `since`, oldest first.
    pub actions: Vec<Action>,
    /// Server tip revision.
    pub revision: ActionId,
}

/// `503` body when the node is not the Raft leader.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct NotLeaderBody {
    /// The leader's id, when known.
    #[serde(rename = "leaderId", default, skip_serializing_if = "Option::is_none")]
    pub leader_id: Option<String>,
    /// The leader's HTTP address, when known.
    #[serde(
        rename = "leaderAddr",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub leader_addr: Option<String>,
}

/// Generic error body (`4xx`/`5xx` where no richer body applies).
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable description.
    pub error: String,
}

/// One member of the cluster, as carried in admin responses and in the
/// replicated `nodes.json` blob.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ClusterNode {
    /// Stable node id.
    pub id: String,
    /// Raft transport address.
    #[serde(rename = "raftAddr")]
    pub raft_addr: String,
    /// Streaming session address.
    #[serde(rename = "sessionAddr")]
    pub session_addr: String,
    /// HTTP API address.
    #[serde(rename = "httpAddr")]
    pub http_addr: String,
    /// Node public key (hex), used to authenticate peer transport.
    #[serde(rename = "pubKey")]
    pub pub_key: String,
    /// True for learners that never vote.
    #[serde(rename = "nonVoter", default)]
    pub non_voter: bool,
    /// Software version advertised at join time.
    #[serde(default)]
    pub version: String,
}

/// Body of `POST /api/cluster/join` (leader-only, shared-secret guarded).
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Joining node's id.
    #[serde(rename = "nodeId")]
    pub node_id: String,
    /// Joining node's Raft transport address.
    #[serde(rename = "raftAddr")]
    pub raft_addr: String,
    /// Joining node's streaming session address.
    #[serde(rename = "sessionAddr")]
    pub session_addr: String,
    /// Joining node's HTTP address.
    #[serde(rename = "httpAddr")]
    pub http_addr: String,
    /// Joining node's public key (hex).
    #[serde(rename = "pubKey")]
    pub pub_key: String,
    /// Join as a non-voting learner.
    #[serde(rename = "nonVoter", default)]
    pub non_voter: bool,
    /// Joining node's software version.
    #[serde(default)]
    pub version: String,
}

/// Body of `POST /api/cluster/remove`.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct RemoveRequest {
    /// The node to remove.
    #[serde(rename = "nodeId")]
    pub node_id: String,
}

/// Response body for `GET /api/cluster/status`.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    /// The responding node's id.
    #[serde(rename = "nodeId")]
    pub node_id: String,
    /// The responding node's Raft role (`"leader"`, `"follower"`, …).
    pub state: String,
    /// Current leader id, when known.
    #[serde(rename = "leaderId", default, skip_serializing_if = "Option::is_none")]
    pub leader_id: Option<String>,
    /// Current leader HTTP address, when known.
    #[serde(
        rename = "leaderAddr",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub leader_addr: Option<String>,
    /// Known members.
    pub nodes: Vec<ClusterNode>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{ActionBody, UndoPayload};

    fn any_action() -> Action {
        Action::new(
            ActionBody::Undo(UndoPayload {
                ref_id: ActionId([3u8; 32]),
            }),
            7,
            None,
        )
    }

    #[test]
    fn frames_carry_uppercase_type_tags() {
        let hello = ClientFrame::Hello {
            game_id: "g1".into(),
            last_revision: None,
        };
        let v = serde_json::to_value(&hello).unwrap();
        assert_eq!(v["type"], "HELLO");
        assert_eq!(v["gameId"], "g1");
        assert!(v.get("lastRevision").is_none());

        let ack = serde_json::to_value(ServerFrame::Ack).unwrap();
        assert_eq!(ack, serde_json::json!({"type": "ACK"}));
    }

    #[test]
    fn frames_round_trip() {
        let frames = vec![
            ServerFrame::Ack,
            ServerFrame::Action {
                action: any_action(),
            },
            ServerFrame::SyncUpdate {
                actions: vec![any_action()],
            },
            ServerFrame::Conflict(ConflictNotice {
                conflict_type: ConflictKind::Fork,
                common_ancestor_id: ActionId([1u8; 32]),
                server_branch: vec![any_action()],
            }),
            ServerFrame::Error {
                error: "nope".into(),
            },
            ServerFrame::Ping,
        ];
        for frame in frames {
            let json = serde_json::to_string(&frame).unwrap();
            let back: ServerFrame = serde_json::from_str(&json).unwrap();
            assert_eq!(frame, back);
        }
    }

    #[test]
    fn conflict_notice_uses_camel_case_wire_fields() {
        let notice = ConflictNotice {
            conflict_type: ConflictKind::Fork,
            common_ancestor_id: ActionId([1u8; 32]),
            server_branch: vec![],
        };
        let v = serde_json::to_value(ServerFrame::Conflict(notice)).unwrap();
        assert_eq!(v["type"], "CONFLICT");
        assert_eq!(v["conflictType"], "FORK");
        assert!(v["commonAncestorId"].is_string());
        assert!(v["serverBranch"].is_array());
    }

    #[test]
    fn push_request_omits_default_overwrite() {
        let push = PushRequest {
            game_id: "g1".into(),
            actions: vec![],
            base_revision: None,
            overwrite: false,
        };
        let v = serde_json::to_value(&push).unwrap();
        assert!(v.get("overwrite").is_none());
        let back: PushRequest = serde_json::from_value(v).unwrap();
        assert!(!back.overwrite);
    }

    #[test]
    fn unknown_frame_types_are_rejected() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"EVAL"}"#).is_err());
        assert!(serde_json::from_str::<ServerFrame>(r#"{"type":"SHELL"}"#).is_err());
    }
}
