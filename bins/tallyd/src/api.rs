// SPDX-License-Identifier: Apache-2.0
//! HTTP API: sync push/pull, document reads, cluster admin, health and
//! metrics.
//!
//! Status contract: `200` JSON on success, `429` + `Retry-After` when rate
//! limited, `409` with a CONFLICT body, `503` with `{leaderAddr}` when this
//! node is not the leader, `403` on refused identity.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use tally_cluster::{GameDoc, ProposeOutcome, Team};
use tally_core::ActionId;
use tally_proto::{
    ClusterNode, ErrorBody, JoinRequest, NotLeaderBody, PullResponse, PushRequest, PushResponse,
    RemoveRequest, StatusResponse,
};
use tally_store::{get_json, keys};

use crate::ingest::{ingest, Ingest};
use crate::limit::Decision;
use crate::ports::Identity;
use crate::AppState;

/// Shared-secret header guarding the cluster admin endpoints.
pub const CLUSTER_SECRET_HEADER: &str = "x-tally-cluster-secret";

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/sync/push", post(push_handler))
        .route("/api/sync/pull", get(pull_handler))
        .route("/api/games", get(list_games_handler))
        .route("/api/games/{id}", get(get_game_handler))
        .route("/api/teams", get(list_teams_handler))
        .route("/api/teams/{id}", get(get_team_handler))
        .route("/api/cluster/status", get(status_handler))
        .route("/api/cluster/join", post(join_handler))
        .route("/api/cluster/remove", post(remove_handler))
        .route("/api/healthz", get(health_handler))
        .route("/api/metrics", get(metrics_handler))
        .with_state(state)
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Identity, Response> {
    state.identity.authenticate(bearer(headers)).ok_or_else(|| {
        (
            StatusCode::FORBIDDEN,
            Json(ErrorBody {
                error: "identity refused".into(),
            }),
        )
            .into_response()
    })
}

async fn push_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<PushRequest>,
) -> Response {
    let identity = match authenticate(&state, &headers) {
        Ok(identity) => identity,
        Err(refusal) => return refusal,
    };
    if !state.access.may_write(&identity, &request.game_id) {
        return (
            StatusCode::FORBIDDEN,
            Json(ErrorBody {
                error: "write access denied".into(),
            }),
        )
            .into_response();
    }

    if request.actions.len() > tally_proto::PUSH_BATCH_LIMIT && !request.overwrite {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ErrorBody {
                error: format!(
                    "batch exceeds {} actions",
                    tally_proto::PUSH_BATCH_LIMIT
                ),
            }),
        )
            .into_response();
    }

    // One batch costs as many tokens as it carries actions.
    let cost = request.actions.len().max(1) as u32;
    let subject = if identity.subject == "anonymous" {
        peer.ip().to_string()
    } else {
        identity.subject.clone()
    };
    if let Decision::Limited { retry_after_secs } = state.limiter.check(&subject, "push", cost) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, retry_after_secs.to_string())],
            Json(ErrorBody {
                error: "rate limited".into(),
            }),
        )
            .into_response();
    }

    let outcome = ingest(
        &state,
        &request.game_id,
        &request.actions,
        request.base_revision,
        request.overwrite,
    )
    .await;
    match outcome {
        Ingest::Ack { revision, accepted } => {
            (StatusCode::OK, Json(PushResponse { revision, accepted })).into_response()
        }
        Ingest::Conflict(notice) => (StatusCode::CONFLICT, Json(notice)).into_response(),
        Ingest::NotLeader(hint) => (StatusCode::SERVICE_UNAVAILABLE, Json(hint)).into_response(),
        Ingest::Rejected(reason) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ErrorBody { error: reason }),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct PullParams {
    #[serde(rename = "gameId")]
    game_id: String,
    since: Option<String>,
}

async fn pull_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<PullParams>,
) -> Response {
    let identity = match authenticate(&state, &headers) {
        Ok(identity) => identity,
        Err(refusal) => return refusal,
    };
    if !state.access.may_read(&identity, &params.game_id) {
        return StatusCode::FORBIDDEN.into_response();
    }
    let doc: Option<GameDoc> = {
        let guard = state.store.read().unwrap_or_else(|e| e.into_inner());
        get_json(guard.as_ref(), &keys::game(&params.game_id))
            .ok()
            .flatten()
    };
    let Some(doc) = doc else {
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: format!("unknown game {:?}", params.game_id),
            }),
        )
            .into_response();
    };
    let since = params.since.as_deref().and_then(ActionId::parse);
    let actions = doc.log.since(since.as_ref()).to_vec();
    (
        StatusCode::OK,
        Json(PullResponse {
            game_id: params.game_id,
            actions,
            revision: doc.revision,
        }),
    )
        .into_response()
}

#[derive(Serialize)]
struct GameSummary {
    id: String,
    revision: ActionId,
    title: Option<String>,
}

async fn list_games_handler(State(state): State<Arc<AppState>>) -> Response {
    let guard = state.store.read().unwrap_or_else(|e| e.into_inner());
    let Ok(game_keys) = guard.list(keys::GAMES_PREFIX) else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    let mut games = Vec::with_capacity(game_keys.len());
    for key in game_keys {
        if let Ok(Some(doc)) = get_json::<GameDoc>(guard.as_ref(), &key) {
            games.push(GameSummary {
                id: key.trim_start_matches(keys::GAMES_PREFIX).to_string(),
                revision: doc.revision,
                title: doc.state.meta.map(|m| m.title),
            });
        }
    }
    (StatusCode::OK, Json(games)).into_response()
}

async fn get_game_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let doc: Option<GameDoc> = {
        let guard = state.store.read().unwrap_or_else(|e| e.into_inner());
        get_json(guard.as_ref(), &keys::game(&id)).ok().flatten()
    };
    match doc {
        Some(doc) => (StatusCode::OK, Json(doc)).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn list_teams_handler(State(state): State<Arc<AppState>>) -> Response {
    let guard = state.store.read().unwrap_or_else(|e| e.into_inner());
    let Ok(team_keys) = guard.list(keys::TEAMS_PREFIX) else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    let mut teams = Vec::with_capacity(team_keys.len());
    for key in team_keys {
        if let Ok(Some(team)) = get_json::<Team>(guard.as_ref(), &key) {
            teams.push(team);
        }
    }
    (StatusCode::OK, Json(teams)).into_response()
}

async fn get_team_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let team: Option<Team> = {
        let guard = state.store.read().unwrap_or_else(|e| e.into_inner());
        get_json(guard.as_ref(), &keys::team(&id)).ok().flatten()
    };
    match team {
        Some(team) => (StatusCode::OK, Json(team)).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.raft.status().await {
        Ok(status) => (
            StatusCode::OK,
            Json(StatusResponse {
                node_id: status.node_id,
                state: status.role,
                leader_id: status.leader_id,
                leader_addr: status.leader_addr,
                nodes: status.nodes,
            }),
        )
            .into_response(),
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

fn check_cluster_secret(state: &AppState, headers: &HeaderMap) -> bool {
    headers
        .get(CLUSTER_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == state.secret)
        .unwrap_or(false)
}

async fn join_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<JoinRequest>,
) -> Response {
    if !check_cluster_secret(&state, &headers) {
        return StatusCode::FORBIDDEN.into_response();
    }
    let node = ClusterNode {
        id: request.node_id,
        raft_addr: request.raft_addr,
        session_addr: request.session_addr,
        http_addr: request.http_addr,
        pub_key: request.pub_key,
        non_voter: request.non_voter,
        version: request.version,
    };
    info!(node = %node.id, "join requested");
    match state.raft.join(node).await {
        Ok(ProposeOutcome::Applied { .. }) => StatusCode::OK.into_response(),
        Ok(ProposeOutcome::NotLeader {
            leader_id,
            leader_addr,
        }) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(NotLeaderBody {
                leader_id,
                leader_addr,
            }),
        )
            .into_response(),
        Ok(ProposeOutcome::LeadershipLost) | Err(_) => {
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

async fn remove_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<RemoveRequest>,
) -> Response {
    if !check_cluster_secret(&state, &headers) {
        return StatusCode::FORBIDDEN.into_response();
    }
    match state.raft.remove(request.node_id).await {
        Ok(ProposeOutcome::Applied { .. }) => StatusCode::OK.into_response(),
        Ok(ProposeOutcome::NotLeader {
            leader_id,
            leader_addr,
        }) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(NotLeaderBody {
                leader_id,
                leader_addr,
            }),
        )
            .into_response(),
        Ok(ProposeOutcome::LeadershipLost) | Err(_) => {
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    #[serde(rename = "nodeId")]
    node_id: String,
    leader: Option<String>,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.raft.status().await {
        Ok(status) => (
            StatusCode::OK,
            Json(Health {
                status: "ok",
                node_id: status.node_id,
                leader: status.leader_id,
            }),
        )
            .into_response(),
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    let metrics: Option<serde_json::Value> = {
        let guard = state.store.read().unwrap_or_else(|e| e.into_inner());
        get_json(guard.as_ref(), keys::METRICS).ok().flatten()
    };
    (
        StatusCode::OK,
        Json(metrics.unwrap_or_else(|| serde_json::json!({ "counters": {} }))),
    )
        .into_response()
}
