// SPDX-License-Identifier: Apache-2.0
//! The shared ingest path for action submissions.
//!
//! Both the streaming channel and the batched HTTP endpoint land here:
//! causality is validated against the stored tip, mismatches run through the
//! conflict resolver, and accepted work is proposed through Raft. Per-action
//! failures never abort the rest of a batch — writes are all-or-nothing per
//! action, not per batch.

use tracing::debug;

use tally_cluster::{ApplyOutcome, Command, GameDoc, ProposeOutcome, SaveGamePayload};
use tally_core::conflict::{classify, Resolution};
use tally_core::{Action, ActionId, ActionLog, ConflictKind};
use tally_proto::{ConflictNotice, NotLeaderBody};
use tally_store::{get_json, keys};

use crate::AppState;

/// Outcome of one ingest call, transport-agnostic.
#[derive(Debug)]
pub enum Ingest {
    /// Committed; `revision` is the resulting tip.
    Ack {
        /// Tip after the batch.
        revision: ActionId,
        /// Actions that were new.
        accepted: usize,
    },
    /// The submission conflicts with server history.
    Conflict(ConflictNotice),
    /// This node cannot commit; redirect to the leader.
    NotLeader(NotLeaderBody),
    /// Nothing in the batch could be interpreted.
    Rejected(String),
}

/// Validate and commit a batch of actions for `game_id`.
pub async fn ingest(
    state: &AppState,
    game_id: &str,
    actions: &[Action],
    base_revision: Option<ActionId>,
    overwrite: bool,
) -> Ingest {
    // Followers answer with a redirect before doing stale-read conflict
    // analysis; the proposal path re-checks leadership authoritatively.
    match state.raft.status().await {
        Ok(status) if status.role != "leader" => {
            return Ingest::NotLeader(NotLeaderBody {
                leader_id: status.leader_id,
                leader_addr: status.leader_addr,
            });
        }
        Ok(_) => {}
        Err(_) => return Ingest::Rejected("raft manager unavailable".into()),
    }

    if overwrite {
        return ingest_overwrite(state, game_id, actions).await;
    }

    let doc: Option<GameDoc> = {
        let guard = state.store.read().unwrap_or_else(|e| e.into_inner());
        match get_json(guard.as_ref(), &keys::game(game_id)) {
            Ok(doc) => doc,
            Err(err) => return Ingest::Rejected(format!("store read failed: {err}")),
        }
    };

    let Some(doc) = doc else {
        // Only a GAME_START can create the document; the append path in the
        // FSM enforces that per action.
        return propose_appends(state, game_id, actions, None).await;
    };

    let tip = doc.revision;
    if actions.is_empty() {
        return Ingest::Ack {
            revision: tip,
            accepted: 0,
        };
    }

    // Drop anything the log already holds (idempotent retries).
    let fresh: Vec<Action> = actions
        .iter()
        .filter(|a| !doc.log.contains(&a.id))
        .cloned()
        .collect();
    if fresh.is_empty() {
        return Ingest::Ack {
            revision: tip,
            accepted: 0,
        };
    }

    if base_revision == Some(tip) {
        return propose_appends(state, game_id, &fresh, Some(tip)).await;
    }

    // Causality mismatch: classify against the branch past the claimed base.
    let ancestor = base_revision
        .filter(|id| doc.log.contains(id))
        .unwrap_or_else(|| doc.log.actions()[0].id);
    let position = doc
        .log
        .position(&ancestor)
        .unwrap_or(0);
    let base_slice = &doc.log.actions()[..=position];
    let server_branch = doc.log.branch_from(&ancestor).unwrap_or(&[]);

    match classify(base_slice, ancestor, &fresh, server_branch) {
        Resolution::FastForwardRemote { actions } => {
            propose_appends(state, game_id, &actions, Some(tip)).await
        }
        Resolution::FastForwardLocal { .. } => Ingest::Ack {
            revision: tip,
            accepted: 0,
        },
        Resolution::Reconciled { .. } => {
            // Reconcilable, but the client owns the re-issue so its optimistic
            // ids stay consistent with what lands in the log.
            debug!(game_id, "diverged submission; asking client to reissue");
            Ingest::Conflict(ConflictNotice {
                conflict_type: ConflictKind::Diverged,
                common_ancestor_id: ancestor,
                server_branch: server_branch.to_vec(),
            })
        }
        Resolution::Fork(conflict) => Ingest::Conflict(ConflictNotice {
            conflict_type: ConflictKind::Fork,
            common_ancestor_id: conflict.common_ancestor,
            server_branch: conflict.remote_branch,
        }),
    }
}

async fn ingest_overwrite(state: &AppState, game_id: &str, actions: &[Action]) -> Ingest {
    let mut iter = actions.iter().cloned();
    let Some(start) = iter.next() else {
        return Ingest::Rejected("overwrite requires a full log".into());
    };
    let mut log = match ActionLog::new(game_id, start) {
        Ok(log) => log,
        Err(err) => return Ingest::Rejected(format!("bad replacement log: {err}")),
    };
    for action in iter {
        if let Err(err) = log.append(action) {
            return Ingest::Rejected(format!("bad replacement log: {err}"));
        }
    }
    let revision = log.revision();
    let accepted = log.len();
    match state
        .raft
        .propose(Command::SaveGame {
            game_id: game_id.to_string(),
            payload: SaveGamePayload::Log { log },
        })
        .await
    {
        Ok(ProposeOutcome::Applied { outcome, .. }) => match outcome {
            ApplyOutcome::Applied { .. } => Ingest::Ack { revision, accepted },
            ApplyOutcome::Rejected { reason } => Ingest::Rejected(reason),
        },
        Ok(ProposeOutcome::NotLeader {
            leader_id,
            leader_addr,
        }) => Ingest::NotLeader(NotLeaderBody {
            leader_id,
            leader_addr,
        }),
        Ok(ProposeOutcome::LeadershipLost) => Ingest::NotLeader(NotLeaderBody {
            leader_id: None,
            leader_addr: None,
        }),
        Err(err) => Ingest::Rejected(err.to_string()),
    }
}

async fn propose_appends(
    state: &AppState,
    game_id: &str,
    actions: &[Action],
    tip: Option<ActionId>,
) -> Ingest {
    let mut revision = tip;
    let mut accepted = 0usize;
    let mut first_rejection: Option<String> = None;
    for action in actions {
        let outcome = state
            .raft
            .propose(Command::SaveGame {
                game_id: game_id.to_string(),
                payload: SaveGamePayload::Append {
                    action: action.clone(),
                },
            })
            .await;
        match outcome {
            Ok(ProposeOutcome::Applied { outcome, .. }) => match outcome {
                ApplyOutcome::Applied { revision: r } => {
                    if let Some(r) = r {
                        revision = Some(r);
                    }
                    accepted += 1;
                }
                ApplyOutcome::Rejected { reason } => {
                    debug!(game_id, reason, "action rejected at ingest");
                    first_rejection.get_or_insert(reason);
                }
            },
            Ok(ProposeOutcome::NotLeader {
                leader_id,
                leader_addr,
            }) => {
                return Ingest::NotLeader(NotLeaderBody {
                    leader_id,
                    leader_addr,
                })
            }
            Ok(ProposeOutcome::LeadershipLost) => {
                return Ingest::NotLeader(NotLeaderBody {
                    leader_id: None,
                    leader_addr: None,
                })
            }
            Err(err) => return Ingest::Rejected(err.to_string()),
        }
    }
    match (revision, first_rejection) {
        (Some(revision), _) if accepted > 0 => Ingest::Ack { revision, accepted },
        (Some(revision), None) => Ingest::Ack {
            revision,
            accepted,
        },
        (_, Some(reason)) => Ingest::Rejected(reason),
        (None, None) => Ingest::Rejected("empty submission".into()),
    }
}
