// SPDX-License-Identifier: Apache-2.0
//! Replicated commands and the documents they operate on.
//!
//! A [`Command`] is what flows through the Raft log. Commands are plain data
//! — all interpretation happens in the FSM after commit, so every node
//! derives the same successor state from the same ordered command stream.

use serde::{Deserialize, Serialize};

use tally_core::{Action, ActionId, ActionLog, GameState, Player};

/// A stored game document: the authoritative log plus its materialized
/// state. The state is derivable, but persisting it keeps reads cheap.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct GameDoc {
    /// The append-only action log.
    pub log: ActionLog,
    /// Materialized state (`log.replay().state`).
    pub state: GameState,
    /// Tip revision at materialization time.
    pub revision: ActionId,
}

impl GameDoc {
    /// Build a document from a log by replaying it.
    pub fn materialize(log: ActionLog) -> Self {
        let revision = log.revision();
        let state = log.replay().state;
        Self {
            log,
            state,
            revision,
        }
    }
}

/// A stored team.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Team {
    /// Stable team id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Roster.
    #[serde(default)]
    pub players: Vec<Player>,
}

/// Payload of [`Command::SaveGame`]: either a whole replacement log or one
/// action to append idempotently.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SaveGamePayload {
    /// Replace the stored log wholesale (game creation, conflict overwrite).
    Log {
        /// The full replacement log.
        log: ActionLog,
    },
    /// Append one action; a duplicate id is a no-op.
    Append {
        /// The action to append.
        action: Action,
    },
}

/// Rolling counter deltas merged into the metrics registry.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct MetricsDelta {
    /// Counter increments by name.
    pub counters: std::collections::BTreeMap<String, u64>,
}

/// The closed set of replicated commands.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Create/replace or append to a game document.
    SaveGame {
        /// Target game id.
        game_id: String,
        /// Replacement log or single append.
        payload: SaveGamePayload,
    },
    /// Create or replace a team.
    SaveTeam {
        /// The team document.
        team: Team,
    },
    /// Delete a game document.
    DeleteGame {
        /// Target game id.
        game_id: String,
    },
    /// Delete a team.
    DeleteTeam {
        /// Target team id.
        team_id: String,
    },
    /// Replace the structural access policy blob.
    UpdateAccessPolicy {
        /// Opaque policy document.
        policy: serde_json::Value,
    },
    /// Merge counter deltas into the metrics registry.
    MetricsUpdate {
        /// The deltas.
        delta: MetricsDelta,
    },
    /// Server-built pitcher change for a game.
    SetPitcher {
        /// Target game id.
        game_id: String,
        /// Team index.
        team: u8,
        /// The new pitcher.
        pitcher: Player,
        /// Timestamp used to derive the action deterministically on every
        /// node.
        timestamp: i64,
    },
    /// Record a subscriber's acknowledged revision (observability only).
    SubscribeAck {
        /// The game being followed.
        game_id: String,
        /// Acknowledging session id.
        session_id: String,
        /// The acknowledged revision.
        revision: ActionId,
    },
}

impl Command {
    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Command::SaveGame { .. } => "save_game",
            Command::SaveTeam { .. } => "save_team",
            Command::DeleteGame { .. } => "delete_game",
            Command::DeleteTeam { .. } => "delete_team",
            Command::UpdateAccessPolicy { .. } => "update_access_policy",
            Command::MetricsUpdate { .. } => "metrics_update",
            Command::SetPitcher { .. } => "set_pitcher",
            Command::SubscribeAck { .. } => "subscribe_ack",
        }
    }
}
