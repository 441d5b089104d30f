// SPDX-License-Identifier: Apache-2.0
//! The append-only action log.
//!
//! The log is the authoritative document; every other per-game artifact is
//! derivable by replay. Structural invariants enforced here:
//!
//! - position zero is the one and only `GAME_START`;
//! - `parent`, when present, names an earlier entry of the same log;
//! - appending an id that is already present is a no-op (idempotent retries).

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::action::{Action, ActionId};
use crate::history;
use crate::reduce::ReduceError;
use crate::state::GameState;

/// Structural log violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogError {
    /// The first entry of a log must be `GAME_START`.
    #[error("log must begin with GAME_START")]
    MissingStart,
    /// A second `GAME_START` was appended.
    #[error("GAME_START may appear only at position zero")]
    StartReplayed,
    /// `parent` names an id that is not in the log.
    #[error("unknown parent action {0}")]
    UnknownParent(ActionId),
}

/// Result of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The action was appended at the tip.
    Appended,
    /// The id was already present; the log is unchanged.
    Duplicate,
}

#[derive(Serialize, Deserialize)]
struct LogRepr {
    #[serde(rename = "gameId")]
    game_id: String,
    actions: Vec<Action>,
}

/// Ordered action sequence for one game.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "LogRepr", into = "LogRepr")]
pub struct ActionLog {
    game_id: String,
    actions: Vec<Action>,
    ids: HashSet<ActionId>,
}

impl TryFrom<LogRepr> for ActionLog {
    type Error = LogError;

    fn try_from(repr: LogRepr) -> Result<Self, LogError> {
        let mut actions = repr.actions.into_iter();
        let start = actions.next().ok_or(LogError::MissingStart)?;
        let mut log = ActionLog::new(repr.game_id, start)?;
        for action in actions {
            log.append(action)?;
        }
        Ok(log)
    }
}

impl From<ActionLog> for LogRepr {
    fn from(log: ActionLog) -> LogRepr {
        LogRepr {
            game_id: log.game_id,
            actions: log.actions,
        }
    }
}

impl ActionLog {
    /// Create a log from its `GAME_START`.
    ///
    /// # Errors
    ///
    /// [`LogError::MissingStart`] when `start` is any other action kind.
    pub fn new(game_id: impl Into<String>, start: Action) -> Result<Self, LogError> {
        if !matches!(start.body, crate::action::ActionBody::GameStart(_)) {
            return Err(LogError::MissingStart);
        }
        let mut ids = HashSet::new();
        ids.insert(start.id);
        Ok(Self {
            game_id: game_id.into(),
            actions: vec![start],
            ids,
        })
    }

    /// The game this log belongs to.
    pub fn game_id(&self) -> &str {
        &self.game_id
    }

    /// All entries, oldest first.
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// Entry count.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Always false — a log cannot exist without its `GAME_START`.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Whether `id` is present.
    pub fn contains(&self, id: &ActionId) -> bool {
        self.ids.contains(id)
    }

    /// Look up an entry by id.
    pub fn get(&self, id: &ActionId) -> Option<&Action> {
        self.actions.iter().find(|a| a.id == *id)
    }

    /// Index of `id` within the log.
    pub fn position(&self, id: &ActionId) -> Option<usize> {
        self.actions.iter().position(|a| a.id == *id)
    }

    /// The current tip revision: the id of the newest entry, generative or
    /// undo — either one defines the tip for causality checks.
    pub fn revision(&self) -> ActionId {
        // Non-empty by construction.
        self.actions[self.actions.len() - 1].id
    }

    /// Append one action.
    ///
    /// Duplicate ids are accepted and reported as [`AppendOutcome::Duplicate`]
    /// without mutating the log.
    ///
    /// # Errors
    ///
    /// [`LogError::StartReplayed`] for a second `GAME_START`;
    /// [`LogError::UnknownParent`] when `parent` is not an earlier entry.
    pub fn append(&mut self, action: Action) -> Result<AppendOutcome, LogError> {
        if self.ids.contains(&action.id) {
            return Ok(AppendOutcome::Duplicate);
        }
        if matches!(action.body, crate::action::ActionBody::GameStart(_)) {
            return Err(LogError::StartReplayed);
        }
        if let Some(parent) = &action.parent {
            if !self.ids.contains(parent) {
                return Err(LogError::UnknownParent(*parent));
            }
        }
        self.ids.insert(action.id);
        self.actions.push(action);
        Ok(AppendOutcome::Appended)
    }

    /// Entries strictly after `since`. `None` (or an id not in the log)
    /// yields the whole log — the cold-catch-up case.
    pub fn since(&self, since: Option<&ActionId>) -> &[Action] {
        match since.and_then(|id| self.position(id)) {
            Some(pos) => &self.actions[pos + 1..],
            None => &self.actions,
        }
    }

    /// Entries strictly after the common ancestor `ancestor`, or `None` when
    /// the ancestor is unknown to this log.
    pub fn branch_from(&self, ancestor: &ActionId) -> Option<&[Action]> {
        let pos = self.position(ancestor)?;
        Some(&self.actions[pos + 1..])
    }

    /// Replay the log into its effective state, skipping actions cancelled by
    /// the undo protocol. Ill-formed actions are skipped and reported; they
    /// never poison the rest of the replay.
    pub fn replay(&self) -> Replay {
        history::effective_state(&self.actions)
    }
}

/// Outcome of a full replay.
#[derive(Debug, Clone, PartialEq)]
pub struct Replay {
    /// The materialized state.
    pub state: GameState,
    /// Actions the reducer rejected, in log order.
    pub rejected: Vec<(ActionId, ReduceError)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionBody, CellRef, GameMeta, GameStartPayload, PitchKind, PitchPayload};

    fn start() -> Action {
        Action::new(
            ActionBody::GameStart(GameStartPayload {
                meta: GameMeta {
                    title: "t".into(),
                    date: "2026-04-01".into(),
                    away: "A".into(),
                    home: "H".into(),
                    innings: 7,
                },
                lineups: vec![],
                pitchers: vec![],
            }),
            0,
            None,
        )
    }

    fn pitch(ts: i64, parent: Option<ActionId>) -> Action {
        Action::new(
            ActionBody::Pitch(PitchPayload {
                cell: CellRef {
                    team: 0,
                    slot: 0,
                    column: 1,
                },
                pitch: PitchKind::Ball,
            }),
            ts,
            parent,
        )
    }

    #[test]
    fn duplicate_append_is_a_noop() {
        let mut log = ActionLog::new("g1", start()).unwrap();
        let p = pitch(1, None);
        assert_eq!(log.append(p.clone()).unwrap(), AppendOutcome::Appended);
        assert_eq!(log.append(p).unwrap(), AppendOutcome::Duplicate);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn second_game_start_is_rejected() {
        let mut log = ActionLog::new("g1", start()).unwrap();
        assert_eq!(log.append(start()), Err(LogError::StartReplayed));
    }

    #[test]
    fn unknown_parent_is_rejected() {
        let mut log = ActionLog::new("g1", start()).unwrap();
        let orphan = pitch(1, Some(ActionId([9u8; 32])));
        assert!(matches!(
            log.append(orphan),
            Err(LogError::UnknownParent(_))
        ));
    }

    #[test]
    fn since_slices_after_the_revision() {
        let mut log = ActionLog::new("g1", start()).unwrap();
        let a = pitch(1, None);
        let b = pitch(2, None);
        log.append(a.clone()).unwrap();
        log.append(b.clone()).unwrap();
        assert_eq!(log.since(Some(&a.id)), &[b.clone()]);
        assert_eq!(log.since(None).len(), 3);
        assert_eq!(log.since(Some(&ActionId([1u8; 32]))).len(), 3);
        assert_eq!(log.revision(), b.id);
    }

    #[test]
    fn log_round_trips_through_json() {
        let mut log = ActionLog::new("g1", start()).unwrap();
        log.append(pitch(1, None)).unwrap();
        let json = serde_json::to_string(&log).unwrap();
        let back: ActionLog = serde_json::from_str(&json).unwrap();
        assert_eq!(log, back);
    }

    #[test]
    fn log_without_start_fails_deserialization() {
        let json = r#"{"gameId":"g1","actions":[]}"#;
        assert!(serde_json::from_str::<ActionLog>(json).is_err());
    }
}
