// SPDX-License-Identifier: Apache-2.0
//! Conflict classification for two branches over a common ancestor.
//!
//! Pure and side-effect free: the caller supplies the shared log prefix and
//! the two branches; [`classify`] decides LINEAR / DIVERGED / FORK and, for
//! DIVERGED, produces the reconciled reissue of the local branch. Nothing
//! here touches the network or the store.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::action::{Action, ActionBody, ActionId};
use crate::history::effective_state;

/// Conflict classification.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum ConflictKind {
    /// Exactly one side moved; fast-forward the other.
    #[serde(rename = "LINEAR")]
    Linear,
    /// Both sides moved and wrote overlapping slots; user must choose.
    #[serde(rename = "FORK")]
    Fork,
    /// Both sides moved on disjoint slots; reconcilable by interleaving.
    #[serde(rename = "DIVERGED")]
    Diverged,
}

/// A surfaced conflict, as handed to the client for resolution.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Conflict {
    /// The classification (always [`ConflictKind::Fork`] when surfaced).
    #[serde(rename = "conflictType")]
    pub kind: ConflictKind,
    /// Newest action both histories share.
    #[serde(rename = "commonAncestorId")]
    pub common_ancestor: ActionId,
    /// Actions ahead of the ancestor on the local side.
    #[serde(rename = "localBranch")]
    pub local_branch: Vec<Action>,
    /// Actions ahead of the ancestor on the server side.
    #[serde(rename = "serverBranch")]
    pub remote_branch: Vec<Action>,
}

/// Outcome of classification.
#[derive(Clone, PartialEq, Debug)]
pub enum Resolution {
    /// Server is ahead (or equal); apply its actions locally.
    FastForwardLocal {
        /// The server actions to apply, oldest first.
        actions: Vec<Action>,
    },
    /// Local is ahead; ship its actions to the server.
    FastForwardRemote {
        /// The local actions to send, oldest first.
        actions: Vec<Action>,
    },
    /// DIVERGED: server ordering wins; the local branch is re-derived on top
    /// of the server tip and must be resubmitted.
    Reconciled {
        /// Re-issued local actions (fresh ids, re-chained parents).
        reissued: Vec<Action>,
    },
    /// FORK: surfaced for an explicit user decision.
    Fork(Conflict),
}

/// Classify two branches sharing `ancestor`.
///
/// `base` is the common log prefix up to and including the ancestor; it is
/// needed to replay-check a DIVERGED merge. Branches are oldest first.
pub fn classify(
    base: &[Action],
    ancestor: ActionId,
    local: &[Action],
    remote: &[Action],
) -> Resolution {
    if local.is_empty() {
        return Resolution::FastForwardLocal {
            actions: remote.to_vec(),
        };
    }
    if remote.is_empty() {
        return Resolution::FastForwardRemote {
            actions: local.to_vec(),
        };
    }

    let fork = || {
        Resolution::Fork(Conflict {
            kind: ConflictKind::Fork,
            common_ancestor: ancestor,
            local_branch: local.to_vec(),
            remote_branch: remote.to_vec(),
        })
    };

    let local_keys = branch_write_keys(base, local);
    let remote_keys = branch_write_keys(base, remote);
    if !local_keys.is_disjoint(&remote_keys) {
        return fork();
    }

    // Disjoint slots: interleave with server ordering first, re-deriving the
    // local actions so their ids commit to the new position.
    let mut merged: Vec<Action> = Vec::with_capacity(base.len() + remote.len() + local.len());
    merged.extend_from_slice(base);
    merged.extend_from_slice(remote);
    let mut tip = merged.last().map(|a| a.id);
    let mut reissued = Vec::with_capacity(local.len());
    for action in local {
        let fresh = action.reissue(tip);
        tip = Some(fresh.id);
        merged.push(fresh.clone());
        reissued.push(fresh);
    }

    // The merge stands only if the combined log still reduces cleanly.
    if effective_state(&merged).rejected.is_empty() {
        Resolution::Reconciled { reissued }
    } else {
        fork()
    }
}

/// The write keys of every action in `branch`, with `base` available for
/// resolving undo references.
fn branch_write_keys(base: &[Action], branch: &[Action]) -> BTreeSet<String> {
    let mut by_id: HashMap<ActionId, &Action> = HashMap::new();
    for action in base.iter().chain(branch.iter()) {
        by_id.insert(action.id, action);
    }
    let mut keys = BTreeSet::new();
    for action in branch {
        collect_write_keys(action, &by_id, &mut keys, 0);
    }
    keys
}

/// Insert the state keys `action` writes into `keys`.
///
/// Undo references are chased (depth-bounded) so an `UNDO` conflicts with
/// concurrent edits of whatever its referent touched.
fn collect_write_keys(
    action: &Action,
    by_id: &HashMap<ActionId, &Action>,
    keys: &mut BTreeSet<String>,
    depth: usize,
) {
    match &action.body {
        ActionBody::GameStart(_) => {
            keys.insert("meta".into());
        }
        ActionBody::Pitch(p) => {
            keys.insert(format!("pa:{}", p.cell.key()));
        }
        ActionBody::PlayResult(p) => {
            keys.insert(format!("pa:{}", p.cell.key()));
            for runner in &p.runners {
                keys.insert(format!("pa:{}", runner.cell.key()));
            }
        }
        ActionBody::RunnerAdvance(p) => {
            for runner in &p.updates {
                keys.insert(format!("pa:{}", runner.cell.key()));
            }
        }
        ActionBody::Substitution(p) => {
            keys.insert(format!("slot:{}-{}", p.team, p.slot));
            if let Some(cell) = &p.cell {
                keys.insert(format!("pa:{}", cell.key()));
            }
        }
        ActionBody::LineupUpdate(p) => {
            keys.insert(format!("lineup:{}", p.team));
            for slot in 0..p.slots.len() {
                keys.insert(format!("slot:{}-{}", p.team, slot));
            }
        }
        ActionBody::ScoreOverride(p) => {
            keys.insert(format!("score:{}-{}", p.team, p.column));
        }
        ActionBody::PitcherUpdate(p) => {
            keys.insert(format!("pitcher:{}", p.team));
        }
        ActionBody::ClearData(p) => {
            keys.insert(format!("pa:{}", p.cell.key()));
        }
        ActionBody::Undo(u) => match by_id.get(&u.ref_id) {
            Some(referent) if depth < 8 => {
                collect_write_keys(referent, by_id, keys, depth + 1);
            }
            _ => {
                keys.insert(format!("undo:{}", u.ref_id));
            }
        },
        ActionBody::AccessUpdate(_) => {
            keys.insert("access".into());
        }
        ActionBody::NoteUpdate(_) => {
            keys.insert("note".into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{
        CellRef, GameMeta, GameStartPayload, PitchKind, PitchPayload, PlayKind, PlayResult,
        PlayResultPayload, ScoreOverridePayload,
    };

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

    fn cell(slot: u8) -> CellRef {
        CellRef {
            team: 0,
            slot,
            column: 1,
        }
    }

    fn play(slot: u8, outcome_seq: &str, ts: i64) -> Action {
        Action::new(
            ActionBody::PlayResult(PlayResultPayload {
                cell: cell(slot),
                res: PlayResult::Out,
                base: None,
                play: PlayKind::Ground,
                seq: outcome_seq.split('-').map(String::from).collect(),
                hit: None,
                runners: vec![],
            }),
            ts,
            None,
        )
    }

    #[test]
    fn one_empty_branch_is_linear() {
        let base = vec![start()];
        let ancestor = base[0].id;
        let remote = vec![play(0, "6-3", 1)];
        match classify(&base, ancestor, &[], &remote) {
            Resolution::FastForwardLocal { actions } => assert_eq!(actions, remote),
            other => panic!("expected fast-forward, got {other:?}"),
        }
        match classify(&base, ancestor, &remote, &[]) {
            Resolution::FastForwardRemote { actions } => assert_eq!(actions, remote),
            other => panic!("expected fast-forward, got {other:?}"),
        }
    }

    #[test]
    fn same_cell_writes_fork() {
        let base = vec![start()];
        let ancestor = base[0].id;
        let local = vec![play(0, "6-3", 1)];
        let remote = vec![play(0, "5-3", 2)];
        match classify(&base, ancestor, &local, &remote) {
            Resolution::Fork(conflict) => {
                assert_eq!(conflict.kind, ConflictKind::Fork);
                assert_eq!(conflict.common_ancestor, ancestor);
                assert_eq!(conflict.remote_branch, remote);
            }
            other => panic!("expected fork, got {other:?}"),
        }
    }

    #[test]
    fn disjoint_cells_reconcile_with_server_ordering() {
        let base = vec![start()];
        let ancestor = base[0].id;
        let local = vec![play(2, "4-3", 5)];
        let remote = vec![play(0, "6-3", 1)];
        match classify(&base, ancestor, &local, &remote) {
            Resolution::Reconciled { reissued } => {
                assert_eq!(reissued.len(), 1);
                // Fresh id, chained onto the server tip.
                assert_ne!(reissued[0].id, local[0].id);
                assert_eq!(reissued[0].parent, Some(remote[0].id));
                assert_eq!(reissued[0].body, local[0].body);
            }
            other => panic!("expected reconciliation, got {other:?}"),
        }
    }

    #[test]
    fn undo_conflicts_with_edits_of_its_referent() {
        let target = play(0, "6-3", 1);
        let base = vec![start(), target.clone()];
        let ancestor = target.id;
        let local = vec![Action::new(
            ActionBody::Undo(crate::action::UndoPayload { ref_id: target.id }),
            2,
            None,
        )];
        let remote = vec![Action::new(
            ActionBody::Pitch(PitchPayload {
                cell: cell(0),
                pitch: PitchKind::Ball,
            }),
            3,
            None,
        )];
        assert!(matches!(
            classify(&base, ancestor, &local, &remote),
            Resolution::Fork(_)
        ));
    }

    #[test]
    fn merge_that_fails_replay_falls_back_to_fork() {
        // The local branch duplicates GAME_START; key sets are disjoint
        // ("meta" vs a PA cell) but the merged log cannot reduce.
        let base = vec![start()];
        let ancestor = base[0].id;
        let local = vec![start()];
        let remote = vec![play(0, "6-3", 1)];
        assert!(matches!(
            classify(&base, ancestor, &local, &remote),
            Resolution::Fork(_)
        ));
    }

    #[test]
    fn score_overrides_on_different_cells_do_not_fork() {
        let base = vec![start()];
        let ancestor = base[0].id;
        let local = vec![Action::new(
            ActionBody::ScoreOverride(ScoreOverridePayload {
                team: 0,
                column: 2,
                score: "3".into(),
            }),
            1,
            None,
        )];
        let remote = vec![Action::new(
            ActionBody::ScoreOverride(ScoreOverridePayload {
                team: 1,
                column: 2,
                score: "1".into(),
            }),
            2,
            None,
        )];
        assert!(matches!(
            classify(&base, ancestor, &local, &remote),
            Resolution::Reconciled { .. }
        ));
    }
}
