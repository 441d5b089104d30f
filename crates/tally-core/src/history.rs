// SPDX-License-Identifier: Apache-2.0
//! Undo/redo derivation over the interleaved undo protocol.
//!
//! `UNDO` actions never mutate state directly. Their meaning is computed by a
//! single forward walk that maintains the set of cancelled ("dead")
//! generative actions:
//!
//! - an `UNDO` whose resolved target is alive kills it;
//! - an `UNDO` whose resolved target is already dead revives it (redo).
//!
//! An `UNDO` may target another `UNDO`; the reference chain is followed to
//! the ultimate generative action before toggling, so `UNDO(UNDO(A))` is a
//! redo of `A` regardless of chain depth.
//!
//! Replay then simply skips dead generative actions. That is also what makes
//! the mid-PA substitution case come out right without special code: undoing
//! a substitution drops it from the replay entirely, so the prior player and
//! the PA's pitch sequence are restored as a unit.

use std::collections::{HashMap, HashSet};

use crate::action::{Action, ActionBody, ActionId};
use crate::log::Replay;
use crate::reduce::{reduce, ReduceError};
use crate::state::GameState;

/// The set of generative action ids cancelled by effective undos.
pub fn active_undo_set(actions: &[Action]) -> HashSet<ActionId> {
    let undo_refs: HashMap<ActionId, ActionId> = actions
        .iter()
        .filter_map(|a| match &a.body {
            ActionBody::Undo(u) => Some((a.id, u.ref_id)),
            _ => None,
        })
        .collect();

    let mut dead: HashSet<ActionId> = HashSet::new();
    for action in actions {
        if let ActionBody::Undo(undo) = &action.body {
            let target = resolve_target(undo.ref_id, &undo_refs);
            if !dead.remove(&target) {
                dead.insert(target);
            }
        }
    }
    dead
}

/// Follow a chain of undo references to the ultimate generative target.
///
/// Bounded by the chain map size so a (structurally impossible) reference
/// cycle cannot loop forever.
fn resolve_target(mut id: ActionId, undo_refs: &HashMap<ActionId, ActionId>) -> ActionId {
    for _ in 0..=undo_refs.len() {
        match undo_refs.get(&id) {
            Some(next) => id = *next,
            None => break,
        }
    }
    id
}

/// The id of the newest generative action not cancelled by an effective undo
/// — what an undo gesture should target. `GAME_START` is never a target.
pub fn undo_target(actions: &[Action]) -> Option<ActionId> {
    let dead = active_undo_set(actions);
    actions
        .iter()
        .rev()
        .filter(|a| a.is_generative() && !matches!(a.body, ActionBody::GameStart(_)))
        .find(|a| !dead.contains(&a.id))
        .map(|a| a.id)
}

/// The id of the newest effective `UNDO` — what a redo gesture should target
/// (by issuing an `UNDO` of it). Any live generative action after it is a
/// linear barrier: new work clears the redo stack.
pub fn redo_target(actions: &[Action]) -> Option<ActionId> {
    let undo_refs: HashMap<ActionId, ActionId> = actions
        .iter()
        .filter_map(|a| match &a.body {
            ActionBody::Undo(u) => Some((a.id, u.ref_id)),
            _ => None,
        })
        .collect();
    let dead = active_undo_set(actions);

    for action in actions.iter().rev() {
        match &action.body {
            ActionBody::Undo(undo) => {
                let target = resolve_target(undo.ref_id, &undo_refs);
                if dead.contains(&target) {
                    return Some(action.id);
                }
                // A toggled-off undo; keep scanning.
            }
            _ => {
                if !dead.contains(&action.id) {
                    // Live new work bars redo.
                    return None;
                }
            }
        }
    }
    None
}

/// Replay a log into its effective state: dead generative actions and all
/// undos are skipped; actions the reducer rejects are recorded and skipped.
pub fn effective_state(actions: &[Action]) -> Replay {
    let dead = active_undo_set(actions);
    let mut state = GameState::default();
    let mut rejected: Vec<(ActionId, ReduceError)> = Vec::new();
    for action in actions {
        if matches!(action.body, ActionBody::Undo(_)) || dead.contains(&action.id) {
            continue;
        }
        match reduce(&state, action) {
            Ok(next) => state = next,
            Err(err) => rejected.push((action.id, err)),
        }
    }
    Replay { state, rejected }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{
        CellRef, GameMeta, GameStartPayload, LineupPayload, LineupSlot, PitchKind, PitchPayload,
        Player, SubstitutionPayload, UndoPayload,
    };
    use crate::canonical::state_digest;

    fn player(id: &str) -> Player {
        Player {
            id: id.into(),
            name: id.to_uppercase(),
            number: None,
        }
    }

    fn cell() -> CellRef {
        CellRef {
            team: 0,
            slot: 0,
            column: 1,
        }
    }

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
                lineups: vec![LineupPayload {
                    team: 0,
                    slots: vec![LineupSlot {
                        starter: player("starter"),
                        subs: vec![player("bench")],
                    }],
                }],
                pitchers: vec![],
            }),
            0,
            None,
        )
    }

    fn pitch(kind: PitchKind, ts: i64) -> Action {
        Action::new(
            ActionBody::Pitch(PitchPayload {
                cell: cell(),
                pitch: kind,
            }),
            ts,
            None,
        )
    }

    fn undo(target: ActionId, ts: i64) -> Action {
        Action::new(ActionBody::Undo(UndoPayload { ref_id: target }), ts, None)
    }

    #[test]
    fn undo_cancels_the_newest_generative_action() {
        let a = pitch(PitchKind::Ball, 1);
        let log = vec![start(), a.clone(), undo(a.id, 2)];
        let without: Vec<Action> = vec![start()];
        assert_eq!(
            state_digest(&effective_state(&log).state).unwrap(),
            state_digest(&effective_state(&without).state).unwrap()
        );
        assert_eq!(undo_target(&log), None);
    }

    #[test]
    fn undo_of_undo_restores_the_original() {
        let a = pitch(PitchKind::Ball, 1);
        let u1 = undo(a.id, 2);
        let u2 = undo(u1.id, 3);
        let log = vec![start(), a.clone(), u1, u2];
        let plain = vec![start(), a.clone()];
        assert_eq!(
            state_digest(&effective_state(&log).state).unwrap(),
            state_digest(&effective_state(&plain).state).unwrap()
        );
        assert_eq!(undo_target(&log), Some(a.id));
    }

    #[test]
    fn generative_action_is_a_linear_barrier_for_redo() {
        let a = pitch(PitchKind::Ball, 1);
        let u = undo(a.id, 2);
        let b = pitch(PitchKind::Strike, 3);
        let log = vec![start(), a, u.clone(), b];
        assert_eq!(redo_target(&log), None);

        let log_without_new_work = &log[..3];
        assert_eq!(redo_target(log_without_new_work), Some(u.id));
    }

    #[test]
    fn redo_target_skips_toggled_off_undos() {
        let a = pitch(PitchKind::Ball, 1);
        let u1 = undo(a.id, 2);
        let u2 = undo(u1.id, 3); // redo of a
        let log = vec![start(), a.clone(), u1, u2];
        // The tip undo revived `a`; nothing is dead, so nothing is redoable.
        assert_eq!(redo_target(&log), None);
        assert_eq!(undo_target(&log), Some(a.id));
    }

    #[test]
    fn mid_pa_substitution_undo_restores_the_prior_player() {
        let b1 = pitch(PitchKind::Ball, 1);
        let b2 = pitch(PitchKind::Ball, 2);
        let sub = Action::new(
            ActionBody::Substitution(SubstitutionPayload {
                team: 0,
                slot: 0,
                player: player("bench"),
                cell: Some(cell()),
            }),
            3,
            None,
        );
        let s1 = pitch(PitchKind::Strike, 4);
        let u_strike = undo(s1.id, 5);
        let u_sub = undo(sub.id, 6);
        let log = vec![start(), b1, b2, sub, s1, u_strike, u_sub];

        let replay = effective_state(&log);
        assert!(replay.rejected.is_empty());
        let state = replay.state;
        let event = state.event(&cell()).unwrap();
        assert_eq!(event.pitches.len(), 2);
        assert_eq!(event.balls, 2);
        assert_eq!(state.rosters[&0][0].current.id, "starter");
        assert!(state.rosters[&0][0].history.is_empty());
    }

    #[test]
    fn empty_log_yields_no_targets() {
        assert_eq!(undo_target(&[]), None);
        assert_eq!(redo_target(&[]), None);
        let replay = effective_state(&[]);
        assert!(!replay.state.started());
    }

    #[test]
    fn rejected_actions_are_reported_not_fatal() {
        let stray = pitch(PitchKind::Ball, 1);
        // Pitch before GAME_START: rejected, but the start that follows
        // still applies.
        let log = vec![stray.clone(), start()];
        let replay = effective_state(&log);
        assert!(replay.state.started());
        assert_eq!(replay.rejected.len(), 1);
        assert_eq!(replay.rejected[0].0, stray.id);
    }

    #[test]
    fn replay_is_idempotent_over_duplicate_application() {
        let a = pitch(PitchKind::Ball, 1);
        let log = vec![start(), a.clone()];
        let once = effective_state(&log).state;
        let twice = reduce(&once, &a).unwrap();
        // Re-applying the same pitch bumps counters — idempotence is enforced
        // at the log layer by id, so the same action never reaches the
        // reducer twice. This documents that contract.
        assert_ne!(
            state_digest(&once).unwrap(),
            state_digest(&twice).unwrap()
        );
    }
}
