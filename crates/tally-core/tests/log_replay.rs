// SPDX-License-Identifier: Apache-2.0
//! End-to-end log replay tests: determinism, idempotence, and the undo
//! protocol exercised through the public `ActionLog` API.

use tally_core::{
    state_digest, Action, ActionBody, ActionId, ActionLog, AppendOutcome, CellRef, GameMeta,
    GameStartPayload, LineupPayload, LineupSlot, PathState, PitchKind, PitchPayload, Player,
    UndoPayload,
};

fn player(id: &str) -> Player {
    Player {
        id: id.into(),
        name: id.to_uppercase(),
        number: None,
    }
}

fn start() -> Action {
    Action::new(
        ActionBody::GameStart(GameStartPayload {
            meta: GameMeta {
                title: "season opener".into(),
                date: "2026-04-01".into(),
                away: "Aves".into(),
                home: "Herons".into(),
                innings: 7,
            },
            lineups: vec![LineupPayload {
                team: 0,
                slots: (0..9)
                    .map(|i| LineupSlot {
                        starter: player(&format!("a{i}")),
                        subs: vec![],
                    })
                    .collect(),
            }],
            pitchers: vec![],
        }),
        1_700_000_000_000,
        None,
    )
}

fn cell() -> CellRef {
    CellRef {
        team: 0,
        slot: 0,
        column: 1,
    }
}

fn pitch(kind: PitchKind, ts: i64, parent: Option<ActionId>) -> Action {
    Action::new(
        ActionBody::Pitch(PitchPayload {
            cell: cell(),
            pitch: kind,
        }),
        ts,
        parent,
    )
}

#[test]
fn replay_is_deterministic_across_independent_logs() {
    let build = || {
        let mut log = ActionLog::new("g1", start()).unwrap();
        let mut tip = log.revision();
        for (i, kind) in [
            PitchKind::Ball,
            PitchKind::Strike,
            PitchKind::Foul,
            PitchKind::Ball,
        ]
        .into_iter()
        .enumerate()
        {
            let action = pitch(kind, 10 + i as i64, Some(tip));
            tip = action.id;
            log.append(action).unwrap();
        }
        log
    };
    let a = build();
    let b = build();
    let da = state_digest(&a.replay().state).unwrap();
    let db = state_digest(&b.replay().state).unwrap();
    assert_eq!(da, db, "two nodes replaying the same log must agree");

    // Byte-for-byte, not just digest-level.
    let bytes_a = tally_core::canonical_bytes(&a.replay().state).unwrap();
    let bytes_b = tally_core::canonical_bytes(&b.replay().state).unwrap();
    assert_eq!(bytes_a, bytes_b);
}

#[test]
fn duplicate_delivery_is_idempotent() {
    let mut log = ActionLog::new("g1", start()).unwrap();
    let action = pitch(PitchKind::Ball, 10, None);
    assert_eq!(log.append(action.clone()).unwrap(), AppendOutcome::Appended);
    let digest_once = state_digest(&log.replay().state).unwrap();
    assert_eq!(log.append(action).unwrap(), AppendOutcome::Duplicate);
    let digest_twice = state_digest(&log.replay().state).unwrap();
    assert_eq!(digest_once, digest_twice);
}

#[test]
fn four_balls_walk_through_the_log_api() {
    let mut log = ActionLog::new("g1", start()).unwrap();
    for i in 0..4 {
        log.append(pitch(PitchKind::Ball, 10 + i, None)).unwrap();
    }
    let replay = log.replay();
    assert!(replay.rejected.is_empty());
    let event = replay.state.event(&cell()).unwrap();
    assert_eq!(event.balls, 4);
    assert_eq!(event.outcome.as_deref(), Some("BB"));
    assert_eq!(event.paths[0], PathState::Safe);
}

#[test]
fn undo_round_trip_restores_the_original_state() {
    let mut log = ActionLog::new("g1", start()).unwrap();
    let a = pitch(PitchKind::Strike, 10, None);
    log.append(a.clone()).unwrap();
    let digest_with_a = state_digest(&log.replay().state).unwrap();

    let u1 = Action::new(ActionBody::Undo(UndoPayload { ref_id: a.id }), 11, None);
    log.append(u1.clone()).unwrap();
    let digest_without_a = state_digest(&log.replay().state).unwrap();
    assert_ne!(digest_with_a, digest_without_a);

    let u2 = Action::new(ActionBody::Undo(UndoPayload { ref_id: u1.id }), 12, None);
    log.append(u2).unwrap();
    let digest_redone = state_digest(&log.replay().state).unwrap();
    assert_eq!(digest_with_a, digest_redone);
}

#[test]
fn undo_targets_follow_the_linear_barrier_rule() {
    let mut log = ActionLog::new("g1", start()).unwrap();
    let a = pitch(PitchKind::Ball, 10, None);
    log.append(a.clone()).unwrap();
    let undo = Action::new(ActionBody::Undo(UndoPayload { ref_id: a.id }), 11, None);
    log.append(undo.clone()).unwrap();
    assert_eq!(
        tally_core::history::redo_target(log.actions()),
        Some(undo.id)
    );

    // New generative work clears the redo stack.
    let b = pitch(PitchKind::Strike, 12, None);
    log.append(b.clone()).unwrap();
    assert_eq!(tally_core::history::redo_target(log.actions()), None);
    assert_eq!(tally_core::history::undo_target(log.actions()), Some(b.id));
}

#[test]
fn log_survives_a_serialization_round_trip_with_identical_replay() {
    let mut log = ActionLog::new("g1", start()).unwrap();
    for i in 0..3 {
        log.append(pitch(PitchKind::Ball, 10 + i, None)).unwrap();
    }
    let json = serde_json::to_vec(&log).unwrap();
    let back: ActionLog = serde_json::from_slice(&json).unwrap();
    assert_eq!(
        state_digest(&log.replay().state).unwrap(),
        state_digest(&back.replay().state).unwrap()
    );
    assert_eq!(log.revision(), back.revision());
}
