// SPDX-License-Identifier: Apache-2.0
//! The reducer: `reduce(state, action) → state`.
//!
//! Pure and total. An action that cannot be interpreted returns an error and
//! the caller keeps the previous state — nothing is ever half-applied. The
//! replay loop in [`crate::history`] records rejected actions and continues,
//! so one bad entry cannot poison a log.
//!
//! Invariants enforced here:
//! - `outNum` is monotone within a PA (the one sanctioned retreat is a
//!   dropped third strike, which arrives as a new generative `PLAY_RESULT`);
//! - the current player of a roster slot is never absent once `GAME_START`
//!   has been applied;
//! - strike counts cap at three, fouls never raise a two-strike count.

use thiserror::Error;

use crate::action::{
    Action, ActionBody, CellRef, GameStartPayload, LineupPayload, OutKind, PitchKind, PlayBase,
    PlayKind, PlayResult, PlayResultPayload, RunnerUpdate, SubstitutionPayload,
};
use crate::state::{Column, GameState, PathState, PitchMark, RosterSlot};

/// Conventional out position recorded for a pickoff.
const PICKOFF_OUT_POS: f64 = 0.2;

/// Reducer rejections. The state is untouched whenever one is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReduceError {
    /// A non-`GAME_START` action arrived before the game was started.
    #[error("game has not started")]
    NotStarted,
    /// `GAME_START` arrived on an already-started game.
    #[error("game already started")]
    AlreadyStarted,
    /// `GAME_START` carried unusable metadata.
    #[error("invalid game metadata: {0}")]
    InvalidMeta(&'static str),
    /// A roster operation referenced a slot that does not exist.
    #[error("unknown roster slot {slot} for team {team}")]
    UnknownSlot {
        /// Team index.
        team: u8,
        /// Slot index.
        slot: u8,
    },
    /// A play-result payload combined fields that have no interpretation.
    #[error("uninterpretable play: {0}")]
    InvalidPlay(&'static str),
    /// A runner update addressed a base path outside `0..=3`.
    #[error("invalid base path {0}")]
    InvalidPath(u8),
    /// A cell referenced column zero (columns are one based).
    #[error("invalid column 0")]
    InvalidColumn,
}

/// Apply one action to a state, producing the successor state.
///
/// # Errors
///
/// Any [`ReduceError`]; the input state is never modified (the successor is
/// built on a private clone that is discarded on error).
pub fn reduce(state: &GameState, action: &Action) -> Result<GameState, ReduceError> {
    let mut next = state.clone();
    match &action.body {
        ActionBody::GameStart(payload) => game_start(&mut next, payload)?,
        ActionBody::Pitch(payload) => {
            require_started(&next)?;
            require_cell(&payload.cell)?;
            pitch(&mut next, &payload.cell, payload.pitch);
        }
        ActionBody::PlayResult(payload) => {
            require_started(&next)?;
            require_cell(&payload.cell)?;
            play_result(&mut next, payload)?;
        }
        ActionBody::RunnerAdvance(payload) => {
            require_started(&next)?;
            for update in &payload.updates {
                apply_runner_update(&mut next, update)?;
            }
        }
        ActionBody::Substitution(payload) => {
            require_started(&next)?;
            substitution(&mut next, payload, action)?;
        }
        ActionBody::LineupUpdate(payload) => {
            require_started(&next)?;
            lineup_update(&mut next, payload);
        }
        ActionBody::ScoreOverride(payload) => {
            require_started(&next)?;
            let key = GameState::half_key(payload.team, payload.column);
            if payload.score.is_empty() {
                next.overrides.remove(&key);
            } else {
                next.overrides.insert(key, payload.score.clone());
            }
        }
        ActionBody::PitcherUpdate(payload) => {
            require_started(&next)?;
            set_pitcher(&mut next, payload.team, payload.pitcher.clone());
        }
        ActionBody::ClearData(payload) => {
            require_started(&next)?;
            if let Some(event) = next.events.get_mut(&payload.cell.key()) {
                event.clear();
            }
        }
        // UNDO has no direct effect; its meaning is realized by the replay
        // active-set walk in `history`.
        ActionBody::Undo(_) => {}
        ActionBody::AccessUpdate(payload) => {
            next.access = Some(payload.level.clone());
        }
        ActionBody::NoteUpdate(payload) => {
            require_started(&next)?;
            next.note = Some(payload.text.clone());
        }
    }
    Ok(next)
}

fn require_started(state: &GameState) -> Result<(), ReduceError> {
    if state.started() {
        Ok(())
    } else {
        Err(ReduceError::NotStarted)
    }
}

fn require_cell(cell: &CellRef) -> Result<(), ReduceError> {
    if cell.column == 0 {
        return Err(ReduceError::InvalidColumn);
    }
    Ok(())
}

fn game_start(state: &mut GameState, payload: &GameStartPayload) -> Result<(), ReduceError> {
    if state.started() {
        return Err(ReduceError::AlreadyStarted);
    }
    if payload.meta.innings == 0 {
        return Err(ReduceError::InvalidMeta("innings must be at least one"));
    }
    state.meta = Some(payload.meta.clone());
    state.columns = (1..=payload.meta.innings)
        .map(|id| Column {
            id,
            label: id.to_string(),
        })
        .collect();
    for lineup in &payload.lineups {
        let slots = lineup
            .slots
            .iter()
            .map(|slot| RosterSlot {
                current: slot.starter.clone(),
                subs: slot.subs.clone(),
                history: Vec::new(),
            })
            .collect();
        state.rosters.insert(lineup.team, slots);
    }
    for pitcher in &payload.pitchers {
        state.pitchers.insert(pitcher.team, pitcher.pitcher.clone());
    }
    Ok(())
}

/// Columns grow on demand past the seeded innings (extra innings).
fn ensure_column(state: &mut GameState, column: u32) {
    let max = state.columns.last().map_or(0, |c| c.id);
    for id in (max + 1)..=column {
        state.columns.push(Column {
            id,
            label: id.to_string(),
        });
    }
}

/// Stamp the batter of record onto a fresh event.
fn stamp_batter(state: &mut GameState, cell: &CellRef) {
    let batter = state
        .rosters
        .get(&cell.team)
        .and_then(|slots| slots.get(cell.slot as usize))
        .map(|slot| slot.current.id.clone());
    let event = state.event_mut(cell);
    if event.player_id.is_none() {
        event.player_id = batter;
    }
}

fn pitch(state: &mut GameState, cell: &CellRef, kind: PitchKind) {
    ensure_column(state, cell.column);
    stamp_batter(state, cell);
    let outs_before = state.outs_in(cell.team, cell.column);
    let event = state.event_mut(cell);
    event.pitches.push(PitchMark::Pitch { pitch: kind });
    match kind {
        PitchKind::Ball => {
            if event.balls < 4 {
                event.balls += 1;
            }
            if event.balls == 4 && event.outcome.is_none() {
                event.outcome = Some("BB".into());
                if event.paths[0] == PathState::Untouched {
                    event.paths[0] = PathState::Safe;
                }
            }
        }
        PitchKind::Strike | PitchKind::StrikeLooking => {
            if event.strikes < 3 {
                event.strikes += 1;
            }
            if event.strikes == 3 && event.outcome.is_none() {
                event.outcome = Some(
                    if kind == PitchKind::StrikeLooking {
                        "ꓘ"
                    } else {
                        "K"
                    }
                    .into(),
                );
                event.out_num = Some(outs_before + 1);
                let key = GameState::half_key(cell.team, cell.column);
                state.outs.insert(key, outs_before + 1);
            }
        }
        PitchKind::Foul => {
            event.fouls = event.fouls.saturating_add(1);
            if event.strikes < 2 {
                event.strikes += 1;
            }
        }
    }
}

fn play_result(state: &mut GameState, payload: &PlayResultPayload) -> Result<(), ReduceError> {
    // Interpret before mutating so an uninterpretable payload rejects whole.
    let outcome_core = outcome_label(payload)?;

    ensure_column(state, payload.cell.column);
    stamp_batter(state, &payload.cell);

    // Runner movements are part of the same play; their outs land first so
    // the batter takes the last out number of a double play.
    let mut play_outs: u8 = 0;
    for update in &payload.runners {
        if apply_runner_update(state, update)? {
            play_outs += 1;
        }
    }

    match payload.res {
        PlayResult::Safe => {
            let reach = match payload.play {
                PlayKind::Hit => payload
                    .base
                    .ok_or(ReduceError::InvalidPlay("safe hit without a base"))?,
                _ => PlayBase::First,
            };
            // A dropped third strike negates the strikeout's out.
            if payload.play == PlayKind::D3 {
                let key = GameState::half_key(payload.cell.team, payload.cell.column);
                let had_out = state
                    .events
                    .get(&payload.cell.key())
                    .and_then(|e| e.out_num)
                    .is_some();
                if had_out {
                    let outs = state.outs.entry(key).or_insert(0);
                    *outs = outs.saturating_sub(1);
                }
            }
            let event = state.event_mut(&payload.cell);
            event.outcome = Some(outcome_core);
            event.out_num = None;
            let reached = match reach {
                PlayBase::First => 0,
                PlayBase::Second => 1,
                PlayBase::Third => 2,
                PlayBase::Home => 3,
            };
            for path in &mut event.paths[..=reached] {
                if *path == PathState::Untouched {
                    *path = PathState::Safe;
                }
            }
            event.hit = payload.hit.clone();
        }
        PlayResult::Out => {
            let total_outs = play_outs + 1;
            let prefix = match total_outs {
                2 => "DP ",
                3 => "TP ",
                _ => "",
            };
            let outs_after = state.outs_in(payload.cell.team, payload.cell.column) + 1;
            let key = GameState::half_key(payload.cell.team, payload.cell.column);
            state.outs.insert(key, outs_after);
            let event = state.event_mut(&payload.cell);
            event.outcome = Some(format!("{prefix}{outcome_core}"));
            event.out_num = Some(outs_after);
            event.hit = payload.hit.clone();
        }
    }
    Ok(())
}

/// The outcome label before any DP/TP prefix.
fn outcome_label(payload: &PlayResultPayload) -> Result<String, ReduceError> {
    let seq = payload.seq.join("-");
    match (payload.res, payload.play) {
        (PlayResult::Safe, PlayKind::Hit) => {
            let base = payload
                .base
                .ok_or(ReduceError::InvalidPlay("safe hit without a base"))?;
            Ok(base.label().to_string())
        }
        (PlayResult::Safe, PlayKind::Err) => Ok(format!("E-{seq}")),
        (PlayResult::Safe, PlayKind::Fc) => Ok(format!("FC {seq}")),
        (PlayResult::Safe, PlayKind::D3) => {
            if seq.is_empty() {
                Ok("D3".into())
            } else {
                Ok(format!("D3 {seq}"))
            }
        }
        (PlayResult::Safe, _) => Err(ReduceError::InvalidPlay("safe result on an out play kind")),
        (PlayResult::Out, PlayKind::Fly) => Ok(format!("F{seq}")),
        (PlayResult::Out, PlayKind::Line) => Ok(format!("L{seq}")),
        (PlayResult::Out, PlayKind::Iff) => Ok(format!("IFF{seq}")),
        (PlayResult::Out, PlayKind::Ground) => Ok(seq),
        (PlayResult::Out, _) => Err(ReduceError::InvalidPlay("out result on a reach play kind")),
    }
}

/// Apply one runner path mutation. Returns whether it recorded an out.
fn apply_runner_update(state: &mut GameState, update: &RunnerUpdate) -> Result<bool, ReduceError> {
    require_cell(&update.cell)?;
    if update.path > 3 {
        return Err(ReduceError::InvalidPath(update.path));
    }
    ensure_column(state, update.cell.column);
    let path = update.path as usize;
    let is_out = update.state == PathState::Out && update.out.is_some();
    if is_out {
        let key = GameState::half_key(update.cell.team, update.cell.column);
        let outs = state.outs.entry(key).or_insert(0);
        *outs = outs.saturating_add(1);
    }
    let event = state.event_mut(&update.cell);
    event.paths[path] = update.state;
    if let Some(info) = &update.info {
        event.path_info[path] = Some(info.clone());
    }
    if is_out {
        let pos = match update.out {
            Some(OutKind::Po) => Some(update.pos.unwrap_or(PICKOFF_OUT_POS)),
            _ => update.pos,
        };
        event.out_pos[path] = pos;
    }
    Ok(is_out)
}

fn substitution(
    state: &mut GameState,
    payload: &SubstitutionPayload,
    action: &Action,
) -> Result<(), ReduceError> {
    let slots = state
        .rosters
        .get_mut(&payload.team)
        .ok_or(ReduceError::UnknownSlot {
            team: payload.team,
            slot: payload.slot,
        })?;
    let slot = slots
        .get_mut(payload.slot as usize)
        .ok_or(ReduceError::UnknownSlot {
            team: payload.team,
            slot: payload.slot,
        })?;
    let outgoing = std::mem::replace(&mut slot.current, payload.player.clone());
    slot.history.push(outgoing);
    slot.subs.retain(|p| p.id != payload.player.id);

    // Mid-PA: leave a boundary marker so undo can resolve who was batting.
    if let Some(cell) = &payload.cell {
        require_cell(cell)?;
        ensure_column(state, cell.column);
        let player_id = payload.player.id.clone();
        let event = state.event_mut(cell);
        event.pitches.push(PitchMark::Substitution { ref_id: action.id });
        event.player_id = Some(player_id);
    }
    Ok(())
}

fn lineup_update(state: &mut GameState, payload: &LineupPayload) {
    let old = state.rosters.remove(&payload.team).unwrap_or_default();
    let slots = payload
        .slots
        .iter()
        .enumerate()
        .map(|(i, slot)| match old.get(i) {
            // Same occupant: the slot keeps its substitution history.
            Some(prev) if prev.current.id == slot.starter.id => RosterSlot {
                current: prev.current.clone(),
                subs: slot.subs.clone(),
                history: prev.history.clone(),
            },
            _ => RosterSlot {
                current: slot.starter.clone(),
                subs: slot.subs.clone(),
                history: Vec::new(),
            },
        })
        .collect();
    state.rosters.insert(payload.team, slots);
}

fn set_pitcher(state: &mut GameState, team: u8, pitcher: crate::action::Player) {
    if let Some(previous) = state.pitchers.get(&team) {
        if previous.id != pitcher.id {
            state
                .pitcher_history
                .entry(team)
                .or_default()
                .push(previous.clone());
        }
    }
    state.pitchers.insert(team, pitcher);
}
