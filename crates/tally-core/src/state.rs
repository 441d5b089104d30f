// SPDX-License-Identifier: Apache-2.0
//! Derived game state.
//!
//! [`GameState`] is a pure function of the action log: `replay(log)` produces
//! it, and nothing else mutates it. All collections are `BTreeMap`s so the
//! canonical JSON encoding (and therefore the state digest) is independent of
//! insertion order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::action::{ActionId, CellRef, GameMeta, HitData, PitchKind, Player};

/// State of one base-path segment for a runner.
///
/// Encoded as the integers `0` / `1` / `2` on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum PathState {
    /// Runner never reached this segment.
    #[default]
    Untouched,
    /// Runner reached safely.
    Safe,
    /// Runner was put out on this segment.
    Out,
}

impl PathState {
    /// Integer wire encoding.
    pub fn as_u8(self) -> u8 {
        match self {
            PathState::Untouched => 0,
            PathState::Safe => 1,
            PathState::Out => 2,
        }
    }

    /// Decode the integer wire encoding.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(PathState::Untouched),
            1 => Some(PathState::Safe),
            2 => Some(PathState::Out),
            _ => None,
        }
    }
}

impl Serialize for PathState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for PathState {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let v = u8::deserialize(deserializer)?;
        PathState::from_u8(v)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid path state {v}")))
    }
}

/// An entry in a PA's pitch sequence: either a pitch, or the boundary marker
/// left by a mid-PA substitution so undo can restore the prior player.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PitchMark {
    /// A recorded pitch.
    Pitch {
        /// What the pitch was.
        pitch: PitchKind,
    },
    /// Substitution boundary.
    Substitution {
        /// Id of the substitution action that created the boundary.
        #[serde(rename = "refId")]
        ref_id: ActionId,
    },
}

/// One scorebook column (one inning).
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Column {
    /// Column id, one based.
    pub id: u32,
    /// Header label (`"1"`, `"2"`, …).
    pub label: String,
}

/// Accumulated record of one plate appearance.
#[derive(Clone, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct PaEvent {
    /// The batter of record; survives [`CLEAR_DATA`](crate::ActionBody::ClearData).
    #[serde(rename = "pId", default, skip_serializing_if = "Option::is_none")]
    pub player_id: Option<String>,
    /// Ball count.
    pub balls: u8,
    /// Strike count (capped at 3 by the reducer).
    pub strikes: u8,
    /// Foul count; fouls past two strikes accumulate here without raising
    /// the strike count.
    pub fouls: u8,
    /// Scorebook outcome label (`"BB"`, `"K"`, `"DP 6-4-3"`, …).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    /// Which out of the half-inning the batter made, when out.
    #[serde(rename = "outNum", default, skip_serializing_if = "Option::is_none")]
    pub out_num: Option<u8>,
    /// Base-path segments, first through home.
    pub paths: [PathState; 4],
    /// Per-segment annotations.
    #[serde(rename = "pathInfo")]
    pub path_info: [Option<String>; 4],
    /// Per-segment out positions; `PO` records the conventional `0.2`.
    #[serde(rename = "outPos")]
    pub out_pos: [Option<f64>; 4],
    /// Ordered pitch sequence, including substitution boundary markers.
    #[serde(rename = "pitchSequence")]
    pub pitches: Vec<PitchMark>,
    /// Spray-chart data from the play result, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hit: Option<HitData>,
}

impl PaEvent {
    /// Reset counters and paths, preserving the player assignment.
    pub fn clear(&mut self) {
        let player_id = self.player_id.take();
        *self = PaEvent {
            player_id,
            ..PaEvent::default()
        };
    }

    /// Whether the runner crossed home safely.
    pub fn scored(&self) -> bool {
        self.paths[3] == PathState::Safe
    }
}

/// One batting-order slot of a roster.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct RosterSlot {
    /// The player currently occupying the slot. Never absent once the game
    /// has started.
    pub current: Player,
    /// Bench players attached to the slot.
    #[serde(default)]
    pub subs: Vec<Player>,
    /// Players pushed out of the slot by substitutions, oldest first.
    #[serde(default)]
    pub history: Vec<Player>,
}

/// The derived state of one game.
#[derive(Clone, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct GameState {
    /// Game metadata; `None` only before `GAME_START`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<GameMeta>,
    /// Scorebook columns, one per inning.
    pub columns: Vec<Column>,
    /// Rosters keyed by team index.
    pub rosters: BTreeMap<u8, Vec<RosterSlot>>,
    /// Plate-appearance events keyed `"{team}-{slot}-{column}"`.
    pub events: BTreeMap<String, PaEvent>,
    /// Outs per half-inning, keyed `"{team}-{column}"`.
    pub outs: BTreeMap<String, u8>,
    /// Current pitcher per team.
    pub pitchers: BTreeMap<u8, Player>,
    /// Previous pitchers per team, oldest first.
    #[serde(rename = "pitcherHistory")]
    pub pitcher_history: BTreeMap<u8, Vec<Player>>,
    /// Manual score overrides keyed `"{team}-{column}"`.
    pub overrides: BTreeMap<String, String>,
    /// Document access level set by admin commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<String>,
    /// Game note set by admin commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl GameState {
    /// Whether `GAME_START` has been applied.
    pub fn started(&self) -> bool {
        self.meta.is_some()
    }

    /// Key for the per-half-inning maps (`outs`, `overrides`).
    pub fn half_key(team: u8, column: u32) -> String {
        format!("{team}-{column}")
    }

    /// Look up the event for a cell.
    pub fn event(&self, cell: &CellRef) -> Option<&PaEvent> {
        self.events.get(&cell.key())
    }

    /// The event for a cell, created empty if absent.
    pub(crate) fn event_mut(&mut self, cell: &CellRef) -> &mut PaEvent {
        self.events.entry(cell.key()).or_default()
    }

    /// Outs currently recorded for a half-inning.
    pub fn outs_in(&self, team: u8, column: u32) -> u8 {
        self.outs
            .get(&GameState::half_key(team, column))
            .copied()
            .unwrap_or(0)
    }

    /// Runs calculated from the paths for one half-inning.
    pub fn calculated_score(&self, team: u8, column: u32) -> u32 {
        self.events
            .iter()
            .filter(|(key, event)| {
                event.scored()
                    && matches!(parse_cell_key(key), Some((t, _, c)) if t == team && c == column)
            })
            .count() as u32
    }

    /// The displayed score for a half-inning: the override when present,
    /// otherwise the calculated value.
    pub fn score_display(&self, team: u8, column: u32) -> String {
        match self.overrides.get(&GameState::half_key(team, column)) {
            Some(score) => score.clone(),
            None => self.calculated_score(team, column).to_string(),
        }
    }
}

/// Split an event-map key back into `(team, slot, column)`.
pub(crate) fn parse_cell_key(key: &str) -> Option<(u8, u8, u32)> {
    let mut parts = key.splitn(3, '-');
    let team = parts.next()?.parse().ok()?;
    let slot = parts.next()?.parse().ok()?;
    let column = parts.next()?.parse().ok()?;
    Some((team, slot, column))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_state_round_trips_as_integer() {
        for state in [PathState::Untouched, PathState::Safe, PathState::Out] {
            let json = serde_json::to_string(&state).unwrap();
            let back: PathState = serde_json::from_str(&json).unwrap();
            assert_eq!(state, back);
        }
        assert_eq!(serde_json::to_string(&PathState::Out).unwrap(), "2");
        assert!(serde_json::from_str::<PathState>("3").is_err());
    }

    #[test]
    fn clear_preserves_player_id() {
        let mut event = PaEvent {
            player_id: Some("p9".into()),
            balls: 3,
            strikes: 2,
            outcome: Some("BB".into()),
            ..PaEvent::default()
        };
        event.clear();
        assert_eq!(event.player_id.as_deref(), Some("p9"));
        assert_eq!(event.balls, 0);
        assert!(event.outcome.is_none());
    }

    #[test]
    fn calculated_score_counts_runs() {
        let mut state = GameState::default();
        let mut scored = PaEvent::default();
        scored.paths[3] = PathState::Safe;
        state.events.insert("0-0-1".into(), scored.clone());
        state.events.insert("0-4-1".into(), scored.clone());
        state.events.insert("0-2-2".into(), scored); // other inning
        state.events.insert("0-1-1".into(), PaEvent::default());
        assert_eq!(state.calculated_score(0, 1), 2);
        assert_eq!(state.score_display(0, 1), "2");
        state.overrides.insert("0-1".into(), "5".into());
        assert_eq!(state.score_display(0, 1), "5");
    }
}
