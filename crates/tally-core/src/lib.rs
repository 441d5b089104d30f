// SPDX-License-Identifier: Apache-2.0
//! tally-core: deterministic event-sourced scoring engine.
//!
//! A game is an append-only log of [`Action`]s; replaying the log yields the
//! canonical [`GameState`]. Everything in this crate is pure and synchronous:
//! no I/O, no clocks, no randomness. Two nodes holding the same log produce
//! byte-identical state after canonical encoding, which is what the
//! replication and sync layers build on.
//!
//! The main entry points:
//!
//! - [`ActionLog::append`] / [`ActionLog::replay`] — the document and its
//!   deterministic materialization.
//! - [`history`] — undo/redo target derivation over the interleaved
//!   [`UndoPayload`] protocol.
//! - [`conflict::classify`] — LINEAR / FORK / DIVERGED classification for two
//!   branches sharing a common ancestor.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(clippy::module_name_repetitions, clippy::use_self)]

mod action;
mod canonical;
pub mod conflict;
pub mod history;
mod log;
mod reduce;
mod state;

pub use action::{
    ActionBody, ActionId, ActionKind, CellRef, ClearDataPayload, GameMeta, GameStartPayload,
    HitData, LineupPayload, LineupSlot, NotePayload, OutKind, PitchKind, PitchPayload,
    PitcherPayload, PlayBase, PlayKind, PlayResult, PlayResultPayload, Player, RunnerPayload,
    RunnerUpdate, ScoreOverridePayload, SubstitutionPayload, UndoPayload,
};
pub use action::{AccessPayload, Action};
pub use canonical::{canonical_bytes, state_digest, Digest};
pub use conflict::{Conflict, ConflictKind, Resolution};
pub use log::{ActionLog, AppendOutcome, LogError, Replay};
pub use reduce::{reduce, ReduceError};
pub use state::{Column, GameState, PaEvent, PathState, PitchMark, RosterSlot};
