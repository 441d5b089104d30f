// SPDX-License-Identifier: Apache-2.0
//! Persistent Raft state: hard state, log entries, and the latest snapshot.
//!
//! Everything lives under `<data-dir>/raft/` as JSON blobs written with
//! tmp-and-rename atomicity. The whole log is held in memory and rewritten
//! on change — scoring traffic is low-rate and the log is kept short by
//! compaction, so simplicity wins over an append-optimized format here.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use tally_proto::ClusterNode;

use crate::command::Command;

/// Raft term counter.
pub type Term = u64;
/// Raft log index (1-based; 0 means "nothing").
pub type LogIndex = u64;

/// What one log entry carries.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryPayload {
    /// Leader no-op appended on election to commit prior-term entries.
    Noop,
    /// A replicated FSM command.
    Command {
        /// The command.
        cmd: Command,
    },
    /// A membership change: the full post-change node list.
    Config {
        /// The new membership.
        nodes: Vec<ClusterNode>,
    },
}

/// One replicated log entry.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Entry {
    /// Position in the log.
    pub index: LogIndex,
    /// Term the entry was appended under.
    pub term: Term,
    /// The payload.
    pub payload: EntryPayload,
}

/// Durable vote/term state (must be fsynced before answering RPCs).
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct HardState {
    /// Highest term seen.
    pub term: Term,
    /// Who we voted for in `term`, if anyone.
    pub voted_for: Option<String>,
}

/// Metadata describing a snapshot.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Index of the last entry the snapshot covers.
    pub last_index: LogIndex,
    /// Term of that entry.
    pub last_term: Term,
    /// Membership as of the snapshot.
    pub nodes: Vec<ClusterNode>,
}

/// Storage failures.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem failure.
    #[error("raft storage io: {0}")]
    Io(#[from] std::io::Error),
    /// Corrupt persisted state.
    #[error("raft storage codec: {0}")]
    Codec(#[from] serde_json::Error),
}

const HARD_STATE_FILE: &str = "hard_state.json";
const LOG_FILE: &str = "log.json";
const SNAPSHOT_META_FILE: &str = "snapshot.json";
const SNAPSHOT_DATA_FILE: &str = "snapshot.bin";

/// Disk-backed Raft storage.
pub struct RaftStorage {
    dir: PathBuf,
    hard_state: HardState,
    /// Entries after the snapshot, ascending and contiguous.
    entries: Vec<Entry>,
    snapshot_meta: Option<SnapshotMeta>,
}

impl RaftStorage {
    /// Open (creating if needed) storage under `dir`.
    ///
    /// # Errors
    ///
    /// I/O and codec failures loading previously persisted state.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let hard_state = read_json(&dir.join(HARD_STATE_FILE))?.unwrap_or_default();
        let entries: Vec<Entry> = read_json(&dir.join(LOG_FILE))?.unwrap_or_default();
        let snapshot_meta = read_json(&dir.join(SNAPSHOT_META_FILE))?;
        Ok(Self {
            dir,
            hard_state,
            entries,
            snapshot_meta,
        })
    }

    /// Current hard state.
    pub fn hard_state(&self) -> &HardState {
        &self.hard_state
    }

    /// Persist new hard state before acting on it.
    ///
    /// # Errors
    ///
    /// I/O failures.
    pub fn save_hard_state(&mut self, hs: HardState) -> Result<(), StorageError> {
        write_json(&self.dir.join(HARD_STATE_FILE), &hs)?;
        self.hard_state = hs;
        Ok(())
    }

    /// Index of the first entry still in the log (post-compaction).
    pub fn first_index(&self) -> LogIndex {
        self.entries
            .first()
            .map(|e| e.index)
            .unwrap_or_else(|| self.snapshot_last_index() + 1)
    }

    /// Index of the newest entry (or the snapshot boundary when empty).
    pub fn last_index(&self) -> LogIndex {
        self.entries
            .last()
            .map(|e| e.index)
            .unwrap_or_else(|| self.snapshot_last_index())
    }

    /// Term of the newest entry (or the snapshot boundary when empty).
    pub fn last_term(&self) -> Term {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or_else(|| self.snapshot_meta.as_ref().map_or(0, |m| m.last_term))
    }

    /// Last index covered by the snapshot (0 when none).
    pub fn snapshot_last_index(&self) -> LogIndex {
        self.snapshot_meta.as_ref().map_or(0, |m| m.last_index)
    }

    /// Term of `index`, if derivable from the log or snapshot boundary.
    pub fn term_of(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if let Some(meta) = &self.snapshot_meta {
            if index == meta.last_index {
                return Some(meta.last_term);
            }
            if index < meta.last_index {
                return None;
            }
        }
        self.entry(index).map(|e| e.term)
    }

    /// The entry at `index`, when still present.
    pub fn entry(&self, index: LogIndex) -> Option<&Entry> {
        let first = self.first_index();
        if index < first {
            return None;
        }
        self.entries.get((index - first) as usize)
    }

    /// Entries in `[from, to]`, clamped to what is present.
    pub fn range(&self, from: LogIndex, to: LogIndex) -> Vec<Entry> {
        let mut out = Vec::new();
        for index in from..=to {
            match self.entry(index) {
                Some(entry) => out.push(entry.clone()),
                None => break,
            }
        }
        out
    }

    /// Append entries, truncating any conflicting suffix first, and persist.
    ///
    /// # Errors
    ///
    /// I/O failures.
    pub fn append(&mut self, new_entries: &[Entry]) -> Result<(), StorageError> {
        for entry in new_entries {
            if entry.index < self.first_index() {
                // Already covered by the snapshot; a retransmission.
                continue;
            }
            match self.entry(entry.index) {
                Some(existing) if existing.term == entry.term => continue,
                Some(_) => {
                    // Conflict: drop this and everything after it.
                    let first = self.first_index();
                    self.entries.truncate((entry.index - first) as usize);
                    self.entries.push(entry.clone());
                }
                None => self.entries.push(entry.clone()),
            }
        }
        self.persist_log()
    }

    /// Drop entries up to `to_index`, keeping `trailing` entries before it
    /// for slow followers.
    ///
    /// # Errors
    ///
    /// I/O failures.
    pub fn compact(&mut self, to_index: LogIndex, trailing: u64) -> Result<(), StorageError> {
        let cutoff = to_index.saturating_sub(trailing);
        let first = self.first_index();
        if cutoff < first {
            return Ok(());
        }
        self.entries.retain(|e| e.index > cutoff);
        self.persist_log()
    }

    /// Persist a snapshot (meta + FSM data) and drop entries it covers,
    /// keeping `trailing` entries.
    ///
    /// # Errors
    ///
    /// I/O failures.
    pub fn save_snapshot(
        &mut self,
        meta: SnapshotMeta,
        data: &[u8],
        trailing: u64,
    ) -> Result<(), StorageError> {
        write_bytes(&self.dir.join(SNAPSHOT_DATA_FILE), data)?;
        write_json(&self.dir.join(SNAPSHOT_META_FILE), &meta)?;
        let last = meta.last_index;
        self.snapshot_meta = Some(meta);
        self.entries.retain(|e| e.index > last.saturating_sub(trailing));
        // Entries at or below the boundary that survive the trailing window
        // stay only as replication fodder; drop any below the window.
        self.persist_log()
    }

    /// The stored snapshot, if any.
    ///
    /// # Errors
    ///
    /// I/O failures reading the data file.
    pub fn snapshot(&self) -> Result<Option<(SnapshotMeta, Vec<u8>)>, StorageError> {
        let Some(meta) = &self.snapshot_meta else {
            return Ok(None);
        };
        match fs::read(self.dir.join(SNAPSHOT_DATA_FILE)) {
            Ok(data) => Ok(Some((meta.clone(), data))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn persist_log(&self) -> Result<(), StorageError> {
        write_json(&self.dir.join(LOG_FILE), &self.entries)
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec(value)?;
    write_bytes(path, &bytes)
}

fn write_bytes(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let tmp = path.with_extension("tmp-write");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(index: LogIndex, term: Term) -> Entry {
        Entry {
            index,
            term,
            payload: EntryPayload::Noop,
        }
    }

    #[test]
    fn log_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut storage = RaftStorage::open(dir.path()).unwrap();
            storage
                .save_hard_state(HardState {
                    term: 3,
                    voted_for: Some("n1".into()),
                })
                .unwrap();
            storage.append(&[noop(1, 1), noop(2, 1), noop(3, 2)]).unwrap();
        }
        let storage = RaftStorage::open(dir.path()).unwrap();
        assert_eq!(storage.hard_state().term, 3);
        assert_eq!(storage.last_index(), 3);
        assert_eq!(storage.term_of(3), Some(2));
        assert_eq!(storage.first_index(), 1);
    }

    #[test]
    fn conflicting_suffix_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = RaftStorage::open(dir.path()).unwrap();
        storage.append(&[noop(1, 1), noop(2, 1), noop(3, 1)]).unwrap();
        // New leader overwrites index 2 with a higher term.
        storage.append(&[noop(2, 2)]).unwrap();
        assert_eq!(storage.last_index(), 2);
        assert_eq!(storage.term_of(2), Some(2));
        assert_eq!(storage.term_of(3), None);
    }

    #[test]
    fn snapshot_compacts_and_answers_boundary_terms() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = RaftStorage::open(dir.path()).unwrap();
        storage
            .append(&(1..=10).map(|i| noop(i, 1)).collect::<Vec<_>>())
            .unwrap();
        storage
            .save_snapshot(
                SnapshotMeta {
                    last_index: 8,
                    last_term: 1,
                    nodes: vec![],
                },
                b"{}",
                2,
            )
            .unwrap();
        assert_eq!(storage.first_index(), 7);
        assert_eq!(storage.last_index(), 10);
        assert_eq!(storage.term_of(8), Some(1));
        assert_eq!(storage.term_of(5), None);
        let (meta, data) = storage.snapshot().unwrap().unwrap();
        assert_eq!(meta.last_index, 8);
        assert_eq!(data, b"{}");
    }

    #[test]
    fn range_clamps_to_present_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = RaftStorage::open(dir.path()).unwrap();
        storage.append(&[noop(1, 1), noop(2, 1)]).unwrap();
        assert_eq!(storage.range(1, 5).len(), 2);
        assert_eq!(storage.range(3, 5).len(), 0);
    }
}
