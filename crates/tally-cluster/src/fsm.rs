// SPDX-License-Identifier: Apache-2.0
//! The replicated state machine.
//!
//! Consumes the totally ordered command stream Raft commits and folds it
//! into the store. Apply is deterministic: same commands, same order, same
//! resulting blobs on every node.
//!
//! Failure split: a command that cannot be interpreted (bad log, reducer
//! rejection) fails *that command* and the stream continues; a store write
//! failure is fatal — the node must halt so Raft can isolate it rather than
//! let its state silently diverge.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use tally_core::{Action, ActionBody, ActionId, ActionLog, AppendOutcome, PitcherPayload};
use tally_proto::ClusterNode;
use tally_store::{get_json, keys, KVStore, StoreError};

use crate::command::{Command, GameDoc, SaveGamePayload};

/// Current schema version stamped into `fsm_state.json` and snapshots.
pub const SCHEMA_VERSION: u32 = 2;

/// The blobs a snapshot governs, exactly. Everything a fresh follower needs
/// to serve reads and keep applying.
pub const GOVERNED_PREFIXES: &[&str] = &[
    keys::GAMES_PREFIX,
    keys::TEAMS_PREFIX,
    keys::SYS_ACCESS_POLICY,
    keys::NODES,
    keys::METRICS,
    keys::FSM_STATE,
];

/// How many applies may pass between `fsm_state.json` writes.
const PERSIST_EVERY: u64 = 32;

/// Shared handle to the node's store. Writers (the FSM) take the write half;
/// HTTP read paths take the read half. Critical sections never do I/O beyond
/// the single blob operation.
pub type SharedStore = Arc<RwLock<Box<dyn KVStore>>>;

/// Fatal FSM failures. Command-level rejections are [`ApplyOutcome::Rejected`].
#[derive(Debug, Error)]
pub enum FsmError {
    /// The store failed; the node must halt.
    #[error("fatal store failure: {0}")]
    Storage(#[from] StoreError),
    /// A snapshot blob could not be encoded or decoded.
    #[error("snapshot codec failure: {0}")]
    SnapshotCodec(#[from] serde_json::Error),
    /// A restore carried an incompatible schema version.
    #[error("unsupported snapshot schema version {0} (this node speaks {SCHEMA_VERSION})")]
    SchemaVersion(u32),
}

/// Outcome of applying one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The command took effect.
    Applied {
        /// New tip revision, for game-mutating commands.
        revision: Option<ActionId>,
    },
    /// The command was refused; the stream continues.
    Rejected {
        /// Human-readable reason, surfaced to the proposer.
        reason: String,
    },
}

/// Events published after a successful apply, consumed by the per-game
/// session hubs. The FSM never holds a reference back into the hub — it only
/// writes to this channel (no cycles).
#[derive(Debug, Clone)]
pub enum FsmEvent {
    /// One action was appended to a game.
    ActionCommitted {
        /// The game.
        game_id: String,
        /// The committed action.
        action: Action,
        /// Tip after the append.
        revision: ActionId,
    },
    /// A game's log was replaced wholesale.
    GameReplaced {
        /// The game.
        game_id: String,
        /// Tip of the replacement log.
        revision: ActionId,
    },
    /// A game was deleted.
    GameDeleted {
        /// The game.
        game_id: String,
    },
}

/// `fsm_state.json` contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsmStateBlob {
    /// Index of the last command folded into the store.
    #[serde(rename = "lastAppliedIndex")]
    pub last_applied_index: u64,
    /// Schema version of the persisted layout.
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
}

/// Rolling per-node counters, owned by the FSM and snapshotted with the rest
/// of state (`metrics.json`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsRegistry {
    /// Monotonic counters by name.
    #[serde(default)]
    pub counters: BTreeMap<String, u64>,
    /// Last acknowledged revision per `"{game_id}:{session_id}"`.
    #[serde(default, rename = "lastAcks")]
    pub last_acks: BTreeMap<String, ActionId>,
}

impl MetricsRegistry {
    /// Increment one counter.
    pub fn bump(&mut self, name: &str, by: u64) {
        *self.counters.entry(name.to_string()).or_default() += by;
    }
}

/// Serialized snapshot payload: every governed blob, hex-encoded.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotData {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,
    #[serde(rename = "lastAppliedIndex")]
    last_applied_index: u64,
    blobs: BTreeMap<String, String>,
}

/// The replicated state machine.
pub struct Fsm {
    store: SharedStore,
    metrics: MetricsRegistry,
    last_applied: u64,
    events: Option<UnboundedSender<FsmEvent>>,
}

impl Fsm {
    /// Build an FSM over a shared store, warming bookkeeping from any
    /// previously persisted `fsm_state.json` / `metrics.json`.
    ///
    /// # Errors
    ///
    /// Store read failures.
    pub fn new(store: SharedStore, events: Option<UnboundedSender<FsmEvent>>) -> Result<Self, FsmError> {
        let (last_applied, metrics) = {
            let guard = read_store(&store);
            let state: Option<FsmStateBlob> = get_json(guard.as_ref(), keys::FSM_STATE)?;
            let metrics: Option<MetricsRegistry> = get_json(guard.as_ref(), keys::METRICS)?;
            (
                state.map(|s| s.last_applied_index).unwrap_or(0),
                metrics.unwrap_or_default(),
            )
        };
        Ok(Self {
            store,
            metrics,
            last_applied,
            events,
        })
    }

    /// The shared store handle (read paths in the daemon use this).
    pub fn store(&self) -> SharedStore {
        Arc::clone(&self.store)
    }

    /// Index of the last applied command.
    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    /// A read-only view of the metrics registry.
    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// Apply one committed command at `index`.
    ///
    /// # Errors
    ///
    /// Only fatal store/codec failures; interpretation problems are
    /// [`ApplyOutcome::Rejected`].
    pub fn apply(&mut self, index: u64, cmd: &Command) -> Result<ApplyOutcome, FsmError> {
        if index <= self.last_applied {
            // Replays after restart are expected; committed effects stand.
            debug!(index, last_applied = self.last_applied, "skipping stale apply");
            return Ok(ApplyOutcome::Applied { revision: None });
        }
        let outcome = match cmd {
            Command::SaveGame { game_id, payload } => self.save_game(game_id, payload)?,
            Command::SaveTeam { team } => {
                let mut guard = write_store(&self.store);
                tally_store::put_json(guard.as_mut(), &keys::team(&team.id), team)?;
                ApplyOutcome::Applied { revision: None }
            }
            Command::DeleteGame { game_id } => {
                let mut guard = write_store(&self.store);
                guard.delete(&keys::game(game_id))?;
                drop(guard);
                self.publish(FsmEvent::GameDeleted {
                    game_id: game_id.clone(),
                });
                ApplyOutcome::Applied { revision: None }
            }
            Command::DeleteTeam { team_id } => {
                let mut guard = write_store(&self.store);
                guard.delete(&keys::team(team_id))?;
                ApplyOutcome::Applied { revision: None }
            }
            Command::UpdateAccessPolicy { policy } => {
                let mut guard = write_store(&self.store);
                tally_store::put_json(guard.as_mut(), keys::SYS_ACCESS_POLICY, policy)?;
                ApplyOutcome::Applied { revision: None }
            }
            Command::MetricsUpdate { delta } => {
                for (name, by) in &delta.counters {
                    self.metrics.bump(name, *by);
                }
                self.persist_metrics()?;
                ApplyOutcome::Applied { revision: None }
            }
            Command::SetPitcher {
                game_id,
                team,
                pitcher,
                timestamp,
            } => {
                let action = Action::new(
                    ActionBody::PitcherUpdate(PitcherPayload {
                        team: *team,
                        pitcher: pitcher.clone(),
                    }),
                    *timestamp,
                    None,
                );
                self.save_game(game_id, &SaveGamePayload::Append { action })?
            }
            Command::SubscribeAck {
                game_id,
                session_id,
                revision,
            } => {
                self.metrics.bump("subscribe_acks", 1);
                self.metrics
                    .last_acks
                    .insert(format!("{game_id}:{session_id}"), *revision);
                self.persist_metrics()?;
                ApplyOutcome::Applied { revision: None }
            }
        };
        self.last_applied = index;
        if index % PERSIST_EVERY == 0 {
            self.persist_fsm_state()?;
        }
        Ok(outcome)
    }

    fn save_game(
        &mut self,
        game_id: &str,
        payload: &SaveGamePayload,
    ) -> Result<ApplyOutcome, FsmError> {
        match payload {
            SaveGamePayload::Log { log } => {
                if log.game_id() != game_id {
                    return Ok(ApplyOutcome::Rejected {
                        reason: format!(
                            "log belongs to game {:?}, not {game_id:?}",
                            log.game_id()
                        ),
                    });
                }
                let doc = GameDoc::materialize(log.clone());
                let revision = doc.revision;
                {
                    let mut guard = write_store(&self.store);
                    tally_store::put_json(guard.as_mut(), &keys::game(game_id), &doc)?;
                }
                self.metrics.bump("games_saved", 1);
                self.persist_metrics()?;
                self.publish(FsmEvent::GameReplaced {
                    game_id: game_id.to_string(),
                    revision,
                });
                Ok(ApplyOutcome::Applied {
                    revision: Some(revision),
                })
            }
            SaveGamePayload::Append { action } => self.append_action(game_id, action),
        }
    }

    fn append_action(&mut self, game_id: &str, action: &Action) -> Result<ApplyOutcome, FsmError> {
        let existing: Option<GameDoc> = {
            let guard = read_store(&self.store);
            get_json(guard.as_ref(), &keys::game(game_id))?
        };
        let mut doc = match existing {
            Some(doc) => doc,
            None => {
                // The only action that can create a document is GAME_START.
                let log = match ActionLog::new(game_id, action.clone()) {
                    Ok(log) => log,
                    Err(err) => {
                        return Ok(ApplyOutcome::Rejected {
                            reason: format!("cannot create game {game_id:?}: {err}"),
                        })
                    }
                };
                let doc = GameDoc::materialize(log);
                let revision = doc.revision;
                {
                    let mut guard = write_store(&self.store);
                    tally_store::put_json(guard.as_mut(), &keys::game(game_id), &doc)?;
                }
                self.metrics.bump("actions_committed", 1);
                self.persist_metrics()?;
                self.publish(FsmEvent::ActionCommitted {
                    game_id: game_id.to_string(),
                    action: action.clone(),
                    revision,
                });
                return Ok(ApplyOutcome::Applied {
                    revision: Some(revision),
                });
            }
        };

        // Validate against the materialized tip before touching the log so a
        // rejected action leaves the document untouched.
        if action.is_generative() {
            if let Err(err) = tally_core::reduce(&doc.state, action) {
                return Ok(ApplyOutcome::Rejected {
                    reason: format!("reducer rejected {}: {err}", action.body.tag()),
                });
            }
        }
        match doc.log.append(action.clone()) {
            Ok(AppendOutcome::Appended) => {}
            Ok(AppendOutcome::Duplicate) => {
                // Idempotent retry; committed effects stand, nothing to emit.
                return Ok(ApplyOutcome::Applied {
                    revision: Some(doc.revision),
                });
            }
            Err(err) => {
                return Ok(ApplyOutcome::Rejected {
                    reason: format!("log rejected {}: {err}", action.body.tag()),
                });
            }
        }
        // Undo rewrites the effective history; recompute from the log. A
        // generative append folds onto the cached state.
        doc.state = if action.is_generative() {
            match tally_core::reduce(&doc.state, action) {
                Ok(state) => state,
                Err(_) => doc.log.replay().state,
            }
        } else {
            doc.log.replay().state
        };
        doc.revision = doc.log.revision();
        let revision = doc.revision;
        {
            let mut guard = write_store(&self.store);
            tally_store::put_json(guard.as_mut(), &keys::game(game_id), &doc)?;
        }
        self.metrics.bump("actions_committed", 1);
        self.persist_metrics()?;
        self.publish(FsmEvent::ActionCommitted {
            game_id: game_id.to_string(),
            action: action.clone(),
            revision,
        });
        Ok(ApplyOutcome::Applied {
            revision: Some(revision),
        })
    }

    /// Fold a committed membership change into `nodes.json` so membership
    /// survives snapshots and restarts.
    ///
    /// # Errors
    ///
    /// Store write failures (fatal).
    pub fn apply_membership(&mut self, index: u64, nodes: &[ClusterNode]) -> Result<(), FsmError> {
        if index <= self.last_applied {
            return Ok(());
        }
        {
            let mut guard = write_store(&self.store);
            tally_store::put_json(guard.as_mut(), keys::NODES, &nodes.to_vec())?;
        }
        self.last_applied = index;
        Ok(())
    }

    /// Capture a consistent point-in-time snapshot of every governed blob.
    ///
    /// # Errors
    ///
    /// Store read failures and snapshot encoding failures.
    pub fn snapshot(&mut self) -> Result<Vec<u8>, FsmError> {
        // Make the captured fsm_state.json carry the exact applied index.
        self.persist_fsm_state()?;
        let guard = read_store(&self.store);
        let mut blobs = BTreeMap::new();
        for prefix in GOVERNED_PREFIXES {
            for key in guard.list(prefix)? {
                if let Some(bytes) = guard.get(&key)? {
                    blobs.insert(key, hex::encode(bytes));
                }
            }
        }
        drop(guard);
        let data = SnapshotData {
            schema_version: SCHEMA_VERSION,
            last_applied_index: self.last_applied,
            blobs,
        };
        Ok(serde_json::to_vec(&data)?)
    }

    /// Restore from a snapshot: replace every governed blob and warm the
    /// in-memory registries from the restored store.
    ///
    /// # Errors
    ///
    /// Codec failures, schema mismatches beyond one version back, and store
    /// write failures.
    pub fn restore(&mut self, data: &[u8]) -> Result<(), FsmError> {
        let snapshot: SnapshotData = serde_json::from_slice(data)?;
        if snapshot.schema_version != SCHEMA_VERSION
            && snapshot.schema_version + 1 != SCHEMA_VERSION
        {
            return Err(FsmError::SchemaVersion(snapshot.schema_version));
        }
        {
            let mut guard = write_store(&self.store);
            // Drop anything governed that the snapshot does not carry.
            for prefix in GOVERNED_PREFIXES {
                for key in guard.list(prefix)? {
                    if !snapshot.blobs.contains_key(&key) {
                        guard.delete(&key)?;
                    }
                }
            }
            for (key, encoded) in &snapshot.blobs {
                let bytes = hex::decode(encoded).map_err(|_| {
                    FsmError::SnapshotCodec(serde::de::Error::custom("bad blob hex"))
                })?;
                guard.put(key, &bytes)?;
            }
        }
        self.last_applied = snapshot.last_applied_index;
        // Warm caches from the restored blobs.
        let metrics = {
            let guard = read_store(&self.store);
            get_json::<MetricsRegistry>(guard.as_ref(), keys::METRICS)?
        };
        self.metrics = metrics.unwrap_or_default();
        self.persist_fsm_state()?;
        Ok(())
    }

    /// Force a `fsm_state.json` write (shutdown path).
    ///
    /// # Errors
    ///
    /// Store write failures.
    pub fn persist_fsm_state(&mut self) -> Result<(), FsmError> {
        let blob = FsmStateBlob {
            last_applied_index: self.last_applied,
            schema_version: SCHEMA_VERSION,
        };
        let mut guard = write_store(&self.store);
        tally_store::put_json(guard.as_mut(), keys::FSM_STATE, &blob)?;
        Ok(())
    }

    fn persist_metrics(&mut self) -> Result<(), FsmError> {
        let mut guard = write_store(&self.store);
        tally_store::put_json(guard.as_mut(), keys::METRICS, &self.metrics)?;
        Ok(())
    }

    fn publish(&self, event: FsmEvent) {
        if let Some(events) = &self.events {
            if events.send(event).is_err() {
                warn!("fsm event channel closed; hub gone");
            }
        }
    }
}

fn read_store(store: &SharedStore) -> std::sync::RwLockReadGuard<'_, Box<dyn KVStore>> {
    store.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_store(store: &SharedStore) -> std::sync::RwLockWriteGuard<'_, Box<dyn KVStore>> {
    store.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{
        CellRef, GameMeta, GameStartPayload, PitchKind, PitchPayload, Player,
    };
    use tally_store::MemoryStore;

    fn shared_store() -> SharedStore {
        Arc::new(RwLock::new(Box::new(MemoryStore::new()) as Box<dyn KVStore>))
    }

    fn start_action() -> Action {
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

    fn pitch_action(ts: i64) -> Action {
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
            None,
        )
    }

    fn append_cmd(game_id: &str, action: Action) -> Command {
        Command::SaveGame {
            game_id: game_id.into(),
            payload: SaveGamePayload::Append { action },
        }
    }

    #[test]
    fn append_creates_then_extends_a_game() {
        let mut fsm = Fsm::new(shared_store(), None).unwrap();
        let outcome = fsm.apply(1, &append_cmd("g1", start_action())).unwrap();
        assert!(matches!(outcome, ApplyOutcome::Applied { revision: Some(_) }));

        let pitch = pitch_action(5);
        let outcome = fsm.apply(2, &append_cmd("g1", pitch.clone())).unwrap();
        match outcome {
            ApplyOutcome::Applied { revision } => assert_eq!(revision, Some(pitch.id)),
            other => panic!("unexpected outcome {other:?}"),
        }

        let store = fsm.store();
        let guard = store.read().unwrap();
        let doc: GameDoc = get_json(guard.as_ref(), "games/g1").unwrap().unwrap();
        assert_eq!(doc.log.len(), 2);
        assert_eq!(doc.state.event(&CellRef { team: 0, slot: 0, column: 1 }).unwrap().balls, 1);
    }

    #[test]
    fn duplicate_append_is_idempotent() {
        let mut fsm = Fsm::new(shared_store(), None).unwrap();
        fsm.apply(1, &append_cmd("g1", start_action())).unwrap();
        let pitch = pitch_action(5);
        fsm.apply(2, &append_cmd("g1", pitch.clone())).unwrap();
        let outcome = fsm.apply(3, &append_cmd("g1", pitch.clone())).unwrap();
        assert!(matches!(outcome, ApplyOutcome::Applied { revision: Some(r) } if r == pitch.id));
        let store = fsm.store();
        let guard = store.read().unwrap();
        let doc: GameDoc = get_json(guard.as_ref(), "games/g1").unwrap().unwrap();
        assert_eq!(doc.log.len(), 2);
    }

    #[test]
    fn rejected_action_fails_the_command_not_the_fsm() {
        let mut fsm = Fsm::new(shared_store(), None).unwrap();
        // Pitch into a game that does not exist and cannot be created by it.
        let outcome = fsm.apply(1, &append_cmd("nope", pitch_action(1))).unwrap();
        assert!(matches!(outcome, ApplyOutcome::Rejected { .. }));
        // The FSM keeps applying.
        let outcome = fsm.apply(2, &append_cmd("g1", start_action())).unwrap();
        assert!(matches!(outcome, ApplyOutcome::Applied { .. }));
    }

    #[test]
    fn events_fan_out_committed_actions() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut fsm = Fsm::new(shared_store(), Some(tx)).unwrap();
        fsm.apply(1, &append_cmd("g1", start_action())).unwrap();
        match rx.try_recv().unwrap() {
            FsmEvent::ActionCommitted { game_id, .. } => assert_eq!(game_id, "g1"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn set_pitcher_derives_the_same_action_on_every_node() {
        let build = || {
            let mut fsm = Fsm::new(shared_store(), None).unwrap();
            fsm.apply(1, &append_cmd("g1", start_action())).unwrap();
            fsm.apply(
                2,
                &Command::SetPitcher {
                    game_id: "g1".into(),
                    team: 1,
                    pitcher: Player {
                        id: "p7".into(),
                        name: "P7".into(),
                        number: None,
                    },
                    timestamp: 99,
                },
            )
            .unwrap();
            let store = fsm.store();
            let guard = store.read().unwrap();
            let doc: GameDoc = get_json(guard.as_ref(), "games/g1").unwrap().unwrap();
            doc.revision
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn snapshot_restore_round_trips_every_governed_blob() {
        let mut fsm = Fsm::new(shared_store(), None).unwrap();
        fsm.apply(1, &append_cmd("g1", start_action())).unwrap();
        fsm.apply(
            2,
            &Command::SaveTeam {
                team: crate::command::Team {
                    id: "t1".into(),
                    name: "Herons".into(),
                    players: vec![],
                },
            },
        )
        .unwrap();
        fsm.apply(
            3,
            &Command::MetricsUpdate {
                delta: crate::command::MetricsDelta {
                    counters: [("ingest".to_string(), 4u64)].into_iter().collect(),
                },
            },
        )
        .unwrap();
        let snapshot = fsm.snapshot().unwrap();

        let fresh_store = shared_store();
        let mut follower = Fsm::new(Arc::clone(&fresh_store), None).unwrap();
        follower.restore(&snapshot).unwrap();
        assert_eq!(follower.last_applied(), 3);
        assert_eq!(follower.metrics().counters.get("ingest"), Some(&4));

        // Byte-identical governed content.
        let leader_store = fsm.store();
        let a = leader_store.read().unwrap();
        let b = fresh_store.read().unwrap();
        for prefix in GOVERNED_PREFIXES {
            let keys_a = a.list(prefix).unwrap();
            assert_eq!(keys_a, b.list(prefix).unwrap(), "prefix {prefix}");
            for key in keys_a {
                assert_eq!(a.get(&key).unwrap(), b.get(&key).unwrap(), "blob {key}");
            }
        }
    }

    #[test]
    fn restore_refuses_future_schemas() {
        let mut fsm = Fsm::new(shared_store(), None).unwrap();
        let data = serde_json::json!({
            "schemaVersion": SCHEMA_VERSION + 1,
            "lastAppliedIndex": 9,
            "blobs": {}
        });
        let err = fsm.restore(&serde_json::to_vec(&data).unwrap()).unwrap_err();
        assert!(matches!(err, FsmError::SchemaVersion(_)));
    }
}
