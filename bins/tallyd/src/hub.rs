// SPDX-License-Identifier: Apache-2.0
//! Per-game session hubs: subscriber registry and fan-out.
//!
//! One mutex guards the whole registry; every critical section is a map
//! operation plus channel `try_send`s — no I/O happens under the lock.
//! Slow or vanished subscribers are dropped rather than awaited, so one
//! stuck client can never stall a broadcast.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::debug;

use tally_core::{Action, ActionId};
use tally_proto::ServerFrame;

/// Identifies one subscription for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

struct Subscriber {
    tx: mpsc::Sender<ServerFrame>,
    /// What this subscriber last acknowledged seeing (diagnostic).
    base_revision: Option<ActionId>,
}

#[derive(Default)]
struct GameHub {
    /// Tip visible to new subscribers.
    last_revision: Option<ActionId>,
    subscribers: HashMap<u64, Subscriber>,
}

/// Registry of per-game hubs.
#[derive(Default)]
pub struct Hub {
    inner: Mutex<HubInner>,
}

#[derive(Default)]
struct HubInner {
    next_id: u64,
    games: HashMap<String, GameHub>,
}

impl Hub {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for `game_id`. The caller streams catch-up
    /// separately (reads happen outside the lock); duplicates are harmless
    /// because clients collapse repeated action ids.
    pub fn subscribe(
        &self,
        game_id: &str,
        base_revision: Option<ActionId>,
        tx: mpsc::Sender<ServerFrame>,
    ) -> SubscriberId {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = inner.next_id;
        inner.next_id += 1;
        inner
            .games
            .entry(game_id.to_string())
            .or_default()
            .subscribers
            .insert(id, Subscriber { tx, base_revision });
        SubscriberId(id)
    }

    /// Remove one subscriber; any in-flight fan-out to it is dropped.
    pub fn unsubscribe(&self, game_id: &str, id: SubscriberId) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let emptied = match inner.games.get_mut(game_id) {
            Some(game) => {
                game.subscribers.remove(&id.0);
                game.subscribers.is_empty() && game.last_revision.is_none()
            }
            None => false,
        };
        if emptied {
            inner.games.remove(game_id);
        }
    }

    /// Record a subscriber's acknowledged revision.
    pub fn note_ack(&self, game_id: &str, id: SubscriberId, revision: ActionId) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sub) = inner
            .games
            .get_mut(game_id)
            .and_then(|g| g.subscribers.get_mut(&id.0))
        {
            sub.base_revision = Some(revision);
        }
    }

    /// Tip currently visible to new subscribers.
    pub fn last_revision(&self, game_id: &str) -> Option<ActionId> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.games.get(game_id).and_then(|g| g.last_revision)
    }

    /// Fan one committed action out to every subscriber, in apply order.
    pub fn publish(&self, game_id: &str, action: &Action, revision: ActionId) {
        self.broadcast(
            game_id,
            Some(revision),
            ServerFrame::Action {
                action: action.clone(),
            },
        );
    }

    /// Announce a wholesale log replacement as a catch-up batch.
    pub fn publish_replaced(&self, game_id: &str, actions: Vec<Action>, revision: ActionId) {
        self.broadcast(
            game_id,
            Some(revision),
            ServerFrame::SyncUpdate { actions },
        );
    }

    /// Tell subscribers the game is gone and drop them.
    pub fn publish_deleted(&self, game_id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(game) = inner.games.remove(game_id) {
            for (_, sub) in game.subscribers {
                let _ = sub.tx.try_send(ServerFrame::Error {
                    error: format!("game {game_id} was deleted"),
                });
            }
        }
    }

    fn broadcast(&self, game_id: &str, revision: Option<ActionId>, frame: ServerFrame) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let game = inner.games.entry(game_id.to_string()).or_default();
        if revision.is_some() {
            game.last_revision = revision;
        }
        game.subscribers.retain(|id, sub| {
            match sub.tx.try_send(frame.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(game_id, subscriber = id, "dropping closed subscriber");
                    false
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // A subscriber that cannot keep up gets cut; it will
                    // reconnect and catch up from its revision.
                    debug!(game_id, subscriber = id, "dropping slow subscriber");
                    false
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{ActionBody, UndoPayload};

    fn action(n: u8) -> Action {
        Action::new(
            ActionBody::Undo(UndoPayload {
                ref_id: ActionId([n; 32]),
            }),
            i64::from(n),
            None,
        )
    }

    #[tokio::test]
    async fn publish_fans_out_in_order() {
        let hub = Hub::new();
        let (tx, mut rx) = mpsc::channel(8);
        hub.subscribe("g1", None, tx);

        let a = action(1);
        let b = action(2);
        hub.publish("g1", &a, a.id);
        hub.publish("g1", &b, b.id);

        match rx.recv().await.unwrap() {
            ServerFrame::Action { action } => assert_eq!(action.id, a.id),
            other => panic!("unexpected frame {other:?}"),
        }
        match rx.recv().await.unwrap() {
            ServerFrame::Action { action } => assert_eq!(action.id, b.id),
            other => panic!("unexpected frame {other:?}"),
        }
        assert_eq!(hub.last_revision("g1"), Some(b.id));
    }

    #[tokio::test]
    async fn unsubscribed_sessions_receive_nothing() {
        let hub = Hub::new();
        let (tx, mut rx) = mpsc::channel(8);
        let id = hub.subscribe("g1", None, tx);
        hub.unsubscribe("g1", id);
        let a = action(1);
        hub.publish("g1", &a, a.id);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_subscribers_are_cut_not_awaited() {
        let hub = Hub::new();
        let (tx, _rx) = mpsc::channel(1);
        hub.subscribe("g1", None, tx);
        let a = action(1);
        let b = action(2);
        hub.publish("g1", &a, a.id); // fills the buffer
        hub.publish("g1", &b, b.id); // overflows: subscriber dropped
        let c = action(3);
        hub.publish("g1", &c, c.id); // must not panic or block
        assert_eq!(hub.last_revision("g1"), Some(c.id));
    }
}
