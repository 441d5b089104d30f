// SPDX-License-Identifier: Apache-2.0
//! The persisted key layout shared by every node.
//!
//! ```text
//! games/<id>            serialized game document (log + materialized state)
//! teams/<id>            serialized team
//! sys_access_policy     structural access policy
//! nodes.json            cluster membership as known to this node
//! metrics.json          rolling per-node counters
//! fsm_state.json        { lastAppliedIndex, schemaVersion }
//! ```
//!
//! The `raft/` subdirectory (log + snapshots) and `master.key` live beside
//! these keys in the data directory but are not addressed through the store.

/// Prefix for game documents.
pub const GAMES_PREFIX: &str = "games/";
/// Prefix for teams.
pub const TEAMS_PREFIX: &str = "teams/";
/// Structural access policy blob.
pub const SYS_ACCESS_POLICY: &str = "sys_access_policy";
/// Cluster membership blob.
pub const NODES: &str = "nodes.json";
/// Rolling metrics counters blob.
pub const METRICS: &str = "metrics.json";
/// FSM bookkeeping blob (`lastAppliedIndex`, `schemaVersion`).
pub const FSM_STATE: &str = "fsm_state.json";

/// Marker file whose presence makes `SK_MASTER_KEY` mandatory.
pub const MASTER_KEY_FILE: &str = "master.key";
/// Environment variable carrying the at-rest encryption key.
pub const MASTER_KEY_ENV: &str = "SK_MASTER_KEY";

/// Store key for one game document.
pub fn game(id: &str) -> String {
    format!("{GAMES_PREFIX}{id}")
}

/// Store key for one team.
pub fn team(id: &str) -> String {
    format!("{TEAMS_PREFIX}{id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_builders_compose_prefixes() {
        assert_eq!(game("abc"), "games/abc");
        assert_eq!(team("t-1"), "teams/t-1");
    }
}
