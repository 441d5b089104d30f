// SPDX-License-Identifier: Apache-2.0
//! tally-cluster: the server replication plane.
//!
//! A node pairs a [`raft`] manager (leader election, log replication,
//! membership, snapshot scheduling) with an [`fsm::Fsm`] that folds committed
//! [`command::Command`]s into the node's store. Submissions enter through
//! [`raft::RaftHandle::propose`]; non-leaders answer with a redirect rather
//! than an error, and the FSM publishes accepted actions onto an event
//! channel the per-game session hubs consume.

pub mod command;
pub mod fsm;
pub mod raft;

pub use command::{Command, GameDoc, MetricsDelta, SaveGamePayload, Team};
pub use fsm::{
    ApplyOutcome, Fsm, FsmError, FsmEvent, FsmStateBlob, MetricsRegistry, SharedStore,
    GOVERNED_PREFIXES, SCHEMA_VERSION,
};
pub use raft::{ProposeOutcome, RaftConfig, RaftError, RaftHandle, RaftStatus};
