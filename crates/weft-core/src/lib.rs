// Copyright (C) 2025 Weft Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Weft Core - Durable Workflow Engine Core
//!
//! This crate is the history-service core of a durable workflow engine: it
//! owns per-shard workflow mutable state, turns user-level operations into
//! atomic state mutations plus side-effect tasks, and mediates workflow
//! update requests that rendezvous across tasks.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        RPC / frontend glue                       │
//! │                        (out of scope here)                       │
//! └──────────────────────────────────────────────────────────────────┘
//!                                  │
//!                                  ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  api::update_workflow  ──►  WorkflowConsistencyChecker           │
//! │                              │  (lock, cache, predicates)        │
//! │                              ▼                                   │
//! │  UpdateRegistry  ◄──►  MutableState ──► TaskGenerator            │
//! │        │                     │               │                   │
//! │        │                     ▼               ▼                   │
//! │        │               WorkflowContext (commit path)             │
//! └────────┼─────────────────────┼───────────────────────────────────┘
//!          │                     │ range id + task ids
//!          ▼                     ▼
//! ┌────────────────┐   ┌───────────────────────────────┐
//! │ MatchingClient │   │ StoreHandle                   │
//! │ (trait)        │   │  ShardStore  ExecutionStore   │
//! └────────────────┘   │  Queue  Metadata  Cluster ... │
//!                      └───────────────────────────────┘
//! ```
//!
//! One inbound operation follows one path: the consistency checker loads or
//! pins a workflow context under a priority-ordered per-run lock; the caller
//! mutates mutable state through typed helpers that queue tasks via the task
//! generator; closing the transaction emits a mutation that the execution
//! store persists atomically under the shard's current range id; on success
//! the lock releases and external effects (matching dispatch, update
//! completion notifications) fire.
//!
//! # Modules
//!
//! - [`config`]: engine configuration from environment variables
//! - [`error`]: the error taxonomy shared by stores and invocation paths
//! - [`codec`]: data-blob encoding at the store boundary
//! - [`history`]: events, branches, and the per-shard events cache
//! - [`tasks`]: side-effect task model
//! - [`shard`]: shard context: range lease, task id allocation, clocks
//! - [`persistence`]: store contracts plus memory and SQLite backends
//! - [`state`]: mutable state, task generator, timer sequence, refresher
//! - [`update`]: in-flight workflow update registry
//! - [`workflow`]: per-run lock, context cache, consistency checker
//! - [`matching`]: matching service client contract
//! - [`api`]: invocation paths built from the parts above

#![deny(missing_docs)]

pub mod api;
pub mod codec;
pub mod config;
pub mod error;
pub mod history;
pub mod matching;
pub mod persistence;
pub mod shard;
pub mod state;
pub mod tasks;
pub mod update;
pub mod workflow;

use serde::{Deserialize, Serialize};

/// Identity of one workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowKey {
    /// Owning namespace id.
    pub namespace_id: String,
    /// Workflow id, unique among non-terminal runs in the namespace.
    pub workflow_id: String,
    /// This run's id.
    pub run_id: String,
}

impl WorkflowKey {
    /// Construct a key from its parts.
    pub fn new(
        namespace_id: impl Into<String>,
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            namespace_id: namespace_id.into(),
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
        }
    }
}

impl std::fmt::Display for WorkflowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.namespace_id, self.workflow_id, self.run_id
        )
    }
}
