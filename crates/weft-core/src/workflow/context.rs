// Copyright (C) 2025 Weft Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow context: the per-run unit of caching and commitment.
//!
//! A `WorkflowContext` owns the run's lock, its update registry, and the
//! cached mutable state. Mutable state is only touched through a
//! [`LockedWorkflowContext`], which proves the lock is held. The commit
//! paths close the open mutable-state transaction, stamp the shard's range
//! id, allocate task ids, and hand the whole thing to the execution store as
//! one atomic write; any failure drops the cached state so the next caller
//! reloads from the store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{CoreError, Result};
use crate::history::branch::BranchInfo;
use crate::history::events::HistoryEvent;
use crate::persistence::{
    CreateWorkflowExecutionRequest, CreateWorkflowMode, ExecutionStore, HistoryNode,
    HistoryNodeAppend, UpdateWorkflowExecutionRequest, UpdateWorkflowMode,
};
use crate::shard::ShardContext;
use crate::state::mutable_state::MutableState;
use crate::tasks::{Task, TaskCategory};
use crate::update::UpdateRegistry;
use crate::workflow::lock::{LockPriority, WorkflowGuard, WorkflowLock};
use crate::WorkflowKey;

/// Shared per-run state: lock, update registry, cached mutable state.
pub struct WorkflowContext {
    key: WorkflowKey,
    lock: WorkflowLock,
    update_registry: Arc<UpdateRegistry>,
    mutable_state: Mutex<Option<MutableState>>,
}

impl WorkflowContext {
    /// Create an empty context for `key`.
    pub fn new(key: WorkflowKey, low_defer: Duration) -> Self {
        Self {
            key,
            lock: WorkflowLock::new(low_defer),
            update_registry: Arc::new(UpdateRegistry::new()),
            mutable_state: Mutex::new(None),
        }
    }

    /// The run this context serves.
    pub fn key(&self) -> &WorkflowKey {
        &self.key
    }

    /// The run's lock.
    pub fn lock(&self) -> &WorkflowLock {
        &self.lock
    }

    /// The run's update registry. Usable without the lock; waiting on an
    /// update must not hold the run hostage.
    pub fn update_registry(&self) -> Arc<UpdateRegistry> {
        self.update_registry.clone()
    }

    /// Abort all in-flight updates (eviction, shard unload).
    pub fn abort_updates(&self) {
        self.update_registry.abort_all();
    }

    /// Acquire the lock and return the locked view.
    pub async fn lock_context(
        self: &Arc<Self>,
        priority: LockPriority,
        cancel: &CancellationToken,
        shard: Arc<ShardContext>,
        store: Arc<dyn ExecutionStore>,
    ) -> Result<LockedWorkflowContext> {
        let guard = self.lock.acquire(priority, cancel).await?;
        Ok(LockedWorkflowContext {
            context: self.clone(),
            shard,
            store,
            _guard: guard,
        })
    }

    fn clear_cached_state(&self) {
        *self.mutable_state.lock().expect("context state poisoned") = None;
    }
}

/// A workflow context with its lock held.
pub struct LockedWorkflowContext {
    context: Arc<WorkflowContext>,
    shard: Arc<ShardContext>,
    store: Arc<dyn ExecutionStore>,
    _guard: WorkflowGuard,
}

impl LockedWorkflowContext {
    /// The run this context serves.
    pub fn key(&self) -> &WorkflowKey {
        &self.context.key
    }

    /// The run's update registry.
    pub fn update_registry(&self) -> Arc<UpdateRegistry> {
        self.context.update_registry()
    }

    /// The unlocked context, for callers that outlive the lock.
    pub fn context(&self) -> Arc<WorkflowContext> {
        self.context.clone()
    }

    /// Ensure mutable state is loaded, reading through the store on a miss.
    pub async fn load_mutable_state(&self, cancel: &CancellationToken) -> Result<()> {
        {
            let cached = self
                .context
                .mutable_state
                .lock()
                .expect("context state poisoned");
            if cached.is_some() {
                return Ok(());
            }
        }

        let response = self
            .store
            .get_workflow_execution(cancel, self.shard.shard_id(), self.context.key.clone())
            .await?;
        let state = MutableState::from_snapshot(self.shard.shard_id(), response.snapshot);
        debug!(
            workflow_key = %self.context.key,
            db_record_version = response.db_record_version,
            "mutable state loaded"
        );
        *self
            .context
            .mutable_state
            .lock()
            .expect("context state poisoned") = Some(state);
        Ok(())
    }

    /// Install freshly created mutable state (workflow start path).
    pub fn install_mutable_state(&self, state: MutableState) {
        *self
            .context
            .mutable_state
            .lock()
            .expect("context state poisoned") = Some(state);
    }

    /// Drop the cached state so the next caller reloads from the store.
    pub fn clear_cached_state(&self) {
        self.context.clear_cached_state();
    }

    /// Run `f` against the loaded mutable state.
    ///
    /// Errors if state has not been loaded; callers go through
    /// [`load_mutable_state`](Self::load_mutable_state) first.
    pub fn with_mutable_state<R>(&self, f: impl FnOnce(&mut MutableState) -> R) -> Result<R> {
        let mut cached = self
            .context
            .mutable_state
            .lock()
            .expect("context state poisoned");
        let state = cached
            .as_mut()
            .ok_or_else(|| CoreError::internal("mutable state accessed before load"))?;
        Ok(f(state))
    }

    /// Assign shard-monotonic task ids to every queued task, in a
    /// deterministic category order.
    async fn assign_task_ids(
        &self,
        tasks: &mut std::collections::HashMap<TaskCategory, Vec<Task>>,
    ) -> Result<()> {
        let total: usize = tasks.values().map(Vec::len).sum();
        if total == 0 {
            return Ok(());
        }
        let ids = self.shard.generate_task_ids(total).await?;
        let mut ids = ids.into_iter();

        let mut categories: Vec<TaskCategory> = tasks.keys().copied().collect();
        categories.sort();
        for category in categories {
            if let Some(bucket) = tasks.get_mut(&category) {
                for task in bucket {
                    task.key.task_id = ids
                        .next()
                        .ok_or_else(|| CoreError::internal("task id allocation underflow"))?;
                }
            }
        }
        Ok(())
    }

    /// Build the history-node append for one closed transaction's events.
    async fn build_node_append(&self, events: &[HistoryEvent]) -> Result<Option<HistoryNodeAppend>> {
        let Some(first) = events.first() else {
            return Ok(None);
        };
        let branch_token = self.with_mutable_state(|ms| ms.current_branch_token().to_vec())?;
        let branch_info = BranchInfo::from_token(&branch_token)?;
        let transaction_id = self
            .shard
            .generate_task_ids(1)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::internal("transaction id allocation underflow"))?;
        Ok(Some(HistoryNodeAppend {
            branch_token,
            branch_info,
            node: HistoryNode {
                node_id: first.event_id,
                transaction_id,
                prev_transaction_id: 0,
                events: crate::codec::DataBlob::encode(&events)?,
            },
        }))
    }

    /// Persist the open transaction as a brand-new run.
    ///
    /// Also writes the run's history-tree record. On any failure the cached
    /// state is dropped.
    pub async fn create_workflow_execution(
        &self,
        cancel: &CancellationToken,
        mode: CreateWorkflowMode,
        previous_run_id: Option<String>,
        previous_last_write_version: i64,
    ) -> Result<()> {
        let result = self
            .create_workflow_execution_inner(cancel, mode, previous_run_id, previous_last_write_version)
            .await;
        if let Err(err) = &result {
            warn!(workflow_key = %self.context.key, error = %err, "create failed; dropping cached state");
            self.clear_cached_state();
        }
        result
    }

    async fn create_workflow_execution_inner(
        &self,
        cancel: &CancellationToken,
        mode: CreateWorkflowMode,
        previous_run_id: Option<String>,
        previous_last_write_version: i64,
    ) -> Result<()> {
        let (mut snapshot, events) =
            self.with_mutable_state(|ms| ms.close_transaction_as_snapshot())??;
        self.assign_task_ids(&mut snapshot.tasks).await?;
        let node = self.build_node_append(&events).await?;

        let branch_info = BranchInfo::from_token(&snapshot.execution_info.current_branch_token)?;
        self.store
            .insert_history_tree(
                cancel,
                self.shard.shard_id(),
                branch_info,
                crate::codec::DataBlob::encode(&serde_json::json!({
                    "workflow_id": snapshot.workflow_key.workflow_id,
                    "run_id": snapshot.workflow_key.run_id,
                }))?,
            )
            .await?;

        self.store
            .create_workflow_execution(
                cancel,
                CreateWorkflowExecutionRequest {
                    shard_id: self.shard.shard_id(),
                    range_id: self.shard.range_id(),
                    mode,
                    previous_run_id,
                    previous_last_write_version,
                    snapshot,
                    new_events: node.into_iter().collect(),
                },
            )
            .await
    }

    /// Persist the open transaction as a delta against the stored run.
    /// On any failure the cached state is dropped.
    pub async fn update_workflow_execution(&self, cancel: &CancellationToken) -> Result<()> {
        let result = self.update_workflow_execution_inner(cancel).await;
        if let Err(err) = &result {
            warn!(workflow_key = %self.context.key, error = %err, "update failed; dropping cached state");
            self.clear_cached_state();
        }
        result
    }

    async fn update_workflow_execution_inner(&self, cancel: &CancellationToken) -> Result<()> {
        let mut output = self.with_mutable_state(|ms| ms.close_transaction_as_mutation())??;
        self.assign_task_ids(&mut output.mutation.tasks).await?;
        let node = self.build_node_append(&output.events).await?;

        self.store
            .update_workflow_execution(
                cancel,
                UpdateWorkflowExecutionRequest {
                    shard_id: self.shard.shard_id(),
                    range_id: self.shard.range_id(),
                    mode: UpdateWorkflowMode::UpdateCurrent,
                    mutation: output.mutation,
                    update_events: node.into_iter().collect(),
                    new_snapshot: None,
                    new_events: Vec::new(),
                },
            )
            .await
    }
}
