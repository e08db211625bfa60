// Copyright (C) 2025 Weft Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory backend.
//!
//! The reference implementation of every store contract. All state lives
//! under one mutex, which makes each operation trivially atomic: writes
//! validate every precondition first and only then apply. Integration tests
//! and embedded deployments run against this backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::codec::{decode_page_token, encode_page_token};
use crate::error::{CoreError, Result};
use crate::history::branch::{BranchInfo, BranchRange};
use crate::history::events::FIRST_EVENT_ID;
use crate::tasks::{Task, TaskCategory, TaskKey};
use crate::WorkflowKey;

use super::{
    AddHistoryTasksRequest, ClusterMember, ClusterMetadataRecord, ClusterMetadataStore,
    ConflictResolveWorkflowExecutionRequest, CreateWorkflowExecutionRequest, CreateWorkflowMode,
    CurrentExecutionRecord, DataBlob, DeleteHistoryBranchRequest, ExecutionStore,
    ForkHistoryBranchRequest, GetHistoryTasksRequest, GetHistoryTasksResponse,
    GetWorkflowExecutionResponse, HistoryBranchDetail, HistoryNode, HistoryNodeAppend,
    ListConcreteExecutionsRequest, ListConcreteExecutionsResponse, MetadataStore, NamespaceRecord,
    Queue, QueueAckLevels, QueueMessage, QueuedTask, ReadHistoryBranchRequest,
    ReadHistoryBranchResponse, ReplicationDlqTask, ShardRecord, ShardStore, TaskQueueRecord,
    TaskStore, UpdateShardRequest, UpdateWorkflowExecutionRequest, UpdateWorkflowMode,
    WorkflowMutation, WorkflowSnapshot, EMPTY_QUEUE_MESSAGE_ID,
};

/// Nodes of one branch: (node id, transaction id) → node. Multiple
/// transaction ids can coexist for the same node id until a read dedups.
type NodeLog = BTreeMap<(i64, i64), HistoryNode>;

#[derive(Default)]
struct TreeRecord {
    /// branch id → (identity, serialized tree metadata)
    branches: HashMap<String, (BranchInfo, DataBlob)>,
}

#[derive(Default)]
struct QueueStream {
    messages: BTreeMap<i64, QueueMessage>,
    next_id: i64,
    ack_levels: QueueAckLevels,
}

#[derive(Default)]
struct Inner {
    shards: HashMap<i32, ShardRecord>,
    executions: HashMap<(i32, WorkflowKey), WorkflowSnapshot>,
    current: HashMap<(i32, String, String), CurrentExecutionRecord>,
    history_tasks: HashMap<(i32, TaskCategory), BTreeMap<TaskKey, Task>>,
    replication_dlq: HashMap<(i32, String), BTreeMap<i64, ReplicationDlqTask>>,
    trees: HashMap<String, TreeRecord>,
    nodes: HashMap<(String, String), NodeLog>,
    task_queues: HashMap<(String, String), TaskQueueRecord>,
    queued_tasks: HashMap<(String, String), BTreeMap<i64, QueuedTask>>,
    namespaces: HashMap<String, NamespaceRecord>,
    namespace_notification_version: i64,
    clusters: HashMap<String, ClusterMetadataRecord>,
    members: HashMap<String, ClusterMember>,
    queue: QueueStream,
    dlq: QueueStream,
}

/// All stores in process memory.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store poisoned")
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn check_cancel(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(CoreError::Canceled);
    }
    Ok(())
}

impl Inner {
    /// Writes fail when the shard row exists at a different range id.
    fn check_range(&self, shard_id: i32, range_id: i64) -> Result<()> {
        if let Some(shard) = self.shards.get(&shard_id) {
            if shard.range_id != range_id {
                return Err(CoreError::ShardOwnershipLost {
                    shard_id,
                    request_range_id: range_id,
                    current_range_id: Some(shard.range_id),
                });
            }
        }
        Ok(())
    }

    fn check_condition(&self, shard_id: i32, key: &WorkflowKey, condition: i64) -> Result<()> {
        match self.executions.get(&(shard_id, key.clone())) {
            Some(stored) if stored.db_record_version != condition => Err(CoreError::ConditionFailed {
                expected: condition,
                actual: stored.db_record_version,
            }),
            Some(_) => Ok(()),
            None => Err(CoreError::WorkflowExecutionNotFound {
                workflow_id: key.workflow_id.clone(),
                run_id: Some(key.run_id.clone()),
            }),
        }
    }

    fn insert_tasks(&mut self, shard_id: i32, tasks: &HashMap<TaskCategory, Vec<Task>>) {
        for (category, tasks) in tasks {
            let stream = self.history_tasks.entry((shard_id, *category)).or_default();
            for task in tasks {
                stream.insert(task.key, task.clone());
            }
        }
    }

    fn append_node(&mut self, append: &HistoryNodeAppend) {
        let owning_branch = append
            .branch_info
            .branch_for_node(append.node.node_id)
            .to_string();
        let log = self
            .nodes
            .entry((append.branch_info.tree_id.clone(), owning_branch))
            .or_default();
        log.insert(
            (append.node.node_id, append.node.transaction_id),
            append.node.clone(),
        );
    }

    fn apply_snapshot(&mut self, shard_id: i32, snapshot: &WorkflowSnapshot) {
        self.executions
            .insert((shard_id, snapshot.workflow_key.clone()), snapshot.clone());
        self.insert_tasks(shard_id, &snapshot.tasks);
    }

    fn apply_mutation(&mut self, shard_id: i32, mutation: &WorkflowMutation) -> Result<()> {
        let stored = self
            .executions
            .get_mut(&(shard_id, mutation.workflow_key.clone()))
            .ok_or_else(|| CoreError::WorkflowExecutionNotFound {
                workflow_id: mutation.workflow_key.workflow_id.clone(),
                run_id: Some(mutation.workflow_key.run_id.clone()),
            })?;

        stored.execution_info = mutation.execution_info.clone();
        stored.execution_state = mutation.execution_state.clone();
        stored.next_event_id = mutation.next_event_id;
        stored.last_write_version = mutation.last_write_version;
        stored.db_record_version = mutation.db_record_version;
        stored.condition = mutation.condition;
        stored.checksum = mutation.checksum.clone();
        stored.workflow_task = mutation.workflow_task.clone();

        for (id, info) in &mutation.upsert_activity_infos {
            stored.activity_infos.insert(*id, info.clone());
        }
        for id in &mutation.delete_activity_infos {
            stored.activity_infos.remove(id);
        }
        for (id, info) in &mutation.upsert_timer_infos {
            stored.timer_infos.insert(id.clone(), info.clone());
        }
        for id in &mutation.delete_timer_infos {
            stored.timer_infos.remove(id);
        }
        for (id, info) in &mutation.upsert_child_execution_infos {
            stored.child_execution_infos.insert(*id, info.clone());
        }
        for id in &mutation.delete_child_execution_infos {
            stored.child_execution_infos.remove(id);
        }
        for (id, info) in &mutation.upsert_request_cancel_infos {
            stored.request_cancel_infos.insert(*id, info.clone());
        }
        for id in &mutation.delete_request_cancel_infos {
            stored.request_cancel_infos.remove(id);
        }
        for (id, info) in &mutation.upsert_signal_external_infos {
            stored.signal_external_infos.insert(*id, info.clone());
        }
        for id in &mutation.delete_signal_external_infos {
            stored.signal_external_infos.remove(id);
        }
        for id in &mutation.upsert_signal_requested_ids {
            stored.signal_requested_ids.insert(id.clone());
        }
        for id in &mutation.delete_signal_requested_ids {
            stored.signal_requested_ids.remove(id);
        }
        for (id, info) in &mutation.upsert_update_infos {
            stored.update_infos.insert(id.clone(), info.clone());
        }
        for id in &mutation.delete_update_infos {
            stored.update_infos.remove(id);
        }

        if mutation.clear_buffered_events {
            stored.buffered_events.clear();
        }
        stored
            .buffered_events
            .extend(mutation.new_buffered_events.iter().cloned());

        self.insert_tasks(shard_id, &mutation.tasks);
        Ok(())
    }

    fn set_current(&mut self, shard_id: i32, snapshot: &WorkflowSnapshot) {
        let key = (
            shard_id,
            snapshot.workflow_key.namespace_id.clone(),
            snapshot.workflow_key.workflow_id.clone(),
        );
        self.current.insert(
            key,
            CurrentExecutionRecord {
                run_id: snapshot.workflow_key.run_id.clone(),
                create_request_id: snapshot.execution_state.create_request_id.clone(),
                state: snapshot.execution_state.state,
                status: snapshot.execution_state.status,
                last_write_version: snapshot.last_write_version,
            },
        );
    }

    fn refresh_current_from_mutation(&mut self, shard_id: i32, mutation: &WorkflowMutation) {
        let key = (
            shard_id,
            mutation.workflow_key.namespace_id.clone(),
            mutation.workflow_key.workflow_id.clone(),
        );
        if let Some(current) = self.current.get_mut(&key) {
            if current.run_id == mutation.workflow_key.run_id {
                current.state = mutation.execution_state.state;
                current.status = mutation.execution_state.status;
                current.last_write_version = mutation.last_write_version;
            }
        }
    }
}

// ============================================================================
// ShardStore
// ============================================================================

#[async_trait]
impl ShardStore for MemoryStore {
    async fn get_shard(&self, cancel: &CancellationToken, shard_id: i32) -> Result<ShardRecord> {
        check_cancel(cancel)?;
        self.lock()
            .shards
            .get(&shard_id)
            .cloned()
            .ok_or(CoreError::ShardNotFound { shard_id })
    }

    async fn create_shard(&self, cancel: &CancellationToken, record: ShardRecord) -> Result<()> {
        check_cancel(cancel)?;
        let mut inner = self.lock();
        if inner.shards.contains_key(&record.shard_id) {
            return Err(CoreError::internal(format!(
                "shard {} already exists",
                record.shard_id
            )));
        }
        inner.shards.insert(record.shard_id, record);
        Ok(())
    }

    async fn update_shard(
        &self,
        cancel: &CancellationToken,
        request: UpdateShardRequest,
    ) -> Result<()> {
        check_cancel(cancel)?;
        let mut inner = self.lock();
        let shard = inner
            .shards
            .get_mut(&request.shard_id)
            .ok_or(CoreError::ShardNotFound {
                shard_id: request.shard_id,
            })?;
        if shard.range_id != request.previous_range_id {
            return Err(CoreError::ShardOwnershipLost {
                shard_id: request.shard_id,
                request_range_id: request.previous_range_id,
                current_range_id: Some(shard.range_id),
            });
        }
        shard.range_id = request.range_id;
        shard.owner = request.owner;
        shard.info = request.info;
        Ok(())
    }

    async fn assert_shard_ownership(
        &self,
        cancel: &CancellationToken,
        shard_id: i32,
        range_id: i64,
    ) -> Result<()> {
        check_cancel(cancel)?;
        self.lock().check_range(shard_id, range_id)
    }
}

// ============================================================================
// ExecutionStore
// ============================================================================

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn create_workflow_execution(
        &self,
        cancel: &CancellationToken,
        request: CreateWorkflowExecutionRequest,
    ) -> Result<()> {
        check_cancel(cancel)?;
        let mut inner = self.lock();
        inner.check_range(request.shard_id, request.range_id)?;

        let snapshot = &request.snapshot;
        let current_key = (
            request.shard_id,
            snapshot.workflow_key.namespace_id.clone(),
            snapshot.workflow_key.workflow_id.clone(),
        );

        // Validate the current-pointer precondition before any write.
        match request.mode {
            CreateWorkflowMode::BrandNew => {
                if let Some(current) = inner.current.get(&current_key) {
                    if current.status == crate::state::WorkflowStatus::Running {
                        return Err(CoreError::CurrentWorkflowConditionFailed {
                            message: format!(
                                "workflow '{}' already running as '{}'",
                                snapshot.workflow_key.workflow_id, current.run_id
                            ),
                        });
                    }
                }
            }
            CreateWorkflowMode::UpdateCurrent => {
                let current = inner.current.get(&current_key).ok_or_else(|| {
                    CoreError::CurrentWorkflowConditionFailed {
                        message: "no current execution to update".to_string(),
                    }
                })?;
                let expected_run = request.previous_run_id.as_deref().unwrap_or_default();
                if current.run_id != expected_run
                    || current.last_write_version != request.previous_last_write_version
                {
                    return Err(CoreError::CurrentWorkflowConditionFailed {
                        message: format!(
                            "current execution is '{}' at version {}, not '{}' at {}",
                            current.run_id,
                            current.last_write_version,
                            expected_run,
                            request.previous_last_write_version
                        ),
                    });
                }
            }
            CreateWorkflowMode::BypassCurrent => {}
        }

        if inner
            .executions
            .contains_key(&(request.shard_id, snapshot.workflow_key.clone()))
        {
            return Err(CoreError::CurrentWorkflowConditionFailed {
                message: format!("run '{}' already exists", snapshot.workflow_key.run_id),
            });
        }

        inner.apply_snapshot(request.shard_id, snapshot);
        if !matches!(request.mode, CreateWorkflowMode::BypassCurrent) {
            let snapshot = snapshot.clone();
            inner.set_current(request.shard_id, &snapshot);
        }
        for append in &request.new_events {
            inner.append_node(append);
        }
        Ok(())
    }

    async fn update_workflow_execution(
        &self,
        cancel: &CancellationToken,
        request: UpdateWorkflowExecutionRequest,
    ) -> Result<()> {
        check_cancel(cancel)?;
        let mut inner = self.lock();
        inner.check_range(request.shard_id, request.range_id)?;
        inner.check_condition(
            request.shard_id,
            &request.mutation.workflow_key,
            request.mutation.condition,
        )?;
        if let Some(new_snapshot) = &request.new_snapshot {
            if inner
                .executions
                .contains_key(&(request.shard_id, new_snapshot.workflow_key.clone()))
            {
                return Err(CoreError::CurrentWorkflowConditionFailed {
                    message: format!("run '{}' already exists", new_snapshot.workflow_key.run_id),
                });
            }
        }

        inner.apply_mutation(request.shard_id, &request.mutation)?;
        for append in &request.update_events {
            inner.append_node(append);
        }
        if let Some(new_snapshot) = &request.new_snapshot {
            inner.apply_snapshot(request.shard_id, new_snapshot);
            for append in &request.new_events {
                inner.append_node(append);
            }
        }

        match request.mode {
            UpdateWorkflowMode::UpdateCurrent => {
                if let Some(new_snapshot) = &request.new_snapshot {
                    let new_snapshot = new_snapshot.clone();
                    inner.set_current(request.shard_id, &new_snapshot);
                } else {
                    inner.refresh_current_from_mutation(request.shard_id, &request.mutation);
                }
            }
            UpdateWorkflowMode::BypassCurrent => {}
        }
        Ok(())
    }

    async fn conflict_resolve_workflow_execution(
        &self,
        cancel: &CancellationToken,
        request: ConflictResolveWorkflowExecutionRequest,
    ) -> Result<()> {
        check_cancel(cancel)?;
        let mut inner = self.lock();
        inner.check_range(request.shard_id, request.range_id)?;
        if let Some(mutation) = &request.current_mutation {
            inner.check_condition(request.shard_id, &mutation.workflow_key, mutation.condition)?;
        }

        // Apply order: reset → current → new.
        inner.apply_snapshot(request.shard_id, &request.reset_snapshot);
        for append in &request.reset_events {
            inner.append_node(append);
        }
        if let Some(mutation) = &request.current_mutation {
            inner.apply_mutation(request.shard_id, mutation)?;
            for append in &request.current_events {
                inner.append_node(append);
            }
        }
        if let Some(new_snapshot) = &request.new_snapshot {
            inner.apply_snapshot(request.shard_id, new_snapshot);
            for append in &request.new_events {
                inner.append_node(append);
            }
        }

        if matches!(
            request.mode,
            super::ConflictResolveWorkflowMode::UpdateCurrent
        ) {
            let target = request
                .new_snapshot
                .as_ref()
                .unwrap_or(&request.reset_snapshot)
                .clone();
            inner.set_current(request.shard_id, &target);
        }
        Ok(())
    }

    async fn set_workflow_execution(
        &self,
        cancel: &CancellationToken,
        shard_id: i32,
        range_id: i64,
        snapshot: WorkflowSnapshot,
    ) -> Result<()> {
        check_cancel(cancel)?;
        let mut inner = self.lock();
        inner.check_range(shard_id, range_id)?;
        inner.check_condition(shard_id, &snapshot.workflow_key, snapshot.condition)?;
        inner.apply_snapshot(shard_id, &snapshot);
        Ok(())
    }

    async fn delete_workflow_execution(
        &self,
        cancel: &CancellationToken,
        shard_id: i32,
        workflow_key: WorkflowKey,
    ) -> Result<()> {
        check_cancel(cancel)?;
        self.lock().executions.remove(&(shard_id, workflow_key));
        Ok(())
    }

    async fn delete_current_workflow_execution(
        &self,
        cancel: &CancellationToken,
        shard_id: i32,
        namespace_id: &str,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<()> {
        check_cancel(cancel)?;
        let mut inner = self.lock();
        let key = (shard_id, namespace_id.to_string(), workflow_id.to_string());
        if let Some(current) = inner.current.get(&key) {
            if current.run_id == run_id {
                inner.current.remove(&key);
            }
        }
        Ok(())
    }

    async fn get_workflow_execution(
        &self,
        cancel: &CancellationToken,
        shard_id: i32,
        workflow_key: WorkflowKey,
    ) -> Result<GetWorkflowExecutionResponse> {
        check_cancel(cancel)?;
        let inner = self.lock();
        let snapshot = inner
            .executions
            .get(&(shard_id, workflow_key.clone()))
            .cloned()
            .ok_or_else(|| CoreError::WorkflowExecutionNotFound {
                workflow_id: workflow_key.workflow_id.clone(),
                run_id: Some(workflow_key.run_id.clone()),
            })?;
        let db_record_version = snapshot.db_record_version;
        Ok(GetWorkflowExecutionResponse {
            snapshot,
            db_record_version,
        })
    }

    async fn get_current_execution(
        &self,
        cancel: &CancellationToken,
        shard_id: i32,
        namespace_id: &str,
        workflow_id: &str,
    ) -> Result<CurrentExecutionRecord> {
        check_cancel(cancel)?;
        self.lock()
            .current
            .get(&(shard_id, namespace_id.to_string(), workflow_id.to_string()))
            .cloned()
            .ok_or_else(|| CoreError::WorkflowExecutionNotFound {
                workflow_id: workflow_id.to_string(),
                run_id: None,
            })
    }

    async fn list_concrete_executions(
        &self,
        cancel: &CancellationToken,
        request: ListConcreteExecutionsRequest,
    ) -> Result<ListConcreteExecutionsResponse> {
        check_cancel(cancel)?;
        let inner = self.lock();
        let after: Option<WorkflowKey> = if request.page_token.is_empty() {
            None
        } else {
            Some(decode_page_token(&request.page_token)?)
        };

        let mut keys: Vec<&WorkflowKey> = inner
            .executions
            .keys()
            .filter(|(shard, _)| *shard == request.shard_id)
            .map(|(_, key)| key)
            .collect();
        keys.sort_by(|a, b| {
            (&a.namespace_id, &a.workflow_id, &a.run_id)
                .cmp(&(&b.namespace_id, &b.workflow_id, &b.run_id))
        });

        let snapshots: Vec<WorkflowSnapshot> = keys
            .into_iter()
            .filter(|key| match &after {
                Some(after) => {
                    (&key.namespace_id, &key.workflow_id, &key.run_id)
                        > (&after.namespace_id, &after.workflow_id, &after.run_id)
                }
                None => true,
            })
            .take(request.page_size.max(1))
            .map(|key| inner.executions[&(request.shard_id, key.clone())].clone())
            .collect();

        let next_page_token = if snapshots.len() == request.page_size.max(1) {
            encode_page_token(&snapshots.last().map(|s| s.workflow_key.clone()))?
        } else {
            Vec::new()
        };
        Ok(ListConcreteExecutionsResponse {
            snapshots,
            next_page_token,
        })
    }

    async fn add_history_tasks(
        &self,
        cancel: &CancellationToken,
        request: AddHistoryTasksRequest,
    ) -> Result<()> {
        check_cancel(cancel)?;
        let mut inner = self.lock();
        inner.check_range(request.shard_id, request.range_id)?;
        inner.insert_tasks(request.shard_id, &request.tasks);
        Ok(())
    }

    async fn get_history_tasks(
        &self,
        cancel: &CancellationToken,
        request: GetHistoryTasksRequest,
    ) -> Result<GetHistoryTasksResponse> {
        check_cancel(cancel)?;
        let inner = self.lock();
        let after: Option<TaskKey> = if request.page_token.is_empty() {
            None
        } else {
            Some(decode_page_token(&request.page_token)?)
        };

        let tasks: Vec<Task> = inner
            .history_tasks
            .get(&(request.shard_id, request.category))
            .map(|stream| {
                stream
                    .range(request.inclusive_min_key..request.exclusive_max_key)
                    .filter(|(key, _)| after.map_or(true, |after| **key > after))
                    .take(request.page_size.max(1))
                    .map(|(_, task)| task.clone())
                    .collect()
            })
            .unwrap_or_default();

        let next_page_token = if tasks.len() == request.page_size.max(1) {
            encode_page_token(&tasks.last().map(|t| t.key))?
        } else {
            Vec::new()
        };
        Ok(GetHistoryTasksResponse {
            tasks,
            next_page_token,
        })
    }

    async fn complete_history_task(
        &self,
        cancel: &CancellationToken,
        shard_id: i32,
        category: TaskCategory,
        task_key: TaskKey,
    ) -> Result<()> {
        check_cancel(cancel)?;
        if let Some(stream) = self.lock().history_tasks.get_mut(&(shard_id, category)) {
            stream.remove(&task_key);
        }
        Ok(())
    }

    async fn range_complete_history_tasks(
        &self,
        cancel: &CancellationToken,
        shard_id: i32,
        category: TaskCategory,
        inclusive_min_key: TaskKey,
        exclusive_max_key: TaskKey,
    ) -> Result<()> {
        check_cancel(cancel)?;
        if let Some(stream) = self.lock().history_tasks.get_mut(&(shard_id, category)) {
            let doomed: Vec<TaskKey> = stream
                .range(inclusive_min_key..exclusive_max_key)
                .map(|(key, _)| *key)
                .collect();
            for key in doomed {
                stream.remove(&key);
            }
        }
        Ok(())
    }

    async fn put_replication_task_to_dlq(
        &self,
        cancel: &CancellationToken,
        shard_id: i32,
        source_cluster: &str,
        task: ReplicationDlqTask,
    ) -> Result<()> {
        check_cancel(cancel)?;
        self.lock()
            .replication_dlq
            .entry((shard_id, source_cluster.to_string()))
            .or_default()
            .insert(task.task_id, task);
        Ok(())
    }

    async fn get_replication_tasks_from_dlq(
        &self,
        cancel: &CancellationToken,
        shard_id: i32,
        source_cluster: &str,
        inclusive_min_task_id: i64,
        exclusive_max_task_id: i64,
        page_size: usize,
        page_token: Vec<u8>,
    ) -> Result<(Vec<ReplicationDlqTask>, Vec<u8>)> {
        check_cancel(cancel)?;
        let inner = self.lock();
        let after: Option<i64> = if page_token.is_empty() {
            None
        } else {
            Some(decode_page_token(&page_token)?)
        };
        let tasks: Vec<ReplicationDlqTask> = inner
            .replication_dlq
            .get(&(shard_id, source_cluster.to_string()))
            .map(|stream| {
                stream
                    .range(inclusive_min_task_id..exclusive_max_task_id)
                    .filter(|(id, _)| after.map_or(true, |after| **id > after))
                    .take(page_size.max(1))
                    .map(|(_, task)| task.clone())
                    .collect()
            })
            .unwrap_or_default();
        let next = if tasks.len() == page_size.max(1) {
            encode_page_token(&tasks.last().map(|t| t.task_id))?
        } else {
            Vec::new()
        };
        Ok((tasks, next))
    }

    async fn delete_replication_task_from_dlq(
        &self,
        cancel: &CancellationToken,
        shard_id: i32,
        source_cluster: &str,
        task_id: i64,
    ) -> Result<()> {
        check_cancel(cancel)?;
        if let Some(stream) = self
            .lock()
            .replication_dlq
            .get_mut(&(shard_id, source_cluster.to_string()))
        {
            stream.remove(&task_id);
        }
        Ok(())
    }

    async fn range_delete_replication_tasks_from_dlq(
        &self,
        cancel: &CancellationToken,
        shard_id: i32,
        source_cluster: &str,
        inclusive_min_task_id: i64,
        exclusive_max_task_id: i64,
    ) -> Result<()> {
        check_cancel(cancel)?;
        if let Some(stream) = self
            .lock()
            .replication_dlq
            .get_mut(&(shard_id, source_cluster.to_string()))
        {
            let doomed: Vec<i64> = stream
                .range(inclusive_min_task_id..exclusive_max_task_id)
                .map(|(id, _)| *id)
                .collect();
            for id in doomed {
                stream.remove(&id);
            }
        }
        Ok(())
    }

    async fn is_replication_dlq_empty(
        &self,
        cancel: &CancellationToken,
        shard_id: i32,
        source_cluster: &str,
    ) -> Result<bool> {
        check_cancel(cancel)?;
        Ok(self
            .lock()
            .replication_dlq
            .get(&(shard_id, source_cluster.to_string()))
            .map_or(true, |stream| stream.is_empty()))
    }

    async fn insert_history_tree(
        &self,
        cancel: &CancellationToken,
        _shard_id: i32,
        branch_info: BranchInfo,
        tree_info: DataBlob,
    ) -> Result<()> {
        check_cancel(cancel)?;
        let mut inner = self.lock();
        let tree = inner.trees.entry(branch_info.tree_id.clone()).or_default();
        tree.branches
            .insert(branch_info.branch_id.clone(), (branch_info, tree_info));
        Ok(())
    }

    async fn append_history_nodes(
        &self,
        cancel: &CancellationToken,
        _shard_id: i32,
        append: HistoryNodeAppend,
    ) -> Result<()> {
        check_cancel(cancel)?;
        self.lock().append_node(&append);
        Ok(())
    }

    async fn delete_history_nodes(
        &self,
        cancel: &CancellationToken,
        _shard_id: i32,
        branch_token: Vec<u8>,
        node_id: i64,
        transaction_id: i64,
    ) -> Result<()> {
        check_cancel(cancel)?;
        let branch = BranchInfo::from_token(&branch_token)?;
        let owning = branch.branch_for_node(node_id).to_string();
        if let Some(log) = self.lock().nodes.get_mut(&(branch.tree_id, owning)) {
            log.remove(&(node_id, transaction_id));
        }
        Ok(())
    }

    async fn read_history_branch(
        &self,
        cancel: &CancellationToken,
        request: ReadHistoryBranchRequest,
    ) -> Result<ReadHistoryBranchResponse> {
        check_cancel(cancel)?;
        let branch = BranchInfo::from_token(&request.branch_token)?;
        let inner = self.lock();

        // Collect every write in range from the ancestor chain plus the
        // branch itself, then dedup per node id by max transaction id.
        let mut segments: Vec<(String, i64, i64)> = Vec::new();
        for range in &branch.ancestors {
            let lo = range.begin_node_id.max(request.min_node_id);
            let hi = range.end_node_id.min(request.max_node_id);
            if lo < hi {
                segments.push((range.branch_id.clone(), lo, hi));
            }
        }
        let own_begin = branch
            .ancestors
            .last()
            .map(|r| r.end_node_id)
            .unwrap_or(FIRST_EVENT_ID);
        let lo = own_begin.max(request.min_node_id);
        if lo < request.max_node_id {
            segments.push((branch.branch_id.clone(), lo, request.max_node_id));
        }

        let mut best: BTreeMap<i64, HistoryNode> = BTreeMap::new();
        for (branch_id, lo, hi) in segments {
            if let Some(log) = inner.nodes.get(&(branch.tree_id.clone(), branch_id)) {
                for ((node_id, _txn), node) in log.range((lo, i64::MIN)..(hi, i64::MIN)) {
                    match best.get(node_id) {
                        Some(existing) if existing.transaction_id >= node.transaction_id => {}
                        _ => {
                            best.insert(*node_id, node.clone());
                        }
                    }
                }
            }
        }

        let mut nodes: Vec<HistoryNode> = best.into_values().collect();
        if request.reverse {
            nodes.reverse();
        }
        if request.metadata_only {
            for node in &mut nodes {
                node.events.data.clear();
            }
        }

        let after: Option<i64> = if request.page_token.is_empty() {
            None
        } else {
            Some(decode_page_token(&request.page_token)?)
        };
        let nodes: Vec<HistoryNode> = nodes
            .into_iter()
            .filter(|node| match after {
                Some(after) if request.reverse => node.node_id < after,
                Some(after) => node.node_id > after,
                None => true,
            })
            .take(request.page_size.max(1))
            .collect();

        let next_page_token = if nodes.len() == request.page_size.max(1) {
            encode_page_token(&nodes.last().map(|n| n.node_id))?
        } else {
            Vec::new()
        };
        Ok(ReadHistoryBranchResponse {
            nodes,
            next_page_token,
        })
    }

    async fn fork_history_branch(
        &self,
        cancel: &CancellationToken,
        request: ForkHistoryBranchRequest,
    ) -> Result<()> {
        check_cancel(cancel)?;
        let base = &request.fork_branch;
        let base_own_begin = base
            .ancestors
            .last()
            .map(|r| r.end_node_id)
            .unwrap_or(FIRST_EVENT_ID);

        let mut ancestors: Vec<BranchRange> = Vec::new();
        for range in &base.ancestors {
            if range.end_node_id <= request.fork_node_id {
                ancestors.push(range.clone());
            } else if range.begin_node_id < request.fork_node_id {
                ancestors.push(BranchRange {
                    branch_id: range.branch_id.clone(),
                    begin_node_id: range.begin_node_id,
                    end_node_id: request.fork_node_id,
                });
                break;
            } else {
                break;
            }
        }
        if request.fork_node_id > base_own_begin {
            ancestors.push(BranchRange {
                branch_id: base.branch_id.clone(),
                begin_node_id: base_own_begin,
                end_node_id: request.fork_node_id,
            });
        }

        let new_branch = BranchInfo {
            tree_id: base.tree_id.clone(),
            branch_id: request.new_branch_id.clone(),
            ancestors,
        };

        let mut inner = self.lock();
        let tree = inner.trees.entry(base.tree_id.clone()).or_default();
        tree.branches.insert(
            request.new_branch_id.clone(),
            (new_branch, request.tree_info.clone()),
        );
        Ok(())
    }

    async fn delete_history_branch(
        &self,
        cancel: &CancellationToken,
        request: DeleteHistoryBranchRequest,
    ) -> Result<()> {
        check_cancel(cancel)?;
        let mut inner = self.lock();
        let tree_id = request.branch_info.tree_id.clone();

        if let Some(tree) = inner.trees.get_mut(&tree_id) {
            tree.branches.remove(&request.branch_info.branch_id);
        }

        for range in &request.branch_ranges {
            // A node survives while any remaining branch still reaches it:
            // either the range's branch itself survives, or another branch
            // inherits a prefix of it.
            let mut floor = range.begin_node_id;
            let mut branch_survives = false;
            if let Some(tree) = inner.trees.get(&tree_id) {
                for (other_id, (other, _)) in &tree.branches {
                    if *other_id == range.branch_id {
                        branch_survives = true;
                        break;
                    }
                    for ancestor in &other.ancestors {
                        if ancestor.branch_id == range.branch_id {
                            floor = floor.max(ancestor.end_node_id);
                        }
                    }
                }
            }
            if branch_survives {
                continue;
            }
            if let Some(log) = inner
                .nodes
                .get_mut(&(tree_id.clone(), range.branch_id.clone()))
            {
                let doomed: Vec<(i64, i64)> = log
                    .range((floor, i64::MIN)..)
                    .map(|(key, _)| *key)
                    .collect();
                for key in doomed {
                    log.remove(&key);
                }
                if log.is_empty() {
                    inner
                        .nodes
                        .remove(&(tree_id.clone(), range.branch_id.clone()));
                }
            }
        }

        if inner
            .trees
            .get(&tree_id)
            .map_or(false, |tree| tree.branches.is_empty())
        {
            inner.trees.remove(&tree_id);
        }
        Ok(())
    }

    async fn get_history_tree(
        &self,
        cancel: &CancellationToken,
        _shard_id: i32,
        tree_id: &str,
    ) -> Result<Vec<BranchInfo>> {
        check_cancel(cancel)?;
        Ok(self
            .lock()
            .trees
            .get(tree_id)
            .map(|tree| {
                tree.branches
                    .values()
                    .map(|(info, _)| info.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_all_history_tree_branches(
        &self,
        cancel: &CancellationToken,
        page_size: usize,
        page_token: Vec<u8>,
    ) -> Result<(Vec<HistoryBranchDetail>, Vec<u8>)> {
        check_cancel(cancel)?;
        let inner = self.lock();
        let after: Option<(String, String)> = if page_token.is_empty() {
            None
        } else {
            Some(decode_page_token(&page_token)?)
        };

        let mut details: Vec<HistoryBranchDetail> = inner
            .trees
            .iter()
            .flat_map(|(tree_id, tree)| {
                tree.branches
                    .iter()
                    .map(move |(branch_id, (_, tree_info))| HistoryBranchDetail {
                        tree_id: tree_id.clone(),
                        branch_id: branch_id.clone(),
                        tree_info: tree_info.clone(),
                    })
            })
            .collect();
        details.sort_by(|a, b| {
            (&a.tree_id, &a.branch_id).cmp(&(&b.tree_id, &b.branch_id))
        });

        let details: Vec<HistoryBranchDetail> = details
            .into_iter()
            .filter(|d| match &after {
                Some((tree, branch)) => {
                    (d.tree_id.as_str(), d.branch_id.as_str()) > (tree.as_str(), branch.as_str())
                }
                None => true,
            })
            .take(page_size.max(1))
            .collect();

        let next = if details.len() == page_size.max(1) {
            encode_page_token(
                &details
                    .last()
                    .map(|d| (d.tree_id.clone(), d.branch_id.clone())),
            )?
        } else {
            Vec::new()
        };
        Ok((details, next))
    }
}

// ============================================================================
// TaskStore
// ============================================================================

#[async_trait]
impl TaskStore for MemoryStore {
    async fn create_task_queue(
        &self,
        cancel: &CancellationToken,
        record: TaskQueueRecord,
    ) -> Result<()> {
        check_cancel(cancel)?;
        let mut inner = self.lock();
        let key = (record.namespace_id.clone(), record.name.clone());
        if inner.task_queues.contains_key(&key) {
            return Err(CoreError::CurrentWorkflowConditionFailed {
                message: format!("task queue '{}' already exists", record.name),
            });
        }
        inner.task_queues.insert(key, record);
        Ok(())
    }

    async fn get_task_queue(
        &self,
        cancel: &CancellationToken,
        namespace_id: &str,
        name: &str,
    ) -> Result<TaskQueueRecord> {
        check_cancel(cancel)?;
        self.lock()
            .task_queues
            .get(&(namespace_id.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| CoreError::WorkflowExecutionNotFound {
                workflow_id: name.to_string(),
                run_id: None,
            })
    }

    async fn update_task_queue(
        &self,
        cancel: &CancellationToken,
        record: TaskQueueRecord,
        previous_range_id: i64,
    ) -> Result<()> {
        check_cancel(cancel)?;
        let mut inner = self.lock();
        let key = (record.namespace_id.clone(), record.name.clone());
        let stored = inner.task_queues.get_mut(&key).ok_or_else(|| {
            CoreError::WorkflowExecutionNotFound {
                workflow_id: record.name.clone(),
                run_id: None,
            }
        })?;
        if stored.range_id != previous_range_id {
            return Err(CoreError::ConditionFailed {
                expected: previous_range_id,
                actual: stored.range_id,
            });
        }
        *stored = record;
        Ok(())
    }

    async fn create_tasks(
        &self,
        cancel: &CancellationToken,
        namespace_id: &str,
        name: &str,
        range_id: i64,
        tasks: Vec<QueuedTask>,
    ) -> Result<()> {
        check_cancel(cancel)?;
        let mut inner = self.lock();
        let key = (namespace_id.to_string(), name.to_string());
        match inner.task_queues.get(&key) {
            Some(record) if record.range_id != range_id => {
                return Err(CoreError::ConditionFailed {
                    expected: range_id,
                    actual: record.range_id,
                })
            }
            Some(_) => {}
            None => {
                return Err(CoreError::WorkflowExecutionNotFound {
                    workflow_id: name.to_string(),
                    run_id: None,
                })
            }
        }
        let stream = inner.queued_tasks.entry(key).or_default();
        for task in tasks {
            stream.insert(task.task_id, task);
        }
        Ok(())
    }

    async fn get_tasks(
        &self,
        cancel: &CancellationToken,
        namespace_id: &str,
        name: &str,
        exclusive_min_task_id: i64,
        max_count: usize,
    ) -> Result<Vec<QueuedTask>> {
        check_cancel(cancel)?;
        Ok(self
            .lock()
            .queued_tasks
            .get(&(namespace_id.to_string(), name.to_string()))
            .map(|stream| {
                stream
                    .range(exclusive_min_task_id.saturating_add(1)..)
                    .take(max_count)
                    .map(|(_, task)| task.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn complete_task(
        &self,
        cancel: &CancellationToken,
        namespace_id: &str,
        name: &str,
        task_id: i64,
    ) -> Result<()> {
        check_cancel(cancel)?;
        if let Some(stream) = self
            .lock()
            .queued_tasks
            .get_mut(&(namespace_id.to_string(), name.to_string()))
        {
            stream.remove(&task_id);
        }
        Ok(())
    }

    async fn complete_tasks_less_than(
        &self,
        cancel: &CancellationToken,
        namespace_id: &str,
        name: &str,
        exclusive_max_task_id: i64,
    ) -> Result<usize> {
        check_cancel(cancel)?;
        let mut removed = 0;
        if let Some(stream) = self
            .lock()
            .queued_tasks
            .get_mut(&(namespace_id.to_string(), name.to_string()))
        {
            let doomed: Vec<i64> = stream
                .range(..exclusive_max_task_id)
                .map(|(id, _)| *id)
                .collect();
            removed = doomed.len();
            for id in doomed {
                stream.remove(&id);
            }
        }
        Ok(removed)
    }
}

// ============================================================================
// MetadataStore
// ============================================================================

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn create_namespace(
        &self,
        cancel: &CancellationToken,
        mut record: NamespaceRecord,
    ) -> Result<()> {
        check_cancel(cancel)?;
        let mut inner = self.lock();
        if inner.namespaces.contains_key(&record.id)
            || inner.namespaces.values().any(|ns| ns.name == record.name)
        {
            return Err(CoreError::CurrentWorkflowConditionFailed {
                message: format!("namespace '{}' already exists", record.name),
            });
        }
        inner.namespace_notification_version += 1;
        record.notification_version = inner.namespace_notification_version;
        inner.namespaces.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get_namespace(
        &self,
        cancel: &CancellationToken,
        id: Option<&str>,
        name: Option<&str>,
    ) -> Result<NamespaceRecord> {
        check_cancel(cancel)?;
        let inner = self.lock();
        let found = match (id, name) {
            (Some(id), _) => inner.namespaces.get(id).cloned(),
            (None, Some(name)) => inner.namespaces.values().find(|ns| ns.name == name).cloned(),
            (None, None) => {
                return Err(CoreError::internal(
                    "get_namespace requires an id or a name",
                ))
            }
        };
        found.ok_or_else(|| CoreError::NamespaceNotFound {
            namespace: id.or(name).unwrap_or_default().to_string(),
        })
    }

    async fn update_namespace(
        &self,
        cancel: &CancellationToken,
        mut record: NamespaceRecord,
    ) -> Result<()> {
        check_cancel(cancel)?;
        let mut inner = self.lock();
        if !inner.namespaces.contains_key(&record.id) {
            return Err(CoreError::NamespaceNotFound {
                namespace: record.id.clone(),
            });
        }
        inner.namespace_notification_version += 1;
        record.notification_version = inner.namespace_notification_version;
        inner.namespaces.insert(record.id.clone(), record);
        Ok(())
    }

    async fn rename_namespace(
        &self,
        cancel: &CancellationToken,
        previous_name: &str,
        new_name: &str,
    ) -> Result<()> {
        check_cancel(cancel)?;
        let mut inner = self.lock();
        inner.namespace_notification_version += 1;
        let version = inner.namespace_notification_version;
        let record = inner
            .namespaces
            .values_mut()
            .find(|ns| ns.name == previous_name)
            .ok_or_else(|| CoreError::NamespaceNotFound {
                namespace: previous_name.to_string(),
            })?;
        record.name = new_name.to_string();
        record.notification_version = version;
        Ok(())
    }

    async fn delete_namespace(&self, cancel: &CancellationToken, id: &str) -> Result<()> {
        check_cancel(cancel)?;
        self.lock().namespaces.remove(id);
        Ok(())
    }

    async fn list_namespaces(
        &self,
        cancel: &CancellationToken,
        page_size: usize,
        page_token: Vec<u8>,
    ) -> Result<(Vec<NamespaceRecord>, Vec<u8>)> {
        check_cancel(cancel)?;
        let inner = self.lock();
        let after: Option<String> = if page_token.is_empty() {
            None
        } else {
            Some(decode_page_token(&page_token)?)
        };
        let mut records: Vec<NamespaceRecord> = inner.namespaces.values().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        let records: Vec<NamespaceRecord> = records
            .into_iter()
            .filter(|ns| after.as_ref().map_or(true, |after| ns.name > *after))
            .take(page_size.max(1))
            .collect();
        let next = if records.len() == page_size.max(1) {
            encode_page_token(&records.last().map(|ns| ns.name.clone()))?
        } else {
            Vec::new()
        };
        Ok((records, next))
    }

    async fn get_metadata(&self, cancel: &CancellationToken) -> Result<i64> {
        check_cancel(cancel)?;
        Ok(self.lock().namespace_notification_version)
    }
}

// ============================================================================
// ClusterMetadataStore
// ============================================================================

#[async_trait]
impl ClusterMetadataStore for MemoryStore {
    async fn list_cluster_metadata(
        &self,
        cancel: &CancellationToken,
        page_size: usize,
        page_token: Vec<u8>,
    ) -> Result<(Vec<ClusterMetadataRecord>, Vec<u8>)> {
        check_cancel(cancel)?;
        let inner = self.lock();
        let after: Option<String> = if page_token.is_empty() {
            None
        } else {
            Some(decode_page_token(&page_token)?)
        };
        let mut records: Vec<ClusterMetadataRecord> = inner.clusters.values().cloned().collect();
        records.sort_by(|a, b| a.cluster_name.cmp(&b.cluster_name));
        let records: Vec<ClusterMetadataRecord> = records
            .into_iter()
            .filter(|c| after.as_ref().map_or(true, |after| c.cluster_name > *after))
            .take(page_size.max(1))
            .collect();
        let next = if records.len() == page_size.max(1) {
            encode_page_token(&records.last().map(|c| c.cluster_name.clone()))?
        } else {
            Vec::new()
        };
        Ok((records, next))
    }

    async fn get_cluster_metadata(
        &self,
        cancel: &CancellationToken,
        cluster_name: &str,
    ) -> Result<ClusterMetadataRecord> {
        check_cancel(cancel)?;
        self.lock()
            .clusters
            .get(cluster_name)
            .cloned()
            .ok_or_else(|| CoreError::NamespaceNotFound {
                namespace: cluster_name.to_string(),
            })
    }

    async fn save_cluster_metadata(
        &self,
        cancel: &CancellationToken,
        mut record: ClusterMetadataRecord,
    ) -> Result<bool> {
        check_cancel(cancel)?;
        let mut inner = self.lock();
        let stored_version = inner
            .clusters
            .get(&record.cluster_name)
            .map(|c| c.version)
            .unwrap_or(0);
        if record.version != stored_version {
            return Ok(false);
        }
        record.version += 1;
        inner.clusters.insert(record.cluster_name.clone(), record);
        Ok(true)
    }

    async fn delete_cluster_metadata(
        &self,
        cancel: &CancellationToken,
        cluster_name: &str,
    ) -> Result<()> {
        check_cancel(cancel)?;
        self.lock().clusters.remove(cluster_name);
        Ok(())
    }

    async fn get_cluster_members(&self, cancel: &CancellationToken) -> Result<Vec<ClusterMember>> {
        check_cancel(cancel)?;
        let now = Utc::now();
        Ok(self
            .lock()
            .members
            .values()
            .filter(|m| m.record_expiry > now)
            .cloned()
            .collect())
    }

    async fn upsert_cluster_membership(
        &self,
        cancel: &CancellationToken,
        member: ClusterMember,
    ) -> Result<()> {
        check_cancel(cancel)?;
        self.lock().members.insert(member.host_id.clone(), member);
        Ok(())
    }

    async fn prune_cluster_membership(&self, cancel: &CancellationToken) -> Result<usize> {
        check_cancel(cancel)?;
        let now = Utc::now();
        let mut inner = self.lock();
        let before = inner.members.len();
        inner.members.retain(|_, m| m.record_expiry > now);
        Ok(before - inner.members.len())
    }
}

// ============================================================================
// Queue
// ============================================================================

impl QueueStream {
    fn enqueue(&mut self, blob: DataBlob) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        self.messages.insert(id, QueueMessage { id, blob });
        id
    }

    fn update_ack_levels(&mut self, ack_levels: QueueAckLevels) -> Result<()> {
        if ack_levels.version != self.ack_levels.version {
            return Err(CoreError::ConditionFailed {
                expected: ack_levels.version,
                actual: self.ack_levels.version,
            });
        }
        self.ack_levels = QueueAckLevels {
            ack_levels: ack_levels.ack_levels,
            version: ack_levels.version + 1,
        };
        Ok(())
    }
}

#[async_trait]
impl Queue for MemoryStore {
    async fn enqueue_message(&self, cancel: &CancellationToken, blob: DataBlob) -> Result<i64> {
        check_cancel(cancel)?;
        Ok(self.lock().queue.enqueue(blob))
    }

    async fn read_messages(
        &self,
        cancel: &CancellationToken,
        last_message_id: i64,
        max_count: usize,
    ) -> Result<Vec<QueueMessage>> {
        check_cancel(cancel)?;
        let floor = if last_message_id == EMPTY_QUEUE_MESSAGE_ID {
            0
        } else {
            last_message_id.saturating_add(1)
        };
        Ok(self
            .lock()
            .queue
            .messages
            .range(floor..)
            .take(max_count)
            .map(|(_, msg)| msg.clone())
            .collect())
    }

    async fn delete_messages_before(
        &self,
        cancel: &CancellationToken,
        exclusive_max_message_id: i64,
    ) -> Result<()> {
        check_cancel(cancel)?;
        let mut inner = self.lock();
        let doomed: Vec<i64> = inner
            .queue
            .messages
            .range(..exclusive_max_message_id)
            .map(|(id, _)| *id)
            .collect();
        for id in doomed {
            inner.queue.messages.remove(&id);
        }
        Ok(())
    }

    async fn update_ack_levels(
        &self,
        cancel: &CancellationToken,
        ack_levels: QueueAckLevels,
    ) -> Result<()> {
        check_cancel(cancel)?;
        self.lock().queue.update_ack_levels(ack_levels)
    }

    async fn get_ack_levels(&self, cancel: &CancellationToken) -> Result<QueueAckLevels> {
        check_cancel(cancel)?;
        Ok(self.lock().queue.ack_levels.clone())
    }

    async fn enqueue_message_to_dlq(
        &self,
        cancel: &CancellationToken,
        blob: DataBlob,
    ) -> Result<i64> {
        check_cancel(cancel)?;
        Ok(self.lock().dlq.enqueue(blob))
    }

    async fn read_messages_from_dlq(
        &self,
        cancel: &CancellationToken,
        inclusive_min_message_id: i64,
        exclusive_max_message_id: i64,
        page_size: usize,
        page_token: Vec<u8>,
    ) -> Result<(Vec<QueueMessage>, Vec<u8>)> {
        check_cancel(cancel)?;
        let after: Option<i64> = if page_token.is_empty() {
            None
        } else {
            Some(decode_page_token(&page_token)?)
        };
        let messages: Vec<QueueMessage> = self
            .lock()
            .dlq
            .messages
            .range(inclusive_min_message_id..exclusive_max_message_id)
            .filter(|(id, _)| after.map_or(true, |after| **id > after))
            .take(page_size.max(1))
            .map(|(_, msg)| msg.clone())
            .collect();
        let next = if messages.len() == page_size.max(1) {
            encode_page_token(&messages.last().map(|m| m.id))?
        } else {
            Vec::new()
        };
        Ok((messages, next))
    }

    async fn delete_message_from_dlq(
        &self,
        cancel: &CancellationToken,
        message_id: i64,
    ) -> Result<()> {
        check_cancel(cancel)?;
        self.lock().dlq.messages.remove(&message_id);
        Ok(())
    }

    async fn range_delete_messages_from_dlq(
        &self,
        cancel: &CancellationToken,
        inclusive_min_message_id: i64,
        exclusive_max_message_id: i64,
    ) -> Result<()> {
        check_cancel(cancel)?;
        let mut inner = self.lock();
        let doomed: Vec<i64> = inner
            .dlq
            .messages
            .range(inclusive_min_message_id..exclusive_max_message_id)
            .map(|(id, _)| *id)
            .collect();
        for id in doomed {
            inner.dlq.messages.remove(&id);
        }
        Ok(())
    }

    async fn update_dlq_ack_levels(
        &self,
        cancel: &CancellationToken,
        ack_levels: QueueAckLevels,
    ) -> Result<()> {
        check_cancel(cancel)?;
        self.lock().dlq.update_ack_levels(ack_levels)
    }

    async fn get_dlq_ack_levels(&self, cancel: &CancellationToken) -> Result<QueueAckLevels> {
        check_cancel(cancel)?;
        Ok(self.lock().dlq.ack_levels.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MAX_QUEUE_MESSAGE_ID;

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    fn blob(text: &str) -> DataBlob {
        DataBlob::encode(&text).expect("encode")
    }

    #[tokio::test]
    async fn test_first_enqueued_message_has_id_zero() {
        let store = MemoryStore::new();
        let id = store.enqueue_message(&cancel(), blob("m0")).await.unwrap();
        assert_eq!(id, 0);

        let messages = store
            .read_messages(&cancel(), EMPTY_QUEUE_MESSAGE_ID, 10)
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, 0);
    }

    #[tokio::test]
    async fn test_read_messages_from_max_id_is_empty() {
        let store = MemoryStore::new();
        store.enqueue_message(&cancel(), blob("m0")).await.unwrap();
        let messages = store
            .read_messages(&cancel(), MAX_QUEUE_MESSAGE_ID, 10)
            .await
            .unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_token_short_circuits() {
        let store = MemoryStore::new();
        let token = CancellationToken::new();
        token.cancel();
        let err = store.enqueue_message(&token, blob("m0")).await.unwrap_err();
        assert_eq!(err.error_code(), "CANCELED");
    }

    #[tokio::test]
    async fn test_shard_update_requires_matching_previous_range() {
        let store = MemoryStore::new();
        store
            .create_shard(
                &cancel(),
                ShardRecord {
                    shard_id: 1,
                    range_id: 5,
                    owner: "host-a".to_string(),
                    info: blob("info"),
                },
            )
            .await
            .unwrap();

        let err = store
            .update_shard(
                &cancel(),
                UpdateShardRequest {
                    shard_id: 1,
                    range_id: 7,
                    owner: "host-b".to_string(),
                    info: blob("info"),
                    previous_range_id: 4,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "SHARD_OWNERSHIP_LOST");

        store
            .update_shard(
                &cancel(),
                UpdateShardRequest {
                    shard_id: 1,
                    range_id: 6,
                    owner: "host-b".to_string(),
                    info: blob("info"),
                    previous_range_id: 5,
                },
            )
            .await
            .unwrap();
        let shard = store.get_shard(&cancel(), 1).await.unwrap();
        assert_eq!(shard.range_id, 6);
        assert_eq!(shard.owner, "host-b");
    }

    #[tokio::test]
    async fn test_history_node_dedup_keeps_max_transaction_id() {
        let store = MemoryStore::new();
        let branch = BranchInfo::new_root();
        let token = branch.to_token().unwrap();

        for txn in [10i64, 11] {
            store
                .append_history_nodes(
                    &cancel(),
                    1,
                    HistoryNodeAppend {
                        branch_token: token.clone(),
                        branch_info: branch.clone(),
                        node: HistoryNode {
                            node_id: 5,
                            transaction_id: txn,
                            prev_transaction_id: txn - 1,
                            events: blob(&format!("txn-{txn}")),
                        },
                    },
                )
                .await
                .unwrap();
        }

        let response = store
            .read_history_branch(
                &cancel(),
                ReadHistoryBranchRequest {
                    shard_id: 1,
                    branch_token: token,
                    min_node_id: 5,
                    max_node_id: 6,
                    page_size: 10,
                    page_token: Vec::new(),
                    metadata_only: false,
                    reverse: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(response.nodes.len(), 1);
        assert_eq!(response.nodes[0].transaction_id, 11);
    }

    #[tokio::test]
    async fn test_fork_shares_prefix_with_parent() {
        let store = MemoryStore::new();
        let base = BranchInfo::new_root();
        let token = base.to_token().unwrap();
        store
            .insert_history_tree(&cancel(), 1, base.clone(), blob("tree"))
            .await
            .unwrap();

        for node_id in [1i64, 3, 5] {
            store
                .append_history_nodes(
                    &cancel(),
                    1,
                    HistoryNodeAppend {
                        branch_token: token.clone(),
                        branch_info: base.clone(),
                        node: HistoryNode {
                            node_id,
                            transaction_id: node_id,
                            prev_transaction_id: 0,
                            events: blob(&format!("node-{node_id}")),
                        },
                    },
                )
                .await
                .unwrap();
        }

        store
            .fork_history_branch(
                &cancel(),
                ForkHistoryBranchRequest {
                    shard_id: 1,
                    fork_branch: base.clone(),
                    fork_node_id: 5,
                    new_branch_id: "forked".to_string(),
                    tree_info: blob("tree"),
                },
            )
            .await
            .unwrap();

        let forked = BranchInfo {
            tree_id: base.tree_id.clone(),
            branch_id: "forked".to_string(),
            ancestors: vec![BranchRange {
                branch_id: base.branch_id.clone(),
                begin_node_id: 1,
                end_node_id: 5,
            }],
        };
        let forked_token = forked.to_token().unwrap();

        let read = |token: Vec<u8>| {
            let store = &store;
            async move {
                store
                    .read_history_branch(
                        &cancel(),
                        ReadHistoryBranchRequest {
                            shard_id: 1,
                            branch_token: token,
                            min_node_id: 1,
                            max_node_id: 5,
                            page_size: 10,
                            page_token: Vec::new(),
                            metadata_only: false,
                            reverse: false,
                        },
                    )
                    .await
                    .unwrap()
                    .nodes
            }
        };

        let parent_nodes = read(token).await;
        let forked_nodes = read(forked_token).await;
        assert_eq!(parent_nodes, forked_nodes);
        assert_eq!(forked_nodes.len(), 2);
    }

    #[tokio::test]
    async fn test_namespace_notification_version_is_monotone() {
        let store = MemoryStore::new();
        let v0 = store.get_metadata(&cancel()).await.unwrap();
        store
            .create_namespace(
                &cancel(),
                NamespaceRecord {
                    id: "ns-1".to_string(),
                    name: "default".to_string(),
                    info: blob("ns"),
                    is_global: false,
                    notification_version: 0,
                },
            )
            .await
            .unwrap();
        let v1 = store.get_metadata(&cancel()).await.unwrap();
        assert!(v1 > v0);

        store
            .rename_namespace(&cancel(), "default", "primary")
            .await
            .unwrap();
        let v2 = store.get_metadata(&cancel()).await.unwrap();
        assert!(v2 > v1);

        let ns = store
            .get_namespace(&cancel(), None, Some("primary"))
            .await
            .unwrap();
        assert_eq!(ns.id, "ns-1");
    }
}
