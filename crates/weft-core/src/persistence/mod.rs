// Copyright (C) 2025 Weft Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence contracts and backends.
//!
//! Stores are async traits behind `Arc<dyn …>`; every operation takes an
//! explicit cancellation token and a per-call request struct. There are no
//! callbacks inside requests: where the original design injected a
//! `create_shard_info` closure, this layer returns [`CoreError::ShardNotFound`]
//! and the caller constructs and writes the record itself.

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryStore;
pub use self::sqlite::SqliteStore;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::codec::DataBlob;
use crate::error::Result;
use crate::history::branch::BranchInfo;
use crate::state::checksum::Checksum;
use crate::state::{
    ActivityInfo, ChildExecutionInfo, ExecutionInfo, ExecutionState, RequestCancelInfo,
    SignalExternalInfo, TimerInfo, UpdateInfo, WorkflowState, WorkflowStatus,
};
use crate::tasks::{Task, TaskCategory, TaskKey};
use crate::WorkflowKey;

/// "Read from the beginning" sentinel for [`Queue::read_messages`].
pub const EMPTY_QUEUE_MESSAGE_ID: i64 = -1;
/// Largest assignable queue message id.
pub const MAX_QUEUE_MESSAGE_ID: i64 = i64::MAX;

// ============================================================================
// Shard store
// ============================================================================

/// Durable record of a shard lease.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRecord {
    /// The shard.
    pub shard_id: i32,
    /// Current lease token; increases monotonically across owners.
    pub range_id: i64,
    /// Host that renewed the lease last.
    pub owner: String,
    /// Opaque shard metadata (ack levels, queue states).
    pub info: DataBlob,
}

/// Conditional shard update.
#[derive(Debug, Clone)]
pub struct UpdateShardRequest {
    /// The shard.
    pub shard_id: i32,
    /// The new range id to install.
    pub range_id: i64,
    /// New owner string.
    pub owner: String,
    /// Opaque shard metadata.
    pub info: DataBlob,
    /// The range id the caller last observed; mismatch fails the write.
    pub previous_range_id: i64,
}

/// Shard lease storage.
#[async_trait]
pub trait ShardStore: Send + Sync {
    /// Fetch a shard record; [`CoreError::ShardNotFound`] when absent.
    async fn get_shard(&self, cancel: &CancellationToken, shard_id: i32) -> Result<ShardRecord>;

    /// First-time creation of a shard record. Fails if it already exists.
    async fn create_shard(&self, cancel: &CancellationToken, record: ShardRecord) -> Result<()>;

    /// Conditionally renew a shard lease. [`CoreError::ShardOwnershipLost`]
    /// when `previous_range_id` no longer matches.
    async fn update_shard(&self, cancel: &CancellationToken, request: UpdateShardRequest)
        -> Result<()>;

    /// Assert the caller still owns the shard at `range_id`.
    async fn assert_shard_ownership(
        &self,
        cancel: &CancellationToken,
        shard_id: i32,
        range_id: i64,
    ) -> Result<()>;
}

// ============================================================================
// Execution store
// ============================================================================

/// How a create interacts with the current-execution pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateWorkflowMode {
    /// No current execution may exist for this workflow id.
    BrandNew,
    /// The current pointer must match `previous_run_id` /
    /// `previous_last_write_version` and is repointed to the new run.
    UpdateCurrent,
    /// Write the run without touching the current pointer.
    BypassCurrent,
}

/// How an update interacts with the current-execution pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateWorkflowMode {
    /// The mutated (or newly created) run must be the current one.
    UpdateCurrent,
    /// The mutated run must NOT be the current one (zombie maintenance).
    BypassCurrent,
}

/// How a conflict-resolve interacts with the current-execution pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolveWorkflowMode {
    /// Repoint current to the reset (or new) run.
    UpdateCurrent,
    /// Leave the current pointer alone.
    BypassCurrent,
}

/// Full durable image of one run's mutable state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    /// The run.
    pub workflow_key: WorkflowKey,
    /// Execution metadata.
    pub execution_info: ExecutionInfo,
    /// State/status pair.
    pub execution_state: ExecutionState,
    /// Id the next appended event will take.
    pub next_event_id: i64,
    /// Version of the last write, for cross-cluster conflict resolution.
    pub last_write_version: i64,
    /// Optimistic-concurrency token after this write.
    pub db_record_version: i64,
    /// Pending activities by scheduled event id.
    pub activity_infos: HashMap<i64, ActivityInfo>,
    /// Pending user timers by timer id.
    pub timer_infos: HashMap<String, TimerInfo>,
    /// Pending children by initiated event id.
    pub child_execution_infos: HashMap<i64, ChildExecutionInfo>,
    /// Pending external cancels by initiated event id.
    pub request_cancel_infos: HashMap<i64, RequestCancelInfo>,
    /// Pending external signals by initiated event id.
    pub signal_external_infos: HashMap<i64, SignalExternalInfo>,
    /// Signal dedup ids.
    pub signal_requested_ids: HashSet<String>,
    /// Admitted/accepted/completed updates by update id.
    pub update_infos: HashMap<String, UpdateInfo>,
    /// The pending workflow task, when one exists. Never speculative in a
    /// persisted snapshot.
    pub workflow_task: Option<crate::state::WorkflowTaskInfo>,
    /// Events held back while a workflow task runs.
    pub buffered_events: Vec<crate::history::HistoryEvent>,
    /// Tasks to persist atomically with this snapshot.
    pub tasks: HashMap<TaskCategory, Vec<Task>>,
    /// Expected prior `db_record_version` (0 for creation).
    pub condition: i64,
    /// Content hash over the durable parts.
    pub checksum: Option<Checksum>,
}

/// Delta image of one run's mutable state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMutation {
    /// The run.
    pub workflow_key: WorkflowKey,
    /// Execution metadata (always written whole).
    pub execution_info: ExecutionInfo,
    /// State/status pair (always written whole).
    pub execution_state: ExecutionState,
    /// Id the next appended event will take.
    pub next_event_id: i64,
    /// Version of this write.
    pub last_write_version: i64,
    /// Optimistic-concurrency token after this write.
    pub db_record_version: i64,
    /// Activity upserts.
    pub upsert_activity_infos: HashMap<i64, ActivityInfo>,
    /// Activity deletions.
    pub delete_activity_infos: HashSet<i64>,
    /// Timer upserts.
    pub upsert_timer_infos: HashMap<String, TimerInfo>,
    /// Timer deletions.
    pub delete_timer_infos: HashSet<String>,
    /// Child upserts.
    pub upsert_child_execution_infos: HashMap<i64, ChildExecutionInfo>,
    /// Child deletions.
    pub delete_child_execution_infos: HashSet<i64>,
    /// External-cancel upserts.
    pub upsert_request_cancel_infos: HashMap<i64, RequestCancelInfo>,
    /// External-cancel deletions.
    pub delete_request_cancel_infos: HashSet<i64>,
    /// External-signal upserts.
    pub upsert_signal_external_infos: HashMap<i64, SignalExternalInfo>,
    /// External-signal deletions.
    pub delete_signal_external_infos: HashSet<i64>,
    /// Signal dedup id additions.
    pub upsert_signal_requested_ids: HashSet<String>,
    /// Signal dedup id removals.
    pub delete_signal_requested_ids: HashSet<String>,
    /// Update-record upserts.
    pub upsert_update_infos: HashMap<String, UpdateInfo>,
    /// Update-record deletions.
    pub delete_update_infos: HashSet<String>,
    /// The pending workflow task after this mutation.
    pub workflow_task: Option<crate::state::WorkflowTaskInfo>,
    /// Events newly buffered by this mutation.
    pub new_buffered_events: Vec<crate::history::HistoryEvent>,
    /// Whether previously buffered events were flushed.
    pub clear_buffered_events: bool,
    /// Tasks to persist atomically with this mutation.
    pub tasks: HashMap<TaskCategory, Vec<Task>>,
    /// Expected current `db_record_version`.
    pub condition: i64,
    /// Content hash over the durable parts.
    pub checksum: Option<Checksum>,
}

/// One history node: a batch of events starting at `node_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryNode {
    /// First event id in the batch.
    pub node_id: i64,
    /// Write transaction id. For the same node id, larger wins.
    pub transaction_id: i64,
    /// Transaction id of the preceding write, for chain validation.
    pub prev_transaction_id: i64,
    /// The encoded event batch. Empty for metadata-only reads.
    pub events: DataBlob,
}

/// A node append bound to its branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryNodeAppend {
    /// Opaque branch token.
    pub branch_token: Vec<u8>,
    /// Decoded branch identity.
    pub branch_info: BranchInfo,
    /// The node to append.
    pub node: HistoryNode,
}

/// Request for [`ExecutionStore::create_workflow_execution`].
#[derive(Debug, Clone)]
pub struct CreateWorkflowExecutionRequest {
    /// The shard owning the run.
    pub shard_id: i32,
    /// The caller's current lease.
    pub range_id: i64,
    /// Current-pointer behavior.
    pub mode: CreateWorkflowMode,
    /// For [`CreateWorkflowMode::UpdateCurrent`]: the run being superseded.
    pub previous_run_id: Option<String>,
    /// For [`CreateWorkflowMode::UpdateCurrent`]: its last write version.
    pub previous_last_write_version: i64,
    /// The new run's full image.
    pub snapshot: WorkflowSnapshot,
    /// History nodes to append atomically.
    pub new_events: Vec<HistoryNodeAppend>,
}

/// Request for [`ExecutionStore::update_workflow_execution`].
#[derive(Debug, Clone)]
pub struct UpdateWorkflowExecutionRequest {
    /// The shard owning the run.
    pub shard_id: i32,
    /// The caller's current lease.
    pub range_id: i64,
    /// Current-pointer behavior.
    pub mode: UpdateWorkflowMode,
    /// The delta to apply.
    pub mutation: WorkflowMutation,
    /// History nodes for the mutated run.
    pub update_events: Vec<HistoryNodeAppend>,
    /// Optional new run created atomically (continue-as-new).
    pub new_snapshot: Option<WorkflowSnapshot>,
    /// History nodes for the new run.
    pub new_events: Vec<HistoryNodeAppend>,
}

/// Request for [`ExecutionStore::conflict_resolve_workflow_execution`].
#[derive(Debug, Clone)]
pub struct ConflictResolveWorkflowExecutionRequest {
    /// The shard owning the run.
    pub shard_id: i32,
    /// The caller's current lease.
    pub range_id: i64,
    /// Current-pointer behavior.
    pub mode: ConflictResolveWorkflowMode,
    /// The run being reset, as a full image.
    pub reset_snapshot: WorkflowSnapshot,
    /// History nodes for the reset run.
    pub reset_events: Vec<HistoryNodeAppend>,
    /// Optional new run created atomically.
    pub new_snapshot: Option<WorkflowSnapshot>,
    /// History nodes for the new run.
    pub new_events: Vec<HistoryNodeAppend>,
    /// Optional mutation of the still-current run.
    pub current_mutation: Option<WorkflowMutation>,
    /// History nodes for the current run.
    pub current_events: Vec<HistoryNodeAppend>,
}

/// Response of [`ExecutionStore::get_workflow_execution`].
#[derive(Debug, Clone)]
pub struct GetWorkflowExecutionResponse {
    /// The stored image.
    pub snapshot: WorkflowSnapshot,
    /// The stored optimistic-concurrency token.
    pub db_record_version: i64,
}

/// The current-execution pointer for one workflow id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentExecutionRecord {
    /// Latest run id.
    pub run_id: String,
    /// Its create request id.
    pub create_request_id: String,
    /// Its lifecycle state.
    pub state: WorkflowState,
    /// Its visibility status.
    pub status: WorkflowStatus,
    /// Its last write version.
    pub last_write_version: i64,
}

/// Paged scan request over concrete executions.
#[derive(Debug, Clone)]
pub struct ListConcreteExecutionsRequest {
    /// The shard to scan.
    pub shard_id: i32,
    /// Maximum snapshots per page.
    pub page_size: usize,
    /// Token from the previous page; empty for the first page.
    pub page_token: Vec<u8>,
}

/// One page of concrete executions.
#[derive(Debug, Clone)]
pub struct ListConcreteExecutionsResponse {
    /// The snapshots.
    pub snapshots: Vec<WorkflowSnapshot>,
    /// Token for the next page; empty at the end.
    pub next_page_token: Vec<u8>,
}

/// Request to write history tasks outside a workflow mutation.
#[derive(Debug, Clone)]
pub struct AddHistoryTasksRequest {
    /// The shard owning the run.
    pub shard_id: i32,
    /// The caller's current lease.
    pub range_id: i64,
    /// The run the tasks act on.
    pub workflow_key: WorkflowKey,
    /// Tasks grouped by category.
    pub tasks: HashMap<TaskCategory, Vec<Task>>,
}

/// Paged read of one category's task stream.
#[derive(Debug, Clone)]
pub struct GetHistoryTasksRequest {
    /// The shard to read.
    pub shard_id: i32,
    /// The category stream.
    pub category: TaskCategory,
    /// Inclusive lower bound.
    pub inclusive_min_key: TaskKey,
    /// Exclusive upper bound.
    pub exclusive_max_key: TaskKey,
    /// Maximum tasks per page.
    pub page_size: usize,
    /// Token from the previous page; empty for the first page.
    pub page_token: Vec<u8>,
}

/// One page of history tasks.
#[derive(Debug, Clone)]
pub struct GetHistoryTasksResponse {
    /// The tasks, ordered by key.
    pub tasks: Vec<Task>,
    /// Token for the next page; empty at the end.
    pub next_page_token: Vec<u8>,
}

/// Request for [`ExecutionStore::read_history_branch`].
#[derive(Debug, Clone)]
pub struct ReadHistoryBranchRequest {
    /// The shard holding the tree.
    pub shard_id: i32,
    /// Opaque branch token.
    pub branch_token: Vec<u8>,
    /// First node id to return. Inclusive.
    pub min_node_id: i64,
    /// First node id NOT to return. Exclusive.
    pub max_node_id: i64,
    /// Maximum nodes per page.
    pub page_size: usize,
    /// Token from the previous page; empty for the first page.
    pub page_token: Vec<u8>,
    /// Return node metadata without event payloads.
    pub metadata_only: bool,
    /// Iterate from max to min instead.
    pub reverse: bool,
}

/// One page of history nodes, deduplicated.
#[derive(Debug, Clone)]
pub struct ReadHistoryBranchResponse {
    /// Surviving nodes: one per node id, the max-transaction-id write.
    pub nodes: Vec<HistoryNode>,
    /// Token for the next page; empty at the end.
    pub next_page_token: Vec<u8>,
}

/// Request for [`ExecutionStore::fork_history_branch`].
#[derive(Debug, Clone)]
pub struct ForkHistoryBranchRequest {
    /// The shard holding the tree.
    pub shard_id: i32,
    /// The branch being forked.
    pub fork_branch: BranchInfo,
    /// The new branch starts here (inclusive); the base contributes
    /// everything below (exclusive).
    pub fork_node_id: i64,
    /// Id for the new branch.
    pub new_branch_id: String,
    /// Serialized tree metadata for the new branch.
    pub tree_info: DataBlob,
}

/// Request for [`ExecutionStore::delete_history_branch`].
#[derive(Debug, Clone)]
pub struct DeleteHistoryBranchRequest {
    /// The shard holding the tree.
    pub shard_id: i32,
    /// The branch being deleted.
    pub branch_info: BranchInfo,
    /// Per-branch delete ranges: nodes with id ≥ `begin_node_id` go.
    pub branch_ranges: Vec<DeleteBranchRange>,
}

/// One delete range of [`DeleteHistoryBranchRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteBranchRange {
    /// The branch whose nodes are deleted.
    pub branch_id: String,
    /// Delete nodes with node id ≥ this.
    pub begin_node_id: i64,
}

/// Branch listing entry of [`ExecutionStore::get_all_history_tree_branches`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryBranchDetail {
    /// The owning tree.
    pub tree_id: String,
    /// The branch.
    pub branch_id: String,
    /// Serialized tree metadata.
    pub tree_info: DataBlob,
}

/// Replication task parked for operator inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationDlqTask {
    /// Id within the source cluster's stream.
    pub task_id: i64,
    /// Serialized replication task.
    pub blob: DataBlob,
}

/// Transactional mutable-state, history-tree, and task storage for one
/// cluster of shards.
///
/// Write atomicity: each of the three workflow write operations applies all
/// of its components (rows, current pointer, tasks, history nodes) or none.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    // ---- workflow rows -----------------------------------------------------

    /// Create a new run, optionally installing it as current.
    async fn create_workflow_execution(
        &self,
        cancel: &CancellationToken,
        request: CreateWorkflowExecutionRequest,
    ) -> Result<()>;

    /// Apply a delta to an existing run, optionally creating a successor.
    async fn update_workflow_execution(
        &self,
        cancel: &CancellationToken,
        request: UpdateWorkflowExecutionRequest,
    ) -> Result<()>;

    /// Reset a run to a snapshot, with optional concurrent current-run
    /// mutation and new-run creation. Applied reset → current → new.
    async fn conflict_resolve_workflow_execution(
        &self,
        cancel: &CancellationToken,
        request: ConflictResolveWorkflowExecutionRequest,
    ) -> Result<()>;

    /// Overwrite a run's image without touching the current pointer.
    /// Repair paths only.
    async fn set_workflow_execution(
        &self,
        cancel: &CancellationToken,
        shard_id: i32,
        range_id: i64,
        snapshot: WorkflowSnapshot,
    ) -> Result<()>;

    /// Delete a run's row.
    async fn delete_workflow_execution(
        &self,
        cancel: &CancellationToken,
        shard_id: i32,
        workflow_key: WorkflowKey,
    ) -> Result<()>;

    /// Delete the current-execution pointer if it still names `run_id`.
    async fn delete_current_workflow_execution(
        &self,
        cancel: &CancellationToken,
        shard_id: i32,
        namespace_id: &str,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<()>;

    /// Fetch a run's image. `WorkflowExecutionNotFound` when absent.
    async fn get_workflow_execution(
        &self,
        cancel: &CancellationToken,
        shard_id: i32,
        workflow_key: WorkflowKey,
    ) -> Result<GetWorkflowExecutionResponse>;

    /// Fetch the current-execution pointer for a workflow id.
    async fn get_current_execution(
        &self,
        cancel: &CancellationToken,
        shard_id: i32,
        namespace_id: &str,
        workflow_id: &str,
    ) -> Result<CurrentExecutionRecord>;

    /// Paged scan of all runs in a shard.
    async fn list_concrete_executions(
        &self,
        cancel: &CancellationToken,
        request: ListConcreteExecutionsRequest,
    ) -> Result<ListConcreteExecutionsResponse>;

    // ---- history tasks -----------------------------------------------------

    /// Write tasks outside a workflow mutation (refresh, repair).
    async fn add_history_tasks(
        &self,
        cancel: &CancellationToken,
        request: AddHistoryTasksRequest,
    ) -> Result<()>;

    /// Paged read of a category stream.
    async fn get_history_tasks(
        &self,
        cancel: &CancellationToken,
        request: GetHistoryTasksRequest,
    ) -> Result<GetHistoryTasksResponse>;

    /// Complete (delete) one task.
    async fn complete_history_task(
        &self,
        cancel: &CancellationToken,
        shard_id: i32,
        category: TaskCategory,
        task_key: TaskKey,
    ) -> Result<()>;

    /// Complete every task in `[inclusive_min, exclusive_max)`.
    async fn range_complete_history_tasks(
        &self,
        cancel: &CancellationToken,
        shard_id: i32,
        category: TaskCategory,
        inclusive_min_key: TaskKey,
        exclusive_max_key: TaskKey,
    ) -> Result<()>;

    /// Advisory hint that a reader is consuming a category stream. The
    /// back-pressure contract is deliberately unspecified; backends may
    /// ignore these.
    async fn register_history_task_reader(
        &self,
        _cancel: &CancellationToken,
        _shard_id: i32,
        _category: TaskCategory,
        _reader_id: i64,
    ) -> Result<()> {
        Ok(())
    }

    /// Advisory counterpart of
    /// [`register_history_task_reader`](ExecutionStore::register_history_task_reader).
    async fn unregister_history_task_reader(
        &self,
        _cancel: &CancellationToken,
        _shard_id: i32,
        _category: TaskCategory,
        _reader_id: i64,
    ) {
    }

    /// Advisory progress watermark for a registered reader.
    async fn update_history_task_reader_progress(
        &self,
        _cancel: &CancellationToken,
        _shard_id: i32,
        _category: TaskCategory,
        _reader_id: i64,
        _inclusive_min_key: TaskKey,
    ) {
    }

    // ---- replication DLQ ---------------------------------------------------

    /// Park a replication task for operator inspection.
    async fn put_replication_task_to_dlq(
        &self,
        cancel: &CancellationToken,
        shard_id: i32,
        source_cluster: &str,
        task: ReplicationDlqTask,
    ) -> Result<()>;

    /// Paged read of parked replication tasks.
    async fn get_replication_tasks_from_dlq(
        &self,
        cancel: &CancellationToken,
        shard_id: i32,
        source_cluster: &str,
        inclusive_min_task_id: i64,
        exclusive_max_task_id: i64,
        page_size: usize,
        page_token: Vec<u8>,
    ) -> Result<(Vec<ReplicationDlqTask>, Vec<u8>)>;

    /// Delete one parked replication task.
    async fn delete_replication_task_from_dlq(
        &self,
        cancel: &CancellationToken,
        shard_id: i32,
        source_cluster: &str,
        task_id: i64,
    ) -> Result<()>;

    /// Delete parked tasks in `[inclusive_min, exclusive_max)`.
    async fn range_delete_replication_tasks_from_dlq(
        &self,
        cancel: &CancellationToken,
        shard_id: i32,
        source_cluster: &str,
        inclusive_min_task_id: i64,
        exclusive_max_task_id: i64,
    ) -> Result<()>;

    /// Whether the DLQ holds nothing for this source cluster.
    async fn is_replication_dlq_empty(
        &self,
        cancel: &CancellationToken,
        shard_id: i32,
        source_cluster: &str,
    ) -> Result<bool>;

    // ---- history tree ------------------------------------------------------

    /// First-time creation of a tree record for a branch.
    async fn insert_history_tree(
        &self,
        cancel: &CancellationToken,
        shard_id: i32,
        branch_info: BranchInfo,
        tree_info: DataBlob,
    ) -> Result<()>;

    /// Append one node. Idempotent by (branch, node id, transaction id);
    /// at the same node id the larger transaction id wins.
    async fn append_history_nodes(
        &self,
        cancel: &CancellationToken,
        shard_id: i32,
        append: HistoryNodeAppend,
    ) -> Result<()>;

    /// Remove one node write.
    async fn delete_history_nodes(
        &self,
        cancel: &CancellationToken,
        shard_id: i32,
        branch_token: Vec<u8>,
        node_id: i64,
        transaction_id: i64,
    ) -> Result<()>;

    /// Paged, deduplicated read of `[min_node_id, max_node_id)`.
    async fn read_history_branch(
        &self,
        cancel: &CancellationToken,
        request: ReadHistoryBranchRequest,
    ) -> Result<ReadHistoryBranchResponse>;

    /// Fork a new branch at `fork_node_id`; the new branch inherits
    /// `[1, fork_node_id)` through ancestor ranges.
    async fn fork_history_branch(
        &self,
        cancel: &CancellationToken,
        request: ForkHistoryBranchRequest,
    ) -> Result<()>;

    /// Delete a branch's ranges; ancestor nodes survive while another branch
    /// still references them.
    async fn delete_history_branch(
        &self,
        cancel: &CancellationToken,
        request: DeleteHistoryBranchRequest,
    ) -> Result<()>;

    /// All branches of one tree.
    async fn get_history_tree(
        &self,
        cancel: &CancellationToken,
        shard_id: i32,
        tree_id: &str,
    ) -> Result<Vec<BranchInfo>>;

    /// Paged administrative enumeration of every branch of every tree.
    ///
    /// Read-committed: branches created or deleted while paginating may be
    /// skipped or repeated across pages; consumers must tolerate both.
    async fn get_all_history_tree_branches(
        &self,
        cancel: &CancellationToken,
        page_size: usize,
        page_token: Vec<u8>,
    ) -> Result<(Vec<HistoryBranchDetail>, Vec<u8>)>;
}

// ============================================================================
// Task store (matching's task queues)
// ============================================================================

/// Durable record of one task queue partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskQueueRecord {
    /// Owning namespace.
    pub namespace_id: String,
    /// Queue name.
    pub name: String,
    /// Lease token of the matching node owning the partition.
    pub range_id: i64,
    /// Opaque queue metadata.
    pub info: DataBlob,
}

/// One dispatchable task in a task queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTask {
    /// Position in the queue.
    pub task_id: i64,
    /// Serialized task payload.
    pub blob: DataBlob,
    /// Optional expiry after which the task is garbage.
    pub expiry_time: Option<DateTime<Utc>>,
}

/// Task-queue storage used by the matching service.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create a task queue partition record.
    async fn create_task_queue(
        &self,
        cancel: &CancellationToken,
        record: TaskQueueRecord,
    ) -> Result<()>;

    /// Fetch a partition record.
    async fn get_task_queue(
        &self,
        cancel: &CancellationToken,
        namespace_id: &str,
        name: &str,
    ) -> Result<TaskQueueRecord>;

    /// Conditionally update a partition record by range id.
    async fn update_task_queue(
        &self,
        cancel: &CancellationToken,
        record: TaskQueueRecord,
        previous_range_id: i64,
    ) -> Result<()>;

    /// Append tasks under the partition's range id.
    async fn create_tasks(
        &self,
        cancel: &CancellationToken,
        namespace_id: &str,
        name: &str,
        range_id: i64,
        tasks: Vec<QueuedTask>,
    ) -> Result<()>;

    /// Read tasks with id > `exclusive_min_task_id`, up to `max_count`.
    async fn get_tasks(
        &self,
        cancel: &CancellationToken,
        namespace_id: &str,
        name: &str,
        exclusive_min_task_id: i64,
        max_count: usize,
    ) -> Result<Vec<QueuedTask>>;

    /// Delete one task.
    async fn complete_task(
        &self,
        cancel: &CancellationToken,
        namespace_id: &str,
        name: &str,
        task_id: i64,
    ) -> Result<()>;

    /// Delete every task with id < `exclusive_max_task_id`; returns how many.
    async fn complete_tasks_less_than(
        &self,
        cancel: &CancellationToken,
        namespace_id: &str,
        name: &str,
        exclusive_max_task_id: i64,
    ) -> Result<usize>;
}

// ============================================================================
// Metadata store (namespaces)
// ============================================================================

/// Durable namespace record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceRecord {
    /// Stable id.
    pub id: String,
    /// Unique name.
    pub name: String,
    /// Serialized namespace configuration.
    pub info: DataBlob,
    /// Whether the namespace replicates across clusters.
    pub is_global: bool,
    /// Value of the metadata notification counter when this record last
    /// changed.
    pub notification_version: i64,
}

/// Namespace storage.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Create a namespace; fails when the name is taken.
    async fn create_namespace(
        &self,
        cancel: &CancellationToken,
        record: NamespaceRecord,
    ) -> Result<()>;

    /// Fetch by id or name (exactly one must be provided).
    async fn get_namespace(
        &self,
        cancel: &CancellationToken,
        id: Option<&str>,
        name: Option<&str>,
    ) -> Result<NamespaceRecord>;

    /// Replace a namespace record, bumping the notification counter.
    async fn update_namespace(
        &self,
        cancel: &CancellationToken,
        record: NamespaceRecord,
    ) -> Result<()>;

    /// Rename a namespace.
    async fn rename_namespace(
        &self,
        cancel: &CancellationToken,
        previous_name: &str,
        new_name: &str,
    ) -> Result<()>;

    /// Delete by id.
    async fn delete_namespace(&self, cancel: &CancellationToken, id: &str) -> Result<()>;

    /// Paged listing.
    async fn list_namespaces(
        &self,
        cancel: &CancellationToken,
        page_size: usize,
        page_token: Vec<u8>,
    ) -> Result<(Vec<NamespaceRecord>, Vec<u8>)>;

    /// The monotone notification counter registries poll for staleness.
    async fn get_metadata(&self, cancel: &CancellationToken) -> Result<i64>;
}

// ============================================================================
// Cluster metadata store
// ============================================================================

/// Durable per-cluster metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMetadataRecord {
    /// Cluster name.
    pub cluster_name: String,
    /// Serialized cluster configuration.
    pub metadata: DataBlob,
    /// Optimistic-concurrency version.
    pub version: i64,
}

/// One live member of the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMember {
    /// Host identity.
    pub host_id: String,
    /// RPC address.
    pub rpc_address: String,
    /// Role (history, matching, frontend, worker).
    pub role: String,
    /// Session start.
    pub session_started_at: DateTime<Utc>,
    /// Heartbeat records expire after this instant.
    pub record_expiry: DateTime<Utc>,
}

/// Cluster metadata and membership storage.
#[async_trait]
pub trait ClusterMetadataStore: Send + Sync {
    /// List cluster records, paged.
    async fn list_cluster_metadata(
        &self,
        cancel: &CancellationToken,
        page_size: usize,
        page_token: Vec<u8>,
    ) -> Result<(Vec<ClusterMetadataRecord>, Vec<u8>)>;

    /// Fetch one cluster record.
    async fn get_cluster_metadata(
        &self,
        cancel: &CancellationToken,
        cluster_name: &str,
    ) -> Result<ClusterMetadataRecord>;

    /// Save conditionally on `version`; returns whether the write applied.
    async fn save_cluster_metadata(
        &self,
        cancel: &CancellationToken,
        record: ClusterMetadataRecord,
    ) -> Result<bool>;

    /// Delete one cluster record.
    async fn delete_cluster_metadata(
        &self,
        cancel: &CancellationToken,
        cluster_name: &str,
    ) -> Result<()>;

    /// List live members, excluding expired records.
    async fn get_cluster_members(&self, cancel: &CancellationToken) -> Result<Vec<ClusterMember>>;

    /// Insert or refresh a member heartbeat.
    async fn upsert_cluster_membership(
        &self,
        cancel: &CancellationToken,
        member: ClusterMember,
    ) -> Result<()>;

    /// Remove expired member records; returns how many were pruned.
    async fn prune_cluster_membership(&self, cancel: &CancellationToken) -> Result<usize>;
}

// ============================================================================
// Durable FIFO queue
// ============================================================================

/// One durable queue message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Position in the stream; dense from 0.
    pub id: i64,
    /// The payload.
    pub blob: DataBlob,
}

/// Per-consumer ack levels of a queue stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueAckLevels {
    /// Highest message id each named consumer has acknowledged.
    pub ack_levels: HashMap<String, i64>,
    /// Optimistic-concurrency version.
    pub version: i64,
}

/// Durable FIFO with ack-level tracking and a separate DLQ stream.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Append a message to the normal stream. The first message of a fresh
    /// queue takes id 0.
    async fn enqueue_message(&self, cancel: &CancellationToken, blob: DataBlob) -> Result<i64>;

    /// Read up to `max_count` messages with id > `last_message_id`. Pass
    /// [`EMPTY_QUEUE_MESSAGE_ID`] to read from the beginning.
    async fn read_messages(
        &self,
        cancel: &CancellationToken,
        last_message_id: i64,
        max_count: usize,
    ) -> Result<Vec<QueueMessage>>;

    /// Delete messages with id < `exclusive_max_message_id`.
    async fn delete_messages_before(
        &self,
        cancel: &CancellationToken,
        exclusive_max_message_id: i64,
    ) -> Result<()>;

    /// Replace the normal stream's ack levels, conditioned on version.
    async fn update_ack_levels(
        &self,
        cancel: &CancellationToken,
        ack_levels: QueueAckLevels,
    ) -> Result<()>;

    /// Fetch the normal stream's ack levels.
    async fn get_ack_levels(&self, cancel: &CancellationToken) -> Result<QueueAckLevels>;

    /// Append to the DLQ stream; returns the assigned id.
    async fn enqueue_message_to_dlq(
        &self,
        cancel: &CancellationToken,
        blob: DataBlob,
    ) -> Result<i64>;

    /// Paged DLQ read over `[inclusive_min, exclusive_max)`.
    async fn read_messages_from_dlq(
        &self,
        cancel: &CancellationToken,
        inclusive_min_message_id: i64,
        exclusive_max_message_id: i64,
        page_size: usize,
        page_token: Vec<u8>,
    ) -> Result<(Vec<QueueMessage>, Vec<u8>)>;

    /// Delete one DLQ message.
    async fn delete_message_from_dlq(
        &self,
        cancel: &CancellationToken,
        message_id: i64,
    ) -> Result<()>;

    /// Delete DLQ messages in `[inclusive_min, exclusive_max)`.
    async fn range_delete_messages_from_dlq(
        &self,
        cancel: &CancellationToken,
        inclusive_min_message_id: i64,
        exclusive_max_message_id: i64,
    ) -> Result<()>;

    /// Replace the DLQ stream's ack levels, conditioned on version.
    async fn update_dlq_ack_levels(
        &self,
        cancel: &CancellationToken,
        ack_levels: QueueAckLevels,
    ) -> Result<()>;

    /// Fetch the DLQ stream's ack levels.
    async fn get_dlq_ack_levels(&self, cancel: &CancellationToken) -> Result<QueueAckLevels>;
}

// ============================================================================
// Store handle
// ============================================================================

/// Which backend family a [`StoreHandle`] was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum StoreBackend {
    /// Everything in process memory. Tests and embedded use.
    Memory,
    /// Row stores on SQLite; execution/history state in memory.
    Sqlite,
}

/// The edge-of-system bundle of store implementations, selected once at
/// startup. Internals never branch on the backend; they hold the trait
/// objects this handle gives out.
#[derive(Clone)]
pub struct StoreHandle {
    backend: StoreBackend,
    shard: Arc<dyn ShardStore>,
    execution: Arc<dyn ExecutionStore>,
    task: Arc<dyn TaskStore>,
    metadata: Arc<dyn MetadataStore>,
    cluster: Arc<dyn ClusterMetadataStore>,
    queue: Arc<dyn Queue>,
}

impl StoreHandle {
    /// All stores in memory.
    pub fn memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            backend: StoreBackend::Memory,
            shard: store.clone(),
            execution: store.clone(),
            task: store.clone(),
            metadata: store.clone(),
            cluster: store.clone(),
            queue: store,
        }
    }

    /// Row stores (shard, metadata, cluster, queue) on SQLite; execution and
    /// history state served by the in-memory reference implementation.
    pub fn sqlite(sqlite: Arc<SqliteStore>) -> Self {
        let memory = Arc::new(MemoryStore::new());
        Self {
            backend: StoreBackend::Sqlite,
            shard: sqlite.clone(),
            execution: memory.clone(),
            task: memory,
            metadata: sqlite.clone(),
            cluster: sqlite.clone(),
            queue: sqlite,
        }
    }

    /// Which backend family this handle was built from.
    pub fn backend(&self) -> StoreBackend {
        self.backend
    }

    /// The shard store.
    pub fn shard_store(&self) -> Arc<dyn ShardStore> {
        self.shard.clone()
    }

    /// The execution store.
    pub fn execution_store(&self) -> Arc<dyn ExecutionStore> {
        self.execution.clone()
    }

    /// The task store.
    pub fn task_store(&self) -> Arc<dyn TaskStore> {
        self.task.clone()
    }

    /// The metadata store.
    pub fn metadata_store(&self) -> Arc<dyn MetadataStore> {
        self.metadata.clone()
    }

    /// The cluster metadata store.
    pub fn cluster_metadata_store(&self) -> Arc<dyn ClusterMetadataStore> {
        self.cluster.clone()
    }

    /// The durable queue.
    pub fn queue(&self) -> Arc<dyn Queue> {
        self.queue.clone()
    }
}
