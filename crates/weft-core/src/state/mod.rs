// Copyright (C) 2025 Weft Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mutable state: the in-memory, persistently backed record of one workflow
//! run, plus the machinery that turns transitions into side-effect tasks.

pub mod checksum;
pub mod mutable_state;
pub mod task_generator;
pub mod task_refresher;
pub mod timer_sequence;

pub use mutable_state::{MutableState, TransactionOutput};
pub use task_generator::TaskGenerator;
pub use task_refresher::TaskRefresher;
pub use timer_sequence::TimerSequence;

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::history::events::EMPTY_EVENT_ID;

/// Activity/timer task-status bit: no timer scheduled; regenerate all.
pub const TIMER_TASK_STATUS_NONE: u32 = 0;
/// Activity bit: a schedule-to-start timer task exists.
pub const TIMER_TASK_STATUS_SCHEDULE_TO_START: u32 = 1;
/// Activity bit: a schedule-to-close timer task exists.
pub const TIMER_TASK_STATUS_SCHEDULE_TO_CLOSE: u32 = 1 << 1;
/// Activity bit: a start-to-close timer task exists.
pub const TIMER_TASK_STATUS_START_TO_CLOSE: u32 = 1 << 2;
/// Activity bit: a heartbeat timer task exists.
pub const TIMER_TASK_STATUS_HEARTBEAT: u32 = 1 << 3;
/// User-timer status: a fire task exists.
pub const TIMER_STATUS_CREATED: u32 = 1;

/// Coarse lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum WorkflowState {
    /// Row exists, first workflow task not yet dispatched.
    Created,
    /// The run is making progress.
    Running,
    /// The run reached a terminal status.
    Completed,
    /// The run lost a conflict-resolution and is kept for reads only.
    Zombie,
}

/// Terminal-or-running status of a run, as surfaced to visibility.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
pub enum WorkflowStatus {
    /// Not terminal.
    Running,
    /// Completed successfully.
    Completed,
    /// Failed.
    Failed,
    /// Canceled cooperatively.
    Canceled,
    /// Terminated without workflow code running.
    Terminated,
    /// Closed this run, continued in a successor run.
    ContinuedAsNew,
    /// A workflow-level timeout fired.
    TimedOut,
}

impl WorkflowStatus {
    /// Whether this status ends the run.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowStatus::Running)
    }
}

/// Durable per-run execution metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    /// Owning namespace.
    pub namespace_id: String,
    /// Workflow id, unique among non-terminal runs in the namespace.
    pub workflow_id: String,
    /// Run id of the first run of this execution chain.
    pub first_execution_run_id: String,
    /// Registered workflow type.
    pub workflow_type: String,
    /// Task queue workflow tasks dispatch to.
    pub task_queue: String,
    /// Bound on a single run.
    pub workflow_run_timeout: Option<Duration>,
    /// Bound on the whole chain.
    pub workflow_execution_timeout: Option<Duration>,
    /// Default workflow-task start-to-close bound.
    pub default_workflow_task_timeout: Option<Duration>,
    /// When the run started.
    pub start_time: DateTime<Utc>,
    /// Last successful mutation time.
    pub last_update_time: DateTime<Utc>,
    /// Event batch holding the completion event, once closed.
    pub completion_event_batch_id: i64,
    /// When the run closed, once closed. Anchors retention timers.
    pub close_time: Option<DateTime<Utc>>,
    /// Whether a cancel has been requested for the run.
    pub cancel_requested: bool,
    /// Token of the branch this run currently appends to.
    pub current_branch_token: Vec<u8>,
    /// Searchable attributes for visibility.
    pub search_attributes: HashMap<String, serde_json::Value>,
    /// Parent run to notify on close, if this is a child workflow.
    pub parent_workflow_key: Option<crate::WorkflowKey>,
    /// Initiated event id in the parent, when a parent exists.
    pub parent_initiated_event_id: i64,
}

/// Durable per-run state + status pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    /// This run's id.
    pub run_id: String,
    /// Idempotency token of the start request that created the run.
    pub create_request_id: String,
    /// Coarse lifecycle state.
    pub state: WorkflowState,
    /// Visibility status.
    pub status: WorkflowStatus,
}

impl ExecutionState {
    /// Whether the run can still accept mutations.
    pub fn is_running(&self) -> bool {
        matches!(self.state, WorkflowState::Created | WorkflowState::Running)
            && self.status == WorkflowStatus::Running
    }
}

/// Pending-activity record, keyed by scheduled event id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityInfo {
    /// Scheduled event id; the map key.
    pub scheduled_event_id: i64,
    /// First event id of the batch containing the scheduled event.
    pub scheduled_event_batch_id: i64,
    /// Started event id, or [`EMPTY_EVENT_ID`] while queued.
    pub started_event_id: i64,
    /// User-visible activity id.
    pub activity_id: String,
    /// Registered activity type.
    pub activity_type: String,
    /// Task queue the activity dispatches to.
    pub task_queue: String,
    /// When the activity was scheduled.
    pub scheduled_time: DateTime<Utc>,
    /// When the current attempt started, if started.
    pub started_time: Option<DateTime<Utc>>,
    /// Bound across attempts.
    pub schedule_to_close_timeout: Option<Duration>,
    /// Bound on queue dwell.
    pub schedule_to_start_timeout: Option<Duration>,
    /// Bound on one attempt.
    pub start_to_close_timeout: Option<Duration>,
    /// Bound between heartbeats.
    pub heartbeat_timeout: Option<Duration>,
    /// Last heartbeat receipt.
    pub last_heartbeat_time: Option<DateTime<Utc>>,
    /// Which timer tasks currently exist, as TIMER_TASK_STATUS bits.
    pub timer_task_status: u32,
    /// Attempt count, 1-based.
    pub attempt: i32,
    /// Failover version that wrote this record.
    pub version: i64,
    /// Whether a cancel has been requested.
    pub cancel_requested: bool,
    /// The cancel-requested event, when one exists.
    pub cancel_request_event_id: i64,
}

impl ActivityInfo {
    /// Whether a worker has picked this activity up.
    pub fn is_started(&self) -> bool {
        self.started_event_id != EMPTY_EVENT_ID
    }
}

/// Pending user timer, keyed by timer id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerInfo {
    /// User-visible timer id; the map key.
    pub timer_id: String,
    /// The timer's started event.
    pub started_event_id: i64,
    /// When the timer fires.
    pub expiry_time: DateTime<Utc>,
    /// Whether a fire task exists ([`TIMER_STATUS_CREATED`]) or not.
    pub task_status: u32,
    /// Failover version that wrote this record.
    pub version: i64,
}

/// Pending child workflow, keyed by initiated event id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildExecutionInfo {
    /// Initiated event id; the map key.
    pub initiated_event_id: i64,
    /// First event id of the batch containing the initiated event.
    pub initiated_event_batch_id: i64,
    /// Child's started event id, or [`EMPTY_EVENT_ID`] while starting.
    pub started_event_id: i64,
    /// Child namespace.
    pub namespace: String,
    /// Child workflow id.
    pub workflow_id: String,
    /// Child run id once started.
    pub run_id: Option<String>,
    /// Child workflow type.
    pub workflow_type: String,
    /// Idempotency token for the child start.
    pub create_request_id: String,
    /// Failover version that wrote this record.
    pub version: i64,
}

impl ChildExecutionInfo {
    /// Whether the child has started.
    pub fn is_started(&self) -> bool {
        self.started_event_id != EMPTY_EVENT_ID
    }
}

/// Pending external cancel request, keyed by initiated event id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestCancelInfo {
    /// Initiated event id; the map key.
    pub initiated_event_id: i64,
    /// First event id of the batch containing the initiated event.
    pub initiated_event_batch_id: i64,
    /// Idempotency token for the cancel delivery.
    pub cancel_request_id: String,
    /// Target namespace.
    pub target_namespace: String,
    /// Target workflow id.
    pub target_workflow_id: String,
    /// Target run id, if pinned.
    pub target_run_id: Option<String>,
    /// Failover version that wrote this record.
    pub version: i64,
}

/// Pending external signal, keyed by initiated event id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalExternalInfo {
    /// Initiated event id; the map key.
    pub initiated_event_id: i64,
    /// First event id of the batch containing the initiated event.
    pub initiated_event_batch_id: i64,
    /// Target namespace.
    pub target_namespace: String,
    /// Target workflow id.
    pub target_workflow_id: String,
    /// Target run id, if pinned.
    pub target_run_id: Option<String>,
    /// Signal name.
    pub signal_name: String,
    /// Failover version that wrote this record.
    pub version: i64,
}

/// Stage a persisted update record has reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, strum::Display)]
pub enum UpdateStage {
    /// Request received, nothing durable yet.
    Created,
    /// Durably admitted into mutable state.
    Admitted,
    /// The worker accepted the update.
    Accepted,
    /// The worker produced an outcome.
    Completed,
    /// Abandoned before completion.
    Aborted,
}

impl UpdateStage {
    /// Whether no further stage can follow.
    pub fn is_terminal(&self) -> bool {
        matches!(self, UpdateStage::Completed | UpdateStage::Aborted)
    }
}

/// Persisted record of a workflow update, keyed by update id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateInfo {
    /// The update's id; the map key.
    pub update_id: String,
    /// Stage reached.
    pub stage: UpdateStage,
    /// Outcome, present once completed.
    pub outcome: Option<serde_json::Value>,
    /// Event id of the acceptance, once accepted.
    pub accepted_event_id: i64,
}

/// Variant of a workflow task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum WorkflowTaskType {
    /// Persisted, event-backed workflow task.
    Normal,
    /// In-memory only; no events, no generated tasks; cheap to abandon.
    Speculative,
    /// Retry workflow task whose events materialize only on completion.
    Transient,
}

/// The single pending workflow task of a run, when one exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTaskInfo {
    /// Scheduled event id. Speculative tasks reserve the id without
    /// appending the event.
    pub scheduled_event_id: i64,
    /// Started event id, or [`EMPTY_EVENT_ID`] while queued.
    pub started_event_id: i64,
    /// Variant of this workflow task.
    pub task_type: WorkflowTaskType,
    /// Task queue it dispatches to.
    pub task_queue: String,
    /// When it was scheduled.
    pub scheduled_time: DateTime<Utc>,
    /// When a worker started it, if started.
    pub started_time: Option<DateTime<Utc>>,
    /// Start-to-close bound.
    pub start_to_close_timeout: Option<Duration>,
    /// Attempt count, 1-based.
    pub attempt: i32,
    /// Poller-supplied dedup id for the started event.
    pub request_id: String,
}

impl WorkflowTaskInfo {
    /// Whether a worker has picked this workflow task up.
    pub fn is_started(&self) -> bool {
        self.started_event_id != EMPTY_EVENT_ID
    }
}
