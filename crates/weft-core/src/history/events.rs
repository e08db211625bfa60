// Copyright (C) 2025 Weft Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! History events.
//!
//! Event ids within one branch form the contiguous sequence
//! `1..next_event_id`. Attributes are a tagged enum so every decision site
//! matches exhaustively; the discriminant-only [`EventKind`] exists for code
//! that cares what an event is but not what it carries.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event id value meaning "no event".
pub const EMPTY_EVENT_ID: i64 = 0;

/// The first event id of any branch.
pub const FIRST_EVENT_ID: i64 = 1;

/// Why a workflow or activity timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum TimeoutKind {
    /// Time between scheduling and a worker picking the task up.
    ScheduleToStart,
    /// Time between scheduling and completion, spanning retries.
    ScheduleToClose,
    /// Time between start and completion of one attempt.
    StartToClose,
    /// Time allowed between heartbeats.
    Heartbeat,
}

/// A single history event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    /// Position in the branch, 1-based and contiguous.
    pub event_id: i64,
    /// Failover version of the cluster that wrote the event.
    pub version: i64,
    /// Wall-clock time the event was generated.
    pub event_time: DateTime<Utc>,
    /// What happened.
    pub attributes: EventAttributes,
}

impl HistoryEvent {
    /// The discriminant of this event's attributes.
    pub fn kind(&self) -> EventKind {
        EventKind::from(&self.attributes)
    }
}

/// Typed payload of a history event.
///
/// The derived [`EventKind`] is the discriminant-only view, for code that
/// cares what an event is but not what it carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, strum::EnumDiscriminants)]
#[strum_discriminants(name(EventKind), derive(Hash, strum::Display), allow(missing_docs))]
#[serde(tag = "type")]
pub enum EventAttributes {
    /// First event of every run.
    WorkflowExecutionStarted {
        /// Registered workflow type name.
        workflow_type: String,
        /// Task queue workflow tasks dispatch to.
        task_queue: String,
        /// Caller-supplied input payload.
        input: Option<serde_json::Value>,
        /// Bound on a single run.
        workflow_run_timeout: Option<Duration>,
        /// Bound on the whole execution chain.
        workflow_execution_timeout: Option<Duration>,
        /// Default start-to-close bound on workflow tasks.
        workflow_task_timeout: Option<Duration>,
        /// Run id of the first run in this execution chain.
        first_execution_run_id: String,
        /// Run this one continued from, if any.
        continued_execution_run_id: Option<String>,
        /// Delay before the first workflow task (cron / retry backoff).
        first_workflow_task_backoff: Option<Duration>,
        /// Initial search attributes.
        search_attributes: HashMap<String, serde_json::Value>,
    },
    /// Terminal: completed successfully.
    WorkflowExecutionCompleted {
        /// Id of the workflow task that reported completion.
        workflow_task_completed_event_id: i64,
        /// Result payload.
        result: Option<serde_json::Value>,
    },
    /// Terminal: failed.
    WorkflowExecutionFailed {
        /// Id of the workflow task that reported the failure.
        workflow_task_completed_event_id: i64,
        /// Failure message.
        failure: String,
    },
    /// Terminal: a workflow-level timeout fired.
    WorkflowExecutionTimedOut {
        /// Whether a retry run follows.
        retry_state: Option<String>,
    },
    /// Terminal: terminated from outside, no workflow code ran.
    WorkflowExecutionTerminated {
        /// Operator-supplied reason.
        reason: String,
        /// Who asked.
        identity: String,
    },
    /// Terminal: canceled cooperatively.
    WorkflowExecutionCanceled {
        /// Id of the workflow task that reported cancellation.
        workflow_task_completed_event_id: i64,
        /// Optional payload.
        details: Option<serde_json::Value>,
    },
    /// A cancel was requested; the workflow decides when to act on it.
    WorkflowExecutionCancelRequested {
        /// Requester identity.
        identity: String,
        /// External initiator event, when cancelled by another workflow.
        external_initiated_event_id: Option<i64>,
    },
    /// Terminal for this run; a successor run begins.
    WorkflowExecutionContinuedAsNew {
        /// Id of the workflow task that closed this run.
        workflow_task_completed_event_id: i64,
        /// Run id of the successor.
        new_execution_run_id: String,
    },
    /// A signal was delivered to the workflow.
    WorkflowExecutionSignaled {
        /// Signal name.
        signal_name: String,
        /// Signal payload.
        input: Option<serde_json::Value>,
        /// Sender identity.
        identity: String,
    },

    /// A workflow task was scheduled.
    WorkflowTaskScheduled {
        /// Task queue it dispatches to.
        task_queue: String,
        /// Start-to-close bound.
        start_to_close_timeout: Option<Duration>,
        /// Attempt count, 1-based.
        attempt: i32,
    },
    /// A worker picked the workflow task up.
    WorkflowTaskStarted {
        /// The matching scheduled event.
        scheduled_event_id: i64,
        /// Poller-supplied dedup id.
        request_id: String,
    },
    /// The worker finished the workflow task.
    WorkflowTaskCompleted {
        /// The matching scheduled event.
        scheduled_event_id: i64,
        /// The matching started event.
        started_event_id: i64,
        /// Worker identity.
        identity: String,
    },
    /// The worker failed the workflow task.
    WorkflowTaskFailed {
        /// The matching scheduled event.
        scheduled_event_id: i64,
        /// The matching started event.
        started_event_id: i64,
        /// Failure cause.
        cause: String,
    },
    /// A workflow-task timer fired.
    WorkflowTaskTimedOut {
        /// The matching scheduled event.
        scheduled_event_id: i64,
        /// The matching started event, or 0 if never started.
        started_event_id: i64,
        /// Which timeout fired.
        timeout_kind: TimeoutKind,
    },

    /// An activity was scheduled.
    ActivityTaskScheduled {
        /// User-visible activity id, unique among pending activities.
        activity_id: String,
        /// Registered activity type name.
        activity_type: String,
        /// Task queue it dispatches to.
        task_queue: String,
        /// Input payload.
        input: Option<serde_json::Value>,
        /// Bound across all attempts.
        schedule_to_close_timeout: Option<Duration>,
        /// Bound on queue dwell time.
        schedule_to_start_timeout: Option<Duration>,
        /// Bound on one attempt.
        start_to_close_timeout: Option<Duration>,
        /// Bound between heartbeats.
        heartbeat_timeout: Option<Duration>,
        /// The workflow task that produced this command.
        workflow_task_completed_event_id: i64,
    },
    /// A worker picked the activity up.
    ActivityTaskStarted {
        /// The matching scheduled event.
        scheduled_event_id: i64,
        /// Attempt count, 1-based.
        attempt: i32,
        /// Worker identity.
        identity: String,
    },
    /// The activity completed.
    ActivityTaskCompleted {
        /// The matching scheduled event.
        scheduled_event_id: i64,
        /// The matching started event.
        started_event_id: i64,
        /// Result payload.
        result: Option<serde_json::Value>,
    },
    /// The activity failed.
    ActivityTaskFailed {
        /// The matching scheduled event.
        scheduled_event_id: i64,
        /// The matching started event.
        started_event_id: i64,
        /// Failure message.
        failure: String,
    },
    /// An activity timer fired.
    ActivityTaskTimedOut {
        /// The matching scheduled event.
        scheduled_event_id: i64,
        /// The matching started event, or 0 if never started.
        started_event_id: i64,
        /// Which timeout fired.
        timeout_kind: TimeoutKind,
    },
    /// The workflow asked to cancel a pending activity.
    ActivityTaskCancelRequested {
        /// The activity's scheduled event.
        scheduled_event_id: i64,
        /// The workflow task that produced this command.
        workflow_task_completed_event_id: i64,
    },
    /// The activity acknowledged cancellation.
    ActivityTaskCanceled {
        /// The matching scheduled event.
        scheduled_event_id: i64,
        /// The matching started event, or 0 if never started.
        started_event_id: i64,
        /// The cancel-requested event being honored.
        latest_cancel_requested_event_id: i64,
    },

    /// A user timer started.
    TimerStarted {
        /// User-visible timer id, unique among pending timers.
        timer_id: String,
        /// Delay until firing.
        start_to_fire_timeout: Duration,
        /// The workflow task that produced this command.
        workflow_task_completed_event_id: i64,
    },
    /// A user timer fired.
    TimerFired {
        /// The timer's id.
        timer_id: String,
        /// The matching started event.
        started_event_id: i64,
    },
    /// A user timer was canceled before firing.
    TimerCanceled {
        /// The timer's id.
        timer_id: String,
        /// The matching started event.
        started_event_id: i64,
        /// The workflow task that produced this command.
        workflow_task_completed_event_id: i64,
    },

    /// The workflow asked to start a child workflow.
    StartChildWorkflowExecutionInitiated {
        /// Target namespace.
        namespace: String,
        /// Child workflow id.
        workflow_id: String,
        /// Child workflow type.
        workflow_type: String,
        /// Child task queue.
        task_queue: String,
        /// Input payload.
        input: Option<serde_json::Value>,
        /// The workflow task that produced this command.
        workflow_task_completed_event_id: i64,
    },
    /// The child started.
    ChildWorkflowExecutionStarted {
        /// The matching initiated event.
        initiated_event_id: i64,
        /// The child's run id.
        run_id: String,
    },
    /// The child completed.
    ChildWorkflowExecutionCompleted {
        /// The matching initiated event.
        initiated_event_id: i64,
        /// The matching started event.
        started_event_id: i64,
        /// Result payload.
        result: Option<serde_json::Value>,
    },
    /// The child failed.
    ChildWorkflowExecutionFailed {
        /// The matching initiated event.
        initiated_event_id: i64,
        /// The matching started event.
        started_event_id: i64,
        /// Failure message.
        failure: String,
    },
    /// The child was terminated.
    ChildWorkflowExecutionTerminated {
        /// The matching initiated event.
        initiated_event_id: i64,
        /// The matching started event.
        started_event_id: i64,
    },
    /// The child timed out.
    ChildWorkflowExecutionTimedOut {
        /// The matching initiated event.
        initiated_event_id: i64,
        /// The matching started event.
        started_event_id: i64,
        /// Which timeout fired.
        timeout_kind: TimeoutKind,
    },
    /// The child could not be started at all.
    StartChildWorkflowExecutionFailed {
        /// The matching initiated event.
        initiated_event_id: i64,
        /// Why the start failed.
        cause: String,
    },

    /// The workflow asked to cancel an external workflow.
    RequestCancelExternalWorkflowExecutionInitiated {
        /// Target namespace.
        namespace: String,
        /// Target workflow id.
        workflow_id: String,
        /// Target run id, if pinned.
        run_id: Option<String>,
        /// The workflow task that produced this command.
        workflow_task_completed_event_id: i64,
    },
    /// The external cancel request was delivered.
    ExternalWorkflowExecutionCancelRequested {
        /// The matching initiated event.
        initiated_event_id: i64,
    },
    /// The external cancel request failed.
    RequestCancelExternalWorkflowExecutionFailed {
        /// The matching initiated event.
        initiated_event_id: i64,
        /// Why delivery failed.
        cause: String,
    },

    /// The workflow asked to signal an external workflow.
    SignalExternalWorkflowExecutionInitiated {
        /// Target namespace.
        namespace: String,
        /// Target workflow id.
        workflow_id: String,
        /// Target run id, if pinned.
        run_id: Option<String>,
        /// Signal name.
        signal_name: String,
        /// Signal payload.
        input: Option<serde_json::Value>,
        /// The workflow task that produced this command.
        workflow_task_completed_event_id: i64,
    },
    /// The external signal was delivered.
    ExternalWorkflowExecutionSignaled {
        /// The matching initiated event.
        initiated_event_id: i64,
    },
    /// The external signal failed.
    SignalExternalWorkflowExecutionFailed {
        /// The matching initiated event.
        initiated_event_id: i64,
        /// Why delivery failed.
        cause: String,
    },

    /// Search attributes changed mid-run.
    UpsertWorkflowSearchAttributes {
        /// The new attribute values (merged over existing).
        search_attributes: HashMap<String, serde_json::Value>,
        /// The workflow task that produced this command.
        workflow_task_completed_event_id: i64,
    },

    /// A workflow update was accepted by the worker.
    WorkflowExecutionUpdateAccepted {
        /// The update's id.
        update_id: String,
        /// The workflow task that accepted it.
        accepted_event_id: i64,
    },
    /// A workflow update completed with an outcome.
    WorkflowExecutionUpdateCompleted {
        /// The update's id.
        update_id: String,
        /// Serialized outcome.
        outcome: serde_json::Value,
    },
}
