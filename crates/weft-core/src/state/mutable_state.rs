// Copyright (C) 2025 Weft Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The in-memory workflow record and its typed mutators.
//!
//! Every mutator does two things and nothing else: it mutates the in-memory
//! record (appending or buffering a history event, updating the keyed
//! sub-collections) and it queues side-effect tasks through the task
//! generator. No mutator performs I/O. After a batch of mutators the caller
//! closes the transaction, which emits a mutation or snapshot for the
//! execution store to persist atomically.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::history::branch::BranchInfo;
use crate::history::events::{
    EventAttributes, HistoryEvent, TimeoutKind, EMPTY_EVENT_ID, FIRST_EVENT_ID,
};
use crate::history::EventKind;
use crate::persistence::{WorkflowMutation, WorkflowSnapshot};
use crate::state::checksum;
use crate::state::task_generator::TaskGenerator;
use crate::state::timer_sequence::TimerSequence;
use crate::state::{
    ActivityInfo, ChildExecutionInfo, ExecutionInfo, ExecutionState, RequestCancelInfo,
    SignalExternalInfo, TimerInfo, UpdateInfo, UpdateStage, WorkflowState, WorkflowStatus,
    WorkflowTaskInfo, WorkflowTaskType, TIMER_TASK_STATUS_NONE,
};
use crate::tasks::{Task, TaskAttributes, TaskCategory, TaskKey};
use crate::WorkflowKey;

/// Everything a workflow start needs, in one request struct.
#[derive(Debug, Clone)]
pub struct StartWorkflowRequest {
    /// Registered workflow type.
    pub workflow_type: String,
    /// Task queue workflow tasks dispatch to.
    pub task_queue: String,
    /// Caller-supplied input.
    pub input: Option<serde_json::Value>,
    /// Bound on a single run.
    pub workflow_run_timeout: Option<Duration>,
    /// Bound on the whole chain.
    pub workflow_execution_timeout: Option<Duration>,
    /// Default workflow-task start-to-close bound.
    pub workflow_task_timeout: Option<Duration>,
    /// Idempotency token of the start request.
    pub create_request_id: String,
    /// Delay before the first workflow task.
    pub first_workflow_task_backoff: Option<Duration>,
    /// Initial search attributes.
    pub search_attributes: HashMap<String, serde_json::Value>,
    /// Run this one continues from, if any.
    pub continued_execution_run_id: Option<String>,
}

/// Per-collection keys touched since the transaction opened.
#[derive(Debug, Default, Clone)]
struct DirtyState {
    activity_upserts: HashSet<i64>,
    activity_deletes: HashSet<i64>,
    timer_upserts: HashSet<String>,
    timer_deletes: HashSet<String>,
    child_upserts: HashSet<i64>,
    child_deletes: HashSet<i64>,
    request_cancel_upserts: HashSet<i64>,
    request_cancel_deletes: HashSet<i64>,
    signal_external_upserts: HashSet<i64>,
    signal_external_deletes: HashSet<i64>,
    signal_requested_upserts: HashSet<String>,
    signal_requested_deletes: HashSet<String>,
    update_upserts: HashSet<String>,
    update_deletes: HashSet<String>,
    new_buffered: Vec<HistoryEvent>,
    cleared_buffer: bool,
}

/// What a closed transaction hands the commit path.
#[derive(Debug, Clone)]
pub struct TransactionOutput {
    /// The delta to persist.
    pub mutation: WorkflowMutation,
    /// Events appended by this transaction, contiguous from
    /// `mutation.next_event_id - events.len()`.
    pub events: Vec<HistoryEvent>,
}

/// In-memory mutable state of one workflow run.
#[derive(Debug, Clone)]
pub struct MutableState {
    shard_id: i32,
    workflow_key: WorkflowKey,
    execution_info: ExecutionInfo,
    execution_state: ExecutionState,
    next_event_id: i64,
    db_record_version: i64,
    last_write_version: i64,

    activity_infos: HashMap<i64, ActivityInfo>,
    timer_infos: HashMap<String, TimerInfo>,
    child_execution_infos: HashMap<i64, ChildExecutionInfo>,
    request_cancel_infos: HashMap<i64, RequestCancelInfo>,
    signal_external_infos: HashMap<i64, SignalExternalInfo>,
    signal_requested_ids: HashSet<String>,
    update_infos: HashMap<String, UpdateInfo>,
    workflow_task: Option<WorkflowTaskInfo>,
    buffered_events: Vec<HistoryEvent>,

    // Transaction-scoped.
    current_batch: Vec<HistoryEvent>,
    tasks: HashMap<TaskCategory, Vec<Task>>,
    dirty: DirtyState,
}

impl MutableState {
    /// Create fresh mutable state for a workflow start. The caller runs
    /// [`add_workflow_execution_started_event`] next.
    ///
    /// [`add_workflow_execution_started_event`]: MutableState::add_workflow_execution_started_event
    pub fn new_for_start(shard_id: i32, workflow_key: WorkflowKey, branch: &BranchInfo) -> Result<Self> {
        let now = Utc::now();
        let execution_info = ExecutionInfo {
            namespace_id: workflow_key.namespace_id.clone(),
            workflow_id: workflow_key.workflow_id.clone(),
            first_execution_run_id: workflow_key.run_id.clone(),
            workflow_type: String::new(),
            task_queue: String::new(),
            workflow_run_timeout: None,
            workflow_execution_timeout: None,
            default_workflow_task_timeout: None,
            start_time: now,
            last_update_time: now,
            completion_event_batch_id: EMPTY_EVENT_ID,
            close_time: None,
            cancel_requested: false,
            current_branch_token: branch.to_token()?,
            search_attributes: HashMap::new(),
            parent_workflow_key: None,
            parent_initiated_event_id: EMPTY_EVENT_ID,
        };
        let execution_state = ExecutionState {
            run_id: workflow_key.run_id.clone(),
            create_request_id: String::new(),
            state: WorkflowState::Created,
            status: WorkflowStatus::Running,
        };
        Ok(Self {
            shard_id,
            workflow_key,
            execution_info,
            execution_state,
            next_event_id: FIRST_EVENT_ID,
            db_record_version: 0,
            last_write_version: 0,
            activity_infos: HashMap::new(),
            timer_infos: HashMap::new(),
            child_execution_infos: HashMap::new(),
            request_cancel_infos: HashMap::new(),
            signal_external_infos: HashMap::new(),
            signal_requested_ids: HashSet::new(),
            update_infos: HashMap::new(),
            workflow_task: None,
            buffered_events: Vec::new(),
            current_batch: Vec::new(),
            tasks: HashMap::new(),
            dirty: DirtyState::default(),
        })
    }

    /// Rehydrate mutable state from a stored snapshot.
    pub fn from_snapshot(shard_id: i32, snapshot: WorkflowSnapshot) -> Self {
        Self {
            shard_id,
            workflow_key: snapshot.workflow_key,
            execution_info: snapshot.execution_info,
            execution_state: snapshot.execution_state,
            next_event_id: snapshot.next_event_id,
            db_record_version: snapshot.db_record_version,
            last_write_version: snapshot.last_write_version,
            activity_infos: snapshot.activity_infos,
            timer_infos: snapshot.timer_infos,
            child_execution_infos: snapshot.child_execution_infos,
            request_cancel_infos: snapshot.request_cancel_infos,
            signal_external_infos: snapshot.signal_external_infos,
            signal_requested_ids: snapshot.signal_requested_ids,
            update_infos: snapshot.update_infos,
            workflow_task: snapshot.workflow_task,
            buffered_events: snapshot.buffered_events,
            current_batch: Vec::new(),
            tasks: HashMap::new(),
            dirty: DirtyState::default(),
        }
    }

    // ---- accessors ---------------------------------------------------------

    /// The run's identity.
    pub fn workflow_key(&self) -> &WorkflowKey {
        &self.workflow_key
    }

    /// The owning shard.
    pub fn shard_id(&self) -> i32 {
        self.shard_id
    }

    /// Execution metadata.
    pub fn execution_info(&self) -> &ExecutionInfo {
        &self.execution_info
    }

    /// State/status pair.
    pub fn execution_state(&self) -> &ExecutionState {
        &self.execution_state
    }

    /// Id the next appended event will take.
    pub fn next_event_id(&self) -> i64 {
        self.next_event_id
    }

    /// Current optimistic-concurrency token.
    pub fn db_record_version(&self) -> i64 {
        self.db_record_version
    }

    /// Whether the run can still accept mutations.
    pub fn is_workflow_execution_running(&self) -> bool {
        self.execution_state.is_running()
    }

    /// Whether a workflow task is pending (scheduled or started).
    pub fn has_pending_workflow_task(&self) -> bool {
        self.workflow_task.is_some()
    }

    /// The pending workflow task, when one exists.
    pub fn pending_workflow_task(&self) -> Option<&WorkflowTaskInfo> {
        self.workflow_task.as_ref()
    }

    /// Whether any events are buffered.
    pub fn has_buffered_events(&self) -> bool {
        !self.buffered_events.is_empty()
    }

    /// Pending activities.
    pub fn pending_activity_infos(&self) -> &HashMap<i64, ActivityInfo> {
        &self.activity_infos
    }

    /// Pending user timers.
    pub fn pending_timer_infos(&self) -> &HashMap<String, TimerInfo> {
        &self.timer_infos
    }

    /// Pending children.
    pub fn pending_child_execution_infos(&self) -> &HashMap<i64, ChildExecutionInfo> {
        &self.child_execution_infos
    }

    /// Pending external cancels.
    pub fn pending_request_cancel_infos(&self) -> &HashMap<i64, RequestCancelInfo> {
        &self.request_cancel_infos
    }

    /// Pending external signals.
    pub fn pending_signal_external_infos(&self) -> &HashMap<i64, SignalExternalInfo> {
        &self.signal_external_infos
    }

    /// Known update records.
    pub fn update_infos(&self) -> &HashMap<String, UpdateInfo> {
        &self.update_infos
    }

    /// The branch this run currently appends to.
    pub fn current_branch_token(&self) -> &[u8] {
        &self.execution_info.current_branch_token
    }

    /// Tasks queued since the transaction opened, grouped by category.
    pub fn transaction_tasks(&self) -> &HashMap<TaskCategory, Vec<Task>> {
        &self.tasks
    }

    // ---- event plumbing ----------------------------------------------------

    fn assert_running(&self) -> Result<()> {
        if !self.is_workflow_execution_running() {
            return Err(CoreError::WorkflowCompleted);
        }
        Ok(())
    }

    fn make_event(&self, event_id: i64, attributes: EventAttributes) -> HistoryEvent {
        HistoryEvent {
            event_id,
            version: self.last_write_version,
            event_time: Utc::now(),
            attributes,
        }
    }

    /// Append an event to the current batch, assigning the next event id.
    fn append_event(&mut self, attributes: EventAttributes) -> HistoryEvent {
        let event = self.make_event(self.next_event_id, attributes);
        self.next_event_id += 1;
        self.current_batch.push(event.clone());
        self.execution_info.last_update_time = event.event_time;
        event
    }

    fn should_buffer(&self, kind: EventKind) -> bool {
        let workflow_task_started = self
            .workflow_task
            .as_ref()
            .map(|wt| wt.is_started())
            .unwrap_or(false);
        workflow_task_started && is_bufferable(kind)
    }

    /// Append or buffer an event depending on workflow-task state. Buffered
    /// events carry no id until the flush assigns contiguous ones.
    fn append_or_buffer(&mut self, attributes: EventAttributes) -> HistoryEvent {
        let kind = EventKind::from(&attributes);
        if self.should_buffer(kind) {
            let event = self.make_event(EMPTY_EVENT_ID, attributes);
            self.buffered_events.push(event.clone());
            self.dirty.new_buffered.push(event.clone());
            event
        } else {
            self.append_event(attributes)
        }
    }

    /// Flush buffered events into the branch with contiguous ids.
    fn flush_buffered_events(&mut self) {
        if self.buffered_events.is_empty() {
            return;
        }
        let buffered = std::mem::take(&mut self.buffered_events);
        for mut event in buffered {
            event.event_id = self.next_event_id;
            self.next_event_id += 1;
            self.current_batch.push(event);
        }
        self.dirty.cleared_buffer = true;
        self.dirty.new_buffered.clear();
    }

    /// Queue a side-effect task. Task ids are assigned at commit.
    pub(crate) fn add_task(&mut self, key: TaskKey, attrs: TaskAttributes) {
        let task = Task::new(key, self.workflow_key.clone(), attrs);
        self.tasks.entry(task.category()).or_default().push(task);
    }

    // ---- workflow lifecycle ------------------------------------------------

    /// Record the start event and initialize execution metadata. Must be the
    /// first mutator applied to state from [`MutableState::new_for_start`].
    pub fn add_workflow_execution_started_event(
        &mut self,
        request: StartWorkflowRequest,
    ) -> Result<HistoryEvent> {
        if self.next_event_id != FIRST_EVENT_ID {
            return Err(CoreError::internal(
                "workflow start must be the first event of a run",
            ));
        }

        self.execution_info.workflow_type = request.workflow_type.clone();
        self.execution_info.task_queue = request.task_queue.clone();
        self.execution_info.workflow_run_timeout = request.workflow_run_timeout;
        self.execution_info.workflow_execution_timeout = request.workflow_execution_timeout;
        self.execution_info.default_workflow_task_timeout = request.workflow_task_timeout;
        self.execution_info.search_attributes = request.search_attributes.clone();
        self.execution_state.create_request_id = request.create_request_id.clone();
        self.execution_state.state = WorkflowState::Created;
        self.execution_state.status = WorkflowStatus::Running;

        let event = self.append_event(EventAttributes::WorkflowExecutionStarted {
            workflow_type: request.workflow_type,
            task_queue: request.task_queue,
            input: request.input,
            workflow_run_timeout: request.workflow_run_timeout,
            workflow_execution_timeout: request.workflow_execution_timeout,
            workflow_task_timeout: request.workflow_task_timeout,
            first_execution_run_id: self.execution_info.first_execution_run_id.clone(),
            continued_execution_run_id: request.continued_execution_run_id,
            first_workflow_task_backoff: request.first_workflow_task_backoff,
            search_attributes: request.search_attributes,
        });

        let generator = TaskGenerator::default();
        generator.generate_workflow_start_tasks(self, request.first_workflow_task_backoff)?;
        generator.generate_record_workflow_started_tasks(self)?;
        Ok(event)
    }

    fn close_workflow(
        &mut self,
        status: WorkflowStatus,
        attributes: EventAttributes,
        retention: Duration,
    ) -> Result<HistoryEvent> {
        self.assert_running()?;
        // A close forces any buffered events into the branch first so the
        // terminal event is last.
        self.flush_buffered_events();
        let event = self.append_event(attributes);
        self.execution_state.state = WorkflowState::Completed;
        self.execution_state.status = status;
        self.execution_info.completion_event_batch_id = self
            .current_batch
            .first()
            .map(|e| e.event_id)
            .unwrap_or(event.event_id);
        self.execution_info.close_time = Some(event.event_time);
        self.workflow_task = None;
        TaskGenerator::new(retention).generate_workflow_close_tasks(self)?;
        Ok(event)
    }

    /// Complete the workflow successfully.
    pub fn add_workflow_execution_completed_event(
        &mut self,
        workflow_task_completed_event_id: i64,
        result: Option<serde_json::Value>,
        retention: Duration,
    ) -> Result<HistoryEvent> {
        self.close_workflow(
            WorkflowStatus::Completed,
            EventAttributes::WorkflowExecutionCompleted {
                workflow_task_completed_event_id,
                result,
            },
            retention,
        )
    }

    /// Fail the workflow.
    pub fn add_workflow_execution_failed_event(
        &mut self,
        workflow_task_completed_event_id: i64,
        failure: impl Into<String>,
        retention: Duration,
    ) -> Result<HistoryEvent> {
        self.close_workflow(
            WorkflowStatus::Failed,
            EventAttributes::WorkflowExecutionFailed {
                workflow_task_completed_event_id,
                failure: failure.into(),
            },
            retention,
        )
    }

    /// Close the workflow because a workflow-level timeout fired.
    pub fn add_workflow_execution_timed_out_event(
        &mut self,
        retention: Duration,
    ) -> Result<HistoryEvent> {
        self.close_workflow(
            WorkflowStatus::TimedOut,
            EventAttributes::WorkflowExecutionTimedOut { retry_state: None },
            retention,
        )
    }

    /// Terminate the workflow from outside.
    pub fn add_workflow_execution_terminated_event(
        &mut self,
        reason: impl Into<String>,
        identity: impl Into<String>,
        retention: Duration,
    ) -> Result<HistoryEvent> {
        self.close_workflow(
            WorkflowStatus::Terminated,
            EventAttributes::WorkflowExecutionTerminated {
                reason: reason.into(),
                identity: identity.into(),
            },
            retention,
        )
    }

    /// Close the workflow as canceled.
    pub fn add_workflow_execution_canceled_event(
        &mut self,
        workflow_task_completed_event_id: i64,
        details: Option<serde_json::Value>,
        retention: Duration,
    ) -> Result<HistoryEvent> {
        self.close_workflow(
            WorkflowStatus::Canceled,
            EventAttributes::WorkflowExecutionCanceled {
                workflow_task_completed_event_id,
                details,
            },
            retention,
        )
    }

    /// Close this run and hand off to a successor run.
    pub fn add_workflow_execution_continued_as_new_event(
        &mut self,
        workflow_task_completed_event_id: i64,
        new_execution_run_id: impl Into<String>,
        retention: Duration,
    ) -> Result<HistoryEvent> {
        self.close_workflow(
            WorkflowStatus::ContinuedAsNew,
            EventAttributes::WorkflowExecutionContinuedAsNew {
                workflow_task_completed_event_id,
                new_execution_run_id: new_execution_run_id.into(),
            },
            retention,
        )
    }

    /// Record a cancel request without closing the run.
    pub fn add_workflow_execution_cancel_requested_event(
        &mut self,
        identity: impl Into<String>,
        external_initiated_event_id: Option<i64>,
    ) -> Result<HistoryEvent> {
        self.assert_running()?;
        if self.execution_info.cancel_requested {
            return Err(CoreError::CurrentWorkflowConditionFailed {
                message: "cancellation already requested".to_string(),
            });
        }
        self.execution_info.cancel_requested = true;
        Ok(
            self.append_or_buffer(EventAttributes::WorkflowExecutionCancelRequested {
                identity: identity.into(),
                external_initiated_event_id,
            }),
        )
    }

    /// Deliver a signal to the workflow, deduplicated by request id.
    /// Returns `None` when the request id was already seen.
    pub fn add_workflow_execution_signaled_event(
        &mut self,
        signal_name: impl Into<String>,
        input: Option<serde_json::Value>,
        identity: impl Into<String>,
        request_id: Option<String>,
    ) -> Result<Option<HistoryEvent>> {
        self.assert_running()?;
        if let Some(request_id) = &request_id {
            if self.signal_requested_ids.contains(request_id) {
                return Ok(None);
            }
            self.signal_requested_ids.insert(request_id.clone());
            self.dirty.signal_requested_upserts.insert(request_id.clone());
        }
        Ok(Some(self.append_or_buffer(
            EventAttributes::WorkflowExecutionSignaled {
                signal_name: signal_name.into(),
                input,
                identity: identity.into(),
            },
        )))
    }

    /// Forget a signal dedup id, re-admitting its request id.
    pub fn remove_signal_requested_id(&mut self, request_id: &str) {
        if self.signal_requested_ids.remove(request_id) {
            self.dirty.signal_requested_upserts.remove(request_id);
            self.dirty
                .signal_requested_deletes
                .insert(request_id.to_string());
        }
    }

    /// Merge new search attributes and queue a visibility refresh.
    pub fn add_upsert_search_attributes_event(
        &mut self,
        workflow_task_completed_event_id: i64,
        search_attributes: HashMap<String, serde_json::Value>,
    ) -> Result<HistoryEvent> {
        self.assert_running()?;
        for (key, value) in &search_attributes {
            self.execution_info
                .search_attributes
                .insert(key.clone(), value.clone());
        }
        let event = self.append_event(EventAttributes::UpsertWorkflowSearchAttributes {
            search_attributes,
            workflow_task_completed_event_id,
        });
        TaskGenerator::default().generate_upsert_visibility_task(self)?;
        Ok(event)
    }

    // ---- workflow task -----------------------------------------------------

    /// Schedule a workflow task.
    ///
    /// Exactly one workflow task may be pending; scheduling over a pending
    /// one is a programming error, not a transient condition. A speculative
    /// request is demoted to Normal when buffered events exist, because those
    /// events will need a persisted workflow task to flush into.
    pub fn add_workflow_task_scheduled_event(
        &mut self,
        bypass_task_generation: bool,
        task_type: WorkflowTaskType,
    ) -> Result<WorkflowTaskInfo> {
        self.assert_running()?;
        if self.workflow_task.is_some() {
            return Err(CoreError::internal(
                "cannot schedule workflow task while one is pending",
            ));
        }

        let effective_type = match task_type {
            WorkflowTaskType::Speculative if self.has_buffered_events() => WorkflowTaskType::Normal,
            other => other,
        };

        let scheduled_time = Utc::now();
        let scheduled_event_id = match effective_type {
            WorkflowTaskType::Normal => {
                let event = self.append_event(EventAttributes::WorkflowTaskScheduled {
                    task_queue: self.execution_info.task_queue.clone(),
                    start_to_close_timeout: self.execution_info.default_workflow_task_timeout,
                    attempt: 1,
                });
                event.event_id
            }
            // Speculative and transient tasks reserve the id without
            // appending the event.
            WorkflowTaskType::Speculative | WorkflowTaskType::Transient => self.next_event_id,
        };

        let info = WorkflowTaskInfo {
            scheduled_event_id,
            started_event_id: EMPTY_EVENT_ID,
            task_type: effective_type,
            task_queue: self.execution_info.task_queue.clone(),
            scheduled_time,
            started_time: None,
            start_to_close_timeout: self.execution_info.default_workflow_task_timeout,
            attempt: 1,
            request_id: String::new(),
        };
        self.workflow_task = Some(info.clone());

        let generate = !bypass_task_generation
            && !matches!(effective_type, WorkflowTaskType::Speculative);
        if generate {
            TaskGenerator::default().generate_scheduled_workflow_task_tasks(self, scheduled_event_id)?;
        }
        Ok(info)
    }

    /// Record a worker starting the pending workflow task. A speculative
    /// task materializes its scheduled event here and becomes normal.
    pub fn add_workflow_task_started_event(
        &mut self,
        scheduled_event_id: i64,
        request_id: impl Into<String>,
    ) -> Result<HistoryEvent> {
        self.assert_running()?;
        let pending = self
            .workflow_task
            .clone()
            .ok_or_else(|| CoreError::internal("no pending workflow task to start"))?;
        if pending.scheduled_event_id != scheduled_event_id {
            return Err(CoreError::internal(format!(
                "workflow task start for event {} but {} is pending",
                scheduled_event_id, pending.scheduled_event_id
            )));
        }
        if pending.is_started() {
            return Err(CoreError::internal("workflow task already started"));
        }

        // A speculative task materializes its scheduled event now and
        // becomes normal. The reserved id may have drifted if events were
        // appended since scheduling; the materialized id wins.
        let mut scheduled_event_id = scheduled_event_id;
        if matches!(pending.task_type, WorkflowTaskType::Speculative) {
            let event = self.append_event(EventAttributes::WorkflowTaskScheduled {
                task_queue: pending.task_queue.clone(),
                start_to_close_timeout: pending.start_to_close_timeout,
                attempt: pending.attempt,
            });
            scheduled_event_id = event.event_id;
        }

        let request_id = request_id.into();
        let event = self.append_event(EventAttributes::WorkflowTaskStarted {
            scheduled_event_id,
            request_id: request_id.clone(),
        });

        let task = self
            .workflow_task
            .as_mut()
            .ok_or_else(|| CoreError::internal("pending workflow task vanished mid-start"))?;
        task.scheduled_event_id = scheduled_event_id;
        task.started_event_id = event.event_id;
        task.started_time = Some(event.event_time);
        task.request_id = request_id;
        task.task_type = WorkflowTaskType::Normal;

        TaskGenerator::default().generate_started_workflow_task_tasks(self, scheduled_event_id)?;
        Ok(event)
    }

    /// Complete the started workflow task and flush buffered events.
    pub fn add_workflow_task_completed_event(
        &mut self,
        identity: impl Into<String>,
    ) -> Result<HistoryEvent> {
        self.assert_running()?;
        let pending = self
            .workflow_task
            .clone()
            .ok_or_else(|| CoreError::internal("no pending workflow task to complete"))?;
        if !pending.is_started() {
            return Err(CoreError::internal(
                "cannot complete a workflow task that has not started",
            ));
        }

        self.workflow_task = None;
        let event = self.append_event(EventAttributes::WorkflowTaskCompleted {
            scheduled_event_id: pending.scheduled_event_id,
            started_event_id: pending.started_event_id,
            identity: identity.into(),
        });
        self.flush_buffered_events();
        Ok(event)
    }

    /// Fail the started workflow task; it will be rescheduled by the caller.
    pub fn add_workflow_task_failed_event(
        &mut self,
        cause: impl Into<String>,
    ) -> Result<HistoryEvent> {
        self.assert_running()?;
        let pending = self
            .workflow_task
            .clone()
            .ok_or_else(|| CoreError::internal("no pending workflow task to fail"))?;
        self.workflow_task = None;
        Ok(self.append_event(EventAttributes::WorkflowTaskFailed {
            scheduled_event_id: pending.scheduled_event_id,
            started_event_id: pending.started_event_id,
            cause: cause.into(),
        }))
    }

    /// Time out the pending workflow task.
    pub fn add_workflow_task_timed_out_event(
        &mut self,
        timeout_kind: TimeoutKind,
    ) -> Result<HistoryEvent> {
        self.assert_running()?;
        let pending = self
            .workflow_task
            .clone()
            .ok_or_else(|| CoreError::internal("no pending workflow task to time out"))?;
        self.workflow_task = None;
        Ok(self.append_event(EventAttributes::WorkflowTaskTimedOut {
            scheduled_event_id: pending.scheduled_event_id,
            started_event_id: pending.started_event_id,
            timeout_kind,
        }))
    }

    // ---- activities --------------------------------------------------------

    /// Schedule an activity.
    #[allow(clippy::too_many_arguments)]
    pub fn add_activity_task_scheduled_event(
        &mut self,
        workflow_task_completed_event_id: i64,
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        task_queue: impl Into<String>,
        input: Option<serde_json::Value>,
        schedule_to_close_timeout: Option<Duration>,
        schedule_to_start_timeout: Option<Duration>,
        start_to_close_timeout: Option<Duration>,
        heartbeat_timeout: Option<Duration>,
    ) -> Result<(HistoryEvent, ActivityInfo)> {
        self.assert_running()?;
        let activity_id = activity_id.into();
        if self
            .activity_infos
            .values()
            .any(|a| a.activity_id == activity_id)
        {
            return Err(CoreError::internal(format!(
                "activity id '{}' already pending",
                activity_id
            )));
        }

        let activity_type = activity_type.into();
        let task_queue = task_queue.into();
        let batch_first_event_id = self
            .current_batch
            .first()
            .map(|e| e.event_id)
            .unwrap_or(self.next_event_id);
        let event = self.append_event(EventAttributes::ActivityTaskScheduled {
            activity_id: activity_id.clone(),
            activity_type: activity_type.clone(),
            task_queue: task_queue.clone(),
            input,
            schedule_to_close_timeout,
            schedule_to_start_timeout,
            start_to_close_timeout,
            heartbeat_timeout,
            workflow_task_completed_event_id,
        });

        let info = ActivityInfo {
            scheduled_event_id: event.event_id,
            scheduled_event_batch_id: batch_first_event_id,
            started_event_id: EMPTY_EVENT_ID,
            activity_id,
            activity_type,
            task_queue,
            scheduled_time: event.event_time,
            started_time: None,
            schedule_to_close_timeout,
            schedule_to_start_timeout,
            start_to_close_timeout,
            heartbeat_timeout,
            last_heartbeat_time: None,
            timer_task_status: TIMER_TASK_STATUS_NONE,
            attempt: 1,
            version: self.last_write_version,
            cancel_requested: false,
            cancel_request_event_id: EMPTY_EVENT_ID,
        };
        self.activity_infos.insert(event.event_id, info.clone());
        self.dirty.activity_upserts.insert(event.event_id);

        TaskGenerator::default().generate_activity_tasks(self, event.event_id)?;
        Ok((event, info))
    }

    /// Write back an activity record, typically after timer-bit changes.
    pub fn update_activity(&mut self, info: ActivityInfo) -> Result<()> {
        let id = info.scheduled_event_id;
        if !self.activity_infos.contains_key(&id) {
            return Err(CoreError::internal(format!(
                "activity with scheduled event {} is not pending",
                id
            )));
        }
        self.activity_infos.insert(id, info);
        self.dirty.activity_upserts.insert(id);
        Ok(())
    }

    /// Record a worker starting an activity.
    pub fn add_activity_task_started_event(
        &mut self,
        scheduled_event_id: i64,
        identity: impl Into<String>,
    ) -> Result<HistoryEvent> {
        self.assert_running()?;
        let info = self
            .activity_infos
            .get(&scheduled_event_id)
            .ok_or_else(|| {
                CoreError::internal(format!(
                    "activity with scheduled event {} is not pending",
                    scheduled_event_id
                ))
            })?
            .clone();
        if info.is_started() {
            return Err(CoreError::internal("activity already started"));
        }

        let event = self.append_event(EventAttributes::ActivityTaskStarted {
            scheduled_event_id,
            attempt: info.attempt,
            identity: identity.into(),
        });
        let stored = self
            .activity_infos
            .get_mut(&scheduled_event_id)
            .expect("checked above");
        stored.started_event_id = event.event_id;
        stored.started_time = Some(event.event_time);
        self.dirty.activity_upserts.insert(scheduled_event_id);
        Ok(event)
    }

    fn take_activity(&mut self, scheduled_event_id: i64) -> Result<ActivityInfo> {
        let info = self
            .activity_infos
            .remove(&scheduled_event_id)
            .ok_or_else(|| {
                CoreError::internal(format!(
                    "activity with scheduled event {} is not pending",
                    scheduled_event_id
                ))
            })?;
        self.dirty.activity_upserts.remove(&scheduled_event_id);
        self.dirty.activity_deletes.insert(scheduled_event_id);
        Ok(info)
    }

    /// Complete a started activity.
    pub fn add_activity_task_completed_event(
        &mut self,
        scheduled_event_id: i64,
        result: Option<serde_json::Value>,
    ) -> Result<HistoryEvent> {
        self.assert_running()?;
        let info = self.take_activity(scheduled_event_id)?;
        if !info.is_started() {
            return Err(CoreError::internal(
                "cannot complete an activity that has not started",
            ));
        }
        Ok(self.append_or_buffer(EventAttributes::ActivityTaskCompleted {
            scheduled_event_id,
            started_event_id: info.started_event_id,
            result,
        }))
    }

    /// Fail a started activity.
    pub fn add_activity_task_failed_event(
        &mut self,
        scheduled_event_id: i64,
        failure: impl Into<String>,
    ) -> Result<HistoryEvent> {
        self.assert_running()?;
        let info = self.take_activity(scheduled_event_id)?;
        Ok(self.append_or_buffer(EventAttributes::ActivityTaskFailed {
            scheduled_event_id,
            started_event_id: info.started_event_id,
            failure: failure.into(),
        }))
    }

    /// Time out a pending activity.
    pub fn add_activity_task_timed_out_event(
        &mut self,
        scheduled_event_id: i64,
        timeout_kind: TimeoutKind,
    ) -> Result<HistoryEvent> {
        self.assert_running()?;
        let info = self.take_activity(scheduled_event_id)?;
        Ok(self.append_or_buffer(EventAttributes::ActivityTaskTimedOut {
            scheduled_event_id,
            started_event_id: info.started_event_id,
            timeout_kind,
        }))
    }

    /// Record a cancel request against a pending activity.
    pub fn add_activity_task_cancel_requested_event(
        &mut self,
        workflow_task_completed_event_id: i64,
        scheduled_event_id: i64,
    ) -> Result<HistoryEvent> {
        self.assert_running()?;
        let event = self.append_event(EventAttributes::ActivityTaskCancelRequested {
            scheduled_event_id,
            workflow_task_completed_event_id,
        });
        let info = self
            .activity_infos
            .get_mut(&scheduled_event_id)
            .ok_or_else(|| {
                CoreError::internal(format!(
                    "activity with scheduled event {} is not pending",
                    scheduled_event_id
                ))
            })?;
        info.cancel_requested = true;
        info.cancel_request_event_id = event.event_id;
        self.dirty.activity_upserts.insert(scheduled_event_id);
        Ok(event)
    }

    /// Record an activity acknowledging cancellation.
    pub fn add_activity_task_canceled_event(
        &mut self,
        scheduled_event_id: i64,
    ) -> Result<HistoryEvent> {
        self.assert_running()?;
        let info = self.take_activity(scheduled_event_id)?;
        if !info.cancel_requested {
            return Err(CoreError::internal(
                "activity canceled without a cancel request",
            ));
        }
        Ok(self.append_or_buffer(EventAttributes::ActivityTaskCanceled {
            scheduled_event_id,
            started_event_id: info.started_event_id,
            latest_cancel_requested_event_id: info.cancel_request_event_id,
        }))
    }

    // ---- user timers -------------------------------------------------------

    /// Start a user timer.
    pub fn add_timer_started_event(
        &mut self,
        workflow_task_completed_event_id: i64,
        timer_id: impl Into<String>,
        start_to_fire_timeout: Duration,
    ) -> Result<(HistoryEvent, TimerInfo)> {
        self.assert_running()?;
        let timer_id = timer_id.into();
        if self.timer_infos.contains_key(&timer_id) {
            return Err(CoreError::internal(format!(
                "timer id '{}' already pending",
                timer_id
            )));
        }

        let event = self.append_event(EventAttributes::TimerStarted {
            timer_id: timer_id.clone(),
            start_to_fire_timeout,
            workflow_task_completed_event_id,
        });
        let info = TimerInfo {
            timer_id: timer_id.clone(),
            started_event_id: event.event_id,
            expiry_time: event.event_time
                + chrono::Duration::from_std(start_to_fire_timeout)
                    .map_err(|e| CoreError::internal(format!("timer duration overflow: {e}")))?,
            task_status: TIMER_TASK_STATUS_NONE,
            version: self.last_write_version,
        };
        self.timer_infos.insert(timer_id.clone(), info.clone());
        self.dirty.timer_upserts.insert(timer_id);

        TimerSequence::new().create_next_user_timer(self)?;
        Ok((event, info))
    }

    /// Write back a timer record, typically after task-status changes.
    pub fn update_user_timer(&mut self, info: TimerInfo) -> Result<()> {
        let id = info.timer_id.clone();
        if !self.timer_infos.contains_key(&id) {
            return Err(CoreError::internal(format!("timer '{}' is not pending", id)));
        }
        self.timer_infos.insert(id.clone(), info);
        self.dirty.timer_upserts.insert(id);
        Ok(())
    }

    fn take_timer(&mut self, timer_id: &str) -> Result<TimerInfo> {
        let info = self
            .timer_infos
            .remove(timer_id)
            .ok_or_else(|| CoreError::internal(format!("timer '{}' is not pending", timer_id)))?;
        self.dirty.timer_upserts.remove(timer_id);
        self.dirty.timer_deletes.insert(timer_id.to_string());
        Ok(info)
    }

    /// Fire a user timer.
    pub fn add_timer_fired_event(&mut self, timer_id: &str) -> Result<HistoryEvent> {
        self.assert_running()?;
        let info = self.take_timer(timer_id)?;
        Ok(self.append_or_buffer(EventAttributes::TimerFired {
            timer_id: info.timer_id,
            started_event_id: info.started_event_id,
        }))
    }

    /// Cancel a user timer before it fires.
    pub fn add_timer_canceled_event(
        &mut self,
        workflow_task_completed_event_id: i64,
        timer_id: &str,
    ) -> Result<HistoryEvent> {
        self.assert_running()?;
        let info = self.take_timer(timer_id)?;
        Ok(self.append_event(EventAttributes::TimerCanceled {
            timer_id: info.timer_id,
            started_event_id: info.started_event_id,
            workflow_task_completed_event_id,
        }))
    }

    // ---- child workflows ---------------------------------------------------

    /// Initiate a child workflow.
    pub fn add_start_child_workflow_execution_initiated_event(
        &mut self,
        workflow_task_completed_event_id: i64,
        namespace: impl Into<String>,
        workflow_id: impl Into<String>,
        workflow_type: impl Into<String>,
        task_queue: impl Into<String>,
        input: Option<serde_json::Value>,
    ) -> Result<(HistoryEvent, ChildExecutionInfo)> {
        self.assert_running()?;
        let namespace = namespace.into();
        let workflow_id = workflow_id.into();
        let workflow_type = workflow_type.into();
        let batch_first_event_id = self
            .current_batch
            .first()
            .map(|e| e.event_id)
            .unwrap_or(self.next_event_id);
        let event = self.append_event(EventAttributes::StartChildWorkflowExecutionInitiated {
            namespace: namespace.clone(),
            workflow_id: workflow_id.clone(),
            workflow_type: workflow_type.clone(),
            task_queue: task_queue.into(),
            input,
            workflow_task_completed_event_id,
        });
        let info = ChildExecutionInfo {
            initiated_event_id: event.event_id,
            initiated_event_batch_id: batch_first_event_id,
            started_event_id: EMPTY_EVENT_ID,
            namespace,
            workflow_id,
            run_id: None,
            workflow_type,
            create_request_id: Uuid::new_v4().to_string(),
            version: self.last_write_version,
        };
        self.child_execution_infos.insert(event.event_id, info.clone());
        self.dirty.child_upserts.insert(event.event_id);

        TaskGenerator::default().generate_child_workflow_tasks(self, event.event_id)?;
        Ok((event, info))
    }

    /// Record the child starting.
    pub fn add_child_workflow_execution_started_event(
        &mut self,
        initiated_event_id: i64,
        run_id: impl Into<String>,
    ) -> Result<HistoryEvent> {
        self.assert_running()?;
        let run_id = run_id.into();
        let event = self.append_or_buffer(EventAttributes::ChildWorkflowExecutionStarted {
            initiated_event_id,
            run_id: run_id.clone(),
        });
        let info = self
            .child_execution_infos
            .get_mut(&initiated_event_id)
            .ok_or_else(|| {
                CoreError::internal(format!(
                    "child with initiated event {} is not pending",
                    initiated_event_id
                ))
            })?;
        info.started_event_id = event.event_id;
        info.run_id = Some(run_id);
        self.dirty.child_upserts.insert(initiated_event_id);
        Ok(event)
    }

    fn take_child(&mut self, initiated_event_id: i64) -> Result<ChildExecutionInfo> {
        let info = self
            .child_execution_infos
            .remove(&initiated_event_id)
            .ok_or_else(|| {
                CoreError::internal(format!(
                    "child with initiated event {} is not pending",
                    initiated_event_id
                ))
            })?;
        self.dirty.child_upserts.remove(&initiated_event_id);
        self.dirty.child_deletes.insert(initiated_event_id);
        Ok(info)
    }

    /// Record the child completing.
    pub fn add_child_workflow_execution_completed_event(
        &mut self,
        initiated_event_id: i64,
        result: Option<serde_json::Value>,
    ) -> Result<HistoryEvent> {
        self.assert_running()?;
        let info = self.take_child(initiated_event_id)?;
        Ok(self.append_or_buffer(EventAttributes::ChildWorkflowExecutionCompleted {
            initiated_event_id,
            started_event_id: info.started_event_id,
            result,
        }))
    }

    /// Record the child failing.
    pub fn add_child_workflow_execution_failed_event(
        &mut self,
        initiated_event_id: i64,
        failure: impl Into<String>,
    ) -> Result<HistoryEvent> {
        self.assert_running()?;
        let info = self.take_child(initiated_event_id)?;
        Ok(self.append_or_buffer(EventAttributes::ChildWorkflowExecutionFailed {
            initiated_event_id,
            started_event_id: info.started_event_id,
            failure: failure.into(),
        }))
    }

    /// Record the child being terminated.
    pub fn add_child_workflow_execution_terminated_event(
        &mut self,
        initiated_event_id: i64,
    ) -> Result<HistoryEvent> {
        self.assert_running()?;
        let info = self.take_child(initiated_event_id)?;
        Ok(self.append_or_buffer(EventAttributes::ChildWorkflowExecutionTerminated {
            initiated_event_id,
            started_event_id: info.started_event_id,
        }))
    }

    /// Record the child timing out.
    pub fn add_child_workflow_execution_timed_out_event(
        &mut self,
        initiated_event_id: i64,
        timeout_kind: TimeoutKind,
    ) -> Result<HistoryEvent> {
        self.assert_running()?;
        let info = self.take_child(initiated_event_id)?;
        Ok(self.append_or_buffer(EventAttributes::ChildWorkflowExecutionTimedOut {
            initiated_event_id,
            started_event_id: info.started_event_id,
            timeout_kind,
        }))
    }

    /// Record the child start failing outright.
    pub fn add_start_child_workflow_execution_failed_event(
        &mut self,
        initiated_event_id: i64,
        cause: impl Into<String>,
    ) -> Result<HistoryEvent> {
        self.assert_running()?;
        self.take_child(initiated_event_id)?;
        Ok(self.append_or_buffer(EventAttributes::StartChildWorkflowExecutionFailed {
            initiated_event_id,
            cause: cause.into(),
        }))
    }

    // ---- external cancel / signal -----------------------------------------

    /// Initiate a cancel of an external workflow.
    pub fn add_request_cancel_external_initiated_event(
        &mut self,
        workflow_task_completed_event_id: i64,
        target_namespace: impl Into<String>,
        target_workflow_id: impl Into<String>,
        target_run_id: Option<String>,
    ) -> Result<(HistoryEvent, RequestCancelInfo)> {
        self.assert_running()?;
        let target_namespace = target_namespace.into();
        let target_workflow_id = target_workflow_id.into();
        let batch_first_event_id = self
            .current_batch
            .first()
            .map(|e| e.event_id)
            .unwrap_or(self.next_event_id);
        let event = self.append_event(
            EventAttributes::RequestCancelExternalWorkflowExecutionInitiated {
                namespace: target_namespace.clone(),
                workflow_id: target_workflow_id.clone(),
                run_id: target_run_id.clone(),
                workflow_task_completed_event_id,
            },
        );
        let info = RequestCancelInfo {
            initiated_event_id: event.event_id,
            initiated_event_batch_id: batch_first_event_id,
            cancel_request_id: Uuid::new_v4().to_string(),
            target_namespace,
            target_workflow_id,
            target_run_id,
            version: self.last_write_version,
        };
        self.request_cancel_infos.insert(event.event_id, info.clone());
        self.dirty.request_cancel_upserts.insert(event.event_id);

        TaskGenerator::default().generate_request_cancel_external_tasks(self, event.event_id)?;
        Ok((event, info))
    }

    /// Record the external cancel being delivered.
    pub fn add_external_workflow_execution_cancel_requested_event(
        &mut self,
        initiated_event_id: i64,
    ) -> Result<HistoryEvent> {
        self.assert_running()?;
        self.remove_request_cancel(initiated_event_id)?;
        Ok(self.append_or_buffer(
            EventAttributes::ExternalWorkflowExecutionCancelRequested { initiated_event_id },
        ))
    }

    /// Record the external cancel failing.
    pub fn add_request_cancel_external_failed_event(
        &mut self,
        initiated_event_id: i64,
        cause: impl Into<String>,
    ) -> Result<HistoryEvent> {
        self.assert_running()?;
        self.remove_request_cancel(initiated_event_id)?;
        Ok(self.append_or_buffer(
            EventAttributes::RequestCancelExternalWorkflowExecutionFailed {
                initiated_event_id,
                cause: cause.into(),
            },
        ))
    }

    fn remove_request_cancel(&mut self, initiated_event_id: i64) -> Result<()> {
        self.request_cancel_infos
            .remove(&initiated_event_id)
            .ok_or_else(|| {
                CoreError::internal(format!(
                    "request cancel with initiated event {} is not pending",
                    initiated_event_id
                ))
            })?;
        self.dirty.request_cancel_upserts.remove(&initiated_event_id);
        self.dirty.request_cancel_deletes.insert(initiated_event_id);
        Ok(())
    }

    /// Initiate a signal to an external workflow.
    pub fn add_signal_external_initiated_event(
        &mut self,
        workflow_task_completed_event_id: i64,
        target_namespace: impl Into<String>,
        target_workflow_id: impl Into<String>,
        target_run_id: Option<String>,
        signal_name: impl Into<String>,
        input: Option<serde_json::Value>,
    ) -> Result<(HistoryEvent, SignalExternalInfo)> {
        self.assert_running()?;
        let target_namespace = target_namespace.into();
        let target_workflow_id = target_workflow_id.into();
        let signal_name = signal_name.into();
        let batch_first_event_id = self
            .current_batch
            .first()
            .map(|e| e.event_id)
            .unwrap_or(self.next_event_id);
        let event = self.append_event(
            EventAttributes::SignalExternalWorkflowExecutionInitiated {
                namespace: target_namespace.clone(),
                workflow_id: target_workflow_id.clone(),
                run_id: target_run_id.clone(),
                signal_name: signal_name.clone(),
                input,
                workflow_task_completed_event_id,
            },
        );
        let info = SignalExternalInfo {
            initiated_event_id: event.event_id,
            initiated_event_batch_id: batch_first_event_id,
            target_namespace,
            target_workflow_id,
            target_run_id,
            signal_name,
            version: self.last_write_version,
        };
        self.signal_external_infos.insert(event.event_id, info.clone());
        self.dirty.signal_external_upserts.insert(event.event_id);

        TaskGenerator::default().generate_signal_external_tasks(self, event.event_id)?;
        Ok((event, info))
    }

    /// Record the external signal being delivered.
    pub fn add_external_workflow_execution_signaled_event(
        &mut self,
        initiated_event_id: i64,
    ) -> Result<HistoryEvent> {
        self.assert_running()?;
        self.remove_signal_external(initiated_event_id)?;
        Ok(self
            .append_or_buffer(EventAttributes::ExternalWorkflowExecutionSignaled {
                initiated_event_id,
            }))
    }

    /// Record the external signal failing.
    pub fn add_signal_external_failed_event(
        &mut self,
        initiated_event_id: i64,
        cause: impl Into<String>,
    ) -> Result<HistoryEvent> {
        self.assert_running()?;
        self.remove_signal_external(initiated_event_id)?;
        Ok(
            self.append_or_buffer(EventAttributes::SignalExternalWorkflowExecutionFailed {
                initiated_event_id,
                cause: cause.into(),
            }),
        )
    }

    fn remove_signal_external(&mut self, initiated_event_id: i64) -> Result<()> {
        self.signal_external_infos
            .remove(&initiated_event_id)
            .ok_or_else(|| {
                CoreError::internal(format!(
                    "external signal with initiated event {} is not pending",
                    initiated_event_id
                ))
            })?;
        self.dirty.signal_external_upserts.remove(&initiated_event_id);
        self.dirty.signal_external_deletes.insert(initiated_event_id);
        Ok(())
    }

    // ---- updates -----------------------------------------------------------

    /// Record an update as durably admitted.
    pub fn apply_update_admission(&mut self, update_id: impl Into<String>) -> Result<()> {
        self.assert_running()?;
        let update_id = update_id.into();
        if self.update_infos.contains_key(&update_id) {
            return Ok(());
        }
        self.update_infos.insert(
            update_id.clone(),
            UpdateInfo {
                update_id: update_id.clone(),
                stage: UpdateStage::Admitted,
                outcome: None,
                accepted_event_id: EMPTY_EVENT_ID,
            },
        );
        self.dirty.update_upserts.insert(update_id);
        Ok(())
    }

    /// Record the worker accepting an update.
    pub fn apply_update_acceptance(&mut self, update_id: &str) -> Result<HistoryEvent> {
        self.assert_running()?;
        let accepted_event_id = self.next_event_id;
        let event = self.append_event(EventAttributes::WorkflowExecutionUpdateAccepted {
            update_id: update_id.to_string(),
            accepted_event_id,
        });
        let info = self
            .update_infos
            .get_mut(update_id)
            .ok_or_else(|| CoreError::internal(format!("update '{}' is not admitted", update_id)))?;
        info.stage = UpdateStage::Accepted;
        info.accepted_event_id = event.event_id;
        self.dirty.update_upserts.insert(update_id.to_string());
        Ok(event)
    }

    /// Record an update's outcome.
    pub fn apply_update_completion(
        &mut self,
        update_id: &str,
        outcome: serde_json::Value,
    ) -> Result<HistoryEvent> {
        self.assert_running()?;
        let event = self.append_event(EventAttributes::WorkflowExecutionUpdateCompleted {
            update_id: update_id.to_string(),
            outcome: outcome.clone(),
        });
        let info = self
            .update_infos
            .get_mut(update_id)
            .ok_or_else(|| CoreError::internal(format!("update '{}' is not admitted", update_id)))?;
        info.stage = UpdateStage::Completed;
        info.outcome = Some(outcome);
        self.dirty.update_upserts.insert(update_id.to_string());
        Ok(event)
    }

    // ---- transaction close -------------------------------------------------

    fn checksum_projection(&self) -> impl serde::Serialize + '_ {
        (
            &self.execution_state,
            self.next_event_id,
            self.activity_infos.len(),
            self.timer_infos.len(),
            self.child_execution_infos.len(),
            self.request_cancel_infos.len(),
            self.signal_external_infos.len(),
            self.buffered_events.len(),
        )
    }

    /// Drop all tasks queued in the open transaction. The refresher uses
    /// this before regenerating the full set.
    pub(crate) fn wipe_transaction_tasks(&mut self) {
        self.tasks.clear();
    }

    /// Close the open transaction as a delta against the stored record.
    ///
    /// Bumps `db_record_version`; the emitted condition is the version the
    /// store must currently hold. The caller persists the output and, on any
    /// failure, discards this state object entirely.
    pub fn close_transaction_as_mutation(&mut self) -> Result<TransactionOutput> {
        let condition = self.db_record_version;
        self.db_record_version += 1;

        let events = std::mem::take(&mut self.current_batch);
        let dirty = std::mem::replace(&mut self.dirty, DirtyState::default());
        let tasks = std::mem::take(&mut self.tasks);

        // A speculative workflow task never persists; it lives in memory
        // until materialized.
        let persisted_workflow_task = match &self.workflow_task {
            Some(wt) if matches!(wt.task_type, WorkflowTaskType::Speculative) => None,
            other => other.clone(),
        };

        let mutation = WorkflowMutation {
            workflow_key: self.workflow_key.clone(),
            execution_info: self.execution_info.clone(),
            execution_state: self.execution_state.clone(),
            next_event_id: self.next_event_id,
            last_write_version: self.last_write_version,
            db_record_version: self.db_record_version,
            upsert_activity_infos: dirty
                .activity_upserts
                .iter()
                .filter_map(|id| self.activity_infos.get(id).map(|info| (*id, info.clone())))
                .collect(),
            delete_activity_infos: dirty.activity_deletes,
            upsert_timer_infos: dirty
                .timer_upserts
                .iter()
                .filter_map(|id| {
                    self.timer_infos
                        .get(id)
                        .map(|info| (id.clone(), info.clone()))
                })
                .collect(),
            delete_timer_infos: dirty.timer_deletes,
            upsert_child_execution_infos: dirty
                .child_upserts
                .iter()
                .filter_map(|id| {
                    self.child_execution_infos
                        .get(id)
                        .map(|info| (*id, info.clone()))
                })
                .collect(),
            delete_child_execution_infos: dirty.child_deletes,
            upsert_request_cancel_infos: dirty
                .request_cancel_upserts
                .iter()
                .filter_map(|id| {
                    self.request_cancel_infos
                        .get(id)
                        .map(|info| (*id, info.clone()))
                })
                .collect(),
            delete_request_cancel_infos: dirty.request_cancel_deletes,
            upsert_signal_external_infos: dirty
                .signal_external_upserts
                .iter()
                .filter_map(|id| {
                    self.signal_external_infos
                        .get(id)
                        .map(|info| (*id, info.clone()))
                })
                .collect(),
            delete_signal_external_infos: dirty.signal_external_deletes,
            upsert_signal_requested_ids: dirty.signal_requested_upserts,
            delete_signal_requested_ids: dirty.signal_requested_deletes,
            upsert_update_infos: dirty
                .update_upserts
                .iter()
                .filter_map(|id| {
                    self.update_infos
                        .get(id)
                        .map(|info| (id.clone(), info.clone()))
                })
                .collect(),
            delete_update_infos: dirty.update_deletes,
            workflow_task: persisted_workflow_task,
            new_buffered_events: dirty.new_buffered,
            clear_buffered_events: dirty.cleared_buffer,
            tasks,
            condition,
            checksum: Some(checksum::compute(&self.checksum_projection())?),
        };

        Ok(TransactionOutput { mutation, events })
    }

    /// Close the open transaction as a full image, for run creation.
    pub fn close_transaction_as_snapshot(&mut self) -> Result<(WorkflowSnapshot, Vec<HistoryEvent>)> {
        let condition = self.db_record_version;
        self.db_record_version += 1;

        let events = std::mem::take(&mut self.current_batch);
        self.dirty = DirtyState::default();
        let tasks = std::mem::take(&mut self.tasks);

        let persisted_workflow_task = match &self.workflow_task {
            Some(wt) if matches!(wt.task_type, WorkflowTaskType::Speculative) => None,
            other => other.clone(),
        };

        let snapshot = WorkflowSnapshot {
            workflow_key: self.workflow_key.clone(),
            execution_info: self.execution_info.clone(),
            execution_state: self.execution_state.clone(),
            next_event_id: self.next_event_id,
            last_write_version: self.last_write_version,
            db_record_version: self.db_record_version,
            activity_infos: self.activity_infos.clone(),
            timer_infos: self.timer_infos.clone(),
            child_execution_infos: self.child_execution_infos.clone(),
            request_cancel_infos: self.request_cancel_infos.clone(),
            signal_external_infos: self.signal_external_infos.clone(),
            signal_requested_ids: self.signal_requested_ids.clone(),
            update_infos: self.update_infos.clone(),
            workflow_task: persisted_workflow_task,
            buffered_events: self.buffered_events.clone(),
            tasks,
            condition,
            checksum: Some(checksum::compute(&self.checksum_projection())?),
        };
        Ok((snapshot, events))
    }
}

/// Events that wait in the buffer while a workflow task is running.
fn is_bufferable(kind: EventKind) -> bool {
    matches!(
        kind,
        EventKind::WorkflowExecutionSignaled
            | EventKind::WorkflowExecutionCancelRequested
            | EventKind::ActivityTaskCompleted
            | EventKind::ActivityTaskFailed
            | EventKind::ActivityTaskTimedOut
            | EventKind::ActivityTaskCanceled
            | EventKind::TimerFired
            | EventKind::ChildWorkflowExecutionStarted
            | EventKind::ChildWorkflowExecutionCompleted
            | EventKind::ChildWorkflowExecutionFailed
            | EventKind::ChildWorkflowExecutionTerminated
            | EventKind::ChildWorkflowExecutionTimedOut
            | EventKind::StartChildWorkflowExecutionFailed
            | EventKind::ExternalWorkflowExecutionCancelRequested
            | EventKind::RequestCancelExternalWorkflowExecutionFailed
            | EventKind::ExternalWorkflowExecutionSignaled
            | EventKind::SignalExternalWorkflowExecutionFailed
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const RETENTION: Duration = Duration::from_secs(3600);

    fn started_state() -> MutableState {
        let key = WorkflowKey::new("ns-1", "wf-1", Uuid::new_v4().to_string());
        let branch = BranchInfo::new_root();
        let mut ms = MutableState::new_for_start(1, key, &branch).expect("new");
        ms.add_workflow_execution_started_event(StartWorkflowRequest {
            workflow_type: "order".to_string(),
            task_queue: "default".to_string(),
            input: None,
            workflow_run_timeout: Some(Duration::from_secs(600)),
            workflow_execution_timeout: None,
            workflow_task_timeout: Some(Duration::from_secs(10)),
            create_request_id: Uuid::new_v4().to_string(),
            first_workflow_task_backoff: None,
            search_attributes: HashMap::new(),
            continued_execution_run_id: None,
        })
        .expect("start");
        ms
    }

    fn run_workflow_task(ms: &mut MutableState) -> i64 {
        let wt = ms
            .add_workflow_task_scheduled_event(false, WorkflowTaskType::Normal)
            .expect("schedule");
        ms.add_workflow_task_started_event(wt.scheduled_event_id, "req-1")
            .expect("start");
        ms.add_workflow_task_completed_event("worker-1")
            .expect("complete")
            .event_id
    }

    #[test]
    fn test_event_ids_are_contiguous() {
        let mut ms = started_state();
        let completed_id = run_workflow_task(&mut ms);
        let (event, _) = ms
            .add_activity_task_scheduled_event(
                completed_id,
                "a1",
                "charge-card",
                "default",
                None,
                None,
                Some(Duration::from_secs(30)),
                Some(Duration::from_secs(60)),
                None,
            )
            .expect("schedule activity");
        // started(1) scheduled(2) started(3) completed(4) activity(5)
        assert_eq!(event.event_id, 5);
        assert_eq!(ms.next_event_id(), 6);
    }

    #[test]
    fn test_single_pending_workflow_task_invariant() {
        let mut ms = started_state();
        ms.add_workflow_task_scheduled_event(false, WorkflowTaskType::Normal)
            .expect("first");
        let err = ms
            .add_workflow_task_scheduled_event(false, WorkflowTaskType::Normal)
            .unwrap_err();
        assert_eq!(err.error_code(), "INTERNAL");
    }

    #[test]
    fn test_speculative_task_appends_no_event() {
        let mut ms = started_state();
        let before = ms.next_event_id();
        let wt = ms
            .add_workflow_task_scheduled_event(false, WorkflowTaskType::Speculative)
            .expect("speculative");
        assert_eq!(wt.task_type, WorkflowTaskType::Speculative);
        assert_eq!(ms.next_event_id(), before);
        assert_eq!(wt.scheduled_event_id, before);
        // No tasks generated for a speculative workflow task.
        assert!(ms
            .transaction_tasks()
            .get(&TaskCategory::Transfer)
            .map_or(true, |tasks| tasks
                .iter()
                .all(|t| !matches!(t.attrs, TaskAttributes::DispatchWorkflowTask { .. }))));
    }

    #[test]
    fn test_speculative_demotes_to_normal_with_buffered_events() {
        let mut ms = started_state();
        // Start a workflow task, buffer a signal while it runs, complete it,
        // then schedule again with buffered state present.
        let wt = ms
            .add_workflow_task_scheduled_event(false, WorkflowTaskType::Normal)
            .expect("schedule");
        ms.add_workflow_task_started_event(wt.scheduled_event_id, "req")
            .expect("start");
        ms.add_workflow_execution_signaled_event("sig", None, "caller", None)
            .expect("signal");
        assert!(ms.has_buffered_events());

        // Completing flushes; buffer again by hand for the demotion check.
        ms.add_workflow_task_completed_event("worker").expect("complete");
        assert!(!ms.has_buffered_events());

        let wt = ms
            .add_workflow_task_scheduled_event(false, WorkflowTaskType::Normal)
            .expect("schedule 2");
        ms.add_workflow_task_started_event(wt.scheduled_event_id, "req-2")
            .expect("start 2");
        ms.add_workflow_execution_signaled_event("sig-2", None, "caller", None)
            .expect("signal 2");
        ms.add_workflow_task_failed_event("worker lost").expect("fail");
        assert!(ms.has_buffered_events());

        let wt = ms
            .add_workflow_task_scheduled_event(false, WorkflowTaskType::Speculative)
            .expect("schedule speculative");
        assert_eq!(
            wt.task_type,
            WorkflowTaskType::Normal,
            "buffered events must demote a speculative workflow task"
        );
    }

    #[test]
    fn test_buffered_events_flush_contiguously_on_completion() {
        let mut ms = started_state();
        let wt = ms
            .add_workflow_task_scheduled_event(false, WorkflowTaskType::Normal)
            .expect("schedule");
        ms.add_workflow_task_started_event(wt.scheduled_event_id, "req")
            .expect("start");

        ms.add_workflow_execution_signaled_event("s1", None, "x", None)
            .expect("signal 1");
        ms.add_workflow_execution_signaled_event("s2", None, "x", None)
            .expect("signal 2");
        let completed = ms.add_workflow_task_completed_event("worker").expect("complete");

        let output = ms.close_transaction_as_mutation().expect("close");
        let ids: Vec<i64> = output.events.iter().map(|e| e.event_id).collect();
        // started(1) scheduled(2) started(3) completed(4) s1(5) s2(6)
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(completed.event_id, 4);
        assert!(output.mutation.clear_buffered_events);
        assert_eq!(ms.next_event_id(), 7);
    }

    #[test]
    fn test_mutation_condition_tracks_record_version() {
        let mut ms = started_state();
        let (snapshot, _) = ms.close_transaction_as_snapshot().expect("snapshot");
        assert_eq!(snapshot.condition, 0);
        assert_eq!(snapshot.db_record_version, 1);

        run_workflow_task(&mut ms);
        let output = ms.close_transaction_as_mutation().expect("mutation");
        assert_eq!(output.mutation.condition, 1);
        assert_eq!(output.mutation.db_record_version, 2);
    }

    #[test]
    fn test_terminal_state_rejects_mutations() {
        let mut ms = started_state();
        let completed_id = run_workflow_task(&mut ms);
        ms.add_workflow_execution_completed_event(completed_id, None, RETENTION)
            .expect("complete workflow");
        let err = ms
            .add_workflow_execution_signaled_event("late", None, "x", None)
            .unwrap_err();
        assert_eq!(err.error_code(), "WORKFLOW_COMPLETED");
    }

    #[test]
    fn test_signal_dedup_by_request_id() {
        let mut ms = started_state();
        let first = ms
            .add_workflow_execution_signaled_event("s", None, "x", Some("r-1".to_string()))
            .expect("first");
        assert!(first.is_some());
        let second = ms
            .add_workflow_execution_signaled_event("s", None, "x", Some("r-1".to_string()))
            .expect("second");
        assert!(second.is_none(), "same request id must dedupe");
    }

    #[test]
    fn test_removed_signal_request_id_readmits() {
        let mut ms = started_state();
        ms.add_workflow_execution_signaled_event("s", None, "x", Some("r-9".to_string()))
            .expect("first");
        ms.remove_signal_requested_id("r-9");
        let readmitted = ms
            .add_workflow_execution_signaled_event("s", None, "x", Some("r-9".to_string()))
            .expect("second");
        assert!(readmitted.is_some(), "removed dedup id admits the signal again");

        let output = ms.close_transaction_as_mutation().expect("close");
        assert!(output
            .mutation
            .upsert_signal_requested_ids
            .contains("r-9"));
    }

    #[test]
    fn test_close_emits_close_tasks() {
        let mut ms = started_state();
        let completed_id = run_workflow_task(&mut ms);
        ms.wipe_transaction_tasks();
        ms.add_workflow_execution_completed_event(completed_id, None, RETENTION)
            .expect("complete");

        let tasks = ms.transaction_tasks();
        let transfer = tasks.get(&TaskCategory::Transfer).expect("transfer tasks");
        assert!(transfer
            .iter()
            .any(|t| matches!(t.attrs, TaskAttributes::CloseExecution { .. })));
        let visibility = tasks.get(&TaskCategory::Visibility).expect("visibility");
        assert!(visibility
            .iter()
            .any(|t| matches!(t.attrs, TaskAttributes::CloseExecutionVisibility)));
        let timers = tasks.get(&TaskCategory::Timer).expect("timer tasks");
        assert!(timers
            .iter()
            .any(|t| matches!(t.attrs, TaskAttributes::DeleteHistory { .. })));
    }
}
