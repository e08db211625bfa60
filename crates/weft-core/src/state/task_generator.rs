// Copyright (C) 2025 Weft Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Side-effect task derivation.
//!
//! Each mutable-state transition with an external consequence maps to one or
//! more tasks. The generator reads state and queues tasks on it; it performs
//! no I/O and holds no reference to anything. Timer fire times derive only
//! from fields stored in the info records, so regenerating tasks from a
//! snapshot yields the same set.

use std::time::Duration;

use crate::error::{CoreError, Result};
use crate::history::events::TimeoutKind;
use crate::state::mutable_state::MutableState;
use crate::state::timer_sequence::{fire_time_after, TimerSequence};
use crate::state::WorkflowTaskType;
use crate::tasks::{TaskAttributes, TaskKey};

/// Default retention for close-task generation when no config is at hand.
const DEFAULT_HISTORY_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Derives side-effect tasks from mutable-state transitions.
#[derive(Debug)]
pub struct TaskGenerator {
    history_retention: Duration,
}

impl Default for TaskGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_RETENTION)
    }
}

impl TaskGenerator {
    /// A generator whose close tasks use the given history retention.
    pub fn new(history_retention: Duration) -> Self {
        Self { history_retention }
    }

    /// Workflow start: the run-timeout timer, plus the first-workflow-task
    /// backoff timer for delayed starts.
    pub fn generate_workflow_start_tasks(
        &self,
        ms: &mut MutableState,
        first_workflow_task_backoff: Option<Duration>,
    ) -> Result<()> {
        let info = ms.execution_info();
        let start_time = info.start_time;
        let run_timeout = info.workflow_run_timeout;
        let execution_timeout = info.workflow_execution_timeout;

        // The earlier of run timeout and execution timeout bounds this run.
        let deadline = match (run_timeout, execution_timeout) {
            (Some(run), Some(execution)) => Some(run.min(execution)),
            (Some(run), None) => Some(run),
            (None, Some(execution)) => Some(execution),
            (None, None) => None,
        };
        if let Some(deadline) = deadline {
            ms.add_task(
                TaskKey::at(fire_time_after(start_time, deadline)),
                TaskAttributes::WorkflowRunTimeout,
            );
        }

        if let Some(backoff) = first_workflow_task_backoff {
            if !backoff.is_zero() {
                self.generate_delayed_workflow_tasks(ms, backoff)?;
            }
        }
        Ok(())
    }

    /// Backoff timer before the first workflow task of a delayed start.
    pub fn generate_delayed_workflow_tasks(
        &self,
        ms: &mut MutableState,
        backoff: Duration,
    ) -> Result<()> {
        let start_time = ms.execution_info().start_time;
        ms.add_task(
            TaskKey::at(fire_time_after(start_time, backoff)),
            TaskAttributes::WorkflowBackoff,
        );
        Ok(())
    }

    /// Visibility record for a started run.
    pub fn generate_record_workflow_started_tasks(&self, ms: &mut MutableState) -> Result<()> {
        ms.add_task(
            TaskKey::immediate(),
            TaskAttributes::StartExecutionVisibility,
        );
        Ok(())
    }

    /// Workflow close: parent notification, visibility close, archival, and
    /// the delayed history deletion.
    pub fn generate_workflow_close_tasks(&self, ms: &mut MutableState) -> Result<()> {
        let info = ms.execution_info();
        let notify_parent = info.parent_workflow_key.is_some();
        let close_time = info.close_time.ok_or_else(|| {
            CoreError::internal("close tasks requested for a run with no close time")
        })?;
        let branch_token = info.current_branch_token.clone();

        ms.add_task(
            TaskKey::immediate(),
            TaskAttributes::CloseExecution { notify_parent },
        );
        ms.add_task(
            TaskKey::immediate(),
            TaskAttributes::CloseExecutionVisibility,
        );
        ms.add_task(TaskKey::immediate(), TaskAttributes::ArchiveExecution);
        ms.add_task(
            TaskKey::at(fire_time_after(close_time, self.history_retention)),
            TaskAttributes::DeleteHistory { branch_token },
        );
        Ok(())
    }

    /// Scheduled workflow task: dispatch to matching plus the
    /// schedule-to-start timeout.
    ///
    /// Speculative workflow tasks must never reach this: they have no timer
    /// or transfer tasks at all.
    pub fn generate_scheduled_workflow_task_tasks(
        &self,
        ms: &mut MutableState,
        scheduled_event_id: i64,
    ) -> Result<()> {
        let task = ms.pending_workflow_task().ok_or_else(|| {
            CoreError::internal("no pending workflow task to generate tasks for")
        })?;
        if matches!(task.task_type, WorkflowTaskType::Speculative) {
            return Err(CoreError::internal(
                "speculative workflow tasks have no generated tasks",
            ));
        }
        let task_queue = task.task_queue.clone();
        let scheduled_time = task.scheduled_time;
        let schedule_to_start = task.start_to_close_timeout;

        ms.add_task(
            TaskKey::immediate(),
            TaskAttributes::DispatchWorkflowTask {
                task_queue,
                scheduled_event_id,
            },
        );
        if let Some(timeout) = schedule_to_start {
            ms.add_task(
                TaskKey::at(fire_time_after(scheduled_time, timeout)),
                TaskAttributes::WorkflowTaskTimeout {
                    scheduled_event_id,
                    timeout_kind: TimeoutKind::ScheduleToStart,
                },
            );
        }
        Ok(())
    }

    /// Started workflow task: the start-to-close timeout.
    pub fn generate_started_workflow_task_tasks(
        &self,
        ms: &mut MutableState,
        scheduled_event_id: i64,
    ) -> Result<()> {
        let task = ms.pending_workflow_task().ok_or_else(|| {
            CoreError::internal("no pending workflow task to generate tasks for")
        })?;
        let started_time = task.started_time.ok_or_else(|| {
            CoreError::internal("started workflow task has no started time")
        })?;
        if let Some(timeout) = task.start_to_close_timeout {
            ms.add_task(
                TaskKey::at(fire_time_after(started_time, timeout)),
                TaskAttributes::WorkflowTaskTimeout {
                    scheduled_event_id,
                    timeout_kind: TimeoutKind::StartToClose,
                },
            );
        }
        Ok(())
    }

    /// Scheduled activity: dispatch to matching; timers come from the timer
    /// sequence.
    pub fn generate_activity_tasks(
        &self,
        ms: &mut MutableState,
        scheduled_event_id: i64,
    ) -> Result<()> {
        let info = ms
            .pending_activity_infos()
            .get(&scheduled_event_id)
            .ok_or_else(|| {
                CoreError::internal(format!(
                    "activity with scheduled event {} is not pending",
                    scheduled_event_id
                ))
            })?;
        let task_queue = info.task_queue.clone();

        ms.add_task(
            TaskKey::immediate(),
            TaskAttributes::DispatchActivityTask {
                task_queue,
                scheduled_event_id,
            },
        );
        TimerSequence::new().create_next_activity_timer(ms)?;
        Ok(())
    }

    /// Initiated child workflow: the start-child transfer task.
    pub fn generate_child_workflow_tasks(
        &self,
        ms: &mut MutableState,
        initiated_event_id: i64,
    ) -> Result<()> {
        let info = ms
            .pending_child_execution_infos()
            .get(&initiated_event_id)
            .ok_or_else(|| {
                CoreError::internal(format!(
                    "child with initiated event {} is not pending",
                    initiated_event_id
                ))
            })?;
        let target_namespace = info.namespace.clone();
        let target_workflow_id = info.workflow_id.clone();
        ms.add_task(
            TaskKey::immediate(),
            TaskAttributes::StartChildExecution {
                initiated_event_id,
                target_namespace,
                target_workflow_id,
            },
        );
        Ok(())
    }

    /// Initiated external cancel: its transfer task.
    pub fn generate_request_cancel_external_tasks(
        &self,
        ms: &mut MutableState,
        initiated_event_id: i64,
    ) -> Result<()> {
        let info = ms
            .pending_request_cancel_infos()
            .get(&initiated_event_id)
            .ok_or_else(|| {
                CoreError::internal(format!(
                    "request cancel with initiated event {} is not pending",
                    initiated_event_id
                ))
            })?;
        let target_namespace = info.target_namespace.clone();
        let target_workflow_id = info.target_workflow_id.clone();
        let target_run_id = info.target_run_id.clone();
        ms.add_task(
            TaskKey::immediate(),
            TaskAttributes::CancelExternalExecution {
                initiated_event_id,
                target_namespace,
                target_workflow_id,
                target_run_id,
            },
        );
        Ok(())
    }

    /// Initiated external signal: its transfer task.
    pub fn generate_signal_external_tasks(
        &self,
        ms: &mut MutableState,
        initiated_event_id: i64,
    ) -> Result<()> {
        let info = ms
            .pending_signal_external_infos()
            .get(&initiated_event_id)
            .ok_or_else(|| {
                CoreError::internal(format!(
                    "external signal with initiated event {} is not pending",
                    initiated_event_id
                ))
            })?;
        let target_namespace = info.target_namespace.clone();
        let target_workflow_id = info.target_workflow_id.clone();
        let target_run_id = info.target_run_id.clone();
        ms.add_task(
            TaskKey::immediate(),
            TaskAttributes::SignalExternalExecution {
                initiated_event_id,
                target_namespace,
                target_workflow_id,
                target_run_id,
            },
        );
        Ok(())
    }

    /// Search-attribute change: a visibility refresh.
    pub fn generate_upsert_visibility_task(&self, ms: &mut MutableState) -> Result<()> {
        ms.add_task(
            TaskKey::immediate(),
            TaskAttributes::UpsertExecutionVisibility,
        );
        Ok(())
    }
}
