// Copyright (C) 2025 Weft Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task refresh.
//!
//! Reconstructs the complete side-effect task set of a run from its mutable
//! state: drop every existing task schedule (zero the timer bits, clear the
//! open transaction's tasks), then replay the state through the task
//! generator in a fixed order. Used after conflict resolution, replication,
//! and repair, where the stored task set can no longer be trusted.
//!
//! Refreshing is idempotent: running it twice yields the same task multiset,
//! modulo freshly allocated task ids.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::history::events_cache::{EventKey, EventsCache};
use crate::state::mutable_state::MutableState;
use crate::state::task_generator::TaskGenerator;
use crate::state::timer_sequence::TimerSequence;
use crate::state::{WorkflowTaskType, TIMER_TASK_STATUS_NONE};

/// Regenerates the full task set from a mutable-state snapshot.
pub struct TaskRefresher {
    events_cache: Arc<EventsCache>,
    history_retention: Duration,
}

impl TaskRefresher {
    /// Create a refresher fetching originating events through `events_cache`.
    pub fn new(events_cache: Arc<EventsCache>, history_retention: Duration) -> Self {
        Self {
            events_cache,
            history_retention,
        }
    }

    /// Refresh every task of `ms`. On error the caller must discard the
    /// state object; partial regeneration is not committed.
    pub async fn refresh_tasks(
        &self,
        cancel: &CancellationToken,
        ms: &mut MutableState,
    ) -> Result<()> {
        let generator = TaskGenerator::new(self.history_retention);

        ms.wipe_transaction_tasks();

        self.refresh_tasks_for_workflow_start(ms, &generator)?;
        self.refresh_tasks_for_workflow_close(ms, &generator)?;
        self.refresh_tasks_for_record_workflow_started(ms, &generator)?;
        self.refresh_workflow_task_tasks(ms, &generator)?;
        self.refresh_tasks_for_activity(cancel, ms, &generator).await?;
        self.refresh_tasks_for_timer(ms)?;
        self.refresh_tasks_for_child_workflow(cancel, ms, &generator)
            .await?;
        self.refresh_tasks_for_request_cancel_external(cancel, ms, &generator)
            .await?;
        self.refresh_tasks_for_signal_external(cancel, ms, &generator)
            .await?;
        self.refresh_tasks_for_search_attributes(ms, &generator)
    }

    fn refresh_tasks_for_workflow_start(
        &self,
        ms: &mut MutableState,
        generator: &TaskGenerator,
    ) -> Result<()> {
        if !ms.is_workflow_execution_running() {
            return Ok(());
        }
        generator.generate_workflow_start_tasks(ms, None)
    }

    fn refresh_tasks_for_workflow_close(
        &self,
        ms: &mut MutableState,
        generator: &TaskGenerator,
    ) -> Result<()> {
        if ms.is_workflow_execution_running() {
            return Ok(());
        }
        generator.generate_workflow_close_tasks(ms)
    }

    fn refresh_tasks_for_record_workflow_started(
        &self,
        ms: &mut MutableState,
        generator: &TaskGenerator,
    ) -> Result<()> {
        if !ms.is_workflow_execution_running() {
            return Ok(());
        }
        generator.generate_record_workflow_started_tasks(ms)
    }

    fn refresh_workflow_task_tasks(
        &self,
        ms: &mut MutableState,
        generator: &TaskGenerator,
    ) -> Result<()> {
        let Some(workflow_task) = ms.pending_workflow_task().cloned() else {
            return Ok(());
        };
        if matches!(workflow_task.task_type, WorkflowTaskType::Speculative) {
            // Speculative workflow tasks have no timer or transfer tasks.
            return Ok(());
        }
        if workflow_task.is_started() {
            return generator
                .generate_started_workflow_task_tasks(ms, workflow_task.scheduled_event_id);
        }
        generator.generate_scheduled_workflow_task_tasks(ms, workflow_task.scheduled_event_id)
    }

    async fn refresh_tasks_for_activity(
        &self,
        cancel: &CancellationToken,
        ms: &mut MutableState,
        generator: &TaskGenerator,
    ) -> Result<()> {
        let workflow_key = ms.workflow_key().clone();
        let branch_token = ms.current_branch_token().to_vec();
        let pending: Vec<_> = ms.pending_activity_infos().values().cloned().collect();

        for mut info in pending {
            // Clear the timer mask so the timer sequence regenerates from
            // scratch.
            info.timer_task_status = TIMER_TASK_STATUS_NONE;
            let scheduled_event_id = info.scheduled_event_id;
            let batch_id = info.scheduled_event_batch_id;
            let started = info.is_started();
            ms.update_activity(info)?;

            if started {
                continue;
            }

            // The scheduled event must still be readable; a missing event
            // means the branch and the record disagree.
            self.events_cache
                .get_event(
                    cancel,
                    EventKey {
                        workflow_key: workflow_key.clone(),
                        event_id: scheduled_event_id,
                    },
                    batch_id,
                    &branch_token,
                )
                .await?;

            generator.generate_activity_tasks(ms, scheduled_event_id)?;
        }

        TimerSequence::new().create_next_activity_timer(ms)?;
        Ok(())
    }

    fn refresh_tasks_for_timer(&self, ms: &mut MutableState) -> Result<()> {
        let pending: Vec<_> = ms.pending_timer_infos().values().cloned().collect();
        for mut info in pending {
            info.task_status = TIMER_TASK_STATUS_NONE;
            ms.update_user_timer(info)?;
        }
        TimerSequence::new().create_next_user_timer(ms)?;
        Ok(())
    }

    async fn refresh_tasks_for_child_workflow(
        &self,
        cancel: &CancellationToken,
        ms: &mut MutableState,
        generator: &TaskGenerator,
    ) -> Result<()> {
        let workflow_key = ms.workflow_key().clone();
        let branch_token = ms.current_branch_token().to_vec();
        let pending: Vec<_> = ms.pending_child_execution_infos().values().cloned().collect();

        for info in pending {
            if info.is_started() {
                continue;
            }
            self.events_cache
                .get_event(
                    cancel,
                    EventKey {
                        workflow_key: workflow_key.clone(),
                        event_id: info.initiated_event_id,
                    },
                    info.initiated_event_batch_id,
                    &branch_token,
                )
                .await?;
            generator.generate_child_workflow_tasks(ms, info.initiated_event_id)?;
        }
        Ok(())
    }

    async fn refresh_tasks_for_request_cancel_external(
        &self,
        cancel: &CancellationToken,
        ms: &mut MutableState,
        generator: &TaskGenerator,
    ) -> Result<()> {
        let workflow_key = ms.workflow_key().clone();
        let branch_token = ms.current_branch_token().to_vec();
        let pending: Vec<_> = ms.pending_request_cancel_infos().values().cloned().collect();

        for info in pending {
            self.events_cache
                .get_event(
                    cancel,
                    EventKey {
                        workflow_key: workflow_key.clone(),
                        event_id: info.initiated_event_id,
                    },
                    info.initiated_event_batch_id,
                    &branch_token,
                )
                .await?;
            generator.generate_request_cancel_external_tasks(ms, info.initiated_event_id)?;
        }
        Ok(())
    }

    async fn refresh_tasks_for_signal_external(
        &self,
        cancel: &CancellationToken,
        ms: &mut MutableState,
        generator: &TaskGenerator,
    ) -> Result<()> {
        let workflow_key = ms.workflow_key().clone();
        let branch_token = ms.current_branch_token().to_vec();
        let pending: Vec<_> = ms.pending_signal_external_infos().values().cloned().collect();

        for info in pending {
            self.events_cache
                .get_event(
                    cancel,
                    EventKey {
                        workflow_key: workflow_key.clone(),
                        event_id: info.initiated_event_id,
                    },
                    info.initiated_event_batch_id,
                    &branch_token,
                )
                .await?;
            generator.generate_signal_external_tasks(ms, info.initiated_event_id)?;
        }
        Ok(())
    }

    fn refresh_tasks_for_search_attributes(
        &self,
        ms: &mut MutableState,
        generator: &TaskGenerator,
    ) -> Result<()> {
        if !ms.is_workflow_execution_running() {
            return Ok(());
        }
        generator.generate_upsert_visibility_task(ms)
    }
}
