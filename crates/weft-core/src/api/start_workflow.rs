// Copyright (C) 2025 Weft Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The start-workflow invocation path.
//!
//! Creates a fresh run: new run id, new history branch, the started event,
//! the first workflow task, and one atomic create against the execution
//! store. The first workflow task dispatches to matching after the lock is
//! released, same as every other outbound call.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::Result;
use crate::history::branch::BranchInfo;
use crate::matching::{AddWorkflowTaskRequest, MatchingClient};
use crate::persistence::CreateWorkflowMode;
use crate::state::mutable_state::{MutableState, StartWorkflowRequest};
use crate::state::WorkflowTaskType;
use crate::workflow::consistency::WorkflowConsistencyChecker;
use crate::workflow::lock::LockPriority;
use crate::WorkflowKey;

/// Request to start a new workflow execution.
#[derive(Debug, Clone)]
pub struct StartWorkflowExecutionRequest {
    /// Owning namespace.
    pub namespace_id: String,
    /// The workflow id.
    pub workflow_id: String,
    /// Start parameters (type, queue, input, timeouts, dedup id).
    pub start: StartWorkflowRequest,
}

/// Start a new run and dispatch its first workflow task.
#[instrument(skip(cancel, request, checker, matching_client), fields(
    namespace_id = %request.namespace_id,
    workflow_id = %request.workflow_id,
))]
pub async fn invoke(
    cancel: &CancellationToken,
    request: StartWorkflowExecutionRequest,
    checker: &WorkflowConsistencyChecker,
    matching_client: Arc<dyn MatchingClient>,
) -> Result<WorkflowKey> {
    let workflow_key = WorkflowKey::new(
        request.namespace_id.clone(),
        request.workflow_id.clone(),
        Uuid::new_v4().to_string(),
    );
    let shard = checker.shard();

    let context = checker.cache().get_or_create(&workflow_key);
    let locked = context
        .lock_context(LockPriority::High, cancel, shard.clone(), checker.store())
        .await?;

    // Build the run in memory: branch, started event, first workflow task.
    let branch = BranchInfo::new_root();
    let mut state = MutableState::new_for_start(shard.shard_id(), workflow_key.clone(), &branch)?;
    state.add_workflow_execution_started_event(request.start.clone())?;
    let first_task_delayed = request
        .start
        .first_workflow_task_backoff
        .map(|backoff| !backoff.is_zero())
        .unwrap_or(false);
    let workflow_task = if first_task_delayed {
        None
    } else {
        Some(state.add_workflow_task_scheduled_event(false, WorkflowTaskType::Normal)?)
    };
    locked.install_mutable_state(state);

    locked
        .create_workflow_execution(cancel, CreateWorkflowMode::BrandNew, None, 0)
        .await?;
    info!(workflow_key = %workflow_key, "workflow started");

    // Dispatch outside the lock.
    drop(locked);
    if let Some(workflow_task) = workflow_task {
        matching_client
            .add_workflow_task(
                cancel,
                AddWorkflowTaskRequest {
                    namespace_id: request.namespace_id,
                    execution: workflow_key.clone(),
                    task_queue: workflow_task.task_queue,
                    scheduled_event_id: workflow_task.scheduled_event_id,
                    schedule_to_start_timeout: workflow_task.start_to_close_timeout,
                    clock: shard.new_vector_clock(),
                },
            )
            .await?;
    }

    Ok(workflow_key)
}
