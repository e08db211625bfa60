// Copyright (C) 2025 Weft Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The update-workflow invocation path.
//!
//! The canonical coordination pattern of the engine: lock, mutate, release,
//! then wait. The workflow lock is explicitly released before the outbound
//! matching call; matching dispatches workflow tasks back into this service,
//! so holding the run's lock across that call would deadlock on redelivery.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::error::{CoreError, Result};
use crate::matching::{AddWorkflowTaskRequest, MatchingClient};
use crate::state::{WorkflowTaskType, UpdateStage};
use crate::update::{Effects, Outcome, UpdateMessage};
use crate::workflow::consistency::{
    bypass_mutable_state_consistency, WorkflowConsistencyChecker,
};
use crate::workflow::lock::LockPriority;
use crate::WorkflowKey;

/// Request to update a running workflow.
#[derive(Debug, Clone)]
pub struct UpdateWorkflowRequest {
    /// Owning namespace.
    pub namespace_id: String,
    /// Target workflow id.
    pub workflow_id: String,
    /// Target run id.
    pub run_id: String,
    /// When set, the run chain's first run id must match, or the request
    /// targets the wrong execution.
    pub first_execution_run_id: Option<String>,
    /// The update's id. Re-sending an id re-attaches to the same update.
    pub update_id: String,
    /// Handler input.
    pub input: serde_json::Value,
    /// The lifecycle stage to wait for before responding.
    pub wait_stage: UpdateStage,
}

/// Response of a completed update invocation.
#[derive(Debug, Clone)]
pub struct UpdateWorkflowResponse {
    /// The run the update was applied to.
    pub workflow_key: WorkflowKey,
    /// The update's id.
    pub update_id: String,
    /// The outcome, when the waited-for stage carries one.
    pub outcome: Option<Outcome>,
}

/// Execute an update against a running workflow and wait for the requested
/// lifecycle stage.
#[instrument(skip(cancel, request, checker, matching_client), fields(
    workflow_id = %request.workflow_id,
    update_id = %request.update_id,
))]
pub async fn invoke(
    cancel: &CancellationToken,
    request: UpdateWorkflowRequest,
    checker: &WorkflowConsistencyChecker,
    matching_client: Arc<dyn MatchingClient>,
) -> Result<UpdateWorkflowResponse> {
    // 1. Pick the wait behavior first; only Accepted and Completed are
    //    waitable stages.
    enum WaitKind {
        Accepted,
        Completed,
    }
    let wait_kind = match request.wait_stage {
        UpdateStage::Accepted => WaitKind::Accepted,
        UpdateStage::Completed => WaitKind::Completed,
        other => {
            return Err(CoreError::Unimplemented {
                feature: format!("update wait stage {}", other),
            })
        }
    };

    // 2. Acquire the workflow under the high-priority lock.
    let workflow_key = WorkflowKey::new(
        request.namespace_id.clone(),
        request.workflow_id.clone(),
        request.run_id.clone(),
    );
    let locked = checker
        .workflow_context(
            cancel,
            bypass_mutable_state_consistency,
            &workflow_key,
            LockPriority::High,
        )
        .await?;

    let running = locked.with_mutable_state(|ms| ms.is_workflow_execution_running())?;
    if !running {
        return Err(CoreError::WorkflowCompleted);
    }

    if let Some(pinned) = &request.first_execution_run_id {
        let actual =
            locked.with_mutable_state(|ms| ms.execution_info().first_execution_run_id.clone())?;
        if &actual != pinned {
            return Err(CoreError::WorkflowExecutionNotFound {
                workflow_id: request.workflow_id.clone(),
                run_id: Some(pinned.clone()),
            });
        }
    }

    // 3. Register (or re-attach to) the update and apply the request message
    //    with immediate effects.
    let registry = locked.update_registry();
    let (update, already_existed) = registry.find_or_create(&request.update_id);
    let applied = locked.with_mutable_state(|ms| {
        update.on_message(
            UpdateMessage::Request {
                input: request.input.clone(),
            },
            Effects::Immediate(ms),
        )
    })?;
    if let Err(err) = applied {
        locked.clear_cached_state();
        return Err(err);
    }

    // 4. If a workflow task is already scheduled, the update rides along
    //    with it. If the update is a duplicate, its workflow task already
    //    exists. Otherwise schedule a speculative workflow task: in-memory
    //    only, cheap to abandon if the update never needs events.
    let create_new_workflow_task =
        !locked.with_mutable_state(|ms| ms.has_pending_workflow_task())? && !already_existed;

    let dispatch = if create_new_workflow_task {
        let scheduled = locked.with_mutable_state(|ms| {
            ms.add_workflow_task_scheduled_event(false, WorkflowTaskType::Speculative)
        })?;
        let workflow_task = match scheduled {
            Ok(workflow_task) => workflow_task,
            Err(err) => {
                locked.clear_cached_state();
                return Err(err);
            }
        };
        if workflow_task.task_type != WorkflowTaskType::Speculative {
            // A speculative request can only be demoted by buffered events,
            // and with no pending workflow task there can be none.
            locked.clear_cached_state();
            return Err(CoreError::WorkflowTaskStateInconsistent {
                message: "speculative workflow task was materialized at schedule time".to_string(),
            });
        }
        debug!(
            scheduled_event_id = workflow_task.scheduled_event_id,
            "speculative workflow task scheduled for update"
        );
        Some(AddWorkflowTaskRequest {
            namespace_id: request.namespace_id.clone(),
            execution: workflow_key.clone(),
            task_queue: workflow_task.task_queue.clone(),
            scheduled_event_id: workflow_task.scheduled_event_id,
            schedule_to_start_timeout: workflow_task.start_to_close_timeout,
            clock: checker.shard().new_vector_clock(),
        })
    } else {
        None
    };

    // 5. Release the workflow lock before calling matching; matching
    //    dispatches back into this shard and would deadlock against the
    //    held lock.
    drop(locked);
    if let Some(dispatch) = dispatch {
        matching_client.add_workflow_task(cancel, dispatch).await?;
    }

    // 6. Wait for the requested stage.
    let outcome = match wait_kind {
        WaitKind::Accepted => update.wait_accepted(cancel).await?,
        WaitKind::Completed => Some(update.wait_outcome(cancel).await?),
    };

    // 7. Respond with the update reference and outcome.
    Ok(UpdateWorkflowResponse {
        workflow_key,
        update_id: request.update_id,
        outcome,
    })
}
