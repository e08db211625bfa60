// Copyright (C) 2025 Weft Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Matching service client contract.
//!
//! The history core never talks to workers directly; it hands dispatchable
//! workflow tasks to the matching service. Only the contract lives here.
//! Calls are idempotent on (workflow key, scheduled event id): redelivery
//! after a timeout must not double-dispatch.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::shard::VectorClock;
use crate::WorkflowKey;

/// Request to enqueue a workflow task for dispatch.
#[derive(Debug, Clone)]
pub struct AddWorkflowTaskRequest {
    /// Owning namespace.
    pub namespace_id: String,
    /// The run the task advances.
    pub execution: WorkflowKey,
    /// Task queue to dispatch on.
    pub task_queue: String,
    /// The workflow task's scheduled event.
    pub scheduled_event_id: i64,
    /// How long the task may wait in the queue.
    pub schedule_to_start_timeout: Option<Duration>,
    /// Shard clock so matching can detect stale routing.
    pub clock: VectorClock,
}

/// Client to the matching service.
#[async_trait]
pub trait MatchingClient: Send + Sync {
    /// Enqueue a workflow task for worker dispatch.
    async fn add_workflow_task(
        &self,
        cancel: &CancellationToken,
        request: AddWorkflowTaskRequest,
    ) -> Result<()>;
}
