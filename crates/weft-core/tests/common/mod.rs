// Copyright (C) 2025 Weft Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared test fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use weft_core::api::start_workflow::{self, StartWorkflowExecutionRequest};
use weft_core::config::CoreConfig;
use weft_core::error::Result;
use weft_core::matching::{AddWorkflowTaskRequest, MatchingClient};
use weft_core::persistence::{ExecutionStore, MemoryStore};
use weft_core::shard::ShardContext;
use weft_core::state::mutable_state::StartWorkflowRequest;
use weft_core::workflow::{
    bypass_mutable_state_consistency, LockPriority, WorkflowConsistencyChecker,
    WorkflowContextCache,
};
use weft_core::WorkflowKey;

/// Opt-in tracing for debugging a failing test: `WEFT_TEST_LOG=debug`.
pub fn init_tracing() {
    if let Ok(filter) = std::env::var("WEFT_TEST_LOG") {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    }
}

/// Matching client that records requests and forwards them to the test.
pub struct RecordingMatching {
    pub log: Mutex<Vec<AddWorkflowTaskRequest>>,
    forward: Mutex<Option<mpsc::UnboundedSender<AddWorkflowTaskRequest>>>,
}

impl RecordingMatching {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<AddWorkflowTaskRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                log: Mutex::new(Vec::new()),
                forward: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    pub fn request_count(&self) -> usize {
        self.log.lock().expect("matching log poisoned").len()
    }
}

#[async_trait::async_trait]
impl MatchingClient for RecordingMatching {
    async fn add_workflow_task(
        &self,
        _cancel: &CancellationToken,
        request: AddWorkflowTaskRequest,
    ) -> Result<()> {
        self.log
            .lock()
            .expect("matching log poisoned")
            .push(request.clone());
        if let Some(tx) = self.forward.lock().expect("matching forward poisoned").as_ref() {
            let _ = tx.send(request);
        }
        Ok(())
    }
}

/// One shard's worth of engine, wired to the in-memory backend.
pub struct TestContext {
    pub config: CoreConfig,
    pub store: Arc<MemoryStore>,
    pub shard: Arc<ShardContext>,
    pub cache: Arc<WorkflowContextCache>,
    pub checker: Arc<WorkflowConsistencyChecker>,
    pub matching: Arc<RecordingMatching>,
    pub matching_rx: mpsc::UnboundedReceiver<AddWorkflowTaskRequest>,
    pub cancel: CancellationToken,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new())).await
    }

    pub async fn with_store(store: Arc<MemoryStore>) -> Self {
        init_tracing();
        let config = CoreConfig::default();
        let shard = ShardContext::acquire(store.clone(), 1, "test-host", &config)
            .await
            .expect("acquire shard");
        let cache = Arc::new(WorkflowContextCache::new(
            config.workflow_cache_size,
            config.low_priority_lock_defer,
        ));
        let execution_store: Arc<dyn ExecutionStore> = store.clone();
        let checker = Arc::new(WorkflowConsistencyChecker::new(
            shard.clone(),
            execution_store,
            cache.clone(),
        ));
        let (matching, matching_rx) = RecordingMatching::new();
        Self {
            config,
            store,
            shard,
            cache,
            checker,
            matching,
            matching_rx,
            cancel: CancellationToken::new(),
        }
    }

    /// Start a workflow through the real start path.
    pub async fn start_workflow(&self, workflow_id: &str) -> WorkflowKey {
        start_workflow::invoke(
            &self.cancel,
            StartWorkflowExecutionRequest {
                namespace_id: "ns-test".to_string(),
                workflow_id: workflow_id.to_string(),
                start: StartWorkflowRequest {
                    workflow_type: "integration-test".to_string(),
                    task_queue: "default".to_string(),
                    input: None,
                    workflow_run_timeout: Some(Duration::from_secs(3600)),
                    workflow_execution_timeout: None,
                    workflow_task_timeout: Some(Duration::from_secs(10)),
                    create_request_id: uuid::Uuid::new_v4().to_string(),
                    first_workflow_task_backoff: None,
                    search_attributes: HashMap::new(),
                    continued_execution_run_id: None,
                },
            },
            &self.checker,
            self.matching.clone(),
        )
        .await
        .expect("start workflow")
    }

    /// Drive the pending workflow task to completion and commit, returning
    /// the completed event id.
    pub async fn complete_pending_workflow_task(&self, key: &WorkflowKey) -> i64 {
        let locked = self
            .checker
            .workflow_context(
                &self.cancel,
                bypass_mutable_state_consistency,
                key,
                LockPriority::High,
            )
            .await
            .expect("lock workflow");

        let completed_id = locked
            .with_mutable_state(|ms| -> weft_core::error::Result<i64> {
                let wt = ms
                    .pending_workflow_task()
                    .cloned()
                    .expect("a workflow task must be pending");
                if !wt.is_started() {
                    ms.add_workflow_task_started_event(
                        wt.scheduled_event_id,
                        uuid::Uuid::new_v4().to_string(),
                    )?;
                }
                Ok(ms.add_workflow_task_completed_event("test-worker")?.event_id)
            })
            .expect("state loaded")
            .expect("complete workflow task");

        locked
            .update_workflow_execution(&self.cancel)
            .await
            .expect("commit");
        completed_id
    }

    /// Terminate the workflow and commit.
    pub async fn terminate_workflow(&self, key: &WorkflowKey) {
        let locked = self
            .checker
            .workflow_context(
                &self.cancel,
                bypass_mutable_state_consistency,
                key,
                LockPriority::High,
            )
            .await
            .expect("lock workflow");
        locked
            .with_mutable_state(|ms| {
                ms.add_workflow_execution_terminated_event(
                    "test teardown",
                    "test",
                    Duration::from_secs(3600),
                )
            })
            .expect("state loaded")
            .expect("terminate");
        locked
            .update_workflow_execution(&self.cancel)
            .await
            .expect("commit terminate");
    }
}
