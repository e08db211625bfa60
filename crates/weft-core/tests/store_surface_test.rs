// Copyright (C) 2025 Weft Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests for the wider execution-store surface: conflict
//! resolution, scans, task streams, the replication DLQ, and the task-queue
//! store.

mod common;

use std::sync::Arc;

use common::TestContext;
use weft_core::codec::DataBlob;
use weft_core::persistence::{
    ConflictResolveWorkflowExecutionRequest, ConflictResolveWorkflowMode, ExecutionStore,
    ListConcreteExecutionsRequest, MemoryStore, QueuedTask, ReplicationDlqTask, TaskQueueRecord,
    TaskStore,
};
use weft_core::state::{WorkflowState, WorkflowStatus};
use weft_core::tasks::TaskCategory;
use weft_core::WorkflowKey;

#[tokio::test]
async fn test_conflict_resolve_resets_run_and_repoints_current() {
    let ctx = TestContext::new().await;
    let key = ctx.start_workflow("wf-conflict").await;
    ctx.complete_pending_workflow_task(&key).await;

    let stored = ctx
        .store
        .get_workflow_execution(&ctx.cancel, 1, key.clone())
        .await
        .expect("stored run");
    assert!(stored.snapshot.next_event_id > 2);

    // Reset the run back to just after the start event, as a conflict
    // resolution would after a history divergence.
    let mut reset = stored.snapshot.clone();
    reset.next_event_id = 3;
    reset.db_record_version = stored.db_record_version + 1;
    reset.condition = stored.db_record_version;
    reset.execution_state.state = WorkflowState::Running;
    reset.execution_state.status = WorkflowStatus::Running;
    reset.workflow_task = None;

    ctx.store
        .conflict_resolve_workflow_execution(
            &ctx.cancel,
            ConflictResolveWorkflowExecutionRequest {
                shard_id: 1,
                range_id: ctx.shard.range_id(),
                mode: ConflictResolveWorkflowMode::UpdateCurrent,
                reset_snapshot: reset.clone(),
                reset_events: Vec::new(),
                new_snapshot: None,
                new_events: Vec::new(),
                current_mutation: None,
                current_events: Vec::new(),
            },
        )
        .await
        .expect("conflict resolve");

    let after = ctx
        .store
        .get_workflow_execution(&ctx.cancel, 1, key.clone())
        .await
        .expect("read back");
    assert_eq!(after.snapshot.next_event_id, 3);
    assert_eq!(after.db_record_version, reset.db_record_version);

    let current = ctx
        .store
        .get_current_execution(&ctx.cancel, 1, &key.namespace_id, &key.workflow_id)
        .await
        .expect("current");
    assert_eq!(current.run_id, key.run_id);
    assert_eq!(current.status, WorkflowStatus::Running);
}

#[tokio::test]
async fn test_list_concrete_executions_pages_through_all_runs() {
    let ctx = TestContext::new().await;
    let mut keys: Vec<WorkflowKey> = Vec::new();
    for i in 0..5 {
        keys.push(ctx.start_workflow(&format!("wf-scan-{i}")).await);
    }

    let mut seen: Vec<WorkflowKey> = Vec::new();
    let mut page_token = Vec::new();
    loop {
        let response = ctx
            .store
            .list_concrete_executions(
                &ctx.cancel,
                ListConcreteExecutionsRequest {
                    shard_id: 1,
                    page_size: 2,
                    page_token,
                },
            )
            .await
            .expect("scan page");
        seen.extend(response.snapshots.iter().map(|s| s.workflow_key.clone()));
        if response.next_page_token.is_empty() {
            break;
        }
        page_token = response.next_page_token;
    }

    assert_eq!(seen.len(), keys.len());
    for key in &keys {
        assert!(seen.contains(key), "scan must include {key}");
    }
}

#[tokio::test]
async fn test_history_task_completion_and_range_completion() {
    use weft_core::persistence::GetHistoryTasksRequest;
    use weft_core::tasks::TaskKey;

    let ctx = TestContext::new().await;
    ctx.start_workflow("wf-task-stream").await;

    let read = |page_token: Vec<u8>| GetHistoryTasksRequest {
        shard_id: 1,
        category: TaskCategory::Transfer,
        inclusive_min_key: TaskKey::min(),
        exclusive_max_key: TaskKey::max(),
        page_size: 100,
        page_token,
    };

    let before = ctx
        .store
        .get_history_tasks(&ctx.cancel, read(Vec::new()))
        .await
        .expect("read stream");
    assert!(!before.tasks.is_empty());

    // Complete one task; it disappears from the stream.
    let first_key = before.tasks[0].key;
    ctx.store
        .complete_history_task(&ctx.cancel, 1, TaskCategory::Transfer, first_key)
        .await
        .expect("complete");
    let after_one = ctx
        .store
        .get_history_tasks(&ctx.cancel, read(Vec::new()))
        .await
        .expect("read stream");
    assert_eq!(after_one.tasks.len(), before.tasks.len() - 1);

    // Range-complete the rest.
    ctx.store
        .range_complete_history_tasks(
            &ctx.cancel,
            1,
            TaskCategory::Transfer,
            TaskKey::min(),
            TaskKey::max(),
        )
        .await
        .expect("range complete");
    let drained = ctx
        .store
        .get_history_tasks(&ctx.cancel, read(Vec::new()))
        .await
        .expect("read stream");
    assert!(drained.tasks.is_empty());
}

#[tokio::test]
async fn test_set_workflow_execution_overwrites_image() {
    let ctx = TestContext::new().await;
    let key = ctx.start_workflow("wf-set").await;

    let stored = ctx
        .store
        .get_workflow_execution(&ctx.cancel, 1, key.clone())
        .await
        .expect("stored");
    let mut repaired = stored.snapshot.clone();
    repaired.condition = stored.db_record_version;
    repaired.db_record_version = stored.db_record_version + 1;
    repaired
        .execution_info
        .search_attributes
        .insert("repaired".to_string(), serde_json::json!(true));

    ctx.store
        .set_workflow_execution(&ctx.cancel, 1, ctx.shard.range_id(), repaired)
        .await
        .expect("set");

    let after = ctx
        .store
        .get_workflow_execution(&ctx.cancel, 1, key.clone())
        .await
        .expect("read back");
    assert_eq!(
        after.snapshot.execution_info.search_attributes.get("repaired"),
        Some(&serde_json::json!(true))
    );
    assert_eq!(after.db_record_version, stored.db_record_version + 1);
}

#[tokio::test]
async fn test_branch_enumeration_and_deletion() {
    use weft_core::history::branch::BranchInfo;
    use weft_core::persistence::{
        DeleteBranchRange, DeleteHistoryBranchRequest, HistoryNode, HistoryNodeAppend,
        ReadHistoryBranchRequest,
    };

    let store = Arc::new(MemoryStore::new());
    let cancel = tokio_util::sync::CancellationToken::new();

    let branch = BranchInfo::new_root();
    let token = branch.to_token().expect("token");
    store
        .insert_history_tree(&cancel, 1, branch.clone(), DataBlob::encode(&"t").unwrap())
        .await
        .expect("insert tree");
    for node_id in [1i64, 4, 7] {
        store
            .append_history_nodes(
                &cancel,
                1,
                HistoryNodeAppend {
                    branch_token: token.clone(),
                    branch_info: branch.clone(),
                    node: HistoryNode {
                        node_id,
                        transaction_id: node_id,
                        prev_transaction_id: 0,
                        events: DataBlob::encode(&format!("n{node_id}")).unwrap(),
                    },
                },
            )
            .await
            .expect("append");
    }

    let (details, next) = store
        .get_all_history_tree_branches(&cancel, 10, Vec::new())
        .await
        .expect("enumerate");
    assert!(next.is_empty());
    assert!(details
        .iter()
        .any(|d| d.tree_id == branch.tree_id && d.branch_id == branch.branch_id));

    store
        .delete_history_branch(
            &cancel,
            DeleteHistoryBranchRequest {
                shard_id: 1,
                branch_info: branch.clone(),
                branch_ranges: vec![DeleteBranchRange {
                    branch_id: branch.branch_id.clone(),
                    begin_node_id: 1,
                }],
            },
        )
        .await
        .expect("delete branch");

    let read = store
        .read_history_branch(
            &cancel,
            ReadHistoryBranchRequest {
                shard_id: 1,
                branch_token: token,
                min_node_id: 1,
                max_node_id: 10,
                page_size: 10,
                page_token: Vec::new(),
                metadata_only: false,
                reverse: false,
            },
        )
        .await
        .expect("read after delete");
    assert!(read.nodes.is_empty(), "deleted branch reads empty");

    let (details, _) = store
        .get_all_history_tree_branches(&cancel, 10, Vec::new())
        .await
        .expect("enumerate after delete");
    assert!(details.is_empty());
}

#[tokio::test]
async fn test_replication_dlq_round_trip() {
    let store = Arc::new(MemoryStore::new());
    let cancel = tokio_util::sync::CancellationToken::new();

    assert!(store
        .is_replication_dlq_empty(&cancel, 1, "cluster-b")
        .await
        .expect("empty check"));

    for task_id in [3i64, 5, 9] {
        store
            .put_replication_task_to_dlq(
                &cancel,
                1,
                "cluster-b",
                ReplicationDlqTask {
                    task_id,
                    blob: DataBlob::encode(&format!("repl-{task_id}")).expect("encode"),
                },
            )
            .await
            .expect("put");
    }
    assert!(!store
        .is_replication_dlq_empty(&cancel, 1, "cluster-b")
        .await
        .expect("non-empty check"));

    let (tasks, token) = store
        .get_replication_tasks_from_dlq(&cancel, 1, "cluster-b", 0, i64::MAX, 10, Vec::new())
        .await
        .expect("read");
    assert_eq!(tasks.iter().map(|t| t.task_id).collect::<Vec<_>>(), vec![3, 5, 9]);
    assert!(token.is_empty());

    store
        .delete_replication_task_from_dlq(&cancel, 1, "cluster-b", 5)
        .await
        .expect("delete one");
    store
        .range_delete_replication_tasks_from_dlq(&cancel, 1, "cluster-b", 0, 4)
        .await
        .expect("range delete");

    let (tasks, _) = store
        .get_replication_tasks_from_dlq(&cancel, 1, "cluster-b", 0, i64::MAX, 10, Vec::new())
        .await
        .expect("read remaining");
    assert_eq!(tasks.iter().map(|t| t.task_id).collect::<Vec<_>>(), vec![9]);
}

#[tokio::test]
async fn test_task_queue_store_round_trip() {
    let store = Arc::new(MemoryStore::new());
    let cancel = tokio_util::sync::CancellationToken::new();

    store
        .create_task_queue(
            &cancel,
            TaskQueueRecord {
                namespace_id: "ns".to_string(),
                name: "orders".to_string(),
                range_id: 1,
                info: DataBlob::encode(&"queue").expect("encode"),
            },
        )
        .await
        .expect("create queue");

    // Writes under a stale range id are rejected.
    let err = store
        .create_tasks(
            &cancel,
            "ns",
            "orders",
            0,
            vec![QueuedTask {
                task_id: 1,
                blob: DataBlob::encode(&"t1").expect("encode"),
                expiry_time: None,
            }],
        )
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "CONDITION_FAILED");

    store
        .create_tasks(
            &cancel,
            "ns",
            "orders",
            1,
            (1..=4)
                .map(|task_id| QueuedTask {
                    task_id,
                    blob: DataBlob::encode(&format!("t{task_id}")).expect("encode"),
                    expiry_time: None,
                })
                .collect(),
        )
        .await
        .expect("create tasks");

    let tasks = store
        .get_tasks(&cancel, "ns", "orders", 1, 10)
        .await
        .expect("read after id 1");
    assert_eq!(tasks.iter().map(|t| t.task_id).collect::<Vec<_>>(), vec![2, 3, 4]);

    let removed = store
        .complete_tasks_less_than(&cancel, "ns", "orders", 4)
        .await
        .expect("trim");
    assert_eq!(removed, 3);

    let remaining = store
        .get_tasks(&cancel, "ns", "orders", 0, 10)
        .await
        .expect("read rest");
    assert_eq!(remaining.iter().map(|t| t.task_id).collect::<Vec<_>>(), vec![4]);
}
