// Copyright (C) 2025 Weft Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests for shard range-id ownership.

mod common;

use std::sync::Arc;

use common::TestContext;
use weft_core::config::CoreConfig;
use weft_core::error::CoreError;
use weft_core::persistence::{ExecutionStore, MemoryStore};
use weft_core::shard::ShardContext;
use weft_core::workflow::{bypass_mutable_state_consistency, LockPriority};

#[tokio::test]
async fn test_stolen_range_fails_writes_without_mutation() {
    let store = Arc::new(MemoryStore::new());
    let ctx = TestContext::with_store(store.clone()).await;

    // 1. A workflow exists under the first owner's lease.
    let key = ctx.start_workflow("wf-shard-loss").await;
    let before = store
        .get_workflow_execution(&ctx.cancel, 1, key.clone())
        .await
        .expect("stored run");

    // 2. Another process acquires the shard, bumping the range id.
    let thief = ShardContext::acquire(store.clone(), 1, "other-host", &CoreConfig::default())
        .await
        .expect("steal shard");
    assert!(thief.range_id() > ctx.shard.range_id());

    // 3. The first owner's next write must fail with ShardOwnershipLost
    //    and leave the stored record untouched.
    let locked = ctx
        .checker
        .workflow_context(
            &ctx.cancel,
            bypass_mutable_state_consistency,
            &key,
            LockPriority::High,
        )
        .await
        .expect("lock");
    locked
        .with_mutable_state(|ms| {
            ms.add_workflow_execution_signaled_event("poke", None, "test", None)
        })
        .expect("state")
        .expect("signal");
    let err = locked
        .update_workflow_execution(&ctx.cancel)
        .await
        .unwrap_err();
    assert!(
        matches!(err, CoreError::ShardOwnershipLost { .. }),
        "expected ShardOwnershipLost, got {err:?}"
    );

    let after = store
        .get_workflow_execution(&ctx.cancel, 1, key.clone())
        .await
        .expect("stored run");
    assert_eq!(
        before.db_record_version, after.db_record_version,
        "failed write must not bump the record version"
    );
    assert_eq!(
        before.snapshot.next_event_id, after.snapshot.next_event_id,
        "failed write must not append events"
    );
}

#[tokio::test]
async fn test_commits_write_strictly_increasing_task_ids() {
    use weft_core::persistence::GetHistoryTasksRequest;
    use weft_core::tasks::{TaskCategory, TaskKey};

    let store = Arc::new(MemoryStore::new());
    let ctx = TestContext::with_store(store.clone()).await;

    let read_all_task_ids = |store: Arc<MemoryStore>, cancel: tokio_util::sync::CancellationToken| async move {
        let mut ids: Vec<i64> = Vec::new();
        for category in [
            TaskCategory::Transfer,
            TaskCategory::Timer,
            TaskCategory::Visibility,
            TaskCategory::Archival,
        ] {
            let response = store
                .get_history_tasks(
                    &cancel,
                    GetHistoryTasksRequest {
                        shard_id: 1,
                        category,
                        inclusive_min_key: TaskKey::min(),
                        exclusive_max_key: TaskKey::max(),
                        page_size: 1024,
                        page_token: Vec::new(),
                    },
                )
                .await
                .expect("read tasks");
            ids.extend(response.tasks.iter().map(|t| t.key.task_id));
        }
        ids
    };

    // Commit 1: start.
    let key = ctx.start_workflow("wf-task-ids").await;
    let after_start = read_all_task_ids(store.clone(), ctx.cancel.clone()).await;
    let max_after_start = after_start.iter().copied().max().expect("start wrote tasks");

    // Commit 2: complete the first workflow task (writes no tasks) and then
    // terminate (writes close tasks).
    ctx.complete_pending_workflow_task(&key).await;
    ctx.terminate_workflow(&key).await;

    let after_close = read_all_task_ids(store.clone(), ctx.cancel.clone()).await;
    let new_ids: Vec<i64> = after_close
        .iter()
        .copied()
        .filter(|id| !after_start.contains(id))
        .collect();
    assert!(!new_ids.is_empty(), "close must write tasks");
    let min_new = new_ids.iter().copied().min().expect("non-empty");
    assert!(
        min_new > max_after_start,
        "task ids of a later commit ({min_new}) must exceed every earlier id ({max_after_start})"
    );

    // All assigned ids are distinct.
    let mut all = after_close.clone();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), after_close.len(), "task ids must never repeat");
}
