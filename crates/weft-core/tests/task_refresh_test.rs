// Copyright (C) 2025 Weft Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests for task refresh idempotence.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::TestContext;
use weft_core::history::EventsCache;
use weft_core::persistence::ExecutionStore;
use weft_core::state::mutable_state::MutableState;
use weft_core::state::{TaskRefresher, TIMER_TASK_STATUS_NONE};
use weft_core::tasks::{Task, TaskAttributes, TaskCategory};
use weft_core::workflow::{bypass_mutable_state_consistency, LockPriority};

/// Multiset fingerprint of a task set, ignoring task ids (which are
/// allocated fresh on every commit).
fn task_fingerprint(tasks: &std::collections::HashMap<TaskCategory, Vec<Task>>) -> Vec<String> {
    let mut entries: Vec<String> = tasks
        .iter()
        .flat_map(|(category, tasks)| {
            tasks.iter().map(move |task| {
                format!(
                    "{}|{}|{}",
                    category,
                    task.key.fire_time.to_rfc3339(),
                    serde_json::to_string(&task.attrs).expect("serializable attrs"),
                )
            })
        })
        .collect();
    entries.sort();
    entries
}

#[tokio::test]
async fn test_refresh_is_idempotent_over_activities_and_timers() {
    let ctx = TestContext::new().await;
    let key = ctx.start_workflow("wf-refresh").await;
    let completed_id = ctx.complete_pending_workflow_task(&key).await;

    // Three activities (one of them started) and two user timers,
    // committed so the scheduled events are readable.
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
        .with_mutable_state(|ms| -> weft_core::error::Result<()> {
            let mut scheduled_ids = Vec::new();
            for i in 0..3 {
                let (event, _info) = ms.add_activity_task_scheduled_event(
                    completed_id,
                    format!("activity-{i}"),
                    "charge-card",
                    "default",
                    None,
                    Some(Duration::from_secs(300)),
                    Some(Duration::from_secs(30)),
                    Some(Duration::from_secs(60)),
                    None,
                )?;
                scheduled_ids.push(event.event_id);
            }
            ms.add_activity_task_started_event(scheduled_ids[0], "worker-1")?;
            ms.add_timer_started_event(completed_id, "timer-a", Duration::from_secs(120))?;
            ms.add_timer_started_event(completed_id, "timer-b", Duration::from_secs(240))?;
            Ok(())
        })
        .expect("state")
        .expect("build scenario");
    locked
        .update_workflow_execution(&ctx.cancel)
        .await
        .expect("commit scenario");

    // Refresh twice against a detached copy of the state.
    let mut state: MutableState = locked
        .with_mutable_state(|ms| ms.clone())
        .expect("clone state");
    drop(locked);

    let execution_store: Arc<dyn ExecutionStore> = ctx.store.clone();
    let events_cache = Arc::new(EventsCache::new(1, 1024, execution_store));
    let refresher = TaskRefresher::new(events_cache, Duration::from_secs(3600));

    refresher
        .refresh_tasks(&ctx.cancel, &mut state)
        .await
        .expect("first refresh");
    let first = task_fingerprint(state.transaction_tasks());

    refresher
        .refresh_tasks(&ctx.cancel, &mut state)
        .await
        .expect("second refresh");
    let second = task_fingerprint(state.transaction_tasks());

    assert_eq!(first, second, "refresh must be idempotent");

    // Spot-check the regenerated set: dispatches for the two unstarted
    // activities, one user-timer task (the earliest), the run timeout, and
    // the visibility record.
    let tasks = state.transaction_tasks();
    let transfer_dispatches = tasks
        .get(&TaskCategory::Transfer)
        .map(|tasks| {
            tasks
                .iter()
                .filter(|t| matches!(t.attrs, TaskAttributes::DispatchActivityTask { .. }))
                .count()
        })
        .unwrap_or(0);
    assert_eq!(transfer_dispatches, 2);

    let timer_tasks = tasks.get(&TaskCategory::Timer).expect("timer tasks");
    let user_timers = timer_tasks
        .iter()
        .filter(|t| matches!(t.attrs, TaskAttributes::UserTimer { .. }))
        .count();
    assert_eq!(user_timers, 1, "only the earliest user timer gets a task");
    assert!(timer_tasks
        .iter()
        .any(|t| matches!(t.attrs, TaskAttributes::WorkflowRunTimeout)));
    assert!(tasks
        .get(&TaskCategory::Visibility)
        .expect("visibility")
        .iter()
        .any(|t| matches!(t.attrs, TaskAttributes::StartExecutionVisibility)));
}

#[tokio::test]
async fn test_refresh_zeroes_and_rebuilds_timer_masks() {
    let ctx = TestContext::new().await;
    let key = ctx.start_workflow("wf-refresh-mask").await;
    let completed_id = ctx.complete_pending_workflow_task(&key).await;

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
        .with_mutable_state(|ms| -> weft_core::error::Result<()> {
            ms.add_activity_task_scheduled_event(
                completed_id,
                "only-activity",
                "send-email",
                "default",
                None,
                None,
                Some(Duration::from_secs(30)),
                Some(Duration::from_secs(60)),
                None,
            )?;
            Ok(())
        })
        .expect("state")
        .expect("schedule");
    locked
        .update_workflow_execution(&ctx.cancel)
        .await
        .expect("commit");

    let mut state = locked.with_mutable_state(|ms| ms.clone()).expect("clone");
    drop(locked);

    // The schedule path armed a timer bit.
    let armed: Vec<u32> = state
        .pending_activity_infos()
        .values()
        .map(|a| a.timer_task_status)
        .collect();
    assert!(armed.iter().any(|&bits| bits != TIMER_TASK_STATUS_NONE));

    let execution_store: Arc<dyn ExecutionStore> = ctx.store.clone();
    let refresher = TaskRefresher::new(
        Arc::new(EventsCache::new(1, 1024, execution_store)),
        Duration::from_secs(3600),
    );
    refresher
        .refresh_tasks(&ctx.cancel, &mut state)
        .await
        .expect("refresh");

    // After refresh the earliest timer is re-armed; exactly one activity
    // timeout task exists.
    let timer_tasks = state
        .transaction_tasks()
        .get(&TaskCategory::Timer)
        .expect("timers");
    let activity_timeouts = timer_tasks
        .iter()
        .filter(|t| matches!(t.attrs, TaskAttributes::ActivityTimeout { .. }))
        .count();
    assert_eq!(activity_timeouts, 1);
}
