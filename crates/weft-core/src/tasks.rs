// Copyright (C) 2025 Weft Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Side-effect tasks.
//!
//! Every mutable-state transition that has an external consequence is
//! represented as a task, persisted atomically with the mutation that caused
//! it. Tasks are grouped into categories; timer-like categories order by fire
//! time, queue-like categories by task id. Task ids come from the shard's
//! monotonic allocator, so equal fire times still have a total order.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::WorkflowKey;
use crate::history::events::TimeoutKind;

/// Task categories. One durable stream per category per shard.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
pub enum TaskCategory {
    /// Immediate dispatch work: matching, parent notification, child start.
    Transfer,
    /// Fire-at-time work: timeouts, user timers, retention deletion.
    Timer,
    /// Visibility index upserts and closes.
    Visibility,
    /// Cross-cluster replication.
    Replication,
    /// History archival after close.
    Archival,
    /// Callbacks and other egress to external destinations.
    Outbound,
}

impl TaskCategory {
    /// Whether this category orders by fire time rather than task id.
    pub fn is_timer_like(&self) -> bool {
        matches!(self, TaskCategory::Timer)
    }
}

/// Position of a task within its category's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    /// When the task becomes runnable. The epoch for queue-like categories.
    pub fire_time: DateTime<Utc>,
    /// Shard-monotonic allocation; breaks fire-time ties.
    pub task_id: i64,
}

impl TaskKey {
    /// Key for a task runnable immediately. Task id assigned at commit.
    pub fn immediate() -> Self {
        Self {
            fire_time: DateTime::<Utc>::UNIX_EPOCH,
            task_id: 0,
        }
    }

    /// Key for a task runnable at `fire_time`. Task id assigned at commit.
    pub fn at(fire_time: DateTime<Utc>) -> Self {
        Self {
            fire_time,
            task_id: 0,
        }
    }

    /// The smallest possible key, for range scans.
    pub fn min() -> Self {
        Self {
            fire_time: DateTime::<Utc>::UNIX_EPOCH,
            task_id: 0,
        }
    }

    /// The largest possible key, for range scans.
    pub fn max() -> Self {
        Self {
            fire_time: DateTime::<Utc>::MAX_UTC,
            task_id: i64::MAX,
        }
    }
}

/// A side-effect task bound to one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Stream position. `task_id` is 0 until the commit path assigns one.
    pub key: TaskKey,
    /// The run this task acts on.
    pub workflow_key: WorkflowKey,
    /// What to do.
    pub attrs: TaskAttributes,
}

impl Task {
    /// Create a task with an unassigned task id.
    pub fn new(key: TaskKey, workflow_key: WorkflowKey, attrs: TaskAttributes) -> Self {
        Self {
            key,
            workflow_key,
            attrs,
        }
    }

    /// The category this task belongs to.
    pub fn category(&self) -> TaskCategory {
        self.attrs.category()
    }
}

/// Typed task payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TaskAttributes {
    /// Transfer: hand a scheduled workflow task to matching.
    DispatchWorkflowTask {
        /// Task queue to dispatch to.
        task_queue: String,
        /// The workflow task's scheduled event.
        scheduled_event_id: i64,
    },
    /// Transfer: hand a scheduled activity to matching.
    DispatchActivityTask {
        /// Task queue to dispatch to.
        task_queue: String,
        /// The activity's scheduled event.
        scheduled_event_id: i64,
    },
    /// Transfer: start an initiated child workflow.
    StartChildExecution {
        /// The child's initiated event.
        initiated_event_id: i64,
        /// Target namespace.
        target_namespace: String,
        /// Target workflow id.
        target_workflow_id: String,
    },
    /// Transfer: deliver a cancel request to an external workflow.
    CancelExternalExecution {
        /// The cancel's initiated event.
        initiated_event_id: i64,
        /// Target namespace.
        target_namespace: String,
        /// Target workflow id.
        target_workflow_id: String,
        /// Target run id, if pinned.
        target_run_id: Option<String>,
    },
    /// Transfer: deliver a signal to an external workflow.
    SignalExternalExecution {
        /// The signal's initiated event.
        initiated_event_id: i64,
        /// Target namespace.
        target_namespace: String,
        /// Target workflow id.
        target_workflow_id: String,
        /// Target run id, if pinned.
        target_run_id: Option<String>,
    },
    /// Transfer: run close bookkeeping, including parent notification.
    CloseExecution {
        /// Whether a parent workflow is waiting on this run.
        notify_parent: bool,
    },

    /// Timer: the workflow run timeout.
    WorkflowRunTimeout,
    /// Timer: backoff before the first workflow task of a delayed start.
    WorkflowBackoff,
    /// Timer: a workflow-task timeout.
    WorkflowTaskTimeout {
        /// The workflow task's scheduled event.
        scheduled_event_id: i64,
        /// Which timeout this is.
        timeout_kind: TimeoutKind,
    },
    /// Timer: an activity timeout.
    ActivityTimeout {
        /// The activity's scheduled event.
        scheduled_event_id: i64,
        /// Which timeout this is.
        timeout_kind: TimeoutKind,
        /// Attempt the timer was armed for.
        attempt: i32,
    },
    /// Timer: a user timer.
    UserTimer {
        /// The timer's started event.
        started_event_id: i64,
        /// The user-visible timer id.
        timer_id: String,
    },
    /// Timer: delete history after the retention period.
    DeleteHistory {
        /// Branch to delete.
        branch_token: Vec<u8>,
    },

    /// Visibility: index a newly started run.
    StartExecutionVisibility,
    /// Visibility: re-index after a search-attribute upsert.
    UpsertExecutionVisibility,
    /// Visibility: index the close.
    CloseExecutionVisibility,

    /// Archival: archive history after close.
    ArchiveExecution,
}

impl TaskAttributes {
    /// The category a task with these attributes belongs to.
    pub fn category(&self) -> TaskCategory {
        match self {
            Self::DispatchWorkflowTask { .. }
            | Self::DispatchActivityTask { .. }
            | Self::StartChildExecution { .. }
            | Self::CancelExternalExecution { .. }
            | Self::SignalExternalExecution { .. }
            | Self::CloseExecution { .. } => TaskCategory::Transfer,

            Self::WorkflowRunTimeout
            | Self::WorkflowBackoff
            | Self::WorkflowTaskTimeout { .. }
            | Self::ActivityTimeout { .. }
            | Self::UserTimer { .. }
            | Self::DeleteHistory { .. } => TaskCategory::Timer,

            Self::StartExecutionVisibility
            | Self::UpsertExecutionVisibility
            | Self::CloseExecutionVisibility => TaskCategory::Visibility,

            Self::ArchiveExecution => TaskCategory::Archival,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> WorkflowKey {
        WorkflowKey::new("ns", "wf", "run")
    }

    #[test]
    fn test_task_key_total_order() {
        let earlier = TaskKey {
            fire_time: Utc.timestamp_opt(100, 0).unwrap(),
            task_id: 9,
        };
        let later = TaskKey {
            fire_time: Utc.timestamp_opt(200, 0).unwrap(),
            task_id: 1,
        };
        assert!(earlier < later);

        let tie_low = TaskKey {
            fire_time: Utc.timestamp_opt(100, 0).unwrap(),
            task_id: 1,
        };
        let tie_high = TaskKey {
            fire_time: Utc.timestamp_opt(100, 0).unwrap(),
            task_id: 2,
        };
        assert!(tie_low < tie_high, "task id breaks fire-time ties");
    }

    #[test]
    fn test_categories_are_exhaustive_over_attrs() {
        let transfer = Task::new(
            TaskKey::immediate(),
            key(),
            TaskAttributes::DispatchWorkflowTask {
                task_queue: "q".into(),
                scheduled_event_id: 2,
            },
        );
        assert_eq!(transfer.category(), TaskCategory::Transfer);

        let timer = Task::new(
            TaskKey::at(Utc::now()),
            key(),
            TaskAttributes::UserTimer {
                started_event_id: 5,
                timer_id: "t1".into(),
            },
        );
        assert_eq!(timer.category(), TaskCategory::Timer);
        assert!(timer.category().is_timer_like());

        let visibility = Task::new(
            TaskKey::immediate(),
            key(),
            TaskAttributes::CloseExecutionVisibility,
        );
        assert_eq!(visibility.category(), TaskCategory::Visibility);
    }

    #[test]
    fn test_task_round_trip() {
        let task = Task::new(
            TaskKey::at(Utc.timestamp_opt(1_700_000_000, 0).unwrap()),
            key(),
            TaskAttributes::ActivityTimeout {
                scheduled_event_id: 7,
                timeout_kind: TimeoutKind::StartToClose,
                attempt: 2,
            },
        );
        let blob = crate::codec::DataBlob::encode(&task).expect("encode");
        let back: Task = blob.decode().expect("decode");
        assert_eq!(back, task);
    }
}
