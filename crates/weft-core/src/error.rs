// Copyright (C) 2025 Weft Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for weft-core.
//!
//! One taxonomy for the whole engine: stores, mutable state, and the
//! invocation layer all speak `CoreError`. The invocation layer retries only
//! the variants [`CoreError::is_retryable`] admits; everything else
//! propagates to the caller untouched.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while operating on shards, workflows, and stores.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// The shard's range id no longer matches the store's. The holder must
    /// release the shard; retrying on the same node is pointless.
    ShardOwnershipLost {
        /// The shard whose lease was lost.
        shard_id: i32,
        /// The range id the caller presented.
        request_range_id: i64,
        /// The range id the store currently holds, when known.
        current_range_id: Option<i64>,
    },

    /// The shard record does not exist yet. Callers construct one and call
    /// `create_shard` themselves.
    ShardNotFound {
        /// The shard that was not found.
        shard_id: i32,
    },

    /// The mutable-state `db_record_version` condition failed. Reload the
    /// state, reapply, and retry a bounded number of times.
    ConditionFailed {
        /// The condition the caller asserted.
        expected: i64,
        /// The version the store holds.
        actual: i64,
    },

    /// The current-execution precondition failed (e.g. a different run is
    /// current). A business-level conflict surfaced to the caller.
    CurrentWorkflowConditionFailed {
        /// Human-readable description of the violated precondition.
        message: String,
    },

    /// The workflow is already in a terminal state.
    WorkflowCompleted,

    /// The workflow run does not exist, or a pinned first-execution run id
    /// did not match.
    WorkflowExecutionNotFound {
        /// The workflow id looked up.
        workflow_id: String,
        /// The run id looked up, if one was pinned.
        run_id: Option<String>,
    },

    /// The namespace is not registered.
    NamespaceNotFound {
        /// The namespace id or name that was not found.
        namespace: String,
    },

    /// A speculative workflow task could not be kept speculative. Internal
    /// inconsistency of the update fast path.
    WorkflowTaskStateInconsistent {
        /// What the path observed.
        message: String,
    },

    /// The backend is throttling. Retry with backoff and jitter.
    ResourceExhausted {
        /// Backend-provided detail.
        message: String,
    },

    /// Transient transport failure. Retry.
    Unavailable {
        /// Transport-provided detail.
        message: String,
    },

    /// The caller's deadline expired. Not retried.
    DeadlineExceeded,

    /// The requested option is not supported.
    Unimplemented {
        /// The unsupported option.
        feature: String,
    },

    /// A blob failed to encode or decode.
    Serialization {
        /// What was being (de)serialized.
        context: String,
        /// Decoder/encoder detail.
        details: String,
    },

    /// An engine invariant was violated. Surface and alert; never retry.
    Internal {
        /// Description of the violated invariant.
        message: String,
    },

    /// The operation was cancelled upstream.
    Canceled,
}

impl CoreError {
    /// Stable code string for logs and RPC mapping.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ShardOwnershipLost { .. } => "SHARD_OWNERSHIP_LOST",
            Self::ShardNotFound { .. } => "SHARD_NOT_FOUND",
            Self::ConditionFailed { .. } => "CONDITION_FAILED",
            Self::CurrentWorkflowConditionFailed { .. } => "CURRENT_WORKFLOW_CONDITION_FAILED",
            Self::WorkflowCompleted => "WORKFLOW_COMPLETED",
            Self::WorkflowExecutionNotFound { .. } => "WORKFLOW_EXECUTION_NOT_FOUND",
            Self::NamespaceNotFound { .. } => "NAMESPACE_NOT_FOUND",
            Self::WorkflowTaskStateInconsistent { .. } => "WORKFLOW_TASK_STATE_INCONSISTENT",
            Self::ResourceExhausted { .. } => "RESOURCE_EXHAUSTED",
            Self::Unavailable { .. } => "UNAVAILABLE",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::Unimplemented { .. } => "UNIMPLEMENTED",
            Self::Serialization { .. } => "SERIALIZATION_ERROR",
            Self::Internal { .. } => "INTERNAL",
            Self::Canceled => "CANCELED",
        }
    }

    /// Whether the invocation layer may retry this error.
    ///
    /// `ConditionFailed` requires reloading mutable state before the retry;
    /// the other two are plain backoff retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhausted { .. } | Self::Unavailable { .. } | Self::ConditionFailed { .. }
        )
    }

    /// Shorthand for an [`CoreError::Internal`] invariant violation.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShardOwnershipLost {
                shard_id,
                request_range_id,
                current_range_id,
            } => match current_range_id {
                Some(current) => write!(
                    f,
                    "shard {} ownership lost: request range id {} but store holds {}",
                    shard_id, request_range_id, current
                ),
                None => write!(
                    f,
                    "shard {} ownership lost at range id {}",
                    shard_id, request_range_id
                ),
            },
            Self::ShardNotFound { shard_id } => write!(f, "shard {} not found", shard_id),
            Self::ConditionFailed { expected, actual } => write!(
                f,
                "record version condition failed: expected {}, store holds {}",
                expected, actual
            ),
            Self::CurrentWorkflowConditionFailed { message } => {
                write!(f, "current workflow condition failed: {}", message)
            }
            Self::WorkflowCompleted => write!(f, "workflow execution already completed"),
            Self::WorkflowExecutionNotFound {
                workflow_id,
                run_id,
            } => match run_id {
                Some(run_id) => write!(
                    f,
                    "workflow execution not found: workflow '{}' run '{}'",
                    workflow_id, run_id
                ),
                None => write!(f, "workflow execution not found: workflow '{}'", workflow_id),
            },
            Self::NamespaceNotFound { namespace } => {
                write!(f, "namespace '{}' not found", namespace)
            }
            Self::WorkflowTaskStateInconsistent { message } => {
                write!(f, "workflow task state inconsistent: {}", message)
            }
            Self::ResourceExhausted { message } => write!(f, "resource exhausted: {}", message),
            Self::Unavailable { message } => write!(f, "unavailable: {}", message),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
            Self::Unimplemented { feature } => write!(f, "{} is not implemented", feature),
            Self::Serialization { context, details } => {
                write!(f, "serialization error in {}: {}", context, details)
            }
            Self::Internal { message } => write!(f, "internal error: {}", message),
            Self::Canceled => write!(f, "operation canceled"),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => CoreError::ResourceExhausted {
                message: "connection pool exhausted".to_string(),
            },
            sqlx::Error::Io(e) => CoreError::Unavailable {
                message: e.to_string(),
            },
            other => CoreError::Unavailable {
                message: other.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization {
            context: "json".to_string(),
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let cases: Vec<(CoreError, &str)> = vec![
            (
                CoreError::ShardOwnershipLost {
                    shard_id: 3,
                    request_range_id: 7,
                    current_range_id: Some(8),
                },
                "SHARD_OWNERSHIP_LOST",
            ),
            (
                CoreError::ConditionFailed {
                    expected: 4,
                    actual: 5,
                },
                "CONDITION_FAILED",
            ),
            (CoreError::WorkflowCompleted, "WORKFLOW_COMPLETED"),
            (CoreError::DeadlineExceeded, "DEADLINE_EXCEEDED"),
            (CoreError::Canceled, "CANCELED"),
            (
                CoreError::Unimplemented {
                    feature: "wait stage".to_string(),
                },
                "UNIMPLEMENTED",
            ),
        ];
        for (err, code) in cases {
            assert_eq!(err.error_code(), code, "wrong code for {:?}", err);
            assert!(!err.to_string().is_empty());
        }
    }

    #[test]
    fn test_retryable_set_is_exactly_three_variants() {
        assert!(CoreError::ResourceExhausted {
            message: "x".into()
        }
        .is_retryable());
        assert!(CoreError::Unavailable {
            message: "x".into()
        }
        .is_retryable());
        assert!(CoreError::ConditionFailed {
            expected: 1,
            actual: 2
        }
        .is_retryable());

        assert!(!CoreError::ShardOwnershipLost {
            shard_id: 1,
            request_range_id: 1,
            current_range_id: None
        }
        .is_retryable());
        assert!(!CoreError::WorkflowCompleted.is_retryable());
        assert!(!CoreError::DeadlineExceeded.is_retryable());
        assert!(!CoreError::Canceled.is_retryable());
        assert!(!CoreError::internal("boom").is_retryable());
    }

    #[test]
    fn test_display_carries_ids() {
        let err = CoreError::ShardOwnershipLost {
            shard_id: 11,
            request_range_id: 41,
            current_range_id: Some(42),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("11"));
        assert!(rendered.contains("41"));
        assert!(rendered.contains("42"));

        let err = CoreError::WorkflowExecutionNotFound {
            workflow_id: "wf-1".to_string(),
            run_id: None,
        };
        assert_eq!(
            err.to_string(),
            "workflow execution not found: workflow 'wf-1'"
        );
    }
}
