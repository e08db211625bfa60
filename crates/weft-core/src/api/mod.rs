// Copyright (C) 2025 Weft Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Invocation paths: the orchestration of locks, mutable state, stores, and
//! outbound clients behind each inbound operation.

pub mod start_workflow;
pub mod update_workflow;

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::CoreConfig;
use crate::error::Result;

/// Run `operation`, retrying the retryable error kinds with exponential
/// backoff and jitter, bounded by the configured attempt count.
///
/// `ConditionFailed` retries rely on the failed attempt having dropped the
/// cached mutable state, so the next attempt reloads before reapplying.
pub async fn retry_transient<T, F, Fut>(
    config: &CoreConfig,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < config.max_operation_retries => {
                attempt += 1;
                let backoff = backoff_with_jitter(config.retry_base_backoff, attempt);
                debug!(
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "retrying transient failure"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(crate::error::CoreError::Canceled),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            Err(err) => return Err(err),
        }
    }
}

/// Exponential backoff doubled per attempt, with up to half the interval of
/// random jitter so synchronized retries spread out.
fn backoff_with_jitter(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(16).saturating_sub(1));
    let jitter_range = (exp.as_millis() as u64 / 2).max(1);
    let jitter = uuid::Uuid::new_v4().as_u128() as u64 % jitter_range;
    exp + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_bounded_then_surfaces_error() {
        let config = CoreConfig {
            max_operation_retries: 2,
            retry_base_backoff: Duration::from_millis(1),
            ..CoreConfig::default()
        };
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let err = retry_transient(&config, &cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<(), _>(CoreError::Unavailable {
                    message: "flaky".to_string(),
                })
            }
        })
        .await
        .unwrap_err();

        assert_eq!(err.error_code(), "UNAVAILABLE");
        assert_eq!(calls.load(Ordering::SeqCst), 3, "initial try + 2 retries");
    }

    #[tokio::test]
    async fn test_non_retryable_error_is_not_retried() {
        let config = CoreConfig::default();
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let err = retry_transient(&config, &cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(CoreError::WorkflowCompleted) }
        })
        .await
        .unwrap_err();

        assert_eq!(err.error_code(), "WORKFLOW_COMPLETED");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let config = CoreConfig::default();
        let cancel = CancellationToken::new();
        let value = retry_transient(&config, &cancel, || async { Ok::<_, CoreError>(41 + 1) })
            .await
            .unwrap();
        assert_eq!(value, 42);
    }
}
