// Copyright (C) 2025 Weft Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-run workflow lock with two priorities.
//!
//! High-priority acquirers (user-facing calls: update, signal) go straight
//! for the lock. Low-priority acquirers (background sweeps, replication)
//! first defer while any high-priority waiter is pending, so a burst of user
//! traffic starves background work rather than the reverse. The deference is
//! bounded: after the configured wait a low-priority acquirer stops yielding
//! and contends normally, which caps the priority inversion it can suffer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::error::{CoreError, Result};

/// Acquisition priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPriority {
    /// User-facing latency-sensitive paths.
    High,
    /// Background work that can wait.
    Low,
}

/// A held workflow lock. Dropping releases it.
#[derive(Debug)]
pub struct WorkflowGuard {
    _guard: OwnedMutexGuard<()>,
}

/// Two-priority async lock for one workflow run.
pub struct WorkflowLock {
    inner: Arc<Mutex<()>>,
    high_waiters: Arc<AtomicUsize>,
    high_drained: Arc<Notify>,
    low_defer: Duration,
}

impl WorkflowLock {
    /// Create an unlocked lock; `low_defer` bounds how long Low yields to
    /// pending High waiters.
    pub fn new(low_defer: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(())),
            high_waiters: Arc::new(AtomicUsize::new(0)),
            high_drained: Arc::new(Notify::new()),
            low_defer,
        }
    }

    /// Acquire the lock at `priority`, aborting when `cancel` fires first.
    pub async fn acquire(
        &self,
        priority: LockPriority,
        cancel: &CancellationToken,
    ) -> Result<WorkflowGuard> {
        match priority {
            LockPriority::High => self.acquire_high(cancel).await,
            LockPriority::Low => self.acquire_low(cancel).await,
        }
    }

    async fn acquire_high(&self, cancel: &CancellationToken) -> Result<WorkflowGuard> {
        self.high_waiters.fetch_add(1, Ordering::AcqRel);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CoreError::Canceled),
            guard = self.inner.clone().lock_owned() => Ok(WorkflowGuard { _guard: guard }),
        };
        if self.high_waiters.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.high_drained.notify_waiters();
        }
        result
    }

    async fn acquire_low(&self, cancel: &CancellationToken) -> Result<WorkflowGuard> {
        // Defer to pending high-priority waiters, up to the bound.
        let deadline = tokio::time::Instant::now() + self.low_defer;
        while self.high_waiters.load(Ordering::Acquire) > 0 {
            let drained = self.high_drained.notified();
            // Re-check after registering for the notification; the last
            // high waiter may have drained in between.
            if self.high_waiters.load(Ordering::Acquire) == 0 {
                break;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CoreError::Canceled),
                _ = tokio::time::sleep_until(deadline) => break,
                _ = drained => {}
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CoreError::Canceled),
            guard = self.inner.clone().lock_owned() => Ok(WorkflowGuard { _guard: guard }),
        }
    }

    /// Whether the lock is currently held.
    pub fn is_locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exclusive_within_priority() {
        let lock = WorkflowLock::new(Duration::from_millis(100));
        let cancel = CancellationToken::new();

        let guard = lock.acquire(LockPriority::High, &cancel).await.unwrap();
        assert!(lock.is_locked());
        drop(guard);
        assert!(!lock.is_locked());
    }

    #[tokio::test]
    async fn test_cancelled_acquire_returns_canceled() {
        let lock = WorkflowLock::new(Duration::from_millis(100));
        let cancel = CancellationToken::new();
        let _held = lock.acquire(LockPriority::High, &cancel).await.unwrap();

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let err = lock
            .acquire(LockPriority::High, &cancelled)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "CANCELED");

        let err = lock
            .acquire(LockPriority::Low, &cancelled)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "CANCELED");
    }

    #[tokio::test]
    async fn test_low_defers_to_high_waiter() {
        let lock = Arc::new(WorkflowLock::new(Duration::from_secs(5)));
        let cancel = CancellationToken::new();
        let held = lock.acquire(LockPriority::High, &cancel).await.unwrap();

        // A high waiter queues up behind the held lock.
        let high = {
            let lock = lock.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { lock.acquire(LockPriority::High, &cancel).await })
        };
        tokio::task::yield_now().await;

        // A low acquirer arrives after; on release the high waiter wins.
        let low = {
            let lock = lock.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let guard = lock.acquire(LockPriority::Low, &cancel).await;
                (std::time::Instant::now(), guard)
            })
        };
        tokio::task::yield_now().await;

        let released_at = std::time::Instant::now();
        drop(held);

        let high_guard = high.await.expect("join").expect("high acquires");
        drop(high_guard);
        let (low_at, low_guard) = low.await.expect("join");
        low_guard.expect("low acquires eventually");
        assert!(low_at >= released_at);
    }

    #[tokio::test]
    async fn test_low_wait_is_bounded() {
        let lock = Arc::new(WorkflowLock::new(Duration::from_millis(20)));
        let cancel = CancellationToken::new();
        let held = lock.acquire(LockPriority::High, &cancel).await.unwrap();

        // High waiter parked behind the held lock; low must stop deferring
        // to it after the bound. It releases as soon as it acquires.
        let _high = {
            let lock = lock.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let guard = lock.acquire(LockPriority::High, &cancel).await;
                drop(guard);
            })
        };
        tokio::task::yield_now().await;

        let low = {
            let lock = lock.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { lock.acquire(LockPriority::Low, &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);
        // Either high or low wins the race for the released lock; the point
        // is that low is no longer parked behind the high waiter forever.
        let _ = tokio::time::timeout(Duration::from_secs(1), low)
            .await
            .expect("low acquisition must not hang");
    }
}
