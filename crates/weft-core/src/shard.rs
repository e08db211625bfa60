// Copyright (C) 2025 Weft Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shard context.
//!
//! A shard is a partition of workflow ownership with exactly one writer at a
//! time. Ownership is a lease identified by a monotonically increasing range
//! id: every write carries the last observed range id, and the store rejects
//! writes whose range id is stale. Losing the lease cancels the shard's
//! lifecycle token, which aborts every in-flight operation on the shard.
//!
//! Task ids are allocated in blocks derived from the range id
//! (`range_id * block_size + offset`), so ids are strictly increasing within
//! a shard even across ownership transfers.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::DataBlob;
use crate::config::CoreConfig;
use crate::error::{CoreError, Result};
use crate::persistence::{ShardRecord, ShardStore, UpdateShardRequest};

/// Logical clock attached to outbound RPCs so downstream services can detect
/// stale shard routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    /// The shard that produced the clock.
    pub shard_id: i32,
    /// Monotonic per-shard counter.
    pub clock: i64,
}

struct TaskIdBlock {
    next: i64,
    ceiling: i64,
}

impl TaskIdBlock {
    fn empty() -> Self {
        Self {
            next: 0,
            ceiling: 0,
        }
    }

    fn remaining(&self) -> i64 {
        self.ceiling - self.next
    }
}

/// Per-shard ownership, clocks, and task id allocation.
pub struct ShardContext {
    shard_id: i32,
    owner: String,
    store: Arc<dyn ShardStore>,
    block_size: i64,
    range_id: AtomicI64,
    clock: AtomicI64,
    task_ids: Mutex<TaskIdBlock>,
    lifecycle: CancellationToken,
}

impl ShardContext {
    /// Acquire the shard: load or create its record, then renew the lease so
    /// this process becomes the sole writer.
    pub async fn acquire(
        store: Arc<dyn ShardStore>,
        shard_id: i32,
        owner: impl Into<String>,
        config: &CoreConfig,
    ) -> Result<Arc<Self>> {
        let owner = owner.into();
        let cancel = CancellationToken::new();

        // Two-step get/create: no callbacks cross the store boundary.
        let record = match store.get_shard(&cancel, shard_id).await {
            Ok(record) => record,
            Err(CoreError::ShardNotFound { .. }) => {
                let record = ShardRecord {
                    shard_id,
                    range_id: 0,
                    owner: owner.clone(),
                    info: DataBlob::encode(&serde_json::json!({}))?,
                };
                store.create_shard(&cancel, record.clone()).await?;
                record
            }
            Err(err) => return Err(err),
        };

        let context = Arc::new(Self {
            shard_id,
            owner,
            store,
            block_size: config.task_id_block_size,
            range_id: AtomicI64::new(record.range_id),
            clock: AtomicI64::new(0),
            task_ids: Mutex::new(TaskIdBlock::empty()),
            lifecycle: cancel,
        });
        context.renew_range_lease().await?;
        info!(
            shard_id,
            range_id = context.range_id(),
            "shard acquired"
        );
        Ok(context)
    }

    /// The shard this context owns.
    pub fn shard_id(&self) -> i32 {
        self.shard_id
    }

    /// The range id of the currently held lease.
    pub fn range_id(&self) -> i64 {
        self.range_id.load(Ordering::Acquire)
    }

    /// Child token cancelled when the shard unloads.
    pub fn lifecycle(&self) -> CancellationToken {
        self.lifecycle.child_token()
    }

    /// Whether the shard has been unloaded.
    pub fn is_unloaded(&self) -> bool {
        self.lifecycle.is_cancelled()
    }

    /// Produce the next vector clock for an outbound RPC.
    pub fn new_vector_clock(&self) -> VectorClock {
        VectorClock {
            shard_id: self.shard_id,
            clock: self.clock.fetch_add(1, Ordering::AcqRel),
        }
    }

    /// Renew the lease: bump the range id by one, conditionally on the
    /// previous value. A mismatch means another process took the shard; this
    /// context unloads and surrenders.
    pub async fn renew_range_lease(&self) -> Result<i64> {
        if self.is_unloaded() {
            return Err(CoreError::Canceled);
        }
        let previous = self.range_id();
        let next = previous + 1;
        let result = self
            .store
            .update_shard(
                &self.lifecycle,
                UpdateShardRequest {
                    shard_id: self.shard_id,
                    range_id: next,
                    owner: self.owner.clone(),
                    info: DataBlob::encode(&serde_json::json!({}))?,
                    previous_range_id: previous,
                },
            )
            .await;
        match result {
            Ok(()) => {
                self.range_id.store(next, Ordering::Release);
                debug!(shard_id = self.shard_id, range_id = next, "range lease renewed");
                Ok(next)
            }
            Err(err @ CoreError::ShardOwnershipLost { .. }) => {
                warn!(
                    shard_id = self.shard_id,
                    "range lease renewal lost; unloading shard"
                );
                self.unload();
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Hand out `count` strictly increasing task ids, renewing the lease to
    /// reserve a fresh block when the current one runs out.
    pub async fn generate_task_ids(&self, count: usize) -> Result<Vec<i64>> {
        if self.is_unloaded() {
            return Err(CoreError::Canceled);
        }
        let count = count as i64;
        if count > self.block_size {
            return Err(CoreError::internal(format!(
                "requested {} task ids, block size is {}",
                count, self.block_size
            )));
        }

        let mut block = self.task_ids.lock().await;
        if block.remaining() < count {
            let range_id = self.renew_range_lease().await?;
            block.next = range_id * self.block_size;
            block.ceiling = (range_id + 1) * self.block_size;
        }
        let ids: Vec<i64> = (block.next..block.next + count).collect();
        block.next += count;
        Ok(ids)
    }

    /// Unload the shard: cancel the lifecycle token so every in-flight
    /// operation holding this shard observes cancellation and aborts.
    pub fn unload(&self) {
        if !self.lifecycle.is_cancelled() {
            info!(shard_id = self.shard_id, "shard unloading");
            self.lifecycle.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;

    async fn acquire(store: Arc<MemoryStore>, shard_id: i32) -> Arc<ShardContext> {
        ShardContext::acquire(store, shard_id, "host-test", &CoreConfig::default())
            .await
            .expect("acquire shard")
    }

    #[tokio::test]
    async fn test_acquire_creates_and_leases() {
        let store = Arc::new(MemoryStore::new());
        let shard = acquire(store.clone(), 1).await;
        // Created at 0, renewed once on acquire.
        assert_eq!(shard.range_id(), 1);
        assert!(!shard.is_unloaded());
    }

    #[tokio::test]
    async fn test_task_ids_strictly_increase_across_blocks() {
        let store = Arc::new(MemoryStore::new());
        let shard = acquire(store, 1).await;

        let mut all: Vec<i64> = Vec::new();
        for _ in 0..5 {
            all.extend(shard.generate_task_ids(60).await.expect("ids"));
        }
        for window in all.windows(2) {
            assert!(window[0] < window[1], "ids must strictly increase");
        }
    }

    #[tokio::test]
    async fn test_second_owner_steals_lease() {
        let store = Arc::new(MemoryStore::new());
        let first = acquire(store.clone(), 7).await;
        let second = acquire(store.clone(), 7).await;
        assert!(second.range_id() > first.range_id());

        // The first owner's next renewal must fail and unload it.
        let err = first.renew_range_lease().await.unwrap_err();
        assert_eq!(err.error_code(), "SHARD_OWNERSHIP_LOST");
        assert!(first.is_unloaded());
        assert!(!second.is_unloaded());
    }

    #[tokio::test]
    async fn test_vector_clock_is_monotonic() {
        let store = Arc::new(MemoryStore::new());
        let shard = acquire(store, 2).await;
        let a = shard.new_vector_clock();
        let b = shard.new_vector_clock();
        assert_eq!(a.shard_id, 2);
        assert!(b.clock > a.clock);
    }

    #[tokio::test]
    async fn test_unloaded_shard_refuses_work() {
        let store = Arc::new(MemoryStore::new());
        let shard = acquire(store, 3).await;
        shard.unload();
        let err = shard.generate_task_ids(1).await.unwrap_err();
        assert_eq!(err.error_code(), "CANCELED");
    }
}
