// Copyright (C) 2025 Weft Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow consistency checker.
//!
//! The one way into a workflow's mutable state: acquire the run's lock at
//! the requested priority, load state through the cache, and verify the
//! caller's consistency predicate. A predicate rejection means the cached
//! copy may be stale; the checker drops it and reloads once from the store
//! before giving up.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::persistence::ExecutionStore;
use crate::shard::ShardContext;
use crate::state::mutable_state::MutableState;
use crate::workflow::cache::WorkflowContextCache;
use crate::workflow::context::LockedWorkflowContext;
use crate::workflow::lock::LockPriority;
use crate::WorkflowKey;

/// Predicate deciding whether a cached mutable state is consistent enough
/// for the caller.
pub type ConsistencyPredicate = fn(&MutableState) -> bool;

/// Predicate that accepts any loaded state. Callers that re-validate under
/// the lock (the update path) use this to skip a reload.
pub fn bypass_mutable_state_consistency(_state: &MutableState) -> bool {
    true
}

/// Acquires locked workflow contexts with consistency checking.
pub struct WorkflowConsistencyChecker {
    shard: Arc<ShardContext>,
    store: Arc<dyn ExecutionStore>,
    cache: Arc<WorkflowContextCache>,
}

impl WorkflowConsistencyChecker {
    /// Create a checker for one shard.
    pub fn new(
        shard: Arc<ShardContext>,
        store: Arc<dyn ExecutionStore>,
        cache: Arc<WorkflowContextCache>,
    ) -> Self {
        Self {
            shard,
            store,
            cache,
        }
    }

    /// The shard this checker serves.
    pub fn shard(&self) -> Arc<ShardContext> {
        self.shard.clone()
    }

    /// The execution store this checker reads through.
    pub fn store(&self) -> Arc<dyn ExecutionStore> {
        self.store.clone()
    }

    /// The context cache.
    pub fn cache(&self) -> Arc<WorkflowContextCache> {
        self.cache.clone()
    }

    /// Acquire the workflow context for `key` under its lock, with state
    /// loaded and `predicate`-consistent.
    pub async fn workflow_context(
        &self,
        cancel: &CancellationToken,
        predicate: ConsistencyPredicate,
        key: &WorkflowKey,
        priority: LockPriority,
    ) -> Result<LockedWorkflowContext> {
        if key.run_id.is_empty() {
            return Err(CoreError::WorkflowExecutionNotFound {
                workflow_id: key.workflow_id.clone(),
                run_id: None,
            });
        }

        let context = self.cache.get_or_create(key);
        let locked = context
            .lock_context(priority, cancel, self.shard.clone(), self.store.clone())
            .await?;

        locked.load_mutable_state(cancel).await?;
        let consistent = locked.with_mutable_state(|ms| predicate(ms))?;
        if !consistent {
            debug!(workflow_key = %key, "cached state rejected by predicate; reloading");
            locked.clear_cached_state();
            locked.load_mutable_state(cancel).await?;
            let consistent = locked.with_mutable_state(|ms| predicate(ms))?;
            if !consistent {
                return Err(CoreError::Unavailable {
                    message: "mutable state failed consistency predicate after reload".to_string(),
                });
            }
        }
        Ok(locked)
    }
}
