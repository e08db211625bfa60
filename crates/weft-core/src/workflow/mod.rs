// Copyright (C) 2025 Weft Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow context: per-run locking, caching, loading, and committing.

pub mod cache;
pub mod consistency;
pub mod context;
pub mod lock;

pub use cache::WorkflowContextCache;
pub use consistency::{
    bypass_mutable_state_consistency, WorkflowConsistencyChecker,
};
pub use context::{LockedWorkflowContext, WorkflowContext};
pub use lock::{LockPriority, WorkflowGuard, WorkflowLock};
