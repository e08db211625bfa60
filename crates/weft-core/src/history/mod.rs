// Copyright (C) 2025 Weft Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! History model: events, branches, and the per-shard events cache.
//!
//! Workflow history is an append-only tree of event batches. A run writes to
//! exactly one branch at a time; reset and continue-as-new fork new branches
//! that share ancestor ranges with the branch they came from.

pub mod branch;
pub mod events;
pub mod events_cache;

pub use branch::{BranchInfo, BranchRange};
pub use events::{EventAttributes, EventKind, HistoryEvent};
pub use events_cache::{EventKey, EventsCache};
