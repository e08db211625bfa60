// Copyright (C) 2025 Weft Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-shard cache of history events.
//!
//! The refresher and the workflow context need individual scheduled events
//! (an activity's scheduled event, a child's initiated event) long after the
//! batch that carried them was written. This cache keeps recently touched
//! events and reads whole batches through the execution store on a miss.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::error::{CoreError, Result};
use crate::history::events::HistoryEvent;
use crate::persistence::{ExecutionStore, ReadHistoryBranchRequest};
use crate::WorkflowKey;

/// Identity of one cached event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    /// The run the event belongs to.
    pub workflow_key: WorkflowKey,
    /// The event's id within the run's branch.
    pub event_id: i64,
}

#[derive(Default)]
struct CacheInner {
    map: HashMap<EventKey, HistoryEvent>,
    order: VecDeque<EventKey>,
}

/// Bounded read-through event cache for one shard.
pub struct EventsCache {
    shard_id: i32,
    capacity: usize,
    store: Arc<dyn ExecutionStore>,
    inner: Mutex<CacheInner>,
}

impl EventsCache {
    /// Create a cache reading through `store`.
    pub fn new(shard_id: i32, capacity: usize, store: Arc<dyn ExecutionStore>) -> Self {
        Self {
            shard_id,
            capacity: capacity.max(1),
            store,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Insert an event, evicting the oldest entries past capacity.
    pub fn put_event(&self, key: EventKey, event: HistoryEvent) {
        let mut inner = self.inner.lock().expect("events cache poisoned");
        if inner.map.insert(key.clone(), event).is_none() {
            inner.order.push_back(key);
        }
        while inner.map.len() > self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.map.remove(&oldest);
        }
    }

    fn lookup(&self, key: &EventKey) -> Option<HistoryEvent> {
        self.inner
            .lock()
            .expect("events cache poisoned")
            .map
            .get(key)
            .cloned()
    }

    /// Fetch one event, reading its batch from the branch on a miss.
    ///
    /// `first_event_id_in_batch` is the node id of the batch that carried the
    /// event; `branch_token` is the branch to read. An event missing from
    /// the branch is an internal inconsistency and propagates as such.
    pub async fn get_event(
        &self,
        cancel: &CancellationToken,
        key: EventKey,
        first_event_id_in_batch: i64,
        branch_token: &[u8],
    ) -> Result<HistoryEvent> {
        if let Some(event) = self.lookup(&key) {
            return Ok(event);
        }

        let response = self
            .store
            .read_history_branch(
                cancel,
                ReadHistoryBranchRequest {
                    shard_id: self.shard_id,
                    branch_token: branch_token.to_vec(),
                    min_node_id: first_event_id_in_batch,
                    max_node_id: key.event_id + 1,
                    page_size: usize::MAX,
                    page_token: Vec::new(),
                    metadata_only: false,
                    reverse: false,
                },
            )
            .await?;

        let mut found = None;
        for node in response.nodes {
            let batch: Vec<HistoryEvent> = node.events.decode()?;
            for event in batch {
                let event_key = EventKey {
                    workflow_key: key.workflow_key.clone(),
                    event_id: event.event_id,
                };
                if event_key == key {
                    found = Some(event.clone());
                }
                self.put_event(event_key, event);
            }
        }

        found.ok_or_else(|| {
            CoreError::internal(format!(
                "event {} of {} not found in history",
                key.event_id, key.workflow_key
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use chrono::Utc;

    fn event(event_id: i64) -> HistoryEvent {
        HistoryEvent {
            event_id,
            version: 0,
            event_time: Utc::now(),
            attributes: crate::history::events::EventAttributes::TimerFired {
                timer_id: format!("t-{event_id}"),
                started_event_id: event_id - 1,
            },
        }
    }

    fn key(event_id: i64) -> EventKey {
        EventKey {
            workflow_key: WorkflowKey::new("ns", "wf", "run"),
            event_id,
        }
    }

    #[test]
    fn test_eviction_is_fifo_and_bounded() {
        let cache = EventsCache::new(1, 2, Arc::new(MemoryStore::new()));
        cache.put_event(key(1), event(1));
        cache.put_event(key(2), event(2));
        cache.put_event(key(3), event(3));

        assert!(cache.lookup(&key(1)).is_none(), "oldest entry evicted");
        assert!(cache.lookup(&key(2)).is_some());
        assert!(cache.lookup(&key(3)).is_some());
    }

    #[tokio::test]
    async fn test_miss_with_no_history_is_internal_error() {
        let store = Arc::new(MemoryStore::new());
        let cache = EventsCache::new(1, 16, store);
        let branch = crate::history::branch::BranchInfo::new_root();
        let err = cache
            .get_event(
                &CancellationToken::new(),
                key(5),
                1,
                &branch.to_token().unwrap(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INTERNAL");
    }
}
