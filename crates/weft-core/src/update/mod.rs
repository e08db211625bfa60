// Copyright (C) 2025 Weft Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-flight workflow update registry.
//!
//! A workflow update is a request/response exchange with a running workflow:
//! the caller's task parks on the update while workers advance it through
//! `Created → Admitted → Accepted → Completed`. The registry is the per-run
//! rendezvous point, keyed by update id; completion broadcasts the outcome
//! to every waiter over a watch channel. Updates live in memory until
//! admitted; admission and later stages also write through to mutable state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::state::mutable_state::MutableState;
use crate::state::UpdateStage;

/// Terminal result of an update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    /// The update handler succeeded with this payload.
    Success(serde_json::Value),
    /// The update handler (or the admission path) failed.
    Failure(String),
}

/// Messages that advance an update's state machine.
#[derive(Debug, Clone)]
pub enum UpdateMessage {
    /// The caller's request; admits the update.
    Request {
        /// Handler input.
        input: serde_json::Value,
    },
    /// The worker accepted the update.
    Acceptance,
    /// The worker rejected the update before accepting it.
    Rejection {
        /// Why it was rejected.
        failure: String,
    },
    /// The worker produced the final outcome.
    Response {
        /// The outcome delivered to all waiters.
        outcome: Outcome,
    },
}

/// How state mutations registered by a message are applied.
///
/// Everything this path needs today is immediate application against the
/// locked mutable state; the variant exists so call sites name the choice.
pub enum Effects<'a> {
    /// Apply mutations to this state before the message returns.
    Immediate(&'a mut MutableState),
}

struct UpdateCell {
    stage: UpdateStage,
    outcome: Option<Outcome>,
}

/// One in-flight update.
pub struct Update {
    id: String,
    cell: Mutex<UpdateCell>,
    stage_tx: watch::Sender<UpdateStage>,
}

impl Update {
    fn new(id: String) -> Self {
        let (stage_tx, _) = watch::channel(UpdateStage::Created);
        Self {
            id,
            cell: Mutex::new(UpdateCell {
                stage: UpdateStage::Created,
                outcome: None,
            }),
            stage_tx,
        }
    }

    /// The update's id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The stage the update has reached.
    pub fn stage(&self) -> UpdateStage {
        self.cell.lock().expect("update cell poisoned").stage
    }

    /// The outcome, once one exists.
    pub fn outcome(&self) -> Option<Outcome> {
        self.cell
            .lock()
            .expect("update cell poisoned")
            .outcome
            .clone()
    }

    fn transition(&self, to: UpdateStage, outcome: Option<Outcome>) -> Result<()> {
        let mut cell = self.cell.lock().expect("update cell poisoned");
        if cell.stage.is_terminal() {
            // Terminal stages are sticky; late messages are dropped.
            return Ok(());
        }
        // Stages never regress: a message for an already-passed stage is a
        // duplicate delivery and drops out here.
        if to <= cell.stage {
            return Ok(());
        }
        cell.stage = to;
        if outcome.is_some() {
            cell.outcome = outcome;
        }
        drop(cell);
        let _ = self.stage_tx.send(to);
        Ok(())
    }

    /// Advance the state machine with an inbound message, applying its
    /// mutable-state effects.
    pub fn on_message(&self, message: UpdateMessage, effects: Effects<'_>) -> Result<()> {
        let Effects::Immediate(ms) = effects;
        match message {
            UpdateMessage::Request { input: _input } => {
                ms.apply_update_admission(self.id.clone())?;
                self.transition(UpdateStage::Admitted, None)
            }
            UpdateMessage::Acceptance => {
                // Duplicate deliveries must not re-append the acceptance
                // event.
                if self.stage() >= UpdateStage::Accepted {
                    return Ok(());
                }
                ms.apply_update_acceptance(&self.id)?;
                self.transition(UpdateStage::Accepted, None)
            }
            UpdateMessage::Rejection { failure } => {
                // A rejected update completes with a failure outcome and
                // leaves no trace in mutable state.
                let outcome = Outcome::Failure(failure);
                let mut cell = self.cell.lock().expect("update cell poisoned");
                if cell.stage.is_terminal() {
                    return Ok(());
                }
                cell.stage = UpdateStage::Completed;
                cell.outcome = Some(outcome);
                drop(cell);
                let _ = self.stage_tx.send(UpdateStage::Completed);
                Ok(())
            }
            UpdateMessage::Response { outcome } => {
                if self.stage().is_terminal() {
                    return Ok(());
                }
                let serialized = serde_json::to_value(&outcome)?;
                ms.apply_update_completion(&self.id, serialized)?;
                self.transition(UpdateStage::Completed, Some(outcome))
            }
        }
    }

    /// Abort the update; all waiters are released with an error.
    pub fn abort(&self) {
        let mut cell = self.cell.lock().expect("update cell poisoned");
        if cell.stage.is_terminal() {
            return;
        }
        cell.stage = UpdateStage::Aborted;
        drop(cell);
        let _ = self.stage_tx.send(UpdateStage::Aborted);
    }

    async fn wait_stage(
        &self,
        cancel: &CancellationToken,
        reached: UpdateStage,
    ) -> Result<Option<Outcome>> {
        let mut stage_rx = self.stage_tx.subscribe();
        loop {
            let stage = *stage_rx.borrow_and_update();
            if stage == UpdateStage::Aborted {
                return Err(CoreError::Unavailable {
                    message: format!("workflow update '{}' aborted", self.id),
                });
            }
            if stage >= reached {
                return Ok(self.outcome());
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CoreError::Canceled),
                changed = stage_rx.changed() => {
                    changed.map_err(|_| {
                        CoreError::internal("update stage channel closed with waiters parked")
                    })?;
                }
            }
        }
    }

    /// Block until the update is accepted (or completed). A cancelled waiter
    /// gets [`CoreError::Canceled`]; the update itself survives and can
    /// complete for other waiters.
    pub async fn wait_accepted(&self, cancel: &CancellationToken) -> Result<Option<Outcome>> {
        self.wait_stage(cancel, UpdateStage::Accepted).await
    }

    /// Block until the update has an outcome.
    pub async fn wait_outcome(&self, cancel: &CancellationToken) -> Result<Outcome> {
        let outcome = self.wait_stage(cancel, UpdateStage::Completed).await?;
        outcome.ok_or_else(|| CoreError::internal("completed update has no outcome"))
    }
}

/// Per-run map of in-flight updates.
#[derive(Default)]
pub struct UpdateRegistry {
    updates: Mutex<HashMap<String, Arc<Update>>>,
}

impl UpdateRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the update with this id, or create it. The second return value
    /// is whether it already existed.
    pub fn find_or_create(&self, update_id: &str) -> (Arc<Update>, bool) {
        let mut updates = self.updates.lock().expect("update registry poisoned");
        if let Some(existing) = updates.get(update_id) {
            return (existing.clone(), true);
        }
        debug!(update_id, "registering in-flight update");
        let update = Arc::new(Update::new(update_id.to_string()));
        updates.insert(update_id.to_string(), update.clone());
        (update, false)
    }

    /// Look up an update without creating it.
    pub fn find(&self, update_id: &str) -> Option<Arc<Update>> {
        self.updates
            .lock()
            .expect("update registry poisoned")
            .get(update_id)
            .cloned()
    }

    /// Number of registered updates.
    pub fn len(&self) -> usize {
        self.updates.lock().expect("update registry poisoned").len()
    }

    /// Whether no updates are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Abort every in-flight update, releasing all waiters. Used when the
    /// run closes or its context is evicted.
    pub fn abort_all(&self) {
        let updates = self.updates.lock().expect("update registry poisoned");
        for update in updates.values() {
            update.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::branch::BranchInfo;
    use crate::state::mutable_state::{MutableState, StartWorkflowRequest};
    use crate::WorkflowKey;
    use std::collections::HashMap as StdHashMap;
    use std::time::Duration;

    fn running_state() -> MutableState {
        let key = WorkflowKey::new("ns", "wf", "run-1");
        let branch = BranchInfo::new_root();
        let mut ms = MutableState::new_for_start(1, key, &branch).expect("new");
        ms.add_workflow_execution_started_event(StartWorkflowRequest {
            workflow_type: "t".to_string(),
            task_queue: "q".to_string(),
            input: None,
            workflow_run_timeout: Some(Duration::from_secs(60)),
            workflow_execution_timeout: None,
            workflow_task_timeout: None,
            create_request_id: "c-1".to_string(),
            first_workflow_task_backoff: None,
            search_attributes: StdHashMap::new(),
            continued_execution_run_id: None,
        })
        .expect("start");
        ms
    }

    #[test]
    fn test_find_or_create_dedupes_by_id() {
        let registry = UpdateRegistry::new();
        let (first, existed) = registry.find_or_create("u-1");
        assert!(!existed);
        let (second, existed) = registry.find_or_create("u-1");
        assert!(existed);
        assert!(Arc::ptr_eq(&first, &second), "same update object");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_stage_never_regresses() {
        let registry = UpdateRegistry::new();
        let (update, _) = registry.find_or_create("u-1");
        let mut ms = running_state();

        update
            .on_message(
                UpdateMessage::Request {
                    input: serde_json::json!({}),
                },
                Effects::Immediate(&mut ms),
            )
            .expect("request");
        update
            .on_message(UpdateMessage::Acceptance, Effects::Immediate(&mut ms))
            .expect("acceptance");
        assert_eq!(update.stage(), UpdateStage::Accepted);

        // A duplicate request is a no-op, not a regression.
        update
            .on_message(
                UpdateMessage::Request {
                    input: serde_json::json!({}),
                },
                Effects::Immediate(&mut ms),
            )
            .expect("duplicate request ignored");
        assert_eq!(update.stage(), UpdateStage::Accepted);
    }

    #[tokio::test]
    async fn test_completion_broadcasts_to_all_waiters() {
        let registry = Arc::new(UpdateRegistry::new());
        let (update, _) = registry.find_or_create("u-1");
        let cancel = CancellationToken::new();

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let update = update.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { update.wait_outcome(&cancel).await })
            })
            .collect();

        let mut ms = running_state();
        update
            .on_message(
                UpdateMessage::Request {
                    input: serde_json::json!({}),
                },
                Effects::Immediate(&mut ms),
            )
            .expect("request");
        update
            .on_message(UpdateMessage::Acceptance, Effects::Immediate(&mut ms))
            .expect("acceptance");
        update
            .on_message(
                UpdateMessage::Response {
                    outcome: Outcome::Success(serde_json::json!({"ok": true})),
                },
                Effects::Immediate(&mut ms),
            )
            .expect("response");

        for waiter in waiters {
            let outcome = waiter.await.expect("join").expect("outcome");
            assert_eq!(outcome, Outcome::Success(serde_json::json!({"ok": true})));
        }
    }

    #[tokio::test]
    async fn test_cancelled_waiter_releases_update_survives() {
        let registry = UpdateRegistry::new();
        let (update, _) = registry.find_or_create("u-1");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = update.wait_accepted(&cancel).await.unwrap_err();
        assert_eq!(err.error_code(), "CANCELED");

        // The update is still alive for other waiters.
        let mut ms = running_state();
        update
            .on_message(
                UpdateMessage::Request {
                    input: serde_json::json!({}),
                },
                Effects::Immediate(&mut ms),
            )
            .expect("request");
        update
            .on_message(UpdateMessage::Acceptance, Effects::Immediate(&mut ms))
            .expect("acceptance");
        let fresh = CancellationToken::new();
        update.wait_accepted(&fresh).await.expect("accepted");
    }

    #[tokio::test]
    async fn test_abort_releases_waiters_with_error() {
        let registry = UpdateRegistry::new();
        let (update, _) = registry.find_or_create("u-1");
        let cancel = CancellationToken::new();

        let waiter = {
            let update = update.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { update.wait_outcome(&cancel).await })
        };
        tokio::task::yield_now().await;

        registry.abort_all();
        let err = waiter.await.expect("join").unwrap_err();
        assert_eq!(err.error_code(), "UNAVAILABLE");
    }

    #[test]
    fn test_rejection_completes_with_failure_outcome() {
        let registry = UpdateRegistry::new();
        let (update, _) = registry.find_or_create("u-1");
        let mut ms = running_state();
        update
            .on_message(
                UpdateMessage::Request {
                    input: serde_json::json!({}),
                },
                Effects::Immediate(&mut ms),
            )
            .expect("request");
        update
            .on_message(
                UpdateMessage::Rejection {
                    failure: "validator said no".to_string(),
                },
                Effects::Immediate(&mut ms),
            )
            .expect("rejection");
        assert_eq!(update.stage(), UpdateStage::Completed);
        assert_eq!(
            update.outcome(),
            Some(Outcome::Failure("validator said no".to_string()))
        );
    }
}
