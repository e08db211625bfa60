// Copyright (C) 2025 Weft Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Timer sequencing.
//!
//! Only the earliest unfired timer of each family (user timers, activity
//! timeouts) has a live timer task at any moment; when it fires, the next one
//! is created. The `timer_task_status` bits on activity and timer records
//! track which tasks currently exist so regeneration never doubles them up.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::history::events::TimeoutKind;
use crate::state::mutable_state::MutableState;
use crate::state::{
    TIMER_STATUS_CREATED, TIMER_TASK_STATUS_HEARTBEAT, TIMER_TASK_STATUS_SCHEDULE_TO_CLOSE,
    TIMER_TASK_STATUS_SCHEDULE_TO_START, TIMER_TASK_STATUS_START_TO_CLOSE,
};
use crate::tasks::{TaskAttributes, TaskKey};

/// Absolute fire time for a delay from `base`, saturating at the far future
/// instead of overflowing.
pub(crate) fn fire_time_after(base: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| base.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Clone, Copy)]
struct TimerCandidate {
    scheduled_event_id: i64,
    attempt: i32,
    fire_time: DateTime<Utc>,
    timeout_kind: TimeoutKind,
    status_bit: u32,
}

/// Derives the next live timer task of each family from mutable state.
#[derive(Debug, Default)]
pub struct TimerSequence;

impl TimerSequence {
    /// Create a sequence helper.
    pub fn new() -> Self {
        Self
    }

    /// Ensure a fire task exists for the earliest pending user timer.
    /// Returns whether a task was created.
    pub fn create_next_user_timer(&self, ms: &mut MutableState) -> Result<bool> {
        let earliest = ms
            .pending_timer_infos()
            .values()
            .min_by_key(|t| (t.expiry_time, t.started_event_id))
            .cloned();
        let Some(mut timer) = earliest else {
            return Ok(false);
        };
        if timer.task_status == TIMER_STATUS_CREATED {
            return Ok(false);
        }

        timer.task_status = TIMER_STATUS_CREATED;
        let expiry = timer.expiry_time;
        let started_event_id = timer.started_event_id;
        let timer_id = timer.timer_id.clone();
        ms.update_user_timer(timer)?;
        ms.add_task(
            TaskKey::at(expiry),
            TaskAttributes::UserTimer {
                started_event_id,
                timer_id,
            },
        );
        Ok(true)
    }

    /// Ensure a timeout task exists for the earliest pending activity
    /// timeout. Returns whether a task was created.
    pub fn create_next_activity_timer(&self, ms: &mut MutableState) -> Result<bool> {
        let mut candidates: Vec<TimerCandidate> = Vec::new();
        for info in ms.pending_activity_infos().values() {
            if !info.is_started() {
                if let Some(delay) = info.schedule_to_start_timeout {
                    candidates.push(TimerCandidate {
                        scheduled_event_id: info.scheduled_event_id,
                        attempt: info.attempt,
                        fire_time: fire_time_after(info.scheduled_time, delay),
                        timeout_kind: TimeoutKind::ScheduleToStart,
                        status_bit: TIMER_TASK_STATUS_SCHEDULE_TO_START,
                    });
                }
            }
            if let Some(delay) = info.schedule_to_close_timeout {
                candidates.push(TimerCandidate {
                    scheduled_event_id: info.scheduled_event_id,
                    attempt: info.attempt,
                    fire_time: fire_time_after(info.scheduled_time, delay),
                    timeout_kind: TimeoutKind::ScheduleToClose,
                    status_bit: TIMER_TASK_STATUS_SCHEDULE_TO_CLOSE,
                });
            }
            if let (true, Some(started_time)) = (info.is_started(), info.started_time) {
                if let Some(delay) = info.start_to_close_timeout {
                    candidates.push(TimerCandidate {
                        scheduled_event_id: info.scheduled_event_id,
                        attempt: info.attempt,
                        fire_time: fire_time_after(started_time, delay),
                        timeout_kind: TimeoutKind::StartToClose,
                        status_bit: TIMER_TASK_STATUS_START_TO_CLOSE,
                    });
                }
                if let Some(delay) = info.heartbeat_timeout {
                    let base = info.last_heartbeat_time.unwrap_or(started_time);
                    candidates.push(TimerCandidate {
                        scheduled_event_id: info.scheduled_event_id,
                        attempt: info.attempt,
                        fire_time: fire_time_after(base, delay),
                        timeout_kind: TimeoutKind::Heartbeat,
                        status_bit: TIMER_TASK_STATUS_HEARTBEAT,
                    });
                }
            }
        }

        candidates.sort_by_key(|c| (c.fire_time, c.scheduled_event_id));
        let Some(next) = candidates.first().copied() else {
            return Ok(false);
        };

        let Some(mut info) = ms
            .pending_activity_infos()
            .get(&next.scheduled_event_id)
            .cloned()
        else {
            return Ok(false);
        };
        if info.timer_task_status & next.status_bit != 0 {
            return Ok(false);
        }
        info.timer_task_status |= next.status_bit;
        ms.update_activity(info)?;
        ms.add_task(
            TaskKey::at(next.fire_time),
            TaskAttributes::ActivityTimeout {
                scheduled_event_id: next.scheduled_event_id,
                timeout_kind: next.timeout_kind,
                attempt: next.attempt,
            },
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fire_time_saturates_instead_of_overflowing() {
        let base = Utc::now();
        let fire = fire_time_after(base, Duration::from_secs(u64::MAX));
        assert_eq!(fire, DateTime::<Utc>::MAX_UTC);

        let normal = fire_time_after(base, Duration::from_secs(60));
        assert_eq!(normal, base + chrono::Duration::seconds(60));
    }
}
