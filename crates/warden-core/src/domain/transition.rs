//! Task state machine as a pure function.
//!
//! `apply(task, event, now)` returns the next task value together with the
//! label recorded in the event log. It performs no I/O, so both store
//! implementations share it and the whole retry / rejection loop can be
//! tested without a database.

use chrono::{DateTime, Utc};
use serde_json::json;

use super::gate::{QualityGateResult, Verdict};
use super::ids::{ClaimToken, WorkerId};
use super::task::{Task, TaskStatus};
use crate::error::CoreError;

#[derive(Debug, Clone)]
pub enum TaskEvent {
    Claim {
        worker_id: WorkerId,
        token: ClaimToken,
    },
    /// First progress signal from the lease holder.
    Progress { token: ClaimToken },
    Heartbeat { token: ClaimToken },
    /// Gate passed at the task's current phase and the task is done.
    Complete {
        token: ClaimToken,
        gate: QualityGateResult,
    },
    /// Gate passed, move to the next phase and go back to the queue.
    Advance {
        token: ClaimToken,
        gate: QualityGateResult,
    },
    Reject {
        token: ClaimToken,
        gate: QualityGateResult,
    },
    Fail { token: ClaimToken, error: String },
    /// Give the lease back without consuming a retry.
    Release { token: ClaimToken, reason: String },
    /// Lease expired (watchdog only).
    Expire,
    Boost { step: i32, max_priority: i32 },
    /// Operator priority change of a queued task.
    Reprioritize { priority: i32 },
}

impl TaskEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TaskEvent::Claim { .. } => "claim",
            TaskEvent::Progress { .. } => "progress",
            TaskEvent::Heartbeat { .. } => "heartbeat",
            TaskEvent::Complete { .. } => "complete",
            TaskEvent::Advance { .. } => "advance",
            TaskEvent::Reject { .. } => "reject",
            TaskEvent::Fail { .. } => "fail",
            TaskEvent::Release { .. } => "release",
            TaskEvent::Expire => "expire",
            TaskEvent::Boost { .. } => "boost",
            TaskEvent::Reprioritize { .. } => "reprioritize",
        }
    }
}

/// Result of applying an event.
#[derive(Debug, Clone)]
pub struct Transition {
    pub task: Task,
    /// `None` for pure liveness updates (heartbeats), which are not logged.
    pub label: Option<&'static str>,
    pub detail: serde_json::Value,
}

pub fn apply(task: &Task, event: TaskEvent, now: DateTime<Utc>) -> Result<Transition, CoreError> {
    let mut next = task.clone();
    next.updated_at = now;

    let event_name = event.name();
    let (label, extra) = match event {
        TaskEvent::Claim { worker_id, token } => {
            if !task.status.is_claimable() {
                return Err(invalid(task, event_name));
            }
            next.status = TaskStatus::Claimed;
            next.owner = Some(worker_id.clone());
            next.claim_token = Some(token);
            next.heartbeat_at = Some(now);
            (Some("claimed"), json!({ "worker": worker_id }))
        }
        TaskEvent::Progress { token } => {
            ensure_lease(task, token)?;
            next.heartbeat_at = Some(now);
            if task.status == TaskStatus::InProgress {
                (None, json!({}))
            } else {
                next.status = TaskStatus::InProgress;
                (Some("in_progress"), json!({ "worker": task.owner }))
            }
        }
        TaskEvent::Heartbeat { token } => {
            ensure_lease(task, token)?;
            next.heartbeat_at = Some(now);
            (None, json!({}))
        }
        TaskEvent::Complete { token, gate } => {
            ensure_lease(task, token)?;
            ensure_verdict(task, &gate, Verdict::Pass, event_name)?;
            next.status = TaskStatus::Completed;
            clear_lease(&mut next);
            next.last_error = None;
            (Some("completed"), json!({ "worker": task.owner, "phase": task.phase }))
        }
        TaskEvent::Advance { token, gate } => {
            ensure_lease(task, token)?;
            ensure_verdict(task, &gate, Verdict::Pass, event_name)?;
            let Some(phase) = task.phase.next() else {
                return Err(invalid(task, event_name));
            };
            next.phase = phase;
            next.status = TaskStatus::Pending;
            clear_lease(&mut next);
            next.last_error = None;
            (
                Some("phase_advanced"),
                json!({ "worker": task.owner, "from_phase": task.phase, "to_phase": phase }),
            )
        }
        TaskEvent::Reject { token, gate } => {
            ensure_lease(task, token)?;
            ensure_verdict(task, &gate, Verdict::Reject, event_name)?;
            let error = gate.reason_lines().join("; ");
            let label = consume_retry(&mut next, error.clone());
            (
                Some(if label == "failed" { "failed" } else { "rejected" }),
                json!({ "worker": task.owner, "phase": task.phase, "reasons": gate.reasons }),
            )
        }
        TaskEvent::Fail { token, error } => {
            ensure_lease(task, token)?;
            let label = consume_retry(&mut next, error.clone());
            (Some(label), json!({ "worker": task.owner, "error": error }))
        }
        TaskEvent::Release { token, reason } => {
            ensure_lease(task, token)?;
            next.status = TaskStatus::Pending;
            clear_lease(&mut next);
            next.last_error = Some(reason.clone());
            (Some("released"), json!({ "worker": task.owner, "reason": reason }))
        }
        TaskEvent::Expire => {
            if !task.status.is_leased() {
                return Err(invalid(task, event_name));
            }
            clear_lease(&mut next);
            let error = format!("lease of {} expired", display_owner(task));
            next.last_error = Some(error);
            if task.retry_count >= task.max_retries {
                next.status = TaskStatus::Failed;
                (Some("failed"), json!({ "worker": task.owner, "cause": "stale" }))
            } else {
                next.retry_count += 1;
                next.status = TaskStatus::Stale;
                (Some("stale"), json!({ "worker": task.owner, "heartbeat_at": task.heartbeat_at }))
            }
        }
        TaskEvent::Boost { step, max_priority } => {
            if task.status != TaskStatus::Pending || task.priority >= max_priority {
                return Err(invalid(task, event_name));
            }
            next.priority = task.priority.saturating_add(step).min(max_priority);
            next.boost_count += 1;
            (
                Some("boosted"),
                json!({ "from_priority": task.priority, "to_priority": next.priority }),
            )
        }
        TaskEvent::Reprioritize { priority } => {
            if !task.status.is_claimable() {
                return Err(invalid(task, event_name));
            }
            next.priority = priority;
            if priority == task.priority {
                (None, json!({}))
            } else {
                (
                    Some("priority_changed"),
                    json!({ "from_priority": task.priority, "to_priority": priority }),
                )
            }
        }
    };

    let mut detail = json!({
        "from": task.status,
        "to": next.status,
        "retry_count": next.retry_count,
    });
    if let (Some(obj), serde_json::Value::Object(extra)) = (detail.as_object_mut(), extra) {
        obj.extend(extra);
    }

    Ok(Transition {
        task: next,
        label,
        detail,
    })
}

/// Requeue while retries remain, otherwise fail terminally.
/// `retry_count` never exceeds `max_retries`.
fn consume_retry(task: &mut Task, error: String) -> &'static str {
    clear_lease(task);
    task.last_error = Some(error);
    if task.retry_count >= task.max_retries {
        task.status = TaskStatus::Failed;
        "failed"
    } else {
        task.retry_count += 1;
        task.status = TaskStatus::Pending;
        "requeued"
    }
}

fn clear_lease(task: &mut Task) {
    task.owner = None;
    task.claim_token = None;
    task.heartbeat_at = None;
}

fn ensure_lease(task: &Task, token: ClaimToken) -> Result<(), CoreError> {
    if task.is_held_by(token) {
        Ok(())
    } else {
        Err(CoreError::StaleClaim {
            task_id: task.id,
            token: Some(token),
        })
    }
}

fn ensure_verdict(
    task: &Task,
    gate: &QualityGateResult,
    expected: Verdict,
    event: &str,
) -> Result<(), CoreError> {
    if gate.task_id != task.id || gate.phase != task.phase || gate.verdict != expected {
        return Err(CoreError::InvalidTransition {
            from: task.status,
            event: format!("{event} with {} verdict for {}", gate.verdict, gate.phase),
        });
    }
    Ok(())
}

fn invalid(task: &Task, event: &str) -> CoreError {
    CoreError::InvalidTransition {
        from: task.status,
        event: event.to_string(),
    }
}

fn display_owner(task: &Task) -> String {
    task.owner
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "unknown worker".into())
}
