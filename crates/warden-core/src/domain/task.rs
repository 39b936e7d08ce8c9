//! Task record and the enqueue request (`TaskSpec`).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ClaimToken, TaskId, WorkerId};
use super::phase::Phase;
use crate::error::CoreError;

/// Task status.
///
/// State transitions:
/// - Pending -> Claimed -> InProgress -> Completed
/// - Claimed/InProgress -> Pending (fail, reject, release) while retries remain
/// - Claimed/InProgress -> Stale (watchdog) -> Claimed (re-claim)
/// - any non-terminal -> Failed once `retry_count` would exceed `max_retries`
///
/// `Blocked` is reserved for collaborators that park a task outside the
/// queue; the core never claims it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    InProgress,
    Blocked,
    Completed,
    Failed,
    Stale,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Pending,
        TaskStatus::Claimed,
        TaskStatus::InProgress,
        TaskStatus::Blocked,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Stale,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Eligible for `claim`.
    pub fn is_claimable(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Stale)
    }

    /// Held under a lease (owner + claim token set).
    pub fn is_leased(self) -> bool {
        matches!(self, TaskStatus::Claimed | TaskStatus::InProgress)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Claimed => "claimed",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Stale => "stale",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s.trim())
            .ok_or_else(|| format!("unknown task status `{s}`"))
    }
}

/// Unit of schedulable work.
///
/// This is the single source of truth for task state; every mutation goes
/// through [`crate::domain::transition::apply`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub category: String,
    /// Opaque reference owned by the enqueuing collaborator.
    pub payload_ref: String,
    pub phase: Phase,
    pub status: TaskStatus,
    pub priority: i32,
    pub owner: Option<WorkerId>,
    pub claim_token: Option<ClaimToken>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub boost_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        id: TaskId,
        spec: &TaskSpec,
        priority: i32,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            category: spec.category.trim().to_string(),
            payload_ref: spec.payload_ref.trim().to_string(),
            phase: spec.phase.unwrap_or_else(Phase::first),
            status: TaskStatus::Pending,
            priority,
            owner: None,
            claim_token: None,
            heartbeat_at: None,
            retry_count: 0,
            max_retries,
            last_error: None,
            boost_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Does `token` prove the current lease?
    pub fn is_held_by(&self, token: ClaimToken) -> bool {
        self.status.is_leased() && self.claim_token == Some(token)
    }

    /// Shard this task belongs to when the pool is split `count` ways.
    pub fn shard(&self, count: u32) -> u32 {
        shard_key(&self.category) % count.max(1)
    }
}

/// Stable FNV-1a hash of a category.
///
/// Must give the same value in every worker process, so `DefaultHasher`
/// is not an option.
pub fn shard_key(category: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in category.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// What a collaborator submits to `enqueue`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    pub category: String,
    pub payload_ref: String,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub phase: Option<Phase>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl TaskSpec {
    pub fn new(category: impl Into<String>, payload_ref: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            payload_ref: payload_ref.into(),
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Reject missing required fields before anything is written.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.category.trim().is_empty() {
            return Err(CoreError::InvalidSpec("category is required".into()));
        }
        if self.payload_ref.trim().is_empty() {
            return Err(CoreError::InvalidSpec("payload_ref is required".into()));
        }
        Ok(())
    }
}

/// Parse a priority given either as a number or as a queue label.
///
/// Labels: `P0`/`critical` = 30, `P1`/`high` = 20, `P2`/`medium` = 10,
/// `P3`/`low` = 0. Higher values are claimed first.
pub fn parse_priority(s: &str) -> Result<i32, CoreError> {
    let raw = s.trim();
    if let Ok(n) = raw.parse::<i32>() {
        return Ok(n);
    }
    match raw.to_ascii_uppercase().as_str() {
        "P0" | "CRITICAL" | "P0-CRITICAL" => Ok(30),
        "P1" | "HIGH" | "P1-HIGH" => Ok(20),
        "P2" | "MEDIUM" | "P2-MEDIUM" => Ok(10),
        "P3" | "LOW" | "P3-LOW" => Ok(0),
        _ => Err(CoreError::InvalidSpec(format!("unknown priority `{raw}`"))),
    }
}
