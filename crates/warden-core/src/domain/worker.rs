use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{TaskId, WorkerId};

/// Lifecycle state of a pool member.
///
/// A paused worker finishes its in-flight task but claims nothing new.
/// A draining worker exits once idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Running,
    Paused,
    Draining,
    Stopped,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Running => "running",
            WorkerState::Paused => "paused",
            WorkerState::Draining => "draining",
            WorkerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(WorkerState::Running),
            "paused" => Ok(WorkerState::Paused),
            "draining" => Ok(WorkerState::Draining),
            "stopped" => Ok(WorkerState::Stopped),
            other => Err(format!("unknown worker state `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: WorkerId,
    pub shard_id: u32,
    pub state: WorkerState,
    pub current_task_id: Option<TaskId>,
    pub last_heartbeat_sent_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl WorkerRecord {
    pub fn new(worker_id: WorkerId, shard_id: u32, now: DateTime<Utc>) -> Self {
        Self {
            worker_id,
            shard_id,
            state: WorkerState::Running,
            current_task_id: None,
            last_heartbeat_sent_at: None,
            updated_at: now,
        }
    }
}
