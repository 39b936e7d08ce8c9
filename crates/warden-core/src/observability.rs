//! Aggregated views for status output.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::{Phase, Task, TaskStatus};

/// Task counts per status and per phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub claimed: usize,
    pub in_progress: usize,
    pub blocked: usize,
    pub completed: usize,
    pub failed: usize,
    pub stale: usize,
    /// Tasks promoted at least once by the age boost.
    pub boosted: usize,
    /// Non-terminal tasks per phase.
    pub by_phase: BTreeMap<Phase, usize>,
}

impl StatusCounts {
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut counts = Self::default();
        for task in tasks {
            counts.add(task);
        }
        counts
    }

    pub fn add(&mut self, task: &Task) {
        match task.status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Claimed => self.claimed += 1,
            TaskStatus::InProgress => self.in_progress += 1,
            TaskStatus::Blocked => self.blocked += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Stale => self.stale += 1,
        }
        if task.boost_count > 0 {
            self.boosted += 1;
        }
        if !task.status.is_terminal() {
            *self.by_phase.entry(task.phase).or_default() += 1;
        }
    }

    pub fn total(&self) -> usize {
        self.pending
            + self.claimed
            + self.in_progress
            + self.blocked
            + self.completed
            + self.failed
            + self.stale
    }

    pub fn get(&self, status: TaskStatus) -> usize {
        match status {
            TaskStatus::Pending => self.pending,
            TaskStatus::Claimed => self.claimed,
            TaskStatus::InProgress => self.in_progress,
            TaskStatus::Blocked => self.blocked,
            TaskStatus::Completed => self.completed,
            TaskStatus::Failed => self.failed,
            TaskStatus::Stale => self.stale,
        }
    }
}
