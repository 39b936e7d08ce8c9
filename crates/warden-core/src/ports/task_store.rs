//! TaskStore port - タスク状態の正本（source of truth）
//!
//! # 設計原則
//! - claim は原子的: 同じタスクを奪い合う N ワーカーのうち成功するのは 1 つだけ
//! - lease の権威は claim_token。token が一致しない呼び出しは `StaleClaim`
//! - 状態遷移はすべて `domain::transition::apply` を通す
//! - 遷移がコミットされた後に Event Store へちょうど 1 レコード追記する

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{
    ClaimToken, Phase, QualityGateResult, Task, TaskId, TaskSpec, TaskStatus, WorkerId,
};
use crate::error::CoreError;
use crate::observability::StatusCounts;

/// Partition of the queue a worker claims from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSpec {
    pub index: u32,
    pub count: u32,
}

impl ShardSpec {
    pub fn contains(&self, task: &Task) -> bool {
        task.shard(self.count) == self.index
    }
}

/// Which tasks a claim may pick. Empty lists mean "any".
#[derive(Debug, Clone, Default)]
pub struct ClaimFilter {
    pub categories: Vec<String>,
    pub phases: Vec<Phase>,
    pub shard: Option<ShardSpec>,
}

impl ClaimFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn with_shard(mut self, index: u32, count: u32) -> Self {
        self.shard = Some(ShardSpec { index, count });
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.categories.push(category.into());
        self
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phases.push(phase);
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        (self.categories.is_empty() || self.categories.iter().any(|c| *c == task.category))
            && (self.phases.is_empty() || self.phases.contains(&task.phase))
            && self.shard.is_none_or(|s| s.contains(task))
    }
}

/// Filter for status queries.
#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    pub status: Option<TaskStatus>,
    pub phase: Option<Phase>,
    pub owner: Option<WorkerId>,
    pub category: Option<String>,
    pub limit: Option<usize>,
}

impl TaskQuery {
    pub fn matches(&self, task: &Task) -> bool {
        self.status.is_none_or(|s| s == task.status)
            && self.phase.is_none_or(|p| p == task.phase)
            && self
                .owner
                .as_ref()
                .is_none_or(|o| task.owner.as_ref() == Some(o))
            && self
                .category
                .as_ref()
                .is_none_or(|c| *c == task.category)
    }
}

/// Age-based priority boost for starving pending tasks.
#[derive(Debug, Clone)]
pub struct AgeBoostPolicy {
    /// Pending for at least this long since it was created or last boosted.
    pub after: Duration,
    pub step: i32,
    pub max_priority: i32,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Validate and insert a new `pending` task.
    async fn enqueue(&self, spec: TaskSpec) -> Result<TaskId, CoreError>;

    /// Atomically claim the best matching `pending`/`stale` task.
    ///
    /// Order: priority descending, then `created_at` ascending.
    async fn claim(
        &self,
        worker_id: &WorkerId,
        filter: &ClaimFilter,
    ) -> Result<Option<Task>, CoreError>;

    /// First progress signal: `claimed -> in_progress`.
    async fn mark_in_progress(&self, task_id: TaskId, token: ClaimToken)
    -> Result<Task, CoreError>;

    /// Refresh `heartbeat_at`. `StaleClaim` means the lease is gone.
    async fn heartbeat(&self, task_id: TaskId, token: ClaimToken) -> Result<(), CoreError>;

    async fn record_gate_result(&self, result: &QualityGateResult) -> Result<(), CoreError>;

    async fn latest_gate_result(
        &self,
        task_id: TaskId,
        phase: Phase,
    ) -> Result<Option<QualityGateResult>, CoreError>;

    /// All recorded gate results of a task, oldest first.
    async fn gate_results(&self, task_id: TaskId) -> Result<Vec<QualityGateResult>, CoreError>;

    /// Terminal success. `gate` must be the latest passing result for the current phase.
    async fn complete(
        &self,
        task_id: TaskId,
        token: ClaimToken,
        gate: &QualityGateResult,
    ) -> Result<Task, CoreError>;

    /// Move to the next phase and back to `pending`.
    async fn advance_phase(
        &self,
        task_id: TaskId,
        token: ClaimToken,
        gate: &QualityGateResult,
    ) -> Result<Task, CoreError>;

    /// Requeue at the same phase (or fail when retries are exhausted).
    async fn reject(
        &self,
        task_id: TaskId,
        token: ClaimToken,
        gate: &QualityGateResult,
    ) -> Result<Task, CoreError>;

    async fn fail(
        &self,
        task_id: TaskId,
        token: ClaimToken,
        error: &str,
    ) -> Result<Task, CoreError>;

    /// Give the lease back without consuming a retry.
    async fn release(
        &self,
        task_id: TaskId,
        token: ClaimToken,
        reason: &str,
    ) -> Result<Task, CoreError>;

    /// Operator priority change. Only `pending` / `stale` tasks qualify.
    async fn set_priority(&self, task_id: TaskId, priority: i32) -> Result<Task, CoreError>;

    /// Expire every lease whose heartbeat is older than `threshold`.
    async fn reap_stale(&self, threshold: Duration) -> Result<Vec<Task>, CoreError>;

    async fn apply_age_boosts(&self, policy: &AgeBoostPolicy) -> Result<Vec<Task>, CoreError>;

    async fn get(&self, task_id: TaskId) -> Result<Option<Task>, CoreError>;

    async fn list(&self, query: &TaskQuery) -> Result<Vec<Task>, CoreError>;

    async fn counts(&self) -> Result<StatusCounts, CoreError>;
}

/// `gate` must be the most recent result recorded for its task and phase.
pub(crate) fn ensure_latest_gate(
    gate: &QualityGateResult,
    latest: Option<&QualityGateResult>,
) -> Result<(), CoreError> {
    match latest {
        Some(latest)
            if latest.task_id == gate.task_id
                && latest.phase == gate.phase
                && latest.verdict == gate.verdict
                && latest.evaluated_at == gate.evaluated_at =>
        {
            Ok(())
        }
        _ => Err(CoreError::InvalidTransition {
            from: TaskStatus::InProgress,
            event: format!(
                "gate result for {} at {} is not the most recent one",
                gate.task_id, gate.phase
            ),
        }),
    }
}
