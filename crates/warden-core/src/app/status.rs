//! Status - ステータスクエリ
//!
//! 現在の状態は Task Store から、履歴は Event Store から読む。
//! どちらも最後に commit された状態だけを返す。

use std::sync::Arc;

use serde::Serialize;

use crate::breaker::{BreakerRegistry, BreakerSnapshot};
use crate::domain::{
    BudgetLedger, EntityType, EventRecord, QualityGateResult, Task, TaskId, WorkerRecord,
    period_of,
};
use crate::error::CoreError;
use crate::observability::StatusCounts;
use crate::ports::{
    BudgetStore, Clock, EventQuery, EventSink, TaskQuery, TaskStore, WorkerRegistry,
};

/// One task: current record, full transition history and gate results.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task: Task,
    pub history: Vec<EventRecord>,
    pub gate_results: Vec<QualityGateResult>,
}

/// Pool-wide snapshot for `warden stats`.
#[derive(Debug, Clone, Serialize)]
pub struct PoolReport {
    pub counts: StatusCounts,
    pub workers: Vec<WorkerRecord>,
    pub budget: Option<BudgetLedger>,
    pub breakers: Vec<BreakerSnapshot>,
}

pub struct StatusService {
    store: Arc<dyn TaskStore>,
    events: Arc<dyn EventSink>,
    workers: Arc<dyn WorkerRegistry>,
    budgets: Arc<dyn BudgetStore>,
    breakers: Arc<BreakerRegistry>,
    clock: Arc<dyn Clock>,
    budget_period_secs: u64,
}

impl StatusService {
    pub fn new(
        store: Arc<dyn TaskStore>,
        events: Arc<dyn EventSink>,
        workers: Arc<dyn WorkerRegistry>,
        budgets: Arc<dyn BudgetStore>,
        breakers: Arc<BreakerRegistry>,
        clock: Arc<dyn Clock>,
        budget_period_secs: u64,
    ) -> Self {
        Self {
            store,
            events,
            workers,
            budgets,
            breakers,
            clock,
            budget_period_secs,
        }
    }

    pub async fn task(&self, task_id: TaskId) -> Result<TaskReport, CoreError> {
        let task = self
            .store
            .get(task_id)
            .await?
            .ok_or(CoreError::TaskNotFound(task_id))?;
        let mut history = self
            .events
            .query(&EventQuery::for_entity(EntityType::Task, task_id))
            .await?;
        history.extend(
            self.events
                .query(&EventQuery::for_entity(EntityType::Gate, task_id))
                .await?,
        );
        history.sort_by_key(|e| e.seq);
        let gate_results = self.store.gate_results(task_id).await?;
        Ok(TaskReport {
            task,
            history,
            gate_results,
        })
    }

    /// Raw event history, e.g. everything in a time range.
    pub async fn history(&self, query: &EventQuery) -> Result<Vec<EventRecord>, CoreError> {
        self.events.query(query).await
    }

    pub async fn list(&self, query: &TaskQuery) -> Result<Vec<Task>, CoreError> {
        self.store.list(query).await
    }

    pub async fn pool(&self) -> Result<PoolReport, CoreError> {
        let period = period_of(self.clock.now(), self.budget_period_secs);
        Ok(PoolReport {
            counts: self.store.counts().await?,
            workers: self.workers.list_workers().await?,
            budget: self.budgets.load_ledger(period).await?,
            breakers: self.breakers.snapshots().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::domain::{TaskSpec, TaskStatus, WorkerId};
    use crate::impls::{MemoryEventLog, MemoryStore};
    use crate::ports::{ClaimFilter, ManualClock};
    use chrono::{TimeZone, Utc};

    fn service() -> (Arc<MemoryStore>, StatusService) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let events = Arc::new(MemoryEventLog::new());
        let store = Arc::new(MemoryStore::new(clock.clone()).with_events(events.clone()));
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::default(), clock.clone()));
        let status = StatusService::new(
            store.clone(),
            events,
            store.clone(),
            store.clone(),
            breakers,
            clock,
            86_400,
        );
        (store, status)
    }

    #[tokio::test]
    async fn report_includes_history_in_seq_order() {
        let (store, status) = service();
        let id = store.enqueue(TaskSpec::new("a", "r")).await.unwrap();
        let t = store
            .claim(&WorkerId::new("w1"), &ClaimFilter::any())
            .await
            .unwrap()
            .unwrap();
        store
            .release(id, t.claim_token.unwrap(), "shutdown")
            .await
            .unwrap();

        let report = status.task(id).await.unwrap();
        assert_eq!(report.task.status, TaskStatus::Pending);
        assert_eq!(report.task.last_error.as_deref(), Some("shutdown"));
        let names: Vec<&str> = report.history.iter().map(|e| e.transition.as_str()).collect();
        assert_eq!(names, vec!["created", "claimed", "released"]);
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let (_, status) = service();
        let err = status
            .task(TaskId::from_ulid(ulid::Ulid::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn pool_report_counts_and_filters() {
        let (store, status) = service();
        store.enqueue(TaskSpec::new("a", "1")).await.unwrap();
        store.enqueue(TaskSpec::new("b", "2")).await.unwrap();
        store
            .claim(&WorkerId::new("w1"), &ClaimFilter::any().with_category("b"))
            .await
            .unwrap();

        let pool = status.pool().await.unwrap();
        assert_eq!(pool.counts.pending, 1);
        assert_eq!(pool.counts.claimed, 1);
        assert!(pool.budget.is_none());

        let owned = status
            .list(&TaskQuery {
                owner: Some(WorkerId::new("w1")),
                ..TaskQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].category, "b");
    }
}
