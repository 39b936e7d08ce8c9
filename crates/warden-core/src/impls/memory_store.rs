//! In-memory store: tasks, gate results, breakers, budget ledgers, workers.
//!
//! Single-process only. The tokio `Mutex` is the write lock; event appends
//! happen while it is held so the log order matches commit order.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::journal::Journal;
use crate::breaker::BreakerSnapshot;
use crate::config::TaskPolicy;
use crate::domain::transition::{self, TaskEvent};
use crate::domain::{
    BudgetLedger, ClaimToken, Phase, QualityGateResult, Task, TaskId, TaskSpec, Transition,
    WorkerId, WorkerRecord,
};
use crate::error::CoreError;
use crate::observability::StatusCounts;
use crate::ports::task_store::ensure_latest_gate;
use crate::ports::{
    AgeBoostPolicy, BreakerStateStore, BudgetStore, ClaimFilter, Clock, EventSink, IdGenerator,
    TaskQuery, TaskStore, UlidGenerator, WorkerRegistry,
};

#[derive(Default)]
struct MemoryState {
    /// Single source of truth for tasks.
    tasks: HashMap<TaskId, Task>,
    /// Gate results in recording order.
    gate_results: Vec<QualityGateResult>,
    breakers: BTreeMap<String, BreakerSnapshot>,
    ledgers: BTreeMap<i64, BudgetLedger>,
    workers: BTreeMap<WorkerId, WorkerRecord>,
}

impl MemoryState {
    fn apply(&mut self, task_id: TaskId, event: TaskEvent, clock: &dyn Clock) -> Result<Transition, CoreError> {
        let task = self
            .tasks
            .get(&task_id)
            .ok_or(CoreError::TaskNotFound(task_id))?;
        let tr = transition::apply(task, event, clock.now())?;
        self.tasks.insert(task_id, tr.task.clone());
        Ok(tr)
    }

    fn latest_gate(&self, task_id: TaskId, phase: Phase) -> Option<&QualityGateResult> {
        self.gate_results
            .iter()
            .rev()
            .find(|r| r.task_id == task_id && r.phase == phase)
    }

    fn check_latest(&self, task_id: TaskId, gate: &QualityGateResult) -> Result<(), CoreError> {
        let task = self
            .tasks
            .get(&task_id)
            .ok_or(CoreError::TaskNotFound(task_id))?;
        ensure_latest_gate(gate, self.latest_gate(task_id, task.phase))
    }
}

pub struct MemoryStore {
    state: Mutex<MemoryState>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    policy: Arc<TaskPolicy>,
    journal: Journal,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            ids: Arc::new(UlidGenerator::new(Arc::clone(&clock))),
            clock,
            policy: Arc::new(TaskPolicy::default()),
            journal: Journal::default(),
        }
    }

    pub fn with_policy(mut self, policy: Arc<TaskPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.journal = Journal::new(events);
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    async fn transition(&self, task_id: TaskId, event: TaskEvent) -> Result<Task, CoreError> {
        let mut state = self.state.lock().await;
        let tr = state.apply(task_id, event, self.clock.as_ref())?;
        self.journal.transition(&tr).await;
        Ok(tr.task)
    }

    async fn gated_transition(
        &self,
        task_id: TaskId,
        gate: &QualityGateResult,
        event: TaskEvent,
    ) -> Result<Task, CoreError> {
        let mut state = self.state.lock().await;
        state.check_latest(task_id, gate)?;
        let tr = state.apply(task_id, event, self.clock.as_ref())?;
        self.journal.transition(&tr).await;
        Ok(tr.task)
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn enqueue(&self, spec: TaskSpec) -> Result<TaskId, CoreError> {
        let (priority, max_retries) = self.policy.resolve(&spec)?;
        let task = Task::new(
            self.ids.generate_task_id(),
            &spec,
            priority,
            max_retries,
            self.clock.now(),
        );
        let id = task.id;

        let mut state = self.state.lock().await;
        state.tasks.insert(id, task.clone());
        self.journal.created(&task).await;
        Ok(id)
    }

    async fn claim(
        &self,
        worker_id: &WorkerId,
        filter: &ClaimFilter,
    ) -> Result<Option<Task>, CoreError> {
        let mut state = self.state.lock().await;
        let best = state
            .tasks
            .values()
            .filter(|t| t.status.is_claimable() && filter.matches(t))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.cmp(&b.id))
            })
            .map(|t| t.id);

        let Some(task_id) = best else {
            return Ok(None);
        };
        let event = TaskEvent::Claim {
            worker_id: worker_id.clone(),
            token: self.ids.generate_claim_token(),
        };
        let tr = state.apply(task_id, event, self.clock.as_ref())?;
        self.journal.transition(&tr).await;
        Ok(Some(tr.task))
    }

    async fn mark_in_progress(&self, task_id: TaskId, token: ClaimToken) -> Result<Task, CoreError> {
        self.transition(task_id, TaskEvent::Progress { token }).await
    }

    async fn heartbeat(&self, task_id: TaskId, token: ClaimToken) -> Result<(), CoreError> {
        self.transition(task_id, TaskEvent::Heartbeat { token })
            .await
            .map(|_| ())
    }

    async fn record_gate_result(&self, result: &QualityGateResult) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        if !state.tasks.contains_key(&result.task_id) {
            return Err(CoreError::TaskNotFound(result.task_id));
        }
        state.gate_results.push(result.clone());
        self.journal.gate(result).await;
        Ok(())
    }

    async fn latest_gate_result(
        &self,
        task_id: TaskId,
        phase: Phase,
    ) -> Result<Option<QualityGateResult>, CoreError> {
        let state = self.state.lock().await;
        Ok(state.latest_gate(task_id, phase).cloned())
    }

    async fn gate_results(&self, task_id: TaskId) -> Result<Vec<QualityGateResult>, CoreError> {
        let state = self.state.lock().await;
        Ok(state
            .gate_results
            .iter()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn complete(
        &self,
        task_id: TaskId,
        token: ClaimToken,
        gate: &QualityGateResult,
    ) -> Result<Task, CoreError> {
        let event = TaskEvent::Complete {
            token,
            gate: gate.clone(),
        };
        self.gated_transition(task_id, gate, event).await
    }

    async fn advance_phase(
        &self,
        task_id: TaskId,
        token: ClaimToken,
        gate: &QualityGateResult,
    ) -> Result<Task, CoreError> {
        let event = TaskEvent::Advance {
            token,
            gate: gate.clone(),
        };
        self.gated_transition(task_id, gate, event).await
    }

    async fn reject(
        &self,
        task_id: TaskId,
        token: ClaimToken,
        gate: &QualityGateResult,
    ) -> Result<Task, CoreError> {
        let event = TaskEvent::Reject {
            token,
            gate: gate.clone(),
        };
        self.gated_transition(task_id, gate, event).await
    }

    async fn fail(&self, task_id: TaskId, token: ClaimToken, error: &str) -> Result<Task, CoreError> {
        let event = TaskEvent::Fail {
            token,
            error: error.to_string(),
        };
        self.transition(task_id, event).await
    }

    async fn release(
        &self,
        task_id: TaskId,
        token: ClaimToken,
        reason: &str,
    ) -> Result<Task, CoreError> {
        let event = TaskEvent::Release {
            token,
            reason: reason.to_string(),
        };
        self.transition(task_id, event).await
    }

    async fn set_priority(&self, task_id: TaskId, priority: i32) -> Result<Task, CoreError> {
        self.transition(task_id, TaskEvent::Reprioritize { priority }).await
    }

    async fn reap_stale(&self, threshold: Duration) -> Result<Vec<Task>, CoreError> {
        let now = self.clock.now();
        let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
        let mut state = self.state.lock().await;

        let expired: Vec<TaskId> = state
            .tasks
            .values()
            .filter(|t| t.status.is_leased())
            .filter(|t| t.heartbeat_at.is_none_or(|hb| now - hb > threshold))
            .map(|t| t.id)
            .collect();

        let mut reaped = Vec::with_capacity(expired.len());
        for task_id in expired {
            let tr = state.apply(task_id, TaskEvent::Expire, self.clock.as_ref())?;
            self.journal.transition(&tr).await;
            reaped.push(tr.task);
        }
        Ok(reaped)
    }

    async fn apply_age_boosts(&self, policy: &AgeBoostPolicy) -> Result<Vec<Task>, CoreError> {
        let now = self.clock.now();
        let after = chrono::Duration::from_std(policy.after).unwrap_or(chrono::Duration::MAX);
        let mut state = self.state.lock().await;

        let due: Vec<TaskId> = state
            .tasks
            .values()
            .filter(|t| t.status == crate::domain::TaskStatus::Pending)
            .filter(|t| t.priority < policy.max_priority && now - t.updated_at >= after)
            .map(|t| t.id)
            .collect();

        let mut boosted = Vec::with_capacity(due.len());
        for task_id in due {
            let event = TaskEvent::Boost {
                step: policy.step,
                max_priority: policy.max_priority,
            };
            let tr = state.apply(task_id, event, self.clock.as_ref())?;
            self.journal.transition(&tr).await;
            boosted.push(tr.task);
        }
        Ok(boosted)
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<Task>, CoreError> {
        Ok(self.state.lock().await.tasks.get(&task_id).cloned())
    }

    async fn list(&self, query: &TaskQuery) -> Result<Vec<Task>, CoreError> {
        let state = self.state.lock().await;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| query.matches(t))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        if let Some(limit) = query.limit {
            tasks.truncate(limit);
        }
        Ok(tasks)
    }

    async fn counts(&self) -> Result<StatusCounts, CoreError> {
        let state = self.state.lock().await;
        Ok(StatusCounts::from_tasks(state.tasks.values()))
    }
}

#[async_trait]
impl BreakerStateStore for MemoryStore {
    async fn load_breaker(&self, key: &str) -> Result<Option<BreakerSnapshot>, CoreError> {
        Ok(self.state.lock().await.breakers.get(key).cloned())
    }

    async fn save_breaker(&self, snapshot: &BreakerSnapshot) -> Result<(), CoreError> {
        self.state
            .lock()
            .await
            .breakers
            .insert(snapshot.key.clone(), snapshot.clone());
        Ok(())
    }

    async fn list_breakers(&self) -> Result<Vec<BreakerSnapshot>, CoreError> {
        Ok(self.state.lock().await.breakers.values().cloned().collect())
    }
}

#[async_trait]
impl BudgetStore for MemoryStore {
    async fn load_ledger(&self, period_id: i64) -> Result<Option<BudgetLedger>, CoreError> {
        Ok(self.state.lock().await.ledgers.get(&period_id).cloned())
    }

    async fn save_ledger(&self, ledger: &BudgetLedger) -> Result<(), CoreError> {
        self.state
            .lock()
            .await
            .ledgers
            .insert(ledger.period_id, ledger.clone());
        Ok(())
    }
}

#[async_trait]
impl WorkerRegistry for MemoryStore {
    async fn upsert_worker(&self, record: &WorkerRecord) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        let prev = state.workers.get(&record.worker_id);
        if prev.is_some_and(|p| p.updated_at > record.updated_at) {
            return Ok(());
        }
        let changed = prev.is_none_or(|p| p.state != record.state);
        state.workers.insert(record.worker_id.clone(), record.clone());
        if changed {
            self.journal.worker(record, record.updated_at).await;
        }
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>, CoreError> {
        Ok(self.state.lock().await.workers.values().cloned().collect())
    }
}
