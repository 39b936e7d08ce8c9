//! SQLite-backed store shared by every process of a pool.
//!
//! # フロー
//! 1. 書き込みは `task-store` ロックを取得
//! 2. `BEGIN IMMEDIATE` で読み出し → `transition::apply` → 保存 → commit
//! 3. ロック保持中にイベントを追記して解放
//!
//! Rows keep the full record as JSON in `body`; the other columns exist for
//! ordering and filtering only.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use tracing::{debug, info};

use super::journal::Journal;
use crate::breaker::BreakerSnapshot;
use crate::config::TaskPolicy;
use crate::domain::transition::{self, TaskEvent};
use crate::domain::{
    BudgetLedger, ClaimToken, Phase, QualityGateResult, Task, TaskId, TaskSpec, TaskStatus,
    Transition, WorkerId, WorkerRecord, shard_key,
};
use crate::error::CoreError;
use crate::lock::{Expect, LockManager, LockPolicy, PathGuard};
use crate::observability::StatusCounts;
use crate::ports::task_store::ensure_latest_gate;
use crate::ports::{
    AgeBoostPolicy, BreakerStateStore, BudgetStore, ClaimFilter, Clock, EventSink, IdGenerator,
    TaskQuery, TaskStore, UlidGenerator, WorkerRegistry,
};

const STORE_LOCK: &str = "task-store";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id          TEXT PRIMARY KEY,
    status      TEXT NOT NULL,
    priority    INTEGER NOT NULL,
    category    TEXT NOT NULL,
    phase       TEXT NOT NULL,
    shard_key   INTEGER NOT NULL,
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL,
    body        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks (status, priority DESC, created_at, id);

CREATE TABLE IF NOT EXISTS gate_results (
    seq           INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id       TEXT NOT NULL,
    phase         TEXT NOT NULL,
    verdict       TEXT NOT NULL,
    evaluated_at  INTEGER NOT NULL,
    body          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_gate_results_task ON gate_results (task_id, phase, seq);

CREATE TABLE IF NOT EXISTS breakers (
    key         TEXT PRIMARY KEY,
    state       TEXT NOT NULL,
    updated_at  INTEGER NOT NULL,
    body        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS budget_ledgers (
    period_id   INTEGER PRIMARY KEY,
    status      TEXT NOT NULL,
    updated_at  INTEGER NOT NULL,
    body        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS workers (
    worker_id   TEXT PRIMARY KEY,
    state       TEXT NOT NULL,
    updated_at  INTEGER NOT NULL,
    body        TEXT NOT NULL
);
"#;

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    locks: LockManager,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    policy: Arc<TaskPolicy>,
    journal: Journal,
}

impl SqliteStore {
    /// Open `file_name` under the trusted root. `locks` should be the
    /// pool-wide file lock manager.
    pub fn open(
        guard: &PathGuard,
        file_name: &str,
        locks: LockManager,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CoreError> {
        let path = guard.resolve(file_name, Expect::File)?;
        let conn = Connection::open(&path)?;
        guard.verify(&path, Expect::File)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        info!(path = %path.display(), "opened task store");
        Self::init(conn, locks, clock)
    }

    /// Private in-memory database; single process only.
    pub fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self, CoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, LockManager::in_process(LockPolicy::default()), clock)
    }

    fn init(conn: Connection, locks: LockManager, clock: Arc<dyn Clock>) -> Result<Self, CoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            locks,
            ids: Arc::new(UlidGenerator::new(Arc::clone(&clock))),
            clock,
            policy: Arc::new(TaskPolicy::default()),
            journal: Journal::default(),
        })
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

    /// Run `f` on the connection off the async runtime.
    async fn blocking<T, F>(&self, f: F) -> Result<T, CoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, CoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut conn)
        })
        .await?
    }

    /// Apply `event` to one task inside an immediate transaction.
    async fn transition(
        &self,
        task_id: TaskId,
        event: TaskEvent,
        gate: Option<QualityGateResult>,
    ) -> Result<Task, CoreError> {
        let _lock = self.locks.acquire(STORE_LOCK).await?;
        let now = self.clock.now();
        let tr = self
            .blocking(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let task = load_task(&tx, task_id)?.ok_or(CoreError::TaskNotFound(task_id))?;
                if let Some(gate) = &gate {
                    let latest = latest_gate(&tx, task_id, task.phase)?;
                    ensure_latest_gate(gate, latest.as_ref())?;
                }
                let tr = transition::apply(&task, event, now)?;
                save_task(&tx, &tr.task)?;
                tx.commit()?;
                Ok(tr)
            })
            .await?;
        self.journal.transition(&tr).await;
        Ok(tr.task)
    }

    /// Apply the event built by `event_for` to every task selected by `pick`.
    async fn sweep<P, E>(&self, pick: P, event_for: E) -> Result<Vec<Task>, CoreError>
    where
        P: Fn(&Task, DateTime<Utc>) -> bool + Send + 'static,
        E: Fn() -> TaskEvent + Send + 'static,
    {
        let _lock = self.locks.acquire(STORE_LOCK).await?;
        let now = self.clock.now();
        let transitions: Vec<Transition> = self
            .blocking(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let due: Vec<Task> = load_where(&tx, "1 = 1")?
                    .into_iter()
                    .filter(|t| pick(t, now))
                    .collect();
                let mut applied = Vec::with_capacity(due.len());
                for task in due {
                    let tr = transition::apply(&task, event_for(), now)?;
                    save_task(&tx, &tr.task)?;
                    applied.push(tr);
                }
                tx.commit()?;
                Ok(applied)
            })
            .await?;
        for tr in &transitions {
            self.journal.transition(tr).await;
        }
        Ok(transitions.into_iter().map(|tr| tr.task).collect())
    }
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn save_task(tx: &Transaction<'_>, task: &Task) -> Result<(), CoreError> {
    let body = serde_json::to_string(task)?;
    tx.execute(
        "INSERT INTO tasks (id, status, priority, category, phase, shard_key, created_at, updated_at, body)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
            status = excluded.status,
            priority = excluded.priority,
            phase = excluded.phase,
            updated_at = excluded.updated_at,
            body = excluded.body",
        params![
            task.id.to_string(),
            task.status.as_str(),
            task.priority,
            task.category,
            task.phase.as_str(),
            i64::from(shard_key(&task.category)),
            millis(task.created_at),
            millis(task.updated_at),
            body,
        ],
    )?;
    Ok(())
}

fn load_task(conn: &Connection, task_id: TaskId) -> Result<Option<Task>, CoreError> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM tasks WHERE id = ?1",
            params![task_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    body.map(|b| serde_json::from_str(&b).map_err(CoreError::from))
        .transpose()
}

/// Tasks matching a fixed SQL predicate, in claim order.
fn load_where(conn: &Connection, predicate: &str) -> Result<Vec<Task>, CoreError> {
    let sql = format!(
        "SELECT body FROM tasks WHERE {predicate} ORDER BY priority DESC, created_at ASC, id ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let bodies = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    bodies
        .iter()
        .map(|b| serde_json::from_str(b).map_err(CoreError::from))
        .collect()
}

fn latest_gate(
    conn: &Connection,
    task_id: TaskId,
    phase: Phase,
) -> Result<Option<QualityGateResult>, CoreError> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM gate_results WHERE task_id = ?1 AND phase = ?2
             ORDER BY seq DESC LIMIT 1",
            params![task_id.to_string(), phase.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    body.map(|b| serde_json::from_str(&b).map_err(CoreError::from))
        .transpose()
}

fn load_bodies<T: serde::de::DeserializeOwned>(
    conn: &Connection,
    sql: &str,
) -> Result<Vec<T>, CoreError> {
    let mut stmt = conn.prepare(sql)?;
    let bodies = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    bodies
        .iter()
        .map(|b| serde_json::from_str(b).map_err(CoreError::from))
        .collect()
}

#[async_trait]
impl TaskStore for SqliteStore {
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

        let _lock = self.locks.acquire(STORE_LOCK).await?;
        let row = task.clone();
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            save_task(&tx, &row)?;
            tx.commit()?;
            Ok(())
        })
        .await?;
        self.journal.created(&task).await;
        debug!(task_id = %id, category = %task.category, priority, "enqueued");
        Ok(id)
    }

    async fn claim(
        &self,
        worker_id: &WorkerId,
        filter: &ClaimFilter,
    ) -> Result<Option<Task>, CoreError> {
        let _lock = self.locks.acquire(STORE_LOCK).await?;
        let now = self.clock.now();
        let filter = filter.clone();
        let event = TaskEvent::Claim {
            worker_id: worker_id.clone(),
            token: self.ids.generate_claim_token(),
        };
        let tr = self
            .blocking(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let candidates = match filter.shard {
                    Some(shard) => load_where(
                        &tx,
                        &format!(
                            "status IN ('pending', 'stale') AND shard_key % {} = {}",
                            shard.count.max(1),
                            shard.index
                        ),
                    )?,
                    None => load_where(&tx, "status IN ('pending', 'stale')")?,
                };
                let Some(task) = candidates.into_iter().find(|t| filter.matches(t)) else {
                    return Ok(None);
                };
                let tr = transition::apply(&task, event, now)?;
                save_task(&tx, &tr.task)?;
                tx.commit()?;
                Ok(Some(tr))
            })
            .await?;

        let Some(tr) = tr else {
            return Ok(None);
        };
        self.journal.transition(&tr).await;
        Ok(Some(tr.task))
    }

    async fn mark_in_progress(&self, task_id: TaskId, token: ClaimToken) -> Result<Task, CoreError> {
        self.transition(task_id, TaskEvent::Progress { token }, None)
            .await
    }

    async fn heartbeat(&self, task_id: TaskId, token: ClaimToken) -> Result<(), CoreError> {
        self.transition(task_id, TaskEvent::Heartbeat { token }, None)
            .await
            .map(|_| ())
    }

    async fn record_gate_result(&self, result: &QualityGateResult) -> Result<(), CoreError> {
        let _lock = self.locks.acquire(STORE_LOCK).await?;
        let row = result.clone();
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if load_task(&tx, row.task_id)?.is_none() {
                return Err(CoreError::TaskNotFound(row.task_id));
            }
            tx.execute(
                "INSERT INTO gate_results (task_id, phase, verdict, evaluated_at, body)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    row.task_id.to_string(),
                    row.phase.as_str(),
                    row.verdict.to_string(),
                    millis(row.evaluated_at),
                    serde_json::to_string(&row)?,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await?;
        self.journal.gate(result).await;
        Ok(())
    }

    async fn latest_gate_result(
        &self,
        task_id: TaskId,
        phase: Phase,
    ) -> Result<Option<QualityGateResult>, CoreError> {
        self.blocking(move |conn| latest_gate(conn, task_id, phase))
            .await
    }

    async fn gate_results(&self, task_id: TaskId) -> Result<Vec<QualityGateResult>, CoreError> {
        self.blocking(move |conn| {
            let mut stmt =
                conn.prepare("SELECT body FROM gate_results WHERE task_id = ?1 ORDER BY seq ASC")?;
            let bodies = stmt
                .query_map(params![task_id.to_string()], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            bodies
                .iter()
                .map(|b| serde_json::from_str(b).map_err(CoreError::from))
                .collect()
        })
        .await
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
        self.transition(task_id, event, Some(gate.clone())).await
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
        self.transition(task_id, event, Some(gate.clone())).await
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
        self.transition(task_id, event, Some(gate.clone())).await
    }

    async fn fail(&self, task_id: TaskId, token: ClaimToken, error: &str) -> Result<Task, CoreError> {
        let event = TaskEvent::Fail {
            token,
            error: error.to_string(),
        };
        self.transition(task_id, event, None).await
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
        self.transition(task_id, event, None).await
    }

    async fn set_priority(&self, task_id: TaskId, priority: i32) -> Result<Task, CoreError> {
        self.transition(task_id, TaskEvent::Reprioritize { priority }, None)
            .await
    }

    async fn reap_stale(&self, threshold: Duration) -> Result<Vec<Task>, CoreError> {
        let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
        self.sweep(
            move |t, now| {
                t.status.is_leased() && t.heartbeat_at.is_none_or(|hb| now - hb > threshold)
            },
            || TaskEvent::Expire,
        )
        .await
    }

    async fn apply_age_boosts(&self, policy: &AgeBoostPolicy) -> Result<Vec<Task>, CoreError> {
        let after = chrono::Duration::from_std(policy.after).unwrap_or(chrono::Duration::MAX);
        let (step, max_priority) = (policy.step, policy.max_priority);
        self.sweep(
            move |t, now| {
                t.status == TaskStatus::Pending
                    && t.priority < max_priority
                    && now - t.updated_at >= after
            },
            move || TaskEvent::Boost { step, max_priority },
        )
        .await
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<Task>, CoreError> {
        self.blocking(move |conn| load_task(conn, task_id)).await
    }

    async fn list(&self, query: &TaskQuery) -> Result<Vec<Task>, CoreError> {
        let query = query.clone();
        self.blocking(move |conn| {
            let mut tasks: Vec<Task> = load_where(conn, "1 = 1")?
                .into_iter()
                .filter(|t| query.matches(t))
                .collect();
            if let Some(limit) = query.limit {
                tasks.truncate(limit);
            }
            Ok(tasks)
        })
        .await
    }

    async fn counts(&self) -> Result<StatusCounts, CoreError> {
        self.blocking(|conn| {
            let tasks = load_where(conn, "1 = 1")?;
            Ok(StatusCounts::from_tasks(&tasks))
        })
        .await
    }
}

#[async_trait]
impl BreakerStateStore for SqliteStore {
    async fn load_breaker(&self, key: &str) -> Result<Option<BreakerSnapshot>, CoreError> {
        let key = key.to_string();
        self.blocking(move |conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM breakers WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            body.map(|b| serde_json::from_str(&b).map_err(CoreError::from))
                .transpose()
        })
        .await
    }

    async fn save_breaker(&self, snapshot: &BreakerSnapshot) -> Result<(), CoreError> {
        let snapshot = snapshot.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO breakers (key, state, updated_at, body) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET
                    state = excluded.state,
                    updated_at = excluded.updated_at,
                    body = excluded.body",
                params![
                    snapshot.key,
                    snapshot.state.as_str(),
                    millis(snapshot.updated_at),
                    serde_json::to_string(&snapshot)?,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_breakers(&self) -> Result<Vec<BreakerSnapshot>, CoreError> {
        self.blocking(|conn| load_bodies(conn, "SELECT body FROM breakers ORDER BY key"))
            .await
    }
}

#[async_trait]
impl BudgetStore for SqliteStore {
    async fn load_ledger(&self, period_id: i64) -> Result<Option<BudgetLedger>, CoreError> {
        self.blocking(move |conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM budget_ledgers WHERE period_id = ?1",
                    params![period_id],
                    |row| row.get(0),
                )
                .optional()?;
            body.map(|b| serde_json::from_str(&b).map_err(CoreError::from))
                .transpose()
        })
        .await
    }

    async fn save_ledger(&self, ledger: &BudgetLedger) -> Result<(), CoreError> {
        let ledger = ledger.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO budget_ledgers (period_id, status, updated_at, body) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(period_id) DO UPDATE SET
                    status = excluded.status,
                    updated_at = excluded.updated_at,
                    body = excluded.body",
                params![
                    ledger.period_id,
                    ledger.status.as_str(),
                    millis(ledger.updated_at),
                    serde_json::to_string(&ledger)?,
                ],
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl WorkerRegistry for SqliteStore {
    async fn upsert_worker(&self, record: &WorkerRecord) -> Result<(), CoreError> {
        let _lock = self.locks.acquire(STORE_LOCK).await?;
        let row = record.clone();
        let changed = self
            .blocking(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let prev: Option<(String, i64)> = tx
                    .query_row(
                        "SELECT state, updated_at FROM workers WHERE worker_id = ?1",
                        params![row.worker_id.as_str()],
                        |r| Ok((r.get(0)?, r.get(1)?)),
                    )
                    .optional()?;
                // a heartbeat from an abandoned attempt may land late
                if prev.as_ref().is_some_and(|(_, at)| *at > millis(row.updated_at)) {
                    return Ok(false);
                }
                tx.execute(
                    "INSERT INTO workers (worker_id, state, updated_at, body) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(worker_id) DO UPDATE SET
                        state = excluded.state,
                        updated_at = excluded.updated_at,
                        body = excluded.body",
                    params![
                        row.worker_id.as_str(),
                        row.state.as_str(),
                        millis(row.updated_at),
                        serde_json::to_string(&row)?,
                    ],
                )?;
                tx.commit()?;
                Ok(prev.is_none_or(|(state, _)| state != row.state.as_str()))
            })
            .await?;
        if changed {
            self.journal.worker(record, record.updated_at).await;
        }
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>, CoreError> {
        self.blocking(|conn| load_bodies(conn, "SELECT body FROM workers ORDER BY worker_id"))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerState;
    use crate::domain::{
        BudgetStatus, EntityType, GateThresholds, MetricThreshold, MetricValue, Metrics,
        WorkerState,
    };
    use crate::impls::MemoryEventLog;
    use crate::ports::{EventQuery, ManualClock, SystemClock};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ))
    }

    fn open_file(dir: &TempDir, clock: Arc<dyn Clock>) -> SqliteStore {
        let guard = PathGuard::new(dir.path()).unwrap();
        let locks = LockManager::files(&guard, "locks", LockPolicy::default()).unwrap();
        SqliteStore::open(&guard, "warden.db", locks, clock).unwrap()
    }

    fn gate(task: &Task, coverage: f64, at: DateTime<Utc>) -> QualityGateResult {
        let mut thresholds = GateThresholds::new();
        thresholds.insert("coverage".into(), MetricThreshold::min(80.0));
        let mut metrics = Metrics::new();
        metrics.insert("coverage".into(), MetricValue::Number(coverage));
        QualityGateResult::evaluate(task.id, task.phase, &metrics, &thresholds, at)
    }

    #[tokio::test]
    async fn claim_order_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let clock = clock();
        let (low, high) = {
            let store = open_file(&dir, clock.clone());
            let low = store
                .enqueue(TaskSpec::new("a", "1").with_priority(1))
                .await
                .unwrap();
            clock.advance(Duration::from_secs(1));
            let high = store
                .enqueue(TaskSpec::new("a", "2").with_priority(9))
                .await
                .unwrap();
            (low, high)
        };

        let store = open_file(&dir, clock.clone());
        let w = WorkerId::new("w1");
        let first = store.claim(&w, &ClaimFilter::any()).await.unwrap().unwrap();
        let second = store.claim(&w, &ClaimFilter::any()).await.unwrap().unwrap();
        assert_eq!((first.id, second.id), (high, low));
        assert_eq!(first.status, TaskStatus::Claimed);
        assert_eq!(store.counts().await.unwrap().claimed, 2);
    }

    #[tokio::test]
    async fn set_priority_persists_and_reorders() {
        let dir = TempDir::new().unwrap();
        let clock = clock();
        let (old, newer) = {
            let store = open_file(&dir, clock.clone());
            let old = store.enqueue(TaskSpec::new("a", "1")).await.unwrap();
            clock.advance(Duration::from_secs(1));
            let newer = store.enqueue(TaskSpec::new("a", "2")).await.unwrap();
            store.set_priority(newer, 30).await.unwrap();
            (old, newer)
        };

        let store = open_file(&dir, clock.clone());
        assert_eq!(store.get(newer).await.unwrap().unwrap().priority, 30);
        let w = WorkerId::new("w1");
        let first = store.claim(&w, &ClaimFilter::any()).await.unwrap().unwrap();
        assert_eq!(first.id, newer);
        assert!(matches!(
            store.set_priority(newer, 0).await,
            Err(CoreError::InvalidTransition { .. })
        ));
        assert!(matches!(
            store.set_priority(TaskId::from_ulid(ulid::Ulid::new()), 0).await,
            Err(CoreError::TaskNotFound(_))
        ));
        assert_eq!(store.set_priority(old, 7).await.unwrap().priority, 7);
    }

    #[tokio::test]
    async fn two_handles_on_one_file_never_double_claim() {
        let dir = TempDir::new().unwrap();
        let a = Arc::new(open_file(&dir, Arc::new(SystemClock)));
        let b = Arc::new(open_file(&dir, Arc::new(SystemClock)));
        for i in 0..6 {
            a.enqueue(TaskSpec::new("a", format!("p{i}"))).await.unwrap();
        }

        let mut joins = Vec::new();
        for i in 0..12 {
            let store = if i % 2 == 0 { Arc::clone(&a) } else { Arc::clone(&b) };
            joins.push(tokio::spawn(async move {
                store
                    .claim(&WorkerId::new(format!("w{i}")), &ClaimFilter::any())
                    .await
                    .unwrap()
                    .map(|t| t.id)
            }));
        }
        let mut claimed = Vec::new();
        for j in joins {
            if let Some(id) = j.await.unwrap() {
                claimed.push(id);
            }
        }
        claimed.sort();
        claimed.dedup();
        assert_eq!(claimed.len(), 6);
    }

    #[tokio::test]
    async fn shard_filter_only_sees_its_partition() {
        let clock = clock();
        let store = SqliteStore::open_in_memory(clock.clone()).unwrap();
        for cat in ["alpha", "beta", "gamma", "delta", "epsilon"] {
            store.enqueue(TaskSpec::new(cat, "r")).await.unwrap();
        }

        let mut seen = 0;
        for index in 0..2 {
            let filter = ClaimFilter::any().with_shard(index, 2);
            while let Some(t) = store.claim(&WorkerId::new("w"), &filter).await.unwrap() {
                assert_eq!(t.shard(2), index);
                seen += 1;
            }
        }
        assert_eq!(seen, 5);
    }

    #[tokio::test]
    async fn gated_transitions_check_the_latest_result() {
        let clock = clock();
        let store = SqliteStore::open_in_memory(clock.clone()).unwrap();
        let id = store.enqueue(TaskSpec::new("a", "r")).await.unwrap();
        let t = store
            .claim(&WorkerId::new("w1"), &ClaimFilter::any())
            .await
            .unwrap()
            .unwrap();
        let token = t.claim_token.unwrap();

        let passed = gate(&t, 95.0, clock.now());
        store.record_gate_result(&passed).await.unwrap();
        let latest = store.latest_gate_result(id, t.phase).await.unwrap().unwrap();
        assert_eq!(latest, passed);

        let advanced = store.advance_phase(id, token, &passed).await.unwrap();
        assert_eq!(advanced.phase, Phase::Plan);
        assert_eq!(advanced.status, TaskStatus::Pending);
        assert_eq!(store.gate_results(id).await.unwrap().len(), 1);

        // lease is gone after advancing
        let err = store.heartbeat(id, token).await.unwrap_err();
        assert!(matches!(err, CoreError::StaleClaim { .. }));
    }

    #[tokio::test]
    async fn reaper_expires_silent_leases() {
        let clock = clock();
        let events = Arc::new(MemoryEventLog::new());
        let store = SqliteStore::open_in_memory(clock.clone())
            .unwrap()
            .with_events(events.clone());
        let id = store.enqueue(TaskSpec::new("a", "r")).await.unwrap();
        store
            .claim(&WorkerId::new("w1"), &ClaimFilter::any())
            .await
            .unwrap();

        clock.advance(Duration::from_secs(10));
        assert!(store.reap_stale(Duration::from_secs(30)).await.unwrap().is_empty());
        clock.advance(Duration::from_secs(30));
        let reaped = store.reap_stale(Duration::from_secs(30)).await.unwrap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].status, TaskStatus::Stale);
        assert_eq!(reaped[0].retry_count, 1);

        let names: Vec<String> = events
            .query(&EventQuery::for_entity(EntityType::Task, id))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.transition)
            .collect();
        assert_eq!(names, vec!["created", "claimed", "stale"]);
    }

    #[tokio::test]
    async fn shared_state_tables_round_trip() {
        let clock = clock();
        let store = SqliteStore::open_in_memory(clock.clone()).unwrap();
        let now = clock.now();

        let snapshot = BreakerSnapshot {
            key: "gate:plan".into(),
            state: BreakerState::Open,
            consecutive_failures: 3,
            trip_threshold: 3,
            cooldown_ms: 30_000,
            opened_at: Some(now),
            trial_started_at: None,
            updated_at: now,
        };
        store.save_breaker(&snapshot).await.unwrap();
        assert_eq!(store.load_breaker("gate:plan").await.unwrap(), Some(snapshot));
        assert_eq!(store.list_breakers().await.unwrap().len(), 1);

        let mut ledger = BudgetLedger::new(7, 100, now);
        ledger.consumed_units = 100;
        ledger.status = BudgetStatus::Exhausted;
        store.save_ledger(&ledger).await.unwrap();
        assert_eq!(store.load_ledger(7).await.unwrap(), Some(ledger));
        assert!(store.load_ledger(8).await.unwrap().is_none());

        let mut rec = WorkerRecord::new(WorkerId::new("w1"), 1, now);
        store.upsert_worker(&rec).await.unwrap();
        rec.state = WorkerState::Draining;
        store.upsert_worker(&rec).await.unwrap();
        let workers = store.list_workers().await.unwrap();
        assert_eq!(workers, vec![rec]);
    }
}
