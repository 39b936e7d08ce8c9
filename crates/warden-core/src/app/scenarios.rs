//! End-to-end scenarios across store, watchdogs, supervisor and pool.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use crate::app::builder::{Warden, WardenBuilder};
use crate::app::supervisor::ReviewOutcome;
use crate::app::worker_loop::{PoolCommand, PoolSettings};
use crate::config::WardenConfig;
use crate::domain::{
    DelegateOutput, EntityType, GateThresholds, MetricThreshold, MetricValue, Phase, Task,
    TaskSpec, TaskStatus, WorkerId,
};
use crate::error::CoreError;
use crate::ports::{ClaimFilter, Delegate, EventQuery, ManualClock};

fn coverage_gate(config: &mut WardenConfig, phases: &[Phase]) {
    let mut t = GateThresholds::new();
    t.insert("coverage".into(), MetricThreshold::min(80.0));
    for phase in phases {
        config.gates.insert(phase.as_str().to_string(), t.clone());
    }
}

fn fast_config() -> WardenConfig {
    let mut config = WardenConfig::default();
    config.worker.count = 3;
    config.worker.heartbeat_interval_ms = 50;
    config.worker.idle_backoff_min_ms = 5;
    config.worker.idle_backoff_max_ms = 50;
    config.worker.execution_timeout_secs = 5;
    config.watchdog.interval_ms = 50;
    config.watchdog.stale_threshold_ms = 1_000;
    config.age_boost.enabled = false;
    config
}

async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

async fn task_transitions(warden: &Warden, task: &Task) -> Vec<String> {
    let report = warden.status().task(task.id).await.unwrap();
    assert!(
        report.history.windows(2).all(|w| w[0].seq < w[1].seq),
        "history out of order"
    );
    report
        .history
        .into_iter()
        .filter(|e| e.entity_type == EntityType::Task)
        .map(|e| e.transition)
        .collect()
}

/// Stale reclaim, gate rejection and retry exhaustion of a single task.
#[tokio::test]
async fn crash_reject_and_exhaust() {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    ));
    let mut config = WardenConfig::default();
    coverage_gate(&mut config, &[Phase::Brainstorm]);
    let warden = WardenBuilder::new(config)
        .in_memory()
        .with_clock(clock.clone())
        .build()
        .unwrap();
    let store = warden.store();

    let t1 = warden
        .enqueue(
            TaskSpec::new("backend", "plans/t1.md")
                .with_priority(5)
                .with_max_retries(2),
        )
        .await
        .unwrap();

    // W1 claims, then goes silent
    let claimed = store
        .claim(&WorkerId::new("w1"), &ClaimFilter::any())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, t1);
    assert_eq!(claimed.status, TaskStatus::Claimed);

    clock.advance(Duration::from_secs(31));
    assert_eq!(warden.watchdog().tick().await.unwrap().reaped, 1);
    let stale = store.get(t1).await.unwrap().unwrap();
    assert_eq!(stale.status, TaskStatus::Stale);
    assert_eq!(stale.retry_count, 1);

    // W2 picks it up and reports coverage below the gate
    let w2 = store
        .claim(&WorkerId::new("w2"), &ClaimFilter::any())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(w2.status, TaskStatus::Claimed);
    assert_eq!(w2.retry_count, 1);

    let low = DelegateOutput::success().with_metric("coverage", MetricValue::Number(60.0));
    let outcome = warden.supervisor().review(&w2, &low).await.unwrap();
    let ReviewOutcome::Rejected { task, reasons } = outcome.clone() else {
        panic!("expected a rejection, got {outcome:?}");
    };
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.phase, Phase::Brainstorm);
    assert_eq!(task.retry_count, 2);
    assert_eq!(reasons[0].metric, "coverage");

    // The next rejection would exceed max_retries
    let w3 = store
        .claim(&WorkerId::new("w3"), &ClaimFilter::any())
        .await
        .unwrap()
        .unwrap();
    let outcome = warden.supervisor().review(&w3, &low).await.unwrap();
    let ReviewOutcome::Exhausted(failed) = outcome.clone() else {
        panic!("expected exhaustion, got {outcome:?}");
    };
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.retry_count, 2);
    assert!(failed.last_error.as_deref().unwrap().contains("coverage"));
    assert!(matches!(
        outcome.into_result(),
        Err(CoreError::RetriesExhausted { task_id }) if task_id == t1
    ));

    assert!(
        store
            .claim(&WorkerId::new("w4"), &ClaimFilter::any())
            .await
            .unwrap()
            .is_none()
    );

    assert_eq!(
        task_transitions(&warden, &failed).await,
        vec!["created", "claimed", "stale", "claimed", "rejected", "claimed", "failed"]
    );
    let gates = warden.store().gate_results(t1).await.unwrap();
    assert_eq!(gates.len(), 2);
    assert!(gates.iter().all(|g| !g.passed()));
}

struct Passing {
    calls: AtomicUsize,
    units: u64,
}

impl Passing {
    fn new(units: u64) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            units,
        }
    }
}

#[async_trait]
impl Delegate for Passing {
    async fn execute(&self, _task: &Task) -> Result<DelegateOutput, CoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(DelegateOutput::success()
            .with_metric("coverage", MetricValue::Number(92.0))
            .with_units(self.units))
    }
}

/// A file-backed pool walks every task through every phase exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_completes_every_phase_on_disk() {
    let dir = TempDir::new().unwrap();
    let mut config = fast_config();
    config.store.state_dir = dir.path().to_path_buf();
    coverage_gate(&mut config, &Phase::ALL);

    let delegate = Arc::new(Passing::new(1));
    let warden = WardenBuilder::new(config.clone())
        .register_delegate("build", delegate.clone())
        .unwrap()
        .build()
        .unwrap();

    let mut ids = Vec::new();
    for i in 0..4 {
        ids.push(
            warden
                .enqueue(TaskSpec::new("build", format!("plans/{i}.md")))
                .await
                .unwrap(),
        );
    }

    let pool = warden.spawn_workers(PoolSettings::from_config(&config.worker));
    let (w, n) = (&warden, ids.len());
    wait_until("all tasks completed", move || async move {
        w.store().counts().await.unwrap().completed == n
    })
    .await;
    pool.shutdown().await;

    assert_eq!(delegate.calls.load(Ordering::SeqCst), ids.len() * Phase::ALL.len());

    let mut expected = vec!["created".to_string()];
    for phase in Phase::ALL {
        expected.push("claimed".into());
        expected.push("in_progress".into());
        expected.push(if phase.is_last() { "completed" } else { "phase_advanced" }.into());
    }
    for id in ids {
        let task = warden.store().get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.phase, Phase::Status);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task_transitions(&warden, &task).await, expected);
    }

    let pool_report = warden.status().pool().await.unwrap();
    assert!(pool_report.workers.iter().all(|w| w.current_task_id.is_none()));
}

/// Exhausting the budget stops new claims until an operator reset.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_budget_pauses_claims() {
    let mut config = fast_config();
    config.worker.count = 1;
    config.budget.limit_units = 10;

    let warden = WardenBuilder::new(config.clone())
        .in_memory()
        .register_delegate("build", Arc::new(Passing::new(10)))
        .unwrap()
        .build()
        .unwrap();
    let first = warden.enqueue(TaskSpec::new("build", "a")).await.unwrap();

    let pool = warden.spawn_workers(PoolSettings::from_config(&config.worker));
    let w = &warden;
    wait_until("budget pause", move || async move {
        w.control().current() == PoolCommand::Pause
    })
    .await;
    // the in-flight attempt finishes and advances
    wait_until("first phase advanced", move || async move {
        w.store().get(first).await.unwrap().unwrap().phase == Phase::Spec
    })
    .await;

    let second = warden.enqueue(TaskSpec::new("build", "b")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let counts = warden.store().counts().await.unwrap();
    assert_eq!(counts.claimed + counts.in_progress, 0);
    assert_eq!(
        warden.store().get(second).await.unwrap().unwrap().status,
        TaskStatus::Pending
    );
    assert!(warden.budget().claims_blocked().await.unwrap());

    warden.budget().reset().await.unwrap();
    assert_eq!(warden.control().current(), PoolCommand::Run);
    pool.shutdown().await;
}

fn shared_budget_config(dir: &TempDir) -> WardenConfig {
    let mut config = fast_config();
    config.worker.count = 1;
    config.budget.limit_units = 10;
    config.store.state_dir = dir.path().to_path_buf();
    config
}

/// A worker process paused by its own usage resumes once another process
/// resets the shared ledger.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reset_from_another_process_resumes_workers() {
    let dir = TempDir::new().unwrap();
    let config = shared_budget_config(&dir);

    let delegate = Arc::new(Passing::new(10));
    let workers = WardenBuilder::new(config.clone())
        .register_delegate("build", delegate.clone())
        .unwrap()
        .build()
        .unwrap();
    let operator = WardenBuilder::new(config.clone()).build().unwrap();

    let first = operator.enqueue(TaskSpec::new("build", "a")).await.unwrap();
    let pool = workers.spawn_workers(PoolSettings::from_config(&config.worker));
    let (w, op) = (&workers, &operator);
    wait_until("budget pause", move || async move {
        w.control().current() == PoolCommand::Pause
    })
    .await;
    wait_until("first phase advanced", move || async move {
        op.store().get(first).await.unwrap().unwrap().phase == Phase::Spec
    })
    .await;
    assert_eq!(delegate.calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(delegate.calls.load(Ordering::SeqCst), 1);

    operator.budget().reset().await.unwrap();
    // the worker process's own watchdog never saw the reset
    wait_until("work after reset", move || async move {
        op.budget().ledger().await.unwrap().consumed_units == 10
    })
    .await;
    assert_eq!(delegate.calls.load(Ordering::SeqCst), 2);
    pool.shutdown().await;
}

/// Workers of a process that did not exhaust the budget stay paused without
/// flapping their recorded state.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ledger_exhausted_elsewhere_keeps_workers_paused() {
    let dir = TempDir::new().unwrap();
    let config = shared_budget_config(&dir);

    let delegate = Arc::new(Passing::new(1));
    let workers = WardenBuilder::new(config.clone())
        .register_delegate("build", delegate.clone())
        .unwrap()
        .build()
        .unwrap();
    let operator = WardenBuilder::new(config.clone()).build().unwrap();
    operator.budget().record_usage(10).await.unwrap();

    let id = operator.enqueue(TaskSpec::new("build", "a")).await.unwrap();
    let pool = workers.spawn_workers(PoolSettings::from_config(&config.worker));
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(workers.control().current(), PoolCommand::Run);
    assert_eq!(delegate.calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        operator.store().get(id).await.unwrap().unwrap().status,
        TaskStatus::Pending
    );
    let states: Vec<String> = operator
        .events()
        .query(&EventQuery {
            entity_type: Some(EntityType::Worker),
            ..EventQuery::default()
        })
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.transition)
        .collect();
    assert_eq!(states, vec!["running", "paused"]);

    operator.budget().reset().await.unwrap();
    let calls = &delegate.calls;
    wait_until("claim after reset", move || async move {
        calls.load(Ordering::SeqCst) >= 1
    })
    .await;
    pool.shutdown().await;
}
