//! Supervisor - フェーズゲートの判定と遷移
//!
//! # フロー
//! 1. `gate-<task_id>` ロックを取得（同じタスクの並行評価を直列化）
//! 2. delegate が失敗を報告したら `fail`
//! 3. breaker `gate:<phase>` 越しに QualityGate を評価し、結果を記録
//! 4. pass: 最終フェーズなら `complete`、それ以外は `advance_phase`
//! 5. reject: `reject`（retry を消費、上限なら failed）

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::breaker::BreakerRegistry;
use crate::domain::{
    DelegateOutput, GateThresholds, Metrics, Phase, QualityGateResult, RejectionReason, Task,
    TaskStatus,
};
use crate::error::CoreError;
use crate::lock::LockManager;
use crate::ports::{Clock, TaskStore};

/// Evaluates a phase's metrics. Implementations may call out to external
/// checkers; the supervisor wraps every call in a circuit breaker.
#[async_trait]
pub trait QualityGate: Send + Sync {
    async fn evaluate(
        &self,
        task: &Task,
        metrics: &Metrics,
        now: DateTime<Utc>,
    ) -> Result<QualityGateResult, CoreError>;
}

/// Thresholds from config, one table per phase. Phases without a table pass.
#[derive(Debug, Clone, Default)]
pub struct ThresholdGate {
    thresholds: BTreeMap<Phase, GateThresholds>,
}

impl ThresholdGate {
    pub fn new(thresholds: BTreeMap<Phase, GateThresholds>) -> Self {
        Self { thresholds }
    }
}

#[async_trait]
impl QualityGate for ThresholdGate {
    async fn evaluate(
        &self,
        task: &Task,
        metrics: &Metrics,
        now: DateTime<Utc>,
    ) -> Result<QualityGateResult, CoreError> {
        let empty = GateThresholds::new();
        let thresholds = self.thresholds.get(&task.phase).unwrap_or(&empty);
        Ok(QualityGateResult::evaluate(
            task.id, task.phase, metrics, thresholds, now,
        ))
    }
}

/// What the supervisor did with a finished attempt.
#[derive(Debug, Clone)]
pub enum ReviewOutcome {
    /// Gate passed at the last phase.
    Completed(Task),
    /// Gate passed, task is pending at the next phase.
    Advanced(Task),
    /// Gate rejected, task is pending at the same phase.
    Rejected {
        task: Task,
        reasons: Vec<RejectionReason>,
    },
    /// Delegate reported failure, a retry remains.
    Requeued(Task),
    /// Retries exhausted, task is terminally failed.
    Exhausted(Task),
}

impl ReviewOutcome {
    pub fn task(&self) -> &Task {
        match self {
            ReviewOutcome::Completed(t)
            | ReviewOutcome::Advanced(t)
            | ReviewOutcome::Requeued(t)
            | ReviewOutcome::Exhausted(t) => t,
            ReviewOutcome::Rejected { task, .. } => task,
        }
    }

    /// Lifecycle outcomes as errors, for callers that only care about success.
    pub fn into_result(self) -> Result<Task, CoreError> {
        match self {
            ReviewOutcome::Completed(t) | ReviewOutcome::Advanced(t) | ReviewOutcome::Requeued(t) => {
                Ok(t)
            }
            ReviewOutcome::Rejected { task, reasons } => Err(CoreError::GateRejected {
                task_id: task.id,
                phase: task.phase,
                reasons,
            }),
            ReviewOutcome::Exhausted(t) => Err(CoreError::RetriesExhausted { task_id: t.id }),
        }
    }
}

pub struct Supervisor {
    store: Arc<dyn TaskStore>,
    gate: Arc<dyn QualityGate>,
    breakers: Arc<BreakerRegistry>,
    locks: LockManager,
    clock: Arc<dyn Clock>,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        gate: Arc<dyn QualityGate>,
        breakers: Arc<BreakerRegistry>,
        locks: LockManager,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            gate,
            breakers,
            locks,
            clock,
        }
    }

    /// Review the attempt `output` made on the leased `task`.
    ///
    /// `BreakerOpen` leaves the task untouched so the caller can retry the
    /// review while it still holds the lease.
    pub async fn review(
        &self,
        task: &Task,
        output: &DelegateOutput,
    ) -> Result<ReviewOutcome, CoreError> {
        let token = task.claim_token.ok_or(CoreError::StaleClaim {
            task_id: task.id,
            token: None,
        })?;
        let _lock = self.locks.acquire(&format!("gate-{}", task.id)).await?;

        let current = self
            .store
            .get(task.id)
            .await?
            .ok_or(CoreError::TaskNotFound(task.id))?;
        if current.status == TaskStatus::Failed {
            return Err(CoreError::RetriesExhausted { task_id: task.id });
        }
        if !current.is_held_by(token) {
            return Err(CoreError::StaleClaim {
                task_id: task.id,
                token: Some(token),
            });
        }

        if !output.success {
            let error = output
                .error
                .clone()
                .unwrap_or_else(|| "delegate reported failure".to_string());
            let failed = self.store.fail(task.id, token, &error).await?;
            warn!(task_id = %task.id, retry_count = failed.retry_count, %error, "attempt failed");
            return Ok(if failed.status == TaskStatus::Failed {
                ReviewOutcome::Exhausted(failed)
            } else {
                ReviewOutcome::Requeued(failed)
            });
        }

        let gate = Arc::clone(&self.gate);
        let now = self.clock.now();
        let result = self
            .breakers
            .call(&format!("gate:{}", current.phase), || async move {
                gate.evaluate(&current, &output.metrics, now).await
            })
            .await?;
        self.store.record_gate_result(&result).await?;

        if result.passed() {
            if task.phase.is_last() {
                let done = self.store.complete(task.id, token, &result).await?;
                info!(task_id = %task.id, phase = %task.phase, "task completed");
                Ok(ReviewOutcome::Completed(done))
            } else {
                let next = self.store.advance_phase(task.id, token, &result).await?;
                info!(task_id = %task.id, from = %task.phase, to = %next.phase, "phase advanced");
                Ok(ReviewOutcome::Advanced(next))
            }
        } else {
            let rejected = self.store.reject(task.id, token, &result).await?;
            let reasons = result.reasons;
            warn!(
                task_id = %task.id,
                phase = %task.phase,
                retry_count = rejected.retry_count,
                reasons = ?reasons.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "gate rejected"
            );
            if rejected.status == TaskStatus::Failed {
                Ok(ReviewOutcome::Exhausted(rejected))
            } else {
                Ok(ReviewOutcome::Rejected {
                    task: rejected,
                    reasons,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, BreakerState};
    use crate::domain::{MetricThreshold, MetricValue, TaskSpec, WorkerId};
    use crate::impls::MemoryStore;
    use crate::lock::LockPolicy;
    use crate::ports::{ClaimFilter, ManualClock};
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        breakers: Arc<BreakerRegistry>,
        supervisor: Supervisor,
    }

    fn coverage_gate() -> ThresholdGate {
        let mut t = GateThresholds::new();
        t.insert("coverage".into(), MetricThreshold::min(80.0));
        let mut by_phase = BTreeMap::new();
        for phase in Phase::ALL {
            by_phase.insert(phase, t.clone());
        }
        ThresholdGate::new(by_phase)
    }

    fn fixture_with(gate: Arc<dyn QualityGate>) -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::default(), clock.clone()));
        let supervisor = Supervisor::new(
            store.clone(),
            gate,
            breakers.clone(),
            LockManager::in_process(LockPolicy::default()),
            clock.clone(),
        );
        Fixture {
            clock,
            store,
            breakers,
            supervisor,
        }
    }

    async fn claimed(f: &Fixture, spec: TaskSpec) -> Task {
        f.store.enqueue(spec).await.unwrap();
        f.store
            .claim(&WorkerId::new("w1"), &ClaimFilter::any())
            .await
            .unwrap()
            .unwrap()
    }

    fn coverage(v: f64) -> DelegateOutput {
        DelegateOutput::success().with_metric("coverage", MetricValue::Number(v))
    }

    #[tokio::test]
    async fn pass_advances_until_last_phase_completes() {
        let f = fixture_with(Arc::new(coverage_gate()));
        let mut task = claimed(&f, TaskSpec::new("a", "r")).await;

        let mut phases = vec![task.phase];
        loop {
            match f.supervisor.review(&task, &coverage(95.0)).await.unwrap() {
                ReviewOutcome::Advanced(next) => {
                    assert!(next.phase > *phases.last().unwrap());
                    phases.push(next.phase);
                    task = f
                        .store
                        .claim(&WorkerId::new("w1"), &ClaimFilter::any())
                        .await
                        .unwrap()
                        .unwrap();
                }
                ReviewOutcome::Completed(done) => {
                    assert_eq!(done.status, TaskStatus::Completed);
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(phases, Phase::ALL.to_vec());
    }

    #[tokio::test]
    async fn reject_requeues_with_reasons_then_exhausts() {
        let f = fixture_with(Arc::new(coverage_gate()));
        let task = claimed(&f, TaskSpec::new("a", "r").with_max_retries(1)).await;

        let outcome = f.supervisor.review(&task, &coverage(60.0)).await.unwrap();
        let ReviewOutcome::Rejected { task: requeued, reasons } = outcome else {
            panic!("expected rejection");
        };
        assert_eq!(requeued.status, TaskStatus::Pending);
        assert_eq!(requeued.retry_count, 1);
        assert_eq!(reasons.len(), 1);
        assert_eq!(reasons[0].metric, "coverage");

        let again = f
            .store
            .claim(&WorkerId::new("w2"), &ClaimFilter::any())
            .await
            .unwrap()
            .unwrap();
        let outcome = f.supervisor.review(&again, &coverage(60.0)).await.unwrap();
        assert!(matches!(outcome, ReviewOutcome::Exhausted(ref t) if t.status == TaskStatus::Failed));
        let err = outcome.into_result().unwrap_err();
        assert!(matches!(err, CoreError::RetriesExhausted { .. }));

        // no further gate attempts for a failed task
        let err = f.supervisor.review(&again, &coverage(99.0)).await.unwrap_err();
        assert!(matches!(err, CoreError::RetriesExhausted { .. }));
        assert_eq!(f.store.gate_results(task.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn delegate_failure_consumes_a_retry_without_gate() {
        let f = fixture_with(Arc::new(coverage_gate()));
        let task = claimed(&f, TaskSpec::new("a", "r")).await;

        let outcome = f
            .supervisor
            .review(&task, &DelegateOutput::failure("tool crashed"))
            .await
            .unwrap();
        let ReviewOutcome::Requeued(t) = outcome else {
            panic!("expected requeue");
        };
        assert_eq!(t.last_error.as_deref(), Some("tool crashed"));
        assert!(f.store.gate_results(task.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_lease_is_refused() {
        let f = fixture_with(Arc::new(coverage_gate()));
        let task = claimed(&f, TaskSpec::new("a", "r")).await;
        f.clock.advance(Duration::from_secs(120));
        f.store.reap_stale(Duration::from_secs(30)).await.unwrap();

        let err = f.supervisor.review(&task, &coverage(95.0)).await.unwrap_err();
        assert!(matches!(err, CoreError::StaleClaim { .. }));
    }

    struct FlakyGate {
        calls: AtomicU32,
    }

    #[async_trait]
    impl QualityGate for FlakyGate {
        async fn evaluate(
            &self,
            _task: &Task,
            _metrics: &Metrics,
            _now: DateTime<Utc>,
        ) -> Result<QualityGateResult, CoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CoreError::Other("checker unavailable".into()))
        }
    }

    #[tokio::test]
    async fn gate_outage_trips_the_breaker_and_leaves_task_leased() {
        let flaky = Arc::new(FlakyGate {
            calls: AtomicU32::new(0),
        });
        let f = fixture_with(flaky.clone());
        let task = claimed(&f, TaskSpec::new("a", "r")).await;

        for _ in 0..3 {
            assert!(f.supervisor.review(&task, &coverage(95.0)).await.is_err());
        }
        let err = f.supervisor.review(&task, &coverage(95.0)).await.unwrap_err();
        assert!(matches!(err, CoreError::BreakerOpen { .. }));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            f.breakers.state("gate:brainstorm").await.unwrap(),
            BreakerState::Open
        );

        let still = f.store.get(task.id).await.unwrap().unwrap();
        assert_eq!(still.status, TaskStatus::Claimed);
        assert_eq!(still.retry_count, 0);
    }
}
