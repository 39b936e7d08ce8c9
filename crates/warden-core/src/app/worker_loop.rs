//! WorkerPool - タスク実行ループ
//!
//! # フロー（1 ワーカー）
//! 1. PoolControl を確認（Pause なら待機、Drain なら終了）
//!    予算による Pause は共有 ledger を定期的に見直して解除する
//! 2. 予算が exhausted なら claim しない（状態は Paused のまま）
//! 3. TaskStore::claim（なければ idle backoff）
//! 4. mark_in_progress → delegate 実行（breaker `delegate:<name>` + timeout）
//!    と heartbeat を並走。heartbeat が StaleClaim を返したら即座に放棄
//! 5. 使用量を BudgetWatchdog に報告し、Supervisor にレビューを依頼
//!
//! Pause は協調的で、実行中のタスクは最後まで走る。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::app::budget_loop::BudgetWatchdog;
use crate::app::runtime::Runtime;
use crate::app::supervisor::{ReviewOutcome, Supervisor};
use crate::breaker::BreakerRegistry;
use crate::config::WorkerConfig;
use crate::domain::{
    ClaimToken, DelegateOutput, Task, TaskId, WorkerId, WorkerRecord, WorkerState,
};
use crate::error::CoreError;
use crate::ports::{ClaimFilter, Clock, TaskStore, WorkerRegistry};

/// Pool-wide command carried by [`PoolControl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolCommand {
    Run,
    Pause,
    /// Stop claiming and exit once idle. Not reversible.
    Drain,
}

/// Pause / resume / drain channel shared by every worker of a process.
#[derive(Clone)]
pub struct PoolControl {
    tx: Arc<watch::Sender<PoolCommand>>,
}

impl Default for PoolControl {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolControl {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(PoolCommand::Run);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> PoolCommand {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PoolCommand> {
        self.tx.subscribe()
    }

    pub fn pause(&self) {
        self.set(PoolCommand::Pause);
    }

    pub fn resume(&self) {
        self.set(PoolCommand::Run);
    }

    pub fn drain(&self) {
        self.set(PoolCommand::Drain);
    }

    fn set(&self, next: PoolCommand) {
        self.tx.send_if_modified(|current| {
            if *current == PoolCommand::Drain || *current == next {
                return false;
            }
            info!(from = ?*current, to = ?next, "pool control");
            *current = next;
            true
        });
    }
}

/// Everything a worker needs, shared by the whole pool.
pub struct WorkerContext {
    pub store: Arc<dyn TaskStore>,
    pub workers: Arc<dyn WorkerRegistry>,
    pub runtime: Arc<Runtime>,
    pub supervisor: Arc<Supervisor>,
    pub breakers: Arc<BreakerRegistry>,
    pub budget: Arc<BudgetWatchdog>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub count: usize,
    pub shard_count: u32,
    pub heartbeat_interval: Duration,
    pub idle_backoff_min: Duration,
    pub idle_backoff_max: Duration,
    pub execution_timeout: Duration,
    pub review_retry_limit: u32,
    /// Category / phase restriction applied on top of the shard.
    pub filter: ClaimFilter,
    pub id_prefix: String,
}

impl PoolSettings {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            count: config.count,
            shard_count: config.shard_count.max(1),
            heartbeat_interval: config.heartbeat_interval(),
            idle_backoff_min: Duration::from_millis(config.idle_backoff_min_ms),
            idle_backoff_max: Duration::from_millis(config.idle_backoff_max_ms),
            execution_timeout: config.execution_timeout(),
            review_retry_limit: config.review_retry_limit.max(1),
            filter: ClaimFilter::any(),
            id_prefix: format!("worker-{}", std::process::id()),
        }
    }

    pub fn with_filter(mut self, filter: ClaimFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.id_prefix = prefix.into();
        self
    }
}

/// Worker group handle.
/// - `control` で pause / resume / drain
/// - `join()` で全ワーカーの終了を待てる
pub struct WorkerPool {
    control: PoolControl,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `settings.count` workers, worker `i` on shard `i % shard_count`.
    pub fn spawn(ctx: Arc<WorkerContext>, settings: PoolSettings, control: PoolControl) -> Self {
        let settings = Arc::new(settings);
        let mut joins = Vec::with_capacity(settings.count);
        for i in 0..settings.count {
            let shard = u32::try_from(i).unwrap_or(u32::MAX) % settings.shard_count;
            let mut filter = settings.filter.clone();
            if settings.shard_count > 1 {
                filter = filter.with_shard(shard, settings.shard_count);
            }
            let id = WorkerId::new(format!("{}-{i}", settings.id_prefix));
            let worker = Worker {
                record: WorkerRecord::new(id, shard, ctx.clock.now()),
                ctx: Arc::clone(&ctx),
                settings: Arc::clone(&settings),
                filter,
                control: control.subscribe(),
            };
            joins.push(tokio::spawn(worker.run()));
        }
        info!(workers = settings.count, shards = settings.shard_count, "worker pool started");
        Self { control, joins }
    }

    pub fn control(&self) -> &PoolControl {
        &self.control
    }

    /// Wait for every worker to exit (after a drain).
    pub async fn join(self) {
        for j in self.joins {
            if let Err(e) = j.await {
                error!(error = %e, "worker task panicked");
            }
        }
    }

    /// Drain and wait.
    pub async fn shutdown(self) {
        self.control.drain();
        self.join().await;
    }
}

enum Attempt {
    Finished(Result<DelegateOutput, CoreError>),
    LeaseLost(CoreError),
}

struct Worker {
    ctx: Arc<WorkerContext>,
    settings: Arc<PoolSettings>,
    filter: ClaimFilter,
    record: WorkerRecord,
    control: watch::Receiver<PoolCommand>,
}

impl Worker {
    async fn run(mut self) {
        let id = self.record.worker_id.clone();
        self.publish().await;
        let mut backoff = self.settings.idle_backoff_min;

        loop {
            let command = *self.control.borrow_and_update();
            match command {
                PoolCommand::Drain => break,
                PoolCommand::Pause => {
                    self.set_state(WorkerState::Paused).await;
                    if !self.wait_resume().await {
                        break;
                    }
                    continue;
                }
                PoolCommand::Run => {}
            }

            match self.ctx.budget.claims_blocked().await {
                Ok(true) => {
                    self.set_state(WorkerState::Paused).await;
                    debug!(worker_id = %id, "budget exhausted, not claiming");
                    self.idle(self.settings.idle_backoff_max).await;
                    continue;
                }
                Ok(false) => self.set_state(WorkerState::Running).await,
                Err(e) => {
                    warn!(worker_id = %id, error = %e, "budget check failed");
                    self.idle(backoff).await;
                    continue;
                }
            }

            match self.ctx.store.claim(&id, &self.filter).await {
                Ok(Some(task)) => {
                    backoff = self.settings.idle_backoff_min;
                    self.process(task).await;
                }
                Ok(None) => {
                    debug!(worker_id = %id, ?backoff, "no task available");
                    self.idle(backoff).await;
                    backoff = (backoff * 2).min(self.settings.idle_backoff_max);
                }
                Err(e) => {
                    warn!(worker_id = %id, error = %e, retryable = e.is_retryable(), "claim failed");
                    self.idle(backoff).await;
                    backoff = (backoff * 2).min(self.settings.idle_backoff_max);
                }
            }
        }

        self.set_state(WorkerState::Stopped).await;
        info!(worker_id = %id, "worker stopped");
    }

    /// Wait out a pause. Returns false once the control channel is gone.
    ///
    /// A pause issued by the budget watchdog may be lifted by another
    /// process (reset, period rollover), so the shared ledger is polled
    /// instead of waiting for a local command only.
    async fn wait_resume(&mut self) -> bool {
        if !self.ctx.budget.paused_pool() {
            return self.control.changed().await.is_ok();
        }
        tokio::select! {
            changed = self.control.changed() => changed.is_ok(),
            _ = tokio::time::sleep(self.settings.idle_backoff_max) => {
                if let Err(e) = self.ctx.budget.tick().await {
                    warn!(worker_id = %self.record.worker_id, error = %e, "budget check failed");
                }
                true
            }
        }
    }

    /// Sleep, waking early on a control change.
    async fn idle(&mut self, delay: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.control.changed() => {}
        }
    }

    async fn set_state(&mut self, state: WorkerState) {
        if self.record.state != state {
            self.record.state = state;
            self.publish().await;
        }
    }

    async fn publish(&mut self) {
        self.record.updated_at = self.ctx.clock.now();
        if let Err(e) = self.ctx.workers.upsert_worker(&self.record).await {
            warn!(worker_id = %self.record.worker_id, error = %e, "failed to record worker state");
        }
    }

    async fn process(&mut self, task: Task) {
        let Some(token) = task.claim_token else {
            return;
        };
        self.record.current_task_id = Some(task.id);
        self.publish().await;
        info!(worker_id = %self.record.worker_id, task_id = %task.id, phase = %task.phase, "claimed");

        if let Err(e) = self.attempt(task, token).await {
            match e {
                CoreError::StaleClaim { task_id, .. } => {
                    warn!(worker_id = %self.record.worker_id, %task_id, "lease lost, abandoning task");
                }
                other => {
                    error!(worker_id = %self.record.worker_id, error = %other, "task attempt failed");
                }
            }
        }

        self.record.current_task_id = None;
        self.publish().await;
    }

    async fn attempt(&self, task: Task, token: ClaimToken) -> Result<(), CoreError> {
        let task = self.ctx.store.mark_in_progress(task.id, token).await?;

        let delegate = match self.ctx.runtime.delegate_name(&task) {
            Ok(name) => name,
            Err(e) => {
                self.ctx.store.fail(task.id, token, &e.to_string()).await?;
                return Err(e);
            }
        };

        let work = self.execute(&delegate, &task);
        let alive = keep_alive(
            Arc::clone(&self.ctx),
            self.record.clone(),
            task.id,
            token,
            self.settings.heartbeat_interval,
        );
        let attempt = tokio::select! {
            biased;
            res = work => Attempt::Finished(res),
            lost = alive => Attempt::LeaseLost(lost),
        };

        let output = match attempt {
            Attempt::LeaseLost(e) => return Err(e),
            Attempt::Finished(Ok(output)) => output,
            Attempt::Finished(Err(CoreError::BreakerOpen { key, retry_after })) => {
                warn!(task_id = %task.id, %key, ?retry_after, "delegate breaker open, releasing");
                self.ctx
                    .store
                    .release(task.id, token, &format!("breaker `{key}` open"))
                    .await?;
                return Ok(());
            }
            Attempt::Finished(Err(e)) => DelegateOutput::failure(e.to_string()),
        };

        if output.units_consumed > 0
            && let Err(e) = self.ctx.budget.record_usage(output.units_consumed).await
        {
            warn!(task_id = %task.id, error = %e, "failed to record budget usage");
        }

        let review = self.review(&task, token, &output);
        let alive = keep_alive(
            Arc::clone(&self.ctx),
            self.record.clone(),
            task.id,
            token,
            self.settings.heartbeat_interval,
        );
        tokio::select! {
            biased;
            res = review => res,
            lost = alive => Err(lost),
        }
    }

    /// Delegate call under its breaker, bounded by the execution timeout.
    async fn execute(&self, delegate: &str, task: &Task) -> Result<DelegateOutput, CoreError> {
        let timeout = self.settings.execution_timeout;
        let runtime = &self.ctx.runtime;
        self.ctx
            .breakers
            .call(&format!("delegate:{delegate}"), || async move {
                match tokio::time::timeout(timeout, runtime.execute(delegate, task)).await {
                    Ok(res) => res,
                    Err(_) => Err(CoreError::Timeout(format!("delegate `{delegate}`"))),
                }
            })
            .await
    }

    /// Hand the attempt to the supervisor, retrying while its gate breaker is open.
    async fn review(
        &self,
        task: &Task,
        token: ClaimToken,
        output: &DelegateOutput,
    ) -> Result<(), CoreError> {
        let limit = self.settings.review_retry_limit;
        for attempt in 1..=limit {
            match self.ctx.supervisor.review(task, output).await {
                Ok(outcome) => {
                    log_outcome(&self.record.worker_id, &outcome);
                    return Ok(());
                }
                Err(CoreError::BreakerOpen { key, retry_after }) if attempt < limit => {
                    debug!(task_id = %task.id, %key, attempt, ?retry_after, "gate breaker open, waiting");
                    tokio::time::sleep(retry_after.min(self.settings.idle_backoff_max)).await;
                }
                Err(CoreError::BreakerOpen { key, .. }) => {
                    warn!(task_id = %task.id, %key, "gate breaker still open, releasing");
                    self.ctx
                        .store
                        .release(task.id, token, &format!("breaker `{key}` open"))
                        .await?;
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn log_outcome(worker_id: &WorkerId, outcome: &ReviewOutcome) {
    let task = outcome.task();
    match outcome {
        ReviewOutcome::Completed(_) => {
            info!(%worker_id, task_id = %task.id, "completed");
        }
        ReviewOutcome::Advanced(_) => {
            info!(%worker_id, task_id = %task.id, phase = %task.phase, "advanced");
        }
        ReviewOutcome::Rejected { reasons, .. } => {
            info!(%worker_id, task_id = %task.id, reasons = reasons.len(), "rejected for rework");
        }
        ReviewOutcome::Requeued(_) => {
            info!(%worker_id, task_id = %task.id, retry_count = task.retry_count, "requeued");
        }
        ReviewOutcome::Exhausted(_) => {
            warn!(%worker_id, task_id = %task.id, "retries exhausted");
        }
    }
}

/// Heartbeat until the lease is lost. Only returns with the `StaleClaim`.
async fn keep_alive(
    ctx: Arc<WorkerContext>,
    mut record: WorkerRecord,
    task_id: TaskId,
    token: ClaimToken,
    interval: Duration,
) -> CoreError {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // 最初の tick は即時なので読み捨てる
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match ctx.store.heartbeat(task_id, token).await {
            Ok(()) => {
                let now = ctx.clock.now();
                record.last_heartbeat_sent_at = Some(now);
                record.updated_at = now;
                if let Err(e) = ctx.workers.upsert_worker(&record).await {
                    debug!(%task_id, error = %e, "failed to record heartbeat");
                }
            }
            Err(e @ CoreError::StaleClaim { .. }) => return e,
            Err(CoreError::TaskNotFound(id)) => {
                return CoreError::StaleClaim {
                    task_id: id,
                    token: Some(token),
                };
            }
            Err(e) => warn!(%task_id, error = %e, "heartbeat failed, retrying"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drain_is_sticky() {
        let control = PoolControl::new();
        let mut rx = control.subscribe();
        control.pause();
        assert_eq!(control.current(), PoolCommand::Pause);
        control.drain();
        control.resume();
        assert_eq!(control.current(), PoolCommand::Drain);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), PoolCommand::Drain);
    }

    #[tokio::test]
    async fn repeated_command_does_not_wake_workers() {
        let control = PoolControl::new();
        let mut rx = control.subscribe();
        control.resume();
        assert!(!rx.has_changed().unwrap());
        control.pause();
        control.pause();
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();
        assert!(!rx.has_changed().unwrap());
    }
}
