//! BudgetWatchdog - 期間ごとの使用量を集計してプールを止める
//!
//! # フロー
//! 1. ワーカーが完了ごとに `record_usage(units)` を報告
//! 2. `budget` ロック下で ledger を更新し、状態を分類
//! 3. warning を越えたら advisory イベント、limit を越えたら exhausted にして pause
//! 4. `reset` または期間の切り替わりで、自分が止めたプールを再開
//!
//! exhausted は新しい claim だけを止める。実行中のタスクは最後まで走る。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::app::worker_loop::PoolControl;
use crate::config::BudgetConfig;
use crate::domain::{BudgetLedger, BudgetStatus, EntityType, NewEvent, period_of};
use crate::error::CoreError;
use crate::lock::LockManager;
use crate::ports::{BudgetStore, Clock, EventSink};

const BUDGET_LOCK: &str = "budget";

pub struct BudgetWatchdog {
    store: Arc<dyn BudgetStore>,
    locks: LockManager,
    clock: Arc<dyn Clock>,
    config: BudgetConfig,
    events: Option<Arc<dyn EventSink>>,
    control: Option<PoolControl>,
    /// Set while the pool is paused because of this watchdog.
    paused_pool: AtomicBool,
}

impl BudgetWatchdog {
    pub fn new(
        store: Arc<dyn BudgetStore>,
        locks: LockManager,
        clock: Arc<dyn Clock>,
        config: BudgetConfig,
    ) -> Self {
        Self {
            store,
            locks,
            clock,
            config,
            events: None,
            control: None,
            paused_pool: AtomicBool::new(false),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_control(mut self, control: PoolControl) -> Self {
        self.control = Some(control);
        self
    }

    pub fn enabled(&self) -> bool {
        self.config.limit_units > 0
    }

    pub fn period(&self) -> i64 {
        period_of(self.clock.now(), self.config.period_secs)
    }

    /// Ledger of the current period (fresh if nothing was recorded yet).
    pub async fn ledger(&self) -> Result<BudgetLedger, CoreError> {
        let period = self.period();
        Ok(self
            .store
            .load_ledger(period)
            .await?
            .unwrap_or_else(|| BudgetLedger::new(period, self.config.limit_units, self.clock.now())))
    }

    /// Are new claims blocked for the current period? Checked by every
    /// worker, so an exhausted ledger stops the whole pool across processes.
    pub async fn claims_blocked(&self) -> Result<bool, CoreError> {
        if !self.enabled() {
            return Ok(false);
        }
        Ok(self.ledger().await?.blocks_claims())
    }

    pub async fn record_usage(&self, units: u64) -> Result<BudgetLedger, CoreError> {
        let _lock = self.locks.acquire(BUDGET_LOCK).await?;
        let mut ledger = self.ledger().await?;
        let before = ledger.status;

        ledger.consumed_units = ledger.consumed_units.saturating_add(units);
        ledger.limit_units = self.config.limit_units;
        ledger.status = ledger.classify(self.config.warning_fraction);
        ledger.updated_at = self.clock.now();
        self.store.save_ledger(&ledger).await?;

        let transition = if ledger.status != before {
            ledger.status.as_str()
        } else {
            "consumed"
        };
        self.emit(&ledger, transition, json!({ "units": units, "from": before }))
            .await;

        match ledger.status {
            BudgetStatus::Exhausted if before != BudgetStatus::Exhausted => {
                warn!(
                    period_id = ledger.period_id,
                    consumed = ledger.consumed_units,
                    limit = ledger.limit_units,
                    "budget exhausted, pausing pool"
                );
                self.pause_pool();
            }
            BudgetStatus::Warning if before == BudgetStatus::Ok => {
                warn!(
                    period_id = ledger.period_id,
                    remaining = ledger.remaining(),
                    "budget warning threshold crossed"
                );
            }
            _ => {}
        }
        Ok(ledger)
    }

    /// Operator reset of the current period.
    pub async fn reset(&self) -> Result<BudgetLedger, CoreError> {
        let _lock = self.locks.acquire(BUDGET_LOCK).await?;
        let mut ledger = self.ledger().await?;
        let before = ledger.status;
        ledger.consumed_units = 0;
        ledger.limit_units = self.config.limit_units;
        ledger.status = BudgetStatus::Ok;
        ledger.updated_at = self.clock.now();
        self.store.save_ledger(&ledger).await?;
        self.emit(&ledger, "reset", json!({ "from": before })).await;
        info!(period_id = ledger.period_id, "budget reset");
        self.resume_pool();
        Ok(ledger)
    }

    /// Is the pool currently paused because of this watchdog?
    pub fn paused_pool(&self) -> bool {
        self.paused_pool.load(Ordering::SeqCst)
    }

    /// Resume a pool this watchdog paused once the shared ledger no longer
    /// blocks claims (period rollover, or a reset from another process).
    pub async fn tick(&self) -> Result<(), CoreError> {
        if self.paused_pool() && !self.claims_blocked().await? {
            info!(period_id = self.period(), "budget no longer exhausted");
            self.resume_pool();
        }
        Ok(())
    }

    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "budget tick failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    fn pause_pool(&self) {
        if let Some(control) = &self.control {
            self.paused_pool.store(true, Ordering::SeqCst);
            control.pause();
        }
    }

    fn resume_pool(&self) {
        if self.paused_pool.swap(false, Ordering::SeqCst)
            && let Some(control) = &self.control
        {
            control.resume();
        }
    }

    async fn emit(&self, ledger: &BudgetLedger, transition: &str, extra: serde_json::Value) {
        let Some(events) = &self.events else {
            return;
        };
        let mut detail = json!({
            "consumed_units": ledger.consumed_units,
            "limit_units": ledger.limit_units,
            "status": ledger.status,
        });
        if let (Some(obj), serde_json::Value::Object(more)) = (detail.as_object_mut(), extra) {
            obj.extend(more);
        }
        let event = NewEvent::new(EntityType::Budget, ledger.period_id, transition, ledger.updated_at)
            .with_detail(detail);
        if let Err(e) = events.append(event).await {
            error!(period_id = ledger.period_id, error = %e, "failed to append budget event");
        }
    }
}
