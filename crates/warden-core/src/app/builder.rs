//! WardenBuilder - アプリケーションの構築とワイヤリング
//!
//! # Fail-fast 設計
//! - 設定は build() の前に validate 済みであること（未検証なら build() が検証）
//! - `require_delegates()` を指定すると、routing が指す delegate が
//!   全て登録済みかを build() 時にチェックし、不足は BuildError
//! - 状態ファイルは `store.state_dir` 配下のみ（PathGuard で検証）

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::app::budget_loop::BudgetWatchdog;
use crate::app::reaper_loop::StalenessWatchdog;
use crate::app::runtime::{DelegateRegistry, Runtime};
use crate::app::status::StatusService;
use crate::app::supervisor::{QualityGate, Supervisor, ThresholdGate};
use crate::app::worker_loop::{PoolControl, PoolSettings, WorkerContext, WorkerPool};
use crate::breaker::BreakerRegistry;
use crate::config::WardenConfig;
use crate::domain::{TaskId, TaskSpec};
use crate::error::CoreError;
use crate::impls::{DirectDispatch, JsonlEventLog, MemoryEventLog, MemoryStore, RoutedDispatch, SqliteStore};
use crate::lock::{LockManager, PathGuard};
use crate::ports::{
    BreakerStateStore, BudgetStore, Clock, Delegate, DispatchStrategy, EventSink, SystemClock,
    TaskStore, WorkerRegistry,
};

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing delegates: {0:?}. These are named by the routing table but not registered.")]
    MissingDelegates(Vec<String>),

    #[error(transparent)]
    Core(#[from] CoreError),
}

enum Storage {
    /// SQLite + JSONL under `store.state_dir`.
    Files,
    /// Single-process, nothing persisted.
    Memory,
}

/// WardenBuilder はアプリケーションを構築
///
/// # 使用例
/// ```ignore
/// let warden = WardenBuilder::new(config)
///     .register_delegate("claude", Arc::new(MyDelegate))?
///     .require_delegates()
///     .build()?;
/// ```
pub struct WardenBuilder {
    config: Arc<WardenConfig>,
    clock: Arc<dyn Clock>,
    delegates: DelegateRegistry,
    dispatch: Option<Arc<dyn DispatchStrategy>>,
    gate: Option<Arc<dyn QualityGate>>,
    storage: Storage,
    require_delegates: bool,
}

impl WardenBuilder {
    pub fn new(config: WardenConfig) -> Self {
        Self {
            config: Arc::new(config),
            clock: Arc::new(SystemClock),
            delegates: DelegateRegistry::new(),
            dispatch: None,
            gate: None,
            storage: Storage::Files,
            require_delegates: false,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn in_memory(mut self) -> Self {
        self.storage = Storage::Memory;
        self
    }

    pub fn register_delegate(
        mut self,
        name: impl Into<String>,
        delegate: Arc<dyn Delegate>,
    ) -> Result<Self, CoreError> {
        self.delegates.register(name, delegate)?;
        Ok(self)
    }

    pub fn with_dispatch(mut self, dispatch: Arc<dyn DispatchStrategy>) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    pub fn with_gate(mut self, gate: Arc<dyn QualityGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Check at build time that every routed delegate is registered.
    pub fn require_delegates(mut self) -> Self {
        self.require_delegates = true;
        self
    }

    pub fn build(self) -> Result<Warden, BuildError> {
        let config = self.config;
        config.validate()?;

        let dispatch: Arc<dyn DispatchStrategy> = match self.dispatch {
            Some(d) => d,
            None if config.routing.is_empty() => Arc::new(DirectDispatch::new()),
            None => {
                let routed = RoutedDispatch::new(&config.routing);
                if self.require_delegates {
                    let missing: Vec<String> = routed
                        .delegates()
                        .into_iter()
                        .filter(|name| !self.delegates.contains(name))
                        .collect();
                    if !missing.is_empty() {
                        return Err(BuildError::MissingDelegates(missing));
                    }
                }
                Arc::new(routed)
            }
        };

        let clock = self.clock;
        let policy = Arc::new(config.task_policy());
        let (stores, events, locks) = match self.storage {
            Storage::Memory => {
                let events: Arc<dyn EventSink> = Arc::new(MemoryEventLog::new());
                let store = MemoryStore::new(Arc::clone(&clock))
                    .with_policy(policy)
                    .with_events(Arc::clone(&events));
                (
                    Stores::from(Arc::new(store)),
                    events,
                    LockManager::in_process(config.lock.policy()),
                )
            }
            Storage::Files => {
                std::fs::create_dir_all(&config.store.state_dir).map_err(CoreError::from)?;
                let guard = PathGuard::new(&config.store.state_dir)?;
                let locks = LockManager::files(&guard, "locks", config.lock.policy())?;
                let events: Arc<dyn EventSink> = Arc::new(JsonlEventLog::open(
                    &guard,
                    &config.store.events_file,
                    locks.clone(),
                )?);
                let store = SqliteStore::open(
                    &guard,
                    &config.store.db_file,
                    locks.clone(),
                    Arc::clone(&clock),
                )?
                .with_policy(policy)
                .with_events(Arc::clone(&events));
                (Stores::from(Arc::new(store)), events, locks)
            }
        };

        let mut breakers = BreakerRegistry::new(config.breaker.config(), Arc::clone(&clock))
            .with_events(Arc::clone(&events));
        if config.breaker.shared {
            breakers = breakers.with_shared_state(Arc::clone(&stores.breakers), locks.clone());
        }
        let breakers = Arc::new(breakers);

        let control = PoolControl::new();
        let budget = Arc::new(
            BudgetWatchdog::new(
                Arc::clone(&stores.budgets),
                locks.clone(),
                Arc::clone(&clock),
                config.budget.clone(),
            )
            .with_events(Arc::clone(&events))
            .with_control(control.clone()),
        );

        let gate = self
            .gate
            .unwrap_or_else(|| Arc::new(ThresholdGate::new(config.gate_thresholds())));
        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&stores.tasks),
            gate,
            Arc::clone(&breakers),
            locks.clone(),
            Arc::clone(&clock),
        ));

        let watchdog = Arc::new(
            StalenessWatchdog::new(Arc::clone(&stores.tasks), config.watchdog.stale_threshold())
                .with_age_boost(config.age_boost.policy()),
        );

        let status = Arc::new(StatusService::new(
            Arc::clone(&stores.tasks),
            Arc::clone(&events),
            Arc::clone(&stores.workers),
            Arc::clone(&stores.budgets),
            Arc::clone(&breakers),
            Arc::clone(&clock),
            config.budget.period_secs,
        ));

        let runtime = Arc::new(Runtime::new(Arc::new(self.delegates), dispatch));

        info!(
            delegates = runtime.registry().len(),
            shared_breakers = config.breaker.shared,
            "warden assembled"
        );

        Ok(Warden {
            config,
            clock,
            stores,
            events,
            breakers,
            control,
            budget,
            supervisor,
            watchdog,
            status,
            runtime,
        })
    }
}

/// The same store seen through each of its ports.
#[derive(Clone)]
struct Stores {
    tasks: Arc<dyn TaskStore>,
    breakers: Arc<dyn BreakerStateStore>,
    budgets: Arc<dyn BudgetStore>,
    workers: Arc<dyn WorkerRegistry>,
}

impl<S> From<Arc<S>> for Stores
where
    S: TaskStore + BreakerStateStore + BudgetStore + WorkerRegistry + 'static,
{
    fn from(store: Arc<S>) -> Self {
        Self {
            tasks: store.clone(),
            breakers: store.clone(),
            budgets: store.clone(),
            workers: store,
        }
    }
}

/// Warden はアプリケーションのランタイム
pub struct Warden {
    config: Arc<WardenConfig>,
    clock: Arc<dyn Clock>,
    stores: Stores,
    events: Arc<dyn EventSink>,
    breakers: Arc<BreakerRegistry>,
    control: PoolControl,
    budget: Arc<BudgetWatchdog>,
    supervisor: Arc<Supervisor>,
    watchdog: Arc<StalenessWatchdog>,
    status: Arc<StatusService>,
    runtime: Arc<Runtime>,
}

impl Warden {
    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.stores.tasks
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn control(&self) -> &PoolControl {
        &self.control
    }

    pub fn budget(&self) -> &Arc<BudgetWatchdog> {
        &self.budget
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn watchdog(&self) -> &Arc<StalenessWatchdog> {
        &self.watchdog
    }

    pub fn status(&self) -> &Arc<StatusService> {
        &self.status
    }

    pub async fn enqueue(&self, spec: TaskSpec) -> Result<TaskId, CoreError> {
        self.stores.tasks.enqueue(spec).await
    }

    /// Start the worker pool on this process's control channel.
    pub fn spawn_workers(&self, settings: PoolSettings) -> WorkerPool {
        let ctx = Arc::new(WorkerContext {
            store: Arc::clone(&self.stores.tasks),
            workers: Arc::clone(&self.stores.workers),
            runtime: Arc::clone(&self.runtime),
            supervisor: Arc::clone(&self.supervisor),
            breakers: Arc::clone(&self.breakers),
            budget: Arc::clone(&self.budget),
            clock: Arc::clone(&self.clock),
        });
        WorkerPool::spawn(ctx, settings, self.control.clone())
    }

    /// Run the staleness and budget watchdogs until `shutdown` turns true.
    pub async fn run_watchdogs(&self, shutdown: watch::Receiver<bool>) {
        let interval = self.config.watchdog.interval();
        tokio::join!(
            self.watchdog.run(interval, shutdown.clone()),
            self.budget.run(interval, shutdown),
        );
    }
}
