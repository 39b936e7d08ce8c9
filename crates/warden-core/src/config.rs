//! Configuration loaded once at startup and passed down by reference.
//!
//! Every section has defaults, so an empty file is a valid config.
//! `validate()` reports every inconsistency at once as `InvalidConfig`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::breaker::BreakerConfig;
use crate::domain::{GateThresholds, Phase, TaskSpec, parse_priority};
use crate::error::CoreError;
use crate::lock::LockPolicy;
use crate::ports::AgeBoostPolicy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub store: StoreConfig,
    pub tasks: TasksConfig,
    /// category -> route
    pub routing: BTreeMap<String, RouteConfig>,
    /// delegate name -> how to run it
    pub delegates: BTreeMap<String, DelegateConfig>,
    pub worker: WorkerConfig,
    pub watchdog: WatchdogConfig,
    pub lock: LockConfig,
    pub breaker: BreakerSettings,
    /// phase name -> metric name -> threshold
    pub gates: BTreeMap<String, GateThresholds>,
    pub budget: BudgetConfig,
    pub age_boost: AgeBoostConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Trusted root. Every state path must resolve inside it.
    pub state_dir: PathBuf,
    pub db_file: String,
    pub events_file: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".warden"),
            db_file: "warden.db".to_string(),
            events_file: "events.jsonl".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TasksConfig {
    pub default_max_retries: u32,
    pub default_priority: i32,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            default_priority: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    pub delegate: String,
    /// Number or label (`P0`..`P3`).
    pub priority: Option<String>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegateConfig {
    pub command: String,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub count: usize,
    pub shard_count: u32,
    pub heartbeat_interval_ms: u64,
    pub idle_backoff_min_ms: u64,
    pub idle_backoff_max_ms: u64,
    pub execution_timeout_secs: u64,
    /// Attempts at handing a finished task to the supervisor while its
    /// gate breaker is open.
    pub review_retry_limit: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 2,
            shard_count: 1,
            heartbeat_interval_ms: 5_000,
            idle_backoff_min_ms: 200,
            idle_backoff_max_ms: 5_000,
            execution_timeout_secs: 600,
            review_retry_limit: 3,
        }
    }
}

impl WorkerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub interval_ms: u64,
    pub stale_threshold_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            stale_threshold_ms: 30_000,
        }
    }
}

impl WatchdogConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_threshold_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_attempts: u32,
    pub stale_after_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 5,
            max_backoff_ms: 500,
            max_attempts: 12,
            stale_after_secs: 60,
        }
    }
}

impl LockConfig {
    pub fn policy(&self) -> LockPolicy {
        LockPolicy {
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            max_attempts: self.max_attempts,
            stale_after: Duration::from_secs(self.stale_after_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub trip_threshold: u32,
    pub cooldown_ms: u64,
    /// Persist breaker state so every worker process sees a trip.
    pub shared: bool,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            trip_threshold: 3,
            cooldown_ms: 30_000,
            shared: true,
        }
    }
}

impl BreakerSettings {
    pub fn config(&self) -> BreakerConfig {
        BreakerConfig {
            trip_threshold: self.trip_threshold,
            cooldown: Duration::from_millis(self.cooldown_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub period_secs: u64,
    /// 0 disables the budget.
    pub limit_units: u64,
    pub warning_fraction: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            period_secs: 86_400,
            limit_units: 0,
            warning_fraction: 0.8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgeBoostConfig {
    pub enabled: bool,
    pub after_secs: u64,
    pub step: i32,
    pub max_priority: i32,
}

impl Default for AgeBoostConfig {
    fn default() -> Self {
        // P3 -> P2 after 4 hours, one label per step, never above P0
        Self {
            enabled: true,
            after_secs: 4 * 3600,
            step: 10,
            max_priority: 30,
        }
    }
}

impl AgeBoostConfig {
    pub fn policy(&self) -> Option<AgeBoostPolicy> {
        self.enabled.then(|| AgeBoostPolicy {
            after: Duration::from_secs(self.after_secs),
            step: self.step,
            max_priority: self.max_priority,
        })
    }
}

impl WardenConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, CoreError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, or defaults when it does not exist.
    pub async fn load(path: &Path) -> Result<Self, CoreError> {
        let config = match tokio::fs::read_to_string(path).await {
            Ok(content) => toml::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(e.into()),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let mut errors: Vec<String> = Vec::new();

        // store
        if self.store.db_file.trim().is_empty() {
            errors.push("store.db_file must not be empty".into());
        }
        if self.store.events_file.trim().is_empty() {
            errors.push("store.events_file must not be empty".into());
        }

        // worker
        if self.worker.count == 0 {
            errors.push("worker.count must be greater than 0".into());
        }
        if self.worker.shard_count == 0 {
            errors.push("worker.shard_count must be greater than 0".into());
        }
        if self.worker.heartbeat_interval_ms == 0 {
            errors.push("worker.heartbeat_interval_ms must be greater than 0".into());
        }
        if self.worker.idle_backoff_min_ms == 0
            || self.worker.idle_backoff_min_ms > self.worker.idle_backoff_max_ms
        {
            errors.push("worker.idle_backoff_min_ms must be in 1..=idle_backoff_max_ms".into());
        }
        if self.worker.execution_timeout_secs == 0 {
            errors.push("worker.execution_timeout_secs must be greater than 0".into());
        }

        // watchdog: 一時的なスケジューリング遅延で誤検知しないよう 3 倍以上
        if self.watchdog.interval_ms == 0 {
            errors.push("watchdog.interval_ms must be greater than 0".into());
        }
        if self.watchdog.stale_threshold_ms < self.worker.heartbeat_interval_ms.saturating_mul(3) {
            errors.push(
                "watchdog.stale_threshold_ms must be at least 3x worker.heartbeat_interval_ms"
                    .into(),
            );
        }

        // lock
        if self.lock.initial_backoff_ms < 5 {
            errors.push("lock.initial_backoff_ms must be >= 5".into());
        }
        if self.lock.max_backoff_ms < self.lock.initial_backoff_ms {
            errors.push("lock.max_backoff_ms must be >= lock.initial_backoff_ms".into());
        }
        if self.lock.max_attempts == 0 {
            errors.push("lock.max_attempts must be greater than 0".into());
        }

        // breaker
        if self.breaker.trip_threshold == 0 {
            errors.push("breaker.trip_threshold must be greater than 0".into());
        }

        // budget
        if self.budget.period_secs == 0 {
            errors.push("budget.period_secs must be greater than 0".into());
        }
        if !(0.0..=1.0).contains(&self.budget.warning_fraction) {
            errors.push("budget.warning_fraction must be between 0.0 and 1.0".into());
        }

        // age boost
        if self.age_boost.enabled && self.age_boost.step <= 0 {
            errors.push("age_boost.step must be greater than 0".into());
        }

        // gates
        for (phase, thresholds) in &self.gates {
            if phase.parse::<Phase>().is_err() {
                errors.push(format!("gates.{phase}: unknown phase"));
            }
            for (metric, t) in thresholds {
                if t.is_empty() {
                    errors.push(format!("gates.{phase}.{metric}: no bound set"));
                }
                if let (Some(min), Some(max)) = (t.min, t.max)
                    && min > max
                {
                    errors.push(format!("gates.{phase}.{metric}: min > max"));
                }
            }
        }

        // routing
        for (category, route) in &self.routing {
            if route.delegate.trim().is_empty() {
                errors.push(format!("routing.{category}.delegate must not be empty"));
            }
            if let Some(p) = &route.priority
                && parse_priority(p).is_err()
            {
                errors.push(format!("routing.{category}.priority `{p}` is not a priority"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CoreError::InvalidConfig(errors.join("; ")))
        }
    }

    /// Thresholds of every configured phase.
    pub fn gate_thresholds(&self) -> BTreeMap<Phase, GateThresholds> {
        self.gates
            .iter()
            .filter_map(|(name, t)| name.parse::<Phase>().ok().map(|p| (p, t.clone())))
            .collect()
    }

    pub fn task_policy(&self) -> TaskPolicy {
        TaskPolicy {
            default_priority: self.tasks.default_priority,
            default_max_retries: self.tasks.default_max_retries,
            routes: self.routing.clone(),
        }
    }
}

/// Enqueue-time defaults and the category routing table.
#[derive(Debug, Clone)]
pub struct TaskPolicy {
    pub default_priority: i32,
    pub default_max_retries: u32,
    pub routes: BTreeMap<String, RouteConfig>,
}

impl Default for TaskPolicy {
    fn default() -> Self {
        WardenConfig::default().task_policy()
    }
}

impl TaskPolicy {
    /// Priority and retry limit for a new task.
    ///
    /// Explicit spec values win over the route, the route wins over the
    /// defaults. With a non-empty routing table, unknown categories are
    /// rejected.
    pub fn resolve(&self, spec: &TaskSpec) -> Result<(i32, u32), CoreError> {
        spec.validate()?;
        let route = self.routes.get(spec.category.trim());
        if route.is_none() && !self.routes.is_empty() {
            return Err(CoreError::InvalidSpec(format!(
                "no route for category `{}`",
                spec.category
            )));
        }

        let route_priority = route
            .and_then(|r| r.priority.as_deref())
            .map(parse_priority)
            .transpose()?;
        let priority = spec
            .priority
            .or(route_priority)
            .unwrap_or(self.default_priority);
        let max_retries = spec
            .max_retries
            .or_else(|| route.and_then(|r| r.max_retries))
            .unwrap_or(self.default_max_retries);
        Ok((priority, max_retries))
    }
}
