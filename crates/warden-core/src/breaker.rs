//! Circuit breaker for protected operations (quality gates, delegates).
//!
//! # フロー
//! 1. `call(key, op)` で breaker を確認。open かつ cooldown 中なら op を呼ばずに `BreakerOpen`
//! 2. cooldown 経過後は half_open に遷移し、試行を 1 回だけ通す
//! 3. 成功で closed に戻り失敗数をリセット、失敗で open に戻る
//!
//! 結果は許可を得た時点の状態にだけ反映する。trip 前に通った呼び出しが
//! 後から返ってきても、open の breaker を閉じたり cooldown を延ばしたりしない。
//!
//! `shared` モードでは状態を `BreakerStateStore` に保存し、
//! `breaker-<key>` lock の下で read-modify-write する。trip がプール全体に見える。

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::domain::{EntityType, NewEvent};
use crate::error::CoreError;
use crate::lock::LockManager;
use crate::ports::{BreakerStateStore, Clock, EventSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BreakerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "closed" => Ok(BreakerState::Closed),
            "open" => Ok(BreakerState::Open),
            "half_open" => Ok(BreakerState::HalfOpen),
            other => Err(format!("unknown breaker state `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub trip_threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            trip_threshold: 3,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Persisted form of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub key: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub trip_threshold: u32,
    pub cooldown_ms: u64,
    pub opened_at: Option<DateTime<Utc>>,
    /// Start of the half-open trial currently in flight.
    pub trial_started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// State a call was admitted under. Its result only counts against that state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Closed,
    /// Half-open trial started at this instant.
    Trial(DateTime<Utc>),
}

/// Breaker state machine for a single operation key.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    key: String,
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    trial_started_at: Option<DateTime<Utc>>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(key: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            key: key.into(),
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_started_at: None,
            config,
        }
    }

    /// Restore from storage. Thresholds always come from the live config.
    pub fn from_snapshot(snapshot: BreakerSnapshot, config: BreakerConfig) -> Self {
        Self {
            key: snapshot.key,
            state: snapshot.state,
            consecutive_failures: snapshot.consecutive_failures,
            opened_at: snapshot.opened_at,
            trial_started_at: snapshot.trial_started_at,
            config,
        }
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> BreakerSnapshot {
        BreakerSnapshot {
            key: self.key.clone(),
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            trip_threshold: self.config.trip_threshold,
            cooldown_ms: u64::try_from(self.config.cooldown.as_millis()).unwrap_or(u64::MAX),
            opened_at: self.opened_at,
            trial_started_at: self.trial_started_at,
            updated_at: now,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Permission for one call. `Err` carries how long to back off.
    pub fn try_acquire(&mut self, now: DateTime<Utc>) -> Result<Admission, Duration> {
        match self.state {
            BreakerState::Closed => Ok(Admission::Closed),
            BreakerState::Open => {
                let remaining = self.remaining(self.opened_at, now);
                if remaining.is_zero() {
                    info!(key = %self.key, "circuit breaker entering half-open state");
                    self.state = BreakerState::HalfOpen;
                    self.trial_started_at = Some(now);
                    Ok(Admission::Trial(now))
                } else {
                    Err(remaining)
                }
            }
            BreakerState::HalfOpen => {
                // 試行中なら待たせる。試行者が結果を報告せずに消えた場合は
                // cooldown 経過後に次の試行を許す
                let remaining = self.remaining(self.trial_started_at, now);
                if self.trial_started_at.is_some() && !remaining.is_zero() {
                    Err(remaining)
                } else {
                    self.trial_started_at = Some(now);
                    Ok(Admission::Trial(now))
                }
            }
        }
    }

    /// Does a result admitted under `admission` still apply?
    fn applies(&self, admission: Admission) -> bool {
        match admission {
            Admission::Closed => self.state == BreakerState::Closed,
            Admission::Trial(at) => {
                self.state == BreakerState::HalfOpen && self.trial_started_at == Some(at)
            }
        }
    }

    pub fn record_success(&mut self, admission: Admission) {
        if !self.applies(admission) {
            debug!(key = %self.key, state = %self.state, ?admission, "ignoring late success");
            return;
        }
        self.consecutive_failures = 0;
        self.state = BreakerState::Closed;
        self.opened_at = None;
        self.trial_started_at = None;
    }

    pub fn record_failure(&mut self, admission: Admission, now: DateTime<Utc>) {
        if !self.applies(admission) {
            debug!(key = %self.key, state = %self.state, ?admission, "ignoring late failure");
            return;
        }
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let trips = self.state == BreakerState::HalfOpen
            || self.consecutive_failures >= self.config.trip_threshold;
        if trips && self.state != BreakerState::Open {
            warn!(
                key = %self.key,
                failures = self.consecutive_failures,
                "circuit breaker opened"
            );
        }
        if trips {
            self.state = BreakerState::Open;
            self.opened_at = Some(now);
            self.trial_started_at = None;
        }
    }

    fn remaining(&self, since: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
        let Some(since) = since else {
            return Duration::ZERO;
        };
        let elapsed = (now - since).to_std().unwrap_or(Duration::ZERO);
        self.config.cooldown.saturating_sub(elapsed)
    }
}

struct SharedState {
    store: Arc<dyn BreakerStateStore>,
    locks: LockManager,
}

/// All breakers of a process, keyed by operation.
pub struct BreakerRegistry {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    local: Mutex<HashMap<String, CircuitBreaker>>,
    shared: Option<SharedState>,
    events: Option<Arc<dyn EventSink>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            local: Mutex::new(HashMap::new()),
            shared: None,
            events: None,
        }
    }

    /// Keep breaker state in the shared store instead of process memory.
    pub fn with_shared_state(mut self, store: Arc<dyn BreakerStateStore>, locks: LockManager) -> Self {
        self.shared = Some(SharedState { store, locks });
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Run `op` under the breaker for `key`.
    ///
    /// Fails fast with `BreakerOpen` without calling `op` while open.
    pub async fn call<T, F, Fut>(&self, key: &str, op: F) -> Result<T, CoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let admission = match self.update(key, |b, now| b.try_acquire(now)).await? {
            Ok(admission) => admission,
            Err(retry_after) => {
                return Err(CoreError::BreakerOpen {
                    key: key.to_string(),
                    retry_after,
                });
            }
        };

        let result = op().await;
        match &result {
            Ok(_) => self.update(key, |b, _| b.record_success(admission)).await?,
            Err(_) => self.update(key, |b, now| b.record_failure(admission, now)).await?,
        }
        result
    }

    pub async fn state(&self, key: &str) -> Result<BreakerState, CoreError> {
        match &self.shared {
            Some(shared) => Ok(shared
                .store
                .load_breaker(key)
                .await?
                .map_or(BreakerState::Closed, |s| s.state)),
            None => Ok(self
                .local
                .lock()
                .await
                .get(key)
                .map_or(BreakerState::Closed, CircuitBreaker::state)),
        }
    }

    pub async fn snapshots(&self) -> Result<Vec<BreakerSnapshot>, CoreError> {
        match &self.shared {
            Some(shared) => shared.store.list_breakers().await,
            None => {
                let now = self.clock.now();
                let mut out: Vec<_> = self
                    .local
                    .lock()
                    .await
                    .values()
                    .map(|b| b.snapshot(now))
                    .collect();
                out.sort_by(|a, b| a.key.cmp(&b.key));
                Ok(out)
            }
        }
    }

    async fn update<R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut CircuitBreaker, DateTime<Utc>) -> R,
    ) -> Result<R, CoreError> {
        let now = self.clock.now();
        let (result, before, after) = match &self.shared {
            Some(shared) => {
                let _lock = shared.locks.acquire(&format!("breaker-{key}")).await?;
                let mut breaker = match shared.store.load_breaker(key).await? {
                    Some(snapshot) => CircuitBreaker::from_snapshot(snapshot, self.config.clone()),
                    None => CircuitBreaker::new(key, self.config.clone()),
                };
                let before = breaker.snapshot(now);
                let result = f(&mut breaker, now);
                let after = breaker.snapshot(now);
                if after != before {
                    shared.store.save_breaker(&after).await?;
                }
                (result, before.state, after.state)
            }
            None => {
                let mut map = self.local.lock().await;
                let breaker = map
                    .entry(key.to_string())
                    .or_insert_with(|| CircuitBreaker::new(key, self.config.clone()));
                let before = breaker.state();
                let result = f(breaker, now);
                (result, before, breaker.state())
            }
        };

        if before != after {
            self.emit(key, before, after, now).await;
        }
        Ok(result)
    }

    async fn emit(&self, key: &str, from: BreakerState, to: BreakerState, now: DateTime<Utc>) {
        let Some(events) = &self.events else {
            return;
        };
        let event = NewEvent::new(EntityType::Breaker, key, to.as_str(), now)
            .with_detail(json!({ "from": from, "to": to }));
        if let Err(e) = events.append(event).await {
            error!(key, error = %e, "failed to append breaker event");
        }
    }
}
