//! StalenessWatchdog - 期限切れ lease の回収
//!
//! # フロー
//! 1. 一定間隔で TaskStore::reap_stale(stale_threshold)
//! 2. heartbeat が途絶えた claimed / in_progress を stale へ（retry_count +1、上限なら failed）
//! 3. 同じ tick で age boost（設定されていれば）
//!
//! ワーカー自身は自分の staleness を判定しない。回収経路はここだけ。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::domain::TaskStatus;
use crate::error::CoreError;
use crate::ports::{AgeBoostPolicy, TaskStore};

/// What one tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub reaped: usize,
    pub failed: usize,
    pub boosted: usize,
}

pub struct StalenessWatchdog {
    store: Arc<dyn TaskStore>,
    stale_threshold: Duration,
    age_boost: Option<AgeBoostPolicy>,
}

impl StalenessWatchdog {
    pub fn new(store: Arc<dyn TaskStore>, stale_threshold: Duration) -> Self {
        Self {
            store,
            stale_threshold,
            age_boost: None,
        }
    }

    pub fn with_age_boost(mut self, policy: Option<AgeBoostPolicy>) -> Self {
        self.age_boost = policy;
        self
    }

    pub async fn tick(&self) -> Result<TickReport, CoreError> {
        let mut report = TickReport::default();

        for task in self.store.reap_stale(self.stale_threshold).await? {
            if task.status == TaskStatus::Failed {
                report.failed += 1;
                warn!(task_id = %task.id, retry_count = task.retry_count, "stale task exhausted its retries");
            } else {
                report.reaped += 1;
                info!(task_id = %task.id, retry_count = task.retry_count, "reclaimed stale task");
            }
        }

        if let Some(policy) = &self.age_boost {
            let boosted = self.store.apply_age_boosts(policy).await?;
            for task in &boosted {
                info!(task_id = %task.id, priority = task.priority, "age boost");
            }
            report.boosted = boosted.len();
        }
        Ok(report)
    }

    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, retryable = e.is_retryable(), "watchdog tick failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("staleness watchdog stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskSpec, WorkerId};
    use crate::impls::MemoryStore;
    use crate::ports::{ClaimFilter, ManualClock};
    use chrono::{TimeZone, Utc};

    fn setup() -> (Arc<ManualClock>, Arc<MemoryStore>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        (clock, store)
    }

    #[tokio::test]
    async fn silent_lease_is_reclaimed_once() {
        let (clock, store) = setup();
        let id = store.enqueue(TaskSpec::new("a", "r")).await.unwrap();
        store
            .claim(&WorkerId::new("w1"), &ClaimFilter::any())
            .await
            .unwrap();
        let watchdog = StalenessWatchdog::new(store.clone(), Duration::from_secs(30));

        clock.advance(Duration::from_secs(31));
        assert_eq!(watchdog.tick().await.unwrap().reaped, 1);
        assert_eq!(watchdog.tick().await.unwrap(), TickReport::default());

        let t = store.get(id).await.unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Stale);
        assert_eq!(t.retry_count, 1);
        assert!(t.owner.is_none() && t.claim_token.is_none());
    }

    #[tokio::test]
    async fn exhausted_lease_fails() {
        let (clock, store) = setup();
        store
            .enqueue(TaskSpec::new("a", "r").with_max_retries(0))
            .await
            .unwrap();
        store
            .claim(&WorkerId::new("w1"), &ClaimFilter::any())
            .await
            .unwrap();
        let watchdog = StalenessWatchdog::new(store.clone(), Duration::from_secs(30));

        clock.advance(Duration::from_secs(60));
        let report = watchdog.tick().await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(
            store
                .claim(&WorkerId::new("w2"), &ClaimFilter::any())
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn tick_applies_age_boost() {
        let (clock, store) = setup();
        store
            .enqueue(TaskSpec::new("a", "r").with_priority(0))
            .await
            .unwrap();
        let watchdog = StalenessWatchdog::new(store.clone(), Duration::from_secs(30))
            .with_age_boost(Some(AgeBoostPolicy {
                after: Duration::from_secs(600),
                step: 10,
                max_priority: 30,
            }));

        clock.advance(Duration::from_secs(600));
        assert_eq!(watchdog.tick().await.unwrap().boosted, 1);
    }
}
