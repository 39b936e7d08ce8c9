//! 共有状態のストア: breaker / budget ledger / worker records
//!
//! いずれも Task Store と同じ永続層に置き、プロセス間で共有する。

use async_trait::async_trait;

use crate::breaker::BreakerSnapshot;
use crate::domain::{BudgetLedger, WorkerRecord};
use crate::error::CoreError;

/// Persisted breaker state, so a trip is visible pool-wide.
#[async_trait]
pub trait BreakerStateStore: Send + Sync {
    async fn load_breaker(&self, key: &str) -> Result<Option<BreakerSnapshot>, CoreError>;

    async fn save_breaker(&self, snapshot: &BreakerSnapshot) -> Result<(), CoreError>;

    async fn list_breakers(&self) -> Result<Vec<BreakerSnapshot>, CoreError>;
}

#[async_trait]
pub trait BudgetStore: Send + Sync {
    async fn load_ledger(&self, period_id: i64) -> Result<Option<BudgetLedger>, CoreError>;

    async fn save_ledger(&self, ledger: &BudgetLedger) -> Result<(), CoreError>;
}

#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    async fn upsert_worker(&self, record: &WorkerRecord) -> Result<(), CoreError>;

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>, CoreError>;
}
