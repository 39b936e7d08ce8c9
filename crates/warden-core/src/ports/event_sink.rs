//! EventSink port - append-only 監査ログ
//!
//! # 実装
//! - **JsonlEventLog**: 1 行 1 レコードのファイル（本番用）
//! - **MemoryEventLog**: テスト用
//!
//! `seq` は sink が採番し、単調増加する。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{EntityType, EventRecord, NewEvent};
use crate::error::CoreError;

#[async_trait]
pub trait EventSink: Send + Sync {
    /// Append one record and return it with its assigned `seq`.
    async fn append(&self, event: NewEvent) -> Result<EventRecord, CoreError>;

    /// Records matching `query`, in `seq` order.
    async fn query(&self, query: &EventQuery) -> Result<Vec<EventRecord>, CoreError>;
}

#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub entity_type: Option<EntityType>,
    pub entity_id: Option<String>,
    pub transition: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub after_seq: Option<u64>,
    /// Keep only the last `limit` matches.
    pub limit: Option<usize>,
}

impl EventQuery {
    pub fn for_entity(entity_type: EntityType, entity_id: impl ToString) -> Self {
        Self {
            entity_type: Some(entity_type),
            entity_id: Some(entity_id.to_string()),
            ..Self::default()
        }
    }

    pub fn matches(&self, rec: &EventRecord) -> bool {
        self.entity_type.is_none_or(|t| t == rec.entity_type)
            && self.entity_id.as_ref().is_none_or(|id| *id == rec.entity_id)
            && self
                .transition
                .as_ref()
                .is_none_or(|t| *t == rec.transition)
            && self.since.is_none_or(|t| rec.timestamp >= t)
            && self.until.is_none_or(|t| rec.timestamp <= t)
            && self.after_seq.is_none_or(|s| rec.seq > s)
    }

    pub(crate) fn apply_limit(&self, mut records: Vec<EventRecord>) -> Vec<EventRecord> {
        if let Some(limit) = self.limit
            && records.len() > limit
        {
            records.drain(..records.len() - limit);
        }
        records
    }
}
