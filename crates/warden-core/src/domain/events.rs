//! Events - 監査ログのレコード
//!
//! Event Store は append-only。現在の状態の正本は Task Store であり、
//! ここは observability / replay 専用。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of entity an event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Task,
    Worker,
    Breaker,
    Budget,
    Gate,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Task => "task",
            EntityType::Worker => "worker",
            EntityType::Breaker => "breaker",
            EntityType::Budget => "budget",
            EntityType::Gate => "gate",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable line of the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub transition: String,
    #[serde(default)]
    pub detail: serde_json::Value,
}

/// An event before the sink assigns its `seq`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub timestamp: DateTime<Utc>,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub transition: String,
    pub detail: serde_json::Value,
}

impl NewEvent {
    pub fn new(
        entity_type: EntityType,
        entity_id: impl ToString,
        transition: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            timestamp,
            entity_type,
            entity_id: entity_id.to_string(),
            transition: transition.into(),
            detail: serde_json::Value::Null,
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }

    pub fn into_record(self, seq: u64) -> EventRecord {
        EventRecord {
            seq,
            timestamp: self.timestamp,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            transition: self.transition,
            detail: self.detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_serializes_with_snake_case_entity() {
        let rec = NewEvent::new(EntityType::Task, "task-1", "claimed", Utc::now())
            .with_detail(serde_json::json!({"worker": "w1"}))
            .into_record(7);

        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["seq"], 7);
        assert_eq!(v["entity_type"], "task");
        assert_eq!(v["entity_id"], "task-1");
        assert_eq!(v["transition"], "claimed");
        assert_eq!(v["detail"]["worker"], "w1");
    }
}
