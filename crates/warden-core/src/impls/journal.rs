//! Event emission shared by the store implementations.
//!
//! Appends happen after the mutation is committed and before the store's
//! write lock is released, so per-entity event order matches commit order.
//! A failed append never rolls the mutation back; it is logged.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::error;

use crate::domain::{EntityType, NewEvent, QualityGateResult, Task, Transition, WorkerRecord};
use crate::ports::EventSink;

#[derive(Clone, Default)]
pub(crate) struct Journal {
    sink: Option<Arc<dyn EventSink>>,
}

impl Journal {
    pub(crate) fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink: Some(sink) }
    }

    pub(crate) async fn created(&self, task: &Task) {
        let event = NewEvent::new(EntityType::Task, task.id, "created", task.created_at).with_detail(
            json!({
                "to": task.status,
                "category": task.category,
                "phase": task.phase,
                "priority": task.priority,
                "max_retries": task.max_retries,
            }),
        );
        self.append(event).await;
    }

    pub(crate) async fn transition(&self, tr: &Transition) {
        let Some(label) = tr.label else {
            return;
        };
        let event = NewEvent::new(EntityType::Task, tr.task.id, label, tr.task.updated_at)
            .with_detail(tr.detail.clone());
        self.append(event).await;
    }

    pub(crate) async fn gate(&self, result: &QualityGateResult) {
        let event = NewEvent::new(
            EntityType::Gate,
            result.task_id,
            result.verdict.to_string(),
            result.evaluated_at,
        )
        .with_detail(json!({
            "phase": result.phase,
            "metrics": result.metrics,
            "reasons": result.reason_lines(),
        }));
        self.append(event).await;
    }

    pub(crate) async fn worker(&self, record: &WorkerRecord, now: DateTime<Utc>) {
        let event = NewEvent::new(EntityType::Worker, &record.worker_id, record.state.as_str(), now)
            .with_detail(json!({
                "shard_id": record.shard_id,
                "current_task_id": record.current_task_id,
            }));
        self.append(event).await;
    }

    pub(crate) async fn append(&self, event: NewEvent) {
        let Some(sink) = &self.sink else {
            return;
        };
        let entity = format!("{}:{}", event.entity_type, event.entity_id);
        let transition = event.transition.clone();
        if let Err(e) = sink.append(event).await {
            error!(%entity, %transition, error = %e, "failed to append event after commit");
        }
    }
}
