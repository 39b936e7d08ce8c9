//! In-memory event log for tests and single-process runs.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{EventRecord, NewEvent};
use crate::error::CoreError;
use crate::ports::{EventQuery, EventSink};

#[derive(Default)]
pub struct MemoryEventLog {
    records: Mutex<Vec<EventRecord>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<EventRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl EventSink for MemoryEventLog {
    async fn append(&self, event: NewEvent) -> Result<EventRecord, CoreError> {
        let mut records = self.records.lock().await;
        let seq = records.last().map_or(1, |r| r.seq + 1);
        let record = event.into_record(seq);
        records.push(record.clone());
        Ok(record)
    }

    async fn query(&self, query: &EventQuery) -> Result<Vec<EventRecord>, CoreError> {
        let records = self.records.lock().await;
        let matching = records.iter().filter(|r| query.matches(r)).cloned().collect();
        Ok(query.apply_limit(matching))
    }
}
