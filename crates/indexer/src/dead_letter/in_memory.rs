use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use super::{DeadLetterError, DeadLetterRecord, DeadLetterStore};

/// In-memory dead-letter store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterStore {
    records: Mutex<Vec<DeadLetterRecord>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> DeadLetterError {
    DeadLetterError::Storage("dead-letter lock poisoned".to_string())
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn record(&self, record: DeadLetterRecord) -> Result<(), DeadLetterError> {
        self.records.lock().map_err(|_| poisoned())?.push(record);
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, DeadLetterError> {
        let records = self.records.lock().map_err(|_| poisoned())?;
        Ok(records.iter().take(limit).cloned().collect())
    }

    async fn remove(&self, record_id: Uuid) -> Result<bool, DeadLetterError> {
        let mut records = self.records.lock().map_err(|_| poisoned())?;
        let before = records.len();
        records.retain(|r| r.record_id != record_id);
        Ok(records.len() != before)
    }
}
