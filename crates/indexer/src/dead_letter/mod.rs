//! Dead-letter storage for events the indexer gave up on.
//!
//! A record carries everything needed to diagnose the failure and to repair
//! the index later: the id, what was attempted, why it failed, and the full
//! envelope when one existed (reconciliation tasks have none).

mod file;
mod in_memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use file::FileDeadLetterStore;
pub use in_memory::InMemoryDeadLetterStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresDeadLetterStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use toolhub_catalog::{ToolEnvelope, ToolId};

/// `event_kind` used for records produced by reconciliation tasks.
pub const RECONCILE_KIND: &str = "reconcile";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub record_id: Uuid,
    pub tool_id: ToolId,
    /// `created`, `updated`, `deleted` or `reconcile`.
    pub event_kind: String,
    /// Zero for reconciliation tasks.
    pub sequence_number: u64,
    pub reason: String,
    pub attempts: u32,
    pub dead_lettered_at: DateTime<Utc>,
    pub envelope: Option<ToolEnvelope>,
}

impl DeadLetterRecord {
    pub fn for_event(envelope: ToolEnvelope, reason: impl Into<String>, attempts: u32) -> Self {
        Self {
            record_id: Uuid::now_v7(),
            tool_id: ToolId(envelope.aggregate_id()),
            event_kind: envelope.payload().kind().to_string(),
            sequence_number: envelope.sequence_number(),
            reason: reason.into(),
            attempts,
            dead_lettered_at: Utc::now(),
            envelope: Some(envelope),
        }
    }

    pub fn for_reconcile(tool_id: ToolId, reason: impl Into<String>, attempts: u32) -> Self {
        Self {
            record_id: Uuid::now_v7(),
            tool_id,
            event_kind: RECONCILE_KIND.to_string(),
            sequence_number: 0,
            reason: reason.into(),
            attempts,
            dead_lettered_at: Utc::now(),
            envelope: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeadLetterError {
    #[error("dead-letter io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dead-letter serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("dead-letter storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync + 'static {
    /// Durably record a failed event.
    async fn record(&self, record: DeadLetterRecord) -> Result<(), DeadLetterError>;

    /// Oldest records first.
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, DeadLetterError>;

    /// Returns whether a record was removed.
    async fn remove(&self, record_id: Uuid) -> Result<bool, DeadLetterError>;
}

#[async_trait]
impl<D> DeadLetterStore for Arc<D>
where
    D: DeadLetterStore + ?Sized,
{
    async fn record(&self, record: DeadLetterRecord) -> Result<(), DeadLetterError> {
        (**self).record(record).await
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, DeadLetterError> {
        (**self).list(limit).await
    }

    async fn remove(&self, record_id: Uuid) -> Result<bool, DeadLetterError> {
        (**self).remove(record_id).await
    }
}
