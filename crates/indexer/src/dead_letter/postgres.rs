//! Postgres-backed dead-letter store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | DeadLetterError |
//! |------------|-----------------|
//! | Any query/connection failure | `Storage` (with operation name) |
//! | Stored envelope fails to decode | `Serialization` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use toolhub_catalog::{ToolEnvelope, ToolId};

use super::{DeadLetterError, DeadLetterRecord, DeadLetterStore};

#[derive(Debug, Clone)]
pub struct PostgresDeadLetterStore {
    pool: Arc<PgPool>,
}

impl PostgresDeadLetterStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self, DeadLetterError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the dead-letter table if it does not exist.
    pub async fn ensure_schema(&self) -> Result<(), DeadLetterError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS toolhub_dead_letters (
                record_id        UUID PRIMARY KEY,
                tool_id          BIGINT NOT NULL,
                event_kind       TEXT NOT NULL,
                sequence_number  BIGINT NOT NULL,
                reason           TEXT NOT NULL,
                attempts         INTEGER NOT NULL,
                dead_lettered_at TIMESTAMPTZ NOT NULL,
                envelope         JSONB
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> DeadLetterError {
    DeadLetterError::Storage(format!("{operation}: {err}"))
}

#[async_trait]
impl DeadLetterStore for PostgresDeadLetterStore {
    #[instrument(skip(self, record), fields(tool_id = %record.tool_id, record_id = %record.record_id), err)]
    async fn record(&self, record: DeadLetterRecord) -> Result<(), DeadLetterError> {
        let envelope = record
            .envelope
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO toolhub_dead_letters
                (record_id, tool_id, event_kind, sequence_number, reason, attempts, dead_lettered_at, envelope)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (record_id) DO NOTHING
            "#,
        )
        .bind(record.record_id)
        .bind(record.tool_id.get())
        .bind(&record.event_kind)
        .bind(record.sequence_number as i64)
        .bind(&record.reason)
        .bind(record.attempts as i32)
        .bind(record.dead_lettered_at)
        .bind(envelope)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record", e))?;
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, DeadLetterError> {
        let rows = sqlx::query(
            r#"
            SELECT record_id, tool_id, event_kind, sequence_number, reason, attempts, dead_lettered_at, envelope
            FROM toolhub_dead_letters
            ORDER BY dead_lettered_at ASC, record_id ASC
            LIMIT $1
            "#,
        )
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let get_err = |e| map_sqlx_error("list.decode", e);
            let envelope: Option<serde_json::Value> = row.try_get("envelope").map_err(get_err)?;
            let envelope: Option<ToolEnvelope> = envelope.map(serde_json::from_value).transpose()?;

            records.push(DeadLetterRecord {
                record_id: row.try_get::<Uuid, _>("record_id").map_err(get_err)?,
                tool_id: ToolId::new(row.try_get::<i64, _>("tool_id").map_err(get_err)?),
                event_kind: row.try_get("event_kind").map_err(get_err)?,
                sequence_number: row.try_get::<i64, _>("sequence_number").map_err(get_err)? as u64,
                reason: row.try_get("reason").map_err(get_err)?,
                attempts: row.try_get::<i32, _>("attempts").map_err(get_err)? as u32,
                dead_lettered_at: row
                    .try_get::<DateTime<Utc>, _>("dead_lettered_at")
                    .map_err(get_err)?,
                envelope,
            });
        }
        Ok(records)
    }

    async fn remove(&self, record_id: Uuid) -> Result<bool, DeadLetterError> {
        let result = sqlx::query("DELETE FROM toolhub_dead_letters WHERE record_id = $1")
            .bind(record_id)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("remove", e))?;
        Ok(result.rows_affected() > 0)
    }
}
