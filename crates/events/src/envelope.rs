use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use toolhub_core::AggregateId;

use crate::event::Event;

/// Committed event plus the metadata consumers order and dedupe by.
///
/// `sequence_number` is the aggregate version *after* the mutation, so it is
/// strictly increasing per aggregate and never 0 for a committed mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,

    aggregate_id: AggregateId,
    aggregate_type: String,

    sequence_number: u64,
    committed_at: DateTime<Utc>,

    payload: E,
}

/// An envelope whose metadata disagrees with what a commit would produce.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("sequence number 0")]
    ZeroSequence,

    #[error("payload aggregate {payload} does not match envelope aggregate {envelope}")]
    AggregateMismatch {
        envelope: AggregateId,
        payload: AggregateId,
    },

    #[error("payload version {payload} does not match sequence number {sequence}")]
    VersionMismatch { sequence: u64, payload: u64 },
}

impl<E> EventEnvelope<E> {
    pub fn new(
        event_id: Uuid,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        sequence_number: u64,
        committed_at: DateTime<Utc>,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            sequence_number,
            committed_at,
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn committed_at(&self) -> DateTime<Utc> {
        self.committed_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }

    /// Whether this envelope should be applied after `last_applied` (the
    /// highest sequence number already applied for the same aggregate).
    pub fn supersedes(&self, last_applied: Option<u64>) -> bool {
        last_applied.is_none_or(|last| self.sequence_number > last)
    }
}

impl<E: Event> EventEnvelope<E> {
    /// Wrap an event produced by a commit. Id and sequence number are taken
    /// from the event itself.
    pub fn committed(
        aggregate_type: impl Into<String>,
        committed_at: DateTime<Utc>,
        payload: E,
    ) -> Self {
        Self::new(
            Uuid::now_v7(),
            payload.aggregate_id(),
            aggregate_type,
            payload.version_after(),
            committed_at,
            payload,
        )
    }

    /// Check the metadata against the payload.
    pub fn verify(&self) -> Result<(), EnvelopeError> {
        if self.sequence_number == 0 {
            return Err(EnvelopeError::ZeroSequence);
        }
        if self.payload.aggregate_id() != self.aggregate_id {
            return Err(EnvelopeError::AggregateMismatch {
                envelope: self.aggregate_id,
                payload: self.payload.aggregate_id(),
            });
        }
        if self.payload.version_after() != self.sequence_number {
            return Err(EnvelopeError::VersionMismatch {
                sequence: self.sequence_number,
                payload: self.payload.version_after(),
            });
        }
        Ok(())
    }
}
