//! Indexing handler: turns committed tool events into search store writes.
//!
//! | event              | effect                         |
//! |--------------------|--------------------------------|
//! | `Created(s)`       | `upsert(project(s))`           |
//! | `Updated(s)`       | `upsert(project(s))`           |
//! | `Deleted { id }`   | `delete(id)`                   |
//! | reconcile `id`     | load snapshot; upsert, or      |
//! |                    | delete when it is absent       |
//!
//! Every attempt is bounded by a timeout. Transient failures are retried per
//! the [`RetryPolicy`]; permanent failures and exhausted retries end in exactly
//! one dead-letter record, after which the caller moves on.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, error, instrument, warn};

use toolhub_catalog::{SnapshotSource, ToolEnvelope, ToolEvent, ToolId};

use crate::dead_letter::{DeadLetterRecord, DeadLetterStore};
use crate::projector::project;
use crate::retry::RetryPolicy;
use crate::search_store::{SearchStore, SearchStoreError};

/// How a task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied { attempts: u32 },
    DeadLettered { attempts: u32 },
}

impl Outcome {
    pub fn attempts(self) -> u32 {
        match self {
            Outcome::Applied { attempts } | Outcome::DeadLettered { attempts } => attempts,
        }
    }

    pub fn retries(self) -> u32 {
        self.attempts().saturating_sub(1)
    }
}

/// Result of re-deriving one document from the system of record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciled {
    pub outcome: Outcome,
    /// Catalog version the index now reflects: the live snapshot's, or the
    /// deletion's for a tombstone. `None` for an id the catalog never had, or
    /// when the task was dead-lettered.
    pub indexed_version: Option<u64>,
}

/// What a dispatcher lane runs for each task it dequeues.
///
/// Implementations must not panic and must always return: a lane blocks on
/// the current task until it resolves.
#[async_trait]
pub trait ToolEventHandler: Send + Sync + 'static {
    async fn handle_event(&self, envelope: &ToolEnvelope) -> Outcome;

    async fn reconcile(&self, tool_id: ToolId) -> Reconciled;

    /// Record a task that will never be attempted.
    async fn dead_letter(&self, record: DeadLetterRecord);
}

#[async_trait]
impl<H> ToolEventHandler for Arc<H>
where
    H: ToolEventHandler + ?Sized,
{
    async fn handle_event(&self, envelope: &ToolEnvelope) -> Outcome {
        (**self).handle_event(envelope).await
    }

    async fn reconcile(&self, tool_id: ToolId) -> Reconciled {
        (**self).reconcile(tool_id).await
    }

    async fn dead_letter(&self, record: DeadLetterRecord) {
        (**self).dead_letter(record).await
    }
}

enum Failure {
    Transient(String),
    Permanent(String),
}

impl From<SearchStoreError> for Failure {
    fn from(err: SearchStoreError) -> Self {
        if err.is_transient() {
            Failure::Transient(err.to_string())
        } else {
            Failure::Permanent(err.to_string())
        }
    }
}

pub struct IndexingHandler<S, C> {
    store: S,
    source: C,
    dead_letters: Arc<dyn DeadLetterStore>,
    policy: RetryPolicy,
    attempt_timeout: Duration,
}

impl<S, C> std::fmt::Debug for IndexingHandler<S, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexingHandler")
            .field("policy", &self.policy)
            .field("attempt_timeout", &self.attempt_timeout)
            .finish_non_exhaustive()
    }
}

impl<S, C> IndexingHandler<S, C>
where
    S: SearchStore,
    C: SnapshotSource,
{
    pub fn new(store: S, source: C, dead_letters: Arc<dyn DeadLetterStore>) -> Self {
        Self {
            store,
            source,
            dead_letters,
            policy: RetryPolicy::default(),
            attempt_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    async fn apply(&self, event: &ToolEvent) -> Result<(), Failure> {
        match event {
            ToolEvent::Created(snapshot) | ToolEvent::Updated(snapshot) => {
                self.store.upsert(project(snapshot)).await?
            }
            ToolEvent::Deleted { tool_id, .. } => self.store.delete(*tool_id).await?,
        }
        Ok(())
    }

    async fn rederive(&self, tool_id: ToolId) -> Result<Option<u64>, Failure> {
        let state = self
            .source
            .load_state(tool_id)
            .await
            .map_err(|e| Failure::Transient(format!("snapshot load failed: {e}")))?;

        let version = state.version();
        match state.into_snapshot() {
            Some(snapshot) => self.store.upsert(project(&snapshot)).await?,
            None => self.store.delete(tool_id).await?,
        }
        Ok(version)
    }

    /// Run `op` until it succeeds, fails permanently, or the policy gives up.
    ///
    /// Returns the value and the number of attempts, or the final reason and
    /// the number of attempts.
    async fn with_retry<T, F, Fut>(&self, tool_id: ToolId, mut op: F) -> Result<(T, u32), (String, u32)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
    {
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.attempt_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(Failure::Transient(format!(
                    "attempt timed out after {}ms",
                    self.attempt_timeout.as_millis()
                ))),
            };

            match result {
                Ok(value) => return Ok((value, attempt)),
                Err(Failure::Permanent(reason)) => return Err((reason, attempt)),
                Err(Failure::Transient(reason)) => {
                    match self.policy.next_delay(attempt, started.elapsed()) {
                        Some(delay) => {
                            warn!(
                                tool_id = %tool_id,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %reason,
                                "transient indexing failure; retrying"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => return Err((format!("retries exhausted: {reason}"), attempt)),
                    }
                }
            }
        }
    }
}

#[async_trait]
impl<S, C> ToolEventHandler for IndexingHandler<S, C>
where
    S: SearchStore,
    C: SnapshotSource,
{
    #[instrument(
        skip_all,
        fields(
            tool_id = %envelope.aggregate_id(),
            sequence = envelope.sequence_number(),
            kind = envelope.payload().kind()
        )
    )]
    async fn handle_event(&self, envelope: &ToolEnvelope) -> Outcome {
        let tool_id = ToolId(envelope.aggregate_id());
        match self.with_retry(tool_id, || self.apply(envelope.payload())).await {
            Ok(((), attempts)) => {
                debug!(attempts, "indexed");
                Outcome::Applied { attempts }
            }
            Err((reason, attempts)) => {
                self.dead_letter(DeadLetterRecord::for_event(envelope.clone(), reason, attempts))
                    .await;
                Outcome::DeadLettered { attempts }
            }
        }
    }

    #[instrument(skip(self), fields(tool_id = %tool_id))]
    async fn reconcile(&self, tool_id: ToolId) -> Reconciled {
        match self.with_retry(tool_id, || self.rederive(tool_id)).await {
            Ok((indexed_version, attempts)) => {
                debug!(attempts, ?indexed_version, "reconciled");
                Reconciled {
                    outcome: Outcome::Applied { attempts },
                    indexed_version,
                }
            }
            Err((reason, attempts)) => {
                self.dead_letter(DeadLetterRecord::for_reconcile(tool_id, reason, attempts))
                    .await;
                Reconciled {
                    outcome: Outcome::DeadLettered { attempts },
                    indexed_version: None,
                }
            }
        }
    }

    async fn dead_letter(&self, record: DeadLetterRecord) {
        warn!(
            tool_id = %record.tool_id,
            kind = %record.event_kind,
            sequence = record.sequence_number,
            attempts = record.attempts,
            reason = %record.reason,
            "dead-lettering indexing task"
        );

        let record_id = record.record_id;
        if let Err(err) = self.dead_letters.record(record).await {
            error!(record_id = %record_id, error = %err, "failed to persist dead-letter record");
        }
    }
}
