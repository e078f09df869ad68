//! Reconciliation: re-derive index documents from the system of record.
//!
//! The event path is best-effort across process crashes and refused
//! hand-offs. Reconciliation closes those gaps by queueing re-derivation
//! tasks on the dispatcher lanes, where they serialize with live events for
//! the same id.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use toolhub_catalog::{CatalogError, SnapshotSource, ToolId};

use crate::dead_letter::{DeadLetterError, DeadLetterStore};
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::search_store::{SearchStore, SearchStoreError};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("search store error: {0}")]
    SearchStore(#[from] SearchStoreError),

    #[error("dead-letter store error: {0}")]
    DeadLetter(#[from] DeadLetterError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Counts from one [`Reconciler::sweep`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Ids whose commit-time hand-off had failed.
    pub unpublished: usize,
    /// Live ids found in the system of record.
    pub catalog_ids: usize,
    /// Indexed ids with no live counterpart in the system of record.
    pub orphaned: usize,
    /// Reconciliation tasks queued in total.
    pub queued: usize,
}

pub struct Reconciler<C, S> {
    dispatcher: Arc<Dispatcher>,
    source: C,
    index: S,
    dead_letters: Arc<dyn DeadLetterStore>,
    batch_size: usize,
}

impl<C, S> std::fmt::Debug for Reconciler<C, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("dispatcher", &self.dispatcher)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl<C, S> Reconciler<C, S>
where
    C: SnapshotSource,
    S: SearchStore,
{
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        source: C,
        index: S,
        dead_letters: Arc<dyn DeadLetterStore>,
    ) -> Self {
        Self {
            dispatcher,
            source,
            index,
            dead_letters,
            batch_size: 500,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Queue a re-derivation for each id. Returns how many were queued.
    pub async fn reconcile<I>(&self, ids: I) -> Result<usize, ReconcileError>
    where
        I: IntoIterator<Item = ToolId>,
    {
        let mut queued = 0;
        for id in ids {
            self.dispatcher.reconcile(id).await?;
            queued += 1;
        }
        Ok(queued)
    }

    /// Full pass: the unpublished backlog, every live catalog id, and every
    /// indexed id the catalog no longer has.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Result<SweepReport, ReconcileError> {
        let mut report = SweepReport::default();

        let unpublished = self.source.take_unpublished().await?;
        report.unpublished = unpublished.len();
        report.queued += self.reconcile_backlog(unpublished).await?;

        let mut live: HashSet<ToolId> = HashSet::new();
        let mut after = None;
        loop {
            let page = self.source.list_ids(after, self.batch_size).await?;
            let full = page.len() >= self.batch_size;
            after = page.last().copied();
            live.extend(page.iter().copied());
            report.queued += self.reconcile(page).await?;
            if !full {
                break;
            }
        }
        report.catalog_ids = live.len();

        let mut after = None;
        loop {
            let page = self.index.list_ids(after, self.batch_size).await?;
            let full = page.len() >= self.batch_size;
            after = page.last().copied();
            let orphans: Vec<ToolId> = page.into_iter().filter(|id| !live.contains(id)).collect();
            report.orphaned += orphans.len();
            report.queued += self.reconcile(orphans).await?;
            if !full {
                break;
            }
        }

        info!(
            unpublished = report.unpublished,
            catalog_ids = report.catalog_ids,
            orphaned = report.orphaned,
            queued = report.queued,
            "reconciliation sweep queued"
        );
        Ok(report)
    }

    /// Like [`Reconciler::reconcile`], but ids that could not be queued go
    /// back to the unpublished backlog.
    async fn reconcile_backlog(&self, ids: Vec<ToolId>) -> Result<usize, ReconcileError> {
        for (queued, &id) in ids.iter().enumerate() {
            if let Err(err) = self.dispatcher.reconcile(id).await {
                let rest = ids[queued..].to_vec();
                warn!(restored = rest.len(), "returning unqueued ids to the backlog");
                self.source.restore_unpublished(rest).await?;
                return Err(err.into());
            }
        }
        Ok(ids.len())
    }

    /// Re-derive up to `limit` dead-lettered ids and drop their records once
    /// the re-derivation is queued. Returns how many records were replayed.
    #[instrument(skip(self))]
    pub async fn replay_dead_letters(&self, limit: usize) -> Result<usize, ReconcileError> {
        let records = self.dead_letters.list(limit).await?;
        let mut queued_ids = BTreeSet::new();

        for record in &records {
            if queued_ids.insert(record.tool_id) {
                self.dispatcher.reconcile(record.tool_id).await?;
            }
            self.dead_letters.remove(record.record_id).await?;
        }

        info!(
            records = records.len(),
            ids = queued_ids.len(),
            "dead letters replayed"
        );
        Ok(records.len())
    }
}

/// Handle to stop a running [`ReconciliationWorker`].
#[derive(Debug)]
pub struct ReconciliationHandle {
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

impl ReconciliationHandle {
    /// Request graceful shutdown and wait for the worker to stop. A sweep in
    /// progress is allowed to finish queueing.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(err) = self.join.await {
            error!(error = %err, "reconciliation worker failed");
        }
    }
}

/// Periodic sweep, independent of the event path.
#[derive(Debug)]
pub struct ReconciliationWorker;

impl ReconciliationWorker {
    /// Run `reconciler.sweep()` every `interval`, first one after one interval.
    pub fn spawn<C, S>(reconciler: Arc<Reconciler<C, S>>, interval: Duration) -> ReconciliationHandle
    where
        C: SnapshotSource,
        S: SearchStore,
    {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let join = tokio::spawn(async move {
            let period = interval.max(Duration::from_millis(1));
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval_ms = period.as_millis() as u64, "reconciliation worker started");

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        match reconciler.sweep().await {
                            Ok(_) => {}
                            Err(ReconcileError::Dispatch(DispatchError::Closed)) => {
                                info!("dispatcher closed; reconciliation worker exiting");
                                break;
                            }
                            Err(err) => error!(error = %err, "reconciliation sweep failed"),
                        }
                    }
                }
            }

            info!("reconciliation worker stopped");
        });

        ReconciliationHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}
