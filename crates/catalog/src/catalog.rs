//! In-memory transactional system of record for tools.
//!
//! The catalog is the event source of the indexing pipeline:
//!
//! ```text
//! begin() → execute(cmd)… → commit()
//!                              ├─ apply all staged commands (all-or-nothing)
//!                              ├─ make the new state visible
//!                              └─ hand one envelope per mutation to the CommitListener
//! ```
//!
//! Nothing is emitted for a transaction that is rolled back, dropped, or whose
//! commit fails validation. A listener that pushes back is retried a bounded
//! number of times; ids that still could not be handed off are remembered in
//! the unpublished backlog that reconciliation drains. The commit itself has
//! already succeeded at that point and is never undone.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, warn};

use toolhub_core::{Aggregate, AggregateRoot, ExpectedVersion};
use toolhub_events::{CommitListener, EventEnvelope};

use crate::error::CatalogError;
use crate::source::{SnapshotSource, ToolState};
use crate::tool::{Tool, ToolCommand, ToolEvent, ToolId, ToolSnapshot};

/// Aggregate type recorded on every tool envelope.
pub const TOOL_AGGREGATE_TYPE: &str = "catalog.tool";

pub type ToolEnvelope = EventEnvelope<ToolEvent>;

/// How hard the catalog tries to hand a committed event to its listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishPolicy {
    /// Total hand-off attempts per event (at least 1).
    pub attempts: u32,
    /// Delay before attempt `n + 1` is `backoff * n`.
    pub backoff: Duration,
}

impl Default for PublishPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(20),
        }
    }
}

/// Committed catalog state, shareable with readers that must not hold the
/// catalog itself (e.g. an indexer that is also the catalog's listener).
#[derive(Debug, Clone, Default)]
pub struct CatalogRecords {
    tools: Arc<RwLock<BTreeMap<ToolId, Tool>>>,
    unpublished: Arc<Mutex<BTreeSet<ToolId>>>,
}

impl CatalogRecords {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed snapshot of a live tool.
    pub fn get(&self, tool_id: ToolId) -> Result<Option<ToolSnapshot>, CatalogError> {
        let tools = self.tools.read().map_err(|_| CatalogError::Poisoned)?;
        Ok(tools.get(&tool_id).and_then(Tool::snapshot))
    }

    /// Committed snapshots of all live tools, ordered by id.
    pub fn list(&self) -> Result<Vec<ToolSnapshot>, CatalogError> {
        let tools = self.tools.read().map_err(|_| CatalogError::Poisoned)?;
        Ok(tools.values().filter_map(Tool::snapshot).collect())
    }

    /// Committed state of one tool, tombstones included.
    pub fn state(&self, tool_id: ToolId) -> Result<ToolState, CatalogError> {
        let tools = self.tools.read().map_err(|_| CatalogError::Poisoned)?;
        Ok(tools.get(&tool_id).map_or(ToolState::Absent, Tool::state))
    }

    /// Ids currently waiting for reconciliation because their hand-off failed.
    pub fn unpublished(&self) -> Result<Vec<ToolId>, CatalogError> {
        let set = self.unpublished.lock().map_err(|_| CatalogError::Poisoned)?;
        Ok(set.iter().copied().collect())
    }

    fn mark_unpublished<I>(&self, ids: I) -> Result<(), CatalogError>
    where
        I: IntoIterator<Item = ToolId>,
    {
        let mut set = self.unpublished.lock().map_err(|_| CatalogError::Poisoned)?;
        set.extend(ids);
        Ok(())
    }
}

#[async_trait]
impl SnapshotSource for CatalogRecords {
    async fn load_state(&self, tool_id: ToolId) -> Result<ToolState, CatalogError> {
        self.state(tool_id)
    }

    async fn list_ids(
        &self,
        after: Option<ToolId>,
        limit: usize,
    ) -> Result<Vec<ToolId>, CatalogError> {
        let tools = self.tools.read().map_err(|_| CatalogError::Poisoned)?;
        let ids = tools
            .iter()
            .filter(|(id, tool)| after.is_none_or(|a| **id > a) && tool.is_live())
            .map(|(id, _)| *id)
            .take(limit)
            .collect();
        Ok(ids)
    }

    async fn take_unpublished(&self) -> Result<Vec<ToolId>, CatalogError> {
        let mut set = self.unpublished.lock().map_err(|_| CatalogError::Poisoned)?;
        Ok(std::mem::take(&mut *set).into_iter().collect())
    }

    async fn restore_unpublished(&self, ids: Vec<ToolId>) -> Result<(), CatalogError> {
        self.mark_unpublished(ids)
    }
}

#[derive(Debug)]
pub struct InMemoryCatalog<L> {
    records: CatalogRecords,
    listener: L,
    publish: PublishPolicy,
}

impl<L> InMemoryCatalog<L>
where
    L: CommitListener<ToolEnvelope>,
{
    pub fn new(listener: L) -> Self {
        Self::with_records(CatalogRecords::new(), listener)
    }

    /// Build a catalog on top of existing (possibly shared) records.
    pub fn with_records(records: CatalogRecords, listener: L) -> Self {
        Self {
            records,
            listener,
            publish: PublishPolicy::default(),
        }
    }

    pub fn with_publish_policy(mut self, policy: PublishPolicy) -> Self {
        self.publish = policy;
        self
    }

    pub fn listener(&self) -> &L {
        &self.listener
    }

    /// Shared handle on the committed state.
    pub fn records(&self) -> CatalogRecords {
        self.records.clone()
    }

    /// Start a transaction. Staged commands are invisible until commit.
    pub fn begin(&self) -> Transaction<'_, L> {
        Transaction {
            catalog: self,
            staged: Vec::new(),
        }
    }

    pub fn get(&self, tool_id: ToolId) -> Result<Option<ToolSnapshot>, CatalogError> {
        self.records.get(tool_id)
    }

    pub fn list(&self) -> Result<Vec<ToolSnapshot>, CatalogError> {
        self.records.list()
    }

    pub fn unpublished(&self) -> Result<Vec<ToolId>, CatalogError> {
        self.records.unpublished()
    }

    fn apply_staged(
        &self,
        staged: &[(ToolCommand, ExpectedVersion)],
    ) -> Result<Vec<ToolEnvelope>, CatalogError> {
        let mut tools = self.records.tools.write().map_err(|_| CatalogError::Poisoned)?;
        let committed_at = Utc::now();

        // Work on copies so a failing command leaves committed state untouched.
        let mut working: BTreeMap<ToolId, Tool> = BTreeMap::new();
        let mut envelopes = Vec::with_capacity(staged.len());

        for (command, expected) in staged {
            let tool_id = command.tool_id();
            let tool = working
                .entry(tool_id)
                .or_insert_with(|| tools.get(&tool_id).cloned().unwrap_or_else(|| Tool::empty(tool_id)));

            expected.check(tool.version())?;
            for event in tool.execute(command)? {
                envelopes.push(EventEnvelope::committed(TOOL_AGGREGATE_TYPE, committed_at, event));
            }
        }

        tools.extend(working);
        Ok(envelopes)
    }

    /// Hand every envelope to the listener. Fails only when a refused id
    /// could not be added to the backlog; the rest are still handed off.
    async fn publish(&self, envelopes: &[ToolEnvelope]) -> Result<(), CatalogError> {
        let attempts = self.publish.attempts.max(1);
        let mut lost = None;

        for envelope in envelopes {
            let tool_id = ToolId(envelope.aggregate_id());
            let mut attempt = 0;
            loop {
                attempt += 1;
                match self.listener.on_commit(envelope.clone()).await {
                    Ok(()) => break,
                    Err(err) if attempt < attempts => {
                        warn!(
                            tool_id = %tool_id,
                            sequence = envelope.sequence_number(),
                            attempt,
                            error = %err,
                            "commit listener pushed back; retrying"
                        );
                        tokio::time::sleep(self.publish.backoff * attempt).await;
                    }
                    Err(err) => {
                        error!(
                            tool_id = %tool_id,
                            sequence = envelope.sequence_number(),
                            attempts = attempt,
                            error = %err,
                            "commit listener refused event; queued for reconciliation"
                        );
                        if self.records.mark_unpublished([tool_id]).is_err() {
                            error!(tool_id = %tool_id, "unpublished backlog lock poisoned");
                            lost.get_or_insert(tool_id);
                        }
                        break;
                    }
                }
            }
        }

        match lost {
            Some(tool_id) => Err(CatalogError::BacklogLost { tool_id }),
            None => Ok(()),
        }
    }
}

/// A unit of work against the catalog.
///
/// Dropping a transaction without calling [`Transaction::commit`] is a rollback.
#[derive(Debug)]
pub struct Transaction<'a, L> {
    catalog: &'a InMemoryCatalog<L>,
    staged: Vec<(ToolCommand, ExpectedVersion)>,
}

impl<'a, L> Transaction<'a, L>
where
    L: CommitListener<ToolEnvelope>,
{
    /// Stage a command with no version expectation.
    pub fn execute(&mut self, command: ToolCommand) -> &mut Self {
        self.execute_expected(command, ExpectedVersion::Any)
    }

    /// Stage a command that only applies if the tool is at `expected` when
    /// the transaction commits.
    pub fn execute_expected(&mut self, command: ToolCommand, expected: ExpectedVersion) -> &mut Self {
        self.staged.push((command, expected));
        self
    }

    pub fn rollback(self) {
        debug!(staged = self.staged.len(), "transaction rolled back");
    }

    /// Commit all staged commands atomically, then emit their events.
    ///
    /// Returns the emitted envelopes in commit order.
    /// [`CatalogError::BacklogLost`] is the one error returned after the
    /// state was committed.
    pub async fn commit(self) -> Result<Vec<ToolEnvelope>, CatalogError> {
        let envelopes = self.catalog.apply_staged(&self.staged)?;
        debug!(events = envelopes.len(), "transaction committed");

        self.catalog.publish(&envelopes).await?;
        Ok(envelopes)
    }
}

#[async_trait]
impl<L> SnapshotSource for InMemoryCatalog<L>
where
    L: CommitListener<ToolEnvelope> + 'static,
{
    async fn load_state(&self, tool_id: ToolId) -> Result<ToolState, CatalogError> {
        self.records.load_state(tool_id).await
    }

    async fn list_ids(
        &self,
        after: Option<ToolId>,
        limit: usize,
    ) -> Result<Vec<ToolId>, CatalogError> {
        self.records.list_ids(after, limit).await
    }

    async fn take_unpublished(&self) -> Result<Vec<ToolId>, CatalogError> {
        self.records.take_unpublished().await
    }

    async fn restore_unpublished(&self, ids: Vec<ToolId>) -> Result<(), CatalogError> {
        self.records.restore_unpublished(ids).await
    }
}
