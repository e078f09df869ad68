//! Read access to committed catalog state, for re-deriving projections.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CatalogError;
use crate::tool::{ToolId, ToolSnapshot};

/// Committed state of one tool id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolState {
    Live(ToolSnapshot),
    /// Deleted by the mutation that produced `version`. Ids are never reused.
    Deleted { version: u64 },
    /// Never created.
    Absent,
}

impl ToolState {
    /// Catalog version this state was reached at; `None` for an unknown id.
    pub fn version(&self) -> Option<u64> {
        match self {
            ToolState::Live(snapshot) => Some(snapshot.version),
            ToolState::Deleted { version } => Some(*version),
            ToolState::Absent => None,
        }
    }

    pub fn into_snapshot(self) -> Option<ToolSnapshot> {
        match self {
            ToolState::Live(snapshot) => Some(snapshot),
            ToolState::Deleted { .. } | ToolState::Absent => None,
        }
    }
}

/// Committed-state reader used by reconciliation.
///
/// Only committed data is ever visible through this trait.
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    /// Latest committed state, tombstones included.
    async fn load_state(&self, tool_id: ToolId) -> Result<ToolState, CatalogError>;

    /// Latest committed snapshot, or `None` if the tool does not exist or was deleted.
    async fn load(&self, tool_id: ToolId) -> Result<Option<ToolSnapshot>, CatalogError> {
        Ok(self.load_state(tool_id).await?.into_snapshot())
    }

    /// Live tool ids in ascending order, strictly after `after`.
    async fn list_ids(
        &self,
        after: Option<ToolId>,
        limit: usize,
    ) -> Result<Vec<ToolId>, CatalogError>;

    /// Ids whose commit-time hand-off failed; draining clears them.
    async fn take_unpublished(&self) -> Result<Vec<ToolId>, CatalogError> {
        Ok(Vec::new())
    }

    /// Put back ids taken by [`SnapshotSource::take_unpublished`] that could
    /// not be reconciled.
    async fn restore_unpublished(&self, ids: Vec<ToolId>) -> Result<(), CatalogError> {
        let _ = ids;
        Ok(())
    }
}

#[async_trait]
impl<S> SnapshotSource for Arc<S>
where
    S: SnapshotSource + ?Sized,
{
    async fn load_state(&self, tool_id: ToolId) -> Result<ToolState, CatalogError> {
        (**self).load_state(tool_id).await
    }

    async fn list_ids(
        &self,
        after: Option<ToolId>,
        limit: usize,
    ) -> Result<Vec<ToolId>, CatalogError> {
        (**self).list_ids(after, limit).await
    }

    async fn take_unpublished(&self) -> Result<Vec<ToolId>, CatalogError> {
        (**self).take_unpublished().await
    }

    async fn restore_unpublished(&self, ids: Vec<ToolId>) -> Result<(), CatalogError> {
        (**self).restore_unpublished(ids).await
    }
}
