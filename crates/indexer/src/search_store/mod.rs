//! Search index client abstraction.
//!
//! The real search engine is an external collaborator. The indexer only needs
//! full-document upserts, idempotent deletes, and enough read access for
//! reconciliation to find orphaned documents.

mod in_memory;

pub use in_memory::InMemorySearchStore;

use std::sync::Arc;

use async_trait::async_trait;

use toolhub_catalog::ToolId;

use crate::projector::ToolDocument;

/// Search store error.
///
/// `Timeout` and `Unavailable` are transient and worth retrying; `Rejected` and
/// `Malformed` will fail the same way every time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SearchStoreError {
    #[error("search store timed out")]
    Timeout,

    #[error("search store unavailable: {0}")]
    Unavailable(String),

    #[error("search store rejected document: {0}")]
    Rejected(String),

    #[error("malformed request: {0}")]
    Malformed(String),
}

impl SearchStoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SearchStoreError::Timeout | SearchStoreError::Unavailable(_))
    }
}

#[async_trait]
pub trait SearchStore: Send + Sync + 'static {
    /// Insert or fully replace the document for `doc.tool_id`.
    async fn upsert(&self, doc: ToolDocument) -> Result<(), SearchStoreError>;

    /// Remove the document for `tool_id`. Deleting an absent id succeeds.
    async fn delete(&self, tool_id: ToolId) -> Result<(), SearchStoreError>;

    async fn get(&self, tool_id: ToolId) -> Result<Option<ToolDocument>, SearchStoreError>;

    /// Indexed ids in ascending order, strictly after `after`.
    async fn list_ids(
        &self,
        after: Option<ToolId>,
        limit: usize,
    ) -> Result<Vec<ToolId>, SearchStoreError>;
}

#[async_trait]
impl<S> SearchStore for Arc<S>
where
    S: SearchStore + ?Sized,
{
    async fn upsert(&self, doc: ToolDocument) -> Result<(), SearchStoreError> {
        (**self).upsert(doc).await
    }

    async fn delete(&self, tool_id: ToolId) -> Result<(), SearchStoreError> {
        (**self).delete(tool_id).await
    }

    async fn get(&self, tool_id: ToolId) -> Result<Option<ToolDocument>, SearchStoreError> {
        (**self).get(tool_id).await
    }

    async fn list_ids(
        &self,
        after: Option<ToolId>,
        limit: usize,
    ) -> Result<Vec<ToolId>, SearchStoreError> {
        (**self).list_ids(after, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeout_and_unavailable_are_transient() {
        assert!(SearchStoreError::Timeout.is_transient());
        assert!(SearchStoreError::Unavailable("down".into()).is_transient());
        assert!(!SearchStoreError::Rejected("mapping".into()).is_transient());
        assert!(!SearchStoreError::Malformed("bad id".into()).is_transient());
    }
}
