use thiserror::Error;

use toolhub_core::DomainError;

use crate::tool::ToolId;

/// Errors surfaced by the catalog (system of record).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CatalogError {
    /// A staged command was rejected; nothing in the transaction was committed.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Internal lock poisoning (a writer panicked mid-commit).
    #[error("catalog state lock poisoned")]
    Poisoned,

    /// The transaction committed, but the listener refused `tool_id` and the
    /// unpublished backlog could not record it.
    #[error("tool {tool_id} committed but lost from the unpublished backlog")]
    BacklogLost { tool_id: ToolId },
}
