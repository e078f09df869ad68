//! Tool catalog: the `Tool` aggregate and an in-memory transactional system of
//! record that emits one event per committed mutation.

pub mod catalog;
pub mod error;
pub mod source;
pub mod tool;

pub use catalog::{
    CatalogRecords, InMemoryCatalog, PublishPolicy, TOOL_AGGREGATE_TYPE, ToolEnvelope, Transaction,
};
pub use error::CatalogError;
pub use source::{SnapshotSource, ToolState};
pub use tool::{
    CreateTool, DeleteTool, Tool, ToolCommand, ToolCondition, ToolDetails, ToolEvent, ToolId,
    ToolSnapshot, ToolType, UpdateTool,
};
