//! Commit-gated search projection pipeline for the tool catalog.
//!
//! Committed catalog events enter through [`Dispatcher`] (a
//! [`toolhub_events::CommitListener`]), are sharded onto per-id lanes, and are
//! applied to a [`SearchStore`] by the [`IndexingHandler`]. Failures end up in
//! a [`DeadLetterStore`]; the [`Reconciler`] repairs whatever the event path
//! missed.

pub mod config;
pub mod dead_letter;
pub mod dispatcher;
pub mod handler;
pub mod projector;
pub mod reconcile;
pub mod retry;
pub mod search_store;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, IndexerConfig};
pub use dead_letter::{
    DeadLetterError, DeadLetterRecord, DeadLetterStore, FileDeadLetterStore,
    InMemoryDeadLetterStore,
};
#[cfg(feature = "postgres")]
pub use dead_letter::PostgresDeadLetterStore;
pub use dispatcher::{
    AbandonedTask, DispatchError, Dispatcher, DispatcherStats, LaneStats, ShutdownReport,
    SubmitError,
};
pub use handler::{IndexingHandler, Outcome, Reconciled, ToolEventHandler};
pub use projector::{ToolDocument, project};
pub use reconcile::{
    ReconcileError, ReconciliationHandle, ReconciliationWorker, Reconciler, SweepReport,
};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use search_store::{InMemorySearchStore, SearchStore, SearchStoreError};
