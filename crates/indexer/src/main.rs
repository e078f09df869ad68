//! toolhub-indexer: keeps the tool search index in step with the catalog.
//!
//! The search engine and the relational catalog are external collaborators;
//! this binary wires the in-memory implementations so the pipeline can run
//! standalone. It is a wiring skeleton: it accepts no writes of its own. An
//! ingress (HTTP, queue consumer) would own `catalog` and commit through it;
//! until one is mounted, only reconciliation sweeps produce work.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use toolhub_catalog::{CatalogRecords, InMemoryCatalog};
use toolhub_indexer::{
    DeadLetterStore, Dispatcher, FileDeadLetterStore, InMemoryDeadLetterStore,
    InMemorySearchStore, IndexerConfig, IndexingHandler, ReconciliationWorker, Reconciler,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    toolhub_observability::init();

    let config = IndexerConfig::from_env().context("loading indexer configuration")?;
    info!(?config, "starting toolhub-indexer");

    let dead_letters = open_dead_letters(&config).await?;
    let index = Arc::new(InMemorySearchStore::new());
    let records = CatalogRecords::new();

    let handler = IndexingHandler::new(index.clone(), records.clone(), dead_letters.clone())
        .with_retry_policy(config.retry.clone())
        .with_attempt_timeout(config.handler_timeout);
    let dispatcher = Arc::new(Dispatcher::spawn(&config, handler));

    // Commits made through this catalog are handed to the dispatcher.
    let catalog = InMemoryCatalog::with_records(records.clone(), dispatcher.clone());

    let reconciler = Arc::new(
        Reconciler::new(dispatcher.clone(), records, index.clone(), dead_letters)
            .with_batch_size(config.reconcile_batch_size),
    );
    let worker = ReconciliationWorker::spawn(reconciler, config.reconcile_interval);

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown requested");

    worker.shutdown().await;
    match catalog.unpublished() {
        Ok(ids) if !ids.is_empty() => {
            info!(count = ids.len(), "unpublished commits left for the next sweep")
        }
        Ok(_) => {}
        Err(err) => warn!(error = %err, "unpublished backlog unreadable"),
    }
    let report = dispatcher.shutdown(config.shutdown_deadline).await;
    info!(
        drained = report.drained,
        abandoned = report.abandoned.len(),
        stats = %serde_json::to_string(&report.stats).unwrap_or_default(),
        "toolhub-indexer stopped"
    );
    Ok(())
}

async fn open_dead_letters(config: &IndexerConfig) -> anyhow::Result<Arc<dyn DeadLetterStore>> {
    #[cfg(feature = "postgres")]
    if let Some(url) = &config.database_url {
        let store = toolhub_indexer::PostgresDeadLetterStore::connect(url)
            .await
            .context("connecting dead-letter database")?;
        store
            .ensure_schema()
            .await
            .context("creating dead-letter table")?;
        info!("dead letters stored in postgres");
        return Ok(Arc::new(store));
    }

    match &config.dead_letter_path {
        Some(path) => {
            let store = FileDeadLetterStore::open(path)
                .await
                .with_context(|| format!("opening dead-letter file {}", path.display()))?;
            info!(path = %path.display(), "dead letters stored in file");
            Ok(Arc::new(store))
        }
        None => {
            info!("dead letters kept in memory");
            Ok(Arc::new(InMemoryDeadLetterStore::new()))
        }
    }
}
