//! End-to-end tests: catalog commits → dispatcher lanes → indexing handler →
//! search store, plus reconciliation and dead-letter replay.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::Semaphore;

use toolhub_catalog::{
    CatalogError, CatalogRecords, CreateTool, DeleteTool, InMemoryCatalog, PublishPolicy,
    ToolCommand, ToolCondition, ToolDetails, ToolEnvelope, ToolId, ToolType, UpdateTool,
};
use toolhub_core::{CategoryId, ManufacturerId};
use toolhub_events::CommitListener;

use crate::config::IndexerConfig;
use crate::dead_letter::{DeadLetterStore, InMemoryDeadLetterStore};
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::handler::IndexingHandler;
use crate::projector::{ToolDocument, project};
use crate::reconcile::{ReconcileError, ReconciliationWorker, Reconciler};
use crate::retry::RetryPolicy;
use crate::search_store::{InMemorySearchStore, SearchStore, SearchStoreError};

/// In-memory index with per-id fault injection.
#[derive(Default)]
struct FaultyStore {
    inner: InMemorySearchStore,
    always_fail: Mutex<HashSet<ToolId>>,
    fail_times: Mutex<HashMap<ToolId, u32>>,
    stalls: Mutex<HashMap<ToolId, Arc<Semaphore>>>,
    jitter: bool,
    calls: AtomicU64,
}

impl FaultyStore {
    fn with_jitter() -> Self {
        Self {
            jitter: true,
            ..Default::default()
        }
    }

    fn fail_always(&self, id: ToolId) {
        self.always_fail.lock().unwrap().insert(id);
    }

    fn heal(&self, id: ToolId) {
        self.always_fail.lock().unwrap().remove(&id);
    }

    fn fail_times(&self, id: ToolId, times: u32) {
        self.fail_times.lock().unwrap().insert(id, times);
    }

    /// Block every write for `id` until the returned semaphore gets permits.
    fn stall(&self, id: ToolId) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.stalls.lock().unwrap().insert(id, gate.clone());
        gate
    }

    async fn before_write(&self, id: ToolId) -> Result<(), SearchStoreError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.jitter {
            tokio::time::sleep(Duration::from_micros((n * 7919) % 2000)).await;
        }

        let gate = self.stalls.lock().unwrap().get(&id).cloned();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await.unwrap();
        }

        if self.always_fail.lock().unwrap().contains(&id) {
            return Err(SearchStoreError::Unavailable("injected outage".into()));
        }
        let mut remaining = self.fail_times.lock().unwrap();
        if let Some(left) = remaining.get_mut(&id) {
            if *left > 0 {
                *left -= 1;
                return Err(SearchStoreError::Timeout);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SearchStore for FaultyStore {
    async fn upsert(&self, doc: ToolDocument) -> Result<(), SearchStoreError> {
        self.before_write(doc.tool_id).await?;
        self.inner.upsert(doc).await
    }

    async fn delete(&self, tool_id: ToolId) -> Result<(), SearchStoreError> {
        self.before_write(tool_id).await?;
        self.inner.delete(tool_id).await
    }

    async fn get(&self, tool_id: ToolId) -> Result<Option<ToolDocument>, SearchStoreError> {
        self.inner.get(tool_id).await
    }

    async fn list_ids(
        &self,
        after: Option<ToolId>,
        limit: usize,
    ) -> Result<Vec<ToolId>, SearchStoreError> {
        self.inner.list_ids(after, limit).await
    }
}

/// Listener that refuses every hand-off, to simulate lost events.
struct Refusing;

#[async_trait]
impl CommitListener<ToolEnvelope> for Refusing {
    type Error = std::io::Error;

    async fn on_commit(&self, _message: ToolEnvelope) -> Result<(), Self::Error> {
        Err(std::io::Error::other("indexer unreachable"))
    }
}

struct Pipeline {
    catalog: InMemoryCatalog<Arc<Dispatcher>>,
    records: CatalogRecords,
    dispatcher: Arc<Dispatcher>,
    store: Arc<FaultyStore>,
    dead_letters: Arc<InMemoryDeadLetterStore>,
}

impl Pipeline {
    fn new(store: FaultyStore) -> Self {
        Self::with_config(store, test_config(4))
    }

    fn with_config(store: FaultyStore, config: IndexerConfig) -> Self {
        let store = Arc::new(store);
        let dead_letters = Arc::new(InMemoryDeadLetterStore::new());
        let records = CatalogRecords::new();

        let handler = IndexingHandler::new(store.clone(), records.clone(), dead_letters.clone())
            .with_retry_policy(config.retry.clone())
            .with_attempt_timeout(config.handler_timeout);
        let dispatcher = Arc::new(Dispatcher::spawn(&config, handler));
        let catalog = InMemoryCatalog::with_records(records.clone(), dispatcher.clone());

        Self {
            catalog,
            records,
            dispatcher,
            store,
            dead_letters,
        }
    }

    fn reconciler(&self) -> Reconciler<CatalogRecords, Arc<FaultyStore>> {
        Reconciler::new(
            self.dispatcher.clone(),
            self.records.clone(),
            self.store.clone(),
            self.dead_letters.clone(),
        )
        .with_batch_size(2)
    }

    async fn commit(&self, commands: Vec<ToolCommand>) {
        let mut tx = self.catalog.begin();
        for command in commands {
            tx.execute(command);
        }
        tx.commit().await.unwrap();
    }

    async fn doc(&self, id: i64) -> Option<ToolDocument> {
        self.store.get(ToolId::new(id)).await.unwrap()
    }
}

fn test_config(lanes: usize) -> IndexerConfig {
    IndexerConfig {
        lanes,
        lane_capacity: 256,
        submit_timeout: Duration::from_millis(500),
        handler_timeout: Duration::from_secs(2),
        retry: RetryPolicy::fixed(3, Duration::from_millis(1)),
        ..Default::default()
    }
}

fn details(price: i64, description: &str) -> ToolDetails {
    ToolDetails {
        manufacturer_id: ManufacturerId::new(11),
        category_id: CategoryId::new(5),
        tool_type: ToolType::Hand,
        condition: ToolCondition::New,
        price: Decimal::from(price),
        description: description.to_string(),
    }
}

fn create(id: i64, price: i64, description: &str) -> ToolCommand {
    ToolCommand::Create(CreateTool {
        tool_id: ToolId::new(id),
        details: details(price, description),
    })
}

fn update(id: i64, price: i64) -> ToolCommand {
    ToolCommand::Update(UpdateTool {
        tool_id: ToolId::new(id),
        details: details(price, "updated"),
    })
}

fn delete(id: i64) -> ToolCommand {
    ToolCommand::Delete(DeleteTool {
        tool_id: ToolId::new(id),
    })
}

/// Ids `a` and `b` that live on different lanes.
fn ids_on_different_lanes(dispatcher: &Dispatcher) -> (i64, i64) {
    let a = 1;
    let lane_a = dispatcher.lane_for(ToolId::new(a));
    let b = (2..1000)
        .find(|id| dispatcher.lane_for(ToolId::new(*id)) != lane_a)
        .unwrap();
    (a, b)
}

#[tokio::test]
async fn created_then_deleted_leaves_no_document() {
    let p = Pipeline::new(FaultyStore::default());

    p.commit(vec![create(1, 3000, "desc")]).await;
    p.commit(vec![delete(1)]).await;
    p.dispatcher.flush().await.unwrap();

    assert!(p.doc(1).await.is_none());
    assert!(p.dead_letters.is_empty());
}

#[tokio::test]
async fn created_then_updated_indexes_latest_price() {
    let p = Pipeline::new(FaultyStore::default());

    p.commit(vec![create(2, 100, "desc")]).await;
    p.commit(vec![update(2, 200)]).await;
    p.dispatcher.flush().await.unwrap();

    let doc = p.doc(2).await.unwrap();
    assert_eq!(doc.price, Decimal::from(200));
    assert_eq!(doc.version, 2);
    assert_eq!(doc, project(&p.catalog.get(ToolId::new(2)).unwrap().unwrap()));
}

#[tokio::test]
async fn nothing_reaches_the_index_before_commit_or_after_rollback() {
    let p = Pipeline::new(FaultyStore::default());

    let mut tx = p.catalog.begin();
    tx.execute(create(3, 10, "staged"));
    p.dispatcher.flush().await.unwrap();
    assert!(p.doc(3).await.is_none());
    tx.rollback();

    {
        let mut dropped = p.catalog.begin();
        dropped.execute(create(4, 10, "dropped"));
    }

    let mut failing = p.catalog.begin();
    failing.execute(create(5, 10, "ok")).execute(update(6, 10));
    assert!(failing.commit().await.is_err());

    p.dispatcher.flush().await.unwrap();
    assert!(p.store.inner.is_empty());
    assert_eq!(p.store.calls.load(Ordering::SeqCst), 0);
    assert_eq!(p.dispatcher.stats().totals().processed, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn final_state_matches_latest_snapshot_under_scheduling_jitter() {
    let p = Arc::new(Pipeline::new(FaultyStore::with_jitter()));

    let mut writers = Vec::new();
    for id in 1..=12i64 {
        let p = p.clone();
        writers.push(tokio::spawn(async move {
            p.commit(vec![create(id, id, "v1")]).await;
            for step in 1..=8 {
                p.commit(vec![update(id, id * 100 + step)]).await;
            }
            if id % 3 == 0 {
                p.commit(vec![delete(id)]).await;
            }
        }));
    }
    for writer in writers {
        writer.await.unwrap();
    }
    p.dispatcher.flush().await.unwrap();

    for id in 1..=12i64 {
        let committed = p.catalog.get(ToolId::new(id)).unwrap();
        let indexed = p.doc(id).await;
        assert_eq!(indexed, committed.as_ref().map(project), "tool {id}");
    }
    assert!(p.dead_letters.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stalled_id_does_not_delay_other_lanes() {
    let p = Pipeline::new(FaultyStore::default());
    let (a, b) = ids_on_different_lanes(&p.dispatcher);
    let gate = p.store.stall(ToolId::new(a));

    p.commit(vec![create(a, 1, "stalled")]).await;
    p.commit(vec![create(b, 2, "free")]).await;

    let indexed_b = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if p.doc(b).await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(indexed_b.is_ok(), "tool {b} waited behind stalled tool {a}");
    assert!(p.doc(a).await.is_none());

    gate.add_permits(Semaphore::MAX_PERMITS);
    p.dispatcher.flush().await.unwrap();
    assert!(p.doc(a).await.is_some());
}

#[tokio::test]
async fn redelivered_and_reordered_events_are_harmless() {
    let records = CatalogRecords::new();
    let collected = Arc::new(Collect::default());
    let source_catalog = InMemoryCatalog::with_records(records.clone(), collected.clone());

    let mut tx = source_catalog.begin();
    tx.execute(create(7, 10, "a")).execute(update(7, 20)).execute(update(7, 30));
    tx.commit().await.unwrap();
    let envelopes = collected.take();
    assert_eq!(envelopes.len(), 3);

    let store = Arc::new(InMemorySearchStore::new());
    let dead_letters = Arc::new(InMemoryDeadLetterStore::new());
    let handler = IndexingHandler::new(store.clone(), records.clone(), dead_letters);
    let dispatcher = Dispatcher::spawn(&test_config(2), handler);

    // Newest first, then everything again.
    dispatcher.submit(envelopes[2].clone()).await.unwrap();
    for envelope in envelopes.iter().cloned() {
        dispatcher.submit(envelope).await.unwrap();
    }
    dispatcher.flush().await.unwrap();

    let doc = store.get(ToolId::new(7)).await.unwrap().unwrap();
    assert_eq!(doc.price, Decimal::from(30));
    assert_eq!(store.writes(), 1);
    let totals = dispatcher.stats().totals();
    assert_eq!(totals.processed, 1);
    assert_eq!(totals.skipped, 3);

    // Deleting an id that was never indexed succeeds.
    store.delete(ToolId::new(404)).await.unwrap();
}

#[tokio::test]
async fn always_failing_store_dead_letters_once_and_lane_continues() {
    let p = Pipeline::with_config(FaultyStore::default(), test_config(1));
    p.store.fail_always(ToolId::new(20));

    p.commit(vec![create(20, 1, "broken")]).await;
    p.commit(vec![create(21, 2, "fine")]).await;
    p.dispatcher.flush().await.unwrap();

    let records = p.dead_letters.list(10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].tool_id, ToolId::new(20));
    assert_eq!(records[0].attempts, 3);
    assert!(p.doc(21).await.is_some());

    let totals = p.dispatcher.stats().totals();
    assert_eq!(totals.dead_lettered, 1);
    assert_eq!(totals.retries, 2);
    assert_eq!(totals.processed, 2);
}

#[tokio::test]
async fn transient_failures_recover_without_dead_letters() {
    let p = Pipeline::new(FaultyStore::default());
    p.store.fail_times(ToolId::new(30), 2);

    p.commit(vec![create(30, 5, "flaky")]).await;
    p.dispatcher.flush().await.unwrap();

    assert!(p.doc(30).await.is_some());
    assert!(p.dead_letters.is_empty());
    assert_eq!(p.dispatcher.stats().totals().retries, 2);
}

#[tokio::test]
async fn sweep_repairs_lost_events_and_orphaned_documents() {
    let p = Pipeline::new(FaultyStore::default());

    // Commits whose hand-off never reached the dispatcher.
    let lossy = InMemoryCatalog::with_records(p.records.clone(), Refusing).with_publish_policy(
        PublishPolicy {
            attempts: 1,
            backoff: Duration::from_millis(1),
        },
    );
    let mut tx = lossy.begin();
    tx.execute(create(40, 1, "lost")).execute(create(41, 2, "lost"));
    tx.execute(create(42, 3, "lost"));
    tx.commit().await.unwrap();
    assert_eq!(lossy.unpublished().unwrap().len(), 3);

    // A document the catalog has never heard of.
    p.store.inner.upsert(orphan(99)).await.unwrap();

    let report = p.reconciler().sweep().await.unwrap();
    p.dispatcher.flush().await.unwrap();

    assert_eq!(report.unpublished, 3);
    assert_eq!(report.catalog_ids, 3);
    assert_eq!(report.orphaned, 1);
    assert_eq!(report.queued, 7);
    for id in 40..=42 {
        assert!(p.doc(id).await.is_some(), "tool {id} not repaired");
    }
    assert!(p.doc(99).await.is_none());
    assert!(p.records.unpublished().unwrap().is_empty());
}

#[tokio::test]
async fn replayed_dead_letters_are_reindexed_and_removed() {
    let p = Pipeline::new(FaultyStore::default());
    p.store.fail_always(ToolId::new(50));

    p.commit(vec![create(50, 1, "x")]).await;
    p.commit(vec![update(50, 2)]).await;
    p.dispatcher.flush().await.unwrap();
    assert_eq!(p.dead_letters.len(), 2);

    p.store.heal(ToolId::new(50));
    let replayed = p.reconciler().replay_dead_letters(10).await.unwrap();
    p.dispatcher.flush().await.unwrap();

    assert_eq!(replayed, 2);
    assert!(p.dead_letters.is_empty());
    let doc = p.doc(50).await.unwrap();
    assert_eq!(doc.price, Decimal::from(2));
    assert_eq!(doc.version, 2);
}

#[tokio::test]
async fn reconciliation_worker_sweeps_on_its_interval() {
    let p = Pipeline::new(FaultyStore::default());
    let lossy = InMemoryCatalog::with_records(p.records.clone(), Refusing).with_publish_policy(
        PublishPolicy {
            attempts: 1,
            backoff: Duration::from_millis(1),
        },
    );
    let mut tx = lossy.begin();
    tx.execute(create(60, 1, "lost"));
    tx.commit().await.unwrap();

    let worker = ReconciliationWorker::spawn(Arc::new(p.reconciler()), Duration::from_millis(20));
    let repaired = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if p.doc(60).await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    worker.shutdown().await;

    assert!(repaired.is_ok());
}

#[tokio::test]
async fn reconcile_is_serialized_behind_queued_events() {
    let p = Pipeline::new(FaultyStore::default());
    p.commit(vec![create(70, 1, "a")]).await;
    p.commit(vec![update(70, 2)]).await;
    p.reconciler().reconcile([ToolId::new(70)]).await.unwrap();
    p.dispatcher.flush().await.unwrap();

    assert_eq!(p.doc(70).await.unwrap().version, 2);
    let report = p.dispatcher.shutdown(Duration::from_secs(1)).await;
    assert!(report.drained);
    assert!(p.reconciler().reconcile([ToolId::new(70)]).await.is_err());
}

#[tokio::test]
async fn late_update_cannot_resurrect_a_reconciled_deletion() {
    let p = Pipeline::new(FaultyStore::default());
    let collect = Arc::new(Collect::default());
    let source = InMemoryCatalog::with_records(p.records.clone(), collect.clone());

    for command in [create(8, 10, "drill"), update(8, 20), delete(8)] {
        let mut tx = source.begin();
        tx.execute(command);
        tx.commit().await.unwrap();
    }
    let envelopes = collect.take();
    assert_eq!(envelopes.len(), 3);

    // The deletion never reaches the lane; reconciliation sees the tombstone
    // and an older update arrives afterwards.
    p.dispatcher.submit(envelopes[0].clone()).await.unwrap();
    p.dispatcher.reconcile(ToolId::new(8)).await.unwrap();
    p.dispatcher.submit(envelopes[1].clone()).await.unwrap();
    p.dispatcher.flush().await.unwrap();

    assert!(p.records.get(ToolId::new(8)).unwrap().is_none());
    assert!(p.doc(8).await.is_none());
    assert_eq!(p.dispatcher.stats().totals().skipped, 1);
}

#[tokio::test]
async fn sweep_after_shutdown_keeps_the_unpublished_backlog() {
    let p = Pipeline::new(FaultyStore::default());
    let lossy = InMemoryCatalog::with_records(p.records.clone(), Refusing).with_publish_policy(
        PublishPolicy {
            attempts: 1,
            backoff: Duration::from_millis(1),
        },
    );
    let mut tx = lossy.begin();
    tx.execute(create(80, 1, "lost")).execute(create(81, 2, "lost"));
    tx.commit().await.unwrap();

    p.dispatcher.shutdown(Duration::from_secs(1)).await;
    let err = p.reconciler().sweep().await.unwrap_err();

    assert!(matches!(err, ReconcileError::Dispatch(DispatchError::Closed)));
    assert_eq!(
        p.records.unpublished().unwrap(),
        vec![ToolId::new(80), ToolId::new(81)]
    );
}

#[derive(Default)]
struct Collect {
    seen: Mutex<Vec<ToolEnvelope>>,
}

impl Collect {
    fn take(&self) -> Vec<ToolEnvelope> {
        std::mem::take(&mut *self.seen.lock().unwrap())
    }
}

#[async_trait]
impl CommitListener<ToolEnvelope> for Collect {
    type Error = CatalogError;

    async fn on_commit(&self, message: ToolEnvelope) -> Result<(), Self::Error> {
        self.seen.lock().unwrap().push(message);
        Ok(())
    }
}

fn orphan(id: i64) -> ToolDocument {
    ToolDocument {
        tool_id: ToolId::new(id),
        manufacturer_id: ManufacturerId::new(1),
        category_id: CategoryId::new(1),
        type_name: "GARDEN".to_string(),
        condition_name: "WORN".to_string(),
        price: Decimal::ZERO,
        description: "left behind".to_string(),
        version: 1,
    }
}
