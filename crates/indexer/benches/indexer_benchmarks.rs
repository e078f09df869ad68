use std::sync::Arc;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rust_decimal::Decimal;

use toolhub_catalog::{
    CatalogRecords, CreateTool, InMemoryCatalog, ToolCommand, ToolCondition, ToolDetails, ToolId,
    ToolSnapshot, ToolType,
};
use toolhub_core::{CategoryId, ManufacturerId};
use toolhub_indexer::{
    Dispatcher, InMemoryDeadLetterStore, InMemorySearchStore, IndexerConfig, IndexingHandler,
    project,
};

fn snapshot(id: i64) -> ToolSnapshot {
    ToolSnapshot {
        tool_id: ToolId::new(id),
        manufacturer_id: ManufacturerId::new(3),
        category_id: CategoryId::new(9),
        tool_type: ToolType::Measuring,
        condition: ToolCondition::Good,
        price: Decimal::new(129_99, 2),
        description: "digital caliper, 150mm, stainless".to_string(),
        version: 4,
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("tokio runtime")
}

fn bench_projector(c: &mut Criterion) {
    let snap = snapshot(1);
    c.bench_function("project_snapshot", |b| b.iter(|| project(black_box(&snap))));
}

fn bench_lane_selection(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("lane_for");

    for lanes in [4usize, 16, 64] {
        let dispatcher = rt.block_on(async {
            let config = IndexerConfig {
                lanes,
                ..Default::default()
            };
            let handler = IndexingHandler::new(
                InMemorySearchStore::new(),
                CatalogRecords::new(),
                Arc::new(InMemoryDeadLetterStore::new()),
            );
            Dispatcher::spawn(&config, handler)
        });

        group.bench_with_input(BenchmarkId::from_parameter(lanes), &dispatcher, |b, d| {
            let mut id = 0i64;
            b.iter(|| {
                id += 1;
                d.lane_for(black_box(ToolId::new(id)))
            })
        });
    }
    group.finish();
}

fn bench_commit_to_index(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("commit_to_index");
    group.measurement_time(Duration::from_secs(10));

    for batch in [100i64, 1_000] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter(|| {
                rt.block_on(async {
                    let records = CatalogRecords::new();
                    let handler = IndexingHandler::new(
                        Arc::new(InMemorySearchStore::new()),
                        records.clone(),
                        Arc::new(InMemoryDeadLetterStore::new()),
                    );
                    let dispatcher = Arc::new(Dispatcher::spawn(&IndexerConfig::default(), handler));
                    let catalog = InMemoryCatalog::with_records(records, dispatcher.clone());

                    for id in 0..batch {
                        let snap = snapshot(id);
                        let mut tx = catalog.begin();
                        tx.execute(ToolCommand::Create(CreateTool {
                            tool_id: snap.tool_id,
                            details: ToolDetails {
                                manufacturer_id: snap.manufacturer_id,
                                category_id: snap.category_id,
                                tool_type: snap.tool_type,
                                condition: snap.condition,
                                price: snap.price,
                                description: snap.description,
                            },
                        }));
                        tx.commit().await.expect("commit");
                    }
                    dispatcher.flush().await.expect("flush");
                    dispatcher.shutdown(Duration::from_secs(5)).await
                })
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_projector, bench_lane_selection, bench_commit_to_index);
criterion_main!(benches);
