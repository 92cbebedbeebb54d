//! Performance benchmarks for subtree copy
//!
//! Run with: `cargo bench -p channeltree-core`
//!
//! These benchmarks compare the two copy strategies on the same source:
//! - Deep copy (one locked unit for the whole subtree)
//! - Shallow copy (one locked unit per node)
//! - Both against libsql on disk

use channeltree_core::db::{MemoryStore, TreeStore, TursoStore};
use channeltree_core::models::{ContentKind, Node, Position};
use channeltree_core::services::{CopyRequest, TreeContext, TreeService};
use channeltree_core::TreeEngineConfig;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::runtime::Runtime;

/// Build a channel with `topics` topics of `leaves` videos each.
async fn seed(service: &TreeService, topics: usize, leaves: usize) -> String {
    let ctx = TreeContext::new();
    let channel = service.create_channel(&ctx, "Bench").await.unwrap();
    for t in 0..topics {
        let topic = service
            .create_node(
                &ctx,
                Node::new(ContentKind::Topic, format!("Topic {}", t)),
                Some(&channel.root_node_id),
                Position::LastChild,
            )
            .await
            .unwrap();
        for l in 0..leaves {
            service
                .create_node(
                    &ctx,
                    Node::new(ContentKind::Video, format!("Video {}.{}", t, l)),
                    Some(&topic.id),
                    Position::LastChild,
                )
                .await
                .unwrap();
        }
    }
    channel.root_node_id
}

fn bench_copy_strategies(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let service = TreeService::new(Arc::new(MemoryStore::new()), TreeEngineConfig::default());
    let root = rt.block_on(seed(&service, 5, 8));

    let mut group = c.benchmark_group("copy_46_nodes_memory");
    group.bench_function("deep", |b| {
        b.iter(|| {
            rt.block_on(async {
                let request = CopyRequest::new(&root).with_batch_size(1000);
                black_box(service.copy_subtree(&TreeContext::new(), request).await.unwrap())
            })
        })
    });
    group.bench_function("shallow", |b| {
        b.iter(|| {
            rt.block_on(async {
                let request = CopyRequest::new(&root).with_batch_size(1);
                black_box(service.copy_subtree(&TreeContext::new(), request).await.unwrap())
            })
        })
    });
    group.finish();
}

fn bench_copy_libsql(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let temp_dir = TempDir::new().unwrap();
    let store: Arc<dyn TreeStore> = Arc::new(
        rt.block_on(TursoStore::open(temp_dir.path().join("bench.db"), 5000))
            .unwrap(),
    );
    let service = TreeService::new(store, TreeEngineConfig::default());
    let root = rt.block_on(seed(&service, 3, 5));

    let mut group = c.benchmark_group("copy_19_nodes_libsql");
    group.sample_size(10); // Fewer samples for disk-bound operations
    for (name, batch_size) in [("deep", 1000), ("shallow", 1)] {
        group.bench_function(name, |b| {
            b.iter(|| {
                rt.block_on(async {
                    let request = CopyRequest::new(&root).with_batch_size(batch_size);
                    black_box(service.copy_subtree(&TreeContext::new(), request).await.unwrap())
                })
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_copy_strategies, bench_copy_libsql);
criterion_main!(benches);
