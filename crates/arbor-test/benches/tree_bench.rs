//! Benchmarks for sequenced-op application and snapshots

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use arbor_core::{DirectoryOp, ReplicaId, SequencedOp, TreePath, Value};
use arbor_state::DirectoryTree;

fn sequenced_sets(count: u64) -> Vec<SequencedOp> {
    (1..=count)
        .map(|seq| SequencedOp {
            global_seq: seq,
            origin: ReplicaId::new(99),
            local_seq: None,
            op: DirectoryOp::Set {
                path: TreePath::root(),
                key: format!("key-{}", seq % 64),
                value: Value::from(seq as i64),
            },
        })
        .collect()
}

fn bench_apply_sequenced_sets(c: &mut Criterion) {
    let batch = sequenced_sets(1_000);

    c.bench_function("apply_1k_sequenced_sets", |b| {
        b.iter(|| {
            let mut tree = DirectoryTree::attached(ReplicaId::new(1));
            tree.process_batch(black_box(&batch))
        })
    });
}

fn bench_serialize(c: &mut Criterion) {
    let batch = sequenced_sets(1_000);
    let mut tree = DirectoryTree::attached(ReplicaId::new(1));
    tree.process_batch(&batch);

    c.bench_function("serialize_64_keys", |b| b.iter(|| black_box(tree.serialize())));
}

criterion_group!(benches, bench_apply_sequenced_sets, bench_serialize);
criterion_main!(benches);
