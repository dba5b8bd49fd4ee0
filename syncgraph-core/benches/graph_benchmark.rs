use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use serde_json::json;
use std::hint::black_box;
use syncgraph_core::{DocGraph, EventCoalescer, GraphMutations, ObjectId, Operation, OperationSink};

/// A graph with `n` objects appended to one array, each with a few props.
fn build_history(n: usize) -> Vec<Operation> {
    let mut g = DocGraph::new();
    let arr = g.create_array().unwrap();
    let mut last: Option<ObjectId> = None;
    for i in 0..n {
        let id = g
            .create_object([
                ("type", json!("cube")),
                ("tx", json!(i)),
                ("color", json!("#00ff00")),
            ])
            .unwrap();
        g.insert_after(&arr, last.as_ref().map(ObjectId::to_value), &id)
            .unwrap();
        last = Some(id);
    }
    g.history().to_vec()
}

fn bench_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("DocGraph");
    let history = build_history(1_000);
    group.throughput(Throughput::Elements(history.len() as u64));

    group.bench_function("replay_1k_objects", |b| {
        b.iter(|| {
            let g = DocGraph::from_history(black_box(&history)).unwrap();
            black_box(g.object_count());
        })
    });

    group.finish();
}

fn bench_coalesced_drag(c: &mut Criterion) {
    let mut group = c.benchmark_group("EventCoalescer");
    group.throughput(Throughput::Elements(100));

    group.bench_function("100_sets_one_tick", |b| {
        let mut coalescer = EventCoalescer::default();
        let id = coalescer.create_object([("tx", json!(0))]).unwrap();
        coalescer.on_change(|batch| {
            black_box(batch.operations.len());
        });
        b.iter(|| {
            for i in 0..100 {
                coalescer.set_property(&id, "tx", black_box(i)).unwrap();
            }
            coalescer.tick();
        })
    });

    group.finish();
}

fn bench_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("Operation encoding");
    let history = build_history(100);
    group.throughput(Throughput::Elements(history.len() as u64));

    group.bench_function("encode_json", |b| {
        b.iter(|| serde_json::to_vec(black_box(&history)).unwrap())
    });

    let encoded = serde_json::to_vec(&history).unwrap();
    group.bench_function("decode_json", |b| {
        b.iter(|| {
            let ops: Vec<Operation> = serde_json::from_slice(black_box(&encoded)).unwrap();
            black_box(ops.len());
        })
    });

    group.finish();
}

criterion_group!(benches, bench_replay, bench_coalesced_drag, bench_encoding);
criterion_main!(benches);
