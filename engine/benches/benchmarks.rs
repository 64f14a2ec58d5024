//! Performance benchmarks for lagless-engine

use lagless_engine::{
    fields_from_json, ClientMessage, DocChange, Document, FieldDiff, LocalStore, MergeBox,
    ServerMessage,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;

fn bench_merge_box(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_box");

    // One subscription adding fresh documents
    group.bench_function("added_new", |b| {
        let mut merge = MergeBox::new();
        let mut id = 0u64;
        b.iter(|| {
            id += 1;
            merge.added(
                "s1",
                "todos",
                &id.to_string(),
                black_box(fields_from_json(json!({"title": "A", "done": false}))),
            )
        })
    });

    // Many subscriptions overlapping on the same documents
    for subs in [2usize, 8, 32].iter() {
        group.bench_with_input(BenchmarkId::new("overlap_cycle", subs), subs, |b, &subs| {
            b.iter(|| {
                let mut merge = MergeBox::new();
                for doc in 0..100 {
                    let doc = doc.to_string();
                    for sub in 0..subs {
                        let fields = fields_from_json(json!({"title": sub, "n": doc}));
                        merge.added(&sub.to_string(), "todos", &doc, fields);
                    }
                }
                for doc in 0..100 {
                    let doc = doc.to_string();
                    for sub in 0..subs {
                        merge.removed(&sub.to_string(), "todos", &doc);
                    }
                }
                black_box(merge.is_empty())
            })
        });
    }

    group.bench_function("changed_contested_field", |b| {
        let mut merge = MergeBox::new();
        for sub in 0..8 {
            merge.added(&sub.to_string(), "todos", "1", fields_from_json(json!({"title": sub})));
        }
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            let sub = (n % 8).to_string();
            merge.changed(
                &sub,
                "todos",
                "1",
                black_box(&FieldDiff::new().set("title", json!(n))),
            )
        })
    });

    group.finish();
}

fn bench_local_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_store");

    for size in [10usize, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("simulate_retract", size), size, |b, &size| {
            let mut store = LocalStore::new();
            for id in 0..size {
                store.apply_server(
                    "todos",
                    &id.to_string(),
                    DocChange::Added(fields_from_json(json!({"title": "A"}))),
                );
            }
            b.iter(|| {
                let mut sim = store.simulate("m1");
                sim.update("todos", "0", &FieldDiff::new().set("title", json!("B")));
                sim.insert("todos", Document::new("new", Default::default()))
                    .ok();
                sim.commit();
                black_box(store.retract("m1"))
            })
        });
    }

    group.bench_function("query_filter", |b| {
        let mut store = LocalStore::new();
        for id in 0..1000 {
            store.apply_server(
                "todos",
                &id.to_string(),
                DocChange::Added(fields_from_json(json!({"done": id % 2 == 0}))),
            );
        }
        b.iter(|| {
            store
                .find("todos")
                .filter(|fields| fields.get("done") == Some(&json!(true)))
                .len()
        })
    });

    group.finish();
}

fn bench_serialization(c: &mut Criterion) {
    let mut group = c.benchmark_group("serialization");

    let added = ServerMessage::Added {
        sub: "s1".into(),
        collection: "todos".into(),
        id: "t1".into(),
        fields: fields_from_json(json!({"title": "Buy milk", "done": false, "owner": "u1"})),
    };
    group.bench_function("server_message_to_json", |b| {
        b.iter(|| serde_json::to_string(black_box(&added)).unwrap())
    });

    let method = r#"{"msg":"method","id":"7","method":"todos.insert","params":{"title":"A"},"random_seed":"c1:7"}"#;
    group.bench_function("client_message_from_json", |b| {
        b.iter(|| serde_json::from_str::<ClientMessage>(black_box(method)).unwrap())
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_merge_box,
    bench_local_store,
    bench_serialization
);
criterion_main!(benches);
