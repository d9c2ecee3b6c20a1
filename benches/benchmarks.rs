//! Performance benchmarks for tether-store

use std::sync::Arc;

use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::{json, Value};
use tether_store::{
    CollectionSpec, FetchError, PageQuery, RemoteDataSource, Store, StoreConfig, UpdateOptions,
    WriteError,
};

struct NullSource;

#[async_trait]
impl RemoteDataSource for NullSource {
    async fn fetch_page(&self, _kind: &str, _query: PageQuery) -> Result<Vec<Value>, FetchError> {
        Ok(Vec::new())
    }

    async fn write(&self, _kind: &str, _id: &str, payload: Value) -> Result<Value, WriteError> {
        Ok(payload)
    }
}

fn build_store() -> Store {
    Store::new(
        Arc::new(NullSource),
        StoreConfig::default(),
        vec![CollectionSpec::new("organizations")],
    )
}

fn org_page(count: usize) -> Vec<Value> {
    (0..count)
        .map(|i| {
            json!({
                "id": format!("org_{}", i),
                "name": format!("Organization {}", i),
                "employees": i,
            })
        })
        .collect()
}

fn bench_store_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_operations");

    // Benchmark store creation
    group.bench_function("store_new", |b| b.iter(build_store));

    // Benchmark page hydration (upsert path after the first iteration)
    group.bench_function("hydrate_page_100", |b| {
        let store = build_store();
        let orgs = store.collection("organizations").unwrap();
        let page = org_page(100);

        b.iter(|| orgs.hydrate(black_box(page.clone())))
    });

    // Benchmark record lookup
    group.bench_function("get_record", |b| {
        let store = build_store();
        let orgs = store.collection("organizations").unwrap();
        orgs.hydrate(org_page(1000));

        b.iter(|| orgs.get(black_box("org_500")))
    });

    // Benchmark ordered iteration
    group.bench_function("to_array", |b| {
        let store = build_store();
        let orgs = store.collection("organizations").unwrap();
        orgs.hydrate(org_page(1000));

        b.iter(|| orgs.to_array())
    });

    group.finish();
}

fn bench_record_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_operations");

    // Benchmark draft edits
    group.bench_function("update_draft", |b| {
        let store = build_store();
        let orgs = store.collection("organizations").unwrap();
        orgs.hydrate(org_page(1));
        let record = orgs.get("org_0").unwrap();
        let mut n = 0u64;

        b.iter(|| {
            n += 1;
            record.update(UpdateOptions::default(), |draft| {
                draft["employees"] = json!(n);
            })
        })
    });

    // Benchmark draft reads
    group.bench_function("read_draft", |b| {
        let store = build_store();
        let orgs = store.collection("organizations").unwrap();
        orgs.hydrate(org_page(1));
        let record = orgs.get("org_0").unwrap();

        b.iter(|| black_box(record.read()))
    });

    group.finish();
}

criterion_group!(benches, bench_store_operations, bench_record_operations);
criterion_main!(benches);
