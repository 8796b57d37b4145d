//! Benchmark for the keyspace codec and entity hydration

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fleet_core::domain::ports::KvPair;
use fleet_core::store::{decode_document, encode_document, Collection, EntityRecord};
use serde_json::{json, Value};

const BASE: &str = "instances/bench/services/web";

fn service_config(width: usize) -> Value {
    let upstreams: Vec<Value> = (0..width)
        .map(|i| {
            json!({
                "host": format!("10.0.{}.{}", i / 250, i % 250),
                "port": 8000 + i,
                "weight": 1,
                "tags": ["primary", "zone/a"],
            })
        })
        .collect();

    json!({
        "listen": {"port": 443, "tls": true},
        "upstreams": upstreams,
        "headers": {"x-request-id": "uuid", "cache-control": null},
    })
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("keyspace_codec");

    for width in [1usize, 16, 128] {
        let doc = service_config(width);
        group.throughput(Throughput::Elements(width as u64));
        group.bench_with_input(BenchmarkId::new("encode", width), &doc, |b, doc| {
            b.iter(|| encode_document(black_box(BASE), black_box(doc)));
        });
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("keyspace_codec");

    for width in [1usize, 16, 128] {
        let pairs = match encode_document(BASE, &service_config(width)) {
            Ok(pairs) => pairs,
            Err(e) => panic!("encode failed: {}", e),
        };
        group.throughput(Throughput::Elements(width as u64));
        group.bench_with_input(BenchmarkId::new("decode", width), &pairs, |b, pairs| {
            b.iter(|| decode_document(black_box(BASE), black_box(pairs)));
        });
    }

    group.finish();
}

fn bench_hydrate(c: &mut Criterion) {
    let mut group = c.benchmark_group("entity_store");

    let mut pairs = vec![
        KvPair::new("instances/bench/provider", "PACKET"),
        KvPair::new("instances/bench/owner", "proj-a"),
        KvPair::new("instances/bench/device", "dev-1"),
    ];
    for i in 0..8 {
        let base = format!("instances/bench/services/svc-{}", i);
        if let Ok(leaves) = encode_document(&base, &service_config(16)) {
            pairs.extend(leaves);
        }
    }

    group.throughput(Throughput::Elements(pairs.len() as u64));
    group.bench_function("hydrate_instance", |b| {
        b.iter(|| {
            EntityRecord::hydrate(
                black_box(Collection::Instances),
                black_box("bench"),
                black_box(pairs.clone()),
            )
        });
    });

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_hydrate);
criterion_main!(benches);
