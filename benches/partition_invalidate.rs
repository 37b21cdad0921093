//! Benchmarks fingerprinting and invalidation/partitioning over a synthetic chain of targets.
#[macro_use]
extern crate criterion;

use criterion::Criterion;
use mosaic_build_core::{
    cache_key::{fingerprint_all, invalidated, InvalidationStore},
    project_util::{jvm_library_stanza, TempWorkspace},
};

fn build_fixture(num_targets: usize) -> (TempWorkspace, std::path::PathBuf) {
    let ws = TempWorkspace::new().unwrap();
    let mut body = String::new();
    for i in 0..num_targets {
        let file = format!("T{i}.java");
        ws.write_fake_source(format!("src/{file}")).unwrap();
        let deps: Vec<String> = if i == 0 { vec![] } else { vec![format!(":t{}", i - 1)] };
        let dep_refs: Vec<&str> = deps.iter().map(String::as_str).collect();
        body.push_str(&jvm_library_stanza(&format!("t{i}"), &[file.as_str()], &dep_refs));
    }
    let build_file = ws.write("src/BUILD.toml", &body).unwrap();
    (ws, build_file)
}

fn fingerprint_benchmark(c: &mut Criterion) {
    let (ws, build_file) = build_fixture(200);
    let graph = ws.load_graph([build_file]).unwrap();

    let mut group = c.benchmark_group("partition_invalidate");
    group.sample_size(10);
    group.bench_function("fingerprint_all", |b| {
        b.iter(|| fingerprint_all(&graph, ws.root()).unwrap());
    });

    let keys = fingerprint_all(&graph, ws.root()).unwrap();
    let addresses: Vec<_> = graph.addresses().cloned().collect();
    group.bench_function("invalidated_cold", |b| {
        b.iter(|| {
            let store = InvalidationStore::new();
            invalidated(&graph, &keys, &store, &addresses, false, 50).unwrap()
        });
    });

    let mut store = InvalidationStore::new();
    for address in &addresses {
        store.record(address.clone(), keys[address].hash.clone());
    }
    group.bench_function("invalidated_warm", |b| {
        b.iter(|| invalidated(&graph, &keys, &store, &addresses, false, 50).unwrap());
    });
}

criterion_group!(benches, fingerprint_benchmark);
criterion_main!(benches);
