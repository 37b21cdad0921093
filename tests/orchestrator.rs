//! Exercises the full vertical slice through the public API: manifest parse, graph resolution,
//! exclusives propagation, invalidation, and compile orchestration against a mock compiler.

use std::collections::BTreeMap;

use mosaic_build_core::{
    cache_key::{fingerprint_all, invalidated, InvalidationStore},
    compiler::mock::MockCompiler,
    exclusives, project_util::{jar_library_stanza, jvm_library_stanza, TempWorkspace},
    BuildConfig, CacheKey, ExclusivesGroups, LocalArtifactCache, Orchestrator, RunTracker,
    WorkerPool, WorkUnit,
};

#[test]
fn compiles_a_two_target_build_end_to_end() {
    let ws = TempWorkspace::new().unwrap();
    ws.write_fake_source("src/a/Lib.java").unwrap();
    ws.write_fake_source("src/a/Main.java").unwrap();

    let mut body = jar_library_stanza("guava", &["guava-31.jar"]);
    body.push_str(&jvm_library_stanza("lib", &["Lib.java"], &[]));
    body.push_str(&jvm_library_stanza("main", &["Main.java"], &[":lib", ":guava"]));
    let build_file = ws.write("src/a/BUILD.toml", &body).unwrap();

    let graph = ws.load_graph([build_file.clone()]).unwrap();
    let addresses: Vec<_> = graph.addresses().cloned().collect();

    let computed = exclusives::propagate(&graph).unwrap();
    exclusives::check_strict(&computed).unwrap();

    let config = BuildConfig::builder(ws.root())
        .info_dir(ws.root().join(".build/runs"))
        .cache_root(ws.root().join(".build/cache"))
        .build()
        .unwrap();

    let keys: BTreeMap<_, CacheKey> = fingerprint_all(&graph, &config.workspace_root).unwrap();
    let store = InvalidationStore::new();
    let result = invalidated(&graph, &keys, &store, &addresses, false, 100).unwrap();
    assert_eq!(result.invalid_vts.len(), addresses.len());

    let compiler = MockCompiler::new();
    let cache = LocalArtifactCache::new(config.workspace_root.clone(), config.cache_root.clone()).unwrap();
    let worker_pool = WorkerPool::new(2).unwrap();
    let run_tracker = RunTracker::new(config.info_dir.clone()).unwrap();
    let exclusives_groups = ExclusivesGroups::new();
    let root_unit = WorkUnit::root("all");

    let orchestrator = Orchestrator::new(
        &graph,
        &compiler,
        &cache,
        &worker_pool,
        &run_tracker,
        &exclusives_groups,
        config.workspace_root.clone(),
        "local",
    );

    let group_of = BTreeMap::new();
    let output = orchestrator.run(&root_unit, &result.invalid_vts_partitioned, &group_of).unwrap();

    for address in &addresses {
        assert!(output.per_target.contains_key(address), "missing artifacts for {address}");
    }

    // A second run with nothing changed should find every target already valid.
    let mut store = InvalidationStore::new();
    for vt in &result.invalid_vts {
        store.record(vt.address.clone(), vt.cache_key.hash.clone());
    }
    let keys_again = fingerprint_all(&graph, &config.workspace_root).unwrap();
    let result_again = invalidated(&graph, &keys_again, &store, &addresses, false, 100).unwrap();
    assert!(result_again.invalid_vts.is_empty());
}
