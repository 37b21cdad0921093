//! Fingerprinting of target inputs and invalid/valid partitioning.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    sync::Mutex,
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::instrument;

use crate::{address::Address, error::Result, graph::BuildGraph};

/// `{id, hash, sources}`. `id` is a human-readable composite used as the cache directory's
/// outer path component; `hash` is the hex digest folding in the payload's own fingerprint plus
/// every transitive dependency's hash, so that any change anywhere upstream invalidates
/// everything downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheKey {
    pub id: String,
    pub hash: String,
    pub sources: Vec<PathBuf>,
}

/// Computes the fingerprint of one target: its own sources-root-relative path, every source
/// file's relative path and exact contents (sorted), then a canonical serialization of the rest
/// of the payload, with dependency fingerprints folded in dependency-graph order.
#[instrument(level = "trace", skip(graph), fields(address = %address))]
pub fn fingerprint(
    graph: &BuildGraph,
    address: &Address,
    workspace_root: &std::path::Path,
    dep_hashes: &BTreeMap<Address, String>,
) -> Result<CacheKey> {
    let target = graph.get_target(address)?;
    let mut hasher = Sha256::new();

    let sources_root = match &target.payload {
        crate::graph::Payload::JvmSources { sources_rel_path, .. } => sources_rel_path.clone(),
        crate::graph::Payload::JarLibrary { .. } => PathBuf::new(),
    };
    hasher.update(sources_root.to_string_lossy().as_bytes());
    target.payload.invalidation_hash(&mut hasher, workspace_root)?;

    for dep in graph.dependencies_of(address)? {
        if let Some(dep_hash) = dep_hashes.get(dep) {
            hasher.update(dep_hash.as_bytes());
        }
    }

    let hash = hex::encode(hasher.finalize());
    Ok(CacheKey { id: target.id.clone(), hash, sources: target.sources().to_vec() })
}

/// Computes fingerprints for every target in `graph` in dependency order, so each target's hash
/// already reflects every upstream dependency by the time it is folded into a dependent's hash.
pub fn fingerprint_all(
    graph: &BuildGraph,
    workspace_root: &std::path::Path,
) -> Result<BTreeMap<Address, CacheKey>> {
    let order = graph.sorted_targets()?; // most-dependent first
    let mut hashes: BTreeMap<Address, String> = BTreeMap::new();
    let mut keys: BTreeMap<Address, CacheKey> = BTreeMap::new();
    for address in order.iter().rev() {
        let key = fingerprint(graph, address, workspace_root, &hashes)?;
        hashes.insert(address.clone(), key.hash.clone());
        keys.insert(address.clone(), key);
    }
    Ok(keys)
}

/// A target bound to a cache key and a validity bit, tracked across invalidation runs so the
/// caller can persist the new fingerprint only once the corresponding work has actually
/// succeeded.
#[derive(Debug, Clone)]
pub struct VersionedTarget {
    pub address: Address,
    pub cache_key: CacheKey,
    valid: bool,
}

impl VersionedTarget {
    pub fn valid(&self) -> bool {
        self.valid
    }
}

/// A partition of [`VersionedTarget`]s that can be manipulated atomically (as a single unit of
/// compile/cache work) while still exposing the members for per-target artifact writeback.
#[derive(Debug)]
pub struct VersionedTargetSet {
    pub versioned_targets: Vec<VersionedTarget>,
    committed: Mutex<BTreeSet<Address>>,
}

impl VersionedTargetSet {
    pub fn new(versioned_targets: Vec<VersionedTarget>) -> Self {
        Self { versioned_targets, committed: Mutex::new(BTreeSet::new()) }
    }

    pub fn is_valid(&self) -> bool {
        self.versioned_targets.iter().all(|vt| vt.valid)
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.versioned_targets.iter().map(|vt| vt.address.clone()).collect()
    }

    /// Persists the new fingerprint for every member, to be called once the caller's work for
    /// this partition has fully succeeded. If the caller instead propagates an error, this must
    /// not be called, and the partition naturally re-invalidates on the next run.
    pub fn update(&self, store: &mut InvalidationStore) {
        let mut committed = self.committed.lock().unwrap();
        for vt in &self.versioned_targets {
            store.record(vt.address.clone(), vt.cache_key.hash.clone());
            committed.insert(vt.address.clone());
        }
    }

    /// Forces every member to be treated as invalid on the next run, for tools (like the
    /// compiler) that may have deleted artifacts before failing outright.
    pub fn force_invalidate(&self, store: &mut InvalidationStore) {
        for vt in &self.versioned_targets {
            store.forget(&vt.address);
        }
    }
}

/// Persisted record of the last-known-good hash per target, the mechanism by which
/// `invalidated()` called twice with no source change yields an empty `invalid_vts` the second
/// time.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct InvalidationStore {
    known_good: BTreeMap<Address, String>,
}

impl InvalidationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(path: impl AsRef<std::path::Path>) -> Self {
        crate::utils::read_json_file(path).unwrap_or_default()
    }

    pub fn write(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        crate::utils::write_json_file(path, self, 8192)
    }

    pub fn record(&mut self, address: Address, hash: String) {
        self.known_good.insert(address, hash);
    }

    pub fn forget(&mut self, address: &Address) {
        self.known_good.remove(address);
    }

    pub fn is_valid(&self, address: &Address, hash: &str) -> bool {
        self.known_good.get(address).map(|h| h == hash).unwrap_or(false)
    }
}

/// Result of [`invalidated`]: the stale subset, greedily bucketed into partitions, plus the same
/// partitioning over the full input set.
pub struct InvalidationResult {
    pub invalid_vts: Vec<VersionedTarget>,
    pub invalid_vts_partitioned: Vec<VersionedTargetSet>,
    pub all_vts_partitioned: Vec<VersionedTargetSet>,
}

/// Determines which of `targets` have a stale fingerprint (optionally also invalidating their
/// dependents), then greedily buckets both the invalid subset and the full set into partitions
/// whose total source count approximates `partition_size_hint`, never splitting a strongly
/// connected dependency cluster across two partitions.
#[instrument(level = "debug", skip(graph, store, keys))]
pub fn invalidated(
    graph: &BuildGraph,
    keys: &BTreeMap<Address, CacheKey>,
    store: &InvalidationStore,
    targets: &[Address],
    invalidate_dependents: bool,
    partition_size_hint: usize,
) -> Result<InvalidationResult> {
    let mut invalid: BTreeSet<Address> = BTreeSet::new();
    for address in targets {
        let key = &keys[address];
        if !store.is_valid(address, &key.hash) {
            invalid.insert(address.clone());
        }
    }

    if invalidate_dependents {
        // Fixed-point expansion: any target dependent on an invalid target is itself invalid.
        let mut changed = true;
        while changed {
            changed = false;
            for address in targets {
                if invalid.contains(address) {
                    continue;
                }
                let deps = graph.dependencies_of(address)?;
                if deps.iter().any(|d| invalid.contains(d)) {
                    invalid.insert(address.clone());
                    changed = true;
                }
            }
        }
    }

    let all_vts: Vec<VersionedTarget> = targets
        .iter()
        .map(|address| VersionedTarget {
            address: address.clone(),
            cache_key: keys[address].clone(),
            valid: !invalid.contains(address),
        })
        .collect();

    let invalid_vts: Vec<VersionedTarget> =
        all_vts.iter().filter(|vt| !vt.valid).cloned().collect();

    let invalid_vts_partitioned = partition(graph, invalid_vts.clone(), partition_size_hint)?;
    let all_vts_partitioned = partition(graph, all_vts, partition_size_hint)?;

    Ok(InvalidationResult { invalid_vts, invalid_vts_partitioned, all_vts_partitioned })
}

impl Clone for VersionedTarget {
    fn clone(&self) -> Self {
        Self { address: self.address.clone(), cache_key: self.cache_key.clone(), valid: self.valid }
    }
}

/// Greedily buckets `vts` into partitions whose total source count approximates `size_hint`,
/// while keeping strongly-connected dependency clusters (targets that depend on each other
/// transitively within this very set) together in one bucket.
fn partition(
    graph: &BuildGraph,
    vts: Vec<VersionedTarget>,
    size_hint: usize,
) -> Result<Vec<VersionedTargetSet>> {
    if vts.is_empty() {
        return Ok(Vec::new());
    }
    let members: BTreeSet<Address> = vts.iter().map(|vt| vt.address.clone()).collect();
    let clusters = strongly_connected_clusters(graph, &members)?;

    let by_address: BTreeMap<Address, VersionedTarget> =
        vts.into_iter().map(|vt| (vt.address.clone(), vt)).collect();

    let mut buckets: Vec<Vec<VersionedTarget>> = Vec::new();
    let mut current: Vec<VersionedTarget> = Vec::new();
    let mut current_size = 0usize;

    for cluster in clusters {
        let cluster_vts: Vec<VersionedTarget> =
            cluster.into_iter().filter_map(|a| by_address.get(&a).cloned()).collect();
        let cluster_size: usize = cluster_vts
            .iter()
            .map(|vt| graph.get_target(&vt.address).map(|t| t.sources().len().max(1)))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .sum();

        if !current.is_empty() && current_size + cluster_size > size_hint {
            buckets.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current.extend(cluster_vts);
        current_size += cluster_size;
    }
    if !current.is_empty() {
        buckets.push(current);
    }

    Ok(buckets.into_iter().map(VersionedTargetSet::new).collect())
}

/// Tarjan's algorithm restricted to edges whose both endpoints lie in `members`, so a cluster
/// never crosses the boundary of the set being partitioned.
fn strongly_connected_clusters(
    graph: &BuildGraph,
    members: &BTreeSet<Address>,
) -> Result<Vec<Vec<Address>>> {
    struct Tarjan<'a> {
        graph: &'a BuildGraph,
        members: &'a BTreeSet<Address>,
        index_counter: usize,
        stack: Vec<Address>,
        on_stack: BTreeSet<Address>,
        indices: BTreeMap<Address, usize>,
        lowlink: BTreeMap<Address, usize>,
        result: Vec<Vec<Address>>,
    }

    impl<'a> Tarjan<'a> {
        fn strongconnect(&mut self, v: &Address) -> Result<()> {
            self.indices.insert(v.clone(), self.index_counter);
            self.lowlink.insert(v.clone(), self.index_counter);
            self.index_counter += 1;
            self.stack.push(v.clone());
            self.on_stack.insert(v.clone());

            for w in self.graph.dependencies_of(v)? {
                if !self.members.contains(w) {
                    continue;
                }
                if !self.indices.contains_key(w) {
                    self.strongconnect(w)?;
                    let low_w = self.lowlink[w];
                    let low_v = self.lowlink[v];
                    self.lowlink.insert(v.clone(), low_v.min(low_w));
                } else if self.on_stack.contains(w) {
                    let idx_w = self.indices[w];
                    let low_v = self.lowlink[v];
                    self.lowlink.insert(v.clone(), low_v.min(idx_w));
                }
            }

            if self.lowlink[v] == self.indices[v] {
                let mut component = Vec::new();
                loop {
                    let w = self.stack.pop().unwrap();
                    self.on_stack.remove(&w);
                    let is_v = w == *v;
                    component.push(w);
                    if is_v {
                        break;
                    }
                }
                self.result.push(component);
            }
            Ok(())
        }
    }

    let mut tarjan = Tarjan {
        graph,
        members,
        index_counter: 0,
        stack: Vec::new(),
        on_stack: BTreeSet::new(),
        indices: BTreeMap::new(),
        lowlink: BTreeMap::new(),
        result: Vec::new(),
    };
    for address in members {
        if !tarjan.indices.contains_key(address) {
            tarjan.strongconnect(address)?;
        }
    }
    Ok(tarjan.result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{exclusives::ExclusivesMap, graph::{Payload, Target}};
    use std::fs;

    fn source_target(addr: Address, root: &std::path::Path, file: &str) -> Target {
        fs::write(root.join(file), b"hello").unwrap();
        Target::new(
            addr,
            ExclusivesMap::new(),
            Payload::JvmSources {
                sources_rel_path: PathBuf::new(),
                sources: vec![PathBuf::from(file)],
                provides: None,
                excludes: vec![],
                configurations: vec![],
            },
        )
    }

    #[test]
    fn invalidation_is_stable_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let addr = Address::new("x", "t");
        let mut graph = BuildGraph::new();
        fs::write(dir.path().join("t.txt"), b"hello").unwrap();
        graph.inject_target(source_target(addr.clone(), dir.path(), "t.txt"), vec![]).unwrap();

        let keys = fingerprint_all(&graph, dir.path()).unwrap();
        let mut store = InvalidationStore::new();

        let first = invalidated(&graph, &keys, &store, &[addr.clone()], false, 100).unwrap();
        assert_eq!(first.invalid_vts.len(), 1);
        for vts in &first.invalid_vts_partitioned {
            vts.update(&mut store);
        }

        let second = invalidated(&graph, &keys, &store, &[addr], false, 100).unwrap();
        assert_eq!(second.invalid_vts.len(), 0);
    }

    #[test]
    fn changing_source_contents_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let addr = Address::new("x", "t");
        let mut graph = BuildGraph::new();
        graph.inject_target(source_target(addr.clone(), dir.path(), "t.txt"), vec![]).unwrap();

        let keys_before = fingerprint_all(&graph, dir.path()).unwrap();
        fs::write(dir.path().join("t.txt"), b"changed").unwrap();
        let keys_after = fingerprint_all(&graph, dir.path()).unwrap();
        assert_ne!(keys_before[&addr].hash, keys_after[&addr].hash);
    }
}
