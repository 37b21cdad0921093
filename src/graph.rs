//! Immutable directed-acyclic target graph.
//!
//! A [`BuildGraph`] is assembled once by the parser/loader and then treated as read-only by the
//! rest of the pipeline: no locking is needed once the last `inject_target` call returns.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
};

use sha2::{Digest, Sha256};
use tracing::{instrument, trace, warn};

use crate::{
    address::Address,
    error::{BuildError, Result},
    exclusives::ExclusivesMap,
};

/// Type-specific data attached to a target.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Payload {
    JvmSources {
        sources_rel_path: PathBuf,
        sources: Vec<PathBuf>,
        provides: Option<String>,
        excludes: Vec<String>,
        configurations: Vec<String>,
    },
    JarLibrary {
        jars: Vec<String>,
        overrides: Vec<String>,
    },
}

impl Payload {
    pub fn has_sources(&self, extension: &str) -> bool {
        match self {
            Payload::JvmSources { sources, .. } => {
                sources.iter().any(|p| p.extension().map(|e| e == extension).unwrap_or(false))
            }
            Payload::JarLibrary { .. } => false,
        }
    }

    pub fn has_resources(&self) -> bool {
        match self {
            Payload::JvmSources { configurations, .. } => {
                configurations.iter().any(|c| c == "resources")
            }
            Payload::JarLibrary { .. } => false,
        }
    }

    /// Absorbs a canonical byte sequence for every field, plus the exact content of every
    /// listed source file, into `hasher`. Source files are folded in sorted order so the
    /// fingerprint is independent of manifest authoring order.
    pub fn invalidation_hash(&self, hasher: &mut Sha256, workspace_root: &std::path::Path) -> Result<()> {
        match self {
            Payload::JvmSources { sources_rel_path, sources, provides, excludes, configurations } => {
                hasher.update(b"jvm_sources");
                hasher.update(sources_rel_path.to_string_lossy().as_bytes());
                let mut sorted = sources.clone();
                sorted.sort();
                for source in &sorted {
                    hasher.update(source.to_string_lossy().as_bytes());
                    let full = workspace_root.join(sources_rel_path).join(source);
                    let bytes = std::fs::read(&full).map_err(|err| {
                        BuildError::CacheIo(format!("failed to read source {full:?}: {err}"))
                    })?;
                    hasher.update(&bytes);
                }
                if let Some(p) = provides {
                    hasher.update(p.as_bytes());
                }
                for e in excludes {
                    hasher.update(e.as_bytes());
                }
                for c in configurations {
                    hasher.update(c.as_bytes());
                }
            }
            Payload::JarLibrary { jars, overrides } => {
                hasher.update(b"jar_library");
                for jar in jars {
                    hasher.update(jar.as_bytes());
                }
                for o in overrides {
                    hasher.update(o.as_bytes());
                }
            }
        }
        Ok(())
    }
}

/// The resolved object referenced by a [`crate::manifest::TargetProxy`] once the graph is built.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Target {
    pub address: Address,
    pub id: String,
    pub labels: BTreeSet<String>,
    pub declared_exclusives: ExclusivesMap,
    pub derived_from: Address,
    pub payload: Payload,
}

impl Target {
    pub fn new(address: Address, declared_exclusives: ExclusivesMap, payload: Payload) -> Self {
        let id = filesystem_safe_id(&address);
        Self {
            derived_from: address.clone(),
            id,
            labels: BTreeSet::new(),
            declared_exclusives,
            address,
            payload,
        }
    }

    #[must_use]
    pub fn with_labels(mut self, labels: impl IntoIterator<Item = String>) -> Self {
        self.labels.extend(labels);
        self
    }

    pub fn sources(&self) -> &[PathBuf] {
        match &self.payload {
            Payload::JvmSources { sources, .. } => sources,
            Payload::JarLibrary { .. } => &[],
        }
    }
}

/// Derives a filesystem- and URL-safe identifier from an address, used as the human-readable
/// half of a cache key directory (`cache_root/<id>/<hash>/`).
fn filesystem_safe_id(address: &Address) -> String {
    let raw = format!("{}.{}", address.build_file().display(), address.name());
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' { c } else { '_' })
        .collect()
}

/// Immutable DAG of targets plus forward and reverse dependency indices.
#[derive(Debug, Default)]
pub struct BuildGraph {
    target_by_address: BTreeMap<Address, Target>,
    deps_of: BTreeMap<Address, BTreeSet<Address>>,
    dependents_of: BTreeMap<Address, BTreeSet<Address>>,
}

impl BuildGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains_address(&self, address: &Address) -> bool {
        self.target_by_address.contains_key(address)
    }

    #[instrument(level = "trace", skip(self, target, deps), fields(address = %target.address))]
    pub fn inject_target(&mut self, target: Target, deps: Vec<Address>) -> Result<()> {
        let address = target.address.clone();
        if self.target_by_address.contains_key(&address) {
            return Err(BuildError::Manifest(crate::manifest::ManifestError::DuplicateAddress(
                address,
            )));
        }
        self.target_by_address.insert(address.clone(), target);
        self.deps_of.entry(address.clone()).or_default();
        self.dependents_of.entry(address.clone()).or_default();
        for dep in deps {
            self.inject_dependency(&address, &dep)?;
        }
        Ok(())
    }

    pub fn inject_dependency(&mut self, dependent: &Address, dependency: &Address) -> Result<()> {
        if !self.target_by_address.contains_key(dependent) {
            return Err(BuildError::Manifest(crate::manifest::ManifestError::UnknownAddress(
                dependent.clone(),
            )));
        }
        if !self.target_by_address.contains_key(dependency) {
            return Err(BuildError::Manifest(crate::manifest::ManifestError::UnknownAddress(
                dependency.clone(),
            )));
        }
        if dependent == dependency {
            return Err(BuildError::Manifest(crate::manifest::ManifestError::SelfEdge(
                dependent.clone(),
            )));
        }
        let forward = self.deps_of.entry(dependent.clone()).or_default();
        if !forward.insert(dependency.clone()) {
            trace!(%dependent, %dependency, "duplicate edge skipped");
            return Ok(());
        }
        self.dependents_of.entry(dependency.clone()).or_default().insert(dependent.clone());
        Ok(())
    }

    pub fn get_target(&self, address: &Address) -> Result<&Target> {
        self.target_by_address
            .get(address)
            .ok_or_else(|| BuildError::Manifest(crate::manifest::ManifestError::UnknownAddress(
                address.clone(),
            )))
    }

    pub fn dependencies_of(&self, address: &Address) -> Result<&BTreeSet<Address>> {
        self.deps_of
            .get(address)
            .ok_or_else(|| BuildError::Manifest(crate::manifest::ManifestError::UnknownAddress(
                address.clone(),
            )))
    }

    pub fn dependents_of(&self, address: &Address) -> Result<&BTreeSet<Address>> {
        self.dependents_of
            .get(address)
            .ok_or_else(|| BuildError::Manifest(crate::manifest::ManifestError::UnknownAddress(
                address.clone(),
            )))
    }

    pub fn targets(&self) -> impl Iterator<Item = &Target> {
        self.target_by_address.values()
    }

    pub fn addresses(&self) -> impl Iterator<Item = &Address> {
        self.target_by_address.keys()
    }

    /// Topological order, most-dependent first (a target always appears before its
    /// dependencies). Detects cycles via an explicit recursion path stack rather than failing
    /// silently on a malformed DAG.
    #[instrument(level = "debug", skip(self))]
    pub fn sorted_targets(&self) -> Result<Vec<Address>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            InProgress,
            Done,
        }

        let mut marks: BTreeMap<&Address, Mark> = BTreeMap::new();
        let mut path: Vec<Address> = Vec::new();
        let mut order: Vec<Address> = Vec::new();

        fn visit<'g>(
            graph: &'g BuildGraph,
            address: &'g Address,
            marks: &mut BTreeMap<&'g Address, Mark>,
            path: &mut Vec<Address>,
            order: &mut Vec<Address>,
        ) -> Result<()> {
            match marks.get(address) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::InProgress) => {
                    let start = path.iter().position(|a| a == address).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(address.clone());
                    return Err(BuildError::Cycle(cycle));
                }
                None => {}
            }
            marks.insert(address, Mark::InProgress);
            path.push(address.clone());
            let deps = graph
                .deps_of
                .get(address)
                .expect("address already validated as present in target_by_address");
            for dep in deps {
                visit(graph, dep, marks, path, order)?;
            }
            path.pop();
            marks.insert(address, Mark::Done);
            order.push(address.clone());
            Ok(())
        }

        for address in self.target_by_address.keys() {
            visit(self, address, &mut marks, &mut path, &mut order)?;
        }

        // `order` was built dependency-first (post-order); reverse so the most-dependent
        // target appears first, matching the documented contract.
        order.reverse();
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(addr: &str) -> Target {
        Target::new(
            Address::from_str_lossy(addr),
            ExclusivesMap::new(),
            Payload::JarLibrary { jars: vec![], overrides: vec![] },
        )
    }

    impl Address {
        pub(crate) fn from_str_lossy(s: &str) -> Address {
            let (path, name) = s.split_once(':').unwrap();
            Address::new(path, name)
        }
    }

    #[test]
    fn inject_dependency_updates_both_indices() {
        let mut graph = BuildGraph::new();
        graph.inject_target(leaf("x:a"), vec![]).unwrap();
        graph.inject_target(leaf("x:b"), vec![Address::from_str_lossy("x:a")]).unwrap();

        assert!(graph.dependencies_of(&Address::from_str_lossy("x:b")).unwrap()
            .contains(&Address::from_str_lossy("x:a")));
        assert!(graph.dependents_of(&Address::from_str_lossy("x:a")).unwrap()
            .contains(&Address::from_str_lossy("x:b")));
    }

    #[test]
    fn rejects_self_edge() {
        let mut graph = BuildGraph::new();
        graph.inject_target(leaf("x:a"), vec![]).unwrap();
        let err = graph.inject_dependency(&Address::from_str_lossy("x:a"), &Address::from_str_lossy("x:a"));
        assert!(err.is_err());
    }

    #[test]
    fn rejects_double_injection() {
        let mut graph = BuildGraph::new();
        graph.inject_target(leaf("x:a"), vec![]).unwrap();
        assert!(graph.inject_target(leaf("x:a"), vec![]).is_err());
    }

    #[test]
    fn sorted_targets_orders_most_dependent_first() {
        let mut graph = BuildGraph::new();
        graph.inject_target(leaf("x:a"), vec![]).unwrap();
        graph.inject_target(leaf("x:b"), vec![Address::from_str_lossy("x:a")]).unwrap();
        graph.inject_target(leaf("x:c"), vec![Address::from_str_lossy("x:b")]).unwrap();

        let order = graph.sorted_targets().unwrap();
        let pos = |a: &str| order.iter().position(|x| x == &Address::from_str_lossy(a)).unwrap();
        assert!(pos("x:c") < pos("x:b"));
        assert!(pos("x:b") < pos("x:a"));
    }

    #[test]
    fn detects_cycle_via_sibling_reference() {
        let mut graph = BuildGraph::new();
        graph.inject_target(leaf("x:a"), vec![]).unwrap();
        graph.inject_target(leaf("x:b"), vec![Address::from_str_lossy("x:a")]).unwrap();
        graph.inject_dependency(&Address::from_str_lossy("x:a"), &Address::from_str_lossy("x:b")).unwrap();

        let err = graph.sorted_targets().unwrap_err();
        assert!(matches!(err, BuildError::Cycle(_)));
    }
}
