//! Turns a manifest file into an ordered set of [`TargetProxy`] records keyed by address.
//!
//! The source system evaluates manifests as executable scripts against an injected global
//! context. A systems-language crate has no business embedding a scripting language for this,
//! so the evaluator contract here is realized directly as TOML: each `[[target]]` table is one
//! registration, read without any implicit mutable global state. Anything that can walk a
//! manifest source and call [`Registrar::register`] satisfies the same contract the original
//! evaluator did.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use serde::Deserialize;
use tracing::{instrument, trace};

use crate::address::Address;

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to read manifest {0:?}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("failed to parse manifest {0:?}: {1}")]
    Parse(PathBuf, toml::de::Error),
    #[error("target {0:?} in {1:?} is missing required field 'name'")]
    MissingName(usize, PathBuf),
    #[error("target {address} passed reserved keyword 'build_file'")]
    ReservedKeyword { address: Address },
    #[error("address {0} already registered from manifest {1:?}")]
    DuplicateAddress(Address),
    #[error("address {0:?} is not known to the graph")]
    UnknownAddress(Address),
    #[error("target {0} may not depend on itself")]
    SelfEdge(Address),
    #[error("target {address} has unregistered alias {alias:?}")]
    UnknownAlias { address: Address, alias: String },
    #[error("target {address} has malformed dependency spec {spec:?}")]
    BadDependencySpec { address: Address, spec: String },
}

// Manual impl: thiserror's derive can't compare PathBuf/Address-bearing variants with PartialEq
// for free, and callers only need structural identity of the address field.
impl PartialEq for ManifestError {
    fn eq(&self, other: &Self) -> bool {
        matches!((self, other),
            (ManifestError::DuplicateAddress(a), ManifestError::DuplicateAddress(b)) if a == b)
    }
}

/// Raw, eagerly-validated record produced directly by the parser, before dependency strings are
/// resolved into addresses.
#[derive(Debug, Clone)]
pub struct TargetProxy {
    pub target_type: String,
    pub build_file: PathBuf,
    pub name: String,
    pub address: Address,
    pub dependencies: Vec<String>,
    pub kwargs: BTreeMap<String, toml::Value>,
}

/// One `[[target]]` table in a manifest document.
#[derive(Debug, Deserialize)]
struct RawTarget {
    #[serde(rename = "type")]
    target_type: String,
    name: String,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(flatten)]
    rest: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    #[serde(rename = "target", default)]
    targets: Vec<RawTarget>,
}

/// Ordered, address-keyed collection of proxies produced by one manifest, plus the raw
/// dependency specs still to be resolved by the graph loader.
#[derive(Debug, Default)]
pub struct ParsedManifest {
    pub proxies: Vec<TargetProxy>,
}

/// Reads and validates one manifest file's textual source.
///
/// `build_file` is not accepted as a user-supplied keyword: the original system rejects it to
/// keep the field unambiguous, and `kwargs` is deep-copied (here: parsed into owned `toml::Value`
/// trees) so nothing can alias the evaluator's transient state.
#[instrument(level = "debug", skip(build_file), fields(build_file = %build_file.display()))]
pub fn parse(build_file: &Path) -> Result<ParsedManifest, ManifestError> {
    let source = std::fs::read_to_string(build_file)
        .map_err(|err| ManifestError::Read(build_file.to_path_buf(), err))?;
    let raw: RawManifest =
        toml::from_str(&source).map_err(|err| ManifestError::Parse(build_file.to_path_buf(), err))?;

    let mut proxies = Vec::with_capacity(raw.targets.len());
    let mut seen_names: BTreeSet<String> = BTreeSet::new();
    for (index, target) in raw.targets.into_iter().enumerate() {
        if target.name.is_empty() {
            return Err(ManifestError::MissingName(index, build_file.to_path_buf()));
        }
        let address = Address::new(build_file.to_path_buf(), target.name.clone());
        if target.rest.contains_key("build_file") {
            return Err(ManifestError::ReservedKeyword { address });
        }
        if !seen_names.insert(target.name.clone()) {
            return Err(ManifestError::DuplicateAddress(address));
        }
        trace!(%address, target_type = %target.target_type, "registered target proxy");
        proxies.push(TargetProxy {
            target_type: target.target_type,
            build_file: build_file.to_path_buf(),
            name: target.name,
            address,
            dependencies: target.dependencies,
            kwargs: target.rest,
        });
    }
    Ok(ParsedManifest { proxies })
}

/// Recursively loads every manifest reachable from `roots`, returning one [`ParsedManifest`]
/// per distinct build file. A manifest already in the parsed set is never re-parsed.
pub struct ManifestLoader {
    parsed: BTreeMap<PathBuf, ParsedManifest>,
}

impl ManifestLoader {
    pub fn new() -> Self {
        Self { parsed: BTreeMap::new() }
    }

    #[instrument(level = "debug", skip(self, roots))]
    pub fn load_transitively(
        &mut self,
        roots: impl IntoIterator<Item = PathBuf>,
    ) -> Result<(), ManifestError> {
        let mut queue: Vec<PathBuf> = roots.into_iter().collect();
        while let Some(build_file) = queue.pop() {
            if self.parsed.contains_key(&build_file) {
                continue;
            }
            let manifest = parse(&build_file)?;
            for proxy in &manifest.proxies {
                for dep in &proxy.dependencies {
                    if dep.starts_with(':') {
                        continue; // sibling within this manifest, nothing new to parse.
                    }
                    if let Ok(addr) = Address::parse_spec(dep, &build_file) {
                        if !self.parsed.contains_key(addr.build_file()) {
                            queue.push(addr.build_file().clone());
                        }
                    }
                }
            }
            self.parsed.insert(build_file, manifest);
        }
        Ok(())
    }

    pub fn manifests(&self) -> impl Iterator<Item = (&PathBuf, &ParsedManifest)> {
        self.parsed.iter()
    }

    pub fn into_proxies(self) -> Vec<TargetProxy> {
        self.parsed.into_values().flat_map(|m| m.proxies).collect()
    }
}

impl Default for ManifestLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the type-specific [`Payload`] for one proxy. Registered per target-type alias, the
/// Rust analogue of a `TargetCallProxy` bound to an alias in the evaluation context.
pub type PayloadFactory = fn(&TargetProxy) -> Result<crate::graph::Payload, ManifestError>;

fn kwarg_str(proxy: &TargetProxy, key: &str) -> Option<String> {
    proxy.kwargs.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn kwarg_str_list(proxy: &TargetProxy, key: &str) -> Vec<String> {
    proxy
        .kwargs
        .get(key)
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str()).map(str::to_string).collect())
        .unwrap_or_default()
}

fn jvm_sources_payload(proxy: &TargetProxy) -> Result<crate::graph::Payload, ManifestError> {
    let sources_rel_path = proxy.build_file.parent().unwrap_or(Path::new("")).to_path_buf();
    let sources = kwarg_str_list(proxy, "sources").into_iter().map(PathBuf::from).collect();
    Ok(crate::graph::Payload::JvmSources {
        sources_rel_path,
        sources,
        provides: kwarg_str(proxy, "provides"),
        excludes: kwarg_str_list(proxy, "excludes"),
        configurations: kwarg_str_list(proxy, "configurations"),
    })
}

fn jar_library_payload(proxy: &TargetProxy) -> Result<crate::graph::Payload, ManifestError> {
    Ok(crate::graph::Payload::JarLibrary {
        jars: kwarg_str_list(proxy, "jars"),
        overrides: kwarg_str_list(proxy, "overrides"),
    })
}

/// The built-in alias map: `jvm_library` and `jar_library`, the two [`crate::graph::Payload`]
/// variants this crate ships. Callers embedding their own target types extend a clone of this
/// map rather than replacing it.
pub fn default_registry() -> BTreeMap<&'static str, PayloadFactory> {
    let mut registry: BTreeMap<&'static str, PayloadFactory> = BTreeMap::new();
    registry.insert("jvm_library", jvm_sources_payload);
    registry.insert("jar_library", jar_library_payload);
    registry
}

/// Turns a flat list of proxies (typically [`ManifestLoader::into_proxies`]) into a
/// [`crate::graph::BuildGraph`]: every proxy's alias is resolved to a payload via `registry`,
/// then every raw dependency spec is resolved to an address and wired in as an edge. Targets are
/// injected before any edge is added so forward references across manifests resolve correctly.
#[instrument(level = "debug", skip(proxies, registry))]
pub fn resolve_into_graph(
    proxies: Vec<TargetProxy>,
    registry: &BTreeMap<&'static str, PayloadFactory>,
) -> crate::error::Result<crate::graph::BuildGraph> {
    use crate::graph::{BuildGraph, Target};

    let mut graph = BuildGraph::new();
    let mut deps_by_address: BTreeMap<Address, Vec<String>> = BTreeMap::new();

    for proxy in &proxies {
        let factory = registry.get(proxy.target_type.as_str()).ok_or_else(|| {
            crate::error::BuildError::Manifest(ManifestError::UnknownAlias {
                address: proxy.address.clone(),
                alias: proxy.target_type.clone(),
            })
        })?;
        let payload = factory(proxy)?;

        let mut exclusives = crate::exclusives::ExclusivesMap::new();
        if let Some(toml::Value::Table(table)) = proxy.kwargs.get("exclusives") {
            for (key, value) in table {
                if let Some(value) = value.as_str() {
                    exclusives.declare(key.clone(), value.to_string());
                }
            }
        }
        let labels = kwarg_str_list(proxy, "labels");

        let target = Target::new(proxy.address.clone(), exclusives, payload).with_labels(labels);
        graph.inject_target(target, vec![])?;
        deps_by_address.insert(proxy.address.clone(), proxy.dependencies.clone());
    }

    for (address, deps) in deps_by_address {
        for spec in deps {
            let dep_address = Address::parse_spec(&spec, address.build_file()).map_err(|_| {
                crate::error::BuildError::Manifest(ManifestError::BadDependencySpec {
                    address: address.clone(),
                    spec: spec.clone(),
                })
            })?;
            graph.inject_dependency(&address, &dep_address)?;
        }
    }

    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_manifest(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn trivial_target_matches_scenario_1() {
        let dir = tempfile::tempdir().unwrap();
        let build_file = write_manifest(
            dir.path(),
            "a_BUILD.toml",
            r#"
            [[target]]
            type = "fake"
            name = "foozle"
            "#,
        );
        let manifest = parse(&build_file).unwrap();
        assert_eq!(manifest.proxies.len(), 1);
        assert_eq!(manifest.proxies[0].target_type, "fake");
        assert_eq!(manifest.proxies[0].address, Address::new(build_file, "foozle"));
    }

    #[test]
    fn rejects_build_file_keyword() {
        let dir = tempfile::tempdir().unwrap();
        let build_file = write_manifest(
            dir.path(),
            "BUILD.toml",
            r#"
            [[target]]
            type = "fake"
            name = "a"
            build_file = "nope"
            "#,
        );
        assert!(matches!(parse(&build_file), Err(ManifestError::ReservedKeyword { .. })));
    }

    #[test]
    fn two_siblings_both_register() {
        let dir = tempfile::tempdir().unwrap();
        let build_file = write_manifest(
            dir.path(),
            "BUILD.toml",
            r#"
            [[target]]
            type = "fake"
            name = "a"

            [[target]]
            type = "fake"
            name = "b"
            dependencies = [":a"]
            "#,
        );
        let manifest = parse(&build_file).unwrap();
        assert_eq!(manifest.proxies.len(), 2);
    }

    #[test]
    fn duplicate_name_in_same_manifest_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let build_file = write_manifest(
            dir.path(),
            "BUILD.toml",
            r#"
            [[target]]
            type = "fake"
            name = "a"

            [[target]]
            type = "fake"
            name = "a"
            "#,
        );
        assert!(matches!(parse(&build_file), Err(ManifestError::DuplicateAddress(_))));
    }

    #[test]
    fn resolves_jvm_library_with_dependency_edge() {
        let dir = tempfile::tempdir().unwrap();
        let build_file = write_manifest(
            dir.path(),
            "BUILD.toml",
            r#"
            [[target]]
            type = "jar_library"
            name = "guava"
            jars = ["guava-31.jar"]

            [[target]]
            type = "jvm_library"
            name = "lib"
            sources = ["Lib.java"]
            dependencies = [":guava"]
            "#,
        );
        let manifest = parse(&build_file).unwrap();
        let graph = resolve_into_graph(manifest.proxies, &default_registry()).unwrap();

        let lib = Address::new(build_file.clone(), "lib");
        let guava = Address::new(build_file, "guava");
        assert!(graph.dependencies_of(&lib).unwrap().contains(&guava));
        assert!(matches!(graph.get_target(&lib).unwrap().payload, crate::graph::Payload::JvmSources { .. }));
    }

    #[test]
    fn unregistered_alias_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let build_file = write_manifest(
            dir.path(),
            "BUILD.toml",
            r#"
            [[target]]
            type = "python_library"
            name = "a"
            "#,
        );
        let manifest = parse(&build_file).unwrap();
        let err = resolve_into_graph(manifest.proxies, &default_registry()).unwrap_err();
        assert!(matches!(
            err,
            crate::error::BuildError::Manifest(ManifestError::UnknownAlias { .. })
        ));
    }
}
