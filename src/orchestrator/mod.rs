//! Drives invalid partitions through merge → compile → split → cache, and serves valid
//! partitions straight from the artifact cache, in a valid topological/exclusives-compatible
//! order.

mod analysis;

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use tracing::{debug, instrument, trace, warn};

use crate::{
    address::Address,
    cache::ArtifactCache,
    cache_key::{CacheKey, VersionedTargetSet},
    compiler::{ClasspathEntry, CompileRequest, ExternalCompiler},
    error::{BuildError, Result},
    exclusives::{ExclusivesGroups, GroupKey},
    graph::{BuildGraph, Payload},
    run_tracker::RunTracker,
    worker_pool::WorkerPool,
    workunit::{Label, WorkUnit},
};

/// Per-target classes directory plus the partition-scoped analysis file it was last split from;
/// the orchestrator's running map of everything already materialized this run.
#[derive(Debug, Clone, Default)]
pub struct TargetArtifacts {
    pub classes_dir: PathBuf,
    pub analysis_file: PathBuf,
}

/// Cumulative record of what has been produced so far in this run: used both to feed
/// `upstream_analysis` to later partitions and as the final return value.
#[derive(Debug, Default)]
pub struct OrchestratorOutput {
    pub per_target: BTreeMap<Address, TargetArtifacts>,
    /// Ordered `(classes_dir, analysis_file)` for every partition compiled so far this run.
    pub upstream: Vec<(PathBuf, PathBuf)>,
    pub dependency_audit_warnings: Vec<String>,
}

pub struct Orchestrator<'a, C: ExternalCompiler, A: ArtifactCache> {
    graph: &'a BuildGraph,
    compiler: &'a C,
    cache: &'a A,
    worker_pool: &'a WorkerPool,
    run_tracker: &'a RunTracker,
    exclusives_groups: &'a ExclusivesGroups,
    work_root: PathBuf,
    cache_name: String,
}

impl<'a, C: ExternalCompiler, A: ArtifactCache> Orchestrator<'a, C, A> {
    pub fn new(
        graph: &'a BuildGraph,
        compiler: &'a C,
        cache: &'a A,
        worker_pool: &'a WorkerPool,
        run_tracker: &'a RunTracker,
        exclusives_groups: &'a ExclusivesGroups,
        work_root: impl Into<PathBuf>,
        cache_name: impl Into<String>,
    ) -> Self {
        Self {
            graph,
            compiler,
            cache,
            worker_pool,
            run_tracker,
            exclusives_groups,
            work_root: work_root.into(),
            cache_name: cache_name.into(),
        }
    }

    /// Runs every partition (in the order given) through the cache-read or
    /// merge/compile/split/cache-write path, folding results into one [`OrchestratorOutput`].
    /// Partitions must already be ordered so that a partition's dependencies are processed
    /// before it (the caller derives this from [`BuildGraph::sorted_targets`]).
    #[instrument(level = "debug", skip_all, fields(partitions = partitions.len()))]
    pub fn run(
        &self,
        parent: &WorkUnit,
        partitions: &[VersionedTargetSet],
        group_of: &BTreeMap<Address, GroupKey>,
    ) -> Result<OrchestratorOutput> {
        let compile_unit = parent.child("compile", [Label::Goal]);
        compile_unit.start();
        let mut output = OrchestratorOutput::default();

        for (index, partition) in partitions.iter().enumerate() {
            let partition_name = format!("partition-{index}");
            let unit = compile_unit.child(&partition_name, [Label::Group]);
            unit.start();

            let result = if partition.is_valid() {
                self.read_from_cache(partition, &mut output)
            } else {
                self.compile_partition(&unit, &partition_name, partition, &mut output, group_of)
            };

            match result {
                Ok(()) => unit.set_outcome(crate::workunit::Outcome::Success),
                Err(err) => {
                    unit.set_outcome(crate::workunit::Outcome::Failure);
                    self.end_unit(&unit);
                    compile_unit.set_outcome(crate::workunit::Outcome::Failure);
                    return Err(err);
                }
            }
            self.end_unit(&unit);
        }

        self.end_unit(&compile_unit);
        Ok(output)
    }

    /// Ends `unit`, feeding its cumulative duration and self time into this run's two separate
    /// timing aggregates instead of reporting the same value to both.
    fn end_unit(&self, unit: &WorkUnit) {
        let mut cumulative = |path: &str, d, is_tool| {
            self.run_tracker.cumulative_timings.add_timing(path, d, is_tool);
        };
        let mut self_timings = |path: &str, d, is_tool| {
            self.run_tracker.self_timings.add_timing(path, d, is_tool);
        };
        unit.end(&mut cumulative, &mut self_timings);
    }

    /// Cache read path: for each target in a valid partition, fetch its cached artifact,
    /// localize the sentinel paths in its analysis back to this workspace, and fold it into
    /// `output` as if it had just been compiled.
    #[instrument(level = "debug", skip(self, output))]
    fn read_from_cache(
        &self,
        partition: &VersionedTargetSet,
        output: &mut OrchestratorOutput,
    ) -> Result<()> {
        for vt in &partition.versioned_targets {
            let artifact = self.cache.use_cached_files(&vt.cache_key).ok_or_else(|| {
                BuildError::CacheIo(format!(
                    "partition marked valid but cache miss for {}",
                    vt.address
                ))
            })?;
            self.run_tracker.artifact_cache_stats.record_hit(&self.cache_name, &vt.cache_key.id);
            artifact.extract()?;

            let target_dir = self.work_root.join(&vt.cache_key.id);
            let portable =
                artifact.relpaths().iter().find(|p| p.extension().map(|e| e == "portable").unwrap_or(false));
            let analysis_file = if let Some(portable) = portable {
                self.compiler.localize(&self.work_root.join(portable), &self.work_root)?
            } else {
                target_dir.join("empty.analysis")
            };

            output.per_target.insert(
                vt.address.clone(),
                TargetArtifacts { classes_dir: target_dir.clone(), analysis_file: analysis_file.clone() },
            );
            output.upstream.push((target_dir, analysis_file));
        }
        Ok(())
    }

    /// Best-effort lookup of a target's artifacts from a previous run's artifact cache entry,
    /// for merging into an invalid partition's compile (step 2 of [`Self::compile_partition`]).
    /// Unlike [`Self::read_from_cache`], a miss or extraction/localization failure here is not
    /// fatal: the target simply contributes nothing to the merge and gets recompiled from
    /// scratch as part of the partition.
    fn fetch_cached_target(&self, vt: &crate::cache_key::VersionedTarget) -> Option<(PathBuf, PathBuf)> {
        let artifact = self.cache.use_cached_files(&vt.cache_key)?;
        if let Err(err) = artifact.extract() {
            warn!(address = %vt.address, %err, "failed to extract cached artifact, skipping merge for this target");
            return None;
        }
        let target_dir = self.work_root.join(&vt.cache_key.id);
        let portable =
            artifact.relpaths().iter().find(|p| p.extension().map(|e| e == "portable").unwrap_or(false))?;
        match self.compiler.localize(&self.work_root.join(portable), &self.work_root) {
            Ok(analysis_file) => Some((target_dir, analysis_file)),
            Err(err) => {
                warn!(address = %vt.address, %err, "failed to localize cached analysis, skipping merge for this target");
                None
            }
        }
    }

    /// Merge → compile → split → relativize → cache-write path for one invalid partition.
    #[instrument(level = "debug", skip(self, output, group_of), fields(partition = partition_name))]
    fn compile_partition(
        &self,
        unit: &WorkUnit,
        partition_name: &str,
        partition: &VersionedTargetSet,
        output: &mut OrchestratorOutput,
        group_of: &BTreeMap<Address, GroupKey>,
    ) -> Result<()> {
        let partition_dir = self.work_root.join(partition_name);
        let merged_classes_dir = partition_dir.join("classes");
        let merged_analysis = partition_dir.join("merged.analysis.json");
        std::fs::create_dir_all(&merged_classes_dir).map_err(BuildError::Io)?;

        // 1. Compute sources to compile: union of every target's sources.
        let mut sources = Vec::new();
        let mut per_target_sources: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
        for vt in &partition.versioned_targets {
            let target = self.graph.get_target(&vt.address)?;
            let rel_sources: Vec<PathBuf> = match &target.payload {
                Payload::JvmSources { sources_rel_path, sources, .. } => {
                    sources.iter().map(|s| sources_rel_path.join(s)).collect()
                }
                Payload::JarLibrary { .. } => Vec::new(),
            };
            per_target_sources.insert(vt.cache_key.id.clone(), rel_sources.clone());
            sources.extend(rel_sources);
        }
        sources.sort();
        sources.dedup();

        // 2. Merge per-target artifacts from a previous run, if any exist for these targets:
        // first check what this same run has already produced upstream, falling back to
        // whatever the artifact cache holds. While at it, diff each target's previously
        // recorded source list (written alongside its cached classes, see step 6+7 below)
        // against its current declared sources to find sources that have since been removed.
        let mut per_target_dirs = BTreeMap::new();
        let mut per_target_classes: BTreeMap<Address, Vec<PathBuf>> = BTreeMap::new();
        let mut rebased_analyses = Vec::new();
        let mut deleted_sources: Vec<PathBuf> = Vec::new();
        for vt in &partition.versioned_targets {
            let cached = match output.per_target.get(&vt.address) {
                Some(prev) => Some((prev.classes_dir.clone(), prev.analysis_file.clone())),
                None => self.fetch_cached_target(vt),
            };
            let Some((target_dir, analysis_file)) = cached else { continue };

            per_target_dirs.insert(vt.address.clone(), target_dir.clone());
            let classes: Vec<PathBuf> = crate::utils::sorted_relative_files(&target_dir)
                .unwrap_or_default()
                .into_iter()
                .filter(|p| p.file_name().map(|n| n != "sources.json").unwrap_or(true))
                .collect();
            per_target_classes.insert(vt.address.clone(), classes);

            let rebased = self.compiler.rebase(&analysis_file, &merged_classes_dir)?;
            rebased_analyses.push(rebased);

            let manifest = target_dir.join("sources.json");
            if let Ok(prev_sources) = crate::utils::read_json_file::<Vec<PathBuf>>(&manifest) {
                let current = per_target_sources.get(&vt.cache_key.id).cloned().unwrap_or_default();
                deleted_sources.extend(prev_sources.into_iter().filter(|s| !current.contains(s)));
            }
        }
        deleted_sources.sort();
        deleted_sources.dedup();
        if !rebased_analyses.is_empty() {
            self.compiler.merge(&rebased_analyses, &merged_analysis)?;
            analysis::merge_classes_dirs(&per_target_dirs, &per_target_classes, &merged_classes_dir)?;
        }

        // classpath: every classpath entry visible to this partition's compatibility group,
        // drawn from the exclusives groups store.
        let classpath = partition
            .versioned_targets
            .first()
            .and_then(|vt| group_of.get(&vt.address))
            .map(|group| self.exclusives_groups.get_classpath_for_group(group))
            .unwrap_or_default()
            .into_iter()
            .map(|entry| ClasspathEntry::Archive(PathBuf::from(entry)))
            .collect();

        let request = CompileRequest {
            classpath,
            sources,
            deleted_sources,
            classes_dir: merged_classes_dir.clone(),
            analysis_file: merged_analysis.clone(),
            upstream_analysis: output.upstream.iter().cloned().collect(),
        };

        // 3. Invoke the external incremental compiler, inside its own work unit so its timing
        // and output are tracked separately from the merge/split bookkeeping around it.
        let compiler_unit = unit.child("zinc", [Label::Compiler, Label::Tool]);
        compiler_unit.start();
        debug!(partition = partition_name, sources = request.sources.len(), "invoking external compiler");
        let analysis = self.compiler.compile(&request).map_err(|err| {
            compiler_unit.set_outcome(crate::workunit::Outcome::Failure);
            BuildError::compile(partition_name, err)
        })?;
        compiler_unit.set_outcome(crate::workunit::Outcome::Success);
        self.end_unit(&compiler_unit);

        // 4. Diff: an invalid partition is always recompiled, so its relations are always
        // considered to have changed relative to whatever was split last run.
        let analysis_changed = true;
        trace!(
            partition = partition_name,
            fingerprint = %analysis.relations_fingerprint,
            analysis_changed,
            "partition compiled"
        );

        // 5. Split the artifact back into per-target pieces.
        let per_target_relations =
            analysis::split_source_to_classes(&analysis.source_to_classes, &per_target_sources);
        let split_analyses = if analysis_changed {
            self.compiler.split(&merged_analysis, &per_target_sources)?
        } else {
            BTreeMap::new()
        };

        // 6+7. Per target: split classes/analysis out of the merged partition artifact,
        // relativize for caching, and upload. Independent across targets, so fanned out on the
        // worker pool.
        let split_results: Vec<(crate::address::Address, PathBuf, TargetArtifacts)> =
            self.worker_pool.submit_work_and_wait(
                unit,
                "split-and-cache",
                self.run_tracker,
                partition.versioned_targets.clone(),
                |vt, _unit| {
                    let target_id = &vt.cache_key.id;
                    let target_classes_dir = self.work_root.join(target_id);
                    std::fs::create_dir_all(&target_classes_dir).map_err(BuildError::Io)?;

                    let classes = per_target_relations.get(target_id).cloned().unwrap_or_default();
                    for (_, class_files) in &classes {
                        for class in class_files {
                            let src = merged_classes_dir.join(class);
                            let dest = target_classes_dir.join(class);
                            if let Some(parent) = dest.parent() {
                                std::fs::create_dir_all(parent).map_err(BuildError::Io)?;
                            }
                            if src.exists() {
                                std::fs::copy(&src, &dest).map_err(BuildError::Io)?;
                            }
                        }
                    }
                    for deleted in &analysis.deleted_classes {
                        let _ = std::fs::remove_file(target_classes_dir.join(deleted));
                    }

                    let target_analysis = if let Some(split) = split_analyses.get(target_id) {
                        self.compiler.rebase(split, &target_classes_dir)?
                    } else {
                        target_classes_dir.join("empty.analysis")
                    };

                    let portable = self.compiler.relativize(&target_analysis, &self.work_root)?;

                    if let Some(current_sources) = per_target_sources.get(target_id) {
                        let _ = crate::utils::write_json_file(
                            target_classes_dir.join("sources.json"),
                            current_sources,
                            4096,
                        );
                    }

                    let mut cache_paths: Vec<PathBuf> =
                        crate::utils::sorted_relative_files(&target_classes_dir)
                            .unwrap_or_default()
                            .into_iter()
                            .map(|p| PathBuf::from(target_id).join(p))
                            .collect();
                    if let Ok(rel) = portable.strip_prefix(&self.work_root) {
                        cache_paths.push(rel.to_path_buf());
                    }
                    self.cache.try_insert(&vt.cache_key, &cache_paths);

                    Ok((
                        vt.address.clone(),
                        target_classes_dir.clone(),
                        TargetArtifacts { classes_dir: target_classes_dir, analysis_file: target_analysis },
                    ))
                },
            )?;

        for (address, target_classes_dir, artifacts) in split_results {
            let target_id = target_classes_dir.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            self.run_tracker.artifact_cache_stats.record_miss(&self.cache_name, target_id);
            output.per_target.insert(address, artifacts);
        }

        output.upstream.push((merged_classes_dir, merged_analysis));
        Ok(())
    }

    /// Optional post-compile check: flags any target using a class it does not declare a
    /// dependency on. Failures here are recoverable diagnostics, never fatal to the build.
    pub fn audit_dependencies(
        &self,
        output: &mut OrchestratorOutput,
        declared_deps: &BTreeMap<Address, Vec<Address>>,
    ) {
        for (address, artifacts) in &output.per_target {
            let Ok(bytes) = std::fs::read(&artifacts.analysis_file) else { continue };
            let Ok(used) = String::from_utf8(bytes) else { continue };
            let declared = declared_deps.get(address).cloned().unwrap_or_default();
            for dep in self.graph.dependencies_of(address).into_iter().flatten() {
                if !declared.contains(dep) && used.contains(&dep.to_string()) {
                    let msg = format!("{address} uses {dep} without declaring it as a dependency");
                    warn!("{msg}");
                    output.dependency_audit_warnings.push(msg);
                }
            }
        }
    }
}

pub use analysis::{merge_classes_dirs, owned_package_dirs, split_source_to_classes};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::LocalArtifactCache,
        compiler::mock::MockCompiler,
        exclusives::ExclusivesGroups,
        graph::{Payload, Target},
        run_tracker::RunTracker,
        worker_pool::WorkerPool,
    };

    fn jvm_target(addr: Address, root: &Path, rel: &str, file: &str) -> Target {
        std::fs::create_dir_all(root.join(rel)).unwrap();
        std::fs::write(root.join(rel).join(file), b"class Foo {}").unwrap();
        Target::new(
            addr,
            crate::exclusives::ExclusivesMap::new(),
            Payload::JvmSources {
                sources_rel_path: PathBuf::from(rel),
                sources: vec![PathBuf::from(file)],
                provides: None,
                excludes: vec![],
                configurations: vec![],
            },
        )
    }

    #[test]
    fn compiles_one_invalid_partition_and_populates_output() {
        let workspace = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let work_root = tempfile::tempdir().unwrap();
        let info_dir = tempfile::tempdir().unwrap();

        let addr = Address::new("src/a", "a");
        let mut graph = BuildGraph::new();
        graph.inject_target(jvm_target(addr.clone(), workspace.path(), "src/a", "A.java"), vec![]).unwrap();

        let keys = crate::cache_key::fingerprint_all(&graph, workspace.path()).unwrap();
        let store = crate::cache_key::InvalidationStore::new();
        let invalidation =
            crate::cache_key::invalidated(&graph, &keys, &store, &[addr.clone()], false, 100).unwrap();
        let partition = invalidation.invalid_vts_partitioned.into_iter().next().unwrap();

        let compiler = MockCompiler::new();
        let cache = LocalArtifactCache::new(work_root.path(), cache_dir.path()).unwrap();
        let worker_pool = WorkerPool::new(2).unwrap();
        let run_tracker = RunTracker::new(info_dir.path()).unwrap();
        let exclusives_groups = ExclusivesGroups::new();
        let root_unit = WorkUnit::root("all");

        let orchestrator = Orchestrator::new(
            &graph,
            &compiler,
            &cache,
            &worker_pool,
            &run_tracker,
            &exclusives_groups,
            work_root.path(),
            "local",
        );

        let group_of = BTreeMap::new();
        let out = orchestrator.run(&root_unit, &[partition], &group_of).unwrap();
        assert!(out.per_target.contains_key(&addr));
    }
}
