//! A pluggable abstraction over the external, zinc-style incremental compiler the orchestrator
//! shells out to. Generalized from a single language's compiler trait so any toolchain that can
//! expose this analysis-file contract (rebase/merge/split/relativize/localize plus compile) can
//! be driven by the orchestrator.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use crate::error::Result;

/// One entry of the classpath passed to a compile invocation: either a directory of class files
/// or a packaged archive.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClasspathEntry {
    Directory(PathBuf),
    Archive(PathBuf),
}

impl ClasspathEntry {
    pub fn path(&self) -> &Path {
        match self {
            ClasspathEntry::Directory(p) | ClasspathEntry::Archive(p) => p,
        }
    }
}

/// Everything one partition-scoped compile invocation needs.
#[derive(Debug, Clone)]
pub struct CompileRequest {
    pub classpath: Vec<ClasspathEntry>,
    pub sources: Vec<PathBuf>,
    pub deleted_sources: Vec<PathBuf>,
    pub classes_dir: PathBuf,
    pub analysis_file: PathBuf,
    /// `classes_dir -> analysis_file` for every upstream partition already compiled this run.
    pub upstream_analysis: BTreeMap<PathBuf, PathBuf>,
}

/// The source → class relation plus change summary an incremental compiler reports back, used
/// by the orchestrator to decide whether per-target analyses need re-splitting.
#[derive(Debug, Clone, Default)]
pub struct CompileAnalysis {
    pub source_to_classes: BTreeMap<PathBuf, Vec<PathBuf>>,
    pub new_or_changed_classes: Vec<PathBuf>,
    pub deleted_classes: Vec<PathBuf>,
    pub relations_fingerprint: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("external compiler exited with status {0}")]
    NonZeroExit(i32),
    #[error("external compiler invocation failed: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("analysis operation `{op}` failed: {message}")]
    Analysis { op: &'static str, message: String },
}

/// An external, incrementally-capable compiler toolchain (e.g. a zinc/sbt-style Scala/Java
/// compiler server). Implementations own the subprocess or in-process library call; the
/// orchestrator only depends on this trait, never on a concrete toolchain.
pub trait ExternalCompiler: Send + Sync {
    /// Runs a compile for `request`, returning the resulting combined analysis. A non-zero exit
    /// from the underlying toolchain must be surfaced as [`CompileError::NonZeroExit`].
    fn compile(&self, request: &CompileRequest) -> Result<CompileAnalysis, CompileError>;

    /// Rewrites `analysis_file`'s absolute paths so they point at `new_classes_dir` instead of
    /// wherever it was originally generated.
    fn rebase(&self, analysis_file: &Path, new_classes_dir: &Path) -> Result<PathBuf, CompileError>;

    /// Combines several rebased per-target analyses into one partition-scoped analysis.
    fn merge(&self, analyses: &[PathBuf], out: &Path) -> Result<(), CompileError>;

    /// Splits a partition analysis into per-target analyses, keyed by each target's source set.
    fn split(
        &self,
        analysis_file: &Path,
        source_sets: &BTreeMap<String, Vec<PathBuf>>,
    ) -> Result<BTreeMap<String, PathBuf>, CompileError>;

    /// Replaces absolute path prefixes in `analysis_file` with a portable sentinel, for caching.
    fn relativize(&self, analysis_file: &Path, artifact_root: &Path) -> Result<PathBuf, CompileError>;

    /// Inverse of [`Self::relativize`]: rewrites sentinels back to real absolute paths.
    fn localize(&self, analysis_file: &Path, artifact_root: &Path) -> Result<PathBuf, CompileError>;
}

#[cfg(any(test, feature = "project-util"))]
pub mod mock {
    //! A trivial [`ExternalCompiler`] that writes deterministic fake class files instead of
    //! shelling out to a real toolchain, so the orchestrator's merge/split/cache logic can be
    //! exercised without one.

    use super::*;
    use std::sync::Mutex;

    /// Records every request it was asked to compile, for assertions in orchestrator tests.
    #[derive(Default)]
    pub struct MockCompiler {
        pub requests: Mutex<Vec<CompileRequest>>,
    }

    impl MockCompiler {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl ExternalCompiler for MockCompiler {
        fn compile(&self, request: &CompileRequest) -> Result<CompileAnalysis, CompileError> {
            std::fs::create_dir_all(&request.classes_dir)
                .map_err(|e| CompileError::Analysis { op: "compile", message: e.to_string() })?;

            let mut source_to_classes = BTreeMap::new();
            let mut new_or_changed = Vec::new();
            for src in &request.sources {
                let stem = src.file_stem().and_then(|s| s.to_str()).unwrap_or("Out");
                let class_rel = PathBuf::from(format!("{stem}.class"));
                let class_abs = request.classes_dir.join(&class_rel);
                std::fs::write(&class_abs, b"MOCKCLASS")
                    .map_err(|e| CompileError::Analysis { op: "compile", message: e.to_string() })?;
                source_to_classes.insert(src.clone(), vec![class_rel.clone()]);
                new_or_changed.push(class_rel);
            }

            let fingerprint = fingerprint_of_sources(&request.sources);
            let analysis = CompileAnalysis {
                source_to_classes,
                new_or_changed_classes: new_or_changed,
                deleted_classes: request
                    .deleted_sources
                    .iter()
                    .map(|s| PathBuf::from(format!("{}.class", s.display())))
                    .collect(),
                relations_fingerprint: fingerprint,
            };

            let serialized = serde_json::to_vec(&MockAnalysisFile::from(&analysis))
                .map_err(|e| CompileError::Analysis { op: "compile", message: e.to_string() })?;
            std::fs::write(&request.analysis_file, serialized)
                .map_err(|e| CompileError::Analysis { op: "compile", message: e.to_string() })?;

            self.requests.lock().unwrap().push(request.clone());
            Ok(analysis)
        }

        fn rebase(&self, analysis_file: &Path, new_classes_dir: &Path) -> Result<PathBuf, CompileError> {
            let stem = analysis_file.file_stem().and_then(|s| s.to_str()).unwrap_or("rebased");
            let out = new_classes_dir.join(format!("{stem}.rebased.analysis.json"));
            if let Some(parent) = out.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let _ = std::fs::copy(analysis_file, &out);
            Ok(out)
        }

        fn merge(&self, analyses: &[PathBuf], out: &Path) -> Result<(), CompileError> {
            let mut combined: Vec<MockAnalysisFile> = Vec::new();
            for path in analyses {
                if let Ok(bytes) = std::fs::read(path) {
                    if let Ok(parsed) = serde_json::from_slice::<MockAnalysisFile>(&bytes) {
                        combined.push(parsed);
                    }
                }
            }
            let merged = MockAnalysisFile::merge_all(&combined);
            let serialized = serde_json::to_vec(&merged)
                .map_err(|e| CompileError::Analysis { op: "merge", message: e.to_string() })?;
            if let Some(parent) = out.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            std::fs::write(out, serialized)
                .map_err(|e| CompileError::Analysis { op: "merge", message: e.to_string() })
        }

        fn split(
            &self,
            analysis_file: &Path,
            source_sets: &BTreeMap<String, Vec<PathBuf>>,
        ) -> Result<BTreeMap<String, PathBuf>, CompileError> {
            let bytes = std::fs::read(analysis_file)
                .map_err(|e| CompileError::Analysis { op: "split", message: e.to_string() })?;
            let parsed: MockAnalysisFile = serde_json::from_slice(&bytes)
                .map_err(|e| CompileError::Analysis { op: "split", message: e.to_string() })?;

            let mut out = BTreeMap::new();
            for (target_id, sources) in source_sets {
                let filtered = parsed.subset_for(sources);
                let path = analysis_file.with_file_name(format!("{target_id}.analysis.json"));
                let serialized = serde_json::to_vec(&filtered)
                    .map_err(|e| CompileError::Analysis { op: "split", message: e.to_string() })?;
                std::fs::write(&path, serialized)
                    .map_err(|e| CompileError::Analysis { op: "split", message: e.to_string() })?;
                out.insert(target_id.clone(), path);
            }
            Ok(out)
        }

        fn relativize(&self, analysis_file: &Path, _artifact_root: &Path) -> Result<PathBuf, CompileError> {
            let out = analysis_file.with_extension("portable");
            let _ = std::fs::copy(analysis_file, &out);
            Ok(out)
        }

        fn localize(&self, analysis_file: &Path, _artifact_root: &Path) -> Result<PathBuf, CompileError> {
            let out = analysis_file.with_extension("local");
            let _ = std::fs::copy(analysis_file, &out);
            Ok(out)
        }
    }

    #[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
    struct MockAnalysisFile {
        source_to_classes: BTreeMap<PathBuf, Vec<PathBuf>>,
    }

    impl From<&CompileAnalysis> for MockAnalysisFile {
        fn from(a: &CompileAnalysis) -> Self {
            Self { source_to_classes: a.source_to_classes.clone() }
        }
    }

    impl MockAnalysisFile {
        fn merge_all(parts: &[MockAnalysisFile]) -> Self {
            let mut merged = BTreeMap::new();
            for part in parts {
                merged.extend(part.source_to_classes.clone());
            }
            Self { source_to_classes: merged }
        }

        fn subset_for(&self, sources: &[PathBuf]) -> Self {
            let subset =
                self.source_to_classes.iter().filter(|(k, _)| sources.contains(k)).map(|(k, v)| (k.clone(), v.clone())).collect();
            Self { source_to_classes: subset }
        }
    }

    fn fingerprint_of_sources(sources: &[PathBuf]) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        for s in sources {
            hasher.update(s.to_string_lossy().as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}
