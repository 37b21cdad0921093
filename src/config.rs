use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{error::Result, utils};

/// Optional remote cache endpoint layered behind the local directory cache via
/// [`crate::cache::transforming::TransformingArtifactCache`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteCacheConfig {
    pub address: String,
    pub read_only: bool,
}

/// Paths and policy knobs threaded through every component. Constructed once per run via
/// [`BuildConfigBuilder`] and then shared read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    pub workspace_root: PathBuf,
    pub info_dir: PathBuf,
    pub cache_root: PathBuf,
    pub partition_size_hint: usize,
    pub worker_threads: usize,
    pub exclusives_strict: bool,
    pub invalidate_dependents: bool,
    pub remote_cache: Option<RemoteCacheConfig>,
}

impl BuildConfig {
    pub fn builder(workspace_root: impl Into<PathBuf>) -> BuildConfigBuilder {
        BuildConfigBuilder::new(workspace_root)
    }

    pub fn artifact_root(&self) -> &Path {
        &self.workspace_root
    }
}

/// Chainable builder for [`BuildConfig`], mirroring the project builder pattern used elsewhere
/// in this crate: every setter takes and returns `self` and is marked `#[must_use]`.
#[derive(Debug, Clone)]
pub struct BuildConfigBuilder {
    workspace_root: PathBuf,
    info_dir: Option<PathBuf>,
    cache_root: Option<PathBuf>,
    partition_size_hint: usize,
    worker_threads: Option<usize>,
    exclusives_strict: bool,
    invalidate_dependents: bool,
    remote_cache: Option<RemoteCacheConfig>,
}

impl BuildConfigBuilder {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            info_dir: None,
            cache_root: None,
            partition_size_hint: 500,
            worker_threads: None,
            exclusives_strict: true,
            invalidate_dependents: false,
            remote_cache: None,
        }
    }

    #[must_use]
    pub fn info_dir(mut self, info_dir: impl Into<PathBuf>) -> Self {
        self.info_dir = Some(info_dir.into());
        self
    }

    #[must_use]
    pub fn cache_root(mut self, cache_root: impl Into<PathBuf>) -> Self {
        self.cache_root = Some(cache_root.into());
        self
    }

    #[must_use]
    pub fn partition_size_hint(mut self, hint: usize) -> Self {
        self.partition_size_hint = hint;
        self
    }

    #[must_use]
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = Some(threads);
        self
    }

    #[must_use]
    pub fn exclusives_strict(mut self, strict: bool) -> Self {
        self.exclusives_strict = strict;
        self
    }

    #[must_use]
    pub fn invalidate_dependents(mut self, invalidate: bool) -> Self {
        self.invalidate_dependents = invalidate;
        self
    }

    #[must_use]
    pub fn remote_cache(mut self, remote: RemoteCacheConfig) -> Self {
        self.remote_cache = Some(remote);
        self
    }

    pub fn build(self) -> Result<BuildConfig> {
        let workspace_root = utils::canonicalize(&self.workspace_root).or_else(|_| {
            std::fs::create_dir_all(&self.workspace_root)?;
            utils::canonicalize(&self.workspace_root)
        })?;
        let info_dir = self.info_dir.unwrap_or_else(|| workspace_root.join(".build/runs"));
        let cache_root = self.cache_root.unwrap_or_else(|| {
            dirs::cache_dir()
                .map(|d| d.join("mosaic-build"))
                .unwrap_or_else(|| workspace_root.join(".build/cache"))
        });
        Ok(BuildConfig {
            workspace_root,
            info_dir,
            cache_root,
            partition_size_hint: self.partition_size_hint,
            worker_threads: self.worker_threads.unwrap_or_else(num_cpus::get),
            exclusives_strict: self.exclusives_strict,
            invalidate_dependents: self.invalidate_dependents,
            remote_cache: self.remote_cache,
        })
    }
}
