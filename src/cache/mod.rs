//! Content-addressed artifact cache: local directory store plus an optional transforming layer
//! for portable ↔ local path rewriting.

mod local;
mod tarball;
mod transforming;

pub use local::LocalArtifactCache;
pub use tarball::TarballArtifact;
pub use transforming::TransformingArtifactCache;

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use auto_impl::auto_impl;

use crate::{cache_key::CacheKey, error::Result};

/// A function copying a cached file at an absolute source path to a path relative to the
/// artifact root. Pluggable so callers can hard-link instead of copy when the filesystem allows
/// it.
pub type CopyFn = dyn Fn(&Path, &Path) -> std::io::Result<()> + Send + Sync;

pub fn default_copy_fn(src: &Path, dst: &Path) -> std::io::Result<()> {
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(src, dst)?;
    Ok(())
}

/// A set of files produced by one cache entry, rooted either under a plain directory or a
/// tarball. Both variants expose the same `{artifact_root, relpaths}` contract through
/// [`Artifact::extract`]/[`Artifact::relpaths`].
pub enum Artifact {
    Directory(DirectoryArtifact),
    Tarball(TarballArtifact),
}

impl Artifact {
    pub fn extract(&self) -> Result<Vec<PathBuf>> {
        match self {
            Artifact::Directory(d) => d.extract(),
            Artifact::Tarball(t) => t.extract(),
        }
    }

    pub fn relpaths(&self) -> &[PathBuf] {
        match self {
            Artifact::Directory(d) => &d.relpaths,
            Artifact::Tarball(t) => &t.relpaths,
        }
    }
}

/// Loose files under a directory. `collect` copies files in (at cache-write time); `extract`
/// copies them back out to their real locations beneath `artifact_root` (at cache-read time).
pub struct DirectoryArtifact {
    pub artifact_root: PathBuf,
    pub cache_dir: PathBuf,
    pub relpaths: Vec<PathBuf>,
    copy_fn: std::sync::Arc<CopyFn>,
}

impl DirectoryArtifact {
    pub fn new(artifact_root: PathBuf, cache_dir: PathBuf, copy_fn: std::sync::Arc<CopyFn>) -> Self {
        let relpaths = crate::utils::sorted_relative_files(&cache_dir).unwrap_or_default();
        Self { artifact_root, cache_dir, relpaths, copy_fn }
    }

    /// Copies every path in `paths` (interpreted relative to `artifact_root`) into `cache_dir`.
    /// Every path must resolve under `artifact_root`.
    pub fn collect(&mut self, paths: &[PathBuf]) -> Result<()> {
        for rel in paths {
            if rel.is_absolute() || rel.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
                return Err(crate::error::BuildError::PathEscapesRoot(rel.clone()));
            }
            let abs = self.artifact_root.join(rel);
            let dest = self.cache_dir.join(rel);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).map_err(crate::error::BuildError::Io)?;
            }
            std::fs::copy(&abs, &dest).map_err(crate::error::BuildError::Io)?;
            self.relpaths.push(rel.clone());
        }
        Ok(())
    }

    /// Copies every cached file out to its path beneath `artifact_root`, returning the set of
    /// relative paths produced.
    pub fn extract(&self) -> Result<Vec<PathBuf>> {
        let mut produced = Vec::new();
        for rel in &self.relpaths {
            let src = self.cache_dir.join(rel);
            let dst = self.artifact_root.join(rel);
            (self.copy_fn)(&src, &dst).map_err(crate::error::BuildError::Io)?;
            produced.push(rel.clone());
        }
        Ok(produced)
    }
}

/// `{insert, try_insert, has, use_cached_files, delete, prune}` over a content-addressed store.
/// All artifact paths must lie below `artifact_root`; a cache failure must never fail the build,
/// so implementations log and swallow write-path errors when `read_only` (see [`LocalArtifactCache`]).
#[auto_impl(&, Box, Arc)]
pub trait ArtifactCache: Send + Sync {
    fn insert(&self, cache_key: &CacheKey, paths: &[PathBuf]) -> Result<()>;
    fn try_insert(&self, cache_key: &CacheKey, paths: &[PathBuf]);
    fn has(&self, cache_key: &CacheKey) -> bool;
    fn use_cached_files(&self, cache_key: &CacheKey) -> Option<Artifact>;
    fn delete(&self, cache_key: &CacheKey);
    fn prune(&self, age: std::time::Duration);
}

/// Per-cache-name hit/miss counters surfaced via the run tracker's `artifact_cache_stats` file.
#[derive(Debug, Default)]
pub struct ArtifactCacheStats {
    stats: Mutex<BTreeMap<String, (Vec<String>, Vec<String>)>>,
}

impl ArtifactCacheStats {
    pub fn record_hit(&self, cache_name: &str, target_id: &str) {
        self.stats
            .lock()
            .unwrap()
            .entry(cache_name.to_string())
            .or_default()
            .0
            .push(target_id.to_string());
    }

    pub fn record_miss(&self, cache_name: &str, target_id: &str) {
        self.stats
            .lock()
            .unwrap()
            .entry(cache_name.to_string())
            .or_default()
            .1
            .push(target_id.to_string());
    }

    pub fn render(&self) -> String {
        let stats = self.stats.lock().unwrap();
        let mut out = String::new();
        for (name, (hits, misses)) in stats.iter() {
            out.push_str(&format!("[{name}]\n"));
            out.push_str(&format!("hit_targets: {}\n", hits.join(", ")));
            out.push_str(&format!("miss_targets: {}\n", misses.join(", ")));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_render_per_cache_name() {
        let stats = ArtifactCacheStats::default();
        stats.record_hit("local", "x:a");
        stats.record_miss("local", "x:b");
        let rendered = stats.render();
        assert!(rendered.contains("[local]"));
        assert!(rendered.contains("x:a"));
        assert!(rendered.contains("x:b"));
    }
}
