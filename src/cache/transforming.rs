use std::path::PathBuf;

use tracing::warn;

use crate::{
    cache::{Artifact, ArtifactCache},
    cache_key::CacheKey,
    error::Result,
};

/// A transform applied to the set of paths about to be written (e.g. relativizing an analysis
/// file's absolute paths into the portable sentinel form before upload), and its inverse applied
/// after a read (e.g. localizing sentinels back to this workspace's absolute paths).
pub trait ArtifactTransform: Send + Sync {
    fn pre_write(&self, paths: &[PathBuf]) -> Result<Vec<PathBuf>>;
    fn post_read(&self, paths: &[PathBuf]) -> Result<()>;
}

/// Wraps an inner cache, running a transform's `pre_write` before insert and `post_read` after a
/// successful read. Preserves the inner cache's read-only semantics; a transform failure on
/// write degrades to a logged warning rather than failing the build, matching the artifact
/// cache's overall cache-failure-must-not-break-a-build contract.
pub struct TransformingArtifactCache<C> {
    inner: C,
    transform: Box<dyn ArtifactTransform>,
}

impl<C: ArtifactCache> TransformingArtifactCache<C> {
    pub fn new(inner: C, transform: Box<dyn ArtifactTransform>) -> Self {
        Self { inner, transform }
    }
}

impl<C: ArtifactCache> ArtifactCache for TransformingArtifactCache<C> {
    fn insert(&self, cache_key: &CacheKey, paths: &[PathBuf]) -> Result<()> {
        let transformed = self.transform.pre_write(paths)?;
        self.inner.insert(cache_key, &transformed)
    }

    fn try_insert(&self, cache_key: &CacheKey, paths: &[PathBuf]) {
        match self.transform.pre_write(paths) {
            Ok(transformed) => self.inner.try_insert(cache_key, &transformed),
            Err(err) => warn!(id = %cache_key.id, %err, "pre_write transform failed, skipping cache write"),
        }
    }

    fn has(&self, cache_key: &CacheKey) -> bool {
        self.inner.has(cache_key)
    }

    fn use_cached_files(&self, cache_key: &CacheKey) -> Option<Artifact> {
        let artifact = self.inner.use_cached_files(cache_key)?;
        if let Err(err) = self.transform.post_read(artifact.relpaths()) {
            warn!(id = %cache_key.id, %err, "post_read transform failed");
            return None;
        }
        Some(artifact)
    }

    fn delete(&self, cache_key: &CacheKey) {
        self.inner.delete(cache_key)
    }

    fn prune(&self, age: std::time::Duration) {
        self.inner.prune(age)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LocalArtifactCache;
    use std::sync::Mutex;

    struct UppercasingTransform {
        seen_write: Mutex<Vec<PathBuf>>,
        seen_read: Mutex<Vec<PathBuf>>,
    }

    impl ArtifactTransform for UppercasingTransform {
        fn pre_write(&self, paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
            self.seen_write.lock().unwrap().extend(paths.iter().cloned());
            Ok(paths.to_vec())
        }

        fn post_read(&self, paths: &[PathBuf]) -> Result<()> {
            self.seen_read.lock().unwrap().extend(paths.iter().cloned());
            Ok(())
        }
    }

    #[test]
    fn invokes_transform_around_inner_cache() {
        let root = tempfile::tempdir().unwrap();
        let cache_root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("a.analysis"), b"x").unwrap();

        let local = LocalArtifactCache::new(root.path(), cache_root.path()).unwrap();
        let transform = Box::new(UppercasingTransform {
            seen_write: Mutex::new(Vec::new()),
            seen_read: Mutex::new(Vec::new()),
        });
        let cache = TransformingArtifactCache::new(local, transform);

        let key = CacheKey { id: "t".into(), hash: "h".into(), sources: vec![] };
        cache.insert(&key, &[PathBuf::from("a.analysis")]).unwrap();
        assert!(cache.has(&key));
        let artifact = cache.use_cached_files(&key).unwrap();
        assert_eq!(artifact.relpaths(), &[PathBuf::from("a.analysis")]);
    }
}
