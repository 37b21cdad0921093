use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use tracing::{instrument, warn};

use crate::{
    cache::{default_copy_fn, Artifact, ArtifactCache, CopyFn, DirectoryArtifact},
    cache_key::CacheKey,
    error::Result,
};

/// Local directory cache: a key maps to `cache_root/<id>/<hash>/`. Writes go to a sibling
/// `.tmp` directory first and are atomically renamed into place, so a crash mid-write can never
/// leave a corrupt entry and concurrent writers to the same key race safely (the loser's rename
/// simply replaces the winner's, but neither observes a half-written directory).
pub struct LocalArtifactCache {
    artifact_root: PathBuf,
    cache_root: PathBuf,
    copy_fn: Arc<CopyFn>,
    read_only: bool,
}

impl LocalArtifactCache {
    pub fn new(artifact_root: impl Into<PathBuf>, cache_root: impl Into<PathBuf>) -> Result<Self> {
        let cache_root = cache_root.into();
        std::fs::create_dir_all(&cache_root)?;
        Ok(Self {
            artifact_root: artifact_root.into(),
            cache_root,
            copy_fn: Arc::new(default_copy_fn),
            read_only: false,
        })
    }

    #[must_use]
    pub fn with_copy_fn(mut self, copy_fn: Arc<CopyFn>) -> Self {
        self.copy_fn = copy_fn;
        self
    }

    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// It's important to key on `id` as well as `hash`: two different targets with no sources
    /// can share a hash, and callers still want distinct cache directories for them.
    fn cache_dir_for_key(&self, cache_key: &CacheKey) -> PathBuf {
        self.cache_root.join(&cache_key.id).join(&cache_key.hash)
    }
}

impl ArtifactCache for LocalArtifactCache {
    #[instrument(level = "debug", skip(self, paths), fields(id = %cache_key.id))]
    fn insert(&self, cache_key: &CacheKey, paths: &[PathBuf]) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let cache_dir = self.cache_dir_for_key(cache_key);
        let cache_dir_tmp = {
            let mut tmp = cache_dir.clone().into_os_string();
            tmp.push(".tmp");
            PathBuf::from(tmp)
        };
        let _ = std::fs::remove_dir_all(&cache_dir_tmp);
        std::fs::create_dir_all(&cache_dir_tmp)?;

        let mut artifact =
            DirectoryArtifact::new(self.artifact_root.clone(), cache_dir_tmp.clone(), self.copy_fn.clone());
        artifact.collect(paths)?;

        let _ = std::fs::remove_dir_all(&cache_dir);
        std::fs::rename(&cache_dir_tmp, &cache_dir)?;
        Ok(())
    }

    fn try_insert(&self, cache_key: &CacheKey, paths: &[PathBuf]) {
        if let Err(err) = self.insert(cache_key, paths) {
            warn!(id = %cache_key.id, %err, "artifact cache write failed, continuing without caching");
        }
    }

    fn has(&self, cache_key: &CacheKey) -> bool {
        self.cache_dir_for_key(cache_key).is_dir()
    }

    fn use_cached_files(&self, cache_key: &CacheKey) -> Option<Artifact> {
        let cache_dir = self.cache_dir_for_key(cache_key);
        if !cache_dir.is_dir() {
            return None;
        }
        Some(Artifact::Directory(DirectoryArtifact::new(
            self.artifact_root.clone(),
            cache_dir,
            self.copy_fn.clone(),
        )))
    }

    fn delete(&self, cache_key: &CacheKey) {
        let _ = std::fs::remove_dir_all(self.cache_dir_for_key(cache_key));
    }

    fn prune(&self, age: Duration) {
        let Ok(entries) = walkdir::WalkDir::new(&self.cache_root).min_depth(2).max_depth(2).into_iter().collect::<std::result::Result<Vec<_>, _>>() else {
            return;
        };
        let cutoff = SystemTime::now() - age;
        for entry in entries {
            if let Ok(metadata) = entry.metadata() {
                if metadata.is_dir() {
                    if let Ok(modified) = metadata.modified() {
                        if modified < cutoff {
                            let _ = std::fs::remove_dir_all(entry.path());
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn key(id: &str, hash: &str) -> CacheKey {
        CacheKey { id: id.to_string(), hash: hash.to_string(), sources: vec![] }
    }

    #[test]
    fn round_trip_matches_scenario_4() {
        let root = tempfile::tempdir().unwrap();
        let cache_root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("p/q")).unwrap();
        fs::write(root.path().join("p/x.class"), b"xxx").unwrap();
        fs::write(root.path().join("p/q/y.class"), b"yyy").unwrap();

        let cache = LocalArtifactCache::new(root.path(), cache_root.path()).unwrap();
        let k = key("x.target", "deadbeef");
        let paths = vec![PathBuf::from("p/x.class"), PathBuf::from("p/q/y.class")];
        cache.insert(&k, &paths).unwrap();
        assert!(cache.has(&k));

        fs::remove_file(root.path().join("p/x.class")).unwrap();
        fs::remove_file(root.path().join("p/q/y.class")).unwrap();

        let artifact = cache.use_cached_files(&k).unwrap();
        let produced = artifact.extract().unwrap();
        let mut produced_set: Vec<_> = produced.into_iter().collect();
        produced_set.sort();
        let mut expected = paths.clone();
        expected.sort();
        assert_eq!(produced_set, expected);
        assert_eq!(fs::read(root.path().join("p/x.class")).unwrap(), b"xxx");
        assert_eq!(fs::read(root.path().join("p/q/y.class")).unwrap(), b"yyy");
    }

    #[test]
    fn read_only_cache_swallows_writes() {
        let root = tempfile::tempdir().unwrap();
        let cache_root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("a.class"), b"a").unwrap();
        let cache = LocalArtifactCache::new(root.path(), cache_root.path()).unwrap().read_only(true);
        let k = key("x", "h");
        cache.try_insert(&k, &[PathBuf::from("a.class")]);
        assert!(!cache.has(&k));
    }

    #[test]
    fn rejects_paths_escaping_artifact_root() {
        let root = tempfile::tempdir().unwrap();
        let cache_root = tempfile::tempdir().unwrap();
        let cache = LocalArtifactCache::new(root.path(), cache_root.path()).unwrap();
        let k = key("x", "h");
        let err = cache.insert(&k, &[PathBuf::from("../escape.class")]);
        assert!(err.is_err());
    }
}
