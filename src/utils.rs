use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{BuildError, Result};

/// Canonicalizes a path without the UNC-prefix weirdness `std::fs::canonicalize` introduces on
/// Windows, so fingerprints and cache keys stay stable across platforms.
pub fn canonicalize(path: impl AsRef<Path>) -> Result<PathBuf> {
    dunce::canonicalize(path.as_ref()).map_err(BuildError::Io)
}

pub fn create_parent_dir_all(file: impl AsRef<Path>) -> Result<()> {
    if let Some(parent) = file.as_ref().parent() {
        fs::create_dir_all(parent)
            .map_err(|err| BuildError::CacheIo(format!("failed to create {parent:?}: {err}")))?;
    }
    Ok(())
}

/// Reads and deserializes a json file via an mmap, avoiding a full read into a heap buffer for
/// large cache/analysis files.
pub fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let file = File::open(path)
        .map_err(|err| BuildError::CacheIo(format!("failed to open {path:?}: {err}")))?;
    // SAFETY: the file is not concurrently truncated by this process; cache files are written
    // via write-temp-then-rename so no other process observes a partial file at this path either.
    let mmap = unsafe { memmap2::Mmap::map(&file) }
        .map_err(|err| BuildError::CacheIo(format!("failed to mmap {path:?}: {err}")))?;
    serde_json::from_slice(&mmap)
        .map_err(|err| BuildError::CacheIo(format!("failed to parse {path:?}: {err}")))
}

pub fn write_json_file<T: Serialize>(path: impl AsRef<Path>, value: &T, capacity: usize) -> Result<()> {
    let path = path.as_ref();
    create_parent_dir_all(path)?;
    let file = File::create(path)
        .map_err(|err| BuildError::CacheIo(format!("failed to create {path:?}: {err}")))?;
    let mut writer = BufWriter::with_capacity(capacity, file);
    serde_json::to_writer(&mut writer, value)
        .map_err(|err| BuildError::CacheIo(format!("failed to write {path:?}: {err}")))?;
    writer.flush().map_err(BuildError::Io)?;
    Ok(())
}

pub fn tempdir(prefix: &str) -> Result<tempfile::TempDir> {
    tempfile::Builder::new().prefix(prefix).tempdir().map_err(BuildError::Io)
}

/// Deterministic, sorted walk of every regular file under `root`, yielding paths relative to
/// `root`. Directory entries are skipped; order is stable across platforms.
pub fn sorted_relative_files(root: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let root = root.as_ref();
    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(root).into_iter() {
        let entry = entry.map_err(|err| BuildError::Io(err.into()))?;
        if entry.file_type().is_file() {
            let rel = entry
                .path()
                .strip_prefix(root)
                .expect("walkdir yields children of root")
                .to_path_buf();
            out.push(rel);
        }
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn json_round_trip() {
        let dir = tempdir("utils-test").unwrap();
        let file = dir.path().join("nested").join("cache.json");
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), 1u32);
        map.insert("b".to_string(), 2u32);
        write_json_file(&file, &map, 4096).unwrap();
        let read: BTreeMap<String, u32> = read_json_file(&file).unwrap();
        assert_eq!(map, read);
    }

    #[test]
    fn sorted_relative_files_is_stable() {
        let dir = tempdir("utils-test").unwrap();
        fs::create_dir_all(dir.path().join("b")).unwrap();
        fs::write(dir.path().join("b/2.txt"), b"x").unwrap();
        fs::write(dir.path().join("a.txt"), b"y").unwrap();
        let files = sorted_relative_files(dir.path()).unwrap();
        assert_eq!(files, vec![PathBuf::from("a.txt"), PathBuf::from("b/2.txt")]);
    }
}
