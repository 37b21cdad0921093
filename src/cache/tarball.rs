//! Single-file tarball artifact: every cached path packed into one `.tar` (optionally
//! gzip-compressed), instead of a loose directory of files. Cheaper than `DirectoryArtifact` for
//! cache backends that charge per object (e.g. a remote blob store) rather than per byte.

use std::{
    fs::File,
    io::{Read as _, Write as _},
    path::{Path, PathBuf},
};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};

use crate::error::{BuildError, Result};

/// A tar archive of cached files, written once at `archive_path` and read back wholesale.
/// `gzip` controls whether the archive is deflate-compressed; either way the member paths are
/// relative to `artifact_root`.
pub struct TarballArtifact {
    pub artifact_root: PathBuf,
    pub archive_path: PathBuf,
    pub relpaths: Vec<PathBuf>,
    pub gzip: bool,
}

impl TarballArtifact {
    pub fn new(artifact_root: PathBuf, archive_path: PathBuf, gzip: bool) -> Self {
        let relpaths = Self::list_entries(&archive_path, gzip).unwrap_or_default();
        Self { artifact_root, archive_path, relpaths, gzip }
    }

    fn list_entries(archive_path: &Path, gzip: bool) -> Result<Vec<PathBuf>> {
        let file = match File::open(archive_path) {
            Ok(f) => f,
            Err(_) => return Ok(Vec::new()),
        };
        let mut archive = open_archive(file, gzip);
        let mut out = Vec::new();
        for entry in archive.entries().map_err(BuildError::Io)? {
            let entry = entry.map_err(BuildError::Io)?;
            out.push(entry.path().map_err(BuildError::Io)?.into_owned());
        }
        out.sort();
        Ok(out)
    }

    /// Packs `paths` (interpreted relative to `artifact_root`) into a fresh archive at
    /// `archive_path`, dereferencing symlinks so the tarball never depends on the source tree's
    /// link structure. Every path must resolve under `artifact_root`.
    pub fn write(&mut self, paths: &[PathBuf]) -> Result<()> {
        for rel in paths {
            if rel.is_absolute() || rel.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
                return Err(BuildError::PathEscapesRoot(rel.clone()));
            }
        }
        if let Some(parent) = self.archive_path.parent() {
            std::fs::create_dir_all(parent).map_err(BuildError::Io)?;
        }
        let file = File::create(&self.archive_path).map_err(BuildError::Io)?;
        let writer: Box<dyn std::io::Write> = if self.gzip {
            Box::new(GzEncoder::new(file, Compression::default()))
        } else {
            Box::new(file)
        };
        let mut builder = tar::Builder::new(writer);
        builder.follow_symlinks(true);
        for rel in paths {
            let abs = self.artifact_root.join(rel);
            builder.append_path_with_name(&abs, rel).map_err(BuildError::Io)?;
        }
        builder.into_inner().map_err(BuildError::Io)?.flush().map_err(BuildError::Io)?;
        self.relpaths = paths.to_vec();
        self.relpaths.sort();
        Ok(())
    }

    /// Unpacks every member back out to its path beneath `artifact_root`, returning the relative
    /// paths produced.
    pub fn extract(&self) -> Result<Vec<PathBuf>> {
        let file = File::open(&self.archive_path).map_err(BuildError::Io)?;
        let mut archive = open_archive(file, self.gzip);
        let mut produced = Vec::new();
        for entry in archive.entries().map_err(BuildError::Io)? {
            let mut entry = entry.map_err(BuildError::Io)?;
            let rel = entry.path().map_err(BuildError::Io)?.into_owned();
            if rel.is_absolute() || rel.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
                return Err(BuildError::PathEscapesRoot(rel));
            }
            let dest = self.artifact_root.join(&rel);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).map_err(BuildError::Io)?;
            }
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf).map_err(BuildError::Io)?;
            std::fs::write(&dest, &buf).map_err(BuildError::Io)?;
            produced.push(rel);
        }
        Ok(produced)
    }
}

fn open_archive(file: File, gzip: bool) -> tar::Archive<Box<dyn std::io::Read>> {
    let reader: Box<dyn std::io::Read> =
        if gzip { Box::new(GzDecoder::new(file)) } else { Box::new(file) };
    tar::Archive::new(reader)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_uncompressed() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("p")).unwrap();
        std::fs::write(root.path().join("p/a.class"), b"xxx").unwrap();

        let archive_path = tempfile::tempdir().unwrap().path().join("out.tar");
        let mut artifact = TarballArtifact::new(root.path().to_path_buf(), archive_path, false);
        artifact.write(&[PathBuf::from("p/a.class")]).unwrap();

        std::fs::remove_file(root.path().join("p/a.class")).unwrap();
        let produced = artifact.extract().unwrap();
        assert_eq!(produced, vec![PathBuf::from("p/a.class")]);
        assert_eq!(std::fs::read(root.path().join("p/a.class")).unwrap(), b"xxx");
    }

    #[test]
    fn round_trips_gzip() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("a.analysis"), b"yyy").unwrap();

        let archive_path = tempfile::tempdir().unwrap().path().join("out.tar.gz");
        let mut artifact = TarballArtifact::new(root.path().to_path_buf(), archive_path, true);
        artifact.write(&[PathBuf::from("a.analysis")]).unwrap();

        std::fs::remove_file(root.path().join("a.analysis")).unwrap();
        artifact.extract().unwrap();
        assert_eq!(std::fs::read(root.path().join("a.analysis")).unwrap(), b"yyy");
    }

    #[test]
    fn rejects_paths_escaping_root() {
        let root = tempfile::tempdir().unwrap();
        let archive_path = tempfile::tempdir().unwrap().path().join("out.tar");
        let mut artifact = TarballArtifact::new(root.path().to_path_buf(), archive_path, false);
        let err = artifact.write(&[PathBuf::from("../escape")]);
        assert!(err.is_err());
    }
}
