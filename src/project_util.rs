//! Fixture workspace construction, gated behind the `project-util` feature so production builds
//! never pull in `tempfile`/`fs_extra`/`rand`. Mirrors the teacher's own `project_util` module:
//! a thin builder over a temp directory that lets tests assemble a small manifest tree without
//! hand-rolling `std::fs` calls at every call site.

use std::{
    fs,
    path::{Path, PathBuf},
};

use rand::Rng;

use crate::{
    error::{BuildError, Result},
    graph::BuildGraph,
    manifest::{self, default_registry},
};

/// A manifest + source tree rooted in a [`tempfile::TempDir`], torn down on drop.
pub struct TempWorkspace {
    root: tempfile::TempDir,
}

impl TempWorkspace {
    pub fn new() -> Result<Self> {
        let root = tempfile::Builder::new()
            .prefix("mosaic-workspace-")
            .tempdir()
            .map_err(BuildError::Io)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Writes `contents` at `relpath` under the workspace root, creating parent directories.
    pub fn write(&self, relpath: impl AsRef<Path>, contents: &str) -> Result<PathBuf> {
        let path = self.root.path().join(relpath);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(BuildError::Io)?;
        }
        fs::write(&path, contents).map_err(BuildError::Io)?;
        Ok(path)
    }

    /// Writes a single source file whose content is a random-suffixed placeholder, for tests
    /// that only need the file's existence and a stable-looking path, not real source text.
    pub fn write_fake_source(&self, relpath: impl AsRef<Path>) -> Result<PathBuf> {
        let marker: u32 = rand::thread_rng().gen();
        self.write(relpath, &format!("// fixture {marker}\n"))
    }

    /// Parses and resolves every manifest reachable from `roots` into a [`BuildGraph`] using the
    /// built-in `jvm_library`/`jar_library` alias registry.
    pub fn load_graph(&self, roots: impl IntoIterator<Item = PathBuf>) -> Result<BuildGraph> {
        let mut loader = manifest::ManifestLoader::new();
        loader.load_transitively(roots).map_err(BuildError::Manifest)?;
        let proxies = loader.into_proxies();
        manifest::resolve_into_graph(proxies, &default_registry())
    }

    /// Deep-copies this workspace's tree into `dest`, e.g. to snapshot a fixture before a
    /// destructive test mutates the original further.
    pub fn snapshot_into(&self, dest: &Path) -> Result<()> {
        fs::create_dir_all(dest).map_err(BuildError::Io)?;
        let mut options = fs_extra::dir::CopyOptions::new();
        options.content_only = true;
        fs_extra::dir::copy(self.root.path(), dest, &options)
            .map_err(|err| BuildError::CacheIo(err.to_string()))?;
        Ok(())
    }
}

/// A `[[target]]` TOML fragment for a `jvm_library`, with `name`, `sources`, and `dependencies`
/// filled in. Callers append the result to a manifest body built up with [`TempWorkspace::write`].
pub fn jvm_library_stanza(name: &str, sources: &[&str], dependencies: &[&str]) -> String {
    let sources = sources.iter().map(|s| format!("{s:?}")).collect::<Vec<_>>().join(", ");
    let dependencies = dependencies.iter().map(|d| format!("{d:?}")).collect::<Vec<_>>().join(", ");
    format!(
        "[[target]]\ntype = \"jvm_library\"\nname = {name:?}\nsources = [{sources}]\ndependencies = [{dependencies}]\n\n"
    )
}

/// A `[[target]]` TOML fragment for a `jar_library`, with `name` and `jars` filled in.
pub fn jar_library_stanza(name: &str, jars: &[&str]) -> String {
    let jars = jars.iter().map(|j| format!("{j:?}")).collect::<Vec<_>>().join(", ");
    format!("[[target]]\ntype = \"jar_library\"\nname = {name:?}\njars = [{jars}]\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;

    #[test]
    fn builds_a_two_target_graph_from_fixture_stanzas() {
        let ws = TempWorkspace::new().unwrap();
        ws.write_fake_source("src/Lib.java").unwrap();
        let mut body = jar_library_stanza("guava", &["guava-31.jar"]);
        body.push_str(&jvm_library_stanza("lib", &["Lib.java"], &[":guava"]));
        let build_file = ws.write("src/BUILD.toml", &body).unwrap();

        let graph = ws.load_graph([build_file.clone()]).unwrap();
        let lib = Address::new(build_file.clone(), "lib");
        let guava = Address::new(build_file, "guava");
        assert!(graph.dependencies_of(&lib).unwrap().contains(&guava));
    }

    #[test]
    fn snapshot_into_copies_the_tree() {
        let ws = TempWorkspace::new().unwrap();
        ws.write("a/b.txt", "hello").unwrap();
        let dest = tempfile::tempdir().unwrap();
        ws.snapshot_into(dest.path()).unwrap();
        assert!(dest.path().join("a/b.txt").exists());
    }
}
