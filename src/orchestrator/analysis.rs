//! Per-target → per-partition artifact merging: the package-directory ownership computation
//! that decides whether a partition's merged classes directory can symlink a target's package
//! wholesale or has to deep-copy it because more than one target contributes to it.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use tracing::trace;

use crate::{address::Address, error::Result};

/// For every package directory (the parent of a `.class` file, relative to a classes root),
/// the set of targets whose analysis claims to produce classes there. A directory owned by
/// exactly one target can be symlinked into a merge; any more and it must be deep-copied.
pub fn owned_package_dirs(
    per_target_classes: &BTreeMap<Address, Vec<PathBuf>>,
) -> BTreeMap<PathBuf, Vec<Address>> {
    let mut owners: BTreeMap<PathBuf, Vec<Address>> = BTreeMap::new();
    for (address, classes) in per_target_classes {
        let mut dirs: std::collections::BTreeSet<PathBuf> = std::collections::BTreeSet::new();
        for class in classes {
            if let Some(parent) = class.parent() {
                dirs.insert(parent.to_path_buf());
            }
        }
        for dir in dirs {
            owners.entry(dir).or_default().push(address.clone());
        }
    }
    owners
}

/// Merges each target's per-target classes directory into `merged_dir`. A package directory
/// owned by exactly one target is symlinked; a directory already symlinked in by an earlier
/// target that a later target also wants to contribute to is un-linked, deep-copied, and then
/// the later target's classes are copied on top.
pub fn merge_classes_dirs(
    per_target_dirs: &BTreeMap<Address, PathBuf>,
    per_target_classes: &BTreeMap<Address, Vec<PathBuf>>,
    merged_dir: &Path,
) -> Result<()> {
    std::fs::create_dir_all(merged_dir)?;
    let owners = owned_package_dirs(per_target_classes);

    for (address, source_dir) in per_target_dirs {
        let classes = per_target_classes.get(address).cloned().unwrap_or_default();
        let mut package_dirs: std::collections::BTreeSet<PathBuf> = std::collections::BTreeSet::new();
        for class in &classes {
            if let Some(parent) = class.parent() {
                package_dirs.insert(parent.to_path_buf());
            }
        }

        for package_dir in package_dirs {
            let dest = merged_dir.join(&package_dir);
            let src = source_dir.join(&package_dir);
            let exclusive = owners.get(&package_dir).map(|v| v.len() == 1).unwrap_or(true);

            if dest.symlink_metadata().is_ok() {
                if exclusive {
                    continue;
                }
                if dest.symlink_metadata().map(|m| m.file_type().is_symlink()).unwrap_or(false) {
                    trace!(?package_dir, "un-linking shared package dir for deep copy");
                    let target = std::fs::read_link(&dest)?;
                    std::fs::remove_file(&dest)?;
                    copy_dir_recursive(&target, &dest)?;
                }
            } else if exclusive {
                trace!(?package_dir, address = %address, "symlinking exclusively-owned package dir");
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                symlink_dir(&src, &dest)?;
                continue;
            }

            copy_dir_recursive(&src, &dest)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn symlink_dir(src: &Path, dest: &Path) -> Result<()> {
    std::os::unix::fs::symlink(src, dest)?;
    Ok(())
}

#[cfg(not(unix))]
fn symlink_dir(src: &Path, dest: &Path) -> Result<()> {
    copy_dir_recursive(src, dest)
}

fn copy_dir_recursive(src: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    if !src.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let dest_path = dest.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &dest_path)?;
        } else {
            std::fs::copy(entry.path(), &dest_path)?;
        }
    }
    Ok(())
}

/// Splits a partition's combined `source -> classes` relation into one subset per target, keyed
/// by target id, given each target's owned source set.
pub fn split_source_to_classes(
    combined: &BTreeMap<PathBuf, Vec<PathBuf>>,
    per_target_sources: &BTreeMap<String, Vec<PathBuf>>,
) -> BTreeMap<String, BTreeMap<PathBuf, Vec<PathBuf>>> {
    let mut out = BTreeMap::new();
    for (target_id, sources) in per_target_sources {
        let subset = combined
            .iter()
            .filter(|(src, _)| sources.contains(src))
            .map(|(src, classes)| (src.clone(), classes.clone()))
            .collect();
        out.insert(target_id.clone(), subset);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_dir_owned_by_two_targets_is_shared() {
        let mut per_target = BTreeMap::new();
        per_target.insert(Address::new("a", "a"), vec![PathBuf::from("com/x/A.class")]);
        per_target.insert(Address::new("b", "b"), vec![PathBuf::from("com/x/B.class")]);
        let owners = owned_package_dirs(&per_target);
        assert_eq!(owners[&PathBuf::from("com/x")].len(), 2);
    }

    #[test]
    fn package_dir_owned_by_one_target_is_exclusive() {
        let mut per_target = BTreeMap::new();
        per_target.insert(Address::new("a", "a"), vec![PathBuf::from("com/y/A.class")]);
        let owners = owned_package_dirs(&per_target);
        assert_eq!(owners[&PathBuf::from("com/y")].len(), 1);
    }

    #[test]
    fn merge_symlinks_exclusive_dir_and_copies_shared_one() {
        let root = tempfile::tempdir().unwrap();
        let a_dir = root.path().join("a_classes");
        let b_dir = root.path().join("b_classes");
        std::fs::create_dir_all(a_dir.join("com/x")).unwrap();
        std::fs::create_dir_all(b_dir.join("com/y")).unwrap();
        std::fs::write(a_dir.join("com/x/A.class"), b"a").unwrap();
        std::fs::write(b_dir.join("com/y/B.class"), b"b").unwrap();

        let addr_a = Address::new("a", "a");
        let addr_b = Address::new("b", "b");
        let mut per_target_dirs = BTreeMap::new();
        per_target_dirs.insert(addr_a.clone(), a_dir);
        per_target_dirs.insert(addr_b.clone(), b_dir);

        let mut per_target_classes = BTreeMap::new();
        per_target_classes.insert(addr_a, vec![PathBuf::from("com/x/A.class")]);
        per_target_classes.insert(addr_b, vec![PathBuf::from("com/y/B.class")]);

        let merged = root.path().join("merged");
        merge_classes_dirs(&per_target_dirs, &per_target_classes, &merged).unwrap();

        assert!(merged.join("com/x/A.class").exists());
        assert!(merged.join("com/y/B.class").exists());
    }
}
