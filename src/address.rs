use std::{fmt, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};

/// Canonical identifier of a target: a manifest path plus a name unique within that manifest.
///
/// The string form is `relpath:name`; when `:name` is omitted the name defaults to the
/// manifest's containing directory basename. Two addresses are equal iff their fields are
/// structurally equal; addresses are immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address {
    build_file: PathBuf,
    name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("address spec {0:?} is empty")]
    Empty(String),
    #[error("address spec {0:?} has more than one ':'")]
    MultipleColons(String),
}

impl Address {
    pub fn new(build_file: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self { build_file: build_file.into(), name: name.into() }
    }

    pub fn build_file(&self) -> &PathBuf {
        &self.build_file
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolves a raw dependency spec relative to the manifest that contains it.
    ///
    /// Accepts `path/to/dir:name`, `path/to/dir` (name defaults to the dir's basename), and
    /// `:name` (sibling within `relative_to`).
    pub fn parse_spec(spec: &str, relative_to: &PathBuf) -> Result<Self, AddressError> {
        if spec.is_empty() {
            return Err(AddressError::Empty(spec.to_string()));
        }
        let mut parts = spec.splitn(2, ':');
        let path_part = parts.next().unwrap_or_default();
        let name_part = parts.next();
        if spec.matches(':').count() > 1 {
            return Err(AddressError::MultipleColons(spec.to_string()));
        }

        if path_part.is_empty() {
            // `:name` - sibling of the manifest we're resolving from.
            let name = name_part.unwrap_or_default().to_string();
            return Ok(Address::new(relative_to.clone(), name));
        }

        let build_file = PathBuf::from(path_part);
        let name = match name_part {
            Some(n) => n.to_string(),
            None => build_file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        Ok(Address::new(build_file, name))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.build_file.display(), self.name)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse_spec(s, &PathBuf::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_spec() {
        let addr = Address::parse_spec("a/b:c", &PathBuf::from("x")).unwrap();
        assert_eq!(addr, Address::new("a/b", "c"));
    }

    #[test]
    fn defaults_name_to_basename() {
        let addr = Address::parse_spec("a/b", &PathBuf::from("x")).unwrap();
        assert_eq!(addr, Address::new("a/b", "b"));
    }

    #[test]
    fn sibling_spec_uses_relative_to() {
        let addr = Address::parse_spec(":c", &PathBuf::from("a/b")).unwrap();
        assert_eq!(addr, Address::new("a/b", "c"));
    }

    #[test]
    fn rejects_multiple_colons() {
        let err = Address::parse_spec("a:b:c", &PathBuf::from("x")).unwrap_err();
        assert!(matches!(err, AddressError::MultipleColons(_)));
    }

    #[test]
    fn display_round_trips() {
        let addr = Address::new("a/b", "c");
        assert_eq!(addr.to_string(), "a/b:c");
    }
}
