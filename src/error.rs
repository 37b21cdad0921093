use std::path::PathBuf;

use crate::address::Address;

/// Crate-wide result alias, mirroring the error-kind table in the design docs.
pub type Result<T, E = BuildError> = std::result::Result<T, E>;

/// Top-level error kind. Every public, fallible operation in this crate returns this type
/// (or wraps it transparently) rather than panicking.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Manifest(#[from] crate::manifest::ManifestError),

    #[error("dependency cycle: {}", .0.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(" -> "))]
    Cycle(Vec<Address>),

    #[error("target {target} has {count} values for exclusives key {key:?}")]
    ExclusivesConflict { target: Address, key: String, count: usize },

    #[error("compile failed for partition {partition}: {message}")]
    Compile { partition: String, message: String },

    #[error("cache io error: {0}")]
    CacheIo(String),

    #[error("render error: {0}")]
    Render(String),

    #[error("interrupted")]
    Interrupt,

    #[error("worker pool error: {0}")]
    WorkerPool(#[from] crate::worker_pool::WorkerPoolError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("path {0:?} escapes artifact root")]
    PathEscapesRoot(PathBuf),
}

impl BuildError {
    pub fn compile(partition: impl Into<String>, message: impl std::fmt::Display) -> Self {
        BuildError::Compile { partition: partition.into(), message: message.to_string() }
    }
}
