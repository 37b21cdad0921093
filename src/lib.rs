#![doc = include_str!("../README.md")]
#![warn(rustdoc::all)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

#[macro_use]
pub mod error;

pub mod address;
pub mod cache;
pub mod cache_key;
pub mod compiler;
pub mod config;
pub mod exclusives;
pub mod graph;
pub mod manifest;
pub mod orchestrator;
pub mod report;
pub mod run_tracker;
pub mod utils;
pub mod worker_pool;
pub mod workunit;

pub use address::Address;
pub use cache::{ArtifactCache, ArtifactCacheStats, LocalArtifactCache};
pub use cache_key::{CacheKey, InvalidationStore, VersionedTarget, VersionedTargetSet};
pub use config::{BuildConfig, BuildConfigBuilder};
pub use error::{BuildError, Result};
pub use exclusives::{ExclusivesGroups, ExclusivesMap, GroupKey};
pub use graph::{BuildGraph, Payload, Target};
pub use manifest::{default_registry, resolve_into_graph, ManifestError, ManifestLoader, PayloadFactory};
pub use orchestrator::{Orchestrator, OrchestratorOutput};
pub use report::{ConsoleReporter, ReportBus, Reporter};
pub use run_tracker::RunTracker;
pub use worker_pool::{WorkerPool, WorkerPoolError};
pub use workunit::{Outcome, WorkUnit};

/// Utilities for constructing and testing fixture workspaces (temporary manifests, fake sources).
#[cfg(feature = "project-util")]
pub mod project_util;
