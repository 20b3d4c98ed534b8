#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]

//! Core of weave: an incremental module bundler.
//!
//! Entries are scanned into a [`ModuleGraph`], every file is run through the
//! transform chain the [`Registry`] selects for it (on a bounded
//! [`WorkerPool`], consulting the [`IncrementalCache`] first), and the
//! [`Emitter`] links the results into bundle artifacts. The
//! [`WatchCoordinator`] turns file-system events into partial rebuilds.

pub mod bundler;
pub mod codes;
pub mod config;
pub mod context;
pub mod css;
pub mod error;
pub mod paths;
pub mod version;
pub mod watch;

pub use bundler::{
    write_artifacts, Artifact, ArtifactKind, ArtifactNamer, BuildOutcome, BuildReport, Bundler,
    CacheEntry, CacheKey, CacheStats, CacheStatus, Chain, Emitter, FileMetadata, IncrementalCache,
    ModuleGraph, ModuleNode, PackageResolver, PatternNamer, Predicate, Registry, Resolution,
    Resolver, SideArtifact, SideArtifactKind, StepError, Transform, TransformContext,
    TransformKind, TransformOutput, WorkerPool,
};
pub use config::{BuildConfig, EntryConfig, Mode, SourceMapMode};
pub use context::{BuildContext, BuildContextBuilder};
pub use error::{BuildError, CacheIoError, ConfigurationError, ResolutionError, TransformError};
pub use version::VERSION;
pub use watch::{WatchCoordinator, WatchError, WatchSession, WatchState, WatchSummary};
