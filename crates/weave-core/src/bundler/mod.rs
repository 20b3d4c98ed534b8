//! The incremental bundler.
//!
//! ## Architecture
//!
//! 1. **Graph** - scan and resolve imports from each entry ([`graph`])
//! 2. **Registry** - pick the transform chain of every reachable file ([`registry`])
//! 3. **Transform** - run chains on the worker pool, cache first ([`pool`], [`cache`])
//! 4. **Emit** - link transformed modules into artifacts ([`emit`])
//!
//! A [`Bundler`] keeps its graphs between builds. [`Bundler::rebuild`] only
//! re-reads the changed files; nodes whose content is unchanged keep their
//! transformed output and are not dispatched again.
//!
//! ```ignore
//! use weave_core::{BuildConfig, BuildContext, Bundler, Mode};
//!
//! let ctx = BuildContext::init(BuildConfig::new(root, Mode::Development))?;
//! let mut bundler = Bundler::new(ctx);
//! let outcome = bundler.build();
//! bundler.write(&outcome)?;
//! ```

pub mod cache;
pub mod emit;
pub mod graph;
pub(crate) mod lexer;
pub mod naming;
pub mod plugin;
pub mod pool;
pub mod registry;
pub mod resolve;
pub mod scan;
pub mod sourcemap;
pub mod transform;

pub use cache::{CacheEntry, CacheKey, CacheStats, CacheStatus, IncrementalCache};
pub use emit::{write_artifacts, Artifact, ArtifactKind, Emitter};
pub use graph::{FileKind, ImportTarget, ModuleGraph, ModuleNode};
pub use naming::{ArtifactNamer, NameParts, PatternNamer};
pub use pool::WorkerPool;
pub use registry::{Predicate, Registry};
pub use resolve::{PackageResolver, Resolution, Resolver};
pub use transform::{
    Chain, FileMetadata, SideArtifact, SideArtifactKind, StepError, Transform, TransformContext,
    TransformKind, TransformOutput,
};

use crate::context::BuildContext;
use crate::error::BuildError;
use pool::Job;
use rustc_hash::FxHashMap as HashMap;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Counters describing one build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildReport {
    /// Reachable modules over all entries.
    pub modules: usize,
    /// Modules sent to the worker pool (new or changed content).
    pub dispatched: usize,
    /// Dispatched modules whose chain actually ran.
    pub computed: usize,
    #[serde(rename = "durationMs", serialize_with = "duration_ms")]
    pub duration: Duration,
    /// Cache counters after this build.
    pub cache: CacheStats,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn duration_ms<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Result of one build.
///
/// A build with any error carries no artifacts.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    /// Increases by one per build of the same [`Bundler`].
    pub generation: u64,
    pub artifacts: Vec<Artifact>,
    pub errors: Vec<BuildError>,
    pub report: BuildReport,
}

impl BuildOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Errors are reported once even when several graphs share the failing file.
fn push_error(errors: &mut Vec<BuildError>, e: BuildError) {
    if !errors.contains(&e) {
        errors.push(e);
    }
}

/// Builds every configured entry and keeps the graphs for rebuilds.
pub struct Bundler {
    ctx: Arc<BuildContext>,
    graphs: Vec<ModuleGraph>,
    generation: u64,
}

impl std::fmt::Debug for Bundler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bundler")
            .field("entries", &self.graphs.len())
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl Bundler {
    #[must_use]
    pub fn new(ctx: Arc<BuildContext>) -> Self {
        Self {
            ctx,
            graphs: Vec::new(),
            generation: 0,
        }
    }

    #[must_use]
    pub fn context(&self) -> &Arc<BuildContext> {
        &self.ctx
    }

    /// The graph of each entry, once built.
    #[must_use]
    pub fn graphs(&self) -> &[ModuleGraph] {
        &self.graphs
    }

    /// Every file the current graphs depend on, sorted.
    #[must_use]
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.graphs.iter().flat_map(ModuleGraph::paths).collect();
        paths.sort();
        paths.dedup();
        paths
    }

    /// Build from scratch: rescan every entry, then transform and emit.
    ///
    /// Transformed outputs still come from the cache when the content and
    /// chain are unchanged.
    pub fn build(&mut self) -> BuildOutcome {
        let started = Instant::now();
        let resolver = self.ctx.resolver();
        self.graphs = self
            .ctx
            .config()
            .entries
            .iter()
            .map(|entry| ModuleGraph::build(&entry.path, resolver))
            .collect();
        self.finish(started)
    }

    /// Rebuild after `changed` files were modified, created or removed.
    pub fn rebuild(&mut self, changed: &[PathBuf]) -> BuildOutcome {
        if self.graphs.is_empty() {
            return self.build();
        }
        let started = Instant::now();
        let resolver = self.ctx.resolver();
        for graph in &mut self.graphs {
            let summary = graph.refresh(changed, resolver);
            debug!(
                entry = %graph.entry().display(),
                invalidated = summary.invalidated.len(),
                added = summary.added.len(),
                removed = summary.removed.len(),
                "refreshed graph"
            );
        }
        self.finish(started)
    }

    fn finish(&mut self, started: Instant) -> BuildOutcome {
        self.generation += 1;
        let ctx = Arc::clone(&self.ctx);
        let mut errors: Vec<BuildError> = Vec::new();

        for graph in &self.graphs {
            for e in graph.errors() {
                push_error(&mut errors, e);
            }
        }

        // Chain selection first: a configuration problem aborts the build
        // before any transform runs.
        let registry = ctx.registry();
        let mut chains = HashMap::default();
        let mut config_errors = Vec::new();
        for graph in &self.graphs {
            for path in graph.reachable() {
                if chains.contains_key(&path) {
                    continue;
                }
                match registry.resolve_chain(&path) {
                    Ok(m) => {
                        chains.insert(path, m);
                    }
                    Err(e) => config_errors.push(BuildError::from(e)),
                }
            }
        }
        let modules = chains.len() + config_errors.len();
        if !config_errors.is_empty() {
            for e in config_errors {
                push_error(&mut errors, e);
            }
            return self.outcome(started, Vec::new(), errors, modules, 0, 0);
        }

        let mut nodes: Vec<&mut ModuleNode> = self
            .graphs
            .iter_mut()
            .flat_map(ModuleGraph::nodes_mut)
            .filter(|n| n.needs_transform() && chains.contains_key(&n.path))
            .collect();
        nodes.sort_by(|a, b| a.path.cmp(&b.path));
        let jobs: Vec<Job<'_>> = nodes
            .into_iter()
            .filter_map(|node| {
                let m = chains.get(&node.path)?;
                Some(Job {
                    chain: m.chain,
                    chain_id: m.chain_id,
                    node,
                })
            })
            .collect();
        let dispatched = jobs.len();

        let outcomes = ctx
            .pool()
            .dispatch(jobs, ctx.cache(), &ctx.transform_context());
        let mut computed = 0;
        for outcome in outcomes {
            match outcome.result {
                Ok(CacheStatus::Computed) => computed += 1,
                Ok(_) => {}
                Err(e) => push_error(&mut errors, e.into()),
            }
        }

        let mut artifacts = Vec::new();
        if errors.is_empty() {
            match self.emit() {
                Ok(emitted) => artifacts = emitted,
                Err(e) => push_error(&mut errors, e),
            }
        }
        self.outcome(started, artifacts, errors, modules, dispatched, computed)
    }

    fn emit(&self) -> Result<Vec<Artifact>, BuildError> {
        let config = self.ctx.config();
        let emitter = Emitter::new(config, self.ctx.namer());
        let mut artifacts = Vec::new();
        for (graph, entry) in self.graphs.iter().zip(&config.entries) {
            artifacts.extend(emitter.emit(graph, entry)?);
        }
        if let Some(page) = emitter.emit_html(&artifacts)? {
            artifacts.push(page);
        }
        Ok(artifacts)
    }

    fn outcome(
        &self,
        started: Instant,
        artifacts: Vec<Artifact>,
        errors: Vec<BuildError>,
        modules: usize,
        dispatched: usize,
        computed: usize,
    ) -> BuildOutcome {
        let report = BuildReport {
            modules,
            dispatched,
            computed,
            duration: started.elapsed(),
            cache: self.ctx.cache().stats(),
        };
        if errors.is_empty() {
            info!(
                generation = self.generation,
                modules,
                dispatched,
                computed,
                artifacts = artifacts.len(),
                duration_ms = report.duration.as_millis() as u64,
                "build succeeded"
            );
        } else {
            warn!(
                generation = self.generation,
                errors = errors.len(),
                duration_ms = report.duration.as_millis() as u64,
                "build failed"
            );
        }
        BuildOutcome {
            generation: self.generation,
            artifacts,
            errors,
            report,
        }
    }

    /// Hand a successful outcome to the registered artifact listeners.
    pub fn publish(&self, outcome: &BuildOutcome) {
        if outcome.is_success() {
            self.ctx.notify(outcome);
        }
    }

    /// Write a successful outcome's artifacts to the output directory.
    pub fn write(&self, outcome: &BuildOutcome) -> Result<Vec<PathBuf>, BuildError> {
        if !outcome.is_success() {
            return Ok(Vec::new());
        }
        let config = self.ctx.config();
        write_artifacts(&config.out_dir, &outcome.artifacts, config.clean)
    }
}
