//! Transform worker pool.
//!
//! Chains run on a dedicated rayon pool bounded by the configured
//! parallelism. Scheduling is per node: each job reads one node's content,
//! consults the cache, and writes only that node's output slot.

use super::cache::{CacheEntry, CacheKey, CacheStatus, IncrementalCache};
use super::graph::ModuleNode;
use super::transform::{Chain, FileMetadata, TransformContext, TransformOutput};
use crate::config::MAX_PARALLELISM;
use crate::error::{ConfigurationError, TransformError};
use rayon::prelude::*;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use tracing::{debug, trace};

/// Run every step of `chain` over `input`, in order.
///
/// Each step's output feeds the next; side artifacts accumulate. A failing
/// (or panicking) step stops the chain with its index and name.
pub fn run_chain(
    chain: &Chain,
    input: &[u8],
    meta: &FileMetadata,
    ctx: &TransformContext,
) -> Result<TransformOutput, TransformError> {
    let mut output = TransformOutput::bytes(input);
    for (index, step) in chain.steps().iter().enumerate() {
        let fail = |message: String| TransformError {
            path: meta.path.clone(),
            step_index: index,
            step: step.name().to_string(),
            message,
        };
        let result = catch_unwind(AssertUnwindSafe(|| {
            step.transform(&output.bytes, meta, ctx)
        }))
        .map_err(|panic| {
            let message = panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "step panicked".to_string());
            fail(message)
        })?;
        let step_output = result.map_err(|e| fail(e.message))?;
        output.bytes = step_output.bytes;
        output.side_artifacts.extend(step_output.side_artifacts);
        if step_output.url.is_some() {
            output.url = step_output.url;
        }
    }
    Ok(output)
}

/// One node to transform.
pub struct Job<'a> {
    pub node: &'a mut ModuleNode,
    pub chain: &'a Chain,
    pub chain_id: &'a str,
}

/// Result of one job.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub path: PathBuf,
    pub result: Result<CacheStatus, TransformError>,
}

/// Bounded pool running transform chains.
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    parallelism: usize,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("parallelism", &self.parallelism)
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// A pool of `parallelism` workers (clamped to `1..=64`).
    pub fn new(parallelism: usize) -> Result<Self, ConfigurationError> {
        let parallelism = parallelism.clamp(1, MAX_PARALLELISM);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(parallelism)
            .thread_name(|i| format!("weave-worker-{i}"))
            .build()
            .map_err(|e| ConfigurationError::invalid(format!("cannot start worker pool: {e}")))?;
        Ok(Self { pool, parallelism })
    }

    #[must_use]
    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Transform one node through `chain`, consulting `cache` first.
    pub fn run(
        &self,
        node: &ModuleNode,
        chain: &Chain,
        chain_id: &str,
        cache: &IncrementalCache,
        ctx: &TransformContext,
    ) -> (Result<std::sync::Arc<CacheEntry>, TransformError>, CacheStatus) {
        let key = CacheKey::new(node.fingerprint.clone(), chain_id);
        let meta = FileMetadata::for_path(&node.path);
        let (result, status) = cache.get_or_compute(&key, || {
            let output = run_chain(chain, &node.content, &meta, ctx)?;
            Ok(CacheEntry::new(output.bytes, output.side_artifacts).with_url(output.url))
        });
        // A shared result may come from another file with the same content.
        let result = result.map_err(|mut e| {
            e.path.clone_from(&node.path);
            e
        });
        (result, status)
    }

    /// Transform every job concurrently. Outcomes come back in job order.
    ///
    /// A failed node keeps no output and does not stop the others.
    pub fn dispatch(
        &self,
        jobs: Vec<Job<'_>>,
        cache: &IncrementalCache,
        ctx: &TransformContext,
    ) -> Vec<JobOutcome> {
        let count = jobs.len();
        let outcomes: Vec<JobOutcome> = self.pool.install(|| {
            jobs.into_par_iter()
                .map(|job| {
                    let (result, status) = self.run(job.node, job.chain, job.chain_id, cache, ctx);
                    let result = result.map(|entry| {
                        job.node.set_output(entry);
                        status
                    });
                    trace!(
                        path = %job.node.path.display(),
                        chain = %job.chain.describe(),
                        ?status,
                        ok = result.is_ok(),
                        "transformed module"
                    );
                    JobOutcome {
                        path: job.node.path.clone(),
                        result,
                    }
                })
                .collect()
        });
        debug!(
            jobs = count,
            failed = outcomes.iter().filter(|o| o.result.is_err()).count(),
            parallelism = self.parallelism,
            "dispatched transforms"
        );
        outcomes
    }
}
