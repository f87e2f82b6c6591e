//! Per-run context handed to every stage.
//!
//! The [`PipelineContext`] owns the resources whose lifetime is the run: the
//! configuration, the temporary [`Workspace`], the worker pool, the memory
//! budget, and the metrics registry. Stages receive it by reference instead
//! of reading globals, so two runs in one process never share state.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::executor::ChunkExecutor;
use crate::metrics::{GaugeMetric, MetricsCollector};
use crate::workspace::Workspace;
use sysinfo::System;

/// Assumed total memory when the system cannot be queried.
pub const FALLBACK_TOTAL_MEMORY: u64 = 4 << 30;

/// Smallest bucket the deduplicator will use.
pub const MIN_BUCKET_BYTES: usize = 1 << 20;

/// Total physical memory in bytes, or [`FALLBACK_TOTAL_MEMORY`].
#[must_use]
pub fn total_memory() -> u64 {
    let mut sys = System::new();
    sys.refresh_memory();
    match sys.total_memory() {
        0 => {
            log::warn!(
                "could not determine system memory, assuming {} GiB",
                FALLBACK_TOTAL_MEMORY >> 30
            );
            FALLBACK_TOTAL_MEMORY
        }
        n => n,
    }
}

/// Resources shared by every stage of one run.
pub struct PipelineContext {
    pub config: PipelineConfig,
    pub workspace: Workspace,
    pub executor: ChunkExecutor,
    pub metrics: MetricsCollector,
    memory_budget: u64,
}

impl PipelineContext {
    /// Validate `config`, create the workspace and start the worker pool.
    ///
    /// # Errors
    /// [`PipelineError::Config`] for an invalid configuration, or the error
    /// from creating the workspace or the pool.
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        let total = total_memory();
        Self::with_total_memory(config, total)
    }

    /// Like [`PipelineContext::new`] with an explicit amount of system memory.
    ///
    /// # Errors
    /// See [`PipelineContext::new`].
    pub fn with_total_memory(config: PipelineConfig, total_memory: u64) -> Result<Self, PipelineError> {
        config.check()?;
        let memory_budget = (total_memory as f64 * config.memory_fraction) as u64;
        let workspace = Workspace::create(config.tmpdir.as_deref())?;
        let executor = ChunkExecutor::new(config.threads)?.with_scratch_root(workspace.path());
        let metrics = MetricsCollector::new();
        metrics.register(Box::new(
            GaugeMetric::new("memory_budget_bytes", memory_budget as f64)
                .with_description("memory available to sort buckets and collaborators"),
        ));
        metrics.register(Box::new(GaugeMetric::new("threads", executor.threads() as f64)));
        log::info!(
            "{} worker threads, memory budget {} MiB, workspace {}",
            executor.threads(),
            memory_budget >> 20,
            workspace.path().display()
        );
        Ok(Self {
            config,
            workspace,
            executor,
            metrics,
            memory_budget,
        })
    }

    /// Bytes the run may hold in memory at once.
    #[must_use]
    pub fn memory_budget(&self) -> u64 {
        self.memory_budget
    }

    /// Remove the workspace now. A failed removal is only logged.
    pub fn close(self) {
        let path = self.workspace.path().to_path_buf();
        if let Err(e) = self.workspace.close() {
            log::warn!("could not remove workspace {}: {e}", path.display());
        }
    }

    /// Per-bucket budget for the deduplicator: the memory budget split across workers.
    #[must_use]
    pub fn bucket_bytes(&self) -> usize {
        let per_worker = self.memory_budget / self.executor.threads().max(1) as u64;
        usize::try_from(per_worker).unwrap_or(usize::MAX).max(MIN_BUCKET_BYTES)
    }
}
