//! # ampbeam
//!
//! A **single-node batch engine** for screening large sequence collections
//! for antimicrobial peptide (AMP) candidates. ampbeam runs the data-heavy
//! part of the screen (chunking, bounded-parallel execution, exact
//! deduplication larger than memory, validation, aggregation and joins) and
//! delegates the biology to pluggable collaborators.
//!
//! ## Key Features
//!
//! - **Lazy chunking** - inputs of any size are split into byte-bounded chunks
//!   on the fly; only O(threads) chunks are resident at once
//! - **Bounded parallelism** - a dedicated rayon pool per run, results streamed
//!   back over a bounded channel
//! - **Partial-failure tolerance** - a failing, panicking or malformed chunk is
//!   dropped with a warning; the stage fails only when nothing survives
//! - **External sort-merge dedup** - memory-bounded bucket sorts, postcard run
//!   files and a k-way heap merge
//! - **Key-based joins only** - enrichment columns are joined on `Access` or
//!   refused, never merged by position
//! - **Transparent compression** - gzip by default, zstd/bzip2/xz behind features
//!
//! ## Quick Start
//!
//! ```no_run
//! use ampbeam::*;
//!
//! # fn main() -> Result<(), PipelineError> {
//! let mut config = PipelineConfig::new(RunMode::Peptides, vec!["peptides.faa".into()], "out");
//! config.threads = 8;
//! config.extra_enrichment = true;
//!
//! let collaborators = Collaborators::new()
//!     .with_classifier(CommandTransform::new("classifier", "amp-classify"))
//!     .with_enricher(CommandTransform::new("solubility", "predict-solubility"));
//!
//! let summary = run(config, &collaborators)?;
//! println!("{:?}", summary.outcome);
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Concepts
//!
//! ### Plan
//!
//! A [`Plan`] is the fixed, forward-only list of [`Stage`]s for a [`RunMode`]:
//!
//! ```text
//! Ingest -> [Preprocess] -> [Assemble] -> CallCandidates -> [Dedup]
//!        -> ComputeFeatures -> Validate -> Classify -> Aggregate -> [Enrich] -> Report
//! ```
//!
//! Abundance runs use `Ingest -> Preprocess -> Quantify -> Report`.
//!
//! ### Chunks and transforms
//!
//! The [`ChunkPartitioner`] turns a record stream into [`Chunk`]s. Every
//! per-chunk collaborator implements [`ChunkTransform`] and returns a
//! [`StageResult`] table; the [`ChunkExecutor`] runs it over all chunks and
//! gates each result through a [`ChunkValidator`].
//!
//! ### Collaborators
//!
//! - [`FnTransform`] / [`FnStage`] - in-process closures
//! - [`CommandTransform`] / [`CommandStage`] - external programs
//! - [`PeptidePassthrough`] - candidate calling for peptide inputs
//! - [`BasicDescriptors`] - composition descriptors
//!
//! ### Outcomes
//!
//! A run ends in [`RunOutcome::Completed`], [`RunOutcome::EmptySuccess`] (nothing
//! qualified; exit code 0), or a [`PipelineError`] naming the failed stage.
//! Non-fatal problems are [`ChunkWarning`]s collected in the [`PipelineState`].
//!
//! ## Modules
//!
//! - [`partition`] - byte-bounded chunking of record streams
//! - [`executor`] - the parallel chunk executor
//! - [`dedup`] - external sort-merge grouping and resequencing
//! - [`validation`] - chunk schemas, validation errors, error collection
//! - [`aggregate`] - aggregation, summaries, filters and key joins
//! - [`controller`] - the pipeline state machine
//! - [`io`] - FASTA/FASTQ and TSV formats, compression
//! - [`config`], [`context`], [`metrics`], [`report`], [`workspace`] - run plumbing

pub mod aggregate;
pub mod config;
pub mod context;
pub mod controller;
pub mod dedup;
pub mod error;
pub mod executor;
pub mod io;
pub mod metrics;
pub mod partition;
pub mod plan;
pub mod record;
pub mod report;
pub mod stages;
pub mod validation;
pub mod workspace;

pub use aggregate::{Aggregator, EnrichmentTable, Summary, Table, join_enrichment, summarize};
pub use config::PipelineConfig;
pub use context::PipelineContext;
pub use controller::{Collaborators, PipelineState, RunOutcome, RunSummary, exit_code, run, run_in_context};
pub use dedup::{ClusterRecord, ExternalGrouper, Group, Resequencer, group_records};
pub use error::{ChunkWarning, PipelineError, PipelineResult, Severity};
pub use executor::{ChunkExecutor, ChunkInput, ChunkTransform, ExecutionReport, FnTransform, StageResult};
pub use metrics::MetricsCollector;
pub use partition::{ByteSize, Chunk, ChunkPartitioner, partition_all};
pub use plan::{Plan, PlanOptions, RunMode, Stage};
pub use record::SequenceRecord;
pub use stages::descriptors::BasicDescriptors;
pub use stages::{BulkEnv, BulkStage, CommandStage, CommandTransform, FnStage, PeptidePassthrough};
pub use validation::{ChunkSchema, ChunkValidator, ColumnRule, ErrorCollector, RowExpectation, ValidationError};
pub use workspace::{Artifact, Workspace};
