//! Pipeline Controller: walks a [`Plan`] stage by stage.
//!
//! The controller is the only component with a view of the whole run. It
//! owns the [`PipelineState`], wires the partitioner, executor, validator,
//! deduplicator and aggregator together, and decides how a run ends:
//!
//! - [`RunOutcome::Completed`] when the Report stage wrote its outputs;
//! - [`RunOutcome::EmptySuccess`] when there was nothing to report (no
//!   candidate within the length limits, or no row above the probability
//!   threshold). Only the run log is written;
//! - an `Err(PipelineError)` for fatal failures. The run log gets a
//!   `[FATAL]` line naming the stage and the workspace is removed.
//!
//! Every stage boundary is a hard barrier: a stage's outputs are complete
//! (and its intermediate files released) before the next stage starts.
//!
//! # Collaborators
//!
//! The algorithms themselves plug in through [`Collaborators`]:
//!
//! ```no_run
//! use ampbeam::config::PipelineConfig;
//! use ampbeam::controller::{run, Collaborators, RunOutcome};
//! use ampbeam::plan::RunMode;
//! use ampbeam::stages::CommandTransform;
//!
//! let config = PipelineConfig::new(RunMode::Peptides, vec!["peptides.faa".into()], "out");
//! let collaborators = Collaborators::new()
//!     .with_classifier(CommandTransform::new("classifier", "amp-classify"));
//! match run(config, &collaborators)?.outcome {
//!     RunOutcome::Completed { rows, .. } => println!("{rows} AMP candidates"),
//!     RunOutcome::EmptySuccess { reason } => println!("nothing found: {reason}"),
//! }
//! # Ok::<(), ampbeam::error::PipelineError>(())
//! ```

use crate::aggregate::{
    self, ACCESS, AMP_FAMILY, AMP_PROBABILITY, Aggregator, ENRICHMENT_COLUMNS, EnrichmentTable, HEMOLYTIC,
    PREDICTION_COLUMNS, SEQUENCE, Table, join_enrichment,
};
use crate::config::PipelineConfig;
use crate::context::PipelineContext;
use crate::dedup::{self, CLUSTER_COLUMNS, Resequencer};
use crate::error::{ChunkWarning, PipelineError};
use crate::executor::{ChunkInput, ChunkTransform, ExecutionReport, FnTransform, StageResult};
use crate::io::fasta::{RecordStream, open_records, write_fasta, write_record};
use crate::io::table::{TableWriter, read_table, write_table};
use crate::partition::{Chunk, ChunkPartitioner};
use crate::plan::{Plan, RunMode, Stage};
use crate::record::{SequenceRecord, normalize_sequence};
use crate::report::{self, RunLog, version_comment};
use crate::stages::descriptors::BasicDescriptors;
use crate::stages::{BulkEnv, BulkStage, PeptidePassthrough};
use crate::validation::{ChunkSchema, ChunkValidator, ErrorCollector, RowExpectation};
use crate::workspace::Artifact;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

/// The opaque stage implementations a run calls into.
///
/// Only the collaborators the plan needs must be present; see
/// [`Collaborators::check`]. Descriptors default to [`BasicDescriptors`] and
/// peptide-mode candidate calling to [`PeptidePassthrough`].
pub struct Collaborators {
    preprocess: Option<Box<dyn BulkStage>>,
    assembler: Option<Box<dyn BulkStage>>,
    candidate_caller: Option<Box<dyn ChunkTransform<Chunk>>>,
    descriptors: Box<dyn ChunkTransform<Chunk>>,
    classifier: Option<Box<dyn ChunkTransform<StageResult>>>,
    enrichers: Vec<Box<dyn ChunkTransform<Chunk>>>,
    quantifier: Option<Box<dyn BulkStage>>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            preprocess: None,
            assembler: None,
            candidate_caller: None,
            descriptors: Box::new(BasicDescriptors),
            classifier: None,
            enrichers: Vec::new(),
            quantifier: None,
        }
    }
}

impl Collaborators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read cleaning ahead of assembly or mapping. Without one, inputs pass through.
    #[must_use]
    pub fn with_preprocess(mut self, stage: impl BulkStage + 'static) -> Self {
        self.preprocess = Some(Box::new(stage));
        self
    }

    #[must_use]
    pub fn with_assembler(mut self, stage: impl BulkStage + 'static) -> Self {
        self.assembler = Some(Box::new(stage));
        self
    }

    /// ORF caller over contig chunks; must print `Access` and `Sequence` columns.
    #[must_use]
    pub fn with_candidate_caller(mut self, transform: impl ChunkTransform<Chunk> + 'static) -> Self {
        self.candidate_caller = Some(Box::new(transform));
        self
    }

    #[must_use]
    pub fn with_descriptors(mut self, transform: impl ChunkTransform<Chunk> + 'static) -> Self {
        self.descriptors = Box::new(transform);
        self
    }

    /// Classifier over descriptor tables; must return the prediction columns.
    #[must_use]
    pub fn with_classifier(mut self, transform: impl ChunkTransform<StageResult> + 'static) -> Self {
        self.classifier = Some(Box::new(transform));
        self
    }

    /// Add an enrichment predictor. Each one is joined on `Access` separately.
    #[must_use]
    pub fn with_enricher(mut self, transform: impl ChunkTransform<Chunk> + 'static) -> Self {
        self.enrichers.push(Box::new(transform));
        self
    }

    /// Read mapper and quantifier for abundance runs.
    #[must_use]
    pub fn with_quantifier(mut self, stage: impl BulkStage + 'static) -> Self {
        self.quantifier = Some(Box::new(stage));
        self
    }

    /// Verify that every collaborator `plan` calls is configured.
    ///
    /// # Errors
    /// [`PipelineError::Config`] naming the missing collaborators.
    pub fn check(&self, plan: &Plan) -> Result<(), PipelineError> {
        let mut missing = Vec::new();
        if plan.contains(Stage::Assemble) && self.assembler.is_none() {
            missing.push("assembler");
        }
        if plan.contains(Stage::CallCandidates) && plan.mode() != RunMode::Peptides && self.candidate_caller.is_none()
        {
            missing.push("candidate caller");
        }
        if plan.contains(Stage::Classify) && self.classifier.is_none() {
            missing.push("classifier");
        }
        if plan.contains(Stage::Enrich) && self.enrichers.is_empty() {
            missing.push("enricher");
        }
        if plan.contains(Stage::Quantify) && self.quantifier.is_none() {
            missing.push("quantifier");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Config(format!(
                "{} mode needs: {}",
                plan.mode(),
                missing.join(", ")
            )))
        }
    }
}

/// Where a run is, and what it has seen so far.
#[derive(Clone, Debug, Default)]
pub struct PipelineState {
    current: Option<Stage>,
    visited: Vec<Stage>,
    /// Rows (or files, for whole-file stages) produced per stage.
    pub counts: BTreeMap<Stage, u64>,
    pub warnings: Vec<ChunkWarning>,
    /// Message of the error that ended the run, if any.
    pub fatal: Option<String>,
}

impl PipelineState {
    #[must_use]
    pub fn current(&self) -> Option<Stage> {
        self.current
    }

    /// Stages entered so far, in order.
    #[must_use]
    pub fn visited(&self) -> &[Stage] {
        &self.visited
    }

    #[must_use]
    pub fn count(&self, stage: Stage) -> Option<u64> {
        self.counts.get(&stage).copied()
    }

    /// Move to `next`. Stages may be skipped but never revisited.
    ///
    /// # Errors
    /// [`PipelineError::FatalStage`] if `next` is not in `plan` or does not
    /// come after the current stage.
    pub fn advance(&mut self, plan: &Plan, next: Stage) -> Result<(), PipelineError> {
        let to = plan.position(next).ok_or_else(|| PipelineError::FatalStage {
            stage: next,
            message: format!("{next} is not part of the {} plan", plan.mode()),
        })?;
        if let Some(current) = self.current
            && plan.position(current).is_some_and(|from| to <= from)
        {
            return Err(PipelineError::FatalStage {
                stage: next,
                message: format!("backward transition {current} -> {next}"),
            });
        }
        self.current = Some(next);
        self.visited.push(next);
        Ok(())
    }
}

/// How a successful run ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { outputs: Vec<PathBuf>, rows: usize },
    EmptySuccess { reason: String },
}

/// Result of a run that did not fail.
#[derive(Debug)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub state: PipelineState,
    pub log_path: PathBuf,
}

/// Process exit code for a finished run: 0 for both kinds of success.
#[must_use]
pub fn exit_code(result: &Result<RunSummary, PipelineError>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.exit_code(),
    }
}

/// Run the pipeline described by `config`.
///
/// # Errors
/// [`PipelineError::Config`] before anything starts, otherwise the fatal
/// error of the stage that failed. The workspace is removed either way.
pub fn run(config: PipelineConfig, collaborators: &Collaborators) -> Result<RunSummary, PipelineError> {
    collaborators.check(&config.plan())?;
    let ctx = PipelineContext::new(config)?;
    run_in_context(ctx, collaborators)
}

/// Like [`run`] with a context built by the caller (e.g. a fixed memory budget).
///
/// # Errors
/// See [`run`].
pub fn run_in_context(ctx: PipelineContext, collaborators: &Collaborators) -> Result<RunSummary, PipelineError> {
    let plan = ctx.config.plan();
    collaborators.check(&plan)?;
    let log_path = ctx.config.log_path();
    log::info!("starting run: {plan}");

    ctx.metrics.record_start();
    let mut run = Run {
        ctx: &ctx,
        plan: &plan,
        collab: collaborators,
        state: PipelineState::default(),
        log: RunLog::new(),
        rejected: ErrorCollector::new(),
    };
    let result = run.drive();
    ctx.metrics.record_end();
    let Run { mut state, mut log, .. } = run;
    log.stage_table(&ctx.metrics);

    match result {
        Ok(outcome) => {
            match &outcome {
                RunOutcome::Completed { outputs, rows } => {
                    log.info(format!("completed: {rows} rows in {} output files", outputs.len()));
                }
                RunOutcome::EmptySuccess { reason } => log.info(format!("finished without results: {reason}")),
            }
            let written = log.write_to(&log_path);
            ctx.close();
            written.map_err(fatal_in(Stage::Report))?;
            log::info!("run finished, log at {}", log_path.display());
            Ok(RunSummary {
                outcome,
                state,
                log_path,
            })
        }
        Err(e) => {
            log::error!("{e}");
            state.fatal = Some(e.to_string());
            log.fatal(e.to_string());
            if let Err(le) = log.write_to(&log_path) {
                log::warn!("could not write run log: {le:#}");
            }
            ctx.close();
            Err(e)
        }
    }
}

fn fatal_in<E: Display>(stage: Stage) -> impl Fn(E) -> PipelineError {
    move |e| PipelineError::FatalStage {
        stage,
        message: format!("{e:#}"),
    }
}

/// Lazily chains several record files, opening each only when reached.
fn chain_records(paths: Vec<PathBuf>) -> RecordStream {
    Box::new(paths.into_iter().flat_map(|path| -> RecordStream {
        match open_records(&path) {
            Ok(records) => records,
            Err(e) => Box::new(std::iter::once(Err(io::Error::other(format!("{e:#}"))))),
        }
    }))
}

fn source_label(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn write_records(stage: Stage, artifact: &Artifact, records: &[SequenceRecord]) -> Result<(), PipelineError> {
    let path = artifact.path();
    let file = File::create(path).map_err(|e| PipelineError::io(stage, format!("create {}", path.display()), e))?;
    write_fasta(BufWriter::new(file), records)
        .map_err(|e| PipelineError::io(stage, format!("write {}", path.display()), e))?;
    Ok(())
}

/// Peptide FASTA files in the workspace, in chunk order.
struct PeptideFiles {
    files: Vec<Artifact>,
    count: u64,
}

impl PeptideFiles {
    fn paths(&self) -> Vec<PathBuf> {
        self.files.iter().map(|a| a.path().to_path_buf()).collect()
    }
}

/// A descriptor table spilled to the workspace.
struct Spilled {
    index: usize,
    expected: usize,
    artifact: Artifact,
}

/// Borrowed view of a [`Spilled`] chunk, scheduled by the Validate stage.
struct SpilledRef {
    index: usize,
    expected: usize,
    path: PathBuf,
}

impl ChunkInput for SpilledRef {
    fn chunk_index(&self) -> usize {
        self.index
    }

    fn expected_rows(&self) -> usize {
        self.expected
    }
}

struct Run<'a> {
    ctx: &'a PipelineContext,
    plan: &'a Plan,
    collab: &'a Collaborators,
    state: PipelineState,
    log: RunLog,
    rejected: ErrorCollector,
}

impl Run<'_> {
    fn enter(&mut self, stage: Stage) -> Result<Instant, PipelineError> {
        self.state.advance(self.plan, stage)?;
        log::debug!("entering {stage}");
        Ok(Instant::now())
    }

    fn info(&mut self, message: String) {
        log::info!("{message}");
        self.log.info(message);
    }

    fn warn(&mut self, warning: ChunkWarning) {
        log::warn!("{warning}");
        self.log.warning(&warning);
        self.state.warnings.push(warning);
    }

    /// Fold a chunked stage's report into the state, log and metrics.
    fn absorb(&mut self, stage: Stage, started: Instant, report: &ExecutionReport, validator: Option<&ChunkValidator>) {
        for w in &report.warnings {
            self.log.warning(w);
        }
        self.state.warnings.extend(report.warnings.iter().cloned());
        self.state.counts.insert(stage, report.rows as u64);
        if let Some(v) = validator {
            self.rejected.extend(v.take_errors());
        }
        self.ctx
            .metrics
            .record_stage(stage, started.elapsed(), report.submitted, report.accepted, report.rows);
        self.log.info(format!(
            "{stage}: {}/{} chunks accepted, {} rows",
            report.accepted, report.submitted, report.rows
        ));
    }

    fn drive(&mut self) -> Result<RunOutcome, PipelineError> {
        let collab = self.collab;
        let ctx = self.ctx;
        let cfg = &ctx.config;
        self.info(format!("plan: {}", self.plan));

        let mut inputs = self.ingest()?;
        if self.plan.contains(Stage::Preprocess) {
            inputs = match collab.preprocess.as_deref() {
                Some(stage) => self.run_bulk(Stage::Preprocess, stage, &inputs)?,
                None => {
                    self.pass_through(Stage::Preprocess)?;
                    inputs
                }
            };
        }

        if self.plan.mode() == RunMode::Abundance {
            let table = self.quantify(&inputs)?;
            return self.report_abundance(table);
        }

        if self.plan.contains(Stage::Assemble) {
            let assembler = collab
                .assembler
                .as_deref()
                .ok_or_else(|| PipelineError::Config("no assembler configured".into()))?;
            inputs = self.run_bulk(Stage::Assemble, assembler, &inputs)?;
        }

        let candidates = self.call_candidates(&inputs)?;
        if candidates.count == 0 {
            let started = self.enter(Stage::Report)?;
            return self.report_empty(
                started,
                format!(
                    "no candidate peptide of length {}..={}",
                    cfg.min_peptide_length, cfg.max_peptide_length
                ),
            );
        }

        let (peptides, clusters) = if self.plan.contains(Stage::Dedup) {
            let (representatives, clusters) = self.dedup(candidates)?;
            (representatives, Some(clusters))
        } else {
            (candidates, None)
        };

        let features = self.compute_features(&peptides)?;
        drop(peptides);
        let features = self.validate(features)?;
        let aggregator = self.classify(features)?;
        let mut table = self.aggregate(aggregator)?;
        if self.plan.contains(Stage::Enrich) && !table.is_empty() {
            table = self.enrich(table)?;
        }
        self.report(table, clusters)
    }

    fn ingest(&mut self) -> Result<Vec<PathBuf>, PipelineError> {
        let started = self.enter(Stage::Ingest)?;
        let ctx = self.ctx;
        let cfg = &ctx.config;
        let mut checked: Vec<&Path> = cfg.inputs.iter().map(PathBuf::as_path).collect();
        if self.plan.contains(Stage::Quantify)
            && let Some(reference) = cfg.reference.as_deref()
        {
            checked.push(reference);
        }
        for path in checked {
            let meta = fs::metadata(path).map_err(|e| PipelineError::FatalInput {
                stage: Stage::Ingest,
                message: format!("{}: {e}", path.display()),
            })?;
            if !meta.is_file() {
                return Err(PipelineError::FatalInput {
                    stage: Stage::Ingest,
                    message: format!("{} is not a regular file", path.display()),
                });
            }
            if meta.len() == 0 {
                return Err(PipelineError::EmptyInput {
                    stage: Stage::Ingest,
                    source_name: path.display().to_string(),
                });
            }
        }
        let inputs = cfg.inputs.clone();
        self.state.counts.insert(Stage::Ingest, inputs.len() as u64);
        ctx.metrics.increment_counter("input_files", inputs.len() as u64);
        ctx.metrics
            .record_stage(Stage::Ingest, started.elapsed(), 0, 0, inputs.len());
        self.info(format!(
            "ingest: {} input file(s) in {} mode: {}",
            inputs.len(),
            cfg.mode,
            source_label(&inputs)
        ));
        Ok(inputs)
    }

    fn pass_through(&mut self, stage: Stage) -> Result<(), PipelineError> {
        let started = self.enter(stage)?;
        self.ctx.metrics.record_stage(stage, started.elapsed(), 0, 0, 0);
        self.info(format!("{stage}: no collaborator configured, inputs used as-is"));
        Ok(())
    }

    fn run_bulk(&mut self, stage: Stage, collaborator: &dyn BulkStage, inputs: &[PathBuf]) -> Result<Vec<PathBuf>, PipelineError> {
        let started = self.enter(stage)?;
        let ctx = self.ctx;
        let env = BulkEnv {
            out_dir: ctx.workspace.stage_dir(stage)?,
            threads: ctx.executor.threads(),
            memory_budget: ctx.memory_budget(),
            reference: ctx.config.reference.as_deref(),
        };
        let name = collaborator.name();
        let outputs = collaborator
            .run(&env, inputs)
            .map_err(|e| PipelineError::FatalStage {
                stage,
                message: format!("{name}: {e:#}"),
            })?;
        if outputs.is_empty() {
            return Err(PipelineError::FatalStage {
                stage,
                message: format!("{name} produced no output"),
            });
        }
        for path in &outputs {
            let len = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            if len == 0 {
                return Err(PipelineError::FatalStage {
                    stage,
                    message: format!("{name} produced a missing or empty {}", path.display()),
                });
            }
        }
        self.state.counts.insert(stage, outputs.len() as u64);
        ctx.metrics.record_stage(stage, started.elapsed(), 1, 1, outputs.len());
        self.info(format!("{stage}: {name} produced {}", source_label(&outputs)));
        Ok(outputs)
    }

    fn call_candidates(&mut self, sources: &[PathBuf]) -> Result<PeptideFiles, PipelineError> {
        let started = self.enter(Stage::CallCandidates)?;
        let ctx = self.ctx;
        let cfg = &ctx.config;
        let collab = self.collab;
        let passthrough = PeptidePassthrough;
        let caller: &dyn ChunkTransform<Chunk> = match collab.candidate_caller.as_deref() {
            Some(caller) => caller,
            None => &passthrough,
        };
        let chunks = ChunkPartitioner::new(chain_records(sources.to_vec()), cfg.chunk_size)
            .for_stage(Stage::CallCandidates, source_label(sources));
        let validator = ChunkValidator::new(
            ChunkSchema::named(Stage::CallCandidates, [ACCESS, SEQUENCE], RowExpectation::Any).with_identifier(ACCESS),
        );
        let lengths = cfg.min_peptide_length..=cfg.max_peptide_length;

        let mut files = BTreeMap::new();
        let mut kept = 0u64;
        let mut removed = 0u64;
        let report = ctx
            .executor
            .execute(Stage::CallCandidates, chunks, caller, Some(&validator), |result| {
                let index = result.chunk_index;
                let mut records = Vec::with_capacity(result.rows.len());
                for mut row in result.rows {
                    let sequence = normalize_sequence(&row[1]);
                    if lengths.contains(&sequence.chars().count()) {
                        records.push(SequenceRecord::new(std::mem::take(&mut row[0]), sequence));
                    } else {
                        removed += 1;
                    }
                }
                if records.is_empty() {
                    return Ok(());
                }
                let artifact = ctx.workspace.artifact(Stage::CallCandidates, ".faa")?;
                write_records(Stage::CallCandidates, &artifact, &records)?;
                kept += records.len() as u64;
                files.insert(index, artifact);
                Ok(())
            })?;

        self.absorb(Stage::CallCandidates, started, &report, Some(&validator));
        self.state.counts.insert(Stage::CallCandidates, kept);
        ctx.metrics.increment_counter("candidates_called", kept + removed);
        ctx.metrics.increment_counter("candidates_outside_length_range", removed);
        self.info(format!(
            "call_candidates: {kept} candidates kept, {removed} outside length {}..={}",
            cfg.min_peptide_length, cfg.max_peptide_length
        ));
        Ok(PeptideFiles {
            files: files.into_values().collect(),
            count: kept,
        })
    }

    fn dedup(&mut self, candidates: PeptideFiles) -> Result<(PeptideFiles, Artifact), PipelineError> {
        let started = self.enter(Stage::Dedup)?;
        let ctx = self.ctx;
        let clusters = ctx.workspace.artifact(Stage::Dedup, ".tsv.gz")?;
        let representatives = ctx.workspace.artifact(Stage::Dedup, ".faa")?;

        let mut table = TableWriter::create(clusters.path(), Some(&version_comment("Clusters")), &CLUSTER_COLUMNS)
            .map_err(fatal_in(Stage::Dedup))?;
        let file = File::create(representatives.path())
            .map_err(|e| PipelineError::io(Stage::Dedup, "create representatives file", e))?;
        let mut fasta = BufWriter::new(file);
        let mut resequencer = Resequencer::new();

        let stats = dedup::group_records(
            &ctx.workspace,
            ctx.executor.pool(),
            ctx.bucket_bytes(),
            chain_records(candidates.paths()),
            |group| {
                let cluster = resequencer.assign(group);
                write_record(&mut fasta, &cluster.to_record())
                    .map_err(|e| PipelineError::io(Stage::Dedup, "write representatives", e))?;
                table.write_row(cluster.to_row()).map_err(fatal_in(Stage::Dedup))
            },
        )?;
        table.finish().map_err(fatal_in(Stage::Dedup))?;
        fasta
            .flush()
            .map_err(|e| PipelineError::io(Stage::Dedup, "flush representatives", e))?;
        drop(fasta);
        drop(candidates);

        self.state.counts.insert(Stage::Dedup, stats.groups);
        ctx.metrics.increment_counter("clusters", stats.groups);
        ctx.metrics
            .record_stage(Stage::Dedup, started.elapsed(), stats.runs, stats.runs, stats.groups as usize);
        self.info(format!(
            "dedup: {} candidates grouped into {} unique sequences ({} sorted runs, {} blank)",
            stats.pairs, stats.groups, stats.runs, stats.blank_keys
        ));
        Ok((
            PeptideFiles {
                files: vec![representatives],
                count: stats.groups,
            },
            clusters,
        ))
    }

    fn compute_features(&mut self, peptides: &PeptideFiles) -> Result<BTreeMap<usize, Spilled>, PipelineError> {
        let started = self.enter(Stage::ComputeFeatures)?;
        let ctx = self.ctx;
        let collab = self.collab;
        let expected: Mutex<BTreeMap<usize, usize>> = Mutex::new(BTreeMap::new());
        let chunks = ChunkPartitioner::new(chain_records(peptides.paths()), ctx.config.chunk_size)
            .for_stage(Stage::ComputeFeatures, "candidate peptides")
            .inspect(|chunk| {
                if let Ok(chunk) = chunk
                    && let Ok(mut rows) = expected.lock()
                {
                    rows.insert(chunk.index, chunk.len());
                }
            });

        let mut spilled = BTreeMap::new();
        let report = ctx.executor.execute(
            Stage::ComputeFeatures,
            chunks,
            collab.descriptors.as_ref(),
            None,
            |result| {
                let artifact = ctx.workspace.artifact(Stage::ComputeFeatures, ".tsv")?;
                write_table(artifact.path(), None, &result.columns, &result.rows)
                    .map_err(fatal_in(Stage::ComputeFeatures))?;
                spilled.insert(result.chunk_index, artifact);
                Ok(())
            },
        )?;
        self.absorb(Stage::ComputeFeatures, started, &report, None);
        log::debug!("{} of {} peptides have features", report.rows, peptides.count);

        let expected = expected.into_inner().unwrap_or_else(PoisonError::into_inner);
        Ok(spilled
            .into_iter()
            .map(|(index, artifact)| {
                let rows = expected.get(&index).copied().unwrap_or_default();
                (
                    index,
                    Spilled {
                        index,
                        expected: rows,
                        artifact,
                    },
                )
            })
            .collect())
    }

    fn validate(&mut self, features: BTreeMap<usize, Spilled>) -> Result<BTreeMap<usize, Spilled>, PipelineError> {
        let started = self.enter(Stage::Validate)?;
        let ctx = self.ctx;
        let inputs: Vec<Result<SpilledRef, PipelineError>> = features
            .values()
            .map(|s| {
                Ok(SpilledRef {
                    index: s.index,
                    expected: s.expected,
                    path: s.artifact.path().to_path_buf(),
                })
            })
            .collect();
        let load = FnTransform::new("load-features", |s: &SpilledRef| -> anyhow::Result<StageResult> {
            let (columns, rows) = read_table(&s.path, true)?;
            Ok(StageResult::new(s.index, columns, rows))
        });
        let validator = ChunkValidator::new(ChunkSchema::own_header(
            Stage::Validate,
            [ACCESS, SEQUENCE],
            RowExpectation::Exact { offset: 0 },
        ));

        let mut accepted = BTreeSet::new();
        let report = ctx
            .executor
            .execute(Stage::Validate, inputs.into_iter(), &load, Some(&validator), |result| {
                accepted.insert(result.chunk_index);
                Ok(())
            })?;
        self.absorb(Stage::Validate, started, &report, Some(&validator));
        // Rejected chunks' files are deleted here.
        Ok(features
            .into_iter()
            .filter(|(index, _)| accepted.contains(index))
            .collect())
    }

    fn classify(&mut self, features: BTreeMap<usize, Spilled>) -> Result<Aggregator, PipelineError> {
        let started = self.enter(Stage::Classify)?;
        let ctx = self.ctx;
        let collab = self.collab;
        let classifier = collab
            .classifier
            .as_deref()
            .ok_or_else(|| PipelineError::Config("no classifier configured".into()))?;
        let inputs = features
            .into_values()
            .map(|spilled| -> Result<StageResult, PipelineError> {
                let (columns, rows) =
                    read_table(spilled.artifact.path(), true).map_err(|e| PipelineError::FatalStage {
                        stage: Stage::Classify,
                        message: format!("reload features of chunk {}: {e:#}", spilled.index),
                    })?;
                Ok(StageResult::new(spilled.index, columns, rows))
            });
        let validator = ChunkValidator::new(ChunkSchema::named(
            Stage::Classify,
            PREDICTION_COLUMNS,
            RowExpectation::Exact { offset: 0 },
        ));

        let mut aggregator = Aggregator::new();
        let report = ctx
            .executor
            .execute(Stage::Classify, inputs, classifier, Some(&validator), |result| {
                aggregator.push(result).map_err(fatal_in(Stage::Classify))
            })?;
        self.absorb(Stage::Classify, started, &report, Some(&validator));
        ctx.metrics
            .increment_counter("sequences_classified", aggregator.row_count() as u64);
        Ok(aggregator)
    }

    fn aggregate(&mut self, aggregator: Aggregator) -> Result<Table, PipelineError> {
        let started = self.enter(Stage::Aggregate)?;
        let ctx = self.ctx;
        let cfg = &ctx.config;
        let chunks = aggregator.chunk_count();
        let classified = aggregator.row_count();
        let table = aggregator.finish();
        let table = if cfg.keep_negatives {
            table
        } else {
            aggregate::filter_threshold(table, AMP_PROBABILITY, cfg.probability_threshold)
                .map_err(fatal_in(Stage::Aggregate))?
        };
        self.state.counts.insert(Stage::Aggregate, table.len() as u64);
        ctx.metrics
            .record_stage(Stage::Aggregate, started.elapsed(), chunks, chunks, table.len());
        if cfg.keep_negatives {
            self.info(format!("aggregate: {classified} classified rows kept (negatives included)"));
        } else {
            self.info(format!(
                "aggregate: {} of {classified} rows with {AMP_PROBABILITY} > {}",
                table.len(),
                cfg.probability_threshold
            ));
        }
        if !table.is_empty() {
            let summary = aggregate::summarize(&table, &[AMP_FAMILY, HEMOLYTIC]).map_err(fatal_in(Stage::Aggregate))?;
            self.log.block("AMP family x hemolytic:", &summary.to_string());
        }
        Ok(table)
    }

    fn enrich(&mut self, mut table: Table) -> Result<Table, PipelineError> {
        let started = self.enter(Stage::Enrich)?;
        let ctx = self.ctx;
        let collab = self.collab;
        let access = table.require_column(ACCESS).map_err(fatal_in(Stage::Enrich))?;
        let sequence = table.require_column(SEQUENCE).map_err(fatal_in(Stage::Enrich))?;
        let records: Vec<SequenceRecord> = table
            .rows
            .iter()
            .map(|row| SequenceRecord::new(row[access].clone(), row[sequence].clone()))
            .collect();

        let (mut submitted, mut accepted, mut joined) = (0, 0, 0);
        for enricher in &collab.enrichers {
            let name = enricher.name();
            let chunks = ChunkPartitioner::new(records.iter().cloned().map(Ok::<_, io::Error>), ctx.config.chunk_size)
                .for_stage(Stage::Enrich, name);
            let validator = ChunkValidator::new(
                ChunkSchema::own_header(Stage::Enrich, [ACCESS], RowExpectation::Exact { offset: 0 })
                    .with_identifier(ACCESS),
            );
            let mut results = Vec::new();
            let report = ctx
                .executor
                .execute(Stage::Enrich, chunks, enricher.as_ref(), Some(&validator), |result| {
                    results.push(result);
                    Ok(())
                })?;
            for w in &report.warnings {
                self.log.warning(w);
            }
            self.state.warnings.extend(report.warnings.iter().cloned());
            self.rejected.extend(validator.take_errors());
            submitted += report.submitted;
            accepted += report.accepted;

            let outcome = EnrichmentTable::from_results(name, results).and_then(|t| join_enrichment(&mut table, t));
            match outcome {
                Ok(()) => {
                    joined += 1;
                    self.info(format!("enrich: joined {name}"));
                }
                Err(e) => self.warn(ChunkWarning::table(Stage::Enrich, format!("dropped {name}: {e}"))),
            }
        }
        self.state.counts.insert(Stage::Enrich, joined);
        ctx.metrics
            .record_stage(Stage::Enrich, started.elapsed(), submitted, accepted, table.len());
        Ok(table)
    }

    fn quantify(&mut self, inputs: &[PathBuf]) -> Result<Table, PipelineError> {
        let collab = self.collab;
        let quantifier = collab
            .quantifier
            .as_deref()
            .ok_or_else(|| PipelineError::Config("no quantifier configured".into()))?;
        let outputs = self.run_bulk(Stage::Quantify, quantifier, inputs)?;
        let (columns, rows) = read_table(&outputs[0], true).map_err(fatal_in(Stage::Quantify))?;
        self.info(format!("quantify: {} reference peptides with abundance", rows.len()));
        Ok(Table::new(columns, rows))
    }

    fn report_empty(&mut self, started: Instant, reason: String) -> Result<RunOutcome, PipelineError> {
        self.ctx.metrics.record_stage(Stage::Report, started.elapsed(), 0, 0, 0);
        self.state.counts.insert(Stage::Report, 0);
        self.info(format!("report: nothing to report, {reason}"));
        Ok(RunOutcome::EmptySuccess { reason })
    }

    /// Files written by every non-empty report: rejected chunks and metrics.
    fn finish_report(&mut self, started: Instant, outputs: &mut Vec<PathBuf>, rows: usize) -> Result<(), PipelineError> {
        let ctx = self.ctx;
        if self.rejected.error_count() > 0 {
            let path = ctx.config.output_path("rejected_chunks.json");
            report::write_rejected(&path, &self.rejected).map_err(fatal_in(Stage::Report))?;
            self.info(format!(
                "report: {} rejected chunk(s) listed in {}",
                self.rejected.error_count(),
                path.display()
            ));
            outputs.push(path);
        }
        ctx.metrics.increment_counter("rows_reported", rows as u64);
        ctx.metrics.record_stage(Stage::Report, started.elapsed(), 0, 0, rows);
        ctx.metrics.record_end();
        let path = ctx.config.output_path("metrics.json");
        report::write_metrics(&path, &ctx.metrics).map_err(fatal_in(Stage::Report))?;
        outputs.push(path);
        self.state.counts.insert(Stage::Report, rows as u64);
        Ok(())
    }

    fn report(&mut self, table: Table, clusters: Option<Artifact>) -> Result<RunOutcome, PipelineError> {
        let started = self.enter(Stage::Report)?;
        if table.is_empty() {
            let reason = format!(
                "no peptide with {AMP_PROBABILITY} >= {}",
                self.ctx.config.probability_threshold
            );
            return self.report_empty(started, reason);
        }
        let ctx = self.ctx;
        let cfg = &ctx.config;
        let mut outputs = Vec::new();

        let path = cfg.output_path("prediction.tsv.gz");
        report::write_table_output(&path, "Prediction", &table).map_err(fatal_in(Stage::Report))?;
        outputs.push(path);

        if let Some(clusters) = clusters {
            let path = report::publish(clusters.path(), &cfg.output_path("clusters.tsv.gz"))
                .map_err(fatal_in(Stage::Report))?;
            outputs.push(path);
        }

        if ENRICHMENT_COLUMNS.iter().all(|c| table.column_index(c).is_some()) {
            let promising =
                aggregate::promising_subset(&table, cfg.solubility_threshold).map_err(fatal_in(Stage::Report))?;
            let path = cfg.output_path("promising.tsv.gz");
            report::write_table_output(&path, "Promising peptides", &promising).map_err(fatal_in(Stage::Report))?;
            self.info(format!("report: {} promising peptides", promising.len()));
            outputs.push(path);
        }

        self.info(format!("report: {} peptides written to {}", table.len(), outputs[0].display()));
        self.finish_report(started, &mut outputs, table.len())?;
        Ok(RunOutcome::Completed {
            outputs,
            rows: table.len(),
        })
    }

    fn report_abundance(&mut self, table: Table) -> Result<RunOutcome, PipelineError> {
        let started = self.enter(Stage::Report)?;
        if table.is_empty() {
            return self.report_empty(started, "no reference peptide was quantified".into());
        }
        let path = self.ctx.config.output_path("abundance.tsv.gz");
        report::write_table_output(&path, "Abundance", &table).map_err(fatal_in(Stage::Report))?;
        self.info(format!("report: {} abundance rows written to {}", table.len(), path.display()));
        let mut outputs = vec![path];
        self.finish_report(started, &mut outputs, table.len())?;
        Ok(RunOutcome::Completed {
            outputs,
            rows: table.len(),
        })
    }
}
