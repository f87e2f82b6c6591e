//! Bounded-parallel execution of per-chunk transforms.
//!
//! A [`ChunkExecutor`] owns a dedicated rayon pool of `T` worker threads. For
//! one stage it pulls chunks lazily from the input iterator (so only O(T)
//! chunks are resident at a time), applies a [`ChunkTransform`] on the
//! workers, and streams each outcome over a bounded channel back to the
//! calling thread. The calling thread is the only one that touches shared
//! state: it runs the chunk validator and hands accepted results to the
//! caller's sink, which acts as the append-only results area.
//!
//! Chunk failures (an `Err` status, a panic, or an empty table where rows
//! were expected) never abort the stage. The chunk is dropped, a [`ChunkWarning`] is recorded, and the
//! remaining chunks keep running. Only when nothing survives does the stage
//! fail with [`PipelineError::FatalEmptyResult`]. Chunks are not retried.

use crate::error::{ChunkWarning, PipelineError};
use crate::partition::Chunk;
use crate::plan::Stage;
use crate::validation::ChunkValidator;
use anyhow::anyhow;
use crossbeam_channel::bounded;
use rayon::iter::{ParallelBridge, ParallelIterator};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::fs;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

/// Output of one stage invocation over one chunk.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StageResult {
    pub chunk_index: usize,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl StageResult {
    pub fn new(chunk_index: usize, columns: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self {
            chunk_index,
            columns,
            rows,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

/// Something the executor can schedule: knows its chunk index and how many
/// rows a one-row-per-record stage must return for it.
pub trait ChunkInput {
    fn chunk_index(&self) -> usize;
    fn expected_rows(&self) -> usize;
}

impl ChunkInput for Chunk {
    fn chunk_index(&self) -> usize {
        self.index
    }

    fn expected_rows(&self) -> usize {
        self.records.len()
    }
}

impl ChunkInput for StageResult {
    fn chunk_index(&self) -> usize {
        self.chunk_index
    }

    fn expected_rows(&self) -> usize {
        self.rows.len()
    }
}

/// The single interface behind which every chunked collaborator sits.
///
/// `Err` plays the role of a non-zero exit status. Implementations must be
/// deterministic for a given input and must not rely on shared mutable state.
pub trait ChunkTransform<I>: Send + Sync {
    /// Short name used in warnings.
    fn name(&self) -> &str;

    fn apply(&self, input: &I) -> anyhow::Result<StageResult>;

    /// Like [`apply`](Self::apply), given the stage's scratch directory in
    /// the run workspace when the executor has one.
    fn apply_in(&self, input: &I, scratch: Option<&Path>) -> anyhow::Result<StageResult> {
        let _ = scratch;
        self.apply(input)
    }
}

/// Summary of one executed stage.
#[derive(Clone, Debug, Default)]
pub struct ExecutionReport {
    pub stage: Option<Stage>,
    /// Chunks that reached a worker.
    pub submitted: usize,
    /// Chunks that passed the transform and the validator.
    pub accepted: usize,
    /// Rows handed to the sink.
    pub rows: usize,
    /// One entry per dropped chunk, ordered by chunk index.
    pub warnings: Vec<ChunkWarning>,
}

impl ExecutionReport {
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.submitted - self.accepted
    }
}

enum Outcome {
    Finished {
        index: usize,
        expected: usize,
        result: anyhow::Result<StageResult>,
    },
    InputFailed(PipelineError),
}

fn run_one<I, T>(transform: &T, input: &I, scratch: Option<&Path>) -> anyhow::Result<StageResult>
where
    T: ChunkTransform<I> + ?Sized,
{
    match catch_unwind(AssertUnwindSafe(|| transform.apply_in(input, scratch))) {
        Ok(result) => result,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".into());
            Err(anyhow!("transform panicked: {msg}"))
        }
    }
}

/// Worker pool shared by every chunked stage of a run.
pub struct ChunkExecutor {
    pool: ThreadPool,
    threads: usize,
    scratch_root: Option<PathBuf>,
}

impl ChunkExecutor {
    /// Build a pool with `threads` workers (at least one).
    ///
    /// # Errors
    /// Returns [`PipelineError::Config`] if the pool cannot be created.
    pub fn new(threads: usize) -> Result<Self, PipelineError> {
        let threads = threads.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("ampbeam-worker-{i}"))
            .build()
            .map_err(|e| PipelineError::Config(format!("cannot start {threads} worker threads: {e}")))?;
        Ok(Self {
            pool,
            threads,
            scratch_root: None,
        })
    }

    /// Give each stage a scratch directory `<root>/<stage>` for its transforms.
    #[must_use]
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    fn scratch_dir(&self, stage: Stage) -> Result<Option<PathBuf>, PipelineError> {
        let Some(root) = &self.scratch_root else {
            return Ok(None);
        };
        let dir = root.join(stage.as_str());
        fs::create_dir_all(&dir).map_err(|e| PipelineError::io(stage, format!("create {}", dir.display()), e))?;
        Ok(Some(dir))
    }

    #[must_use]
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// The underlying pool, for stages that parallelize internally (bucket sorts).
    #[must_use]
    pub fn pool(&self) -> &ThreadPool {
        &self.pool
    }

    /// Run `transform` over every input chunk and deliver accepted results to `sink`.
    ///
    /// `sink` runs on the calling thread, one result at a time, in completion
    /// order (not chunk order). Results are checked by `validator` first when given.
    ///
    /// # Errors
    /// - [`PipelineError::Io`] if the stage's scratch directory cannot be created
    /// - the first error produced by `inputs` (reading the stage input failed)
    /// - the first error returned by `sink`
    /// - [`PipelineError::FatalEmptyResult`] when no chunk was accepted
    pub fn execute<I, S, T, K>(
        &self,
        stage: Stage,
        inputs: S,
        transform: &T,
        validator: Option<&ChunkValidator>,
        mut sink: K,
    ) -> Result<ExecutionReport, PipelineError>
    where
        I: ChunkInput + Send,
        S: Iterator<Item = Result<I, PipelineError>> + Send,
        T: ChunkTransform<I> + ?Sized,
        K: FnMut(StageResult) -> Result<(), PipelineError>,
    {
        let mut report = ExecutionReport {
            stage: Some(stage),
            ..ExecutionReport::default()
        };
        let scratch = self.scratch_dir(stage)?;
        let scratch = scratch.as_deref();
        let empty_ok = validator.is_some_and(ChunkValidator::allows_empty);
        let abort = AtomicBool::new(false);
        let (tx, rx) = bounded::<Outcome>(self.threads * 2);

        let fatal = thread::scope(|scope| {
            let pool = &self.pool;
            let abort = &abort;
            scope.spawn(move || {
                pool.install(|| {
                    inputs
                        .take_while(|_| !abort.load(Ordering::Relaxed))
                        .par_bridge()
                        .for_each_with(tx, |tx, item| {
                            let outcome = match item {
                                Err(e) => Outcome::InputFailed(e),
                                Ok(input) => Outcome::Finished {
                                    index: input.chunk_index(),
                                    expected: input.expected_rows(),
                                    result: run_one(transform, &input, scratch),
                                },
                            };
                            // The receiver is only gone after a fatal error.
                            let _ = tx.send(outcome);
                        });
                });
            });

            let mut fatal = None;
            while let Ok(outcome) = rx.recv() {
                let (index, expected, result) = match outcome {
                    Outcome::InputFailed(e) => {
                        fatal = Some(e);
                        break;
                    }
                    Outcome::Finished {
                        index,
                        expected,
                        result,
                    } => (index, expected, result),
                };
                report.submitted += 1;
                let result = match result {
                    Ok(r) if r.rows.is_empty() && !empty_ok => {
                        report.warnings.push(ChunkWarning::chunk(
                            stage,
                            index,
                            format!("{} returned an empty result", transform.name()),
                        ));
                        continue;
                    }
                    Ok(mut r) => {
                        r.chunk_index = index;
                        r
                    }
                    Err(e) => {
                        report.warnings.push(ChunkWarning::chunk(
                            stage,
                            index,
                            format!("{} failed: {e:#}", transform.name()),
                        ));
                        continue;
                    }
                };
                let result = match validator {
                    Some(v) => match v.check(result, expected) {
                        Ok(r) => r,
                        Err(w) => {
                            report.warnings.push(w);
                            continue;
                        }
                    },
                    None => result,
                };
                report.accepted += 1;
                report.rows += result.rows.len();
                if let Err(e) = sink(result) {
                    fatal = Some(e);
                    break;
                }
            }
            if fatal.is_some() {
                abort.store(true, Ordering::Relaxed);
            }
            drop(rx);
            fatal
        });

        if let Some(e) = fatal {
            log::error!("{stage}: aborting stage: {e}");
            return Err(e);
        }
        report.warnings.sort_by_key(|w| w.chunk);
        for w in &report.warnings {
            log::warn!("{w}");
        }
        if report.accepted == 0 {
            return Err(PipelineError::FatalEmptyResult {
                stage,
                submitted: report.submitted,
                dropped: report.dropped(),
            });
        }
        log::info!(
            "{stage}: {}/{} chunks accepted, {} rows",
            report.accepted,
            report.submitted,
            report.rows
        );
        Ok(report)
    }
}

/// Adapter turning a closure into a [`ChunkTransform`].
pub struct FnTransform<F> {
    name: String,
    f: F,
}

impl<F> FnTransform<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<I, F> ChunkTransform<I> for FnTransform<F>
where
    F: Fn(&I) -> anyhow::Result<StageResult> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, input: &I) -> anyhow::Result<StageResult> {
        (self.f)(input)
    }
}
