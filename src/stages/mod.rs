//! Collaborator adapters.
//!
//! The algorithms behind the individual stages (read cleaning, assembly, ORF
//! calling, descriptors, classification, mapping, enrichment predictors) are
//! not part of this crate. They plug in through two interfaces:
//!
//! - [`ChunkTransform`] for per-chunk stages, run by the
//!   [`ChunkExecutor`](crate::executor::ChunkExecutor);
//! - [`BulkStage`] for whole-file stages (preprocessing, assembly, mapping).
//!
//! Implementations provided here:
//!
//! | Type | Interface | Use |
//! |---|---|---|
//! | [`FnTransform`](crate::executor::FnTransform) | chunk | in-process closure |
//! | [`CommandTransform`] | chunk | external program, FASTA/TSV in, TSV out |
//! | [`PeptidePassthrough`] | chunk | candidate calling when inputs already are peptides |
//! | [`descriptors::BasicDescriptors`] | chunk | composition descriptors |
//! | [`FnStage`] | bulk | in-process closure |
//! | [`CommandStage`] | bulk | external program over files |

pub mod descriptors;

use crate::aggregate::{ACCESS, SEQUENCE};
use crate::executor::{ChunkTransform, StageResult};
use crate::io::fasta::write_fasta;
use crate::io::table::{parse_table, write_table_to};
use crate::partition::Chunk;
use crate::record::normalize_sequence;
use anyhow::{Context, Result, bail, ensure};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;

/// What a [`BulkStage`] gets to know about the run.
#[derive(Clone, Debug)]
pub struct BulkEnv<'a> {
    /// Directory the stage writes its outputs into (inside the workspace).
    pub out_dir: PathBuf,
    pub threads: usize,
    pub memory_budget: u64,
    pub reference: Option<&'a Path>,
}

/// A stage that consumes and produces whole files.
pub trait BulkStage: Send + Sync {
    fn name(&self) -> &str;

    /// Run over `inputs` and return the files produced.
    ///
    /// # Errors
    /// Any failure; the controller treats it as fatal for the stage.
    fn run(&self, env: &BulkEnv<'_>, inputs: &[PathBuf]) -> Result<Vec<PathBuf>>;
}

/// Adapter turning a closure into a [`BulkStage`].
pub struct FnStage<F> {
    name: String,
    f: F,
}

impl<F> FnStage<F>
where
    F: Fn(&BulkEnv<'_>, &[PathBuf]) -> Result<Vec<PathBuf>> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<F> BulkStage for FnStage<F>
where
    F: Fn(&BulkEnv<'_>, &[PathBuf]) -> Result<Vec<PathBuf>> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, env: &BulkEnv<'_>, inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
        (self.f)(env, inputs)
    }
}

/// Serialized form of a chunk handed to an external program.
pub trait ChunkPayload {
    /// # Errors
    /// Serialization failures.
    fn payload(&self) -> Result<Vec<u8>>;
}

impl ChunkPayload for Chunk {
    fn payload(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.bytes);
        write_fasta(&mut buf, &self.records)?;
        Ok(buf)
    }
}

impl ChunkPayload for StageResult {
    fn payload(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        write_table_to(&mut buf, None, &self.columns, &self.rows)?;
        Ok(buf)
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().rev().take(5).collect();
    lines.into_iter().rev().collect::<Vec<_>>().join(" | ")
}

/// Runs an external program once per chunk.
///
/// The chunk is written as FASTA (or TSV when the input is a previous stage's
/// table). If an argument is exactly `{input}` the payload goes to a scoped
/// temporary file whose path replaces it; otherwise it is piped to stdin.
/// Those files live in the stage's workspace directory when run by the
/// executor.
/// The program must print a TSV with a header line on stdout. A non-zero
/// exit status fails the chunk.
#[derive(Clone, Debug)]
pub struct CommandTransform {
    name: String,
    program: PathBuf,
    args: Vec<String>,
    scratch: Option<PathBuf>,
}

impl CommandTransform {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            scratch: None,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Directory for `{input}` files, overriding the stage's workspace
    /// directory. Without either, the system temp dir is used.
    #[must_use]
    pub fn scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch = Some(dir.into());
        self
    }

    fn invoke(&self, index: usize, payload: Vec<u8>, scratch: Option<&Path>) -> Result<StageResult> {
        let uses_file = self.args.iter().any(|a| a == "{input}");
        let mut staged = None;
        if uses_file {
            let mut builder = tempfile::Builder::new();
            builder.prefix("ampbeam-chunk.");
            let mut file = match self.scratch.as_deref().or(scratch) {
                Some(dir) => builder.tempfile_in(dir),
                None => builder.tempfile(),
            }
            .context("create chunk input file")?;
            file.write_all(&payload).context("write chunk input file")?;
            file.flush()?;
            staged = Some(file);
        }

        let mut cmd = Command::new(&self.program);
        for a in &self.args {
            match (&staged, a.as_str()) {
                (Some(file), "{input}") => cmd.arg(file.path()),
                _ => cmd.arg(a),
            };
        }
        cmd.stdin(if uses_file { Stdio::null() } else { Stdio::piped() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn {}", self.program.display()))?;

        let output = thread::scope(|scope| {
            if let Some(mut stdin) = child.stdin.take() {
                scope.spawn(move || {
                    // A program that exits without reading stdin shows up as a bad status below.
                    let _ = stdin.write_all(&payload);
                });
            }
            child.wait_with_output()
        })
        .with_context(|| format!("wait for {}", self.program.display()))?;

        if !output.status.success() {
            bail!(
                "{} exited with {} on chunk {index}: {}",
                self.name,
                output.status,
                stderr_tail(&output.stderr)
            );
        }
        let (columns, rows) = parse_table(output.stdout, true)
            .with_context(|| format!("parse output of {}", self.name))?;
        Ok(StageResult::new(index, columns, rows))
    }
}

impl ChunkTransform<Chunk> for CommandTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, input: &Chunk) -> Result<StageResult> {
        self.apply_in(input, None)
    }

    fn apply_in(&self, input: &Chunk, scratch: Option<&Path>) -> Result<StageResult> {
        self.invoke(input.index, input.payload()?, scratch)
    }
}

impl ChunkTransform<StageResult> for CommandTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, input: &StageResult) -> Result<StageResult> {
        self.apply_in(input, None)
    }

    fn apply_in(&self, input: &StageResult, scratch: Option<&Path>) -> Result<StageResult> {
        self.invoke(input.chunk_index, input.payload()?, scratch)
    }
}

/// Runs an external program over whole files.
///
/// Argument placeholders: `{inputs}` (expands to every input path),
/// `{out_dir}`, `{threads}`, `{memory_bytes}`, `{reference}`. Outputs are the
/// declared file names inside `out_dir`; each must exist and be non-empty.
#[derive(Clone, Debug)]
pub struct CommandStage {
    name: String,
    program: PathBuf,
    args: Vec<String>,
    outputs: Vec<String>,
}

impl CommandStage {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            outputs: Vec::new(),
        }
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Declare an output file name, relative to the stage's output directory.
    #[must_use]
    pub fn output(mut self, file_name: impl Into<String>) -> Self {
        self.outputs.push(file_name.into());
        self
    }
}

impl BulkStage for CommandStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, env: &BulkEnv<'_>, inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let mut cmd = Command::new(&self.program);
        for a in &self.args {
            match a.as_str() {
                "{inputs}" => {
                    cmd.args(inputs);
                }
                "{out_dir}" => {
                    cmd.arg(&env.out_dir);
                }
                "{threads}" => {
                    cmd.arg(env.threads.to_string());
                }
                "{memory_bytes}" => {
                    cmd.arg(env.memory_budget.to_string());
                }
                "{reference}" => match env.reference {
                    Some(r) => {
                        cmd.arg(r);
                    }
                    None => bail!("{} needs a reference but none is configured", self.name),
                },
                _ => {
                    cmd.arg(a);
                }
            }
        }
        let output = cmd
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("run {}", self.program.display()))?;
        if !output.status.success() {
            bail!("{} exited with {}: {}", self.name, output.status, stderr_tail(&output.stderr));
        }
        let mut produced = Vec::with_capacity(self.outputs.len());
        for name in &self.outputs {
            let path = env.out_dir.join(name);
            let len = std::fs::metadata(&path)
                .with_context(|| format!("{} did not produce {}", self.name, path.display()))?
                .len();
            ensure!(len > 0, "{} produced an empty {}", self.name, path.display());
            produced.push(path);
        }
        Ok(produced)
    }
}

/// Candidate caller for inputs that already are peptides: one row per record,
/// sequence normalized.
#[derive(Clone, Copy, Debug, Default)]
pub struct PeptidePassthrough;

impl ChunkTransform<Chunk> for PeptidePassthrough {
    fn name(&self) -> &str {
        "peptide-passthrough"
    }

    fn apply(&self, input: &Chunk) -> Result<StageResult> {
        let rows = input
            .records
            .iter()
            .map(|r| vec![r.id.clone(), normalize_sequence(&r.sequence)])
            .collect();
        Ok(StageResult::new(
            input.index,
            vec![ACCESS.to_string(), SEQUENCE.to_string()],
            rows,
        ))
    }
}
