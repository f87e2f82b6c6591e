//! Run configuration.
//!
//! A [`PipelineConfig`] is plain data: it can be built in code, or loaded from
//! JSON with [`PipelineConfig::load_json`]. Every field except `mode`,
//! `inputs` and `output_dir` has a default.
//!
//! ```
//! use ampbeam::config::PipelineConfig;
//! use ampbeam::plan::RunMode;
//!
//! let cfg: PipelineConfig = serde_json::from_str(r#"{
//!     "mode": { "kind": "contigs" },
//!     "inputs": ["contigs.fna.gz"],
//!     "output_dir": "out",
//!     "chunk_size": "64M",
//!     "threads": 4
//! }"#)?;
//! assert_eq!(cfg.mode, RunMode::Contigs);
//! assert_eq!(cfg.chunk_size.bytes(), 64 << 20);
//! assert!(cfg.cluster);
//! cfg.check()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::error::PipelineError;
use crate::partition::ByteSize;
use crate::plan::{Plan, PlanOptions, RunMode};
use crate::validation::{Validate, ValidationError, ValidationResult, combine_validations, format_errors, validators};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

fn default_threads() -> usize {
    num_cpus::get()
}

fn default_chunk_size() -> ByteSize {
    ByteSize::new(100 << 20)
}

const fn default_memory_fraction() -> f64 {
    0.75
}

const fn default_true() -> bool {
    true
}

const fn default_min_length() -> usize {
    10
}

const fn default_max_length() -> usize {
    100
}

const fn default_probability_threshold() -> f64 {
    0.5
}

const fn default_solubility_threshold() -> f64 {
    50.0
}

fn default_tag() -> String {
    "ampbeam".into()
}

/// Everything a run needs to know.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub mode: RunMode,
    /// Input files; paired reads take two.
    pub inputs: Vec<PathBuf>,
    /// Reference peptides for abundance mode.
    #[serde(default)]
    pub reference: Option<PathBuf>,
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Byte budget per chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: ByteSize,
    /// Share of total system memory the run may use.
    #[serde(default = "default_memory_fraction")]
    pub memory_fraction: f64,
    /// Deduplicate candidates before computing features.
    #[serde(default = "default_true")]
    pub cluster: bool,
    /// Run the enrichment predictors.
    #[serde(default)]
    pub extra_enrichment: bool,
    /// Keep rows below the AMP probability threshold.
    #[serde(default)]
    pub keep_negatives: bool,
    #[serde(default = "default_min_length")]
    pub min_peptide_length: usize,
    #[serde(default = "default_max_length")]
    pub max_peptide_length: usize,
    #[serde(default = "default_probability_threshold")]
    pub probability_threshold: f64,
    #[serde(default = "default_solubility_threshold")]
    pub solubility_threshold: f64,
    /// Parent of the temporary workspace; system temp dir when unset.
    #[serde(default)]
    pub tmpdir: Option<PathBuf>,
    pub output_dir: PathBuf,
    /// Prefix of every output file.
    #[serde(default = "default_tag")]
    pub tag: String,
    /// Run log path, relative to `output_dir`; `<tag>.log` when unset.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl PipelineConfig {
    /// A configuration with defaults for everything but the essentials.
    pub fn new(mode: RunMode, inputs: Vec<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            mode,
            inputs,
            reference: None,
            threads: default_threads(),
            chunk_size: default_chunk_size(),
            memory_fraction: default_memory_fraction(),
            cluster: true,
            extra_enrichment: false,
            keep_negatives: false,
            min_peptide_length: default_min_length(),
            max_peptide_length: default_max_length(),
            probability_threshold: default_probability_threshold(),
            solubility_threshold: default_solubility_threshold(),
            tmpdir: None,
            output_dir: output_dir.into(),
            tag: default_tag(),
            log_file: None,
        }
    }

    /// Read a JSON configuration file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or does not parse.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parse config {}", path.display()))
    }

    /// Validate, folding every violation into one [`PipelineError::Config`].
    ///
    /// # Errors
    /// [`PipelineError::Config`] listing each problem.
    pub fn check(&self) -> Result<(), PipelineError> {
        self.validate()
            .map_err(|errors| PipelineError::Config(format_errors(&errors)))
    }

    #[must_use]
    pub fn plan(&self) -> Plan {
        Plan::new(
            self.mode,
            PlanOptions {
                cluster: self.cluster,
                enrich: self.extra_enrichment,
            },
        )
    }

    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        match &self.log_file {
            Some(p) => self.output_dir.join(p),
            None => self.output_dir.join(format!("{}.log", self.tag)),
        }
    }

    /// Path of an output file named `<tag>.<kind>`.
    #[must_use]
    pub fn output_path(&self, kind: &str) -> PathBuf {
        self.output_dir.join(format!("{}.{kind}", self.tag))
    }
}

impl Validate for PipelineConfig {
    fn validate(&self) -> ValidationResult {
        let mut results = vec![
            validators::in_range("threads", self.threads, 1, 4096),
            validators::not_empty("tag", &self.tag),
            validators::no_whitespace("tag", &self.tag),
        ];
        if !(self.memory_fraction > 0.0 && self.memory_fraction <= 1.0) {
            results.push(Err(vec![ValidationError::field(
                "memory_fraction",
                format!("must be in (0, 1], got {}", self.memory_fraction),
            )]));
        }
        results.push(validators::in_range("probability_threshold", self.probability_threshold, 0.0, 1.0));
        results.push(validators::in_range("solubility_threshold", self.solubility_threshold, 0.0, 100.0));
        if self.min_peptide_length == 0 || self.min_peptide_length > self.max_peptide_length {
            results.push(Err(vec![ValidationError::field(
                "min_peptide_length",
                format!(
                    "must be positive and at most max_peptide_length ({}), got {}",
                    self.max_peptide_length, self.min_peptide_length
                ),
            )]));
        }
        let expected = self.mode.expected_inputs();
        if self.inputs.len() != expected {
            results.push(Err(vec![
                ValidationError::field(
                    "inputs",
                    format!("{} mode takes {expected} input file(s), got {}", self.mode, self.inputs.len()),
                )
                .with_code("input_count"),
            ]));
        }
        if self.mode == RunMode::Abundance && self.reference.is_none() {
            results.push(Err(vec![
                ValidationError::field("reference", "abundance mode needs a reference peptide set")
                    .with_code("missing_reference"),
            ]));
        }
        combine_validations(results)
    }
}
