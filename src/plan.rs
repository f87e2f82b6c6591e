//! Run modes and the stage sequence each one executes.
//!
//! A run is a strictly forward walk over a [`Plan`]: a list of [`Stage`]s fixed
//! up-front by the [`RunMode`] and two toggles (clustering and extra enrichment).
//! Mode-dependent stages are simply absent from the list rather than skipped at
//! runtime, so the controller never has to consult string flags mid-run.
//!
//! ```
//! use ampbeam::plan::{Plan, PlanOptions, RunMode, Stage};
//!
//! let plan = Plan::new(RunMode::Peptides, PlanOptions { cluster: false, enrich: false });
//! assert_eq!(plan.stages().first(), Some(&Stage::Ingest));
//! assert!(!plan.contains(Stage::Dedup));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FormatResult};

/// One state of the pipeline state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Ingest,
    Preprocess,
    Assemble,
    CallCandidates,
    Dedup,
    ComputeFeatures,
    Validate,
    Classify,
    Aggregate,
    Enrich,
    Quantify,
    Report,
}

impl Stage {
    /// Stable lowercase name used in logs, reports and metric keys.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Stage::Ingest => "ingest",
            Stage::Preprocess => "preprocess",
            Stage::Assemble => "assemble",
            Stage::CallCandidates => "call_candidates",
            Stage::Dedup => "dedup",
            Stage::ComputeFeatures => "compute_features",
            Stage::Validate => "validate",
            Stage::Classify => "classify",
            Stage::Aggregate => "aggregate",
            Stage::Enrich => "enrich",
            Stage::Quantify => "quantify",
            Stage::Report => "report",
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        f.write_str(self.as_str())
    }
}

/// Closed set of run modes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunMode {
    /// Raw sequencing reads (FASTQ), single or paired; preprocessed and assembled first.
    Reads { paired: bool },
    /// Assembled contigs (FASTA).
    Contigs,
    /// Peptides that were already called upstream (FASTA).
    Peptides,
    /// Map reads against a reference peptide set and quantify; no classification.
    Abundance,
}

impl RunMode {
    /// Number of input files this mode expects.
    #[must_use]
    pub const fn expected_inputs(self) -> usize {
        match self {
            RunMode::Reads { paired: true } => 2,
            _ => 1,
        }
    }
}

impl Display for RunMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        match self {
            RunMode::Reads { paired: true } => f.write_str("reads (paired)"),
            RunMode::Reads { paired: false } => f.write_str("reads (single)"),
            RunMode::Contigs => f.write_str("contigs"),
            RunMode::Peptides => f.write_str("peptides"),
            RunMode::Abundance => f.write_str("abundance"),
        }
    }
}

/// Toggles that add optional stages to a plan.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlanOptions {
    /// Deduplicate candidates before computing features.
    pub cluster: bool,
    /// Run the enrichment predictors after aggregation.
    pub enrich: bool,
}

/// An ordered, forward-only stage list for one run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Plan {
    mode: RunMode,
    stages: Vec<Stage>,
}

impl Plan {
    /// Build the stage list for `mode`.
    #[must_use]
    pub fn new(mode: RunMode, options: PlanOptions) -> Self {
        let mut stages = vec![Stage::Ingest];
        match mode {
            RunMode::Abundance => {
                stages.extend([Stage::Preprocess, Stage::Quantify, Stage::Report]);
                return Self { mode, stages };
            }
            RunMode::Reads { .. } => stages.extend([Stage::Preprocess, Stage::Assemble]),
            RunMode::Contigs | RunMode::Peptides => {}
        }
        stages.push(Stage::CallCandidates);
        if options.cluster {
            stages.push(Stage::Dedup);
        }
        stages.extend([
            Stage::ComputeFeatures,
            Stage::Validate,
            Stage::Classify,
            Stage::Aggregate,
        ]);
        if options.enrich {
            stages.push(Stage::Enrich);
        }
        stages.push(Stage::Report);
        Self { mode, stages }
    }

    #[must_use]
    pub fn mode(&self) -> RunMode {
        self.mode
    }

    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    #[must_use]
    pub fn contains(&self, stage: Stage) -> bool {
        self.stages.contains(&stage)
    }

    /// Position of `stage` in the plan, if present.
    #[must_use]
    pub fn position(&self, stage: Stage) -> Option<usize> {
        self.stages.iter().position(|s| *s == stage)
    }
}

impl Display for Plan {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        write!(f, "{}: ", self.mode)?;
        for (i, stage) in self.stages.iter().enumerate() {
            if i > 0 {
                f.write_str(" -> ")?;
            }
            write!(f, "{stage}")?;
        }
        Ok(())
    }
}
