//! Final outputs of a run.
//!
//! Every file is written into the configured output directory under the
//! `<tag>.<kind>` naming scheme. Nothing lands there before the Report stage,
//! so a run that fails (or finds nothing) leaves at most its run log behind.
//!
//! # Files
//! - `<tag>.prediction.tsv.gz`: classified peptides, version comment first
//! - `<tag>.clusters.tsv.gz`: dedup mapping table (`Access Sequence Members`)
//! - `<tag>.promising.tsv.gz`: promising subset, when enrichment was joined
//! - `<tag>.abundance.tsv.gz`: mapping-only runs
//! - `<tag>.metrics.json`: per-stage counters and timings
//! - `<tag>.rejected_chunks.json`: chunks rejected by validation, if any
//! - run log (`<tag>.log` unless configured otherwise)

use crate::aggregate::Table;
use crate::error::{ChunkWarning, Severity};
use crate::metrics::MetricsCollector;
use crate::validation::ErrorCollector;
use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::fs::{self, create_dir_all};
use std::path::{Path, PathBuf};

/// Comment written above every tabular output.
#[must_use]
pub fn version_comment(what: &str) -> String {
    format!("{what} from ampbeam v{}", env!("CARGO_PKG_VERSION"))
}

/// Human-readable run report, built up while the run progresses.
#[derive(Clone, Debug, Default)]
pub struct RunLog {
    lines: Vec<(Severity, String)>,
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.lines.push((Severity::Info, message.into()));
    }

    pub fn warning(&mut self, warning: &ChunkWarning) {
        // The warning's Display already carries its marker.
        let full = warning.to_string();
        let marker = format!("{} ", Severity::Warning);
        let text = match full.strip_prefix(&marker) {
            Some(rest) => rest.to_string(),
            None => full.clone(),
        };
        self.lines.push((Severity::Warning, text));
    }

    pub fn fatal(&mut self, message: impl Into<String>) {
        self.lines.push((Severity::Fatal, message.into()));
    }

    /// Append a multi-line block (summary tables) as indented info lines.
    pub fn block(&mut self, title: &str, body: &str) {
        self.info(title);
        for line in body.lines() {
            self.lines.push((Severity::Info, format!("    {line}")));
        }
    }

    /// Append per-stage timings and chunk counts from `metrics`.
    pub fn stage_table(&mut self, metrics: &MetricsCollector) {
        let mut body = String::from("stage\tms\tsubmitted\taccepted\tdropped\trows\n");
        for (stage, m) in metrics.stages() {
            let _ = writeln!(
                body,
                "{stage}\t{}\t{}\t{}\t{}\t{}",
                m.duration_ms, m.chunks_submitted, m.chunks_accepted, m.chunks_dropped, m.rows
            );
        }
        self.block("stage summary:", &body);
        if let Some(elapsed) = metrics.elapsed() {
            self.info(format!("elapsed: {:.2}s", elapsed.as_secs_f64()));
        }
    }

    #[must_use]
    pub fn lines(&self) -> &[(Severity, String)] {
        &self.lines
    }

    /// Whether any line has the given severity.
    #[must_use]
    pub fn has(&self, severity: Severity) -> bool {
        self.lines.iter().any(|(s, _)| *s == severity)
    }

    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (severity, line) in &self.lines {
            let _ = writeln!(out, "{severity} {line}");
        }
        out
    }

    /// # Errors
    /// Returns an error if the file or its directory cannot be written.
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        ensure_parent(path)?;
        fs::write(path, self.render()).with_context(|| format!("write run log {}", path.display()))
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        create_dir_all(parent).with_context(|| format!("mkdir -p {}", parent.display()))?;
    }
    Ok(())
}

/// Write `table` as a compressed TSV with a version comment.
///
/// # Errors
/// Returns an error if the file cannot be written.
pub fn write_table_output(path: &Path, what: &str, table: &Table) -> Result<usize> {
    crate::io::table::write_table(path, Some(&version_comment(what)), &table.columns, &table.rows)
}

/// Copy a finished workspace file into the output directory.
///
/// # Errors
/// Returns an error if the copy fails.
pub fn publish(from: &Path, to: &Path) -> Result<PathBuf> {
    ensure_parent(to)?;
    fs::copy(from, to).with_context(|| format!("copy {} to {}", from.display(), to.display()))?;
    Ok(to.to_path_buf())
}

/// # Errors
/// Returns an error if the file cannot be written.
pub fn write_rejected(path: &Path, rejected: &ErrorCollector) -> Result<()> {
    ensure_parent(path)?;
    rejected
        .write_to_file(path)
        .with_context(|| format!("write {}", path.display()))
}

/// # Errors
/// Returns an error if the file cannot be written.
pub fn write_metrics(path: &Path, metrics: &MetricsCollector) -> Result<()> {
    ensure_parent(path)?;
    metrics.save_to_file(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Stage;

    #[test]
    fn log_lines_carry_markers() {
        let mut log = RunLog::new();
        log.info("call_candidates: 12 candidates");
        log.warning(&ChunkWarning::chunk(Stage::Classify, 3, "row count 1 != expected 2"));
        log.fatal("[dedup] deduplication failed: boom");
        assert_eq!(
            log.render(),
            "[INFO] call_candidates: 12 candidates\n\
             [WARN] [classify] chunk 3: row count 1 != expected 2\n\
             [FATAL] [dedup] deduplication failed: boom\n"
        );
        assert!(log.has(Severity::Fatal));
    }

    #[test]
    fn version_comment_names_crate() {
        assert!(version_comment("Prediction").starts_with("Prediction from ampbeam v"));
    }
}
