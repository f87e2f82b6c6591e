//! Data quality gates for stage outputs and configuration.
//!
//! Two layers live here:
//! - the general [`Validate`] / [`ValidationError`] / [`ErrorCollector`] API,
//!   used for configuration checks and for accumulating rejected chunks so
//!   they can be exported as JSON at the end of a run;
//! - the [`ChunkValidator`], which checks one [`StageResult`] against a
//!   [`ChunkSchema`] before it may enter the results area.
//!
//! A rejected chunk is never fatal. It is reported as a [`ChunkWarning`] and
//! excluded from everything downstream.
//!
//! # Example
//!
//! ```
//! use ampbeam::executor::StageResult;
//! use ampbeam::plan::Stage;
//! use ampbeam::validation::{ChunkSchema, ChunkValidator, RowExpectation};
//!
//! let schema = ChunkSchema::named(Stage::Classify, ["Access", "AMP_probability"], RowExpectation::Exact { offset: 0 });
//! let validator = ChunkValidator::new(schema);
//!
//! let ok = StageResult::new(0, vec!["Access".into(), "AMP_probability".into()], vec![vec!["a".into(), "0.9".into()]]);
//! assert!(validator.check(ok, 1).is_ok());
//!
//! let short = StageResult::new(1, vec!["Access".into(), "AMP_probability".into()], vec![]);
//! assert!(validator.check(short, 1).is_err());
//! assert_eq!(validator.rejected(), 1);
//! ```

use crate::error::ChunkWarning;
use crate::executor::StageResult;
use crate::plan::Stage;
use serde::{Deserialize, Serialize};
use std::io::Error;
use std::path::Path;
use std::sync::Mutex;
use std::{fmt, io};

/// Result type for validation operations.
pub type ValidationResult = Result<(), Vec<ValidationError>>;

/// Types that can check their own consistency.
pub trait Validate {
    /// Validate this instance and return every violation found.
    fn validate(&self) -> ValidationResult;
}

/// A single validation error with context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    /// The field (or table aspect) that failed validation
    pub field: Option<String>,
    /// Human-readable error message
    pub message: String,
    /// Error code for categorization
    pub code: Option<String>,
}

impl ValidationError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            field: None,
            message: message.into(),
            code: None,
        }
    }

    pub fn field<S: Into<String>, M: Into<String>>(field: S, message: M) -> Self {
        Self {
            field: Some(field.into()),
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code<S: Into<String>>(mut self, code: S) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref field) = self.field {
            write!(f, "[{field}] {}", self.message)?;
        } else {
            write!(f, "{}", self.message)?;
        }
        if let Some(ref code) = self.code {
            write!(f, " (code: {code})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// Accumulates validation failures for batch reporting.
#[derive(Debug, Clone, Default)]
pub struct ErrorCollector {
    errors: Vec<RejectedChunk>,
}

/// Validation errors attributed to one chunk of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedChunk {
    pub stage: Stage,
    pub chunk: Option<usize>,
    pub errors: Vec<ValidationError>,
}

impl ErrorCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, stage: Stage, chunk: Option<usize>, errors: Vec<ValidationError>) {
        self.errors.push(RejectedChunk { stage, chunk, errors });
    }

    /// Number of rejected chunks.
    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[RejectedChunk] {
        &self.errors
    }

    /// Move every entry of `other` into this collector.
    pub fn extend(&mut self, other: ErrorCollector) {
        self.errors.extend(other.errors);
    }

    /// Export errors to JSON format.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.errors)
    }

    /// Write errors to a file in JSON format.
    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let json = self.to_json().map_err(Error::other)?;
        std::fs::write(path, json)
    }
}

impl fmt::Display for ErrorCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ErrorCollector({} rejected chunks)", self.error_count())
    }
}

pub(crate) fn format_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// How many rows a chunk's result must contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowExpectation {
    /// Exactly one row per input record, plus `offset` leading rows
    /// (e.g. a header line echoed by the collaborator) that are stripped on acceptance.
    Exact { offset: usize },
    /// Any number of rows; the count is unrelated to the input (candidate calling).
    Any,
}

/// Which columns a chunk's result must have.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnRule {
    /// Header must equal these names, in order.
    Named(Vec<String>),
    /// Header (if any) and rows must have this many fields.
    Width(usize),
    /// Header is defined by the collaborator; every row must match its width
    /// and it must contain the listed columns.
    OwnHeader { required: Vec<String> },
}

/// Expected shape of one stage's per-chunk output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSchema {
    pub stage: Stage,
    pub columns: ColumnRule,
    pub rows: RowExpectation,
    /// Column whose values become record ids downstream; each must be a
    /// non-empty token without whitespace.
    pub identifier: Option<String>,
}

impl ChunkSchema {
    /// Schema requiring the result's header to match `columns` exactly.
    pub fn named<I, S>(stage: Stage, columns: I, rows: RowExpectation) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            stage,
            columns: ColumnRule::Named(columns.into_iter().map(Into::into).collect()),
            rows,
            identifier: None,
        }
    }

    /// Schema that checks only the column count.
    pub fn width(stage: Stage, width: usize, rows: RowExpectation) -> Self {
        Self {
            stage,
            columns: ColumnRule::Width(width),
            rows,
            identifier: None,
        }
    }

    /// Schema that trusts the collaborator's header but requires `required` in it.
    pub fn own_header<I, S>(stage: Stage, required: I, rows: RowExpectation) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            stage,
            columns: ColumnRule::OwnHeader {
                required: required.into_iter().map(Into::into).collect(),
            },
            rows,
            identifier: None,
        }
    }

    /// Require every value of `column` to be usable as a record id.
    #[must_use]
    pub fn with_identifier(mut self, column: impl Into<String>) -> Self {
        self.identifier = Some(column.into());
        self
    }

    fn identifier_errors(&self, header: &[String], rows: &[Vec<String>]) -> Vec<ValidationError> {
        let Some(column) = &self.identifier else {
            return Vec::new();
        };
        let Some(idx) = header.iter().position(|c| c == column) else {
            return Vec::new();
        };
        rows.iter()
            .enumerate()
            .find_map(|(i, row)| {
                let value = row.get(idx)?;
                combine_validations(vec![
                    validators::not_empty(column, value),
                    validators::no_whitespace(column, value),
                ])
                .err()
                .map(|errors| (i, value, errors))
            })
            .map(|(i, value, errors)| {
                errors
                    .into_iter()
                    .map(|e| {
                        ValidationError::field(column.as_str(), format!("row {}: `{value}` {}", i + 1, e.message))
                            .with_code("identifier")
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn header_errors(&self, header: &[String]) -> Vec<ValidationError> {
        match &self.columns {
            ColumnRule::Named(names) if header != names.as_slice() => vec![
                ValidationError::field(
                    "header",
                    format!("expected [{}], found [{}]", names.join(", "), header.join(", ")),
                )
                .with_code("header"),
            ],
            ColumnRule::Width(width) if !header.is_empty() && header.len() != *width => vec![
                ValidationError::field("header", format!("{} columns, expected {width}", header.len()))
                    .with_code("column_count"),
            ],
            ColumnRule::OwnHeader { required } => required
                .iter()
                .filter(|c| !header.contains(c))
                .map(|c| ValidationError::field("header", format!("missing column `{c}`")).with_code("header"))
                .collect(),
            _ => Vec::new(),
        }
    }

    fn width_for(&self, header: &[String]) -> usize {
        match &self.columns {
            ColumnRule::Named(names) => names.len(),
            ColumnRule::Width(width) => *width,
            ColumnRule::OwnHeader { .. } => header.len(),
        }
    }
}

/// Gate between a stage and the results area.
#[derive(Debug)]
pub struct ChunkValidator {
    schema: ChunkSchema,
    collector: Mutex<ErrorCollector>,
}

impl ChunkValidator {
    pub fn new(schema: ChunkSchema) -> Self {
        Self {
            schema,
            collector: Mutex::new(ErrorCollector::new()),
        }
    }

    #[must_use]
    pub fn schema(&self) -> &ChunkSchema {
        &self.schema
    }

    /// Whether a chunk may legitimately produce no rows.
    #[must_use]
    pub fn allows_empty(&self) -> bool {
        self.schema.rows == RowExpectation::Any
    }

    /// Check `result` for a chunk that held `expected_rows` input records.
    ///
    /// Returns the result with offset rows removed when it passes, or a
    /// warning naming the chunk when it does not.
    pub fn check(&self, mut result: StageResult, expected_rows: usize) -> Result<StageResult, ChunkWarning> {
        let stage = self.schema.stage;
        let width = self.schema.width_for(&result.columns);
        let offset = match self.schema.rows {
            RowExpectation::Exact { offset } => offset,
            RowExpectation::Any => 0,
        };
        let mut errors = self.schema.header_errors(&result.columns);

        if let Some((i, row)) = result
            .rows
            .iter()
            .enumerate()
            .skip(offset)
            .find(|(_, row)| row.len() != width)
        {
            errors.push(
                ValidationError::field(
                    "rows",
                    format!("row {} has {} columns, expected {width}", i + 1, row.len()),
                )
                .with_code("column_count"),
            );
        }

        errors.extend(
            self.schema
                .identifier_errors(&result.columns, result.rows.get(offset..).unwrap_or_default()),
        );

        if let RowExpectation::Exact { offset } = self.schema.rows {
            let want = expected_rows + offset;
            if result.rows.len() != want {
                errors.push(
                    ValidationError::field(
                        "rows",
                        format!("row count {} != expected {want}", result.rows.len()),
                    )
                    .with_code("row_count"),
                );
            }
        }

        if errors.is_empty() {
            result.rows.drain(..offset.min(result.rows.len()));
            return Ok(result);
        }
        let warning = ChunkWarning::chunk(stage, result.chunk_index, format_errors(&errors));
        if let Ok(mut collector) = self.collector.lock() {
            collector.add_error(stage, Some(result.chunk_index), errors);
        }
        Err(warning)
    }

    /// Number of chunks rejected so far.
    pub fn rejected(&self) -> usize {
        self.collector.lock().map(|c| c.error_count()).unwrap_or(0)
    }

    /// Take the accumulated rejections, leaving the validator empty.
    pub fn take_errors(&self) -> ErrorCollector {
        self.collector
            .lock()
            .map(|mut c| std::mem::take(&mut *c))
            .unwrap_or_default()
    }
}

/// Validation helpers for common patterns.
pub mod validators {
    use super::{ValidationError, ValidationResult};
    use std::fmt;

    /// Validate that a string is not empty.
    pub fn not_empty(field: &str, value: &str) -> ValidationResult {
        if value.trim().is_empty() {
            Err(vec![ValidationError::field(field, "must not be empty")])
        } else {
            Ok(())
        }
    }

    /// Validate that a value lies within `min..=max`.
    pub fn in_range<T: PartialOrd + fmt::Display>(field: &str, value: T, min: T, max: T) -> ValidationResult {
        if value >= min && value <= max {
            Ok(())
        } else {
            Err(vec![ValidationError::field(
                field,
                format!("must be between {min} and {max}, got {value}"),
            )])
        }
    }

    /// Validate that an identifier contains no whitespace.
    pub fn no_whitespace(field: &str, value: &str) -> ValidationResult {
        if value.chars().any(char::is_whitespace) {
            Err(vec![ValidationError::field(field, "must not contain whitespace")])
        } else {
            Ok(())
        }
    }
}

/// Combine multiple validation results.
pub fn combine_validations(results: Vec<ValidationResult>) -> ValidationResult {
    let mut all_errors = Vec::new();
    for result in results {
        if let Err(mut errors) = result {
            all_errors.append(&mut errors);
        }
    }
    if all_errors.is_empty() {
        Ok(())
    } else {
        Err(all_errors)
    }
}
