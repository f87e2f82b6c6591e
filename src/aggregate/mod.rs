//! Result aggregation, summaries, and the final filters.
//!
//! [`Aggregator`] reassembles validated per-chunk results into one [`Table`]
//! in chunk-index order. The table is then summarized ([`summarize`]),
//! optionally joined with enrichment tables ([`join::join_enrichment`]), and
//! filtered ([`filter_threshold`], [`promising_subset`]).
//!
//! # Errors
//! Failures here are [`AggregateError`]s. The controller turns a refused join
//! into a warning and every other variant into a fatal stage error.

pub mod join;

use crate::executor::StageResult;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter, Result as FormatResult};
use thiserror::Error;

pub use join::{EnrichmentTable, join_enrichment};

pub const ACCESS: &str = "Access";
pub const SEQUENCE: &str = "Sequence";
pub const AMP_FAMILY: &str = "AMP_family";
pub const AMP_PROBABILITY: &str = "AMP_probability";
pub const HEMOLYTIC: &str = "Hemolytic";
pub const HEMOLYTIC_PROBABILITY: &str = "Hemolytic_probability";
pub const PERCENT_SOLUBLE: &str = "Percent_soluble";
pub const SCALED_SOLUBILITY: &str = "Scaled_Solubility";
pub const ANTIGENICITY: &str = "Antigenicity";
pub const SUSCEPTIBLE_TO_PROTEASES: &str = "Susceptible_to_proteases";

/// Header of the main prediction table.
pub const PREDICTION_COLUMNS: [&str; 6] = [
    ACCESS,
    SEQUENCE,
    AMP_FAMILY,
    AMP_PROBABILITY,
    HEMOLYTIC,
    HEMOLYTIC_PROBABILITY,
];

/// Columns contributed by the enrichment predictors.
pub const ENRICHMENT_COLUMNS: [&str; 4] = [
    PERCENT_SOLUBLE,
    SCALED_SOLUBILITY,
    ANTIGENICITY,
    SUSCEPTIBLE_TO_PROTEASES,
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AggregateError {
    #[error("chunk {chunk} has columns [{found}], expected [{expected}]")]
    ColumnMismatch {
        chunk: usize,
        expected: String,
        found: String,
    },

    #[error("chunk {0} was aggregated twice")]
    DuplicateChunk(usize),

    #[error("column `{0}` not found")]
    MissingColumn(String),

    #[error("column `{column}` row {row}: `{value}` is not a number")]
    BadValue {
        column: String,
        row: usize,
        value: String,
    },

    #[error(
        "enrichment `{enrichment}` does not match the main table: {missing} missing, {extra} extra, {duplicates} duplicate ids{}",
        .example.as_deref().map(|e| format!(" (e.g. `{e}`)")).unwrap_or_default()
    )]
    JoinMismatch {
        enrichment: String,
        missing: usize,
        extra: usize,
        duplicates: usize,
        example: Option<String>,
    },

    #[error("enrichment `{enrichment}` would overwrite existing column `{column}`")]
    ColumnCollision { enrichment: String, column: String },
}

/// A header plus string rows.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { columns, rows }
    }

    pub fn with_columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
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

    /// # Errors
    /// [`AggregateError::MissingColumn`] when the table has no such column.
    pub fn require_column(&self, name: &str) -> Result<usize, AggregateError> {
        self.column_index(name)
            .ok_or_else(|| AggregateError::MissingColumn(name.to_string()))
    }

    /// Values of one column, in row order.
    ///
    /// # Errors
    /// [`AggregateError::MissingColumn`] when the table has no such column.
    pub fn column(&self, name: &str) -> Result<impl Iterator<Item = &str>, AggregateError> {
        let idx = self.require_column(name)?;
        Ok(self.rows.iter().map(move |r| r[idx].as_str()))
    }

    /// Keep only the rows matching `keep`.
    #[must_use]
    pub fn retain_rows<F>(mut self, mut keep: F) -> Self
    where
        F: FnMut(&[String]) -> bool,
    {
        self.rows.retain(|r| keep(r));
        self
    }
}

/// Collects validated chunk results and concatenates them by chunk index.
#[derive(Debug, Default)]
pub struct Aggregator {
    columns: Option<Vec<String>>,
    parts: BTreeMap<usize, Vec<Vec<String>>>,
    rows: usize,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one accepted chunk result.
    ///
    /// # Errors
    /// - [`AggregateError::ColumnMismatch`] if its header differs from earlier chunks
    /// - [`AggregateError::DuplicateChunk`] if the chunk index was already added
    pub fn push(&mut self, result: StageResult) -> Result<(), AggregateError> {
        match &self.columns {
            Some(cols) if *cols != result.columns => {
                return Err(AggregateError::ColumnMismatch {
                    chunk: result.chunk_index,
                    expected: cols.join(", "),
                    found: result.columns.join(", "),
                });
            }
            Some(_) => {}
            None => self.columns = Some(result.columns),
        }
        if self.parts.contains_key(&result.chunk_index) {
            return Err(AggregateError::DuplicateChunk(result.chunk_index));
        }
        self.rows += result.rows.len();
        self.parts.insert(result.chunk_index, result.rows);
        Ok(())
    }

    /// Sum of the rows of all accepted chunks.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows
    }

    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.parts.len()
    }

    /// Concatenate in chunk-index order.
    #[must_use]
    pub fn finish(self) -> Table {
        let mut rows = Vec::with_capacity(self.rows);
        for (_, part) in self.parts {
            rows.extend(part);
        }
        Table {
            columns: self.columns.unwrap_or_default(),
            rows,
        }
    }
}

/// Group-by counts over categorical columns.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub columns: Vec<String>,
    pub counts: BTreeMap<Vec<String>, usize>,
}

impl Summary {
    #[must_use]
    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }
}

impl Display for Summary {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        writeln!(f, "{}\tcount", self.columns.join("\t"))?;
        for (key, n) in &self.counts {
            writeln!(f, "{}\t{n}", key.join("\t"))?;
        }
        Ok(())
    }
}

/// Count rows per distinct combination of `columns`.
///
/// # Errors
/// [`AggregateError::MissingColumn`] if any column is absent.
pub fn summarize(table: &Table, columns: &[&str]) -> Result<Summary, AggregateError> {
    let idx: Vec<usize> = columns
        .iter()
        .map(|c| table.require_column(c))
        .collect::<Result<_, _>>()?;
    let mut counts = BTreeMap::new();
    for row in &table.rows {
        let key: Vec<String> = idx.iter().map(|&i| row[i].clone()).collect();
        *counts.entry(key).or_insert(0) += 1;
    }
    Ok(Summary {
        columns: columns.iter().map(|c| (*c).to_string()).collect(),
        counts,
    })
}

fn parse_number(table: &Table, column: usize, row: usize) -> Result<f64, AggregateError> {
    let value = &table.rows[row][column];
    value.trim().parse::<f64>().map_err(|_| AggregateError::BadValue {
        column: table.columns[column].clone(),
        row: row + 1,
        value: value.clone(),
    })
}

/// Keep rows whose `column` is strictly above `threshold`.
///
/// # Errors
/// [`AggregateError::MissingColumn`] or [`AggregateError::BadValue`].
pub fn filter_threshold(table: Table, column: &str, threshold: f64) -> Result<Table, AggregateError> {
    let idx = table.require_column(column)?;
    let mut keep = Vec::with_capacity(table.len());
    for row in 0..table.len() {
        keep.push(parse_number(&table, idx, row)? > threshold);
    }
    let mut flags = keep.into_iter();
    Ok(table.retain_rows(|_| flags.next().unwrap_or(false)))
}

/// Interpret a yes/no style label. Unknown labels count as positive, so they
/// never pass a "must be negative" filter.
fn is_positive(label: &str) -> bool {
    let l = label.trim().to_ascii_lowercase();
    !matches!(
        l.as_str(),
        "nonhemo"
            | "non-hemolytic"
            | "non_hemolytic"
            | "non-antigenic"
            | "non_antigenic"
            | "nonantigenic"
            | "not_susceptible"
            | "not-susceptible"
            | "resistant"
            | "no"
            | "false"
            | "0"
            | "negative"
    )
}

/// Rows that are non-hemolytic, more soluble than `solubility_threshold`
/// percent, not antigenic, and not protease-susceptible.
///
/// # Errors
/// [`AggregateError::MissingColumn`] when the enrichment columns are absent,
/// [`AggregateError::BadValue`] when `Percent_soluble` is not numeric.
pub fn promising_subset(table: &Table, solubility_threshold: f64) -> Result<Table, AggregateError> {
    let hemo = table.require_column(HEMOLYTIC)?;
    let soluble = table.require_column(PERCENT_SOLUBLE)?;
    let antigenic = table.require_column(ANTIGENICITY)?;
    let proteases = table.require_column(SUSCEPTIBLE_TO_PROTEASES)?;
    let mut out = Table {
        columns: table.columns.clone(),
        rows: Vec::new(),
    };
    for (i, row) in table.rows.iter().enumerate() {
        if is_positive(&row[hemo]) || is_positive(&row[antigenic]) || is_positive(&row[proteases]) {
            continue;
        }
        if parse_number(table, soluble, i)? > solubility_threshold {
            out.rows.push(row.clone());
        }
    }
    Ok(out)
}
