//! Key-based joins of enrichment tables onto the main table.
//!
//! An enrichment table is keyed by the record identifier. The join is only
//! performed when the enrichment's id set equals the main table's id set
//! exactly, each id occurring once on both sides. Anything else is refused
//! with [`AggregateError::JoinMismatch`] and the main table is left untouched.

use super::{ACCESS, AggregateError, Table};
use crate::executor::StageResult;
use std::collections::{BTreeMap, HashSet};

/// Extra per-record columns produced by one enrichment predictor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnrichmentTable {
    pub name: String,
    /// Value columns, excluding the key.
    pub columns: Vec<String>,
    rows: BTreeMap<String, Vec<String>>,
    duplicates: Vec<String>,
}

impl EnrichmentTable {
    pub fn new(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
            rows: BTreeMap::new(),
            duplicates: Vec::new(),
        }
    }

    /// Add the values for `id`. A repeated id is remembered and later makes
    /// the join refuse.
    pub fn insert(&mut self, id: impl Into<String>, values: Vec<String>) {
        let id = id.into();
        if self.rows.contains_key(&id) {
            self.duplicates.push(id);
        } else {
            self.rows.insert(id, values);
        }
    }

    /// Build from a table whose `key_column` holds the record ids.
    ///
    /// # Errors
    /// [`AggregateError::MissingColumn`] if `key_column` is absent.
    pub fn from_table(name: impl Into<String>, table: Table, key_column: &str) -> Result<Self, AggregateError> {
        let key = table.require_column(key_column)?;
        let columns = table
            .columns
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != key)
            .map(|(_, c)| c.clone())
            .collect();
        let mut out = Self::new(name, columns);
        for mut row in table.rows {
            let id = row.remove(key);
            out.insert(id, row);
        }
        Ok(out)
    }

    /// Build from per-chunk results keyed by [`ACCESS`].
    ///
    /// The first chunk (by index) fixes the column order. Later chunks may
    /// list the same columns in another order and are remapped by name.
    ///
    /// # Errors
    /// - [`AggregateError::MissingColumn`] if a result lacks the key column
    /// - [`AggregateError::ColumnMismatch`] if a result's columns are not the
    ///   same set as the first one's
    pub fn from_results<I>(name: impl Into<String>, results: I) -> Result<Self, AggregateError>
    where
        I: IntoIterator<Item = StageResult>,
    {
        let mut results: Vec<StageResult> = results.into_iter().collect();
        results.sort_by_key(|r| r.chunk_index);
        let name = name.into();
        let mut out: Option<Self> = None;
        for result in results {
            let chunk = result.chunk_index;
            let t = Self::from_table(name.clone(), Table::new(result.columns, result.rows), ACCESS)?;
            match out.as_mut() {
                None => out = Some(t),
                Some(acc) => acc.absorb(t, chunk)?,
            }
        }
        Ok(out.unwrap_or_else(|| Self::new(name, Vec::new())))
    }

    fn absorb(&mut self, other: Self, chunk: usize) -> Result<(), AggregateError> {
        let order = if other.columns == self.columns {
            None
        } else {
            let positions: Option<Vec<usize>> = self
                .columns
                .iter()
                .map(|c| other.columns.iter().position(|o| o == c))
                .collect();
            match positions {
                Some(p) if other.columns.len() == self.columns.len() => Some(p),
                _ => {
                    return Err(AggregateError::ColumnMismatch {
                        chunk,
                        expected: self.columns.join(", "),
                        found: other.columns.join(", "),
                    });
                }
            }
        };
        self.duplicates.extend(other.duplicates);
        for (id, values) in other.rows {
            let values = match &order {
                Some(p) => p.iter().map(|&i| values.get(i).cloned().unwrap_or_default()).collect(),
                None => values,
            };
            self.insert(id, values);
        }
        Ok(())
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
    pub fn get(&self, id: &str) -> Option<&[String]> {
        self.rows.get(id).map(Vec::as_slice)
    }
}

/// Append `enrichment`'s columns to `main`, matching rows by [`ACCESS`].
///
/// # Errors
/// - [`AggregateError::MissingColumn`] if `main` has no `Access` column
/// - [`AggregateError::ColumnCollision`] if a column would be duplicated
/// - [`AggregateError::JoinMismatch`] if the id sets differ or either side repeats an id
///
/// `main` is modified only on success.
pub fn join_enrichment(main: &mut Table, mut enrichment: EnrichmentTable) -> Result<(), AggregateError> {
    let key = main.require_column(ACCESS)?;
    if let Some(column) = enrichment.columns.iter().find(|c| main.columns.contains(c)) {
        return Err(AggregateError::ColumnCollision {
            enrichment: enrichment.name.clone(),
            column: column.clone(),
        });
    }

    let mut seen: HashSet<&str> = HashSet::with_capacity(main.len());
    let mut duplicates = enrichment.duplicates.len();
    let mut missing = 0usize;
    let mut example = enrichment.duplicates.first().cloned();
    for row in &main.rows {
        let id = row[key].as_str();
        if !seen.insert(id) {
            duplicates += 1;
            example.get_or_insert_with(|| id.to_string());
        } else if !enrichment.rows.contains_key(id) {
            missing += 1;
            example.get_or_insert_with(|| id.to_string());
        }
    }
    let extra_ids: Vec<&String> = enrichment.rows.keys().filter(|id| !seen.contains(id.as_str())).collect();
    let extra = extra_ids.len();
    if example.is_none() {
        example = extra_ids.first().map(|s| (*s).clone());
    }
    let width = enrichment.columns.len();
    let ragged = enrichment.rows.values().any(|v| v.len() != width);
    if missing + extra + duplicates > 0 || ragged {
        return Err(AggregateError::JoinMismatch {
            enrichment: enrichment.name,
            missing,
            extra,
            duplicates,
            example,
        });
    }
    drop(seen);

    for row in &mut main.rows {
        if let Some(values) = enrichment.rows.remove(&row[key]) {
            row.extend(values);
        }
    }
    main.columns.append(&mut enrichment.columns);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| (*s).to_string()).collect()
    }

    fn main_table() -> Table {
        Table::new(strings(&["Access", "Sequence"]), vec![strings(&["a", "KK"]), strings(&["b", "WW"])])
    }

    #[test]
    fn joins_by_key_not_position() {
        let mut main = main_table();
        let mut e = EnrichmentTable::new("solubility", strings(&["Percent_soluble"]));
        e.insert("b", strings(&["20"]));
        e.insert("a", strings(&["80"]));
        join_enrichment(&mut main, e).unwrap();
        assert_eq!(main.rows[0], strings(&["a", "KK", "80"]));
        assert_eq!(main.rows[1], strings(&["b", "WW", "20"]));
    }

    #[test]
    fn mismatch_leaves_main_untouched() {
        let mut main = main_table();
        let mut e = EnrichmentTable::new("solubility", strings(&["Percent_soluble"]));
        e.insert("a", strings(&["80"]));
        e.insert("z", strings(&["10"]));
        let err = join_enrichment(&mut main, e).unwrap_err();
        assert!(matches!(err, AggregateError::JoinMismatch { missing: 1, extra: 1, .. }));
        assert_eq!(main, main_table());
    }
}
