//! Tab-separated tables: stage outputs coming back from collaborators and the
//! final reports.
//!
//! # Notes
//! - Lines starting with `#` are comments and are skipped on read.
//! - Reading is *flexible*: rows with the wrong number of fields are kept
//!   as-is so the chunk validator can reject the chunk instead of the parser
//!   aborting the run.
//! - Compression follows the file extension (see [`crate::io::compression`]).

use crate::io::compression::{DynWrite, create_writer, open_reader, wrap_reader};
use anyhow::{Context, Result};
use csv::{ReaderBuilder, Trim, WriterBuilder};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// A header plus string rows, as parsed from a TSV.
pub type RawTable = (Vec<String>, Vec<Vec<String>>);

fn parse<R: Read>(reader: R, has_header: bool, what: &str) -> Result<RawTable> {
    let mut rdr = ReaderBuilder::new()
        .delimiter(b'\t')
        .comment(Some(b'#'))
        .has_headers(has_header)
        .flexible(true)
        .trim(Trim::Fields)
        .from_reader(reader);
    let columns = if has_header {
        rdr.headers()
            .with_context(|| format!("read header of {what}"))?
            .iter()
            .map(str::to_string)
            .collect()
    } else {
        Vec::new()
    };
    let mut rows = Vec::new();
    for (i, rec) in rdr.records().enumerate() {
        let rec = rec.with_context(|| format!("parse row #{} of {what}", i + 1))?;
        rows.push(rec.iter().map(str::to_string).collect());
    }
    Ok((columns, rows))
}

/// Read a (possibly compressed) TSV file.
///
/// # Errors
/// Returns an error if the file cannot be opened or is not valid UTF-8 TSV.
pub fn read_table(path: impl AsRef<Path>, has_header: bool) -> Result<RawTable> {
    let path = path.as_ref();
    let rdr = open_reader(path)?;
    parse(rdr, has_header, &path.display().to_string())
}

/// Parse TSV held in memory, e.g. captured stdout of a collaborator.
///
/// # Errors
/// Returns an error if the bytes are not valid TSV.
pub fn parse_table(bytes: Vec<u8>, has_header: bool) -> Result<RawTable> {
    let rdr = wrap_reader(std::io::Cursor::new(bytes), "<memory>")?;
    parse(rdr, has_header, "in-memory table")
}

/// Write a TSV to any writer, preceded by an optional `# comment` line.
///
/// # Returns
/// The number of data rows written.
///
/// # Errors
/// Propagates serialization and write failures.
pub fn write_table_to<W: Write>(
    mut writer: W,
    comment: Option<&str>,
    columns: &[String],
    rows: &[Vec<String>],
) -> Result<usize> {
    if let Some(comment) = comment {
        writeln!(writer, "# {comment}")?;
    }
    let mut wtr = WriterBuilder::new()
        .delimiter(b'\t')
        .flexible(false)
        .from_writer(writer);
    wtr.write_record(columns).context("write TSV header")?;
    for (i, row) in rows.iter().enumerate() {
        wtr.write_record(row)
            .with_context(|| format!("write TSV row #{}", i + 1))?;
    }
    wtr.flush()?;
    Ok(rows.len())
}

/// Write a TSV file, compressing by extension and creating parent directories.
///
/// # Errors
/// Returns an error if the file cannot be created or written.
pub fn write_table(
    path: impl AsRef<Path>,
    comment: Option<&str>,
    columns: &[String],
    rows: &[Vec<String>],
) -> Result<usize> {
    let path = path.as_ref();
    let w = create_writer(path)?;
    write_table_to(w, comment, columns, rows).with_context(|| format!("write {}", path.display()))
}

/// Row-at-a-time TSV file writer for tables too large to hold in memory.
pub struct TableWriter {
    inner: csv::Writer<DynWrite>,
    path: PathBuf,
    rows: usize,
}

impl TableWriter {
    /// Create `path` and write the optional comment and the header.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created or the header written.
    pub fn create(path: impl AsRef<Path>, comment: Option<&str>, columns: &[&str]) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut w = create_writer(&path)?;
        if let Some(comment) = comment {
            writeln!(w, "# {comment}").with_context(|| format!("write {}", path.display()))?;
        }
        let mut inner = WriterBuilder::new().delimiter(b'\t').from_writer(w);
        inner
            .write_record(columns)
            .with_context(|| format!("write header of {}", path.display()))?;
        Ok(Self { inner, path, rows: 0 })
    }

    /// # Errors
    /// Propagates write failures, including a row of the wrong width.
    pub fn write_row<I, S>(&mut self, row: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        self.inner
            .write_record(row)
            .with_context(|| format!("write row #{} of {}", self.rows + 1, self.path.display()))?;
        self.rows += 1;
        Ok(())
    }

    /// Flush and close the file, returning the number of data rows.
    ///
    /// # Errors
    /// Propagates the final flush failure.
    pub fn finish(mut self) -> Result<usize> {
        self.inner
            .flush()
            .with_context(|| format!("flush {}", self.path.display()))?;
        Ok(self.rows)
    }
}
