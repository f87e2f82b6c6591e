//! Streaming FASTA / FASTQ readers and a FASTA writer.
//!
//! Readers yield `io::Result<SequenceRecord>` one record at a time so that
//! inputs larger than memory can be partitioned without being materialized.
//! Once a reader reports an error it is fused and yields nothing further.

use crate::io::compression::{DynBufRead, open_reader};
use crate::record::SequenceRecord;
use anyhow::{Context, Result};
use std::io::{self, BufRead, Write};
use std::path::Path;

/// Boxed record stream, as consumed by the partitioner.
pub type RecordStream = Box<dyn Iterator<Item = io::Result<SequenceRecord>> + Send>;

fn invalid(line_no: u64, message: impl Into<String>) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("line {line_no}: {}", message.into()),
    )
}

/// Text after the marker up to the first whitespace.
fn header_id(header: &str) -> &str {
    header[1..].split_whitespace().next().unwrap_or("")
}

/// Read one line into `buf` without its terminator. Returns `false` at EOF.
fn next_line<R: BufRead>(reader: &mut R, buf: &mut String, line_no: &mut u64) -> io::Result<bool> {
    buf.clear();
    if reader.read_line(buf)? == 0 {
        return Ok(false);
    }
    *line_no += 1;
    while buf.ends_with('\n') || buf.ends_with('\r') {
        buf.pop();
    }
    Ok(true)
}

/// Multi-line FASTA reader.
pub struct FastaReader<R: BufRead> {
    reader: R,
    line: String,
    line_no: u64,
    pending_header: Option<String>,
    done: bool,
}

impl<R: BufRead> FastaReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
            line_no: 0,
            pending_header: None,
            done: false,
        }
    }

    fn read_record(&mut self) -> io::Result<Option<SequenceRecord>> {
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => loop {
                if !next_line(&mut self.reader, &mut self.line, &mut self.line_no)? {
                    return Ok(None);
                }
                if self.line.trim().is_empty() {
                    continue;
                }
                if !self.line.starts_with('>') {
                    return Err(invalid(self.line_no, "sequence data before the first '>' header"));
                }
                break self.line.clone();
            },
        };

        let id = header_id(&header);
        if id.is_empty() {
            return Err(invalid(self.line_no, "empty FASTA header"));
        }
        let mut sequence = String::new();
        while next_line(&mut self.reader, &mut self.line, &mut self.line_no)? {
            if self.line.starts_with('>') {
                self.pending_header = Some(self.line.clone());
                break;
            }
            sequence.extend(self.line.chars().filter(|c| !c.is_whitespace()));
        }
        Ok(Some(SequenceRecord::new(id, sequence)))
    }
}

impl<R: BufRead> Iterator for FastaReader<R> {
    type Item = io::Result<SequenceRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(rec)) => Some(Ok(rec)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Four-line FASTQ reader; quality strings are checked for length and dropped.
pub struct FastqReader<R: BufRead> {
    reader: R,
    line: String,
    line_no: u64,
    done: bool,
}

impl<R: BufRead> FastqReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
            line_no: 0,
            done: false,
        }
    }

    fn read_record(&mut self) -> io::Result<Option<SequenceRecord>> {
        let header = loop {
            if !next_line(&mut self.reader, &mut self.line, &mut self.line_no)? {
                return Ok(None);
            }
            if !self.line.trim().is_empty() {
                break self.line.clone();
            }
        };
        if !header.starts_with('@') {
            return Err(invalid(self.line_no, "FASTQ record does not start with '@'"));
        }
        let id = header_id(&header).to_string();

        if !next_line(&mut self.reader, &mut self.line, &mut self.line_no)? {
            return Err(invalid(self.line_no, format!("truncated record {id}")));
        }
        let sequence = self.line.trim().to_string();

        if !next_line(&mut self.reader, &mut self.line, &mut self.line_no)? || !self.line.starts_with('+') {
            return Err(invalid(self.line_no, format!("missing '+' separator in record {id}")));
        }
        if !next_line(&mut self.reader, &mut self.line, &mut self.line_no)? {
            return Err(invalid(self.line_no, format!("missing quality line in record {id}")));
        }
        if self.line.trim().len() != sequence.len() {
            return Err(invalid(
                self.line_no,
                format!("quality length differs from sequence length in record {id}"),
            ));
        }
        Ok(Some(SequenceRecord { id, sequence }))
    }
}

impl<R: BufRead> Iterator for FastqReader<R> {
    type Item = io::Result<SequenceRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(rec)) => Some(Ok(rec)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Wrap an open reader as FASTA or FASTQ depending on its first non-blank byte.
///
/// # Errors
/// Returns an error if the stream cannot be peeked.
pub fn records_from_reader(mut reader: DynBufRead) -> io::Result<RecordStream> {
    let marker = loop {
        let buf = reader.fill_buf()?;
        match buf.iter().position(|b| !b.is_ascii_whitespace()) {
            Some(pos) => break Some(buf[pos]),
            None if buf.is_empty() => break None,
            None => {
                let n = buf.len();
                reader.consume(n);
            }
        }
    };
    Ok(match marker {
        Some(b'@') => Box::new(FastqReader::new(reader)),
        _ => Box::new(FastaReader::new(reader)),
    })
}

/// Open a (possibly compressed) FASTA or FASTQ file as a record stream.
///
/// # Errors
/// Returns an error if the file cannot be opened or decompressed.
pub fn open_records(path: impl AsRef<Path>) -> Result<RecordStream> {
    let path = path.as_ref();
    let reader = open_reader(path)?;
    records_from_reader(reader).with_context(|| format!("read {}", path.display()))
}

/// Write one record as two-line FASTA.
pub fn write_record<W: Write>(writer: &mut W, record: &SequenceRecord) -> io::Result<()> {
    writeln!(writer, ">{}\n{}", record.id, record.sequence)
}

/// Write records as two-line FASTA and flush.
///
/// # Errors
/// Propagates write failures.
pub fn write_fasta<'a, W: Write>(
    mut writer: W,
    records: impl IntoIterator<Item = &'a SequenceRecord>,
) -> io::Result<usize> {
    let mut n = 0usize;
    for rec in records {
        write_record(&mut writer, rec)?;
        n += 1;
    }
    writer.flush()?;
    Ok(n)
}
