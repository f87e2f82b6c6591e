//! Chunk partitioning of unbounded record streams.
//!
//! [`ChunkPartitioner`] turns any stream of [`SequenceRecord`]s into
//! size-bounded [`Chunk`]s without ever holding more than one chunk in
//! memory. Boundaries fall between records only, so concatenating chunk
//! records in index order gives back the input exactly. The partitioner does
//! not know which stage it feeds; the controller reuses it for contigs,
//! deduplicated representatives, and the aggregated table alike.
//!
//! ```
//! use ampbeam::partition::{ByteSize, partition_all};
//! use ampbeam::record::SequenceRecord;
//!
//! let recs = (0..10).map(|i| Ok(SequenceRecord::new(format!("s{i}"), "KWKLFKKIGAVLKVL")));
//! // each record is 20 bytes as FASTA; 45 bytes fit two records per chunk
//! let chunks = partition_all(recs, "45".parse::<ByteSize>().unwrap()).unwrap();
//! assert_eq!(chunks.len(), 5);
//! assert!(chunks.iter().enumerate().all(|(i, c)| c.index == i));
//! ```

use crate::error::PipelineError;
use crate::plan::Stage;
use crate::record::SequenceRecord;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FormatResult};
use std::io;
use std::str::FromStr;
use thiserror::Error;

/// A byte budget such as `100M` or `2G`.
///
/// Suffixes `K`, `M`, `G`, `T` are binary multiples and case-insensitive; an
/// optional trailing `B` or `iB` is accepted, as are fractional values
/// (`1.5G`). Zero is rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "ByteSizeRepr", into = "String")]
pub struct ByteSize(u64);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid byte size `{0}`: expected a positive number with an optional K/M/G/T suffix")]
pub struct ParseByteSizeError(pub String);

impl ByteSize {
    /// # Panics
    /// Panics if `bytes` is zero.
    #[must_use]
    pub const fn new(bytes: u64) -> Self {
        assert!(bytes > 0, "byte size must be positive");
        Self(bytes)
    }

    #[must_use]
    pub const fn bytes(self) -> u64 {
        self.0
    }

    /// Budget as `usize`, saturating on 32-bit targets.
    #[must_use]
    pub fn as_usize(self) -> usize {
        usize::try_from(self.0).unwrap_or(usize::MAX)
    }
}

impl FromStr for ByteSize {
    type Err = ParseByteSizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseByteSizeError(s.to_string());
        let trimmed = s.trim();
        let split = trimmed
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(trimmed.len());
        let (number, unit) = trimmed.split_at(split);
        let value: f64 = number.parse().map_err(|_| err())?;
        let unit = unit.trim().to_ascii_uppercase();
        let unit = unit
            .strip_suffix("IB")
            .or_else(|| unit.strip_suffix('B'))
            .unwrap_or(unit.as_str());
        let scale: u64 = match unit {
            "" => 1,
            "K" => 1 << 10,
            "M" => 1 << 20,
            "G" => 1 << 30,
            "T" => 1 << 40,
            _ => return Err(err()),
        };
        let bytes = (value * scale as f64).round();
        if !bytes.is_finite() || bytes < 1.0 || bytes > u64::MAX as f64 {
            return Err(err());
        }
        Ok(Self(bytes as u64))
    }
}

impl Display for ByteSize {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        const UNITS: [(u64, &str); 4] = [(1 << 40, "T"), (1 << 30, "G"), (1 << 20, "M"), (1 << 10, "K")];
        for (scale, suffix) in UNITS {
            if self.0 >= scale && self.0 % scale == 0 {
                return write!(f, "{}{suffix}", self.0 / scale);
            }
        }
        write!(f, "{}", self.0)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ByteSizeRepr {
    Bytes(u64),
    Text(String),
}

impl TryFrom<ByteSizeRepr> for ByteSize {
    type Error = ParseByteSizeError;

    fn try_from(repr: ByteSizeRepr) -> Result<Self, Self::Error> {
        match repr {
            ByteSizeRepr::Bytes(0) => Err(ParseByteSizeError("0".into())),
            ByteSizeRepr::Bytes(n) => Ok(Self(n)),
            ByteSizeRepr::Text(s) => s.parse(),
        }
    }
}

impl From<ByteSize> for String {
    fn from(size: ByteSize) -> Self {
        size.to_string()
    }
}

/// A contiguous, size-bounded run of records; the unit of parallel work.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    /// Position in the stream, starting at 0 with no gaps.
    pub index: usize,
    pub records: Vec<SequenceRecord>,
    /// Size of `records` when written as FASTA.
    pub bytes: usize,
}

impl Chunk {
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Lazily splits a record stream into [`Chunk`]s of at most `budget` bytes.
///
/// A record larger than the budget becomes a chunk of its own. An empty
/// stream yields a single [`PipelineError::EmptyInput`]. A read error is
/// reported once as [`PipelineError::FatalInput`] and ends the iteration.
pub struct ChunkPartitioner<I> {
    source: I,
    budget: usize,
    pending: Option<SequenceRecord>,
    next_index: usize,
    stage: Stage,
    source_name: String,
    done: bool,
}

impl<I> ChunkPartitioner<I>
where
    I: Iterator<Item = io::Result<SequenceRecord>>,
{
    pub fn new(source: I, budget: ByteSize) -> Self {
        Self {
            source,
            budget: budget.as_usize(),
            pending: None,
            next_index: 0,
            stage: Stage::Ingest,
            source_name: "<stream>".into(),
            done: false,
        }
    }

    /// Attribute errors to `stage` and name the source in messages.
    #[must_use]
    pub fn for_stage(mut self, stage: Stage, source_name: impl Into<String>) -> Self {
        self.stage = stage;
        self.source_name = source_name.into();
        self
    }

    /// Number of chunks emitted so far.
    #[must_use]
    pub fn emitted(&self) -> usize {
        self.next_index
    }
}

impl<I> Iterator for ChunkPartitioner<I>
where
    I: Iterator<Item = io::Result<SequenceRecord>>,
{
    type Item = Result<Chunk, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut records = Vec::new();
        let mut bytes = 0usize;
        if let Some(rec) = self.pending.take() {
            bytes += rec.fasta_len();
            records.push(rec);
        }
        loop {
            match self.source.next() {
                None => break,
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(PipelineError::FatalInput {
                        stage: self.stage,
                        message: format!("reading {}: {e}", self.source_name),
                    }));
                }
                Some(Ok(rec)) => {
                    let len = rec.fasta_len();
                    if !records.is_empty() && bytes + len > self.budget {
                        self.pending = Some(rec);
                        break;
                    }
                    bytes += len;
                    records.push(rec);
                }
            }
        }

        if records.is_empty() {
            self.done = true;
            if self.next_index == 0 {
                return Some(Err(PipelineError::EmptyInput {
                    stage: self.stage,
                    source_name: self.source_name.clone(),
                }));
            }
            return None;
        }
        let chunk = Chunk {
            index: self.next_index,
            records,
            bytes,
        };
        self.next_index += 1;
        Some(Ok(chunk))
    }
}

/// Partition an entire stream eagerly.
///
/// # Errors
/// Returns the first error produced by [`ChunkPartitioner`].
pub fn partition_all<I>(source: I, budget: ByteSize) -> Result<Vec<Chunk>, PipelineError>
where
    I: IntoIterator<Item = io::Result<SequenceRecord>>,
{
    ChunkPartitioner::new(source.into_iter(), budget).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_suffixes() {
        assert_eq!("512".parse::<ByteSize>().unwrap().bytes(), 512);
        assert_eq!("4k".parse::<ByteSize>().unwrap().bytes(), 4096);
        assert_eq!("100M".parse::<ByteSize>().unwrap().bytes(), 100 << 20);
        assert_eq!("1.5GiB".parse::<ByteSize>().unwrap().bytes(), 3 << 29);
        assert_eq!("2TB".parse::<ByteSize>().unwrap().bytes(), 2 << 40);
        assert!("0".parse::<ByteSize>().is_err());
        assert!("10X".parse::<ByteSize>().is_err());
        assert!("M".parse::<ByteSize>().is_err());
    }

    #[test]
    fn displays_compactly() {
        assert_eq!(ByteSize::new(100 << 20).to_string(), "100M");
        assert_eq!(ByteSize::new(1000).to_string(), "1000");
    }

    #[test]
    fn oversized_record_gets_its_own_chunk() {
        let recs = vec![
            Ok(SequenceRecord::new("a", "KK")),
            Ok(SequenceRecord::new("big", "K".repeat(100))),
            Ok(SequenceRecord::new("b", "KK")),
        ];
        let chunks = partition_all(recs, ByteSize::new(20)).unwrap();
        let sizes: Vec<_> = chunks.iter().map(Chunk::len).collect();
        assert_eq!(sizes, vec![1, 1, 1]);
        assert_eq!(chunks[1].records[0].id, "big");
    }

    #[test]
    fn empty_stream_is_fatal_input() {
        let err = partition_all(Vec::new(), ByteSize::new(10)).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyInput { .. }));
    }
}
