//! Sequence records and key normalization.

use serde::{Deserialize, Serialize};

/// One named sequence: a read, a contig, or a peptide.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequenceRecord {
    /// Header up to the first whitespace.
    pub id: String,
    pub sequence: String,
}

impl SequenceRecord {
    pub fn new(id: impl Into<String>, sequence: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sequence: sequence.into(),
        }
    }

    /// Size of the record when written as two-line FASTA (`>id\nseq\n`).
    #[inline]
    #[must_use]
    pub fn fasta_len(&self) -> usize {
        self.id.len() + self.sequence.len() + 3
    }

    /// Dedup key for this record (see [`normalize_sequence`]).
    #[must_use]
    pub fn key(&self) -> String {
        normalize_sequence(&self.sequence)
    }
}

/// Strip all whitespace and upper-case a sequence.
///
/// ```
/// assert_eq!(ampbeam::record::normalize_sequence(" kwk\tvF kk\n"), "KWKVFKK");
/// ```
#[must_use]
pub fn normalize_sequence(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}
