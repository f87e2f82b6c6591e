//! Input and output formats.
//!
//! - [`compression`]: extension/magic-byte codec detection
//! - [`fasta`]: streaming FASTA/FASTQ readers, FASTA writer
//! - [`table`]: tab-separated stage tables and reports

pub mod compression;
pub mod fasta;
pub mod table;
