//! Tests for FASTA/FASTQ streaming and TSV tables.

use ampbeam::io::fasta::{open_records, records_from_reader, write_fasta};
use ampbeam::io::table::{TableWriter, parse_table, read_table, write_table};
use ampbeam::record::normalize_sequence;
use ampbeam::*;
use anyhow::{Context, Result};
use std::io::{BufReader, Cursor};
use tempfile::tempdir;

fn parse(text: &str) -> Result<Vec<std::io::Result<SequenceRecord>>> {
    let reader = Box::new(BufReader::new(Cursor::new(text.as_bytes().to_vec())));
    Ok(records_from_reader(reader)?.collect())
}

#[test]
fn test_fasta_headers_are_cut_at_whitespace() -> Result<()> {
    let recs = parse(">contig_1 len=42 cov=3.1\nKWKL\nFKKI\n\n>contig_2\nGIGK\n")?;
    let recs = recs.into_iter().collect::<std::io::Result<Vec<_>>>()?;
    assert_eq!(recs[0], SequenceRecord::new("contig_1", "KWKLFKKI"));
    assert_eq!(recs[1], SequenceRecord::new("contig_2", "GIGK"));
    Ok(())
}

#[test]
fn test_fastq_is_detected_and_read() -> Result<()> {
    let recs = parse("@read1 1:N:0\nACGT\n+\nIIII\n@read2\nGGCC\n+read2\nIIII\n")?;
    let ids = recs
        .into_iter()
        .map(|r| r.map(|rec| rec.id))
        .collect::<std::io::Result<Vec<_>>>()?;
    assert_eq!(ids, ["read1", "read2"]);
    Ok(())
}

#[test]
fn test_malformed_fastq_reports_line_and_stops() -> Result<()> {
    let recs = parse("@read1\nACGT\n+\nIII\n@read2\nGGCC\n+\nIIII\n")?;
    assert_eq!(recs.len(), 1);
    let err = recs.into_iter().next().context("one item")?.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    assert!(err.to_string().contains("line 4"));
    Ok(())
}

#[test]
fn test_empty_stream_has_no_records() -> Result<()> {
    assert!(parse("")?.is_empty());
    assert!(parse("\n\n")?.is_empty());
    Ok(())
}

#[test]
fn test_fasta_written_reads_back() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("out.faa.gz");
    let recs = vec![SequenceRecord::new("a", "KWK"), SequenceRecord::new("b", "GIG")];
    let file = ampbeam::io::compression::create_writer(&path)?;
    assert_eq!(write_fasta(file, &recs)?, 2);
    let back = open_records(&path)?.collect::<std::io::Result<Vec<_>>>()?;
    assert_eq!(back, recs);
    Ok(())
}

#[test]
fn test_normalization_ignores_case_and_whitespace() -> Result<()> {
    assert_eq!(normalize_sequence("kwk lf\tkk\n"), "KWKLFKK");
    assert_eq!(
        SequenceRecord::new("a", "gig k").key(),
        SequenceRecord::new("b", "GIGK").key()
    );
    Ok(())
}

#[test]
fn test_table_comment_and_header() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("prediction.tsv.gz");
    let columns = vec!["Access".to_string(), "AMP_probability".to_string()];
    let rows = vec![vec!["a".to_string(), "0.900".to_string()]];
    write_table(&path, Some("Prediction from ampbeam"), &columns, &rows)?;

    let (read_columns, read_rows) = read_table(&path, true)?;
    assert_eq!(read_columns, columns);
    assert_eq!(read_rows, rows);
    Ok(())
}

#[test]
fn test_ragged_rows_survive_parsing() -> Result<()> {
    let (columns, rows) = parse_table(b"Access\tScore\na\t1\nb\n".to_vec(), true)?;
    assert_eq!(columns.len(), 2);
    assert_eq!(rows[1], ["b"]);
    Ok(())
}

#[test]
fn test_table_writer_counts_rows() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("clusters.tsv");
    let mut w = TableWriter::create(&path, None, &["Access", "Sequence", "Members"])?;
    w.write_row(["smORF_1", "KWK", "a b"])?;
    w.write_row(["smORF_2", "GIG", "c"])?;
    assert_eq!(w.finish()?, 2);
    let (_, rows) = read_table(&path, true)?;
    assert_eq!(rows[0][2], "a b");
    Ok(())
}
