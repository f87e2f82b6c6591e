//! Tests for transparent compression of inputs and outputs.

use ampbeam::io::compression::{Codec, create_writer, open_reader};
use ampbeam::io::fasta::open_records;
use std::fs::File;
use anyhow::Result;
use std::io::{BufRead, Read, Write};
use tempfile::tempdir;

const FASTA: &str = ">p1\nKWKLFKKIGAVLKVL\n>p2\nGIGKFLHSAKKFGKAFVGEIMNS\n";

fn round_trip(name: &str) -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join(name);
    let mut w = create_writer(&path)?;
    w.write_all(FASTA.as_bytes())?;
    w.flush()?;
    drop(w);

    let mut text = String::new();
    open_reader(&path)?.read_to_string(&mut text)?;
    assert_eq!(text, FASTA);

    let ids = open_records(&path)?
        .map(|r| r.map(|rec| rec.id))
        .collect::<std::io::Result<Vec<_>>>()?;
    assert_eq!(ids, ["p1", "p2"]);
    Ok(())
}

#[test]
fn test_plain_round_trip() -> Result<()> {
    round_trip("peptides.faa")
}

#[test]
fn test_gzip_round_trip() -> Result<()> {
    round_trip("peptides.faa.gz")
}

#[cfg(feature = "compression-zstd")]
#[test]
fn test_zstd_round_trip() -> Result<()> {
    round_trip("peptides.faa.zst")
}

#[cfg(feature = "compression-bzip2")]
#[test]
fn test_bzip2_round_trip() -> Result<()> {
    round_trip("peptides.faa.bz2")
}

#[cfg(feature = "compression-xz")]
#[test]
fn test_xz_round_trip() -> Result<()> {
    round_trip("peptides.faa.xz")
}

#[test]
fn test_gzip_is_detected_without_extension() -> Result<()> {
    let dir = tempdir()?;
    let gz = dir.path().join("reads.fa.gz");
    let mut w = create_writer(&gz)?;
    w.write_all(FASTA.as_bytes())?;
    w.flush()?;
    drop(w);
    let disguised = dir.path().join("reads.fa");
    std::fs::rename(&gz, &disguised)?;

    let mut head = [0u8; 2];
    File::open(&disguised)?.read_exact(&mut head)?;
    assert_eq!(Codec::sniff(&head), Some(Codec::Gzip));
    let lines = open_reader(&disguised)?.lines().count();
    assert_eq!(lines, 4);
    Ok(())
}

#[test]
fn test_concatenated_gzip_members_are_read_to_the_end() -> Result<()> {
    let dir = tempdir()?;
    let a = dir.path().join("a.fa.gz");
    let b = dir.path().join("b.fa.gz");
    for (path, text) in [(&a, ">x\nKK\n"), (&b, ">y\nWW\n")] {
        let mut w = create_writer(path)?;
        w.write_all(text.as_bytes())?;
        w.flush()?;
    }
    let mut joined = std::fs::read(&a)?;
    joined.extend(std::fs::read(&b)?);
    let both = dir.path().join("both.fa.gz");
    std::fs::write(&both, joined)?;

    let ids = open_records(&both)?
        .map(|r| r.map(|rec| rec.id))
        .collect::<std::io::Result<Vec<_>>>()?;
    assert_eq!(ids, ["x", "y"]);
    Ok(())
}

#[test]
fn test_codec_from_path() {
    assert_eq!(Codec::from_path("x.TSV.GZ"), Some(Codec::Gzip));
    assert_eq!(Codec::from_path("x.tsv"), None);
}
