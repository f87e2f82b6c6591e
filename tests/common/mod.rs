//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use ampbeam::aggregate::{
    ACCESS, ANTIGENICITY, PERCENT_SOLUBLE, PREDICTION_COLUMNS, SCALED_SOLUBILITY, SEQUENCE, SUSCEPTIBLE_TO_PROTEASES,
};
use ampbeam::stages::descriptors::NET_CHARGE;
use ampbeam::*;
use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};

pub fn strings(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| (*s).to_string()).collect()
}

/// Write `(id, sequence)` pairs as FASTA under `dir`.
pub fn fasta_file(dir: &Path, name: &str, records: &[(&str, &str)]) -> std::io::Result<PathBuf> {
    let mut text = String::new();
    for (id, seq) in records {
        text.push_str(&format!(">{id} some description\n{seq}\n"));
    }
    let path = dir.join(name);
    fs::write(&path, text)?;
    Ok(path)
}

/// Deterministic peptide generator (xorshift), lengths 12..=31.
pub fn peptides(n: usize, seed: u64) -> Vec<SequenceRecord> {
    const ALPHABET: &[u8] = b"ACDEFGHIKLMNPQRSTVWY";
    let mut state = seed.max(1);
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };
    (0..n)
        .map(|i| {
            let len = 12 + (next() % 20) as usize;
            let seq: String = (0..len)
                .map(|_| ALPHABET[(next() % ALPHABET.len() as u64) as usize] as char)
                .collect();
            SequenceRecord::new(format!("pep{i}"), seq)
        })
        .collect()
}

pub fn records_file(dir: &Path, name: &str, records: &[SequenceRecord]) -> std::io::Result<PathBuf> {
    let pairs: Vec<(&str, &str)> = records.iter().map(|r| (r.id.as_str(), r.sequence.as_str())).collect();
    fasta_file(dir, name, &pairs)
}

/// Whether the fixture classifier calls `sequence` an AMP.
pub fn is_amp(sequence: &str) -> bool {
    ampbeam::stages::descriptors::Descriptors::of(sequence).net_charge >= 2
}

/// Classifier over descriptor tables: AMP with probability 0.9 when the net
/// charge is at least 2, otherwise 0.1. Hemolytic when the peptide has a cysteine.
pub fn charge_classifier() -> impl ChunkTransform<StageResult> + 'static {
    FnTransform::new("charge-classifier", |input: &StageResult| -> anyhow::Result<StageResult> {
        let access = input.column_index(ACCESS).context("no Access column")?;
        let sequence = input.column_index(SEQUENCE).context("no Sequence column")?;
        let charge = input.column_index(NET_CHARGE).context("no charge column")?;
        let rows = input
            .rows
            .iter()
            .map(|r| -> anyhow::Result<Vec<String>> {
                let amp = r[charge].parse::<i64>()? >= 2;
                let hemolytic = r[sequence].contains('C');
                Ok(vec![
                    r[access].clone(),
                    r[sequence].clone(),
                    if amp { "CLP" } else { "NAMP" }.to_string(),
                    if amp { "0.900" } else { "0.100" }.to_string(),
                    if hemolytic { "Hemo" } else { "NonHemo" }.to_string(),
                    if hemolytic { "0.800" } else { "0.200" }.to_string(),
                ])
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(StageResult::new(
            input.chunk_index,
            PREDICTION_COLUMNS.map(String::from).to_vec(),
            rows,
        ))
    })
}

/// Enricher producing the four enrichment columns; peptides with a `W` are
/// very soluble, everything else is not.
pub fn property_enricher() -> impl ChunkTransform<Chunk> + 'static {
    FnTransform::new("properties", |chunk: &Chunk| -> anyhow::Result<StageResult> {
        let rows = chunk
            .records
            .iter()
            .map(|r| {
                let soluble = if r.sequence.contains('W') { "80.0" } else { "10.0" };
                vec![
                    r.id.clone(),
                    soluble.to_string(),
                    "1.0".to_string(),
                    "non-antigenic".to_string(),
                    "resistant".to_string(),
                ]
            })
            .collect();
        Ok(StageResult::new(
            chunk.index,
            strings(&[ACCESS, PERCENT_SOLUBLE, SCALED_SOLUBILITY, ANTIGENICITY, SUSCEPTIBLE_TO_PROTEASES]),
            rows,
        ))
    })
}

/// Configuration writing into `root/out` with a workspace under `root/tmp`.
pub fn config(mode: RunMode, inputs: Vec<PathBuf>, root: &Path) -> PipelineConfig {
    let mut cfg = PipelineConfig::new(mode, inputs, root.join("out"));
    cfg.threads = 2;
    cfg.memory_fraction = 0.1;
    cfg.tmpdir = Some(root.join("tmp"));
    cfg.tag = "test".into();
    cfg
}

/// Entries left in the workspace parent after a run.
pub fn leftover_workspaces(root: &Path) -> usize {
    match fs::read_dir(root.join("tmp")) {
        Ok(entries) => entries.count(),
        Err(_) => 0,
    }
}
