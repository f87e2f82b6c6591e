//! In-process composition descriptors.
//!
//! A small, dependency-free descriptor set that is enough to drive a
//! classifier in tests and demos. Values are formatted with fixed precision
//! so outputs are byte-stable across runs.

use crate::aggregate::{ACCESS, SEQUENCE};
use crate::executor::{ChunkTransform, StageResult};
use crate::partition::Chunk;
use anyhow::{Result, ensure};

pub const LENGTH: &str = "Length";
pub const NET_CHARGE: &str = "Net_charge";
pub const HYDROPHOBIC_FRACTION: &str = "Hydrophobic_fraction";
pub const AROMATIC_FRACTION: &str = "Aromatic_fraction";
pub const MEAN_HYDROPATHY: &str = "Mean_hydropathy";

/// Kyte-Doolittle hydropathy; 0 for anything that is not a standard residue.
fn hydropathy(residue: u8) -> f64 {
    match residue {
        b'A' => 1.8,
        b'R' => -4.5,
        b'N' | b'D' | b'Q' | b'E' => -3.5,
        b'C' => 2.5,
        b'G' => -0.4,
        b'H' => -3.2,
        b'I' => 4.5,
        b'L' => 3.8,
        b'K' => -3.9,
        b'M' => 1.9,
        b'F' => 2.8,
        b'P' => -1.6,
        b'S' => -0.8,
        b'T' => -0.7,
        b'W' => -0.9,
        b'Y' => -1.3,
        b'V' => 4.2,
        _ => 0.0,
    }
}

/// Per-peptide descriptor values.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Descriptors {
    pub length: usize,
    pub net_charge: i64,
    pub hydrophobic_fraction: f64,
    pub aromatic_fraction: f64,
    pub mean_hydropathy: f64,
}

impl Descriptors {
    /// Compute descriptors of an (upper-case) peptide sequence.
    #[must_use]
    pub fn of(sequence: &str) -> Self {
        let bytes = sequence.as_bytes();
        let length = bytes.len();
        let mut charge = 0i64;
        let mut hydrophobic = 0usize;
        let mut aromatic = 0usize;
        let mut hydropathy_sum = 0.0;
        for &b in bytes {
            match b {
                b'K' | b'R' => charge += 1,
                b'D' | b'E' => charge -= 1,
                _ => {}
            }
            if matches!(b, b'A' | b'I' | b'L' | b'M' | b'F' | b'V' | b'W' | b'C') {
                hydrophobic += 1;
            }
            if matches!(b, b'F' | b'W' | b'Y') {
                aromatic += 1;
            }
            hydropathy_sum += hydropathy(b);
        }
        let n = length.max(1) as f64;
        Self {
            length,
            net_charge: charge,
            hydrophobic_fraction: hydrophobic as f64 / n,
            aromatic_fraction: aromatic as f64 / n,
            mean_hydropathy: hydropathy_sum / n,
        }
    }

    fn row(&self, id: &str, sequence: &str) -> Vec<String> {
        vec![
            id.to_string(),
            sequence.to_string(),
            self.length.to_string(),
            self.net_charge.to_string(),
            format!("{:.4}", self.hydrophobic_fraction),
            format!("{:.4}", self.aromatic_fraction),
            format!("{:.4}", self.mean_hydropathy),
        ]
    }
}

/// Header produced by [`BasicDescriptors`].
#[must_use]
pub fn descriptor_columns() -> Vec<String> {
    [
        ACCESS,
        SEQUENCE,
        LENGTH,
        NET_CHARGE,
        HYDROPHOBIC_FRACTION,
        AROMATIC_FRACTION,
        MEAN_HYDROPATHY,
    ]
    .map(String::from)
    .to_vec()
}

/// Descriptor stage computing [`Descriptors`] for every record of a chunk.
#[derive(Clone, Copy, Debug, Default)]
pub struct BasicDescriptors;

impl ChunkTransform<Chunk> for BasicDescriptors {
    fn name(&self) -> &str {
        "basic-descriptors"
    }

    fn apply(&self, input: &Chunk) -> Result<StageResult> {
        let mut rows = Vec::with_capacity(input.records.len());
        for rec in &input.records {
            ensure!(!rec.sequence.is_empty(), "record `{}` has an empty sequence", rec.id);
            rows.push(Descriptors::of(&rec.sequence).row(&rec.id, &rec.sequence));
        }
        Ok(StageResult::new(input.index, descriptor_columns(), rows))
    }
}
