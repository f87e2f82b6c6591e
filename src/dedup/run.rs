//! Sorted run files.
//!
//! A run is a sequence of frames, each a little-endian `u32` length followed
//! by a postcard-encoded `(key, value)` pair. Runs live in the workspace as
//! [`Artifact`]s; a [`RunReader`] owns its artifact, so the file disappears
//! as soon as the merge has drained it.

use crate::error::PipelineError;
use crate::plan::Stage;
use crate::workspace::{Artifact, Workspace};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};

/// A dedup key with one of its values.
pub type Pair = (String, String);

/// Appends frames to a new run artifact.
pub struct RunWriter {
    out: BufWriter<File>,
    artifact: Artifact,
}

impl RunWriter {
    /// # Errors
    /// Returns [`PipelineError::Io`] if the run file cannot be created.
    pub fn create(workspace: &Workspace) -> Result<Self, PipelineError> {
        let artifact = workspace.artifact(Stage::Dedup, ".run")?;
        let file = File::create(artifact.path()).map_err(|e| {
            PipelineError::io(Stage::Dedup, format!("create run {}", artifact.path().display()), e)
        })?;
        Ok(Self {
            out: BufWriter::new(file),
            artifact,
        })
    }

    fn io_error(&self, e: io::Error) -> PipelineError {
        PipelineError::io(Stage::Dedup, format!("write run {}", self.artifact.path().display()), e)
    }

    /// # Errors
    /// Returns [`PipelineError::DedupFailure`] if the pair cannot be encoded.
    pub fn push(&mut self, pair: &Pair) -> Result<(), PipelineError> {
        let frame = postcard::to_allocvec(pair)
            .map_err(|e| PipelineError::DedupFailure(format!("encode pair for key `{}`: {e}", pair.0)))?;
        let len = u32::try_from(frame.len())
            .map_err(|_| PipelineError::DedupFailure(format!("pair for key `{}` exceeds 4 GiB", pair.0)))?;
        self.out
            .write_all(&len.to_le_bytes())
            .and_then(|()| self.out.write_all(&frame))
            .map_err(|e| self.io_error(e))?;
        Ok(())
    }

    /// Flush and hand back the finished run.
    ///
    /// # Errors
    /// Returns [`PipelineError::Io`] if the flush fails.
    pub fn finish(mut self) -> Result<Artifact, PipelineError> {
        self.out.flush().map_err(|e| self.io_error(e))?;
        Ok(self.artifact)
    }
}

/// Spill an already sorted bucket into a new run artifact.
///
/// # Errors
/// See [`RunWriter`].
pub fn write_run(workspace: &Workspace, pairs: &[Pair]) -> Result<Artifact, PipelineError> {
    let mut writer = RunWriter::create(workspace)?;
    for pair in pairs {
        writer.push(pair)?;
    }
    writer.finish()
}

/// Streams the pairs of one run back in order.
pub struct RunReader {
    reader: BufReader<File>,
    artifact: Artifact,
    frame: Vec<u8>,
    done: bool,
}

impl RunReader {
    /// # Errors
    /// Returns [`PipelineError::Io`] if the run cannot be opened.
    pub fn open(artifact: Artifact) -> Result<Self, PipelineError> {
        let file = File::open(artifact.path()).map_err(|e| {
            PipelineError::io(Stage::Dedup, format!("open run {}", artifact.path().display()), e)
        })?;
        Ok(Self {
            reader: BufReader::new(file),
            artifact,
            frame: Vec::new(),
            done: false,
        })
    }

    fn read_frame(&mut self) -> io::Result<Option<Pair>> {
        if self.reader.fill_buf()?.is_empty() {
            return Ok(None);
        }
        let mut len = [0u8; 4];
        self.reader.read_exact(&mut len)?;
        self.frame.resize(u32::from_le_bytes(len) as usize, 0);
        self.reader.read_exact(&mut self.frame)?;
        postcard::from_bytes(&self.frame)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl Iterator for RunReader {
    type Item = Result<Pair, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_frame() {
            Ok(Some(pair)) => Some(Ok(pair)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(PipelineError::DedupFailure(format!(
                    "corrupt run {}: {e}",
                    self.artifact.path().display()
                ))))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_file_round_trip_and_cleanup() {
        let ws = Workspace::create(None).unwrap();
        let pairs = vec![("AAK".to_string(), "x".to_string()), ("KKW".to_string(), "y".to_string())];
        let artifact = write_run(&ws, &pairs).unwrap();
        let path = artifact.path().to_path_buf();
        let reader = RunReader::open(artifact).unwrap();
        let back: Vec<Pair> = reader.collect::<Result<_, _>>().unwrap();
        assert_eq!(back, pairs);
        assert!(!path.exists());
    }

    #[test]
    fn truncated_run_is_dedup_failure() {
        let ws = Workspace::create(None).unwrap();
        let artifact = write_run(&ws, &[("AAK".into(), "x".into())]).unwrap();
        let bytes = std::fs::read(artifact.path()).unwrap();
        std::fs::write(artifact.path(), &bytes[..bytes.len() - 1]).unwrap();
        let mut reader = RunReader::open(artifact).unwrap();
        assert!(matches!(reader.next(), Some(Err(PipelineError::DedupFailure(_)))));
        assert!(reader.next().is_none());
    }
}
