//! Scoped temporary workspace for one run.
//!
//! The workspace is a single directory created at run start. Dropping the
//! [`Workspace`] removes it recursively, so every exit path of the controller
//! (success, empty success, or fatal error) releases it. Individual chunk
//! files are [`Artifact`]s that delete themselves as soon as the stage that
//! consumes them lets go.

use crate::error::PipelineError;
use crate::plan::Stage;
use std::fs::{create_dir_all, remove_file};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tempfile::{Builder, TempDir};

/// Process-scoped temporary directory.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
    next_artifact: AtomicU64,
}

impl Workspace {
    /// Create a fresh workspace under `parent`, or under the system temp dir when `None`.
    ///
    /// # Errors
    /// Returns [`PipelineError::Io`] if the directory cannot be created.
    pub fn create(parent: Option<&Path>) -> Result<Self, PipelineError> {
        let mut builder = Builder::new();
        builder.prefix("ampbeam.");
        let dir = match parent {
            Some(parent) => {
                create_dir_all(parent).map_err(|e| {
                    PipelineError::io(Stage::Ingest, format!("create {}", parent.display()), e)
                })?;
                builder.tempdir_in(parent)
            }
            None => builder.tempdir(),
        }
        .map_err(|e| PipelineError::io(Stage::Ingest, "create temporary workspace", e))?;
        log::debug!("workspace created at {}", dir.path().display());
        Ok(Self {
            dir,
            next_artifact: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Directory reserved for `stage`, created on first use.
    ///
    /// # Errors
    /// Returns [`PipelineError::Io`] if the directory cannot be created.
    pub fn stage_dir(&self, stage: Stage) -> Result<PathBuf, PipelineError> {
        let dir = self.dir.path().join(stage.as_str());
        create_dir_all(&dir)
            .map_err(|e| PipelineError::io(stage, format!("create {}", dir.display()), e))?;
        Ok(dir)
    }

    /// Reserve a unique, self-deleting file path inside `stage`'s directory.
    ///
    /// # Errors
    /// Returns [`PipelineError::Io`] if the stage directory cannot be created.
    pub fn artifact(&self, stage: Stage, suffix: &str) -> Result<Artifact, PipelineError> {
        let n = self.next_artifact.fetch_add(1, Ordering::Relaxed);
        let path = self.stage_dir(stage)?.join(format!("{n:08}{suffix}"));
        Ok(Artifact { path })
    }

    /// Remove the workspace now, reporting failures instead of ignoring them.
    ///
    /// # Errors
    /// Returns the I/O error from the recursive removal.
    pub fn close(self) -> io::Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir.close()?;
        log::debug!("workspace {} removed", path.display());
        Ok(())
    }
}

/// A file inside the workspace that is deleted when dropped.
#[derive(Debug)]
pub struct Artifact {
    path: PathBuf,
}

impl Artifact {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Artifact {
    fn drop(&mut self) {
        if let Err(e) = remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            log::warn!("could not remove {}: {e}", self.path.display());
        }
    }
}
