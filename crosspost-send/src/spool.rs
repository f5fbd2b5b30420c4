//! Spool directory of submission files
//!
//! Every `*.json` file in the spool holds one serialized `Submission`. Once a
//! file has been looked at it is renamed, so a restarted daemon never posts
//! the same file twice: `name.json.queued` when it was enqueued,
//! `name.json.rejected` when it could not be read or enqueued.

use anyhow::{Context, Result};
use libcrosspost::{Orchestrator, Submission};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const QUEUED_SUFFIX: &str = "json.queued";
pub const REJECTED_SUFFIX: &str = "json.rejected";

pub struct Spool {
    dir: PathBuf,
}

impl Spool {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Submission files not yet picked up, in name order
    pub fn pending(&self) -> Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read spool {}", self.dir.display()))?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();
        Ok(files)
    }

    pub fn load(path: &Path) -> Result<Submission> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid submission {}", path.display()))
    }

    /// Enqueue every pending file, returning how many were queued
    pub fn collect(&self, orchestrator: &Orchestrator) -> usize {
        let files = match self.pending() {
            Ok(files) => files,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Cannot scan spool");
                return 0;
            }
        };

        let mut queued = 0;
        for path in files {
            let outcome = Self::load(&path).and_then(|submission| {
                let id = submission.id.clone();
                orchestrator.enqueue(submission)?;
                Ok(id)
            });
            match outcome {
                Ok(id) => {
                    // An unmarked file would be picked up again on the next scan
                    if let Err(e) = std::fs::rename(&path, path.with_extension(QUEUED_SUFFIX)) {
                        let outcome = orchestrator.cancel(&id);
                        warn!(
                            file = %path.display(),
                            error = %e,
                            ?outcome,
                            "Cannot mark spool file, withdrawing submission"
                        );
                        continue;
                    }
                    queued += 1;
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %format!("{:#}", e), "Rejected spool file");
                    if let Err(e) = std::fs::rename(&path, path.with_extension(REJECTED_SUFFIX)) {
                        warn!(file = %path.display(), error = %e, "Cannot mark spool file");
                    }
                }
            }
        }

        if queued > 0 {
            info!(queued, "Picked up spooled submissions");
        }
        queued
    }
}
