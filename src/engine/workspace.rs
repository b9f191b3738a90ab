//! Output workspace for one rank of a job.

use crate::error::Result;
use crate::model::JobRecord;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tracing::debug;

/// Where a job's outputs go. Shared by all ranks; only the log file is
/// per-rank.
#[derive(Debug, Clone)]
pub struct Workspace {
    /// Output directory relative to the results root, as stored on the job.
    pub relative: PathBuf,
    /// Absolute output directory.
    pub dir: PathBuf,
    pub log_file: PathBuf,
    /// Rendezvous file for the workload's own distributed init.
    pub distributed_init_file: PathBuf,
}

impl Workspace {
    /// Layout: `<results>/<project>/<experiment>/<job>_<id suffix>`.
    pub fn for_job(results_dir: &Path, job: &JobRecord, rank: u32) -> Self {
        let relative = PathBuf::from(&job.project)
            .join(&job.experiment)
            .join(format!("{}_{}", job.job, job.id.suffix()));
        let dir = results_dir.join(&relative);
        let log_name = if rank == 0 {
            "output.txt".to_string()
        } else {
            format!("output.worker{rank}.txt")
        };

        Self {
            log_file: dir.join(log_name),
            distributed_init_file: dir.join("dist_init"),
            relative,
            dir,
        }
    }

    /// Create the output directory (idempotent, every rank calls it).
    pub async fn create(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        debug!(dir = %self.dir.display(), "output directory ready");
        Ok(())
    }

    /// Open this rank's log file for appending.
    pub async fn open_log(&self) -> Result<File> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
            .await?;
        Ok(file)
    }

    /// Write the effective config next to the outputs.
    pub async fn write_config(&self, config: &Map<String, Value>) -> Result<()> {
        let json = serde_json::to_string_pretty(config)?;
        tokio::fs::write(self.dir.join("config.json"), json).await?;
        Ok(())
    }

    pub fn relative_display(&self) -> String {
        self.relative.to_string_lossy().into_owned()
    }
}
