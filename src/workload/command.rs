//! Workloads that run an external executable.
//!
//! The command runs in the job's output directory. Its resolved config is
//! passed as JSON in `JOBMONITOR_CONFIG` along with a few scalar
//! `JOBMONITOR_*` variables; stdout lines are logged as info and stderr
//! lines as errors.

use super::{JobParams, Workload, WorkloadContext, WorkloadError};
use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

/// A command workload as described in a workload TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandSpec {
    pub name: String,
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// Default config values the job may override.
    #[serde(default)]
    pub defaults: Map<String, Value>,
}

pub struct CommandWorkload {
    spec: CommandSpec,
    params: Option<JobParams>,
}

impl CommandWorkload {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec, params: None }
    }
}

#[async_trait]
impl Workload for CommandWorkload {
    fn defaults(&self) -> Map<String, Value> {
        self.spec.defaults.clone()
    }

    fn configure(&mut self, params: &JobParams) -> Result<(), WorkloadError> {
        self.params = Some(params.clone());
        Ok(())
    }

    async fn run(&mut self, ctx: &WorkloadContext) -> Result<(), WorkloadError> {
        let params = self.params.as_ref().unwrap_or(ctx.params());

        // Relative commands resolve against the worker's CWD, not the output
        // dir the child runs in.
        let command = if self.spec.command.is_relative() {
            std::env::current_dir()
                .context("cannot resolve working directory")?
                .join(&self.spec.command)
        } else {
            self.spec.command.clone()
        };

        debug!(command = %command.display(), rank = params.rank, "starting workload command");

        let config_json = serde_json::to_string(&params.config).context("serialize config")?;
        let mut child = Command::new(&command)
            .args(&self.spec.args)
            .current_dir(&params.output_dir)
            .env("JOBMONITOR_CONFIG", config_json)
            .env("JOBMONITOR_JOB_ID", params.job_id.to_string())
            .env("JOBMONITOR_RANK", params.rank.to_string())
            .env("JOBMONITOR_N_WORKERS", params.n_workers.to_string())
            .env("JOBMONITOR_OUTPUT_DIR", &params.output_dir)
            .env("JOBMONITOR_DIST_INIT_FILE", &params.distributed_init_file)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {}", command.display()))?;

        let stdout = child.stdout.take().context("child stdout not captured")?;
        let stderr = child.stderr.take().context("child stderr not captured")?;

        let pump_stdout = async {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                ctx.log(&line);
            }
            Ok::<_, std::io::Error>(())
        };
        let pump_stderr = async {
            let mut lines = BufReader::new(stderr).lines();
            while let Some(line) = lines.next_line().await? {
                ctx.log_error(&line);
            }
            Ok::<_, std::io::Error>(())
        };

        let (status, out, err) = tokio::join!(child.wait(), pump_stdout, pump_stderr);
        let status = status.context("failed to wait for workload command")?;
        if let Err(e) = out.and(err) {
            debug!("workload output stream ended early: {e}");
        }

        if status.success() {
            Ok(())
        } else {
            Err(WorkloadError::Failed(anyhow!(
                "{} exited with status {}",
                self.spec.name,
                status.code().unwrap_or(-1)
            )))
        }
    }
}
