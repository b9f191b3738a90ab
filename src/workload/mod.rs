//! The workload seam.
//!
//! A workload is the user computation a worker runs once it holds a slot.
//! The harness resolves its configuration, hands it a [`WorkloadContext`]
//! carrying the telemetry operations, and interprets the result.

pub mod command;
pub mod registry;

pub use command::{CommandSpec, CommandWorkload};
pub use registry::WorkloadRegistry;

use crate::engine::sink::{MetricValue, TelemetrySink};
use crate::model::{JobId, LogKind};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// How a workload run ended, short of success.
#[derive(Debug, thiserror::Error)]
pub enum WorkloadError {
    /// Interrupted by a signal or by the liveness monitor.
    #[error("canceled")]
    Canceled,
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Everything a workload learns about the slot it runs in.
#[derive(Debug, Clone)]
pub struct JobParams {
    pub job_id: JobId,
    pub rank: u32,
    pub n_workers: u32,
    /// Absolute output directory.
    pub output_dir: PathBuf,
    pub distributed_init_file: PathBuf,
    /// Resolved config: defaults, job overrides, then `rank`, `n_workers`
    /// and `distributed_init_file`.
    pub config: Map<String, Value>,
}

#[async_trait]
pub trait Workload: Send {
    /// Default config values. The job's config overrides them.
    fn defaults(&self) -> Map<String, Value> {
        Map::new()
    }

    /// Receive the resolved parameters before [`Workload::run`].
    fn configure(&mut self, _params: &JobParams) -> Result<(), WorkloadError> {
        Ok(())
    }

    async fn run(&mut self, ctx: &WorkloadContext) -> Result<(), WorkloadError>;
}

/// Handle passed to a running workload.
pub struct WorkloadContext {
    params: JobParams,
    sink: TelemetrySink,
    cancel: CancellationToken,
}

impl WorkloadContext {
    pub fn new(params: JobParams, sink: TelemetrySink, cancel: CancellationToken) -> Self {
        Self {
            params,
            sink,
            cancel,
        }
    }

    pub fn params(&self) -> &JobParams {
        &self.params
    }

    pub fn config(&self) -> &Map<String, Value> {
        &self.params.config
    }

    pub fn rank(&self) -> u32 {
        self.params.rank
    }

    pub fn n_workers(&self) -> u32 {
        self.params.n_workers
    }

    pub fn output_dir(&self) -> &Path {
        &self.params.output_dir
    }

    /// Fires when the job is canceled. Long-running workloads can poll it
    /// to stop cleanly; the harness drops the run future either way.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn log(&self, message: &str) {
        self.sink.log(message, LogKind::Info);
    }

    pub fn log_error(&self, message: &str) {
        self.sink.log(message, LogKind::Error);
    }

    pub fn log_info(&self, fields: Map<String, Value>) {
        self.sink.record_info(fields);
    }

    pub fn log_metric<I, K, V>(&self, measurement: &str, value: impl Into<MetricValue>, tags: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        self.sink.record_metric(measurement, value, tags);
    }

    pub fn log_image(&self, key: &str, path: &Path) {
        self.sink.record_image(key, path);
    }

    pub fn log_runtime(&self, event: &str, mean: f64, std: f64, instances: u64) {
        self.sink.record_timing(event, mean, std, instances);
    }
}
