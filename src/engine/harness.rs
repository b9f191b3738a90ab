//! Execution harness: claims a slot, sets the job up, runs the workload and
//! records how it ended.
//!
//! Status writes are conditional on the current status, so terminal states
//! are written at most once. Rank 0 owns `RUNNING` and `FINISHED`; any rank
//! may mark the job `FAILED` or `CANCELED`.

use crate::config::Config;
use crate::db::{Claim, ClaimFilter, JobStore, JobUpdate, WriteConcern};
use crate::error::{Error, Result};
use crate::model::{JobId, JobRecord, LogKind, Status};
use crate::telemetry::job::{record_status_transition, start_job_span};
use crate::telemetry::metrics;
use crate::workload::{JobParams, WorkloadContext, WorkloadError, WorkloadRegistry};
use anyhow::anyhow;
use chrono::Utc;
use futures::FutureExt;
use opentelemetry::KeyValue;
use serde_json::{Map, Value};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, error, info, warn};

use super::barrier::{JOBSTART, await_barrier};
use super::claim::claim_next;
use super::liveness::LivenessMonitor;
use super::sink::TelemetrySink;
use super::workspace::Workspace;

/// Configuration for the harness.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Root directory for job outputs.
    pub results_dir: PathBuf,
    pub heartbeat_interval: Duration,
    pub barrier_poll_interval: Duration,
    /// Delay between claim attempts when the queue is empty.
    pub queue_backoff: Duration,
    /// How long teardown waits for the liveness monitor to stop.
    pub shutdown_grace: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from("/tmp/jobmonitor-results"),
            heartbeat_interval: Duration::from_secs(10),
            barrier_poll_interval: Duration::from_secs(2),
            queue_backoff: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

impl From<&Config> for HarnessConfig {
    fn from(config: &Config) -> Self {
        Self {
            results_dir: config.results_dir.clone(),
            heartbeat_interval: config.heartbeat_interval,
            barrier_poll_interval: config.barrier_poll_interval,
            queue_backoff: config.queue_backoff,
            ..Self::default()
        }
    }
}

/// What one harness run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Nothing was claimed.
    Idle,
    /// A slot was claimed and this rank ended with `status`.
    Completed {
        job_id: JobId,
        rank: u32,
        status: Status,
    },
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Idle => 0,
            RunOutcome::Completed { status, .. } => match status {
                Status::Failed => 1,
                Status::Canceled => 2,
                _ => 0,
            },
        }
    }
}

/// Runs one job slot per call.
pub struct Harness {
    store: Arc<dyn JobStore>,
    registry: Arc<WorkloadRegistry>,
    config: HarnessConfig,
    cancel: CancellationToken,
}

impl Harness {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<WorkloadRegistry>,
        config: HarnessConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that cancels the claim loop and the running workload. Signal
    /// handlers and the liveness monitor fire it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Claim a slot matching `filter` and run it to completion.
    pub async fn run(&self, filter: &ClaimFilter) -> Result<RunOutcome> {
        let claim = claim_next(
            &*self.store,
            filter,
            self.config.queue_backoff,
            &self.cancel,
        )
        .await?;

        match claim {
            Some(claim) => self.execute(claim).await,
            None => Ok(RunOutcome::Idle),
        }
    }

    /// Run an already claimed slot.
    pub async fn execute(&self, claim: Claim) -> Result<RunOutcome> {
        let span = start_job_span(&claim.job.id, claim.rank, claim.job.n_workers);
        self.execute_in_span(claim, span.clone())
            .instrument(span)
            .await
    }

    async fn execute_in_span(&self, claim: Claim, span: Span) -> Result<RunOutcome> {
        let Claim { job, rank } = claim;
        let job_id = job.id;

        let workspace = Workspace::for_job(&self.config.results_dir, &job, rank);
        workspace.create().await?;

        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        self.store
            .update(
                job_id,
                &[JobUpdate::Worker {
                    rank,
                    host: host.clone(),
                    pid: std::process::id(),
                }],
                WriteConcern::Acknowledged,
            )
            .await?;

        await_barrier(
            &*self.store,
            job_id,
            JOBSTART,
            job.n_workers,
            &Status::STARTUP,
            self.config.barrier_poll_interval,
        )
        .await?;

        if rank == 0 {
            let started = self
                .set_status(
                    &span,
                    job_id,
                    &[Status::Scheduled],
                    Status::Running,
                    &[
                        JobUpdate::Host(host),
                        JobUpdate::StartTime(Utc::now()),
                        JobUpdate::OutputDir(workspace.relative_display()),
                    ],
                )
                .await?;
            if !started {
                let status = self
                    .store
                    .status(job_id)
                    .await?
                    .ok_or(Error::JobMissing(job_id))?;
                warn!(%status, "job changed status before it could start");
                return Ok(RunOutcome::Completed {
                    job_id,
                    rank,
                    status,
                });
            }
        }

        let liveness = LivenessMonitor::start(
            Arc::clone(&self.store),
            job_id,
            rank,
            self.config.heartbeat_interval,
            self.cancel.clone(),
        );

        let log_file = match workspace.open_log().await {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(path = %workspace.log_file.display(), "cannot open log file: {e}");
                None
            }
        };
        info!(path = %workspace.log_file.display(), "starting, output piped to log file");
        let sink = TelemetrySink::spawn(
            Arc::clone(&self.store),
            job_id,
            rank,
            job.n_workers,
            workspace.dir.clone(),
            log_file,
        );

        let started = Instant::now();
        let result = self.invoke(&job, rank, &workspace, &sink).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        // From here on the harness owns the status; the monitor must not
        // react to our own terminal write.
        liveness.begin_shutdown();
        let status = self.record_result(&span, &job, rank, result, &sink).await;
        liveness.stop(self.config.shutdown_grace).await;
        sink.close(self.config.shutdown_grace).await;

        let status = status?;
        metrics::workload_duration_ms().record(
            elapsed_ms,
            &[KeyValue::new("outcome", status.as_str().to_ascii_lowercase())],
        );
        Ok(RunOutcome::Completed {
            job_id,
            rank,
            status,
        })
    }

    /// Resolve the workload and its config, then run it until it returns,
    /// panics, or the job is canceled.
    async fn invoke(
        &self,
        job: &JobRecord,
        rank: u32,
        workspace: &Workspace,
        sink: &TelemetrySink,
    ) -> std::result::Result<(), WorkloadError> {
        let script = &job.environment.script;
        let Some(mut workload) = self.registry.create(script) else {
            return Err(WorkloadError::Failed(anyhow!(
                "no workload registered for script {script:?}"
            )));
        };

        let config = resolve_config(
            workload.defaults(),
            &job.config,
            rank,
            job.n_workers,
            &workspace.distributed_init_file,
        );

        if rank == 0 {
            if let Err(e) = self
                .store
                .update(
                    job.id,
                    &[JobUpdate::Config(config.clone())],
                    WriteConcern::Acknowledged,
                )
                .await
            {
                warn!("failed to store effective config: {e}");
            }
            if let Err(e) = workspace.write_config(&config).await {
                warn!("failed to write config.json: {e}");
            }
        }

        let params = JobParams {
            job_id: job.id,
            rank,
            n_workers: job.n_workers,
            output_dir: workspace.dir.clone(),
            distributed_init_file: workspace.distributed_init_file.clone(),
            config,
        };
        workload.configure(&params)?;

        let ctx = WorkloadContext::new(params, sink.clone(), self.cancel.clone());
        let run = AssertUnwindSafe(workload.run(&ctx)).catch_unwind();

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(WorkloadError::Canceled),
            result = run => match result {
                Ok(result) => result,
                Err(panic) => Err(WorkloadError::Failed(anyhow!(
                    "workload panicked: {}",
                    panic_message(panic.as_ref())
                ))),
            },
        }
    }

    /// Write the status that matches the workload's result. Returns this
    /// rank's outcome, which may differ from the job's stored status.
    async fn record_result(
        &self,
        span: &Span,
        job: &JobRecord,
        rank: u32,
        result: std::result::Result<(), WorkloadError>,
        sink: &TelemetrySink,
    ) -> Result<Status> {
        let now = Utc::now();
        match result {
            Ok(()) => {
                info!("job finished successfully");
                if rank == 0 {
                    self.set_status(
                        span,
                        job.id,
                        &[Status::Running],
                        Status::Finished,
                        &[JobUpdate::EndTime(now)],
                    )
                    .await?;
                }
                Ok(Status::Finished)
            }
            Err(WorkloadError::Canceled) => {
                warn!("workload canceled");
                self.set_status(
                    span,
                    job.id,
                    &[Status::Scheduled, Status::Running],
                    Status::Canceled,
                    &[
                        JobUpdate::EndTime(now),
                        JobUpdate::Failure {
                            exception: "canceled".to_string(),
                            traceback: String::new(),
                            worker: rank,
                        },
                    ],
                )
                .await?;
                Ok(Status::Canceled)
            }
            Err(WorkloadError::Failed(err)) => {
                let traceback = format!("{err:?}");
                error!(error = %err, "workload failed");
                sink.log(&traceback, LogKind::Error);
                self.set_status(
                    span,
                    job.id,
                    &[Status::Scheduled, Status::Running],
                    Status::Failed,
                    &[
                        JobUpdate::EndTime(now),
                        JobUpdate::Failure {
                            exception: format!("{err:#}"),
                            traceback,
                            worker: rank,
                        },
                    ],
                )
                .await?;
                Ok(Status::Failed)
            }
        }
    }

    async fn set_status(
        &self,
        span: &Span,
        job_id: JobId,
        from: &[Status],
        to: Status,
        updates: &[JobUpdate],
    ) -> Result<bool> {
        let moved = self.store.transition(job_id, from, to, updates).await?;
        metrics::status_transitions().add(
            1,
            &[
                KeyValue::new("to", to.as_str()),
                KeyValue::new("result", if moved { "ok" } else { "skipped" }),
            ],
        );
        if moved {
            record_status_transition(span, from, to);
        } else {
            info!(to = %to, "status not written, job already moved on");
        }
        Ok(moved)
    }
}

/// Merge workload defaults, job overrides and the per-rank fields.
pub fn resolve_config(
    defaults: Map<String, Value>,
    overrides: &Map<String, Value>,
    rank: u32,
    n_workers: u32,
    distributed_init_file: &Path,
) -> Map<String, Value> {
    let mut config = defaults;
    for (key, value) in overrides {
        config.insert(key.clone(), value.clone());
    }
    config.insert("rank".to_string(), Value::from(rank));
    config.insert("n_workers".to_string(), Value::from(n_workers));
    config.insert(
        "distributed_init_file".to_string(),
        Value::from(distributed_init_file.to_string_lossy().into_owned()),
    );
    config
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
