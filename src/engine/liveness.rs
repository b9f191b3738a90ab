//! Liveness monitor: heartbeats out, cancellation in.
//!
//! A background task that, on every tick, re-reads the job's status and
//! writes a heartbeat for this rank. If the status is gone or no longer one
//! of [`Status::ALIVE`], the monitor fires the self-destruct token, which
//! the harness turns into a canceled workload and the binary into a process
//! exit.

use crate::db::{JobStore, JobUpdate, WriteConcern};
use crate::model::{JobId, Status};
use crate::telemetry::metrics;
use chrono::Utc;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Handle to a running liveness monitor.
pub struct LivenessMonitor {
    /// Latched once teardown begins; no self-destruct fires after that.
    stopping: Arc<AtomicBool>,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl LivenessMonitor {
    /// Spawn the monitor for `rank` of `job_id`. The first tick runs
    /// immediately.
    pub fn start(
        store: Arc<dyn JobStore>,
        job_id: JobId,
        rank: u32,
        interval: Duration,
        self_destruct: CancellationToken,
    ) -> Self {
        let stopping = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();

        let task = MonitorTask {
            store,
            job_id,
            rank,
            stopping: Arc::clone(&stopping),
            self_destruct,
        };
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if task.stopping.load(Ordering::SeqCst) {
                    break;
                }
                task.tick().await;
            }
            debug!(job_id = %task.job_id, rank = task.rank, "liveness monitor stopped");
        });

        Self {
            stopping,
            shutdown,
            handle,
        }
    }

    /// Latch the stopping flag. Call before writing a terminal status so the
    /// monitor cannot react to the harness's own write.
    pub fn begin_shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Stop the monitor and wait up to `grace` for it to finish its tick.
    pub async fn stop(self, grace: Duration) {
        self.begin_shutdown();
        self.shutdown.cancel();
        let mut handle = self.handle;
        if tokio::time::timeout(grace, &mut handle).await.is_err() {
            warn!("liveness monitor did not stop in time, aborting it");
            handle.abort();
        }
    }
}

struct MonitorTask {
    store: Arc<dyn JobStore>,
    job_id: JobId,
    rank: u32,
    stopping: Arc<AtomicBool>,
    self_destruct: CancellationToken,
}

impl MonitorTask {
    async fn tick(&self) {
        match self.store.status(self.job_id).await {
            Ok(Some(status)) if Status::ALIVE.contains(&status) => {}
            Ok(status) => {
                if !self.stopping.swap(true, Ordering::SeqCst) {
                    warn!(
                        job_id = %self.job_id,
                        rank = self.rank,
                        status = status.map(|s| s.as_str()).unwrap_or("DELETED"),
                        "job status changed, this worker will self-destruct"
                    );
                    metrics::heartbeats().add(1, &[KeyValue::new("result", "self_destruct")]);
                    self.self_destruct.cancel();
                }
                return;
            }
            Err(e) => {
                // A flaky store must not kill the worker; keep beating.
                warn!(job_id = %self.job_id, "liveness status check failed: {e}");
                metrics::heartbeats().add(1, &[KeyValue::new("result", "check_failed")]);
            }
        }

        let now = Utc::now();
        let beat = [
            JobUpdate::Heartbeat(now),
            JobUpdate::WorkerHeartbeat {
                rank: self.rank,
                time: now,
            },
        ];
        if let Err(e) = self
            .store
            .update(self.job_id, &beat, WriteConcern::Unacknowledged)
            .await
        {
            debug!(job_id = %self.job_id, "heartbeat write failed: {e}");
        }
        metrics::heartbeats().add(1, &[KeyValue::new("result", "alive")]);
    }
}
