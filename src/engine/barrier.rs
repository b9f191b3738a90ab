//! Rendezvous barrier over the job record.
//!
//! Each worker bumps a named counter once, then polls until the counter
//! reaches the expected worker count. Waiting is unbounded; the only way out
//! besides success is the job's status leaving the allowed set (or the record
//! disappearing), which aborts every waiter.

use crate::db::JobStore;
use crate::error::{Error, Result};
use crate::model::{JobId, Status};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Barrier every rank passes before the workload starts.
pub const JOBSTART: &str = "jobstart";

/// Block until `expected` workers reached barrier `name` on `job_id`.
///
/// An empty `allowed` slice disables the status check. Returns
/// [`Error::BarrierAborted`] if the job is deleted or its status leaves
/// `allowed` while waiting.
pub async fn await_barrier(
    store: &dyn JobStore,
    job_id: JobId,
    name: &str,
    expected: u32,
    allowed: &[Status],
    poll_interval: Duration,
) -> Result<()> {
    if expected <= 1 {
        return Ok(());
    }

    let started = Instant::now();
    info!(job_id = %job_id, barrier = name, expected, "reached barrier");

    match store.increment_barrier(job_id, name).await {
        Err(Error::JobMissing(_)) => return Err(aborted(name, None, started)),
        other => other?,
    }

    loop {
        let Some(snapshot) = store.barrier_snapshot(job_id, name).await? else {
            warn!(job_id = %job_id, barrier = name, "job disappeared while waiting at barrier");
            return Err(aborted(name, None, started));
        };

        if !allowed.is_empty() && !allowed.contains(&snapshot.status) {
            warn!(
                job_id = %job_id,
                barrier = name,
                status = %snapshot.status,
                "job status left the expected set, leaving barrier"
            );
            return Err(aborted(name, Some(snapshot.status), started));
        }

        // Retried increments can overshoot, so only the lower bound matters.
        if snapshot.count >= expected {
            info!(job_id = %job_id, barrier = name, "all workers registered");
            metrics::barrier_wait_ms().record(
                started.elapsed().as_secs_f64() * 1000.0,
                &[
                    KeyValue::new("barrier", name.to_string()),
                    KeyValue::new("result", "passed"),
                ],
            );
            return Ok(());
        }

        debug!(
            job_id = %job_id,
            barrier = name,
            registered = snapshot.count,
            expected,
            "waiting for workers"
        );
        tokio::time::sleep(poll_interval).await;
    }
}

fn aborted(name: &str, status: Option<Status>, started: Instant) -> Error {
    metrics::barrier_wait_ms().record(
        started.elapsed().as_secs_f64() * 1000.0,
        &[
            KeyValue::new("barrier", name.to_string()),
            KeyValue::new("result", "aborted"),
        ],
    );
    Error::BarrierAborted {
        barrier: name.to_string(),
        status,
    }
}
