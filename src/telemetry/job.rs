//! Job execution span helpers.
//!
//! One span covers a worker's whole lifecycle on a claimed job, from the
//! startup barrier to teardown.

use crate::model::{JobId, Status};
use tracing::Span;

/// Start a span for one rank of a job.
///
/// The `job.status` field is declared empty and can be updated via
/// [`record_status_transition`].
pub fn start_job_span(job_id: &JobId, rank: u32, n_workers: u32) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.id" = %job_id,
        "job.rank" = rank,
        "job.n_workers" = n_workers,
        "job.status" = tracing::field::Empty,
    )
}

/// Record a status transition on the given span. `from` is the set of
/// statuses the conditional write accepted.
pub fn record_status_transition(span: &Span, from: &[Status], to: Status) {
    let from = from.iter().map(|s| s.as_str()).collect::<Vec<_>>().join("|");
    span.record("job.status", to.as_str());
    span.in_scope(|| {
        tracing::info!(from = %from, to = %to, "status_transition");
    });
}
