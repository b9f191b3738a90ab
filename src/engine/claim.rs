//! Claim engine: reserve one worker slot of one job.
//!
//! The store does the selection and the reservation in one conditional
//! update, so concurrent claimants never share a rank. Contention is not an
//! error; losing a race just means someone else got the slot.

use crate::db::{Candidates, Claim, ClaimFilter, JobStore};
use crate::error::Result;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Try once to claim a slot.
pub async fn claim(store: &dyn JobStore, filter: &ClaimFilter) -> Result<Option<Claim>> {
    let claim = store.claim(filter).await?;

    let mode = match filter.candidates {
        Candidates::Any => "any",
        Candidates::Ids(_) => "ids",
    };
    metrics::claims().add(
        1,
        &[
            KeyValue::new("mode", mode),
            KeyValue::new("result", if claim.is_some() { "claimed" } else { "empty" }),
        ],
    );

    match &claim {
        Some(c) => info!(
            job_id = %c.job.id,
            rank = c.rank,
            n_workers = c.job.n_workers,
            priority = c.job.priority,
            "claimed job slot"
        ),
        None => debug!(mode, "no eligible job"),
    }
    Ok(claim)
}

/// Claim a slot, waiting for work in "any" mode.
///
/// With explicit candidates a miss is final and returns `None`. In "any"
/// mode an empty queue is retried every `backoff` until a slot is claimed or
/// `shutdown` fires.
pub async fn claim_next(
    store: &dyn JobStore,
    filter: &ClaimFilter,
    backoff: Duration,
    shutdown: &CancellationToken,
) -> Result<Option<Claim>> {
    loop {
        if let Some(claim) = claim(store, filter).await? {
            return Ok(Some(claim));
        }
        if filter.candidates != Candidates::Any {
            info!("job not found or nothing to do");
            return Ok(None);
        }

        info!(backoff_secs = backoff.as_secs_f64(), "queue is empty, waiting for a job");
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(None),
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}
