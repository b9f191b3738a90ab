//! Job record store: the contract every coordination step is built on, and
//! its Postgres and in-memory implementations.
//!
//! All atomicity in the protocol comes from single-record conditional
//! updates. Nothing here spans more than one job record.

pub mod jobs;
pub mod memory;

pub use memory::MemoryStore;

use crate::error::Result;
use crate::model::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Whether a write waits for the store to acknowledge it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteConcern {
    Acknowledged,
    /// Issue the write and return immediately. Failures are only logged.
    Unacknowledged,
}

/// One field-level mutation of a job record.
#[derive(Debug, Clone, PartialEq)]
pub enum JobUpdate {
    Host(String),
    OutputDir(String),
    StartTime(DateTime<Utc>),
    EndTime(DateTime<Utc>),
    /// Job-level `last_heartbeat_time`.
    Heartbeat(DateTime<Utc>),
    /// Replace the stored config with the effective one.
    Config(Map<String, Value>),
    Worker {
        rank: u32,
        host: String,
        pid: u32,
    },
    WorkerHeartbeat {
        rank: u32,
        time: DateTime<Utc>,
    },
    PushLog(LogEntry),
    PushMetric(MetricDescriptor),
    PushMetricSample {
        id: String,
        sample: MetricSample,
    },
    Image {
        key: String,
        path: String,
    },
    /// Overwrites the stats for `(event, rank)`.
    Timing {
        event: String,
        rank: u32,
        stats: TimingStats,
    },
    /// Merge into the free-form `info` map.
    Info(Map<String, Value>),
    Failure {
        exception: String,
        traceback: String,
        worker: u32,
    },
}

/// Which jobs a claim may pick from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidates {
    Any,
    Ids(Vec<JobId>),
}

/// Eligibility filter for [`JobStore::claim`].
#[derive(Debug, Clone)]
pub struct ClaimFilter {
    pub candidates: Candidates,
    /// Only consider jobs declaring at least this many workers.
    pub min_worker_count: Option<u32>,
}

impl ClaimFilter {
    pub fn any() -> Self {
        Self {
            candidates: Candidates::Any,
            min_worker_count: None,
        }
    }

    pub fn ids(ids: Vec<JobId>) -> Self {
        Self {
            candidates: Candidates::Ids(ids),
            min_worker_count: None,
        }
    }

    pub fn min_worker_count(mut self, n: Option<u32>) -> Self {
        self.min_worker_count = n;
        self
    }

    /// The eligibility predicate, for stores that evaluate it in process.
    pub fn matches(&self, job: &JobRecord) -> bool {
        let candidate = match &self.candidates {
            Candidates::Any => true,
            Candidates::Ids(ids) => ids.contains(&job.id),
        };
        candidate
            && Status::CLAIMABLE.contains(&job.status)
            && job.registered_workers < job.n_workers
            && self.min_worker_count.is_none_or(|min| job.n_workers >= min)
    }
}

/// A successfully claimed slot.
#[derive(Debug, Clone)]
pub struct Claim {
    /// The record as it stood right after the claim.
    pub job: JobRecord,
    /// Pre-increment value of `registered_workers`.
    pub rank: u32,
}

/// Projection read by the barrier's poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierSnapshot {
    pub count: u32,
    pub status: Status,
}

/// The shared job record store.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Store a freshly submitted job in status `CREATED`.
    async fn insert(&self, new: NewJob) -> Result<JobRecord>;

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>>;

    /// Read only the status. `None` if the job no longer exists.
    async fn status(&self, id: JobId) -> Result<Option<Status>>;

    /// Atomically pick the best eligible job (highest priority, then oldest)
    /// and register one more worker on it.
    async fn claim(&self, filter: &ClaimFilter) -> Result<Option<Claim>>;

    /// Atomically add one arrival to the named barrier.
    async fn increment_barrier(&self, id: JobId, name: &str) -> Result<()>;

    async fn barrier_snapshot(&self, id: JobId, name: &str) -> Result<Option<BarrierSnapshot>>;

    async fn update(&self, id: JobId, updates: &[JobUpdate], concern: WriteConcern)
    -> Result<()>;

    /// Move to `to` if the current status is one of `from`, applying
    /// `updates` in the same step. Returns false if nothing changed, and
    /// `Error::InvalidTransition` if some status in `from` may not move
    /// to `to`.
    async fn transition(
        &self,
        id: JobId,
        from: &[Status],
        to: Status,
        updates: &[JobUpdate],
    ) -> Result<bool>;
}

/// Reject a conditional transition the state machine does not allow from
/// every accepted source status.
pub(crate) fn check_transition(from: &[Status], to: Status) -> Result<()> {
    match from.iter().find(|s| !s.can_transition_to(to)) {
        Some(bad) => Err(crate::error::Error::InvalidTransition {
            from: bad.to_string(),
            to: to.to_string(),
        }),
        None => Ok(()),
    }
}

/// Postgres handle. Owns the connection pool.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| crate::error::Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Close the pool, waiting for checked-out connections to return.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}
