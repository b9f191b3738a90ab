//! Postgres implementation of [`JobStore`].
//!
//! Every operation is a single-row statement (or a short transaction on one
//! row), so Postgres row locking gives the per-record linearizability the
//! claim and barrier steps rely on.

use super::{
    BarrierSnapshot, Candidates, Claim, ClaimFilter, Db, JobStore, JobUpdate, WriteConcern,
    check_transition,
};
use crate::error::{Error, Result};
use crate::model::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use sqlx::PgConnection;
use sqlx::types::Json;
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;

// Claimants queue on the best row's lock rather than skipping it, so the
// highest-priority open slot is always the one taken. A claimant that waited
// on a row which filled up in the meantime can come back empty; `claim`
// retries while an eligible row still exists.
const CLAIM: &str = "UPDATE jobs
     SET status = 'SCHEDULED',
         schedule_time = COALESCE(schedule_time, $3),
         registered_workers = registered_workers + 1
     WHERE id = (
         SELECT id FROM jobs
         WHERE status IN ('CREATED', 'SCHEDULED')
           AND registered_workers < n_workers
           AND ($1::uuid[] IS NULL OR id = ANY($1))
           AND ($2::int IS NULL OR n_workers >= $2)
         ORDER BY priority DESC, creation_time ASC
         LIMIT 1
         FOR UPDATE
     )
     AND registered_workers < n_workers
     RETURNING *";

const ELIGIBLE: &str = "SELECT EXISTS (
         SELECT 1 FROM jobs
         WHERE status IN ('CREATED', 'SCHEDULED')
           AND registered_workers < n_workers
           AND ($1::uuid[] IS NULL OR id = ANY($1))
           AND ($2::int IS NULL OR n_workers >= $2)
     )";

const CLAIM_ATTEMPTS: usize = 5;

#[async_trait]
impl JobStore for Db {
    async fn insert(&self, new: NewJob) -> Result<JobRecord> {
        let record = JobRecord::from_new(new, Utc::now());

        sqlx::query(
            "INSERT INTO jobs (id, project, experiment, job, environment, config, status, n_workers, registered_workers, priority, creation_time)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, $9, $10)",
        )
        .bind(record.id.0)
        .bind(&record.project)
        .bind(&record.experiment)
        .bind(&record.job)
        .bind(Json(&record.environment))
        .bind(Json(&record.config))
        .bind(record.status.as_str())
        .bind(record.n_workers as i32)
        .bind(record.priority)
        .bind(record.creation_time)
        .execute(self.pool())
        .await?;

        Ok(record)
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM jobs WHERE id = $1")
            .bind(id.0)
            .fetch_optional(self.pool())
            .await?;
        row.map(JobRow::try_into_record).transpose()
    }

    async fn status(&self, id: JobId) -> Result<Option<Status>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT status FROM jobs WHERE id = $1")
            .bind(id.0)
            .fetch_optional(self.pool())
            .await?;
        row.map(|(s,)| s.parse()).transpose()
    }

    async fn claim(&self, filter: &ClaimFilter) -> Result<Option<Claim>> {
        let ids: Option<Vec<Uuid>> = match &filter.candidates {
            Candidates::Any => None,
            Candidates::Ids(ids) => Some(ids.iter().map(|id| id.0).collect()),
        };
        let min_workers = filter.min_worker_count.map(|n| n as i32);

        for attempt in 1..=CLAIM_ATTEMPTS {
            let row: Option<JobRow> = sqlx::query_as(CLAIM)
                .bind(&ids)
                .bind(min_workers)
                .bind(Utc::now())
                .fetch_optional(self.pool())
                .await?;

            if let Some(row) = row {
                let job = row.try_into_record()?;
                return Ok(Some(Claim {
                    rank: job.registered_workers - 1,
                    job,
                }));
            }

            let eligible: bool = sqlx::query_scalar(ELIGIBLE)
                .bind(&ids)
                .bind(min_workers)
                .fetch_one(self.pool())
                .await?;
            if !eligible {
                return Ok(None);
            }
            debug!(attempt, "claim raced a competing claimant, retrying");
        }
        Ok(None)
    }

    async fn increment_barrier(&self, id: JobId, name: &str) -> Result<()> {
        let rows = sqlx::query(
            "UPDATE jobs
             SET barrier = jsonb_set(barrier, ARRAY[$2::text], to_jsonb(COALESCE((barrier ->> $2::text)::int, 0) + 1))
             WHERE id = $1",
        )
        .bind(id.0)
        .bind(name)
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows == 0 {
            return Err(Error::JobMissing(id));
        }
        Ok(())
    }

    async fn barrier_snapshot(&self, id: JobId, name: &str) -> Result<Option<BarrierSnapshot>> {
        let row: Option<(i32, String)> = sqlx::query_as(
            "SELECT COALESCE((barrier ->> $2::text)::int, 0), status FROM jobs WHERE id = $1",
        )
        .bind(id.0)
        .bind(name)
        .fetch_optional(self.pool())
        .await?;

        row.map(|(count, status)| {
            Ok(BarrierSnapshot {
                count: count.max(0) as u32,
                status: status.parse()?,
            })
        })
        .transpose()
    }

    async fn update(
        &self,
        id: JobId,
        updates: &[JobUpdate],
        concern: WriteConcern,
    ) -> Result<()> {
        match concern {
            WriteConcern::Acknowledged => {
                let mut tx = self.pool().begin().await?;
                let exists: Option<(Uuid,)> =
                    sqlx::query_as("SELECT id FROM jobs WHERE id = $1 FOR UPDATE")
                        .bind(id.0)
                        .fetch_optional(&mut *tx)
                        .await?;
                if exists.is_none() {
                    tx.rollback().await?;
                    return Err(Error::JobMissing(id));
                }
                for update in updates {
                    apply_update(&mut *tx, id.0, update).await?;
                }
                tx.commit().await?;
            }
            WriteConcern::Unacknowledged => {
                let pool = self.pool().clone();
                let updates = updates.to_vec();
                tokio::spawn(async move {
                    let result = async {
                        let mut conn = pool.acquire().await?;
                        for update in &updates {
                            apply_update(&mut *conn, id.0, update).await?;
                        }
                        Ok::<_, Error>(())
                    }
                    .await;
                    if let Err(e) = result {
                        debug!(job_id = %id, "unacknowledged write failed: {e}");
                    }
                });
            }
        }
        Ok(())
    }

    async fn transition(
        &self,
        id: JobId,
        from: &[Status],
        to: Status,
        updates: &[JobUpdate],
    ) -> Result<bool> {
        check_transition(from, to)?;
        let from: Vec<&str> = from.iter().map(|s| s.as_str()).collect();
        let mut tx = self.pool().begin().await?;

        let rows = sqlx::query("UPDATE jobs SET status = $2 WHERE id = $1 AND status = ANY($3)")
            .bind(id.0)
            .bind(to.as_str())
            .bind(&from)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if rows == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        for update in updates {
            apply_update(&mut *tx, id.0, update).await?;
        }
        tx.commit().await?;
        Ok(true)
    }
}

/// Apply one field-level update as a single-row statement.
async fn apply_update(conn: &mut PgConnection, id: Uuid, update: &JobUpdate) -> Result<()> {
    match update {
        JobUpdate::Host(host) => {
            sqlx::query("UPDATE jobs SET host = $2 WHERE id = $1")
                .bind(id)
                .bind(host)
                .execute(&mut *conn)
                .await?;
        }
        JobUpdate::OutputDir(dir) => {
            sqlx::query("UPDATE jobs SET output_dir = $2 WHERE id = $1")
                .bind(id)
                .bind(dir)
                .execute(&mut *conn)
                .await?;
        }
        JobUpdate::StartTime(t) => {
            set_timestamp(conn, id, "UPDATE jobs SET start_time = $2 WHERE id = $1", *t).await?
        }
        JobUpdate::EndTime(t) => {
            set_timestamp(conn, id, "UPDATE jobs SET end_time = $2 WHERE id = $1", *t).await?
        }
        JobUpdate::Heartbeat(t) => {
            set_timestamp(conn, id, "UPDATE jobs SET last_heartbeat_time = $2 WHERE id = $1", *t)
                .await?
        }
        JobUpdate::Config(config) => {
            sqlx::query("UPDATE jobs SET config = $2 WHERE id = $1")
                .bind(id)
                .bind(Json(config))
                .execute(&mut *conn)
                .await?;
        }
        JobUpdate::Worker { rank, host, pid } => {
            merge_worker(conn, id, *rank, json!({ "host": host, "pid": pid })).await?;
        }
        JobUpdate::WorkerHeartbeat { rank, time } => {
            merge_worker(conn, id, *rank, json!({ "last_heartbeat_time": time })).await?;
        }
        JobUpdate::PushLog(entry) => {
            sqlx::query("UPDATE jobs SET logs = logs || jsonb_build_array($2::jsonb) WHERE id = $1")
                .bind(id)
                .bind(Json(entry))
                .execute(&mut *conn)
                .await?;
        }
        JobUpdate::PushMetric(descriptor) => {
            sqlx::query(
                "UPDATE jobs SET metrics = metrics || jsonb_build_array($2::jsonb) WHERE id = $1",
            )
            .bind(id)
            .bind(Json(descriptor))
            .execute(&mut *conn)
            .await?;
        }
        JobUpdate::PushMetricSample { id: series, sample } => {
            sqlx::query(
                "UPDATE jobs
                 SET metric_data = jsonb_set(metric_data, ARRAY[$2::text],
                     COALESCE(metric_data -> $2::text, '[]'::jsonb) || jsonb_build_array($3::jsonb))
                 WHERE id = $1",
            )
            .bind(id)
            .bind(series)
            .bind(Json(sample))
            .execute(&mut *conn)
            .await?;
        }
        JobUpdate::Image { key, path } => {
            sqlx::query(
                "UPDATE jobs SET images = jsonb_set(images, ARRAY[$2::text], to_jsonb($3::text)) WHERE id = $1",
            )
            .bind(id)
            .bind(key)
            .bind(path)
            .execute(&mut *conn)
            .await?;
        }
        JobUpdate::Timing { event, rank, stats } => {
            sqlx::query(
                "UPDATE jobs
                 SET timings = jsonb_set(timings, ARRAY[$2::text],
                     COALESCE(timings -> $2::text, '{}'::jsonb) || jsonb_build_object($3::text, $4::jsonb))
                 WHERE id = $1",
            )
            .bind(id)
            .bind(event)
            .bind(rank.to_string())
            .bind(Json(stats))
            .execute(&mut *conn)
            .await?;
        }
        JobUpdate::Info(fields) => {
            sqlx::query("UPDATE jobs SET info = info || $2::jsonb WHERE id = $1")
                .bind(id)
                .bind(Json(fields))
                .execute(&mut *conn)
                .await?;
        }
        JobUpdate::Failure {
            exception,
            traceback,
            worker,
        } => {
            sqlx::query(
                "UPDATE jobs SET exception = $2, traceback = $3, exception_worker = $4 WHERE id = $1",
            )
            .bind(id)
            .bind(exception)
            .bind(traceback)
            .bind(*worker as i32)
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(())
}

async fn set_timestamp(
    conn: &mut PgConnection,
    id: Uuid,
    sql: &'static str,
    value: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(sql)
        .bind(id)
        .bind(value)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn merge_worker(conn: &mut PgConnection, id: Uuid, rank: u32, fields: Value) -> Result<()> {
    sqlx::query(
        "UPDATE jobs
         SET workers = jsonb_set(workers, ARRAY[$2::text], COALESCE(workers -> $2::text, '{}'::jsonb) || $3::jsonb)
         WHERE id = $1",
    )
    .bind(id)
    .bind(rank.to_string())
    .bind(Json(fields))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    project: String,
    experiment: String,
    job: String,
    environment: Json<Environment>,
    config: Json<Map<String, Value>>,
    status: String,
    n_workers: i32,
    registered_workers: i32,
    priority: i32,
    creation_time: DateTime<Utc>,
    schedule_time: Option<DateTime<Utc>>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    last_heartbeat_time: Option<DateTime<Utc>>,
    host: Option<String>,
    output_dir: Option<String>,
    workers: Json<BTreeMap<u32, WorkerInfo>>,
    barrier: Json<BTreeMap<String, u32>>,
    metrics: Json<Vec<MetricDescriptor>>,
    metric_data: Json<BTreeMap<String, Vec<MetricSample>>>,
    logs: Json<Vec<LogEntry>>,
    images: Json<BTreeMap<String, String>>,
    timings: Json<BTreeMap<String, BTreeMap<u32, TimingStats>>>,
    info: Json<Map<String, Value>>,
    exception: Option<String>,
    traceback: Option<String>,
    exception_worker: Option<i32>,
}

impl JobRow {
    fn try_into_record(self) -> Result<JobRecord> {
        Ok(JobRecord {
            id: JobId(self.id),
            project: self.project,
            experiment: self.experiment,
            job: self.job,
            environment: self.environment.0,
            config: self.config.0,
            status: self.status.parse()?,
            n_workers: self.n_workers as u32,
            registered_workers: self.registered_workers as u32,
            priority: self.priority,
            creation_time: self.creation_time,
            schedule_time: self.schedule_time,
            start_time: self.start_time,
            end_time: self.end_time,
            last_heartbeat_time: self.last_heartbeat_time,
            host: self.host,
            output_dir: self.output_dir,
            workers: self.workers.0,
            barrier: self.barrier.0,
            metrics: self.metrics.0,
            metric_data: self.metric_data.0,
            logs: self.logs.0,
            images: self.images.0,
            timings: self.timings.0,
            info: self.info.0,
            exception: self.exception,
            traceback: self.traceback,
            exception_worker: self.exception_worker.map(|w| w as u32),
        })
    }
}
