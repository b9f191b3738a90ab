//! In-process job store.
//!
//! Holds every record behind one mutex, which makes each operation trivially
//! linearizable. Used by the test suite and for local dry runs.

use super::{
    BarrierSnapshot, Claim, ClaimFilter, JobStore, JobUpdate, WriteConcern, check_transition,
};
use crate::error::{Error, Result};
use crate::model::*;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
pub struct MemoryStore {
    jobs: Mutex<HashMap<JobId, JobRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a record, as an external maintenance tool would.
    pub fn delete(&self, id: JobId) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Overwrite a job's status without any transition check. Stands in for
    /// an external actor editing the record.
    pub fn force_status(&self, id: JobId, status: Status) -> bool {
        match self.lock().get_mut(&id) {
            Some(job) => {
                job.status = status;
                true
            }
            None => false,
        }
    }

    /// Store a record as-is. Lets tests control timestamps and counters.
    pub fn put(&self, record: JobRecord) {
        self.lock().insert(record.id, record);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, JobRecord>> {
        // A panic while holding the lock cannot leave a record half-written:
        // every mutation below is a plain field assignment.
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert(&self, new: NewJob) -> Result<JobRecord> {
        let record = JobRecord::from_new(new, Utc::now());
        self.lock().insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
        Ok(self.lock().get(&id).cloned())
    }

    async fn status(&self, id: JobId) -> Result<Option<Status>> {
        Ok(self.lock().get(&id).map(|job| job.status))
    }

    async fn claim(&self, filter: &ClaimFilter) -> Result<Option<Claim>> {
        let mut jobs = self.lock();

        let best = jobs
            .values()
            .filter(|job| filter.matches(job))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.creation_time.cmp(&b.creation_time))
            })
            .map(|job| job.id);

        let Some(id) = best else {
            return Ok(None);
        };
        let job = jobs.get_mut(&id).ok_or(Error::JobMissing(id))?;

        let rank = job.registered_workers;
        job.status = Status::Scheduled;
        job.schedule_time.get_or_insert_with(Utc::now);
        job.registered_workers += 1;

        Ok(Some(Claim {
            job: job.clone(),
            rank,
        }))
    }

    async fn increment_barrier(&self, id: JobId, name: &str) -> Result<()> {
        let mut jobs = self.lock();
        let job = jobs.get_mut(&id).ok_or(Error::JobMissing(id))?;
        *job.barrier.entry(name.to_string()).or_insert(0) += 1;
        Ok(())
    }

    async fn barrier_snapshot(&self, id: JobId, name: &str) -> Result<Option<BarrierSnapshot>> {
        Ok(self.lock().get(&id).map(|job| BarrierSnapshot {
            count: job.barrier_count(name),
            status: job.status,
        }))
    }

    async fn update(
        &self,
        id: JobId,
        updates: &[JobUpdate],
        concern: WriteConcern,
    ) -> Result<()> {
        let mut jobs = self.lock();
        let Some(job) = jobs.get_mut(&id) else {
            // An unacknowledged write to a vanished record is silently lost.
            return match concern {
                WriteConcern::Acknowledged => Err(Error::JobMissing(id)),
                WriteConcern::Unacknowledged => Ok(()),
            };
        };
        for update in updates {
            apply(job, update);
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
        let mut jobs = self.lock();
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(false);
        };
        if !from.contains(&job.status) {
            return Ok(false);
        }
        job.status = to;
        for update in updates {
            apply(job, update);
        }
        Ok(true)
    }
}

fn apply(job: &mut JobRecord, update: &JobUpdate) {
    match update {
        JobUpdate::Host(host) => job.host = Some(host.clone()),
        JobUpdate::OutputDir(dir) => job.output_dir = Some(dir.clone()),
        JobUpdate::StartTime(t) => job.start_time = Some(*t),
        JobUpdate::EndTime(t) => job.end_time = Some(*t),
        JobUpdate::Heartbeat(t) => job.last_heartbeat_time = Some(*t),
        JobUpdate::Config(config) => job.config = config.clone(),
        JobUpdate::Worker { rank, host, pid } => {
            let worker = job.workers.entry(*rank).or_default();
            worker.host = Some(host.clone());
            worker.pid = Some(*pid);
        }
        JobUpdate::WorkerHeartbeat { rank, time } => {
            job.workers.entry(*rank).or_default().last_heartbeat_time = Some(*time);
        }
        JobUpdate::PushLog(entry) => job.logs.push(entry.clone()),
        JobUpdate::PushMetric(descriptor) => job.metrics.push(descriptor.clone()),
        JobUpdate::PushMetricSample { id, sample } => {
            job.metric_data
                .entry(id.clone())
                .or_default()
                .push(sample.clone());
        }
        JobUpdate::Image { key, path } => {
            job.images.insert(key.clone(), path.clone());
        }
        JobUpdate::Timing { event, rank, stats } => {
            job.timings
                .entry(event.clone())
                .or_default()
                .insert(*rank, *stats);
        }
        JobUpdate::Info(fields) => {
            for (key, value) in fields {
                job.info.insert(key.clone(), value.clone());
            }
        }
        JobUpdate::Failure {
            exception,
            traceback,
            worker,
        } => {
            job.exception = Some(exception.clone());
            job.traceback = Some(traceback.clone());
            job.exception_worker = Some(*worker);
        }
    }
}
