//! Core data model.
//!
//! One mutable record per job is the only thing workers share. It carries the
//! lifecycle status, the claim counter, per-rank worker entries, barrier
//! counters and everything the running workload reports back (logs, metric
//! series, images, timings).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use uuid::Uuid;

/// A worker is considered dead once its heartbeat is older than this many
/// heartbeat intervals.
pub const DEAD_HEARTBEAT_MULTIPLE: u32 = 3;

// ---------------------------------------------------------------------------
// Job ID
// ---------------------------------------------------------------------------

/// Newtype for job IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Last six characters, used to keep output directory names unique.
    pub fn suffix(&self) -> String {
        let full = self.0.simple().to_string();
        full[full.len() - 6..].to_string()
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(JobId)
            .map_err(|e| crate::error::Error::Other(format!("invalid job id {s:?}: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a job. The record's `status` field is the single
/// source of truth; cancellation is expressed by changing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Submitted, no worker registered yet.
    Created,
    /// At least one worker claimed a slot; waiting for the rest to start.
    Scheduled,
    /// All ranks passed the startup barrier.
    Running,
    /// Rank 0 returned normally. Terminal.
    Finished,
    /// Some rank failed. Terminal.
    Failed,
    /// Canceled externally or by a signal. Terminal.
    Canceled,
}

impl Status {
    /// Statuses a job can be claimed from.
    pub const CLAIMABLE: [Status; 2] = [Status::Created, Status::Scheduled];

    /// Statuses allowed while ranks rendezvous at the startup barrier.
    pub const STARTUP: [Status; 2] = [Status::Scheduled, Status::Running];

    /// Statuses in which a running worker keeps going. `Finished` is included
    /// because rank 0 may finish while siblings are still wrapping up.
    pub const ALIVE: [Status; 3] = [Status::Scheduled, Status::Running, Status::Finished];

    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Created, Scheduled)
                | (Created, Canceled)
                | (Scheduled, Scheduled) // further ranks registering
                | (Scheduled, Running)
                | (Scheduled, Failed)
                | (Scheduled, Canceled)
                | (Running, Finished)
                | (Running, Failed)
                | (Running, Canceled)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Finished | Status::Failed | Status::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Created => "CREATED",
            Status::Scheduled => "SCHEDULED",
            Status::Running => "RUNNING",
            Status::Finished => "FINISHED",
            Status::Failed => "FAILED",
            Status::Canceled => "CANCELED",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CREATED" => Ok(Status::Created),
            "SCHEDULED" => Ok(Status::Scheduled),
            "RUNNING" => Ok(Status::Running),
            "FINISHED" => Ok(Status::Finished),
            "FAILED" => Ok(Status::Failed),
            "CANCELED" => Ok(Status::Canceled),
            _ => Err(crate::error::Error::Other(format!("unknown job status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Job record
// ---------------------------------------------------------------------------

/// Which workload a job runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    /// Name the workload registry resolves.
    pub script: String,
}

/// The shared, mutable record of one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub project: String,
    pub experiment: String,
    /// Human-readable job name.
    pub job: String,
    pub environment: Environment,
    /// Job-specific overrides of the workload's default config. Rank 0
    /// replaces this with the effective config once it starts.
    #[serde(default)]
    pub config: Map<String, Value>,

    pub status: Status,
    /// Declared worker count. Immutable after creation.
    pub n_workers: u32,
    /// Incremented once per successful claim, never decremented.
    pub registered_workers: u32,
    /// Higher = claimed first.
    pub priority: i32,

    pub creation_time: DateTime<Utc>,
    pub schedule_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_heartbeat_time: Option<DateTime<Utc>>,

    /// Host of rank 0.
    pub host: Option<String>,
    /// Output directory relative to the results root.
    pub output_dir: Option<String>,

    #[serde(default)]
    pub workers: BTreeMap<u32, WorkerInfo>,
    #[serde(default)]
    pub barrier: BTreeMap<String, u32>,
    #[serde(default)]
    pub metrics: Vec<MetricDescriptor>,
    #[serde(default)]
    pub metric_data: BTreeMap<String, Vec<MetricSample>>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default)]
    pub images: BTreeMap<String, String>,
    #[serde(default)]
    pub timings: BTreeMap<String, BTreeMap<u32, TimingStats>>,
    /// Free-form fields reported through `log_info`.
    #[serde(default)]
    pub info: Map<String, Value>,

    pub exception: Option<String>,
    pub traceback: Option<String>,
    pub exception_worker: Option<u32>,
}

impl JobRecord {
    /// Build the record a fresh submission is stored as.
    pub fn from_new(new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            project: new.project,
            experiment: new.experiment,
            job: new.job,
            environment: Environment { script: new.script },
            config: new.config,
            status: Status::Created,
            n_workers: new.n_workers,
            registered_workers: 0,
            priority: new.priority,
            creation_time: now,
            schedule_time: None,
            start_time: None,
            end_time: None,
            last_heartbeat_time: None,
            host: None,
            output_dir: None,
            workers: BTreeMap::new(),
            barrier: BTreeMap::new(),
            metrics: Vec::new(),
            metric_data: BTreeMap::new(),
            logs: Vec::new(),
            images: BTreeMap::new(),
            timings: BTreeMap::new(),
            info: Map::new(),
            exception: None,
            traceback: None,
            exception_worker: None,
        }
    }

    /// Arrivals recorded at the named barrier.
    pub fn barrier_count(&self, name: &str) -> u32 {
        self.barrier.get(name).copied().unwrap_or(0)
    }

    /// Metric series with duplicate registrations collapsed by id.
    pub fn metric_series(&self) -> Vec<&MetricDescriptor> {
        let mut seen = HashSet::new();
        self.metrics
            .iter()
            .filter(|m| seen.insert(m.id.as_str()))
            .collect()
    }

    /// Registered ranks whose last heartbeat is missing or older than
    /// [`DEAD_HEARTBEAT_MULTIPLE`] heartbeat intervals.
    pub fn dead_workers(&self, now: DateTime<Utc>, heartbeat_interval: Duration) -> Vec<u32> {
        let limit = heartbeat_interval * DEAD_HEARTBEAT_MULTIPLE;
        (0..self.registered_workers.min(self.n_workers))
            .filter(|rank| {
                match self.workers.get(rank).and_then(|w| w.last_heartbeat_time) {
                    None => true,
                    Some(beat) => (now - beat).to_std().map(|age| age > limit).unwrap_or(false),
                }
            })
            .collect()
    }
}

/// Per-rank entry, written only by the worker holding that rank.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub host: Option<String>,
    pub pid: Option<u32>,
    pub last_heartbeat_time: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Telemetry entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Info,
    Error,
}

impl std::fmt::Display for LogKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogKind::Info => f.write_str("info"),
            LogKind::Error => f.write_str("error"),
        }
    }
}

/// One line of workload output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub worker: u32,
    #[serde(rename = "type")]
    pub kind: LogKind,
    pub message: String,
    pub time: DateTime<Utc>,
}

/// Identity of a metric series. `id` is a content hash of the measurement
/// and the sorted tag set. Tags live in their own object so any tag name,
/// `id` and `measurement` included, is usable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDescriptor {
    pub id: String,
    pub measurement: String,
    #[serde(default)]
    pub tags: BTreeMap<String, Value>,
}

/// One timestamped sample of a metric series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub time: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Pre-aggregated timing statistics for one event on one rank.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimingStats {
    pub mean: f64,
    pub std: f64,
    pub instances: u64,
}

// ---------------------------------------------------------------------------
// New job
// ---------------------------------------------------------------------------

/// Builder for submitting a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub project: String,
    pub experiment: String,
    pub job: String,
    pub script: String,
    pub config: Map<String, Value>,
    pub n_workers: u32,
    pub priority: i32,
}

impl NewJob {
    pub fn new(project: &str, experiment: &str, job: &str) -> Self {
        Self {
            project: project.to_string(),
            experiment: experiment.to_string(),
            job: job.to_string(),
            script: String::new(),
            config: Map::new(),
            n_workers: 1,
            priority: 0,
        }
    }

    pub fn script(mut self, script: &str) -> Self {
        self.script = script.to_string();
        self
    }

    pub fn config(mut self, config: Map<String, Value>) -> Self {
        self.config = config;
        self
    }

    pub fn n_workers(mut self, n: u32) -> Self {
        self.n_workers = n.max(1);
        self
    }

    pub fn priority(mut self, p: i32) -> Self {
        self.priority = p;
        self
    }
}
