//! Telemetry sink: the logging and metrics facility handed to a workload.
//!
//! Calls never block on the store and never fail. Each record is queued to a
//! single writer task that appends it to the per-rank log file (for log
//! lines) and writes it into the job record in submission order. Store
//! errors are counted and dropped.
//!
//! Metric series are keyed by a content hash of the measurement and its
//! sorted tags (plus the rank on multi-worker jobs). A descriptor is pushed
//! the first time this process sees a hash; readers collapse duplicates from
//! other processes by id.

use crate::db::{JobStore, JobUpdate, WriteConcern};
use crate::model::*;
use crate::telemetry::metrics;
use chrono::Utc;
use opentelemetry::KeyValue;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Value of one metric sample: a bare number or a set of named fields.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Scalar(f64),
    Fields(Map<String, Value>),
}

impl MetricValue {
    fn into_fields(self) -> Map<String, Value> {
        match self {
            MetricValue::Scalar(v) => {
                let mut fields = Map::new();
                fields.insert("value".to_string(), Value::from(v));
                fields
            }
            MetricValue::Fields(fields) => fields,
        }
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Scalar(v)
    }
}

impl From<f32> for MetricValue {
    fn from(v: f32) -> Self {
        MetricValue::Scalar(v as f64)
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::Scalar(v as f64)
    }
}

impl From<u64> for MetricValue {
    fn from(v: u64) -> Self {
        MetricValue::Scalar(v as f64)
    }
}

impl From<Map<String, Value>> for MetricValue {
    fn from(fields: Map<String, Value>) -> Self {
        MetricValue::Fields(fields)
    }
}

/// Build the descriptor for a metric series.
///
/// `rank` is added as a `worker` tag when given. The id is the hex SHA-256
/// of the JSON encoding of `{"measurement": .., "tags": {..}}` with tag keys
/// sorted, so it is stable across processes and runs.
pub fn metric_descriptor(
    measurement: &str,
    tags: BTreeMap<String, Value>,
    rank: Option<u32>,
) -> MetricDescriptor {
    let mut tags = tags;
    if let Some(rank) = rank {
        tags.insert("worker".to_string(), Value::from(rank));
    }

    #[derive(Serialize)]
    struct SeriesKey<'a> {
        measurement: &'a str,
        tags: &'a BTreeMap<String, Value>,
    }
    let encoded = serde_json::to_vec(&SeriesKey {
        measurement,
        tags: &tags,
    })
    .unwrap_or_default();
    let id = format!("{:x}", Sha256::digest(&encoded));

    MetricDescriptor {
        id,
        measurement: measurement.to_string(),
        tags,
    }
}

enum SinkCommand {
    Write {
        update: JobUpdate,
        kind: &'static str,
    },
    Flush(oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

struct SinkInner {
    rank: u32,
    n_workers: u32,
    output_root: PathBuf,
    tx: mpsc::UnboundedSender<SinkCommand>,
    /// Set when `close` gives up waiting; the writer then drops the rest.
    abandon: CancellationToken,
    registered_metrics: Mutex<HashSet<String>>,
}

/// Per-rank telemetry sink. Cheap to clone.
#[derive(Clone)]
pub struct TelemetrySink {
    inner: Arc<SinkInner>,
}

impl TelemetrySink {
    /// Spawn the writer task and return the sink feeding it.
    ///
    /// `output_root` is the job's absolute output directory; image paths
    /// under it are stored relative to it.
    pub fn spawn(
        store: Arc<dyn JobStore>,
        job_id: JobId,
        rank: u32,
        n_workers: u32,
        output_root: PathBuf,
        log_file: Option<File>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let abandon = CancellationToken::new();
        tokio::spawn(write_loop(store, job_id, rx, log_file, abandon.clone()));

        Self {
            inner: Arc::new(SinkInner {
                rank,
                n_workers,
                output_root,
                tx,
                abandon,
                registered_metrics: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Record one line of output. Blank messages are dropped.
    pub fn log(&self, message: &str, kind: LogKind) {
        let message = message.trim();
        if message.is_empty() {
            return;
        }

        let rank = self.inner.rank;
        match kind {
            LogKind::Info => info!(target: "workload", rank, "{message}"),
            LogKind::Error => warn!(target: "workload", rank, "{message}"),
        }

        self.send(
            "log",
            JobUpdate::PushLog(LogEntry {
                worker: rank,
                kind,
                message: message.to_string(),
                time: Utc::now(),
            }),
        );
    }

    /// Append a sample to a metric series, registering the series the first
    /// time this process sees it.
    pub fn record_metric<I, K, V>(&self, measurement: &str, value: impl Into<MetricValue>, tags: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let tags: BTreeMap<String, Value> = tags
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let rank = (self.inner.n_workers > 1).then_some(self.inner.rank);
        let descriptor = metric_descriptor(measurement, tags, rank);
        let id = descriptor.id.clone();

        let first = self
            .inner
            .registered_metrics
            .lock()
            .map(|mut seen| seen.insert(id.clone()))
            .unwrap_or(true);
        if first {
            self.send("metric", JobUpdate::PushMetric(descriptor));
        }

        self.send(
            "metric",
            JobUpdate::PushMetricSample {
                id,
                sample: MetricSample {
                    time: Utc::now(),
                    fields: value.into().into_fields(),
                },
            },
        );
    }

    /// Register a named artifact. Paths under the output root are stored
    /// relative to it, anything else as given.
    pub fn record_image(&self, key: &str, path: &Path) {
        let stored = match path.strip_prefix(&self.inner.output_root) {
            Ok(relative) => relative.to_string_lossy().into_owned(),
            Err(_) => path.to_string_lossy().into_owned(),
        };
        self.send(
            "image",
            JobUpdate::Image {
                key: key.to_string(),
                path: stored,
            },
        );
    }

    /// Store pre-aggregated timing stats for `event` on this rank,
    /// replacing any earlier value.
    pub fn record_timing(&self, event: &str, mean: f64, std: f64, instances: u64) {
        self.send(
            "timing",
            JobUpdate::Timing {
                event: event.to_string(),
                rank: self.inner.rank,
                stats: TimingStats {
                    mean,
                    std,
                    instances,
                },
            },
        );
    }

    /// Merge free-form fields into the record's `info` map.
    pub fn record_info(&self, fields: Map<String, Value>) {
        if fields.is_empty() {
            return;
        }
        self.send("info", JobUpdate::Info(fields));
    }

    /// Wait until everything queued so far has been written.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.inner.tx.send(SinkCommand::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Drain the queue, close the log file and stop the writer. Later calls
    /// on any clone are dropped.
    ///
    /// Waits at most `limit` for the store to take what is queued. Past
    /// that, the in-flight write is abandoned and everything still queued
    /// is dropped. Returns false if anything was abandoned.
    pub async fn close(&self, limit: Duration) -> bool {
        let (ack, done) = oneshot::channel();
        if self.inner.tx.send(SinkCommand::Close(ack)).is_err() {
            return true;
        }
        match tokio::time::timeout(limit, done).await {
            Ok(_) => true,
            Err(_) => {
                warn!(
                    limit_ms = limit.as_millis() as u64,
                    "telemetry not drained in time, dropping the rest"
                );
                self.inner.abandon.cancel();
                false
            }
        }
    }

    fn send(&self, kind: &'static str, update: JobUpdate) {
        if self
            .inner
            .tx
            .send(SinkCommand::Write { update, kind })
            .is_err()
        {
            count_write(kind, "dropped");
        }
    }
}

async fn write_loop(
    store: Arc<dyn JobStore>,
    job_id: JobId,
    mut rx: mpsc::UnboundedReceiver<SinkCommand>,
    mut log_file: Option<File>,
    abandon: CancellationToken,
) {
    while let Some(command) = rx.recv().await {
        match command {
            SinkCommand::Write { update, kind } => {
                if let (Some(file), JobUpdate::PushLog(entry)) = (log_file.as_mut(), &update) {
                    let line = format!("{}\n", entry.message);
                    if let Err(e) = file.write_all(line.as_bytes()).await {
                        warn!(job_id = %job_id, "log file write failed, disabling file output: {e}");
                        log_file = None;
                    }
                }

                let outcome = if abandon.is_cancelled() {
                    "dropped"
                } else {
                    tokio::select! {
                        biased;
                        _ = abandon.cancelled() => "dropped",
                        result = store.update(
                            job_id,
                            std::slice::from_ref(&update),
                            WriteConcern::Acknowledged,
                        ) => match result {
                            Ok(()) => "ok",
                            Err(e) => {
                                debug!(job_id = %job_id, kind, "telemetry write dropped: {e}");
                                "dropped"
                            }
                        },
                    }
                };
                count_write(kind, outcome);
            }
            SinkCommand::Flush(ack) => {
                flush_file(&mut log_file).await;
                let _ = ack.send(());
            }
            SinkCommand::Close(ack) => {
                flush_file(&mut log_file).await;
                rx.close();
                let _ = ack.send(());
                break;
            }
        }
    }

    // Anything sent between `Close` and `rx.close()` never reaches the store.
    while let Ok(command) = rx.try_recv() {
        if let SinkCommand::Write { kind, .. } = command {
            count_write(kind, "dropped");
        }
    }
}

fn count_write(kind: &'static str, outcome: &'static str) {
    metrics::sink_writes().add(
        1,
        &[KeyValue::new("kind", kind), KeyValue::new("result", outcome)],
    );
}

async fn flush_file(file: &mut Option<File>) {
    if let Some(f) = file.as_mut() {
        if let Err(e) = f.flush().await {
            debug!("log file flush failed: {e}");
        }
    }
}
