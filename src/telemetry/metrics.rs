//! Metric instrument factories for jobmonitor-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Instruments are created lazily under the service's [`scope`](super::scope).

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter_with_scope(super::scope())
}

/// Counter: claim attempts.
/// Labels: `mode` ("any" | "ids"), `result` ("claimed" | "empty").
pub fn claims() -> Counter<u64> {
    meter()
        .u64_counter("jobmonitor.claims")
        .with_description("Number of claim attempts")
        .build()
}

/// Counter: job status transitions written by this worker.
/// Labels: `to`, `result` ("ok" | "skipped").
pub fn status_transitions() -> Counter<u64> {
    meter()
        .u64_counter("jobmonitor.job.status_transitions")
        .with_description("Number of job status transitions")
        .build()
}

/// Histogram: time spent waiting at a barrier, in milliseconds.
/// Labels: `barrier`, `result` ("passed" | "aborted").
pub fn barrier_wait_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("jobmonitor.barrier.wait_ms")
        .with_description("Time spent waiting for sibling workers")
        .with_unit("ms")
        .build()
}

/// Counter: liveness ticks.
/// Labels: `result` ("alive" | "self_destruct" | "check_failed").
pub fn heartbeats() -> Counter<u64> {
    meter()
        .u64_counter("jobmonitor.liveness.heartbeats")
        .with_description("Number of liveness monitor ticks")
        .build()
}

/// Counter: telemetry sink writes.
/// Labels: `kind` ("log" | "metric" | "image" | "timing" | "info"), `result` ("ok" | "dropped").
pub fn sink_writes() -> Counter<u64> {
    meter()
        .u64_counter("jobmonitor.sink.writes")
        .with_description("Number of telemetry records written to the job store")
        .build()
}

/// Histogram: workload run time in milliseconds.
/// Labels: `outcome` ("finished" | "failed" | "canceled").
pub fn workload_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("jobmonitor.workload.duration_ms")
        .with_description("Workload run time")
        .with_unit("ms")
        .build()
}
