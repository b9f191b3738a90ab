//! Worker-side protocol: claim a slot, rendezvous with siblings, stay alive,
//! report telemetry, and record how the job ended.

pub mod barrier;
pub mod claim;
pub mod harness;
pub mod liveness;
pub mod sink;
pub mod workspace;

pub use barrier::{JOBSTART, await_barrier};
pub use claim::{claim, claim_next};
pub use harness::{Harness, HarnessConfig, RunOutcome};
pub use liveness::LivenessMonitor;
pub use sink::{MetricValue, TelemetrySink};
pub use workspace::Workspace;
