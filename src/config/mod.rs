//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! The database URL is wrapped in secrecy::SecretString to prevent log leaks.

use crate::error::{Error, Result};
use secrecy::SecretString;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    /// Root under which every job gets its output directory.
    pub results_dir: PathBuf,
    /// Directory of `*.toml` workload descriptions.
    pub workloads_dir: PathBuf,
    pub heartbeat_interval: Duration,
    pub barrier_poll_interval: Duration,
    pub queue_backoff: Duration,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            results_dir: PathBuf::from(required_var("JOBMONITOR_RESULTS_DIR")?),
            workloads_dir: std::env::var("JOBMONITOR_WORKLOADS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("workloads")),
            heartbeat_interval: seconds_var("JOBMONITOR_HEARTBEAT_SECS", 10)?,
            barrier_poll_interval: seconds_var("JOBMONITOR_BARRIER_POLL_SECS", 2)?,
            queue_backoff: seconds_var("JOBMONITOR_QUEUE_BACKOFF_SECS", 10)?,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn seconds_var(name: &str, default: u64) -> Result<Duration> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| Error::Config(format!("{name} must be a whole number of seconds, got {raw:?}"))),
        Err(_) => Ok(Duration::from_secs(default)),
    }
}
