//! Error types for jobmonitor-rs.

use crate::model::{JobId, Status};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("job {0} no longer exists")]
    JobMissing(JobId),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("barrier {barrier} aborted: job status is {}", status.map(|s| s.to_string()).unwrap_or_else(|| "DELETED".to_string()))]
    BarrierAborted {
        barrier: String,
        status: Option<Status>,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Process exit code for a worker that stops on this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::BarrierAborted { .. } => 3,
            Error::JobMissing(_) => 4,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
