//! # jobmonitor-rs
//!
//! Leaderless coordination for pools of compute workers that share nothing
//! but a job record store.
//!
//! Workers claim slots of queued jobs atomically, rendezvous at named
//! barriers, heartbeat and watch for out-of-band cancellation, and funnel
//! their workload's logs and metrics back into the job record. Postgres
//! (sqlx) backs the store in production; [`db::MemoryStore`] implements the
//! same contract in process.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod model;
pub mod telemetry;
pub mod workload;
