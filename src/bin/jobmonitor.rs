//! jobmonitor CLI: run a worker slot, or inspect and steer jobs.

use chrono::Utc;
use clap::{Parser, Subcommand};
use jobmonitor_rs::config::Config;
use jobmonitor_rs::db::{ClaimFilter, Db, JobStore, JobUpdate};
use jobmonitor_rs::engine::{Harness, HarnessConfig, RunOutcome};
use jobmonitor_rs::error::Error;
use jobmonitor_rs::model::{JobId, NewJob, Status};
use jobmonitor_rs::telemetry::{TelemetryConfig, init_telemetry};
use jobmonitor_rs::workload::WorkloadRegistry;
use secrecy::ExposeSecret;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

#[derive(Parser)]
#[command(name = "jobmonitor", about = "Leaderless job execution for worker pools")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Claim one job slot and run it
    Run {
        /// Job IDs to pick from, or `any` to take the best queued job
        #[arg(required = true)]
        job_ids: Vec<String>,
        /// Only take jobs declaring at least this many workers
        #[arg(long)]
        min_worker_count: Option<u32>,
    },
    /// Submit a new job
    Submit {
        project: String,
        experiment: String,
        /// Job name
        name: String,
        /// Registered workload to run
        #[arg(long)]
        script: String,
        /// JSON object of config overrides
        #[arg(long)]
        config: Option<String>,
        /// Number of cooperating workers
        #[arg(long, default_value_t = 1)]
        workers: u32,
        /// Priority (higher = picked first)
        #[arg(long, default_value_t = 0)]
        priority: i32,
    },
    /// Show a job
    Show { id: String },
    /// Show per-rank liveness of a job
    Workers { id: String },
    /// Cancel a job that has not reached a terminal status
    Cancel { id: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match dispatch(cli.command).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            let code = e
                .downcast_ref::<Error>()
                .map(Error::exit_code)
                .unwrap_or(1);
            eprintln!("error: {e:#}");
            ExitCode::from(code as u8)
        }
    }
}

async fn dispatch(command: Command) -> anyhow::Result<u8> {
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "jobmonitor".to_string(),
        default_filter: config.log_level.clone(),
    })?;

    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;

    let code = match command {
        Command::Run {
            job_ids,
            min_worker_count,
        } => cmd_run(&config, db.clone(), job_ids, min_worker_count).await?,
        Command::Submit {
            project,
            experiment,
            name,
            script,
            config: overrides,
            workers,
            priority,
        } => {
            cmd_submit(
                &db,
                &project,
                &experiment,
                &name,
                &script,
                overrides,
                workers,
                priority,
            )
            .await?;
            0
        }
        Command::Show { id } => {
            cmd_show(&db, &id).await?;
            0
        }
        Command::Workers { id } => {
            cmd_workers(&db, &id, config.heartbeat_interval).await?;
            0
        }
        Command::Cancel { id } => {
            cmd_cancel(&db, &id).await?;
            0
        }
    };

    db.close().await;
    Ok(code)
}

async fn cmd_run(
    config: &Config,
    db: Db,
    job_ids: Vec<String>,
    min_worker_count: Option<u32>,
) -> anyhow::Result<u8> {
    let filter = if job_ids.iter().any(|id| id.eq_ignore_ascii_case("any")) {
        ClaimFilter::any()
    } else {
        let ids = job_ids
            .iter()
            .map(|id| id.parse::<JobId>())
            .collect::<Result<Vec<_>, _>>()?;
        ClaimFilter::ids(ids)
    }
    .min_worker_count(min_worker_count);

    let registry = WorkloadRegistry::load_from_dir(&config.workloads_dir)?;
    let harness_config = HarnessConfig::from(config);
    let grace = harness_config.heartbeat_interval;

    let harness = Harness::new(Arc::new(db), Arc::new(registry), harness_config);
    let cancel = harness.cancellation_token();
    tokio::spawn(forward_signals(cancel.clone()));
    tokio::spawn(watchdog(cancel, grace));

    let outcome = harness.run(&filter).await?;
    if let RunOutcome::Completed {
        job_id,
        rank,
        status,
    } = outcome
    {
        println!("{job_id} rank {rank}: {status}");
    } else {
        println!("nothing to claim");
    }
    Ok(outcome.exit_code() as u8)
}

/// Turn SIGINT/SIGTERM into a canceled workload.
async fn forward_signals(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                warn!("cannot install SIGTERM handler: {e}");
                tokio::signal::ctrl_c().await.ok();
                cancel.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await.ok();

    warn!("termination signal received, canceling");
    cancel.cancel();
}

/// Exit the process if teardown has not completed `grace` after
/// cancellation.
async fn watchdog(cancel: CancellationToken, grace: Duration) {
    cancel.cancelled().await;
    tokio::time::sleep(grace).await;
    error!("teardown did not finish in time, exiting");
    std::process::exit(2);
}

#[allow(clippy::too_many_arguments)]
async fn cmd_submit(
    db: &Db,
    project: &str,
    experiment: &str,
    name: &str,
    script: &str,
    overrides: Option<String>,
    workers: u32,
    priority: i32,
) -> anyhow::Result<()> {
    let overrides = match overrides {
        Some(json) => match serde_json::from_str::<serde_json::Value>(&json)? {
            serde_json::Value::Object(map) => map,
            other => anyhow::bail!("--config must be a JSON object, got {other}"),
        },
        None => serde_json::Map::new(),
    };

    let new = NewJob::new(project, experiment, name)
        .script(script)
        .config(overrides)
        .n_workers(workers)
        .priority(priority);
    let job = db.insert(new).await?;

    println!("Created: {} (status: {})", job.id, job.status);
    Ok(())
}

async fn cmd_show(db: &Db, id: &str) -> anyhow::Result<()> {
    let id: JobId = id.parse()?;
    let job = db.get(id).await?.ok_or(Error::JobMissing(id))?;

    println!("ID:         {}", job.id);
    println!("Project:    {}", job.project);
    println!("Experiment: {}", job.experiment);
    println!("Job:        {}", job.job);
    println!("Script:     {}", job.environment.script);
    println!("Status:     {}", job.status);
    println!("Priority:   {}", job.priority);
    println!("Workers:    {}/{}", job.registered_workers, job.n_workers);
    println!("Created:    {}", job.creation_time);
    if let Some(t) = job.schedule_time {
        println!("Scheduled:  {t}");
    }
    if let Some(t) = job.start_time {
        println!("Started:    {t}");
    }
    if let Some(t) = job.end_time {
        println!("Ended:      {t}");
    }
    println!("Host:       {}", job.host.as_deref().unwrap_or("-"));
    println!("Output:     {}", job.output_dir.as_deref().unwrap_or("-"));
    println!("Config:     {}", serde_json::to_string_pretty(&job.config)?);
    if !job.info.is_empty() {
        println!("Info:       {}", serde_json::to_string_pretty(&job.info)?);
    }

    let series = job.metric_series();
    if !series.is_empty() {
        println!("---");
        for m in series {
            let samples = job.metric_data.get(&m.id).map(Vec::len).unwrap_or(0);
            println!("Metric:     {} {:?} ({samples} samples)", m.measurement, m.tags);
        }
    }
    for (key, path) in &job.images {
        println!("Image:      {key} -> {path}");
    }

    if let Some(ref exception) = job.exception {
        println!("---");
        println!(
            "Failed on:  rank {}",
            job.exception_worker
                .map(|r| r.to_string())
                .unwrap_or("-".to_string())
        );
        println!("Exception:  {exception}");
        if let Some(ref tb) = job.traceback {
            println!("{tb}");
        }
    }

    Ok(())
}

async fn cmd_workers(db: &Db, id: &str, heartbeat_interval: Duration) -> anyhow::Result<()> {
    let id: JobId = id.parse()?;
    let job = db.get(id).await?.ok_or(Error::JobMissing(id))?;
    let dead = job.dead_workers(Utc::now(), heartbeat_interval);

    println!("{:<5}  {:<24}  {:<8}  {:<26}  STATE", "RANK", "HOST", "PID", "HEARTBEAT");
    println!("{}", "-".repeat(80));
    for rank in 0..job.registered_workers {
        let worker = job.workers.get(&rank);
        let host = worker.and_then(|w| w.host.as_deref()).unwrap_or("-");
        let pid = worker
            .and_then(|w| w.pid)
            .map(|p| p.to_string())
            .unwrap_or("-".to_string());
        let beat = worker
            .and_then(|w| w.last_heartbeat_time)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or("-".to_string());
        let state = if dead.contains(&rank) { "dead" } else { "alive" };
        println!("{rank:<5}  {host:<24}  {pid:<8}  {beat:<26}  {state}");
    }

    println!("\n{}/{} worker(s) registered", job.registered_workers, job.n_workers);
    Ok(())
}

async fn cmd_cancel(db: &Db, id: &str) -> anyhow::Result<()> {
    let id: JobId = id.parse()?;
    let canceled = db
        .transition(
            id,
            &[Status::Created, Status::Scheduled, Status::Running],
            Status::Canceled,
            &[JobUpdate::EndTime(Utc::now())],
        )
        .await?;

    if canceled {
        println!("Canceled: {id}");
    } else {
        match db.status(id).await? {
            Some(status) => println!("Not canceled: {id} is already {status}"),
            None => return Err(Error::JobMissing(id).into()),
        }
    }
    Ok(())
}
