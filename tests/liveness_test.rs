//! Integration tests for the liveness monitor.

use jobmonitor_rs::db::{ClaimFilter, JobStore, MemoryStore};
use jobmonitor_rs::engine::LivenessMonitor;
use jobmonitor_rs::model::*;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const INTERVAL: Duration = Duration::from_millis(25);
const GRACE: Duration = Duration::from_millis(200);

async fn running_job(store: &MemoryStore) -> JobId {
    let record = store
        .insert(NewJob::new("proj", "exp", "live"))
        .await
        .unwrap();
    store.claim(&ClaimFilter::ids(vec![record.id])).await.unwrap();
    store.force_status(record.id, Status::Running);
    record.id
}

#[tokio::test]
async fn writes_job_and_worker_heartbeats() {
    let store = Arc::new(MemoryStore::new());
    let id = running_job(&store).await;
    let self_destruct = CancellationToken::new();

    let monitor = LivenessMonitor::start(store.clone(), id, 0, INTERVAL, self_destruct.clone());
    tokio::time::sleep(INTERVAL * 3).await;
    monitor.stop(GRACE).await;

    let record = store.get(id).await.unwrap().unwrap();
    let job_beat = record.last_heartbeat_time.expect("job heartbeat written");
    let worker_beat = record.workers[&0]
        .last_heartbeat_time
        .expect("worker heartbeat written");
    assert_eq!(job_beat, worker_beat);
    assert!(!self_destruct.is_cancelled());
}

#[tokio::test]
async fn heartbeats_keep_advancing() {
    let store = Arc::new(MemoryStore::new());
    let id = running_job(&store).await;

    let monitor = LivenessMonitor::start(
        store.clone(),
        id,
        0,
        INTERVAL,
        CancellationToken::new(),
    );
    tokio::time::sleep(INTERVAL * 2).await;
    let first = store.get(id).await.unwrap().unwrap().last_heartbeat_time;
    tokio::time::sleep(INTERVAL * 3).await;
    let later = store.get(id).await.unwrap().unwrap().last_heartbeat_time;
    monitor.stop(GRACE).await;

    assert!(later > first);
}

#[tokio::test]
async fn external_cancel_fires_self_destruct_within_an_interval() {
    let store = Arc::new(MemoryStore::new());
    let id = running_job(&store).await;
    let self_destruct = CancellationToken::new();

    let monitor = LivenessMonitor::start(store.clone(), id, 0, INTERVAL, self_destruct.clone());
    tokio::time::sleep(INTERVAL).await;
    store.force_status(id, Status::Canceled);

    tokio::time::timeout(INTERVAL * 4, self_destruct.cancelled())
        .await
        .expect("self-destruct should fire");
    assert!(monitor.is_stopping());
    monitor.stop(GRACE).await;
}

#[tokio::test]
async fn deleted_job_fires_self_destruct() {
    let store = Arc::new(MemoryStore::new());
    let id = running_job(&store).await;
    let self_destruct = CancellationToken::new();

    let monitor = LivenessMonitor::start(store.clone(), id, 1, INTERVAL, self_destruct.clone());
    store.delete(id);

    tokio::time::timeout(INTERVAL * 4, self_destruct.cancelled())
        .await
        .expect("self-destruct should fire");
    monitor.stop(GRACE).await;
}

#[tokio::test]
async fn finished_job_keeps_worker_alive() {
    let store = Arc::new(MemoryStore::new());
    let id = running_job(&store).await;
    store.force_status(id, Status::Finished);
    let self_destruct = CancellationToken::new();

    let monitor = LivenessMonitor::start(store.clone(), id, 1, INTERVAL, self_destruct.clone());
    tokio::time::sleep(INTERVAL * 3).await;
    monitor.stop(GRACE).await;

    assert!(!self_destruct.is_cancelled());
}

#[tokio::test]
async fn shutdown_latch_suppresses_self_destruct() {
    let store = Arc::new(MemoryStore::new());
    let id = running_job(&store).await;
    let self_destruct = CancellationToken::new();

    let monitor = LivenessMonitor::start(store.clone(), id, 0, INTERVAL, self_destruct.clone());
    tokio::time::sleep(INTERVAL).await;

    // The harness latches before writing its own terminal status.
    monitor.begin_shutdown();
    store.force_status(id, Status::Failed);
    tokio::time::sleep(INTERVAL * 4).await;

    assert!(!self_destruct.is_cancelled());
    monitor.stop(GRACE).await;
}

#[tokio::test]
async fn stop_is_prompt() {
    let store = Arc::new(MemoryStore::new());
    let id = running_job(&store).await;

    let monitor = LivenessMonitor::start(
        store.clone(),
        id,
        0,
        Duration::from_secs(3600),
        CancellationToken::new(),
    );
    tokio::time::timeout(Duration::from_secs(1), monitor.stop(GRACE))
        .await
        .expect("stop returns without waiting for the next tick");
}
