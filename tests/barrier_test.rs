//! Integration tests for the rendezvous barrier.

use jobmonitor_rs::db::{ClaimFilter, JobStore, MemoryStore};
use jobmonitor_rs::engine::{JOBSTART, await_barrier};
use jobmonitor_rs::error::Error;
use jobmonitor_rs::model::*;
use std::sync::Arc;
use std::time::Duration;

const POLL: Duration = Duration::from_millis(20);

async fn scheduled_job(store: &MemoryStore, n_workers: u32) -> JobId {
    let record = store
        .insert(NewJob::new("proj", "exp", "sync").n_workers(n_workers))
        .await
        .unwrap();
    store.claim(&ClaimFilter::ids(vec![record.id])).await.unwrap();
    record.id
}

fn spawn_waiter(
    store: &Arc<MemoryStore>,
    id: JobId,
    expected: u32,
) -> tokio::task::JoinHandle<jobmonitor_rs::error::Result<()>> {
    let store = Arc::clone(store);
    tokio::spawn(async move {
        await_barrier(&*store, id, JOBSTART, expected, &Status::STARTUP, POLL).await
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_workers_converge() {
    let store = Arc::new(MemoryStore::new());
    let id = scheduled_job(&store, 3).await;

    let waiters: Vec<_> = (0..3).map(|_| spawn_waiter(&store, id, 3)).collect();
    for waiter in waiters {
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("barrier should release")
            .unwrap()
            .unwrap();
    }

    let record = store.get(id).await.unwrap().unwrap();
    assert_eq!(record.barrier_count(JOBSTART), 3);
}

#[tokio::test]
async fn no_worker_leaves_before_everyone_arrives() {
    let store = Arc::new(MemoryStore::new());
    let id = scheduled_job(&store, 3).await;

    let first = spawn_waiter(&store, id, 3);
    let second = spawn_waiter(&store, id, 3);
    tokio::time::sleep(POLL * 5).await;
    assert!(!first.is_finished());
    assert!(!second.is_finished());

    let third = spawn_waiter(&store, id, 3);
    for waiter in [first, second, third] {
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

#[tokio::test]
async fn overshoot_still_releases() {
    let store = Arc::new(MemoryStore::new());
    let id = scheduled_job(&store, 2).await;

    // A retried increment from an earlier attempt.
    for _ in 0..2 {
        store.increment_barrier(id, JOBSTART).await.unwrap();
    }

    let waiter = spawn_waiter(&store, id, 2);
    tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(store.get(id).await.unwrap().unwrap().barrier_count(JOBSTART), 3);
}

#[tokio::test]
async fn cancellation_aborts_waiters_within_one_poll() {
    let store = Arc::new(MemoryStore::new());
    let id = scheduled_job(&store, 3).await;

    let first = spawn_waiter(&store, id, 3);
    let second = spawn_waiter(&store, id, 3);
    tokio::time::sleep(POLL * 3).await;

    store.force_status(id, Status::Canceled);

    for waiter in [first, second] {
        let result = tokio::time::timeout(POLL * 10, waiter)
            .await
            .expect("waiter should abort promptly")
            .unwrap();
        match result {
            Err(e @ Error::BarrierAborted { .. }) => {
                assert_ne!(e.exit_code(), 0);
                assert!(matches!(
                    e,
                    Error::BarrierAborted {
                        status: Some(Status::Canceled),
                        ..
                    }
                ));
            }
            other => panic!("expected BarrierAborted, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn deleted_job_aborts_waiters() {
    let store = Arc::new(MemoryStore::new());
    let id = scheduled_job(&store, 2).await;

    let waiter = spawn_waiter(&store, id, 2);
    tokio::time::sleep(POLL * 2).await;
    assert!(store.delete(id));

    let result = tokio::time::timeout(POLL * 10, waiter).await.unwrap().unwrap();
    assert!(matches!(
        result,
        Err(Error::BarrierAborted { status: None, .. })
    ));
}

#[tokio::test]
async fn missing_job_aborts_on_arrival() {
    let store = MemoryStore::new();
    let result = await_barrier(&store, JobId::new(), JOBSTART, 2, &Status::STARTUP, POLL).await;
    assert!(matches!(result, Err(Error::BarrierAborted { status: None, .. })));
}

#[tokio::test]
async fn single_worker_passes_without_touching_the_store() {
    let store = MemoryStore::new();
    let id = scheduled_job(&store, 1).await;

    await_barrier(&store, id, JOBSTART, 1, &Status::STARTUP, POLL)
        .await
        .unwrap();
    assert_eq!(store.get(id).await.unwrap().unwrap().barrier_count(JOBSTART), 0);
}

#[tokio::test]
async fn empty_allowed_set_skips_status_check() {
    let store = Arc::new(MemoryStore::new());
    let id = scheduled_job(&store, 2).await;
    store.force_status(id, Status::Finished);

    let a = {
        let store = Arc::clone(&store);
        tokio::spawn(async move { await_barrier(&*store, id, "checkpoint", 2, &[], POLL).await })
    };
    let b = {
        let store = Arc::clone(&store);
        tokio::spawn(async move { await_barrier(&*store, id, "checkpoint", 2, &[], POLL).await })
    };
    for waiter in [a, b] {
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
