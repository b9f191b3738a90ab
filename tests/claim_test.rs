//! Integration tests for the claim engine against the in-memory store.

use chrono::{Duration as ChronoDuration, Utc};
use jobmonitor_rs::db::{ClaimFilter, JobStore, MemoryStore};
use jobmonitor_rs::engine::{claim, claim_next};
use jobmonitor_rs::model::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn job(name: &str) -> NewJob {
    NewJob::new("proj", "exp", name).script("noop")
}

// ---------------------------------------------------------------------------
// Atomicity
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claimants_get_distinct_ranks() {
    let store = Arc::new(MemoryStore::new());
    let record = store.insert(job("wide").n_workers(3)).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        let filter = ClaimFilter::ids(vec![record.id]);
        handles.push(tokio::spawn(async move {
            store.claim(&filter).await.unwrap().map(|c| c.rank)
        }));
    }

    let mut ranks = Vec::new();
    for handle in handles {
        if let Some(rank) = handle.await.unwrap() {
            ranks.push(rank);
        }
    }

    assert_eq!(ranks.len(), 3, "exactly min(N, k) claims succeed");
    let distinct: BTreeSet<u32> = ranks.into_iter().collect();
    assert_eq!(distinct, BTreeSet::from([0, 1, 2]));

    let stored = store.get(record.id).await.unwrap().unwrap();
    assert_eq!(stored.registered_workers, 3);
    assert_eq!(stored.status, Status::Scheduled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fewer_claimants_than_slots_all_succeed() {
    let store = Arc::new(MemoryStore::new());
    let record = store.insert(job("wide").n_workers(5)).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..2 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store.claim(&ClaimFilter::any()).await.unwrap()
        }));
    }
    let mut claimed = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            claimed += 1;
        }
    }

    assert_eq!(claimed, 2);
    let stored = store.get(record.id).await.unwrap().unwrap();
    assert_eq!(stored.registered_workers, 2);
}

#[tokio::test]
async fn first_claim_sets_schedule_time_once() {
    let store = MemoryStore::new();
    let record = store.insert(job("pair").n_workers(2)).await.unwrap();
    assert!(record.schedule_time.is_none());

    let first = store.claim(&ClaimFilter::any()).await.unwrap().unwrap();
    let scheduled = first.job.schedule_time.expect("schedule_time set");
    assert_eq!(first.rank, 0);

    let second = store.claim(&ClaimFilter::any()).await.unwrap().unwrap();
    assert_eq!(second.rank, 1);
    assert_eq!(second.job.schedule_time, Some(scheduled));
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn highest_priority_wins() {
    let store = MemoryStore::new();
    for (name, priority) in [("low", 1), ("high", 5), ("mid", 3)] {
        store.insert(job(name).priority(priority)).await.unwrap();
    }

    let claimed = claim(&store, &ClaimFilter::any()).await.unwrap().unwrap();
    assert_eq!(claimed.job.priority, 5);
    assert_eq!(claimed.job.job, "high");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn contended_claims_fill_the_highest_priority_job_first() {
    let store = Arc::new(MemoryStore::new());
    let low = store.insert(job("low").priority(0)).await.unwrap();
    let high = store
        .insert(job("high").priority(10).n_workers(4))
        .await
        .unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                claim(store.as_ref(), &ClaimFilter::any())
                    .await
                    .unwrap()
                    .map(|c| c.job.id)
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap(), Some(high.id));
    }

    let next = claim(store.as_ref(), &ClaimFilter::any()).await.unwrap().unwrap();
    assert_eq!(next.job.id, low.id);
}

#[tokio::test]
async fn equal_priority_takes_oldest() {
    let store = MemoryStore::new();
    let now = Utc::now();
    let newer = JobRecord::from_new(job("newer").priority(2), now);
    let older = JobRecord::from_new(job("older").priority(2), now - ChronoDuration::seconds(30));
    store.put(newer);
    store.put(older.clone());

    let claimed = claim(&store, &ClaimFilter::any()).await.unwrap().unwrap();
    assert_eq!(claimed.job.id, older.id);
}

// ---------------------------------------------------------------------------
// Eligibility
// ---------------------------------------------------------------------------

#[tokio::test]
async fn explicit_ids_miss_returns_none() {
    let store = MemoryStore::new();
    store.insert(job("other")).await.unwrap();

    let filter = ClaimFilter::ids(vec![JobId::new()]);
    assert!(claim(&store, &filter).await.unwrap().is_none());
}

#[tokio::test]
async fn full_job_is_not_claimable() {
    let store = MemoryStore::new();
    let record = store.insert(job("single")).await.unwrap();
    let filter = ClaimFilter::ids(vec![record.id]);

    assert!(claim(&store, &filter).await.unwrap().is_some());
    assert!(claim(&store, &filter).await.unwrap().is_none());
}

#[tokio::test]
async fn terminal_and_running_jobs_are_not_claimable() {
    let store = MemoryStore::new();
    for status in [
        Status::Running,
        Status::Finished,
        Status::Failed,
        Status::Canceled,
    ] {
        let record = store.insert(job("done").n_workers(2)).await.unwrap();
        store.force_status(record.id, status);
        let filter = ClaimFilter::ids(vec![record.id]);
        assert!(
            claim(&store, &filter).await.unwrap().is_none(),
            "{status} must not be claimable"
        );
    }
}

#[tokio::test]
async fn min_worker_count_filters_small_jobs() {
    let store = MemoryStore::new();
    store.insert(job("small").priority(10)).await.unwrap();
    let wide = store.insert(job("wide").n_workers(4)).await.unwrap();

    let filter = ClaimFilter::any().min_worker_count(Some(2));
    let claimed = claim(&store, &filter).await.unwrap().unwrap();
    assert_eq!(claimed.job.id, wide.id);
}

// ---------------------------------------------------------------------------
// claim_next
// ---------------------------------------------------------------------------

#[tokio::test]
async fn claim_next_with_ids_does_not_wait() {
    let store = MemoryStore::new();
    let shutdown = CancellationToken::new();

    let result = tokio::time::timeout(
        Duration::from_secs(1),
        claim_next(
            &store,
            &ClaimFilter::ids(vec![JobId::new()]),
            Duration::from_secs(60),
            &shutdown,
        ),
    )
    .await
    .expect("explicit miss returns immediately");
    assert!(result.unwrap().is_none());
}

#[tokio::test]
async fn claim_next_any_waits_for_work() {
    let store = Arc::new(MemoryStore::new());
    let shutdown = CancellationToken::new();

    let producer = Arc::clone(&store);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        producer.insert(job("late")).await.unwrap();
    });

    let claimed = claim_next(
        &*store,
        &ClaimFilter::any(),
        Duration::from_millis(10),
        &shutdown,
    )
    .await
    .unwrap()
    .expect("job appears eventually");
    assert_eq!(claimed.job.job, "late");
    assert_eq!(claimed.rank, 0);
}

#[tokio::test]
async fn claim_next_any_stops_on_shutdown() {
    let store = MemoryStore::new();
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    let result = claim_next(
        &store,
        &ClaimFilter::any(),
        Duration::from_secs(60),
        &shutdown,
    )
    .await
    .unwrap();
    assert!(result.is_none());
}
