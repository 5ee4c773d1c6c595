//! Lease exclusivity and stale-lease recovery (§8): at most one worker
//! observes a given job as leased within the visibility window, and a job
//! abandoned by a dead worker becomes re-leasable once the window elapses.

mod common;

use std::time::Duration;

use common::TestHarness;
use pipeline_core::domains::jobs::JobQueueStore;

#[tokio::test]
async fn concurrent_lease_attempts_yield_the_job_to_exactly_one_worker() {
    let ctx = TestHarness::new().await;
    let queue = std::sync::Arc::new(JobQueueStore::new(ctx.db_pool.clone()));

    let queue_name = format!("lease-test-{}", uuid::Uuid::new_v4());
    queue
        .enqueue(&queue_name, "scrape_full", serde_json::json!({}), 0, None)
        .await
        .expect("enqueue");

    let queues = vec![queue_name.clone()];
    let mut attempts = Vec::new();
    for worker_id in 0..8 {
        let queue = queue.clone();
        let queues = queues.clone();
        attempts.push(tokio::spawn(async move {
            queue
                .lease(&queues, &format!("worker-{worker_id}"), Duration::from_secs(60))
                .await
                .expect("lease")
        }));
    }

    let mut leased_by = Vec::new();
    for attempt in attempts {
        if let Some(job) = attempt.await.expect("task") {
            leased_by.push(job.id);
        }
    }

    assert_eq!(leased_by.len(), 1, "exactly one worker should have leased the single pending job");
}

#[tokio::test]
async fn a_job_whose_lease_expired_is_re_leasable() {
    let ctx = TestHarness::new().await;
    let queue = JobQueueStore::new(ctx.db_pool.clone());

    let queue_name = format!("lease-test-{}", uuid::Uuid::new_v4());
    queue
        .enqueue(&queue_name, "scrape_full", serde_json::json!({}), 0, None)
        .await
        .expect("enqueue");

    let queues = vec![queue_name.clone()];
    let first = queue
        .lease(&queues, "worker-a", Duration::from_millis(1))
        .await
        .expect("lease")
        .expect("job leased");

    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = queue
        .lease(&queues, "worker-b", Duration::from_secs(60))
        .await
        .expect("lease")
        .expect("expired lease should be re-leasable");

    assert_eq!(first.id, second.id);
}
