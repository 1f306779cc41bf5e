
use std::sync::Arc;
use std::time::Duration;

use queuectl::config::WorkerConfig;
use queuectl::store::{Job, JobState, JobStore, NewJob};
use queuectl::worker::WorkerPool;
use tokio_util::sync::CancellationToken;

use test_harness::{new_job, test_store};

/// Worker tunables fast enough for tests; stale threshold still exceeds
/// the execution timeout as required.
fn test_config() -> WorkerConfig {
    WorkerConfig {
        poll_interval_ms: 50,
        exec_timeout_ms: 5_000,
        stale_lock_ms: 10_000,
        backoff_cap_secs: 3_600,
    }
}

/// Poll the store until the job satisfies `predicate` or 5 seconds pass.
async fn wait_for_job<F>(store: &JobStore, id: &str, predicate: F) -> Job
where
    F: Fn(&Job) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(job) = store.job(id).await.unwrap() {
            if predicate(&job) {
                return job;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for job {}",
            id
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn worker_completes_a_job_and_records_output() {
    let (store, _dir) = test_store().await;
    store.enqueue(new_job("job-1", "echo hello")).await.unwrap();

    let token = CancellationToken::new();
    let pool = WorkerPool::spawn(1, Arc::clone(&store), test_config(), token.clone());

    let job = wait_for_job(&store, "job-1", |j| j.state == JobState::Completed).await;
    assert_eq!(job.attempts, 1);
    assert_eq!(job.stdout.as_deref(), Some("hello"));
    assert!(job.locked_by.is_none());
    assert!(job.started_at.is_some());
    assert!(job.completed_at.is_some());

    token.cancel();
    pool.join().await;
}

#[tokio::test]
async fn exhausted_job_lands_in_the_dead_letter_queue() {
    let (store, _dir) = test_store().await;
    store
        .enqueue(NewJob {
            max_retries: Some(1),
            ..new_job("job-1", "exit 1")
        })
        .await
        .unwrap();

    let token = CancellationToken::new();
    let pool = WorkerPool::spawn(1, Arc::clone(&store), test_config(), token.clone());

    let job = wait_for_job(&store, "job-1", |j| j.state == JobState::Dead).await;
    assert_eq!(job.attempts, 1);
    assert!(job.completed_at.is_some());
    assert!(job.stderr.is_some());

    token.cancel();
    pool.join().await;
}

#[tokio::test]
async fn failed_job_is_rescheduled_with_backoff() {
    let (store, _dir) = test_store().await;
    store
        .enqueue(NewJob {
            max_retries: Some(3),
            ..new_job("job-1", "exit 1")
        })
        .await
        .unwrap();

    let token = CancellationToken::new();
    let pool = WorkerPool::spawn(1, Arc::clone(&store), test_config(), token.clone());

    let job = wait_for_job(&store, "job-1", |j| j.state == JobState::Failed).await;
    assert_eq!(job.attempts, 1);
    assert!(job.locked_by.is_none());
    assert!(job.completed_at.is_none());

    // Default backoff base is 2, so the first retry waits 2^1 seconds.
    let delay_ms = (job.run_at - job.updated_at).num_milliseconds();
    assert!(
        (1_000..=3_000).contains(&delay_ms),
        "unexpected backoff delay {}ms",
        delay_ms
    );

    token.cancel();
    pool.join().await;
}

#[tokio::test]
async fn backoff_base_is_read_from_config_at_decision_time() {
    let (store, _dir) = test_store().await;
    store.config_set("backoff_base", "4").await.unwrap();
    store
        .enqueue(NewJob {
            max_retries: Some(3),
            ..new_job("job-1", "exit 1")
        })
        .await
        .unwrap();

    let token = CancellationToken::new();
    let pool = WorkerPool::spawn(1, Arc::clone(&store), test_config(), token.clone());

    let job = wait_for_job(&store, "job-1", |j| j.state == JobState::Failed).await;
    let delay_ms = (job.run_at - job.updated_at).num_milliseconds();
    assert!(
        (3_000..=5_000).contains(&delay_ms),
        "unexpected backoff delay {}ms",
        delay_ms
    );

    token.cancel();
    pool.join().await;
}

#[tokio::test]
async fn attempts_climb_monotonically_until_dead() {
    let (store, _dir) = test_store().await;
    // Base 0 makes retries eligible immediately, so the job burns through
    // its whole budget without the test waiting out real backoff delays.
    store.config_set("backoff_base", "0").await.unwrap();
    store
        .enqueue(NewJob {
            max_retries: Some(3),
            ..new_job("job-1", "exit 1")
        })
        .await
        .unwrap();

    let token = CancellationToken::new();
    let pool = WorkerPool::spawn(1, Arc::clone(&store), test_config(), token.clone());

    let job = wait_for_job(&store, "job-1", |j| j.state == JobState::Dead).await;
    assert_eq!(job.attempts, 3);

    token.cancel();
    pool.join().await;
}

#[tokio::test]
async fn workers_stop_cooperatively_when_cancelled() {
    let (store, _dir) = test_store().await;

    let token = CancellationToken::new();
    let pool = WorkerPool::spawn(4, Arc::clone(&store), test_config(), token.clone());

    // Let the workers reach their idle poll, then stop them.
    tokio::time::sleep(Duration::from_millis(100)).await;
    token.cancel();

    tokio::time::timeout(Duration::from_secs(2), pool.join())
        .await
        .expect("workers did not stop after cancellation");
}

#[tokio::test]
async fn two_workers_share_a_backlog_without_double_execution() {
    let (store, _dir) = test_store().await;
    for n in 0..6 {
        store
            .enqueue(new_job(&format!("job-{}", n), "echo ok"))
            .await
            .unwrap();
    }

    let token = CancellationToken::new();
    let pool = WorkerPool::spawn(2, Arc::clone(&store), test_config(), token.clone());

    for n in 0..6 {
        let job = wait_for_job(&store, &format!("job-{}", n), |j| {
            j.state == JobState::Completed
        })
        .await;
        // Exactly one consumed attempt each: nobody executed a job twice.
        assert_eq!(job.attempts, 1);
    }

    token.cancel();
    pool.join().await;
}
