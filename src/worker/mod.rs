//! Worker pool and per-worker control loop.
//!
//! Each worker is simple sequential code: claim the next eligible job,
//! execute it, feed the outcome to the retry policy and write the result
//! back. Parallelism comes entirely from running multiple workers; the
//! store's claim transaction is their only coordination point.
//!
//! Stop is cooperative. A cancelled token is honored between jobs, never
//! mid-execution; the execution timeout is the only preemption of a hung
//! command.

pub mod executor;
pub mod retry;

pub use executor::{CommandExecutor, ExecOutcome, ExecutionResult, FailureReason};
pub use retry::{Disposition, RetryPolicy};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::store::{JobStore, Job, JobState, Resolution, CONFIG_BACKOFF_BASE};

const FALLBACK_BACKOFF_BASE: u32 = 2;

/// Handle to a group of spawned workers.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers sharing one store handle.
    ///
    /// Callers should run [`WorkerConfig::validate`] first; an invalid
    /// stale threshold makes duplicate execution possible.
    pub fn spawn(
        count: usize,
        store: Arc<JobStore>,
        config: WorkerConfig,
        token: CancellationToken,
    ) -> Self {
        let mut handles = Vec::with_capacity(count);
        for n in 0..count {
            let worker_id = format!("worker-{}-{}", n, Uuid::new_v4());
            let store = Arc::clone(&store);
            let config = config.clone();
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(worker_id, store, config, token).await;
            }));
        }
        Self { handles }
    }

    /// Wait for all workers to exit.
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(
    worker_id: String,
    store: Arc<JobStore>,
    config: WorkerConfig,
    token: CancellationToken,
) {
    tracing::info!(worker_id = %worker_id, "Worker starting");

    let executor = CommandExecutor::new(config.exec_timeout());
    let policy = RetryPolicy::new(config.backoff_cap_secs);

    while !token.is_cancelled() {
        match store.claim_next(&worker_id, config.stale_lock()).await {
            Ok(Some(job)) => {
                if let Err(e) = run_job(&worker_id, &store, &executor, &policy, &job).await {
                    tracing::error!(
                        worker_id = %worker_id,
                        job_id = %job.id,
                        error = %e,
                        "Unhandled error in worker cycle"
                    );
                    release_after_error(&store, &job, &e.to_string()).await;
                    idle_pause(&token, config.poll_interval()).await;
                }
                // On success, immediately try to claim the next job.
            }
            Ok(None) => idle_pause(&token, config.poll_interval()).await,
            Err(e) => {
                tracing::error!(worker_id = %worker_id, error = %e, "Claim failed");
                idle_pause(&token, config.poll_interval()).await;
            }
        }
    }

    tracing::info!(worker_id = %worker_id, "Worker stopped");
}

/// Execute one claimed job and persist the outcome.
async fn run_job(
    worker_id: &str,
    store: &JobStore,
    executor: &CommandExecutor,
    policy: &RetryPolicy,
    job: &Job,
) -> Result<()> {
    let attempt = job.attempts + 1;
    tracing::info!(
        worker_id = %worker_id,
        job_id = %job.id,
        attempt,
        max_retries = job.max_retries,
        command = %job.command,
        "Starting job"
    );

    let result = executor.execute(&job.command).await;

    // Read the base at decision time so config changes apply to the next
    // retry computation.
    let backoff_base: u32 = store
        .config_get(CONFIG_BACKOFF_BASE)
        .await?
        .parse()
        .unwrap_or(FALLBACK_BACKOFF_BASE);

    let now = Utc::now();
    let disposition = policy.decide(
        result.succeeded(),
        attempt,
        job.max_retries,
        backoff_base,
        now,
    );

    let stderr = match &result.outcome {
        ExecOutcome::Failure(reason) if result.stderr.is_empty() => reason.to_string(),
        _ => result.stderr.clone(),
    };

    match disposition {
        Disposition::Completed => {
            tracing::info!(worker_id = %worker_id, job_id = %job.id, attempt, "Job completed");
            store
                .resolve(
                    &job.id,
                    Resolution {
                        state: JobState::Completed,
                        attempts: attempt,
                        stdout: result.stdout,
                        stderr,
                        run_at: None,
                    },
                )
                .await
        }
        Disposition::Dead => {
            tracing::warn!(
                worker_id = %worker_id,
                job_id = %job.id,
                attempt,
                max_retries = job.max_retries,
                "Max retries reached, moving job to dead-letter queue"
            );
            store
                .resolve(
                    &job.id,
                    Resolution {
                        state: JobState::Dead,
                        attempts: attempt,
                        stdout: result.stdout,
                        stderr,
                        run_at: None,
                    },
                )
                .await
        }
        Disposition::Retry { run_at } => {
            tracing::warn!(
                worker_id = %worker_id,
                job_id = %job.id,
                attempt,
                next_run_at = %run_at,
                "Job failed, retry scheduled"
            );
            store
                .resolve(
                    &job.id,
                    Resolution {
                        state: JobState::Failed,
                        attempts: attempt,
                        stdout: result.stdout,
                        stderr,
                        run_at: Some(run_at),
                    },
                )
                .await
        }
    }
}

/// A cycle error must not leave the claimed job locked forever: mark it
/// failed with the attempt consumed so a later claim can pick it up.
async fn release_after_error(store: &JobStore, job: &Job, error: &str) {
    let fallback = Resolution {
        state: JobState::Failed,
        attempts: job.attempts + 1,
        stdout: String::new(),
        stderr: error.to_string(),
        run_at: None,
    };
    if let Err(e) = store.resolve(&job.id, fallback).await {
        tracing::error!(job_id = %job.id, error = %e, "Failed to release job after error");
    }
}

async fn idle_pause(token: &CancellationToken, interval: Duration) {
    tokio::select! {
        _ = token.cancelled() => {}
        _ = tokio::time::sleep(interval) => {}
    }
}
