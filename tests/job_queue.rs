//! Queue retries, dead-lettering and manual retry through the facade

use rebalancer::adapters::PaperOp;
use rebalancer::error::{AdapterError, TransientCause};
use rebalancer::jobs::compute_backoff;
use rebalancer::{Agent, AppConfig, Collaborators, JobPayload, JobStatus, PaperChains, RunRequest};
use std::time::Duration;

async fn fast_retry_agent(max_attempts: u32) -> (Agent, PaperChains) {
    let mut config = AppConfig::default();
    config.queue.base_backoff_ms = 1;
    config.queue.default_max_attempts = max_attempts;
    let (collaborators, chains) = Collaborators::paper(&config);
    let agent = Agent::new(config, collaborators).await.unwrap();
    (agent, chains)
}

/// Drive the queue until the job leaves the queued state
async fn drain(agent: &Agent, job_id: &str) -> JobStatus {
    for _ in 0..200 {
        agent.queue().process_due().await;
        let status = agent.get_job(job_id).await.unwrap().status;
        if status != JobStatus::Queued {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    JobStatus::Queued
}

fn rate_limited() -> AdapterError {
    AdapterError::Transient(TransientCause::RateLimited)
}

#[test]
fn backoff_doubles_and_caps() {
    let base = Duration::from_millis(1000);
    let schedule: Vec<u64> = (1..=8)
        .map(|n| compute_backoff(n, base).as_millis() as u64)
        .collect();
    assert_eq!(
        schedule,
        vec![1000, 2000, 4000, 8000, 16000, 32000, 32000, 32000]
    );
}

#[tokio::test]
async fn transient_failure_retries_then_succeeds() {
    let (agent, chains) = fast_retry_agent(3).await;
    chains.primary.fail_next(PaperOp::Swap, rate_limited());

    let payload = JobPayload::Rebalance(RunRequest::new("1000000").with_run_id("run-q"));
    let job = agent.enqueue_job(&payload, None).await.unwrap();

    assert_eq!(drain(&agent, &job.job_id).await, JobStatus::Done);
    let job = agent.get_job(&job.job_id).await.unwrap();
    assert_eq!(job.attempt_count, 2);
    let result = job.result.unwrap();
    assert_eq!(result["run_id"], "run-q:retry1");
    assert_eq!(result["status"], "success");
}

#[tokio::test]
async fn retryable_failures_dead_letter_at_max_attempts() {
    let (agent, chains) = fast_retry_agent(3).await;
    for _ in 0..3 {
        chains.primary.fail_next(PaperOp::Swap, rate_limited());
    }

    let payload = JobPayload::Rebalance(RunRequest::new("1000000"));
    let job = agent.enqueue_job(&payload, None).await.unwrap();

    assert_eq!(drain(&agent, &job.job_id).await, JobStatus::DeadLetter);
    let dead = agent.get_job(&job.job_id).await.unwrap();
    assert_eq!(dead.attempt_count, 3);
    let error = dead.error.unwrap();
    assert!(error.retryable);

    // Every rollback re-supplied the withdrawn amount
    let token_in = &agent.config().engine.token_in;
    assert_eq!(chains.primary.wallet_balance(token_in), 0);

    // Manual retry gets a fresh budget and a fresh run id
    let requeued = agent.queue().retry(&job.job_id).await.unwrap();
    assert_eq!(requeued.status, JobStatus::Queued);
    assert_eq!(drain(&agent, &job.job_id).await, JobStatus::Done);
    let done = agent.get_job(&job.job_id).await.unwrap();
    assert_eq!(done.attempt_count, 4);
    assert_eq!(
        done.result.unwrap()["run_id"],
        format!("{}:retry3", job.job_id)
    );
}

#[tokio::test]
async fn guard_violation_dead_letters_immediately() {
    let (agent, _chains) = fast_retry_agent(3).await;

    let payload = JobPayload::Rebalance(RunRequest::new("6000000"));
    let job = agent.enqueue_job(&payload, None).await.unwrap();

    assert_eq!(drain(&agent, &job.job_id).await, JobStatus::DeadLetter);
    let job = agent.get_job(&job.job_id).await.unwrap();
    assert_eq!(job.attempt_count, 1);
    assert!(!job.error.unwrap().retryable);

    // Not retryable, so bulk retry leaves it alone
    assert!(agent.queue().retry_all_retryable().await.is_empty());
}

#[tokio::test]
async fn dismissed_jobs_are_purged_after_retention() {
    let (agent, _chains) = fast_retry_agent(1).await;
    let payload = JobPayload::Rebalance(RunRequest::new("0"));
    let job = agent.enqueue_job(&payload, None).await.unwrap();
    assert_eq!(drain(&agent, &job.job_id).await, JobStatus::DeadLetter);

    let dismissed = agent.queue().dismiss(&job.job_id).await.unwrap();
    assert_eq!(dismissed.status, JobStatus::Dismissed);

    assert_eq!(agent.queue().purge_dismissed(chrono::Duration::hours(1)).await, 0);
    tokio::time::sleep(Duration::from_millis(2)).await;
    assert_eq!(agent.queue().purge_dismissed(chrono::Duration::zero()).await, 1);
    assert!(agent.get_job(&job.job_id).await.is_err());
}

#[test]
fn enqueue_from_sync_context() {
    let (agent, _chains) = tokio_test::block_on(fast_retry_agent(3));
    let payload = JobPayload::Rebalance(RunRequest::new("1000000"));
    let job = tokio_test::block_on(agent.enqueue_job(&payload, Some(5))).unwrap();
    assert_eq!(job.max_attempts, 5);
    assert_eq!(job.status, JobStatus::Queued);
    tokio_test::assert_ok!(tokio_test::block_on(agent.get_job(&job.job_id)));
}

#[tokio::test]
async fn enqueued_job_completes_without_worker_or_polling_the_queue() {
    let (agent, chains) = fast_retry_agent(3).await;
    chains.primary.fail_next(PaperOp::Swap, rate_limited());

    let payload = JobPayload::Rebalance(RunRequest::new("1000000").with_run_id("run-bg"));
    let job = agent.enqueue_job(&payload, None).await.unwrap();

    let mut status = JobStatus::Queued;
    for _ in 0..100 {
        status = agent.get_job(&job.job_id).await.unwrap().status;
        if status == JobStatus::Done {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, JobStatus::Done);

    // The retry after backoff was picked up too
    let done = agent.get_job(&job.job_id).await.unwrap();
    assert_eq!(done.attempt_count, 2);
    assert_eq!(done.result.unwrap()["run_id"], "run-bg:retry1");
    assert!(!agent.queue().worker_active());
}
