use super::events::{EventSink, RunEvent};
use crate::domain::RunStatus;
use crate::jobs::JobStatus;
use crate::rpc::RouterSnapshot;
use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics collector for observability
#[derive(Debug, Default)]
pub struct Metrics {
    pub runs_started: AtomicU64,
    pub runs_succeeded: AtomicU64,
    pub runs_failed: AtomicU64,
    pub runs_rolled_back: AtomicU64,
    /// Successful runs that left more than dust in the wallet
    pub runs_unreconciled: AtomicU64,
    pub rollback_failures: AtomicU64,
    pub jobs_done: AtomicU64,
    pub jobs_requeued: AtomicU64,
    pub jobs_dead_lettered: AtomicU64,
    pub endpoint_failures: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Export metrics in Prometheus format
    pub fn prometheus(&self, router: Option<&RouterSnapshot>) -> String {
        let mut out = format!(
            r#"# HELP rebalancer_runs_started_total Runs that passed begin()
# TYPE rebalancer_runs_started_total counter
rebalancer_runs_started_total {}

# HELP rebalancer_runs_total Finished runs by status
# TYPE rebalancer_runs_total counter
rebalancer_runs_total{{status="success"}} {}
rebalancer_runs_total{{status="failed"}} {}
rebalancer_runs_total{{status="rollback"}} {}

# HELP rebalancer_runs_unreconciled_total Successful runs with residual wallet balance
# TYPE rebalancer_runs_unreconciled_total counter
rebalancer_runs_unreconciled_total {}

# HELP rebalancer_rollback_failures_total Rollbacks that did not complete
# TYPE rebalancer_rollback_failures_total counter
rebalancer_rollback_failures_total {}

# HELP rebalancer_jobs_total Job transitions by target status
# TYPE rebalancer_jobs_total counter
rebalancer_jobs_total{{status="done"}} {}
rebalancer_jobs_total{{status="queued"}} {}
rebalancer_jobs_total{{status="dead_letter"}} {}
"#,
            self.runs_started.load(Ordering::Relaxed),
            self.runs_succeeded.load(Ordering::Relaxed),
            self.runs_failed.load(Ordering::Relaxed),
            self.runs_rolled_back.load(Ordering::Relaxed),
            self.runs_unreconciled.load(Ordering::Relaxed),
            self.rollback_failures.load(Ordering::Relaxed),
            self.jobs_done.load(Ordering::Relaxed),
            self.jobs_requeued.load(Ordering::Relaxed),
            self.jobs_dead_lettered.load(Ordering::Relaxed),
        );

        if let Some(router) = router {
            out.push_str(&format!(
                r#"
# HELP rebalancer_rpc_calls_total Routed RPC calls
# TYPE rebalancer_rpc_calls_total counter
rebalancer_rpc_calls_total {}

# HELP rebalancer_rpc_retry_rate Retried attempts per attempt
# TYPE rebalancer_rpc_retry_rate gauge
rebalancer_rpc_retry_rate {:.4}

# HELP rebalancer_rpc_http429_total Rate-limited responses
# TYPE rebalancer_rpc_http429_total counter
rebalancer_rpc_http429_total {}
"#,
                router.total_calls, router.retry_rate, router.http429
            ));
            for (endpoint, stats) in &router.endpoints {
                out.push_str(&format!(
                    "rebalancer_rpc_endpoint_score{{endpoint=\"{}\"}} {:.4}\n",
                    endpoint,
                    stats.score()
                ));
            }
        }

        out
    }
}

impl EventSink for Metrics {
    fn record(&self, event: &RunEvent) {
        match event {
            RunEvent::RunStarted { .. } => {
                self.runs_started.fetch_add(1, Ordering::Relaxed);
            }
            RunEvent::RunFinished { status, .. } => {
                let counter = match status {
                    RunStatus::Success => &self.runs_succeeded,
                    RunStatus::Failed => &self.runs_failed,
                    RunStatus::Rollback => &self.runs_rolled_back,
                    RunStatus::Planned => return,
                };
                counter.fetch_add(1, Ordering::Relaxed);
            }
            RunEvent::RollbackExecuted { .. } => {}
            RunEvent::RollbackFailed { .. } => {
                self.rollback_failures.fetch_add(1, Ordering::Relaxed);
            }
            RunEvent::Unreconciled { .. } => {
                self.runs_unreconciled.fetch_add(1, Ordering::Relaxed);
            }
            RunEvent::JobTransition { to, .. } => match to {
                JobStatus::Done => {
                    self.jobs_done.fetch_add(1, Ordering::Relaxed);
                }
                JobStatus::Queued => {
                    self.jobs_requeued.fetch_add(1, Ordering::Relaxed);
                }
                JobStatus::DeadLetter => {
                    self.jobs_dead_lettered.fetch_add(1, Ordering::Relaxed);
                }
                _ => {}
            },
            RunEvent::EndpointFailure { .. } => {
                self.endpoint_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
