//! Top-level "execute rebalance" operation and the queue's job handler

use super::primary::{PrimaryRunner, RunRequest};
use super::secondary::{SecondaryRequest, SecondaryRunner};
use crate::domain::{RunRecord, RunStatus};
use crate::error::{ErrorKind, RebalanceError, Result};
use crate::jobs::{JobContext, JobError, JobHandler};
use crate::yields::{Blocker, PlanAction, YieldParams, YieldPlanner, YieldReport};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Plan from current balances, then execute the recommended primary run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct YieldRebalanceRequest {
    #[serde(default)]
    pub run_id: Option<String>,
    pub params: YieldParams,
    #[serde(default)]
    pub slippage_bps: Option<u32>,
}

impl YieldRebalanceRequest {
    pub fn new(params: YieldParams) -> Self {
        Self {
            run_id: None,
            params,
            slippage_bps: None,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }
}

/// Outcome of a yield-triggered rebalance. `run` is empty when the plan held.
#[derive(Debug, Clone, Serialize)]
pub struct YieldExecution {
    pub report: YieldReport,
    pub run: Option<RunRecord>,
}

/// What a queued job asks for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    Rebalance(RunRequest),
    SecondaryRebalance(SecondaryRequest),
    YieldRebalance(YieldRebalanceRequest),
}

impl JobPayload {
    fn run_id(&self) -> Option<&str> {
        match self {
            JobPayload::Rebalance(r) => r.run_id.as_deref(),
            JobPayload::SecondaryRebalance(r) => r.run_id.as_deref(),
            JobPayload::YieldRebalance(r) => r.run_id.as_deref(),
        }
    }

    fn set_run_id(&mut self, run_id: String) {
        match self {
            JobPayload::Rebalance(r) => r.run_id = Some(run_id),
            JobPayload::SecondaryRebalance(r) => r.run_id = Some(run_id),
            JobPayload::YieldRebalance(r) => r.run_id = Some(run_id),
        }
    }
}

/// Run id for one job attempt: the base id first, then `{base}:retry{n}`
pub fn attempt_run_id(base: &str, attempt: u32) -> String {
    if attempt <= 1 {
        base.to_string()
    } else {
        format!("{}:retry{}", base, attempt - 1)
    }
}

pub struct RebalanceService {
    primary: PrimaryRunner,
    secondary: Option<SecondaryRunner>,
    planner: Option<Arc<YieldPlanner>>,
}

impl RebalanceService {
    pub fn new(primary: PrimaryRunner) -> Self {
        Self {
            primary,
            secondary: None,
            planner: None,
        }
    }

    pub fn with_secondary(mut self, secondary: SecondaryRunner) -> Self {
        self.secondary = Some(secondary);
        self
    }

    pub fn with_planner(mut self, planner: Arc<YieldPlanner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn primary(&self) -> &PrimaryRunner {
        &self.primary
    }

    pub async fn submit_run(&self, request: &RunRequest) -> Result<RunRecord> {
        self.primary.execute(request).await
    }

    pub async fn submit_secondary(&self, request: &SecondaryRequest) -> Result<RunRecord> {
        match &self.secondary {
            Some(runner) => runner.execute(request).await,
            None => Err(RebalanceError::AdapterConfig(
                "secondary chain is not configured".to_string(),
            )),
        }
    }

    /// Compute a yield plan and run the primary flow when it calls for a
    /// rebalance. A plan the execution protocol cannot carry out fails with
    /// `AdapterConfig` naming every blocker.
    pub async fn submit_yield(&self, request: &YieldRebalanceRequest) -> Result<YieldExecution> {
        let planner = self.planner.as_ref().ok_or_else(|| {
            RebalanceError::AdapterConfig("yield planner is not configured".to_string())
        })?;
        let report = planner.compute(&request.params).await?;

        if report.plan.action == PlanAction::Hold {
            info!(reason = %report.plan.reason, "Yield plan holds, nothing to execute");
            return Ok(YieldExecution { report, run: None });
        }

        if !report.readiness.can_execute {
            let codes: Vec<&str> = report.readiness.blockers.iter().map(Blocker::code).collect();
            warn!(protocol = %report.execution_protocol, blockers = ?codes, "Yield plan not executable");
            return Err(RebalanceError::AdapterConfig(format!(
                "protocol {} cannot execute: {}",
                report.execution_protocol,
                codes.join(", ")
            )));
        }

        let run_request = RunRequest {
            run_id: request.run_id.clone(),
            amount_raw: report.plan.recommended_amount_raw.to_string(),
            slippage_bps: request.slippage_bps,
        };
        let record = self.primary.execute(&run_request).await?;
        Ok(YieldExecution {
            report,
            run: Some(record),
        })
    }
}

fn run_outcome(record: &RunRecord, value: Value) -> std::result::Result<Value, JobError> {
    if record.status == RunStatus::Success {
        Ok(value)
    } else {
        Err(record_error(record))
    }
}

/// A terminal run that did not succeed, as a queue error
fn record_error(record: &RunRecord) -> JobError {
    JobError::new(
        record.error_kind.unwrap_or(ErrorKind::Internal),
        record
            .reason
            .clone()
            .unwrap_or_else(|| format!("run ended {}", record.status)),
        record.retryable,
    )
}

#[async_trait]
impl JobHandler for RebalanceService {
    async fn handle(&self, ctx: &JobContext) -> std::result::Result<Value, JobError> {
        let mut payload: JobPayload = serde_json::from_value(ctx.payload.clone()).map_err(|e| {
            JobError::new(ErrorKind::Validation, format!("invalid job payload: {}", e), false)
        })?;

        let base = payload.run_id().unwrap_or(&ctx.job_id).to_string();
        let run_id = attempt_run_id(&base, ctx.attempt);
        debug!(job_id = %ctx.job_id, attempt = ctx.attempt, run_id = %run_id, "Dispatching job");
        payload.set_run_id(run_id);

        let (record, value) = match &payload {
            JobPayload::Rebalance(request) => {
                let record = self.submit_run(request).await.map_err(JobError::from)?;
                let value = to_job_value(&record)?;
                (Some(record), value)
            }
            JobPayload::SecondaryRebalance(request) => {
                let record = self.submit_secondary(request).await.map_err(JobError::from)?;
                let value = to_job_value(&record)?;
                (Some(record), value)
            }
            JobPayload::YieldRebalance(request) => {
                let execution = self.submit_yield(request).await.map_err(JobError::from)?;
                let value = to_job_value(&execution)?;
                (execution.run, value)
            }
        };

        match record {
            Some(record) => run_outcome(&record, value),
            // A holding plan is a completed job
            None => Ok(value),
        }
    }
}

fn to_job_value<T: Serialize>(value: &T) -> std::result::Result<Value, JobError> {
    serde_json::to_value(value).map_err(|e| JobError::from(RebalanceError::from(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{PaperChain, PaperOp};
    use crate::domain::Chain;
    use crate::engine::{EngineSettings, RunLedger};
    use crate::error::{AdapterError, TransientCause};
    use crate::risk::GuardPolicy;
    use crate::telemetry::RecordingSink;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn service(chain: Arc<PaperChain>) -> RebalanceService {
        let settings = EngineSettings {
            token_in: "usdt".into(),
            token_out: "usdc".into(),
            pool_id: "1".into(),
            default_slippage_bps: 50,
            dust_threshold_raw: 10,
            adapter_timeout: Duration::from_secs(5),
        };
        RebalanceService::new(PrimaryRunner::new(
            chain.clone(),
            chain,
            Arc::new(RunLedger::new(50)),
            GuardPolicy::default(),
            settings,
            Arc::new(RecordingSink::new()),
        ))
    }

    #[test]
    fn test_attempt_run_ids() {
        assert_eq!(attempt_run_id("run-1", 1), "run-1");
        assert_eq!(attempt_run_id("run-1", 2), "run-1:retry1");
        assert_eq!(attempt_run_id("run-1", 3), "run-1:retry2");
    }

    #[test]
    fn test_payload_is_tagged() {
        let payload: JobPayload = serde_json::from_value(json!({
            "type": "rebalance",
            "amount_raw": "1000000",
            "run_id": "run-9"
        }))
        .unwrap();
        assert_eq!(
            payload,
            JobPayload::Rebalance(RunRequest::new("1000000").with_run_id("run-9"))
        );
    }

    #[tokio::test]
    async fn test_handler_maps_rollback_to_retryable_error() {
        let chain = Arc::new(PaperChain::new(Chain::Primary).with_collateral("usdt", 5_000_000));
        chain.fail_next(PaperOp::Swap, AdapterError::Transient(TransientCause::RateLimited));
        let service = service(chain);

        let ctx = JobContext {
            job_id: "job-1".into(),
            attempt: 1,
            payload: json!({"type": "rebalance", "amount_raw": "1000000"}),
        };
        let err = service.handle(&ctx).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AdapterTransient);
        assert!(err.is_retryable());

        // The retry runs under a fresh id and succeeds
        let ctx = JobContext { attempt: 2, ..ctx };
        let value = service.handle(&ctx).await.unwrap();
        assert_eq!(value["run_id"], "job-1:retry1");
        assert_eq!(value["status"], "success");
    }

    #[tokio::test]
    async fn test_handler_rejects_bad_payload() {
        let service = service(Arc::new(PaperChain::new(Chain::Primary)));
        let ctx = JobContext {
            job_id: "job-1".into(),
            attempt: 1,
            payload: json!({"type": "teleport"}),
        };
        let err = service.handle(&ctx).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_yield_payload_without_planner_is_config_error() {
        let service = service(Arc::new(PaperChain::new(Chain::Primary)));
        let ctx = JobContext {
            job_id: "job-1".into(),
            attempt: 1,
            payload: json!({
                "type": "yield_rebalance",
                "params": {"usdt_raw": "100000000", "usdc_raw": "0"}
            }),
        };
        let err = service.handle(&ctx).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AdapterConfig);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_secondary_not_configured() {
        let service = service(Arc::new(PaperChain::new(Chain::Primary)));
        let err = service
            .submit_secondary(&SecondaryRequest::new("1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AdapterConfig);
    }
}
