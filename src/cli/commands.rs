//! Command handlers

use super::output::{self, OutputMode};
use crate::adapters::PaperOp;
use crate::agent::{Agent, Collaborators};
use crate::config::AppConfig;
use crate::engine::{JobPayload, RunRequest};
use crate::error::{AdapterError, TransientCause};
use crate::jobs::{AsyncJob, JobStatus};
use crate::rpc::RpcRouter;
use crate::yields::{YieldParams, YieldPlanner};
use anyhow::{bail, Context};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::info;

const JOB_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[allow(clippy::too_many_arguments)]
pub async fn plan(
    config: &AppConfig,
    usdt: u128,
    usdc: u128,
    target_bps: Option<u32>,
    min_drift_bps: Option<u32>,
    max_step_usd: Option<Decimal>,
    protocol: Option<String>,
) -> anyhow::Result<()> {
    let planner = YieldPlanner::from_config(config.yields.clone())?;
    let params = YieldParams {
        usdt_raw: usdt,
        usdc_raw: usdc,
        target_bps,
        min_drift_bps,
        max_step_usd,
        protocol_id: protocol,
    };
    let report = planner.compute(&params).await?;
    output::print_item(&json!({
        "plan": report.plan,
        "executionProtocol": report.execution_protocol,
        "readiness": report.readiness,
    }))
}

pub async fn compare(config: &AppConfig, mode: OutputMode) -> anyhow::Result<()> {
    let planner = YieldPlanner::from_config(config.yields.clone())?;
    let comparison = planner.compare().await;
    match mode {
        OutputMode::Json => output::print_item(&comparison),
        OutputMode::Table => output::print_items(&output::apr_rows(&comparison), mode),
    }
}

pub struct PaperRunArgs {
    pub amount: String,
    pub run_id: Option<String>,
    pub slippage_bps: Option<u32>,
    pub fail_swap: bool,
    pub max_attempts: Option<u32>,
    pub wait: Duration,
}

pub async fn paper_run(config: AppConfig, args: PaperRunArgs) -> anyhow::Result<()> {
    let (collaborators, chains) = Collaborators::paper(&config);
    if args.fail_swap {
        chains.primary.fail_next(
            PaperOp::Swap,
            AdapterError::Transient(TransientCause::RateLimited),
        );
    }
    let agent = Agent::new(config, collaborators).await?;
    let worker = agent.start_worker();

    let mut request = RunRequest::new(args.amount);
    request.run_id = args.run_id;
    request.slippage_bps = args.slippage_bps;
    let job = agent
        .enqueue_job(&JobPayload::Rebalance(request), args.max_attempts)
        .await?;
    info!(job_id = %job.job_id, "Paper job enqueued");

    let finished = wait_for_terminal(&agent, &job.job_id, args.wait).await;
    agent.shutdown();
    worker.await.context("worker task panicked")?;
    let job = finished?;

    let engine = &agent.config().engine;
    let mut collateral = serde_json::Map::new();
    for token in [&engine.token_in, &engine.token_out] {
        collateral.insert(
            token.clone(),
            Value::String(chains.primary.collateral_balance(token).to_string()),
        );
    }
    output::print_item(&json!({
        "job": job,
        "collateral": collateral,
        "calls": chains.primary.calls(),
    }))?;

    if job.status != JobStatus::Done {
        bail!("job {} ended {}", job.job_id, job.status);
    }
    Ok(())
}

async fn wait_for_terminal(agent: &Agent, job_id: &str, wait: Duration) -> anyhow::Result<AsyncJob> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let job = agent.get_job(job_id).await?;
        if matches!(job.status, JobStatus::Done | JobStatus::DeadLetter) {
            return Ok(job);
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("job {} still {} after {:?}", job_id, job.status, wait);
        }
        tokio::time::sleep(JOB_POLL_INTERVAL).await;
    }
}

pub async fn rpc(config: &AppConfig, method: &str, params: &str, mode: OutputMode) -> anyhow::Result<()> {
    let params: Value = serde_json::from_str(params).context("--params is not valid JSON")?;
    let router = RpcRouter::from_config(&config.rpc)?;

    let response = router.call(method, params).await;
    let snapshot = router.snapshot();
    match mode {
        OutputMode::Json => output::print_item(&json!({
            "response": response.as_ref().ok(),
            "error": response.as_ref().err().map(|e| e.to_string()),
            "router": snapshot,
        }))?,
        OutputMode::Table => {
            if let Ok(routed) = &response {
                println!("endpoint: {}", routed.endpoint);
                output::print_item(&routed.result)?;
            }
            output::print_items(&output::endpoint_rows(&snapshot), mode)?;
            println!(
                "calls={} attempts={} retry_rate={:.3} http429={}",
                snapshot.total_calls, snapshot.total_attempts, snapshot.retry_rate, snapshot.http429
            );
        }
    }

    response?;
    Ok(())
}
