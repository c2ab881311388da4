//! Yield plan scenarios through the planner and the facade

use rebalancer::config::{ProtocolConfig, YieldConfig};
use rebalancer::yields::{
    plan, Balances, Blocker, HealthTag, PlanAction, PlanInput, StaticAprSource,
};
use rebalancer::{
    Agent, AppConfig, Collaborators, ErrorKind, JobPayload, JobStatus, PaperChains, YieldParams,
    YieldPlanner, YieldRebalanceRequest,
};
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

fn input(usdt: u128, usdc: u128) -> PlanInput {
    PlanInput {
        balances: Balances::new(usdt, usdc),
        target_bps: 7000,
        min_drift_bps: 500,
        max_step_usd: dec!(50),
        token_decimals: 6,
        apr: None,
        min_apr_delta_bps: 100,
        apr_bias_cap_bps: 1500,
    }
}

#[test]
fn usdt_heavy_book_rebalances() {
    let plan = plan(&input(100, 0));
    assert_eq!(plan.action, PlanAction::Rebalance);
    assert!(plan.recommended_amount_raw > 0);
}

#[test]
fn usdc_heavy_book_holds() {
    let plan = plan(&input(0, 100));
    assert_eq!(plan.action, PlanAction::Hold);
    assert_eq!(plan.reason, "usdc_at_or_above_target");
}

fn protocol(id: &str, enabled: bool) -> ProtocolConfig {
    ProtocolConfig {
        id: id.to_string(),
        enabled,
        apr_url: None,
        fallback_usdt_apr_bps: Some(280),
        fallback_usdc_apr_bps: Some(310),
        requires_credentials: false,
        credentials_env: None,
        command_template: Some(format!("{} supply {{token}} {{amount}}", id)),
        allowed_tokens: vec!["USDC".to_string()],
        max_amount_raw: Some(10_000_000),
    }
}

#[tokio::test]
async fn disabled_protocol_reports_blocker_but_still_plans() {
    let config = YieldConfig {
        target_usdc_bps: 7000,
        execution_protocol: "venus".to_string(),
        protocols: vec![protocol("burrow", true), protocol("venus", false)],
        ..YieldConfig::default()
    };
    let source = StaticAprSource::new()
        .with("burrow", 300, 900)
        .with("venus", 450, 400);
    let planner = YieldPlanner::new(config, Arc::new(source));

    let report = planner.compute(&YieldParams::new(10_000_000, 0)).await.unwrap();

    assert_eq!(report.plan.action, PlanAction::Rebalance);
    assert_eq!(report.execution_protocol, "venus");
    assert!(!report.readiness.can_execute);
    assert_eq!(report.readiness.blockers, vec![Blocker::ProtocolDisabled]);

    assert_eq!(report.comparison.best_usdc.as_deref(), Some("burrow"));
    assert_eq!(report.comparison.best_usdt.as_deref(), Some("venus"));
    assert!(report
        .comparison
        .protocols
        .iter()
        .all(|p| p.health == HealthTag::Fresh));
}

#[tokio::test]
async fn facade_plan_uses_paper_rates() {
    let config = AppConfig::default();
    let (collaborators, _chains) = Collaborators::paper(&config);
    let agent = Agent::new(config, collaborators).await.unwrap();

    let mut params = YieldParams::new(100, 0);
    params.target_bps = Some(7000);
    let report = agent.compute_yield_plan(&params).await.unwrap();
    assert_eq!(report.plan.action, PlanAction::Rebalance);
    assert_eq!(report.plan.recommended_amount_raw, 70);

    let params = YieldParams::new(0, 100);
    let report = agent.compute_yield_plan(&params).await.unwrap();
    assert_eq!(report.plan.action, PlanAction::Hold);
}

async fn yield_agent(config: AppConfig) -> (Agent, PaperChains) {
    let (collaborators, chains) = Collaborators::paper(&config);
    let agent = Agent::new(config, collaborators).await.unwrap();
    (agent, chains)
}

fn yield_job(usdt: u128, usdc: u128) -> JobPayload {
    let mut params = YieldParams::new(usdt, usdc);
    params.target_bps = Some(7000);
    params.max_step_usd = Some(dec!(1));
    JobPayload::YieldRebalance(YieldRebalanceRequest::new(params))
}

/// Wait for the on-demand drain to finish the job
async fn settle(agent: &Agent, job_id: &str) -> JobStatus {
    for _ in 0..100 {
        let status = agent.get_job(job_id).await.unwrap().status;
        if status != JobStatus::Queued && status != JobStatus::Running {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    JobStatus::Queued
}

#[tokio::test]
async fn yield_job_executes_recommended_step() {
    let (agent, chains) = yield_agent(AppConfig::default()).await;

    let job = agent.enqueue_job(&yield_job(100_000_000, 0), None).await.unwrap();

    assert_eq!(settle(&agent, &job.job_id).await, JobStatus::Done);
    let result = agent.get_job(&job.job_id).await.unwrap().result.unwrap();
    assert_eq!(result["report"]["plan"]["action"], "rebalance");
    assert_eq!(result["run"]["status"], "success");
    assert_eq!(result["run"]["run_id"], job.job_id.as_str());

    let token_out = &agent.config().engine.token_out;
    assert_eq!(chains.primary.collateral_balance(token_out), 1_000_000);
}

#[tokio::test]
async fn yield_job_hold_is_done_without_run() {
    let (agent, chains) = yield_agent(AppConfig::default()).await;

    let job = agent.enqueue_job(&yield_job(0, 100), None).await.unwrap();

    assert_eq!(settle(&agent, &job.job_id).await, JobStatus::Done);
    let result = agent.get_job(&job.job_id).await.unwrap().result.unwrap();
    assert!(result["run"].is_null());
    assert_eq!(result["report"]["plan"]["reason"], "usdc_at_or_above_target");
    assert!(chains.primary.calls().is_empty());
}

#[tokio::test]
async fn yield_job_blocked_protocol_dead_letters() {
    let mut config = AppConfig::default();
    config.yields.protocols[0].enabled = false;
    let (agent, chains) = yield_agent(config).await;

    let job = agent.enqueue_job(&yield_job(100_000_000, 0), None).await.unwrap();

    assert_eq!(settle(&agent, &job.job_id).await, JobStatus::DeadLetter);
    let job = agent.get_job(&job.job_id).await.unwrap();
    assert_eq!(job.attempt_count, 1);
    let error = job.error.unwrap();
    assert_eq!(error.kind, ErrorKind::AdapterConfig);
    assert!(!error.retryable);
    assert!(error.message.contains("protocol_disabled"));
    assert!(chains.primary.calls().is_empty());
}
