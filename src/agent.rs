//! Process-level facade: wires config, router, engine, queue and planner

use crate::adapters::{ChainAdapter, NearChain, PaperChain, PostActionExecutor, QuoteSource, TxSigner};
use crate::config::AppConfig;
use crate::domain::{Chain, RunRecord};
use crate::engine::{
    EngineSettings, JobPayload, PrimaryRunner, RebalanceService, RunLedger, RunRequest,
    SecondaryRequest, SecondaryRunner, SecondarySettings, YieldExecution, YieldRebalanceRequest,
};
use crate::error::{RebalanceError, Result};
use crate::jobs::{AsyncJob, JobQueue, JobStore, QueueSettings};
use crate::risk::GuardPolicy;
use crate::rpc::{HttpTransport, RpcRouter, RpcTransport};
use crate::telemetry::{EventSink, FanoutSink, Metrics, TracingSink};
use crate::yields::{
    AprComparison, AprSource, HttpAprSource, StaticAprSource, YieldParams, YieldPlanner,
    YieldReport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Secondary-chain collaborators
pub struct SecondaryCollaborators {
    pub chain: Arc<dyn ChainAdapter>,
    pub reference_quotes: Arc<dyn QuoteSource>,
    pub router_quotes: Arc<dyn QuoteSource>,
    pub post_action: Arc<dyn PostActionExecutor>,
}

/// Primary-chain collaborators
pub enum PrimaryCollaborators {
    /// Caller-built chain and quote source
    Custom {
        chain: Arc<dyn ChainAdapter>,
        quotes: Arc<dyn QuoteSource>,
    },
    /// `NearChain` over the agent's own RPC router, signing with `signer`
    Near { signer: Arc<dyn TxSigner> },
}

/// External capabilities the core drives
pub struct Collaborators {
    pub primary: PrimaryCollaborators,
    pub secondary: Option<SecondaryCollaborators>,
    pub apr_source: Arc<dyn AprSource>,
}

const APR_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// In-memory chains for paper mode
pub struct PaperChains {
    pub primary: Arc<PaperChain>,
    pub secondary: Arc<PaperChain>,
}

impl Collaborators {
    /// Paper chains funded from config, APRs from each protocol's fallback rates
    pub fn paper(config: &AppConfig) -> (Self, PaperChains) {
        let funding = u128::from(config.guards.max_amount_raw).saturating_mul(10);
        let primary = Arc::new(
            PaperChain::new(Chain::Primary).with_collateral(&config.engine.token_in, funding),
        );
        let secondary = Arc::new(
            PaperChain::new(Chain::Secondary)
                .with_wallet(&config.secondary.token_in, funding)
                .with_quote_source("paper-router"),
        );

        let apr_source = config
            .yields
            .protocols
            .iter()
            .fold(StaticAprSource::new(), |source, p| {
                match (p.fallback_usdt_apr_bps, p.fallback_usdc_apr_bps) {
                    (Some(usdt), Some(usdc)) => source.with(&p.id, usdt, usdc),
                    _ => source,
                }
            });

        let collaborators = Self {
            primary: PrimaryCollaborators::Custom {
                chain: primary.clone(),
                quotes: primary.clone(),
            },
            secondary: Some(SecondaryCollaborators {
                chain: secondary.clone(),
                reference_quotes: secondary.clone(),
                router_quotes: secondary.clone(),
                post_action: secondary.clone(),
            }),
            apr_source: Arc::new(apr_source),
        };
        (collaborators, PaperChains { primary, secondary })
    }

    /// On-chain primary flow through the routed RPC, APRs from each
    /// protocol's rate API. No secondary chain.
    pub fn near(config: &AppConfig, signer: Arc<dyn TxSigner>) -> Result<Self> {
        let apr_source = HttpAprSource::from_protocols(&config.yields.protocols, APR_FETCH_TIMEOUT)?;
        Ok(Self {
            primary: PrimaryCollaborators::Near { signer },
            secondary: None,
            apr_source: Arc::new(apr_source),
        })
    }
}

pub struct Agent {
    config: AppConfig,
    router: Arc<RpcRouter>,
    service: Arc<RebalanceService>,
    queue: Arc<JobQueue>,
    planner: Arc<YieldPlanner>,
    metrics: Arc<Metrics>,
    shutdown_tx: watch::Sender<bool>,
}

impl Agent {
    /// Agent whose router talks JSON-RPC over HTTP
    pub async fn new(config: AppConfig, collaborators: Collaborators) -> Result<Self> {
        let transport = HttpTransport::new(Duration::from_millis(config.rpc.request_timeout_ms))?;
        Self::with_transport(config, Arc::new(transport), collaborators).await
    }

    pub async fn with_transport(
        config: AppConfig,
        transport: Arc<dyn RpcTransport>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config.validate().map_err(|errors| {
            RebalanceError::Validation(format!("invalid configuration: {}", errors.join("; ")))
        })?;

        let metrics = Arc::new(Metrics::new());
        let sink: Arc<dyn EventSink> = Arc::new(
            FanoutSink::new()
                .with(Arc::new(TracingSink))
                .with(metrics.clone()),
        );

        let router = Arc::new(RpcRouter::new(&config.rpc, transport).with_sink(sink.clone()));
        let policy = GuardPolicy::from(&config.guards);

        let (primary_chain, primary_quotes): (Arc<dyn ChainAdapter>, Arc<dyn QuoteSource>) =
            match collaborators.primary {
                PrimaryCollaborators::Custom { chain, quotes } => (chain, quotes),
                PrimaryCollaborators::Near { signer } => {
                    let near = Arc::new(NearChain::from_config(&config.engine, router.clone(), signer)?);
                    info!(account = near.account_id(), "Primary chain routed through RPC router");
                    let chain: Arc<dyn ChainAdapter> = near.clone();
                    let quotes: Arc<dyn QuoteSource> = near;
                    (chain, quotes)
                }
            };

        let planner = Arc::new(YieldPlanner::new(
            config.yields.clone(),
            collaborators.apr_source,
        ));

        let primary = PrimaryRunner::new(
            primary_chain,
            primary_quotes,
            Arc::new(RunLedger::new(config.engine.recent_runs_capacity)),
            policy.clone(),
            EngineSettings::from(&config.engine),
            sink.clone(),
        );
        let mut service = RebalanceService::new(primary).with_planner(planner.clone());
        if let Some(secondary) = collaborators.secondary {
            service = service.with_secondary(SecondaryRunner::new(
                secondary.chain,
                secondary.reference_quotes,
                secondary.router_quotes,
                secondary.post_action,
                Arc::new(RunLedger::new(config.engine.recent_runs_capacity)),
                policy,
                SecondarySettings::from_config(&config.secondary, &config.engine),
                sink.clone(),
            ));
        }
        let service = Arc::new(service);

        let settings = QueueSettings::from(&config.queue);
        let queue = match &config.queue.store_path {
            Some(path) => {
                JobQueue::open(settings, service.clone(), JobStore::new(path)).await?
            }
            None => JobQueue::new(settings, service.clone()),
        };
        let queue = Arc::new(queue.with_sink(sink));

        let (shutdown_tx, _) = watch::channel(false);

        info!(
            endpoints = router.endpoints().len(),
            secondary = config.secondary.post_action_protocol.as_str(),
            "Agent initialized"
        );

        Ok(Self {
            config,
            router,
            service,
            queue,
            planner,
            metrics,
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<RpcRouter> {
        &self.router
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Run one primary-chain rebalance now, outside the queue
    pub async fn submit_run(&self, request: &RunRequest) -> Result<RunRecord> {
        self.service.submit_run(request).await
    }

    pub async fn submit_secondary(&self, request: &SecondaryRequest) -> Result<RunRecord> {
        self.service.submit_secondary(request).await
    }

    /// Queue a job and make sure it gets consumed, by the worker loop if one
    /// is running or by an on-demand drain otherwise
    pub async fn enqueue_job(&self, payload: &JobPayload, max_attempts: Option<u32>) -> Result<AsyncJob> {
        let value = serde_json::to_value(payload)?;
        let job = self.queue.enqueue(value, max_attempts).await?;
        self.queue.trigger();
        Ok(job)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<AsyncJob> {
        self.queue.get(job_id).await
    }

    pub async fn compute_yield_plan(&self, params: &YieldParams) -> Result<YieldReport> {
        self.planner.compute(params).await
    }

    /// Plan, then execute the recommended primary run now, outside the queue
    pub async fn submit_yield_rebalance(&self, request: &YieldRebalanceRequest) -> Result<YieldExecution> {
        self.service.submit_yield(request).await
    }

    pub async fn compare_apr(&self) -> AprComparison {
        self.planner.compare().await
    }

    /// Spawn the queue's worker loop; it exits on `shutdown()`
    pub fn start_worker(&self) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            queue.run_worker(shutdown_rx).await;
        })
    }

    pub fn shutdown(&self) {
        if self.shutdown_tx.send(true).is_err() {
            warn!("Shutdown requested with no running worker");
        }
    }

    /// Prometheus text for run, job and router counters
    pub fn metrics_text(&self) -> String {
        self.metrics.prometheus(Some(&self.router.snapshot()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RunStatus;
    use crate::jobs::JobStatus;
    use crate::yields::PlanAction;
    use std::time::Duration;

    async fn paper_agent() -> (Agent, PaperChains) {
        let config = AppConfig::default();
        let (collaborators, chains) = Collaborators::paper(&config);
        (Agent::new(config, collaborators).await.unwrap(), chains)
    }

    #[tokio::test]
    async fn test_submit_run_on_paper_chain() {
        let (agent, chains) = paper_agent().await;
        let record = agent
            .submit_run(&RunRequest::new("1000000").with_run_id("run-1"))
            .await
            .unwrap();

        assert_eq!(record.status, RunStatus::Success);
        assert!(record.reconciled);
        let token_out = &agent.config().engine.token_out;
        assert_eq!(chains.primary.collateral_balance(token_out), 1_000_000);
        assert!(agent.metrics_text().contains("rebalancer_runs_total{status=\"success\"} 1"));
    }

    #[tokio::test]
    async fn test_worker_drains_enqueued_job() {
        let (agent, _chains) = paper_agent().await;
        let worker = agent.start_worker();

        let payload = JobPayload::Rebalance(RunRequest::new("2000000"));
        let job = agent.enqueue_job(&payload, None).await.unwrap();

        let mut status = JobStatus::Queued;
        for _ in 0..50 {
            status = agent.get_job(&job.job_id).await.unwrap().status;
            if status == JobStatus::Done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status, JobStatus::Done);

        agent.shutdown();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_compute_yield_plan() {
        let (agent, _chains) = paper_agent().await;
        let mut params = YieldParams::new(100, 0);
        params.target_bps = Some(7000);

        let report = agent.compute_yield_plan(&params).await.unwrap();
        assert_eq!(report.plan.action, PlanAction::Rebalance);
        assert!(report.readiness.can_execute);
    }

    #[tokio::test]
    async fn test_near_primary_runs_through_agent_router() {
        use crate::adapters::near_chain::testing::{json_signer, node_transport, NodeState};
        use std::sync::Mutex;

        let mut config = AppConfig::default();
        config.engine.account_id = Some("bot.near".to_string());
        let token_in = config.engine.token_in.clone();
        let token_out = config.engine.token_out.clone();

        let mut node = NodeState {
            rate_bps: 10_000,
            ..Default::default()
        };
        node.collateral.insert(token_in.clone(), 5_000_000);
        let node = Arc::new(Mutex::new(node));

        let collaborators = Collaborators {
            primary: PrimaryCollaborators::Near {
                signer: Arc::new(json_signer()),
            },
            secondary: None,
            apr_source: Arc::new(StaticAprSource::new().with("burrow", 300, 350)),
        };
        let agent = Agent::with_transport(config, Arc::new(node_transport(node.clone())), collaborators)
            .await
            .unwrap();

        let record = agent.submit_run(&RunRequest::new("1000000")).await.unwrap();
        assert_eq!(record.status, RunStatus::Success);
        assert_eq!(node.lock().unwrap().collateral[&token_out], 1_000_000);
        assert_eq!(agent.router().snapshot().total_calls, 8);
        assert!(agent.metrics_text().contains("rebalancer_runs_total{status=\"success\"} 1"));

        // Secondary was not wired
        let err = agent
            .submit_secondary(&SecondaryRequest::new("1"))
            .await
            .unwrap_err();
        assert!(matches!(err, RebalanceError::AdapterConfig(_)));
    }

    #[tokio::test]
    async fn test_enqueue_runs_without_started_worker() {
        let (agent, _chains) = paper_agent().await;
        let payload = JobPayload::Rebalance(RunRequest::new("1000000"));
        let job = agent.enqueue_job(&payload, None).await.unwrap();

        let mut status = JobStatus::Queued;
        for _ in 0..50 {
            status = agent.get_job(&job.job_id).await.unwrap().status;
            if status == JobStatus::Done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status, JobStatus::Done);
        assert!(!agent.queue().worker_active());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = AppConfig::default();
        config.queue.max_jobs = 0;
        let (collaborators, _) = Collaborators::paper(&config);
        let err = Agent::new(config, collaborators).await.err().unwrap();
        assert!(matches!(err, RebalanceError::Validation(_)));
    }
}
