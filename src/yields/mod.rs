//! Yield plan computer: APR comparison, allocation plan and execution readiness

pub mod apr;
pub mod compare;
pub mod planner;
pub mod readiness;

pub use apr::{AprCache, AprHint, AprQuote, AprSource, HintSource, HttpAprSource, SourceHealth, StaticAprSource};
pub use compare::{compare, AprComparison, HealthTag, ProtocolApr, ProtocolObservation, RiskTag};
pub use planner::{plan, AprPair, Balances, PlanAction, PlanInput, YieldPlan};
pub use readiness::{execute_readiness, Blocker, ExecuteReadiness, ProtocolProfile};

#[cfg(test)]
pub use apr::MockAprSource;

use crate::config::YieldConfig;
use crate::error::{RebalanceError, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

const APR_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Caller overrides for one plan computation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct YieldParams {
    #[serde(with = "crate::domain::amount")]
    pub usdt_raw: u128,
    #[serde(with = "crate::domain::amount")]
    pub usdc_raw: u128,
    #[serde(default)]
    pub target_bps: Option<u32>,
    #[serde(default)]
    pub min_drift_bps: Option<u32>,
    #[serde(default)]
    pub max_step_usd: Option<Decimal>,
    /// Execution protocol override
    #[serde(default)]
    pub protocol_id: Option<String>,
}

impl YieldParams {
    pub fn new(usdt_raw: u128, usdc_raw: u128) -> Self {
        Self {
            usdt_raw,
            usdc_raw,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct YieldReport {
    pub plan: YieldPlan,
    pub execution_protocol: String,
    pub readiness: ExecuteReadiness,
    pub comparison: AprComparison,
}

pub struct YieldPlanner {
    config: YieldConfig,
    cache: AprCache,
}

impl YieldPlanner {
    pub fn new(config: YieldConfig, source: Arc<dyn AprSource>) -> Self {
        let mut cache = AprCache::new(source, chrono::Duration::seconds(config.apr_ttl_secs));
        for protocol in &config.protocols {
            if let (Some(usdt), Some(usdc)) =
                (protocol.fallback_usdt_apr_bps, protocol.fallback_usdc_apr_bps)
            {
                cache = cache.with_fallback(&protocol.id, usdt, usdc);
            }
        }
        Self { config, cache }
    }

    /// Planner backed by each protocol's HTTP rate API
    pub fn from_config(config: YieldConfig) -> Result<Self> {
        let source = HttpAprSource::from_protocols(&config.protocols, APR_FETCH_TIMEOUT)?;
        Ok(Self::new(config, Arc::new(source)))
    }

    pub fn config(&self) -> &YieldConfig {
        &self.config
    }

    pub async fn compare(&self) -> AprComparison {
        let mut observations = Vec::with_capacity(self.config.protocols.len());
        for protocol in &self.config.protocols {
            let hint = self.cache.get(&protocol.id).await;
            observations.push(ProtocolObservation {
                protocol_id: protocol.id.clone(),
                hint,
                health: self.cache.health(&protocol.id).await,
            });
        }
        compare(
            &observations,
            Utc::now(),
            chrono::Duration::seconds(self.config.stale_after_secs),
        )
    }

    #[instrument(skip(self, params), fields(usdt = %params.usdt_raw, usdc = %params.usdc_raw))]
    pub async fn compute(&self, params: &YieldParams) -> Result<YieldReport> {
        let protocol_id = params
            .protocol_id
            .clone()
            .unwrap_or_else(|| self.config.execution_protocol.clone());
        let protocol = self
            .config
            .protocols
            .iter()
            .find(|p| p.id == protocol_id)
            .ok_or_else(|| RebalanceError::Validation(format!("unknown protocol: {}", protocol_id)))?;

        let target_bps = params.target_bps.unwrap_or(self.config.target_usdc_bps);
        if target_bps > planner::BPS_DENOMINATOR {
            return Err(RebalanceError::Validation(format!(
                "target_bps {} exceeds 10000",
                target_bps
            )));
        }

        let comparison = self.compare().await;
        let apr = comparison.protocol(&protocol_id).and_then(|row| {
            Some(AprPair {
                usdt_bps: row.usdt_apr_bps?,
                usdc_bps: row.usdc_apr_bps?,
            })
        });

        let plan = plan(&PlanInput {
            balances: Balances::new(params.usdt_raw, params.usdc_raw),
            target_bps,
            min_drift_bps: params.min_drift_bps.unwrap_or(self.config.min_drift_bps),
            max_step_usd: params.max_step_usd.unwrap_or(self.config.max_step_usd),
            token_decimals: self.config.token_decimals,
            apr,
            min_apr_delta_bps: self.config.min_apr_delta_bps,
            apr_bias_cap_bps: self.config.apr_bias_cap_bps,
        });
        let readiness = execute_readiness(&plan, &ProtocolProfile::from_config(protocol));

        info!(
            action = ?plan.action,
            reason = %plan.reason,
            amount = %plan.recommended_amount_raw,
            protocol = %protocol_id,
            can_execute = readiness.can_execute,
            "Yield plan computed"
        );

        Ok(YieldReport {
            plan,
            execution_protocol: protocol_id,
            readiness,
            comparison,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransientCause;

    fn planner(source: impl AprSource + 'static) -> YieldPlanner {
        let config = YieldConfig {
            target_usdc_bps: 7000,
            ..YieldConfig::default()
        };
        YieldPlanner::new(config, Arc::new(source))
    }

    #[tokio::test]
    async fn test_compute_rebalances_short_usdc() {
        let planner = planner(StaticAprSource::new().with("burrow", 300, 350));
        let report = planner.compute(&YieldParams::new(100, 0)).await.unwrap();

        assert_eq!(report.plan.action, PlanAction::Rebalance);
        assert!(report.plan.recommended_amount_raw > 0);
        assert_eq!(report.execution_protocol, "burrow");
        assert!(report.readiness.can_execute);
        assert_eq!(report.comparison.protocols[0].health, HealthTag::Fresh);
    }

    #[tokio::test]
    async fn test_compute_holds_when_usdc_full() {
        let planner = planner(StaticAprSource::new().with("burrow", 300, 350));
        let report = planner.compute(&YieldParams::new(0, 100)).await.unwrap();

        assert_eq!(report.plan.action, PlanAction::Hold);
        assert_eq!(report.plan.reason, "usdc_at_or_above_target");
    }

    #[tokio::test]
    async fn test_failed_source_uses_fallback() {
        let mut source = MockAprSource::new();
        source
            .expect_fetch()
            .returning(|_| Err(RebalanceError::AdapterTransient(TransientCause::RateLimited)));
        let planner = planner(source);

        let comparison = planner.compare().await;
        let row = comparison.protocol("burrow").unwrap();
        assert_eq!(row.source, Some(HintSource::Fallback));
        assert!(row.risk_tags.contains(&RiskTag::FallbackSource));
        assert!(row.risk_tags.contains(&RiskTag::RecentSourceError));
        assert_eq!(row.health, HealthTag::Unknown);
    }

    #[tokio::test]
    async fn test_unknown_protocol_rejected() {
        let planner = planner(StaticAprSource::new());
        let mut params = YieldParams::new(100, 0);
        params.protocol_id = Some("nowhere".to_string());

        let err = planner.compute(&params).await.unwrap_err();
        assert!(matches!(err, RebalanceError::Validation(_)));
    }
}
