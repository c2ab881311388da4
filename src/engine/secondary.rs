//! Secondary-chain run: divergence-guarded swap, then a per-protocol post-action

use super::primary::{bounded, resolve_run_id};
use super::state::RunLedger;
use crate::adapters::{ChainAdapter, PostActionExecutor, PostActionRequest, QuoteSource};
use crate::config::{EngineConfig, SecondaryConfig};
use crate::domain::{Chain, RunPhase, RunRecord, RunStatus};
use crate::error::{ErrorKind, Result};
use crate::risk::{
    divergence_bps, min_out_for, parse_amount_raw, quote_divergence_within, GuardPolicy,
    PreExecutionInput, QuoteInput,
};
use crate::telemetry::{EventSink, RunEvent};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecondaryRequest {
    #[serde(default)]
    pub run_id: Option<String>,
    pub amount_raw: String,
    #[serde(default)]
    pub slippage_bps: Option<u32>,
    /// Overrides the configured post-action protocol
    #[serde(default)]
    pub protocol_id: Option<String>,
}

impl SecondaryRequest {
    pub fn new(amount_raw: impl Into<String>) -> Self {
        Self {
            amount_raw: amount_raw.into(),
            ..Default::default()
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct SecondarySettings {
    pub token_in: String,
    pub token_out: String,
    pub post_action_protocol: String,
    pub default_slippage_bps: u32,
    pub dust_threshold_raw: u128,
    pub adapter_timeout: Duration,
}

impl SecondarySettings {
    pub fn from_config(secondary: &SecondaryConfig, engine: &EngineConfig) -> Self {
        Self {
            token_in: secondary.token_in.clone(),
            token_out: secondary.token_out.clone(),
            post_action_protocol: secondary.post_action_protocol.clone(),
            default_slippage_bps: engine.default_slippage_bps,
            dust_threshold_raw: u128::from(engine.dust_threshold_raw),
            adapter_timeout: Duration::from_secs(engine.adapter_timeout_secs),
        }
    }
}

pub struct SecondaryRunner {
    chain: Arc<dyn ChainAdapter>,
    /// Off-chain price source
    reference_quotes: Arc<dyn QuoteSource>,
    /// On-chain router quote; the swap executes against this one
    router_quotes: Arc<dyn QuoteSource>,
    post_action: Arc<dyn PostActionExecutor>,
    ledger: Arc<RunLedger>,
    policy: GuardPolicy,
    settings: SecondarySettings,
    sink: Arc<dyn EventSink>,
}

impl SecondaryRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<dyn ChainAdapter>,
        reference_quotes: Arc<dyn QuoteSource>,
        router_quotes: Arc<dyn QuoteSource>,
        post_action: Arc<dyn PostActionExecutor>,
        ledger: Arc<RunLedger>,
        policy: GuardPolicy,
        settings: SecondarySettings,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            chain,
            reference_quotes,
            router_quotes,
            post_action,
            ledger,
            policy,
            settings,
            sink,
        }
    }

    pub fn ledger(&self) -> &Arc<RunLedger> {
        &self.ledger
    }

    /// Execute one secondary-chain run.
    ///
    /// Guard, quote and divergence failures return `Err` before the swap.
    /// A failed post-action ends `Failed` with the executor's retry flag and
    /// no rollback; the swapped funds stay in the wallet for the next attempt.
    #[instrument(skip(self, request), fields(run_id = tracing::field::Empty))]
    pub async fn execute(&self, request: &SecondaryRequest) -> Result<RunRecord> {
        let amount_raw = parse_amount_raw(&request.amount_raw)?;
        let slippage_bps = request
            .slippage_bps
            .unwrap_or(self.settings.default_slippage_bps);
        let run_id = resolve_run_id(request.run_id.as_deref());
        tracing::Span::current().record("run_id", run_id.as_str());
        let protocol = request
            .protocol_id
            .clone()
            .unwrap_or_else(|| self.settings.post_action_protocol.clone());

        self.ledger.begin(&run_id).await?;

        let mut record = RunRecord::new(
            &run_id,
            Chain::Secondary,
            amount_raw,
            slippage_bps,
            &self.settings.token_in,
            &self.settings.token_out,
        );

        let min_out_raw = match self.prepare(&mut record).await {
            Ok(min_out_raw) => min_out_raw,
            Err(e) => {
                self.ledger.release(&run_id).await;
                return Err(e);
            }
        };

        if let Err(e) = self.drive(&mut record, min_out_raw, &protocol).await {
            error!(run_id = %run_id, error = %e, phase = %record.phase, "Run aborted by internal error");
            record.abort(&e);
        }

        self.ledger.end(&record).await;
        self.sink.record(&RunEvent::RunFinished {
            run_id: record.run_id.clone(),
            chain: Chain::Secondary,
            status: record.status,
            reconciled: record.reconciled,
            reason: record.reason.clone(),
        });
        info!(run_id = %record.run_id, status = %record.status, protocol = %protocol, "Secondary run finished");
        Ok(record)
    }

    /// Guards and quotes; nothing has moved yet. Returns the swap's min out.
    async fn prepare(&self, record: &mut RunRecord) -> Result<u128> {
        let now = Utc::now();
        let view = self.ledger.view(now).await;
        self.policy.check_pre_execution(&PreExecutionInput {
            amount_raw: record.amount_raw,
            slippage_bps: record.slippage_bps,
            daily_count: view.daily_count,
            last_executed_at: view.last_executed_at,
            now,
        })?;

        record.advance(RunPhase::Beginning)?;
        record.advance(RunPhase::Quoting)?;
        let timeout = self.settings.adapter_timeout;
        let (token_in, token_out, amount) =
            (record.token_in.clone(), record.token_out.clone(), record.amount_raw);
        let (reference, routed) = tokio::join!(
            bounded(timeout, self.reference_quotes.quote(&token_in, &token_out, amount)),
            bounded(timeout, self.router_quotes.quote(&token_in, &token_out, amount)),
        );
        let (reference, routed) = (reference?, routed?);

        record.advance(RunPhase::GuardChecking)?;
        let divergence = divergence_bps(reference.amount_out_raw, routed.amount_out_raw);
        if let Err(violation) = quote_divergence_within(
            reference.amount_out_raw,
            routed.amount_out_raw,
            self.policy.max_divergence_bps,
        ) {
            warn!(
                run_id = %record.run_id,
                reference = %reference.source,
                router = %routed.source,
                divergence,
                "Quote sources disagree, not swapping"
            );
            return Err(violation.into());
        }

        let min_out_raw = min_out_for(routed.amount_out_raw, record.slippage_bps);
        self.policy.check_quote(&QuoteInput {
            amount_raw: amount,
            quote_out_raw: routed.amount_out_raw,
            min_out_raw,
        })?;

        record.quote_out_raw = Some(routed.amount_out_raw);
        record.min_out_raw = Some(min_out_raw);
        record.route = Some(routed.source);
        self.sink.record(&RunEvent::RunStarted {
            run_id: record.run_id.clone(),
            chain: Chain::Secondary,
            amount_raw: amount,
        });
        Ok(min_out_raw)
    }

    async fn drive(&self, record: &mut RunRecord, min_out_raw: u128, protocol: &str) -> Result<()> {
        let timeout = self.settings.adapter_timeout;

        let out_before = match bounded(timeout, self.chain.balance(&record.token_out)).await {
            Ok(balance) => balance,
            Err(e) => return record.fail_with(RunStatus::Failed, &e),
        };

        record.advance(RunPhase::Swap)?;
        match bounded(
            timeout,
            self.chain.swap(
                &record.token_in,
                &record.token_out,
                record.amount_raw,
                min_out_raw,
            ),
        )
        .await
        {
            Ok(tx) => record.txs.swap = tx.tx_hash,
            Err(e) => return record.fail_with(RunStatus::Failed, &e),
        }

        record.advance(RunPhase::Supply)?;
        let received = match bounded(timeout, self.chain.balance(&record.token_out)).await {
            Ok(after) => after.saturating_sub(out_before),
            Err(e) => return record.fail_with(RunStatus::Failed, &e),
        };
        record.supplied_raw = Some(received);

        let request = PostActionRequest {
            amount_raw: received,
            token: record.token_out.clone(),
            run_id: record.run_id.clone(),
        };
        let result = match tokio::time::timeout(timeout, self.post_action.execute(protocol, &request)).await {
            Ok(result) => result,
            Err(_) => crate::adapters::PostActionResult::failure(
                format!("{} post-action timed out", protocol),
                true,
            ),
        };

        if !result.ok {
            let reason = result
                .reason
                .unwrap_or_else(|| format!("{} post-action failed", protocol));
            warn!(run_id = %record.run_id, protocol, retryable = result.retryable, %reason, "Post-action failed after swap");
            return record.finish(
                RunStatus::Failed,
                Some(reason),
                Some(ErrorKind::AdapterExecutionFailed),
                result.retryable,
            );
        }
        record.txs.supply = result.tx_hash;

        record.advance(RunPhase::Reconciling)?;
        match bounded(timeout, self.chain.balance(&record.token_out)).await {
            Ok(residual) => {
                record.reconciled = residual <= self.settings.dust_threshold_raw;
                if !record.reconciled {
                    self.sink.record(&RunEvent::Unreconciled {
                        run_id: record.run_id.clone(),
                        residual_in_raw: 0,
                        residual_out_raw: residual,
                    });
                }
            }
            Err(e) => warn!(run_id = %record.run_id, error = %e, "Reconcile balance read failed"),
        }
        record.finish(RunStatus::Success, None, None, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MockPostActionExecutor, PaperChain, PostActionResult};
    use crate::error::{GuardViolation, RebalanceError};
    use crate::telemetry::RecordingSink;
    use rust_decimal_macros::dec;

    fn settings() -> SecondarySettings {
        SecondarySettings {
            token_in: "USDT".into(),
            token_out: "USDC".into(),
            post_action_protocol: "venus".into(),
            default_slippage_bps: 50,
            dust_threshold_raw: 10,
            adapter_timeout: Duration::from_secs(5),
        }
    }

    fn runner(
        chain: Arc<PaperChain>,
        reference: Arc<PaperChain>,
        post_action: Arc<dyn PostActionExecutor>,
    ) -> SecondaryRunner {
        SecondaryRunner::new(
            chain.clone(),
            reference,
            chain,
            post_action,
            Arc::new(RunLedger::new(50)),
            GuardPolicy::default(),
            settings(),
            Arc::new(RecordingSink::new()),
        )
    }

    fn wallet() -> Arc<PaperChain> {
        Arc::new(
            PaperChain::new(Chain::Secondary)
                .with_wallet("USDT", 2_000_000)
                .with_rate(dec!(0.999)),
        )
    }

    #[tokio::test]
    async fn test_swap_then_post_action() {
        let chain = wallet();
        let reference = Arc::new(PaperChain::new(Chain::Secondary).with_rate(dec!(1)));
        let runner = runner(chain.clone(), reference, chain.clone());

        let record = runner
            .execute(&SecondaryRequest::new("1000000"))
            .await
            .unwrap();

        assert_eq!(record.status, RunStatus::Success);
        assert!(record.reconciled);
        assert_eq!(record.supplied_raw, Some(999_000));
        assert_eq!(chain.collateral_balance("USDC"), 999_000);
    }

    #[tokio::test]
    async fn test_divergent_quotes_abort_before_swap() {
        let chain = wallet();
        let reference = Arc::new(PaperChain::new(Chain::Secondary).with_rate(dec!(1.05)));
        let runner = runner(chain.clone(), reference, chain.clone());

        let err = runner
            .execute(&SecondaryRequest::new("1000000").with_run_id("s-1"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RebalanceError::Guard(GuardViolation::QuoteDivergence { .. })
        ));
        assert_eq!(chain.wallet_balance("USDT"), 2_000_000);
        assert!(runner.ledger().snapshot().await.active_run_id.is_none());
    }

    #[tokio::test]
    async fn test_post_action_failure_keeps_executor_retry_flag() {
        let chain = wallet();
        let reference = Arc::new(PaperChain::new(Chain::Secondary).with_rate(dec!(1)));
        let mut executor = MockPostActionExecutor::new();
        executor
            .expect_execute()
            .withf(|protocol, request| protocol == "venus" && request.token == "USDC")
            .times(1)
            .returning(|_, _| PostActionResult::failure("nonce too low", true));
        let runner = runner(chain.clone(), reference, Arc::new(executor));

        let record = runner
            .execute(&SecondaryRequest::new("1000000"))
            .await
            .unwrap();

        assert_eq!(record.status, RunStatus::Failed);
        assert!(record.retryable);
        assert_eq!(record.error_kind, Some(ErrorKind::AdapterExecutionFailed));
        assert!(record.txs.rollback.is_none());
        // Swapped funds stay in the wallet
        assert_eq!(chain.wallet_balance("USDC"), 999_000);
    }
}
