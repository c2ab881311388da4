//! Primary-chain run: withdraw, quote, guard, swap, supply, reconcile

use super::state::RunLedger;
use crate::adapters::{AdapterResult, ChainAdapter, QuoteSource, TxResult};
use crate::config::EngineConfig;
use crate::domain::{Chain, RunPhase, RunRecord, RunStatus};
use crate::error::{GuardViolation, RebalanceError, Result, TransientCause};
use crate::risk::{min_out_for, parse_amount_raw, GuardPolicy, PreExecutionInput, QuoteInput};
use crate::telemetry::{EventSink, RunEvent};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Caller-supplied run parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub run_id: Option<String>,
    /// Integer string in token base units
    pub amount_raw: String,
    #[serde(default)]
    pub slippage_bps: Option<u32>,
}

impl RunRequest {
    pub fn new(amount_raw: impl Into<String>) -> Self {
        Self {
            run_id: None,
            amount_raw: amount_raw.into(),
            slippage_bps: None,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_slippage(mut self, slippage_bps: u32) -> Self {
        self.slippage_bps = Some(slippage_bps);
        self
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub token_in: String,
    pub token_out: String,
    pub pool_id: String,
    pub default_slippage_bps: u32,
    pub dust_threshold_raw: u128,
    pub adapter_timeout: Duration,
}

impl From<&EngineConfig> for EngineSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            token_in: config.token_in.clone(),
            token_out: config.token_out.clone(),
            pool_id: config.pool_id.clone(),
            default_slippage_bps: config.default_slippage_bps,
            dust_threshold_raw: u128::from(config.dust_threshold_raw),
            adapter_timeout: Duration::from_secs(config.adapter_timeout_secs),
        }
    }
}

/// Await an adapter call within the timeout budget
pub(crate) async fn bounded<T>(
    timeout: Duration,
    call: impl Future<Output = AdapterResult<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result.map_err(RebalanceError::from),
        Err(_) => Err(RebalanceError::AdapterTransient(TransientCause::Timeout {
            elapsed_ms: timeout.as_millis() as u64,
        })),
    }
}

pub(crate) fn resolve_run_id(requested: Option<&str>) -> String {
    match requested {
        Some(id) if !id.trim().is_empty() => id.to_string(),
        _ => format!("run-{}", Uuid::new_v4()),
    }
}

pub struct PrimaryRunner {
    chain: Arc<dyn ChainAdapter>,
    quotes: Arc<dyn QuoteSource>,
    ledger: Arc<RunLedger>,
    policy: GuardPolicy,
    settings: EngineSettings,
    sink: Arc<dyn EventSink>,
}

impl PrimaryRunner {
    pub fn new(
        chain: Arc<dyn ChainAdapter>,
        quotes: Arc<dyn QuoteSource>,
        ledger: Arc<RunLedger>,
        policy: GuardPolicy,
        settings: EngineSettings,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            chain,
            quotes,
            ledger,
            policy,
            settings,
            sink,
        }
    }

    pub fn ledger(&self) -> &Arc<RunLedger> {
        &self.ledger
    }

    /// Execute one run.
    ///
    /// Returns `Err` only when nothing moved on-chain (bad input, concurrency
    /// conflict, guard failure, failed withdraw). Once the withdraw has
    /// committed the run is always driven to a terminal record.
    #[instrument(skip(self, request), fields(run_id = tracing::field::Empty))]
    pub async fn execute(&self, request: &RunRequest) -> Result<RunRecord> {
        let amount_raw = parse_amount_raw(&request.amount_raw)?;
        let slippage_bps = request
            .slippage_bps
            .unwrap_or(self.settings.default_slippage_bps);
        let run_id = resolve_run_id(request.run_id.as_deref());
        tracing::Span::current().record("run_id", run_id.as_str());

        self.ledger.begin(&run_id).await?;

        let now = Utc::now();
        let view = self.ledger.view(now).await;
        let pre = PreExecutionInput {
            amount_raw,
            slippage_bps,
            daily_count: view.daily_count,
            last_executed_at: view.last_executed_at,
            now,
        };
        let violations = self.policy.evaluate_all(&pre, None);
        let failed: Vec<&str> = violations.iter().map(GuardViolation::code).collect();
        if let Some(violation) = violations.into_iter().next() {
            warn!(run_id = %run_id, guards = ?failed, %violation, "Pre-execution guard failed");
            self.ledger.release(&run_id).await;
            return Err(violation.into());
        }

        let mut record = RunRecord::new(
            &run_id,
            Chain::Primary,
            amount_raw,
            slippage_bps,
            &self.settings.token_in,
            &self.settings.token_out,
        )
        .with_pool(&self.settings.pool_id);

        if let Err(e) = self.withdraw(&mut record).await {
            self.ledger.release(&run_id).await;
            return Err(e);
        }

        if let Err(e) = self.drive_committed(&mut record).await {
            error!(run_id = %run_id, error = %e, phase = %record.phase, "Run aborted by internal error");
            if record.phase.has_committed_funds() {
                self.sink.record(&RunEvent::RollbackFailed {
                    run_id: run_id.clone(),
                    reason: format!("aborted in {}: {}", record.phase, e),
                });
            }
            record.abort(&e);
        }

        self.ledger.end(&record).await;
        self.sink.record(&RunEvent::RunFinished {
            run_id: record.run_id.clone(),
            chain: Chain::Primary,
            status: record.status,
            reconciled: record.reconciled,
            reason: record.reason.clone(),
        });
        info!(
            run_id = %record.run_id,
            status = %record.status,
            reconciled = record.reconciled,
            "Run finished"
        );
        Ok(record)
    }

    async fn withdraw(&self, record: &mut RunRecord) -> Result<()> {
        record.advance(RunPhase::Beginning)?;
        self.sink.record(&RunEvent::RunStarted {
            run_id: record.run_id.clone(),
            chain: Chain::Primary,
            amount_raw: record.amount_raw,
        });

        record.advance(RunPhase::Withdraw)?;
        let tx = bounded(
            self.settings.adapter_timeout,
            self.chain.withdraw(&record.token_in, record.amount_raw),
        )
        .await?;
        debug!(run_id = %record.run_id, tx = ?tx.tx_hash, "Withdraw committed");
        record.txs.withdraw = tx.tx_hash;
        Ok(())
    }

    /// Everything after the withdraw. Every failure path ends terminal.
    async fn drive_committed(&self, record: &mut RunRecord) -> Result<()> {
        let timeout = self.settings.adapter_timeout;

        record.advance(RunPhase::Quoting)?;
        let quote = match bounded(
            timeout,
            self.quotes
                .quote(&record.token_in, &record.token_out, record.amount_raw),
        )
        .await
        {
            Ok(quote) => quote,
            Err(e) => return self.rollback(record, &e, RunStatus::Failed).await,
        };
        record.quote_out_raw = Some(quote.amount_out_raw);
        record.route = Some(quote.source.clone());

        record.advance(RunPhase::GuardChecking)?;
        let min_out_raw = min_out_for(quote.amount_out_raw, record.slippage_bps);
        record.min_out_raw = Some(min_out_raw);
        let checked = QuoteInput {
            amount_raw: record.amount_raw,
            quote_out_raw: quote.amount_out_raw,
            min_out_raw,
        };
        if let Err(violation) = self.policy.check_quote(&checked) {
            warn!(run_id = %record.run_id, guard = violation.code(), %violation, "Quote guard failed after withdraw");
            return self
                .rollback(record, &violation.into(), RunStatus::Failed)
                .await;
        }

        let out_before = match bounded(timeout, self.chain.balance(&record.token_out)).await {
            Ok(balance) => balance,
            Err(e) => return self.rollback(record, &e, RunStatus::Failed).await,
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
            Err(e) => return self.rollback(record, &e, RunStatus::Rollback).await,
        }

        record.advance(RunPhase::Supply)?;
        let out_after = match bounded(timeout, self.chain.balance(&record.token_out)).await {
            Ok(balance) => balance,
            Err(e) => return self.recover_swapped(record, &e, out_before, None).await,
        };
        let received = out_after.saturating_sub(out_before);
        if received == 0 {
            let cause = RebalanceError::AdapterExecution {
                reason: "swap output not observed in wallet".to_string(),
                retryable: false,
            };
            return self.recover_swapped(record, &cause, out_before, None).await;
        }
        record.supplied_raw = Some(received);
        match bounded(timeout, self.chain.supply(&record.token_out, received)).await {
            Ok(tx) => record.txs.supply = tx.tx_hash,
            Err(e) => {
                error!(run_id = %record.run_id, received, error = %e, "Supply failed after swap");
                return self.recover_swapped(record, &e, out_before, Some(received)).await;
            }
        }

        record.advance(RunPhase::Reconciling)?;
        self.reconcile(record).await;
        record.finish(RunStatus::Success, None, None, false)
    }

    /// Put whatever the swap left in the wallet back into collateral.
    ///
    /// Tries the measured output once more, then re-reads the wallet and
    /// supplies the swap's output (or the withdrawn input, if the swap never
    /// consumed it). Success ends `Rollback`; the swap already moved value, so
    /// the run is never retryable. If nothing can be re-supplied the run ends
    /// `Failed` with a critical alert.
    async fn recover_swapped(
        &self,
        record: &mut RunRecord,
        cause: &RebalanceError,
        out_before: u128,
        received: Option<u128>,
    ) -> Result<()> {
        warn!(run_id = %record.run_id, cause = %cause, "Recovering funds after swap");
        record.advance(RunPhase::Rollback)?;
        let timeout = self.settings.adapter_timeout;

        if let Some(amount) = received {
            match bounded(timeout, self.chain.supply(&record.token_out, amount)).await {
                Ok(tx) => {
                    let token = record.token_out.clone();
                    return self.finish_recovered(record, cause, tx, &token, amount).await;
                }
                Err(e) => warn!(run_id = %record.run_id, error = %e, "Supply retry failed, sweeping wallet"),
            }
        }

        let failure = match self.sweep_target(record, out_before).await {
            Ok(Some((token, amount))) => {
                match bounded(timeout, self.chain.supply(&token, amount)).await {
                    Ok(tx) => return self.finish_recovered(record, cause, tx, &token, amount).await,
                    Err(e) => format!("re-supply of {} {} failed: {}", amount, token, e),
                }
            }
            Ok(None) => "neither swap output nor withdrawn input found in wallet".to_string(),
            Err(e) => format!("wallet read failed: {}", e),
        };

        let reason = format!("{}; recovery failed: {}", cause, failure);
        error!(run_id = %record.run_id, %reason, "Funds left in wallet after swap");
        self.sink.record(&RunEvent::RollbackFailed {
            run_id: record.run_id.clone(),
            reason: reason.clone(),
        });
        record.finish(RunStatus::Failed, Some(reason), Some(cause.kind()), false)
    }

    /// Token and amount to sweep back into collateral, if any
    async fn sweep_target(&self, record: &RunRecord, out_before: u128) -> Result<Option<(String, u128)>> {
        let timeout = self.settings.adapter_timeout;
        let out_now = bounded(timeout, self.chain.balance(&record.token_out)).await?;
        let swapped = out_now.saturating_sub(out_before);
        if swapped > self.settings.dust_threshold_raw {
            return Ok(Some((record.token_out.clone(), swapped)));
        }

        let in_now = bounded(timeout, self.chain.balance(&record.token_in)).await?;
        if in_now >= record.amount_raw {
            return Ok(Some((record.token_in.clone(), record.amount_raw)));
        }
        Ok(None)
    }

    async fn finish_recovered(
        &self,
        record: &mut RunRecord,
        cause: &RebalanceError,
        tx: TxResult,
        token: &str,
        amount: u128,
    ) -> Result<()> {
        info!(run_id = %record.run_id, token, amount, "Swapped funds re-supplied");
        self.sink.record(&RunEvent::RollbackExecuted {
            run_id: record.run_id.clone(),
            tx_hash: tx.tx_hash.clone(),
        });
        record.txs.rollback = tx.tx_hash;
        self.reconcile(record).await;
        record.finish(
            RunStatus::Rollback,
            Some(format!("{}; {} {} re-supplied after swap", cause, amount, token)),
            Some(cause.kind()),
            false,
        )
    }

    /// Re-supply the withdrawn amount so nothing is left in the wallet
    async fn rollback(
        &self,
        record: &mut RunRecord,
        cause: &RebalanceError,
        status: RunStatus,
    ) -> Result<()> {
        warn!(run_id = %record.run_id, phase = %record.phase, cause = %cause, "Rolling back withdraw");
        record.advance(RunPhase::Rollback)?;

        match bounded(
            self.settings.adapter_timeout,
            self.chain.supply(&record.token_in, record.amount_raw),
        )
        .await
        {
            Ok(tx) => {
                self.sink.record(&RunEvent::RollbackExecuted {
                    run_id: record.run_id.clone(),
                    tx_hash: tx.tx_hash.clone(),
                });
                record.txs.rollback = tx.tx_hash;
                record.finish(
                    status,
                    Some(format!("{}; withdrawn amount re-supplied", cause)),
                    Some(cause.kind()),
                    cause.is_retryable(),
                )
            }
            Err(e) => {
                let reason = format!("{}; rollback failed: {}", cause, e);
                error!(run_id = %record.run_id, %reason, "Rollback failed, funds left in wallet");
                self.sink.record(&RunEvent::RollbackFailed {
                    run_id: record.run_id.clone(),
                    reason: reason.clone(),
                });
                record.finish(RunStatus::Failed, Some(reason), Some(e.kind()), false)
            }
        }
    }

    async fn reconcile(&self, record: &mut RunRecord) {
        let timeout = self.settings.adapter_timeout;
        let residual_in = bounded(timeout, self.chain.balance(&record.token_in)).await;
        let residual_out = bounded(timeout, self.chain.balance(&record.token_out)).await;

        match (residual_in, residual_out) {
            (Ok(residual_in), Ok(residual_out)) => {
                let dust = self.settings.dust_threshold_raw;
                record.reconciled = residual_in <= dust && residual_out <= dust;
                if !record.reconciled {
                    warn!(run_id = %record.run_id, residual_in, residual_out, "Run left residual balance");
                    self.sink.record(&RunEvent::Unreconciled {
                        run_id: record.run_id.clone(),
                        residual_in_raw: residual_in,
                        residual_out_raw: residual_out,
                    });
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(run_id = %record.run_id, error = %e, "Reconcile balance read failed");
                record.reconciled = false;
            }
        }
    }
}
