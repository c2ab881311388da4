use crate::error::{ErrorKind, RebalanceError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which chain a run executes on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Chain {
    /// NEAR-style account chain: withdraw, swap, supply
    Primary,
    /// EVM-style chain: guarded swap, then delegated supply
    Secondary,
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Primary => "primary",
            Chain::Secondary => "secondary",
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Run status as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Planned,
    Success,
    Failed,
    Rollback,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Planned => "planned",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Rollback => "rollback",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Planned)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Run state machine phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunPhase {
    Idle,
    Beginning,
    /// Step 1: collateral -> wallet
    Withdraw,
    Quoting,
    GuardChecking,
    /// Step 2
    Swap,
    /// Re-supply of the withdrawn amount after a failure past Step 1
    Rollback,
    /// Step 3: swap output -> collateral (or post-action executor)
    Supply,
    Reconciling,
    Terminal,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Idle => "IDLE",
            RunPhase::Beginning => "BEGINNING",
            RunPhase::Withdraw => "WITHDRAW",
            RunPhase::Quoting => "QUOTING",
            RunPhase::GuardChecking => "GUARD_CHECKING",
            RunPhase::Swap => "SWAP",
            RunPhase::Rollback => "ROLLBACK",
            RunPhase::Supply => "SUPPLY",
            RunPhase::Reconciling => "RECONCILING",
            RunPhase::Terminal => "TERMINAL",
        }
    }

    /// Check if this phase can transition to another phase
    pub fn can_transition_to(&self, target: RunPhase) -> bool {
        use RunPhase::*;

        match (self, target) {
            (Idle, Beginning) => true,

            // Pre-Step1 guard failure, or straight to quoting on the secondary chain
            (Beginning, Withdraw) => true,
            (Beginning, Quoting) => true,
            (Beginning, Terminal) => true,

            (Withdraw, Quoting) => true,
            (Withdraw, Terminal) => true, // Withdraw itself failed, nothing moved

            (Quoting, GuardChecking) => true,
            (Quoting, Rollback) => true,
            (Quoting, Terminal) => true,

            (GuardChecking, Swap) => true,
            (GuardChecking, Rollback) => true,
            (GuardChecking, Terminal) => true,

            (Swap, Supply) => true,
            (Swap, Rollback) => true,
            (Swap, Terminal) => true,

            (Rollback, Terminal) => true,

            (Supply, Reconciling) => true,
            (Supply, Rollback) => true, // Step 3 failed, swapped funds re-supplied
            (Supply, Terminal) => true,

            (Reconciling, Terminal) => true,

            _ => false,
        }
    }

    /// Once Step 1 has committed, a run must be driven to a terminal state
    pub fn has_committed_funds(&self) -> bool {
        matches!(
            self,
            RunPhase::Quoting
                | RunPhase::GuardChecking
                | RunPhase::Swap
                | RunPhase::Rollback
                | RunPhase::Supply
                | RunPhase::Reconciling
        )
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Phase transition event (for logging/debugging)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: RunPhase,
    pub to: RunPhase,
    pub at: DateTime<Utc>,
}

/// Transaction hashes recorded per step
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepTxs {
    pub withdraw: Option<String>,
    pub swap: Option<String>,
    pub supply: Option<String>,
    pub rollback: Option<String>,
}

/// One rebalance attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub chain: Chain,
    #[serde(with = "crate::domain::amount")]
    pub amount_raw: u128,
    pub slippage_bps: u32,
    pub pool_id: Option<String>,
    pub route: Option<String>,
    pub token_in: String,
    pub token_out: String,
    pub status: RunStatus,
    pub phase: RunPhase,
    pub txs: StepTxs,
    #[serde(with = "crate::domain::amount::option", default)]
    pub quote_out_raw: Option<u128>,
    #[serde(with = "crate::domain::amount::option", default)]
    pub min_out_raw: Option<u128>,
    /// Actual swap output measured from the wallet balance delta
    #[serde(with = "crate::domain::amount::option", default)]
    pub supplied_raw: Option<u128>,
    pub reconciled: bool,
    pub reason: Option<String>,
    pub retryable: bool,
    pub error_kind: Option<ErrorKind>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub phases: Vec<PhaseTransition>,
}

impl RunRecord {
    pub fn new(
        run_id: impl Into<String>,
        chain: Chain,
        amount_raw: u128,
        slippage_bps: u32,
        token_in: impl Into<String>,
        token_out: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            chain,
            amount_raw,
            slippage_bps,
            pool_id: None,
            route: None,
            token_in: token_in.into(),
            token_out: token_out.into(),
            status: RunStatus::Planned,
            phase: RunPhase::Idle,
            txs: StepTxs::default(),
            quote_out_raw: None,
            min_out_raw: None,
            supplied_raw: None,
            reconciled: false,
            reason: None,
            retryable: false,
            error_kind: None,
            started_at: Utc::now(),
            finished_at: None,
            phases: Vec::new(),
        }
    }

    pub fn with_pool(mut self, pool_id: impl Into<String>) -> Self {
        self.pool_id = Some(pool_id.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.phase == RunPhase::Terminal
    }

    /// Move to the next phase, rejecting transitions the state machine does not allow
    pub fn advance(&mut self, to: RunPhase) -> Result<()> {
        if !self.phase.can_transition_to(to) {
            return Err(RebalanceError::Internal(format!(
                "run {}: invalid phase transition {} -> {}",
                self.run_id, self.phase, to
            )));
        }
        self.phases.push(PhaseTransition {
            from: self.phase,
            to,
            at: Utc::now(),
        });
        self.phase = to;
        Ok(())
    }

    /// Enter the terminal phase with a final status. Terminal records are immutable.
    pub fn finish(
        &mut self,
        status: RunStatus,
        reason: Option<String>,
        error_kind: Option<ErrorKind>,
        retryable: bool,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(RebalanceError::Internal(format!(
                "run {}: cannot finish with status {}",
                self.run_id, status
            )));
        }
        self.advance(RunPhase::Terminal)?;
        self.status = status;
        self.reason = reason;
        self.error_kind = error_kind;
        self.retryable = retryable;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Finish as failed from an error, keeping its taxonomy and retry flag
    pub fn fail_with(&mut self, status: RunStatus, err: &RebalanceError) -> Result<()> {
        self.finish(
            status,
            Some(err.to_string()),
            Some(err.kind()),
            err.is_retryable(),
        )
    }
}

impl RunRecord {
    /// Force the record terminal after an unexpected error mid-run. Skips the
    /// transition table, which is exactly what failed.
    pub fn abort(&mut self, err: &RebalanceError) {
        if self.is_terminal() {
            return;
        }
        self.phases.push(PhaseTransition {
            from: self.phase,
            to: RunPhase::Terminal,
            at: Utc::now(),
        });
        self.phase = RunPhase::Terminal;
        self.status = RunStatus::Failed;
        self.reason = Some(err.to_string());
        self.error_kind = Some(err.kind());
        self.retryable = false;
        self.finished_at = Some(Utc::now());
    }
}

/// What `recent_runs` remembers about a finished run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub reason: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl From<&RunRecord> for RunOutcome {
    fn from(record: &RunRecord) -> Self {
        Self {
            status: record.status,
            reason: record.reason.clone(),
            finished_at: record.finished_at.unwrap_or_else(Utc::now),
        }
    }
}
