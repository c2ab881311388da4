//! Run exclusivity, dedupe and daily counters

use crate::domain::{RunOutcome, RunRecord, RunStatus};
use crate::error::{RebalanceError, Result};
use crate::risk::daily_day_key;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Process-wide run state for one chain.
///
/// A run may begin only when no run is active and its id is not among the
/// recent runs. `daily_count` resets when the UTC day key changes.
#[derive(Debug, Clone, Serialize)]
pub struct RebalanceState {
    pub active_run_id: Option<String>,
    recent_runs: VecDeque<(String, RunOutcome)>,
    #[serde(skip)]
    capacity: usize,
    pub daily_window_day: String,
    pub daily_count: u32,
    pub last_executed_at: Option<DateTime<Utc>>,
}

impl RebalanceState {
    pub fn new(capacity: usize) -> Self {
        Self {
            active_run_id: None,
            recent_runs: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            daily_window_day: daily_day_key(Utc::now()),
            daily_count: 0,
            last_executed_at: None,
        }
    }

    pub fn begin(&mut self, run_id: &str) -> Result<()> {
        if let Some(active) = &self.active_run_id {
            if active == run_id {
                return Err(RebalanceError::DuplicateRun(run_id.to_string()));
            }
            return Err(RebalanceError::AnotherRunActive {
                active: active.clone(),
            });
        }
        if self.outcome(run_id).is_some() {
            return Err(RebalanceError::DuplicateRun(run_id.to_string()));
        }
        self.active_run_id = Some(run_id.to_string());
        Ok(())
    }

    /// Record a terminal run. Successful runs count toward the daily limit
    /// and restart the cooldown.
    pub fn end(&mut self, run_id: &str, outcome: RunOutcome) {
        if self.active_run_id.as_deref() == Some(run_id) {
            self.active_run_id = None;
        }

        if outcome.status == RunStatus::Success {
            self.roll_daily_window(outcome.finished_at);
            self.daily_count += 1;
            self.last_executed_at = Some(outcome.finished_at);
        }

        self.recent_runs.retain(|(id, _)| id != run_id);
        if self.recent_runs.len() >= self.capacity {
            self.recent_runs.pop_front();
        }
        self.recent_runs.push_back((run_id.to_string(), outcome));
    }

    /// Clear the active run without recording it (nothing happened on-chain)
    pub fn release(&mut self, run_id: &str) {
        if self.active_run_id.as_deref() == Some(run_id) {
            self.active_run_id = None;
        }
    }

    pub fn roll_daily_window(&mut self, now: DateTime<Utc>) {
        let day = daily_day_key(now);
        if day != self.daily_window_day {
            debug!(from = %self.daily_window_day, to = %day, "Daily window rolled over");
            self.daily_window_day = day;
            self.daily_count = 0;
        }
    }

    pub fn outcome(&self, run_id: &str) -> Option<&RunOutcome> {
        self.recent_runs
            .iter()
            .find(|(id, _)| id == run_id)
            .map(|(_, outcome)| outcome)
    }

    pub fn recent_runs(&self) -> impl Iterator<Item = &(String, RunOutcome)> {
        self.recent_runs.iter()
    }
}

/// Guard inputs read from the ledger at one instant
#[derive(Debug, Clone, Copy)]
pub struct LedgerView {
    pub daily_count: u32,
    pub last_executed_at: Option<DateTime<Utc>>,
}

/// `RebalanceState` behind a mutex; the single-flight gate for runs
#[derive(Debug)]
pub struct RunLedger {
    state: Mutex<RebalanceState>,
}

impl RunLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(RebalanceState::new(capacity)),
        }
    }

    pub async fn begin(&self, run_id: &str) -> Result<()> {
        self.state.lock().await.begin(run_id)?;
        info!(run_id, "Run began");
        Ok(())
    }

    pub async fn end(&self, record: &RunRecord) {
        self.state
            .lock()
            .await
            .end(&record.run_id, RunOutcome::from(record));
    }

    pub async fn release(&self, run_id: &str) {
        self.state.lock().await.release(run_id);
    }

    pub async fn view(&self, now: DateTime<Utc>) -> LedgerView {
        let mut state = self.state.lock().await;
        state.roll_daily_window(now);
        LedgerView {
            daily_count: state.daily_count,
            last_executed_at: state.last_executed_at,
        }
    }

    pub async fn snapshot(&self) -> RebalanceState {
        self.state.lock().await.clone()
    }
}
