//! Run and job events for the metrics/alert collaborator
//!
//! Sinks are fire-and-forget: `record` is synchronous, infallible and must
//! never block the engine.

use crate::domain::{Chain, RunStatus};
use crate::jobs::JobStatus;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Error => "error",
            AlertLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        chain: Chain,
        amount_raw: u128,
    },
    RunFinished {
        run_id: String,
        chain: Chain,
        status: RunStatus,
        reconciled: bool,
        reason: Option<String>,
    },
    RollbackExecuted {
        run_id: String,
        tx_hash: Option<String>,
    },
    RollbackFailed {
        run_id: String,
        reason: String,
    },
    /// Success that left more than dust in the operating wallet
    Unreconciled {
        run_id: String,
        residual_in_raw: u128,
        residual_out_raw: u128,
    },
    JobTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
        attempt: u32,
        error: Option<String>,
    },
    EndpointFailure {
        endpoint: String,
        cause: String,
    },
}

impl RunEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::RunStarted { .. } => "run_started",
            RunEvent::RunFinished { .. } => "run_finished",
            RunEvent::RollbackExecuted { .. } => "rollback_executed",
            RunEvent::RollbackFailed { .. } => "rollback_failed",
            RunEvent::Unreconciled { .. } => "unreconciled",
            RunEvent::JobTransition { .. } => "job_transition",
            RunEvent::EndpointFailure { .. } => "endpoint_failure",
        }
    }

    pub fn level(&self) -> AlertLevel {
        match self {
            RunEvent::RunStarted { .. } => AlertLevel::Info,
            RunEvent::RunFinished { status, .. } => match status {
                RunStatus::Success | RunStatus::Planned => AlertLevel::Info,
                RunStatus::Rollback => AlertLevel::Warning,
                RunStatus::Failed => AlertLevel::Error,
            },
            RunEvent::RollbackExecuted { .. } => AlertLevel::Warning,
            RunEvent::RollbackFailed { .. } => AlertLevel::Critical,
            RunEvent::Unreconciled { .. } => AlertLevel::Warning,
            RunEvent::JobTransition { to, .. } => match to {
                JobStatus::DeadLetter => AlertLevel::Error,
                _ => AlertLevel::Info,
            },
            RunEvent::EndpointFailure { .. } => AlertLevel::Warning,
        }
    }
}

pub trait EventSink: Send + Sync {
    fn record(&self, event: &RunEvent);
}

/// Writes every event to the log at its alert level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: &RunEvent) {
        match event.level() {
            AlertLevel::Info => info!(event = event.name(), "{:?}", event),
            AlertLevel::Warning => warn!(event = event.name(), "{:?}", event),
            AlertLevel::Error | AlertLevel::Critical => {
                error!(event = event.name(), level = %event.level(), "{:?}", event)
            }
        }
    }
}

/// Sends each event to several sinks
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn record(&self, event: &RunEvent) {
        for sink in &self.sinks {
            sink.record(event);
        }
    }
}

/// Keeps events in memory, for inspection
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<RunEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RunEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn count(&self, name: &str) -> usize {
        self.events().iter().filter(|e| e.name() == name).count()
    }
}

impl EventSink for RecordingSink {
    fn record(&self, event: &RunEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels() {
        let dead = RunEvent::JobTransition {
            job_id: "j".into(),
            from: JobStatus::Running,
            to: JobStatus::DeadLetter,
            attempt: 3,
            error: None,
        };
        assert_eq!(dead.level(), AlertLevel::Error);

        let rollback_failed = RunEvent::RollbackFailed {
            run_id: "r".into(),
            reason: "timeout".into(),
        };
        assert_eq!(rollback_failed.level(), AlertLevel::Critical);
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let a = Arc::new(RecordingSink::new());
        let b = Arc::new(RecordingSink::new());
        let fanout = FanoutSink::new().with(a.clone()).with(b.clone());

        fanout.record(&RunEvent::EndpointFailure {
            endpoint: "https://rpc".into(),
            cause: "429".into(),
        });

        assert_eq!(a.count("endpoint_failure"), 1);
        assert_eq!(b.count("endpoint_failure"), 1);
    }
}
