//! Rebalance run state machine

pub mod primary;
pub mod secondary;
pub mod service;
pub mod state;

pub use primary::{EngineSettings, PrimaryRunner, RunRequest};
pub use secondary::{SecondaryRequest, SecondaryRunner, SecondarySettings};
pub use service::{
    attempt_run_id, JobPayload, RebalanceService, YieldExecution, YieldRebalanceRequest,
};
pub use state::{LedgerView, RebalanceState, RunLedger};
