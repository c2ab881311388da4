pub mod adapters;
pub mod agent;
pub mod cli;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod risk;
pub mod rpc;
pub mod telemetry;
pub mod yields;

pub use agent::{Agent, Collaborators, PaperChains, PrimaryCollaborators, SecondaryCollaborators};
pub use config::AppConfig;
pub use domain::{Chain, RunPhase, RunRecord, RunStatus};
pub use engine::{
    JobPayload, RebalanceService, RunRequest, SecondaryRequest, YieldExecution,
    YieldRebalanceRequest,
};
pub use error::{ErrorKind, RebalanceError, Result};
pub use jobs::{AsyncJob, JobQueue, JobStatus};
pub use rpc::{RoutedResponse, RpcRouter};
pub use telemetry::{init_logging, init_logging_simple, Metrics};
pub use yields::{YieldParams, YieldPlan, YieldPlanner, YieldReport};
