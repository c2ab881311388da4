use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the rebalancing agent
#[derive(Error, Debug)]
pub enum RebalanceError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Risk guard errors
    #[error("Guard violation: {0}")]
    Guard(#[from] GuardViolation),

    // Collaborator errors
    #[error("Adapter transient failure: {0}")]
    AdapterTransient(TransientCause),

    #[error("Adapter configuration error: {0}")]
    AdapterConfig(String),

    #[error("Adapter execution failed: {reason}")]
    AdapterExecution { reason: String, retryable: bool },

    // RPC routing errors
    #[error("All RPC endpoints exhausted after {rounds} round(s): {last_error}")]
    AllEndpointsExhausted { rounds: u32, last_error: String },

    #[error("RPC error from {endpoint}: {message}")]
    Rpc { endpoint: String, message: String },

    // Concurrency errors
    #[error("Another run is active: {active}")]
    AnotherRunActive { active: String },

    #[error("Duplicate run: {0}")]
    DuplicateRun(String),

    // Job queue errors
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {job_id} is {status}, expected {expected}")]
    InvalidJobState {
        job_id: String,
        status: String,
        expected: String,
    },

    #[error("Job queue full: {capacity} jobs")]
    QueueFull { capacity: usize },

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for RebalanceError
pub type Result<T> = std::result::Result<T, RebalanceError>;

/// Failure taxonomy used to decide whether automation may resubmit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Caller or config issue: amount, slippage, divergence, cooldown, daily limit
    GuardViolation,
    /// HTTP 429/5xx, timeouts, rate limiting
    AdapterTransient,
    /// Missing credentials, missing command template, disallowed token
    AdapterConfig,
    /// Adapter ran but the action failed
    AdapterExecutionFailed,
    /// Another run active or duplicate run id
    ConcurrencyConflict,
    /// Malformed input
    Validation,
    /// Bugs and local failures
    Internal,
}

impl ErrorKind {
    /// Retry policy table
    pub fn is_retryable(&self) -> bool {
        match self {
            ErrorKind::GuardViolation => false,
            ErrorKind::AdapterTransient => true,
            ErrorKind::AdapterConfig => false,
            ErrorKind::AdapterExecutionFailed => true,
            ErrorKind::ConcurrencyConflict => false,
            ErrorKind::Validation => false,
            ErrorKind::Internal => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::GuardViolation => "guard_violation",
            ErrorKind::AdapterTransient => "adapter_transient",
            ErrorKind::AdapterConfig => "adapter_config",
            ErrorKind::AdapterExecutionFailed => "adapter_execution_failed",
            ErrorKind::ConcurrencyConflict => "concurrency_conflict",
            ErrorKind::Validation => "validation",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl RebalanceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RebalanceError::Guard(_) => ErrorKind::GuardViolation,
            RebalanceError::AdapterTransient(_)
            | RebalanceError::AllEndpointsExhausted { .. }
            | RebalanceError::Http(_) => ErrorKind::AdapterTransient,
            RebalanceError::AdapterConfig(_) | RebalanceError::Config(_) => {
                ErrorKind::AdapterConfig
            }
            RebalanceError::AdapterExecution { .. } | RebalanceError::Rpc { .. } => {
                ErrorKind::AdapterExecutionFailed
            }
            RebalanceError::AnotherRunActive { .. } | RebalanceError::DuplicateRun(_) => {
                ErrorKind::ConcurrencyConflict
            }
            RebalanceError::Validation(_)
            | RebalanceError::JobNotFound(_)
            | RebalanceError::InvalidJobState { .. }
            | RebalanceError::Json(_) => ErrorKind::Validation,
            RebalanceError::QueueFull { .. }
            | RebalanceError::Io(_)
            | RebalanceError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the failure may be retried by the job queue.
    ///
    /// Execution failures carry their own flag; a non-retryable JSON-RPC error
    /// is never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            RebalanceError::AdapterExecution { retryable, .. } => *retryable,
            RebalanceError::Rpc { .. } => false,
            other => other.kind().is_retryable(),
        }
    }
}

/// Why a transient failure happened, classified where it was observed
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum TransientCause {
    #[error("rate limited (HTTP 429)")]
    RateLimited,

    #[error("server error (HTTP {status})")]
    ServerError { status: u16 },

    #[error("timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("network error: {message}")]
    Network { message: String },
}

/// Errors returned by chain adapters, quote sources and post-action executors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("{0}")]
    Transient(TransientCause),

    #[error("configuration: {0}")]
    Config(String),

    #[error("execution failed: {reason}")]
    Execution { reason: String, retryable: bool },
}

impl From<AdapterError> for RebalanceError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Transient(cause) => RebalanceError::AdapterTransient(cause),
            AdapterError::Config(msg) => RebalanceError::AdapterConfig(msg),
            AdapterError::Execution { reason, retryable } => {
                RebalanceError::AdapterExecution { reason, retryable }
            }
        }
    }
}

/// Routed RPC failures seen from inside an adapter
impl From<RebalanceError> for AdapterError {
    fn from(err: RebalanceError) -> Self {
        match err {
            RebalanceError::AdapterTransient(cause) => AdapterError::Transient(cause),
            RebalanceError::AdapterConfig(msg) => AdapterError::Config(msg),
            RebalanceError::AdapterExecution { reason, retryable } => {
                AdapterError::Execution { reason, retryable }
            }
            other if other.kind() == ErrorKind::AdapterTransient => {
                AdapterError::Transient(TransientCause::Network {
                    message: other.to_string(),
                })
            }
            other => AdapterError::Execution {
                retryable: other.is_retryable(),
                reason: other.to_string(),
            },
        }
    }
}

/// Risk guard failures. All are non-retryable.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "guard", rename_all = "snake_case")]
pub enum GuardViolation {
    #[error("invalid amount: {raw}")]
    InvalidAmount { raw: String },

    #[error("amount {amount_raw} exceeds max {max_raw}")]
    AmountExceedsMax { amount_raw: u128, max_raw: u128 },

    #[error("quote {quote_out_raw} below minimum {min_raw}")]
    QuoteBelowMinimum { quote_out_raw: u128, min_raw: u128 },

    #[error("slippage {slippage_bps} bps exceeds max {max_bps} bps")]
    SlippageExceedsMax { slippage_bps: u32, max_bps: u32 },

    #[error("min out {min_out_raw} outside (0, {quote_out_raw}]")]
    InvalidMinOutBoundary { min_out_raw: u128, quote_out_raw: u128 },

    #[error("effective rate {rate} below floor {floor}")]
    EffectiveRateBelowFloor {
        rate: rust_decimal::Decimal,
        floor: rust_decimal::Decimal,
    },

    #[error("daily limit reached: {count} >= {max}")]
    DailyLimitReached { count: u32, max: u32 },

    #[error("cooldown active: {remaining_secs}s remaining")]
    CooldownActive { remaining_secs: i64 },

    #[error("quote divergence {divergence_bps} bps exceeds max {max_bps} bps")]
    QuoteDivergence { divergence_bps: u32, max_bps: u32 },
}

impl GuardViolation {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            GuardViolation::InvalidAmount { .. } => "invalid_amount",
            GuardViolation::AmountExceedsMax { .. } => "amount_exceeds_max",
            GuardViolation::QuoteBelowMinimum { .. } => "quote_below_minimum",
            GuardViolation::SlippageExceedsMax { .. } => "slippage_exceeds_max",
            GuardViolation::InvalidMinOutBoundary { .. } => "invalid_min_out_boundary",
            GuardViolation::EffectiveRateBelowFloor { .. } => "effective_rate_below_floor",
            GuardViolation::DailyLimitReached { .. } => "daily_limit_reached",
            GuardViolation::CooldownActive { .. } => "cooldown_active",
            GuardViolation::QuoteDivergence { .. } => "quote_divergence",
        }
    }
}
