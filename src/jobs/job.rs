use crate::error::{ErrorKind, RebalanceError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Job lifecycle. `Running` is transient and always resolves before the
/// worker yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    DeadLetter,
    Dismissed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::DeadLetter => "dead-letter",
            JobStatus::Dismissed => "dismissed",
        }
    }

    /// Finished jobs the bounded list may evict to make room
    pub fn is_evictable(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Dismissed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stored failure, classified so it can be re-evaluated later
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
    /// Flag reported by the failing step
    pub retryable: bool,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable,
        }
    }

    /// Apply the taxonomy table again. The stored flag can only veto.
    pub fn is_retryable(&self) -> bool {
        self.retryable && self.kind.is_retryable()
    }
}

impl From<&RebalanceError> for JobError {
    fn from(err: &RebalanceError) -> Self {
        Self::new(err.kind(), err.to_string(), err.is_retryable())
    }
}

impl From<RebalanceError> for JobError {
    fn from(err: RebalanceError) -> Self {
        Self::from(&err)
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncJob {
    pub job_id: String,
    pub status: JobStatus,
    /// Opaque to the queue; decoded by the handler
    pub payload: Value,
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// Attempts granted per manual retry
    #[serde(default)]
    pub attempt_budget: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<JobError>,
    #[serde(default)]
    pub dismissed_at: Option<DateTime<Utc>>,
}

impl AsyncJob {
    pub fn new(job_id: impl Into<String>, payload: Value, max_attempts: u32) -> Self {
        let now = Utc::now();
        let max_attempts = max_attempts.max(1);
        Self {
            job_id: job_id.into(),
            status: JobStatus::Queued,
            payload,
            attempt_count: 0,
            max_attempts,
            attempt_budget: max_attempts,
            created_at: now,
            updated_at: now,
            next_attempt_at: None,
            last_error_at: None,
            result: None,
            error: None,
            dismissed_at: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued && self.next_attempt_at.map_or(true, |at| at <= now)
    }

    pub fn attempts_left(&self) -> bool {
        self.attempt_count < self.max_attempts
    }

    /// Put a dead-lettered job back in the queue with a fresh attempt budget
    pub(crate) fn requeue(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Queued;
        self.max_attempts = self.attempt_count + self.attempt_budget.max(1);
        self.next_attempt_at = None;
        self.updated_at = now;
    }
}

/// What the handler sees for one attempt
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    /// 1-based, counted over the job's whole life
    pub attempt: u32,
    pub payload: Value,
}

/// Executes job payloads
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: &JobContext) -> std::result::Result<Value, JobError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub queued: usize,
    pub running: usize,
    pub done: usize,
    pub dead_letter: usize,
    pub dismissed: usize,
    pub total: usize,
}
