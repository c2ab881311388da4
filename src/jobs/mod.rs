//! Async job queue
//!
//! Jobs wrap an opaque payload with attempt counting, backoff and
//! dead-letter quarantine. Exactly one job runs at a time.

pub mod backoff;
pub mod job;
pub mod queue;
pub mod store;

pub use backoff::compute_backoff;
pub use job::{AsyncJob, JobContext, JobError, JobHandler, JobStats, JobStatus};
pub use queue::{JobQueue, QueueSettings};
pub use store::JobStore;
