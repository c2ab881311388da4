//! JSON snapshot of the job list

use super::job::{AsyncJob, JobStatus};
use crate::error::{RebalanceError, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct JobStore {
    path: PathBuf,
}

impl JobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot. A missing file is an empty queue; jobs caught
    /// `running` by a crash go back to `queued`.
    pub async fn load(&self) -> Result<Vec<AsyncJob>> {
        let body = match tokio::fs::read_to_string(&self.path).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RebalanceError::Io(e)),
        };
        let mut jobs: Vec<AsyncJob> = serde_json::from_str(&body)?;

        let now = Utc::now();
        for job in jobs.iter_mut().filter(|j| j.status == JobStatus::Running) {
            warn!(job_id = %job.job_id, attempt = job.attempt_count, "Re-queueing job interrupted mid-run");
            job.status = JobStatus::Queued;
            job.next_attempt_at = None;
            job.updated_at = now;
            if job.attempt_count >= job.max_attempts {
                job.max_attempts = job.attempt_count + 1;
            }
        }
        Ok(jobs)
    }

    /// Write atomically via a temp file and rename
    pub async fn save(&self, jobs: &[AsyncJob]) -> Result<()> {
        let Some(parent) = self.path.parent() else {
            return Err(RebalanceError::Internal("invalid job store path".to_string()));
        };
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(jobs)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
