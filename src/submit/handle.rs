//! Handle to one physical submission

use crate::error::{ParacoreError, Result};
use crate::provider::{JobState, ProviderHandle, SubmissionProvider, TaskOutcome, TaskOutput};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Consecutive failed polls tolerated before giving up on a handle
const MAX_POLL_ERRORS: u32 = 5;

/// One submitted unit of work.
///
/// A handle is terminal once [`JobHandle::result`] returns or
/// [`JobHandle::cancel`] succeeds. Resubmission always creates a new handle.
#[derive(Clone)]
pub struct JobHandle {
    provider: Arc<dyn SubmissionProvider>,
    raw: ProviderHandle,
    job_name: String,
    poll_interval: Duration,
    submitted_at: DateTime<Utc>,
}

impl JobHandle {
    pub fn new(
        provider: Arc<dyn SubmissionProvider>,
        raw: ProviderHandle,
        job_name: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            provider,
            raw,
            job_name: job_name.into(),
            poll_interval,
            submitted_at: Utc::now(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.raw.job_id
    }

    pub fn array_index(&self) -> Option<usize> {
        self.raw.array_index
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn stdout_path(&self) -> &Path {
        &self.raw.stdout
    }

    pub fn stderr_path(&self) -> &Path {
        &self.raw.stderr
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    /// The provider's own reference
    pub fn provider_handle(&self) -> &ProviderHandle {
        &self.raw
    }

    /// Current scheduler state
    pub async fn status(&self) -> Result<JobState> {
        Ok(self.provider.poll(&self.raw).await?.state)
    }

    /// Whether the task has reached a terminal state
    pub async fn done(&self) -> Result<bool> {
        Ok(self.status().await?.is_terminal())
    }

    /// Wait for the task's output and metrics.
    ///
    /// A failed task yields `TaskFailed`; exceeding `timeout` yields `Timeout`.
    pub async fn output(&self, timeout: Option<Duration>) -> Result<TaskOutput> {
        let started = Instant::now();
        let mut poll_errors = 0u32;

        loop {
            match self.provider.poll(&self.raw).await {
                Ok(status) => {
                    poll_errors = 0;
                    match status.outcome {
                        Some(TaskOutcome::Success(output)) => return Ok(output),
                        Some(TaskOutcome::Failure(message)) => {
                            return Err(ParacoreError::TaskFailed {
                                job_id: self.raw.job_id.clone(),
                                message,
                            })
                        }
                        None => {
                            tracing::debug!("Job {} is {}", self.raw.job_id, status.state);
                        }
                    }
                }
                Err(e) => {
                    poll_errors += 1;
                    tracing::warn!(
                        "Polling job {} failed ({}/{}): {}",
                        self.raw.job_id,
                        poll_errors,
                        MAX_POLL_ERRORS,
                        e
                    );
                    if poll_errors >= MAX_POLL_ERRORS {
                        return Err(e);
                    }
                }
            }

            let mut pause = self.poll_interval;
            if let Some(limit) = timeout {
                let waited = started.elapsed();
                if waited >= limit {
                    return Err(ParacoreError::Timeout {
                        job_id: self.raw.job_id.clone(),
                        waited,
                    });
                }
                pause = pause.min(limit - waited);
            }
            tokio::time::sleep(pause).await;
        }
    }

    /// Wait for the task's result value
    pub async fn result(&self, timeout: Option<Duration>) -> Result<Value> {
        Ok(self.output(timeout).await?.value)
    }

    /// Cancel the task
    pub async fn cancel(&self) -> Result<()> {
        self.provider.cancel(&self.raw).await
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("provider", &self.provider.name())
            .field("job_id", &self.raw.job_id)
            .field("array_index", &self.raw.array_index)
            .field("job_name", &self.job_name)
            .field("stdout", &self.raw.stdout)
            .finish()
    }
}
