//! Retry orchestration for logical tasks
//!
//! A logical task is one payload the caller wants a result for. Each physical
//! attempt is a fresh submission; failures are retried with exponential
//! backoff plus uniform jitter until the budget runs out.

use super::{JobHandle, JobTemplate, SubmissionAdapter};
use crate::error::{ParacoreError, Result};
use crate::provider::{Payload, TaskOutput};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Retry budget and backoff shape
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryPolicy {
    /// Resubmissions allowed after the first attempt
    pub retries: u32,
    pub backoff_s: f64,
    /// Upper bound of the uniform jitter added to each delay
    pub jitter_s: f64,
    pub retry_on_timeout: bool,
    /// Per-attempt result timeout
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 0,
            backoff_s: 30.0,
            jitter_s: 0.0,
            retry_on_timeout: false,
            attempt_timeout: None,
        }
    }
}

impl RetryPolicy {
    /// Delay before resubmitting after failed attempt number `failed` (0-based)
    pub fn delay_for<R: Rng + ?Sized>(&self, failed: u32, rng: &mut R) -> Duration {
        let base = self.backoff_s * 2f64.powi(failed.min(30) as i32);
        let jitter = if self.jitter_s > 0.0 {
            rng.gen_range(0.0..=self.jitter_s)
        } else {
            0.0
        };
        Duration::from_secs_f64((base + jitter).max(0.0))
    }
}

/// Retry state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Running,
    Success,
    FailedRetryable,
    FailedTerminal,
}

/// Why a physical attempt failed
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureCause {
    /// The provider rejected the job
    Submission(String),
    /// The job ran and failed
    Execution { job_id: String, message: String },
    /// Waiting for the result timed out
    Timeout { job_id: String, waited: Duration },
    /// The caller cancelled the logical task
    Cancelled,
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Submission(message) => write!(f, "submission failed: {}", message),
            Self::Execution { job_id, message } => write!(f, "job {} failed: {}", job_id, message),
            Self::Timeout { job_id, waited } => {
                write!(f, "job {} timed out after {:?}", job_id, waited)
            }
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// One failed physical attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptRecord {
    /// 1-based attempt number
    pub attempt: u32,
    /// Absent when submission itself failed
    pub job_id: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub cause: FailureCause,
    /// Backoff slept before the next attempt
    pub delay_before_next: Option<Duration>,
}

/// Per-logical-task retry bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryState {
    pub state: TaskState,
    pub attempts: u32,
    pub cumulative_backoff: Duration,
    pub last_cause: Option<FailureCause>,
    pub history: Vec<AttemptRecord>,
}

impl RetryState {
    pub fn new() -> Self {
        Self {
            state: TaskState::Pending,
            attempts: 0,
            cumulative_backoff: Duration::ZERO,
            last_cause: None,
            history: Vec::new(),
        }
    }

    fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.state = TaskState::Running;
        self.attempts
    }

    fn record_failure(&mut self, handle: Option<&JobHandle>, cause: FailureCause, retryable: bool) {
        self.state = if retryable {
            TaskState::FailedRetryable
        } else {
            TaskState::FailedTerminal
        };
        self.history.push(AttemptRecord {
            attempt: self.attempts,
            job_id: handle.map(|h| h.job_id().to_string()),
            submitted_at: handle.map(|h| h.submitted_at()),
            cause: cause.clone(),
            delay_before_next: None,
        });
        self.last_cause = Some(cause);
    }

    fn record_delay(&mut self, delay: Duration) {
        if let Some(last) = self.history.last_mut() {
            last.delay_before_next = Some(delay);
        }
        self.cumulative_backoff += delay;
    }

    fn exhausted(self) -> ParacoreError {
        ParacoreError::RetryExhausted {
            attempts: self.attempts,
            last_cause: self.last_cause.unwrap_or(FailureCause::Cancelled),
            history: self.history,
        }
    }

    fn cancelled(&mut self) -> ParacoreError {
        self.state = TaskState::FailedTerminal;
        self.last_cause = Some(FailureCause::Cancelled);
        ParacoreError::Cancelled {
            attempts: self.attempts,
        }
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

/// Supervises logical tasks through the submission adapter
#[derive(Clone)]
pub struct RetryOrchestrator {
    adapter: SubmissionAdapter,
}

impl RetryOrchestrator {
    pub fn new(adapter: SubmissionAdapter) -> Self {
        Self { adapter }
    }

    pub fn adapter(&self) -> &SubmissionAdapter {
        &self.adapter
    }

    /// Submit `payload` and wait for its result with retries
    pub async fn run(&self, template: &JobTemplate, payload: &Payload, policy: &RetryPolicy) -> Result<TaskOutput> {
        self.supervise(template, payload, policy, None, &CancellationToken::new(), None)
            .await
    }

    /// Drive one logical task to a terminal state.
    ///
    /// `first` is an already submitted handle for attempt one (array shards).
    /// Every new physical handle is published on `observer`.
    pub async fn supervise(
        &self,
        template: &JobTemplate,
        payload: &Payload,
        policy: &RetryPolicy,
        first: Option<JobHandle>,
        cancel: &CancellationToken,
        observer: Option<&watch::Sender<Option<JobHandle>>>,
    ) -> Result<TaskOutput> {
        let mut state = RetryState::new();
        let mut rng = StdRng::from_entropy();
        let mut first = first;

        loop {
            let attempt = state.begin_attempt();

            let handle = match first.take() {
                Some(handle) => handle,
                None => {
                    let submitted = tokio::select! {
                        _ = cancel.cancelled() => return Err(state.cancelled()),
                        submitted = self.adapter.submit(template, payload) => submitted,
                    };
                    match submitted {
                        Ok(handle) => handle,
                        Err(e) if e.is_config_error() => {
                            state.state = TaskState::FailedTerminal;
                            return Err(e);
                        }
                        Err(e) => {
                            state.record_failure(None, FailureCause::Submission(e.to_string()), true);
                            if !self.backoff(&mut state, policy, &mut rng, cancel, attempt).await? {
                                return Err(state.exhausted());
                            }
                            continue;
                        }
                    }
                }
            };

            if let Some(observer) = observer {
                observer.send_replace(Some(handle.clone()));
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(e) = handle.cancel().await {
                        tracing::warn!("Failed to cancel job {}: {}", handle.job_id(), e);
                    }
                    return Err(state.cancelled());
                }
                outcome = handle.output(policy.attempt_timeout) => outcome,
            };

            // `abandoned`: the job may still be queued or running
            let (cause, retryable, abandoned, error) = match outcome {
                Ok(output) => {
                    state.state = TaskState::Success;
                    if attempt > 1 {
                        tracing::info!("Job {} succeeded on attempt {}", handle.job_id(), attempt);
                    }
                    return Ok(output);
                }
                Err(e) if e.is_config_error() => {
                    state.state = TaskState::FailedTerminal;
                    return Err(e);
                }
                Err(ParacoreError::Timeout { job_id, waited }) => (
                    FailureCause::Timeout {
                        job_id: job_id.clone(),
                        waited,
                    },
                    policy.retry_on_timeout,
                    true,
                    ParacoreError::Timeout { job_id, waited },
                ),
                Err(ParacoreError::TaskFailed { job_id, message }) => (
                    FailureCause::Execution {
                        job_id: job_id.clone(),
                        message: message.clone(),
                    },
                    true,
                    false,
                    ParacoreError::TaskFailed { job_id, message },
                ),
                Err(e) => (
                    FailureCause::Execution {
                        job_id: handle.job_id().to_string(),
                        message: e.to_string(),
                    },
                    true,
                    true,
                    e,
                ),
            };

            state.record_failure(Some(&handle), cause, retryable);
            if !retryable {
                return Err(error.with_context(format!(
                    "attempt {} of {}",
                    attempt,
                    policy.retries + 1
                )));
            }
            if abandoned {
                if let Err(e) = handle.cancel().await {
                    tracing::warn!("Failed to cancel abandoned job {}: {}", handle.job_id(), e);
                }
            }
            if !self.backoff(&mut state, policy, &mut rng, cancel, attempt).await? {
                return Err(state.exhausted());
            }
        }
    }

    /// Sleep before the next attempt; `false` when the budget is spent
    async fn backoff(
        &self,
        state: &mut RetryState,
        policy: &RetryPolicy,
        rng: &mut StdRng,
        cancel: &CancellationToken,
        attempt: u32,
    ) -> Result<bool> {
        if attempt > policy.retries {
            state.state = TaskState::FailedTerminal;
            return Ok(false);
        }

        let delay = policy.delay_for(attempt - 1, rng);
        state.record_delay(delay);
        tracing::warn!(
            "Attempt {}/{} failed: {}. Retrying in {:?}",
            attempt,
            policy.retries + 1,
            state
                .last_cause
                .as_ref()
                .map(|c| c.to_string())
                .unwrap_or_default(),
            delay
        );

        tokio::select! {
            _ = cancel.cancelled() => Err(state.cancelled()),
            _ = tokio::time::sleep(delay) => Ok(true),
        }
    }

    /// Supervise a logical task in the background
    pub fn spawn(
        &self,
        template: Arc<JobTemplate>,
        payload: Payload,
        policy: RetryPolicy,
        first: Option<JobHandle>,
    ) -> LogicalTask {
        let cancel = CancellationToken::new();
        let (tx, rx) = watch::channel(first.clone());
        let orchestrator = self.clone();
        let token = cancel.clone();

        let join = tokio::spawn(async move {
            orchestrator
                .supervise(&template, &payload, &policy, first, &token, Some(&tx))
                .await
        });

        LogicalTask {
            cancel,
            current: rx,
            join,
        }
    }
}

/// A background logical task
#[derive(Debug)]
pub struct LogicalTask {
    cancel: CancellationToken,
    current: watch::Receiver<Option<JobHandle>>,
    join: JoinHandle<Result<TaskOutput>>,
}

impl LogicalTask {
    /// Physical handle of the current attempt, once submitted
    pub fn current_handle(&self) -> Option<JobHandle> {
        self.current.borrow().clone()
    }

    /// Wait until the first physical handle exists
    pub async fn first_handle(&mut self) -> Result<JobHandle> {
        loop {
            let current = self.current.borrow_and_update().clone();
            if let Some(handle) = current {
                return Ok(handle);
            }
            if self.current.changed().await.is_err() {
                // supervisor finished without ever submitting
                let current = self.current.borrow().clone();
                return match current {
                    Some(handle) => Ok(handle),
                    None => Err(self.join_error().await),
                };
            }
        }
    }

    async fn join_error(&mut self) -> ParacoreError {
        match (&mut self.join).await {
            Ok(Err(e)) => e,
            Ok(Ok(_)) => ParacoreError::Internal("task finished without a handle".into()),
            Err(e) => ParacoreError::Internal(format!("supervisor failed: {}", e)),
        }
    }

    /// Cancel the logical task and its current physical handle
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this task once triggered
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the final result
    pub async fn wait(self) -> Result<TaskOutput> {
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(ParacoreError::Internal(format!("supervisor failed: {}", e))),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{CallOverrides, ConfigResolver};
    use crate::environment::{EnvironmentComposer, MergeMode, ParentEnvironment};
    use crate::provider::{
        JobSpec, JobState, PollStatus, ProviderHandle, SubmissionProvider, TaskMetrics,
    };
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Scripted outcome of one physical attempt
    #[derive(Debug, Clone)]
    pub(crate) enum Script {
        RejectSubmit,
        Fail,
        Succeed(Value),
        Hang,
        /// Succeeds after `polls` polls without reporting a duration
        Slow { polls: u32, max_rss_mb: Option<f64> },
    }

    /// Provider whose attempts follow a script; records submission times
    #[derive(Default)]
    pub(crate) struct Scripted {
        script: Mutex<VecDeque<Script>>,
        outcomes: Mutex<HashMap<String, Script>>,
        pub(crate) submitted_at: Mutex<Vec<tokio::time::Instant>>,
        pub(crate) cancelled: Mutex<Vec<String>>,
        next: Mutex<u32>,
        polls: Mutex<HashMap<String, u32>>,
        /// Slow jobs polled at least once and not yet finished
        in_flight: Mutex<HashSet<String>>,
        pub(crate) peak_in_flight: Mutex<usize>,
    }

    impl Scripted {
        pub(crate) fn new(script: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                ..Default::default()
            })
        }

        fn next_outcome(&self) -> Script {
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Script::Fail)
        }
    }

    #[async_trait]
    impl SubmissionProvider for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn submit(&self, spec: &JobSpec) -> Result<Vec<ProviderHandle>> {
            self.submitted_at.lock().unwrap().push(tokio::time::Instant::now());
            let mut handles = Vec::new();
            for (i, _) in spec.tasks.iter().enumerate() {
                let outcome = self.next_outcome();
                if matches!(outcome, Script::RejectSubmit) {
                    return Err(ParacoreError::submission("sbatch: error: invalid partition"));
                }
                let id = {
                    let mut next = self.next.lock().unwrap();
                    *next += 1;
                    next.to_string()
                };
                self.outcomes.lock().unwrap().insert(id.clone(), outcome);
                handles.push(ProviderHandle {
                    job_id: id,
                    array_job_id: None,
                    array_index: spec.array.map(|_| i),
                    stdout: PathBuf::from("out"),
                    stderr: PathBuf::from("err"),
                });
            }
            Ok(handles)
        }

        async fn poll(&self, handle: &ProviderHandle) -> Result<PollStatus> {
            let outcome = self.outcomes.lock().unwrap().get(&handle.job_id).cloned();
            Ok(match outcome {
                Some(Script::Succeed(value)) => PollStatus::success(TaskOutput {
                    value,
                    metrics: TaskMetrics {
                        duration_s: Some(10.0),
                        max_rss_mb: None,
                    },
                }),
                Some(Script::Hang) => PollStatus::in_progress(JobState::Running),
                Some(Script::Slow { polls, max_rss_mb }) => {
                    let seen = {
                        let mut counts = self.polls.lock().unwrap();
                        let count = counts.entry(handle.job_id.clone()).or_insert(0);
                        *count += 1;
                        *count
                    };
                    let mut in_flight = self.in_flight.lock().unwrap();
                    if seen < polls {
                        in_flight.insert(handle.job_id.clone());
                        let mut peak = self.peak_in_flight.lock().unwrap();
                        *peak = (*peak).max(in_flight.len());
                        PollStatus::in_progress(JobState::Running)
                    } else {
                        in_flight.remove(&handle.job_id);
                        PollStatus::success(TaskOutput {
                            value: Value::Null,
                            metrics: TaskMetrics {
                                duration_s: None,
                                max_rss_mb,
                            },
                        })
                    }
                }
                _ => PollStatus::failure(JobState::Failed, "exit code 1"),
            })
        }

        async fn cancel(&self, handle: &ProviderHandle) -> Result<()> {
            self.cancelled.lock().unwrap().push(handle.job_id.clone());
            Ok(())
        }
    }

    pub(crate) fn template() -> JobTemplate {
        let overrides = CallOverrides {
            poll_interval_s: Some(0.5),
            ..Default::default()
        };
        JobTemplate {
            config: Arc::new(ConfigResolver::builtin().resolve(None, &overrides).unwrap()),
            job_name: "t".into(),
            environment: EnvironmentComposer::compose(
                &ParentEnvironment::empty(),
                MergeMode::Inherit,
                &BTreeMap::new(),
                None,
            ),
            measure_memory: false,
        }
    }

    fn policy(retries: u32, backoff_s: f64) -> RetryPolicy {
        RetryPolicy {
            retries,
            backoff_s,
            ..Default::default()
        }
    }

    fn orchestrator(provider: Arc<Scripted>) -> RetryOrchestrator {
        RetryOrchestrator::new(SubmissionAdapter::new(provider))
    }

    #[test]
    fn test_delay_doubles_and_jitter_is_bounded() {
        let mut rng = StdRng::seed_from_u64(1);
        let p = policy(3, 2.0);
        let delays: Vec<_> = (0..3).map(|i| p.delay_for(i, &mut rng)).collect();
        assert_eq!(
            delays,
            vec![Duration::from_secs(2), Duration::from_secs(4), Duration::from_secs(8)]
        );

        let jittered = RetryPolicy {
            jitter_s: 1.5,
            ..p
        };
        for _ in 0..100 {
            let d = jittered.delay_for(0, &mut rng);
            assert!(d >= Duration::from_secs(2) && d <= Duration::from_secs_f64(3.5));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delays_between_submissions() {
        let provider = Scripted::new(vec![
            Script::Fail,
            Script::Fail,
            Script::Fail,
            Script::Succeed(Value::from("ok")),
        ]);
        let output = orchestrator(provider.clone())
            .run(&template(), &Payload::command("x"), &policy(3, 2.0))
            .await
            .unwrap();
        assert_eq!(output.value, Value::from("ok"));

        let times = provider.submitted_at.lock().unwrap();
        assert_eq!(times.len(), 4);
        let gaps: Vec<u64> = times
            .windows(2)
            .map(|w| (w[1] - w[0]).as_secs())
            .collect();
        assert_eq!(gaps, vec![2, 4, 8]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_after_retries_plus_one_attempts() {
        let provider = Scripted::new(vec![Script::Fail, Script::RejectSubmit, Script::Fail]);
        let err = orchestrator(provider.clone())
            .run(&template(), &Payload::command("x"), &policy(2, 1.0))
            .await
            .unwrap_err();
        match err {
            ParacoreError::RetryExhausted {
                attempts,
                last_cause,
                history,
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(history.len(), 3);
                assert!(matches!(history[1].cause, FailureCause::Submission(_)));
                assert!(history[1].job_id.is_none());
                assert!(matches!(last_cause, FailureCause::Execution { .. }));
                assert_eq!(history[2].delay_before_next, None);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(provider.submitted_at.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_not_retried_by_default() {
        let provider = Scripted::new(vec![Script::Hang, Script::Succeed(Value::Null)]);
        let p = RetryPolicy {
            attempt_timeout: Some(Duration::from_secs(30)),
            ..policy(2, 1.0)
        };
        let err = orchestrator(provider.clone())
            .run(&template(), &Payload::command("x"), &p)
            .await
            .unwrap_err();
        assert!(matches!(err.root(), ParacoreError::Timeout { .. }));
        assert_eq!(provider.submitted_at.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_retried_when_enabled() {
        let provider = Scripted::new(vec![Script::Hang, Script::Succeed(Value::from(1))]);
        let p = RetryPolicy {
            attempt_timeout: Some(Duration::from_secs(30)),
            retry_on_timeout: true,
            ..policy(2, 1.0)
        };
        let output = orchestrator(provider.clone())
            .run(&template(), &Payload::command("x"), &p)
            .await
            .unwrap();
        assert_eq!(output.value, Value::from(1));
        // the timed-out job is cancelled before the resubmission
        assert_eq!(*provider.cancelled.lock().unwrap(), vec!["1".to_string()]);
        assert_eq!(provider.submitted_at.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_job_not_cancelled_before_retry() {
        let provider = Scripted::new(vec![Script::Fail, Script::Succeed(Value::Null)]);
        orchestrator(provider.clone())
            .run(&template(), &Payload::command("x"), &policy(1, 1.0))
            .await
            .unwrap();
        assert!(provider.cancelled.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_errors_never_retried() {
        struct Invalid;

        #[async_trait]
        impl SubmissionProvider for Invalid {
            fn name(&self) -> &'static str {
                "invalid"
            }
            async fn submit(&self, _spec: &JobSpec) -> Result<Vec<ProviderHandle>> {
                Err(ParacoreError::config("bad resources"))
            }
            async fn poll(&self, _handle: &ProviderHandle) -> Result<PollStatus> {
                unreachable!()
            }
            async fn cancel(&self, _handle: &ProviderHandle) -> Result<()> {
                Ok(())
            }
        }

        let orchestrator = RetryOrchestrator::new(SubmissionAdapter::new(Arc::new(Invalid)));
        let err = orchestrator
            .run(&template(), &Payload::command("x"), &policy(5, 1.0))
            .await
            .unwrap_err();
        assert!(err.is_config_error());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_current_handle() {
        let provider = Scripted::new(vec![Script::Hang]);
        let mut task = orchestrator(provider.clone()).spawn(
            Arc::new(template()),
            Payload::command("x"),
            policy(3, 1.0),
            None,
        );
        let handle = task.first_handle().await.unwrap();
        task.cancel();
        let err = task.wait().await.unwrap_err();
        assert!(matches!(err, ParacoreError::Cancelled { attempts: 1 }));
        assert_eq!(*provider.cancelled.lock().unwrap(), vec![handle.job_id().to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prior_handle_used_for_first_attempt() {
        let provider = Scripted::new(vec![Script::Succeed(Value::from("shard"))]);
        let orchestrator = orchestrator(provider.clone());
        let template = Arc::new(template());
        let first = orchestrator
            .adapter()
            .submit(&template, &Payload::command("x"))
            .await
            .unwrap();
        let task = orchestrator.spawn(template, Payload::command("x"), policy(1, 1.0), Some(first));
        assert_eq!(task.wait().await.unwrap().value, Value::from("shard"));
        assert_eq!(provider.submitted_at.lock().unwrap().len(), 1);
    }
}
