//! Submission provider boundary
//!
//! A provider turns a [`JobSpec`] into one handle per task and answers polls
//! for those handles. The retry and autotune layers only see this trait.

mod local;
mod slurm;

pub use local::{FunctionRegistry, LocalProvider, TaskFunction};
pub use slurm::{
    format_slurm_time, map_slurm_state, metrics_path, parse_memory_mb, parse_sacct_output,
    parse_slurm_time, parse_time_rss_kb, render_batch_script, sacct_record, squeue_state,
    SacctRecord, SlurmProvider,
};

use crate::environment::EnvironmentSpec;
use crate::error::{ParacoreError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Work for one task: a shell command or a registered function call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Command { command: String },
    Call(FunctionCall),
}

/// A registered function name plus its single argument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub function: String,
    pub argument: Value,
}

impl Payload {
    pub fn command(command: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
        }
    }

    /// Build a function call, serializing the argument to JSON
    pub fn call<T: Serialize + ?Sized>(function: impl Into<String>, argument: &T) -> Result<Self> {
        let function = function.into();
        let argument = serde_json::to_value(argument).map_err(|e| {
            ParacoreError::submission(format!(
                "argument for function '{}' is not serializable: {}",
                function, e
            ))
        })?;
        Ok(Self::Call(FunctionCall { function, argument }))
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command { command } => write!(f, "{}", command),
            Self::Call(call) => write!(f, "{}({})", call.function, call.argument),
        }
    }
}

/// Array range `0-(size-1)` with an optional `%N` cap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArraySpec {
    pub size: usize,
    pub parallelism: Option<u32>,
}

impl ArraySpec {
    /// Value for `--array`
    pub fn directive(&self) -> String {
        let last = self.size.saturating_sub(1);
        match self.parallelism {
            Some(cap) => format!("0-{}%{}", last, cap),
            None => format!("0-{}", last),
        }
    }
}

/// Provider-level job description
#[derive(Debug, Clone, Serialize)]
pub struct JobSpec {
    pub name: String,
    pub partition: Option<String>,
    pub account: Option<String>,
    pub qos: Option<String>,
    pub cpus_per_task: u32,
    pub mem_gb: u32,
    pub time_min: u32,
    /// Raw scheduler options, passed verbatim
    pub extra: BTreeMap<String, Value>,
    pub environment: EnvironmentSpec,
    /// One payload per task; more than one implies `array`
    pub tasks: Vec<Payload>,
    pub array: Option<ArraySpec>,
    /// Directory for generated scripts
    pub log_dir: PathBuf,
    /// Stdout pattern (`%j`, or `%A`/`%a` for arrays)
    pub stdout: PathBuf,
    /// Stderr pattern
    pub stderr: PathBuf,
    /// Collect peak memory inside the task
    pub measure_memory: bool,
}

/// Opaque provider reference to one physical task
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderHandle {
    /// Scheduler id; `123_4` for array tasks
    pub job_id: String,
    pub array_job_id: Option<String>,
    pub array_index: Option<usize>,
    /// Expanded stdout location
    pub stdout: PathBuf,
    /// Expanded stderr location
    pub stderr: PathBuf,
}

/// Scheduler-side state of one task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Unknown,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Measurements taken for one task
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetrics {
    /// Wall time in seconds
    pub duration_s: Option<f64>,
    /// Peak resident memory in MB; `None` when unavailable
    pub max_rss_mb: Option<f64>,
}

/// Result of a successful task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub value: Value,
    pub metrics: TaskMetrics,
}

/// Terminal outcome reported by a poll
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Success(TaskOutput),
    Failure(String),
}

/// Answer to a poll
#[derive(Debug, Clone, PartialEq)]
pub struct PollStatus {
    pub state: JobState,
    /// Present once the task is terminal
    pub outcome: Option<TaskOutcome>,
}

impl PollStatus {
    pub fn in_progress(state: JobState) -> Self {
        Self { state, outcome: None }
    }

    pub fn success(output: TaskOutput) -> Self {
        Self {
            state: JobState::Completed,
            outcome: Some(TaskOutcome::Success(output)),
        }
    }

    pub fn failure(state: JobState, message: impl Into<String>) -> Self {
        Self {
            state,
            outcome: Some(TaskOutcome::Failure(message.into())),
        }
    }
}

/// Scheduler back-end capability set
#[async_trait]
pub trait SubmissionProvider: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Submit a job; returns one handle per task, in task order
    async fn submit(&self, spec: &JobSpec) -> Result<Vec<ProviderHandle>>;

    /// Query a task's state and, once terminal, its outcome
    async fn poll(&self, handle: &ProviderHandle) -> Result<PollStatus>;

    /// Cancel a task
    async fn cancel(&self, handle: &ProviderHandle) -> Result<()>;

    /// Pre-flight partition check
    async fn validate_partition(&self, _partition: &str) -> Result<()> {
        Ok(())
    }
}

/// Interpret captured stdout as JSON, falling back to a string
pub(crate) fn parse_output_value(stdout: &str) -> Value {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(stdout.to_string()))
}

/// Last `lines` lines of a text, for error messages
pub(crate) fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
