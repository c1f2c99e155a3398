//! Slurm submission provider
//!
//! Renders `#SBATCH` scripts, submits them with `sbatch --parsable`, and
//! polls `squeue` with a `sacct` fallback once a job leaves the queue.

use super::{
    parse_output_value, tail, JobSpec, JobState, Payload, PollStatus, ProviderHandle,
    SubmissionProvider, TaskMetrics, TaskOutput,
};
use crate::error::{IoResultExt, ParacoreError, Result};
use crate::naming::expand_pattern;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;

/// Exit status the script uses when `env_setup` fails
const ENV_SETUP_EXIT: i32 = 97;

const SCHEDULER_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

static SCRIPT_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
struct SubmittedTask {
    call: bool,
    metrics: Option<PathBuf>,
}

/// Provider backed by the Slurm command-line tools
pub struct SlurmProvider {
    /// Command that runs a registered function: `<runner> <name> '<json>'`
    function_runner: Option<String>,
    tasks: Mutex<HashMap<String, SubmittedTask>>,
}

impl SlurmProvider {
    pub fn new() -> Self {
        Self {
            function_runner: None,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Set the command used to execute function payloads on compute nodes
    pub fn with_function_runner(mut self, runner: impl Into<String>) -> Self {
        self.function_runner = Some(runner.into());
        self
    }

    fn remember(&self, job_id: &str, task: SubmittedTask) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.insert(job_id.to_string(), task);
    }

    fn lookup(&self, job_id: &str) -> Option<SubmittedTask> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.get(job_id).cloned()
    }

    fn forget(&self, job_id: &str) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.remove(job_id);
    }

    async fn write_script(&self, spec: &JobSpec, script: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&spec.log_dir)
            .await
            .with_path(&spec.log_dir)?;

        let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
        let seq = SCRIPT_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = spec
            .log_dir
            .join(format!("{}_{}-{}-{}.sbatch", spec.name, stamp, std::process::id(), seq));
        tokio::fs::write(&path, script).await.with_path(&path)?;
        Ok(path)
    }

    async fn completed_output(&self, handle: &ProviderHandle, record: Option<&SacctRecord>) -> PollStatus {
        let task = self.lookup(&handle.job_id);
        let stdout = tokio::fs::read_to_string(&handle.stdout)
            .await
            .unwrap_or_default();
        let value = match &task {
            Some(task) if task.call => parse_output_value(&stdout),
            _ => Value::String(stdout),
        };

        let mut metrics = TaskMetrics::default();
        if let Some(path) = task.as_ref().and_then(|t| t.metrics.as_ref()) {
            if let Ok(report) = tokio::fs::read_to_string(path).await {
                metrics.max_rss_mb = parse_time_rss_kb(&report).map(|kb| kb as f64 / 1024.0);
                metrics.duration_s = parse_time_elapsed_s(&report);
            }
        }
        if let Some(record) = record {
            metrics.duration_s = metrics.duration_s.or(record.elapsed_s.map(|s| s as f64));
            metrics.max_rss_mb = metrics.max_rss_mb.or(record.max_rss_mb);
        }

        PollStatus::success(TaskOutput { value, metrics })
    }

    async fn failure_message(&self, handle: &ProviderHandle, record: Option<&SacctRecord>) -> String {
        let stderr = tokio::fs::read_to_string(&handle.stderr)
            .await
            .unwrap_or_default();
        let summary = match record {
            Some(r) => format!("{} (exit {})", r.raw_state, r.exit_code),
            None => "job failed".to_string(),
        };
        let stderr = tail(&stderr, 20);
        if stderr.is_empty() {
            summary
        } else {
            format!("{}: {}", summary, stderr)
        }
    }
}

impl Default for SlurmProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubmissionProvider for SlurmProvider {
    fn name(&self) -> &'static str {
        "slurm"
    }

    async fn submit(&self, spec: &JobSpec) -> Result<Vec<ProviderHandle>> {
        if spec.tasks.is_empty() {
            return Err(ParacoreError::submission("job has no tasks"));
        }

        let script = render_batch_script(spec, self.function_runner.as_deref())?;
        let script_path = self.write_script(spec, &script).await?;
        let script_arg = script_path.to_string_lossy().to_string();

        let output = run_tool("sbatch", &["--parsable", script_arg.as_str()]).await?;
        if !output.status.success() {
            return Err(ParacoreError::submission(format!(
                "sbatch rejected {}: {}",
                spec.name,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let job_id = parse_sbatch_output(&String::from_utf8_lossy(&output.stdout))?;
        tracing::info!("Submitted Slurm job {} ({} task(s))", job_id, spec.tasks.len());

        let mut handles = Vec::with_capacity(spec.tasks.len());
        if spec.array.is_some() {
            for (index, payload) in spec.tasks.iter().enumerate() {
                let task_id = format!("{}_{}", job_id, index);
                let handle = ProviderHandle {
                    stdout: expand_pattern(&spec.stdout, &task_id, Some(&job_id), Some(index)),
                    stderr: expand_pattern(&spec.stderr, &task_id, Some(&job_id), Some(index)),
                    job_id: task_id,
                    array_job_id: Some(job_id.clone()),
                    array_index: Some(index),
                };
                self.remember(&handle.job_id, submitted_task(spec, payload, &handle.job_id));
                handles.push(handle);
            }
        } else {
            let handle = ProviderHandle {
                stdout: expand_pattern(&spec.stdout, &job_id, None, None),
                stderr: expand_pattern(&spec.stderr, &job_id, None, None),
                job_id: job_id.clone(),
                array_job_id: None,
                array_index: None,
            };
            self.remember(&job_id, submitted_task(spec, &spec.tasks[0], &job_id));
            handles.push(handle);
        }

        Ok(handles)
    }

    async fn poll(&self, handle: &ProviderHandle) -> Result<PollStatus> {
        if let Some(state) = squeue_state(&handle.job_id).await? {
            if !state.is_terminal() {
                return Ok(PollStatus::in_progress(state));
            }
        }

        let record = sacct_record(&handle.job_id).await?;
        let state = record.as_ref().map(|r| r.state).unwrap_or(JobState::Unknown);
        tracing::debug!("Job {} state {}", handle.job_id, state);

        let status = match state {
            JobState::Completed => self.completed_output(handle, record.as_ref()).await,
            JobState::Failed | JobState::Cancelled => {
                PollStatus::failure(state, self.failure_message(handle, record.as_ref()).await)
            }
            other => return Ok(PollStatus::in_progress(other)),
        };
        self.forget(&handle.job_id);
        Ok(status)
    }

    async fn cancel(&self, handle: &ProviderHandle) -> Result<()> {
        let output = run_tool("scancel", &[handle.job_id.as_str()]).await?;
        if output.status.success() {
            tracing::info!("Cancelled Slurm job {}", handle.job_id);
            Ok(())
        } else {
            Err(ParacoreError::provider(format!(
                "scancel {} failed: {}",
                handle.job_id,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    async fn validate_partition(&self, partition: &str) -> Result<()> {
        let output = tokio::time::timeout(
            Duration::from_secs(10),
            Command::new("scontrol")
                .args(["show", "partition", partition])
                .output(),
        )
        .await
        .map_err(|_| ParacoreError::PartitionValidationError {
            partition: partition.to_string(),
            message: "timed out querying scontrol".to_string(),
        })?
        .map_err(|e| ParacoreError::PartitionValidationError {
            partition: partition.to_string(),
            message: format!("failed to run scontrol: {}", e),
        })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(ParacoreError::PartitionValidationError {
                partition: partition.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

fn submitted_task(spec: &JobSpec, payload: &Payload, job_id: &str) -> SubmittedTask {
    SubmittedTask {
        call: matches!(payload, Payload::Call(_)),
        metrics: spec
            .measure_memory
            .then(|| metrics_path(&spec.log_dir, &spec.name, job_id)),
    }
}

/// Where the in-task `/usr/bin/time -v` report for a task lands
pub fn metrics_path(log_dir: &Path, job_name: &str, job_id: &str) -> PathBuf {
    log_dir.join(format!("{}_{}.metrics", job_name, job_id))
}

async fn run_tool(program: &str, args: &[&str]) -> Result<Output> {
    tokio::time::timeout(SCHEDULER_TOOL_TIMEOUT, Command::new(program).args(args).output())
        .await
        .map_err(|_| ParacoreError::provider(format!("{} timed out", program)))?
        .map_err(|e| ParacoreError::provider(format!("failed to run {}: {}", program, e)))
}

/// State from `squeue`; `None` once the job has left the queue
pub async fn squeue_state(job_id: &str) -> Result<Option<JobState>> {
    let output = run_tool("squeue", &["-h", "-j", job_id, "-o", "%T"]).await?;
    if !output.status.success() {
        return Ok(None);
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(map_slurm_state))
}

/// Accounting record from `sacct`; `None` when the job is not known yet
pub async fn sacct_record(job_id: &str) -> Result<Option<SacctRecord>> {
    let output = run_tool(
        "sacct",
        &["-j", job_id, "-n", "-P", "-o", "State,ExitCode,Elapsed,MaxRSS"],
    )
    .await?;
    if !output.status.success() {
        return Ok(None);
    }
    Ok(parse_sacct_output(&String::from_utf8_lossy(&output.stdout)))
}

/// Map a Slurm state name onto [`JobState`]
pub fn map_slurm_state(raw: &str) -> JobState {
    let state = raw
        .split_whitespace()
        .next()
        .unwrap_or("")
        .trim_end_matches('+')
        .to_uppercase();
    match state.as_str() {
        "PENDING" | "CONFIGURING" | "REQUEUED" | "RESIZING" | "SUSPENDED" => JobState::Pending,
        "RUNNING" | "COMPLETING" => JobState::Running,
        "COMPLETED" => JobState::Completed,
        "FAILED" | "TIMEOUT" | "NODE_FAIL" | "OUT_OF_MEMORY" | "BOOT_FAIL" | "DEADLINE"
        | "PREEMPTED" => JobState::Failed,
        "CANCELLED" => JobState::Cancelled,
        _ => JobState::Unknown,
    }
}

/// One job's accounting summary
#[derive(Debug, Clone, PartialEq)]
pub struct SacctRecord {
    pub state: JobState,
    pub raw_state: String,
    pub exit_code: String,
    pub elapsed_s: Option<u64>,
    /// Largest `MaxRSS` over the job's steps, in MB
    pub max_rss_mb: Option<f64>,
}

/// Parse `sacct -n -P -o State,ExitCode,Elapsed,MaxRSS`.
///
/// The first line is the allocation; step lines only contribute `MaxRSS`.
pub fn parse_sacct_output(stdout: &str) -> Option<SacctRecord> {
    let mut lines = stdout.lines().map(str::trim).filter(|l| !l.is_empty());
    let first: Vec<&str> = lines.next()?.split('|').collect();
    let field = |fields: &[&str], i: usize| fields.get(i).copied().unwrap_or("").trim().to_string();

    let raw_state = field(&first, 0);
    let mut record = SacctRecord {
        state: map_slurm_state(&raw_state),
        raw_state,
        exit_code: field(&first, 1),
        elapsed_s: parse_slurm_time(&field(&first, 2)),
        max_rss_mb: parse_memory_mb(&field(&first, 3)),
    };

    for line in lines {
        let fields: Vec<&str> = line.split('|').collect();
        if let Some(mb) = parse_memory_mb(&field(&fields, 3)) {
            record.max_rss_mb = Some(record.max_rss_mb.map_or(mb, |cur| cur.max(mb)));
        }
    }

    Some(record)
}

fn parse_sbatch_output(stdout: &str) -> Result<String> {
    // --parsable prints "jobid" or "jobid;cluster"
    let id = stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .and_then(|l| l.split(';').next())
        .map(str::trim)
        .unwrap_or("");
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
        return Err(ParacoreError::submission(format!(
            "unexpected sbatch output: '{}'",
            stdout.trim()
        )));
    }
    Ok(id.to_string())
}

/// Render the batch script for a job
pub fn render_batch_script(spec: &JobSpec, function_runner: Option<&str>) -> Result<String> {
    let mut script = String::from("#!/bin/bash\n");

    script.push_str(&format!("#SBATCH --job-name={}\n", spec.name));
    script.push_str(&format!("#SBATCH --cpus-per-task={}\n", spec.cpus_per_task));
    script.push_str(&format!("#SBATCH --mem={}G\n", spec.mem_gb));
    script.push_str(&format!(
        "#SBATCH --time={}\n",
        format_slurm_time(u64::from(spec.time_min) * 60)
    ));

    if let Some(ref partition) = spec.partition {
        script.push_str(&format!("#SBATCH --partition={}\n", partition));
    }
    if let Some(ref account) = spec.account {
        script.push_str(&format!("#SBATCH --account={}\n", account));
    }
    if let Some(ref qos) = spec.qos {
        script.push_str(&format!("#SBATCH --qos={}\n", qos));
    }
    script.push_str(&format!("#SBATCH --output={}\n", spec.stdout.display()));
    script.push_str(&format!("#SBATCH --error={}\n", spec.stderr.display()));
    if let Some(array) = spec.array {
        script.push_str(&format!("#SBATCH --array={}\n", array.directive()));
    }
    let export = if spec.environment.inherits() { "ALL" } else { "NONE" };
    script.push_str(&format!("#SBATCH --export={}\n", export));

    for (key, value) in &spec.extra {
        if let Some(line) = extra_directive(key, value) {
            script.push_str(&line);
            script.push('\n');
        }
    }

    if !spec.environment.overlay.is_empty() {
        script.push_str("\n# Environment\n");
        for (key, value) in &spec.environment.overlay {
            script.push_str(&format!("export {}={}\n", key, shell_quote(value)));
        }
    }

    if let Some(ref setup) = spec.environment.env_setup {
        script.push_str("\n# Setup\n");
        script.push_str(&format!(
            "{{ {}\n}} 1>&2 || {{ echo \"paracore: env_setup failed\" >&2; exit {}; }}\n",
            setup, ENV_SETUP_EXIT
        ));
    }

    if spec.measure_memory {
        let prefix = format!("{}/{}_", spec.log_dir.display(), spec.name);
        script.push_str("\n# Metrics\n");
        script.push_str(
            "if [ -n \"$SLURM_ARRAY_TASK_ID\" ]; then PARACORE_TASK_ID=\"${SLURM_ARRAY_JOB_ID}_${SLURM_ARRAY_TASK_ID}\"; else PARACORE_TASK_ID=\"$SLURM_JOB_ID\"; fi\n",
        );
        script.push_str(&format!(
            "PARACORE_METRICS={}\"$PARACORE_TASK_ID\".metrics\n",
            shell_quote(&prefix)
        ));
    }

    let lines = spec
        .tasks
        .iter()
        .map(|payload| task_line(payload, spec.measure_memory, function_runner))
        .collect::<Result<Vec<_>>>()?;

    script.push_str("\n# Task\n");
    if spec.array.is_some() {
        script.push_str("case \"$SLURM_ARRAY_TASK_ID\" in\n");
        for (index, line) in lines.iter().enumerate() {
            script.push_str(&format!("  {})\n    {}\n    ;;\n", index, line));
        }
        script.push_str(
            "  *)\n    echo \"paracore: no task for index $SLURM_ARRAY_TASK_ID\" >&2\n    exit 98\n    ;;\nesac\n",
        );
    } else if let Some(line) = lines.first() {
        script.push_str(line);
        script.push('\n');
    }

    Ok(script)
}

fn task_line(payload: &Payload, measure: bool, function_runner: Option<&str>) -> Result<String> {
    let command = match payload {
        Payload::Command { command } => command.clone(),
        Payload::Call(call) => {
            let runner = function_runner.ok_or_else(|| {
                ParacoreError::submission(format!(
                    "function '{}' cannot run on Slurm without a function runner",
                    call.function
                ))
            })?;
            format!(
                "{} {} {}",
                runner,
                shell_quote(&call.function),
                shell_quote(&call.argument.to_string())
            )
        }
    };

    if measure {
        Ok(format!(
            "/usr/bin/time -v -o \"$PARACORE_METRICS\" bash -c {}",
            shell_quote(&command)
        ))
    } else {
        Ok(format!("eval {}", shell_quote(&command)))
    }
}

fn extra_directive(key: &str, value: &Value) -> Option<String> {
    let flag = key.trim_start_matches('-').replace('_', "-");
    match value {
        Value::Null | Value::Bool(false) => None,
        Value::Bool(true) => Some(format!("#SBATCH --{}", flag)),
        Value::String(s) => Some(format!("#SBATCH --{}={}", flag, s)),
        other => Some(format!("#SBATCH --{}={}", flag, other)),
    }
}

/// Single-quote a string for POSIX shells
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Format seconds as `HH:MM:SS` or `D-HH:MM:SS`
pub fn format_slurm_time(seconds: u64) -> String {
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if days > 0 {
        format!("{}-{:02}:{:02}:{:02}", days, hours, minutes, secs)
    } else {
        format!("{:02}:{:02}:{:02}", hours, minutes, secs)
    }
}

/// Parse `D-HH:MM:SS`, `HH:MM:SS` or `MM:SS` into seconds
pub fn parse_slurm_time(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (days, time_str) = match s.split_once('-') {
        Some((d, rest)) => (d.parse::<u64>().ok()?, rest),
        None => (0, s),
    };

    let parts: Vec<&str> = time_str.split(':').collect();
    let (hours, minutes, seconds) = match parts.len() {
        3 => (
            parts[0].parse::<u64>().ok()?,
            parts[1].parse::<u64>().ok()?,
            parts[2].split('.').next()?.parse::<u64>().ok()?,
        ),
        2 => (
            0,
            parts[0].parse::<u64>().ok()?,
            parts[1].split('.').next()?.parse::<u64>().ok()?,
        ),
        _ => return None,
    };

    Some(days * 86400 + hours * 3600 + minutes * 60 + seconds)
}

/// Parse a Slurm memory figure (`1234K`, `12M`, `1.5G`, bytes) into MB
pub fn parse_memory_mb(s: &str) -> Option<f64> {
    let s = s.trim().to_uppercase();
    if s.is_empty() {
        return None;
    }
    let (num_str, mb_per_unit) = if let Some(n) = s.strip_suffix('T') {
        (n, 1024.0 * 1024.0)
    } else if let Some(n) = s.strip_suffix('G') {
        (n, 1024.0)
    } else if let Some(n) = s.strip_suffix('M') {
        (n, 1.0)
    } else if let Some(n) = s.strip_suffix('K') {
        (n, 1.0 / 1024.0)
    } else {
        (s.as_str(), 1.0 / (1024.0 * 1024.0))
    };

    num_str.parse::<f64>().ok().map(|n| n * mb_per_unit)
}

/// Extract "Maximum resident set size" (kB) from `/usr/bin/time -v` output
pub fn parse_time_rss_kb(report: &str) -> Option<u64> {
    report
        .lines()
        .find(|l| l.contains("Maximum resident set size"))
        .and_then(|l| l.split_whitespace().last())
        .and_then(|v| v.parse::<u64>().ok())
}

/// Extract the wall clock time from `/usr/bin/time -v` output
pub fn parse_time_elapsed_s(report: &str) -> Option<f64> {
    let value = report
        .lines()
        .find(|l| l.contains("Elapsed (wall clock) time"))?
        .rsplit(": ")
        .next()?
        .trim();

    // h:mm:ss or m:ss.ss
    let parts: Vec<&str> = value.split(':').collect();
    let (hours, minutes, seconds) = match parts.len() {
        3 => (parts[0].parse::<f64>().ok()?, parts[1].parse::<f64>().ok()?, parts[2].parse::<f64>().ok()?),
        2 => (0.0, parts[0].parse::<f64>().ok()?, parts[1].parse::<f64>().ok()?),
        _ => return None,
    };
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}
