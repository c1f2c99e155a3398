//! Local subprocess provider
//!
//! Runs each task on this machine, either as `/bin/sh -c` or as a registered
//! in-process function. Array parallelism is enforced with a semaphore per
//! job, and peak memory is sampled from the process tree with `sysinfo`.

use super::{
    tail, FunctionCall, JobSpec, JobState, Payload, PollStatus, ProviderHandle, SubmissionProvider,
    TaskMetrics, TaskOutcome, TaskOutput,
};
use crate::environment::EnvironmentSpec;
use crate::error::{IoResultExt, ParacoreError, Result};
use crate::naming::expand_pattern;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use sysinfo::{Pid, Process, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;

const SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

/// An in-process task function
pub type TaskFunction = Arc<dyn Fn(Value) -> std::result::Result<Value, String> + Send + Sync>;

/// Named functions available to `Payload::Call`
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: Arc<RwLock<HashMap<String, TaskFunction>>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `function` under `name`, replacing any previous entry
    pub fn register<F>(&self, name: impl Into<String>, function: F)
    where
        F: Fn(Value) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        let mut functions = self.functions.write().unwrap_or_else(|e| e.into_inner());
        functions.insert(name.into(), Arc::new(function));
    }

    pub fn get(&self, name: &str) -> Option<TaskFunction> {
        let functions = self.functions.read().unwrap_or_else(|e| e.into_inner());
        functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let functions = self.functions.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<&String> = functions.keys().collect();
        names.sort();
        f.debug_struct("FunctionRegistry").field("functions", &names).finish()
    }
}

#[derive(Debug)]
struct TaskSlot {
    state: JobState,
    outcome: Option<TaskOutcome>,
}

struct LocalTask {
    slot: Arc<Mutex<TaskSlot>>,
    abort: AbortHandle,
}

/// Provider that runs jobs on the local machine
pub struct LocalProvider {
    registry: FunctionRegistry,
    tasks: Mutex<HashMap<String, LocalTask>>,
    next_id: AtomicU64,
}

impl LocalProvider {
    pub fn new() -> Self {
        Self::with_registry(FunctionRegistry::new())
    }

    pub fn with_registry(registry: FunctionRegistry) -> Self {
        Self {
            registry,
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    fn slot(&self, job_id: &str) -> Option<(Arc<Mutex<TaskSlot>>, AbortHandle)> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.get(job_id).map(|t| (t.slot.clone(), t.abort.clone()))
    }
}

impl Default for LocalProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubmissionProvider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn submit(&self, spec: &JobSpec) -> Result<Vec<ProviderHandle>> {
        if spec.tasks.is_empty() {
            return Err(ParacoreError::submission("job has no tasks"));
        }
        for payload in &spec.tasks {
            if let Payload::Call(call) = payload {
                if !self.registry.contains(&call.function) {
                    return Err(ParacoreError::submission(format!(
                        "function '{}' is not registered",
                        call.function
                    )));
                }
            }
        }
        tokio::fs::create_dir_all(&spec.log_dir)
            .await
            .with_path(&spec.log_dir)?;

        let job_id = format!("local-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let permits = spec
            .array
            .and_then(|a| a.parallelism)
            .map(|p| p as usize)
            .unwrap_or(spec.tasks.len())
            .max(1);
        let semaphore = Arc::new(Semaphore::new(permits));
        let environment = Arc::new(spec.environment.clone());

        let mut handles = Vec::with_capacity(spec.tasks.len());
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for (index, payload) in spec.tasks.iter().enumerate() {
            let handle = if spec.array.is_some() {
                let task_id = format!("{}_{}", job_id, index);
                ProviderHandle {
                    stdout: expand_pattern(&spec.stdout, &task_id, Some(&job_id), Some(index)),
                    stderr: expand_pattern(&spec.stderr, &task_id, Some(&job_id), Some(index)),
                    job_id: task_id,
                    array_job_id: Some(job_id.clone()),
                    array_index: Some(index),
                }
            } else {
                ProviderHandle {
                    stdout: expand_pattern(&spec.stdout, &job_id, None, None),
                    stderr: expand_pattern(&spec.stderr, &job_id, None, None),
                    job_id: job_id.clone(),
                    array_job_id: None,
                    array_index: None,
                }
            };

            let slot = Arc::new(Mutex::new(TaskSlot {
                state: JobState::Pending,
                outcome: None,
            }));
            let run = TaskRun {
                payload: payload.clone(),
                environment: environment.clone(),
                stdout: handle.stdout.clone(),
                stderr: handle.stderr.clone(),
                measure_memory: spec.measure_memory,
                registry: self.registry.clone(),
            };
            let join = tokio::spawn(run_task(run, slot.clone(), semaphore.clone()));
            tasks.insert(
                handle.job_id.clone(),
                LocalTask {
                    slot,
                    abort: join.abort_handle(),
                },
            );
            handles.push(handle);
        }

        tracing::info!("Started local job {} ({} task(s), {} at a time)", job_id, spec.tasks.len(), permits);
        Ok(handles)
    }

    /// Jobs are forgotten once a poll has reported their outcome
    async fn poll(&self, handle: &ProviderHandle) -> Result<PollStatus> {
        let (slot, _) = self
            .slot(&handle.job_id)
            .ok_or_else(|| ParacoreError::provider(format!("unknown local job {}", handle.job_id)))?;
        let status = {
            let slot = slot.lock().unwrap_or_else(|e| e.into_inner());
            PollStatus {
                state: slot.state,
                outcome: slot.outcome.clone(),
            }
        };
        if status.outcome.is_some() {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.remove(&handle.job_id);
        }
        Ok(status)
    }

    async fn cancel(&self, handle: &ProviderHandle) -> Result<()> {
        let (slot, abort) = self
            .slot(&handle.job_id)
            .ok_or_else(|| ParacoreError::provider(format!("unknown local job {}", handle.job_id)))?;
        abort.abort();
        let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
        if !slot.state.is_terminal() {
            slot.state = JobState::Cancelled;
            slot.outcome = Some(TaskOutcome::Failure("cancelled".to_string()));
        }
        tracing::info!("Cancelled local job {}", handle.job_id);
        Ok(())
    }
}

struct TaskRun {
    payload: Payload,
    environment: Arc<EnvironmentSpec>,
    stdout: PathBuf,
    stderr: PathBuf,
    measure_memory: bool,
    registry: FunctionRegistry,
}

async fn run_task(run: TaskRun, slot: Arc<Mutex<TaskSlot>>, permits: Arc<Semaphore>) {
    let Ok(_permit) = permits.acquire_owned().await else {
        return;
    };
    {
        let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
        if slot.state.is_terminal() {
            return;
        }
        slot.state = JobState::Running;
    }

    let status = match &run.payload {
        Payload::Command { command } => match run_command(command, &run).await {
            Ok(status) => status,
            Err(e) => PollStatus::failure(JobState::Failed, e.to_string()),
        },
        Payload::Call(call) => run_function(call, &run.registry).await,
    };

    let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
    if !slot.state.is_terminal() {
        slot.state = status.state;
        slot.outcome = status.outcome;
    }
}

fn shell_script(command: &str, env_setup: Option<&str>) -> String {
    match env_setup {
        Some(setup) => format!(
            "{{ {}\n}} 1>&2 || {{ echo \"paracore: env_setup failed\" >&2; exit 97; }}\n{}",
            setup, command
        ),
        None => command.to_string(),
    }
}

async fn run_command(command: &str, run: &TaskRun) -> Result<PollStatus> {
    let out_file = std::fs::File::create(&run.stdout).with_path(&run.stdout)?;
    let err_file = std::fs::File::create(&run.stderr).with_path(&run.stderr)?;

    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c")
        .arg(shell_script(command, run.environment.env_setup.as_deref()))
        .env_clear()
        .envs(&run.environment.variables)
        .stdin(std::process::Stdio::null())
        .stdout(out_file)
        .stderr(err_file)
        .kill_on_drop(true);

    let started = Instant::now();
    let mut child = cmd.spawn().with_path("/bin/sh")?;
    let mut sampler = if run.measure_memory {
        child.id().map(MemorySampler::new)
    } else {
        None
    };
    if let Some(sampler) = sampler.as_mut() {
        sampler.sample();
    }

    let status = loop {
        tokio::select! {
            status = child.wait() => break status.with_path("/bin/sh")?,
            _ = tokio::time::sleep(SAMPLE_INTERVAL), if sampler.is_some() => {
                if let Some(sampler) = sampler.as_mut() {
                    sampler.sample();
                }
            }
        }
    };
    let duration_s = started.elapsed().as_secs_f64();

    if !status.success() {
        let stderr = tokio::fs::read_to_string(&run.stderr).await.unwrap_or_default();
        let code = status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let stderr = tail(&stderr, 20);
        let message = if stderr.is_empty() {
            format!("command exited with {}", code)
        } else {
            format!("command exited with {}: {}", code, stderr)
        };
        return Ok(PollStatus::failure(JobState::Failed, message));
    }

    let stdout = tokio::fs::read_to_string(&run.stdout)
        .await
        .with_path(&run.stdout)?;
    Ok(PollStatus::success(TaskOutput {
        value: Value::String(stdout),
        metrics: TaskMetrics {
            duration_s: Some(duration_s),
            max_rss_mb: sampler.and_then(|s| s.peak_mb()),
        },
    }))
}

async fn run_function(call: &FunctionCall, registry: &FunctionRegistry) -> PollStatus {
    let Some(function) = registry.get(&call.function) else {
        return PollStatus::failure(
            JobState::Failed,
            format!("function '{}' is not registered", call.function),
        );
    };
    let argument = call.argument.clone();
    let started = Instant::now();
    let result = tokio::task::spawn_blocking(move || function(argument)).await;
    let duration_s = started.elapsed().as_secs_f64();

    match result {
        Ok(Ok(value)) => PollStatus::success(TaskOutput {
            value,
            metrics: TaskMetrics {
                duration_s: Some(duration_s),
                max_rss_mb: None,
            },
        }),
        Ok(Err(message)) => PollStatus::failure(JobState::Failed, message),
        Err(e) => PollStatus::failure(JobState::Failed, format!("function '{}' panicked: {}", call.function, e)),
    }
}

/// Tracks peak resident memory of a process tree
struct MemorySampler {
    system: System,
    root: Pid,
    peak_bytes: u64,
}

impl MemorySampler {
    fn new(pid: u32) -> Self {
        Self {
            system: System::new(),
            root: Pid::from_u32(pid),
            peak_bytes: 0,
        }
    }

    fn sample(&mut self) {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            ProcessRefreshKind::new().with_memory(),
        );
        let processes = self.system.processes();
        let total: u64 = processes
            .values()
            .filter(|p| descends_from(processes, p.pid(), self.root))
            .map(|p| p.memory())
            .sum();
        self.peak_bytes = self.peak_bytes.max(total);
    }

    /// Peak in MB; `None` when no sample saw the process
    fn peak_mb(&self) -> Option<f64> {
        (self.peak_bytes > 0).then(|| self.peak_bytes as f64 / (1024.0 * 1024.0))
    }
}

fn descends_from(processes: &HashMap<Pid, Process>, pid: Pid, root: Pid) -> bool {
    let mut current = Some(pid);
    for _ in 0..64 {
        match current {
            Some(p) if p == root => return true,
            Some(p) => current = processes.get(&p).and_then(Process::parent),
            None => return false,
        }
    }
    false
}
