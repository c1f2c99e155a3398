//! Command-line settings for Paracore
//!
//! Defines the CLI arguments and how they map onto call-site overrides.

use super::resolver::CallOverrides;
use crate::environment::MergeMode;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Paracore - Slurm job submission made easy
#[derive(Parser, Debug, Clone)]
#[command(name = "paracore")]
#[command(author = "Paracore Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Slurm job submission with retries and pilot-based autotuning")]
#[command(long_about = r#"
Paracore submits shell commands to a Slurm cluster from layered YAML profiles.

Features:
  - Layered configuration (built-in, ~/.paracore.yaml, ./paracore.yaml, flags)
  - Array submission with a parallelism cap
  - Retries with exponential backoff and jitter
  - Pilot sampling that recommends time, memory and parallelism

Examples:
  paracore run "python script.py" --time 60 --memory 16
  paracore batch commands.txt --array-parallelism 20 --wait
  paracore autotune commands.txt --sample-size 10 --export-shell
  cat commands.txt | paracore batch - --wait
"#)]
pub struct CliArgs {
    /// Project profile path (replaces ./paracore.yaml)
    #[arg(long, global = true, env = "PARACORE_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Cluster profile to use (default: active_cluster)
    #[arg(long, global = true, value_name = "NAME")]
    pub cluster: Option<String>,

    /// Submission backend
    #[arg(long, global = true, value_enum, default_value = "slurm")]
    pub backend: Backend,

    /// Directory for batch scripts and job logs
    #[arg(long, global = true, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// Verbose output (can be repeated: -v, -vv, -vvv)
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Subcommands
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Submit a single job
    #[command(name = "run")]
    Run {
        /// Command to run
        command: String,

        #[command(flatten)]
        resources: ResourceArgs,

        #[command(flatten)]
        retry: RetryArgs,

        #[command(flatten)]
        wait: WaitArgs,
    },

    /// Submit an array job from a file of commands
    #[command(name = "batch")]
    Batch {
        /// File with commands (one per line, use - for stdin)
        file: String,

        #[command(flatten)]
        resources: ResourceArgs,

        /// Max concurrent array tasks
        #[arg(long, value_name = "NUM")]
        array_parallelism: Option<u32>,

        /// Max logical tasks supervised at once while waiting
        #[arg(long, value_name = "NUM")]
        concurrency: Option<usize>,

        #[command(flatten)]
        retry: RetryArgs,

        #[command(flatten)]
        wait: WaitArgs,

        /// Disable the progress bar
        #[arg(long)]
        no_progress: bool,
    },

    /// Run pilot jobs to determine resources for the full run
    #[command(name = "autotune")]
    Autotune {
        /// File with commands (one per line, use - for stdin)
        file: String,

        /// Number of pilot jobs
        #[arg(short = 's', long, default_value = "10", value_name = "NUM")]
        sample_size: usize,

        /// Slurm partition
        #[arg(short = 'p', long)]
        partition: Option<String>,

        /// Initial CPU guess
        #[arg(long, default_value = "4", value_name = "NUM")]
        cpus_guess: u32,

        /// Initial memory guess (GB)
        #[arg(long, default_value = "8", value_name = "GB")]
        memory_guess: u32,

        /// Initial time guess (minutes)
        #[arg(long, default_value = "30", value_name = "MIN")]
        time_guess: u32,

        /// Environment setup command
        #[arg(long, value_name = "CMD")]
        env_setup: Option<String>,

        /// Measure peak memory usage
        #[arg(long)]
        measure_memory: bool,

        /// Save recommendations to a JSON file
        #[arg(short = 'o', long, value_name = "PATH")]
        output: Option<PathBuf>,

        /// Print shell export commands
        #[arg(long)]
        export_shell: bool,

        /// Seed for sample selection
        #[arg(long, value_name = "SEED")]
        seed: Option<u64>,

        /// Retries per pilot sample
        #[arg(long, value_name = "NUM")]
        pilot_retries: Option<u32>,
    },

    /// Check job status
    #[command(name = "status")]
    Status {
        /// Job IDs to check (array tasks as 123_4)
        job_ids: Vec<String>,
    },
}

/// Resource flags shared by `run` and `batch`
#[derive(Args, Debug, Clone, Default)]
pub struct ResourceArgs {
    /// Job name
    #[arg(short = 'n', long)]
    pub name: Option<String>,

    /// Slurm partition
    #[arg(short = 'p', long)]
    pub partition: Option<String>,

    /// Time limit (minutes)
    #[arg(short = 't', long, value_name = "MIN")]
    pub time: Option<u32>,

    /// CPUs per task
    #[arg(short = 'c', long, value_name = "NUM")]
    pub cpus: Option<u32>,

    /// Memory (GB)
    #[arg(short = 'm', long, value_name = "GB")]
    pub memory: Option<u32>,

    /// Environment variables (KEY=VALUE, repeatable)
    #[arg(short = 'e', long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Environment setup command
    #[arg(long, value_name = "CMD")]
    pub env_setup: Option<String>,

    /// Environment merge strategy
    #[arg(long, value_enum, default_value = "inherit")]
    pub env_merge: MergeMode,

    /// Slurm account
    #[arg(short = 'a', long)]
    pub account: Option<String>,

    /// Quality of service
    #[arg(short = 'q', long)]
    pub qos: Option<String>,

    /// Raw scheduler option (KEY=VALUE, repeatable)
    #[arg(long = "extra", value_name = "KEY=VALUE")]
    pub extra: Vec<String>,

    /// Uniform start jitter upper bound (seconds)
    #[arg(long, value_name = "SECS")]
    pub jitter: Option<f64>,
}

/// Retry flags
#[derive(Args, Debug, Clone, Default)]
pub struct RetryArgs {
    /// Number of retries
    #[arg(long, value_name = "NUM")]
    pub retries: Option<u32>,

    /// Retry backoff (seconds)
    #[arg(long, value_name = "SECS")]
    pub retry_backoff: Option<f64>,

    /// Also retry attempts that time out
    #[arg(long)]
    pub retry_on_timeout: bool,
}

/// Wait flags
#[derive(Args, Debug, Clone, Default)]
pub struct WaitArgs {
    /// Wait for completion
    #[arg(short = 'w', long)]
    pub wait: bool,

    /// Wait timeout per attempt (e.g. 90s, 2h, or plain seconds)
    #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
    pub wait_timeout: Option<Duration>,
}

/// Submission backend
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// Slurm via sbatch/squeue/sacct/scancel
    #[default]
    Slurm,
    /// Local subprocesses (testing and small workstations)
    Local,
}

impl ResourceArgs {
    /// Parsed `--env` overlay
    pub fn env_overlay(&self) -> BTreeMap<String, String> {
        parse_key_value_pairs(&self.env, "env")
    }

    /// Map the resource flags onto call-site overrides
    pub fn to_overrides(&self) -> CallOverrides {
        let extra = parse_key_value_pairs(&self.extra, "extra")
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();

        CallOverrides {
            partition: self.partition.clone(),
            account: self.account.clone(),
            qos: self.qos.clone(),
            cpus_per_task: self.cpus,
            mem_gb: self.memory,
            time_min: self.time,
            env_setup: self.env_setup.clone(),
            jitter_s: self.jitter,
            extra,
            ..Default::default()
        }
    }
}

impl RetryArgs {
    /// Apply retry flags to existing overrides
    pub fn apply(&self, overrides: &mut CallOverrides) {
        overrides.retries = self.retries;
        overrides.retry_backoff_s = self.retry_backoff;
        if self.retry_on_timeout {
            overrides.retry_on_timeout = Some(true);
        }
    }
}

/// Parse `KEY=VALUE` entries; malformed entries are skipped with a warning
pub fn parse_key_value_pairs(items: &[String], flag: &str) -> BTreeMap<String, String> {
    let mut pairs = BTreeMap::new();
    for item in items {
        match item.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                pairs.insert(key.to_string(), value.to_string());
            }
            _ => {
                tracing::warn!("Invalid --{} format '{}', expected KEY=VALUE", flag, item);
            }
        }
    }
    pairs
}

/// Parse a duration given as plain seconds or a humantime string
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<f64>() {
        if secs.is_finite() && secs >= 0.0 {
            return Ok(Duration::from_secs_f64(secs));
        }
        return Err(format!("Invalid duration: {}", value));
    }
    humantime::parse_duration(value).map_err(|e| format!("Invalid duration '{}': {}", value, e))
}

/// Read non-empty, trimmed lines from a file or `-` for stdin
pub fn read_command_lines(source: &str) -> std::io::Result<Vec<String>> {
    use std::io::Read;

    let mut text = String::new();
    if source == "-" {
        std::io::stdin().read_to_string(&mut text)?;
    } else {
        text = std::fs::read_to_string(source)?;
    }
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}
