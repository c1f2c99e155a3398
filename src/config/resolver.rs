//! Layered configuration resolution
//!
//! Turns the merged profile layers plus call-site overrides into one
//! [`EffectiveConfig`]. Resolution is a pure function of its inputs: no
//! global state is read and identical inputs give structurally equal output.

use super::profile::{
    ConfigLayers, ProfileDocument, DEFAULT_CLUSTER, DEFAULT_JOB_NAME_TEMPLATE, DEFAULT_MAX_NAME_LEN,
};
use crate::error::{ParacoreError, Result};
use crate::submit::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_CPUS_PER_TASK: u32 = 4;
const DEFAULT_MEM_GB: u32 = 16;
const DEFAULT_TIME_MIN: u32 = 60;
const DEFAULT_RETRY_BACKOFF_S: f64 = 30.0;
const DEFAULT_POLL_INTERVAL_S: f64 = 5.0;
const DEFAULT_LOG_DIR: &str = "paracore_logs";

/// Shortest `max_len` that still leaves room for the hash suffix
pub const MIN_NAME_LEN: usize = 8;

/// Call-site keyword overrides, the highest-precedence layer.
///
/// Keys that are not known fields are collected into `extra` and passed to
/// the scheduler untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallOverrides {
    pub partition: Option<String>,
    pub account: Option<String>,
    pub qos: Option<String>,
    pub cpus_per_task: Option<u32>,
    pub mem_gb: Option<u32>,
    pub time_min: Option<u32>,
    pub array_parallelism: Option<u32>,
    pub env_setup: Option<String>,
    pub retries: Option<u32>,
    pub retry_backoff_s: Option<f64>,
    pub retry_on_timeout: Option<bool>,
    pub jitter_s: Option<f64>,
    pub poll_interval_s: Option<f64>,
    pub concurrency: Option<usize>,
    pub log_dir: Option<PathBuf>,
    pub project: Option<String>,
    pub validate_partition: Option<bool>,
    /// Unknown fields, forwarded verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Fully resolved parameters for one submission call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectiveConfig {
    /// Selected cluster profile
    pub cluster: String,
    /// Partition; `None` lets the scheduler choose its default
    pub partition: Option<String>,
    pub account: Option<String>,
    pub qos: Option<String>,
    pub cpus_per_task: u32,
    pub mem_gb: u32,
    pub time_min: u32,
    /// `%N` cap for array submissions
    pub array_parallelism: Option<u32>,
    /// The cluster's configured parallelism cap
    pub max_array_parallelism: Option<u32>,
    /// Command run before every task payload
    pub env_setup: Option<String>,
    pub io_scratch: Option<String>,
    /// Raw scheduler options
    pub extra: BTreeMap<String, Value>,
    pub retries: u32,
    pub retry_backoff_s: f64,
    /// Upper bound of the uniform start and retry jitter
    pub jitter_s: f64,
    pub retry_on_timeout: bool,
    pub poll_interval_s: f64,
    /// Driver-side limit on concurrently supervised tasks
    pub concurrency: usize,
    pub log_dir: PathBuf,
    pub validate_partition: bool,
    pub job_name_template: String,
    pub max_name_len: usize,
    pub project: String,
}

impl EffectiveConfig {
    /// Retry policy derived from the resolved fields
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.retries,
            backoff_s: self.retry_backoff_s,
            jitter_s: self.jitter_s,
            retry_on_timeout: self.retry_on_timeout,
            attempt_timeout: None,
        }
    }

    /// Interval between provider polls
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_s)
    }

    /// Standard naming tags for this configuration
    pub fn name_tags(&self) -> BTreeMap<String, String> {
        let env = self.env_setup.clone().unwrap_or_else(|| "default".to_string());
        let mut tags = BTreeMap::new();
        tags.insert("project".to_string(), self.project.clone());
        tags.insert("cluster".to_string(), self.cluster.clone());
        tags.insert(
            "partition".to_string(),
            self.partition.clone().unwrap_or_else(|| "default".to_string()),
        );
        tags.insert("environment".to_string(), env.clone());
        tags.insert("env".to_string(), env);
        tags
    }
}

/// Merges profile layers and call-site overrides
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    profile: ProfileDocument,
}

impl ConfigResolver {
    /// Create a resolver over discovered layers
    pub fn new(layers: &ConfigLayers) -> Self {
        Self {
            profile: layers.merged(),
        }
    }

    /// Create a resolver over an already merged document
    pub fn from_profile(profile: ProfileDocument) -> Self {
        Self { profile }
    }

    /// Resolver with only the built-in defaults
    pub fn builtin() -> Self {
        Self::new(&ConfigLayers::builtin_only())
    }

    /// Merged profile document
    pub fn profile(&self) -> &ProfileDocument {
        &self.profile
    }

    /// Cluster selected when the caller names none
    pub fn active_cluster(&self) -> &str {
        self.profile.active_cluster.as_deref().unwrap_or(DEFAULT_CLUSTER)
    }

    /// Resolve the effective configuration for one call
    pub fn resolve(&self, cluster: Option<&str>, overrides: &CallOverrides) -> Result<EffectiveConfig> {
        let cluster_name = cluster.unwrap_or_else(|| self.active_cluster()).to_string();
        let cluster_profile = self.profile.clusters.get(&cluster_name).ok_or_else(|| {
            ParacoreError::config(format!(
                "unknown cluster '{}' (known: {})",
                cluster_name,
                self.profile.clusters.keys().cloned().collect::<Vec<_>>().join(", ")
            ))
        })?;
        let slurm = &cluster_profile.slurm;
        let defaults = &self.profile.defaults;
        let naming = &self.profile.naming;

        let mut extra = slurm.extra.clone();
        extra.extend(overrides.extra.iter().map(|(k, v)| (k.clone(), v.clone())));

        let config = EffectiveConfig {
            cluster: cluster_name,
            partition: overrides.partition.clone().or_else(|| slurm.partition.clone()),
            account: overrides.account.clone().or_else(|| slurm.account.clone()),
            qos: overrides.qos.clone().or_else(|| slurm.qos.clone()),
            cpus_per_task: overrides
                .cpus_per_task
                .or(slurm.cpus_per_task)
                .unwrap_or(DEFAULT_CPUS_PER_TASK),
            mem_gb: overrides.mem_gb.or(slurm.mem_gb).unwrap_or(DEFAULT_MEM_GB),
            time_min: overrides.time_min.or(slurm.time_min).unwrap_or(DEFAULT_TIME_MIN),
            array_parallelism: overrides.array_parallelism.or(slurm.max_array_parallelism),
            max_array_parallelism: slurm.max_array_parallelism,
            env_setup: overrides
                .env_setup
                .clone()
                .or_else(|| cluster_profile.default_env.clone()),
            io_scratch: cluster_profile.io_scratch.clone(),
            extra,
            retries: overrides.retries.or(defaults.retries).unwrap_or(0),
            retry_backoff_s: overrides
                .retry_backoff_s
                .or(defaults.retry_backoff_s)
                .unwrap_or(DEFAULT_RETRY_BACKOFF_S),
            jitter_s: overrides.jitter_s.or(slurm.start_jitter_s).unwrap_or(0.0),
            retry_on_timeout: overrides
                .retry_on_timeout
                .or(defaults.retry_on_timeout)
                .unwrap_or(false),
            poll_interval_s: overrides
                .poll_interval_s
                .or(defaults.poll_interval_s)
                .unwrap_or(DEFAULT_POLL_INTERVAL_S),
            concurrency: overrides
                .concurrency
                .or(defaults.concurrency)
                .unwrap_or_else(num_cpus::get),
            log_dir: overrides
                .log_dir
                .clone()
                .or_else(|| defaults.log_dir.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR)),
            validate_partition: overrides
                .validate_partition
                .or(defaults.validate_partition)
                .unwrap_or(false),
            job_name_template: naming
                .default_job_name
                .clone()
                .unwrap_or_else(|| DEFAULT_JOB_NAME_TEMPLATE.to_string()),
            max_name_len: naming.max_len.unwrap_or(DEFAULT_MAX_NAME_LEN),
            project: overrides
                .project
                .clone()
                .or_else(|| naming.project.clone())
                .unwrap_or_else(|| "paracore".to_string()),
        };

        validate(&config)?;
        Ok(config)
    }
}

fn validate(config: &EffectiveConfig) -> Result<()> {
    let positive = [
        ("cpus_per_task", config.cpus_per_task),
        ("mem_gb", config.mem_gb),
        ("time_min", config.time_min),
    ];
    for (field, value) in positive {
        if value == 0 {
            return Err(ParacoreError::config(format!("{} must be at least 1", field)));
        }
    }
    if config.array_parallelism == Some(0) {
        return Err(ParacoreError::config("array_parallelism must be at least 1"));
    }
    if !(config.retry_backoff_s.is_finite() && config.retry_backoff_s >= 0.0) {
        return Err(ParacoreError::config("retry_backoff_s must be a non-negative number"));
    }
    if !(config.jitter_s.is_finite() && config.jitter_s >= 0.0) {
        return Err(ParacoreError::config("jitter_s must be a non-negative number"));
    }
    if !(config.poll_interval_s.is_finite() && config.poll_interval_s > 0.0) {
        return Err(ParacoreError::config("poll_interval_s must be positive"));
    }
    if config.concurrency == 0 {
        return Err(ParacoreError::config("concurrency must be at least 1"));
    }
    if config.max_name_len < MIN_NAME_LEN {
        return Err(ParacoreError::config(format!(
            "naming.max_len must be at least {}",
            MIN_NAME_LEN
        )));
    }
    Ok(())
}
