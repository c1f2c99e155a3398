//! Paracore client

use super::BatchSubmission;
use crate::autotune::{AutotunePilot, PilotReport, PilotRequest};
use crate::config::{CallOverrides, ConfigResolver};
use crate::environment::{EnvironmentComposer, MergeMode, ParentEnvironment};
use crate::error::Result;
use crate::naming::{host_tag, NameTemplater};
use crate::provider::{Payload, SubmissionProvider};
use crate::submit::{JobTemplate, LogicalTask, RetryOrchestrator, RetryPolicy, SubmissionAdapter};
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Job name template used for pilot runs unless the caller names them
const PILOT_JOB_NAME: &str = "paracore-pilot";

/// Per-call options on top of the resolved configuration
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub overrides: CallOverrides,
    /// Cluster profile; the active cluster when absent
    pub cluster: Option<String>,
    /// Job name template replacing the configured one
    pub job_name: Option<String>,
    /// Extra naming tags
    pub tags: BTreeMap<String, String>,
    /// Environment overlay
    pub env: BTreeMap<String, String>,
    pub env_merge: MergeMode,
    pub measure_memory: bool,
    /// Per-attempt result timeout
    pub wait_timeout: Option<Duration>,
}

/// Entry point for submitting commands and functions
pub struct Paracore {
    resolver: ConfigResolver,
    provider: Arc<dyn SubmissionProvider>,
    parent_env: ParentEnvironment,
}

impl Paracore {
    /// Create a client; the parent environment is captured now
    pub fn new(resolver: ConfigResolver, provider: Arc<dyn SubmissionProvider>) -> Self {
        Self {
            resolver,
            provider,
            parent_env: ParentEnvironment::capture(),
        }
    }

    /// Use an explicit parent environment snapshot
    pub fn with_parent_environment(mut self, parent_env: ParentEnvironment) -> Self {
        self.parent_env = parent_env;
        self
    }

    pub fn resolver(&self) -> &ConfigResolver {
        &self.resolver
    }

    pub fn provider(&self) -> &Arc<dyn SubmissionProvider> {
        &self.provider
    }

    pub fn orchestrator(&self) -> RetryOrchestrator {
        RetryOrchestrator::new(SubmissionAdapter::new(self.provider.clone()))
    }

    /// Resolve configuration, name and environment for one submission
    pub fn prepare(&self, options: &SubmitOptions) -> Result<JobTemplate> {
        let config = self
            .resolver
            .resolve(options.cluster.as_deref(), &options.overrides)?;

        let mut tags = config.name_tags();
        tags.insert("host".to_string(), host_tag());
        tags.extend(options.tags.iter().map(|(k, v)| (k.clone(), v.clone())));

        let template = options
            .job_name
            .as_deref()
            .unwrap_or(&config.job_name_template);
        let job_name = NameTemplater::new(config.max_name_len)?.render(template, &tags)?;

        let environment = EnvironmentComposer::compose(
            &self.parent_env,
            options.env_merge,
            &options.env,
            config.env_setup.as_deref(),
        );

        Ok(JobTemplate {
            config: Arc::new(config),
            job_name,
            environment,
            measure_memory: options.measure_memory,
        })
    }

    fn policy(template: &JobTemplate, options: &SubmitOptions) -> RetryPolicy {
        RetryPolicy {
            attempt_timeout: options.wait_timeout,
            ..template.config.retry_policy()
        }
    }

    /// Submit one shell command as a supervised logical task
    pub async fn run_cmd(&self, command: impl Into<String>, options: &SubmitOptions) -> Result<LogicalTask> {
        let template = Arc::new(self.prepare(options)?);
        let policy = Self::policy(&template, options);
        let payload = Payload::command(command);

        let orchestrator = self.orchestrator();
        orchestrator.adapter().validate(&template).await?;
        start_jitter(template.config.jitter_s).await;
        Ok(orchestrator.spawn(template, payload, policy, None))
    }

    /// Submit shell commands as one array job
    pub async fn map_cmds<S: AsRef<str>>(&self, commands: &[S], options: &SubmitOptions) -> Result<BatchSubmission> {
        let payloads = commands
            .iter()
            .map(|c| Payload::command(c.as_ref()))
            .collect();
        self.map_payloads(payloads, options).await
    }

    /// Submit `function(item)` for every item as one array job
    pub async fn map_func<T: Serialize>(
        &self,
        function: &str,
        items: &[T],
        options: &SubmitOptions,
    ) -> Result<BatchSubmission> {
        let payloads = items
            .iter()
            .map(|item| Payload::call(function, item))
            .collect::<Result<Vec<_>>>()?;
        self.map_payloads(payloads, options).await
    }

    async fn map_payloads(&self, payloads: Vec<Payload>, options: &SubmitOptions) -> Result<BatchSubmission> {
        let template = Arc::new(self.prepare(options)?);
        let policy = Self::policy(&template, options);
        let orchestrator = self.orchestrator();

        start_jitter(template.config.jitter_s).await;
        let handles = orchestrator
            .adapter()
            .submit_array(&template, &payloads)
            .await?;
        Ok(BatchSubmission::new(orchestrator, template, payloads, handles, policy))
    }

    /// Run a pilot over a sample of `items` and recommend resources
    pub async fn autotune(
        &self,
        items: &[Payload],
        request: &PilotRequest,
        options: &SubmitOptions,
    ) -> Result<PilotReport> {
        let mut options = options.clone();
        options
            .job_name
            .get_or_insert_with(|| PILOT_JOB_NAME.to_string());
        let template = self.prepare(&options)?;
        AutotunePilot::new(self.orchestrator())
            .recommend(&template, items, request)
            .await
    }
}

/// Sleep a uniform random time in `[0, jitter_s]`
async fn start_jitter(jitter_s: f64) {
    if jitter_s <= 0.0 {
        return;
    }
    let delay = rand::thread_rng().gen_range(0.0..=jitter_s);
    tracing::debug!("Start jitter {:.2}s", delay);
    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProfileDocument;
    use crate::provider::{FunctionRegistry, LocalProvider};
    use serde_json::Value;
    use tempfile::TempDir;

    fn client(dir: &TempDir, registry: FunctionRegistry) -> Paracore {
        let yaml = format!(
            "naming:\n  project: demo\ndefaults:\n  poll_interval_s: 0.05\n  retry_backoff_s: 0.1\n  log_dir: {}\n",
            dir.path().display()
        );
        let profile = ProfileDocument::builtin().merge(ProfileDocument::from_yaml(&yaml).unwrap());
        Paracore::new(
            ConfigResolver::from_profile(profile),
            Arc::new(LocalProvider::with_registry(registry)),
        )
        .with_parent_environment(ParentEnvironment::from_pairs([("PATH", "/usr/bin:/bin")]))
    }

    #[test]
    fn test_prepare_renders_name_and_environment() {
        let dir = TempDir::new().unwrap();
        let paracore = client(&dir, FunctionRegistry::new());
        let mut options = SubmitOptions {
            job_name: Some("{project}-{step}".into()),
            env_merge: MergeMode::Replace,
            ..Default::default()
        };
        options.tags.insert("step".into(), "align".into());
        options.env.insert("A".into(), "1".into());

        let template = paracore.prepare(&options).unwrap();
        assert_eq!(template.job_name, "demo-align");
        assert_eq!(template.environment.variables.len(), 1);
        assert_eq!(template.config.log_dir, dir.path());
    }

    #[test]
    fn test_prepare_unknown_tag_is_config_error() {
        let dir = TempDir::new().unwrap();
        let options = SubmitOptions {
            job_name: Some("{nope}".into()),
            ..Default::default()
        };
        let err = client(&dir, FunctionRegistry::new()).prepare(&options).unwrap_err();
        assert!(err.is_config_error());
    }

    #[tokio::test]
    async fn test_run_cmd_returns_output() {
        let dir = TempDir::new().unwrap();
        let task = client(&dir, FunctionRegistry::new())
            .run_cmd("echo hello", &SubmitOptions::default())
            .await
            .unwrap();
        assert_eq!(task.wait().await.unwrap().value, Value::from("hello\n"));
    }

    #[tokio::test]
    async fn test_map_cmds_keeps_input_order() {
        let dir = TempDir::new().unwrap();
        let options = SubmitOptions {
            overrides: CallOverrides {
                array_parallelism: Some(2),
                ..Default::default()
            },
            ..Default::default()
        };
        let commands: Vec<String> = (0..5)
            .map(|i| format!("sleep 0.0{}; echo {}", 5 - i, i))
            .collect();
        let batch = client(&dir, FunctionRegistry::new())
            .map_cmds(&commands, &options)
            .await
            .unwrap();

        let indices: Vec<_> = batch.handles().iter().map(|h| h.array_index()).collect();
        assert_eq!(indices, (0..5).map(Some).collect::<Vec<_>>());

        let values = batch.results(None).await.unwrap();
        let expected: Vec<Value> = (0..5).map(|i| Value::from(format!("{}\n", i))).collect();
        assert_eq!(values, expected);
    }

    #[tokio::test]
    async fn test_map_func_through_registry() {
        let dir = TempDir::new().unwrap();
        let registry = FunctionRegistry::new();
        registry.register("square", |v: Value| {
            let n = v.as_i64().ok_or("not a number")?;
            Ok(Value::from(n * n))
        });
        let batch = client(&dir, registry)
            .map_func("square", &[1, 2, 3], &SubmitOptions::default())
            .await
            .unwrap();
        let values = batch.results(None).await.unwrap();
        assert_eq!(values, vec![Value::from(1), Value::from(4), Value::from(9)]);
    }
}
