//! Translation from effective configuration to provider job specs

use super::JobHandle;
use crate::config::EffectiveConfig;
use crate::environment::EnvironmentSpec;
use crate::error::{ParacoreError, Result};
use crate::naming::output_paths;
use crate::provider::{ArraySpec, JobSpec, Payload, SubmissionProvider};
use std::sync::Arc;

/// Everything about a submission except the payloads
#[derive(Debug, Clone)]
pub struct JobTemplate {
    pub config: Arc<EffectiveConfig>,
    /// Rendered, bounded job name
    pub job_name: String,
    pub environment: EnvironmentSpec,
    pub measure_memory: bool,
}

impl JobTemplate {
    /// Provider job spec for `tasks`; `array` selects array submission
    pub fn job_spec(&self, tasks: Vec<Payload>, array: bool) -> JobSpec {
        let config = &self.config;
        let (stdout, stderr) = output_paths(&config.log_dir, &self.job_name, array);
        let array = array.then(|| ArraySpec {
            size: tasks.len(),
            parallelism: config.array_parallelism,
        });

        JobSpec {
            name: self.job_name.clone(),
            partition: config.partition.clone(),
            account: config.account.clone(),
            qos: config.qos.clone(),
            cpus_per_task: config.cpus_per_task,
            mem_gb: config.mem_gb,
            time_min: config.time_min,
            extra: config.extra.clone(),
            environment: self.environment.clone(),
            tasks,
            array,
            log_dir: config.log_dir.clone(),
            stdout,
            stderr,
            measure_memory: self.measure_memory,
        }
    }
}

/// Submits job templates through a provider
#[derive(Clone)]
pub struct SubmissionAdapter {
    provider: Arc<dyn SubmissionProvider>,
}

impl SubmissionAdapter {
    pub fn new(provider: Arc<dyn SubmissionProvider>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &Arc<dyn SubmissionProvider> {
        &self.provider
    }

    /// Pre-flight partition check when the configuration asks for one
    pub async fn validate(&self, template: &JobTemplate) -> Result<()> {
        if !template.config.validate_partition {
            return Ok(());
        }
        match template.config.partition.as_deref() {
            Some(partition) => self.provider.validate_partition(partition).await,
            None => Ok(()),
        }
    }

    /// Submit one payload as a single job
    pub async fn submit(&self, template: &JobTemplate, payload: &Payload) -> Result<JobHandle> {
        self.validate(template).await?;

        let spec = template.job_spec(vec![payload.clone()], false);
        tracing::info!(
            "Submitting {} via {} (partition {}, {} cpu, {}G, {} min)",
            spec.name,
            self.provider.name(),
            spec.partition.as_deref().unwrap_or("default"),
            spec.cpus_per_task,
            spec.mem_gb,
            spec.time_min
        );
        let mut raw = self.provider.submit(&spec).await?;
        if raw.len() != 1 {
            return Err(ParacoreError::submission(format!(
                "provider returned {} handles for a single job",
                raw.len()
            )));
        }
        let raw = raw.remove(0);
        Ok(JobHandle::new(
            self.provider.clone(),
            raw,
            &template.job_name,
            template.config.poll_interval(),
        ))
    }

    /// Submit payloads as one array job; handle `i` belongs to payload `i`
    pub async fn submit_array(&self, template: &JobTemplate, payloads: &[Payload]) -> Result<Vec<JobHandle>> {
        if payloads.is_empty() {
            return Ok(Vec::new());
        }
        self.validate(template).await?;

        let spec = template.job_spec(payloads.to_vec(), true);
        tracing::info!(
            "Submitting array {} via {} ({} tasks, parallelism {})",
            spec.name,
            self.provider.name(),
            payloads.len(),
            spec.array
                .and_then(|a| a.parallelism)
                .map(|p| p.to_string())
                .unwrap_or_else(|| "unbounded".to_string())
        );
        let raw = self.provider.submit(&spec).await?;
        if raw.len() != payloads.len() {
            return Err(ParacoreError::submission(format!(
                "provider returned {} handles for {} tasks",
                raw.len(),
                payloads.len()
            )));
        }

        let mut handles: Vec<JobHandle> = raw
            .into_iter()
            .map(|raw| {
                JobHandle::new(
                    self.provider.clone(),
                    raw,
                    &template.job_name,
                    template.config.poll_interval(),
                )
            })
            .collect();
        handles.sort_by_key(|h| h.array_index());
        Ok(handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CallOverrides, ConfigResolver};
    use crate::environment::{EnvironmentComposer, MergeMode, ParentEnvironment};
    use crate::provider::{PollStatus, ProviderHandle};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        specs: Mutex<Vec<JobSpec>>,
        partition_ok: bool,
    }

    #[async_trait]
    impl SubmissionProvider for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn submit(&self, spec: &JobSpec) -> Result<Vec<ProviderHandle>> {
            self.specs.lock().unwrap().push(spec.clone());
            // reversed on purpose
            Ok((0..spec.tasks.len())
                .rev()
                .map(|i| ProviderHandle {
                    job_id: format!("9_{}", i),
                    array_job_id: Some("9".into()),
                    array_index: spec.array.map(|_| i),
                    stdout: PathBuf::from(format!("o{}", i)),
                    stderr: PathBuf::from(format!("e{}", i)),
                })
                .collect())
        }

        async fn poll(&self, _handle: &ProviderHandle) -> Result<PollStatus> {
            Ok(PollStatus::in_progress(crate::provider::JobState::Pending))
        }

        async fn cancel(&self, _handle: &ProviderHandle) -> Result<()> {
            Ok(())
        }

        async fn validate_partition(&self, partition: &str) -> Result<()> {
            if self.partition_ok {
                Ok(())
            } else {
                Err(ParacoreError::PartitionValidationError {
                    partition: partition.to_string(),
                    message: "not found".into(),
                })
            }
        }
    }

    fn template(overrides: CallOverrides) -> JobTemplate {
        let config = ConfigResolver::builtin().resolve(None, &overrides).unwrap();
        JobTemplate {
            config: Arc::new(config),
            job_name: "demo".into(),
            environment: EnvironmentComposer::compose(
                &ParentEnvironment::empty(),
                MergeMode::Inherit,
                &BTreeMap::new(),
                None,
            ),
            measure_memory: false,
        }
    }

    #[tokio::test]
    async fn test_array_submission_preserves_order_and_cap() {
        let recorder = Arc::new(Recorder {
            partition_ok: true,
            ..Default::default()
        });
        let adapter = SubmissionAdapter::new(recorder.clone());
        let mut overrides = CallOverrides {
            array_parallelism: Some(2),
            ..Default::default()
        };
        overrides.extra.insert("gres".into(), Value::String("gpu:1".into()));
        let payloads: Vec<Payload> = (0..5).map(|i| Payload::command(format!("echo {}", i))).collect();

        let handles = adapter.submit_array(&template(overrides), &payloads).await.unwrap();
        let indices: Vec<_> = handles.iter().map(|h| h.array_index()).collect();
        assert_eq!(indices, (0..5).map(Some).collect::<Vec<_>>());

        let specs = recorder.specs.lock().unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].array.unwrap().directive(), "0-4%2");
        assert_eq!(specs[0].extra["gres"], Value::String("gpu:1".into()));
        assert_eq!(specs[0].partition.as_deref(), Some("compute"));
        assert_eq!(specs[0].stdout, PathBuf::from("paracore_logs/demo_%A_%a.out"));
    }

    #[tokio::test]
    async fn test_single_submission() {
        let adapter = SubmissionAdapter::new(Arc::new(Recorder::default()));
        let handle = adapter
            .submit(&template(CallOverrides::default()), &Payload::command("true"))
            .await
            .unwrap();
        assert_eq!(handle.job_name(), "demo");
        assert_eq!(handle.array_index(), None);
    }

    #[tokio::test]
    async fn test_partition_validation_runs_first() {
        let recorder = Arc::new(Recorder::default());
        let adapter = SubmissionAdapter::new(recorder.clone());
        let overrides = CallOverrides {
            validate_partition: Some(true),
            ..Default::default()
        };
        let err = adapter
            .submit(&template(overrides), &Payload::command("true"))
            .await
            .unwrap_err();
        assert!(err.is_config_error());
        assert!(recorder.specs.lock().unwrap().is_empty());
    }
}
