//! Pilot runs: submit a sample of the workload and measure it

use super::recommendation::{MeasurementMode, Recommendation, ResourceGuesses};
use super::stats;
use crate::error::{ParacoreError, Result};
use crate::provider::Payload;
use crate::submit::{gather_ordered, JobHandle, JobTemplate, RetryOrchestrator};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Retries allowed per pilot sample, independent of the full-run budget
pub const DEFAULT_PILOT_RETRIES: u32 = 1;

/// Default number of sampled items
pub const DEFAULT_SAMPLE_SIZE: usize = 10;

/// Pilot parameters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PilotRequest {
    pub sample_size: usize,
    pub mode: MeasurementMode,
    pub guesses: ResourceGuesses,
    /// Seed for reproducible sampling
    pub seed: Option<u64>,
    pub pilot_retries: u32,
}

impl Default for PilotRequest {
    fn default() -> Self {
        Self {
            sample_size: DEFAULT_SAMPLE_SIZE,
            mode: MeasurementMode::default(),
            guesses: ResourceGuesses::default(),
            seed: None,
            pilot_retries: DEFAULT_PILOT_RETRIES,
        }
    }
}

/// Measurement of one pilot sample
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PilotSample {
    /// Position of the item in the workload
    pub item: usize,
    pub duration_s: Option<f64>,
    /// Absent when not measured or unavailable
    pub max_rss_mb: Option<f64>,
    pub failure: Option<String>,
}

impl PilotSample {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

/// Outcome of a pilot run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PilotReport {
    pub recommendation: Recommendation,
    pub samples: Vec<PilotSample>,
    pub submitted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl PilotReport {
    /// Note shown when some samples were excluded
    pub fn note(&self) -> Option<String> {
        (self.failed > 0).then(|| {
            format!(
                "Based on {}/{} successful pilot samples.",
                self.succeeded, self.submitted
            )
        })
    }
}

/// Runs pilot samples through the retry orchestrator
pub struct AutotunePilot {
    orchestrator: RetryOrchestrator,
}

impl AutotunePilot {
    pub fn new(orchestrator: RetryOrchestrator) -> Self {
        Self { orchestrator }
    }

    /// Sample `items`, run them with the guessed resources and recommend
    /// resources for the whole workload.
    pub async fn recommend(
        &self,
        template: &JobTemplate,
        items: &[Payload],
        request: &PilotRequest,
    ) -> Result<PilotReport> {
        if items.is_empty() {
            return Err(ParacoreError::config("autotune needs at least one item"));
        }
        if request.sample_size == 0 {
            return Err(ParacoreError::config("sample size must be at least 1"));
        }

        let picked = stats::sample_indices(items.len(), request.sample_size, request.seed);
        let payloads: Vec<Payload> = picked.iter().map(|&i| items[i].clone()).collect();
        let template = Arc::new(pilot_template(template, request));

        let mut policy = template.config.retry_policy();
        policy.retries = request.pilot_retries;

        tracing::info!(
            "Running pilot on {} of {} items ({} cpu, {}G, {} min, {} retries)",
            payloads.len(),
            items.len(),
            request.guesses.cpus_per_task,
            request.guesses.mem_gb,
            request.guesses.time_min,
            policy.retries
        );

        let adapter = self.orchestrator.adapter();
        let firsts: Vec<Option<JobHandle>> = match adapter.submit_array(&template, &payloads).await {
            Ok(handles) => handles.into_iter().map(Some).collect(),
            Err(e) if e.is_config_error() => return Err(e),
            Err(e) => {
                tracing::warn!("Pilot array submission failed: {}. Submitting samples individually", e);
                vec![None; payloads.len()]
            }
        };

        let cancel = CancellationToken::new();
        let runs = payloads
            .iter()
            .zip(firsts)
            .zip(picked)
            .map(|((payload, first), item)| {
                let (template, policy, cancel) = (&template, &policy, &cancel);
                async move {
                    let started = Instant::now();
                    let result = self
                        .orchestrator
                        .supervise(template, payload, policy, first, cancel, None)
                        .await;
                    (item, result, started.elapsed().as_secs_f64())
                }
            });
        let results = gather_ordered(runs, template.config.concurrency).await;

        let mut samples = Vec::with_capacity(results.len());
        for (item, result, wall_s) in results {
            let sample = match result {
                Ok(output) => PilotSample {
                    item,
                    duration_s: Some(output.metrics.duration_s.unwrap_or(wall_s)),
                    max_rss_mb: if request.mode.measures_memory() {
                        output.metrics.max_rss_mb
                    } else {
                        None
                    },
                    failure: None,
                },
                Err(e) => {
                    tracing::warn!("Pilot sample {} failed: {}", item, e);
                    PilotSample {
                        item,
                        duration_s: None,
                        max_rss_mb: None,
                        failure: Some(e.to_string()),
                    }
                }
            };
            samples.push(sample);
        }

        let durations: Vec<f64> = samples.iter().filter_map(|s| s.duration_s).collect();
        let memory: Vec<f64> = samples.iter().filter_map(|s| s.max_rss_mb).collect();
        let submitted = samples.len();
        let succeeded = samples.iter().filter(|s| s.succeeded()).count();
        let failed = submitted - succeeded;

        let recommendation = Recommendation::from_measurements(
            &durations,
            &memory,
            &request.guesses,
            items.len(),
            template.config.max_array_parallelism,
        )
        .ok_or_else(|| ParacoreError::PilotMeasurementError {
            submitted,
            failed,
            last_cause: samples.iter().rev().find_map(|s| s.failure.clone()),
        })?;

        tracing::info!(
            "Pilot finished: {}/{} samples succeeded, recommending {} min, {}G, {} cpu, parallelism {}",
            succeeded,
            submitted,
            recommendation.time_min,
            recommendation.mem_gb,
            recommendation.cpus_per_task,
            recommendation.array_parallelism
        );

        Ok(PilotReport {
            recommendation,
            samples,
            submitted,
            succeeded,
            failed,
        })
    }
}

/// The caller's template with the guessed resources and no array cap
fn pilot_template(template: &JobTemplate, request: &PilotRequest) -> JobTemplate {
    let mut config = (*template.config).clone();
    config.cpus_per_task = request.guesses.cpus_per_task;
    config.mem_gb = request.guesses.mem_gb;
    config.time_min = request.guesses.time_min;
    config.array_parallelism = None;

    JobTemplate {
        config: Arc::new(config),
        job_name: template.job_name.clone(),
        environment: template.environment.clone(),
        measure_memory: request.mode.measures_memory(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::submit::retry::tests::{template, Script, Scripted};
    use crate::submit::SubmissionAdapter;
    use serde_json::Value;

    fn pilot(provider: Arc<Scripted>) -> AutotunePilot {
        AutotunePilot::new(RetryOrchestrator::new(SubmissionAdapter::new(provider)))
    }

    fn items(n: usize) -> Vec<Payload> {
        (0..n).map(|i| Payload::command(format!("work {}", i))).collect()
    }

    fn base_template(retries: u32) -> JobTemplate {
        let mut template = template();
        let mut config = (*template.config).clone();
        config.retries = retries;
        config.retry_backoff_s = 1.0;
        template.config = Arc::new(config);
        template
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_samples_give_one_minute() {
        let provider = Scripted::new(vec![Script::Succeed(Value::Null); 5]);
        let request = PilotRequest {
            sample_size: 5,
            mode: MeasurementMode::TimeOnly,
            ..Default::default()
        };
        let report = pilot(provider.clone())
            .recommend(&base_template(3), &items(5), &request)
            .await
            .unwrap();

        assert_eq!(report.recommendation.time_min, 1);
        assert_eq!(report.recommendation.mem_gb, 8);
        assert_eq!(report.succeeded, 5);
        assert!(report.note().is_none());
        // one array submission
        assert_eq!(provider.submitted_at.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_samples_failing_is_measurement_error() {
        let provider = Scripted::new(Vec::new());
        let request = PilotRequest {
            sample_size: 3,
            seed: Some(1),
            ..Default::default()
        };
        let err = pilot(provider.clone())
            .recommend(&base_template(3), &items(20), &request)
            .await
            .unwrap_err();
        match err {
            ParacoreError::PilotMeasurementError { submitted, failed, .. } => {
                assert_eq!(submitted, 3);
                assert_eq!(failed, 3);
            }
            other => panic!("unexpected error {:?}", other),
        }
        // array submission plus one pilot retry per sample
        assert_eq!(provider.submitted_at.lock().unwrap().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pilot_retries_independent_of_full_budget() {
        let provider = Scripted::new(vec![Script::Fail, Script::Succeed(Value::Null)]);
        let request = PilotRequest {
            sample_size: 1,
            mode: MeasurementMode::TimeOnly,
            pilot_retries: 2,
            ..Default::default()
        };
        let report = pilot(provider.clone())
            .recommend(&base_template(0), &items(1), &request)
            .await
            .unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(provider.submitted_at.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_pilot_retries_keeps_partial_failures() {
        let provider = Scripted::new(vec![Script::Fail, Script::Succeed(Value::Null)]);
        let request = PilotRequest {
            sample_size: 2,
            mode: MeasurementMode::TimeOnly,
            pilot_retries: 0,
            ..Default::default()
        };
        let report = pilot(provider.clone())
            .recommend(&base_template(5), &items(2), &request)
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.note().unwrap(), "Based on 1/2 successful pilot samples.");
        assert_eq!(provider.submitted_at.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_bounds_supervised_samples() {
        let provider = Scripted::new(vec![
            Script::Slow {
                polls: 3,
                max_rss_mb: None,
            };
            6
        ]);
        let mut template = base_template(0);
        let mut config = (*template.config).clone();
        config.concurrency = 1;
        template.config = Arc::new(config);
        let request = PilotRequest {
            sample_size: 6,
            mode: MeasurementMode::TimeOnly,
            ..Default::default()
        };

        let report = pilot(provider.clone())
            .recommend(&template, &items(6), &request)
            .await
            .unwrap();
        assert_eq!(report.succeeded, 6);
        assert_eq!(*provider.peak_in_flight.lock().unwrap(), 1);
        // each sample is timed from its own start: two poll intervals
        for sample in &report.samples {
            let duration = sample.duration_s.unwrap();
            assert!((duration - 1.0).abs() < 1e-6, "sample {} took {}", sample.item, duration);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_measured_through_pilot() {
        let script = vec![
            Script::Slow {
                polls: 1,
                max_rss_mb: Some(2048.0),
            },
            Script::Slow {
                polls: 1,
                max_rss_mb: None,
            },
            Script::Slow {
                polls: 1,
                max_rss_mb: Some(5000.0),
            },
        ];
        let request = PilotRequest {
            sample_size: 3,
            mode: MeasurementMode::TimeAndRss,
            ..Default::default()
        };

        let report = pilot(Scripted::new(script.clone()))
            .recommend(&base_template(0), &items(3), &request)
            .await
            .unwrap();
        let memory: Vec<_> = report.samples.iter().map(|s| s.max_rss_mb).collect();
        assert_eq!(memory, vec![Some(2048.0), None, Some(5000.0)]);
        // ceil(5000 * 1.3 / 1024)
        assert_eq!(report.recommendation.mem_gb, 7);
        assert_eq!(report.recommendation.time_min, 1);

        let time_only = PilotRequest {
            mode: MeasurementMode::TimeOnly,
            ..request
        };
        let report = pilot(Scripted::new(script))
            .recommend(&base_template(0), &items(3), &time_only)
            .await
            .unwrap();
        assert!(report.samples.iter().all(|s| s.max_rss_mb.is_none()));
        assert_eq!(report.recommendation.mem_gb, 8);
    }

    #[tokio::test]
    async fn test_empty_workload_rejected() {
        let err = pilot(Scripted::new(Vec::new()))
            .recommend(&base_template(0), &[], &PilotRequest::default())
            .await
            .unwrap_err();
        assert!(err.is_config_error());
    }
}
