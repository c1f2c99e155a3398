//! Array submissions and ordered result gathering

use crate::error::{ParacoreError, Result};
use crate::progress::BatchProgress;
use crate::provider::{Payload, TaskOutput};
use crate::submit::{gather_ordered, JobHandle, JobTemplate, RetryOrchestrator, RetryPolicy};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A submitted array job; handle `i` belongs to item `i`
pub struct BatchSubmission {
    orchestrator: RetryOrchestrator,
    template: Arc<JobTemplate>,
    payloads: Vec<Payload>,
    handles: Vec<JobHandle>,
    policy: RetryPolicy,
    cancel: CancellationToken,
    /// Per-item tokens, children of `cancel`
    item_cancels: Vec<CancellationToken>,
}

impl BatchSubmission {
    pub(crate) fn new(
        orchestrator: RetryOrchestrator,
        template: Arc<JobTemplate>,
        payloads: Vec<Payload>,
        handles: Vec<JobHandle>,
        policy: RetryPolicy,
    ) -> Self {
        let cancel = CancellationToken::new();
        let item_cancels = handles.iter().map(|_| cancel.child_token()).collect();
        Self {
            orchestrator,
            template,
            payloads,
            handles,
            policy,
            cancel,
            item_cancels,
        }
    }

    /// First-attempt handles in input order
    pub fn handles(&self) -> &[JobHandle] {
        &self.handles
    }

    pub fn job_name(&self) -> &str {
        &self.template.job_name
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Cancel every logical task still being supervised
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel item `index` only; its siblings keep running
    pub fn cancel_task(&self, index: usize) -> Result<()> {
        let token = self.item_cancels.get(index).ok_or_else(|| {
            ParacoreError::config(format!(
                "task index {} out of range for {} task(s)",
                index,
                self.item_cancels.len()
            ))
        })?;
        token.cancel();
        Ok(())
    }

    /// Supervise every item to completion.
    ///
    /// Failed items are resubmitted as single jobs. At most `concurrency`
    /// items are supervised at once (the configured limit when `None`).
    pub async fn gather(&self, concurrency: Option<usize>, progress: Option<&BatchProgress>) -> Vec<Result<TaskOutput>> {
        let limit = concurrency.unwrap_or(self.template.config.concurrency);
        tracing::info!(
            "Gathering {} task(s) of {} ({} at a time)",
            self.handles.len(),
            self.template.job_name,
            limit
        );

        let futures = self
            .handles
            .iter()
            .zip(&self.payloads)
            .zip(&self.item_cancels)
            .enumerate()
            .map(|(index, ((handle, payload), cancel))| async move {
                let label = format!("task {} ({})", index, handle.job_id());
                let result = self
                    .orchestrator
                    .supervise(
                        &self.template,
                        payload,
                        &self.policy,
                        Some(handle.clone()),
                        cancel,
                        None,
                    )
                    .await;
                if let Some(progress) = progress {
                    progress.task_finished(&label, result.is_ok());
                }
                if let Err(ref e) = result {
                    tracing::warn!("{} failed: {}", label, e);
                }
                result
            });

        gather_ordered(futures, limit).await
    }

    /// Result values in input order; the first failure wins
    pub async fn results(&self, concurrency: Option<usize>) -> Result<Vec<Value>> {
        self.gather(concurrency, None)
            .await
            .into_iter()
            .enumerate()
            .map(|(index, result)| {
                result
                    .map(|output| output.value)
                    .map_err(|e| e.with_context(format!("task {}", index)))
            })
            .collect()
    }
}

impl std::fmt::Debug for BatchSubmission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchSubmission")
            .field("job_name", &self.template.job_name)
            .field("handles", &self.handles)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::submit::retry::tests::{template, Script, Scripted};
    use crate::submit::SubmissionAdapter;

    #[tokio::test(start_paused = true)]
    async fn test_failed_shard_resubmitted_as_single_job() {
        let provider = Scripted::new(vec![
            Script::Succeed(Value::from("a")),
            Script::Fail,
            Script::Succeed(Value::from("c")),
            Script::Succeed(Value::from("b")),
        ]);
        let orchestrator = RetryOrchestrator::new(SubmissionAdapter::new(provider.clone()));
        let template = Arc::new(template());
        let payloads: Vec<Payload> = ["a", "b", "c"].iter().map(|c| Payload::command(*c)).collect();
        let handles = orchestrator
            .adapter()
            .submit_array(&template, &payloads)
            .await
            .unwrap();
        let policy = RetryPolicy {
            retries: 1,
            backoff_s: 1.0,
            ..Default::default()
        };
        let batch = BatchSubmission::new(orchestrator, template, payloads, handles, policy);

        let progress = BatchProgress::disabled(3);
        let results = batch.gather(Some(2), Some(&progress)).await;
        assert!(results.iter().all(|r| r.is_ok()));
        let values: Vec<Value> = results.into_iter().map(|r| r.unwrap().value).collect();
        assert_eq!(values, vec![Value::from("a"), Value::from("b"), Value::from("c")]);
        assert_eq!(provider.submitted_at.lock().unwrap().len(), 2);
        assert_eq!(progress.summary().succeeded, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_reports_failing_index() {
        let provider = Scripted::new(vec![Script::Succeed(Value::Null), Script::Fail]);
        let orchestrator = RetryOrchestrator::new(SubmissionAdapter::new(provider));
        let template = Arc::new(template());
        let payloads = vec![Payload::command("ok"), Payload::command("bad")];
        let handles = orchestrator
            .adapter()
            .submit_array(&template, &payloads)
            .await
            .unwrap();
        let batch = BatchSubmission::new(orchestrator, template, payloads, handles, RetryPolicy::default());

        let err = batch.results(None).await.unwrap_err();
        assert!(err.to_string().starts_with("task 1:"));
        assert!(matches!(err.root(), ParacoreError::RetryExhausted { attempts: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_one_task_leaves_siblings_running() {
        let provider = Scripted::new(vec![
            Script::Hang,
            Script::Slow {
                polls: 4,
                max_rss_mb: None,
            },
        ]);
        let orchestrator = RetryOrchestrator::new(SubmissionAdapter::new(provider.clone()));
        let template = Arc::new(template());
        let payloads = vec![Payload::command("hang"), Payload::command("slow")];
        let handles = orchestrator
            .adapter()
            .submit_array(&template, &payloads)
            .await
            .unwrap();
        let batch = BatchSubmission::new(orchestrator, template, payloads, handles, RetryPolicy::default());
        let hung = batch.handles()[0].job_id().to_string();

        let (results, cancelled) = tokio::join!(batch.gather(None, None), async {
            tokio::time::sleep(std::time::Duration::from_millis(700)).await;
            batch.cancel_task(0)
        });
        cancelled.unwrap();

        assert!(matches!(results[0], Err(ParacoreError::Cancelled { attempts: 1 })));
        assert_eq!(results[1].as_ref().unwrap().value, Value::Null);
        assert_eq!(*provider.cancelled.lock().unwrap(), vec![hung]);
        assert!(batch.cancel_task(2).unwrap_err().is_config_error());
    }
}
