//! Job status inspection
//!
//! Prefers scheduler data (squeue, then sacct) and falls back to the files a
//! job leaves in the log directory when the scheduler cannot answer.

use crate::provider::{sacct_record, squeue_state, JobState};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Status of one job as seen from the scheduler and the log directory
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusReport {
    pub job_id: String,
    pub state: JobState,
    /// Array task index encoded in the id (`123_4`)
    pub task_index: Option<usize>,
    /// Raw scheduler fields
    pub info: BTreeMap<String, String>,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
    pub note: Option<String>,
}

impl fmt::Display for JobStatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Job {}: {}", self.job_id, self.state)?;
        if let Some(index) = self.task_index {
            writeln!(f, "  task index: {}", index)?;
        }
        for (key, value) in &self.info {
            writeln!(f, "  {}: {}", key, value)?;
        }
        if let Some(ref path) = self.stdout_path {
            writeln!(f, "  stdout: {}", path.display())?;
        }
        if let Some(ref path) = self.stderr_path {
            writeln!(f, "  stderr: {}", path.display())?;
        }
        if let Some(ref note) = self.note {
            writeln!(f, "  note: {}", note)?;
        }
        Ok(())
    }
}

/// Files a job left behind in the log directory
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobArtifacts {
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    /// Written only once the task finished
    pub result: Option<PathBuf>,
}

/// Array task index from ids like `123_4`
pub fn infer_task_index(job_id: &str) -> Option<usize> {
    let (base, suffix) = job_id.split_once('_')?;
    if base.is_empty() {
        return None;
    }
    suffix.parse().ok()
}

/// Find `*_{job_id}.out`, `.err` and `.metrics` in `log_dir`
pub fn find_artifacts(log_dir: &Path, job_id: &str) -> JobArtifacts {
    let mut artifacts = JobArtifacts::default();
    let entries = match std::fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!("Cannot read log dir {}: {}", log_dir.display(), e);
            return artifacts;
        }
    };

    let suffix = format!("_{}", job_id);
    for entry in entries.flatten() {
        let path = entry.path();
        let (Some(stem), Some(ext)) = (
            path.file_stem().and_then(|s| s.to_str()),
            path.extension().and_then(|s| s.to_str()),
        ) else {
            continue;
        };
        if !stem.ends_with(&suffix) {
            continue;
        }
        let slot = match ext {
            "out" => &mut artifacts.stdout,
            "err" => &mut artifacts.stderr,
            "metrics" => &mut artifacts.result,
            _ => continue,
        };
        if slot.is_none() {
            *slot = Some(path);
        }
    }
    artifacts
}

/// State implied by artifacts when the scheduler has no answer
pub fn state_from_artifacts(artifacts: &JobArtifacts) -> JobState {
    if artifacts.result.is_some() {
        JobState::Completed
    } else if artifacts.stdout.is_some() || artifacts.stderr.is_some() {
        JobState::Running
    } else {
        JobState::Unknown
    }
}

/// Collect status for `job_id`
pub async fn job_status(job_id: &str, log_dir: &Path) -> JobStatusReport {
    let mut report = JobStatusReport {
        job_id: job_id.to_string(),
        state: JobState::Unknown,
        task_index: infer_task_index(job_id),
        info: BTreeMap::new(),
        stdout_path: None,
        stderr_path: None,
        note: None,
    };

    match squeue_state(job_id).await {
        Ok(Some(state)) => report.state = state,
        Ok(None) => {}
        Err(e) => report.note = Some(format!("Slurm state unavailable: {}", e)),
    }

    if report.note.is_none() {
        match sacct_record(job_id).await {
            Ok(Some(record)) => {
                if report.state == JobState::Unknown {
                    report.state = record.state;
                }
                report.info.insert("State".into(), record.raw_state);
                report.info.insert("ExitCode".into(), record.exit_code);
                if let Some(elapsed) = record.elapsed_s {
                    report.info.insert("Elapsed".into(), format!("{}s", elapsed));
                }
                if let Some(rss) = record.max_rss_mb {
                    report.info.insert("MaxRSS".into(), format!("{:.1}M", rss));
                }
            }
            Ok(None) => {}
            Err(e) => report.note = Some(format!("Could not read sacct info: {}", e)),
        }
    }

    let artifacts = find_artifacts(log_dir, job_id);
    if report.state == JobState::Unknown {
        report.state = state_from_artifacts(&artifacts);
    }
    report.stdout_path = artifacts.stdout;
    report.stderr_path = artifacts.stderr;
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_task_index_inference() {
        assert_eq!(infer_task_index("123_4"), Some(4));
        assert_eq!(infer_task_index("123"), None);
        assert_eq!(infer_task_index("_4"), None);
        assert_eq!(infer_task_index("123_x"), None);
    }

    #[test]
    fn test_artifact_heuristics() {
        let dir = TempDir::new().unwrap();
        assert_eq!(state_from_artifacts(&find_artifacts(dir.path(), "55")), JobState::Unknown);

        std::fs::write(dir.path().join("demo_55.out"), "hi").unwrap();
        std::fs::write(dir.path().join("demo_555.err"), "").unwrap();
        let artifacts = find_artifacts(dir.path(), "55");
        assert!(artifacts.stdout.is_some());
        assert!(artifacts.stderr.is_none());
        assert_eq!(state_from_artifacts(&artifacts), JobState::Running);

        std::fs::write(dir.path().join("demo_55.metrics"), "").unwrap();
        assert_eq!(state_from_artifacts(&find_artifacts(dir.path(), "55")), JobState::Completed);
    }

    #[test]
    fn test_status_falls_back_to_log_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("demo_987654_3.out"), "partial").unwrap();
        std::fs::write(dir.path().join("demo_987654_3.err"), "").unwrap();

        let report = tokio_test::block_on(job_status("987654_3", dir.path()));
        assert_eq!(report.task_index, Some(3));
        assert_eq!(report.state, JobState::Running);
        assert_eq!(report.stdout_path, Some(dir.path().join("demo_987654_3.out")));
        assert!(report.stderr_path.is_some());
    }

    #[test]
    fn test_missing_log_dir() {
        let artifacts = find_artifacts(Path::new("/nonexistent/paracore/logs"), "1");
        assert_eq!(artifacts, JobArtifacts::default());
    }

    #[test]
    fn test_report_display() {
        let report = JobStatusReport {
            job_id: "9_1".into(),
            state: JobState::Completed,
            task_index: Some(1),
            info: BTreeMap::new(),
            stdout_path: Some(PathBuf::from("logs/x_9_1.out")),
            stderr_path: None,
            note: Some("Slurm state unavailable".into()),
        };
        let text = report.to_string();
        assert!(text.starts_with("Job 9_1: COMPLETED"));
        assert!(text.contains("task index: 1"));
        assert!(text.contains("note: Slurm state unavailable"));
    }
}
