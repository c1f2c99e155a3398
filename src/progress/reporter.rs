//! Batch progress reporter
//!
//! Uses indicatif for:
//! - Task count progress with succeeded/failed counters
//! - A status line naming the last finished task
//! - A hidden mode for quiet or non-TTY runs

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Progress reporter for a batch of logical tasks
pub struct BatchProgress {
    /// Multi-progress container
    multi: MultiProgress,
    /// Task count bar
    tasks_bar: ProgressBar,
    /// Current status message
    status: ProgressBar,
    start_time: Instant,
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    enabled: AtomicBool,
}

impl BatchProgress {
    /// Create a new reporter for `total` tasks
    pub fn new(total: u64) -> Self {
        let multi = MultiProgress::new();

        let status = multi.add(ProgressBar::new_spinner());
        status.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        status.enable_steady_tick(Duration::from_millis(120));

        let tasks_bar = multi.add(ProgressBar::new(total));
        tasks_bar.set_style(
            ProgressStyle::default_bar()
                .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} tasks ({percent}%, {elapsed_precise})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        tasks_bar.set_prefix("Tasks");

        Self {
            multi,
            tasks_bar,
            status,
            start_time: Instant::now(),
            total: AtomicU64::new(total),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            enabled: AtomicBool::new(true),
        }
    }

    /// Create a hidden reporter (quiet mode)
    pub fn disabled(total: u64) -> Self {
        let reporter = Self::new(total);
        reporter.enabled.store(false, Ordering::SeqCst);
        reporter.status.disable_steady_tick();
        reporter.multi.set_draw_target(ProgressDrawTarget::hidden());
        reporter
    }

    /// Set current status message
    pub fn set_status(&self, msg: &str) {
        self.status.set_message(msg.to_string());
    }

    /// Record one finished task
    pub fn task_finished(&self, label: &str, success: bool) {
        let (counter, mark) = if success {
            (&self.succeeded, style("✓").green())
        } else {
            (&self.failed, style("✗").red())
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.tasks_bar.inc(1);
        self.status.set_message(format!("{} {}", mark, label));
    }

    /// Get elapsed time
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Finish progress with a summary line
    pub fn finish(&self) {
        let summary = self.summary();
        let message = format!(
            "{} succeeded, {} failed in {:.1?}",
            summary.succeeded, summary.failed, summary.elapsed
        );
        if summary.failed == 0 {
            self.status.finish_with_message(format!("✓ {}", message));
            self.tasks_bar.finish();
        } else {
            self.status.finish_with_message(format!("✗ {}", message));
            self.tasks_bar.abandon();
        }
    }

    /// Check if progress is drawn
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> ProgressSummary {
        ProgressSummary {
            total: self.total.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
        }
    }
}

/// Progress summary
#[derive(Debug, Clone)]
pub struct ProgressSummary {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub elapsed: Duration,
}

impl ProgressSummary {
    /// Get completion percentage
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            ((self.succeeded + self.failed) as f64 / self.total as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_progress_counts() {
        let progress = BatchProgress::disabled(4);
        progress.task_finished("task 0", true);
        progress.task_finished("task 1", false);
        progress.task_finished("task 2", true);

        let summary = progress.summary();
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.percentage(), 75.0);
        assert!(!progress.is_enabled());
        progress.finish();
    }

    #[test]
    fn test_empty_batch_percentage() {
        assert_eq!(BatchProgress::disabled(0).summary().percentage(), 0.0);
    }
}
