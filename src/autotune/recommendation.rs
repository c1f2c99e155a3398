//! Resource recommendations derived from pilot measurements

use super::stats;
use crate::error::{IoResultExt, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Safety margin applied to measured time and memory
pub const HEADROOM: f64 = 1.3;

/// Items per concurrent array task when the cluster sets no cap
const ITEMS_PER_SLOT: f64 = 4.0;

/// What the pilot measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementMode {
    TimeOnly,
    #[default]
    TimeAndRss,
}

impl MeasurementMode {
    pub fn measures_memory(&self) -> bool {
        matches!(self, Self::TimeAndRss)
    }
}

/// Initial resource guesses used to run the pilot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGuesses {
    pub cpus_per_task: u32,
    pub mem_gb: u32,
    pub time_min: u32,
}

impl Default for ResourceGuesses {
    fn default() -> Self {
        Self {
            cpus_per_task: 4,
            mem_gb: 8,
            time_min: 30,
        }
    }
}

/// Suggested resources for the full run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    pub time_min: u32,
    pub mem_gb: u32,
    pub cpus_per_task: u32,
    pub array_parallelism: u32,
}

impl Recommendation {
    /// Derive a recommendation from successful sample measurements.
    ///
    /// `durations_s` must be non-empty; memory falls back to the guess when
    /// nothing was measured.
    pub fn from_measurements(
        durations_s: &[f64],
        memory_mb: &[f64],
        guesses: &ResourceGuesses,
        workload_size: usize,
        max_array_parallelism: Option<u32>,
    ) -> Option<Self> {
        let p95 = stats::p95(durations_s)?;
        let time_min = ((p95 * HEADROOM / 60.0).ceil() as u32).max(1);

        let mem_gb = match stats::max(memory_mb) {
            Some(peak) if peak > 0.0 => ((peak * HEADROOM / 1024.0).ceil() as u32).max(1),
            _ => guesses.mem_gb,
        };

        let array_parallelism = match max_array_parallelism {
            Some(cap) => cap,
            None => ((workload_size as f64 / ITEMS_PER_SLOT).ceil() as u32).max(1),
        };

        Some(Self {
            time_min,
            mem_gb,
            cpus_per_task: guesses.cpus_per_task,
            array_parallelism,
        })
    }

    /// `export` lines for sourcing in a shell
    pub fn shell_exports(&self) -> String {
        format!(
            "export PARACORE_TIME={}\nexport PARACORE_MEMORY={}\nexport PARACORE_CPUS={}\nexport PARACORE_PARALLEL={}\n",
            self.time_min, self.mem_gb, self.cpus_per_task, self.array_parallelism
        )
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the recommendation as pretty JSON
    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_path(parent)?;
        }
        std::fs::write(path, self.to_json()? + "\n").with_path(path)
    }
}
