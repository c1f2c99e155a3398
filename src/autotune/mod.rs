//! Pilot-based resource autotuning
//!
//! A pilot submits a random sample of the workload with guessed resources,
//! measures wall time and peak memory of each sample, and derives a
//! recommendation for the full run with a fixed safety margin.

mod pilot;
mod recommendation;
pub mod stats;

pub use pilot::{
    AutotunePilot, PilotReport, PilotRequest, PilotSample, DEFAULT_PILOT_RETRIES,
    DEFAULT_SAMPLE_SIZE,
};
pub use recommendation::{MeasurementMode, Recommendation, ResourceGuesses, HEADROOM};
