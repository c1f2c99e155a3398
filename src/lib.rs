//! # Paracore - Slurm job submission orchestration
//!
//! Paracore submits shell commands and registered functions to a Slurm
//! cluster (or local subprocesses) from layered YAML profiles, supervises
//! every logical task with retries, and recommends resources from pilot runs.
//!
//! ## Features
//!
//! - **Layered configuration**: built-in defaults, `~/.paracore.yaml`,
//!   `./paracore.yaml`, then per-call overrides, merged field by field
//! - **Bounded job names**: `{tag}` templates with hash-suffixed truncation
//! - **Environment control**: inherit or replace the submitting environment
//! - **Array jobs**: one submission for many items with a parallelism cap
//! - **Retries**: exponential backoff with jitter and a full attempt history
//! - **Autotuning**: p95 wall time and peak memory from a random sample
//!
//! ## Quick Start
//!
//! ```no_run
//! use paracore::config::{ConfigLayers, ConfigResolver};
//! use paracore::core::{Paracore, SubmitOptions};
//! use paracore::provider::SlurmProvider;
//! use std::sync::Arc;
//!
//! # async fn demo() -> paracore::Result<()> {
//! let resolver = ConfigResolver::new(&ConfigLayers::discover(None)?);
//! let paracore = Paracore::new(resolver, Arc::new(SlurmProvider::new()));
//!
//! let task = paracore.run_cmd("hostname", &SubmitOptions::default()).await?;
//! println!("{}", task.wait().await?.value);
//! # Ok(())
//! # }
//! ```
//!
//! ## Array Jobs
//!
//! ```no_run
//! use paracore::config::{CallOverrides, ConfigResolver};
//! use paracore::core::{Paracore, SubmitOptions};
//! use paracore::provider::LocalProvider;
//! use std::sync::Arc;
//!
//! # async fn demo() -> paracore::Result<()> {
//! let paracore = Paracore::new(ConfigResolver::builtin(), Arc::new(LocalProvider::new()));
//! let options = SubmitOptions {
//!     overrides: CallOverrides {
//!         array_parallelism: Some(2),
//!         retries: Some(3),
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! };
//!
//! let batch = paracore.map_cmds(&["echo a", "echo b", "echo c"], &options).await?;
//! let values = batch.results(None).await?;
//! assert_eq!(values.len(), 3);
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod autotune;
pub mod config;
pub mod core;
pub mod environment;
pub mod error;
pub mod naming;
pub mod progress;
pub mod provider;
pub mod status;
pub mod submit;

// Re-export commonly used types
pub use config::{CallOverrides, ConfigResolver, EffectiveConfig};
pub use core::{BatchSubmission, Paracore, SubmitOptions};
pub use error::{ParacoreError, Result};
pub use submit::{JobHandle, RetryPolicy};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    //! Convenient re-exports for common usage
    //!
    //! ```no_run
    //! use paracore::prelude::*;
    //! ```

    pub use crate::autotune::{MeasurementMode, PilotRequest, Recommendation, ResourceGuesses};
    pub use crate::config::{CallOverrides, ConfigLayers, ConfigResolver, EffectiveConfig};
    pub use crate::core::{BatchSubmission, Paracore, SubmitOptions};
    pub use crate::environment::{MergeMode, ParentEnvironment};
    pub use crate::error::{ParacoreError, Result};
    pub use crate::provider::{FunctionRegistry, LocalProvider, Payload, SlurmProvider};
    pub use crate::submit::{JobHandle, LogicalTask, RetryPolicy};
}
