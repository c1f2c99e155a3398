//! Configuration module for Paracore
//!
//! Provides YAML profile layers, the resolver that flattens them with
//! call-site overrides, and the CLI arguments.

mod profile;
mod resolver;
mod settings;

pub use profile::*;
pub use resolver::*;
pub use settings::*;
