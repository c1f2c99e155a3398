//! Progress reporting module
//!
//! Progress display for batches of logical tasks while the driver waits.

mod reporter;

pub use reporter::*;
