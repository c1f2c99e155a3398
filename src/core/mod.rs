//! High-level submission API
//!
//! Ties configuration, naming, environment composition, submission and retry
//! supervision together behind one client.

mod batch;
mod client;

pub use batch::BatchSubmission;
pub use client::{Paracore, SubmitOptions};
