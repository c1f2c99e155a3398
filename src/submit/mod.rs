//! Job submission, handles and retry supervision

mod adapter;
mod handle;
mod pool;
pub(crate) mod retry;

pub use adapter::{JobTemplate, SubmissionAdapter};
pub use handle::JobHandle;
pub use pool::gather_ordered;
pub use retry::{
    AttemptRecord, FailureCause, LogicalTask, RetryOrchestrator, RetryPolicy, RetryState,
    TaskState,
};
