//! Error kinds of the planner/executor core.
//!
//! Errors from validation and optimisation are synchronous and abort the run
//! before any job starts. Errors from individual jobs inside a concurrent
//! layer are captured per job so sibling jobs complete; the layer then fails
//! atomically. Cancellation is its own kind and is never conflated with job
//! failure. No automatic retries happen at this level; retry is the underlying
//! runtime's concern.
//!
//! All public entry points return [`anyhow::Result`]; callers that need to
//! distinguish kinds downcast to [`ScoobiError`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScoobiError {
    /// The graph does not type-check in shape, a sink is written twice, an
    /// input source is missing. Raised before execution.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A rewrite produced a malformed graph. Internal; carries a dump of the
    /// offending node and its neighbourhood.
    #[error("optimiser invariant violated: {0}")]
    OptimiserInvariant(String),

    /// A batch job returned a non-success status. The layer completed before
    /// this surfaced.
    #[error("job {name} failed: {reason}")]
    JobFailure { name: String, reason: String },

    /// The run was cancelled cooperatively.
    #[error("execution cancelled")]
    Cancelled,

    /// I/O failure during bridge read or sink write. Fatal for the run.
    #[error("i/o failure: {0}")]
    Io(String),
}

impl ScoobiError {
    /// Whether this error is the cancellation kind.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ScoobiError::Cancelled)
    }
}
