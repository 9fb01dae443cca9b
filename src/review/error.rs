//! Session-level error type for the review pipeline.
//!
//! Only conditions that end a session surface here. Individual worker
//! failures are soft and live in [`super::scheduler::TaskOutcome`];
//! rejected findings are data-quality warnings, not errors.

use super::session::SessionState;

/// Fatal pipeline error returned to the caller.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The dispatch substrate itself is unavailable (no runtime, closed
    /// limiter, cancelled task handle).
    #[error("dispatch infrastructure unavailable: {0}")]
    Infrastructure(String),

    /// A stage running under the abort policy lost a task.
    #[error("stage '{stage}' aborted after task {task} failed: {reason}")]
    StageAborted {
        stage: String,
        task: String,
        reason: String,
    },

    /// A stage specification that cannot be scheduled.
    #[error("invalid stage '{stage}': {reason}")]
    InvalidStage { stage: String, reason: String },

    /// The session was asked to move along an edge the state machine forbids.
    #[error("invalid session transition {from} -> {to}")]
    InvalidTransition { from: SessionState, to: SessionState },

    /// The source provider could not produce a unit of work.
    #[error("source discovery failed: {0}")]
    Source(#[source] anyhow::Error),

    /// The pipeline was assembled with an unusable configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

pub type PipelineResult<T> = Result<T, PipelineError>;
