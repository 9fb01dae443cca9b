//! Multi-stage code review orchestration.
//!
//! Independent review workers each cover one category (correctness,
//! concurrency, error handling, security, observability, architecture).
//! The pipeline schedules them, scores what they report and merges the
//! survivors into one deterministic report:
//!
//! ```text
//! SourceProvider ─▸ SourceFilter ─▸ review stage(s) ─▸ aggregate
//!                                   (batched, capped)      │
//!                ┌─────────────────────────────────────────┘
//!                └─▸ scoring stage ─▸ thresholds ─▸ dedupe ─▸ ReviewReport
//! ```
//!
//! A failed or timed-out worker is a soft failure: its contribution is
//! dropped and the session still completes. Only infrastructure faults,
//! source failures and unusable configuration abort a session.
//!
//! ## Extension
//!
//! Add workers by implementing [`Analyzer`] or [`Scorer`] and registering
//! them with [`ReviewPipeline::with_analyzer`], or point the config at an
//! external command (see [`workers`]).

pub mod aggregator;
pub mod confidence;
pub mod dedup;
pub mod dispatcher;
pub mod error;
pub mod report;
pub mod scheduler;
pub mod session;
pub mod source;
pub mod traits;
pub mod workers;

#[allow(unused_imports)]
pub use confidence::{ConfidenceFilter, Thresholds};
#[allow(unused_imports)]
pub use dedup::Deduplicator;
#[allow(unused_imports)]
pub use dispatcher::{DataQualityWarning, TaskDispatcher};
#[allow(unused_imports)]
pub use error::{PipelineError, PipelineResult};
#[allow(unused_imports)]
pub use report::{ReportMetadata, ReviewReport};
#[allow(unused_imports)]
pub use scheduler::{FailurePolicy, PipelineRun, StageScheduler, StageSpec, TaskRunner};
#[allow(unused_imports)]
pub use session::{AbortReason, ReviewPipeline, ReviewSession, ReviewStage, SessionState};
#[allow(unused_imports)]
pub use source::{JsonFileSource, SourceFilter, SourceProvider, StaticSource};
#[allow(unused_imports)]
pub use traits::{
    Analyzer, Category, Finding, RawFinding, Scorer, Severity, SimilarityJudge, SourceBundle,
};
