//! Staged, fault-tolerant orchestration of code review workers.
//!
//! See [`review`] for the pipeline and [`config`] for the TOML settings
//! the `review-orchestrator` binary reads.

pub mod config;
pub mod review;
