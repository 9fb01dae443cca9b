//! Confidence scoring and threshold filtering.
//!
//! Scoring is just another stage: one task per finding, run through the
//! same scheduler and dispatcher as the review workers. A finding whose
//! scorer fails is dropped, never kept by default.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::dispatcher::ScorerRunner;
use super::error::PipelineResult;
use super::scheduler::{SoftFailure, StageScheduler, StageSpec, StageSummary, TaskRunner};
use super::traits::{Finding, Scorer, Severity};

/// Name of the scoring stage in task ids and reports.
pub const SCORING_STAGE: &str = "scoring";

// ── Thresholds ───────────────────────────────────────────────────

/// Minimum confidence (inclusive) a finding needs to survive, per severity class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Critical and high findings.
    pub severe: u8,
    /// Medium and low findings.
    pub moderate: u8,
    /// Optimize-only suggestions.
    pub suggestion: u8,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            severe: 75,
            moderate: 80,
            suggestion: 60,
        }
    }
}

impl Thresholds {
    pub fn for_severity(&self, severity: Severity) -> u8 {
        match severity {
            Severity::Critical | Severity::High => self.severe,
            Severity::Medium | Severity::Low => self.moderate,
            Severity::Optimize => self.suggestion,
        }
    }

    /// Unscored findings never pass.
    pub fn keeps(&self, finding: &Finding) -> bool {
        finding
            .confidence
            .is_some_and(|c| c >= self.for_severity(finding.severity))
    }
}

/// Keep findings at or above their threshold; order is preserved.
pub fn filter(findings: Vec<Finding>, thresholds: &Thresholds) -> Vec<Finding> {
    findings
        .into_iter()
        .filter(|f| {
            let keep = thresholds.keeps(f);
            if !keep {
                tracing::debug!(
                    location = %f.location,
                    severity = %f.severity,
                    confidence = ?f.confidence,
                    "Finding below confidence threshold"
                );
            }
            keep
        })
        .collect()
}

// ── Scoring stage ────────────────────────────────────────────────

/// Scored findings plus the bookkeeping of the scoring stage.
#[derive(Debug, Clone)]
pub struct ScoringOutcome {
    /// Findings whose scorer succeeded, in input order.
    pub scored: Vec<Finding>,
    pub failures: Vec<SoftFailure>,
    pub summary: StageSummary,
}

/// Runs the scoring stage and applies thresholds.
pub struct ConfidenceFilter {
    scheduler: StageScheduler,
    scorer: Arc<dyn Scorer>,
    max_parallel: usize,
    task_timeout: Duration,
    thresholds: Thresholds,
}

impl ConfidenceFilter {
    pub fn new(scorer: Arc<dyn Scorer>, max_parallel: usize, task_timeout: Duration) -> Self {
        Self {
            scheduler: StageScheduler::new(),
            scorer,
            max_parallel,
            task_timeout,
            thresholds: Thresholds::default(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Attach a confidence to every finding whose scorer succeeds.
    pub async fn score(&self, findings: Vec<Finding>) -> PipelineResult<ScoringOutcome> {
        let mut spec = StageSpec::new(SCORING_STAGE, self.max_parallel, self.task_timeout);
        for finding in findings {
            spec.push_task(finding.location.to_string(), finding);
        }

        let runner: Arc<dyn TaskRunner<Finding, Finding>> =
            Arc::new(ScorerRunner::new(self.scorer.clone()));
        let report = self.scheduler.run_stage(spec, runner).await?;
        let summary = report.summary();
        let failures = report.soft_failures();
        let scored = report
            .into_successes()
            .into_iter()
            .map(|(_, finding)| finding)
            .collect();

        Ok(ScoringOutcome {
            scored,
            failures,
            summary,
        })
    }

    /// Apply this filter's thresholds.
    pub fn filter(&self, findings: Vec<Finding>) -> Vec<Finding> {
        filter(findings, &self.thresholds)
    }
}

// ── Tests ────────────────────────────────────────────────────────
