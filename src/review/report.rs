//! Report data contract handed to renderers.
//!
//! The pipeline freezes its surviving findings into a [`ReviewReport`].
//! JSON comes from serde; [`ReviewReport::to_markdown`] is a thin
//! summary rendering for terminals and PR comments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::scheduler::StageSummary;
use super::traits::{Finding, ProjectMetadata, Severity};

/// Session-level facts that accompany the findings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub project: ProjectMetadata,
    /// Items reviewed after filtering.
    pub total_items: usize,
    pub staged_items: usize,
    pub unstaged_items: usize,
    /// Items dropped by exclusion globs or the unstaged switch.
    pub excluded_items: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stages: Vec<StageSummary>,
    pub soft_failures: usize,
    pub data_quality_warnings: usize,
    /// Findings produced by the review stages.
    pub raw_findings: usize,
    /// Findings that received a confidence score.
    pub scored: usize,
    /// Scored findings dropped by the confidence thresholds.
    pub filtered_out: usize,
    /// Findings folded into another one by deduplication.
    pub merged: usize,
}

/// Final, frozen review output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewReport {
    pub session_id: String,
    pub findings: Vec<Finding>,
    pub metadata: ReportMetadata,
}

impl ReviewReport {
    pub fn count_by_severity(&self, severity: Severity) -> usize {
        self.findings.iter().filter(|f| f.severity == severity).count()
    }

    /// Whether any critical or high finding survived.
    pub fn has_blockers(&self) -> bool {
        self.findings
            .iter()
            .any(|f| matches!(f.severity, Severity::Critical | Severity::High))
    }

    pub fn to_markdown(&self) -> String {
        let meta = &self.metadata;
        let mut md = String::new();

        md.push_str("## Code Review Report\n\n");
        if !meta.project.module.is_empty() {
            md.push_str(&format!(
                "**Project**: `{}` {}\n\n",
                meta.project.module, meta.project.version
            ));
        }
        md.push_str(&format!(
            "**Files**: {} reviewed ({} staged, {} unstaged, {} excluded)\n\n",
            meta.total_items, meta.staged_items, meta.unstaged_items, meta.excluded_items
        ));
        md.push_str(&format!(
            "Critical: {} | High: {} | Medium: {} | Low: {} | Optimize: {}\n\n",
            self.count_by_severity(Severity::Critical),
            self.count_by_severity(Severity::High),
            self.count_by_severity(Severity::Medium),
            self.count_by_severity(Severity::Low),
            self.count_by_severity(Severity::Optimize),
        ));

        if self.findings.is_empty() {
            md.push_str("No issues found.\n");
        } else {
            md.push_str("| Severity | Category | Location | Confidence | Title |\n");
            md.push_str("|----------|----------|----------|------------|-------|\n");
            for f in &self.findings {
                let confidence = f
                    .confidence
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "-".into());
                md.push_str(&format!(
                    "| {} | {} | `{}` | {} | {} |\n",
                    f.severity.label(),
                    f.category,
                    f.location,
                    confidence,
                    f.title.replace('|', "\\|"),
                ));
            }

            for f in &self.findings {
                md.push_str(&format!("\n### [{}] {}\n\n", f.severity.label(), f.title));
                md.push_str(&format!("`{}`\n\n", f.location));
                if !f.description.is_empty() {
                    md.push_str(&format!("{}\n\n", f.description));
                }
                if !f.code_context.is_empty() {
                    md.push_str(&format!("```\n{}\n```\n\n", f.code_context));
                }
                if !f.suggestion.is_empty() {
                    md.push_str(&format!("**Suggestion**: {}\n", f.suggestion));
                }
            }
        }

        let elapsed = (meta.finished_at - meta.started_at).num_milliseconds();
        md.push_str(&format!(
            "\n*{} raw finding(s), {} scored, {} below threshold, {} merged; {} task failure(s), {} data-quality warning(s); completed in {}ms*\n",
            meta.raw_findings,
            meta.scored,
            meta.filtered_out,
            meta.merged,
            meta.soft_failures,
            meta.data_quality_warnings,
            elapsed,
        ));
        md
    }
}
