//! Task dispatcher and finding normalization.
//!
//! [`TaskDispatcher`] wraps one opaque worker call with its timeout and
//! folds errors into a [`TaskOutcome`]. [`normalize`] turns raw worker
//! output into canonical [`Finding`]s, applying the severity rules at
//! ingestion instead of trusting each worker to follow them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::scheduler::{TaskOutcome, TaskRunner};
use super::traits::{
    Analyzer, Category, Finding, Location, RawFinding, ReviewPayload, Scorer, Severity, TaskId,
    WorkItem,
};

// ── Dispatcher ───────────────────────────────────────────────────

/// Invokes a worker for one work item under a timeout.
#[derive(Debug, Clone, Copy)]
pub struct TaskDispatcher {
    timeout: Duration,
}

impl TaskDispatcher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run the worker. Expiry drops the worker future, cancelling only this task.
    pub async fn invoke<P, T>(
        &self,
        item: &WorkItem<P>,
        runner: &dyn TaskRunner<P, T>,
    ) -> TaskOutcome<T> {
        match tokio::time::timeout(self.timeout, runner.run(item)).await {
            Ok(Ok(value)) => {
                tracing::debug!(task = %item.id, label = %item.label, "Task completed");
                TaskOutcome::Completed(value)
            }
            Ok(Err(e)) => TaskOutcome::Failed {
                reason: format!("{e:#}"),
            },
            Err(_) => TaskOutcome::TimedOut {
                after: self.timeout,
            },
        }
    }
}

// ── Normalization ────────────────────────────────────────────────

/// Why a raw finding was rejected or rewritten at ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WarningKind {
    /// No file path or start line; the finding was rejected.
    MissingLocation,
    /// Line range is zero-based or inverted; the finding was rejected.
    InvalidLineRange { start: u32, end: u32 },
    /// Exploitable security finding raised to its severity floor.
    SeverityPromoted { from: Severity, to: Severity },
    /// Architecture finding lowered to the suggestion tier.
    SeverityCapped { from: Severity, to: Severity },
    /// A field the worker sent could not be read; its default was applied.
    UnrecognizedValue { field: String, value: String },
}

/// Data-quality note attached to the session; never a pipeline fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataQualityWarning {
    pub task_id: TaskId,
    pub title: String,
    #[serde(flatten)]
    pub kind: WarningKind,
}

impl DataQualityWarning {
    /// Rejections drop the finding; promotions and caps keep it.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self.kind,
            WarningKind::MissingLocation | WarningKind::InvalidLineRange { .. }
        )
    }
}

/// Accepted findings of one task plus the notes produced on the way.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedFindings {
    pub findings: Vec<Finding>,
    pub warnings: Vec<DataQualityWarning>,
}

/// Minimum severity for a security finding with the given exploitability.
pub fn security_floor(exploitable: bool, remote: bool) -> Option<Severity> {
    match (exploitable, remote) {
        (true, true) => Some(Severity::Critical),
        (true, false) => Some(Severity::High),
        _ => None,
    }
}

/// Validate and canonicalize raw worker output for one task.
pub fn normalize(task_id: &TaskId, task_category: Category, raw: Vec<RawFinding>) -> NormalizedFindings {
    let mut out = NormalizedFindings::default();

    for r in raw {
        let warn = |kind| DataQualityWarning {
            task_id: task_id.clone(),
            title: r.title.clone(),
            kind,
        };
        for u in &r.unrecognized {
            out.warnings.push(warn(WarningKind::UnrecognizedValue {
                field: u.field.clone(),
                value: u.value.clone(),
            }));
        }

        let path = match r.file_path.as_deref().map(str::trim) {
            Some(p) if !p.is_empty() => p.to_string(),
            _ => {
                out.warnings.push(warn(WarningKind::MissingLocation));
                continue;
            }
        };
        let Some(start) = r.start_line else {
            out.warnings.push(warn(WarningKind::MissingLocation));
            continue;
        };
        let end = r.end_line.unwrap_or(start);
        if start == 0 || end < start {
            out.warnings
                .push(warn(WarningKind::InvalidLineRange { start, end }));
            continue;
        }

        let category = r.category.unwrap_or(task_category);
        let reported = r.severity.unwrap_or(Severity::Medium);
        let mut severity = reported;

        if category == Category::Security {
            if let Some(floor) = security_floor(r.exploitable, r.remote) {
                if severity < floor {
                    severity = floor;
                    out.warnings.push(warn(WarningKind::SeverityPromoted {
                        from: reported,
                        to: floor,
                    }));
                }
            }
        }
        if category == Category::Architecture && severity > Severity::Optimize {
            severity = Severity::Optimize;
            out.warnings.push(warn(WarningKind::SeverityCapped {
                from: reported,
                to: Severity::Optimize,
            }));
        }

        out.findings.push(Finding {
            location: Location::new(path, start, end),
            category,
            severity,
            confidence: None,
            title: r.title,
            description: r.description,
            code_context: r.code_context,
            suggestion: r.suggestion,
            exploitable: r.exploitable,
            remote: r.remote,
            source_task_id: task_id.clone(),
            merged_from: Vec::new(),
        });
    }

    for w in &out.warnings {
        tracing::warn!(task = %w.task_id, title = %w.title, kind = ?w.kind, "Data-quality warning");
    }
    out
}

// ── Runners ──────────────────────────────────────────────────────

/// Routes review tasks to the analyzer registered for their category.
pub struct AnalyzerRunner {
    analyzers: HashMap<Category, Arc<dyn Analyzer>>,
}

impl AnalyzerRunner {
    pub fn new(analyzers: HashMap<Category, Arc<dyn Analyzer>>) -> Self {
        Self { analyzers }
    }
}

#[async_trait]
impl TaskRunner<ReviewPayload, NormalizedFindings> for AnalyzerRunner {
    async fn run(&self, item: &WorkItem<ReviewPayload>) -> anyhow::Result<NormalizedFindings> {
        let category = item.payload.category;
        let analyzer = self
            .analyzers
            .get(&category)
            .ok_or_else(|| anyhow::anyhow!("no analyzer registered for {category}"))?;

        tracing::info!(task = %item.id, analyzer = analyzer.id(), %category, "Running review task");
        let raw = analyzer.analyze(item).await?;
        Ok(normalize(&item.id, category, raw))
    }
}

/// Attaches a confidence score to one finding.
pub struct ScorerRunner {
    scorer: Arc<dyn Scorer>,
}

impl ScorerRunner {
    pub fn new(scorer: Arc<dyn Scorer>) -> Self {
        Self { scorer }
    }
}

#[async_trait]
impl TaskRunner<Finding, Finding> for ScorerRunner {
    async fn run(&self, item: &WorkItem<Finding>) -> anyhow::Result<Finding> {
        let score = self.scorer.score(&item.payload).await?;
        if score > 100 {
            anyhow::bail!("scorer {} returned {score}, outside 0..=100", self.scorer.id());
        }
        let mut finding = item.payload.clone();
        finding.confidence = Some(score);
        Ok(finding)
    }
}

// ── Tests ────────────────────────────────────────────────────────
