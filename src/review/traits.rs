//! Data model and strategy traits for the review pipeline.
//!
//! Concrete workers (external commands, rule engines, model calls)
//! implement [`Analyzer`] and [`Scorer`]; the [`super::ReviewPipeline`]
//! schedules them in stages and never looks inside.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

// ── Severity ─────────────────────────────────────────────────────

/// Severity class of a finding. Variant order is rank order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Optimization or design suggestion only.
    #[serde(alias = "optimize_only", alias = "suggestion", alias = "info")]
    Optimize,
    /// Minor issue.
    Low,
    /// Should be addressed but not urgent.
    Medium,
    /// Important issue that should be fixed before merge.
    High,
    /// Must-fix: crashes, data loss, remotely exploitable holes.
    Critical,
}

impl Severity {
    pub fn label(self) -> &'static str {
        match self {
            Self::Optimize => "OPTIMIZE",
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }

    /// Parse a worker-supplied label. Case-insensitive; `-`, `_` and spaces
    /// are interchangeable.
    pub fn from_label(label: &str) -> Option<Self> {
        match fold_label(label).as_str() {
            "optimize" | "optimize_only" | "suggestion" | "info" | "nit" => Some(Self::Optimize),
            "low" | "minor" => Some(Self::Low),
            "medium" | "moderate" | "warning" => Some(Self::Medium),
            "high" | "major" | "error" => Some(Self::High),
            "critical" | "blocker" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ── Category ─────────────────────────────────────────────────────

/// Review dimension a worker is responsible for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Correctness and memory/nil safety.
    #[serde(alias = "safety")]
    Correctness,
    /// Concurrency and performance.
    #[serde(alias = "performance")]
    Concurrency,
    ErrorHandling,
    Security,
    Observability,
    /// Design-level remarks; always capped to [`Severity::Optimize`].
    Architecture,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Correctness,
        Category::Concurrency,
        Category::ErrorHandling,
        Category::Security,
        Category::Observability,
        Category::Architecture,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Correctness => "correctness",
            Self::Concurrency => "concurrency",
            Self::ErrorHandling => "error_handling",
            Self::Security => "security",
            Self::Observability => "observability",
            Self::Architecture => "architecture",
        }
    }

    /// Lenient counterpart of [`Severity::from_label`] for categories.
    pub fn from_label(label: &str) -> Option<Self> {
        match fold_label(label).as_str() {
            "correctness" | "safety" => Some(Self::Correctness),
            "concurrency" | "performance" => Some(Self::Concurrency),
            "error_handling" | "errors" => Some(Self::ErrorHandling),
            "security" => Some(Self::Security),
            "observability" | "logging" => Some(Self::Observability),
            "architecture" | "design" => Some(Self::Architecture),
            _ => None,
        }
    }
}

fn fold_label(label: &str) -> String {
    label.trim().to_ascii_lowercase().replace(['-', ' '], "_")
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Task identity ────────────────────────────────────────────────

/// Identifies one task: the stage it ran in and its slot within the stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId {
    pub stage: String,
    pub slot: usize,
}

impl TaskId {
    pub fn new(stage: impl Into<String>, slot: usize) -> Self {
        Self {
            stage: stage.into(),
            slot,
        }
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.stage, self.slot)
    }
}

/// One unit of work handed to a worker. Immutable once built.
#[derive(Debug, Clone)]
pub struct WorkItem<P> {
    pub id: TaskId,
    /// Short human label used in logs (e.g. the category name).
    pub label: String,
    pub payload: P,
}

impl<P> WorkItem<P> {
    pub fn new(id: TaskId, label: impl Into<String>, payload: P) -> Self {
        Self {
            id,
            label: label.into(),
            payload,
        }
    }
}

// ── Source input ─────────────────────────────────────────────────

/// One file in the unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceItem {
    pub path: String,
    #[serde(default)]
    pub content: String,
    /// Unified diff fragment when reviewing a changeset.
    #[serde(default)]
    pub diff: Option<String>,
    #[serde(default)]
    pub staged: bool,
}

/// Project identity passed through to workers and the report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectMetadata {
    #[serde(default)]
    pub module: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub key_dependencies: Vec<String>,
}

/// Everything the source provider hands to the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceBundle {
    #[serde(default)]
    pub items: Vec<SourceItem>,
    #[serde(default)]
    pub metadata: ProjectMetadata,
}

/// Payload of a review task: one category over the shared source items.
#[derive(Debug, Clone)]
pub struct ReviewPayload {
    pub category: Category,
    pub items: Arc<Vec<SourceItem>>,
    pub metadata: Arc<ProjectMetadata>,
}

// ── Findings ─────────────────────────────────────────────────────

/// File path plus an inclusive, 1-based line range.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub path: String,
    pub start_line: u32,
    pub end_line: u32,
}

impl Location {
    pub fn new(path: impl Into<String>, start_line: u32, end_line: u32) -> Self {
        Self {
            path: path.into(),
            start_line,
            end_line,
        }
    }

    /// Same file and a non-empty line intersection.
    pub fn overlaps(&self, other: &Location) -> bool {
        self.path == other.path
            && self.start_line <= other.end_line
            && other.start_line <= self.end_line
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.start_line == self.end_line {
            write!(f, "{}:{}", self.path, self.start_line)
        } else {
            write!(f, "{}:{}-{}", self.path, self.start_line, self.end_line)
        }
    }
}

/// A finding as reported by a worker, before normalization.
///
/// Deserialization never fails on a single bad field: values that cannot be
/// read are left unset and listed in `unrecognized`, so normalization can
/// default or reject that one finding with a warning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "RawFindingWire")]
pub struct RawFinding {
    pub file_path: Option<String>,
    pub start_line: Option<u32>,
    pub end_line: Option<u32>,
    /// Falls back to the category of the task that produced it.
    pub category: Option<Category>,
    pub severity: Option<Severity>,
    pub exploitable: bool,
    pub remote: bool,
    pub title: String,
    pub description: String,
    pub code_context: String,
    pub suggestion: String,
    #[serde(skip)]
    pub unrecognized: Vec<UnrecognizedValue>,
}

/// A worker-supplied value that could not be interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnrecognizedValue {
    pub field: String,
    pub value: String,
}

impl UnrecognizedValue {
    const MAX_CHARS: usize = 80;

    pub fn new(field: impl Into<String>, value: &Value) -> Self {
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Self {
            field: field.into(),
            value: text.chars().take(Self::MAX_CHARS).collect(),
        }
    }
}

/// Wire shape of [`RawFinding`]: every field accepts any JSON value.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawFindingWire {
    file_path: Option<Value>,
    start_line: Option<Value>,
    end_line: Option<Value>,
    category: Option<Value>,
    severity: Option<Value>,
    exploitable: Option<Value>,
    remote: Option<Value>,
    title: Option<Value>,
    description: Option<Value>,
    code_context: Option<Value>,
    suggestion: Option<Value>,
}

impl From<RawFindingWire> for RawFinding {
    fn from(w: RawFindingWire) -> Self {
        let mut unrecognized = Vec::new();
        let file_path = match w.file_path {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(other) => {
                unrecognized.push(UnrecognizedValue::new("file_path", &other));
                None
            }
        };
        let start_line = read_line("start_line", w.start_line, &mut unrecognized);
        let end_line = read_line("end_line", w.end_line, &mut unrecognized);
        let category = read_label("category", w.category, Category::from_label, &mut unrecognized);
        let severity = read_label("severity", w.severity, Severity::from_label, &mut unrecognized);

        Self {
            file_path,
            start_line,
            end_line,
            category,
            severity,
            exploitable: read_flag(w.exploitable),
            remote: read_flag(w.remote),
            title: read_text(w.title),
            description: read_text(w.description),
            code_context: read_text(w.code_context),
            suggestion: read_text(w.suggestion),
            unrecognized,
        }
    }
}

fn read_label<T>(
    field: &str,
    value: Option<Value>,
    parse: fn(&str) -> Option<T>,
    unrecognized: &mut Vec<UnrecognizedValue>,
) -> Option<T> {
    let value = value.filter(|v| !v.is_null())?;
    let parsed = value.as_str().and_then(parse);
    if parsed.is_none() {
        unrecognized.push(UnrecognizedValue::new(field, &value));
    }
    parsed
}

fn read_line(field: &str, value: Option<Value>, unrecognized: &mut Vec<UnrecognizedValue>) -> Option<u32> {
    let value = value.filter(|v| !v.is_null())?;
    let parsed = match &value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    if parsed.is_none() {
        unrecognized.push(UnrecognizedValue::new(field, &value));
    }
    parsed
}

fn read_flag(value: Option<Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => b,
        Some(Value::String(s)) => s.trim().eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn read_text(value: Option<Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
    }
}

/// Canonical, normalized finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub location: Location,
    pub category: Category,
    pub severity: Severity,
    /// Populated by the confidence stage.
    pub confidence: Option<u8>,
    pub title: String,
    pub description: String,
    pub code_context: String,
    pub suggestion: String,
    pub exploitable: bool,
    pub remote: bool,
    pub source_task_id: TaskId,
    /// Tasks whose findings were folded into this one by deduplication.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merged_from: Vec<TaskId>,
}

// ── Strategy traits ──────────────────────────────────────────────

/// An opaque review worker.
///
/// Implementations may be rule engines, remote services or model calls.
/// They only see the work item; scheduling, timeouts and normalization
/// are the pipeline's job.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Identifier used in logs (e.g. "security-reviewer").
    fn id(&self) -> &str;

    /// Review the payload and report raw findings.
    async fn analyze(&self, item: &WorkItem<ReviewPayload>) -> anyhow::Result<Vec<RawFinding>>;
}

/// An opaque confidence scorer returning a score in `0..=100` for a finding.
#[async_trait]
pub trait Scorer: Send + Sync {
    fn id(&self) -> &str;

    async fn score(&self, finding: &Finding) -> anyhow::Result<u8>;
}

/// Decides whether two co-located findings describe the same defect.
///
/// Deduplication is idempotent only for judges that look at fields a merge
/// keeps from its canonical member (category, title, location, source
/// task). A judge that reads severity, confidence or the merged texts may
/// pair a merged finding with a new neighbour on a second pass.
pub trait SimilarityJudge: Send + Sync {
    fn similar(&self, a: &Finding, b: &Finding) -> bool;
}

impl<F> SimilarityJudge for F
where
    F: Fn(&Finding, &Finding) -> bool + Send + Sync,
{
    fn similar(&self, a: &Finding, b: &Finding) -> bool {
        self(a, b)
    }
}

/// Default judge: findings of the same category share a root cause.
#[derive(Debug, Clone, Copy, Default)]
pub struct SameCategory;

impl SimilarityJudge for SameCategory {
    fn similar(&self, a: &Finding, b: &Finding) -> bool {
        a.category == b.category
    }
}

// ── Tests ────────────────────────────────────────────────────────
