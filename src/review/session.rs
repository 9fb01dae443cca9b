//! Review session: state machine and end-to-end orchestration.
//!
//! A [`ReviewPipeline`] is assembled once (source, analyzers, scorer,
//! stage layout) and each [`ReviewPipeline::run`] produces one
//! [`ReviewSession`]:
//!
//! ```text
//! Idle -> Discovering -> Reviewing -> Scoring -> Aggregating -> Done
//!              |
//!              +-> Aborted(NoWork)
//! ```
//!
//! Any non-terminal state may move to `Aborted(Error)`.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::aggregator;
use super::confidence::{ConfidenceFilter, Thresholds};
use super::dedup::Deduplicator;
use super::dispatcher::{AnalyzerRunner, DataQualityWarning, NormalizedFindings};
use super::error::{PipelineError, PipelineResult};
use super::report::{ReportMetadata, ReviewReport};
use super::scheduler::{
    PipelineRun, SoftFailure, StageScheduler, StageSpec, StageSummary, TaskRunner,
};
use super::source::{SourceFilter, SourceProvider};
use super::traits::{
    Analyzer, Category, Finding, ProjectMetadata, ReviewPayload, SameCategory, Scorer,
    SimilarityJudge, SourceItem,
};
use super::workers::{CommandAnalyzer, CommandLine, CommandScorer};
use crate::config::Config;

// ── State machine ────────────────────────────────────────────────

/// Why a session ended without a report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// Discovery produced nothing to review.
    NoWork,
    /// A fatal pipeline error.
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Discovering,
    Reviewing,
    Scoring,
    Aggregating,
    Done,
    Aborted(AbortReason),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Aborted(_))
    }

    pub fn can_transition_to(&self, next: &SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Idle, Discovering)
            | (Discovering, Reviewing)
            | (Discovering, Aborted(AbortReason::NoWork))
            | (Reviewing, Scoring)
            | (Scoring, Aggregating)
            | (Aggregating, Done) => true,
            (from, Aborted(AbortReason::Error(_))) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Discovering => write!(f, "discovering"),
            Self::Reviewing => write!(f, "reviewing"),
            Self::Scoring => write!(f, "scoring"),
            Self::Aggregating => write!(f, "aggregating"),
            Self::Done => write!(f, "done"),
            Self::Aborted(AbortReason::NoWork) => write!(f, "aborted (no work)"),
            Self::Aborted(AbortReason::Error(e)) => write!(f, "aborted ({e})"),
        }
    }
}

// ── Session ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
struct SourceTally {
    project: ProjectMetadata,
    total: usize,
    staged: usize,
    unstaged: usize,
    excluded: usize,
}

#[derive(Debug, Clone, Default)]
struct FindingTally {
    raw: usize,
    scored: usize,
    filtered_out: usize,
    merged: usize,
}

/// One review invocation. Owns its findings exclusively.
#[derive(Debug, Clone)]
pub struct ReviewSession {
    id: String,
    state: SessionState,
    started_at: DateTime<Utc>,
    stages: Vec<StageSummary>,
    findings: Vec<Finding>,
    soft_failures: Vec<SoftFailure>,
    warnings: Vec<DataQualityWarning>,
    source: SourceTally,
    tally: FindingTally,
    report: Option<ReviewReport>,
}

impl Default for ReviewSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ReviewSession {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            state: SessionState::Idle,
            started_at: Utc::now(),
            stages: Vec::new(),
            findings: Vec::new(),
            soft_failures: Vec::new(),
            warnings: Vec::new(),
            source: SourceTally::default(),
            tally: FindingTally::default(),
            report: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Summaries of every stage that ran, scoring included.
    pub fn stages(&self) -> &[StageSummary] {
        &self.stages
    }

    /// Current findings. Final and ordered once the session is `Done`.
    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    pub fn soft_failures(&self) -> &[SoftFailure] {
        &self.soft_failures
    }

    pub fn warnings(&self) -> &[DataQualityWarning] {
        &self.warnings
    }

    /// Present only when the session reached `Done`.
    pub fn report(&self) -> Option<&ReviewReport> {
        self.report.as_ref()
    }

    pub fn into_report(self) -> Option<ReviewReport> {
        self.report
    }

    /// Move along a permitted edge of the state machine.
    pub fn transition(&mut self, next: SessionState) -> PipelineResult<()> {
        if !self.state.can_transition_to(&next) {
            return Err(PipelineError::InvalidTransition {
                from: self.state.clone(),
                to: next,
            });
        }
        tracing::debug!(session = %self.id, from = %self.state, to = %next, "Session transition");
        self.state = next;
        Ok(())
    }

    fn abort(&mut self, error: &PipelineError) {
        if !self.state.is_terminal() {
            self.state = SessionState::Aborted(AbortReason::Error(error.to_string()));
        }
    }

    fn freeze(&self) -> ReviewReport {
        ReviewReport {
            session_id: self.id.clone(),
            findings: self.findings.clone(),
            metadata: ReportMetadata {
                project: self.source.project.clone(),
                total_items: self.source.total,
                staged_items: self.source.staged,
                unstaged_items: self.source.unstaged,
                excluded_items: self.source.excluded,
                started_at: self.started_at,
                finished_at: Utc::now(),
                stages: self.stages.clone(),
                soft_failures: self.soft_failures.len(),
                data_quality_warnings: self.warnings.len(),
                raw_findings: self.tally.raw,
                scored: self.tally.scored,
                filtered_out: self.tally.filtered_out,
                merged: self.tally.merged,
            },
        }
    }
}

// ── Pipeline ─────────────────────────────────────────────────────

/// One review stage: the categories it dispatches and its cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewStage {
    pub name: String,
    pub max_parallel: usize,
    pub categories: Vec<Category>,
}

impl ReviewStage {
    pub fn new(name: impl Into<String>, max_parallel: usize, categories: Vec<Category>) -> Self {
        Self {
            name: name.into(),
            max_parallel,
            categories,
        }
    }
}

impl Default for ReviewStage {
    /// Single `review` stage over every category, two at a time.
    fn default() -> Self {
        Self::new("review", 2, Category::ALL.to_vec())
    }
}

/// Assembled review pipeline. Reusable across sessions.
pub struct ReviewPipeline<J = SameCategory> {
    scheduler: StageScheduler,
    source: Arc<dyn SourceProvider>,
    filter: SourceFilter,
    analyzers: HashMap<Category, Arc<dyn Analyzer>>,
    stages: Vec<ReviewStage>,
    review_timeout: Duration,
    scorer: Arc<dyn Scorer>,
    scoring_parallel: usize,
    scoring_timeout: Duration,
    thresholds: Thresholds,
    dedup: Deduplicator<J>,
}

impl ReviewPipeline<SameCategory> {
    pub fn new(source: Arc<dyn SourceProvider>, scorer: Arc<dyn Scorer>) -> Self {
        Self {
            scheduler: StageScheduler::new(),
            source,
            filter: SourceFilter::default(),
            analyzers: HashMap::new(),
            stages: vec![ReviewStage::default()],
            review_timeout: Duration::from_secs(600),
            scorer,
            scoring_parallel: 5,
            scoring_timeout: Duration::from_secs(120),
            thresholds: Thresholds::default(),
            dedup: Deduplicator::new(SameCategory),
        }
    }

    /// Build a pipeline backed by the external workers named in `config`.
    pub fn from_config(config: &Config, source: Arc<dyn SourceProvider>) -> anyhow::Result<Self> {
        config.validate()?;

        let scorer_cfg = config
            .scorer
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("No [scorer] configured"))?;
        let scorer = Arc::new(CommandScorer::new(
            scorer_cfg.command.clone(),
            CommandLine::new(scorer_cfg.command.clone(), scorer_cfg.args.clone()),
        ));

        let mut pipeline = Self::new(source, scorer)
            .with_filter(config.source.filter()?)
            .with_review_timeout(config.review.task_timeout())
            .with_scoring(config.scoring.max_parallel, config.scoring.task_timeout())
            .with_thresholds(config.thresholds)
            .with_stages(
                config
                    .review
                    .effective_stages()
                    .into_iter()
                    .map(|s| {
                        let cap = s.max_parallel.unwrap_or(config.review.max_parallel);
                        ReviewStage::new(s.name, cap, s.categories)
                    })
                    .collect(),
            );

        let mut owners: HashMap<Category, &str> = HashMap::new();
        for analyzer in &config.analyzers {
            let worker: Arc<dyn Analyzer> = Arc::new(CommandAnalyzer::new(
                analyzer.name.clone(),
                CommandLine::new(analyzer.worker.command.clone(), analyzer.worker.args.clone()),
            ));
            for category in analyzer.serves() {
                if let Some(previous) = owners.insert(category, &analyzer.name) {
                    anyhow::bail!(
                        "Category '{category}' is served by both '{previous}' and '{}'",
                        analyzer.name
                    );
                }
                pipeline = pipeline.with_analyzer(category, worker.clone());
            }
        }
        Ok(pipeline)
    }
}

impl<J: SimilarityJudge> ReviewPipeline<J> {
    pub fn with_filter(mut self, filter: SourceFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_analyzer(mut self, category: Category, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzers.insert(category, analyzer);
        self
    }

    pub fn with_stages(mut self, stages: Vec<ReviewStage>) -> Self {
        self.stages = stages;
        self
    }

    pub fn with_review_timeout(mut self, timeout: Duration) -> Self {
        self.review_timeout = timeout;
        self
    }

    pub fn with_scoring(mut self, max_parallel: usize, timeout: Duration) -> Self {
        self.scoring_parallel = max_parallel;
        self.scoring_timeout = timeout;
        self
    }

    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Swap the duplicate judge.
    pub fn with_judge<K: SimilarityJudge>(self, judge: K) -> ReviewPipeline<K> {
        ReviewPipeline {
            scheduler: self.scheduler,
            source: self.source,
            filter: self.filter,
            analyzers: self.analyzers,
            stages: self.stages,
            review_timeout: self.review_timeout,
            scorer: self.scorer,
            scoring_parallel: self.scoring_parallel,
            scoring_timeout: self.scoring_timeout,
            thresholds: self.thresholds,
            dedup: Deduplicator::new(judge),
        }
    }

    /// Run one session to `Done` or `Aborted(NoWork)`.
    ///
    /// Fatal errors abort the session and are returned; soft task
    /// failures are recorded on the session instead.
    pub async fn run(&self) -> PipelineResult<ReviewSession> {
        let mut session = ReviewSession::new();
        self.run_session(&mut session).await?;
        Ok(session)
    }

    /// Drive a caller-owned session from `Idle`. On error the session is
    /// left in `Aborted(Error)` so its partial state stays inspectable.
    pub async fn run_session(&self, session: &mut ReviewSession) -> PipelineResult<()> {
        tracing::info!(session = %session.id, "Starting review session");

        match self.drive(session).await {
            Ok(()) => {
                tracing::info!(
                    session = %session.id,
                    state = %session.state,
                    findings = session.findings.len(),
                    soft_failures = session.soft_failures.len(),
                    "Review session finished"
                );
                Ok(())
            }
            Err(e) => {
                session.abort(&e);
                tracing::error!(session = %session.id, error = %e, "Review session aborted");
                Err(e)
            }
        }
    }

    async fn drive(&self, session: &mut ReviewSession) -> PipelineResult<()> {
        if self.analyzers.is_empty() {
            return Err(PipelineError::Config("no analyzers registered".into()));
        }

        // Discovering
        session.transition(SessionState::Discovering)?;
        let bundle = self.source.discover().await.map_err(PipelineError::Source)?;
        let filtered = self.filter.apply(bundle);
        let items = filtered.bundle.items;
        session.source = SourceTally {
            project: filtered.bundle.metadata.clone(),
            total: items.len(),
            staged: items.iter().filter(|i| i.staged).count(),
            unstaged: items.iter().filter(|i| !i.staged).count(),
            excluded: filtered.excluded,
        };
        if items.is_empty() {
            tracing::info!(
                session = %session.id,
                excluded = filtered.excluded,
                "Nothing to review"
            );
            return session.transition(SessionState::Aborted(AbortReason::NoWork));
        }

        // Reviewing
        session.transition(SessionState::Reviewing)?;
        let specs = self.review_stages(Arc::new(items), Arc::new(filtered.bundle.metadata))?;
        let runner: Arc<dyn TaskRunner<ReviewPayload, NormalizedFindings>> =
            Arc::new(AnalyzerRunner::new(self.analyzers.clone()));
        let reports = match self.scheduler.run_pipeline(specs, runner).await? {
            PipelineRun::Completed(reports) => reports,
            PipelineRun::NoWork => {
                return Err(PipelineError::Config("review stages produced no tasks".into()))
            }
        };

        let mut per_task = Vec::new();
        for report in reports {
            session.stages.push(report.summary());
            session.soft_failures.extend(report.soft_failures());
            for (_, normalized) in report.into_successes() {
                session.warnings.extend(normalized.warnings);
                per_task.push(normalized.findings);
            }
        }
        session.findings = aggregator::merge(&per_task);
        session.tally.raw = session.findings.len();

        // Scoring
        session.transition(SessionState::Scoring)?;
        let confidence = ConfidenceFilter::new(
            self.scorer.clone(),
            self.scoring_parallel,
            self.scoring_timeout,
        )
        .with_thresholds(self.thresholds);
        let outcome = confidence.score(std::mem::take(&mut session.findings)).await?;
        session.stages.push(outcome.summary);
        session.soft_failures.extend(outcome.failures);
        session.tally.scored = outcome.scored.len();
        session.findings = confidence.filter(outcome.scored);
        session.tally.filtered_out = session.tally.scored - session.findings.len();

        // Aggregating
        session.transition(SessionState::Aggregating)?;
        let before = session.findings.len();
        let deduped = self.dedup.dedupe(std::mem::take(&mut session.findings));
        session.tally.merged = before - deduped.len();
        session.findings = aggregator::reorder(deduped);

        // Done
        session.report = Some(session.freeze());
        session.transition(SessionState::Done)
    }

    /// One stage spec per configured stage, skipping categories nobody serves.
    fn review_stages(
        &self,
        items: Arc<Vec<SourceItem>>,
        metadata: Arc<ProjectMetadata>,
    ) -> PipelineResult<Vec<StageSpec<ReviewPayload>>> {
        let mut specs = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            let mut spec = StageSpec::new(stage.name.clone(), stage.max_parallel, self.review_timeout);
            for &category in &stage.categories {
                if !self.analyzers.contains_key(&category) {
                    tracing::warn!(stage = %stage.name, %category, "No analyzer for category, skipping");
                    continue;
                }
                spec.push_task(
                    category.as_str(),
                    ReviewPayload {
                        category,
                        items: items.clone(),
                        metadata: metadata.clone(),
                    },
                );
            }
            if spec.tasks.is_empty() {
                tracing::warn!(stage = %stage.name, "Stage has no runnable tasks, skipping");
                continue;
            }
            specs.push(spec);
        }

        if specs.is_empty() {
            return Err(PipelineError::Config(
                "no review stage has a category with a registered analyzer".into(),
            ));
        }
        Ok(specs)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::source::StaticSource;
    use crate::review::traits::{RawFinding, Severity, SourceBundle, WorkItem};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeAnalyzer {
        findings: Vec<RawFinding>,
        delay: Duration,
        calls: Arc<AtomicUsize>,
    }

    impl FakeAnalyzer {
        fn new(findings: Vec<RawFinding>) -> Self {
            Self {
                findings,
                delay: Duration::ZERO,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn delayed(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl Analyzer for FakeAnalyzer {
        fn id(&self) -> &str {
            "fake"
        }

        async fn analyze(&self, _item: &WorkItem<ReviewPayload>) -> anyhow::Result<Vec<RawFinding>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(self.findings.clone())
        }
    }

    struct FixedScorer(u8);

    #[async_trait]
    impl Scorer for FixedScorer {
        fn id(&self) -> &str {
            "fixed"
        }

        async fn score(&self, _finding: &Finding) -> anyhow::Result<u8> {
            Ok(self.0)
        }
    }

    struct FailingSource;

    #[async_trait]
    impl SourceProvider for FailingSource {
        async fn discover(&self) -> anyhow::Result<SourceBundle> {
            anyhow::bail!("git status failed")
        }
    }

    fn raw(path: &str, line: u32, title: &str, severity: Severity) -> RawFinding {
        RawFinding {
            file_path: Some(path.into()),
            start_line: Some(line),
            end_line: Some(line + 2),
            severity: Some(severity),
            title: title.into(),
            description: format!("{title} details"),
            ..Default::default()
        }
    }

    fn bundle(paths: &[&str]) -> SourceBundle {
        SourceBundle {
            items: paths
                .iter()
                .map(|p| SourceItem {
                    path: p.to_string(),
                    content: "package svc".into(),
                    diff: None,
                    staged: true,
                })
                .collect(),
            metadata: ProjectMetadata {
                module: "example.com/svc".into(),
                version: "v0.3.0".into(),
                key_dependencies: vec![],
            },
        }
    }

    fn pipeline(paths: &[&str], score: u8) -> ReviewPipeline {
        ReviewPipeline::new(
            Arc::new(StaticSource::new(bundle(paths))),
            Arc::new(FixedScorer(score)),
        )
    }

    /// Analyzers for three categories; `delays` permutes who finishes first.
    fn with_three_analyzers(p: ReviewPipeline, delays: [u64; 3]) -> ReviewPipeline {
        p.with_analyzer(
            Category::Correctness,
            Arc::new(
                FakeAnalyzer::new(vec![raw("svc/a.go", 10, "nil deref", Severity::High)])
                    .delayed(Duration::from_millis(delays[0])),
            ),
        )
        .with_analyzer(
            Category::Concurrency,
            Arc::new(
                FakeAnalyzer::new(vec![
                    raw("svc/b.go", 5, "unbounded goroutines", Severity::Medium),
                    raw("svc/a.go", 40, "lock order", Severity::High),
                ])
                .delayed(Duration::from_millis(delays[1])),
            ),
        )
        .with_analyzer(
            Category::ErrorHandling,
            Arc::new(
                FakeAnalyzer::new(vec![raw("svc/a.go", 3, "ignored error", Severity::Low)])
                    .delayed(Duration::from_millis(delays[2])),
            ),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn completes_with_ordered_report() {
        let session = with_three_analyzers(pipeline(&["svc/a.go", "svc/b.go"], 90), [0, 0, 0])
            .run()
            .await
            .unwrap();

        assert_eq!(session.state(), &SessionState::Done);
        let titles: Vec<_> = session.findings().iter().map(|f| f.title.as_str()).collect();
        assert_eq!(
            titles,
            vec!["nil deref", "lock order", "unbounded goroutines", "ignored error"]
        );
        assert!(session.findings().iter().all(|f| f.confidence == Some(90)));

        let report = session.report().unwrap();
        assert_eq!(report.session_id, session.id());
        assert_eq!(report.metadata.total_items, 2);
        assert_eq!(report.metadata.raw_findings, 4);
        assert_eq!(report.metadata.scored, 4);
        // Review stage plus scoring stage.
        assert_eq!(report.metadata.stages.len(), 2);
        assert_eq!(report.metadata.stages[0].tasks, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn report_is_independent_of_completion_order() {
        let first = with_three_analyzers(pipeline(&["svc/a.go"], 90), [30, 20, 10])
            .run()
            .await
            .unwrap();
        let second = with_three_analyzers(pipeline(&["svc/a.go"], 90), [10, 20, 30])
            .run()
            .await
            .unwrap();
        assert_eq!(first.findings(), second.findings());
    }

    #[tokio::test(start_paused = true)]
    async fn one_timed_out_task_does_not_fail_the_session() {
        let mut p = pipeline(&["svc/a.go"], 90)
            .with_review_timeout(Duration::from_secs(5))
            .with_stages(vec![ReviewStage::new("review", 2, Category::ALL[..5].to_vec())]);
        for (i, category) in Category::ALL[..5].iter().enumerate() {
            let mut analyzer =
                FakeAnalyzer::new(vec![raw("svc/a.go", (i as u32 + 1) * 10, "issue", Severity::Medium)]);
            if i == 2 {
                analyzer = analyzer.delayed(Duration::from_secs(60));
            }
            p = p.with_analyzer(*category, Arc::new(analyzer));
        }

        let session = p.run().await.unwrap();
        assert_eq!(session.state(), &SessionState::Done);
        assert_eq!(session.soft_failures().len(), 1);
        assert_eq!(session.soft_failures()[0].task_id.slot, 2);
        assert_eq!(session.findings().len(), 4);
        assert_eq!(session.stages()[0].timed_out, 1);
    }

    #[tokio::test]
    async fn empty_source_short_circuits_before_review() {
        let analyzer = FakeAnalyzer::new(vec![raw("x.go", 1, "never", Severity::High)]);
        let calls = analyzer.calls.clone();
        let session = pipeline(&[], 90)
            .with_analyzer(Category::Security, Arc::new(analyzer))
            .run()
            .await
            .unwrap();

        assert_eq!(session.state(), &SessionState::Aborted(AbortReason::NoWork));
        assert!(session.findings().is_empty());
        assert!(session.stages().is_empty());
        assert!(session.report().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fully_excluded_source_is_no_work() {
        let filter = SourceFilter::new(&["vendor/**".into()], true).unwrap();
        let session = pipeline(&["vendor/lib/x.go"], 90)
            .with_filter(filter)
            .with_analyzer(Category::Security, Arc::new(FakeAnalyzer::new(vec![])))
            .run()
            .await
            .unwrap();
        assert_eq!(session.state(), &SessionState::Aborted(AbortReason::NoWork));
    }

    #[tokio::test]
    async fn low_confidence_findings_are_filtered() {
        // 70 clears the suggestion bar (60) but not the severe bar (75).
        let session = pipeline(&["svc/a.go"], 70)
            .with_analyzer(
                Category::Architecture,
                Arc::new(FakeAnalyzer::new(vec![raw("svc/a.go", 1, "split package", Severity::Medium)])),
            )
            .with_analyzer(
                Category::Correctness,
                Arc::new(FakeAnalyzer::new(vec![raw("svc/a.go", 50, "off by one", Severity::High)])),
            )
            .run()
            .await
            .unwrap();

        assert_eq!(session.findings().len(), 1);
        assert_eq!(session.findings()[0].title, "split package");
        assert_eq!(session.findings()[0].severity, Severity::Optimize);
        assert_eq!(session.report().unwrap().metadata.filtered_out, 1);
    }

    #[tokio::test]
    async fn duplicates_across_stages_are_merged() {
        let finding = raw("svc/a.go", 10, "race on cache map", Severity::High);
        let mut again = finding.clone();
        again.category = Some(Category::Concurrency);
        again.severity = Some(Severity::Critical);

        let session = pipeline(&["svc/a.go"], 95)
            .with_stages(vec![
                ReviewStage::new("first", 1, vec![Category::Concurrency]),
                ReviewStage::new("second", 1, vec![Category::Correctness]),
            ])
            .with_analyzer(Category::Concurrency, Arc::new(FakeAnalyzer::new(vec![finding])))
            .with_analyzer(Category::Correctness, Arc::new(FakeAnalyzer::new(vec![again])))
            .run()
            .await
            .unwrap();

        assert_eq!(session.findings().len(), 1);
        let merged = &session.findings()[0];
        assert_eq!(merged.severity, Severity::Critical);
        assert_eq!(merged.merged_from.len(), 1);
        assert_eq!(session.report().unwrap().metadata.merged, 1);
    }

    #[tokio::test]
    async fn custom_judge_keeps_duplicates_apart() {
        let f = raw("svc/a.go", 10, "same", Severity::High);
        let session = pipeline(&["svc/a.go"], 95)
            .with_analyzer(Category::Correctness, Arc::new(FakeAnalyzer::new(vec![f.clone(), f])))
            .with_judge(|_: &Finding, _: &Finding| false)
            .run()
            .await
            .unwrap();
        assert_eq!(session.findings().len(), 2);
    }

    #[tokio::test]
    async fn rejected_findings_become_warnings() {
        let mut bad = raw("svc/a.go", 0, "no line", Severity::High);
        bad.start_line = None;
        let session = pipeline(&["svc/a.go"], 95)
            .with_analyzer(Category::Security, Arc::new(FakeAnalyzer::new(vec![bad])))
            .run()
            .await
            .unwrap();
        assert_eq!(session.state(), &SessionState::Done);
        assert!(session.findings().is_empty());
        assert_eq!(session.warnings().len(), 1);
        assert!(session.warnings()[0].is_rejection());
    }

    #[tokio::test]
    async fn missing_analyzers_is_a_config_error() {
        let err = pipeline(&["svc/a.go"], 90).run().await.unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[tokio::test]
    async fn stages_without_served_categories_are_a_config_error() {
        let err = pipeline(&["svc/a.go"], 90)
            .with_stages(vec![ReviewStage::new("review", 2, vec![Category::Security])])
            .with_analyzer(Category::Correctness, Arc::new(FakeAnalyzer::new(vec![])))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[tokio::test]
    async fn source_failure_is_fatal() {
        let err = ReviewPipeline::new(Arc::new(FailingSource), Arc::new(FixedScorer(90)))
            .with_analyzer(Category::Security, Arc::new(FakeAnalyzer::new(vec![])))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Source(_)));
        assert!(err.to_string().contains("source discovery failed"));
    }

    #[tokio::test]
    async fn fatal_error_leaves_session_aborted() {
        let pipeline = ReviewPipeline::new(Arc::new(FailingSource), Arc::new(FixedScorer(90)))
            .with_analyzer(Category::Security, Arc::new(FakeAnalyzer::new(vec![])));
        let mut session = ReviewSession::new();

        let err = pipeline.run_session(&mut session).await.unwrap_err();
        assert!(matches!(err, PipelineError::Source(_)));
        match session.state() {
            SessionState::Aborted(AbortReason::Error(msg)) => {
                assert!(msg.contains("source discovery failed"), "{msg}");
            }
            other => panic!("unexpected state {other}"),
        }
        assert!(session.report().is_none());

        // A finished session cannot be driven again.
        let again = pipeline.run_session(&mut session).await.unwrap_err();
        assert!(matches!(again, PipelineError::InvalidTransition { .. }));
        assert!(matches!(session.state(), SessionState::Aborted(AbortReason::Error(_))));
    }

    #[test]
    fn infrastructure_failure_aborts_the_session() {
        use std::future::Future;
        use std::task::{Context, Poll, Waker};

        let pipeline = pipeline(&["svc/a.go"], 90)
            .with_analyzer(Category::Security, Arc::new(FakeAnalyzer::new(vec![])));
        let mut session = ReviewSession::new();
        let mut cx = Context::from_waker(Waker::noop());

        let polled = std::pin::pin!(pipeline.run_session(&mut session)).poll(&mut cx);
        match polled {
            Poll::Ready(Err(PipelineError::Infrastructure(_))) => {}
            Poll::Ready(other) => panic!("unexpected result: {:?}", other.err()),
            Poll::Pending => panic!("session should fail before awaiting anything"),
        }
        assert!(matches!(session.state(), SessionState::Aborted(AbortReason::Error(_))));
    }

    #[tokio::test]
    async fn zero_parallelism_is_rejected() {
        let err = pipeline(&["svc/a.go"], 90)
            .with_stages(vec![ReviewStage::new("review", 0, vec![Category::Security])])
            .with_analyzer(Category::Security, Arc::new(FakeAnalyzer::new(vec![])))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidStage { .. }));
    }

    #[test]
    fn transitions_follow_the_state_machine() {
        let mut session = ReviewSession::new();
        assert!(matches!(
            session.transition(SessionState::Done),
            Err(PipelineError::InvalidTransition { .. })
        ));
        session.transition(SessionState::Discovering).unwrap();
        assert!(session.transition(SessionState::Scoring).is_err());
        session
            .transition(SessionState::Aborted(AbortReason::NoWork))
            .unwrap();
        assert!(session.state().is_terminal());
        assert!(session
            .transition(SessionState::Aborted(AbortReason::Error("late".into())))
            .is_err());
    }

    #[test]
    fn any_live_state_can_abort_with_error() {
        let abort = SessionState::Aborted(AbortReason::Error("boom".into()));
        for state in [
            SessionState::Idle,
            SessionState::Discovering,
            SessionState::Reviewing,
            SessionState::Scoring,
            SessionState::Aggregating,
        ] {
            assert!(state.can_transition_to(&abort), "{state}");
        }
        assert!(!SessionState::Done.can_transition_to(&abort));
        assert!(!SessionState::Reviewing.can_transition_to(&SessionState::Aborted(AbortReason::NoWork)));
        assert_eq!(abort.to_string(), "aborted (boom)");
    }

    fn config_with(analyzers: &[(&str, Vec<Category>)], scorer: bool) -> Config {
        let mut config = Config::default();
        for (name, categories) in analyzers {
            config.analyzers.push(crate::config::AnalyzerConfig {
                name: name.to_string(),
                categories: categories.clone(),
                worker: crate::config::WorkerCommandConfig {
                    command: "review-worker".into(),
                    args: vec![],
                },
            });
        }
        if scorer {
            config.scorer = Some(crate::config::WorkerCommandConfig {
                command: "scorer".into(),
                args: vec![],
            });
        }
        config
    }

    fn source() -> Arc<dyn SourceProvider> {
        Arc::new(StaticSource::new(bundle(&["svc/a.go"])))
    }

    #[test]
    fn from_config_requires_a_scorer() {
        let config = config_with(&[("all", vec![])], false);
        let err = ReviewPipeline::from_config(&config, source()).err().unwrap();
        assert!(err.to_string().contains("[scorer]"));
    }

    #[test]
    fn from_config_rejects_shared_categories() {
        let config = config_with(
            &[
                ("a", vec![Category::Security]),
                ("b", vec![Category::Security, Category::Correctness]),
            ],
            true,
        );
        let err = ReviewPipeline::from_config(&config, source()).err().unwrap();
        assert!(err.to_string().contains("served by both"));
    }

    #[test]
    fn from_config_inherits_default_stage_cap() {
        let mut config = config_with(&[("all", vec![])], true);
        config.review.max_parallel = 4;
        let pipeline = ReviewPipeline::from_config(&config, source()).unwrap();
        assert_eq!(pipeline.stages, vec![ReviewStage::new("review", 4, Category::ALL.to_vec())]);
        assert_eq!(pipeline.analyzers.len(), 6);
    }

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(ReviewSession::new().id(), ReviewSession::new().id());
    }
}
