//! Stage scheduler.
//!
//! Runs an ordered list of named stages. Stages are strictly sequential;
//! inside a stage the task list is cut into batches no larger than the
//! stage's parallelism cap, each batch is dispatched concurrently, and the
//! next batch starts only once every task of the current one has settled.
//!
//! The scheduler is generic over payload and result types so the review
//! stage and the confidence-scoring stage share one code path.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

use super::dispatcher::TaskDispatcher;
use super::error::{PipelineError, PipelineResult};
use super::traits::{TaskId, WorkItem};

// ── Stage specification ──────────────────────────────────────────

/// What happens to a stage when one of its tasks fails or times out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Record a soft failure and keep going.
    #[default]
    Drop,
    /// Stop the stage after the current batch settles and fail the run.
    Abort,
}

/// A named stage: its tasks, parallelism cap and per-task timeout.
#[derive(Debug, Clone)]
pub struct StageSpec<P> {
    pub name: String,
    pub tasks: Vec<WorkItem<P>>,
    pub max_parallel: usize,
    pub task_timeout: Duration,
    pub failure_policy: FailurePolicy,
}

impl<P> StageSpec<P> {
    pub fn new(name: impl Into<String>, max_parallel: usize, task_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            tasks: Vec::new(),
            max_parallel,
            task_timeout,
            failure_policy: FailurePolicy::Drop,
        }
    }

    /// Append a task; its slot is its position in the stage.
    pub fn with_task(mut self, label: impl Into<String>, payload: P) -> Self {
        self.push_task(label, payload);
        self
    }

    pub fn push_task(&mut self, label: impl Into<String>, payload: P) {
        let id = TaskId::new(self.name.clone(), self.tasks.len());
        self.tasks.push(WorkItem::new(id, label, payload));
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Number of sequential batches this stage will run in.
    pub fn batch_count(&self) -> usize {
        if self.max_parallel == 0 {
            return 0;
        }
        self.tasks.len().div_ceil(self.max_parallel)
    }

    fn validate(&self) -> PipelineResult<()> {
        if self.max_parallel == 0 {
            return Err(PipelineError::InvalidStage {
                stage: self.name.clone(),
                reason: "max_parallel must be at least 1".into(),
            });
        }
        if self.task_timeout.is_zero() {
            return Err(PipelineError::InvalidStage {
                stage: self.name.clone(),
                reason: "task timeout must be non-zero".into(),
            });
        }
        Ok(())
    }
}

// ── Task runner seam ─────────────────────────────────────────────

/// Adapter between a stage's payload type and an opaque worker.
#[async_trait]
pub trait TaskRunner<P, T>: Send + Sync {
    async fn run(&self, item: &WorkItem<P>) -> anyhow::Result<T>;
}

// ── Results ──────────────────────────────────────────────────────

/// How a single task settled.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome<T> {
    Completed(T),
    Failed { reason: String },
    TimedOut { after: Duration },
}

impl<T> TaskOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// Reason text for soft failures, `None` on success.
    pub fn failure_reason(&self) -> Option<String> {
        match self {
            Self::Completed(_) => None,
            Self::Failed { reason } => Some(reason.clone()),
            Self::TimedOut { after } => Some(format!("timed out after {}ms", after.as_millis())),
        }
    }
}

/// Settled task with its bookkeeping.
#[derive(Debug, Clone)]
pub struct TaskReport<T> {
    pub id: TaskId,
    pub label: String,
    /// Zero-based batch index within the stage.
    pub batch: usize,
    pub duration: Duration,
    pub outcome: TaskOutcome<T>,
}

/// A task that errored or timed out and was excluded from aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftFailure {
    pub task_id: TaskId,
    pub label: String,
    pub reason: String,
}

/// Counts for one settled stage, kept in the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSummary {
    pub name: String,
    pub batches: usize,
    pub tasks: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
}

/// All task reports of one stage, in slot order.
#[derive(Debug, Clone)]
pub struct StageReport<T> {
    pub name: String,
    pub batches: usize,
    pub tasks: Vec<TaskReport<T>>,
}

impl<T> StageReport<T> {
    pub fn soft_failures(&self) -> Vec<SoftFailure> {
        self.tasks
            .iter()
            .filter_map(|t| {
                t.outcome.failure_reason().map(|reason| SoftFailure {
                    task_id: t.id.clone(),
                    label: t.label.clone(),
                    reason,
                })
            })
            .collect()
    }

    pub fn summary(&self) -> StageSummary {
        let mut summary = StageSummary {
            name: self.name.clone(),
            batches: self.batches,
            tasks: self.tasks.len(),
            succeeded: 0,
            failed: 0,
            timed_out: 0,
        };
        for task in &self.tasks {
            match task.outcome {
                TaskOutcome::Completed(_) => summary.succeeded += 1,
                TaskOutcome::Failed { .. } => summary.failed += 1,
                TaskOutcome::TimedOut { .. } => summary.timed_out += 1,
            }
        }
        summary
    }

    /// Successful results in slot order.
    pub fn into_successes(self) -> Vec<(TaskId, T)> {
        self.tasks
            .into_iter()
            .filter_map(|t| match t.outcome {
                TaskOutcome::Completed(value) => Some((t.id, value)),
                _ => None,
            })
            .collect()
    }
}

/// Result of a whole multi-stage run.
#[derive(Debug)]
pub enum PipelineRun<T> {
    /// The first stage had nothing to do; no stage ran.
    NoWork,
    Completed(Vec<StageReport<T>>),
}

// ── Scheduler ────────────────────────────────────────────────────

/// Sequential-stage, batched-parallel task scheduler.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageScheduler;

impl StageScheduler {
    pub fn new() -> Self {
        Self
    }

    /// Run stages in order. An empty first stage short-circuits to
    /// [`PipelineRun::NoWork`] before anything is dispatched.
    pub async fn run_pipeline<P, T>(
        &self,
        stages: Vec<StageSpec<P>>,
        runner: Arc<dyn TaskRunner<P, T>>,
    ) -> PipelineResult<PipelineRun<T>>
    where
        P: Send + Sync + 'static,
        T: Send + 'static,
    {
        if stages.first().map_or(true, |s| s.tasks.is_empty()) {
            tracing::info!("First stage has no tasks, nothing to do");
            return Ok(PipelineRun::NoWork);
        }

        let mut reports = Vec::with_capacity(stages.len());
        for spec in stages {
            reports.push(self.run_stage(spec, runner.clone()).await?);
        }
        Ok(PipelineRun::Completed(reports))
    }

    /// Run one stage to completion and return its task reports in slot order.
    pub async fn run_stage<P, T>(
        &self,
        spec: StageSpec<P>,
        runner: Arc<dyn TaskRunner<P, T>>,
    ) -> PipelineResult<StageReport<T>>
    where
        P: Send + Sync + 'static,
        T: Send + 'static,
    {
        spec.validate()?;
        tokio::runtime::Handle::try_current()
            .map_err(|e| PipelineError::Infrastructure(e.to_string()))?;

        let batches = spec.batch_count();
        tracing::info!(
            stage = %spec.name,
            tasks = spec.tasks.len(),
            batches,
            max_parallel = spec.max_parallel,
            "Starting stage"
        );

        let limiter = Arc::new(Semaphore::new(spec.max_parallel));
        let dispatcher = TaskDispatcher::new(spec.task_timeout);
        let mut reports = Vec::with_capacity(spec.tasks.len());
        let mut pending = spec.tasks.into_iter().peekable();
        let mut batch = 0;

        while pending.peek().is_some() {
            let batch_started = Instant::now();
            let mut handles = Vec::with_capacity(spec.max_parallel);

            for item in pending.by_ref().take(spec.max_parallel) {
                let permit = limiter.clone().acquire_owned().await.map_err(|_| {
                    PipelineError::Infrastructure(format!("limiter for stage '{}' closed", spec.name))
                })?;
                let id = item.id.clone();
                let label = item.label.clone();
                let runner = runner.clone();
                let handle = tokio::spawn(async move {
                    let _permit = permit;
                    let started = Instant::now();
                    let outcome = dispatcher.invoke(&item, runner.as_ref()).await;
                    (outcome, started.elapsed())
                });
                handles.push((id, label, handle));
            }

            tracing::debug!(stage = %spec.name, batch, size = handles.len(), "Batch dispatched");

            for (id, label, handle) in handles {
                let (outcome, duration) = match handle.await {
                    Ok(settled) => settled,
                    Err(e) if e.is_panic() => (
                        TaskOutcome::Failed {
                            reason: "worker panicked".into(),
                        },
                        batch_started.elapsed(),
                    ),
                    Err(e) => {
                        return Err(PipelineError::Infrastructure(format!(
                            "task {id} was cancelled: {e}"
                        )))
                    }
                };

                if let Some(reason) = outcome.failure_reason() {
                    tracing::warn!(
                        stage = %spec.name,
                        task = %id,
                        label = %label,
                        reason = %reason,
                        "Task failed, dropping its contribution"
                    );
                }

                reports.push(TaskReport {
                    id,
                    label,
                    batch,
                    duration,
                    outcome,
                });
            }

            if spec.failure_policy == FailurePolicy::Abort {
                if let Some(failed) = reports
                    .iter()
                    .filter(|r| r.batch == batch)
                    .find(|r| !r.outcome.is_success())
                {
                    return Err(PipelineError::StageAborted {
                        stage: spec.name.clone(),
                        task: failed.id.to_string(),
                        reason: failed.outcome.failure_reason().unwrap_or_default(),
                    });
                }
            }

            batch += 1;
        }

        let report = StageReport {
            name: spec.name,
            batches,
            tasks: reports,
        };
        let summary = report.summary();
        tracing::info!(
            stage = %summary.name,
            succeeded = summary.succeeded,
            failed = summary.failed,
            timed_out = summary.timed_out,
            "Stage settled"
        );
        Ok(report)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Start(usize),
        End(usize),
    }

    /// Sleeps `delay_ms[slot]`, records start/end markers, echoes the slot.
    struct MarkerRunner {
        delay_ms: Vec<u64>,
        events: Mutex<Vec<Event>>,
    }

    #[async_trait]
    impl TaskRunner<usize, usize> for MarkerRunner {
        async fn run(&self, item: &WorkItem<usize>) -> anyhow::Result<usize> {
            let slot = item.payload;
            self.events.lock().push(Event::Start(slot));
            tokio::time::sleep(Duration::from_millis(self.delay_ms[slot])).await;
            self.events.lock().push(Event::End(slot));
            Ok(slot)
        }
    }

    struct ScriptedRunner;

    #[async_trait]
    impl TaskRunner<&'static str, String> for ScriptedRunner {
        async fn run(&self, item: &WorkItem<&'static str>) -> anyhow::Result<String> {
            match item.payload {
                "fail" => anyhow::bail!("worker exploded"),
                "hang" => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok("late".into())
                }
                "panic" => panic!("worker bug"),
                other => Ok(other.to_uppercase()),
            }
        }
    }

    fn stage_of(name: &str, cap: usize, payloads: &[&'static str]) -> StageSpec<&'static str> {
        payloads.iter().fold(
            StageSpec::new(name, cap, Duration::from_secs(5)),
            |spec, p| spec.with_task(*p, *p),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn cap_two_four_tasks_runs_two_barriered_batches() {
        let runner = Arc::new(MarkerRunner {
            // Slot 0 is slow, slot 1 fast: batch 2 must still wait for slot 0.
            delay_ms: vec![50, 5, 5, 5],
            events: Mutex::new(Vec::new()),
        });
        let spec = (0..4).fold(
            StageSpec::new("review", 2, Duration::from_secs(1)),
            |spec, i| spec.with_task(format!("t{i}"), i),
        );
        assert_eq!(spec.batch_count(), 2);

        let report = StageScheduler::new()
            .run_stage(spec, runner.clone())
            .await
            .unwrap();

        assert_eq!(report.batches, 2);
        let batches: Vec<usize> = report.tasks.iter().map(|t| t.batch).collect();
        assert_eq!(batches, vec![0, 0, 1, 1]);

        let events = runner.events.lock().clone();
        let pos = |e: Event| events.iter().position(|x| *x == e).unwrap();
        let last_batch1_end = pos(Event::End(0)).max(pos(Event::End(1)));
        let first_batch2_start = pos(Event::Start(2)).min(pos(Event::Start(3)));
        assert!(last_batch1_end < first_batch2_start);
    }

    #[tokio::test(start_paused = true)]
    async fn one_timeout_among_five_is_isolated() {
        let spec = stage_of("review", 5, &["a", "b", "hang", "c", "d"]);
        let report = StageScheduler::new()
            .run_stage(spec, Arc::new(ScriptedRunner))
            .await
            .unwrap();

        let summary = report.summary();
        assert_eq!(summary.succeeded, 4);
        assert_eq!(summary.timed_out, 1);
        let failures = report.soft_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].task_id, TaskId::new("review", 2));

        let values: Vec<String> = report.into_successes().into_iter().map(|(_, v)| v).collect();
        assert_eq!(values, vec!["A", "B", "C", "D"]);
    }

    #[tokio::test]
    async fn errors_and_panics_are_soft_failures() {
        let spec = stage_of("review", 3, &["ok", "fail", "panic"]);
        let report = StageScheduler::new()
            .run_stage(spec, Arc::new(ScriptedRunner))
            .await
            .unwrap();
        let summary = report.summary();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 2);
        let reasons: Vec<String> = report.soft_failures().into_iter().map(|f| f.reason).collect();
        assert!(reasons[0].contains("worker exploded"));
        assert_eq!(reasons[1], "worker panicked");
    }

    #[tokio::test]
    async fn abort_policy_stops_remaining_batches() {
        let spec = stage_of("strict", 1, &["ok", "fail", "never"]).with_policy(FailurePolicy::Abort);
        let err = StageScheduler::new()
            .run_stage(spec, Arc::new(ScriptedRunner))
            .await
            .unwrap_err();
        match err {
            PipelineError::StageAborted { stage, task, .. } => {
                assert_eq!(stage, "strict");
                assert_eq!(task, "strict#1");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn zero_parallelism_is_rejected() {
        let spec = stage_of("review", 0, &["a"]);
        let err = StageScheduler::new()
            .run_stage(spec, Arc::new(ScriptedRunner))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidStage { .. }));
    }

    #[test]
    fn missing_runtime_is_an_infrastructure_error() {
        use std::future::Future;
        use std::task::{Context, Poll, Waker};

        let scheduler = StageScheduler::new();
        let runner: Arc<dyn TaskRunner<&'static str, String>> = Arc::new(ScriptedRunner);
        let mut fut = std::pin::pin!(scheduler.run_stage(stage_of("review", 2, &["a"]), runner));
        let mut cx = Context::from_waker(Waker::noop());

        match fut.as_mut().poll(&mut cx) {
            Poll::Ready(Err(PipelineError::Infrastructure(msg))) => assert!(!msg.is_empty()),
            Poll::Ready(other) => panic!("unexpected result: {:?}", other.err()),
            Poll::Pending => panic!("stage should fail before awaiting anything"),
        }
    }

    #[tokio::test]
    async fn empty_first_stage_is_no_work() {
        let stages = vec![stage_of("review", 2, &[]), stage_of("later", 2, &["a"])];
        let run = StageScheduler::new()
            .run_pipeline(stages, Arc::new(ScriptedRunner))
            .await
            .unwrap();
        assert!(matches!(run, PipelineRun::NoWork));
    }

    #[tokio::test]
    async fn stages_run_in_order() {
        let stages = vec![stage_of("first", 2, &["a", "b"]), stage_of("second", 2, &["c"])];
        let run = StageScheduler::new()
            .run_pipeline(stages, Arc::new(ScriptedRunner))
            .await
            .unwrap();
        let PipelineRun::Completed(reports) = run else {
            panic!("expected completed run");
        };
        let names: Vec<&str> = reports.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
        assert_eq!(reports[1].tasks[0].id, TaskId::new("second", 0));
    }
}
