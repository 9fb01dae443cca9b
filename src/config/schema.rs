//! TOML configuration schema.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::review::confidence::{Thresholds, SCORING_STAGE};
use crate::review::source::SourceFilter;
use crate::review::traits::Category;

/// Generated, vendored and fixture files that are never worth reviewing.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "vendor/**",
    "**/vendor/**",
    "third_party/**",
    "node_modules/**",
    "**/testdata/**",
    "**/mocks/**",
    "**/*_test.go",
    "**/*.pb.go",
    "**/*_gen.go",
    "**/*.generated.*",
    "**/*.min.js",
    "go.sum",
    "**/*.lock",
];

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where this config was loaded from (not serialized).
    #[serde(skip)]
    pub config_path: PathBuf,
    pub logging: LoggingConfig,
    pub review: ReviewConfig,
    pub scoring: ScoringConfig,
    pub thresholds: Thresholds,
    pub source: SourceConfig,
    /// External review workers.
    pub analyzers: Vec<AnalyzerConfig>,
    /// External confidence scorer.
    pub scorer: Option<WorkerCommandConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: PathBuf::new(),
            logging: LoggingConfig::default(),
            review: ReviewConfig::default(),
            scoring: ScoringConfig::default(),
            thresholds: Thresholds::default(),
            source: SourceConfig::default(),
            analyzers: Vec::new(),
            scorer: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive; `RUST_LOG` takes precedence.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    /// Cap for stages that do not set their own.
    pub max_parallel: usize,
    pub task_timeout_secs: u64,
    /// Review stages in execution order. Empty means one `review` stage
    /// covering every category.
    pub stages: Vec<StageConfig>,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            max_parallel: 2,
            task_timeout_secs: 600,
            stages: Vec::new(),
        }
    }
}

impl ReviewConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    /// Configured stages, or the single default stage.
    pub fn effective_stages(&self) -> Vec<StageConfig> {
        if self.stages.is_empty() {
            vec![StageConfig {
                name: "review".into(),
                max_parallel: None,
                categories: Category::ALL.to_vec(),
            }]
        } else {
            self.stages.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    #[serde(default)]
    pub max_parallel: Option<usize>,
    pub categories: Vec<Category>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub max_parallel: usize,
    pub task_timeout_secs: u64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            max_parallel: 5,
            task_timeout_secs: 120,
        }
    }
}

impl ScoringConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub exclude: Vec<String>,
    pub include_unstaged: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            exclude: DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect(),
            include_unstaged: true,
        }
    }
}

impl SourceConfig {
    pub fn filter(&self) -> anyhow::Result<SourceFilter> {
        SourceFilter::new(&self.exclude, self.include_unstaged)
    }
}

/// An external program speaking the JSON stdin/stdout worker protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCommandConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// An external analyzer and the categories it serves (empty = all).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    pub name: String,
    #[serde(default)]
    pub categories: Vec<Category>,
    #[serde(flatten)]
    pub worker: WorkerCommandConfig,
}

impl AnalyzerConfig {
    pub fn serves(&self) -> Vec<Category> {
        if self.categories.is_empty() {
            Category::ALL.to_vec()
        } else {
            self.categories.clone()
        }
    }
}

impl Config {
    /// Reject settings the scheduler or filters cannot honor.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.review.max_parallel == 0 {
            anyhow::bail!("review.max_parallel must be at least 1");
        }
        if self.review.task_timeout_secs == 0 {
            anyhow::bail!("review.task_timeout_secs must be non-zero");
        }
        if self.scoring.max_parallel == 0 {
            anyhow::bail!("scoring.max_parallel must be at least 1");
        }
        if self.scoring.task_timeout_secs == 0 {
            anyhow::bail!("scoring.task_timeout_secs must be non-zero");
        }

        let t = &self.thresholds;
        for (name, value) in [
            ("severe", t.severe),
            ("moderate", t.moderate),
            ("suggestion", t.suggestion),
        ] {
            if value > 100 {
                anyhow::bail!("thresholds.{name} must be within 0..=100, got {value}");
            }
        }

        let mut stage_names = HashSet::new();
        let mut categories = HashSet::new();
        for stage in &self.review.stages {
            if stage.name.trim().is_empty() {
                anyhow::bail!("review stage names must not be empty");
            }
            if stage.name == SCORING_STAGE {
                anyhow::bail!("review stage name '{SCORING_STAGE}' is reserved");
            }
            if !stage_names.insert(stage.name.as_str()) {
                anyhow::bail!("duplicate review stage '{}'", stage.name);
            }
            if stage.max_parallel == Some(0) {
                anyhow::bail!("review stage '{}' max_parallel must be at least 1", stage.name);
            }
            for category in &stage.categories {
                if !categories.insert(*category) {
                    anyhow::bail!("category '{category}' appears in more than one review stage");
                }
            }
        }

        for analyzer in &self.analyzers {
            if analyzer.worker.command.trim().is_empty() {
                anyhow::bail!("analyzer '{}' has an empty command", analyzer.name);
            }
        }
        if let Some(scorer) = &self.scorer {
            if scorer.command.trim().is_empty() {
                anyhow::bail!("scorer has an empty command");
            }
        }

        self.source.filter()?;
        Ok(())
    }
}
