//! Source providers and pre-review filtering.
//!
//! Discovery (version-control queries, file walking) happens outside the
//! pipeline. A provider only hands over a [`SourceBundle`]; the
//! [`SourceFilter`] then drops vendored, generated and fixture files.

use anyhow::Context;
use async_trait::async_trait;
use glob::{MatchOptions, Pattern};
use std::path::PathBuf;

use super::traits::SourceBundle;

/// Supplies the unit of work for one review session.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    async fn discover(&self) -> anyhow::Result<SourceBundle>;
}

/// In-memory bundle, mostly for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    bundle: SourceBundle,
}

impl StaticSource {
    pub fn new(bundle: SourceBundle) -> Self {
        Self { bundle }
    }
}

#[async_trait]
impl SourceProvider for StaticSource {
    async fn discover(&self) -> anyhow::Result<SourceBundle> {
        Ok(self.bundle.clone())
    }
}

/// Reads a JSON-encoded [`SourceBundle`] produced by an external discovery step.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SourceProvider for JsonFileSource {
    async fn discover(&self) -> anyhow::Result<SourceBundle> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read source bundle {}", self.path.display()))?;
        let bundle: SourceBundle = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse source bundle {}", self.path.display()))?;
        tracing::info!(
            path = %self.path.display(),
            items = bundle.items.len(),
            "Loaded source bundle"
        );
        Ok(bundle)
    }
}

// ── Filtering ────────────────────────────────────────────────────

/// Bundle after filtering, with the number of items that were dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilteredSource {
    pub bundle: SourceBundle,
    pub excluded: usize,
}

/// Drops items matching exclusion globs, and optionally unstaged items.
#[derive(Debug, Clone)]
pub struct SourceFilter {
    exclude: Vec<Pattern>,
    include_unstaged: bool,
}

impl Default for SourceFilter {
    /// Pass everything through.
    fn default() -> Self {
        Self {
            exclude: Vec::new(),
            include_unstaged: true,
        }
    }
}

impl SourceFilter {
    /// Compile the exclusion globs. Malformed patterns are an error.
    pub fn new(exclude: &[String], include_unstaged: bool) -> anyhow::Result<Self> {
        let exclude = exclude
            .iter()
            .map(|p| Pattern::new(p).with_context(|| format!("Invalid exclude pattern '{p}'")))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self {
            exclude,
            include_unstaged,
        })
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };
        self.exclude
            .iter()
            .any(|p| p.matches_with(path, options))
    }

    pub fn apply(&self, bundle: SourceBundle) -> FilteredSource {
        let before = bundle.items.len();
        let items: Vec<_> = bundle
            .items
            .into_iter()
            .filter(|item| {
                if !self.include_unstaged && !item.staged {
                    tracing::debug!(path = %item.path, "Skipping unstaged item");
                    return false;
                }
                if self.is_excluded(&item.path) {
                    tracing::debug!(path = %item.path, "Skipping excluded item");
                    return false;
                }
                true
            })
            .collect();
        let excluded = before - items.len();
        FilteredSource {
            bundle: SourceBundle {
                items,
                metadata: bundle.metadata,
            },
            excluded,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
