//! External-process [`Analyzer`] and [`Scorer`] implementations.
//!
//! Each worker is a program that reads one JSON request on stdin and
//! writes one JSON response on stdout. The child is killed if the
//! dispatcher's timeout drops the call.

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::traits::{
    Analyzer, Finding, RawFinding, ReviewPayload, Scorer, UnrecognizedValue, WorkItem,
};

/// Longest stderr excerpt carried into an error message.
const STDERR_EXCERPT_CHARS: usize = 400;

/// Program plus fixed arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Spawn, feed `request` on stdin, return stdout on success.
    async fn exchange(&self, request: &Value) -> anyhow::Result<String> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn worker '{}'", self.program))?;

        let body = serde_json::to_vec(request)?;
        let stdin = child.stdin.take();
        // Feed stdin while draining stdout so neither pipe can fill up and stall.
        let feed = async move {
            match stdin {
                Some(mut stdin) => stdin.write_all(&body).await,
                None => Ok(()),
            }
        };
        let (written, output) = tokio::join!(feed, child.wait_with_output());
        let output =
            output.with_context(|| format!("Failed to wait for worker '{}'", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let excerpt: String = stderr.trim().chars().take(STDERR_EXCERPT_CHARS).collect();
            anyhow::bail!("Worker '{}' exited with {}: {}", self.program, output.status, excerpt);
        }

        match written {
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                tracing::debug!(worker = %self.program, "Worker exited without reading its whole request");
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to write request to '{}'", self.program));
            }
            Ok(()) => {}
        }

        String::from_utf8(output.stdout)
            .with_context(|| format!("Worker '{}' wrote non-UTF-8 output", self.program))
    }
}

// ── Analyzer ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AnalyzerResponse {
    Bare(Vec<Value>),
    Wrapped { findings: Vec<Value> },
}

impl AnalyzerResponse {
    /// Entries are read one at a time. One that is not an object becomes
    /// a finding without a location, which ingestion rejects with a warning.
    fn into_findings(self) -> Vec<RawFinding> {
        let (Self::Bare(entries) | Self::Wrapped { findings: entries }) = self;
        entries
            .into_iter()
            .map(|entry| {
                serde_json::from_value::<RawFinding>(entry.clone()).unwrap_or_else(|_| RawFinding {
                    unrecognized: vec![UnrecognizedValue::new("finding", &entry)],
                    ..Default::default()
                })
            })
            .collect()
    }
}

/// Review worker backed by an external program.
pub struct CommandAnalyzer {
    id: String,
    command: CommandLine,
}

impl CommandAnalyzer {
    pub fn new(id: impl Into<String>, command: CommandLine) -> Self {
        Self {
            id: id.into(),
            command,
        }
    }
}

#[async_trait]
impl Analyzer for CommandAnalyzer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn analyze(&self, item: &WorkItem<ReviewPayload>) -> anyhow::Result<Vec<RawFinding>> {
        let request = serde_json::json!({
            "task_id": item.id.to_string(),
            "category": item.payload.category,
            "items": item.payload.items.as_ref(),
            "metadata": item.payload.metadata.as_ref(),
        });
        let stdout = self.command.exchange(&request).await?;
        let response: AnalyzerResponse = serde_json::from_str(stdout.trim())
            .with_context(|| format!("Analyzer '{}' returned malformed findings", self.id))?;
        Ok(response.into_findings())
    }
}

// ── Scorer ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ScoreResponse {
    Bare(u8),
    Wrapped { score: u8 },
}

/// Confidence scorer backed by an external program.
pub struct CommandScorer {
    id: String,
    command: CommandLine,
}

impl CommandScorer {
    pub fn new(id: impl Into<String>, command: CommandLine) -> Self {
        Self {
            id: id.into(),
            command,
        }
    }
}

#[async_trait]
impl Scorer for CommandScorer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn score(&self, finding: &Finding) -> anyhow::Result<u8> {
        let request = serde_json::json!({ "finding": finding });
        let stdout = self.command.exchange(&request).await?;
        let response: ScoreResponse = serde_json::from_str(stdout.trim())
            .with_context(|| format!("Scorer '{}' returned a malformed score", self.id))?;
        Ok(match response {
            ScoreResponse::Bare(score) | ScoreResponse::Wrapped { score } => score,
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────
