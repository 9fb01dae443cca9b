use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use review_orchestrator::config::Config;
use review_orchestrator::review::{
    AbortReason, JsonFileSource, ReviewPipeline, ReviewReport, ReviewSession, SessionState,
};

/// Run staged code review workers over a source bundle.
#[derive(Parser, Debug)]
#[command(name = "review-orchestrator", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Review a JSON source bundle and print the report
    Run {
        /// Source bundle produced by the discovery step
        #[arg(long)]
        input: PathBuf,
        /// Path to configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Markdown)]
        format: OutputFormat,
        /// Write the report here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
        /// Exit with status 1 when a critical or high finding survives
        #[arg(long)]
        fail_on_blockers: bool,
    },
    /// Validate a configuration file
    CheckConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the default configuration as TOML
    DefaultConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Markdown,
    Json,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn render(report: &ReviewReport, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Markdown => Ok(report.to_markdown()),
        OutputFormat::Json => {
            serde_json::to_string_pretty(report).context("Failed to serialize report")
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            input,
            config,
            format,
            output,
            fail_on_blockers,
        } => {
            let config = Config::resolve(config.as_deref())?;
            init_logging(&config.logging.level);
            tracing::info!(config = %config.config_path.display(), input = %input.display(), "Loaded configuration");

            let source = Arc::new(JsonFileSource::new(input));
            let pipeline = ReviewPipeline::from_config(&config, source)?;
            let mut session = ReviewSession::new();
            if let Err(e) = pipeline.run_session(&mut session).await {
                tracing::error!(session = session.id(), state = %session.state(), "Review failed");
                return Err(e.into());
            }

            if session.state() == &SessionState::Aborted(AbortReason::NoWork) {
                println!("nothing to review");
                return Ok(());
            }
            let report = session
                .into_report()
                .ok_or_else(|| anyhow::anyhow!("Session finished without a report"))?;

            let rendered = render(&report, format)?;
            match output {
                Some(path) => std::fs::write(&path, rendered)
                    .with_context(|| format!("Failed to write report to {}", path.display()))?,
                None => println!("{rendered}"),
            }

            if fail_on_blockers && report.has_blockers() {
                std::process::exit(1);
            }
        }
        Commands::CheckConfig { config } => {
            let config = Config::resolve(config.as_deref())?;
            init_logging(&config.logging.level);
            if config.analyzers.is_empty() {
                tracing::warn!("No [[analyzers]] configured; `run` will fail");
            }
            if config.scorer.is_none() {
                tracing::warn!("No [scorer] configured; `run` will fail");
            }
            println!("{}: ok", config.config_path.display());
        }
        Commands::DefaultConfig => {
            print!("{}", Config::default().to_toml()?);
        }
    }

    Ok(())
}
