pub mod schema;

#[allow(unused_imports)]
pub use schema::{
    AnalyzerConfig, Config, LoggingConfig, ReviewConfig, ScoringConfig, SourceConfig,
    StageConfig, WorkerCommandConfig, DEFAULT_EXCLUDES,
};

use std::path::{Path, PathBuf};

/// Environment variable that points at an alternate config file.
pub const CONFIG_ENV: &str = "REVIEW_ORCHESTRATOR_CONFIG";

/// `~/.review-orchestrator/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
    let home = directories::UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
    Ok(home.join(".review-orchestrator").join("config.toml"))
}

impl Config {
    /// Parse and validate a config file.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config {}: {e}", path.display()))?;
        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse config {}: {e}", path.display()))?;
        config.config_path = path.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    /// Resolve the config: explicit path, then `$REVIEW_ORCHESTRATOR_CONFIG`,
    /// then the default location. A missing default file yields defaults.
    pub fn resolve(explicit: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::load_from(Path::new(&path));
        }

        let path = default_config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self {
                config_path: path,
                ..Self::default()
            })
        }
    }

    /// Pretty TOML of the current settings.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).map_err(|e| anyhow::anyhow!("Failed to serialize config: {e}"))
    }
}
