use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Main settings structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub reports: ReportsConfig,
}

/// Runner tuning: worker count, pacing, retry budget.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,
    /// Pause between queries (and between validation batches), in milliseconds.
    /// 0 disables pacing.
    #[serde(default)]
    pub sleep_ms: u64,
    /// Retries allowed per search call before the query is skipped.
    #[serde(default = "default_retries")]
    pub retries: usize,
    /// Document id field; empty means "ask the search client for its default".
    #[serde(default)]
    pub id_field: String,
}

/// Experiment generation bounds
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_max_experiments")]
    pub max_experiments: usize,
}

/// Report output configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ReportsConfig {
    #[serde(default = "default_reports_dir")]
    pub dir: PathBuf,
    /// Cap on experiments per significance matrix.
    #[serde(default = "default_max_matrix_cols")]
    pub max_matrix_cols: usize,
}

fn default_num_threads() -> usize {
    8
}

fn default_retries() -> usize {
    2
}

fn default_max_experiments() -> usize {
    10_000
}

fn default_reports_dir() -> PathBuf {
    PathBuf::from("reports")
}

fn default_max_matrix_cols() -> usize {
    100
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            num_threads: default_num_threads(),
            sleep_ms: 0,
            retries: default_retries(),
            id_field: String::new(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_experiments: default_max_experiments(),
        }
    }
}

impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            dir: default_reports_dir(),
            max_matrix_cols: default_max_matrix_cols(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            runner: RunnerConfig::default(),
            generation: GenerationConfig::default(),
            reports: ReportsConfig::default(),
        }
    }
}

impl Settings {
    /// Load settings from file.
    ///
    /// Looks for the settings file in this order:
    /// 1. Path specified in QUERYTUNE_CONFIG environment variable
    /// 2. ./querytune.toml in current directory
    ///
    /// A missing file yields the defaults; a malformed file is an error.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("QUERYTUNE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("querytune.toml"));

        if !config_path.exists() {
            return Ok(Settings::default());
        }

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read settings file: {}", config_path.display()))?;

        let settings: Settings =
            toml::from_str(&config_str).context("Failed to parse querytune.toml")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate settings values
    fn validate(&self) -> Result<()> {
        if self.runner.num_threads == 0 {
            anyhow::bail!("runner.num_threads must be greater than 0");
        }

        if self.generation.max_experiments == 0 {
            anyhow::bail!("generation.max_experiments must be greater than 0");
        }

        if self.reports.max_matrix_cols < 2 {
            anyhow::bail!("reports.max_matrix_cols must be at least 2");
        }

        Ok(())
    }
}
