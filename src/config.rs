//! Configuration loader and validator for the listing pipeline.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub upstream: Upstream,
    pub ingestion: Ingestion,
    pub reconciliation: Reconciliation,
    pub leases: Leases,
    #[serde(default)]
    pub scoring: Scoring,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".into()
}

/// Marketplace API access and 429 handling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Upstream {
    /// Bearer token. Empty means "read LZT_API_TOKEN when first needed".
    #[serde(default)]
    pub token: String,
    pub user_agent: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ingestion {
    pub page_pause_ms: u64,
    pub run_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reconciliation {
    pub batch_size: u32,
    pub max_concurrency: usize,
    pub run_timeout_secs: u64,
    #[serde(default)]
    pub resume_interrupted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Leases {
    pub ttl_secs: u64,
}

/// Reserved for an external scorer. The binary ships without one, so
/// `enabled: true` only logs a warning and scores stay empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scoring {
    #[serde(default)]
    pub enabled: bool,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// `app.database_url`, then `DATABASE_URL`, then a file under `data_dir`.
    pub fn database_url(&self) -> String {
        if let Some(url) = self.app.database_url.as_deref().filter(|u| !u.trim().is_empty()) {
            return url.to_string();
        }
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/listings.db", self.app.data_dir))
    }

    pub fn page_pause(&self) -> Duration {
        Duration::from_millis(self.ingestion.page_pause_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.leases.ttl_secs)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.log_level.trim().is_empty() {
        return Err(ConfigError::Invalid("app.log_level must be non-empty"));
    }

    if cfg.upstream.user_agent.trim().is_empty() {
        return Err(ConfigError::Invalid("upstream.user_agent must be non-empty"));
    }
    if cfg.upstream.timeout_secs == 0 {
        return Err(ConfigError::Invalid("upstream.timeout_secs must be > 0"));
    }
    if cfg.upstream.backoff_base_ms == 0 {
        return Err(ConfigError::Invalid("upstream.backoff_base_ms must be > 0"));
    }
    if cfg.upstream.backoff_max_ms < cfg.upstream.backoff_base_ms {
        return Err(ConfigError::Invalid(
            "upstream.backoff_max_ms must be >= upstream.backoff_base_ms",
        ));
    }

    if cfg.ingestion.run_timeout_secs == 0 {
        return Err(ConfigError::Invalid("ingestion.run_timeout_secs must be > 0"));
    }

    if cfg.reconciliation.batch_size == 0 {
        return Err(ConfigError::Invalid("reconciliation.batch_size must be > 0"));
    }
    if cfg.reconciliation.max_concurrency == 0 {
        return Err(ConfigError::Invalid(
            "reconciliation.max_concurrency must be > 0",
        ));
    }
    if cfg.reconciliation.run_timeout_secs == 0 {
        return Err(ConfigError::Invalid(
            "reconciliation.run_timeout_secs must be > 0",
        ));
    }

    if cfg.leases.ttl_secs == 0 {
        return Err(ConfigError::Invalid("leases.ttl_secs must be > 0"));
    }
    let longest_run = cfg
        .ingestion
        .run_timeout_secs
        .max(cfg.reconciliation.run_timeout_secs);
    if cfg.leases.ttl_secs <= longest_run {
        return Err(ConfigError::Invalid(
            "leases.ttl_secs must exceed every run_timeout_secs",
        ));
    }

    Ok(())
}

/// Example configuration written by `init-config`.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  # database_url: "sqlite://./data/listings.db"
  log_level: "info"

upstream:
  # Leave empty to read LZT_API_TOKEN from the environment.
  token: ""
  user_agent: "listing-sync/0.1"
  timeout_secs: 30
  max_retries: 3
  backoff_base_ms: 1000
  backoff_max_ms: 30000

ingestion:
  page_pause_ms: 1000
  run_timeout_secs: 1800

reconciliation:
  batch_size: 50
  max_concurrency: 8
  run_timeout_secs: 3600
  resume_interrupted: true

leases:
  ttl_secs: 3900

# Reserved: no scorer is bundled, so listings keep an empty score.
scoring:
  enabled: false
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> Config {
        serde_yaml::from_str(example()).unwrap()
    }

    #[test]
    fn parse_example_ok() {
        let cfg = sample();
        validate(&cfg).unwrap();
        assert_eq!(cfg.reconciliation.batch_size, 50);
        assert_eq!(cfg.page_pause(), Duration::from_millis(1000));
        assert!(!cfg.scoring.enabled);
    }

    #[test]
    fn scoring_section_is_optional() {
        let trimmed = example().replace("scoring:\n  enabled: false\n", "");
        let cfg: Config = serde_yaml::from_str(&trimmed).unwrap();
        assert_eq!(cfg.scoring, Scoring::default());
    }

    #[test]
    fn invalid_sizes() {
        let mut cfg = sample();
        cfg.reconciliation.batch_size = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("batch_size")),
            _ => panic!("wrong error"),
        }

        let mut cfg = sample();
        cfg.reconciliation.max_concurrency = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = sample();
        cfg.leases.ttl_secs = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn lease_must_outlive_runs() {
        let mut cfg = sample();
        cfg.leases.ttl_secs = cfg.reconciliation.run_timeout_secs;
        match validate(&cfg).unwrap_err() {
            ConfigError::Invalid(msg) => assert!(msg.contains("ttl_secs")),
            _ => panic!("wrong error"),
        }

        let mut cfg = sample();
        cfg.ingestion.run_timeout_secs = cfg.leases.ttl_secs + 1;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = sample();
        cfg.leases.ttl_secs = cfg.reconciliation.run_timeout_secs + 1;
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn invalid_backoff_window() {
        let mut cfg = sample();
        cfg.upstream.backoff_max_ms = 10;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("backoff_max_ms")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn database_url_prefers_config() {
        let mut cfg = sample();
        cfg.app.database_url = Some("sqlite::memory:".into());
        assert_eq!(cfg.database_url(), "sqlite::memory:");
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg = sample();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.upstream.max_retries, 3);
        assert!(cfg.reconciliation.resume_interrupted);
    }
}
