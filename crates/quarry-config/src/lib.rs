//! Configuration: YAML file, defaults, and environment overrides.
//!
//! Precedence, lowest to highest: built-in defaults, the YAML file,
//! `QUARRY_*` environment variables. Validation collects every problem
//! instead of bailing on the first.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    NotFound { path: String },

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataLakeConfig {
    pub enabled: bool,
    pub base_dir: String,
}

impl Default for DataLakeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_dir: "data_lake".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_lake: DataLakeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Path of the SQLite database file.
    pub database_path: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            database_path: "quarry.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub batch_size: usize,
    pub max_retries: u32,
    pub enable_discovery: bool,
    pub max_workers: usize,
    pub lease_seconds: u64,
    pub heartbeat_interval: u64,
    pub base_backoff_seconds: f64,
    pub max_backoff_seconds: f64,
    pub respect_retry_after: bool,
    /// 0 = unlimited.
    pub requests_per_second: f64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_retries: 3,
            enable_discovery: true,
            max_workers: 4,
            lease_seconds: 300,
            heartbeat_interval: 30,
            base_backoff_seconds: 2.0,
            max_backoff_seconds: 300.0,
            respect_retry_after: true,
            requests_per_second: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub endpoint: String,
    pub model: String,
    pub poll_seconds: u64,
    pub timeout_seconds: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434".to_string(),
            model: "llama3.2".to_string(),
            poll_seconds: 10,
            timeout_seconds: 300,
        }
    }
}

/// One configured upstream source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub system: String,
    #[serde(default)]
    pub requests_per_second: f64,
    #[serde(default)]
    pub contact_email: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Seed work items declared in config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedConfig {
    pub source_system: String,
    pub source_name: String,
    pub resource_type: String,
    pub resource_ids: Vec<String>,
    /// `{id}` is replaced with the resource id.
    pub uri_template: String,
    #[serde(default = "default_seed_priority")]
    pub priority: i64,
}

fn default_seed_priority() -> i64 {
    100
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub state: StateConfig,
    pub runner: RunnerConfig,
    pub llm: LlmConfig,
    pub sources: Vec<SourceConfig>,
    pub seeds: Vec<SeedConfig>,
}

impl Config {
    /// Load from an optional YAML file, then apply env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::NotFound {
                        path: path.display().to_string(),
                    });
                }
                info!(path = %path.display(), "loading config");
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                    path: path.display().to_string(),
                    source,
                })?
            }
            None => Self::default(),
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment wins over file values.
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("QUARRY_DATA_LAKE_DIR") {
            self.storage.data_lake.base_dir = dir;
        }
        if let Ok(path) = std::env::var("QUARRY_DATABASE_PATH") {
            self.state.database_path = path;
        }
        if let Ok(endpoint) = std::env::var("QUARRY_LLM_ENDPOINT") {
            self.llm.endpoint = endpoint;
        }
        if let Ok(model) = std::env::var("QUARRY_LLM_MODEL") {
            self.llm.model = model;
        }
        if let Ok(workers) = std::env::var("QUARRY_MAX_WORKERS") {
            if let Ok(value) = workers.parse() {
                self.runner.max_workers = value;
            }
        }
        if let Ok(lease) = std::env::var("QUARRY_LEASE_SECONDS") {
            if let Ok(value) = lease.parse() {
                self.runner.lease_seconds = value;
            }
        }
    }

    /// Collect every validation problem.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.runner.batch_size == 0 {
            errors.push("runner.batch_size must be at least 1".to_string());
        }
        if self.runner.max_workers == 0 {
            errors.push("runner.max_workers must be at least 1".to_string());
        }
        if self.runner.lease_seconds == 0 {
            errors.push("runner.lease_seconds must be positive".to_string());
        }
        if self.runner.heartbeat_interval >= self.runner.lease_seconds {
            errors.push(format!(
                "runner.heartbeat_interval ({}) must be shorter than runner.lease_seconds ({})",
                self.runner.heartbeat_interval, self.runner.lease_seconds
            ));
        }
        if self.runner.base_backoff_seconds <= 0.0 {
            errors.push("runner.base_backoff_seconds must be positive".to_string());
        }
        if self.runner.max_backoff_seconds < self.runner.base_backoff_seconds {
            errors.push("runner.max_backoff_seconds must be >= base_backoff_seconds".to_string());
        }
        if self.state.database_path.is_empty() {
            errors.push("state.database_path must not be empty".to_string());
        }
        for seed in &self.seeds {
            if !seed.uri_template.contains("{id}") {
                errors.push(format!(
                    "seed for {}/{} has a uri_template without an {{id}} placeholder",
                    seed.source_system, seed.source_name
                ));
            }
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_empty());
        assert_eq!(config.runner.batch_size, 10);
        assert_eq!(config.runner.lease_seconds, 300);
        assert_eq!(config.runner.heartbeat_interval, 30);
        assert!(config.runner.respect_retry_after);
    }

    #[test]
    fn yaml_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
runner:
  batch_size: 25
  max_workers: 2
state:
  database_path: /tmp/custom.db
sources:
  - name: wookieepedia
    system: mediawiki
    requests_per_second: 1.5
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();

        assert_eq!(config.runner.batch_size, 25);
        assert_eq!(config.runner.max_workers, 2);
        // Untouched sections keep defaults.
        assert_eq!(config.runner.lease_seconds, 300);
        assert_eq!(config.state.database_path, "/tmp/custom.db");
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].system, "mediawiki");
        assert!(config.sources[0].enabled);
    }

    #[test]
    fn missing_file_is_an_error() {
        let result = Config::load(Some(Path::new("/definitely/not/here.yaml")));
        assert!(matches!(result, Err(ConfigError::NotFound { .. })));
    }

    #[test]
    fn heartbeat_must_fit_inside_lease() {
        let mut config = Config::default();
        config.runner.heartbeat_interval = 600;
        assert!(config
            .validate()
            .iter()
            .any(|e| e.contains("heartbeat_interval")));
    }

    #[test]
    fn seed_template_requires_placeholder() {
        let mut config = Config::default();
        config.seeds.push(SeedConfig {
            source_system: "test".into(),
            source_name: "seeded".into(),
            resource_type: "item".into(),
            resource_ids: vec!["a".into()],
            uri_template: "https://example.com/fixed".into(),
            priority: 100,
        });
        assert!(config.validate().iter().any(|e| e.contains("{id}")));
    }

    #[test]
    fn multiple_errors_collected() {
        let mut config = Config::default();
        config.runner.batch_size = 0;
        config.runner.max_workers = 0;
        config.state.database_path = String::new();
        assert!(config.validate().len() >= 3);
    }
}
