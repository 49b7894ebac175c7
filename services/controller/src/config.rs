//! Controller configuration.
//!
//! Loaded from a YAML file (default `bisq.yaml`). `BISQ_LOG_LEVEL` overrides
//! the configured log level.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "bisq.yaml";

/// Environment variable each run command receives the assigned port under.
pub const PORT_ENV: &str = "BISQ_PORT";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Controller configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Port the application proxy listens on.
    pub port: u16,

    /// Port the admin surface listens on.
    pub admin_port: u16,

    /// Run `@preview/` tags alongside the latest version.
    pub preview: bool,

    /// Shell lines executed in order for each version.
    #[serde(rename = "run")]
    pub run_commands: Vec<String>,

    /// Version source location and credentials.
    pub repository: RepoConfig,

    /// Directory holding the tag index checkout and one checkout per version.
    pub workspace_dir: PathBuf,

    /// Seconds between periodic catalog refreshes.
    pub refresh_interval_secs: u64,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    pub github: GithubConfig,
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GithubConfig {
    pub repo_url: String,
    pub api_key: String,
}

impl fmt::Debug for GithubConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let api_key = if self.api_key.is_empty() { "" } else { "<redacted>" };
        f.debug_struct("GithubConfig")
            .field("repo_url", &self.repo_url)
            .field("api_key", &api_key)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            admin_port: 18080,
            preview: false,
            run_commands: vec!["go run dist/@$(uname -m)/server -p $BISQ_PORT".to_string()],
            repository: RepoConfig {
                github: GithubConfig {
                    repo_url: "https://github.com/apcandsons/echo-app".to_string(),
                    api_key: String::new(),
                },
            },
            workspace_dir: PathBuf::from(".bisq"),
            refresh_interval_secs: bisq_reconcile::DEFAULT_RECONCILE_INTERVAL.as_secs(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Parse configuration from YAML text. Missing keys take their defaults.
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(contents)?;
        Ok(config)
    }

    /// Load, apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = Self::from_yaml(&contents)?;
        if let Ok(level) = std::env::var("BISQ_LOG_LEVEL") {
            config.log_level = level;
        }
        config.validate()?;
        Ok(config)
    }

    /// Write this configuration as YAML.
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run_commands.iter().all(|c| c.trim().is_empty()) {
            return Err(ConfigError::Invalid("`run` must list at least one command".into()));
        }
        if self.repository.github.repo_url.trim().is_empty() {
            return Err(ConfigError::Invalid("`repository.github.repo_url` is required".into()));
        }
        if self.port == self.admin_port && self.port != 0 {
            return Err(ConfigError::Invalid(format!(
                "`port` and `admin_port` must differ (both {})",
                self.port
            )));
        }
        if self.refresh_interval_secs == 0 {
            return Err(ConfigError::Invalid("`refresh_interval_secs` must be positive".into()));
        }
        Ok(())
    }

    /// Application name: last path segment of the repository URL.
    pub fn app_name(&self) -> String {
        let url = self.repository.github.repo_url.trim_end_matches('/');
        let last = url.rsplit('/').next().unwrap_or(url);
        last.strip_suffix(".git").unwrap_or(last).to_string()
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}
