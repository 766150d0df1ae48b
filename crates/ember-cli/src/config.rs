//! CLI configuration management.

use anyhow::{Context, Result, anyhow};
use ember_core::config::EngineConfig;
use ember_engine::ExplorerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// PostgreSQL connection string.
    pub database_url: Option<String>,
    /// Network used when a command names none.
    pub default_network: String,
    pub engine: EngineConfig,
    pub explorers: ExplorerConfig,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            default_network: "ethereum".to_string(),
            engine: EngineConfig::default(),
            explorers: ExplorerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl CliConfig {
    /// Load configuration from `path`, or from the default location when it
    /// exists, then overlay the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::read(path)?,
            None => match Self::config_path() {
                Some(path) if path.exists() => Self::read(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.engine.validate()?;
        Ok(config)
    }

    fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Get the configuration file path.
    pub fn config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "ember", "ember")
            .map(|dirs| dirs.config_dir().join("config.yaml"))
    }

    /// `EMBER_DATABASE_URL` wins over `DATABASE_URL`, which wins over the
    /// file. `EMBER_API_KEY_<NETWORK>` sets an explorer API key.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("EMBER_DATABASE_URL").or_else(|| lookup("DATABASE_URL")) {
            self.database_url = Some(url);
        }
        for (network, endpoint) in self.explorers.networks.iter_mut() {
            let key = format!("EMBER_API_KEY_{}", network.to_uppercase());
            if let Some(api_key) = lookup(&key) {
                endpoint.api_key = Some(api_key);
            }
        }
    }

    pub fn database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .ok_or_else(|| anyhow!("no database configured; set EMBER_DATABASE_URL or database_url"))
    }

    pub fn network_or_default<'a>(&'a self, network: Option<&'a str>) -> &'a str {
        network.unwrap_or(&self.default_network)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "default_network: bsc\nengine:\n  queue:\n    max_retries: 5\nexplorers:\n  request_timeout_secs: 5\n",
        )
        .unwrap();

        let config = CliConfig::read(&path).unwrap();
        assert_eq!(config.default_network, "bsc");
        assert_eq!(config.engine.queue.max_retries, 5);
        assert_eq!(config.engine.cache.freshness_floor, 0.7);
        assert_eq!(config.explorers.request_timeout_secs, 5);
        assert!(config.explorers.networks.contains_key("ethereum"));
    }

    #[test]
    fn test_out_of_range_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "engine:\n  cache:\n    ttl_hours:\n      source: 9223372036854775807\n").unwrap();

        let err = CliConfig::load(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("ttl_hours.source"));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CliConfig::load(Some(&dir.path().join("absent.yaml"))).is_err());
    }

    #[test]
    fn test_env_overlay() {
        let env: HashMap<&str, &str> = [
            ("DATABASE_URL", "postgres://fallback"),
            ("EMBER_DATABASE_URL", "postgres://ember"),
            ("EMBER_API_KEY_ETHEREUM", "abc123"),
        ]
        .into_iter()
        .collect();

        let mut config = CliConfig::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.database_url().unwrap(), "postgres://ember");
        assert_eq!(
            config.explorers.networks["ethereum"].api_key.as_deref(),
            Some("abc123")
        );
        assert!(config.explorers.networks["bsc"].api_key.is_none());
    }

    #[test]
    fn test_database_url_required() {
        let config = CliConfig::default();
        assert!(config.database_url().is_err());
        assert_eq!(config.network_or_default(None), "ethereum");
        assert_eq!(config.network_or_default(Some("polygon")), "polygon");
    }
}
