use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub log: LogConfig,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory holding one mirror per repository.
    pub base_dir: PathBuf,
    /// Path of the embedded metadata database file.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("/var/lib/mirrorcache/metadata.redb")
}

// ---------------------------------------------------------------------------
// Upstream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL repositories are mirrored from; `{base_url}/{owner}/{name}`.
    #[serde(default = "default_upstream_base_url")]
    pub base_url: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_upstream_base_url(),
        }
    }
}

impl UpstreamConfig {
    /// Origin URL for `owner/name`.
    pub fn repo_url(&self, owner: &str, name: &str) -> String {
        format!("{}/{owner}/{name}", self.base_url.trim_end_matches('/'))
    }
}

fn default_upstream_base_url() -> String {
    "https://github.com".to_string()
}

// ---------------------------------------------------------------------------
// Cache behaviour
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Seconds a freshly cloned mirror is served without revalidation.
    #[serde(default = "default_fresh_ttl", alias = "expire")]
    pub fresh_ttl: u64,
    /// Seconds a revalidated-unchanged mirror is served before the next probe.
    #[serde(default = "default_stale_ttl", alias = "expire_ex")]
    pub stale_ttl: u64,
    /// Upper bound (seconds) on a single remote HEAD probe.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout: u64,
    /// Upper bound (seconds) on a single full mirror clone.
    #[serde(default = "default_clone_timeout")]
    pub clone_timeout: u64,
    /// Semaphore limit for concurrent full clones against upstream.
    #[serde(default = "default_max_concurrent_clones")]
    pub max_concurrent_clones: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fresh_ttl: default_fresh_ttl(),
            stale_ttl: default_stale_ttl(),
            probe_timeout: default_probe_timeout(),
            clone_timeout: default_clone_timeout(),
            max_concurrent_clones: default_max_concurrent_clones(),
        }
    }
}

impl CacheConfig {
    pub fn fresh_ttl(&self) -> Duration {
        Duration::from_secs(self.fresh_ttl)
    }

    pub fn stale_ttl(&self) -> Duration {
        Duration::from_secs(self.stale_ttl)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout)
    }

    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_timeout)
    }
}

fn default_fresh_ttl() -> u64 {
    1800
}

fn default_stale_ttl() -> u64 {
    600
}

fn default_probe_timeout() -> u64 {
    30
}

fn default_clone_timeout() -> u64 {
    1800
}

fn default_max_concurrent_clones() -> usize {
    4
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents)
        .with_context(|| format!("failed to load config file: {}", path.display()))
}

/// Parse and validate a [`Config`] from YAML text.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents).context("invalid YAML")?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        !config.storage.base_dir.as_os_str().is_empty(),
        "storage.base_dir must not be empty"
    );
    anyhow::ensure!(config.cache.fresh_ttl > 0, "cache.fresh_ttl must be > 0");
    anyhow::ensure!(config.cache.stale_ttl > 0, "cache.stale_ttl must be > 0");
    anyhow::ensure!(
        config.cache.probe_timeout > 0 && config.cache.clone_timeout > 0,
        "cache timeouts must be > 0"
    );
    anyhow::ensure!(
        config.cache.max_concurrent_clones >= 1,
        "cache.max_concurrent_clones must be at least 1"
    );
    anyhow::ensure!(
        config.upstream.base_url.starts_with("http://")
            || config.upstream.base_url.starts_with("https://")
            || config.upstream.base_url.starts_with("file://"),
        "upstream.base_url must be an http(s) or file URL"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse_config("storage:\n  base_dir: /srv/mirrors\n").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:8080");
        assert_eq!(config.cache.fresh_ttl(), Duration::from_secs(30 * 60));
        assert_eq!(config.cache.stale_ttl(), Duration::from_secs(10 * 60));
        assert_eq!(config.cache.max_concurrent_clones, 4);
        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(
            config.storage.database_path,
            PathBuf::from("/var/lib/mirrorcache/metadata.redb")
        );
    }

    #[test]
    fn repo_url_joins_owner_and_name() {
        let upstream = UpstreamConfig {
            base_url: "https://git.example.com/".to_string(),
        };
        assert_eq!(
            upstream.repo_url("alice", "repo1"),
            "https://git.example.com/alice/repo1"
        );
    }

    #[test]
    fn legacy_ttl_names_are_accepted() {
        let yaml = "storage:\n  base_dir: /srv\ncache:\n  expire: 120\n  expire_ex: 60\n";
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.cache.fresh_ttl, 120);
        assert_eq!(config.cache.stale_ttl, 60);
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let yaml = "storage:\n  base_dir: /srv\ncache:\n  stale_ttl: 0\n";
        assert!(parse_config(yaml).is_err());
    }

    #[test]
    fn missing_storage_is_rejected() {
        assert!(parse_config("server:\n  listen: 127.0.0.1:9000\n").is_err());
    }
}
