//! `config.toml` and on-disk layout.
//!
//! Every field has a default so a missing or partial file is fine. A missing
//! file is written out with defaults on first load.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_ENDPOINT: &str = "https://new.ednovas.dev";
pub const DEFAULT_CONTROLLER_PORT: u16 = 9090;
pub const DEFAULT_MIXED_PORT: u16 = 7890;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub core: CoreConfig,
    pub proxy: ProxyConfig,
    pub upstream: UpstreamConfig,
    pub subscription: SubscriptionConfig,
    pub latency: LatencyConfig,
}

/// Proxy-core process and control API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoreConfig {
    /// Extra resource root searched before the built-in layouts.
    pub resources_dir: Option<PathBuf>,
    /// Pause between orphan cleanup and spawn, letting the OS release ports.
    pub settle_delay_ms: u64,
    /// Also kill stray cores by exact executable name, not just the recorded PID.
    pub kill_orphans_by_name: bool,
    pub controller_port: u16,
    /// Pick a random loopback port once and persist it instead of `controller_port`.
    pub randomize_controller_port: bool,
    pub controller_secret: String,
    pub ready_poll_interval_ms: u64,
    pub ready_max_attempts: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            resources_dir: None,
            settle_delay_ms: 2000,
            kill_orphans_by_name: true,
            controller_port: DEFAULT_CONTROLLER_PORT,
            randomize_controller_port: false,
            controller_secret: String::new(),
            ready_poll_interval_ms: 1000,
            ready_max_attempts: 120,
        }
    }
}

impl CoreConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// Local listener the system proxy points at.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProxyConfig {
    pub host: String,
    pub mixed_port: u16,
    pub allow_lan: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            mixed_port: DEFAULT_MIXED_PORT,
            allow_lan: false,
        }
    }
}

/// Backend API mirrors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpstreamConfig {
    pub default_endpoint: String,
    /// JSON documents listing mirror URLs, tried in order.
    pub remote_lists: Vec<String>,
    pub fallbacks: Vec<String>,
    pub probe_timeout_ms: u64,
    pub max_failover_attempts: usize,
    /// Path segment placed between the endpoint and the token in subscribe URLs.
    pub subscribe_path: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            default_endpoint: DEFAULT_ENDPOINT.into(),
            remote_lists: vec![
                "https://raw.githubusercontent.com/EdNovas/config/refs/heads/main/domains.json"
                    .into(),
                "https://aaa.ednovas.xyz/domains.json".into(),
            ],
            fallbacks: vec![
                "https://new.ednovas.org".into(),
                "https://cdn.ednovas.world".into(),
            ],
            probe_timeout_ms: 3000,
            max_failover_attempts: 3,
            subscribe_path: "/2cvme3wa8i/".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SubscriptionConfig {
    pub cache_ttl_hours: i64,
    pub user_agent: String,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            cache_ttl_hours: 72,
            user_agent: "ClashforWindows/0.19.0".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LatencyConfig {
    pub probe_url: String,
    pub timeout_ms: u64,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            probe_url: "http://www.gstatic.com/generate_204".into(),
            timeout_ms: 2000,
        }
    }
}

impl Config {
    /// Load `path`, writing defaults there when it does not exist yet.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            tracing::info!("wrote default configuration to {}", path.display());
            return Ok(config);
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("invalid configuration in {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let raw = toml::to_string_pretty(self).context("failed to serialize configuration")?;
        std::fs::write(path, raw).with_context(|| format!("failed to write {}", path.display()))
    }
}

/// Where everything lives on disk.
#[derive(Debug, Clone)]
pub struct AppPaths {
    config_dir: PathBuf,
    data_dir: PathBuf,
}

impl AppPaths {
    /// Platform directories (`~/.config/ednovas-cloud`, `%APPDATA%\EdNovas\...`).
    pub fn discover() -> Result<Self> {
        let dirs = directories::ProjectDirs::from("dev", "EdNovas", "ednovas-cloud")
            .context("could not determine a home directory")?;
        Ok(Self {
            config_dir: dirs.config_dir().to_path_buf(),
            data_dir: dirs.data_dir().to_path_buf(),
        })
    }

    /// Everything under one root. Used by tests and `--home`.
    pub fn rooted(root: &Path) -> Self {
        Self {
            config_dir: root.join("config"),
            data_dir: root.join("data"),
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn state_file(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }

    pub fn subscription_cache(&self) -> PathBuf {
        self.data_dir.join("subscription.json")
    }

    /// Working directory handed to the core with `-d`.
    pub fn core_dir(&self) -> PathBuf {
        self.data_dir.join("core")
    }

    pub fn core_config(&self) -> PathBuf {
        self.core_dir().join("config.yaml")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.core_dir().join("core.pid")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn ensure(&self) -> Result<()> {
        for dir in [&self.config_dir, &self.core_dir(), &self.log_dir()] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = Config::load_or_init(&path).unwrap();
        assert_eq!(config, Config::default());
        assert!(path.exists());
        assert_eq!(Config::load_or_init(&path).unwrap(), config);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[core]\nrandomize_controller_port = true\n\n[upstream]\nfallbacks = [\"https://m.example\"]\n",
        )
        .unwrap();
        let config = Config::load_or_init(&path).unwrap();
        assert!(config.core.randomize_controller_port);
        assert_eq!(config.core.controller_port, 9090);
        assert_eq!(config.upstream.fallbacks, ["https://m.example"]);
        assert_eq!(config.upstream.default_endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.subscription.cache_ttl_hours, 72);
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[core\n").unwrap();
        assert!(Config::load_or_init(&path).is_err());
    }

    #[test]
    fn rooted_layout() {
        let paths = AppPaths::rooted(Path::new("/tmp/x"));
        assert_eq!(paths.core_config(), Path::new("/tmp/x/data/core/config.yaml"));
        assert_eq!(paths.config_file(), Path::new("/tmp/x/config/config.toml"));
    }
}
