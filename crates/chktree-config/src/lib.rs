//! Shared configuration for chktree tools
//!
//! Reads from ~/.chktree/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default daemon address
pub const DEFAULT_DAEMON_ADDRESS: &str = "127.0.0.1:2087";

/// Top-level config structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub content: ContentConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub anonymity: AnonymityConfig,
}

/// Daemon connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

fn default_address() -> String {
    DEFAULT_DAEMON_ADDRESS.to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

/// How inserted content is announced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentConfig {
    /// Priority attached to inserted and indexed blocks
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Index leaves in place instead of uploading them
    #[serde(default)]
    pub index: bool,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            priority: default_priority(),
            index: false,
        }
    }
}

fn default_priority() -> u32 {
    0xFFFF
}

/// Request scheduler tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_ttl_decrement_ms")]
    pub ttl_decrement_ms: u64,
    /// Hard TTL cap, in multiples of `ttl_decrement_ms`
    #[serde(default = "default_max_ttl_factor")]
    pub max_ttl_factor: u64,
    #[serde(default = "default_initial_ttl_ms")]
    pub initial_ttl_ms: u64,
    #[serde(default = "default_initial_congestion_window")]
    pub initial_congestion_window: u32,
    #[serde(default = "default_initial_ssthresh")]
    pub initial_ssthresh: u32,
    /// A "content seems not available" warning fires every `max_tries * 50` tries
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,
    /// Moving-average weight for the initial TTL estimate
    #[serde(default = "default_ttl_weight")]
    pub ttl_weight: u64,
    /// Weight used when a reply took unusually long
    #[serde(default = "default_ttl_weight_fast")]
    pub ttl_weight_fast: u64,
    #[serde(default = "default_min_sleep_ms")]
    pub min_sleep_ms: u64,
    #[serde(default = "default_max_sleep_ms")]
    pub max_sleep_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            ttl_decrement_ms: default_ttl_decrement_ms(),
            max_ttl_factor: default_max_ttl_factor(),
            initial_ttl_ms: default_initial_ttl_ms(),
            initial_congestion_window: default_initial_congestion_window(),
            initial_ssthresh: default_initial_ssthresh(),
            max_tries: default_max_tries(),
            ttl_weight: default_ttl_weight(),
            ttl_weight_fast: default_ttl_weight_fast(),
            min_sleep_ms: default_min_sleep_ms(),
            max_sleep_ms: default_max_sleep_ms(),
        }
    }
}

fn default_ttl_decrement_ms() -> u64 {
    5000
}

fn default_max_ttl_factor() -> u64 {
    100
}

fn default_initial_ttl_ms() -> u64 {
    5000
}

fn default_initial_congestion_window() -> u32 {
    1
}

fn default_initial_ssthresh() -> u32 {
    65535
}

fn default_max_tries() -> u32 {
    50
}

fn default_ttl_weight() -> u64 {
    15
}

fn default_ttl_weight_fast() -> u64 {
    127
}

fn default_min_sleep_ms() -> u64 {
    100
}

fn default_max_sleep_ms() -> u64 {
    5000
}

/// Cover traffic requirements; 0 disables a check
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnonymityConfig {
    #[serde(default)]
    pub send_policy: i32,
    #[serde(default)]
    pub receive_policy: i32,
}

impl Config {
    /// Load ~/.chktree/config.toml, writing the defaults there on first use
    pub fn load() -> Result<Self> {
        Self::load_from(&get_config_path())
    }

    /// Load the config at `path`; a missing file is created with defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Config::default();
            config.save_to(path)?;
            return Ok(config);
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read chktree config {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Invalid chktree config {}", path.display()))
    }

    /// Like [`Config::load`], falling back to defaults on any error
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&get_config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).with_context(|| {
                format!("Failed to create chktree config directory {}", dir.display())
            })?;
        }
        let content = toml::to_string_pretty(self).context("Failed to encode chktree config")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write chktree config {}", path.display()))
    }
}

/// Get the chktree directory (~/.chktree)
pub fn get_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CHKTREE_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".chktree")
}

/// Get the config file path (~/.chktree/config.toml)
pub fn get_config_path() -> PathBuf {
    get_config_dir().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.daemon.address, "127.0.0.1:2087");
        assert_eq!(config.content.priority, 0xFFFF);
        assert!(!config.content.index);
        assert_eq!(config.scheduler.initial_ttl_ms, 5000);
        assert_eq!(config.anonymity.send_policy, 0);
    }

    #[test]
    fn test_parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.scheduler, SchedulerConfig::default());
        assert_eq!(config.daemon.reconnect_delay_ms, 1000);
    }

    #[test]
    fn test_parse_partial_config() {
        let toml = r#"
[scheduler]
initial_ttl_ms = 2000
ttl_weight = 7

[content]
index = true
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.scheduler.initial_ttl_ms, 2000);
        assert_eq!(config.scheduler.ttl_weight, 7);
        assert_eq!(config.scheduler.ttl_decrement_ms, 5000);
        assert_eq!(config.scheduler.max_sleep_ms, 5000);
        assert!(config.content.index);
        assert_eq!(config.content.priority, 0xFFFF);
    }

    #[test]
    fn test_anonymity_policy_values() {
        let toml = r#"
[anonymity]
receive_policy = 2003
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.anonymity.receive_policy, 2003);
        assert_eq!(config.anonymity.send_policy, 0);
    }

    #[test]
    fn test_save_round_trip() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.scheduler, config.scheduler);
        assert_eq!(parsed.daemon.address, config.daemon.address);
    }

    #[test]
    fn test_load_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.daemon.address, DEFAULT_DAEMON_ADDRESS);
        assert!(path.exists());

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.scheduler, config.scheduler);
    }

    #[test]
    fn test_save_then_load_keeps_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        config.daemon.reconnect_delay_ms = 250;
        config.anonymity.receive_policy = 1003;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.daemon.reconnect_delay_ms, 250);
        assert_eq!(loaded.anonymity.receive_policy, 1003);
    }

    #[test]
    fn test_invalid_file_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[daemon\naddress = 1").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("Invalid chktree config"), "{message}");
        assert!(message.contains("config.toml"), "{message}");
    }
}
