//! cmdbridge configuration loading and parsing

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "/etc/cmdbridge/config.toml";

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct BridgeConfig {
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub host: HostConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    /// Timeout applied when a call does not pick its own
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Working directory used when a call gives none
    #[serde(default)]
    pub default_cwd: Option<String>,
    /// Rewrite `/` to `\` in working directories
    #[serde(default = "default_windows_paths")]
    pub windows_paths: bool,
    /// Treat `progress_flag` in the argument list as a request to watch progress
    #[serde(default)]
    pub infer_progress_from_args: bool,
    #[serde(default = "default_progress_flag")]
    pub progress_flag: String,
    /// Debug-log every dispatch, result and timeout
    #[serde(default)]
    pub log_commands: bool,
}

impl DispatcherConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
            default_cwd: None,
            windows_paths: default_windows_paths(),
            infer_progress_from_args: false,
            progress_flag: default_progress_flag(),
            log_commands: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    /// Per-stream capture limit in buffered mode
    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_buffer_bytes: default_max_buffer_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_timeout_seconds() -> u64 { 30 }
fn default_windows_paths() -> bool { cfg!(windows) }
fn default_progress_flag() -> String { "--progress".into() }
fn default_max_buffer_bytes() -> usize { 20 * 1024 * 1024 }
fn default_log_level() -> String { "info".into() }

impl BridgeConfig {
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: BridgeConfig = toml::from_str(content).context("Failed to parse config")?;
        if config.executor.max_buffer_bytes == 0 {
            anyhow::bail!("executor.max_buffer_bytes must be greater than zero");
        }
        Ok(config)
    }
}

/// Load configuration from /etc/cmdbridge/config.toml, or `CMDBRIDGE_CONFIG`
pub fn load_config() -> Result<BridgeConfig> {
    let config_path =
        std::env::var("CMDBRIDGE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    load_config_from(&config_path)
}

pub fn load_config_from(config_path: impl AsRef<Path>) -> Result<BridgeConfig> {
    let config_path = config_path.as_ref();
    if config_path.exists() {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config from {}", config_path.display()))?;
        BridgeConfig::from_toml(&content)
            .with_context(|| format!("Failed to parse config from {}", config_path.display()))
    } else {
        tracing::warn!(
            "Config file not found at {}, using defaults",
            config_path.display()
        );
        Ok(BridgeConfig::default())
    }
}
