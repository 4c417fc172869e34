use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON5 parse error: {0}")]
    Json5(#[from] json5::Error),
    #[error("Config directory not found")]
    NoDirFound,
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronConfig {
    /// Whether the scheduler runs at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Override for the cron store directory (defaults to `<config>/cron`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_dir: Option<String>,
    /// Upper bound on the scheduler sleep between ticks, in milliseconds.
    #[serde(default = "default_poll_ceiling_ms")]
    pub poll_ceiling_ms: i64,
    /// Run-log size threshold that triggers pruning, in bytes.
    #[serde(default = "default_max_log_bytes")]
    pub max_log_bytes: u64,
    /// Lines retained when a run log is pruned.
    #[serde(default = "default_keep_log_lines")]
    pub keep_log_lines: usize,
    /// Channel names jobs may announce to. Unknown names degrade to "last".
    #[serde(default = "default_known_channels")]
    pub known_channels: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_poll_ceiling_ms() -> i64 {
    60_000
}

fn default_max_log_bytes() -> u64 {
    2 * 1024 * 1024
}

fn default_keep_log_lines() -> usize {
    2_000
}

fn default_known_channels() -> Vec<String> {
    vec!["last".to_string(), "telegram".to_string(), "discord".to_string()]
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            store_dir: None,
            poll_ceiling_ms: default_poll_ceiling_ms(),
            max_log_bytes: default_max_log_bytes(),
            keep_log_lines: default_keep_log_lines(),
            known_channels: default_known_channels(),
        }
    }
}

/// Top-level pulsebot configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PulsebotConfig {
    /// Scheduler config.
    #[serde(default)]
    pub cron: CronConfig,
}

/// Resolve the pulsebot config directory ($PULSEBOT_HOME or ~/.pulsebot/).
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    if let Ok(home) = std::env::var("PULSEBOT_HOME") {
        if !home.trim().is_empty() {
            return Ok(PathBuf::from(home));
        }
    }
    dirs::home_dir()
        .map(|h| h.join(".pulsebot"))
        .ok_or(ConfigError::NoDirFound)
}

/// Resolve the config file path (<config dir>/config.json5).
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.json5"))
}

/// Load configuration from the default path, falling back to defaults.
pub fn load_config() -> Result<PulsebotConfig, ConfigError> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let path = config_file_path()?;
    load_config_from(&path)
}

/// Load configuration from a specific path, falling back to defaults if not found.
pub fn load_config_from(path: &Path) -> Result<PulsebotConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!("Config file not found at {}, using defaults", path.display());
        return Ok(PulsebotConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: PulsebotConfig = json5::from_str(&content)?;
    Ok(config)
}

/// Ensure the config directory exists.
pub fn ensure_config_dir() -> Result<PathBuf, ConfigError> {
    let dir = config_dir()?;
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}

/// Resolve the cron store directory for a loaded config.
pub fn cron_store_dir(config: &PulsebotConfig) -> Result<PathBuf, ConfigError> {
    match &config.cron.store_dir {
        Some(dir) => Ok(PathBuf::from(dir)),
        None => Ok(config_dir()?.join("cron")),
    }
}

/// Save configuration to the default path.
pub fn save_config(config: &PulsebotConfig) -> Result<(), ConfigError> {
    let dir = ensure_config_dir()?;
    let path = dir.join("config.json5");
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| ConfigError::Io(std::io::Error::other(e)))?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PulsebotConfig::default();
        assert!(config.cron.enabled);
        assert_eq!(config.cron.poll_ceiling_ms, 60_000);
        assert_eq!(config.cron.keep_log_lines, 2_000);
        assert!(config.cron.known_channels.contains(&"last".to_string()));
    }

    #[test]
    fn test_json5_parse() {
        let json5_str = r#"{
            cron: {
                enabled: false,
                store_dir: "/tmp/pulsebot-cron",
                poll_ceiling_ms: 30000,
            },
        }"#;
        let config: PulsebotConfig = json5::from_str(json5_str).unwrap();
        assert!(!config.cron.enabled);
        assert_eq!(config.cron.store_dir.as_deref(), Some("/tmp/pulsebot-cron"));
        assert_eq!(config.cron.poll_ceiling_ms, 30_000);
        // Untouched fields keep their defaults
        assert_eq!(config.cron.max_log_bytes, 2 * 1024 * 1024);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("nope.json5")).unwrap();
        assert!(config.cron.enabled);
    }

    #[test]
    fn test_cron_store_dir_override() {
        let config: PulsebotConfig =
            json5::from_str(r#"{ cron: { store_dir: "/data/cron" } }"#).unwrap();
        let dir = cron_store_dir(&config).unwrap();
        assert_eq!(dir, PathBuf::from("/data/cron"));
    }
}
