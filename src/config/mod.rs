//! Configuration management for tabvox
//!
//! Every field has a default, so an empty or partial `config.toml` is valid.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub agent: AgentConfig,
    pub sessions: SessionsConfig,
    pub storage: StorageConfig,
    pub tts: TtsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8766,
        }
    }
}

/// External CLI agent invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Executable to spawn once per user turn
    pub command: String,
    /// Arguments placed before the prompt (the prompt is always the last argument)
    pub args: Vec<String>,
    /// Working directory for the child process (default: server cwd)
    pub working_dir: Option<PathBuf>,
    /// Total attempts per turn, including the first one
    pub max_attempts: u32,
    /// Pause before each retry
    pub retry_delay_ms: u64,
    /// Hard timeout per attempt in seconds; 0 disables it
    pub timeout_secs: u64,
    /// Substring (case-insensitive) the agent prints when it fails logically
    pub error_marker: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: vec!["--dangerously-skip-permissions".to_string(), "-p".to_string()],
            working_dir: None,
            max_attempts: 3,
            retry_delay_ms: 1000,
            timeout_secs: 300,
            error_marker: "execution error".to_string(),
        }
    }
}

impl AgentConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// Maximum concurrent tab sessions
    pub max_sessions: usize,
    /// Trailing turns fed into each context prompt
    pub max_context_turns: usize,
    /// Cadence of `realtime_stats` events per tab
    pub stats_interval_ms: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_sessions: 4,
            max_context_turns: 10,
            stats_interval_ms: 500,
        }
    }
}

impl SessionsConfig {
    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Snapshot blob location
    pub path: PathBuf,
    /// Persist after every assistant reply
    pub save_mode: bool,
    /// Restore the saved snapshot into live sessions when the server starts
    pub restore_on_start: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_data_dir().join("sessions.json"),
            save_mode: false,
            restore_on_start: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Endpoint of the text-to-speech service
    pub url: String,
    pub default_voice: String,
    pub timeout_secs: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:5002/tts".to_string(),
            default_voice: "default".to_string(),
            timeout_secs: 30,
        }
    }
}

impl Config {
    /// Load configuration from default location or create default
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        Self::load_from(&config_path)
    }

    /// Load configuration from an explicit path; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "tabvox") {
            let config_dir = proj_dirs.config_dir();
            std::fs::create_dir_all(config_dir)?;
            Ok(config_dir.join("config.toml"))
        } else {
            Ok(PathBuf::from("config.toml"))
        }
    }

    /// Write configuration to `path` as TOML
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "tabvox")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".tabvox"))
}
