//! TOML-backed runtime configuration.
//!
//! Every section and field has a serde default so a partial (or missing)
//! config file still yields a usable runtime. `validate()` reports
//! severity-tagged issues instead of failing fast; the caller decides
//! whether errors abort startup.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Config {
    /// Parse a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load from a file path, falling back to defaults when the file
    /// does not exist.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Sanity-check the configuration. Warnings are survivable; errors
    /// should abort startup.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.queue.message_ttl_ms == 0 {
            issues.push(ConfigIssue::error(
                "queue.message_ttl_ms must be > 0 (entries would be deleted immediately)",
            ));
        }
        if self.queue.consumer_ttl_ms == 0 {
            issues.push(ConfigIssue::error(
                "queue.consumer_ttl_ms must be > 0 (consumers would be purged immediately)",
            ));
        }
        if self.queue.max_entries_per_topic == 0 {
            issues.push(ConfigIssue::error(
                "queue.max_entries_per_topic must be > 0",
            ));
        }
        if self.queue.message_ttl_ms < self.queue.consumer_ttl_ms {
            issues.push(ConfigIssue::warning(
                "queue.message_ttl_ms is shorter than consumer_ttl_ms; slow consumers may lose entries",
            ));
        }
        if self.server.heartbeat_interval_ms > 0 && self.server.heartbeat_interval_ms < 1_000 {
            issues.push(ConfigIssue::warning(
                "server.heartbeat_interval_ms under 1s will ping aggressively",
            ));
        }
        if self.engine.max_depth == 0 {
            issues.push(ConfigIssue::error(
                "engine.max_depth must be > 0 (no outputs would ever be re-injected)",
            ));
        }

        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
    /// Path the WebSocket endpoint is mounted on.
    #[serde(default = "d_ws_path")]
    pub ws_path: String,
    /// Heartbeat ping interval in ms; 0 disables heartbeats.
    #[serde(default = "d_heartbeat")]
    pub heartbeat_interval_ms: u64,
    /// Default timeout for a reliable envelope awaiting its ACK.
    #[serde(default = "d_reliable_timeout")]
    pub reliable_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
            ws_path: d_ws_path(),
            heartbeat_interval_ms: d_heartbeat(),
            reliable_timeout_ms: d_reliable_timeout(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Queue retention
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Consumers idle longer than this are purged.
    #[serde(default = "d_consumer_ttl")]
    pub consumer_ttl_ms: i64,
    /// Entries older than this may be deleted past the MIN cursor.
    #[serde(default = "d_message_ttl")]
    pub message_ttl_ms: i64,
    #[serde(default = "d_max_entries")]
    pub max_entries_per_topic: usize,
    /// 0 disables the periodic cleanup task.
    #[serde(default = "d_cleanup_interval")]
    pub cleanup_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            consumer_ttl_ms: d_consumer_ttl(),
            message_ttl_ms: d_message_ttl(),
            max_entries_per_topic: d_max_entries(),
            cleanup_interval_ms: d_cleanup_interval(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Recursion bound for output re-injection.
    #[serde(default = "d_max_depth")]
    pub max_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_depth: d_max_depth(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Storage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the queue and session databases.
    #[serde(default = "d_state_path")]
    pub state_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_path: d_state_path(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation issues
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl ConfigIssue {
    fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Defaults
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_port() -> u16 {
    3210
}
fn d_ws_path() -> String {
    "/v1/events/ws".into()
}
fn d_heartbeat() -> u64 {
    30_000
}
fn d_reliable_timeout() -> u64 {
    10_000
}
fn d_consumer_ttl() -> i64 {
    24 * 60 * 60 * 1_000
}
fn d_message_ttl() -> i64 {
    48 * 60 * 60 * 1_000
}
fn d_max_entries() -> usize {
    10_000
}
fn d_cleanup_interval() -> u64 {
    5 * 60 * 1_000
}
fn d_max_depth() -> usize {
    100
}
fn d_state_path() -> PathBuf {
    PathBuf::from("./state")
}
