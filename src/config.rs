//! Configuration
//!
//! Configuration structures for the broker server.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_host: String,
    pub bind_port: u16,
    pub certfile: PathBuf,
    pub keyfile: PathBuf,
    /// Fixed room set, known at startup. The first entry is the room new
    /// registrants are allowed into.
    #[serde(default = "default_rooms")]
    pub rooms: Vec<String>,
    /// Number of messages replayed to a joining connection.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// Deadline for user/message store calls, in milliseconds.
    #[serde(default = "default_adapter_timeout_ms")]
    pub adapter_timeout_ms: u64,
    /// Largest accepted frame. Attachments travel base64-inline, so this
    /// bounds attachment size too.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Credential seeded for the reserved root admin account.
    #[serde(default = "default_admin_password")]
    pub admin_password: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_rooms() -> Vec<String> {
    vec!["Geral".to_string(), "Dúvidas".to_string(), "Projetos".to_string()]
}

fn default_history_window() -> usize {
    50
}

fn default_adapter_timeout_ms() -> u64 {
    5000
}

fn default_max_frame_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_admin_password() -> String {
    "admin".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            bind_port: 8443,
            certfile: PathBuf::from("server.crt"),
            keyfile: PathBuf::from("server.key"),
            rooms: default_rooms(),
            history_window: 50,
            adapter_timeout_ms: 5000,
            max_frame_bytes: 8 * 1024 * 1024,
            admin_password: "admin".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Adapter deadline as a [`Duration`].
    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_millis(self.adapter_timeout_ms)
    }

    /// The room granted to new registrants.
    pub fn default_room(&self) -> &str {
        self.rooms.first().map(String::as_str).unwrap_or("Geral")
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
}
