//! Infrastructure configuration - things that cannot change at runtime.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Filesystem paths for persisted show and deck profiles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory where show states and deck profiles are persisted as
    /// sanitised-filename text files.
    /// Default: ~/.local/share/showhub
    #[serde(default = "PathsConfig::default_state_dir")]
    pub state_dir: PathBuf,
}

impl PathsConfig {
    fn default_state_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".local/share/showhub"))
            .unwrap_or_else(|| PathBuf::from(".local/share/showhub"))
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: Self::default_state_dir(),
        }
    }
}

/// Network bind addresses for this process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindConfig {
    /// UDP port the message socket binds to.
    /// Default: 9000
    #[serde(default = "BindConfig::default_message_port")]
    pub message_port: u16,

    /// Optional read-only HTTP side channel. `None` disables it.
    /// Default: 8088
    #[serde(default = "BindConfig::default_http_port")]
    pub http_port: Option<u16>,
}

impl BindConfig {
    fn default_message_port() -> u16 {
        9000
    }

    fn default_http_port() -> Option<u16> {
        Some(8088)
    }
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            message_port: Self::default_message_port(),
            http_port: Self::default_http_port(),
        }
    }
}

/// Telemetry and observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level (trace, debug, info, warn, error), or an `EnvFilter` spec.
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

/// Infrastructure configuration - cannot change at runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InfraConfig {
    /// Filesystem paths.
    #[serde(default)]
    pub paths: PathsConfig,

    /// Network bind addresses.
    #[serde(default)]
    pub bind: BindConfig,

    /// Telemetry settings.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}
