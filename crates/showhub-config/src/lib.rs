//! Minimal configuration loading for the booth control hub.
//!
//! This crate provides configuration loading with minimal dependencies,
//! designed to be imported by every hub crate without causing circular
//! dependency issues.
//!
//! # Configuration Philosophy
//!
//! Configuration is split into two categories:
//!
//! - **Infrastructure** (`InfraConfig`): Things that physically cannot change
//!   at runtime - paths, bind addresses, telemetry settings.
//!
//! - **Bootstrap** (`BootstrapConfig`): Initial values that seed runtime
//!   driver state. After startup, the running hub becomes the source of
//!   truth (reconnects, scene recalls, and so on mutate in-memory state,
//!   not the config file).
//!
//! # Usage
//!
//! ```rust,no_run
//! use showhub_config::ShowHubConfig;
//!
//! let config = ShowHubConfig::load().expect("failed to load config");
//!
//! println!("message port: {}", config.infra.bind.message_port);
//! println!("mixer: {}:{}", config.bootstrap.mixer.host, config.bootstrap.mixer.port);
//! ```
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/showhub/config.toml` (system)
//! 2. `~/.config/showhub/config.toml` (user)
//! 3. `./showhub.toml` (local override)
//! 4. Environment variables (`SHOWHUB_*`)
//!
//! # Example Config
//!
//! ```toml
//! [paths]
//! state_dir = "~/.local/share/showhub"
//!
//! [bind]
//! message_port = 9000
//! http_port = 8088
//!
//! [telemetry]
//! log_level = "info"
//!
//! [bootstrap.mixer]
//! host = "192.168.1.50"
//! port = 51325
//! channel_layout = "bitfocus-five-channel"
//!
//! [bootstrap.streaming]
//! url = "ws://192.168.1.60:4455"
//! password = "changeme"
//! ```

pub mod bootstrap;
pub mod infra;
pub mod loader;

pub use bootstrap::{BootstrapConfig, ChannelLayout, MixerConfig, PtzConfig, ReconnectConfig, StreamingConfig};
pub use infra::{BindConfig, InfraConfig, PathsConfig, TelemetryConfig};
pub use loader::{discover_config_files_with_override, ConfigSources};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete hub configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ShowHubConfig {
    /// Infrastructure - cannot change at runtime.
    #[serde(flatten)]
    pub infra: InfraConfig,

    /// Bootstrap - seeds runtime driver state.
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
}

impl ShowHubConfig {
    /// Load configuration from all sources.
    ///
    /// Load order (later wins):
    /// 1. Compiled defaults
    /// 2. `/etc/showhub/config.toml`
    /// 3. `~/.config/showhub/config.toml`
    /// 4. `./showhub.toml`
    /// 5. Environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration from a specific file path, then apply env overrides.
    ///
    /// If `config_path` is provided, it takes precedence over the local
    /// `./showhub.toml` override. System and user configs still load first.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and return information about sources.
    pub fn load_with_sources() -> Result<(Self, ConfigSources), ConfigError> {
        Self::load_with_sources_from(None)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = ShowHubConfig::default();

        for path in loader::discover_config_files_with_override(config_path) {
            let file_config = loader::load_from_file(&path)?;
            config = loader::merge_configs(config, file_config);
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> String {
        let mut output = String::new();
        output.push_str("# ShowHub Configuration\n\n");

        output.push_str("[paths]\n");
        output.push_str(&format!("state_dir = \"{}\"\n", self.infra.paths.state_dir.display()));

        output.push_str("\n[bind]\n");
        output.push_str(&format!("message_port = {}\n", self.infra.bind.message_port));
        if let Some(http_port) = self.infra.bind.http_port {
            output.push_str(&format!("http_port = {}\n", http_port));
        }

        output.push_str("\n[telemetry]\n");
        output.push_str(&format!("log_level = \"{}\"\n", self.infra.telemetry.log_level));

        output.push_str("\n[bootstrap.mixer]\n");
        output.push_str(&format!("host = \"{}\"\n", self.bootstrap.mixer.host));
        output.push_str(&format!("port = {}\n", self.bootstrap.mixer.port));

        output.push_str("\n[bootstrap.ptz]\n");
        output.push_str(&format!("host = \"{}\"\n", self.bootstrap.ptz.host));
        output.push_str(&format!("port = {}\n", self.bootstrap.ptz.port));

        output.push_str("\n[bootstrap.streaming]\n");
        output.push_str(&format!("url = \"{}\"\n", self.bootstrap.streaming.url));

        output.push_str("\n[bootstrap.reconnect]\n");
        output.push_str(&format!("enabled = {}\n", self.bootstrap.reconnect.enabled));
        output.push_str(&format!("base_ms = {}\n", self.bootstrap.reconnect.base_ms));
        output.push_str(&format!("max_ms = {}\n", self.bootstrap.reconnect.max_ms));

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ShowHubConfig::default();
        assert_eq!(config.infra.bind.message_port, 9000);
        assert_eq!(config.bootstrap.mixer.port, 51325);
    }

    #[test]
    fn test_to_toml() {
        let config = ShowHubConfig::default();
        let toml = config.to_toml();
        assert!(toml.contains("[paths]"));
        assert!(toml.contains("[bind]"));
        assert!(toml.contains("[bootstrap.mixer]"));
    }

    #[test]
    fn test_load_defaults() {
        let config = ShowHubConfig::load().unwrap();
        assert_eq!(config.infra.bind.message_port, 9000);
    }
}
