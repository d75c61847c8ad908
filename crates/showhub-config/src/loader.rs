//! Config file discovery, loading, and environment variable overlay.

use crate::{BootstrapConfig, ConfigError, InfraConfig, ShowHubConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local).
/// Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
/// Returns paths in load order (system, user, local/cli).
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/showhub/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("showhub/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("showhub.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load config from a TOML file.
pub fn load_from_file(path: &Path) -> Result<ShowHubConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_toml(&contents, path)
}

fn parse_toml(contents: &str, path: &Path) -> Result<ShowHubConfig, ConfigError> {
    let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let mut infra = InfraConfig::default();
    if let Some(paths) = table.get("paths").and_then(|v| v.as_table()) {
        if let Some(v) = paths.get("state_dir").and_then(|v| v.as_str()) {
            infra.paths.state_dir = expand_path(v);
        }
    }
    if let Some(bind) = table.get("bind").and_then(|v| v.as_table()) {
        if let Some(v) = bind.get("message_port").and_then(|v| v.as_integer()) {
            infra.bind.message_port = v as u16;
        }
        if let Some(v) = bind.get("http_port") {
            infra.bind.http_port = v.as_integer().map(|n| n as u16);
        }
    }
    if let Some(telemetry) = table.get("telemetry").and_then(|v| v.as_table()) {
        if let Some(v) = telemetry.get("log_level").and_then(|v| v.as_str()) {
            infra.telemetry.log_level = v.to_string();
        }
    }

    let mut bootstrap = BootstrapConfig::default();
    if let Some(section) = table.get("bootstrap") {
        if let Some(mixer) = section.get("mixer").and_then(|v| v.as_table()) {
            if let Some(v) = mixer.get("host").and_then(|v| v.as_str()) {
                bootstrap.mixer.host = v.to_string();
            }
            if let Some(v) = mixer.get("port").and_then(|v| v.as_integer()) {
                bootstrap.mixer.port = v as u16;
            }
            if let Some(v) = mixer.get("channel_layout").and_then(|v| v.as_str()) {
                bootstrap.mixer.channel_layout = match v {
                    "legacy-12-channel" => crate::ChannelLayout::Legacy12Channel,
                    _ => crate::ChannelLayout::BitfocusFiveChannel,
                };
            }
        }
        if let Some(ptz) = section.get("ptz").and_then(|v| v.as_table()) {
            if let Some(v) = ptz.get("host").and_then(|v| v.as_str()) {
                bootstrap.ptz.host = v.to_string();
            }
            if let Some(v) = ptz.get("port").and_then(|v| v.as_integer()) {
                bootstrap.ptz.port = v as u16;
            }
        }
        if let Some(streaming) = section.get("streaming").and_then(|v| v.as_table()) {
            if let Some(v) = streaming.get("url").and_then(|v| v.as_str()) {
                bootstrap.streaming.url = v.to_string();
            }
            if let Some(v) = streaming.get("password").and_then(|v| v.as_str()) {
                bootstrap.streaming.password = v.to_string();
            }
        }
        if let Some(reconnect) = section.get("reconnect").and_then(|v| v.as_table()) {
            if let Some(v) = reconnect.get("enabled").and_then(|v| v.as_bool()) {
                bootstrap.reconnect.enabled = v;
            }
            if let Some(v) = reconnect.get("base_ms").and_then(|v| v.as_integer()) {
                bootstrap.reconnect.base_ms = v as u64;
            }
            if let Some(v) = reconnect.get("max_ms").and_then(|v| v.as_integer()) {
                bootstrap.reconnect.max_ms = v as u64;
            }
            if let Some(v) = reconnect.get("max_attempts").and_then(|v| v.as_integer()) {
                bootstrap.reconnect.max_attempts = v as u32;
            }
        }
    }

    Ok(ShowHubConfig { infra, bootstrap })
}

/// Merge two configs, with `overlay` taking precedence. Infra fields merge
/// one at a time (comparing against compiled defaults to decide whether the
/// overlay actually set them); bootstrap replaces wholesale, since a config
/// file that touches any one driver section almost always means to own the
/// whole bootstrap block.
pub fn merge_configs(base: ShowHubConfig, overlay: ShowHubConfig) -> ShowHubConfig {
    let default_infra = InfraConfig::default();

    let state_dir = if overlay.infra.paths.state_dir != default_infra.paths.state_dir {
        overlay.infra.paths.state_dir
    } else {
        base.infra.paths.state_dir
    };
    let message_port = if overlay.infra.bind.message_port != default_infra.bind.message_port {
        overlay.infra.bind.message_port
    } else {
        base.infra.bind.message_port
    };
    let http_port = if overlay.infra.bind.http_port != default_infra.bind.http_port {
        overlay.infra.bind.http_port
    } else {
        base.infra.bind.http_port
    };
    let log_level = if overlay.infra.telemetry.log_level != default_infra.telemetry.log_level {
        overlay.infra.telemetry.log_level
    } else {
        base.infra.telemetry.log_level
    };

    ShowHubConfig {
        infra: InfraConfig {
            paths: crate::PathsConfig { state_dir },
            bind: crate::BindConfig { message_port, http_port },
            telemetry: crate::TelemetryConfig { log_level },
        },
        bootstrap: overlay.bootstrap,
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut ShowHubConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("SHOWHUB_STATE_DIR") {
        config.infra.paths.state_dir = expand_path(&v);
        sources.env_overrides.push("SHOWHUB_STATE_DIR".to_string());
    }
    if let Ok(v) = env::var("SHOWHUB_MESSAGE_PORT") {
        if let Ok(port) = v.parse() {
            config.infra.bind.message_port = port;
            sources.env_overrides.push("SHOWHUB_MESSAGE_PORT".to_string());
        }
    }
    if let Ok(v) = env::var("SHOWHUB_HTTP_PORT") {
        config.infra.bind.http_port = v.parse().ok();
        sources.env_overrides.push("SHOWHUB_HTTP_PORT".to_string());
    }
    if let Ok(v) = env::var("SHOWHUB_LOG_LEVEL") {
        config.infra.telemetry.log_level = v;
        sources.env_overrides.push("SHOWHUB_LOG_LEVEL".to_string());
    }
    if let Ok(v) = env::var("RUST_LOG") {
        config.infra.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }

    if let Ok(v) = env::var("SHOWHUB_MIXER_HOST") {
        config.bootstrap.mixer.host = v;
        sources.env_overrides.push("SHOWHUB_MIXER_HOST".to_string());
    }
    if let Ok(v) = env::var("SHOWHUB_MIXER_PORT") {
        if let Ok(port) = v.parse() {
            config.bootstrap.mixer.port = port;
            sources.env_overrides.push("SHOWHUB_MIXER_PORT".to_string());
        }
    }
    if let Ok(v) = env::var("SHOWHUB_STREAMING_URL") {
        config.bootstrap.streaming.url = v;
        sources.env_overrides.push("SHOWHUB_STREAMING_URL".to_string());
    }
    if let Ok(v) = env::var("SHOWHUB_STREAMING_PASSWORD") {
        config.bootstrap.streaming.password = v;
        sources.env_overrides.push("SHOWHUB_STREAMING_PASSWORD".to_string());
    }
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            return home.join(stripped);
        }
        return PathBuf::from(path);
    }
    if let Some(stripped) = path.strip_prefix('$') {
        if let Some(slash_pos) = stripped.find('/') {
            let var_name = &stripped[..slash_pos];
            return match env::var(var_name) {
                Ok(var_value) => PathBuf::from(var_value).join(&stripped[slash_pos + 1..]),
                Err(_) => PathBuf::from(path),
            };
        }
        return env::var(stripped).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(path));
    }
    PathBuf::from(path)
}

/// Sanitise a show or deck profile name into a safe filename: non-alphanumeric
/// characters become `_`, and the result is lowercased.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}
