//! Bootstrap configuration - seeds runtime driver state, then the runtime
//! (hub + health managers) owns it.

use serde::{Deserialize, Serialize};

/// Which audio-mixer channel-to-MIDI mapping is in effect. The source this
/// system was distilled from carried two incompatible layouts; this picks
/// the Bitfocus-verified one as the default (see `DESIGN.md`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelLayout {
    BitfocusFiveChannel,
    Legacy12Channel,
}

impl Default for ChannelLayout {
    fn default() -> Self {
        ChannelLayout::BitfocusFiveChannel
    }
}

/// Audio-mixer driver: MIDI over TCP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixerConfig {
    #[serde(default = "MixerConfig::default_host")]
    pub host: String,
    #[serde(default = "MixerConfig::default_port")]
    pub port: u16,
    #[serde(default)]
    pub channel_layout: ChannelLayout,
}

impl MixerConfig {
    fn default_host() -> String {
        "127.0.0.1".to_string()
    }

    fn default_port() -> u16 {
        51325
    }
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
            channel_layout: ChannelLayout::default(),
        }
    }
}

/// PTZ camera driver: VISCA over TCP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PtzConfig {
    #[serde(default = "PtzConfig::default_host")]
    pub host: String,
    #[serde(default = "PtzConfig::default_port")]
    pub port: u16,
}

impl PtzConfig {
    fn default_host() -> String {
        "127.0.0.1".to_string()
    }

    fn default_port() -> u16 {
        5678
    }
}

impl Default for PtzConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
        }
    }
}

/// Streaming/recording engine driver: WebSocket JSON-RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    #[serde(default = "StreamingConfig::default_url")]
    pub url: String,
    #[serde(default)]
    pub password: String,
}

impl StreamingConfig {
    fn default_url() -> String {
        "ws://127.0.0.1:4455".to_string()
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            url: Self::default_url(),
            password: String::new(),
        }
    }
}

/// Default exponential-backoff reconnect policy applied to every driver's
/// health manager unless a driver overrides it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "ReconnectConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default = "ReconnectConfig::default_base_ms")]
    pub base_ms: u64,
    #[serde(default = "ReconnectConfig::default_max_ms")]
    pub max_ms: u64,
    /// 0 means unlimited.
    #[serde(default)]
    pub max_attempts: u32,
}

impl ReconnectConfig {
    fn default_enabled() -> bool {
        true
    }
    fn default_base_ms() -> u64 {
        500
    }
    fn default_max_ms() -> u64 {
        30_000
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            base_ms: Self::default_base_ms(),
            max_ms: Self::default_max_ms(),
            max_attempts: 0,
        }
    }
}

/// Bootstrap configuration - seeds runtime, then runtime owns it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub mixer: MixerConfig,
    #[serde(default)]
    pub ptz: PtzConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}
