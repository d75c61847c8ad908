//! Driver bootstrap (spec §4.12): turns `BootstrapConfig` into registered,
//! connecting drivers. Owns none of their lifetime after registration — the
//! hub's driver table does — so this is a set of free functions rather than
//! a struct with state.

use std::sync::Arc;

use showhub_config::BootstrapConfig;
use showhub_driver::health::{ReconnectPolicy, Transport};
use showhub_drivers::{LightingDriver, MixerDriver, PtzDriver, StreamingDriver, VisualDriver};
use showhub_fade::FadeEngine;
use tracing::info;

use crate::hub::{Hub, HubError};

/// The fixed set of prefixes every bootstrap installation gets. Lighting and
/// visual drivers have no corresponding `BootstrapConfig` section (no host
/// to dial — lighting is datagram pass-through, visual forwards verbatim),
/// so they're registered unconditionally under fixed names.
const MIXER_NAME: &str = "mixer";
const PTZ_NAME: &str = "ptz";
const STREAMING_NAME: &str = "streaming";
const LIGHTING_NAME: &str = "lights";
const VISUAL_NAME: &str = "visual";

fn reconnect_policy(config: &showhub_config::ReconnectConfig) -> ReconnectPolicy {
    ReconnectPolicy {
        enabled: config.enabled,
        base_ms: config.base_ms,
        max_ms: config.max_ms,
        max_attempts: config.max_attempts,
    }
}

/// Register every bootstrap driver against `hub`, in the teacher's
/// build-everything-then-connect order. A duplicate-prefix failure here is
/// a programming error (the five prefixes are fixed and distinct), so it's
/// surfaced via `anyhow` rather than retried.
pub async fn bootstrap(hub: &Arc<Hub>, fade: Arc<FadeEngine>, config: &BootstrapConfig) -> anyhow::Result<()> {
    let policy = reconnect_policy(&config.reconnect);

    let mixer = MixerDriver::new(
        MIXER_NAME,
        "/mixer",
        config.mixer.host.clone(),
        config.mixer.port,
        config.mixer.channel_layout,
        fade,
    );
    register(hub, MIXER_NAME, "/mixer", mixer, Transport::StreamTcp, policy).await?;

    let ptz = Arc::new(PtzDriver::new(PTZ_NAME, "/ptz", config.ptz.host.clone(), config.ptz.port));
    register(hub, PTZ_NAME, "/ptz", ptz, Transport::StreamTcp, policy).await?;

    let streaming = StreamingDriver::new(STREAMING_NAME, "/stream", config.streaming.url.clone(), config.streaming.password.clone());
    register(hub, STREAMING_NAME, "/stream", streaming, Transport::StreamWebSocket, policy).await?;

    let lighting = Arc::new(LightingDriver::new(LIGHTING_NAME, "/lights"));
    register(hub, LIGHTING_NAME, "/lights", lighting, Transport::Datagram, policy).await?;

    let visual = Arc::new(VisualDriver::new(VISUAL_NAME, "/visual"));
    register(hub, VISUAL_NAME, "/visual", visual, Transport::Datagram, policy).await?;

    Ok(())
}

async fn register(
    hub: &Arc<Hub>,
    name: &str,
    prefix: &str,
    driver: Arc<dyn showhub_driver::Driver>,
    transport: Transport,
    policy: ReconnectPolicy,
) -> Result<(), HubError> {
    info!(name, prefix, "registering driver");
    hub.register_driver(name, prefix, driver, transport, policy).await
}
