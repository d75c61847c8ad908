//! showhubd - production control hub for live-event booths
//!
//! Binds the message socket, starts the 50 Hz fade engine, registers the
//! bootstrap drivers, and runs the inbound dispatch loop until asked to
//! shut down.
//!
//! Configuration is loaded from (in order, later wins):
//! 1. Compiled defaults
//! 2. /etc/showhub/config.toml
//! 3. ~/.config/showhub/config.toml
//! 4. ./showhub.toml (or --config path)
//! 5. Environment variables (SHOWHUB_*, RUST_LOG)

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use showhub_config::ShowHubConfig;
use showhub_fade::FadeEngine;
use showhub_proto::MessageSocket;
use showhubd::{hub::Hub, manager, persistence, telemetry};
use tracing::{error, info, warn};

/// Production control hub for live-event booths
#[derive(Parser)]
#[command(name = "showhubd")]
#[command(about = "Production control hub for live-event booths")]
#[command(version)]
struct Cli {
    /// Path to config file (overrides ./showhub.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print the resolved configuration and exit without binding anything
    #[arg(long)]
    show_config: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let (config, sources) = match ShowHubConfig::load_with_sources_from(cli.config.as_deref()) {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            return ExitCode::from(2);
        }
    };

    if cli.show_config {
        println!("# Configuration sources:");
        for path in &sources.files {
            println!("#   - {}", path.display());
        }
        if !sources.env_overrides.is_empty() {
            println!("# Environment overrides:");
            for var in &sources.env_overrides {
                println!("#   - {var}");
            }
        }
        println!();
        println!("{}", config.to_toml());
        return ExitCode::SUCCESS;
    }

    telemetry::init(&config.infra.telemetry.log_level);

    info!("configuration loaded from:");
    for path in &sources.files {
        info!("  - {}", path.display());
    }
    if !sources.env_overrides.is_empty() {
        info!(overrides = ?sources.env_overrides, "environment overrides applied");
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal error");
            ExitCode::from(1)
        }
    }
}

async fn run(config: ShowHubConfig) -> anyhow::Result<()> {
    let bind_addr = format!("0.0.0.0:{}", config.infra.bind.message_port).parse()?;
    let socket = MessageSocket::bind(bind_addr).await?;
    info!(addr = %bind_addr, "message socket bound");

    let fade = Arc::new(FadeEngine::new());
    let hub = Hub::new(Arc::clone(&socket), Arc::clone(&fade));
    hub.start_fade_loop();

    let macros = persistence::load_macros(&config.infra.paths.state_dir);
    if !macros.is_empty() {
        info!(count = macros.len(), "loaded persisted macro table");
    }
    hub.reload_macros(macros);

    manager::bootstrap(&hub, fade, &config.bootstrap).await?;

    let http_handle = config.infra.bind.http_port.map(|port| {
        let hub = Arc::clone(&hub);
        tokio::spawn(async move {
            if let Err(e) = showhubd::http::run(hub, port).await {
                warn!(error = %e, "http side channel exited");
            }
        })
    });

    let hub_for_loop = Arc::clone(&hub);
    let dispatch_loop = tokio::spawn(async move {
        loop {
            match socket.recv().await {
                Ok((Ok(message), _origin)) => hub_for_loop.handle_inbound(message).await,
                Ok((Err(e), origin)) => warn!(%origin, error = %e, "dropped undecodable datagram"),
                Err(e) => warn!(error = %e, "socket receive error"),
            }
        }
    });

    shutdown_signal().await;
    info!("shutdown signal received, draining");

    dispatch_loop.abort();
    if let Some(handle) = http_handle {
        handle.abort();
    }
    hub.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT");
        }
        _ = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
                sigterm.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("received SIGTERM");
        }
    }
}
