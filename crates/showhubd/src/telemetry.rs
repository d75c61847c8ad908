//! Structured logging init. Spec §7 asks only for structured logs, not a
//! distributed-tracing backend, so this is plain `tracing-subscriber` rather
//! than the OTLP pipeline — see `DESIGN.md` for the drop.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `log_level` is either a bare level
/// (`"info"`, `"debug"`, ...) or a full `EnvFilter` directive string
/// (`"showhubd=debug,info"`); `RUST_LOG` always takes precedence when set.
pub fn init(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
