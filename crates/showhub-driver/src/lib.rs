//! The device driver contract (spec §4.3) and its composable event/log
//! utilities. Concrete protocol translators live in `showhub-drivers`; the
//! connection-health state machine lives in [`health`].

pub mod health;
mod log_ring;

pub use log_ring::{LogEntry, LogRing};

use async_trait::async_trait;
use showhub_proto::Value;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events a driver emits. Feedback addresses are relative — the hub
/// prepends the driver's prefix before relaying to clients.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    Connected,
    Disconnected,
    Error(String),
    Feedback { address: String, args: Vec<Value> },
}

/// Every driver owns one of these instead of inheriting emitter state from a
/// base class; it composes in wherever a driver needs to publish events.
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<DriverEvent>,
}

impl EventEmitter {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        self.tx.subscribe()
    }

    pub fn connected(&self) {
        let _ = self.tx.send(DriverEvent::Connected);
    }

    pub fn disconnected(&self) {
        let _ = self.tx.send(DriverEvent::Disconnected);
    }

    pub fn error(&self, message: impl Into<String>) {
        let _ = self.tx.send(DriverEvent::Error(message.into()));
    }

    /// `address` is relative to the driver's prefix.
    pub fn feedback(&self, address: impl Into<String>, args: Vec<Value>) {
        let _ = self.tx.send(DriverEvent::Feedback {
            address: address.into(),
            args,
        });
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

/// The uniform contract every device driver satisfies.
///
/// `address` passed to `handle_message` has the driver's prefix already
/// stripped by the hub and is lowercased, for drivers that route on it
/// directly. `original` is the same remainder with its original case intact,
/// for drivers that forward human-visible identifiers (scene names, source
/// names) on to their own protocol verbatim rather than using them as
/// routing keys; spec §4.4's scene/name case preservation. Most drivers
/// ignore it.
#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;
    fn prefix(&self) -> &str;

    async fn connect(&self) -> anyhow::Result<()>;
    async fn disconnect(&self) -> anyhow::Result<()>;
    fn is_connected(&self) -> bool;

    async fn handle_message(&self, address: &str, original: &str, args: &[Value]);

    /// Stateless drivers (e.g. the visual-programming pass-through) can
    /// leave this a no-op; only fading drivers override it.
    async fn handle_fade_tick(&self, _key: &str, _value: f64) {}

    fn events(&self) -> broadcast::Receiver<DriverEvent>;
}
