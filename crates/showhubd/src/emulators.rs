//! In-memory driver test double (spec §4.15 "Test emulators"). Lets
//! integration tests exercise the hub's routing, health, and feedback-relay
//! behavior without dialing real mixer/camera/streaming hardware.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use showhub_driver::{Driver, DriverEvent, EventEmitter};
use showhub_proto::Value;
use tokio::sync::broadcast;

/// A driver double that records every message it receives and lets a test
/// push feedback or flip connectivity on demand.
pub struct InMemoryDriver {
    name: String,
    prefix: String,
    events: EventEmitter,
    connected: AtomicBool,
    fail_connect: AtomicBool,
    received: std::sync::Mutex<Vec<(String, Vec<Value>)>>,
}

impl InMemoryDriver {
    pub fn new(name: impl Into<String>, prefix: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            prefix: prefix.into(),
            events: EventEmitter::new(),
            connected: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            received: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Every subsequent `connect()` call fails until this is called again
    /// with `false` — exercises the health manager's backoff path.
    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Emit a feedback event as though the remote device sent it.
    pub fn emit_feedback(&self, address: impl Into<String>, args: Vec<Value>) {
        self.events.feedback(address.into(), args);
    }

    pub fn received(&self) -> Vec<(String, Vec<Value>)> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl Driver for InMemoryDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn connect(&self) -> anyhow::Result<()> {
        if self.fail_connect.load(Ordering::SeqCst) {
            anyhow::bail!("{} refused connection", self.name);
        }
        self.connected.store(true, Ordering::SeqCst);
        self.events.connected();
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.events.disconnected();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn handle_message(&self, address: &str, _original: &str, args: &[Value]) {
        self.received.lock().unwrap().push((address.to_string(), args.to_vec()));
    }

    fn events(&self) -> broadcast::Receiver<DriverEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_failure_is_reported_without_flipping_connected() {
        let driver = InMemoryDriver::new("em", "/em");
        driver.set_fail_connect(true);
        assert!(driver.connect().await.is_err());
        assert!(!driver.is_connected());
    }

    #[tokio::test]
    async fn handled_messages_are_recorded_in_order() {
        let driver = InMemoryDriver::new("em", "/em");
        driver.handle_message("ping", "ping", &[Value::Int(1)]).await;
        driver.handle_message("pong", "pong", &[Value::Int(2)]).await;
        let received = driver.received();
        assert_eq!(received[0].0, "ping");
        assert_eq!(received[1].0, "pong");
    }
}
