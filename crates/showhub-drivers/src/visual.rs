//! Visual-programming endpoint driver: datagram pass-through (spec §4.11).
//!
//! Every message received under the driver's prefix is forwarded verbatim —
//! there is no address table to interpret, just a record of the last message
//! and a running count, since the visual-programming tool is expected to
//! parse addresses itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use showhub_driver::{Driver, DriverEvent, EventEmitter, LogRing};
use showhub_proto::Value;
use tokio::sync::broadcast;

#[derive(Default)]
struct VisualState {
    parameters: HashMap<String, Value>,
    last_message: Option<(String, Vec<Value>)>,
}

pub struct VisualDriver {
    name: String,
    prefix: String,
    events: EventEmitter,
    state: StdMutex<VisualState>,
    log: StdMutex<LogRing>,
    message_count: AtomicU64,
    connected: AtomicBool,
}

impl VisualDriver {
    pub fn new(name: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prefix: prefix.into(),
            events: EventEmitter::new(),
            state: StdMutex::new(VisualState::default()),
            log: StdMutex::new(LogRing::default()),
            message_count: AtomicU64::new(0),
            connected: AtomicBool::new(false),
        }
    }

    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::SeqCst)
    }

    pub fn last_message(&self) -> Option<(String, Vec<Value>)> {
        self.state.lock().unwrap().last_message.clone()
    }

    /// Last-seen scalar for `address`, if the driver has received a message
    /// there before.
    pub fn parameter(&self, address: &str) -> Option<Value> {
        self.state.lock().unwrap().parameters.get(address).cloned()
    }
}

#[async_trait]
impl Driver for VisualDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn connect(&self) -> anyhow::Result<()> {
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
        {
            let mut state = self.state.lock().unwrap();
            if let Some(scalar) = args.first() {
                state.parameters.insert(address.to_string(), scalar.clone());
            }
            state.last_message = Some((address.to_string(), args.to_vec()));
        }
        self.message_count.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push("forward", address.to_string());
        self.events.feedback(address.to_string(), args.to_vec());
    }

    fn events(&self) -> broadcast::Receiver<DriverEvent> {
        self.events.subscribe()
    }
}
