//! The hub itself (spec §4.4): owns the message socket, the fade engine, the
//! driver table, and the macro/cue engines, and routes every inbound message
//! to exactly one of them.
//!
//! Routing order is: built-ins (`/fade/stop`, `/system/check`, `/hub/*`) →
//! registered macro triggers → longest matching driver prefix. The driver
//! table lock is never held across an `.await` — entries are cloned out from
//! under a short-lived read lock before any driver method is called.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::Serialize;
use showhub_cue::CueEngine;
use showhub_driver::health::{ConnectionState, HealthManager, ReconnectPolicy, Transport};
use showhub_driver::{Driver, DriverEvent};
use showhub_fade::{FadeEngine, FadeEvent};
use showhub_macro::MacroEngine;
use showhub_proto::{Message, MessageSocket, Value};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::persistence::sanitise_filename;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("a driver is already registered under prefix {0}")]
    DuplicatePrefix(String),
}

struct RegisteredDriver {
    name: String,
    prefix: String,
    driver: Arc<dyn Driver>,
    health: Arc<HealthManager>,
    ever_connected: Arc<AtomicBool>,
    feedback_task: JoinHandle<()>,
    status_task: JoinHandle<()>,
}

#[derive(Serialize)]
struct DriverCheckResult {
    name: String,
    state: String,
    attempts: u32,
}

#[derive(Serialize)]
struct SystemCheckResult {
    drivers: Vec<DriverCheckResult>,
}

/// Per-driver connection snapshot for the HTTP side channel.
pub struct DriverStatusSnapshot {
    pub name: String,
    pub prefix: String,
    pub connected: bool,
    pub state: ConnectionState,
    pub attempts: u32,
    pub last_seen_ms: Option<u64>,
}

pub struct Hub {
    socket: Arc<MessageSocket>,
    fade: Arc<FadeEngine>,
    fade_ticker: std::sync::Mutex<Option<JoinHandle<()>>>,
    fade_relay: std::sync::Mutex<Option<JoinHandle<()>>>,
    drivers: RwLock<Vec<RegisteredDriver>>,
    macro_engine: Arc<MacroEngine>,
    cue_engine: Arc<CueEngine>,
    ready_fired: AtomicBool,
    message_count: AtomicU64,
}

/// Routes macro/cue engine leaf dispatches back into the hub, skipping the
/// macro-table lookup `Hub::handle_inbound` performs (each engine already
/// decided the target isn't itself a macro).
struct EngineDispatcher {
    hub: Weak<Hub>,
}

#[async_trait]
impl showhub_macro::Dispatcher for EngineDispatcher {
    async fn dispatch(&self, address: &str, args: Vec<Value>) {
        if let Some(hub) = self.hub.upgrade() {
            hub.dispatch_resolved(address, args).await;
        }
    }
}

#[async_trait]
impl showhub_cue::Dispatcher for EngineDispatcher {
    async fn dispatch(&self, address: &str, args: Vec<Value>) {
        if let Some(hub) = self.hub.upgrade() {
            hub.dispatch_resolved(address, args).await;
        }
    }
}

/// The panic macro's actions: cancel every in-flight fade immediately, then
/// dispatch the `/hub/stop` sentinel. Re-inserted by [`Hub::reload_macros`]
/// every time so an operator's macro table can never shadow it.
fn panic_macro() -> showhub_macro::MacroDef {
    showhub_macro::MacroDef {
        trigger: "/hub/panic".into(),
        actions: vec![
            showhub_macro::MacroAction { address: "/fade/stop".into(), args: vec![], delay_ms: 0 },
            showhub_macro::MacroAction { address: "/hub/stop".into(), args: vec![], delay_ms: 0 },
        ],
    }
}

impl Hub {
    pub fn new(socket: Arc<MessageSocket>, fade: Arc<FadeEngine>) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let dispatcher: Arc<dyn showhub_macro::Dispatcher> = Arc::new(EngineDispatcher { hub: weak.clone() });
            let cue_dispatcher: Arc<dyn showhub_cue::Dispatcher> = Arc::new(EngineDispatcher { hub: weak.clone() });
            let macro_engine = MacroEngine::new(dispatcher);
            macro_engine.load(vec![panic_macro()]);
            let cue_engine = CueEngine::new(cue_dispatcher);

            Self {
                socket,
                fade,
                fade_ticker: std::sync::Mutex::new(None),
                fade_relay: std::sync::Mutex::new(None),
                drivers: RwLock::new(Vec::new()),
                macro_engine,
                cue_engine,
                ready_fired: AtomicBool::new(false),
                message_count: AtomicU64::new(0),
            }
        })
    }

    pub fn fade(&self) -> &Arc<FadeEngine> {
        &self.fade
    }

    pub fn macro_engine(&self) -> &Arc<MacroEngine> {
        &self.macro_engine
    }

    pub fn cue_engine(&self) -> &Arc<CueEngine> {
        &self.cue_engine
    }

    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }

    /// Replace the macro table with `defs` plus the non-removable panic
    /// macro, which always wins if `defs` happens to define `/hub/panic`
    /// itself (load-order: panic macro first, so a user `/hub/panic` in
    /// `defs` overwrites it — re-inserting the panic macro a second time
    /// below puts it back).
    pub fn reload_macros(&self, defs: Vec<showhub_macro::MacroDef>) {
        let mut all = vec![panic_macro()];
        all.extend(defs);
        all.push(panic_macro());
        self.macro_engine.load(all);
    }

    /// Start the 50 Hz fade ticker and the tick → driver relay. Call once
    /// after construction.
    pub fn start_fade_loop(self: &Arc<Self>) {
        *self.fade_ticker.lock().unwrap() = Some(self.fade.spawn_ticker());

        let hub = Arc::clone(self);
        let mut rx = self.fade.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(FadeEvent::Value { key, value }) => hub.relay_fade_tick(&key, value).await,
                    Ok(FadeEvent::Complete { .. }) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.fade_relay.lock().unwrap() = Some(handle);
    }

    async fn relay_fade_tick(&self, key: &str, value: f64) {
        let Some((driver_name, _)) = key.split_once(':') else { return };
        let driver = {
            let drivers = self.drivers.read().await;
            drivers.iter().find(|d| d.name == driver_name).map(|d| Arc::clone(&d.driver))
        };
        if let Some(driver) = driver {
            driver.handle_fade_tick(key, value).await;
        }
    }

    /// Register a driver under `prefix`. Fails without mutating the table if
    /// `prefix` collides (case-insensitively) with an existing registration.
    pub async fn register_driver(
        self: &Arc<Self>,
        name: impl Into<String>,
        prefix: impl Into<String>,
        driver: Arc<dyn Driver>,
        transport: Transport,
        policy: ReconnectPolicy,
    ) -> Result<(), HubError> {
        let name = name.into();
        let prefix = prefix.into();
        let prefix_lower = prefix.to_ascii_lowercase();

        {
            let drivers = self.drivers.read().await;
            if drivers.iter().any(|d| d.prefix == prefix_lower) {
                return Err(HubError::DuplicatePrefix(prefix));
            }
        }

        let health = HealthManager::new(Arc::clone(&driver), transport, policy);
        let ever_connected = Arc::new(AtomicBool::new(false));

        let feedback_task = self.spawn_feedback_relay(prefix.clone(), driver.events());
        let status_task = self.spawn_status_relay(name.clone(), health.subscribe_state(), Arc::clone(&ever_connected));

        {
            let mut drivers = self.drivers.write().await;
            if drivers.iter().any(|d| d.prefix == prefix_lower) {
                feedback_task.abort();
                status_task.abort();
                return Err(HubError::DuplicatePrefix(prefix));
            }
            drivers.push(RegisteredDriver {
                name,
                prefix: prefix_lower,
                driver,
                health: Arc::clone(&health),
                ever_connected,
                feedback_task,
                status_task,
            });
        }

        health.start().await;
        Ok(())
    }

    fn spawn_feedback_relay(
        self: &Arc<Self>,
        prefix: String,
        mut events: tokio::sync::broadcast::Receiver<DriverEvent>,
    ) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(DriverEvent::Feedback { address, args }) => {
                        let full = join_prefix(&prefix, &address);
                        if let Err(e) = hub.socket.send_to_clients(&full, args).await {
                            warn!(address = %full, error = %e, "failed to relay driver feedback");
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_status_relay(
        self: &Arc<Self>,
        name: String,
        mut states: tokio::sync::broadcast::Receiver<(ConnectionState, ConnectionState)>,
        ever_connected: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        let sanitised = sanitise_filename(&name);
        tokio::spawn(async move {
            loop {
                match states.recv().await {
                    Ok((_old, new)) => {
                        let up = new == ConnectionState::Connected;
                        let address = format!("/system/driver/{sanitised}/status");
                        let _ = hub.socket.send_to_clients(&address, vec![Value::Int(up as i32)]).await;
                        if up {
                            ever_connected.store(true, Ordering::SeqCst);
                            hub.maybe_fire_ready().await;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn maybe_fire_ready(&self) {
        if self.ready_fired.load(Ordering::SeqCst) {
            return;
        }
        let all_connected = {
            let drivers = self.drivers.read().await;
            !drivers.is_empty() && drivers.iter().all(|d| d.ever_connected.load(Ordering::SeqCst))
        };
        if all_connected && !self.ready_fired.swap(true, Ordering::SeqCst) {
            info!("every registered driver has connected at least once, system ready");
            let _ = self.socket.send_to_clients("/system/ready", vec![Value::Int(1)]).await;
        }
    }

    /// Entry point for every datagram the message socket decodes.
    pub async fn handle_inbound(self: &Arc<Self>, message: Message) {
        self.message_count.fetch_add(1, Ordering::Relaxed);
        let lower = message.address.to_ascii_lowercase();

        if self.macro_engine.is_macro(&lower) {
            self.macro_engine.execute(&lower, message.args).await;
            return;
        }

        // Past this point the address is known not to be a macro trigger;
        // keep its original case so a driver that needs to forward a
        // human-visible identifier verbatim (spec §4.4) still can.
        self.dispatch_resolved(&message.address, message.args).await;
    }

    /// Final dispatch for an address already known not to be a macro trigger:
    /// built-in commands, then the longest matching registered driver prefix.
    /// `address` retains its original case; every check here is
    /// case-insensitive.
    async fn dispatch_resolved(self: &Arc<Self>, address: &str, args: Vec<Value>) {
        if address.eq_ignore_ascii_case("/fade/stop") {
            match args.first().and_then(Value::as_str) {
                Some(key) => self.fade.stop(Some(key)),
                None => self.fade.stop(None),
            }
            return;
        }

        if address.eq_ignore_ascii_case("/system/check") {
            self.run_systems_check().await;
            return;
        }

        if let Some(rest) = Message::strip_prefix_lower(address, "/hub") {
            self.dispatch_hub_command(&rest, args).await;
            return;
        }

        self.dispatch_to_driver(address, args).await;
    }

    async fn dispatch_hub_command(self: &Arc<Self>, rest: &str, args: Vec<Value>) {
        match rest {
            "/go" => self.cue_engine.go().await,
            "/standby" | "/reset" => self.cue_engine.standby(),
            "/stop" => debug!("hub stop sentinel dispatched"),
            other if other.starts_with("/macro/") => {
                let name = &other["/macro/".len()..];
                self.macro_engine.execute(&format!("/{name}"), args).await;
            }
            other => warn!(address = %format!("/hub{other}"), "unrecognised hub command"),
        }
    }

    async fn dispatch_to_driver(&self, address: &str, args: Vec<Value>) {
        let target = {
            let drivers = self.drivers.read().await;
            drivers
                .iter()
                .filter(|d| Message::address_under(address, &d.prefix))
                .max_by_key(|d| d.prefix.len())
                .map(|d| (Arc::clone(&d.driver), d.prefix.clone()))
        };

        let Some((driver, prefix)) = target else {
            warn!(%address, "no driver registered for address");
            return;
        };

        let remainder = Message::strip_prefix_lower(address, &prefix).unwrap_or_default();
        let remainder_original = Message::strip_prefix(address, &prefix).unwrap_or_default();
        driver.handle_message(&remainder, &remainder_original, &args).await;
    }

    async fn collect_check_results(&self) -> SystemCheckResult {
        let drivers = self.drivers.read().await;
        let mut out = Vec::with_capacity(drivers.len());
        for d in drivers.iter() {
            out.push(DriverCheckResult {
                name: d.name.clone(),
                state: format!("{:?}", d.health.state().await),
                attempts: d.health.attempts(),
            });
        }
        SystemCheckResult { drivers: out }
    }

    async fn run_systems_check(&self) {
        let payload = self.collect_check_results().await;
        let json = serde_json::to_string(&payload).unwrap_or_else(|_| "{}".to_string());
        let _ = self.socket.send_to_clients("/system/check/result", vec![Value::String(json)]).await;
    }

    /// The same systems-check routine `/system/check` triggers over the
    /// message socket, returned inline as JSON for the HTTP side channel's
    /// `/systems-check` so an operator UI doesn't need to also speak the
    /// wire protocol just to run one.
    pub async fn systems_check_json(&self) -> serde_json::Value {
        serde_json::to_value(self.collect_check_results().await).unwrap_or(serde_json::Value::Null)
    }

    /// Snapshot of every registered driver's connection state, for the HTTP
    /// side channel.
    pub async fn driver_statuses(&self) -> Vec<DriverStatusSnapshot> {
        let drivers = self.drivers.read().await;
        let mut out = Vec::with_capacity(drivers.len());
        for d in drivers.iter() {
            let state = d.health.state().await;
            out.push(DriverStatusSnapshot {
                name: d.name.clone(),
                prefix: d.prefix.clone(),
                connected: state == ConnectionState::Connected,
                state,
                attempts: d.health.attempts(),
                last_seen_ms: d.health.last_seen_ms(),
            });
        }
        out
    }

    pub async fn is_ready(&self) -> bool {
        self.ready_fired.load(Ordering::SeqCst)
    }

    /// Tear down every driver's health manager and timer task. Leaves the
    /// socket itself open — the caller owns its lifetime.
    pub async fn shutdown(&self) {
        self.macro_engine.shutdown();
        self.cue_engine.shutdown();
        if let Some(handle) = self.fade_ticker.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(handle) = self.fade_relay.lock().unwrap().take() {
            handle.abort();
        }

        let mut drivers = self.drivers.write().await;
        for d in drivers.drain(..) {
            d.health.shutdown().await;
            d.feedback_task.abort();
            d.status_task.abort();
            let _ = d.driver.disconnect().await;
        }
    }
}

/// Join a driver prefix with a feedback address that may or may not carry
/// its own leading slash.
fn join_prefix(prefix: &str, relative: &str) -> String {
    let p = prefix.trim_end_matches('/');
    let r = relative.trim_start_matches('/');
    format!("{p}/{r}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use showhub_driver::EventEmitter;
    use std::sync::atomic::AtomicBool as StdAtomicBool;
    use std::time::Duration;

    struct StubDriver {
        name: String,
        prefix: String,
        events: EventEmitter,
        connected: StdAtomicBool,
        received: std::sync::Mutex<Vec<(String, Vec<Value>)>>,
    }

    impl StubDriver {
        fn new(name: &str, prefix: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                prefix: prefix.into(),
                events: EventEmitter::new(),
                connected: StdAtomicBool::new(false),
                received: std::sync::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Driver for StubDriver {
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
            self.received.lock().unwrap().push((address.to_string(), args.to_vec()));
        }
        fn events(&self) -> tokio::sync::broadcast::Receiver<DriverEvent> {
            self.events.subscribe()
        }
    }

    async fn test_hub() -> Arc<Hub> {
        let socket = MessageSocket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let fade = Arc::new(FadeEngine::new());
        Hub::new(socket, fade)
    }

    #[tokio::test]
    async fn duplicate_prefix_registration_fails_without_mutating_table() {
        let hub = test_hub().await;
        let d1 = StubDriver::new("a", "/dup");
        let d2 = StubDriver::new("b", "/DUP");

        hub.register_driver("a", "/dup", d1, Transport::Datagram, ReconnectPolicy::default())
            .await
            .unwrap();
        let err = hub
            .register_driver("b", "/DUP", d2, Transport::Datagram, ReconnectPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::DuplicatePrefix(_)));
        assert_eq!(hub.driver_statuses().await.len(), 1);
    }

    #[tokio::test]
    async fn longest_prefix_wins_when_prefixes_nest() {
        let hub = test_hub().await;
        let outer = StubDriver::new("outer", "/a");
        let inner = StubDriver::new("inner", "/a/b");
        hub.register_driver("outer", "/a", outer.clone(), Transport::Datagram, ReconnectPolicy::default())
            .await
            .unwrap();
        hub.register_driver("inner", "/a/b", inner.clone(), Transport::Datagram, ReconnectPolicy::default())
            .await
            .unwrap();

        hub.dispatch_to_driver("/a/b/c", vec![]).await;

        assert_eq!(inner.received.lock().unwrap().len(), 1);
        assert!(outer.received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn panic_macro_survives_reload_and_cancels_fades_then_sends_hub_stop() {
        let hub = test_hub().await;
        hub.fade().start_fade(showhub_fade::StartFade {
            key: "k".into(),
            start_value: 0.0,
            end_value: 1.0,
            duration_ms: 1000,
            easing: showhub_fade::Easing::Linear,
        });
        hub.fade().set_current_value("k", 0.5);
        assert!(hub.fade().get_current_value("k").is_some());

        // Reload with a user table that tries to clobber the trigger.
        hub.reload_macros(vec![showhub_macro::MacroDef {
            trigger: "/hub/panic".into(),
            actions: vec![showhub_macro::MacroAction { address: "/nope".into(), args: vec![], delay_ms: 0 }],
        }]);

        assert!(hub.macro_engine().is_macro("/hub/panic"));
        hub.macro_engine().execute("/hub/panic", vec![]).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(hub.fade().active_count(), 0);
    }

    #[tokio::test]
    async fn feedback_relay_prepends_prefix_regardless_of_leading_slash() {
        assert_eq!(join_prefix("/avantis", "ch/1/mix/fader"), "/avantis/ch/1/mix/fader");
        assert_eq!(join_prefix("/td", "/cue/next"), "/td/cue/next");
    }

    #[tokio::test]
    async fn unregistered_address_is_dropped_without_panicking() {
        let hub = test_hub().await;
        hub.dispatch_to_driver("/nowhere", vec![]).await;
    }
}
