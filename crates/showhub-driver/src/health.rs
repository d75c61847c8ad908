//! Per-driver connection-health state machine: exponential-backoff reconnect
//! and transport-aware heartbeat liveness detection. Spec §4.5.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{Driver, DriverEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

/// Whether a driver's transport can go silent without meaning the link
/// died (datagram) or whether silence past a threshold means dead
/// (stream-oriented). Only stream transports get a heartbeat timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Datagram,
    StreamTcp,
    StreamWebSocket,
}

impl Transport {
    fn is_stream(self) -> bool {
        matches!(self, Transport::StreamTcp | Transport::StreamWebSocket)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub base_ms: u64,
    pub max_ms: u64,
    /// 0 means unlimited.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            base_ms: 500,
            max_ms: 30_000,
            max_attempts: 0,
        }
    }
}

const HEARTBEAT_INTERVAL_MS: u64 = 2_000;
const HEARTBEAT_TIMEOUT_MULTIPLIER: u64 = 3;

/// Wraps a driver with its connection-state machine. Always held behind an
/// `Arc` — its timers need to spawn tasks that call back into `self`.
pub struct HealthManager {
    driver: Arc<dyn Driver>,
    transport: Transport,
    policy: ReconnectPolicy,

    state: RwLock<ConnectionState>,
    attempts: AtomicU32,
    last_seen_ms: AtomicU64,

    state_events: broadcast::Sender<(ConnectionState, ConnectionState)>,
    reconnect_timer: Mutex<Option<JoinHandle<()>>>,
    heartbeat_timer: Mutex<Option<JoinHandle<()>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl HealthManager {
    pub fn new(driver: Arc<dyn Driver>, transport: Transport, policy: ReconnectPolicy) -> Arc<Self> {
        let (state_events, _) = broadcast::channel(64);
        Arc::new(Self {
            driver,
            transport,
            policy,
            state: RwLock::new(ConnectionState::Disconnected),
            attempts: AtomicU32::new(0),
            last_seen_ms: AtomicU64::new(0),
            state_events,
            reconnect_timer: Mutex::new(None),
            heartbeat_timer: Mutex::new(None),
            event_loop: Mutex::new(None),
        })
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn last_seen_ms(&self) -> Option<u64> {
        let v = self.last_seen_ms.load(Ordering::Relaxed);
        (v != 0).then_some(v)
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<(ConnectionState, ConnectionState)> {
        self.state_events.subscribe()
    }

    /// Subscribe to the driver's event stream and begin the first connection
    /// attempt. Call once per driver at registration time, on the `Arc`
    /// returned by [`HealthManager::new`].
    pub async fn start(self: &Arc<Self>) {
        let mgr = Arc::clone(self);
        let mut events = self.driver.events();
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(DriverEvent::Connected) => mgr.on_connected().await,
                    Ok(DriverEvent::Disconnected) => mgr.on_disconnected().await,
                    Ok(DriverEvent::Error(e)) => mgr.on_error(e).await,
                    Ok(DriverEvent::Feedback { .. }) => mgr.touch_last_seen(),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.event_loop.lock().await = Some(handle);

        self.transition(ConnectionState::Connecting).await;
        if let Err(e) = self.driver.connect().await {
            self.on_error(e.to_string()).await;
        }
    }

    fn touch_last_seen(&self) {
        self.last_seen_ms.store(now_ms(), Ordering::Relaxed);
    }

    async fn transition(&self, new: ConnectionState) {
        let old = {
            let mut state = self.state.write().await;
            let old = *state;
            *state = new;
            old
        };
        if old != new {
            debug!(driver = self.driver.name(), ?old, ?new, "connection state changed");
            let _ = self.state_events.send((old, new));
        }
    }

    async fn on_connected(self: &Arc<Self>) {
        self.attempts.store(0, Ordering::Relaxed);
        self.touch_last_seen();
        self.cancel_reconnect().await;
        self.transition(ConnectionState::Connected).await;
        if self.transport.is_stream() {
            self.spawn_heartbeat().await;
        }
    }

    async fn on_disconnected(self: &Arc<Self>) {
        self.cancel_heartbeat().await;
        self.transition(ConnectionState::Disconnected).await;
        self.schedule_reconnect().await;
    }

    async fn on_error(self: &Arc<Self>, message: String) {
        warn!(driver = self.driver.name(), error = %message, "driver error");
        self.cancel_heartbeat().await;
        self.transition(ConnectionState::Error).await;
        self.schedule_reconnect().await;
    }

    /// Backoff doubles every attempt from `base_ms`, clamped to `max_ms`:
    /// attempt 1 waits `base_ms`, attempt 2 waits `min(max_ms, 2*base_ms)`,
    /// and so on. The attempt counter increments as soon as a reconnect is
    /// scheduled, not when it fires.
    async fn schedule_reconnect(self: &Arc<Self>) {
        if !self.policy.enabled {
            return;
        }
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        if self.policy.max_attempts > 0 && attempt > self.policy.max_attempts {
            warn!(driver = self.driver.name(), attempt, "exceeded max reconnect attempts");
            self.transition(ConnectionState::Error).await;
            return;
        }

        let shift = attempt.saturating_sub(1).min(32);
        let backoff_ms = self
            .policy
            .base_ms
            .saturating_mul(1u64 << shift)
            .min(self.policy.max_ms);
        self.transition(ConnectionState::Reconnecting).await;

        let mgr = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            info!(driver = mgr.driver.name(), backoff_ms, "attempting reconnect");
            mgr.transition(ConnectionState::Connecting).await;
            if let Err(e) = mgr.driver.connect().await {
                mgr.on_error(e.to_string()).await;
            }
        });
        *self.reconnect_timer.lock().await = Some(handle);
    }

    /// Stream transports only: if no heartbeat/feedback has been seen for
    /// `3 * HEARTBEAT_INTERVAL_MS`, treat the link as dead and disconnect —
    /// the driver's own `Disconnected` event then drives reconnection.
    async fn spawn_heartbeat(self: &Arc<Self>) {
        let mgr = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let timeout_ms = HEARTBEAT_INTERVAL_MS * HEARTBEAT_TIMEOUT_MULTIPLIER;
            let mut interval = tokio::time::interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
            loop {
                interval.tick().await;
                let last_seen = mgr.last_seen_ms.load(Ordering::Relaxed);
                if now_ms().saturating_sub(last_seen) > timeout_ms {
                    warn!(driver = mgr.driver.name(), "heartbeat timed out");
                    let _ = mgr.driver.disconnect().await;
                    break;
                }
            }
        });
        *self.heartbeat_timer.lock().await = Some(handle);
    }

    async fn cancel_reconnect(&self) {
        if let Some(handle) = self.reconnect_timer.lock().await.take() {
            handle.abort();
        }
    }

    async fn cancel_heartbeat(&self) {
        if let Some(handle) = self.heartbeat_timer.lock().await.take() {
            handle.abort();
        }
    }

    /// Cancel every live timer and the event loop. No callbacks fire after
    /// this returns.
    pub async fn shutdown(&self) {
        self.cancel_reconnect().await;
        self.cancel_heartbeat().await;
        if let Some(handle) = self.event_loop.lock().await.take() {
            handle.abort();
        }
        self.transition(ConnectionState::Disconnected).await;
    }
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use showhub_proto::Value;
    use std::sync::atomic::AtomicBool;

    struct FlakyDriver {
        emitter: crate::EventEmitter,
        connect_calls: AtomicU32,
        should_fail: AtomicBool,
        connected: AtomicBool,
    }

    impl FlakyDriver {
        fn new(should_fail: bool) -> Arc<Self> {
            Arc::new(Self {
                emitter: crate::EventEmitter::new(),
                connect_calls: AtomicU32::new(0),
                should_fail: AtomicBool::new(should_fail),
                connected: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Driver for FlakyDriver {
        fn name(&self) -> &str {
            "flaky"
        }
        fn prefix(&self) -> &str {
            "/flaky"
        }

        async fn connect(&self) -> anyhow::Result<()> {
            self.connect_calls.fetch_add(1, Ordering::Relaxed);
            if self.should_fail.load(Ordering::Relaxed) {
                self.emitter.error("refused");
                anyhow::bail!("refused");
            }
            self.connected.store(true, Ordering::Relaxed);
            self.emitter.connected();
            Ok(())
        }

        async fn disconnect(&self) -> anyhow::Result<()> {
            self.connected.store(false, Ordering::Relaxed);
            self.emitter.disconnected();
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::Relaxed)
        }

        async fn handle_message(&self, _address: &str, _original: &str, _args: &[Value]) {}

        fn events(&self) -> broadcast::Receiver<DriverEvent> {
            self.emitter.subscribe()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn successful_connect_resets_attempts_and_reaches_connected() {
        let driver = FlakyDriver::new(false);
        let mgr = HealthManager::new(
            driver.clone(),
            Transport::Datagram,
            ReconnectPolicy::default(),
        );
        mgr.start().await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert_eq!(mgr.state().await, ConnectionState::Connected);
        assert_eq!(mgr.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_schedules_backoff_reconnect() {
        let driver = FlakyDriver::new(true);
        let policy = ReconnectPolicy {
            enabled: true,
            base_ms: 100,
            max_ms: 10_000,
            max_attempts: 0,
        };
        let mgr = HealthManager::new(driver.clone(), Transport::Datagram, policy);
        mgr.start().await;
        tokio::task::yield_now().await;

        assert_eq!(mgr.state().await, ConnectionState::Error);
        assert_eq!(mgr.attempts(), 1);

        // First reconnect fires at base_ms; driver still fails, so attempts
        // advance to 2 and the next wait doubles.
        tokio::time::advance(Duration::from_millis(150)).await;
        tokio::task::yield_now().await;
        assert_eq!(mgr.attempts(), 2);

        driver.should_fail.store(false, Ordering::Relaxed);
        tokio::time::advance(Duration::from_millis(250)).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert_eq!(mgr.state().await, ConnectionState::Connected);
        assert_eq!(mgr.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exceeding_max_attempts_stops_reconnecting() {
        let driver = FlakyDriver::new(true);
        let policy = ReconnectPolicy {
            enabled: true,
            base_ms: 10,
            max_ms: 10_000,
            max_attempts: 1,
        };
        let mgr = HealthManager::new(driver.clone(), Transport::Datagram, policy);
        mgr.start().await;
        tokio::task::yield_now().await;

        assert_eq!(mgr.attempts(), 1);
        assert_eq!(mgr.state().await, ConnectionState::Error);

        tokio::time::advance(Duration::from_millis(50)).await;
        tokio::task::yield_now().await;
        // No second reconnect attempt should have been scheduled past the cap.
        assert_eq!(mgr.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_reconnect() {
        let driver = FlakyDriver::new(true);
        let policy = ReconnectPolicy {
            enabled: true,
            base_ms: 1_000,
            max_ms: 10_000,
            max_attempts: 0,
        };
        let mgr = HealthManager::new(driver.clone(), Transport::Datagram, policy);
        mgr.start().await;
        tokio::task::yield_now().await;
        assert_eq!(mgr.attempts(), 1);

        mgr.shutdown().await;
        tokio::time::advance(Duration::from_millis(2_000)).await;
        tokio::task::yield_now().await;

        // attempts stays at 1: the reconnect timer was aborted before firing.
        assert_eq!(mgr.attempts(), 1);
        assert_eq!(mgr.state().await, ConnectionState::Disconnected);
    }
}
