//! Lighting-console driver: datagram pass-through (spec §4.11).
//!
//! Playback go/level, executor fire, and release all forward as a single
//! relative feedback event; there is no device wire protocol to translate —
//! the console is assumed to listen on the same message protocol.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use showhub_driver::{Driver, DriverEvent, EventEmitter, LogRing};
use showhub_proto::Value;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, Default)]
pub struct Playback {
    pub level: f64,
    pub active: bool,
}

#[derive(Default)]
struct LightingState {
    playbacks: HashMap<(u32, u32), Playback>,
    last_exec: Option<u32>,
    last_release: Option<u32>,
}

pub struct LightingDriver {
    name: String,
    prefix: String,
    events: EventEmitter,
    state: StdMutex<LightingState>,
    log: StdMutex<LogRing>,
    connected: AtomicBool,
}

impl LightingDriver {
    pub fn new(name: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prefix: prefix.into(),
            events: EventEmitter::new(),
            state: StdMutex::new(LightingState::default()),
            log: StdMutex::new(LogRing::default()),
            connected: AtomicBool::new(false),
        }
    }

    pub fn playback(&self, x: u32, y: u32) -> Playback {
        self.state.lock().unwrap().playbacks.get(&(x, y)).copied().unwrap_or_default()
    }
}

fn parse_pb(address: &str) -> Option<(u32, u32, Option<&str>)> {
    let segs: Vec<&str> = address.split('/').filter(|s| !s.is_empty()).collect();
    if segs.first() != Some(&"pb") {
        return None;
    }
    let x: u32 = segs.get(1)?.parse().ok()?;
    let y: u32 = segs.get(2)?.parse().ok()?;
    Some((x, y, segs.get(3).copied()))
}

fn parse_indexed(address: &str, family: &str) -> Option<u32> {
    let segs: Vec<&str> = address.split('/').filter(|s| !s.is_empty()).collect();
    if segs.first() != Some(&family) {
        return None;
    }
    segs.get(1)?.parse().ok()
}

#[async_trait]
impl Driver for LightingDriver {
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
        if let Some((x, y, sub)) = parse_pb(address) {
            match sub {
                None => {
                    let mut state = self.state.lock().unwrap();
                    state.playbacks.entry((x, y)).or_default().active = true;
                    self.log.lock().unwrap().push("pb_go", format!("{x}/{y}"));
                    drop(state);
                    self.events.feedback(format!("pb/{x}/{y}"), vec![]);
                }
                Some("level") => {
                    let Some(level) = args.first().and_then(Value::as_f64) else { return };
                    self.state.lock().unwrap().playbacks.entry((x, y)).or_default().level = level;
                    self.events.feedback(format!("pb/{x}/{y}/level"), vec![Value::Float(level as f32)]);
                }
                _ => {}
            }
            return;
        }

        if let Some(n) = parse_indexed(address, "exec") {
            self.state.lock().unwrap().last_exec = Some(n);
            self.log.lock().unwrap().push("exec", n.to_string());
            self.events.feedback(format!("exec/{n}"), vec![]);
            return;
        }

        if let Some(n) = parse_indexed(address, "release") {
            {
                let mut state = self.state.lock().unwrap();
                state.last_release = Some(n);
                for pb in state.playbacks.values_mut() {
                    // release deactivates every playback tracked; the spec
                    // does not scope releases to a single playback number.
                    pb.active = false;
                }
            }
            self.log.lock().unwrap().push("release", n.to_string());
            self.events.feedback(format!("release/{n}"), vec![]);
        }
    }

    fn events(&self) -> broadcast::Receiver<DriverEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pb_go_activates_playback_and_emits_feedback() {
        let driver = LightingDriver::new("lights", "/lights");
        driver.connect().await.unwrap();
        let mut rx = driver.events();

        driver.handle_message("pb/1/2", "pb/1/2", &[]).await;

        assert!(driver.playback(1, 2).active);
        assert_eq!(rx.recv().await.unwrap(), DriverEvent::Feedback { address: "pb/1/2".into(), args: vec![] });
    }

    #[tokio::test]
    async fn pb_level_updates_stored_level() {
        let driver = LightingDriver::new("lights", "/lights");
        driver.connect().await.unwrap();
        driver.handle_message("pb/1/2/level", "pb/1/2/level", &[Value::Float(0.5)]).await;
        assert_eq!(driver.playback(1, 2).level, 0.5);
    }

    #[tokio::test]
    async fn release_deactivates_tracked_playbacks() {
        let driver = LightingDriver::new("lights", "/lights");
        driver.connect().await.unwrap();
        driver.handle_message("pb/1/2", "pb/1/2", &[]).await;
        driver.handle_message("release/1", "release/1", &[]).await;
        assert!(!driver.playback(1, 2).active);
    }
}
