//! PTZ camera driver: VISCA over TCP (spec §4.11). No feedback — VISCA ACK/
//! completion bytes are not translated back onto the message socket.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use showhub_driver::{Driver, DriverEvent, EventEmitter, LogRing};
use showhub_proto::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tracing::warn;

const VISCA_TERM: u8 = 0xFF;

fn visca_speed_byte(v: f64) -> u8 {
    // VISCA pan/tilt speed is 0x01-0x18; map [-1,1] onto the signed range by
    // encoding sign separately in the command, magnitude here.
    (v.abs().clamp(0.0, 1.0) * 0x17 as f64).round() as u8 + 1
}

fn visca_zoom_position(v: f64) -> [u8; 4] {
    let pos = (v.clamp(0.0, 1.0) * 0x4000 as f64).round() as u16;
    [(pos >> 12) as u8 & 0x0F, (pos >> 8) as u8 & 0x0F, (pos >> 4) as u8 & 0x0F, pos as u8 & 0x0F]
}

fn preset_recall_bytes(addr: u8, preset: u8) -> Vec<u8> {
    vec![0x80 | addr, 0x01, 0x04, 0x3F, 0x02, preset, VISCA_TERM]
}

fn preset_store_bytes(addr: u8, preset: u8) -> Vec<u8> {
    vec![0x80 | addr, 0x01, 0x04, 0x3F, 0x01, preset, VISCA_TERM]
}

fn home_bytes(addr: u8) -> Vec<u8> {
    vec![0x80 | addr, 0x01, 0x06, 0x04, VISCA_TERM]
}

fn pan_tilt_speed_bytes(addr: u8, pan: f64, tilt: f64) -> Vec<u8> {
    let pan_dir = if pan < 0.0 { 0x01 } else if pan > 0.0 { 0x02 } else { 0x03 };
    let tilt_dir = if tilt < 0.0 { 0x01 } else if tilt > 0.0 { 0x02 } else { 0x03 };
    vec![
        0x80 | addr, 0x01, 0x06, 0x01,
        visca_speed_byte(pan), visca_speed_byte(tilt),
        pan_dir, tilt_dir,
        VISCA_TERM,
    ]
}

fn pan_tilt_stop_bytes(addr: u8) -> Vec<u8> {
    vec![0x80 | addr, 0x01, 0x06, 0x01, 0x03, 0x03, 0x03, 0x03, VISCA_TERM]
}

fn zoom_speed_bytes(addr: u8, speed: f64) -> Vec<u8> {
    let dir = if speed < 0.0 { 0x30 } else if speed > 0.0 { 0x20 } else { 0x00 };
    let magnitude = (speed.abs().clamp(0.0, 1.0) * 0x07 as f64).round() as u8;
    vec![0x80 | addr, 0x01, 0x04, 0x07, dir | magnitude, VISCA_TERM]
}

fn zoom_stop_bytes(addr: u8) -> Vec<u8> {
    vec![0x80 | addr, 0x01, 0x04, 0x07, 0x00, VISCA_TERM]
}

fn zoom_direct_bytes(addr: u8, position: f64) -> Vec<u8> {
    let digits = visca_zoom_position(position);
    let mut bytes = vec![0x80 | addr, 0x01, 0x04, 0x47];
    bytes.extend_from_slice(&digits);
    bytes.push(VISCA_TERM);
    bytes
}

fn power_bytes(addr: u8, on: bool) -> Vec<u8> {
    vec![0x80 | addr, 0x01, 0x04, 0x00, if on { 0x02 } else { 0x03 }, VISCA_TERM]
}

fn focus_mode_bytes(addr: u8, auto: bool) -> Vec<u8> {
    vec![0x80 | addr, 0x01, 0x04, 0x38, if auto { 0x02 } else { 0x03 }, VISCA_TERM]
}

#[derive(Default)]
struct PtzState {
    preset: Option<u8>,
    pan_speed: f64,
    tilt_speed: f64,
    zoom_speed: f64,
    zoom_position: f64,
    powered: bool,
    auto_focus: bool,
    stored_presets: HashSet<u8>,
}

pub struct PtzDriver {
    name: String,
    prefix: String,
    host: String,
    port: u16,
    visca_addr: u8,
    events: EventEmitter,
    state: StdMutex<PtzState>,
    write_half: Mutex<Option<OwnedWriteHalf>>,
    log: StdMutex<LogRing>,
    connected: AtomicBool,
}

impl PtzDriver {
    pub fn new(name: impl Into<String>, prefix: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            prefix: prefix.into(),
            host: host.into(),
            port,
            visca_addr: 1,
            events: EventEmitter::new(),
            state: StdMutex::new(PtzState::default()),
            write_half: Mutex::new(None),
            log: StdMutex::new(LogRing::default()),
            connected: AtomicBool::new(false),
        }
    }

    async fn send(&self, bytes: Vec<u8>) {
        let mut guard = self.write_half.lock().await;
        if let Some(write) = guard.as_mut() {
            if let Err(e) = write.write_all(&bytes).await {
                warn!(driver = %self.name, error = %e, "ptz write failed");
                self.events.error(format!("write failed: {e}"));
            }
        }
    }
}

#[async_trait]
impl Driver for PtzDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn connect(&self) -> anyhow::Result<()> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        let (_read_half, write_half) = stream.into_split();
        *self.write_half.lock().await = Some(write_half);
        self.connected.store(true, Ordering::SeqCst);
        self.events.connected();
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        *self.write_half.lock().await = None;
        self.events.disconnected();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn handle_message(&self, address: &str, _original: &str, args: &[Value]) {
        let addr = self.visca_addr;
        match address {
            a if a.starts_with("preset/recall/") => {
                let Some(n) = a.rsplit('/').next().and_then(|s| s.parse::<u8>().ok()) else { return };
                self.state.lock().unwrap().preset = Some(n);
                self.log.lock().unwrap().push("preset_recall", n.to_string());
                self.send(preset_recall_bytes(addr, n)).await;
            }
            a if a.starts_with("preset/store/") => {
                let Some(n) = a.rsplit('/').next().and_then(|s| s.parse::<u8>().ok()) else { return };
                self.state.lock().unwrap().stored_presets.insert(n);
                self.log.lock().unwrap().push("preset_store", n.to_string());
                self.send(preset_store_bytes(addr, n)).await;
            }
            "home" => {
                self.send(home_bytes(addr)).await;
            }
            "pan/speed" => {
                let Some(v) = args.first().and_then(Value::as_f64) else { return };
                let tilt = self.state.lock().unwrap().tilt_speed;
                self.state.lock().unwrap().pan_speed = v;
                self.send(pan_tilt_speed_bytes(addr, v, tilt)).await;
            }
            "tilt/speed" => {
                let Some(v) = args.first().and_then(Value::as_f64) else { return };
                let pan = self.state.lock().unwrap().pan_speed;
                self.state.lock().unwrap().tilt_speed = v;
                self.send(pan_tilt_speed_bytes(addr, pan, v)).await;
            }
            "pantilt/stop" => {
                let mut state = self.state.lock().unwrap();
                state.pan_speed = 0.0;
                state.tilt_speed = 0.0;
                drop(state);
                self.send(pan_tilt_stop_bytes(addr)).await;
            }
            "pantilt/speed" => {
                let Some(pan) = args.first().and_then(Value::as_f64) else { return };
                let Some(tilt) = args.get(1).and_then(Value::as_f64) else { return };
                {
                    let mut state = self.state.lock().unwrap();
                    state.pan_speed = pan;
                    state.tilt_speed = tilt;
                }
                self.send(pan_tilt_speed_bytes(addr, pan, tilt)).await;
            }
            "zoom/speed" => {
                let Some(v) = args.first().and_then(Value::as_f64) else { return };
                self.state.lock().unwrap().zoom_speed = v;
                self.send(zoom_speed_bytes(addr, v)).await;
            }
            "zoom/direct" => {
                let Some(v) = args.first().and_then(Value::as_f64) else { return };
                self.state.lock().unwrap().zoom_position = v;
                self.send(zoom_direct_bytes(addr, v)).await;
            }
            "zoom/stop" => {
                self.state.lock().unwrap().zoom_speed = 0.0;
                self.send(zoom_stop_bytes(addr)).await;
            }
            "power/on" => {
                self.state.lock().unwrap().powered = true;
                self.send(power_bytes(addr, true)).await;
            }
            "power/off" => {
                self.state.lock().unwrap().powered = false;
                self.send(power_bytes(addr, false)).await;
            }
            "focus/auto" => {
                self.state.lock().unwrap().auto_focus = true;
                self.send(focus_mode_bytes(addr, true)).await;
            }
            "focus/manual" => {
                self.state.lock().unwrap().auto_focus = false;
                self.send(focus_mode_bytes(addr, false)).await;
            }
            other => {
                warn!(driver = %self.name, address = other, "ptz: unrecognised address");
            }
        }
    }

    fn events(&self) -> broadcast::Receiver<DriverEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_recall_bytes_are_visca_shaped() {
        assert_eq!(preset_recall_bytes(1, 5), vec![0x81, 0x01, 0x04, 0x3F, 0x02, 5, 0xFF]);
    }

    #[test]
    fn zoom_speed_encodes_direction_in_high_nibble() {
        assert_eq!(zoom_speed_bytes(1, 0.5)[4] & 0xF0, 0x20);
        assert_eq!(zoom_speed_bytes(1, -0.5)[4] & 0xF0, 0x30);
        assert_eq!(zoom_speed_bytes(1, 0.0)[4], 0x00);
    }

    #[test]
    fn pan_tilt_speed_direction_bytes_reflect_sign() {
        let bytes = pan_tilt_speed_bytes(1, -0.5, 0.5);
        assert_eq!(bytes[6], 0x01); // pan left
        assert_eq!(bytes[7], 0x02); // tilt up
    }

    #[tokio::test]
    async fn preset_recall_sends_expected_bytes_over_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let driver = PtzDriver::new("camera1", "/camera1", addr.ip().to_string(), addr.port());

        let accept = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let n = tokio::io::AsyncReadExt::read(&mut sock, &mut buf).await.unwrap();
            buf[..n].to_vec()
        });

        driver.connect().await.unwrap();
        driver.handle_message("preset/recall/5", "preset/recall/5", &[]).await;

        assert_eq!(accept.await.unwrap(), preset_recall_bytes(1, 5));
    }
}
