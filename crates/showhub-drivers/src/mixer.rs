//! Audio-mixer driver: MIDI over TCP.
//!
//! The hardest driver (spec §4.6). Translates `/<family>/<n>/mix/<param>`
//! addresses to and from a binary MIDI control protocol, and uses the fade
//! engine for all timed parameter changes.
//!
//! The channel-to-MIDI mapping resolves the spec's open question in favor
//! of the "Bitfocus-verified" five-channel layout by default; see
//! `DESIGN.md` for why, and [`ChannelLayout::Legacy12Channel`] for the
//! alternative.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_trait::async_trait;
use showhub_config::ChannelLayout;
use showhub_driver::{Driver, DriverEvent, EventEmitter, LogRing};
use showhub_fade::{Easing, FadeEngine, StartFade};
use showhub_midi::{MidiEvent, MidiParser};
use showhub_proto::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const NRPN_MSB_CC: u8 = 99;
const NRPN_LSB_CC: u8 = 98;
const DATA_ENTRY_CC: u8 = 6;
const BANK_SELECT_CC: u8 = 0;

const NRPN_LSB_FADER: u8 = 0x17;
const NRPN_LSB_PAN: u8 = 0x18;

const MUTE_NOTE_BASE_CH: u8 = 0;
const MUTE_NOTE_BASE_DCA: u8 = 64;
const MUTE_NOTE_BASE_MAIN: u8 = 90;

/// Parse a case-insensitive easing name, falling back to `scurve` (not
/// `linear`) for anything unrecognized — the audio-mixer driver's own rule,
/// distinct from `showhub_fade::Easing::parse`'s linear fallback.
pub fn parse_easing_or_scurve(name: &str) -> Easing {
    match name.to_ascii_lowercase().as_str() {
        "linear" => Easing::Linear,
        "easein" => Easing::EaseIn,
        "easeout" => Easing::EaseOut,
        _ => Easing::SCurve,
    }
}

fn midi_channel_for(layout: ChannelLayout, family: &str) -> u8 {
    match layout {
        ChannelLayout::BitfocusFiveChannel => match family {
            "ch" => 0,
            "aux" => 1,
            "bus" => 2,
            "main" => 3,
            "dca" => 4,
            _ => 0,
        },
        ChannelLayout::Legacy12Channel => match family {
            "main" => 10,
            "dca" => 11,
            _ => 0,
        },
    }
}

fn family_for_channel(layout: ChannelLayout, channel: u8) -> Option<&'static str> {
    match layout {
        ChannelLayout::BitfocusFiveChannel => match channel {
            0 => Some("ch"),
            1 => Some("aux"),
            2 => Some("bus"),
            3 => Some("main"),
            4 => Some("dca"),
            _ => None,
        },
        ChannelLayout::Legacy12Channel => match channel {
            0 => Some("ch"),
            10 => Some("main"),
            11 => Some("dca"),
            _ => None,
        },
    }
}

fn mute_note_base(family: &str) -> u8 {
    match family {
        "dca" => MUTE_NOTE_BASE_DCA,
        "main" => MUTE_NOTE_BASE_MAIN,
        _ => MUTE_NOTE_BASE_CH,
    }
}

fn mute_family_for_base(note: u8) -> (&'static str, u8) {
    if note >= MUTE_NOTE_BASE_MAIN {
        ("main", note - MUTE_NOTE_BASE_MAIN)
    } else if note >= MUTE_NOTE_BASE_DCA {
        ("dca", note - MUTE_NOTE_BASE_DCA)
    } else {
        ("ch", note - MUTE_NOTE_BASE_CH)
    }
}

fn fade_family(family: &str) -> &str {
    if family == "ch" {
        "input"
    } else {
        family
    }
}

fn fade_family_to_address(family: &str) -> &str {
    if family == "input" {
        "ch"
    } else {
        family
    }
}

/// Parsed `(family, strip number, param)` from a remainder address.
/// `main` carries no strip number.
fn parse_address(address: &str) -> Option<(String, Option<u32>, String)> {
    let segs: Vec<&str> = address.split('/').filter(|s| !s.is_empty()).collect();
    if segs.is_empty() {
        return None;
    }
    let family = segs[0].to_string();
    let mut idx = 1;
    let mut n = None;
    if family != "main" {
        let tok = segs.get(idx)?;
        n = Some(tok.parse::<u32>().ok()?);
        idx += 1;
    }
    if segs.get(idx) == Some(&"mix") {
        idx += 1;
    }
    let param = segs.get(idx)?.to_string();
    Some((family, n, param))
}

fn strip_key(family: &str, n: Option<u32>) -> String {
    match n {
        Some(n) => format!("{family}/{n}"),
        None => family.to_string(),
    }
}

fn strip_suffix(n: Option<u32>) -> String {
    n.map(|n| n.to_string()).unwrap_or_default()
}

/// Build a `<family>[/<n>]/mix/<param>` address, omitting the strip-number
/// segment entirely for `main` (which has none) instead of leaving an empty
/// segment behind (`main//mix/fader`).
fn mix_address(family: &str, n: Option<u32>, param: &str) -> String {
    match n {
        Some(n) => format!("{family}/{n}/mix/{param}"),
        None => format!("{family}/mix/{param}"),
    }
}

fn nrpn_bytes(channel: u8, strip_hex: u8, param_lsb: u8, level: u8) -> Vec<u8> {
    let status = 0xB0 | (channel & 0x0F);
    vec![
        status, NRPN_MSB_CC, strip_hex,
        status, NRPN_LSB_CC, param_lsb,
        status, DATA_ENTRY_CC, level.min(127),
    ]
}

fn mute_bytes(channel: u8, note: u8, muted: bool) -> Vec<u8> {
    let on_status = 0x90 | (channel & 0x0F);
    let velocity = if muted { 0x7f } else { 0x00 };
    vec![on_status, note, velocity, on_status, note, 0x00]
}

fn scene_recall_bytes(channel: u8, scene: u32) -> Vec<u8> {
    let mut bytes = Vec::new();
    if scene >= 128 {
        bytes.push(0xB0 | (channel & 0x0F));
        bytes.push(BANK_SELECT_CC);
        bytes.push((scene / 128) as u8);
    }
    bytes.push(0xC0 | (channel & 0x0F));
    bytes.push((scene % 128) as u8);
    bytes
}

#[derive(Debug, Clone, Copy)]
struct Strip {
    fader: f64,
    muted: bool,
    pan: f64,
}

impl Default for Strip {
    fn default() -> Self {
        Self { fader: 0.0, muted: false, pan: 0.5 }
    }
}

#[derive(Default)]
struct MixerState {
    strips: HashMap<String, Strip>,
    scene: u32,
}

pub struct MixerDriver {
    name: String,
    prefix: String,
    host: String,
    port: u16,
    layout: ChannelLayout,
    events: EventEmitter,
    fade: Arc<FadeEngine>,
    state: StdMutex<MixerState>,
    write_half: Mutex<Option<OwnedWriteHalf>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    log: StdMutex<LogRing>,
    connected: AtomicBool,
    self_weak: Weak<MixerDriver>,
}

impl MixerDriver {
    pub fn new(
        name: impl Into<String>,
        prefix: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        layout: ChannelLayout,
        fade: Arc<FadeEngine>,
    ) -> Arc<Self> {
        let name = name.into();
        let prefix = prefix.into();
        let host = host.into();
        Arc::new_cyclic(|weak| Self {
            name,
            prefix,
            host,
            port,
            layout,
            events: EventEmitter::new(),
            fade,
            state: StdMutex::new(MixerState::default()),
            write_half: Mutex::new(None),
            read_task: Mutex::new(None),
            log: StdMutex::new(LogRing::default()),
            connected: AtomicBool::new(false),
            self_weak: weak.clone(),
        })
    }

    fn fade_key(&self, family: &str, n: Option<u32>, param: &str) -> String {
        format!("{}:{}/{}/{}", self.name, fade_family(family), strip_suffix(n), param)
    }

    async fn send(&self, bytes: Vec<u8>) {
        let mut guard = self.write_half.lock().await;
        if let Some(write) = guard.as_mut() {
            if let Err(e) = write.write_all(&bytes).await {
                warn!(driver = %self.name, error = %e, "mixer write failed");
                self.events.error(format!("write failed: {e}"));
            }
        }
    }

    async fn spawn_read_loop(self: &Arc<Self>, mut read_half: tokio::net::tcp::OwnedReadHalf) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut parser = MidiParser::new();
            let mut buf = [0u8; 512];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        this.events.disconnected();
                        break;
                    }
                    Ok(n) => {
                        let events = parser.feed(&buf[..n]);
                        for ev in events {
                            this.handle_midi_event(ev);
                        }
                    }
                    Err(e) => {
                        warn!(driver = %this.name, error = %e, "mixer read failed");
                        this.events.disconnected();
                        break;
                    }
                }
            }
        });
        *self.read_task.lock().await = Some(handle);
    }

    fn handle_midi_event(&self, event: MidiEvent) {
        match event {
            MidiEvent::Nrpn { channel, param_msb: strip_hex, param_lsb, value } => {
                let Some(family) = family_for_channel(self.layout, channel) else { return };
                let param = match param_lsb {
                    NRPN_LSB_FADER => "fader",
                    NRPN_LSB_PAN => "pan",
                    _ => return,
                };
                let n = if family == "main" { None } else { Some(strip_hex as u32 + 1) };
                let level = value as f64 / 127.0;
                {
                    let mut state = self.state.lock().unwrap();
                    let strip = state.strips.entry(strip_key(family, n)).or_default();
                    if param == "fader" {
                        strip.fader = level;
                    } else {
                        strip.pan = level;
                    }
                }
                let address = mix_address(family, n, param);
                self.events.feedback(address, vec![Value::Float(level as f32)]);
            }
            MidiEvent::NoteOn { channel, note, velocity } => {
                if family_for_channel(self.layout, channel).is_none() {
                    return;
                }
                let (family, idx) = mute_family_for_base(note);
                let n = if family == "main" { None } else { Some(idx as u32 + 1) };
                let muted = velocity >= 0x40;
                {
                    let mut state = self.state.lock().unwrap();
                    state.strips.entry(strip_key(family, n)).or_default().muted = muted;
                }
                let address = mix_address(family, n, "mute");
                self.events.feedback(address, vec![Value::Bool(muted)]);
            }
            MidiEvent::ProgramChange { program, .. } => {
                self.state.lock().unwrap().scene = program as u32;
                self.events.feedback("scene/current", vec![Value::Int(program as i32)]);
            }
        }
    }
}

#[async_trait]
impl Driver for MixerDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn connect(&self) -> anyhow::Result<()> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        let (read_half, write_half) = stream.into_split();
        *self.write_half.lock().await = Some(write_half);
        self.connected.store(true, Ordering::SeqCst);
        if let Some(this) = self.self_weak.upgrade() {
            this.spawn_read_loop(read_half).await;
        }
        self.events.connected();
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        *self.write_half.lock().await = None;
        if let Some(handle) = self.read_task.lock().await.take() {
            handle.abort();
        }
        self.events.disconnected();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn handle_message(&self, address: &str, _original: &str, args: &[Value]) {
        let Some((family, n, param)) = parse_address(address) else {
            warn!(driver = %self.name, %address, "mixer: unrecognised address");
            return;
        };

        match param.as_str() {
            "fader" | "pan" => {
                let Some(level) = args.first().and_then(Value::as_f64) else { return };
                {
                    let mut state = self.state.lock().unwrap();
                    let strip = state.strips.entry(strip_key(&family, n)).or_default();
                    if param == "fader" {
                        strip.fader = level;
                    } else {
                        strip.pan = level;
                    }
                }
                self.fade.set_current_value(&self.fade_key(&family, n, &param), level);
                let lsb = if param == "fader" { NRPN_LSB_FADER } else { NRPN_LSB_PAN };
                let strip_hex = n.map(|n| (n - 1) as u8).unwrap_or(0);
                let channel = midi_channel_for(self.layout, &family);
                self.send(nrpn_bytes(channel, strip_hex, lsb, (level * 127.0).round() as u8)).await;
                self.events.feedback(
                    mix_address(&family, n, &param),
                    vec![Value::Float(level as f32)],
                );
            }
            "mute" => {
                let muted = args.first().map(Value::is_truthy).unwrap_or(true);
                {
                    let mut state = self.state.lock().unwrap();
                    state.strips.entry(strip_key(&family, n)).or_default().muted = muted;
                }
                let note = mute_note_base(&family) + n.map(|n| (n - 1) as u8).unwrap_or(0);
                let channel = midi_channel_for(self.layout, &family);
                self.send(mute_bytes(channel, note, muted)).await;
                self.events.feedback(
                    mix_address(&family, n, "mute"),
                    vec![Value::Bool(muted)],
                );
            }
            "fade" => {
                let Some(target) = args.first().and_then(Value::as_f64) else { return };
                let seconds = args.get(1).and_then(Value::as_f64).unwrap_or(0.0);
                let easing_name = args.get(2).and_then(Value::as_str).unwrap_or("scurve");
                self.fade.start_fade(StartFade {
                    key: self.fade_key(&family, n, "fader"),
                    start_value: 0.0,
                    end_value: target,
                    duration_ms: (seconds * 1000.0).round() as u64,
                    easing: parse_easing_or_scurve(easing_name),
                });
            }
            other => {
                debug!(driver = %self.name, param = other, "mixer: unhandled param");
            }
        }
    }

    async fn handle_fade_tick(&self, key: &str, value: f64) {
        let Some(rest) = key.strip_prefix(&format!("{}:", self.name)) else { return };
        let Some((family_fade, n, param)) = parse_address(&format!("/{rest}")) else { return };
        let family = fade_family_to_address(&family_fade).to_string();

        {
            let mut state = self.state.lock().unwrap();
            let strip = state.strips.entry(strip_key(&family, n)).or_default();
            if param == "fader" {
                strip.fader = value;
            } else {
                strip.pan = value;
            }
        }

        let lsb = if param == "fader" { NRPN_LSB_FADER } else { NRPN_LSB_PAN };
        let strip_hex = n.map(|n| (n - 1) as u8).unwrap_or(0);
        let channel = midi_channel_for(self.layout, &family);
        self.send(nrpn_bytes(channel, strip_hex, lsb, (value * 127.0).round() as u8)).await;
        self.events.feedback(
            mix_address(&family, n, &param),
            vec![Value::Float(value as f32)],
        );
    }

    fn events(&self) -> broadcast::Receiver<DriverEvent> {
        self.events.subscribe()
    }
}

impl MixerDriver {
    pub async fn recall_scene(&self, scene: u32) {
        {
            let mut state = self.state.lock().unwrap();
            for strip in state.strips.values_mut() {
                *strip = Strip::default();
            }
            state.scene = scene;
        }
        self.log.lock().unwrap().push("scene_recall", scene.to_string());
        self.send(scene_recall_bytes(midi_channel_for(self.layout, "ch"), scene)).await;
        self.events.feedback("scene/current", vec![Value::Int(scene as i32)]);
    }
}
