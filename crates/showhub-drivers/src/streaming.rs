//! Streaming/recording-engine driver: WebSocket JSON-RPC, OBS-shaped
//! (spec §4.8). Owns the challenge-response handshake, the pre-identification
//! outbound queue, and translation of the small address surface the spec
//! requires into OBS-style requests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value as Json};
use sha2::{Digest, Sha256};
use showhub_driver::{Driver, DriverEvent, EventEmitter, LogRing};
use showhub_proto::Value;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

const EVENT_SUBSCRIPTIONS: u64 = 0x01FF;
const OP_HELLO: u64 = 0;
const OP_IDENTIFY: u64 = 1;
const OP_IDENTIFIED: u64 = 2;
const OP_EVENT: u64 = 5;
const OP_REQUEST: u64 = 6;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = futures_util::stream::SplitSink<WsStream, WsMessage>;

fn compute_auth(password: &str, salt: &str, challenge: &str) -> String {
    let mut first = Sha256::new();
    first.update(password.as_bytes());
    first.update(salt.as_bytes());
    let secret = BASE64.encode(first.finalize());

    let mut second = Sha256::new();
    second.update(secret.as_bytes());
    second.update(challenge.as_bytes());
    BASE64.encode(second.finalize())
}

struct PendingRequest {
    request_type: String,
    request_data: Option<Json>,
}

#[derive(Default)]
struct StreamingState {
    current_scene: String,
    preview_scene: String,
    streaming: bool,
    recording: bool,
    virtual_cam: bool,
    transition_name: String,
    transition_duration_ms: u32,
    sources: HashMap<String, bool>,
}

pub struct StreamingDriver {
    name: String,
    prefix: String,
    url: String,
    password: String,
    events: EventEmitter,
    write: Mutex<Option<WsSink>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    queue: Mutex<VecDeque<PendingRequest>>,
    next_request_id: AtomicU64,
    identified: AtomicBool,
    log: StdMutex<LogRing>,
    state: StdMutex<StreamingState>,
    self_weak: Weak<StreamingDriver>,
}

impl StreamingDriver {
    pub fn new(name: impl Into<String>, prefix: impl Into<String>, url: impl Into<String>, password: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        let prefix = prefix.into();
        let url = url.into();
        let password = password.into();
        Arc::new_cyclic(|weak| Self {
            name,
            prefix,
            url,
            password,
            events: EventEmitter::new(),
            write: Mutex::new(None),
            read_task: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
            next_request_id: AtomicU64::new(1),
            identified: AtomicBool::new(false),
            log: StdMutex::new(LogRing::default()),
            state: StdMutex::new(StreamingState::default()),
            self_weak: weak.clone(),
        })
    }

    async fn send_frame(&self, frame: Json) {
        let mut guard = self.write.lock().await;
        if let Some(sink) = guard.as_mut() {
            if let Err(e) = sink.send(WsMessage::Text(frame.to_string())).await {
                warn!(driver = %self.name, error = %e, "streaming write failed");
                self.events.error(format!("write failed: {e}"));
            }
        }
    }

    async fn send_request(&self, request_type: &str, request_data: Option<Json>) {
        if !self.identified.load(Ordering::SeqCst) {
            self.queue.lock().await.push_back(PendingRequest {
                request_type: request_type.to_string(),
                request_data,
            });
            return;
        }
        self.dispatch_request(request_type, request_data).await;
    }

    async fn dispatch_request(&self, request_type: &str, request_data: Option<Json>) {
        let id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let mut d = json!({ "requestType": request_type, "requestId": id.to_string() });
        if let Some(data) = request_data {
            d["requestData"] = data;
        }
        self.send_frame(json!({ "op": OP_REQUEST, "d": d })).await;
    }

    async fn drain_queue(&self) {
        loop {
            let next = self.queue.lock().await.pop_front();
            let Some(pending) = next else { break };
            self.dispatch_request(&pending.request_type, pending.request_data).await;
        }
    }

    async fn handle_hello(&self, d: &Json) {
        let mut identify = json!({
            "rpcVersion": 1,
            "eventSubscriptions": EVENT_SUBSCRIPTIONS,
        });
        if let Some(auth) = d.get("authentication") {
            let challenge = auth.get("challenge").and_then(Json::as_str).unwrap_or_default();
            let salt = auth.get("salt").and_then(Json::as_str).unwrap_or_default();
            let response = compute_auth(&self.password, salt, challenge);
            identify["authentication"] = Json::String(response);
        }
        self.send_frame(json!({ "op": OP_IDENTIFY, "d": identify })).await;
    }

    async fn handle_identified(self: &Arc<Self>) {
        self.identified.store(true, Ordering::SeqCst);
        self.events.connected();
        self.drain_queue().await;
    }

    fn handle_event(&self, d: &Json) {
        let Some(event_type) = d.get("eventType").and_then(Json::as_str) else { return };
        let data = d.get("eventData");
        match event_type {
            "CurrentProgramSceneChanged" => {
                let Some(scene) = data.and_then(|d| d.get("sceneName")).and_then(Json::as_str) else { return };
                self.state.lock().unwrap().current_scene = scene.to_string();
                self.events.feedback("scene/current", vec![Value::String(scene.to_string())]);
            }
            "StreamStateChanged" => {
                let Some(active) = data.and_then(|d| d.get("outputActive")).and_then(Json::as_bool) else { return };
                self.state.lock().unwrap().streaming = active;
                self.events.feedback("stream/status", vec![Value::Int(active as i32)]);
            }
            "RecordStateChanged" => {
                let Some(active) = data.and_then(|d| d.get("outputActive")).and_then(Json::as_bool) else { return };
                self.state.lock().unwrap().recording = active;
                self.events.feedback("record/status", vec![Value::Int(active as i32)]);
            }
            other => debug!(driver = %self.name, event = other, "streaming: unhandled event"),
        }
    }

    async fn spawn_read_loop(self: &Arc<Self>, mut read: futures_util::stream::SplitStream<WsStream>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let msg = match msg {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(driver = %this.name, error = %e, "streaming read failed");
                        this.events.disconnected();
                        break;
                    }
                };
                let WsMessage::Text(text) = msg else { continue };
                let Ok(frame): Result<Json, _> = serde_json::from_str(&text) else {
                    warn!(driver = %this.name, "streaming: undecodable frame");
                    continue;
                };
                let op = frame.get("op").and_then(Json::as_u64).unwrap_or(u64::MAX);
                let d = frame.get("d").cloned().unwrap_or(Json::Null);
                match op {
                    OP_HELLO => this.handle_hello(&d).await,
                    OP_IDENTIFIED => this.handle_identified().await,
                    OP_EVENT => this.handle_event(&d),
                    _ => {}
                }
            }
            this.identified.store(false, Ordering::SeqCst);
            this.events.disconnected();
        });
        *self.read_task.lock().await = Some(handle);
    }
}

/// Parse a relative streaming-driver address into an OBS request. Returns
/// `None` for addresses the driver silently ignores.
///
/// `address` is lowercased and drives every keyword match below; `original`
/// is the same remainder with its case intact and is the only thing used to
/// extract a scene/source/transition name, since OBS's own JSON-RPC API
/// treats those names as case-sensitive (spec §4.4, §4.8). Lowercasing never
/// changes a string's length or where its `/` separators fall, so the two
/// segment vectors stay positionally aligned.
fn parse_address(address: &str, original: &str) -> Option<(String, Option<Json>)> {
    let address = address.trim_end_matches('/');
    let original = original.trim_end_matches('/');
    let segs: Vec<&str> = address.split('/').filter(|s| !s.is_empty()).collect();
    let segs_orig: Vec<&str> = original.split('/').filter(|s| !s.is_empty()).collect();
    if segs.is_empty() {
        return None;
    }
    match segs[0] {
        "scene" if segs.len() > 1 && segs[1] == "preview" => {
            let name = decode_joined(segs_orig.get(2..).unwrap_or(&[]));
            if name.is_empty() {
                return None;
            }
            Some(("SetCurrentPreviewScene".into(), Some(json!({ "sceneName": name }))))
        }
        "scene" if segs.len() > 1 => {
            let name = decode_joined(segs_orig.get(1..).unwrap_or(&[]));
            if name.is_empty() {
                return None;
            }
            Some(("SetCurrentProgramScene".into(), Some(json!({ "sceneName": name }))))
        }
        "stream" if segs.len() > 1 => match segs[1] {
            "start" => Some(("StartStream".into(), None)),
            "stop" => Some(("StopStream".into(), None)),
            "toggle" => Some(("ToggleStream".into(), None)),
            _ => None,
        },
        "record" if segs.len() > 1 => match segs[1] {
            "start" => Some(("StartRecord".into(), None)),
            "stop" => Some(("StopRecord".into(), None)),
            "toggle" => Some(("ToggleRecord".into(), None)),
            _ => None,
        },
        "transition" if segs.get(1) == Some(&"duration") => None,
        "transition" if segs.len() > 1 => {
            let name = decode_joined(segs_orig.get(1..).unwrap_or(&[]));
            Some(("SetCurrentSceneTransition".into(), Some(json!({ "transitionName": name }))))
        }
        "virtualcam" if segs.len() > 1 => match segs[1] {
            "start" => Some(("StartVirtualCam".into(), None)),
            "stop" => Some(("StopVirtualCam".into(), None)),
            _ => None,
        },
        "source" if segs.len() > 2 && segs[segs.len() - 1] == "visible" => {
            let name = decode_joined(segs_orig.get(1..segs_orig.len() - 1).unwrap_or(&[]));
            Some(("sourceVisible".into(), Some(json!({ "sourceName": name }))))
        }
        _ => None,
    }
}

fn decode_joined(segs: &[&str]) -> String {
    segs.iter()
        .map(|s| urlencoding::decode(s).map(|c| c.into_owned()).unwrap_or_else(|_| s.to_string()))
        .collect::<Vec<_>>()
        .join("/")
}

fn parse_transition_duration(address: &str) -> bool {
    let address = address.trim_end_matches('/');
    let segs: Vec<&str> = address.split('/').filter(|s| !s.is_empty()).collect();
    segs == ["transition", "duration"]
}

#[async_trait]
impl Driver for StreamingDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn connect(&self) -> anyhow::Result<()> {
        let (ws, _response) = tokio_tungstenite::connect_async(&self.url).await?;
        let (write, read) = ws.split();
        *self.write.lock().await = Some(write);
        if let Some(this) = self.self_weak.upgrade() {
            this.spawn_read_loop(read).await;
        }
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        self.identified.store(false, Ordering::SeqCst);
        *self.write.lock().await = None;
        if let Some(handle) = self.read_task.lock().await.take() {
            handle.abort();
        }
        self.events.disconnected();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.identified.load(Ordering::SeqCst)
    }

    async fn handle_message(&self, address: &str, original: &str, args: &[Value]) {
        if parse_transition_duration(address) {
            let Some(ms) = args.first().and_then(Value::as_i64) else { return };
            self.state.lock().unwrap().transition_duration_ms = ms as u32;
            self.send_request("SetCurrentSceneTransitionDuration", Some(json!({ "transitionDuration": ms }))).await;
            return;
        }

        let Some((request_type, data)) = parse_address(address, original) else {
            return;
        };

        if request_type == "sourceVisible" {
            let Some(data) = data else { return };
            let Some(name) = data.get("sourceName").and_then(Json::as_str).map(str::to_string) else { return };
            let Some(visible) = args.first().map(Value::is_truthy) else { return };
            self.state.lock().unwrap().sources.insert(name.clone(), visible);
            self.send_request(
                "SetSceneItemEnabled",
                Some(json!({ "sourceName": name, "sceneItemEnabled": visible })),
            )
            .await;
            return;
        }

        self.send_request(&request_type, data).await;
    }

    fn events(&self) -> tokio::sync::broadcast::Receiver<DriverEvent> {
        self.events.subscribe()
    }
}
