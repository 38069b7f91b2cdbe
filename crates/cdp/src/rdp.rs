//! Firefox remote debugging protocol client.
//!
//! Packets are `<byte length>:<json>` over TCP. Requests are addressed to
//! an actor (`to`) and every actor answers its requests in order, so replies
//! are matched with a FIFO queue per actor. Packets carrying a known event
//! `type` are broadcast to subscribers instead.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use extdev_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::{debug, info, warn};

use crate::reload::ReloadStrategy;

/// Longest length prefix accepted before the colon.
const MAX_HEADER: usize = 20;
const DEFAULT_MAX_PACKET: usize = 64 * 1024 * 1024;

/// Unsolicited packet types. Anything else is treated as a reply.
const EVENT_TYPES: &[&str] = &[
    "tabNavigated",
    "tabListChanged",
    "addonListChanged",
    "evaluationResult",
    "consoleAPICall",
    "pageError",
    "logMessage",
    "frameUpdate",
    "newSource",
    "workerListChanged",
    "resources-available-array",
];

// ─── Codec ────────────────────────────────────────────────────────────

pub struct RdpCodec {
    max_packet: usize,
}

impl Default for RdpCodec {
    fn default() -> Self {
        Self {
            max_packet: DEFAULT_MAX_PACKET,
        }
    }
}

impl Decoder for RdpCodec {
    type Item = Value;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>> {
        let colon = match src.iter().take(MAX_HEADER).position(|b| *b == b':') {
            Some(pos) => pos,
            None if src.len() >= MAX_HEADER => {
                return Err(Error::Protocol("packet has no length prefix".to_string()))
            }
            None => return Ok(None),
        };

        let header = std::str::from_utf8(&src[..colon])
            .map_err(|_| Error::Protocol("length prefix is not UTF-8".to_string()))?;
        if header.starts_with("bulk") {
            return Err(Error::Protocol("bulk packets are not supported".to_string()));
        }
        let len: usize = header
            .trim()
            .parse()
            .map_err(|_| Error::Protocol(format!("bad length prefix '{}'", header)))?;
        if len > self.max_packet {
            return Err(Error::Protocol(format!("packet of {} bytes is too large", len)));
        }

        let total = colon + 1 + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        src.advance(colon + 1);
        let body = src.split_to(len);
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| Error::Protocol(format!("packet body is not JSON: {}", e)))
    }
}

impl Encoder<Value> for RdpCodec {
    type Error = Error;

    fn encode(&mut self, item: Value, dst: &mut BytesMut) -> Result<()> {
        let body = serde_json::to_vec(&item)?;
        let header = format!("{}:", body.len());
        dst.reserve(header.len() + body.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(&body);
        Ok(())
    }
}

// ─── Client ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RdpEvent {
    pub from: String,
    pub packet: Value,
}

fn packet_error(packet: &Value) -> Error {
    let kind = packet.get("error").and_then(|v| v.as_str()).unwrap_or("error");
    let message = packet.get("message").and_then(|v| v.as_str()).unwrap_or("");
    Error::Remote {
        code: 0,
        message: if message.is_empty() {
            kind.to_string()
        } else {
            format!("{}: {}", kind, message)
        },
        data: packet.clone(),
    }
}

#[derive(Default)]
struct ActorQueues {
    queues: HashMap<String, VecDeque<oneshot::Sender<Result<Value>>>>,
    closed: Option<String>,
}

struct RdpShared {
    pending: Mutex<ActorQueues>,
    events: broadcast::Sender<RdpEvent>,
}

impl RdpShared {
    async fn dispatch(&self, packet: Value) {
        let from = packet
            .get("from")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let kind = packet.get("type").and_then(|v| v.as_str());
        let is_event = kind.map_or(false, |k| EVENT_TYPES.contains(&k));

        if !is_event {
            let waiter = self
                .pending
                .lock()
                .await
                .queues
                .get_mut(&from)
                .and_then(|q| q.pop_front());
            if let Some(tx) = waiter {
                let outcome = if packet.get("error").is_some() {
                    Err(packet_error(&packet))
                } else {
                    Ok(packet)
                };
                let _ = tx.send(outcome);
                return;
            }
            if kind.is_none() {
                debug!(from = %from, "reply with no waiting request");
                return;
            }
        }

        let _ = self.events.send(RdpEvent { from, packet });
    }

    async fn reject_all(&self, reason: &str) {
        let mut pending = self.pending.lock().await;
        pending.closed = Some(reason.to_string());
        for (_, queue) in pending.queues.drain() {
            for tx in queue {
                let _ = tx.send(Err(Error::ConnectionClosed(reason.to_string())));
            }
        }
    }
}

pub struct RdpClient {
    outgoing: mpsc::Sender<Value>,
    shared: Arc<RdpShared>,
    timeout: Duration,
    greeting: Value,
    tasks: Vec<JoinHandle<()>>,
}

impl RdpClient {
    /// Connect and read the root actor's greeting.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        use futures::{SinkExt, StreamExt};

        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| Error::Connection(format!("{}:{} unreachable: {}", host, port, e)))?;
        let mut framed = Framed::new(stream, RdpCodec::default());
        let greeting = match tokio::time::timeout(timeout, framed.next()).await {
            Ok(Some(Ok(packet))) => packet,
            Ok(Some(Err(e))) => return Err(e),
            Ok(None) => return Err(Error::ConnectionClosed("closed before greeting".to_string())),
            Err(_) => return Err(Error::Timeout("no greeting from root actor".to_string())),
        };
        info!(
            host,
            port,
            application = greeting.get("applicationType").and_then(|v| v.as_str()).unwrap_or("?"),
            "connected to remote debugging server"
        );

        let (mut sink, mut stream) = framed.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Value>(256);
        let (in_tx, in_rx) = mpsc::channel::<Value>(1024);

        let writer = tokio::spawn(async move {
            while let Some(packet) = out_rx.recv().await {
                if let Err(e) = sink.send(packet).await {
                    warn!(error = %e, "debugger write failed");
                    break;
                }
            }
        });
        let pump = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(packet) => {
                        if in_tx.send(packet).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "debugger read failed");
                        break;
                    }
                }
            }
        });

        let mut client = Self::from_channels(out_tx, in_rx, greeting, timeout);
        client.tasks.push(writer);
        client.tasks.push(pump);
        Ok(client)
    }

    pub fn from_channels(
        outgoing: mpsc::Sender<Value>,
        mut incoming: mpsc::Receiver<Value>,
        greeting: Value,
        timeout: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let shared = Arc::new(RdpShared {
            pending: Mutex::new(ActorQueues::default()),
            events,
        });
        let reader_shared = shared.clone();
        let reader = tokio::spawn(async move {
            while let Some(packet) = incoming.recv().await {
                reader_shared.dispatch(packet).await;
            }
            reader_shared.reject_all("debugger connection closed").await;
        });
        Self {
            outgoing,
            shared,
            timeout,
            greeting,
            tasks: vec![reader],
        }
    }

    pub fn greeting(&self) -> &Value {
        &self.greeting
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RdpEvent> {
        self.shared.events.subscribe()
    }

    /// Send `{to, type, ..extra}` and wait for the actor's reply.
    pub async fn request(&self, to: &str, kind: &str, extra: Value) -> Result<Value> {
        let mut packet = match extra {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        packet.insert("to".to_string(), Value::String(to.to_string()));
        packet.insert("type".to_string(), Value::String(kind.to_string()));

        let rx = {
            let mut pending = self.shared.pending.lock().await;
            if let Some(reason) = &pending.closed {
                return Err(Error::ConnectionClosed(reason.clone()));
            }
            let (tx, rx) = oneshot::channel();
            pending.queues.entry(to.to_string()).or_default().push_back(tx);
            rx
        };

        debug!(to, kind, "sending debugger request");
        self.outgoing
            .send(Value::Object(packet))
            .await
            .map_err(|_| Error::ConnectionClosed(format!("'{}' not sent", kind)))?;

        // A timed-out waiter stays queued so later replies keep their order.
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::ConnectionClosed(format!("'{}' dropped", kind))),
            Err(_) => Err(Error::Timeout(format!("{} -> {} timed out", kind, to))),
        }
    }

    // ─── Root actor ───────────────────────────────────────────────────

    pub async fn list_addons(&self) -> Result<Vec<AddonInfo>> {
        let reply = self.request("root", "listAddons", json!({})).await?;
        let addons = reply.get("addons").cloned().unwrap_or(json!([]));
        serde_json::from_value(addons).map_err(|e| Error::Protocol(format!("bad addon list: {}", e)))
    }

    pub async fn list_tabs(&self) -> Result<Vec<TabInfo>> {
        let reply = self.request("root", "listTabs", json!({})).await?;
        let tabs = reply.get("tabs").cloned().unwrap_or(json!([]));
        serde_json::from_value(tabs).map_err(|e| Error::Protocol(format!("bad tab list: {}", e)))
    }

    pub async fn addons_actor(&self) -> Result<String> {
        let reply = self.request("root", "getRoot", json!({})).await?;
        reply
            .get("addonsActor")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| Error::Protocol("root has no addonsActor".to_string()))
    }

    pub async fn install_temporary_addon(&self, path: &str) -> Result<String> {
        let actor = self.addons_actor().await?;
        let reply = self
            .request(&actor, "installTemporaryAddon", json!({"addonPath": path}))
            .await?;
        let id = reply
            .pointer("/addon/id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| Error::Protocol("install reply has no addon id".to_string()))?;
        info!(path, addon_id = %id, "installed temporary add-on");
        Ok(id)
    }

    pub async fn reload_addon(&self, addon_actor: &str) -> Result<()> {
        self.request(addon_actor, "reload", json!({})).await?;
        Ok(())
    }

    /// Resolve a tab descriptor to its target actors.
    pub async fn tab_target(&self, descriptor_actor: &str) -> Result<TabTarget> {
        let reply = self.request(descriptor_actor, "getTarget", json!({})).await?;
        let frame = reply.get("frame").cloned().unwrap_or(reply);
        serde_json::from_value(frame).map_err(|e| Error::Protocol(format!("bad tab target: {}", e)))
    }

    pub async fn start_listeners(&self, console_actor: &str, listeners: &[&str]) -> Result<()> {
        self.request(console_actor, "startListeners", json!({"listeners": listeners}))
            .await?;
        Ok(())
    }

    /// Evaluate in the tab's console and return the result as plain JSON.
    /// Long strings are fetched in full.
    pub async fn evaluate(&self, console_actor: &str, text: &str) -> Result<Value> {
        let mut events = self.subscribe();
        let reply = self
            .request(console_actor, "evaluateJSAsync", json!({"text": text}))
            .await?;
        let result_id = reply
            .get("resultID")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| Error::Protocol("evaluateJSAsync reply has no resultID".to_string()))?;

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(ev) => {
                        let p = &ev.packet;
                        if ev.from == console_actor
                            && p.get("type").and_then(|v| v.as_str()) == Some("evaluationResult")
                            && p.get("resultID").and_then(|v| v.as_str()) == Some(result_id.as_str())
                        {
                            return Ok(ev.packet);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(Error::ConnectionClosed("event stream ended".to_string()))
                    }
                }
            }
        };
        let packet = tokio::time::timeout(self.timeout, wait)
            .await
            .map_err(|_| Error::Timeout(format!("no evaluationResult for {}", result_id)))??;

        if let Some(exception) = packet.get("exceptionMessage") {
            let text = match self.resolve_grip(exception.clone()).await? {
                Value::String(s) => s,
                other => other.to_string(),
            };
            return Err(Error::JsException(text));
        }
        self.resolve_grip(packet.get("result").cloned().unwrap_or(Value::Null))
            .await
    }

    async fn resolve_grip(&self, grip: Value) -> Result<Value> {
        match grip.get("type").and_then(|v| v.as_str()) {
            Some("longString") => {
                let actor = grip
                    .get("actor")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| Error::Protocol("longString grip has no actor".to_string()))?;
                let length = grip.get("length").and_then(|v| v.as_u64()).unwrap_or(0);
                let reply = self
                    .request(actor, "substring", json!({"start": 0, "end": length}))
                    .await?;
                Ok(reply.get("substring").cloned().unwrap_or(Value::Null))
            }
            Some("undefined") | Some("null") => Ok(Value::Null),
            _ => Ok(grip),
        }
    }
}

impl Drop for RdpClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddonInfo {
    pub actor: String,
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub temporarily_installed: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TabInfo {
    pub actor: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub selected: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabTarget {
    pub actor: String,
    pub console_actor: String,
    #[serde(default)]
    pub url: String,
}

// ─── Add-on reload strategies ─────────────────────────────────────────

/// Add-on state shared by the Firefox reload strategies.
pub struct FirefoxAddons {
    pub client: RdpClient,
    install_paths: Mutex<HashMap<String, String>>,
}

impl FirefoxAddons {
    pub fn new(client: RdpClient) -> Self {
        Self {
            client,
            install_paths: Mutex::new(HashMap::new()),
        }
    }

    pub async fn remember_path(&self, addon_id: &str, path: &str) {
        self.install_paths
            .lock()
            .await
            .insert(addon_id.to_string(), path.to_string());
    }

    pub async fn find(&self, addon_id: &str) -> Result<AddonInfo> {
        self.client
            .list_addons()
            .await?
            .into_iter()
            .find(|a| a.id == addon_id)
            .ok_or_else(|| Error::NotFound(format!("add-on {} is not installed", addon_id)))
    }
}

/// Ask the add-on actor to reload itself.
pub struct AddonReload;

#[async_trait]
impl ReloadStrategy<FirefoxAddons> for AddonReload {
    fn name(&self) -> &'static str {
        "addon-reload"
    }

    async fn run(&self, addons: &FirefoxAddons, addon_id: &str) -> Result<()> {
        let addon = addons.find(addon_id).await?;
        addons.client.reload_addon(&addon.actor).await
    }
}

/// Install the add-on again from the directory it was loaded from.
pub struct TemporaryReinstall;

#[async_trait]
impl ReloadStrategy<FirefoxAddons> for TemporaryReinstall {
    fn name(&self) -> &'static str {
        "temporary-reinstall"
    }

    async fn run(&self, addons: &FirefoxAddons, addon_id: &str) -> Result<()> {
        let path = addons
            .install_paths
            .lock()
            .await
            .get(addon_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no install path known for {}", addon_id)))?;
        let reinstalled = addons.client.install_temporary_addon(&path).await?;
        if reinstalled != addon_id {
            return Err(Error::ReloadFailed(format!(
                "reinstall produced add-on {} instead of {}",
                reinstalled, addon_id
            )));
        }
        Ok(())
    }
}
