use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use extdev_core::{Error, Result};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const EVENT_BUFFER: usize = 256;

/// An event pushed by the browser.
#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

/// A classified inbound frame.
#[derive(Debug, Clone)]
pub enum Frame {
    Response {
        id: u64,
        outcome: std::result::Result<Value, Value>,
    },
    Event(CdpEvent),
}

impl Frame {
    pub fn parse(text: &str) -> Result<Frame> {
        let json: Value = serde_json::from_str(text)
            .map_err(|e| Error::Protocol(format!("frame is not JSON: {}", e)))?;

        if let Some(id_value) = json.get("id") {
            let id = id_value
                .as_u64()
                .ok_or_else(|| Error::Protocol(format!("non-numeric response id: {}", id_value)))?;
            let outcome = match json.get("error") {
                Some(err) => Err(err.clone()),
                None => Ok(json.get("result").cloned().unwrap_or(Value::Null)),
            };
            return Ok(Frame::Response { id, outcome });
        }

        if let Some(method) = json.get("method").and_then(|v| v.as_str()) {
            return Ok(Frame::Event(CdpEvent {
                method: method.to_string(),
                params: json.get("params").cloned().unwrap_or(Value::Null),
                session_id: json
                    .get("sessionId")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
            }));
        }

        Err(Error::Protocol(
            "frame is neither a response nor an event".to_string(),
        ))
    }
}

#[derive(Debug, Serialize)]
struct Command<'a> {
    id: u64,
    method: &'a str,
    params: Value,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
}

#[derive(Default)]
struct PendingTable {
    entries: HashMap<u64, oneshot::Sender<Result<Value>>>,
    /// Set once the socket is gone; new commands fail fast.
    closed: Option<String>,
}

struct Listener {
    method: Option<String>,
    tx: mpsc::Sender<CdpEvent>,
}

#[derive(Default)]
struct Shared {
    pending: Mutex<PendingTable>,
    listeners: Mutex<Vec<Listener>>,
}

impl Shared {
    async fn dispatch(&self, text: &str) {
        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping malformed frame");
                return;
            }
        };

        match frame {
            Frame::Response { id, outcome } => {
                let sender = self.pending.lock().await.entries.remove(&id);
                match sender {
                    Some(tx) => {
                        let _ = tx.send(outcome.map_err(Error::remote));
                    }
                    None => debug!(id, "response for unknown command id"),
                }
            }
            Frame::Event(event) => {
                let mut listeners = self.listeners.lock().await;
                listeners.retain(|l| !l.tx.is_closed());
                for listener in listeners.iter() {
                    let wanted = match &listener.method {
                        Some(m) => *m == event.method,
                        None => true,
                    };
                    if wanted && listener.tx.try_send(event.clone()).is_err() {
                        debug!(method = %event.method, "event listener full, dropping event");
                    }
                }
            }
        }
    }

    async fn reject_all(&self, reason: &str) {
        let mut table = self.pending.lock().await;
        table.closed = Some(reason.to_string());
        for (_, tx) in table.entries.drain() {
            let _ = tx.send(Err(Error::ConnectionClosed(reason.to_string())));
        }
    }
}

/// Command/response correlator over a pair of text-frame channels.
pub struct WireClient {
    next_id: AtomicU64,
    outgoing: mpsc::Sender<String>,
    shared: Arc<Shared>,
    default_timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl WireClient {
    /// Build a client from raw frame channels. `incoming` ending is treated
    /// as the socket closing.
    pub fn from_channels(
        outgoing: mpsc::Sender<String>,
        mut incoming: mpsc::Receiver<String>,
        default_timeout: Duration,
    ) -> Self {
        let shared = Arc::new(Shared::default());
        let reader_shared = shared.clone();
        let reader = tokio::spawn(async move {
            while let Some(text) = incoming.recv().await {
                reader_shared.dispatch(&text).await;
            }
            debug!("wire input closed, rejecting pending commands");
            reader_shared.reject_all("socket closed").await;
        });

        Self {
            next_id: AtomicU64::new(1),
            outgoing,
            shared,
            default_timeout,
            tasks: vec![reader],
        }
    }

    /// Connect to a WebSocket endpoint and run the reader/writer tasks.
    pub async fn connect(ws_url: &str, default_timeout: Duration) -> Result<Self> {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::connect_async;
        use tokio_tungstenite::tungstenite::Message;

        let (ws_stream, _) = connect_async(ws_url)
            .await
            .map_err(|e| Error::Connection(format!("failed to connect to {}: {}", ws_url, e)))?;
        let (mut ws_sink, mut ws_read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        let (in_tx, in_rx) = mpsc::channel::<String>(1024);

        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = ws_sink.send(Message::Text(msg)).await {
                    warn!(error = %e, "wire write failed");
                    break;
                }
            }
            let _ = ws_sink.close().await;
        });

        let pump = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Binary(bytes)) => {
                        if let Ok(text) = String::from_utf8(bytes) {
                            if in_tx.send(text).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("wire socket closed by peer");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "wire read failed");
                        break;
                    }
                    _ => {}
                }
            }
        });

        let mut client = Self::from_channels(out_tx, in_rx, default_timeout);
        client.tasks.push(writer);
        client.tasks.push(pump);
        Ok(client)
    }

    pub async fn send(&self, method: &str, params: Value, session_id: Option<&str>) -> Result<Value> {
        self.send_with_timeout(method, params, session_id, self.default_timeout)
            .await
    }

    pub async fn send_with_timeout(
        &self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
        timeout: Duration,
    ) -> Result<Value> {
        // Register before sending so a fast reply cannot race the insert.
        let (id, rx) = {
            let mut table = self.shared.pending.lock().await;
            if let Some(reason) = &table.closed {
                return Err(Error::ConnectionClosed(reason.clone()));
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = oneshot::channel();
            table.entries.insert(id, tx);
            (id, rx)
        };

        let frame = serde_json::to_string(&Command {
            id,
            method,
            params,
            session_id,
        })?;
        debug!(id, method, session_id = ?session_id, "sending command");

        if self.outgoing.send(frame).await.is_err() {
            self.shared.pending.lock().await.entries.remove(&id);
            return Err(Error::ConnectionClosed(format!(
                "socket gone before '{}' was sent",
                method
            )));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::ConnectionClosed(format!(
                "'{}' was dropped without a response",
                method
            ))),
            Err(_) => {
                self.shared.pending.lock().await.entries.remove(&id);
                Err(Error::Timeout(format!(
                    "'{}' timed out after {:?}",
                    method, timeout
                )))
            }
        }
    }

    /// Subscribe to events. `None` receives every event.
    pub async fn subscribe(&self, method: Option<&str>) -> mpsc::Receiver<CdpEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        self.shared.listeners.lock().await.push(Listener {
            method: method.map(|m| m.to_string()),
            tx,
        });
        rx
    }

    pub async fn pending_count(&self) -> usize {
        self.shared.pending.lock().await.entries.len()
    }

    pub async fn is_closed(&self) -> bool {
        self.shared.pending.lock().await.closed.is_some()
    }
}

impl Drop for WireClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// A wire client plus the far ends of its channels.
    pub(crate) struct Harness {
        pub client: WireClient,
        pub sent: mpsc::Receiver<String>,
        pub inbound: mpsc::Sender<String>,
    }

    pub(crate) fn harness() -> Harness {
        let (out_tx, out_rx) = mpsc::channel(64);
        let (in_tx, in_rx) = mpsc::channel(64);
        Harness {
            client: WireClient::from_channels(out_tx, in_rx, Duration::from_secs(5)),
            sent: out_rx,
            inbound: in_tx,
        }
    }

    /// Answer every command with `reply(method, params)` until the client
    /// goes away.
    pub(crate) fn spawn_responder<F>(
        sent: mpsc::Receiver<String>,
        inbound: mpsc::Sender<String>,
        reply: F,
    ) -> JoinHandle<()>
    where
        F: Fn(&str, &Value) -> Value + Send + 'static,
    {
        spawn_partial_responder(sent, inbound, move |method, params| Some(reply(method, params)))
    }

    /// Like `spawn_responder`, but commands answered with `None` never get
    /// a response.
    pub(crate) fn spawn_partial_responder<F>(
        mut sent: mpsc::Receiver<String>,
        inbound: mpsc::Sender<String>,
        reply: F,
    ) -> JoinHandle<()>
    where
        F: Fn(&str, &Value) -> Option<Value> + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(text) = sent.recv().await {
                let frame: Value = serde_json::from_str(&text).unwrap();
                let method = frame["method"].as_str().unwrap_or_default().to_string();
                let Some(result) = reply(&method, &frame["params"]) else {
                    continue;
                };
                let response = json!({"id": frame["id"], "result": result});
                if inbound.send(response.to_string()).await.is_err() {
                    break;
                }
            }
        })
    }

    #[test]
    fn test_frame_parse_response_and_event() {
        match Frame::parse(r#"{"id":3,"result":{"ok":true}}"#).unwrap() {
            Frame::Response { id, outcome } => {
                assert_eq!(id, 3);
                assert_eq!(outcome.unwrap()["ok"], true);
            }
            other => panic!("unexpected {:?}", other),
        }
        match Frame::parse(r#"{"id":4,"error":{"code":-32000,"message":"nope"}}"#).unwrap() {
            Frame::Response { outcome, .. } => assert_eq!(outcome.unwrap_err()["message"], "nope"),
            other => panic!("unexpected {:?}", other),
        }
        match Frame::parse(r#"{"method":"Page.loadEventFired","params":{},"sessionId":"s1"}"#)
            .unwrap()
        {
            Frame::Event(ev) => {
                assert_eq!(ev.method, "Page.loadEventFired");
                assert_eq!(ev.session_id.as_deref(), Some("s1"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(Frame::parse("{}"), Err(Error::Protocol(_))));
        assert!(matches!(Frame::parse("nope"), Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_concurrent_commands_out_of_order_responses() {
        let Harness {
            client,
            mut sent,
            inbound,
        } = harness();

        let responder = tokio::spawn(async move {
            let mut ids = Vec::new();
            for _ in 0..3 {
                let frame: Value = serde_json::from_str(&sent.recv().await.unwrap()).unwrap();
                ids.push((frame["id"].as_u64().unwrap(), frame["method"].as_str().unwrap().to_string()));
            }
            for (id, method) in ids.iter().rev() {
                let reply = json!({"id": id, "result": {"echo": method}});
                inbound.send(reply.to_string()).await.unwrap();
            }
            ids
        });

        let (a, b, c) = tokio::join!(
            client.send("A.one", json!({}), None),
            client.send("B.two", json!({}), None),
            client.send("C.three", json!({}), Some("sess")),
        );
        assert_eq!(a.unwrap()["echo"], "A.one");
        assert_eq!(b.unwrap()["echo"], "B.two");
        assert_eq!(c.unwrap()["echo"], "C.three");

        let ids = responder.await.unwrap();
        let numbers: Vec<u64> = ids.iter().map(|(id, _)| *id).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(client.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_session_id_only_when_present() {
        let mut h = harness();
        let client = h.client;
        let task = tokio::spawn(async move {
            let _ = client.send("Runtime.evaluate", json!({"expression": "1"}), Some("abc")).await;
        });
        let frame: Value = serde_json::from_str(&h.sent.recv().await.unwrap()).unwrap();
        assert_eq!(frame["sessionId"], "abc");
        assert_eq!(frame["params"]["expression"], "1");
        task.abort();
    }

    #[tokio::test]
    async fn test_peer_error_is_surfaced_verbatim() {
        let Harness {
            client,
            mut sent,
            inbound,
        } = harness();
        tokio::spawn(async move {
            let frame: Value = serde_json::from_str(&sent.recv().await.unwrap()).unwrap();
            let reply = json!({
                "id": frame["id"],
                "error": {"code": -32601, "message": "'Extensions.reload' wasn't found"}
            });
            inbound.send(reply.to_string()).await.unwrap();
            // Keep the channel open until the test finishes.
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let err = client.send("Extensions.reload", json!({}), None).await.unwrap_err();
        match &err {
            Error::Remote { code, data, .. } => {
                assert_eq!(*code, -32601);
                assert_eq!(data["message"], "'Extensions.reload' wasn't found");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(err.is_method_not_found());
    }

    #[tokio::test]
    async fn test_close_rejects_all_pending() {
        let Harness {
            client,
            mut sent,
            inbound,
        } = harness();
        let client = Arc::new(client);

        let mut calls = Vec::new();
        for i in 0..4 {
            let c = client.clone();
            calls.push(tokio::spawn(async move {
                c.send(&format!("Cmd.n{}", i), json!({}), None).await
            }));
        }
        for _ in 0..4 {
            sent.recv().await.unwrap();
        }
        assert_eq!(client.pending_count().await, 4);

        drop(inbound);
        for call in calls {
            let result = call.await.unwrap();
            assert!(matches!(result, Err(Error::ConnectionClosed(_))));
        }
        assert_eq!(client.pending_count().await, 0);
        assert!(client.is_closed().await);

        let late = client.send("After.close", json!({}), None).await;
        assert!(matches!(late, Err(Error::ConnectionClosed(_))));
    }

    #[tokio::test]
    async fn test_unknown_id_is_ignored_and_events_are_delivered() {
        let Harness {
            client,
            sent: _sent,
            inbound,
        } = harness();
        let mut loads = client.subscribe(Some("Page.loadEventFired")).await;
        let mut all = client.subscribe(None).await;

        inbound.send(json!({"id": 999, "result": {}}).to_string()).await.unwrap();
        inbound
            .send(json!({"method": "Log.entryAdded", "params": {"entry": {}}}).to_string())
            .await
            .unwrap();
        inbound
            .send(json!({"method": "Page.loadEventFired", "params": {"timestamp": 1.5}}).to_string())
            .await
            .unwrap();

        let ev = loads.recv().await.unwrap();
        assert_eq!(ev.params["timestamp"], 1.5);
        assert_eq!(all.recv().await.unwrap().method, "Log.entryAdded");
        assert_eq!(all.recv().await.unwrap().method, "Page.loadEventFired");
        assert!(!client.is_closed().await);
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_entry() {
        let (out_tx, _out_rx) = mpsc::channel(8);
        let (_in_tx, in_rx) = mpsc::channel::<String>(8);
        let client = WireClient::from_channels(out_tx, in_rx, Duration::from_millis(20));
        let err = client.send("Slow.call", json!({}), None).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(client.pending_count().await, 0);
    }
}
