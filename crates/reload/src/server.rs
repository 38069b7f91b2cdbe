use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use extdev_core::{
    ChangeEvent, ChangeNotice, Debouncer, Error, ExtensionReady, InstanceId, ReloadConfig,
    ReloadMessage, ReloadReason, Result, StatusMessage,
};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::dedup::LogDeduper;

/// Whether the latest build succeeded. Change dispatch waits while it
/// has errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuildStatus {
    #[default]
    Ok,
    HasErrors,
}

/// Things the server learned from its peers.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    ClientReady {
        instance_id: InstanceId,
        data: Value,
    },
    ExtensionReady {
        instance_id: InstanceId,
        ready: ExtensionReady,
    },
    Disconnected {
        instance_id: Option<InstanceId>,
    },
}

struct Peer {
    instance_id: Option<InstanceId>,
    tx: mpsc::Sender<ReloadMessage>,
}

struct ServerInner {
    peers: Mutex<HashMap<u64, Peer>>,
    next_conn: AtomicU64,
    dedup: Mutex<LogDeduper>,
    events: broadcast::Sender<ServerEvent>,
}

#[derive(Clone)]
struct ServerState {
    inner: Arc<ServerInner>,
}

pub struct ReloadServer {
    state: ServerState,
    config: ReloadConfig,
    local_addr: SocketAddr,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl ReloadServer {
    /// Bind the configured address and start serving in the background.
    pub async fn bind(config: &ReloadConfig) -> Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .map_err(|e| {
                Error::Connection(format!("cannot bind {}:{}: {}", config.host, config.port, e))
            })?;
        let local_addr = listener.local_addr()?;

        let (events, _) = broadcast::channel(256);
        let state = ServerState {
            inner: Arc::new(ServerInner {
                peers: Mutex::new(HashMap::new()),
                next_conn: AtomicU64::new(1),
                dedup: Mutex::new(LogDeduper::new(config.log_dedup_window())),
                events,
            }),
        };

        let app = Router::new()
            .route("/", get(handle_ws_upgrade))
            .route("/ws", get(handle_ws_upgrade))
            .layer(TraceLayer::new_for_http())
            .with_state(state.clone());

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .tcp_nodelay(true)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                });
            if let Err(e) = serve.await {
                error!(error = %e, "reload server stopped");
            }
        });
        info!(addr = %local_addr, "reload server listening");

        Ok(Self {
            state,
            config: config.clone(),
            local_addr,
            shutdown: Some(shutdown_tx),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.state.inner.events.subscribe()
    }

    pub async fn peer_count(&self) -> usize {
        self.state.inner.peers.lock().await.len()
    }

    pub async fn instances(&self) -> Vec<InstanceId> {
        self.state
            .inner
            .peers
            .lock()
            .await
            .values()
            .filter_map(|p| p.instance_id.clone())
            .collect()
    }

    /// Send a change notice to each registered instance, addressed to it.
    /// A notice that already names an instance only goes there. Returns
    /// the number of peers reached.
    pub async fn notify_change(&self, notice: ChangeNotice) -> usize {
        let peers = self.state.inner.peers.lock().await;
        let mut reached = 0;
        for peer in peers.values() {
            let Some(instance_id) = &peer.instance_id else {
                continue;
            };
            if let Some(target) = &notice.instance_id {
                if target != instance_id {
                    continue;
                }
            }
            let addressed = ChangeNotice {
                instance_id: Some(instance_id.clone()),
                ..notice.clone()
            };
            match peer.tx.try_send(ReloadMessage::Change(addressed)) {
                Ok(()) => reached += 1,
                Err(e) => warn!(
                    component = "reload-server",
                    instance_id = %instance_id,
                    error = %e,
                    "failed to queue change notice"
                ),
            }
        }
        info!(file = %notice.changed_file, reason = ?notice.reason, reached, "change dispatched");
        reached
    }

    /// Debounce incoming changes and dispatch them while the build is
    /// healthy. Runs until `changes` closes or `shutdown` fires.
    pub async fn run_dispatch(
        &self,
        mut changes: mpsc::Receiver<ChangeEvent>,
        mut build: watch::Receiver<BuildStatus>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut debouncer: Debouncer<(ReloadReason, String)> =
            Debouncer::new(self.config.debounce());
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("dispatch loop shutting down");
                    return;
                }
                change = changes.recv() => {
                    let Some(change) = change else { return };
                    let reason = change.reload_reason();
                    debouncer.push_with((reason, change.file), |(prev, _), (next, file)| {
                        (prev.merge(next), file)
                    });
                }
                (reason, file) = debouncer.ready() => {
                    if *build.borrow_and_update() == BuildStatus::HasErrors {
                        warn!(file = %file, "build has errors, change not dispatched");
                        continue;
                    }
                    self.notify_change(ChangeNotice {
                        changed_file: file,
                        instance_id: None,
                        reason,
                    })
                    .await;
                }
            }
        }
    }

    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ReloadServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn handle_ws_upgrade(ws: WebSocketUpgrade, State(state): State<ServerState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_peer(socket, state))
}

async fn handle_peer(socket: WebSocket, state: ServerState) {
    let conn_id = state.inner.next_conn.fetch_add(1, Ordering::SeqCst);
    let (mut ws_sender, mut ws_receiver) = socket.split();

    if ws_sender
        .send(WsMessage::Text(ReloadMessage::server_ready().to_json()))
        .await
        .is_err()
    {
        return;
    }
    debug!(conn_id, "reload peer connected");

    let (tx, mut rx) = mpsc::channel::<ReloadMessage>(64);
    state.inner.peers.lock().await.insert(
        conn_id,
        Peer {
            instance_id: None,
            tx,
        },
    );

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(WsMessage::Text(msg.to_json())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        let text = match msg {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!(conn_id, error = %e, "reload peer receive error");
                break;
            }
        };
        match ReloadMessage::parse(&text) {
            Ok(ReloadMessage::Status(status)) => handle_status(&state, conn_id, status).await,
            Ok(ReloadMessage::Change(notice)) => {
                debug!(conn_id, file = %notice.changed_file, "ignoring change notice from a client");
            }
            Err(e) => warn!(conn_id, error = %e, "bad frame from reload peer"),
        }
    }

    send_task.abort();
    let peer = state.inner.peers.lock().await.remove(&conn_id);
    let instance_id = peer.and_then(|p| p.instance_id);
    info!(conn_id, instance_id = ?instance_id, "reload peer disconnected");
    let _ = state
        .inner
        .events
        .send(ServerEvent::Disconnected { instance_id });
}

async fn handle_status(state: &ServerState, conn_id: u64, status: StatusMessage) {
    match status {
        StatusMessage::ClientReady { instance_id, data } => {
            if let Some(peer) = state.inner.peers.lock().await.get_mut(&conn_id) {
                peer.instance_id = Some(instance_id.clone());
            }
            info!(conn_id, instance_id = %instance_id, "client ready");
            let _ = state
                .inner
                .events
                .send(ServerEvent::ClientReady { instance_id, data });
        }
        StatusMessage::Log { instance_id, data } => {
            let level = data.get("level").and_then(|v| v.as_str()).unwrap_or("info");
            let message = data
                .get("message")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| data.to_string());
            let fresh = state
                .inner
                .dedup
                .lock()
                .await
                .should_emit(&[instance_id.as_str(), level, &message]);
            if fresh {
                forward_log(&instance_id, level, &message);
            }
        }
        StatusMessage::ExtensionReady { instance_id, data } => {
            info!(
                instance_id = %instance_id,
                extension_id = %data.extension_id,
                strategy = ?data.strategy,
                "extension ready"
            );
            let _ = state.inner.events.send(ServerEvent::ExtensionReady {
                instance_id,
                ready: data,
            });
        }
        StatusMessage::Ping => debug!(conn_id, "ping"),
        StatusMessage::ServerReady => debug!(conn_id, "unexpected serverReady from a client"),
    }
}

fn forward_log(instance_id: &InstanceId, level: &str, message: &str) {
    match level {
        "error" => error!(target: "extdev::client", instance_id = %instance_id, "{}", message),
        "warn" | "warning" => warn!(target: "extdev::client", instance_id = %instance_id, "{}", message),
        "debug" | "trace" => debug!(target: "extdev::client", instance_id = %instance_id, "{}", message),
        _ => info!(target: "extdev::client", instance_id = %instance_id, "{}", message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use extdev_core::ChangeKind;
    use futures::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message;

    fn test_config() -> ReloadConfig {
        ReloadConfig {
            port: 0,
            debounce_ms: 20,
            ..ReloadConfig::default()
        }
    }

    async fn next_text<S>(stream: &mut S) -> String
    where
        S: futures::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), stream.next())
                .await
                .expect("frame in time")
            {
                Some(Ok(Message::Text(text))) => return text,
                Some(Ok(_)) => continue,
                other => panic!("stream ended: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_handshake_and_addressed_fanout() {
        let server = ReloadServer::bind(&test_config()).await.unwrap();
        let mut events = server.subscribe();

        let (ws, _) = connect_async(server.ws_url()).await.unwrap();
        let (mut sink, mut stream) = ws.split();
        assert_eq!(next_text(&mut stream).await, r#"{"status":"serverReady"}"#);

        let ready = ReloadMessage::Status(StatusMessage::ClientReady {
            instance_id: InstanceId::from("inst-1"),
            data: serde_json::json!({"name": "Demo"}),
        });
        sink.send(Message::Text(ready.to_json())).await.unwrap();
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Ok(ServerEvent::ClientReady { instance_id, data })) => {
                assert_eq!(instance_id.as_str(), "inst-1");
                assert_eq!(data["name"], "Demo");
            }
            other => panic!("unexpected {:?}", other),
        }

        let reached = server
            .notify_change(ChangeNotice {
                changed_file: "content.js".to_string(),
                instance_id: None,
                reason: ReloadReason::None,
            })
            .await;
        assert_eq!(reached, 1);
        let notice = ReloadMessage::parse(&next_text(&mut stream).await).unwrap();
        assert_eq!(notice.instance_id().map(|i| i.as_str()), Some("inst-1"));

        let elsewhere = server
            .notify_change(ChangeNotice {
                changed_file: "content.js".to_string(),
                instance_id: Some(InstanceId::from("someone-else")),
                reason: ReloadReason::None,
            })
            .await;
        assert_eq!(elsewhere, 0);
    }

    #[tokio::test]
    async fn test_dispatch_debounces_and_respects_build_gate() {
        let server = Arc::new(ReloadServer::bind(&test_config()).await.unwrap());
        let mut events = server.subscribe();
        let (ws, _) = connect_async(server.ws_url()).await.unwrap();
        let (mut sink, mut stream) = ws.split();
        next_text(&mut stream).await;
        let ready = ReloadMessage::Status(StatusMessage::ClientReady {
            instance_id: InstanceId::from("inst-2"),
            data: Value::Null,
        });
        sink.send(Message::Text(ready.to_json())).await.unwrap();
        let _ = events.recv().await;

        let (change_tx, change_rx) = mpsc::channel(16);
        let (build_tx, build_rx) = watch::channel(BuildStatus::HasErrors);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let dispatcher = server.clone();
        let task = tokio::spawn(async move {
            dispatcher.run_dispatch(change_rx, build_rx, shutdown_rx).await;
        });

        // Broken build: nothing goes out.
        change_tx
            .send(ChangeEvent::new(ChangeKind::Generic, "a.js"))
            .await
            .unwrap();
        let quiet = tokio::time::timeout(Duration::from_millis(150), stream.next()).await;
        assert!(quiet.is_err());

        // Healthy build: a burst collapses into one notice with the strongest reason.
        build_tx.send(BuildStatus::Ok).unwrap();
        change_tx
            .send(ChangeEvent::new(ChangeKind::Manifest, "manifest.json"))
            .await
            .unwrap();
        change_tx
            .send(ChangeEvent::new(ChangeKind::Generic, "b.js"))
            .await
            .unwrap();
        let notice = ReloadMessage::parse(&next_text(&mut stream).await).unwrap();
        match notice {
            ReloadMessage::Change(n) => {
                assert_eq!(n.changed_file, "b.js");
                assert_eq!(n.reason, ReloadReason::Manifest);
            }
            other => panic!("unexpected {:?}", other),
        }
        let extra = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;
        assert!(extra.is_err());

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_extension_ready_and_disconnect_events() {
        let server = ReloadServer::bind(&test_config()).await.unwrap();
        let mut events = server.subscribe();
        let (ws, _) = connect_async(server.ws_url()).await.unwrap();
        let (mut sink, mut stream) = ws.split();
        next_text(&mut stream).await;

        let msg = ReloadMessage::Status(StatusMessage::ExtensionReady {
            instance_id: InstanceId::from("inst-3"),
            data: ExtensionReady {
                extension_id: "abc".to_string(),
                strategy: Some("graceful-toggle".to_string()),
            },
        });
        sink.send(Message::Text(msg.to_json())).await.unwrap();
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Ok(ServerEvent::ExtensionReady { ready, .. })) => {
                assert_eq!(ready.extension_id, "abc");
            }
            other => panic!("unexpected {:?}", other),
        }

        sink.close().await.unwrap();
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Ok(ServerEvent::Disconnected { .. })) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(server.peer_count().await, 0);
    }
}
