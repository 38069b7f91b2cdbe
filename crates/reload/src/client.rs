use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use extdev_core::{
    ConnectionEvent, ConnectionState, Debouncer, ExtensionReady, InstanceId, ReloadConfig,
    ReloadMessage, ReloadReason, Result, StatusMessage,
};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::backoff::ReconnectPolicy;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// The extensions this client reloads when the server reports a change.
#[async_trait]
pub trait DevExtensions: Send + Sync {
    /// Initial metadata sent with `clientReady`. Errors mean "not yet".
    async fn metadata(&self) -> Result<Value>;

    /// Hard-reload every dev extension; one entry per extension that came
    /// back.
    async fn reload_all(&self, reason: ReloadReason) -> Vec<ExtensionReady>;
}

/// Per-run connection context.
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub instance_id: InstanceId,
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub pending_reload_reason: ReloadReason,
    pub handshake_done: bool,
}

impl ClientSession {
    pub fn new(instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            state: ConnectionState::Connecting,
            reconnect_attempts: 0,
            pending_reload_reason: ReloadReason::None,
            handshake_done: false,
        }
    }

    fn transition(&mut self, event: ConnectionEvent) {
        match self.state.on(event) {
            Some(next) => {
                debug!(
                    instance_id = %self.instance_id,
                    from = %self.state,
                    to = %next,
                    "reload connection transition"
                );
                self.state = next;
            }
            None => debug!(
                instance_id = %self.instance_id,
                state = %self.state,
                event = ?event,
                "ignored connection event"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientExit {
    Shutdown,
    GaveUp { attempts: u32 },
}

enum ConnectionEnd {
    Closed,
    Shutdown,
}

pub struct ReloadClient {
    url: String,
    config: ReloadConfig,
    policy: ReconnectPolicy,
    extensions: Arc<dyn DevExtensions>,
    session: ClientSession,
}

impl ReloadClient {
    pub fn new(config: &ReloadConfig, url: impl Into<String>, extensions: Arc<dyn DevExtensions>) -> Self {
        Self {
            url: url.into(),
            config: config.clone(),
            policy: ReconnectPolicy::from_config(config),
            extensions,
            session: ClientSession::new(InstanceId::generate()),
        }
    }

    pub fn with_instance_id(mut self, instance_id: InstanceId) -> Self {
        self.session.instance_id = instance_id;
        self
    }

    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    /// Connect, serve, and reconnect with backoff until the budget is spent
    /// or `shutdown` fires. Giving up is a warning, not an error.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> ClientExit {
        info!(instance_id = %self.session.instance_id, url = %self.url, "reload client starting");
        loop {
            let connected = tokio::select! {
                _ = shutdown.recv() => return ClientExit::Shutdown,
                res = connect_async(self.url.as_str()) => res,
            };

            match connected {
                Ok((ws, _)) => {
                    self.session.transition(ConnectionEvent::Opened);
                    self.session.reconnect_attempts = 0;
                    self.session.handshake_done = false;
                    info!(instance_id = %self.session.instance_id, "reload channel open");
                    if let ConnectionEnd::Shutdown = self.serve(ws, &mut shutdown).await {
                        return ClientExit::Shutdown;
                    }
                    info!(instance_id = %self.session.instance_id, "reload channel closed");
                }
                Err(e) => {
                    debug!(url = %self.url, error = %e, "reload channel connect failed");
                }
            }
            self.session.transition(ConnectionEvent::Closed);

            let Some((attempt, delay)) = self.policy.next(self.session.reconnect_attempts) else {
                warn!(
                    instance_id = %self.session.instance_id,
                    attempts = self.session.reconnect_attempts,
                    "giving up on reload channel"
                );
                return ClientExit::GaveUp {
                    attempts: self.session.reconnect_attempts,
                };
            };
            self.session.reconnect_attempts = attempt;
            info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting reload channel");

            tokio::select! {
                _ = shutdown.recv() => return ClientExit::Shutdown,
                _ = tokio::time::sleep(delay) => {}
            }
            self.session.transition(ConnectionEvent::Retry);
        }
    }

    async fn serve(&mut self, ws: WsStream, shutdown: &mut broadcast::Receiver<()>) -> ConnectionEnd {
        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<ReloadMessage>(64);

        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(msg.to_json())).await {
                    warn!(
                        component = "reload-client",
                        extension_id = extension_id_of(&msg),
                        error = %e,
                        "failed to send reload message"
                    );
                    break;
                }
            }
        });

        let instance_id = self.session.instance_id.clone();
        queue(&out_tx, ReloadMessage::log(&instance_id, "debug", "reload client connected"));

        let mut keepalive = tokio::time::interval_at(
            Instant::now() + self.config.keepalive_interval(),
            self.config.keepalive_interval(),
        );
        let mut debouncer: Debouncer<String> = Debouncer::new(self.config.debounce());
        let mut handshake: Option<JoinHandle<Option<Value>>> = None;
        let mut reloading: Option<JoinHandle<Vec<ExtensionReady>>> = None;

        let end = loop {
            tokio::select! {
                _ = shutdown.recv() => break ConnectionEnd::Shutdown,
                _ = keepalive.tick() => {
                    queue(&out_tx, ReloadMessage::ping());
                }
                frame = stream.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => break ConnectionEnd::Closed,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            debug!(error = %e, "reload channel receive error");
                            break ConnectionEnd::Closed;
                        }
                    };
                    let msg = match ReloadMessage::parse(&text) {
                        Ok(msg) => msg,
                        Err(e) => {
                            warn!(error = %e, "ignoring reload frame");
                            continue;
                        }
                    };
                    if !msg.is_addressed_to(&instance_id) {
                        debug!(target_instance = ?msg.instance_id(), "frame for another instance");
                        continue;
                    }
                    match msg {
                        ReloadMessage::Status(StatusMessage::ServerReady) => {
                            if let Some(old) = handshake.take() {
                                old.abort();
                            }
                            handshake = Some(tokio::spawn(poll_metadata(
                                self.extensions.clone(),
                                self.config.handshake_poll_interval(),
                                self.config.handshake_timeout(),
                            )));
                        }
                        ReloadMessage::Change(notice) => {
                            self.session.pending_reload_reason =
                                self.session.pending_reload_reason.merge(notice.reason);
                            debug!(file = %notice.changed_file, "change notice");
                            debouncer.push(notice.changed_file);
                        }
                        ReloadMessage::Status(other) => {
                            debug!(message = ?other, "unhandled status message");
                        }
                    }
                }
                res = join_pending(&mut handshake), if handshake.is_some() => {
                    handshake = None;
                    match res {
                        Some(Some(data)) => {
                            self.session.handshake_done = true;
                            info!(instance_id = %instance_id, "client ready");
                            queue(&out_tx, ReloadMessage::Status(StatusMessage::ClientReady {
                                instance_id: instance_id.clone(),
                                data,
                            }));
                        }
                        Some(None) | None => {
                            warn!(instance_id = %instance_id, "client-ready handshake timed out")
                        }
                    }
                }
                file = debouncer.ready(), if reloading.is_none() => {
                    let reason = std::mem::take(&mut self.session.pending_reload_reason);
                    info!(file = %file, reason = ?reason, "reloading dev extensions");
                    let extensions = self.extensions.clone();
                    let readiness_delay = self.config.readiness_delay();
                    reloading = Some(tokio::spawn(async move {
                        let ready = extensions.reload_all(reason).await;
                        tokio::time::sleep(readiness_delay).await;
                        ready
                    }));
                }
                res = join_pending(&mut reloading), if reloading.is_some() => {
                    reloading = None;
                    for ready in res.unwrap_or_default() {
                        queue(&out_tx, ReloadMessage::Status(StatusMessage::ExtensionReady {
                            instance_id: instance_id.clone(),
                            data: ready,
                        }));
                    }
                }
            }
        };

        if let Some(task) = handshake {
            task.abort();
        }
        if let Some(task) = reloading {
            task.abort();
        }
        drop(out_tx);
        writer.abort();
        end
    }
}

fn extension_id_of(msg: &ReloadMessage) -> &str {
    match msg {
        ReloadMessage::Status(StatusMessage::ExtensionReady { data, .. }) => &data.extension_id,
        _ => "-",
    }
}

fn queue(tx: &mpsc::Sender<ReloadMessage>, msg: ReloadMessage) {
    if let Err(e) = tx.try_send(msg) {
        warn!(
            component = "reload-client",
            extension_id = "-",
            error = %e,
            "failed to queue reload message"
        );
    }
}

/// Await a spawned task if there is one; `None` for a panicked or aborted
/// task. Only polled while the slot is filled.
async fn join_pending<T>(slot: &mut Option<JoinHandle<T>>) -> Option<T> {
    match slot.as_mut() {
        Some(handle) => handle.await.ok(),
        None => std::future::pending().await,
    }
}

async fn poll_metadata(
    extensions: Arc<dyn DevExtensions>,
    interval: Duration,
    timeout: Duration,
) -> Option<Value> {
    let deadline = Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, extensions.metadata()).await {
            Ok(Ok(data)) => return Some(data),
            Ok(Err(e)) => debug!(error = %e, "extension metadata not ready"),
            Err(_) => return None,
        }
        if Instant::now() + interval > deadline {
            return None;
        }
        tokio::time::sleep(interval).await;
    }
}
