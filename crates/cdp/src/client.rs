use std::collections::HashMap;

use extdev_core::{BrowserConfig, Error, ReloadConfig, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::wire::{CdpEvent, WireClient};

/// One entry of `Target.getTargets`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub target_id: String,
    #[serde(rename = "type")]
    pub target_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub attached: bool,
}

impl TargetInfo {
    pub fn is_page(&self) -> bool {
        self.target_type == "page"
    }

    /// Background pages and workers are where extension code runs.
    pub fn is_worker_like(&self) -> bool {
        matches!(
            self.target_type.as_str(),
            "service_worker" | "background_page" | "worker" | "shared_worker"
        )
    }

    pub fn extension_id(&self) -> Option<&str> {
        extension_id_from_url(&self.url)
    }

    /// Lower is better when choosing where to evaluate extension code.
    pub(crate) fn extension_preference(&self) -> u8 {
        match self.target_type.as_str() {
            "background_page" => 0,
            "service_worker" => 1,
            "worker" | "shared_worker" => 2,
            "page" => 3,
            _ => 4,
        }
    }
}

/// Pull the extension id out of `chrome-extension://<id>/...` style URLs.
pub fn extension_id_from_url(url: &str) -> Option<&str> {
    let (scheme, rest) = url.split_once("://")?;
    if !scheme.ends_with("extension") {
        return None;
    }
    let id = rest.split(['/', '?', '#']).next()?;
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

/// Ask the browser's HTTP endpoint for the browser-level WebSocket URL.
pub async fn discover_ws_url(config: &BrowserConfig) -> Result<String> {
    let url = format!("{}/json/version", config.cdp_http_url());
    let client = reqwest::Client::builder()
        .timeout(config.command_timeout())
        .build()
        .map_err(|e| Error::Connection(format!("http client: {}", e)))?;
    let body: Value = client
        .get(&url)
        .send()
        .await
        .map_err(|e| Error::Connection(format!("{} unreachable: {}", url, e)))?
        .json()
        .await
        .map_err(|e| Error::Protocol(format!("{} returned non-JSON: {}", url, e)))?;
    body.get("webSocketDebuggerUrl")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| Error::Protocol(format!("{} has no webSocketDebuggerUrl", url)))
}

/// Browser-level automation client. Page and worker commands are routed
/// through flattened sessions obtained from `attach_to_target`.
pub struct CdpClient {
    wire: WireClient,
    pub(crate) config: BrowserConfig,
    pub(crate) reload_timing: ReloadConfig,
    sessions: Mutex<HashMap<String, String>>,
    pub(crate) management_session: Mutex<Option<String>>,
}

impl CdpClient {
    pub async fn connect(config: &BrowserConfig) -> Result<Self> {
        let ws_url = discover_ws_url(config).await?;
        Self::connect_to(&ws_url, config).await
    }

    pub async fn connect_to(ws_url: &str, config: &BrowserConfig) -> Result<Self> {
        let wire = WireClient::connect(ws_url, config.command_timeout()).await?;
        info!(ws_url, "connected to browser");
        Ok(Self::from_wire(wire, config.clone()))
    }

    pub fn from_wire(wire: WireClient, config: BrowserConfig) -> Self {
        Self {
            wire,
            config,
            reload_timing: ReloadConfig::default(),
            sessions: Mutex::new(HashMap::new()),
            management_session: Mutex::new(None),
        }
    }

    /// Delays used by the reload chain's toggle step.
    pub fn with_reload_timing(mut self, reload: ReloadConfig) -> Self {
        self.reload_timing = reload;
        self
    }

    pub fn wire(&self) -> &WireClient {
        &self.wire
    }

    pub fn config(&self) -> &BrowserConfig {
        &self.config
    }

    pub async fn send_command(
        &self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
    ) -> Result<Value> {
        self.wire.send(method, params, session_id).await
    }

    pub async fn subscribe(&self, method: &str) -> mpsc::Receiver<CdpEvent> {
        self.wire.subscribe(Some(method)).await
    }

    // ─── Targets ──────────────────────────────────────────────────────

    pub async fn get_targets(&self) -> Result<Vec<TargetInfo>> {
        let result = self.send_command("Target.getTargets", json!({}), None).await?;
        let infos = result.get("targetInfos").cloned().unwrap_or(json!([]));
        serde_json::from_value(infos)
            .map_err(|e| Error::Protocol(format!("bad targetInfos: {}", e)))
    }

    /// Attach in flatten mode; sessions are cached per target.
    pub async fn attach_to_target(&self, target_id: &str) -> Result<String> {
        if let Some(session) = self.sessions.lock().await.get(target_id) {
            return Ok(session.clone());
        }
        let result = self
            .send_command(
                "Target.attachToTarget",
                json!({"targetId": target_id, "flatten": true}),
                None,
            )
            .await?;
        let session_id = result
            .get("sessionId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| Error::Protocol("attachToTarget returned no sessionId".to_string()))?;
        debug!(target_id, session_id = %session_id, "attached to target");
        self.sessions
            .lock()
            .await
            .insert(target_id.to_string(), session_id.clone());
        Ok(session_id)
    }

    /// Drop a cached session so the next attach starts fresh. Needed after
    /// the target was destroyed, e.g. by an extension reload.
    pub async fn forget_target(&self, target_id: &str) {
        self.sessions.lock().await.remove(target_id);
    }

    pub async fn forget_all_sessions(&self) {
        self.sessions.lock().await.clear();
    }

    pub async fn create_target(&self, url: &str) -> Result<String> {
        let result = self
            .send_command("Target.createTarget", json!({"url": url}), None)
            .await?;
        result
            .get("targetId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| Error::Protocol("createTarget returned no targetId".to_string()))
    }

    pub async fn activate_target(&self, target_id: &str) -> Result<()> {
        self.send_command("Target.activateTarget", json!({"targetId": target_id}), None)
            .await?;
        Ok(())
    }

    pub async fn close_target(&self, target_id: &str) -> Result<()> {
        self.send_command("Target.closeTarget", json!({"targetId": target_id}), None)
            .await?;
        self.forget_target(target_id).await;
        Ok(())
    }

    /// First page whose URL contains `filter`, or the first ordinary web
    /// page when no filter is given.
    pub async fn find_page(&self, filter: Option<&str>) -> Result<TargetInfo> {
        let targets = self.get_targets().await?;
        let found = targets.into_iter().filter(|t| t.is_page()).find(|t| match filter {
            Some(f) => t.url.contains(f),
            None => t.url.starts_with("http") || t.url.starts_with("file:"),
        });
        found.ok_or_else(|| {
            Error::NotFound(match filter {
                Some(f) => format!("no page target matching '{}'", f),
                None => "no web page target open".to_string(),
            })
        })
    }

    // ─── Runtime ──────────────────────────────────────────────────────

    /// Evaluate an expression and return its value. A thrown exception
    /// becomes `Error::JsException`.
    pub async fn evaluate(&self, session_id: &str, expression: &str) -> Result<Value> {
        let result = self
            .send_command(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
                Some(session_id),
            )
            .await?;
        unwrap_evaluation(result)
    }

    pub async fn enable_domain(&self, session_id: &str, domain: &str) -> Result<()> {
        self.send_command(&format!("{}.enable", domain), json!({}), Some(session_id))
            .await?;
        Ok(())
    }

    pub async fn enable_logging(&self, session_id: &str) -> Result<()> {
        self.enable_domain(session_id, "Runtime").await?;
        self.enable_domain(session_id, "Log").await
    }

    pub async fn enable_network(&self, session_id: &str) -> Result<()> {
        self.enable_domain(session_id, "Network").await
    }

    /// Navigate and wait for the page's load event.
    pub async fn navigate(&self, session_id: &str, url: &str) -> Result<()> {
        self.enable_domain(session_id, "Page").await?;
        let mut loads = self.subscribe("Page.loadEventFired").await;
        let result = self
            .send_command("Page.navigate", json!({"url": url}), Some(session_id))
            .await?;
        if let Some(err) = result.get("errorText").and_then(|v| v.as_str()) {
            return Err(Error::Connection(format!("navigation to {} failed: {}", url, err)));
        }

        let wait = async {
            while let Some(event) = loads.recv().await {
                if event.session_id.as_deref() == Some(session_id) {
                    return true;
                }
            }
            false
        };
        match tokio::time::timeout(self.config.command_timeout(), wait).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::ConnectionClosed("closed while waiting for load".to_string())),
            Err(_) => Err(Error::Timeout(format!("load of {} did not finish", url))),
        }
    }
}

/// Turn a `Runtime.evaluate` result into the plain value or a JS exception.
pub(crate) fn unwrap_evaluation(result: Value) -> Result<Value> {
    if let Some(details) = result.get("exceptionDetails") {
        let text = details
            .pointer("/exception/description")
            .and_then(|v| v.as_str())
            .or_else(|| details.get("text").and_then(|v| v.as_str()))
            .unwrap_or("uncaught exception");
        return Err(Error::JsException(text.to_string()));
    }
    Ok(result
        .pointer("/result/value")
        .cloned()
        .unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::tests::harness;

    #[test]
    fn test_extension_id_from_url() {
        assert_eq!(
            extension_id_from_url("chrome-extension://abcdef/background.js"),
            Some("abcdef")
        );
        assert_eq!(extension_id_from_url("moz-extension://uuid-1/popup.html?x=1"), Some("uuid-1"));
        assert_eq!(extension_id_from_url("extension://xyz"), Some("xyz"));
        assert_eq!(extension_id_from_url("https://example.com/"), None);
        assert_eq!(extension_id_from_url("chrome-extension:///"), None);
    }

    #[test]
    fn test_target_info_deserialize() {
        let info: TargetInfo = serde_json::from_value(json!({
            "targetId": "T1",
            "type": "service_worker",
            "title": "Service Worker",
            "url": "chrome-extension://abc/sw.js",
            "attached": false,
            "browserContextId": "ctx"
        }))
        .unwrap();
        assert!(info.is_worker_like());
        assert!(!info.is_page());
        assert_eq!(info.extension_id(), Some("abc"));
        assert_eq!(info.extension_preference(), 1);
    }

    #[test]
    fn test_unwrap_evaluation() {
        let ok = unwrap_evaluation(json!({"result": {"type": "number", "value": 2}})).unwrap();
        assert_eq!(ok, 2);

        let err = unwrap_evaluation(json!({
            "result": {"type": "object"},
            "exceptionDetails": {"text": "Uncaught", "exception": {"description": "Error: boom"}}
        }))
        .unwrap_err();
        assert!(matches!(err, Error::JsException(ref m) if m == "Error: boom"));

        let undefined = unwrap_evaluation(json!({"result": {"type": "undefined"}})).unwrap();
        assert!(undefined.is_null());
    }

    #[tokio::test]
    async fn test_attach_is_cached_per_target() {
        let crate::wire::tests::Harness {
            client,
            mut sent,
            inbound,
        } = harness();
        let client = CdpClient::from_wire(client, BrowserConfig::default());
        let responder = tokio::spawn(async move {
            let frame: Value = serde_json::from_str(&sent.recv().await.unwrap()).unwrap();
            assert_eq!(frame["method"], "Target.attachToTarget");
            assert_eq!(frame["params"]["flatten"], true);
            inbound
                .send(json!({"id": frame["id"], "result": {"sessionId": "S-1"}}).to_string())
                .await
                .unwrap();
            (sent, inbound)
        });

        assert_eq!(client.attach_to_target("T1").await.unwrap(), "S-1");
        let (mut sent, _inbound) = responder.await.unwrap();
        assert_eq!(client.attach_to_target("T1").await.unwrap(), "S-1");
        assert!(sent.try_recv().is_err());
    }
}
