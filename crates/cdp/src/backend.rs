use async_trait::async_trait;
use extdev_core::{BrowserConfig, BrowserEngine, Error, ReloadConfig, Result};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::capture::{
    finish_capture, injection_probe_js, poll_until, shadow_content_js, SERIALIZE_DOCUMENT_JS,
};
use crate::client::CdpClient;
use crate::extension::ExtensionHandle;
use crate::rdp::{AddonReload, FirefoxAddons, RdpClient, TabTarget, TemporaryReinstall};
use crate::reload::{ReloadChain, ReloadOutcome};
use crate::wire::CdpEvent;

/// How to find the extension to drive. A path loads it; otherwise an id is
/// used as-is, and a name narrows discovery.
#[derive(Debug, Clone, Default)]
pub struct ExtensionSpec {
    pub extension_id: Option<String>,
    pub name: Option<String>,
    pub path: Option<String>,
}

/// Browser-neutral automation surface used by the CLI and the harness.
#[async_trait]
pub trait AutomationBackend: Send + Sync {
    fn engine(&self) -> BrowserEngine;

    async fn attach_extension(&self, spec: &ExtensionSpec) -> Result<ExtensionHandle>;

    /// Runs the reload chain. Failure is reported inside the outcome.
    async fn reload_extension(&self, extension_id: &str) -> ReloadOutcome;

    async fn extension_info(&self, extension_id: &str) -> Result<Value>;

    /// Capture the first page matching `url_filter`.
    async fn capture_page(&self, url_filter: Option<&str>) -> Result<String>;

    async fn wait_for_injection(&self, url_filter: Option<&str>) -> Result<bool>;

    /// Forward page and extension console output to the log.
    async fn enable_logging(&self) -> Result<()>;
}

pub async fn connect_backend(
    browser: &BrowserConfig,
    reload: &ReloadConfig,
) -> Result<Box<dyn AutomationBackend>> {
    match browser.engine {
        BrowserEngine::Chromium => {
            let client = CdpClient::connect(browser).await?;
            Ok(Box::new(ChromiumBackend::new(client, reload)))
        }
        BrowserEngine::Firefox => {
            let client =
                RdpClient::connect(&browser.host, browser.rdp_port, browser.command_timeout())
                    .await?;
            Ok(Box::new(FirefoxBackend::new(client, browser.clone())))
        }
    }
}

/// `(level, text)` for console-ish events, `None` for everything else.
pub fn console_line(event: &CdpEvent) -> Option<(String, String)> {
    let p = &event.params;
    match event.method.as_str() {
        "Runtime.consoleAPICalled" => {
            let level = p.get("type").and_then(|v| v.as_str()).unwrap_or("log");
            let text = p
                .get("args")
                .and_then(|v| v.as_array())
                .map(|args| {
                    args.iter()
                        .map(|a| match a.get("value") {
                            Some(Value::String(s)) => s.clone(),
                            Some(v) => v.to_string(),
                            None => a
                                .get("description")
                                .and_then(|d| d.as_str())
                                .unwrap_or("")
                                .to_string(),
                        })
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .unwrap_or_default();
            Some((level.to_string(), text))
        }
        "Runtime.exceptionThrown" => {
            let details = p.get("exceptionDetails")?;
            let text = details
                .pointer("/exception/description")
                .and_then(|v| v.as_str())
                .or_else(|| details.get("text").and_then(|v| v.as_str()))
                .unwrap_or("uncaught exception");
            Some(("error".to_string(), text.to_string()))
        }
        "Log.entryAdded" => {
            let entry = p.get("entry")?;
            let level = entry.get("level").and_then(|v| v.as_str()).unwrap_or("info");
            let text = entry.get("text").and_then(|v| v.as_str()).unwrap_or("");
            Some((level.to_string(), text.to_string()))
        }
        _ => None,
    }
}

fn emit_console(source: &str, level: &str, text: &str) {
    match level {
        "error" | "assert" => error!(target: "extdev::browser", source, "{}", text),
        "warning" | "warn" => warn!(target: "extdev::browser", source, "{}", text),
        "debug" | "verbose" | "trace" => debug!(target: "extdev::browser", source, "{}", text),
        _ => info!(target: "extdev::browser", source, "{}", text),
    }
}

// ─── Chromium ─────────────────────────────────────────────────────────

pub struct ChromiumBackend {
    client: CdpClient,
}

impl ChromiumBackend {
    pub fn new(client: CdpClient, reload: &ReloadConfig) -> Self {
        Self {
            client: client.with_reload_timing(reload.clone()),
        }
    }

    pub fn client(&self) -> &CdpClient {
        &self.client
    }
}

#[async_trait]
impl AutomationBackend for ChromiumBackend {
    fn engine(&self) -> BrowserEngine {
        BrowserEngine::Chromium
    }

    async fn attach_extension(&self, spec: &ExtensionSpec) -> Result<ExtensionHandle> {
        let id = if let Some(path) = &spec.path {
            self.client.load_unpacked_extension(path).await?
        } else if let Some(id) = &spec.extension_id {
            id.clone()
        } else {
            self.client.derive_extension_id(spec.name.as_deref()).await?
        };
        let info = self.client.get_extension_info(&id).await?;
        Ok(ExtensionHandle::from_info(&id, &info))
    }

    async fn reload_extension(&self, extension_id: &str) -> ReloadOutcome {
        self.client.reload_with_outcome(extension_id).await
    }

    async fn extension_info(&self, extension_id: &str) -> Result<Value> {
        self.client.get_extension_info(extension_id).await
    }

    async fn capture_page(&self, url_filter: Option<&str>) -> Result<String> {
        let page = self.client.find_page(url_filter).await?;
        let session = self.client.attach_to_target(&page.target_id).await?;
        self.client.capture_page(&session).await
    }

    async fn wait_for_injection(&self, url_filter: Option<&str>) -> Result<bool> {
        let page = self.client.find_page(url_filter).await?;
        let session = self.client.attach_to_target(&page.target_id).await?;
        Ok(self.client.wait_for_content_script_injection(&session).await)
    }

    async fn enable_logging(&self) -> Result<()> {
        let mut events = self.client.wire().subscribe(None).await;
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Some((level, text)) = console_line(&event) {
                    let source = event.session_id.as_deref().unwrap_or("browser");
                    emit_console(source, &level, &text);
                }
            }
        });

        for target in self.client.get_targets().await? {
            if !(target.is_page() || target.is_worker_like()) {
                continue;
            }
            let session = match self.client.attach_to_target(&target.target_id).await {
                Ok(session) => session,
                Err(e) => {
                    debug!(target_id = %target.target_id, error = %e, "skipping target");
                    continue;
                }
            };
            if let Err(e) = self.client.enable_logging(&session).await {
                debug!(target_id = %target.target_id, error = %e, "logging not enabled");
            }
        }
        Ok(())
    }
}

// ─── Firefox ──────────────────────────────────────────────────────────

pub struct FirefoxBackend {
    addons: FirefoxAddons,
    chain: ReloadChain<FirefoxAddons>,
    config: BrowserConfig,
}

impl FirefoxBackend {
    pub fn new(client: RdpClient, config: BrowserConfig) -> Self {
        Self {
            addons: FirefoxAddons::new(client),
            chain: ReloadChain::new(vec![Box::new(AddonReload), Box::new(TemporaryReinstall)]),
            config,
        }
    }

    async fn tab(&self, url_filter: Option<&str>) -> Result<TabTarget> {
        let tabs = self.addons.client.list_tabs().await?;
        let tab = tabs
            .iter()
            .find(|t| match url_filter {
                Some(f) => t.url.contains(f),
                None => t.selected,
            })
            .or_else(|| if url_filter.is_none() { tabs.first() } else { None })
            .ok_or_else(|| Error::NotFound("no matching tab".to_string()))?;
        self.addons.client.tab_target(&tab.actor).await
    }
}

#[async_trait]
impl AutomationBackend for FirefoxBackend {
    fn engine(&self) -> BrowserEngine {
        BrowserEngine::Firefox
    }

    async fn attach_extension(&self, spec: &ExtensionSpec) -> Result<ExtensionHandle> {
        let addon = if let Some(path) = &spec.path {
            let id = self.addons.client.install_temporary_addon(path).await?;
            self.addons.remember_path(&id, path).await;
            self.addons.find(&id).await?
        } else if let Some(id) = &spec.extension_id {
            self.addons.find(id).await?
        } else {
            let hint = spec.name.as_deref().unwrap_or_default();
            self.addons
                .client
                .list_addons()
                .await?
                .into_iter()
                .find(|a| a.temporarily_installed && a.name.contains(hint))
                .ok_or_else(|| Error::NotFound("no temporary add-on installed".to_string()))?
        };
        let info = serde_json::to_value(&addon)?;
        Ok(ExtensionHandle::from_info(&addon.id, &info))
    }

    async fn reload_extension(&self, extension_id: &str) -> ReloadOutcome {
        self.chain.run(&self.addons, extension_id).await
    }

    async fn extension_info(&self, extension_id: &str) -> Result<Value> {
        let addon = self.addons.find(extension_id).await?;
        Ok(serde_json::to_value(addon)?)
    }

    async fn capture_page(&self, url_filter: Option<&str>) -> Result<String> {
        let target = self.tab(url_filter).await?;
        let client = &self.addons.client;
        let html = client
            .evaluate(&target.console_actor, SERIALIZE_DOCUMENT_JS)
            .await?
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| Error::Protocol("document serialization returned no string".to_string()))?;
        let root_id = &self.config.extension_root_id;
        let shadow = client
            .evaluate(&target.console_actor, &shadow_content_js(root_id))
            .await?;
        Ok(finish_capture(
            &html,
            shadow.as_str(),
            root_id,
            self.config.max_capture_bytes,
        ))
    }

    async fn wait_for_injection(&self, url_filter: Option<&str>) -> Result<bool> {
        let target = self.tab(url_filter).await?;
        let probe = injection_probe_js(&self.config.extension_root_id);
        let (client, console, probe) = (&self.addons.client, target.console_actor.as_str(), probe.as_str());
        let deadline = tokio::time::Instant::now() + self.config.injection_deadline();
        Ok(poll_until(deadline, self.config.injection_poll_interval(), move || async move {
            matches!(client.evaluate(console, probe).await, Ok(Value::Bool(true)))
        })
        .await)
    }

    async fn enable_logging(&self) -> Result<()> {
        let mut events = self.addons.client.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ev) => {
                        let kind = ev.packet.get("type").and_then(|v| v.as_str());
                        match kind {
                            Some("consoleAPICall") => {
                                let msg = ev.packet.get("message").cloned().unwrap_or(Value::Null);
                                let level = msg.get("level").and_then(|v| v.as_str()).unwrap_or("log");
                                let text = msg
                                    .get("arguments")
                                    .and_then(|v| v.as_array())
                                    .map(|args| {
                                        args.iter()
                                            .map(|a| a.as_str().map(|s| s.to_string()).unwrap_or_else(|| a.to_string()))
                                            .collect::<Vec<_>>()
                                            .join(" ")
                                    })
                                    .unwrap_or_default();
                                emit_console(&ev.from, level, &text);
                            }
                            Some("pageError") => {
                                let text = ev
                                    .packet
                                    .pointer("/pageError/errorMessage")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or("page error");
                                emit_console(&ev.from, "error", text);
                            }
                            _ => {}
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        for tab in self.addons.client.list_tabs().await? {
            match self.addons.client.tab_target(&tab.actor).await {
                Ok(target) => {
                    if let Err(e) = self
                        .addons
                        .client
                        .start_listeners(&target.console_actor, &["PageError", "ConsoleAPI"])
                        .await
                    {
                        debug!(tab = %tab.url, error = %e, "console listeners not started");
                    }
                }
                Err(e) => debug!(tab = %tab.url, error = %e, "skipping tab"),
            }
        }
        Ok(())
    }
}
