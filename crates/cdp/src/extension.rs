use std::time::Duration;

use async_trait::async_trait;
use extdev_core::{Error, Result};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::capture::poll_until;
use crate::client::{CdpClient, TargetInfo};
use crate::reload::{ExtensionControl, ReloadChain, ReloadOutcome};

const EXTENSIONS_PAGE: &str = "chrome://extensions/";

/// An extension the tool is driving.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionHandle {
    pub extension_id: String,
    pub name: Option<String>,
    pub version: Option<String>,
    pub last_reload: Option<ReloadOutcome>,
}

impl ExtensionHandle {
    pub fn from_info(extension_id: &str, info: &Value) -> Self {
        Self {
            extension_id: extension_id.to_string(),
            name: info.get("name").and_then(|v| v.as_str()).map(|s| s.to_string()),
            version: info.get("version").and_then(|v| v.as_str()).map(|s| s.to_string()),
            last_reload: None,
        }
    }

    pub fn record(&mut self, outcome: ReloadOutcome) {
        self.last_reload = Some(outcome);
    }
}

/// Extension targets for `extension_id`, best evaluation context first.
pub fn extension_targets(targets: &[TargetInfo], extension_id: &str) -> Vec<TargetInfo> {
    let mut found: Vec<TargetInfo> = targets
        .iter()
        .filter(|t| t.extension_id() == Some(extension_id))
        .cloned()
        .collect();
    found.sort_by_key(|t| t.extension_preference());
    found
}

/// Ids of running extension workers, in target order, de-duplicated.
pub fn worker_extension_ids(targets: &[TargetInfo]) -> Vec<(String, String)> {
    let mut seen = Vec::new();
    let mut out = Vec::new();
    for t in targets.iter().filter(|t| t.is_worker_like()) {
        if let Some(id) = t.extension_id() {
            if !seen.iter().any(|s: &String| s == id) {
                seen.push(id.to_string());
                out.push((id.to_string(), t.target_id.clone()));
            }
        }
    }
    out
}

impl CdpClient {
    /// Session on the extension's best running context.
    pub async fn extension_session(&self, extension_id: &str) -> Result<String> {
        let targets = self.get_targets().await?;
        let target = extension_targets(&targets, extension_id)
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::NotFound(format!("no running context for extension {}", extension_id))
            })?;
        self.attach_to_target(&target.target_id).await
    }

    /// Manifest of a running extension, evaluated inside it.
    pub async fn get_extension_info(&self, extension_id: &str) -> Result<Value> {
        let session = self.extension_session(extension_id).await?;
        let info = self
            .evaluate(
                &session,
                "(() => { const m = chrome.runtime.getManifest(); \
                 return { id: chrome.runtime.id, name: m.name, version: m.version, \
                 manifestVersion: m.manifest_version }; })()",
            )
            .await?;
        if info.get("id").and_then(|v| v.as_str()) != Some(extension_id) {
            return Err(Error::Protocol(format!(
                "context for {} reported a different runtime id",
                extension_id
            )));
        }
        Ok(info)
    }

    pub async fn load_unpacked_extension(&self, path: &str) -> Result<String> {
        let result = self
            .send_command("Extensions.loadUnpacked", json!({"path": path}), None)
            .await?;
        let id = result
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| Error::Protocol("loadUnpacked returned no id".to_string()))?;
        info!(path, extension_id = %id, "loaded unpacked extension");
        Ok(id)
    }

    pub async fn unload_extension(&self, extension_id: &str) -> Result<()> {
        self.send_command("Extensions.uninstall", json!({"id": extension_id}), None)
            .await?;
        Ok(())
    }

    /// Find the id of a freshly launched extension by evaluating the
    /// manifest name in each running extension worker. Without a name the
    /// first worker wins. After the last round, falls back to the first
    /// extension worker seen at all.
    pub async fn derive_extension_id(&self, manifest_name: Option<&str>) -> Result<String> {
        let retries = self.config.extension_id_max_retries.max(1);
        let interval = self.config.extension_id_poll_interval();
        let mut fallback: Option<String> = None;

        for attempt in 1..=retries {
            let targets = match self.get_targets().await {
                Ok(targets) => targets,
                Err(e) => {
                    debug!(attempt, error = %e, "target listing failed");
                    Vec::new()
                }
            };
            for (id, target_id) in worker_extension_ids(&targets) {
                if fallback.is_none() {
                    fallback = Some(id.clone());
                }
                let expected = match manifest_name {
                    Some(name) => name,
                    None => return Ok(id),
                };
                match self.manifest_name(&target_id).await {
                    Ok(name) if name == expected => {
                        debug!(attempt, extension_id = %id, "derived extension id");
                        return Ok(id);
                    }
                    Ok(_) => {}
                    Err(e) => debug!(extension_id = %id, error = %e, "manifest not readable"),
                }
            }
            if attempt < retries {
                tokio::time::sleep(interval).await;
            }
        }

        match fallback {
            Some(id) => {
                warn!(extension_id = %id, "no manifest name matched, using first extension worker");
                Ok(id)
            }
            None => Err(Error::NotFound(format!(
                "no extension worker appeared after {} attempts",
                retries
            ))),
        }
    }

    async fn manifest_name(&self, target_id: &str) -> Result<String> {
        let session = self.attach_to_target(target_id).await?;
        let value = self
            .evaluate(&session, "chrome.runtime.getManifest().name")
            .await?;
        value
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| Error::Protocol("manifest name is not a string".to_string()))
    }

    /// Run the reload chain and keep the full outcome.
    pub async fn reload_with_outcome(&self, extension_id: &str) -> ReloadOutcome {
        let chain: ReloadChain<dyn ExtensionControl> =
            ReloadChain::chromium(&self.config, &self.reload_timing);
        chain.run(self, extension_id).await
    }

    pub async fn force_reload_extension(&self, extension_id: &str) -> bool {
        self.reload_with_outcome(extension_id).await.success()
    }

    /// Session on a `chrome://extensions` page, where the management API
    /// is available. Created on first use.
    async fn management_session_id(&self) -> Result<String> {
        let mut cached = self.management_session.lock().await;
        if let Some(session) = cached.as_ref() {
            return Ok(session.clone());
        }
        let targets = self.get_targets().await?;
        let target_id = match targets
            .iter()
            .find(|t| t.is_page() && t.url.starts_with(EXTENSIONS_PAGE))
        {
            Some(t) => t.target_id.clone(),
            None => self.create_target(EXTENSIONS_PAGE).await?,
        };
        let session = self.attach_to_target(&target_id).await?;
        *cached = Some(session.clone());
        Ok(session)
    }

    async fn reset_management_session(&self) {
        *self.management_session.lock().await = None;
    }
}

fn set_enabled_js(extension_id: &str, enabled: bool) -> String {
    format!(
        "new Promise((resolve, reject) => chrome.management.setEnabled({}, {}, () => {{ \
         const e = chrome.runtime.lastError; e ? reject(new Error(e.message)) : resolve(true); }}))",
        serde_json::to_string(extension_id).unwrap_or_default(),
        enabled
    )
}

#[async_trait]
impl ExtensionControl for CdpClient {
    async fn set_enabled(&self, extension_id: &str, enabled: bool) -> Result<()> {
        let session = self.management_session_id().await?;
        let js = set_enabled_js(extension_id, enabled);
        match self.evaluate(&session, &js).await {
            Ok(_) => Ok(()),
            Err(e) => {
                // The management page may have been closed under us.
                if !matches!(e, Error::JsException(_)) {
                    self.reset_management_session().await;
                }
                Err(e)
            }
        }
    }

    async fn ping(&self, extension_id: &str, timeout: Duration) -> Result<()> {
        // Contexts died with the toggle; stale sessions would hang.
        self.forget_all_sessions().await;
        let deadline = tokio::time::Instant::now() + timeout;
        let interval = self.config.extension_id_poll_interval();
        let alive = poll_until(deadline, interval, move || async move {
            match self.get_extension_info(extension_id).await {
                Ok(_) => true,
                Err(e) => {
                    debug!(extension_id, error = %e, "extension not answering yet");
                    self.forget_all_sessions().await;
                    false
                }
            }
        })
        .await;
        if alive {
            Ok(())
        } else {
            Err(Error::Timeout(format!(
                "extension {} did not answer within {:?}",
                extension_id, timeout
            )))
        }
    }

    async fn protocol_reload(&self, extension_id: &str) -> Result<()> {
        self.send_command("Extensions.reload", json!({"id": extension_id}), None)
            .await?;
        self.forget_all_sessions().await;
        Ok(())
    }

    async fn runtime_reload(&self, extension_id: &str) -> Result<()> {
        let session = self.extension_session(extension_id).await?;
        // Deferred so the evaluation returns before the context goes away.
        let result = self
            .evaluate(&session, "setTimeout(() => chrome.runtime.reload(), 0); true")
            .await;
        self.forget_all_sessions().await;
        if let Err(e) = &result {
            warn!(extension_id, error = %e, "runtime.reload evaluation failed");
        }
        result.map(|_| ())
    }
}
