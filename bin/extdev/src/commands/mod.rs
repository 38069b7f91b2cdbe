pub mod browser;
pub mod dev;
pub mod serve;
pub mod verify;

use std::sync::Arc;

use async_trait::async_trait;
use extdev_cdp::{connect_backend, AutomationBackend, ExtensionSpec};
use extdev_core::{Config, ExtensionReady, ReloadReason, Result};
use extdev_reload::DevExtensions;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::{BrowserArgs, ExtensionArgs};

pub fn apply_browser_args(config: &mut Config, args: &BrowserArgs) {
    if let Some(engine) = args.engine {
        config.browser.engine = engine;
    }
    if let Some(host) = &args.browser_host {
        config.browser.host = host.clone();
    }
    if let Some(port) = args.cdp_port {
        config.browser.cdp_port = port;
    }
    if let Some(port) = args.rdp_port {
        config.browser.rdp_port = port;
    }
}

pub fn extension_spec(args: &ExtensionArgs, default_name: Option<&str>) -> ExtensionSpec {
    ExtensionSpec {
        extension_id: args.id.clone(),
        name: args.name.clone().or_else(|| default_name.map(|s| s.to_string())),
        path: args.load.clone(),
    }
}

pub async fn open_backend(config: &Config) -> anyhow::Result<Arc<dyn AutomationBackend>> {
    let backend = connect_backend(&config.browser, &config.reload).await?;
    info!(engine = backend.engine().name(), "browser connected");
    Ok(Arc::from(backend))
}

/// Dev extensions driven through an automation backend.
pub struct BackendExtensions {
    backend: Arc<dyn AutomationBackend>,
    extension_ids: Vec<String>,
}

impl BackendExtensions {
    pub fn new(backend: Arc<dyn AutomationBackend>, extension_ids: Vec<String>) -> Self {
        Self {
            backend,
            extension_ids,
        }
    }
}

#[async_trait]
impl DevExtensions for BackendExtensions {
    async fn metadata(&self) -> Result<Value> {
        let mut extensions = Vec::with_capacity(self.extension_ids.len());
        for id in &self.extension_ids {
            extensions.push(self.backend.extension_info(id).await?);
        }
        Ok(json!({
            "engine": self.backend.engine().name(),
            "extensions": extensions,
        }))
    }

    async fn reload_all(&self, reason: ReloadReason) -> Vec<ExtensionReady> {
        let mut ready = Vec::new();
        for id in &self.extension_ids {
            let outcome = self.backend.reload_extension(id).await;
            match outcome.strategy {
                Some(strategy) => {
                    info!(extension_id = %id, strategy = %strategy, reason = ?reason, "extension reloaded");
                    ready.push(ExtensionReady {
                        extension_id: id.clone(),
                        strategy: Some(strategy),
                    });
                }
                None => warn!(
                    extension_id = %id,
                    failures = ?outcome.failures,
                    "every reload strategy failed"
                ),
            }
        }
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use extdev_cdp::{ExtensionHandle, ReloadOutcome, StrategyFailure};
    use extdev_core::{BrowserEngine, Error};

    struct ScriptedBackend;

    #[async_trait]
    impl AutomationBackend for ScriptedBackend {
        fn engine(&self) -> BrowserEngine {
            BrowserEngine::Chromium
        }

        async fn attach_extension(&self, spec: &ExtensionSpec) -> Result<ExtensionHandle> {
            Ok(ExtensionHandle {
                extension_id: spec.extension_id.clone().unwrap_or_default(),
                ..ExtensionHandle::default()
            })
        }

        async fn reload_extension(&self, extension_id: &str) -> ReloadOutcome {
            let ok = extension_id == "good";
            ReloadOutcome {
                extension_id: extension_id.to_string(),
                strategy: ok.then(|| "graceful-toggle".to_string()),
                failures: if ok {
                    Vec::new()
                } else {
                    vec![StrategyFailure {
                        strategy: "graceful-toggle".to_string(),
                        reason: "health check timed out".to_string(),
                    }]
                },
            }
        }

        async fn extension_info(&self, extension_id: &str) -> Result<Value> {
            if extension_id == "missing" {
                return Err(Error::NotFound(extension_id.to_string()));
            }
            Ok(json!({"id": extension_id, "name": "Demo"}))
        }

        async fn capture_page(&self, _url_filter: Option<&str>) -> Result<String> {
            Ok(String::new())
        }

        async fn wait_for_injection(&self, _url_filter: Option<&str>) -> Result<bool> {
            Ok(true)
        }

        async fn enable_logging(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_reload_all_reports_only_successes() {
        let ext = BackendExtensions::new(
            Arc::new(ScriptedBackend),
            vec!["good".to_string(), "bad".to_string()],
        );
        let ready = ext.reload_all(ReloadReason::Manifest).await;
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].extension_id, "good");
        assert_eq!(ready[0].strategy.as_deref(), Some("graceful-toggle"));
    }

    #[tokio::test]
    async fn test_metadata_fails_until_every_extension_answers() {
        let ext = BackendExtensions::new(Arc::new(ScriptedBackend), vec!["good".to_string()]);
        let data = ext.metadata().await.unwrap();
        assert_eq!(data["engine"], "chromium");
        assert_eq!(data["extensions"][0]["name"], "Demo");

        let ext = BackendExtensions::new(
            Arc::new(ScriptedBackend),
            vec!["good".to_string(), "missing".to_string()],
        );
        assert!(ext.metadata().await.is_err());
    }

    #[test]
    fn test_extension_spec_falls_back_to_manifest_name() {
        let spec = extension_spec(&ExtensionArgs::default(), Some("Demo"));
        assert_eq!(spec.name.as_deref(), Some("Demo"));
        let args = ExtensionArgs {
            name: Some("Other".to_string()),
            ..ExtensionArgs::default()
        };
        assert_eq!(extension_spec(&args, Some("Demo")).name.as_deref(), Some("Other"));
    }

    #[test]
    fn test_browser_overrides() {
        let mut config = Config::default();
        let args = BrowserArgs {
            engine: Some(BrowserEngine::Firefox),
            rdp_port: Some(6123),
            ..BrowserArgs::default()
        };
        apply_browser_args(&mut config, &args);
        assert_eq!(config.browser.engine, BrowserEngine::Firefox);
        assert_eq!(config.browser.rdp_port, 6123);
        assert_eq!(config.browser.cdp_port, 9222);
    }
}
