use std::path::Path;
use std::sync::Arc;

use extdev_cdp::AutomationBackend;
use extdev_core::Config;
use extdev_harness::ndjson::{HarnessEvent, STAGE_POST_INJECTION, STAGE_UPDATED};
use extdev_reload::{ClientExit, ReloadClient, ServerEvent};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::{extension_spec, open_backend, BackendExtensions};
use crate::ExtensionArgs;

fn emit(event: &HarnessEvent) {
    println!("{}", event.to_line());
}

fn emit_action(payload: serde_json::Value) {
    if let Some(map) = payload.as_object() {
        emit(&HarnessEvent::ActionEvent {
            payload: map.clone(),
        });
    }
}

/// Wait for the content script and print the page as a `page_html` event.
async fn snapshot(backend: &dyn AutomationBackend, url_filter: Option<&str>, stage: &str) {
    match backend.wait_for_injection(url_filter).await {
        Ok(true) => {}
        Ok(false) => warn!(stage, "content script not detected before deadline"),
        Err(e) => {
            warn!(stage, error = %e, "no page to capture");
            return;
        }
    }
    match backend.capture_page(url_filter).await {
        Ok(html) => emit(&HarnessEvent::page_html(stage, html)),
        Err(e) => warn!(stage, error = %e, "page capture failed"),
    }
}

async fn attach(
    backend: &Arc<dyn AutomationBackend>,
    args: &ExtensionArgs,
    manifest_name: Option<&str>,
) -> anyhow::Result<String> {
    let handle = backend
        .attach_extension(&extension_spec(args, manifest_name))
        .await?;
    info!(
        extension_id = %handle.extension_id,
        name = ?handle.name,
        version = ?handle.version,
        "extension attached"
    );
    if let Err(e) = backend.enable_logging().await {
        warn!(error = %e, "console forwarding unavailable");
    }
    Ok(handle.extension_id)
}

pub async fn connect(config: &Config, url: Option<String>, args: &ExtensionArgs) -> anyhow::Result<()> {
    let backend = open_backend(config).await?;
    let extension_id = attach(&backend, args, None).await?;
    let url = url.unwrap_or_else(|| config.reload.ws_url());

    let extensions = Arc::new(BackendExtensions::new(backend, vec![extension_id]));
    let client = ReloadClient::new(&config.reload, url, extensions);
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(());
    });

    match client.run(shutdown_rx).await {
        ClientExit::Shutdown => info!("reload client stopped"),
        ClientExit::GaveUp { attempts } => {
            warn!(attempts, "reload server unreachable, client stopped")
        }
    }
    Ok(())
}

pub async fn run(
    config: &Config,
    ext: &Path,
    url_filter: Option<String>,
    args: &ExtensionArgs,
) -> anyhow::Result<()> {
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let serve = super::serve::start(config, ext, &shutdown_tx).await?;
    let mut events = serve.server.subscribe();

    let backend = open_backend(config).await?;
    let extension_id = attach(&backend, args, serve.manifest_name.as_deref()).await?;

    let extensions = Arc::new(BackendExtensions::new(backend.clone(), vec![extension_id.clone()]));
    let client = ReloadClient::new(&config.reload, serve.server.ws_url(), extensions);
    let client_task = tokio::spawn(client.run(shutdown_tx.subscribe()));

    let filter = url_filter.as_deref();
    snapshot(backend.as_ref(), filter, STAGE_POST_INJECTION).await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(ServerEvent::ExtensionReady { ready, .. }) => {
                    emit_action(json!({
                        "action": "extension_ready",
                        "extensionId": ready.extension_id,
                        "strategy": ready.strategy,
                    }));
                    snapshot(backend.as_ref(), filter, STAGE_UPDATED).await;
                }
                Ok(ServerEvent::ClientReady { instance_id, .. }) => {
                    emit_action(json!({"action": "client_ready", "instanceId": instance_id}));
                }
                Ok(ServerEvent::Disconnected { .. }) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "server events lagged"),
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
    let _ = client_task.await;
    Ok(())
}
