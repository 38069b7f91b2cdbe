use std::path::Path;
use std::sync::Arc;

use extdev_core::Config;
use extdev_reload::{read_manifest, service_worker_path, BuildStatus, ReloadServer, ServerEvent, SourceWatcher};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{info, warn};

/// Running server plus the watcher and dispatch loop feeding it.
pub struct ServeHandle {
    pub server: Arc<ReloadServer>,
    pub manifest_name: Option<String>,
    _watcher: SourceWatcher,
    _build: watch::Sender<BuildStatus>,
}

pub async fn start(
    config: &Config,
    ext: &Path,
    shutdown: &broadcast::Sender<()>,
) -> anyhow::Result<ServeHandle> {
    let manifest = read_manifest(ext)?;
    let manifest_name = manifest
        .get("name")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let server = Arc::new(ReloadServer::bind(&config.reload).await?);
    let (change_tx, change_rx) = mpsc::channel(256);
    let watcher = SourceWatcher::start(ext, service_worker_path(&manifest), change_tx)?;

    // No build integration on the command line: the gate stays open.
    let (build_tx, build_rx) = watch::channel(BuildStatus::Ok);
    let dispatcher = server.clone();
    let shutdown_rx = shutdown.subscribe();
    tokio::spawn(async move {
        dispatcher.run_dispatch(change_rx, build_rx, shutdown_rx).await;
    });

    Ok(ServeHandle {
        server,
        manifest_name,
        _watcher: watcher,
        _build: build_tx,
    })
}

pub async fn run(config: &Config, ext: &Path) -> anyhow::Result<()> {
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let handle = start(config, ext, &shutdown_tx).await?;
    println!("reload server: {}", handle.server.ws_url());

    let mut events = handle.server.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(ServerEvent::ClientReady { instance_id, data }) => {
                    info!(instance_id = %instance_id, data = %data, "browser connected");
                }
                Ok(ServerEvent::ExtensionReady { instance_id, ready }) => {
                    info!(instance_id = %instance_id, extension_id = %ready.extension_id, "reload complete");
                }
                Ok(ServerEvent::Disconnected { instance_id }) => {
                    info!(instance_id = ?instance_id, "browser disconnected");
                }
                Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "server events lagged"),
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
    Ok(())
}
