use std::path::{Path, PathBuf};

use extdev_core::{ChangeEvent, ChangeKind, Error, Result};
use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const IGNORED_DIRS: &[&str] = &[".git", "node_modules", ".cache"];

pub fn read_manifest(root: &Path) -> Result<Value> {
    let path = root.join("manifest.json");
    let content = std::fs::read_to_string(&path)
        .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
    Ok(serde_json::from_str(&content)?)
}

/// Background worker script declared by a manifest (MV3 service worker or
/// the first MV2 background script).
pub fn service_worker_path(manifest: &Value) -> Option<String> {
    let background = manifest.get("background")?;
    background
        .get("service_worker")
        .and_then(|v| v.as_str())
        .or_else(|| {
            background
                .get("scripts")
                .and_then(|v| v.as_array())
                .and_then(|a| a.first())
                .and_then(|v| v.as_str())
        })
        .map(|s| s.to_string())
}

/// Classify an absolute event path against the watched root. Paths outside
/// the root or under ignored directories yield `None`.
pub fn classify_path(root: &Path, path: &Path, service_worker: Option<&str>) -> Option<ChangeEvent> {
    let relative = path.strip_prefix(root).ok()?;
    if relative.as_os_str().is_empty() {
        return None;
    }
    if relative
        .components()
        .any(|c| IGNORED_DIRS.iter().any(|d| c.as_os_str() == *d))
    {
        return None;
    }
    let kind = ChangeKind::classify(relative, service_worker);
    let file = relative.to_string_lossy().replace('\\', "/");
    Some(ChangeEvent::new(kind, file))
}

pub struct SourceWatcher {
    _watcher: RecommendedWatcher,
    root: PathBuf,
}

impl SourceWatcher {
    /// Watch `root` recursively and push classified changes into `tx`.
    pub fn start(
        root: &Path,
        service_worker: Option<String>,
        tx: mpsc::Sender<ChangeEvent>,
    ) -> Result<Self> {
        let root = root
            .canonicalize()
            .map_err(|e| Error::Config(format!("cannot watch {}: {}", root.display(), e)))?;

        let handler_root = root.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "watch error");
                        return;
                    }
                };
                if !matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    return;
                }
                for path in &event.paths {
                    if let Some(change) =
                        classify_path(&handler_root, path, service_worker.as_deref())
                    {
                        debug!(file = %change.file, kind = ?change.kind, "source changed");
                        if tx.blocking_send(change).is_err() {
                            return;
                        }
                    }
                }
            },
            Config::default(),
        )
        .map_err(|e| Error::Other(format!("failed to create watcher: {}", e)))?;

        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| Error::Other(format!("failed to watch {}: {}", root.display(), e)))?;
        info!(path = %root.display(), "watching extension sources");

        Ok(Self {
            _watcher: watcher,
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
