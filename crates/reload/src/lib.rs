pub mod backoff;
pub mod client;
pub mod dedup;
pub mod server;
pub mod watcher;

pub use backoff::ReconnectPolicy;
pub use client::{ClientExit, ClientSession, DevExtensions, ReloadClient};
pub use dedup::{dedup_key, LogDeduper};
pub use server::{BuildStatus, ReloadServer, ServerEvent};
pub use watcher::{classify_path, read_manifest, service_worker_path, SourceWatcher};
