use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Identifier of one running browser instance. Reconnections reuse it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string()[..12].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    Manifest,
    Locales,
    ServiceWorker,
    Generic,
}

impl ChangeKind {
    /// Classify a changed file relative to the extension root.
    ///
    /// `service_worker` is the background worker path declared by the
    /// manifest, if any.
    pub fn classify(file: &Path, service_worker: Option<&str>) -> Self {
        let normalized = file.to_string_lossy().replace('\\', "/");

        if file.file_name().and_then(|n| n.to_str()) == Some("manifest.json") {
            return Self::Manifest;
        }
        if normalized.split('/').any(|part| part == "_locales") {
            return Self::Locales;
        }
        if let Some(sw) = service_worker {
            let sw = sw.trim_start_matches("./").trim_start_matches('/');
            if !sw.is_empty() && (normalized == sw || normalized.ends_with(&format!("/{}", sw))) {
                return Self::ServiceWorker;
            }
        }
        Self::Generic
    }
}

/// A detected source change, consumed once by the reload channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub file: String,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, file: impl Into<String>) -> Self {
        Self {
            kind,
            file: file.into(),
        }
    }

    pub fn reload_reason(&self) -> ReloadReason {
        ReloadReason::from(self.kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ReloadReason {
    Manifest,
    Locales,
    ServiceWorker,
    #[default]
    None,
}

impl ReloadReason {
    fn rank(self) -> u8 {
        match self {
            Self::Manifest => 3,
            Self::ServiceWorker => 2,
            Self::Locales => 1,
            Self::None => 0,
        }
    }

    /// Keep the stronger of two reasons seen within one debounce window.
    pub fn merge(self, other: ReloadReason) -> ReloadReason {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl From<ChangeKind> for ReloadReason {
    fn from(kind: ChangeKind) -> Self {
        match kind {
            ChangeKind::Manifest => Self::Manifest,
            ChangeKind::Locales => Self::Locales,
            ChangeKind::ServiceWorker => Self::ServiceWorker,
            ChangeKind::Generic => Self::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Opened,
    Closed,
    Retry,
}

impl ConnectionState {
    /// Transition table for a reload-channel connection. `None` means the
    /// event is not valid in the current state.
    pub fn on(self, event: ConnectionEvent) -> Option<ConnectionState> {
        use crate::types::ConnectionEvent as Ev;
        use crate::types::ConnectionState as St;
        match (self, event) {
            (St::Connecting, Ev::Opened) => Some(St::Open),
            (St::Connecting, Ev::Closed) | (St::Open, Ev::Closed) => Some(St::Closed),
            (St::Closed, Ev::Retry) => Some(St::Connecting),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}
