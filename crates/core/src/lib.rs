pub mod config;
pub mod debounce;
pub mod error;
pub mod message;
pub mod paths;
pub mod types;

pub use config::{BrowserConfig, BrowserEngine, Config, HarnessConfig, ReloadConfig};
pub use debounce::Debouncer;
pub use error::{Error, Result};
pub use message::{ChangeNotice, ExtensionReady, ReloadMessage, StatusMessage};
pub use paths::Paths;
pub use types::{
    ChangeEvent, ChangeKind, ConnectionEvent, ConnectionState, InstanceId, ReloadReason,
};

/// Truncate a string to at most `max_bytes` bytes, respecting UTF-8 char boundaries.
pub fn truncate_for_log(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
