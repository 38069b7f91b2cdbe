use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::Result;
use crate::paths::Paths;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadConfig {
    #[serde(default = "default_reload_host")]
    pub host: String,
    #[serde(default = "default_reload_port")]
    pub port: u16,
    /// Window in which a burst of change notices collapses into one reload.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_handshake_poll_interval_ms")]
    pub handshake_poll_interval_ms: u64,
    /// Delay used where the browser needs a beat before the next step
    /// (for example between disabling and re-enabling an extension).
    #[serde(default = "default_instant_delay_ms")]
    pub instant_delay_ms: u64,
    /// Delay between a completed reload and the readiness message.
    #[serde(default = "default_readiness_delay_ms")]
    pub readiness_delay_ms: u64,
    #[serde(default = "default_log_dedup_window_ms")]
    pub log_dedup_window_ms: u64,
}

fn default_reload_host() -> String {
    "127.0.0.1".to_string()
}

fn default_reload_port() -> u16 {
    8888
}

fn default_debounce_ms() -> u64 {
    200
}

fn default_keepalive_interval_ms() -> u64 {
    20_000
}

fn default_base_backoff_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_handshake_timeout_ms() -> u64 {
    15_000
}

fn default_handshake_poll_interval_ms() -> u64 {
    500
}

fn default_instant_delay_ms() -> u64 {
    100
}

fn default_readiness_delay_ms() -> u64 {
    1_000
}

fn default_log_dedup_window_ms() -> u64 {
    2_000
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            host: default_reload_host(),
            port: default_reload_port(),
            debounce_ms: default_debounce_ms(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            handshake_poll_interval_ms: default_handshake_poll_interval_ms(),
            instant_delay_ms: default_instant_delay_ms(),
            readiness_delay_ms: default_readiness_delay_ms(),
            log_dedup_window_ms: default_log_dedup_window_ms(),
        }
    }
}

impl ReloadConfig {
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}/", self.host, self.port)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn handshake_poll_interval(&self) -> Duration {
        Duration::from_millis(self.handshake_poll_interval_ms)
    }

    pub fn instant_delay(&self) -> Duration {
        Duration::from_millis(self.instant_delay_ms)
    }

    pub fn readiness_delay(&self) -> Duration {
        Duration::from_millis(self.readiness_delay_ms)
    }

    pub fn log_dedup_window(&self) -> Duration {
        Duration::from_millis(self.log_dedup_window_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrowserEngine {
    #[default]
    Chromium,
    Firefox,
}

impl BrowserEngine {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Chromium => "chromium",
            Self::Firefox => "firefox",
        }
    }
}

impl std::str::FromStr for BrowserEngine {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "chromium" | "chrome" | "edge" => Ok(Self::Chromium),
            "firefox" | "ff" => Ok(Self::Firefox),
            other => Err(crate::error::Error::Config(format!(
                "unknown browser engine '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserConfig {
    #[serde(default)]
    pub engine: BrowserEngine,
    #[serde(default = "default_browser_host")]
    pub host: String,
    #[serde(default = "default_cdp_port")]
    pub cdp_port: u16,
    #[serde(default = "default_rdp_port")]
    pub rdp_port: u16,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_health_check_timeout_ms")]
    pub health_check_timeout_ms: u64,
    #[serde(default = "default_reload_attempts")]
    pub reload_attempts: u32,
    #[serde(default = "default_reload_attempt_spacing_ms")]
    pub reload_attempt_spacing_ms: u64,
    #[serde(default = "default_injection_poll_interval_ms")]
    pub injection_poll_interval_ms: u64,
    #[serde(default = "default_injection_deadline_ms")]
    pub injection_deadline_ms: u64,
    #[serde(default = "default_extension_id_max_retries")]
    pub extension_id_max_retries: u32,
    #[serde(default = "default_extension_id_poll_interval_ms")]
    pub extension_id_poll_interval_ms: u64,
    /// Element id of the host element content scripts mount their UI into.
    #[serde(default = "default_extension_root_id")]
    pub extension_root_id: String,
    #[serde(default = "default_max_capture_bytes")]
    pub max_capture_bytes: usize,
}

fn default_browser_host() -> String {
    "127.0.0.1".to_string()
}

fn default_cdp_port() -> u16 {
    9222
}

fn default_rdp_port() -> u16 {
    6000
}

fn default_command_timeout_ms() -> u64 {
    30_000
}

fn default_health_check_timeout_ms() -> u64 {
    2_000
}

fn default_reload_attempts() -> u32 {
    3
}

fn default_reload_attempt_spacing_ms() -> u64 {
    150
}

fn default_injection_poll_interval_ms() -> u64 {
    250
}

fn default_injection_deadline_ms() -> u64 {
    12_000
}

fn default_extension_id_max_retries() -> u32 {
    20
}

fn default_extension_id_poll_interval_ms() -> u64 {
    200
}

fn default_extension_root_id() -> String {
    "extension-root".to_string()
}

fn default_max_capture_bytes() -> usize {
    2 * 1024 * 1024
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            engine: BrowserEngine::default(),
            host: default_browser_host(),
            cdp_port: default_cdp_port(),
            rdp_port: default_rdp_port(),
            command_timeout_ms: default_command_timeout_ms(),
            health_check_timeout_ms: default_health_check_timeout_ms(),
            reload_attempts: default_reload_attempts(),
            reload_attempt_spacing_ms: default_reload_attempt_spacing_ms(),
            injection_poll_interval_ms: default_injection_poll_interval_ms(),
            injection_deadline_ms: default_injection_deadline_ms(),
            extension_id_max_retries: default_extension_id_max_retries(),
            extension_id_poll_interval_ms: default_extension_id_poll_interval_ms(),
            extension_root_id: default_extension_root_id(),
            max_capture_bytes: default_max_capture_bytes(),
        }
    }
}

impl BrowserConfig {
    pub fn cdp_http_url(&self) -> String {
        format!("http://{}:{}", self.host, self.cdp_port)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn reload_attempt_spacing(&self) -> Duration {
        Duration::from_millis(self.reload_attempt_spacing_ms)
    }

    pub fn injection_poll_interval(&self) -> Duration {
        Duration::from_millis(self.injection_poll_interval_ms)
    }

    pub fn injection_deadline(&self) -> Duration {
        Duration::from_millis(self.injection_deadline_ms)
    }

    pub fn extension_id_poll_interval(&self) -> Duration {
        Duration::from_millis(self.extension_id_poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarnessConfig {
    /// Bound on waiting for each updated page snapshot.
    #[serde(default = "default_iteration_timeout_ms")]
    pub iteration_timeout_ms: u64,
    /// Bound on waiting for the first injected snapshot after spawn.
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    /// Time between SIGTERM and SIGKILL when stopping the target process.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
}

fn default_iteration_timeout_ms() -> u64 {
    30_000
}

fn default_startup_timeout_ms() -> u64 {
    60_000
}

fn default_kill_grace_ms() -> u64 {
    3_000
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            iteration_timeout_ms: default_iteration_timeout_ms(),
            startup_timeout_ms: default_startup_timeout_ms(),
            kill_grace_ms: default_kill_grace_ms(),
        }
    }
}

impl HarnessConfig {
    pub fn iteration_timeout(&self) -> Duration {
        Duration::from_millis(self.iteration_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub reload: ReloadConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub harness: HarnessConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}
