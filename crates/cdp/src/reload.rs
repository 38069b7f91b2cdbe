use std::time::Duration;

use async_trait::async_trait;
use extdev_core::{BrowserConfig, Error, ReloadConfig, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Low-level reload primitives a browser backend exposes.
#[async_trait]
pub trait ExtensionControl: Send + Sync {
    async fn set_enabled(&self, extension_id: &str, enabled: bool) -> Result<()>;
    /// Succeeds once the extension answers again, within `timeout`.
    async fn ping(&self, extension_id: &str, timeout: Duration) -> Result<()>;
    /// Browser-protocol reload command.
    async fn protocol_reload(&self, extension_id: &str) -> Result<()>;
    /// In-extension `runtime.reload()`.
    async fn runtime_reload(&self, extension_id: &str) -> Result<()>;
}

#[async_trait]
pub trait ReloadStrategy<C: ?Sized + Sync>: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self, control: &C, extension_id: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyFailure {
    pub strategy: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadOutcome {
    pub extension_id: String,
    /// Strategy that succeeded, if any.
    pub strategy: Option<String>,
    pub failures: Vec<StrategyFailure>,
}

impl ReloadOutcome {
    pub fn success(&self) -> bool {
        self.strategy.is_some()
    }

    pub fn into_result(self) -> Result<ReloadOutcome> {
        if self.success() {
            return Ok(self);
        }
        let summary = self
            .failures
            .iter()
            .map(|f| format!("{}: {}", f.strategy, f.reason))
            .collect::<Vec<_>>()
            .join("; ");
        Err(Error::ReloadFailed(format!("{} ({})", self.extension_id, summary)))
    }
}

pub struct ReloadChain<C: ?Sized + Sync> {
    strategies: Vec<Box<dyn ReloadStrategy<C>>>,
}

impl<C: ?Sized + Sync> ReloadChain<C> {
    pub fn new(strategies: Vec<Box<dyn ReloadStrategy<C>>>) -> Self {
        Self { strategies }
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub async fn run(&self, control: &C, extension_id: &str) -> ReloadOutcome {
        let mut failures = Vec::new();
        for strategy in &self.strategies {
            debug!(strategy = strategy.name(), extension_id, "trying reload strategy");
            match strategy.run(control, extension_id).await {
                Ok(()) => {
                    info!(strategy = strategy.name(), extension_id, "extension reloaded");
                    return ReloadOutcome {
                        extension_id: extension_id.to_string(),
                        strategy: Some(strategy.name().to_string()),
                        failures,
                    };
                }
                Err(e) => {
                    warn!(strategy = strategy.name(), extension_id, error = %e, "reload strategy failed");
                    failures.push(StrategyFailure {
                        strategy: strategy.name().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        ReloadOutcome {
            extension_id: extension_id.to_string(),
            strategy: None,
            failures,
        }
    }
}

impl ReloadChain<dyn ExtensionControl> {
    /// Graceful toggle first, then the protocol fallback.
    pub fn chromium(browser: &BrowserConfig, reload: &ReloadConfig) -> Self {
        Self::new(vec![
            Box::new(GracefulToggle {
                settle_delay: reload.instant_delay(),
                health_timeout: browser.health_check_timeout(),
            }),
            Box::new(ProtocolFallback {
                attempts: browser.reload_attempts.max(1),
                spacing: browser.reload_attempt_spacing(),
            }),
        ])
    }
}

/// Disable, wait briefly, enable, then require a health ping.
pub struct GracefulToggle {
    pub settle_delay: Duration,
    pub health_timeout: Duration,
}

#[async_trait]
impl ReloadStrategy<dyn ExtensionControl> for GracefulToggle {
    fn name(&self) -> &'static str {
        "graceful-toggle"
    }

    async fn run(&self, control: &dyn ExtensionControl, extension_id: &str) -> Result<()> {
        control.set_enabled(extension_id, false).await?;
        tokio::time::sleep(self.settle_delay).await;
        control.set_enabled(extension_id, true).await?;
        control
            .ping(extension_id, self.health_timeout)
            .await
            .map_err(|e| Error::ReloadFailed(format!("health check failed after toggle: {}", e)))
    }
}

/// Protocol reload retried `attempts` times. After failed attempt `i`
/// (1-based) the next one waits `spacing * i`. A missing protocol command
/// falls through to `runtime.reload()` within the same attempt.
pub struct ProtocolFallback {
    pub attempts: u32,
    pub spacing: Duration,
}

impl ProtocolFallback {
    async fn attempt(&self, control: &dyn ExtensionControl, extension_id: &str) -> Result<()> {
        match control.protocol_reload(extension_id).await {
            Err(e) if e.is_method_not_found() => {
                debug!(extension_id, "protocol reload unsupported, using runtime.reload");
                control.runtime_reload(extension_id).await
            }
            other => other,
        }
    }
}

#[async_trait]
impl ReloadStrategy<dyn ExtensionControl> for ProtocolFallback {
    fn name(&self) -> &'static str {
        "protocol-fallback"
    }

    async fn run(&self, control: &dyn ExtensionControl, extension_id: &str) -> Result<()> {
        let mut last_error = None;
        for index in 1..=self.attempts {
            match self.attempt(control, extension_id).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(extension_id, attempt = index, error = %e, "reload attempt failed");
                    last_error = Some(e);
                }
            }
            if index < self.attempts {
                tokio::time::sleep(self.spacing * index).await;
            }
        }
        Err(Error::ReloadFailed(format!(
            "{} attempts failed, last error: {}",
            self.attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Scripted control: counts calls and fails according to its knobs.
    #[derive(Default)]
    pub(crate) struct FakeControl {
        pub toggles: Mutex<Vec<bool>>,
        pub ping_ok: bool,
        pub protocol_failures_before_success: u32,
        pub protocol_missing: bool,
        pub runtime_ok: bool,
        pub protocol_calls: AtomicU32,
        pub runtime_calls: AtomicU32,
    }

    #[async_trait]
    impl ExtensionControl for FakeControl {
        async fn set_enabled(&self, _extension_id: &str, enabled: bool) -> Result<()> {
            self.toggles.lock().unwrap().push(enabled);
            Ok(())
        }

        async fn ping(&self, _extension_id: &str, _timeout: Duration) -> Result<()> {
            if self.ping_ok {
                Ok(())
            } else {
                Err(Error::Timeout("no answer".to_string()))
            }
        }

        async fn protocol_reload(&self, _extension_id: &str) -> Result<()> {
            let n = self.protocol_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.protocol_missing {
                return Err(Error::remote(json!({
                    "code": -32601,
                    "message": "'Extensions.reload' wasn't found"
                })));
            }
            if n <= self.protocol_failures_before_success {
                Err(Error::Remote {
                    code: -32000,
                    message: "busy".to_string(),
                    data: json!({}),
                })
            } else {
                Ok(())
            }
        }

        async fn runtime_reload(&self, _extension_id: &str) -> Result<()> {
            self.runtime_calls.fetch_add(1, Ordering::SeqCst);
            if self.runtime_ok {
                Ok(())
            } else {
                Err(Error::JsException("chrome.runtime is undefined".to_string()))
            }
        }
    }

    fn fast_chain(attempts: u32) -> ReloadChain<dyn ExtensionControl> {
        ReloadChain::new(vec![
            Box::new(GracefulToggle {
                settle_delay: Duration::from_millis(1),
                health_timeout: Duration::from_millis(5),
            }),
            Box::new(ProtocolFallback {
                attempts,
                spacing: Duration::from_millis(1),
            }),
        ])
    }

    #[tokio::test]
    async fn test_graceful_toggle_wins_when_healthy() {
        let control = FakeControl {
            ping_ok: true,
            ..Default::default()
        };
        let outcome = fast_chain(3).run(&control, "ext").await;
        assert_eq!(outcome.strategy.as_deref(), Some("graceful-toggle"));
        assert!(outcome.failures.is_empty());
        assert_eq!(*control.toggles.lock().unwrap(), vec![false, true]);
        assert_eq!(control.protocol_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fallback_after_failed_health_check() {
        let control = FakeControl {
            ping_ok: false,
            protocol_failures_before_success: 2,
            ..Default::default()
        };
        let outcome = fast_chain(3).run(&control, "ext").await;
        assert!(outcome.success());
        assert_eq!(outcome.strategy.as_deref(), Some("protocol-fallback"));
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].strategy, "graceful-toggle");
        assert_eq!(control.protocol_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_missing_protocol_command_uses_runtime_reload() {
        let control = FakeControl {
            protocol_missing: true,
            runtime_ok: true,
            ..Default::default()
        };
        let outcome = fast_chain(3).run(&control, "ext").await;
        assert_eq!(outcome.strategy.as_deref(), Some("protocol-fallback"));
        assert_eq!(control.protocol_calls.load(Ordering::SeqCst), 1);
        assert_eq!(control.runtime_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_strategies_fail() {
        let control = FakeControl {
            protocol_failures_before_success: u32::MAX,
            ..Default::default()
        };
        let outcome = fast_chain(3).run(&control, "ext").await;
        assert!(!outcome.success());
        assert_eq!(outcome.failures.len(), 2);
        assert!(outcome.failures[1].reason.contains("3 attempts failed"));
        assert_eq!(control.runtime_calls.load(Ordering::SeqCst), 0);
        assert!(matches!(outcome.into_result(), Err(Error::ReloadFailed(_))));
    }

    #[tokio::test]
    async fn test_attempt_spacing_grows_with_index() {
        let control = FakeControl {
            protocol_failures_before_success: u32::MAX,
            ..Default::default()
        };
        let strategy = ProtocolFallback {
            attempts: 3,
            spacing: Duration::from_millis(10),
        };
        let started = std::time::Instant::now();
        assert!(strategy.run(&control, "ext").await.is_err());
        // 10ms after the first failure, 20ms after the second.
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_default_chain_order() {
        let chain = ReloadChain::chromium(&BrowserConfig::default(), &ReloadConfig::default());
        assert_eq!(chain.strategy_names(), vec!["graceful-toggle", "protocol-fallback"]);
    }
}
