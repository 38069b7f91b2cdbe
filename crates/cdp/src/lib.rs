//! Browser automation for extension development: a Chromium DevTools
//! client, a Firefox remote debugging client, and the reload and capture
//! operations built on them.

pub mod backend;
pub mod capture;
pub mod client;
pub mod extension;
pub mod rdp;
pub mod reload;
pub mod wire;

pub use backend::{connect_backend, AutomationBackend, ChromiumBackend, ExtensionSpec, FirefoxBackend};
pub use capture::{DomDiff, DomSnapshot, HtmlSummary};
pub use client::{CdpClient, TargetInfo};
pub use extension::ExtensionHandle;
pub use rdp::RdpClient;
pub use reload::{ExtensionControl, ReloadChain, ReloadOutcome, ReloadStrategy, StrategyFailure};
pub use wire::{CdpEvent, WireClient};
