use extdev_cdp::{ExtensionSpec, HtmlSummary};
use extdev_core::Config;
use tracing::warn;

use super::{extension_spec, open_backend};
use crate::ExtensionArgs;

pub async fn reload(config: &Config, args: &ExtensionArgs) -> anyhow::Result<()> {
    let backend = open_backend(config).await?;
    let mut handle = backend.attach_extension(&extension_spec(args, None)).await?;
    let outcome = backend.reload_extension(&handle.extension_id).await;
    if !outcome.success() {
        warn!(extension_id = %handle.extension_id, "every reload strategy failed");
    }
    handle.record(outcome);
    println!("{}", serde_json::to_string_pretty(&handle)?);
    Ok(())
}

pub async fn capture(
    config: &Config,
    url_filter: Option<&str>,
    summary: bool,
    wait_injection: bool,
) -> anyhow::Result<()> {
    let backend = open_backend(config).await?;
    if wait_injection && !backend.wait_for_injection(url_filter).await? {
        warn!("content script not detected before deadline, capturing anyway");
    }
    let html = backend.capture_page(url_filter).await?;
    if summary {
        let summary = HtmlSummary::from_html(&html, &config.browser.extension_root_id);
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", html);
    }
    Ok(())
}

pub async fn ext_id(config: &Config, name: Option<&str>) -> anyhow::Result<()> {
    let backend = open_backend(config).await?;
    let spec = ExtensionSpec {
        name: name.map(|s| s.to_string()),
        ..ExtensionSpec::default()
    };
    let handle = backend.attach_extension(&spec).await?;
    println!("{}", handle.extension_id);
    Ok(())
}
