use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use extdev_core::{Error, HarnessConfig, Result};
use tracing::{info, warn};

use crate::ndjson::{extract_updated_html_from_ndjson, STAGE_POST_INJECTION};
use crate::probe::{build_content_script_probe_plan, build_iteration_expectations, ProbeSources};
use crate::report::VerificationReport;
use crate::runner::TargetProcess;
use crate::score::evaluate_deterministic_hmr_iterations;

/// Upper bound on reading output left over after the target stops.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct VerifyOptions {
    pub extension_root: PathBuf,
    /// Program and arguments of the process that emits page snapshots.
    pub command: Vec<String>,
    pub token_version: Option<String>,
}

pub fn new_run_id() -> String {
    format!(
        "{}-{}",
        Utc::now().format("%Y%m%dT%H%M%S"),
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    )
}

fn read_manifest(root: &Path) -> Result<serde_json::Value> {
    let path = root.join("manifest.json");
    let content = std::fs::read_to_string(&path)
        .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
    Ok(serde_json::from_str(&content)?)
}

pub async fn run_verification(options: &VerifyOptions, config: &HarnessConfig) -> Result<VerificationReport> {
    let started_at = Utc::now();
    let run_id = new_run_id();
    let token_version = options
        .token_version
        .clone()
        .unwrap_or_else(|| run_id.clone());

    let manifest = read_manifest(&options.extension_root)?;
    let plan = build_content_script_probe_plan(&manifest);
    if plan.is_empty() {
        return Err(Error::Config("manifest declares no content scripts".to_string()));
    }
    let expectations = build_iteration_expectations(&plan, &token_version);
    info!(run_id = %run_id, probes = expectations.len(), "verification starting");

    let (program, args) = options
        .command
        .split_first()
        .ok_or_else(|| Error::Config("no target command given".to_string()))?;
    let mut target = TargetProcess::spawn(program, args, Some(&options.extension_root))?;
    let mut sources = ProbeSources::new(&options.extension_root);

    let mut aborted = None;
    match target
        .wait_for_event(config.startup_timeout(), |e| {
            matches!(e, crate::ndjson::HarnessEvent::PageHtml { stage, .. } if stage == STAGE_POST_INJECTION)
        })
        .await
    {
        Ok(_) => {
            for (index, expectation) in expectations.iter().enumerate() {
                if let Err(e) = sources.apply(expectation) {
                    warn!(index, error = %e, "probe not written");
                    aborted = Some(e.to_string());
                    break;
                }
                match target
                    .wait_for_event(config.iteration_timeout(), |e| e.is_updated_html())
                    .await
                {
                    Ok(_) => info!(index, script = %expectation.script_path, "snapshot received"),
                    Err(e) => {
                        warn!(index, error = %e, "no updated snapshot");
                        break;
                    }
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "target never reported an injected page");
            aborted = Some(e.to_string());
        }
    }

    if let Err(e) = sources.restore() {
        warn!(error = %e, "failed to restore content scripts");
    }
    match target.terminate(config.kill_grace()).await {
        Ok(status) => info!(status = %status, "target process stopped"),
        Err(e) => warn!(error = %e, "failed to stop target process"),
    }
    target.drain(DRAIN_TIMEOUT).await;

    let snapshots = extract_updated_html_from_ndjson(target.transcript());
    let results = evaluate_deterministic_hmr_iterations(&expectations, &snapshots);
    let mut report = VerificationReport::new(
        run_id,
        options.extension_root.display().to_string(),
        token_version,
        started_at,
        expectations,
        results,
    );
    report.aborted = aborted;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::score::REASON_MISSING_SNAPSHOT;

    fn fast_config() -> HarnessConfig {
        HarnessConfig {
            iteration_timeout_ms: 2_000,
            startup_timeout_ms: 2_000,
            kill_grace_ms: 500,
        }
    }

    fn extension(scripts: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let manifest = serde_json::json!({
            "manifest_version": 3,
            "name": "Probe Demo",
            "content_scripts": [{"matches": ["<all_urls>"], "js": scripts}]
        });
        std::fs::write(dir.path().join("manifest.json"), manifest.to_string()).unwrap();
        for script in scripts {
            std::fs::write(dir.path().join(script), "console.log('hi');\n").unwrap();
        }
        dir
    }

    fn options(root: &Path, script: &str) -> VerifyOptions {
        VerifyOptions {
            extension_root: root.to_path_buf(),
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            token_version: Some("t1".to_string()),
        }
    }

    #[tokio::test]
    async fn test_scripted_target_passes() {
        let dir = extension(&["a.js", "b.js"]);
        let script = r#"
echo '{"type":"page_html","stage":"post_injection","html":"<p>start</p>"}'
echo '{"type":"page_html","stage":"updated","html":"<p>extjs-hmr-probe-a-js:t1</p>"}'
echo '{"type":"page_html","stage":"updated","html":"<p>extjs-hmr-probe-b-js:t1</p>"}'
sleep 30
"#;
        let report = run_verification(&options(dir.path(), script), &fast_config())
            .await
            .unwrap();
        assert!(report.passed, "{:?}", report.results);
        assert!(report.aborted.is_none());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.js")).unwrap(),
            "console.log('hi');\n"
        );
    }

    #[tokio::test]
    async fn test_missing_snapshot_fails_the_iteration() {
        let dir = extension(&["a.js", "b.js"]);
        let script = r#"
echo '{"type":"page_html","stage":"post_injection","html":"<p>start</p>"}'
echo '{"type":"page_html","stage":"updated","html":"<p>extjs-hmr-probe-a-js:t1</p>"}'
sleep 30
"#;
        let config = HarnessConfig {
            iteration_timeout_ms: 200,
            ..fast_config()
        };
        let report = run_verification(&options(dir.path(), script), &config)
            .await
            .unwrap();
        assert!(!report.passed);
        assert!(report.results[0].passed);
        assert_eq!(report.results[1].reason.as_deref(), Some(REASON_MISSING_SNAPSHOT));
    }

    #[tokio::test]
    async fn test_startup_timeout_aborts() {
        let dir = extension(&["a.js"]);
        let config = HarnessConfig {
            startup_timeout_ms: 100,
            ..fast_config()
        };
        let report = run_verification(&options(dir.path(), "sleep 30"), &config)
            .await
            .unwrap();
        assert!(!report.passed);
        assert!(report.aborted.is_some());
    }

    #[tokio::test]
    async fn test_manifest_without_content_scripts_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("manifest.json"), r#"{"name":"x"}"#).unwrap();
        let res = run_verification(&options(dir.path(), "true"), &fast_config()).await;
        assert!(matches!(res, Err(Error::Config(_))));
    }
}
