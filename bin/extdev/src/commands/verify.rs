use std::path::PathBuf;

use extdev_core::{Config, Paths};
use extdev_harness::{run_verification, VerificationReport, VerifyOptions};

fn print_report(report: &VerificationReport) {
    println!("run {} ({} probes)", report.run_id, report.results.len());
    for result in &report.results {
        let mark = if result.passed { "✓" } else { "✗" };
        match &result.reason {
            Some(reason) => println!("  {} {} [{}]: {}", mark, result.script_path, result.snapshot_index, reason),
            None => println!("  {} {} [{}]", mark, result.script_path, result.snapshot_index),
        }
    }
    if let Some(reason) = &report.aborted {
        println!("aborted: {}", reason);
    }
    println!("{}", if report.passed { "PASS" } else { "FAIL" });
}

pub async fn run(
    config: &Config,
    ext: PathBuf,
    token_version: Option<String>,
    command: Vec<String>,
    save_report: bool,
) -> anyhow::Result<()> {
    let options = VerifyOptions {
        extension_root: ext,
        command,
        token_version,
    };
    let report = run_verification(&options, &config.harness).await?;
    print_report(&report);
    if save_report {
        let path = report.save(&Paths::new())?;
        println!("report: {}", path.display());
    }
    if !report.passed {
        anyhow::bail!("verification failed");
    }
    Ok(())
}
