use std::path::PathBuf;

use chrono::{DateTime, Utc};
use extdev_core::{Paths, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::probe::ProbeExpectation;
use crate::score::{all_passed, HmrIterationResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub run_id: String,
    pub extension_root: String,
    pub token_version: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub expectations: Vec<ProbeExpectation>,
    pub results: Vec<HmrIterationResult>,
    pub passed: bool,
    /// Set when the run stopped early (spawn failure, startup timeout).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}

impl VerificationReport {
    pub fn new(
        run_id: String,
        extension_root: String,
        token_version: String,
        started_at: DateTime<Utc>,
        expectations: Vec<ProbeExpectation>,
        results: Vec<HmrIterationResult>,
    ) -> Self {
        let passed = all_passed(&results);
        Self {
            run_id,
            extension_root,
            token_version,
            started_at,
            finished_at: Utc::now(),
            expectations,
            results,
            passed,
            aborted: None,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &HmrIterationResult> {
        self.results.iter().filter(|r| !r.passed)
    }

    pub fn save(&self, paths: &Paths) -> Result<PathBuf> {
        paths.ensure_dirs()?;
        let path = paths.report_file(&self.run_id);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        info!(path = %path.display(), passed = self.passed, "verification report saved");
        Ok(path)
    }
}
