use serde::{Deserialize, Serialize};

use crate::probe::ProbeExpectation;

pub const REASON_MISSING_SNAPSHOT: &str = "missing updated snapshot";
pub const REASON_TOKEN_NOT_FOUND: &str = "token not found";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HmrIterationResult {
    pub script_path: String,
    pub expected_token: String,
    pub snapshot_index: usize,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Iteration `k` is scored against snapshot `k` only.
pub fn evaluate_deterministic_hmr_iterations(
    expectations: &[ProbeExpectation],
    snapshots: &[String],
) -> Vec<HmrIterationResult> {
    expectations
        .iter()
        .enumerate()
        .map(|(index, expectation)| {
            let reason = match snapshots.get(index) {
                None => Some(REASON_MISSING_SNAPSHOT),
                Some(html) if !html.contains(&expectation.expected_token) => {
                    Some(REASON_TOKEN_NOT_FOUND)
                }
                Some(_) => None,
            };
            HmrIterationResult {
                script_path: expectation.script_path.clone(),
                expected_token: expectation.expected_token.clone(),
                snapshot_index: index,
                passed: reason.is_none(),
                reason: reason.map(|r| r.to_string()),
            }
        })
        .collect()
}

pub fn all_passed(results: &[HmrIterationResult]) -> bool {
    !results.is_empty() && results.iter().all(|r| r.passed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{build_content_script_probe_plan, build_iteration_expectations};
    use serde_json::json;

    fn two_expectations() -> Vec<ProbeExpectation> {
        let plan = build_content_script_probe_plan(&json!({
            "content_scripts": [{"js": ["a.js", "b.js"]}]
        }));
        build_iteration_expectations(&plan, "1")
    }

    #[test]
    fn test_all_pass() {
        let exp = two_expectations();
        let snapshots = vec![
            format!("<html data-x=\"{}\">", exp[0].expected_token),
            format!("<html data-y=\"{}\">", exp[1].expected_token),
        ];
        let results = evaluate_deterministic_hmr_iterations(&exp, &snapshots);
        assert!(all_passed(&results));
        assert_eq!(results[1].snapshot_index, 1);
    }

    #[test]
    fn test_missing_token_and_missing_snapshot() {
        let exp = two_expectations();
        let results =
            evaluate_deterministic_hmr_iterations(&exp, &["<html></html>".to_string()]);
        assert!(!results[0].passed);
        assert!(results[0].reason.as_deref().unwrap().contains("not found"));
        assert!(!results[1].passed);
        assert!(results[1].reason.as_deref().unwrap().starts_with("missing"));
        assert!(results[1].reason.as_deref().unwrap().contains("snapshot"));
    }

    #[test]
    fn test_pairing_is_positional() {
        let exp = two_expectations();
        // Right tokens, wrong order.
        let snapshots = vec![exp[1].expected_token.clone(), exp[0].expected_token.clone()];
        let results = evaluate_deterministic_hmr_iterations(&exp, &snapshots);
        assert!(results.iter().all(|r| !r.passed));
        assert!(!all_passed(&[]));
    }
}
