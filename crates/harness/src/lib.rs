//! Deterministic live-reload verification: derive probes from a manifest,
//! drive a target process, and score the page snapshots it reports.

pub mod ndjson;
pub mod probe;
pub mod report;
pub mod runner;
pub mod score;
pub mod verify;

pub use ndjson::{extract_updated_html_from_ndjson, parse_event_line, HarnessEvent};
pub use probe::{
    build_content_script_probe_plan, build_iteration_expectations, probe_id, ContentScriptProbe,
    ProbeExpectation, ProbeSources,
};
pub use report::VerificationReport;
pub use runner::TargetProcess;
pub use score::{evaluate_deterministic_hmr_iterations, HmrIterationResult};
pub use verify::{run_verification, VerifyOptions};
