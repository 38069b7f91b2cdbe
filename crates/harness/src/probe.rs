use std::path::{Path, PathBuf};

use extdev_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub const PROBE_PREFIX: &str = "extjs-hmr-probe-";
const MAX_PROBE_ID_LEN: usize = 80;
const TRUNCATED_SLUG_LEN: usize = 55;

const BLOCK_START: &str = "// extdev-probe:start";
const BLOCK_END: &str = "// extdev-probe:end";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentScriptProbe {
    pub script_path: String,
    pub probe_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeExpectation {
    pub script_path: String,
    pub probe_id: String,
    pub expected_token: String,
}

/// Every `content_scripts[].js` entry in declaration order, first
/// occurrence wins.
pub fn build_content_script_probe_plan(manifest: &Value) -> Vec<ContentScriptProbe> {
    let mut plan: Vec<ContentScriptProbe> = Vec::new();
    let groups = manifest
        .get("content_scripts")
        .and_then(|v| v.as_array())
        .map(|a| a.as_slice())
        .unwrap_or_default();

    for group in groups {
        let scripts = group
            .get("js")
            .and_then(|v| v.as_array())
            .map(|a| a.as_slice())
            .unwrap_or_default();
        for script in scripts.iter().filter_map(|v| v.as_str()) {
            if plan.iter().any(|p| p.script_path == script) {
                continue;
            }
            plan.push(ContentScriptProbe {
                script_path: script.to_string(),
                probe_id: probe_id(script),
            });
        }
    }
    plan
}

pub fn build_iteration_expectations(
    plan: &[ContentScriptProbe],
    token_version: &str,
) -> Vec<ProbeExpectation> {
    plan.iter()
        .map(|p| ProbeExpectation {
            script_path: p.script_path.clone(),
            probe_id: p.probe_id.clone(),
            expected_token: format!("{}:{}", p.probe_id, token_version),
        })
        .collect()
}

/// Lower-case, runs of non-alphanumerics become one `-`, no leading or
/// trailing dashes.
pub fn slug(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut dash = false;
    for c in path.chars() {
        if c.is_ascii_alphanumeric() {
            if dash && !out.is_empty() {
                out.push('-');
            }
            dash = false;
            out.push(c.to_ascii_lowercase());
        } else {
            dash = true;
        }
    }
    out
}

/// 32-bit FNV-1a.
pub fn fnv1a(input: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in input.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Stable, length-bounded probe id for a script path.
pub fn probe_id(script_path: &str) -> String {
    let body = slug(script_path);
    if PROBE_PREFIX.len() + body.len() <= MAX_PROBE_ID_LEN {
        return format!("{}{}", PROBE_PREFIX, body);
    }
    let head = body[..TRUNCATED_SLUG_LEN].trim_end_matches('-');
    format!("{}{}-{:08x}", PROBE_PREFIX, head, fnv1a(script_path))
}

/// Replace (or append) the probe block so that loading the script marks
/// the document with `data-<probeId>="<token>"`.
pub fn inject_probe(source: &str, probe_id: &str, token: &str) -> String {
    let block = format!(
        "{start}\ntry {{ document.documentElement.setAttribute({attr}, {value}); }} catch (_) {{}}\n{end}",
        start = BLOCK_START,
        attr = serde_json::to_string(&format!("data-{}", probe_id)).unwrap_or_default(),
        value = serde_json::to_string(token).unwrap_or_default(),
        end = BLOCK_END,
    );
    if let Some((before, after)) = split_block(source) {
        return format!("{}{}{}", before, block, after);
    }
    let mut out = source.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&block);
    out.push('\n');
    out
}

/// Source text before and after an existing probe block.
fn split_block(source: &str) -> Option<(&str, &str)> {
    let start = source.find(BLOCK_START)?;
    let end_rel = source[start..].find(BLOCK_END)?;
    let end = start + end_rel + BLOCK_END.len();
    Some((&source[..start], &source[end..]))
}

/// Probe edits applied to an extension tree; `restore` puts the original
/// sources back.
#[derive(Debug)]
pub struct ProbeSources {
    root: PathBuf,
    originals: Vec<(PathBuf, String)>,
}

impl ProbeSources {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            originals: Vec::new(),
        }
    }

    /// Write the probe for one expectation into its script.
    pub fn apply(&mut self, expectation: &ProbeExpectation) -> Result<PathBuf> {
        let path = self.root.join(&expectation.script_path);
        let source = std::fs::read_to_string(&path).map_err(|e| {
            Error::NotFound(format!("content script {}: {}", path.display(), e))
        })?;
        if !self.originals.iter().any(|(p, _)| p == &path) {
            self.originals.push((path.clone(), source.clone()));
        }
        let updated = inject_probe(&source, &expectation.probe_id, &expectation.expected_token);
        std::fs::write(&path, updated)?;
        debug!(script = %expectation.script_path, token = %expectation.expected_token, "probe written");
        Ok(path)
    }

    pub fn restore(&mut self) -> Result<()> {
        for (path, original) in self.originals.drain(..) {
            std::fs::write(&path, original)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_probe_id_short_path() {
        assert_eq!(
            probe_id("src/content_scripts/a.ts"),
            "extjs-hmr-probe-src-content-scripts-a-ts"
        );
        assert_eq!(slug("--Foo__Bar..js--"), "foo-bar-js");
    }

    #[test]
    fn test_probe_id_long_path_is_bounded_and_stable() {
        let path = format!("src/{}/content.ts", "very_long_directory_name/".repeat(6));
        let id = probe_id(&path);
        assert!(id.len() <= 80, "{} is {} chars", id, id.len());
        assert!(id.starts_with(PROBE_PREFIX));
        let suffix = &id[id.len() - 8..];
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(suffix, format!("{:08x}", fnv1a(&path)));
        assert_eq!(id, probe_id(&path));
    }

    #[test]
    fn test_fnv1a_reference_values() {
        assert_eq!(fnv1a(""), 0x811c9dc5);
        assert_eq!(fnv1a("a"), 0xe40c292c);
    }

    #[test]
    fn test_plan_dedups_in_declaration_order() {
        let manifest = json!({
            "content_scripts": [
                {"matches": ["<all_urls>"], "js": ["b.js", "a.js"]},
                {"matches": ["https://x/*"], "js": ["a.js", "c.js"]},
                {"matches": ["https://y/*"], "css": ["s.css"]}
            ]
        });
        let plan = build_content_script_probe_plan(&manifest);
        let paths: Vec<&str> = plan.iter().map(|p| p.script_path.as_str()).collect();
        assert_eq!(paths, vec!["b.js", "a.js", "c.js"]);
        assert!(build_content_script_probe_plan(&json!({"name": "x"})).is_empty());
    }

    #[test]
    fn test_expectations() {
        let plan = build_content_script_probe_plan(&json!({"content_scripts": [{"js": ["a.js"]}]}));
        let exp = build_iteration_expectations(&plan, "v7");
        assert_eq!(exp.len(), 1);
        assert_eq!(exp[0].expected_token, "extjs-hmr-probe-a-js:v7");
    }

    #[test]
    fn test_inject_probe_replaces_existing_block() {
        let once = inject_probe("console.log(1);", "p", "p:1");
        assert!(once.starts_with("console.log(1);\n"));
        assert!(once.contains(r#"setAttribute("data-p", "p:1")"#));

        let twice = inject_probe(&once, "p", "p:2");
        assert!(twice.contains("p:2"));
        assert!(!twice.contains("p:1"));
        assert_eq!(twice.matches(BLOCK_START).count(), 1);
    }

    #[test]
    fn test_probe_sources_apply_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.js"), "let x = 1;\n").unwrap();
        let exp = ProbeExpectation {
            script_path: "a.js".to_string(),
            probe_id: "extjs-hmr-probe-a-js".to_string(),
            expected_token: "extjs-hmr-probe-a-js:t".to_string(),
        };
        let mut sources = ProbeSources::new(dir.path());
        sources.apply(&exp).unwrap();
        sources.apply(&exp).unwrap();
        let written = std::fs::read_to_string(dir.path().join("a.js")).unwrap();
        assert!(written.contains("extjs-hmr-probe-a-js:t"));

        sources.restore().unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("a.js")).unwrap(), "let x = 1;\n");

        let missing = ProbeExpectation {
            script_path: "nope.js".to_string(),
            ..exp
        };
        assert!(matches!(sources.apply(&missing), Err(Error::NotFound(_))));
    }
}
