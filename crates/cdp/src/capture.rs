use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use extdev_core::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::client::CdpClient;

/// Substrings that show a content script has written into the page.
pub const INJECTION_MARKERS: [&str; 3] = [
    "data-extension-root=\"true\"",
    "extjs-hmr-probe-",
    "data-extdev-injected",
];

pub const REDACTED: &str = "[REDACTED]";

pub(crate) const SERIALIZE_DOCUMENT_JS: &str = r#"(() => {
  const dt = document.doctype;
  let doctype = '';
  if (dt) {
    doctype = '<!DOCTYPE ' + dt.name;
    if (dt.publicId) doctype += ' PUBLIC "' + dt.publicId + '"';
    else if (dt.systemId) doctype += ' SYSTEM';
    if (dt.systemId) doctype += ' "' + dt.systemId + '"';
    doctype += '>\n';
  }
  return doctype + document.documentElement.outerHTML;
})()"#;

const DOM_SNAPSHOT_JS: &str = r#"(() => {
  const out = [];
  const walk = (node, depth) => {
    for (const el of node.children) {
      let desc = depth + ':' + el.tagName.toLowerCase();
      if (el.id) desc += '#' + el.id;
      if (el.classList && el.classList.length) desc += '.' + Array.from(el.classList).join('.');
      out.push(desc);
      if (el.shadowRoot) walk(el.shadowRoot, depth + 1);
      walk(el, depth + 1);
    }
  };
  walk(document, 0);
  return out;
})()"#;

fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

pub(crate) fn shadow_content_js(root_id: &str) -> String {
    format!(
        r#"(() => {{
  const host = document.getElementById({id});
  if (!host || !host.shadowRoot) return null;
  return host.shadowRoot.innerHTML;
}})()"#,
        id = js_string(root_id)
    )
}

fn summary_js(root_id: &str) -> String {
    format!(
        r#"(() => {{
  let shadowRoots = 0;
  for (const el of document.querySelectorAll('*')) if (el.shadowRoot) shadowRoots++;
  return {{
    hasExtensionRoot: !!document.getElementById({id}),
    shadowRootCount: shadowRoots,
    scriptCount: document.scripts.length,
    styleCount: document.querySelectorAll('style, link[rel="stylesheet"]').length,
    htmlBytes: document.documentElement.outerHTML.length
  }};
}})()"#,
        id = js_string(root_id)
    )
}

pub(crate) fn injection_probe_js(root_id: &str) -> String {
    let markers: Vec<String> = INJECTION_MARKERS.iter().map(|m| js_string(m)).collect();
    format!(
        r#"(() => {{
  const host = document.getElementById({id});
  if (host && host.shadowRoot && host.shadowRoot.innerHTML.trim().length > 0) return true;
  const html = document.documentElement.outerHTML;
  return [{markers}].some(m => html.includes(m));
}})()"#,
        id = js_string(root_id),
        markers = markers.join(", ")
    )
}

// ─── Shadow merge ─────────────────────────────────────────────────────

/// Locate the opening tag of the element with `id="root_id"`.
/// Returns (tag name, start of tag, end of opening tag).
fn find_root_open_tag(html: &str, root_id: &str) -> Option<(String, usize, usize)> {
    let pattern = format!(
        r#"<([A-Za-z][A-Za-z0-9-]*)\b[^>]*\sid\s*=\s*["']{}["'][^>]*>"#,
        regex::escape(root_id)
    );
    let re = Regex::new(&pattern).ok()?;
    let caps = re.captures(html)?;
    let whole = caps.get(0)?;
    let tag = caps.get(1)?.as_str().to_ascii_lowercase();
    Some((tag, whole.start(), whole.end()))
}

/// Byte offset of the `</tag>` that closes an element whose content starts
/// at `from`, honoring nested elements with the same tag name.
fn find_matching_close(html: &str, tag: &str, from: usize) -> Option<usize> {
    let pattern = format!(r"(?i)<(/?){}\b[^>]*?(/?)>", regex::escape(tag));
    let re = Regex::new(&pattern).ok()?;
    let mut depth = 1usize;
    for caps in re.captures_iter(&html[from..]) {
        let closing = caps.get(1).map_or(false, |m| !m.as_str().is_empty());
        let self_closing = caps.get(2).map_or(false, |m| !m.as_str().is_empty());
        if closing {
            depth -= 1;
            if depth == 0 {
                return caps.get(0).map(|m| from + m.start());
            }
        } else if !self_closing {
            depth += 1;
        }
    }
    None
}

/// Merge shadow-root content into the serialized light DOM.
///
/// The root element found empty gets the content inserted; found with
/// children gets its children replaced; missing gets a wrapper before
/// `</body>`; and with no body at all the wrapper is appended.
pub fn merge_shadow_content(html: &str, root_id: &str, shadow: &str) -> String {
    if let Some((tag, _, open_end)) = find_root_open_tag(html, root_id) {
        if let Some(close_start) = find_matching_close(html, &tag, open_end) {
            let mut merged = String::with_capacity(html.len() + shadow.len());
            merged.push_str(&html[..open_end]);
            merged.push_str(shadow);
            merged.push_str(&html[close_start..]);
            return merged;
        }
    }

    let wrapped = format!(
        "<div id=\"{}\" data-extdev-shadow=\"true\">{}</div>",
        root_id, shadow
    );
    let lower = html.to_ascii_lowercase();
    match lower.rfind("</body>") {
        Some(pos) => {
            let mut merged = String::with_capacity(html.len() + wrapped.len());
            merged.push_str(&html[..pos]);
            merged.push_str(&wrapped);
            merged.push_str(&html[pos..]);
            merged
        }
        None => format!("{}{}", html, wrapped),
    }
}

// ─── Redaction ────────────────────────────────────────────────────────

struct Redactors {
    input_tag: Regex,
    password_type: Regex,
    value_attr: Regex,
    secret_param: Regex,
    bearer: Regex,
}

fn redactors() -> &'static Redactors {
    static REDACTORS: OnceLock<Redactors> = OnceLock::new();
    REDACTORS.get_or_init(|| Redactors {
        input_tag: Regex::new(r"(?i)<input\b[^>]*>").expect("redaction pattern"),
        password_type: Regex::new(r#"(?i)\btype\s*=\s*["']?password\b"#)
            .expect("redaction pattern"),
        value_attr: Regex::new(r#"(?i)(\bvalue\s*=\s*)("[^"]*"|'[^']*'|[^\s>]+)"#)
            .expect("redaction pattern"),
        secret_param: Regex::new(
            r#"(?i)\b(token|access_token|refresh_token|secret|client_secret|api[_-]?key|password|auth)=([^&"'\s<>]+)"#,
        )
        .expect("redaction pattern"),
        bearer: Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9._~+/=-]+").expect("redaction pattern"),
    })
}

/// Blank out password input values, secret-looking query parameters and
/// bearer tokens.
pub fn redact_html(html: &str) -> String {
    let r = redactors();
    let html = r.input_tag.replace_all(html, |caps: &regex::Captures| {
        let tag = &caps[0];
        if r.password_type.is_match(tag) {
            r.value_attr
                .replace_all(tag, format!("${{1}}\"{}\"", REDACTED).as_str())
                .into_owned()
        } else {
            tag.to_string()
        }
    });
    let html = r
        .secret_param
        .replace_all(&html, format!("${{1}}={}", REDACTED).as_str());
    r.bearer
        .replace_all(&html, format!("Bearer {}", REDACTED).as_str())
        .into_owned()
}

/// Merge shadow content (when there is any), redact, then cap the size.
pub fn finish_capture(html: &str, shadow: Option<&str>, root_id: &str, max_bytes: usize) -> String {
    let merged = match shadow {
        Some(content) if !content.is_empty() => {
            debug!(bytes = content.len(), "merging extension shadow content");
            merge_shadow_content(html, root_id, content)
        }
        _ => html.to_string(),
    };
    truncate_html(redact_html(&merged), max_bytes)
}

/// Cap the capture at `max_bytes`, appending a marker with the dropped size.
pub fn truncate_html(html: String, max_bytes: usize) -> String {
    if html.len() <= max_bytes {
        return html;
    }
    let kept = extdev_core::truncate_for_log(&html, max_bytes);
    let dropped = html.len() - kept.len();
    format!("{}\n<!-- extdev: truncated {} bytes -->", kept, dropped)
}

// ─── Summaries and snapshots ──────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HtmlSummary {
    pub has_extension_root: bool,
    pub shadow_root_count: u64,
    pub script_count: u64,
    pub style_count: u64,
    pub html_bytes: u64,
}

impl HtmlSummary {
    /// Offline approximation from already-captured HTML. Shadow roots only
    /// show up here when serialized declaratively.
    pub fn from_html(html: &str, root_id: &str) -> Self {
        let lower = html.to_ascii_lowercase();
        Self {
            has_extension_root: find_root_open_tag(html, root_id).is_some(),
            shadow_root_count: lower.matches("shadowrootmode=").count() as u64,
            script_count: lower.matches("<script").count() as u64,
            style_count: (lower.matches("<style").count()
                + lower.matches("rel=\"stylesheet\"").count()) as u64,
            html_bytes: html.len() as u64,
        }
    }
}

/// Flat list of element descriptors in document order, shadow trees
/// included, e.g. `1:div#extension-root.panel`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomSnapshot {
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DomDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl DomDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl DomSnapshot {
    /// Multiset difference from `self` (before) to `after`.
    pub fn diff(&self, after: &DomSnapshot) -> DomDiff {
        let mut counts: HashMap<&str, i64> = HashMap::new();
        for node in &self.nodes {
            *counts.entry(node.as_str()).or_default() -= 1;
        }
        for node in &after.nodes {
            *counts.entry(node.as_str()).or_default() += 1;
        }
        let mut diff = DomDiff::default();
        for (node, count) in counts {
            if count > 0 {
                diff.added.extend(std::iter::repeat(node.to_string()).take(count as usize));
            } else if count < 0 {
                diff.removed
                    .extend(std::iter::repeat(node.to_string()).take((-count) as usize));
            }
        }
        diff.added.sort();
        diff.removed.sort();
        diff
    }
}

// ─── Live capture ─────────────────────────────────────────────────────

impl CdpClient {
    /// Serialize the page, merge the extension root's shadow content,
    /// redact, and truncate.
    pub async fn capture_page(&self, session_id: &str) -> Result<String> {
        let html = self
            .evaluate(session_id, SERIALIZE_DOCUMENT_JS)
            .await?
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| Error::Protocol("document serialization returned no string".to_string()))?;

        let root_id = &self.config.extension_root_id;
        let shadow = self.evaluate(session_id, &shadow_content_js(root_id)).await?;
        Ok(finish_capture(
            &html,
            shadow.as_str(),
            root_id,
            self.config.max_capture_bytes,
        ))
    }

    pub async fn summarize_page(&self, session_id: &str) -> Result<HtmlSummary> {
        let value = self
            .evaluate(session_id, &summary_js(&self.config.extension_root_id))
            .await?;
        serde_json::from_value(value).map_err(|e| Error::Protocol(format!("bad summary: {}", e)))
    }

    pub async fn dom_snapshot(&self, session_id: &str) -> Result<DomSnapshot> {
        let value = self.evaluate(session_id, DOM_SNAPSHOT_JS).await?;
        let nodes: Vec<String> = serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("bad dom snapshot: {}", e)))?;
        Ok(DomSnapshot { nodes })
    }

    /// Poll until the content script has visibly injected, giving up at the
    /// configured deadline. Evaluation errors count as "not yet".
    pub async fn wait_for_content_script_injection(&self, session_id: &str) -> bool {
        let probe = injection_probe_js(&self.config.extension_root_id);
        let probe = probe.as_str();
        let deadline = tokio::time::Instant::now() + self.config.injection_deadline();
        poll_until(deadline, self.config.injection_poll_interval(), move || async move {
            matches!(self.evaluate(session_id, probe).await, Ok(Value::Bool(true)))
        })
        .await
    }
}

/// Run `check` every `interval` until it succeeds or `deadline` passes.
/// A check still running at the deadline counts as a miss.
pub(crate) async fn poll_until<F, Fut>(
    deadline: tokio::time::Instant,
    interval: Duration,
    mut check: F,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    loop {
        match tokio::time::timeout_at(deadline, check()).await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(_) => return false,
        }
        if tokio::time::Instant::now() + interval > deadline {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}
