use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const STAGE_UPDATED: &str = "updated";
pub const STAGE_POST_INJECTION: &str = "post_injection";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HarnessEvent {
    PageHtml {
        stage: String,
        html: String,
    },
    ActionEvent {
        #[serde(flatten)]
        payload: Map<String, Value>,
    },
}

impl HarnessEvent {
    pub fn page_html(stage: &str, html: impl Into<String>) -> Self {
        HarnessEvent::PageHtml {
            stage: stage.to_string(),
            html: html.into(),
        }
    }

    pub fn is_updated_html(&self) -> bool {
        matches!(self, HarnessEvent::PageHtml { stage, .. } if stage == STAGE_UPDATED)
    }

    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Parse one output line. Only lines starting with `{` are considered.
pub fn parse_event_line(line: &str) -> Option<HarnessEvent> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    serde_json::from_str(line).ok()
}

/// `html` of every `page_html` event at stage `updated`, in order.
pub fn extract_updated_html_from_ndjson(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(parse_event_line)
        .filter_map(|event| match event {
            HarnessEvent::PageHtml { stage, html } if stage == STAGE_UPDATED => Some(html),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_only_updated_snapshots_in_order() {
        let output = [
            "> webpack compiled successfully",
            r#"{"type":"page_html","stage":"post_injection","html":"<p>initial</p>"}"#,
            r#"{"type":"page_html","stage":"updated","html":"<p>one</p>"}"#,
            r##"{"type":"action_event","action":"click","target":"#btn"}"##,
            r#"{"type":"page_html","stage":"updated","html":"<p>two</p>"}"#,
        ]
        .join("\n");
        assert_eq!(
            extract_updated_html_from_ndjson(&output),
            vec!["<p>one</p>".to_string(), "<p>two</p>".to_string()]
        );
    }

    #[test]
    fn test_malformed_and_unknown_lines_are_skipped() {
        let output = "{not json\n{\"type\":\"mystery\"}\n{\"type\":\"page_html\",\"stage\":\"updated\"}\n[1,2]\n";
        assert!(extract_updated_html_from_ndjson(output).is_empty());
    }

    #[test]
    fn test_action_event_keeps_payload() {
        let event = parse_event_line(r#"  {"type":"action_event","action":"reload","n":2}"#).unwrap();
        match event {
            HarnessEvent::ActionEvent { payload } => {
                assert_eq!(payload["action"], "reload");
                assert_eq!(payload["n"], 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_event_line_shape() {
        let line = HarnessEvent::page_html(STAGE_UPDATED, "<b>x</b>").to_line();
        assert!(parse_event_line(&line).unwrap().is_updated_html());
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "page_html");
        assert_eq!(value["stage"], "updated");
    }
}
