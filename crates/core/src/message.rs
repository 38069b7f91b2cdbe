use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::types::{InstanceId, ReloadReason};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum StatusMessage {
    /// Server → client, sent as soon as a peer connects.
    ServerReady,
    /// Client → server, once initial extension metadata is known.
    ClientReady {
        #[serde(rename = "instanceId")]
        instance_id: InstanceId,
        #[serde(default)]
        data: Value,
    },
    /// Log forwarding, either direction.
    Log {
        #[serde(rename = "instanceId")]
        instance_id: InstanceId,
        #[serde(default)]
        data: Value,
    },
    /// Client → server after a reload finished for one extension.
    ExtensionReady {
        #[serde(rename = "instanceId")]
        instance_id: InstanceId,
        data: ExtensionReady,
    },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionReady {
    pub extension_id: String,
    #[serde(default)]
    pub strategy: Option<String>,
}

/// Server → client notice that a source file changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotice {
    pub changed_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<InstanceId>,
    #[serde(default, skip_serializing_if = "ReloadReason::is_none")]
    pub reason: ReloadReason,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ReloadMessage {
    Status(StatusMessage),
    Change(ChangeNotice),
}

impl ReloadMessage {
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Error::Protocol(format!("malformed reload frame: {}", e)))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        if !value.is_object() {
            return Err(Error::Protocol("reload frame is not an object".to_string()));
        }
        if value.get("status").is_some() {
            return serde_json::from_value::<StatusMessage>(value)
                .map(ReloadMessage::Status)
                .map_err(|e| Error::Protocol(format!("bad status message: {}", e)));
        }
        if value.get("changedFile").is_some() {
            return serde_json::from_value::<ChangeNotice>(value)
                .map(ReloadMessage::Change)
                .map_err(|e| Error::Protocol(format!("bad change notice: {}", e)));
        }
        Err(Error::Protocol(format!(
            "unrecognized reload frame: {}",
            crate::truncate_for_log(&value.to_string(), 120)
        )))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn server_ready() -> Self {
        ReloadMessage::Status(StatusMessage::ServerReady)
    }

    pub fn ping() -> Self {
        ReloadMessage::Status(StatusMessage::Ping)
    }

    pub fn log(instance_id: &InstanceId, level: &str, message: &str) -> Self {
        ReloadMessage::Status(StatusMessage::Log {
            instance_id: instance_id.clone(),
            data: json!({ "level": level, "message": message }),
        })
    }

    pub fn instance_id(&self) -> Option<&InstanceId> {
        match self {
            ReloadMessage::Status(StatusMessage::ClientReady { instance_id, .. })
            | ReloadMessage::Status(StatusMessage::Log { instance_id, .. })
            | ReloadMessage::Status(StatusMessage::ExtensionReady { instance_id, .. }) => {
                Some(instance_id)
            }
            ReloadMessage::Change(notice) => notice.instance_id.as_ref(),
            _ => None,
        }
    }

    /// Unaddressed messages reach every instance.
    pub fn is_addressed_to(&self, instance_id: &InstanceId) -> bool {
        match self.instance_id() {
            Some(target) => target == instance_id,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_messages() {
        let msg = ReloadMessage::parse(r#"{"status":"serverReady"}"#).unwrap();
        assert_eq!(msg, ReloadMessage::server_ready());

        let msg = ReloadMessage::parse(
            r#"{"status":"clientReady","instanceId":"abc","data":{"name":"Demo"}}"#,
        )
        .unwrap();
        match msg {
            ReloadMessage::Status(StatusMessage::ClientReady { instance_id, data }) => {
                assert_eq!(instance_id.as_str(), "abc");
                assert_eq!(data["name"], "Demo");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_change_notice() {
        let msg = ReloadMessage::parse(r#"{"changedFile":"src/a.ts","reason":"manifest"}"#).unwrap();
        match msg {
            ReloadMessage::Change(notice) => {
                assert_eq!(notice.changed_file, "src/a.ts");
                assert_eq!(notice.reason, ReloadReason::Manifest);
                assert!(notice.instance_id.is_none());
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_wire_shapes() {
        let ping = ReloadMessage::ping().to_json();
        assert_eq!(ping, r#"{"status":"ping"}"#);

        let notice = ReloadMessage::Change(ChangeNotice {
            changed_file: "a.js".to_string(),
            instance_id: Some(InstanceId::from("i1")),
            reason: ReloadReason::None,
        });
        let value: Value = serde_json::from_str(&notice.to_json()).unwrap();
        assert_eq!(value, json!({"changedFile": "a.js", "instanceId": "i1"}));

        let log = ReloadMessage::log(&InstanceId::from("i1"), "debug", "hello");
        let value: Value = serde_json::from_str(&log.to_json()).unwrap();
        assert_eq!(value["status"], "log");
        assert_eq!(value["instanceId"], "i1");
        assert_eq!(value["data"]["message"], "hello");
    }

    #[test]
    fn test_unknown_frames_are_protocol_errors() {
        for raw in [
            "not json",
            "[1,2]",
            r#"{"hello":"world"}"#,
            r#"{"status":"explode"}"#,
            r#"{"status":"clientReady"}"#,
        ] {
            match ReloadMessage::parse(raw) {
                Err(Error::Protocol(_)) => {}
                other => panic!("{} should be a protocol error, got {:?}", raw, other),
            }
        }
    }

    #[test]
    fn test_instance_filtering() {
        let me = InstanceId::from("me");
        let other = InstanceId::from("other");
        let notice = ReloadMessage::Change(ChangeNotice {
            changed_file: "a.js".to_string(),
            instance_id: Some(other.clone()),
            reason: ReloadReason::None,
        });
        assert!(!notice.is_addressed_to(&me));
        assert!(notice.is_addressed_to(&other));
        assert!(ReloadMessage::server_ready().is_addressed_to(&me));
    }
}
