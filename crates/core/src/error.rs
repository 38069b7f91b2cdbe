use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Connection refused, reset, or otherwise unusable.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The socket closed while the request was still pending.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Malformed frame, schema mismatch, or unexpected message kind.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Error payload returned by the remote peer, kept verbatim in `data`.
    #[error("Remote error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Value,
    },

    #[error("JavaScript exception: {0}")]
    JsException(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Reload failed: {0}")]
    ReloadFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build a `Remote` error from a peer error object such as
    /// `{"code": -32601, "message": "..."}`.
    pub fn remote(payload: Value) -> Self {
        let code = payload.get("code").and_then(|v| v.as_i64()).unwrap_or(0);
        let message = payload
            .get("message")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| payload.to_string());
        Error::Remote {
            code,
            message,
            data: payload,
        }
    }

    /// True when the peer reported that the command itself does not exist.
    pub fn is_method_not_found(&self) -> bool {
        match self {
            Error::Remote { code, message, .. } => {
                *code == -32601
                    || message.contains("wasn't found")
                    || message.contains("Method not found")
            }
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_keeps_payload() {
        let payload = serde_json::json!({"code": -32000, "message": "boom", "data": "x"});
        let err = Error::remote(payload.clone());
        match err {
            Error::Remote { code, message, data } => {
                assert_eq!(code, -32000);
                assert_eq!(message, "boom");
                assert_eq!(data, payload);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_method_not_found_detection() {
        let err = Error::remote(serde_json::json!({
            "code": -32601,
            "message": "'Extensions.reload' wasn't found"
        }));
        assert!(err.is_method_not_found());
        assert!(!Error::Timeout("x".into()).is_method_not_found());
    }
}
