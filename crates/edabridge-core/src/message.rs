//! Protocol messages.
//!
//! Every frame is a single JSON object discriminated by `type`. A connection
//! starts with `hello`; after that both sides exchange `request` and
//! `response` frames correlated by `id`.

use crate::{AppInfo, RemoteError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Identifies the peer. Must be the first frame on a connection.
    Hello {
        #[serde(default)]
        app: AppInfo,
    },
    /// A call expecting exactly one response.
    Request {
        id: String,
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
    /// The answer to a request: a result or an error, never both.
    Response {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
}

/// Structured error carried in a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Message {
    pub fn hello(app: AppInfo) -> Self {
        Message::Hello { app }
    }

    pub fn request(id: impl Into<String>, method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Request {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    /// A successful response. A `null` result is still sent as `"result": null`.
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Message::Response {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, error: ErrorBody) -> Self {
        Message::Response {
            id: id.into(),
            result: None,
            error: Some(error),
        }
    }

    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Encode as a text frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::Request { .. } => "request",
            Message::Response { .. } => "response",
        }
    }
}

impl ErrorBody {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl From<ErrorBody> for RemoteError {
    fn from(body: ErrorBody) -> Self {
        RemoteError {
            code: body.code,
            message: body.message,
            data: body.data,
        }
    }
}

/// Collapse a decoded response into its outcome. An error takes precedence
/// if a misbehaving peer sends both fields.
pub(crate) fn response_outcome(
    result: Option<Value>,
    error: Option<ErrorBody>,
) -> Result<Value, RemoteError> {
    match error {
        Some(body) => Err(body.into()),
        None => Ok(result.unwrap_or(Value::Null)),
    }
}

impl Message {
    /// For a response, its id and outcome.
    pub fn into_response(self) -> Option<(String, Result<Value, RemoteError>)> {
        match self {
            Message::Response { id, result, error } => Some((id, response_outcome(result, error))),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hello_wire_shape() {
        let msg = Message::decode(r#"{"type":"hello","app":{"name":"ext","edaVersion":"2.2"}}"#)
            .unwrap();
        let Message::Hello { app } = msg else {
            panic!("expected hello");
        };
        assert_eq!(app.name.as_deref(), Some("ext"));
        assert_eq!(app.eda_version.as_deref(), Some("2.2"));
        assert!(app.version.is_none());
    }

    #[test]
    fn hello_without_app() {
        let msg = Message::decode(r#"{"type":"hello"}"#).unwrap();
        assert_eq!(msg, Message::hello(AppInfo::default()));
    }

    #[test]
    fn request_omits_absent_params() {
        let text = Message::request("1", "ping", None).encode().unwrap();
        assert_eq!(text, r#"{"type":"request","id":"1","method":"ping"}"#);
    }

    #[test]
    fn null_result_is_kept() {
        let text = Message::success("7", Value::Null).encode().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"type": "response", "id": "7", "result": null}));

        let (id, outcome) = Message::decode(&text).unwrap().into_response().unwrap();
        assert_eq!(id, "7");
        assert_eq!(outcome.unwrap(), Value::Null);
    }

    #[test]
    fn error_response_outcome() {
        let text = r#"{"type":"response","id":"9","error":{"code":"E_BUSY","message":"busy","data":{"retry":true}}}"#;
        let (_, outcome) = Message::decode(text).unwrap().into_response().unwrap();
        let err = outcome.unwrap_err();
        assert_eq!(err.code, "E_BUSY");
        assert_eq!(err.message, "busy");
        assert_eq!(err.data, Some(json!({"retry": true})));
    }

    #[test]
    fn error_wins_over_result() {
        let text = r#"{"type":"response","id":"9","result":1,"error":{"code":"X","message":"m"}}"#;
        let (_, outcome) = Message::decode(text).unwrap().into_response().unwrap();
        assert!(outcome.is_err());
    }

    #[test]
    fn unknown_type_rejected() {
        assert!(Message::decode(r#"{"type":"snapshot","seq":1}"#).is_err());
        assert!(Message::decode("not json").is_err());
    }
}
