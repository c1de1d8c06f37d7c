//! Wire protocol for the control WebSocket and the emulator child stdio.
//!
//! Both channels carry newline-delimited JSON: one UTF-8 object per line.
//! Three shapes share the stream: client requests, server responses and
//! server-initiated events. Events never carry a request id.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Version of the control protocol. Compatibility is decided on the major
/// component only; minor and patch mismatches are accepted.
pub const PROTOCOL_VERSION: &str = "1.1.0";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Incompatible protocol version detected")]
    VersionMismatch,
}

/// Request status reported by every [`Response`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Failure,
}

/// Client request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub version: String,
    pub action: String,
    /// Client-assigned id, echoed back in the matching response.
    pub id: i64,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl Message {
    /// Decode a single frame. Fails on invalid JSON or missing fields.
    pub fn from_json(raw: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Reject requests whose major version differs from ours.
    pub fn check_version(&self) -> Result<(), ProtocolError> {
        let major = self.version.split('.').next().unwrap_or("");
        let ours = PROTOCOL_VERSION.split('.').next().unwrap_or("");
        if major == ours {
            Ok(())
        } else {
            Err(ProtocolError::VersionMismatch)
        }
    }
}

/// Server response frame. `id` matches the triggering request and is omitted
/// when the failure predates id extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub version: String,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default)]
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    /// A failure response with no id and no detail yet; handlers fill it in.
    pub fn failure() -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            status: Status::Failure,
            id: None,
            data: Value::Null,
            error: None,
        }
    }

    pub fn succeed(&mut self) -> &mut Self {
        self.status = Status::Success;
        self
    }

    pub fn fail(&mut self, error: impl Into<String>) -> &mut Self {
        self.status = Status::Failure;
        self.error = Some(error.into());
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("response serialization is infallible")
    }
}

/// Server-initiated frame pushed without a correlating request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub version: String,
    pub event: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Event {
    /// Build a protocol event from the emulator child's `evt` object: the
    /// `event` key names the event, every other key becomes payload data.
    pub fn from_child(mut raw: Map<String, Value>) -> Option<Self> {
        let name = raw.remove("event")?;
        let event = name.as_str()?.to_string();
        Some(Self {
            version: PROTOCOL_VERSION.to_string(),
            event,
            data: raw,
        })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("event serialization is infallible")
    }
}

/// Encode one NDJSON line for the child stdio channel.
pub fn encode_line(value: &Value) -> String {
    let mut line = value.to_string();
    line.push('\n');
    line
}

/// True under JSON truthiness as the action handlers understand it: null,
/// `false`, zero, and empty strings/arrays/objects are all falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_roundtrip() {
        let raw = r#"{"version":"1.1.0","action":"spawn","id":1,"payload":{"name":"renode"}}"#;
        let msg = Message::from_json(raw).unwrap();
        assert_eq!(msg.action, "spawn");
        assert_eq!(msg.id, 1);
        assert_eq!(msg.payload["name"], "renode");
        assert!(msg.check_version().is_ok());
    }

    #[test]
    fn minor_and_patch_mismatch_accepted() {
        let msg = Message::from_json(r#"{"version":"1.0.7","action":"x","id":0}"#).unwrap();
        assert!(msg.check_version().is_ok());
    }

    #[test]
    fn major_mismatch_rejected() {
        let msg = Message::from_json(r#"{"version":"2.1.0","action":"x","id":0}"#).unwrap();
        assert!(matches!(
            msg.check_version(),
            Err(ProtocolError::VersionMismatch)
        ));
    }

    #[test]
    fn missing_fields_fail_decode() {
        assert!(Message::from_json(r#"{"version":"1.1.0","id":3}"#).is_err());
        assert!(Message::from_json("not json").is_err());
    }

    #[test]
    fn payload_defaults_to_empty() {
        let msg = Message::from_json(r#"{"version":"1.1.0","action":"status","id":9}"#).unwrap();
        assert!(msg.payload.is_empty());
    }

    #[test]
    fn response_shape() {
        let mut ret = Response::failure();
        ret.id = Some(7);
        ret.fail("Operation nope not supported");
        let value: Value = serde_json::from_str(&ret.to_json()).unwrap();
        assert_eq!(value["status"], "failure");
        assert_eq!(value["id"], 7);
        assert_eq!(value["error"], "Operation nope not supported");
        assert!(value.get("data").is_some());
    }

    #[test]
    fn response_omits_absent_id_and_error() {
        let mut ret = Response::failure();
        ret.succeed();
        let value: Value = serde_json::from_str(&ret.to_json()).unwrap();
        assert!(value.get("id").is_none());
        assert!(value.get("error").is_none());
    }

    #[test]
    fn event_from_child_strips_name() {
        let raw = json!({"event": "uart-opened", "port": 3456, "name": "sysbus.uart0"});
        let event = Event::from_child(raw.as_object().unwrap().clone()).unwrap();
        assert_eq!(event.event, "uart-opened");
        assert_eq!(event.data["port"], 3456);
        assert!(event.data.get("event").is_none());

        let value: Value = serde_json::from_str(&event.to_json()).unwrap();
        assert!(value.get("id").is_none());
    }

    #[test]
    fn truthiness_matches_handler_expectations() {
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!([])));
        assert!(is_truthy(&json!("ok")));
        assert!(is_truthy(&json!(["sysbus.uart0"])));
        assert!(is_truthy(&json!(1)));
    }
}
