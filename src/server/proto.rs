//! Wire envelopes of the JSON message protocol.
//!
//! Requests carry a client-chosen correlation id, an operation name and an
//! argument object. Responses echo the id with either a result or an error
//! string. Change notifications are pushed as unsolicited `message` frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pubsub::{ChangeEvent, Realm};

#[derive(Debug, Deserialize)]
pub struct Request {
    pub id: u64,
    pub op: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Serialize)]
pub struct Response {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub result: Value,
}

impl Response {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            error: None,
            result,
        }
    }

    pub fn err(id: u64, error: impl Into<String>) -> Self {
        Self {
            id,
            error: Some(error.into()),
            result: Value::Null,
        }
    }
}

/// Asynchronous change notification; `obj` is `null` for deletions.
#[derive(Debug, Serialize)]
pub struct EventFrame {
    pub event: &'static str,
    pub realm: Realm,
    pub pattern: String,
    pub id: String,
    pub obj: Value,
}

impl From<ChangeEvent> for EventFrame {
    fn from(event: ChangeEvent) -> Self {
        Self {
            event: "message",
            realm: event.realm,
            pattern: event.pattern,
            id: event.id,
            obj: event.obj.unwrap_or(Value::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_parses_with_default_args() {
        let req: Request = serde_json::from_value(json!({"id": 3, "op": "getObject"})).unwrap();
        assert_eq!(req.id, 3);
        assert_eq!(req.op, "getObject");
        assert!(req.args.is_null());
    }

    #[test]
    fn response_omits_empty_fields() {
        let ok = serde_json::to_value(Response::ok(1, json!({"x": 1}))).unwrap();
        assert!(ok.get("error").is_none());
        assert_eq!(ok["result"]["x"], 1);

        let err = serde_json::to_value(Response::err(2, "permissionError")).unwrap();
        assert_eq!(err["error"], "permissionError");
        assert!(err.get("result").is_none());
    }

    #[test]
    fn event_frame_shape() {
        let frame = EventFrame::from(ChangeEvent {
            realm: Realm::Objects,
            pattern: "a.*".to_string(),
            id: "a.b".to_string(),
            obj: None,
        });
        let v = serde_json::to_value(frame).unwrap();
        assert_eq!(v["event"], "message");
        assert_eq!(v["realm"], "objects");
        assert_eq!(v["obj"], Value::Null);
    }
}
