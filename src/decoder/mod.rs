use crate::model::{Notification, Operation, ResourceKind};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;

/// Outer frame body: the record itself travels JSON-encoded inside `data`.
#[derive(Debug, Deserialize)]
struct WireFrame {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireRecord {
    #[serde(default)]
    data: Value,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    object: Option<String>,
}

#[derive(Debug)]
pub enum DecodeError {
    Envelope(serde_json::Error),
    Payload(String),
    MissingKind,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Envelope(err) => write!(f, "frame is not a valid envelope: {err}"),
            Self::Payload(err) => write!(f, "frame record is not decodable: {err}"),
            Self::MissingKind => write!(f, "frame record has no object tag"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Failure carrying whatever free text could still be recovered.
#[derive(Debug)]
pub struct DecodeFailure {
    pub error: DecodeError,
    pub message: Option<String>,
}

impl DecodeFailure {
    pub fn into_fallback(self) -> Notification {
        Notification::fallback(self.message)
    }
}

pub fn decode(raw: &str) -> Result<Notification, DecodeFailure> {
    let frame: WireFrame = serde_json::from_str(raw).map_err(|err| DecodeFailure {
        error: DecodeError::Envelope(err),
        message: None,
    })?;
    let outer_message = frame.message;

    let record = match frame.data {
        Some(Value::String(inner)) => serde_json::from_str::<WireRecord>(&inner)
            .map_err(|err| DecodeError::Payload(err.to_string())),
        Some(Value::Object(map)) => serde_json::from_value::<WireRecord>(Value::Object(map))
            .map_err(|err| DecodeError::Payload(err.to_string())),
        Some(other) => Err(DecodeError::Payload(format!(
            "expected encoded record, found {}",
            json_type(&other)
        ))),
        None => Err(DecodeError::Payload("missing data".to_string())),
    };
    let record = record.map_err(|error| DecodeFailure {
        error,
        message: outer_message.clone(),
    })?;

    let message = record.message.or(outer_message);
    let Some(tag) = record.object.filter(|tag| !tag.trim().is_empty()) else {
        return Err(DecodeFailure {
            error: DecodeError::MissingKind,
            message,
        });
    };

    let operation = match record.method.as_deref() {
        Some(method) => {
            let op = Operation::from_method(method);
            if op.is_none() {
                tracing::debug!(method, object = %tag, "unrecognised method on pushed record");
            }
            op
        }
        None => None,
    };

    Ok(Notification {
        kind: ResourceKind::from_tag(tag.trim()),
        operation,
        payload: record.data,
        message,
    })
}

/// Never drops a frame: undecodable input becomes a message-only notification.
pub fn decode_or_fallback(raw: &str) -> Notification {
    decode(raw).unwrap_or_else(|failure| {
        tracing::warn!(error = %failure.error, "push frame decode failed; surfacing generic alert");
        failure.into_fallback()
    })
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(record: Value, message: Option<&str>) -> String {
        let mut outer = json!({ "data": record.to_string() });
        if let Some(message) = message {
            outer["message"] = json!(message);
        }
        outer.to_string()
    }

    #[test]
    fn decodes_nested_record_verbatim() {
        let raw = frame(
            json!({
                "data": { "meta": { "id": "vs-1" }, "name": "vol" },
                "message": "volume updated",
                "method": "PATCH",
                "object": "VOLUME_SERIES"
            }),
            None,
        );
        let n = decode(&raw).unwrap();
        assert_eq!(n.kind, ResourceKind::Volumes);
        assert_eq!(n.operation, Some(Operation::Update));
        assert_eq!(n.payload["name"], "vol");
        assert_eq!(n.message.as_deref(), Some("volume updated"));
    }

    #[test]
    fn status_records_have_no_operation() {
        let raw = frame(json!({ "object": "CONNECTION_STATUS", "data": {} }), Some("reconnected"));
        let n = decode(&raw).unwrap();
        assert_eq!(n.kind, ResourceKind::ConnectionStatus);
        assert_eq!(n.operation, None);
        assert_eq!(n.message.as_deref(), Some("reconnected"));
    }

    #[test]
    fn invalid_json_falls_back_without_message() {
        let n = decode_or_fallback("not json at all");
        assert_eq!(n.kind, ResourceKind::Unknown(String::new()));
        assert_eq!(n.message, None);
    }

    #[test]
    fn missing_object_keeps_message_in_fallback() {
        let raw = frame(json!({ "method": "POST", "message": "inner text" }), Some("outer"));
        let failure = decode(&raw).unwrap_err();
        assert!(matches!(failure.error, DecodeError::MissingKind));
        let n = failure.into_fallback();
        assert_eq!(n.message.as_deref(), Some("inner text"));
    }

    #[test]
    fn undecodable_inner_record_keeps_outer_message() {
        let raw = json!({ "data": "{broken", "message": "server said hi" }).to_string();
        let n = decode_or_fallback(&raw);
        assert_eq!(n.message.as_deref(), Some("server said hi"));
        assert!(n.payload.is_null());
    }
}
