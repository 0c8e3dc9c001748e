//! protoo message model.
//!
//! Three JSON shapes ride the signalling WebSocket as text frames:
//!
//! - `{"request": true, "id": N, "method": "...", "data": {...}}`
//! - `{"response": true, "id": N, "ok": true, "data": {...}}` or, on
//!   failure, `{"response": true, "id": N, "ok": false, "errorCode": C,
//!   "errorReason": "..."}`
//! - `{"notification": true, "method": "...", "data": {...}}`
//!
//! Ids are assigned by the sender, fit in 53 bits so JavaScript peers can
//! represent them exactly, and wrap at 2^53.

use serde_json::{json, Map, Value};

use crate::errors::ProtocolError;

/// Ids live in [0, 2^53); the allocator wraps there.
pub const MAX_REQUEST_ID: u64 = 1 << 53;

#[derive(Debug, Clone, PartialEq)]
pub enum ProtooMessage {
    Request {
        id: u64,
        method: String,
        data: Value,
    },
    Response {
        id: u64,
        ok: bool,
        data: Value,
        error_code: Option<i64>,
        error_reason: Option<String>,
    },
    Notification {
        method: String,
        data: Value,
    },
}

impl ProtooMessage {
    pub fn request(id: u64, method: &str, data: Value) -> Self {
        ProtooMessage::Request {
            id,
            method: method.to_string(),
            data: ensure_object(data),
        }
    }

    pub fn notification(method: &str, data: Value) -> Self {
        ProtooMessage::Notification {
            method: method.to_string(),
            data: ensure_object(data),
        }
    }

    pub fn ok_response(id: u64, data: Value) -> Self {
        ProtooMessage::Response {
            id,
            ok: true,
            data: ensure_object(data),
            error_code: None,
            error_reason: None,
        }
    }

    pub fn error_response(id: u64, code: i64, reason: &str) -> Self {
        ProtooMessage::Response {
            id,
            ok: false,
            data: Value::Null,
            error_code: Some(code),
            error_reason: Some(reason.to_string()),
        }
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ProtocolError::Signalling(format!("invalid JSON: {e}")))?;
        let obj = value
            .as_object()
            .ok_or_else(|| ProtocolError::Signalling("message is not an object".into()))?;

        if flag(obj, "request") {
            let id = id_field(obj)?;
            let method = method_field(obj)?;
            let data = obj.get("data").cloned().unwrap_or_else(|| json!({}));
            return Ok(ProtooMessage::Request { id, method, data });
        }
        if flag(obj, "response") {
            let id = id_field(obj)?;
            let ok = obj.get("ok").and_then(Value::as_bool).unwrap_or(false);
            let data = obj.get("data").cloned().unwrap_or_else(|| json!({}));
            let error_code = obj.get("errorCode").and_then(Value::as_i64);
            let error_reason = obj
                .get("errorReason")
                .and_then(Value::as_str)
                .map(str::to_string);
            return Ok(ProtooMessage::Response {
                id,
                ok,
                data,
                error_code,
                error_reason,
            });
        }
        if flag(obj, "notification") {
            let method = method_field(obj)?;
            let data = obj.get("data").cloned().unwrap_or_else(|| json!({}));
            return Ok(ProtooMessage::Notification { method, data });
        }
        Err(ProtocolError::Signalling(
            "message is neither request, response nor notification".into(),
        ))
    }

    pub fn to_json(&self) -> Value {
        match self {
            ProtooMessage::Request { id, method, data } => json!({
                "request": true,
                "id": id,
                "method": method,
                "data": data,
            }),
            ProtooMessage::Response {
                id,
                ok,
                data,
                error_code,
                error_reason,
            } => {
                let mut obj = Map::new();
                obj.insert("response".into(), Value::Bool(true));
                obj.insert("id".into(), json!(id));
                obj.insert("ok".into(), Value::Bool(*ok));
                if *ok {
                    obj.insert("data".into(), data.clone());
                } else {
                    if let Some(code) = error_code {
                        obj.insert("errorCode".into(), json!(code));
                    }
                    if let Some(reason) = error_reason {
                        obj.insert("errorReason".into(), json!(reason));
                    }
                }
                Value::Object(obj)
            }
            ProtooMessage::Notification { method, data } => json!({
                "notification": true,
                "method": method,
                "data": data,
            }),
        }
    }
}

fn ensure_object(data: Value) -> Value {
    if data.is_object() { data } else { json!({}) }
}

fn flag(obj: &Map<String, Value>, key: &str) -> bool {
    obj.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn id_field(obj: &Map<String, Value>) -> Result<u64, ProtocolError> {
    let id = obj
        .get("id")
        .and_then(Value::as_u64)
        .ok_or_else(|| ProtocolError::Signalling("missing or non-numeric id".into()))?;
    if id >= MAX_REQUEST_ID {
        return Err(ProtocolError::Signalling(format!("id {id} exceeds 2^53")));
    }
    Ok(id)
}

fn method_field(obj: &Map<String, Value>) -> Result<String, ProtocolError> {
    obj.get("method")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProtocolError::Signalling("missing method".into()))
}

/// Monotonic id source for one sender, wrapping at 2^53.
#[derive(Debug, Default)]
pub struct RequestIdAllocator {
    next: u64,
}

impl RequestIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> u64 {
        let id = self.next;
        self.next = (self.next + 1) % MAX_REQUEST_ID;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let msg = ProtooMessage::request(7, "echo", json!({"ts": 123}));
        let text = msg.to_json().to_string();
        assert_eq!(ProtooMessage::parse(&text).unwrap(), msg);
    }

    #[test]
    fn notification_round_trip() {
        let msg = ProtooMessage::notification("pcm_data", json!({"roomId": "R"}));
        let text = msg.to_json().to_string();
        assert_eq!(ProtooMessage::parse(&text).unwrap(), msg);
    }

    #[test]
    fn ok_response_shape() {
        let msg = ProtooMessage::ok_response(3, json!({"x": 1}));
        let v = msg.to_json();
        assert_eq!(v["response"], json!(true));
        assert_eq!(v["ok"], json!(true));
        assert_eq!(v["data"]["x"], json!(1));
    }

    #[test]
    fn error_response_carries_code_and_reason() {
        let msg = ProtooMessage::error_response(4, 500, "boom");
        let v = msg.to_json();
        assert_eq!(v["ok"], json!(false));
        assert_eq!(v["errorCode"], json!(500));
        assert_eq!(v["errorReason"], json!("boom"));
        assert!(v.get("data").is_none());
    }

    #[test]
    fn non_object_data_becomes_empty_object() {
        let msg = ProtooMessage::request(1, "echo", json!("scalar"));
        match msg {
            ProtooMessage::Request { data, .. } => assert_eq!(data, json!({})),
            _ => unreachable!(),
        }
    }

    #[test]
    fn unclassified_object_is_an_error() {
        assert!(ProtooMessage::parse(r#"{"hello": true}"#).is_err());
        assert!(ProtooMessage::parse("not json").is_err());
        assert!(ProtooMessage::parse("[1,2,3]").is_err());
    }

    #[test]
    fn oversized_id_is_rejected() {
        let text = format!(r#"{{"request": true, "id": {}, "method": "m"}}"#, 1u64 << 53);
        assert!(ProtooMessage::parse(&text).is_err());
    }

    #[test]
    fn id_allocator_wraps_at_2_pow_53() {
        let mut ids = RequestIdAllocator { next: MAX_REQUEST_ID - 2 };
        assert_eq!(ids.next_id(), MAX_REQUEST_ID - 2);
        assert_eq!(ids.next_id(), MAX_REQUEST_ID - 1);
        assert_eq!(ids.next_id(), 0);
        assert_eq!(ids.next_id(), 1);
    }
}
