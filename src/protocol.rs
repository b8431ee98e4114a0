//! Wire protocol codec.
//!
//! Each WebSocket text frame carries a single UTF-8 JSON object with a
//! `type` field. The codec is stateless: [`parse_frame`] turns a raw frame
//! into a typed [`ClientFrame`], the serializer functions produce the exact
//! outgoing shapes. Framing itself is the transport's job.

use serde_json::{json, Map, Value};

use crate::error::{ErrorKind, RequestError};

/// Bumping this requires an incompatible `welcome` payload.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Milliseconds since the Unix epoch, the timestamp unit used on the wire.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ─── Parsing ─────────────────────────────────────────────────────────────────

/// A parsed inbound frame.
#[derive(Debug)]
pub enum ClientFrame {
    /// Heartbeat reply. Carries the client's echo of the ping timestamp.
    Pong { timestamp: Option<i64> },
    /// A correlated request.
    Request(Request),
}

/// An inbound request: a numeric correlation id, an operation name, and the
/// remaining top-level fields as operation parameters.
#[derive(Debug)]
pub struct Request {
    pub id: i64,
    pub kind: String,
    pub fields: Map<String, Value>,
}

impl Request {
    /// Look up a required string field.
    pub fn str_field(&self, name: &str) -> Result<&str, RequestError> {
        self.fields.get(name).and_then(Value::as_str).ok_or_else(|| {
            RequestError::new(
                ErrorKind::ValidationError,
                format!("missing or non-string field: {name}"),
            )
        })
    }

    /// Look up an optional field, defaulting to `null`.
    pub fn value_field(&self, name: &str) -> Value {
        self.fields.get(name).cloned().unwrap_or(Value::Null)
    }
}

/// Why a frame could not be parsed into a [`ClientFrame`].
///
/// `kind` is `PARSE_ERROR` for frames that are not a JSON object at all and
/// `INVALID_REQUEST` for objects missing the request envelope (`id`/`type`).
#[derive(Debug)]
pub struct ParseFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl ParseFailure {
    fn parse(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::ParseError,
            message: message.into(),
        }
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::InvalidRequest,
            message: message.into(),
        }
    }
}

/// Parse one raw text frame.
pub fn parse_frame(raw: &str) -> Result<ClientFrame, ParseFailure> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| ParseFailure::parse(format!("invalid JSON: {e}")))?;

    let Value::Object(mut obj) = value else {
        return Err(ParseFailure::parse("frame is not a JSON object"));
    };

    let kind = match obj.get("type") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::String(_)) => return Err(ParseFailure::invalid("empty type field")),
        Some(_) => return Err(ParseFailure::invalid("type field is not a string")),
        None => return Err(ParseFailure::invalid("missing type field")),
    };

    // Pongs carry no correlation id.
    if kind == "pong" {
        let timestamp = obj.get("timestamp").and_then(Value::as_i64);
        return Ok(ClientFrame::Pong { timestamp });
    }

    let id = obj
        .get("id")
        .and_then(Value::as_i64)
        .ok_or_else(|| ParseFailure::invalid("missing numeric id field"))?;

    obj.remove("id");
    obj.remove("type");

    Ok(ClientFrame::Request(Request {
        id,
        kind,
        fields: obj,
    }))
}

// ─── Serialization ───────────────────────────────────────────────────────────

/// First frame on every connection, sent before any client frame is read.
pub fn welcome(requires_auth: bool) -> String {
    json!({
        "type": "welcome",
        "version": PROTOCOL_VERSION,
        "serverTime": now_ms(),
        "requiresAuth": requires_auth,
    })
    .to_string()
}

pub fn ping(timestamp: i64) -> String {
    json!({ "type": "ping", "timestamp": timestamp }).to_string()
}

pub fn result(id: i64, data: &Value) -> String {
    json!({ "id": id, "type": "result", "data": data }).to_string()
}

/// `id` is 0 when the original request id could not be recovered.
pub fn error(id: i64, err: &RequestError) -> String {
    let mut obj = json!({
        "id": id,
        "type": "error",
        "code": err.kind.as_str(),
        "message": err.message,
    });
    if let Some(details) = &err.details {
        obj["details"] = details.clone();
    }
    obj.to_string()
}

pub fn push(channel: &str, subscription_id: &str, data: &Value) -> String {
    json!({
        "type": "push",
        "channel": channel,
        "subscriptionId": subscription_id,
        "data": data,
    })
    .to_string()
}

/// Server-initiated out-of-band notice, e.g. `system {event:"shutdown"}`.
/// `extra` must be an object; its fields are merged into the frame.
pub fn system(event: &str, extra: Value) -> String {
    let mut obj = json!({ "type": "system", "event": event });
    if let Value::Object(extra) = extra {
        for (k, v) in extra {
            obj[k] = v;
        }
    }
    obj.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_with_fields() {
        let frame =
            parse_frame(r#"{"id": 7, "type": "store.insert", "bucket": "users", "data": {}}"#)
                .unwrap();
        let ClientFrame::Request(req) = frame else {
            panic!("expected request");
        };
        assert_eq!(req.id, 7);
        assert_eq!(req.kind, "store.insert");
        assert_eq!(req.str_field("bucket").unwrap(), "users");
        // Envelope fields are stripped from the parameter map.
        assert!(!req.fields.contains_key("id"));
        assert!(!req.fields.contains_key("type"));
    }

    #[test]
    fn parses_pong_without_id() {
        let frame = parse_frame(r#"{"type": "pong", "timestamp": 123}"#).unwrap();
        let ClientFrame::Pong { timestamp } = frame else {
            panic!("expected pong");
        };
        assert_eq!(timestamp, Some(123));
    }

    #[test]
    fn invalid_json_is_parse_error() {
        let err = parse_frame("{not json").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ParseError);
    }

    #[test]
    fn non_object_is_parse_error() {
        let err = parse_frame("[1, 2, 3]").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ParseError);
    }

    #[test]
    fn missing_id_is_invalid_request() {
        let err = parse_frame(r#"{"type": "store.all"}"#).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
    }

    #[test]
    fn bad_type_field_is_invalid_request() {
        for raw in [r#"{"id": 1}"#, r#"{"id": 1, "type": ""}"#, r#"{"id": 1, "type": 5}"#] {
            let err = parse_frame(raw).unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidRequest, "frame: {raw}");
        }
    }

    #[test]
    fn result_round_trips_through_parse() {
        let data = serde_json::json!({ "name": "Alice" });
        let raw = result(4, &data);
        let ClientFrame::Request(req) = parse_frame(&raw).unwrap() else {
            panic!("expected request shape");
        };
        assert_eq!(req.id, 4);
        assert_eq!(req.kind, "result");
        assert_eq!(req.value_field("data"), data);
    }

    #[test]
    fn error_frame_shape() {
        let err = RequestError::new(ErrorKind::RateLimited, "Rate limit exceeded")
            .with_details(serde_json::json!({ "retryAfterMs": 250 }));
        let raw = error(9, &err);
        let v: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["id"], 9);
        assert_eq!(v["type"], "error");
        assert_eq!(v["code"], "RATE_LIMITED");
        assert_eq!(v["details"]["retryAfterMs"], 250);
    }

    #[test]
    fn welcome_frame_shape() {
        let v: Value = serde_json::from_str(&welcome(true)).unwrap();
        assert_eq!(v["type"], "welcome");
        assert_eq!(v["version"], PROTOCOL_VERSION);
        assert_eq!(v["requiresAuth"], true);
        assert!(v["serverTime"].is_i64());
    }

    #[test]
    fn system_frame_merges_extra_fields() {
        let raw = system("shutdown", serde_json::json!({ "graceMs": 500 }));
        let v: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["type"], "system");
        assert_eq!(v["event"], "shutdown");
        assert_eq!(v["graceMs"], 500);
    }
}
