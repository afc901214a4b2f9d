use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::error::{Error, ErrorKind, Result};

/// Transport inactive, malformed response or send failure.
pub const CODE_BAD_REQUEST: i64 = 400;
/// No response arrived before the configured deadline.
pub const CODE_TIMEOUT: i64 = 408;
/// The transport went down while the request was pending.
pub const CODE_UNAVAILABLE: i64 = 503;

/// Identity of one request, unique among the outstanding requests of a client.
///
/// Identities are allocated from a wrapping 32-bit counter. On the wire they are
/// plain JSON numbers; incoming identities are also accepted as numeric strings.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct RequestId(pub u32);

impl RequestId {
    /// Normalizes a wire `id` field. Returns `None` for anything that cannot be
    /// one of our identities, which makes the envelope undeliverable.
    #[must_use]
    pub fn from_wire(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => match n.as_u64() {
                Some(v) => u32::try_from(v).ok().map(Self),
                // whole floats such as `42.0` name the same request.
                None => n
                    .as_f64()
                    .filter(|v| v.fract() == 0.0 && (0.0..=f64::from(u32::MAX)).contains(v))
                    .map(|v| Self(v as u32)),
            },
            // only the canonical decimal form matches, `042` or ` 42` do not.
            Value::String(s) => s
                .parse::<u32>()
                .ok()
                .filter(|v| v.to_string() == *s)
                .map(Self),
            _ => None,
        }
    }
}

/// `null`, `false`, `0` and `""` count as absent in envelope fields.
fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(_) | Value::Object(_) => false,
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Request envelope handed to a transport.
///
/// Serialized as `{"method": .., "args": .., "tag": .., "id": ..}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OutgoingPacket {
    /// Name of the remote method.
    pub method: String,
    /// Arguments, an empty object when the caller passed `null`, `false`, `0`
    /// or `""`.
    pub args: Value,
    /// Caller-supplied correlation label, empty by default.
    pub tag: String,
    /// Identity used to match the response.
    pub id: RequestId,
}

/// Error object of a failed call, either received on the wire or synthesized
/// locally (see the `CODE_*` constants).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

impl RemoteError {
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn inactive() -> Self {
        Self::new(
            CODE_BAD_REQUEST,
            "RPC transport is not active. Subscribe to on(open) event.",
        )
    }

    #[must_use]
    pub fn timed_out() -> Self {
        Self::new(CODE_TIMEOUT, "Request timed out.")
    }

    #[must_use]
    pub fn unavailable() -> Self {
        Self::new(CODE_UNAVAILABLE, "The transport is not active.")
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RemoteError {}

impl From<RemoteError> for Error {
    fn from(value: RemoteError) -> Self {
        Error::new(ErrorKind::Remote(value.code), value.message)
    }
}

/// A validated response envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingEnvelope {
    /// Normalized identity, `None` when the `id` field holds something that
    /// cannot match any request.
    pub id: Option<RequestId>,
    pub tag: Option<String>,
    pub outcome: std::result::Result<Value, RemoteError>,
}

/// What a caller finally receives for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub tag: Option<String>,
    pub result: std::result::Result<Value, RemoteError>,
}

impl Reply {
    #[must_use]
    pub fn error(error: RemoteError, tag: Option<String>) -> Self {
        Self {
            tag,
            result: Err(error),
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    /// Deserializes the result into a typed value.
    ///
    /// # Errors
    ///
    /// Returns `ErrorKind::Remote` for an error reply and `SerdeJsonError` when
    /// the result does not have the expected shape.
    pub fn deserialize<T: DeserializeOwned>(self) -> Result<T> {
        let value = self.result?;
        Ok(serde_json::from_value(value)?)
    }
}

impl From<IncomingEnvelope> for Reply {
    fn from(envelope: IncomingEnvelope) -> Self {
        Self {
            tag: envelope.tag,
            result: envelope.outcome,
        }
    }
}

/// Builds the request envelope for one call.
#[must_use]
pub fn build_request(method: &str, args: Value, tag: &str, id: RequestId) -> OutgoingPacket {
    let args = if is_falsy(&args) {
        Value::Object(Map::new())
    } else {
        args
    };
    OutgoingPacket {
        method: method.to_string(),
        args,
        tag: tag.to_string(),
        id,
    }
}

/// Synthesizes a failure envelope for a request that never got a wire
/// response, keeping the request's identity and tag.
#[must_use]
pub fn compose_local_error(packet: &OutgoingPacket, code: i64, message: &str) -> Value {
    serde_json::json!({
        "id": packet.id,
        "tag": packet.tag,
        "error": {
            "code": code,
            "message": message,
        },
    })
}

/// Checks the shape of a response payload.
///
/// # Errors
///
/// Fails with `ErrorKind::MalformedResponse` when the payload is not a JSON
/// object or has no `id` field.
pub fn validate_envelope(raw: Value) -> Result<IncomingEnvelope> {
    let Value::Object(mut object) = raw else {
        return Err(Error::new(
            ErrorKind::MalformedResponse,
            "The response is not valid JSON object.",
        ));
    };

    let Some(id) = object.get("id") else {
        return Err(Error::new(
            ErrorKind::MalformedResponse,
            "Malformed JSON object (missing ID property).",
        ));
    };
    let id = RequestId::from_wire(id);

    let tag = match object.remove("tag") {
        Some(Value::String(tag)) if !tag.is_empty() => Some(tag),
        _ => None,
    };

    // `error` wins over `result` when a server sends both. A falsy `error`
    // (JSON-RPC 1.0 style `"error": null`) is a success.
    let outcome = match object.remove("error").filter(|error| !is_falsy(error)) {
        Some(error) => Err(serde_json::from_value::<RemoteError>(error.clone())
            .unwrap_or_else(|_| RemoteError::new(CODE_BAD_REQUEST, error.to_string()))),
        None => Ok(object.remove("result").unwrap_or(Value::Null)),
    };

    Ok(IncomingEnvelope { id, tag, outcome })
}

/// Parses raw bytes received from the wire and validates the envelope.
///
/// # Errors
///
/// Returns `ErrorKind::ParseFailed` when the bytes are not JSON, otherwise the
/// errors of [`validate_envelope`].
pub fn parse_envelope(bytes: &[u8]) -> Result<IncomingEnvelope> {
    let raw: Value = serde_json::from_slice(bytes).map_err(|e| {
        Error::new(
            ErrorKind::ParseFailed,
            format!("Unable to parse JSON string: {e}"),
        )
    })?;
    validate_envelope(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_request() {
        let packet = build_request("sum", json!([1, 2]), "t1", RequestId(7));
        assert_eq!(
            serde_json::to_value(&packet).unwrap(),
            json!({"method": "sum", "args": [1, 2], "tag": "t1", "id": 7})
        );

        let packet = build_request("ping", Value::Null, "", RequestId(8));
        assert_eq!(packet.args, json!({}));
        assert_eq!(packet.tag, "");

        for falsy in [json!(false), json!(0), json!("")] {
            let packet = build_request("ping", falsy, "", RequestId(9));
            assert_eq!(packet.args, json!({}));
        }
        let packet = build_request("ping", json!([]), "", RequestId(10));
        assert_eq!(packet.args, json!([]));
    }

    #[test]
    fn test_request_id_from_wire() {
        assert_eq!(RequestId::from_wire(&json!(42)), Some(RequestId(42)));
        assert_eq!(RequestId::from_wire(&json!("42")), Some(RequestId(42)));
        assert_eq!(RequestId::from_wire(&json!(-1)), None);
        assert_eq!(RequestId::from_wire(&json!(1.5)), None);
        assert_eq!(RequestId::from_wire(&json!(42.0)), Some(RequestId(42)));
        assert_eq!(RequestId::from_wire(&json!(-3.0)), None);
        assert_eq!(RequestId::from_wire(&json!(1e12)), None);
        assert_eq!(RequestId::from_wire(&json!(" 42 ")), None);
        assert_eq!(RequestId::from_wire(&json!("042")), None);
        assert_eq!(RequestId::from_wire(&json!("+42")), None);
        assert_eq!(RequestId::from_wire(&json!("abc")), None);
        assert_eq!(RequestId::from_wire(&json!(null)), None);
        assert_eq!(RequestId::from_wire(&json!(u64::MAX)), None);
    }

    #[test]
    fn test_validate_success() {
        let envelope = validate_envelope(json!({"id": 3, "tag": "x", "result": {"v": 1}})).unwrap();
        assert_eq!(envelope.id, Some(RequestId(3)));
        assert_eq!(envelope.tag.as_deref(), Some("x"));
        assert_eq!(envelope.outcome, Ok(json!({"v": 1})));

        let envelope = validate_envelope(json!({"id": 3})).unwrap();
        assert_eq!(envelope.tag, None);
        assert_eq!(envelope.outcome, Ok(Value::Null));

        let envelope = validate_envelope(json!({"id": 3, "tag": "", "result": 1})).unwrap();
        assert_eq!(envelope.tag, None);
    }

    #[test]
    fn test_validate_error_precedence() {
        let envelope = validate_envelope(json!({
            "id": 4,
            "result": 1,
            "error": {"code": 500, "message": "boom"},
        }))
        .unwrap();
        assert_eq!(envelope.outcome, Err(RemoteError::new(500, "boom")));

        let envelope = validate_envelope(json!({"id": 4, "error": "oops"})).unwrap();
        assert_eq!(envelope.outcome, Err(RemoteError::new(400, "\"oops\"")));

        for falsy in [json!(null), json!(false), json!(0), json!("")] {
            let envelope =
                validate_envelope(json!({"id": 1, "result": 5, "error": falsy})).unwrap();
            assert_eq!(envelope.outcome, Ok(json!(5)));
        }
    }

    #[test]
    fn test_validate_malformed() {
        let err = validate_envelope(json!([1, 2])).unwrap_err();
        assert_eq!(err.kind, ErrorKind::MalformedResponse);

        let err = validate_envelope(json!({"result": 1})).unwrap_err();
        assert_eq!(err.kind, ErrorKind::MalformedResponse);

        let err = parse_envelope(b"{not json").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ParseFailed);

        // an id that cannot be ours is still a valid envelope, it just never matches
        let envelope = parse_envelope(br#"{"id": "abc", "result": 1}"#).unwrap();
        assert_eq!(envelope.id, None);

        let envelope = parse_envelope(br#"{"id": 42.0, "result": 1}"#).unwrap();
        assert_eq!(envelope.id, Some(RequestId(42)));
    }

    #[test]
    fn test_compose_local_error() {
        let packet = build_request("m", json!({}), "tag", RequestId(9));
        let raw = compose_local_error(&packet, 400, "Unable to send packet via WS.");
        let envelope = validate_envelope(raw).unwrap();
        assert_eq!(envelope.id, Some(RequestId(9)));
        assert_eq!(envelope.tag.as_deref(), Some("tag"));
        assert_eq!(
            envelope.outcome,
            Err(RemoteError::new(400, "Unable to send packet via WS."))
        );
    }

    #[test]
    fn test_reply_deserialize() {
        let reply = Reply {
            tag: None,
            result: Ok(json!(5)),
        };
        assert_eq!(reply.deserialize::<u32>().unwrap(), 5);

        let reply = Reply::error(RemoteError::timed_out(), None);
        let err = reply.deserialize::<u32>().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Remote(408));
    }
}
