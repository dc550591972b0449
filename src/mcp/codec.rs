//! JSON-RPC message codec.
//!
//! Turns bytes into [`Message`] values and back. Framing (line boundaries,
//! SSE events) belongs to the transports; this module only ever sees one
//! complete message at a time.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::Result;
use crate::mcp::protocol::{
    ErrorKind, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, Message,
    RequestId, JSONRPC_VERSION,
};

/// Why a frame could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    /// Not valid JSON at all.
    Parse,
    /// Valid JSON, but not a well-formed JSON-RPC message.
    MalformedMessage,
}

impl From<DecodeErrorKind> for ErrorKind {
    fn from(kind: DecodeErrorKind) -> Self {
        match kind {
            DecodeErrorKind::Parse => ErrorKind::Parse,
            DecodeErrorKind::MalformedMessage => ErrorKind::MalformedMessage,
        }
    }
}

/// A frame that failed to decode.
///
/// `id` is set when the frame carried a usable correlation id, in which case
/// the peer can be answered with an error response.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind:?}: {message}")]
pub struct DecodeError {
    pub kind: DecodeErrorKind,
    pub id: Option<RequestId>,
    pub message: String,
}

impl DecodeError {
    pub fn new(kind: DecodeErrorKind, id: Option<RequestId>, message: impl Into<String>) -> Self {
        Self {
            kind,
            id,
            message: message.into(),
        }
    }

    pub fn malformed(id: Option<RequestId>, message: impl Into<String>) -> Self {
        Self::new(DecodeErrorKind::MalformedMessage, id, message)
    }

    /// The error response for this failure, if the peer can be answered.
    pub fn to_response(&self) -> Option<JsonRpcResponse> {
        self.id.clone().map(|id| {
            JsonRpcResponse::failure(id, JsonRpcError::new(self.kind.into(), self.message.clone()))
        })
    }
}

/// Encode a message to bytes (no trailing newline).
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

/// Encode a message to a string (no trailing newline).
pub fn encode_to_string(message: &Message) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

/// Decode one message from bytes.
pub fn decode(bytes: &[u8]) -> std::result::Result<Message, DecodeError> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| DecodeError::new(DecodeErrorKind::Parse, None, e.to_string()))?;
    decode_value(value)
}

/// Shape of the `id` member.
enum IdField {
    Absent,
    Valid(RequestId),
    Invalid,
}

fn id_field(obj: &Map<String, Value>) -> IdField {
    match obj.get("id") {
        None => IdField::Absent,
        Some(Value::String(s)) => IdField::Valid(RequestId::String(s.clone())),
        Some(Value::Number(n)) => match n.as_i64() {
            Some(n) => IdField::Valid(RequestId::Number(n)),
            None => IdField::Invalid,
        },
        Some(_) => IdField::Invalid,
    }
}

/// Decode one message from an already-parsed JSON value.
pub fn decode_value(value: Value) -> std::result::Result<Message, DecodeError> {
    let obj = match value {
        Value::Object(obj) => obj,
        Value::Array(_) => {
            return Err(DecodeError::malformed(None, "batch messages are not supported"))
        }
        _ => return Err(DecodeError::malformed(None, "expected a JSON object")),
    };

    let id = id_field(&obj);
    let usable_id = match &id {
        IdField::Valid(id) => Some(id.clone()),
        _ => None,
    };

    match obj.get("jsonrpc").and_then(Value::as_str) {
        Some(JSONRPC_VERSION) => {}
        _ => {
            return Err(DecodeError::malformed(
                usable_id,
                "missing or unsupported jsonrpc version",
            ))
        }
    }

    if let Some(method) = obj.get("method") {
        let method = method
            .as_str()
            .ok_or_else(|| DecodeError::malformed(usable_id.clone(), "method must be a string"))?
            .to_string();
        let params = match obj.get("params") {
            None | Some(Value::Null) => None,
            Some(p @ (Value::Object(_) | Value::Array(_))) => Some(p.clone()),
            Some(_) => {
                return Err(DecodeError::malformed(
                    usable_id,
                    "params must be an object or an array",
                ))
            }
        };

        return match id {
            IdField::Valid(id) => Ok(Message::Request(JsonRpcRequest {
                jsonrpc: JSONRPC_VERSION.to_string(),
                id,
                method,
                params,
            })),
            IdField::Absent => Ok(Message::Notification(JsonRpcNotification {
                jsonrpc: JSONRPC_VERSION.to_string(),
                method,
                params,
            })),
            IdField::Invalid => Err(DecodeError::malformed(
                None,
                "id must be a string or an integer",
            )),
        };
    }

    let Some(id) = usable_id else {
        return Err(DecodeError::malformed(None, "message has neither method nor id"));
    };

    match (obj.get("result"), obj.get("error")) {
        (Some(result), None) => Ok(Message::Response(JsonRpcResponse::success(
            id,
            result.clone(),
        ))),
        (None, Some(error)) => {
            let error: JsonRpcError = serde_json::from_value(error.clone()).map_err(|e| {
                DecodeError::malformed(Some(id.clone()), format!("invalid error object: {}", e))
            })?;
            Ok(Message::Response(JsonRpcResponse::failure(id, error)))
        }
        (Some(_), Some(_)) => Err(DecodeError::malformed(
            Some(id),
            "response carries both result and error",
        )),
        (None, None) => Err(DecodeError::malformed(
            Some(id),
            "response carries neither result nor error",
        )),
    }
}
