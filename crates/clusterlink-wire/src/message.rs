//! Wire protocol message types.
//!
//! All communication between a cluster and an event-loop uses JSON-framed
//! messages over TCP. Each frame is prefixed with a 4-byte big-endian length
//! header. After a `StartTLS` upgrade the frame body is ciphertext instead of
//! JSON; see [`crate::secure`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Command names understood by the core. Application commands share the same
/// framing and dispatch mechanism.
pub mod commands {
    /// Ask the peer who it is. Regions answer `{"name"}`, clusters `{"uuid"}`.
    pub const IDENTIFY: &str = "Identify";
    /// Upgrade the transport. Empty request, empty response.
    pub const START_TLS: &str = "StartTLS";
    /// Enumerate boot images available on a cluster.
    pub const LIST_BOOT_IMAGES: &str = "ListBootImages";
    /// Describe the power types a cluster can drive.
    pub const DESCRIBE_POWER_TYPES: &str = "DescribePowerTypes";
}

/// Malformed or out-of-place request.
pub const ERR_BAD_REQUEST: i32 = 400;
/// Request received before the transport was secured.
pub const ERR_UNAUTHENTICATED: i32 = 401;
/// No responder registered for the command.
pub const ERR_UNHANDLED_COMMAND: i32 = 404;
/// Responder failed.
pub const ERR_INTERNAL: i32 = 500;

/// Maximum single frame size (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// A wire protocol message (envelope).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    /// Unique message ID. Responses echo the request's ID.
    pub id: String,
    /// Message variant.
    #[serde(flatten)]
    pub kind: WireMessageKind,
}

/// The different kinds of wire messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessageKind {
    /// Request from one side to the other.
    #[serde(rename = "request")]
    Request(WireRequest),
    /// Response to a request.
    #[serde(rename = "response")]
    Response(WireResponse),
}

/// A command invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRequest {
    /// Command name, e.g. [`commands::IDENTIFY`].
    pub command: String,
    /// Command arguments.
    #[serde(default = "empty_body")]
    pub args: Value,
}

/// Result of a command invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum WireResponse {
    #[serde(rename = "ok")]
    Ok {
        #[serde(default = "empty_body")]
        body: Value,
    },
    #[serde(rename = "error")]
    Error {
        /// Error code.
        code: i32,
        /// Error message.
        message: String,
    },
}

impl WireResponse {
    /// Successful response with an empty body.
    pub fn empty() -> Self {
        Self::Ok { body: empty_body() }
    }

    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }
}

impl WireMessage {
    /// Build a request with a fresh message ID.
    pub fn request(command: &str, args: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: WireMessageKind::Request(WireRequest {
                command: command.to_string(),
                args,
            }),
        }
    }

    /// Build the response to the request with ID `id`.
    pub fn response(id: &str, response: WireResponse) -> Self {
        Self {
            id: id.to_string(),
            kind: WireMessageKind::Response(response),
        }
    }
}

/// An empty JSON object, the body of argument-less commands.
pub fn empty_body() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Prefix a frame body with its 4-byte big-endian length.
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let len = body.len() as u32;
    let mut bytes = Vec::with_capacity(4 + body.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(body);
    bytes
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a JSON body into a WireMessage.
pub fn decode_message(body: &[u8]) -> Result<WireMessage, serde_json::Error> {
    serde_json::from_slice(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_decode_request() {
        let msg = WireMessage::request(commands::IDENTIFY, empty_body());
        let bytes = encode_frame(&serde_json::to_vec(&msg).unwrap());
        let len = decode_length(&[bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(len as usize, bytes.len() - 4);
        let decoded = decode_message(&bytes[4..]).unwrap();
        assert_eq!(decoded.id, msg.id);
        match decoded.kind {
            WireMessageKind::Request(req) => {
                assert_eq!(req.command, "Identify");
                assert_eq!(req.args, json!({}));
            }
            other => panic!("Expected Request, got {other:?}"),
        }
    }

    #[test]
    fn test_response_wire_shape() {
        let msg = WireMessage::response(
            "req-1",
            WireResponse::Ok {
                body: json!({"name": "eloop-A"}),
            },
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["id"], "req-1");
        assert_eq!(value["type"], "response");
        assert_eq!(value["status"], "ok");
        assert_eq!(value["body"]["name"], "eloop-A");
    }

    #[test]
    fn test_error_response() {
        let msg = WireMessage::response("err-1", WireResponse::error(404, "Unhandled command"));
        let json = serde_json::to_string(&msg).unwrap();
        let decoded: WireMessage = serde_json::from_str(&json).unwrap();
        match decoded.kind {
            WireMessageKind::Response(WireResponse::Error { code, message }) => {
                assert_eq!(code, 404);
                assert_eq!(message, "Unhandled command");
            }
            other => panic!("Expected Error, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_args_default_to_empty_object() {
        let decoded: WireMessage =
            serde_json::from_str(r#"{"id":"x","type":"request","command":"StartTLS"}"#).unwrap();
        match decoded.kind {
            WireMessageKind::Request(req) => assert_eq!(req.args, json!({})),
            other => panic!("Expected Request, got {other:?}"),
        }
    }
}
