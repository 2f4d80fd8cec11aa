//! JSON-RPC 2.0 framing for MCP.
//!
//! Inbound text goes through [`parse_message`], which either classifies it
//! as a request (has an `id`) or a notification (no `id`), or produces the
//! error reply to send back. Everything written to a peer is an
//! [`OutgoingMessage`].
//!
//! MCP narrows JSON-RPC in two ways: request IDs are strings or integers
//! (never `null`), and an ID may be used only once per session. The first
//! rule is enforced here; the second by the session.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// The newest MCP protocol version this implementation speaks.
pub const MCP_PROTOCOL_VERSION: &str = "2025-03-26";

/// Every protocol version accepted during `initialize`, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &[MCP_PROTOCOL_VERSION, "2024-11-05"];

const JSONRPC_VERSION: &str = "2.0";

/// A request ID: an integer or a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric request ID.
    Number(i64),
    /// String request ID.
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

/// An inbound call expecting a reply.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcRequest {
    /// Correlates the reply with this request.
    pub id: RequestId,
    /// Method to invoke.
    pub method: String,
    /// Method parameters, if any.
    pub params: Option<Value>,
}

/// An inbound one-way message.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcNotification {
    /// Notification name.
    pub method: String,
    /// Notification parameters, if any.
    pub params: Option<Value>,
}

/// A parsed inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    /// Needs a reply.
    Request(JsonRpcRequest),
    /// Must not be replied to.
    Notification(JsonRpcNotification),
}

impl IncomingMessage {
    /// Returns the method name.
    #[must_use]
    pub fn method(&self) -> &str {
        match self {
            Self::Request(req) => &req.method,
            Self::Notification(notif) => &notif.method,
        }
    }

    /// Returns the request ID, or `None` for notifications.
    #[must_use]
    pub const fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(req) => Some(&req.id),
            Self::Notification(_) => None,
        }
    }
}

/// A successful reply.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    /// Always "2.0".
    pub jsonrpc: &'static str,
    /// ID of the request being answered.
    pub id: RequestId,
    /// Method result.
    pub result: Value,
}

impl JsonRpcResponse {
    /// Creates a success reply.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Value is not const-compatible
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result,
        }
    }
}

/// Error codes used in replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    /// The text was not valid JSON.
    ParseError = -32700,
    /// The JSON was not a valid request object.
    InvalidRequest = -32600,
    /// Unknown method.
    MethodNotFound = -32601,
    /// Bad method parameters.
    InvalidParams = -32602,
    /// The server failed while handling the message.
    InternalError = -32603,
    /// The HTTP endpoint does not serve the verb used.
    MethodNotAllowed = -32000,
}

impl ErrorCode {
    /// Returns the numeric code.
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }

    const fn message(self) -> &'static str {
        match self {
            Self::ParseError => "Parse error",
            Self::InvalidRequest => "Invalid Request",
            Self::MethodNotFound => "Method not found",
            Self::InvalidParams => "Invalid params",
            Self::InternalError => "Internal error",
            Self::MethodNotAllowed => "Method not allowed",
        }
    }
}

/// The `error` member of an error reply.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorObject {
    /// Numeric error code.
    pub code: i32,
    /// Short description.
    pub message: String,
    /// Extra detail, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// An error reply.
///
/// `id` is always written, as `null` when the request ID is unknown.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcError {
    /// Always "2.0".
    pub jsonrpc: &'static str,
    /// What went wrong.
    pub error: ErrorObject,
    /// ID of the failed request, if it could be read.
    pub id: Option<RequestId>,
}

impl JsonRpcError {
    /// Creates an error reply with a custom message.
    #[must_use]
    pub fn with_code(id: Option<RequestId>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            error: ErrorObject {
                code: code.code(),
                message: message.into(),
                data: None,
            },
            id,
        }
    }

    fn standard(id: Option<RequestId>, code: ErrorCode) -> Self {
        Self::with_code(id, code, code.message())
    }

    /// Attaches extra detail.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.error.data = Some(data);
        self
    }

    /// The text could not be parsed as JSON.
    #[must_use]
    pub fn parse_error() -> Self {
        Self::standard(None, ErrorCode::ParseError)
    }

    /// The JSON was not a valid message.
    #[must_use]
    pub fn invalid_request(id: Option<RequestId>) -> Self {
        Self::standard(id, ErrorCode::InvalidRequest)
    }

    /// No handler for `method`.
    #[must_use]
    pub fn method_not_found(id: RequestId, method: &str) -> Self {
        Self::with_code(
            Some(id),
            ErrorCode::MethodNotFound,
            format!("Method not found: {method}"),
        )
    }

    /// The parameters were rejected.
    #[must_use]
    pub fn invalid_params(id: RequestId, message: impl Into<String>) -> Self {
        Self::with_code(Some(id), ErrorCode::InvalidParams, message)
    }

    /// Handling failed inside the server.
    #[must_use]
    pub fn internal_error(id: RequestId, message: impl Into<String>) -> Self {
        Self::with_code(Some(id), ErrorCode::InternalError, message)
    }

    /// Rejection for HTTP verbs the endpoint does not serve.
    #[must_use]
    pub fn method_not_allowed() -> Self {
        Self::standard(None, ErrorCode::MethodNotAllowed)
    }

    /// Failure before any reply was produced.
    #[must_use]
    pub fn internal_server_error() -> Self {
        Self::with_code(None, ErrorCode::InternalError, "Internal server error")
    }

    /// Returns `true` for parse and invalid-request errors with no known ID.
    #[must_use]
    pub fn is_malformed_input(&self) -> bool {
        self.id.is_none()
            && (self.error.code == ErrorCode::ParseError.code()
                || self.error.code == ErrorCode::InvalidRequest.code())
    }
}

/// Anything a session writes back to its peer.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OutgoingMessage {
    /// A successful reply.
    Response(JsonRpcResponse),
    /// An error reply.
    Error(JsonRpcError),
}

impl From<JsonRpcResponse> for OutgoingMessage {
    fn from(response: JsonRpcResponse) -> Self {
        Self::Response(response)
    }
}

impl From<JsonRpcError> for OutgoingMessage {
    fn from(error: JsonRpcError) -> Self {
        Self::Error(error)
    }
}

/// Loosely typed view of an inbound object, checked by [`parse_message`].
#[derive(Deserialize)]
struct Envelope {
    jsonrpc: Option<String>,
    // `Some(Value::Null)` for an explicit `"id": null`, `None` when absent.
    #[serde(default, deserialize_with = "present")]
    id: Option<Value>,
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
}

fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

/// Parses one inbound message.
///
/// # Errors
///
/// Returns the error reply for text that is not JSON (`-32700`) or not a
/// valid request or notification (`-32600`).
pub fn parse_message(raw: &str) -> Result<IncomingMessage, JsonRpcError> {
    let value: Value = serde_json::from_str(raw).map_err(|_| JsonRpcError::parse_error())?;
    if !value.is_object() {
        return Err(JsonRpcError::parse_error());
    }

    let envelope = Envelope::deserialize(value).map_err(|_| JsonRpcError::invalid_request(None))?;
    if envelope.jsonrpc.as_deref() != Some(JSONRPC_VERSION) {
        return Err(JsonRpcError::invalid_request(None));
    }

    let id = envelope
        .id
        .map(serde_json::from_value::<RequestId>)
        .transpose()
        .map_err(|_| JsonRpcError::invalid_request(None))?;

    let method = match envelope.method {
        Some(method) if !method.is_empty() => method,
        _ => return Err(JsonRpcError::invalid_request(id)),
    };

    Ok(match id {
        Some(id) => IncomingMessage::Request(JsonRpcRequest {
            id,
            method,
            params: envelope.params,
        }),
        None => IncomingMessage::Notification(JsonRpcNotification {
            method,
            params: envelope.params,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_and_notification_are_told_apart_by_id() {
        let request = parse_message(r#"{"jsonrpc":"2.0","id":"a-1","method":"ping"}"#).unwrap();
        assert_eq!(request.id(), Some(&RequestId::String("a-1".to_string())));
        assert_eq!(request.method(), "ping");

        let notification =
            parse_message(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).unwrap();
        assert!(notification.id().is_none());
    }

    #[test]
    fn params_are_kept_verbatim() {
        let msg = parse_message(r#"{"jsonrpc":"2.0","id":3,"method":"x","params":{"k":[1,2]}}"#)
            .unwrap();
        let IncomingMessage::Request(req) = msg else {
            panic!("expected a request");
        };
        assert_eq!(req.params, Some(json!({"k": [1, 2]})));
    }

    #[test]
    fn explicit_null_id_is_malformed() {
        let err = parse_message(r#"{"jsonrpc":"2.0","id":null,"method":"ping"}"#).unwrap_err();
        assert_eq!(err.error.code, -32600);
        assert!(err.is_malformed_input());
    }

    #[test]
    fn fractional_id_is_malformed() {
        let err = parse_message(r#"{"jsonrpc":"2.0","id":1.5,"method":"ping"}"#).unwrap_err();
        assert!(err.is_malformed_input());
    }

    #[test]
    fn non_json_and_non_objects_are_parse_errors() {
        for raw in ["not valid json", "[1,2]", "\"text\""] {
            let err = parse_message(raw).unwrap_err();
            assert_eq!(err.error.code, -32700, "input: {raw}");
        }
    }

    #[test]
    fn wrong_version_is_invalid_request() {
        let err = parse_message(r#"{"jsonrpc":"1.0","id":1,"method":"ping"}"#).unwrap_err();
        assert_eq!(err.error.code, -32600);
    }

    #[test]
    fn empty_method_keeps_the_id() {
        let err = parse_message(r#"{"jsonrpc":"2.0","id":4,"method":""}"#).unwrap_err();
        assert_eq!(err.id, Some(RequestId::Number(4)));
        assert!(!err.is_malformed_input());
    }

    #[test]
    fn method_not_allowed_body() {
        assert_eq!(
            serde_json::to_value(JsonRpcError::method_not_allowed()).unwrap(),
            json!({
                "jsonrpc": "2.0",
                "error": { "code": -32000, "message": "Method not allowed" },
                "id": null
            })
        );
    }

    #[test]
    fn internal_server_error_body() {
        let value = serde_json::to_value(JsonRpcError::internal_server_error()).unwrap();
        assert_eq!(value["error"]["code"], -32603);
        assert_eq!(value["error"]["message"], "Internal server error");
        assert!(value["id"].is_null());
    }

    #[test]
    fn error_data_is_optional() {
        let bare = serde_json::to_value(JsonRpcError::parse_error()).unwrap();
        assert!(bare["error"].get("data").is_none());

        let detailed = JsonRpcError::parse_error().with_data(json!({"offset": 3}));
        let value = serde_json::to_value(detailed).unwrap();
        assert_eq!(value["error"]["data"]["offset"], 3);
    }

    #[test]
    fn response_field_order() {
        let msg: OutgoingMessage = JsonRpcResponse::success(RequestId::Number(7), json!({"ok": true})).into();
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"jsonrpc":"2.0","id":7,"result":{"ok":true}}"#
        );
    }
}
