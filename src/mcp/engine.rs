//! Protocol engine: the MCP request dispatcher.
//!
//! The engine owns the operation table for one server run. Every transport
//! connection talks to it through its own [`Session`], which carries the
//! handshake state and the set of request IDs already used on that
//! connection. Sessions never share correlation state, so two connections
//! may reuse the same request ID freely.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::{EngineError, ToolError};
use crate::mcp::protocol::{
    parse_message, ErrorCode, IncomingMessage, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, OutgoingMessage, RequestId,
    MCP_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
use crate::mcp::tools::{ToolCallResult, ToolDefinition, ToolInfo};

/// Server capabilities advertised during initialisation.
#[derive(Debug, Clone, Serialize)]
pub struct ServerCapabilities {
    /// Tool-related capabilities.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolCapabilities>,
}

impl Default for ServerCapabilities {
    fn default() -> Self {
        Self {
            tools: Some(ToolCapabilities { list_changed: true }),
        }
    }
}

/// Tool-specific capabilities.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolCapabilities {
    /// Whether the tool list can change during the session.
    #[serde(rename = "listChanged")]
    pub list_changed: bool,
}

/// Server information for initialisation response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerInfo {
    /// Server name.
    pub name: String,
    /// Server version.
    pub version: String,
    /// Server description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl From<&ServerConfig> for ServerInfo {
    fn from(config: &ServerConfig) -> Self {
        Self {
            name: config.name.clone(),
            version: config.version.clone(),
            description: config.description.clone(),
        }
    }
}

/// Client information received during initialisation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    /// Client name.
    pub name: String,
    /// Client version.
    #[serde(default)]
    pub version: Option<String>,
}

/// Parameters for the initialize request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// Protocol version requested by client.
    pub protocol_version: String,
    /// Client capabilities.
    #[serde(default)]
    pub capabilities: Value,
    /// Client information.
    #[serde(default)]
    pub client_info: Option<ClientInfo>,
}

/// Parameters for tools/call request.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallParams {
    /// Name of the tool to call.
    pub name: String,
    /// Arguments for the tool.
    #[serde(default)]
    pub arguments: Value,
}

/// How a session treats the initialisation handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Long-lived connection; `tools/*` require `initialize` first.
    Stateful,
    /// One exchange per session; every request is accepted immediately.
    Stateless,
}

/// Handshake state of a stateful session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for initialize request.
    AwaitingInit,
    /// Initialize received, waiting for initialized notification.
    Initialising,
    /// Ready for normal operation.
    Ready,
}

/// The MCP request dispatcher for one server run.
#[derive(Debug)]
pub struct ProtocolEngine {
    info: ServerInfo,
    operations: RwLock<IndexMap<String, ToolDefinition>>,
    sessions: Mutex<HashSet<Uuid>>,
    closed: AtomicBool,
}

impl ProtocolEngine {
    /// Creates an engine with an empty operation table.
    #[must_use]
    pub fn new(info: ServerInfo) -> Self {
        Self {
            info,
            operations: RwLock::new(IndexMap::new()),
            sessions: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the identity reported in `initialize`.
    #[must_use]
    pub const fn info(&self) -> &ServerInfo {
        &self.info
    }

    /// Makes `tool` callable. A tool with the same name is replaced.
    ///
    /// Returns `true` if an existing operation was replaced.
    pub fn register_operation(&self, tool: ToolDefinition) -> bool {
        let name = tool.name.clone();
        let replaced = self.operations.write().insert(name.clone(), tool).is_some();
        if replaced {
            tracing::warn!(tool = %name, "Replacing previously registered tool");
        } else {
            tracing::debug!(tool = %name, "Registered tool");
        }
        replaced
    }

    /// Returns descriptors for every operation in registration order.
    #[must_use]
    pub fn operations(&self) -> Vec<ToolInfo> {
        self.operations
            .read()
            .values()
            .map(ToolDefinition::info)
            .collect()
    }

    /// Opens a session bound to one transport connection.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Closed`] once the engine has been closed.
    pub fn open_session(self: &Arc<Self>, mode: SessionMode) -> Result<Session, EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }

        let id = Uuid::new_v4();
        self.sessions.lock().insert(id);
        tracing::trace!(session = %id, ?mode, "Opened session");

        Ok(Session {
            id,
            mode,
            state: SessionState::AwaitingInit,
            engine: Arc::clone(self),
            seen_ids: HashSet::new(),
            protocol_version: None,
            fault: None,
            closed: false,
        })
    }

    /// Number of sessions opened and not yet closed.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Returns `true` once [`close`](Self::close) has succeeded.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Releases the operation table and refuses new sessions.
    ///
    /// Sessions still open keep working until their transport drops them,
    /// but find no operations.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Closed`] if the engine was already closed.
    pub fn close(&self) -> Result<(), EngineError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(EngineError::Closed);
        }

        let lingering = self.active_sessions();
        if lingering > 0 {
            tracing::warn!(sessions = lingering, "Closing engine with sessions still open");
        }
        self.operations.write().clear();
        tracing::debug!("Protocol engine closed");
        Ok(())
    }

    fn lookup(&self, name: &str) -> Option<ToolDefinition> {
        self.operations.read().get(name).cloned()
    }

    fn release(&self, session: Uuid) {
        self.sessions.lock().remove(&session);
    }
}

/// One connection's view of the engine.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    mode: SessionMode,
    state: SessionState,
    engine: Arc<ProtocolEngine>,
    seen_ids: HashSet<RequestId>,
    protocol_version: Option<String>,
    fault: Option<ToolError>,
    closed: bool,
}

impl Session {
    /// Returns the session identifier.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the session mode.
    #[must_use]
    pub const fn mode(&self) -> SessionMode {
        self.mode
    }

    /// Returns the handshake state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Protocol version agreed during `initialize`, if it happened.
    #[must_use]
    pub fn protocol_version(&self) -> Option<&str> {
        self.protocol_version.as_deref()
    }

    /// Takes the tool failure recorded by the last `tools/call`, if any.
    ///
    /// The caller has already received a `-32603` reply for it.
    pub fn take_fault(&mut self) -> Option<ToolError> {
        self.fault.take()
    }

    /// Returns `true` once the session has been closed.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Parses and handles one raw message.
    ///
    /// Returns the message to send back, or `None` for notifications.
    pub fn handle_line(&mut self, line: &str) -> Option<OutgoingMessage> {
        match parse_message(line) {
            Ok(msg) => self.handle_message(msg),
            Err(error) => Some(error.into()),
        }
    }

    /// Handles a parsed incoming message.
    pub fn handle_message(&mut self, msg: IncomingMessage) -> Option<OutgoingMessage> {
        if self.closed {
            return Some(
                JsonRpcError::with_code(msg.id().cloned(), ErrorCode::InternalError, "Session closed")
                    .into(),
            );
        }

        match msg {
            IncomingMessage::Request(req) => Some(self.handle_request(req)),
            IncomingMessage::Notification(ref notif) => {
                self.handle_notification(notif);
                None
            }
        }
    }

    /// Closes the session and releases its slot in the engine.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::SessionClosed`] if already closed.
    pub fn close(&mut self) -> Result<(), EngineError> {
        if self.closed {
            return Err(EngineError::SessionClosed(self.id));
        }
        self.closed = true;
        self.engine.release(self.id);
        tracing::trace!(session = %self.id, "Closed session");
        Ok(())
    }

    fn handle_request(&mut self, req: JsonRpcRequest) -> OutgoingMessage {
        tracing::debug!(session = %self.id, id = %req.id, method = %req.method, "Handling request");

        if !self.seen_ids.insert(req.id.clone()) {
            return JsonRpcError::with_code(
                Some(req.id.clone()),
                ErrorCode::InvalidRequest,
                format!("Duplicate request id: {}", req.id),
            )
            .into();
        }

        let response = match req.method.as_str() {
            "initialize" => self.handle_initialize(&req),
            "tools/list" => self.handle_tools_list(&req),
            "tools/call" => self.handle_tools_call(&req),
            "ping" => Ok(Self::handle_ping(&req)),
            _ => Err(JsonRpcError::method_not_found(req.id.clone(), &req.method)),
        };

        match response {
            Ok(resp) => resp.into(),
            Err(error) => error.into(),
        }
    }

    fn handle_notification(&mut self, notif: &JsonRpcNotification) {
        if notif.method == "notifications/initialized" && self.state == SessionState::Initialising {
            self.state = SessionState::Ready;
        }
    }

    fn handle_initialize(&mut self, req: &JsonRpcRequest) -> Result<JsonRpcResponse, JsonRpcError> {
        if self.mode == SessionMode::Stateful && self.state != SessionState::AwaitingInit {
            return Err(JsonRpcError::with_code(
                Some(req.id.clone()),
                ErrorCode::InvalidRequest,
                "Session already initialised",
            ));
        }

        let params: InitializeParams = req
            .params
            .as_ref()
            .map(|p| serde_json::from_value(p.clone()))
            .transpose()
            .map_err(|e| {
                JsonRpcError::invalid_params(
                    req.id.clone(),
                    format!("Invalid initialize params: {e}"),
                )
            })?
            .ok_or_else(|| {
                JsonRpcError::invalid_params(req.id.clone(), "Missing initialize params")
            })?;

        let negotiated_version = negotiate_version(&params.protocol_version);
        if let Some(client) = &params.client_info {
            tracing::info!(
                session = %self.id,
                client = %client.name,
                version = client.version.as_deref().unwrap_or("unknown"),
                protocol = negotiated_version,
                "Client initialising"
            );
        }

        self.protocol_version = Some(negotiated_version.to_string());
        self.state = SessionState::Initialising;

        let result = json!({
            "protocolVersion": negotiated_version,
            "capabilities": ServerCapabilities::default(),
            "serverInfo": self.engine.info(),
        });

        Ok(JsonRpcResponse::success(req.id.clone(), result))
    }

    fn handle_tools_list(&self, req: &JsonRpcRequest) -> Result<JsonRpcResponse, JsonRpcError> {
        self.require_ready(&req.id)?;

        let result = json!({
            "tools": self.engine.operations(),
        });

        Ok(JsonRpcResponse::success(req.id.clone(), result))
    }

    fn handle_tools_call(&mut self, req: &JsonRpcRequest) -> Result<JsonRpcResponse, JsonRpcError> {
        self.require_ready(&req.id)?;

        let params: ToolCallParams = req
            .params
            .as_ref()
            .map(|p| serde_json::from_value(p.clone()))
            .transpose()
            .map_err(|e| {
                JsonRpcError::invalid_params(
                    req.id.clone(),
                    format!("Invalid tool call params: {e}"),
                )
            })?
            .ok_or_else(|| {
                JsonRpcError::invalid_params(req.id.clone(), "Missing tool call params")
            })?;

        let arguments = if params.arguments.is_null() {
            json!({})
        } else {
            params.arguments
        };

        let result = match self.engine.lookup(&params.name) {
            Some(tool) => match tool.call(arguments) {
                Ok(result) => result,
                Err(ToolError::InvalidArguments(message)) => {
                    return Err(JsonRpcError::invalid_params(req.id.clone(), message));
                }
                Err(fault) => {
                    tracing::error!(session = %self.id, id = %req.id, error = %fault, "Tool handler failed");
                    self.fault = Some(fault);
                    return Err(JsonRpcError::internal_error(req.id.clone(), "Tool handler failed"));
                }
            },
            None => ToolCallResult::error(format!("Unknown tool: {}", params.name)),
        };

        let result_value = serde_json::to_value(&result).map_err(|e| {
            tracing::error!(error = %e, "Failed to serialise tool call result");
            JsonRpcError::internal_error(req.id.clone(), "Internal error: failed to serialise result")
        })?;

        Ok(JsonRpcResponse::success(req.id.clone(), result_value))
    }

    fn handle_ping(req: &JsonRpcRequest) -> JsonRpcResponse {
        JsonRpcResponse::success(req.id.clone(), json!({}))
    }

    fn require_ready(&self, id: &RequestId) -> Result<(), JsonRpcError> {
        if self.mode == SessionMode::Stateful && self.state != SessionState::Ready {
            return Err(JsonRpcError::with_code(
                Some(id.clone()),
                ErrorCode::InvalidRequest,
                "Session not initialised",
            ));
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.closed {
            self.engine.release(self.id);
        }
    }
}

fn negotiate_version(requested: &str) -> &'static str {
    SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .find(|v| **v == requested)
        .copied()
        .unwrap_or(MCP_PROTOCOL_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Arc<ProtocolEngine> {
        let engine = Arc::new(ProtocolEngine::new(ServerInfo {
            name: "test".to_string(),
            version: "0.0.1".to_string(),
            description: None,
        }));
        engine.register_operation(ToolDefinition::new(
            "echo",
            "Echo the value",
            json!({
                "type": "object",
                "properties": { "value": { "type": "string" } },
                "required": ["value"]
            }),
            |args| ToolCallResult::text(args["value"].as_str().unwrap_or_default()),
        ));
        engine
    }

    fn call(session: &mut Session, line: &str) -> Value {
        let out = session.handle_line(line).expect("expected a reply");
        serde_json::to_value(out).unwrap()
    }

    #[test]
    fn stateful_session_requires_handshake() {
        let engine = engine();
        let mut session = engine.open_session(SessionMode::Stateful).unwrap();

        let reply = call(&mut session, r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#);
        assert_eq!(reply["error"]["code"], -32600);

        let reply = call(
            &mut session,
            r#"{"jsonrpc":"2.0","id":2,"method":"initialize","params":{"protocolVersion":"2024-11-05","capabilities":{}}}"#,
        );
        assert_eq!(reply["result"]["protocolVersion"], "2024-11-05");
        assert_eq!(reply["result"]["serverInfo"]["name"], "test");
        assert_eq!(session.state(), SessionState::Initialising);

        assert!(session
            .handle_line(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .is_none());
        assert_eq!(session.state(), SessionState::Ready);

        let reply = call(&mut session, r#"{"jsonrpc":"2.0","id":3,"method":"tools/list"}"#);
        assert_eq!(reply["result"]["tools"][0]["name"], "echo");
    }

    #[test]
    fn unknown_protocol_version_falls_back_to_latest() {
        assert_eq!(negotiate_version("1999-01-01"), MCP_PROTOCOL_VERSION);
        assert_eq!(negotiate_version("2024-11-05"), "2024-11-05");
    }

    #[test]
    fn stateless_session_calls_tools_directly() {
        let engine = engine();
        let mut session = engine.open_session(SessionMode::Stateless).unwrap();

        let reply = call(
            &mut session,
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"echo","arguments":{"value":"x"}}}"#,
        );
        assert_eq!(reply["result"]["content"][0]["text"], "x");
    }

    #[test]
    fn invalid_arguments_are_invalid_params() {
        let engine = engine();
        let mut session = engine.open_session(SessionMode::Stateless).unwrap();

        let reply = call(
            &mut session,
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"echo","arguments":{}}}"#,
        );
        assert_eq!(reply["error"]["code"], -32602);
    }

    #[test]
    fn unknown_tool_is_a_tool_error() {
        let engine = engine();
        let mut session = engine.open_session(SessionMode::Stateless).unwrap();

        let reply = call(
            &mut session,
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"nope"}}"#,
        );
        assert_eq!(reply["result"]["isError"], true);
    }

    #[test]
    fn unknown_method_is_method_not_found() {
        let engine = engine();
        let mut session = engine.open_session(SessionMode::Stateless).unwrap();

        let reply = call(&mut session, r#"{"jsonrpc":"2.0","id":9,"method":"resources/list"}"#);
        assert_eq!(reply["error"]["code"], -32601);
        assert_eq!(reply["id"], 9);
    }

    #[test]
    fn duplicate_id_rejected_within_session_only() {
        let engine = engine();
        let mut first = engine.open_session(SessionMode::Stateless).unwrap();
        let mut second = engine.open_session(SessionMode::Stateless).unwrap();
        let ping = r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#;

        assert!(call(&mut first, ping).get("result").is_some());
        assert_eq!(call(&mut first, ping)["error"]["code"], -32600);
        assert!(call(&mut second, ping).get("result").is_some());
    }

    #[test]
    fn sessions_are_tracked_until_closed() {
        let engine = engine();
        let mut first = engine.open_session(SessionMode::Stateless).unwrap();
        let second = engine.open_session(SessionMode::Stateless).unwrap();
        assert_eq!(engine.active_sessions(), 2);

        first.close().unwrap();
        assert_eq!(engine.active_sessions(), 1);
        assert!(!second.is_closed());
        assert_eq!(first.close(), Err(EngineError::SessionClosed(first.id())));

        drop(second);
        assert_eq!(engine.active_sessions(), 0);
    }

    #[test]
    fn closed_engine_refuses_sessions() {
        let engine = engine();
        engine.close().unwrap();

        assert!(engine.operations().is_empty());
        assert_eq!(
            engine.open_session(SessionMode::Stateless).unwrap_err(),
            EngineError::Closed
        );
        assert_eq!(engine.close(), Err(EngineError::Closed));
    }

    #[test]
    fn re_registering_replaces_operation() {
        let engine = engine();
        let replaced = engine.register_operation(ToolDefinition::new(
            "echo",
            "Shout the value",
            json!({"type": "object"}),
            |_| ToolCallResult::text("LOUD"),
        ));
        assert!(replaced);
        assert_eq!(engine.operations().len(), 1);
        assert_eq!(
            engine.operations()[0].description.as_deref(),
            Some("Shout the value")
        );
    }

    #[test]
    fn parse_error_has_null_id() {
        let engine = engine();
        let mut session = engine.open_session(SessionMode::Stateful).unwrap();

        let reply = call(&mut session, "{oops");
        assert_eq!(reply["error"]["code"], -32700);
        assert!(reply["id"].is_null());
    }

    #[test]
    fn panicking_tool_replies_internal_error_and_records_fault() {
        let engine = engine();
        engine.register_operation(ToolDefinition::new(
            "boom",
            "Panics",
            json!({"type": "object"}),
            |_| panic!("kaboom"),
        ));
        let mut session = engine.open_session(SessionMode::Stateless).unwrap();

        let reply = call(
            &mut session,
            r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"boom"}}"#,
        );
        assert_eq!(reply["id"], 4);
        assert_eq!(reply["error"]["code"], -32603);
        assert!(matches!(
            session.take_fault(),
            Some(ToolError::Panicked { ref tool, .. }) if tool == "boom"
        ));
        assert!(session.take_fault().is_none());

        // The session keeps serving.
        let reply = call(
            &mut session,
            r#"{"jsonrpc":"2.0","id":5,"method":"tools/call","params":{"name":"echo","arguments":{"value":"ok"}}}"#,
        );
        assert_eq!(reply["result"]["content"][0]["text"], "ok");
    }
}
