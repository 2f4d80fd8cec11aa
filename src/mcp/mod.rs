//! Model Context Protocol (MCP) server implementation.
//!
//! This module exposes registered tools to MCP clients over JSON-RPC 2.0,
//! either on a duplex stream (stdio) or over stateless HTTP.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        McpServer                             │
//! │                (lifecycle + tool registry)                   │
//! │                                                              │
//! │   ┌─────────────┐    ┌─────────────┐    ┌─────────────┐      │
//! │   │  Transport  │───▶│   Engine    │───▶│   Tools     │      │
//! │   │(stream/http)│    │ (sessions)  │    │ (handlers)  │      │
//! │   └─────────────┘    └─────────────┘    └─────────────┘      │
//! │          │                                                   │
//! │          ▼                                                   │
//! │   ┌─────────────┐         ┌──────────────────────────┐       │
//! │   │  Isolation  │────────▶│       EventChannel       │       │
//! │   │(per request)│         │  (lifecycle + requests)  │       │
//! │   └─────────────┘         └──────────────────────────┘       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Protocol Version
//!
//! This implementation targets MCP protocol version 2025-03-26 and also
//! accepts 2024-11-05.

pub mod engine;
pub mod events;
pub mod isolation;
pub mod protocol;
pub mod server;
pub mod tools;
pub mod transport;

pub use engine::{ProtocolEngine, Session, SessionMode};
pub use events::{EventChannel, EventKind, ServerEvent};
pub use protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, MCP_PROTOCOL_VERSION};
pub use server::{McpServer, RunState, ServerStatus};
pub use tools::{ToolCallResult, ToolDefinition, ToolInfo};
pub use transport::{ConnectionInfo, HttpTransport, StreamTransport, Transport};
