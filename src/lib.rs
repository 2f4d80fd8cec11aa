//! mcp-host: lifecycle controller for Model Context Protocol tool servers
//!
//! This library hosts a set of tools behind an MCP endpoint and manages the
//! endpoint's lifecycle explicitly: start, stop, restart, with every
//! transition broadcast to subscribers.
//!
//! # Architecture
//!
//! The controller owns a tool registry that outlives individual runs. Each
//! start builds a fresh protocol engine from that registry and binds one of
//! two transports:
//!
//! - **Stream**: newline-delimited JSON-RPC over stdin/stdout (or any duplex
//!   pair), one stateful session for the connection
//! - **HTTP**: `POST /mcp` on loopback, each request in its own isolated
//!   stateless session
//!
//! # Modules
//!
//! - [`builtin`] - Demonstration tools registered by the binary
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Error types
//! - [`mcp`] - MCP protocol, transports and lifecycle

pub mod builtin;
pub mod config;
pub mod error;
pub mod mcp;
