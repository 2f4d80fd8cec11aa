//! Error types for mcp-host.
//!
//! Lifecycle errors ([`ServerError`]) are always broadcast on the event
//! channel before being returned to the caller. Per-request errors
//! ([`RequestError`]) never leave the request that produced them.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read configuration file: {path}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Configuration file could not be parsed.
    #[error("failed to parse configuration file: {path}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Configuration file not found.
    #[error("configuration file not found: {path}")]
    NotFound {
        /// Path where the configuration file was expected.
        path: PathBuf,
    },

    /// Configuration validation failed.
    #[error("configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation failure.
        message: String,
    },
}

/// Errors raised while binding, running or closing a transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The listening socket could not be bound.
    #[error("failed to bind {addr}")]
    Bind {
        /// Address the bind was attempted on.
        addr: SocketAddr,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The stream source could not produce a reader/writer pair.
    #[error("stream source unavailable")]
    StreamUnavailable(#[source] std::io::Error),

    /// The HTTP server stopped with an IO error.
    #[error("HTTP server failed")]
    Serve(#[source] std::io::Error),

    /// A transport background task panicked or was cancelled.
    #[error("transport task failed: {0}")]
    Task(String),

    /// The transport is already open.
    #[error("transport already open")]
    AlreadyOpen,

    /// The transport has already been closed.
    #[error("transport already closed")]
    AlreadyClosed,

    /// A per-request transport was asked to carry a second message.
    #[error("request transport already dispatched its message")]
    ExchangeComplete,

    /// The engine refused a session for this transport.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Errors raised by the protocol engine and its sessions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The engine was closed and accepts no new sessions.
    #[error("protocol engine is closed")]
    Closed,

    /// The session was already closed.
    #[error("session {0} already closed")]
    SessionClosed(uuid::Uuid),
}

/// Why a tool call produced no result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    /// The arguments did not match the tool's input schema.
    #[error("{0}")]
    InvalidArguments(String),

    /// The handler panicked.
    #[error("tool '{tool}' panicked: {message}")]
    Panicked {
        /// Name of the tool.
        tool: String,
        /// Panic payload, when it was a string.
        message: String,
    },
}

/// Errors returned by lifecycle operations on the server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Binding or tearing down the transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Opening or closing the protocol engine failed.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// A previous stop failed and has not been acknowledged.
    #[error("server is faulted after a failed stop; call acknowledge_fault() first")]
    Faulted,
}

/// Errors isolated to a single HTTP request.
#[derive(Error, Debug)]
pub enum RequestError {
    /// The engine refused or failed the request's session.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The request's transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A tool handler failed while serving the request.
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// The reply could not be serialised.
    #[error("failed to serialise reply")]
    Serialise(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let error = ConfigError::NotFound {
            path: PathBuf::from("/path/to/config.json"),
        };
        let msg = error.to_string();
        assert!(msg.contains("not found"));
        assert!(msg.contains("config.json"));
    }

    #[test]
    fn validation_error_display() {
        let error = ConfigError::ValidationError {
            message: "invalid setting".to_string(),
        };
        let msg = error.to_string();
        assert!(msg.contains("invalid setting"));
    }

    #[test]
    fn bind_error_keeps_source() {
        use std::error::Error as _;

        let error = TransportError::Bind {
            addr: SocketAddr::from(([127, 0, 0, 1], 4000)),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert!(error.to_string().contains("127.0.0.1:4000"));
        assert!(error.source().is_some());
    }

    #[test]
    fn server_error_is_transparent() {
        let error = ServerError::from(EngineError::Closed);
        assert_eq!(error.to_string(), "protocol engine is closed");
    }
}
