//! Transports carrying MCP messages.
//!
//! Both strategies sit behind [`Transport`]: `open` binds and starts
//! serving, `close` stops accepting work and waits for the background task
//! to finish. Dropping a transport aborts whatever it still runs.
//!
//! - [`StreamTransport`]: newline-delimited JSON-RPC over a duplex stream
//!   (stdin/stdout by default), one stateful session for the connection.
//! - [`HttpTransport`]: stateless JSON-RPC over `POST /mcp` on loopback,
//!   one isolated session per request.

mod http;
mod stream;

pub use http::{router, HttpState, HttpTransport, MCP_PATH};
pub use stream::{
    stdio_source, BoxedReader, BoxedWriter, LentReader, LineChannel, ReaderPool, StreamSource,
    StreamTransport,
};

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;

use crate::error::TransportError;
use crate::mcp::engine::ProtocolEngine;
use crate::mcp::events::EventChannel;

/// Where a running server can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum ConnectionInfo {
    /// Reachable over the process's duplex stream.
    Stream,
    /// Reachable over HTTP.
    Http {
        /// Host name clients should use.
        host: String,
        /// Bound port.
        port: u16,
    },
}

/// A bindable connection strategy.
#[async_trait]
pub trait Transport: Send {
    /// Binds the transport and starts handing messages to `engine`.
    ///
    /// On failure nothing stays bound.
    async fn open(
        &mut self,
        engine: Arc<ProtocolEngine>,
        events: Arc<EventChannel>,
    ) -> Result<ConnectionInfo, TransportError>;

    /// Stops accepting work and waits for in-flight work to finish.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Flips to `true` when the peer ends the connection on its own.
    fn closed_signal(&self) -> Option<watch::Receiver<bool>> {
        None
    }
}

/// Builds a fresh transport for each start.
pub type TransportFactory = Box<dyn Fn() -> Box<dyn Transport> + Send + Sync>;
