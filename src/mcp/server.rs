//! Lifecycle controller for an MCP tool server.
//!
//! [`McpServer`] owns the configuration, the tool registry and, while
//! running, the protocol engine and the bound transport:
//!
//! ```text
//!   Idle ──start──▶ Starting ──ok──▶ Running ──stop──▶ Stopping ──ok──▶ Idle
//!                      │                                   │
//!                      └──err──▶ Idle                      └──err──▶ Faulted
//! ```
//!
//! Every transition is broadcast on the [`EventChannel`] before the call
//! returns. A failed stop leaves handles in an unknown state, so the
//! controller refuses to start again until [`McpServer::acknowledge_fault`]
//! drops them.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{Instrument, Span};

use crate::config::{ServerConfig, TransportKind};
use crate::error::{ConfigError, ServerError};
use crate::mcp::engine::{ProtocolEngine, ServerInfo};
use crate::mcp::events::{EventChannel, EventKind, ListenerId, ServerEvent};
use crate::mcp::tools::{ToolDefinition, ToolInfo, ToolRegistry};
use crate::mcp::transport::{
    stdio_source, ConnectionInfo, HttpTransport, StreamSource, StreamTransport, Transport,
    TransportFactory,
};

/// Where the controller is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    /// Nothing bound.
    Idle,
    /// `start()` in progress.
    Starting,
    /// Transport bound and serving.
    Running,
    /// `stop()` in progress.
    Stopping,
    /// A stop failed; waiting for [`McpServer::acknowledge_fault`].
    Faulted,
}

/// Point-in-time snapshot returned by [`McpServer::status`].
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    /// Whether the transport is bound.
    pub running: bool,
    /// Lifecycle state.
    pub state: RunState,
    /// Registered tools in registration order.
    pub tools: Vec<ToolInfo>,
    /// Connection details, present only while running.
    pub connection: Option<ConnectionInfo>,
}

/// MCP tool server with an explicit start/stop lifecycle.
pub struct McpServer {
    config: ServerConfig,
    state: RunState,
    registry: ToolRegistry,
    engine: Option<Arc<ProtocolEngine>>,
    transport: Option<Box<dyn Transport>>,
    connection: Option<ConnectionInfo>,
    events: Arc<EventChannel>,
    factory: TransportFactory,
    span: Span,
}

impl McpServer {
    /// Creates an idle controller.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if `config` is invalid.
    pub fn new(
        config: ServerConfig,
        tools: impl IntoIterator<Item = ToolDefinition>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let span = tracing::info_span!("mcp_server", name = %config.name);
        if config.transport == TransportKind::Stream && config.port.is_some() {
            span.in_scope(|| {
                tracing::warn!(port = ?config.port, "Port is ignored by the stream transport");
            });
        }

        let mut registry = ToolRegistry::new();
        for tool in tools {
            if let Some(replaced) = registry.register(tool) {
                span.in_scope(|| {
                    tracing::warn!(tool = %replaced.name, "Replacing previously registered tool");
                });
            }
        }

        let factory = transport_factory(&config, stdio_source());
        Ok(Self {
            config,
            state: RunState::Idle,
            registry,
            engine: None,
            transport: None,
            connection: None,
            events: Arc::new(EventChannel::new()),
            factory,
            span,
        })
    }

    /// Replaces stdin/stdout with another duplex source for the stream
    /// transport. Has no effect in HTTP mode.
    #[must_use]
    pub fn with_stream_io(mut self, source: StreamSource) -> Self {
        if self.config.transport != TransportKind::Stream {
            self.span.in_scope(|| {
                tracing::warn!("Stream source ignored by the {} transport", self.config.transport);
            });
        }
        self.factory = transport_factory(&self.config, source);
        self
    }

    /// Replaces the transport strategy entirely.
    #[must_use]
    pub fn with_transport_factory(mut self, factory: TransportFactory) -> Self {
        self.factory = factory;
        self
    }

    /// Runs every log line and transport task of this controller inside `span`.
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Returns the configuration the controller was built with.
    #[must_use]
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Adds tools. While running they become callable immediately.
    ///
    /// A tool whose name is already registered replaces the earlier one in
    /// place.
    pub fn register_tools(&mut self, tools: impl IntoIterator<Item = ToolDefinition>) {
        let _entered = self.span.enter();
        for tool in tools {
            if let Some(engine) = &self.engine {
                engine.register_operation(tool.clone());
            }
            match self.registry.register(tool) {
                Some(replaced) if self.engine.is_none() => {
                    tracing::warn!(tool = %replaced.name, "Replacing previously registered tool");
                }
                Some(_) => {}
                None => tracing::debug!(tools = self.registry.len(), "Tool registered"),
            }
        }
    }

    /// Binds the transport and starts serving.
    ///
    /// Calling `start` while already running logs a warning and does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Faulted`] after an unacknowledged failed stop,
    /// or the transport error if binding fails. Either way `start-failed` is
    /// emitted first.
    pub async fn start(&mut self) -> Result<(), ServerError> {
        let span = self.span.clone();
        self.start_inner().instrument(span).await
    }

    async fn start_inner(&mut self) -> Result<(), ServerError> {
        match self.state {
            RunState::Idle => {}
            RunState::Running => {
                tracing::warn!("Server already running; start ignored");
                return Ok(());
            }
            RunState::Starting | RunState::Stopping => {
                // Only reachable if an earlier start/stop future was dropped mid-flight.
                tracing::error!(state = ?self.state, "Previous lifecycle call was interrupted");
                self.state = RunState::Faulted;
                return Err(self.broadcast_start_failure(ServerError::Faulted));
            }
            RunState::Faulted => {
                tracing::warn!("Start refused while faulted");
                return Err(self.broadcast_start_failure(ServerError::Faulted));
            }
        }

        self.state = RunState::Starting;
        self.events.emit(&ServerEvent::Starting);
        tracing::info!(
            version = %self.config.version,
            transport = %self.config.transport,
            "Starting MCP server"
        );

        let engine = Arc::new(ProtocolEngine::new(ServerInfo::from(&self.config)));
        for tool in self.registry.snapshot() {
            engine.register_operation(tool);
        }

        let mut transport = (self.factory)();
        match transport
            .open(Arc::clone(&engine), Arc::clone(&self.events))
            .await
        {
            Ok(connection) => {
                let tools = engine.operations();
                self.engine = Some(engine);
                self.transport = Some(transport);
                self.state = RunState::Running;

                tracing::info!(?connection, tools = tools.len(), "MCP server ready");
                self.events.emit(&ServerEvent::Ready {
                    connection: &connection,
                    tools: &tools,
                });
                self.connection = Some(connection);
                Ok(())
            }
            Err(e) => {
                drop(transport);
                if let Err(close_err) = engine.close() {
                    tracing::warn!(error = %close_err, "Engine close after failed start");
                }
                self.state = RunState::Idle;

                let error = ServerError::from(e);
                tracing::error!(error = %error, "Failed to start MCP server");
                Err(self.broadcast_start_failure(error))
            }
        }
    }

    fn broadcast_start_failure(&self, error: ServerError) -> ServerError {
        self.events.emit(&ServerEvent::StartFailed { error: &error });
        error
    }

    /// Closes the transport, then the engine.
    ///
    /// Calling `stop` while not running logs a warning and does nothing.
    ///
    /// # Errors
    ///
    /// Returns the first teardown error. The controller is then
    /// [`RunState::Faulted`] and `stop-failed` has been emitted.
    pub async fn stop(&mut self) -> Result<(), ServerError> {
        let span = self.span.clone();
        self.stop_inner().instrument(span).await
    }

    async fn stop_inner(&mut self) -> Result<(), ServerError> {
        if self.state != RunState::Running {
            tracing::warn!(state = ?self.state, "Server not running; stop ignored");
            return Ok(());
        }

        self.state = RunState::Stopping;
        self.events.emit(&ServerEvent::Stopping);
        tracing::info!("Stopping MCP server");

        match self.teardown().await {
            Ok(()) => {
                self.transport = None;
                self.engine = None;
                self.connection = None;
                self.state = RunState::Idle;

                tracing::info!("MCP server stopped");
                self.events.emit(&ServerEvent::Stopped);
                Ok(())
            }
            Err(error) => {
                tracing::error!(error = %error, "Failed to stop MCP server");
                self.state = RunState::Faulted;
                self.events.emit(&ServerEvent::StopFailed { error: &error });
                Err(error)
            }
        }
    }

    async fn teardown(&mut self) -> Result<(), ServerError> {
        if let Some(transport) = self.transport.as_mut() {
            transport.close().await?;
        }
        if let Some(engine) = &self.engine {
            engine.close()?;
        }
        Ok(())
    }

    /// Stops, then starts with a fresh engine and transport.
    ///
    /// # Errors
    ///
    /// Returns the stop error without attempting a start, or the start error.
    pub async fn restart(&mut self) -> Result<(), ServerError> {
        self.stop().await?;
        self.start().await
    }

    /// Leaves [`RunState::Faulted`], dropping whatever the failed stop left
    /// behind. Does nothing in any other state.
    pub fn acknowledge_fault(&mut self) {
        let _entered = self.span.enter();
        if self.state != RunState::Faulted {
            tracing::warn!(state = ?self.state, "No fault to acknowledge");
            return;
        }

        // Dropping the transport aborts its background task.
        self.transport = None;
        if let Some(engine) = self.engine.take() {
            if !engine.is_closed() {
                if let Err(e) = engine.close() {
                    tracing::warn!(error = %e, "Engine close during fault recovery");
                }
            }
        }
        self.connection = None;
        self.state = RunState::Idle;
        tracing::info!("Fault acknowledged; server idle");
    }

    /// Returns `true` while the transport is bound.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == RunState::Running
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub const fn state(&self) -> RunState {
        self.state
    }

    /// Returns an owned snapshot of the controller.
    #[must_use]
    pub fn status(&self) -> ServerStatus {
        ServerStatus {
            running: self.is_running(),
            state: self.state,
            tools: self.registry.infos(),
            connection: self.connection.clone(),
        }
    }

    /// Returns the event channel.
    #[must_use]
    pub const fn events(&self) -> &Arc<EventChannel> {
        &self.events
    }

    /// Subscribes `listener` to events of `kind`.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&ServerEvent<'_>) + Send + Sync + 'static,
    {
        self.events.on(kind, listener)
    }

    /// Returns a receiver that flips to `true` when the stream peer closes
    /// its input. `None` when not running or when the transport has no
    /// notion of a peer closing (HTTP).
    #[must_use]
    pub fn transport_closed(&self) -> Option<watch::Receiver<bool>> {
        self.transport.as_ref().and_then(|t| t.closed_signal())
    }
}

impl std::fmt::Debug for McpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpServer")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("tools", &self.registry.len())
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

fn transport_factory(config: &ServerConfig, source: StreamSource) -> TransportFactory {
    match config.transport {
        TransportKind::Stream => {
            Box::new(move || Box::new(StreamTransport::new(Arc::clone(&source))) as Box<dyn Transport>)
        }
        TransportKind::Http => {
            let port = config.port;
            Box::new(move || Box::new(HttpTransport::new(port)) as Box<dyn Transport>)
        }
    }
}
