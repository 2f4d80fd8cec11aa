//! Stateless HTTP transport.
//!
//! - POST `/mcp` - one JSON-RPC message per request, handled in its own
//!   isolated session (see [`crate::mcp::isolation`])
//! - any other verb on `/mcp` - 405 with a JSON-RPC error body
//!
//! No session identifier is issued or honoured; every request is
//! self-contained. The listener binds loopback only.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::{ConnectionInfo, Transport};
use crate::error::{RequestError, TransportError};
use crate::mcp::engine::ProtocolEngine;
use crate::mcp::events::{EventChannel, RequestRecord, ResponseRecord};
use crate::mcp::isolation::{Dispatch, RequestScope};
use crate::mcp::protocol::{JsonRpcError, OutgoingMessage};

/// Path the protocol endpoint is served on.
pub const MCP_PATH: &str = "/mcp";

/// Host name reported in [`ConnectionInfo::Http`].
const LOCAL_HOST: &str = "localhost";

/// Maximum request body size (4 MiB).
const MAX_BODY_SIZE: usize = 4 * 1024 * 1024;

/// Shared state handed to every request handler.
#[derive(Clone, Debug)]
pub struct HttpState {
    /// Engine requests are dispatched into.
    pub engine: Arc<ProtocolEngine>,
    /// Channel request events are emitted on.
    pub events: Arc<EventChannel>,
}

/// Builds the router serving [`MCP_PATH`].
pub fn router(state: HttpState) -> Router {
    Router::new()
        .route(MCP_PATH, post(handle_post).fallback(method_not_allowed))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}

/// Loopback HTTP listener with graceful shutdown.
#[derive(Debug, Default)]
pub struct HttpTransport {
    port: Option<u16>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<std::io::Result<()>>>,
}

impl HttpTransport {
    /// Creates a transport binding `port`, or a free port when `None`.
    #[must_use]
    pub const fn new(port: Option<u16>) -> Self {
        Self {
            port,
            shutdown: None,
            task: None,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(
        &mut self,
        engine: Arc<ProtocolEngine>,
        events: Arc<EventChannel>,
    ) -> Result<ConnectionInfo, TransportError> {
        if self.task.is_some() {
            return Err(TransportError::AlreadyOpen);
        }

        // Port 0 lets the OS pick a free ephemeral port.
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, self.port.unwrap_or(0)));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        let bound = listener
            .local_addr()
            .map_err(|source| TransportError::Bind { addr, source })?;

        let app = router(HttpState { engine, events });
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        });

        self.task = Some(tokio::spawn(
            async move { server.await }.instrument(tracing::Span::current()),
        ));
        self.shutdown = Some(shutdown_tx);

        tracing::info!(
            port = bound.port(),
            "MCP server listening on http://{LOCAL_HOST}:{}{MCP_PATH}",
            bound.port()
        );

        Ok(ConnectionInfo::Http {
            host: LOCAL_HOST.to_string(),
            port: bound.port(),
        })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let Some(task) = self.task.take() else {
            return Err(TransportError::AlreadyClosed);
        };

        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }

        task.await
            .map_err(|e| TransportError::Task(e.to_string()))?
            .map_err(TransportError::Serve)?;

        tracing::debug!("HTTP transport closed");
        Ok(())
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn handle_post(State(state): State<HttpState>, uri: Uri, body: Bytes) -> Response {
    let text = std::str::from_utf8(&body);
    let record = RequestRecord::new(
        Method::POST.as_str(),
        uri.path(),
        String::from_utf8_lossy(&body),
    );
    let mut scope = RequestScope::begin(record, Arc::clone(&state.events));

    let outcome = match text {
        Ok(_) => scope.dispatch(&state.engine),
        Err(e) => {
            tracing::debug!(request = %scope.request().id, error = %e, "Request body is not UTF-8");
            Ok(Dispatch::Reply(JsonRpcError::parse_error().into()))
        }
    };

    let (status, body) = match outcome.and_then(encode) {
        Ok(encoded) => encoded,
        Err(error) => {
            tracing::warn!(request = %scope.request().id, error = %error, "Request failed");
            let body = scope
                .fail(&error)
                .then(|| serde_json::to_string(&JsonRpcError::internal_server_error()).ok())
                .flatten();
            (StatusCode::INTERNAL_SERVER_ERROR, body)
        }
    };

    scope.respond(ResponseRecord {
        status: status.as_u16(),
        body: body.clone(),
    });
    scope.finish();

    match body {
        Some(body) => (status, [(header::CONTENT_TYPE, "application/json")], body).into_response(),
        None => status.into_response(),
    }
}

fn encode(dispatch: Dispatch) -> Result<(StatusCode, Option<String>), RequestError> {
    match dispatch {
        Dispatch::Accepted => Ok((StatusCode::ACCEPTED, None)),
        Dispatch::Reply(message) => {
            let status = match &message {
                OutgoingMessage::Error(error) if error.is_malformed_input() => {
                    StatusCode::BAD_REQUEST
                }
                _ => StatusCode::OK,
            };
            Ok((status, Some(serde_json::to_string(&message)?)))
        }
    }
}

async fn method_not_allowed(method: Method) -> Response {
    tracing::debug!(%method, "Rejecting unsupported method on {MCP_PATH}");
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, "POST")],
        Json(JsonRpcError::method_not_allowed()),
    )
        .into_response()
}
