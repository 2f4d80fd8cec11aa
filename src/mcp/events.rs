//! Lifecycle and request events.
//!
//! [`EventChannel`] is a synchronous publish/subscribe broadcaster. Emitting
//! an event calls every listener registered for its [`EventKind`], in
//! registration order, before `emit` returns. Listener panics are not
//! caught.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{RequestError, ServerError};
use crate::mcp::tools::ToolInfo;
use crate::mcp::transport::ConnectionInfo;

/// Names listeners subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// `start()` began.
    Starting,
    /// `start()` failed.
    StartFailed,
    /// The transport is bound and accepting work.
    Ready,
    /// `stop()` began.
    Stopping,
    /// `stop()` completed.
    Stopped,
    /// `stop()` failed.
    StopFailed,
    /// An HTTP request arrived.
    RequestReceived,
    /// An HTTP request failed.
    RequestFailed,
    /// An HTTP request's exchange is over.
    RequestCompleted,
}

/// An event, borrowing its payload from the emitter.
#[derive(Debug, Clone, Copy)]
pub enum ServerEvent<'a> {
    /// `start()` began.
    Starting,
    /// `start()` failed; the error is also returned to the caller.
    StartFailed {
        /// Why the start failed.
        error: &'a ServerError,
    },
    /// The transport is bound.
    Ready {
        /// Where the server can be reached.
        connection: &'a ConnectionInfo,
        /// Tools registered at the time of binding.
        tools: &'a [ToolInfo],
    },
    /// `stop()` began.
    Stopping,
    /// `stop()` completed.
    Stopped,
    /// `stop()` failed; the error is also returned to the caller.
    StopFailed {
        /// Why the stop failed.
        error: &'a ServerError,
    },
    /// An HTTP request arrived.
    RequestReceived {
        /// The raw request.
        request: &'a RequestRecord,
    },
    /// An HTTP request failed.
    RequestFailed {
        /// The raw request.
        request: &'a RequestRecord,
        /// What went wrong.
        error: &'a RequestError,
    },
    /// An HTTP request's exchange is over. Emitted exactly once per request.
    RequestCompleted {
        /// The raw request.
        request: &'a RequestRecord,
        /// The response sent, if one was produced before the exchange ended.
        response: Option<&'a ResponseRecord>,
    },
}

impl ServerEvent<'_> {
    /// Returns the kind listeners subscribe to for this event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Starting => EventKind::Starting,
            Self::StartFailed { .. } => EventKind::StartFailed,
            Self::Ready { .. } => EventKind::Ready,
            Self::Stopping => EventKind::Stopping,
            Self::Stopped => EventKind::Stopped,
            Self::StopFailed { .. } => EventKind::StopFailed,
            Self::RequestReceived { .. } => EventKind::RequestReceived,
            Self::RequestFailed { .. } => EventKind::RequestFailed,
            Self::RequestCompleted { .. } => EventKind::RequestCompleted,
        }
    }
}

/// An inbound HTTP request as seen by listeners.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    /// Identifier assigned on arrival.
    pub id: Uuid,
    /// HTTP method.
    pub method: String,
    /// Request path.
    pub path: String,
    /// Arrival time.
    pub received_at: DateTime<Utc>,
    /// Raw request body.
    pub body: String,
}

impl RequestRecord {
    /// Creates a record stamped with a fresh ID and the current time.
    #[must_use]
    pub fn new(method: impl Into<String>, path: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            method: method.into(),
            path: path.into(),
            received_at: Utc::now(),
            body: body.into(),
        }
    }
}

/// The response sent for an HTTP request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseRecord {
    /// HTTP status code.
    pub status: u16,
    /// Response body, absent for empty responses.
    pub body: Option<String>,
}

/// Handle returned by [`EventChannel::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&ServerEvent<'_>) + Send + Sync>;

/// Synchronous, ordered publish/subscribe channel.
#[derive(Default)]
pub struct EventChannel {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, EventKind, Listener)>>,
}

impl EventChannel {
    /// Creates a channel with no listeners.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `listener` to events of `kind`.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&ServerEvent<'_>) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, kind, Arc::new(listener)));
        id
    }

    /// Removes a listener. Returns `false` if it was not subscribed.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _, _)| *existing != id);
        listeners.len() != before
    }

    /// Number of listeners subscribed to `kind`.
    #[must_use]
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners
            .read()
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .count()
    }

    /// Delivers `event` to its listeners in registration order.
    pub fn emit(&self, event: &ServerEvent<'_>) {
        let kind = event.kind();
        // Snapshot so listeners may subscribe or unsubscribe while running.
        let targets: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, listener)| Arc::clone(listener))
            .collect();

        tracing::trace!(event = ?kind, listeners = targets.len(), "Emitting event");

        for listener in targets {
            listener(event);
        }
    }
}

impl std::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChannel")
            .field("listeners", &self.listeners.read().len())
            .finish_non_exhaustive()
    }
}
