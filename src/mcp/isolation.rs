//! Per-request isolation for the HTTP transport.
//!
//! The engine keys request correlation by session, so a session shared
//! between concurrent HTTP requests would see their IDs collide. Each
//! request therefore gets its own [`RequestTransport`] and its own
//! stateless [`Session`], both owned by a [`RequestScope`].
//!
//! The scope is torn down exactly once: explicitly through
//! [`RequestScope::finish`] when the exchange completes, or on drop when
//! the handler is cancelled because the client went away. Teardown closes
//! the transport, then the session, reports each failure as
//! `request-failed`, and always ends with `request-completed`.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::{RequestError, TransportError};
use crate::mcp::engine::{ProtocolEngine, Session, SessionMode};
use crate::mcp::events::{EventChannel, RequestRecord, ResponseRecord, ServerEvent};
use crate::mcp::protocol::OutgoingMessage;

/// Session-less transport carrying exactly one message in and at most one out.
#[derive(Debug)]
pub struct RequestTransport {
    id: Uuid,
    inbound: Option<String>,
    dispatched: bool,
    closed: bool,
}

impl RequestTransport {
    /// Creates a transport holding the raw request body.
    #[must_use]
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            inbound: Some(body.into()),
            dispatched: false,
            closed: false,
        }
    }

    /// Returns the transport identifier.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Feeds the request body through `session`.
    ///
    /// # Errors
    ///
    /// Fails if the transport is closed or its message was already dispatched.
    pub fn dispatch(&mut self, session: &mut Session) -> Result<Option<OutgoingMessage>, TransportError> {
        if self.closed {
            return Err(TransportError::AlreadyClosed);
        }
        let body = self.inbound.take().ok_or(TransportError::ExchangeComplete)?;

        let reply = session.handle_line(&body);
        self.dispatched = true;
        Ok(reply)
    }

    /// Returns `true` once the message has been handed to a session.
    #[must_use]
    pub const fn has_dispatched(&self) -> bool {
        self.dispatched
    }

    /// Returns `true` once closed.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Releases the transport.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::AlreadyClosed`] on a second call.
    pub fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::AlreadyClosed);
        }
        self.closed = true;
        self.inbound = None;
        Ok(())
    }
}

/// Outcome of dispatching one HTTP request.
#[derive(Debug)]
pub enum Dispatch {
    /// The message produced a reply.
    Reply(OutgoingMessage),
    /// The message was a notification; nothing to send back.
    Accepted,
}

/// Owns everything one HTTP request allocates.
pub struct RequestScope {
    record: RequestRecord,
    events: Arc<EventChannel>,
    transport: Option<RequestTransport>,
    session: Option<Session>,
    response: Option<ResponseRecord>,
    completed: bool,
}

impl RequestScope {
    /// Emits `request-received` and creates the request's transport.
    #[must_use]
    pub fn begin(record: RequestRecord, events: Arc<EventChannel>) -> Self {
        events.emit(&ServerEvent::RequestReceived { request: &record });
        let transport = RequestTransport::new(record.body.clone());

        tracing::debug!(request = %record.id, transport = %transport.id(), "Request scope opened");

        Self {
            record,
            events,
            transport: Some(transport),
            session: None,
            response: None,
            completed: false,
        }
    }

    /// Returns the request this scope belongs to.
    #[must_use]
    pub const fn request(&self) -> &RequestRecord {
        &self.record
    }

    /// Opens a fresh session on `engine`, binds it to this request's
    /// transport and dispatches the body.
    ///
    /// # Errors
    ///
    /// Fails if the engine is closed, the transport is no longer usable, or
    /// a tool handler failed. In the last case the session's own reply is
    /// discarded.
    pub fn dispatch(&mut self, engine: &Arc<ProtocolEngine>) -> Result<Dispatch, RequestError> {
        let transport = self
            .transport
            .as_mut()
            .ok_or(TransportError::AlreadyClosed)?;
        if self.session.is_some() {
            return Err(TransportError::ExchangeComplete.into());
        }
        let session = self.session.insert(engine.open_session(SessionMode::Stateless)?);

        let reply = transport.dispatch(session)?;
        if let Some(fault) = session.take_fault() {
            return Err(fault.into());
        }

        Ok(match reply {
            Some(reply) => Dispatch::Reply(reply),
            None => Dispatch::Accepted,
        })
    }

    /// Emits `request-failed`.
    ///
    /// Returns `true` if no response has been written yet, so an error
    /// response may still be sent.
    pub fn fail(&self, error: &RequestError) -> bool {
        self.events.emit(&ServerEvent::RequestFailed {
            request: &self.record,
            error,
        });
        self.response.is_none()
    }

    /// Records the response written to the client, as reported in
    /// `request-completed`.
    pub fn respond(&mut self, response: ResponseRecord) {
        self.response = Some(response);
    }

    /// Ends the exchange and tears the scope down.
    pub fn finish(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.completed {
            return;
        }
        self.completed = true;

        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close() {
                self.report(RequestError::Transport(e));
            }
        }
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.close() {
                self.report(RequestError::Engine(e));
            }
        }

        tracing::debug!(
            request = %self.record.id,
            status = self.response.as_ref().map(|r| r.status),
            "Request completed"
        );
        self.events.emit(&ServerEvent::RequestCompleted {
            request: &self.record,
            response: self.response.as_ref(),
        });
    }

    fn report(&self, error: RequestError) {
        tracing::warn!(request = %self.record.id, error = %error, "Request teardown step failed");
        self.events.emit(&ServerEvent::RequestFailed {
            request: &self.record,
            error: &error,
        });
    }
}

impl Drop for RequestScope {
    fn drop(&mut self) {
        if !self.completed {
            tracing::debug!(request = %self.record.id, "Request dropped before completion");
            self.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::engine::ServerInfo;
    use crate::mcp::events::EventKind;
    use crate::mcp::tools::{ToolCallResult, ToolDefinition};
    use parking_lot::Mutex;
    use serde_json::json;

    fn engine() -> Arc<ProtocolEngine> {
        let engine = Arc::new(ProtocolEngine::new(ServerInfo {
            name: "iso".to_string(),
            version: "0.0.1".to_string(),
            description: None,
        }));
        engine.register_operation(ToolDefinition::new(
            "echo",
            "Echo",
            json!({"type": "object"}),
            |args| ToolCallResult::structured(args),
        ));
        engine
    }

    fn recorder(events: &EventChannel) -> Arc<Mutex<Vec<EventKind>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        for kind in [
            EventKind::RequestReceived,
            EventKind::RequestFailed,
            EventKind::RequestCompleted,
        ] {
            let log = Arc::clone(&log);
            events.on(kind, move |event| log.lock().push(event.kind()));
        }
        log
    }

    const PING: &str = r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#;

    #[test]
    fn request_transport_carries_one_message() {
        let engine = engine();
        let mut session = engine.open_session(SessionMode::Stateless).unwrap();
        let mut transport = RequestTransport::new(PING);

        assert!(!transport.has_dispatched());
        assert!(transport.dispatch(&mut session).unwrap().is_some());
        assert!(transport.has_dispatched());
        assert!(matches!(
            transport.dispatch(&mut session),
            Err(TransportError::ExchangeComplete)
        ));

        transport.close().unwrap();
        assert!(matches!(transport.close(), Err(TransportError::AlreadyClosed)));
    }

    #[test]
    fn finish_emits_lifecycle_in_order() {
        let engine = engine();
        let events = Arc::new(EventChannel::new());
        let log = recorder(&events);

        let mut scope = RequestScope::begin(RequestRecord::new("POST", "/mcp", PING), Arc::clone(&events));
        assert!(matches!(scope.dispatch(&engine).unwrap(), Dispatch::Reply(_)));
        assert_eq!(engine.active_sessions(), 1);

        scope.respond(ResponseRecord {
            status: 200,
            body: None,
        });
        scope.finish();

        assert_eq!(engine.active_sessions(), 0);
        assert_eq!(
            *log.lock(),
            [EventKind::RequestReceived, EventKind::RequestCompleted]
        );
    }

    #[test]
    fn dropped_scope_still_completes_once() {
        let engine = engine();
        let events = Arc::new(EventChannel::new());
        let log = recorder(&events);

        let mut scope = RequestScope::begin(RequestRecord::new("POST", "/mcp", PING), Arc::clone(&events));
        scope.dispatch(&engine).unwrap();
        drop(scope);

        assert_eq!(engine.active_sessions(), 0);
        let completed = log
            .lock()
            .iter()
            .filter(|k| **k == EventKind::RequestCompleted)
            .count();
        assert_eq!(completed, 1);
    }

    #[test]
    fn closed_engine_fails_request_before_response() {
        let engine = engine();
        engine.close().unwrap();
        let events = Arc::new(EventChannel::new());
        let log = recorder(&events);

        let mut scope = RequestScope::begin(RequestRecord::new("POST", "/mcp", PING), Arc::clone(&events));
        let err = scope.dispatch(&engine).unwrap_err();
        assert!(matches!(err, RequestError::Engine(_)));
        assert!(scope.fail(&err));
        scope.finish();

        assert_eq!(
            *log.lock(),
            [
                EventKind::RequestReceived,
                EventKind::RequestFailed,
                EventKind::RequestCompleted
            ]
        );
    }

    #[test]
    fn concurrent_scopes_do_not_share_sessions() {
        let engine = engine();
        let events = Arc::new(EventChannel::new());

        let mut first = RequestScope::begin(RequestRecord::new("POST", "/mcp", PING), Arc::clone(&events));
        let mut second = RequestScope::begin(RequestRecord::new("POST", "/mcp", PING), Arc::clone(&events));

        // Same request id in both; neither sees the other's correlation state.
        let Dispatch::Reply(OutgoingMessage::Response(_)) = first.dispatch(&engine).unwrap() else {
            panic!("first request should succeed");
        };
        let Dispatch::Reply(OutgoingMessage::Response(_)) = second.dispatch(&engine).unwrap() else {
            panic!("second request should succeed");
        };
        assert_eq!(engine.active_sessions(), 2);

        first.finish();
        assert_eq!(engine.active_sessions(), 1);
        second.finish();
        assert_eq!(engine.active_sessions(), 0);
    }

    #[test]
    fn notification_is_accepted() {
        let engine = engine();
        let events = Arc::new(EventChannel::new());
        let mut scope = RequestScope::begin(
            RequestRecord::new("POST", "/mcp", r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#),
            events,
        );
        assert!(matches!(scope.dispatch(&engine).unwrap(), Dispatch::Accepted));
    }

    #[test]
    fn tool_fault_fails_the_request() {
        let engine = engine();
        engine.register_operation(ToolDefinition::new(
            "boom",
            "Panics",
            json!({"type": "object"}),
            |_| panic!("nope"),
        ));
        let events = Arc::new(EventChannel::new());
        let log = recorder(&events);

        let mut scope = RequestScope::begin(
            RequestRecord::new(
                "POST",
                "/mcp",
                r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"boom"}}"#,
            ),
            Arc::clone(&events),
        );
        let err = scope.dispatch(&engine).unwrap_err();
        assert!(matches!(err, RequestError::Tool(_)));
        assert!(scope.fail(&err));
        scope.finish();

        assert_eq!(engine.active_sessions(), 0);
        assert_eq!(
            *log.lock(),
            [
                EventKind::RequestReceived,
                EventKind::RequestFailed,
                EventKind::RequestCompleted
            ]
        );
    }

    #[test]
    fn fail_after_response_recorded_reports_too_late() {
        let events = Arc::new(EventChannel::new());
        let mut scope = RequestScope::begin(RequestRecord::new("POST", "/mcp", PING), events);
        scope.respond(ResponseRecord {
            status: 200,
            body: None,
        });

        let err = RequestError::Transport(TransportError::AlreadyClosed);
        assert!(!scope.fail(&err));
    }
}
