//! Line-delimited stream transport.
//!
//! Framing follows the MCP stdio transport:
//!
//! - Messages are UTF-8 encoded JSON-RPC
//! - Messages are delimited by newlines
//! - Messages must not contain embedded newlines
//! - stdin: receives messages from client
//! - stdout: sends messages to client
//! - stderr: may be used for logging (not MCP messages)
//!
//! Any other duplex pair can stand in for stdio through a [`StreamSource`].

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf,
};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::{ConnectionInfo, Transport};
use crate::error::TransportError;
use crate::mcp::engine::{ProtocolEngine, Session, SessionMode};
use crate::mcp::events::EventChannel;
use crate::mcp::protocol::OutgoingMessage;

/// Reading half of a stream connection.
pub type BoxedReader = Box<dyn AsyncBufRead + Send + Unpin>;

/// Writing half of a stream connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Produces the reader/writer pair for one stream connection.
pub type StreamSource = Arc<dyn Fn() -> io::Result<(BoxedReader, BoxedWriter)> + Send + Sync>;

/// Returns a source connected to the process's stdin and stdout.
///
/// Every open borrows the same buffered stdin reader, so input that arrives
/// while the server is stopped is read by the next session.
#[must_use]
pub fn stdio_source() -> StreamSource {
    let stdin = ReaderPool::new(Box::new(BufReader::new(tokio::io::stdin())));
    Arc::new(move || {
        let reader = stdin.lend().ok_or_else(|| {
            io::Error::new(io::ErrorKind::WouldBlock, "stdin is still held by a previous session")
        })?;
        let reader: BoxedReader = Box::new(reader);
        let writer: BoxedWriter = Box::new(tokio::io::stdout());
        Ok((reader, writer))
    })
}

/// Holds one long-lived reader and lends it to a single borrower at a time.
///
/// tokio's stdin cannot cancel a read in progress; dropping it loses
/// whatever that read returns. Keeping one reader for the process avoids
/// that across restarts.
#[derive(Clone)]
pub struct ReaderPool {
    slot: Arc<Mutex<Option<BoxedReader>>>,
}

impl ReaderPool {
    /// Creates a pool holding `reader`.
    #[must_use]
    pub fn new(reader: BoxedReader) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(reader))),
        }
    }

    /// Lends the reader out, or returns `None` while it is borrowed.
    #[must_use]
    pub fn lend(&self) -> Option<LentReader> {
        let reader = self.slot.lock().take()?;
        Some(LentReader {
            reader: Some(reader),
            home: Arc::clone(&self.slot),
        })
    }

    /// Returns `true` if the reader is in the pool.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.slot.lock().is_some()
    }
}

impl fmt::Debug for ReaderPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderPool")
            .field("available", &self.is_available())
            .finish()
    }
}

/// A reader borrowed from a [`ReaderPool`]; goes back to the pool on drop.
pub struct LentReader {
    reader: Option<BoxedReader>,
    home: Arc<Mutex<Option<BoxedReader>>>,
}

impl AsyncRead for LentReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().reader.as_mut() {
            Some(reader) => Pin::new(reader).poll_read(cx, buf),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl AsyncBufRead for LentReader {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        match self.get_mut().reader.as_mut() {
            Some(reader) => Pin::new(reader).poll_fill_buf(cx),
            None => Poll::Ready(Ok(&[])),
        }
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        if let Some(reader) = self.get_mut().reader.as_mut() {
            Pin::new(reader).consume(amt);
        }
    }
}

impl Drop for LentReader {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            *self.home.lock() = Some(reader);
        }
    }
}

/// Newline-framed JSON-RPC reader/writer.
pub struct LineChannel<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> LineChannel<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Wraps a reader/writer pair.
    pub const fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    /// Reads the next message line.
    ///
    /// Returns `None` if the peer closed the stream (EOF).
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails.
    pub async fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        let bytes_read = self.reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            return Ok(None);
        }

        if line.ends_with('\n') {
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
        }

        Ok(Some(line))
    }

    /// Writes a JSON-RPC message terminated with a newline.
    ///
    /// # Errors
    ///
    /// Returns an error if serialisation or writing fails.
    pub async fn write_message(&mut self, message: &OutgoingMessage) -> io::Result<()> {
        let json = serde_json::to_string(message)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        self.write_raw(&json).await
    }

    async fn write_raw(&mut self, json: &str) -> io::Result<()> {
        // MCP stdio framing forbids embedded newlines
        debug_assert!(
            !json.contains('\n'),
            "JSON message must not contain embedded newlines"
        );

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        Ok(())
    }
}

/// Persistent duplex stream transport with a single stateful session.
pub struct StreamTransport {
    source: StreamSource,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    peer_closed: Option<watch::Receiver<bool>>,
}

impl StreamTransport {
    /// Creates a transport reading from `source` when opened.
    #[must_use]
    pub fn new(source: StreamSource) -> Self {
        Self {
            source,
            shutdown: None,
            task: None,
            peer_closed: None,
        }
    }

    /// Creates a transport over stdin/stdout.
    #[must_use]
    pub fn stdio() -> Self {
        Self::new(stdio_source())
    }
}

#[async_trait]
impl Transport for StreamTransport {
    async fn open(
        &mut self,
        engine: Arc<ProtocolEngine>,
        _events: Arc<EventChannel>,
    ) -> Result<ConnectionInfo, TransportError> {
        if self.task.is_some() {
            return Err(TransportError::AlreadyOpen);
        }

        let (reader, writer) = (self.source)().map_err(TransportError::StreamUnavailable)?;
        let session = engine.open_session(SessionMode::Stateful)?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        let channel = LineChannel::new(reader, writer);
        let task = tokio::spawn(
            serve_stream(channel, session, shutdown_rx, closed_tx).instrument(tracing::Span::current()),
        );

        self.shutdown = Some(shutdown_tx);
        self.task = Some(task);
        self.peer_closed = Some(closed_rx);

        tracing::info!("Stream transport ready, waiting for client messages");
        Ok(ConnectionInfo::Stream)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let Some(task) = self.task.take() else {
            return Err(TransportError::AlreadyClosed);
        };

        if let Some(shutdown) = self.shutdown.take() {
            // The loop may already have ended on EOF.
            let _ = shutdown.send(());
        }

        task.await.map_err(|e| TransportError::Task(e.to_string()))?;
        tracing::debug!("Stream transport closed");
        Ok(())
    }

    fn closed_signal(&self) -> Option<watch::Receiver<bool>> {
        self.peer_closed.clone()
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn serve_stream(
    mut channel: LineChannel<BoxedReader, BoxedWriter>,
    mut session: Session,
    mut shutdown: oneshot::Receiver<()>,
    peer_closed: watch::Sender<bool>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::debug!("Stream transport shutting down");
                break;
            }

            line = channel.read_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if let Some(reply) = session.handle_line(&line) {
                        if let Err(e) = channel.write_message(&reply).await {
                            tracing::error!(error = %e, "Failed to write to stream");
                            peer_closed.send_replace(true);
                            break;
                        }
                    }
                }
                Ok(None) => {
                    tracing::info!("Client closed the stream");
                    peer_closed.send_replace(true);
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to read from stream");
                    peer_closed.send_replace(true);
                    break;
                }
            }
        }
    }

    if let Err(e) = session.close() {
        tracing::warn!(error = %e, "Stream session close failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::protocol::{JsonRpcError, JsonRpcResponse, RequestId};

    #[tokio::test]
    async fn read_line_strips_crlf() {
        let reader = tokio_test::io::Builder::new()
            .read(b"{\"a\":1}\r\n")
            .read(b"{\"b\":2}\n")
            .build();
        let writer = tokio_test::io::Builder::new().build();
        let mut channel = LineChannel::new(BufReader::new(reader), writer);

        assert_eq!(channel.read_line().await.unwrap().as_deref(), Some("{\"a\":1}"));
        assert_eq!(channel.read_line().await.unwrap().as_deref(), Some("{\"b\":2}"));
        assert_eq!(channel.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn write_message_appends_newline() {
        let reader = tokio_test::io::Builder::new().build();
        let writer = tokio_test::io::Builder::new()
            .write(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}")
            .write(b"\n")
            .build();
        let mut channel = LineChannel::new(BufReader::new(reader), writer);

        let reply: OutgoingMessage =
            JsonRpcResponse::success(RequestId::Number(1), serde_json::json!({})).into();
        channel.write_message(&reply).await.unwrap();
    }

    #[test]
    fn serialise_error_no_newlines() {
        let error: OutgoingMessage =
            JsonRpcError::method_not_found(RequestId::Number(1), "test/method").into();

        let json = serde_json::to_string(&error).unwrap();
        assert!(
            !json.contains('\n'),
            "Serialised JSON should not contain newlines"
        );
    }

    #[tokio::test]
    async fn lent_reader_returns_with_buffered_input() {
        let input = tokio_test::io::Builder::new()
            .read(b"first\nsecond\n")
            .build();
        let pool = ReaderPool::new(Box::new(BufReader::new(input)));

        let mut lent = pool.lend().unwrap();
        assert!(pool.lend().is_none());
        let mut line = String::new();
        lent.read_line(&mut line).await.unwrap();
        assert_eq!(line, "first\n");
        drop(lent);

        // "second" was buffered by the first borrower and is still there.
        let mut lent = pool.lend().unwrap();
        line.clear();
        lent.read_line(&mut line).await.unwrap();
        assert_eq!(line, "second\n");
    }

    #[tokio::test]
    async fn close_without_open_fails() {
        let mut transport = StreamTransport::stdio();
        assert!(matches!(
            transport.close().await,
            Err(TransportError::AlreadyClosed)
        ));
    }
}
