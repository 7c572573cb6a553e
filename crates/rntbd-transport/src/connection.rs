//! Connections: one socket, one reader task, one writer task.
//!
//! ```text
//!  send() ──► RequestManager::dispatch ──► mpsc ──► writer task ──► socket
//!                     ▲                                              │
//!                     └──── on_response / on_context_response ◄── reader task
//! ```
//!
//! The reader decodes frames strictly in arrival order. Any framing error,
//! protocol violation, end of stream or I/O error closes the connection and
//! fails every pending request.

use crate::config::ConnectionConfig;
use crate::error::{Result, TransportError};
use crate::request_manager::{Completion, ConnectionState, RequestManager, StoreResponse};
use crate::stats::ConnectionStats;
use bytes::{Bytes, BytesMut};
use rntbd_core::{ConnectionContext, ContextRequest, FrameDecoder, InboundFrame, Operation, Request};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// A negotiated, multiplexed connection to a store replica
pub struct Connection {
    manager: Arc<RequestManager>,
    config: ConnectionConfig,
    peer_addr: Option<SocketAddr>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    /// Connect over TCP and start context negotiation.
    ///
    /// Returns once the context request is queued for writing; use
    /// [`Connection::negotiated`] to wait for the server's answer. Requests
    /// sent before then are held back and written in order afterwards.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration, connect timeout or socket errors.
    pub async fn open<A: ToSocketAddrs>(addr: A, config: ConnectionConfig) -> Result<Self> {
        config.validate()?;

        let timeout = config.connect_timeout();
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Io(format!("connect timed out after {timeout:?}")))??;
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr().ok();

        tracing::info!(
            peer = ?peer_addr,
            user_agent = %config.user_agent,
            "Connection opened"
        );

        let mut connection = Self::with_stream(stream, config).await?;
        connection.peer_addr = peer_addr;
        Ok(connection)
    }

    /// Run the protocol over an already-established byte stream
    pub async fn with_stream<S>(stream: S, config: ConnectionConfig) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        config.validate()?;

        let manager = Arc::new(RequestManager::from_config(&config));
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();
        manager.register(tx).await;

        let mut context_request = ContextRequest::with_protocol_version(
            Uuid::new_v4(),
            config.protocol_version,
            &config.client_version,
            &config.user_agent,
        )?;
        if let Some(credential) = &config.credential {
            context_request = context_request.with_authorization(credential)?;
        }
        manager.start_negotiation(&context_request).await?;

        let writer = tokio::spawn(write_loop(write_half, rx, Arc::clone(&manager)));
        let reader = tokio::spawn(read_loop(
            read_half,
            Arc::clone(&manager),
            config.read_buffer_capacity,
            config.max_frame_length,
        ));

        Ok(Self {
            manager,
            config,
            peer_addr: None,
            reader,
            writer,
        })
    }

    /// Send an operation and wait for its outcome.
    ///
    /// Dropping the returned future cancels the request.
    ///
    /// # Errors
    ///
    /// Backend statuses surface as [`TransportError::Backend`]; a connection
    /// failure while waiting surfaces as [`TransportError::ConnectionClosed`].
    pub async fn send(&self, operation: Operation) -> Result<StoreResponse> {
        let request = Request::new(Uuid::new_v4(), operation)?;
        self.send_request(request).await
    }

    /// Send a prepared request under its own activity id
    pub async fn send_request(&self, request: Request) -> Result<StoreResponse> {
        let activity_id = request.activity_id();
        let mut handle = self.manager.dispatch(request).await?;
        let mut guard = CancelOnDrop {
            manager: &self.manager,
            activity_id,
            armed: true,
        };

        let completion = match self.config.request_timeout() {
            None => handle.wait().await,
            Some(timeout) => match tokio::time::timeout(timeout, handle.wait()).await {
                Ok(completion) => completion,
                Err(_) => {
                    guard.armed = false;
                    if self.manager.cancel(activity_id) {
                        tracing::debug!(
                            activity_id = %activity_id,
                            timeout_ms = timeout.as_millis() as u64,
                            "Request timed out"
                        );
                        return Err(TransportError::RequestTimeout(timeout));
                    }
                    // Resolved between the timer firing and the cancel.
                    handle
                        .try_completion()
                        .unwrap_or(Completion::Failed(TransportError::RequestTimeout(timeout)))
                }
            },
        };
        guard.armed = false;

        completion.into_result()
    }

    /// Wait for context negotiation to finish
    ///
    /// # Errors
    ///
    /// Returns the error that closed the connection, such as
    /// [`TransportError::Negotiation`] when the server rejected the context.
    pub async fn negotiated(&self) -> Result<Arc<ConnectionContext>> {
        self.manager.negotiated().await
    }

    /// Close the connection, failing every pending request
    pub async fn close(&self) {
        self.manager
            .on_connection_closed(TransportError::connection_closed("closed by client"))
            .await;
        self.reader.abort();
    }

    /// Negotiated context, once available
    #[must_use]
    pub fn context(&self) -> Option<Arc<ConnectionContext>> {
        self.manager.context()
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Whether the connection is closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.manager.is_closed()
    }

    /// Statistics snapshot
    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        self.manager.stats()
    }

    /// Remote address, for TCP connections
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// The request manager driving this connection
    #[must_use]
    pub fn manager(&self) -> &Arc<RequestManager> {
        &self.manager
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer_addr", &self.peer_addr)
            .field("manager", &self.manager)
            .finish()
    }
}

struct CancelOnDrop<'a> {
    manager: &'a RequestManager,
    activity_id: Uuid,
    armed: bool,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.manager.cancel(self.activity_id);
        }
    }
}

async fn read_loop<R>(mut reader: R, manager: Arc<RequestManager>, capacity: usize, max_frame_length: u32)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::with_max_frame_length(max_frame_length);
    let mut buf = BytesMut::with_capacity(capacity);

    let cause = loop {
        if let Err(e) = drain_frames(&mut decoder, &mut buf, &manager).await {
            tracing::warn!(error = %e, "Closing connection after fatal error");
            break e;
        }

        if buf.capacity() == buf.len() {
            buf.reserve(capacity);
        }
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                break TransportError::connection_closed("connection closed by peer");
            }
            Ok(n) => {
                manager.counters().record_read(n);
                tracing::trace!(bytes = n, buffered = buf.len(), "Read from socket");
            }
            Err(e) => {
                tracing::error!(error = %e, "Socket read failed");
                break e.into();
            }
        }
    };

    manager.on_connection_closed(cause).await;
}

async fn drain_frames(
    decoder: &mut FrameDecoder,
    buf: &mut BytesMut,
    manager: &RequestManager,
) -> Result<()> {
    while let Some(frame) = decoder.decode(buf)? {
        manager.counters().record_frame_read();
        match frame {
            InboundFrame::Context(context) => {
                manager.on_context_response(context).await?;
            }
            InboundFrame::Response(response) => {
                manager.on_response(response)?;
            }
        }
    }
    Ok(())
}

async fn write_loop<W>(mut writer: W, mut frames: mpsc::UnboundedReceiver<Bytes>, manager: Arc<RequestManager>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = written {
            tracing::error!(error = %e, "Socket write failed");
            manager.on_connection_closed(e.into()).await;
            return;
        }
        manager.counters().record_write(frame.len());
        tracing::trace!(bytes = frame.len(), "Wrote frame");
    }

    if let Err(e) = writer.shutdown().await {
        tracing::debug!(error = %e, "Socket shutdown failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rntbd_core::{
        ContextResponse, OperationType, RequestHeader, ResourceType, Response, ResponseHeader,
        TokenStream,
    };
    use std::time::Duration;
    use tokio::io::DuplexStream;

    async fn read_frame<F, T>(peer: &mut DuplexStream, buf: &mut BytesMut, decode: F) -> Option<T>
    where
        F: Fn(&mut BytesMut) -> std::result::Result<Option<T>, rntbd_core::FrameError>,
    {
        loop {
            if let Some(frame) = decode(buf).unwrap() {
                return Some(frame);
            }
            if peer.read_buf(buf).await.unwrap() == 0 {
                return None;
            }
        }
    }

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            user_agent: "unit-test".to_string(),
            ..Default::default()
        }
    }

    fn operation() -> Operation {
        Operation::new(OperationType::Read, ResourceType::Document)
            .with_header(RequestHeader::DocumentName, "doc-1")
            .unwrap()
    }

    async fn accept(peer: &mut DuplexStream, buf: &mut BytesMut) -> ContextRequest {
        let request = read_frame(peer, buf, ContextRequest::decode).await.unwrap();
        let mut out = BytesMut::new();
        ContextResponse::accepted(request.activity_id(), "unit-server", "9.9")
            .unwrap()
            .encode(&mut out)
            .unwrap();
        peer.write_all(&out).await.unwrap();
        request
    }

    #[tokio::test]
    async fn test_send_roundtrip_over_duplex() {
        let (client, mut peer) = tokio::io::duplex(64 * 1024);
        let connection = Connection::with_stream(client, config()).await.unwrap();

        let server = tokio::spawn(async move {
            let mut buf = BytesMut::new();
            let context = accept(&mut peer, &mut buf).await;
            assert_eq!(
                context
                    .headers()
                    .get(rntbd_core::ContextRequestHeader::UserAgent)
                    .as_str()
                    .unwrap(),
                Some("unit-test")
            );

            let request = read_frame(&mut peer, &mut buf, Request::decode).await.unwrap();
            let mut headers = TokenStream::<ResponseHeader>::new();
            headers.set(ResponseHeader::SessionToken, "0:-1#1").unwrap();
            let response = Response::new(
                request.activity_id(),
                200,
                headers,
                Some(Bytes::from_static(b"{\"id\":\"doc-1\"}")),
            )
            .unwrap();
            let mut out = BytesMut::new();
            response.encode(&mut out).unwrap();
            peer.write_all(&out).await.unwrap();
            peer
        });

        let response = connection.send(operation()).await.unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.session_token.as_deref(), Some("0:-1#1"));
        assert_eq!(response.headers.get("ServerVersion"), Some("9.9"));
        assert_eq!(connection.context().unwrap().server_agent(), "unit-server");
        assert_eq!(connection.state(), ConnectionState::Active);

        let stats = connection.stats();
        assert_eq!(stats.frames_read, 2);
        assert!(stats.frames_written >= 1);
        assert!(stats.bytes_read > 0);
        assert_eq!(stats.pending_requests, 0);

        let _peer = server.await.unwrap();
    }

    #[tokio::test]
    async fn test_credential_sent_in_context_request() {
        let (client, mut peer) = tokio::io::duplex(4096);
        let config = config().with_credential("type=aad&sig=xyz");
        let _connection = Connection::with_stream(client, config).await.unwrap();

        let mut buf = BytesMut::new();
        let request = accept(&mut peer, &mut buf).await;
        assert_eq!(
            request
                .headers()
                .get(rntbd_core::ContextRequestHeader::AuthorizationToken)
                .as_str()
                .unwrap(),
            Some("type=aad&sig=xyz")
        );
    }

    #[tokio::test]
    async fn test_peer_eof_fails_pending() {
        let (client, mut peer) = tokio::io::duplex(4096);
        let connection = Connection::with_stream(client, config()).await.unwrap();

        let server = tokio::spawn(async move {
            let mut buf = BytesMut::new();
            accept(&mut peer, &mut buf).await;
            read_frame(&mut peer, &mut buf, Request::decode).await.unwrap();
            drop(peer);
        });

        let err = connection.send(operation()).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionClosed { .. }));
        server.await.unwrap();
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let (client, mut peer) = tokio::io::duplex(4096);
        let config = ConnectionConfig {
            request_timeout_ms: 50,
            ..config()
        };
        let connection = Connection::with_stream(client, config).await.unwrap();

        let mut buf = BytesMut::new();
        accept(&mut peer, &mut buf).await;

        let err = connection.send(operation()).await.unwrap_err();
        assert!(matches!(err, TransportError::RequestTimeout(d) if d == Duration::from_millis(50)));
        assert_eq!(connection.stats().pending_requests, 0);
        assert_eq!(connection.stats().cancelled_requests, 1);
    }

    #[tokio::test]
    async fn test_garbage_closes_connection() {
        let (client, mut peer) = tokio::io::duplex(4096);
        let connection = Connection::with_stream(client, config()).await.unwrap();

        let mut buf = BytesMut::new();
        read_frame(&mut peer, &mut buf, ContextRequest::decode).await.unwrap();
        // Length prefix smaller than any status frame.
        peer.write_all(&[4, 0, 0, 0]).await.unwrap();
        peer.write_all(&[0u8; 28]).await.unwrap();

        let err = connection.negotiated().await.unwrap_err();
        assert!(matches!(err, TransportError::Frame(_)));
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_close_fails_queued_requests() {
        let (client, _peer) = tokio::io::duplex(4096);
        let connection = Arc::new(Connection::with_stream(client, config()).await.unwrap());

        let sender = Arc::clone(&connection);
        let pending = tokio::spawn(async move { sender.send(operation()).await });
        while connection.manager().pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        connection.close().await;
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::ConnectionClosed { .. }));
        assert_eq!(connection.state(), ConnectionState::Closed);
    }
}
