//! In-process store replica speaking RNTBD over TCP
//!
//! Provides a scriptable server side for integration tests:
//! - Context negotiation (accept, reject, delayed)
//! - Per-request replies chosen by a handler closure
//! - Chunked writes to exercise partial-frame reassembly
//!
//! # Example
//!
//! ```no_run
//! use rntbd_integration_tests::fixtures::{MockStore, Reply};
//!
//! #[tokio::test]
//! async fn test_read() {
//!     let store = MockStore::builder()
//!         .handler(|request| Reply::ok(request.activity_id(), b"{}".as_slice()))
//!         .start()
//!         .await
//!         .unwrap();
//!     // connect to store.addr() ...
//! }
//! ```

use bytes::{Bytes, BytesMut};
use rntbd_core::{
    ContextHeader, ContextRequest, ContextResponse, Request, Response, ResponseHeader, TokenStream,
};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Server agent advertised by accepting mock stores
pub const SERVER_AGENT: &str = "mock-store";

/// Server version advertised by accepting mock stores
pub const SERVER_VERSION: &str = "2.14.0.0";

/// How the mock answers the context request
#[derive(Debug, Clone)]
pub enum ContextReply {
    /// 200 with server identification
    Accept,
    /// Non-success status, no identification
    Reject(u32),
    /// Never answer
    Silent,
}

/// How the mock answers one data request
#[derive(Debug, Clone)]
pub enum Reply {
    /// Write a response
    Respond(Response),
    /// Write raw bytes
    Raw(Bytes),
    /// Do not answer
    Ignore,
    /// Close the socket
    Close,
}

impl Reply {
    /// 200 with an optional payload
    pub fn ok(activity_id: Uuid, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        let payload = (!payload.is_empty()).then_some(payload);
        Self::status(activity_id, 200, 0, payload)
    }

    /// Arbitrary status with a sub-status and optional payload
    pub fn status(activity_id: Uuid, status_code: u32, sub_status: u32, payload: Option<Bytes>) -> Self {
        let mut headers = TokenStream::<ResponseHeader>::new();
        headers
            .set(ResponseHeader::RequestCharge, 1.0_f64)
            .expect("request charge fits");
        if sub_status != 0 {
            headers
                .set(ResponseHeader::SubStatus, sub_status)
                .expect("sub-status fits");
        }
        Self::Respond(Response::new(activity_id, status_code, headers, payload).expect("valid response"))
    }
}

type Handler = Arc<dyn Fn(&Request) -> Reply + Send + Sync>;

/// Builder for [`MockStore`]
pub struct MockStoreBuilder {
    context: ContextReply,
    context_delay: Duration,
    chunk_size: Option<usize>,
    handler: Handler,
}

impl MockStoreBuilder {
    /// Context negotiation behavior
    pub fn context(mut self, context: ContextReply) -> Self {
        self.context = context;
        self
    }

    /// Delay before answering the context request
    pub fn context_delay(mut self, delay: Duration) -> Self {
        self.context_delay = delay;
        self
    }

    /// Split every write into chunks of this many bytes
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size.max(1));
        self
    }

    /// Per-request reply
    pub fn handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Request) -> Reply + Send + Sync + 'static,
    {
        self.handler = Arc::new(handler);
        self
    }

    /// Bind to an ephemeral loopback port and start accepting
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn start(self) -> io::Result<MockStore> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let received = Arc::new(Mutex::new(Vec::new()));
        let contexts = Arc::new(Mutex::new(Vec::new()));

        let session = Arc::new(Session {
            context: self.context,
            context_delay: self.context_delay,
            chunk_size: self.chunk_size,
            handler: self.handler,
            received: Arc::clone(&received),
            contexts: Arc::clone(&contexts),
        });

        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let session = Arc::clone(&session);
                tokio::spawn(async move {
                    if let Err(e) = session.serve(stream).await {
                        tracing::debug!(error = %e, "Mock store connection ended");
                    }
                });
            }
        });

        Ok(MockStore {
            addr,
            received,
            contexts,
            accept,
        })
    }
}

/// Running mock store
pub struct MockStore {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<Request>>>,
    contexts: Arc<Mutex<Vec<ContextRequest>>>,
    accept: JoinHandle<()>,
}

impl MockStore {
    /// Start configuring a mock store. Defaults to accepting the context and
    /// answering every request with an empty 200.
    pub fn builder() -> MockStoreBuilder {
        MockStoreBuilder {
            context: ContextReply::Accept,
            context_delay: Duration::ZERO,
            chunk_size: None,
            handler: Arc::new(|request: &Request| Reply::ok(request.activity_id(), Bytes::new())),
        }
    }

    /// Listening address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Data requests received so far, in arrival order
    pub fn received(&self) -> Vec<Request> {
        self.received.lock().expect("lock poisoned").clone()
    }

    /// Context requests received so far
    pub fn contexts(&self) -> Vec<ContextRequest> {
        self.contexts.lock().expect("lock poisoned").clone()
    }
}

impl Drop for MockStore {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

struct Session {
    context: ContextReply,
    context_delay: Duration,
    chunk_size: Option<usize>,
    handler: Handler,
    received: Arc<Mutex<Vec<Request>>>,
    contexts: Arc<Mutex<Vec<ContextRequest>>>,
}

impl Session {
    async fn serve(&self, mut stream: TcpStream) -> io::Result<()> {
        stream.set_nodelay(true)?;
        let mut buf = BytesMut::with_capacity(8 * 1024);

        let context = loop {
            if let Some(context) = ContextRequest::decode(&mut buf).map_err(invalid)? {
                break context;
            }
            if stream.read_buf(&mut buf).await? == 0 {
                return Ok(());
            }
        };
        let activity_id = context.activity_id();
        self.contexts.lock().expect("lock poisoned").push(context);

        if !self.context_delay.is_zero() {
            tokio::time::sleep(self.context_delay).await;
        }
        let response = match self.context {
            ContextReply::Accept => ContextResponse::accepted(activity_id, SERVER_AGENT, SERVER_VERSION)
                .map_err(invalid)?,
            ContextReply::Reject(status) => {
                let mut headers = TokenStream::<ContextHeader>::new();
                headers.set(ContextHeader::ProtocolVersion, 1u32).map_err(invalid)?;
                ContextResponse::new(activity_id, status, headers)
            }
            ContextReply::Silent => {
                // Keep the socket open until the client goes away.
                while stream.read_buf(&mut buf).await? != 0 {}
                return Ok(());
            }
        };
        let mut out = BytesMut::new();
        response.encode(&mut out).map_err(invalid)?;
        self.write(&mut stream, &out).await?;

        loop {
            while let Some(request) = Request::decode(&mut buf).map_err(invalid)? {
                let reply = (self.handler)(&request);
                self.received.lock().expect("lock poisoned").push(request);

                match reply {
                    Reply::Respond(response) => {
                        let mut out = BytesMut::new();
                        response.encode(&mut out).map_err(invalid)?;
                        self.write(&mut stream, &out).await?;
                    }
                    Reply::Raw(bytes) => self.write(&mut stream, &bytes).await?,
                    Reply::Ignore => {}
                    Reply::Close => return stream.shutdown().await,
                }
            }
            if stream.read_buf(&mut buf).await? == 0 {
                return Ok(());
            }
        }
    }

    async fn write(&self, stream: &mut TcpStream, bytes: &[u8]) -> io::Result<()> {
        match self.chunk_size {
            None => stream.write_all(bytes).await?,
            Some(size) => {
                for chunk in bytes.chunks(size) {
                    stream.write_all(chunk).await?;
                    stream.flush().await?;
                    tokio::task::yield_now().await;
                }
            }
        }
        stream.flush().await
    }
}

fn invalid<E: std::error::Error + Send + Sync + 'static>(e: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}
