//! Per-connection request orchestration.
//!
//! The [`RequestManager`] owns everything a connection shares between the
//! tasks that dispatch requests and the task that reads responses:
//!
//! - the pending-request table, keyed by activity id
//! - the negotiated [`ConnectionContext`], set exactly once
//! - the queue of frames dispatched before negotiation completed
//!
//! # State Machine
//!
//! ```text
//! Registered ──start_negotiation──► Negotiating ──context response──► Negotiated
//!                                                                        │
//!                                                                  first write
//!                                                                        ▼
//!            Closed ◄──fan-out── Closing ◄──on_connection_closed──── Active
//! ```
//!
//! Any state may move to `Closing`. Removal from the pending table is the
//! single point where a request is resolved, so a response, a cancellation
//! and a connection close racing for the same activity id resolve it once.

use crate::config::ConnectionConfig;
use crate::error::{Result, TransportError};
use crate::stats::{ConnectionStats, StatsCounters};
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rntbd_core::{
    BackendError, ConnectionContext, ContextRequest, ContextResponse, FrameError, Request,
    Response, ResponseHeaders,
};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::sync::{Mutex, mpsc, watch};
use uuid::Uuid;

/// Lifecycle of a connection as seen by its request manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Attached to a connection, context request not yet written
    Registered,
    /// Context request written, awaiting the context response
    Negotiating,
    /// Context established, no data request written yet
    Negotiated,
    /// Data requests flowing
    Active,
    /// Failing pending requests
    Closing,
    /// Terminal
    Closed,
}

impl ConnectionState {
    /// Whether data requests go straight to the wire
    #[must_use]
    pub fn is_negotiated(self) -> bool {
        matches!(self, Self::Negotiated | Self::Active)
    }

    /// Whether the connection is shutting down or shut down
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registered => write!(f, "Registered"),
            Self::Negotiating => write!(f, "Negotiating"),
            Self::Negotiated => write!(f, "Negotiated"),
            Self::Active => write!(f, "Active"),
            Self::Closing => write!(f, "Closing"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// A successful response, detached from the receive buffer's header tokens
#[derive(Debug, Clone)]
pub struct StoreResponse {
    /// Correlation id
    pub activity_id: Uuid,
    /// Status code (2xx)
    pub status_code: u32,
    /// Sub-status; zero when absent
    pub sub_status: u32,
    /// Request charge
    pub request_charge: Option<f64>,
    /// Session token
    pub session_token: Option<String>,
    /// All response headers, server version and activity id first
    pub headers: ResponseHeaders,
    /// Payload, shared with the receive buffer it was decoded from
    pub payload: Option<Bytes>,
}

impl StoreResponse {
    fn from_response(response: Response, server_version: &str) -> std::result::Result<Self, FrameError> {
        Ok(Self {
            activity_id: response.activity_id(),
            status_code: response.status_code(),
            sub_status: response.sub_status()?,
            request_charge: response.request_charge()?,
            session_token: response.session_token()?.map(str::to_string),
            headers: response.mapped_headers(server_version)?,
            payload: response.into_payload(),
        })
    }
}

/// How a pending request was resolved
#[derive(Debug, Clone)]
pub enum Completion {
    /// 2xx response
    Success(StoreResponse),
    /// Backend status, framing or connection failure
    Failed(TransportError),
    /// Withdrawn by the caller
    Cancelled,
}

impl Completion {
    /// Collapse into a result; cancellation becomes [`TransportError::Cancelled`]
    pub fn into_result(self) -> Result<StoreResponse> {
        match self {
            Self::Success(response) => Ok(response),
            Self::Failed(err) => Err(err),
            Self::Cancelled => Err(TransportError::Cancelled),
        }
    }

    /// Whether the request was cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

type Slot = watch::Sender<Option<Completion>>;

struct PendingRequest {
    born: Instant,
    slot: Slot,
}

/// Handle on a pending request's single-resolution completion slot
#[derive(Debug)]
pub struct PendingHandle {
    activity_id: Uuid,
    slot: watch::Receiver<Option<Completion>>,
}

impl PendingHandle {
    /// Activity id of the request
    #[must_use]
    pub fn activity_id(&self) -> Uuid {
        self.activity_id
    }

    /// Resolution, if it already happened
    #[must_use]
    pub fn try_completion(&self) -> Option<Completion> {
        self.slot.borrow().clone()
    }

    /// Wait for the request to resolve
    pub async fn wait(&mut self) -> Completion {
        match self.slot.wait_for(Option::is_some).await {
            Ok(slot) => match &*slot {
                Some(completion) => completion.clone(),
                None => Completion::Failed(TransportError::Closed),
            },
            // The manager went away without resolving the slot.
            Err(_) => Completion::Failed(TransportError::connection_closed("connection dropped")),
        }
    }
}

struct Outbound {
    writer: Option<mpsc::UnboundedSender<Bytes>>,
    queued: VecDeque<(Uuid, Bytes)>,
}

/// Pending-request table and negotiation gate for one connection
pub struct RequestManager {
    pending: DashMap<Uuid, PendingRequest>,
    outbound: Mutex<Outbound>,
    context: OnceLock<Arc<ConnectionContext>>,
    state: watch::Sender<ConnectionState>,
    closed: AtomicBool,
    close_cause: OnceLock<TransportError>,
    current: watch::Sender<Option<Uuid>>,
    stats: StatsCounters,
    max_pending: usize,
}

impl RequestManager {
    /// Create a manager allowing `max_pending_requests` requests in flight
    #[must_use]
    pub fn new(max_pending_requests: usize) -> Self {
        Self {
            pending: DashMap::new(),
            outbound: Mutex::new(Outbound {
                writer: None,
                queued: VecDeque::new(),
            }),
            context: OnceLock::new(),
            state: watch::channel(ConnectionState::Registered).0,
            closed: AtomicBool::new(false),
            close_cause: OnceLock::new(),
            current: watch::channel(None).0,
            stats: StatsCounters::new(),
            max_pending: max_pending_requests.max(1),
        }
    }

    /// Create a manager from connection settings
    #[must_use]
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(config.max_pending_requests)
    }

    /// Attach the channel feeding the connection's writer.
    ///
    /// Resets the pre-negotiation queue.
    pub async fn register(&self, writer: mpsc::UnboundedSender<Bytes>) {
        let mut outbound = self.outbound.lock().await;
        outbound.writer = Some(writer);
        outbound.queued.clear();
        self.state.send_replace(ConnectionState::Registered);
    }

    /// Write the context request ahead of any data request
    pub async fn start_negotiation(&self, request: &ContextRequest) -> Result<()> {
        let mut frame = BytesMut::with_capacity(request.encoded_length());
        request.encode(&mut frame)?;

        let outbound = self.outbound.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let writer = outbound.writer.as_ref().ok_or(TransportError::Closed)?;
        writer
            .send(frame.freeze())
            .map_err(|_| TransportError::connection_closed("writer stopped"))?;
        self.state.send_replace(ConnectionState::Negotiating);

        tracing::debug!(
            activity_id = %request.activity_id(),
            "Context request written"
        );
        Ok(())
    }

    /// Insert a pending request, or renew the one already registered for
    /// `activity_id`. A renewal shares the existing completion slot.
    pub fn create_pending(&self, activity_id: Uuid) -> PendingHandle {
        if self.closed.load(Ordering::SeqCst) {
            let (_, slot) = watch::channel(Some(Completion::Failed(TransportError::Closed)));
            return PendingHandle { activity_id, slot };
        }

        let slot = match self.pending.entry(activity_id) {
            Entry::Occupied(mut entry) => {
                tracing::debug!(activity_id = %activity_id, "Renewed pending request");
                entry.get_mut().born = Instant::now();
                entry.get().slot.subscribe()
            }
            Entry::Vacant(entry) => {
                let (slot, receiver) = watch::channel(None);
                entry.insert(PendingRequest {
                    born: Instant::now(),
                    slot,
                });
                receiver
            }
        };

        // A close that drained the table before this insert would miss it.
        if self.closed.load(Ordering::SeqCst) {
            self.resolve(activity_id, Completion::Failed(TransportError::Closed));
        }

        PendingHandle { activity_id, slot }
    }

    /// Register `request` and hand its frame to the writer, or queue it until
    /// negotiation completes.
    ///
    /// # Errors
    ///
    /// Fails without registering anything if the connection is closed, the
    /// pending limit is reached, or the request cannot be encoded.
    pub async fn dispatch(&self, request: Request) -> Result<PendingHandle> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let activity_id = request.activity_id();
        let mut frame = BytesMut::with_capacity(
            request.encoded_length() + request.payload().len() + rntbd_core::validator::LENGTH_PREFIX_SIZE,
        );
        request.encode(&mut frame)?;
        let frame = frame.freeze();

        // Nothing below awaits: once the entry is inserted the caller always
        // receives its handle.
        let mut outbound = self.outbound.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        // Dispatches serialize on the outbound lock, so the count cannot
        // move between this check and the insert.
        let pending = self.pending.len();
        if pending >= self.max_pending && !self.pending.contains_key(&activity_id) {
            tracing::warn!(
                activity_id = %activity_id,
                pending,
                "Pending request limit reached"
            );
            return Err(TransportError::PendingLimitExceeded {
                limit: self.max_pending,
            });
        }

        let handle = self.create_pending(activity_id);
        self.current.send_replace(Some(activity_id));

        if !self.state().is_negotiated() {
            outbound.queued.push_back((activity_id, frame));
            tracing::debug!(
                activity_id = %activity_id,
                queued = outbound.queued.len(),
                "Queued request until negotiation completes"
            );
            return Ok(handle);
        }

        let sent = outbound
            .writer
            .as_ref()
            .is_some_and(|writer| writer.send(frame).is_ok());
        drop(outbound);

        if sent {
            self.state.send_if_modified(|state| {
                let negotiated = *state == ConnectionState::Negotiated;
                if negotiated {
                    *state = ConnectionState::Active;
                }
                negotiated
            });
            tracing::debug!(activity_id = %activity_id, "Dispatched request");
        } else {
            self.resolve(
                activity_id,
                Completion::Failed(TransportError::connection_closed("writer stopped")),
            );
        }
        Ok(handle)
    }

    /// Complete negotiation and flush queued requests in submission order.
    ///
    /// # Errors
    ///
    /// A rejected negotiation, a malformed context, or a second context
    /// response is fatal; the caller must close the connection.
    pub async fn on_context_response(&self, response: ContextResponse) -> Result<Arc<ConnectionContext>> {
        if self.context.get().is_some() {
            tracing::warn!(
                activity_id = %response.activity_id(),
                "Context response received after negotiation completed"
            );
            return Err(TransportError::protocol_violation(
                "context response received after negotiation completed",
            ));
        }

        if !response.is_success() {
            let backend = BackendError::from_context_response(&response)?;
            tracing::warn!(
                activity_id = %response.activity_id(),
                status = response.status_code(),
                "Context negotiation rejected"
            );
            return Err(TransportError::Negotiation(Box::new(backend)));
        }

        let context = Arc::new(ConnectionContext::from_response(&response)?);

        let mut outbound = self.outbound.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.context.set(Arc::clone(&context)).is_err() {
            return Err(TransportError::protocol_violation(
                "context response received after negotiation completed",
            ));
        }
        self.state.send_replace(ConnectionState::Negotiated);

        tracing::info!(
            server_version = context.server_version(),
            server_agent = context.server_agent(),
            protocol_version = context.protocol_version(),
            "Context negotiated"
        );

        let queued = std::mem::take(&mut outbound.queued);
        let count = queued.len();
        if count > 0 {
            let Some(writer) = outbound.writer.as_ref() else {
                return Err(TransportError::connection_closed("writer stopped"));
            };
            for (activity_id, frame) in queued {
                if writer.send(frame).is_err() {
                    return Err(TransportError::connection_closed("writer stopped"));
                }
                tracing::debug!(activity_id = %activity_id, "Flushed queued request");
            }
            self.state.send_replace(ConnectionState::Active);
            tracing::debug!(flushed = count, "Flushed requests queued during negotiation");
        }

        Ok(context)
    }

    /// Resolve the pending request a response belongs to.
    ///
    /// A response with no matching entry was cancelled or timed out upstream
    /// and is dropped.
    ///
    /// # Errors
    ///
    /// Only a response whose headers cannot be rendered fails; that is a
    /// framing error and fatal to the connection.
    pub fn on_response(&self, response: Response) -> Result<()> {
        let activity_id = response.activity_id();
        let Some((_, pending)) = self.pending.remove(&activity_id) else {
            self.stats.record_orphan();
            tracing::debug!(
                activity_id = %activity_id,
                status = response.status_code(),
                "Dropping response with no pending request"
            );
            return Ok(());
        };
        self.current.send_replace(Some(activity_id));

        let server_version = self
            .context
            .get()
            .map(|c| c.server_version().to_string())
            .unwrap_or_default();
        let status = response.status_code();

        let completion = if response.is_success() {
            StoreResponse::from_response(response, &server_version).map(Completion::Success)
        } else {
            BackendError::from_response(&response, &server_version)
                .map(|e| Completion::Failed(TransportError::Backend(Box::new(e))))
        };

        match completion {
            Ok(completion) => {
                tracing::debug!(
                    activity_id = %activity_id,
                    status,
                    elapsed_us = pending.born.elapsed().as_micros() as u64,
                    "Resolved pending request"
                );
                pending.slot.send_replace(Some(completion));
                Ok(())
            }
            Err(e) => {
                let err = TransportError::Frame(e);
                pending.slot.send_replace(Some(Completion::Failed(err.clone())));
                Err(err)
            }
        }
    }

    /// Withdraw a pending request. Returns whether one was pending.
    ///
    /// Bytes already handed to the writer are still sent; the eventual
    /// response is dropped as orphaned.
    pub fn cancel(&self, activity_id: Uuid) -> bool {
        let cancelled = self.resolve(activity_id, Completion::Cancelled);
        if cancelled {
            self.stats.record_cancel();
            tracing::debug!(activity_id = %activity_id, "Cancelled pending request");
        }
        cancelled
    }

    /// Fail every pending and queued request and stop the writer.
    ///
    /// The first cause recorded is the one [`RequestManager::negotiated`]
    /// reports. Later calls are no-ops.
    pub async fn on_connection_closed(&self, cause: TransportError) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.close_cause.set(cause.clone());
        self.state.send_replace(ConnectionState::Closing);

        let queued = {
            let mut outbound = self.outbound.lock().await;
            outbound.writer = None;
            std::mem::take(&mut outbound.queued).len()
        };

        let reason = TransportError::ConnectionClosed {
            reason: cause.to_string().into(),
        };
        let ids: Vec<Uuid> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0usize;
        for activity_id in ids {
            if self.resolve(activity_id, Completion::Failed(reason.clone())) {
                failed += 1;
            }
        }

        if failed > 0 {
            tracing::warn!(
                pending = failed,
                queued,
                cause = %cause,
                "Connection closed with pending requests"
            );
        } else {
            tracing::info!(cause = %cause, "Connection closed");
        }
        self.state.send_replace(ConnectionState::Closed);
    }

    /// Wait until negotiation succeeds or the connection closes
    pub async fn negotiated(&self) -> Result<Arc<ConnectionContext>> {
        let mut state = self.state.subscribe();
        let _ = state
            .wait_for(|s| s.is_negotiated() || s.is_terminal())
            .await;

        match self.context.get() {
            Some(context) => Ok(Arc::clone(context)),
            None => Err(self.close_error()),
        }
    }

    fn resolve(&self, activity_id: Uuid, completion: Completion) -> bool {
        match self.pending.remove(&activity_id) {
            Some((_, pending)) => {
                pending.slot.send_replace(Some(completion));
                true
            }
            None => false,
        }
    }

    fn close_error(&self) -> TransportError {
        self.close_cause
            .get()
            .cloned()
            .unwrap_or(TransportError::Closed)
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Negotiated context, once available
    #[must_use]
    pub fn context(&self) -> Option<Arc<ConnectionContext>> {
        self.context.get().cloned()
    }

    /// Requests awaiting a response
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether `activity_id` is awaiting a response
    #[must_use]
    pub fn is_pending(&self, activity_id: &Uuid) -> bool {
        self.pending.contains_key(activity_id)
    }

    /// Most recently dispatched or resolved activity id, for log correlation
    #[must_use]
    pub fn current_activity_id(&self) -> Option<Uuid> {
        *self.current.borrow()
    }

    /// Whether the connection has closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// What closed the connection
    #[must_use]
    pub fn close_cause(&self) -> Option<TransportError> {
        self.close_cause.get().cloned()
    }

    /// Statistics snapshot
    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        self.stats.snapshot(self.pending.len())
    }

    pub(crate) fn counters(&self) -> &StatsCounters {
        &self.stats
    }
}

impl fmt::Debug for RequestManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestManager")
            .field("state", &self.state())
            .field("pending", &self.pending.len())
            .field("max_pending", &self.max_pending)
            .field("negotiated", &self.context.get().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rntbd_core::{
        ContextHeader, Operation, OperationType, ResourceType, ResponseHeader, TokenStream,
    };
    use std::time::Duration;

    async fn registered(max_pending: usize) -> (RequestManager, mpsc::UnboundedReceiver<Bytes>) {
        let manager = RequestManager::new(max_pending);
        let (tx, rx) = mpsc::unbounded_channel();
        manager.register(tx).await;
        (manager, rx)
    }

    async fn negotiated(max_pending: usize) -> (RequestManager, mpsc::UnboundedReceiver<Bytes>) {
        let (manager, mut rx) = registered(max_pending).await;
        let request = ContextRequest::new(Uuid::new_v4(), "1.0", "test-agent").unwrap();
        manager.start_negotiation(&request).await.unwrap();
        rx.recv().await.unwrap();
        manager.on_context_response(accepted()).await.unwrap();
        (manager, rx)
    }

    fn accepted() -> ContextResponse {
        ContextResponse::accepted(Uuid::new_v4(), "test-server", "2.14.0.0").unwrap()
    }

    fn read(activity_id: Uuid) -> Request {
        Request::new(
            activity_id,
            Operation::new(OperationType::Read, ResourceType::Document),
        )
        .unwrap()
    }

    fn response(activity_id: Uuid, status: u32, sub_status: Option<u32>) -> Response {
        let mut headers = TokenStream::<ResponseHeader>::new();
        if let Some(sub_status) = sub_status {
            headers.set(ResponseHeader::SubStatus, sub_status).unwrap();
        }
        headers.set(ResponseHeader::RequestCharge, 1.0f64).unwrap();
        Response::new(activity_id, status, headers, Some(Bytes::from_static(b"{}"))).unwrap()
    }

    fn frame_activity_id(frame: &Bytes) -> Uuid {
        let mut buf = BytesMut::from(&frame[..]);
        Request::decode(&mut buf).unwrap().unwrap().activity_id()
    }

    #[tokio::test]
    async fn test_negotiation_writes_context_request_first() {
        let (manager, mut rx) = registered(8).await;
        assert_eq!(manager.state(), ConnectionState::Registered);

        let request = ContextRequest::new(Uuid::new_v4(), "1.0", "agent").unwrap();
        manager.start_negotiation(&request).await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Negotiating);

        let mut frame = BytesMut::from(&rx.recv().await.unwrap()[..]);
        assert_eq!(ContextRequest::decode(&mut frame).unwrap().unwrap(), request);
    }

    #[tokio::test]
    async fn test_requests_buffered_until_negotiated() {
        let (manager, mut rx) = registered(8).await;
        let request = ContextRequest::new(Uuid::new_v4(), "1.0", "agent").unwrap();
        manager.start_negotiation(&request).await.unwrap();
        rx.recv().await.unwrap();

        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            manager.dispatch(read(*id)).await.unwrap();
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(manager.pending_count(), 3);

        let context = manager.on_context_response(accepted()).await.unwrap();
        assert_eq!(context.server_version(), "2.14.0.0");
        assert_eq!(manager.state(), ConnectionState::Active);

        let flushed: Vec<Uuid> = (0..3)
            .map(|_| frame_activity_id(&rx.try_recv().unwrap()))
            .collect();
        assert_eq!(flushed, ids);
    }

    #[tokio::test]
    async fn test_response_resolves_pending() {
        let (manager, mut rx) = negotiated(8).await;
        let id = Uuid::new_v4();
        let mut handle = manager.dispatch(read(id)).await.unwrap();
        assert_eq!(frame_activity_id(&rx.recv().await.unwrap()), id);
        assert_eq!(manager.current_activity_id(), Some(id));

        manager.on_response(response(id, 200, None)).unwrap();
        assert_eq!(manager.pending_count(), 0);

        let result = handle.wait().await.into_result().unwrap();
        assert_eq!(result.status_code, 200);
        assert_eq!(result.request_charge, Some(1.0));
        assert_eq!(result.payload.as_deref(), Some(&b"{}"[..]));
        assert_eq!(result.headers.get("ServerVersion"), Some("2.14.0.0"));
    }

    #[tokio::test]
    async fn test_backend_status_maps_to_error() {
        let (manager, _rx) = negotiated(8).await;
        let id = Uuid::new_v4();
        let mut handle = manager.dispatch(read(id)).await.unwrap();

        manager.on_response(response(id, 410, Some(1007))).unwrap();

        let err = handle.wait().await.into_result().unwrap_err();
        let backend = err.backend_error().unwrap();
        assert_eq!(backend.kind, rntbd_core::ErrorKind::CompletingSplit);
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_orphaned_response_is_dropped() {
        let (manager, _rx) = negotiated(8).await;
        manager.on_response(response(Uuid::new_v4(), 200, None)).unwrap();
        assert_eq!(manager.stats().orphaned_responses, 1);
    }

    #[tokio::test]
    async fn test_second_response_is_noop() {
        let (manager, _rx) = negotiated(8).await;
        let id = Uuid::new_v4();
        let mut handle = manager.dispatch(read(id)).await.unwrap();

        manager.on_response(response(id, 200, None)).unwrap();
        manager.on_response(response(id, 404, None)).unwrap();

        assert!(matches!(handle.wait().await, Completion::Success(_)));
        assert_eq!(manager.stats().orphaned_responses, 1);
    }

    #[tokio::test]
    async fn test_cancel() {
        let (manager, _rx) = negotiated(8).await;
        let id = Uuid::new_v4();
        let mut handle = manager.dispatch(read(id)).await.unwrap();

        assert!(manager.cancel(id));
        assert!(!manager.cancel(id));
        assert!(handle.wait().await.is_cancelled());

        manager.on_response(response(id, 200, None)).unwrap();
        assert_eq!(manager.stats().orphaned_responses, 1);
        assert_eq!(manager.stats().cancelled_requests, 1);
    }

    #[tokio::test]
    async fn test_renewal_shares_slot() {
        let manager = RequestManager::new(8);
        let id = Uuid::new_v4();
        let mut first = manager.create_pending(id);
        let mut second = manager.create_pending(id);
        assert_eq!(manager.pending_count(), 1);

        manager.cancel(id);
        assert!(first.wait().await.is_cancelled());
        assert!(second.wait().await.is_cancelled());
    }

    #[tokio::test]
    async fn test_close_fans_out() {
        let (manager, _rx) = registered(8).await;
        let mut handles = Vec::new();
        for _ in 0..5 {
            handles.push(manager.dispatch(read(Uuid::new_v4())).await.unwrap());
        }

        manager
            .on_connection_closed(TransportError::connection_closed("peer reset"))
            .await;
        assert_eq!(manager.pending_count(), 0);
        assert_eq!(manager.state(), ConnectionState::Closed);

        for handle in &mut handles {
            let err = handle.wait().await.into_result().unwrap_err();
            assert!(matches!(err, TransportError::ConnectionClosed { .. }));
        }

        assert!(matches!(
            manager.dispatch(read(Uuid::new_v4())).await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(
            manager.create_pending(Uuid::new_v4()).try_completion(),
            Some(Completion::Failed(TransportError::Closed))
        ));
    }

    #[tokio::test]
    async fn test_pending_limit() {
        let (manager, _rx) = negotiated(2).await;
        let id = Uuid::new_v4();
        manager.dispatch(read(id)).await.unwrap();
        manager.dispatch(read(Uuid::new_v4())).await.unwrap();

        assert!(matches!(
            manager.dispatch(read(Uuid::new_v4())).await,
            Err(TransportError::PendingLimitExceeded { limit: 2 })
        ));
        // Renewing an id already in the table is not a new entry.
        manager.dispatch(read(id)).await.unwrap();
        assert_eq!(manager.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_abandoned_dispatch_leaves_no_entry() {
        let (manager, _rx) = negotiated(1).await;
        let id = Uuid::new_v4();

        let outbound = manager.outbound.lock().await;
        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), manager.dispatch(read(id))).await;
        assert!(abandoned.is_err());
        drop(outbound);

        assert_eq!(manager.pending_count(), 0);
        assert!(!manager.is_pending(&id));
        // The slot it would have held is still available.
        manager.dispatch(read(Uuid::new_v4())).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_dispatch_respects_limit() {
        let (manager, _rx) = negotiated(4).await;
        let manager = Arc::new(manager);

        let outbound = manager.outbound.lock().await;
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.dispatch(read(Uuid::new_v4())).await })
            })
            .collect();
        // Let every task pass the closed check and park on the lock.
        tokio::task::yield_now().await;
        drop(outbound);

        let mut accepted = Vec::new();
        let mut refused = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(handle) => accepted.push(handle),
                Err(TransportError::PendingLimitExceeded { limit: 4 }) => refused += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(accepted.len(), 4);
        assert_eq!(refused, 12);
        assert_eq!(manager.pending_count(), 4);
    }

    #[tokio::test]
    async fn test_second_context_response_is_violation() {
        let (manager, _rx) = negotiated(8).await;
        let err = manager.on_context_response(accepted()).await.unwrap_err();
        assert!(matches!(err, TransportError::ProtocolViolation(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_rejected_negotiation() {
        let (manager, _rx) = registered(8).await;
        let mut headers = TokenStream::<ContextHeader>::new();
        headers.set(ContextHeader::ServerVersion, "2.0").unwrap();
        let rejection = ContextResponse::new(Uuid::new_v4(), 401, headers);

        let err = manager.on_context_response(rejection).await.unwrap_err();
        let backend = err.backend_error().unwrap();
        assert!(matches!(err, TransportError::Negotiation(_)));
        assert_eq!(backend.kind, rntbd_core::ErrorKind::Unauthorized);

        manager.on_connection_closed(err).await;
        assert!(matches!(
            manager.negotiated().await,
            Err(TransportError::Negotiation(_))
        ));
    }
}
