//! Connections
//!
//! A [`Connection`] is a multiplexed session over one transport. Its read
//! half runs in a dedicated task that correlates replies with pending
//! requests and hands incoming requests to the bound adapter; its write
//! half sits behind an async mutex so exactly one frame is written at a
//! time.
//!
//! Request ids are allocated per connection, start at 1, skip 0 (oneway)
//! and are never reused while a request with that id is outstanding or
//! its caller gave up waiting.

mod factory;

pub(crate) use factory::{ConnectError, OutgoingConnectionFactory};

use crate::adapter::ObjectAdapter;
use crate::communicator::Instance;
use crate::config::ConnectionOptions;
use crate::endpoint::{ConnectionInfo, Endpoint, Transceiver};
use crate::error::{result_to_reply, Result, RpcError, TimeoutKind};
use crate::proxy::ObjectPrx;
use crate::reference::{InvocationMode, Reference};
use crate::thread_pool::ThreadPool;
use async_trait::async_trait;
use bytes::Bytes;
use floe_proto::{
    FrameReader, FrameWriter, Identity, Message, ProtocolError, Reply, ReplyBody, Request,
    RequestTarget,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch, OwnedSemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Validating,
    Active,
    Closing,
    Closed,
}

/// How [`Connection::close`] treats outstanding work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Abort now; pending invocations fail with `ConnectionAborted`.
    Forcefully,
    /// Wait for in-flight dispatches, fail pending invocations, then send
    /// `closeConnection`.
    Gracefully,
    /// Also wait for pending invocations to receive their replies.
    GracefullyWithWait,
}

type ReplySender = oneshot::Sender<Result<ReplyBody>>;

#[derive(Default)]
struct PendingTable {
    next_id: i32,
    requests: HashMap<i32, ReplySender>,
    /// Ids whose caller stopped waiting; a late reply is dropped.
    abandoned: HashSet<i32>,
    closed: bool,
}

impl PendingTable {
    fn next_request_id(&mut self) -> i32 {
        loop {
            let id = self.next_id.max(1);
            self.next_id = if id == i32::MAX { 1 } else { id + 1 };
            if !self.requests.contains_key(&id) && !self.abandoned.contains(&id) {
                return id;
            }
        }
    }
}

/// A failed send, and whether the request may have reached the peer
#[derive(Debug)]
pub(crate) struct SendError {
    pub(crate) error: RpcError,
    pub(crate) sent: bool,
}

impl SendError {
    fn not_sent(error: RpcError) -> Self {
        Self { error, sent: false }
    }
}

/// Handle on an outstanding twoway request. Dropping it before the reply
/// arrives releases the request id.
pub(crate) struct PendingReply {
    connection: Connection,
    request_id: i32,
    rx: oneshot::Receiver<Result<ReplyBody>>,
    done: bool,
}

impl PendingReply {
    pub(crate) async fn wait(mut self) -> Result<ReplyBody> {
        let result = (&mut self.rx).await;
        self.done = true;
        result.unwrap_or_else(|_| {
            Err(RpcError::ConnectionAborted(
                "reply channel dropped".to_string(),
            ))
        })
    }

    /// Release the id of a request that never reached the wire.
    fn forget(mut self) {
        self.done = true;
        self.connection.remove_pending(self.request_id);
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if !self.done {
            self.connection.abandon(self.request_id);
        }
    }
}

/// Multiplexed session over one transport
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: u64,
    endpoint: Endpoint,
    info: ConnectionInfo,
    options: ConnectionOptions,
    instance: Weak<Instance>,
    io_pool: Arc<ThreadPool>,
    dispatch_pool: Arc<ThreadPool>,
    writer: tokio::sync::Mutex<Box<dyn FrameWriter>>,
    pending: Mutex<PendingTable>,
    pending_count: watch::Sender<usize>,
    dispatch_count: watch::Sender<usize>,
    state: watch::Sender<ConnectionState>,
    close_reason: Mutex<Option<RpcError>>,
    adapter: RwLock<Option<ObjectAdapter>>,
    last_activity: Mutex<Instant>,
    stop: CancellationToken,
}

impl Connection {
    fn new(
        instance: &Arc<Instance>,
        endpoint: Endpoint,
        info: ConnectionInfo,
        writer: Box<dyn FrameWriter>,
        adapter: Option<ObjectAdapter>,
    ) -> Self {
        let io_pool = if info.incoming {
            instance.server_pool().clone()
        } else {
            instance.client_pool().clone()
        };
        Self {
            inner: Arc::new(ConnectionInner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                endpoint,
                info,
                options: instance.config().connection.clone(),
                instance: Arc::downgrade(instance),
                io_pool,
                dispatch_pool: instance.server_pool().clone(),
                writer: tokio::sync::Mutex::new(writer),
                pending: Mutex::new(PendingTable::default()),
                pending_count: watch::channel(0).0,
                dispatch_count: watch::channel(0).0,
                state: watch::channel(ConnectionState::Validating).0,
                close_reason: Mutex::new(None),
                adapter: RwLock::new(adapter),
                last_activity: Mutex::new(Instant::now()),
                stop: CancellationToken::new(),
            }),
        }
    }

    /// Wrap an outgoing transport and wait for the server's validation.
    pub(crate) async fn connect_outgoing(
        instance: &Arc<Instance>,
        endpoint: Endpoint,
        transceiver: Transceiver,
    ) -> Result<Connection> {
        let info = transceiver.info.clone();
        let max = instance.config().connection.message_size_max;
        let (mut reader, writer) = transceiver.into_frames(max);
        let connection = Self::new(instance, endpoint, info, writer, None);

        if !connection.is_datagram() {
            let validation_error = |e: RpcError| {
                if e.is_protocol_error() {
                    e
                } else {
                    RpcError::connect_failed(
                        &connection.inner.endpoint,
                        format!("connection validation failed: {}", e),
                    )
                }
            };
            let frame = reader
                .read_frame()
                .await
                .map_err(|e| validation_error(e.into()))?;
            match Message::decode(frame) {
                Ok((_, Message::ValidateConnection)) => {}
                Ok((_, other)) => {
                    return Err(RpcError::Protocol(format!(
                        "expected validate connection, received {}",
                        other.message_type().name()
                    )))
                }
                Err(e) => return Err(validation_error(e.into())),
            }
        }

        connection.start(reader);
        debug!(target: "floe::network", "established {}", connection.inner.info);
        Ok(connection)
    }

    /// Wrap an incoming transport and send our validation.
    pub(crate) async fn accept_incoming(
        instance: &Arc<Instance>,
        endpoint: Endpoint,
        transceiver: Transceiver,
        adapter: ObjectAdapter,
    ) -> Result<Connection> {
        let info = transceiver.info.clone();
        let max = instance.config().connection.message_size_max;
        let (reader, writer) = transceiver.into_frames(max);
        let connection = Self::new(instance, endpoint, info, writer, Some(adapter));

        if !connection.is_datagram() {
            connection
                .write_frame(&Message::ValidateConnection.encode())
                .await?;
        }

        connection.start(reader);
        debug!(target: "floe::network", "accepted {}", connection.inner.info);
        Ok(connection)
    }

    fn start(&self, reader: Box<dyn FrameReader>) {
        self.inner.state.send_replace(ConnectionState::Active);
        self.inner.io_pool.spawn(self.clone().run_reader(reader));
        if let Some(idle) = self.inner.options.idle_timeout {
            if !self.is_datagram() {
                self.inner.io_pool.spawn(self.clone().monitor_idle(idle));
            }
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.inner.info
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    pub fn is_datagram(&self) -> bool {
        self.inner.info.datagram
    }

    pub fn is_incoming(&self) -> bool {
        self.inner.info.incoming
    }

    /// Why the connection closed, once it is closing
    pub fn close_reason(&self) -> Option<RpcError> {
        self.inner.close_reason.lock().clone()
    }

    /// Number of twoway requests awaiting a reply
    pub fn pending_request_count(&self) -> usize {
        self.inner.pending.lock().requests.len()
    }

    /// Let this connection dispatch requests sent by its peer. On an
    /// outgoing connection this makes it bidirectional.
    pub fn set_adapter(&self, adapter: Option<ObjectAdapter>) {
        *self.inner.adapter.write() = adapter;
    }

    pub fn adapter(&self) -> Option<ObjectAdapter> {
        self.inner.adapter.read().clone()
    }

    /// Fixed proxy whose invocations always use this connection
    pub fn create_proxy(&self, identity: Identity) -> Result<ObjectPrx> {
        let instance = self
            .inner
            .instance
            .upgrade()
            .ok_or(RpcError::CommunicatorDestroyed)?;
        let mode = if self.is_datagram() {
            InvocationMode::Datagram
        } else {
            InvocationMode::Twoway
        };
        let reference = Reference::new(identity, instance.config())?
            .with_mode(mode)
            .with_fixed(Some(self.clone()));
        Ok(ObjectPrx::new(reference, instance))
    }

    pub async fn close(&self, mode: CloseMode) {
        match mode {
            CloseMode::Forcefully => {
                self.finish(RpcError::ConnectionAborted(
                    "connection closed forcefully".to_string(),
                ));
            }
            CloseMode::Gracefully => self.close_gracefully(false).await,
            CloseMode::GracefullyWithWait => self.close_gracefully(true).await,
        }
    }

    pub async fn wait_closed(&self) {
        let mut state = self.inner.state.subscribe();
        loop {
            if *state.borrow_and_update() == ConnectionState::Closed {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    // ---- sending ----

    /// Send one request. For twoway requests the returned handle resolves
    /// with the reply.
    pub(crate) async fn send_request(
        &self,
        mut request: Request,
        twoway: bool,
    ) -> std::result::Result<Option<PendingReply>, SendError> {
        if twoway && self.is_datagram() {
            return Err(SendError::not_sent(RpcError::TwowayOverDatagram));
        }
        if let Some(error) = self.unavailable() {
            return Err(SendError::not_sent(error));
        }

        let pending = if twoway {
            let (request_id, rx) = self.register().map_err(SendError::not_sent)?;
            request.request_id = request_id;
            Some(PendingReply {
                connection: self.clone(),
                request_id,
                rx,
                done: false,
            })
        } else {
            request.request_id = 0;
            None
        };

        trace!(
            target: "floe::protocol",
            "{}: sending `{}` on `{}` (id {})",
            self.inner.info,
            request.operation,
            request.identity,
            request.request_id
        );
        let frame = Message::Request(request).encode();
        let sent = match self.check_size(&frame) {
            Ok(()) => self.send_frame(frame).await,
            Err(e) => Err(e),
        };
        match sent {
            Ok(()) => Ok(pending),
            Err(error) => {
                if let Some(pending) = pending {
                    pending.forget();
                }
                Err(SendError::not_sent(error))
            }
        }
    }

    /// Send queued batch requests as one frame.
    pub(crate) async fn send_batch(
        &self,
        requests: Vec<Request>,
    ) -> std::result::Result<(), SendError> {
        if let Some(error) = self.unavailable() {
            return Err(SendError::not_sent(error));
        }
        let frame = Message::BatchRequest(requests).encode();
        self.check_size(&frame).map_err(SendError::not_sent)?;
        self.send_frame(frame).await.map_err(SendError::not_sent)
    }

    fn unavailable(&self) -> Option<RpcError> {
        match self.state() {
            ConnectionState::Validating | ConnectionState::Active => None,
            ConnectionState::Closing | ConnectionState::Closed => Some(
                self.close_reason()
                    .unwrap_or_else(|| RpcError::ConnectionAborted("connection closed".to_string())),
            ),
        }
    }

    fn check_size(&self, frame: &[u8]) -> Result<()> {
        let max = self.inner.options.message_size_max;
        if frame.len() > max {
            return Err(RpcError::from(ProtocolError::MessageTooLarge {
                size: frame.len(),
                max,
            }));
        }
        Ok(())
    }

    /// Write from a separate task so a caller that stops waiting cannot
    /// leave half a frame on the wire.
    async fn send_frame(&self, frame: Bytes) -> Result<()> {
        let connection = self.clone();
        let write = self
            .inner
            .io_pool
            .spawn(async move { connection.write_frame(&frame).await });
        match write.await {
            Ok(result) => result,
            Err(e) => Err(RpcError::ConnectionAborted(format!("write task failed: {}", e))),
        }
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<()> {
        let mut writer = self.inner.writer.lock().await;
        let result = match self.inner.endpoint.timeout() {
            Some(timeout) => match tokio::time::timeout(timeout, writer.write_frame(frame)).await {
                Ok(result) => result.map_err(RpcError::from),
                Err(_) => Err(RpcError::Timeout(TimeoutKind::Connection)),
            },
            None => writer.write_frame(frame).await.map_err(RpcError::from),
        };
        drop(writer);

        match &result {
            Ok(()) => self.touch(),
            Err(e) => {
                debug!(target: "floe::network", "{}: write failed: {}", self.inner.info, e);
                self.finish(e.clone());
            }
        }
        result
    }

    // ---- pending table ----

    fn register(&self) -> Result<(i32, oneshot::Receiver<Result<ReplyBody>>)> {
        let mut pending = self.inner.pending.lock();
        if pending.closed {
            return Err(self
                .close_reason()
                .unwrap_or_else(|| RpcError::ConnectionAborted("connection closed".to_string())));
        }
        let request_id = pending.next_request_id();
        let (tx, rx) = oneshot::channel();
        pending.requests.insert(request_id, tx);
        self.inner.pending_count.send_replace(pending.requests.len());
        Ok((request_id, rx))
    }

    fn abandon(&self, request_id: i32) {
        let mut pending = self.inner.pending.lock();
        if pending.requests.remove(&request_id).is_some() && !pending.closed {
            pending.abandoned.insert(request_id);
        }
        self.inner.pending_count.send_replace(pending.requests.len());
    }

    fn remove_pending(&self, request_id: i32) {
        let mut pending = self.inner.pending.lock();
        pending.requests.remove(&request_id);
        self.inner.pending_count.send_replace(pending.requests.len());
    }

    fn complete_reply(&self, reply: Reply) -> Result<()> {
        let sender = {
            let mut pending = self.inner.pending.lock();
            let sender = match pending.requests.remove(&reply.request_id) {
                Some(sender) => Some(sender),
                None if pending.abandoned.remove(&reply.request_id) => None,
                None => {
                    return Err(RpcError::Protocol(format!(
                        "reply for unknown request id {}",
                        reply.request_id
                    )))
                }
            };
            self.inner.pending_count.send_replace(pending.requests.len());
            sender
        };
        match sender {
            Some(sender) => {
                let _ = sender.send(Ok(reply.body));
            }
            None => trace!(
                target: "floe::protocol",
                "{}: dropping reply for abandoned request {}",
                self.inner.info,
                reply.request_id
            ),
        }
        Ok(())
    }

    fn fail_pending(&self, error: &RpcError) {
        let requests = {
            let mut pending = self.inner.pending.lock();
            let requests = std::mem::take(&mut pending.requests);
            self.inner.pending_count.send_replace(0);
            requests
        };
        for (_, sender) in requests {
            let _ = sender.send(Err(error.clone()));
        }
    }

    // ---- closing ----

    /// Move to `Closed`, fail everything pending with `reason` and release
    /// the transport. Idempotent.
    fn finish(&self, reason: RpcError) {
        let first = self.inner.state.send_if_modified(|state| {
            if *state != ConnectionState::Closed {
                *state = ConnectionState::Closed;
                true
            } else {
                false
            }
        });
        if !first {
            return;
        }

        let reason = self
            .inner
            .close_reason
            .lock()
            .get_or_insert(reason)
            .clone();
        self.inner.stop.cancel();

        let requests = {
            let mut pending = self.inner.pending.lock();
            pending.closed = true;
            pending.abandoned.clear();
            self.inner.pending_count.send_replace(0);
            std::mem::take(&mut pending.requests)
        };
        for (_, sender) in requests {
            let _ = sender.send(Err(reason.clone()));
        }

        let connection = self.clone();
        self.inner.io_pool.spawn(async move {
            let mut writer = connection.inner.writer.lock().await;
            let _ = writer.shutdown().await;
            *writer = Box::new(ClosedWriter);
        });
        self.inner.adapter.write().take();

        if !self.is_incoming() {
            if let Some(instance) = self.inner.instance.upgrade() {
                instance.outgoing_connections().remove(self);
            }
        }
        debug!(target: "floe::network", "closed {}: {}", self.inner.info, reason);
    }

    async fn close_gracefully(&self, wait_for_replies: bool) {
        let started = self.inner.state.send_if_modified(|state| {
            if *state < ConnectionState::Closing {
                *state = ConnectionState::Closing;
                true
            } else {
                false
            }
        });
        if !started {
            self.wait_closed().await;
            return;
        }
        let reason = RpcError::ConnectionAborted("connection closed locally".to_string());
        self.inner
            .close_reason
            .lock()
            .get_or_insert_with(|| reason.clone());
        debug!(target: "floe::network", "closing {}", self.inner.info);

        let close_timeout = self.inner.options.close_timeout;
        let drained = tokio::time::timeout(close_timeout, async {
            if wait_for_replies {
                wait_for_zero(self.inner.pending_count.subscribe()).await;
            }
            wait_for_zero(self.inner.dispatch_count.subscribe()).await;
        })
        .await;
        if drained.is_err() {
            self.finish(RpcError::Timeout(TimeoutKind::Close));
            return;
        }

        self.fail_pending(&reason);
        if self.is_datagram() {
            self.finish(reason);
            return;
        }

        if self
            .write_frame(&Message::CloseConnection.encode())
            .await
            .is_err()
        {
            return;
        }
        {
            let mut writer = self.inner.writer.lock().await;
            let _ = writer.shutdown().await;
        }
        if tokio::time::timeout(close_timeout, self.wait_closed())
            .await
            .is_err()
        {
            self.finish(RpcError::Timeout(TimeoutKind::Close));
        }
    }

    // ---- reading ----

    async fn run_reader(self, mut reader: Box<dyn FrameReader>) {
        let stop = self.inner.stop.clone();
        loop {
            let frame = tokio::select! {
                _ = stop.cancelled() => break,
                frame = reader.read_frame() => frame,
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    let error = if self.state() == ConnectionState::Closing {
                        RpcError::ConnectionAborted("connection closed locally".to_string())
                    } else {
                        RpcError::from(e)
                    };
                    self.finish(error);
                    break;
                }
            };
            self.touch();

            let message = match Message::decode(frame) {
                Ok((_, message)) => message,
                Err(e) => {
                    warn!(target: "floe::protocol", "{}: malformed frame: {}", self.inner.info, e);
                    self.finish(e.into());
                    break;
                }
            };
            trace!(
                target: "floe::protocol",
                "{}: received {}",
                self.inner.info,
                message.message_type().name()
            );

            match message {
                Message::Request(request) => self.handle_request(request).await,
                Message::BatchRequest(requests) => self.handle_batch(requests).await,
                Message::Reply(reply) => {
                    if let Err(e) = self.complete_reply(reply) {
                        warn!(target: "floe::protocol", "{}: {}", self.inner.info, e);
                        self.finish(e);
                        break;
                    }
                }
                Message::ValidateConnection => {}
                Message::CloseConnection => {
                    if self.is_datagram() {
                        continue;
                    }
                    debug!(target: "floe::network", "{}: closed by peer", self.inner.info);
                    self.finish(RpcError::ConnectionClosed);
                    break;
                }
            }
        }
    }

    async fn handle_request(&self, request: Request) {
        let Some(dispatch) = self.admit(request).await else {
            return;
        };
        if self.inner.options.serialize_dispatch {
            dispatch.run().await;
        } else {
            self.inner.dispatch_pool.spawn(dispatch.run());
        }
    }

    /// Batched requests are dispatched one after another in arrival order.
    async fn handle_batch(&self, requests: Vec<Request>) {
        let guard = DispatchGuard::new(self.clone());
        let connection = self.clone();
        let job = async move {
            let _guard = guard;
            for request in requests {
                if let Some(dispatch) = connection.admit(request).await {
                    dispatch.run().await;
                }
            }
        };
        if self.inner.options.serialize_dispatch {
            job.await;
        } else {
            self.inner.dispatch_pool.spawn(job);
        }
    }

    /// Find the adapter and a dispatch slot for `request`, or answer it
    /// directly when it cannot be dispatched.
    async fn admit(&self, request: Request) -> Option<Dispatch> {
        if self.state() != ConnectionState::Active {
            trace!(target: "floe::dispatch", "{}: discarding request while closing", self.inner.info);
            return None;
        }
        let twoway = !request.is_oneway();
        let target = || RequestTarget {
            identity: request.identity.clone(),
            facet: request.facet.clone(),
            operation: request.operation.clone(),
        };

        let Some(adapter) = self.adapter() else {
            if twoway {
                let error = RpcError::ObjectAdapterNotFound(format!(
                    "no adapter is bound to connection {}",
                    self.inner.info
                ));
                let body = result_to_reply(Err(error), &target(), request.params.encoding);
                self.send_reply(request.request_id, body).await;
            }
            return None;
        };

        let admitted = tokio::select! {
            _ = self.inner.stop.cancelled() => return None,
            admitted = adapter.admit_dispatch() => admitted,
        };
        match admitted {
            Ok(permit) => {
                // counted before the state check so a graceful close either
                // waits for this dispatch or sees it discarded
                let guard = DispatchGuard::new(self.clone());
                if self.state() != ConnectionState::Active {
                    trace!(target: "floe::dispatch", "{}: discarding request admitted while closing", self.inner.info);
                    return None;
                }
                Some(Dispatch {
                    connection: self.clone(),
                    adapter,
                    permit,
                    request,
                    _guard: guard,
                })
            }
            Err(e) => {
                if self.is_incoming() {
                    debug!(target: "floe::dispatch", "{}: discarding request: {}", self.inner.info, e);
                } else if twoway {
                    let body = result_to_reply(Err(e), &target(), request.params.encoding);
                    self.send_reply(request.request_id, body).await;
                }
                None
            }
        }
    }

    async fn send_reply(&self, request_id: i32, body: ReplyBody) {
        let mut frame = Message::Reply(Reply { request_id, body }).encode();
        if let Err(e) = self.check_size(&frame) {
            frame = Message::Reply(Reply {
                request_id,
                body: ReplyBody::LocalException {
                    kind: floe_proto::LocalExceptionKind::Unknown,
                    message: e.to_string(),
                },
            })
            .encode();
        }
        if let Err(e) = self.write_frame(&frame).await {
            debug!(
                target: "floe::dispatch",
                "{}: cannot send reply {}: {}",
                self.inner.info,
                request_id,
                e
            );
        }
    }

    // ---- idle monitor ----

    fn touch(&self) {
        *self.inner.last_activity.lock() = Instant::now();
    }

    async fn monitor_idle(self, idle: Duration) {
        loop {
            let elapsed = self.inner.last_activity.lock().elapsed();
            let wait = match idle.checked_sub(elapsed) {
                Some(remaining) if !remaining.is_zero() => remaining,
                _ => idle,
            };
            tokio::select! {
                _ = self.inner.stop.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
            if self.state() != ConnectionState::Active {
                return;
            }
            let quiet = self.inner.last_activity.lock().elapsed() >= idle
                && *self.inner.pending_count.borrow() == 0
                && *self.inner.dispatch_count.borrow() == 0;
            if quiet {
                debug!(target: "floe::network", "closing idle connection {}", self.inner.info);
                self.close_gracefully(false).await;
                return;
            }
        }
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Connection {}

impl Hash for Connection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner.info, f)
    }
}

/// An admitted request with its dispatch slot
struct Dispatch {
    connection: Connection,
    adapter: ObjectAdapter,
    permit: OwnedSemaphorePermit,
    request: Request,
    _guard: DispatchGuard,
}

impl Dispatch {
    async fn run(self) {
        let request_id = self.request.request_id;
        let body = self
            .adapter
            .dispatch(self.request, Some(self.connection.clone()))
            .await;
        if request_id != 0 {
            self.connection.send_reply(request_id, body).await;
        }
        drop(self.permit);
        drop(self._guard);
    }
}

/// Counts a dispatch as in flight for graceful close and idle detection
struct DispatchGuard(Connection);

impl DispatchGuard {
    fn new(connection: Connection) -> Self {
        connection.inner.dispatch_count.send_modify(|n| *n += 1);
        Self(connection)
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        self.0.inner.dispatch_count.send_modify(|n| *n -= 1);
        self.0.touch();
    }
}

/// Stands in for a released transport
struct ClosedWriter;

#[async_trait]
impl FrameWriter for ClosedWriter {
    async fn write_frame(&mut self, _frame: &[u8]) -> floe_proto::Result<()> {
        Err(ProtocolError::ConnectionClosed)
    }

    async fn shutdown(&mut self) -> floe_proto::Result<()> {
        Ok(())
    }
}

async fn wait_for_zero(mut count: watch::Receiver<usize>) {
    loop {
        if *count.borrow_and_update() == 0 {
            return;
        }
        if count.changed().await.is_err() {
            return;
        }
    }
}
