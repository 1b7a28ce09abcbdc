//! Client-side proxies
//!
//! An [`ObjectPrx`] is a cheap handle: an `Arc<Reference>` plus the
//! communicator it belongs to. Derivations return a new proxy and never
//! touch the original. Equality and hashing look only at the reference.

use crate::communicator::{Communicator, Instance};
use crate::config::EndpointSelection;
use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::invocation;
use crate::reference::{InvocationMode, Reference};
use bytes::Bytes;
use floe_proto::{Context, EncodingVersion, Identity, InputStream, OperationMode, OutputStream, Request};
use parking_lot::Mutex;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Per-call overrides
#[derive(Debug, Clone, Default)]
pub struct InvocationOptions {
    /// Replaces the proxy's context for this call
    pub context: Option<Context>,
    /// Replaces the proxy's invocation timeout for this call
    pub deadline: Option<Instant>,
    pub cancel: Option<CancellationToken>,
}

impl InvocationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn context(mut self, context: Context) -> Self {
        self.context = Some(context);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Proxy to a remote or collocated object
#[derive(Clone)]
pub struct ObjectPrx {
    reference: Arc<Reference>,
    instance: Arc<Instance>,
    /// Requests queued by a batch proxy; shared by clones
    batch: Arc<Mutex<Vec<Request>>>,
}

impl ObjectPrx {
    pub(crate) fn new(reference: Reference, instance: Arc<Instance>) -> Self {
        Self {
            reference: Arc::new(reference),
            instance,
            batch: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn derive(&self, reference: Reference) -> Self {
        Self::new(reference, self.instance.clone())
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    pub(crate) fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn communicator(&self) -> Communicator {
        Communicator::from_instance(self.instance.clone())
    }

    pub fn identity(&self) -> &Identity {
        self.reference.identity()
    }

    pub fn facet(&self) -> &str {
        self.reference.facet()
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        self.reference.endpoints()
    }

    pub fn adapter_id(&self) -> Option<&str> {
        self.reference.adapter_id()
    }

    pub fn invocation_mode(&self) -> InvocationMode {
        self.reference.mode()
    }

    pub fn is_fixed(&self) -> bool {
        self.reference.fixed().is_some()
    }

    /// Stringified form. Fails for fixed proxies.
    pub fn to_proxy_string(&self) -> Result<String> {
        self.reference.to_proxy_string()
    }

    // ---- derivations ----

    pub fn with_identity(&self, identity: Identity) -> Self {
        self.derive(self.reference.with_identity(identity))
    }

    pub fn with_facet(&self, facet: impl Into<String>) -> Self {
        self.derive(self.reference.with_facet(facet))
    }

    pub fn with_context(&self, context: Context) -> Self {
        self.derive(self.reference.with_context(context))
    }

    /// Endpoint timeout; `None` is infinite.
    pub fn with_timeout(&self, timeout: Option<Duration>) -> Self {
        self.derive(self.reference.with_timeout(timeout))
    }

    pub fn with_endpoints(&self, endpoints: Vec<Endpoint>) -> Self {
        self.derive(self.reference.with_endpoints(endpoints))
    }

    pub fn with_adapter_id(&self, adapter_id: Option<&str>) -> Self {
        self.derive(self.reference.with_adapter_id(adapter_id.map(str::to_string)))
    }

    /// Bind every invocation to `connection`.
    pub fn with_fixed(&self, connection: &Connection) -> Self {
        self.derive(self.reference.with_fixed(Some(connection.clone())))
    }

    pub fn with_invocation_mode(&self, mode: InvocationMode) -> Self {
        self.derive(self.reference.with_mode(mode))
    }

    pub fn with_twoway(&self) -> Self {
        self.with_invocation_mode(InvocationMode::Twoway)
    }

    pub fn with_oneway(&self) -> Self {
        self.with_invocation_mode(InvocationMode::Oneway)
    }

    pub fn with_datagram(&self) -> Self {
        self.with_invocation_mode(InvocationMode::Datagram)
    }

    pub fn with_batch(&self) -> Self {
        self.with_invocation_mode(InvocationMode::Batch)
    }

    pub fn with_secure(&self, secure: bool) -> Self {
        self.derive(self.reference.with_secure(secure))
    }

    pub fn with_compress(&self, compress: bool) -> Self {
        self.derive(self.reference.with_compress(compress))
    }

    pub fn with_invocation_timeout(&self, timeout: Option<Duration>) -> Self {
        self.derive(self.reference.with_invocation_timeout(timeout))
    }

    pub fn with_encoding(&self, encoding: EncodingVersion) -> Self {
        self.derive(self.reference.with_encoding(encoding))
    }

    pub fn with_collocation_optimized(&self, collocation_optimized: bool) -> Self {
        self.derive(self.reference.with_collocation_optimized(collocation_optimized))
    }

    pub fn with_endpoint_selection(&self, selection: EndpointSelection) -> Self {
        self.derive(self.reference.with_endpoint_selection(selection))
    }

    // ---- invocation ----

    /// Invoke `operation` with an already marshalled payload. Oneway,
    /// datagram and batch proxies return an empty payload.
    pub async fn invoke(&self, operation: &str, mode: OperationMode, params: Bytes) -> Result<Bytes> {
        self.invoke_with(operation, mode, params, InvocationOptions::default())
            .await
    }

    pub async fn invoke_with(
        &self,
        operation: &str,
        mode: OperationMode,
        params: Bytes,
        options: InvocationOptions,
    ) -> Result<Bytes> {
        invocation::invoke(self, operation, mode, params, options).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.invoke("ice_ping", OperationMode::Idempotent, Bytes::new())
            .await
            .map(|_| ())
    }

    pub async fn ice_is_a(&self, type_id: &str) -> Result<bool> {
        let mut out = OutputStream::new();
        out.write_string(type_id);
        let reply = self
            .with_twoway()
            .invoke("ice_isA", OperationMode::Idempotent, out.finish())
            .await?;
        Ok(InputStream::new(reply).read_bool()?)
    }

    pub async fn ice_id(&self) -> Result<String> {
        let reply = self
            .with_twoway()
            .invoke("ice_id", OperationMode::Idempotent, Bytes::new())
            .await?;
        Ok(InputStream::new(reply).read_string()?)
    }

    pub async fn ice_ids(&self) -> Result<Vec<String>> {
        let reply = self
            .with_twoway()
            .invoke("ice_ids", OperationMode::Idempotent, Bytes::new())
            .await?;
        Ok(InputStream::new(reply).read_string_seq()?)
    }

    /// The connection invocations would use, establishing it if needed.
    /// Collocated targets have none.
    pub async fn get_connection(&self) -> Result<Option<Connection>> {
        invocation::get_connection(self).await
    }

    /// Send every queued batch request in one frame.
    pub async fn flush_batch_requests(&self) -> Result<()> {
        let requests = std::mem::take(&mut *self.batch.lock());
        invocation::flush_batch(self, requests).await
    }

    pub(crate) fn queue_batch_request(&self, request: Request) {
        self.batch.lock().push(request);
    }

    /// Number of requests waiting for [`ObjectPrx::flush_batch_requests`]
    pub fn queued_batch_requests(&self) -> usize {
        self.batch.lock().len()
    }
}

impl PartialEq for ObjectPrx {
    fn eq(&self, other: &Self) -> bool {
        self.reference == other.reference
    }
}

impl Eq for ObjectPrx {}

impl Hash for ObjectPrx {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.reference.hash(state);
    }
}

impl fmt::Debug for ObjectPrx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ObjectPrx").field(&self.reference).finish()
    }
}

impl fmt::Display for ObjectPrx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reference.to_proxy_string() {
            Ok(s) => f.write_str(&s),
            Err(_) => write!(f, "{} (fixed)", self.reference.identity()),
        }
    }
}
