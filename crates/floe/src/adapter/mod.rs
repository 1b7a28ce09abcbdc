//! Object adapters
//!
//! An adapter owns a set of acceptors, the connections they produce and a
//! dispatch table. Requests are resolved in this order:
//!
//! 1. the servant registered for `(identity, facet)`
//! 2. the default servant of the identity's category, then the
//!    category-less default servant
//! 3. the servant locator of the identity's category, then the
//!    category-less locator
//!
//! If nothing matches, the request fails with `FacetNotExist` when some
//! other facet of the identity is registered and `ObjectNotExist`
//! otherwise.
//!
//! Lifecycle: `Holding -> Active <-> Holding -> Deactivating -> Deactivated`.
//! A holding adapter keeps its acceptors bound but accepts nothing, and
//! its connections stop reading new requests.

mod servant_manager;

use crate::communicator::{Communicator, Instance};
use crate::config::{AdapterConfig, UNLIMITED_DISPATCHES};
use crate::connection::{CloseMode, Connection};
use crate::endpoint::{Acceptor, Endpoint, PendingTransceiver};
use crate::error::{result_to_reply, Result, RpcError};
use crate::proxy::ObjectPrx;
use crate::reference::Reference;
use crate::servant::{dispatch_builtin, Current, Servant};
use crate::servant_locator::{Located, ServantLocator};
use bytes::Bytes;
use floe_proto::{Identity, ReplyBody, Request, RequestTarget};
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use servant_manager::ServantManager;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Adapter lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AdapterState {
    Holding,
    Active,
    Deactivating,
    Deactivated,
}

/// Dispatch statistics
#[derive(Debug, Default)]
pub struct DispatchStats {
    pub connections_accepted: AtomicU64,
    pub requests_received: AtomicU64,
    pub requests_dispatched: AtomicU64,
    pub requests_failed: AtomicU64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            requests_received: self.requests_received.load(Ordering::Relaxed),
            requests_dispatched: self.requests_dispatched.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of dispatch statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchStatsSnapshot {
    pub connections_accepted: u64,
    pub requests_received: u64,
    pub requests_dispatched: u64,
    pub requests_failed: u64,
}

/// Server-side dispatch endpoint
#[derive(Clone)]
pub struct ObjectAdapter {
    inner: Arc<AdapterInner>,
}

struct AdapterInner {
    name: String,
    adapter_id: Option<String>,
    instance: Weak<Instance>,
    servants: ServantManager,
    state: watch::Sender<AdapterState>,
    dispatch_limit: u32,
    permits: Arc<Semaphore>,
    endpoints: Vec<Endpoint>,
    published: Vec<Endpoint>,
    connections: Mutex<Vec<Connection>>,
    acceptor_tasks: Mutex<Vec<JoinHandle<()>>>,
    stop_accepting: CancellationToken,
    destroyed: AtomicBool,
    stats: DispatchStats,
}

impl ObjectAdapter {
    /// Bind the configured endpoints; the adapter starts out holding.
    pub(crate) async fn create(
        instance: &Arc<Instance>,
        name: String,
        config: AdapterConfig,
    ) -> Result<Self> {
        let mut acceptors = Vec::new();
        if let Some(endpoints) = &config.endpoints {
            for endpoint in instance.endpoint_factories().parse_list(endpoints)? {
                acceptors.push(endpoint.acceptor().await?);
            }
        }
        let endpoints: Vec<Endpoint> = acceptors.iter().map(|a| a.endpoint()).collect();

        let published = match &config.published_endpoints {
            Some(list) => instance.endpoint_factories().parse_list(list)?,
            None => endpoints.iter().map(publishable).collect(),
        };

        let dispatch_limit = config.max_dispatches.unwrap_or(UNLIMITED_DISPATCHES);
        let (state, _) = watch::channel(AdapterState::Holding);
        let adapter = Self {
            inner: Arc::new(AdapterInner {
                name,
                adapter_id: config.adapter_id.filter(|id| !id.is_empty()),
                instance: Arc::downgrade(instance),
                servants: ServantManager::default(),
                state,
                dispatch_limit,
                permits: Arc::new(Semaphore::new(dispatch_limit as usize)),
                endpoints,
                published,
                connections: Mutex::new(Vec::new()),
                acceptor_tasks: Mutex::new(Vec::new()),
                stop_accepting: CancellationToken::new(),
                destroyed: AtomicBool::new(false),
                stats: DispatchStats::default(),
            }),
        };

        let tasks = acceptors
            .into_iter()
            .map(|acceptor| instance.server_pool().spawn(adapter.clone().run_acceptor(acceptor)))
            .collect();
        *adapter.inner.acceptor_tasks.lock() = tasks;

        info!(
            target: "floe::adapter",
            "created adapter `{}` on [{}]",
            adapter.inner.name,
            adapter
                .inner
                .endpoints
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(adapter)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn adapter_id(&self) -> Option<&str> {
        self.inner.adapter_id.as_deref()
    }

    pub fn state(&self) -> AdapterState {
        *self.inner.state.borrow()
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.inner.stats
    }

    /// Owning communicator
    pub fn communicator(&self) -> Result<Communicator> {
        Ok(Communicator::from_instance(self.instance()?))
    }

    pub(crate) fn instance(&self) -> Result<Arc<Instance>> {
        self.inner
            .instance
            .upgrade()
            .ok_or(RpcError::CommunicatorDestroyed)
    }

    /// Endpoints the acceptors are bound to
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.inner.endpoints.clone()
    }

    /// Endpoints placed in direct proxies
    pub fn published_endpoints(&self) -> Vec<Endpoint> {
        self.inner.published.clone()
    }

    // ---- lifecycle ----

    /// Start accepting connections and dispatching requests.
    pub fn activate(&self) -> Result<()> {
        let mut result = Ok(());
        self.inner.state.send_if_modified(|state| match *state {
            AdapterState::Holding => {
                *state = AdapterState::Active;
                true
            }
            AdapterState::Active => false,
            _ => {
                result = Err(self.deactivated_error());
                false
            }
        });
        if result.is_ok() {
            debug!(target: "floe::adapter", "adapter `{}` active", self.inner.name);
        }
        result
    }

    /// Stop accepting new connections and requests; existing connections
    /// stay open.
    pub fn hold(&self) {
        let changed = self.inner.state.send_if_modified(|state| {
            if *state == AdapterState::Active {
                *state = AdapterState::Holding;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(target: "floe::adapter", "adapter `{}` holding", self.inner.name);
        }
    }

    /// Wait until the adapter holds and its in-flight dispatches are done.
    pub async fn wait_for_hold(&self) {
        let mut state = self.inner.state.subscribe();
        loop {
            if *state.borrow_and_update() != AdapterState::Active {
                break;
            }
            if state.changed().await.is_err() {
                break;
            }
        }
        if let Ok(permits) = self.inner.permits.acquire_many(self.inner.dispatch_limit).await {
            drop(permits);
        }
    }

    /// Stop accepting, let in-flight dispatches finish, then close every
    /// connection gracefully. Idempotent; concurrent callers all return
    /// once deactivation is complete.
    ///
    /// Awaiting this from inside a dispatch of the same adapter never
    /// completes, since that dispatch is itself in flight.
    pub async fn deactivate(&self) {
        let first = self.inner.state.send_if_modified(|state| {
            if *state < AdapterState::Deactivating {
                *state = AdapterState::Deactivating;
                true
            } else {
                false
            }
        });
        if !first {
            self.wait_for_deactivate().await;
            return;
        }
        info!(target: "floe::adapter", "deactivating adapter `{}`", self.inner.name);

        self.inner.stop_accepting.cancel();
        let tasks = std::mem::take(&mut *self.inner.acceptor_tasks.lock());
        for task in tasks {
            let _ = task.await;
        }

        match self.inner.permits.acquire_many(self.inner.dispatch_limit).await {
            Ok(permits) => {
                self.inner.permits.close();
                drop(permits);
            }
            Err(_) => self.inner.permits.close(),
        }

        let connections = std::mem::take(&mut *self.inner.connections.lock());
        join_all(connections.iter().map(|c| c.close(CloseMode::Gracefully))).await;

        self.inner.state.send_replace(AdapterState::Deactivated);
        info!(target: "floe::adapter", "adapter `{}` deactivated", self.inner.name);
    }

    pub async fn wait_for_deactivate(&self) {
        let mut state = self.inner.state.subscribe();
        loop {
            if *state.borrow_and_update() == AdapterState::Deactivated {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_deactivated(&self) -> bool {
        self.state() == AdapterState::Deactivated
    }

    /// Deactivate, notify servant locators and release the adapter's name.
    pub async fn destroy(&self) {
        self.deactivate().await;
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        for (category, locator) in self.inner.servants.destroy() {
            locator.deactivate(&category).await;
        }
        if let Some(instance) = self.inner.instance.upgrade() {
            instance.remove_adapter(&self.inner.name);
        }
        debug!(target: "floe::adapter", "adapter `{}` destroyed", self.inner.name);
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    // ---- servant registration ----

    pub fn add(&self, servant: Arc<dyn Servant>, identity: Identity) -> Result<ObjectPrx> {
        self.add_facet(servant, identity, "")
    }

    pub fn add_facet(
        &self,
        servant: Arc<dyn Servant>,
        identity: Identity,
        facet: &str,
    ) -> Result<ObjectPrx> {
        self.check_for_deactivation()?;
        self.inner.servants.add(servant, &identity, facet)?;
        Ok(self.create_proxy(identity)?.with_facet(facet))
    }

    /// Register under a fresh UUID identity.
    pub fn add_with_uuid(&self, servant: Arc<dyn Servant>) -> Result<ObjectPrx> {
        self.add(servant, Identity::named(uuid::Uuid::new_v4().to_string()))
    }

    pub fn add_default_servant(&self, servant: Arc<dyn Servant>, category: &str) -> Result<()> {
        self.check_for_deactivation()?;
        self.inner.servants.add_default_servant(servant, category)
    }

    pub fn remove(&self, identity: &Identity) -> Result<Arc<dyn Servant>> {
        self.remove_facet(identity, "")
    }

    pub fn remove_facet(&self, identity: &Identity, facet: &str) -> Result<Arc<dyn Servant>> {
        self.check_for_deactivation()?;
        self.inner.servants.remove(identity, facet)
    }

    pub fn remove_all_facets(
        &self,
        identity: &Identity,
    ) -> Result<BTreeMap<String, Arc<dyn Servant>>> {
        self.check_for_deactivation()?;
        self.inner.servants.remove_all_facets(identity)
    }

    pub fn remove_default_servant(&self, category: &str) -> Result<Arc<dyn Servant>> {
        self.check_for_deactivation()?;
        self.inner.servants.remove_default_servant(category)
    }

    pub fn find(&self, identity: &Identity) -> Option<Arc<dyn Servant>> {
        self.find_facet(identity, "")
    }

    pub fn find_facet(&self, identity: &Identity, facet: &str) -> Option<Arc<dyn Servant>> {
        self.inner.servants.find(identity, facet)
    }

    pub fn find_all_facets(&self, identity: &Identity) -> BTreeMap<String, Arc<dyn Servant>> {
        self.inner.servants.find_all_facets(identity)
    }

    pub fn find_default_servant(&self, category: &str) -> Option<Arc<dyn Servant>> {
        self.inner.servants.find_default_servant(category)
    }

    pub fn add_servant_locator(&self, locator: Arc<dyn ServantLocator>, category: &str) -> Result<()> {
        self.check_for_deactivation()?;
        self.inner.servants.add_locator(locator, category)
    }

    pub fn remove_servant_locator(&self, category: &str) -> Result<Arc<dyn ServantLocator>> {
        self.check_for_deactivation()?;
        self.inner.servants.remove_locator(category)
    }

    pub fn find_servant_locator(&self, category: &str) -> Option<Arc<dyn ServantLocator>> {
        self.inner.servants.find_locator(category)
    }

    // ---- proxies ----

    /// Indirect proxy when the adapter has an adapter id, direct otherwise
    pub fn create_proxy(&self, identity: Identity) -> Result<ObjectPrx> {
        if self.inner.adapter_id.is_some() {
            self.create_indirect_proxy(identity)
        } else {
            self.create_direct_proxy(identity)
        }
    }

    pub fn create_direct_proxy(&self, identity: Identity) -> Result<ObjectPrx> {
        let instance = self.instance()?;
        let reference =
            Reference::new(identity, instance.config())?.with_endpoints(self.inner.published.clone());
        Ok(ObjectPrx::new(reference, instance))
    }

    /// `identity @ adapter-id`, or a well-known proxy without an adapter id
    pub fn create_indirect_proxy(&self, identity: Identity) -> Result<ObjectPrx> {
        let instance = self.instance()?;
        let reference = Reference::new(identity, instance.config())?
            .with_adapter_id(self.inner.adapter_id.clone());
        Ok(ObjectPrx::new(reference, instance))
    }

    /// Whether invocations on `reference` can be dispatched here in-process
    pub(crate) fn is_local(&self, reference: &Reference) -> bool {
        if self.state() >= AdapterState::Deactivating {
            return false;
        }
        if let Some(adapter_id) = reference.adapter_id() {
            return self.inner.adapter_id.as_deref() == Some(adapter_id);
        }
        if reference.endpoints().is_empty() {
            return self.inner.servants.has_servant(reference.identity());
        }
        reference.endpoints().iter().any(|endpoint| {
            self.inner
                .endpoints
                .iter()
                .chain(self.inner.published.iter())
                .any(|local| same_address(endpoint, local))
        })
    }

    // ---- dispatch ----

    fn deactivated_error(&self) -> RpcError {
        RpcError::ObjectAdapterDeactivated(self.inner.name.clone())
    }

    fn check_for_deactivation(&self) -> Result<()> {
        if self.state() >= AdapterState::Deactivating {
            return Err(self.deactivated_error());
        }
        Ok(())
    }

    /// Wait while holding, then take a dispatch slot. Fails once the
    /// adapter is deactivating, including for callers already queued for
    /// a slot when deactivation starts.
    pub(crate) async fn admit_dispatch(&self) -> Result<OwnedSemaphorePermit> {
        let mut state = self.inner.state.subscribe();
        loop {
            let current = *state.borrow_and_update();
            match current {
                AdapterState::Holding => {
                    if state.changed().await.is_err() {
                        return Err(self.deactivated_error());
                    }
                    continue;
                }
                AdapterState::Active => {}
                _ => return Err(self.deactivated_error()),
            }

            tokio::select! {
                permit = self.inner.permits.clone().acquire_owned() => {
                    let permit = permit.map_err(|_| self.deactivated_error())?;
                    match *self.inner.state.borrow() {
                        AdapterState::Active => return Ok(permit),
                        // released again until the adapter is reactivated
                        AdapterState::Holding => drop(permit),
                        _ => return Err(self.deactivated_error()),
                    }
                }
                changed = state.changed() => {
                    if changed.is_err() {
                        return Err(self.deactivated_error());
                    }
                }
            }
        }
    }

    /// Resolve and run one request. The caller holds a dispatch slot.
    pub(crate) async fn dispatch(&self, request: Request, connection: Option<Connection>) -> ReplyBody {
        let current = Current {
            adapter: self.clone(),
            connection,
            identity: request.identity,
            facet: request.facet,
            operation: request.operation,
            mode: request.mode,
            context: request.context,
            request_id: request.request_id,
            encoding: request.params.encoding,
        };
        let stats = &self.inner.stats;
        stats.requests_received.fetch_add(1, Ordering::Relaxed);

        let result = self.dispatch_current(&current, request.params.data).await;
        match &result {
            Ok(_) => {
                stats.requests_dispatched.fetch_add(1, Ordering::Relaxed);
                trace!(
                    target: "floe::dispatch",
                    "dispatched `{}` on `{}`",
                    current.operation,
                    current.identity
                );
            }
            Err(e) => {
                stats.requests_failed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    target: "floe::dispatch",
                    "dispatch of `{}` on `{}` failed: {}",
                    current.operation,
                    current.identity,
                    e
                );
            }
        }

        let target = RequestTarget {
            identity: current.identity.clone(),
            facet: current.facet.clone(),
            operation: current.operation.clone(),
        };
        result_to_reply(result, &target, current.encoding)
    }

    async fn dispatch_current(&self, current: &Current, params: Bytes) -> Result<Bytes> {
        if let Some(servant) = self
            .inner
            .servants
            .find_servant(&current.identity, &current.facet)
        {
            return invoke_servant(&servant, current, params).await;
        }

        for locator in self.inner.servants.locators_for(&current.identity.category) {
            match catch_panic(locator.locate(current)).await {
                Ok(Located::Found { servant, cookie }) => {
                    let result = invoke_servant(&servant, current, params).await;
                    finish_locate(&locator, current, Some(&servant), cookie).await;
                    return result;
                }
                Ok(Located::NotFound) => finish_locate(&locator, current, None, None).await,
                Err(e) => {
                    finish_locate(&locator, current, None, None).await;
                    return Err(e);
                }
            }
        }

        let (identity, facet, operation) = (
            current.identity.clone(),
            current.facet.clone(),
            current.operation.clone(),
        );
        if self.inner.servants.has_identity(&current.identity) {
            Err(RpcError::FacetNotExist {
                identity,
                facet,
                operation,
            })
        } else {
            Err(RpcError::ObjectNotExist {
                identity,
                facet,
                operation,
            })
        }
    }

    // ---- acceptors ----

    async fn run_acceptor(self, mut acceptor: Box<dyn Acceptor>) {
        let endpoint = acceptor.endpoint();
        let mut state = self.inner.state.subscribe();
        loop {
            let current = *state.borrow_and_update();
            match current {
                AdapterState::Holding => {
                    tokio::select! {
                        _ = self.inner.stop_accepting.cancelled() => break,
                        changed = state.changed() => if changed.is_err() { break },
                    }
                    continue;
                }
                AdapterState::Active => {}
                _ => break,
            }

            tokio::select! {
                _ = self.inner.stop_accepting.cancelled() => break,
                _ = state.changed() => continue,
                accepted = acceptor.accept() => match accepted {
                    Ok(pending) => {
                        let adapter = self.clone();
                        let endpoint = endpoint.clone();
                        if let Ok(instance) = self.instance() {
                            instance
                                .server_pool()
                                .spawn(async move { adapter.finish_accept(endpoint, pending).await });
                        }
                    }
                    Err(e) => {
                        warn!(target: "floe::network", "accept on {} failed: {}", endpoint, e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        debug!(
            target: "floe::network",
            "adapter `{}` stopped accepting on {}",
            self.inner.name,
            endpoint
        );
    }

    async fn finish_accept(&self, endpoint: Endpoint, pending: PendingTransceiver) {
        let Ok(instance) = self.instance() else {
            return;
        };
        let connect_timeout = instance.config().connection.connect_timeout;
        let transceiver = match tokio::time::timeout(connect_timeout, pending).await {
            Ok(Ok(transceiver)) => transceiver,
            Ok(Err(e)) => {
                debug!(target: "floe::network", "incoming connection on {} failed: {}", endpoint, e);
                return;
            }
            Err(_) => {
                debug!(target: "floe::network", "incoming connection on {} timed out", endpoint);
                return;
            }
        };

        let connection =
            match Connection::accept_incoming(&instance, endpoint, transceiver, self.clone()).await {
                Ok(connection) => connection,
                Err(e) => {
                    debug!(target: "floe::network", "validation of incoming connection failed: {}", e);
                    return;
                }
            };

        let accepted = {
            let mut connections = self.inner.connections.lock();
            if self.state() >= AdapterState::Deactivating {
                false
            } else {
                connections.retain(|c| !c.is_closed());
                connections.push(connection.clone());
                true
            }
        };
        if accepted {
            self.inner
                .stats
                .connections_accepted
                .fetch_add(1, Ordering::Relaxed);
        } else {
            connection.close(CloseMode::Forcefully).await;
        }
    }
}

impl PartialEq for ObjectAdapter {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ObjectAdapter {}

impl fmt::Debug for ObjectAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectAdapter")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

async fn invoke_servant(
    servant: &Arc<dyn Servant>,
    current: &Current,
    params: Bytes,
) -> Result<Bytes> {
    if let Some(result) = dispatch_builtin(servant.as_ref(), current, &params) {
        return result;
    }
    catch_panic(servant.dispatch(current, params)).await
}

async fn finish_locate(
    locator: &Arc<dyn ServantLocator>,
    current: &Current,
    servant: Option<&Arc<dyn Servant>>,
    cookie: Option<crate::servant_locator::Cookie>,
) {
    let finished = AssertUnwindSafe(locator.finished(current, servant, cookie)).catch_unwind();
    if let Err(panic) = finished.await {
        warn!(
            target: "floe::dispatch",
            "servant locator `finished` panicked: {}",
            panic_message(panic.as_ref())
        );
    }
}

/// Turn a panic in user code into an `Unknown` error.
async fn catch_panic<T>(fut: impl Future<Output = Result<T>>) -> Result<T> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(RpcError::Unknown(format!(
            "servant panicked: {}",
            panic_message(panic.as_ref())
        ))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Wildcard bind hosts are published as loopback.
fn publishable(endpoint: &Endpoint) -> Endpoint {
    match endpoint.host() {
        "" | "*" | "0.0.0.0" => endpoint.with_address("127.0.0.1", endpoint.port()),
        _ => endpoint.clone(),
    }
}

fn same_address(a: &Endpoint, b: &Endpoint) -> bool {
    a.transport() == b.transport() && a.host() == b.host() && a.port() == b.port()
}
