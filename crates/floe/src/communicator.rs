//! The communicator
//!
//! A [`Communicator`] is the root of the runtime. It owns the properties
//! and typed configuration, the endpoint factories, the worker pools, the
//! outgoing connection cache, every object adapter it created, the
//! default locator and the admin facets. There is no global instance;
//! create one per runtime and pass it around.
//!
//! Lifecycle: `shutdown` deactivates every adapter, `destroy` additionally
//! closes outgoing connections, destroys adapters and stops the pools.
//! After `destroy` every operation fails with `CommunicatorDestroyed`.

use crate::adapter::ObjectAdapter;
use crate::admin::AdminFacets;
use crate::config::{AdapterConfig, CommunicatorConfig, EndpointSelection};
use crate::connection::OutgoingConnectionFactory;
use crate::endpoint::{EndpointDefaults, EndpointFactory, EndpointFactoryRegistry, SslEngine};
use crate::error::{Result, RpcError};
use crate::locator::{Locator, LocatorInfo};
use crate::properties::Properties;
use crate::proxy::ObjectPrx;
use crate::reference::Reference;
use crate::servant::Servant;
use crate::thread_pool::ThreadPool;
use floe_proto::Identity;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Name of the adapter created for `Floe.Admin.Endpoints`
pub const ADMIN_ADAPTER: &str = "Floe.Admin";

/// Everything a communicator is built from
#[derive(Debug, Clone, Default)]
pub struct InitializationData {
    pub properties: Properties,
    /// TLS configuration; read from `Floe.SSL.*` when `None`
    pub ssl: Option<SslEngine>,
}

/// Runtime state shared by the communicator and everything it creates
pub(crate) struct Instance {
    properties: Properties,
    config: CommunicatorConfig,
    factories: EndpointFactoryRegistry,
    client_pool: Arc<ThreadPool>,
    server_pool: Arc<ThreadPool>,
    outgoing: OutgoingConnectionFactory,
    /// `None` marks a name reserved by an adapter still binding
    adapters: Mutex<HashMap<String, Option<ObjectAdapter>>>,
    locator: RwLock<Option<Arc<dyn Locator>>>,
    locator_info: LocatorInfo,
    admin: AdminFacets,
    shutdown_started: AtomicBool,
    shutdown_done: watch::Sender<bool>,
    destroyed: AtomicBool,
    destroy_done: watch::Sender<bool>,
}

impl Instance {
    pub(crate) fn config(&self) -> &CommunicatorConfig {
        &self.config
    }

    pub(crate) fn endpoint_factories(&self) -> &EndpointFactoryRegistry {
        &self.factories
    }

    pub(crate) fn client_pool(&self) -> &Arc<ThreadPool> {
        &self.client_pool
    }

    pub(crate) fn server_pool(&self) -> &Arc<ThreadPool> {
        &self.server_pool
    }

    pub(crate) fn outgoing_connections(&self) -> &OutgoingConnectionFactory {
        &self.outgoing
    }

    pub(crate) fn locator_info(&self) -> &LocatorInfo {
        &self.locator_info
    }

    pub(crate) fn default_locator(&self) -> Option<Arc<dyn Locator>> {
        self.locator.read().clone()
    }

    pub(crate) fn check_alive(&self) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(RpcError::CommunicatorDestroyed);
        }
        Ok(())
    }

    pub(crate) fn remove_adapter(&self, name: &str) {
        self.adapters.lock().remove(name);
    }

    fn adapters(&self) -> Vec<ObjectAdapter> {
        self.adapters.lock().values().flatten().cloned().collect()
    }

    /// An adapter of this communicator that can dispatch `reference`
    /// in-process
    pub(crate) fn find_collocated(&self, reference: &Reference) -> Option<ObjectAdapter> {
        self.adapters
            .lock()
            .values()
            .flatten()
            .find(|adapter| adapter.is_local(reference))
            .cloned()
    }
}

/// Process-local RPC runtime
#[derive(Clone)]
pub struct Communicator {
    instance: Arc<Instance>,
}

impl Communicator {
    /// Communicator with default properties. Must be called inside a
    /// tokio runtime.
    pub fn new() -> Result<Self> {
        Self::with_init_data(InitializationData::default())
    }

    pub fn with_properties(properties: Properties) -> Result<Self> {
        Self::with_init_data(InitializationData {
            properties,
            ssl: None,
        })
    }

    /// Build properties from `--Key=Value` arguments (and the file named by
    /// `--Floe.Config`). Returns the arguments that were not properties.
    pub fn initialize<I, S>(args: I) -> Result<(Self, Vec<String>)>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut properties = Properties::new();
        let remaining = properties.parse_command_line(args)?;
        Ok((Self::with_properties(properties)?, remaining))
    }

    pub fn with_init_data(init: InitializationData) -> Result<Self> {
        let properties = init.properties;
        let config = CommunicatorConfig::from_properties(&properties);
        let ssl = match init.ssl {
            Some(engine) => engine,
            None => SslEngine::from_properties(&properties)?,
        };
        let factories = EndpointFactoryRegistry::with_builtin(
            config.default_protocol.clone(),
            EndpointDefaults {
                host: config.default_host.clone(),
                timeout: config.default_timeout,
            },
            Arc::new(ssl),
        );
        let client_pool = Arc::new(ThreadPool::new("client", config.client_threads)?);
        let server_pool = Arc::new(ThreadPool::new("server", config.server_threads)?);

        let instance = Instance {
            locator_info: LocatorInfo::new(config.locator_cache_timeout),
            admin: AdminFacets::new(&properties),
            properties,
            config,
            factories,
            client_pool,
            server_pool,
            outgoing: OutgoingConnectionFactory::default(),
            adapters: Mutex::new(HashMap::new()),
            locator: RwLock::new(None),
            shutdown_started: AtomicBool::new(false),
            shutdown_done: watch::channel(false).0,
            destroyed: AtomicBool::new(false),
            destroy_done: watch::channel(false).0,
        };
        debug!("communicator created with {} properties", instance.properties.len());
        Ok(Self {
            instance: Arc::new(instance),
        })
    }

    pub(crate) fn from_instance(instance: Arc<Instance>) -> Self {
        Self { instance }
    }

    pub(crate) fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn properties(&self) -> &Properties {
        &self.instance.properties
    }

    pub fn config(&self) -> &CommunicatorConfig {
        &self.instance.config
    }

    // ---- proxies ----

    pub fn string_to_proxy(&self, s: &str) -> Result<ObjectPrx> {
        self.instance.check_alive()?;
        let reference = Reference::parse(s, &self.instance.factories, &self.instance.config)?;
        Ok(ObjectPrx::new(reference, self.instance.clone()))
    }

    pub fn proxy_to_string(&self, proxy: &ObjectPrx) -> Result<String> {
        proxy.to_proxy_string()
    }

    /// Proxy from the property `name`, refined by `name.CollocationOptimized`,
    /// `name.EndpointSelection`, `name.InvocationTimeout` and
    /// `name.Context.<key>`. `None` when the property is unset.
    pub fn property_to_proxy(&self, name: &str) -> Result<Option<ObjectPrx>> {
        let props = &self.instance.properties;
        let Some(value) = props.get(name) else {
            return Ok(None);
        };
        let mut proxy = self.string_to_proxy(value)?;

        if let Some(collocated) = props.get_int(&format!("{}.CollocationOptimized", name)) {
            proxy = proxy.with_collocation_optimized(collocated > 0);
        }
        match props.get(&format!("{}.EndpointSelection", name)) {
            Some("Random") => proxy = proxy.with_endpoint_selection(EndpointSelection::Random),
            Some("Ordered") => proxy = proxy.with_endpoint_selection(EndpointSelection::Ordered),
            Some(other) => {
                return Err(RpcError::invalid_proxy(
                    value,
                    format!("unknown endpoint selection `{}`", other),
                ))
            }
            None => {}
        }
        if let Some(ms) = props.get_int(&format!("{}.InvocationTimeout", name)) {
            let timeout = (ms > 0).then(|| Duration::from_millis(ms as u64));
            proxy = proxy.with_invocation_timeout(timeout);
        }
        let prefix = format!("{}.Context.", name);
        let context: BTreeMap<String, String> = props
            .get_for_prefix(&prefix)
            .into_iter()
            .map(|(k, v)| (k[prefix.len()..].to_string(), v))
            .collect();
        if !context.is_empty() {
            proxy = proxy.with_context(context);
        }
        Ok(Some(proxy))
    }

    /// Register a transport. Later registrations win.
    pub fn add_endpoint_factory(&self, factory: Arc<dyn EndpointFactory>) {
        self.instance.factories.add(factory);
    }

    pub fn set_default_locator(&self, locator: Option<Arc<dyn Locator>>) {
        *self.instance.locator.write() = locator;
    }

    pub fn default_locator(&self) -> Option<Arc<dyn Locator>> {
        self.instance.default_locator()
    }

    // ---- adapters ----

    /// Adapter configured from `<name>.*` properties. An empty name gets
    /// a generated one and no endpoints.
    pub async fn create_object_adapter(&self, name: &str) -> Result<ObjectAdapter> {
        let config = AdapterConfig::from_properties(&self.instance.properties, name);
        self.create_adapter(name, config).await
    }

    pub async fn create_object_adapter_with_endpoints(
        &self,
        name: &str,
        endpoints: &str,
    ) -> Result<ObjectAdapter> {
        let mut config = AdapterConfig::from_properties(&self.instance.properties, name);
        config.endpoints = Some(endpoints.to_string());
        self.create_adapter(name, config).await
    }

    async fn create_adapter(&self, name: &str, config: AdapterConfig) -> Result<ObjectAdapter> {
        self.instance.check_alive()?;
        if self.is_shutdown() {
            return Err(RpcError::CommunicatorDestroyed);
        }
        let name = if name.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            name.to_string()
        };
        {
            let mut adapters = self.instance.adapters.lock();
            if adapters.contains_key(&name) {
                return Err(RpcError::AlreadyRegistered {
                    kind: "object adapter",
                    id: name,
                });
            }
            adapters.insert(name.clone(), None);
        }

        let adapter = match ObjectAdapter::create(&self.instance, name.clone(), config).await {
            Ok(adapter) => adapter,
            Err(e) => {
                self.instance.remove_adapter(&name);
                return Err(e);
            }
        };
        self.instance
            .adapters
            .lock()
            .insert(name, Some(adapter.clone()));

        if self.is_shutdown() {
            adapter.destroy().await;
            return Err(RpcError::CommunicatorDestroyed);
        }
        Ok(adapter)
    }

    pub fn find_object_adapter(&self, name: &str) -> Option<ObjectAdapter> {
        self.instance.adapters.lock().get(name).cloned().flatten()
    }

    // ---- lifecycle ----

    /// Start deactivating every adapter and return immediately. Safe to
    /// call from inside a dispatch; use [`Communicator::wait_for_shutdown`]
    /// to wait for completion.
    pub fn shutdown(&self) {
        if self.instance.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("communicator shutting down");
        let instance = self.instance.clone();
        let adapters = instance.adapters();
        self.instance.server_pool.spawn(async move {
            join_all(adapters.iter().map(|adapter| adapter.deactivate())).await;
            instance.shutdown_done.send_replace(true);
        });
    }

    pub fn is_shutdown(&self) -> bool {
        self.instance.shutdown_started.load(Ordering::SeqCst)
    }

    /// Wait until [`Communicator::shutdown`] has deactivated every adapter.
    pub async fn wait_for_shutdown(&self) {
        wait_for(self.instance.shutdown_done.subscribe()).await;
    }

    /// Shut down, close outgoing connections, destroy adapters and stop
    /// the pools. Idempotent; concurrent callers all wait for completion.
    pub async fn destroy(&self) {
        if self.instance.destroyed.swap(true, Ordering::SeqCst) {
            wait_for(self.instance.destroy_done.subscribe()).await;
            return;
        }
        self.shutdown();
        self.wait_for_shutdown().await;

        self.instance.outgoing.destroy().await;
        let adapters = self.instance.adapters();
        join_all(adapters.iter().map(|adapter| adapter.destroy())).await;
        self.instance.adapters.lock().clear();
        self.instance.locator.write().take();
        self.instance.admin.clear();

        self.instance.client_pool.shutdown();
        self.instance.server_pool.shutdown();
        self.instance.destroy_done.send_replace(true);
        info!("communicator destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.instance.destroyed.load(Ordering::SeqCst)
    }

    // ---- admin ----

    pub fn add_admin_facet(&self, servant: Arc<dyn Servant>, facet: &str) -> Result<()> {
        self.instance.check_alive()?;
        self.instance.admin.add(servant, facet)
    }

    pub fn remove_admin_facet(&self, facet: &str) -> Result<Arc<dyn Servant>> {
        self.instance.check_alive()?;
        self.instance.admin.remove(facet)
    }

    pub fn find_admin_facet(&self, facet: &str) -> Option<Arc<dyn Servant>> {
        self.instance.admin.find(facet)
    }

    pub fn find_all_admin_facets(&self) -> BTreeMap<String, Arc<dyn Servant>> {
        self.instance.admin.find_all()
    }

    /// Serve the admin facets from `adapter` under `identity`. Without an
    /// adapter, the `Floe.Admin` adapter is created from
    /// `Floe.Admin.Endpoints` and activated.
    pub async fn create_admin(
        &self,
        adapter: Option<ObjectAdapter>,
        identity: Identity,
    ) -> Result<ObjectPrx> {
        self.instance.check_alive()?;
        let _creating = self.instance.admin.creating.lock().await;
        let adapter = match adapter {
            Some(adapter) => adapter,
            None => {
                let Some(endpoints) = self.instance.properties.get("Floe.Admin.Endpoints") else {
                    return Err(RpcError::InitializationFailed(
                        "Floe.Admin.Endpoints is not set".to_string(),
                    ));
                };
                let adapter = self
                    .create_object_adapter_with_endpoints(ADMIN_ADAPTER, endpoints)
                    .await?;
                adapter.activate()?;
                adapter
            }
        };
        self.instance.admin.install(&adapter, &identity)
    }

    /// The admin object, creating it on first use when
    /// `Floe.Admin.Endpoints` is set. `None` when admin is disabled.
    pub async fn get_admin(&self) -> Result<Option<ObjectPrx>> {
        self.instance.check_alive()?;
        if let Some((adapter, identity)) = self.instance.admin.admin() {
            return adapter.create_proxy(identity).map(Some);
        }
        if self.instance.properties.get("Floe.Admin.Endpoints").is_none() {
            return Ok(None);
        }
        let instance_name = self
            .instance
            .properties
            .get("Floe.Admin.InstanceName")
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        match self
            .create_admin(None, Identity::new(instance_name, "admin"))
            .await
        {
            Ok(proxy) => Ok(Some(proxy)),
            // lost a race with another caller
            Err(RpcError::AlreadyRegistered { .. }) => match self.instance.admin.admin() {
                Some((adapter, identity)) => adapter.create_proxy(identity).map(Some),
                None => Ok(None),
            },
            Err(e) => Err(e),
        }
    }
}

impl fmt::Debug for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communicator")
            .field("adapters", &self.instance.adapters.lock().len())
            .field("shutdown", &self.is_shutdown())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

async fn wait_for(mut done: watch::Receiver<bool>) {
    loop {
        if *done.borrow_and_update() {
            return;
        }
        if done.changed().await.is_err() {
            return;
        }
    }
}
