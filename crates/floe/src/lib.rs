//! Object-oriented RPC runtime
//!
//! A client holds an [`ObjectPrx`] (a proxy) naming a remote object by
//! [`Identity`], optional facet and either endpoints or an adapter id. A
//! server creates an [`ObjectAdapter`], registers [`Servant`]s under
//! identities and activates the adapter to accept connections. The
//! [`Communicator`] ties everything together: configuration, endpoint
//! factories, the outgoing connection cache, the locator and the admin
//! facets.
//!
//! # Features
//!
//! - TCP, UDP (oneway/datagram) and TLS transports, pluggable through
//!   [`EndpointFactory`]
//! - twoway, oneway, datagram and batched invocations with retries,
//!   deadlines and cancellation
//! - servant maps, facets, default servants and [`ServantLocator`]s
//! - collocated dispatch that skips the network but keeps its semantics
//! - indirect proxies resolved through a [`Locator`] with a TTL cache
//! - bidirectional connections and graceful shutdown with draining
//! - the `Properties` admin facet
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use floe::{Communicator, Identity, OperationMode, ServantBuilder};
//!
//! #[tokio::main]
//! async fn main() -> floe::Result<()> {
//!     let communicator = Communicator::new()?;
//!
//!     let adapter = communicator
//!         .create_object_adapter_with_endpoints("Echo", "tcp -h localhost -p 4061")
//!         .await?;
//!     let echo = ServantBuilder::new()
//!         .type_id("::Demo::Echo")
//!         .operation("echo", |_current, params: Bytes| async move { Ok(params) })
//!         .build();
//!     adapter.add(echo, Identity::named("test"))?;
//!     adapter.activate()?;
//!
//!     let proxy = communicator.string_to_proxy("test:tcp -h localhost -p 4061")?;
//!     let reply = proxy
//!         .invoke("echo", OperationMode::Normal, Bytes::from_static(b"hello"))
//!         .await?;
//!     assert_eq!(reply.as_ref(), b"hello");
//!
//!     communicator.destroy().await;
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod admin;
pub mod communicator;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
mod invocation;
pub mod locator;
pub mod properties;
pub mod proxy;
pub mod reference;
pub mod servant;
pub mod servant_locator;
mod strings;
mod thread_pool;

pub use adapter::{AdapterState, DispatchStats, DispatchStatsSnapshot, ObjectAdapter};
pub use admin::{PROPERTIES_ADMIN_TYPE_ID, PROPERTIES_FACET};
pub use communicator::{Communicator, InitializationData, ADMIN_ADAPTER};
pub use config::{
    AdapterConfig, CommunicatorConfig, ConnectionOptions, EndpointSelection, DEFAULT_TIMEOUT_MS,
};
pub use connection::{CloseMode, Connection, ConnectionState};
pub use endpoint::{
    Acceptor, ConnectionInfo, Connector, Endpoint, EndpointDefaults, EndpointFactory,
    EndpointFactoryRegistry, EndpointI, SslEndpoint, SslEndpointFactory, SslEngine, TcpEndpoint,
    TcpEndpointFactory, Transceiver, Transport, UdpEndpoint, UdpEndpointFactory,
};
pub use error::{Result, RpcError, TimeoutKind};
pub use locator::Locator;
pub use properties::Properties;
pub use proxy::{InvocationOptions, ObjectPrx};
pub use reference::{InvocationMode, Reference};
pub use servant::{Current, OperationServant, Servant, ServantBuilder, OBJECT_TYPE_ID};
pub use servant_locator::{Cookie, Located, ServantLocator};

pub use floe_proto::{
    Context, EncodingVersion, Identity, OperationMode, ProtocolVersion, ENCODING_1_0, ENCODING_1_1,
};
