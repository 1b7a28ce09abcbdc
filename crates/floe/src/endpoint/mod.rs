//! Endpoints and transports
//!
//! An [`Endpoint`] describes one reachable address for one transport. It
//! produces [`Connector`]s for outgoing connections and an [`Acceptor`]
//! for incoming ones. Each transport registers an [`EndpointFactory`]
//! that parses its option grammar:
//!
//! ```text
//! tcp -h <host> -p <port> [-t <ms>|infinite] [-z]
//! udp -h <host> -p <port> [-z]
//! ssl -h <host> -p <port> [-t <ms>|infinite] [-z]
//! ```
//!
//! Endpoints compare by their canonical string, so cosmetic differences
//! (option order, `-p 04061`, an omitted `-t`) do not matter while
//! anything that changes wire behavior does.

mod ssl;
mod tcp;
mod udp;

pub use ssl::{SslEndpoint, SslEndpointFactory, SslEngine};
pub use tcp::{TcpEndpoint, TcpEndpointFactory};
pub use udp::{UdpEndpoint, UdpEndpointFactory};

use crate::error::{Result, RpcError};
use crate::strings::{quote, split_args};
use async_trait::async_trait;
use floe_proto::{
    datagram_transport, FrameReader, FrameTransport, FrameWriter, ProtocolVersion, PROTOCOL_1_0,
};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UdpSocket;

/// Transport-specific endpoint behavior
#[async_trait]
pub trait EndpointI: fmt::Debug + Send + Sync + 'static {
    /// Transport keyword, e.g. `tcp`
    fn transport(&self) -> &str;

    fn host(&self) -> &str;

    fn port(&self) -> u16;

    /// `None` is infinite
    fn timeout(&self) -> Option<Duration>;

    fn compress(&self) -> bool;

    fn protocol(&self) -> ProtocolVersion {
        PROTOCOL_1_0
    }

    fn is_secure(&self) -> bool {
        false
    }

    fn is_datagram(&self) -> bool {
        false
    }

    /// Canonical option string, without the transport keyword
    fn options(&self) -> String;

    fn with_timeout(&self, timeout: Option<Duration>) -> Endpoint;

    fn with_compress(&self, compress: bool) -> Endpoint;

    /// Same endpoint on another address; used to publish the port an
    /// acceptor actually bound.
    fn with_address(&self, host: &str, port: u16) -> Endpoint;

    /// One connector per resolved address
    async fn connectors(&self) -> Result<Vec<Box<dyn Connector>>>;

    /// Bind a local acceptor
    async fn acceptor(&self) -> Result<Box<dyn Acceptor>>;
}

/// Opens one outgoing transport session
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    async fn connect(&self) -> Result<Transceiver>;
}

/// Finishes transport setup (e.g. a TLS handshake) off the accept loop
pub type PendingTransceiver = BoxFuture<'static, Result<Transceiver>>;

/// Yields incoming transport sessions
#[async_trait]
pub trait Acceptor: Send {
    /// The bound endpoint, with the actual port
    fn endpoint(&self) -> Endpoint;

    async fn accept(&mut self) -> Result<PendingTransceiver>;
}

/// Byte stream usable as a connection transport
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> AsyncStream for T {}

/// Raw transport session
pub enum Transport {
    Stream(Box<dyn AsyncStream>),
    Datagram {
        socket: Arc<UdpSocket>,
        peer: Option<SocketAddr>,
    },
}

/// Description of an established transport session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub transport: String,
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
    pub secure: bool,
    pub datagram: bool,
    pub incoming: bool,
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let addr = |a: Option<SocketAddr>| a.map_or_else(|| "-".to_string(), |a| a.to_string());
        write!(
            f,
            "{} {} {} {}",
            self.transport,
            addr(self.local),
            if self.incoming { "<-" } else { "->" },
            addr(self.remote)
        )
    }
}

/// A transport session plus its description
pub struct Transceiver {
    pub transport: Transport,
    pub info: ConnectionInfo,
}

impl Transceiver {
    /// Split into framed halves
    pub(crate) fn into_frames(
        self,
        message_size_max: usize,
    ) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>) {
        match self.transport {
            Transport::Stream(stream) => {
                let (r, w) = tokio::io::split(stream);
                (
                    Box::new(FrameTransport::new(r).with_max_message_size(message_size_max)),
                    Box::new(FrameTransport::new(w).with_max_message_size(message_size_max)),
                )
            }
            Transport::Datagram { socket, peer } => {
                let (r, w) = datagram_transport(socket, peer, message_size_max);
                (Box::new(r), Box::new(w))
            }
        }
    }
}

/// Shared handle to an endpoint, compared by its canonical string
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<dyn EndpointI>,
    canonical: Arc<str>,
}

impl Endpoint {
    pub fn new<E: EndpointI>(endpoint: E) -> Self {
        Self::from_arc(Arc::new(endpoint))
    }

    pub fn from_arc(inner: Arc<dyn EndpointI>) -> Self {
        let options = inner.options();
        let canonical = if options.is_empty() {
            inner.transport().to_string()
        } else {
            format!("{} {}", inner.transport(), options)
        };
        Self {
            inner,
            canonical: canonical.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.canonical
    }
}

impl Deref for Endpoint {
    type Target = dyn EndpointI;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for Endpoint {}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl PartialOrd for Endpoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Endpoint {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical.cmp(&other.canonical)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Endpoint({})", self.canonical)
    }
}

/// Values used when an endpoint string omits an option
#[derive(Debug, Clone)]
pub struct EndpointDefaults {
    pub host: String,
    pub timeout: Option<Duration>,
}

impl Default for EndpointDefaults {
    fn default() -> Self {
        Self {
            host: String::new(),
            timeout: Some(Duration::from_millis(crate::config::DEFAULT_TIMEOUT_MS as u64)),
        }
    }
}

/// Parses endpoint strings of one transport
pub trait EndpointFactory: Send + Sync {
    fn transport(&self) -> &str;

    /// `args` are the tokens after the transport keyword; `input` is the
    /// whole endpoint string, for error messages.
    fn parse(&self, input: &str, args: &[String], defaults: &EndpointDefaults) -> Result<Endpoint>;
}

/// Registry of endpoint factories by transport keyword
pub struct EndpointFactoryRegistry {
    factories: RwLock<Vec<Arc<dyn EndpointFactory>>>,
    default_protocol: String,
    defaults: EndpointDefaults,
}

impl EndpointFactoryRegistry {
    pub fn new(default_protocol: impl Into<String>, defaults: EndpointDefaults) -> Self {
        Self {
            factories: RwLock::new(Vec::new()),
            default_protocol: default_protocol.into(),
            defaults,
        }
    }

    /// Registry with tcp, udp and ssl
    pub fn with_builtin(
        default_protocol: impl Into<String>,
        defaults: EndpointDefaults,
        ssl: Arc<SslEngine>,
    ) -> Self {
        let registry = Self::new(default_protocol, defaults);
        registry.add(Arc::new(TcpEndpointFactory));
        registry.add(Arc::new(UdpEndpointFactory));
        registry.add(Arc::new(SslEndpointFactory::new(ssl)));
        registry
    }

    /// Register a factory, replacing one for the same transport.
    pub fn add(&self, factory: Arc<dyn EndpointFactory>) {
        let mut factories = self.factories.write();
        factories.retain(|f| f.transport() != factory.transport());
        factories.push(factory);
    }

    pub fn get(&self, transport: &str) -> Option<Arc<dyn EndpointFactory>> {
        self.factories
            .read()
            .iter()
            .find(|f| f.transport() == transport)
            .cloned()
    }

    pub fn defaults(&self) -> &EndpointDefaults {
        &self.defaults
    }

    /// Parse one endpoint string, e.g. `tcp -h localhost -p 4061`.
    pub fn parse(&self, input: &str) -> Result<Endpoint> {
        let args = split_args(input).map_err(|e| RpcError::invalid_endpoint(input, e))?;
        let Some((transport, rest)) = args.split_first() else {
            return Err(RpcError::invalid_endpoint(input, "empty endpoint"));
        };
        let transport = if transport == "default" {
            self.default_protocol.as_str()
        } else {
            transport.as_str()
        };
        let factory = self
            .get(transport)
            .ok_or_else(|| RpcError::invalid_endpoint(input, format!("unknown transport `{}`", transport)))?;
        factory.parse(input, rest, &self.defaults)
    }

    /// Parse a `:`-separated endpoint list.
    pub fn parse_list(&self, input: &str) -> Result<Vec<Endpoint>> {
        let mut endpoints = Vec::new();
        let mut start = 0;
        loop {
            let end = crate::strings::find_unquoted(input, start, &[':']).unwrap_or(input.len());
            let part = input[start..end].trim();
            if part.is_empty() {
                return Err(RpcError::invalid_endpoint(input, "empty endpoint in list"));
            }
            endpoints.push(self.parse(part)?);
            if end == input.len() {
                return Ok(endpoints);
            }
            start = end + 1;
        }
    }
}

/// Options shared by the IP transports
#[derive(Debug, Default)]
pub(crate) struct IpOptions {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// `Some(None)` is an explicit `-t infinite`
    pub timeout: Option<Option<Duration>>,
    pub compress: bool,
}

impl IpOptions {
    pub(crate) fn parse(input: &str, args: &[String], allow_timeout: bool) -> Result<Self> {
        let mut opts = IpOptions::default();
        let mut iter = args.iter();
        while let Some(option) = iter.next() {
            let mut value = |name: &str| {
                iter.next()
                    .cloned()
                    .ok_or_else(|| RpcError::invalid_endpoint(input, format!("no argument for {}", name)))
            };
            match option.as_str() {
                "-t" if !allow_timeout => {
                    return Err(RpcError::invalid_endpoint(input, "-t is not supported"))
                }
                "-h" if opts.host.is_none() => opts.host = Some(value("-h")?),
                "-p" if opts.port.is_none() => {
                    let raw = value("-p")?;
                    let port = raw.parse::<u16>().map_err(|_| {
                        RpcError::invalid_endpoint(input, format!("invalid port `{}`", raw))
                    })?;
                    opts.port = Some(port);
                }
                "-t" if opts.timeout.is_none() => {
                    let raw = value("-t")?;
                    let timeout = match raw.as_str() {
                        "infinite" => None,
                        _ => match raw.parse::<i64>() {
                            Ok(ms) if ms > 0 => Some(Duration::from_millis(ms as u64)),
                            Ok(-1) => None,
                            _ => {
                                return Err(RpcError::invalid_endpoint(
                                    input,
                                    format!("invalid timeout `{}`", raw),
                                ))
                            }
                        },
                    };
                    opts.timeout = Some(timeout);
                }
                "-z" if !opts.compress => opts.compress = true,
                "-h" | "-p" | "-t" | "-z" => {
                    return Err(RpcError::invalid_endpoint(
                        input,
                        format!("duplicate option {}", option),
                    ))
                }
                other => {
                    return Err(RpcError::invalid_endpoint(
                        input,
                        format!("unknown option `{}`", other),
                    ))
                }
            }
        }
        Ok(opts)
    }
}

/// Canonical `-h .. -p .. [-t ..] [-z]` string
pub(crate) fn ip_options(
    host: &str,
    port: u16,
    timeout: Option<Option<Duration>>,
    compress: bool,
) -> String {
    let mut s = String::new();
    if !host.is_empty() {
        s.push_str("-h ");
        s.push_str(&quote(host));
        s.push(' ');
    }
    s.push_str(&format!("-p {}", port));
    if let Some(timeout) = timeout {
        match timeout {
            Some(t) => s.push_str(&format!(" -t {}", t.as_millis())),
            None => s.push_str(" -t infinite"),
        }
    }
    if compress {
        s.push_str(" -z");
    }
    s
}

/// Resolve `host:port`; an empty host means loopback for connecting.
pub(crate) async fn resolve(endpoint: &str, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let host = if host.is_empty() || host == "*" {
        "127.0.0.1"
    } else {
        host
    };
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| RpcError::connect_failed(endpoint, format!("cannot resolve `{}`: {}", host, e)))?
        .collect();
    if addrs.is_empty() {
        return Err(RpcError::connect_failed(
            endpoint,
            format!("`{}` resolved to no addresses", host),
        ));
    }
    let mut unique = Vec::with_capacity(addrs.len());
    for addr in addrs {
        if !unique.contains(&addr) {
            unique.push(addr);
        }
    }
    Ok(unique)
}

/// Address to bind for a server endpoint; an empty host binds all interfaces.
pub(crate) async fn bind_address(endpoint: &str, host: &str, port: u16) -> Result<SocketAddr> {
    if host.is_empty() || host == "*" || host == "0.0.0.0" {
        return Ok(SocketAddr::from(([0, 0, 0, 0], port)));
    }
    let addrs = resolve(endpoint, host, port).await?;
    // prefer IPv4 so `localhost` binds where clients connect first
    Ok(addrs
        .iter()
        .find(|a| a.is_ipv4())
        .copied()
        .unwrap_or(addrs[0]))
}
