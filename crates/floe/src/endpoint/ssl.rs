//! SSL transport
//!
//! An ssl endpoint wraps a tcp endpoint. Structural queries go to the
//! inner endpoint; connectors and acceptors run a TLS handshake on top of
//! the inner transport.

use super::{
    Acceptor, Connector, Endpoint, EndpointDefaults, EndpointFactory, EndpointI,
    PendingTransceiver, TcpEndpoint, Transceiver, Transport,
};
use crate::error::{Result, RpcError};
use crate::properties::Properties;
use async_trait::async_trait;
use futures::FutureExt;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

/// Install the ring crypto provider once per process.
pub(crate) fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// TLS configuration shared by all ssl endpoints of a communicator
#[derive(Clone, Default)]
pub struct SslEngine {
    server: Option<Arc<ServerConfig>>,
    client: Option<Arc<ClientConfig>>,
}

impl fmt::Debug for SslEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SslEngine")
            .field("server", &self.server.is_some())
            .field("client", &self.client.is_some())
            .finish()
    }
}

impl SslEngine {
    pub fn new(server: Option<Arc<ServerConfig>>, client: Option<Arc<ClientConfig>>) -> Self {
        install_crypto_provider();
        Self { server, client }
    }

    /// Build from `Floe.SSL.CertFile`, `Floe.SSL.KeyFile` and `Floe.SSL.CAs`.
    pub fn from_properties(props: &Properties) -> Result<Self> {
        install_crypto_provider();
        let mut engine = Self::default();

        match (props.get("Floe.SSL.CertFile"), props.get("Floe.SSL.KeyFile")) {
            (Some(cert), Some(key)) => {
                let config = ServerConfig::builder()
                    .with_no_client_auth()
                    .with_single_cert(load_certs(cert)?, load_key(key)?)
                    .map_err(|e| RpcError::Security(format!("invalid server certificate: {}", e)))?;
                engine.server = Some(Arc::new(config));
            }
            (None, None) => {}
            _ => {
                return Err(RpcError::Security(
                    "Floe.SSL.CertFile and Floe.SSL.KeyFile must be set together".to_string(),
                ))
            }
        }

        if let Some(cas) = props.get("Floe.SSL.CAs") {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(cas)? {
                roots
                    .add(cert)
                    .map_err(|e| RpcError::Security(format!("invalid CA certificate: {}", e)))?;
            }
            let config = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            engine.client = Some(Arc::new(config));
        }

        Ok(engine)
    }

    pub fn with_server_config(mut self, config: Arc<ServerConfig>) -> Self {
        self.server = Some(config);
        self
    }

    pub fn with_client_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.client = Some(config);
        self
    }

    fn server_config(&self) -> Result<Arc<ServerConfig>> {
        self.server
            .clone()
            .ok_or_else(|| RpcError::Security("no server certificate configured".to_string()))
    }

    fn client_config(&self) -> Result<Arc<ClientConfig>> {
        self.client
            .clone()
            .ok_or_else(|| RpcError::Security("no trusted CAs configured".to_string()))
    }
}

fn load_certs(path: impl AsRef<Path>) -> Result<Vec<CertificateDer<'static>>> {
    let path = path.as_ref();
    let file = File::open(path)
        .map_err(|e| RpcError::Security(format!("cannot open `{}`: {}", path.display(), e)))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| RpcError::Security(format!("cannot read `{}`: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(RpcError::Security(format!(
            "no certificates in `{}`",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: impl AsRef<Path>) -> Result<PrivateKeyDer<'static>> {
    let path = path.as_ref();
    let file = File::open(path)
        .map_err(|e| RpcError::Security(format!("cannot open `{}`: {}", path.display(), e)))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| RpcError::Security(format!("cannot read `{}`: {}", path.display(), e)))?
        .ok_or_else(|| RpcError::Security(format!("no private key in `{}`", path.display())))
}

#[derive(Debug, Clone)]
pub struct SslEndpoint {
    inner: Endpoint,
    engine: Arc<SslEngine>,
}

impl SslEndpoint {
    pub fn new(inner: Endpoint, engine: Arc<SslEngine>) -> Self {
        Self { inner, engine }
    }

    fn wrap(&self, inner: Endpoint) -> Endpoint {
        Endpoint::new(Self {
            inner,
            engine: self.engine.clone(),
        })
    }

    fn server_name(&self) -> String {
        match self.inner.host() {
            "" | "*" => "localhost".to_string(),
            host => host.to_string(),
        }
    }
}

#[async_trait]
impl EndpointI for SslEndpoint {
    fn transport(&self) -> &str {
        "ssl"
    }

    fn host(&self) -> &str {
        self.inner.host()
    }

    fn port(&self) -> u16 {
        self.inner.port()
    }

    fn timeout(&self) -> Option<Duration> {
        self.inner.timeout()
    }

    fn compress(&self) -> bool {
        self.inner.compress()
    }

    fn is_secure(&self) -> bool {
        true
    }

    fn options(&self) -> String {
        self.inner.options()
    }

    fn with_timeout(&self, timeout: Option<Duration>) -> Endpoint {
        self.wrap(self.inner.with_timeout(timeout))
    }

    fn with_compress(&self, compress: bool) -> Endpoint {
        self.wrap(self.inner.with_compress(compress))
    }

    fn with_address(&self, host: &str, port: u16) -> Endpoint {
        self.wrap(self.inner.with_address(host, port))
    }

    async fn connectors(&self) -> Result<Vec<Box<dyn Connector>>> {
        let server_name = self.server_name();
        Ok(self
            .inner
            .connectors()
            .await?
            .into_iter()
            .map(|inner| {
                Box::new(SslConnector {
                    inner,
                    engine: self.engine.clone(),
                    server_name: server_name.clone(),
                }) as Box<dyn Connector>
            })
            .collect())
    }

    async fn acceptor(&self) -> Result<Box<dyn Acceptor>> {
        let acceptor = TlsAcceptor::from(self.engine.server_config()?);
        let inner = self.inner.acceptor().await?;
        let endpoint = self.wrap(inner.endpoint());
        Ok(Box::new(SslAcceptor {
            inner,
            acceptor,
            endpoint,
        }))
    }
}

struct SslConnector {
    inner: Box<dyn Connector>,
    engine: Arc<SslEngine>,
    server_name: String,
}

impl fmt::Debug for SslConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SslConnector({:?}, {})", self.inner, self.server_name)
    }
}

#[async_trait]
impl Connector for SslConnector {
    async fn connect(&self) -> Result<Transceiver> {
        let config = self.engine.client_config()?;
        let name = ServerName::try_from(self.server_name.clone()).map_err(|e| {
            RpcError::Security(format!("invalid server name `{}`: {}", self.server_name, e))
        })?;

        let transceiver = self.inner.connect().await?;
        let Transport::Stream(stream) = transceiver.transport else {
            return Err(RpcError::Security("ssl requires a stream transport".to_string()));
        };
        let tls = TlsConnector::from(config)
            .connect(name, stream)
            .await
            .map_err(|e| {
                RpcError::connect_failed(
                    format!("ssl {}", self.server_name),
                    format!("TLS handshake failed: {}", e),
                )
            })?;
        debug!(target: "floe::network", "TLS established with {}", self.server_name);

        let mut info = transceiver.info;
        info.transport = "ssl".to_string();
        info.secure = true;
        Ok(Transceiver {
            transport: Transport::Stream(Box::new(tls)),
            info,
        })
    }
}

struct SslAcceptor {
    inner: Box<dyn Acceptor>,
    acceptor: TlsAcceptor,
    endpoint: Endpoint,
}

#[async_trait]
impl Acceptor for SslAcceptor {
    fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    async fn accept(&mut self) -> Result<PendingTransceiver> {
        let pending = self.inner.accept().await?;
        let acceptor = self.acceptor.clone();
        Ok(async move {
            let transceiver = pending.await?;
            let Transport::Stream(stream) = transceiver.transport else {
                return Err(RpcError::Security("ssl requires a stream transport".to_string()));
            };
            let tls = acceptor
                .accept(stream)
                .await
                .map_err(|e| RpcError::ConnectionLost(format!("TLS handshake failed: {}", e)))?;
            let mut info = transceiver.info;
            info.transport = "ssl".to_string();
            info.secure = true;
            Ok(Transceiver {
                transport: Transport::Stream(Box::new(tls)),
                info,
            })
        }
        .boxed())
    }
}

/// Factory for `ssl` endpoints; parses the tcp grammar.
pub struct SslEndpointFactory {
    engine: Arc<SslEngine>,
}

impl SslEndpointFactory {
    pub fn new(engine: Arc<SslEngine>) -> Self {
        Self { engine }
    }
}

impl EndpointFactory for SslEndpointFactory {
    fn transport(&self) -> &str {
        "ssl"
    }

    fn parse(&self, input: &str, args: &[String], defaults: &EndpointDefaults) -> Result<Endpoint> {
        let tcp = TcpEndpoint::parse(input, args, defaults)?;
        Ok(Endpoint::new(SslEndpoint::new(
            Endpoint::new(tcp),
            self.engine.clone(),
        )))
    }
}
