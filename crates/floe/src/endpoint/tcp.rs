//! TCP transport

use super::{
    bind_address, ip_options, resolve, Acceptor, ConnectionInfo, Connector, Endpoint,
    EndpointDefaults, EndpointFactory, EndpointI, IpOptions, PendingTransceiver, Transceiver,
    Transport,
};
use crate::error::{Result, RpcError};
use async_trait::async_trait;
use futures::FutureExt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpEndpoint {
    host: String,
    port: u16,
    timeout: Option<Duration>,
    compress: bool,
}

impl TcpEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: EndpointDefaults::default().timeout,
            compress: false,
        }
    }

    pub(crate) fn parse(input: &str, args: &[String], defaults: &EndpointDefaults) -> Result<Self> {
        let opts = IpOptions::parse(input, args, true)?;
        Ok(Self {
            host: opts.host.unwrap_or_else(|| defaults.host.clone()),
            port: opts.port.unwrap_or(0),
            timeout: opts.timeout.unwrap_or(defaults.timeout),
            compress: opts.compress,
        })
    }
}

#[async_trait]
impl EndpointI for TcpEndpoint {
    fn transport(&self) -> &str {
        "tcp"
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn compress(&self) -> bool {
        self.compress
    }

    fn options(&self) -> String {
        ip_options(&self.host, self.port, Some(self.timeout), self.compress)
    }

    fn with_timeout(&self, timeout: Option<Duration>) -> Endpoint {
        Endpoint::new(Self {
            timeout,
            ..self.clone()
        })
    }

    fn with_compress(&self, compress: bool) -> Endpoint {
        Endpoint::new(Self {
            compress,
            ..self.clone()
        })
    }

    fn with_address(&self, host: &str, port: u16) -> Endpoint {
        Endpoint::new(Self {
            host: host.to_string(),
            port,
            ..self.clone()
        })
    }

    async fn connectors(&self) -> Result<Vec<Box<dyn Connector>>> {
        let description = format!("tcp {}", self.options());
        let addrs = resolve(&description, &self.host, self.port).await?;
        Ok(addrs
            .into_iter()
            .map(|addr| Box::new(TcpConnector { addr }) as Box<dyn Connector>)
            .collect())
    }

    async fn acceptor(&self) -> Result<Box<dyn Acceptor>> {
        let description = format!("tcp {}", self.options());
        let addr = bind_address(&description, &self.host, self.port).await?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RpcError::InitializationFailed(format!("cannot bind {}: {}", addr, e)))?;
        let local = listener
            .local_addr()
            .map_err(|e| RpcError::InitializationFailed(e.to_string()))?;
        debug!(target: "floe::network", "tcp acceptor bound to {}", local);
        Ok(Box::new(TcpAcceptor {
            listener,
            endpoint: self.with_address(&self.host, local.port()),
        }))
    }
}

/// Connects to one resolved address
#[derive(Debug)]
pub(crate) struct TcpConnector {
    addr: SocketAddr,
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Transceiver> {
        let stream = TcpStream::connect(self.addr)
            .await
            .map_err(|e| RpcError::connect_failed(format!("tcp {}", self.addr), e))?;
        Ok(stream_transceiver(stream, false, "tcp"))
    }
}

pub(crate) fn stream_transceiver(stream: TcpStream, incoming: bool, transport: &str) -> Transceiver {
    let _ = stream.set_nodelay(true);
    let info = ConnectionInfo {
        transport: transport.to_string(),
        local: stream.local_addr().ok(),
        remote: stream.peer_addr().ok(),
        secure: false,
        datagram: false,
        incoming,
    };
    Transceiver {
        transport: Transport::Stream(Box::new(stream)),
        info,
    }
}

pub(crate) struct TcpAcceptor {
    listener: TcpListener,
    endpoint: Endpoint,
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    async fn accept(&mut self) -> Result<PendingTransceiver> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| RpcError::ConnectionLost(format!("accept failed: {}", e)))?;
        debug!(target: "floe::network", "accepted tcp connection from {}", peer);
        let transceiver = stream_transceiver(stream, true, "tcp");
        Ok(async move { Ok(transceiver) }.boxed())
    }
}

/// Factory for `tcp` endpoints
pub struct TcpEndpointFactory;

impl EndpointFactory for TcpEndpointFactory {
    fn transport(&self) -> &str {
        "tcp"
    }

    fn parse(&self, input: &str, args: &[String], defaults: &EndpointDefaults) -> Result<Endpoint> {
        Ok(Endpoint::new(TcpEndpoint::parse(input, args, defaults)?))
    }
}
