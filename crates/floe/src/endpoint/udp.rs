//! UDP transport
//!
//! Datagram endpoints carry oneway and batch requests only. The server
//! side is a single receive-only session per bound socket.

use super::{
    bind_address, ip_options, resolve, Acceptor, ConnectionInfo, Connector, Endpoint,
    EndpointDefaults, EndpointFactory, EndpointI, IpOptions, PendingTransceiver, Transceiver,
    Transport,
};
use crate::error::{Result, RpcError};
use async_trait::async_trait;
use futures::FutureExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpEndpoint {
    host: String,
    port: u16,
    compress: bool,
}

impl UdpEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            compress: false,
        }
    }
}

#[async_trait]
impl EndpointI for UdpEndpoint {
    fn transport(&self) -> &str {
        "udp"
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn timeout(&self) -> Option<Duration> {
        None
    }

    fn compress(&self) -> bool {
        self.compress
    }

    fn is_datagram(&self) -> bool {
        true
    }

    fn options(&self) -> String {
        ip_options(&self.host, self.port, None, self.compress)
    }

    fn with_timeout(&self, _timeout: Option<Duration>) -> Endpoint {
        Endpoint::new(self.clone())
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
        let description = format!("udp {}", self.options());
        let addrs = resolve(&description, &self.host, self.port).await?;
        Ok(addrs
            .into_iter()
            .map(|addr| Box::new(UdpConnector { addr }) as Box<dyn Connector>)
            .collect())
    }

    async fn acceptor(&self) -> Result<Box<dyn Acceptor>> {
        let description = format!("udp {}", self.options());
        let addr = bind_address(&description, &self.host, self.port).await?;
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| RpcError::InitializationFailed(format!("cannot bind {}: {}", addr, e)))?;
        let local = socket
            .local_addr()
            .map_err(|e| RpcError::InitializationFailed(e.to_string()))?;
        debug!(target: "floe::network", "udp acceptor bound to {}", local);
        Ok(Box::new(UdpAcceptor {
            socket: Some(Arc::new(socket)),
            local,
            endpoint: self.with_address(&self.host, local.port()),
        }))
    }
}

#[derive(Debug)]
pub(crate) struct UdpConnector {
    addr: SocketAddr,
}

#[async_trait]
impl Connector for UdpConnector {
    async fn connect(&self) -> Result<Transceiver> {
        let any: SocketAddr = if self.addr.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let fail = |e: std::io::Error| RpcError::connect_failed(format!("udp {}", self.addr), e);
        let socket = UdpSocket::bind(any).await.map_err(fail)?;
        socket.connect(self.addr).await.map_err(fail)?;
        Ok(Transceiver {
            info: ConnectionInfo {
                transport: "udp".to_string(),
                local: socket.local_addr().ok(),
                remote: Some(self.addr),
                secure: false,
                datagram: true,
                incoming: false,
            },
            transport: Transport::Datagram {
                socket: Arc::new(socket),
                peer: None,
            },
        })
    }
}

/// Hands out its socket once; later accepts never complete.
pub(crate) struct UdpAcceptor {
    socket: Option<Arc<UdpSocket>>,
    local: SocketAddr,
    endpoint: Endpoint,
}

#[async_trait]
impl Acceptor for UdpAcceptor {
    fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    async fn accept(&mut self) -> Result<PendingTransceiver> {
        let Some(socket) = self.socket.take() else {
            return std::future::pending().await;
        };
        let transceiver = Transceiver {
            info: ConnectionInfo {
                transport: "udp".to_string(),
                local: Some(self.local),
                remote: None,
                secure: false,
                datagram: true,
                incoming: true,
            },
            transport: Transport::Datagram { socket, peer: None },
        };
        Ok(async move { Ok(transceiver) }.boxed())
    }
}

/// Factory for `udp` endpoints
pub struct UdpEndpointFactory;

impl EndpointFactory for UdpEndpointFactory {
    fn transport(&self) -> &str {
        "udp"
    }

    fn parse(&self, input: &str, args: &[String], defaults: &EndpointDefaults) -> Result<Endpoint> {
        let opts = IpOptions::parse(input, args, false)?;
        Ok(Endpoint::new(UdpEndpoint {
            host: opts.host.unwrap_or_else(|| defaults.host.clone()),
            port: opts.port.unwrap_or(0),
            compress: opts.compress,
        }))
    }
}
