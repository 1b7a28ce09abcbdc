//! Outgoing connection reuse
//!
//! At most one connection attempt per endpoint is in flight; concurrent
//! invocations to the same endpoint wait for it and share the result.

use super::{CloseMode, Connection};
use crate::communicator::Instance;
use crate::endpoint::Endpoint;
use crate::error::{Result, RpcError, TimeoutKind};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Every candidate endpoint failed
#[derive(Debug)]
pub(crate) struct ConnectError {
    pub(crate) error: RpcError,
    /// Endpoints that failed, in the order they were tried
    pub(crate) failed: Vec<Endpoint>,
}

#[derive(Default)]
pub(crate) struct OutgoingConnectionFactory {
    connections: Mutex<HashMap<Endpoint, Vec<Connection>>>,
    connecting: Mutex<HashMap<Endpoint, Arc<tokio::sync::Mutex<()>>>>,
    destroyed: AtomicBool,
}

impl OutgoingConnectionFactory {
    /// An active connection to the first reachable endpoint, reusing an
    /// existing one when possible.
    pub(crate) async fn get_connection(
        &self,
        instance: &Arc<Instance>,
        endpoints: &[Endpoint],
    ) -> std::result::Result<Connection, ConnectError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(ConnectError {
                error: RpcError::CommunicatorDestroyed,
                failed: Vec::new(),
            });
        }
        if let Some(connection) = self.find(endpoints) {
            return Ok(connection);
        }

        let mut failed = Vec::new();
        let mut last_error = None;
        for endpoint in endpoints {
            match self.connect(instance, endpoint).await {
                Ok(connection) => return Ok(connection),
                Err(RpcError::CommunicatorDestroyed) => {
                    return Err(ConnectError {
                        error: RpcError::CommunicatorDestroyed,
                        failed,
                    })
                }
                Err(e) => {
                    debug!(target: "floe::network", "connection to {} failed: {}", endpoint, e);
                    failed.push(endpoint.clone());
                    last_error = Some(e);
                }
            }
        }
        Err(ConnectError {
            error: last_error
                .unwrap_or_else(|| RpcError::NoEndpoint("endpoint list is empty".to_string())),
            failed,
        })
    }

    fn find(&self, endpoints: &[Endpoint]) -> Option<Connection> {
        let connections = self.connections.lock();
        endpoints.iter().find_map(|endpoint| {
            connections
                .get(endpoint)?
                .iter()
                .find(|c| c.is_active())
                .cloned()
        })
    }

    async fn connect(&self, instance: &Arc<Instance>, endpoint: &Endpoint) -> Result<Connection> {
        let attempt = self
            .connecting
            .lock()
            .entry(endpoint.clone())
            .or_default()
            .clone();
        let result = {
            let _attempt = attempt.lock().await;
            self.connect_once(instance, endpoint).await
        };
        self.release_attempt(endpoint, attempt);
        result
    }

    /// Drop the endpoint's attempt lock unless another caller is waiting on it.
    fn release_attempt(&self, endpoint: &Endpoint, attempt: Arc<tokio::sync::Mutex<()>>) {
        let mut connecting = self.connecting.lock();
        if let Some(current) = connecting.get(endpoint) {
            // one reference in the map, one here
            if Arc::ptr_eq(current, &attempt) && Arc::strong_count(&attempt) == 2 {
                connecting.remove(endpoint);
            }
        }
    }

    async fn connect_once(&self, instance: &Arc<Instance>, endpoint: &Endpoint) -> Result<Connection> {
        if let Some(connection) = self.find(std::slice::from_ref(endpoint)) {
            return Ok(connection);
        }
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(RpcError::CommunicatorDestroyed);
        }

        let configured = instance.config().connection.connect_timeout;
        let connect_timeout = endpoint
            .timeout()
            .map_or(configured, |timeout| timeout.min(configured));
        let connection =
            match tokio::time::timeout(connect_timeout, establish(instance, endpoint)).await {
                Ok(result) => result?,
                Err(_) => return Err(RpcError::Timeout(TimeoutKind::Connect)),
            };

        let registered = {
            let mut connections = self.connections.lock();
            if self.destroyed.load(Ordering::SeqCst) {
                false
            } else {
                let list = connections.entry(endpoint.clone()).or_default();
                list.retain(|c| !c.is_closed());
                list.push(connection.clone());
                true
            }
        };
        if !registered {
            connection.close(CloseMode::Forcefully).await;
            return Err(RpcError::CommunicatorDestroyed);
        }
        Ok(connection)
    }

    /// Forget a closed connection.
    pub(crate) fn remove(&self, connection: &Connection) {
        let mut connections = self.connections.lock();
        if let Some(list) = connections.get_mut(connection.endpoint()) {
            list.retain(|c| c != connection);
            if list.is_empty() {
                connections.remove(connection.endpoint());
            }
        }
    }

    /// Live outgoing connections
    pub(crate) fn connections(&self) -> Vec<Connection> {
        self.connections
            .lock()
            .values()
            .flatten()
            .filter(|c| !c.is_closed())
            .cloned()
            .collect()
    }

    /// Refuse further connections and close the existing ones gracefully.
    pub(crate) async fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        let connections: Vec<Connection> = {
            let mut map = self.connections.lock();
            map.drain().flat_map(|(_, list)| list).collect()
        };
        self.connecting.lock().clear();
        join_all(connections.iter().map(|c| c.close(CloseMode::Gracefully))).await;
    }
}

async fn establish(instance: &Arc<Instance>, endpoint: &Endpoint) -> Result<Connection> {
    let mut last_error = None;
    for connector in endpoint.connectors().await? {
        match connector.connect().await {
            Ok(transceiver) => {
                return Connection::connect_outgoing(instance, endpoint.clone(), transceiver).await
            }
            Err(e) => {
                debug!(target: "floe::network", "{:?}: {}", connector, e);
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| RpcError::connect_failed(endpoint, "no address to connect to")))
}
