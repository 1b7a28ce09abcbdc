//! Locator client
//!
//! Indirect references carry an adapter id (`obj @ adapter`) or nothing
//! at all (well-known objects). Both are turned into endpoints by the
//! communicator's [`Locator`]. Answers are cached for
//! `Floe.Default.LocatorCacheTimeout`.

use crate::endpoint::Endpoint;
use crate::error::{Result, RpcError};
use crate::proxy::ObjectPrx;
use crate::reference::Reference;
use async_trait::async_trait;
use floe_proto::Identity;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::trace;

/// Resolves adapter ids and well-known identities
#[async_trait]
pub trait Locator: Send + Sync + 'static {
    /// A proxy for the object, or `None` when it is unknown.
    async fn find_object_by_id(&self, identity: &Identity) -> Result<Option<ObjectPrx>>;

    /// Any proxy carrying the adapter's endpoints, or `None` when the
    /// adapter is unknown.
    async fn find_adapter_by_id(&self, adapter_id: &str) -> Result<Option<ObjectPrx>>;
}

struct Cached<T> {
    value: T,
    at: Instant,
}

/// Resolution cache in front of a [`Locator`]
pub(crate) struct LocatorInfo {
    /// `None` caches forever; zero disables caching
    ttl: Option<Duration>,
    adapters: Mutex<HashMap<String, Cached<Vec<Endpoint>>>>,
    objects: Mutex<HashMap<Identity, Cached<Reference>>>,
}

impl LocatorInfo {
    pub(crate) fn new(ttl: Option<Duration>) -> Self {
        Self {
            ttl,
            adapters: Mutex::new(HashMap::new()),
            objects: Mutex::new(HashMap::new()),
        }
    }

    fn fresh<T: Clone>(&self, entry: Option<&Cached<T>>) -> Option<T> {
        let entry = entry?;
        match self.ttl {
            None => Some(entry.value.clone()),
            Some(ttl) if entry.at.elapsed() < ttl => Some(entry.value.clone()),
            Some(_) => None,
        }
    }

    fn caching(&self) -> bool {
        self.ttl != Some(Duration::ZERO)
    }

    /// Endpoints for an indirect reference.
    pub(crate) async fn resolve(
        &self,
        locator: &dyn Locator,
        reference: &Reference,
    ) -> Result<Vec<Endpoint>> {
        match reference.adapter_id() {
            Some(adapter_id) => self.resolve_adapter(locator, adapter_id).await,
            None => self.resolve_object(locator, reference.identity()).await,
        }
    }

    async fn resolve_adapter(&self, locator: &dyn Locator, adapter_id: &str) -> Result<Vec<Endpoint>> {
        if let Some(endpoints) = self.fresh(self.adapters.lock().get(adapter_id)) {
            return Ok(endpoints);
        }
        let proxy = locator
            .find_adapter_by_id(adapter_id)
            .await?
            .ok_or_else(|| RpcError::NotRegistered {
                kind: "object adapter",
                id: adapter_id.to_string(),
            })?;
        let endpoints = proxy.reference().endpoints().to_vec();
        if endpoints.is_empty() {
            return Err(RpcError::NoEndpoint(format!(
                "locator returned no endpoints for adapter `{}`",
                adapter_id
            )));
        }
        trace!(target: "floe::retry", "located adapter `{}`", adapter_id);
        if self.caching() {
            self.adapters.lock().insert(
                adapter_id.to_string(),
                Cached {
                    value: endpoints.clone(),
                    at: Instant::now(),
                },
            );
        }
        Ok(endpoints)
    }

    async fn resolve_object(&self, locator: &dyn Locator, identity: &Identity) -> Result<Vec<Endpoint>> {
        let cached = self.fresh(self.objects.lock().get(identity));
        let reference = match cached {
            Some(reference) => reference,
            None => {
                let proxy = locator
                    .find_object_by_id(identity)
                    .await?
                    .ok_or_else(|| RpcError::NotRegistered {
                        kind: "object",
                        id: identity.to_string(),
                    })?;
                let reference = proxy.reference().clone();
                trace!(target: "floe::retry", "located object `{}`", identity);
                if self.caching() {
                    self.objects.lock().insert(
                        identity.clone(),
                        Cached {
                            value: reference.clone(),
                            at: Instant::now(),
                        },
                    );
                }
                reference
            }
        };

        if !reference.endpoints().is_empty() {
            return Ok(reference.endpoints().to_vec());
        }
        match reference.adapter_id() {
            Some(adapter_id) => self.resolve_adapter(locator, adapter_id).await,
            None => Err(RpcError::NoEndpoint(format!(
                "locator returned a well-known proxy for `{}`",
                identity
            ))),
        }
    }

    /// Drop whatever was cached for `reference`.
    pub(crate) fn invalidate(&self, reference: &Reference) {
        match reference.adapter_id() {
            Some(adapter_id) => {
                self.adapters.lock().remove(adapter_id);
            }
            None => {
                let removed = self.objects.lock().remove(reference.identity());
                if let Some(adapter_id) = removed.as_ref().and_then(|c| c.value.adapter_id()) {
                    self.adapters.lock().remove(adapter_id);
                }
            }
        }
    }
}
