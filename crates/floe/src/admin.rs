//! Administrative facets
//!
//! Facets registered here are served by a single admin object. The
//! runtime only keeps the name -> servant table and registers it on an
//! adapter; what each facet does is up to whoever registered it. The
//! built-in `Properties` facet exposes the communicator's properties.

use crate::adapter::ObjectAdapter;
use crate::error::{Result, RpcError};
use crate::properties::Properties;
use crate::proxy::ObjectPrx;
use crate::servant::{Servant, ServantBuilder};
use bytes::Bytes;
use floe_proto::{Identity, InputStream, OutputStream};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Name of the built-in properties facet
pub const PROPERTIES_FACET: &str = "Properties";

/// Type id of the properties facet
pub const PROPERTIES_ADMIN_TYPE_ID: &str = "::Floe::PropertiesAdmin";

pub(crate) struct AdminFacets {
    facets: Mutex<BTreeMap<String, Arc<dyn Servant>>>,
    /// `Floe.Admin.Facets`; `None` exposes everything
    enabled: Option<BTreeSet<String>>,
    admin: Mutex<Option<(ObjectAdapter, Identity)>>,
    /// Serializes admin creation
    pub(crate) creating: tokio::sync::Mutex<()>,
}

impl AdminFacets {
    pub(crate) fn new(properties: &Properties) -> Self {
        let enabled = properties.get_list("Floe.Admin.Facets");
        let facets = Self {
            facets: Mutex::new(BTreeMap::new()),
            enabled: (!enabled.is_empty()).then(|| enabled.into_iter().collect()),
            admin: Mutex::new(None),
            creating: tokio::sync::Mutex::new(()),
        };
        if facets.is_enabled(PROPERTIES_FACET) {
            facets
                .facets
                .lock()
                .insert(PROPERTIES_FACET.to_string(), properties_facet(properties.clone()));
        }
        facets
    }

    fn is_enabled(&self, facet: &str) -> bool {
        self.enabled.as_ref().map_or(true, |set| set.contains(facet))
    }

    pub(crate) fn add(&self, servant: Arc<dyn Servant>, facet: &str) -> Result<()> {
        {
            let mut facets = self.facets.lock();
            if facets.contains_key(facet) {
                return Err(RpcError::AlreadyRegistered {
                    kind: "admin facet",
                    id: facet.to_string(),
                });
            }
            facets.insert(facet.to_string(), servant.clone());
        }
        if let Some((adapter, identity)) = self.admin() {
            if self.is_enabled(facet) {
                adapter.add_facet(servant, identity, facet)?;
            }
        }
        Ok(())
    }

    pub(crate) fn remove(&self, facet: &str) -> Result<Arc<dyn Servant>> {
        let servant = self
            .facets
            .lock()
            .remove(facet)
            .ok_or_else(|| RpcError::NotRegistered {
                kind: "admin facet",
                id: facet.to_string(),
            })?;
        if let Some((adapter, identity)) = self.admin() {
            let _ = adapter.remove_facet(&identity, facet);
        }
        Ok(servant)
    }

    pub(crate) fn find(&self, facet: &str) -> Option<Arc<dyn Servant>> {
        self.facets.lock().get(facet).cloned()
    }

    pub(crate) fn find_all(&self) -> BTreeMap<String, Arc<dyn Servant>> {
        self.facets.lock().clone()
    }

    pub(crate) fn admin(&self) -> Option<(ObjectAdapter, Identity)> {
        self.admin.lock().clone()
    }

    /// Register the enabled facets on `adapter` under `identity`.
    pub(crate) fn install(&self, adapter: &ObjectAdapter, identity: &Identity) -> Result<ObjectPrx> {
        if self.admin.lock().is_some() {
            return Err(RpcError::AlreadyRegistered {
                kind: "admin object",
                id: identity.to_string(),
            });
        }
        for (facet, servant) in self.find_all() {
            if self.is_enabled(&facet) {
                adapter.add_facet(servant, identity.clone(), &facet)?;
            }
        }
        *self.admin.lock() = Some((adapter.clone(), identity.clone()));
        adapter.create_proxy(identity.clone())
    }

    pub(crate) fn clear(&self) {
        self.facets.lock().clear();
        self.admin.lock().take();
    }
}

/// `getProperty(key) -> string` and `getPropertiesForPrefix(prefix) -> dict`
fn properties_facet(properties: Properties) -> Arc<dyn Servant> {
    let properties = Arc::new(properties);
    let for_prefix = properties.clone();
    ServantBuilder::new()
        .type_id(PROPERTIES_ADMIN_TYPE_ID)
        .operation("getProperty", move |_, params: Bytes| {
            let properties = properties.clone();
            async move {
                let key = InputStream::new(params).read_string()?;
                let mut out = OutputStream::new();
                out.write_string(properties.get(&key).unwrap_or_default());
                Ok::<_, RpcError>(out.finish())
            }
        })
        .operation("getPropertiesForPrefix", move |_, params: Bytes| {
            let properties = for_prefix.clone();
            async move {
                let prefix = InputStream::new(params).read_string()?;
                let mut out = OutputStream::new();
                out.write_context(&properties.get_for_prefix(&prefix));
                Ok::<_, RpcError>(out.finish())
            }
        })
        .build()
}
