//! Dispatch tables of one object adapter

use crate::error::{Result, RpcError};
use crate::servant::Servant;
use crate::servant_locator::ServantLocator;
use floe_proto::Identity;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Default)]
struct Tables {
    /// identity -> facet -> servant
    servants: HashMap<Identity, BTreeMap<String, Arc<dyn Servant>>>,
    default_servants: HashMap<String, Arc<dyn Servant>>,
    locators: HashMap<String, Arc<dyn ServantLocator>>,
}

#[derive(Default)]
pub(crate) struct ServantManager {
    tables: RwLock<Tables>,
}

impl ServantManager {
    pub(crate) fn add(&self, servant: Arc<dyn Servant>, identity: &Identity, facet: &str) -> Result<()> {
        identity
            .validate()
            .map_err(|e| RpcError::InvalidIdentity(e.to_string()))?;
        let mut tables = self.tables.write();
        let facets = tables.servants.entry(identity.clone()).or_default();
        if facets.contains_key(facet) {
            return Err(RpcError::AlreadyRegistered {
                kind: "servant",
                id: describe(identity, facet),
            });
        }
        facets.insert(facet.to_string(), servant);
        Ok(())
    }

    pub(crate) fn remove(&self, identity: &Identity, facet: &str) -> Result<Arc<dyn Servant>> {
        let mut tables = self.tables.write();
        let not_registered = || RpcError::NotRegistered {
            kind: "servant",
            id: describe(identity, facet),
        };
        let facets = tables.servants.get_mut(identity).ok_or_else(not_registered)?;
        let servant = facets.remove(facet).ok_or_else(not_registered)?;
        if facets.is_empty() {
            tables.servants.remove(identity);
        }
        Ok(servant)
    }

    pub(crate) fn remove_all_facets(
        &self,
        identity: &Identity,
    ) -> Result<BTreeMap<String, Arc<dyn Servant>>> {
        self.tables
            .write()
            .servants
            .remove(identity)
            .ok_or_else(|| RpcError::NotRegistered {
                kind: "servant",
                id: identity.to_string(),
            })
    }

    pub(crate) fn find(&self, identity: &Identity, facet: &str) -> Option<Arc<dyn Servant>> {
        self.tables
            .read()
            .servants
            .get(identity)
            .and_then(|facets| facets.get(facet))
            .cloned()
    }

    pub(crate) fn find_all_facets(&self, identity: &Identity) -> BTreeMap<String, Arc<dyn Servant>> {
        self.tables
            .read()
            .servants
            .get(identity)
            .cloned()
            .unwrap_or_default()
    }

    /// Exact registration first, then the default servant of the identity's
    /// category, then the category-less default servant.
    pub(crate) fn find_servant(&self, identity: &Identity, facet: &str) -> Option<Arc<dyn Servant>> {
        let tables = self.tables.read();
        if let Some(servant) = tables
            .servants
            .get(identity)
            .and_then(|facets| facets.get(facet))
        {
            return Some(servant.clone());
        }
        tables
            .default_servants
            .get(&identity.category)
            .or_else(|| tables.default_servants.get(""))
            .cloned()
    }

    /// True when some facet of `identity` is registered
    pub(crate) fn has_identity(&self, identity: &Identity) -> bool {
        self.tables.read().servants.contains_key(identity)
    }

    /// True when a registration or a default servant covers `identity`
    pub(crate) fn has_servant(&self, identity: &Identity) -> bool {
        let tables = self.tables.read();
        tables.servants.contains_key(identity)
            || tables.default_servants.contains_key(&identity.category)
            || tables.default_servants.contains_key("")
    }

    pub(crate) fn add_default_servant(&self, servant: Arc<dyn Servant>, category: &str) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.default_servants.contains_key(category) {
            return Err(RpcError::AlreadyRegistered {
                kind: "default servant",
                id: category.to_string(),
            });
        }
        tables.default_servants.insert(category.to_string(), servant);
        Ok(())
    }

    pub(crate) fn remove_default_servant(&self, category: &str) -> Result<Arc<dyn Servant>> {
        self.tables
            .write()
            .default_servants
            .remove(category)
            .ok_or_else(|| RpcError::NotRegistered {
                kind: "default servant",
                id: category.to_string(),
            })
    }

    pub(crate) fn find_default_servant(&self, category: &str) -> Option<Arc<dyn Servant>> {
        self.tables.read().default_servants.get(category).cloned()
    }

    pub(crate) fn add_locator(&self, locator: Arc<dyn ServantLocator>, category: &str) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.locators.contains_key(category) {
            return Err(RpcError::AlreadyRegistered {
                kind: "servant locator",
                id: category.to_string(),
            });
        }
        tables.locators.insert(category.to_string(), locator);
        Ok(())
    }

    pub(crate) fn remove_locator(&self, category: &str) -> Result<Arc<dyn ServantLocator>> {
        self.tables
            .write()
            .locators
            .remove(category)
            .ok_or_else(|| RpcError::NotRegistered {
                kind: "servant locator",
                id: category.to_string(),
            })
    }

    pub(crate) fn find_locator(&self, category: &str) -> Option<Arc<dyn ServantLocator>> {
        self.tables.read().locators.get(category).cloned()
    }

    /// Locators to try for `category`, most specific first
    pub(crate) fn locators_for(&self, category: &str) -> Vec<Arc<dyn ServantLocator>> {
        let tables = self.tables.read();
        let mut locators = Vec::with_capacity(2);
        if let Some(l) = tables.locators.get(category) {
            locators.push(l.clone());
        }
        if !category.is_empty() {
            if let Some(l) = tables.locators.get("") {
                locators.push(l.clone());
            }
        }
        locators
    }

    /// Drop every registration, returning the locators by category.
    pub(crate) fn destroy(&self) -> Vec<(String, Arc<dyn ServantLocator>)> {
        let mut tables = self.tables.write();
        tables.servants.clear();
        tables.default_servants.clear();
        tables.locators.drain().collect()
    }
}

fn describe(identity: &Identity, facet: &str) -> String {
    if facet.is_empty() {
        identity.to_string()
    } else {
        format!("{} -f {}", identity, facet)
    }
}
