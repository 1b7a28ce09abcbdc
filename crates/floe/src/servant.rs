//! Servants and the per-dispatch [`Current`]
//!
//! A servant is anything that can turn a named operation and an opaque
//! parameter payload into a reply payload. Generated skeletons (or the
//! [`ServantBuilder`]) implement [`Servant`]; the adapter only ever sees
//! the trait object.

use crate::adapter::ObjectAdapter;
use crate::connection::Connection;
use crate::error::{Result, RpcError};
use async_trait::async_trait;
use bytes::Bytes;
use floe_proto::{Context, EncodingVersion, Identity, InputStream, OperationMode, OutputStream};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Type id every servant implements
pub const OBJECT_TYPE_ID: &str = "::Floe::Object";

/// Information about the request being dispatched
#[derive(Clone)]
pub struct Current {
    pub adapter: ObjectAdapter,
    /// `None` for collocated dispatch
    pub connection: Option<Connection>,
    pub identity: Identity,
    pub facet: String,
    pub operation: String,
    pub mode: OperationMode,
    pub context: Context,
    /// Zero for oneway and batched requests
    pub request_id: i32,
    pub encoding: EncodingVersion,
}

impl Current {
    /// Error for an operation this servant does not implement
    pub fn operation_not_exist(&self) -> RpcError {
        RpcError::OperationNotExist {
            identity: self.identity.clone(),
            facet: self.facet.clone(),
            operation: self.operation.clone(),
        }
    }

    pub fn is_oneway(&self) -> bool {
        self.request_id == 0
    }
}

impl fmt::Debug for Current {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Current")
            .field("adapter", &self.adapter.name())
            .field("identity", &self.identity)
            .field("facet", &self.facet)
            .field("operation", &self.operation)
            .field("mode", &self.mode)
            .field("request_id", &self.request_id)
            .finish()
    }
}

/// A dispatch target
#[async_trait]
pub trait Servant: Send + Sync + 'static {
    /// Handle one request. Return [`RpcError::User`] for application
    /// errors and [`Current::operation_not_exist`] for unknown operations.
    async fn dispatch(&self, current: &Current, params: Bytes) -> Result<Bytes>;

    /// Most-derived type id first
    fn type_ids(&self) -> Vec<String> {
        vec![OBJECT_TYPE_ID.to_string()]
    }
}

/// Answer `ice_ping`, `ice_id`, `ice_ids` and `ice_isA`. Returns `None`
/// for any other operation.
pub(crate) fn dispatch_builtin(
    servant: &dyn Servant,
    current: &Current,
    params: &Bytes,
) -> Option<Result<Bytes>> {
    let type_ids = || {
        let mut ids = servant.type_ids();
        if !ids.iter().any(|id| id == OBJECT_TYPE_ID) {
            ids.push(OBJECT_TYPE_ID.to_string());
        }
        ids
    };
    let mut out = OutputStream::new();
    match current.operation.as_str() {
        "ice_ping" => {}
        "ice_id" => out.write_string(&type_ids()[0]),
        "ice_ids" => {
            let mut ids = type_ids();
            ids.sort();
            out.write_string_seq(&ids);
        }
        "ice_isA" => {
            let mut input = InputStream::new(params.clone());
            let type_id = match input.read_string() {
                Ok(id) => id,
                Err(e) => return Some(Err(e.into())),
            };
            out.write_bool(type_ids().contains(&type_id));
        }
        _ => return None,
    }
    Some(Ok(out.finish()))
}

/// Boxed operation handler
pub type OperationHandler =
    Arc<dyn Fn(Current, Bytes) -> BoxFuture<'static, Result<Bytes>> + Send + Sync>;

/// Servant dispatching by operation name to registered closures
pub struct OperationServant {
    type_ids: Vec<String>,
    operations: HashMap<String, OperationHandler>,
}

impl OperationServant {
    pub fn get_operation(&self, name: &str) -> Option<&OperationHandler> {
        self.operations.get(name)
    }
}

#[async_trait]
impl Servant for OperationServant {
    async fn dispatch(&self, current: &Current, params: Bytes) -> Result<Bytes> {
        let handler = self
            .operations
            .get(&current.operation)
            .ok_or_else(|| current.operation_not_exist())?;
        handler(current.clone(), params).await
    }

    fn type_ids(&self) -> Vec<String> {
        self.type_ids.clone()
    }
}

/// Builder for an [`OperationServant`]
#[derive(Default)]
pub struct ServantBuilder {
    type_ids: Vec<String>,
    operations: HashMap<String, OperationHandler>,
}

impl ServantBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a type id; the first one added is the most derived.
    pub fn type_id(mut self, type_id: impl Into<String>) -> Self {
        self.type_ids.push(type_id.into());
        self
    }

    pub fn operation<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Current, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        self.operations.insert(
            name.into(),
            Arc::new(move |current, params| Box::pin(handler(current, params))),
        );
        self
    }

    pub fn build(mut self) -> Arc<OperationServant> {
        if !self.type_ids.iter().any(|id| id == OBJECT_TYPE_ID) {
            self.type_ids.push(OBJECT_TYPE_ID.to_string());
        }
        Arc::new(OperationServant {
            type_ids: self.type_ids,
            operations: self.operations,
        })
    }
}
