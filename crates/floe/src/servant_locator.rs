//! Just-in-time servant resolution

use crate::error::Result;
use crate::servant::{Current, Servant};
use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;

/// Opaque value handed from `locate` to the matching `finished`
pub type Cookie = Box<dyn Any + Send + Sync>;

/// Outcome of [`ServantLocator::locate`]
pub enum Located {
    Found {
        servant: Arc<dyn Servant>,
        cookie: Option<Cookie>,
    },
    NotFound,
}

impl Located {
    pub fn found(servant: Arc<dyn Servant>) -> Self {
        Located::Found {
            servant,
            cookie: None,
        }
    }

    pub fn with_cookie(servant: Arc<dyn Servant>, cookie: impl Any + Send + Sync) -> Self {
        Located::Found {
            servant,
            cookie: Some(Box::new(cookie)),
        }
    }
}

/// Resolves servants for one identity category.
///
/// Every call to `locate` is followed by exactly one call to `finished`
/// once the dispatch is over, whether `locate` found a servant, found
/// nothing or failed, and whether the servant returned, failed or
/// panicked. `servant` is `None` when `locate` produced none.
#[async_trait]
pub trait ServantLocator: Send + Sync + 'static {
    async fn locate(&self, current: &Current) -> Result<Located>;

    async fn finished(
        &self,
        current: &Current,
        servant: Option<&Arc<dyn Servant>>,
        cookie: Option<Cookie>,
    );

    /// Called once when the owning adapter is destroyed.
    async fn deactivate(&self, category: &str);
}
