//! Worker pools
//!
//! A communicator keeps client-side I/O and server-side dispatch on
//! separate pools so a slow servant cannot starve outgoing invocations.
//! A pool of size zero runs its tasks on the tokio runtime that was
//! current when the pool was created.

use crate::error::{Result, RpcError};
use parking_lot::Mutex;
use std::future::Future;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::debug;

pub(crate) struct ThreadPool {
    name: &'static str,
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
}

impl ThreadPool {
    pub(crate) fn new(name: &'static str, size: usize) -> Result<Self> {
        if size == 0 {
            let handle = Handle::try_current().map_err(|_| {
                RpcError::InitializationFailed(format!(
                    "the {} pool must be created inside a tokio runtime",
                    name
                ))
            })?;
            return Ok(Self {
                name,
                handle,
                runtime: Mutex::new(None),
            });
        }

        let runtime = Builder::new_multi_thread()
            .worker_threads(size)
            .thread_name(format!("floe-{}", name))
            .enable_all()
            .build()
            .map_err(|e| {
                RpcError::InitializationFailed(format!("cannot start {} pool: {}", name, e))
            })?;
        debug!("started {} pool with {} threads", name, size);
        Ok(Self {
            name,
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
        })
    }

    pub(crate) fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(fut)
    }

    /// Stop a dedicated pool without blocking the caller.
    pub(crate) fn shutdown(&self) {
        if let Some(runtime) = self.runtime.lock().take() {
            debug!("stopping {} pool", self.name);
            runtime.shutdown_background();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
