//! Shared helpers for the integration tests

#![allow(dead_code)]

use bytes::Bytes;
use floe::{
    Communicator, Identity, ObjectAdapter, ObjectPrx, OperationMode, OperationServant, Properties,
    Result, RpcError, ServantBuilder,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const ECHO_TYPE_ID: &str = "::Demo::Echo";

/// Install a fmt subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Echo servant used by most tests.
///
/// - `echo` returns its parameters
/// - `sleep` waits for the number of milliseconds in its parameters (u64 LE)
/// - `fail` raises a user exception carrying its parameters
/// - `panic` panics
pub fn echo_servant() -> Arc<OperationServant> {
    ServantBuilder::new()
        .type_id(ECHO_TYPE_ID)
        .operation("echo", |_, params| async move { Ok(params) })
        .operation("sleep", |_, params: Bytes| async move {
            tokio::time::sleep(Duration::from_millis(millis(&params))).await;
            Ok(params)
        })
        .operation("fail", |_, params| async move { Err(RpcError::User(params)) })
        .operation("panic", |_, _| async move {
            if true {
                panic!("servant panicked");
            }
            Ok(Bytes::new())
        })
        .build()
}

pub fn millis_param(ms: u64) -> Bytes {
    Bytes::copy_from_slice(&ms.to_le_bytes())
}

fn millis(params: &Bytes) -> u64 {
    let mut raw = [0u8; 8];
    let n = params.len().min(8);
    raw[..n].copy_from_slice(&params[..n]);
    u64::from_le_bytes(raw)
}

/// A communicator that fails fast: no retries and short connect timeouts.
pub fn client_communicator() -> Communicator {
    client_with(Properties::new())
}

pub fn client_with(properties: Properties) -> Communicator {
    let mut properties = properties;
    if properties.get("Floe.RetryIntervals").is_none() {
        properties.set("Floe.RetryIntervals", "-1");
    }
    if properties.get("Floe.Connection.ConnectTimeout").is_none() {
        properties.set("Floe.Connection.ConnectTimeout", "2000");
    }
    Communicator::with_properties(properties).expect("communicator")
}

/// A running server with one echo object named `test`.
pub struct EchoServer {
    pub communicator: Communicator,
    pub adapter: ObjectAdapter,
    pub proxy: ObjectPrx,
}

impl EchoServer {
    pub async fn start(endpoints: &str) -> Result<Self> {
        let communicator = Communicator::new()?;
        Self::start_on(communicator, endpoints).await
    }

    pub async fn start_on(communicator: Communicator, endpoints: &str) -> Result<Self> {
        let adapter = communicator
            .create_object_adapter_with_endpoints("EchoAdapter", endpoints)
            .await?;
        let proxy = adapter.add(echo_servant(), Identity::named("test"))?;
        adapter.activate()?;
        Ok(Self {
            communicator,
            adapter,
            proxy,
        })
    }

    /// Stringified proxy for `test`, for use by another communicator.
    pub fn proxy_string(&self) -> String {
        self.proxy.to_proxy_string().expect("stringify")
    }

    pub async fn stop(self) {
        self.communicator.destroy().await;
    }
}

pub async fn echo(proxy: &ObjectPrx, payload: &'static [u8]) -> Result<Bytes> {
    proxy
        .invoke("echo", OperationMode::Normal, Bytes::from_static(payload))
        .await
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Latency and outcome counters shared by concurrent clients
#[derive(Default)]
pub struct ConcurrentStats {
    success: AtomicU64,
    failure: AtomicU64,
    latencies: Mutex<Vec<Duration>>,
}

impl ConcurrentStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, latency: Duration) {
        self.success.fetch_add(1, Ordering::Relaxed);
        self.latencies.lock().push(latency);
    }

    pub fn record_failure(&self) {
        self.failure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn success_count(&self) -> u64 {
        self.success.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u64 {
        self.failure.load(Ordering::Relaxed)
    }

    pub fn avg_latency(&self) -> Duration {
        let latencies = self.latencies.lock();
        if latencies.is_empty() {
            return Duration::ZERO;
        }
        latencies.iter().sum::<Duration>() / latencies.len() as u32
    }

    pub fn max_latency(&self) -> Duration {
        self.latencies.lock().iter().max().copied().unwrap_or_default()
    }
}

/// Summary line printed by the harness
#[derive(Debug, Default)]
pub struct TestSuiteResults {
    pub passed: usize,
    pub failed: usize,
}

impl TestSuiteResults {
    pub fn record(&mut self, success: bool) {
        if success {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}
