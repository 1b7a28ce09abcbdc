//! Locator Tests - indirect and well-known proxies
//!
//! A map-backed locator stands in for a registry. It counts lookups so the
//! cache behavior is observable.

mod common;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::*;
use floe::{Communicator, Identity, Locator, ObjectPrx, Properties, RpcError};

#[derive(Default)]
struct MapLocator {
    adapters: Mutex<HashMap<String, ObjectPrx>>,
    objects: Mutex<HashMap<Identity, ObjectPrx>>,
    adapter_lookups: AtomicUsize,
    object_lookups: AtomicUsize,
}

impl MapLocator {
    fn register_adapter(&self, id: &str, proxy: ObjectPrx) {
        self.adapters.lock().insert(id.to_string(), proxy);
    }

    fn register_object(&self, proxy: ObjectPrx) {
        self.objects.lock().insert(proxy.identity().clone(), proxy);
    }
}

#[async_trait]
impl Locator for MapLocator {
    async fn find_object_by_id(&self, identity: &Identity) -> floe::Result<Option<ObjectPrx>> {
        self.object_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.objects.lock().get(identity).cloned())
    }

    async fn find_adapter_by_id(&self, adapter_id: &str) -> floe::Result<Option<ObjectPrx>> {
        self.adapter_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.adapters.lock().get(adapter_id).cloned())
    }
}

/// Server communicator whose `Hello` adapter registers as `HelloAdapter`
async fn hello_server() -> EchoServer {
    let properties = Properties::new().with("EchoAdapter.AdapterId", "HelloAdapter");
    let communicator = Communicator::with_properties(properties).unwrap();
    EchoServer::start_on(communicator, "tcp -h 127.0.0.1 -p 0")
        .await
        .unwrap()
}

fn client_with_locator(properties: Properties, locator: Arc<MapLocator>) -> Communicator {
    let client = client_with(properties);
    client.set_default_locator(Some(locator as Arc<dyn Locator>));
    client
}

/// Test: an indirect proxy resolves through the locator and is cached
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_indirect_proxy_resolution() {
    init_logging();

    let server = hello_server().await;
    let direct = server.adapter.create_direct_proxy(Identity::named("test")).unwrap();
    let indirect = server.adapter.create_indirect_proxy(Identity::named("test")).unwrap();
    assert_eq!(indirect.adapter_id(), Some("HelloAdapter"));
    assert_eq!(indirect.to_proxy_string().unwrap(), "test -t -e 1.1 @ HelloAdapter");

    let locator = Arc::new(MapLocator::default());
    let client = client_with_locator(Properties::new(), locator.clone());
    locator.register_adapter(
        "HelloAdapter",
        client.string_to_proxy(&direct.to_proxy_string().unwrap()).unwrap(),
    );

    let proxy = client.string_to_proxy("test@HelloAdapter").unwrap();
    for _ in 0..3 {
        assert_eq!(&echo(&proxy, b"hi").await.unwrap()[..], b"hi");
    }
    assert_eq!(locator.adapter_lookups.load(Ordering::SeqCst), 1);

    server.stop().await;
    client.destroy().await;
}

/// Test: a zero cache timeout queries the locator for every connection
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_locator_cache_disabled() {
    init_logging();

    let server = hello_server().await;
    let direct = server.adapter.create_direct_proxy(Identity::named("test")).unwrap();

    let locator = Arc::new(MapLocator::default());
    let client = client_with_locator(
        Properties::new().with("Floe.Default.LocatorCacheTimeout", "0"),
        locator.clone(),
    );
    locator.register_adapter(
        "HelloAdapter",
        client.string_to_proxy(&direct.to_proxy_string().unwrap()).unwrap(),
    );

    let proxy = client.string_to_proxy("test@HelloAdapter").unwrap();
    echo(&proxy, b"1").await.unwrap();
    echo(&proxy, b"2").await.unwrap();
    assert_eq!(locator.adapter_lookups.load(Ordering::SeqCst), 2);

    server.stop().await;
    client.destroy().await;
}

/// Test: a well-known proxy resolves through find_object_by_id
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_well_known_proxy() {
    init_logging();

    let server = hello_server().await;
    let locator = Arc::new(MapLocator::default());
    let client = client_with_locator(Properties::new(), locator.clone());
    let direct = server.adapter.create_direct_proxy(Identity::named("test")).unwrap();
    locator.register_object(client.string_to_proxy(&direct.to_proxy_string().unwrap()).unwrap());

    let proxy = client.string_to_proxy("test").unwrap();
    assert!(proxy.reference().is_well_known());
    assert_eq!(&echo(&proxy, b"wk").await.unwrap()[..], b"wk");
    assert_eq!(locator.object_lookups.load(Ordering::SeqCst), 1);

    let unknown = client.string_to_proxy("nobody").unwrap();
    assert!(matches!(
        echo(&unknown, b"x").await,
        Err(RpcError::NotRegistered { kind: "object", .. })
    ));
    let unknown_adapter = client.string_to_proxy("test@Nowhere").unwrap();
    assert!(matches!(
        echo(&unknown_adapter, b"x").await,
        Err(RpcError::NotRegistered { kind: "object adapter", .. })
    ));

    server.stop().await;
    client.destroy().await;
}

/// Test: ObjectNotExist on an indirect proxy invalidates the cache and
/// retries once against the new location
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_object_moved() {
    init_logging();

    let old_home = EchoServer::start("tcp -h 127.0.0.1 -p 0").await.unwrap();
    let new_home = EchoServer::start("tcp -h 127.0.0.1 -p 0").await.unwrap();
    let moved = Identity::named("moved");
    new_home.adapter.add(echo_servant(), moved.clone()).unwrap();

    let locator = Arc::new(MapLocator::default());
    let client = client_with_locator(
        Properties::new().with("Floe.RetryIntervals", "0"),
        locator.clone(),
    );
    locator.register_adapter(
        "Mover",
        client.string_to_proxy(&old_home.proxy_string()).unwrap(),
    );

    let proxy = client.string_to_proxy("moved@Mover").unwrap();
    let first = echo(&proxy, b"x").await;
    assert!(matches!(first, Err(RpcError::ObjectNotExist { .. })));
    assert_eq!(locator.adapter_lookups.load(Ordering::SeqCst), 2);

    locator.register_adapter(
        "Mover",
        client.string_to_proxy(&new_home.proxy_string()).unwrap(),
    );
    assert_eq!(&echo(&proxy, b"here").await.unwrap()[..], b"here");

    // direct proxies are not relocated
    let direct = client
        .string_to_proxy(&old_home.proxy_string())
        .unwrap()
        .with_identity(moved);
    assert!(matches!(
        echo(&direct, b"x").await,
        Err(RpcError::ObjectNotExist { .. })
    ));

    old_home.stop().await;
    new_home.stop().await;
    client.destroy().await;
}
