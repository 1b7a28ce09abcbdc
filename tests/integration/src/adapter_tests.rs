//! Adapter Tests - lifecycle, backpressure and servant resolution
//!
//! These tests exercise the server side: draining on deactivation,
//! holding, the MaxDispatches bound, default servants, facets and
//! servant locators.

mod common;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;
use floe::{
    AdapterState, Communicator, Cookie, Current, Identity, Located, OperationMode, Properties,
    RpcError, Servant, ServantBuilder, ServantLocator,
};

/// Test: deactivate waits for in-flight dispatches and their replies
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_deactivate_drains_in_flight_dispatch() {
    init_logging();

    let server = EchoServer::start("tcp -h 127.0.0.1 -p 0").await.unwrap();
    let client = client_communicator();
    let proxy = client.string_to_proxy(&server.proxy_string()).unwrap();
    proxy.ping().await.unwrap();

    let call = {
        let proxy = proxy.clone();
        tokio::spawn(async move {
            proxy
                .invoke("sleep", OperationMode::Normal, millis_param(500))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let start = Instant::now();
    server.adapter.deactivate().await;
    assert!(start.elapsed() >= Duration::from_millis(300));
    assert_eq!(server.adapter.state(), AdapterState::Deactivated);

    let reply = call.await.unwrap().unwrap();
    assert_eq!(reply, millis_param(500));

    // new requests are refused once deactivated
    assert!(echo(&proxy, b"late").await.is_err());

    server.stop().await;
    client.destroy().await;
}

/// Test: a holding adapter queues requests until activated again
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hold_then_activate() {
    init_logging();

    let server = EchoServer::start("tcp -h 127.0.0.1 -p 0").await.unwrap();
    let client = client_communicator();
    let proxy = client.string_to_proxy(&server.proxy_string()).unwrap();
    proxy.ping().await.unwrap();

    server.adapter.hold();
    server.adapter.wait_for_hold().await;

    let call = {
        let proxy = proxy.clone();
        tokio::spawn(async move { echo(&proxy, b"held").await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!call.is_finished());

    server.adapter.activate().unwrap();
    assert_eq!(call.await.unwrap().unwrap(), Bytes::from_static(b"held"));

    server.stop().await;
    client.destroy().await;
}

/// Test: MaxDispatches bounds concurrent dispatches
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_max_dispatches() {
    init_logging();

    let properties = Properties::new()
        .with("Bounded.Endpoints", "tcp -h 127.0.0.1 -p 0")
        .with("Bounded.MaxDispatches", "2");
    let server = Communicator::with_properties(properties).unwrap();
    let adapter = server.create_object_adapter("Bounded").await.unwrap();

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (a, p) = (active.clone(), peak.clone());
    let servant = ServantBuilder::new()
        .operation("work", move |_, _| {
            let (active, peak) = (a.clone(), p.clone());
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(Bytes::new())
            }
        })
        .build();
    let target = adapter.add(servant, Identity::named("worker")).unwrap();
    adapter.activate().unwrap();

    let client = client_communicator();
    let proxy = client
        .string_to_proxy(&target.to_proxy_string().unwrap())
        .unwrap();

    let calls = (0..8).map(|_| {
        let proxy = proxy.clone();
        async move { proxy.invoke("work", OperationMode::Normal, Bytes::new()).await }
    });
    for result in futures::future::join_all(calls).await {
        result.unwrap();
    }
    assert_eq!(peak.load(Ordering::SeqCst), 2);

    server.destroy().await;
    client.destroy().await;
}

/// Servant whose `work` operation counts its starts and then sleeps
fn counting_worker(started: Arc<AtomicUsize>, millis: u64) -> Arc<dyn Servant> {
    ServantBuilder::new()
        .operation("work", move |_, _| {
            let started = started.clone();
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(Bytes::new())
            }
        })
        .build()
}

/// Test: a request queued behind MaxDispatches never starts once
/// deactivation begins
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_deactivate_refuses_queued_dispatch() {
    init_logging();

    let properties = Properties::new()
        .with("Single.Endpoints", "tcp -h 127.0.0.1 -p 0")
        .with("Single.MaxDispatches", "1");
    let server = Communicator::with_properties(properties).unwrap();
    let adapter = server.create_object_adapter("Single").await.unwrap();
    let started = Arc::new(AtomicUsize::new(0));
    let target = adapter
        .add(counting_worker(started.clone(), 300), Identity::named("worker"))
        .unwrap();
    adapter.activate().unwrap();

    let client = client_communicator();
    let proxy = client
        .string_to_proxy(&target.to_proxy_string().unwrap())
        .unwrap();
    let call = |proxy: floe::ObjectPrx| {
        tokio::spawn(async move { proxy.invoke("work", OperationMode::Normal, Bytes::new()).await })
    };
    let first = call(proxy.clone());
    assert!(eventually(|| started.load(Ordering::SeqCst) == 1).await);
    let second = call(proxy.clone());
    tokio::time::sleep(Duration::from_millis(100)).await;

    adapter.deactivate().await;
    assert!(first.await.unwrap().is_ok());
    assert!(second.await.unwrap().is_err());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(started.load(Ordering::SeqCst), 1);

    server.destroy().await;
    client.destroy().await;
}

/// Test: requests held by a holding adapter are dropped, not dispatched,
/// when the adapter is deactivated
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_deactivate_while_holding() {
    init_logging();

    let server = EchoServer::start("tcp -h 127.0.0.1 -p 0").await.unwrap();
    let started = Arc::new(AtomicUsize::new(0));
    let target = server
        .adapter
        .add(counting_worker(started.clone(), 10), Identity::named("worker"))
        .unwrap();

    let client = client_communicator();
    let proxy = client
        .string_to_proxy(&target.to_proxy_string().unwrap())
        .unwrap();
    proxy.ping().await.unwrap();

    server.adapter.hold();
    server.adapter.wait_for_hold().await;
    let call = {
        let proxy = proxy.clone();
        tokio::spawn(async move { proxy.invoke("work", OperationMode::Normal, Bytes::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    server.adapter.deactivate().await;
    assert!(call.await.unwrap().is_err());
    assert_eq!(started.load(Ordering::SeqCst), 0);

    server.stop().await;
    client.destroy().await;
}

/// Test: default servants answer for any identity of their category
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_default_servant() {
    init_logging();

    let server = EchoServer::start("tcp -h 127.0.0.1 -p 0").await.unwrap();
    let whoami = |tag: &'static str| {
        ServantBuilder::new()
            .operation("whoami", move |current: Current, _| async move {
                Ok(Bytes::from(format!("{}:{}", tag, current.identity)))
            })
            .build()
    };
    server
        .adapter
        .add_default_servant(whoami("foo"), "foo")
        .unwrap();

    let client = client_communicator();
    let base = client.string_to_proxy(&server.proxy_string()).unwrap();

    let reply = base
        .with_identity(Identity::new("foo", "baz"))
        .invoke("whoami", OperationMode::Normal, Bytes::new())
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"foo:foo/baz"));

    // other categories are not covered
    assert!(matches!(
        base.with_identity(Identity::new("bar", "baz"))
            .invoke("whoami", OperationMode::Normal, Bytes::new())
            .await,
        Err(RpcError::ObjectNotExist { .. })
    ));

    // until a catch-all default servant is added
    server.adapter.add_default_servant(whoami("any"), "").unwrap();
    let reply = base
        .with_identity(Identity::new("bar", "baz"))
        .invoke("whoami", OperationMode::Normal, Bytes::new())
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"any:bar/baz"));

    // explicit registrations win over default servants
    server
        .adapter
        .add(echo_servant(), Identity::new("foo", "x"))
        .unwrap();
    let reply = echo(&base.with_identity(Identity::new("foo", "x")), b"e").await;
    assert_eq!(reply.unwrap(), Bytes::from_static(b"e"));
    assert!(matches!(
        server.adapter.add_default_servant(whoami("foo"), "foo"),
        Err(RpcError::AlreadyRegistered { .. })
    ));

    server.stop().await;
    client.destroy().await;
}

/// Test: facets are addressed separately from the default facet
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_facets() {
    init_logging();

    let server = EchoServer::start("tcp -h 127.0.0.1 -p 0").await.unwrap();
    let stats = ServantBuilder::new()
        .operation("count", |_, _| async { Ok(Bytes::from_static(b"7")) })
        .build();
    server
        .adapter
        .add_facet(stats, Identity::named("test"), "stats")
        .unwrap();

    let client = client_communicator();
    let proxy = client.string_to_proxy(&server.proxy_string()).unwrap();

    let reply = proxy
        .with_facet("stats")
        .invoke("count", OperationMode::Normal, Bytes::new())
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"7"));
    assert!(matches!(
        proxy.invoke("count", OperationMode::Normal, Bytes::new()).await,
        Err(RpcError::OperationNotExist { .. })
    ));

    let facets = server.adapter.find_all_facets(&Identity::named("test"));
    assert_eq!(facets.len(), 2);
    server
        .adapter
        .remove_facet(&Identity::named("test"), "stats")
        .unwrap();
    assert!(matches!(
        proxy
            .with_facet("stats")
            .invoke("count", OperationMode::Normal, Bytes::new())
            .await,
        Err(RpcError::FacetNotExist { .. })
    ));
    assert!(matches!(
        server.adapter.remove_facet(&Identity::named("test"), "stats"),
        Err(RpcError::NotRegistered { .. })
    ));

    server.stop().await;
    client.destroy().await;
}

#[derive(Default)]
struct CountingLocator {
    located: AtomicUsize,
    finished: AtomicUsize,
    finished_with_servant: AtomicUsize,
    cookies: Mutex<Vec<String>>,
    deactivated: Mutex<Vec<String>>,
}

#[async_trait]
impl ServantLocator for CountingLocator {
    async fn locate(&self, current: &Current) -> floe::Result<Located> {
        self.located.fetch_add(1, Ordering::SeqCst);
        match current.identity.name.as_str() {
            "panics" => Ok(Located::with_cookie(echo_servant(), current.identity.name.clone())),
            "echo" => Ok(Located::with_cookie(echo_servant(), current.identity.name.clone())),
            _ => Ok(Located::NotFound),
        }
    }

    async fn finished(
        &self,
        _current: &Current,
        servant: Option<&Arc<dyn Servant>>,
        cookie: Option<Cookie>,
    ) {
        self.finished.fetch_add(1, Ordering::SeqCst);
        if servant.is_some() {
            self.finished_with_servant.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(cookie) = cookie.and_then(|c| c.downcast::<String>().ok()) {
            self.cookies.lock().push(*cookie);
        }
    }

    async fn deactivate(&self, category: &str) {
        self.deactivated.lock().push(category.to_string());
    }
}

/// Test: every locate is paired with one finished, even when the servant
/// panics or nothing is found
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_servant_locator_pairing() {
    init_logging();

    let server = EchoServer::start("tcp -h 127.0.0.1 -p 0").await.unwrap();
    let locator = Arc::new(CountingLocator::default());
    server
        .adapter
        .add_servant_locator(locator.clone(), "loc")
        .unwrap();

    let client = client_communicator();
    let base = client.string_to_proxy(&server.proxy_string()).unwrap();

    let echoed = echo(&base.with_identity(Identity::new("loc", "echo")), b"hi")
        .await
        .unwrap();
    assert_eq!(echoed, Bytes::from_static(b"hi"));

    let panicked = base
        .with_identity(Identity::new("loc", "panics"))
        .invoke("panic", OperationMode::Normal, Bytes::new())
        .await;
    assert!(matches!(panicked, Err(RpcError::Unknown(_))));

    let missing = echo(&base.with_identity(Identity::new("loc", "nobody")), b"x").await;
    assert!(matches!(missing, Err(RpcError::ObjectNotExist { .. })));

    assert!(eventually(|| locator.finished.load(Ordering::SeqCst) == 3).await);
    assert_eq!(locator.located.load(Ordering::SeqCst), 3);
    assert_eq!(locator.finished_with_servant.load(Ordering::SeqCst), 2);
    assert_eq!(
        *locator.cookies.lock(),
        vec!["echo".to_string(), "panics".to_string()]
    );

    server.adapter.destroy().await;
    assert_eq!(*locator.deactivated.lock(), vec!["loc".to_string()]);

    server.stop().await;
    client.destroy().await;
}

/// Test: registration errors and the generated identities of add_with_uuid
#[tokio::test]
async fn test_registration_errors() {
    init_logging();

    let communicator = Communicator::new().unwrap();
    let adapter = communicator.create_object_adapter("").await.unwrap();

    adapter.add(echo_servant(), Identity::named("a")).unwrap();
    assert!(matches!(
        adapter.add(echo_servant(), Identity::named("a")),
        Err(RpcError::AlreadyRegistered { .. })
    ));
    assert!(matches!(
        adapter.add(echo_servant(), Identity::named("")),
        Err(RpcError::InvalidIdentity(_))
    ));
    assert!(matches!(
        adapter.remove(&Identity::named("b")),
        Err(RpcError::NotRegistered { .. })
    ));

    let first = adapter.add_with_uuid(echo_servant()).unwrap();
    let second = adapter.add_with_uuid(echo_servant()).unwrap();
    assert_ne!(first.identity(), second.identity());
    assert!(adapter.find(first.identity()).is_some());

    adapter.remove(&Identity::named("a")).unwrap();
    assert!(adapter.find(&Identity::named("a")).is_none());

    communicator.destroy().await;
}
