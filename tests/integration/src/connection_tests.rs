//! Connection Tests - bidirectional use, close modes, idle timeout and
//! message size limits

mod common;

use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use floe::{
    CloseMode, ConnectionState, Identity, OperationMode, Properties, RpcError, ServantBuilder,
};

/// Test: a server calls back into the client over the client's own
/// connection
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bidirectional_callback() {
    init_logging();

    let server = EchoServer::start("tcp -h 127.0.0.1 -p 0").await.unwrap();
    let registrar = ServantBuilder::new()
        .operation("register", |current, params: Bytes| async move {
            let connection = current
                .connection
                .clone()
                .ok_or_else(|| RpcError::Unknown("register needs a connection".to_string()))?;
            let name = String::from_utf8_lossy(&params).into_owned();
            let callback = connection.create_proxy(Identity::new("callback", name))?;
            assert!(callback.is_fixed());
            assert!(matches!(
                callback.to_proxy_string(),
                Err(RpcError::FixedProxyRequiresConnection)
            ));
            callback
                .invoke("notify", OperationMode::Normal, Bytes::from_static(b"ping"))
                .await
        })
        .build();
    let registrar = server
        .adapter
        .add(registrar, Identity::named("registrar"))
        .unwrap();

    let client = client_communicator();
    let notified = Arc::new(AtomicUsize::new(0));
    let counter = notified.clone();
    let callbacks = client.create_object_adapter("").await.unwrap();
    callbacks
        .add(
            ServantBuilder::new()
                .operation("notify", move |_, params: Bytes| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(params)
                    }
                })
                .build(),
            Identity::new("callback", "me"),
        )
        .unwrap();
    callbacks.activate().unwrap();

    let proxy = client
        .string_to_proxy(&registrar.to_proxy_string().unwrap())
        .unwrap();
    let connection = proxy.get_connection().await.unwrap().unwrap();
    assert!(!connection.is_incoming());
    connection.set_adapter(Some(callbacks.clone()));

    let reply = proxy
        .invoke("register", OperationMode::Normal, Bytes::from_static(b"me"))
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"ping"));
    assert_eq!(notified.load(Ordering::SeqCst), 1);

    // without an adapter the callback is refused
    connection.set_adapter(None);
    assert!(matches!(
        proxy
            .invoke("register", OperationMode::Normal, Bytes::from_static(b"me"))
            .await,
        Err(RpcError::ObjectAdapterNotFound(_))
    ));

    server.stop().await;
    client.destroy().await;
}

/// Test: a forceful close fails pending requests
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_forceful_close_aborts_pending() {
    init_logging();

    let server = EchoServer::start("tcp -h 127.0.0.1 -p 0").await.unwrap();
    let client = client_communicator();
    let proxy = client.string_to_proxy(&server.proxy_string()).unwrap();
    let connection = proxy.get_connection().await.unwrap().unwrap();

    let call = {
        let proxy = proxy.clone();
        tokio::spawn(async move {
            proxy
                .invoke("sleep", OperationMode::Normal, millis_param(1_000))
                .await
        })
    };
    assert!(eventually(|| connection.pending_request_count() == 1).await);

    connection.close(CloseMode::Forcefully).await;
    assert!(matches!(
        call.await.unwrap(),
        Err(RpcError::ConnectionAborted(_))
    ));
    assert_eq!(connection.state(), ConnectionState::Closed);

    // the next invocation opens a fresh connection
    assert_eq!(echo(&proxy, b"new").await.unwrap(), Bytes::from_static(b"new"));
    let fresh = proxy.get_connection().await.unwrap().unwrap();
    assert_ne!(fresh.id(), connection.id());

    server.stop().await;
    client.destroy().await;
}

/// Test: closing gracefully with wait lets pending replies arrive first
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_graceful_close_waits_for_replies() {
    init_logging();

    let server = EchoServer::start("tcp -h 127.0.0.1 -p 0").await.unwrap();
    let client = client_communicator();
    let proxy = client.string_to_proxy(&server.proxy_string()).unwrap();
    let connection = proxy.get_connection().await.unwrap().unwrap();

    let call = {
        let proxy = proxy.clone();
        tokio::spawn(async move {
            proxy
                .invoke("sleep", OperationMode::Normal, millis_param(300))
                .await
        })
    };
    assert!(eventually(|| connection.pending_request_count() == 1).await);

    connection.close(CloseMode::GracefullyWithWait).await;
    assert_eq!(call.await.unwrap().unwrap(), millis_param(300));
    assert!(connection.is_closed());

    server.stop().await;
    client.destroy().await;
}

/// Test: a connection with no traffic is closed after the idle timeout
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_idle_timeout() {
    init_logging();

    let server = EchoServer::start("tcp -h 127.0.0.1 -p 0").await.unwrap();
    let client = client_with(Properties::new().with("Floe.Connection.IdleTimeout", "200"));
    let proxy = client.string_to_proxy(&server.proxy_string()).unwrap();
    proxy.ping().await.unwrap();
    let connection = proxy.get_connection().await.unwrap().unwrap();

    assert!(eventually(|| connection.is_closed()).await);
    assert!(echo(&proxy, b"again").await.is_ok());

    server.stop().await;
    client.destroy().await;
}

/// Test: oversized requests are refused before they reach the wire, and
/// the server drops peers that send oversized frames
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_message_size_max() {
    init_logging();

    let server_properties = Properties::new().with("Floe.MessageSizeMax", "1");
    let server = EchoServer::start_on(
        floe::Communicator::with_properties(server_properties).unwrap(),
        "tcp -h 127.0.0.1 -p 0",
    )
    .await
    .unwrap();

    let big = Bytes::from(vec![7u8; 4 * 1024]);

    let strict = client_with(Properties::new().with("Floe.MessageSizeMax", "1"));
    let proxy = strict.string_to_proxy(&server.proxy_string()).unwrap();
    let err = proxy
        .invoke("echo", OperationMode::Normal, big.clone())
        .await
        .unwrap_err();
    assert!(err.is_protocol_error(), "got {}", err);
    assert!(echo(&proxy, b"small").await.is_ok());

    let lax = client_communicator();
    let proxy = lax.string_to_proxy(&server.proxy_string()).unwrap();
    assert!(proxy
        .invoke("echo", OperationMode::Normal, big)
        .await
        .is_err());

    server.stop().await;
    strict.destroy().await;
    lax.destroy().await;
}

/// Test: a request still waiting for a dispatch slot when the server
/// closes the connection gracefully is discarded, so the client's
/// ConnectionClosed retry cannot run it twice
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_graceful_close_discards_queued_request() {
    init_logging();

    let properties = Properties::new()
        .with("Single.Endpoints", "tcp -h 127.0.0.1 -p 0")
        .with("Single.MaxDispatches", "1");
    let server = floe::Communicator::with_properties(properties).unwrap();
    let adapter = server.create_object_adapter("Single").await.unwrap();

    let started = Arc::new(AtomicUsize::new(0));
    let incoming = Arc::new(parking_lot::Mutex::new(None));
    let (counter, slot) = (started.clone(), incoming.clone());
    let servant = ServantBuilder::new()
        .operation("work", move |current, _| {
            let (counter, slot) = (counter.clone(), slot.clone());
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                *slot.lock() = current.connection.clone();
                tokio::time::sleep(Duration::from_millis(300)).await;
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
    let call = |proxy: floe::ObjectPrx| {
        tokio::spawn(async move { proxy.invoke("work", OperationMode::Normal, Bytes::new()).await })
    };
    let first = call(proxy.clone());
    assert!(eventually(|| incoming.lock().is_some()).await);
    let second = call(proxy.clone());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let connection = incoming.lock().clone().unwrap();
    connection.close(CloseMode::Gracefully).await;

    assert!(first.await.unwrap().is_ok());
    assert!(matches!(
        second.await.unwrap(),
        Err(RpcError::ConnectionClosed)
    ));
    assert_eq!(started.load(Ordering::SeqCst), 1);

    server.destroy().await;
    client.destroy().await;
}
