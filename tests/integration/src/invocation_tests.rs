//! Invocation Tests - twoway, oneway, batch and failure reporting over TCP
//!
//! Every test runs a server communicator and a separate client
//! communicator, so requests really travel over a socket.

mod common;

use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use common::*;
use floe::{
    Identity, InvocationOptions, OperationMode, Properties, RpcError, ServantBuilder,
    TimeoutKind,
};

/// Test: echo through a well-known port, then failure once the server is gone
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_echo_then_deactivate() {
    init_logging();

    let server = EchoServer::start("tcp -h localhost -p 4061").await.unwrap();
    // one retry, so a request racing the server's close lands on a fresh connect
    let client = client_with(Properties::new().with("Floe.RetryIntervals", "0"));
    let proxy = client.string_to_proxy("test:tcp -h localhost -p 4061").unwrap();

    let reply = echo(&proxy, b"hello").await.unwrap();
    assert_eq!(reply, Bytes::from_static(b"hello"));
    assert!(proxy.ice_is_a(ECHO_TYPE_ID).await.unwrap());
    assert_eq!(proxy.ice_id().await.unwrap(), ECHO_TYPE_ID);

    server.adapter.deactivate().await;

    let err = echo(&proxy, b"again").await.unwrap_err();
    assert!(
        matches!(err, RpcError::ConnectFailed { .. } | RpcError::ConnectionLost(_)),
        "unexpected error: {}",
        err
    );

    server.stop().await;
    client.destroy().await;
}

/// Test: routing failures come back as the matching error kinds
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_routing_errors() {
    init_logging();

    let server = EchoServer::start("tcp -h 127.0.0.1 -p 0").await.unwrap();
    let client = client_communicator();
    let proxy = client.string_to_proxy(&server.proxy_string()).unwrap();

    let missing = proxy.with_identity(Identity::named("missing"));
    match echo(&missing, b"x").await {
        Err(RpcError::ObjectNotExist { identity, operation, .. }) => {
            assert_eq!(identity, Identity::named("missing"));
            assert_eq!(operation, "echo");
        }
        other => panic!("expected ObjectNotExist, got {:?}", other),
    }

    let facet = proxy.with_facet("nope");
    assert!(matches!(
        echo(&facet, b"x").await,
        Err(RpcError::FacetNotExist { .. })
    ));

    assert!(matches!(
        proxy.invoke("frobnicate", OperationMode::Normal, Bytes::new()).await,
        Err(RpcError::OperationNotExist { .. })
    ));

    server.stop().await;
    client.destroy().await;
}

/// Test: user exceptions and servant panics
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_user_exception_and_panic() {
    init_logging();

    let server = EchoServer::start("tcp -h 127.0.0.1 -p 0").await.unwrap();
    let client = client_communicator();
    let proxy = client.string_to_proxy(&server.proxy_string()).unwrap();

    match proxy
        .invoke("fail", OperationMode::Normal, Bytes::from_static(b"boom"))
        .await
    {
        Err(RpcError::User(payload)) => assert_eq!(payload, Bytes::from_static(b"boom")),
        other => panic!("expected user exception, got {:?}", other),
    }

    assert!(matches!(
        proxy.invoke("panic", OperationMode::Normal, Bytes::new()).await,
        Err(RpcError::Unknown(_))
    ));

    // the connection survives both
    assert_eq!(echo(&proxy, b"ok").await.unwrap(), Bytes::from_static(b"ok"));

    server.stop().await;
    client.destroy().await;
}

/// Test: oneway requests are dispatched without a reply
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oneway() {
    init_logging();

    let server = EchoServer::start("tcp -h 127.0.0.1 -p 0").await.unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let servant = ServantBuilder::new()
        .operation("tick", move |current, _| {
            let counter = counter.clone();
            async move {
                assert!(current.is_oneway());
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Bytes::new())
            }
        })
        .build();
    let ticker = server.adapter.add(servant, Identity::named("ticker")).unwrap();

    let client = client_communicator();
    let proxy = client
        .string_to_proxy(&ticker.to_proxy_string().unwrap())
        .unwrap()
        .with_oneway();

    for _ in 0..10 {
        let reply = proxy
            .invoke("tick", OperationMode::Normal, Bytes::new())
            .await
            .unwrap();
        assert!(reply.is_empty());
    }

    assert!(eventually(|| calls.load(Ordering::SeqCst) == 10).await);

    server.stop().await;
    client.destroy().await;
}

/// Test: batched requests are queued until flushed and dispatched in order
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_batch_flush() {
    init_logging();

    let server = EchoServer::start("tcp -h 127.0.0.1 -p 0").await.unwrap();
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let log = seen.clone();
    let servant = ServantBuilder::new()
        .operation("record", move |_, params: Bytes| {
            let log = log.clone();
            async move {
                log.lock().push(params);
                Ok(Bytes::new())
            }
        })
        .build();
    let recorder = server
        .adapter
        .add(servant, Identity::named("recorder"))
        .unwrap();

    let client = client_communicator();
    let batch = client
        .string_to_proxy(&recorder.to_proxy_string().unwrap())
        .unwrap()
        .with_batch();

    for payload in [&b"a"[..], b"b", b"c"] {
        batch
            .invoke("record", OperationMode::Normal, Bytes::from_static(payload))
            .await
            .unwrap();
    }
    assert_eq!(batch.queued_batch_requests(), 3);
    assert!(seen.lock().is_empty());

    batch.flush_batch_requests().await.unwrap();
    assert_eq!(batch.queued_batch_requests(), 0);

    assert!(eventually(|| seen.lock().len() == 3).await);
    assert_eq!(
        *seen.lock(),
        vec![
            Bytes::from_static(b"a"),
            Bytes::from_static(b"b"),
            Bytes::from_static(b"c")
        ]
    );

    server.stop().await;
    client.destroy().await;
}

/// Test: the invocation deadline bounds a slow dispatch
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invocation_timeout() {
    init_logging();

    let server = EchoServer::start("tcp -h 127.0.0.1 -p 0").await.unwrap();
    let client = client_communicator();
    let proxy = client
        .string_to_proxy(&server.proxy_string())
        .unwrap()
        .with_invocation_timeout(Some(Duration::from_millis(100)));

    let err = proxy
        .invoke("sleep", OperationMode::Idempotent, millis_param(2_000))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout(TimeoutKind::Invocation)));

    // the late reply is discarded and the connection stays usable
    let fast = proxy.with_invocation_timeout(None);
    assert_eq!(echo(&fast, b"still").await.unwrap(), Bytes::from_static(b"still"));

    server.stop().await;
    client.destroy().await;
}

/// Test: a cancelled invocation leaves no pending request behind
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancellation_releases_pending_request() {
    init_logging();

    let server = EchoServer::start("tcp -h 127.0.0.1 -p 0").await.unwrap();
    let client = client_communicator();
    let proxy = client.string_to_proxy(&server.proxy_string()).unwrap();
    let connection = proxy.get_connection().await.unwrap().expect("networked");

    let token = CancellationToken::new();
    let call = {
        let proxy = proxy.clone();
        let options = InvocationOptions::new().cancel(token.clone());
        tokio::spawn(async move {
            proxy
                .invoke_with("sleep", OperationMode::Normal, millis_param(1_000), options)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(connection.pending_request_count(), 1);
    token.cancel();

    assert!(matches!(call.await.unwrap(), Err(RpcError::Cancelled)));
    assert_eq!(connection.pending_request_count(), 0);

    server.stop().await;
    client.destroy().await;
}

/// Test: twoway calls cannot use a datagram endpoint
#[tokio::test]
async fn test_twoway_over_udp_is_rejected() {
    init_logging();

    let client = client_communicator();
    let proxy = client.string_to_proxy("test:udp -h 127.0.0.1 -p 4062").unwrap();
    assert!(matches!(
        echo(&proxy, b"x").await,
        Err(RpcError::TwowayOverDatagram)
    ));
    client.destroy().await;
}

/// Test: datagram requests reach a udp endpoint
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_datagram_delivery() {
    init_logging();

    let server = EchoServer::start("udp -h 127.0.0.1 -p 0").await.unwrap();
    let received = Arc::new(tokio::sync::Notify::new());
    let notify = received.clone();
    let servant = ServantBuilder::new()
        .operation("hello", move |_, _| {
            let notify = notify.clone();
            async move {
                notify.notify_one();
                Ok(Bytes::new())
            }
        })
        .build();
    let target = server.adapter.add(servant, Identity::named("dgram")).unwrap();

    let client = client_communicator();
    let proxy = client
        .string_to_proxy(&target.to_proxy_string().unwrap())
        .unwrap()
        .with_datagram();

    // datagrams may be dropped; resend until one lands
    let delivered = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            proxy
                .invoke("hello", OperationMode::Normal, Bytes::new())
                .await
                .unwrap();
            if tokio::time::timeout(Duration::from_millis(200), received.notified())
                .await
                .is_ok()
            {
                break;
            }
        }
    })
    .await;
    assert!(delivered.is_ok());

    server.stop().await;
    client.destroy().await;
}
