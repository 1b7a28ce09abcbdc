//! Retry Tests - how connection failures are classified and retried
//!
//! A raw TCP listener plays a misbehaving server so each failure mode can
//! be produced on demand and the number of connection attempts counted.

mod common;

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use common::*;
use floe::{OperationMode, Properties, RpcError};
use floe_proto::{FrameTransport, Message};

#[derive(Clone, Copy)]
enum Misbehavior {
    /// Accept and drop before validation
    DropOnAccept,
    /// Validate, read one request, then drop the socket
    DropAfterRequest,
    /// Validate, read one request, then close gracefully
    CloseAfterRequest,
}

/// Start a listener that misbehaves on every connection and counts them.
async fn misbehaving_server(behavior: Misbehavior) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut transport = FrameTransport::new(stream);
                match behavior {
                    Misbehavior::DropOnAccept => {}
                    Misbehavior::DropAfterRequest => {
                        let validate = Message::ValidateConnection.encode();
                        if transport.write_message(&validate).await.is_ok() {
                            let _ = transport.read_message().await;
                        }
                    }
                    Misbehavior::CloseAfterRequest => {
                        let validate = Message::ValidateConnection.encode();
                        if transport.write_message(&validate).await.is_ok()
                            && transport.read_message().await.is_ok()
                        {
                            let close = Message::CloseConnection.encode();
                            let _ = transport.write_message(&close).await;
                        }
                    }
                }
            });
        }
    });

    (addr, accepted)
}

fn retrying_client(retries: &str) -> floe::Communicator {
    client_with(Properties::new().with("Floe.RetryIntervals", retries))
}

fn proxy_for(client: &floe::Communicator, addr: SocketAddr) -> floe::ObjectPrx {
    client
        .string_to_proxy(&format!("test:tcp -h 127.0.0.1 -p {}", addr.port()))
        .unwrap()
}

/// Test: a connect failure is retried once per configured interval
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_failure_uses_every_retry() {
    init_logging();

    let (addr, accepted) = misbehaving_server(Misbehavior::DropOnAccept).await;
    let client = retrying_client("0 0 0");
    let proxy = proxy_for(&client, addr);

    let err = echo(&proxy, b"x").await.unwrap_err();
    assert!(matches!(err, RpcError::ConnectFailed { .. }), "got {}", err);
    assert_eq!(accepted.load(Ordering::SeqCst), 4);

    client.destroy().await;
}

/// Test: `-1` disables retries
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_retries_disabled() {
    init_logging();

    let (addr, accepted) = misbehaving_server(Misbehavior::DropOnAccept).await;
    let client = retrying_client("-1");
    let proxy = proxy_for(&client, addr);

    assert!(echo(&proxy, b"x").await.is_err());
    assert_eq!(accepted.load(Ordering::SeqCst), 1);

    client.destroy().await;
}

/// Test: a lost connection after the request was written is only retried
/// for idempotent operations
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lost_after_send_respects_idempotence() {
    init_logging();

    let (addr, accepted) = misbehaving_server(Misbehavior::DropAfterRequest).await;
    let client = retrying_client("0 0 0");
    let proxy = proxy_for(&client, addr);

    let err = proxy
        .invoke("echo", OperationMode::Normal, Bytes::from_static(b"x"))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::ConnectionLost(_)), "got {}", err);
    assert_eq!(accepted.load(Ordering::SeqCst), 1);

    let err = proxy
        .invoke("echo", OperationMode::Idempotent, Bytes::from_static(b"x"))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::ConnectionLost(_)), "got {}", err);
    assert_eq!(accepted.load(Ordering::SeqCst), 1 + 4);

    client.destroy().await;
}

/// Test: a graceful close by the peer is always retried
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_peer_close_is_retried() {
    init_logging();

    let (addr, accepted) = misbehaving_server(Misbehavior::CloseAfterRequest).await;
    let client = retrying_client("0 0");
    let proxy = proxy_for(&client, addr);

    let err = proxy
        .invoke("echo", OperationMode::Normal, Bytes::from_static(b"x"))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::ConnectionClosed), "got {}", err);
    assert_eq!(accepted.load(Ordering::SeqCst), 3);

    client.destroy().await;
}

/// Test: a server that comes up during the retry window is reached
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_retry_reaches_late_server() {
    init_logging();

    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let endpoints = format!("tcp -h 127.0.0.1 -p {}", port);
    let server = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        EchoServer::start(&endpoints).await.unwrap()
    });

    let client = retrying_client("200 200 200 200 200 200");
    let proxy = client
        .string_to_proxy(&format!("test:tcp -h 127.0.0.1 -p {}", port))
        .unwrap();
    assert_eq!(echo(&proxy, b"late").await.unwrap(), Bytes::from_static(b"late"));

    server.await.unwrap().stop().await;
    client.destroy().await;
}

/// Test: the next endpoint of the same proxy is tried when one is down
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failover_to_next_endpoint() {
    init_logging();

    let dead = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let server = EchoServer::start("tcp -h 127.0.0.1 -p 0").await.unwrap();
    let live = server.adapter.endpoints()[0].port();

    let client = client_communicator();
    let proxy = client
        .string_to_proxy(&format!(
            "test:tcp -h 127.0.0.1 -p {}:tcp -h 127.0.0.1 -p {}",
            dead, live
        ))
        .unwrap();
    assert_eq!(echo(&proxy, b"x").await.unwrap(), Bytes::from_static(b"x"));

    let connection = proxy.get_connection().await.unwrap().unwrap();
    assert_eq!(connection.endpoint().port(), live);

    server.stop().await;
    client.destroy().await;
}
