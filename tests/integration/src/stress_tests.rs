//! Stress Tests - concurrency at scale
//!
//! These tests look for races in request id allocation, reply correlation
//! and connection sharing by:
//! - multiplexing many concurrent invocations over one connection
//! - running many independent client communicators against one server
//! - mixing slow and fast requests so replies arrive out of order

mod common;

use bytes::Bytes;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Barrier;

use common::*;
use floe::OperationMode;

/// Test: many tasks share one connection and every reply reaches its caller
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_multiplexed_invocations() {
    init_logging();

    const TASKS: usize = 50;
    const REQUESTS_PER_TASK: usize = 100;

    let server = EchoServer::start("tcp -h 127.0.0.1 -p 0").await.unwrap();
    let client = client_communicator();
    let proxy = client.string_to_proxy(&server.proxy_string()).unwrap();
    proxy.ping().await.unwrap();

    let stats = Arc::new(ConcurrentStats::new());
    let barrier = Arc::new(Barrier::new(TASKS));
    let handles = (0..TASKS).map(|task| {
        let proxy = proxy.clone();
        let stats = stats.clone();
        let barrier = barrier.clone();
        tokio::spawn(async move {
            barrier.wait().await;
            for request in 0..REQUESTS_PER_TASK {
                let payload = Bytes::from(format!("task_{}_request_{}", task, request));
                let start = Instant::now();
                match proxy
                    .invoke("echo", OperationMode::Normal, payload.clone())
                    .await
                {
                    Ok(reply) if reply == payload => stats.record_success(start.elapsed()),
                    Ok(_) => {
                        eprintln!("task {} request {}: mismatched reply", task, request);
                        stats.record_failure();
                    }
                    Err(e) => {
                        eprintln!("task {} request {} failed: {}", task, request, e);
                        stats.record_failure();
                    }
                }
            }
        })
    });
    join_all(handles).await;

    let expected = (TASKS * REQUESTS_PER_TASK) as u64;
    println!("\n=== Multiplexed Invocations ===");
    println!("Successful: {} / {}", stats.success_count(), expected);
    println!("Avg latency: {:?}", stats.avg_latency());
    println!("Max latency: {:?}", stats.max_latency());

    assert_eq!(stats.success_count(), expected);
    assert_eq!(stats.failure_count(), 0);

    let connection = proxy.get_connection().await.unwrap().unwrap();
    assert_eq!(connection.pending_request_count(), 0);

    let snapshot = server.adapter.stats().snapshot();
    assert!(snapshot.requests_dispatched >= expected);

    server.stop().await;
    client.destroy().await;
}

/// Test: many client communicators, each with its own connection
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_many_clients() {
    init_logging();

    const CLIENTS: usize = 20;
    const REQUESTS_PER_CLIENT: usize = 50;

    let server = EchoServer::start("tcp -h 127.0.0.1 -p 0").await.unwrap();
    let proxy_string = server.proxy_string();
    let stats = Arc::new(ConcurrentStats::new());

    let handles = (0..CLIENTS).map(|client_id| {
        let proxy_string = proxy_string.clone();
        let stats = stats.clone();
        tokio::spawn(async move {
            let client = client_communicator();
            let proxy = client.string_to_proxy(&proxy_string).unwrap();
            for request in 0..REQUESTS_PER_CLIENT {
                let payload = Bytes::from(format!("client_{}_request_{}", client_id, request));
                let start = Instant::now();
                match proxy
                    .invoke("echo", OperationMode::Normal, payload.clone())
                    .await
                {
                    Ok(reply) if reply == payload => stats.record_success(start.elapsed()),
                    _ => stats.record_failure(),
                }
            }
            client.destroy().await;
        })
    });
    join_all(handles).await;

    let expected = (CLIENTS * REQUESTS_PER_CLIENT) as u64;
    println!("\n=== Many Clients ===");
    println!("Successful: {} / {}", stats.success_count(), expected);
    println!("Avg latency: {:?}", stats.avg_latency());

    assert_eq!(stats.success_count(), expected);
    assert!(server.adapter.stats().snapshot().connections_accepted >= CLIENTS as u64);

    server.stop().await;
}

/// Test: slow and fast requests interleave and replies arrive out of order
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_out_of_order_replies() {
    init_logging();

    let server = EchoServer::start("tcp -h 127.0.0.1 -p 0").await.unwrap();
    let client = client_communicator();
    let proxy = client.string_to_proxy(&server.proxy_string()).unwrap();

    let calls = (0..40u64).map(|i| {
        let proxy = proxy.clone();
        async move {
            let delay = (40 - i) * 5;
            let reply = proxy
                .invoke("sleep", OperationMode::Normal, millis_param(delay))
                .await
                .unwrap();
            assert_eq!(reply, millis_param(delay));
        }
    });
    join_all(calls).await;

    server.stop().await;
    client.destroy().await;
}
