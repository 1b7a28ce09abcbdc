//! Echo Server
//!
//! Hosts a single `echo` object. Every request payload is sent back
//! unchanged; the `shutdown` operation stops the server.
//!
//! Usage:
//!   echo-server [--protocol tcp|udp|ssl] [--host HOST] [--port PORT]
//!               [--prop Floe.Key=Value ...]

mod common;

use bytes::Bytes;
use clap::Parser;
use common::*;
use floe::{Communicator, Identity, ServantBuilder};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "echo-server")]
#[command(version)]
#[command(about = "Echo server built on floe", long_about = None)]
struct Args {
    /// Transport to listen on
    #[arg(short, long, value_enum, default_value = "tcp")]
    protocol: Protocol,

    /// Address to bind
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,

    /// Port to listen on (0 picks a free port)
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Extra communicator property as KEY=VALUE, repeatable
    #[arg(long = "prop", value_name = "KEY=VALUE")]
    props: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing("info");

    let args = Args::parse();
    let (communicator, _) = Communicator::initialize(property_args(&args.props))?;

    let endpoints = args.protocol.endpoint(&args.host, args.port);
    let adapter = communicator
        .create_object_adapter_with_endpoints(ADAPTER_NAME, &endpoints)
        .await?;

    let served = Arc::new(AtomicU64::new(0));
    let counter = served.clone();
    let stopper = communicator.clone();
    let servant = ServantBuilder::new()
        .type_id(ECHO_TYPE_ID)
        .operation(OP_ECHO, move |current, params: Bytes| {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(request = n, operation = %current.operation, bytes = params.len(), "echo");
                Ok(params)
            }
        })
        .operation(OP_SHUTDOWN, move |_, _| {
            let stopper = stopper.clone();
            async move {
                info!("shutdown requested by client");
                stopper.shutdown();
                Ok(Bytes::new())
            }
        })
        .build();

    let proxy = adapter.add(servant, Identity::named(ECHO_IDENTITY))?;
    adapter.activate()?;

    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║                     Floe Echo Server                       ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    for endpoint in adapter.endpoints() {
        println!("  listening on {}", endpoint);
    }
    println!("  proxy: {}", proxy.to_proxy_string()?);
    println!("  press Ctrl+C to stop");

    tokio::select! {
        _ = communicator.wait_for_shutdown() => {}
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("interrupted");
        }
    }

    communicator.destroy().await;
    println!("served {} echo requests", served.load(Ordering::Relaxed));
    Ok(())
}
