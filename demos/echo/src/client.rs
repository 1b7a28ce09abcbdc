//! Echo Client
//!
//! Sends a message to the echo server a number of times and reports the
//! round-trip latency.
//!
//! Usage:
//!   echo-client [--protocol tcp|udp|ssl] [--host HOST] [--port PORT]
//!               [--mode twoway|oneway|datagram|batch] [--count N]
//!               [--message TEXT] [--shutdown]

mod common;

use bytes::Bytes;
use clap::{Parser, ValueEnum};
use common::*;
use floe::{Communicator, ObjectPrx, OperationMode};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Twoway,
    Oneway,
    Datagram,
    Batch,
}

#[derive(Parser, Debug)]
#[command(name = "echo-client")]
#[command(version)]
#[command(about = "Echo client built on floe", long_about = None)]
struct Args {
    /// Transport used to reach the server
    #[arg(short, long, value_enum, default_value = "tcp")]
    protocol: Protocol,

    /// Server host
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,

    /// Server port
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Invocation mode
    #[arg(short, long, value_enum, default_value = "twoway")]
    mode: Mode,

    /// Number of requests to send
    #[arg(short, long, default_value_t = 1)]
    count: u32,

    /// Payload to echo
    #[arg(long, default_value = "Hello, floe!")]
    message: String,

    /// Invocation timeout in milliseconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Ask the server to shut down afterwards
    #[arg(long)]
    shutdown: bool,

    /// Only print the summary
    #[arg(short, long)]
    quiet: bool,

    /// Extra communicator property as KEY=VALUE, repeatable
    #[arg(long = "prop", value_name = "KEY=VALUE")]
    props: Vec<String>,
}

fn make_proxy(communicator: &Communicator, args: &Args) -> floe::Result<ObjectPrx> {
    let endpoint = args.protocol.endpoint(&args.host, args.port);
    let proxy = communicator
        .string_to_proxy(&format!("{}:{}", ECHO_IDENTITY, endpoint))?
        .with_invocation_timeout(args.timeout.map(Duration::from_millis));
    Ok(match args.mode {
        Mode::Twoway => proxy.with_twoway(),
        Mode::Oneway => proxy.with_oneway(),
        Mode::Datagram => proxy.with_datagram(),
        Mode::Batch => proxy.with_batch(),
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing("warn");

    let args = Args::parse();
    let (communicator, _) = Communicator::initialize(property_args(&args.props))?;
    let proxy = make_proxy(&communicator, &args)?;
    let payload = Bytes::from(args.message.clone());

    if !args.quiet {
        println!("echo-client -> {}", proxy.to_proxy_string()?);
    }

    let mut latencies = Vec::with_capacity(args.count as usize);
    let mut failures = 0u32;
    let start = Instant::now();
    for i in 0..args.count {
        let sent = Instant::now();
        match proxy
            .invoke(OP_ECHO, OperationMode::Normal, payload.clone())
            .await
        {
            Ok(reply) => {
                latencies.push(sent.elapsed());
                if !args.quiet && matches!(args.mode, Mode::Twoway) {
                    println!("[{}] {}", i + 1, String::from_utf8_lossy(&reply));
                }
            }
            Err(e) => {
                failures += 1;
                eprintln!("[{}] failed: {}", i + 1, e);
            }
        }
    }
    if matches!(args.mode, Mode::Batch) {
        proxy.flush_batch_requests().await?;
    }
    let elapsed = start.elapsed();

    if args.shutdown {
        let control = match args.protocol {
            Protocol::Udp => proxy.with_datagram(),
            _ => proxy.with_twoway(),
        };
        if let Err(e) = control
            .invoke(OP_SHUTDOWN, OperationMode::Normal, Bytes::new())
            .await
        {
            eprintln!("shutdown failed: {}", e);
        }
    }

    println!(
        "{} sent, {} failed in {:?}",
        args.count - failures,
        failures,
        elapsed
    );
    if !latencies.is_empty() {
        let total: Duration = latencies.iter().sum();
        let max = latencies.iter().max().copied().unwrap_or_default();
        println!(
            "latency avg {:?}, max {:?}",
            total / latencies.len() as u32,
            max
        );
    }

    communicator.destroy().await;
    if failures > 0 {
        return Err(format!("{} requests failed", failures).into());
    }
    Ok(())
}
