//! Definitions shared by the echo server and client

#![allow(dead_code)]

use clap::ValueEnum;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 4061;

pub const ECHO_IDENTITY: &str = "echo";
pub const ECHO_TYPE_ID: &str = "::Demo::Echo";
pub const ADAPTER_NAME: &str = "Echo";

pub const OP_ECHO: &str = "echo";
pub const OP_SHUTDOWN: &str = "shutdown";

/// Transport used between client and server
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Protocol {
    /// Connection-oriented, reliable (default)
    Tcp,
    /// Datagrams; oneway and datagram invocations only
    Udp,
    /// TCP with TLS; needs Floe.SSL.* properties
    Ssl,
}

impl Protocol {
    pub fn endpoint(&self, host: &str, port: u16) -> String {
        let transport = match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Ssl => "ssl",
        };
        format!("{} -h {} -p {}", transport, host, port)
    }
}

/// Turn `KEY=VALUE` options into the `--KEY=VALUE` arguments the
/// communicator understands.
pub fn property_args(props: &[String]) -> Vec<String> {
    props.iter().map(|p| format!("--{}", p)).collect()
}

/// Log to stderr, filtered by `RUST_LOG` (default `warn`).
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
