//! Typed configuration read from [`Properties`]

use crate::properties::Properties;
use floe_proto::{EncodingVersion, DEFAULT_MESSAGE_SIZE_MAX, ENCODING_1_1};
use std::time::Duration;
use tracing::warn;

/// Default endpoint timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: i64 = 60_000;

/// Dispatch limit used when an adapter sets no `MaxDispatches`
pub const UNLIMITED_DISPATCHES: u32 = 1 << 24;

/// Order in which a reference's endpoints are tried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EndpointSelection {
    #[default]
    Ordered,
    Random,
}

/// Per-connection settings
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Bound on connect + validation
    pub connect_timeout: Duration,
    /// Bound on graceful close
    pub close_timeout: Duration,
    /// Close connections idle this long; `None` disables the monitor
    pub idle_timeout: Option<Duration>,
    /// Largest frame accepted or sent
    pub message_size_max: usize,
    /// Dispatch requests of one connection one at a time
    pub serialize_dispatch: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(10),
            idle_timeout: Some(Duration::from_secs(60)),
            message_size_max: DEFAULT_MESSAGE_SIZE_MAX,
            serialize_dispatch: false,
        }
    }
}

/// Communicator-wide settings
#[derive(Debug, Clone)]
pub struct CommunicatorConfig {
    pub default_protocol: String,
    pub default_host: String,
    /// Endpoint timeout when `-t` is omitted; `None` is infinite
    pub default_timeout: Option<Duration>,
    pub invocation_timeout: Option<Duration>,
    pub encoding: EncodingVersion,
    pub endpoint_selection: EndpointSelection,
    pub collocation_optimized: bool,
    /// `None` caches forever, `Some(ZERO)` disables the cache
    pub locator_cache_timeout: Option<Duration>,
    /// Delay before each retry; the length is the retry limit
    pub retry_intervals: Vec<Duration>,
    pub connection: ConnectionOptions,
    pub client_threads: usize,
    pub server_threads: usize,
}

impl Default for CommunicatorConfig {
    fn default() -> Self {
        Self {
            default_protocol: "tcp".to_string(),
            default_host: String::new(),
            default_timeout: Some(Duration::from_millis(DEFAULT_TIMEOUT_MS as u64)),
            invocation_timeout: None,
            encoding: ENCODING_1_1,
            endpoint_selection: EndpointSelection::Ordered,
            collocation_optimized: true,
            locator_cache_timeout: None,
            retry_intervals: vec![Duration::ZERO],
            connection: ConnectionOptions::default(),
            client_threads: 0,
            server_threads: 0,
        }
    }
}

impl CommunicatorConfig {
    pub fn from_properties(props: &Properties) -> Self {
        let defaults = Self::default();
        let connection = ConnectionOptions {
            connect_timeout: millis(props, "Floe.Connection.ConnectTimeout")
                .unwrap_or(Some(defaults.connection.connect_timeout))
                .unwrap_or(Duration::MAX),
            close_timeout: millis(props, "Floe.Connection.CloseTimeout")
                .unwrap_or(Some(defaults.connection.close_timeout))
                .unwrap_or(Duration::MAX),
            idle_timeout: millis(props, "Floe.Connection.IdleTimeout")
                .unwrap_or(defaults.connection.idle_timeout)
                .filter(|d| !d.is_zero()),
            message_size_max: props
                .get_int("Floe.MessageSizeMax")
                .filter(|kb| *kb > 0)
                // frame sizes are i32 on the wire
                .map(|kb| (kb as u64).saturating_mul(1024).min(i32::MAX as u64) as usize)
                .unwrap_or(defaults.connection.message_size_max),
            serialize_dispatch: props.get_int_or("Floe.ThreadPool.Server.Serialize", 0) > 0,
        };

        let endpoint_selection = match props.get("Floe.Default.EndpointSelection") {
            None | Some("Ordered") => EndpointSelection::Ordered,
            Some("Random") => EndpointSelection::Random,
            Some(other) => {
                warn!("unknown endpoint selection `{}`, using Ordered", other);
                EndpointSelection::Ordered
            }
        };

        let encoding = match props.get("Floe.Default.EncodingVersion") {
            None => defaults.encoding,
            Some(v) => EncodingVersion::parse(v).unwrap_or_else(|| {
                warn!("invalid encoding version `{}`, using {}", v, defaults.encoding);
                defaults.encoding
            }),
        };

        let locator_cache_timeout = match props.get_int("Floe.Default.LocatorCacheTimeout") {
            Some(secs) if secs >= 0 => Some(Duration::from_secs(secs as u64)),
            _ => None,
        };

        Self {
            default_protocol: props.get_or("Floe.Default.Protocol", &defaults.default_protocol),
            default_host: props.get_or("Floe.Default.Host", &defaults.default_host),
            default_timeout: millis(props, "Floe.Default.Timeout")
                .unwrap_or(defaults.default_timeout),
            invocation_timeout: millis(props, "Floe.Default.InvocationTimeout")
                .unwrap_or(defaults.invocation_timeout),
            encoding,
            endpoint_selection,
            collocation_optimized: props.get_int_or("Floe.Default.CollocationOptimized", 1) > 0,
            locator_cache_timeout,
            retry_intervals: retry_intervals(props),
            connection,
            client_threads: thread_count(props, "Floe.ThreadPool.Client.Size"),
            server_threads: thread_count(props, "Floe.ThreadPool.Server.Size"),
        }
    }

    /// Number of retries after the first attempt
    pub fn retry_limit(&self) -> usize {
        self.retry_intervals.len()
    }
}

/// Settings of one object adapter, read from `<name>.*`
#[derive(Debug, Clone, Default)]
pub struct AdapterConfig {
    pub endpoints: Option<String>,
    pub published_endpoints: Option<String>,
    pub adapter_id: Option<String>,
    pub max_dispatches: Option<u32>,
}

impl AdapterConfig {
    pub fn from_properties(props: &Properties, name: &str) -> Self {
        if name.is_empty() {
            return Self::default();
        }
        let key = |suffix: &str| format!("{}.{}", name, suffix);
        Self {
            endpoints: props.get(&key("Endpoints")).map(str::to_string),
            published_endpoints: props.get(&key("PublishedEndpoints")).map(str::to_string),
            adapter_id: props.get(&key("AdapterId")).map(str::to_string),
            max_dispatches: props
                .get_int(&key("MaxDispatches"))
                .filter(|n| *n > 0)
                .map(|n| n.min(UNLIMITED_DISPATCHES as i64) as u32),
        }
    }
}

/// `Some(None)` for a negative (infinite) value, `None` when unset.
fn millis(props: &Properties, key: &str) -> Option<Option<Duration>> {
    let v = props.get_int(key)?;
    Some((v >= 0).then(|| Duration::from_millis(v as u64)))
}

fn thread_count(props: &Properties, key: &str) -> usize {
    props.get_int(key).filter(|n| *n > 0).unwrap_or(0) as usize
}

fn retry_intervals(props: &Properties) -> Vec<Duration> {
    let values = props.get_list("Floe.RetryIntervals");
    if values.is_empty() {
        return vec![Duration::ZERO];
    }
    if values[0] == "-1" {
        return Vec::new();
    }
    values
        .iter()
        .filter_map(|v| match v.parse::<i64>() {
            Ok(ms) => Some(Duration::from_millis(ms.max(0) as u64)),
            Err(_) => {
                warn!("ignoring malformed retry interval `{}`", v);
                None
            }
        })
        .collect()
}
