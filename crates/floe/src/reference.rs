//! Immutable invocation targets
//!
//! A [`Reference`] is everything a proxy knows about its target. Proxy
//! strings have the form
//!
//! ```text
//! identity [-f facet] [-t|-o|-O|-d] [-s] [-e X.Y] [-p X.Y] [:endpoint[:endpoint..]]
//! identity [options] @ adapter-id
//! ```
//!
//! A reference with neither endpoints nor an adapter id is *well-known* and
//! is resolved through the locator by identity.

use crate::config::{CommunicatorConfig, EndpointSelection};
use crate::connection::Connection;
use crate::endpoint::{Endpoint, EndpointFactoryRegistry};
use crate::error::{Result, RpcError};
use crate::strings::{find_unquoted, quote, split_args};
use floe_proto::{Context, EncodingVersion, Identity, ProtocolVersion, PROTOCOL_1_0};
use std::fmt::Write;
use std::time::Duration;

/// How requests through a reference are sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvocationMode {
    Twoway,
    Oneway,
    /// Oneway requests queued until flushed
    Batch,
    /// Oneway requests over a datagram transport
    Datagram,
}

impl InvocationMode {
    pub fn is_twoway(&self) -> bool {
        *self == InvocationMode::Twoway
    }

    fn option(&self) -> &'static str {
        match self {
            InvocationMode::Twoway => "-t",
            InvocationMode::Oneway => "-o",
            InvocationMode::Batch => "-O",
            InvocationMode::Datagram => "-d",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    identity: Identity,
    facet: String,
    endpoints: Vec<Endpoint>,
    adapter_id: Option<String>,
    protocol: ProtocolVersion,
    encoding: EncodingVersion,
    mode: InvocationMode,
    secure: bool,
    /// Applied to endpoints obtained from the locator
    compress: Option<bool>,
    endpoint_timeout: Option<Option<Duration>>,
    context: Context,
    invocation_timeout: Option<Duration>,
    collocation_optimized: bool,
    endpoint_selection: EndpointSelection,
    fixed: Option<Connection>,
}

impl Reference {
    /// Well-known twoway reference with the communicator's defaults
    pub fn new(identity: Identity, config: &CommunicatorConfig) -> Result<Self> {
        if identity.name.is_empty() {
            return Err(RpcError::InvalidIdentity(
                "identity name must not be empty".to_string(),
            ));
        }
        Ok(Self {
            identity,
            facet: String::new(),
            endpoints: Vec::new(),
            adapter_id: None,
            protocol: PROTOCOL_1_0,
            encoding: config.encoding,
            mode: InvocationMode::Twoway,
            secure: false,
            compress: None,
            endpoint_timeout: None,
            context: Context::new(),
            invocation_timeout: config.invocation_timeout,
            collocation_optimized: config.collocation_optimized,
            endpoint_selection: config.endpoint_selection,
            fixed: None,
        })
    }

    pub(crate) fn parse(
        input: &str,
        factories: &EndpointFactoryRegistry,
        config: &CommunicatorConfig,
    ) -> Result<Self> {
        let s = input.trim();
        if s.is_empty() {
            return Err(RpcError::invalid_proxy(input, "empty proxy string"));
        }
        let head_end = find_unquoted(s, 0, &[':', '@']).unwrap_or(s.len());
        let args = split_args(&s[..head_end]).map_err(|e| RpcError::invalid_proxy(input, e))?;
        let Some((identity, options)) = args.split_first() else {
            return Err(RpcError::invalid_proxy(input, "missing identity"));
        };
        let identity =
            Identity::parse(identity).map_err(|e| RpcError::invalid_proxy(input, e.to_string()))?;
        let mut reference =
            Self::new(identity, config).map_err(|e| RpcError::invalid_proxy(input, e.to_string()))?;
        reference.apply_options(input, options)?;

        let rest = &s[head_end..];
        if let Some(list) = rest.strip_prefix(':') {
            reference.endpoints = factories
                .parse_list(list)
                .map_err(|e| RpcError::invalid_proxy(input, e.to_string()))?;
        } else if let Some(adapter) = rest.strip_prefix('@') {
            let args = split_args(adapter).map_err(|e| RpcError::invalid_proxy(input, e))?;
            match args.as_slice() {
                [id] if !id.is_empty() => reference.adapter_id = Some(id.clone()),
                [] | [_] => return Err(RpcError::invalid_proxy(input, "empty adapter id")),
                _ => {
                    return Err(RpcError::invalid_proxy(
                        input,
                        "unexpected text after the adapter id",
                    ))
                }
            }
        }
        Ok(reference)
    }

    fn apply_options(&mut self, input: &str, options: &[String]) -> Result<()> {
        let mut iter = options.iter();
        while let Some(option) = iter.next() {
            let mut value = |name: &str| {
                iter.next()
                    .cloned()
                    .ok_or_else(|| RpcError::invalid_proxy(input, format!("no argument for {}", name)))
            };
            match option.as_str() {
                "-f" => self.facet = value("-f")?,
                "-t" => self.mode = InvocationMode::Twoway,
                "-o" => self.mode = InvocationMode::Oneway,
                "-O" => self.mode = InvocationMode::Batch,
                "-d" => self.mode = InvocationMode::Datagram,
                "-s" => self.secure = true,
                "-e" => {
                    let raw = value("-e")?;
                    self.encoding = EncodingVersion::parse(&raw).ok_or_else(|| {
                        RpcError::invalid_proxy(input, format!("invalid encoding `{}`", raw))
                    })?;
                }
                "-p" => {
                    let raw = value("-p")?;
                    self.protocol = ProtocolVersion::parse(&raw).ok_or_else(|| {
                        RpcError::invalid_proxy(input, format!("invalid protocol `{}`", raw))
                    })?;
                }
                other => {
                    return Err(RpcError::invalid_proxy(
                        input,
                        format!("unknown option `{}`", other),
                    ))
                }
            }
        }
        Ok(())
    }

    /// Stringified form; [`Reference::parse`] reads it back unchanged.
    pub fn to_proxy_string(&self) -> Result<String> {
        if self.fixed.is_some() {
            return Err(RpcError::FixedProxyRequiresConnection);
        }
        let mut s = quote(&self.identity.to_string());
        if !self.facet.is_empty() {
            let _ = write!(s, " -f {}", quote(&self.facet));
        }
        let _ = write!(s, " {}", self.mode.option());
        if self.secure {
            s.push_str(" -s");
        }
        let _ = write!(s, " -e {}", self.encoding);
        if self.protocol != PROTOCOL_1_0 {
            let _ = write!(s, " -p {}", self.protocol);
        }
        if let Some(adapter_id) = &self.adapter_id {
            let _ = write!(s, " @ {}", quote(adapter_id));
        } else {
            for endpoint in &self.endpoints {
                s.push(':');
                s.push_str(endpoint.as_str());
            }
        }
        Ok(s)
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn facet(&self) -> &str {
        &self.facet
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn adapter_id(&self) -> Option<&str> {
        self.adapter_id.as_deref()
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    pub fn encoding(&self) -> EncodingVersion {
        self.encoding
    }

    pub fn mode(&self) -> InvocationMode {
        self.mode
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn invocation_timeout(&self) -> Option<Duration> {
        self.invocation_timeout
    }

    pub fn collocation_optimized(&self) -> bool {
        self.collocation_optimized
    }

    pub fn endpoint_selection(&self) -> EndpointSelection {
        self.endpoint_selection
    }

    pub fn fixed(&self) -> Option<&Connection> {
        self.fixed.as_ref()
    }

    /// Resolved through the locator rather than from its own endpoints
    pub fn is_indirect(&self) -> bool {
        self.fixed.is_none() && self.endpoints.is_empty()
    }

    pub fn is_well_known(&self) -> bool {
        self.is_indirect() && self.adapter_id.is_none()
    }

    /// Apply this reference's timeout and compression overrides to
    /// endpoints obtained from the locator.
    pub(crate) fn apply_overrides(&self, endpoints: Vec<Endpoint>) -> Vec<Endpoint> {
        endpoints
            .into_iter()
            .map(|endpoint| {
                let endpoint = match self.endpoint_timeout {
                    Some(timeout) => endpoint.with_timeout(timeout),
                    None => endpoint,
                };
                match self.compress {
                    Some(compress) => endpoint.with_compress(compress),
                    None => endpoint,
                }
            })
            .collect()
    }

    // ---- derivations ----

    pub fn with_identity(&self, identity: Identity) -> Self {
        Self {
            identity,
            ..self.clone()
        }
    }

    pub fn with_facet(&self, facet: impl Into<String>) -> Self {
        Self {
            facet: facet.into(),
            ..self.clone()
        }
    }

    pub fn with_context(&self, context: Context) -> Self {
        Self {
            context,
            ..self.clone()
        }
    }

    /// Direct reference over `endpoints`; drops the adapter id.
    pub fn with_endpoints(&self, endpoints: Vec<Endpoint>) -> Self {
        Self {
            endpoints: self.apply_overrides(endpoints),
            adapter_id: None,
            ..self.clone()
        }
    }

    /// Indirect reference through `adapter_id`; drops the endpoints.
    pub fn with_adapter_id(&self, adapter_id: Option<String>) -> Self {
        Self {
            endpoints: Vec::new(),
            adapter_id: adapter_id.filter(|id| !id.is_empty()),
            ..self.clone()
        }
    }

    pub fn with_mode(&self, mode: InvocationMode) -> Self {
        Self {
            mode,
            ..self.clone()
        }
    }

    pub fn with_secure(&self, secure: bool) -> Self {
        Self {
            secure,
            ..self.clone()
        }
    }

    pub fn with_compress(&self, compress: bool) -> Self {
        Self {
            compress: Some(compress),
            endpoints: self
                .endpoints
                .iter()
                .map(|e| e.with_compress(compress))
                .collect(),
            ..self.clone()
        }
    }

    /// Endpoint timeout; `None` is infinite.
    pub fn with_timeout(&self, timeout: Option<Duration>) -> Self {
        Self {
            endpoint_timeout: Some(timeout),
            endpoints: self
                .endpoints
                .iter()
                .map(|e| e.with_timeout(timeout))
                .collect(),
            ..self.clone()
        }
    }

    pub fn with_invocation_timeout(&self, timeout: Option<Duration>) -> Self {
        Self {
            invocation_timeout: timeout,
            ..self.clone()
        }
    }

    pub fn with_encoding(&self, encoding: EncodingVersion) -> Self {
        Self {
            encoding,
            ..self.clone()
        }
    }

    pub fn with_collocation_optimized(&self, collocation_optimized: bool) -> Self {
        Self {
            collocation_optimized,
            ..self.clone()
        }
    }

    pub fn with_endpoint_selection(&self, endpoint_selection: EndpointSelection) -> Self {
        Self {
            endpoint_selection,
            ..self.clone()
        }
    }

    /// Bind to a live connection; `None` unbinds.
    pub fn with_fixed(&self, connection: Option<Connection>) -> Self {
        Self {
            fixed: connection,
            ..self.clone()
        }
    }
}
