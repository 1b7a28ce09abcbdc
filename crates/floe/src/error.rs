//! Error types for the floe runtime
//!
//! Every fallible operation reports one [`RpcError`] variant. The variants
//! fall into connection-level, routing, protocol, usage and peer-reported
//! groups; the retry engine classifies them in `invocation.rs`.

use bytes::Bytes;
use floe_proto::{
    Encapsulation, EncodingVersion, Identity, LocalExceptionKind, ProtocolError,
    ProtocolVersion, ReplyBody, RequestTarget,
};
use std::fmt;
use thiserror::Error;

/// Which bound a timeout hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Connection establishment, including validation
    Connect,
    /// A write stalled past the endpoint timeout
    Connection,
    /// Graceful close did not finish in time
    Close,
    /// The invocation deadline expired
    Invocation,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TimeoutKind::Connect => "connect",
            TimeoutKind::Connection => "connection",
            TimeoutKind::Close => "close",
            TimeoutKind::Invocation => "invocation",
        })
    }
}

/// Runtime error types
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    // connection-level
    #[error("connect failed to `{endpoint}`: {reason}")]
    ConnectFailed { endpoint: String, reason: String },

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("connection aborted: {0}")]
    ConnectionAborted(String),

    #[error("{0} timeout")]
    Timeout(TimeoutKind),

    #[error("invocation cancelled")]
    Cancelled,

    // routing
    #[error("object `{identity}` does not exist (facet `{facet}`, operation `{operation}`)")]
    ObjectNotExist {
        identity: Identity,
        facet: String,
        operation: String,
    },

    #[error("facet `{facet}` of object `{identity}` does not exist (operation `{operation}`)")]
    FacetNotExist {
        identity: Identity,
        facet: String,
        operation: String,
    },

    #[error("operation `{operation}` does not exist on object `{identity}` (facet `{facet}`)")]
    OperationNotExist {
        identity: Identity,
        facet: String,
        operation: String,
    },

    #[error("object adapter not found: {0}")]
    ObjectAdapterNotFound(String),

    #[error("object adapter `{0}` is deactivated")]
    ObjectAdapterDeactivated(String),

    // protocol
    #[error("unmarshal error: {0}")]
    Unmarshal(String),

    #[error("protocol version mismatch: expected {expected}, got {got}")]
    ProtocolVersionMismatch {
        expected: ProtocolVersion,
        got: ProtocolVersion,
    },

    #[error("unsupported encoding {0}")]
    EncodingVersionMismatch(EncodingVersion),

    #[error("protocol error: {0}")]
    Protocol(String),

    // usage
    #[error("invalid proxy `{input}`: {reason}")]
    InvalidProxyFormat { input: String, reason: String },

    #[error("invalid endpoint `{input}`: {reason}")]
    InvalidEndpoint { input: String, reason: String },

    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("fixed proxies are bound to a live connection and cannot be stringified or re-resolved")]
    FixedProxyRequiresConnection,

    #[error("no suitable endpoint: {0}")]
    NoEndpoint(String),

    #[error("{kind} `{id}` is already registered")]
    AlreadyRegistered { kind: &'static str, id: String },

    #[error("{kind} `{id}` is not registered")]
    NotRegistered { kind: &'static str, id: String },

    #[error("communicator destroyed")]
    CommunicatorDestroyed,

    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    #[error("security error: {0}")]
    Security(String),

    #[error("twoway invocation over a datagram endpoint")]
    TwowayOverDatagram,

    // peer-reported
    #[error("user exception ({} bytes)", .0.len())]
    User(Bytes),

    #[error("unknown local exception: {0}")]
    UnknownLocal(String),

    #[error("unknown user exception: {0}")]
    UnknownUser(String),

    #[error("unknown exception: {0}")]
    Unknown(String),
}

pub type Result<T> = std::result::Result<T, RpcError>;

impl RpcError {
    pub fn invalid_proxy(input: &str, reason: impl Into<String>) -> Self {
        RpcError::InvalidProxyFormat {
            input: input.to_string(),
            reason: reason.into(),
        }
    }

    pub fn invalid_endpoint(input: &str, reason: impl Into<String>) -> Self {
        RpcError::InvalidEndpoint {
            input: input.to_string(),
            reason: reason.into(),
        }
    }

    pub fn connect_failed(endpoint: impl fmt::Display, reason: impl fmt::Display) -> Self {
        RpcError::ConnectFailed {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Errors raised by the transport or a connection's lifecycle
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            RpcError::ConnectFailed { .. }
                | RpcError::ConnectionLost(_)
                | RpcError::ConnectionClosed
                | RpcError::ConnectionAborted(_)
                | RpcError::Timeout(
                    TimeoutKind::Connect | TimeoutKind::Connection | TimeoutKind::Close
                )
        )
    }

    /// Errors that end a connection for every invocation pending on it
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            RpcError::Unmarshal(_)
                | RpcError::ProtocolVersionMismatch { .. }
                | RpcError::EncodingVersionMismatch(_)
                | RpcError::Protocol(_)
        )
    }

    /// Routing outcomes reported by the peer's adapter
    pub fn is_routing_error(&self) -> bool {
        matches!(
            self,
            RpcError::ObjectNotExist { .. }
                | RpcError::FacetNotExist { .. }
                | RpcError::OperationNotExist { .. }
        )
    }
}

impl From<ProtocolError> for RpcError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Io(io) => RpcError::ConnectionLost(io.to_string()),
            ProtocolError::ConnectionClosed => {
                RpcError::ConnectionLost("peer closed the socket".to_string())
            }
            ProtocolError::UnsupportedProtocol { expected, got } => {
                RpcError::ProtocolVersionMismatch { expected, got }
            }
            ProtocolError::UnsupportedEncoding { got, .. } => {
                RpcError::EncodingVersionMismatch(got)
            }
            ProtocolError::BufferUnderflow { .. }
            | ProtocolError::NegativeSize(_)
            | ProtocolError::InvalidString(_)
            | ProtocolError::InvalidEncapsulation(_)
            | ProtocolError::InvalidIdentity(_)
            | ProtocolError::InvalidOperationMode(_)
            | ProtocolError::InvalidReplyStatus(_)
            | ProtocolError::TrailingBytes(_) => RpcError::Unmarshal(e.to_string()),
            other => RpcError::Protocol(other.to_string()),
        }
    }
}

/// Turn a reply into the caller's result. Networked and collocated
/// invocations both go through here, so they classify errors identically.
pub(crate) fn reply_to_result(body: ReplyBody) -> Result<Bytes> {
    let routing = |t: RequestTarget| (t.identity, t.facet, t.operation);
    match body {
        ReplyBody::Ok(encaps) => Ok(encaps.data),
        ReplyBody::UserException(encaps) => Err(RpcError::User(encaps.data)),
        ReplyBody::ObjectNotExist(t) => {
            let (identity, facet, operation) = routing(t);
            Err(RpcError::ObjectNotExist {
                identity,
                facet,
                operation,
            })
        }
        ReplyBody::FacetNotExist(t) => {
            let (identity, facet, operation) = routing(t);
            Err(RpcError::FacetNotExist {
                identity,
                facet,
                operation,
            })
        }
        ReplyBody::OperationNotExist(t) => {
            let (identity, facet, operation) = routing(t);
            Err(RpcError::OperationNotExist {
                identity,
                facet,
                operation,
            })
        }
        ReplyBody::LocalException { kind, message } => Err(match kind {
            LocalExceptionKind::ObjectAdapterNotFound => RpcError::ObjectAdapterNotFound(message),
            LocalExceptionKind::ObjectAdapterDeactivated => {
                RpcError::ObjectAdapterDeactivated(message)
            }
            LocalExceptionKind::Unknown => RpcError::UnknownLocal(message),
        }),
        ReplyBody::UnknownUserException(message) => Err(RpcError::UnknownUser(message)),
        ReplyBody::UnknownException(message) => Err(RpcError::Unknown(message)),
    }
}

/// Turn a dispatch result into a reply. Routing errors raised by a servant
/// without a target get the request's own target filled in.
pub(crate) fn result_to_reply(
    result: Result<Bytes>,
    target: &RequestTarget,
    encoding: EncodingVersion,
) -> ReplyBody {
    let fill = |identity: Identity, facet: String, operation: String| {
        if identity.is_empty() {
            target.clone()
        } else {
            RequestTarget {
                identity,
                facet,
                operation,
            }
        }
    };
    match result {
        Ok(data) => ReplyBody::Ok(Encapsulation::with_encoding(encoding, data)),
        Err(RpcError::User(data)) => {
            ReplyBody::UserException(Encapsulation::with_encoding(encoding, data))
        }
        Err(RpcError::ObjectNotExist {
            identity,
            facet,
            operation,
        }) => ReplyBody::ObjectNotExist(fill(identity, facet, operation)),
        Err(RpcError::FacetNotExist {
            identity,
            facet,
            operation,
        }) => ReplyBody::FacetNotExist(fill(identity, facet, operation)),
        Err(RpcError::OperationNotExist {
            identity,
            facet,
            operation,
        }) => ReplyBody::OperationNotExist(fill(identity, facet, operation)),
        Err(RpcError::ObjectAdapterNotFound(message)) => ReplyBody::LocalException {
            kind: LocalExceptionKind::ObjectAdapterNotFound,
            message,
        },
        Err(RpcError::ObjectAdapterDeactivated(message)) => ReplyBody::LocalException {
            kind: LocalExceptionKind::ObjectAdapterDeactivated,
            message,
        },
        Err(RpcError::UnknownLocal(message)) => ReplyBody::LocalException {
            kind: LocalExceptionKind::Unknown,
            message,
        },
        Err(RpcError::UnknownUser(message)) => ReplyBody::UnknownUserException(message),
        Err(RpcError::Unknown(message)) => ReplyBody::UnknownException(message),
        Err(other) => ReplyBody::LocalException {
            kind: LocalExceptionKind::Unknown,
            message: other.to_string(),
        },
    }
}
