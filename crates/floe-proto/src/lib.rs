//! Wire protocol for the floe RPC runtime
//!
//! This crate knows nothing about connections, adapters or retries. It
//! provides:
//!
//! - [`Identity`] and its escaped string form
//! - the 14-byte frame header and the request, batch request, reply,
//!   validate connection and close connection messages
//! - little-endian marshalling streams ([`OutputStream`], [`InputStream`])
//! - framed readers/writers for byte streams ([`FrameTransport`]) and
//!   datagram sockets ([`datagram_transport`])
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use floe_proto::{Context, Encapsulation, Identity, Message, OperationMode, Request};
//!
//! let request = Message::Request(Request {
//!     request_id: 1,
//!     identity: Identity::named("test"),
//!     facet: String::new(),
//!     operation: "echo".to_string(),
//!     mode: OperationMode::Normal,
//!     context: Context::new(),
//!     params: Encapsulation::new(Bytes::from_static(b"x")),
//! });
//!
//! let frame = request.encode();
//! let (_, decoded) = Message::decode(frame).unwrap();
//! assert_eq!(decoded, request);
//! ```

pub mod datagram;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod stream;
pub mod transport;

pub use datagram::{datagram_transport, DatagramReader, DatagramWriter, MAX_UDP_PAYLOAD};
pub use error::{ProtocolError, Result};
pub use identity::Identity;
pub use protocol::{
    CompressionStatus, Context, Encapsulation, EncodingVersion, FrameHeader, LocalExceptionKind,
    Message, MessageType, OperationMode, ProtocolVersion, Reply, ReplyBody, ReplyStatus, Request,
    RequestTarget, ENCODING_1_0, ENCODING_1_1, HEADER_SIZE, MAGIC, PROTOCOL_1_0,
};
pub use stream::{InputStream, OutputStream};
pub use transport::{FrameReader, FrameTransport, FrameWriter, DEFAULT_MESSAGE_SIZE_MAX};
