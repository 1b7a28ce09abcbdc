//! Error types for the floe wire protocol

use crate::protocol::{EncodingVersion, ProtocolVersion};
use thiserror::Error;

/// Wire-level error types
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("bad magic number: {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("unsupported protocol version: expected {expected}, got {got}")]
    UnsupportedProtocol {
        expected: ProtocolVersion,
        got: ProtocolVersion,
    },

    #[error("unsupported encoding version: expected {expected}, got {got}")]
    UnsupportedEncoding {
        expected: EncodingVersion,
        got: EncodingVersion,
    },

    #[error("invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("invalid reply status: {0}")]
    InvalidReplyStatus(u8),

    #[error("invalid operation mode: {0}")]
    InvalidOperationMode(u8),

    #[error("compressed messages are not supported")]
    CompressionNotSupported,

    #[error("invalid message size: {0}")]
    InvalidMessageSize(i32),

    #[error("message too large: {size} bytes exceeds maximum {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("buffer underflow: need {needed} bytes, {remaining} remaining")]
    BufferUnderflow { needed: usize, remaining: usize },

    #[error("negative size: {0}")]
    NegativeSize(i32),

    #[error("invalid UTF-8 string: {0}")]
    InvalidString(#[from] std::string::FromUtf8Error),

    #[error("invalid encapsulation: {0}")]
    InvalidEncapsulation(String),

    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("{0} trailing bytes after message body")]
    TrailingBytes(usize),

    #[error("unexpected {0} message on datagram transport")]
    UnexpectedDatagram(&'static str),
}

impl ProtocolError {
    /// Returns true when the error came from the transport rather than
    /// from malformed message content.
    pub fn is_transport(&self) -> bool {
        matches!(self, ProtocolError::Io(_) | ProtocolError::ConnectionClosed)
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
