//! floe protocol messages
//!
//! Every message starts with a 14-byte header:
//!
//! ```text
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |  'I'  |  'c'  |  'e'  |  'P'  | proto major/minor | enc major/minor
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! | type  | compr |        message size (i32 LE, incl. header)    |
//! +-------+-------+-------+-------+-------+-------+
//! ```

use crate::error::{ProtocolError, Result};
use crate::identity::Identity;
use crate::stream::{InputStream, OutputStream};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::fmt;

/// Magic number at the start of every message
pub const MAGIC: [u8; 4] = *b"IceP";

/// Header size in bytes
pub const HEADER_SIZE: usize = 14;

/// The only protocol version spoken
pub const PROTOCOL_1_0: ProtocolVersion = ProtocolVersion::new(1, 0);

/// Encoding used for message headers
pub const ENCODING_1_0: EncodingVersion = EncodingVersion::new(1, 0);

/// Default encoding for request and reply payloads
pub const ENCODING_1_1: EncodingVersion = EncodingVersion::new(1, 1);

/// Per-request context
pub type Context = BTreeMap<String, String>;

macro_rules! version_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name {
            pub major: u8,
            pub minor: u8,
        }

        impl $name {
            pub const fn new(major: u8, minor: u8) -> Self {
                Self { major, minor }
            }

            /// Parse `major.minor`
            pub fn parse(s: &str) -> Option<Self> {
                let (major, minor) = s.split_once('.')?;
                Some(Self::new(major.parse().ok()?, minor.parse().ok()?))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}.{}", self.major, self.minor)
            }
        }
    };
}

version_type!(
    /// Protocol version carried in every header
    ProtocolVersion
);
version_type!(
    /// Encoding version of a header or an encapsulation
    EncodingVersion
);

/// Message type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Request = 0,
    BatchRequest = 1,
    Reply = 2,
    ValidateConnection = 3,
    CloseConnection = 4,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(MessageType::Request),
            1 => Some(MessageType::BatchRequest),
            2 => Some(MessageType::Reply),
            3 => Some(MessageType::ValidateConnection),
            4 => Some(MessageType::CloseConnection),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Request => "request",
            MessageType::BatchRequest => "batch request",
            MessageType::Reply => "reply",
            MessageType::ValidateConnection => "validate connection",
            MessageType::CloseConnection => "close connection",
        }
    }
}

/// Compression status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CompressionStatus {
    #[default]
    NotSupported = 0,
    /// Sender accepts compressed replies
    Supported = 1,
    /// Body is compressed
    Compressed = 2,
}

impl CompressionStatus {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(CompressionStatus::NotSupported),
            1 => Some(CompressionStatus::Supported),
            2 => Some(CompressionStatus::Compressed),
            _ => None,
        }
    }
}

/// Message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub message_type: MessageType,
    pub compression: CompressionStatus,
    /// Total message size including the header
    pub size: i32,
}

impl FrameHeader {
    pub const SIZE: usize = HEADER_SIZE;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&MAGIC);
        buf.put_u8(PROTOCOL_1_0.major);
        buf.put_u8(PROTOCOL_1_0.minor);
        buf.put_u8(ENCODING_1_0.major);
        buf.put_u8(ENCODING_1_0.minor);
        buf.put_u8(self.message_type as u8);
        buf.put_u8(self.compression as u8);
        buf.put_i32_le(self.size);
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(ProtocolError::BufferUnderflow {
                needed: Self::SIZE,
                remaining: data.len(),
            });
        }

        let magic = [data[0], data[1], data[2], data[3]];
        if magic != MAGIC {
            return Err(ProtocolError::BadMagic(magic));
        }

        let protocol = ProtocolVersion::new(data[4], data[5]);
        if protocol.major != PROTOCOL_1_0.major {
            return Err(ProtocolError::UnsupportedProtocol {
                expected: PROTOCOL_1_0,
                got: protocol,
            });
        }

        let encoding = EncodingVersion::new(data[6], data[7]);
        if encoding.major != ENCODING_1_0.major {
            return Err(ProtocolError::UnsupportedEncoding {
                expected: ENCODING_1_0,
                got: encoding,
            });
        }

        let message_type =
            MessageType::from_u8(data[8]).ok_or(ProtocolError::InvalidMessageType(data[8]))?;
        let compression = match CompressionStatus::from_u8(data[9]) {
            Some(CompressionStatus::Compressed) | None => {
                return Err(ProtocolError::CompressionNotSupported)
            }
            Some(c) => c,
        };

        let size = i32::from_le_bytes([data[10], data[11], data[12], data[13]]);
        if size < Self::SIZE as i32 {
            return Err(ProtocolError::InvalidMessageSize(size));
        }

        Ok(Self {
            message_type,
            compression,
            size,
        })
    }
}

/// Operation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum OperationMode {
    #[default]
    Normal = 0,
    /// Legacy alias of idempotent
    Nonmutating = 1,
    Idempotent = 2,
}

impl OperationMode {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(OperationMode::Normal),
            1 => Ok(OperationMode::Nonmutating),
            2 => Ok(OperationMode::Idempotent),
            other => Err(ProtocolError::InvalidOperationMode(other)),
        }
    }

    pub fn is_idempotent(&self) -> bool {
        !matches!(self, OperationMode::Normal)
    }
}

/// Encapsulated payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encapsulation {
    pub encoding: EncodingVersion,
    pub data: Bytes,
}

impl Encapsulation {
    /// Size field plus encoding version
    pub const HEADER_SIZE: usize = 6;

    pub fn new(data: Bytes) -> Self {
        Self {
            encoding: ENCODING_1_1,
            data,
        }
    }

    pub fn with_encoding(encoding: EncodingVersion, data: Bytes) -> Self {
        Self { encoding, data }
    }

    pub fn empty() -> Self {
        Self::new(Bytes::new())
    }
}

/// Request message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Zero for oneway and batched requests
    pub request_id: i32,
    pub identity: Identity,
    pub facet: String,
    pub operation: String,
    pub mode: OperationMode,
    pub context: Context,
    pub params: Encapsulation,
}

impl Request {
    pub fn is_oneway(&self) -> bool {
        self.request_id == 0
    }

    fn encode_body(&self, out: &mut OutputStream, with_id: bool) {
        if with_id {
            out.write_i32(self.request_id);
        }
        out.write_identity(&self.identity);
        out.write_facet(&self.facet);
        out.write_string(&self.operation);
        out.write_u8(self.mode as u8);
        out.write_context(&self.context);
        out.write_encapsulation(&self.params);
    }

    fn decode_body(input: &mut InputStream, with_id: bool) -> Result<Self> {
        let request_id = if with_id { input.read_i32()? } else { 0 };
        let identity = input.read_identity()?;
        let facet = input.read_facet()?;
        let operation = input.read_string()?;
        let mode = OperationMode::from_u8(input.read_u8()?)?;
        let context = input.read_context()?;
        let params = input.read_encapsulation()?;
        Ok(Self {
            request_id,
            identity,
            facet,
            operation,
            mode,
            context,
            params,
        })
    }
}

/// Reply status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyStatus {
    Ok = 0,
    UserException = 1,
    ObjectNotExist = 2,
    FacetNotExist = 3,
    OperationNotExist = 4,
    LocalException = 5,
    UnknownUserException = 6,
    UnknownException = 7,
}

impl ReplyStatus {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => ReplyStatus::Ok,
            1 => ReplyStatus::UserException,
            2 => ReplyStatus::ObjectNotExist,
            3 => ReplyStatus::FacetNotExist,
            4 => ReplyStatus::OperationNotExist,
            5 => ReplyStatus::LocalException,
            6 => ReplyStatus::UnknownUserException,
            7 => ReplyStatus::UnknownException,
            other => return Err(ProtocolError::InvalidReplyStatus(other)),
        })
    }
}

/// Kind tag of a `LocalException` reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LocalExceptionKind {
    Unknown = 0,
    ObjectAdapterNotFound = 1,
    ObjectAdapterDeactivated = 2,
}

impl LocalExceptionKind {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => LocalExceptionKind::ObjectAdapterNotFound,
            2 => LocalExceptionKind::ObjectAdapterDeactivated,
            _ => LocalExceptionKind::Unknown,
        }
    }
}

/// Target echoed back in `*NotExist` replies
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestTarget {
    pub identity: Identity,
    pub facet: String,
    pub operation: String,
}

/// Reply outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyBody {
    Ok(Encapsulation),
    UserException(Encapsulation),
    ObjectNotExist(RequestTarget),
    FacetNotExist(RequestTarget),
    OperationNotExist(RequestTarget),
    LocalException {
        kind: LocalExceptionKind,
        message: String,
    },
    UnknownUserException(String),
    UnknownException(String),
}

impl ReplyBody {
    pub fn status(&self) -> ReplyStatus {
        match self {
            ReplyBody::Ok(_) => ReplyStatus::Ok,
            ReplyBody::UserException(_) => ReplyStatus::UserException,
            ReplyBody::ObjectNotExist(_) => ReplyStatus::ObjectNotExist,
            ReplyBody::FacetNotExist(_) => ReplyStatus::FacetNotExist,
            ReplyBody::OperationNotExist(_) => ReplyStatus::OperationNotExist,
            ReplyBody::LocalException { .. } => ReplyStatus::LocalException,
            ReplyBody::UnknownUserException(_) => ReplyStatus::UnknownUserException,
            ReplyBody::UnknownException(_) => ReplyStatus::UnknownException,
        }
    }

    fn encode(&self, out: &mut OutputStream) {
        out.write_u8(self.status() as u8);
        match self {
            ReplyBody::Ok(encaps) | ReplyBody::UserException(encaps) => {
                out.write_encapsulation(encaps)
            }
            ReplyBody::ObjectNotExist(target)
            | ReplyBody::FacetNotExist(target)
            | ReplyBody::OperationNotExist(target) => {
                out.write_identity(&target.identity);
                out.write_facet(&target.facet);
                out.write_string(&target.operation);
            }
            ReplyBody::LocalException { kind, message } => {
                out.write_u8(*kind as u8);
                out.write_string(message);
            }
            ReplyBody::UnknownUserException(message) | ReplyBody::UnknownException(message) => {
                out.write_string(message)
            }
        }
    }

    fn decode(input: &mut InputStream) -> Result<Self> {
        let status = ReplyStatus::from_u8(input.read_u8()?)?;
        let target = |input: &mut InputStream| -> Result<RequestTarget> {
            Ok(RequestTarget {
                identity: input.read_identity()?,
                facet: input.read_facet()?,
                operation: input.read_string()?,
            })
        };
        Ok(match status {
            ReplyStatus::Ok => ReplyBody::Ok(input.read_encapsulation()?),
            ReplyStatus::UserException => ReplyBody::UserException(input.read_encapsulation()?),
            ReplyStatus::ObjectNotExist => ReplyBody::ObjectNotExist(target(input)?),
            ReplyStatus::FacetNotExist => ReplyBody::FacetNotExist(target(input)?),
            ReplyStatus::OperationNotExist => ReplyBody::OperationNotExist(target(input)?),
            ReplyStatus::LocalException => ReplyBody::LocalException {
                kind: LocalExceptionKind::from_u8(input.read_u8()?),
                message: input.read_string()?,
            },
            ReplyStatus::UnknownUserException => {
                ReplyBody::UnknownUserException(input.read_string()?)
            }
            ReplyStatus::UnknownException => ReplyBody::UnknownException(input.read_string()?),
        })
    }
}

/// Reply message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub request_id: i32,
    pub body: ReplyBody,
}

/// Decoded protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    BatchRequest(Vec<Request>),
    Reply(Reply),
    ValidateConnection,
    CloseConnection,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Request(_) => MessageType::Request,
            Message::BatchRequest(_) => MessageType::BatchRequest,
            Message::Reply(_) => MessageType::Reply,
            Message::ValidateConnection => MessageType::ValidateConnection,
            Message::CloseConnection => MessageType::CloseConnection,
        }
    }

    /// Encode a complete frame, header included.
    pub fn encode(&self) -> Bytes {
        self.encode_with(CompressionStatus::NotSupported)
    }

    pub fn encode_with(&self, compression: CompressionStatus) -> Bytes {
        let mut body = OutputStream::new();
        match self {
            Message::Request(req) => req.encode_body(&mut body, true),
            Message::BatchRequest(reqs) => {
                body.write_i32(reqs.len() as i32);
                for req in reqs {
                    req.encode_body(&mut body, false);
                }
            }
            Message::Reply(reply) => {
                body.write_i32(reply.request_id);
                reply.body.encode(&mut body);
            }
            Message::ValidateConnection | Message::CloseConnection => {}
        }
        let body = body.finish();

        let header = FrameHeader {
            message_type: self.message_type(),
            compression,
            size: (HEADER_SIZE + body.len()) as i32,
        };
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
        header.encode(&mut buf);
        buf.put_slice(&body);
        buf.freeze()
    }

    /// Decode a complete frame, header included.
    pub fn decode(frame: Bytes) -> Result<(FrameHeader, Message)> {
        let header = FrameHeader::decode(&frame)?;
        if header.size as usize != frame.len() {
            return Err(ProtocolError::InvalidMessageSize(header.size));
        }

        let mut input = InputStream::new(frame.slice(HEADER_SIZE..));
        let message = match header.message_type {
            MessageType::Request => Message::Request(Request::decode_body(&mut input, true)?),
            MessageType::BatchRequest => {
                let count = input.read_i32()?;
                if count < 0 {
                    return Err(ProtocolError::NegativeSize(count));
                }
                let mut reqs = Vec::with_capacity((count as usize).min(input.remaining()));
                for _ in 0..count {
                    reqs.push(Request::decode_body(&mut input, false)?);
                }
                Message::BatchRequest(reqs)
            }
            MessageType::Reply => {
                let request_id = input.read_i32()?;
                let body = ReplyBody::decode(&mut input)?;
                Message::Reply(Reply { request_id, body })
            }
            MessageType::ValidateConnection => Message::ValidateConnection,
            MessageType::CloseConnection => Message::CloseConnection,
        };
        input.expect_end()?;
        Ok((header, message))
    }
}
