//! Framed stream transport
//!
//! Stream transports carry self-delimiting messages: the header's size
//! field tells the reader how many bytes make up the frame.

use crate::error::{ProtocolError, Result};
use crate::protocol::FrameHeader;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default maximum message size (1 MiB)
pub const DEFAULT_MESSAGE_SIZE_MAX: usize = 1024 * 1024;

/// Reads whole frames from a transport
#[async_trait]
pub trait FrameReader: Send {
    /// Read one complete frame, header included.
    async fn read_frame(&mut self) -> Result<Bytes>;
}

/// Writes whole frames to a transport
#[async_trait]
pub trait FrameWriter: Send {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<()>;

    /// Flush and half-close the write side.
    async fn shutdown(&mut self) -> Result<()>;
}

/// Frame reader/writer over any byte stream
pub struct FrameTransport<T> {
    inner: T,
    max_message_size: usize,
    read_buf: BytesMut,
}

impl<T> FrameTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            max_message_size: DEFAULT_MESSAGE_SIZE_MAX,
            read_buf: BytesMut::with_capacity(8192),
        }
    }

    pub fn with_max_message_size(mut self, max_size: usize) -> Self {
        self.max_message_size = max_size;
        self
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }
}

impl<T: AsyncRead + Unpin> FrameTransport<T> {
    /// Read a complete frame
    pub async fn read_message(&mut self) -> Result<Bytes> {
        while self.read_buf.len() < FrameHeader::SIZE {
            if self.fill_buf().await? == 0 {
                if self.read_buf.is_empty() {
                    return Err(ProtocolError::ConnectionClosed);
                }
                return Err(ProtocolError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "incomplete message header",
                )));
            }
        }

        let header = FrameHeader::decode(&self.read_buf)?;
        let size = header.size as usize;
        if size > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size,
                max: self.max_message_size,
            });
        }

        while self.read_buf.len() < size {
            if self.fill_buf().await? == 0 {
                return Err(ProtocolError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!(
                        "incomplete message: expected {} bytes, got {}",
                        size,
                        self.read_buf.len()
                    ),
                )));
            }
        }

        Ok(self.read_buf.split_to(size).freeze())
    }

    async fn fill_buf(&mut self) -> Result<usize> {
        if self.read_buf.capacity() - self.read_buf.len() < 4096 {
            self.read_buf.reserve(8192);
        }
        Ok(self.inner.read_buf(&mut self.read_buf).await?)
    }
}

impl<T: AsyncWrite + Unpin> FrameTransport<T> {
    /// Write a complete, already encoded frame
    pub async fn write_message(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: data.len(),
                max: self.max_message_size,
            });
        }
        self.inner.write_all(data).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl<T: AsyncRead + Unpin + Send> FrameReader for FrameTransport<T> {
    async fn read_frame(&mut self) -> Result<Bytes> {
        self.read_message().await
    }
}

#[async_trait]
impl<T: AsyncWrite + Unpin + Send> FrameWriter for FrameTransport<T> {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.write_message(frame).await
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
