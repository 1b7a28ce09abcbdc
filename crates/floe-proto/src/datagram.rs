//! Datagram transport
//!
//! Each UDP datagram carries exactly one complete message. A datagram
//! that does not hold a whole, well-formed header is dropped by the
//! reader instead of failing the transport.

use crate::error::{ProtocolError, Result};
use crate::protocol::FrameHeader;
use crate::transport::{FrameReader, FrameWriter};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::warn;

/// Maximum theoretical UDP payload size
pub const MAX_UDP_PAYLOAD: usize = 65507;

/// Receiving half of a datagram transport
pub struct DatagramReader {
    socket: Arc<UdpSocket>,
    max_message_size: usize,
    recv_buf: BytesMut,
}

/// Sending half of a datagram transport
pub struct DatagramWriter {
    socket: Arc<UdpSocket>,
    peer: Option<SocketAddr>,
    max_message_size: usize,
}

/// Split a socket into frame reader/writer halves.
///
/// `peer` is the destination for an unconnected socket; `None` means the
/// socket is connected (client side) or receive-only (server side).
pub fn datagram_transport(
    socket: Arc<UdpSocket>,
    peer: Option<SocketAddr>,
    max_message_size: usize,
) -> (DatagramReader, DatagramWriter) {
    let max = max_message_size.min(MAX_UDP_PAYLOAD);
    (
        DatagramReader {
            socket: socket.clone(),
            max_message_size: max,
            recv_buf: BytesMut::with_capacity(max),
        },
        DatagramWriter {
            socket,
            peer,
            max_message_size: max,
        },
    )
}

impl DatagramReader {
    /// Receive one datagram and the sender address
    pub async fn recv_from(&mut self) -> Result<(Bytes, SocketAddr)> {
        self.recv_buf.clear();
        self.recv_buf.resize(self.max_message_size, 0);
        let (len, addr) = self.socket.recv_from(&mut self.recv_buf).await?;
        self.recv_buf.truncate(len);
        Ok((self.recv_buf.split().freeze(), addr))
    }
}

#[async_trait]
impl FrameReader for DatagramReader {
    async fn read_frame(&mut self) -> Result<Bytes> {
        loop {
            let (data, from) = self.recv_from().await?;
            match FrameHeader::decode(&data) {
                Ok(header) if header.size as usize == data.len() => return Ok(data),
                Ok(header) => warn!(
                    target: "floe::protocol",
                    %from,
                    expected = header.size,
                    got = data.len(),
                    "dropping datagram with mismatched size"
                ),
                Err(e) => warn!(target: "floe::protocol", %from, error = %e, "dropping malformed datagram"),
            }
        }
    }
}

#[async_trait]
impl FrameWriter for DatagramWriter {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        if frame.len() > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: frame.len(),
                max: self.max_message_size,
            });
        }
        match self.peer {
            Some(addr) => self.socket.send_to(frame, addr).await?,
            None => self.socket.send(frame).await?,
        };
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}
