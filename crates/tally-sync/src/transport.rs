// SPDX-License-Identifier: Apache-2.0
//! The streaming channel port and its framed-TCP implementation.
//!
//! The session logic is generic over [`Connect`]/[`Transport`] so tests can
//! drive it with in-memory channels and deterministic time.

use std::future::Future;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use tally_proto::wire::{encode_frame, try_decode_frame, FrameError};
use tally_proto::{ClientFrame, ServerFrame};

/// Streaming channel failures.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Socket failure.
    #[error("channel io: {0}")]
    Io(#[from] std::io::Error),
    /// Framing/codec failure.
    #[error("channel codec: {0}")]
    Frame(#[from] FrameError),
    /// The peer closed the channel.
    #[error("channel closed")]
    Closed,
}

/// One open duplex streaming channel.
pub trait Transport: Send + 'static {
    /// Send one frame.
    fn send(
        &mut self,
        frame: ClientFrame,
    ) -> impl Future<Output = Result<(), ChannelError>> + Send;

    /// Receive the next frame; `Err(Closed)` when the peer hung up.
    fn recv(&mut self) -> impl Future<Output = Result<ServerFrame, ChannelError>> + Send;
}

/// Factory for transports; called again on every reconnect.
pub trait Connect: Send + Sync + 'static {
    /// The transport this connector produces.
    type Transport: Transport;

    /// Open a fresh channel.
    fn connect(&self) -> impl Future<Output = Result<Self::Transport, ChannelError>> + Send;
}

/// Framed JSON over TCP (length-prefixed, as the server's session listener
/// speaks).
pub struct TcpTransport {
    stream: TcpStream,
    acc: Vec<u8>,
    buf: Vec<u8>,
}

impl Transport for TcpTransport {
    async fn send(&mut self, frame: ClientFrame) -> Result<(), ChannelError> {
        let bytes = encode_frame(&frame)?;
        self.stream.write_all(&bytes).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<ServerFrame, ChannelError> {
        loop {
            if let Some(frame) = try_decode_frame::<ServerFrame>(&mut self.acc)? {
                return Ok(frame);
            }
            let n = self.stream.read(&mut self.buf).await?;
            if n == 0 {
                return Err(ChannelError::Closed);
            }
            let read = &self.buf[..n];
            self.acc.extend_from_slice(read);
        }
    }
}

/// Connects to the server's streaming session listener.
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    /// Connector for `addr` (`host:port`).
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

impl Connect for TcpConnector {
    type Transport = TcpTransport;

    async fn connect(&self) -> Result<TcpTransport, ChannelError> {
        let stream = TcpStream::connect(&self.addr).await?;
        Ok(TcpTransport {
            stream,
            acc: Vec::with_capacity(32 * 1024),
            buf: vec![0u8; 16 * 1024],
        })
    }
}
