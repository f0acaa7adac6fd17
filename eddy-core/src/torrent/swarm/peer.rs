//! Peer transport abstraction.
//!
//! Workers talk to a `PeerChannel` after the handshake has completed, so the
//! same download loop runs over TCP and over in-memory simulated peers.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;

use crate::torrent::TorrentError;
use crate::torrent::protocol::messages::MAX_FRAME_LENGTH;
use crate::torrent::protocol::{HandshakeCodec, MessageCodec, PeerHandshake, PeerMessage};

/// A handshaken, message-level connection to one peer.
#[async_trait]
pub trait PeerChannel: Send {
    /// Sends one message.
    ///
    /// # Errors
    /// - `TorrentError::PeerConnectionError` - Connection lost
    async fn send(&mut self, message: PeerMessage) -> Result<(), TorrentError>;

    /// Receives the next message. Cancel safe: partial frames stay buffered.
    ///
    /// # Errors
    /// - `TorrentError::PeerConnectionError` - Connection lost
    /// - `TorrentError::ProtocolError` - Malformed frame
    async fn recv(&mut self) -> Result<PeerMessage, TorrentError>;

    /// Remote address.
    fn address(&self) -> SocketAddr;

    /// Whether the remote advertised BEP 10 in its handshake.
    fn supports_extensions(&self) -> bool;
}

/// Opens connections to peers.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Connects and completes the handshake.
    ///
    /// # Errors
    /// - `TorrentError::PeerConnectionError` - Unreachable or timed out
    /// - `TorrentError::ProtocolError` - Handshake for a different torrent
    async fn connect(
        &self,
        address: SocketAddr,
        handshake: &PeerHandshake,
    ) -> Result<Box<dyn PeerChannel>, TorrentError>;
}

/// `PeerChannel` over any byte stream.
pub struct StreamChannel<S> {
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    buffer: BytesMut,
    address: SocketAddr,
    extensions: bool,
}

impl<S> StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Send,
{
    /// Wraps a stream whose handshake already completed.
    pub fn new(stream: S, address: SocketAddr, remote: &PeerHandshake) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader,
            writer,
            buffer: BytesMut::with_capacity(64 * 1024),
            address,
            extensions: remote.supports_extensions(),
        }
    }

    /// Splits one complete frame off the read buffer, if there is one.
    fn take_frame(&mut self) -> Result<Option<PeerMessage>, TorrentError> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }
        let length = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]);
        if length > MAX_FRAME_LENGTH {
            return Err(TorrentError::ProtocolError {
                message: format!("Frame of {length} bytes exceeds limit"),
            });
        }
        if self.buffer.len() < 4 + length as usize {
            return Ok(None);
        }
        self.buffer.advance(4);
        let body = self.buffer.split_to(length as usize).freeze();
        MessageCodec::decode_body(body).map(Some)
    }
}

#[async_trait]
impl<S> PeerChannel for StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send(&mut self, message: PeerMessage) -> Result<(), TorrentError> {
        MessageCodec::write_message(&mut self.writer, &message).await
    }

    async fn recv(&mut self) -> Result<PeerMessage, TorrentError> {
        loop {
            if let Some(message) = self.take_frame()? {
                return Ok(message);
            }
            let read = self.reader.read_buf(&mut self.buffer).await.map_err(|e| {
                TorrentError::PeerConnectionError {
                    reason: format!("Read from {} failed: {e}", self.address),
                }
            })?;
            if read == 0 {
                return Err(TorrentError::PeerConnectionError {
                    reason: format!("{} closed the connection", self.address),
                });
            }
        }
    }

    fn address(&self) -> SocketAddr {
        self.address
    }

    fn supports_extensions(&self) -> bool {
        self.extensions
    }
}

/// Connects to peers over TCP.
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    /// Creates a connector bounding connect plus handshake by `connect_timeout`.
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl PeerConnector for TcpConnector {
    async fn connect(
        &self,
        address: SocketAddr,
        handshake: &PeerHandshake,
    ) -> Result<Box<dyn PeerChannel>, TorrentError> {
        let attempt = async {
            let mut stream = TcpStream::connect(address).await.map_err(|e| {
                TorrentError::PeerConnectionError {
                    reason: format!("Failed to connect to {address}: {e}"),
                }
            })?;
            let _ = stream.set_nodelay(true);
            let remote = HandshakeCodec::exchange(&mut stream, handshake).await?;
            Ok::<_, TorrentError>(StreamChannel::new(stream, address, &remote))
        };

        let channel = tokio::time::timeout(self.connect_timeout, attempt)
            .await
            .map_err(|_| TorrentError::PeerConnectionError {
                reason: format!("Connection to {address} timed out"),
            })??;
        Ok(Box::new(channel))
    }
}
